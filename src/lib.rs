pub mod config;
pub mod cron;
pub mod error;
pub mod ipc;
pub mod monitor;
pub mod orchestrator;
pub mod remote;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
