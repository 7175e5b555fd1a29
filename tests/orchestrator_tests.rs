mod test_harness;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};

use taskmaster::cron::JobKind;
use taskmaster::error::Result;
use taskmaster::remote::InstanceProvisioner;
use taskmaster::scheduler::{Admission, Deferral, JobDescriptor};
use taskmaster::worker::registry::JobRegistry;
use test_harness::{assert_eventually, test_config, TestOrchestrator};

fn sleep_job(ms: u64) -> JobDescriptor {
    JobDescriptor::new().with("server.sleep", json!({ "timeout": ms }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_job_is_not_run_twice_concurrently() {
    let orch = TestOrchestrator::start(test_config(1)).await;

    let first = orch.handle.submit(sleep_job(300)).await.unwrap();
    let second = orch.handle.submit(sleep_job(300)).await.unwrap();
    assert!(first.is_admitted());
    assert!(second.is_queued());

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.running, vec!["server.sleep".to_string()]);
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.queued.len(), 1);

    // Second copy starts after the first worker exits
    assert_eventually(
        || async {
            let s = orch.snapshot().await;
            s.queued.is_empty() && s.workers.len() == 1
        },
        Duration::from_secs(10),
        "queued copy admitted after first exit",
    )
    .await;
    assert!(orch.wait_idle(Duration::from_secs(10)).await);

    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_already_running_with_free_slot_is_queued() {
    let orch = TestOrchestrator::start(test_config(2)).await;

    assert!(orch.handle.submit(sleep_job(300)).await.unwrap().is_admitted());
    let second = orch.handle.submit(sleep_job(300)).await.unwrap();
    assert!(matches!(
        second,
        Admission::Queued(Deferral::AlreadyRunning(ref name)) if name == "server.sleep"
    ));

    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runlast_waits_for_running_jobs() {
    let orch = TestOrchestrator::start(test_config(2)).await;

    assert!(orch.handle.submit(sleep_job(400)).await.unwrap().is_admitted());
    let last = JobDescriptor::new().with("server.status", json!({ "runlast": true }));
    assert!(orch.handle.submit(last).await.unwrap().is_queued());

    let snapshot = orch.snapshot().await;
    assert!(!snapshot.running.contains(&"server.status".to_string()));

    assert_eventually(
        || async {
            let s = orch.snapshot().await;
            s.queued.is_empty() && !s.running.contains(&"server.sleep".to_string())
        },
        Duration::from_secs(10),
        "runlast job drained after sleep finished",
    )
    .await;
    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runafter_is_not_dispatched_before_dependency_exits() {
    let orch = TestOrchestrator::start(test_config(2)).await;

    assert!(orch.handle.submit(sleep_job(400)).await.unwrap().is_admitted());
    let after = JobDescriptor::new().with("server.status", json!({ "runafter": "^server\\.sleep$" }));
    assert!(orch.handle.submit(after).await.unwrap().is_queued());

    // A free slot exists, yet the dependent job stays queued
    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.free_slots, 1);
    assert_eq!(snapshot.workers.len(), 1);

    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_skipqueue_drops_at_capacity() {
    let orch = TestOrchestrator::start(test_config(1)).await;

    assert!(orch.handle.submit(sleep_job(300)).await.unwrap().is_admitted());
    let dropped = JobDescriptor::new().with("server.status", json!({ "skipqueue": true }));
    assert!(orch.handle.submit(dropped).await.unwrap().is_rejected());
    assert!(orch.snapshot().await.queued.is_empty());

    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_job_worker_exits_and_releases_name() {
    let orch = TestOrchestrator::start(test_config(1)).await;

    let job = JobDescriptor::single("unknown.method");
    assert!(orch.handle.submit(job).await.unwrap().is_admitted());

    assert_eventually(
        || async {
            let s = orch.snapshot().await;
            s.running.is_empty() && s.workers.is_empty()
        },
        Duration::from_secs(10),
        "crashed worker's job released",
    )
    .await;

    // Abnormal exit throttles respawns for the crash interval
    let s = orch.snapshot().await;
    assert!(s.throttled_for.map(|d| d <= Duration::from_millis(50)).unwrap_or(true));

    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crash_loop_throttles_pool_and_holds_queue() {
    let mut config = test_config(3);
    config.crash.interval_ms = 300;
    config.crash.count = 2;
    config.crash.delay_ms = 2000;
    let orch = TestOrchestrator::start(config).await;

    // Three workers that each exit non-zero right after ready
    for name in ["unknown.one", "unknown.two", "unknown.three"] {
        let job = JobDescriptor::single(name);
        assert!(orch.handle.submit(job).await.unwrap().is_admitted());
    }

    assert_eventually(
        || async {
            let s = orch.snapshot().await;
            s.workers.is_empty()
                && s.throttled_for.map_or(false, |d| d > Duration::from_millis(1000))
        },
        Duration::from_secs(10),
        "third crash inside the window applies the crash delay",
    )
    .await;
    assert_eq!(orch.snapshot().await.free_slots, 0);

    let held = orch.handle.submit(sleep_job(50)).await.unwrap();
    assert!(matches!(held, Admission::Queued(Deferral::AtCapacity)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let s = orch.snapshot().await;
    assert_eq!(s.queued.len(), 1);
    assert!(s.workers.is_empty());
    assert!(s.running.is_empty());

    // Runs once the throttle expires
    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_job_admits_on_drain() {
    let orch = TestOrchestrator::start(test_config(1)).await;

    assert!(orch.handle.queue_job(sleep_job(100)).await.unwrap());
    assert!(orch.handle.queue_job(sleep_job(100)).await.unwrap());

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.queued.len(), 1);

    assert!(orch.wait_idle(Duration::from_secs(10)).await);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_shutdown_job_stops_master() {
    let mut orch = TestOrchestrator::start(test_config(2)).await;

    let shutdown = JobDescriptor::new().with("server.shutdown", json!({ "runlast": true }));
    assert!(orch.handle.queue_job(shutdown).await.unwrap());

    assert!(
        orch.wait_stopped(Duration::from_secs(10)).await,
        "master should stop after server.shutdown"
    );
    assert!(orch.handle.is_shutting_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_jobs_run_without_workers() {
    let orch = TestOrchestrator::start_with(test_config(1), JobRegistry::with_builtins(), None).await;

    orch.handle
        .run_job(JobKind::Server, sleep_job(200), Map::new())
        .await
        .unwrap();

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.running, vec!["server.sleep".to_string()]);
    assert!(snapshot.workers.is_empty());

    assert!(orch.wait_idle(Duration::from_secs(5)).await);
    orch.stop().await;
}

/// Records every provisioning request
#[derive(Default)]
struct RecordingProvisioner {
    launches: Mutex<Vec<(u32, String)>>,
}

#[async_trait]
impl InstanceProvisioner for RecordingProvisioner {
    async fn launch_instance(&self, count: u32, command_line: &str) -> Result<String> {
        let mut launches = self.launches.lock().unwrap();
        launches.push((count, command_line.to_string()));
        Ok(format!("i-{}", launches.len()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_jobs_are_launched_not_run() {
    let provisioner = Arc::new(RecordingProvisioner::default());
    let launcher: Arc<dyn InstanceProvisioner> = provisioner.clone();
    let orch =
        TestOrchestrator::start_with(test_config(1), JobRegistry::with_builtins(), Some(launcher))
            .await;

    let mut args = Map::new();
    args.insert("--max-workers".into(), json!(4));
    orch.handle
        .run_job(JobKind::Remote, JobDescriptor::single("scraper.run"), args)
        .await
        .unwrap();

    let p = provisioner.clone();
    assert_eventually(
        || {
            let p = p.clone();
            async move { p.launches.lock().unwrap().len() == 1 }
        },
        Duration::from_secs(5),
        "remote launch requested",
    )
    .await;

    let launches = provisioner.launches.lock().unwrap().clone();
    let (count, line) = &launches[0];
    assert_eq!(*count, 1);
    assert!(line.starts_with("master --instance --jobname scraper.run --job "));
    assert!(line.ends_with("--max-workers 4"));
    assert_eq!(line.matches("--job ").count(), 2);

    assert!(orch.snapshot().await.is_idle());
    orch.stop().await;
}
