mod test_harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::{Map, Value};

use taskmaster::error::Result;
use taskmaster::worker::registry::{JobContext, JobHandler, JobRegistry};
use test_harness::{assert_eventually, test_config, wait_for, TestOrchestrator};

/// Counts how often it ran
#[derive(Clone, Default)]
struct Tick(Arc<AtomicUsize>);

impl Tick {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for Tick {
    async fn run(&self, _ctx: &JobContext, _options: Option<&Map<String, Value>>) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry_with(tick: &Tick) -> JobRegistry {
    let mut registry = JobRegistry::with_builtins();
    registry.register("clock", "tick", tick.clone());
    registry
}

/// Rewrite a file and push its mtime forward so the change is always seen
fn rewrite(path: &std::path::Path, contents: &str, bump: Duration) {
    std::fs::write(path, contents).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + bump).unwrap();
}

const EVERY_SECOND: &str = r#"[
    {"type": "server", "cron": "* * * * * *", "job": "clock.tick", "id": "tick"}
]"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_entry_fires_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let crontab = dir.path().join("crontab.json");
    std::fs::write(&crontab, EVERY_SECOND).unwrap();

    let tick = Tick::default();
    let config = test_config(1).with_crontab(&crontab);
    let orch = TestOrchestrator::start_with(config, registry_with(&tick), None).await;

    assert_eventually(
        || async { tick.count() >= 2 },
        Duration::from_secs(5),
        "cron entry fired repeatedly",
    )
    .await;
    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.cron_entries, 1);
    assert!(snapshot.workers.is_empty());

    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_reload_keeps_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let crontab = dir.path().join("crontab.json");
    std::fs::write(&crontab, EVERY_SECOND).unwrap();

    let tick = Tick::default();
    let config = test_config(1).with_crontab(&crontab);
    let orch = TestOrchestrator::start_with(config, registry_with(&tick), None).await;

    assert_eventually(
        || async { tick.count() >= 1 },
        Duration::from_secs(5),
        "cron entry fired before reload",
    )
    .await;

    rewrite(&crontab, "[{\"type\": \"server\", \"cron\": ", Duration::from_secs(10));
    assert!(orch.handle.reload_crontab().await.is_err());
    assert_eq!(orch.snapshot().await.cron_entries, 1);

    // Triggers keep firing after the failed reload
    let before = tick.count();
    assert_eventually(
        || async { tick.count() >= before + 2 },
        Duration::from_secs(5),
        "cron entry still firing after malformed reload",
    )
    .await;

    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_file_replaces_table() {
    let dir = tempfile::tempdir().unwrap();
    let crontab = dir.path().join("crontab.json");
    std::fs::write(&crontab, "[]").unwrap();

    let tick = Tick::default();
    let config = test_config(1).with_crontab(&crontab);
    let orch = TestOrchestrator::start_with(config, registry_with(&tick), None).await;
    assert_eq!(orch.snapshot().await.cron_entries, 0);

    // Yearly schedule, so only run_cronjob fires it
    rewrite(
        &crontab,
        r#"[{"type": "server", "cron": "0 0 0 1 1 *", "job": "clock.tick", "id": "yearly"},
            {"type": "server", "cron": "0 0 0 1 1 *", "job": "clock.tick", "disabled": true}]"#,
        Duration::from_secs(10),
    );
    assert!(
        wait_for(
            || async { orch.snapshot().await.cron_entries == 1 },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await,
        "watcher should pick up the new crontab"
    );

    assert_eq!(orch.handle.run_cronjob("yearly").await.unwrap(), 1);
    assert_eq!(orch.handle.run_cronjob("missing").await.unwrap(), 0);
    assert_eventually(
        || async { tick.count() == 1 },
        Duration::from_secs(5),
        "run_cronjob fired the entry",
    )
    .await;

    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disallowed_jobs_are_not_scheduled() {
    let dir = tempfile::tempdir().unwrap();
    let crontab = dir.path().join("crontab.json");
    std::fs::write(&crontab, EVERY_SECOND).unwrap();

    let tick = Tick::default();
    let mut config = test_config(1).with_crontab(&crontab);
    config.jobs_disallow = Some("^server\\.clock\\.".to_string());
    let orch = TestOrchestrator::start_with(config, registry_with(&tick), None).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(tick.count(), 0);
    assert_eq!(orch.snapshot().await.cron_entries, 0);

    orch.stop().await;
}
