//! Shared harness for the core integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use hotfolder_core::format::FormatRegistry;
use hotfolder_core::platform::PlatformRegistry;
use hotfolder_core::testing::MockPlatform;
use hotfolder_core::{
    build_transition_table, MachineConfig, PackageState, PackageStateMachine, PackageStore,
    PipelineConfig, PipelineContext, PublishScheduler, SchedulerConfig, SchedulerEvent,
    SqlitePackageStore,
};

/// A full publishing stack over a directory: `hot/`, `work/` and a sqlite
/// database, with a mock platform registered as `vod`.
pub struct Stack {
    pub hot: PathBuf,
    pub work: PathBuf,
    pub store: Arc<SqlitePackageStore>,
    pub platform: Arc<MockPlatform>,
    pub scheduler: PublishScheduler,
}

impl Stack {
    pub fn new(root: &Path, platform: Arc<MockPlatform>, max_concurrent: usize) -> Self {
        Self::build(root, platform, max_concurrent, true)
    }

    /// Like [`Stack::new`], but published sources stay in the hot folder.
    pub fn keeping_sources(root: &Path, platform: Arc<MockPlatform>, max_concurrent: usize) -> Self {
        Self::build(root, platform, max_concurrent, false)
    }

    fn build(
        root: &Path,
        platform: Arc<MockPlatform>,
        max_concurrent: usize,
        remove_original: bool,
    ) -> Self {
        let hot = root.join("hot");
        let work = root.join("work");
        std::fs::create_dir_all(&hot).expect("Failed to create hot folder");

        let store = Arc::new(
            SqlitePackageStore::new(&root.join("packages.db")).expect("Failed to open store"),
        );

        let mut platforms = PlatformRegistry::new();
        platforms.register("vod", platform.clone());
        let platforms = Arc::new(platforms);

        let pipeline = PipelineConfig {
            work_dir: work.clone(),
            remove_original,
            readiness_poll_interval_ms: 10,
            ..Default::default()
        };
        let ctx = Arc::new(PipelineContext::new(
            pipeline,
            Arc::new(FormatRegistry::with_defaults()),
            platforms.clone(),
        ));
        let table = build_transition_table(ctx).expect("Invalid transition table");
        let machine = Arc::new(PackageStateMachine::new(
            table,
            store.clone(),
            MachineConfig::default(),
        ));

        let scheduler = PublishScheduler::new(
            SchedulerConfig {
                max_concurrent,
                ..Default::default()
            },
            machine,
            platforms,
        );

        Self {
            hot,
            work,
            store,
            platform,
            scheduler,
        }
    }
}

/// Poll the store until the package reaches `expected`.
pub async fn wait_for_state(
    store: &dyn PackageStore,
    package_id: &str,
    expected: PackageState,
    timeout: Duration,
) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        if let Ok(Some(package)) = store.get(package_id) {
            if package.state == expected {
                return true;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Next scheduler event, failing the test after five seconds.
pub async fn next_event(events: &mut broadcast::Receiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for scheduler event")
        .expect("Scheduler event channel closed")
}

/// Skip events until one that finishes a package (completed, failed, parked).
pub async fn next_finished(events: &mut broadcast::Receiver<SchedulerEvent>) -> SchedulerEvent {
    loop {
        let event = next_event(events).await;
        if matches!(
            event,
            SchedulerEvent::Completed(_) | SchedulerEvent::Failed { .. } | SchedulerEvent::Parked(_)
        ) {
            return event;
        }
    }
}
