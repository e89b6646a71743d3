//! Runs a package through the transition table.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::package::{ErrorCode, PackageDescriptor, PackageError, PackageState, PackageStore};

use super::config::MachineConfig;
use super::table::{Next, StepOutcome, TransitionTable};

/// How a machine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineOutcome {
    /// The table's final transition succeeded.
    Completed,
    /// A step parked the package in this state.
    Parked(PackageState),
    /// A step or the store failed. The package is in `error`.
    Failed { code: ErrorCode, message: String },
}

impl MachineOutcome {
    fn label(&self) -> &'static str {
        match self {
            MachineOutcome::Completed => "completed",
            MachineOutcome::Parked(_) => "parked",
            MachineOutcome::Failed { .. } => "failed",
        }
    }
}

/// Final descriptor together with the outcome.
#[derive(Debug, Clone)]
pub struct MachineRun {
    pub package: PackageDescriptor,
    pub outcome: MachineOutcome,
}

/// Drives one package at a time from its checkpoint until it completes,
/// parks or fails.
///
/// The descriptor is saved after every successful step, before the next one
/// starts, so a crash resumes at the last completed checkpoint.
pub struct PackageStateMachine {
    table: Arc<TransitionTable>,
    store: Arc<dyn PackageStore>,
    config: MachineConfig,
}

impl PackageStateMachine {
    pub fn new(table: TransitionTable, store: Arc<dyn PackageStore>, config: MachineConfig) -> Self {
        Self {
            table: Arc::new(table),
            store,
            config,
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    /// Runs the package from its persisted checkpoint. Never fails: errors
    /// are recorded on the descriptor and reported in the outcome.
    pub async fn run(&self, mut package: PackageDescriptor) -> MachineRun {
        let mut checkpoint = package.checkpoint;

        if package.state != checkpoint.state {
            package.state = checkpoint.state;
            if let Err(e) = self.persist(&mut package) {
                return self.fail(package, ErrorCode::Storage, e.to_string());
            }
        }

        loop {
            let step = match self.table.step(checkpoint) {
                Ok(step) => step,
                Err(e) => return self.fail(package, ErrorCode::InvalidCheckpoint, e.to_string()),
            };

            debug!(
                package_id = %package.id,
                transition = %checkpoint.transition,
                state = %package.state,
                "Running transition"
            );

            let started = Instant::now();
            let result = step.execute(&mut package).await;
            let elapsed = started.elapsed().as_secs_f64();

            let label = match &result {
                Ok(StepOutcome::Advance) => "advance",
                Ok(StepOutcome::Reschedule(_)) => "reschedule",
                Ok(StepOutcome::Park(_)) => "park",
                Err(_) => "error",
            };
            metrics::TRANSITION_DURATION
                .with_label_values(&[checkpoint.transition.as_str(), label])
                .observe(elapsed);

            match result {
                Ok(StepOutcome::Advance) => {
                    let next = match self.table.successor(checkpoint) {
                        Ok(next) => next,
                        Err(e) => {
                            return self.fail(package, ErrorCode::InvalidCheckpoint, e.to_string())
                        }
                    };

                    package.reschedules = 0;
                    match next {
                        Next::Continue(next) => {
                            package.state = next.state;
                            package.checkpoint = next;
                            if let Err(e) = self.persist(&mut package) {
                                return self.fail(package, ErrorCode::Storage, e.to_string());
                            }
                            info!(
                                package_id = %package.id,
                                transition = %checkpoint.transition,
                                state = %next.state,
                                "Transition completed"
                            );
                            checkpoint = next;
                        }
                        Next::Done(state) => {
                            package.state = state;
                            if let Err(e) = self.persist(&mut package) {
                                return self.fail(package, ErrorCode::Storage, e.to_string());
                            }
                            info!(
                                package_id = %package.id,
                                state = %state,
                                "Package completed"
                            );
                            return self.finish(package, MachineOutcome::Completed);
                        }
                    }
                }
                Ok(StepOutcome::Reschedule(delay)) => {
                    package.reschedules += 1;
                    if package.reschedules > self.config.max_reschedules {
                        let message = format!(
                            "transition {} rescheduled {} times without completing",
                            checkpoint.transition, self.config.max_reschedules
                        );
                        return self.fail(package, ErrorCode::MediaNotReady, message);
                    }
                    if let Err(e) = self.persist(&mut package) {
                        return self.fail(package, ErrorCode::Storage, e.to_string());
                    }
                    debug!(
                        package_id = %package.id,
                        transition = %checkpoint.transition,
                        attempt = package.reschedules,
                        delay_ms = delay.as_millis() as u64,
                        "Transition rescheduled"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(StepOutcome::Park(state)) => {
                    package.state = state;
                    if let Err(e) = self.persist(&mut package) {
                        return self.fail(package, ErrorCode::Storage, e.to_string());
                    }
                    info!(
                        package_id = %package.id,
                        state = %state,
                        checkpoint = %checkpoint,
                        "Package parked"
                    );
                    return self.finish(package, MachineOutcome::Parked(state));
                }
                Err(e) => {
                    warn!(
                        package_id = %package.id,
                        transition = %checkpoint.transition,
                        error = %e,
                        "Transition failed"
                    );
                    return self.fail(package, e.code, e.message);
                }
            }
        }
    }

    /// Record a run that ended without an outcome, as when a step panics.
    ///
    /// The package fails at its last persisted checkpoint.
    pub fn abandon(&self, package: PackageDescriptor, message: String) -> MachineRun {
        let latest = match self.store.get(&package.id) {
            Ok(Some(latest)) => latest,
            _ => package,
        };
        self.fail(latest, ErrorCode::Internal, message)
    }

    fn persist(&self, package: &mut PackageDescriptor) -> Result<(), PackageError> {
        package.updated_at = Utc::now();
        self.store.save(package)
    }

    fn fail(&self, mut package: PackageDescriptor, code: ErrorCode, message: String) -> MachineRun {
        package.state = PackageState::Error;
        package.error_code = Some(code);
        package.error_message = Some(message.clone());

        if let Err(e) = self.persist(&mut package) {
            error!(
                package_id = %package.id,
                error = %e,
                "Failed to record package error"
            );
        }

        self.finish(package, MachineOutcome::Failed { code, message })
    }

    fn finish(&self, package: PackageDescriptor, outcome: MachineOutcome) -> MachineRun {
        metrics::PACKAGES_FINISHED
            .with_label_values(&[outcome.label()])
            .inc();
        MachineRun { package, outcome }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::machine::{Step, StepError};
    use crate::package::{Checkpoint, PackageType, SqlitePackageStore, Transition};

    /// Advances, recording how often it ran.
    struct Counting(Arc<AtomicU32>);

    #[async_trait]
    impl Step for Counting {
        async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            package.media_ids.push(format!("m{}", self.0.load(Ordering::SeqCst)));
            Ok(StepOutcome::Advance)
        }
    }

    struct Failing;

    #[async_trait]
    impl Step for Failing {
        async fn execute(&self, _package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
            Err(StepError::new(ErrorCode::UploadFailed, "platform unreachable"))
        }
    }

    struct Parking;

    #[async_trait]
    impl Step for Parking {
        async fn execute(&self, _package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Park(PackageState::WaitingForUpload))
        }
    }

    /// Reschedules until it ran `ready_after` times.
    struct Polling {
        calls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl Step for Polling {
        async fn execute(&self, _package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(StepOutcome::Advance)
            } else {
                Ok(StepOutcome::Reschedule(Duration::from_millis(1)))
            }
        }
    }

    fn cp(state: PackageState, transition: Transition) -> Checkpoint {
        Checkpoint::new(state, transition)
    }

    fn two_step_table(first: Arc<dyn Step>, second: Arc<dyn Step>) -> TransitionTable {
        TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                first,
                Next::Continue(cp(PackageState::Copied, Transition::Upload)),
            )
            .on(
                PackageState::Copied,
                Transition::Upload,
                second,
                Next::Done(PackageState::Published),
            )
            .build()
            .unwrap()
    }

    fn new_package(store: &SqlitePackageStore) -> PackageDescriptor {
        let package = PackageDescriptor::new(
            PathBuf::from("/hot/a.zip"),
            PackageType::new("zip"),
            cp(PackageState::Pending, Transition::Copy),
        );
        store.create(&package).unwrap();
        package
    }

    #[tokio::test]
    async fn test_run_to_completion_persists_each_step() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let table = two_step_table(
            Arc::new(Counting(counter.clone())),
            Arc::new(Counting(counter.clone())),
        );
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let package = new_package(&store);
        let run = machine.run(package.clone()).await;

        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let stored = store.get(&package.id).unwrap().unwrap();
        assert_eq!(stored.state, PackageState::Published);
        assert_eq!(stored.media_ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_checkpoint() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let table = two_step_table(Arc::new(Counting(counter.clone())), Arc::new(Failing));
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let package = new_package(&store);
        let run = machine.run(package.clone()).await;

        assert_eq!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::UploadFailed,
                message: "platform unreachable".to_string(),
            }
        );

        let stored = store.get(&package.id).unwrap().unwrap();
        assert_eq!(stored.state, PackageState::Error);
        assert_eq!(stored.error_code, Some(ErrorCode::UploadFailed));
        assert_eq!(
            stored.checkpoint,
            cp(PackageState::Copied, Transition::Upload)
        );
    }

    #[tokio::test]
    async fn test_abandon_fails_at_persisted_checkpoint() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let table = two_step_table(Arc::new(Parking), Arc::new(Parking));
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let stale = new_package(&store);
        let mut latest = stale.clone();
        latest.state = PackageState::Copied;
        latest.checkpoint = cp(PackageState::Copied, Transition::Upload);
        store.save(&latest).unwrap();

        let run = machine.abandon(stale, "step panicked".to_string());

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed { code: ErrorCode::Internal, .. }
        ));
        let stored = store.get(&latest.id).unwrap().unwrap();
        assert_eq!(stored.state, PackageState::Error);
        assert_eq!(stored.error_code, Some(ErrorCode::Internal));
        assert_eq!(stored.checkpoint, cp(PackageState::Copied, Transition::Upload));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let table = two_step_table(
            Arc::new(Counting(first.clone())),
            Arc::new(Counting(second.clone())),
        );
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let mut package = new_package(&store);
        package.state = PackageState::Pending;
        package.checkpoint = cp(PackageState::Copied, Transition::Upload);
        store.save(&package).unwrap();

        let run = machine.run(package).await;

        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_park_keeps_checkpoint() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let table = two_step_table(Arc::new(Counting(counter)), Arc::new(Parking));
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let package = new_package(&store);
        let run = machine.run(package.clone()).await;

        assert_eq!(
            run.outcome,
            MachineOutcome::Parked(PackageState::WaitingForUpload)
        );
        let stored = store.get(&package.id).unwrap().unwrap();
        assert_eq!(stored.state, PackageState::WaitingForUpload);
        assert_eq!(
            stored.checkpoint,
            cp(PackageState::Copied, Transition::Upload)
        );
    }

    #[tokio::test]
    async fn test_reschedule_then_advance_resets_counter() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let polling = Arc::new(Polling {
            calls: AtomicU32::new(0),
            ready_after: 3,
        });
        let table = two_step_table(Arc::new(Counting(counter)), polling.clone());
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let package = new_package(&store);
        let run = machine.run(package).await;

        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(polling.calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.package.reschedules, 0);
    }

    #[tokio::test]
    async fn test_reschedule_limit_fails() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let polling = Arc::new(Polling {
            calls: AtomicU32::new(0),
            ready_after: u32::MAX,
        });
        let table = two_step_table(Arc::new(Counting(counter)), polling.clone());
        let machine = PackageStateMachine::new(
            table,
            store.clone(),
            MachineConfig { max_reschedules: 2 },
        );

        let package = new_package(&store);
        let run = machine.run(package).await;

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::MediaNotReady,
                ..
            }
        ));
        assert_eq!(polling.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_checkpoint_fails() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let table = two_step_table(Arc::new(Counting(counter.clone())), Arc::new(Failing));
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        let mut package = new_package(&store);
        package.checkpoint = cp(PackageState::Ready, Transition::Publish);
        store.save(&package).unwrap();

        let run = machine.run(package).await;

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::InvalidCheckpoint,
                ..
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_reports_storage_error() {
        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        let table = two_step_table(
            Arc::new(Counting(counter.clone())),
            Arc::new(Counting(counter)),
        );
        let machine = PackageStateMachine::new(table, store, MachineConfig::default());

        // Never created, so the first save fails.
        let package = PackageDescriptor::new(
            PathBuf::from("/hot/ghost.zip"),
            PackageType::new("zip"),
            cp(PackageState::Pending, Transition::Copy),
        );
        let run = machine.run(package).await;

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::Storage,
                ..
            }
        ));
    }
}
