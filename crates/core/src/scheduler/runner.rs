//! Publish scheduler implementation.
//!
//! Admits at most `max_concurrent` packages into their state machine and
//! queues the rest in strict arrival order. A finishing machine frees its
//! slot and admits the head of the queue.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::machine::{MachineOutcome, MachineRun, PackageStateMachine};
use crate::metrics::{PACKAGES_IN_FLIGHT, PACKAGES_QUEUED, SUBMISSIONS};
use crate::package::{
    PackageDescriptor, PackageFilter, PackageState, PackageStore, PackageType, SourceIdentity,
};
use crate::platform::PlatformRegistry;

use super::config::SchedulerConfig;
use super::types::{SchedulerError, SchedulerEvent, SchedulerStatus, SubmitRequest};

const EVENT_CAPACITY: usize = 256;
const RECOVERY_PAGE: i64 = 100;

#[derive(Debug, Default)]
struct Slots {
    /// Running packages: id -> source path.
    in_flight: HashMap<String, PathBuf>,
    queue: VecDeque<PackageDescriptor>,
    /// Packages whose medias and record are being removed.
    discarding: HashSet<String>,
}

impl Slots {
    fn holds_id(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
            || self.discarding.contains(id)
            || self.queue.iter().any(|p| p.id == id)
    }

    fn holder_of(&self, source: &Path) -> Option<String> {
        self.in_flight
            .iter()
            .find(|(_, path)| path.as_path() == source)
            .map(|(id, _)| id.clone())
            .or_else(|| {
                self.queue
                    .iter()
                    .find(|p| p.source_path == source)
                    .map(|p| p.id.clone())
            })
    }

    fn update_gauges(&self) {
        PACKAGES_IN_FLIGHT.set(self.in_flight.len() as i64);
        PACKAGES_QUEUED.set(self.queue.len() as i64);
    }
}

struct Inner {
    config: SchedulerConfig,
    machine: Arc<PackageStateMachine>,
    platforms: Arc<PlatformRegistry>,
    events: broadcast::Sender<SchedulerEvent>,
    slots: Mutex<Slots>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> &Arc<dyn PackageStore> {
        self.machine.store()
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start the package now if a slot is free, queue it otherwise.
    fn admit(self: &Arc<Self>, slots: &mut Slots, package: PackageDescriptor) {
        if slots.in_flight.len() < self.config.max_concurrent {
            debug!(package_id = %package.id, "Package admitted");
            slots
                .in_flight
                .insert(package.id.clone(), package.source_path.clone());
            self.spawn(package);
        } else {
            debug!(
                package_id = %package.id,
                position = slots.queue.len() + 1,
                "Package queued"
            );
            slots.queue.push_back(package);
        }
        slots.update_gauges();
    }

    /// Run the package on its own task. The slot is released however the
    /// run ends, including a panicking step.
    fn spawn(self: &Arc<Self>, package: PackageDescriptor) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let fallback = package.clone();
            let run = match AssertUnwindSafe(inner.machine.run(package))
                .catch_unwind()
                .await
            {
                Ok(run) => run,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(package_id = %fallback.id, error = %message, "Package run panicked");
                    inner.machine.abandon(fallback, message)
                }
            };
            inner.finished(run);
        });
    }

    fn finished(self: &Arc<Self>, run: MachineRun) {
        {
            let mut slots = self.slots();
            slots.in_flight.remove(&run.package.id);
            if let Some(next) = slots.queue.pop_front() {
                debug!(package_id = %next.id, "Package admitted from queue");
                slots
                    .in_flight
                    .insert(next.id.clone(), next.source_path.clone());
                self.spawn(next);
            }
            slots.update_gauges();
        }

        let MachineRun { package, outcome } = run;
        let event = match outcome {
            MachineOutcome::Completed => {
                info!(package_id = %package.id, "Package published");
                SchedulerEvent::Completed(package)
            }
            MachineOutcome::Parked(state) => {
                info!(package_id = %package.id, state = %state, "Package waiting for operator");
                SchedulerEvent::Parked(package)
            }
            MachineOutcome::Failed { code, message } => {
                warn!(
                    package_id = %package.id,
                    code = %code,
                    error = %message,
                    "Package failed"
                );
                SchedulerEvent::Failed {
                    package,
                    code,
                    message,
                }
            }
        };
        self.emit(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("step panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("step panicked: {}", message)
    } else {
        "step panicked".to_string()
    }
}

/// Admission control around [`PackageStateMachine`].
///
/// Cheap to clone; all clones share the same slots and queue.
#[derive(Clone)]
pub struct PublishScheduler {
    inner: Arc<Inner>,
}

impl PublishScheduler {
    pub fn new(
        config: SchedulerConfig,
        machine: Arc<PackageStateMachine>,
        platforms: Arc<PlatformRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                machine,
                platforms,
                events,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Current admission state.
    pub fn status(&self) -> SchedulerStatus {
        let slots = self.inner.slots();
        SchedulerStatus {
            max_concurrent: self.inner.config.max_concurrent,
            in_flight: slots.in_flight.len(),
            queued: slots.queue.len(),
        }
    }

    /// Register a new package and admit or queue it.
    ///
    /// Unaccepted types and unreadable sources are rejected before anything
    /// is persisted. A source already tracked by an unfinished package, or
    /// published with the same size and modification time, is rejected as a
    /// duplicate.
    pub fn submit(&self, request: SubmitRequest) -> Result<PackageDescriptor, SchedulerError> {
        let result = self.try_submit(request);

        let label = match &result {
            Ok(_) => "accepted",
            Err(SchedulerError::InvalidPackage { .. }) => "invalid",
            Err(SchedulerError::Duplicate { .. }) => "duplicate",
            Err(_) => "error",
        };
        SUBMISSIONS.with_label_values(&[label]).inc();

        result
    }

    fn try_submit(&self, request: SubmitRequest) -> Result<PackageDescriptor, SchedulerError> {
        let source = request.source_path;

        let package_type =
            PackageType::from_path(&source).ok_or_else(|| SchedulerError::InvalidPackage {
                path: source.clone(),
                reason: "no file extension".to_string(),
            })?;
        if !self.inner.config.accepts(&package_type) {
            return Err(SchedulerError::InvalidPackage {
                path: source,
                reason: format!("package type {} is not accepted", package_type),
            });
        }

        if let Some(platform) = &request.platform {
            if !self.inner.platforms.contains(platform) {
                return Err(SchedulerError::UnknownPlatform(platform.clone()));
            }
        }

        let identity = std::fs::metadata(&source)
            .map(|m| SourceIdentity::of(&m))
            .map_err(|e| SchedulerError::InvalidPackage {
                path: source.clone(),
                reason: format!("cannot read source: {}", e),
            })?;

        let mut slots = self.inner.slots();

        if let Some(package_id) = slots.holder_of(&source) {
            return Err(SchedulerError::Duplicate {
                path: source,
                package_id,
            });
        }
        if let Some(existing) = self.inner.store().find_by_source(&source)? {
            let changed = existing.source_identity != Some(identity);
            if existing.state != PackageState::Published || !changed {
                return Err(SchedulerError::Duplicate {
                    path: source,
                    package_id: existing.id,
                });
            }
        }

        let initial = self.inner.machine.table().initial();
        let mut package = PackageDescriptor::new(source, package_type, initial);
        package.source_identity = Some(identity);
        package.owner = request.owner;
        package.group = request.group;
        package.platform = request.platform;

        self.inner.store().create(&package)?;

        info!(
            package_id = %package.id,
            source = %package.source_path.display(),
            package_type = %package.package_type,
            "Package submitted"
        );

        self.inner.admit(&mut slots, package.clone());
        Ok(package)
    }

    /// Re-admit a failed package at its last successful checkpoint.
    pub fn retry(&self, id: &str) -> Result<PackageDescriptor, SchedulerError> {
        let mut slots = self.inner.slots();
        let mut package = self.load_idle(&slots, id, "retry")?;

        if package.state != PackageState::Error {
            return Err(SchedulerError::InvalidState {
                package_id: package.id,
                state: package.state,
                operation: "retry",
            });
        }

        package.state = PackageState::Pending;
        package.error_code = None;
        package.error_message = None;
        package.reschedules = 0;
        package.retry_count += 1;
        package.updated_at = Utc::now();
        self.inner.store().save(&package)?;

        info!(
            package_id = %package.id,
            checkpoint = %package.checkpoint,
            attempt = package.retry_count,
            "Retrying package"
        );

        self.inner.emit(SchedulerEvent::RetryStarted(package.clone()));
        self.inner.admit(&mut slots, package.clone());
        Ok(package)
    }

    /// Resume a package parked for lack of a platform.
    pub fn upload(&self, id: &str, platform: &str) -> Result<PackageDescriptor, SchedulerError> {
        let mut slots = self.inner.slots();
        let mut package = self.load_idle(&slots, id, "upload")?;

        if package.state != PackageState::WaitingForUpload {
            return Err(SchedulerError::InvalidState {
                package_id: package.id,
                state: package.state,
                operation: "upload",
            });
        }
        if !self.inner.platforms.contains(platform) {
            return Err(SchedulerError::UnknownPlatform(platform.to_string()));
        }

        package.platform = Some(platform.to_string());
        package.state = PackageState::Pending;
        package.updated_at = Utc::now();
        self.inner.store().save(&package)?;

        info!(
            package_id = %package.id,
            platform = %platform,
            "Uploading package"
        );

        self.inner.emit(SchedulerEvent::UploadStarted(package.clone()));
        self.inner.admit(&mut slots, package.clone());
        Ok(package)
    }

    /// Forget a failed, parked or published package.
    ///
    /// Its medias are removed from the platform first; the record is deleted
    /// only once they are gone. The work directory is left in place since it
    /// may hold the only copy of the source.
    pub async fn discard(&self, id: &str) -> Result<PackageDescriptor, SchedulerError> {
        let package = {
            let mut slots = self.inner.slots();
            let package = self.load_idle(&slots, id, "discard")?;
            if !package.state.is_stable() {
                return Err(SchedulerError::InvalidState {
                    package_id: package.id,
                    state: package.state,
                    operation: "discard",
                });
            }
            slots.discarding.insert(package.id.clone());
            package
        };

        let removed = self.remove_package(&package).await;
        self.inner.slots().discarding.remove(&package.id);
        removed?;

        info!(
            package_id = %package.id,
            medias = package.media_ids.len(),
            "Package discarded"
        );
        Ok(package)
    }

    async fn remove_package(&self, package: &PackageDescriptor) -> Result<(), SchedulerError> {
        if let Some(name) = package.platform.as_deref().filter(|_| !package.media_ids.is_empty()) {
            let platform = self
                .inner
                .platforms
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownPlatform(name.to_string()))?;
            platform
                .remove(&package.media_ids)
                .await
                .map_err(|e| SchedulerError::Platform {
                    package_id: package.id.clone(),
                    platform: name.to_string(),
                    message: e.to_string(),
                })?;
        }
        self.inner.store().delete(&package.id)?;
        Ok(())
    }

    /// Resume every package a previous process left in an in-progress
    /// state. Returns how many were resumed.
    ///
    /// Failed and parked packages are left for an operator.
    pub fn retry_all(&self) -> Result<usize, SchedulerError> {
        let store = self.inner.store();
        let mut packages = Vec::new();
        let mut offset = 0;
        loop {
            let filter = PackageFilter::new()
                .with_states(PackageState::in_progress())
                .with_limit(RECOVERY_PAGE)
                .with_offset(offset);
            let page = store.list(&filter)?;
            let done = (page.len() as i64) < RECOVERY_PAGE;
            packages.extend(page);
            if done {
                break;
            }
            offset += RECOVERY_PAGE;
        }

        let mut slots = self.inner.slots();
        let mut resumed = 0;
        for package in packages {
            if slots.holds_id(&package.id) {
                continue;
            }
            info!(
                package_id = %package.id,
                checkpoint = %package.checkpoint,
                "Resuming interrupted package"
            );
            self.inner.emit(SchedulerEvent::RetryStarted(package.clone()));
            self.inner.admit(&mut slots, package);
            resumed += 1;
        }

        if resumed > 0 {
            info!(resumed, "Recovered interrupted packages");
        }
        Ok(resumed)
    }

    /// Load a package that is neither running nor queued.
    fn load_idle(
        &self,
        slots: &Slots,
        id: &str,
        operation: &'static str,
    ) -> Result<PackageDescriptor, SchedulerError> {
        let package = self
            .inner
            .store()
            .get(id)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if slots.holds_id(id) {
            return Err(SchedulerError::InvalidState {
                package_id: package.id,
                state: package.state,
                operation,
            });
        }
        Ok(package)
    }
}

impl std::fmt::Debug for PublishScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishScheduler")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}
