//! The publishing pipeline.
//!
//! Wires the concrete steps into a transition table:
//!
//! | from           | transition             | success        |
//! |----------------|------------------------|----------------|
//! | `pending`      | `copy`                 | `copied`       |
//! | `copied`       | `validate`             | `validated`    |
//! | `validated`    | `extract`              | `extracted`    |
//! | `extracted`    | `upload`               | `uploaded`     |
//! | `uploaded`     | `await_ready`          | `ready`        |
//! | `ready`        | `synchronize_metadata` | `synchronized` |
//! | `synchronized` | `publish`              | `published`    |
//!
//! `upload` parks the package in `waiting_for_upload` when no platform is
//! known, and `await_ready` reschedules itself until the platform reports
//! the medias available.

pub mod archive;
mod config;
mod steps;

use std::sync::Arc;

pub use config::PipelineConfig;
pub use steps::{
    AwaitReadyStep, CopyStep, ExtractStep, PublishStep, SynchronizeMetadataStep, UploadStep,
    ValidateStep, EXTRACTED_DIR,
};

use crate::format::FormatRegistry;
use crate::machine::{Next, TableError, TransitionTable};
use crate::package::{Checkpoint, PackageState, Transition};
use crate::platform::PlatformRegistry;

/// Shared dependencies of the pipeline steps.
#[derive(Debug)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub formats: Arc<FormatRegistry>,
    pub platforms: Arc<PlatformRegistry>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        formats: Arc<FormatRegistry>,
        platforms: Arc<PlatformRegistry>,
    ) -> Self {
        Self {
            config,
            formats,
            platforms,
        }
    }
}

/// Checkpoint every new package starts at.
pub fn initial_checkpoint() -> Checkpoint {
    Checkpoint::new(PackageState::Pending, Transition::Copy)
}

/// Build the publishing transition table.
pub fn build_transition_table(ctx: Arc<PipelineContext>) -> Result<TransitionTable, TableError> {
    use PackageState::*;

    let cp = Checkpoint::new;

    TransitionTable::builder(initial_checkpoint())
        .on(
            Pending,
            Transition::Copy,
            Arc::new(CopyStep::new(ctx.clone())),
            Next::Continue(cp(Copied, Transition::Validate)),
        )
        .on(
            Copied,
            Transition::Validate,
            Arc::new(ValidateStep::new(ctx.clone())),
            Next::Continue(cp(Validated, Transition::Extract)),
        )
        .on(
            Validated,
            Transition::Extract,
            Arc::new(ExtractStep::new(ctx.clone())),
            Next::Continue(cp(Extracted, Transition::Upload)),
        )
        .on(
            Extracted,
            Transition::Upload,
            Arc::new(UploadStep::new(ctx.clone())),
            Next::Continue(cp(Uploaded, Transition::AwaitReady)),
        )
        .on(
            Uploaded,
            Transition::AwaitReady,
            Arc::new(AwaitReadyStep::new(ctx.clone())),
            Next::Continue(cp(Ready, Transition::SynchronizeMetadata)),
        )
        .on(
            Ready,
            Transition::SynchronizeMetadata,
            Arc::new(SynchronizeMetadataStep::new(ctx.clone())),
            Next::Continue(cp(Synchronized, Transition::Publish)),
        )
        .on(
            Synchronized,
            Transition::Publish,
            Arc::new(PublishStep::new(ctx)),
            Next::Done(Published),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::machine::{MachineConfig, MachineOutcome, PackageStateMachine};
    use crate::package::{ErrorCode, PackageStore, SqlitePackageStore};
    use crate::testing::{fixtures, MockPlatform, StaticFormat};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        hot: std::path::PathBuf,
        work: std::path::PathBuf,
        store: Arc<SqlitePackageStore>,
        platform: Arc<MockPlatform>,
        machine: PackageStateMachine,
    }

    fn harness(default_platform: Option<&str>, formats: FormatRegistry) -> Harness {
        let dir = TempDir::new().unwrap();
        let hot = dir.path().join("hot");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&hot).unwrap();

        let platform = Arc::new(MockPlatform::new("vod"));
        let mut platforms = PlatformRegistry::new();
        platforms.register("vod", platform.clone());

        let config = PipelineConfig {
            work_dir: work.clone(),
            default_platform: default_platform.map(String::from),
            readiness_poll_interval_ms: 5,
            ..Default::default()
        };
        let ctx = Arc::new(PipelineContext::new(
            config,
            Arc::new(formats),
            Arc::new(platforms),
        ));

        let store = Arc::new(SqlitePackageStore::in_memory().unwrap());
        let table = build_transition_table(ctx).unwrap();
        let machine = PackageStateMachine::new(table, store.clone(), MachineConfig::default());

        Harness {
            _dir: dir,
            hot,
            work,
            store,
            platform,
            machine,
        }
    }

    fn submit(h: &Harness, source: &Path) -> crate::package::PackageDescriptor {
        let package = fixtures::package(source);
        h.store.create(&package).unwrap();
        package
    }

    #[test]
    fn test_table_covers_whole_pipeline() {
        let ctx = Arc::new(PipelineContext::new(
            PipelineConfig::default(),
            Arc::new(FormatRegistry::with_defaults()),
            Arc::new(PlatformRegistry::new()),
        ));
        let table = build_transition_table(ctx).unwrap();
        assert_eq!(
            table.transitions(),
            &[
                Transition::Copy,
                Transition::Validate,
                Transition::Extract,
                Transition::Upload,
                Transition::AwaitReady,
                Transition::SynchronizeMetadata,
                Transition::Publish,
            ]
        );
    }

    #[tokio::test]
    async fn test_zip_package_published() {
        let h = harness(Some("vod"), FormatRegistry::with_defaults());
        let source = h.hot.join("Lecture.zip");
        fixtures::write_zip(
            &source,
            &[
                ("lecture/part1.mp4", b"one"),
                ("lecture/part2.mp4", b"two"),
                (
                    "lecture/points.json",
                    br#"[{"type":"chapter","timecode":0,"data":{"name":"Intro"}}]"#,
                ),
            ],
        );
        h.platform.set_ready_after(2).await;

        let package = submit(&h, &source);
        let run = h.machine.run(package.clone()).await;

        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(run.package.state, PackageState::Published);
        assert_eq!(run.package.media_ids, vec!["media-1", "media-2"]);
        assert_eq!(run.package.platform.as_deref(), Some("vod"));
        assert_eq!(
            run.package.metadata.medias,
            vec!["lecture/part1.mp4", "lecture/part2.mp4"]
        );

        let uploads = h.platform.recorded_uploads().await;
        assert_eq!(uploads[0].content, b"one");
        assert_eq!(h.platform.status_calls(), 3);

        let sources = &h.store.get(&package.id).unwrap().unwrap().metadata.sources;
        let ids: Vec<_> = sources.iter().map(|s| s.media_id.as_str()).collect();
        assert_eq!(ids, vec!["media-1", "media-2"]);

        let updates = h.platform.recorded_updates().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].fields.title.as_deref(), Some("Lecture"));
        assert_eq!(
            updates[0].fields.points_of_interest.as_ref().unwrap().len(),
            1
        );

        // Original removed, work dir cleaned up.
        assert!(!source.exists());
        assert!(!h.work.join(&package.id).exists());
    }

    #[tokio::test]
    async fn test_plain_media_package_published() {
        let h = harness(Some("vod"), FormatRegistry::with_defaults());
        let source = h.hot.join("clip.mp4");
        std::fs::write(&source, b"video").unwrap();

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;

        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(run.package.metadata.medias, vec!["clip.mp4"]);
        assert_eq!(h.platform.recorded_uploads().await[0].content, b"video");
    }

    #[tokio::test]
    async fn test_without_platform_parks_before_upload() {
        let h = harness(None, FormatRegistry::with_defaults());
        let source = h.hot.join("clip.mp4");
        std::fs::write(&source, b"video").unwrap();

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;

        assert_eq!(
            run.outcome,
            MachineOutcome::Parked(PackageState::WaitingForUpload)
        );
        assert_eq!(
            run.package.checkpoint,
            Checkpoint::new(PackageState::Extracted, Transition::Upload)
        );
        assert!(h.platform.recorded_uploads().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_validation() {
        let h = harness(Some("vod"), FormatRegistry::with_defaults());
        let source = h.hot.join("broken.zip");
        std::fs::write(&source, b"this is not a zip").unwrap();

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::InvalidArchive,
                ..
            }
        ));
        assert_eq!(
            run.package.checkpoint,
            Checkpoint::new(PackageState::Copied, Transition::Validate)
        );
    }

    #[tokio::test]
    async fn test_unrecognised_layout_fails_with_validation_failed() {
        let h = harness(Some("vod"), FormatRegistry::with_defaults());
        let source = h.hot.join("docs.zip");
        fixtures::write_zip(&source, &[("readme.txt", b"no media here")]);

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;

        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::ValidationFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_format_validation_failure() {
        let mut formats = FormatRegistry::new();
        formats.register(Arc::new(StaticFormat::invalid("strict")));
        let h = harness(Some("vod"), formats);
        let source = h.hot.join("clip.mp4");
        std::fs::write(&source, b"video").unwrap();

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;

        match run.outcome {
            MachineOutcome::Failed { code, message } => {
                assert_eq!(code, ErrorCode::ValidationFailed);
                assert!(message.contains("strict rejected the package"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_platform_fails() {
        let h = harness(None, FormatRegistry::with_defaults());
        let source = h.hot.join("clip.mp4");
        std::fs::write(&source, b"video").unwrap();

        let mut package = submit(&h, &source);
        package.platform = Some("nowhere".to_string());
        h.store.save(&package).unwrap();

        let run = h.machine.run(package).await;
        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::UnknownPlatform,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_failure_then_retry_resumes_at_upload() {
        let h = harness(Some("vod"), FormatRegistry::with_defaults());
        let source = h.hot.join("clip.mp4");
        std::fs::write(&source, b"video").unwrap();
        h.platform
            .set_next_error(crate::platform::PlatformError::Timeout)
            .await;

        let package = submit(&h, &source);
        let run = h.machine.run(package).await;
        assert!(matches!(
            run.outcome,
            MachineOutcome::Failed {
                code: ErrorCode::UploadFailed,
                ..
            }
        ));
        assert_eq!(
            run.package.checkpoint,
            Checkpoint::new(PackageState::Extracted, Transition::Upload)
        );

        // The source is gone; resuming must not need it again.
        assert!(!source.exists());
        let mut package = run.package;
        package.state = PackageState::Pending;
        package.error_code = None;
        package.error_message = None;
        h.store.save(&package).unwrap();

        let run = h.machine.run(package).await;
        assert_eq!(run.outcome, MachineOutcome::Completed);
        assert_eq!(h.platform.recorded_uploads().await.len(), 1);
    }
}
