pub mod config;
pub mod format;
pub mod ingest;
pub mod machine;
pub mod metrics;
pub mod package;
pub mod pipeline;
pub mod platform;
pub mod scheduler;
pub mod testing;
pub mod watcher;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, HotFolderConfig,
    PlatformConfig,
};
pub use ingest::HotFolderIngest;
pub use machine::{MachineConfig, MachineOutcome, PackageStateMachine, TransitionTable};
pub use package::{
    Checkpoint, ErrorCode, PackageDescriptor, PackageState, PackageStore, SqlitePackageStore,
    Transition,
};
pub use pipeline::{build_transition_table, PipelineConfig, PipelineContext};
pub use scheduler::{
    PublishScheduler, SchedulerConfig, SchedulerError, SchedulerEvent, SchedulerStatus,
    SubmitRequest,
};
pub use watcher::{WatchError, WatchEvent, WatchOutcome, WatchRegistry, WatcherConfig};
