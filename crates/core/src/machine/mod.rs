//! Package state machine.
//!
//! A [`TransitionTable`] declares, for each checkpoint, the step to run and the
//! checkpoint reached on success. [`PackageStateMachine`] executes steps in
//! order, persisting the descriptor between them so that a restarted process
//! resumes exactly where the previous one stopped.

mod config;
mod engine;
mod table;

pub use config::MachineConfig;
pub use engine::{MachineOutcome, MachineRun, PackageStateMachine};
pub use table::{
    Next, Step, StepError, StepOutcome, TableError, TransitionTable, TransitionTableBuilder,
};
