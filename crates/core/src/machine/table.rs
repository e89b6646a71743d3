//! Transition table: which step runs at a checkpoint and where success leads.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::package::{Checkpoint, ErrorCode, PackageDescriptor, PackageState, Transition};

/// What a step asks the engine to do after it ran successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move to the successor checkpoint declared in the table.
    Advance,
    /// Run the same checkpoint again after the delay.
    Reschedule(Duration),
    /// Stop in the given state without moving the checkpoint.
    Park(PackageState),
}

/// A failed step, tagged with the code recorded on the package.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One unit of pipeline work.
///
/// Steps may mutate the descriptor (media ids, metadata); the engine persists
/// those changes together with the new checkpoint.
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError>;
}

/// Successor of a checkpoint on the success path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Continue at this checkpoint.
    Continue(Checkpoint),
    /// The machine is done; the package rests in this state.
    Done(PackageState),
}

/// Errors raised while building or consulting a table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("no step registered for transition {0}")]
    UnknownTransition(Transition),

    #[error("transition {transition} runs from {expected}, not from {actual}")]
    StateMismatch {
        transition: Transition,
        expected: PackageState,
        actual: PackageState,
    },

    #[error("transition {0} is registered twice")]
    Duplicate(Transition),

    #[error("success path loops back to transition {0}")]
    Cycle(Transition),
}

struct TableEntry {
    from: PackageState,
    step: Arc<dyn Step>,
    next: Next,
}

/// Maps each transition to its step and its success edge.
///
/// A transition appears at most once, so the success path is a chain that
/// starts at `initial` and ends in a `Next::Done`.
pub struct TransitionTable {
    initial: Checkpoint,
    entries: HashMap<Transition, TableEntry>,
    order: Vec<Transition>,
}

impl fmt::Debug for TransitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("initial", &self.initial)
            .field("order", &self.order)
            .finish()
    }
}

impl TransitionTable {
    pub fn builder(initial: Checkpoint) -> TransitionTableBuilder {
        TransitionTableBuilder {
            initial,
            entries: Vec::new(),
        }
    }

    /// Checkpoint a new package starts at.
    pub fn initial(&self) -> Checkpoint {
        self.initial
    }

    /// Transitions along the success path, in order.
    pub fn transitions(&self) -> &[Transition] {
        &self.order
    }

    fn entry(&self, checkpoint: Checkpoint) -> Result<&TableEntry, TableError> {
        let entry = self
            .entries
            .get(&checkpoint.transition)
            .ok_or(TableError::UnknownTransition(checkpoint.transition))?;

        if entry.from != checkpoint.state {
            return Err(TableError::StateMismatch {
                transition: checkpoint.transition,
                expected: entry.from,
                actual: checkpoint.state,
            });
        }

        Ok(entry)
    }

    /// Step to execute at this checkpoint.
    pub fn step(&self, checkpoint: Checkpoint) -> Result<Arc<dyn Step>, TableError> {
        self.entry(checkpoint).map(|e| Arc::clone(&e.step))
    }

    /// Where the machine goes once the checkpoint's step succeeded.
    pub fn successor(&self, checkpoint: Checkpoint) -> Result<Next, TableError> {
        self.entry(checkpoint).map(|e| e.next)
    }
}

/// Builder validating the table shape.
pub struct TransitionTableBuilder {
    initial: Checkpoint,
    entries: Vec<(Transition, TableEntry)>,
}

impl TransitionTableBuilder {
    /// Registers `transition`, run from `from`, leading to `next` on success.
    pub fn on(
        mut self,
        from: PackageState,
        transition: Transition,
        step: Arc<dyn Step>,
        next: Next,
    ) -> Self {
        self.entries.push((transition, TableEntry { from, step, next }));
        self
    }

    pub fn build(self) -> Result<TransitionTable, TableError> {
        let mut entries = HashMap::new();
        for (transition, entry) in self.entries {
            if entries.insert(transition, entry).is_some() {
                return Err(TableError::Duplicate(transition));
            }
        }

        let mut table = TransitionTable {
            initial: self.initial,
            entries,
            order: Vec::new(),
        };

        // Walk the success path once to reject dangling edges and loops.
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut cursor = table.initial;
        loop {
            if !seen.insert(cursor.transition) {
                return Err(TableError::Cycle(cursor.transition));
            }
            order.push(cursor.transition);
            match table.successor(cursor)? {
                Next::Continue(next) => cursor = next,
                Next::Done(_) => break,
            }
        }

        table.order = order;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        async fn execute(&self, _package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Advance)
        }
    }

    fn noop() -> Arc<dyn Step> {
        Arc::new(Noop)
    }

    fn cp(state: PackageState, transition: Transition) -> Checkpoint {
        Checkpoint::new(state, transition)
    }

    #[test]
    fn test_build_linear_table() {
        let table = TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                noop(),
                Next::Continue(cp(PackageState::Copied, Transition::Publish)),
            )
            .on(
                PackageState::Copied,
                Transition::Publish,
                noop(),
                Next::Done(PackageState::Published),
            )
            .build()
            .unwrap();

        assert_eq!(table.transitions(), &[Transition::Copy, Transition::Publish]);
        assert_eq!(
            table
                .successor(cp(PackageState::Pending, Transition::Copy))
                .unwrap(),
            Next::Continue(cp(PackageState::Copied, Transition::Publish))
        );
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                noop(),
                Next::Continue(cp(PackageState::Copied, Transition::Validate)),
            )
            .build()
            .unwrap_err();
        assert_eq!(err, TableError::UnknownTransition(Transition::Validate));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                noop(),
                Next::Continue(cp(PackageState::Copied, Transition::Validate)),
            )
            .on(
                PackageState::Copied,
                Transition::Validate,
                noop(),
                Next::Continue(cp(PackageState::Pending, Transition::Copy)),
            )
            .build()
            .unwrap_err();
        assert_eq!(err, TableError::Cycle(Transition::Copy));
    }

    #[test]
    fn test_state_mismatch_reported() {
        let table = TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                noop(),
                Next::Done(PackageState::Published),
            )
            .build()
            .unwrap();

        let err = table
            .step(cp(PackageState::Uploaded, Transition::Copy))
            .err()
            .unwrap();
        assert!(matches!(err, TableError::StateMismatch { .. }));
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let err = TransitionTable::builder(cp(PackageState::Pending, Transition::Copy))
            .on(
                PackageState::Pending,
                Transition::Copy,
                noop(),
                Next::Done(PackageState::Published),
            )
            .on(
                PackageState::Copied,
                Transition::Copy,
                noop(),
                Next::Done(PackageState::Published),
            )
            .build()
            .unwrap_err();
        assert_eq!(err, TableError::Duplicate(Transition::Copy));
    }
}
