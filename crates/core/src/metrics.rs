//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Directory watching (events, watched directories)
//! - State machine (transition durations, outcomes)
//! - Scheduler (admission, queue depth)
//! - Platform calls

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Watcher Metrics
// =============================================================================

/// Watch events emitted, by kind.
pub static WATCH_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("hotfolder_watch_events_total", "Total watch events emitted"),
        &["kind"], // "create", "delete", "watch", "error"
    )
    .unwrap()
});

/// Directories currently attached to a native watcher.
pub static WATCHED_DIRECTORIES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "hotfolder_watched_directories",
        "Number of directories currently watched",
    )
    .unwrap()
});

// =============================================================================
// State Machine Metrics
// =============================================================================

/// Duration of a single transition.
pub static TRANSITION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "hotfolder_transition_duration_seconds",
            "Duration of package state machine transitions",
        )
        .buckets(vec![
            0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0,
        ]),
        &["transition", "result"], // result: "advance", "reschedule", "park", "error"
    )
    .unwrap()
});

/// Machine runs finished, by outcome.
pub static PACKAGES_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "hotfolder_packages_finished_total",
            "Total machine runs finished",
        ),
        &["outcome"], // "completed", "parked", "failed"
    )
    .unwrap()
});

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Packages currently running.
pub static PACKAGES_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "hotfolder_packages_in_flight",
        "Number of packages currently being processed",
    )
    .unwrap()
});

/// Packages waiting for a slot.
pub static PACKAGES_QUEUED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "hotfolder_packages_queued",
        "Number of packages waiting for a processing slot",
    )
    .unwrap()
});

/// Submissions by result.
pub static SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("hotfolder_submissions_total", "Total package submissions"),
        &["result"], // "accepted", "invalid", "duplicate", "error"
    )
    .unwrap()
});

// =============================================================================
// Platform Metrics
// =============================================================================

/// Platform request duration.
pub static PLATFORM_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "hotfolder_platform_request_duration_seconds",
            "Duration of media platform calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
        &["platform", "operation", "status"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Watcher
        Box::new(WATCH_EVENTS.clone()),
        Box::new(WATCHED_DIRECTORIES.clone()),
        // Machine
        Box::new(TRANSITION_DURATION.clone()),
        Box::new(PACKAGES_FINISHED.clone()),
        // Scheduler
        Box::new(PACKAGES_IN_FLIGHT.clone()),
        Box::new(PACKAGES_QUEUED.clone()),
        Box::new(SUBMISSIONS.clone()),
        // Platform
        Box::new(PLATFORM_REQUEST_DURATION.clone()),
    ]
}
