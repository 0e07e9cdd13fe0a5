//! Harvest Runner: pipeline orchestration on top of `harvest-core`.
//!
//! This crate provides:
//! - TOML pipeline configuration with environment overrides
//! - The job controller: bounded worker pool, per-job state machine,
//!   run-wide and per-symbol pause/resume/cancel/skip
//! - Feature and profile-storage collaborators behind traits
//! - Run metrics (ETA, throughput) and rate-limit usage events
//! - CSV/JSON/Markdown run reports

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod events;
mod job;
pub mod metrics;
pub mod report;

pub use collaborators::{
    CollaboratorError, FeatureProcessor, FeatureSet, JsonProfileStore, MemoryProfileStore,
    Profile, ProfileStore, SummaryFeatures,
};
pub use config::{
    CacheSettings, ConfigError, FetchMode, PipelineConfig, PipelineSettings, API_KEY_ENV,
};
pub use controller::{
    ControlHandle, ControllerError, Counters, JobController, JobSnapshot, JobStatus,
    PipelineStatus, RunOptions, RunState, RunSummary,
};
pub use events::{PipelineEvent, ProgressUpdate, RateLimitUsage};
pub use metrics::{format_duration, MetricsAggregator, MetricsSnapshot};
pub use report::{export_status_csv, export_status_json, generate_summary, save_status};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn control_handle_is_send_sync() {
        assert_send::<ControlHandle>();
        assert_sync::<ControlHandle>();
    }

    #[test]
    fn controller_is_send() {
        assert_send::<JobController>();
    }

    #[test]
    fn status_types_are_send_sync() {
        assert_send::<PipelineStatus>();
        assert_sync::<PipelineStatus>();
        assert_send::<PipelineEvent>();
        assert_send::<RunSummary>();
    }

    #[test]
    fn collaborators_are_send_sync() {
        assert_send::<JsonProfileStore>();
        assert_sync::<JsonProfileStore>();
        assert_send::<MemoryProfileStore>();
        assert_sync::<MemoryProfileStore>();
        assert_sync::<SummaryFeatures>();
    }
}
