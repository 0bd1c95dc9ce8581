//! runnergrid-reporter — reflects job progress onto upstream check runs.
//!
//! Reports are upserted into an in-memory queue keyed by job id and
//! persisted before the call returns. A background loop flushes the queue
//! on an interval (or as soon as it reaches the batch size): entries
//! without a check run are created upstream, the rest are updated. A
//! created check-run id is persisted immediately so a restart never
//! creates a second one. Entries leave the queue only after a confirmed
//! upstream write, or after exhausting their retries, in which case they
//! are kept as failed reports for replay.

pub mod api;
pub mod error;
pub mod github;
pub mod render;
pub mod reporter;

pub use api::{CheckRunApi, CheckRunOutput, CreateCheckRun, UpdateCheckRun};
pub use error::{ReportError, ReportResult};
pub use github::GitHubChecksClient;
pub use reporter::{
    FlushSummary, JobContext, ReporterHealth, ReporterSettings, StatusEvent, StatusReporter,
};
