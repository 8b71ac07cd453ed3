//! Job running: one active conversion per tool session.
//!
//! ```text
//! run(op, file)
//!      │  cancel previous job (snapshot → Cancelled)
//!      ▼
//! Preparing ── engines.converter(kind) ──▶ Running ── engine task ──▶ Succeeded
//!      │                                     │  ▲                      Failed
//!      └──────────── cancel() ───────────────┘  │ ProgressRelay         Cancelled
//!                                               └─ (job-stamped events)
//! ```

mod runner;
mod timing;
mod types;

pub use runner::JobRunner;
pub use timing::{estimate_remaining, format_duration, MIN_PROGRESS_FOR_ESTIMATE};
pub use types::{JobId, JobOutcome, JobPhase, JobSnapshot};
