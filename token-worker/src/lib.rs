//! Background jobs for the credential lifecycle.
//!
//! ```text
//!               ┌──────────────┐        ┌───────────────────┐
//!   interval ──►│  RefreshJob  │        │ ReconciliationJob │◄── interval
//!               └──────┬───────┘        └─────────┬─────────┘
//!                      │  batches of C            │  classify / re-verify / delete
//!                      ▼                          ▼
//!               ┌─────────────────────────────────────────┐
//!               │            CredentialService            │
//!               └─────────────────────────────────────────┘
//!                      ▲
//!   POST /jobs/*/run ──┘  (api)
//! ```
//!
//! Each job refuses to overlap with itself and runs under an overall
//! deadline. The two jobs are independent of each other.

pub mod api;
pub mod job;
pub mod reconcile;
pub mod refresh_job;

pub use api::{create_router, ApiState};
pub use job::{JobError, JobHealth, JobStatus, JobTracker};
pub use reconcile::{CredentialHealth, HealthReport, ReconciliationJob};
pub use refresh_job::{RefreshJob, RefreshRunSummary};
