pub mod memory;
pub mod model;
pub mod repo;
pub mod retry;
pub mod state;
pub mod store;

use chrono::{DateTime, Duration, Utc};

pub use memory::MemoryJobStore;
pub use model::{artifact, ArtifactRefs, Job, JobFilter, JobPatch, NewJob};
pub use repo::JobsRepo;
pub use state::{DataGenerationStatus, FineTuningStatus, JobStatus, Stage, Transition};
pub use store::{ChainOutcome, JobStore};

pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
