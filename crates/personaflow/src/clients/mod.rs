pub mod artifacts;
pub mod openai;
pub mod provider;
pub mod subjects;
pub mod trainer;

pub use artifacts::{job_artifact_key, ArtifactStore, FsArtifactStore};
pub use openai::OpenAiBatchClient;
pub use provider::{BatchProvider, BatchRequest, BatchSubmission, ProviderStatus};
pub use subjects::{PgSubjectDirectory, SubjectDirectory, SubjectRecord};
pub use trainer::{ModelTrainer, ProcessTrainer, TrainingRequest, TrainingStatus};
