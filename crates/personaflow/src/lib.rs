pub mod api;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod telemetry;

pub use config::{Config, NotifyMode, PipelineConfig};
pub use error::{PipelineError, StoreError};
pub use pipeline::{Deps, Orchestrator, ReconcileReport};
