pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod lockfile;
pub mod manifest;
pub mod monitor;
pub mod observability;
pub mod pipeline;
pub mod recipe;
pub mod runner;
pub mod signals;
pub mod validation;

pub use config::RunConfig;
pub use error::{PipelineError, Result};
pub use manifest::RunStatus;
pub use pipeline::PipelineManager;
pub use recipe::Recipe;
pub use runner::{Step, StepOutcome, StepResult};
