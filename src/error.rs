//! Error types for the pipeline system.

use thiserror::Error;

use crate::manager::ModuleId;

/// Fatal configuration errors, surfaced before any module starts.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("module handle {0} is not registered with this manager")]
    UnknownModule(ModuleId),

    #[error("modules failed the wiring check: {names:?}")]
    UnwiredModules { names: Vec<String> },

    #[error("pipeline graph has a cycle involving module '{name}'")]
    CyclicGraph { name: String },
}

/// Module-local runtime errors. A failing module is logged and its task
/// ends; sibling modules are not cancelled.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModuleError {
    /// Shorthand for a processing failure with a formatted message.
    pub fn processing(msg: impl Into<String>) -> Self {
        ModuleError::Processing(msg.into())
    }
}

/// Result type for pipeline configuration operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type for module-local operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
