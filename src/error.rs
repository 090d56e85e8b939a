//! Pipeline and module error types
//!
//! Only configuration problems surface through these types. Once a module
//! is running, failures are logged and confined to the affected stream.

use crate::tls::CaError;
use thiserror::Error;

/// Result type for pipeline assembly
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while parsing, assembling or initializing a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The definition did not name any module
    #[error("Pipeline is empty")]
    Empty,

    /// No module registered under this name
    #[error("Could not find module {0:?}")]
    ModuleNotFound(String),

    /// A module name was registered twice
    #[error("Module {0:?} is already in the list")]
    DuplicateModule(String),

    /// The textual definition could not be tokenized
    #[error("Error parsing pipeline definition: {0}")]
    Definition(String),

    /// A module rejected its flags
    #[error("Error parsing flags for module {module:?}: {source}")]
    Flags {
        module: String,
        #[source]
        source: clap::Error,
    },

    /// A module failed its synchronous initialization
    #[error("Error in module number {index} ({module}): {source}")]
    Init {
        index: usize,
        module: &'static str,
        #[source]
        source: ModuleError,
    },
}

impl PipelineError {
    /// Create a definition error
    pub fn definition(msg: impl Into<String>) -> Self {
        Self::Definition(msg.into())
    }

    /// Create a flag parsing error for a module
    pub fn flags(module: impl Into<String>, source: clap::Error) -> Self {
        Self::Flags {
            module: module.into(),
            source,
        }
    }

    /// Create an initialization error for the module at `index` (1-based)
    pub fn init(index: usize, module: &'static str, source: ModuleError) -> Self {
        Self::Init {
            index,
            module,
            source,
        }
    }
}

/// Errors a module may return from `init`
#[derive(Error, Debug)]
pub enum ModuleError {
    /// A flag value failed validation
    #[error("Flag {flag:?} {reason}")]
    InvalidFlag { flag: &'static str, reason: String },

    /// A process-wide resource is already held by another module
    #[error("Module {0:?} cannot be added more than once")]
    AlreadyClaimed(&'static str),

    /// A process-wide resource is gone
    #[error("{0} is not available")]
    Unavailable(&'static str),

    /// The decision template did not compile
    #[error("Error parsing template: {0}")]
    Template(#[from] minijinja::Error),

    /// Certificate authority could not be prepared
    #[error(transparent)]
    Authority(#[from] CaError),

    /// Listener or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A nested pipeline definition is invalid
    #[error("Error in nested pipeline: {0}")]
    Pipeline(#[from] Box<PipelineError>),
}

impl ModuleError {
    /// Create a flag validation error
    pub fn invalid_flag(flag: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidFlag {
            flag,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_names_module() {
        let err = PipelineError::init(
            2,
            "tls",
            ModuleError::invalid_flag("--read-timeout", "cannot be negative or zero"),
        );
        let message = err.to_string();
        assert!(message.contains("number 2"));
        assert!(message.contains("tls"));
        assert!(message.contains("--read-timeout"));
    }

    #[test]
    fn test_nested_pipeline_error() {
        let err: ModuleError = Box::new(PipelineError::ModuleNotFound("nope".into())).into();
        assert!(err.to_string().contains("nope"));
    }
}
