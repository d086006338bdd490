//! The build error taxonomy.
//!
//! Errors are classified by how the top-level driver should present them:
//! user errors print their pre-formatted message and exit 1 without a
//! backtrace, step failures propagate the step's exit code, cancellations
//! are not reported at all (the failure that caused them is). Cache
//! unavailability never reaches this type; the cache layer downgrades it to
//! a miss. Misuse of the rule-key builder is a programmer error and panics
//! rather than appearing here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use kiln_hash::FileHashError;
use kiln_target::{BuildTarget, TargetError};

use crate::attr::CoerceError;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Bad input from a build file or the command line. The message is
    /// already human-readable.
    #[error("{0}")]
    UserInput(String),

    #[error("{}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A build step exited with a non-zero code.
    #[error("step '{short_name}' failed with exit code {exit_code}")]
    StepFailure {
        short_name: String,
        description: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("cycle detected in target graph: {0}")]
    Cycle(String),

    /// Downstream of another failure; never reported to the user directly.
    #[error("build of {0} was cancelled")]
    Cancelled(BuildTarget),
}

impl BuildError {
    /// The process exit code this failure maps to: a failing step's own
    /// exit code when non-zero, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::StepFailure { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, BuildError::Cancelled(_))
    }

    /// The message shown to the user. Step failures include the step's
    /// description and captured stderr for diagnosis.
    pub fn user_message(&self) -> String {
        match self {
            BuildError::StepFailure { short_name, description, exit_code, stderr } => {
                let mut message = format!(
                    "step '{}' failed with exit code {}\n  command: {}",
                    short_name, exit_code, description
                );
                if !stderr.trim().is_empty() {
                    message.push_str("\n  stderr: ");
                    message.push_str(stderr.trim());
                }
                message
            }
            other => other.to_string(),
        }
    }

    pub fn file_system(path: impl Into<PathBuf>, source: io::Error) -> BuildError {
        BuildError::FileSystem { path: path.into(), source }
    }
}

impl From<TargetError> for BuildError {
    fn from(e: TargetError) -> BuildError {
        BuildError::UserInput(e.to_string())
    }
}

impl From<CoerceError> for BuildError {
    fn from(e: CoerceError) -> BuildError {
        BuildError::UserInput(e.to_string())
    }
}

impl From<FileHashError> for BuildError {
    fn from(e: FileHashError) -> BuildError {
        match e {
            FileHashError::MissingFile(path) => {
                BuildError::UserInput(format!("{} does not exist on disk", path.display()))
            }
            FileHashError::Io { path, source } => BuildError::FileSystem { path, source },
        }
    }
}
