//! Domain error type for the workflow engine. Wraps the transport/serialization failures from
//! [`common::error::EmError`] and adds the failure modes specific to compiling and running a
//! workflow graph against remote WPS processes.

use common::error::EmError;

use crate::message::{Descriptor, Kind};

/// Error produced while compiling or running a workflow
#[derive(Debug)]
pub enum Error {
    /// The workflow description failed schema or graph validation (duplicate names, a linked
    /// input referencing an unknown task, a group with no member tasks, etc).
    WorkflowInvalid(String),
    /// An edge in the graph connects an output and an input whose datatypes cannot be adapted to
    /// one another. Carries the full descriptors of both ends so the message is actionable.
    DatatypeIncompatible {
        task: String,
        input: Descriptor,
        output: Descriptor,
    },
    /// A remote WPS endpoint could not be reached (DNS, connection refused, timeout).
    RemoteUnavailable { url: String, source: EmError },
    /// Reading or parsing a status document failed repeatedly past the retry budget.
    StatusReadFailed {
        status_location: String,
        attempts: u32,
        source: EmError,
    },
    /// A remote process reported `ProcessFailed`. Carries the exception text returned by the
    /// server.
    RemoteFailed(String),
    /// The workflow as a whole did not complete successfully. Aggregates every task-level failure
    /// collected during the run.
    WorkflowFailed(String),
    /// Transport, serialization or I/O failure with no workflow-specific interpretation.
    Common(EmError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<EmError> for Error {
    fn from(error: EmError) -> Self {
        Self::Common(error)
    }
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Self::WorkflowInvalid(error)
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Self::WorkflowInvalid(error.to_owned())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(error: quick_xml::Error) -> Self {
        Self::Common(EmError::from(error))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Self::Common(EmError::Generic(error.to_string()))
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Self::Common(EmError::from(error))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkflowInvalid(message) => write!(f, "Workflow is invalid. {message}"),
            Self::DatatypeIncompatible {
                task,
                input,
                output,
            } => {
                write!(
                    f,
                    "Task `{task}` cannot adapt output `{output:?}` into input `{input:?}`"
                )
            }
            Self::RemoteUnavailable { url, source } => {
                write!(f, "Remote process at `{url}` is unavailable\n{source}")
            }
            Self::StatusReadFailed {
                status_location,
                attempts,
                source,
            } => {
                write!(
                    f,
                    "Could not read status document at `{status_location}` after {attempts} \
                     attempts\n{source}"
                )
            }
            Self::RemoteFailed(message) => write!(f, "Remote process failed\n{message}"),
            Self::WorkflowFailed(message) => write!(f, "Workflow failed\n{message}"),
            Self::Common(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for Error {}

impl Descriptor {
    /// Convenience used when reporting [`Error::DatatypeIncompatible`]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            Kind::Literal => "LiteralData",
            Kind::Complex => "ComplexData",
            Kind::BoundingBox => "BoundingBoxData",
        }
    }
}
