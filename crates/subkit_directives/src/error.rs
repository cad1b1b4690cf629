//! Errors raised by the built-in directives.

use subkit_core::TemplateError;
use subkit_runtime::{LoadError, PubSubError, ResolverError};
use thiserror::Error;

/// A failed directive.
#[derive(Debug, Error)]
pub enum DirectiveError {
    /// The upstream answered with a 4xx or 5xx status.
    #[error("{reason}")]
    Status { status: u16, reason: String },

    /// The request could not be sent or its body could not be read.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A header name or value is not valid HTTP.
    #[error("invalid header \"{0}\"")]
    InvalidHeader(String),

    /// The command could not be started.
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command exited unsuccessfully.
    #[error("command failed with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// The command wrote to stderr.
    #[error("{0}")]
    Stderr(String),

    /// The command did not finish in time.
    #[error("command timed out after {0}ms")]
    Timeout(u128),

    /// A batched call did not return one entry per key.
    #[error("batched result must be an array of {expected} entries, found {found}")]
    BatchShape { expected: usize, found: String },

    #[error("expected a list or an object, found {0}")]
    NotACollection(String),

    #[error("expected an object, found {0}")]
    NotAnObject(String),

    #[error("no publish/subscribe bus is available on the context")]
    NoBus,

    /// The event stream answered with something other than events.
    #[error("event stream failed: {0}")]
    EventStream(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Publish(#[from] PubSubError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl From<DirectiveError> for ResolverError {
    fn from(error: DirectiveError) -> Self {
        ResolverError::Custom(error.to_string())
    }
}
