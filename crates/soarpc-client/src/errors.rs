//! Errors raised by the client engine.

use soarpc_common::{ActionResponse, Error, TransportError};
use thiserror::Error;

/// Everything a `call_*` method can fail with.
///
/// All variants are `Clone` so futures can cache an outcome and re-yield
/// it on every subsequent result retrieval.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The job response carried job-level errors.
    #[error("job errors: {0:?}")]
    JobError(Vec<Error>),

    /// One or more action responses carried errors.
    #[error("errors in {} action response(s)", .0.len())]
    CallActionError(Vec<ActionResponse>),

    /// No settings were configured for the named service.
    #[error("unrecognized service name {0:?}")]
    ImproperlyConfigured(String),

    /// An expansion request named a type or expansion that is not
    /// configured.
    #[error("invalid key in expansion request: {0}")]
    InvalidExpansionKey(String),

    /// The response drain finished without yielding the awaited response.
    #[error("no response received for request {0}")]
    MissingResponse(u64),
}

impl ClientError {
    /// Whether this is a receive timeout, which futures deliberately do
    /// not cache so the caller can retry.
    pub fn is_receive_timeout(&self) -> bool {
        matches!(self, ClientError::Transport(t) if t.is_receive_timeout())
    }

    /// The job-level errors, if this is a [`ClientError::JobError`].
    pub fn job_errors(&self) -> Option<&[Error]> {
        match self {
            ClientError::JobError(errors) => Some(errors),
            _ => None,
        }
    }

    /// The failed action responses, if this is a
    /// [`ClientError::CallActionError`].
    pub fn error_actions(&self) -> Option<&[ActionResponse]> {
        match self {
            ClientError::CallActionError(actions) => Some(actions),
            _ => None,
        }
    }
}
