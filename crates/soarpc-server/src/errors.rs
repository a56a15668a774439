//! Errors at the handler and server boundaries.

use soarpc_common::{Error, TransportError};
use thiserror::Error as ThisError;

/// Returned by an action handler (or action middleware) to fail the
/// action with wire errors. The engine converts it into an
/// [`soarpc_common::ActionResponse`] carrying these errors.
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("action failed with {} error(s)", errors.len())]
pub struct ActionError {
    pub errors: Vec<Error>,
}

impl ActionError {
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn single(error: Error) -> Self {
        Self { errors: vec![error] }
    }
}

impl From<Error> for ActionError {
    fn from(error: Error) -> Self {
        Self::single(error)
    }
}

/// Fails the entire job with job-level wire errors.
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("job failed with {} error(s)", errors.len())]
pub struct JobError {
    pub errors: Vec<Error>,
}

impl JobError {
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

/// Failures constructing or running a server.
#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid server configuration: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
