//! Lazy pull-based response futures.

use crate::errors::ClientError;
use std::time::Duration;

/// A retrievable response for a request that has already been sent.
///
/// The request goes out when the future is created; the response is
/// received when [`result`] is first called. The first call blocks up to
/// the given timeout (or the request's configured timeout) and then caches
/// whatever it got — except a receive timeout, which is returned but not
/// cached, so the caller may call [`result`] again and keep waiting.
///
/// [`result`]: FutureResponse::result
pub struct FutureResponse<T: Clone> {
    getter: Box<dyn FnMut(Option<Duration>) -> Result<T, ClientError> + Send>,
    outcome: Option<Result<T, ClientError>>,
}

impl<T: Clone> FutureResponse<T> {
    pub(crate) fn new(
        getter: impl FnMut(Option<Duration>) -> Result<T, ClientError> + Send + 'static,
    ) -> Self {
        Self { getter: Box::new(getter), outcome: None }
    }

    /// Obtains the result, blocking for the response if it has not been
    /// retrieved yet. Subsequent calls return the cached outcome and
    /// ignore `timeout`.
    pub fn result(&mut self, timeout: Option<Duration>) -> Result<T, ClientError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        match (self.getter)(timeout) {
            Err(err) if err.is_receive_timeout() => Err(err),
            outcome => {
                self.outcome = Some(outcome.clone());
                outcome
            }
        }
    }

    /// Obtains the call's error, blocking as [`result`] does. Returns
    /// `Ok(None)` when the call succeeded; a receive timeout is returned
    /// as `Err` (and, as always, not cached).
    ///
    /// [`result`]: FutureResponse::result
    pub fn exception(&mut self, timeout: Option<Duration>) -> Result<Option<ClientError>, ClientError> {
        match self.result(timeout) {
            Ok(_) => Ok(None),
            Err(err) if err.is_receive_timeout() => Err(err),
            Err(err) => Ok(Some(err)),
        }
    }

    /// Whether the outcome has been obtained (updated only by [`result`]
    /// or [`exception`]).
    ///
    /// [`result`]: FutureResponse::result
    /// [`exception`]: FutureResponse::exception
    pub fn done(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn running(&self) -> bool {
        !self.done()
    }
}
