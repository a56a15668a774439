//! Server middleware: an onion around job processing and action dispatch.
//!
//! Composition mirrors the client side: middleware `M1..Mn` around a base
//! callable `B` runs as `M1(M2(…Mn(B)))`. The job hook wraps the whole
//! job; the action hook wraps each individual action. Either may
//! short-circuit by not calling `next`.

use crate::errors::ActionError;
use crate::types::{EnrichedActionRequest, EnrichedJobRequest};
use soarpc_common::{ActionResponse, JobResponse};
use std::sync::Arc;

/// Wraps the server's job and action processing.
///
/// Both hooks default to passing straight through.
pub trait ServerMiddleware: Send + Sync {
    /// Wraps the processing of one whole job.
    fn job(&self, request: &EnrichedJobRequest, next: JobNext<'_>) -> JobResponse {
        next.call(request)
    }

    /// Wraps the dispatch of one action to its handler.
    fn action(
        &self,
        request: &EnrichedActionRequest,
        next: ActionNext<'_>,
    ) -> Result<ActionResponse, ActionError> {
        next.call(request)
    }
}

/// The remainder of the job onion below the current middleware.
#[derive(Clone, Copy)]
pub struct JobNext<'a> {
    middleware: &'a [Arc<dyn ServerMiddleware>],
    base: &'a dyn Fn(&EnrichedJobRequest) -> JobResponse,
}

impl<'a> JobNext<'a> {
    pub(crate) fn new(
        middleware: &'a [Arc<dyn ServerMiddleware>],
        base: &'a dyn Fn(&EnrichedJobRequest) -> JobResponse,
    ) -> Self {
        Self { middleware, base }
    }

    pub fn call(self, request: &EnrichedJobRequest) -> JobResponse {
        match self.middleware.split_first() {
            Some((layer, rest)) => {
                layer.job(request, JobNext { middleware: rest, base: self.base })
            }
            None => (self.base)(request),
        }
    }
}

/// The remainder of the action onion below the current middleware.
#[derive(Clone, Copy)]
pub struct ActionNext<'a> {
    middleware: &'a [Arc<dyn ServerMiddleware>],
    base: &'a dyn Fn(&EnrichedActionRequest) -> Result<ActionResponse, ActionError>,
}

impl<'a> ActionNext<'a> {
    pub(crate) fn new(
        middleware: &'a [Arc<dyn ServerMiddleware>],
        base: &'a dyn Fn(&EnrichedActionRequest) -> Result<ActionResponse, ActionError>,
    ) -> Self {
        Self { middleware, base }
    }

    pub fn call(self, request: &EnrichedActionRequest) -> Result<ActionResponse, ActionError> {
        match self.middleware.split_first() {
            Some((layer, rest)) => {
                layer.action(request, ActionNext { middleware: rest, base: self.base })
            }
            None => (self.base)(request),
        }
    }
}
