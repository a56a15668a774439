//! Action registration records.
//!
//! An action is registered as a handler callable plus metadata: a
//! description for introspection and optional request/response validators.
//! The engine, not the handler, assembles the final
//! [`soarpc_common::ActionResponse`], so a handler only produces (or fails
//! to produce) a response body.

use crate::errors::ActionError;
use crate::types::EnrichedActionRequest;
use soarpc_common::{Error, Value};
use std::sync::Arc;

/// An action handler: takes the enriched request, returns the response
/// body or errors.
pub type ActionHandler =
    Arc<dyn Fn(&EnrichedActionRequest) -> Result<Value, ActionError> + Send + Sync>;

/// Validates a request or response body, producing field-addressed wire
/// errors on failure. The schema engine behind this contract is external;
/// [`Validator::describe`] exposes whatever schema representation it has
/// for introspection.
pub trait Validator: Send + Sync {
    fn errors(&self, body: &Value) -> Vec<Error>;

    /// A serializable description of the expected shape, for the
    /// `introspect` action.
    fn describe(&self) -> Value {
        Value::Null
    }
}

/// Everything the server knows about one registered action.
#[derive(Clone)]
pub struct ActionRegistration {
    pub handler: ActionHandler,
    pub description: String,
    pub request_validator: Option<Arc<dyn Validator>>,
    pub response_validator: Option<Arc<dyn Validator>>,
}

impl ActionRegistration {
    pub fn new(
        handler: impl Fn(&EnrichedActionRequest) -> Result<Value, ActionError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            description: String::new(),
            request_validator: None,
            response_validator: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_request_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.request_validator = Some(validator);
        self
    }

    pub fn with_response_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.response_validator = Some(validator);
        self
    }
}
