//! Transport contracts and the Redis Gateway implementation.
//!
//! A transport moves framed envelopes between a client and the single
//! service it is bound to. The client side sends requests and receives
//! correlated responses on its own reply-to queue; the server side receives
//! requests from the service's ingress queue and sends responses to
//! whatever reply-to queue each request named.

pub mod envelope;
pub mod redis;

use crate::errors::TransportError;
use crate::types::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A decoded message as handed to the engine: the envelope's request id,
/// its meta map, and the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub request_id: u64,
    pub meta: BTreeMap<String, Value>,
    pub body: Value,
}

/// The client half of a transport, bound to one service.
pub trait ClientTransport: Send {
    /// Sends a request envelope.
    ///
    /// When `expects_response` is false (`suppress_response` jobs), no
    /// reply-to queue is attached and no response slot is allocated.
    fn send_request_message(
        &mut self,
        request_id: u64,
        meta: BTreeMap<String, Value>,
        body: Value,
        message_expiry: Option<Duration>,
        expects_response: bool,
    ) -> Result<(), TransportError>;

    /// Receives the next response, blocking up to `timeout` (or the
    /// transport's configured receive timeout).
    ///
    /// Returns `Ok(None)` when no responses are outstanding, which is how
    /// a response drain knows to stop. A timeout with responses still
    /// outstanding is an error.
    fn receive_response_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, TransportError>;
}

/// The server half of a transport, bound to one service's ingress queue.
pub trait ServerTransport: Send {
    /// Receives the next request, blocking up to `timeout` (or the
    /// transport's configured receive timeout). `Ok(None)` means no
    /// request arrived within the deadline.
    fn receive_request_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, TransportError>;

    /// Sends a response envelope to the reply-to queue named in `meta`.
    fn send_response_message(
        &mut self,
        request_id: u64,
        meta: BTreeMap<String, Value>,
        body: Value,
    ) -> Result<(), TransportError>;
}

/// The ingress queue key for a service.
pub fn make_queue_name(service_name: &str) -> String {
    format!("service:{}", service_name)
}
