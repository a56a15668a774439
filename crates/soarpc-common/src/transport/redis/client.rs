//! The client half: request sends plus correlated response receives.

use crate::errors::TransportError;
use crate::transport::redis::core::RedisTransportCore;
use crate::transport::redis::RESPONSE_QUEUE_SPECIFIER;
use crate::transport::{make_queue_name, ClientTransport, ReceivedMessage};
use crate::types::Value;
use soarpc_metrics::Stopwatch;
use std::collections::BTreeMap;
use std::time::Duration;

/// Client transport over the Redis Gateway.
///
/// Each instance owns a unique ephemeral reply-to queue
/// (`service:<name>.<uuid>!`) and counts outstanding requests so a
/// response drain knows when to stop without waiting out a timeout.
pub struct RedisClientTransport {
    core: RedisTransportCore,
    send_queue: String,
    receive_queue: String,
    requests_outstanding: i64,
    previous_error_was_transport_problem: bool,
}

impl RedisClientTransport {
    pub fn new(core: RedisTransportCore, service_name: &str) -> Self {
        let send_queue = make_queue_name(service_name);
        let receive_queue = format!(
            "{}.{}{}",
            send_queue,
            uuid::Uuid::new_v4().simple(),
            RESPONSE_QUEUE_SPECIFIER
        );
        Self {
            core,
            send_queue,
            receive_queue,
            requests_outstanding: 0,
            previous_error_was_transport_problem: false,
        }
    }

    /// The number of requests sent whose responses have not been received.
    pub fn requests_outstanding(&self) -> i64 {
        self.requests_outstanding
    }
}

impl ClientTransport for RedisClientTransport {
    fn send_request_message(
        &mut self,
        request_id: u64,
        mut meta: BTreeMap<String, Value>,
        body: Value,
        message_expiry: Option<Duration>,
        expects_response: bool,
    ) -> Result<(), TransportError> {
        if expects_response {
            meta.insert("reply_to".to_owned(), Value::Str(self.receive_queue.clone()));
        }

        let watch = Stopwatch::start();
        let result =
            self.core.send_message(&self.send_queue, request_id, meta, body, message_expiry);
        watch.record(&*self.core.metrics(), "client.transport.redis_gateway.send");

        match result {
            Ok(()) => {
                // Incrementing before a failed send would make the client
                // wait forever for a response that was never requested.
                if expects_response {
                    self.requests_outstanding += 1;
                }
                Ok(())
            }
            Err(err) => {
                if err.is_transient() {
                    self.previous_error_was_transport_problem = true;
                }
                Err(err)
            }
        }
    }

    fn receive_response_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        if self.requests_outstanding <= 0 {
            self.previous_error_was_transport_problem = false;
            return Ok(None);
        }

        let watch = Stopwatch::start();
        let result = self.core.receive_message(&self.receive_queue, timeout);
        watch.record(&*self.core.metrics(), "client.transport.redis_gateway.receive");

        match result {
            Ok(message) => {
                self.requests_outstanding -= 1;
                Ok(Some(message))
            }
            Err(TransportError::ReceiveTimeout) => {
                if self.previous_error_was_transport_problem {
                    // Almost certainly recovering from a failover; the
                    // outstanding requests are gone with the old master.
                    self.requests_outstanding = 0;
                    self.previous_error_was_transport_problem = false;
                }
                Err(TransportError::ReceiveTimeout)
            }
            Err(err) => {
                if err.is_transient() {
                    self.previous_error_was_transport_problem = true;
                }
                Err(err)
            }
        }
    }
}
