//! The server half: ingress receives plus reply-to-addressed sends.

use crate::errors::TransportError;
use crate::transport::redis::core::RedisTransportCore;
use crate::transport::{make_queue_name, ReceivedMessage, ServerTransport};
use crate::types::Value;
use soarpc_metrics::Stopwatch;
use std::collections::BTreeMap;
use std::time::Duration;

/// Server transport over the Redis Gateway, bound to one service's
/// ingress queue.
pub struct RedisServerTransport {
    core: RedisTransportCore,
    receive_queue: String,
}

impl RedisServerTransport {
    pub fn new(core: RedisTransportCore, service_name: &str) -> Self {
        Self { core, receive_queue: make_queue_name(service_name) }
    }
}

impl ServerTransport for RedisServerTransport {
    fn receive_request_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        match self.core.receive_message(&self.receive_queue, timeout) {
            Ok(message) => Ok(Some(message)),
            Err(TransportError::ReceiveTimeout) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn send_response_message(
        &mut self,
        request_id: u64,
        mut meta: BTreeMap<String, Value>,
        body: Value,
    ) -> Result<(), TransportError> {
        let reply_to = match meta.remove("reply_to") {
            Some(Value::Str(reply_to)) => reply_to,
            _ => {
                self.core
                    .metrics()
                    .increment("server.transport.redis_gateway.send.error.missing_reply_queue");
                return Err(TransportError::InvalidMessage(
                    "missing reply queue name".to_owned(),
                ));
            }
        };
        // The request's stale expiry must not cap the response's lifetime.
        meta.remove("__expiry__");

        let watch = Stopwatch::start();
        let result = self.core.send_message(&reply_to, request_id, meta, body, None);
        watch.record(&*self.core.metrics(), "server.transport.redis_gateway.send");
        result
    }
}
