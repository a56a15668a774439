//! The send and receive paths shared by both halves of the transport.

use crate::constants::{DEFAULT_MAXIMUM_MESSAGE_BYTES_CLIENT, MINIMUM_CHUNKED_MESSAGE_BYTES};
use crate::errors::TransportError;
use crate::logging::Redactor;
use crate::serializer::{self, Serializer};
use crate::transport::envelope::{self, Headers, ProtocolVersion};
use crate::transport::redis::backend::RedisBackend;
use crate::transport::ReceivedMessage;
use crate::types::Value;
use rand::Rng;
use soarpc_metrics::{MetricsRecorder, NoopMetrics};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which half of the conversation this core serves. The server side may
/// chunk responses; the client side may receive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn metric_prefix(self) -> &'static str {
        match self {
            Side::Client => "client.transport.redis_gateway",
            Side::Server => "server.transport.redis_gateway",
        }
    }
}

/// Queue discipline over a [`RedisBackend`]: serialization, size limits,
/// chunking, expiry, capacity retries, and header handling.
pub struct RedisTransportCore {
    backend: Arc<dyn RedisBackend>,
    serializer: Arc<dyn Serializer>,
    metrics: Arc<dyn MetricsRecorder>,
    redactor: Redactor,
    service_name: String,
    side: Side,
    maximum_message_size_in_bytes: usize,
    log_messages_larger_than_bytes: Option<usize>,
    chunk_messages_larger_than_bytes: Option<usize>,
    message_expiry: Duration,
    queue_capacity: u64,
    queue_full_retries: u32,
    receive_timeout: Duration,
    protocol_version: ProtocolVersion,
}

/// Builder for [`RedisTransportCore`]; unset knobs take the documented
/// defaults.
pub struct RedisTransportCoreBuilder {
    core: RedisTransportCore,
}

impl RedisTransportCoreBuilder {
    pub fn new(backend: Arc<dyn RedisBackend>, service_name: &str, side: Side) -> Self {
        Self {
            core: RedisTransportCore {
                backend,
                serializer: serializer::default_serializer(),
                metrics: Arc::new(NoopMetrics),
                redactor: Redactor::default(),
                service_name: service_name.to_owned(),
                side,
                maximum_message_size_in_bytes: DEFAULT_MAXIMUM_MESSAGE_BYTES_CLIENT,
                log_messages_larger_than_bytes: None,
                chunk_messages_larger_than_bytes: None,
                message_expiry: Duration::from_secs(60),
                queue_capacity: 10_000,
                queue_full_retries: 10,
                receive_timeout: Duration::from_secs(5),
                protocol_version: ProtocolVersion::V3,
            },
        }
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.core.serializer = serializer;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.core.metrics = metrics;
        self
    }

    pub fn redactor(mut self, redactor: Redactor) -> Self {
        self.core.redactor = redactor;
        self
    }

    pub fn maximum_message_size(mut self, bytes: usize) -> Self {
        self.core.maximum_message_size_in_bytes = bytes;
        self
    }

    pub fn log_messages_larger_than(mut self, bytes: Option<usize>) -> Self {
        self.core.log_messages_larger_than_bytes = bytes;
        self
    }

    /// Enables response chunking above `bytes`. Only meaningful on the
    /// server side.
    pub fn chunk_messages_larger_than(mut self, bytes: Option<usize>) -> Self {
        self.core.chunk_messages_larger_than_bytes = bytes;
        self
    }

    pub fn message_expiry(mut self, expiry: Duration) -> Self {
        self.core.message_expiry = expiry;
        self
    }

    pub fn queue_capacity(mut self, capacity: u64) -> Self {
        self.core.queue_capacity = capacity;
        self
    }

    pub fn queue_full_retries(mut self, retries: u32) -> Self {
        self.core.queue_full_retries = retries;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.core.receive_timeout = timeout;
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.core.protocol_version = version;
        self
    }

    pub fn build(self) -> Result<RedisTransportCore, TransportError> {
        if let Some(threshold) = self.core.chunk_messages_larger_than_bytes {
            if threshold < MINIMUM_CHUNKED_MESSAGE_BYTES {
                return Err(TransportError::InvalidMessage(format!(
                    "chunk_messages_larger_than_bytes must be at least {}, got {}",
                    MINIMUM_CHUNKED_MESSAGE_BYTES, threshold
                )));
            }
            if self.core.maximum_message_size_in_bytes < threshold * 5 {
                return Err(TransportError::InvalidMessage(
                    "maximum_message_size_in_bytes must be at least 5 times \
                     chunk_messages_larger_than_bytes to leave room for chunks"
                        .to_owned(),
                ));
            }
        }
        Ok(self.core)
    }
}

fn epoch_seconds_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RedisTransportCore {
    pub fn builder(
        backend: Arc<dyn RedisBackend>,
        service_name: &str,
        side: Side,
    ) -> RedisTransportCoreBuilder {
        RedisTransportCoreBuilder::new(backend, service_name, side)
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn metrics(&self) -> Arc<dyn MetricsRecorder> {
        self.metrics.clone()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn metric(&self, name: &str) -> String {
        format!("{}.{}", self.side.metric_prefix(), name)
    }

    /// Sends one envelope to `queue_key`, retrying on a full queue with
    /// exponential backoff.
    pub fn send_message(
        &self,
        queue_key: &str,
        request_id: u64,
        mut meta: BTreeMap<String, Value>,
        body: Value,
        message_expiry: Option<Duration>,
    ) -> Result<(), TransportError> {
        let (expiry_epoch, redis_expiry) = match message_expiry {
            Some(expiry) => {
                // Leave the broker key alive a little longer than the
                // message so late consumers observe the expiry themselves.
                (epoch_seconds_now() + expiry.as_secs_f64(), expiry.as_secs() + 10)
            }
            None => (
                epoch_seconds_now() + self.message_expiry.as_secs_f64(),
                self.message_expiry.as_secs(),
            ),
        };

        // Respond with the protocol version and encoding the peer spoke,
        // when the receive path recorded them in the meta map.
        let version = meta
            .remove("protocol_version")
            .and_then(|v| v.as_u64())
            .and_then(ProtocolVersion::from_number)
            .unwrap_or(self.protocol_version);
        let serializer = meta
            .remove("content_type")
            .and_then(|v| v.as_str().and_then(serializer::resolve))
            .unwrap_or_else(|| self.serializer.clone());

        meta.insert("__expiry__".to_owned(), Value::Float(expiry_epoch));

        let mut envelope_map = BTreeMap::new();
        envelope_map.insert("request_id".to_owned(), Value::Int(request_id as i64));
        envelope_map.insert("meta".to_owned(), Value::Map(meta));
        envelope_map.insert("body".to_owned(), body);
        let envelope_value = Value::Map(envelope_map);

        let serialized = serializer.encode(&envelope_value)?;
        let message_size = serialized.len();
        self.metrics.observe(&self.metric("send.message_size"), message_size as f64);

        if message_size > self.maximum_message_size_in_bytes {
            self.metrics.increment(&self.metric("send.error.message_too_large"));
            return Err(TransportError::MessageTooLarge {
                size: message_size,
                maximum: self.maximum_message_size_in_bytes,
            });
        }

        if let Some(threshold) = self.log_messages_larger_than_bytes {
            if message_size > threshold {
                tracing::warn!(
                    service = %self.service_name,
                    serialized_length_in_bytes = message_size,
                    threshold = threshold,
                    message = %self.redactor.describe(&envelope_value),
                    "oversized message sent"
                );
            }
        }

        let chunk_size = self
            .chunk_messages_larger_than_bytes
            .filter(|threshold| {
                self.side == Side::Server
                    && message_size > *threshold
                    && version.supports_chunking()
            });
        let frames =
            envelope::build_frames(version, serializer.mime_type(), &serialized, chunk_size);
        if frames.len() > 1 {
            self.metrics.observe(&self.metric("send.chunk_count"), frames.len() as f64);
        }

        for frame in frames {
            self.enqueue_with_retries(queue_key, &frame, redis_expiry)?;
        }
        Ok(())
    }

    fn enqueue_with_retries(
        &self,
        queue_key: &str,
        frame: &[u8],
        redis_expiry: u64,
    ) -> Result<(), TransportError> {
        for attempt in 0..=self.queue_full_retries {
            if attempt > 0 {
                let jitter: f64 = rand::thread_rng().gen();
                let backoff = ((1u64 << (attempt - 1).min(16)) as f64 + jitter) / 4.0;
                std::thread::sleep(Duration::from_secs_f64(backoff));
                self.metrics.increment(&self.metric("send.queue_full_retry"));
            }
            match self.backend.enqueue(queue_key, frame, redis_expiry, self.queue_capacity) {
                Ok(()) => return Ok(()),
                Err(super::backend::BackendError::QueueFull) => continue,
                Err(super::backend::BackendError::Connection(message)) => {
                    self.metrics.increment(&self.metric("send.error.connection"));
                    return Err(TransportError::Connection(message));
                }
                Err(super::backend::BackendError::Operation(message)) => {
                    self.metrics.increment(&self.metric("send.error.unknown"));
                    return Err(TransportError::SendFailure(format!(
                        "error sending message for service {}: {}",
                        self.service_name, message
                    )));
                }
            }
        }
        self.metrics.increment(&self.metric("send.error.redis_queue_full"));
        Err(TransportError::QueueFull {
            queue: queue_key.to_owned(),
            retries: self.queue_full_retries,
        })
    }

    fn pop_frame(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let frame = match self.backend.blocking_pop(queue_key, timeout) {
            Ok(frame) => frame,
            Err(super::backend::BackendError::Connection(message)) => {
                self.metrics.increment(&self.metric("receive.error.connection"));
                return Err(TransportError::Connection(message));
            }
            Err(err) => {
                self.metrics.increment(&self.metric("receive.error.unknown"));
                return Err(TransportError::ReceiveFailure(format!(
                    "error receiving message for service {}: {}",
                    self.service_name, err
                )));
            }
        };
        frame.ok_or(TransportError::ReceiveTimeout)
    }

    /// Receives one envelope from `queue_key`, reassembling chunked
    /// responses and discarding expired messages.
    pub fn receive_message(
        &self,
        queue_key: &str,
        timeout: Option<Duration>,
    ) -> Result<ReceivedMessage, TransportError> {
        let timeout = timeout.unwrap_or(self.receive_timeout);
        let frame = self.pop_frame(queue_key, timeout)?;

        let (version, rest) = ProtocolVersion::extract(&frame)?;
        let (headers, payload) = envelope::extract_headers(rest);
        let serializer = headers
            .content_type
            .as_deref()
            .and_then(serializer::resolve)
            .unwrap_or_else(|| self.serializer.clone());

        let serialized = if headers.chunk_count.is_some() {
            self.reassemble_chunks(queue_key, timeout, &headers, payload)?
        } else {
            payload.to_vec()
        };

        let envelope_value = serializer.decode(&serialized)?;

        let expiry = envelope_value
            .get("meta")
            .and_then(|meta| meta.get("__expiry__"))
            .and_then(Value::as_f64);
        if let Some(expiry) = expiry {
            if expiry < epoch_seconds_now() {
                self.metrics.increment(&self.metric("receive.error.message_expired"));
                return Err(TransportError::ReceiveTimeout);
            }
        }

        let request_id = envelope_value
            .get("request_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                self.metrics.increment(&self.metric("receive.error.no_request_id"));
                TransportError::InvalidMessage(format!(
                    "no request id for service {}",
                    self.service_name
                ))
            })?;

        let mut meta = envelope_value
            .get("meta")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        meta.insert("protocol_version".to_owned(), Value::Int(version.number() as i64));
        meta.insert(
            "content_type".to_owned(),
            Value::Str(serializer.mime_type().to_owned()),
        );

        let body = envelope_value.get("body").cloned().unwrap_or(Value::Null);

        Ok(ReceivedMessage { request_id, meta, body })
    }

    fn reassemble_chunks(
        &self,
        queue_key: &str,
        timeout: Duration,
        first_headers: &Headers,
        first_payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if self.side == Side::Server {
            return Err(TransportError::InvalidMessage(
                "chunked requests are not supported".to_owned(),
            ));
        }
        let chunk_count =
            first_headers.chunk_count.expect("caller checked chunk_count presence");
        let first_id = first_headers.chunk_id.ok_or_else(|| {
            TransportError::ReceiveFailure("chunked response missing chunk id".to_owned())
        })?;
        if first_id != 1 {
            return Err(TransportError::ReceiveFailure(format!(
                "chunk gap: first chunk has id {} instead of 1",
                first_id
            )));
        }

        let mut assembled = first_payload.to_vec();
        for expected_id in 2..=chunk_count {
            let frame = self.pop_frame(queue_key, timeout).map_err(|err| {
                if err.is_receive_timeout() {
                    TransportError::ReceiveFailure(format!(
                        "chunk gap: chunk {} of {} never arrived",
                        expected_id, chunk_count
                    ))
                } else {
                    err
                }
            })?;
            let (_, rest) = ProtocolVersion::extract(&frame)?;
            let (headers, payload) = envelope::extract_headers(rest);

            let (Some(count), Some(id)) = (headers.chunk_count, headers.chunk_id) else {
                return Err(TransportError::ReceiveFailure(format!(
                    "chunk gap: chunk {} of {} is missing chunk headers",
                    expected_id, chunk_count
                )));
            };
            if count != chunk_count {
                return Err(TransportError::ReceiveFailure(format!(
                    "chunk gap: chunk count changed from {} to {}",
                    chunk_count, count
                )));
            }
            if id != expected_id {
                return Err(TransportError::ReceiveFailure(format!(
                    "chunk gap: received chunk {} while expecting {} of {}",
                    id, expected_id, chunk_count
                )));
            }
            assembled.extend_from_slice(payload);
        }
        Ok(assembled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::redis::backend::MemoryBackend;
    use crate::vmap;

    fn core_pair(backend: Arc<MemoryBackend>) -> (RedisTransportCore, RedisTransportCore) {
        let client = RedisTransportCore::builder(backend.clone(), "example", Side::Client)
            .receive_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let server = RedisTransportCore::builder(backend, "example", Side::Server)
            .receive_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        (client, server)
    }

    #[test]
    fn test_send_receive_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let (client, server) = core_pair(backend);

        let meta = BTreeMap::from([(
            "reply_to".to_owned(),
            Value::Str("service:example.abc!".to_owned()),
        )]);
        let body = vmap! { "actions" => crate::vlist![] };
        client.send_message("service:example", 42, meta, body.clone(), None).unwrap();

        let received = server.receive_message("service:example", None).unwrap();
        assert_eq!(received.request_id, 42);
        assert_eq!(received.body, body);
        assert_eq!(
            received.meta.get("reply_to").and_then(Value::as_str),
            Some("service:example.abc!")
        );
        assert_eq!(received.meta.get("protocol_version").and_then(Value::as_i64), Some(3));
    }

    #[test]
    fn test_receive_times_out_when_queue_is_empty() {
        let backend = Arc::new(MemoryBackend::new());
        let (client, _) = core_pair(backend);
        let result = client.receive_message("service:example.abc!", None);
        assert!(matches!(result, Err(TransportError::ReceiveTimeout)));
    }

    #[test]
    fn test_expired_message_is_discarded() {
        let backend = Arc::new(MemoryBackend::new());
        let (client, server) = core_pair(backend);

        client
            .send_message(
                "service:example",
                7,
                BTreeMap::new(),
                vmap! {},
                Some(Duration::from_secs(0)),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let result = server.receive_message("service:example", None);
        assert!(matches!(result, Err(TransportError::ReceiveTimeout)));
    }

    #[test]
    fn test_message_over_maximum_size_is_rejected_before_any_send() {
        let backend = Arc::new(MemoryBackend::new());
        let core = RedisTransportCore::builder(backend.clone(), "example", Side::Client)
            .maximum_message_size(64)
            .build()
            .unwrap();

        let body = vmap! { "filler" => "x".repeat(256) };
        let result = core.send_message("service:example", 1, BTreeMap::new(), body, None);
        assert!(matches!(result, Err(TransportError::MessageTooLarge { .. })));
        assert_eq!(backend.queue_len("service:example"), 0);
    }

    #[test]
    fn test_queue_full_retries_then_fails() {
        let backend = Arc::new(MemoryBackend::new());
        // Fill the queue to capacity 2.
        backend.enqueue("service:example", b"a", 60, 2).unwrap();
        backend.enqueue("service:example", b"b", 60, 2).unwrap();

        let core = RedisTransportCore::builder(backend, "example", Side::Client)
            .queue_capacity(2)
            .queue_full_retries(1)
            .build()
            .unwrap();
        let result =
            core.send_message("service:example", 1, BTreeMap::new(), vmap! {}, None);
        assert!(
            matches!(result, Err(TransportError::QueueFull { retries: 1, .. })),
            "got {:?}",
            result
        );
    }

    #[test]
    fn test_queue_drains_during_retries() {
        let backend = Arc::new(MemoryBackend::new());
        backend.enqueue("service:example", b"a", 60, 1).unwrap();

        let core = Arc::new(
            RedisTransportCore::builder(backend.clone(), "example", Side::Client)
                .queue_capacity(1)
                .queue_full_retries(3)
                .build()
                .unwrap(),
        );
        let drainer = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                backend.blocking_pop("service:example", Duration::from_millis(10)).unwrap();
            })
        };
        core.send_message("service:example", 1, BTreeMap::new(), vmap! {}, None).unwrap();
        drainer.join().unwrap();
        assert_eq!(backend.queue_len("service:example"), 1);
    }

    #[test]
    fn test_chunked_response_reassembles_to_original() {
        let backend = Arc::new(MemoryBackend::new());
        let server = RedisTransportCore::builder(backend.clone(), "example", Side::Server)
            .maximum_message_size(1024 * 1024)
            .chunk_messages_larger_than(Some(MINIMUM_CHUNKED_MESSAGE_BYTES))
            .receive_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let client = RedisTransportCore::builder(backend.clone(), "example", Side::Client)
            .maximum_message_size(1024 * 1024)
            .receive_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        // ~310 KiB of payload forces several chunks at the 100 KiB threshold.
        let body = vmap! { "blob" => "y".repeat(310 * 1024) };
        let meta = BTreeMap::from([
            ("protocol_version".to_owned(), Value::Int(3)),
        ]);
        server.send_message("service:example.abc!", 9, meta, body.clone(), None).unwrap();
        assert!(backend.queue_len("service:example.abc!") > 1);

        let received = client.receive_message("service:example.abc!", None).unwrap();
        assert_eq!(received.request_id, 9);
        assert_eq!(received.body, body);
        assert_eq!(backend.queue_len("service:example.abc!"), 0);
    }

    #[test]
    fn test_version_two_peer_gets_unchunked_response() {
        let backend = Arc::new(MemoryBackend::new());
        let server = RedisTransportCore::builder(backend.clone(), "example", Side::Server)
            .maximum_message_size(1024 * 1024)
            .chunk_messages_larger_than(Some(MINIMUM_CHUNKED_MESSAGE_BYTES))
            .build()
            .unwrap();

        let body = vmap! { "blob" => "z".repeat(150 * 1024) };
        let meta = BTreeMap::from([("protocol_version".to_owned(), Value::Int(2))]);
        server.send_message("service:example.abc!", 3, meta, body, None).unwrap();
        assert_eq!(backend.queue_len("service:example.abc!"), 1);
    }

    #[test]
    fn test_chunk_gap_fails_the_response() {
        let backend = Arc::new(MemoryBackend::new());
        let client = RedisTransportCore::builder(backend.clone(), "example", Side::Client)
            .receive_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        // Hand-build a first chunk claiming three chunks, then nothing else.
        let mut frame = ProtocolVersion::V3.preamble();
        frame.extend_from_slice(b"content-type:application/msgpack;");
        frame.extend_from_slice(b"chunk-count:3;chunk-id:1;");
        frame.extend_from_slice(&[0x81]);
        backend.enqueue("service:example.abc!", &frame, 60, 100).unwrap();

        let result = client.receive_message("service:example.abc!", None);
        match result {
            Err(TransportError::ReceiveFailure(message)) => {
                assert!(message.contains("chunk gap"), "got {}", message);
            }
            other => panic!("expected a chunk-gap failure, got {:?}", other),
        }
    }

    #[test]
    fn test_builder_rejects_small_chunk_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let result = RedisTransportCore::builder(backend, "example", Side::Server)
            .chunk_messages_larger_than(Some(1024))
            .build();
        assert!(result.is_err());
    }
}
