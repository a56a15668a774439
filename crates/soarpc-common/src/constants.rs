//! Error codes and transport defaults shared between clients and servers.

/// The server caught an unhandled failure while running an action or job.
pub const ERROR_CODE_SERVER_ERROR: &str = "SERVER_ERROR";

/// The requested action is not registered on the server.
pub const ERROR_CODE_UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";

/// A request or response body failed schema validation.
pub const ERROR_CODE_INVALID: &str = "INVALID";

/// An action produced a response body that failed response validation.
pub const ERROR_CODE_RESPONSE_NOT_VALID: &str = "RESPONSE_NOT_VALID";

/// The response exceeded the transport's maximum message size and the
/// client's protocol version does not support chunking.
pub const ERROR_CODE_RESPONSE_TOO_LARGE: &str = "RESPONSE_TOO_LARGE";

/// A job was interrupted by the per-request watchdog.
pub const ERROR_CODE_JOB_TIMEOUT: &str = "JOB_TIMEOUT";

/// An action was interrupted by the per-request watchdog.
pub const ERROR_CODE_ACTION_TIMEOUT: &str = "ACTION_TIMEOUT";

/// Default maximum serialized message size for client requests (100 KiB).
pub const DEFAULT_MAXIMUM_MESSAGE_BYTES_CLIENT: usize = 1024 * 100;

/// Default maximum serialized message size for server responses (250 KiB).
pub const DEFAULT_MAXIMUM_MESSAGE_BYTES_SERVER: usize = 1024 * 250;

/// Smallest permitted response-chunking threshold (100 KiB).
pub const MINIMUM_CHUNKED_MESSAGE_BYTES: usize = 1024 * 100;
