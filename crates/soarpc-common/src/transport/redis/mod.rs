//! The Redis Gateway transport.
//!
//! Requests travel over a per-service ingress list (`service:<name>`) and
//! responses over a per-client ephemeral reply-to list
//! (`service:<name>.<client-uuid>!`). Sends are capacity-checked `RPUSH`es
//! with key expiry; receives are `BLPOP`s with a deadline. The backend —
//! standalone, sentinel-managed, or in-memory — is pluggable.

pub mod backend;
mod client;
mod core;
mod server;
mod settings;

pub use self::core::{RedisTransportCore, RedisTransportCoreBuilder, Side};
pub use backend::{
    BackendError, MemoryBackend, RedisBackend, SentinelRedisBackend, StandardRedisBackend,
    BACKEND_TYPE_SENTINEL, BACKEND_TYPE_STANDARD, RESPONSE_QUEUE_SPECIFIER,
};
pub use client::RedisClientTransport;
pub use server::RedisServerTransport;
pub use settings::RedisTransportSettings;
