//! Shared message model, serialization, and transport for soarpc.
//!
//! This crate holds everything both sides of an RPC conversation agree on:
//!
//! - **[`types`]**: the [`Value`] model (nested maps of primitives plus
//!   datetime/date/time/decimal/currency/bytes extension types) and the wire
//!   structures built from it — [`ActionRequest`], [`ActionResponse`],
//!   [`JobRequest`], [`JobResponse`], [`Error`], [`Context`], [`Control`].
//! - **[`serializer`]**: the pluggable body encodings — a self-describing
//!   binary msgpack encoding (preferred) and a textual JSON encoding — keyed
//!   by MIME content type.
//! - **[`transport`]**: the envelope codec (protocol versions, wire
//!   preamble, headers, response chunking) and the Redis Gateway transport
//!   (queue discipline, capacity, expiry, retries, pluggable backends).
//! - **[`logging`]**: redaction of sensitive fields before payloads reach
//!   the logs.

pub mod constants;
pub mod errors;
pub mod logging;
pub mod serializer;
pub mod transport;
pub mod types;

pub use errors::TransportError;
pub use types::{
    ActionRequest, ActionResponse, Context, Control, CurrencyAmount, Error, JobRequest,
    JobResponse, Value,
};

/// Builds a [`Value::Map`] from `"key" => value` pairs.
///
/// Values go through [`Value::from`], so primitives, strings, lists, and
/// already-built [`Value`]s all work:
///
/// ```
/// use soarpc_common::{vmap, Value};
///
/// let body = vmap! {
///     "number" => 7,
///     "label" => "seven",
///     "nested" => vmap! { "ok" => true },
/// };
/// assert!(matches!(body, Value::Map(_)));
/// ```
#[macro_export]
macro_rules! vmap {
    () => { $crate::Value::Map(::std::collections::BTreeMap::new()) };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::new();
        $( map.insert(::std::string::String::from($key), $crate::Value::from($value)); )+
        $crate::Value::Map(map)
    }};
}

/// Builds a [`Value::List`] from values convertible via [`Value::from`].
#[macro_export]
macro_rules! vlist {
    () => { $crate::Value::List(::std::vec::Vec::new()) };
    ($($value:expr),+ $(,)?) => {
        $crate::Value::List(::std::vec![ $( $crate::Value::from($value) ),+ ])
    };
}
