//! The soarpc client engine.
//!
//! A [`Client`] bundles named actions into jobs, dispatches them over the
//! configured transport, and correlates responses by request id. It
//! supports blocking calls ([`Client::call_action`],
//! [`Client::call_actions`]), parallel dispatch
//! ([`Client::call_actions_parallel`], [`Client::call_jobs_parallel`]),
//! future-style variants of all of the above, raw send/receive
//! ([`Client::send_request`], [`Client::get_all_responses`]), and
//! post-response object expansion.
//!
//! # Example
//!
//! ```no_run
//! use soarpc_client::{CallOptions, Client, ClientConfig};
//! use soarpc_common::transport::redis::RedisTransportSettings;
//! use soarpc_common::vmap;
//! use std::collections::HashMap;
//!
//! let config = HashMap::from([(
//!     "example".to_owned(),
//!     ClientConfig::redis(RedisTransportSettings::default()),
//! )]);
//! let client = Client::new(config);
//!
//! let response = client
//!     .call_action("example", "square", vmap! { "number" => 7 }, &CallOptions::default())
//!     .unwrap();
//! assert_eq!(response.body.get("square").and_then(|v| v.as_i64()), Some(49));
//! ```

mod client;
mod errors;
mod expander;
mod future;
mod middleware;

pub use client::{
    CallOptions, Client, ClientConfig, ClientTransportFactory, Job, JobResult, ResponsesIter,
    ServiceHandler, TransportConfig,
};
pub use errors::ClientError;
pub use expander::{ExpansionSettings, Expansions, TypeExpansionSettings, TypeRoute};
pub use future::FutureResponse;
pub use middleware::{ClientMiddleware, ReceiveResponseNext, SendRequestNext};
