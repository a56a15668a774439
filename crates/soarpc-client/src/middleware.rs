//! Client middleware: an onion of wrappers around the send and receive
//! paths.
//!
//! Given middleware `M1..Mn` and a base operation `B`, the effective call
//! is `M1(M2(…Mn(B)))`. A middleware may inspect or modify what passes
//! through, short-circuit by returning without calling `next`, or fail.
//! The stack is assembled once per service handler.

use crate::errors::ClientError;
use soarpc_common::{JobRequest, JobResponse, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Wraps the client's send and receive operations.
///
/// Both hooks default to passing straight through.
pub trait ClientMiddleware: Send + Sync {
    /// Wraps the sending of one job request.
    fn send_request(
        &self,
        request_id: u64,
        meta: &mut BTreeMap<String, Value>,
        request: &JobRequest,
        next: SendRequestNext<'_>,
    ) -> Result<(), ClientError> {
        next.call(request_id, meta, request)
    }

    /// Wraps the receipt of one job response. `Ok(None)` means no more
    /// responses are outstanding.
    fn receive_response(
        &self,
        timeout: Option<Duration>,
        next: ReceiveResponseNext<'_>,
    ) -> Result<Option<(u64, JobResponse)>, ClientError> {
        next.call(timeout)
    }
}

/// The remainder of the send onion below the current middleware.
#[derive(Clone, Copy)]
pub struct SendRequestNext<'a> {
    middleware: &'a [Arc<dyn ClientMiddleware>],
    base: &'a dyn Fn(
        u64,
        &mut BTreeMap<String, Value>,
        &JobRequest,
    ) -> Result<(), ClientError>,
}

impl<'a> SendRequestNext<'a> {
    pub(crate) fn new(
        middleware: &'a [Arc<dyn ClientMiddleware>],
        base: &'a dyn Fn(
            u64,
            &mut BTreeMap<String, Value>,
            &JobRequest,
        ) -> Result<(), ClientError>,
    ) -> Self {
        Self { middleware, base }
    }

    /// Invokes the next layer (or the base send at the bottom).
    pub fn call(
        self,
        request_id: u64,
        meta: &mut BTreeMap<String, Value>,
        request: &JobRequest,
    ) -> Result<(), ClientError> {
        match self.middleware.split_first() {
            Some((layer, rest)) => layer.send_request(
                request_id,
                meta,
                request,
                SendRequestNext { middleware: rest, base: self.base },
            ),
            None => (self.base)(request_id, meta, request),
        }
    }
}

/// The remainder of the receive onion below the current middleware.
#[derive(Clone, Copy)]
pub struct ReceiveResponseNext<'a> {
    middleware: &'a [Arc<dyn ClientMiddleware>],
    base: &'a dyn Fn(Option<Duration>) -> Result<Option<(u64, JobResponse)>, ClientError>,
}

impl<'a> ReceiveResponseNext<'a> {
    pub(crate) fn new(
        middleware: &'a [Arc<dyn ClientMiddleware>],
        base: &'a dyn Fn(Option<Duration>) -> Result<Option<(u64, JobResponse)>, ClientError>,
    ) -> Self {
        Self { middleware, base }
    }

    /// Invokes the next layer (or the base receive at the bottom).
    pub fn call(
        self,
        timeout: Option<Duration>,
    ) -> Result<Option<(u64, JobResponse)>, ClientError> {
        match self.middleware.split_first() {
            Some((layer, rest)) => layer
                .receive_response(timeout, ReceiveResponseNext { middleware: rest, base: self.base }),
            None => (self.base)(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use soarpc_common::{Context, Control};

    struct Recorder {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ClientMiddleware for Recorder {
        fn send_request(
            &self,
            request_id: u64,
            meta: &mut BTreeMap<String, Value>,
            request: &JobRequest,
            next: SendRequestNext<'_>,
        ) -> Result<(), ClientError> {
            self.order.lock().push(self.name);
            next.call(request_id, meta, request)
        }
    }

    struct ShortCircuit;

    impl ClientMiddleware for ShortCircuit {
        fn send_request(
            &self,
            _request_id: u64,
            _meta: &mut BTreeMap<String, Value>,
            _request: &JobRequest,
            _next: SendRequestNext<'_>,
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn empty_request() -> JobRequest {
        JobRequest {
            actions: Vec::new(),
            context: Context::default(),
            control: Control::default(),
        }
    }

    #[test]
    fn test_onion_runs_outermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let middleware: Vec<Arc<dyn ClientMiddleware>> = vec![
            Arc::new(Recorder { name: "outer", order: order.clone() }),
            Arc::new(Recorder { name: "inner", order: order.clone() }),
        ];
        let base_calls = Arc::new(Mutex::new(0));
        let base_calls_in_base = base_calls.clone();
        let base = move |_: u64,
                         _: &mut BTreeMap<String, Value>,
                         _: &JobRequest|
              -> Result<(), ClientError> {
            *base_calls_in_base.lock() += 1;
            Ok(())
        };

        let mut meta = BTreeMap::new();
        SendRequestNext::new(&middleware, &base)
            .call(1, &mut meta, &empty_request())
            .unwrap();

        assert_eq!(*order.lock(), vec!["outer", "inner"]);
        assert_eq!(*base_calls.lock(), 1);
    }

    #[test]
    fn test_short_circuit_skips_the_base() {
        let middleware: Vec<Arc<dyn ClientMiddleware>> = vec![Arc::new(ShortCircuit)];
        let base = |_: u64,
                    _: &mut BTreeMap<String, Value>,
                    _: &JobRequest|
         -> Result<(), ClientError> { panic!("base must not run") };

        let mut meta = BTreeMap::new();
        SendRequestNext::new(&middleware, &base)
            .call(1, &mut meta, &empty_request())
            .unwrap();
    }
}
