//! The `Client` and its per-service `ServiceHandler`s.

use crate::errors::ClientError;
use crate::expander::{self, ExpansionConverter, ExpansionSettings, Expansions};
use crate::future::FutureResponse;
use crate::middleware::{ClientMiddleware, ReceiveResponseNext, SendRequestNext};
use parking_lot::Mutex;
use rand::Rng;
use soarpc_common::transport::redis::{RedisBackend, RedisTransportSettings};
use soarpc_common::transport::ClientTransport;
use soarpc_common::{
    ActionRequest, ActionResponse, Context, Control, Error, JobRequest, JobResponse,
    TransportError, Value,
};
use soarpc_metrics::{MetricsRecorder, NoopMetrics};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds the client transport for one service.
pub trait ClientTransportFactory: Send + Sync {
    fn build_client_transport(
        &self,
        service_name: &str,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Box<dyn ClientTransport>, TransportError>;
}

/// How a service's transport is constructed.
#[derive(Clone)]
pub enum TransportConfig {
    /// The Redis Gateway, with a backend built from the settings.
    RedisGateway(RedisTransportSettings),
    /// The Redis Gateway over an existing backend (shared connections, or
    /// an in-memory backend in tests and local development).
    RedisGatewayShared {
        settings: RedisTransportSettings,
        backend: Arc<dyn RedisBackend>,
    },
    /// A custom transport.
    Custom(Arc<dyn ClientTransportFactory>),
}

impl TransportConfig {
    fn build(
        &self,
        service_name: &str,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Box<dyn ClientTransport>, ClientError> {
        match self {
            TransportConfig::RedisGateway(settings) => {
                Ok(Box::new(settings.build_client_transport(service_name, metrics)?))
            }
            TransportConfig::RedisGatewayShared { settings, backend } => {
                Ok(Box::new(settings.build_client_transport_with_backend(
                    backend.clone(),
                    service_name,
                    metrics,
                )?))
            }
            TransportConfig::Custom(factory) => {
                Ok(factory.build_client_transport(service_name, metrics)?)
            }
        }
    }
}

/// Per-service client configuration: the transport plus the middleware
/// stack, outermost first.
#[derive(Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub middleware: Vec<Arc<dyn ClientMiddleware>>,
}

impl ClientConfig {
    pub fn redis(settings: RedisTransportSettings) -> Self {
        Self { transport: TransportConfig::RedisGateway(settings), middleware: Vec::new() }
    }

    pub fn redis_with_backend(
        settings: RedisTransportSettings,
        backend: Arc<dyn RedisBackend>,
    ) -> Self {
        Self {
            transport: TransportConfig::RedisGatewayShared { settings, backend },
            middleware: Vec::new(),
        }
    }

    pub fn custom(factory: Arc<dyn ClientTransportFactory>) -> Self {
        Self { transport: TransportConfig::Custom(factory), middleware: Vec::new() }
    }

    pub fn with_middleware(mut self, middleware: Vec<Arc<dyn ClientMiddleware>>) -> Self {
        self.middleware = middleware;
        self
    }
}

fn client_version_value() -> Value {
    Value::List(
        env!("CARGO_PKG_VERSION")
            .split('.')
            .filter_map(|part| part.parse::<i64>().ok().map(Value::Int))
            .collect(),
    )
}

/// Does the low-level work of talking to one service through its
/// configured transport: request ids, middleware, send, and receive.
pub struct ServiceHandler {
    transport: Mutex<Box<dyn ClientTransport>>,
    middleware: Vec<Arc<dyn ClientMiddleware>>,
    request_counter: AtomicU64,
}

impl ServiceHandler {
    pub fn new(
        transport: Box<dyn ClientTransport>,
        middleware: Vec<Arc<dyn ClientMiddleware>>,
    ) -> Self {
        // Start the counter at a random base so request ids from separate
        // clients sharing a broker do not collide in log searches.
        let base = rand::thread_rng().gen_range(1..=1_000_000u64);
        Self {
            transport: Mutex::new(transport),
            middleware,
            request_counter: AtomicU64::new(base),
        }
    }

    /// Sends a job request through the middleware stack and returns its
    /// request id.
    pub fn send_request(
        &self,
        mut request: JobRequest,
        message_expiry: Option<Duration>,
    ) -> Result<u64, ClientError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        request.context.request_id = Some(request_id);
        let expects_response = !request.control.suppress_response;

        let base = |request_id: u64,
                    meta: &mut BTreeMap<String, Value>,
                    request: &JobRequest|
         -> Result<(), ClientError> {
            self.transport
                .lock()
                .send_request_message(
                    request_id,
                    meta.clone(),
                    request.to_value(),
                    message_expiry,
                    expects_response,
                )
                .map_err(ClientError::from)
        };

        let mut meta = BTreeMap::from([("client_version".to_owned(), client_version_value())]);
        SendRequestNext::new(&self.middleware, &base).call(request_id, &mut meta, &request)?;
        Ok(request_id)
    }

    /// Receives one response through the middleware stack. `Ok(None)`
    /// means nothing is outstanding.
    fn receive_one(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<(u64, JobResponse)>, ClientError> {
        let base = |timeout: Option<Duration>|
         -> Result<Option<(u64, JobResponse)>, ClientError> {
            match self.transport.lock().receive_response_message(timeout) {
                Ok(None) => Ok(None),
                Ok(Some(message)) => {
                    let response = JobResponse::from_value(&message.body)
                        .map_err(|e| ClientError::Transport(e.into()))?;
                    Ok(Some((message.request_id, response)))
                }
                Err(err) => Err(err.into()),
            }
        };
        ReceiveResponseNext::new(&self.middleware, &base).call(timeout)
    }
}

/// Lazily yields `(request_id, response)` pairs until nothing remains
/// outstanding on the service's reply-to queue.
pub struct ResponsesIter {
    handler: Arc<ServiceHandler>,
    timeout: Option<Duration>,
    finished: bool,
}

impl Iterator for ResponsesIter {
    type Item = Result<(u64, JobResponse), ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.handler.receive_one(self.timeout) {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Per-call knobs. `Default` raises job and action errors, does not catch
/// transport errors, and uses the transport's configured timeout.
#[derive(Clone)]
pub struct CallOptions {
    /// Expansions to perform on the response, by `_type`.
    pub expansions: Option<Expansions>,
    /// Turn job-level response errors into [`ClientError::JobError`].
    pub raise_job_errors: bool,
    /// Turn action-level response errors into
    /// [`ClientError::CallActionError`].
    pub raise_action_errors: bool,
    /// In the parallel variants, record a transport failure in that job's
    /// result slot instead of failing the whole call.
    pub catch_transport_errors: bool,
    /// Block at most this long for each response; also sets the message
    /// expiry (plus the transport's buffer) and `control.timeout`.
    pub timeout: Option<Duration>,
    /// Switches to union into the context.
    pub switches: Vec<i64>,
    /// Correlation id override; defaults to the client's base context or
    /// a freshly generated id.
    pub correlation_id: Option<String>,
    pub continue_on_error: bool,
    /// Extra context entries.
    pub context: BTreeMap<String, Value>,
    /// Extra control entries.
    pub control: BTreeMap<String, Value>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            expansions: None,
            raise_job_errors: true,
            raise_action_errors: true,
            catch_transport_errors: false,
            timeout: None,
            switches: Vec::new(),
            correlation_id: None,
            continue_on_error: false,
            context: BTreeMap::new(),
            control: BTreeMap::new(),
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_switches(mut self, switches: Vec<i64>) -> Self {
        self.switches = switches;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_expansions(mut self, expansions: Expansions) -> Self {
        self.expansions = Some(expansions);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn keep_job_errors(mut self) -> Self {
        self.raise_job_errors = false;
        self
    }

    pub fn keep_action_errors(mut self) -> Self {
        self.raise_action_errors = false;
        self
    }

    pub fn catch_transport_errors(mut self) -> Self {
        self.catch_transport_errors = true;
        self
    }
}

/// One entry in a [`Client::call_jobs_parallel`] batch.
#[derive(Clone)]
pub struct Job {
    pub service_name: String,
    pub actions: Vec<ActionRequest>,
}

/// A per-job outcome in the parallel variants: the response, or the
/// transport failure that replaced it under `catch_transport_errors`.
pub type JobResult = Result<JobResponse, ClientError>;

struct ClientInner {
    config: HashMap<String, ClientConfig>,
    handlers: Mutex<HashMap<String, Arc<ServiceHandler>>>,
    expansions: Option<ExpansionConverter>,
    metrics: Arc<dyn MetricsRecorder>,
}

/// The client: builds job requests, dispatches them over per-service
/// transports, and correlates responses by request id.
///
/// Cloning a `Client` is cheap and shares the underlying handlers; the
/// base [`Context`] travels with each clone, so
/// [`Client::with_context`] produces a clone whose calls carry that
/// context (used by servers to propagate context into nested calls).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    context: Context,
}

impl Client {
    pub fn new(config: HashMap<String, ClientConfig>) -> Self {
        Self::with_options(config, None, Arc::new(NoopMetrics))
            .expect("no expansion settings to validate")
    }

    /// Builds a client with expansion configuration and a metrics sink.
    pub fn with_options(
        config: HashMap<String, ClientConfig>,
        expansion_settings: Option<ExpansionSettings>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, ClientError> {
        let expansions = expansion_settings.map(ExpansionConverter::new).transpose()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                handlers: Mutex::new(HashMap::new()),
                expansions,
                metrics,
            }),
            context: Context::default(),
        })
    }

    /// A clone of this client whose requests carry `context` as the base
    /// request context.
    pub fn with_context(&self, context: Context) -> Self {
        Self { inner: self.inner.clone(), context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn handler(&self, service_name: &str) -> Result<Arc<ServiceHandler>, ClientError> {
        let mut handlers = self.inner.handlers.lock();
        if let Some(handler) = handlers.get(service_name) {
            return Ok(handler.clone());
        }
        let config = self
            .inner
            .config
            .get(service_name)
            .ok_or_else(|| ClientError::ImproperlyConfigured(service_name.to_owned()))?;
        let transport =
            config.transport.build(service_name, self.inner.metrics.clone())?;
        let handler = Arc::new(ServiceHandler::new(transport, config.middleware.clone()));
        handlers.insert(service_name.to_owned(), handler.clone());
        Ok(handler)
    }

    fn make_context(&self, options: &CallOptions) -> Context {
        let mut context = self.context.clone();
        context.request_id = None;
        if let Some(correlation_id) = &options.correlation_id {
            context.correlation_id = correlation_id.clone();
        } else if context.correlation_id.is_empty() {
            context.correlation_id = uuid::Uuid::new_v4().simple().to_string();
        }
        context.switches.extend(options.switches.iter().copied());
        let mut extra = options.context.clone();
        if let Some(switches) = extra.remove("switches") {
            if let Some(switches) = switches.as_list() {
                context.switches.extend(switches.iter().filter_map(Value::as_i64));
            }
        }
        context.extra.extend(extra);
        context
    }

    fn make_control(&self, options: &CallOptions, suppress_response: bool) -> Control {
        let mut control = Control {
            continue_on_error: options.continue_on_error,
            suppress_response,
            timeout: None,
            extra: options.control.clone(),
        };
        if let Some(timeout) = control.extra.remove("timeout").and_then(|v| v.as_u64()) {
            control.timeout = Some(timeout);
        } else if let Some(timeout) = options.timeout {
            control.timeout = Some(timeout.as_secs());
        }
        control
    }

    // Methods used to send a request and then separately receive responses.

    /// Builds and sends a job request, returning its request id. With
    /// `suppress_response`, the server processes the job but sends
    /// nothing back, and no response slot is allocated locally.
    pub fn send_request(
        &self,
        service_name: &str,
        actions: Vec<ActionRequest>,
        options: &CallOptions,
        suppress_response: bool,
    ) -> Result<u64, ClientError> {
        let handler = self.handler(service_name)?;
        let request = JobRequest {
            actions,
            context: self.make_context(options),
            control: self.make_control(options, suppress_response),
        };
        handler.send_request(request, options.timeout)
    }

    /// Lazily receives all available responses for a service, in arrival
    /// order, until nothing is outstanding.
    pub fn get_all_responses(
        &self,
        service_name: &str,
        receive_timeout: Option<Duration>,
    ) -> Result<ResponsesIter, ClientError> {
        Ok(ResponsesIter {
            handler: self.handler(service_name)?,
            timeout: receive_timeout,
            finished: false,
        })
    }

    // Blocking call methods.

    /// Sends a one-action job and blocks for its action response.
    pub fn call_action(
        &self,
        service_name: &str,
        action: &str,
        body: Value,
        options: &CallOptions,
    ) -> Result<ActionResponse, ClientError> {
        self.call_action_future(service_name, action, body, options)?.result(None)
    }

    /// Sends a job with the given actions and blocks for its response.
    pub fn call_actions(
        &self,
        service_name: &str,
        actions: Vec<ActionRequest>,
        options: &CallOptions,
    ) -> Result<JobResponse, ClientError> {
        self.call_actions_future(service_name, actions, options)?.result(None)
    }

    /// Dispatches one single-action job per action, all in flight at
    /// once, and blocks for every result. Results come back in the same
    /// order as `actions`.
    pub fn call_actions_parallel(
        &self,
        service_name: &str,
        actions: Vec<ActionRequest>,
        options: &CallOptions,
    ) -> Result<Vec<Result<ActionResponse, ClientError>>, ClientError> {
        self.call_actions_parallel_future(service_name, actions, options)?.result(None)
    }

    /// Dispatches arbitrary jobs to one or more services, all in flight
    /// at once, and blocks for every result. Results come back in the
    /// same order as `jobs`.
    pub fn call_jobs_parallel(
        &self,
        jobs: Vec<Job>,
        options: &CallOptions,
    ) -> Result<Vec<JobResult>, ClientError> {
        self.call_jobs_parallel_future(jobs, options)?.result(None)
    }

    // Future variants: send now, receive on `result()`.

    /// Like [`Client::call_action`], but returns a future immediately
    /// after sending.
    ///
    /// With `raise_job_errors` disabled, a job-level failure surfaces as
    /// a [`ClientError::JobError`] from `result()` rather than an action
    /// response.
    pub fn call_action_future(
        &self,
        service_name: &str,
        action: &str,
        body: Value,
        options: &CallOptions,
    ) -> Result<FutureResponse<ActionResponse>, ClientError> {
        let mut future = self.call_actions_future(
            service_name,
            vec![ActionRequest::new(action, body)],
            options,
        )?;
        Ok(FutureResponse::new(move |timeout| {
            let response = future.result(timeout)?;
            if !response.errors.is_empty() {
                return Err(ClientError::JobError(response.errors));
            }
            response.actions.into_iter().next().ok_or_else(|| {
                ClientError::JobError(vec![Error::new(
                    soarpc_common::constants::ERROR_CODE_SERVER_ERROR,
                    "the job response contained no action responses",
                )])
            })
        }))
    }

    /// Like [`Client::call_actions`], but returns a future immediately
    /// after sending.
    pub fn call_actions_future(
        &self,
        service_name: &str,
        actions: Vec<ActionRequest>,
        options: &CallOptions,
    ) -> Result<FutureResponse<JobResponse>, ClientError> {
        let expected = self.send_request(service_name, actions, options, false)?;
        let client = self.clone();
        let service_name = service_name.to_owned();
        let options = options.clone();
        Ok(FutureResponse::new(move |timeout| {
            let timeout = timeout.or(options.timeout);
            let mut found = None;
            let mut responses = client.get_all_responses(&service_name, timeout)?;
            for item in &mut responses {
                let (request_id, response) = item?;
                if request_id == expected {
                    found = Some(response);
                    break;
                }
                // A response for an abandoned (timed-out) earlier request.
                tracing::warn!(request_id, expected, "dropping uncorrelated response");
            }
            let mut response = found.ok_or(ClientError::MissingResponse(expected))?;

            if options.raise_job_errors && !response.errors.is_empty() {
                return Err(ClientError::JobError(response.errors));
            }
            if options.raise_action_errors {
                let error_actions: Vec<ActionResponse> = response
                    .actions
                    .iter()
                    .filter(|action| !action.errors.is_empty())
                    .cloned()
                    .collect();
                if !error_actions.is_empty() {
                    return Err(ClientError::CallActionError(error_actions));
                }
            }
            if let Some(expansions) = &options.expansions {
                client.perform_expansion(&mut response.actions, expansions, &options)?;
            }
            Ok(response)
        }))
    }

    /// Like [`Client::call_actions_parallel`], but returns a future
    /// immediately after sending every job.
    pub fn call_actions_parallel_future(
        &self,
        service_name: &str,
        actions: Vec<ActionRequest>,
        options: &CallOptions,
    ) -> Result<FutureResponse<Vec<Result<ActionResponse, ClientError>>>, ClientError> {
        let jobs = actions
            .into_iter()
            .map(|action| Job {
                service_name: service_name.to_owned(),
                actions: vec![action],
            })
            .collect();
        let mut future = self.call_jobs_parallel_future(jobs, options)?;
        Ok(FutureResponse::new(move |timeout| {
            let results = future.result(timeout)?;
            Ok(results
                .into_iter()
                .map(|result| match result {
                    Err(err) => Err(err),
                    Ok(job) if !job.errors.is_empty() => Err(ClientError::JobError(job.errors)),
                    Ok(job) => job.actions.into_iter().next().ok_or_else(|| {
                        ClientError::JobError(vec![Error::new(
                            soarpc_common::constants::ERROR_CODE_SERVER_ERROR,
                            "the job response contained no action responses",
                        )])
                    }),
                })
                .collect())
        }))
    }

    /// Like [`Client::call_jobs_parallel`], but returns a future
    /// immediately after sending every job.
    pub fn call_jobs_parallel_future(
        &self,
        jobs: Vec<Job>,
        options: &CallOptions,
    ) -> Result<FutureResponse<Vec<JobResult>>, ClientError> {
        enum Slot {
            Sent { service_name: String, request_id: u64 },
            FailedToSend(ClientError),
        }

        let mut slots = Vec::with_capacity(jobs.len());
        let mut expected_by_service: HashMap<String, HashSet<u64>> = HashMap::new();
        for job in jobs {
            match self.send_request(&job.service_name, job.actions, options, false) {
                Ok(request_id) => {
                    expected_by_service
                        .entry(job.service_name.clone())
                        .or_default()
                        .insert(request_id);
                    slots.push(Slot::Sent { service_name: job.service_name, request_id });
                }
                Err(err) => {
                    if !options.catch_transport_errors {
                        return Err(err);
                    }
                    slots.push(Slot::FailedToSend(err));
                }
            }
        }

        let client = self.clone();
        let options = options.clone();
        // Accumulated across retries: a response received before an
        // earlier attempt timed out stays collected.
        let mut responses: HashMap<(String, u64), JobResponse> = HashMap::new();
        let mut failures: HashMap<(String, u64), ClientError> = HashMap::new();

        Ok(FutureResponse::new(move |timeout| {
            let timeout = timeout.or(options.timeout);

            for (service_name, expected) in &expected_by_service {
                let outstanding: Vec<u64> = expected
                    .iter()
                    .copied()
                    .filter(|id| !responses.contains_key(&(service_name.clone(), *id)))
                    .filter(|id| !failures.contains_key(&(service_name.clone(), *id)))
                    .collect();
                if outstanding.is_empty() {
                    continue;
                }

                let drain_result = {
                    let responses = &mut responses;
                    let mut drain = || -> Result<(), ClientError> {
                        let mut iter = client.get_all_responses(service_name, timeout)?;
                        for item in &mut iter {
                            let (request_id, response) = item?;
                            if expected.contains(&request_id) {
                                responses.insert((service_name.clone(), request_id), response);
                            } else {
                                tracing::warn!(request_id, "dropping uncorrelated response");
                            }
                        }
                        Ok(())
                    };
                    drain()
                };
                if let Err(err) = drain_result {
                    if !options.catch_transport_errors {
                        return Err(err);
                    }
                    for id in outstanding {
                        if !responses.contains_key(&(service_name.clone(), id)) {
                            failures
                                .entry((service_name.clone(), id))
                                .or_insert_with(|| err.clone());
                        }
                    }
                }
            }

            let mut results: Vec<JobResult> = Vec::with_capacity(slots.len());
            for slot in &slots {
                match slot {
                    Slot::FailedToSend(err) => results.push(Err(err.clone())),
                    Slot::Sent { service_name, request_id } => {
                        let key = (service_name.clone(), *request_id);
                        if let Some(response) = responses.get(&key) {
                            if options.raise_job_errors && !response.errors.is_empty() {
                                return Err(ClientError::JobError(response.errors.clone()));
                            }
                            if options.raise_action_errors {
                                let error_actions: Vec<ActionResponse> = response
                                    .actions
                                    .iter()
                                    .filter(|action| !action.errors.is_empty())
                                    .cloned()
                                    .collect();
                                if !error_actions.is_empty() {
                                    return Err(ClientError::CallActionError(error_actions));
                                }
                            }
                            results.push(Ok(response.clone()));
                        } else if let Some(err) = failures.get(&key) {
                            results.push(Err(err.clone()));
                        } else {
                            return Err(ClientError::MissingResponse(*request_id));
                        }
                    }
                }
            }

            if let Some(expansions) = &options.expansions {
                for result in results.iter_mut() {
                    if let Ok(response) = result {
                        client.perform_expansion(
                            &mut response.actions,
                            expansions,
                            &options,
                        )?;
                    }
                }
            }

            Ok(results)
        }))
    }

    fn perform_expansion(
        &self,
        actions: &mut [ActionResponse],
        expansions: &Expansions,
        options: &CallOptions,
    ) -> Result<(), ClientError> {
        if let Some(converter) = &self.inner.expansions {
            expander::expand(self, converter, actions, expansions, options)?;
        }
        Ok(())
    }
}
