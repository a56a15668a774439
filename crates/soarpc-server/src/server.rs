//! The worker run loop and job/action dispatch.

use crate::action::ActionRegistration;
use crate::errors::{ActionError, ServerError};
use crate::harakiri::{HarakiriWatchdog, EXIT_CODE_HARAKIRI};
use crate::heartbeat::HeartbeatFile;
use crate::middleware::{ActionNext, JobNext, ServerMiddleware};
use crate::settings::ServerSettings;
use crate::supervisor::EXIT_CODE_RELOAD;
use crate::types::{EnrichedActionRequest, EnrichedJobRequest};
use parking_lot::Mutex;
use rand::Rng;
use soarpc_client::{Client, ClientConfig};
use soarpc_common::constants::{
    ERROR_CODE_JOB_TIMEOUT, ERROR_CODE_RESPONSE_NOT_VALID, ERROR_CODE_RESPONSE_TOO_LARGE,
    ERROR_CODE_SERVER_ERROR, ERROR_CODE_UNKNOWN_ACTION,
};
use soarpc_common::logging::Redactor;
use soarpc_common::transport::{ReceivedMessage, ServerTransport};
use soarpc_common::{
    ActionResponse, Context, Error, JobRequest, JobResponse, TransportError, Value,
};
use soarpc_metrics::{MetricsRecorder, NoopMetrics, Stopwatch};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracebacks carried in error responses are clipped to this size.
const MAX_TRACEBACK_BYTES: usize = 4096;

/// Lifecycle callbacks around the run loop. Any of them may be omitted.
#[derive(Default)]
pub struct ServerHooks {
    /// Runs once before the loop starts (cache warming, one-time loads).
    pub setup: Option<Box<dyn Fn() + Send + Sync>>,
    /// Runs once after the loop ends.
    pub teardown: Option<Box<dyn Fn() + Send + Sync>>,
    /// Runs each time a receive times out with no request.
    pub perform_idle_actions: Option<Box<dyn Fn() + Send + Sync>>,
    /// Runs just before each received request is processed.
    pub perform_pre_request_actions: Option<Box<dyn Fn() + Send + Sync>>,
    /// Runs just after each request's response is sent.
    pub perform_post_request_actions: Option<Box<dyn Fn() + Send + Sync>>,
}

fn run_hook(hook: &Option<Box<dyn Fn() + Send + Sync>>) {
    if let Some(hook) = hook {
        hook();
    }
}

/// How a run loop ended, and the process exit code it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Normal shutdown (signal or fatal transport failure).
    Shutdown,
    /// The per-request watchdog fired.
    Harakiri,
    /// The file watcher requested a reload.
    Reload,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Shutdown => 0,
            RunOutcome::Harakiri => EXIT_CODE_HARAKIRI,
            RunOutcome::Reload => EXIT_CODE_RELOAD,
        }
    }
}

/// Builds a [`Server`].
pub struct ServerBuilder {
    service_name: String,
    settings: ServerSettings,
    actions: BTreeMap<String, ActionRegistration>,
    middleware: Vec<Arc<dyn ServerMiddleware>>,
    transport: Option<Box<dyn ServerTransport>>,
    client_routing: Option<HashMap<String, ClientConfig>>,
    metrics: Arc<dyn MetricsRecorder>,
    hooks: ServerHooks,
    forked_process_id: Option<u32>,
    version: String,
}

impl ServerBuilder {
    pub fn new(service_name: impl Into<String>, settings: ServerSettings) -> Self {
        Self {
            service_name: service_name.into(),
            settings,
            actions: BTreeMap::new(),
            middleware: Vec::new(),
            transport: None,
            client_routing: None,
            metrics: Arc::new(NoopMetrics),
            hooks: ServerHooks::default(),
            forked_process_id: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Registers an action handler under `name`.
    pub fn action(mut self, name: impl Into<String>, registration: ActionRegistration) -> Self {
        self.actions.insert(name.into(), registration);
        self
    }

    /// Sets the middleware stack, outermost first.
    pub fn middleware(mut self, middleware: Vec<Arc<dyn ServerMiddleware>>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Overrides the transport built from the settings (used by tests and
    /// embedded deployments).
    pub fn transport(mut self, transport: Box<dyn ServerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the nested-client routing built from the settings.
    pub fn client_routing(mut self, routing: HashMap<String, ClientConfig>) -> Self {
        self.client_routing = Some(routing);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// The fork index assigned by the supervisor, for heartbeat paths and
    /// logging.
    pub fn forked_process_id(mut self, forked_process_id: Option<u32>) -> Self {
        self.forked_process_id = forked_process_id;
        self
    }

    /// The service version reported by the default `status` action.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if self.service_name.is_empty() {
            return Err(ServerError::Configuration("service_name must be set".to_owned()));
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(
                self.settings
                    .transport
                    .build_server_transport(&self.service_name, self.metrics.clone())?,
            ),
        };
        let client_routing = self.client_routing.unwrap_or_else(|| {
            self.settings
                .client_routing
                .iter()
                .map(|(service, transport)| {
                    (service.clone(), ClientConfig::redis(transport.clone()))
                })
                .collect()
        });
        let redactor = Redactor::new(&self.settings.extra_fields_to_redact);
        Ok(Server {
            service_name: self.service_name,
            settings: self.settings,
            actions: self.actions,
            middleware: self.middleware,
            transport: Mutex::new(transport),
            client_routing,
            metrics: self.metrics,
            redactor,
            hooks: self.hooks,
            shutting_down: Arc::new(AtomicBool::new(false)),
            reload_requested: Arc::new(AtomicBool::new(false)),
            heartbeat: Mutex::new(None),
            forked_process_id: self.forked_process_id,
            version: self.version,
        })
    }
}

/// A single-worker server for one named service.
///
/// The request path is strictly sequential: one job at a time, one action
/// at a time, which is what makes the harakiri watchdog meaningful.
pub struct Server {
    service_name: String,
    settings: ServerSettings,
    actions: BTreeMap<String, ActionRegistration>,
    middleware: Vec<Arc<dyn ServerMiddleware>>,
    transport: Mutex<Box<dyn ServerTransport>>,
    client_routing: HashMap<String, ClientConfig>,
    metrics: Arc<dyn MetricsRecorder>,
    redactor: Redactor,
    hooks: ServerHooks,
    shutting_down: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
    heartbeat: Mutex<Option<HeartbeatFile>>,
    forked_process_id: Option<u32>,
    version: String,
}

impl Server {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The flag that ends the run loop; exposed so embedding code (and
    /// tests) can request shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    /// Registers SIGTERM/SIGINT handlers: the first signal requests a
    /// graceful shutdown, a second one exits immediately. Handlers are
    /// idempotent under concurrent delivery.
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register_conditional_shutdown(
                signal,
                1,
                self.shutting_down.clone(),
            )?;
            signal_hook::flag::register(signal, self.shutting_down.clone())?;
        }
        Ok(())
    }

    /// Starts the optional auto-reload watcher per the settings.
    pub fn start_file_watcher(&self) -> Result<(), ServerError> {
        if let Some(watcher) = &self.settings.file_watcher {
            crate::autoreload::spawn_file_watcher(
                watcher.paths.clone(),
                Duration::from_millis(watcher.debounce_ms),
                self.shutting_down.clone(),
                self.reload_requested.clone(),
            )
            .map_err(|e| ServerError::Configuration(e.to_string()))?;
        }
        Ok(())
    }

    /// Builds a nested client over this server's outbound routing that
    /// propagates the given request context.
    pub fn make_client(&self, context: &Context) -> Client {
        let mut context = context.clone();
        context.request_id = None;
        context
            .extra
            .insert("calling_service".to_owned(), Value::Str(self.service_name.clone()));
        Client::new(self.client_routing.clone()).with_context(context)
    }

    /// Runs the server until shutdown and reports how the loop ended.
    pub fn run(&self) -> RunOutcome {
        tracing::info!(
            service = %self.service_name,
            version = %self.version,
            fork = self.forked_process_id,
            "server starting up"
        );
        run_hook(&self.hooks.setup);
        self.metrics.increment("server.worker.startup");
        self.set_busy_metrics(false, true);

        if let Some(template) = &self.settings.heartbeat_file {
            match HeartbeatFile::create(template, self.forked_process_id) {
                Ok(heartbeat) => *self.heartbeat.lock() = Some(heartbeat),
                Err(err) => {
                    tracing::error!(error = %err, "could not create heartbeat file");
                }
            }
        }

        let watchdog = HarakiriWatchdog::start(
            Duration::from_secs(self.settings.harakiri.timeout),
            Duration::from_secs(self.settings.harakiri.shutdown_grace),
            self.shutting_down.clone(),
        );

        let mut transient_failures: u32 = 0;
        while !self.shutting_down.load(Ordering::SeqCst) {
            match self.handle_next_request(&watchdog) {
                Ok(()) => {
                    transient_failures = transient_failures.saturating_sub(1);
                }
                Err(err) if err.is_transient() => {
                    if transient_failures > 5 {
                        tracing::error!(
                            error = %err,
                            "too many transport errors, shutting down"
                        );
                        break;
                    }
                    let jitter: f64 = rand::thread_rng().gen();
                    let sleep = ((1u64 << transient_failures) as f64 + jitter) / 4.0;
                    tracing::info!(
                        error = %err,
                        sleep_seconds = sleep,
                        "transient transport error, backing off"
                    );
                    std::thread::sleep(Duration::from_secs_f64(sleep));
                    transient_failures += 1;
                }
                Err(err) => {
                    tracing::error!(error = %err, "unhandled transport error, shutting down");
                    break;
                }
            }
        }

        run_hook(&self.hooks.teardown);
        self.metrics.increment("server.worker.shutdown");
        self.set_busy_metrics(false, false);
        tracing::info!(service = %self.service_name, "server shutting down");
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.delete();
        }
        let fired = watchdog.fired();
        watchdog.stop();

        if fired {
            RunOutcome::Harakiri
        } else if self.reload_requested.load(Ordering::SeqCst) {
            RunOutcome::Reload
        } else {
            RunOutcome::Shutdown
        }
    }

    fn set_busy_metrics(&self, busy: bool, running: bool) {
        self.metrics.gauge("server.worker.running", if running { 1.0 } else { 0.0 });
        self.metrics.gauge("server.worker.busy", if busy { 1.0 } else { 0.0 });
    }

    fn tick_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().as_mut() {
            heartbeat.update();
        }
    }

    /// Receives the next request (or returns after the receive timeout),
    /// processes it, and sends its response.
    fn handle_next_request(&self, watchdog: &HarakiriWatchdog) -> Result<(), TransportError> {
        let message = self.transport.lock().receive_request_message(None)?;
        let Some(message) = message else {
            run_hook(&self.hooks.perform_idle_actions);
            self.tick_heartbeat();
            self.set_busy_metrics(false, true);
            return Ok(());
        };

        watchdog.begin_request();
        self.set_busy_metrics(true, true);
        let watch = Stopwatch::start();

        tracing::info!(
            request_id = message.request_id,
            request = %self.redactor.describe(&message.body),
            "job request"
        );

        let result = self.process_and_respond(&message);

        watch.record(&*self.metrics, "server.request");
        run_hook(&self.hooks.perform_post_request_actions);
        self.tick_heartbeat();
        self.set_busy_metrics(false, true);
        watchdog.end_request();
        result
    }

    fn process_and_respond(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        run_hook(&self.hooks.perform_pre_request_actions);

        let job_response = self.process_job(&message.body);
        let suppress_response = message
            .body
            .get("control")
            .and_then(|control| control.get("suppress_response"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let response_value = job_response.to_value();
        if job_response.has_errors() {
            tracing::error!(
                request_id = message.request_id,
                response = %self.redactor.describe(&response_value),
                "job response"
            );
        } else {
            tracing::info!(
                request_id = message.request_id,
                response = %self.redactor.describe(&response_value),
                "job response"
            );
        }

        if suppress_response {
            return Ok(());
        }

        let send_result = self.transport.lock().send_response_message(
            message.request_id,
            message.meta.clone(),
            response_value,
        );
        match send_result {
            Ok(()) => Ok(()),
            Err(TransportError::MessageTooLarge { size, .. }) => {
                self.metrics.increment("server.error.response_too_large");
                tracing::error!(
                    request_id = message.request_id,
                    serialized_length_in_bytes = size,
                    "response too large to send"
                );
                let error_response = JobResponse::from_errors(vec![Error::new(
                    ERROR_CODE_RESPONSE_TOO_LARGE,
                    "could not send the response because it was too large",
                )]);
                self.transport.lock().send_response_message(
                    message.request_id,
                    message.meta.clone(),
                    error_response.to_value(),
                )
            }
            Err(TransportError::Serialization(err)) => {
                self.metrics.increment("server.error.response_not_serializable");
                tracing::error!(
                    request_id = message.request_id,
                    error = %err,
                    "response failed to serialize"
                );
                let error_response = JobResponse::from_errors(vec![Error::new(
                    ERROR_CODE_RESPONSE_NOT_VALID,
                    "could not send the response because it failed to serialize",
                )]);
                self.transport.lock().send_response_message(
                    message.request_id,
                    message.meta.clone(),
                    error_response.to_value(),
                )
            }
            Err(err) => Err(err),
        }
    }

    /// Validates and executes one job, converting every failure mode into
    /// a job response.
    pub fn process_job(&self, body: &Value) -> JobResponse {
        let validation_errors = crate::schemas::validate_job_request(body);
        if !validation_errors.is_empty() {
            self.metrics.increment("server.error.job_error");
            return JobResponse::from_errors(validation_errors);
        }

        let request = match JobRequest::from_value(body) {
            Ok(request) => request,
            Err(err) => {
                self.metrics.increment("server.error.job_error");
                return JobResponse::from_errors(vec![Error::new(
                    ERROR_CODE_SERVER_ERROR,
                    err.to_string(),
                )]);
            }
        };
        let correlation_id = request.context.correlation_id.clone();
        let enriched = EnrichedJobRequest {
            client: self.make_client(&request.context),
            request,
        };

        let base = |request: &EnrichedJobRequest| self.execute_job(request);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            JobNext::new(&self.middleware, &base).call(&enriched)
        }));

        let mut response = match outcome {
            Ok(response) => response,
            Err(panic) => {
                self.metrics.increment("server.error.unhandled_error");
                if self.shutting_down.load(Ordering::SeqCst) {
                    // Most likely the watchdog interrupted the job.
                    JobResponse::from_errors(vec![Error::new(
                        ERROR_CODE_JOB_TIMEOUT,
                        "the job ran for too long and had to be interrupted",
                    )])
                } else {
                    self.unhandled_panic_response(panic)
                }
            }
        };
        response
            .context
            .insert("correlation_id".to_owned(), Value::Str(correlation_id));
        response
    }

    fn unhandled_panic_response(&self, panic: Box<dyn std::any::Any + Send>) -> JobResponse {
        JobResponse::from_errors(vec![server_error_from_panic(panic)])
    }

    /// Runs the job's actions in order through the action middleware
    /// onion, stopping at the first error unless `continue_on_error`.
    fn execute_job(&self, job: &EnrichedJobRequest) -> JobResponse {
        let mut response = JobResponse::default();
        for action_request in &job.request.actions {
            let enriched = EnrichedActionRequest {
                action: action_request.action.clone(),
                body: action_request.body.clone(),
                context: job.request.context.clone(),
                control: job.request.control.clone(),
                client: job.client.clone(),
            };
            let action_response = self.execute_action(&enriched);
            let errored = !action_response.errors.is_empty();
            response.actions.push(action_response);
            if errored && !job.request.control.continue_on_error {
                break;
            }
        }
        response
    }

    fn execute_action(&self, request: &EnrichedActionRequest) -> ActionResponse {
        let outcome = if let Some(registration) = self.actions.get(&request.action) {
            let base = |request: &EnrichedActionRequest| {
                Self::run_registered_action(registration, request)
            };
            let dispatch = || ActionNext::new(&self.middleware, &base).call(request);
            match catch_unwind(AssertUnwindSafe(dispatch)) {
                Ok(outcome) => outcome,
                Err(panic) => {
                    self.metrics.increment("server.error.unhandled_error");
                    Err(ActionError::single(server_error_from_panic(panic)))
                }
            }
        } else if request.action == "introspect" {
            self.introspect()
        } else if request.action == "status" {
            self.status()
        } else {
            Err(ActionError::single(
                Error::new(
                    ERROR_CODE_UNKNOWN_ACTION,
                    format!("the action {:?} was not found on this server", request.action),
                )
                .with_field("action")
                .caller_error(),
            ))
        };

        match outcome {
            Ok(response) => response,
            Err(err) => ActionResponse::from_errors(&request.action, err.errors),
        }
    }

    fn run_registered_action(
        registration: &ActionRegistration,
        request: &EnrichedActionRequest,
    ) -> Result<ActionResponse, ActionError> {
        if let Some(validator) = &registration.request_validator {
            let errors = validator.errors(&request.body);
            if !errors.is_empty() {
                return Err(ActionError::new(
                    errors.into_iter().map(Error::caller_error).collect(),
                ));
            }
        }

        let body = (registration.handler)(request)?;

        if let Some(validator) = &registration.response_validator {
            let errors = validator.errors(&body);
            if !errors.is_empty() {
                return Err(ActionError::new(
                    errors
                        .into_iter()
                        .map(|error| {
                            Error::new(
                                ERROR_CODE_RESPONSE_NOT_VALID,
                                format!("response not valid: {}", error.message),
                            )
                            .with_field(error.field.unwrap_or_default())
                        })
                        .collect(),
                ));
            }
        }

        Ok(ActionResponse::new(&request.action, body))
    }

    /// The default `introspect` action: enumerates the registered actions
    /// with their documentation and schemas.
    fn introspect(&self) -> Result<ActionResponse, ActionError> {
        let mut actions = BTreeMap::new();
        for (name, registration) in &self.actions {
            let mut record = BTreeMap::new();
            record.insert(
                "description".to_owned(),
                Value::Str(registration.description.clone()),
            );
            record.insert(
                "request_schema".to_owned(),
                registration
                    .request_validator
                    .as_ref()
                    .map_or(Value::Null, |v| v.describe()),
            );
            record.insert(
                "response_schema".to_owned(),
                registration
                    .response_validator
                    .as_ref()
                    .map_or(Value::Null, |v| v.describe()),
            );
            actions.insert(name.clone(), Value::Map(record));
        }
        let mut body = BTreeMap::new();
        body.insert("action_names".to_owned(), Value::List(
            self.actions.keys().map(|name| Value::Str(name.clone())).collect(),
        ));
        body.insert("actions".to_owned(), Value::Map(actions));
        Ok(ActionResponse::new("introspect", Value::Map(body)))
    }

    /// The default `status` action: version plus an empty healthcheck.
    fn status(&self) -> Result<ActionResponse, ActionError> {
        let mut healthcheck = BTreeMap::new();
        healthcheck.insert("errors".to_owned(), Value::List(Vec::new()));
        healthcheck.insert("warnings".to_owned(), Value::List(Vec::new()));
        let mut body = BTreeMap::new();
        body.insert("service".to_owned(), Value::Str(self.service_name.clone()));
        body.insert("version".to_owned(), Value::Str(self.version.clone()));
        body.insert("healthcheck".to_owned(), Value::Map(healthcheck));
        Ok(ActionResponse::new("status", Value::Map(body)))
    }
}

fn server_error_from_panic(panic: Box<dyn std::any::Any + Send>) -> Error {
    let message = if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    };
    let mut traceback = message.clone();
    if traceback.len() > MAX_TRACEBACK_BYTES {
        let mut cut = MAX_TRACEBACK_BYTES;
        while !traceback.is_char_boundary(cut) {
            cut -= 1;
        }
        traceback.truncate(cut);
    }
    Error::new(ERROR_CODE_SERVER_ERROR, format!("internal server error: {}", message))
        .with_traceback(traceback)
}
