//! End-to-end server tests: a real `Server` run loop on one thread, a
//! real `Client` on the test thread, and the in-memory broker between.

use soarpc_client::{CallOptions, Client, ClientConfig, ClientError};
use soarpc_common::transport::redis::{MemoryBackend, RedisTransportSettings};
use soarpc_common::{vmap, ActionRequest, Error, Value};
use soarpc_metrics::NoopMetrics;
use soarpc_server::{
    ActionRegistration, ActionError, RunOutcome, Server, ServerBuilder, ServerSettings,
    Validator,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn test_settings() -> ServerSettings {
    ServerSettings {
        transport: RedisTransportSettings {
            receive_timeout_in_seconds: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn square_registration() -> ActionRegistration {
    ActionRegistration::new(|request| {
        let number = request.body.get("number").and_then(Value::as_i64).ok_or_else(|| {
            ActionError::single(
                Error::new("INVALID", "number is required").with_field("number").caller_error(),
            )
        })?;
        if number < 0 {
            return Err(ActionError::single(
                Error::new("INVALID", "number must not be negative")
                    .with_field("number")
                    .caller_error(),
            ));
        }
        Ok(vmap! { "square" => number * number })
    })
    .with_description("Squares a non-negative number.")
}

fn builder(backend: Arc<MemoryBackend>, service_name: &str) -> ServerBuilder {
    let settings = test_settings();
    let transport = settings
        .transport
        .build_server_transport_with_backend(backend, service_name, Arc::new(NoopMetrics))
        .unwrap();
    ServerBuilder::new(service_name, settings).transport(Box::new(transport))
}

fn start(server: Server) -> (Arc<Server>, thread::JoinHandle<RunOutcome>) {
    let server = Arc::new(server);
    let handle = {
        let server = server.clone();
        thread::spawn(move || server.run())
    };
    (server, handle)
}

fn stop(server: &Arc<Server>, handle: thread::JoinHandle<RunOutcome>) -> RunOutcome {
    server.shutdown_flag().store(true, std::sync::atomic::Ordering::SeqCst);
    handle.join().unwrap()
}

fn client_for(backend: Arc<MemoryBackend>, service_name: &str) -> Client {
    Client::new(HashMap::from([(
        service_name.to_owned(),
        ClientConfig::redis_with_backend(
            RedisTransportSettings { receive_timeout_in_seconds: 2, ..Default::default() },
            backend,
        ),
    )]))
}

#[test]
fn test_happy_path_one_action() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().with_correlation_id("abc");
    let response = client
        .call_action("example", "square", vmap! { "number" => 7 }, &options)
        .unwrap();
    assert_eq!(response.body, vmap! { "square" => 49 });
    assert!(response.errors.is_empty());

    assert_eq!(stop(&server, handle), RunOutcome::Shutdown);
}

#[test]
fn test_multiple_actions_without_continue_stop_at_first_error() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_action_errors();
    let response = client
        .call_actions(
            "example",
            vec![
                ActionRequest::new("square", vmap! { "number" => 3 }),
                ActionRequest::new("square", vmap! { "number" => -1 }),
                ActionRequest::new("square", vmap! { "number" => 4 }),
            ],
            &options,
        )
        .unwrap();

    assert_eq!(response.actions.len(), 2);
    assert_eq!(response.actions[0].body, vmap! { "square" => 9 });
    assert!(response.actions[0].errors.is_empty());
    assert_eq!(response.actions[1].errors[0].code, "INVALID");
    assert_eq!(response.actions[1].errors[0].field.as_deref(), Some("number"));
    assert!(response.actions[1].body.is_null());

    stop(&server, handle);
}

#[test]
fn test_continue_on_error_yields_a_response_per_action() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_action_errors().continue_on_error();
    let response = client
        .call_actions(
            "example",
            vec![
                ActionRequest::new("square", vmap! { "number" => 2 }),
                ActionRequest::new("square", vmap! { "number" => -1 }),
                ActionRequest::new("square", vmap! { "number" => 5 }),
            ],
            &options,
        )
        .unwrap();

    assert_eq!(response.actions.len(), 3);
    assert_eq!(response.actions[2].body, vmap! { "square" => 25 });

    stop(&server, handle);
}

#[test]
fn test_unknown_action_is_a_caller_error() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let result = client.call_action("example", "cube", vmap! {}, &CallOptions::default());
    match result {
        Err(ClientError::CallActionError(actions)) => {
            assert_eq!(actions[0].errors[0].code, "UNKNOWN_ACTION");
            assert_eq!(actions[0].errors[0].field.as_deref(), Some("action"));
            assert!(actions[0].errors[0].is_caller_error);
        }
        other => panic!("expected CallActionError, got {:?}", other),
    }

    stop(&server, handle);
}

#[test]
fn test_panicking_handler_becomes_server_error() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action(
            "explode",
            ActionRegistration::new(|_| panic!("the handler has a bug")),
        )
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_action_errors();
    let response = client
        .call_actions(
            "example",
            vec![ActionRequest::new("explode", vmap! {})],
            &options,
        )
        .unwrap();

    let error = &response.actions[0].errors[0];
    assert_eq!(error.code, "SERVER_ERROR");
    assert!(!error.is_caller_error);
    assert!(error.traceback.as_deref().unwrap().contains("the handler has a bug"));

    // The worker survives the panic and keeps serving.
    let follow_up =
        client.call_action("example", "status", vmap! {}, &CallOptions::default());
    assert!(follow_up.is_ok());

    stop(&server, handle);
}

#[test]
fn test_default_introspect_and_status_actions() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .version("9.9.9")
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let introspection = client
        .call_action("example", "introspect", vmap! {}, &CallOptions::default())
        .unwrap();
    let square_record = introspection
        .body
        .get("actions")
        .and_then(|actions| actions.get("square"))
        .expect("square must be introspectable");
    assert_eq!(
        square_record.get("description").and_then(Value::as_str),
        Some("Squares a non-negative number.")
    );

    let status = client
        .call_action("example", "status", vmap! {}, &CallOptions::default())
        .unwrap();
    assert_eq!(status.body.get("service").and_then(Value::as_str), Some("example"));
    assert_eq!(status.body.get("version").and_then(Value::as_str), Some("9.9.9"));

    stop(&server, handle);
}

#[test]
fn test_zero_actions_fails_validation_without_dispatch() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_job_errors();
    let response = client.call_actions("example", Vec::new(), &options).unwrap();
    assert!(response.actions.is_empty());
    assert_eq!(response.errors[0].code, "INVALID");
    assert_eq!(response.errors[0].field.as_deref(), Some("actions"));

    stop(&server, handle);
}

struct RequireNumber;

impl Validator for RequireNumber {
    fn errors(&self, body: &Value) -> Vec<Error> {
        if body.get("number").and_then(Value::as_i64).is_none() {
            vec![Error::new("INVALID", "number is required").with_field("number")]
        } else {
            Vec::new()
        }
    }

    fn describe(&self) -> Value {
        vmap! { "number" => "integer" }
    }
}

struct NeverValid;

impl Validator for NeverValid {
    fn errors(&self, _body: &Value) -> Vec<Error> {
        vec![Error::new("INVALID", "the response is never acceptable")]
    }
}

#[test]
fn test_request_validation_produces_field_errors() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action(
            "square",
            square_registration().with_request_validator(Arc::new(RequireNumber)),
        )
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_action_errors();
    let response = client
        .call_actions("example", vec![ActionRequest::new("square", vmap! {})], &options)
        .unwrap();
    let error = &response.actions[0].errors[0];
    assert_eq!(error.code, "INVALID");
    assert_eq!(error.field.as_deref(), Some("number"));
    assert!(error.is_caller_error);

    stop(&server, handle);
}

#[test]
fn test_response_validation_failure_is_response_not_valid() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action(
            "square",
            square_registration().with_response_validator(Arc::new(NeverValid)),
        )
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_action_errors();
    let response = client
        .call_actions(
            "example",
            vec![ActionRequest::new("square", vmap! { "number" => 2 })],
            &options,
        )
        .unwrap();
    assert_eq!(response.actions[0].errors[0].code, "RESPONSE_NOT_VALID");

    stop(&server, handle);
}

#[test]
fn test_handler_can_call_other_services_with_propagated_context() {
    let backend = Arc::new(MemoryBackend::new());

    // An "inner" service the outer handler calls through its nested client.
    let inner = builder(backend.clone(), "inner")
        .action(
            "whoami",
            ActionRegistration::new(|request| {
                Ok(vmap! {
                    "correlation_id" => request.context.correlation_id.clone(),
                    "calling_service" => request
                        .context
                        .extra
                        .get("calling_service")
                        .cloned()
                        .unwrap_or(Value::Null),
                })
            }),
        )
        .build()
        .unwrap();
    let (inner, inner_handle) = start(inner);

    let outer = builder(backend.clone(), "outer")
        .client_routing(HashMap::from([(
            "inner".to_owned(),
            ClientConfig::redis_with_backend(
                RedisTransportSettings { receive_timeout_in_seconds: 2, ..Default::default() },
                backend.clone(),
            ),
        )]))
        .action(
            "relay",
            ActionRegistration::new(|request| {
                let inner_response = request
                    .client
                    .call_action("inner", "whoami", vmap! {}, &CallOptions::default())
                    .map_err(|e| {
                        ActionError::single(Error::new("SERVER_ERROR", e.to_string()))
                    })?;
                Ok(inner_response.body)
            }),
        )
        .build()
        .unwrap();
    let (outer, outer_handle) = start(outer);

    let client = client_for(backend, "outer");
    let options = CallOptions::default().with_correlation_id("nested-abc");
    let response = client.call_action("outer", "relay", vmap! {}, &options).unwrap();

    assert_eq!(
        response.body.get("correlation_id").and_then(Value::as_str),
        Some("nested-abc")
    );
    assert_eq!(
        response.body.get("calling_service").and_then(Value::as_str),
        Some("outer")
    );

    stop(&outer, outer_handle);
    stop(&inner, inner_handle);
}

#[test]
fn test_middleware_can_short_circuit_a_job() {
    use soarpc_server::{EnrichedJobRequest, JobNext, ServerMiddleware};

    struct Gatekeeper;

    impl ServerMiddleware for Gatekeeper {
        fn job(&self, request: &EnrichedJobRequest, next: JobNext<'_>) -> soarpc_common::JobResponse {
            if request.request.context.switches.contains(&13) {
                return soarpc_common::JobResponse::from_errors(vec![Error::new(
                    "UNLUCKY",
                    "switch 13 is not allowed",
                )]);
            }
            next.call(request)
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .middleware(vec![Arc::new(Gatekeeper)])
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend, "example");
    let options = CallOptions::default().keep_job_errors().with_switches(vec![13]);
    let response = client
        .call_actions(
            "example",
            vec![ActionRequest::new("square", vmap! { "number" => 1 })],
            &options,
        )
        .unwrap();
    assert_eq!(response.errors[0].code, "UNLUCKY");
    assert!(response.actions.is_empty());

    // Without the switch the job passes through to the handler.
    let ok = client
        .call_action("example", "square", vmap! { "number" => 2 }, &CallOptions::default())
        .unwrap();
    assert_eq!(ok.body, vmap! { "square" => 4 });

    stop(&server, handle);
}

#[test]
fn test_suppressed_response_is_never_enqueued() {
    let backend = Arc::new(MemoryBackend::new());
    let server = builder(backend.clone(), "example")
        .action("square", square_registration())
        .build()
        .unwrap();
    let (server, handle) = start(server);

    let client = client_for(backend.clone(), "example");
    client
        .send_request(
            "example",
            vec![ActionRequest::new("square", vmap! { "number" => 3 })],
            &CallOptions::default(),
            true,
        )
        .unwrap();

    // Give the server time to process, then confirm nothing came back.
    thread::sleep(Duration::from_millis(300));
    let drained: Vec<_> = client
        .get_all_responses("example", Some(Duration::from_millis(10)))
        .unwrap()
        .collect();
    assert!(drained.is_empty());
    assert_eq!(backend.queue_len("service:example"), 0);

    stop(&server, handle);
}
