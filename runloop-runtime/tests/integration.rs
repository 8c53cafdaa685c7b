//! Integration tests for the invocation loop
//!
//! These tests run the runtime against a local mock Runtime API and check the
//! calls it makes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runloop_core::{FunctionMetadata, HandlerError, HandlerSpec, InvocationContext};
use runloop_runtime::{
    handler_fn, CycleOutcome, Handler, HandlerResolver, ModuleRegistry, ProcessLoader,
    Runtime, RuntimeApiClient, StaticModule,
};
use runloop_test::{MockRuntimeApi, RecordedCall, ScriptedInvocation, CALL_TIMEOUT_SECS};
use serde_json::{json, Value};

fn metadata() -> Arc<FunctionMetadata> {
    Arc::new(FunctionMetadata {
        function_name: "echo".to_string(),
        function_version: "$LATEST".to_string(),
        memory_limit_in_mb: "128".to_string(),
        ..Default::default()
    })
}

fn runtime_for(api: &MockRuntimeApi, handler: impl Handler + 'static) -> Runtime {
    let client = RuntimeApiClient::new(&api.runtime_api()).unwrap();
    Runtime::new(client, Arc::new(handler), metadata())
}

fn timeout() -> Duration {
    Duration::from_secs(CALL_TIMEOUT_SECS)
}

fn errors(calls: &[RecordedCall]) -> Vec<&RecordedCall> {
    calls
        .iter()
        .filter(|c| matches!(c, RecordedCall::Error { .. }))
        .collect()
}

#[tokio::test]
async fn test_success_posts_single_response() {
    let api = MockRuntimeApi::start().await.unwrap();
    let request_id = api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|_event: Value, _ctx: InvocationContext| async move {
            Ok::<_, HandlerError>(json!({ "ok": true }))
        }),
    );
    let task = tokio::spawn(async move { runtime.run().await });

    let calls = api.wait_for_calls(3, timeout()).await;
    task.abort();

    assert_eq!(calls.len(), 3);
    assert!(calls[0].is_next());
    assert_eq!(
        calls[1],
        RecordedCall::Response {
            request_id,
            content_type: Some("application/json".to_string()),
            body: json!({ "ok": true }),
        }
    );
    assert!(calls[2].is_next());
    assert!(errors(&calls).is_empty());
}

#[tokio::test]
async fn test_handler_error_is_reported_and_loop_continues() {
    let api = MockRuntimeApi::start().await.unwrap();
    let request_id = api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|_event: Value, _ctx: InvocationContext| async move {
            Err::<Value, _>(HandlerError::new("boom").with_type("TypeError"))
        }),
    );
    let task = tokio::spawn(async move { runtime.run().await });

    let calls = api.wait_for_calls(3, timeout()).await;
    task.abort();

    assert_eq!(calls.len(), 3);
    match &calls[1] {
        RecordedCall::Error {
            request_id: id,
            error_type,
            body,
        } => {
            assert_eq!(id, &request_id);
            assert_eq!(error_type.as_deref(), Some("TypeError"));
            assert_eq!(body["errorMessage"], "boom");
            assert_eq!(body["errorType"], "TypeError");
            assert_eq!(body["stackTrace"], json!([]));
        }
        other => panic!("expected error report, got {:?}", other),
    }
    assert!(calls[2].is_next());
    assert!(!calls.iter().any(|c| matches!(c, RecordedCall::Response { .. })));
}

#[tokio::test]
async fn test_cycles_never_overlap() {
    let api = MockRuntimeApi::start().await.unwrap();
    api.push_json(&json!({ "n": 1 }));
    api.push_json(&json!({ "n": 2 }));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let handler = {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        handler_fn(move |event: Value, _ctx: InvocationContext| {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(event)
            }
        })
    };

    let runtime = runtime_for(&api, handler);
    let task = tokio::spawn(async move { runtime.run().await });

    let calls = api.wait_for_calls(5, timeout()).await;
    task.abort();

    assert_eq!(calls.len(), 5);
    for (i, call) in calls.iter().enumerate() {
        assert_eq!(call.is_next(), i % 2 == 0, "unexpected order: {:?}", calls);
    }
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_request_id_is_logged_not_reported() {
    let api = MockRuntimeApi::start().await.unwrap();
    api.push(ScriptedInvocation::json(&json!({})).without_request_id());
    let request_id = api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|_event: Value, _ctx: InvocationContext| async move {
            Ok::<_, HandlerError>(Value::Null)
        }),
    );

    assert_eq!(runtime.run_once().await, CycleOutcome::Unreported);
    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Succeeded {
            request_id: request_id.clone()
        }
    );

    let calls = api.calls();
    assert!(errors(&calls).is_empty());
    assert_eq!(
        calls.last(),
        Some(&RecordedCall::Response {
            request_id,
            content_type: Some("application/json".to_string()),
            body: Value::Null,
        })
    );
}

#[tokio::test]
async fn test_failed_poll_is_logged_and_loop_recovers() {
    let api = MockRuntimeApi::start().await.unwrap();
    api.push(ScriptedInvocation::failing(500));
    let request_id = api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|_event: Value, _ctx: InvocationContext| async move {
            Ok::<_, HandlerError>(json!("after outage"))
        }),
    );

    assert_eq!(runtime.run_once().await, CycleOutcome::Unreported);
    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Succeeded {
            request_id: request_id.clone()
        }
    );

    let calls = api.calls();
    assert!(errors(&calls).is_empty());
    assert_eq!(
        calls,
        vec![
            RecordedCall::Next,
            RecordedCall::Next,
            RecordedCall::Response {
                request_id,
                content_type: Some("application/json".to_string()),
                body: json!("after outage"),
            },
        ]
    );
}

#[tokio::test]
async fn test_unreachable_runtime_api_is_unreported() {
    // Bind and release a port so nothing is listening on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RuntimeApiClient::new(&addr.to_string()).unwrap();
    let handler = handler_fn(|_event: Value, _ctx: InvocationContext| async move {
        Ok::<_, HandlerError>(Value::Null)
    });
    let runtime = Runtime::new(client, Arc::new(handler), metadata());

    assert_eq!(runtime.run_once().await, CycleOutcome::Unreported);
    assert_eq!(runtime.run_once().await, CycleOutcome::Unreported);
}

#[tokio::test]
async fn test_malformed_event_is_reported_to_its_request() {
    let api = MockRuntimeApi::start().await.unwrap();
    let request_id = api
        .push(ScriptedInvocation::raw("{not json").with_request_id("req-malformed"))
        .unwrap();

    let calls_seen = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls_seen = calls_seen.clone();
        handler_fn(move |_event: Value, _ctx: InvocationContext| {
            calls_seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(Value::Null) }
        })
    };
    let runtime = runtime_for(&api, handler);

    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Failed {
            request_id: request_id.clone()
        }
    );
    assert_eq!(calls_seen.load(Ordering::SeqCst), 0);

    match api.calls().last() {
        Some(RecordedCall::Error {
            request_id: id,
            body,
            ..
        }) => {
            assert_eq!(id, &request_id);
            assert_eq!(body["errorType"], "Runtime.MalformedEvent");
        }
        other => panic!("expected error report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_context_carries_metadata_and_deadline() {
    let api = MockRuntimeApi::start().await.unwrap();
    api.push(ScriptedInvocation::json(&json!({})).without_deadline());
    api.push(ScriptedInvocation::json(&json!({})).with_deadline("not-a-number"));
    api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|_event: Value, ctx: InvocationContext| async move {
            Ok::<_, HandlerError>(json!({
                "requestId": ctx.aws_request_id,
                "functionName": ctx.function_name(),
                "functionVersion": ctx.function_version(),
                "memory": ctx.memory_limit_in_mb(),
                "arn": ctx.invoked_function_arn,
                "deadline": ctx.deadline_ms,
                "remaining": ctx.get_remaining_time_in_millis(),
            }))
        }),
    );

    for _ in 0..3 {
        runtime.run_once().await;
    }

    let bodies: Vec<Value> = api
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::Response { body, .. } => Some(body),
            _ => None,
        })
        .collect();
    assert_eq!(bodies.len(), 3);

    for body in &bodies[..2] {
        assert_eq!(body["deadline"], 0);
        assert_eq!(body["remaining"], 0);
    }

    let live = &bodies[2];
    assert_eq!(live["functionName"], "echo");
    assert_eq!(live["functionVersion"], "$LATEST");
    assert_eq!(live["memory"], "128");
    assert!(live["arn"].as_str().unwrap().starts_with("arn:aws:lambda:"));
    let remaining = live["remaining"].as_u64().unwrap();
    assert!(remaining > 0 && remaining <= 3_000);
}

#[tokio::test]
async fn test_handler_panic_is_reported() {
    let api = MockRuntimeApi::start().await.unwrap();
    let request_id = api.push_json(&json!({}));

    let runtime = runtime_for(
        &api,
        handler_fn(|event: Value, _ctx: InvocationContext| async move {
            if event.is_object() {
                panic!("handler exploded");
            }
            Ok::<_, HandlerError>(event)
        }),
    );

    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Failed {
            request_id: request_id.clone()
        }
    );

    match api.calls().last() {
        Some(RecordedCall::Error { body, .. }) => {
            assert_eq!(body["errorType"], "Runtime.HandlerPanic");
            assert_eq!(body["errorMessage"], "handler exploded");
        }
        other => panic!("expected error report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resolved_registry_handler_serves_invocations() {
    let registry = Arc::new(ModuleRegistry::new().register(
        "/var/task/app.js",
        StaticModule::new().with_default_handler(handler_fn(
            |event: Value, _ctx: InvocationContext| async move {
                Ok::<_, HandlerError>(json!({ "echo": event }))
            },
        )),
    ));
    let mut resolver = HandlerResolver::new("/var/task", registry);
    let handler = resolver
        .resolve(&HandlerSpec::parse("app.main").unwrap())
        .await
        .unwrap();

    let api = MockRuntimeApi::start().await.unwrap();
    let request_id = api.push_json(&json!({ "a": 1 }));
    let runtime = Runtime::new(
        RuntimeApiClient::new(&api.runtime_api()).unwrap(),
        handler,
        metadata(),
    );

    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Succeeded { request_id }
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_handler_end_to_end() {
    use runloop_test::fixtures::{write_script, ECHO_MODULE};

    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "mod.sh", ECHO_MODULE);

    let loader = ProcessLoader::default().with_interpreter(".sh", vec!["sh".to_string()]);
    let mut resolver =
        HandlerResolver::new(dir.path(), Arc::new(loader)).with_extensions([".ts", ".sh"]);

    let handler = resolver.resolve(&HandlerSpec::default()).await.unwrap();
    let failing = resolver
        .resolve(&HandlerSpec::parse("mod.fail").unwrap())
        .await
        .unwrap();

    let api = MockRuntimeApi::start().await.unwrap();
    let ok_id = api.push_json(&json!({ "name": "deno" }));
    let client = RuntimeApiClient::new(&api.runtime_api()).unwrap();
    let runtime = Runtime::new(client.clone(), handler, metadata());
    assert_eq!(
        runtime.run_once().await,
        CycleOutcome::Succeeded {
            request_id: ok_id.clone()
        }
    );

    let fail_id = api.push_json(&json!({}));
    let failing_runtime = Runtime::new(client, failing, metadata());
    assert_eq!(
        failing_runtime.run_once().await,
        CycleOutcome::Failed {
            request_id: fail_id
        }
    );

    let calls = api.calls();
    match &calls[1] {
        RecordedCall::Response { request_id, body, .. } => {
            assert_eq!(request_id, &ok_id);
            assert_eq!(body["event"], json!({ "name": "deno" }));
            assert_eq!(body["context"]["awsRequestId"], ok_id.as_str());
            assert_eq!(body["context"]["functionName"], "echo");
            assert_eq!(body["context"]["memoryLimitInMB"], "128");
        }
        other => panic!("expected response, got {:?}", other),
    }
    match &calls[3] {
        RecordedCall::Error { body, .. } => {
            assert_eq!(body["errorType"], "TypeError");
            assert_eq!(body["errorMessage"], "boom");
            assert_eq!(body["stackTrace"], json!(["at fail (mod.sh)"]));
        }
        other => panic!("expected error report, got {:?}", other),
    }
}
