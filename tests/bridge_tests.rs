//! End-to-end tests driving a bridge session through the in-memory runtime

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reson_ui::bridge::{Bridge, BridgeConfig, BridgeHandle, Diagnostic, SendOptions, SurfaceTarget};
use reson_ui::dispatch::{HandlerSet, NoCapabilities};
use reson_ui::envelope::{DecodeError, Envelope, Message, MessageType, SizeChange};
use reson_ui::error::{codes, Error};
use reson_ui::transport::{GuestEndpoint, MemoryRuntime, SourceId};
use reson_ui::Phase;
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn html() -> BridgeConfig {
    BridgeConfig::new(SurfaceTarget::RawHtml("<div id=\"app\"></div>".to_string()))
}

type Seen = Arc<Mutex<Vec<Diagnostic>>>;

fn mount_with(
    handlers: HandlerSet,
    config: BridgeConfig,
) -> (Arc<MemoryRuntime>, BridgeHandle, GuestEndpoint, Seen) {
    init_tracing();
    let runtime = MemoryRuntime::new();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = Bridge::new(runtime.clone(), Arc::new(handlers))
        .with_diagnostics(move |d| sink.lock().unwrap().push(d))
        .mount(config)
        .expect("mount failed");
    let guest = runtime.take_guest().expect("no guest endpoint");
    (runtime, handle, guest, seen)
}

async fn next(guest: &mut GuestEndpoint) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), guest.recv_envelope())
        .await
        .expect("timed out waiting for host message")
        .expect("host channel closed")
}

async fn make_ready(handle: &BridgeHandle, guest: &GuestEndpoint) {
    guest.post(json!({"type": "ready-signal"}));
    handle.ready().await.expect("guest never became ready");
}

#[tokio::test]
async fn test_tool_call_round_trip() {
    let handlers = HandlerSet::new().on_tool_call(|request| {
        Box::pin(async move {
            Ok(json!({
                "content": [{"type": "text", "text": format!("{} {}", request.tool_name, request.params["city"])}]
            }))
        })
    });
    let (_runtime, handle, mut guest, _seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;

    guest.post(json!({
        "type": "tool-call-request",
        "requestId": "r1",
        "payload": {"toolName": "forecast", "params": {"city": "Oslo"}}
    }));

    let reply = next(&mut guest).await;
    assert_eq!(reply.message_type(), MessageType::ToolCallResponse);
    assert_eq!(reply.request_id.as_deref(), Some("r1"));
    assert_eq!(
        reply.message,
        Message::ToolCallResponse(json!({"content": [{"type": "text", "text": "forecast \"Oslo\""}]}))
    );
}

#[tokio::test]
async fn test_messages_buffered_until_ready_in_order() {
    let (_runtime, handle, mut guest, _seen) = mount_with(HandlerSet::new(), html());

    for n in 1..=3 {
        handle.send_render_data(json!({"n": n})).unwrap();
    }
    assert_eq!(handle.buffered_messages(), 3);
    assert!(guest.try_recv().is_none());

    make_ready(&handle, &guest).await;
    for n in 1..=3 {
        let envelope = next(&mut guest).await;
        assert_eq!(envelope.message, Message::RenderData(json!({"n": n})));
    }
    assert!(guest.try_recv().is_none());
    assert_eq!(handle.buffered_messages(), 0);
    assert_eq!(handle.phase(), Phase::Active);

    // A second ready signal must not replay anything
    guest.post(json!({"type": "ready-signal"}));
    handle.send_render_data(json!({"n": 4})).unwrap();
    assert_eq!(next(&mut guest).await.message, Message::RenderData(json!({"n": 4})));
}

#[tokio::test]
async fn test_initial_render_data_delivered_on_ready() {
    let config = html().with_initial_render_data(json!({"rows": [1, 2]}));
    let (_runtime, handle, mut guest, _seen) = mount_with(HandlerSet::new(), config);

    assert_eq!(handle.phase(), Phase::Mounted);
    make_ready(&handle, &guest).await;
    assert_eq!(next(&mut guest).await.message, Message::RenderData(json!({"rows": [1, 2]})));
    assert_eq!(handle.phase(), Phase::Active);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let (_runtime, handle, mut guest, _seen) = mount_with(HandlerSet::new(), html());

    let (outcome, delivered) = tokio::join!(
        handle.send_to_guest(
            MessageType::RenderData,
            json!({"x": 1}),
            SendOptions::expect_reply().with_timeout(Duration::from_secs(5)),
        ),
        async {
            guest.post(json!({"type": "ready-signal"}));
            next(&mut guest).await
        }
    );

    assert_eq!(delivered.message, Message::RenderData(json!({"x": 1})));
    assert!(delivered.request_id.is_some());
    let err = outcome.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(handle.pending_requests(), 0);
}

#[tokio::test]
async fn test_guest_response_resolves_request() {
    let (_runtime, handle, mut guest, seen) = mount_with(HandlerSet::new(), html());
    make_ready(&handle, &guest).await;

    let (outcome, ()) = tokio::join!(
        handle.send_to_guest(MessageType::RenderData, json!({"ask": true}), SendOptions::expect_reply()),
        async {
            let request = next(&mut guest).await;
            let request_id = request.request_id.expect("request carries an id");
            guest.post(json!({"type": "guest-response", "requestId": request_id, "payload": {"ok": true}}));
        }
    );
    assert_eq!(outcome.unwrap(), Some(json!({"ok": true})));

    // Replies nobody is waiting for are only reported
    guest.post(json!({"type": "guest-response", "requestId": "host-late-1", "payload": {}}));
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        seen.lock().unwrap()[0],
        Diagnostic::UnmatchedReply {
            request_id: "host-late-1".to_string()
        }
    );
}

#[tokio::test]
async fn test_guest_error_rejects_request() {
    let (_runtime, handle, mut guest, _seen) = mount_with(HandlerSet::new(), html());
    make_ready(&handle, &guest).await;

    let (outcome, ()) = tokio::join!(
        handle.request_guest(Message::RenderData(json!({})), None),
        async {
            let request = next(&mut guest).await;
            guest.post(json!({
                "type": "error",
                "requestId": request.request_id,
                "payload": {"message": "render failed", "code": -32000}
            }));
        }
    );
    match outcome.unwrap_err() {
        Error::Guest { code, message } => {
            assert_eq!(code, codes::HANDLER_FAILED);
            assert_eq!(message, "render failed");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_dispose_cancels_pending_and_rejects_sends() {
    let (runtime, handle, mut guest, _seen) = mount_with(HandlerSet::new(), html());
    make_ready(&handle, &guest).await;

    let (outcome, ()) = tokio::join!(
        handle.request_guest(Message::RenderData(json!({})), Some(Duration::from_secs(60))),
        async {
            next(&mut guest).await;
            handle.dispose();
        }
    );
    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(handle.phase(), Phase::Disposed);
    assert_eq!(runtime.live_frames(), 0);
    assert_eq!(guest.transport().listener_count(), 0);

    assert!(matches!(handle.send_render_data(json!({})), Err(Error::Disposed)));
    assert!(matches!(
        handle
            .send_to_guest(MessageType::RenderData, json!({}), SendOptions::expect_reply())
            .await,
        Err(Error::Disposed)
    ));

    handle.dispose();
    assert_eq!(runtime.destroyed().len(), 1);
}

#[tokio::test]
async fn test_spoofed_source_never_reaches_handlers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handlers = HandlerSet::new().on_tool_call(move |_request| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(json!({"content": []})) })
    });
    let (_runtime, handle, mut guest, seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;

    let request = json!({"type": "tool-call-request", "requestId": "spoof", "payload": {"toolName": "wipe"}});
    guest.post_as(SourceId::new("frame-999"), "null", request.clone());
    guest.post_as(guest.source().clone(), "https://attacker.example", request);

    guest.post(json!({"type": "tool-call-request", "requestId": "real", "payload": {"toolName": "list"}}));
    let reply = next(&mut guest).await;
    assert_eq!(reply.request_id.as_deref(), Some("real"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(guest.try_recv().is_none());

    let rejected = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|d| matches!(d, Diagnostic::RejectedSource { .. }))
        .count();
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn test_malformed_messages_are_dropped_with_diagnostics() {
    let (_runtime, handle, mut guest, seen) = mount_with(HandlerSet::new(), html());
    make_ready(&handle, &guest).await;

    guest.post(json!("not an object"));
    guest.post(json!({"type": "self-destruct", "requestId": "bad-1"}));

    let reply = next(&mut guest).await;
    assert_eq!(reply.request_id.as_deref(), Some("bad-1"));
    match reply.message {
        Message::Error(error) => assert_eq!(error.code, codes::INVALID_REQUEST),
        other => panic!("expected error envelope, got {other:?}"),
    }

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            Diagnostic::Malformed {
                error: DecodeError::NotAnObject
            },
            Diagnostic::Malformed {
                error: DecodeError::UnknownType("self-destruct".to_string())
            },
        ]
    );
    assert_eq!(handle.phase(), Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_does_not_block_others() {
    let handlers = HandlerSet::new().on_tool_call(|request| {
        Box::pin(async move {
            if request.tool_name == "slow" {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(json!({"tool": request.tool_name}))
        })
    });
    let (_runtime, handle, mut guest, _seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;

    guest.post(json!({"type": "tool-call-request", "requestId": "a", "payload": {"toolName": "slow"}}));
    guest.post(json!({"type": "tool-call-request", "requestId": "b", "payload": {"toolName": "fast"}}));

    assert_eq!(next(&mut guest).await.request_id.as_deref(), Some("b"));
    assert_eq!(next(&mut guest).await.request_id.as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_in_flight_request_id_rejected() {
    let handlers = HandlerSet::new().on_prompt(|request| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(json!({"prompt": request.prompt}))
        })
    });
    let (_runtime, handle, mut guest, seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;

    let prompt = json!({"type": "prompt-request", "requestId": "p1", "payload": {"prompt": "hi"}});
    guest.post(prompt.clone());
    guest.post(prompt);

    let first = next(&mut guest).await;
    assert_eq!(first.message_type(), MessageType::Error);
    let second = next(&mut guest).await;
    assert_eq!(second.message, Message::PromptResponse(json!({"prompt": "hi"})));
    assert!(seen
        .lock()
        .unwrap()
        .contains(&Diagnostic::DuplicateRequest { request_id: "p1".to_string() }));
}

#[tokio::test]
async fn test_unbound_capability_answers_unsupported() {
    init_tracing();
    let runtime = MemoryRuntime::new();
    let handle = Bridge::new(runtime.clone(), Arc::new(NoCapabilities))
        .mount(html())
        .unwrap();
    let mut guest = runtime.take_guest().unwrap();
    make_ready(&handle, &guest).await;

    guest.post(json!({"type": "link-open-request", "requestId": "l1", "payload": {"url": "https://example.com"}}));
    let reply = next(&mut guest).await;
    match reply.message {
        Message::Error(error) => {
            assert_eq!(error.code, codes::UNSUPPORTED);
            assert_eq!(error.request_id.as_deref(), Some("l1"));
        }
        other => panic!("expected error envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn test_message_ids_acknowledged_and_render_data_resent() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let recorded = sizes.clone();
    let handlers = HandlerSet::new().on_size_change(move |size| recorded.lock().unwrap().push(size));
    let (_runtime, handle, mut guest, _seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;
    handle.send_render_data(json!({"v": 1})).unwrap();
    assert_eq!(next(&mut guest).await.message, Message::RenderData(json!({"v": 1})));

    guest.post(json!({"type": "size-change", "messageId": "m1", "payload": {"width": 320, "height": 200}}));
    let ack = next(&mut guest).await;
    assert_eq!(ack.message, Message::MessageReceived);
    assert_eq!(ack.message_id.as_deref(), Some("m1"));

    guest.post(json!({"type": "render-data-request"}));
    assert_eq!(next(&mut guest).await.message, Message::RenderData(json!({"v": 1})));
    assert_eq!(
        *sizes.lock().unwrap(),
        vec![SizeChange {
            width: Some(320),
            height: Some(200)
        }]
    );
}

#[tokio::test]
async fn test_load_failure_rejects_ready() {
    let (runtime, handle, _guest, seen) = mount_with(HandlerSet::new(), html());
    handle.report_load_error("net::ERR_BLOCKED");

    match handle.ready().await {
        Err(Error::SurfaceLoad(reason)) => assert_eq!(reason, "net::ERR_BLOCKED"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(handle.phase(), Phase::Disposed);
    assert_eq!(runtime.live_frames(), 0);
    assert!(seen.lock().unwrap().contains(&Diagnostic::LoadFailed {
        reason: "net::ERR_BLOCKED".to_string()
    }));
}

#[tokio::test]
async fn test_runtime_failure_fails_mount() {
    init_tracing();
    let runtime = MemoryRuntime::new();
    runtime.fail_next("frame blocked");
    let err = Bridge::new(runtime.clone(), Arc::new(NoCapabilities))
        .mount(html())
        .unwrap_err();
    assert!(matches!(err, Error::SurfaceLoad(reason) if reason == "frame blocked"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_rejects_buffered_request() {
    let (_runtime, handle, guest, seen) = mount_with(HandlerSet::new(), html());
    let started = tokio::time::Instant::now();

    let (outcome, ()) = tokio::join!(
        handle.request_guest(Message::RenderData(json!({"x": 1})), None),
        async {
            guest.transport().close();
            guest.post(json!({"type": "ready-signal"}));
        }
    );

    assert!(matches!(outcome, Err(Error::Transport(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.pending_requests(), 0);
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|d| matches!(d, Diagnostic::SendFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_dispose_abandons_running_handlers() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (on_start, on_finish) = (started.clone(), finished.clone());
    let handlers = HandlerSet::new().on_tool_call(move |_request| {
        let (on_start, on_finish) = (on_start.clone(), on_finish.clone());
        Box::pin(async move {
            on_start.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            on_finish.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"content": []}))
        })
    });
    let (_runtime, handle, guest, _seen) = mount_with(handlers, html());
    make_ready(&handle, &guest).await;

    guest.post(json!({"type": "tool-call-request", "requestId": "long", "payload": {"toolName": "export"}}));
    while started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    handle.dispose();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}
