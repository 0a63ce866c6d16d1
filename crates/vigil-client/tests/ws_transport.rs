//! End-to-end tests for the WebSocket transport against an in-process
//! axum server.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use vigil_client::transport::{Transport, TransportEventKind};
use vigil_client::{ConnectionManager, ManagerConfig, ReconnectPolicy, WsTransport};
use vigil_core::{ConnectionEvent, ConnectionId, IdentityBinder};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

/// Scripted analysis backend: answers every request with start, log and
/// complete frames. A prompt of "close_me" closes the socket with 1011.
async fn handle_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text.to_string()) else {
            continue;
        };
        match frame["type"].as_str() {
            Some("analysis_request") => {
                if frame["prompt"] == "close_me" {
                    let close = CloseFrame {
                        code: 1011,
                        reason: String::from("backend restarting").into(),
                    };
                    let _ = socket.send(WsMessage::Close(Some(close))).await;
                    return;
                }
                let replies = [
                    json!({"type": "analysis_start", "analysis_id": "a1"}),
                    json!({"type": "log", "level": "info", "message": "🔍 Received analysis request"}),
                    json!({"type": "analysis_complete", "result": {"ai_response": "No issues found."}, "processing_time": 0.4}),
                ];
                for reply in replies {
                    if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
            Some("authenticate") => {
                let ok = json!({"type": "auth_success"});
                let _ = socket.send(WsMessage::Text(ok.to_string().into())).await;
            }
            _ => {
                let _ = socket.send(WsMessage::Text(text)).await;
            }
        }
    }
}

async fn boot_server() -> String {
    let router = Router::new().route("/ws", get(ws_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    }));
    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn raw_link_opens_echoes_and_closes_once() {
    let url = boot_server().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = WsTransport::default().open(&url, ConnectionId(1), tx);

    let opened = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(opened.kind, TransportEventKind::Opened);

    assert!(link.send(r#"{"type":"heartbeat"}"#.into()));
    let echoed = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        echoed.kind,
        TransportEventKind::Received(r#"{"type":"heartbeat"}"#.into())
    );

    link.close(1000, "done");
    let closed = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        closed.kind,
        TransportEventKind::Closed { code: 1000, was_clean: true, .. }
    ));
    drop(link);
    assert!(timeout(TIMEOUT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn manager_flushes_queued_request_and_receives_turn() {
    let url = boot_server().await;
    let binder = std::sync::Arc::new(IdentityBinder::anonymous());
    let config = ManagerConfig {
        url,
        ..Default::default()
    };
    let transport = WsTransport::new(config.ws_config());
    let (handle, _task) =
        ConnectionManager::spawn(config, transport, Some(std::sync::Arc::clone(&binder)));

    let (kinds_tx, mut kinds_rx) = mpsc::unbounded_channel();
    let _sub = handle.subscribe(move |env| {
        let _ = kinds_tx.send(env.kind());
    });

    let outcome = handle.send(binder.analysis_request("review lib.rs")).await.unwrap();
    assert!(outcome.is_accepted());

    let mut kinds = Vec::new();
    while kinds.last() != Some(&"analysis_complete") {
        kinds.push(timeout(TIMEOUT, kinds_rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        kinds,
        vec!["auth_success", "analysis_start", "log", "analysis_complete"]
    );

    let status = handle.current_status().await.unwrap();
    assert!(status.is_connected());
    assert!(status.authenticated);
    assert_eq!(status.queued, 0);
}

#[tokio::test]
async fn server_close_triggers_backoff_reconnect() {
    let url = boot_server().await;
    let binder = IdentityBinder::anonymous();
    let config = ManagerConfig {
        url,
        policy: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    };
    let transport = WsTransport::new(config.ws_config());
    let (handle, _task) = ConnectionManager::spawn(config, transport, None);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _sub = handle.subscribe_events(move |e| {
        let _ = events_tx.send(e.clone());
    });

    handle.send(binder.analysis_request("close_me")).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = timeout(TIMEOUT, events_rx.recv()).await.unwrap().unwrap();
        let done = event == ConnectionEvent::Opened { after_retry: true };
        seen.push(event);
        if done {
            break;
        }
    }

    assert!(seen.iter().any(|e| matches!(
        e,
        ConnectionEvent::Closed { code: 1011, was_open: true, .. }
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ConnectionEvent::ReconnectScheduled { attempt: 1, .. })));
    assert!(handle.current_status().await.unwrap().is_connected());
}
