//! End-to-end tests against a live server on an ephemeral port
//!
//! HTTP endpoints are exercised with reqwest, the WebSocket protocol with a
//! raw tokio-tungstenite client.

use airi_engine::config::Config;
use airi_engine::conversation::FixedTemplate;
use airi_engine::server::{self, AppState, ProviderKeys};
use airi_engine::store::{InMemoryStore, PersistenceStore};
use futures::{SinkExt, StreamExt};
use sdk::protocol::{now_millis, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    store: Arc<InMemoryStore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let config = Config::default();
        let store = Arc::new(InMemoryStore::new());
        let state = AppState::new(
            &config,
            store.clone(),
            Arc::new(FixedTemplate::new(0, "AIRI")),
            ProviderKeys {
                openai: true,
                gemini: false,
            },
        );
        let app = server::router(state, &config.server.allowed_origins);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            server::serve(listener, app, async move {
                rx.await.ok();
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            store,
            shutdown: Some(tx),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self) -> Client {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        match recv(&mut ws).await {
            Message::Connected(c) => {
                assert_eq!(c.message, "Connected to AIRI Backend");
                assert!(c.features.voice && c.features.memory);
                assert!(c.features.openai);
                assert!(!c.features.gemini);
            }
            other => panic!("expected connected greeting, got {:?}", other),
        }
        ws
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}

async fn send_raw(ws: &mut Client, text: &str) {
    ws.send(WsMessage::Text(text.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return Message::decode(&text).unwrap();
        }
    }
}

async fn user_counts(store: &InMemoryStore) -> (u64, u64) {
    let user = store.ensure_user("guest").await.unwrap();
    let counts = store.memory_stats(&user.id).await.unwrap();
    (counts.short_term, counts.long_term)
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::start().await;

    let body: serde_json::Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["features"]["websocket"], true);
    assert_eq!(body["features"]["openai"], true);
    assert_eq!(body["features"]["gemini"], false);
    assert_eq!(body["connections"], 0);

    server.stop().await;
}

#[tokio::test]
async fn test_health_counts_connections() {
    let server = TestServer::start().await;
    let ws = server.connect().await;

    let body: serde_json::Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connections"], 1);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn test_config_endpoint() {
    let server = TestServer::start().await;

    let body: serde_json::Value = reqwest::get(server.url("/api/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["providers"]["openai"]["available"], true);
    assert_eq!(
        body["providers"]["gemini"]["baseUrl"],
        "https://generativelanguage.googleapis.com/v1beta/"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_tts_endpoint() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/api/tts"))
        .json(&serde_json::json!({"text": "Hello"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    server.stop().await;
}

#[tokio::test]
async fn test_cors_allows_configured_origin() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .get(server.url("/health"))
        .header("Origin", "http://localhost:5174")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:5174")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_text_exchange() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    // Wait until the session exists before reading the baseline
    send_raw(&mut ws, r#"{"type":"ping","data":{}}"#).await;
    recv(&mut ws).await;
    let (before, _) = user_counts(&server.store).await;

    send_raw(&mut ws, r#"{"type":"input:text","data":{"text":"Hello"}}"#).await;

    match recv(&mut ws).await {
        Message::AiResponse(r) => {
            assert!(r.content.contains("Hello"));
            assert_eq!(r.metadata.provider, "openai");
            assert_eq!(r.metadata.model.as_deref(), Some("gpt-4"));
            let stats = r.metadata.memory_stats.unwrap();
            assert_eq!(stats.short_term, before + 2);
            assert_eq!(stats.total, stats.short_term + stats.long_term);
        }
        other => panic!("expected ai_response, got {:?}", other),
    }

    let (after, _) = user_counts(&server.store).await;
    assert_eq!(after, before + 2);

    server.stop().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    let sent_at = now_millis();
    send_raw(&mut ws, r#"{"type":"ping","data":{}}"#).await;

    match recv(&mut ws).await {
        Message::Pong(p) => assert!(p.timestamp >= sent_at),
        other => panic!("expected pong, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_input_yields_one_error() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    send_raw(&mut ws, r#"{"type":"ping","data":{}}"#).await;
    recv(&mut ws).await;
    let before = user_counts(&server.store).await;

    send_raw(&mut ws, "{this is not json").await;
    assert_eq!(recv(&mut ws).await, Message::error("Failed to process message"));

    // The next reply is the pong, not a second error
    send_raw(&mut ws, r#"{"type":"ping"}"#).await;
    assert!(matches!(recv(&mut ws).await, Message::Pong(_)));

    assert_eq!(user_counts(&server.store).await, before);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_type_is_ignored() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    send_raw(&mut ws, r#"{"type":"dance","data":{}}"#).await;
    send_raw(&mut ws, r#"{"type":"module:authenticate","data":{}}"#).await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply.kind(), "module:authenticated");

    server.stop().await;
}

#[tokio::test]
async fn test_voice_input() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    send_raw(&mut ws, r#"{"type":"input:voice","data":{"audio":"AAAA"}}"#).await;

    match recv(&mut ws).await {
        Message::AiResponse(r) => {
            assert_eq!(
                r.content,
                "I heard your voice message! Voice processing is working."
            );
            assert_eq!(r.metadata.provider, "voice");
            assert_eq!(r.metadata.transcription, Some(true));
        }
        other => panic!("expected ai_response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_replies_keep_frame_order() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    send_raw(&mut ws, r#"{"type":"input:text","data":{"text":"first"}}"#).await;
    send_raw(&mut ws, r#"{"type":"ping"}"#).await;
    send_raw(&mut ws, r#"{"type":"input:text","data":{"text":"second"}}"#).await;

    match recv(&mut ws).await {
        Message::AiResponse(r) => assert!(r.content.contains("first")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(recv(&mut ws).await, Message::Pong(_)));
    match recv(&mut ws).await {
        Message::AiResponse(r) => assert!(r.content.contains("second")),
        other => panic!("unexpected {:?}", other),
    }

    server.stop().await;
}
