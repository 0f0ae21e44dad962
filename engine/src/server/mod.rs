//! AIRI Server
//!
//! HTTP and WebSocket surface of the companion.
//!
//! # Endpoints
//!
//! - GET /ws - WebSocket upgrade, one conversation per connection
//! - GET /health - Liveness, feature flags and connection count
//! - GET /api/config - Which model providers have credentials
//! - POST /api/tts - Text-to-speech placeholder

use axum::{
    extract::State,
    http::{HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use sdk::errors::EngineError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::conversation::{ConversationExchange, ReplyStrategy};
use crate::memory::MemoryLedger;
use crate::store::PersistenceStore;

mod ws;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";

/// Which provider credentials are present in the environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderKeys {
    pub openai: bool,
    pub gemini: bool,
}

impl ProviderKeys {
    pub fn from_env() -> Self {
        let present = |name: &str| std::env::var(name).map_or(false, |v| !v.is_empty());
        Self {
            openai: present("OPENAI_API_KEY"),
            gemini: present("GEMINI_API_KEY"),
        }
    }
}

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub(crate) exchange: Arc<ConversationExchange>,
    pub(crate) store: Arc<dyn PersistenceStore>,
    pub(crate) connections: Arc<AtomicUsize>,
    pub(crate) providers: ProviderKeys,
    pub(crate) default_user: String,
}

impl AppState {
    /// Wire the ledger and exchange over `store`
    pub fn new(
        config: &Config,
        store: Arc<dyn PersistenceStore>,
        replies: Arc<dyn ReplyStrategy>,
        providers: ProviderKeys,
    ) -> Self {
        let ledger = Arc::new(MemoryLedger::new(
            Arc::clone(&store),
            config.memory.clone(),
        ));
        let exchange = Arc::new(ConversationExchange::new(
            Arc::clone(&store),
            ledger,
            replies,
            config.responder.clone(),
        ));

        Self {
            exchange,
            store,
            connections: Arc::new(AtomicUsize::new(0)),
            providers,
            default_user: config.server.default_user.clone(),
        }
    }

    /// Number of open WebSocket connections
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Build the router with CORS restricted to `allowed_origins`
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .route("/api/tts", post(tts_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind `host:port` from the config and serve until SIGTERM or Ctrl-C
pub async fn run(config: &Config, state: AppState) -> Result<(), EngineError> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Network(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("AIRI server running on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let app = router(state, &config.server.allowed_origins);
    serve(listener, app, shutdown_signal()).await
}

/// Serve `app` on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<(), EngineError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EngineError::Network(format!("Server error: {}", e)))?;

    info!("AIRI server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let database = match state.store.health_check().await {
        Ok(()) => "connected",
        Err(e) => {
            warn!("Store health check failed: {}", e);
            "unavailable"
        }
    };

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "features": {
            "websocket": true,
            "openai": state.providers.openai,
            "gemini": state.providers.gemini,
            "voice": true,
            "memory": true,
        },
        "database": database,
        "connections": state.connections(),
    }))
}

async fn config_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "providers": {
            "openai": {
                "available": state.providers.openai,
                "baseUrl": OPENAI_BASE_URL,
            },
            "gemini": {
                "available": state.providers.gemini,
                "baseUrl": GEMINI_BASE_URL,
            },
        }
    }))
}

#[derive(Debug, Deserialize)]
struct TtsRequest {
    text: String,
    #[serde(default = "default_voice")]
    voice: String,
    #[serde(default = "default_speed")]
    speed: f64,
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_speed() -> f64 {
    1.0
}

async fn tts_handler(Json(request): Json<TtsRequest>) -> Json<Value> {
    info!(
        "TTS request: \"{}\" with voice {} at {}x",
        request.text, request.voice, request.speed
    );
    Json(json!({
        "success": true,
        "message": "TTS endpoint ready, no speech provider configured",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::FixedTemplate;
    use crate::store::InMemoryStore;

    fn state(providers: ProviderKeys) -> AppState {
        AppState::new(
            &Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(FixedTemplate::new(0, "AIRI")),
            providers,
        )
    }

    #[tokio::test]
    async fn test_health_reports_features() {
        let Json(body) = health_handler(State(state(ProviderKeys {
            openai: true,
            gemini: false,
        })))
        .await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["features"]["openai"], true);
        assert_eq!(body["features"]["gemini"], false);
        assert_eq!(body["features"]["websocket"], true);
        assert_eq!(body["database"], "connected");
        assert_eq!(body["connections"], 0);
        assert!(chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_config_lists_providers() {
        let Json(body) = config_handler(State(state(ProviderKeys::default()))).await;
        assert_eq!(body["providers"]["openai"]["baseUrl"], OPENAI_BASE_URL);
        assert_eq!(body["providers"]["gemini"]["available"], false);
    }

    #[test]
    fn test_tts_defaults() {
        let request: TtsRequest = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(request.voice, "alloy");
        assert_eq!(request.speed, 1.0);
    }
}
