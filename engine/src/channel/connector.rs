//! Channel factories
//!
//! The reconnect supervisor never dials sockets itself; it asks a
//! [`Connector`] for a fresh [`SessionChannel`] on every attempt.

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::time::Duration;

use super::{SessionChannel, DEFAULT_CONNECT_TIMEOUT};

/// Produces connected channels for an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<SessionChannel, EngineError>;
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<SessionChannel, EngineError> {
        SessionChannel::open_with_timeout(endpoint, self.connect_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(Duration::from_secs(2));
        let err = connector
            .connect(&format!("ws://{}/ws", addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Connect(_)));
    }
}
