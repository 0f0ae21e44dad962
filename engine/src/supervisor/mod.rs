//! Reconnect Supervisor
//!
//! Keeps one [`SessionChannel`] alive against an endpoint. A single driver
//! task owns every connection attempt, so at most one attempt is ever
//! outstanding:
//!
//! ```text
//! Idle ──▶ Connecting ──ok──▶ Open ──closed──▶ Reconnecting ──delay──▶ Connecting
//!               │                                   ▲
//!               └──────────────failed───────────────┘
//!
//! teardown() from any state ──▶ Closing ──▶ Closed (terminal)
//! ```
//!
//! Delays grow as `min(base * 2^attempts, max)` and the attempt counter
//! resets on every successful open. While `Open`, a `ping` is sent every
//! keepalive interval; a zero interval disables it. A missing `pong` is not
//! treated as a failure.

use sdk::errors::EngineError;
use sdk::protocol::Message;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, CloseReason, Connector, SessionChannel};
use crate::config::ClientConfig;

/// Connection state published by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Started, the driver has not run yet.
    Idle,
    Connecting,
    Open,
    /// `teardown()` was called and the driver is winding down.
    Closing,
    Closed,
    Reconnecting,
}

/// Notifications from the driver task
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// A channel opened; the attempt counter is back to zero.
    Connected,
    /// The live channel closed for a reason other than teardown.
    Disconnected(CloseReason),
    /// A connect attempt failed.
    ConnectFailed(String),
    /// The next attempt will start after `delay`. `attempt` counts
    /// consecutive failures so far.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A message arrived on the live channel.
    Message(Message),
    /// The driver stopped after teardown.
    Stopped,
}

pub type SupervisorEvents = mpsc::UnboundedReceiver<SupervisorEvent>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub endpoint: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub keepalive_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            keepalive_interval: Duration::from_secs(30),
        }
    }

    pub fn from_client(client: &ClientConfig) -> Self {
        Self {
            endpoint: client.url.clone(),
            base_delay: client.base_delay(),
            max_delay: client.max_delay(),
            keepalive_interval: client.keepalive_interval(),
        }
    }

    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        backoff_delay(attempts, self.base_delay, self.max_delay)
    }
}

/// `min(base * 2^attempts, max)`, saturating at `max` on overflow
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    live: Mutex<Option<ChannelHandle>>,
    cancel: CancellationToken,
}

impl Inner {
    /// `Closed` is terminal and `Closing` only moves on to `Closed`, so a
    /// driver racing a teardown cannot publish a live state afterwards.
    fn publish(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                ConnectionState::Closed => false,
                ConnectionState::Closing => state == ConnectionState::Closed,
                _ => *current != state,
            };
            if allowed {
                debug!("Connection state {:?} -> {:?}", *current, state);
                *current = state;
            }
            allowed
        });
    }
}

/// Owned handle to the driver task
pub struct ReconnectSupervisor {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
    endpoint: String,
}

impl ReconnectSupervisor {
    /// Spawn the driver and begin connecting immediately.
    pub fn start<C: Connector>(connector: C, config: SupervisorConfig) -> (Self, SupervisorEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);

        let inner = Arc::new(Inner {
            state,
            attempts: AtomicU32::new(0),
            live: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let endpoint = config.endpoint.clone();
        let driver = tokio::spawn(drive(
            Arc::new(connector),
            config,
            Arc::clone(&inner),
            events_tx,
        ));

        (
            Self {
                inner,
                driver: Mutex::new(Some(driver)),
                endpoint,
            },
            events_rx,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Consecutive failed attempts since the last successful open
    pub fn attempt_count(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Send through the live channel.
    ///
    /// # Errors
    ///
    /// [`EngineError::ChannelNotOpen`] when no channel is open. Nothing is
    /// queued for a later connection.
    pub async fn send(&self, msg: &Message) -> Result<(), EngineError> {
        let handle = self.inner.live.lock().await.clone();
        match handle {
            Some(handle) => handle.send(msg).await.map_err(|e| match e {
                EngineError::ChannelClosed => EngineError::ChannelNotOpen,
                other => other,
            }),
            None => Err(EngineError::ChannelNotOpen),
        }
    }

    /// Stop for good: cancel any pending delay or connect, close the live
    /// channel and publish `Closed`. `Closing` is published while the driver
    /// winds down. Safe to call more than once.
    pub async fn teardown(&self) {
        self.inner.cancel.cancel();
        self.inner.publish(ConnectionState::Closing);

        if let Some(handle) = self.inner.live.lock().await.take() {
            handle.close();
        }

        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.await {
                warn!("Supervisor driver ended abnormally: {}", e);
            }
            info!("Supervisor for {} stopped", self.endpoint);
        }

        self.inner.publish(ConnectionState::Closed);
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn drive(
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    loop {
        inner.publish(ConnectionState::Connecting);
        debug!("Connecting to {}", config.endpoint);

        let attempt = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = connector.connect(&config.endpoint) => result,
        };

        match attempt {
            Ok(channel) => {
                inner.attempts.store(0, Ordering::SeqCst);
                *inner.live.lock().await = Some(channel.handle());
                inner.publish(ConnectionState::Open);
                info!("Connected to {}", config.endpoint);
                let _ = events.send(SupervisorEvent::Connected);

                let outcome = run_session(&channel, &config, &inner, &events).await;
                inner.live.lock().await.take();

                match outcome {
                    Some(reason) => {
                        info!("Connection to {} closed: {:?}", config.endpoint, reason);
                        let _ = events.send(SupervisorEvent::Disconnected(reason));
                    }
                    None => {
                        channel.close();
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", config.endpoint, e);
                let _ = events.send(SupervisorEvent::ConnectFailed(e.to_string()));
            }
        }

        if inner.cancel.is_cancelled() {
            break;
        }

        let attempts = inner.attempts.load(Ordering::SeqCst);
        let delay = config.backoff_delay(attempts);
        let attempt = attempts.saturating_add(1);
        inner.attempts.store(attempt, Ordering::SeqCst);
        inner.publish(ConnectionState::Reconnecting);
        info!("Reconnecting to {} in {:?} (attempt {})", config.endpoint, delay, attempt);
        let _ = events.send(SupervisorEvent::ReconnectScheduled { attempt, delay });

        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    inner.publish(ConnectionState::Closed);
    let _ = events.send(SupervisorEvent::Stopped);
}

/// Pump one open channel. Returns `None` when cancelled by teardown.
async fn run_session(
    channel: &SessionChannel,
    config: &SupervisorConfig,
    inner: &Inner,
    events: &mpsc::UnboundedSender<SupervisorEvent>,
) -> Option<CloseReason> {
    let period = config.keepalive_interval;
    let mut keepalive = if period.is_zero() {
        debug!("Keepalive disabled for {}", config.endpoint);
        None
    } else {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    };

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return None,
            event = channel.next_event() => match event {
                Some(ChannelEvent::Opened) => {}
                Some(ChannelEvent::Message(msg)) => {
                    let _ = events.send(SupervisorEvent::Message(msg));
                }
                Some(ChannelEvent::TransportError(detail)) => {
                    warn!("Transport error on {}: {}", config.endpoint, detail);
                }
                Some(ChannelEvent::Closed(reason)) => return Some(reason),
                None => return Some(CloseReason::Transport),
            },
            () = next_keepalive(&mut keepalive) => {
                if let Err(e) = channel.send(&Message::ping_now()).await {
                    debug!("Keepalive ping not sent: {}", e);
                }
            }
        }
    }
}

/// Next keepalive tick, or never when keepalive is disabled
async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
