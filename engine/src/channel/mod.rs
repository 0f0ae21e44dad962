//! Session Channel
//!
//! A duplex, message-oriented connection to the AIRI server over WebSocket.
//!
//! Each channel runs two background tasks over the split stream:
//!
//! - **writer**: drains an ordered outbound queue, so frames hit the wire in
//!   `send` order
//! - **reader**: decodes inbound text frames into [`Message`]s and delivers
//!   them to the registered handler, or to [`SessionChannel::next_event`]
//!   when no handler is set
//!
//! Lifecycle is reported through [`ChannelEvent`]s: exactly one `Opened`,
//! any number of `TransportError`s and exactly one terminal `Closed`.
//!
//! Inbound frames that fail to parse never surface as errors. A synthesized
//! `error` message with the text `Failed to process message` is delivered
//! in their place. Frames with an unknown `type` are logged and dropped.

use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use sdk::errors::EngineError;
use sdk::protocol::{DecodeError, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod connector;

pub use connector::{Connector, WsConnector};

/// Text of the error message delivered for undecodable frames
pub const PROCESS_FAILURE: &str = "Failed to process message";

/// Connect timeout used by [`SessionChannel::open`]
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a channel closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer sent a close frame or ended the stream, with its reason if any.
    Remote(Option<String>),
    /// The transport failed.
    Transport,
}

/// Lifecycle and delivery events of a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(Message),
    TransportError(String),
    Closed(CloseReason),
}

/// Callback invoked once per inbound message, in arrival order
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

enum Outbound {
    Frame(String),
    Close,
}

struct Shared {
    closed: AtomicBool,
    local_close: AtomicBool,
    transport_failed: AtomicBool,
    handler: StdMutex<Option<MessageHandler>>,
    cancel: CancellationToken,
}

impl Shared {
    fn deliver(&self, msg: Message, events: &mpsc::UnboundedSender<ChannelEvent>) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(msg),
            None => {
                let _ = events.send(ChannelEvent::Message(msg));
            }
        }
    }
}

/// Cloneable sending half of a [`SessionChannel`]
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Queue a message for the writer task.
    ///
    /// # Errors
    ///
    /// [`EngineError::ChannelClosed`] once either side has closed the channel.
    pub async fn send(&self, msg: &Message) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ChannelClosed);
        }
        let text = msg.encode()?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Start an orderly shutdown. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.local_close.store(true, Ordering::SeqCst);
        if self.outbound.send(Outbound::Close).is_err() {
            // Writer already gone
            self.shared.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// A live duplex connection
pub struct SessionChannel {
    handle: ChannelHandle,
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl SessionChannel {
    /// Connect to `endpoint` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// [`EngineError::Connect`] on an invalid URL, refused connection, failed
    /// handshake or when [`DEFAULT_CONNECT_TIMEOUT`] elapses.
    pub async fn open(endpoint: &str) -> Result<Self, EngineError> {
        Self::open_with_timeout(endpoint, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn open_with_timeout(endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        debug!("Connecting to {}", endpoint);

        let connect = tokio_tungstenite::connect_async(endpoint);
        let (ws, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                EngineError::Connect(format!("timed out after {:?} connecting to {}", timeout, endpoint))
            })?
            .map_err(|e| EngineError::Connect(format!("{}: {}", endpoint, e)))?;

        info!("Connected to {}", endpoint);
        Ok(Self::from_socket(ws))
    }

    /// Wrap an established WebSocket stream and start the reader and writer
    /// tasks. Must be called inside a tokio runtime.
    pub fn from_socket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            local_close: AtomicBool::new(false),
            transport_failed: AtomicBool::new(false),
            handler: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });

        let _ = events_tx.send(ChannelEvent::Opened);

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            Arc::clone(&shared),
            events_tx.clone(),
        ));
        tokio::spawn(read_loop(stream, Arc::clone(&shared), events_tx));

        Self {
            handle: ChannelHandle {
                outbound: outbound_tx,
                shared,
            },
            events: Mutex::new(events_rx),
        }
    }

    /// See [`ChannelHandle::send`].
    pub async fn send(&self, msg: &Message) -> Result<(), EngineError> {
        self.handle.send(msg).await
    }

    /// Route every later inbound message to `handler` instead of
    /// [`next_event`](Self::next_event). Replaces any earlier handler.
    ///
    /// The handler runs on the reader task and must not block.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self
            .handle
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Next lifecycle or message event. `None` once the channel has closed
    /// and every event has been consumed.
    pub async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }

    /// See [`ChannelHandle::close`].
    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.handle.close();
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!("Channel write failed: {}", e);
                        shared.transport_failed.store(true, Ordering::SeqCst);
                        shared.closed.store(true, Ordering::SeqCst);
                        let _ = events.send(ChannelEvent::TransportError(e.to_string()));
                        shared.cancel.cancel();
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = sink.send(WsMessage::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    shared.cancel.cancel();
                    break;
                }
            },
            () = shared.cancel.cancelled() => break,
        }
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reason = loop {
        tokio::select! {
            () = shared.cancel.cancelled() => {
                break if shared.transport_failed.load(Ordering::SeqCst) {
                    CloseReason::Transport
                } else {
                    CloseReason::Local
                };
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => handle_frame(&text, &shared, &events),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => handle_frame(&text, &shared, &events),
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        shared.deliver(Message::error(PROCESS_FAILURE), &events);
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let detail = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    info!("Channel closed by peer ({:?})", detail);
                    break CloseReason::Remote(detail);
                }
                Some(Ok(_)) => {} // Ping, Pong, raw frames
                Some(Err(e)) => {
                    if shared.local_close.load(Ordering::SeqCst) {
                        break CloseReason::Local;
                    }
                    warn!("Channel read failed: {}", e);
                    let _ = events.send(ChannelEvent::TransportError(e.to_string()));
                    break CloseReason::Transport;
                }
                None => {
                    info!("Channel stream ended");
                    break CloseReason::Remote(None);
                }
            },
        }
    };

    let reason = if shared.local_close.load(Ordering::SeqCst) {
        CloseReason::Local
    } else {
        reason
    };

    shared.closed.store(true, Ordering::SeqCst);
    shared.cancel.cancel();
    let _ = events.send(ChannelEvent::Closed(reason));
}

/// What an inbound text frame turns into
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed message of a known kind
    Message(Message),
    /// The frame could not be parsed; this error goes back to the sender
    Rejected(Message),
}

/// Decode one inbound text frame
///
/// Unknown kinds are logged and dropped. Malformed frames become
/// [`Inbound::Rejected`] carrying a [`PROCESS_FAILURE`] error message.
pub fn inbound(text: &str) -> Option<Inbound> {
    match Message::decode(text) {
        Ok(msg) => Some(Inbound::Message(msg)),
        Err(DecodeError::UnknownKind(kind)) => {
            warn!("Ignoring message with unknown type '{}'", kind);
            None
        }
        Err(DecodeError::Malformed(detail)) => {
            warn!("Failed to parse inbound message: {}", detail);
            Some(Inbound::Rejected(Message::error(PROCESS_FAILURE)))
        }
    }
}

fn handle_frame(text: &str, shared: &Shared, events: &mpsc::UnboundedSender<ChannelEvent>) {
    if let Some(Inbound::Message(msg) | Inbound::Rejected(msg)) = inbound(text) {
        shared.deliver(msg, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};

    async fn pair() -> (SessionChannel, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (SessionChannel::from_socket(client), server)
    }

    async fn next_message(channel: &SessionChannel) -> Message {
        match channel.next_event().await {
            Some(ChannelEvent::Message(msg)) => msg,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opened_then_messages_in_order() {
        let (channel, mut server) = pair().await;

        server
            .send(WsMessage::Text(r#"{"type":"pong","data":{"timestamp":1}}"#.into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Text(r#"{"type":"pong","data":{"timestamp":2}}"#.into()))
            .await
            .unwrap();

        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));
        assert!(matches!(next_message(&channel).await, Message::Pong(p) if p.timestamp == 1));
        assert!(matches!(next_message(&channel).await, Message::Pong(p) if p.timestamp == 2));
    }

    #[test]
    fn test_inbound_classifies_frames() {
        assert_eq!(
            inbound(r#"{"type":"pong","data":{"timestamp":3}}"#),
            Some(Inbound::Message(Message::Pong(sdk::protocol::Pong { timestamp: 3 })))
        );
        assert_eq!(
            inbound("{\"type\":"),
            Some(Inbound::Rejected(Message::error(PROCESS_FAILURE)))
        );
        assert_eq!(inbound(r#"{"type":"dance","data":{}}"#), None);
    }

    #[tokio::test]
    async fn test_handler_survives_poisoned_lock() {
        let (channel, mut server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        // Poison the handler slot from a panicking thread
        let shared = Arc::clone(&channel.handle.shared);
        let _ = std::thread::spawn(move || {
            let _guard = shared.handler.lock().unwrap();
            panic!("handler slot poisoned");
        })
        .join();
        assert!(channel.handle.shared.handler.is_poisoned());

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |msg| {
            let _ = tx.send(msg);
        });

        server
            .send(WsMessage::Text(r#"{"type":"pong","data":{"timestamp":9}}"#.into()))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Message::Pong(p)) if p.timestamp == 9));
    }

    #[tokio::test]
    async fn test_malformed_frame_becomes_error_message() {
        let (channel, mut server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        server.send(WsMessage::Text("not json".into())).await.unwrap();

        assert_eq!(next_message(&channel).await, Message::error(PROCESS_FAILURE));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_dropped() {
        let (channel, mut server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        server
            .send(WsMessage::Text(r#"{"type":"dance","data":{}}"#.into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();

        assert!(matches!(next_message(&channel).await, Message::Ping(_)));
    }

    #[tokio::test]
    async fn test_sends_arrive_in_order() {
        let (channel, mut server) = pair().await;

        for text in ["one", "two", "three"] {
            channel.send(&Message::text(text)).await.unwrap();
        }

        for expected in ["one", "two", "three"] {
            let frame = server.next().await.unwrap().unwrap();
            let msg = Message::decode(frame.to_text().unwrap()).unwrap();
            assert_eq!(msg, Message::text(expected));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (channel, _server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        channel.close();
        channel.close();

        let err = channel.send(&Message::text("late")).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));

        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Closed(CloseReason::Local))
        );
        assert_eq!(channel.next_event().await, None);
    }

    #[tokio::test]
    async fn test_remote_close_carries_reason() {
        let (channel, mut server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        server
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();

        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Closed(CloseReason::Remote(Some("bye".into()))))
        );
        let err = channel.send(&Message::text("hello?")).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_channel() {
        let (channel, server) = pair().await;
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));

        drop(server);

        let mut terminal = None;
        while let Some(event) = channel.next_event().await {
            if let ChannelEvent::Closed(reason) = event {
                terminal = Some(reason);
            }
        }
        let reason = terminal.expect("channel never reported Closed");
        assert_ne!(reason, CloseReason::Local);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_handler_receives_messages() {
        let (channel, mut server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |msg| {
            let _ = tx.send(msg);
        });

        server
            .send(WsMessage::Text(r#"{"type":"module:authenticated","data":{"authenticated":true}}"#.into()))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind(), "module:authenticated");

        // Only lifecycle events remain on the queue
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Opened));
    }

    #[tokio::test]
    async fn test_open_invalid_url() {
        let err = SessionChannel::open("not a url").await.err().unwrap();
        assert!(matches!(err, EngineError::Connect(_)));
    }
}
