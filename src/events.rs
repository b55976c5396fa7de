//! Application callbacks.
//!
//! A session reports everything that happens to it through a [`Handler`]: the open, every
//! received message, errors and exactly one close. Callbacks run one at a time in receipt
//! order, and a panicking callback is reported through [`Handler::on_error`] instead of tearing
//! down the session.
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{close::CloseCode, Message, WebSocket, WebSocketError};

/// The final event of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: CloseCode,
    pub reason: String,
    /// `true` when the close frames were exchanged in both directions.
    pub was_clean: bool,
}

impl CloseEvent {
    /// A close without handshake.
    pub(crate) fn abnormal() -> Self {
        Self {
            code: CloseCode::Abnormal,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// Receives the events of a session.
///
/// All methods have empty default implementations. `on_close` is always the last call made.
pub trait Handler: Send + Sync + 'static {
    /// The session is open and can send.
    fn on_open(&self, _ws: &WebSocket) {}

    /// A complete message (or a ping, with `emit_on_ping`).
    fn on_message(&self, _ws: &WebSocket, _message: Message) {}

    /// An error ended, or is about to end, the session, or a callback panicked.
    fn on_error(&self, _ws: &WebSocket, _error: Arc<WebSocketError>) {}

    /// The session is closed.
    fn on_close(&self, _ws: &WebSocket, _event: CloseEvent) {}
}

impl Handler for () {}

impl<H: Handler> Handler for Arc<H> {
    fn on_open(&self, ws: &WebSocket) {
        (**self).on_open(ws)
    }

    fn on_message(&self, ws: &WebSocket, message: Message) {
        (**self).on_message(ws, message)
    }

    fn on_error(&self, ws: &WebSocket, error: Arc<WebSocketError>) {
        (**self).on_error(ws, error)
    }

    fn on_close(&self, ws: &WebSocket, event: CloseEvent) {
        (**self).on_close(ws, event)
    }
}

/// A session event, as produced by [`channel`].
#[derive(Debug, Clone)]
pub enum Event {
    Open,
    Message(Message),
    Error(Arc<WebSocketError>),
    Close(CloseEvent),
}

/// A [`Handler`] forwarding every event into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Event>,
}

impl Handler for ChannelHandler {
    fn on_open(&self, _ws: &WebSocket) {
        let _ = self.tx.send(Event::Open);
    }

    fn on_message(&self, _ws: &WebSocket, message: Message) {
        let _ = self.tx.send(Event::Message(message));
    }

    fn on_error(&self, _ws: &WebSocket, error: Arc<WebSocketError>) {
        let _ = self.tx.send(Event::Error(error));
    }

    fn on_close(&self, _ws: &WebSocket, event: CloseEvent) {
        let _ = self.tx.send(Event::Close(event));
    }
}

/// Creates a handler that forwards events to the returned receiver.
///
/// The receiver yields `None` once the session closed and the handler was dropped.
///
/// # Example
/// ```no_run
/// use wsengine::{Event, WebSocket};
///
/// async fn run() -> wsengine::Result<()> {
///     let (handler, mut events) = wsengine::events::channel();
///     let ws = WebSocket::connect("ws://localhost:8080".parse()?)
///         .with_handler(handler)
///         .await?;
///
///     ws.send_text("hello").await?;
///     while let Some(event) = events.recv().await {
///         match event {
///             Event::Message(message) => println!("{:?}", message.as_str()),
///             Event::Close(_) => break,
///             _ => {}
///         }
///     }
///     Ok(())
/// }
/// ```
pub fn channel() -> (ChannelHandler, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHandler { tx }, rx)
}
