//! The session state machine.
//!
//! A [`WebSocket`] is a cheap, cloneable handle to one session. The session moves through
//! `Connecting → Open → Closing → Closed` and never goes back. While it is open a receive loop
//! task decodes frames, answers control frames and hands complete messages to the dispatcher,
//! which calls the [`Handler`](crate::Handler) one event at a time.
//!
//! Concurrency is organised around one owner per concern:
//!
//! - the state lock (`inner`) guards the ready state and the negotiated values,
//! - the send lock (`writer`) serializes writes so that the frames of one message are
//!   contiguous on the wire,
//! - the ping lock serializes user pings, each waiting for the next pong.
mod closing;
mod control;
mod dispatch;
mod fragment;
mod receive;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::{
    io::WriteHalf,
    sync::{oneshot, watch},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    close::{CloseCode, PayloadData},
    codec::{Decoder, Encoder},
    compression::Deflater,
    events::{CloseEvent, Event, Handler},
    extensions::Extensions,
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    options::{Config, Negotiation},
    stream::BoxedStream,
    Options, Result, WebSocketError,
};

use dispatch::Dispatcher;

/// The role the websocket stream is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => {
                write!(f, "server")
            }
            Self::Client => {
                write!(f, "client")
            }
        }
    }
}

/// The lifecycle state of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// The handshake is in progress.
    Connecting,
    /// Messages can be sent and received.
    Open,
    /// A close frame was sent or received, the session is shutting down.
    Closing,
    /// Terminal.
    Closed,
}

/// What the receive loop observed last, as seen by a waiting close initiator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ReadStatus {
    Reading,
    CloseReceived,
    Stopped,
}

struct Inner {
    state: ReadyState,
    protocol: Option<String>,
    extensions: Extensions,
    cookies: Vec<(String, String)>,
    close_fired: bool,
}

/// The write side of the transport. Holding the lock around it is holding the send lock.
struct Writer {
    framed: FramedWrite<WriteHalf<BoxedStream>, Encoder>,
    deflater: Option<Deflater>,
}

struct Shared {
    role: Role,
    config: Config,
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    ping_lock: tokio::sync::Mutex<()>,
    ping_waiter: Mutex<Option<oneshot::Sender<()>>>,
    pongs: watch::Sender<u64>,
    read_status: watch::Sender<ReadStatus>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
}

/// A WebSocket session, for clients and servers.
///
/// Sessions are created by the handshake functions: [`WebSocket::connect`] and
/// [`WebSocket::handshake`] on the client side, [`WebSocket::accept`] and
/// [`WebSocket::upgrade`] on the server side. Received messages and the lifecycle events are
/// delivered to the [`Handler`] given at construction.
///
/// `WebSocket` is a handle: clones refer to the same session, and every method can be called
/// concurrently from any task.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("state", &self.ready_state())
            .finish()
    }
}

impl WebSocket {
    /// Creates a session in the `Connecting` state.
    pub(crate) fn new(role: Role, options: &Options, handler: Box<dyn Handler>) -> Self {
        let (dispatcher, events) = Dispatcher::new();
        let ws = Self {
            shared: Arc::new(Shared {
                role,
                config: Config::new(options, role),
                inner: Mutex::new(Inner {
                    state: ReadyState::Connecting,
                    protocol: None,
                    extensions: Extensions::default(),
                    cookies: Vec::new(),
                    close_fired: false,
                }),
                writer: tokio::sync::Mutex::new(None),
                ping_lock: tokio::sync::Mutex::new(()),
                ping_waiter: Mutex::new(None),
                pongs: watch::Sender::new(0),
                read_status: watch::Sender::new(ReadStatus::Reading),
                cancel: CancellationToken::new(),
                dispatcher,
            }),
        };

        tokio::spawn(dispatch::run(ws.clone(), handler, events));
        ws
    }

    /// Moves a `Connecting` session to `Open` over `stream`, the upgraded transport.
    pub(crate) async fn open(&self, stream: BoxedStream, negotiation: Negotiation) {
        let role = self.shared.role;
        let config = &self.shared.config;
        let compressed = negotiation.extensions.is_compressed();

        let (read, write) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read,
            Decoder::new(role, config.max_payload_read, compressed),
        );
        *self.shared.writer.lock().await = Some(Writer {
            framed: FramedWrite::new(write, Encoder::new(role)),
            deflater: compressed
                .then(|| Deflater::new(config.compression.unwrap_or_default())),
        });

        {
            let mut inner = self.inner();
            inner.state = ReadyState::Open;
            inner.protocol = negotiation.protocol;
            inner.extensions = negotiation.extensions;
            inner.cookies = negotiation.cookies;
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "{role}: open (protocol={:?}, compressed={compressed})",
            self.protocol()
        );

        self.shared.dispatcher.dispatch(Event::Open);
        tokio::spawn(receive::run(self.clone(), reader, compressed));
        if let Some(interval) = config.keepalive {
            tokio::spawn(receive::keepalive(self.clone(), interval));
        }
    }

    /// Ends a `Connecting` session whose handshake failed: reports the error, then a 1006
    /// close.
    pub(crate) async fn abort(&self, err: &WebSocketError) {
        #[cfg(feature = "logging")]
        log::debug!("{}: handshake failed: {err}", self.shared.role);

        self.shared
            .dispatcher
            .dispatch(Event::Error(Arc::new(err.reported())));
        closing::teardown(self, CloseEvent::abnormal()).await;
    }

    /// The current state of the session.
    pub fn ready_state(&self) -> ReadyState {
        self.inner().state
    }

    /// The role of the local endpoint.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The subprotocol selected during the handshake.
    pub fn protocol(&self) -> Option<String> {
        self.inner().protocol.clone()
    }

    /// The extensions negotiated during the handshake.
    pub fn extensions(&self) -> Extensions {
        self.inner().extensions.clone()
    }

    /// Client: the cookies set by the server during the handshake.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.inner().cookies.clone()
    }

    /// Sends a text or binary message.
    ///
    /// Messages larger than the fragment size are split into several frames, written
    /// contiguously. The payload is compressed first when permessage-deflate was negotiated.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidArgument`] for control opcodes.
    /// - [`WebSocketError::ConnectionClosed`] if the session is not open, or closed while the
    ///   message was being written.
    /// - An I/O error if the write failed; the session then closes abnormally.
    pub async fn send(&self, opcode: OpCode, data: impl Into<Bytes>) -> Result<()> {
        if !opcode.is_data() {
            return Err(WebSocketError::InvalidArgument(
                "only text and binary messages can be sent",
            ));
        }

        let data = data.into();
        let result = {
            let mut guard = self.shared.writer.lock().await;
            match guard.as_mut() {
                Some(writer) if self.ready_state() == ReadyState::Open => tokio::select! {
                    result = self.write_message(writer, opcode, &data) => result,
                    // teardown needs the writer
                    _ = self.shared.cancel.cancelled() => Err(WebSocketError::ConnectionClosed),
                },
                _ => return Err(WebSocketError::ConnectionClosed),
            }
        };

        self.check_write(result).await
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(OpCode::Text, text.into()).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(OpCode::Binary, data).await
    }

    /// Sends a ping and waits for the next pong.
    ///
    /// Returns `Ok(false)` if the session is not open or no pong arrived within the wait time.
    /// Pings are serialized: a second call waits until the first one has its answer.
    ///
    /// # Errors
    /// [`WebSocketError::InvalidArgument`] if `data` exceeds 125 bytes.
    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<bool> {
        let data = data.into();
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::InvalidArgument(
                "ping payload exceeds 125 bytes",
            ));
        }

        if self.ready_state() != ReadyState::Open {
            return Ok(false);
        }

        let _guard = self.shared.ping_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.ping_waiter() = Some(tx);

        if self.send_control(Frame::ping(&data)).await.is_err() {
            self.ping_waiter().take();
            return Ok(false);
        }

        let answered = matches!(
            tokio::time::timeout(self.shared.config.wait_time, rx).await,
            Ok(Ok(()))
        );
        self.ping_waiter().take();

        Ok(answered)
    }

    /// Whether the peer answers an empty ping within the wait time.
    pub async fn is_alive(&self) -> bool {
        self.ping(Bytes::new()).await.unwrap_or(false)
    }

    /// Closes the session with 1000 (normal closure) and waits for the close handshake.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal, "").await
    }

    /// Closes the session with `code` and `reason`.
    ///
    /// Waits up to the wait time for the peer's close frame, then shuts the transport down.
    /// Calls made while the session is already closing or closed do nothing.
    ///
    /// # Errors
    /// - [`WebSocketError::UnsendableCloseCode`] for codes this endpoint may not send (1006,
    ///   1015, 1010 from a server, 1011 from a client, ...).
    /// - [`WebSocketError::ReasonTooLong`] for reasons over 123 bytes.
    /// - [`WebSocketError::InvalidArgument`] for a reason with [`CloseCode::Status`].
    pub async fn close_with(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        if !code.is_sendable_by(self.shared.role) {
            return Err(WebSocketError::UnsendableCloseCode(code));
        }
        let payload = PayloadData::new(code, reason)?;

        closing::close(self, payload).await;
        Ok(())
    }

    /// Writes one data message under the send lock.
    async fn write_message(&self, writer: &mut Writer, opcode: OpCode, data: &[u8]) -> Result<()> {
        let (payload, compressed) = match writer.deflater.as_mut() {
            Some(deflater) => (deflater.compress(data)?, true),
            None => (Bytes::copy_from_slice(data), false),
        };

        let fragment_size = self.shared.config.fragment_size;
        if payload.len() <= fragment_size {
            let frame = new_frame(true, opcode, compressed, &payload);
            return writer.framed.send(frame).await;
        }

        let mut chunks = payload.chunks(fragment_size).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            let frame = if first {
                new_frame(fin, opcode, compressed, chunk)
            } else {
                new_frame(fin, OpCode::Continuation, false, chunk)
            };
            first = false;
            writer.framed.feed(frame).await?;
        }

        writer.framed.flush().await
    }

    /// Writes a ping or pong; only while open.
    async fn send_control(&self, frame: Frame) -> Result<()> {
        let result = {
            let mut guard = self.shared.writer.lock().await;
            match guard.as_mut() {
                Some(writer) if self.ready_state() == ReadyState::Open => tokio::select! {
                    result = writer.framed.send(frame) => result,
                    _ = self.shared.cancel.cancelled() => Err(WebSocketError::ConnectionClosed),
                },
                _ => return Err(WebSocketError::ConnectionClosed),
            }
        };

        self.check_write(result).await
    }

    /// Writes a close frame. Used by the close coordinator once the state left `Open`.
    async fn send_close(&self, payload: &PayloadData) -> Result<()> {
        let mut guard = tokio::time::timeout(self.shared.config.wait_time, self.shared.writer.lock())
            .await
            .map_err(|_| WebSocketError::Timeout)?;
        let writer = guard.as_mut().ok_or(WebSocketError::ConnectionClosed)?;

        let frame = Frame::close_raw(payload.encode());
        tokio::time::timeout(self.shared.config.wait_time, writer.framed.send(frame))
            .await
            .map_err(|_| WebSocketError::Timeout)?
    }

    /// A failed write ends the session abnormally.
    async fn check_write(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(WebSocketError::IoError(err)) => {
                let reported = std::io::Error::new(err.kind(), err.to_string());
                closing::fail(self, WebSocketError::IoError(err)).await;
                Err(WebSocketError::IoError(reported))
            }
            result => result,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ping_waiter(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.shared
            .ping_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_time(&self) -> Duration {
        self.shared.config.wait_time
    }
}

fn new_frame(fin: bool, opcode: OpCode, compressed: bool, payload: &[u8]) -> Frame {
    let payload = BytesMut::from(payload);
    if compressed {
        Frame::compress(fin, opcode, None, payload)
    } else {
        Frame::new(fin, opcode, None, payload)
    }
}
