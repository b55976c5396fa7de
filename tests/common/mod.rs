#![allow(dead_code)]

use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http_body_util::Empty;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};
use tokio_util::codec::Framed;
use wsengine::{
    codec::Codec,
    handshake::accept_key,
    stream::{BoxedStream, Connector},
    CloseEvent, Event, Message, Options, Role, WebSocket, MAX_PAYLOAD_READ,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A session and the events of its handler.
pub struct Peer {
    pub ws: WebSocket,
    pub events: mpsc::UnboundedReceiver<Event>,
}

impl Peer {
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// The next message, skipping the open event.
    pub async fn message(&mut self) -> Message {
        loop {
            match self.next().await {
                Event::Open => continue,
                Event::Message(message) => return message,
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    /// The close event, skipping everything before it.
    pub async fn closed(&mut self) -> CloseEvent {
        loop {
            if let Event::Close(event) = self.next().await {
                return event;
            }
        }
    }

    /// All the events up to and including the close event.
    pub async fn until_closed(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = self.next().await;
            let last = matches!(event, Event::Close(_));
            events.push(event);
            if last {
                return events;
            }
        }
    }
}

pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// A client and a server session connected through an in-memory pipe.
pub async fn connected(client: Options, server: Options) -> (Peer, Peer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (client_handler, client_events) = wsengine::events::channel();
    let (server_handler, server_events) = wsengine::events::channel();

    let (client_ws, server_ws) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/chat".parse().unwrap(),
            client_io,
            client,
            client_handler
        ),
        WebSocket::accept(server_io, server, server_handler),
    );

    (
        Peer {
            ws: client_ws.expect("client handshake"),
            events: client_events,
        },
        Peer {
            ws: server_ws.expect("server handshake"),
            events: server_events,
        },
    )
}

/// Reads an HTTP head, one byte at a time so that no frame bytes are consumed.
pub async fn read_head(io: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = io.read_u8().await.expect("reading the HTTP head");
        head.push(byte);
    }
    String::from_utf8(head).unwrap()
}

pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then_some(value.trim())
    })
}

pub const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

/// Plays the client side of the handshake by hand, then speaks raw frames through `codec`.
pub async fn raw_client(mut io: DuplexStream, codec: Codec) -> Framed<DuplexStream, Codec> {
    io.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
    let head = read_head(&mut io).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected answer: {head}");
    Framed::new(io, codec)
}

/// Plays the server side of the handshake by hand, then speaks raw frames through `codec`.
pub async fn raw_server(mut io: DuplexStream, codec: Codec) -> Framed<DuplexStream, Codec> {
    let head = read_head(&mut io).await;
    let key = header(&head, "sec-websocket-key").expect("no key in the request");
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key.as_bytes())
    );
    io.write_all(response.as_bytes()).await.unwrap();
    Framed::new(io, codec)
}

pub fn client_codec() -> Codec {
    Codec::new(Role::Client, MAX_PAYLOAD_READ, false)
}

pub fn server_codec() -> Codec {
    Codec::new(Role::Server, MAX_PAYLOAD_READ, false)
}

/// A server session accepted over `io`, with its events.
pub async fn accept(io: DuplexStream, options: Options) -> (wsengine::Result<WebSocket>, mpsc::UnboundedReceiver<Event>) {
    let (handler, events) = wsengine::events::channel();
    (WebSocket::accept(io, options, handler).await, events)
}

/// A client session over a raw server answering the handshake by hand.
pub async fn client_with_raw_server(options: Options) -> (Peer, Framed<DuplexStream, Codec>) {
    client_with_raw_server_codec(options, server_codec()).await
}

/// A client session over a raw server speaking frames through `codec`.
pub async fn client_with_raw_server_codec(options: Options, codec: Codec) -> (Peer, Framed<DuplexStream, Codec>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (handler, events) = wsengine::events::channel();

    let (ws, raw) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/chat".parse().unwrap(),
            client_io,
            options,
            handler
        ),
        raw_server(server_io, codec),
    );

    (
        Peer {
            ws: ws.expect("client handshake"),
            events,
        },
        raw,
    )
}

/// A server session with a raw client speaking frames through `codec`.
pub async fn server_with_raw_client(options: Options, codec: Codec) -> (Peer, Framed<DuplexStream, Codec>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (handler, events) = wsengine::events::channel();

    let (ws, raw) = tokio::join!(
        WebSocket::accept(server_io, options, handler),
        raw_client(client_io, codec),
    );

    (
        Peer {
            ws: ws.expect("server handshake"),
            events,
        },
        raw,
    )
}

/// Serves HTTP/1.1 on `io`, answering every request with `handle`.
pub fn serve<F>(io: DuplexStream, handle: F)
where
    F: Fn(Request<Incoming>) -> Response<Empty<Bytes>> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |request| {
            let response = handle(request);
            async move { Ok::<_, Infallible>(response) }
        });

        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await;
    });
}

type Route = Arc<dyn Fn(&str, DuplexStream) + Send + Sync>;

/// A connector handing every connection to an in-memory route instead of the network.
#[derive(Clone)]
pub struct TestConnector {
    route: Route,
    /// The `host:port` of every connection made, in order.
    pub connections: Arc<Mutex<Vec<String>>>,
}

impl TestConnector {
    pub fn new<F>(route: F) -> Self
    where
        F: Fn(&str, DuplexStream) + Send + Sync + 'static,
    {
        Self {
            route: Arc::new(route),
            connections: Arc::default(),
        }
    }

    pub fn connections(&self) -> Vec<String> {
        self.connections.lock().unwrap().clone()
    }
}

impl Connector for TestConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, wsengine::Result<BoxedStream>> {
        let (client, server) = tokio::io::duplex(1 << 16);
        self.connections.lock().unwrap().push(format!("{host}:{port}"));
        (self.route)(host, server);
        async move { Ok(Box::new(client) as BoxedStream) }.boxed()
    }
}

/// Answers a request with an upgrade, handing the session to `sessions` once it is open.
pub fn upgrade(
    request: Request<Incoming>,
    sessions: mpsc::UnboundedSender<Peer>,
) -> Response<Empty<Bytes>> {
    let (handler, events) = wsengine::events::channel();
    match WebSocket::upgrade(request, Options::default(), handler) {
        Ok((response, fut)) => {
            tokio::spawn(async move {
                if let Ok(ws) = fut.await {
                    let _ = sessions.send(Peer { ws, events });
                }
            });
            response
        }
        Err(err) => wsengine::handshake::server::failure_response(&err),
    }
}
