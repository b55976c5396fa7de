mod common;

use std::{sync::Arc, time::Duration};

use common::connected;
use tokio::sync::mpsc;
use wsengine::{
    close::CloseCode, CompressionLevel, Delivery, Event, Handler, Message, OpCode, Options,
    ReadyState, WebSocket, WebSocketError,
};

#[tokio::test]
async fn test_echo() {
    common::init_logger();
    let (mut client, mut server) = connected(Options::default(), Options::default()).await;

    assert_eq!(client.ws.ready_state(), ReadyState::Open);
    assert!(matches!(client.next().await, Event::Open));
    assert!(matches!(server.next().await, Event::Open));

    client.ws.send_text("hello").await.unwrap();
    let message = server.message().await;
    assert_eq!(message, Message::text("hello"));

    server
        .ws
        .send(message.opcode, message.payload)
        .await
        .unwrap();
    assert_eq!(client.message().await.as_str(), Some("hello"));

    client.ws.send_binary(vec![0u8, 1, 2, 255]).await.unwrap();
    let message = server.message().await;
    assert_eq!(message.opcode, OpCode::Binary);
    assert_eq!(&message.payload[..], &[0, 1, 2, 255]);
}

#[tokio::test]
async fn test_messages_keep_order() {
    let (client, mut server) = connected(Options::default(), Options::default()).await;

    for i in 0..100 {
        client.ws.send_text(format!("message {i}")).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(
            server.message().await.as_str(),
            Some(format!("message {i}").as_str())
        );
    }
}

#[tokio::test]
async fn test_fragmented_send() {
    let (mut client, mut server) = connected(
        Options::default().with_fragment_size(16),
        Options::default(),
    )
    .await;

    let text = "a message much longer than sixteen bytes, sent in several frames";
    client.ws.send_text(text).await.unwrap();
    assert_eq!(server.message().await.as_str(), Some(text));

    // larger than the default fragment size as well
    let data = vec![7u8; 100_000];
    server.ws.send_binary(data.clone()).await.unwrap();
    assert_eq!(&client.message().await.payload[..], &data[..]);
    assert_eq!(client.ws.ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn test_compression() {
    let options = Options::default().with_compression_level(CompressionLevel::best());
    let (mut client, mut server) = connected(options.clone(), options).await;

    assert!(client.ws.extensions().is_compressed());
    assert!(server.ws.extensions().is_compressed());

    let text = "compressible ".repeat(1000);
    client.ws.send_text(text.clone()).await.unwrap();
    assert_eq!(server.message().await.as_str(), Some(text.as_str()));

    server.ws.send_text("short").await.unwrap();
    assert_eq!(client.message().await.as_str(), Some("short"));
}

#[tokio::test]
async fn test_compression_needs_both_sides() {
    let (client, server) = connected(
        Options::default().with_compression_level(CompressionLevel::fast()),
        Options::default(),
    )
    .await;

    assert!(!client.ws.extensions().is_compressed());
    assert!(!server.ws.extensions().is_compressed());
}

#[tokio::test]
async fn test_subprotocol() {
    let (client, server) = connected(
        Options::default().with_protocols(["v2.chat", "v1.chat"]),
        Options::default().with_protocols(["v1.chat"]),
    )
    .await;

    assert_eq!(client.ws.protocol().as_deref(), Some("v1.chat"));
    assert_eq!(server.ws.protocol().as_deref(), Some("v1.chat"));
}

#[tokio::test]
async fn test_ping() {
    let (client, server) = connected(Options::default(), Options::default()).await;

    assert!(client.ws.ping("are you there").await.unwrap());
    assert!(server.ws.is_alive().await);

    assert!(matches!(
        client.ws.ping(vec![0u8; 126]).await,
        Err(WebSocketError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_concurrent_pings() {
    let (client, _server) = connected(Options::default(), Options::default()).await;

    let pings = (0..5).map(|_| {
        let ws = client.ws.clone();
        tokio::spawn(async move { ws.ping("ping").await })
    });
    for ping in futures::future::join_all(pings).await {
        assert!(ping.unwrap().unwrap());
    }
}

#[tokio::test]
async fn test_emit_on_ping() {
    let (client, mut server) = connected(
        Options::default(),
        Options::default().with_emit_on_ping(),
    )
    .await;

    assert!(client.ws.ping("hey").await.unwrap());
    let message = server.message().await;
    assert_eq!(message, Message::ping("hey"));
}

#[tokio::test]
async fn test_clean_close() {
    let (mut client, mut server) = connected(Options::default(), Options::default()).await;

    client
        .ws
        .close_with(CloseCode::Normal, "bye")
        .await
        .unwrap();
    assert_eq!(client.ws.ready_state(), ReadyState::Closed);

    let event = client.closed().await;
    assert_eq!(event.code, CloseCode::Normal);
    assert_eq!(event.reason, "bye");
    assert!(event.was_clean);

    let event = server.closed().await;
    assert_eq!(event.code, CloseCode::Normal);
    assert_eq!(event.reason, "bye");
    assert!(event.was_clean);
    assert_eq!(server.ws.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_server_initiated_close() {
    let (mut client, mut server) = connected(Options::default(), Options::default()).await;

    server
        .ws
        .close_with(CloseCode::Away, "restarting")
        .await
        .unwrap();

    let event = server.closed().await;
    assert_eq!(event.code, CloseCode::Away);
    assert!(event.was_clean);

    let event = client.closed().await;
    assert_eq!(event.code, CloseCode::Away);
    assert_eq!(event.reason, "restarting");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (mut client, mut server) = connected(Options::default(), Options::default()).await;

    let (first, second) = tokio::join!(client.ws.close(), client.ws.close());
    first.unwrap();
    second.unwrap();
    client.ws.close().await.unwrap();

    // exactly one close event each, and nothing after it
    let events = client.until_closed().await;
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::Close(_))).count(),
        1
    );
    server.closed().await;
    assert!(client.events.recv().await.is_none());
}

#[tokio::test]
async fn test_close_arguments() {
    let (client, server) = connected(Options::default(), Options::default()).await;

    assert!(matches!(
        client.ws.close_with(CloseCode::Abnormal, "").await,
        Err(WebSocketError::UnsendableCloseCode(CloseCode::Abnormal))
    ));
    assert!(matches!(
        client.ws.close_with(CloseCode::Error, "").await,
        Err(WebSocketError::UnsendableCloseCode(CloseCode::Error))
    ));
    assert!(matches!(
        server.ws.close_with(CloseCode::Extension, "").await,
        Err(WebSocketError::UnsendableCloseCode(CloseCode::Extension))
    ));
    assert!(matches!(
        client.ws.close_with(CloseCode::Normal, "x".repeat(124)).await,
        Err(WebSocketError::ReasonTooLong(124))
    ));

    // argument errors leave the session untouched
    assert_eq!(client.ws.ready_state(), ReadyState::Open);
    assert!(client.ws.ping("").await.unwrap());
}

#[tokio::test]
async fn test_send_after_close() {
    let (client, _server) = connected(Options::default(), Options::default()).await;

    client.ws.close().await.unwrap();
    assert!(matches!(
        client.ws.send_text("late").await,
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(!client.ws.ping("").await.unwrap());
    assert!(matches!(
        client.ws.send(OpCode::Ping, "no").await,
        Err(WebSocketError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_keepalive_with_live_peer() {
    let (mut client, mut server) = connected(
        Options::default(),
        Options::default().with_keepalive(Duration::from_millis(20)),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.ws.ready_state(), ReadyState::Open);

    client.ws.close().await.unwrap();
    assert!(server.closed().await.was_clean);
    assert!(client.closed().await.was_clean);
}

#[tokio::test]
async fn test_inline_delivery() {
    let (client, mut server) = connected(
        Options::default(),
        Options::default().with_delivery(Delivery::Inline),
    )
    .await;

    for text in ["one", "two", "three"] {
        client.ws.send_text(text).await.unwrap();
    }
    for text in ["one", "two", "three"] {
        assert_eq!(server.message().await.as_str(), Some(text));
    }
}

struct Panicky {
    tx: mpsc::UnboundedSender<String>,
}

impl Handler for Panicky {
    fn on_message(&self, _ws: &WebSocket, message: Message) {
        let text = message.as_str().unwrap_or_default().to_string();
        if text == "boom" {
            panic!("boom");
        }
        let _ = self.tx.send(text);
    }

    fn on_error(&self, _ws: &WebSocket, error: Arc<WebSocketError>) {
        let _ = self.tx.send(format!("error: {error}"));
    }
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let (client, server) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/".parse().unwrap(),
            client_io,
            Options::default(),
            ()
        ),
        WebSocket::accept(server_io, Options::default(), Panicky { tx }),
    );
    let (client, server) = (client.unwrap(), server.unwrap());

    client.send_text("boom").await.unwrap();
    client.send_text("still here").await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), "error: Handler panicked: boom");
    assert_eq!(rx.recv().await.unwrap(), "still here");
    assert_eq!(server.ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn test_shared_handler() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        messages: AtomicUsize,
        closed: mpsc::UnboundedSender<usize>,
    }

    impl Handler for Counter {
        fn on_message(&self, _ws: &WebSocket, _message: Message) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _ws: &WebSocket, _event: wsengine::CloseEvent) {
            let _ = self.closed.send(self.messages.load(Ordering::SeqCst));
        }
    }

    let (closed, mut counts) = mpsc::unbounded_channel();
    let counter = Arc::new(Counter {
        messages: AtomicUsize::new(0),
        closed,
    });
    let (client_io, server_io) = tokio::io::duplex(1 << 16);

    let (client, server) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/".parse().unwrap(),
            client_io,
            Options::default(),
            ()
        ),
        WebSocket::accept(server_io, Options::default(), counter.clone()),
    );
    let client = client.unwrap();

    client.send_text("1").await.unwrap();
    client.send_text("2").await.unwrap();
    client.close().await.unwrap();

    // both messages were handled before the close event
    assert_eq!(counts.recv().await, Some(2));
    assert_eq!(server.unwrap().ready_state(), ReadyState::Closed);
}
