//! A WebSocket echo server implementation using wsengine.
//! This server accepts WebSocket connections and echoes back any text or binary messages it receives.

use tokio::net::{TcpListener, TcpStream};
use wsengine::{CompressionLevel, Event, Options, WebSocket};

/// Handles an individual WebSocket client connection by echoing back any received messages.
///
/// Events are drained in order, so echoes go out in the order the messages arrived.
async fn handle_client(stream: TcpStream) -> wsengine::Result<()> {
    let options = Options::default()
        .with_utf8()
        .with_max_payload_read(100 * 1024 * 1024)
        .with_max_read_buffer(200 * 1024 * 1024)
        .with_compression_level(CompressionLevel::fast());

    let (handler, mut events) = wsengine::events::channel();
    let ws = WebSocket::accept(stream, options, handler).await?;

    while let Some(event) = events.recv().await {
        match event {
            Event::Message(message) => ws.send(message.opcode, message.payload).await?,
            Event::Error(err) => log::warn!("Session error: {}", err),
            Event::Close(event) => {
                log::debug!(
                    "Client disconnected: {} {:?} (clean: {})",
                    event.code,
                    event.reason,
                    event.was_clean
                );
                break;
            }
            Event::Open => {}
        }
    }

    Ok(())
}

/// Main entry point for the WebSocket server.
///
/// Initializes logging and starts listening for WebSocket connections on port 8080.
/// Each client connection is handled in a separate task.
#[tokio::main]
async fn main() -> wsengine::Result<()> {
    // Initialize logging
    let _ = simple_logger::init_with_level(log::Level::Debug);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;

    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        log::info!("Client connected");

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream).await {
                log::error!("Error in websocket connection: {}", e);
            }
        });
    }
}
