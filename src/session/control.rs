//! Handling of received control frames.
use bytes::Bytes;

use super::{closing, WebSocket};
use crate::{
    close::PayloadData,
    events::Event,
    frame::{Frame, OpCode},
    Message, Result, WebSocketError,
};

/// Answers a ping while the session is open, then surfaces it if asked to.
pub(super) async fn on_ping(ws: &WebSocket, payload: Bytes) -> Result<()> {
    match ws.send_control(Frame::pong(&payload)).await {
        Ok(()) => {}
        Err(WebSocketError::ConnectionClosed) => {}
        Err(err) => return Err(err),
    }

    if ws.shared.config.emit_on_ping {
        ws.shared
            .dispatcher
            .dispatch(Event::Message(Message::from((OpCode::Ping, payload))));
    }
    Ok(())
}

/// Wakes the pending ping, if any, and the keepalive watcher.
pub(super) fn on_pong(ws: &WebSocket) {
    if let Some(waiter) = ws.ping_waiter().take() {
        let _ = waiter.send(());
    }
    ws.shared.pongs.send_modify(|count| *count = count.wrapping_add(1));
}

/// Decodes the close payload and hands it to the close coordinator.
///
/// # Errors
/// The payload is malformed (1-byte payload, a code a peer may not send, a reason that is not
/// UTF-8).
pub(super) async fn on_close(ws: &WebSocket, payload: &[u8]) -> Result<()> {
    let payload = PayloadData::decode(payload)?;
    closing::close_by_peer(ws, payload).await;
    Ok(())
}
