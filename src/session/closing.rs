//! The close handshake.
//!
//! The initiator sends its close frame, then waits for the receive loop to see the peer's
//! close frame (or stop reading) for at most the wait time. The responder echoes the peer's
//! close frame and tears down right away. Either way the transport is shut down and the
//! handler receives exactly one close event.
use std::sync::Arc;

use futures::SinkExt;

use super::{ReadStatus, ReadyState, WebSocket};
use crate::{
    close::PayloadData,
    events::{CloseEvent, Event},
    WebSocketError,
};

/// A locally requested close.
pub(super) async fn close(ws: &WebSocket, payload: PayloadData) {
    let state = {
        let mut inner = ws.inner();
        let state = inner.state;
        if state == ReadyState::Open {
            inner.state = ReadyState::Closing;
        }
        state
    };

    match state {
        ReadyState::Open => {}
        ReadyState::Connecting => return teardown(ws, CloseEvent::abnormal()).await,
        ReadyState::Closing | ReadyState::Closed => return,
    }

    #[cfg(feature = "logging")]
    log::debug!("{}: closing with {}", ws.role(), payload.code());

    let sent = match ws.send_close(&payload).await {
        Ok(()) => true,
        Err(_err) => {
            #[cfg(feature = "logging")]
            log::debug!("{}: sending close frame: {_err}", ws.role());
            false
        }
    };

    let received = sent && wait_for_peer(ws).await;

    teardown(
        ws,
        CloseEvent {
            code: payload.code(),
            reason: payload.reason().to_string(),
            was_clean: received,
        },
    )
    .await;
}

/// The peer's close frame, as decoded by the receive loop.
pub(super) async fn close_by_peer(ws: &WebSocket, payload: PayloadData) {
    ws.shared.read_status.send_if_modified(|status| {
        let modified = *status == ReadStatus::Reading;
        *status = ReadStatus::CloseReceived;
        modified
    });

    {
        let mut inner = ws.inner();
        if inner.state != ReadyState::Open {
            // we initiated, the waiting initiator finishes the handshake
            return;
        }
        inner.state = ReadyState::Closing;
    }

    #[cfg(feature = "logging")]
    log::debug!("{}: peer closed with {}", ws.role(), payload.code());

    let sent = ws.send_close(&payload).await.is_ok();
    teardown(
        ws,
        CloseEvent {
            code: payload.code(),
            reason: payload.reason().to_string(),
            was_clean: sent,
        },
    )
    .await;
}

/// Ends an open session because of `err`.
///
/// The error is reported first. A close frame carrying the error's code is sent unless the
/// code is reserved (1006 for transport failures), then the session tears down without
/// waiting for the peer.
pub(super) async fn fail(ws: &WebSocket, err: WebSocketError) {
    {
        let mut inner = ws.inner();
        if inner.state != ReadyState::Open {
            return;
        }
        inner.state = ReadyState::Closing;
    }

    let code = err.close_code();
    let payload = PayloadData::lossy(code, &err.to_string());

    #[cfg(feature = "logging")]
    log::debug!("{}: failing with {code}: {err}", ws.role());

    ws.shared.dispatcher.dispatch(Event::Error(Arc::new(err)));

    if !payload.has_reserved_code() {
        let _ = ws.send_close(&payload).await;
    }

    teardown(
        ws,
        CloseEvent {
            code,
            reason: payload.reason().to_string(),
            was_clean: false,
        },
    )
    .await;
}

/// Waits for the receive loop to observe the peer's close frame.
async fn wait_for_peer(ws: &WebSocket) -> bool {
    let mut status = ws.shared.read_status.subscribe();
    let observed = tokio::time::timeout(
        ws.wait_time(),
        status.wait_for(|status| *status != ReadStatus::Reading),
    )
    .await;

    match observed {
        Ok(Ok(status)) => *status == ReadStatus::CloseReceived,
        _ => {
            #[cfg(feature = "logging")]
            log::debug!("{}: no close frame from the peer", ws.role());
            false
        }
    }
}

/// Stops the session: cancels the receive loop, shuts the transport down, drops the ping
/// waiter and fires the close event once.
pub(super) async fn teardown(ws: &WebSocket, event: CloseEvent) {
    // in-flight sends give the writer up once cancelled
    ws.shared.cancel.cancel();

    let writer = ws.shared.writer.lock().await.take();
    if let Some(mut writer) = writer {
        let _ = tokio::time::timeout(ws.wait_time(), writer.framed.close()).await;
    }

    ws.ping_waiter().take();

    let first = {
        let mut inner = ws.inner();
        inner.state = ReadyState::Closed;
        !std::mem::replace(&mut inner.close_fired, true)
    };

    if first {
        #[cfg(feature = "logging")]
        log::debug!(
            "{}: closed with {} (clean: {})",
            ws.role(),
            event.code,
            event.was_clean
        );

        ws.shared.dispatcher.dispatch(Event::Close(event));
    }
}
