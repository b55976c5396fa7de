//! Ordered, panic-isolated delivery of events to the handler.
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};

use super::WebSocket;
use crate::{
    events::{Event, Handler},
    WebSocketError,
};

type Envelope = (Event, Option<oneshot::Sender<()>>);

/// The sending side of the event queue.
pub(super) struct Dispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Dispatcher {
    pub(super) fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an event.
    pub(super) fn dispatch(&self, event: Event) {
        let _ = self.tx.send((event, None));
    }

    /// Queues an event and waits until the handler returned from it.
    pub(super) async fn dispatch_wait(&self, event: Event) {
        let (ack, done) = oneshot::channel();
        if self.tx.send((event, Some(ack))).is_ok() {
            let _ = done.await;
        }
    }
}

/// Drains the queue until the close event was delivered.
pub(super) async fn run(
    ws: WebSocket,
    handler: Box<dyn Handler>,
    mut events: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some((event, ack)) = events.recv().await {
        let last = matches!(event, Event::Close(_));
        deliver(&ws, handler.as_ref(), event);

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        if last {
            break;
        }
    }
}

fn deliver(ws: &WebSocket, handler: &dyn Handler, event: Event) {
    let result = catch_unwind(AssertUnwindSafe(|| match event {
        Event::Open => handler.on_open(ws),
        Event::Message(message) => handler.on_message(ws, message),
        Event::Error(err) => handler.on_error(ws, err),
        Event::Close(close) => handler.on_close(ws, close),
    }));

    if let Err(panic) = result {
        let err = WebSocketError::HandlerPanic(panic_message(panic.as_ref()));

        #[cfg(feature = "logging")]
        log::warn!("{}: {err}", ws.role());

        // a panicking error callback is not reported again
        let _ = catch_unwind(AssertUnwindSafe(|| handler.on_error(ws, Arc::new(err))));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
