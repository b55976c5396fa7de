//! The receive loop and the keepalive task.
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::{io::ReadHalf, time::Instant};
use tokio_util::codec::FramedRead;

use super::{closing, control, fragment::Reassembler, ReadStatus, ReadyState, WebSocket};
use crate::{
    codec::Decoder,
    compression::Inflater,
    events::Event,
    frame::{Frame, OpCode},
    options::Delivery,
    stream::BoxedStream,
    Message, Result, WebSocketError,
};

type Reader = FramedRead<ReadHalf<BoxedStream>, Decoder>;

/// Per-loop state for turning data frames into messages.
struct Incoming {
    reassembler: Reassembler,
    inflater: Option<Inflater>,
    limit: usize,
    check_utf8: bool,
}

impl Incoming {
    /// Feeds a data frame, returning the message it completes.
    fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let Some(assembled) = self.reassembler.push(frame)? else {
            return Ok(None);
        };

        let payload = if assembled.compressed {
            let inflater = self
                .inflater
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            inflater.decompress(&assembled.payload, self.limit)?
        } else {
            assembled.payload
        };

        if assembled.opcode == OpCode::Text && self.check_utf8 {
            check_utf8(&payload)?;
        }

        Ok(Some(Message {
            opcode: assembled.opcode,
            payload,
        }))
    }
}

fn check_utf8(payload: &Bytes) -> Result<()> {
    #[cfg(not(feature = "simd"))]
    if std::str::from_utf8(payload).is_err() {
        return Err(WebSocketError::InvalidUTF8);
    }
    #[cfg(feature = "simd")]
    if simdutf8::basic::from_utf8(payload).is_err() {
        return Err(WebSocketError::InvalidUTF8);
    }
    Ok(())
}

/// Reads frames until a close frame, an error, or cancellation.
pub(super) async fn run(ws: WebSocket, mut reader: Reader, compressed: bool) {
    let config = &ws.shared.config;
    let mut incoming = Incoming {
        reassembler: Reassembler::new(config.max_read_buffer),
        inflater: compressed.then(Inflater::new),
        limit: config.max_read_buffer,
        check_utf8: config.check_utf8,
    };
    let cancel = ws.shared.cancel.clone();

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            next = reader.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => break Err(err),
            None => break Err(WebSocketError::AbnormalClosure),
        };

        match frame.opcode {
            OpCode::Ping => {
                if let Err(err) = control::on_ping(&ws, frame.payload.freeze()).await {
                    break Err(err);
                }
            }
            OpCode::Pong => control::on_pong(&ws),
            OpCode::Close => break control::on_close(&ws, &frame.payload).await,
            OpCode::Text | OpCode::Binary | OpCode::Continuation => match incoming.push(frame) {
                Ok(Some(message)) => deliver(&ws, message).await,
                Ok(None) => {}
                Err(err) => break Err(err),
            },
        }
    };

    ws.shared.read_status.send_if_modified(|status| {
        if *status == ReadStatus::Reading {
            *status = ReadStatus::Stopped;
            true
        } else {
            false
        }
    });

    match result {
        Ok(()) => {}
        Err(err) if ws.ready_state() == ReadyState::Open => closing::fail(&ws, err).await,
        Err(_err) => {
            #[cfg(feature = "logging")]
            log::debug!("{}: receive loop stopped: {_err}", ws.role());
        }
    }
}

async fn deliver(ws: &WebSocket, message: Message) {
    let dispatcher = &ws.shared.dispatcher;
    match ws.shared.config.delivery {
        Delivery::Queued => dispatcher.dispatch(Event::Message(message)),
        Delivery::Inline => {
            tokio::select! {
                _ = ws.shared.cancel.cancelled() => {}
                _ = dispatcher.dispatch_wait(Event::Message(message)) => {}
            }
        }
    }
}

/// Pings the peer every `interval`; a pong must arrive within the wait time.
pub(super) async fn keepalive(ws: WebSocket, interval: Duration) {
    let cancel = ws.shared.cancel.clone();
    let mut pongs = ws.shared.pongs.subscribe();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        pongs.borrow_and_update();
        if ws.send_control(Frame::ping(b"")).await.is_err() {
            return;
        }

        let answered = tokio::select! {
            _ = cancel.cancelled() => return,
            answered = tokio::time::timeout(ws.wait_time(), pongs.changed()) => answered,
        };

        match answered {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return,
            Err(_) => {
                #[cfg(feature = "logging")]
                log::debug!("{}: keepalive pong missed", ws.role());

                closing::fail(&ws, WebSocketError::Timeout).await;
                return;
            }
        }
    }
}
