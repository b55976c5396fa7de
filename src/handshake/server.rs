//! Server side of the handshake.
use std::{
    borrow::BorrowMut,
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::Empty;
use hyper::{body::Incoming, service::service_fn, upgrade::OnUpgrade};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::sync::oneshot;

use super::{accept_key, has_token, header_str, list, HttpResponse, UpgradeResult};
use crate::{
    extensions::{self, Extensions},
    options::Negotiation,
    stream::{BoxedStream, Transport},
    Handler, Options, Result, Role, WebSocket, WebSocketError,
};

/// The parts of an upgrade request a [`Validator`](crate::Validator) looks at.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub version: Version,
    pub headers: &'a HeaderMap,
}

impl<'a, B> From<&'a Request<B>> for HandshakeRequest<'a> {
    fn from(request: &'a Request<B>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            version: request.version(),
            headers: request.headers(),
        }
    }
}

/// Validates an upgrade request and builds the `101 Switching Protocols` answer.
///
/// Checks run in order: method, HTTP version, Host, Upgrade and Connection headers, the key,
/// the version token, then the validation hook of `options`.
pub(crate) fn negotiate(
    request: HandshakeRequest<'_>,
    options: &Options,
) -> Result<(HttpResponse, Negotiation)> {
    let headers = request.headers;

    if request.method != Method::GET {
        return Err(WebSocketError::InvalidMethod);
    }

    if request.version < Version::HTTP_11 {
        return Err(WebSocketError::InvalidHttpVersion);
    }

    if !headers.contains_key(header::HOST) {
        return Err(WebSocketError::MissingHost);
    }

    if !header_str(headers, header::UPGRADE).is_some_and(|h| h.trim().eq_ignore_ascii_case("websocket")) {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let key = header_str(headers, header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    if header_str(headers, header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some("13") {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    if let Some(validator) = &options.validator {
        validator(&request).map_err(WebSocketError::Rejected)?;
    }

    // the first offer the server supports wins
    let protocol = list(headers, header::SEC_WEBSOCKET_PROTOCOL)
        .into_iter()
        .find(|offered| options.protocols.contains(offered));

    let extensions = match (options.compression, header_str(headers, header::SEC_WEBSOCKET_EXTENSIONS)) {
        (Some(_), Some(offer)) => extensions::select_from_client_offer(offer).unwrap_or_default(),
        _ => Extensions::default(),
    };

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()));

    if let Some(protocol) = &protocol {
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    if extensions.is_compressed() {
        response = response.header(header::SEC_WEBSOCKET_EXTENSIONS, extensions.to_string());
    }
    for (name, value) in &options.headers {
        response = response.header(name, value);
    }

    #[cfg(feature = "logging")]
    log::debug!("server: negotiated protocol={protocol:?} extensions=\"{extensions}\"");

    Ok((
        response.body(Empty::new())?,
        Negotiation {
            protocol,
            extensions,
            cookies: Vec::new(),
        },
    ))
}

/// The answer to a rejected upgrade request: `426 Upgrade Required` for a version mismatch,
/// `400 Bad Request` otherwise.
pub fn failure_response(err: &WebSocketError) -> HttpResponse {
    let mut response = Response::new(Empty::new());
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    if matches!(err, WebSocketError::InvalidSecWebsocketVersion) {
        *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
        response
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    } else {
        *response.status_mut() = StatusCode::BAD_REQUEST;
    }

    response
}

/// A future that resolves to the server session once the connection is upgraded.
///
/// Returned by [`WebSocket::upgrade`] together with the response; the response must be sent
/// for the upgrade to complete.
#[pin_project::pin_project]
pub struct UpgradeFut {
    #[pin]
    inner: OnUpgrade,
    pending: Option<Pending>,
    opening: Option<BoxFuture<'static, Result<WebSocket>>>,
}

/// The session parts kept until the upgrade resolves.
struct Pending {
    options: Options,
    handler: Box<dyn Handler>,
    negotiation: Negotiation,
}

impl Future for UpgradeFut {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.opening.is_none() {
            let upgraded = match this.inner.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(upgraded) => upgraded,
            };

            let Some(pending) = this.pending.take() else {
                return Poll::Ready(Err(WebSocketError::ConnectionClosed));
            };

            let ws = WebSocket::new(Role::Server, &pending.options, pending.handler);
            let negotiation = pending.negotiation;
            *this.opening = Some(
                async move {
                    match upgraded {
                        Ok(upgraded) => {
                            ws.open(Box::new(TokioIo::new(upgraded)), negotiation).await;
                            Ok(ws)
                        }
                        Err(err) => {
                            let err = WebSocketError::from(err);
                            ws.abort(&err).await;
                            Err(err)
                        }
                    }
                }
                .boxed(),
            );
        }

        match this.opening.as_mut() {
            Some(opening) => opening.poll_unpin(cx),
            None => Poll::Pending,
        }
    }
}

/// A handshake outcome passed from the HTTP service to [`WebSocket::accept`].
type Upgrade = Result<(OnUpgrade, Negotiation)>;

/// Serves HTTP on `io` until the first request was answered, returning the upgraded stream.
async fn serve(io: BoxedStream, options: &Options) -> Result<(BoxedStream, Negotiation)> {
    let (tx, rx) = oneshot::channel::<Upgrade>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let service_options = options.clone();
    let service = service_fn(move |mut request: Request<Incoming>| {
        let slot = tx.lock().ok().and_then(|mut slot| slot.take());
        let outcome = negotiate(HandshakeRequest::from(&request), &service_options);

        let response = match outcome {
            Ok((response, negotiation)) if slot.is_some() => {
                let on_upgrade = hyper::upgrade::on(&mut request);
                if let Some(slot) = slot {
                    let _ = slot.send(Ok((on_upgrade, negotiation)));
                }
                response
            }
            Ok(_) => failure_response(&WebSocketError::ConnectionClosed),
            Err(err) => {
                let response = failure_response(&err);
                if let Some(slot) = slot {
                    let _ = slot.send(Err(err));
                }
                response
            }
        };

        async move { Ok::<_, Infallible>(response) }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();

    tokio::spawn(async move {
        if let Err(_err) = conn.await {
            #[cfg(feature = "logging")]
            log::error!("serving upgrade request: {:?}", _err);
        }
    });

    let (on_upgrade, negotiation) = rx.await.map_err(|_| WebSocketError::ConnectionClosed)??;
    let upgraded: BoxedStream = Box::new(TokioIo::new(on_upgrade.await?));

    Ok((upgraded, negotiation))
}

impl WebSocket {
    /// Accepts a WebSocket connection on a raw stream.
    ///
    /// Reads the upgrade request, validates it and answers `101 Switching Protocols`, or `400`
    /// (`426` for an unsupported version) when validation fails. The handshake is bounded by
    /// the connect timeout of `options`.
    ///
    /// # Example
    /// ```no_run
    /// use tokio::net::TcpListener;
    /// use wsengine::{Options, WebSocket};
    ///
    /// async fn serve() -> wsengine::Result<()> {
    ///     let listener = TcpListener::bind("127.0.0.1:9001").await?;
    ///     let (stream, _) = listener.accept().await?;
    ///     let ws = WebSocket::accept(stream, Options::default(), ()).await?;
    ///     ws.send_text("welcome").await?;
    ///     ws.close().await
    /// }
    /// ```
    pub async fn accept<S>(io: S, options: Options, handler: impl Handler) -> Result<WebSocket>
    where
        S: Transport + 'static,
    {
        let ws = WebSocket::new(Role::Server, &options, Box::new(handler));

        let result = tokio::time::timeout(options.connect_timeout(), serve(Box::new(io), &options))
            .await
            .map_err(|_| WebSocketError::Timeout)
            .and_then(|result| result);

        match result {
            Ok((stream, negotiation)) => {
                ws.open(stream, negotiation).await;
                Ok(ws)
            }
            Err(err) => {
                ws.abort(&err).await;
                Err(err)
            }
        }
    }

    /// Upgrades a request received by an existing hyper server.
    ///
    /// Returns the response to send back and an [`UpgradeFut`] resolving to the session once
    /// the response went out. When validation fails the error is returned and the handler
    /// receives the error and a 1006 close; answer the request with
    /// [`failure_response`].
    ///
    /// # Example
    /// ```no_run
    /// use http_body_util::Empty;
    /// use hyper::{body::{Bytes, Incoming}, Request, Response};
    /// use wsengine::{handshake::server::failure_response, Options, WebSocket};
    ///
    /// async fn handle(request: Request<Incoming>) -> Response<Empty<Bytes>> {
    ///     match WebSocket::upgrade(request, Options::default(), ()) {
    ///         Ok((response, fut)) => {
    ///             tokio::spawn(async move {
    ///                 if let Ok(ws) = fut.await {
    ///                     let _ = ws.send_text("hello").await;
    ///                 }
    ///             });
    ///             response
    ///         }
    ///         Err(err) => failure_response(&err),
    ///     }
    /// }
    /// ```
    pub fn upgrade<B>(
        mut request: impl BorrowMut<Request<B>>,
        options: Options,
        handler: impl Handler,
    ) -> UpgradeResult {
        let request = request.borrow_mut();

        match negotiate(HandshakeRequest::from(&*request), &options) {
            Ok((response, negotiation)) => Ok((
                response,
                UpgradeFut {
                    inner: hyper::upgrade::on(request),
                    pending: Some(Pending {
                        options,
                        handler: Box::new(handler),
                        negotiation,
                    }),
                    opening: None,
                },
            )),
            Err(err) => {
                let ws = WebSocket::new(Role::Server, &options, Box::new(handler));
                let reported = err.reported();
                tokio::spawn(async move { ws.abort(&reported).await });
                Err(err)
            }
        }
    }
}
