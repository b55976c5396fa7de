//! Client side of the handshake.
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http::{header, HeaderMap, Method, Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use url::Url;

use super::{accept_key, generate_key, has_token, header_str, list, proxy};
use crate::{
    auth::{self, AuthChallenge},
    extensions,
    options::Negotiation,
    stream::{self, BoxedStream, Connector, TcpConnector},
    Handler, Options, Result, Role, WebSocket, WebSocketError,
};

/// Builder for establishing client WebSocket connections.
///
/// Returned by [`WebSocket::connect`]; awaiting it runs the handshake and resolves to an open
/// session.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use wsengine::{Credentials, Options, WebSocket};
///
/// async fn connect() -> wsengine::Result<()> {
///     let (handler, _events) = wsengine::events::channel();
///     let ws = WebSocket::connect("wss://example.com/socket".parse()?)
///         .with_options(
///             Options::default()
///                 .with_redirection()
///                 .with_credentials(Credentials::new("user", "secret"), false)
///                 .with_connect_timeout(Duration::from_secs(10)),
///         )
///         .with_handler(handler)
///         .await?;
///
///     ws.close().await
/// }
/// ```
pub struct WebSocketBuilder {
    url: Url,
    options: Options,
    handler: Option<Box<dyn Handler>>,
    tls: Option<TlsConnector>,
    transport: Option<Arc<dyn Connector>>,
    future: Option<BoxFuture<'static, Result<WebSocket>>>,
}

impl WebSocketBuilder {
    fn new(url: Url) -> Self {
        Self {
            url,
            options: Options::default(),
            handler: None,
            tls: None,
            transport: None,
            future: None,
        }
    }

    /// Sets the session options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the handler receiving the session events. Without one, events are dropped.
    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Sets a custom TLS connector for `wss://` URLs.
    ///
    /// This allows customized TLS settings, such as custom certificate validation, client
    /// certificates, or specific cipher suites.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Sets the connector opening the underlying byte streams, [`TcpConnector`] by default.
    ///
    /// Every connection attempt (including proxies, redirects and authentication retries) goes
    /// through it.
    pub fn with_transport(mut self, connector: impl Connector + 'static) -> Self {
        self.transport = Some(Arc::new(connector));
        self
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.future.is_none() {
            let future = WebSocket::connect_priv(
                this.url.clone(),
                std::mem::take(&mut this.options),
                this.handler.take().unwrap_or_else(|| Box::new(())),
                this.tls.take(),
                this.transport
                    .take()
                    .unwrap_or_else(|| Arc::new(TcpConnector)),
            );
            this.future = Some(future.boxed());
        }

        match this.future.as_mut() {
            Some(future) => future.poll_unpin(cx),
            None => Poll::Pending,
        }
    }
}

/// What a single handshake request ended with.
enum Outcome {
    Upgraded(BoxedStream, Negotiation),
    Unauthorized(Option<AuthChallenge>),
    Redirect(String),
}

/// State kept across the attempts of one connection.
struct Handshake<'a> {
    options: &'a Options,
    tls: Option<TlsConnector>,
    connector: Arc<dyn Connector>,
    cookies: Vec<(String, String)>,
    challenge: Option<AuthChallenge>,
    nonce_count: u32,
    /// Whether the current target shares the origin of the first url.
    trusted: bool,
}

impl<'a> Handshake<'a> {
    fn new(options: &'a Options, tls: Option<TlsConnector>, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            tls,
            connector,
            cookies: options.cookies.clone(),
            challenge: None,
            nonce_count: 0,
            trusted: true,
        }
    }

    /// Runs attempts until the connection is upgraded, following redirects and answering one
    /// authentication challenge.
    async fn run(&mut self, mut url: Url) -> Result<(BoxedStream, Negotiation)> {
        let max_attempts = self.options.max_connect_attempts();
        let origin = url.origin();
        let mut authenticating = false;

        for _ in 0..max_attempts {
            let limit = if authenticating {
                self.options.auth_timeout()
            } else {
                self.options.connect_timeout()
            };

            let outcome = tokio::time::timeout(limit, self.attempt(&url))
                .await
                .map_err(|_| WebSocketError::Timeout)??;

            match outcome {
                Outcome::Upgraded(stream, negotiation) => return Ok((stream, negotiation)),
                Outcome::Unauthorized(challenge) => {
                    if self.options.credentials.is_none() || !self.trusted {
                        return Err(WebSocketError::InvalidStatusCode(401));
                    }
                    if authenticating {
                        return Err(WebSocketError::AuthenticationFailed);
                    }

                    #[cfg(feature = "logging")]
                    log::debug!("client: retrying {url} with credentials");

                    self.challenge = Some(challenge.ok_or(WebSocketError::AuthenticationFailed)?);
                    self.nonce_count = 0;
                    authenticating = true;
                }
                Outcome::Redirect(location) => {
                    url = redirect(&url, &location)?;
                    authenticating = false;

                    // credentials only go to the origin they were configured for
                    self.challenge = None;
                    self.nonce_count = 0;
                    self.trusted = url.origin() == origin;

                    #[cfg(feature = "logging")]
                    log::debug!("client: redirected to {url}");
                }
            }
        }

        Err(WebSocketError::TooManyAttempts(max_attempts))
    }

    /// Opens a connection to `url` and sends one upgrade request.
    async fn attempt(&mut self, url: &Url) -> Result<Outcome> {
        let (host, port) = endpoint(url)?;

        let stream = match &self.options.proxy {
            Some(proxy) => proxy::connect(self.connector.as_ref(), proxy, &host, port).await?,
            None => self.connector.connect(&host, port).await?,
        };

        let stream = match url.scheme() {
            "wss" => {
                let tls = match self.tls.clone() {
                    Some(tls) => tls,
                    None => self.tls.insert(stream::tls_connector()?).clone(),
                };
                stream::tls_wrap(&tls, &host, stream).await?
            }
            _ => stream,
        };

        self.exchange(url, stream).await
    }

    /// Sends the upgrade request over `stream` and interprets the response.
    async fn exchange(&mut self, url: &Url, stream: BoxedStream) -> Result<Outcome> {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        tokio::spawn(async move {
            if let Err(_err) = conn.with_upgrades().await {
                #[cfg(feature = "logging")]
                log::error!("upgrading connection: {:?}", _err);
            }
        });

        let key = generate_key();
        let request = self.request(url, &key)?;
        let mut response = sender.send_request(request).await?;
        self.store_cookies(response.headers());

        let status = response.status();
        match status {
            StatusCode::SWITCHING_PROTOCOLS => {
                let (protocol, extensions) = verify(response.headers(), &key, self.options)?;
                let upgraded = hyper::upgrade::on(&mut response).await?;

                Ok(Outcome::Upgraded(
                    Box::new(TokioIo::new(upgraded)),
                    Negotiation {
                        protocol,
                        extensions,
                        cookies: self.cookies.clone(),
                    },
                ))
            }
            StatusCode::UNAUTHORIZED => Ok(Outcome::Unauthorized(
                response
                    .headers()
                    .get_all(header::WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .find_map(AuthChallenge::parse),
            )),
            status if status.is_redirection() && self.options.redirection => {
                let location = header_str(response.headers(), header::LOCATION)
                    .ok_or(WebSocketError::InvalidRedirect)?;
                Ok(Outcome::Redirect(location.to_string()))
            }
            status => Err(WebSocketError::InvalidStatusCode(status.as_u16())),
        }
    }

    fn request(&mut self, url: &Url, key: &str) -> Result<Request<Empty<Bytes>>> {
        let target = &url[url::Position::BeforePath..];
        let mut builder = Request::builder().method(Method::GET).uri(target);

        for (name, value) in &self.options.headers {
            builder = builder.header(name, value);
        }

        // allow the user to set a custom Host header.
        if !self.options.headers.contains_key(header::HOST) {
            let host = url
                .host_str()
                .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?;
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(header::HOST, host);
        }

        builder = builder
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, key)
            .header(header::SEC_WEBSOCKET_VERSION, "13");

        if let Some(origin) = &self.options.origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        if !self.options.protocols.is_empty() {
            builder = builder.header(
                header::SEC_WEBSOCKET_PROTOCOL,
                self.options.protocols.join(", "),
            );
        }
        if let Some(offer) = extensions::build_offer(self.options.compression.is_some()) {
            builder = builder.header(header::SEC_WEBSOCKET_EXTENSIONS, offer);
        }

        if let Some(credentials) = self.options.credentials.as_ref().filter(|_| self.trusted) {
            if let Some(challenge) = &self.challenge {
                self.nonce_count += 1;
                builder = builder.header(
                    header::AUTHORIZATION,
                    challenge.response(credentials, self.nonce_count, "GET", target),
                );
            } else if self.options.preauth {
                builder = builder.header(header::AUTHORIZATION, auth::basic(credentials));
            }
        }

        if !self.cookies.is_empty() {
            let cookies = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(header::COOKIE, cookies);
        }

        Ok(builder.body(Empty::new())?)
    }

    /// Keeps the cookies of `Set-Cookie` headers, replacing those with the same name.
    fn store_cookies(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(header::SET_COOKIE) {
            let Some((name, value)) = value
                .to_str()
                .ok()
                .and_then(|cookie| cookie.split(';').next())
                .and_then(|pair| pair.split_once('='))
            else {
                continue;
            };

            let (name, value) = (name.trim().to_string(), value.trim().to_string());
            match self.cookies.iter_mut().find(|(existing, _)| *existing == name) {
                Some(cookie) => cookie.1 = value,
                None => self.cookies.push((name, value)),
            }
        }
    }
}

/// One upgrade request over a stream the caller connected.
async fn single_exchange(
    url: &Url,
    stream: BoxedStream,
    options: &Options,
) -> Result<(BoxedStream, Negotiation)> {
    check_scheme(url)?;

    let mut handshake = Handshake::new(options, None, Arc::new(TcpConnector));
    let outcome = tokio::time::timeout(options.connect_timeout(), handshake.exchange(url, stream))
        .await
        .map_err(|_| WebSocketError::Timeout)??;

    match outcome {
        Outcome::Upgraded(stream, negotiation) => Ok((stream, negotiation)),
        Outcome::Unauthorized(_) => Err(WebSocketError::InvalidStatusCode(401)),
        Outcome::Redirect(_) => Err(WebSocketError::InvalidRedirect),
    }
}

/// The host and port a URL points to.
fn endpoint(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?;
    let port = url
        .port_or_known_default()
        .ok_or(WebSocketError::InvalidHttpScheme)?;

    // IPv6 literals come bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

fn check_scheme(url: &Url) -> Result<()> {
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        _ => Err(WebSocketError::InvalidHttpScheme),
    }
}

/// Resolves a `Location` header against the current URL.
fn redirect(current: &Url, location: &str) -> Result<Url> {
    let url = current
        .join(location)
        .map_err(|_| WebSocketError::InvalidRedirect)?;
    check_scheme(&url).map_err(|_| WebSocketError::InvalidRedirect)?;
    Ok(url)
}

/// Validates a `101 Switching Protocols` response, returning the selected subprotocol and the
/// negotiated extensions.
pub(crate) fn verify(
    headers: &HeaderMap,
    key: &str,
    options: &Options,
) -> Result<(Option<String>, extensions::Extensions)> {
    if !header_str(headers, header::UPGRADE).is_some_and(|h| h.eq_ignore_ascii_case("websocket")) {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if header_str(headers, header::SEC_WEBSOCKET_ACCEPT) != Some(accept_key(key.as_bytes()).as_str())
    {
        return Err(WebSocketError::InvalidAcceptKey);
    }

    if headers.contains_key(header::SEC_WEBSOCKET_VERSION)
        && header_str(headers, header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some("13")
    {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    let selected = list(headers, header::SEC_WEBSOCKET_PROTOCOL);
    let protocol = match selected.as_slice() {
        [] => None,
        [protocol] if options.protocols.contains(protocol) => Some(protocol.clone()),
        _ => {
            return Err(WebSocketError::InvalidSubprotocol(selected.join(", ")));
        }
    };

    let extensions = extensions::parse_server_selection(
        header_str(headers, header::SEC_WEBSOCKET_EXTENSIONS),
        options.compression.is_some(),
    )?
    .unwrap_or_default();

    #[cfg(feature = "logging")]
    log::debug!("client: negotiated protocol={protocol:?} extensions=\"{extensions}\"");

    Ok((protocol, extensions))
}

impl WebSocket {
    /// Connects to a WebSocket server.
    ///
    /// Returns a [`WebSocketBuilder`] to configure the options, the handler and the
    /// connectors; awaiting it performs the handshake.
    ///
    /// # Example
    /// ```no_run
    /// use wsengine::WebSocket;
    ///
    /// async fn connect() -> wsengine::Result<()> {
    ///     let ws = WebSocket::connect("ws://localhost:8080/chat".parse()?).await?;
    ///     ws.send_text("hello").await?;
    ///     ws.close().await
    /// }
    /// ```
    pub fn connect(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    async fn connect_priv(
        url: Url,
        options: Options,
        handler: Box<dyn Handler>,
        tls: Option<TlsConnector>,
        connector: Arc<dyn Connector>,
    ) -> Result<WebSocket> {
        let ws = WebSocket::new(Role::Client, &options, handler);

        let result = match check_scheme(&url) {
            Ok(()) => Handshake::new(&options, tls, connector).run(url).await,
            Err(err) => Err(err),
        };

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

    /// Performs a client handshake over an existing connection.
    ///
    /// `io` must already be connected (and wrapped in TLS for `wss://`). A single request is
    /// sent: redirects and authentication challenges cannot be followed over one stream and
    /// fail with [`WebSocketError::InvalidStatusCode`].
    ///
    /// # Example
    /// ```no_run
    /// use tokio::net::TcpStream;
    /// use wsengine::{Options, WebSocket};
    ///
    /// async fn handshake() -> wsengine::Result<()> {
    ///     let stream = TcpStream::connect("127.0.0.1:8080").await?;
    ///     let ws = WebSocket::handshake(
    ///         "ws://localhost:8080".parse()?,
    ///         stream,
    ///         Options::default(),
    ///         (),
    ///     )
    ///     .await?;
    ///     ws.close().await
    /// }
    /// ```
    pub async fn handshake<S>(
        url: Url,
        io: S,
        options: Options,
        handler: impl Handler,
    ) -> Result<WebSocket>
    where
        S: stream::Transport + 'static,
    {
        let ws = WebSocket::new(Role::Client, &options, Box::new(handler));

        let result = single_exchange(&url, Box::new(io), &options).await;

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
}
