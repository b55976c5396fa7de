use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::{
    auth::Credentials, extensions::Extensions, HandshakeRequest, Role, MAX_PAYLOAD_READ,
    MAX_READ_BUFFER,
};

/// Compression level used for the permessage-deflate extension.
pub type CompressionLevel = flate2::Compression;

/// A server-side hook inspecting the upgrade request once the protocol checks passed.
///
/// Returning `Err(reason)` rejects the handshake with a `400 Bad Request`.
pub type Validator = Arc<dyn Fn(&HandshakeRequest<'_>) -> Result<(), String> + Send + Sync>;

/// Default fragment size for outgoing messages.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1016;

/// Default number of connection attempts (redirects and authentication retries included).
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: usize = 10;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(15);
const CLIENT_WAIT_TIME: Duration = Duration::from_secs(5);
const SERVER_WAIT_TIME: Duration = Duration::from_secs(1);

/// How received messages reach the [`Handler`](crate::Handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Messages are queued and a dispatch task drains the queue, so a slow handler never
    /// stalls reading (control frames keep being answered).
    #[default]
    Queued,
    /// The receive loop calls the handler and waits for it before reading the next frame.
    Inline,
}

/// An HTTP proxy reached through a `CONNECT` tunnel.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The proxy address, e.g. `http://proxy.local:3128`.
    pub url: Url,
    /// Credentials answering a `407 Proxy Authentication Required`.
    pub credentials: Option<Credentials>,
}

impl ProxyConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            credentials: None,
        }
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self
        }
    }
}

/// Configuration options for a WebSocket session.
///
/// `Options` governs both roles: limits, compression, the close handshake and message delivery
/// apply to clients and servers alike, the handshake settings apply to the role that uses
/// them. Every field has a sensible default, and the `with_*` methods build on top of
/// [`Options::default`].
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsengine::{CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::fast())
///     .with_utf8()
///     .with_protocols(["chat", "superchat"])
///     .with_keepalive(Duration::from_secs(30));
/// ```
#[derive(Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled or decompressed message.
    ///
    /// Default: 2 MiB as defined in [`MAX_READ_BUFFER`], or twice the configured
    /// `max_payload_read` value if that is set.
    pub max_read_buffer: Option<usize>,

    /// Compression level of the permessage-deflate extension. `None` disables compression:
    /// a client makes no offer and a server ignores offers.
    pub compression: Option<CompressionLevel>,

    /// Validate that received text messages are UTF-8, closing with 1007 otherwise.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Bound on the close handshake and ping waits.
    ///
    /// Default: 5 seconds for clients, 1 second for servers.
    pub wait_time: Option<Duration>,

    /// Surface received pings to the handler after answering them.
    pub emit_on_ping: bool,

    /// Outgoing messages larger than this are split into several frames.
    ///
    /// Default: 1016 bytes.
    pub fragment_size: Option<usize>,

    /// How messages are handed to the handler.
    pub delivery: Delivery,

    /// Interval of automatic pings. A pong must arrive within `wait_time` of each ping or the
    /// session closes abnormally.
    pub keepalive: Option<Duration>,

    /// Client: the `Origin` header.
    pub origin: Option<String>,

    /// Client: subprotocols offered, in order of preference. Server: subprotocols supported.
    pub protocols: Vec<String>,

    /// Client: credentials answering a `401 Unauthorized`.
    pub credentials: Option<Credentials>,

    /// Client: send Basic credentials with the first request instead of waiting for a
    /// challenge.
    pub preauth: bool,

    /// Client: tunnel through an HTTP proxy.
    pub proxy: Option<ProxyConfig>,

    /// Client: cookies sent with the handshake request.
    pub cookies: Vec<(String, String)>,

    /// Extra headers. Client: added to the upgrade request. Server: added to the `101` response.
    pub headers: HeaderMap,

    /// Client: follow `3xx` redirects.
    pub redirection: bool,

    /// Client: maximum number of handshake requests, redirects and authentication retries
    /// included.
    ///
    /// Default: 10.
    pub max_connect_attempts: Option<usize>,

    /// Bound on each handshake attempt.
    ///
    /// Default: 5 seconds.
    pub connect_timeout: Option<Duration>,

    /// Client: bound on the authenticated retry.
    ///
    /// Default: 15 seconds.
    pub auth_timeout: Option<Duration>,

    /// Server: custom validation of the upgrade request.
    pub validator: Option<Validator>,
}

impl Options {
    /// Enables permessage-deflate with the given level.
    ///
    /// Context takeover is never negotiated, so every message is compressed on its own.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        Self {
            compression: Some(level),
            ..self
        }
    }

    /// Disables compression.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum allowed payload size of incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of reassembled and decompressed messages.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    pub fn with_wait_time(self, wait_time: Duration) -> Self {
        Self {
            wait_time: Some(wait_time),
            ..self
        }
    }

    /// Surfaces received pings to the handler.
    pub fn with_emit_on_ping(self) -> Self {
        Self {
            emit_on_ping: true,
            ..self
        }
    }

    /// Sets the size above which outgoing messages are fragmented. Zero is ignored.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: (size > 0).then_some(size),
            ..self
        }
    }

    pub fn with_delivery(self, delivery: Delivery) -> Self {
        Self { delivery, ..self }
    }

    pub fn with_keepalive(self, interval: Duration) -> Self {
        Self {
            keepalive: Some(interval),
            ..self
        }
    }

    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// Sets the subprotocols offered (client) or supported (server).
    pub fn with_protocols<I, S>(self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Sets the credentials used to answer authentication challenges.
    ///
    /// With `preauth`, Basic credentials are sent with the first request.
    pub fn with_credentials(self, credentials: Credentials, preauth: bool) -> Self {
        Self {
            credentials: Some(credentials),
            preauth,
            ..self
        }
    }

    pub fn with_proxy(self, proxy: ProxyConfig) -> Self {
        Self {
            proxy: Some(proxy),
            ..self
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Follows `3xx` redirects during the client handshake.
    pub fn with_redirection(self) -> Self {
        Self {
            redirection: true,
            ..self
        }
    }

    pub fn with_max_connect_attempts(self, attempts: usize) -> Self {
        Self {
            max_connect_attempts: Some(attempts),
            ..self
        }
    }

    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_auth_timeout(self, timeout: Duration) -> Self {
        Self {
            auth_timeout: Some(timeout),
            ..self
        }
    }

    /// Installs a server-side validation hook.
    ///
    /// # Example
    /// ```rust
    /// use wsengine::Options;
    ///
    /// let options = Options::default().with_validator(|request| {
    ///     match request.headers.get("authorization") {
    ///         Some(_) => Ok(()),
    ///         None => Err("missing token".to_string()),
    ///     }
    /// });
    /// ```
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&HandshakeRequest<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            validator: Some(Arc::new(validator)),
            ..self
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn auth_timeout(&self) -> Duration {
        self.auth_timeout.unwrap_or(DEFAULT_AUTH_TIMEOUT)
    }

    pub(crate) fn max_connect_attempts(&self) -> usize {
        self.max_connect_attempts
            .unwrap_or(DEFAULT_MAX_CONNECT_ATTEMPTS)
            .max(1)
    }
}

/// Session settings resolved from [`Options`] for one role.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub max_payload_read: usize,
    pub max_read_buffer: usize,
    pub compression: Option<CompressionLevel>,
    pub check_utf8: bool,
    pub wait_time: Duration,
    pub emit_on_ping: bool,
    pub fragment_size: usize,
    pub delivery: Delivery,
    pub keepalive: Option<Duration>,
}

impl Config {
    pub(crate) fn new(options: &Options, role: Role) -> Self {
        let max_payload_read = options.max_payload_read.unwrap_or(MAX_PAYLOAD_READ);
        let max_read_buffer = options.max_read_buffer.unwrap_or(
            options
                .max_payload_read
                .map(|payload| payload * 2)
                .unwrap_or(MAX_READ_BUFFER),
        );
        let wait_time = options.wait_time.unwrap_or(match role {
            Role::Client => CLIENT_WAIT_TIME,
            Role::Server => SERVER_WAIT_TIME,
        });

        Self {
            max_payload_read,
            max_read_buffer,
            compression: options.compression,
            check_utf8: options.check_utf8,
            wait_time,
            emit_on_ping: options.emit_on_ping,
            fragment_size: options.fragment_size.unwrap_or(DEFAULT_FRAGMENT_SIZE),
            delivery: options.delivery,
            keepalive: options.keepalive,
        }
    }
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiation {
    pub protocol: Option<String>,
    pub extensions: Extensions,
    pub cookies: Vec<(String, String)>,
}
