//! `CONNECT` tunnels through an HTTP proxy.
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;

use crate::{
    auth::AuthChallenge,
    options::ProxyConfig,
    stream::{BoxedStream, Connector},
    Result, WebSocketError,
};

enum Tunnel {
    Established(BoxedStream),
    Unauthorized(Option<AuthChallenge>),
}

/// Opens a tunnel to `host:port` through the proxy.
///
/// A `407` is answered once, on a new connection, when the proxy has credentials.
pub(super) async fn connect(
    connector: &dyn Connector,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<BoxedStream> {
    let authority = authority(host, port);

    match open(connector, proxy, &authority, None).await? {
        Tunnel::Established(stream) => Ok(stream),
        Tunnel::Unauthorized(challenge) => {
            let (Some(credentials), Some(challenge)) = (&proxy.credentials, challenge) else {
                return Err(WebSocketError::ProxyConnectFailed(
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED.as_u16(),
                ));
            };

            #[cfg(feature = "logging")]
            log::debug!("proxy: retrying CONNECT {authority} with credentials");

            let answer = challenge.response(credentials, 1, "CONNECT", &authority);
            match open(connector, proxy, &authority, Some(answer)).await? {
                Tunnel::Established(stream) => Ok(stream),
                Tunnel::Unauthorized(_) => Err(WebSocketError::AuthenticationFailed),
            }
        }
    }
}

/// One `CONNECT` exchange on a fresh connection to the proxy.
async fn open(
    connector: &dyn Connector,
    proxy: &ProxyConfig,
    authority: &str,
    authorization: Option<String>,
) -> Result<Tunnel> {
    let proxy_host = proxy
        .url
        .host_str()
        .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let proxy_port = proxy
        .url
        .port_or_known_default()
        .ok_or(WebSocketError::InvalidHttpScheme)?;

    let stream = connector.connect(proxy_host, proxy_port).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(_err) = conn.with_upgrades().await {
            #[cfg(feature = "logging")]
            log::error!("proxy connection: {:?}", _err);
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .header(header::HOST, authority);
    if let Some(authorization) = authorization {
        request = request.header(header::PROXY_AUTHORIZATION, authorization);
    }

    let mut response = sender.send_request(request.body(Empty::<Bytes>::new())?).await?;
    let status = response.status();

    #[cfg(feature = "logging")]
    log::debug!("proxy: CONNECT {authority} answered {status}");

    if status.is_success() {
        let upgraded = hyper::upgrade::on(&mut response).await?;
        return Ok(Tunnel::Established(Box::new(TokioIo::new(upgraded))));
    }

    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Ok(Tunnel::Unauthorized(
            response
                .headers()
                .get_all(header::PROXY_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(AuthChallenge::parse),
        ));
    }

    Err(WebSocketError::ProxyConnectFailed(status.as_u16()))
}

/// `host:port`, with IPv6 literals bracketed.
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
