mod common;

use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Response, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use wsengine::{
    close::CloseCode, Credentials, Event, Options, ProxyConfig, ReadyState, WebSocket,
    WebSocketError,
};

use common::{read_head, serve, upgrade, Peer, TestConnector};

fn status(status: StatusCode) -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = status;
    response
}

fn with_header(mut response: Response<Empty<Bytes>>, name: header::HeaderName, value: &'static str) -> Response<Empty<Bytes>> {
    response
        .headers_mut()
        .append(name, HeaderValue::from_static(value));
    response
}

async fn next_session(sessions: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    tokio::time::timeout(common::TIMEOUT, sessions.recv())
        .await
        .expect("timed out waiting for the server session")
        .expect("no server session")
}

#[tokio::test]
async fn test_server_rejects_bad_request() {
    let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
    let accepted = tokio::spawn(common::accept(server_io, Options::default()));

    client_io
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client_io).await;
    assert!(head.starts_with("HTTP/1.1 400"), "unexpected answer: {head}");

    let (result, mut events) = accepted.await.unwrap();
    assert!(matches!(result, Err(WebSocketError::MissingSecWebSocketKey)));

    // the error is reported, then a 1006 close
    match events.recv().await {
        Some(Event::Error(err)) => assert!(matches!(*err, WebSocketError::MissingSecWebSocketKey)),
        other => panic!("unexpected {other:?}"),
    }
    match events.recv().await {
        Some(Event::Close(event)) => {
            assert_eq!(event.code, CloseCode::Abnormal);
            assert!(!event.was_clean);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_server_version_mismatch() {
    let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
    let accepted = tokio::spawn(common::accept(server_io, Options::default()));

    let request = common::UPGRADE_REQUEST.replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
    client_io.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut client_io).await;
    assert!(head.starts_with("HTTP/1.1 426"), "unexpected answer: {head}");
    assert_eq!(common::header(&head, "sec-websocket-version"), Some("13"));

    let (result, _) = accepted.await.unwrap();
    assert!(matches!(result, Err(WebSocketError::InvalidSecWebsocketVersion)));
}

#[tokio::test]
async fn test_validator_rejection() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (handler, mut events) = wsengine::events::channel();
    let server = Options::default().with_validator(|request| {
        match request.headers.get(header::ORIGIN) {
            Some(origin) if origin == "https://trusted.example" => Ok(()),
            _ => Err("untrusted origin".to_string()),
        }
    });

    let (client, server) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/".parse().unwrap(),
            client_io,
            Options::default().with_origin("https://evil.example"),
            handler
        ),
        common::accept(server_io, server),
    );

    assert!(matches!(client, Err(WebSocketError::InvalidStatusCode(400))));
    assert!(matches!(server.0, Err(WebSocketError::Rejected(reason)) if reason == "untrusted origin"));

    assert!(matches!(events.recv().await, Some(Event::Error(_))));
    assert!(matches!(
        events.recv().await,
        Some(Event::Close(event)) if event.code == CloseCode::Abnormal
    ));
}

#[tokio::test]
async fn test_validator_acceptance() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Options::default().with_validator(|request| {
        match request.headers.get(header::ORIGIN) {
            Some(origin) if origin == "https://trusted.example" => Ok(()),
            _ => Err("untrusted origin".to_string()),
        }
    });

    let (client, server) = tokio::join!(
        WebSocket::handshake(
            "ws://localhost/".parse().unwrap(),
            client_io,
            Options::default().with_origin("https://trusted.example"),
            ()
        ),
        common::accept(server_io, server),
    );

    assert_eq!(client.unwrap().ready_state(), ReadyState::Open);
    assert_eq!(server.0.unwrap().ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn test_connect_with_transport() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = TestConnector::new(move |_, io| {
        let tx = tx.clone();
        serve(io, move |request| upgrade(request, tx.clone()));
    });

    let (handler, events) = wsengine::events::channel();
    let ws = WebSocket::connect("ws://echo.test/".parse().unwrap())
        .with_transport(connector.clone())
        .with_handler(handler)
        .await
        .unwrap();
    let mut client = Peer { ws, events };
    let mut server = next_session(&mut sessions).await;

    assert_eq!(connector.connections(), vec!["echo.test:80"]);

    client.ws.send_text("over hyper").await.unwrap();
    assert_eq!(server.message().await.as_str(), Some("over hyper"));

    client.ws.close().await.unwrap();
    assert!(client.closed().await.was_clean);
    assert!(server.closed().await.was_clean);
}

#[tokio::test]
async fn test_redirect() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = TestConnector::new(move |host, io| match host {
        "old.test" => serve(io, |_| {
            with_header(
                status(StatusCode::MOVED_PERMANENTLY),
                header::LOCATION,
                "ws://new.test:8080/socket",
            )
        }),
        _ => {
            let tx = tx.clone();
            serve(io, move |request| {
                assert_eq!(request.uri().path(), "/socket");
                upgrade(request, tx.clone())
            })
        }
    });

    let ws = WebSocket::connect("ws://old.test/".parse().unwrap())
        .with_options(Options::default().with_redirection())
        .with_transport(connector.clone())
        .await
        .unwrap();

    assert_eq!(ws.ready_state(), ReadyState::Open);
    assert_eq!(connector.connections(), vec!["old.test:80", "new.test:8080"]);
    next_session(&mut sessions).await;

    // without redirection the 3xx is a failure
    let result = WebSocket::connect("ws://old.test/".parse().unwrap())
        .with_transport(connector)
        .await;
    assert!(matches!(result, Err(WebSocketError::InvalidStatusCode(301))));
}

#[tokio::test]
async fn test_redirect_loop() {
    let connector = TestConnector::new(|_, io| {
        serve(io, |_| {
            with_header(status(StatusCode::FOUND), header::LOCATION, "/again")
        })
    });

    let result = WebSocket::connect("ws://loop.test/".parse().unwrap())
        .with_options(
            Options::default()
                .with_redirection()
                .with_max_connect_attempts(3),
        )
        .with_transport(connector.clone())
        .await;

    assert!(matches!(result, Err(WebSocketError::TooManyAttempts(3))));
    assert_eq!(connector.connections().len(), 3);
}

#[tokio::test]
async fn test_redirect_to_other_scheme() {
    let connector = TestConnector::new(|_, io| {
        serve(io, |_| {
            with_header(status(StatusCode::FOUND), header::LOCATION, "https://example.com/")
        })
    });

    let result = WebSocket::connect("ws://redirect.test/".parse().unwrap())
        .with_options(Options::default().with_redirection())
        .with_transport(connector)
        .await;

    assert!(matches!(result, Err(WebSocketError::InvalidRedirect)));
}

/// A route answering `401` with `challenge` until the expected credentials show up.
fn auth_route(
    challenge: &'static str,
    accept: fn(&str) -> bool,
    sessions: mpsc::UnboundedSender<Peer>,
) -> TestConnector {
    TestConnector::new(move |_, io| {
        let sessions = sessions.clone();
        serve(io, move |request| {
            let authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .is_some_and(accept);

            if authorized {
                upgrade(request, sessions.clone())
            } else {
                let response = with_header(
                    status(StatusCode::UNAUTHORIZED),
                    header::WWW_AUTHENTICATE,
                    challenge,
                );
                with_header(response, header::SET_COOKIE, "session=abc; HttpOnly")
            }
        })
    })
}

#[tokio::test]
async fn test_basic_auth_retry() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = auth_route(
        "Basic realm=\"test\"",
        |value| value == "Basic dXNlcjpwYXNz",
        tx,
    );

    let ws = WebSocket::connect("ws://auth.test/private".parse().unwrap())
        .with_options(
            Options::default()
                .with_credentials(Credentials::new("user", "pass"), false)
                .with_cookie("theme", "dark"),
        )
        .with_transport(connector.clone())
        .await
        .unwrap();

    assert_eq!(ws.ready_state(), ReadyState::Open);
    // a fresh connection for the authenticated retry
    assert_eq!(connector.connections().len(), 2);
    assert_eq!(
        ws.cookies(),
        vec![
            ("theme".to_string(), "dark".to_string()),
            ("session".to_string(), "abc".to_string())
        ]
    );
    next_session(&mut sessions).await;
}

#[tokio::test]
async fn test_redirect_drops_credentials() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let connector = TestConnector::new(move |host, io| match host {
        "auth.test" => serve(io, |request| {
            if request.headers().contains_key(header::AUTHORIZATION) {
                with_header(status(StatusCode::FOUND), header::LOCATION, "ws://other.test/")
            } else {
                with_header(
                    status(StatusCode::UNAUTHORIZED),
                    header::WWW_AUTHENTICATE,
                    "Basic realm=\"test\"",
                )
            }
        }),
        _ => {
            let tx = tx.clone();
            let seen_tx = seen_tx.clone();
            serve(io, move |request| {
                let _ = seen_tx.send(request.headers().get(header::AUTHORIZATION).cloned());
                upgrade(request, tx.clone())
            })
        }
    });

    let ws = WebSocket::connect("ws://auth.test/".parse().unwrap())
        .with_options(
            Options::default()
                .with_credentials(Credentials::new("user", "pass"), false)
                .with_redirection(),
        )
        .with_transport(connector.clone())
        .await
        .unwrap();

    assert_eq!(ws.ready_state(), ReadyState::Open);
    assert_eq!(
        connector.connections(),
        vec!["auth.test:80", "auth.test:80", "other.test:80"]
    );
    assert_eq!(seen.recv().await, Some(None));
    next_session(&mut sessions).await;
}

#[tokio::test]
async fn test_redirect_elsewhere_refuses_challenge() {
    let connector = TestConnector::new(|host, io| match host {
        "auth.test" => serve(io, |_| {
            with_header(status(StatusCode::FOUND), header::LOCATION, "ws://other.test/")
        }),
        _ => serve(io, |_| {
            with_header(
                status(StatusCode::UNAUTHORIZED),
                header::WWW_AUTHENTICATE,
                "Basic realm=\"other\"",
            )
        }),
    });

    let result = WebSocket::connect("ws://auth.test/".parse().unwrap())
        .with_options(
            Options::default()
                .with_credentials(Credentials::new("user", "pass"), true)
                .with_redirection(),
        )
        .with_transport(connector.clone())
        .await;

    assert!(matches!(result, Err(WebSocketError::InvalidStatusCode(401))));
    assert_eq!(connector.connections(), vec!["auth.test:80", "other.test:80"]);
}

#[tokio::test]
async fn test_preauth() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = auth_route(
        "Basic realm=\"test\"",
        |value| value == "Basic dXNlcjpwYXNz",
        tx,
    );

    WebSocket::connect("ws://auth.test/".parse().unwrap())
        .with_options(Options::default().with_credentials(Credentials::new("user", "pass"), true))
        .with_transport(connector.clone())
        .await
        .unwrap();

    assert_eq!(connector.connections().len(), 1);
    next_session(&mut sessions).await;
}

#[tokio::test]
async fn test_digest_auth_retry() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = auth_route(
        "Digest realm=\"test\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", qop=\"auth\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        |value| {
            value.starts_with("Digest ")
                && value.contains("username=\"user\"")
                && value.contains("nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\"")
                && value.contains("uri=\"/private\"")
                && value.contains("nc=00000001")
                && value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"")
        },
        tx,
    );

    let ws = WebSocket::connect("ws://auth.test/private".parse().unwrap())
        .with_options(Options::default().with_credentials(Credentials::new("user", "pass"), false))
        .with_transport(connector)
        .await
        .unwrap();

    assert_eq!(ws.ready_state(), ReadyState::Open);
    next_session(&mut sessions).await;
}

#[tokio::test]
async fn test_auth_failures() {
    let (tx, _sessions) = mpsc::unbounded_channel();
    let connector = auth_route("Basic realm=\"test\"", |_| false, tx);

    // no credentials
    let result = WebSocket::connect("ws://auth.test/".parse().unwrap())
        .with_transport(connector.clone())
        .await;
    assert!(matches!(result, Err(WebSocketError::InvalidStatusCode(401))));

    // wrong credentials: one retry only
    let (handler, mut events) = wsengine::events::channel();
    let result = WebSocket::connect("ws://auth.test/".parse().unwrap())
        .with_options(Options::default().with_credentials(Credentials::new("user", "wrong"), false))
        .with_transport(connector.clone())
        .with_handler(handler)
        .await;
    assert!(matches!(result, Err(WebSocketError::AuthenticationFailed)));
    assert_eq!(connector.connections().len(), 3);

    assert!(matches!(
        events.recv().await,
        Some(Event::Error(err)) if matches!(*err, WebSocketError::AuthenticationFailed)
    ));
    assert!(matches!(events.recv().await, Some(Event::Close(_))));
}

#[tokio::test]
async fn test_proxy_tunnel() {
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let connector = TestConnector::new(move |host, io| {
        assert_eq!(host, "proxy.test");
        let tx = tx.clone();
        serve(io, move |mut request| {
            assert_eq!(request.method(), Method::CONNECT);
            assert_eq!(request.uri().authority().map(|a| a.as_str()), Some("ws.test:80"));

            let authorized = request.headers().get(header::PROXY_AUTHORIZATION)
                == Some(&HeaderValue::from_static("Basic dXNlcjpwYXNz"));
            if !authorized {
                return with_header(
                    status(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
                    header::PROXY_AUTHENTICATE,
                    "Basic realm=\"proxy\"",
                );
            }

            // the tunnel end plays the WebSocket server
            let on_upgrade = hyper::upgrade::on(&mut request);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(upgraded) = on_upgrade.await else {
                    return;
                };
                let (handler, events) = wsengine::events::channel();
                if let Ok(ws) = WebSocket::accept(TokioIo::new(upgraded), Options::default(), handler).await {
                    let _ = tx.send(Peer { ws, events });
                }
            });
            status(StatusCode::OK)
        })
    });

    let proxy = ProxyConfig::new("http://proxy.test:3128".parse().unwrap())
        .with_credentials(Credentials::new("user", "pass"));
    let ws = WebSocket::connect("ws://ws.test/".parse().unwrap())
        .with_options(Options::default().with_proxy(proxy))
        .with_transport(connector.clone())
        .await
        .unwrap();

    assert_eq!(
        connector.connections(),
        vec!["proxy.test:3128", "proxy.test:3128"]
    );

    let mut server = next_session(&mut sessions).await;
    ws.send_text("through the tunnel").await.unwrap();
    assert_eq!(server.message().await.as_str(), Some("through the tunnel"));
}

#[tokio::test]
async fn test_proxy_refusal() {
    let connector = TestConnector::new(|_, io| serve(io, |_| status(StatusCode::FORBIDDEN)));

    let result = WebSocket::connect("ws://ws.test/".parse().unwrap())
        .with_options(
            Options::default()
                .with_proxy(ProxyConfig::new("http://proxy.test:3128".parse().unwrap())),
        )
        .with_transport(connector)
        .await;

    assert!(matches!(result, Err(WebSocketError::ProxyConnectFailed(403))));
}

#[tokio::test]
async fn test_connect_timeout() {
    // a server that never answers
    let connector = TestConnector::new(|_, io| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(io);
        });
    });

    let result = WebSocket::connect("ws://slow.test/".parse().unwrap())
        .with_options(Options::default().with_connect_timeout(Duration::from_millis(100)))
        .with_transport(connector)
        .await;

    assert!(matches!(result, Err(WebSocketError::Timeout)));
}

#[tokio::test]
async fn test_invalid_scheme() {
    let result = WebSocket::connect("http://localhost/".parse().unwrap()).await;
    assert!(matches!(result, Err(WebSocketError::InvalidHttpScheme)));
}
