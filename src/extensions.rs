//! # Extensions
//!
//! Negotiation of the `permessage-deflate` extension ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692))
//! through the `Sec-WebSocket-Extensions` header.
//!
//! Context takeover is never used: a client always offers, and a server always answers,
//!
//! ```text
//! permessage-deflate; server_no_context_takeover; client_no_context_takeover
//! ```
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, space0},
    combinator::{all_consuming, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};

use crate::WebSocketError;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";

/// The per-message compression method in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// No compression.
    #[default]
    None,
    /// permessage-deflate.
    Deflate,
}

/// The outcome of extension negotiation, computed once during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extensions {
    pub compression: CompressionMethod,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

impl Extensions {
    /// permessage-deflate with both no-context-takeover flags, the only configuration used.
    pub fn deflate() -> Self {
        Self {
            compression: CompressionMethod::Deflate,
            client_no_context_takeover: true,
            server_no_context_takeover: true,
        }
    }

    /// Whether messages are compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression == CompressionMethod::Deflate
    }
}

impl std::fmt::Display for Extensions {
    /// Formats the extensions as a `Sec-WebSocket-Extensions` header value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.compression == CompressionMethod::None {
            return Ok(());
        }

        write!(f, "{PERMESSAGE_DEFLATE}")?;
        if self.server_no_context_takeover {
            write!(f, "; {SERVER_NO_CONTEXT_TAKEOVER}")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; {CLIENT_NO_CONTEXT_TAKEOVER}")?;
        }
        Ok(())
    }
}

/// One extension token of a `Sec-WebSocket-Extensions` header with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionToken<'a> {
    pub name: &'a str,
    pub params: Vec<(&'a str, Option<&'a str>)>,
}

impl ExtensionToken<'_> {
    fn is_deflate(&self) -> bool {
        self.name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE)
    }

    fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char).parse(input)
}

fn value(input: &str) -> IResult<&str, &str> {
    alt((token, delimited(char('"'), take_while(|c: char| c != '"'), char('"')))).parse(input)
}

/// `; key[=value]`
fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, char(';'), space0),
        pair(token, opt(preceded((space0, char('='), space0), value))),
    )
    .parse(input)
}

fn extension(input: &str) -> IResult<&str, ExtensionToken<'_>> {
    pair(token, many0(param))
        .map(|(name, params)| ExtensionToken { name, params })
        .parse(input)
}

/// Parses a complete `Sec-WebSocket-Extensions` header value.
pub fn parse(header: &str) -> Result<Vec<ExtensionToken<'_>>, WebSocketError> {
    all_consuming(delimited(
        space0,
        separated_list1((space0, char(','), space0), extension),
        space0,
    ))
    .parse(header)
    .map(|(_, tokens)| tokens)
    .map_err(|_| WebSocketError::InvalidExtension(header.to_string()))
}

/// Builds the client offer, or `None` when compression is not requested.
pub fn build_offer(compression_requested: bool) -> Option<String> {
    compression_requested.then(|| Extensions::deflate().to_string())
}

/// Validates the server's `Sec-WebSocket-Extensions` answer on the client side.
///
/// `offered` tells whether the client offered permessage-deflate. An absent or empty header
/// means no extension is in use.
///
/// # Errors
/// [`WebSocketError::InvalidExtension`] when the server selects an extension that was not
/// offered, omits `server_no_context_takeover`, or adds unknown parameters.
pub fn parse_server_selection(
    header: Option<&str>,
    offered: bool,
) -> Result<Option<Extensions>, WebSocketError> {
    let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };

    let mut selected = None;
    for ext in parse(header)? {
        if !ext.is_deflate() {
            return Err(WebSocketError::InvalidExtension(format!(
                "unsupported extension {}",
                ext.name
            )));
        }
        if !offered {
            return Err(WebSocketError::InvalidExtension(
                "server selected permessage-deflate without an offer".to_string(),
            ));
        }
        if selected.is_some() {
            return Err(WebSocketError::InvalidExtension(
                "permessage-deflate selected twice".to_string(),
            ));
        }

        if let Some((key, _)) = ext.params.iter().find(|(key, _)| {
            !key.eq_ignore_ascii_case(SERVER_NO_CONTEXT_TAKEOVER)
                && !key.eq_ignore_ascii_case(CLIENT_NO_CONTEXT_TAKEOVER)
        }) {
            return Err(WebSocketError::InvalidExtension(format!(
                "unknown parameter {key}"
            )));
        }

        if !ext.has_param(SERVER_NO_CONTEXT_TAKEOVER) {
            return Err(WebSocketError::InvalidExtension(format!(
                "server did not send back {SERVER_NO_CONTEXT_TAKEOVER}"
            )));
        }

        if !ext.has_param(CLIENT_NO_CONTEXT_TAKEOVER) {
            #[cfg(feature = "logging")]
            log::info!("server did not send back {CLIENT_NO_CONTEXT_TAKEOVER}");
        }

        selected = Some(Extensions::deflate());
    }

    Ok(selected)
}

/// Selects the extensions to answer with on the server side.
///
/// The first permessage-deflate token wins whatever its parameters; other tokens and
/// malformed entries are ignored.
pub fn select_from_client_offer(header: &str) -> Option<Extensions> {
    header
        .split(',')
        .filter_map(|entry| all_consuming(delimited(space0, extension, space0)).parse(entry).ok())
        .any(|(_, ext)| ext.is_deflate())
        .then(Extensions::deflate)
}
