//! HTTP authentication for the client handshake and proxy tunnels.
//!
//! [`AuthChallenge::parse`] reads a `WWW-Authenticate` / `Proxy-Authenticate` header and
//! [`AuthChallenge::response`] computes the matching `Authorization` /
//! `Proxy-Authorization` value for [Basic](https://datatracker.ietf.org/doc/html/rfc7617) and
//! [Digest](https://datatracker.ietf.org/doc/html/rfc2617) (MD5, MD5-sess, `qop=auth`).
use std::collections::HashMap;

use base64::prelude::*;
use md5::{Digest, Md5};
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, take_while1},
    character::complete::{char, space0, space1},
    combinator::{all_consuming, opt, value},
    multi::separated_list0,
    sequence::{delimited, preceded, separated_pair},
    IResult, Parser,
};

/// A username and password used to answer authentication challenges.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// The authentication scheme of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "Basic"),
            Self::Digest => write!(f, "Digest"),
        }
    }
}

/// A parsed authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    scheme: AuthScheme,
    params: HashMap<String, String>,
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~/:".contains(c)).parse(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        opt(escaped_transform(
            is_not("\\\""),
            '\\',
            alt((value("\\", char('\\')), value("\"", char('"')))),
        )),
        char('"'),
    )
    .map(Option::unwrap_or_default)
    .parse(input)
}

fn auth_param(input: &str) -> IResult<&str, (String, String)> {
    separated_pair(
        token,
        (space0, char('='), space0),
        alt((quoted, token.map(str::to_string))),
    )
    .map(|(key, value)| (key.to_ascii_lowercase(), value))
    .parse(input)
}

fn challenge(input: &str) -> IResult<&str, (&str, Vec<(String, String)>)> {
    (
        token,
        opt(preceded(
            space1,
            separated_list0((space0, char(','), space0), auth_param),
        )),
    )
        .map(|(scheme, params)| (scheme, params.unwrap_or_default()))
        .parse(input)
}

impl AuthChallenge {
    /// Parses a challenge header value such as `Basic realm="ws"` or
    /// `Digest realm="ws", nonce="abc", qop="auth"`.
    ///
    /// Returns `None` for unsupported schemes and malformed values.
    pub fn parse(header: &str) -> Option<Self> {
        let (_, (scheme, params)) = all_consuming(delimited(space0, challenge, space0))
            .parse(header)
            .ok()?;

        let scheme = if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else if scheme.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else {
            return None;
        };

        let params: HashMap<String, String> = params.into_iter().collect();
        if scheme == AuthScheme::Digest && !params.contains_key("nonce") {
            return None;
        }

        Some(Self { scheme, params })
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// A parameter of the challenge (names are lowercase).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Computes the credentials header value answering this challenge.
    ///
    /// `nonce_count` is the number of requests already answered with the same nonce, plus one.
    /// `method` and `uri` are those of the request being authorized.
    pub fn response(
        &self,
        credentials: &Credentials,
        nonce_count: u32,
        method: &str,
        uri: &str,
    ) -> String {
        match self.scheme {
            AuthScheme::Basic => basic(credentials),
            AuthScheme::Digest => self.digest(credentials, nonce_count, method, uri, &cnonce()),
        }
    }

    fn digest(
        &self,
        credentials: &Credentials,
        nonce_count: u32,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let realm = self.param("realm").unwrap_or_default();
        let nonce = self.param("nonce").unwrap_or_default();
        let algorithm = self.param("algorithm");
        let qop = self
            .param("qop")
            .filter(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .map(|_| "auth");
        let nc = format!("{nonce_count:08x}");

        let mut ha1 = md5_hex(&format!(
            "{}:{realm}:{}",
            credentials.username, credentials.password
        ));
        if algorithm.is_some_and(|a| a.eq_ignore_ascii_case("md5-sess")) {
            ha1 = md5_hex(&format!("{ha1}:{nonce}:{cnonce}"));
        }
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let response = match qop {
            Some(qop) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
            None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\"",
            credentials.username
        );
        if let Some(algorithm) = algorithm {
            header.push_str(&format!(", algorithm={algorithm}"));
        }
        if let Some(qop) = qop {
            header.push_str(&format!(", qop={qop}, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = self.param("opaque") {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

/// The `Basic` credentials header value.
pub fn basic(credentials: &Credentials) -> String {
    let token = BASE64_STANDARD.encode(format!(
        "{}:{}",
        credentials.username, credentials.password
    ));
    format!("Basic {token}")
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

fn cnonce() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
