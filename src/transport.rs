//! HTTP probe boundary.
//!
//! Everything the engine knows about HTTP goes through [`HttpTransport`]:
//! a "send one request, get status, headers and body back" capability that
//! never follows redirects on its own. The production implementation wraps
//! a `reqwest` blocking client; tests substitute their own.
//!
//! All connection, timeout and TLS failures are normalized into
//! [`TransportError`] here so the step machine can treat them uniformly as
//! "this step failed, try the next one".

use std::error::Error as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::AutodiscoverError;

/// Bounded timeout for every probe request.
pub const TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("ews-autodiscover/", env!("CARGO_PKG_VERSION"));

/// Authentication method negotiated with an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Basic,
    Ntlm,
    Digest,
    Negotiate,
    NoAuth,
}

/// Transport failures, normalized at the probe boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// TLS errors are persistent by nature and never retried.
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Endpoint asked for login and rejected our credentials")]
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

/// A single probe request. Redirects are never followed by the transport;
/// the engine validates and follows them itself.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: Method,
    pub url: &'a str,
    pub body: Option<&'a [u8]>,
    pub credentials: Option<&'a Credentials>,
}

/// A probe response with lowercased header names.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The `Location` header, when this response is an HTTP redirect.
    pub fn redirect_location(&self) -> Option<&str> {
        if matches!(self.status, 301 | 302) {
            self.header("location")
        } else {
            None
        }
    }
}

pub trait HttpTransport: Send + Sync {
    /// Send one request with a bounded timeout, without following
    /// redirects. Connection reuse across calls is up to the
    /// implementation.
    fn send(&self, request: Request<'_>) -> Result<Response, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn send(&self, request: Request<'_>) -> Result<Response, TransportError> {
        (**self).send(request)
    }
}

/// Production transport backed by a `reqwest` blocking client with pooled
/// connections and redirect-following disabled.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Build the probe client. The timeout and no-redirect settings are
    /// load-bearing, so a builder failure is propagated instead of
    /// falling back to a default client that has neither.
    pub fn new() -> Result<Self, AutodiscoverError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AutodiscoverError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: Request<'_>) -> Result<Response, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url),
            Method::Head => self.client.head(request.url),
            Method::Post => self.client.post(request.url),
        };
        builder = builder.header("Content-Type", "text/xml; charset=utf-8");
        if let Some(body) = request.body {
            builder = builder.body(body.to_vec());
        }
        if let Some(credentials) = request.credentials {
            // Credentialed probes only speak HTTP Basic; connection-bound
            // schemes like NTLM belong to the caller's EWS session.
            builder = builder.basic_auth(credentials.username(), Some(credentials.password()));
        }

        let response = builder.send().map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.bytes().map_err(classify)?.to_vec();
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Normalize a `reqwest` error into our transport taxonomy. TLS failures
/// are identified by walking the source chain for a `rustls` error.
fn classify(err: reqwest::Error) -> TransportError {
    if is_tls_error(&err) {
        TransportError::Tls(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

fn is_tls_error(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if inner.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Guess the auth method an endpoint expects by tasting the response to an
/// unauthenticated request. A 200 means no auth is needed; a 401 carries
/// `WWW-Authenticate` challenges. The most secure offered method wins.
pub fn auth_type_from_response(response: &Response) -> AuthType {
    if response.status != 401 {
        return AuthType::NoAuth;
    }
    let mut offered = Vec::new();
    for value in response.headers_named("www-authenticate") {
        for challenge in value.split(',') {
            if let Some(scheme) = challenge.split_whitespace().next() {
                offered.push(scheme.to_ascii_lowercase());
            }
        }
    }
    for (scheme, auth_type) in [
        ("negotiate", AuthType::Negotiate),
        ("digest", AuthType::Digest),
        ("ntlm", AuthType::Ntlm),
        ("basic", AuthType::Basic),
    ] {
        if offered.iter().any(|o| o == scheme) {
            return auth_type;
        }
    }
    debug!("Got a 401, but no compatible auth type was reported by server");
    AuthType::NoAuth
}
