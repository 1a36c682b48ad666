//! HTTP forwarder for stateless request-style backends.
//!
//! Operations are raw HTTP requests; the request line and headers are
//! re-issued against the connection's target base URL with a fresh client
//! connection per operation. The response is serialized back as status line,
//! headers, blank line, body.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Forwarder;
use crate::config::ForwarderConfig;
use crate::registry::TunnelEntry;
use crate::{Error, Result};

/// A parsed raw HTTP operation.
#[derive(Debug)]
struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Forwarder for HTTP backends.
pub struct HttpForwarder {
    client: reqwest::Client,
    io_timeout: Duration,
}

impl HttpForwarder {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &ForwarderConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.io_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            io_timeout: config.io_timeout,
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, tunnel: &TunnelEntry, payload: &[u8]) -> Result<Vec<u8>> {
        let parsed = parse_request(payload)?;
        let url = join_url(&tunnel.spec.target, &parsed.target);

        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|_| Error::UnparseableOperation(format!("method {}", parsed.method)))?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(self.io_timeout)
            .body(parsed.body);
        for (name, value) in &parsed.headers {
            // Hop-by-hop and addressing headers are the proxy's business
            if name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("authorization")
            {
                continue;
            }
            request = request.header(name, value);
        }

        debug!(tunnel = %tunnel.id, url = %url, "Forwarding HTTP operation");
        let response = request.send().await.map_err(map_reqwest_error)?;

        serialize_response(response).await
    }
}

/// Map a reqwest failure onto the backend error taxonomy.
fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::BackendTimeout(e.to_string())
    } else if e.is_connect() {
        Error::BackendUnavailable(e.to_string())
    } else {
        Error::BackendError(e.to_string())
    }
}

/// Parse the raw operation into method, target, headers, and body.
fn parse_request(raw: &[u8]) -> Result<ParsedRequest> {
    let head_end = find_head_end(raw);
    let (head, body) = match head_end {
        Some((end, sep_len)) => (&raw[..end], raw[end + sep_len..].to_vec()),
        None => (raw, Vec::new()),
    };

    let head = std::str::from_utf8(head)
        .map_err(|_| Error::UnparseableOperation("request head is not UTF-8".to_string()))?;
    let mut lines = head.lines();

    let request_line = lines
        .next()
        .ok_or_else(|| Error::UnparseableOperation("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(Error::UnparseableOperation(format!(
            "bad request line: {request_line}"
        )));
    };
    if !target.starts_with('/') {
        return Err(Error::UnparseableOperation(format!(
            "request target must be absolute-path: {target}"
        )));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ParsedRequest {
        method: method.to_ascii_uppercase(),
        target: target.to_string(),
        headers,
        body,
    })
}

/// Locate the head/body separator, tolerating both CRLF and LF framing.
fn find_head_end(raw: &[u8]) -> Option<(usize, usize)> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2)))
}

/// Join the spec's base URL with the operation's absolute path.
fn join_url(base: &str, target: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), target)
}

/// Serialize a backend response back into raw HTTP bytes.
async fn serialize_response(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");

    let body = response.bytes().await.map_err(map_reqwest_error)?;
    out.extend_from_slice(&body);
    Ok(out)
}
