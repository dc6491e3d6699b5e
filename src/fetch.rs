//! The fetch gateway: URL in, HTTP response out, everything in between
//! riding RELAY cells.
//!
//! A request resolves its host to a managed circuit (per-host binding),
//! opens a stream through the exit, optionally wraps it in TLS (web PKI),
//! and runs the HTTP exchange. The stream is closed on every exit path;
//! a failed request clears the host's circuit binding so a retry gets a
//! fresh path while other hosts keep theirs.

use crate::circmgr::CircuitManager;
use crate::config::Ipv6Policy;
use crate::error::{Result, TorError};
use crate::http::{self, HttpResponse};
use crate::runtime::{with_deadline, CancelToken, SharedClock};
use crate::transport::tls::{TlsStream, TlsVerify};
use crate::transport::ByteStream;

/// One HTTP request through the tunnel.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overall deadline; `None` falls back to the client default.
    pub timeout_ms: Option<u64>,
    pub ipv6: Ipv6Policy,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
            timeout_ms: None,
            ipv6: Ipv6Policy::default(),
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: "POST".into(),
            headers: Vec::new(),
            body: Some(body),
            timeout_ms: None,
            ipv6: Ipv6Policy::default(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub type FetchResponse = HttpResponse;

/// Pieces of a parsed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub is_https: bool,
}

/// Parse an http/https URL into (host, port, path, https).
pub fn parse_url(url: &str) -> Result<ParsedUrl> {
    let url = url.trim();
    let (rest, is_https) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, false)
    } else {
        return Err(TorError::InvalidUrl(format!("unsupported scheme: {url}")));
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return Err(TorError::InvalidUrl(format!("no host in {url}")));
    }

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port_text)) => {
            let port = port_text
                .parse()
                .map_err(|_| TorError::InvalidUrl(format!("bad port: {port_text}")))?;
            (host.to_string(), port)
        }
        None => (host_port.to_string(), if is_https { 443 } else { 80 }),
    };

    Ok(ParsedUrl {
        host,
        port,
        path: path.to_string(),
        is_https,
    })
}

/// Run one fetch over the manager's circuits.
pub async fn run_fetch(
    manager: &CircuitManager,
    clock: &SharedClock,
    request: &FetchRequest,
    default_timeout_ms: u64,
    cancel: &CancelToken,
) -> Result<FetchResponse> {
    let target = parse_url(&request.url)?;
    let deadline =
        clock.now_ms() + request.timeout_ms.unwrap_or(default_timeout_ms);

    let outcome = with_deadline(
        clock,
        cancel,
        deadline,
        do_fetch(manager, request, &target, cancel),
    )
    .await;

    if outcome.is_err() {
        // Give the next retry a fresh path without disturbing other
        // hosts' bindings.
        manager.clear_circuit(&target.host);
    }
    outcome
}

/// How many bound circuits are rejected for a destination port before a
/// fetch gives up.
const MAX_EXIT_REPICKS: usize = 3;

/// Resolve `host` to a circuit whose exit will carry `port`.
///
/// Pool circuits are built against any `Exit`-flagged relay, so a bound
/// circuit's exit may still reject an unusual destination port; such a
/// circuit is cleared (leaving other hosts' bindings alone) and the host
/// re-bound to a warm spare or a fresh build.
pub(crate) async fn circuit_allowing_port(
    manager: &CircuitManager,
    host: &str,
    port: u16,
    cancel: &CancelToken,
) -> Result<crate::protocol::Circuit> {
    for _ in 0..MAX_EXIT_REPICKS {
        let circuit = manager.use_circuit(host, cancel).await?;
        match circuit.exit_port_policy() {
            Some(policy) if !policy.allows_port(port) => {
                log::info!(
                    "circuit {} exit rejects port {port}, re-picking",
                    circuit.id()
                );
                manager.clear_circuit(host);
            }
            _ => return Ok(circuit),
        }
    }
    Err(TorError::OpenFailed(format!(
        "no exit allowing port {port} after {MAX_EXIT_REPICKS} circuits"
    )))
}

async fn do_fetch(
    manager: &CircuitManager,
    request: &FetchRequest,
    target: &ParsedUrl,
    cancel: &CancelToken,
) -> Result<FetchResponse> {
    let circuit = circuit_allowing_port(manager, &target.host, target.port, cancel).await?;
    log::debug!(
        "fetch {} {} via circuit {}",
        request.method,
        request.url,
        circuit.id()
    );

    let mut stream = circuit
        .open_stream(&target.host, target.port, request.ipv6.begin_flags())
        .await?;

    let headers: Vec<(&str, &str)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    // The stream is closed on every path out of here.
    let response = if target.is_https {
        match TlsStream::connect(stream, &target.host, TlsVerify::WebPki).await {
            Ok(mut tls) => {
                let result = http::request(
                    &mut tls,
                    &request.method,
                    &target.host,
                    &target.path,
                    &headers,
                    request.body.as_deref(),
                )
                .await;
                let _ = tls.close().await;
                result
            }
            // A failed TLS setup drops the TorStream, which sends END.
            Err(e) => Err(e),
        }
    } else {
        let result = http::request(
            &mut stream,
            &request.method,
            &target.host,
            &target.path,
            &headers,
            request.body.as_deref(),
        )
        .await;
        let _ = stream.close().await;
        result
    };

    let response = response?;
    log::info!(
        "fetch {} -> {} ({} bytes)",
        request.url,
        response.status,
        response.body.len()
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_and_https() {
        let parsed = parse_url("https://example.com/a/b?c=1").unwrap();
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.path, "/a/b?c=1");
        assert!(parsed.is_https);

        let parsed = parse_url("http://example.com").unwrap();
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/");
        assert!(!parsed.is_https);
    }

    #[test]
    fn explicit_ports_win() {
        let parsed = parse_url("http://example.com:8080/x").unwrap();
        assert_eq!(parsed.port, 8080);
        let parsed = parse_url("https://example.com:8443").unwrap();
        assert_eq!(parsed.port, 8443);
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(parse_url("ftp://example.com").is_err());
        assert!(parse_url("example.com").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://host:notaport/").is_err());
    }

    #[test]
    fn request_builders() {
        let request = FetchRequest::get("https://example.com")
            .header("accept", "text/html");
        assert_eq!(request.method, "GET");
        assert_eq!(request.headers.len(), 1);
        assert!(request.body.is_none());

        let request = FetchRequest::post("https://example.com", b"payload".to_vec());
        assert_eq!(request.method, "POST");
        assert_eq!(request.body.as_deref(), Some(&b"payload"[..]));
    }
}
