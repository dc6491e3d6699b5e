//! Minimal HTTP/1.1 over a byte stream.
//!
//! Enough for the two consumers in this crate: directory fetches over
//! BEGIN_DIR streams and the fetch gateway's exit requests. Requests are
//! always `Connection: close`; responses are read to EOF unless a
//! Content-Length says better. Directory responses may arrive
//! zlib-deflated (`.z` endpoints).

use std::io::Read;

use crate::error::{Result, TorError};
use crate::transport::ByteStream;

/// A parsed HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body with any zlib content encoding removed.
    pub fn decoded_body(&self) -> Result<Vec<u8>> {
        let deflated = self
            .header("content-encoding")
            .map(|enc| enc.eq_ignore_ascii_case("deflate"))
            .unwrap_or(false)
            || self.body.starts_with(&[0x78]);
        if !deflated {
            return Ok(self.body.clone());
        }
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(&self.body[..])
            .read_to_end(&mut out)
            .map_err(|e| TorError::Directory(format!("inflate response: {e}")))?;
        Ok(out)
    }
}

/// Serialize and send a request, then read the whole response.
pub async fn request<S: ByteStream + ?Sized>(
    stream: &mut S,
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<HttpResponse> {
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("\r\n");

    stream.write_all(req.as_bytes()).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }

    read_response(stream).await
}

/// Read and parse one response off the stream.
pub async fn read_response<S: ByteStream + ?Sized>(stream: &mut S) -> Result<HttpResponse> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    // Head first: read until the blank line.
    let head_end = loop {
        if let Some(pos) = find_head_end(&raw) {
            break pos;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TorError::Directory("connection closed before response head".into()));
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| TorError::Directory("empty response head".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TorError::Directory(format!("bad status line: {status_line}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut body = raw[head_end + 4..].to_vec();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok());

    match content_length {
        Some(len) => {
            while body.len() < len {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(TorError::Directory(format!(
                        "body truncated: {} of {len} bytes",
                        body.len()
                    )));
                }
                body.extend_from_slice(&buf[..n]);
            }
            body.truncate(len);
        }
        None => loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        },
    }

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}
