//! TLS layered over a [`ByteStream`], driven sans-io.
//!
//! rustls never touches a socket here: ciphertext moves between the
//! `ClientConnection` and the underlying duplex by hand, so the same code
//! runs over the WebSocket tunnel (guard link) and over a Tor stream
//! (HTTPS exit traffic).
//!
//! Two verification modes exist because the guard's TLS certificate is
//! deliberately not web-PKI valid: the link handshake authenticates the
//! peer through the CERTS cell chain instead, binding the chain to the TLS
//! leaf certificate by hash. Exit-stream TLS uses the Mozilla root store.

use super::ByteStream;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;

/// How the peer's TLS certificate is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerify {
    /// Mozilla roots; used for HTTPS exit streams.
    WebPki,
    /// Accept any certificate; the Tor link handshake verifies the peer
    /// through the CERTS chain bound to the TLS leaf by SHA-256.
    LinkCerts,
}

/// TLS client stream over any byte duplex.
pub struct TlsStream<S: ByteStream> {
    io: S,
    conn: ClientConnection,
    /// Ciphertext received but not yet accepted by rustls.
    tls_in: VecDeque<u8>,
    /// Decrypted bytes not yet handed to the caller.
    plaintext: VecDeque<u8>,
    peer_eof: bool,
}

impl<S: ByteStream> TlsStream<S> {
    /// Connect: build the client config, then run the handshake to
    /// completion over `io`.
    pub async fn connect(io: S, server_name: &str, verify: TlsVerify) -> Result<Self> {
        let config = match verify {
            TlsVerify::WebPki => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            TlsVerify::LinkCerts => {
                // Link security wants TLS 1.2 with the ECDHE AES-256-GCM
                // suites; the ring provider carries both the RSA and ECDSA
                // variants.
                ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(LinkCertPassthrough::new()))
                    .with_no_client_auth()
            }
        };

        let name: ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| TorError::InvalidUrl(format!("bad server name: {server_name}")))?;
        let conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| TorError::ConnectFailed(format!("tls init: {e}")))?;

        let mut stream = Self {
            io,
            conn,
            tls_in: VecDeque::new(),
            plaintext: VecDeque::new(),
            peer_eof: false,
        };
        stream.handshake().await?;
        Ok(stream)
    }

    async fn handshake(&mut self) -> Result<()> {
        while self.conn.is_handshaking() {
            self.flush_outbound().await?;
            if self.conn.is_handshaking() && self.conn.wants_read() {
                if self.peer_eof && self.tls_in.is_empty() {
                    return Err(TorError::Closed);
                }
                self.pull_inbound().await?;
            }
        }
        self.flush_outbound().await?;
        log::debug!("tls handshake complete");
        Ok(())
    }

    /// Decompose into the raw duplex, the TLS state machine, and any
    /// buffered bytes. The channel pump takes over from here and drives
    /// rustls itself.
    pub fn into_parts(self) -> TlsParts<S> {
        TlsParts {
            io: self.io,
            conn: self.conn,
            tls_in: self.tls_in,
            plaintext: self.plaintext,
            peer_eof: self.peer_eof,
        }
    }

    /// DER of the peer's leaf certificate, for CERTS-chain binding.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    /// Move pending ciphertext from rustls out to the wire.
    async fn flush_outbound(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn
                .write_tls(&mut out)
                .map_err(|e| TorError::ConnectFailed(format!("tls write: {e}")))?;
            if out.is_empty() {
                break;
            }
            self.io.write_all(&out).await?;
        }
        Ok(())
    }

    /// Read ciphertext from the wire and run it through rustls.
    async fn pull_inbound(&mut self) -> Result<()> {
        if self.tls_in.is_empty() && !self.peer_eof {
            let mut buf = [0u8; 16 * 1024];
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                self.peer_eof = true;
            } else {
                self.tls_in.extend(&buf[..n]);
            }
        }

        while !self.tls_in.is_empty() {
            let (front, _) = self.tls_in.as_slices();
            let mut front = front;
            let consumed = self
                .conn
                .read_tls(&mut front)
                .map_err(|e| TorError::ConnectFailed(format!("tls read: {e}")))?;
            if consumed == 0 {
                break;
            }
            self.tls_in.drain(..consumed);
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| TorError::InvalidCert(format!("tls: {e}")))?;
            if state.plaintext_bytes_to_read() > 0 {
                let mut chunk = vec![0u8; state.plaintext_bytes_to_read()];
                match self.conn.reader().read(&mut chunk) {
                    Ok(n) => self.plaintext.extend(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        return Err(TorError::ConnectFailed(format!("tls plaintext: {e}")))
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl<S: ByteStream> ByteStream for TlsStream<S> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.plaintext.is_empty() {
                let n = buf.len().min(self.plaintext.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = self.plaintext.pop_front().expect("len checked");
                }
                return Ok(n);
            }
            if self.peer_eof && self.tls_in.is_empty() {
                return Ok(0);
            }
            self.pull_inbound().await?;
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.conn
            .writer()
            .write_all(buf)
            .map_err(|e| TorError::ConnectFailed(format!("tls buffer: {e}")))?;
        self.flush_outbound().await
    }

    async fn close(&mut self) -> Result<()> {
        self.conn.send_close_notify();
        let _ = self.flush_outbound().await;
        self.io.close().await
    }
}

/// The dismembered pieces of a [`TlsStream`].
pub struct TlsParts<S: ByteStream> {
    pub io: S,
    pub conn: ClientConnection,
    pub tls_in: VecDeque<u8>,
    pub plaintext: VecDeque<u8>,
    pub peer_eof: bool,
}

/// Certificate "verifier" for the guard link: defers all authentication to
/// the CERTS cell chain.
#[derive(Debug)]
struct LinkCertPassthrough {
    schemes: Vec<rustls::SignatureScheme>,
}

impl LinkCertPassthrough {
    fn new() -> Self {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for LinkCertPassthrough {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
