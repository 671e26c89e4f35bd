//! Transport: plain TCP or TLS with the `edgedb-binary` ALPN protocol.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// ALPN protocol name announced to the server.
pub const ALPN_PROTOCOL: &[u8] = b"edgedb-binary";

/// How the server certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsSecurity {
    /// Verify the certificate chain and the host name.
    #[default]
    Strict,
    /// Verify the chain but accept any host name.
    NoHostVerification,
    /// Accept any certificate.
    Insecure,
    /// Plain TCP, for local development servers and tests.
    Disabled,
}

/// A connection stream (TCP or TLS).
pub enum GelStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl GelStream {
    /// Open a TCP connection and, unless disabled, negotiate TLS.
    pub async fn connect(
        host: &str,
        port: u16,
        security: TlsSecurity,
        ca_pem: Option<&str>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(connect_error)?;
        tcp.set_nodelay(true).map_err(connect_error)?;

        if security == TlsSecurity::Disabled {
            return Ok(GelStream::Tcp(tcp));
        }

        let config = tls_config(security, ca_pem)?;
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            Error::new(
                ErrorKind::ClientConnectionFailedError,
                format!("invalid server name {:?}: {}", host, e),
            )
        })?;

        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(connect_error)?;

        if tls.get_ref().1.alpn_protocol() != Some(ALPN_PROTOCOL) {
            return Err(Error::new(
                ErrorKind::ClientConnectionFailedError,
                "The server doesn't support the edgedb-binary protocol.",
            ));
        }
        debug!(host, port, "TLS session established");
        Ok(GelStream::Tls(Box::new(tls)))
    }
}

/// Classify a failed connect; transient conditions are retried by the pool.
pub(crate) fn connect_error(e: io::Error) -> Error {
    let kind = match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotFound => ErrorKind::ClientConnectionFailedTemporarilyError,
        _ => ErrorKind::ClientConnectionFailedError,
    };
    Error::new(kind, e.to_string()).with_cause(e)
}

/// Build the rustls client configuration for `security`.
pub(crate) fn tls_config(security: TlsSecurity, ca_pem: Option<&str>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();
    let mut config = match security {
        TlsSecurity::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth(),
        TlsSecurity::NoHostVerification => {
            let inner = WebPkiServerVerifier::builder(Arc::new(root_store(ca_pem)?))
                .build()
                .map_err(|e| {
                    Error::new(
                        ErrorKind::ClientConnectionFailedError,
                        format!("cannot build certificate verifier: {}", e),
                    )
                })?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostName { inner }))
                .with_no_client_auth()
        }
        TlsSecurity::Strict | TlsSecurity::Disabled => builder
            .with_root_certificates(root_store(ca_pem)?)
            .with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// Trust roots: the given PEM bundle, or the platform store.
fn root_store(ca_pem: Option<&str>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(pem) => {
            let mut found = false;
            for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                let cert = cert.map_err(|e| {
                    Error::new(
                        ErrorKind::ClientConnectionFailedError,
                        format!("invalid TLS CA certificate: {}", e),
                    )
                })?;
                roots.add(cert).map_err(|e| {
                    Error::new(ErrorKind::ClientConnectionFailedError, e.to_string())
                        .with_cause(e)
                })?;
                found = true;
            }
            if !found {
                return Err(Error::new(
                    ErrorKind::ClientConnectionFailedError,
                    "no certificates found in the TLS CA PEM",
                ));
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "loaded platform trust roots");
        }
    }
    Ok(roots)
}

/// Chain-verifying wrapper that tolerates a host name mismatch.
#[derive(Debug)]
struct IgnoreHostName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(e)) if e == CertificateError::NotValidForName => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifier for `TlsSecurity::Insecure`.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

impl AsyncRead for GelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GelStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            GelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            GelStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            GelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GelStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            GelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GelStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            GelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
