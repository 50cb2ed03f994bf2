use super::{
    stream::{StreamConnection, StreamInner},
    TransportSender, CONNECT_TIMEOUT,
};
use crate::message::SipMessage;
use crate::{Error, Result};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, SignatureScheme,
    },
    TlsConnector,
};
use tracing::info;

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;
type TlsInner =
    StreamInner<tokio::io::ReadHalf<TlsClientStream>, tokio::io::WriteHalf<TlsClientStream>>;

/// Accepts whatever certificate the registrar presents. Self-signed PBX
/// certificates are the norm in this deployment model; SNI is still sent so
/// multi-tenant servers can pick the right one.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Connect and handshake with `server_name` as SNI. The certificate is
    /// not verified (see [`AcceptAnyServerCert`]).
    pub async fn connect(server_name: &str, remote: SocketAddr) -> Result<Self> {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let sni = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Transport(format!("invalid SNI name: {}", server_name)))?;

        let tls_stream = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let stream = TcpStream::connect(remote).await?;
            connector.connect(sni, stream).await.map_err(crate::Error::from)
        })
        .await
        .map_err(|_| Error::Timeout(format!("TLS connect to {} timed out", remote)))??;

        let local_addr = tls_stream.get_ref().0.local_addr()?;
        let (read_half, write_half) = tokio::io::split(tls_stream);

        let connection = TlsConnection {
            inner: Arc::new(StreamInner::new(local_addr, remote, read_half, write_half)),
        };
        info!(
            "created TLS connection: {} -> {} (sni {})",
            local_addr, remote, server_name
        );
        Ok(connection)
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_loop(sender).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inner.local_addr, self.inner.remote_addr)
    }
}
