//! Persistent XMPP push-notification client.
//!
//! One `XmppConnection` owns one TLS socket and its stanza parser. The job
//! loop connects once per session and then parks in `await_notification`
//! until the server pushes something or the poll period runs out.

mod connection;
mod endpoint;
mod framing;
mod handshake;
mod stanza;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionState, XmppConnection, XmppSettings};
pub use endpoint::{parse_server_input, Endpoint, DEFAULT_HOST, DEFAULT_PORT};
pub use framing::{StanzaParser, MAX_PENDING_BYTES};
pub use stanza::{ns, Incoming, Stanza};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use crate::error::XmppError;

/// Default TCP connect timeout for the push server.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens the byte stream a connection runs over.
///
/// The production dialer is [`TlsDialer`]; tests plug in in-memory streams.
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn dial(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Stream, XmppError>> + Send;
}

impl<T: Dialer> Dialer for Arc<T> {
    type Stream = T::Stream;

    fn dial(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Stream, XmppError>> + Send {
        (**self).dial(endpoint)
    }
}

/// Initialize rustls crypto provider (must be called once before dialing).
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: only used with `--dangerous-insecure-tls` / `dangerous_insecure_tls = true`,
/// for development against servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Create a TLS connector using the system's native root certificates, or one
/// that skips verification entirely when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, XmppError> {
    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        warn!(error = %err, "Could not load some system root certificates");
    }
    if native_certs.certs.is_empty() {
        return Err(XmppError::Tls(
            "no system root certificates found; install the ca-certificates package".to_string(),
        ));
    }
    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    if added == 0 {
        return Err(XmppError::Tls(format!(
            "none of the {ignored} system root certificates could be parsed"
        )));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Upgrade a TCP stream to TLS using `tls_name` for SNI.
async fn upgrade_to_tls(
    connector: &TlsConnector,
    tcp_stream: TcpStream,
    tls_name: &str,
) -> Result<TlsStream<TcpStream>, XmppError> {
    let server_name = ServerName::try_from(tls_name.to_string())
        .map_err(|e| XmppError::Tls(format!("invalid server name '{tls_name}': {e}")))?;

    connector.connect(server_name, tcp_stream).await.map_err(|e| {
        let error_detail = e.to_string();
        let classification = if error_detail.contains("ertificate") {
            "certificate_error"
        } else if error_detail.contains("timed out") || error_detail.contains("timeout") {
            "timeout"
        } else if error_detail.contains("refused") || error_detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(tls_name, error = %e, error_class = classification, "TLS handshake failed");
        XmppError::Tls(format!(
            "handshake with {tls_name} failed ({classification}): {e}"
        ))
    })
}

/// Direct-TLS dialer used by the daemon.
///
/// The connector, and with it the system root store, is built once and shared
/// by every reconnect.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsDialer {
    pub fn new(connect_timeout: Duration, insecure: bool) -> Result<Self, XmppError> {
        init_crypto_provider();
        Ok(Self {
            connector: create_tls_connector(insecure)?,
            connect_timeout,
        })
    }
}

impl Dialer for TlsDialer {
    type Stream = TlsStream<TcpStream>;

    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Stream, XmppError> {
        let tcp_stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            error!(
                host = %endpoint.host, port = endpoint.port,
                timeout_secs = self.connect_timeout.as_secs(),
                "TCP connect timed out"
            );
            XmppError::Timeout {
                secs: self.connect_timeout.as_secs(),
                waiting_for: format!("TCP connect to {}:{}", endpoint.host, endpoint.port),
            }
        })?
        .map_err(|e| {
            error!(
                host = %endpoint.host, port = endpoint.port,
                error = %e, error_kind = ?e.kind(),
                "TCP connect failed"
            );
            XmppError::connection(format!(
                "failed to connect to {}:{}: {e}",
                endpoint.host, endpoint.port
            ))
        })?;

        let tls_stream = upgrade_to_tls(&self.connector, tcp_stream, endpoint.tls_name()).await?;
        info!(host = %endpoint.host, port = endpoint.port,
            tls_name = endpoint.tls_name(), "Connected (direct TLS)");
        Ok(tls_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::net::TcpListener;

    #[test]
    fn test_create_insecure_tls_connector() {
        init_crypto_provider();
        assert!(create_tls_connector(true).is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_share_one_tls_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TlsDialer::new(Duration::from_secs(5), true).unwrap();
        let clone = dialer.clone();
        assert!(Arc::ptr_eq(dialer.connector.config(), clone.connector.config()));

        let endpoint = Endpoint::new("127.0.0.1", port);
        for _ in 0..2 {
            assert!(clone.dial(&endpoint).await.is_err());
        }
        assert!(Arc::ptr_eq(dialer.connector.config(), clone.connector.config()));
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TlsDialer::new(Duration::from_secs(5), true).unwrap();
        let err = dialer
            .dial(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_dial_reports_tls_failure_when_peer_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let dialer = TlsDialer::new(Duration::from_secs(5), true).unwrap();
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            domain: Some("push.example.com".to_string()),
        };
        let err = dialer.dial(&endpoint).await.unwrap_err();
        assert!(matches!(err, XmppError::Tls(_)), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Connection);
        server.await.unwrap();
    }
}
