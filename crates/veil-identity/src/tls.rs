//! Mutual-TLS transport built from the in-memory SVID.
//!
//! Both sides read their TLS material through a [`BundleSource`] so that
//! rotation takes effect without restarts: the listener re-checks the
//! source on every accepted connection and rebuilds its acceptor when the
//! bundle has been swapped; clients are built per connection.
//!
//! After the handshake the listener extracts the peer SPIFFE ID from the
//! client certificate (URI SAN first, Subject DN as a legacy fallback) and
//! attaches it to the request as [`PeerIdentity`] connect-info. Peers
//! without a parseable SPIFFE ID are rejected. There is no plaintext
//! fallback.

use crate::agent::BundleSource;
use crate::bundle::SvidBundle;
use crate::spiffe::SpiffeId;
use crate::verifier::{SpiffeClientVerifier, SpiffeServerVerifier};
use crate::{Error, Result};
use axum::extract::connect_info::Connected;
use rustls::{ClientConfig, ServerConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Builds a rustls server config that presents the bundle's leaf and
/// requires SPIFFE client certificates from the same trust domain.
pub fn build_server_config(bundle: &SvidBundle, trust_domain: &str) -> Result<ServerConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let verifier = SpiffeClientVerifier::new(trust_domain, &bundle.trust_bundle())?;
    let (cert_chain, private_key) = bundle.to_rustls_parts()?;

    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| Error::Certificate(format!("failed to build server config: {e}")))
}

/// Builds a rustls client config that presents the bundle's leaf and
/// verifies the server against the bundle's CA chain plus its SPIFFE ID.
pub fn build_client_config(bundle: &SvidBundle, trust_domain: &str) -> Result<ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let verifier = SpiffeServerVerifier::new(trust_domain, &bundle.trust_bundle())?;
    let (cert_chain, private_key) = bundle.to_rustls_parts()?;

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|e| Error::Certificate(format!("failed to build client config: {e}")))
}

/// An HTTPS client presenting the source's current SVID.
///
/// Build one per logical connection: each call re-reads the source, so a
/// rotated bundle is picked up without restarting the workload.
pub async fn mtls_client(
    source: &dyn BundleSource,
    trust_domain: &str,
) -> Result<reqwest::Client> {
    let bundle = source.current_bundle().await?;
    mtls_client_from_bundle(&bundle, trust_domain)
}

/// An HTTPS client presenting a specific bundle.
pub fn mtls_client_from_bundle(
    bundle: &SvidBundle,
    trust_domain: &str,
) -> Result<reqwest::Client> {
    let config = build_client_config(bundle, trust_domain)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()
        .map_err(|e| Error::Internal(format!("cannot build mTLS client: {e}")))
}

/// The authenticated peer of an mTLS connection.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// SPIFFE ID from the peer's client certificate.
    pub spiffe_id: SpiffeId,
    /// Peer socket address.
    pub peer_addr: SocketAddr,
}

/// Extracts a SPIFFE ID from a DER certificate: URI SAN first, then the
/// Subject DN for legacy certificates that predate URI SANs.
pub fn extract_peer_spiffe_id(cert_der: &[u8]) -> Option<SpiffeId> {
    let cert = crate::bundle::Certificate::from_der(cert_der.to_vec());

    if let Ok(id) = cert.extract_spiffe_id() {
        return Some(id);
    }

    // Legacy path: some older issuers embedded the URI in the subject.
    let subject = cert.subject().ok()?;
    let start = subject.find("spiffe://")?;
    let rest = &subject[start..];
    let end = rest
        .find(|c: char| c == ',' || c == ' ' || c == ';')
        .unwrap_or(rest.len());
    SpiffeId::parse(&rest[..end]).ok()
}

/// TLS listener for axum that authenticates peers by SPIFFE ID.
pub struct MtlsListener {
    tcp_listener: TcpListener,
    source: Arc<dyn BundleSource>,
    trust_domain: String,
    /// Acceptor for the bundle it was built from; rebuilt after rotation.
    cached: Option<(Arc<SvidBundle>, TlsAcceptor)>,
}

impl MtlsListener {
    /// Binds a listener on `addr` serving the source's identity.
    pub async fn bind(
        addr: SocketAddr,
        source: Arc<dyn BundleSource>,
        trust_domain: impl Into<String>,
    ) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr).await?;
        Ok(Self {
            tcp_listener,
            source,
            trust_domain: trust_domain.into(),
            cached: None,
        })
    }

    /// Wraps an already-bound TCP listener.
    pub fn from_tcp(
        tcp_listener: TcpListener,
        source: Arc<dyn BundleSource>,
        trust_domain: impl Into<String>,
    ) -> Self {
        Self {
            tcp_listener,
            source,
            trust_domain: trust_domain.into(),
            cached: None,
        }
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    /// Returns an acceptor for the source's current bundle, rebuilding
    /// only when rotation swapped the bundle since the last connection.
    async fn acceptor(&mut self) -> Result<TlsAcceptor> {
        let bundle = self.source.current_bundle().await?;

        if let Some((cached_bundle, acceptor)) = &self.cached {
            if Arc::ptr_eq(cached_bundle, &bundle) {
                return Ok(acceptor.clone());
            }
        }

        debug!(spiffe_id = %bundle.spiffe_id(), "rebuilding TLS acceptor for rotated bundle");
        let config = build_server_config(&bundle, &self.trust_domain)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        self.cached = Some((bundle, acceptor.clone()));
        Ok(acceptor)
    }
}

/// A TLS stream carrying the authenticated peer identity.
pub struct MtlsStream {
    inner: TlsStream<TcpStream>,
    peer: PeerIdentity,
}

impl MtlsStream {
    /// Returns the authenticated peer.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }
}

impl tokio::io::AsyncRead for MtlsStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for MtlsStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl axum::serve::Listener for MtlsListener {
    type Io = MtlsStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.tcp_listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("TCP accept error: {e}");
                    continue;
                }
            };

            let acceptor = match self.acceptor().await {
                Ok(a) => a,
                Err(e) => {
                    // No valid identity: fail closed, drop the connection.
                    error!("no serving identity for mTLS accept: {e}");
                    continue;
                }
            };

            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer_addr = %addr, "TLS handshake failed: {e}");
                    continue;
                }
            };

            let Some(spiffe_id) = peer_id_from_stream(&tls_stream) else {
                warn!(peer_addr = %addr, "peer certificate has no parseable SPIFFE ID, rejecting");
                continue;
            };

            info!(peer_addr = %addr, peer = %spiffe_id, "mTLS connection established");
            let peer = PeerIdentity {
                spiffe_id,
                peer_addr: addr,
            };
            return (
                MtlsStream {
                    inner: tls_stream,
                    peer,
                },
                addr,
            );
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp_listener.local_addr()
    }
}

fn peer_id_from_stream(tls_stream: &TlsStream<TcpStream>) -> Option<SpiffeId> {
    let (_, server_conn) = tls_stream.get_ref();
    let certs = server_conn.peer_certificates()?;
    let leaf = certs.first()?;
    extract_peer_spiffe_id(leaf.as_ref())
}

impl<'a> Connected<axum::serve::IncomingStream<'a, MtlsListener>> for PeerIdentity {
    fn connect_info(target: axum::serve::IncomingStream<'a, MtlsListener>) -> Self {
        target.io().peer().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FixedBundle;
    use crate::bundle::PrivateKey;
    use crate::ca::{generate_rsa_key, CertificateAuthority};
    use crate::keystore::MemoryKeyStore;
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    fn test_ca(trust_domain: &str) -> CertificateAuthority {
        let store = MemoryKeyStore::new();
        CertificateAuthority::init(trust_domain, Duration::from_secs(3600), &store).unwrap()
    }

    fn issue_bundle(ca: &CertificateAuthority, name: &str) -> Arc<SvidBundle> {
        let (subject_key, key_pem) = generate_rsa_key().unwrap();
        let leaf = ca.issue(name, &subject_key).unwrap();
        Arc::new(
            SvidBundle::new(
                vec![leaf],
                PrivateKey::from_pem(&key_pem).unwrap(),
                vec![ca.ca_certificate().clone()],
                chrono::Utc::now(),
                ca.leaf_ttl(),
            )
            .unwrap(),
        )
    }

    async fn whoami(ConnectInfo(peer): ConnectInfo<PeerIdentity>) -> String {
        peer.spiffe_id.to_uri()
    }

    async fn spawn_mtls_server(ca: &CertificateAuthority, name: &str) -> SocketAddr {
        let bundle = issue_bundle(ca, name);
        let listener = MtlsListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(FixedBundle(bundle)),
            ca.trust_domain().to_string(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new().route("/whoami", get(whoami));
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<PeerIdentity>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    #[test]
    fn test_build_configs_from_bundle() {
        let ca = test_ca("example.org");
        let bundle = issue_bundle(&ca, "photo-service");
        assert!(build_server_config(&bundle, "example.org").is_ok());
        assert!(build_client_config(&bundle, "example.org").is_ok());
    }

    #[test]
    fn test_extract_peer_spiffe_id_from_san() {
        let ca = test_ca("example.org");
        let bundle = issue_bundle(&ca, "photo-service");
        let id = extract_peer_spiffe_id(bundle.leaf().der()).unwrap();
        assert_eq!(id.to_uri(), "spiffe://example.org/photo-service");
    }

    #[test]
    fn test_extract_peer_spiffe_id_garbage() {
        assert!(extract_peer_spiffe_id(&[1, 2, 3]).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mtls_round_trip_extracts_peer() {
        let ca = test_ca("example.org");
        let addr = spawn_mtls_server(&ca, "print-service").await;

        let client_bundle = issue_bundle(&ca, "photo-service");
        let client = mtls_client_from_bundle(&client_bundle, "example.org").unwrap();

        let body = client
            .get(format!("https://{addr}/whoami"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        // The server saw exactly the SPIFFE ID from the client's URI SAN.
        assert_eq!(body, "spiffe://example.org/photo-service");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mtls_rejects_untrusted_client() {
        let ca = test_ca("example.org");
        let rogue_ca = test_ca("example.org");
        let addr = spawn_mtls_server(&ca, "print-service").await;

        let rogue_bundle = issue_bundle(&rogue_ca, "attacker");
        let client = mtls_client_from_bundle(&rogue_bundle, "example.org").unwrap();

        let result = client.get(format!("https://{addr}/whoami")).send().await;
        assert!(result.is_err(), "untrusted client must not complete a handshake");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mtls_client_rejects_foreign_server() {
        let server_ca = test_ca("example.org");
        let client_ca = test_ca("example.org");
        let addr = spawn_mtls_server(&server_ca, "print-service").await;

        // Client trusts a different CA, so the server chain must fail.
        let client_bundle = issue_bundle(&client_ca, "photo-service");
        let client = mtls_client_from_bundle(&client_bundle, "example.org").unwrap();

        let result = client.get(format!("https://{addr}/whoami")).send().await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_plaintext_client_rejected() {
        let ca = test_ca("example.org");
        let addr = spawn_mtls_server(&ca, "print-service").await;

        // A plain HTTP request never completes against the TLS listener.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let result = client.get(format!("http://{addr}/whoami")).send().await;
        assert!(result.is_err());
    }
}
