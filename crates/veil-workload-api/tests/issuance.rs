//! End-to-end issuance flow against a live service instance.

use std::sync::Arc;
use std::time::Duration;
use veil_identity::attestation::{AttestationProof, AttestationRegistry, AttestationScheme};
use veil_identity::ca::CertificateAuthority;
use veil_identity::keystore::{FilesystemKeyStore, MemoryKeyStore, SecureKeyStore};
use veil_identity::workload_client::WorkloadApiClient;
use veil_identity::Error;
use veil_workload_api::{router, AppState};

const PHOTO_TOKEN: &str = "dev-token-photo-service-12345";
const PRINT_TOKEN: &str = "dev-token-print-service-67890";

fn registry() -> Arc<AttestationRegistry> {
    Arc::new(AttestationRegistry::new(AttestationScheme::static_secret([
        ("photo-service", PHOTO_TOKEN),
        ("print-service", PRINT_TOKEN),
    ])))
}

async fn spawn_service(store: &dyn SecureKeyStore, leaf_ttl: Duration) -> String {
    let ca = CertificateAuthority::init("example.org", leaf_ttl, store).unwrap();
    let state = AppState::new(Arc::new(ca), registry());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_full_issuance_flow() {
    let store = MemoryKeyStore::new();
    let base = spawn_service(&store, Duration::from_secs(3600)).await;
    let client = WorkloadApiClient::new(&base).unwrap();

    client.health().await.unwrap();

    let bundle = client
        .attest_and_fetch("photo-service", &AttestationProof::static_secret(PHOTO_TOKEN))
        .await
        .unwrap();

    assert_eq!(
        bundle.spiffe_id().to_uri(),
        "spiffe://example.org/photo-service"
    );
    assert_eq!(bundle.ttl(), Duration::from_secs(3600));
    assert!(!bundle.is_expired());
    assert!(bundle.key_matches_certificate().unwrap());
    assert_eq!(bundle.ca_chain().len(), 1);
    assert!(bundle.ca_chain()[0].is_ca().unwrap());

    // The one-hour validity window is exact.
    let leaf = bundle.leaf();
    let lifetime = leaf.not_after().unwrap() - leaf.not_before().unwrap();
    assert_eq!(lifetime.num_seconds(), 3600);
}

#[tokio::test]
async fn test_attestation_failure_leaves_no_ticket() {
    let store = MemoryKeyStore::new();
    let base = spawn_service(&store, Duration::from_secs(3600)).await;
    let client = WorkloadApiClient::new(&base).unwrap();

    let err = client
        .attest("photo-service", &AttestationProof::static_secret("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AttestationDenied));

    // No ticket was recorded, so any guess at the certificates endpoint
    // is rejected too.
    let err = client
        .fetch_certificates("photo-service", &uuid_like_guess())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TicketInvalid));
}

#[tokio::test]
async fn test_ticket_is_single_use() {
    let store = MemoryKeyStore::new();
    let base = spawn_service(&store, Duration::from_secs(3600)).await;
    let client = WorkloadApiClient::new(&base).unwrap();

    let ticket = client
        .attest("photo-service", &AttestationProof::static_secret(PHOTO_TOKEN))
        .await
        .unwrap();

    client
        .fetch_certificates("photo-service", &ticket)
        .await
        .unwrap();

    let err = client
        .fetch_certificates("photo-service", &ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TicketInvalid));
}

#[tokio::test]
async fn test_ticket_bound_to_workload_name() {
    let store = MemoryKeyStore::new();
    let base = spawn_service(&store, Duration::from_secs(3600)).await;
    let client = WorkloadApiClient::new(&base).unwrap();

    let ticket = client
        .attest("photo-service", &AttestationProof::static_secret(PHOTO_TOKEN))
        .await
        .unwrap();

    let err = client
        .fetch_certificates("print-service", &ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TicketInvalid));
}

#[tokio::test]
async fn test_workload_private_key_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemKeyStore::new(dir.path()).unwrap();
    let base = spawn_service(&store, Duration::from_secs(3600)).await;
    let client = WorkloadApiClient::new(&base).unwrap();

    let bundle = client
        .attest_and_fetch("photo-service", &AttestationProof::static_secret(PHOTO_TOKEN))
        .await
        .unwrap();
    let workload_key = bundle.private_key().as_pem().to_string();

    // The key store directory holds CA material only; the workload key
    // must not appear in any file the service wrote.
    let mut saw_ca_key = false;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(
            !contents.contains(workload_key.trim()),
            "workload private key leaked into {path:?}"
        );
        if path.file_name().and_then(|n| n.to_str()) == Some("ca-private-key.pem") {
            saw_ca_key = true;
        }
    }
    assert!(saw_ca_key, "CA key should be persisted");
}

fn uuid_like_guess() -> String {
    "00000000-0000-4000-8000-000000000000".to_string()
}
