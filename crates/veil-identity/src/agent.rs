//! In-process identity agent.
//!
//! Every workload runs one agent. It attests to the Workload API on
//! startup, keeps the issued SVID bundle in memory only, and rotates it in
//! the background before expiry. Readers go through [`IdentityAgent::current`]
//! on every outbound handshake; bundle replacement is an atomic pointer
//! swap under a write lock, and network I/O never runs while that lock is
//! held.

use crate::attestation::AttestationProof;
use crate::bundle::SvidBundle;
use crate::workload_client::WorkloadApiClient;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Fraction of TTL remaining below which `current()` refreshes inline.
const CURRENT_REFRESH_FRACTION: f64 = 0.2;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This workload's name.
    pub service_name: String,
    /// Base URL of the Workload API.
    pub workload_api_url: String,
    /// Proof presented at attestation.
    pub attestation_proof: AttestationProof,
    /// Fraction of TTL after which the rotation task refreshes. Default 0.8.
    pub rotation_fraction: f64,
    /// Bootstrap attempts before `start()` gives up. Default 5.
    pub bootstrap_attempts: u32,
    /// First retry backoff. Doubles per attempt. Default 1 s.
    pub initial_backoff: Duration,
    /// Backoff ceiling. Default 30 s.
    pub max_backoff: Duration,
}

impl AgentConfig {
    /// Config with the standard rotation and retry parameters.
    pub fn new(
        service_name: impl Into<String>,
        workload_api_url: impl Into<String>,
        attestation_proof: AttestationProof,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            workload_api_url: workload_api_url.into(),
            attestation_proof,
            rotation_fraction: 0.8,
            bootstrap_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Holds and rotates the workload's current SVID.
pub struct IdentityAgent {
    inner: Arc<AgentInner>,
    rotation_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct AgentInner {
    config: AgentConfig,
    client: WorkloadApiClient,
    /// The current bundle. Readers clone the Arc; rotation swaps it.
    bundle: RwLock<Option<Arc<SvidBundle>>>,
    /// Serializes refreshes so concurrent `current()` calls do not stampede
    /// the Workload API. Never held across the bundle lock.
    refresh_gate: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl IdentityAgent {
    /// Creates an agent. No network traffic happens until [`start`](Self::start).
    pub fn new(config: AgentConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.rotation_fraction) {
            return Err(Error::Config(format!(
                "rotation fraction out of range: {}",
                config.rotation_fraction
            )));
        }
        let client = WorkloadApiClient::new(config.workload_api_url.clone())?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                client,
                bundle: RwLock::new(None),
                refresh_gate: Mutex::new(()),
                shutdown,
            }),
            rotation_task: std::sync::Mutex::new(None),
        })
    }

    /// Attests, fetches the first bundle and arms the rotation task.
    ///
    /// Retries with exponential backoff up to the configured attempt
    /// budget, then fails with [`Error::Bootstrap`] so the workload can
    /// decide to run degraded or exit.
    pub async fn start(&self) -> Result<()> {
        let mut backoff = self.inner.config.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.inner.config.bootstrap_attempts {
            match self.inner.fetch_bundle().await {
                Ok(bundle) => {
                    info!(
                        spiffe_id = %bundle.spiffe_id(),
                        expires_at = %bundle.expires_at(),
                        "identity agent bootstrapped"
                    );
                    self.inner.publish(bundle).await;
                    self.spawn_rotation_task();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        of = self.inner.config.bootstrap_attempts,
                        "bootstrap attempt failed: {e}"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < self.inner.config.bootstrap_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.inner.config.max_backoff);
            }
        }

        Err(Error::Bootstrap(last_error))
    }

    /// Returns the current bundle, refreshing inline when it is missing or
    /// inside the final 20% of its TTL. Never returns an expired bundle.
    pub async fn current(&self) -> Result<Arc<SvidBundle>> {
        // Fast path: healthy bundle under a read lock.
        {
            let guard = self.inner.bundle.read().await;
            if let Some(bundle) = guard.as_ref() {
                if !bundle.is_expired() && !bundle.in_final_fraction(CURRENT_REFRESH_FRACTION) {
                    return Ok(bundle.clone());
                }
            }
        }

        // Slow path: refresh, serialized behind the gate. Another caller
        // may have refreshed while we waited.
        let _gate = self.inner.refresh_gate.lock().await;
        {
            let guard = self.inner.bundle.read().await;
            if let Some(bundle) = guard.as_ref() {
                if !bundle.is_expired() && !bundle.in_final_fraction(CURRENT_REFRESH_FRACTION) {
                    return Ok(bundle.clone());
                }
            }
        }

        match self.inner.fetch_bundle().await {
            Ok(bundle) => {
                self.inner.publish(bundle.clone()).await;
                Ok(bundle)
            }
            Err(e) => {
                // Keep serving the old bundle while it remains valid.
                let guard = self.inner.bundle.read().await;
                match guard.as_ref() {
                    Some(bundle) if !bundle.is_expired() => {
                        warn!("refresh failed, serving current bundle until expiry: {e}");
                        Ok(bundle.clone())
                    }
                    _ => {
                        warn!("no valid identity available: {e}");
                        Err(Error::NoIdentity)
                    }
                }
            }
        }
    }

    /// Cancels the rotation task and drops the in-memory key material.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self
            .rotation_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
        {
            handle.abort();
        }
        let mut guard = self.inner.bundle.write().await;
        *guard = None;
        info!("identity agent stopped");
    }

    /// Returns this workload's name.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    fn spawn_rotation_task(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.rotation_loop().await });
        if let Ok(mut slot) = self.rotation_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }
}

impl AgentInner {
    /// One attest-and-fetch round trip.
    async fn fetch_bundle(&self) -> Result<Arc<SvidBundle>> {
        let bundle = self
            .client
            .attest_and_fetch(&self.config.service_name, &self.config.attestation_proof)
            .await?;
        Ok(Arc::new(bundle))
    }

    /// Atomically replaces the published bundle.
    async fn publish(&self, bundle: Arc<SvidBundle>) {
        let mut guard = self.bundle.write().await;
        *guard = Some(bundle);
    }

    /// Background rotation: sleep until `issued_at + fraction * ttl`, then
    /// refresh, backing off up to 30 s on failure while the old bundle
    /// remains in service until it expires.
    async fn rotation_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let deadline = {
                let guard = self.bundle.read().await;
                match guard.as_ref() {
                    Some(bundle) => bundle.rotation_deadline(self.config.rotation_fraction),
                    None => return,
                }
            };

            let wait = (deadline - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(?wait, "rotation sleeping until deadline");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let mut backoff = self.config.initial_backoff;
            loop {
                match self.fetch_bundle().await {
                    Ok(bundle) => {
                        info!(
                            spiffe_id = %bundle.spiffe_id(),
                            expires_at = %bundle.expires_at(),
                            "rotated certificate bundle"
                        );
                        self.publish(bundle).await;
                        break;
                    }
                    Err(e) => {
                        warn!("rotation fetch failed, retrying in {backoff:?}: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for IdentityAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityAgent")
            .field("service_name", &self.inner.config.service_name)
            .field("workload_api_url", &self.inner.config.workload_api_url)
            .finish()
    }
}

/// Anything that can surface a current, valid SVID bundle.
///
/// The mTLS transport reads through this seam on every connection, so
/// rotation takes effect without restarting listeners or clients. The
/// normal implementation is [`IdentityAgent`]; [`FixedBundle`] covers
/// processes that mint their own identity (the Workload API signs its own
/// serving certificate) and tests.
#[async_trait::async_trait]
pub trait BundleSource: Send + Sync {
    /// Returns the current bundle, never an expired one.
    async fn current_bundle(&self) -> Result<Arc<SvidBundle>>;
}

#[async_trait::async_trait]
impl BundleSource for IdentityAgent {
    async fn current_bundle(&self) -> Result<Arc<SvidBundle>> {
        self.current().await
    }
}

/// A bundle source that always serves the same bundle.
#[derive(Debug, Clone)]
pub struct FixedBundle(pub Arc<SvidBundle>);

#[async_trait::async_trait]
impl BundleSource for FixedBundle {
    async fn current_bundle(&self) -> Result<Arc<SvidBundle>> {
        if self.0.is_expired() {
            return Err(Error::NoIdentity);
        }
        Ok(self.0.clone())
    }
}
