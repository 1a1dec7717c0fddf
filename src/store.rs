//! Hot-reloadable store for the server certificate

use crate::certificate::CertificateMaterial;
use crate::error::Result;
use crate::source::SecretSource;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Owns the currently published server certificate and refreshes it from a
/// [`SecretSource`]
///
/// Readers (one per TLS handshake) take a cheap `Arc` clone under a shared
/// lock. The only writer is [`CertificateStore::load`], which swaps the whole
/// snapshot after a payload parsed successfully; a failed load leaves the
/// previous certificate in place.
pub struct CertificateStore {
    source: Arc<dyn SecretSource>,
    current: RwLock<Option<Arc<CertificateMaterial>>>,
    // Serializes loads so publication order matches completion order.
    refresh_guard: Mutex<()>,
}

impl CertificateStore {
    /// Create an empty store backed by `source`
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        CertificateStore {
            source,
            current: RwLock::new(None),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Fetch, parse and publish a certificate
    ///
    /// On error nothing is published and the previous certificate, if any,
    /// keeps serving.
    pub async fn load(&self) -> Result<Arc<CertificateMaterial>> {
        let _guard = self.refresh_guard.lock().await;

        debug!("Loading certificate from {}", self.source.describe());
        let raw = self.source.fetch().await?;
        let material = Arc::new(CertificateMaterial::from_payload(&raw)?);

        if material.is_expired() {
            warn!(
                "Loaded certificate {} (serial {}) expired at {}",
                material.subject(),
                material.serial_number(),
                material.not_after()
            );
        }

        *self.current.write() = Some(material.clone());

        info!(
            "Published certificate {} (serial {}), valid until {}",
            material.subject(),
            material.serial_number(),
            material.not_after()
        );

        Ok(material)
    }

    /// Get the currently published certificate, if one was ever loaded
    pub fn get(&self) -> Option<Arc<CertificateMaterial>> {
        self.current.read().clone()
    }

    /// Whether a certificate has been published
    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Load once immediately, then keep refreshing every `interval` until
    /// `shutdown` flips to `true` (or its sender is dropped)
    ///
    /// The initial load is awaited before returning; its failure is only
    /// logged. The returned handle completes when the loop has stopped.
    pub async fn start(
        self: Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        if let Err(e) = self.load().await {
            error!("Error when loading certificate: {}", e);
        }

        tokio::spawn(self.refresh_loop(interval, shutdown))
    }

    async fn refresh_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Refreshing certificate from {} every {:?}",
            self.source.describe(),
            interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.load().await {
                        error!("Error when loading certificate: {}", e);
                    }
                }
            }
        }

        info!("Stopping certificate refresh");
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("source", &self.source.describe())
            .field("current", &*self.current.read())
            .finish()
    }
}
