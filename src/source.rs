//! Secret sources supplying raw certificate payloads

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Suffix appended to the configured domain to form the secret id
pub const SECRET_ID_SUFFIX: &str = "certificate";

/// Build the secret id for a domain (`<domain>/certificate`)
pub fn secret_id_for_domain(domain: &str) -> String {
    format!("{}/{}", domain.trim_end_matches('/'), SECRET_ID_SUFFIX)
}

/// Supplies the raw JSON certificate payload on demand
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the current payload
    async fn fetch(&self) -> Result<String>;

    /// Human readable location, used in logs
    fn describe(&self) -> String;
}

/// Fetches the secret over HTTP from `<endpoint>/<secret id>`
pub struct HttpSecretSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpSecretSource {
    /// Create a source for `secret_id` under `endpoint`, bounded by `timeout`
    pub fn new(endpoint: &Url, secret_id: &str, timeout: Duration) -> Result<Self> {
        let mut base = endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base.join(secret_id)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build secret store client: {}", e)))?;

        Ok(HttpSecretSource { client, url })
    }

    /// Get the resolved secret URL
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SecretSource for HttpSecretSource {
    async fn fetch(&self) -> Result<String> {
        debug!("Fetching certificate secret from {}", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::secret_fetch(format!("Request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::secret_fetch(format!(
                "Secret store answered {} for {}",
                status, self.url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::secret_fetch(format!("Failed to read secret body: {}", e)))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Reads the secret from a file, e.g. a mounted secret volume
pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    /// Create a source reading `<dir>/<secret id>`
    pub fn new(dir: impl Into<PathBuf>, secret_id: &str) -> Self {
        FileSecretSource {
            path: dir.into().join(secret_id),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl SecretSource for FileSecretSource {
    async fn fetch(&self) -> Result<String> {
        debug!("Reading certificate secret from {}", self.path.display());

        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::secret_fetch(format!("Failed to read {}: {}", self.path.display(), e))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Holds the payload in memory; replaceable at runtime
#[derive(Default)]
pub struct MemorySecretSource {
    payload: RwLock<Option<String>>,
}

impl MemorySecretSource {
    /// Create a source that already holds `payload`
    pub fn new(payload: impl Into<String>) -> Self {
        MemorySecretSource {
            payload: RwLock::new(Some(payload.into())),
        }
    }

    /// Create a source with nothing to hand out yet
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the held payload
    pub fn set(&self, payload: impl Into<String>) {
        *self.payload.write() = Some(payload.into());
    }

    /// Drop the held payload; subsequent fetches fail
    pub fn clear(&self) {
        *self.payload.write() = None;
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    async fn fetch(&self) -> Result<String> {
        self.payload
            .read()
            .clone()
            .ok_or_else(|| Error::secret_fetch("No payload held in memory"))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
