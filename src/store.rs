//! Persistent store for per-domain request headers.
//!
//! Backs the optional "remember non-sensitive successful headers per
//! domain" feature. Orthogonal to rotation correctness: a store
//! failure only disables the convenience, never a request.

use crate::error::{Result, RotatorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Map of domain to the plain headers that last succeeded there.
pub type DomainHeaders = HashMap<String, HashMap<String, String>>;

/// Loads and saves the domain-header map.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the stored map. A missing store yields an empty map.
    async fn load(&self) -> Result<DomainHeaders>;

    /// Persist the map, replacing previous contents.
    async fn save(&self, headers: &DomainHeaders) -> Result<()>;
}

/// JSON-file backed store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at `path` (conventionally `rotator_config.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load(&self) -> Result<DomainHeaders> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DomainHeaders::new()),
            Err(e) => Err(RotatorError::Store {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    async fn save(&self, headers: &DomainHeaders) -> Result<()> {
        let content = serde_json::to_string_pretty(headers)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| RotatorError::Store {
                path: self.path.clone(),
                source: e,
            })
    }
}
