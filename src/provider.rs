//! Secret providers.
//!
//! A [`SecretProvider`] supplies the key pool from an external source.
//! The rotator calls `refresh_keys` to atomically replace its pool,
//! metrics, and rotation strategy.

use crate::error::{Result, RotatorError};
use async_trait::async_trait;
use std::path::PathBuf;

/// External source of API keys.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Fetch the current key list.
    async fn get_keys(&self) -> Result<Vec<String>>;

    /// Re-fetch the key list. Providers backed by mutable stores may
    /// override this; the default simply fetches again.
    async fn refresh_keys(&self) -> Result<Vec<String>> {
        self.get_keys().await
    }
}

/// Reads comma-separated keys from an environment variable.
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    /// Provider reading from `var` (conventionally `API_KEYS`).
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_keys(&self) -> Result<Vec<String>> {
        let raw = std::env::var(&self.var)
            .map_err(|_| RotatorError::Provider(format!("environment variable {} not set", self.var)))?;
        Ok(parse_key_list(&raw))
    }
}

/// Reads comma-separated keys from a file.
pub struct FileSecretProvider {
    path: PathBuf,
}

impl FileSecretProvider {
    /// Provider reading from the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_keys(&self) -> Result<Vec<String>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RotatorError::Provider(format!("cannot read {}: {e}", self.path.display())))?;
        Ok(parse_key_list(&raw))
    }
}

/// Split a comma-separated key list, trimming whitespace and dropping
/// empty segments.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
