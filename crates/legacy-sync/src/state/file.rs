//! File-based state storage.
//!
//! One JSON file holds the most recent run. Writes are atomic (temp file +
//! rename) and signed with HMAC-SHA256 keyed by the config hash, so a state
//! file edited by hand is rejected on load.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};

use super::backend::StateBackend;
use super::RunState;
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// JSON file state backend.
pub struct FileStateBackend {
    path: PathBuf,
}

impl FileStateBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and verify the state file. `None` if it does not exist.
    fn read(&self) -> Result<Option<RunState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if stored != &compute_hmac(&state)? {
                    return Err(MigrateError::State(
                        "State file integrity check failed: HMAC mismatch (possible tampering)"
                            .to_string(),
                    ));
                }
            }
            None => {
                tracing::warn!("State file has no HMAC signature, integrity cannot be verified");
            }
        }
        Ok(Some(state))
    }
}

/// HMAC-SHA256 over the state serialized without its signature, keyed by
/// the config hash.
fn compute_hmac(state: &RunState) -> Result<String> {
    let mut unsigned = state.clone();
    unsigned.hmac = None;
    let content = serde_json::to_string(&unsigned)?;

    let mut mac = HmacSha256::new_from_slice(state.config_hash.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init_schema(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let mut signed = state.clone();
        signed.hmac = Some(compute_hmac(state)?);
        let content = serde_json::to_string_pretty(&signed)?;

        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.read()?.filter(|s| s.run_id == run_id))
    }

    async fn load_latest(&self, config_hash: &str) -> Result<Option<RunState>> {
        Ok(self.read()?.filter(|s| s.config_hash == config_hash))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
