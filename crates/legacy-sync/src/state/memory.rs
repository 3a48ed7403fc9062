//! Process-local state backend.
//!
//! Used for dry runs and tests. State does not survive the process, so a
//! run recorded here can only be resumed from the same process.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::backend::StateBackend;
use super::RunState;
use crate::error::Result;

/// In-memory state backend.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    runs: RwLock<HashMap<String, RunState>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn load_latest(&self, config_hash: &str) -> Result<Option<RunState>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|s| s.config_hash == config_hash)
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_latest_picks_newest_matching_run() {
        let backend = MemoryStateBackend::new();
        let mut older = RunState::new("a".into(), "hash".into(), ["offices"]);
        older.started_at -= chrono::Duration::hours(1);
        let newer = RunState::new("b".into(), "hash".into(), ["offices"]);
        let other = RunState::new("c".into(), "other".into(), ["offices"]);
        for s in [&older, &newer, &other] {
            backend.save(s).await.unwrap();
        }

        assert_eq!(backend.load_latest("hash").await.unwrap().unwrap().run_id, "b");
        assert_eq!(backend.load("a").await.unwrap().unwrap().run_id, "a");
        assert!(backend.load_latest("missing").await.unwrap().is_none());
    }
}
