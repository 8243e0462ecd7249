use crate::catalog::CatalogTable;
use crate::models::{History, RunRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is not valid json: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub running: bool,
    pub progress: usize,
    pub total: usize,
}

/// Everything other components may read back after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub job: JobProgress,
    #[serde(default)]
    pub catalog: Option<CatalogTable>,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub results_unseen: bool,
}

/// JSON-file backed state. Each mutation rewrites the whole document through
/// a temp file and a rename, so readers never see a half-written file.
pub struct Store {
    path: Option<PathBuf>,
    state: Mutex<PersistedState>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(PersistedState::default()),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(target = "altered.store", path = %path.display(), "no state file, starting empty");
                PersistedState::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> PersistedState {
        self.state.lock().await.clone()
    }

    pub async fn set_job_progress(&self, progress: JobProgress) -> Result<(), StoreError> {
        self.mutate(|state| state.job = progress).await
    }

    pub async fn finish_job(&self) -> Result<(), StoreError> {
        self.mutate(|state| state.job.running = false).await
    }

    /// Prepends a run record, evicting past the cap, and flags it unseen.
    pub async fn record_run(&self, record: RunRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.history.push(record);
            state.results_unseen = true;
        })
        .await
    }

    pub async fn mark_results_seen(&self) -> Result<(), StoreError> {
        self.mutate(|state| state.results_unseen = false).await
    }

    pub async fn clear_history(&self) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.history.clear();
            state.results_unseen = false;
        })
        .await
    }

    pub async fn save_catalog(&self, table: &CatalogTable) -> Result<(), StoreError> {
        let table = table.clone();
        self.mutate(move |state| state.catalog = Some(table)).await
    }

    async fn mutate<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        apply(&mut next);
        if let Some(path) = &self.path {
            write_atomically(path, &next).await?;
        }
        *guard = next;
        Ok(())
    }
}

async fn write_atomically(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(target = "altered.store", path = %path.display(), bytes = bytes.len(), "state flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HISTORY_CAP, Operation, OperationOutcome};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn run(recipient: &str) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            id: Uuid::new_v4(),
            recipient_id: recipient.to_string(),
            total: 1,
            operations_attempted: 1,
            successes: vec![OperationOutcome::Success {
                operation: Operation::new("ALT_CORE_B_AX_04_C", 1),
            }],
            failures: vec![],
            started_at: now,
            ended_at: now,
        }
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let store = Store::open(&path).await.expect("open");
        store.record_run(run("friend-1")).await.expect("record");
        let mut entries = BTreeMap::new();
        entries.insert("0123456789abcdef0123456789abcdef".to_string(), "ALT_X_B_C".to_string());
        let table = CatalogTable::new(entries, "en-us");
        store.save_catalog(&table).await.expect("catalog");
        drop(store);

        let reopened = Store::open(&path).await.expect("reopen");
        let state = reopened.snapshot().await;
        assert_eq!(state.history.len(), 1);
        assert!(state.results_unseen);
        assert_eq!(state.catalog, Some(table));
    }

    #[tokio::test]
    async fn history_is_capped_and_seen_flag_clears() {
        let store = Store::in_memory();
        for n in 0..HISTORY_CAP + 3 {
            store.record_run(run(&format!("friend-{n}"))).await.unwrap();
        }
        let state = store.snapshot().await;
        assert_eq!(state.history.len(), HISTORY_CAP);
        assert_eq!(
            state.history.records()[0].recipient_id,
            format!("friend-{}", HISTORY_CAP + 2)
        );

        store.mark_results_seen().await.unwrap();
        assert!(!store.snapshot().await.results_unseen);

        store.clear_history().await.unwrap();
        assert_eq!(store.snapshot().await.history.len(), 0);
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(matches!(Store::open(&path).await, Err(StoreError::Serde(_))));
    }
}
