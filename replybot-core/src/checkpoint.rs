use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::dedup::ReplyWindow;
use crate::error::CoreError;
use crate::rotation::Account;
use crate::types::ReplyRecord;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Progress for a single monitored target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCheckpoint {
    pub target: String,
    /// Creation time of the newest item fully resolved, in unix seconds.
    pub last_processed: i64,
    pub replied: ReplyWindow,
}

impl TargetCheckpoint {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            last_processed: 0,
            replied: ReplyWindow::default(),
        }
    }
}

/// Everything persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub version: u32,
    pub targets: BTreeMap<String, TargetCheckpoint>,
    pub accounts: Vec<Account>,
}

impl Default for RunCheckpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            targets: BTreeMap::new(),
            accounts: Vec::new(),
        }
    }
}

impl RunCheckpoint {
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One atomic unit of persisted progress.
#[derive(Debug, Clone)]
pub struct Commit {
    pub checkpoint: TargetCheckpoint,
    pub record: Option<ReplyRecord>,
    pub account: Option<Account>,
}

impl Commit {
    pub fn checkpoint(checkpoint: TargetCheckpoint) -> Self {
        Self {
            checkpoint,
            record: None,
            account: None,
        }
    }

    pub fn with_record(mut self, record: ReplyRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_account(mut self, account: Option<Account>) -> Self {
        self.account = account;
        self
    }
}

/// Durable home of the run checkpoint.
///
/// `commit` must apply the checkpoint, record and account together or not
/// at all. The stored `last_processed` never moves backwards, and an account
/// row is only replaced by one with an equal or higher revision.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, target: &str) -> Result<Option<TargetCheckpoint>, CoreError>;

    async fn load_accounts(&self) -> Result<Vec<Account>, CoreError>;

    async fn commit(&self, commit: &Commit) -> Result<(), CoreError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<RunCheckpoint>,
    records: Mutex<Vec<ReplyRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint(checkpoint: RunCheckpoint) -> Self {
        Self {
            state: Mutex::new(checkpoint),
            records: Mutex::new(Vec::new()),
        }
    }

    pub async fn snapshot(&self) -> RunCheckpoint {
        self.state.lock().await.clone()
    }

    pub async fn records(&self) -> Vec<ReplyRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, target: &str) -> Result<Option<TargetCheckpoint>, CoreError> {
        Ok(self.state.lock().await.targets.get(target).cloned())
    }

    async fn load_accounts(&self) -> Result<Vec<Account>, CoreError> {
        Ok(self.state.lock().await.accounts.clone())
    }

    async fn commit(&self, commit: &Commit) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let mut records = self.records.lock().await;

        let incoming = &commit.checkpoint;
        let entry = state
            .targets
            .entry(incoming.target.clone())
            .or_insert_with(|| TargetCheckpoint::new(incoming.target.clone()));
        entry.last_processed = entry.last_processed.max(incoming.last_processed);
        entry.replied = incoming.replied.clone();

        if let Some(record) = &commit.record {
            records.push(record.clone());
        }

        if let Some(account) = &commit.account {
            match state.accounts.iter_mut().find(|a| a.id == account.id) {
                Some(existing) if existing.revision > account.revision => {}
                Some(existing) => *existing = account.clone(),
                None => state.accounts.push(account.clone()),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupStore;
    use crate::types::CandidateItem;

    fn item(id: &str, created: i64) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            author: "someone".to_string(),
            body: "body".to_string(),
            parent_context: None,
            community: None,
            created_utc: created,
        }
    }

    #[tokio::test]
    async fn test_memory_store_cursor_is_monotonic() {
        let store = MemoryCheckpointStore::new();
        let mut cp = TargetCheckpoint::new("user:x");
        cp.last_processed = 200;
        store.commit(&Commit::checkpoint(cp.clone())).await.unwrap();

        cp.last_processed = 150;
        store.commit(&Commit::checkpoint(cp)).await.unwrap();

        let loaded = store.load("user:x").await.unwrap().unwrap();
        assert_eq!(loaded.last_processed, 200);
    }

    #[tokio::test]
    async fn test_memory_store_account_revisions() {
        let store = MemoryCheckpointStore::new();
        let mut account = Account::new("bot1");
        account.revision = 5;
        account.last_used = Some(50);
        let cp = TargetCheckpoint::new("user:x");
        store
            .commit(&Commit::checkpoint(cp.clone()).with_account(Some(account.clone())))
            .await
            .unwrap();

        let mut stale = account.clone();
        stale.revision = 3;
        stale.last_used = Some(10);
        store
            .commit(&Commit::checkpoint(cp).with_account(Some(stale)))
            .await
            .unwrap();

        let accounts = store.load_accounts().await.unwrap();
        assert_eq!(accounts, vec![account]);
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let mut dedup = DedupStore::new();
        dedup.begin(&item("t1_a", 100), "bot1", 120);
        let mut checkpoint = RunCheckpoint::default();
        checkpoint.targets.insert(
            "user:x".to_string(),
            TargetCheckpoint {
                target: "user:x".to_string(),
                last_processed: 100,
                replied: dedup.snapshot(),
            },
        );
        checkpoint.accounts.push(Account::new("bot1"));

        let json = checkpoint.to_json().unwrap();
        assert_eq!(RunCheckpoint::from_json(&json).unwrap(), checkpoint);
    }
}
