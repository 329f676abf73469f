use replybot_core::{
    Account, AccountIndex, AccountRotator, BotConfig, CheckpointStore, CoreError, Selection,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Account rotator shared by every pipeline of the process.
///
/// All selection and confirmation goes through one lock, so two targets can
/// never pick the same account inside its spacing window.
#[derive(Debug, Clone)]
pub struct SharedAccountPool {
    inner: Arc<Mutex<AccountRotator>>,
}

impl SharedAccountPool {
    pub fn new(rotator: AccountRotator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rotator)),
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(AccountRotator::new(
            config.account_ids(),
            config.accounts.failure_threshold,
            Duration::from_secs(config.accounts.min_spacing_secs),
        ))
    }

    /// Merges persisted account state into the pool.
    pub async fn restore(&self, store: &dyn CheckpointStore) -> Result<(), CoreError> {
        let persisted = store.load_accounts().await?;
        if !persisted.is_empty() {
            info!("Restoring state for {} persisted accounts", persisted.len());
        }
        self.inner.lock().await.restore(persisted);
        Ok(())
    }

    pub async fn next_account(&self, now: i64) -> Selection {
        self.inner.lock().await.next_account(now)
    }

    pub async fn confirm_success(&self, index: AccountIndex) -> Option<Account> {
        self.inner.lock().await.confirm_success(index)
    }

    pub async fn confirm_failure(&self, index: AccountIndex) -> Option<Account> {
        self.inner.lock().await.confirm_failure(index)
    }

    pub async fn exclude(&self, index: AccountIndex) -> Option<Account> {
        self.inner.lock().await.exclude(index)
    }

    pub async fn release(&self, index: AccountIndex) -> Option<Account> {
        self.inner.lock().await.release(index)
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.inner.lock().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replybot_core::{Commit, MemoryCheckpointStore, TargetCheckpoint};

    fn pool(ids: &[&str]) -> SharedAccountPool {
        SharedAccountPool::new(AccountRotator::new(
            ids.iter().copied(),
            3,
            Duration::from_secs(0),
        ))
    }

    #[tokio::test]
    async fn test_clones_share_one_rotator() {
        let first = pool(&["a", "b"]);
        let second = first.clone();

        let Selection::Selected(lease) = first.next_account(1).await else {
            panic!("expected a selection");
        };
        assert_eq!(lease.id(), "a");

        let Selection::Selected(lease) = second.next_account(2).await else {
            panic!("expected a selection");
        };
        assert_eq!(lease.id(), "b");
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = MemoryCheckpointStore::new();
        let mut saved = Account::new("b");
        saved.last_used = Some(50);
        saved.revision = 3;
        store
            .commit(&Commit::checkpoint(TargetCheckpoint::new("user:x")).with_account(Some(saved)))
            .await
            .unwrap();

        let pool = pool(&["a", "b"]);
        pool.restore(&store).await.unwrap();

        let accounts = pool.snapshot().await;
        assert_eq!(accounts[1].last_used, Some(50));
        assert_eq!(accounts[0].last_used, None);
    }
}
