use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A posting identity and its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub last_used: Option<i64>,
    pub consecutive_failures: u32,
    /// Bumped on every mutation so stale writes can be detected.
    pub revision: u64,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_used: None,
            consecutive_failures: 0,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountIndex(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLease {
    pub index: AccountIndex,
    pub account: Account,
}

impl AccountLease {
    pub fn id(&self) -> &str {
        &self.account.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Selected(AccountLease),
    NoneAvailable {
        /// Every account is at or above the failure threshold.
        all_excluded: bool,
        /// Earliest moment a spaced-out account becomes usable again.
        retry_in: Option<Duration>,
    },
}

/// Arena of accounts with least-recently-used selection.
#[derive(Debug, Clone)]
pub struct AccountRotator {
    accounts: Vec<Account>,
    failure_threshold: u32,
    min_spacing: i64,
}

impl AccountRotator {
    pub fn new<I, S>(ids: I, failure_threshold: u32, min_spacing: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accounts: ids.into_iter().map(Account::new).collect(),
            failure_threshold: failure_threshold.max(1),
            min_spacing: min_spacing.as_secs() as i64,
        }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn get(&self, index: AccountIndex) -> Option<&Account> {
        self.accounts.get(index.0)
    }

    pub fn index_of(&self, id: &str) -> Option<AccountIndex> {
        self.accounts
            .iter()
            .position(|a| a.id == id)
            .map(AccountIndex)
    }

    pub fn is_excluded(&self, index: AccountIndex) -> bool {
        self.get(index)
            .map(|a| a.consecutive_failures >= self.failure_threshold)
            .unwrap_or(true)
    }

    /// Picks the least recently used account that is neither excluded nor
    /// still inside its spacing window.
    ///
    /// The chosen account is updated optimistically: `last_used` is set to
    /// `now` and the failure count is incremented until a confirm call.
    pub fn next_account(&mut self, now: i64) -> Selection {
        let threshold = self.failure_threshold;
        let spacing = self.min_spacing;

        let mut all_excluded = true;
        let mut retry_in: Option<i64> = None;
        let mut best: Option<usize> = None;

        for (idx, account) in self.accounts.iter().enumerate() {
            if account.consecutive_failures >= threshold {
                continue;
            }
            all_excluded = false;

            if let Some(last) = account.last_used {
                let wait = last + spacing - now;
                if wait > 0 {
                    retry_in = Some(retry_in.map_or(wait, |r| r.min(wait)));
                    continue;
                }
            }

            best = match best {
                None => Some(idx),
                Some(current) => {
                    let cur = &self.accounts[current];
                    // None sorts before Some, so never-used accounts win.
                    let key = (account.last_used, &account.id);
                    let cur_key = (cur.last_used, &cur.id);
                    if key < cur_key {
                        Some(idx)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        match best {
            Some(idx) => {
                let account = &mut self.accounts[idx];
                account.last_used = Some(now);
                account.consecutive_failures += 1;
                account.revision += 1;
                debug!(account = %account.id, "Selected account");
                Selection::Selected(AccountLease {
                    index: AccountIndex(idx),
                    account: account.clone(),
                })
            }
            None => Selection::NoneAvailable {
                all_excluded,
                retry_in: retry_in.map(|s| Duration::from_secs(s.max(0) as u64)),
            },
        }
    }

    pub fn confirm_success(&mut self, index: AccountIndex) -> Option<Account> {
        let account = self.accounts.get_mut(index.0)?;
        account.consecutive_failures = 0;
        account.revision += 1;
        Some(account.clone())
    }

    /// Keeps the optimistic increment made at selection time.
    pub fn confirm_failure(&mut self, index: AccountIndex) -> Option<Account> {
        let threshold = self.failure_threshold;
        let account = self.accounts.get_mut(index.0)?;
        account.revision += 1;
        if account.consecutive_failures >= threshold {
            warn!(
                account = %account.id,
                failures = account.consecutive_failures,
                "Account reached failure threshold and leaves rotation"
            );
        }
        Some(account.clone())
    }

    /// Takes an account out of rotation, e.g. after an authentication failure.
    pub fn exclude(&mut self, index: AccountIndex) -> Option<Account> {
        let threshold = self.failure_threshold;
        let account = self.accounts.get_mut(index.0)?;
        account.consecutive_failures = account.consecutive_failures.max(threshold);
        account.revision += 1;
        warn!(account = %account.id, "Account excluded from rotation");
        Some(account.clone())
    }

    /// Hands back a selection that was never used for a post.
    ///
    /// Undoes the optimistic failure increment but keeps `last_used`.
    pub fn release(&mut self, index: AccountIndex) -> Option<Account> {
        let account = self.accounts.get_mut(index.0)?;
        account.consecutive_failures = account.consecutive_failures.saturating_sub(1);
        account.revision += 1;
        Some(account.clone())
    }

    pub fn snapshot(&self) -> Vec<Account> {
        self.accounts.clone()
    }

    /// Loads persisted state for configured accounts. Unknown ids are ignored.
    ///
    /// An account that was excluded when the state was saved comes back
    /// with a single attempt left before it is excluded again.
    pub fn restore(&mut self, persisted: Vec<Account>) {
        let threshold = self.failure_threshold;
        for saved in persisted {
            match self.accounts.iter_mut().find(|a| a.id == saved.id) {
                Some(account) if saved.revision >= account.revision => {
                    *account = saved;
                    if account.consecutive_failures >= threshold {
                        account.consecutive_failures = threshold - 1;
                        account.revision += 1;
                        info!(account = %account.id, "Reinstating previously excluded account");
                    }
                }
                Some(_) => {}
                None => debug!(account = %saved.id, "Ignoring persisted state for unconfigured account"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator(ids: &[&str], spacing: u64) -> AccountRotator {
        AccountRotator::new(ids.iter().copied(), 3, Duration::from_secs(spacing))
    }

    fn pick(rotator: &mut AccountRotator, now: i64) -> AccountLease {
        match rotator.next_account(now) {
            Selection::Selected(lease) => lease,
            other => panic!("expected a selection, got {:?}", other),
        }
    }

    #[test]
    fn test_never_used_first_then_by_id() {
        let mut rot = rotator(&["charlie", "alpha", "bravo"], 0);
        assert_eq!(pick(&mut rot, 100).id(), "alpha");
        assert_eq!(pick(&mut rot, 101).id(), "bravo");
        assert_eq!(pick(&mut rot, 102).id(), "charlie");
        assert_eq!(pick(&mut rot, 103).id(), "alpha");
    }

    #[test]
    fn test_fair_rotation_over_many_rounds() {
        let mut rot = rotator(&["a", "b", "c"], 0);
        let mut counts = std::collections::HashMap::new();
        for now in 0..30 {
            let lease = pick(&mut rot, now);
            rot.confirm_success(lease.index);
            *counts.entry(lease.account.id).or_insert(0) += 1;
        }
        assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![10, 10, 10]);
    }

    #[test]
    fn test_spacing_blocks_and_reports_retry() {
        let mut rot = rotator(&["a"], 60);
        let lease = pick(&mut rot, 1_000);
        rot.confirm_success(lease.index);

        match rot.next_account(1_020) {
            Selection::NoneAvailable {
                all_excluded,
                retry_in,
            } => {
                assert!(!all_excluded);
                assert_eq!(retry_in, Some(Duration::from_secs(40)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pick(&mut rot, 1_060).id(), "a");
    }

    #[test]
    fn test_optimistic_failure_and_reset() {
        let mut rot = rotator(&["a"], 0);
        let lease = pick(&mut rot, 1);
        assert_eq!(lease.account.consecutive_failures, 1);
        let account = rot.confirm_success(lease.index).unwrap();
        assert_eq!(account.consecutive_failures, 0);
    }

    #[test]
    fn test_threshold_excludes_account() {
        let mut rot = rotator(&["a", "b"], 0);
        for now in 0..3 {
            let lease = pick(&mut rot, now * 2);
            assert_eq!(lease.id(), "a");
            rot.confirm_failure(lease.index);
            // keep b busier so a stays the oldest
            let b = pick(&mut rot, now * 2 + 1);
            rot.confirm_success(b.index);
        }
        assert!(rot.is_excluded(AccountIndex(0)));
        assert_eq!(pick(&mut rot, 100).id(), "b");
    }

    #[test]
    fn test_all_excluded() {
        let mut rot = rotator(&["a", "b"], 0);
        rot.exclude(AccountIndex(0));
        rot.exclude(AccountIndex(1));
        assert_eq!(
            rot.next_account(10),
            Selection::NoneAvailable {
                all_excluded: true,
                retry_in: None
            }
        );
    }

    #[test]
    fn test_release_undoes_increment() {
        let mut rot = rotator(&["a"], 0);
        let lease = pick(&mut rot, 5);
        let account = rot.release(lease.index).unwrap();
        assert_eq!(account.consecutive_failures, 0);
        assert_eq!(account.last_used, Some(5));
    }

    #[test]
    fn test_restore_keeps_newer_revision() {
        let mut rot = rotator(&["a", "b"], 0);
        let lease = pick(&mut rot, 5);
        rot.confirm_success(lease.index);

        let mut persisted = rot.snapshot();
        persisted[0].revision = 0;
        persisted[0].last_used = Some(1);
        persisted.push(Account::new("ghost"));

        rot.restore(persisted);
        assert_eq!(rot.accounts()[0].last_used, Some(5));
        assert_eq!(rot.accounts().len(), 2);
    }

    #[test]
    fn test_restore_reinstates_excluded_account() {
        let mut rot = rotator(&["a"], 0);
        let mut saved = Account::new("a");
        saved.consecutive_failures = 5;
        saved.revision = 9;

        rot.restore(vec![saved]);
        assert_eq!(rot.accounts()[0].consecutive_failures, 2);
        assert!(!rot.is_excluded(AccountIndex(0)));

        let lease = pick(&mut rot, 1);
        rot.confirm_failure(lease.index);
        assert!(rot.is_excluded(AccountIndex(0)));
    }
}
