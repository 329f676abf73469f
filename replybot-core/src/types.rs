use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ConfigError;

/// One comment observed on the platform stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Platform fullname, e.g. `t1_abc123`.
    pub id: String,
    pub author: String,
    pub body: String,
    /// Title of the submission the comment belongs to.
    pub parent_context: Option<String>,
    pub community: Option<String>,
    pub created_utc: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    User,
    Subreddit,
}

impl FromStr for MonitorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(MonitorMode::User),
            "subreddit" => Ok(MonitorMode::Subreddit),
            other => Err(ConfigError::InvalidValue {
                field: "monitor.mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorMode::User => write!(f, "user"),
            MonitorMode::Subreddit => write!(f, "subreddit"),
        }
    }
}

/// A monitored user or subreddit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub mode: MonitorMode,
    pub name: String,
}

impl Target {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            mode: MonitorMode::User,
            name: name.into(),
        }
    }

    pub fn subreddit(name: impl Into<String>) -> Self {
        Self {
            mode: MonitorMode::Subreddit,
            name: name.into(),
        }
    }

    /// Stable key used for checkpoint rows, e.g. `subreddit:rust`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.mode, self.name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            MonitorMode::User => write!(f, "u/{}", self.name),
            MonitorMode::Subreddit => write!(f, "r/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "skipped" => Ok(Outcome::Skipped),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// Why the filter stage turned an item away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    KeywordMismatch,
    TooFresh,
    TooOld,
    AlreadyReplied,
    OwnAuthor,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::KeywordMismatch => "keyword_mismatch",
            SkipReason::TooFresh => "too_fresh",
            SkipReason::TooOld => "too_old",
            SkipReason::AlreadyReplied => "already_replied",
            SkipReason::OwnAuthor => "own_author",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence that an item was replied to, failed, or was skipped.
///
/// Records are append-only: once committed they are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub run_id: Uuid,
    pub target: String,
    pub item_id: String,
    pub item_created: i64,
    pub account: Option<String>,
    pub generated_text: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub reply_id: Option<String>,
}

impl ReplyRecord {
    fn base(run_id: Uuid, target: &str, item: &CandidateItem, outcome: Outcome, now: i64) -> Self {
        Self {
            run_id,
            target: target.to_string(),
            item_id: item.id.clone(),
            item_created: item.created_utc,
            account: None,
            generated_text: None,
            recorded_at: DateTime::from_timestamp(now, 0).unwrap_or_default(),
            outcome,
            reason: None,
            reply_id: None,
        }
    }

    /// `now` is the unix time the outcome was observed.
    pub fn skipped(
        run_id: Uuid,
        target: &str,
        item: &CandidateItem,
        reason: SkipReason,
        now: i64,
    ) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::base(run_id, target, item, Outcome::Skipped, now)
        }
    }

    pub fn failure(
        run_id: Uuid,
        target: &str,
        item: &CandidateItem,
        reason: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base(run_id, target, item, Outcome::Failure, now)
        }
    }

    pub fn success(
        run_id: Uuid,
        target: &str,
        item: &CandidateItem,
        account: &str,
        text: &str,
        reply_id: Option<String>,
        now: i64,
    ) -> Self {
        Self {
            account: Some(account.to_string()),
            generated_text: Some(text.to_string()),
            reply_id,
            ..Self::base(run_id, target, item, Outcome::Success, now)
        }
    }

    pub fn with_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.generated_text = Some(text.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key_and_display() {
        let target = Target::subreddit("rust");
        assert_eq!(target.key(), "subreddit:rust");
        assert_eq!(target.to_string(), "r/rust");

        let target = Target::user("spez");
        assert_eq!(target.key(), "user:spez");
        assert_eq!(target.to_string(), "u/spez");
    }

    #[test]
    fn test_monitor_mode_parse() {
        assert_eq!("User".parse::<MonitorMode>().unwrap(), MonitorMode::User);
        assert_eq!(
            "subreddit".parse::<MonitorMode>().unwrap(),
            MonitorMode::Subreddit
        );
        assert!("forum".parse::<MonitorMode>().is_err());
    }

    #[test]
    fn test_record_constructors() {
        let item = CandidateItem {
            id: "t1_a".to_string(),
            author: "someone".to_string(),
            body: "hello".to_string(),
            parent_context: None,
            community: Some("rust".to_string()),
            created_utc: 100,
        };
        let run_id = Uuid::new_v4();

        let skipped =
            ReplyRecord::skipped(run_id, "subreddit:rust", &item, SkipReason::TooOld, 1_700_000_000);
        assert_eq!(skipped.outcome, Outcome::Skipped);
        assert_eq!(skipped.recorded_at.timestamp(), 1_700_000_000);
        assert_eq!(skipped.reason.as_deref(), Some("too_old"));
        assert!(skipped.account.is_none());

        let success = ReplyRecord::success(run_id, "subreddit:rust", &item, "bot1", "hi", None, 200);
        assert_eq!(success.outcome, Outcome::Success);
        assert_eq!(success.account.as_deref(), Some("bot1"));
        assert_eq!(success.item_created, 100);
    }

    #[test]
    fn test_outcome_roundtrip_strings() {
        for outcome in [Outcome::Success, Outcome::Failure, Outcome::Skipped] {
            assert_eq!(outcome.as_str().parse::<Outcome>().unwrap(), outcome);
        }
    }
}
