use crate::types::{CandidateItem, SkipReason};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Matched case-insensitively against the item body. Empty matches all.
    pub keywords: Vec<String>,
    /// Minimum age in seconds before an item may be answered.
    pub min_age: i64,
    /// Maximum age in seconds; older items are skipped.
    pub max_age: i64,
    /// Authors never answered, normally the bot's own accounts.
    pub excluded_authors: Vec<String>,
}

impl FilterConfig {
    pub fn new(keywords: Vec<String>, min_age: i64, max_age: i64) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            min_age,
            max_age,
            excluded_authors: Vec::new(),
        }
    }

    pub fn with_excluded_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded_authors = authors
            .into_iter()
            .map(|a| a.as_ref().to_lowercase())
            .collect();
        self
    }

    fn matches_keywords(&self, body: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let body = body.to_lowercase();
        self.keywords
            .iter()
            .any(|kw| body.contains(kw.to_lowercase().as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(SkipReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Decides whether `item` should be answered at time `now`.
///
/// The age window is `[now - max_age, now - min_age]`, both ends inclusive.
/// Has no side effects; the same inputs always give the same answer.
pub fn evaluate<F>(
    item: &CandidateItem,
    config: &FilterConfig,
    now: i64,
    already_replied: F,
) -> Eligibility
where
    F: Fn(&str) -> bool,
{
    if !config.matches_keywords(&item.body) {
        return Eligibility::Ineligible(SkipReason::KeywordMismatch);
    }

    if item.created_utc > now - config.min_age {
        return Eligibility::Ineligible(SkipReason::TooFresh);
    }
    if item.created_utc < now - config.max_age {
        return Eligibility::Ineligible(SkipReason::TooOld);
    }

    if already_replied(&item.id) {
        return Eligibility::Ineligible(SkipReason::AlreadyReplied);
    }

    let author = item.author.to_lowercase();
    if config.excluded_authors.iter().any(|a| *a == author) {
        return Eligibility::Ineligible(SkipReason::OwnAuthor);
    }

    Eligibility::Eligible
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, body: &str, created: i64) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            author: "someone".to_string(),
            body: body.to_string(),
            parent_context: None,
            community: Some("python".to_string()),
            created_utc: created,
        }
    }

    fn config() -> FilterConfig {
        FilterConfig::new(vec!["Python".to_string()], 0, 3600)
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let cfg = config();
        let result = evaluate(&item("a", "I love PYTHON", 100), &cfg, 200, |_| false);
        assert_eq!(result, Eligibility::Eligible);

        let result = evaluate(&item("b", "off topic", 100), &cfg, 200, |_| false);
        assert_eq!(result, Eligibility::Ineligible(SkipReason::KeywordMismatch));
    }

    #[test]
    fn test_empty_keywords_match_everything() {
        let cfg = FilterConfig::new(vec![], 0, 3600);
        assert!(evaluate(&item("a", "anything", 100), &cfg, 200, |_| false).is_eligible());
    }

    #[test]
    fn test_age_window_bounds() {
        let cfg = FilterConfig::new(vec![], 60, 600);
        let now = 10_000;

        assert_eq!(
            evaluate(&item("a", "x", now - 30), &cfg, now, |_| false),
            Eligibility::Ineligible(SkipReason::TooFresh)
        );
        assert_eq!(
            evaluate(&item("b", "x", now - 601), &cfg, now, |_| false),
            Eligibility::Ineligible(SkipReason::TooOld)
        );
        assert!(evaluate(&item("c", "x", now - 60), &cfg, now, |_| false).is_eligible());
        assert!(evaluate(&item("d", "x", now - 600), &cfg, now, |_| false).is_eligible());
    }

    #[test]
    fn test_already_replied() {
        let cfg = config();
        let result = evaluate(&item("a", "python", 100), &cfg, 200, |id| id == "a");
        assert_eq!(result, Eligibility::Ineligible(SkipReason::AlreadyReplied));
    }

    #[test]
    fn test_own_author_excluded() {
        let cfg = config().with_excluded_authors(["BotOne"]);
        let mut own = item("a", "python", 100);
        own.author = "botone".to_string();
        assert_eq!(
            evaluate(&own, &cfg, 200, |_| false),
            Eligibility::Ineligible(SkipReason::OwnAuthor)
        );
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let cfg = FilterConfig::new(vec!["rust".to_string()], 10, 1000);
        let candidates = [
            item("a", "rust is fun", 950),
            item("b", "go", 950),
            item("c", "RUST", 5),
            item("d", "rust", 999),
        ];
        let first: Vec<_> = candidates
            .iter()
            .map(|c| evaluate(c, &cfg, 1000, |id| id == "a"))
            .collect();
        let second: Vec<_> = candidates
            .iter()
            .map(|c| evaluate(c, &cfg, 1000, |id| id == "a"))
            .collect();
        assert_eq!(first, second);
    }
}
