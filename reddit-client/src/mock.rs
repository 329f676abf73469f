//! Scripted platform used by pipeline tests.

use crate::{PostResponse, SocialPlatform};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use replybot_core::{CandidateItem, PlatformError, Target};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReply {
    pub item_id: String,
    pub account: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MockPlatform {
    items: Mutex<HashMap<String, Vec<CandidateItem>>>,
    poll_error: Mutex<Option<PlatformError>>,
    responses: Mutex<VecDeque<PostResponse>>,
    posts: Mutex<Vec<PostedReply>>,
    post_delay: Option<Duration>,
    poll_stalls: bool,
    poll_calls: AtomicUsize,
    post_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(self, target: &Target, items: Vec<CandidateItem>) -> Self {
        self.push_items(target, items);
        self
    }

    /// Responses handed out in order; once empty every post succeeds.
    pub fn with_responses(self, responses: Vec<PostResponse>) -> Self {
        lock(&self.responses).extend(responses);
        self
    }

    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    /// Error emitted after the scripted items, as when a later page fails.
    pub fn with_poll_error(self, error: PlatformError) -> Self {
        self.set_poll_error(Some(error));
        self
    }

    pub fn set_poll_error(&self, error: Option<PlatformError>) {
        *lock(&self.poll_error) = error;
    }

    /// The poll stream never ends after the scripted items.
    pub fn with_stalled_poll(mut self) -> Self {
        self.poll_stalls = true;
        self
    }

    pub fn push_items(&self, target: &Target, items: Vec<CandidateItem>) {
        lock(&self.items)
            .entry(target.key())
            .or_default()
            .extend(items);
    }

    pub fn posts(&self) -> Vec<PostedReply> {
        lock(&self.posts).clone()
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocialPlatform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    fn poll<'a>(
        &'a self,
        target: &'a Target,
        since: i64,
    ) -> BoxStream<'a, Result<CandidateItem, PlatformError>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);

        let mut items: Vec<CandidateItem> = lock(&self.items)
            .get(&target.key())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|item| item.created_utc > since)
            .collect();
        items.sort_by_key(|item| item.created_utc);

        let tail = lock(&self.poll_error).clone().map(Err);
        let items = stream::iter(items.into_iter().map(Ok).chain(tail));
        if self.poll_stalls {
            items.chain(stream::pending()).boxed()
        } else {
            items.boxed()
        }
    }

    async fn post_reply(&self, item_id: &str, account: &str, text: &str) -> PostResponse {
        let call = self.post_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }

        let response = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| PostResponse::Posted {
                reply_id: Some(format!("t1_reply{}", call)),
            });

        if let PostResponse::Posted { .. } = response {
            lock(&self.posts).push(PostedReply {
                item_id: item_id.to_string(),
                account: account.to_string(),
                text: text.to_string(),
            });
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn test_poll_respects_since_and_order() {
        let target = Target::user("spez");
        let platform = MockPlatform::new().with_items(
            &target,
            vec![item("c", 30), item("a", 10), item("b", 20)],
        );

        let items: Vec<_> = platform.poll(&target, 10).collect().await;
        let ids: Vec<_> = items
            .into_iter()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(platform.poll_calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_error_follows_items() {
        let target = Target::user("spez");
        let platform = MockPlatform::new()
            .with_items(&target, vec![item("a", 10)])
            .with_poll_error(PlatformError::ServerError { status_code: 503 });

        let items: Vec<_> = platform.poll(&target, 0).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().id, "a");
        assert!(items[1].is_err());

        platform.set_poll_error(None);
        let items: Vec<_> = platform.poll(&target, 0).collect().await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_responses() {
        let platform = MockPlatform::new()
            .with_responses(vec![PostResponse::Throttled { retry_after: None }]);

        assert!(matches!(
            platform.post_reply("a", "bot", "hi").await,
            PostResponse::Throttled { .. }
        ));
        assert!(matches!(
            platform.post_reply("a", "bot", "hi").await,
            PostResponse::Posted { .. }
        ));
        assert_eq!(platform.post_calls(), 2);
        assert_eq!(platform.posts().len(), 1);
    }
}
