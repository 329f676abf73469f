pub mod api;
pub mod backoff;
pub mod mock;
pub mod rate_limiter;

pub use api::*;
pub use backoff::*;
pub use rate_limiter::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use replybot_core::{CandidateItem, PlatformError, Target};
use std::time::Duration;

/// Result of a single post attempt, before any retry policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PostResponse {
    Posted { reply_id: Option<String> },
    /// The platform asked us to slow down. Nothing was posted.
    Throttled { retry_after: Option<Duration> },
    Failed(PlatformError),
}

/// Transport to a discussion platform.
#[async_trait]
pub trait SocialPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Items for `target` created strictly after `since`, oldest first.
    fn poll<'a>(
        &'a self,
        target: &'a Target,
        since: i64,
    ) -> BoxStream<'a, Result<CandidateItem, PlatformError>>;

    async fn post_reply(&self, item_id: &str, account: &str, text: &str) -> PostResponse;
}
