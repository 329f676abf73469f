use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::{PostResponse, SocialPlatform};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use replybot_core::{AccountCredentials, CandidateItem, MonitorMode, PlatformError, Target};
use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const REDDIT_API_BASE: &str = "https://oauth.reddit.com";
const REDDIT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const LISTING_LIMIT: &str = "100";
/// Refresh tokens this long before Reddit says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditCommentData {
    pub id: String,
    /// Fullname, e.g. `t1_abc123`.
    pub name: String,
    pub author: String,
    pub body: String,
    pub subreddit: String,
    #[serde(default)]
    pub link_title: Option<String>,
    pub created_utc: f64,
}

impl From<RedditCommentData> for CandidateItem {
    fn from(comment: RedditCommentData) -> Self {
        Self {
            id: comment.name,
            author: comment.author,
            body: comment.body,
            parent_context: comment.link_title,
            community: Some(comment.subreddit),
            created_utc: comment.created_utc as i64,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Reddit OAuth client acting for a pool of script-app accounts.
#[derive(Debug)]
pub struct RedditApiClient {
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    accounts: HashMap<String, AccountCredentials>,
    /// Account used for read-only listing calls.
    reader: String,
    tokens: Mutex<HashMap<String, AccessToken>>,
    api_base: String,
    token_url: String,
}

impl RedditApiClient {
    pub fn new(
        accounts: Vec<AccountCredentials>,
        request_timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let reader = accounts
            .first()
            .map(|a| a.username.clone())
            .ok_or_else(|| PlatformError::UnknownAccount {
                account: "<none configured>".to_string(),
            })?;

        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PlatformError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::reddit_oauth())),
            accounts: accounts
                .into_iter()
                .map(|a| (a.username.clone(), a))
                .collect(),
            reader,
            tokens: Mutex::new(HashMap::new()),
            api_base: REDDIT_API_BASE.to_string(),
            token_url: REDDIT_TOKEN_URL.to_string(),
        })
    }

    /// Points the client at other hosts, e.g. a local test server.
    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(config));
        self
    }

    fn credentials(&self, account: &str) -> Result<&AccountCredentials, PlatformError> {
        self.accounts
            .get(account)
            .ok_or_else(|| PlatformError::UnknownAccount {
                account: account.to_string(),
            })
    }

    /// Returns a bearer token for `account`, fetching a new one when needed.
    pub async fn access_token(&self, account: &str) -> Result<String, PlatformError> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(token) = tokens.get(account) {
                if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        let creds = self.credentials(account)?;
        self.rate_limiter.acquire().await;
        debug!(account = %account, "Requesting access token");

        let response = self
            .http_client
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .header("User-Agent", &creds.user_agent)
            .form(&[
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PlatformError::AuthenticationFailed {
                account: account.to_string(),
                reason: format!("token endpoint returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &self.token_url, None));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            PlatformError::InvalidResponse {
                details: format!("failed to parse token response: {}", e),
            }
        })?;

        let value = match (body.access_token, body.error) {
            (Some(token), None) => token,
            (_, Some(reason)) => {
                return Err(PlatformError::AuthenticationFailed {
                    account: account.to_string(),
                    reason,
                })
            }
            (None, None) => {
                return Err(PlatformError::InvalidResponse {
                    details: "token response without access_token".to_string(),
                })
            }
        };

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        info!(account = %account, "Authenticated with Reddit");
        self.tokens.lock().await.insert(
            account.to_string(),
            AccessToken {
                value: value.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(value)
    }

    pub async fn make_request(
        &self,
        account: &str,
        method: Method,
        endpoint: &str,
        query_params: Option<&[(&str, &str)]>,
        form: Option<&[(&str, &str)]>,
    ) -> Result<Response, PlatformError> {
        let token = self.access_token(account).await?;
        let user_agent = &self.credentials(account)?.user_agent;
        let url = format!("{}{}", self.api_base, endpoint);

        let waited = self.rate_limiter.acquire().await;
        debug!("Acquired rate limit permit for {} {} after {:?}", method, endpoint, waited);

        let mut request_builder = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(&token)
            .header("User-Agent", user_agent);

        if let Some(params) = query_params {
            request_builder = request_builder.query(params);
        }
        if let Some(fields) = form {
            request_builder = request_builder.form(fields);
        }

        info!("Making Reddit API request: {} {}", method, endpoint);
        let response = request_builder.send().await.map_err(|e| {
            error!("Network error for {} {}: {}", method, endpoint, e);
            map_transport_error(e)
        })?;

        let remaining = header_f64(&response, "x-ratelimit-remaining");
        let reset = header_f64(&response, "x-ratelimit-reset").map(Duration::from_secs_f64);
        self.rate_limiter.observe_quota(remaining, reset).await;

        let status = response.status();
        if status.is_success() {
            debug!("Request successful: {} {}", status, endpoint);
            return Ok(response);
        }

        error!("Request failed with status: {} for {}", status, endpoint);
        if status.as_u16() == 401 {
            // A rejected bearer token is dropped so the next call re-authenticates.
            self.tokens.lock().await.remove(account);
            return Err(PlatformError::AuthenticationFailed {
                account: account.to_string(),
                reason: "bearer token rejected".to_string(),
            });
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Err(status_error(status.as_u16(), endpoint, retry_after))
    }

    pub async fn fetch_comments(
        &self,
        target: &Target,
        since: i64,
    ) -> Result<Vec<CandidateItem>, PlatformError> {
        let endpoint = match target.mode {
            MonitorMode::User => format!("/user/{}/comments", target.name),
            MonitorMode::Subreddit => format!("/r/{}/comments", target.name),
        };
        let params = [("limit", LISTING_LIMIT), ("raw_json", "1")];

        let response = self
            .make_request(&self.reader, Method::GET, &endpoint, Some(&params), None)
            .await?;

        let listing: RedditListing<RedditCommentData> = response.json().await.map_err(|e| {
            error!("Failed to parse comment listing: {}", e);
            PlatformError::InvalidResponse {
                details: format!("failed to parse comments for {}", target),
            }
        })?;

        let items = listing_to_candidates(listing, since);
        info!("Retrieved {} new comments from {}", items.len(), target);
        Ok(items)
    }

    pub async fn submit_comment(&self, item_id: &str, account: &str, text: &str) -> PostResponse {
        if let Err(e) = self.credentials(account) {
            return PostResponse::Failed(e);
        }

        let form = [("thing_id", item_id), ("text", text), ("api_type", "json")];
        let response = match self
            .make_request(account, Method::POST, "/api/comment", None, Some(&form))
            .await
        {
            Ok(response) => response,
            Err(PlatformError::RateLimitExceeded { retry_after }) => {
                return PostResponse::Throttled {
                    retry_after: Some(Duration::from_secs(retry_after)),
                }
            }
            Err(e) => return PostResponse::Failed(e),
        };

        match response.json::<serde_json::Value>().await {
            Ok(body) => interpret_comment_response(&body),
            Err(e) => PostResponse::Failed(PlatformError::InvalidResponse {
                details: format!("failed to parse comment response: {}", e),
            }),
        }
    }
}

#[async_trait]
impl SocialPlatform for RedditApiClient {
    fn name(&self) -> &str {
        "reddit"
    }

    fn poll<'a>(
        &'a self,
        target: &'a Target,
        since: i64,
    ) -> BoxStream<'a, Result<CandidateItem, PlatformError>> {
        stream::once(self.fetch_comments(target, since))
            .flat_map(|result| match result {
                Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }

    async fn post_reply(&self, item_id: &str, account: &str, text: &str) -> PostResponse {
        self.submit_comment(item_id, account, text).await
    }
}

/// Keeps comments newer than `since` and orders them oldest first.
pub fn listing_to_candidates(
    listing: RedditListing<RedditCommentData>,
    since: i64,
) -> Vec<CandidateItem> {
    let mut items: Vec<CandidateItem> = listing
        .data
        .children
        .into_iter()
        .map(|child| CandidateItem::from(child.data))
        .filter(|item| item.created_utc > since)
        .collect();
    // Listings arrive newest first.
    items.reverse();
    items.sort_by_key(|item| item.created_utc);
    items
}

/// Reads the `json.errors` / `json.data.things` envelope of `/api/comment`.
pub fn interpret_comment_response(body: &serde_json::Value) -> PostResponse {
    let json = &body["json"];

    if let Some(errors) = json["errors"].as_array() {
        if let Some(first) = errors.first() {
            let code = first[0].as_str().unwrap_or_default();
            let message = first[1].as_str().unwrap_or_default();
            if code == "RATELIMIT" {
                warn!("Reddit rate limit on comment: {}", message);
                return PostResponse::Throttled {
                    retry_after: parse_retry_hint(message),
                };
            }
            return PostResponse::Failed(PlatformError::Rejected {
                reason: format!("{}: {}", code, message),
            });
        }
    }

    let reply_id = json["data"]["things"][0]["data"]["name"]
        .as_str()
        .map(str::to_string);
    PostResponse::Posted { reply_id }
}

/// Parses hints such as "try again in 9 minutes." into a duration.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let rest = &lower[lower.rfind(" in ")? + 4..];
    let mut words = rest.split_whitespace();
    let amount: u64 = words.next()?.parse().ok()?;
    let unit = words.next()?;

    if unit.starts_with("millisecond") {
        Some(Duration::from_millis(amount))
    } else if unit.starts_with("second") {
        Some(Duration::from_secs(amount))
    } else if unit.starts_with("minute") {
        Some(Duration::from_secs(amount * 60))
    } else {
        None
    }
}

fn status_error(status: u16, resource: &str, retry_after: Option<u64>) -> PlatformError {
    match status {
        429 => PlatformError::RateLimitExceeded {
            retry_after: retry_after.unwrap_or(60),
        },
        403 => PlatformError::Forbidden {
            resource: resource.to_string(),
        },
        404 => PlatformError::NotFound {
            resource: resource.to_string(),
        },
        s if s >= 500 => PlatformError::ServerError { status_code: s },
        s => PlatformError::InvalidResponse {
            details: format!("unexpected status {} for {}", s, resource),
        },
    }
}

fn map_transport_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::RequestTimeout
    } else {
        PlatformError::Network {
            message: e.to_string(),
        }
    }
}

fn header_f64(response: &Response, name: &str) -> Option<f64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment(name: &str, created: f64) -> RedditListingChild<RedditCommentData> {
        RedditListingChild {
            kind: "t1".to_string(),
            data: RedditCommentData {
                id: name.trim_start_matches("t1_").to_string(),
                name: name.to_string(),
                author: "someone".to_string(),
                body: "text".to_string(),
                subreddit: "rust".to_string(),
                link_title: Some("A thread".to_string()),
                created_utc: created,
            },
        }
    }

    #[test]
    fn test_listing_filters_and_orders() {
        let listing = RedditListing {
            kind: "Listing".to_string(),
            data: RedditListingData {
                children: vec![
                    comment("t1_c", 300.0),
                    comment("t1_b", 200.0),
                    comment("t1_a", 100.0),
                ],
                after: None,
                before: None,
            },
        };

        let items = listing_to_candidates(listing, 100);
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["t1_b", "t1_c"]);
        assert_eq!(items[0].parent_context.as_deref(), Some("A thread"));
        assert_eq!(items[0].community.as_deref(), Some("rust"));
    }

    #[test]
    fn test_parse_retry_hint() {
        assert_eq!(
            parse_retry_hint("you are doing that too much. try again in 9 minutes."),
            Some(Duration::from_secs(540))
        );
        assert_eq!(
            parse_retry_hint("Take a break for a bit. Try again in 42 seconds."),
            Some(Duration::from_secs(42))
        );
        assert_eq!(parse_retry_hint("slow down"), None);
    }

    #[test]
    fn test_interpret_comment_response() {
        let posted = json!({"json": {"errors": [], "data": {"things": [{"kind": "t1", "data": {"name": "t1_reply"}}]}}});
        assert_eq!(
            interpret_comment_response(&posted),
            PostResponse::Posted {
                reply_id: Some("t1_reply".to_string())
            }
        );

        let throttled = json!({"json": {"errors": [["RATELIMIT", "try again in 2 minutes.", "ratelimit"]]}});
        assert_eq!(
            interpret_comment_response(&throttled),
            PostResponse::Throttled {
                retry_after: Some(Duration::from_secs(120))
            }
        );

        let locked = json!({"json": {"errors": [["THREAD_LOCKED", "that thread is locked", "parent"]]}});
        assert!(matches!(
            interpret_comment_response(&locked),
            PostResponse::Failed(PlatformError::Rejected { .. })
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error(429, "/api/comment", Some(7)),
            PlatformError::RateLimitExceeded { retry_after: 7 }
        );
        assert!(matches!(status_error(403, "/x", None), PlatformError::Forbidden { .. }));
        assert!(matches!(status_error(404, "/x", None), PlatformError::NotFound { .. }));
        assert_eq!(
            status_error(503, "/x", None),
            PlatformError::ServerError { status_code: 503 }
        );
    }

    #[tokio::test]
    async fn test_unknown_account_is_rejected_locally() {
        let client = RedditApiClient::new(
            vec![AccountCredentials {
                username: "bot1".to_string(),
                password: "pw".to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                user_agent: "replybot/test".to_string(),
            }],
            Duration::from_secs(5),
        )
        .unwrap();

        let response = client.post_reply("t1_a", "stranger", "hi").await;
        assert_eq!(
            response,
            PostResponse::Failed(PlatformError::UnknownAccount {
                account: "stranger".to_string()
            })
        );
    }

    #[test]
    fn test_empty_pool_is_an_error() {
        assert!(RedditApiClient::new(Vec::new(), Duration::from_secs(5)).is_err());
    }
}
