use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::filter::FilterConfig;
use crate::types::{MonitorMode, Target};

pub const DEFAULT_USER_AGENT: &str = "replybot/0.1";
pub const MAX_ENV_ACCOUNTS: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub monitor: MonitorConfig,
    pub behavior: BehaviorConfig,
    pub backoff: BackoffSettings,
    pub accounts: AccountsConfig,
    pub llm: LlmConfig,
    pub timeouts: TimeoutConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    pub targets: Vec<String>,
    pub keywords: Vec<String>,
    pub min_age_secs: i64,
    pub max_age_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: MonitorMode::User,
            targets: Vec::new(),
            keywords: Vec::new(),
            min_age_secs: 0,
            max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub reply_delay_secs: u64,
    pub max_replies_per_run: u32,
    pub loop_enabled: bool,
    pub poll_interval_secs: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            reply_delay_secs: 10,
            max_replies_per_run: 10,
            loop_enabled: false,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub max_retries: u32,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_retries: 3,
            max_delay_ms: 120_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub min_spacing_secs: u64,
    pub failure_threshold: u32,
    pub pool: Vec<AccountCredentials>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            min_spacing_secs: 10,
            failure_threshold: 3,
            pool: Vec::new(),
        }
    }
}

/// Script-app credentials for one Reddit account.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// One of `openai`, `anthropic`, `ollama`.
    pub provider: String,
    pub model: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ollama_base_url: String,
    pub prompt_file: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            openai_api_key: None,
            anthropic_api_key: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            prompt_file: "prompts/default.txt".to_string(),
            max_tokens: 300,
            temperature: 0.8,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "anthropic_api_key",
                &self.anthropic_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("ollama_base_url", &self.ollama_base_url)
            .field("prompt_file", &self.prompt_file)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub poll_secs: u64,
    pub generate_secs: u64,
    pub post_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_secs: 30,
            generate_secs: 60,
            post_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "replybot.db".to_string(),
            retention_days: 7,
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for slot in 1..=MAX_ENV_ACCOUNTS {
            let suffix = if slot == 1 {
                String::new()
            } else {
                format!("_{}", slot)
            };
            let Some(username) = lookup(&format!("REDDIT_USERNAME{}", suffix)) else {
                continue;
            };
            let user_agent = lookup(&format!("REDDIT_USER_AGENT{}", suffix)).unwrap_or_else(|| {
                if slot == 1 {
                    DEFAULT_USER_AGENT.to_string()
                } else {
                    format!("{}-{}", DEFAULT_USER_AGENT, slot)
                }
            });
            let credentials = AccountCredentials {
                username,
                password: lookup(&format!("REDDIT_PASSWORD{}", suffix)).unwrap_or_default(),
                client_id: lookup(&format!("REDDIT_CLIENT_ID{}", suffix)).unwrap_or_default(),
                client_secret: lookup(&format!("REDDIT_CLIENT_SECRET{}", suffix))
                    .unwrap_or_default(),
                user_agent,
            };
            self.upsert_account(credentials);
        }

        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            if self.llm.provider == "ollama" {
                self.llm.model = Some(model);
            }
        }

        if let Some(value) = lookup("SLEEP_DURATION") {
            self.behavior.poll_interval_secs = parse_env("SLEEP_DURATION", &value)?;
        }
        if let Some(value) = lookup("REPLY_DELAY") {
            self.behavior.reply_delay_secs = parse_env("REPLY_DELAY", &value)?;
        }
        if let Some(value) = lookup("MAX_REPLIES") {
            self.behavior.max_replies_per_run = parse_env("MAX_REPLIES", &value)?;
        }

        Ok(())
    }

    fn upsert_account(&mut self, credentials: AccountCredentials) {
        match self
            .accounts
            .pool
            .iter_mut()
            .find(|a| a.username.eq_ignore_ascii_case(&credentials.username))
        {
            Some(existing) => *existing = credentials,
            None => self.accounts.pool.push(credentials),
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        self.monitor
            .targets
            .iter()
            .map(|name| Target {
                mode: self.monitor.mode,
                name: name.trim_start_matches("u/").trim_start_matches("r/").to_string(),
            })
            .collect()
    }

    /// Filter settings; the bot never answers its own accounts.
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig::new(
            self.monitor.keywords.clone(),
            self.monitor.min_age_secs,
            self.monitor.max_age_secs,
        )
        .with_excluded_authors(self.accounts.pool.iter().map(|a| a.username.as_str()))
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.pool.iter().map(|a| a.username.clone()).collect()
    }

    pub fn retention_secs(&self) -> i64 {
        i64::from(self.storage.retention_days) * 86_400
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_secs(self.behavior.reply_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.behavior.poll_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.pool.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "no Reddit accounts configured; set REDDIT_USERNAME or [[accounts.pool]]"
                    .to_string(),
            });
        }
        if let Some(account) = self.accounts.pool.iter().find(|a| a.username.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "accounts.pool.username".to_string(),
                value: format!("{:?}", account.username),
            });
        }
        if self.monitor.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::MissingField {
                field: "monitor.targets".to_string(),
            });
        }
        if self.monitor.min_age_secs < 0 || self.monitor.min_age_secs > self.monitor.max_age_secs {
            return Err(ConfigError::InvalidValue {
                field: "monitor.min_age_secs".to_string(),
                value: self.monitor.min_age_secs.to_string(),
            });
        }
        if self.accounts.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "accounts.failure_threshold".to_string(),
                value: "0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                field: "backoff.jitter_factor".to_string(),
                value: self.backoff.jitter_factor.to_string(),
            });
        }
        match self.llm.provider.as_str() {
            "openai" | "anthropic" | "ollama" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "llm.provider".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BotConfig::default();
        assert_eq!(config.behavior.reply_delay_secs, 10);
        assert_eq!(config.behavior.max_replies_per_run, 10);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.llm.provider, "openai");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[monitor]
mode = "subreddit"
targets = ["rust", "python"]
keywords = ["async"]

[behavior]
max_replies_per_run = 2

[[accounts.pool]]
username = "bot1"
password = "secret"
"#
        )
        .unwrap();

        let config = BotConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.monitor.mode, MonitorMode::Subreddit);
        assert_eq!(config.targets().len(), 2);
        assert_eq!(config.targets()[0].key(), "subreddit:rust");
        assert_eq!(config.behavior.max_replies_per_run, 2);
        assert_eq!(config.behavior.reply_delay_secs, 10);
        assert_eq!(config.accounts.pool[0].user_agent, DEFAULT_USER_AGENT);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = BotConfig::load_from_path(Path::new("/nonexistent/replybot.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_env_accounts_and_behavior() {
        let mut config = BotConfig::default();
        config
            .apply_env_with(env(&[
                ("REDDIT_USERNAME", "first"),
                ("REDDIT_PASSWORD", "pw"),
                ("REDDIT_USERNAME_3", "third"),
                ("LLM_PROVIDER", "ollama"),
                ("OLLAMA_MODEL", "mistral"),
                ("MAX_REPLIES", "4"),
                ("SLEEP_DURATION", "120"),
            ]))
            .unwrap();

        assert_eq!(config.account_ids(), vec!["first", "third"]);
        assert_eq!(config.accounts.pool[1].user_agent, "replybot/0.1-3");
        assert_eq!(config.llm.model.as_deref(), Some("mistral"));
        assert_eq!(config.behavior.max_replies_per_run, 4);
        assert_eq!(config.behavior.poll_interval_secs, 120);
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = BotConfig::default();
        let err = config
            .apply_env_with(env(&[("REPLY_DELAY", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = BotConfig::default();
        assert!(config.validate().is_err());

        config.accounts.pool.push(AccountCredentials {
            username: "bot1".to_string(),
            password: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        });
        assert!(config.validate().is_err());

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { ref field }) if field == "monitor.targets"
        ));

        config.monitor.targets.push("spez".to_string());
        config.validate().unwrap();

        config.monitor.min_age_secs = config.monitor.max_age_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter_excludes_own_accounts() {
        let mut config = BotConfig::default();
        config.apply_env_with(env(&[("REDDIT_USERNAME", "MyBot")])).unwrap();
        let filter = config.filter_config();
        assert_eq!(filter.excluded_authors, vec!["mybot"]);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = AccountCredentials {
            username: "bot1".to_string(),
            password: "hunter2".to_string(),
            client_id: "id".to_string(),
            client_secret: "shh".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("shh"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = BotConfig::from_toml(include_str!("../../replybot.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.monitor.mode, MonitorMode::Subreddit);
        assert_eq!(config.targets(), vec![Target::subreddit("learnpython")]);
        assert_eq!(config.account_ids(), vec!["my_bot".to_string()]);
    }
}
