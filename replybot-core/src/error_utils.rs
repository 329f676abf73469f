use crate::error::*;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    fn is_retryable(&self) -> bool;
    fn retry_after(&self) -> Option<Duration>;
    fn classify(&self) -> ErrorClass;
    fn user_friendly_message(&self) -> String;
    fn error_code(&self) -> String;
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!("CoreError: {}", self);
        match self {
            CoreError::Platform(e) => {
                error!("Platform error details: {:?}", e);
            }
            CoreError::Database(e) => {
                error!("Database error details: {:?}", e);
            }
            CoreError::Llm(e) => {
                error!("LLM error details: {:?}", e);
            }
            CoreError::Config(e) => {
                error!("Configuration error details: {:?}", e);
            }
            _ => {}
        }
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("CoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::Platform(e) => e.is_retryable(),
            CoreError::Database(e) => e.is_retryable(),
            CoreError::Llm(e) => e.is_retryable(),
            CoreError::Network(_) => true,
            CoreError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::Platform(e) => e.retry_after(),
            CoreError::Database(e) => e.retry_after(),
            CoreError::Llm(e) => e.retry_after(),
            CoreError::Timeout { seconds } => Some(Duration::from_secs(*seconds)),
            _ if self.is_retryable() => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    fn classify(&self) -> ErrorClass {
        match self {
            CoreError::Platform(e) => e.classify(),
            CoreError::Llm(e) => e.classify(),
            CoreError::Database(e) => e.classify(),
            CoreError::Config(_) | CoreError::NoEligibleAccounts { .. } => {
                ErrorClass::PermanentGlobal
            }
            CoreError::Io(_) => ErrorClass::PermanentGlobal,
            CoreError::Network(_) | CoreError::Timeout { .. } => ErrorClass::Transient,
            CoreError::Serialization(_) => ErrorClass::PermanentPerItem,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::Platform(e) => e.user_friendly_message(),
            CoreError::Database(e) => e.user_friendly_message(),
            CoreError::Llm(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => {
                "Network connection error. Please check your internet connection.".to_string()
            }
            CoreError::Timeout { .. } => {
                "The operation took too long to complete. Please try again.".to_string()
            }
            CoreError::NoEligibleAccounts { target } => format!(
                "Every configured account is excluded, nothing can be posted for {}.",
                target
            ),
            _ => "An unexpected error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            CoreError::Platform(_) => "PLATFORM".to_string(),
            CoreError::Database(_) => "DATABASE".to_string(),
            CoreError::Llm(_) => "LLM".to_string(),
            CoreError::Config(_) => "CONFIG".to_string(),
            CoreError::Io(_) => "IO".to_string(),
            CoreError::Serialization(_) => "SERIALIZATION".to_string(),
            CoreError::Network(_) => "NETWORK".to_string(),
            CoreError::Timeout { .. } => "TIMEOUT".to_string(),
            CoreError::NoEligibleAccounts { .. } => "NO_ELIGIBLE_ACCOUNTS".to_string(),
        }
    }
}

impl ErrorExt for PlatformError {
    fn log_error(&self) -> &Self {
        error!("PlatformError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("PlatformError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            PlatformError::RateLimitExceeded { .. } => true,
            PlatformError::RequestTimeout => true,
            PlatformError::ServerError { status_code } => *status_code >= 500,
            PlatformError::Network { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimitExceeded { retry_after } => {
                Some(Duration::from_secs(*retry_after))
            }
            _ if self.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }

    fn classify(&self) -> ErrorClass {
        match self {
            PlatformError::AuthenticationFailed { .. } | PlatformError::UnknownAccount { .. } => {
                ErrorClass::PermanentGlobal
            }
            _ if self.is_retryable() => ErrorClass::Transient,
            _ => ErrorClass::PermanentPerItem,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            PlatformError::AuthenticationFailed { account, .. } => format!(
                "Authentication failed for u/{}. Please check the credentials.",
                account
            ),
            PlatformError::RateLimitExceeded { retry_after } => format!(
                "Too many requests. Please wait {} seconds before trying again.",
                retry_after
            ),
            PlatformError::Forbidden { resource } => format!(
                "Access denied to {}. The account may be banned or the thread locked.",
                resource
            ),
            PlatformError::NotFound { resource } => {
                format!("'{}' was not found or has been deleted.", resource)
            }
            PlatformError::Rejected { reason } => format!("The reply was rejected: {}", reason),
            PlatformError::RequestTimeout => {
                "Request to the platform timed out. Please try again.".to_string()
            }
            _ => "Platform API error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            PlatformError::AuthenticationFailed { .. } => "PLATFORM_AUTH_FAILED".to_string(),
            PlatformError::RateLimitExceeded { .. } => "PLATFORM_RATE_LIMIT".to_string(),
            PlatformError::Forbidden { .. } => "PLATFORM_FORBIDDEN".to_string(),
            PlatformError::NotFound { .. } => "PLATFORM_NOT_FOUND".to_string(),
            PlatformError::Rejected { .. } => "PLATFORM_REJECTED".to_string(),
            PlatformError::UnknownAccount { .. } => "PLATFORM_UNKNOWN_ACCOUNT".to_string(),
            PlatformError::RequestTimeout => "PLATFORM_TIMEOUT".to_string(),
            PlatformError::InvalidResponse { .. } => "PLATFORM_INVALID_RESPONSE".to_string(),
            PlatformError::ServerError { .. } => "PLATFORM_SERVER_ERROR".to_string(),
            PlatformError::Network { .. } => "PLATFORM_NETWORK".to_string(),
        }
    }
}

impl ErrorExt for DatabaseError {
    fn log_error(&self) -> &Self {
        error!("DatabaseError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("DatabaseError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::DatabaseLocked
            | DatabaseError::ConnectionFailed { .. }
            | DatabaseError::TransactionFailed { .. } => true,
            DatabaseError::Sql(sqlx::Error::Database(e)) => {
                // SQLITE_BUSY / SQLITE_LOCKED
                matches!(e.code().as_deref(), Some("5") | Some("6"))
            }
            DatabaseError::Sql(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DatabaseError::DatabaseLocked => Some(Duration::from_millis(100)),
            _ if self.is_retryable() => Some(Duration::from_millis(250)),
            _ => None,
        }
    }

    fn classify(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::PermanentGlobal
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            DatabaseError::ConnectionFailed { .. } => {
                "Database connection failed. Please try again.".to_string()
            }
            DatabaseError::DatabaseLocked => {
                "Database is temporarily busy. Please try again.".to_string()
            }
            DatabaseError::CorruptCheckpoint { .. } => {
                "Stored checkpoint data is unreadable. Inspect or remove the state database."
                    .to_string()
            }
            _ => "Database error occurred. Please try again.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            DatabaseError::ConnectionFailed { .. } => "DB_CONNECTION_FAILED".to_string(),
            DatabaseError::MigrationFailed { .. } => "DB_MIGRATION_FAILED".to_string(),
            DatabaseError::TransactionFailed { .. } => "DB_TRANSACTION_FAILED".to_string(),
            DatabaseError::DatabaseLocked => "DB_LOCKED".to_string(),
            DatabaseError::CorruptCheckpoint { .. } => "DB_CORRUPT_CHECKPOINT".to_string(),
            DatabaseError::Sql(_) => "DB_SQL_ERROR".to_string(),
        }
    }
}

impl ErrorExt for LlmError {
    fn log_error(&self) -> &Self {
        error!("LlmError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("LlmError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimitExceeded { .. }
                | LlmError::ServiceUnavailable { .. }
                | LlmError::RequestTimeout { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimitExceeded { retry_after, .. } => {
                Some(Duration::from_secs(*retry_after))
            }
            _ if self.is_retryable() => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    // Generation is never retried inside a run, so every generator error only
    // costs the current item.
    fn classify(&self) -> ErrorClass {
        ErrorClass::PermanentPerItem
    }

    fn user_friendly_message(&self) -> String {
        match self {
            LlmError::AuthenticationFailed { provider } => format!(
                "Authentication failed for {}. Please check your API key.",
                provider
            ),
            LlmError::InvalidApiKey { provider } => format!(
                "Invalid API key for {}. Please update your credentials.",
                provider
            ),
            LlmError::RateLimitExceeded {
                provider,
                retry_after,
            } => format!(
                "Rate limit exceeded for {}. Please wait {} seconds.",
                provider, retry_after
            ),
            LlmError::ModelNotAvailable { model } => format!(
                "Model '{}' is not available. Please try a different model.",
                model
            ),
            LlmError::ContentFiltered { .. } => {
                "Content was filtered by the AI provider's safety systems.".to_string()
            }
            LlmError::ServiceUnavailable { provider } => format!(
                "{} service is temporarily unavailable. Please try again later.",
                provider
            ),
            LlmError::UnsupportedProvider { provider } => format!(
                "LLM provider '{}' is not supported. Use openai, anthropic or ollama.",
                provider
            ),
            _ => "AI service error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            LlmError::AuthenticationFailed { .. } => "LLM_AUTH_FAILED".to_string(),
            LlmError::InvalidApiKey { .. } => "LLM_INVALID_API_KEY".to_string(),
            LlmError::RateLimitExceeded { .. } => "LLM_RATE_LIMIT".to_string(),
            LlmError::ModelNotAvailable { .. } => "LLM_MODEL_NOT_AVAILABLE".to_string(),
            LlmError::ContentFiltered { .. } => "LLM_CONTENT_FILTERED".to_string(),
            LlmError::ServiceUnavailable { .. } => "LLM_SERVICE_UNAVAILABLE".to_string(),
            LlmError::RequestTimeout { .. } => "LLM_TIMEOUT".to_string(),
            LlmError::InvalidResponseFormat { .. } => "LLM_INVALID_RESPONSE".to_string(),
            LlmError::EmptyResponse { .. } => "LLM_EMPTY_RESPONSE".to_string(),
            LlmError::UnsupportedProvider { .. } => "LLM_UNSUPPORTED_PROVIDER".to_string(),
            LlmError::Failed { .. } => "LLM_FAILED".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn log_error(&self) -> &Self {
        error!("ConfigError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ConfigError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false // Config errors are typically not retryable
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn classify(&self) -> ErrorClass {
        ErrorClass::PermanentGlobal
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => {
                format!("Configuration file '{}' not found.", path)
            }
            ConfigError::MissingField { field } => {
                format!("Required configuration field '{}' is missing.", field)
            }
            ConfigError::InvalidValue { field, .. } => {
                format!("Invalid value for configuration field '{}'.", field)
            }
            ConfigError::ValidationFailed { reason } => {
                format!("Configuration is not usable: {}", reason)
            }
            ConfigError::Parse(_) => {
                "Configuration file format is invalid. Please check the settings.".to_string()
            }
        }
    }

    fn error_code(&self) -> String {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND".to_string(),
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD".to_string(),
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE".to_string(),
            ConfigError::ValidationFailed { .. } => "CONFIG_VALIDATION_FAILED".to_string(),
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR".to_string(),
        }
    }
}

/// Logs a terminal error with its code, user-facing message and retry hint.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn report_error(&self, error: &CoreError) {
        error.log_error();
        info!("Error code: {}", error.error_code());
        info!("User message: {}", error.user_friendly_message());
        if let Some(retry_after) = error.retry_after() {
            info!("Error is retryable. Retry after: {:?}", retry_after);
        }
    }
}

/// Retries a transient async operation, doubling the delay up to 60s.
///
/// Errors that are not retryable are returned on the first failure.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: usize,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorExt + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if attempt >= max_retries || !error.is_retryable() {
                    return Err(error);
                }

                info!(
                    "Retrying operation (attempt {}/{}) after {:?}: {}",
                    attempt + 1,
                    max_retries,
                    delay,
                    error
                );

                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(60)); // Exponential backoff with max 60s
                attempt += 1;
            }
        }
    }
}
