pub mod mock;
pub mod providers;

pub use providers::*;

use async_trait::async_trait;
use replybot_core::{CandidateItem, LlmError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful Reddit user. Reply naturally and \
concisely (2-4 sentences). Stay on topic. Do not reveal you are a bot.";

/// A text-completion backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, LlmError>;
}

/// Builds the user message sent alongside the system prompt.
pub fn compose_context(item: &CandidateItem) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(community) = &item.community {
        parts.push(format!("Subreddit: r/{}", community));
    }
    if let Some(parent) = item.parent_context.as_deref().filter(|p| !p.trim().is_empty()) {
        parts.push(format!("Parent context: {}", parent));
    }
    parts.push(format!("Comment to reply to: {}", item.body));
    parts.join("\n\n")
}

/// Reads the system prompt, falling back to the built-in one.
pub fn load_system_prompt(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
        Ok(_) => {
            warn!("Prompt file {} is empty, using default", path.display());
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
        Err(_) => {
            warn!("Prompt file not found: {}, using default", path.display());
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

/// Turns a candidate item into reply text through a [`TextGenerator`].
///
/// Output is trimmed; blank completions and timeouts become errors.
#[derive(Clone)]
pub struct GenerationAdapter {
    generator: Arc<dyn TextGenerator>,
    system_prompt: String,
    timeout: Duration,
}

impl GenerationAdapter {
    pub fn new(generator: Arc<dyn TextGenerator>, system_prompt: impl Into<String>) -> Self {
        Self {
            generator,
            system_prompt: system_prompt.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub async fn generate_reply(&self, item: &CandidateItem) -> Result<String, LlmError> {
        let context = compose_context(item);
        let provider = self.generator.name().to_string();

        let text = tokio::time::timeout(
            self.timeout,
            self.generator.generate(&self.system_prompt, &context),
        )
        .await
        .map_err(|_| LlmError::RequestTimeout {
            provider: provider.clone(),
        })??;

        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse { provider });
        }

        debug!(item_id = %item.id, "Generated {} chars", text.chars().count());
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGenerator;
    use std::io::Write;

    fn item() -> CandidateItem {
        CandidateItem {
            id: "t1_a".to_string(),
            author: "someone".to_string(),
            body: "I love python".to_string(),
            parent_context: Some("What language should I learn?".to_string()),
            community: Some("learnprogramming".to_string()),
            created_utc: 100,
        }
    }

    #[test]
    fn test_compose_context() {
        let context = compose_context(&item());
        assert_eq!(
            context,
            "Subreddit: r/learnprogramming\n\n\
             Parent context: What language should I learn?\n\n\
             Comment to reply to: I love python"
        );

        let mut bare = item();
        bare.parent_context = None;
        assert!(!compose_context(&bare).contains("Parent context"));
    }

    #[tokio::test]
    async fn test_adapter_trims_output() {
        let generator = Arc::new(MockGenerator::replying("  Sounds great!\n"));
        let adapter = GenerationAdapter::new(generator.clone(), "be nice");
        let text = adapter.generate_reply(&item()).await.unwrap();
        assert_eq!(text, "Sounds great!");

        let calls = generator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "be nice");
        assert!(calls[0].1.contains("I love python"));
    }

    #[tokio::test]
    async fn test_blank_output_is_an_error() {
        let adapter = GenerationAdapter::new(Arc::new(MockGenerator::replying("   ")), "p");
        assert!(matches!(
            adapter.generate_reply(&item()).await,
            Err(LlmError::EmptyResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_generator_times_out() {
        let generator = MockGenerator::replying("late").with_delay(Duration::from_secs(5));
        let adapter = GenerationAdapter::new(Arc::new(generator), "p")
            .with_timeout(Duration::from_millis(20));
        assert!(matches!(
            adapter.generate_reply(&item()).await,
            Err(LlmError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_generator_error_passes_through() {
        let generator = MockGenerator::failing(LlmError::Failed {
            reason: "timeout".to_string(),
        });
        let adapter = GenerationAdapter::new(Arc::new(generator), "p");
        assert_eq!(
            adapter.generate_reply(&item()).await,
            Err(LlmError::Failed {
                reason: "timeout".to_string()
            })
        );
    }

    #[test]
    fn test_load_system_prompt() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  Be terse.  ").unwrap();
        assert_eq!(load_system_prompt(file.path()), "Be terse.");
        assert_eq!(
            load_system_prompt(Path::new("/nonexistent/prompt.txt")),
            DEFAULT_SYSTEM_PROMPT
        );
    }
}
