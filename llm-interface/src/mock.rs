//! Scripted generator used by pipeline tests.

use crate::TextGenerator;
use async_trait::async_trait;
use replybot_core::LlmError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
pub struct MockGenerator {
    default: Result<String, LlmError>,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockGenerator {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            default: Ok(text.into()),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn failing(error: LlmError) -> Self {
        Self {
            default: Err(error),
            ..Self::replying("")
        }
    }

    /// Results returned before falling back to the default.
    pub fn with_script(self, script: Vec<Result<String, LlmError>>) -> Self {
        lock(&self.script).extend(script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(system_prompt, context)` pairs seen so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, LlmError> {
        lock(&self.calls).push((system_prompt.to_string(), context.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.script).pop_front();
        scripted.unwrap_or_else(|| self.default.clone())
    }
}
