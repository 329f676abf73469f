pub mod accounts;
pub mod pipeline;

pub use accounts::SharedAccountPool;
pub use pipeline::*;

use llm_interface::GenerationAdapter;
use reddit_client::{BackoffConfig, BackoffController, SocialPlatform};
use replybot_core::{BotConfig, CheckpointStore, Clock, CoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// External collaborators handed to the service by the binary.
pub struct ServiceDeps {
    pub platform: Arc<dyn SocialPlatform>,
    pub generator: GenerationAdapter,
    pub store: Arc<dyn CheckpointStore>,
    pub clock: Arc<dyn Clock>,
}

/// Runs one pipeline per monitored target on its own task.
///
/// The pipelines share the account pool and the checkpoint store, nothing else.
pub struct BackgroundService {
    pipelines: Vec<Pipeline>,
    cancel: CancellationToken,
}

impl BackgroundService {
    pub fn new(pipelines: Vec<Pipeline>) -> Self {
        Self {
            pipelines,
            cancel: CancellationToken::new(),
        }
    }

    /// Restores account and checkpoint state, then builds a pipeline per target.
    pub async fn from_config(config: &BotConfig, deps: ServiceDeps) -> Result<Self, CoreError> {
        let accounts = SharedAccountPool::from_config(config);
        accounts.restore(deps.store.as_ref()).await?;

        let backoff = BackoffController::new(BackoffConfig::from_settings(
            &config.backoff,
            Duration::from_secs(config.timeouts.post_secs),
        ));
        let shared = PipelineDeps {
            platform: deps.platform,
            generator: deps.generator,
            backoff,
            accounts,
            store: deps.store,
            clock: deps.clock,
        };

        let settings = PipelineSettings::from_config(config);
        let mut pipelines = Vec::new();
        for target in config.targets() {
            pipelines.push(Pipeline::restore(target, settings.clone(), shared.clone()).await?);
        }

        Ok(Self::new(pipelines))
    }

    /// Token that stops every pipeline once the current item is settled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        info!("Stopping background service");
        self.cancel.cancel();
    }

    /// Runs every pipeline to completion. Reports are ordered by target.
    pub async fn run(self) -> Vec<TargetReport> {
        info!("Starting {} pipelines", self.pipelines.len());

        let mut tasks = JoinSet::new();
        for mut pipeline in self.pipelines {
            let cancel = self.cancel.child_token();
            tasks.spawn(async move { pipeline.run(cancel).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Pipeline task failed: {}", e),
            }
        }

        reports.sort_by_key(|r| r.target.key());
        reports
    }
}
