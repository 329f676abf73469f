use futures::StreamExt;
use llm_interface::GenerationAdapter;
use reddit_client::{BackoffController, BackoffOutcome, FailureReason, SocialPlatform};
use replybot_core::{
    evaluate, Account, AccountLease, BotConfig, CandidateItem, CheckpointStore, Clock, Commit,
    CoreError, DedupStore, Eligibility, ErrorClass, ErrorExt, FilterConfig, ReplyRecord,
    Selection, SkipReason, Target, TargetCheckpoint,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accounts::SharedAccountPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Filtering,
    Generating,
    Rotating,
    Posting,
    Recording,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Polling => "polling",
            Phase::Filtering => "filtering",
            Phase::Generating => "generating",
            Phase::Rotating => "rotating",
            Phase::Posting => "posting",
            Phase::Recording => "recording",
            Phase::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Eligible items that reached a reply outcome in this run.
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub deferred: u32,
}

impl RunSummary {
    pub fn absorb(&mut self, other: &RunSummary) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} failed={} skipped={} deferred={}",
            self.attempted, self.succeeded, self.failed, self.skipped, self.deferred
        )
    }
}

/// Why a run stopped.
#[derive(Debug)]
pub enum Termination {
    Exhausted,
    MaxReplies,
    /// No account could post yet, or the next item is younger than the
    /// minimum age. The item is retried on the next iteration.
    Deferred { retry_in: Option<Duration> },
    /// The poll failed with a transient error before the stream ended.
    PollFailed(CoreError),
    Cancelled,
    Halted(CoreError),
}

impl Termination {
    pub fn is_halted(&self) -> bool {
        matches!(self, Termination::Halted(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exhausted => write!(f, "stream exhausted"),
            Termination::MaxReplies => write!(f, "max replies reached"),
            Termination::Deferred {
                retry_in: Some(retry_in),
            } => write!(f, "deferred for {:?}", retry_in),
            Termination::Deferred { retry_in: None } => write!(f, "deferred"),
            Termination::PollFailed(e) => write!(f, "poll failed: {}", e),
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::Halted(e) => write!(f, "halted: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target: Target,
    pub summary: RunSummary,
    pub termination: Termination,
    pub last_processed: i64,
}

/// Mutable per-run state, owned by the run and threaded through each stage.
#[derive(Debug)]
pub struct RunState {
    pub run_id: Uuid,
    pub phase: Phase,
    pub summary: RunSummary,
    /// Timestamp of the last item that reached a terminal outcome.
    resolved_through: Option<i64>,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: Phase::Idle,
            summary: RunSummary::default(),
            resolved_through: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }
}

/// Accumulated result of every run of one pipeline.
#[derive(Debug)]
pub struct TargetReport {
    pub target: Target,
    pub runs: u32,
    pub summary: RunSummary,
    pub last_processed: i64,
    pub halted: Option<CoreError>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub filter: FilterConfig,
    pub max_replies_per_run: u32,
    pub reply_delay: Duration,
    pub loop_enabled: bool,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub retention_secs: i64,
    pub commit_retries: usize,
    pub commit_retry_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            filter: config.filter_config(),
            max_replies_per_run: config.behavior.max_replies_per_run,
            reply_delay: config.reply_delay(),
            loop_enabled: config.behavior.loop_enabled,
            poll_interval: config.poll_interval(),
            poll_timeout: Duration::from_secs(config.timeouts.poll_secs),
            retention_secs: config.retention_secs(),
            commit_retries: 3,
            commit_retry_delay: Duration::from_millis(200),
        }
    }
}

/// Collaborators shared by every pipeline of the process.
#[derive(Clone)]
pub struct PipelineDeps {
    pub platform: Arc<dyn SocialPlatform>,
    pub generator: GenerationAdapter,
    pub backoff: BackoffController,
    pub accounts: SharedAccountPool,
    pub store: Arc<dyn CheckpointStore>,
    pub clock: Arc<dyn Clock>,
}

enum ItemOutcome {
    Resolved,
    Stop(Termination),
}

/// Sequential reply pipeline for one monitored target.
pub struct Pipeline {
    target: Target,
    settings: PipelineSettings,
    deps: PipelineDeps,
    dedup: DedupStore,
    last_processed: i64,
    last_post: Option<Instant>,
}

impl Pipeline {
    /// Builds a pipeline from the persisted checkpoint of `target`.
    ///
    /// Must complete before the first poll so a restart never replays a reply.
    pub async fn restore(
        target: Target,
        settings: PipelineSettings,
        deps: PipelineDeps,
    ) -> Result<Self, CoreError> {
        let mut dedup = DedupStore::new();
        let mut last_processed = 0;

        match deps.store.load(&target.key()).await? {
            Some(checkpoint) => {
                info!(
                    monitored = %target,
                    last_processed = checkpoint.last_processed,
                    replied = checkpoint.replied.len(),
                    "Restored checkpoint"
                );
                last_processed = checkpoint.last_processed;
                dedup.restore(checkpoint.replied);
            }
            None => info!(monitored = %target, "No checkpoint found, starting fresh"),
        }

        Ok(Self {
            target,
            settings,
            deps,
            dedup,
            last_processed,
            last_post: None,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn last_processed(&self) -> i64 {
        self.last_processed
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    /// Runs until cancelled, halted, or after one run when looping is off.
    pub async fn run(&mut self, cancel: CancellationToken) -> TargetReport {
        let mut report = TargetReport {
            target: self.target.clone(),
            runs: 0,
            summary: RunSummary::default(),
            last_processed: self.last_processed,
            halted: None,
        };

        loop {
            let run = self.run_once(&cancel).await;
            report.runs += 1;
            report.summary.absorb(&run.summary);
            report.last_processed = run.last_processed;

            let wait = match run.termination {
                Termination::Halted(e) => {
                    report.halted = Some(e);
                    break;
                }
                Termination::Cancelled => break,
                _ if !self.settings.loop_enabled => break,
                Termination::Deferred {
                    retry_in: Some(retry_in),
                } => retry_in.min(self.settings.poll_interval),
                _ => self.settings.poll_interval,
            };

            debug!(monitored = %self.target, "Next poll in {:?}", wait);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        report
    }

    /// One pass over the candidate stream.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, monitored = %self.target);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, cancel: &CancellationToken) -> RunReport {
        let mut state = RunState::new(run_id);
        self.prune();

        state.enter(Phase::Polling);
        let platform = Arc::clone(&self.deps.platform);
        let target = self.target.clone();
        let since = self.last_processed;
        info!("Polling {} since {}", target, since);
        let mut stream = platform.poll(&target, since);

        let mut termination = loop {
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break Termination::Cancelled,
                next = tokio::time::timeout(self.settings.poll_timeout, stream.next()) => next,
            };

            let item = match next {
                Err(_) => {
                    warn!("Poll stalled for {:?}", self.settings.poll_timeout);
                    break Termination::PollFailed(CoreError::Timeout {
                        seconds: self.settings.poll_timeout.as_secs(),
                    });
                }
                Ok(None) => {
                    if let Some(ts) = state.resolved_through {
                        self.advance_cursor(ts);
                    }
                    break Termination::Exhausted;
                }
                Ok(Some(Err(e))) => {
                    let e = CoreError::Platform(e);
                    e.log_warn();
                    break match e.classify() {
                        ErrorClass::PermanentGlobal => Termination::Halted(e),
                        _ => Termination::PollFailed(e),
                    };
                }
                Ok(Some(Ok(item))) => item,
            };

            if item.created_utc <= since {
                debug!(item_id = %item.id, "Ignoring item at or before the cursor");
                continue;
            }

            // Everything strictly older than this item is resolved.
            if let Some(ts) = state.resolved_through.filter(|ts| *ts < item.created_utc) {
                self.advance_cursor(ts);
            }

            match self.process_item(&mut state, &item, cancel).await {
                ItemOutcome::Resolved => {
                    state.resolved_through = Some(item.created_utc);
                    let succeeded = state.summary.succeeded;
                    if succeeded > 0 && succeeded >= self.settings.max_replies_per_run {
                        info!("Reached {} replies for this run", state.summary.succeeded);
                        break Termination::MaxReplies;
                    }
                }
                ItemOutcome::Stop(termination) => break termination,
            }
        };
        drop(stream);

        state.enter(Phase::Recording);
        if let Err(e) = self.commit(None, None).await {
            error!("Failed to persist checkpoint at end of run: {}", e);
            if !termination.is_halted() {
                termination = Termination::Halted(e);
            }
        }
        self.prune();

        state.enter(Phase::Complete);
        match &termination {
            Termination::Halted(e) => error!("Run halted: {} ({})", e, state.summary),
            other => info!("Run finished, {}: {}", other, state.summary),
        }

        RunReport {
            run_id,
            target,
            summary: state.summary,
            termination,
            last_processed: self.last_processed,
        }
    }

    async fn process_item(
        &mut self,
        state: &mut RunState,
        item: &CandidateItem,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        state.enter(Phase::Filtering);
        let now = self.deps.clock.now();
        let dedup = &self.dedup;
        let eligibility = evaluate(item, &self.settings.filter, now, |id| dedup.has_replied(id));

        match eligibility {
            Eligibility::Ineligible(SkipReason::TooFresh) => {
                // Later items are younger still; pick this one up on a later poll.
                let ready_in = item.created_utc + self.settings.filter.min_age - now;
                debug!(item_id = %item.id, "Item too fresh, waiting {}s", ready_in);
                state.summary.deferred += 1;
                return ItemOutcome::Stop(Termination::Deferred {
                    retry_in: Some(Duration::from_secs(ready_in.max(1) as u64)),
                });
            }
            Eligibility::Ineligible(reason) => {
                debug!(item_id = %item.id, %reason, "Skipping item");
                state.summary.skipped += 1;
                let record =
                    ReplyRecord::skipped(state.run_id, &self.target.key(), item, reason, now);
                return self.finish(record, None).await;
            }
            Eligibility::Eligible => {}
        }

        if state.summary.succeeded >= self.settings.max_replies_per_run {
            return ItemOutcome::Stop(Termination::MaxReplies);
        }

        state.enter(Phase::Generating);
        let text = match self.deps.generator.generate_reply(item).await {
            Ok(text) => text,
            Err(e) => {
                warn!(item_id = %item.id, "Generation failed: {}", e);
                state.summary.attempted += 1;
                state.summary.failed += 1;
                let record = ReplyRecord::failure(
                    state.run_id,
                    &self.target.key(),
                    item,
                    e.to_string(),
                    self.deps.clock.now(),
                );
                return self.finish(record, None).await;
            }
        };

        if !self.wait_for_spacing(cancel).await {
            return ItemOutcome::Stop(Termination::Cancelled);
        }

        state.enter(Phase::Rotating);
        let lease = match self.deps.accounts.next_account(self.deps.clock.now()).await {
            Selection::Selected(lease) => lease,
            Selection::NoneAvailable {
                all_excluded: true, ..
            } => {
                return ItemOutcome::Stop(Termination::Halted(CoreError::NoEligibleAccounts {
                    target: self.target.to_string(),
                }));
            }
            Selection::NoneAvailable { retry_in, .. } => {
                info!(item_id = %item.id, "No account available, deferring item");
                state.summary.deferred += 1;
                return ItemOutcome::Stop(Termination::Deferred { retry_in });
            }
        };

        state.enter(Phase::Posting);
        self.post(state, item, &text, lease).await
    }

    async fn post(
        &mut self,
        state: &mut RunState,
        item: &CandidateItem,
        text: &str,
        lease: AccountLease,
    ) -> ItemOutcome {
        let target_key = self.target.key();
        let account_id = lease.id().to_string();

        // Write-ahead marker: a crash after this point never leads to a second post.
        self.dedup.begin(item, &account_id, self.deps.clock.now());
        if let Err(e) = self.commit(None, Some(lease.account.clone())).await {
            self.dedup.abandon(&item.id);
            self.deps.accounts.release(lease.index).await;
            return ItemOutcome::Stop(Termination::Halted(e));
        }

        let platform = Arc::clone(&self.deps.platform);
        let report = self
            .deps
            .backoff
            .execute("post_reply", || platform.post_reply(&item.id, &account_id, text))
            .await;
        self.last_post = Some(Instant::now());

        state.enter(Phase::Recording);
        let now = self.deps.clock.now();
        match report.outcome {
            BackoffOutcome::Posted { reply_id } => {
                info!(item_id = %item.id, account = %account_id, "Reply posted");
                state.summary.attempted += 1;
                state.summary.succeeded += 1;
                let record = ReplyRecord::success(
                    state.run_id,
                    &target_key,
                    item,
                    &account_id,
                    text,
                    reply_id,
                    now,
                );
                self.dedup.record(&record);
                let account = self.deps.accounts.confirm_success(lease.index).await;
                self.finish(record, account).await
            }
            BackoffOutcome::Failed(FailureReason::Platform(e))
                if e.classify() == ErrorClass::PermanentGlobal =>
            {
                error!(account = %account_id, "Account rejected by platform: {}", e);
                state.summary.attempted += 1;
                state.summary.failed += 1;
                let record =
                    ReplyRecord::failure(state.run_id, &target_key, item, e.to_string(), now)
                        .with_account(&account_id)
                        .with_text(text);
                // Nothing was posted; the item stays eligible for another account.
                self.dedup.record(&record);
                let account = self.deps.accounts.exclude(lease.index).await;
                if let ItemOutcome::Stop(stop) = self.finish(record, account).await {
                    return ItemOutcome::Stop(stop);
                }
                ItemOutcome::Stop(Termination::Halted(CoreError::Platform(e)))
            }
            BackoffOutcome::Failed(reason) => {
                warn!(
                    item_id = %item.id,
                    account = %account_id,
                    attempts = report.attempts,
                    "Reply failed: {}",
                    reason.as_reason()
                );
                state.summary.attempted += 1;
                state.summary.failed += 1;
                let record =
                    ReplyRecord::failure(state.run_id, &target_key, item, reason.as_reason(), now)
                        .with_account(&account_id)
                        .with_text(text);
                if reason.is_indeterminate() {
                    self.dedup.mark_indeterminate(&item.id);
                } else {
                    self.dedup.record(&record);
                }
                let account = self.deps.accounts.confirm_failure(lease.index).await;
                self.finish(record, account).await
            }
        }
    }

    /// Persists a terminal record for the current item.
    async fn finish(&mut self, record: ReplyRecord, account: Option<Account>) -> ItemOutcome {
        match self.commit(Some(record), account).await {
            Ok(()) => ItemOutcome::Resolved,
            Err(e) => ItemOutcome::Stop(Termination::Halted(e)),
        }
    }

    /// Sleeps out the configured gap since the previous post. False if cancelled.
    async fn wait_for_spacing(&self, cancel: &CancellationToken) -> bool {
        let Some(last) = self.last_post else {
            return !cancel.is_cancelled();
        };
        let ready_at = last + self.settings.reply_delay;
        if ready_at > Instant::now() {
            debug!("Waiting {:?} before the next reply", ready_at - Instant::now());
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(ready_at) => true,
        }
    }

    fn advance_cursor(&mut self, ts: i64) {
        if ts > self.last_processed {
            self.last_processed = ts;
        }
    }

    fn prune(&mut self) {
        self.dedup
            .prune(self.last_processed - self.settings.retention_secs);
    }

    fn checkpoint(&self) -> TargetCheckpoint {
        TargetCheckpoint {
            target: self.target.key(),
            last_processed: self.last_processed,
            replied: self.dedup.snapshot(),
        }
    }

    async fn commit(
        &self,
        record: Option<ReplyRecord>,
        account: Option<Account>,
    ) -> Result<(), CoreError> {
        let commit = Commit {
            checkpoint: self.checkpoint(),
            record,
            account,
        };
        let store = Arc::clone(&self.deps.store);

        replybot_core::retry_with_backoff(
            || {
                let store = Arc::clone(&store);
                let commit = commit.clone();
                async move { store.commit(&commit).await }
            },
            self.settings.commit_retries,
            self.settings.commit_retry_delay,
        )
        .await
    }
}
