//! Sequential pipeline runner.
//!
//! A [`PipelineRunner`] owns an ordered, non-empty list of stages fixed at
//! construction. Each run moves through
//!
//! ```text
//! Pending -> Running(0) -> Running(1) -> ... -> Done
//!                 \             \
//!                  `-> Failed    `-> Failed
//! ```
//!
//! Stage `n + 1` never starts before stage `n`'s output has been merged, and
//! the first failure ends the run with the partial state attached. Progress is
//! observable in two ways:
//!
//! - [`PipelineRunner::stream`] returns a [`RunStream`], a lazy, finite,
//!   non-restartable sequence of [`StageSnapshot`]s. Each call to
//!   [`RunStream::next`] executes exactly one stage.
//! - [`PipelineRunner::run_with_observer`] drives the same sequence to the end
//!   and hands every snapshot to a [`ProgressObserver`].
//!
//! Cancellation is cooperative: the caller's [`CancellationToken`] is checked
//! before every stage and while waiting between retry attempts. An in-flight
//! backend call is bounded by the invoker's timeout instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    ConfigurationError, LlmStage, ModelInvoker, PartialUpdate, PipelineError, PipelineState,
    RetryPolicy, RunFailure, Stage, StageDefinition, StageName, Timestamp,
};

/// Result of a complete run: the terminal state, or the tagged failure.
pub type RunOutcome = Result<PipelineState, RunFailure>;

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// How the runner reacts to retryable backend failures.
///
/// The default is a single attempt: the runner never retries unless the
/// caller opts in. Decode and schema failures are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per stage, including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the scheduled delay. A longer `Retry-After` hint
    /// from the backend still wins.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// A config that retries up to `max_attempts` total attempts with the
    /// default back-off schedule.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// `max_backoff` caps the scheduled delay only; a backend hint is a
    /// minimum and is never shortened.
    pub fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scheduled = self.initial_backoff.saturating_mul(1u32 << exponent);
        scheduled.min(self.max_backoff).max(hint.unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Where a run currently is in its state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    /// Created; no stage has started.
    Pending,
    /// Executing the stage at `index`.
    Running {
        /// Position in the stage list.
        index: usize,
        /// Stage being executed.
        stage: StageName,
    },
    /// Every stage succeeded.
    Done,
    /// The run stopped at `stage`.
    Failed {
        /// Stage that failed (or would have run next, for cancellation).
        stage: StageName,
    },
}

impl RunPhase {
    /// Whether the run has reached `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed { .. })
    }
}

/// The state right after a stage completed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    /// Position of the completed stage in the stage list.
    pub index: usize,
    /// The completed stage.
    pub stage: StageName,
    /// When the stage's output was merged.
    pub completed_at: Timestamp,
    /// State including the stage's output.
    pub state: PipelineState,
}

/// Receives one notification per completed stage.
pub trait ProgressObserver: Send {
    /// Called after a stage's output has been merged, before the next stage
    /// starts (and before the cancellation check that precedes it).
    fn on_stage_completed(&mut self, snapshot: &StageSnapshot);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&StageSnapshot) + Send,
{
    fn on_stage_completed(&mut self, snapshot: &StageSnapshot) {
        self(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs an ordered list of stages over a [`PipelineState`].
///
/// Cheap to clone; clones share the stage list. Independent runs may execute
/// concurrently because every run owns its own state.
#[derive(Clone)]
pub struct PipelineRunner {
    stages: Arc<[Arc<dyn Stage>]>,
    retry: RetryConfig,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("stages", &self.stage_names())
            .field("retry", &self.retry)
            .finish()
    }
}

impl PipelineRunner {
    /// Creates a runner over `stages`, in execution order.
    ///
    /// Fails if the list is empty or two stages share a name.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self, ConfigurationError> {
        if stages.is_empty() {
            return Err(ConfigurationError::new(
                "a pipeline needs at least one stage",
            ));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name().as_str()) {
                return Err(ConfigurationError::new(format!(
                    "stage '{}' appears more than once",
                    stage.name()
                )));
            }
        }
        Ok(Self {
            stages: stages.into(),
            retry: RetryConfig::default(),
        })
    }

    /// Creates a runner of [`LlmStage`]s sharing one invoker.
    pub fn from_definitions<I>(
        definitions: I,
        invoker: Arc<ModelInvoker>,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = StageDefinition>,
    {
        let stages = definitions
            .into_iter()
            .map(|definition| {
                Arc::new(LlmStage::new(Arc::new(definition), Arc::clone(&invoker)))
                    as Arc<dyn Stage>
            })
            .collect();
        Self::new(stages)
    }

    /// Replaces the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Retry configuration in effect.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Starts a run for `request` and returns its snapshot sequence.
    pub fn stream(&self, request: impl Into<String>, cancel: CancellationToken) -> RunStream {
        self.stream_at(PipelineState::new(request), 0, cancel)
    }

    /// Resumes a run from a state that already holds some stage outputs.
    ///
    /// The outputs must be a prefix of this runner's stage order; execution
    /// continues with the first stage not yet in `initial`. Any other state
    /// is rejected with a [`ConfigurationError`].
    pub fn stream_from(
        &self,
        initial: PipelineState,
        cancel: CancellationToken,
    ) -> Result<RunStream, ConfigurationError> {
        let completed = initial.outputs();
        if completed.len() > self.stages.len() {
            return Err(ConfigurationError::new(format!(
                "state holds {} stage outputs but the pipeline has {} stages",
                completed.len(),
                self.stages.len()
            )));
        }
        for (index, (output, stage)) in completed.iter().zip(self.stages.iter()).enumerate() {
            if &output.stage != stage.name() {
                return Err(ConfigurationError::new(format!(
                    "state output '{}' at position {index} does not match stage '{}'",
                    output.stage,
                    stage.name()
                )));
            }
        }
        let next_index = completed.len();
        Ok(self.stream_at(initial, next_index, cancel))
    }

    fn stream_at(
        &self,
        initial: PipelineState,
        next_index: usize,
        cancel: CancellationToken,
    ) -> RunStream {
        RunStream {
            runner: self.clone(),
            cancel,
            state: initial,
            next_index,
            phase: RunPhase::Pending,
            failure: None,
        }
    }

    /// Runs every stage and returns only the terminal outcome.
    pub async fn run(&self, request: impl Into<String>, cancel: &CancellationToken) -> RunOutcome {
        self.stream(request, cancel.clone()).finish().await
    }

    /// Runs every stage, notifying `observer` after each one.
    pub async fn run_with_observer(
        &self,
        request: impl Into<String>,
        cancel: &CancellationToken,
        observer: &mut dyn ProgressObserver,
    ) -> RunOutcome {
        let mut stream = self.stream(request, cancel.clone());
        while let Some(snapshot) = stream.next().await {
            observer.on_stage_completed(&snapshot);
        }
        stream.finish().await
    }

    /// Runs one stage, retrying retryable failures per [`RetryConfig`].
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        state: &PipelineState,
        cancel: &CancellationToken,
    ) -> Result<PartialUpdate, PipelineError> {
        let mut attempt = 1;
        loop {
            let err = match stage.run(state).await {
                Ok(update) => return Ok(update),
                Err(err) => err,
            };
            let RetryPolicy::Retryable { after } = err.retry_policy() else {
                return Err(err);
            };
            if attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = self.retry.delay_after(attempt, after);
            warn!(
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage failed; retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::CancellationRequested),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot sequence
// ---------------------------------------------------------------------------

/// Lazy sequence of per-stage snapshots for one run.
///
/// Nothing executes until [`RunStream::next`] is awaited; each call runs the
/// next stage. After the sequence ends, [`RunStream::finish`] returns the
/// terminal outcome. Calling `finish` early runs the remaining stages without
/// producing snapshots.
#[derive(Debug)]
pub struct RunStream {
    runner: PipelineRunner,
    cancel: CancellationToken,
    state: PipelineState,
    next_index: usize,
    phase: RunPhase,
    failure: Option<RunFailure>,
}

impl RunStream {
    /// Current phase.
    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    /// State accumulated so far.
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Executes the next stage and returns the resulting snapshot, or `None`
    /// once the run is `Done` or `Failed`.
    pub async fn next(&mut self) -> Option<StageSnapshot> {
        if self.phase.is_terminal() {
            return None;
        }
        let Some(stage) = self.runner.stages.get(self.next_index).cloned() else {
            info!(
                run_id = %self.state.run_id(),
                stages = self.state.completed_stages(),
                "run done"
            );
            self.phase = RunPhase::Done;
            return None;
        };
        let index = self.next_index;
        let name = stage.name().clone();

        if self.cancel.is_cancelled() {
            self.fail(name, PipelineError::CancellationRequested);
            return None;
        }

        self.phase = RunPhase::Running {
            index,
            stage: name.clone(),
        };
        let span = info_span!("stage", run_id = %self.state.run_id(), stage = %name, index);
        let outcome = async {
            info!("stage started");
            let update = self
                .runner
                .run_stage(stage.as_ref(), &self.state, &self.cancel)
                .await?;
            if update.stage != name {
                return Err(PipelineError::ForeignStageOutput {
                    expected: name.clone(),
                    actual: update.stage,
                });
            }
            self.state.with_update(update)
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(next) => {
                info!(run_id = %next.run_id(), stage = %name, index, "stage completed");
                self.state = next;
                self.next_index += 1;
                Some(StageSnapshot {
                    index,
                    stage: name,
                    completed_at: Timestamp::now(),
                    state: self.state.clone(),
                })
            }
            Err(err) => {
                self.fail(name, err);
                None
            }
        }
    }

    /// Drives the run to its terminal state and returns the outcome.
    pub async fn finish(mut self) -> RunOutcome {
        while self.next().await.is_some() {}
        match self.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(self.state),
        }
    }

    fn fail(&mut self, stage: StageName, error: PipelineError) {
        if matches!(error, PipelineError::CancellationRequested) {
            info!(run_id = %self.state.run_id(), stage = %stage, "run cancelled before stage");
        } else {
            error!(run_id = %self.state.run_id(), stage = %stage, error = %error, "run failed");
        }
        self.phase = RunPhase::Failed {
            stage: stage.clone(),
        };
        self.failure = Some(RunFailure {
            run_id: self.state.run_id(),
            stage,
            error,
            partial: self.state.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use crate::{BackendError, FieldType, SchemaContract};
    use async_trait::async_trait;
    use serde_json::json;

    fn text_stage(name: &str, inputs: &[&str]) -> StageDefinition {
        let schema = SchemaContract::builder(name)
            .required("text", FieldType::String, "")
            .build()
            .unwrap();
        StageDefinition::new(name, inputs, schema, |inputs| {
            let mut prompt = String::new();
            for path in ["request", "a.text", "b.text"] {
                if let Ok(text) = inputs.text(path) {
                    prompt.push_str(&text);
                    prompt.push('|');
                }
            }
            Ok(prompt)
        })
        .unwrap()
    }

    fn runner(backend: Arc<ScriptedBackend>) -> PipelineRunner {
        PipelineRunner::from_definitions(
            [
                text_stage("a", &["request"]),
                text_stage("b", &["a.text"]),
                text_stage("c", &["a.text", "b.text"]),
            ],
            Arc::new(ModelInvoker::new(backend)),
        )
        .unwrap()
    }

    fn scripted() -> ScriptedBackend {
        ScriptedBackend::new()
            .respond_json("a", json!({ "text": "A" }))
            .respond_json("b", json!({ "text": "B" }))
            .respond_json("c", json!({ "text": "C" }))
    }

    #[test]
    fn construction_validates_stage_list() {
        let invoker = Arc::new(ModelInvoker::new(Arc::new(ScriptedBackend::new())));
        let err = PipelineRunner::from_definitions(Vec::new(), invoker.clone()).unwrap_err();
        assert!(err.message.contains("at least one stage"));

        let err = PipelineRunner::from_definitions(
            [text_stage("a", &[]), text_stage("a", &[])],
            invoker,
        )
        .unwrap_err();
        assert!(err.message.contains("more than once"));
    }

    #[tokio::test]
    async fn threads_state_through_every_stage() {
        let backend = Arc::new(scripted());
        let state = runner(backend.clone())
            .run("go", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.completed_stages(), 3);
        let prompts: Vec<String> = backend.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["go|", "A|", "A|B|"]);
    }

    #[tokio::test]
    async fn single_stage_pipeline_is_supported() {
        let backend = Arc::new(ScriptedBackend::new().respond_json("a", json!({ "text": "A" })));
        let runner = PipelineRunner::from_definitions(
            [text_stage("a", &["request"])],
            Arc::new(ModelInvoker::new(backend)),
        )
        .unwrap();
        let state = runner.run("go", &CancellationToken::new()).await.unwrap();
        assert_eq!(state.get("a").unwrap().get_str("text"), Some("A"));
    }

    #[tokio::test]
    async fn stream_is_lazy_and_finite() {
        let backend = Arc::new(scripted());
        let mut stream = runner(backend.clone()).stream("go", CancellationToken::new());

        assert_eq!(stream.phase(), &RunPhase::Pending);
        assert_eq!(backend.total_calls(), 0);

        let first = stream.next().await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.stage.as_str(), "a");
        assert_eq!(backend.total_calls(), 1);

        let second = stream.next().await.unwrap();
        let third = stream.next().await.unwrap();
        assert_eq!(second.state.completed_stages(), 2);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.phase(), &RunPhase::Done);

        let terminal = stream.finish().await.unwrap();
        assert_eq!(terminal, third.state);
    }

    #[tokio::test]
    async fn failure_stops_the_run_with_partial_state() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .respond_json("a", json!({ "text": "A" }))
                .respond_json("b", json!({ "wrong": 1 }))
                .respond_json("c", json!({ "text": "C" })),
        );
        let failure = runner(backend.clone())
            .run("go", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.stage.as_str(), "b");
        let PipelineError::Schema(schema_err) = &failure.error else {
            panic!("expected schema error, got {:?}", failure.error);
        };
        assert_eq!(schema_err.missing_fields, vec!["text"]);
        assert_eq!(schema_err.unexpected_fields, vec!["wrong"]);
        assert!(failure.partial.contains("a"));
        assert!(!failure.partial.contains("b"));
        assert_eq!(backend.calls_for("c"), 0);
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_stages() {
        let backend = Arc::new(scripted());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut observer = move |snapshot: &StageSnapshot| {
            if snapshot.stage.as_str() == "a" {
                trigger.cancel();
            }
        };

        let failure = runner(backend.clone())
            .run_with_observer("go", &cancel, &mut observer)
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        assert_eq!(failure.stage.as_str(), "b");
        assert_eq!(failure.partial.completed_stages(), 1);
        assert_eq!(backend.calls_for("b"), 0);
        assert_eq!(backend.calls_for("c"), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let backend = Arc::new(scripted());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = runner(backend.clone()).run("go", &cancel).await.unwrap_err();
        assert!(failure.is_cancellation());
        assert_eq!(failure.stage.as_str(), "a");
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_when_configured() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(
                    "a",
                    BackendError::Unavailable {
                        message: "HTTP 503".into(),
                        retry: RetryPolicy::Retryable { after: None },
                    },
                )
                .respond_json("a", json!({ "text": "A" }))
                .respond_json("b", json!({ "text": "B" }))
                .respond_json("c", json!({ "text": "C" })),
        );
        let state = runner(backend.clone())
            .with_retry(RetryConfig::attempts(3))
            .run("go", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.completed_stages(), 3);
        assert_eq!(backend.calls_for("a"), 2);
    }

    #[tokio::test]
    async fn no_retries_by_default() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(
                    "a",
                    BackendError::Unavailable {
                        message: "connection refused".into(),
                        retry: RetryPolicy::Retryable { after: None },
                    },
                )
                .respond_json("a", json!({ "text": "A" })),
        );
        let failure = runner(backend.clone())
            .run("go", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::BackendUnavailable(_)));
        assert_eq!(backend.calls_for("a"), 1);
    }

    #[tokio::test]
    async fn schema_failures_are_never_retried() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .respond_json("a", json!({}))
                .respond_json("a", json!({ "text": "A" })),
        );
        let failure = runner(backend.clone())
            .with_retry(RetryConfig::attempts(5))
            .run("go", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::Schema(_)));
        assert_eq!(backend.calls_for("a"), 1);
    }

    #[test]
    fn backoff_doubles_and_respects_bounds() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.delay_after(1, None), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2, None), Duration::from_millis(200));
        assert_eq!(retry.delay_after(3, None), Duration::from_millis(350));
        assert_eq!(
            retry.delay_after(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn retry_after_hint_beyond_max_backoff_is_kept() {
        let retry = RetryConfig::attempts(3);
        assert_eq!(
            retry.delay_after(1, Some(Duration::from_secs(60))),
            Duration::from_secs(60)
        );
        assert_eq!(retry.delay_after(20, None), retry.max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_backoff() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(
                    "a",
                    BackendError::Unavailable {
                        message: "HTTP 429".into(),
                        retry: RetryPolicy::Retryable {
                            after: Some(Duration::from_secs(60)),
                        },
                    },
                )
                .respond_json("a", json!({ "text": "A" })),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let failure = runner(backend.clone())
            .with_retry(RetryConfig::attempts(3))
            .run("go", &cancel)
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        assert_eq!(failure.stage.as_str(), "a");
        assert_eq!(backend.calls_for("a"), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn stream_from_resumes_after_completed_stages() {
        let backend = Arc::new(scripted());
        let runner = runner(backend.clone());
        let mut first = runner.stream("go", CancellationToken::new());
        let after_a = first.next().await.unwrap().state;

        let resumed = runner
            .stream_from(after_a.clone(), CancellationToken::new())
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert_eq!(resumed.run_id(), after_a.run_id());
        assert_eq!(resumed.completed_stages(), 3);
        assert_eq!(backend.calls_for("a"), 1);
        assert_eq!(backend.calls_for("b"), 1);
        assert_eq!(backend.calls_for("c"), 1);
        assert_eq!(backend.requests()[1].prompt, "A|");
    }

    #[tokio::test]
    async fn stream_from_complete_state_is_already_done() {
        let backend = Arc::new(scripted());
        let runner = runner(backend.clone());
        let done = runner.run("go", &CancellationToken::new()).await.unwrap();

        let mut stream = runner
            .stream_from(done.clone(), CancellationToken::new())
            .unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(stream.phase(), &RunPhase::Done);
        assert_eq!(stream.finish().await.unwrap(), done);
        assert_eq!(backend.total_calls(), 3);
    }

    #[tokio::test]
    async fn stream_from_rejects_out_of_order_state() {
        let backend = Arc::new(scripted());
        let invoker = Arc::new(ModelInvoker::new(backend.clone()));
        let only_b = PipelineRunner::from_definitions([text_stage("b", &[])], invoker)
            .unwrap()
            .run("go", &CancellationToken::new())
            .await
            .unwrap();

        let err = runner(backend.clone())
            .stream_from(only_b, CancellationToken::new())
            .unwrap_err();
        assert!(err.message.contains("does not match stage 'a'"));
        assert_eq!(backend.calls_for("a"), 0);
    }

    struct MisnamedStage(StageName);

    #[async_trait]
    impl Stage for MisnamedStage {
        fn name(&self) -> &StageName {
            &self.0
        }

        async fn run(&self, _state: &PipelineState) -> Result<PartialUpdate, PipelineError> {
            let schema = SchemaContract::builder("x")
                .required("text", FieldType::String, "")
                .build()
                .unwrap();
            Ok(PartialUpdate::new(
                StageName::new("other").unwrap(),
                schema.validate(&json!({ "text": "t" })).unwrap(),
            ))
        }
    }

    #[tokio::test]
    async fn stage_may_not_write_another_stages_field() {
        let runner = PipelineRunner::new(vec![Arc::new(MisnamedStage(
            StageName::new("mine").unwrap(),
        ))])
        .unwrap();
        let failure = runner.run("go", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            failure.error,
            PipelineError::ForeignStageOutput { .. }
        ));
        assert_eq!(failure.partial.completed_stages(), 0);
    }
}
