//! Execution controller - 批量执行状态机
//!
//! 职责：
//! - 按提交顺序逐个处理测试用例（同一对话组的轮次依赖前一轮的会话 ID）
//! - 暂停 / 恢复 / 停止
//! - 实时状态快照与订阅
//! - 结果逐条写入存储，必要时整体回写

use crate::state::{LogEntry, LogLevel, RunShared, RunSnapshot, preview};
use flowtest_core::{
    ApiConfig, CallStatus, CaseResult, ChatApi, ChatRequest, ChatflowClient, ConfigError,
    ExecutionConfig, RetryOutcome, RetryPolicy, RunStatus, StopToken, TestCase, TurnRecord,
    validate_case_sequence,
};
use flowtest_persistence::ResultSink;
use futures::Stream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 运行控制错误
#[derive(Debug, Error)]
pub enum RunError {
    #[error("A run is already {0}")]
    Conflict(RunStatus),

    #[error("Invalid test cases: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: RunStatus,
    },
}

/// Builds the chat client for a run.
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &ApiConfig) -> Result<Arc<dyn ChatApi>, ConfigError>;
}

/// Factory producing [`ChatflowClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn create(&self, config: &ApiConfig) -> Result<Arc<dyn ChatApi>, ConfigError> {
        Ok(Arc::new(ChatflowClient::new(config.clone())?))
    }
}

/// 控制器选项
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    pub retry_client_errors: bool,
    pub inter_case_delay: Duration,
    pub log_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ControllerOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            retry_client_errors: config.retry_client_errors,
            inter_case_delay: config.inter_case_delay(),
            log_capacity: config.log_capacity,
        }
    }
}

/// Shared between the controller and a run's background task.
struct RunDeps {
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn ResultSink>,
    options: ControllerOptions,
}

/// 执行控制器
pub struct ExecutionController {
    deps: Arc<RunDeps>,
    current: Mutex<Option<Arc<RunShared>>>,
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("options", &self.deps.options)
            .field("status", &self.status().status)
            .finish_non_exhaustive()
    }
}

impl ExecutionController {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        sink: Arc<dyn ResultSink>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            deps: Arc::new(RunDeps {
                factory,
                sink,
                options,
            }),
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Arc<RunShared>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Starts a run in the background and returns its id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, cases: Vec<TestCase>, config: ApiConfig) -> Result<String, RunError> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(run) = current.as_ref() {
            let status = run.status();
            if status.is_active() {
                return Err(RunError::Conflict(status));
            }
        }
        if cases.is_empty() {
            return Err(RunError::Validation("no test cases".to_string()));
        }
        validate_case_sequence(&cases).map_err(|errors| RunError::Validation(errors.join("; ")))?;
        config.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let shared = Arc::new(RunShared::new(
            run_id.clone(),
            config.name.clone(),
            cases.len(),
            self.deps.options.log_capacity,
        ));
        shared.log(
            LogLevel::Info,
            format!(
                "Run {} started: {} cases, {} mode",
                run_id,
                cases.len(),
                config.response_mode
            ),
        );
        *current = Some(shared.clone());
        drop(current);

        let deps = self.deps.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(execute(shared.clone(), deps.clone(), cases, config));
            if let Err(e) = worker.await {
                shared.fail(format!("internal error: {}", e));
                record_report(&shared, deps.sink.as_ref()).await;
            }
        });

        Ok(run_id)
    }

    fn active_run(&self, operation: &'static str) -> Result<Arc<RunShared>, RunError> {
        self.current().ok_or(RunError::InvalidState {
            operation,
            status: RunStatus::Idle,
        })
    }

    pub fn pause(&self) -> Result<(), RunError> {
        let run = self.active_run("pause")?;
        run.transition("pause", RunStatus::Paused)?;
        run.log(LogLevel::Warning, "Run paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), RunError> {
        let run = self.active_run("resume")?;
        run.transition("resume", RunStatus::Running)?;
        run.log(LogLevel::Info, "Run resumed");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), RunError> {
        let run = self.active_run("stop")?;
        run.transition("stop", RunStatus::Stopped)?;
        run.log(LogLevel::Warning, "Run stopped");
        Ok(())
    }

    pub fn status(&self) -> RunSnapshot {
        self.current()
            .map(|run| run.snapshot())
            .unwrap_or_else(RunSnapshot::idle)
    }

    /// Up to `limit` most recent run log entries, oldest first.
    pub fn logs(&self, limit: usize) -> Vec<LogEntry> {
        self.current()
            .map(|run| run.lock().logs.recent(limit))
            .unwrap_or_default()
    }

    /// Results recorded so far by the current run.
    pub fn results(&self) -> Vec<CaseResult> {
        self.current()
            .map(|run| run.lock().results.clone())
            .unwrap_or_default()
    }

    /// Snapshots now and then every `interval`, ending after the first
    /// terminal snapshot.
    pub fn subscribe(
        &self,
        interval: Duration,
    ) -> impl Stream<Item = RunSnapshot> + Send + 'static {
        let run = self.current();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        futures::stream::unfold((run, ticker, false), |(run, mut ticker, done)| async move {
            if done {
                return None;
            }
            ticker.tick().await;
            let snapshot = run
                .as_ref()
                .map(|run| run.snapshot())
                .unwrap_or_else(RunSnapshot::idle);
            let done = snapshot.status.is_terminal() || snapshot.status == RunStatus::Idle;
            Some((snapshot, (run, ticker, done)))
        })
    }

    /// Resolves with the final snapshot once the current run ends.
    pub async fn wait(&self) -> RunSnapshot {
        let Some(run) = self.current() else {
            return RunSnapshot::idle();
        };
        let mut rx = run.status_receiver();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        // The report is written after the terminal transition.
        run.report_written().await;
        run.snapshot()
    }
}

enum CaseOutcome {
    Recorded(CaseResult),
    /// Stop requested while the call was in flight
    Abandoned,
}

/// Background task of one run.
async fn execute(
    shared: Arc<RunShared>,
    deps: Arc<RunDeps>,
    cases: Vec<TestCase>,
    config: ApiConfig,
) {
    let client = match deps.factory.create(&config) {
        Ok(client) => client,
        Err(e) => {
            shared.fail(format!("configuration error: {}", e));
            record_report(&shared, deps.sink.as_ref()).await;
            return;
        }
    };

    let stop = shared.stop_token();
    let total = cases.len();
    let mut append_failed = false;

    for (index, case) in cases.iter().enumerate() {
        if shared.checkpoint().await != RunStatus::Running {
            break;
        }

        let case_id = case.case_id(index);
        {
            let mut state = shared.lock();
            state.progress.current = Some(case_id.clone());
        }
        shared.log(
            LogLevel::Info,
            format!(
                "Processing {} ({}/{}): group '{}' turn {}",
                case_id,
                index + 1,
                total,
                case.group,
                case.turn
            ),
        );

        let outcome = process_case(
            &shared,
            &deps.options,
            client.as_ref(),
            &config,
            &stop,
            case,
            case_id,
        )
        .await;
        let result = match outcome {
            CaseOutcome::Recorded(result) => result,
            CaseOutcome::Abandoned => break,
        };
        if !record_result(&shared, &result) {
            debug!(case_id = %result.case_id, "Discarding result received after stop");
            break;
        }

        if let Err(e) = deps.sink.append(&result).await {
            append_failed = true;
            shared.log(
                LogLevel::Warning,
                format!("Failed to persist {}: {}", result.case_id, e),
            );
        }

        if index + 1 < total {
            tokio::select! {
                _ = tokio::time::sleep(deps.options.inter_case_delay) => {}
                _ = stop.stopped() => break,
            }
        }
    }

    // A pause after the last case holds completion until resume or stop.
    if shared.checkpoint().await == RunStatus::Running
        && shared.transition("complete", RunStatus::Completed).is_ok()
    {
        let snapshot = shared.snapshot();
        shared.log(
            LogLevel::Success,
            format!(
                "Run completed: {} succeeded, {} failed",
                snapshot.progress.success, snapshot.progress.failed
            ),
        );
    }
    {
        let mut state = shared.lock();
        state.progress.current = None;
    }

    if append_failed {
        let results = shared.lock().results.clone();
        match deps.sink.flush_all(&results).await {
            Ok(()) => shared.log(
                LogLevel::Info,
                format!("Rewrote {} results after append failures", results.len()),
            ),
            Err(e) => shared.log(LogLevel::Error, format!("Failed to save results: {}", e)),
        }
    }

    record_report(&shared, deps.sink.as_ref()).await;
}

/// One case: ordering check, call through the retry policy, outcome.
async fn process_case(
    shared: &RunShared,
    options: &ControllerOptions,
    client: &dyn ChatApi,
    config: &ApiConfig,
    stop: &StopToken,
    case: &TestCase,
    case_id: String,
) -> CaseOutcome {
    let run_id = shared.lock().run_id.clone();
    let mut result = CaseResult::pending(&run_id, case_id, case);

    let (sequence, external_id) = {
        let state = shared.lock();
        (
            state
                .conversations
                .validate_turn_sequence(&case.group, case.turn),
            state
                .conversations
                .external_id(&case.group)
                .map(str::to_string),
        )
    };
    if let Err(e) = sequence {
        result.error = Some(e.to_string());
        return CaseOutcome::Recorded(result);
    }

    let request = ChatRequest::new(case.question.clone(), config.user_id.clone())
        .with_conversation_id(external_id)
        .with_inputs(case.inputs.clone());

    let started = Instant::now();
    let outcome = options
        .retry
        .run(
            stop,
            |_| client.send(&request),
            |e| e.is_retryable(options.retry_client_errors),
            |retry| {
                shared.push_log(
                    LogLevel::Warning,
                    format!(
                        "{} attempt {}/{} failed, retrying in {:.1}s: {}",
                        result.case_id,
                        retry.attempt,
                        retry.max_attempts,
                        retry.delay.as_secs_f64(),
                        retry.error
                    ),
                )
            },
        )
        .await;

    match outcome {
        Ok(RetryOutcome::Completed { value: reply, attempts }) => {
            if attempts > 1 {
                debug!(case_id = %result.case_id, attempts, "Succeeded after retry");
            }
            result.status = CallStatus::Success;
            result.reply = reply.answer;
            result.latency_secs = reply.elapsed.as_secs_f64();
            result.external_conversation_id = reply.conversation_id;
            result.message_id = reply.message_id;
        }
        Ok(RetryOutcome::Aborted { .. }) => return CaseOutcome::Abandoned,
        Err(e) => {
            result.status = CallStatus::Failed;
            result.error = Some(e.to_string());
            result.latency_secs = started.elapsed().as_secs_f64();
        }
    }

    if stop.is_stopped() {
        return CaseOutcome::Abandoned;
    }
    CaseOutcome::Recorded(result)
}

/// Folds a result into the run; `false` when the run was stopped meanwhile.
fn record_result(shared: &RunShared, result: &CaseResult) -> bool {
    let message = {
        let mut state = shared.lock();
        if state.status == RunStatus::Stopped {
            return false;
        }

        if result.is_success() {
            if let Some(id) = result.external_conversation_id.as_deref() {
                state.conversations.set_external_id(&result.group, id);
            }
            state.current_response = Some(preview(&result.reply));
        }
        let record: TurnRecord = result.to_turn_record();
        if let Err(e) = state.conversations.append_turn(&result.group, record) {
            debug!(error = %e, "Turn not added to conversation history");
        }
        state.progress.record(result.status);
        state.results.push(result.clone());

        match &result.error {
            None => (
                LogLevel::Success,
                format!("{} succeeded in {:.2}s", result.case_id, result.latency_secs),
            ),
            Some(error) => (
                LogLevel::Error,
                format!("{} failed: {}", result.case_id, error),
            ),
        }
    };
    shared.log(message.0, message.1);
    true
}

async fn record_report(shared: &RunShared, sink: &dyn ResultSink) {
    let report = shared.report();
    if let Err(e) = sink.record_run(&report).await {
        warn!(error = %e, "Failed to save run report");
        shared.push_log(LogLevel::Error, format!("Failed to save run report: {}", e));
    }
    info!(run_id = %report.run_id, status = %report.status, "Run finished");
    shared.mark_report_written();
}
