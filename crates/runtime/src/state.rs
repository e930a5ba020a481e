//! Run state - 单次运行的共享状态
//!
//! 处理循环是唯一写者；状态查询通过加锁快照读取，不会看到中间状态。

use crate::controller::RunError;
use chrono::{DateTime, Utc};
use flowtest_core::{
    CaseResult, ConversationStatistics, ConversationStore, Progress, RunStatistics, RunStatus,
    StopHandle, StopToken, stop_pair,
};
use flowtest_persistence::RunReport;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Longest reply preview carried by a snapshot
const PREVIEW_CHARS: usize = 200;

/// 运行日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// 运行日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded ring buffer; the oldest entry is dropped first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 运行状态快照（不可变副本）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Option<String>,
    pub config_name: Option<String>,
    pub status: RunStatus,
    pub progress: Progress,
    pub statistics: RunStatistics,
    pub conversations: ConversationStatistics,
    /// Latest reply, cut to 200 characters
    pub current_response: Option<String>,
    pub logs: Vec<LogEntry>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl RunSnapshot {
    /// Snapshot before any run was started.
    pub fn idle() -> Self {
        Self {
            run_id: None,
            config_name: None,
            status: RunStatus::Idle,
            progress: Progress::default(),
            statistics: RunStatistics::default(),
            conversations: ConversationStatistics::default(),
            current_response: None,
            logs: Vec::new(),
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}

pub(crate) fn preview(reply: &str) -> String {
    if reply.chars().count() > PREVIEW_CHARS {
        let head: String = reply.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        reply.to_string()
    }
}

/// Mutable state of one run, guarded by [`RunShared`].
#[derive(Debug)]
pub(crate) struct RunState {
    pub run_id: String,
    pub config_name: String,
    pub status: RunStatus,
    pub progress: Progress,
    pub results: Vec<CaseResult>,
    pub conversations: ConversationStore,
    pub logs: LogBuffer,
    pub current_response: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    started: Instant,
    finished_after: Option<Duration>,
}

impl RunState {
    fn elapsed(&self) -> Duration {
        self.finished_after
            .unwrap_or_else(|| self.started.elapsed())
    }

    fn statistics(&self) -> RunStatistics {
        RunStatistics::compute(&self.results, &self.progress, self.elapsed())
    }

    fn finish(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
            self.finished_after = Some(self.started.elapsed());
        }
    }
}

/// 单次运行的共享句柄
#[derive(Debug)]
pub(crate) struct RunShared {
    state: Mutex<RunState>,
    status_tx: watch::Sender<RunStatus>,
    /// Set once the run report has been handed to the sink
    report_tx: watch::Sender<bool>,
    stop: StopHandle,
}

impl RunShared {
    pub fn new(run_id: String, config_name: String, total: usize, log_capacity: usize) -> Self {
        let (stop, _) = stop_pair();
        let (status_tx, _) = watch::channel(RunStatus::Running);
        let (report_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(RunState {
                run_id,
                config_name,
                status: RunStatus::Running,
                progress: Progress::new(total),
                results: Vec::new(),
                conversations: ConversationStore::new(),
                logs: LogBuffer::new(log_capacity),
                current_response: None,
                start_time: Utc::now(),
                end_time: None,
                error_message: None,
                started: Instant::now(),
                finished_after: None,
            }),
            status_tx,
            report_tx,
            stop,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.token()
    }

    pub fn status_receiver(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    /// State-machine step requested by `operation`.
    pub fn transition(&self, operation: &'static str, next: RunStatus) -> Result<(), RunError> {
        let mut state = self.lock();
        if !state.status.can_transition_to(next) {
            return Err(RunError::InvalidState {
                operation,
                status: state.status,
            });
        }
        state.status = next;
        if next.is_terminal() {
            state.finish();
        }
        if next == RunStatus::Stopped {
            self.stop.stop();
        }
        self.status_tx.send_replace(next);
        Ok(())
    }

    /// Moves a running run to `error`.
    pub fn fail(&self, message: String) {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = RunStatus::Error;
            state.error_message = Some(message.clone());
            state.finish();
            state.logs.push(LogLevel::Error, format!("Run failed: {}", message));
        }
        error!(error = %message, "Run failed");
        self.stop.stop();
        self.status_tx.send_replace(RunStatus::Error);
    }

    /// Waits while paused; returns the status that ended the wait.
    pub async fn checkpoint(&self) -> RunStatus {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|status| *status != RunStatus::Paused).await {
            Ok(status) => *status,
            Err(_) => RunStatus::Stopped,
        }
    }

    pub fn mark_report_written(&self) {
        self.report_tx.send_replace(true);
    }

    pub async fn report_written(&self) {
        let mut rx = self.report_tx.subscribe();
        let _ = rx.wait_for(|written| *written).await;
    }

    /// Run log plus `tracing`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.lock().logs.push(level, message);
    }

    /// Run log only.
    pub fn push_log(&self, level: LogLevel, message: impl Into<String>) {
        self.lock().logs.push(level, message);
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.lock();
        RunSnapshot {
            run_id: Some(state.run_id.clone()),
            config_name: Some(state.config_name.clone()),
            status: state.status,
            progress: state.progress.clone(),
            statistics: state.statistics(),
            conversations: state.conversations.statistics(),
            current_response: state.current_response.clone(),
            logs: state.logs.recent(usize::MAX),
            start_time: Some(state.start_time),
            end_time: state.end_time,
            error_message: state.error_message.clone(),
        }
    }

    pub fn report(&self) -> RunReport {
        let state = self.lock();
        RunReport {
            run_id: state.run_id.clone(),
            config_name: state.config_name.clone(),
            status: state.status,
            progress: state.progress.clone(),
            statistics: state.statistics(),
            start_time: Some(state.start_time),
            end_time: state.end_time,
            error_message: state.error_message.clone(),
            results: state.results.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_drops_oldest() {
        let mut logs = LogBuffer::new(3);
        for i in 0..5 {
            logs.push(LogLevel::Info, format!("entry {}", i));
        }
        assert_eq!(logs.len(), 3);
        let messages: Vec<String> = logs.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);

        let last: Vec<String> = logs.recent(2).into_iter().map(|e| e.message).collect();
        assert_eq!(last, vec!["entry 3", "entry 4"]);
        assert!(logs.recent(0).is_empty());
    }

    #[test]
    fn test_log_entries_have_unique_ids() {
        let mut logs = LogBuffer::new(10);
        logs.push(LogLevel::Success, "a");
        logs.push(LogLevel::Warning, "b");
        let entries = logs.recent(10);
        assert_ne!(entries[0].id, entries[1].id);
        assert_eq!(entries[1].level, LogLevel::Warning);
    }

    #[test]
    fn test_preview_truncates_long_replies() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(250);
        let cut = preview(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 203);
    }

    #[tokio::test]
    async fn test_transition_rules() {
        let shared = RunShared::new("run-1".into(), "default".into(), 3, 10);
        assert_eq!(shared.status(), RunStatus::Running);

        assert!(shared.transition("resume", RunStatus::Running).is_err());
        shared.transition("pause", RunStatus::Paused).unwrap();
        let err = shared.transition("pause", RunStatus::Paused).unwrap_err();
        assert!(matches!(
            err,
            RunError::InvalidState {
                operation: "pause",
                status: RunStatus::Paused
            }
        ));

        let token = shared.stop_token();
        shared.transition("stop", RunStatus::Stopped).unwrap();
        assert!(token.is_stopped());
        assert!(shared.snapshot().end_time.is_some());
        assert!(shared.transition("resume", RunStatus::Running).is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_resume() {
        let shared = std::sync::Arc::new(RunShared::new("run-1".into(), "default".into(), 1, 10));
        shared.transition("pause", RunStatus::Paused).unwrap();

        let waiter = tokio::spawn({
            let shared = shared.clone();
            async move { shared.checkpoint().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shared.transition("resume", RunStatus::Running).unwrap();
        assert_eq!(waiter.await.unwrap(), RunStatus::Running);
    }

    #[tokio::test]
    async fn test_fail_is_ignored_after_terminal() {
        let shared = RunShared::new("run-1".into(), "default".into(), 1, 10);
        shared.transition("stop", RunStatus::Stopped).unwrap();
        shared.fail("late".to_string());
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert!(snapshot.error_message.is_none());
    }
}
