//! 执行运行的数据模型：状态、进度、统计

use crate::case::{CallStatus, CaseResult};
use crate::conversation::round2;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Run state
///
/// `idle → running → {paused, completed, stopped, error}`,
/// `paused → {running, stopped}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Error
        )
    }

    /// Running or paused
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Idle, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Stopped)
                | (RunStatus::Running, RunStatus::Error)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Paused, RunStatus::Stopped)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 进度计数器
///
/// `success + failed == completed <= total` holds after every update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub success: usize,
    pub failed: usize,
    /// Case currently being processed
    pub current: Option<String>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, status: CallStatus) {
        if self.completed >= self.total {
            return;
        }
        self.completed += 1;
        match status {
            CallStatus::Success => self.success += 1,
            CallStatus::Failed => self.failed += 1,
        }
    }

    /// Completed share as a percentage
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            round2(self.completed as f64 / self.total as f64 * 100.0)
        }
    }
}

/// 运行统计（响应时间只统计成功调用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Seconds since the run started
    pub total_time: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    /// Percentage of completed cases that succeeded
    pub success_rate: f64,
}

impl RunStatistics {
    pub fn compute(results: &[CaseResult], progress: &Progress, elapsed: Duration) -> Self {
        let latencies: Vec<f64> = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.latency_secs)
            .collect();

        let (avg, min, max) = if latencies.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = latencies.iter().sum();
            let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
            let max = latencies.iter().copied().fold(0.0, f64::max);
            (sum / latencies.len() as f64, min, max)
        };

        let success_rate = if progress.completed > 0 {
            round2(progress.success as f64 / progress.completed as f64 * 100.0)
        } else {
            0.0
        };

        Self {
            total_time: round2(elapsed.as_secs_f64()),
            avg_response_time: round2(avg),
            min_response_time: round2(min),
            max_response_time: round2(max),
            success_rate,
        }
    }
}
