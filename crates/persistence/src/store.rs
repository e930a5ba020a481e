//! 结果存储抽象层
//!
//! 设计原则：
//! - 只追加：单个用例结果写入后不再修改
//! - 批量回写：增量写入无法确认时，运行结束后整体写入一次（只替换本次运行）
//! - 运行报告：每次运行结束记录汇总

use chrono::{DateTime, Utc};
use flowtest_core::{CaseResult, Progress, RunStatistics, RunStatus};
use serde::{Deserialize, Serialize};

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// 运行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,

    /// 使用的 API 配置名称
    pub config_name: String,

    pub status: RunStatus,

    pub progress: Progress,

    pub statistics: RunStatistics,

    pub start_time: Option<DateTime<Utc>>,

    pub end_time: Option<DateTime<Utc>>,

    /// 运行级错误信息
    pub error_message: Option<String>,

    pub results: Vec<CaseResult>,
}

/// 结果存储 Trait
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// 追加一个用例结果（返回前已落盘）
    async fn append(&self, result: &CaseResult) -> Result<()>;

    /// 整体写入一次运行的全部结果，替换该运行此前的增量写入；
    /// 其他运行已写入的结果保持不变
    async fn flush_all(&self, results: &[CaseResult]) -> Result<()>;

    /// 记录运行报告
    async fn record_run(&self, _report: &RunReport) -> Result<()> {
        Ok(())
    }
}
