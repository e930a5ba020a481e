//! 内存结果存储

use crate::store::{Result, ResultSink, RunReport, SinkError};
use flowtest_core::CaseResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// 内存结果存储，可注入追加失败
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    appended: Mutex<Vec<CaseResult>>,
    flushed: Mutex<Option<Vec<CaseResult>>>,
    reports: Mutex<Vec<RunReport>>,
    fail_appends: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 `append` 全部返回 IO 错误
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_fail_appends(true);
        sink
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn appended(&self) -> Vec<CaseResult> {
        lock(&self.appended).clone()
    }

    pub fn append_count(&self) -> usize {
        lock(&self.appended).len()
    }

    /// `flush_all` 最后一次写入的内容
    pub fn flushed(&self) -> Option<Vec<CaseResult>> {
        lock(&self.flushed).clone()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        lock(&self.reports).clone()
    }
}

#[async_trait::async_trait]
impl ResultSink for MemoryResultSink {
    async fn append(&self, result: &CaseResult) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(SinkError::Io(std::io::Error::other("append disabled")));
        }
        lock(&self.appended).push(result.clone());
        Ok(())
    }

    async fn flush_all(&self, results: &[CaseResult]) -> Result<()> {
        *lock(&self.flushed) = Some(results.to_vec());
        Ok(())
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        lock(&self.reports).push(report.clone());
        Ok(())
    }
}
