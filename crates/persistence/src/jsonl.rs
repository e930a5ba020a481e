//! JSON Lines 结果文件
//!
//! 每个用例结果一行，追加后立即 fsync；运行报告写在同目录的
//! `<stem>.report.json`。
//!
//! 同一文件可以容纳多次运行的结果：`flush_all` 只替换其结果所属运行
//! (`run_id`) 的行，其余行原样保留。

use crate::store::{Result, ResultSink, RunReport};
use std::collections::HashSet;
use flowtest_core::CaseResult;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// JSON Lines 结果存储
#[derive(Debug)]
pub struct JsonlResultSink {
    /// 结果文件路径
    path: PathBuf,

    /// 报告文件路径
    report_path: PathBuf,

    /// 串行化写入
    write_lock: Mutex<()>,
}

impl JsonlResultSink {
    /// 创建存储（自动创建父目录）
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let report_path = report_path_for(&path);
        info!(path = %path.display(), "Writing results");
        Ok(Self {
            path,
            report_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }
}

/// `results/run.jsonl` → `results/run.report.json`
fn report_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "result".to_string());
    path.with_file_name(format!("{}.report.json", stem))
}

/// 原子写入：先写临时文件再 rename
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl ResultSink for JsonlResultSink {
    async fn append(&self, result: &CaseResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;
        debug!(case_id = %result.case_id, "Appended result");
        Ok(())
    }

    async fn flush_all(&self, results: &[CaseResult]) -> Result<()> {
        let runs: HashSet<&str> = results.iter().map(|r| r.run_id.as_str()).collect();

        let _guard = self.write_lock.lock().await;
        let existing = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut content = Vec::new();
        let mut kept = 0usize;
        for line in existing.lines().filter(|l| !l.trim().is_empty()) {
            if let Some(run_id) = line_run_id(line) {
                if runs.contains(run_id.as_str()) {
                    continue;
                }
            }
            content.extend_from_slice(line.as_bytes());
            content.push(b'\n');
            kept += 1;
        }
        for result in results {
            serde_json::to_writer(&mut content, result)?;
            content.push(b'\n');
        }

        write_atomic(&self.path, &content).await?;
        info!(
            count = results.len(),
            kept,
            path = %self.path.display(),
            "Rewrote result file"
        );
        Ok(())
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        let content = serde_json::to_vec_pretty(report)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.report_path, &content).await?;
        info!(run_id = %report.run_id, path = %self.report_path.display(), "Saved run report");
        Ok(())
    }
}

/// `run_id` of a stored line; unreadable lines belong to no run.
fn line_run_id(line: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("run_id")?
        .as_str()
        .map(str::to_string)
}

/// 读取结果文件（跳过空行）
pub async fn read_results(path: impl AsRef<Path>) -> Result<Vec<CaseResult>> {
    let content = fs::read_to_string(path.as_ref()).await?;
    let mut results = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        results.push(serde_json::from_str(line)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_core::{CallStatus, Progress, RunStatistics, RunStatus, TestCase};
    use tempfile::TempDir;

    fn result(index: usize, status: CallStatus) -> CaseResult {
        run_result("run-1", index, status)
    }

    fn run_result(run_id: &str, index: usize, status: CallStatus) -> CaseResult {
        let case = TestCase::new("g1", index as u32 + 1, format!("question {}", index));
        let mut result = CaseResult::pending(run_id, case.case_id(index), &case);
        result.status = status;
        result.reply = format!("reply {}", index);
        result
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_result() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlResultSink::create(dir.path().join("nested/out.jsonl"))
            .await
            .unwrap();

        sink.append(&result(0, CallStatus::Success)).await.unwrap();
        sink.append(&result(1, CallStatus::Failed)).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 2);

        let results = read_results(sink.path()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].case_id, "test_case_1");
        assert_eq!(results[1].status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn test_flush_all_replaces_partial_file() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlResultSink::create(dir.path().join("out.jsonl"))
            .await
            .unwrap();
        sink.append(&result(0, CallStatus::Success)).await.unwrap();

        let all = vec![
            result(0, CallStatus::Success),
            result(1, CallStatus::Success),
            result(2, CallStatus::Failed),
        ];
        sink.flush_all(&all).await.unwrap();

        let results = read_results(sink.path()).await.unwrap();
        assert_eq!(results, all);
        assert!(!dir.path().join("out.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_flush_all_keeps_other_runs() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlResultSink::create(dir.path().join("result.jsonl"))
            .await
            .unwrap();
        let earlier = vec![
            run_result("run-1", 0, CallStatus::Success),
            run_result("run-1", 1, CallStatus::Failed),
        ];
        for result in &earlier {
            sink.append(result).await.unwrap();
        }

        // 第二次运行只有部分结果写入成功
        let second = vec![
            run_result("run-2", 0, CallStatus::Success),
            run_result("run-2", 1, CallStatus::Success),
        ];
        sink.append(&second[0]).await.unwrap();
        sink.flush_all(&second).await.unwrap();

        let results = read_results(sink.path()).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(&results[..2], &earlier[..]);
        assert_eq!(&results[2..], &second[..]);

        // 再次回写同一运行不会产生重复行
        sink.flush_all(&second).await.unwrap();
        let results = read_results(sink.path()).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.run_id == "run-1").count(), 2);
    }

    #[tokio::test]
    async fn test_flush_all_keeps_unreadable_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let sink = JsonlResultSink::create(&path).await.unwrap();

        sink.flush_all(&[result(0, CallStatus::Success)]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "not json");
    }

    #[tokio::test]
    async fn test_record_run_writes_report_next_to_results() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlResultSink::create(dir.path().join("result_1.jsonl"))
            .await
            .unwrap();
        assert_eq!(sink.report_path(), dir.path().join("result_1.report.json"));

        let report = RunReport {
            run_id: "run-1".to_string(),
            config_name: "default".to_string(),
            status: RunStatus::Completed,
            progress: Progress::new(1),
            statistics: RunStatistics::default(),
            start_time: None,
            end_time: None,
            error_message: None,
            results: vec![result(0, CallStatus::Success)],
        };
        sink.record_run(&report).await.unwrap();

        let content = std::fs::read_to_string(sink.report_path()).unwrap();
        let parsed: RunReport = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, report);
    }

    #[tokio::test]
    async fn test_read_results_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_results(dir.path().join("missing.jsonl")).await.is_err());
    }
}
