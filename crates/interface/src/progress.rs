//! Progress display and interactive run control
//!
//! - 进度条由 `subscribe` 的快照驱动
//! - 交互模式从 stdin 读取 pause / resume / stop / status / logs 命令
//! - 运行结束后输出汇总

use flowtest_runtime::{ExecutionController, LogLevel, RunError, RunSnapshot};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::str::FromStr;

const BAR_TEMPLATE: &str = "[{elapsed_precise}] {wide_bar} {pos}/{len} {msg}";

/// Progress bar for one run
#[derive(Debug)]
pub struct ProgressDisplay {
    bar: ProgressBar,
    last_log: Option<String>,
}

impl ProgressDisplay {
    pub fn new(total: usize) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        Self {
            bar: ProgressBar::new(total as u64).with_style(style),
            last_log: None,
        }
    }

    /// Hidden bar, for non-terminal output.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            last_log: None,
        }
    }

    pub fn update(&mut self, snapshot: &RunSnapshot) {
        self.bar.set_length(snapshot.progress.total as u64);
        self.bar.set_position(snapshot.progress.completed as u64);
        self.bar.set_message(status_line(snapshot));

        // 只打印新出现的警告 / 错误；上次的条目已被挤出时全部视为新条目
        let start = self
            .last_log
            .as_ref()
            .and_then(|last| snapshot.logs.iter().position(|entry| entry.id == *last))
            .map_or(0, |pos| pos + 1);
        for entry in &snapshot.logs[start..] {
            if matches!(entry.level, LogLevel::Warning | LogLevel::Error) {
                self.bar.println(format!("  {}", entry.message));
            }
        }
        if let Some(entry) = snapshot.logs.last() {
            self.last_log = Some(entry.id.clone());
        }
    }

    pub fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line.as_ref());
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

/// `<n> ok / <n> failed [status] <current case>`
pub fn status_line(snapshot: &RunSnapshot) -> String {
    let progress = &snapshot.progress;
    let mut line = format!(
        "{} ok / {} failed [{}]",
        progress.success, progress.failed, snapshot.status
    );
    if let Some(current) = &progress.current {
        line.push_str(&format!(" {}", current));
    }
    line
}

/// 交互命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractiveCommand {
    Pause,
    Resume,
    Stop,
    Status,
    Logs(usize),
    Help,
}

impl FromStr for InteractiveCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();
        match command.as_str() {
            "p" | "pause" => Ok(Self::Pause),
            "r" | "resume" => Ok(Self::Resume),
            "q" | "stop" => Ok(Self::Stop),
            "s" | "status" => Ok(Self::Status),
            "l" | "logs" => match parts.next() {
                Some(n) => n
                    .parse()
                    .map(Self::Logs)
                    .map_err(|_| format!("invalid log count '{}'", n)),
                None => Ok(Self::Logs(10)),
            },
            "h" | "help" | "?" => Ok(Self::Help),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{}', type 'help'", other)),
        }
    }
}

fn level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Success => "success",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

pub const HELP: &str = "commands: pause | resume | stop | status | logs [n] | help";

/// Applies an interactive command and returns the lines to show.
pub fn apply_command(
    controller: &ExecutionController,
    command: InteractiveCommand,
) -> Result<Vec<String>, RunError> {
    let lines = match command {
        InteractiveCommand::Pause => {
            controller.pause()?;
            vec!["Paused, type 'resume' to continue".to_string()]
        }
        InteractiveCommand::Resume => {
            controller.resume()?;
            vec!["Resumed".to_string()]
        }
        InteractiveCommand::Stop => {
            controller.stop()?;
            vec!["Stopping after the current call".to_string()]
        }
        InteractiveCommand::Status => {
            let snapshot = controller.status();
            vec![format!(
                "{}/{} {}",
                snapshot.progress.completed,
                snapshot.progress.total,
                status_line(&snapshot)
            )]
        }
        InteractiveCommand::Logs(limit) => controller
            .logs(limit)
            .into_iter()
            .map(|entry| {
                format!(
                    "{} {:<7} {}",
                    entry.timestamp.format("%H:%M:%S"),
                    level_label(entry.level),
                    entry.message
                )
            })
            .collect(),
        InteractiveCommand::Help => vec![HELP.to_string()],
    };
    Ok(lines)
}

/// 运行汇总
pub fn render_summary(snapshot: &RunSnapshot, output: &Path) -> String {
    let progress = &snapshot.progress;
    let stats = &snapshot.statistics;
    let conversations = &snapshot.conversations;

    let mut lines = vec![
        format!(
            "Run {} {}",
            snapshot.run_id.as_deref().unwrap_or("-"),
            snapshot.status
        ),
        format!(
            "  Cases:          {}/{} ({} succeeded, {} failed)",
            progress.completed, progress.total, progress.success, progress.failed
        ),
        format!("  Success rate:   {:.2}%", stats.success_rate),
        format!("  Total time:     {:.2}s", stats.total_time),
        format!(
            "  Response time:  avg {:.2}s, min {:.2}s, max {:.2}s",
            stats.avg_response_time, stats.min_response_time, stats.max_response_time
        ),
        format!(
            "  Conversations:  {} ({} turns, {:.2} per conversation)",
            conversations.conversation_count,
            conversations.turn_count,
            conversations.average_turns_per_conversation
        ),
    ];
    if let Some(error) = &snapshot.error_message {
        lines.push(format!("  Error:          {}", error));
    }
    lines.push(format!("  Results:        {}", output.display()));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_core::{CallStatus, Progress, RunStatus};

    #[test]
    fn test_parse_interactive_commands() {
        assert_eq!("pause".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Pause));
        assert_eq!(" R ".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Resume));
        assert_eq!("stop".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Stop));
        assert_eq!("status".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Status));
        assert_eq!("logs".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Logs(10)));
        assert_eq!("logs 3".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Logs(3)));
        assert_eq!("?".parse::<InteractiveCommand>(), Ok(InteractiveCommand::Help));
    }

    #[test]
    fn test_parse_invalid_commands() {
        assert!("".parse::<InteractiveCommand>().is_err());
        assert!("logs many".parse::<InteractiveCommand>().is_err());
        let err = "jump".parse::<InteractiveCommand>().unwrap_err();
        assert!(err.contains("jump"));
    }

    #[test]
    fn test_status_line() {
        let mut snapshot = RunSnapshot::idle();
        snapshot.status = RunStatus::Running;
        snapshot.progress = Progress::new(3);
        snapshot.progress.record(CallStatus::Success);
        snapshot.progress.current = Some("test_case_2".to_string());

        assert_eq!(status_line(&snapshot), "1 ok / 0 failed [running] test_case_2");
    }

    #[test]
    fn test_render_summary() {
        let mut snapshot = RunSnapshot::idle();
        snapshot.run_id = Some("run-1".to_string());
        snapshot.status = RunStatus::Error;
        snapshot.progress = Progress::new(2);
        snapshot.progress.record(CallStatus::Success);
        snapshot.statistics.success_rate = 100.0;
        snapshot.statistics.avg_response_time = 1.5;
        snapshot.error_message = Some("boom".to_string());

        let summary = render_summary(&snapshot, Path::new("results/out.jsonl"));
        assert!(summary.starts_with("Run run-1 error"));
        assert!(summary.contains("1/2 (1 succeeded, 0 failed)"));
        assert!(summary.contains("Success rate:   100.00%"));
        assert!(summary.contains("avg 1.50s"));
        assert!(summary.contains("Error:          boom"));
        assert!(summary.ends_with("results/out.jsonl"));
    }

    #[test]
    fn test_hidden_display_accepts_snapshots() {
        let mut display = ProgressDisplay::hidden();
        let mut snapshot = RunSnapshot::idle();
        snapshot.progress = Progress::new(4);
        display.update(&snapshot);
        display.finish();
    }
}
