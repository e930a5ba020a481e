//! Flowtest Interface - 交互层
//!
//! 职责：
//! - CLI 命令行工具 (run / ping / check-config)
//! - 用例文件加载
//! - 进度显示与交互式运行控制
//!
//! 架构：
//! - cli: 命令解析与分发，初始化日志
//! - loader: JSON 用例文件
//! - progress: 进度条、交互命令、运行汇总

pub mod cli;
pub mod loader;
pub mod progress;

#[cfg(test)]
mod cli_tests;

pub use cli::{CliError, DEFAULT_CONFIG, run_cli};
pub use loader::{LoadError, load_cases};
pub use progress::{InteractiveCommand, ProgressDisplay, render_summary};
