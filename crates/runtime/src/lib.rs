//! Flowtest Runtime - 批量执行引擎
//!
//! 职责：
//! - 运行状态机（idle → running → paused / completed / stopped / error）
//! - 按顺序处理测试用例，保持对话会话连续
//! - 暂停 / 恢复 / 停止与实时快照
//!
//! 架构：
//! - ExecutionController: 对外接口，启动后台运行任务
//! - state: 单次运行的共享状态、运行日志环形缓冲区、快照

pub mod controller;
pub mod state;

pub use controller::{ClientFactory, ControllerOptions, ExecutionController, HttpClientFactory, RunError};
pub use state::{LogBuffer, LogEntry, LogLevel, RunSnapshot};
