//! Flowtest Persistence - 结果持久化层
//!
//! 支持的结果后端：
//! - JSON Lines 文件（逐条追加，默认）
//! - 内存（测试与嵌入使用）
//!
//! 设计原则：
//! - 每个用例结果在下一个用例开始前落盘
//! - 追加失败不终止运行，运行结束时整体回写
//! - 原子写入（临时文件 + rename）

pub mod jsonl;
pub mod memory;
pub mod store;

pub use jsonl::{JsonlResultSink, read_results};
pub use memory::MemoryResultSink;
pub use store::{Result, ResultSink, RunReport, SinkError};
