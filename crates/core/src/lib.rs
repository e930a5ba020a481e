// Flowtest Core - 核心数据模型与对话引擎组件
//!
//! 包含：
//! - Case: 测试用例、轮次记录、用例结果
//! - Config: YAML 配置与校验
//! - Conversation: 对话组到外部会话 ID 的映射与轮次历史
//! - Client: Chatflow API 客户端（blocking / streaming）
//! - Run: 运行状态、进度与统计
//! - Retry: 显式重试策略与停止信号

mod case;
mod config;
mod conversation;
mod retry;
mod run;
mod stop;

pub mod client;

pub use case::*;
pub use config::*;
pub use conversation::*;
pub use retry::*;
pub use run::*;
pub use stop::*;

pub use client::{
    ChatApi, ChatError, ChatReply, ChatRequest, ChatflowClient, ClientInfo, StreamAssembler,
    StreamState, StreamStep, extract_answer, extract_conversation_id, extract_message_id,
};
