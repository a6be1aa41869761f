//! Tuvan - 高校招生咨询机器人后端
//!
//! 模块划分：
//! - **bot**: 对话管线编排、事件协议、错误与进度
//! - **commands**: 后端操作的统一分发面与调用追踪
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **intents**: 意图注册表与动作分发
//! - **knowledge**: 向量库检索（Chroma + 嵌入）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **prompts**: 提示词模板与标签抽取
//! - **server**: HTTP 服务（流式 / 缓冲两种送达）
//! - **store**: 会话、活动日志与反馈的 SQLite 持久化

pub mod bot;
pub mod commands;
pub mod config;
pub mod intents;
pub mod knowledge;
pub mod llm;
pub mod prompts;
pub mod server;
pub mod store;

pub use bot::{ChatPipeline, ChatbotResponse, EventSink};
pub use commands::{CommandExecutor, DefaultCommandExecutor};
