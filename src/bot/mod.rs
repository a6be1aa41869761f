//! 对话核心：管线编排、事件协议、错误与进度

pub mod error;
pub mod events;
pub mod pipeline;
pub mod progress;

pub use error::{ChatError, Stage};
pub use events::{validate_sequence, ChatEvent, EventKind, ProtocolState, ProtocolViolation};
pub use pipeline::{ChatPipeline, ChatbotResponse, EventSink, FALLBACK_ANSWER};
pub use progress::{FixedProgress, ProgressEstimator, RandomProgress};
