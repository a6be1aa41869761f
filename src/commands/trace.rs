//! 命令调用追踪
//!
//! 管线每调一次后端命令就记一条：阶段、耗时、错误。
//! 整轮结束后序列化进活动日志的 calls 字段。

use std::time::Duration;

use serde::Serialize;

use crate::bot::error::Stage;

/// 单次命令调用记录
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub stage: Stage,
    /// 耗时（秒）
    pub perf: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 一轮对话内的调用清单，按发生顺序追加
#[derive(Debug, Default)]
pub struct CommandTrace {
    calls: Vec<CallRecord>,
}

impl CommandTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: Stage, elapsed: Duration, error: Option<String>) {
        self.calls.push(CallRecord {
            stage,
            perf: elapsed.as_secs_f64(),
            error,
        });
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.calls).unwrap_or(serde_json::Value::Null)
    }
}
