//! 管线错误类型与阶段标识
//!
//! 错误分层：分类失败在本地恢复为兜底回答；检索/排序/合成失败降级继续并通过
//! STAGE_ERROR 事件暴露；持久化/日志失败记录后吞掉；未知动作标签立即失败。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 管线阶段：用于命令调用轨迹、STAGE_ERROR 负载与错误上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchHistory,
    ClassifyIntent,
    GenerateSearchTerms,
    RetrieveDocuments,
    RankDocuments,
    SynthesizeAnswer,
    RenderTemplate,
    PersistTurn,
    GenerateFollowups,
    LogActivity,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchHistory => "fetch_history",
            Stage::ClassifyIntent => "classify_intent",
            Stage::GenerateSearchTerms => "generate_search_terms",
            Stage::RetrieveDocuments => "retrieve_documents",
            Stage::RankDocuments => "rank_documents",
            Stage::SynthesizeAnswer => "synthesize_answer",
            Stage::RenderTemplate => "render_template",
            Stage::PersistTurn => "persist_turn",
            Stage::GenerateFollowups => "generate_followups",
            Stage::LogActivity => "log_activity",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 管线运行过程中可能出现的错误
///
/// 意图未解析（rephrased_intent 缺失）不是错误，是一条已定义的分支。
#[derive(Error, Debug)]
pub enum ChatError {
    /// 动作标签不属于任何已知变体；在注册表加载时立即失败，不允许进入调度
    #[error("Unrecognized action: {0}")]
    UnrecognizedAction(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Logging failed: {0}")]
    Logging(String),

    /// 客户端断开，剩余阶段被取消
    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}
