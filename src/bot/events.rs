//! 管线过程事件：封闭事件集与首次出现顺序协议
//!
//! 事件只承载进度，不承载终值：ChatbotResponse 是管线的返回值而非事件。
//! 顺序（首次出现的严格偏序）：
//! `INTENT → [SEARCH_TERM → DOCUMENTS → RANKING_DOCUMENTS] → BEGIN_ANSWER → ANSWERING* → END_ANSWER → FOLLOWUP_QUESTIONS`
//! 方括号内三元组仅出现在 SearchDocs 分支；意图未解析时只发 INTENT。
//! STAGE_ERROR 可出现在 INTENT 之后任意位置，不推进顺序。

use serde::Serialize;
use thiserror::Error;

use crate::bot::error::Stage;

/// 事件种类（线上帧中的 event 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Intent,
    SearchTerm,
    Documents,
    RankingDocuments,
    BeginAnswer,
    Answering,
    EndAnswer,
    FollowupQuestions,
    StageError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Intent => "INTENT",
            EventKind::SearchTerm => "SEARCH_TERM",
            EventKind::Documents => "DOCUMENTS",
            EventKind::RankingDocuments => "RANKING_DOCUMENTS",
            EventKind::BeginAnswer => "BEGIN_ANSWER",
            EventKind::Answering => "ANSWERING",
            EventKind::EndAnswer => "END_ANSWER",
            EventKind::FollowupQuestions => "FOLLOWUP_QUESTIONS",
            EventKind::StageError => "STAGE_ERROR",
        }
    }
}

/// 单条过程事件：种类 + 文本负载
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// 改写后的意图，或意图未解析时的兜底话术
    Intent(String),
    /// 搜索横幅（SearchDocs 分支开始）
    SearchTerm(String),
    /// 检索进度（装饰性百分比）
    Documents(String),
    /// 排序进度（装饰性百分比）
    RankingDocuments(String),
    /// 回答开始横幅
    BeginAnswer(String),
    /// 单个回答分片（流式 token 或模板的 3 字符分片）
    Answering(String),
    /// 完整回答（保证恰好一次，降级路径亦然）
    EndAnswer(String),
    /// 恰好 3 个追问，以固定分隔符拼接
    FollowupQuestions(String),
    /// 下游命令失败的显式信号：降级继续，但不可与成功混淆
    StageError { stage: Stage, reason: String },
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::Intent(_) => EventKind::Intent,
            ChatEvent::SearchTerm(_) => EventKind::SearchTerm,
            ChatEvent::Documents(_) => EventKind::Documents,
            ChatEvent::RankingDocuments(_) => EventKind::RankingDocuments,
            ChatEvent::BeginAnswer(_) => EventKind::BeginAnswer,
            ChatEvent::Answering(_) => EventKind::Answering,
            ChatEvent::EndAnswer(_) => EventKind::EndAnswer,
            ChatEvent::FollowupQuestions(_) => EventKind::FollowupQuestions,
            ChatEvent::StageError { .. } => EventKind::StageError,
        }
    }

    /// 线上帧的 data 字段
    pub fn data(&self) -> String {
        match self {
            ChatEvent::Intent(s)
            | ChatEvent::SearchTerm(s)
            | ChatEvent::Documents(s)
            | ChatEvent::RankingDocuments(s)
            | ChatEvent::BeginAnswer(s)
            | ChatEvent::Answering(s)
            | ChatEvent::EndAnswer(s)
            | ChatEvent::FollowupQuestions(s) => s.clone(),
            ChatEvent::StageError { stage, reason } => format!("{}: {}", stage, reason),
        }
    }
}

/// 顺序违规：记录违规事件与其前一事件
#[derive(Error, Debug, PartialEq)]
#[error("protocol violation: {kind:?} after {prev:?}")]
pub struct ProtocolViolation {
    pub kind: EventKind,
    pub prev: Option<EventKind>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Start,
    AfterIntent,
    AfterSearchTerm,
    AfterDocuments,
    AfterRanking,
    Answering,
    Answered,
    Followed,
}

/// 顺序校验器：逐事件推进，拒绝违反偏序的序列
///
/// 供测试与适配器使用；管线本身按构造即满足该协议。
#[derive(Debug)]
pub struct ProtocolState {
    phase: Phase,
    prev: Option<EventKind>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Start,
            prev: None,
        }
    }

    /// 观察一个事件；违规时返回 Err 并保持原状态
    pub fn observe(&mut self, kind: EventKind) -> Result<(), ProtocolViolation> {
        let next = match (self.phase, kind) {
            (Phase::Start, EventKind::Intent) => Phase::AfterIntent,
            // STAGE_ERROR 在 INTENT 之后任意位置合法，不推进
            (p, EventKind::StageError) if p != Phase::Start => p,
            (Phase::AfterIntent, EventKind::SearchTerm) => Phase::AfterSearchTerm,
            (Phase::AfterIntent, EventKind::BeginAnswer) => Phase::Answering,
            (Phase::AfterSearchTerm, EventKind::Documents) => Phase::AfterDocuments,
            (Phase::AfterDocuments, EventKind::RankingDocuments) => Phase::AfterRanking,
            (Phase::AfterRanking, EventKind::BeginAnswer) => Phase::Answering,
            (Phase::Answering, EventKind::Answering) => Phase::Answering,
            (Phase::Answering, EventKind::EndAnswer) => Phase::Answered,
            (Phase::Answered, EventKind::FollowupQuestions) => Phase::Followed,
            _ => {
                return Err(ProtocolViolation {
                    kind,
                    prev: self.prev,
                })
            }
        };
        self.phase = next;
        self.prev = Some(kind);
        Ok(())
    }
}

/// 整序列校验（测试辅助）
pub fn validate_sequence(kinds: &[EventKind]) -> Result<(), ProtocolViolation> {
    let mut state = ProtocolState::new();
    for &k in kinds {
        state.observe(k)?;
    }
    Ok(())
}
