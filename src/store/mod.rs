//! 会话与日志持久化
//!
//! 会话轮次、活动日志（dialogues）与 CSAT 反馈存 SQLite；
//! 管线只追加，不修改历史。

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteStore;

/// 轮次角色：用户提问 / 系统回答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// 单条历史轮次（创建后不可变，按时间顺序作为管线只读输入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// 提示词里 [HISTORIES] 的单行格式
    pub fn to_prompt_line(&self) -> String {
        format!("{}: {}", self.role.as_str(), self.content)
    }
}

/// 拼接历史为 [HISTORIES] 段
pub fn histories_block(histories: &[HistoryEntry]) -> String {
    histories
        .iter()
        .map(|h| h.to_prompt_line())
        .collect::<Vec<_>>()
        .join("\n")
}

/// CSAT 评分（线上值为 "1".."5"）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Csat {
    #[serde(rename = "5")]
    VerySatisfied,
    #[serde(rename = "4")]
    Satisfied,
    #[serde(rename = "3")]
    Neutral,
    #[serde(rename = "2")]
    Dissatisfied,
    #[serde(rename = "1")]
    VeryDissatisfied,
}

impl Csat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Csat::VerySatisfied => "5",
            Csat::Satisfied => "4",
            Csat::Neutral => "3",
            Csat::Dissatisfied => "2",
            Csat::VeryDissatisfied => "1",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "5" => Some(Csat::VerySatisfied),
            "4" => Some(Csat::Satisfied),
            "3" => Some(Csat::Neutral),
            "2" => Some(Csat::Dissatisfied),
            "1" => Some(Csat::VeryDissatisfied),
            _ => None,
        }
    }
}

/// 一条反馈：评分 + 可选正文 + 提交时刻的会话快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub session_id: String,
    pub content: Option<String>,
    pub rating: Csat,
    pub conversations: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
}

/// 一轮对话的活动日志（dialogues 表一行）
///
/// `calls` 是本轮所有命令调用的 JSON 数组（阶段、耗时、错误），
/// 由命令执行器的调用追踪序列化而来；`histories` 是本轮带入的历史快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub record_id: String,
    pub conversation_id: String,
    pub app_id: String,
    pub main_input: String,
    pub main_output: String,
    pub main_error: Option<String>,
    pub histories: Vec<HistoryEntry>,
    /// 整轮耗时（秒）
    pub perf: f64,
    pub calls: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// 会话列表项：最近活动时间 + 前几轮预览
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub latest_created_at: DateTime<Utc>,
    pub session_details: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_line_format() {
        let e = HistoryEntry {
            role: Role::User,
            content: "Học phí bao nhiêu?".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(e.to_prompt_line(), "user: Học phí bao nhiêu?");
    }

    #[test]
    fn test_csat_wire_values() {
        assert_eq!(serde_json::to_string(&Csat::VerySatisfied).unwrap(), "\"5\"");
        assert_eq!(Csat::from_str("1"), Some(Csat::VeryDissatisfied));
        assert_eq!(Csat::from_str("0"), None);
    }
}
