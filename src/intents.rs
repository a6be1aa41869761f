//! 意图注册表
//!
//! 意图清单从 JSON 配置加载，每个意图带描述和一个动作负载。
//! 动作标签在加载时校验，未识别的 CMD 直接拒绝启动，
//! 分发阶段因此只需穷举匹配两个分支。

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bot::error::ChatError;

/// 分类命中后要执行的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "CMD")]
pub enum ChatAction {
    /// 在指定知识库里检索文档并生成回答
    #[serde(rename = "SEARCH_DOCS")]
    SearchDocs {
        #[serde(rename = "DB")]
        database: String,
    },
    /// 跳过检索，直接按模板回答
    #[serde(rename = "ANSWER_TEMPLATE")]
    AnswerTemplate {
        #[serde(rename = "TEMPLATES")]
        templates: Vec<String>,
    },
}

/// 兜底动作：感谢并记录，不做检索
pub fn default_action() -> ChatAction {
    ChatAction::AnswerTemplate {
        templates: vec![
            "Cảm ơn bạn đã liên hệ, thông tin của bạn đã được ghi nhận.".to_string(),
        ],
    }
}

/// 一次分类的结果。`rephrased_intent` 缺失表示本轮无法归类，
/// 管线必须短路返回固定致歉语。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub predicted_intent: String,
    pub rephrased_intent: Option<String>,
    pub action: ChatAction,
}

impl IntentResult {
    pub fn is_unresolved(&self) -> bool {
        self.rephrased_intent.is_none()
    }

    /// 未归类兜底结果
    pub fn unresolved() -> Self {
        Self {
            predicted_intent: "defaut_query".to_string(),
            rephrased_intent: None,
            action: default_action(),
        }
    }
}

/// 配置文件里的单个意图
#[derive(Debug, Clone, Deserialize)]
pub struct IntentDefinition {
    #[serde(rename = "DESCRIPTION")]
    pub description: String,
    #[serde(rename = "ACTION")]
    pub action: ChatAction,
}

/// 全部已知意图，按名称索引
#[derive(Debug, Clone)]
pub struct IntentRegistry {
    intents: BTreeMap<String, IntentDefinition>,
}

impl IntentRegistry {
    /// 从 JSON 文本加载并校验。任何未识别的动作标签都会让加载失败。
    pub fn from_json_str(raw: &str) -> Result<Self, ChatError> {
        let table: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| ChatError::Config(format!("意图配置不是合法 JSON: {}", e)))?;

        let mut intents = BTreeMap::new();
        for (name, value) in table {
            let cmd = value
                .get("ACTION")
                .and_then(|a| a.get("CMD"))
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            let def: IntentDefinition = serde_json::from_value(value)
                .map_err(|_| ChatError::UnrecognizedAction(format!("{} ({})", name, cmd)))?;
            intents.insert(name, def);
        }
        Ok(Self { intents })
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| {
                ChatError::Config(format!(
                    "读取意图配置 {} 失败: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        Self::from_json_str(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&IntentDefinition> {
        self.intents.get(name)
    }

    /// 某个意图的动作；未知名称落到兜底动作
    pub fn action_for(&self, name: &str) -> ChatAction {
        self.intents
            .get(name)
            .map(|d| d.action.clone())
            .unwrap_or_else(default_action)
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// 渲染成分类提示词里的意图清单，一行一条：'名称': '描述'
    pub fn prompt_block(&self) -> String {
        self.intents
            .iter()
            .map(|(name, def)| format!("'{}': '{}'\n", name, def.description))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hoc_phi": {
            "DESCRIPTION": "Hỏi về học phí các ngành",
            "ACTION": {"CMD": "SEARCH_DOCS", "DB": "tuyensinh"}
        },
        "lien_he": {
            "DESCRIPTION": "Để lại thông tin liên hệ",
            "ACTION": {"CMD": "ANSWER_TEMPLATE", "TEMPLATES": ["Cảm ơn bạn đã liên hệ, thông tin của bạn đã được ghi nhận."]}
        }
    }"#;

    #[test]
    fn test_load_and_dispatch() {
        let registry = IntentRegistry::from_json_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.action_for("hoc_phi"),
            ChatAction::SearchDocs {
                database: "tuyensinh".to_string()
            }
        );
        // 未知名称落到兜底
        assert_eq!(registry.action_for("khong_co"), default_action());
    }

    #[test]
    fn test_unrecognized_action_rejected_at_load() {
        let raw = r#"{"x": {"DESCRIPTION": "d", "ACTION": {"CMD": "DO_MAGIC"}}}"#;
        let err = IntentRegistry::from_json_str(raw).unwrap_err();
        assert!(matches!(err, ChatError::UnrecognizedAction(_)));
    }

    #[test]
    fn test_prompt_block_lists_all_intents() {
        let registry = IntentRegistry::from_json_str(SAMPLE).unwrap();
        let block = registry.prompt_block();
        assert!(block.contains("'hoc_phi': 'Hỏi về học phí các ngành'"));
        assert!(block.contains("'lien_he'"));
    }

    #[test]
    fn test_unresolved_result() {
        let r = IntentResult::unresolved();
        assert!(r.is_unresolved());
        assert_eq!(r.action, default_action());
    }
}
