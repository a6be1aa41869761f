//! 后端命令执行器
//!
//! 管线对外部世界的唯一依赖面：每个操作一个方法，出错统一返回字符串。
//! 生产实现把 LLM、向量库和存储接在一起；测试用脚本化实现替换整个面。

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::debug;

use crate::intents::{IntentRegistry, IntentResult};
use crate::knowledge::{DocumentIndex, RankedDocument};
use crate::llm::{LlmClient, Message, TokenStream};
use crate::prompts;
use crate::store::{histories_block, ActivityRecord, HistoryEntry, Role, SqliteStore};

/// 后端操作的统一分发面。管线只依赖这个 trait。
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// 按会话取最近 limit 轮历史
    async fn get_histories(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, String>;

    /// 意图分类。解析失败时返回未归类结果，不报错。
    async fn classify_intent(
        &self,
        question: &str,
        histories: &[HistoryEntry],
    ) -> Result<IntentResult, String>;

    /// 生成至多三条向量检索词
    async fn generate_search_terms(
        &self,
        question: &str,
        histories: &[HistoryEntry],
    ) -> Result<Vec<String>, String>;

    /// 在指定库里检索文档
    async fn search_docs(&self, database: &str, terms: &[String]) -> Result<Vec<String>, String>;

    /// 按相关性给文档打分排序，1 分的丢弃
    async fn ranking_docs(
        &self,
        question: &str,
        histories: &[HistoryEntry],
        docs: &[String],
    ) -> Result<Vec<RankedDocument>, String>;

    /// 流式合成回答
    async fn answer_stream(
        &self,
        question: &str,
        docs: &[String],
        histories: &[HistoryEntry],
    ) -> Result<TokenStream, String>;

    /// 从模板集合里出一条回答
    async fn render_template(
        &self,
        question: &str,
        templates: &[String],
    ) -> Result<String, String>;

    /// 生成三条追问
    async fn followup_questions(
        &self,
        search_term: &str,
        intent: &str,
        answer: &str,
        histories: &[HistoryEntry],
    ) -> Result<Vec<String>, String>;

    /// 追加一轮会话
    async fn save_session(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), String>;

    /// 写活动日志
    async fn log_activities(&self, record: &ActivityRecord) -> Result<(), String>;
}

/// 生产执行器：LLM + 向量库 + SQLite
pub struct DefaultCommandExecutor {
    llm: Arc<dyn LlmClient>,
    index: Arc<dyn DocumentIndex>,
    store: SqliteStore,
    registry: IntentRegistry,
}

impl DefaultCommandExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        index: Arc<dyn DocumentIndex>,
        store: SqliteStore,
        registry: IntentRegistry,
    ) -> Self {
        Self {
            llm,
            index,
            store,
            registry,
        }
    }
}

#[async_trait]
impl CommandExecutor for DefaultCommandExecutor {
    async fn get_histories(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, String> {
        self.store
            .recent_histories(session_id, limit)
            .await
            .map_err(|e| e.to_string())
    }

    async fn classify_intent(
        &self,
        question: &str,
        histories: &[HistoryEntry],
    ) -> Result<IntentResult, String> {
        let system = prompts::intent_prompt(&self.registry, &histories_block(histories));
        let raw = self
            .llm
            .complete_json(&[Message::system(system), Message::user(question)])
            .await?;

        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
            debug!(raw = %raw, "意图输出不是 JSON，按未归类处理");
            return Ok(IntentResult::unresolved());
        };
        let Some(name) = parsed.get("INTENT_NAME").and_then(|v| v.as_str()) else {
            return Ok(IntentResult::unresolved());
        };
        let rephrased = parsed
            .get("REPHRASED_INTENT")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(IntentResult {
            predicted_intent: name.to_string(),
            rephrased_intent: rephrased,
            action: self.registry.action_for(name),
        })
    }

    async fn generate_search_terms(
        &self,
        question: &str,
        histories: &[HistoryEntry],
    ) -> Result<Vec<String>, String> {
        let system = prompts::search_query_prompt(&histories_block(histories));
        let raw = self
            .llm
            .complete(&[Message::system(system), Message::user(question)])
            .await?;
        Ok(prompts::extract_queries(&raw))
    }

    async fn search_docs(&self, database: &str, terms: &[String]) -> Result<Vec<String>, String> {
        self.index.query(database, terms).await
    }

    async fn ranking_docs(
        &self,
        question: &str,
        histories: &[HistoryEntry],
        docs: &[String],
    ) -> Result<Vec<RankedDocument>, String> {
        let chunks: Vec<serde_json::Value> = docs
            .iter()
            .enumerate()
            .map(|(i, doc)| json!({"chunk_id": format!("id_{}", i), "text": doc}))
            .collect();
        let docs_json = serde_json::to_string(&chunks).map_err(|e| e.to_string())?;
        let user =
            prompts::ranking_user_prompt(&histories_block(histories), &docs_json, question);
        let raw = self
            .llm
            .complete_json(&[
                Message::system(prompts::RANKING_DOCS_SYSTEM_PROMPT_TEMPLATE),
                Message::user(user),
            ])
            .await?;

        let parsed: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| format!("排序输出不是 JSON: {}", e))?;
        let Some(scored) = parsed.get("chunks").and_then(|c| c.as_array()) else {
            return Ok(vec![]);
        };

        let mut scored: Vec<(u8, usize)> = scored
            .iter()
            .filter_map(|chunk| {
                let score = chunk.get("score")?.as_u64()? as u8;
                let id = chunk.get("chunk_id")?.as_str()?;
                let index: usize = id.strip_prefix("id_")?.parse().ok()?;
                (index < docs.len()).then_some((score, index))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take_while(|(score, _)| *score > 1)
            .map(|(score, index)| RankedDocument {
                rank: score,
                document: docs[index].clone(),
            })
            .collect())
    }

    async fn answer_stream(
        &self,
        question: &str,
        docs: &[String],
        histories: &[HistoryEntry],
    ) -> Result<TokenStream, String> {
        let system = prompts::answer_prompt(&docs.join("\n"), &histories_block(histories));
        self.llm
            .complete_stream(&[Message::system(system), Message::user(question)])
            .await
    }

    async fn render_template(
        &self,
        _question: &str,
        templates: &[String],
    ) -> Result<String, String> {
        templates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| "模板列表为空".to_string())
    }

    async fn followup_questions(
        &self,
        search_term: &str,
        _intent: &str,
        answer: &str,
        histories: &[HistoryEntry],
    ) -> Result<Vec<String>, String> {
        let system = prompts::followup_prompt(search_term, answer, &histories_block(histories));
        let raw = self
            .llm
            .complete(&[Message::system(system), Message::user(search_term)])
            .await?;
        Ok(prompts::extract_questions(&raw))
    }

    async fn save_session(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), String> {
        self.store
            .append_turn(session_id, role, content)
            .await
            .map_err(|e| e.to_string())
    }

    async fn log_activities(&self, record: &ActivityRecord) -> Result<(), String> {
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        debug!(
            conversation_id = %record.conversation_id,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "累计 token 用量"
        );
        self.store
            .insert_activity(record)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::SEARCH_MISS_PLACEHOLDER;
    use crate::llm::MockLlmClient;

    struct NullIndex;

    #[async_trait]
    impl DocumentIndex for NullIndex {
        async fn query(&self, _: &str, terms: &[String]) -> Result<Vec<String>, String> {
            Ok(crate::knowledge::collect_documents(vec![], terms))
        }
    }

    async fn executor_with(replies: Vec<&str>) -> DefaultCommandExecutor {
        let registry = IntentRegistry::from_json_str(
            r#"{"hoc_phi": {"DESCRIPTION": "Hỏi về học phí", "ACTION": {"CMD": "SEARCH_DOCS", "DB": "tuyensinh"}}}"#,
        )
        .unwrap();
        DefaultCommandExecutor::new(
            Arc::new(MockLlmClient::with_replies(replies)),
            Arc::new(NullIndex),
            crate::store::SqliteStore::in_memory().await.unwrap(),
            registry,
        )
    }

    #[tokio::test]
    async fn test_classify_intent_parses_model_json() {
        let executor = executor_with(vec![
            r#"{"INTENT_NAME": "hoc_phi", "REPHRASED_INTENT": "Bạn muốn biết học phí"}"#,
        ])
        .await;
        let result = executor
            .classify_intent("Học phí bao nhiêu?", &[])
            .await
            .unwrap();
        assert_eq!(result.predicted_intent, "hoc_phi");
        assert_eq!(
            result.rephrased_intent.as_deref(),
            Some("Bạn muốn biết học phí")
        );
        assert_eq!(
            result.action,
            crate::intents::ChatAction::SearchDocs {
                database: "tuyensinh".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_classify_intent_garbage_is_unresolved() {
        let executor = executor_with(vec!["not json at all"]).await;
        let result = executor.classify_intent("xyzzy", &[]).await.unwrap();
        assert!(result.is_unresolved());
    }

    #[tokio::test]
    async fn test_ranking_docs_sorts_and_drops_irrelevant() {
        let executor = executor_with(vec![
            r#"{"chunks": [
                {"score": 1, "chunk_id": "id_0"},
                {"score": 5, "chunk_id": "id_1"},
                {"score": 3, "chunk_id": "id_2"},
                {"score": 4, "chunk_id": "id_99"}
            ]}"#,
        ])
        .await;
        let docs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ranked = executor.ranking_docs("q", &[], &docs).await.unwrap();
        // 按分数降序，1 分与越界的 chunk_id 被丢弃
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], RankedDocument { rank: 5, document: "b".to_string() });
        assert_eq!(ranked[1], RankedDocument { rank: 3, document: "c".to_string() });
    }

    #[tokio::test]
    async fn test_search_docs_miss_returns_placeholder() {
        let executor = executor_with(vec![]).await;
        let terms = vec!["học phí".to_string()];
        let docs = executor.search_docs("tuyensinh", &terms).await.unwrap();
        assert_eq!(docs[0], SEARCH_MISS_PLACEHOLDER);
    }
}
