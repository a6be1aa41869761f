//! 管线集成测试
//!
//! 用脚本化执行器替换整个后端分发面，逐项核对事件顺序、
//! 终值一致性、降级路径与持久化副作用。

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use tuvan::bot::events::{validate_sequence, ChatEvent, EventKind};
use tuvan::bot::pipeline::{ChatPipeline, EventSink, FALLBACK_ANSWER};
use tuvan::bot::progress::FixedProgress;
use tuvan::commands::CommandExecutor;
use tuvan::intents::{ChatAction, IntentResult};
use tuvan::knowledge::RankedDocument;
use tuvan::llm::TokenStream;
use tuvan::store::{ActivityRecord, HistoryEntry, Role};

/// 脚本化执行器：每个操作的结果预先写死，副作用记在 Mutex 里
struct ScriptedExecutor {
    histories: Vec<HistoryEntry>,
    intent: IntentResult,
    search_terms: Result<Vec<String>, String>,
    docs: Result<Vec<String>, String>,
    ranked: Result<Vec<RankedDocument>, String>,
    answer_tokens: Vec<Result<String, String>>,
    followups: Result<Vec<String>, String>,
    save_fails: bool,
    saved: Mutex<Vec<(Role, String)>>,
    logged: Mutex<Vec<ActivityRecord>>,
    followup_inputs: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn search_branch() -> Self {
        Self {
            histories: vec![HistoryEntry {
                role: Role::User,
                content: "Trường có ngành CNTT không?".to_string(),
                created_at: chrono::Utc::now(),
            }],
            intent: IntentResult {
                predicted_intent: "hoc_phi".to_string(),
                rephrased_intent: Some("Bạn muốn biết học phí".to_string()),
                action: ChatAction::SearchDocs {
                    database: "tuyensinh".to_string(),
                },
            },
            search_terms: Ok(vec!["học phí ngành CNTT".to_string()]),
            docs: Ok(vec!["Học phí 30 triệu/năm".to_string()]),
            ranked: Ok(vec![RankedDocument {
                rank: 5,
                document: "Học phí 30 triệu/năm".to_string(),
            }]),
            answer_tokens: vec![
                Ok("Học phí ".to_string()),
                Ok("là 30 triệu/năm.".to_string()),
            ],
            followups: Ok(vec![
                "Có học bổng không?".to_string(),
                "Điểm chuẩn bao nhiêu?".to_string(),
                "Ký túc xá thế nào?".to_string(),
            ]),
            save_fails: false,
            saved: Mutex::new(vec![]),
            logged: Mutex::new(vec![]),
            followup_inputs: Mutex::new(vec![]),
        }
    }

    fn template_branch(templates: Vec<&str>) -> Self {
        let mut this = Self::search_branch();
        this.intent = IntentResult {
            predicted_intent: "lien_he".to_string(),
            rephrased_intent: Some("Bạn muốn để lại thông tin liên hệ".to_string()),
            action: ChatAction::AnswerTemplate {
                templates: templates.into_iter().map(String::from).collect(),
            },
        };
        this
    }

    fn unresolved() -> Self {
        let mut this = Self::search_branch();
        this.intent = IntentResult::unresolved();
        this
    }

    fn saved_turns(&self) -> Vec<(Role, String)> {
        self.saved.lock().unwrap().clone()
    }

    fn log_count(&self) -> usize {
        self.logged.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn get_histories(&self, _: &str, _: u32) -> Result<Vec<HistoryEntry>, String> {
        Ok(self.histories.clone())
    }

    async fn classify_intent(&self, _: &str, _: &[HistoryEntry]) -> Result<IntentResult, String> {
        Ok(self.intent.clone())
    }

    async fn generate_search_terms(
        &self,
        _: &str,
        _: &[HistoryEntry],
    ) -> Result<Vec<String>, String> {
        self.search_terms.clone()
    }

    async fn search_docs(&self, _: &str, _: &[String]) -> Result<Vec<String>, String> {
        self.docs.clone()
    }

    async fn ranking_docs(
        &self,
        _: &str,
        _: &[HistoryEntry],
        _: &[String],
    ) -> Result<Vec<RankedDocument>, String> {
        self.ranked.clone()
    }

    async fn answer_stream(
        &self,
        _: &str,
        _: &[String],
        _: &[HistoryEntry],
    ) -> Result<TokenStream, String> {
        Ok(Box::pin(stream::iter(self.answer_tokens.clone())))
    }

    async fn render_template(&self, _: &str, templates: &[String]) -> Result<String, String> {
        templates
            .first()
            .cloned()
            .ok_or_else(|| "模板列表为空".to_string())
    }

    async fn followup_questions(
        &self,
        search_term: &str,
        _: &str,
        _: &str,
        _: &[HistoryEntry],
    ) -> Result<Vec<String>, String> {
        self.followup_inputs
            .lock()
            .unwrap()
            .push(search_term.to_string());
        self.followups.clone()
    }

    async fn save_session(&self, _: &str, role: Role, content: &str) -> Result<(), String> {
        if self.save_fails {
            return Err("disk full".to_string());
        }
        self.saved.lock().unwrap().push((role, content.to_string()));
        Ok(())
    }

    async fn log_activities(&self, record: &ActivityRecord) -> Result<(), String> {
        self.logged.lock().unwrap().push(record.clone());
        Ok(())
    }
}

async fn run_pipeline(
    executor: std::sync::Arc<ScriptedExecutor>,
    question: &str,
) -> (tuvan::ChatbotResponse, Vec<ChatEvent>) {
    let pipeline = ChatPipeline::new(executor, std::sync::Arc::new(FixedProgress::default()));
    let (sink, mut rx) = EventSink::channel();
    let response = pipeline
        .run(question, "phien-1", &sink, CancellationToken::new())
        .await
        .unwrap();
    drop(sink);
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (response, events)
}

fn kinds(events: &[ChatEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

#[tokio::test]
async fn test_search_branch_end_to_end() {
    let executor = std::sync::Arc::new(ScriptedExecutor::search_branch());
    let (response, events) = run_pipeline(executor.clone(), "Học phí bao nhiêu?").await;

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Intent,
            EventKind::SearchTerm,
            EventKind::Documents,
            EventKind::RankingDocuments,
            EventKind::BeginAnswer,
            EventKind::Answering,
            EventKind::Answering,
            EventKind::EndAnswer,
            EventKind::FollowupQuestions,
        ]
    );
    validate_sequence(&kinds(&events)).unwrap();

    assert_eq!(events[0].data(), "Bạn muốn biết học phí");
    assert_eq!(events[1].data(), "Đang tìm kiếm thông tin....");
    assert_eq!(events[2].data(), "50%");
    assert_eq!(events[3].data(), "90%");
    assert_eq!(events[4].data(), "Đang tổng hợp thông tin....");

    // 终值与 END_ANSWER 载荷一致
    assert_eq!(response.answer, "Học phí là 30 triệu/năm.");
    assert_eq!(events[7].data(), response.answer);
    assert_eq!(response.followup_questions.len(), 3);
    assert_eq!(
        events[8].data(),
        "Có học bổng không?<|>Điểm chuẩn bao nhiêu?<|>Ký túc xá thế nào?"
    );

    // 持久化恰好两次：先用户轮后系统轮
    let saved = executor.saved_turns();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0], (Role::User, "Học phí bao nhiêu?".to_string()));
    assert_eq!(saved[1], (Role::System, response.answer.clone()));
    assert_eq!(executor.log_count(), 1);

    // 活动日志带上本轮历史快照与分阶段调用轨迹
    let logged = executor.logged.lock().unwrap().clone();
    assert_eq!(logged[0].main_input, "Học phí bao nhiêu?");
    assert_eq!(logged[0].histories.len(), 1);
    assert_eq!(logged[0].histories[0].content, "Trường có ngành CNTT không?");
    let stages: Vec<String> = logged[0]
        .calls
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["stage"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stages[0], "fetch_history");
    assert!(stages.contains(&"synthesize_answer".to_string()));
    assert!(stages.contains(&"persist_turn".to_string()));

    // 追问的检索词输入包含原问题和归类后的问法
    let inputs = executor.followup_inputs.lock().unwrap().clone();
    assert!(inputs[0].contains("Học phí bao nhiêu?"));
    assert!(inputs[0].contains("Bạn muốn biết học phí"));
}

#[tokio::test]
async fn test_unresolved_intent_short_circuits() {
    let executor = std::sync::Arc::new(ScriptedExecutor::unresolved());
    let (response, events) = run_pipeline(executor.clone(), "xyzzy").await;

    assert_eq!(kinds(&events), vec![EventKind::Intent]);
    assert_eq!(events[0].data(), FALLBACK_ANSWER);
    assert_eq!(response.answer, FALLBACK_ANSWER);
    assert!(response.followup_questions.is_empty());

    // 未归类轮次跳过持久化与日志
    assert!(executor.saved_turns().is_empty());
    assert_eq!(executor.log_count(), 0);
}

#[tokio::test]
async fn test_template_branch_rechunks_exactly() {
    let template = "Cảm ơn bạn đã liên hệ, thông tin của bạn đã được ghi nhận.";
    let executor = std::sync::Arc::new(ScriptedExecutor::template_branch(vec![template]));
    let (response, events) = run_pipeline(executor, "Tôi muốn được tư vấn").await;

    validate_sequence(&kinds(&events)).unwrap();
    assert_eq!(response.answer, template);

    let begin = events
        .iter()
        .find(|e| e.kind() == EventKind::BeginAnswer)
        .unwrap();
    assert_eq!(begin.data(), "Generating answer....");

    // 各块按序拼接恰好等于完整回答，每块至多 3 个字符
    let chunks: Vec<String> = events
        .iter()
        .filter(|e| e.kind() == EventKind::Answering)
        .map(|e| e.data())
        .collect();
    for chunk in &chunks {
        assert!(chunk.chars().count() <= 3);
    }
    assert_eq!(chunks.concat(), template);

    let end = events
        .iter()
        .find(|e| e.kind() == EventKind::EndAnswer)
        .unwrap();
    assert_eq!(end.data(), template);
}

#[tokio::test]
async fn test_midstream_failure_keeps_partial_answer() {
    let mut scripted = ScriptedExecutor::search_branch();
    scripted.answer_tokens = vec![Ok("Một phần".to_string()), Err("backend timeout".to_string())];
    let executor = std::sync::Arc::new(scripted);
    let (response, events) = run_pipeline(executor.clone(), "Học phí bao nhiêu?").await;

    validate_sequence(&kinds(&events)).unwrap();
    // 失败要被看见，但 END_ANSWER 仍然出现且带部分回答
    assert!(events.iter().any(|e| e.kind() == EventKind::StageError));
    let end = events
        .iter()
        .find(|e| e.kind() == EventKind::EndAnswer)
        .unwrap();
    assert_eq!(end.data(), "Một phần");
    assert_eq!(response.answer, "Một phần");

    // 部分状态照常持久化与记日志
    assert_eq!(executor.saved_turns().len(), 2);
    assert_eq!(executor.log_count(), 1);
}

#[tokio::test]
async fn test_followup_wrong_count_degrades_to_empty() {
    let mut scripted = ScriptedExecutor::search_branch();
    scripted.followups = Ok(vec!["chỉ một câu".to_string()]);
    let executor = std::sync::Arc::new(scripted);
    let (response, events) = run_pipeline(executor, "Học phí bao nhiêu?").await;

    assert!(response.followup_questions.is_empty());
    assert!(!events
        .iter()
        .any(|e| e.kind() == EventKind::FollowupQuestions));
    assert!(events.iter().any(|e| e.kind() == EventKind::StageError));
}

#[tokio::test]
async fn test_persistence_failure_is_non_fatal() {
    let mut scripted = ScriptedExecutor::search_branch();
    scripted.save_fails = true;
    let executor = std::sync::Arc::new(scripted);
    let (response, events) = run_pipeline(executor.clone(), "Học phí bao nhiêu?").await;

    // 返回结果不受影响
    assert_eq!(response.answer, "Học phí là 30 triệu/năm.");
    assert_eq!(response.followup_questions.len(), 3);
    let stage_errors = events
        .iter()
        .filter(|e| e.kind() == EventKind::StageError)
        .count();
    assert_eq!(stage_errors, 2);
    assert_eq!(executor.log_count(), 1);
}

#[tokio::test]
async fn test_retrieval_failure_degrades_and_continues() {
    let mut scripted = ScriptedExecutor::search_branch();
    scripted.docs = Err("chroma unreachable".to_string());
    scripted.ranked = Ok(vec![]);
    let executor = std::sync::Arc::new(scripted);
    let (response, events) = run_pipeline(executor, "Học phí bao nhiêu?").await;

    validate_sequence(&kinds(&events)).unwrap();
    assert!(events.iter().any(|e| e.kind() == EventKind::StageError));
    // 管线仍走到合成与追问
    assert!(events.iter().any(|e| e.kind() == EventKind::EndAnswer));
    assert_eq!(response.followup_questions.len(), 3);
}

#[tokio::test]
async fn test_cancellation_aborts_midstream() {
    let mut scripted = ScriptedExecutor::search_branch();
    // 流里塞一长串 token，留出取消的窗口
    scripted.answer_tokens = std::iter::repeat(Ok("x".to_string())).take(10_000).collect();
    let executor = std::sync::Arc::new(scripted);

    let pipeline = ChatPipeline::new(
        executor.clone(),
        std::sync::Arc::new(FixedProgress::default()),
    );
    let (sink, _rx) = EventSink::channel();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = pipeline.run("Học phí bao nhiêu?", "phien-2", &sink, cancel).await;
    assert!(result.is_err());
    // 中止的轮次不写会话
    assert!(executor.saved_turns().is_empty());
}
