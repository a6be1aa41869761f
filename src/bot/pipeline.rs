//! 对话管线编排器
//!
//! 一次调用走完固定状态序列：取历史 → 意图分类 → 分支执行 →
//! 持久化 → 生成追问 → 写活动日志。过程事件推给事件槽，
//! 终值 ChatbotResponse 作为返回值单独交付，两条通道互不混淆。
//!
//! 降级纪律：检索/排序/合成任何一步失败都发 STAGE_ERROR 事件并带部分
//! 数据继续；持久化与日志失败只记 warn，不影响返回结果；只有意图
//! 分类无法归类才走固定致歉短路。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bot::error::{ChatError, Stage};
use crate::bot::events::ChatEvent;
use crate::bot::progress::ProgressEstimator;
use crate::commands::{CommandExecutor, CommandTrace};
use crate::intents::ChatAction;
use crate::store::{ActivityRecord, HistoryEntry, Role};

/// 分类无法归类时的固定致歉语
pub const FALLBACK_ANSWER: &str = "Hệ thống đang được cập nhật, xin bạn vui lòng qua lại sau.";
/// SEARCH_TERM 事件的过场文案
pub const SEARCHING_BANNER: &str = "Đang tìm kiếm thông tin....";
/// 检索分支 BEGIN_ANSWER 的过场文案
pub const SYNTHESIS_BANNER: &str = "Đang tổng hợp thông tin....";
/// 模板分支 BEGIN_ANSWER 的过场文案
pub const TEMPLATE_BANNER: &str = "Generating answer....";
/// FOLLOWUP_QUESTIONS 载荷里三条追问之间的分隔符
pub const FOLLOWUP_DELIMITER: &str = "<|>";
/// 活动日志的应用标识
pub const APP_ID: &str = "chatbot";

/// 模板分支重切块的字符数
const TEMPLATE_CHUNK_CHARS: usize = 3;
/// 默认取最近几轮历史
const DEFAULT_HISTORY_DEPTH: u32 = 6;

/// 一次调用的终值，且只产生一次
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChatbotResponse {
    pub question: String,
    pub answer: String,
    /// 恰好 3 条，或短路/降级时为空
    pub followup_questions: Vec<String>,
}

/// 事件槽：管线往里推事件，发送失败（接收端已放弃）直接忽略
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

/// 管线本体。executor 是对外部世界的唯一依赖面，
/// progress 决定 DOCUMENTS / RANKING_DOCUMENTS 的进度文案。
pub struct ChatPipeline {
    executor: Arc<dyn CommandExecutor>,
    progress: Arc<dyn ProgressEstimator>,
    history_depth: u32,
}

impl ChatPipeline {
    pub fn new(executor: Arc<dyn CommandExecutor>, progress: Arc<dyn ProgressEstimator>) -> Self {
        Self {
            executor,
            progress,
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }

    pub fn with_history_depth(mut self, depth: u32) -> Self {
        self.history_depth = depth;
        self
    }

    /// 跑完整一轮。事件从 sink 出去，终值从返回值出去。
    /// 客户端掉线时通过 cancel 取消余下阶段，本轮按中止记日志。
    pub async fn run(
        &self,
        question: &str,
        session_id: &str,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> Result<ChatbotResponse, ChatError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut trace = CommandTrace::new();

        // 取历史：失败降级为空，本轮照常进行
        let histories = {
            let t = Instant::now();
            let result = self
                .executor
                .get_histories(session_id, self.history_depth)
                .await;
            trace.record(Stage::FetchHistory, t.elapsed(), result.as_ref().err().cloned());
            match result {
                Ok(histories) => histories,
                Err(reason) => {
                    // INTENT 之前不发 STAGE_ERROR，这里只记 warn
                    warn!(session_id, reason, "取历史失败，按空历史继续");
                    vec![]
                }
            }
        };

        // 意图分类：调用失败按未归类处理（本地恢复，不向上冒泡）
        let intent = {
            let t = Instant::now();
            let result = self.executor.classify_intent(question, &histories).await;
            trace.record(Stage::ClassifyIntent, t.elapsed(), result.as_ref().err().cloned());
            match result {
                Ok(intent) => intent,
                Err(reason) => {
                    warn!(session_id, reason, "意图分类失败，走致歉短路");
                    crate::intents::IntentResult::unresolved()
                }
            }
        };

        // 未归类：只发 INTENT，一条致歉，直接终止。不持久化、不记日志。
        let Some(rephrased) = intent.rephrased_intent.clone() else {
            sink.emit(ChatEvent::Intent(FALLBACK_ANSWER.to_string()));
            info!(session_id, "本轮未归类，返回致歉语");
            return Ok(ChatbotResponse {
                question: question.to_string(),
                answer: FALLBACK_ANSWER.to_string(),
                followup_questions: vec![],
            });
        };

        sink.emit(ChatEvent::Intent(rephrased.clone()));
        debug!(session_id, intent = %intent.predicted_intent, "意图已归类");

        let question_with_intent = format!("{}\n(DETECTED INTENT: {})", question, rephrased);

        self.check_cancelled(&cancel, session_id, question, &histories, &trace, started)
            .await?;

        // 分支执行
        let mut search_terms: Vec<String> = vec![];
        let full_answer = match &intent.action {
            ChatAction::SearchDocs { database } => {
                self.run_search_branch(
                    question,
                    &question_with_intent,
                    &rephrased,
                    database,
                    &histories,
                    &mut search_terms,
                    sink,
                    &cancel,
                    &mut trace,
                )
                .await?
            }
            ChatAction::AnswerTemplate { templates } => {
                self.run_template_branch(question, templates, sink, &mut trace)
                    .await
            }
        };

        self.check_cancelled(&cancel, session_id, question, &histories, &trace, started)
            .await?;

        // 持久化：先用户轮后系统轮，失败不影响返回结果
        for (role, content) in [(Role::User, question), (Role::System, full_answer.as_str())] {
            let t = Instant::now();
            let result = self.executor.save_session(session_id, role, content).await;
            trace.record(Stage::PersistTurn, t.elapsed(), result.as_ref().err().cloned());
            if let Err(reason) = result {
                warn!(session_id, role = role.as_str(), reason, "持久化失败");
                sink.emit(ChatEvent::StageError {
                    stage: Stage::PersistTurn,
                    reason,
                });
            }
        }

        // 追问：必须恰好三条，否则降级为空且不发事件
        let followup_questions = {
            let t = Instant::now();
            let result = self
                .executor
                .followup_questions(
                    &search_terms.join("\n"),
                    &intent.predicted_intent,
                    &full_answer,
                    &histories,
                )
                .await;
            trace.record(
                Stage::GenerateFollowups,
                t.elapsed(),
                result.as_ref().err().cloned(),
            );
            match result {
                Ok(questions) if questions.len() == 3 => {
                    sink.emit(ChatEvent::FollowupQuestions(
                        questions.join(FOLLOWUP_DELIMITER),
                    ));
                    questions
                }
                Ok(questions) => {
                    warn!(session_id, count = questions.len(), "追问数量不对，丢弃");
                    sink.emit(ChatEvent::StageError {
                        stage: Stage::GenerateFollowups,
                        reason: format!("期望 3 条追问，得到 {}", questions.len()),
                    });
                    vec![]
                }
                Err(reason) => {
                    warn!(session_id, reason, "生成追问失败");
                    sink.emit(ChatEvent::StageError {
                        stage: Stage::GenerateFollowups,
                        reason,
                    });
                    vec![]
                }
            }
        };

        // 活动日志：失败只记 warn
        self.log_turn(
            session_id,
            question,
            &full_answer,
            None,
            &histories,
            &trace,
            started,
            started_at,
        )
        .await;

        info!(
            session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "本轮完成"
        );
        Ok(ChatbotResponse {
            question: question.to_string(),
            answer: full_answer,
            followup_questions,
        })
    }

    /// 检索分支：检索词 → 取文档 → 排序 → 流式合成。
    /// 任何一步失败都发 STAGE_ERROR 并带部分数据继续；
    /// END_ANSWER 在本分支内必然发出。
    #[allow(clippy::too_many_arguments)]
    async fn run_search_branch(
        &self,
        question: &str,
        question_with_intent: &str,
        rephrased: &str,
        database: &str,
        histories: &[HistoryEntry],
        search_terms: &mut Vec<String>,
        sink: &EventSink,
        cancel: &CancellationToken,
        trace: &mut CommandTrace,
    ) -> Result<String, ChatError> {
        sink.emit(ChatEvent::SearchTerm(SEARCHING_BANNER.to_string()));
        let t = Instant::now();
        let result = self
            .executor
            .generate_search_terms(question, histories)
            .await;
        trace.record(
            Stage::GenerateSearchTerms,
            t.elapsed(),
            result.as_ref().err().cloned(),
        );
        match result {
            Ok(terms) => search_terms.extend(terms),
            Err(reason) => sink.emit(ChatEvent::StageError {
                stage: Stage::GenerateSearchTerms,
                reason,
            }),
        }
        // 原问题和归类后的问法始终并入检索词
        search_terms.push(question.to_string());
        search_terms.push(rephrased.to_string());

        sink.emit(ChatEvent::Documents(self.progress.retrieving()));
        let t = Instant::now();
        let result = self.executor.search_docs(database, search_terms).await;
        trace.record(Stage::RetrieveDocuments, t.elapsed(), result.as_ref().err().cloned());
        let docs = match result {
            Ok(docs) => docs,
            Err(reason) => {
                sink.emit(ChatEvent::StageError {
                    stage: Stage::RetrieveDocuments,
                    reason,
                });
                vec![]
            }
        };

        sink.emit(ChatEvent::RankingDocuments(self.progress.ranking()));
        let t = Instant::now();
        let result = self
            .executor
            .ranking_docs(question_with_intent, histories, &docs)
            .await;
        trace.record(Stage::RankDocuments, t.elapsed(), result.as_ref().err().cloned());
        let ranked_docs = match result {
            Ok(ranked) => ranked.into_iter().map(|d| d.document).collect(),
            Err(reason) => {
                // 排序失败退回原始检索结果
                sink.emit(ChatEvent::StageError {
                    stage: Stage::RankDocuments,
                    reason,
                });
                docs
            }
        };

        sink.emit(ChatEvent::BeginAnswer(SYNTHESIS_BANNER.to_string()));
        let mut full_answer = String::new();
        let t = Instant::now();
        let stream = self
            .executor
            .answer_stream(question_with_intent, &ranked_docs, histories)
            .await;
        match stream {
            Ok(mut stream) => {
                let mut stream_error = None;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            trace.record(Stage::SynthesizeAnswer, t.elapsed(), Some("cancelled".to_string()));
                            return Err(ChatError::Cancelled);
                        }
                        token = stream.next() => match token {
                            Some(Ok(token)) => {
                                full_answer.push_str(&token);
                                sink.emit(ChatEvent::Answering(token));
                            }
                            Some(Err(reason)) => {
                                // 中途失败：保留已积累的部分回答
                                stream_error = Some(reason);
                                break;
                            }
                            None => break,
                        }
                    }
                }
                trace.record(Stage::SynthesizeAnswer, t.elapsed(), stream_error.clone());
                if let Some(reason) = stream_error {
                    warn!(reason, "回答流中断，保留部分回答");
                    sink.emit(ChatEvent::StageError {
                        stage: Stage::SynthesizeAnswer,
                        reason,
                    });
                }
            }
            Err(reason) => {
                trace.record(Stage::SynthesizeAnswer, t.elapsed(), Some(reason.clone()));
                warn!(reason, "回答流无法建立");
                sink.emit(ChatEvent::StageError {
                    stage: Stage::SynthesizeAnswer,
                    reason,
                });
            }
        }
        // 无论合成结果如何，END_ANSWER 必须出现
        sink.emit(ChatEvent::EndAnswer(full_answer.clone()));
        Ok(full_answer)
    }

    /// 模板分支：同步渲染后按固定 3 字符重切块流出，
    /// 各块按序拼接恰好等于完整回答。
    async fn run_template_branch(
        &self,
        question: &str,
        templates: &[String],
        sink: &EventSink,
        trace: &mut CommandTrace,
    ) -> String {
        let t = Instant::now();
        let result = self.executor.render_template(question, templates).await;
        trace.record(Stage::RenderTemplate, t.elapsed(), result.as_ref().err().cloned());
        let full_answer = match result {
            Ok(answer) => answer,
            Err(reason) => {
                sink.emit(ChatEvent::StageError {
                    stage: Stage::RenderTemplate,
                    reason,
                });
                String::new()
            }
        };

        sink.emit(ChatEvent::BeginAnswer(TEMPLATE_BANNER.to_string()));
        let chars: Vec<char> = full_answer.chars().collect();
        for piece in chars.chunks(TEMPLATE_CHUNK_CHARS) {
            sink.emit(ChatEvent::Answering(piece.iter().collect()));
        }
        sink.emit(ChatEvent::EndAnswer(full_answer.clone()));
        full_answer
    }

    /// 阶段间的取消检查：中止时尽力记一条日志再返回 Cancelled
    #[allow(clippy::too_many_arguments)]
    async fn check_cancelled(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        question: &str,
        histories: &[HistoryEntry],
        trace: &CommandTrace,
        started: Instant,
    ) -> Result<(), ChatError> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        info!(session_id, "客户端已断开，中止余下阶段");
        self.log_turn(
            session_id,
            question,
            "",
            Some("aborted: client disconnected"),
            histories,
            trace,
            started,
            Utc::now(),
        )
        .await;
        Err(ChatError::Cancelled)
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        error: Option<&str>,
        histories: &[HistoryEntry],
        trace: &CommandTrace,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
    ) {
        let record = ActivityRecord {
            record_id: Uuid::new_v4().to_string(),
            conversation_id: session_id.to_string(),
            app_id: APP_ID.to_string(),
            main_input: question.to_string(),
            main_output: answer.to_string(),
            main_error: error.map(String::from),
            histories: histories.to_vec(),
            perf: started.elapsed().as_secs_f64(),
            calls: trace.to_json(),
            created_at: started_at,
        };
        if let Err(reason) = self.executor.log_activities(&record).await {
            warn!(session_id, stage = %Stage::LogActivity, reason, "写活动日志失败");
        }
    }
}
