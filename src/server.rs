//! HTTP 服务
//!
//! 两种送达方式共用同一条管线：
//! - 流式（POST /completion?stream=1）：每个事件一帧 NDJSON，text/event-stream；
//!   终值不走事件流，在管线返回值里。客户端掉线触发取消。
//! - 缓冲（POST /completion）：事件全部丢弃，只回终值 JSON。
//!
//! 另有会话 / 日志 / 反馈的查询接口。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bot::events::{ChatEvent, EventKind};
use crate::bot::pipeline::{ChatPipeline, EventSink};
use crate::store::{Csat, SqliteStore};

/// 服务共享状态
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub store: SqliteStore,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/completion", post(completion))
        .route("/conversations/:session_id", get(get_conversations))
        .route("/logs/:session_id", get(get_logs))
        .route("/sessions", get(get_sessions))
        .route("/feedbacks", post(post_feedback))
        .route("/feedbacks/:session_id", get(get_feedbacks))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    info!("HTTP 服务监听 {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index() -> &'static str {
    "Running"
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    session_id: Option<String>,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AskParams {
    stream: Option<String>,
}

/// 事件帧编码器：一个事件一帧 `{"event","data","session_id"}\n\n`。
/// 跟踪上一个事件种类：BEGIN_ANSWER 后的第一条 ANSWERING 之前，
/// 额外插一帧空 data 的 BEGIN_ANSWER 作为「回答正文开始」的边界。
pub struct FrameEncoder {
    session_id: String,
    prev: Option<EventKind>,
}

impl FrameEncoder {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            prev: None,
        }
    }

    pub fn encode(&mut self, event: &ChatEvent) -> Vec<String> {
        let kind = event.kind();
        let mut frames = Vec::with_capacity(2);
        if kind == EventKind::Answering && self.prev == Some(EventKind::BeginAnswer) {
            frames.push(self.frame(EventKind::BeginAnswer, ""));
        }
        frames.push(self.frame(kind, &event.data()));
        self.prev = Some(kind);
        frames
    }

    fn frame(&self, kind: EventKind, data: &str) -> String {
        format!(
            "{}\n\n",
            json!({
                "event": kind.as_str(),
                "data": data,
                "session_id": self.session_id,
            })
        )
    }
}

async fn completion(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AskParams>,
    Json(req): Json<AskRequest>,
) -> Result<Response, (StatusCode, String)> {
    let session_id = req
        .session_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if params.stream.is_some() {
        Ok(completion_stream(state, req.msg, session_id))
    } else {
        completion_buffered(state, req.msg, session_id).await
    }
}

/// 流式送达：管线在后台跑，事件经编码器逐帧推出。
/// 响应体被丢弃（客户端掉线）时 drop guard 取消管线余下阶段。
fn completion_stream(state: Arc<AppState>, question: String, session_id: String) -> Response {
    let (sink, event_rx) = EventSink::channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let pipeline = state.pipeline.clone();
    let task_session = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run(&question, &task_session, &sink, cancel).await {
            warn!(session_id = task_session, error = %e, "流式管线中止");
        }
    });

    let encoder = FrameEncoder::new(&session_id);
    let stream = stream::unfold(
        (event_rx, encoder, guard),
        |(mut event_rx, mut encoder, guard)| async move {
            let event = event_rx.recv().await?;
            let payload: String = encoder.encode(&event).concat();
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(payload)),
                (event_rx, encoder, guard),
            ))
        },
    );

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        "text/event-stream; charset=utf-8".parse().unwrap(),
    );
    res
}

/// 缓冲送达：事件全部排走丢弃，只回终值
async fn completion_buffered(
    state: Arc<AppState>,
    question: String,
    session_id: String,
) -> Result<Response, (StatusCode, String)> {
    let (sink, mut event_rx) = EventSink::channel();
    let drain = tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

    let cancel = CancellationToken::new();
    let result = state
        .pipeline
        .run(&question, &session_id, &sink, cancel)
        .await;
    drop(sink);
    let _ = drain.await;

    let response = result.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({
        "question": response.question,
        "answer": response.answer,
        "session_id": session_id,
    }))
    .into_response())
}

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let histories = state
        .store
        .all_histories(&session_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(histories).unwrap_or_default()))
}

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let logs = state
        .store
        .activities_for(&session_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(logs).unwrap_or_default()))
}

async fn get_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let sessions = state
        .store
        .list_sessions()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(sessions).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    session_id: String,
    content: Option<String>,
    rating: String,
}

async fn post_feedback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let rating = Csat::from_str(&req.rating)
        .ok_or((StatusCode::BAD_REQUEST, "评分必须是 1..5".to_string()))?;
    state
        .store
        .insert_feedback(&req.session_id, req.content.as_deref(), rating)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"status": "success"})))
}

async fn get_feedbacks(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let feedbacks = state
        .store
        .list_feedbacks()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let filtered: Vec<_> = feedbacks
        .into_iter()
        .filter(|f| f.session_id == session_id)
        .collect();
    Ok(Json(serde_json::to_value(filtered).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::error::Stage;

    #[test]
    fn test_frame_encoder_inserts_answer_boundary() {
        let mut encoder = FrameEncoder::new("s1");
        assert_eq!(encoder.encode(&ChatEvent::Intent("Bạn muốn biết học phí".into())).len(), 1);
        assert_eq!(encoder.encode(&ChatEvent::BeginAnswer("Đang tổng hợp thông tin....".into())).len(), 1);

        // BEGIN_ANSWER 后的第一条 ANSWERING 前面多一帧空边界
        let frames = encoder.encode(&ChatEvent::Answering("Học".into()));
        assert_eq!(frames.len(), 2);
        let boundary: serde_json::Value = serde_json::from_str(frames[0].trim()).unwrap();
        assert_eq!(boundary["event"], "BEGIN_ANSWER");
        assert_eq!(boundary["data"], "");

        // 后续 ANSWERING 不再插边界
        assert_eq!(encoder.encode(&ChatEvent::Answering(" phí".into())).len(), 1);
    }

    #[test]
    fn test_frame_shape() {
        let mut encoder = FrameEncoder::new("abc");
        let frames = encoder.encode(&ChatEvent::EndAnswer("xong".into()));
        assert!(frames[0].ends_with("\n\n"));
        let parsed: serde_json::Value = serde_json::from_str(frames[0].trim()).unwrap();
        assert_eq!(parsed["event"], "END_ANSWER");
        assert_eq!(parsed["data"], "xong");
        assert_eq!(parsed["session_id"], "abc");
    }

    #[test]
    fn test_stage_error_frame_carries_stage() {
        let mut encoder = FrameEncoder::new("s");
        let frames = encoder.encode(&ChatEvent::StageError {
            stage: Stage::SynthesizeAnswer,
            reason: "timeout".into(),
        });
        let parsed: serde_json::Value = serde_json::from_str(frames[0].trim()).unwrap();
        assert_eq!(parsed["event"], "STAGE_ERROR");
        assert_eq!(parsed["data"], "synthesize_answer: timeout");
    }
}
