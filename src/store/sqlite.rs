//! SQLite 存储实现
//!
//! 四张表：sessions / conversations / dialogues / feedbacks。
//! 写入全部是追加式，会话创建用 INSERT OR IGNORE 保证并发下幂等。

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use super::{ActivityRecord, Csat, FeedbackRecord, HistoryEntry, Role, SessionSummary};
use crate::bot::error::ChatError;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 按连接串打开数据库并建表
    pub async fn connect(url: &str) -> Result<Self, ChatError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ChatError::Persistence(format!("数据库连接串无效: {}", e)))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ChatError::Persistence(format!("打开数据库失败: {}", e)))?;
        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite 存储就绪: {}", url);
        Ok(store)
    }

    /// 内存库（测试用）。单连接，避免每个连接各自一份内存库。
    pub async fn in_memory() -> Result<Self, ChatError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| ChatError::Persistence(format!("打开内存库失败: {}", e)))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), ChatError> {
        let ddl = r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS dialogues (
            record_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            app_id TEXT NOT NULL,
            main_input TEXT NOT NULL,
            main_output TEXT NOT NULL,
            main_error TEXT,
            histories TEXT NOT NULL,
            perf REAL NOT NULL,
            calls TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS feedbacks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            content TEXT,
            rating TEXT NOT NULL,
            conversations TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_session
            ON conversations (session_id, created_at);
        "#;
        sqlx::raw_sql(ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::Persistence(format!("建表失败: {}", e)))?;
        Ok(())
    }

    /// 取出或创建会话，返回 session_id
    pub async fn get_or_create_session(&self, session_id: &str) -> Result<String, ChatError> {
        sqlx::query("INSERT OR IGNORE INTO sessions (session_id, created_at) VALUES (?, ?)")
            .bind(session_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::Persistence(format!("创建会话失败: {}", e)))?;
        Ok(session_id.to_string())
    }

    /// 追加一轮对话
    pub async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), ChatError> {
        self.get_or_create_session(session_id).await?;
        sqlx::query(
            "INSERT INTO conversations (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("写入轮次失败: {}", e)))?;
        Ok(())
    }

    /// 最近 limit 轮历史，按时间正序返回
    pub async fn recent_histories(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, ChatError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversations \
             WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("读取历史失败: {}", e)))?;

        let mut entries: Vec<HistoryEntry> = rows
            .into_iter()
            .filter_map(|row| Self::row_to_entry(&row))
            .collect();
        entries.reverse();
        Ok(entries)
    }

    /// 整个会话的全部轮次（查询接口用）
    pub async fn all_histories(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ChatError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversations \
             WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("读取历史失败: {}", e)))?;
        Ok(rows.iter().filter_map(Self::row_to_entry).collect())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Option<HistoryEntry> {
        let role: String = row.get("role");
        let content: String = row.get("content");
        let created_at: String = row.get("created_at");
        Some(HistoryEntry {
            role: Role::from_str(&role)?,
            content,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .ok()?
                .with_timezone(&Utc),
        })
    }

    /// 写入一条活动日志
    pub async fn insert_activity(&self, record: &ActivityRecord) -> Result<(), ChatError> {
        let calls = serde_json::to_string(&record.calls)
            .map_err(|e| ChatError::Logging(format!("序列化调用记录失败: {}", e)))?;
        let histories = serde_json::to_string(&record.histories)
            .map_err(|e| ChatError::Logging(format!("序列化历史快照失败: {}", e)))?;
        sqlx::query(
            "INSERT INTO dialogues \
             (record_id, conversation_id, app_id, main_input, main_output, main_error, histories, perf, calls, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.record_id)
        .bind(&record.conversation_id)
        .bind(&record.app_id)
        .bind(&record.main_input)
        .bind(&record.main_output)
        .bind(&record.main_error)
        .bind(histories)
        .bind(record.perf)
        .bind(calls)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ChatError::Logging(format!("写入活动日志失败: {}", e)))?;
        Ok(())
    }

    /// 某个会话的全部活动日志，按时间正序
    pub async fn activities_for(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ActivityRecord>, ChatError> {
        let rows = sqlx::query(
            "SELECT record_id, conversation_id, app_id, main_input, main_output, main_error, histories, perf, calls, created_at \
             FROM dialogues WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Logging(format!("读取活动日志失败: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let calls: String = row.get("calls");
            let histories: String = row.get("histories");
            let created_at: String = row.get("created_at");
            records.push(ActivityRecord {
                record_id: row.get("record_id"),
                conversation_id: row.get("conversation_id"),
                app_id: row.get("app_id"),
                main_input: row.get("main_input"),
                main_output: row.get("main_output"),
                main_error: row.get("main_error"),
                histories: serde_json::from_str(&histories).unwrap_or_default(),
                perf: row.get("perf"),
                calls: serde_json::from_str(&calls).unwrap_or(serde_json::Value::Null),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(records)
    }

    /// 提交反馈，带上当前会话快照
    pub async fn insert_feedback(
        &self,
        session_id: &str,
        content: Option<&str>,
        rating: Csat,
    ) -> Result<(), ChatError> {
        let conversations = self.all_histories(session_id).await?;
        let snapshot = serde_json::to_string(&conversations)
            .map_err(|e| ChatError::Persistence(format!("序列化会话快照失败: {}", e)))?;
        sqlx::query(
            "INSERT INTO feedbacks (session_id, content, rating, conversations, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(content)
        .bind(rating.as_str())
        .bind(snapshot)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("写入反馈失败: {}", e)))?;
        Ok(())
    }

    /// 全部反馈，按时间倒序
    pub async fn list_feedbacks(&self) -> Result<Vec<FeedbackRecord>, ChatError> {
        let rows = sqlx::query(
            "SELECT session_id, content, rating, conversations, created_at \
             FROM feedbacks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("读取反馈失败: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let rating: String = row.get("rating");
            let Some(rating) = Csat::from_str(&rating) else {
                continue;
            };
            let conversations: String = row.get("conversations");
            let created_at: String = row.get("created_at");
            records.push(FeedbackRecord {
                session_id: row.get("session_id"),
                content: row.get("content"),
                rating,
                conversations: serde_json::from_str(&conversations).unwrap_or_default(),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(records)
    }

    /// 会话列表：每个会话的最近活动时间 + 前三轮预览，按活跃度倒序
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ChatError> {
        let rows = sqlx::query(
            "SELECT session_id, MAX(created_at) AS latest FROM conversations \
             GROUP BY session_id ORDER BY latest DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Persistence(format!("读取会话列表失败: {}", e)))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let session_id: String = row.get("session_id");
            let latest: String = row.get("latest");
            let preview = sqlx::query(
                "SELECT role, content, created_at FROM conversations \
                 WHERE session_id = ? ORDER BY id ASC LIMIT 3",
            )
            .bind(&session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ChatError::Persistence(format!("读取会话预览失败: {}", e)))?;
            summaries.push(SessionSummary {
                session_id,
                latest_created_at: DateTime::parse_from_rfc3339(&latest)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                session_details: preview.iter().filter_map(Self::row_to_entry).collect(),
            });
        }
        Ok(summaries)
    }
}
