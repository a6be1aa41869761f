//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序弹出预置回复；没有预置时回显最后一条 User 消息。
//! 流式接口把回复按空白切词后逐个吐出，模拟真实流。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::traits::{LlmClient, Message, MessageRole, TokenStream};

/// Mock 客户端：预置回复队列
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一串回复，每次调用弹出一条
    pub fn with_replies(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
        }
    }

    fn next_reply(&self, messages: &[Message]) -> String {
        if let Ok(mut queue) = self.replies.lock() {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "(no input)".to_string())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        Ok(self.next_reply(messages))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.next_reply(messages);
        let tokens: Vec<Result<String, String>> = content
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}
