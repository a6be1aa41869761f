//! 知识库检索层
//!
//! 文档存在 Chroma 向量库里，检索词先走嵌入 API 向量化，
//! 再按向量查询取回文档片段。

pub mod chroma;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use chroma::ChromaIndex;

/// 检索不中时的占位文案（排序与回答阶段照常消费）
pub const SEARCH_MISS_PLACEHOLDER: &str = "Không tìm thấy được thông tin liên quan đến câu hỏi";

/// 排序后的文档片段，rank 为 1..5 相关性分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub rank: u8,
    pub document: String,
}

/// 文档索引：按一组检索词查询某个库，返回去重后的片段
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn query(&self, database: &str, terms: &[String]) -> Result<Vec<String>, String>;
}

/// 扁平化 + 保序去重；空结果换成占位文案加检索词
pub fn collect_documents(nested: Vec<Vec<String>>, terms: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut docs: Vec<String> = nested
        .into_iter()
        .flatten()
        .filter(|d| seen.insert(d.clone()))
        .collect();
    if docs.is_empty() {
        docs.push(SEARCH_MISS_PLACEHOLDER.to_string());
        docs.extend(terms.iter().cloned());
    }
    docs
}
