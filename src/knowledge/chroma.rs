//! Chroma HTTP 客户端
//!
//! 走 REST 接口：先按名称解析集合 UUID（带缓存），再用查询向量取文档。
//! 检索词的向量化交给注入的 Embedder。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use super::DocumentIndex;
use crate::llm::Embedder;

/// 每条检索词默认取回的片段数
const DEFAULT_N_RESULTS: usize = 5;

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    documents: Vec<Vec<String>>,
}

pub struct ChromaIndex {
    http: reqwest::Client,
    base_url: String,
    embedder: Arc<dyn Embedder>,
    n_results: usize,
    /// 集合名 -> UUID 缓存
    collections: RwLock<HashMap<String, String>>,
}

impl ChromaIndex {
    pub fn new(base_url: &str, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            embedder,
            n_results: DEFAULT_N_RESULTS,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// 覆盖每条检索词取回的片段数
    pub fn with_n_results(mut self, n_results: usize) -> Self {
        self.n_results = n_results;
        self
    }

    async fn collection_id(&self, name: &str) -> Result<String, String> {
        if let Some(id) = self.collections.read().await.get(name) {
            return Ok(id.clone());
        }
        let url = format!("{}/api/v1/collections/{}", self.base_url, name);
        let info: CollectionInfo = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("查询集合 {} 失败: {}", name, e))?
            .error_for_status()
            .map_err(|e| format!("集合 {} 不存在: {}", name, e))?
            .json()
            .await
            .map_err(|e| format!("集合 {} 响应无法解析: {}", name, e))?;
        self.collections
            .write()
            .await
            .insert(name.to_string(), info.id.clone());
        Ok(info.id)
    }
}

#[async_trait]
impl DocumentIndex for ChromaIndex {
    async fn query(&self, database: &str, terms: &[String]) -> Result<Vec<String>, String> {
        let id = self.collection_id(database).await?;

        let mut embeddings = Vec::with_capacity(terms.len());
        for term in terms {
            embeddings.push(self.embedder.embed(term).await?);
        }

        let url = format!("{}/api/v1/collections/{}/query", self.base_url, id);
        let body = json!({
            "query_embeddings": embeddings,
            "n_results": self.n_results,
            "include": ["documents"],
        });
        let result: QueryResult = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("查询向量库失败: {}", e))?
            .error_for_status()
            .map_err(|e| format!("向量库返回错误: {}", e))?
            .json()
            .await
            .map_err(|e| format!("向量库响应无法解析: {}", e))?;

        debug!(
            database = database,
            terms = terms.len(),
            groups = result.documents.len(),
            "向量检索完成"
        );
        Ok(super::collect_documents(result.documents, terms))
    }
}
