//! Tuvan - 高校招生咨询机器人后端
//!
//! 入口：初始化日志、装配 LLM / 向量库 / 存储，启动 HTTP 服务。

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tuvan::bot::progress::RandomProgress;
use tuvan::bot::ChatPipeline;
use tuvan::commands::DefaultCommandExecutor;
use tuvan::config::load_config;
use tuvan::intents::IntentRegistry;
use tuvan::knowledge::ChromaIndex;
use tuvan::llm::{OpenAiClient, OpenAiEmbedder};
use tuvan::server::{serve, AppState};
use tuvan::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;

    let registry = IntentRegistry::from_file(&cfg.storage.intents_path)
        .await
        .context("Failed to load intents")?;
    tracing::info!(count = registry.len(), "意图注册表已加载");

    let store = SqliteStore::connect(&cfg.storage.database_url)
        .await
        .context("Failed to open database")?;

    let llm = Arc::new(OpenAiClient::new(
        cfg.llm.base_url.as_deref(),
        &cfg.llm.model,
        None,
    ));
    let embedder = Arc::new(OpenAiEmbedder::new(
        cfg.llm.base_url.as_deref(),
        &cfg.llm.embedding_model,
        None,
    ));
    let index = Arc::new(
        ChromaIndex::new(&cfg.chroma.base_url, embedder).with_n_results(cfg.chroma.n_results),
    );

    let executor = Arc::new(DefaultCommandExecutor::new(
        llm,
        index,
        store.clone(),
        registry,
    ));
    let pipeline = Arc::new(
        ChatPipeline::new(executor, Arc::new(RandomProgress))
            .with_history_depth(cfg.bot.history_depth),
    );

    let state = Arc::new(AppState { pipeline, store });
    serve(state, &cfg.server.host, cfg.server.port).await
}
