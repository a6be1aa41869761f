//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TUVAN__*` 覆盖
//! （双下划线表示嵌套，如 `TUVAN__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub chroma: ChromaSection,
    pub storage: StorageSection,
    pub bot: BotSection,
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// [llm] 段：模型与端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    /// 检索词向量化用的嵌入模型
    pub embedding_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// [chroma] 段：向量库端点与每条检索词取回的片段数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromaSection {
    pub base_url: String,
    pub n_results: usize,
}

impl Default for ChromaSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            n_results: 5,
        }
    }
}

/// [storage] 段：SQLite 连接串与意图配置路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_url: String,
    pub intents_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite:tuvan.db".to_string(),
            intents_path: PathBuf::from("config/intents.json"),
        }
    }
}

/// [bot] 段：管线参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotSection {
    /// 每轮带入的历史轮数
    pub history_depth: u32,
}

impl Default for BotSection {
    fn default() -> Self {
        Self { history_depth: 6 }
    }
}

/// 从 config 目录加载配置，环境变量 TUVAN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TUVAN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TUVAN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.bot.history_depth, 6);
        assert_eq!(cfg.chroma.n_results, 5);
        assert_eq!(cfg.storage.database_url, "sqlite:tuvan.db");
    }
}
