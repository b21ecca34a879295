use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ApiError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    #[allow(dead_code)]
    pub user_data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub history_db_path: PathBuf,
    pub knowledge_db_path: PathBuf,
    pub config_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let user_data_dir = discover_user_data_dir();
        let log_dir = user_data_dir.join("logs");
        let upload_dir = user_data_dir.join("uploads");
        let history_db_path = user_data_dir.join("emberlink_chat.db");
        let knowledge_db_path = user_data_dir.join("emberlink_knowledge.db");
        let config_path = user_data_dir.join("config.toml");

        for dir in [&user_data_dir, &log_dir, &upload_dir] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            user_data_dir,
            log_dir,
            upload_dir,
            history_db_path,
            knowledge_db_path,
            config_path,
        }
    }
}

fn discover_user_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("EMBERLINK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if cfg!(debug_assertions) {
        return env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    if cfg!(target_os = "windows") {
        let base = env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string()));
        return PathBuf::from(base).join("Emberlink");
    }

    if cfg!(target_os = "macos") {
        return home_dir()
            .join("Library")
            .join("Application Support")
            .join("Emberlink");
    }

    let xdg = env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        home_dir()
            .join(".local/share")
            .to_string_lossy()
            .to_string()
    });
    PathBuf::from(xdg).join("emberlink")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Application configuration, loaded once from TOML and handed to the
/// components that need each section. There is no global settings object:
/// constructors receive their slice of this struct explicitly.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub search: SearchConfig,
    pub knowledge: KnowledgeConfig,
    pub gateways: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub chat_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Messages of prior history included in each prompt.
    pub history_window: i64,
    /// Characters of the user message used for the fallback session title.
    pub fallback_title_len: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            chat_model: "default-chat".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            history_window: 20,
            fallback_title_len: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub web_max_results: usize,
    pub max_context_results: usize,
    pub knowledge_weight: f32,
    pub web_weight: f32,
    pub dedup_prefix_len: usize,
    /// Terms that make the automatic strategy reach for the web. The list is
    /// replaceable; none of the entries are load-bearing.
    pub freshness_keywords: Vec<String>,
    pub web_keyword_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.7,
            web_max_results: 5,
            max_context_results: 10,
            knowledge_weight: 1.0,
            web_weight: 1.0,
            dedup_prefix_len: 100,
            freshness_keywords: [
                "latest", "today", "current", "now", "recent", "news",
                "this week", "this year", "price", "weather", "score",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            web_keyword_limit: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_len: usize,
    pub embedding_batch_size: usize,
    pub embedding_model: String,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            min_chunk_len: 20,
            embedding_batch_size: 10,
            embedding_model: "default-embedding".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_timeout_secs: u64,
    /// Empty endpoint means web search is unconfigured and degrades to
    /// empty results rather than failing requests.
    pub web_search_endpoint: String,
    pub web_search_api_key: String,
    pub web_search_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            llm_base_url: "http://127.0.0.1:8088/v1".to_string(),
            llm_api_key: String::new(),
            embedding_base_url: "http://127.0.0.1:8090/v1".to_string(),
            embedding_api_key: String::new(),
            embedding_timeout_secs: 30,
            web_search_endpoint: String::new(),
            web_search_api_key: String::new(),
            web_search_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Loads configuration from the given path, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ApiError> {
        if !path.exists() {
            return Ok(AppConfig::default());
        }

        let raw = fs::read_to_string(path).map_err(ApiError::internal)?;
        toml::from_str(&raw)
            .map_err(|err| ApiError::Internal(format!("invalid config {}: {}", path.display(), err)))
    }
}
