use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // Chat completion endpoint (OpenAI-compatible: xAI, OpenAI, Ollama, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    // Never defaulted; must come from the config file or LLM_API_KEY.
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Extra attempts after a transient transport failure (connect or timeout).
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,

    // Document store
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Sessions untouched for this long are closed by the server sweeper.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_llm_url() -> String {
    "https://api.x.ai/v1".to_string()
}

fn default_llm_model() -> String {
    "grok-beta".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_llm_max_retries() -> u32 {
    1
}

fn default_database_path() -> String {
    "daybook.db".to_string()
}

fn default_session_idle_secs() -> u64 {
    30 * 60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            llm_max_retries: default_llm_max_retries(),
            database_path: default_database_path(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("daybook_config.toml")
    }

    /// Load config from daybook_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                if path.exists() {
                    tracing::error!("{:#}", e);
                } else {
                    tracing::warn!("No config file found, using defaults + env vars");
                }
                Self::from_env()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str::<BackendConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Some(timeout) = lookup("LLM_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.llm_timeout_secs = seconds;
            }
        }

        if let Some(retries) = lookup("LLM_MAX_RETRIES") {
            if let Ok(retries) = retries.parse() {
                config.llm_max_retries = retries;
            }
        }

        if let Some(path) = lookup("DAYBOOK_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Some(idle) = lookup("DAYBOOK_SESSION_IDLE_SECS") {
            if let Ok(seconds) = idle.parse() {
                config.session_idle_secs = seconds;
            }
        }

        config
    }

    pub fn has_api_key(&self) -> bool {
        self.llm_api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_carry_no_api_key() {
        let config = BackendConfig::default();
        assert!(config.llm_api_key.is_none());
        assert!(!config.has_api_key());
        assert_eq!(config.llm_model, "grok-beta");
        assert_eq!(config.llm_max_retries, 1);
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("LLM_API_URL", "http://localhost:11434/v1"),
            ("LLM_API_KEY", "  secret  "),
            ("LLM_MAX_RETRIES", "0"),
            ("LLM_TIMEOUT_SECS", "not-a-number"),
            ("DAYBOOK_DATABASE_PATH", "/tmp/journal.db"),
            ("DAYBOOK_SESSION_IDLE_SECS", "90"),
        ]
        .into_iter()
        .collect();

        let config = BackendConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.llm_api_url, "http://localhost:11434/v1");
        assert_eq!(config.llm_api_key.as_deref(), Some("secret"));
        assert_eq!(config.llm_max_retries, 0);
        assert_eq!(config.llm_timeout_secs, 60);
        assert_eq!(config.database_path, "/tmp/journal.db");
        assert_eq!(config.session_idle_secs, 90);
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let config = BackendConfig::from_lookup(|key| {
            (key == "LLM_API_KEY").then(|| "   ".to_string())
        });
        assert!(config.llm_api_key.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daybook_config.toml");
        fs::write(&path, "llm_model = \"grok-2\"\nllm_api_key = \"k\"\n").unwrap();

        let config = BackendConfig::load_from(&path).unwrap();
        assert_eq!(config.llm_model, "grok-2");
        assert!(config.has_api_key());
        assert_eq!(config.llm_api_url, "https://api.x.ai/v1");
        assert_eq!(config.database_path, "daybook.db");
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daybook_config.toml");
        fs::write(&path, "llm_max_retries = \"many\"").unwrap();
        assert!(BackendConfig::load_from(&path).is_err());
    }
}
