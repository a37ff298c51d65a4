use serde::{Deserialize, Serialize};

/// Top-level configuration surface (§6). The core never loads this from disk itself;
/// callers (the CLI entry point) build one and hand it in.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub skills: SkillsConfig,
    pub api: ApiConfig,
    pub rate_limit: RateLimitSection,
    pub audit: AuditConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// One of: auto, openai-compat, ollama, mlx, mock.
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub max_context_tokens: usize,
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "auto".into(),
            base_url: "http://localhost:11434".into(),
            model: "qwen2.5:7b".into(),
            max_context_tokens: 8192,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// One of: auto, all, minimal.
    pub mode: String,
    pub enabled: Vec<String>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            mode: "auto".into(),
            enabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub secret_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8787,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// One of: free, standard, premium, unlimited.
    pub tier: String,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            tier: "standard".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: String,
    pub max_file_mb: u64,
    pub backups: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: "~/.core-agent/logs".into(),
            max_file_mb: 100,
            backups: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// One of: manual, p2p.
    pub discovery: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            discovery: "manual".into(),
        }
    }
}

impl Config {
    /// Convenience loader for the CLI entry point. Not part of the core surface proper —
    /// the core itself only ever consumes a `Config` value.
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let raw: toml::Value = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("malformed config {}: {}", path.display(), e))?;
        warn_unknown_top_level_keys(&raw);
        let config: Config = raw
            .try_into()
            .map_err(|e| anyhow::anyhow!("malformed config {}: {}", path.display(), e))?;
        Ok(config)
    }
}

fn warn_unknown_top_level_keys(raw: &toml::Value) {
    const KNOWN: &[&str] = &["llm", "skills", "api", "rate_limit", "audit", "cluster"];
    if let Some(table) = raw.as_table() {
        for key in table.keys() {
            if !KNOWN.contains(&key.as_str()) {
                tracing::warn!(key, "unrecognized config option, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let c = Config::default();
        assert_eq!(c.llm.provider, "auto");
        assert_eq!(c.rate_limit.tier, "standard");
        assert_eq!(c.audit.max_file_mb, 100);
        assert_eq!(c.audit.backups, 10);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let raw: toml::Value = toml::from_str("[llm]\nmodel = \"llama3:70b\"\n").unwrap();
        let config: Config = raw.try_into().unwrap();
        assert_eq!(config.llm.model, "llama3:70b");
        assert_eq!(config.api.port, 8787);
    }
}
