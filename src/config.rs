use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::tokens::Provider;

/// ~/.ollie 根目录
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ollie")
}

/// Agent 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub base_url: String,
    pub max_iterations: usize,
    pub max_llm_retries: usize,
    pub max_tool_calls: usize,
    pub request_timeout_secs: u64,
    pub provider: Provider,
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            model: "qwen3:4b-instruct-2507-q4_K_M".to_string(),
            base_url: "http://localhost:11434".to_string(),
            max_iterations: 10,
            max_llm_retries: 3,
            max_tool_calls: 5,
            request_timeout_secs: 300,
            provider: Provider::Ollama,
            stream: true,
        }
    }
}

/// 上下文窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// 模型上下文窗口大小（估算 token）
    pub max_tokens: usize,
    /// 触发压缩的占用比例
    pub compaction_threshold: f64,
    /// 压缩后保留的最近消息数
    pub keep_recent: usize,
    /// 使用模型生成摘要，否则本地抽取
    pub summarize_with_model: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            max_tokens: 8192,
            compaction_threshold: 0.8,
            keep_recent: 10,
            summarize_with_model: false,
        }
    }
}

/// 意图路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub enabled: bool,
    pub threshold: f64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        IntentConfig {
            enabled: true,
            threshold: 0.5,
        }
    }
}

/// Hook 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: bool,
    pub registry: PathBuf,
    pub default_timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        HooksConfig {
            enabled: true,
            registry: home_dir().join("hooks.json"),
            default_timeout_secs: 60,
        }
    }
}

/// Workspace 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub agent_file: PathBuf,
    pub soul_file: PathBuf,
    pub user_file: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let base = home_dir().join("workspace");

        WorkspaceConfig {
            root: base.clone(),
            agent_file: base.join("AGENT.md"),
            soul_file: base.join("SOUL.md"),
            user_file: base.join("USER.md"),
        }
    }
}

/// Session 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub storage_path: PathBuf,
    pub auto_save: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            storage_path: home_dir().join("sessions"),
            auto_save: true,
        }
    }
}

/// 统一配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub context: ContextConfig,
    pub intent: IntentConfig,
    pub hooks: HooksConfig,
    pub workspace: WorkspaceConfig,
    pub session: SessionConfig,
}

impl Config {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        home_dir().join("config.toml")
    }

    /// 从文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败：{}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败：{}", path.display()))?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 从默认位置加载配置
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// 确保 workspace 目录存在
    pub fn ensure_workspace(&self) -> Result<()> {
        fs::create_dir_all(&self.workspace.root)?;
        Ok(())
    }

    /// 确保 sessions 目录存在
    pub fn ensure_sessions(&self) -> Result<()> {
        fs::create_dir_all(&self.session.storage_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent]\nmodel = \"llama3\"\n\n[context]\nkeep_recent = 4\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.agent.model, "llama3");
        assert_eq!(config.agent.base_url, "http://localhost:11434");
        assert_eq!(config.context.keep_recent, 4);
        assert_eq!(config.context.max_tokens, 8192);
        assert!(config.hooks.enabled);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.agent.max_llm_retries, 3);
        assert_eq!(config.intent.threshold, 0.5);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.agent.provider = Provider::Anthropic;
        config.context.compaction_threshold = 0.6;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.agent.provider, Provider::Anthropic);
        assert_eq!(loaded.context.compaction_threshold, 0.6);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent\nmodel = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
