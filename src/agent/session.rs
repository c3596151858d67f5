use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::types::{ChatResponse, Message, Tool};

use super::context::ContextManager;
use super::intent::AgentType;
use super::llm::{collect_chat, OllamaClient, OllamaError};
use super::tokens::{Provider, TokenCounter};

/// 会话数据结构（用于序列化）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionData {
    id: String,
    #[serde(default)]
    name: Option<String>,
    system_prompt: String,
    messages: Vec<Message>,
    #[serde(default)]
    agent_type: Option<AgentType>,
    #[serde(default)]
    agent_pinned: bool,
    #[serde(default)]
    usage: Option<TokenCounter>,
    #[serde(default)]
    compactions: usize,
    created_at: String,
    updated_at: String,
}

/// 会话元数据
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub agent_type: Option<AgentType>,
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// 会话 - 上下文、token 统计与元数据
pub struct Session {
    id: String,
    context: ContextManager,
    tokens: TokenCounter,
    metadata: SessionMetadata,
    agent_pinned: bool,
}

impl Session {
    pub fn new(id: String, context: ContextManager, tokens: TokenCounter) -> Self {
        let now = Utc::now();
        Session {
            id,
            context,
            tokens,
            metadata: SessionMetadata {
                name: None,
                created_at: now,
                updated_at: now,
                message_count: 0,
                agent_type: None,
            },
            agent_pinned: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn tokens(&self) -> &TokenCounter {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut TokenCounter {
        &mut self.tokens
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn rename(&mut self, name: &str) {
        self.metadata.name = Some(name.to_string());
        self.touch();
    }

    pub fn agent_type(&self) -> Option<AgentType> {
        self.metadata.agent_type
    }

    /// 切换 agent 类型并更新角色提示
    pub fn set_agent_type(&mut self, agent: Option<AgentType>) {
        self.metadata.agent_type = agent;
        self.context
            .set_role_prompt(agent.map(|a| a.role_prompt().to_string()));
    }

    /// 固定 agent 类型，之后不再按意图自动路由；None 恢复自动
    pub fn pin_agent(&mut self, agent: Option<AgentType>) {
        self.agent_pinned = agent.is_some();
        self.set_agent_type(agent);
    }

    pub fn is_pinned(&self) -> bool {
        self.agent_pinned
    }

    /// 刷新更新时间与消息数
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
        self.metadata.message_count = self.context.len();
    }

    /// 发送当前上下文，记录用量并追加助手回复
    pub async fn send(
        &mut self,
        client: &OllamaClient,
        tools: Option<&[Tool]>,
    ) -> Result<Message, OllamaError> {
        let response = client.chat(&self.context.messages(), tools).await?;
        Ok(self.accept(response))
    }

    /// 流式版本，增量文本交给 on_delta
    pub async fn send_streaming<F>(
        &mut self,
        client: &OllamaClient,
        tools: Option<&[Tool]>,
        on_delta: F,
    ) -> Result<Message, OllamaError>
    where
        F: FnMut(&str),
    {
        let stream = client.chat_stream(&self.context.messages(), tools).await?;
        let response = collect_chat(stream, on_delta).await?;
        Ok(self.accept(response))
    }

    fn accept(&mut self, response: ChatResponse) -> Message {
        self.tokens.record(&response.raw);

        let mut message = response.message;
        message.role = "assistant".to_string();
        // Ollama 不返回 tool call id，压缩后位置会复用，所以用 uuid
        for call in message.tool_calls.iter_mut().flatten() {
            if call.id.is_empty() {
                call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
        }

        self.context
            .add_assistant(&message.content, message.tool_calls.clone());
        self.touch();
        message
    }

    /// 保存到 `<dir>/<id>.json`
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = SessionData {
            id: self.id.clone(),
            name: self.metadata.name.clone(),
            system_prompt: self.context.system_prompt().to_string(),
            messages: self.context.raw_messages().to_vec(),
            agent_type: self.metadata.agent_type,
            agent_pinned: self.agent_pinned,
            usage: Some(self.tokens.clone()),
            compactions: self.context.compactions(),
            created_at: self.metadata.created_at.to_rfc3339(),
            updated_at: self.metadata.updated_at.to_rfc3339(),
        };

        fs::create_dir_all(dir)
            .with_context(|| format!("创建会话目录失败：{}", dir.display()))?;

        let path = dir.join(format!("{}.json", self.id));
        fs::write(&path, serde_json::to_string_pretty(&data)?)
            .with_context(|| format!("写入会话失败：{}", path.display()))?;
        debug!(session = %self.id, "会话已保存");
        Ok(())
    }

    /// 从文件加载；上下文配置与计费方式取当前配置
    pub fn load(path: &Path, config: ContextConfig, provider: Provider) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取会话失败：{}", path.display()))?;
        let data: SessionData = serde_json::from_str(&content)
            .with_context(|| format!("解析会话失败：{}", path.display()))?;

        let mut context = ContextManager::new(data.system_prompt, config);
        for msg in data.messages {
            context.push(msg);
        }
        context.set_compactions(data.compactions);

        let mut session = Session {
            id: data.id,
            context,
            tokens: data.usage.unwrap_or_else(|| TokenCounter::new(provider)),
            metadata: SessionMetadata {
                name: data.name,
                created_at: parse_timestamp(&data.created_at),
                updated_at: parse_timestamp(&data.updated_at),
                message_count: 0,
                agent_type: None,
            },
            agent_pinned: data.agent_pinned,
        };
        session.set_agent_type(data.agent_type);
        session.metadata.message_count = session.context.len();
        Ok(session)
    }
}

/// 会话管理器
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    storage_path: PathBuf,
    current_session_id: Option<String>,
    system_prompt: String,
    context_config: ContextConfig,
    provider: Provider,
}

impl SessionManager {
    pub fn new(
        storage_path: PathBuf,
        system_prompt: String,
        context_config: ContextConfig,
        provider: Provider,
    ) -> Self {
        SessionManager {
            sessions: HashMap::new(),
            storage_path,
            current_session_id: None,
            system_prompt,
            context_config,
            provider,
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// 创建新会话并设为当前会话
    pub fn create(&mut self, name: Option<String>) -> &mut Session {
        let id = uuid::Uuid::new_v4().to_string();
        let context = ContextManager::new(self.system_prompt.clone(), self.context_config.clone());
        let mut session = Session::new(id.clone(), context, TokenCounter::new(self.provider));

        if let Some(name) = name {
            session.rename(&name);
        }

        self.current_session_id = Some(id.clone());
        self.sessions.entry(id).or_insert(session)
    }

    /// 获取会话
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// 获取可变会话
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    /// 获取当前会话
    pub fn current(&self) -> Option<&Session> {
        self.current_session_id
            .as_ref()
            .and_then(|id| self.sessions.get(id))
    }

    /// 获取当前可变会话
    pub fn current_mut(&mut self) -> Option<&mut Session> {
        match &self.current_session_id {
            Some(id) => self.sessions.get_mut(id),
            None => None,
        }
    }

    /// 切换会话
    pub fn switch(&mut self, id: &str) -> bool {
        if self.sessions.contains_key(id) {
            self.current_session_id = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// 删除会话（内存与磁盘）
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = None;
        }
        let in_memory = self.sessions.remove(id).is_some();

        let path = self.session_path(id);
        let on_disk = path.exists();
        if on_disk {
            fs::remove_file(&path)
                .with_context(|| format!("删除会话文件失败：{}", path.display()))?;
        }

        Ok(in_memory || on_disk)
    }

    /// 列出所有会话，最近更新的在前
    pub fn list(&self) -> Vec<(&str, &SessionMetadata)> {
        let mut items: Vec<(&str, &SessionMetadata)> = self
            .sessions
            .iter()
            .map(|(id, session)| (id.as_str(), session.metadata()))
            .collect();
        items.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        items
    }

    /// 按 ID 前缀查找，仅在唯一时返回
    pub fn resolve_prefix(&self, prefix: &str) -> Option<String> {
        if prefix.is_empty() {
            return None;
        }
        if self.sessions.contains_key(prefix) {
            return Some(prefix.to_string());
        }

        let mut matches = self.sessions.keys().filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id.clone()),
            _ => None,
        }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", id))
    }

    /// 保存会话
    pub fn save(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("会话不存在：{}", id))?;

        session.save(&self.storage_path)
    }

    /// 保存当前会话
    pub fn save_current(&self) -> Result<()> {
        let id = self
            .current_session_id
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("没有当前会话"))?;
        self.save(id)
    }

    /// 加载会话
    pub fn load(&mut self, id: &str) -> Result<()> {
        let session = Session::load(
            &self.session_path(id),
            self.context_config.clone(),
            self.provider,
        )?;
        self.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// 加载所有会话，无法解析的文件跳过
    pub fn load_all(&mut self) -> Result<()> {
        if !self.storage_path.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&self.storage_path)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if let Err(e) = self.load(id) {
                    warn!(path = %path.display(), "跳过无法加载的会话：{e:#}");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tokens::TokenUsage;
    use pretty_assertions::assert_eq;

    fn manager(dir: &Path) -> SessionManager {
        SessionManager::new(
            dir.to_path_buf(),
            "system".to_string(),
            ContextConfig::default(),
            Provider::Ollama,
        )
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut sessions = manager(dir.path());

        let session = sessions.create(Some("demo".into()));
        session.context_mut().add_user("你好");
        session.context_mut().add_assistant("你好！", None);
        session.pin_agent(Some(AgentType::Debugger));
        session.tokens_mut().record_usage(TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 3,
        });
        session.touch();
        let id = session.id().to_string();
        sessions.save(&id).unwrap();

        let mut reloaded = manager(dir.path());
        reloaded.load(&id).unwrap();
        let session = reloaded.get(&id).unwrap();

        assert_eq!(session.metadata().name.as_deref(), Some("demo"));
        assert_eq!(session.metadata().message_count, 2);
        assert_eq!(session.agent_type(), Some(AgentType::Debugger));
        assert!(session.is_pinned());
        assert_eq!(session.tokens().total_tokens(), 15);
        assert_eq!(session.context().raw_messages()[0].content, "你好");
        assert_eq!(session.context().system_prompt(), "system");
        assert_eq!(
            session.context().role_prompt(),
            Some(AgentType::Debugger.role_prompt())
        );
    }

    #[test]
    fn tool_call_ids_stay_unique_across_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut sessions = SessionManager::new(
            dir.path().to_path_buf(),
            "system".to_string(),
            ContextConfig {
                keep_recent: 2,
                ..ContextConfig::default()
            },
            Provider::Ollama,
        );
        let session = sessions.create(None);

        let response = || -> ChatResponse {
            serde_json::from_value(serde_json::json!({
                "model": "m",
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [
                        {"function": {"name": "get_time", "arguments": {}}},
                        {"function": {"name": "get_time", "arguments": {}}}
                    ]
                },
                "done": true
            }))
            .unwrap()
        };

        session.context_mut().add_user("q1");
        let first = session.accept(response());
        session.context_mut().add_user("q2");
        session.context_mut().compact().unwrap();
        let second = session.accept(response());

        let mut ids: Vec<String> = first
            .tool_calls
            .into_iter()
            .chain(second.tool_calls)
            .flatten()
            .map(|c| c.id)
            .collect();
        assert!(ids.iter().all(|id| id.starts_with("call_")));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn load_tolerates_bad_timestamps_and_missing_usage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("abc.json"),
            r#"{"id": "abc", "system_prompt": "s", "messages": [],
                "created_at": "yesterday", "updated_at": ""}"#,
        )
        .unwrap();

        let mut sessions = manager(dir.path());
        sessions.load_all().unwrap();
        let session = sessions.get("abc").unwrap();
        assert_eq!(session.tokens().total_tokens(), 0);
        assert_eq!(session.agent_type(), None);
    }

    #[test]
    fn list_is_sorted_by_recent_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut sessions = manager(dir.path());
        let first = sessions.create(Some("first".into())).id().to_string();
        let second = sessions.create(Some("second".into())).id().to_string();

        std::thread::sleep(std::time::Duration::from_millis(5));
        sessions.get_mut(&first).unwrap().touch();

        let ids: Vec<&str> = sessions.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
        assert_eq!(sessions.current_session_id(), Some(second.as_str()));
    }

    #[test]
    fn resolve_prefix_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["abc123", "abd456"] {
            std::fs::write(
                dir.path().join(format!("{id}.json")),
                format!(
                    r#"{{"id": "{id}", "system_prompt": "s", "messages": [],
                        "created_at": "", "updated_at": ""}}"#
                ),
            )
            .unwrap();
        }

        let mut sessions = manager(dir.path());
        sessions.load_all().unwrap();
        assert_eq!(sessions.resolve_prefix("abc"), Some("abc123".to_string()));
        assert_eq!(sessions.resolve_prefix("ab"), None);
        assert_eq!(sessions.resolve_prefix("zzz"), None);
        assert_eq!(sessions.resolve_prefix(""), None);
    }

    #[test]
    fn delete_removes_file_and_current() {
        let dir = tempfile::tempdir().unwrap();
        let mut sessions = manager(dir.path());
        let id = sessions.create(None).id().to_string();
        sessions.save_current().unwrap();
        assert!(dir.path().join(format!("{id}.json")).exists());

        assert!(sessions.delete(&id).unwrap());
        assert!(!dir.path().join(format!("{id}.json")).exists());
        assert!(sessions.current().is_none());
        assert!(!sessions.delete(&id).unwrap());
        assert!(sessions.save_current().is_err());
    }
}
