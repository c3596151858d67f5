use std::fs;

use tracing::debug;

use crate::config::{ContextConfig, WorkspaceConfig};
use crate::types::{Message, ToolCall};

/// 摘要消息前缀，用于识别之前的压缩结果
pub const SUMMARY_PREFIX: &str = "[对话摘要]";

/// 抽取式摘要中每条消息保留的字符数
const SUMMARY_SNIPPET_CHARS: usize = 120;

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个有用的助手。你可以使用工具来帮助用户。\n\
当你调用工具后，请根据工具返回的结果直接回答用户的问题，不要编造信息。\n\
如果工具已经给出了完整答案，请简洁地转述给用户，不要添加多余的自我介绍。";

/// 按 字符数/4 估算 token
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// 一次压缩的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub removed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// 上下文管理器 - 对话历史、系统提示与自动压缩
pub struct ContextManager {
    system_prompt: String,
    role_prompt: Option<String>,
    messages: Vec<Message>,
    config: ContextConfig,
    compactions: usize,
}

impl ContextManager {
    pub fn new(system_prompt: String, config: ContextConfig) -> Self {
        ContextManager {
            system_prompt,
            role_prompt: None,
            messages: Vec::new(),
            config,
            compactions: 0,
        }
    }

    /// 从 workspace 配置加载系统提示
    pub fn load_system_prompt(&mut self, config: &WorkspaceConfig) -> String {
        let agent = fs::read_to_string(&config.agent_file).unwrap_or_default();
        let soul = fs::read_to_string(&config.soul_file).unwrap_or_default();
        let user = fs::read_to_string(&config.user_file).unwrap_or_default();

        let mut prompt = String::new();

        if !agent.trim().is_empty() {
            prompt.push_str(&format!("## 角色定义\n{}\n\n", agent.trim()));
        }
        if !soul.trim().is_empty() {
            prompt.push_str(&format!("## 对话风格\n{}\n\n", soul.trim()));
        }
        if !user.trim().is_empty() {
            prompt.push_str(&format!("## 用户信息\n{}\n\n", user.trim()));
        }

        // 默认兜底
        if prompt.is_empty() {
            prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }

        self.system_prompt = prompt.trim().to_string();
        self.system_prompt.clone()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// 设置/清除当前 agent 类型的角色提示
    pub fn set_role_prompt(&mut self, role_prompt: Option<String>) {
        self.role_prompt = role_prompt;
    }

    pub fn role_prompt(&self) -> Option<&str> {
        self.role_prompt.as_deref()
    }

    /// 添加用户消息
    pub fn add_user(&mut self, content: &str) {
        self.messages.push(Message::user(content));
    }

    /// 添加助手消息
    pub fn add_assistant(&mut self, content: &str, tool_calls: Option<Vec<ToolCall>>) {
        let mut message = Message::assistant(content);
        message.tool_calls = tool_calls;
        self.messages.push(message);
    }

    /// 添加工具结果
    pub fn add_tool_result(&mut self, tool_call_id: &str, content: &str) {
        self.messages.push(Message::tool(tool_call_id, content));
    }

    /// 追加一条已构造好的消息（会话恢复时使用）
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn system_content(&self) -> String {
        match &self.role_prompt {
            Some(role) if !role.is_empty() => format!("{}\n\n{}", self.system_prompt, role),
            _ => self.system_prompt.clone(),
        }
    }

    /// 获取所有消息（包含系统提示）
    pub fn messages(&self) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.messages.len() + 1);
        all.push(Message::system(self.system_content()));
        all.extend(self.messages.iter().cloned());
        all
    }

    /// 获取原始消息（不含系统提示）
    pub fn raw_messages(&self) -> &[Message] {
        &self.messages
    }

    /// 估算当前上下文的 token 数
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system_content())
            + self
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>()
    }

    /// 上下文占用比例
    pub fn usage_ratio(&self) -> f64 {
        if self.config.max_tokens == 0 {
            return 1.0;
        }
        self.estimated_tokens() as f64 / self.config.max_tokens as f64
    }

    pub fn needs_compaction(&self) -> bool {
        let limit = self.config.compaction_threshold * self.config.max_tokens as f64;
        self.estimated_tokens() as f64 >= limit
    }

    /// 保留窗口的起点：最近 keep_recent 条，且不以 tool 消息开头
    fn split_index(&self) -> usize {
        let len = self.messages.len();
        let mut split = len.saturating_sub(self.config.keep_recent);
        while split > 0 && split < len && self.messages[split].role == "tool" {
            split -= 1;
        }
        split
    }

    /// 将被压缩的旧消息
    pub fn compaction_span(&self) -> &[Message] {
        &self.messages[..self.split_index()]
    }

    /// 用给定摘要替换旧消息
    pub fn compact_with_summary(&mut self, summary: &str) -> Option<CompactionReport> {
        let split = self.split_index();
        if split == 0 {
            return None;
        }

        let tokens_before = self.estimated_tokens();
        let summary = format!("{} {}", SUMMARY_PREFIX, summary.trim());
        self.messages
            .splice(..split, std::iter::once(Message::system(summary)));
        self.compactions += 1;

        let report = CompactionReport {
            removed: split,
            tokens_before,
            tokens_after: self.estimated_tokens(),
        };
        debug!(
            removed = report.removed,
            before = report.tokens_before,
            after = report.tokens_after,
            "上下文已压缩"
        );
        Some(report)
    }

    /// 本地抽取式压缩
    pub fn compact(&mut self) -> Option<CompactionReport> {
        let summary = extractive_summary(self.compaction_span());
        self.compact_with_summary(&summary)
    }

    pub fn compact_if_needed(&mut self) -> Option<CompactionReport> {
        if self.needs_compaction() {
            self.compact()
        } else {
            None
        }
    }

    pub fn compactions(&self) -> usize {
        self.compactions
    }

    pub(crate) fn set_compactions(&mut self, compactions: usize) {
        self.compactions = compactions;
    }

    /// 裁剪消息历史，保留最近的 N 条
    pub fn truncate(&mut self, max_messages: usize) {
        if self.messages.len() > max_messages {
            self.messages.drain(0..self.messages.len() - max_messages);
        }
    }

    /// 清空对话历史（保留系统提示）
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 获取系统提示
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 消息数量
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 每条消息一行：角色 + 前 120 字符。旧摘要原样并入
pub fn extractive_summary(span: &[Message]) -> String {
    let mut lines = Vec::with_capacity(span.len() + 1);
    lines.push(format!("已压缩 {} 条较早的消息：", span.len()));

    for msg in span {
        if let Some(previous) = msg.content.strip_prefix(SUMMARY_PREFIX) {
            lines.push(previous.trim().to_string());
            continue;
        }
        let snippet: String = msg
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(SUMMARY_SNIPPET_CHARS)
            .collect();
        let snippet = if snippet.is_empty() && msg.has_tool_calls() {
            let names: Vec<&str> = msg
                .tool_calls
                .iter()
                .flatten()
                .map(|c| c.function.name.as_str())
                .collect();
            format!("(调用工具 {})", names.join(", "))
        } else {
            snippet
        };
        lines.push(format!("- {}: {}", msg.role, snippet));
    }

    lines.join("\n")
}
