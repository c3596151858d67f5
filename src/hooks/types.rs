//! Hook 注册表、事件与输入输出的数据结构。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PreCompact,
    Stop,
    Notification,
}

impl HookEvent {
    pub const ALL: [HookEvent; 8] = [
        HookEvent::SessionStart,
        HookEvent::SessionEnd,
        HookEvent::UserPromptSubmit,
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
        HookEvent::PreCompact,
        HookEvent::Stop,
        HookEvent::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::Stop => "Stop",
            HookEvent::Notification => "Notification",
        }
    }

    /// 纯文本 stdout 是否作为附加上下文
    pub fn accepts_plain_context(&self) -> bool {
        matches!(self, HookEvent::UserPromptSubmit | HookEvent::SessionStart)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("未知 hook 事件：{}", s))
    }
}

fn default_kind() -> String {
    "command".to_string()
}

/// 一条 hook 命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub command: String,
    /// 超时秒数，缺省使用 runner 的默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// 一组共享 matcher 的命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    #[serde(default)]
    pub hooks: Vec<HookCommand>,
}

/// hooks.json 的结构
///
/// ```json
/// { "hooks": { "PreToolUse": [ { "matcher": "fs_write|fs_patch",
///     "hooks": [ { "type": "command", "command": "./guard.sh", "timeout": 10 } ] } ] } }
/// ```
///
/// 以字符串为键读取，未知事件名在加载时告警后忽略。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookRegistry {
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<HookMatcher>>,
}

impl HookRegistry {
    pub fn groups(&self, event: HookEvent) -> &[HookMatcher] {
        self.hooks
            .get(event.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 不属于任何已知事件的键
    pub fn unknown_events(&self) -> Vec<&str> {
        self.hooks
            .keys()
            .filter(|k| !HookEvent::ALL.iter().any(|e| e.as_str() == k.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        HookEvent::ALL
            .iter()
            .all(|e| self.groups(*e).iter().all(|g| g.hooks.is_empty()))
    }
}

/// 运行 hook 时的会话信息
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: String,
    pub cwd: String,
}

impl HookContext {
    pub fn new(session_id: impl Into<String>, cwd: impl Into<String>) -> Self {
        HookContext {
            session_id: session_id.into(),
            cwd: cwd.into(),
        }
    }
}

/// 各事件的专有字段
#[derive(Debug, Clone)]
pub enum HookPayload<'a> {
    SessionStart { source: &'a str },
    SessionEnd { reason: &'a str },
    UserPromptSubmit { prompt: &'a str },
    PreToolUse { tool_name: &'a str, tool_input: &'a Value },
    PostToolUse { tool_name: &'a str, tool_input: &'a Value, tool_response: &'a str },
    PreCompact { trigger: &'a str, custom_instructions: Option<&'a str> },
    Stop { stop_hook_active: bool },
    Notification { message: &'a str },
}

impl HookPayload<'_> {
    pub fn event(&self) -> HookEvent {
        match self {
            HookPayload::SessionStart { .. } => HookEvent::SessionStart,
            HookPayload::SessionEnd { .. } => HookEvent::SessionEnd,
            HookPayload::UserPromptSubmit { .. } => HookEvent::UserPromptSubmit,
            HookPayload::PreToolUse { .. } => HookEvent::PreToolUse,
            HookPayload::PostToolUse { .. } => HookEvent::PostToolUse,
            HookPayload::PreCompact { .. } => HookEvent::PreCompact,
            HookPayload::Stop { .. } => HookEvent::Stop,
            HookPayload::Notification { .. } => HookEvent::Notification,
        }
    }

    /// matcher 比较的对象；None 表示该事件不过滤
    pub fn match_target(&self) -> Option<&str> {
        match self {
            HookPayload::PreToolUse { tool_name, .. } | HookPayload::PostToolUse { tool_name, .. } => {
                Some(*tool_name)
            }
            HookPayload::PreCompact { trigger, .. } => Some(*trigger),
            HookPayload::SessionStart { source } => Some(*source),
            HookPayload::SessionEnd { reason } => Some(*reason),
            _ => None,
        }
    }

    /// 写入 hook stdin 的 JSON
    pub fn to_json(&self, ctx: &HookContext) -> Value {
        let mut map = Map::new();
        map.insert("session_id".into(), json!(ctx.session_id));
        map.insert("cwd".into(), json!(ctx.cwd));
        map.insert("hook_event_name".into(), json!(self.event().as_str()));

        let fields = match self {
            HookPayload::SessionStart { source } => json!({ "source": source }),
            HookPayload::SessionEnd { reason } => json!({ "reason": reason }),
            HookPayload::UserPromptSubmit { prompt } => json!({ "prompt": prompt }),
            HookPayload::PreToolUse { tool_name, tool_input } => json!({
                "tool_name": tool_name,
                "tool_input": tool_input,
            }),
            HookPayload::PostToolUse { tool_name, tool_input, tool_response } => json!({
                "tool_name": tool_name,
                "tool_input": tool_input,
                "tool_response": tool_response,
            }),
            HookPayload::PreCompact { trigger, custom_instructions } => json!({
                "trigger": trigger,
                "custom_instructions": custom_instructions.unwrap_or(""),
            }),
            HookPayload::Stop { stop_hook_active } => json!({ "stop_hook_active": stop_hook_active }),
            HookPayload::Notification { message } => json!({ "message": message }),
        };

        if let Value::Object(extra) = fields {
            map.extend(extra);
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    Approve,
    Block,
}

/// hook stdout 中的 JSON 结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HookDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

impl HookOutput {
    /// 只接受 JSON 对象，其他内容视为纯文本
    pub fn parse(stdout: &str) -> Option<HookOutput> {
        let trimmed = stdout.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Success,
    Blocked,
    Failed,
    TimedOut,
}

/// 单条命令的执行结果
#[derive(Debug, Clone)]
pub struct HookResult {
    pub command: String,
    pub outcome: HookOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output: Option<HookOutput>,
}

/// 一次事件分发的汇总
#[derive(Debug, Clone, Default)]
pub struct HookDispatch {
    pub blocked: Option<String>,
    pub additional_context: Vec<String>,
    pub system_messages: Vec<String>,
    pub results: Vec<HookResult>,
}

impl HookDispatch {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// 附加上下文合并为一段文本
    pub fn context_block(&self) -> Option<String> {
        if self.additional_context.is_empty() {
            None
        } else {
            Some(self.additional_context.join("\n"))
        }
    }
}
