use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::types::{
    HookCommand, HookContext, HookDecision, HookDispatch, HookEvent, HookMatcher, HookOutcome,
    HookOutput, HookPayload, HookRegistry, HookResult,
};

/// 退出码 2 表示阻断
const BLOCKING_EXIT_CODE: i32 = 2;

/// 判断 matcher 是否命中目标
///
/// 空、缺省或 `*` 匹配一切；否则按锚定正则匹配，正则非法时退化为精确比较。
pub fn matcher_matches(matcher: Option<&str>, target: Option<&str>) -> bool {
    let pattern = match matcher.map(str::trim) {
        None | Some("") | Some("*") => return true,
        Some(p) => p,
    };
    let target = match target {
        Some(t) => t,
        None => return true,
    };

    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => re.is_match(target),
        Err(_) => pattern == target,
    }
}

/// Hook 执行器 - 按事件匹配注册的命令，经 stdin 传入 JSON，解析 stdout
pub struct HookRunner {
    registry: HookRegistry,
    project_dir: PathBuf,
    default_timeout: Duration,
}

impl HookRunner {
    pub fn new(registry: HookRegistry, project_dir: impl Into<PathBuf>) -> Self {
        for name in registry.unknown_events() {
            warn!(event = name, "忽略未知的 hook 事件");
        }
        HookRunner {
            registry,
            project_dir: project_dir.into(),
            default_timeout: Duration::from_secs(60),
        }
    }

    /// 空注册表，不会运行任何命令
    pub fn disabled(project_dir: impl Into<PathBuf>) -> Self {
        Self::new(HookRegistry::default(), project_dir)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn from_json(json: &str, project_dir: impl Into<PathBuf>) -> Result<Self> {
        let registry: HookRegistry =
            serde_json::from_str(json).context("解析 hook 注册表失败")?;
        Ok(Self::new(registry, project_dir))
    }

    /// 从文件加载；文件不存在或无法解析时返回空注册表
    pub fn load(path: &Path, project_dir: impl Into<PathBuf>) -> Self {
        let registry = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "hook 注册表解析失败：{e}");
                HookRegistry::default()
            }),
            Err(_) => HookRegistry::default(),
        };
        Self::new(registry, project_dir)
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// 已配置命令的事件
    pub fn events(&self) -> Vec<HookEvent> {
        HookEvent::ALL
            .iter()
            .copied()
            .filter(|e| !self.registry.groups(*e).is_empty())
            .collect()
    }

    /// 某事件下命中目标的命令，按注册顺序
    pub fn matching(&self, event: HookEvent, target: Option<&str>) -> Vec<&HookCommand> {
        self.registry
            .groups(event)
            .iter()
            .filter(|group: &&HookMatcher| matcher_matches(group.matcher.as_deref(), target))
            .flat_map(|group| group.hooks.iter())
            .filter(|cmd| cmd.kind == "command")
            .collect()
    }

    /// 分发一个事件：依次运行所有命中的命令并汇总
    pub async fn run(&self, ctx: &HookContext, payload: &HookPayload<'_>) -> HookDispatch {
        let event = payload.event();
        let commands = self.matching(event, payload.match_target());
        let mut dispatch = HookDispatch::default();
        if commands.is_empty() {
            return dispatch;
        }

        let input = payload.to_json(ctx).to_string();
        debug!(event = %event, count = commands.len(), "运行 hook");

        for cmd in commands {
            let result = self.run_command(event, cmd, &input).await;
            Self::merge(event, &mut dispatch, &result);
            dispatch.results.push(result);
        }

        dispatch
    }

    fn merge(event: HookEvent, dispatch: &mut HookDispatch, result: &HookResult) {
        if result.outcome == HookOutcome::Blocked && dispatch.blocked.is_none() {
            let reason = if result.stderr.is_empty() {
                format!("hook `{}` 阻止了 {}", result.command, event)
            } else {
                result.stderr.clone()
            };
            dispatch.blocked = Some(reason);
        }

        if result.outcome != HookOutcome::Success {
            return;
        }

        match &result.output {
            Some(output) => {
                if dispatch.blocked.is_none() {
                    if output.decision == Some(HookDecision::Block) {
                        dispatch.blocked = Some(
                            output
                                .reason
                                .clone()
                                .unwrap_or_else(|| format!("hook `{}` 阻止了 {}", result.command, event)),
                        );
                    } else if output.continue_ == Some(false) {
                        dispatch.blocked = Some(
                            output
                                .stop_reason
                                .clone()
                                .unwrap_or_else(|| format!("hook `{}` 要求停止", result.command)),
                        );
                    }
                }
                if let Some(context) = &output.additional_context {
                    dispatch.additional_context.push(context.clone());
                }
                if let Some(message) = &output.system_message {
                    dispatch.system_messages.push(message.clone());
                }
            }
            None => {
                if event.accepts_plain_context() && !result.stdout.is_empty() {
                    dispatch.additional_context.push(result.stdout.clone());
                }
            }
        }
    }

    async fn run_command(&self, event: HookEvent, cmd: &HookCommand, input: &str) -> HookResult {
        let timeout = cmd
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut result = HookResult {
            command: cmd.command.clone(),
            outcome: HookOutcome::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            output: None,
        };

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&cmd.command)
            .current_dir(&self.project_dir)
            .env("OLLIE_PROJECT_DIR", &self.project_dir)
            .env("OLLIE_HOOK_EVENT", event.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %cmd.command, "hook 启动失败：{e}");
                result.stderr = e.to_string();
                return result;
            }
        };

        // stdin 单独写入，避免 hook 不读 stdin 时阻塞超时计时
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_owned();
            let command = cmd.command.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(command = %command, "写入 hook stdin 失败：{e}");
                }
            })
        });

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }

        match waited {
            Err(_) => {
                warn!(command = %cmd.command, timeout_secs = timeout.as_secs(), "hook 超时，已终止");
                result.outcome = HookOutcome::TimedOut;
            }
            Ok(Err(e)) => {
                warn!(command = %cmd.command, "等待 hook 失败：{e}");
                result.stderr = e.to_string();
            }
            Ok(Ok(output)) => {
                result.exit_code = output.status.code();
                result.stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                result.stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                result.outcome = match result.exit_code {
                    Some(0) => {
                        result.output = HookOutput::parse(&result.stdout);
                        HookOutcome::Success
                    }
                    Some(BLOCKING_EXIT_CODE) => HookOutcome::Blocked,
                    _ => {
                        warn!(
                            command = %cmd.command,
                            code = ?result.exit_code,
                            stderr = %result.stderr,
                            "hook 执行失败"
                        );
                        HookOutcome::Failed
                    }
                };
            }
        }

        result
    }
}
