use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, Config};
use crate::hooks::{HookContext, HookDispatch, HookPayload, HookRunner};
use crate::tools::{parse_arguments, ToolExecutor};
use crate::types::ToolCall;

use super::context::{CompactionReport, ContextManager};
use super::intent::{AgentType, IntentClassifier};
use super::llm::OllamaClient;
use super::session::{Session, SessionManager};
use super::summarize::summarize;

fn no_session() -> anyhow::Error {
    anyhow!("没有当前会话")
}

pub struct Agent {
    session_manager: SessionManager,
    llm_client: OllamaClient,
    tool_executor: ToolExecutor,
    hooks: HookRunner,
    classifier: Option<IntentClassifier>,
    config: AgentConfig,
    summarize_with_model: bool,
    auto_save: bool,
    workspace_root: PathBuf,
    /// SessionStart hook 给出的上下文，并入下一条用户消息
    pending_context: Vec<String>,
    notices: Vec<String>,
}

impl Agent {
    pub fn new(config: &Config) -> Self {
        let mut loader = ContextManager::new(String::new(), config.context.clone());
        let system_prompt = loader.load_system_prompt(&config.workspace);

        let mut session_manager = SessionManager::new(
            config.session.storage_path.clone(),
            system_prompt,
            config.context.clone(),
            config.agent.provider,
        );
        // 加载所有现有会话
        if let Err(e) = session_manager.load_all() {
            warn!("加载会话失败：{e:#}");
        }

        let workspace_root = config.workspace.root.clone();
        let hooks = if config.hooks.enabled {
            HookRunner::load(&config.hooks.registry, workspace_root.clone())
                .with_default_timeout(Duration::from_secs(config.hooks.default_timeout_secs))
        } else {
            HookRunner::disabled(workspace_root.clone())
        };

        let classifier = config
            .intent
            .enabled
            .then(|| IntentClassifier::new().with_threshold(config.intent.threshold));

        Agent {
            session_manager,
            llm_client: OllamaClient::new(&config.agent),
            tool_executor: ToolExecutor::new(workspace_root.clone()),
            hooks,
            classifier,
            config: config.agent.clone(),
            summarize_with_model: config.context.summarize_with_model,
            auto_save: config.session.auto_save,
            workspace_root,
            pending_context: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn with_client(mut self, client: OllamaClient) -> Self {
        self.llm_client = client;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn client(&self) -> &OllamaClient {
        &self.llm_client
    }

    pub fn is_streaming(&self) -> bool {
        self.config.stream
    }

    pub fn set_streaming(&mut self, stream: bool) {
        self.config.stream = stream;
    }

    /// 获取当前会话 ID
    pub fn current_session_id(&self) -> Option<&str> {
        self.session_manager.current_session_id()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.session_manager.current()
    }

    /// 获取会话管理器（用于 session 命令）
    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// 获取可变会话管理器
    pub fn session_manager_mut(&mut self) -> &mut SessionManager {
        &mut self.session_manager
    }

    /// hook 输出的 systemMessage，由调用方展示
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session_manager.current_mut().ok_or_else(no_session)
    }

    fn hook_context(&self) -> Result<HookContext> {
        let id = self.current_session_id().ok_or_else(no_session)?;
        Ok(HookContext::new(id, self.workspace_root.display().to_string()))
    }

    fn absorb(&mut self, dispatch: &HookDispatch) {
        self.notices.extend(dispatch.system_messages.iter().cloned());
    }

    async fn fire(&mut self, ctx: &HookContext, payload: HookPayload<'_>) -> HookDispatch {
        let dispatch = self.hooks.run(ctx, &payload).await;
        self.absorb(&dispatch);
        dispatch
    }

    /// 恢复已有会话（ID 可为唯一前缀）或新建会话，并触发 SessionStart
    pub async fn start(&mut self, session: Option<&str>) -> Result<String> {
        let source = match session {
            Some(prefix) => {
                let id = self
                    .session_manager
                    .resolve_prefix(prefix)
                    .ok_or_else(|| anyhow!("找不到唯一匹配的会话：{}", prefix))?;
                self.session_manager.switch(&id);
                "resume"
            }
            None => {
                self.session_manager.create(None);
                "startup"
            }
        };

        self.session_started(source).await?;
        self.current_session_id()
            .map(str::to_string)
            .ok_or_else(no_session)
    }

    async fn session_started(&mut self, source: &str) -> Result<()> {
        let ctx = self.hook_context()?;
        let dispatch = self.fire(&ctx, HookPayload::SessionStart { source }).await;
        if let Some(extra) = dispatch.context_block() {
            self.pending_context.push(extra);
        }
        Ok(())
    }

    /// 结束当前会话并新建一个
    pub async fn new_session(&mut self, name: Option<String>) -> Result<String> {
        if self.current_session_id().is_some() {
            self.end("new").await?;
        }
        let id = self.session_manager.create(name).id().to_string();
        self.session_started("startup").await?;
        Ok(id)
    }

    /// 固定 agent 类型；None 恢复按意图自动路由
    pub fn pin_agent(&mut self, agent: Option<AgentType>) -> Result<()> {
        self.session_mut()?.pin_agent(agent);
        Ok(())
    }

    fn route(&mut self, prompt: &str) -> Result<()> {
        let classifier = match &self.classifier {
            Some(c) => c,
            None => return Ok(()),
        };
        let session = self.session_manager.current_mut().ok_or_else(no_session)?;
        if session.is_pinned() {
            return Ok(());
        }

        if let Some(found) = classifier.classify(prompt) {
            if session.agent_type() != Some(found.agent) {
                info!(agent = %found.agent, confidence = found.confidence, "切换 agent 类型");
                session.set_agent_type(Some(found.agent));
            }
        }
        Ok(())
    }

    pub async fn chat(&mut self, user_input: &str) -> Result<String> {
        self.chat_with(user_input, |_| {}).await
    }

    /// 处理一轮对话；流式模式下增量文本交给 on_delta
    pub async fn chat_with<F>(&mut self, user_input: &str, mut on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let ctx = self.hook_context()?;

        let dispatch = self
            .fire(&ctx, HookPayload::UserPromptSubmit { prompt: user_input })
            .await;
        if let Some(reason) = &dispatch.blocked {
            return Ok(format!("提示被 hook 拦截：{}", reason));
        }

        let mut extra = std::mem::take(&mut self.pending_context);
        extra.extend(dispatch.context_block());
        let user_message = if extra.is_empty() {
            user_input.to_string()
        } else {
            format!(
                "{}\n\n<hook-context>\n{}\n</hook-context>",
                user_input,
                extra.join("\n")
            )
        };

        self.route(user_input)?;
        self.session_mut()?.context_mut().add_user(&user_message);

        if self.session_mut()?.context().needs_compaction() {
            self.compact_session(&ctx, "auto", None).await?;
        }

        let max_iterations = self.config.max_iterations;
        let max_tool_calls = self.config.max_tool_calls;
        let mut stop_hook_active = false;

        for iteration in 1..=max_iterations {
            debug!(iteration, max_iterations, "调用模型");

            let result = {
                let tools = self.tool_executor.get_tools();
                let session = self.session_manager.current_mut().ok_or_else(no_session)?;
                if self.config.stream {
                    session
                        .send_streaming(&self.llm_client, Some(tools), &mut on_delta)
                        .await
                } else {
                    session.send(&self.llm_client, Some(tools)).await
                }
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    let error_msg = format!("抱歉，AI 服务暂时不可用：{}", e);
                    warn!("{error_msg}");
                    self.session_mut()?.context_mut().add_assistant(&error_msg, None);
                    self.fire(&ctx, HookPayload::Notification { message: &error_msg })
                        .await;
                    self.autosave();
                    return Ok(error_msg);
                }
            };

            match reply.tool_calls.filter(|calls| !calls.is_empty()) {
                Some(calls) if calls.len() > max_tool_calls => {
                    let warning_msg = format!(
                        "检测到过多的工具调用 ({}个，上限 {})，已跳过",
                        calls.len(),
                        max_tool_calls
                    );
                    warn!("{warning_msg}");
                    let context = self.session_mut()?.context_mut();
                    for call in &calls {
                        context.add_tool_result(&call.id, &warning_msg);
                    }
                }
                Some(calls) => self.execute_tool_calls(&ctx, &calls).await?,
                None => {
                    let dispatch = self
                        .fire(&ctx, HookPayload::Stop { stop_hook_active })
                        .await;
                    if let Some(reason) = dispatch.blocked {
                        if !stop_hook_active {
                            debug!(%reason, "Stop hook 要求继续");
                            stop_hook_active = true;
                            self.session_mut()?.context_mut().add_user(&reason);
                            continue;
                        }
                    }

                    self.session_mut()?.touch();
                    self.autosave();
                    return Ok(reply.content);
                }
            }
        }

        let timeout_msg = "对话已达到最大处理次数，请简化您的问题或重新开始对话".to_string();
        self.session_mut()?.context_mut().add_assistant(&timeout_msg, None);
        self.fire(&ctx, HookPayload::Notification { message: &timeout_msg })
            .await;
        self.autosave();
        Ok(timeout_msg)
    }

    async fn execute_tool_calls(&mut self, ctx: &HookContext, tool_calls: &[ToolCall]) -> Result<()> {
        for tool_call in tool_calls {
            let name = tool_call.function.name.as_str();
            let result = match parse_arguments(tool_call) {
                Err(e) => {
                    warn!(tool = name, "工具参数解析失败：{e:#}");
                    format!("工具参数解析失败：{:#}", e)
                }
                Ok(args) => {
                    let pre = self
                        .fire(ctx, HookPayload::PreToolUse { tool_name: name, tool_input: &args })
                        .await;

                    match pre.blocked {
                        Some(reason) => {
                            info!(tool = name, %reason, "工具调用被 hook 拦截");
                            format!("工具调用被 hook 拦截：{}", reason)
                        }
                        None => {
                            debug!(tool = name, args = %args, "调用工具");
                            let output = match self.tool_executor.execute(name, &args).await {
                                Ok(res) => res,
                                Err(e) => format!("工具执行失败：{:#}", e),
                            };

                            let post = self
                                .fire(
                                    ctx,
                                    HookPayload::PostToolUse {
                                        tool_name: name,
                                        tool_input: &args,
                                        tool_response: &output,
                                    },
                                )
                                .await;

                            let mut result = output;
                            if let Some(reason) = &post.blocked {
                                result.push_str(&format!("\n\nhook 反馈：{}", reason));
                            }
                            if let Some(extra) = post.context_block() {
                                result.push_str(&format!("\n\n{}", extra));
                            }
                            result
                        }
                    }
                }
            };

            self.session_mut()?
                .context_mut()
                .add_tool_result(&tool_call.id, &result);
        }

        Ok(())
    }

    async fn compact_session(
        &mut self,
        ctx: &HookContext,
        trigger: &str,
        instructions: Option<&str>,
    ) -> Result<Option<CompactionReport>> {
        let dispatch = self
            .fire(
                ctx,
                HookPayload::PreCompact {
                    trigger,
                    custom_instructions: instructions,
                },
            )
            .await;
        if let Some(reason) = &dispatch.blocked {
            info!(%reason, "压缩被 hook 拦截");
            return Ok(None);
        }

        let mut guidance: Vec<String> = instructions.map(str::to_string).into_iter().collect();
        guidance.extend(dispatch.context_block());
        let guidance = guidance.join("\n");

        let session = self.session_manager.current_mut().ok_or_else(no_session)?;
        if self.summarize_with_model {
            let span = session.context().compaction_span().to_vec();
            if !span.is_empty() {
                match summarize(&self.llm_client, &span, Some(&guidance)).await {
                    Ok(summary) => return Ok(session.context_mut().compact_with_summary(&summary)),
                    Err(e) => warn!("模型摘要失败，改用本地压缩：{e}"),
                }
            }
        }

        Ok(session.context_mut().compact())
    }

    /// 手动压缩（/compact）
    pub async fn compact_now(&mut self, instructions: Option<&str>) -> Result<Option<CompactionReport>> {
        let ctx = self.hook_context()?;
        let report = self.compact_session(&ctx, "manual", instructions).await?;
        if report.is_some() {
            self.session_mut()?.touch();
            self.autosave();
        }
        Ok(report)
    }

    /// 触发 SessionEnd 并保存
    pub async fn end(&mut self, reason: &str) -> Result<()> {
        let ctx = self.hook_context()?;
        self.fire(&ctx, HookPayload::SessionEnd { reason }).await;
        self.save_current_session()
    }

    /// 保存当前会话
    pub fn save_current_session(&self) -> Result<()> {
        self.session_manager.save_current()
    }

    fn autosave(&self) {
        if self.auto_save {
            if let Err(e) = self.save_current_session() {
                warn!("自动保存会话失败：{e:#}");
            }
        }
    }

    /// 清空当前会话历史（/clear）
    pub async fn clear_history(&mut self) -> Result<()> {
        let session = self.session_mut()?;
        session.context_mut().clear();
        if !session.is_pinned() {
            session.set_agent_type(None);
        }
        session.touch();
        self.pending_context.clear();
        self.session_started("clear").await
    }
}
