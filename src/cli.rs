use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;

use reedline::{DefaultCompleter, DefaultHinter, DefaultPrompt, Reedline, Signal};
use tracing_subscriber::EnvFilter;

use crate::agent::{Agent, AgentType, IntentClassifier, OllamaClient, SessionManager};
use crate::config::{home_dir, Config};
use crate::hooks::{HookContext, HookEvent, HookPayload, HookRunner};
use crate::tools::{get_tools_static, is_known};

/// ollie - 本地 Ollama 助手
#[derive(Parser)]
#[command(name = "ollie")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（默认 ~/.ollie/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 覆盖配置中的模型
    #[arg(long, global = true)]
    model: Option<String>,

    /// 覆盖 Ollama 地址
    #[arg(long, global = true)]
    host: Option<String>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 交互式对话（默认）
    Chat {
        /// 继续已有会话（支持唯一前缀）
        #[arg(long)]
        session: Option<String>,
        /// 固定 agent 类型，不做意图路由
        #[arg(long)]
        agent: Option<String>,
        /// 关闭流式输出
        #[arg(long)]
        no_stream: bool,
    },

    /// 单次提问
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long)]
        agent: Option<String>,
    },

    /// 查看提示会被路由到哪个 agent 类型
    Classify {
        #[arg(required = true)]
        prompt: Vec<String>,
        /// 列出所有得分
        #[arg(long)]
        all: bool,
    },

    /// 会话管理
    #[command(subcommand)]
    Session(SessionCommand),

    /// 模型管理
    #[command(subcommand)]
    Models(ModelsCommand),

    /// 生成文本向量
    Embed {
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Hook 管理
    #[command(subcommand)]
    Hooks(HooksCommand),

    /// 初始化配置与 workspace
    Onboard,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// 列出所有会话
    List,
    /// 查看会话内容
    Show { id: String },
    /// 删除会话
    Delete { id: String },
}

#[derive(Subcommand)]
enum ModelsCommand {
    /// 列出本地模型
    List,
    /// 查看模型信息
    Show { name: String },
    /// 下载模型
    Pull { name: String },
    /// 删除模型
    Rm { name: String },
}

#[derive(Subcommand)]
enum HooksCommand {
    /// 列出已注册的 hook
    List,
    /// 用测试数据触发某个事件
    Test {
        event: String,
        /// 匹配目标：工具名、source、reason 或 trigger
        #[arg(long)]
        target: Option<String>,
        /// 工具输入 JSON
        #[arg(long)]
        payload: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path)?;
    if let Some(model) = &cli.model {
        config.agent.model = model.clone();
    }
    if let Some(host) = &cli.host {
        config.agent.base_url = host.clone();
    }
    Ok(config)
}

fn parse_agent(value: Option<&str>) -> Result<Option<AgentType>> {
    value.map(str::parse::<AgentType>).transpose()
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_notices(agent: &mut Agent) {
    for notice in agent.take_notices() {
        println!("ℹ️  {}", notice);
    }
}

fn print_chat_help() {
    println!("命令:");
    println!("  /clear            - 清空当前会话历史");
    println!("  /new [名]         - 创建新会话");
    println!("  /compact [要求]   - 压缩较早的对话");
    println!("  /usage            - 查看 token 用量与上下文占用");
    println!("  /agent [类型|auto] - 查看或固定 agent 类型");
    println!("  /quit             - 退出");
    println!();
}

/// Onboard 命令 - 初始化配置和 workspace
fn run_onboard(config_path: &std::path::Path) -> Result<()> {
    println!("🚀 初始化 ollie 配置...\n");

    let config = Config::default();

    // 创建目录
    config.ensure_workspace().context("创建 workspace 目录失败")?;
    config.ensure_sessions().context("创建 sessions 目录失败")?;

    println!("✅ 创建目录:");
    println!("   Workspace: {}", config.workspace.root.display());
    println!("   Sessions:  {}", config.session.storage_path.display());
    println!();

    if config_path.exists() {
        println!("⏭️  配置已存在：{}", config_path.display());
    } else {
        config.save(config_path).context("保存配置文件失败")?;
        println!("✅ 保存配置：{}", config_path.display());
    }

    let files = [
        (
            &config.workspace.agent_file,
            "# 角色定义\n\n你是一个智能助手，旨在帮助用户完成各种任务。\n你具备使用工具的能力，可以协助用户处理文件、获取信息等。\n",
        ),
        (
            &config.workspace.soul_file,
            "# 对话风格\n\n- 简洁明了\n- 友好专业\n- 用中文回复\n",
        ),
        (
            &config.workspace.user_file,
            "# 用户信息\n\n在此记录你的个人偏好、背景信息和特殊需求。\n",
        ),
        (&config.hooks.registry, "{\n  \"hooks\": {}\n}\n"),
    ];

    for (path, content) in files {
        if path.exists() {
            println!("⏭️  已存在：{}", path.display());
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        println!("✅ 创建：{}", path.display());
    }

    println!();
    println!("🎉 初始化完成！");
    println!();
    println!("你可以:");
    println!("  1. 编辑 {}/workspace/*.md 自定义你的助手", home_dir().display());
    println!("  2. 在 {} 中注册 hook", config.hooks.registry.display());
    println!("  3. 运行 'ollie chat' 开始对话");

    Ok(())
}

fn session_manager(config: &Config) -> Result<SessionManager> {
    let mut manager = SessionManager::new(
        config.session.storage_path.clone(),
        String::new(),
        config.context.clone(),
        config.agent.provider,
    );
    manager.load_all()?;
    Ok(manager)
}

fn resolve_session(manager: &SessionManager, id: &str) -> Result<String> {
    manager
        .resolve_prefix(id)
        .ok_or_else(|| anyhow::anyhow!("会话不存在或前缀不唯一：{}", id))
}

/// Session 命令 - 会话管理
fn run_session(config: &Config, command: SessionCommand) -> Result<()> {
    let mut manager = session_manager(config)?;

    match command {
        SessionCommand::List => {
            let sessions = manager.list();
            if sessions.is_empty() {
                println!("📭 暂无会话");
                return Ok(());
            }

            println!("📋 会话列表:");
            println!();
            for (id, metadata) in sessions {
                let name = metadata.name.as_deref().unwrap_or("(未命名)");
                let agent = metadata.agent_type.map(|a| a.display_name()).unwrap_or("-");
                println!("{} - {} [{}]", short_id(id), name, agent);
                println!(
                    "   更新时间：{} | 消息数：{}",
                    metadata.updated_at.format("%Y-%m-%d %H:%M"),
                    metadata.message_count
                );
                println!();
            }
        }
        SessionCommand::Show { id } => {
            let id = resolve_session(&manager, &id)?;
            let session = manager
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("会话不存在：{}", id))?;
            let metadata = session.metadata();

            println!("📝 会话 {}", id);
            println!("   名称：{}", metadata.name.as_deref().unwrap_or("(未命名)"));
            println!("   创建：{}", metadata.created_at.format("%Y-%m-%d %H:%M"));
            println!("   更新：{}", metadata.updated_at.format("%Y-%m-%d %H:%M"));
            if let Some(agent) = metadata.agent_type {
                println!("   Agent：{}", agent.display_name());
            }
            println!("   压缩次数：{}", session.context().compactions());
            println!("   {}", session.tokens().summary());
            println!();

            for msg in session.context().raw_messages() {
                let text: String = msg.content.chars().take(200).collect();
                println!("[{}] {}", msg.role, text);
                for call in msg.tool_calls.iter().flatten() {
                    println!("   🔧 {}({})", call.function.name, call.function.arguments);
                }
            }
        }
        SessionCommand::Delete { id } => {
            let id = resolve_session(&manager, &id)?;
            manager.delete(&id)?;
            println!("✅ 已删除会话：{}", id);
        }
    }

    Ok(())
}

async fn run_models(config: &Config, command: ModelsCommand) -> Result<()> {
    let client = OllamaClient::new(&config.agent);

    match command {
        ModelsCommand::List => {
            if let Ok(version) = client.version().await {
                println!("Ollama {} @ {}\n", version, client.base_url());
            }
            let models = client.list_models().await?;
            if models.is_empty() {
                println!("📭 没有本地模型");
            }
            for model in models {
                let marker = if model.name == client.model() { "*" } else { " " };
                println!(
                    "{} {:<40} {:>8.2} GB  {}",
                    marker,
                    model.name,
                    model.size as f64 / 1e9,
                    model.modified_at.as_deref().unwrap_or("")
                );
            }
        }
        ModelsCommand::Show { name } => {
            let info = client.show_model(&name).await?;
            println!("📦 {}", name);
            if !info.details.is_null() {
                println!("{}", serde_json::to_string_pretty(&info.details)?);
            }
            if !info.parameters.is_empty() {
                println!("\n参数:\n{}", info.parameters);
            }
            if !info.template.is_empty() {
                println!("\n模板:\n{}", info.template);
            }
        }
        ModelsCommand::Pull { name } => {
            println!("⬇️  正在下载 {} ...", name);
            let status = client.pull_model(&name).await?;
            println!("✅ {}", status.status);
        }
        ModelsCommand::Rm { name } => {
            client.delete_model(&name).await?;
            println!("✅ 已删除模型：{}", name);
        }
    }

    Ok(())
}

async fn run_embed(config: &Config, text: &[String]) -> Result<()> {
    let client = OllamaClient::new(&config.agent);
    let embeddings = client.embed(&[text.join(" ")]).await?;
    let vector = embeddings
        .first()
        .ok_or_else(|| anyhow::anyhow!("模型没有返回向量"))?;

    let preview: Vec<String> = vector.iter().take(8).map(|v| format!("{:.4}", v)).collect();
    println!("维度：{}", vector.len());
    println!("[{}, ...]", preview.join(", "));
    Ok(())
}

fn run_classify(config: &Config, prompt: &[String], all: bool) {
    let classifier = IntentClassifier::new().with_threshold(config.intent.threshold);
    let prompt = prompt.join(" ");
    let ranked = classifier.rank(&prompt);

    if all {
        if ranked.is_empty() {
            println!("没有命中任何关键词");
        }
        for c in ranked {
            println!(
                "{:<12} {:>6.1}%  (得分 {:.2})",
                c.agent.as_str(),
                c.confidence * 100.0,
                c.score
            );
        }
        return;
    }

    match classifier.classify(&prompt) {
        Some(c) => println!(
            "{} ({})  置信度 {:.1}%",
            c.agent.as_str(),
            c.agent.display_name(),
            c.confidence * 100.0
        ),
        None => match ranked.first() {
            Some(best) => println!(
                "无法确定（最接近：{}，{:.1}% 低于阈值 {:.0}%）",
                best.agent.as_str(),
                best.confidence * 100.0,
                classifier.threshold() * 100.0
            ),
            None => println!("无法确定：没有命中任何关键词"),
        },
    }
}

async fn run_hooks(config: &Config, command: HooksCommand) -> Result<()> {
    let runner = HookRunner::load(&config.hooks.registry, config.workspace.root.clone());

    match command {
        HooksCommand::List => {
            if runner.is_empty() {
                println!("📭 没有注册 hook（{}）", config.hooks.registry.display());
                return Ok(());
            }
            for event in runner.events() {
                println!("{}:", event);
                for group in runner.registry().groups(event) {
                    let matcher = group.matcher.as_deref().unwrap_or("*");
                    for cmd in &group.hooks {
                        let timeout = cmd.timeout.unwrap_or(config.hooks.default_timeout_secs);
                        println!("  [{}] {} ({}s)", matcher, cmd.command, timeout);
                    }
                }
            }
        }
        HooksCommand::Test {
            event,
            target,
            payload,
        } => {
            let event: HookEvent = event.parse()?;
            let input: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload 不是合法 JSON")?,
                None => json!({}),
            };
            let target = target.unwrap_or_default();
            if matches!(event, HookEvent::PreToolUse | HookEvent::PostToolUse) && !is_known(&target) {
                println!("⚠️  未知工具：{}", target);
            }

            let payload = match event {
                HookEvent::SessionStart => HookPayload::SessionStart { source: &target },
                HookEvent::SessionEnd => HookPayload::SessionEnd { reason: &target },
                HookEvent::UserPromptSubmit => HookPayload::UserPromptSubmit { prompt: &target },
                HookEvent::PreToolUse => HookPayload::PreToolUse {
                    tool_name: &target,
                    tool_input: &input,
                },
                HookEvent::PostToolUse => HookPayload::PostToolUse {
                    tool_name: &target,
                    tool_input: &input,
                    tool_response: "",
                },
                HookEvent::PreCompact => HookPayload::PreCompact {
                    trigger: &target,
                    custom_instructions: None,
                },
                HookEvent::Stop => HookPayload::Stop {
                    stop_hook_active: false,
                },
                HookEvent::Notification => HookPayload::Notification { message: &target },
            };

            let ctx = HookContext::new("hook-test", config.workspace.root.display().to_string());
            let dispatch = runner.run(&ctx, &payload).await;

            if dispatch.results.is_empty() {
                println!("没有匹配的 hook");
            }
            for result in &dispatch.results {
                println!("▶ {}", result.command);
                println!("  结果：{:?}  退出码：{:?}", result.outcome, result.exit_code);
                if !result.stdout.is_empty() {
                    println!("  stdout：{}", result.stdout);
                }
                if !result.stderr.is_empty() {
                    println!("  stderr：{}", result.stderr);
                }
            }
            if let Some(reason) = &dispatch.blocked {
                println!("⛔ 已阻断：{}", reason);
            }
            if let Some(extra) = dispatch.context_block() {
                println!("📎 附加上下文：\n{}", extra);
            }
            for message in &dispatch.system_messages {
                println!("ℹ️  {}", message);
            }
        }
    }

    Ok(())
}

async fn run_ask(config: &Config, prompt: &[String], agent_type: Option<&str>) -> Result<()> {
    config.ensure_workspace()?;
    config.ensure_sessions()?;

    let mut agent = Agent::new(config);
    agent.set_streaming(false);
    agent.start(None).await?;
    if let Some(agent_type) = parse_agent(agent_type)? {
        agent.pin_agent(Some(agent_type))?;
    }

    let reply = agent.chat(&prompt.join(" ")).await?;
    print_notices(&mut agent);
    println!("{}", reply);

    agent.end("other").await?;
    Ok(())
}

/// Chat 命令 - 交互式对话
async fn run_chat(
    config: &Config,
    session: Option<&str>,
    agent_type: Option<&str>,
    no_stream: bool,
) -> Result<()> {
    config.ensure_workspace()?;
    config.ensure_sessions()?;

    let tool_names: Vec<&str> = get_tools_static()
        .iter()
        .map(|t| t.function.name.as_str())
        .collect();

    println!("🤖 ollie (Ollama)");
    println!("可用工具：{}", tool_names.join(", "));
    println!("输入 /help 查看帮助，/quit 退出\n");
    println!("📁 Workspace: {}", config.workspace.root.display());
    println!("📁 Sessions:  {}", config.session.storage_path.display());
    println!("🤖 模型：{}", config.agent.model);

    let mut agent = Agent::new(config);
    if no_stream {
        agent.set_streaming(false);
    }

    let session_id = agent.start(session).await?;
    if let Some(agent_type) = parse_agent(agent_type)? {
        agent.pin_agent(Some(agent_type))?;
    }
    println!("📝 当前会话：{}\n", session_id);
    print_notices(&mut agent);

    // 使用 reedline 处理输入，支持 UTF-8 和行编辑
    let commands = ["/clear", "/new", "/compact", "/usage", "/agent", "/help", "/quit"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut completer = DefaultCompleter::default();
    completer.insert(commands);
    let prompt = DefaultPrompt::default();

    let mut line_editor = Reedline::create()
        .with_hinter(Box::new(DefaultHinter::default()))
        .with_completer(Box::new(completer));

    loop {
        let sig = line_editor.read_line(&prompt)?;

        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();

                if input.is_empty() {
                    continue;
                }

                // 斜杠命令
                if let Some(rest) = input.strip_prefix('/') {
                    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
                        Some((cmd, arg)) => (cmd.to_lowercase(), Some(arg.trim())),
                        None => (rest.to_lowercase(), None),
                    };
                    let arg = arg.filter(|a| !a.is_empty());

                    match cmd.as_str() {
                        "quit" | "exit" => break,
                        "clear" => {
                            agent.clear_history().await?;
                            println!("✅ 已清空当前会话历史\n");
                        }
                        "new" => {
                            let id = agent.new_session(arg.map(str::to_string)).await?;
                            println!("✅ 已创建新会话：{}\n", id);
                        }
                        "compact" => match agent.compact_now(arg).await? {
                            Some(report) => println!(
                                "✅ 已压缩 {} 条消息，约 {} → {} tokens\n",
                                report.removed, report.tokens_before, report.tokens_after
                            ),
                            None => println!("没有可压缩的消息\n"),
                        },
                        "usage" => {
                            if let Some(session) = agent.current_session() {
                                let context = session.context();
                                println!("{}", session.tokens().summary());
                                println!(
                                    "上下文：约 {} / {} tokens ({:.0}%)，已压缩 {} 次\n",
                                    context.estimated_tokens(),
                                    context.config().max_tokens,
                                    context.usage_ratio() * 100.0,
                                    context.compactions()
                                );
                            }
                        }
                        "agent" => match arg {
                            None => {
                                let current = agent.current_session();
                                let name = current
                                    .and_then(|s| s.agent_type())
                                    .map(|a| a.display_name())
                                    .unwrap_or("通用");
                                let mode = if current.map_or(false, |s| s.is_pinned()) {
                                    "固定"
                                } else {
                                    "自动"
                                };
                                println!("当前 agent：{}（{}）\n", name, mode);
                            }
                            Some("auto") => {
                                agent.pin_agent(None)?;
                                println!("✅ 已恢复自动路由\n");
                            }
                            Some(name) => match name.parse::<AgentType>() {
                                Ok(agent_type) => {
                                    agent.pin_agent(Some(agent_type))?;
                                    println!("✅ 已固定为 {}\n", agent_type.display_name());
                                }
                                Err(e) => println!("❌ {}\n", e),
                            },
                        },
                        "help" | "h" => print_chat_help(),
                        _ => {
                            println!("❌ 未知命令：{}", input);
                            println!("输入 /help 查看帮助\n");
                        }
                    }
                    print_notices(&mut agent);
                    continue;
                }

                let streaming = agent.is_streaming();
                if streaming {
                    print!("🤖 AI: ");
                    std::io::stdout().flush().ok();
                }

                let mut streamed = false;
                let result = agent
                    .chat_with(input, |delta| {
                        streamed = true;
                        print!("{}", delta);
                        std::io::stdout().flush().ok();
                    })
                    .await;

                match result {
                    Ok(_) if streamed => println!("\n"),
                    Ok(reply) if streaming => println!("{}\n", reply),
                    Ok(reply) => println!("🤖 AI: {}\n", reply),
                    Err(e) => println!("\n❌ 错误：{:#}\n", e),
                }
                print_notices(&mut agent);
            }
            Signal::CtrlD => break,
            Signal::CtrlC => {
                println!("\n输入 /quit 退出，或继续输入问题");
            }
        }
    }

    agent.end("prompt_input_exit").await?;
    println!("👋 再见！");
    Ok(())
}

/// 主入口函数
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Chat {
        session: None,
        agent: None,
        no_stream: false,
    }) {
        Commands::Chat {
            session,
            agent,
            no_stream,
        } => run_chat(&config, session.as_deref(), agent.as_deref(), no_stream).await,
        Commands::Ask { prompt, agent } => run_ask(&config, &prompt, agent.as_deref()).await,
        Commands::Classify { prompt, all } => {
            run_classify(&config, &prompt, all);
            Ok(())
        }
        Commands::Session(command) => run_session(&config, command),
        Commands::Models(command) => run_models(&config, command).await,
        Commands::Embed { text } => run_embed(&config, &text).await,
        Commands::Hooks(command) => run_hooks(&config, command).await,
        Commands::Onboard => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            run_onboard(&path)
        }
    }
}
