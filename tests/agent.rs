use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ollie::agent::{Agent, AgentType, OllamaClient, RetryPolicy};
use ollie::config::Config;
use ollie::hooks::HookRunner;

fn config(dir: &Path, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.agent.base_url = server.uri();
    config.agent.model = "test-model".to_string();
    config.agent.stream = false;
    config.workspace.root = dir.join("workspace");
    config.workspace.agent_file = dir.join("workspace/AGENT.md");
    config.workspace.soul_file = dir.join("workspace/SOUL.md");
    config.workspace.user_file = dir.join("workspace/USER.md");
    config.session.storage_path = dir.join("sessions");
    config.hooks.registry = dir.join("hooks.json");
    std::fs::create_dir_all(&config.workspace.root).unwrap();
    config
}

fn agent(config: &Config) -> Agent {
    let client = OllamaClient::new(&config.agent).with_retry_policy(RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    });
    Agent::new(config).with_client(client)
}

fn reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "test-model",
        "message": {"role": "assistant", "content": content},
        "done": true,
        "prompt_eval_count": 20,
        "eval_count": 4
    }))
}

fn tool_call(name: &str, arguments: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "test-model",
        "message": {
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": name, "arguments": arguments}}]
        },
        "done": true,
        "prompt_eval_count": 10,
        "eval_count": 2
    }))
}

async fn mount_once(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(response)
        .up_to_n_times(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn tool_loop_executes_tools_and_saves_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_once(
        &server,
        tool_call("fs_write", json!({"path": "notes/todo.md", "content": "- ship"})),
    )
    .await;
    mount_once(&server, reply("已写入")).await;

    let config = config(dir.path(), &server);
    let mut agent = agent(&config);
    let id = agent.start(None).await.unwrap();

    let answer = agent.chat("请写一个待办文件").await.unwrap();
    assert_eq!(answer, "已写入");
    assert_eq!(
        std::fs::read_to_string(config.workspace.root.join("notes/todo.md")).unwrap(),
        "- ship"
    );

    let session = agent.current_session().unwrap();
    let roles: Vec<&str> = session
        .context()
        .raw_messages()
        .iter()
        .map(|m| m.role.as_str())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

    let call_id = &session.context().raw_messages()[1]
        .tool_calls
        .as_ref()
        .unwrap()[0]
        .id;
    assert!(!call_id.is_empty());
    assert_eq!(
        session.context().raw_messages()[2].tool_call_id.as_ref(),
        Some(call_id)
    );
    assert_eq!(session.tokens().prompt_tokens(), 30);
    assert_eq!(session.tokens().completion_tokens(), 6);

    assert!(config.session.storage_path.join(format!("{id}.json")).exists());
}

#[tokio::test]
async fn pre_tool_use_hook_blocks_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_once(&server, tool_call("fs_write", json!({"path": "a.txt", "content": "x"}))).await;
    mount_once(&server, reply("好的，不写了")).await;

    let config = config(dir.path(), &server);
    let hooks = HookRunner::from_json(
        &json!({"hooks": {"PreToolUse": [{"matcher": "fs_write", "hooks": [
            {"command": "echo 'read only workspace' >&2; exit 2"}
        ]}]}})
        .to_string(),
        config.workspace.root.clone(),
    )
    .unwrap();

    let mut agent = agent(&config).with_hooks(hooks);
    agent.start(None).await.unwrap();
    agent.chat("写 a.txt").await.unwrap();

    assert!(!config.workspace.root.join("a.txt").exists());
    let messages = agent.current_session().unwrap().context().raw_messages();
    assert_eq!(messages[2].role, "tool");
    assert_eq!(messages[2].content, "工具调用被 hook 拦截：read only workspace");
}

#[tokio::test]
async fn blocked_prompt_never_reaches_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("unreachable"))
        .expect(0)
        .mount(&server)
        .await;

    let config = config(dir.path(), &server);
    let hooks = HookRunner::from_json(
        &json!({"hooks": {"UserPromptSubmit": [{"hooks": [
            {"command": "echo '{\"decision\": \"block\", \"reason\": \"contains secrets\"}'"}
        ]}]}})
        .to_string(),
        config.workspace.root.clone(),
    )
    .unwrap();

    let mut agent = agent(&config).with_hooks(hooks);
    agent.start(None).await.unwrap();
    let answer = agent.chat("my password is hunter2").await.unwrap();

    assert!(answer.contains("contains secrets"));
    assert!(agent.current_session().unwrap().context().is_empty());
}

#[tokio::test]
async fn prompt_hook_context_is_attached_to_user_message() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_once(&server, reply("ok")).await;

    let config = config(dir.path(), &server);
    let hooks = HookRunner::from_json(
        &json!({"hooks": {"UserPromptSubmit": [{"hooks": [{"command": "echo 'branch: main'"}]}]}})
            .to_string(),
        config.workspace.root.clone(),
    )
    .unwrap();

    let mut agent = agent(&config).with_hooks(hooks);
    agent.start(None).await.unwrap();
    agent.chat("hello").await.unwrap();

    let first = &agent.current_session().unwrap().context().raw_messages()[0];
    assert_eq!(first.content, "hello\n\n<hook-context>\nbranch: main\n</hook-context>");
}

#[tokio::test]
async fn stop_hook_can_continue_the_turn_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_once(&server, reply("first")).await;
    mount_once(&server, reply("second")).await;

    let config = config(dir.path(), &server);
    let hooks = HookRunner::from_json(
        &json!({"hooks": {"Stop": [{"hooks": [
            {"command": "echo '{\"decision\": \"block\", \"reason\": \"run the tests too\"}'"}
        ]}]}})
        .to_string(),
        config.workspace.root.clone(),
    )
    .unwrap();

    let mut agent = agent(&config).with_hooks(hooks);
    agent.start(None).await.unwrap();
    let answer = agent.chat("done?").await.unwrap();

    assert_eq!(answer, "second");
    let messages = agent.current_session().unwrap().context().raw_messages();
    assert_eq!(messages[2].role, "user");
    assert_eq!(messages[2].content, "run the tests too");
}

#[tokio::test]
async fn intent_routing_respects_pinned_agent() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("ok"))
        .mount(&server)
        .await;

    let config = config(dir.path(), &server);
    let mut agent = agent(&config);
    agent.start(None).await.unwrap();

    agent.chat("there is a panic and a crash in main").await.unwrap();
    assert_eq!(
        agent.current_session().unwrap().agent_type(),
        Some(AgentType::Debugger)
    );

    agent.pin_agent(Some(AgentType::Writer)).unwrap();
    agent.chat("another panic").await.unwrap();
    assert_eq!(
        agent.current_session().unwrap().agent_type(),
        Some(AgentType::Writer)
    );
}

#[tokio::test]
async fn model_failure_becomes_a_reply() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(dir.path(), &server);
    let mut agent = agent(&config);
    agent.start(None).await.unwrap();

    let answer = agent.chat("hi").await.unwrap();
    assert!(answer.starts_with("抱歉，AI 服务暂时不可用"));
}

#[tokio::test]
async fn manual_compaction_summarises_old_turns() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply(&"回答很长。".repeat(40)))
        .mount(&server)
        .await;

    let mut config = config(dir.path(), &server);
    config.context.keep_recent = 2;
    let mut agent = agent(&config);
    agent.start(None).await.unwrap();

    for i in 0..3 {
        agent.chat(&format!("第 {i} 个问题")).await.unwrap();
    }
    let report = agent.compact_now(None).await.unwrap().unwrap();
    assert_eq!(report.removed, 4);

    let session = agent.current_session().unwrap();
    assert_eq!(session.context().len(), 3);
    assert_eq!(session.context().compactions(), 1);
    assert!(session.context().raw_messages()[0]
        .content
        .starts_with("[对话摘要]"));
}

#[tokio::test]
async fn resume_by_prefix_restores_history() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("ok"))
        .mount(&server)
        .await;

    let config = config(dir.path(), &server);
    let mut first = agent(&config);
    let id = first.start(None).await.unwrap();
    first.chat("remember me").await.unwrap();
    first.end("other").await.unwrap();

    let mut second = agent(&config);
    let resumed = second.start(Some(&id[..8])).await.unwrap();
    assert_eq!(resumed, id);
    assert_eq!(
        second.current_session().unwrap().context().raw_messages()[0].content,
        "remember me"
    );
}
