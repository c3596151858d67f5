pub mod agent;
pub mod cli;
pub mod config;
pub mod hooks;
pub mod tools;
pub mod types;

pub use agent::{
    Agent, AgentType, ContextManager, IntentClassifier, OllamaClient, OllamaError, Session,
    SessionManager, TokenCounter,
};
pub use cli::run_cli;
pub use config::{AgentConfig, Config, ContextConfig, SessionConfig, WorkspaceConfig};
pub use hooks::{HookEvent, HookRunner};
