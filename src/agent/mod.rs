pub mod context;
pub mod core;
pub mod intent;
pub mod llm;
pub mod session;
pub mod stream;
pub mod summarize;
pub mod tokens;

pub use context::{CompactionReport, ContextManager};
pub use core::Agent;
pub use intent::{AgentType, Classification, IntentClassifier};
pub use llm::{collect_chat, OllamaClient, OllamaError, RetryPolicy};
pub use session::{Session, SessionManager, SessionMetadata};
pub use stream::NdjsonDecoder;
pub use tokens::{Pricing, Provider, TokenCounter, TokenUsage};
