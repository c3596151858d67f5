//! 生命周期 hook：在会话开始、工具调用、压缩等时机运行外部命令。
//!
//! 命令从 stdin 读取事件 JSON，可在 stdout 输出 JSON 决策；
//! 退出码 2 表示阻断，stderr 作为原因。

mod runner;
mod types;

pub use runner::{matcher_matches, HookRunner};
pub use types::{
    HookCommand, HookContext, HookDecision, HookDispatch, HookEvent, HookMatcher, HookOutcome,
    HookOutput, HookPayload, HookRegistry, HookResult,
};
