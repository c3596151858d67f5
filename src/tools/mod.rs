mod builtins;
mod executor;
mod registry;

pub use executor::{parse_arguments, ToolExecutor};
pub use registry::{get_tools_static, is_known};
