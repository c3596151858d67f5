use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;

use crate::types::{Tool, ToolCall};

use super::builtins::{fs::FsTools, get_time};

/// 工具参数既可能是对象，也可能是 JSON 字符串
pub fn parse_arguments(tool_call: &ToolCall) -> Result<Value> {
    match &tool_call.function.arguments {
        Value::Object(_) => Ok(tool_call.function.arguments.clone()),
        Value::Null => Ok(Value::Object(Default::default())),
        Value::String(raw) => {
            let parsed: Value = serde_json::from_str(raw)
                .with_context(|| format!("工具参数不是合法 JSON：{}", raw))?;
            if parsed.is_object() {
                Ok(parsed)
            } else {
                Err(anyhow::anyhow!("工具参数必须是对象：{}", raw))
            }
        }
        other => Err(anyhow::anyhow!("工具参数必须是对象：{}", other)),
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .with_context(|| format!("缺少 {} 参数", key))
}

/// 工具执行器 - 直接持有 FsTools，避免不必要的抽象层
pub struct ToolExecutor {
    fs_tools: FsTools,
}

impl ToolExecutor {
    pub fn new(workspace_root: PathBuf) -> Self {
        ToolExecutor {
            fs_tools: FsTools::new(workspace_root),
        }
    }

    /// 获取所有工具定义
    pub fn get_tools(&self) -> &[Tool] {
        super::registry::get_tools_static()
    }

    pub async fn execute(&self, name: &str, args: &Value) -> Result<String> {
        match name {
            "fs_read" => self.fs_tools.read(str_arg(args, "path")?),
            "fs_write" => self
                .fs_tools
                .write(str_arg(args, "path")?, str_arg(args, "content")?),
            "fs_patch" => self.fs_tools.patch(
                str_arg(args, "path")?,
                str_arg(args, "old_string")?,
                str_arg(args, "new_string")?,
            ),
            "fs_list" => self.fs_tools.list(str_arg(args, "path")?),
            "get_time" => Ok(get_time::execute()),
            _ => Err(anyhow::anyhow!("未知工具：{}", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionCall;
    use serde_json::json;

    fn call(arguments: Value) -> ToolCall {
        ToolCall {
            id: String::new(),
            tool_type: None,
            function: FunctionCall {
                name: "fs_read".into(),
                index: None,
                arguments,
            },
        }
    }

    #[test]
    fn parses_object_string_and_null_arguments() {
        assert_eq!(parse_arguments(&call(json!({"path": "a"}))).unwrap(), json!({"path": "a"}));
        assert_eq!(
            parse_arguments(&call(json!("{\"path\": \"b\"}"))).unwrap(),
            json!({"path": "b"})
        );
        assert_eq!(parse_arguments(&call(Value::Null)).unwrap(), json!({}));
        assert!(parse_arguments(&call(json!("[1, 2]"))).is_err());
        assert!(parse_arguments(&call(json!(3))).is_err());
    }

    #[tokio::test]
    async fn executes_fs_tools_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf());

        executor
            .execute("fs_write", &json!({"path": "notes/a.txt", "content": "hello world"}))
            .await
            .unwrap();
        executor
            .execute(
                "fs_patch",
                &json!({"path": "notes/a.txt", "old_string": "world", "new_string": "rust"}),
            )
            .await
            .unwrap();

        let content = executor
            .execute("fs_read", &json!({"path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(content, "hello rust");

        let listing = executor
            .execute("fs_list", &json!({"path": "notes"}))
            .await
            .unwrap();
        assert!(listing.contains("a.txt"));
    }

    #[tokio::test]
    async fn missing_argument_and_unknown_tool_fail() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf());
        assert!(executor.execute("fs_read", &json!({})).await.is_err());
        assert!(executor.execute("web_search", &json!({})).await.is_err());
    }
}
