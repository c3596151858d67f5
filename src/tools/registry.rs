use once_cell::sync::Lazy;
use serde_json::json;

use crate::types::Tool;

/// 获取静态工具列表
pub fn get_tools_static() -> &'static [Tool] {
    &TOOLS
}

/// 工具名是否已注册
pub fn is_known(name: &str) -> bool {
    TOOLS.iter().any(|t| t.function.name == name)
}

/// 预定义的工具列表（懒加载，只初始化一次）
static TOOLS: Lazy<Vec<Tool>> = Lazy::new(|| {
    vec![
        Tool::function(
            "fs_read",
            "读取 workspace 内的文件内容",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "相对于 workspace 的文件路径" }
                },
                "required": ["path"]
            }),
        ),
        Tool::function(
            "fs_write",
            "写入文件到 workspace 内（覆盖模式）",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "相对于 workspace 的文件路径" },
                    "content": { "type": "string", "description": "文件内容" }
                },
                "required": ["path", "content"]
            }),
        ),
        Tool::function(
            "fs_patch",
            "部分修改 workspace 内的文件（查找替换）",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "相对于 workspace 的文件路径" },
                    "old_string": { "type": "string", "description": "要查找并替换的内容" },
                    "new_string": { "type": "string", "description": "替换为的新内容" }
                },
                "required": ["path", "old_string", "new_string"]
            }),
        ),
        Tool::function(
            "fs_list",
            "列出 workspace 内的目录内容",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "相对于 workspace 的目录路径" }
                },
                "required": ["path"]
            }),
        ),
        Tool::function(
            "get_time",
            "获取当前时间",
            json!({ "type": "object", "properties": {}, "required": [] }),
        ),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_every_builtin() {
        let names: Vec<&str> = get_tools_static()
            .iter()
            .map(|t| t.function.name.as_str())
            .collect();
        assert_eq!(names, vec!["fs_read", "fs_write", "fs_patch", "fs_list", "get_time"]);
        assert!(get_tools_static().iter().all(|t| t.tool_type == "function"));
        assert!(is_known("fs_patch"));
        assert!(!is_known("web_search"));
    }
}
