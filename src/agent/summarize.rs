//! 用模型为较早的对话生成摘要，供上下文压缩使用。

use crate::types::Message;

use super::context::SUMMARY_PREFIX;
use super::llm::{OllamaClient, OllamaError};

const SUMMARIZATION_PROMPT: &str = "\
请简洁地总结以下对话消息，重点包括：
- 已完成的工作（子任务、修改过的文件）
- 关键发现与决定
- 失败的尝试及原因
- 提到的文件路径和函数名
- 当前计划与剩余工作

规则：
- 只写消息中明确出现的事实，不要推测。
- 文件路径、函数名和错误信息保持原样。
- 如果已有摘要，把新信息合并进去，输出一份完整的新摘要。";

/// 单条消息写入请求时的最大字符数
const MAX_MESSAGE_CHARS: usize = 2000;

/// 构造 (system, prompt)
pub fn build_summary_request(span: &[Message], instructions: Option<&str>) -> (String, String) {
    let mut system = SUMMARIZATION_PROMPT.to_string();
    if let Some(extra) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        system.push_str("\n\n附加要求：\n");
        system.push_str(extra);
    }

    let mut prompt = String::new();
    for msg in span {
        if let Some(previous) = msg.content.strip_prefix(SUMMARY_PREFIX) {
            prompt.push_str("=== 已有摘要 ===\n");
            prompt.push_str(previous.trim());
            prompt.push_str("\n\n");
            continue;
        }

        let mut body: String = msg.content.chars().take(MAX_MESSAGE_CHARS).collect();
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                body.push_str(&format!("\n(调用工具 {} {})", call.function.name, call.function.arguments));
            }
        }
        prompt.push_str(&format!("[{}]\n{}\n\n", msg.role, body.trim()));
    }

    (system, prompt.trim_end().to_string())
}

/// 调用 /api/generate 生成摘要
pub async fn summarize(
    client: &OllamaClient,
    span: &[Message],
    instructions: Option<&str>,
) -> Result<String, OllamaError> {
    let (system, prompt) = build_summary_request(span, instructions);
    let response = client.generate(&prompt, Some(&system)).await?;
    let summary = response.response.trim().to_string();
    if summary.is_empty() {
        return Err(OllamaError::Server("模型返回了空摘要".to_string()));
    }
    Ok(summary)
}
