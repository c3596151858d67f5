use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// 上游 LLM 后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ollama,
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    /// 默认价格（美元 / 百万 token）
    pub fn default_pricing(&self) -> Pricing {
        match self {
            Provider::Ollama => Pricing::new(0.0, 0.0),
            Provider::OpenAi => Pricing::new(2.50, 10.00),
            Provider::Anthropic => Pricing::new(3.00, 15.00),
            Provider::Google => Pricing::new(1.25, 5.00),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "google" => Ok(Provider::Google),
            other => Err(anyhow::anyhow!("未知 provider：{}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Pricing {
            input_per_million: input_per_million.max(0.0),
            output_per_million: output_per_million.max(0.0),
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

/// 单次请求的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

type Extractor = fn(&Value) -> Option<TokenUsage>;

/// 按路径取整数字段
fn count_at(value: &Value, path: &[&str]) -> Option<u64> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_u64)
}

fn usage_from(value: &Value, prompt: &[&str], completion: &[&str]) -> Option<TokenUsage> {
    let prompt_tokens = count_at(value, prompt);
    let completion_tokens = count_at(value, completion);
    if prompt_tokens.is_none() && completion_tokens.is_none() {
        return None;
    }
    Some(TokenUsage {
        prompt_tokens: prompt_tokens.unwrap_or(0),
        completion_tokens: completion_tokens.unwrap_or(0),
    })
}

fn extract_ollama(v: &Value) -> Option<TokenUsage> {
    usage_from(v, &["prompt_eval_count"], &["eval_count"])
}

fn extract_openai(v: &Value) -> Option<TokenUsage> {
    usage_from(v, &["usage", "prompt_tokens"], &["usage", "completion_tokens"])
}

fn extract_anthropic(v: &Value) -> Option<TokenUsage> {
    usage_from(v, &["usage", "input_tokens"], &["usage", "output_tokens"])
}

fn extract_google(v: &Value) -> Option<TokenUsage> {
    usage_from(
        v,
        &["usageMetadata", "promptTokenCount"],
        &["usageMetadata", "candidatesTokenCount"],
    )
}

/// 各 provider 的响应结构提取器
const EXTRACTORS: &[(Provider, Extractor)] = &[
    (Provider::Ollama, extract_ollama),
    (Provider::OpenAi, extract_openai),
    (Provider::Anthropic, extract_anthropic),
    (Provider::Google, extract_google),
];

pub fn extract_usage(provider: Provider, response: &Value) -> Option<TokenUsage> {
    EXTRACTORS
        .iter()
        .find(|(p, _)| *p == provider)
        .and_then(|(_, extract)| extract(response))
}

/// Token 计数器 - 累计会话的 token 与费用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCounter {
    provider: Provider,
    pricing: Pricing,
    prompt_tokens: u64,
    completion_tokens: u64,
    session_cost: f64,
    requests: u64,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(Provider::Ollama)
    }
}

impl TokenCounter {
    pub fn new(provider: Provider) -> Self {
        TokenCounter {
            provider,
            pricing: provider.default_pricing(),
            prompt_tokens: 0,
            completion_tokens: 0,
            session_cost: 0.0,
            requests: 0,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// 从原始响应中提取并累计
    pub fn record(&mut self, response: &Value) -> Option<TokenUsage> {
        match extract_usage(self.provider, response) {
            Some(usage) => {
                self.record_usage(usage);
                Some(usage)
            }
            None => {
                debug!(provider = %self.provider, "响应中没有 token 用量字段");
                None
            }
        }
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.session_cost += self.pricing.cost(&usage);
        self.requests += 1;
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn session_cost(&self) -> f64 {
        self.session_cost
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn reset(&mut self) {
        self.prompt_tokens = 0;
        self.completion_tokens = 0;
        self.session_cost = 0.0;
        self.requests = 0;
    }

    pub fn summary(&self) -> String {
        format!(
            "{} 次请求 | 输入 {} + 输出 {} = {} tokens | 费用 ${:.4}",
            self.requests,
            self.prompt_tokens,
            self.completion_tokens,
            self.total_tokens(),
            self.session_cost
        )
    }
}
