use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 匹配位置落在前 N 个字符内时获得加成
const EARLY_WINDOW_CHARS: usize = 50;
const EARLY_BONUS: f64 = 1.5;

/// 可路由的 agent 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coder,
    Debugger,
    Reviewer,
    Tester,
    Researcher,
    Writer,
    Planner,
    Devops,
}

impl AgentType {
    pub const ALL: [AgentType; 8] = [
        AgentType::Coder,
        AgentType::Debugger,
        AgentType::Reviewer,
        AgentType::Tester,
        AgentType::Researcher,
        AgentType::Writer,
        AgentType::Planner,
        AgentType::Devops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Coder => "coder",
            AgentType::Debugger => "debugger",
            AgentType::Reviewer => "reviewer",
            AgentType::Tester => "tester",
            AgentType::Researcher => "researcher",
            AgentType::Writer => "writer",
            AgentType::Planner => "planner",
            AgentType::Devops => "devops",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentType::Coder => "编码",
            AgentType::Debugger => "调试",
            AgentType::Reviewer => "代码审查",
            AgentType::Tester => "测试",
            AgentType::Researcher => "调研",
            AgentType::Writer => "写作",
            AgentType::Planner => "规划",
            AgentType::Devops => "运维",
        }
    }

    /// 路由后追加到系统提示的角色说明
    pub fn role_prompt(&self) -> &'static str {
        match self {
            AgentType::Coder => "## 当前角色：编码\n专注于编写正确、可维护的代码。先给出实现，再简要说明关键决策。",
            AgentType::Debugger => "## 当前角色：调试\n先复现和定位问题根因，再给出最小修复。引用具体的错误信息和位置。",
            AgentType::Reviewer => "## 当前角色：代码审查\n指出正确性、可读性和安全问题，按严重程度排序，给出具体修改建议。",
            AgentType::Tester => "## 当前角色：测试\n设计覆盖边界情况的测试用例，说明每个用例验证的行为。",
            AgentType::Researcher => "## 当前角色：调研\n比较可选方案，列出依据和取舍，不确定时明确说明。",
            AgentType::Writer => "## 当前角色：写作\n输出结构清晰、面向读者的文档或文字，避免冗余。",
            AgentType::Planner => "## 当前角色：规划\n把目标拆成有序步骤，标注依赖和风险。",
            AgentType::Devops => "## 当前角色：运维\n关注部署、配置和可观测性，给出可直接执行的命令。",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        AgentType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("未知 agent 类型：{}", s))
    }
}

struct IntentRule {
    agent: AgentType,
    patterns: Vec<(Regex, f64)>,
}

fn rule(agent: AgentType, patterns: &[(&str, f64)]) -> IntentRule {
    IntentRule {
        agent,
        patterns: patterns
            .iter()
            .map(|(p, w)| (Regex::new(&format!(r"(?i)\b(?:{})\b", p)).unwrap(), *w))
            .collect(),
    }
}

/// 关键词注册表，顺序即平局时的优先级
static REGISTRY: Lazy<Vec<IntentRule>> = Lazy::new(|| {
    vec![
        rule(
            AgentType::Coder,
            &[
                (r"implement|write|code|function|class|refactor|add", 1.0),
                (r"rust|python|typescript|javascript|golang|java|sql", 0.5),
                (r"api|endpoint|module|struct|method", 0.5),
            ],
        ),
        rule(
            AgentType::Debugger,
            &[
                (r"bug|error|crash|panic|exception|traceback|stack\s*trace", 1.5),
                (r"fix|debug|broken|fails?|failing|not\s+working", 1.0),
                (r"segfault|deadlock|leak|hang(?:s|ing)?", 1.0),
            ],
        ),
        rule(
            AgentType::Reviewer,
            &[
                (r"review|audit|critique", 1.5),
                (r"pull\s+request|pr|diff|code\s+quality|best\s+practices?", 1.0),
                (r"security|vulnerab\w*", 0.5),
            ],
        ),
        rule(
            AgentType::Tester,
            &[
                (r"tests?|testing|unit\s+tests?|integration\s+tests?", 1.5),
                (r"coverage|assert\w*|mock\w*|fixtures?|edge\s+cases?", 1.0),
            ],
        ),
        rule(
            AgentType::Researcher,
            &[
                (r"research|investigate|compare|comparison|evaluate", 1.5),
                (r"what\s+is|how\s+does|explain|difference|pros\s+and\s+cons|alternatives?", 1.0),
                (r"benchmark|papers?|sources?", 0.5),
            ],
        ),
        rule(
            AgentType::Writer,
            &[
                (r"document\w*|docs|readme|blog|article|essay", 1.5),
                (r"summari[sz]e|rewrite|proofread|draft|email|changelog", 1.0),
            ],
        ),
        rule(
            AgentType::Planner,
            &[
                (r"plan|roadmap|milestones?|breakdown|break\s+down", 1.5),
                (r"steps|strategy|prioriti[sz]e|schedule|design", 1.0),
            ],
        ),
        rule(
            AgentType::Devops,
            &[
                (r"deploy\w*|kubernetes|k8s|docker\w*|helm|terraform", 1.5),
                (r"ci|cd|pipeline|nginx|systemd|server|monitoring|logs", 1.0),
            ],
        ),
    ]
});

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub agent: AgentType,
    pub confidence: f64,
    pub score: f64,
}

/// 意图分类器 - 关键词加权打分，将提示路由到 agent 类型
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    threshold: f64,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        IntentClassifier { threshold: 0.5 }
    }
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score_rule(rule: &IntentRule, prompt: &str) -> f64 {
        rule.patterns
            .iter()
            .filter_map(|(re, weight)| {
                re.find(prompt).map(|m| {
                    let position = prompt[..m.start()].chars().count();
                    if position < EARLY_WINDOW_CHARS {
                        weight * EARLY_BONUS
                    } else {
                        *weight
                    }
                })
            })
            .sum()
    }

    /// 所有得分非零的类型，按得分降序
    pub fn rank(&self, prompt: &str) -> Vec<Classification> {
        let scores: Vec<(AgentType, f64)> = REGISTRY
            .iter()
            .map(|rule| (rule.agent, Self::score_rule(rule, prompt)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        let mut ranked: Vec<Classification> = scores
            .into_iter()
            .map(|(agent, score)| Classification {
                agent,
                confidence: score / total,
                score,
            })
            .collect();

        // sort_by 是稳定排序，平局保持注册表顺序
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    /// 返回置信度不低于阈值的最佳类型
    pub fn classify(&self, prompt: &str) -> Option<Classification> {
        let best = self.rank(prompt).into_iter().next()?;
        if best.confidence >= self.threshold {
            Some(best)
        } else {
            None
        }
    }
}
