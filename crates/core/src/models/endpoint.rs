//! 端点与负载类型定义

use serde::{Deserialize, Serialize};

/// 负载类型
///
/// 描述一次工作的性质，用于选择对应的降级链。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// 编排/规划
    Orchestration,
    /// 分析/推理
    Reasoning,
    /// 代码生成/编辑
    CodeGeneration,
    /// 检索/查询
    Lookup,
    /// 通用
    General,
}

impl WorkloadClass {
    /// 配置文件中使用的标识
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Orchestration => "orchestration",
            WorkloadClass::Reasoning => "reasoning",
            WorkloadClass::CodeGeneration => "code_generation",
            WorkloadClass::Lookup => "lookup",
            WorkloadClass::General => "general",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            WorkloadClass::Orchestration => "编排",
            WorkloadClass::Reasoning => "推理",
            WorkloadClass::CodeGeneration => "代码",
            WorkloadClass::Lookup => "检索",
            WorkloadClass::General => "通用",
        }
    }

    /// 从字符串解析（忽略大小写，允许 `-` 代替 `_`）
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "orchestration" | "planning" => Some(WorkloadClass::Orchestration),
            "reasoning" | "analysis" => Some(WorkloadClass::Reasoning),
            "code_generation" | "coding" | "code" => Some(WorkloadClass::CodeGeneration),
            "lookup" | "search" => Some(WorkloadClass::Lookup),
            "general" => Some(WorkloadClass::General),
            _ => None,
        }
    }

    /// 所有负载类型
    pub fn all() -> &'static [WorkloadClass] {
        &[
            WorkloadClass::Orchestration,
            WorkloadClass::Reasoning,
            WorkloadClass::CodeGeneration,
            WorkloadClass::Lookup,
            WorkloadClass::General,
        ]
    }
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 后端模型端点
///
/// 加载后不可变，由模型目录独占持有。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// 端点 ID（全局唯一）
    pub id: String,
    /// 显示名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// 所属 Provider（预算按 Provider 统计）
    pub provider: String,
    /// 所需凭证类型
    pub credential_kind: String,
    /// 质量等级，数值越小质量/成本越高
    pub tier: u8,
    /// 上下文长度
    pub context_limit: u32,
    /// 最大输出 tokens
    pub max_output_tokens: u32,
    /// 标称每分钟 tokens
    pub tokens_per_minute: u64,
    /// 标称每日 tokens
    pub tokens_per_day: u64,
    /// 输入价格（每 1M tokens）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_million: Option<f64>,
    /// 输出价格（每 1M tokens）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_million: Option<f64>,
}

impl Endpoint {
    /// 以最少字段构造端点，其余取默认值
    pub fn new(id: &str, provider: &str, tier: u8) -> Self {
        Self {
            id: id.to_string(),
            display_name: None,
            provider: provider.to_string(),
            credential_kind: provider.to_string(),
            tier,
            context_limit: 128_000,
            max_output_tokens: 8_192,
            tokens_per_minute: 100_000,
            tokens_per_day: 10_000_000,
            input_cost_per_million: None,
            output_cost_per_million: None,
        }
    }

    /// 设置凭证类型
    pub fn with_credential(mut self, kind: &str) -> Self {
        self.credential_kind = kind.to_string();
        self
    }

    /// 设置标称限额
    pub fn with_limits(mut self, tokens_per_minute: u64, tokens_per_day: u64) -> Self {
        self.tokens_per_minute = tokens_per_minute;
        self.tokens_per_day = tokens_per_day;
        self
    }

    /// 设置价格
    pub fn with_pricing(mut self, input_per_million: f64, output_per_million: f64) -> Self {
        self.input_cost_per_million = Some(input_per_million);
        self.output_cost_per_million = Some(output_per_million);
        self
    }

    /// 显示名称，未配置时使用 ID
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// 估算一次调用的成本
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = self.input_cost_per_million.unwrap_or(0.0) * input_tokens as f64;
        let output = self.output_cost_per_million.unwrap_or(0.0) * output_tokens as f64;
        (input + output) / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_class_parse() {
        assert_eq!(
            WorkloadClass::parse("Code-Generation"),
            Some(WorkloadClass::CodeGeneration)
        );
        assert_eq!(WorkloadClass::parse("lookup"), Some(WorkloadClass::Lookup));
        assert_eq!(WorkloadClass::parse("unknown"), None);

        for class in WorkloadClass::all() {
            assert_eq!(WorkloadClass::parse(class.as_str()), Some(*class));
        }
    }

    #[test]
    fn test_endpoint_cost() {
        let endpoint = Endpoint::new("claude-sonnet", "anthropic", 1).with_pricing(3.0, 15.0);
        let cost = endpoint.cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);

        let free = Endpoint::new("local", "ollama", 3);
        assert_eq!(free.cost(5_000, 5_000), 0.0);
    }

    #[test]
    fn test_endpoint_yaml_defaults() {
        let yaml = r#"
id: gpt-4o
provider: openai
credential_kind: openai
tier: 1
context_limit: 128000
max_output_tokens: 16384
tokens_per_minute: 800000
tokens_per_day: 100000000
"#;
        let endpoint: Endpoint = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(endpoint.id, "gpt-4o");
        assert_eq!(endpoint.name(), "gpt-4o");
        assert!(endpoint.input_cost_per_million.is_none());
    }
}
