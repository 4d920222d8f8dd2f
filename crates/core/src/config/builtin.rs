//! 内置模型目录与默认降级链

use super::types::{RoleConfig, RoutecastConfig};
use crate::models::{Endpoint, WorkloadClass};
use indexmap::IndexMap;

#[allow(clippy::too_many_arguments)]
fn endpoint(
    id: &str,
    name: &str,
    provider: &str,
    tier: u8,
    context_limit: u32,
    max_output_tokens: u32,
    tokens_per_minute: u64,
    pricing: (f64, f64),
) -> Endpoint {
    Endpoint {
        id: id.to_string(),
        display_name: Some(name.to_string()),
        provider: provider.to_string(),
        credential_kind: provider.to_string(),
        tier,
        context_limit,
        max_output_tokens,
        tokens_per_minute,
        tokens_per_day: tokens_per_minute * 120,
        input_cost_per_million: Some(pricing.0),
        output_cost_per_million: Some(pricing.1),
    }
}

/// 内置端点
pub fn builtin_endpoints() -> Vec<Endpoint> {
    vec![
        endpoint("claude-opus-4", "Claude Opus 4", "anthropic", 0, 200_000, 32_000, 400_000, (15.0, 75.0)),
        endpoint("o3", "OpenAI o3", "openai", 0, 200_000, 100_000, 400_000, (2.0, 8.0)),
        endpoint("claude-sonnet-4", "Claude Sonnet 4", "anthropic", 1, 200_000, 64_000, 800_000, (3.0, 15.0)),
        endpoint("gpt-4.1", "GPT-4.1", "openai", 1, 1_047_576, 32_768, 800_000, (2.0, 8.0)),
        endpoint("gemini-2.5-pro", "Gemini 2.5 Pro", "google", 1, 1_048_576, 65_536, 2_000_000, (1.25, 10.0)),
        endpoint("claude-haiku-3.5", "Claude Haiku 3.5", "anthropic", 2, 200_000, 8_192, 400_000, (0.8, 4.0)),
        endpoint("gpt-4.1-mini", "GPT-4.1 mini", "openai", 2, 1_047_576, 32_768, 2_000_000, (0.4, 1.6)),
        endpoint("gemini-2.5-flash", "Gemini 2.5 Flash", "google", 2, 1_048_576, 65_536, 4_000_000, (0.3, 2.5)),
        endpoint("llama-3.3-70b", "Llama 3.3 70B", "groq", 2, 131_072, 32_768, 300_000, (0.59, 0.79)),
    ]
}

fn chain(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// 默认降级链
pub fn builtin_chains() -> IndexMap<WorkloadClass, Vec<String>> {
    IndexMap::from([
        (
            WorkloadClass::Orchestration,
            chain(&["claude-opus-4", "o3", "claude-sonnet-4", "gemini-2.5-pro", "gpt-4.1"]),
        ),
        (
            WorkloadClass::Reasoning,
            chain(&["o3", "claude-opus-4", "gemini-2.5-pro", "claude-sonnet-4"]),
        ),
        (
            WorkloadClass::CodeGeneration,
            chain(&["claude-sonnet-4", "gpt-4.1", "gemini-2.5-pro", "claude-haiku-3.5"]),
        ),
        (
            WorkloadClass::Lookup,
            chain(&["gemini-2.5-flash", "gpt-4.1-mini", "claude-haiku-3.5", "llama-3.3-70b"]),
        ),
        (
            WorkloadClass::General,
            chain(&["claude-sonnet-4", "gpt-4.1", "gemini-2.5-flash", "gpt-4.1-mini"]),
        ),
    ])
}

impl RoutecastConfig {
    /// 内置配置：常见端点、默认降级链、角色与凭证环境变量
    pub fn builtin() -> Self {
        Self {
            endpoints: builtin_endpoints(),
            chains: builtin_chains(),
            roles: IndexMap::from([
                ("orchestrator".to_string(), RoleConfig::new(2)),
                ("coder".to_string(), RoleConfig::new(4)),
                ("researcher".to_string(), RoleConfig::new(6)),
            ]),
            credentials: IndexMap::from([
                ("anthropic".to_string(), "ANTHROPIC_API_KEY".to_string()),
                ("openai".to_string(), "OPENAI_API_KEY".to_string()),
                ("google".to_string(), "GEMINI_API_KEY".to_string()),
                ("groq".to_string(), "GROQ_API_KEY".to_string()),
            ]),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_config_is_valid() {
        let config = RoutecastConfig::builtin();
        config.validate().unwrap();

        for class in WorkloadClass::all() {
            assert!(config.chains.contains_key(class), "缺少 {class} 的降级链");
        }
        for endpoint in &config.endpoints {
            assert!(
                config.credentials.contains_key(&endpoint.credential_kind),
                "{} 没有凭证映射",
                endpoint.id
            );
        }
    }

    #[test]
    fn test_builtin_yaml_roundtrip() {
        let config = RoutecastConfig::builtin();
        let yaml = config.to_yaml().unwrap();
        let parsed = RoutecastConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.endpoints, config.endpoints);
        assert_eq!(parsed.chains, config.chains);
    }
}
