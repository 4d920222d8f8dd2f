//! 凭证闸门
//!
//! 只回答"端点当前是否可用"：其所需凭证是否已配置。
//! 凭证本身由外部注入，这里不持有、不记录任何凭证内容。

use crate::catalog::ModelCatalog;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// 凭证存在性查询
pub trait CredentialSource: Send + Sync {
    /// 指定类型的凭证是否已配置
    fn is_configured(&self, kind: &str) -> bool;
}

/// 允许直接用闭包作为查询函数
impl<F> CredentialSource for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_configured(&self, kind: &str) -> bool {
        self(kind)
    }
}

/// 基于环境变量的凭证来源
///
/// 凭证类型映射到环境变量名；未映射的类型默认检查 `<KIND>_API_KEY`。
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource {
    vars: IndexMap<String, String>,
}

impl EnvCredentialSource {
    pub fn new(vars: IndexMap<String, String>) -> Self {
        Self { vars }
    }

    /// 凭证类型对应的环境变量名
    pub fn var_name(&self, kind: &str) -> String {
        self.vars.get(kind).cloned().unwrap_or_else(|| {
            format!("{}_API_KEY", kind.to_uppercase().replace(['-', '.'], "_"))
        })
    }
}

impl CredentialSource for EnvCredentialSource {
    fn is_configured(&self, kind: &str) -> bool {
        std::env::var(self.var_name(kind))
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

/// 显式集合形式的凭证来源，可在运行时增删
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    kinds: RwLock<HashSet<String>>,
}

impl StaticCredentialSource {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: RwLock::new(kinds.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, kind: &str) {
        self.kinds.write().insert(kind.to_string());
    }

    pub fn remove(&self, kind: &str) {
        self.kinds.write().remove(kind);
    }
}

impl CredentialSource for StaticCredentialSource {
    fn is_configured(&self, kind: &str) -> bool {
        self.kinds.read().contains(kind)
    }
}

/// 凭证闸门
#[derive(Clone)]
pub struct CredentialGate {
    catalog: Arc<ModelCatalog>,
    source: Arc<dyn CredentialSource>,
}

impl CredentialGate {
    pub fn new(catalog: Arc<ModelCatalog>, source: Arc<dyn CredentialSource>) -> Self {
        Self { catalog, source }
    }

    /// 端点是否可用；未知端点视为不可用
    pub fn is_usable(&self, endpoint_id: &str) -> bool {
        match self.catalog.get(endpoint_id) {
            Some(endpoint) => self.source.is_configured(&endpoint.credential_kind),
            None => false,
        }
    }
}

impl std::fmt::Debug for CredentialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGate")
            .field("endpoints", &self.catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Endpoint;

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::new(
                vec![
                    Endpoint::new("a", "anthropic", 1),
                    Endpoint::new("b", "openai", 1).with_credential("openai-org"),
                ],
                IndexMap::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_gate_with_static_source() {
        let source = Arc::new(StaticCredentialSource::new(["anthropic"]));
        let gate = CredentialGate::new(catalog(), source.clone());

        assert!(gate.is_usable("a"));
        assert!(!gate.is_usable("b"));
        assert!(!gate.is_usable("unknown"));

        source.insert("openai-org");
        assert!(gate.is_usable("b"));
        source.remove("anthropic");
        assert!(!gate.is_usable("a"));
    }

    #[test]
    fn test_gate_with_closure() {
        let gate = CredentialGate::new(catalog(), Arc::new(|kind: &str| kind == "openai-org"));
        assert!(!gate.is_usable("a"));
        assert!(gate.is_usable("b"));
    }

    #[test]
    fn test_env_source_var_names() {
        let source = EnvCredentialSource::new(IndexMap::from([(
            "google".to_string(),
            "GEMINI_API_KEY".to_string(),
        )]));
        assert_eq!(source.var_name("google"), "GEMINI_API_KEY");
        assert_eq!(source.var_name("openai-org"), "OPENAI_ORG_API_KEY");
        assert!(!source.is_configured("routecast-test-never-set"));
    }
}
