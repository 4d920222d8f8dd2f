//! 模型目录
//!
//! 静态描述所有已知端点以及每种负载类型的降级链。加载后只读。

use crate::config::RoutecastConfig;
use crate::errors::ConfigError;
use crate::models::{Endpoint, WorkloadClass};
use indexmap::IndexMap;

/// 模型目录
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    endpoints: IndexMap<String, Endpoint>,
    chains: IndexMap<WorkloadClass, Vec<String>>,
}

impl ModelCatalog {
    /// 从端点与降级链构建，构建时完成校验
    pub fn new(
        endpoints: Vec<Endpoint>,
        chains: IndexMap<WorkloadClass, Vec<String>>,
    ) -> Result<Self, ConfigError> {
        let config = RoutecastConfig {
            endpoints,
            chains,
            ..Default::default()
        };
        Self::from_config(&config)
    }

    /// 从配置构建
    pub fn from_config(config: &RoutecastConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        tracing::info!(
            "[ModelCatalog] 已加载 {} 个端点, {} 条降级链",
            config.endpoints.len(),
            config.chains.len()
        );
        Ok(Self {
            endpoints,
            chains: config.chains.clone(),
        })
    }

    /// 获取端点
    pub fn get(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.get(id)
    }

    /// 获取负载类型的降级链
    pub fn chain(&self, workload: WorkloadClass) -> Option<&[String]> {
        self.chains.get(&workload).map(|c| c.as_slice())
    }

    /// 已配置的负载类型
    pub fn workloads(&self) -> impl Iterator<Item = WorkloadClass> + '_ {
        self.chains.keys().copied()
    }

    /// 所有端点（按加载顺序）
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// 属于某 Provider 的端点
    pub fn members_of<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Endpoint> + 'a {
        self.endpoints.values().filter(move |e| e.provider == provider)
    }

    /// 端点所属 Provider
    pub fn provider_of(&self, id: &str) -> Option<&str> {
        self.endpoints.get(id).map(|e| e.provider.as_str())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let catalog = ModelCatalog::new(
            vec![
                Endpoint::new("a", "p1", 1),
                Endpoint::new("b", "p2", 1),
                Endpoint::new("d", "p1", 2),
            ],
            IndexMap::from([(
                WorkloadClass::Reasoning,
                vec!["a".to_string(), "b".to_string()],
            )]),
        )
        .unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.provider_of("d"), Some("p1"));
        assert_eq!(catalog.members_of("p1").count(), 2);
        assert_eq!(catalog.chain(WorkloadClass::Reasoning).unwrap().len(), 2);
        assert!(catalog.chain(WorkloadClass::Lookup).is_none());
    }

    #[test]
    fn test_catalog_rejects_unknown_chain_member() {
        let result = ModelCatalog::new(
            vec![Endpoint::new("a", "p1", 1)],
            IndexMap::from([(WorkloadClass::Lookup, vec!["zzz".to_string()])]),
        );
        assert!(result.is_err());
    }
}
