//! 静态站点探索：按域名查表，未登记的站点使用通用选择器

use std::collections::HashMap;

use async_trait::async_trait;

use super::{site_domain, SiteExplorer, SiteModel};
use crate::core::AuraError;

const DEFAULT_SEARCH_INPUT: &str = "input[name='q']";
const DEFAULT_SUBMIT_BUTTON: &str = "button[type='submit']";
const DEFAULT_RESULTS: &str = ".results";

#[derive(Debug, Default)]
pub struct StaticSiteExplorer {
    known: HashMap<String, SiteModel>,
}

impl StaticSiteExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记已知站点的模型（按 domain 索引）
    pub fn with_site(mut self, model: SiteModel) -> Self {
        self.known.insert(model.domain.clone(), model);
        self
    }

    fn generic(domain: &str) -> SiteModel {
        SiteModel {
            domain: domain.to_string(),
            homepage: format!("https://{}", domain),
            search_input: Some(DEFAULT_SEARCH_INPUT.to_string()),
            submit_button: DEFAULT_SUBMIT_BUTTON.to_string(),
            results: DEFAULT_RESULTS.to_string(),
        }
    }
}

#[async_trait]
impl SiteExplorer for StaticSiteExplorer {
    async fn explore(&self, site_scope: &str) -> Result<SiteModel, AuraError> {
        let domain = site_domain(site_scope);
        if domain.is_empty() {
            return Err(AuraError::Validation(vec![format!(
                "invalid site scope: '{}'",
                site_scope
            )]));
        }

        let model = match self.known.get(&domain) {
            Some(model) => model.clone(),
            None => Self::generic(&domain),
        };
        tracing::debug!("Site model for {}: homepage {}", domain, model.homepage);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generic_model_from_url() {
        let model = StaticSiteExplorer::new()
            .explore("https://Example.com/search?q=1")
            .await
            .unwrap();
        assert_eq!(model.domain, "example.com");
        assert_eq!(model.homepage, "https://example.com");
        assert_eq!(model.search_input.as_deref(), Some(DEFAULT_SEARCH_INPUT));
    }

    #[tokio::test]
    async fn test_known_site_overrides() {
        let explorer = StaticSiteExplorer::new().with_site(SiteModel {
            domain: "docs.rs".into(),
            homepage: "https://docs.rs".into(),
            search_input: None,
            submit_button: "#go".into(),
            results: ".recent-releases".into(),
        });
        let model = explorer.explore("docs.rs").await.unwrap();
        assert_eq!(model.submit_button, "#go");
        assert!(model.search_input.is_none());
        assert!(explorer.explore("  ").await.is_err());
    }
}
