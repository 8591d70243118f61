use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "commonspub/0.2";
pub const DEFAULT_COMMONS_API_URL: &str = "https://commons.wikimedia.org/w/api.php";
pub const DEFAULT_WIKIDATA_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 24;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PublishConfig {
    #[serde(default)]
    pub commons: EndpointSection,
    #[serde(default)]
    pub wikidata: EndpointSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub resolver: ResolverSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EndpointSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub ttl_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ResolverSection {
    #[serde(default)]
    pub on_unlinked_category: UnlinkedCategoryPolicy,
}

/// What to do when a category with the performer's exact name exists on
/// Commons but carries no entity link at all. Reusing it risks conflating two
/// same-named real-world entities, so the default qualifies the name instead.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnlinkedCategoryPolicy {
    Reuse,
    #[default]
    Disambiguate,
}

impl PublishConfig {
    /// Resolve the Commons API URL: env COMMONS_API_URL > config > default.
    pub fn commons_api_url(&self) -> String {
        resolve_value(
            "COMMONS_API_URL",
            self.commons.api_url.as_deref(),
            DEFAULT_COMMONS_API_URL,
        )
    }

    /// Resolve the Wikidata API URL: env WIKIDATA_API_URL > config > default.
    pub fn wikidata_api_url(&self) -> String {
        resolve_value(
            "WIKIDATA_API_URL",
            self.wikidata.api_url.as_deref(),
            DEFAULT_WIKIDATA_API_URL,
        )
    }

    /// Resolve user agent: env WIKI_USER_AGENT > per-endpoint config > default.
    pub fn user_agent(&self, section: &EndpointSection) -> String {
        resolve_value(
            "WIKI_USER_AGENT",
            section.user_agent.as_deref(),
            DEFAULT_USER_AGENT,
        )
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        let hours = env::var("COMMONSPUB_CACHE_TTL_HOURS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.cache.ttl_hours)
            .unwrap_or(DEFAULT_CACHE_TTL_HOURS);
        hours.saturating_mul(3_600)
    }

    pub fn unlinked_category_policy(&self) -> UnlinkedCategoryPolicy {
        match env::var("COMMONSPUB_UNLINKED_CATEGORY").ok().as_deref() {
            Some("reuse") => UnlinkedCategoryPolicy::Reuse,
            Some("disambiguate") => UnlinkedCategoryPolicy::Disambiguate,
            _ => self.resolver.on_unlinked_category,
        }
    }
}

fn resolve_value(env_key: &str, config_value: Option<&str>, default: &str) -> String {
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    config_value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| default.to_string())
}

/// Load a PublishConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PublishConfig> {
    if !config_path.exists() {
        return Ok(PublishConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PublishConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_wikimedia_endpoints() {
        let config = PublishConfig::default();
        assert_eq!(config.commons_api_url(), DEFAULT_COMMONS_API_URL);
        assert_eq!(config.wikidata_api_url(), DEFAULT_WIKIDATA_API_URL);
        assert_eq!(config.cache_ttl_secs(), 24 * 3_600);
        assert_eq!(
            config.unlinked_category_policy(),
            UnlinkedCategoryPolicy::Disambiguate
        );
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/commonspub.toml")).expect("load config");
        assert!(config.commons.api_url.is_none());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("commonspub.toml");
        fs::write(
            &config_path,
            r#"
[commons]
api_url = "https://commons.example.org/w/api.php"
user_agent = "test-agent/1.0"

[wikidata]
api_url = "https://wikidata.example.org/w/api.php"

[cache]
ttl_hours = 6

[resolver]
on_unlinked_category = "reuse"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.commons.api_url.as_deref(),
            Some("https://commons.example.org/w/api.php")
        );
        assert_eq!(config.commons.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.cache.ttl_hours, Some(6));
        assert_eq!(config.cache_ttl_secs(), 6 * 3_600);
        assert_eq!(
            config.resolver.on_unlinked_category,
            UnlinkedCategoryPolicy::Reuse
        );
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("commonspub.toml");
        fs::write(&config_path, "[commons]\nuser_agent = \"x/1\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.commons.api_url.is_none());
        assert_eq!(config.commons.user_agent.as_deref(), Some("x/1"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("commonspub.toml");
        fs::write(&config_path, "[commons\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
