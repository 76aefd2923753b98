use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::title::slugify;

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.1";
pub const DEFAULT_OUTPUT_DIR: &str = "wiki";
pub const DEFAULT_LISTENER_BIND: &str = "127.0.0.1:1338";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub mirror: MirrorSection,
    #[serde(default)]
    pub frontpage: FrontPageSection,
    #[serde(default)]
    pub translations: TranslationSection,
    #[serde(default)]
    pub filters: FilterSection,
    #[serde(default)]
    pub listener: ListenerSection,
    #[serde(default)]
    pub categories: BTreeMap<String, CategorySection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for WikiSection {
    fn default() -> Self {
        Self {
            api_url: None,
            url: None,
            user_agent: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    #[default]
    Ripgrep,
    Builtin,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MirrorSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    pub write_concurrency: Option<usize>,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default)]
    pub search: SearchBackend,
    #[serde(default)]
    pub nested_categories: bool,
    /// Directory of static files copied into the mirror on a full build.
    #[serde(default)]
    pub assets_dir: Option<String>,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            write_concurrency: None,
            fetch_concurrency: default_fetch_concurrency(),
            search: SearchBackend::default(),
            nested_categories: false,
            assets_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FrontPageSection {
    pub article: Option<String>,
    pub category: Option<String>,
    #[serde(default = "default_refresh_categories")]
    pub refresh_categories: Vec<String>,
}

impl Default for FrontPageSection {
    fn default() -> Self {
        Self {
            article: None,
            category: None,
            refresh_categories: default_refresh_categories(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TranslationSection {
    #[serde(default)]
    pub langs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FilterSection {
    #[serde(default = "default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            excluded_prefixes: default_excluded_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListenerSection {
    #[serde(default = "default_listener_bind")]
    pub bind: String,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            bind: default_listener_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CategorySection {
    pub label: Option<String>,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub parse: bool,
    #[serde(default)]
    pub fallback: bool,
}

/// A configured category with its derived slugs resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    /// Upstream category name, without the `Category:` prefix.
    pub key: String,
    pub slug: String,
    pub label: String,
    /// File stem of the category index page.
    pub label_slug: String,
    pub index: bool,
    pub parse: bool,
    pub fallback: bool,
}

impl MirrorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse mirror config TOML")
    }

    /// Environment values win over the file: WIKI_API_URL, WIKI_URL, WIKI_USER_AGENT.
    pub fn apply_env_overrides<F>(&mut self, lookup_env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = read("WIKI_API_URL") {
            self.wiki.api_url = Some(value);
        }
        if let Some(value) = read("WIKI_URL") {
            self.wiki.url = Some(value);
        }
        if let Some(value) = read("WIKI_USER_AGENT") {
            self.wiki.user_agent = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .wiki
            .api_url
            .as_deref()
            .is_none_or(|value| value.trim().is_empty())
        {
            bail!(
                "wiki API URL is not configured\nSet [wiki].api_url in the config file or WIKI_API_URL in the environment"
            );
        }
        let fallbacks = self
            .categories
            .iter()
            .filter(|(_, section)| section.fallback)
            .map(|(key, _)| key.as_str())
            .collect::<Vec<_>>();
        match fallbacks.len() {
            0 => bail!("no fallback category configured; mark one [categories.<Key>] with fallback = true"),
            1 => {}
            _ => bail!(
                "more than one fallback category configured: {}",
                fallbacks.join(", ")
            ),
        }
        if self.mirror.fetch_concurrency == 0 {
            bail!("[mirror].fetch_concurrency must be at least 1");
        }
        if self.mirror.write_concurrency == Some(0) {
            bail!("[mirror].write_concurrency must be at least 1 when set");
        }
        Ok(())
    }

    pub fn api_url(&self) -> Option<&str> {
        self.wiki.api_url.as_deref()
    }

    /// Canonical public wiki URL: config `url`, else derived from the API URL.
    pub fn wiki_url(&self) -> Option<String> {
        if let Some(url) = &self.wiki.url {
            return Some(url.trim_end_matches('/').to_string());
        }
        self.api_url().and_then(derive_wiki_url)
    }

    pub fn user_agent(&self) -> String {
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn category_infos(&self) -> Vec<CategoryInfo> {
        self.categories
            .iter()
            .map(|(key, section)| {
                let label = section.label.clone().unwrap_or_else(|| key.clone());
                CategoryInfo {
                    key: key.clone(),
                    slug: slugify(key),
                    label_slug: slugify(&label),
                    label,
                    index: section.index,
                    parse: section.parse,
                    fallback: section.fallback,
                }
            })
            .collect()
    }

    /// Looks a category up by its slug (`"event"` for `[categories.Event]`).
    pub fn category(&self, slug: &str) -> Option<CategoryInfo> {
        self.category_infos()
            .into_iter()
            .find(|info| info.slug == slug)
    }

    /// Only categories with `index = true` get an index page.
    pub fn indexed_category(&self, slug: &str) -> Option<CategoryInfo> {
        self.category(slug).filter(|info| info.index)
    }

    pub fn fallback_category(&self) -> Option<CategoryInfo> {
        self.category_infos().into_iter().find(|info| info.fallback)
    }

    pub fn is_refresh_category(&self, slug: &str) -> bool {
        self.frontpage
            .refresh_categories
            .iter()
            .any(|candidate| slugify(candidate) == slug)
    }
}

/// Load the mirror config from TOML, then layer environment overrides on top.
/// A missing file yields defaults; `validate` decides whether that is usable.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    let mut config = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        MirrorConfig::default()
    };
    config.apply_env_overrides(|key| env::var(key).ok());
    Ok(config)
}

/// Derive wiki base URL from an API URL by stripping `/api.php` or `/w/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() { None } else { Some(result) }
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_output_dir() -> String {
    DEFAULT_OUTPUT_DIR.to_string()
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_refresh_categories() -> Vec<String> {
    vec!["event".to_string(), "highlight".to_string()]
}

fn default_excluded_prefixes() -> Vec<String> {
    vec!["Concept:".to_string(), "Special:".to_string()]
}

fn default_listener_bind() -> String {
    DEFAULT_LISTENER_BIND.to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[wiki]
api_url = "https://wiki.example.org/w/api.php"
user_agent = "test-agent/1.0"

[mirror]
write_concurrency = 4
search = "builtin"

[frontpage]
article = "Home"
category = "Highlight"

[translations]
langs = ["fr", "ja"]

[categories.Event]
label = "Events"
index = true
parse = true

[categories.Article]
parse = true
fallback = true
"#;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config.mirror.output_dir, "wiki");
        assert_eq!(config.listener.bind, DEFAULT_LISTENER_BIND);
        assert_eq!(config.filters.excluded_prefixes, ["Concept:", "Special:"]);
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, SAMPLE).expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.mirror.write_concurrency, Some(4));
        assert_eq!(config.mirror.search, SearchBackend::Builtin);
        assert_eq!(config.frontpage.article.as_deref(), Some("Home"));
        assert_eq!(config.frontpage.refresh_categories, ["event", "highlight"]);
        assert_eq!(config.translations.langs, ["fr", "ja"]);
        assert_eq!(config.categories.len(), 2);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = MirrorConfig::from_toml_str(SAMPLE).expect("parse");
        let env = HashMap::from([
            ("WIKI_API_URL", "https://other.example/api.php"),
            ("WIKI_USER_AGENT", "  "),
        ]);
        config.apply_env_overrides(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.api_url(), Some("https://other.example/api.php"));
        assert_eq!(config.user_agent(), "test-agent/1.0");
    }

    #[test]
    fn validate_requires_api_url() {
        let config = MirrorConfig::default();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("wiki API URL is not configured"));
    }

    #[test]
    fn validate_requires_exactly_one_fallback() {
        let mut config = MirrorConfig::from_toml_str(SAMPLE).expect("parse");
        config.validate().expect("valid sample");

        config
            .categories
            .get_mut("Event")
            .expect("event category")
            .fallback = true;
        let error = config.validate().expect_err("two fallbacks");
        assert!(error.to_string().contains("more than one fallback"));

        config.categories.clear();
        let error = config.validate().expect_err("no fallback");
        assert!(error.to_string().contains("no fallback category"));
    }

    #[test]
    fn category_lookup_resolves_labels_and_slugs() {
        let config = MirrorConfig::from_toml_str(SAMPLE).expect("parse");
        let event = config.indexed_category("event").expect("event indexed");
        assert_eq!(event.key, "Event");
        assert_eq!(event.label, "Events");
        assert_eq!(event.label_slug, "events");

        assert!(config.category("article").is_some());
        assert!(config.indexed_category("article").is_none());
        assert_eq!(
            config.fallback_category().map(|info| info.key),
            Some("Article".to_string())
        );
        assert!(config.is_refresh_category("event"));
        assert!(!config.is_refresh_category("article"));
    }

    #[test]
    fn wiki_url_falls_back_to_api_url() {
        let config = MirrorConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(
            config.wiki_url().as_deref(),
            Some("https://wiki.example.org")
        );
    }

    #[test]
    fn derive_wiki_url_strips_api_php() {
        assert_eq!(
            derive_wiki_url("https://wiki.example.org/api.php"),
            Some("https://wiki.example.org".to_string())
        );
        assert_eq!(derive_wiki_url("/api.php"), None);
    }
}
