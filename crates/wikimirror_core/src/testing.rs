//! In-memory wiki and fixtures shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;

use crate::config::MirrorConfig;
use crate::fetch::{Backlink, CategoryMember, FetchedPage, RemoteContent, WikiSource};
use crate::materialize::Materializer;
use crate::transform::DefaultTransformer;

pub(crate) const TEST_CONFIG: &str = r#"
[wiki]
api_url = "https://wiki.example.org/w/api.php"

[mirror]
search = "builtin"
write_concurrency = 4

[frontpage]
article = "Main Page"
category = "Highlight"
refresh_categories = ["highlight"]

[translations]
langs = ["fr", "de"]

[categories.Event]
label = "Events"
index = true
parse = true

[categories.Tools]
label = "Tools"
index = true
parse = true

[categories.Highlight]
parse = true

[categories.Article]
label = "Articles"
parse = true
fallback = true
"#;

pub(crate) fn test_config() -> MirrorConfig {
    MirrorConfig::from_toml_str(TEST_CONFIG).expect("test config")
}

pub(crate) fn test_materializer(config: Arc<MirrorConfig>, wiki: Arc<MockWiki>) -> Materializer {
    let transformer = Arc::new(DefaultTransformer::from_config(&config).expect("transformer"));
    Materializer::new(config, wiki, transformer)
}

#[derive(Debug, Clone, Default)]
struct MockPage {
    html: String,
    categories: Vec<String>,
    backlinks: Vec<String>,
    created_at: Option<String>,
}

#[derive(Default)]
pub(crate) struct MockWiki {
    pages: Mutex<BTreeMap<String, MockPage>>,
    redirects: Mutex<BTreeMap<String, String>>,
    failing: Mutex<BTreeSet<String>>,
    fetches: Mutex<BTreeMap<String, usize>>,
    request_count: AtomicUsize,
}

impl MockWiki {
    pub(crate) fn put_page(&self, title: &str, html: &str, categories: &[&str], backlinks: &[&str]) {
        let created_at = self
            .pages
            .lock()
            .expect("pages")
            .get(title)
            .and_then(|page| page.created_at.clone());
        self.pages.lock().expect("pages").insert(
            title.to_string(),
            MockPage {
                html: html.to_string(),
                categories: categories.iter().map(|name| name.to_string()).collect(),
                backlinks: backlinks.iter().map(|name| name.to_string()).collect(),
                created_at,
            },
        );
    }

    pub(crate) fn set_created(&self, title: &str, timestamp: &str) {
        if let Some(page) = self.pages.lock().expect("pages").get_mut(title) {
            page.created_at = Some(timestamp.to_string());
        }
    }

    pub(crate) fn put_redirect(&self, from: &str, to: &str) {
        self.redirects
            .lock()
            .expect("redirects")
            .insert(from.to_string(), to.to_string());
    }

    pub(crate) fn remove_page(&self, title: &str) {
        self.pages.lock().expect("pages").remove(title);
    }

    /// Fetches of `title` fail until cleared with `recover`.
    pub(crate) fn fail_on(&self, title: &str) {
        self.failing.lock().expect("failing").insert(title.to_string());
    }

    pub(crate) fn recover(&self, title: &str) {
        self.failing.lock().expect("failing").remove(title);
    }

    pub(crate) fn fetches_of(&self, title: &str) -> usize {
        self.fetches
            .lock()
            .expect("fetches")
            .get(title)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WikiSource for MockWiki {
    async fn fetch_page(&self, title: &str) -> anyhow::Result<FetchedPage> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self
            .fetches
            .lock()
            .expect("fetches")
            .entry(title.to_string())
            .or_default() += 1;
        if self.failing.lock().expect("failing").contains(title) {
            bail!("connection reset while fetching {title}");
        }

        let redirect_target = self.redirects.lock().expect("redirects").get(title).cloned();
        let resolved = redirect_target.clone().unwrap_or_else(|| title.to_string());
        let Some(page) = self.pages.lock().expect("pages").get(&resolved).cloned() else {
            return Ok(FetchedPage::default());
        };
        let namespace = if resolved.starts_with("Special:") { -1 } else { 0 };
        Ok(FetchedPage {
            content: Some(RemoteContent {
                title: resolved.clone(),
                page_id: Some(1),
                namespace,
                html: page.html,
                categories: page.categories,
                images: Vec::new(),
                created_at: page.created_at,
                modified_at: Some("2024-05-01T10:00:00Z".to_string()),
            }),
            backlinks: Some(page.backlinks.iter().map(Backlink::new).collect()),
            redirect_target,
        })
    }

    async fn fetch_category_members(&self, category: &str) -> anyhow::Result<Vec<CategoryMember>> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let name = category.strip_prefix("Category:").unwrap_or(category);
        Ok(self
            .pages
            .lock()
            .expect("pages")
            .iter()
            .filter(|(_, page)| page.categories.iter().any(|candidate| candidate == name))
            .enumerate()
            .map(|(position, (title, page))| CategoryMember {
                title: title.clone(),
                page_id: position as i64 + 1,
                timestamp: page.created_at.clone(),
            })
            .collect())
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}
