use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::config::MirrorConfig;
use crate::fetch::{Backlink, WikiSource};
use crate::title::{fold_translation_title, is_syncable_title, slugify};
use crate::transform::{RepoReference, Transformer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub info: BTreeMap<String, String>,
    pub images: Vec<String>,
    pub tool: Option<RepoReference>,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
    pub backlinks: Vec<Backlink>,
    pub redirect_target: Option<String>,
}

/// A page ready to render. Lives for one sync operation; its durable form
/// is the HTML file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    pub slug: String,
    /// Category slugs in upstream order.
    pub categories: Vec<String>,
    /// Directory used by nested layouts (label slug of the primary category).
    pub category_dir: Option<String>,
    pub html: String,
    pub metadata: PageMetadata,
}

impl Page {
    pub fn url(&self) -> String {
        format!("/{}", self.slug)
    }

    pub fn in_category(&self, slug: &str) -> bool {
        self.categories.iter().any(|category| category == slug)
    }
}

pub struct Materializer {
    config: Arc<MirrorConfig>,
    source: Arc<dyn WikiSource>,
    transformer: Arc<dyn Transformer>,
}

impl Materializer {
    pub fn new(
        config: Arc<MirrorConfig>,
        source: Arc<dyn WikiSource>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self {
            config,
            source,
            transformer,
        }
    }

    pub fn source(&self) -> &Arc<dyn WikiSource> {
        &self.source
    }

    /// `Ok(None)` when the page does not exist upstream or is not mirrorable.
    /// Fetch and transform failures come back as `Err` for the caller to log.
    #[instrument(skip(self))]
    pub async fn materialize(&self, title: &str) -> Result<Option<Page>> {
        let title = fold_translation_title(title.trim(), &self.config.translations.langs);
        let excluded = &self.config.filters.excluded_prefixes;
        if !is_syncable_title(&title, 0, excluded) {
            debug!(title = %title, "skipping non-content title");
            return Ok(None);
        }

        let fetched = self
            .source
            .fetch_page(&title)
            .await
            .with_context(|| format!("failed to fetch `{title}`"))?;
        let Some(content) = fetched.content else {
            debug!(title = %title, "no content upstream");
            return Ok(None);
        };
        if !is_syncable_title(&content.title, content.namespace, excluded) {
            debug!(title = %content.title, namespace = content.namespace, "skipping non-content page");
            return Ok(None);
        }

        let transformed = self
            .transformer
            .transform(&content, fetched.redirect_target.as_deref())
            .with_context(|| format!("failed to transform `{title}`"))?;

        let slug = slugify(&title);
        if slug.is_empty() {
            bail!("title `{title}` has no usable slug");
        }
        let category_dir = self.category_dir(&transformed.categories);

        Ok(Some(Page {
            title,
            slug,
            categories: transformed.categories,
            category_dir,
            html: transformed.html,
            metadata: PageMetadata {
                info: transformed.info,
                images: transformed.images,
                tool: transformed.tool,
                created_at: content.created_at,
                modified_at: content.modified_at,
                backlinks: fetched.backlinks.unwrap_or_default(),
                redirect_target: fetched.redirect_target,
            },
        }))
    }

    /// Materializes a batch concurrently. Failures are logged and dropped,
    /// so one bad page never sinks the batch.
    pub async fn materialize_many(&self, titles: &[String]) -> MaterializedBatch {
        let results = join_all(titles.iter().map(|title| self.materialize(title))).await;
        let mut batch = MaterializedBatch::default();
        for (title, result) in titles.iter().zip(results) {
            match result {
                Ok(Some(page)) => batch.pages.push(page),
                Ok(None) => batch.missing.push(title.clone()),
                Err(error) => {
                    warn!(title = %title, error = %format!("{error:#}"), "failed to materialize page");
                    batch.failed.push((title.clone(), format!("{error:#}")));
                }
            }
        }
        batch
    }

    fn category_dir(&self, categories: &[String]) -> Option<String> {
        let infos = self.config.category_infos();
        categories
            .iter()
            .find_map(|slug| infos.iter().find(|info| &info.slug == slug))
            .or_else(|| infos.iter().find(|info| info.fallback))
            .map(|info| info.label_slug.clone())
    }
}

#[derive(Debug, Default)]
pub struct MaterializedBatch {
    pub pages: Vec<Page>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}
