use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::category::{CategoryStrategy, IndexEntry};
use crate::config::MirrorConfig;
use crate::dom;
use crate::fsindex::MirrorLayout;
use crate::materialize::{Materializer, Page};
use crate::render::Renderer;
use crate::title::{is_translation_facet, slugify};
use crate::writer::MirrorWriter;

/// What happened to a page, for deciding whether the front page is stale.
#[derive(Debug, Clone, Copy)]
pub enum FrontPageTrigger<'a> {
    Updated(&'a Page),
    Removed { title: &'a str, slug: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontPage {
    pub home: Page,
    pub highlights: Vec<IndexEntry>,
    /// `<li>` markup lifted verbatim from the events index.
    pub upcoming: Vec<String>,
}

pub struct FrontPageBuilder {
    config: Arc<MirrorConfig>,
    materializer: Arc<Materializer>,
    renderer: Arc<dyn Renderer>,
    layout: MirrorLayout,
    writer: MirrorWriter,
}

impl FrontPageBuilder {
    pub fn new(
        config: Arc<MirrorConfig>,
        materializer: Arc<Materializer>,
        renderer: Arc<dyn Renderer>,
        layout: MirrorLayout,
        writer: MirrorWriter,
    ) -> Self {
        Self {
            config,
            materializer,
            renderer,
            layout,
            writer,
        }
    }

    fn is_home(&self, title: &str) -> bool {
        self.config
            .frontpage
            .article
            .as_deref()
            .is_some_and(|article| slugify(article) == slugify(title))
    }

    pub async fn should_refresh(&self, trigger: FrontPageTrigger<'_>) -> Result<bool> {
        match trigger {
            FrontPageTrigger::Updated(page) => Ok(self.is_home(&page.title)
                || page
                    .categories
                    .iter()
                    .any(|slug| self.config.is_refresh_category(slug))),
            FrontPageTrigger::Removed { title, slug } => {
                if self.is_home(title) {
                    return Ok(true);
                }
                let path = self.writer.absolute(&self.layout.front_page_path());
                if !path.is_file() {
                    return Ok(false);
                }
                dom::contains_id(&self.writer.read(&path).await?, slug)
            }
        }
    }

    /// Rebuilds `index.html`. `Ok(None)` when no home article is configured
    /// or it is missing upstream.
    pub async fn rebuild(&self) -> Result<Option<PathBuf>> {
        let Some(article) = self.config.frontpage.article.as_deref() else {
            debug!("no home article configured");
            return Ok(None);
        };
        let Some(home) = self.materializer.materialize(article).await? else {
            warn!(article = %article, "home article missing upstream, front page left as is");
            return Ok(None);
        };

        let front = FrontPage {
            home,
            highlights: self.highlights().await?,
            upcoming: self.upcoming_events().await?,
        };
        let path = self.layout.front_page_path();
        self.writer
            .write(&path, &self.renderer.render_front_page(&front))
            .await?;
        info!(path = %path.display(), highlights = front.highlights.len(), upcoming = front.upcoming.len(), "front page rebuilt");
        Ok(Some(self.writer.absolute(&path)))
    }

    async fn highlights(&self) -> Result<Vec<IndexEntry>> {
        let Some(category) = self.config.frontpage.category.as_deref() else {
            return Ok(Vec::new());
        };
        let members = self
            .materializer
            .source()
            .fetch_category_members(category)
            .await
            .with_context(|| format!("failed to list highlight category `{category}`"))?;
        let langs = &self.config.translations.langs;
        let titles = members
            .into_iter()
            .map(|member| member.title)
            .filter(|title| !is_translation_facet(title, langs) && !self.is_home(title))
            .collect::<Vec<_>>();

        let strategy = self
            .config
            .category(&slugify(category))
            .map(|info| CategoryStrategy::for_category(&info))
            .unwrap_or(CategoryStrategy::Generic);
        let mut pages = self.materializer.materialize_many(&titles).await.pages;
        pages.sort_by(|left, right| {
            right
                .metadata
                .created_at
                .cmp(&left.metadata.created_at)
                .then_with(|| left.slug.cmp(&right.slug))
        });
        Ok(pages.into_iter().map(|page| strategy.entry(page)).collect())
    }

    /// Upcoming entries of the first indexed events category, as rendered
    /// on disk.
    async fn upcoming_events(&self) -> Result<Vec<String>> {
        let Some(events) = self
            .config
            .category_infos()
            .into_iter()
            .find(|info| info.index && CategoryStrategy::for_category(info) == CategoryStrategy::Events)
        else {
            return Ok(Vec::new());
        };
        let path = self.writer.absolute(&self.layout.index_path(&events.label_slug));
        if !path.is_file() {
            return Ok(Vec::new());
        }
        dom::outer_html_of(&self.writer.read(&path).await?, "section.upcoming li")
    }
}
