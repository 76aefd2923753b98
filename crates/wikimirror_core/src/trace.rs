//! Keeps references between generated files honest when a page is renamed,
//! removed or re-rendered.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::dom::{self, AnchorEdit};
use crate::fsindex::MirrorIndex;
use crate::materialize::Page;
use crate::title::{slugify, wiki_title_token};
use crate::transform::query_title;
use crate::writer::{MirrorWriter, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Point every matching anchor at this URL.
    Retarget(String),
    /// Drop every matching anchor.
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceReport {
    pub scanned: usize,
    pub rewritten: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl TraceReport {
    fn absorb(&mut self, path: PathBuf, result: Result<bool>) {
        self.scanned += 1;
        match result {
            Ok(true) => self.rewritten.push(path),
            Ok(false) => {}
            Err(error) => {
                warn!(path = %path.display(), error = %format!("{error:#}"), "failed to update references");
                self.failed.push((path, format!("{error:#}")));
            }
        }
    }
}

/// Every URL shape a link to `title` has taken in generated files: the bare
/// slug, `/slug`, `slug.html`, `/slug.html` (with an optional query or
/// fragment), and `index.php?title=Title[&action=..]`.
#[derive(Debug, Clone)]
pub struct LinkShapes {
    slug: String,
}

impl LinkShapes {
    pub fn for_title(title: &str) -> Self {
        Self {
            slug: slugify(title),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn matches(&self, href: &str) -> bool {
        if self.slug.is_empty() {
            return false;
        }
        let href = href.trim();
        if dom::href_targets_slug(href, &self.slug) {
            return true;
        }
        if href == self.slug || href.strip_suffix(".html") == Some(self.slug.as_str()) {
            return true;
        }
        href.contains("index.php")
            && query_title(href).is_some_and(|title| slugify(&title) == self.slug)
    }
}

#[derive(Debug, Clone)]
pub struct TraceUpdater {
    index: MirrorIndex,
    writer: MirrorWriter,
}

impl TraceUpdater {
    pub fn new(index: MirrorIndex, writer: MirrorWriter) -> Self {
        Self { index, writer }
    }

    /// Rewrites or drops every anchor that points at `old_title`, in any of
    /// its historic URL shapes. Idempotent.
    #[instrument(skip(self))]
    pub async fn rewrite_links(&self, old_title: &str, action: &LinkAction) -> Result<TraceReport> {
        let shapes = LinkShapes::for_title(old_title);
        if shapes.slug().is_empty() {
            return Ok(TraceReport::default());
        }
        let mut candidates = BTreeSet::new();
        for pattern in [shapes.slug().to_string(), wiki_title_token(old_title)] {
            candidates.extend(self.index.find_by_content(&pattern).await?);
        }

        let results = join_all(
            candidates
                .iter()
                .map(|path| self.rewrite_file(path, &shapes, action)),
        )
        .await;
        let mut report = TraceReport::default();
        for (path, result) in candidates.into_iter().zip(results) {
            report.absorb(path, result);
        }
        debug!(scanned = report.scanned, rewritten = report.rewritten.len(), "links rewritten");
        Ok(report)
    }

    /// Strips index entries keyed by `slug` and anchors to `/slug` (with
    /// their list items) from every file mentioning it. Idempotent.
    #[instrument(skip(self))]
    pub async fn remove_traces(&self, slug: &str) -> Result<TraceReport> {
        if slug.is_empty() {
            return Ok(TraceReport::default());
        }
        let candidates = self.index.find_by_content(slug).await?;
        let results = join_all(candidates.iter().map(|path| self.strip_file(path, slug))).await;
        let mut report = TraceReport::default();
        for (path, result) in candidates.into_iter().zip(results) {
            report.absorb(path, result);
        }
        debug!(scanned = report.scanned, rewritten = report.rewritten.len(), "traces removed");
        Ok(report)
    }

    /// Points the links inside each backlinking page at the page's current
    /// URL, so older link shapes converge.
    #[instrument(skip(self, page), fields(page = %page.slug))]
    pub async fn update_backlinks(&self, page: &Page) -> Result<TraceReport> {
        let shapes = LinkShapes::for_title(&page.title);
        let action = LinkAction::Retarget(page.url());
        let mut files = BTreeSet::new();
        for backlink in &page.metadata.backlinks {
            if backlink.slug == page.slug {
                continue;
            }
            if let Some(path) = self.index.locate(&backlink.slug)?.into_iter().next() {
                files.insert(path);
            }
        }

        let results = join_all(
            files
                .iter()
                .map(|path| self.rewrite_file(path, &shapes, &action)),
        )
        .await;
        let mut report = TraceReport::default();
        for (path, result) in files.into_iter().zip(results) {
            report.absorb(path, result);
        }
        Ok(report)
    }

    async fn rewrite_file(&self, path: &Path, shapes: &LinkShapes, action: &LinkAction) -> Result<bool> {
        let document = self.writer.read(path).await?;
        let edited = dom::rewrite_anchor_hrefs(&document, |href| {
            if !shapes.matches(href) {
                return AnchorEdit::Keep;
            }
            match action {
                LinkAction::Retarget(url) => AnchorEdit::Retarget(url.clone()),
                LinkAction::Remove => AnchorEdit::Remove,
            }
        })?;
        self.store(path, edited).await
    }

    async fn strip_file(&self, path: &Path, slug: &str) -> Result<bool> {
        let document = self.writer.read(path).await?;
        let edited = dom::remove_nodes_matching(&document, slug)?;
        self.store(path, edited).await
    }

    async fn store(&self, path: &Path, edited: Option<String>) -> Result<bool> {
        match edited {
            Some(document) => Ok(self.writer.write(path, &document).await? == WriteOutcome::Written),
            None => Ok(false),
        }
    }
}
