//! The controller: one change event in, every affected file regenerated.
//!
//! Each event runs to completion in phases (materialize, category indexes,
//! backlinks, front page, write, duplicate cleanup). Work inside a phase is
//! joined concurrently; phases never overlap. Failures are logged and
//! recorded on the report, never raised.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::category::{CategoryIndexBuilder, PatchOutcome};
use crate::config::MirrorConfig;
use crate::dom;
use crate::event::{ChangeEvent, SyncAction};
use crate::fetch::{MediaWikiClient, MediaWikiClientConfig, WikiSource};
use crate::frontpage::{FrontPageBuilder, FrontPageTrigger};
use crate::fsindex::{ContentSearch, MirrorIndex, MirrorLayout};
use crate::materialize::{Materializer, Page};
use crate::render::{HtmlRenderer, MOVED_NOTICE_CLASS, Renderer};
use crate::title::{is_syncable_title, is_translation_facet, slugify};
use crate::trace::{LinkAction, TraceReport, TraceUpdater};
use crate::transform::{DefaultTransformer, Transformer};
use crate::writer::{MirrorWriter, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    Removed,
    Moved,
    Ignored(String),
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Moved => "moved",
            Self::Ignored(_) => "ignored",
        }
    }
}

/// What one event did to the mirror. Partial effects are normal: a failing
/// step is recorded in `errors` and the remaining steps still run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub title: String,
    pub outcome: SyncOutcome,
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub indexes: Vec<(String, PatchOutcome)>,
    pub traces: Vec<PathBuf>,
    pub front_page: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(title: &str, outcome: SyncOutcome) -> Self {
        Self {
            title: title.to_string(),
            outcome,
            written: Vec::new(),
            removed: Vec::new(),
            indexes: Vec::new(),
            traces: Vec::new(),
            front_page: false,
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, step: &str, error: anyhow::Error) {
        error!(title = %self.title, step, error = %format!("{error:#}"), "sync step failed");
        self.errors.push(format!("{step}: {error:#}"));
    }

    fn absorb_traces(&mut self, step: &str, result: Result<TraceReport>) {
        match result {
            Ok(report) => {
                for path in report.rewritten {
                    if !self.traces.contains(&path) {
                        self.traces.push(path);
                    }
                }
                for (path, message) in report.failed {
                    self.errors.push(format!("{step}: {}: {message}", path.display()));
                }
            }
            Err(error) => self.fail(step, error),
        }
    }
}

/// Totals of a batch rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub written: usize,
    pub unchanged: usize,
    pub duplicates_removed: usize,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub indexes: Vec<PathBuf>,
    pub front_page: Option<PathBuf>,
    /// Asset files copied because they were new or changed.
    pub assets: usize,
}

impl BuildReport {
    /// A batch fails only when pages failed and none made it to disk.
    pub fn succeeded(&self) -> bool {
        self.written + self.unchanged > 0 || self.failed.is_empty()
    }
}

pub struct SyncEngine {
    config: Arc<MirrorConfig>,
    layout: MirrorLayout,
    index: MirrorIndex,
    writer: MirrorWriter,
    materializer: Arc<Materializer>,
    renderer: Arc<dyn Renderer>,
    categories: CategoryIndexBuilder,
    traces: TraceUpdater,
    front: FrontPageBuilder,
    assets: Option<PathBuf>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<MirrorConfig>,
        mirror_root: impl Into<PathBuf>,
        source: Arc<dyn WikiSource>,
        transformer: Arc<dyn Transformer>,
        renderer: Arc<dyn Renderer>,
        search: ContentSearch,
    ) -> Self {
        let root = mirror_root.into();
        let layout = MirrorLayout::new(&root, &config);
        let index = MirrorIndex::new(&root, search);
        let writer = MirrorWriter::new(&root, config.mirror.write_concurrency);
        let materializer = Arc::new(Materializer::new(config.clone(), source, transformer));
        Self {
            categories: CategoryIndexBuilder::new(
                config.clone(),
                materializer.clone(),
                renderer.clone(),
                layout.clone(),
                writer.clone(),
            ),
            traces: TraceUpdater::new(index.clone(), writer.clone()),
            front: FrontPageBuilder::new(
                config.clone(),
                materializer.clone(),
                renderer.clone(),
                layout.clone(),
                writer.clone(),
            ),
            config,
            layout,
            index,
            writer,
            materializer,
            renderer,
            assets: None,
        }
    }

    /// Static files copied by `rebuild_all` to `<mirror_root>/<dir name>/`.
    pub fn with_assets_dir(mut self, assets: Option<PathBuf>) -> Self {
        self.assets = assets;
        self
    }

    /// Wires the MediaWiki client, default transformer and HTML renderer.
    /// Configuration problems surface here, before any event is taken.
    pub fn from_config(config: Arc<MirrorConfig>, mirror_root: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let client = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config)?)?;
        let transformer = DefaultTransformer::from_config(&config)?;
        let search = ContentSearch::detect(config.mirror.search)?;
        let renderer = HtmlRenderer::from_config(&config);
        Ok(Self::new(
            config,
            mirror_root,
            Arc::new(client),
            Arc::new(transformer),
            Arc::new(renderer),
            search,
        ))
    }

    pub fn mirror_root(&self) -> &Path {
        self.layout.root()
    }

    pub fn request_count(&self) -> usize {
        self.materializer.source().request_count()
    }

    #[instrument(skip(self, event), fields(title = %event.title, kind = %event.kind))]
    pub async fn handle_event(&self, event: &ChangeEvent) -> SyncReport {
        match event.classify(&self.config) {
            SyncAction::Upsert { title } => self.sync_title(&title).await,
            SyncAction::Delete { title } => self.delete_title(&title).await,
            SyncAction::Move {
                source,
                target,
                leave_redirect,
            } => self.move_title(&source, &target, leave_redirect).await,
            SyncAction::Ignore { reason } => {
                warn!(reason = %reason, "event ignored");
                SyncReport::new(&event.title, SyncOutcome::Ignored(reason))
            }
        }
    }

    /// New or edited page. A page gone upstream is removed locally; a fetch
    /// failure leaves the mirror untouched.
    #[instrument(skip(self))]
    pub async fn sync_title(&self, title: &str) -> SyncReport {
        if !is_syncable_title(title, 0, &self.config.filters.excluded_prefixes) {
            return SyncReport::new(
                title,
                SyncOutcome::Ignored(format!("non-content title `{title}`")),
            );
        }
        let mut report = SyncReport::new(title, SyncOutcome::Updated);
        let page = match self.materializer.materialize(title).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                info!(title, "page missing upstream, removing local copy");
                report.outcome = SyncOutcome::Removed;
                self.remove_everywhere(title, &mut report).await;
                return report;
            }
            Err(error) => {
                report.fail("materialize", error);
                return report;
            }
        };

        self.patch_indexes(&page, &mut report).await;
        report.absorb_traces("backlinks", self.traces.update_backlinks(&page).await);
        self.refresh_front_page(FrontPageTrigger::Updated(&page), &mut report)
            .await;
        self.write_and_dedupe(&page, &mut report).await;
        info!(title = %page.title, written = report.written.len(), indexes = report.indexes.len(), "page synced");
        report
    }

    #[instrument(skip(self))]
    pub async fn delete_title(&self, title: &str) -> SyncReport {
        let mut report = SyncReport::new(title, SyncOutcome::Removed);
        self.remove_everywhere(title, &mut report).await;
        info!(title, removed = report.removed.len(), traces = report.traces.len(), "page deleted");
        report
    }

    #[instrument(skip(self))]
    pub async fn move_title(&self, source: &str, target: &str, leave_redirect: bool) -> SyncReport {
        let mut report = SyncReport::new(target, SyncOutcome::Moved);
        let page = match self.materializer.materialize(target).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!(source, target, "move target missing upstream");
                if !leave_redirect {
                    report.outcome = SyncOutcome::Removed;
                    self.remove_everywhere(source, &mut report).await;
                }
                return report;
            }
            Err(error) => {
                report.fail("materialize", error);
                return report;
            }
        };

        let source_slug = slugify(source);
        let renamed = !source_slug.is_empty() && source_slug != page.slug;
        let source_on_front_page = renamed
            && self
                .check_front_page(
                    FrontPageTrigger::Removed {
                        title: source,
                        slug: &source_slug,
                    },
                    &mut report,
                )
                .await;

        self.patch_indexes(&page, &mut report).await;
        report.absorb_traces("backlinks", self.traces.update_backlinks(&page).await);

        if renamed && leave_redirect {
            if let Err(error) = self.write_redirect_stub(&source_slug, &page, &mut report).await {
                report.fail("redirect stub", error);
            }
        } else if renamed {
            let retarget = LinkAction::Retarget(page.url());
            report.absorb_traces("rewrite links", self.traces.rewrite_links(source, &retarget).await);
            match self.delete_locally(&source_slug).await {
                Ok(removed) => report.removed.extend(removed),
                Err(error) => report.fail("delete source", error),
            }
            report.absorb_traces("remove traces", self.traces.remove_traces(&source_slug).await);
        }

        if source_on_front_page {
            self.rebuild_front_page(&mut report).await;
        } else {
            self.refresh_front_page(FrontPageTrigger::Updated(&page), &mut report)
                .await;
        }
        self.write_and_dedupe(&page, &mut report).await;
        info!(source, target = %page.title, leave_redirect, "page moved");
        report
    }

    /// Deletes every non-reserved file named after `slug`.
    pub async fn delete_locally(&self, slug: &str) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.index.locate(slug)? {
            if self.layout.is_reserved(&path) {
                continue;
            }
            if self.writer.remove(&path).await? {
                info!(path = %path.display(), "removed page file");
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Rebuilds every `parse` category, every index and the front page.
    #[instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        let mut titles = BTreeSet::new();
        for info in self.config.category_infos().into_iter().filter(|info| info.parse) {
            match self.member_titles(&info.key).await {
                Ok(members) => titles.extend(members),
                Err(error) => {
                    warn!(category = %info.key, error = %format!("{error:#}"), "failed to list category");
                    report.failed.push(format!("category {}: {error:#}", info.key));
                }
            }
        }

        let pages = self
            .publish_batch(titles.into_iter().collect(), &mut report)
            .await;
        for info in self.config.category_infos().into_iter().filter(|info| info.index) {
            let path = if info.parse {
                let members = pages
                    .iter()
                    .filter(|page| page.in_category(&info.slug))
                    .cloned()
                    .collect();
                let index = self.categories.shape(info.clone(), members);
                self.categories.write_index(&index).await.map(Some)
            } else {
                self.categories.rebuild(&info.slug, None).await
            };
            match path {
                Ok(Some(path)) => report.indexes.push(path),
                Ok(None) => {}
                Err(error) => {
                    warn!(category = %info.key, error = %format!("{error:#}"), "failed to write category index");
                    report.failed.push(format!("index {}: {error:#}", info.key));
                }
            }
        }
        self.rebuild_front_page_into(&mut report).await;
        if let Some(assets) = &self.assets {
            match self.copy_assets(assets).await {
                Ok(copied) => report.assets = copied,
                Err(error) => {
                    warn!(dir = %assets.display(), error = %format!("{error:#}"), "failed to copy assets");
                    report.failed.push(format!("assets: {error:#}"));
                }
            }
        }
        info!(written = report.written, unchanged = report.unchanged, assets = report.assets, failed = report.failed.len(), "mirror rebuilt");
        Ok(report)
    }

    /// Rebuilds the members and index of one configured category.
    #[instrument(skip(self))]
    pub async fn rebuild_category(&self, slug: &str) -> Result<BuildReport> {
        let slug = slugify(slug);
        let Some(info) = self.config.category(&slug) else {
            bail!("unknown category `{slug}`; configure it under [categories] first");
        };
        let mut report = BuildReport::default();
        let titles = self.member_titles(&info.key).await?;
        let pages = self.publish_batch(titles, &mut report).await;

        if info.index {
            let members = pages
                .into_iter()
                .filter(|page| page.in_category(&info.slug))
                .collect();
            let index = self.categories.shape(info.clone(), members);
            report.indexes.push(self.categories.write_index(&index).await?);
        }
        if self.config.is_refresh_category(&info.slug) {
            self.rebuild_front_page_into(&mut report).await;
        }
        info!(category = %info.key, written = report.written, failed = report.failed.len(), "category rebuilt");
        Ok(report)
    }

    /// Returns how many files were new or changed.
    async fn copy_assets(&self, source: &Path) -> Result<usize> {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("assets dir has no name: {}", source.display()))?;
        let files = {
            let source = source.to_path_buf();
            tokio::task::spawn_blocking(move || list_asset_files(&source))
                .await
                .context("asset scan task failed")??
        };
        let target = Path::new(name);
        let outcomes = join_all(files.iter().map(|relative| async move {
            let from = source.join(relative);
            let bytes = tokio::fs::read(&from)
                .await
                .with_context(|| format!("failed to read {}", from.display()))?;
            self.writer.write_bytes(&target.join(relative), &bytes).await
        }))
        .await;
        let mut copied = 0;
        for outcome in outcomes {
            if outcome? == WriteOutcome::Written {
                copied += 1;
            }
        }
        debug!(dir = %source.display(), files = files.len(), copied, "assets copied");
        Ok(copied)
    }

    async fn member_titles(&self, category: &str) -> Result<Vec<String>> {
        let members = self
            .materializer
            .source()
            .fetch_category_members(category)
            .await
            .with_context(|| format!("failed to list members of `{category}`"))?;
        let langs = &self.config.translations.langs;
        let excluded = &self.config.filters.excluded_prefixes;
        Ok(members
            .into_iter()
            .map(|member| member.title)
            .filter(|title| !is_translation_facet(title, langs) && is_syncable_title(title, 0, excluded))
            .collect())
    }

    /// Materializes and writes a batch; one file per slug, failures recorded.
    async fn publish_batch(&self, titles: Vec<String>, report: &mut BuildReport) -> Vec<Page> {
        let batch = self.materializer.materialize_many(&titles).await;
        report.skipped.extend(batch.missing);
        report
            .failed
            .extend(batch.failed.into_iter().map(|(title, message)| format!("{title}: {message}")));

        let mut by_slug = BTreeMap::new();
        for page in batch.pages {
            by_slug.entry(page.slug.clone()).or_insert(page);
        }
        let pages = by_slug.into_values().collect::<Vec<_>>();

        let results = join_all(pages.iter().map(|page| self.write_page(page))).await;
        let mut written = Vec::new();
        for (page, result) in pages.into_iter().zip(results) {
            match result {
                Ok((_, WriteOutcome::Written)) => report.written += 1,
                Ok((_, WriteOutcome::Unchanged)) => report.unchanged += 1,
                Err(error) => {
                    warn!(title = %page.title, error = %format!("{error:#}"), "failed to write page");
                    report.failed.push(format!("{}: {error:#}", page.title));
                    continue;
                }
            }
            match self.remove_duplicates(&page).await {
                Ok(removed) => report.duplicates_removed += removed.len(),
                Err(error) => warn!(title = %page.title, error = %format!("{error:#}"), "duplicate cleanup failed"),
            }
            written.push(page);
        }
        written
    }

    async fn patch_indexes(&self, page: &Page, report: &mut SyncReport) {
        if is_translation_facet(&page.title, &self.config.translations.langs) {
            debug!(title = %page.title, "translation facet, category indexes left alone");
            return;
        }
        let indexed = self
            .config
            .category_infos()
            .into_iter()
            .filter(|info| info.index)
            .collect::<Vec<_>>();
        let results = join_all(indexed.iter().map(|info| async move {
            if page.in_category(&info.slug) {
                self.categories.patch(&info.slug, page).await.map(Some)
            } else {
                self.drop_stale_entry(&info.slug, &page.slug).await
            }
        }))
        .await;
        for (info, result) in indexed.into_iter().zip(results) {
            match result {
                Ok(Some(outcome)) => report.indexes.push((info.slug, outcome)),
                Ok(None) => {}
                Err(error) => report.fail(&format!("index {}", info.key), error),
            }
        }
    }

    /// A page that left a category still has an entry in its index until
    /// the index is rebuilt from the current member list.
    async fn drop_stale_entry(&self, category: &str, page_slug: &str) -> Result<Option<PatchOutcome>> {
        if !self.categories.lists(category, page_slug).await? {
            return Ok(None);
        }
        debug!(category, page = page_slug, "page left category, rebuilding index");
        self.categories.rebuild(category, None).await?;
        Ok(Some(PatchOutcome::Rebuilt))
    }

    async fn remove_everywhere(&self, title: &str, report: &mut SyncReport) {
        let slug = slugify(title);
        if slug.is_empty() {
            report.fail("delete", anyhow::anyhow!("title `{title}` has no usable slug"));
            return;
        }
        let on_front_page = self
            .check_front_page(FrontPageTrigger::Removed { title, slug: &slug }, report)
            .await;

        match self.delete_locally(&slug).await {
            Ok(removed) => report.removed.extend(removed),
            Err(error) => report.fail("delete", error),
        }
        report.absorb_traces("remove traces", self.traces.remove_traces(&slug).await);
        report.absorb_traces(
            "remove links",
            self.traces.rewrite_links(title, &LinkAction::Remove).await,
        );
        if on_front_page {
            self.rebuild_front_page(report).await;
        }
    }

    async fn write_redirect_stub(&self, source_slug: &str, target: &Page, report: &mut SyncReport) -> Result<()> {
        let Some(path) = self
            .index
            .locate(source_slug)?
            .into_iter()
            .find(|path| !self.layout.is_reserved(path))
        else {
            debug!(source = source_slug, "no local copy to turn into a redirect stub");
            return Ok(());
        };
        let document = self.writer.read(&path).await?;
        let notice = self.renderer.render_moved_notice(&target.title, &target.url());
        let stub = dom::insert_after_first_heading(&document, &notice, MOVED_NOTICE_CLASS)?;
        if self.writer.write(&path, &stub).await? == WriteOutcome::Written {
            report.written.push(path);
        }
        Ok(())
    }

    async fn check_front_page(&self, trigger: FrontPageTrigger<'_>, report: &mut SyncReport) -> bool {
        match self.front.should_refresh(trigger).await {
            Ok(refresh) => refresh,
            Err(error) => {
                report.fail("front page check", error);
                false
            }
        }
    }

    async fn refresh_front_page(&self, trigger: FrontPageTrigger<'_>, report: &mut SyncReport) {
        if self.check_front_page(trigger, report).await {
            self.rebuild_front_page(report).await;
        }
    }

    async fn rebuild_front_page(&self, report: &mut SyncReport) {
        match self.front.rebuild().await {
            Ok(Some(_)) => report.front_page = true,
            Ok(None) => {}
            Err(error) => report.fail("front page", error),
        }
    }

    async fn rebuild_front_page_into(&self, report: &mut BuildReport) {
        match self.front.rebuild().await {
            Ok(path) => report.front_page = path,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to rebuild front page");
                report.failed.push(format!("front page: {error:#}"));
            }
        }
    }

    async fn write_page(&self, page: &Page) -> Result<(PathBuf, WriteOutcome)> {
        let path = self.layout.page_path(&page.slug, page.category_dir.as_deref());
        if self.layout.is_reserved(&path) {
            bail!(
                "page `{}` would overwrite reserved file {}",
                page.title,
                path.display()
            );
        }
        let outcome = self.writer.write(&path, &self.renderer.render_page(page)).await?;
        Ok((self.layout.root().join(path), outcome))
    }

    async fn write_and_dedupe(&self, page: &Page, report: &mut SyncReport) {
        match self.write_page(page).await {
            Ok((path, WriteOutcome::Written)) => report.written.push(path),
            Ok((_, WriteOutcome::Unchanged)) => debug!(title = %page.title, "page unchanged"),
            Err(error) => {
                report.fail("write", error);
                return;
            }
        }
        match self.remove_duplicates(page).await {
            Ok(removed) => report.removed.extend(removed),
            Err(error) => report.fail("duplicate cleanup", error),
        }
    }

    /// Keeps exactly one file per slug: the one at the page's current path.
    async fn remove_duplicates(&self, page: &Page) -> Result<Vec<PathBuf>> {
        let canonical = self
            .layout
            .root()
            .join(self.layout.page_path(&page.slug, page.category_dir.as_deref()));
        let mut removed = Vec::new();
        for path in self.index.locate(&page.slug)? {
            if path == canonical || self.layout.is_reserved(&path) {
                continue;
            }
            if self.writer.remove(&path).await? {
                info!(path = %path.display(), "removed duplicate page file");
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

/// Files under `root`, relative to it, in walk order.
fn list_asset_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escapes {}", entry.path().display(), root.display()))?;
        files.push(relative.to_path_buf());
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogParams;
    use crate::testing::{MockWiki, test_config};
    use serde_json::Value;
    use std::fs;
    use tempfile::{TempDir, tempdir};
    use walkdir::WalkDir;

    struct Fixture {
        temp: TempDir,
        wiki: Arc<MockWiki>,
        engine: SyncEngine,
    }

    impl Fixture {
        fn new(nested: bool) -> Self {
            let temp = tempdir().expect("tempdir");
            let mut config = test_config();
            config.mirror.nested_categories = nested;
            let config = Arc::new(config);
            let wiki = Arc::new(MockWiki::default());
            let engine = SyncEngine::new(
                config.clone(),
                temp.path(),
                wiki.clone(),
                Arc::new(DefaultTransformer::from_config(&config).expect("transformer")),
                Arc::new(HtmlRenderer::from_config(&config)),
                ContentSearch::Builtin,
            );
            Self { temp, wiki, engine }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.temp.path().join(relative)
        }

        fn read(&self, relative: &str) -> String {
            fs::read_to_string(self.path(relative)).expect("read mirror file")
        }

        fn html_files(&self) -> Vec<PathBuf> {
            WalkDir::new(self.temp.path())
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("html"))
                .collect()
        }
    }

    fn event_page(date: &str, body: &str) -> String {
        format!("<table><tr><th>Date</th><td>Date::{date}</td></tr></table><p>{body}</p>")
    }

    fn move_event(source: &str, target: &str, noredir: &str) -> ChangeEvent {
        ChangeEvent {
            title: source.to_string(),
            namespace: 0,
            kind: "log".to_string(),
            log_type: Some("move".to_string()),
            log_action: Some("move".to_string()),
            log_params: Some(LogParams {
                target: Some(target.to_string()),
                noredir: Some(Value::String(noredir.to_string())),
            }),
        }
    }

    fn delete_event(title: &str) -> ChangeEvent {
        ChangeEvent {
            title: title.to_string(),
            namespace: 0,
            kind: "log".to_string(),
            log_type: Some("delete".to_string()),
            log_action: Some("delete".to_string()),
            log_params: None,
        }
    }

    #[tokio::test]
    async fn edit_writes_page_and_patches_event_index() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.wiki.put_page("Workshop B", &event_page("2030/06/01", "Other"), &["Event"], &[]);

        let report = fixture.engine.handle_event(&ChangeEvent::edit("Workshop A")).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.outcome, SyncOutcome::Updated);
        assert!(fixture.path("workshop-a.html").is_file());
        assert!(fixture.read("events.html").contains("<li id=\"workshop-a\" class=\"entry\">"));
        assert!(!fixture.path("index.html").exists());

        fixture.wiki.put_page("Workshop A", &event_page("2030/05/09", "Intro"), &["Event"], &[]);
        let report = fixture.engine.handle_event(&ChangeEvent::edit("Workshop A")).await;
        assert_eq!(report.indexes, vec![("event".to_string(), PatchOutcome::Patched)]);
        let index = fixture.read("events.html");
        assert!(index.contains("<span class=\"date\">2030/05/09</span>"));
        assert!(index.contains("<li id=\"workshop-b\" class=\"entry\">"));
    }

    #[tokio::test]
    async fn move_without_redirect_replaces_source() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Old Name", &event_page("2030/05/01", "Talk"), &["Event"], &[]);
        fixture.wiki.put_page(
            "Linker",
            "<p>See <a href=\"https://wiki.example.org/Old_Name\">the talk</a>.</p>",
            &[],
            &[],
        );
        fixture.engine.sync_title("Old Name").await;
        fixture.engine.sync_title("Linker").await;
        assert!(fixture.read("linker.html").contains("href=\"/old-name\""));

        fixture.wiki.remove_page("Old Name");
        fixture.wiki.put_page("New Name", &event_page("2030/05/01", "Talk"), &["Event"], &["Linker"]);
        let report = fixture
            .engine
            .handle_event(&move_event("Old Name", "New Name", "1"))
            .await;

        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.outcome, SyncOutcome::Moved);
        assert!(!fixture.path("old-name.html").exists());
        assert!(fixture.path("new-name.html").is_file());
        let index = fixture.read("events.html");
        assert!(index.contains("id=\"new-name\""));
        assert!(!index.contains("old-name"));
        let linker = fixture.read("linker.html");
        assert!(linker.contains("href=\"/new-name\""));
        assert!(!linker.contains("old-name"));
        assert!(!fixture.read("new-name.html").contains(MOVED_NOTICE_CLASS));
    }

    #[tokio::test]
    async fn move_with_redirect_leaves_single_link_stub() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Old Name", "<p>Original</p>", &["Tools"], &[]);
        fixture.engine.sync_title("Old Name").await;

        fixture.wiki.remove_page("Old Name");
        fixture.wiki.put_page("New Name", "<p>Original</p>", &["Tools"], &[]);
        fixture.wiki.put_redirect("Old Name", "New Name");
        let report = fixture
            .engine
            .handle_event(&move_event("Old Name", "New Name", "0"))
            .await;
        assert!(report.is_clean(), "{:?}", report.errors);

        let stub = fixture.read("old-name.html");
        assert_eq!(stub.matches("href=\"/new-name\"").count(), 1);
        assert_eq!(stub.matches(MOVED_NOTICE_CLASS).count(), 1);
        assert!(fixture.read("new-name.html").contains("<h1>New Name</h1>"));

        fixture
            .engine
            .handle_event(&move_event("Old Name", "New Name", "0"))
            .await;
        assert_eq!(fixture.read("old-name.html").matches("href=\"/new-name\"").count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_file_entries_and_links() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &["Linker"]);
        fixture.wiki.put_page("Workshop B", &event_page("2030/06/01", "Other"), &["Event"], &[]);
        fixture.wiki.put_page(
            "Linker",
            "<ul><li><a href=\"https://wiki.example.org/Workshop_A\">Workshop A</a></li></ul><p>Also <a href=\"/index.php?title=Workshop_A\">here</a>.</p>",
            &[],
            &[],
        );
        for title in ["Workshop A", "Workshop B", "Linker"] {
            assert!(fixture.engine.sync_title(title).await.is_clean());
        }

        fixture.wiki.remove_page("Workshop A");
        let report = fixture.engine.handle_event(&delete_event("Workshop A")).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.outcome, SyncOutcome::Removed);

        assert!(!fixture.path("workshop-a.html").exists());
        let index = fixture.read("events.html");
        assert!(!index.contains("id=\"workshop-a\""));
        assert!(index.contains("id=\"workshop-b\""));
        for path in fixture.html_files() {
            let html = fs::read_to_string(&path).expect("read");
            assert!(!html.contains("href=\"/workshop-a\""), "{} still links", path.display());
        }
    }

    #[tokio::test]
    async fn edit_of_page_gone_upstream_deletes_locally() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.engine.sync_title("Workshop A").await;

        fixture.wiki.remove_page("Workshop A");
        let report = fixture.engine.handle_event(&ChangeEvent::edit("Workshop A")).await;
        assert_eq!(report.outcome, SyncOutcome::Removed);
        assert!(!fixture.path("workshop-a.html").exists());
        assert!(!fixture.read("events.html").contains("id=\"workshop-a\""));
    }

    #[tokio::test]
    async fn fetch_failure_keeps_mirror_intact() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.engine.sync_title("Workshop A").await;
        let before = fixture.read("workshop-a.html");

        fixture.wiki.fail_on("Workshop A");
        let report = fixture.engine.handle_event(&ChangeEvent::edit("Workshop A")).await;
        assert!(!report.is_clean());
        assert!(report.removed.is_empty());
        assert_eq!(fixture.read("workshop-a.html"), before);

        fixture.wiki.recover("Workshop A");
        assert!(fixture.engine.sync_title("Workshop A").await.is_clean());
    }

    #[tokio::test]
    async fn category_change_keeps_one_file_per_page() {
        let fixture = Fixture::new(true);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.engine.sync_title("Workshop A").await;
        assert!(fixture.path("events/workshop-a.html").is_file());

        fixture.wiki.put_page("Workshop A", "<p>Now a tool</p>", &["Tools"], &[]);
        let report = fixture.engine.sync_title("Workshop A").await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.removed, vec![fixture.path("events/workshop-a.html")]);

        let copies = fixture
            .html_files()
            .into_iter()
            .filter(|path| path.file_name().and_then(|name| name.to_str()) == Some("workshop-a.html"))
            .collect::<Vec<_>>();
        assert_eq!(copies, vec![fixture.path("tools/workshop-a.html")]);
        assert!(!fixture.read("events.html").contains("id=\"workshop-a\""));
        assert!(fixture.read("tools.html").contains("id=\"workshop-a\""));
    }

    #[tokio::test]
    async fn repeated_sync_is_byte_identical() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &["Linker"]);
        fixture.engine.sync_title("Workshop A").await;
        let page = fixture.read("workshop-a.html");
        let index = fixture.read("events.html");

        let report = fixture.engine.sync_title("Workshop A").await;
        assert!(report.written.is_empty());
        assert_eq!(fixture.read("workshop-a.html"), page);
        assert_eq!(fixture.read("events.html"), index);
    }

    #[tokio::test]
    async fn highlight_edit_refreshes_front_page() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Main Page", "<p>Welcome</p>", &[], &[]);
        fixture.wiki.put_page("Showcase", "<p>Look</p>", &["Highlight"], &[]);

        let report = fixture.engine.sync_title("Showcase").await;
        assert!(report.front_page);
        assert!(fixture.read("index.html").contains("id=\"showcase\""));

        fixture.wiki.remove_page("Showcase");
        let report = fixture.engine.handle_event(&delete_event("Showcase")).await;
        assert!(report.front_page);
        assert!(!fixture.read("index.html").contains("showcase"));
        assert!(fixture.path("index.html").is_file());
    }

    #[tokio::test]
    async fn filtered_and_unknown_events_change_nothing() {
        let fixture = Fixture::new(false);
        let mut special = ChangeEvent::edit("Special:RecentChanges");
        special.namespace = -1;
        let report = fixture.engine.handle_event(&special).await;
        assert!(matches!(report.outcome, SyncOutcome::Ignored(_)));

        let mut unknown = ChangeEvent::edit("Workshop A");
        unknown.kind = "categorize".to_string();
        let report = fixture.engine.handle_event(&unknown).await;
        assert!(matches!(report.outcome, SyncOutcome::Ignored(_)));
        assert!(fixture.html_files().is_empty());
        assert_eq!(fixture.engine.request_count(), 0);
    }

    #[tokio::test]
    async fn rebuild_all_writes_pages_indexes_and_front_page() {
        let assets = tempdir().expect("assets tempdir");
        let static_dir = assets.path().join("static");
        fs::create_dir_all(static_dir.join("fonts")).expect("create assets");
        fs::write(static_dir.join("style.css"), "body { margin: 0 }").expect("write css");
        fs::write(static_dir.join("fonts").join("mono.woff2"), [0u8, 159, 146, 150]).expect("write font");

        let mut fixture = Fixture::new(false);
        fixture.engine = fixture.engine.with_assets_dir(Some(static_dir));
        fixture.wiki.put_page("Main Page", "<p>Welcome</p>", &[], &[]);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.wiki.put_page("Hammer", "<p>Tool</p>", &["Tools"], &[]);
        fixture.wiki.put_page("Hammer/fr", "<p>Outil</p>", &["Tools"], &[]);
        fixture.wiki.put_page("Broken", "<p>x</p>", &["Tools"], &[]);
        fixture.wiki.fail_on("Broken");

        let report = fixture.engine.rebuild_all().await.expect("rebuild");
        assert_eq!(report.written, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.succeeded());
        assert_eq!(
            report.indexes,
            vec![fixture.path("events.html"), fixture.path("tools.html")]
        );
        assert_eq!(report.front_page, Some(fixture.path("index.html")));
        assert!(fixture.read("index.html").contains("id=\"workshop-a\""));
        assert!(!fixture.path("hammer-fr.html").exists());
        assert_eq!(report.assets, 2);
        assert_eq!(fixture.read("static/style.css"), "body { margin: 0 }");
        assert_eq!(
            fs::read(fixture.path("static/fonts/mono.woff2")).expect("read font"),
            vec![0u8, 159, 146, 150]
        );

        let again = fixture.engine.rebuild_all().await.expect("rebuild again");
        assert_eq!(again.written, 0);
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.assets, 0);
    }

    const EVENTS_NAV_LINK: &str = "<a href=\"/events.html\">Events</a>";

    #[tokio::test]
    async fn deleting_a_page_named_like_an_index_keeps_navigation() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.engine.sync_title("Workshop A").await;
        assert!(fixture.read("workshop-a.html").contains(EVENTS_NAV_LINK));

        let report = fixture.engine.handle_event(&delete_event("Events")).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(report.removed.is_empty());
        assert!(fixture.read("workshop-a.html").contains(EVENTS_NAV_LINK));
        let index = fixture.read("events.html");
        assert!(index.contains(EVENTS_NAV_LINK));
        assert!(index.contains("id=\"workshop-a\""));
    }

    #[tokio::test]
    async fn moving_a_page_named_like_an_index_keeps_navigation() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.wiki.put_page(
            "Linker",
            "<p>See <a href=\"https://wiki.example.org/Events\">the calendar</a>.</p>",
            &[],
            &[],
        );
        fixture.engine.sync_title("Workshop A").await;
        fixture.engine.sync_title("Linker").await;
        assert!(fixture.read("linker.html").contains("href=\"/events\""));

        fixture.wiki.put_page("Gatherings", "<p>Calendar</p>", &[], &["Linker"]);
        let report = fixture
            .engine
            .handle_event(&move_event("Events", "Gatherings", "1"))
            .await;

        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(fixture.path("gatherings.html").is_file());
        assert!(fixture.path("events.html").is_file());
        assert!(fixture.read("workshop-a.html").contains(EVENTS_NAV_LINK));
        let linker = fixture.read("linker.html");
        assert!(linker.contains(EVENTS_NAV_LINK));
        assert!(linker.contains("href=\"/gatherings\""));
        assert!(!linker.contains("href=\"/events\""));
    }

    #[tokio::test]
    async fn translation_snippet_edit_leaves_category_index_alone() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Guide", "<p>Guide</p>", &["Tools"], &[]);
        fixture.wiki.put_page("Guide/fr", "<p>Le guide</p>", &["Tools"], &[]);
        fixture.engine.sync_title("Guide").await;
        assert!(fixture.read("tools.html").contains("id=\"guide\""));

        let report = fixture.engine.handle_event(&ChangeEvent::edit("Guide/1/fr")).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(report.indexes.is_empty());
        let index = fixture.read("tools.html");
        assert!(index.contains("id=\"guide\""));
        assert!(!index.contains("guide-fr"));
    }

    #[tokio::test]
    async fn delete_cleans_misnested_linking_page() {
        let fixture = Fixture::new(false);
        fixture.wiki.put_page("Workshop A", &event_page("2030/05/01", "Intro"), &["Event"], &[]);
        fixture.engine.sync_title("Workshop A").await;
        fs::write(
            fixture.path("linker.html"),
            "<html><body><nav>\n<a href=\"/\">Home</a>\n</nav>\
             <p><a href=\"/intro\">x<p>y</a> <a href=\"/workshop-a\">W</a></p></body></html>",
        )
        .expect("write linker");

        fixture.wiki.remove_page("Workshop A");
        let report = fixture.engine.handle_event(&delete_event("Workshop A")).await;

        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(!fixture.path("workshop-a.html").exists());
        let linker = fixture.read("linker.html");
        assert!(!linker.contains("href=\"/workshop-a\""));
        assert!(linker.contains("<a href=\"/intro\">x<p>y</a>"));
        assert!(!fixture.read("events.html").contains("workshop-a"));

        let again = fixture.engine.handle_event(&delete_event("Workshop A")).await;
        assert!(again.is_clean(), "{:?}", again.errors);
        assert!(again.traces.is_empty());
    }

    #[tokio::test]
    async fn rebuild_category_rejects_unknown_names() {
        let fixture = Fixture::new(false);
        assert!(fixture.engine.rebuild_category("Nonsense").await.is_err());

        fixture.wiki.put_page("Hammer", "<p>Tool</p>", &["Tools"], &[]);
        let report = fixture.engine.rebuild_category("Tools").await.expect("rebuild");
        assert_eq!(report.written, 1);
        assert_eq!(report.indexes, vec![fixture.path("tools.html")]);
    }
}
