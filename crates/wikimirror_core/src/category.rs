use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{debug, info, instrument};

use crate::config::{CategoryInfo, MirrorConfig};
use crate::dom;
use crate::fsindex::MirrorLayout;
use crate::materialize::{Materializer, Page};
use crate::render::Renderer;
use crate::title::{is_syncable_title, is_translation_facet, slugify};
use crate::writer::MirrorWriter;

const DATE_FORMAT: &str = "%Y/%m/%d";
const TIME_FORMAT: &str = "%H:%M";

/// How a category's members are partitioned and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryStrategy {
    Events,
    Tools,
    Collaborators,
    Publishing,
    Generic,
}

const STRATEGIES: [(&str, CategoryStrategy); 8] = [
    ("event", CategoryStrategy::Events),
    ("events", CategoryStrategy::Events),
    ("tool", CategoryStrategy::Tools),
    ("tools", CategoryStrategy::Tools),
    ("collaborator", CategoryStrategy::Collaborators),
    ("collaborators", CategoryStrategy::Collaborators),
    ("publication", CategoryStrategy::Publishing),
    ("publishing", CategoryStrategy::Publishing),
];

impl CategoryStrategy {
    /// Matched on the category slug or its label slug; anything else is generic.
    pub fn for_category(info: &CategoryInfo) -> Self {
        STRATEGIES
            .iter()
            .find(|(name, _)| *name == info.slug || *name == info.label_slug)
            .map(|(_, strategy)| *strategy)
            .unwrap_or(Self::Generic)
    }

    pub fn entry(self, page: Page) -> IndexEntry {
        let window = match self {
            Self::Events => EventWindow::from_info(&page.metadata.info),
            _ => None,
        };
        IndexEntry {
            page,
            strategy: self,
            window,
        }
    }

    pub fn shape(self, pages: Vec<Page>, now: NaiveDateTime) -> Vec<IndexSection> {
        let mut entries = pages
            .into_iter()
            .map(|page| self.entry(page))
            .collect::<Vec<_>>();
        match self {
            Self::Events => shape_events(entries, now),
            Self::Tools | Self::Collaborators => {
                entries.sort_by(|left, right| {
                    left.page
                        .title
                        .to_lowercase()
                        .cmp(&right.page.title.to_lowercase())
                        .then_with(|| left.page.slug.cmp(&right.page.slug))
                });
                vec![IndexSection::all(entries)]
            }
            Self::Publishing | Self::Generic => {
                entries.sort_by(|left, right| {
                    right
                        .page
                        .metadata
                        .created_at
                        .cmp(&left.page.metadata.created_at)
                        .then_with(|| left.page.slug.cmp(&right.page.slug))
                });
                vec![IndexSection::all(entries)]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Upcoming,
    Happening,
    Past,
}

/// When an event runs, from `Date` (`YYYY/MM/DD[-YYYY/MM/DD]`) and
/// `Time` (`HH:MM[-HH:MM]`) info fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl EventWindow {
    pub fn parse(date: &str, time: Option<&str>) -> Option<Self> {
        let (first_day, last_day) = split_range(date);
        let start_date = parse_date(first_day)?;
        let end_date = last_day
            .and_then(parse_date)
            .filter(|end| *end >= start_date)
            .unwrap_or(start_date);

        let (first_time, last_time) = time.map(split_range).unwrap_or(("", None));
        let start = start_date.and_time(parse_time(first_time).unwrap_or(NaiveTime::MIN));
        let end = end_date.and_time(last_time.and_then(parse_time).unwrap_or_else(end_of_day));
        let end = if end < start {
            start_date.and_time(end_of_day())
        } else {
            end
        };
        Some(Self { start, end })
    }

    pub fn from_info(info: &BTreeMap<String, String>) -> Option<Self> {
        Self::parse(info.get("date")?, info.get("time").map(String::as_str))
    }

    pub fn phase(&self, now: NaiveDateTime) -> EventPhase {
        if now < self.start {
            EventPhase::Upcoming
        } else if now <= self.end {
            EventPhase::Happening
        } else {
            EventPhase::Past
        }
    }
}

fn split_range(value: &str) -> (&str, Option<&str>) {
    match value.split_once('-') {
        Some((first, last)) => (first.trim(), Some(last.trim()).filter(|last| !last.is_empty())),
        None => (value.trim(), None),
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).ok()
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

fn shape_events(entries: Vec<IndexEntry>, now: NaiveDateTime) -> Vec<IndexSection> {
    let mut upcoming = Vec::new();
    let mut happening = Vec::new();
    let mut past = Vec::new();
    let mut undated = Vec::new();
    for entry in entries {
        match entry.window.map(|window| window.phase(now)) {
            Some(EventPhase::Upcoming) => upcoming.push(entry),
            Some(EventPhase::Happening) => happening.push(entry),
            Some(EventPhase::Past) => past.push(entry),
            None => undated.push(entry),
        }
    }

    let newest_first = |left: &IndexEntry, right: &IndexEntry| {
        let start = |entry: &IndexEntry| entry.window.map(|window| window.start);
        start(right)
            .cmp(&start(left))
            .then_with(|| left.page.slug.cmp(&right.page.slug))
    };
    for group in [&mut upcoming, &mut happening, &mut past, &mut undated] {
        group.sort_by(newest_first);
    }

    [
        ("upcoming", "Upcoming", upcoming),
        ("happening", "Happening now", happening),
        ("past", "Past", past),
        ("undated", "Undated", undated),
    ]
    .into_iter()
    .filter(|(_, _, entries)| !entries.is_empty())
    .map(|(key, heading, entries)| IndexSection {
        key,
        heading: Some(heading),
        entries,
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub page: Page,
    pub strategy: CategoryStrategy,
    pub window: Option<EventWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSection {
    pub key: &'static str,
    pub heading: Option<&'static str>,
    pub entries: Vec<IndexEntry>,
}

impl IndexSection {
    fn all(entries: Vec<IndexEntry>) -> Self {
        Self {
            key: "all",
            heading: None,
            entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryIndex {
    pub info: CategoryInfo,
    pub strategy: CategoryStrategy,
    pub sections: Vec<IndexSection>,
}

impl CategoryIndex {
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.sections.iter().flat_map(|section| section.entries.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The member's list item was swapped in place.
    Patched,
    /// No index on disk yet, or the page was new to it.
    Rebuilt,
    /// The category has no index page.
    NotIndexed,
}

/// Builds category index pages, either wholesale or by swapping one entry.
///
/// `patch` may fall back to `rebuild`; `rebuild` never patches.
pub struct CategoryIndexBuilder {
    config: Arc<MirrorConfig>,
    materializer: Arc<Materializer>,
    renderer: Arc<dyn Renderer>,
    layout: MirrorLayout,
    writer: MirrorWriter,
}

impl CategoryIndexBuilder {
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

    /// Materializes every upstream member of an indexed category. `known`
    /// is used as-is instead of being fetched again, and is listed even when
    /// the upstream member list has not caught up with it yet.
    #[instrument(skip(self, known))]
    pub async fn build(&self, slug: &str, known: Option<&Page>) -> Result<Option<CategoryIndex>> {
        let Some(info) = self.config.indexed_category(slug) else {
            return Ok(None);
        };
        let members = self
            .materializer
            .source()
            .fetch_category_members(&info.key)
            .await
            .with_context(|| format!("failed to list members of category `{}`", info.key))?;

        let langs = &self.config.translations.langs;
        let excluded = &self.config.filters.excluded_prefixes;
        let mut titles = Vec::new();
        for member in members {
            if is_translation_facet(&member.title, langs)
                || !is_syncable_title(&member.title, 0, excluded)
                || known.is_some_and(|page| page.slug == slugify(&member.title))
                || titles.contains(&member.title)
            {
                continue;
            }
            titles.push(member.title);
        }

        let batch = self.materializer.materialize_many(&titles).await;
        let mut pages = batch.pages;
        if let Some(page) =
            known.filter(|page| page.in_category(&info.slug) && !is_translation_facet(&page.title, langs))
        {
            pages.push(page.clone());
        }
        debug!(category = %info.key, members = pages.len(), failed = batch.failed.len(), "category members materialized");
        Ok(Some(self.shape(info, pages)))
    }

    /// Shapes already materialized pages into an index without fetching.
    pub fn shape(&self, info: CategoryInfo, pages: Vec<Page>) -> CategoryIndex {
        let mut seen = BTreeSet::new();
        let pages = pages
            .into_iter()
            .filter(|page| seen.insert(page.slug.clone()))
            .collect();
        let strategy = CategoryStrategy::for_category(&info);
        CategoryIndex {
            sections: strategy.shape(pages, Local::now().naive_local()),
            strategy,
            info,
        }
    }

    pub async fn write_index(&self, index: &CategoryIndex) -> Result<PathBuf> {
        let path = self.layout.index_path(&index.info.label_slug);
        let document = self.renderer.render_category_index(index);
        self.writer.write(&path, &document).await?;
        Ok(self.writer.absolute(&path))
    }

    /// Full build and overwrite. `Ok(None)` for categories without an index.
    pub async fn rebuild(&self, slug: &str, known: Option<&Page>) -> Result<Option<PathBuf>> {
        let Some(index) = self.build(slug, known).await? else {
            return Ok(None);
        };
        let path = self.write_index(&index).await?;
        info!(category = %index.info.key, path = %path.display(), "category index rebuilt");
        Ok(Some(path))
    }

    /// Patches on hit, rebuilds on miss or when the index file is absent.
    #[instrument(skip(self, page), fields(page = %page.slug))]
    pub async fn patch(&self, slug: &str, page: &Page) -> Result<PatchOutcome> {
        let Some(info) = self.config.indexed_category(slug) else {
            return Ok(PatchOutcome::NotIndexed);
        };
        let path = self.layout.index_path(&info.label_slug);
        if !self.writer.absolute(&path).is_file() {
            debug!(path = %path.display(), "no index on disk, rebuilding");
            self.rebuild(slug, Some(page)).await?;
            return Ok(PatchOutcome::Rebuilt);
        }

        let existing = self.writer.read(&path).await?;
        let entry = CategoryStrategy::for_category(&info).entry(page.clone());
        let snippet = self.renderer.render_index_entry(&entry);
        match dom::replace_node_by_id(&existing, &page.slug, &snippet)? {
            Some(patched) => {
                self.writer.write(&path, &patched).await?;
                debug!(path = %path.display(), "index entry patched");
                Ok(PatchOutcome::Patched)
            }
            None => {
                self.rebuild(slug, Some(page)).await?;
                Ok(PatchOutcome::Rebuilt)
            }
        }
    }

    /// Whether the on-disk index of `slug` lists `page_slug`.
    pub async fn lists(&self, slug: &str, page_slug: &str) -> Result<bool> {
        let Some(info) = self.config.indexed_category(slug) else {
            return Ok(false);
        };
        let path = self.layout.index_path(&info.label_slug);
        if !self.writer.absolute(&path).is_file() {
            return Ok(false);
        }
        dom::contains_id(&self.writer.read(&path).await?, page_slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::HtmlRenderer;
    use crate::testing::{MockWiki, test_config, test_materializer};
    use tempfile::tempdir;

    fn at(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M").expect("timestamp")
    }

    fn event(title: &str, date: &str, time: Option<&str>) -> Page {
        let mut info = BTreeMap::new();
        info.insert("date".to_string(), date.to_string());
        if let Some(time) = time {
            info.insert("time".to_string(), time.to_string());
        }
        Page {
            title: title.to_string(),
            slug: slugify(title),
            categories: vec!["event".to_string()],
            category_dir: Some("events".to_string()),
            html: String::new(),
            metadata: crate::materialize::PageMetadata {
                info,
                ..Default::default()
            },
        }
    }

    fn builder(root: &std::path::Path, wiki: Arc<MockWiki>) -> CategoryIndexBuilder {
        let config = Arc::new(test_config());
        CategoryIndexBuilder::new(
            config.clone(),
            Arc::new(test_materializer(config.clone(), wiki)),
            Arc::new(HtmlRenderer::from_config(&config)),
            MirrorLayout::new(root, &config),
            MirrorWriter::new(root, Some(4)),
        )
    }

    #[test]
    fn event_window_parses_ranges() {
        let window = EventWindow::parse("2024/05/01-2024/05/03", Some("9:30-18:00")).expect("window");
        assert_eq!(window.start, at("2024-05-01 09:30"));
        assert_eq!(window.end, at("2024-05-03 18:00"));

        let single = EventWindow::parse("2024/05/01", None).expect("single day");
        assert_eq!(single.start, at("2024-05-01 00:00"));
        assert_eq!(single.end.date(), single.start.date());

        assert!(EventWindow::parse("sometime in May", None).is_none());
    }

    #[test]
    fn event_phase_follows_clock() {
        let window = EventWindow::parse("2024/05/01", Some("10:00-12:00")).expect("window");
        assert_eq!(window.phase(at("2024-04-30 23:00")), EventPhase::Upcoming);
        assert_eq!(window.phase(at("2024-05-01 11:00")), EventPhase::Happening);
        assert_eq!(window.phase(at("2024-05-01 12:01")), EventPhase::Past);
    }

    #[test]
    fn events_partition_and_sort_newest_first() {
        let pages = vec![
            event("Old Talk", "2023/01/10", None),
            event("Older Talk", "2022/01/10", None),
            event("Workshop A", "2024/06/01", None),
            event("Workshop B", "2024/07/01", None),
            event("Today", "2024/05/01", None),
            event("Someday", "tbd", None),
        ];
        let sections = CategoryStrategy::Events.shape(pages, at("2024-05-01 12:00"));
        let listed = sections
            .iter()
            .map(|section| {
                (
                    section.key,
                    section
                        .entries
                        .iter()
                        .map(|entry| entry.page.slug.as_str())
                        .collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            listed,
            vec![
                ("upcoming", vec!["workshop-b", "workshop-a"]),
                ("happening", vec!["today"]),
                ("past", vec!["old-talk", "older-talk"]),
                ("undated", vec!["someday"]),
            ]
        );
    }

    #[test]
    fn generic_sorts_by_creation_descending() {
        let mut first = event("First", "", None);
        first.metadata.created_at = Some("2020-01-01T00:00:00Z".to_string());
        let mut second = event("Second", "", None);
        second.metadata.created_at = Some("2021-01-01T00:00:00Z".to_string());
        let sections = CategoryStrategy::Generic.shape(vec![first, second], at("2024-01-01 00:00"));
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].entries[0].page.slug, "second");
    }

    #[test]
    fn strategy_is_selected_by_label() {
        let config = test_config();
        let strategy = |slug: &str| CategoryStrategy::for_category(&config.category(slug).expect("category"));
        assert_eq!(strategy("event"), CategoryStrategy::Events);
        assert_eq!(strategy("tools"), CategoryStrategy::Tools);
        assert_eq!(strategy("article"), CategoryStrategy::Generic);
    }

    #[tokio::test]
    async fn patch_rebuilds_when_index_missing_then_patches_in_place() {
        let temp = tempdir().expect("tempdir");
        let wiki = Arc::new(MockWiki::default());
        wiki.put_page("Workshop A", "<table><tr><th>Date</th><td>Date::2030/05/01</td></tr></table><p>A</p>", &["Event"], &[]);
        wiki.put_page("Workshop B", "<table><tr><th>Date</th><td>Date::2030/06/01</td></tr></table><p>B</p>", &["Event"], &[]);
        let builder = builder(temp.path(), wiki.clone());
        let materializer = test_materializer(Arc::new(test_config()), wiki.clone());

        let page = materializer.materialize("Workshop A").await.expect("ok").expect("page");
        assert_eq!(builder.patch("event", &page).await.expect("patch"), PatchOutcome::Rebuilt);
        let before = std::fs::read_to_string(temp.path().join("events.html")).expect("index");
        assert!(before.contains("id=\"workshop-a\""));
        assert!(before.contains("id=\"workshop-b\""));

        wiki.put_page("Workshop A", "<table><tr><th>Date</th><td>Date::2030/05/02</td></tr></table><p>A</p>", &["Event"], &[]);
        let page = materializer.materialize("Workshop A").await.expect("ok").expect("page");
        assert_eq!(builder.patch("event", &page).await.expect("patch"), PatchOutcome::Patched);
        let after = std::fs::read_to_string(temp.path().join("events.html")).expect("index");

        let changed = before
            .lines()
            .zip(after.lines())
            .filter(|(old, new)| old != new)
            .collect::<Vec<_>>();
        assert_eq!(before.lines().count(), after.lines().count());
        assert_eq!(changed.len(), 1);
        assert!(changed[0].1.contains("2030/05/02"));
        assert!(changed[0].1.starts_with("<li id=\"workshop-a\""));
    }

    #[tokio::test]
    async fn patch_rebuilds_for_new_member_and_skips_unindexed() {
        let temp = tempdir().expect("tempdir");
        let wiki = Arc::new(MockWiki::default());
        wiki.put_page("Workshop A", "<p>A</p>", &["Event"], &[]);
        let builder = builder(temp.path(), wiki.clone());
        builder.rebuild("event", None).await.expect("rebuild");

        wiki.put_page("Workshop C", "<p>C</p>", &["Event"], &[]);
        let materializer = test_materializer(Arc::new(test_config()), wiki.clone());
        let page = materializer.materialize("Workshop C").await.expect("ok").expect("page");
        assert_eq!(builder.patch("event", &page).await.expect("patch"), PatchOutcome::Rebuilt);
        assert!(builder.lists("event", "workshop-c").await.expect("lists"));
        assert!(builder.lists("event", "workshop-a").await.expect("lists"));

        assert_eq!(builder.patch("highlight", &page).await.expect("patch"), PatchOutcome::NotIndexed);
    }

    #[tokio::test]
    async fn build_skips_translation_facets() {
        let temp = tempdir().expect("tempdir");
        let wiki = Arc::new(MockWiki::default());
        wiki.put_page("Guide", "<p>en</p>", &["Tools"], &[]);
        wiki.put_page("Guide/fr", "<p>fr</p>", &["Tools"], &[]);
        let builder = builder(temp.path(), wiki.clone());
        let index = builder
            .build("tools", None)
            .await
            .expect("build")
            .expect("indexed");
        let slugs = index.entries().map(|entry| entry.page.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, ["guide"]);

        let facet = test_materializer(Arc::new(test_config()), wiki)
            .materialize("Guide/fr")
            .await
            .expect("ok")
            .expect("page");
        let index = builder
            .build("tools", Some(&facet))
            .await
            .expect("build")
            .expect("indexed");
        let slugs = index.entries().map(|entry| entry.page.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, ["guide"]);
    }
}
