use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{MirrorConfig, SearchBackend};

pub const FRONT_PAGE_FILE: &str = "index.html";
const HTML_EXTENSION: &str = "html";

/// Where each kind of generated file lives under the mirror root.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    root: PathBuf,
    nested: bool,
    reserved: BTreeSet<String>,
}

impl MirrorLayout {
    pub fn new(root: impl Into<PathBuf>, config: &MirrorConfig) -> Self {
        let mut reserved = config
            .category_infos()
            .into_iter()
            .filter(|info| info.index)
            .map(|info| format!("{}.{HTML_EXTENSION}", info.label_slug))
            .collect::<BTreeSet<_>>();
        reserved.insert(FRONT_PAGE_FILE.to_string());
        Self {
            root: root.into(),
            nested: config.mirror.nested_categories,
            reserved,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path of an article. Nested layouts put it under its
    /// category directory.
    pub fn page_path(&self, slug: &str, category_dir: Option<&str>) -> PathBuf {
        let file = format!("{slug}.{HTML_EXTENSION}");
        match category_dir {
            Some(dir) if self.nested && !dir.is_empty() => Path::new(dir).join(file),
            _ => PathBuf::from(file),
        }
    }

    pub fn index_path(&self, label_slug: &str) -> PathBuf {
        PathBuf::from(format!("{label_slug}.{HTML_EXTENSION}"))
    }

    pub fn front_page_path(&self) -> PathBuf {
        PathBuf::from(FRONT_PAGE_FILE)
    }

    /// Category indexes and the front page at the mirror root.
    pub fn is_reserved(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(first), None) => self
                .reserved
                .contains(first.as_os_str().to_string_lossy().as_ref()),
            _ => false,
        }
    }
}

/// Full-text search backend used to find files that mention a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSearch {
    Ripgrep { program: PathBuf },
    Builtin,
}

impl ContentSearch {
    /// Resolves the configured backend. A missing `rg` is a configuration
    /// error; switching to the builtin scan has to be asked for explicitly.
    pub fn detect(backend: SearchBackend) -> Result<Self> {
        match backend {
            SearchBackend::Builtin => Ok(Self::Builtin),
            SearchBackend::Ripgrep => {
                let Some(program) = find_on_path("rg") else {
                    bail!(
                        "ripgrep (`rg`) is required for backlink tracing but was not found on PATH\nInstall ripgrep, or set [mirror].search = \"builtin\" to scan files without it"
                    );
                };
                Ok(Self::Ripgrep { program })
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ripgrep { .. } => "ripgrep",
            Self::Builtin => "builtin",
        }
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .flat_map(|dir| [dir.join(program), dir.join(format!("{program}.exe"))])
        .find(|candidate| candidate.is_file())
}

/// Lookup structure over the mirror tree. The filesystem is the only store.
#[derive(Debug, Clone)]
pub struct MirrorIndex {
    root: PathBuf,
    search: ContentSearch,
}

impl MirrorIndex {
    pub fn new(root: impl Into<PathBuf>, search: ContentSearch) -> Self {
        Self {
            root: root.into(),
            search,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every `<slug>.html` anywhere under the root, shallowest first.
    /// More than one hit means the page is duplicated across directories.
    pub fn locate(&self, slug: &str) -> Result<Vec<PathBuf>> {
        if slug.is_empty() || !self.root.exists() {
            return Ok(Vec::new());
        }
        let wanted = format!("{slug}.{HTML_EXTENSION}");
        let mut matches = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry
                .with_context(|| format!("failed to walk {}", self.root.display()))?;
            if entry.file_type().is_file() && entry.file_name().to_string_lossy() == wanted {
                matches.push(entry.into_path());
            }
        }
        matches.sort_by(|left, right| {
            left.components()
                .count()
                .cmp(&right.components().count())
                .then_with(|| left.cmp(right))
        });
        if matches.len() > 1 {
            warn!(slug = %slug, count = matches.len(), "page exists more than once in the mirror");
        }
        Ok(matches)
    }

    /// Every HTML file whose body contains `pattern` literally.
    pub async fn find_by_content(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        if pattern.is_empty() || !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut found = match &self.search {
            ContentSearch::Ripgrep { program } => {
                ripgrep_files_with_matches(program, &self.root, pattern).await?
            }
            ContentSearch::Builtin => {
                let root = self.root.clone();
                let pattern = pattern.to_string();
                tokio::task::spawn_blocking(move || scan_files_with_matches(&root, &pattern))
                    .await
                    .context("content scan task failed")??
            }
        };
        found.sort();
        found.dedup();
        debug!(pattern = %pattern, hits = found.len(), backend = self.search.as_str(), "content search");
        Ok(found)
    }
}

async fn ripgrep_files_with_matches(
    program: &Path,
    root: &Path,
    pattern: &str,
) -> Result<Vec<PathBuf>> {
    let output = Command::new(program)
        .args([
            "--files-with-matches",
            "--fixed-strings",
            "--no-messages",
            "--glob",
            "*.html",
            "--",
            pattern,
        ])
        .arg(root)
        .output()
        .await
        .with_context(|| format!("failed to run {}", program.display()))?;

    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(PathBuf::from)
            .collect()),
        Some(1) => Ok(Vec::new()),
        _ => bail!(
            "ripgrep failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

fn scan_files_with_matches(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(HTML_EXTENSION)
        {
            continue;
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        if content.contains(pattern) {
            found.push(path.to_path_buf());
        }
    }
    Ok(found)
}
