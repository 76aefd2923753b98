use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::MirrorConfig;

pub const STATE_DIR_NAME: &str = ".wikimirror";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Mirror output root: `[mirror].output_dir`, relative to the project root.
    pub fn mirror_dir(&self, config: &MirrorConfig) -> PathBuf {
        absolutize(Path::new(&config.mirror.output_dir), &self.project_root)
    }

    /// `[mirror].assets_dir`, relative to the project root, when set.
    pub fn assets_dir(&self, config: &MirrorConfig) -> Option<PathBuf> {
        config
            .mirror
            .assets_dir
            .as_deref()
            .map(|dir| absolutize(Path::new(dir), &self.project_root))
    }

    pub fn diagnostics(&self, config: &MirrorConfig) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})\nmirror_dir={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.mirror_dir(config)),
        )
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("WIKIMIRROR_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        root_source,
        config_source,
    })
}

/// Creates `.wikimirror/` and the mirror output directory, and writes a
/// starter config unless one already exists (or `force`).
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let mirror_dir = paths.mirror_dir(&MirrorConfig::default());
    for dir in [&paths.state_dir, &mirror_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, STARTER_CONFIG, force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

const STARTER_CONFIG: &str = r#"# wikimirror configuration (materialized by `wikimirror init`)

[wiki]
# api_url = "https://your-wiki.example.org/api.php"
# url = "https://your-wiki.example.org"
# user_agent = "wikimirror/0.1"

[mirror]
output_dir = "wiki"
search = "ripgrep"
# write_concurrency = 16
# assets_dir = "assets"

[frontpage]
# article = "Main Page"
# category = "Highlight"
refresh_categories = ["event", "highlight"]

[translations]
langs = []

[listener]
bind = "127.0.0.1:1338"

[categories.Event]
label = "Events"
index = true
parse = true

[categories.Article]
label = "Articles"
parse = true
fallback = true
"#;

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup_env("WIKIMIRROR_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    let mut candidates = cwd.ancestors().map(Path::to_path_buf).collect::<Vec<_>>();
    if let Some(exe_dir) = executable_dir {
        candidates.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    for candidate in candidates {
        if !seen.insert(normalize_for_display(&candidate)) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
