use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikimirror_core::config::{MirrorConfig, load_config};
use wikimirror_core::event::ChangeEvent;
use wikimirror_core::listener::{ChangeListener, shutdown_signal};
use wikimirror_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, normalize_for_display,
    resolve_paths,
};
use wikimirror_core::sync::{BuildReport, SyncEngine, SyncOutcome, SyncReport};
use wikimirror_core::title::slugify;

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Mirror a MediaWiki into static HTML, incrementally"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wikimirror/ with a starter config and the output directory")]
    Init(InitArgs),
    #[command(about = "Rebuild every configured category, its pages and the front page")]
    Build,
    #[command(about = "Rebuild one category index and its member pages")]
    Category(CategoryArgs),
    #[command(about = "Synchronize one page as if it had just been edited")]
    Sync(SyncArgs),
    #[command(about = "Apply one change event given as JSON")]
    Event(EventArgs),
    #[command(about = "Listen for change events over UDP until Ctrl-C")]
    Listen(ListenArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct CategoryArgs {
    name: String,
}

#[derive(Debug, Args)]
struct SyncArgs {
    title: String,
}

#[derive(Debug, Args)]
struct EventArgs {
    json: String,
}

#[derive(Debug, Args)]
struct ListenArgs {
    #[arg(long, value_name = "ADDR", help = "Override [listener].bind")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Build) => run_build(&runtime).await,
        Some(Commands::Category(CategoryArgs { name })) => run_category(&runtime, &name).await,
        Some(Commands::Sync(SyncArgs { title })) => run_sync(&runtime, &title).await,
        Some(Commands::Event(EventArgs { json })) => run_event(&runtime, &json).await,
        Some(Commands::Listen(args)) => run_listen(&runtime, args).await,
        None => print_help(),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wikimirror=info,wikimirror_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_help() -> Result<bool> {
    let mut command = Cli::command();
    command.print_help()?;
    println!();
    Ok(true)
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<bool> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized wikimirror runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    Ok(true)
}

async fn run_build(runtime: &RuntimeOptions) -> Result<bool> {
    let engine = open_engine(runtime)?;
    let report = engine.rebuild_all().await?;
    print_build_report("build", &engine, &report);
    Ok(report.succeeded())
}

async fn run_category(runtime: &RuntimeOptions, name: &str) -> Result<bool> {
    let engine = open_engine(runtime)?;
    let report = engine.rebuild_category(&slugify(name)).await?;
    print_build_report(&format!("category {name}"), &engine, &report);
    Ok(report.succeeded())
}

async fn run_sync(runtime: &RuntimeOptions, title: &str) -> Result<bool> {
    let engine = open_engine(runtime)?;
    let report = engine.sync_title(title).await;
    print_sync_report(&engine, &report);
    Ok(report.is_clean())
}

async fn run_event(runtime: &RuntimeOptions, json: &str) -> Result<bool> {
    let event: ChangeEvent =
        serde_json::from_str(json).context("argument is not a change event")?;
    let engine = open_engine(runtime)?;
    let report = engine.handle_event(&event).await;
    print_sync_report(&engine, &report);
    Ok(report.is_clean())
}

async fn run_listen(runtime: &RuntimeOptions, args: ListenArgs) -> Result<bool> {
    let (paths, config) = load_runtime(runtime)?;
    let bind = args.bind.unwrap_or_else(|| config.listener.bind.clone());
    let engine = SyncEngine::from_config(Arc::new(config), paths.mirror_dir)?;
    let listener = ChangeListener::bind(&bind).await?;
    println!("listening: {}", listener.local_addr()?);

    let stats = listener.run(&engine, shutdown_signal()).await?;
    println!("received: {}", stats.received);
    println!("synced: {}", stats.synced);
    println!("ignored: {}", stats.ignored);
    println!("failed: {}", stats.failed);
    println!("malformed: {}", stats.malformed);
    println!("api_requests: {}", engine.request_count());
    Ok(true)
}

fn print_build_report(label: &str, engine: &SyncEngine, report: &BuildReport) {
    println!("{label}");
    println!("mirror_root: {}", normalize_path(engine.mirror_root()));
    println!("written: {}", report.written);
    println!("unchanged: {}", report.unchanged);
    println!("duplicates_removed: {}", report.duplicates_removed);
    println!("indexes: {}", report.indexes.len());
    for path in &report.indexes {
        println!("  {}", normalize_path(path));
    }
    match &report.front_page {
        Some(path) => println!("front_page: {}", normalize_path(path)),
        None => println!("front_page: <unchanged>"),
    }
    println!("assets: {}", report.assets);
    println!("skipped: {}", report.skipped.len());
    for title in &report.skipped {
        println!("  {title}");
    }
    println!("failed: {}", report.failed.len());
    for message in &report.failed {
        println!("  {message}");
    }
    println!("api_requests: {}", engine.request_count());
}

fn print_sync_report(engine: &SyncEngine, report: &SyncReport) {
    println!("title: {}", report.title);
    println!("outcome: {}", report.outcome.as_str());
    if let SyncOutcome::Ignored(reason) = &report.outcome {
        println!("reason: {reason}");
    }
    println!("written: {}", report.written.len());
    for path in &report.written {
        println!("  {}", normalize_path(path));
    }
    println!("removed: {}", report.removed.len());
    for path in &report.removed {
        println!("  {}", normalize_path(path));
    }
    println!("indexes: {}", report.indexes.len());
    for (slug, outcome) in &report.indexes {
        println!("  {slug}: {outcome:?}");
    }
    println!("traces: {}", report.traces.len());
    println!("front_page: {}", format_flag(report.front_page));
    println!("errors: {}", report.errors.len());
    for message in &report.errors {
        println!("  {message}");
    }
    println!("api_requests: {}", engine.request_count());
}

fn open_engine(runtime: &RuntimeOptions) -> Result<SyncEngine> {
    let (paths, config) = load_runtime(runtime)?;
    Ok(SyncEngine::from_config(Arc::new(config), paths.mirror_dir)?
        .with_assets_dir(paths.assets_dir))
}

struct MirrorPaths {
    mirror_dir: PathBuf,
    assets_dir: Option<PathBuf>,
}

/// Resolves paths, loads the config and returns it with the mirror output locations.
fn load_runtime(runtime: &RuntimeOptions) -> Result<(MirrorPaths, MirrorConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics(&config));
    }
    let mirror = MirrorPaths {
        mirror_dir: paths.mirror_dir(&config),
        assets_dir: paths.assets_dir(&config),
    };
    Ok((mirror, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
