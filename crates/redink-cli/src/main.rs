use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use redink_contracts::config::{non_empty_env, EngineSettings, ProvidersConfig};
use redink_contracts::events::GenerationEvent;
use redink_contracts::pages::{parse_pages, Page};
use redink_contracts::sse::encode_frame;
use redink_contracts::tasks::generate_task_id;
use redink_engine::{
    pipeline_from_config, stream_generation, stream_retry_failed, EventRelay, ImagePipeline,
    PageResult, RunContext, RunRequest,
};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_CONFIG_FILE: &str = "image_providers.yaml";

#[derive(Debug, Parser)]
#[command(name = "redink", version, about = "Paged image generation with streamed progress")]
struct Cli {
    /// Provider config (YAML). Falls back to REDINK_CONFIG, then ./image_providers.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    history_dir: Option<PathBuf>,
    /// Use the offline generator regardless of the configured provider.
    #[arg(long, global = true)]
    dry_run: bool,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate every page and stream events to stdout.
    Generate(GenerateArgs),
    /// Retry one page; an already generated page is returned unchanged.
    Retry(PageArgs),
    /// Generate one page again, replacing the current image.
    Regenerate(RegenerateArgs),
    /// Retry the failed pages of a task and stream events to stdout.
    RetryFailed(RetryFailedArgs),
    /// Print the generated/failed snapshot of a task.
    Status(StatusArgs),
    /// List known task ids.
    Tasks,
    /// Validate the provider config.
    CheckConfig,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Pages JSON file (`-` for stdin): an array or an object with `pages`.
    #[arg(long)]
    pages: PathBuf,
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    outline: Option<PathBuf>,
    /// Reference image for the first page. Repeatable; only the first is used.
    #[arg(long)]
    reference: Vec<PathBuf>,
    #[arg(long)]
    no_reference: bool,
}

#[derive(Debug, Parser)]
struct PageArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    pages: PathBuf,
    #[arg(long)]
    index: usize,
    #[arg(long)]
    no_reference: bool,
}

#[derive(Debug, Parser)]
struct RegenerateArgs {
    #[command(flatten)]
    page: PageArgs,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    outline: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct RetryFailedArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    pages: PathBuf,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long)]
    task_id: String,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_format) {
        eprintln!("redink: {err:#}");
    }
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("redink error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redink=info"));
    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(io::stderr)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())?;
    let mut settings = EngineSettings::from_env();
    if let Some(dir) = cli.history_dir.clone() {
        settings.history_dir = dir;
    }

    if let Command::CheckConfig = cli.command {
        return check_config(&config);
    }
    let report = config.validate();
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "provider config");
    }

    let pipeline = pipeline_from_config(&config, &settings, cli.dry_run)?;
    match cli.command {
        Command::Generate(args) => run_generate(&pipeline, &settings, args),
        Command::Retry(args) => run_single(&pipeline, args, None),
        Command::Regenerate(args) => {
            let context = RunContext {
                full_outline: read_optional_text(args.outline.as_deref())?,
                user_topic: args.topic,
            };
            run_single(&pipeline, args.page, Some(context))
        }
        Command::RetryFailed(args) => run_retry_failed(&pipeline, &settings, args),
        Command::Status(args) => {
            let Some(snapshot) = pipeline.store().snapshot(&args.task_id)? else {
                bail!("task {} not found", args.task_id);
            };
            print_json(&serde_json::to_value(&snapshot)?)?;
            Ok(0)
        }
        Command::Tasks => {
            let mut stdout = io::stdout().lock();
            for task_id in pipeline.store().list_tasks()? {
                writeln!(stdout, "{task_id}")?;
            }
            Ok(0)
        }
        Command::CheckConfig => Ok(0),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<ProvidersConfig> {
    if let Some(path) = explicit {
        return ProvidersConfig::load(path)
            .with_context(|| format!("failed to load provider config {}", path.display()));
    }
    let path = non_empty_env("REDINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if !path.exists() {
        tracing::info!(path = %path.display(), "no provider config found; using the dry-run provider");
        return Ok(ProvidersConfig::default());
    }
    ProvidersConfig::load(&path)
        .with_context(|| format!("failed to load provider config {}", path.display()))
}

fn check_config(config: &ProvidersConfig) -> Result<i32> {
    let report = config.validate();
    tracing::info!(
        active_provider = %report.active_provider,
        providers = report.providers.len(),
        "provider config loaded"
    );
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "provider config");
    }
    print_json(&json!({
        "active_provider": report.active_provider,
        "providers": report.providers,
        "warnings": report.warnings,
        "ok": report.is_clean(),
    }))?;
    Ok(if report.is_clean() { 0 } else { 2 })
}

fn run_generate(pipeline: &ImagePipeline, settings: &EngineSettings, args: GenerateArgs) -> Result<i32> {
    let pages = read_pages(&args.pages)?;
    let user_images = args
        .reference
        .iter()
        .take(1)
        .map(|path| fs::read(path).with_context(|| format!("failed reading {}", path.display())))
        .collect::<Result<Vec<Vec<u8>>>>()?;
    let request = RunRequest {
        task_id: args.task_id.unwrap_or_else(generate_task_id),
        pages,
        context: RunContext {
            full_outline: read_optional_text(args.outline.as_deref())?,
            user_topic: args.topic,
        },
        user_images,
    };
    tracing::info!(task_id = %request.task_id, pages = request.pages.len(), "starting generation");

    let mut pipeline = pipeline.clone();
    if args.no_reference {
        pipeline = pipeline.without_reference();
    }
    let relay = stream_generation(&pipeline, request, settings.heartbeat_interval)?;
    stream_to_stdout(relay)
}

fn run_retry_failed(pipeline: &ImagePipeline, settings: &EngineSettings, args: RetryFailedArgs) -> Result<i32> {
    let Some(state) = pipeline.store().load(&args.task_id)? else {
        bail!("task {} not found", args.task_id);
    };
    let pages: Vec<Page> = read_pages(&args.pages)?
        .into_iter()
        .filter(|page| state.failed.contains_key(&page.index))
        .collect();
    if pages.is_empty() {
        tracing::info!(task_id = %args.task_id, "no failed pages to retry");
    }
    let relay = stream_retry_failed(pipeline, &args.task_id, pages, settings.heartbeat_interval)?;
    stream_to_stdout(relay)
}

fn run_single(pipeline: &ImagePipeline, args: PageArgs, regenerate: Option<RunContext>) -> Result<i32> {
    let pages = read_pages(&args.pages)?;
    let Some(page) = pages.into_iter().find(|page| page.index == args.index) else {
        bail!("page {} not found in {}", args.index, args.pages.display());
    };
    let use_reference = !args.no_reference;
    let result = match regenerate {
        Some(context) => pipeline.regenerate_image(&args.task_id, &page, use_reference, &context),
        None => pipeline.retry_single_image(&args.task_id, &page, use_reference),
    };
    print_json(&result.to_value())?;
    Ok(match result {
        PageResult::Generated { .. } => 0,
        PageResult::Failed { .. } => 2,
    })
}

/// Write each event as an SSE frame. Exit code: 0 clean, 2 partial, 1 task error.
fn stream_to_stdout(relay: EventRelay) -> Result<i32> {
    let mut stdout = io::stdout().lock();
    let mut code = 0;
    for event in relay {
        match &event {
            GenerationEvent::Error { index: None, .. } => code = 1,
            GenerationEvent::Finish(summary) if summary.failed > 0 && code == 0 => code = 2,
            _ => {}
        }
        stdout.write_all(encode_frame(&event).as_bytes())?;
        stdout.flush()?;
    }
    Ok(code)
}

fn read_pages(path: &Path) -> Result<Vec<Page>> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        io::stdin()
            .read_to_string(&mut raw)
            .context("failed reading pages from stdin")?;
        raw
    } else {
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?
    };
    parse_pages(&raw).with_context(|| format!("invalid pages in {}", path.display()))
}

fn read_optional_text(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|path| fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display())))
        .transpose()
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}
