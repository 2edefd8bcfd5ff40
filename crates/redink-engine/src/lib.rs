pub mod generators;
pub mod imaging;
pub mod pipeline;
pub mod prompt;
pub mod relay;
pub mod stop;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redink_contracts::config::{EngineSettings, ProviderSettings, ProvidersConfig};
use redink_contracts::pages::Page;
use redink_contracts::tasks::TaskStore;

pub use generators::{build_generator, AspectRatio, GenerateError, ImageGenerator, ImageRequest};
pub use pipeline::{ImagePipeline, PageResult, PipelineOptions, RunContext, RunRequest};
pub use relay::EventRelay;
pub use stop::StopFlag;

/// Build a pipeline for the active provider (or the dry-run generator).
pub fn pipeline_from_config(
    config: &ProvidersConfig,
    settings: &EngineSettings,
    dry_run: bool,
) -> Result<ImagePipeline> {
    let (name, provider) = if dry_run {
        ("dryrun", ProviderSettings::dryrun())
    } else {
        let (name, provider) = config.active()?;
        (name, provider.clone())
    };
    let generator = build_generator(name, &provider)
        .with_context(|| format!("failed to build image generator {name:?}"))?;
    if !generator.validate_config() {
        anyhow::bail!("image generator {name:?} is not usable with the current config");
    }
    let options = PipelineOptions::from_settings(&provider, settings)
        .with_context(|| format!("invalid settings for provider {name:?}"))?;
    let store = Arc::new(TaskStore::new(settings.history_dir.clone()));
    Ok(ImagePipeline::new(Arc::from(generator), store, options))
}

/// Full run streamed through a relay worker.
pub fn stream_generation(
    pipeline: &ImagePipeline,
    request: RunRequest,
    heartbeat: Duration,
) -> Result<EventRelay> {
    let pipeline = pipeline.clone();
    EventRelay::spawn(heartbeat, StopFlag::new(), move |stop| {
        Ok(pipeline.generate_images(request, stop))
    })
}

/// Batch retry streamed through a relay worker.
pub fn stream_retry_failed(
    pipeline: &ImagePipeline,
    task_id: &str,
    pages: Vec<Page>,
    heartbeat: Duration,
) -> Result<EventRelay> {
    let pipeline = pipeline.clone();
    let task_id = task_id.to_string();
    EventRelay::spawn(heartbeat, StopFlag::new(), move |stop| {
        Ok(pipeline.retry_failed_images(&task_id, pages, stop))
    })
}
