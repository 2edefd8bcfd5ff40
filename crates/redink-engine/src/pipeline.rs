use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use redink_contracts::config::{EngineSettings, ProviderSettings};
use redink_contracts::events::{EventWriter, GenerationEvent, PageErrorKind, RunSummary};
use redink_contracts::pages::Page;
use redink_contracts::tasks::{
    image_filename, image_url, thumbnail_filename, FailedPage, GeneratedImage, PageOutcome,
    StoreError, TaskStore,
};
use serde_json::{json, Value};

use crate::generators::{AspectRatio, GenerateError, ImageGenerator, ImageRequest};
use crate::imaging::{compress_reference, make_thumbnail, REFERENCE_MAX_BYTES};
use crate::prompt::{build_page_prompt, with_style_reference, PromptContext};
use crate::relay::panic_message;
use crate::stop::StopFlag;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub model: String,
    pub aspect_ratio: AspectRatio,
    pub temperature: f64,
    pub use_reference: bool,
    pub thumbnail_width: u32,
    pub retry_concurrency: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            aspect_ratio: AspectRatio::default(),
            temperature: 1.0,
            use_reference: true,
            thumbnail_width: 400,
            retry_concurrency: 3,
        }
    }
}

impl PipelineOptions {
    pub fn from_settings(
        provider: &ProviderSettings,
        engine: &EngineSettings,
    ) -> Result<Self, GenerateError> {
        Ok(Self {
            model: provider.resolved_model(),
            aspect_ratio: provider.default_aspect_ratio.parse()?,
            temperature: provider.temperature,
            use_reference: true,
            thumbnail_width: engine.thumbnail_width,
            retry_concurrency: engine.retry_concurrency.max(1),
        })
    }
}

/// Prompt context shared by the pages of one request.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub full_outline: Option<String>,
    pub user_topic: Option<String>,
}

impl RunContext {
    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            user_topic: self.user_topic.as_deref(),
            full_outline: self.full_outline.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task_id: String,
    pub pages: Vec<Page>,
    pub context: RunContext,
    pub user_images: Vec<Vec<u8>>,
}

/// Terminal outcome of one page attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PageResult {
    Generated {
        index: usize,
        image_url: String,
    },
    Failed {
        index: usize,
        kind: PageErrorKind,
        message: String,
        retryable: bool,
    },
}

impl PageResult {
    pub fn index(&self) -> usize {
        match self {
            PageResult::Generated { index, .. } | PageResult::Failed { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PageResult::Generated { .. })
    }

    /// Response body for the synchronous retry/regenerate calls.
    pub fn to_value(&self) -> Value {
        match self {
            PageResult::Generated { index, image_url } => json!({
                "success": true,
                "index": index,
                "image_url": image_url,
            }),
            PageResult::Failed {
                index,
                kind,
                message,
                retryable,
            } => json!({
                "success": false,
                "index": index,
                "error": message,
                "kind": kind.as_str(),
                "retryable": retryable,
            }),
        }
    }

    pub fn to_event(&self) -> GenerationEvent {
        match self {
            PageResult::Generated { index, image_url } => GenerationEvent::Success {
                index: *index,
                image_url: image_url.clone(),
                message: format!("page {index} generated"),
            },
            PageResult::Failed {
                index,
                kind,
                message,
                retryable,
            } => GenerationEvent::page_error(*index, *kind, message.clone(), *retryable),
        }
    }
}

struct PageFailure {
    kind: PageErrorKind,
    message: String,
    retryable: bool,
}

impl PageFailure {
    fn storage(err: StoreError) -> Self {
        Self {
            kind: PageErrorKind::StorageError,
            message: err.to_string(),
            retryable: true,
        }
    }
}

fn store_error_kind(err: &StoreError) -> PageErrorKind {
    match err {
        StoreError::InvalidTaskId(_) | StoreError::InvalidFileName(_) => {
            PageErrorKind::ValidationError
        }
        StoreError::Corrupt { .. } | StoreError::Io { .. } => PageErrorKind::StorageError,
    }
}

/// Turns pages into images, one provider call per page, recording every
/// outcome in the task store.
#[derive(Clone)]
pub struct ImagePipeline {
    generator: Arc<dyn ImageGenerator>,
    store: Arc<TaskStore>,
    options: PipelineOptions,
}

impl ImagePipeline {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        store: Arc<TaskStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            generator,
            store,
            options,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Same pipeline, but later pages no longer borrow the cover's style.
    pub fn without_reference(mut self) -> Self {
        self.options.use_reference = false;
        self
    }

    /// Full run. Pages are processed in order; the stop flag is checked
    /// before each page.
    pub fn generate_images(&self, request: RunRequest, stop: StopFlag) -> GenerationRun {
        let writer = self.event_writer(&request.task_id);
        GenerationRun {
            pipeline: self.clone(),
            request,
            stop,
            writer,
            stage: RunStage::Start,
            images: Vec::new(),
            failed: 0,
        }
    }

    /// Re-run one page. A page that is already generated is returned as is.
    pub fn retry_single_image(&self, task_id: &str, page: &Page, use_reference: bool) -> PageResult {
        if let Err(result) = self.require_task(task_id, page.index) {
            return result;
        }
        if let Some(existing) = self.existing_result(task_id, page.index) {
            tracing::info!(task_id, index = page.index, "page already generated; retry skipped");
            return existing;
        }
        let reference = use_reference
            .then(|| self.cover_reference(task_id, page.index))
            .flatten();
        let result = self.run_page(task_id, page, reference, &PromptContext::default());
        self.publish_result(task_id, &result);
        result
    }

    /// Force a new image for one page, replacing any earlier result.
    pub fn regenerate_image(
        &self,
        task_id: &str,
        page: &Page,
        use_reference: bool,
        context: &RunContext,
    ) -> PageResult {
        if let Err(result) = self.require_task(task_id, page.index) {
            return result;
        }
        let reference = use_reference
            .then(|| self.cover_reference(task_id, page.index))
            .flatten();
        let result = self.run_page(task_id, page, reference, &context.prompt_context());
        self.publish_result(task_id, &result);
        result
    }

    /// Retry a set of pages. Runs several pages at once when the task
    /// already has a cover, otherwise one at a time so the first success
    /// can serve as the reference for the rest.
    pub fn retry_failed_images(&self, task_id: &str, pages: Vec<Page>, stop: StopFlag) -> BatchRetryRun {
        BatchRetryRun {
            pipeline: self.clone(),
            task_id: task_id.to_string(),
            writer: self.event_writer(task_id),
            pages,
            stop,
            rx: None,
            stage: BatchStage::Start,
            total: 0,
            images: Vec::new(),
            completed: 0,
            failed: 0,
        }
    }

    fn require_task(&self, task_id: &str, index: usize) -> Result<(), PageResult> {
        let failure = |kind: PageErrorKind, message: String| PageResult::Failed {
            index,
            kind,
            message,
            retryable: false,
        };
        match self.store.load(task_id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(failure(
                PageErrorKind::ValidationError,
                format!("task {task_id} not found"),
            )),
            Err(err) => Err(failure(store_error_kind(&err), err.to_string())),
        }
    }

    fn existing_result(&self, task_id: &str, index: usize) -> Option<PageResult> {
        let state = self.store.load(task_id).ok().flatten()?;
        (state.outcome(index) == Some(PageOutcome::Generated)).then(|| PageResult::Generated {
            index,
            image_url: image_url(task_id, index),
        })
    }

    fn cover_reference(&self, task_id: &str, index: usize) -> Option<Vec<u8>> {
        match self.store.cover_bytes(task_id) {
            Ok(Some((cover_index, bytes))) if cover_index != index => Some(bytes),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(task_id, index, error = %err, "cover image unavailable; continuing without reference");
                None
            }
        }
    }

    fn run_page(
        &self,
        task_id: &str,
        page: &Page,
        reference: Option<Vec<u8>>,
        context: &PromptContext<'_>,
    ) -> PageResult {
        let index = page.index;
        let request = page
            .validate()
            .map(|()| self.image_request(page, reference, context));
        self.store.with_page_lock(task_id, index, || {
            let outcome = match &request {
                Ok(request) => self.generate_and_persist(task_id, index, request),
                Err(message) => Err(PageFailure {
                    kind: PageErrorKind::ValidationError,
                    message: message.clone(),
                    retryable: false,
                }),
            };
            match outcome {
                Ok(image_url) => PageResult::Generated { index, image_url },
                Err(failure) => self.fail_page(task_id, index, failure),
            }
        })
    }

    fn image_request(
        &self,
        page: &Page,
        reference: Option<Vec<u8>>,
        context: &PromptContext<'_>,
    ) -> ImageRequest {
        let prompt = build_page_prompt(page, context);
        let reference = reference.map(|bytes| compress_reference(&bytes, REFERENCE_MAX_BYTES));
        ImageRequest {
            prompt: if reference.is_some() {
                with_style_reference(&prompt)
            } else {
                prompt
            },
            aspect_ratio: self.options.aspect_ratio,
            temperature: self.options.temperature,
            model: self.options.model.clone(),
            reference_image: reference,
        }
    }

    fn generate_and_persist(
        &self,
        task_id: &str,
        index: usize,
        request: &ImageRequest,
    ) -> Result<String, PageFailure> {
        let started = Instant::now();
        let bytes = self
            .generator
            .generate_image(request)
            .map_err(|err| PageFailure {
                kind: PageErrorKind::ProviderError,
                retryable: err.is_retryable(),
                message: err.to_string(),
            })?;

        // Bytes that do not decode are treated like an empty response:
        // nothing is written and the page never becomes the cover.
        let thumb = make_thumbnail(&bytes, self.options.thumbnail_width).map_err(|err| {
            PageFailure {
                kind: PageErrorKind::ProviderError,
                message: format!("provider returned an undecodable image: {err:#}"),
                retryable: true,
            }
        })?;
        self.store
            .write_image(task_id, &image_filename(index), &bytes)
            .map_err(PageFailure::storage)?;
        let thumbnail = thumbnail_filename(index);
        self.store
            .write_image(task_id, &thumbnail, &thumb)
            .map_err(PageFailure::storage)?;
        self.store
            .record_success(task_id, index, GeneratedImage::new(index, &bytes, Some(thumbnail)))
            .map_err(PageFailure::storage)?;

        tracing::info!(
            task_id,
            index,
            bytes = bytes.len(),
            referenced = request.reference_image.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "page generated"
        );
        Ok(image_url(task_id, index))
    }

    fn fail_page(&self, task_id: &str, index: usize, failure: PageFailure) -> PageResult {
        tracing::warn!(
            task_id,
            index,
            kind = failure.kind.as_str(),
            retryable = failure.retryable,
            error = %failure.message,
            "page failed"
        );
        let record = FailedPage::new(failure.kind, failure.message.clone(), failure.retryable);
        if let Err(err) = self.store.record_failure(task_id, index, record) {
            tracing::error!(task_id, index, error = %err, "failed to record page failure");
        }
        PageResult::Failed {
            index,
            kind: failure.kind,
            message: failure.message,
            retryable: failure.retryable,
        }
    }

    fn event_writer(&self, task_id: &str) -> Option<EventWriter> {
        self.store
            .events_path(task_id)
            .ok()
            .map(|path| EventWriter::new(path, task_id))
    }

    fn publish_result(&self, task_id: &str, result: &PageResult) {
        publish(self.event_writer(task_id).as_ref(), &result.to_event());
    }

    fn retry_page(&self, task_id: &str, page: &Page) -> PageResult {
        if let Some(existing) = self.existing_result(task_id, page.index) {
            return existing;
        }
        let reference = self.cover_reference(task_id, page.index);
        self.run_page(task_id, page, reference, &PromptContext::default())
    }
}

fn publish(writer: Option<&EventWriter>, event: &GenerationEvent) {
    if let Some(writer) = writer {
        if let Err(err) = writer.emit(event) {
            tracing::warn!(
                path = %writer.path().display(),
                error = %err,
                "event log append failed"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RunStage {
    Start,
    Announce(usize),
    Generate(usize),
    Finish,
    Done,
}

/// Lazy, single-pass event sequence for a full run.
pub struct GenerationRun {
    pipeline: ImagePipeline,
    request: RunRequest,
    stop: StopFlag,
    writer: Option<EventWriter>,
    stage: RunStage,
    images: Vec<String>,
    failed: usize,
}

impl GenerationRun {
    fn reference_for(&self, position: usize, index: usize) -> Option<Vec<u8>> {
        let user_image = self.request.user_images.first().cloned();
        if position == 0 {
            return user_image;
        }
        if self.pipeline.options.use_reference {
            if let Some(cover) = self.pipeline.cover_reference(&self.request.task_id, index) {
                return Some(cover);
            }
        }
        user_image
    }

    fn start(&self) -> Result<(), GenerationEvent> {
        if self.request.pages.is_empty() {
            return Err(GenerationEvent::task_error(
                PageErrorKind::ValidationError,
                "pages must not be empty",
            ));
        }
        self.pipeline
            .store
            .ensure_task(&self.request.task_id)
            .map(|_| ())
            .map_err(|err| GenerationEvent::task_error(store_error_kind(&err), err.to_string()))
    }
}

impl Iterator for GenerationRun {
    type Item = GenerationEvent;

    fn next(&mut self) -> Option<GenerationEvent> {
        let total = self.request.pages.len();
        loop {
            let event = match self.stage {
                RunStage::Start => match self.start() {
                    Ok(()) => {
                        tracing::info!(task_id = %self.request.task_id, pages = total, "generation run started");
                        self.stage = RunStage::Announce(0);
                        continue;
                    }
                    Err(event) => {
                        self.stage = RunStage::Done;
                        event
                    }
                },
                RunStage::Announce(position) => {
                    if self.stop.is_stopped() {
                        tracing::info!(
                            task_id = %self.request.task_id,
                            remaining = total - position,
                            "generation run stopped by consumer"
                        );
                        self.stage = RunStage::Done;
                        return None;
                    }
                    let Some(page) = self.request.pages.get(position) else {
                        self.stage = RunStage::Finish;
                        continue;
                    };
                    self.stage = RunStage::Generate(position);
                    GenerationEvent::Progress {
                        index: Some(page.index),
                        current: position + 1,
                        total,
                        message: format!("generating page {} of {total}", position + 1),
                    }
                }
                RunStage::Generate(position) => {
                    self.stage = RunStage::Announce(position + 1);
                    let Some(page) = self.request.pages.get(position) else {
                        continue;
                    };
                    let reference = self.reference_for(position, page.index);
                    let result = self.pipeline.run_page(
                        &self.request.task_id,
                        page,
                        reference,
                        &self.request.context.prompt_context(),
                    );
                    match &result {
                        PageResult::Generated { index, .. } => self.images.push(image_filename(*index)),
                        PageResult::Failed { .. } => self.failed += 1,
                    }
                    result.to_event()
                }
                RunStage::Finish => {
                    self.stage = RunStage::Done;
                    let summary = RunSummary {
                        task_id: self.request.task_id.clone(),
                        images: self.images.clone(),
                        total,
                        completed: self.images.len(),
                        failed: self.failed,
                    };
                    tracing::info!(
                        task_id = %summary.task_id,
                        completed = summary.completed,
                        failed = summary.failed,
                        "generation run finished"
                    );
                    GenerationEvent::Finish(summary)
                }
                RunStage::Done => return None,
            };
            publish(self.writer.as_ref(), &event);
            return Some(event);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BatchStage {
    Start,
    Streaming,
    Finish,
    Done,
}

/// Event sequence for a batch retry. Page events arrive in completion order.
pub struct BatchRetryRun {
    pipeline: ImagePipeline,
    task_id: String,
    writer: Option<EventWriter>,
    pages: Vec<Page>,
    stop: StopFlag,
    rx: Option<mpsc::Receiver<GenerationEvent>>,
    stage: BatchStage,
    total: usize,
    images: Vec<String>,
    completed: usize,
    failed: usize,
}

impl BatchRetryRun {
    fn start(&mut self) -> Result<GenerationEvent, GenerationEvent> {
        let state = match self.pipeline.store.load(&self.task_id) {
            Ok(Some(state)) => state,
            Ok(None) => {
                return Err(GenerationEvent::task_error(
                    PageErrorKind::ValidationError,
                    format!("task {} not found", self.task_id),
                ))
            }
            Err(err) => {
                return Err(GenerationEvent::task_error(
                    store_error_kind(&err),
                    err.to_string(),
                ))
            }
        };
        let total = self.pages.len();
        self.total = total;
        let workers = if state.cover_image.is_some() {
            self.pipeline.options.retry_concurrency.clamp(1, total.max(1))
        } else {
            1
        };
        tracing::info!(task_id = %self.task_id, pages = total, workers, "batch retry started");

        let queue = Arc::new(Mutex::new(
            std::mem::take(&mut self.pages)
                .into_iter()
                .enumerate()
                .collect::<VecDeque<(usize, Page)>>(),
        ));
        let (tx, rx) = mpsc::channel();
        let mut spawned = 0;
        for worker_id in 0..workers {
            let worker = RetryWorker {
                pipeline: self.pipeline.clone(),
                task_id: self.task_id.clone(),
                queue: Arc::clone(&queue),
                total,
                stop: self.stop.clone(),
                tx: tx.clone(),
            };
            match thread::Builder::new()
                .name(format!("redink-retry-{worker_id}"))
                .spawn(move || worker.run())
            {
                Ok(_) => spawned += 1,
                Err(err) => tracing::error!(error = %err, "retry worker spawn failed"),
            }
        }
        if spawned == 0 {
            RetryWorker {
                pipeline: self.pipeline.clone(),
                task_id: self.task_id.clone(),
                queue,
                total,
                stop: self.stop.clone(),
                tx,
            }
            .run();
        }
        self.rx = Some(rx);
        Ok(GenerationEvent::Progress {
            index: None,
            current: 0,
            total,
            message: format!("retrying {total} page(s)"),
        })
    }
}

impl Iterator for BatchRetryRun {
    type Item = GenerationEvent;

    fn next(&mut self) -> Option<GenerationEvent> {
        loop {
            let event = match self.stage {
                BatchStage::Start => match self.start() {
                    Ok(event) => {
                        self.stage = BatchStage::Streaming;
                        event
                    }
                    Err(event) => {
                        self.stage = BatchStage::Done;
                        event
                    }
                },
                BatchStage::Streaming => {
                    let received = self.rx.as_ref().and_then(|rx| rx.recv().ok());
                    let Some(event) = received else {
                        self.rx = None;
                        self.stage = if self.stop.is_stopped() {
                            BatchStage::Done
                        } else {
                            BatchStage::Finish
                        };
                        continue;
                    };
                    match &event {
                        GenerationEvent::Success { index, .. } => {
                            self.completed += 1;
                            self.images.push(image_filename(*index));
                        }
                        GenerationEvent::Error { index: Some(_), .. } => self.failed += 1,
                        _ => {}
                    }
                    event
                }
                BatchStage::Finish => {
                    self.stage = BatchStage::Done;
                    let summary = RunSummary {
                        task_id: self.task_id.clone(),
                        images: self.images.clone(),
                        total: self.total,
                        completed: self.completed,
                        failed: self.failed,
                    };
                    tracing::info!(
                        task_id = %summary.task_id,
                        completed = summary.completed,
                        failed = summary.failed,
                        "batch retry finished"
                    );
                    GenerationEvent::Finish(summary)
                }
                BatchStage::Done => return None,
            };
            publish(self.writer.as_ref(), &event);
            return Some(event);
        }
    }
}

struct RetryWorker {
    pipeline: ImagePipeline,
    task_id: String,
    queue: Arc<Mutex<VecDeque<(usize, Page)>>>,
    total: usize,
    stop: StopFlag,
    tx: mpsc::Sender<GenerationEvent>,
}

impl RetryWorker {
    fn run(self) {
        while !self.stop.is_stopped() {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some((position, page)) = next else {
                break;
            };
            let progress = GenerationEvent::Progress {
                index: Some(page.index),
                current: position + 1,
                total: self.total,
                message: format!("retrying page {}", page.index),
            };
            if self.tx.send(progress).is_err() {
                break;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.pipeline.retry_page(&self.task_id, &page)
            }))
            .unwrap_or_else(|payload| {
                self.pipeline.fail_page(
                    &self.task_id,
                    page.index,
                    PageFailure {
                        kind: PageErrorKind::WorkerCrash,
                        message: panic_message(payload.as_ref()),
                        retryable: true,
                    },
                )
            });
            if self.tx.send(result.to_event()).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use redink_contracts::pages::PageKind;

    use super::*;
    use crate::generators::{DryrunGenerator, RetryPolicy, RetryingGenerator, Sleeper};

    /// Succeeds with a dry-run PNG unless a failure is scripted for a
    /// marker contained in the prompt.
    #[derive(Default)]
    struct ScriptedGenerator {
        fail_once: Mutex<HashMap<String, VecDeque<GenerateError>>>,
        always_fail: Mutex<HashMap<String, bool>>,
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl ScriptedGenerator {
        fn fail_once(self, marker: &str, err: GenerateError) -> Self {
            self.fail_once
                .lock()
                .unwrap()
                .entry(marker.to_string())
                .or_default()
                .push_back(err);
            self
        }

        fn always_fail(self, marker: &str, retryable: bool) -> Self {
            self.always_fail
                .lock()
                .unwrap()
                .insert(marker.to_string(), retryable);
            self
        }

        fn calls_for(&self, marker: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(prompt, _)| prompt.contains(marker))
                .count()
        }

        fn had_reference(&self, marker: &str) -> Vec<bool> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(prompt, _)| prompt.contains(marker))
                .map(|(_, referenced)| *referenced)
                .collect()
        }
    }

    impl ImageGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn validate_config(&self) -> bool {
            true
        }

        fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.prompt.clone(), request.reference_image.is_some()));
            for (marker, retryable) in self.always_fail.lock().unwrap().iter() {
                if request.prompt.contains(marker.as_str()) {
                    return Err(if *retryable {
                        GenerateError::Transient(format!("{marker}: upstream 503"))
                    } else {
                        GenerateError::ContentFiltered(format!("{marker}: blocked"))
                    });
                }
            }
            for (marker, queued) in self.fail_once.lock().unwrap().iter_mut() {
                if request.prompt.contains(marker.as_str()) {
                    if let Some(err) = queued.pop_front() {
                        return Err(err);
                    }
                }
            }
            DryrunGenerator::new().generate_image(request)
        }
    }

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration) {}
    }

    fn pipeline(generator: Arc<dyn ImageGenerator>, root: &Path) -> ImagePipeline {
        ImagePipeline::new(
            generator,
            Arc::new(TaskStore::new(root)),
            PipelineOptions {
                model: "stub-image".to_string(),
                ..PipelineOptions::default()
            },
        )
    }

    fn pages(contents: &[&str]) -> Vec<Page> {
        contents
            .iter()
            .enumerate()
            .map(|(index, content)| {
                let kind = if index == 0 {
                    PageKind::Cover
                } else {
                    PageKind::Content
                };
                Page::new(index, kind, *content)
            })
            .collect()
    }

    fn run_request(task_id: &str, pages: Vec<Page>) -> RunRequest {
        RunRequest {
            task_id: task_id.to_string(),
            pages,
            ..RunRequest::default()
        }
    }

    fn outcome_indices(events: &[GenerationEvent]) -> Vec<(usize, bool)> {
        events
            .iter()
            .filter(|event| event.is_page_outcome())
            .filter_map(|event| {
                event
                    .index()
                    .map(|index| (index, matches!(event, GenerationEvent::Success { .. })))
            })
            .collect()
    }

    #[test]
    fn full_run_emits_ordered_events_and_persists_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("t1", pages(&["alpha cover", "beta slide"])), StopFlag::new())
            .collect();

        let kinds: Vec<&str> = events.iter().map(GenerationEvent::event_type).collect();
        assert_eq!(kinds, vec!["progress", "success", "progress", "success", "finish"]);
        assert_eq!(outcome_indices(&events), vec![(0, true), (1, true)]);
        match events.last() {
            Some(GenerationEvent::Finish(summary)) => {
                assert_eq!(summary.images, vec!["0.png", "1.png"]);
                assert_eq!((summary.total, summary.completed, summary.failed), (2, 2, 0));
            }
            other => panic!("expected finish, got {other:?}"),
        }

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(state.failed.is_empty());
        assert_eq!(state.cover_image.as_ref().map(|cover| cover.index), Some(0));
        for file in ["0.png", "1.png", "thumb_0.png", "thumb_1.png"] {
            assert!(temp.path().join("t1").join(file).is_file(), "{file} missing");
        }

        assert_eq!(stub.had_reference("alpha cover"), vec![false]);
        assert_eq!(stub.had_reference("beta slide"), vec![true]);

        let log = fs::read_to_string(temp.path().join("t1").join("events.jsonl"))?;
        assert_eq!(log.lines().count(), events.len());
        Ok(())
    }

    #[test]
    fn internal_retry_hides_a_transient_first_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default().fail_once(
            "cover text",
            GenerateError::RateLimited("429 RESOURCE_EXHAUSTED".to_string()),
        ));
        let retrying = RetryingGenerator::with_sleeper(stub.clone(), RetryPolicy::default(), NoSleep);
        let pipeline = pipeline(Arc::new(retrying), temp.path());

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("t1", pages(&["cover text", "slide 2"])), StopFlag::new())
            .collect();

        assert!(events
            .iter()
            .all(|event| !matches!(event, GenerationEvent::Error { .. })));
        assert_eq!(outcome_indices(&events), vec![(0, true), (1, true)]);
        assert_eq!(stub.calls_for("cover text"), 2);

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(state.failed.is_empty());
        Ok(())
    }

    #[test]
    fn one_failing_page_does_not_abort_the_run() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default().always_fail("forbidden", false));
        let pipeline = pipeline(stub, temp.path());

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(
                run_request("t1", pages(&["intro", "forbidden topic", "outro"])),
                StopFlag::new(),
            )
            .collect();

        assert_eq!(outcome_indices(&events), vec![(0, true), (1, false), (2, true)]);
        let error = events
            .iter()
            .find(|event| matches!(event, GenerationEvent::Error { .. }))
            .expect("error event");
        assert!(!error.retryable());
        assert_eq!(error.payload()["kind"], serde_json::json!("provider_error"));

        let state = pipeline.store().load("t1")?.expect("state saved");
        for index in 0..3 {
            assert!(state.outcome(index).is_some(), "page {index} has no outcome");
        }
        assert!(!state.failed[&1].retryable);
        Ok(())
    }

    #[test]
    fn blank_pages_fail_validation_without_a_provider_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("t1", pages(&["cover", "   "])), StopFlag::new())
            .collect();

        assert_eq!(outcome_indices(&events), vec![(0, true), (1, false)]);
        assert_eq!(stub.calls.lock().unwrap().len(), 1);
        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.failed[&1].kind, PageErrorKind::ValidationError);
        Ok(())
    }

    #[test]
    fn first_page_uses_the_uploaded_reference() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        let mut request = run_request("t1", pages(&["first", "second"]));
        request.user_images = vec![b"user-upload".to_vec()];

        let _events: Vec<GenerationEvent> = pipeline.generate_images(request, StopFlag::new()).collect();

        assert_eq!(stub.had_reference("first"), vec![true]);
        assert_eq!(stub.had_reference("second"), vec![true]);
        Ok(())
    }

    #[test]
    fn stop_flag_ends_the_run_at_a_page_boundary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        let stop = StopFlag::new();
        let mut run = pipeline.generate_images(run_request("t1", pages(&["one", "two", "three"])), stop.clone());

        assert!(matches!(run.next(), Some(GenerationEvent::Progress { .. })));
        assert!(matches!(run.next(), Some(GenerationEvent::Success { index: 0, .. })));
        stop.stop();
        assert_eq!(run.next(), None);
        assert_eq!(run.next(), None);

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert!(temp.path().join("t1").join("0.png").is_file());
        assert_eq!(stub.calls.lock().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn invalid_task_id_is_a_single_task_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(ScriptedGenerator::default()), temp.path());
        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("../escape", pages(&["x"])), StopFlag::new())
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index(), None);
        assert_eq!(events[0].payload()["kind"], serde_json::json!("validation_error"));
        Ok(())
    }

    #[test]
    fn batch_retry_keeps_pages_independent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default().always_fail("page five", true));
        let pipeline = pipeline(stub.clone(), temp.path());
        let store = pipeline.store();
        let cover = DryrunGenerator::new().generate_image(&ImageRequest::new("cover"))?;
        store.write_image("t1", "0.png", &cover)?;
        store.record_success("t1", 0, GeneratedImage::new(0, &cover, None))?;
        for index in [3, 5] {
            store.record_failure(
                "t1",
                index,
                FailedPage::new(PageErrorKind::ProviderError, "earlier failure", true),
            )?;
        }

        let retry_pages = vec![
            Page::new(3, PageKind::Content, "page three"),
            Page::new(5, PageKind::Content, "page five"),
        ];
        let events: Vec<GenerationEvent> = pipeline
            .retry_failed_images("t1", retry_pages, StopFlag::new())
            .collect();

        assert!(matches!(
            events.first(),
            Some(GenerationEvent::Progress { index: None, total: 2, .. })
        ));
        let mut outcomes = outcome_indices(&events);
        outcomes.sort();
        assert_eq!(outcomes, vec![(3, true), (5, false)]);
        assert!(events
            .iter()
            .any(|event| event.index() == Some(5) && event.retryable()));
        match events.last() {
            Some(GenerationEvent::Finish(summary)) => {
                assert_eq!((summary.total, summary.completed, summary.failed), (2, 1, 1));
            }
            other => panic!("expected finish, got {other:?}"),
        }

        let state = store.load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(state.failed.keys().copied().collect::<Vec<_>>(), vec![5]);
        assert_eq!(stub.had_reference("page three"), vec![true]);
        Ok(())
    }

    #[test]
    fn batch_retry_without_cover_feeds_first_success_to_the_next_page() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        for index in [1, 2] {
            pipeline.store().record_failure(
                "t1",
                index,
                FailedPage::new(PageErrorKind::ProviderError, "rate limited", true),
            )?;
        }

        let retry_pages = vec![
            Page::new(1, PageKind::Content, "first retry"),
            Page::new(2, PageKind::Content, "second retry"),
        ];
        let events: Vec<GenerationEvent> = pipeline
            .retry_failed_images("t1", retry_pages, StopFlag::new())
            .collect();

        assert_eq!(outcome_indices(&events), vec![(1, true), (2, true)]);
        assert_eq!(stub.had_reference("first retry"), vec![false]);
        assert_eq!(stub.had_reference("second retry"), vec![true]);
        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.cover_image.map(|cover| cover.index), Some(1));
        Ok(())
    }

    #[test]
    fn batch_retry_on_unknown_task_reports_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(ScriptedGenerator::default()), temp.path());
        let events: Vec<GenerationEvent> = pipeline
            .retry_failed_images("nope", pages(&["x"]), StopFlag::new())
            .collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], GenerationEvent::Error { index: None, .. }));
        Ok(())
    }

    #[test]
    fn retry_single_image_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default().always_fail("stubborn", true));
        let pipeline = pipeline(stub.clone(), temp.path());
        pipeline.store().ensure_task("t1")?;
        let page = Page::new(2, PageKind::Content, "stubborn page");

        let first = pipeline.retry_single_image("t1", &page, true);
        let second = pipeline.retry_single_image("t1", &page, true);
        assert!(!first.is_success());
        assert_eq!(first, second);
        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.outcome(2), Some(PageOutcome::Failed));
        assert_eq!(second.to_value()["retryable"], serde_json::json!(true));
        Ok(())
    }

    #[test]
    fn retry_of_a_generated_page_skips_the_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        pipeline.store().ensure_task("t1")?;
        let page = Page::new(0, PageKind::Cover, "cover page");

        let first = pipeline.retry_single_image("t1", &page, false);
        let second = pipeline.retry_single_image("t1", &page, false);
        assert!(first.is_success());
        assert_eq!(first, second);
        assert_eq!(stub.calls_for("cover page"), 1);
        assert_eq!(
            first.to_value()["image_url"],
            serde_json::json!("/api/images/t1/0.png")
        );
        Ok(())
    }

    #[test]
    fn regenerate_always_calls_the_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default().fail_once(
            "redo me",
            GenerateError::ContentFiltered("blocked".to_string()),
        ));
        let pipeline = pipeline(stub.clone(), temp.path());
        pipeline.store().ensure_task("t1")?;
        let page = Page::new(1, PageKind::Content, "redo me");

        // first call hits the scripted failure, then two successes
        assert!(!pipeline.regenerate_image("t1", &page, false, &RunContext::default()).is_success());
        assert!(pipeline.regenerate_image("t1", &page, false, &RunContext::default()).is_success());
        let before = pipeline.store().load("t1")?.expect("state saved");
        assert!(pipeline.regenerate_image("t1", &page, false, &RunContext::default()).is_success());
        assert_eq!(stub.calls_for("redo me"), 3);

        let after = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(after.outcome(1), Some(PageOutcome::Generated));
        assert!(after.failed.is_empty());
        assert!(after.updated_at >= before.updated_at);
        Ok(())
    }

    #[test]
    fn failed_regeneration_moves_page_to_failed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        pipeline.store().ensure_task("t1")?;
        let page = Page::new(4, PageKind::Content, "flaky page");
        assert!(pipeline.retry_single_image("t1", &page, false).is_success());

        let stub = Arc::new(ScriptedGenerator::default().always_fail("flaky", true));
        let pipeline = ImagePipeline::new(stub, Arc::new(TaskStore::new(temp.path())), PipelineOptions::default());
        let result = pipeline.regenerate_image("t1", &page, false, &RunContext::default());
        assert!(!result.is_success());

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.outcome(4), Some(PageOutcome::Failed));
        assert!(temp.path().join("t1").join("4.png").is_file());
        Ok(())
    }

    #[test]
    fn retry_on_unknown_task_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stub = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(stub.clone(), temp.path());
        let result = pipeline.retry_single_image("ghost", &Page::new(0, PageKind::Cover, "x"), true);
        assert!(matches!(
            result,
            PageResult::Failed {
                kind: PageErrorKind::ValidationError,
                retryable: false,
                ..
            }
        ));
        assert!(stub.calls.lock().unwrap().is_empty());
        Ok(())
    }

    /// Answers every request with bytes that are not an image.
    struct GarbageGenerator;

    impl ImageGenerator for GarbageGenerator {
        fn name(&self) -> &str {
            "garbage"
        }

        fn validate_config(&self) -> bool {
            true
        }

        fn generate_image(&self, _request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
            Ok(b"<html>not an image</html>".to_vec())
        }
    }

    /// Panics on prompts containing "explode", otherwise behaves like dry-run.
    struct PanickingGenerator;

    impl ImageGenerator for PanickingGenerator {
        fn name(&self) -> &str {
            "panicking"
        }

        fn validate_config(&self) -> bool {
            true
        }

        fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
            if request.prompt.contains("explode") {
                panic!("decoder blew up");
            }
            DryrunGenerator::new().generate_image(request)
        }
    }

    fn seed_cover(store: &TaskStore, task_id: &str) -> anyhow::Result<()> {
        let cover = DryrunGenerator::new().generate_image(&ImageRequest::new("cover"))?;
        store.write_image(task_id, "0.png", &cover)?;
        store.record_success(task_id, 0, GeneratedImage::new(0, &cover, None))?;
        Ok(())
    }

    #[test]
    fn undecodable_provider_bytes_fail_the_page() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(GarbageGenerator), temp.path());

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("t1", pages(&["cover", "slide"])), StopFlag::new())
            .collect();

        assert_eq!(outcome_indices(&events), vec![(0, false), (1, false)]);
        for event in events.iter().filter(|event| event.is_page_outcome()) {
            assert!(event.retryable());
            assert_eq!(event.payload()["kind"], serde_json::json!("provider_error"));
        }
        match events.last() {
            Some(GenerationEvent::Finish(summary)) => {
                assert_eq!((summary.completed, summary.failed), (0, 2));
            }
            other => panic!("expected finish, got {other:?}"),
        }

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert!(state.generated.is_empty());
        assert!(state.cover_image.is_none());
        assert!(!temp.path().join("t1").join("0.png").exists());
        Ok(())
    }

    #[test]
    fn unwritable_image_path_is_a_storage_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(ScriptedGenerator::default()), temp.path());
        fs::create_dir_all(temp.path().join("t1").join("1.png"))?;

        let events: Vec<GenerationEvent> = pipeline
            .generate_images(run_request("t1", pages(&["cover", "slide"])), StopFlag::new())
            .collect();

        assert_eq!(outcome_indices(&events), vec![(0, true), (1, false)]);
        let error = events
            .iter()
            .find(|event| event.index() == Some(1) && event.is_page_outcome())
            .expect("page 1 outcome");
        assert_eq!(error.payload()["kind"], serde_json::json!("storage_error"));
        assert!(error.retryable());

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(state.failed[&1].kind, PageErrorKind::StorageError);
        Ok(())
    }

    #[test]
    fn panicking_page_in_batch_retry_does_not_stop_the_others() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(PanickingGenerator), temp.path());
        seed_cover(pipeline.store(), "t1")?;

        let retry_pages = vec![
            Page::new(1, PageKind::Content, "explode here"),
            Page::new(2, PageKind::Content, "calm page"),
        ];
        let events: Vec<GenerationEvent> = pipeline
            .retry_failed_images("t1", retry_pages, StopFlag::new())
            .collect();

        let mut outcomes = outcome_indices(&events);
        outcomes.sort();
        assert_eq!(outcomes, vec![(1, false), (2, true)]);
        let crash = events
            .iter()
            .find(|event| event.index() == Some(1) && event.is_page_outcome())
            .expect("page 1 outcome");
        assert_eq!(crash.payload()["kind"], serde_json::json!("worker_crash"));
        assert!(crash.payload()["message"]
            .as_str()
            .unwrap_or_default()
            .contains("decoder blew up"));
        assert!(matches!(events.last(), Some(GenerationEvent::Finish(_))));

        let state = pipeline.store().load("t1")?.expect("state saved");
        assert_eq!(state.generated.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(state.failed[&1].kind, PageErrorKind::WorkerCrash);
        Ok(())
    }
}
