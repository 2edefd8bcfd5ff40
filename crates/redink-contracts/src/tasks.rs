use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

use crate::events::{now_utc_iso, PageErrorKind};

const STATE_FILE: &str = "task.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),
    #[error("invalid image file name {0:?}")]
    InvalidFileName(String),
    #[error("task state for {task_id} is unreadable: {source}")]
    Corrupt {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub filename: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub sha256: String,
    pub completed_at: String,
}

impl GeneratedImage {
    pub fn new(index: usize, bytes: &[u8], thumbnail: Option<String>) -> Self {
        Self {
            filename: image_filename(index),
            thumbnail,
            sha256: sha256_hex(bytes),
            completed_at: now_utc_iso(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    pub error: String,
    pub kind: PageErrorKind,
    pub retryable: bool,
    pub failed_at: String,
}

impl FailedPage {
    pub fn new(kind: PageErrorKind, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: error.into(),
            kind,
            retryable,
            failed_at: now_utc_iso(),
        }
    }
}

/// Style reference for the task: the first page that generated.
///
/// When that page later fails to regenerate, the cover moves to the lowest
/// remaining generated page, or is cleared if there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub index: usize,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Generated,
    Failed,
}

/// Durable per-task record of page outcomes.
///
/// A page index lives in at most one of `generated` / `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub generated: BTreeMap<usize, GeneratedImage>,
    #[serde(default)]
    pub failed: BTreeMap<usize, FailedPage>,
    #[serde(default)]
    pub cover_image: Option<CoverImage>,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = now_utc_iso();
        Self {
            task_id: task_id.into(),
            created_at: now.clone(),
            updated_at: now,
            generated: BTreeMap::new(),
            failed: BTreeMap::new(),
            cover_image: None,
        }
    }

    /// Returns true when this success became the task's cover.
    pub fn apply_success(&mut self, index: usize, image: GeneratedImage) -> bool {
        self.failed.remove(&index);
        let became_cover = self.cover_image.is_none();
        if became_cover {
            self.cover_image = Some(CoverImage {
                index,
                filename: image.filename.clone(),
            });
        }
        self.generated.insert(index, image);
        became_cover
    }

    pub fn apply_failure(&mut self, index: usize, failure: FailedPage) {
        self.generated.remove(&index);
        self.failed.insert(index, failure);
        if self.cover_image.as_ref().map(|cover| cover.index) == Some(index) {
            self.cover_image = self
                .generated
                .iter()
                .next()
                .map(|(index, image)| CoverImage {
                    index: *index,
                    filename: image.filename.clone(),
                });
        }
    }

    pub fn outcome(&self, index: usize) -> Option<PageOutcome> {
        if self.generated.contains_key(&index) {
            Some(PageOutcome::Generated)
        } else if self.failed.contains_key(&index) {
            Some(PageOutcome::Failed)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            generated: self
                .generated
                .iter()
                .map(|(index, image)| (*index, image.filename.clone()))
                .collect(),
            failed: self.failed.clone(),
            has_cover: self.cover_image.is_some(),
        }
    }
}

/// Client-facing view of a task; never includes image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub generated: BTreeMap<usize, String>,
    pub failed: BTreeMap<usize, FailedPage>,
    pub has_cover: bool,
}

/// Filesystem-backed task state, one directory per task under `root`.
///
/// Writers for one task id serialize on a per-task lock; readers see either
/// the previous or the next `task.json`, never a partial one.
#[derive(Debug)]
pub struct TaskStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        validate_task_id(task_id)?;
        Ok(self.root.join(task_id))
    }

    pub fn events_path(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.task_dir(task_id)?.join(EVENTS_FILE))
    }

    pub fn load(&self, task_id: &str) -> Result<Option<TaskState>, StoreError> {
        let path = self.task_dir(task_id)?.join(STATE_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::io(
                    format!("failed reading {}", path.display()),
                    err,
                ))
            }
        };
        let state = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            task_id: task_id.to_string(),
            source,
        })?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &TaskState) -> Result<(), StoreError> {
        let path = self.task_dir(&state.task_id)?.join(STATE_FILE);
        let body = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            task_id: state.task_id.clone(),
            source,
        })?;
        write_atomic(&path, &body)?;
        tracing::debug!(
            task_id = %state.task_id,
            generated = state.generated.len(),
            failed = state.failed.len(),
            "task state saved"
        );
        Ok(())
    }

    /// Load-modify-save under the task's writer lock. Creates the task on first use.
    pub fn update<F>(&self, task_id: &str, mutate: F) -> Result<TaskState, StoreError>
    where
        F: FnOnce(&mut TaskState),
    {
        self.with_task_lock(task_id, || {
            let mut state = self
                .load(task_id)?
                .unwrap_or_else(|| TaskState::new(task_id));
            mutate(&mut state);
            state.updated_at = now_utc_iso();
            self.save(&state)?;
            Ok(state)
        })
    }

    pub fn ensure_task(&self, task_id: &str) -> Result<TaskState, StoreError> {
        if let Some(state) = self.load(task_id)? {
            return Ok(state);
        }
        self.update(task_id, |_| {})
    }

    pub fn record_success(
        &self,
        task_id: &str,
        index: usize,
        image: GeneratedImage,
    ) -> Result<TaskState, StoreError> {
        self.update(task_id, |state| {
            if state.apply_success(index, image) {
                tracing::info!(task_id, index, "cover image set");
            }
        })
    }

    pub fn record_failure(
        &self,
        task_id: &str,
        index: usize,
        failure: FailedPage,
    ) -> Result<TaskState, StoreError> {
        self.update(task_id, |state| state.apply_failure(index, failure))
    }

    pub fn snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>, StoreError> {
        Ok(self.load(task_id)?.map(|state| state.snapshot()))
    }

    pub fn write_image(
        &self,
        task_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        validate_file_name(filename)?;
        let path = self.task_dir(task_id)?.join(filename);
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    pub fn read_image(&self, task_id: &str, filename: &str) -> Result<Vec<u8>, StoreError> {
        validate_file_name(filename)?;
        let path = self.task_dir(task_id)?.join(filename);
        fs::read(&path).map_err(|err| StoreError::io(format!("failed reading {}", path.display()), err))
    }

    /// Bytes of the task's cover, if one has been generated.
    pub fn cover_bytes(&self, task_id: &str) -> Result<Option<(usize, Vec<u8>)>, StoreError> {
        let Some(cover) = self.load(task_id)?.and_then(|state| state.cover_image) else {
            return Ok(None);
        };
        let bytes = self.read_image(task_id, &cover.filename)?;
        Ok(Some((cover.index, bytes)))
    }

    /// Resolve an image for serving; thumbnails fall back to the full image.
    pub fn image_path(
        &self,
        task_id: &str,
        filename: &str,
        thumbnail: bool,
    ) -> Result<Option<PathBuf>, StoreError> {
        validate_file_name(filename)?;
        let dir = self.task_dir(task_id)?;
        if thumbnail {
            let thumb = dir.join(format!("thumb_{filename}"));
            if thumb.is_file() {
                return Ok(Some(thumb));
            }
        }
        let full = dir.join(filename);
        Ok(full.is_file().then_some(full))
    }

    pub fn list_tasks(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::io(
                    format!("failed listing {}", self.root.display()),
                    err,
                ))
            }
        };
        let mut ids = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(STATE_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|id| validate_task_id(id).is_ok())
            .collect::<Vec<String>>();
        ids.sort();
        Ok(ids)
    }

    pub fn with_task_lock<T>(&self, task_id: &str, body: impl FnOnce() -> T) -> T {
        self.with_lock(task_id.to_string(), body)
    }

    /// Serializes generate-and-persist for one page across concurrent runs.
    pub fn with_page_lock<T>(&self, task_id: &str, index: usize, body: impl FnOnce() -> T) -> T {
        self.with_lock(format!("{task_id}#{index}"), body)
    }

    fn with_lock<T>(&self, key: String, body: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            body()
        };
        // Entries are only cloned under the table lock, so a count of two
        // (table + this call) means nobody else is waiting on the key.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }
}

pub fn generate_task_id() -> String {
    format!("task_{}", Uuid::new_v4().simple())
}

pub fn image_filename(index: usize) -> String {
    format!("{index}.png")
}

pub fn thumbnail_filename(index: usize) -> String {
    format!("thumb_{index}.png")
}

pub fn image_url(task_id: &str, index: usize) -> String {
    format!("/api/images/{task_id}/{}", image_filename(index))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_task_id(task_id: &str) -> Result<(), StoreError> {
    let ok = !task_id.is_empty()
        && task_id.len() <= 128
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidTaskId(task_id.to_string()))
    }
}

fn validate_file_name(filename: &str) -> Result<(), StoreError> {
    let ok = !filename.is_empty()
        && !filename.starts_with('.')
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidFileName(filename.to_string()))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::io(format!("{} has no parent", path.display()), io::ErrorKind::InvalidInput.into()))?;
    fs::create_dir_all(dir)
        .map_err(|err| StoreError::io(format!("failed creating {}", dir.display()), err))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| StoreError::io(format!("failed staging write in {}", dir.display()), err))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| StoreError::io(format!("failed writing {}", path.display()), err))?;
    tmp.persist(path)
        .map_err(|err| StoreError::io(format!("failed replacing {}", path.display()), err.error))?;
    Ok(())
}
