//! Durable, append-only storage for projects, prompts and runs.
//!
//! Each run is one JSON-lines log at `<root>/runs/<run_id>.jsonl`. A record
//! is written with a single `write_all` of a complete line followed by
//! `sync_data`, so a crash can at worst leave an unterminated final line,
//! which is dropped (and truncated away) the next time the log is opened.
//!
//! Writers for the same run are serialized by a per-run async mutex that
//! also guards the materialized [`Run`]; every state check and the append it
//! protects happen inside the same critical section. A log is replayed at
//! most once per store, inside a per-run once-cell, and the file is opened
//! only for the duration of each append.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::model::{
    InferenceStatus, ItemResult, Item, Project, Prompt, Run, RunHeader, RunStatus, RunSummary,
    Validation,
};

const RUNS_DIR: &str = "runs";
const PROJECTS_DIR: &str = "projects";
const PROJECT_FILE: &str = "project.json";
const PROMPTS_FILE: &str = "prompts.jsonl";
const LOG_EXT: &str = "jsonl";
const MAX_PROJECT_NAME: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Created {
        header: RunHeader,
        contexts: Vec<String>,
    },
    Status {
        status: RunStatus,
        at: chrono::DateTime<Utc>,
        #[serde(default)]
        failure: Option<String>,
    },
    Dispatched {
        index: usize,
    },
    Finished(ItemResult),
    Verdict {
        index: usize,
        validation: Validation,
    },
}

/// Check that `record` is a legal next step for `run`.
fn check(run: &Run, record: &LogRecord) -> Result<()> {
    let run_id = run.id();
    let item = |index: usize| -> Result<&Item> {
        run.item(index)
            .ok_or_else(|| EngineError::item_not_found(run_id, index))
    };
    match record {
        LogRecord::Created { .. } => Err(EngineError::InvalidState(format!(
            "run {} already exists",
            run_id
        ))),
        LogRecord::Status { status, .. } => {
            if run.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "run {} is already {:?}",
                    run_id, run.status
                )));
            }
            if *status == RunStatus::Completed && !run.all_items_finished() {
                return Err(EngineError::InvalidState(format!(
                    "run {} still has unfinished items",
                    run_id
                )));
            }
            // A run with every item finished can only end as completed.
            if status.is_terminal() && *status != RunStatus::Completed && run.all_items_finished() {
                return Err(EngineError::InvalidState(format!(
                    "run {} has no unfinished items; it can only be completed",
                    run_id
                )));
            }
            Ok(())
        }
        LogRecord::Dispatched { index } => {
            if run.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "run {} is {:?}; no further dispatch",
                    run_id, run.status
                )));
            }
            if item(*index)?.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "item {} of run {} already finished",
                    index, run_id
                )));
            }
            Ok(())
        }
        LogRecord::Finished(result) => {
            if run.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "run {} is {:?}; responses are immutable",
                    run_id, run.status
                )));
            }
            if item(result.index)?.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "item {} of run {} already finished",
                    result.index, run_id
                )));
            }
            Ok(())
        }
        LogRecord::Verdict { index, .. } => {
            let status = item(*index)?.status;
            if status != InferenceStatus::Succeeded {
                return Err(EngineError::InvalidState(format!(
                    "item {} of run {} is {:?}; only succeeded items can be validated",
                    index, run_id, status
                )));
            }
            Ok(())
        }
    }
}

fn apply(run: &mut Run, record: &LogRecord) {
    match record {
        LogRecord::Created { .. } => {}
        LogRecord::Status {
            status,
            at,
            failure,
        } => {
            run.status = *status;
            if status.is_terminal() {
                run.finished_at = Some(*at);
            }
            if failure.is_some() {
                run.failure = failure.clone();
            }
        }
        LogRecord::Dispatched { index } => {
            if let Some(item) = run.items.get_mut(*index) {
                item.status = InferenceStatus::InFlight;
            }
        }
        LogRecord::Finished(result) => {
            if let Some(item) = run.items.get_mut(result.index) {
                item.apply_result(result);
            }
        }
        LogRecord::Verdict { index, validation } => {
            if let Some(item) = run.items.get_mut(*index) {
                item.set_validation(validation.clone());
            }
        }
    }
}

struct RunHandle {
    path: PathBuf,
    run: Run,
    /// Set after a failed write; the log tail can no longer be trusted.
    poisoned: bool,
}

impl RunHandle {
    async fn append(&mut self, record: LogRecord) -> Result<()> {
        if self.poisoned {
            return Err(EngineError::Io(std::io::Error::other(format!(
                "run log {} is unusable after an earlier write failure",
                self.path.display()
            ))));
        }
        check(&self.run, &record)?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = match OpenOptions::new().append(true).open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::run_not_found(self.run.id()));
            }
            Err(e) => return Err(e.into()),
        };
        let written = async {
            file.write_all(&line).await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            self.poisoned = true;
            return Err(e.into());
        }
        apply(&mut self.run, &record);
        Ok(())
    }
}

/// Result of replaying a run log.
struct Replayed {
    run: Run,
    /// Byte length of the well-formed prefix.
    valid_len: u64,
    torn: bool,
}

fn replay(path: &Path, data: &[u8]) -> Result<Replayed> {
    let corrupt = |line: usize, message: String| EngineError::Corrupt {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut run: Option<Run> = None;
    let mut offset = 0usize;
    let mut line_no = 0usize;
    let mut torn = false;

    while offset < data.len() {
        line_no += 1;
        let rest = &data[offset..];
        let Some(nl) = rest.iter().position(|b| *b == b'\n') else {
            torn = true;
            break;
        };
        let line = &rest[..nl];
        offset += nl + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: LogRecord = match serde_json::from_slice(line) {
            Ok(r) => r,
            // A garbled last line is a torn write, not corruption.
            Err(_) if data[offset..].iter().all(u8::is_ascii_whitespace) => {
                offset -= nl + 1;
                torn = true;
                break;
            }
            Err(e) => return Err(corrupt(line_no, e.to_string())),
        };
        match (&mut run, record) {
            (None, LogRecord::Created { header, contexts }) => {
                run = Some(Run::new(header, contexts));
            }
            (None, _) => return Err(corrupt(line_no, "log does not start with a run header".into())),
            (Some(r), record) => {
                check(r, &record).map_err(|e| corrupt(line_no, e.to_string()))?;
                apply(r, &record);
            }
        }
    }

    let run = run.ok_or_else(|| corrupt(line_no.max(1), "log has no run header".into()))?;
    Ok(Replayed {
        run,
        valid_len: offset as u64,
        torn,
    })
}

pub(crate) fn validate_project_name(name: &str) -> Result<()> {
    let invalid = |reason| EngineError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_PROJECT_NAME {
        return Err(invalid("name is longer than 128 bytes"));
    }
    if name.starts_with('.') {
        return Err(invalid("name starts with a dot"));
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(invalid("name contains a path separator or control character"));
    }
    Ok(())
}

fn parse_run_id(run_id: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(run_id).map_err(|_| EngineError::run_not_found(run_id))
}

type SharedHandle = Arc<Mutex<RunHandle>>;

pub struct RunStore {
    root: PathBuf,
    runs: DashMap<String, Arc<OnceCell<SharedHandle>>>,
    project_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RunStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RUNS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(PROJECTS_DIR)).await?;
        debug!("Opened run store at {}", root.display());
        Ok(Self {
            root,
            runs: DashMap::new(),
            project_locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &uuid::Uuid) -> PathBuf {
        self.root
            .join(RUNS_DIR)
            .join(format!("{}.{}", run_id, LOG_EXT))
    }

    fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(PROJECTS_DIR).join(name)
    }

    fn project_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ---- projects ----

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        validate_project_name(name)?;
        let dir = self.project_dir(name);
        tokio::fs::create_dir_all(&dir).await?;

        let project = Project {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(PROJECT_FILE))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::DuplicateName(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec_pretty(&project)?).await?;
        file.sync_all().await?;
        info!(project = %name, "Created project");
        Ok(project)
    }

    pub async fn get_project(&self, name: &str) -> Result<Project> {
        validate_project_name(name)?;
        match tokio::fs::read(self.project_dir(name).join(PROJECT_FILE)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::project_not_found(name))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(PROJECTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(PROJECT_FILE);
            match tokio::fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<Project>(&data) {
                    Ok(p) => projects.push(p),
                    Err(e) => warn!("Skipping unreadable project {}: {}", path.display(), e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(projects)
    }

    /// Remove a project together with every run it owns.
    pub async fn delete_project(&self, name: &str) -> Result<usize> {
        self.get_project(name).await?;
        let lock = self.project_lock(name);
        let _guard = lock.lock().await;

        let mut removed = 0;
        for summary in self.list_runs(name).await? {
            let id = parse_run_id(&summary.id)?;
            self.runs.remove(&summary.id);
            match tokio::fs::remove_file(self.run_path(&id)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::fs::remove_dir_all(self.project_dir(name)).await?;
        info!(project = %name, runs = removed, "Deleted project");
        Ok(removed)
    }

    pub async fn add_prompt(&self, project: &str, text: &str) -> Result<Prompt> {
        self.get_project(project).await?;
        let lock = self.project_lock(project);
        let _guard = lock.lock().await;

        let existing = self.list_prompts(project).await?;
        let prompt = Prompt {
            id: format!("prompt_{}", existing.len() + 1),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&prompt)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.project_dir(project).join(PROMPTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        debug!(project, prompt_id = %prompt.id, "Added prompt");
        Ok(prompt)
    }

    pub async fn list_prompts(&self, project: &str) -> Result<Vec<Prompt>> {
        validate_project_name(project)?;
        let path = self.project_dir(project).join(PROMPTS_FILE);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // An unterminated last line is a torn write and is ignored.
        let complete = match data.rfind('\n') {
            Some(end) => &data[..end],
            None => "",
        };
        complete
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| EngineError::Corrupt {
                    path: path.clone(),
                    line: i + 1,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    // ---- runs ----

    pub async fn create_run(&self, header: RunHeader, contexts: Vec<String>) -> Result<Run> {
        self.get_project(&header.project).await?;
        let id = parse_run_id(&header.id)?;
        let path = self.run_path(&id);

        let mut file = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::InvalidState(format!(
                    "run {} already exists",
                    header.id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let run = Run::new(header.clone(), contexts.clone());
        let mut line = serde_json::to_vec(&LogRecord::Created { header, contexts })?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.sync_all().await?;
        drop(file);

        info!(
            run_id = %run.id(),
            project = %run.header.project,
            items = run.items.len(),
            "Created run"
        );
        let handle = Arc::new(Mutex::new(RunHandle {
            path,
            run: run.clone(),
            poisoned: false,
        }));
        self.runs.insert(
            run.id().to_string(),
            Arc::new(OnceCell::new_with(Some(handle))),
        );
        Ok(run)
    }

    /// Shared handle for a run, replaying its log on first use. Concurrent
    /// first uses wait on the same cell, so the log is read and its torn
    /// tail cut exactly once, before any append can reach the file.
    async fn handle(&self, run_id: &str) -> Result<SharedHandle> {
        let id = parse_run_id(run_id)?;
        let cell = self
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let loaded = cell
            .get_or_try_init(|| Self::load_handle(run_id, self.run_path(&id)))
            .await
            .cloned();
        if loaded.is_err() {
            self.runs.remove_if(run_id, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
        }
        loaded
    }

    async fn load_handle(run_id: &str, path: PathBuf) -> Result<SharedHandle> {
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::run_not_found(run_id));
            }
            Err(e) => return Err(e.into()),
        };
        let replayed = replay(&path, &data)?;

        if replayed.torn {
            warn!(
                run_id,
                kept_bytes = replayed.valid_len,
                total_bytes = data.len(),
                "Dropping torn tail of run log"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(replayed.valid_len).await?;
            file.sync_all().await?;
        }

        Ok(Arc::new(Mutex::new(RunHandle {
            path,
            run: replayed.run,
            poisoned: false,
        })))
    }

    async fn append(&self, run_id: &str, record: LogRecord) -> Result<Run> {
        let handle = self.handle(run_id).await?;
        let mut guard = handle.lock().await;
        guard.append(record).await?;
        Ok(guard.run.clone())
    }

    /// Record the outcome of one item's inference.
    pub async fn append_result(&self, run_id: &str, result: ItemResult) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let mut guard = handle.lock().await;
        guard.append(LogRecord::Finished(result)).await
    }

    pub async fn mark_dispatched(&self, run_id: &str, index: usize) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let mut guard = handle.lock().await;
        guard.append(LogRecord::Dispatched { index }).await
    }

    pub async fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        failure: Option<String>,
    ) -> Result<Run> {
        self.append(
            run_id,
            LogRecord::Status {
                status,
                at: Utc::now(),
                failure,
            },
        )
        .await
    }

    /// Write verdict fields for an item. Fails unless the item's inference
    /// has succeeded at the moment of writing.
    pub async fn record_verdict(
        &self,
        run_id: &str,
        index: usize,
        validation: Validation,
    ) -> Result<Item> {
        let run = self
            .append(run_id, LogRecord::Verdict { index, validation })
            .await?;
        run.item(index)
            .cloned()
            .ok_or_else(|| EngineError::item_not_found(run_id, index))
    }

    /// Current state of a run, including items appended so far.
    pub async fn load(&self, run_id: &str) -> Result<Run> {
        let handle = self.handle(run_id).await?;
        let guard = handle.lock().await;
        Ok(guard.run.clone())
    }

    pub async fn list_runs(&self, project: &str) -> Result<Vec<RunSummary>> {
        let summaries = self.all_runs().await?;
        let mut runs: Vec<RunSummary> = summaries
            .into_iter()
            .filter(|s| s.project == project)
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    /// Summaries of every run on disk, in no particular order.
    pub async fn all_runs(&self) -> Result<Vec<RunSummary>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(RUNS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let cached = self.runs.get(stem).and_then(|c| c.get().cloned());
            if let Some(h) = cached {
                out.push(h.lock().await.run.summary());
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match replay(&path, &data) {
                Ok(r) => out.push(r.run.summary()),
                Err(e) => warn!("Skipping unreadable run log: {}", e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verdict;

    fn header(project: &str) -> RunHeader {
        RunHeader {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.into(),
            prompt_id: None,
            prompt: "Answer yes or no".into(),
            endpoint: "http://localhost:11434/api/generate".into(),
            model: "llama3.2".into(),
            context_digest: "d".into(),
            created_at: Utc::now(),
            source: None,
        }
    }

    async fn store_with_project(dir: &Path) -> RunStore {
        let store = RunStore::open(dir).await.unwrap();
        store.create_project("demo").await.unwrap();
        store
    }

    fn contexts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ctx-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_duplicate_project_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let err = store.create_project("demo").await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateName(ref n) if n == "demo"));
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_project_name_validation() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        for bad in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                store.create_project(bad).await,
                Err(EngineError::InvalidName { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_prompts_numbered_per_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let p1 = store.add_prompt("demo", "first").await.unwrap();
        let p2 = store.add_prompt("demo", "second").await.unwrap();
        assert_eq!(p1.id, "prompt_1");
        assert_eq!(p2.id, "prompt_2");
        let listed = store.list_prompts("demo").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].text, "second");
    }

    #[tokio::test]
    async fn test_run_requires_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let err = store.create_run(header("ghost"), contexts(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_visible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let h = header("demo");
        let run_id = h.id.clone();
        {
            let store = store_with_project(dir.path()).await;
            store.create_run(h, contexts(3)).await.unwrap();
            store.set_status(&run_id, RunStatus::Running, None).await.unwrap();
            store.mark_dispatched(&run_id, 1).await.unwrap();
            store
                .append_result(&run_id, ItemResult::succeeded(1, "yes".into(), 1, 12))
                .await
                .unwrap();
        }

        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store.load(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.items[1].status, InferenceStatus::Succeeded);
        assert_eq!(run.items[1].response.as_deref(), Some("yes"));
        assert_eq!(run.items[0].status, InferenceStatus::Queued);
        assert_eq!(run.items[2].status, InferenceStatus::Queued);
    }

    #[tokio::test]
    async fn test_torn_tail_dropped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let h = header("demo");
        let run_id = h.id.clone();
        let path;
        {
            let store = store_with_project(dir.path()).await;
            store.create_run(h, contexts(2)).await.unwrap();
            store
                .append_result(&run_id, ItemResult::succeeded(0, "first".into(), 1, 3))
                .await
                .unwrap();
            path = store.run_path(&parse_run_id(&run_id).unwrap());
        }
        let mut f = OpenOptions::new().append(true).open(&path).await.unwrap();
        f.write_all(br#"{"record":"finished","index":1,"outc"#)
            .await
            .unwrap();
        drop(f);

        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store.load(&run_id).await.unwrap();
        assert_eq!(run.items[0].status, InferenceStatus::Succeeded);
        assert_eq!(run.items[1].status, InferenceStatus::Queued);

        store
            .append_result(&run_id, ItemResult::succeeded(1, "second".into(), 1, 3))
            .await
            .unwrap();
        let reopened = RunStore::open(dir.path()).await.unwrap();
        let run = reopened.load(&run_id).await.unwrap();
        assert_eq!(run.items[1].response.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = header("demo");
        let run_id = h.id.clone();
        let path;
        {
            let store = store_with_project(dir.path()).await;
            store.create_run(h, contexts(1)).await.unwrap();
            path = store.run_path(&parse_run_id(&run_id).unwrap());
        }
        let mut f = OpenOptions::new().append(true).open(&path).await.unwrap();
        f.write_all(b"garbage\n{\"record\":\"dispatched\",\"index\":0}\n")
            .await
            .unwrap();
        drop(f);

        let store = RunStore::open(dir.path()).await.unwrap();
        let err = store.load(&run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Corrupt { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_finished_item_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(1)).await.unwrap();
        store
            .append_result(&run_id, ItemResult::succeeded(0, "a".into(), 1, 1))
            .await
            .unwrap();
        let err = store
            .append_result(&run_id, ItemResult::succeeded(0, "b".into(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        let run = store.load(&run_id).await.unwrap();
        assert_eq!(run.items[0].response.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_terminal_run_rejects_results_but_accepts_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(2)).await.unwrap();
        store
            .append_result(&run_id, ItemResult::succeeded(0, "a".into(), 1, 1))
            .await
            .unwrap();
        store.set_status(&run_id, RunStatus::Cancelled, None).await.unwrap();

        let err = store
            .append_result(&run_id, ItemResult::succeeded(1, "late".into(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let item = store
            .record_verdict(&run_id, 0, Validation::manual(Verdict::Pass, None))
            .await
            .unwrap();
        assert_eq!(item.verdict(), Verdict::Pass);
    }

    #[tokio::test]
    async fn test_completed_requires_all_items_finished() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(2)).await.unwrap();
        store
            .append_result(&run_id, ItemResult::errored(0, "boom".into(), 1, 1))
            .await
            .unwrap();
        assert!(store
            .set_status(&run_id, RunStatus::Completed, None)
            .await
            .is_err());
        store
            .append_result(&run_id, ItemResult::succeeded(1, "ok".into(), 1, 1))
            .await
            .unwrap();
        let run = store
            .set_status(&run_id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finished_run_can_only_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;

        let empty = header("demo");
        let empty_id = empty.id.clone();
        store.create_run(empty, Vec::new()).await.unwrap();
        for status in [RunStatus::Cancelled, RunStatus::Failed] {
            assert!(matches!(
                store.set_status(&empty_id, status, None).await,
                Err(EngineError::InvalidState(_))
            ));
        }
        let run = store
            .set_status(&empty_id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(1)).await.unwrap();
        store.set_status(&run_id, RunStatus::Running, None).await.unwrap();
        store
            .append_result(&run_id, ItemResult::errored(0, "boom".into(), 1, 1))
            .await
            .unwrap();
        assert!(store
            .set_status(&run_id, RunStatus::Cancelled, None)
            .await
            .is_err());
        assert_eq!(store.load(&run_id).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_load_races_with_append_on_torn_log() {
        let dir = tempfile::tempdir().unwrap();
        store_with_project(dir.path()).await;
        for _ in 0..25 {
            let h = header("demo");
            let run_id = h.id.clone();
            let path = {
                let store = RunStore::open(dir.path()).await.unwrap();
                store.create_run(h, contexts(2)).await.unwrap();
                store.run_path(&parse_run_id(&run_id).unwrap())
            };
            let mut f = OpenOptions::new().append(true).open(&path).await.unwrap();
            f.write_all(br#"{"record":"dispatched","ind"#).await.unwrap();
            drop(f);

            let store = Arc::new(RunStore::open(dir.path()).await.unwrap());
            let writer = {
                let store = store.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move {
                    store
                        .append_result(&run_id, ItemResult::succeeded(0, "kept".into(), 1, 1))
                        .await
                })
            };
            let reader = {
                let store = store.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move { store.load(&run_id).await })
            };
            writer.await.unwrap().unwrap();
            reader.await.unwrap().unwrap();

            let reopened = RunStore::open(dir.path()).await.unwrap();
            let run = reopened.load(&run_id).await.unwrap();
            assert_eq!(run.items[0].response.as_deref(), Some("kept"));
        }
    }

    #[tokio::test]
    async fn test_append_writes_through_the_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(2)).await.unwrap();
        store
            .append_result(&run_id, ItemResult::succeeded(0, "a".into(), 1, 1))
            .await
            .unwrap();

        // No descriptor is held between appends: once the log is gone, a
        // write cannot silently land in an unlinked file.
        let path = store.run_path(&parse_run_id(&run_id).unwrap());
        tokio::fs::remove_file(&path).await.unwrap();
        let err = store
            .append_result(&run_id, ItemResult::succeeded(1, "b".into(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_verdict_requires_succeeded_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(2)).await.unwrap();
        store
            .append_result(&run_id, ItemResult::errored(0, "boom".into(), 1, 1))
            .await
            .unwrap();

        for index in [0, 1] {
            let err = store
                .record_verdict(&run_id, index, Validation::manual(Verdict::Fail, None))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidState(_)));
        }
        let err = store
            .record_verdict(&run_id, 9, Validation::manual(Verdict::Fail, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        assert!(matches!(
            store.load("../../etc/passwd").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            store.load(&uuid::Uuid::new_v4().to_string()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_runs_ordered_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store.create_project("other").await.unwrap();

        let mut ids = Vec::new();
        for offset in [2i64, 0, 1] {
            let mut h = header("demo");
            h.created_at = Utc::now() + chrono::Duration::seconds(offset);
            ids.push((offset, h.id.clone()));
            store.create_run(h, contexts(1)).await.unwrap();
        }
        store.create_run(header("other"), contexts(1)).await.unwrap();

        ids.sort();
        let expected: Vec<String> = ids.into_iter().map(|(_, id)| id).collect();
        let listed: Vec<String> = store
            .list_runs("demo")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_with_project(dir.path()).await);
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(32)).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = store.clone();
            let run_id = run_id.clone();
            tasks.spawn(async move {
                store
                    .append_result(&run_id, ItemResult::succeeded(i, format!("r{}", i), 1, 1))
                    .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        let reopened = RunStore::open(dir.path()).await.unwrap();
        let run = reopened.load(&run_id).await.unwrap();
        for (i, item) in run.items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.response.as_deref(), Some(format!("r{}", i).as_str()));
        }
    }

    #[tokio::test]
    async fn test_delete_project_removes_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let h = header("demo");
        let run_id = h.id.clone();
        store.create_run(h, contexts(1)).await.unwrap();

        assert_eq!(store.delete_project("demo").await.unwrap(), 1);
        assert!(matches!(
            store.load(&run_id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(store.list_projects().await.unwrap().is_empty());
        store.create_project("demo").await.unwrap();
    }
}
