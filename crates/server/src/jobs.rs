//! Job queue and single-slot indexing worker.
//!
//! Jobs are a persisted FIFO: one JSON file per job in the `jobs`
//! directory, written via temp + rename on every state transition. At
//! most one job is ever `running`; the worker drains the queue in
//! enqueue order with no preemption. Cancellation of a running job sets
//! a flag the pipeline observes at stage boundaries.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use recall_core::failure::Failure;
use recall_core::types::FolderRecord;
use recall_index::{IndexError, IndexProgress, IndexRequest, PipelineDeps, run_pipeline};

use crate::error::Result;
use crate::folders::FolderManager;

pub const JOBS_DIR: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
  }
}

/// A durable indexing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  /// Canonical folder path this job targets.
  pub folder: String,
  pub status: JobStatus,
  pub request: IndexRequest,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub progress: IndexProgress,
  pub error: Option<Failure>,
}

struct QueueInner {
  pending: VecDeque<String>,
  jobs: HashMap<String, Job>,
  running: Option<String>,
  cancel_tokens: HashMap<String, CancellationToken>,
}

pub struct JobQueue {
  jobs_dir: PathBuf,
  retention: usize,
  inner: Mutex<QueueInner>,
  notify: Notify,
}

impl JobQueue {
  /// Load persisted jobs from the state directory.
  ///
  /// Jobs found in `running` state were interrupted by a previous
  /// shutdown and are marked failed; pending jobs re-enter the queue in
  /// creation order.
  pub async fn load(state_dir: &Path, retention: usize) -> Result<Self> {
    let jobs_dir = state_dir.join(JOBS_DIR);
    tokio::fs::create_dir_all(&jobs_dir).await?;

    let mut jobs: HashMap<String, Job> = HashMap::new();
    let mut entries = tokio::fs::read_dir(&jobs_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      let content = tokio::fs::read_to_string(&path).await?;
      match serde_json::from_str::<Job>(&content) {
        Ok(job) => {
          jobs.insert(job.id.clone(), job);
        }
        Err(e) => warn!(path = %path.display(), err = %e, "Skipping malformed job record"),
      }
    }

    let mut interrupted = Vec::new();
    for job in jobs.values_mut() {
      if job.status == JobStatus::Running {
        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        job.error = Some(Failure::internal("job was interrupted by a server shutdown"));
        interrupted.push(job.clone());
      }
    }

    let mut pending: Vec<&Job> = jobs.values().filter(|j| j.status == JobStatus::Pending).collect();
    pending.sort_by_key(|j| j.created_at);
    let pending: VecDeque<String> = pending.into_iter().map(|j| j.id.clone()).collect();

    info!(
      jobs = jobs.len(),
      pending = pending.len(),
      interrupted = interrupted.len(),
      "Job queue loaded"
    );

    let queue = Self {
      jobs_dir,
      retention,
      inner: Mutex::new(QueueInner {
        pending,
        jobs,
        running: None,
        cancel_tokens: HashMap::new(),
      }),
      notify: Notify::new(),
    };

    for job in interrupted {
      queue.write_job_file(&job).await?;
    }

    Ok(queue)
  }

  /// Create a pending job, persist it, and return its id and queue
  /// position (1-indexed).
  pub async fn enqueue(&self, folder: String, request: IndexRequest) -> Result<(String, usize)> {
    let job = Job {
      id: uuid::Uuid::new_v4().to_string(),
      folder,
      status: JobStatus::Pending,
      request,
      created_at: Utc::now(),
      started_at: None,
      finished_at: None,
      progress: IndexProgress::default(),
      error: None,
    };

    // Persist before the job becomes visible in the queue.
    self.write_job_file(&job).await?;

    let (id, position) = {
      let mut inner = self.inner.lock().expect("queue lock poisoned");
      inner.jobs.insert(job.id.clone(), job.clone());
      inner.pending.push_back(job.id.clone());
      (job.id, inner.pending.len())
    };

    debug!(job_id = %id, position, "Job enqueued");
    self.notify.notify_one();
    Ok((id, position))
  }

  pub fn get_job(&self, id: &str) -> Option<Job> {
    self.inner.lock().expect("queue lock poisoned").jobs.get(id).cloned()
  }

  /// O(1) lookup of the currently running job, used by the
  /// folder-removal conflict check.
  pub fn get_running_job(&self) -> Option<Job> {
    let inner = self.inner.lock().expect("queue lock poisoned");
    inner.running.as_ref().and_then(|id| inner.jobs.get(id)).cloned()
  }

  pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
    let inner = self.inner.lock().expect("queue lock poisoned");
    let mut jobs: Vec<Job> = inner
      .jobs
      .values()
      .filter(|j| status.is_none_or(|s| j.status == s))
      .cloned()
      .collect();
    jobs.sort_by_key(|j| j.created_at);
    jobs
  }

  /// Queue depth (pending jobs).
  pub fn depth(&self) -> usize {
    self.inner.lock().expect("queue lock poisoned").pending.len()
  }

  /// Cancel a job: pending jobs leave the queue immediately; running
  /// jobs get their cancellation flag set and transition once the
  /// pipeline observes it at a stage boundary.
  pub async fn cancel(&self, id: &str) -> Result<()> {
    enum Action {
      Persist(Job),
      Flag(CancellationToken),
    }

    let action = {
      let mut inner = self.inner.lock().expect("queue lock poisoned");
      let Some(job) = inner.jobs.get_mut(id) else {
        return Err(Failure::not_found(format!("job {} is unknown", id)).into());
      };

      match job.status {
        JobStatus::Pending => {
          job.status = JobStatus::Cancelled;
          job.finished_at = Some(Utc::now());
          let job = job.clone();
          inner.pending.retain(|pending| pending != id);
          Action::Persist(job)
        }
        JobStatus::Running => {
          let token = inner
            .cancel_tokens
            .get(id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);
          Action::Flag(token)
        }
        status => {
          return Err(
            Failure::invalid_input(format!("job {} already finished with status {:?}", id, status)).into(),
          );
        }
      }
    };

    match action {
      Action::Persist(job) => {
        info!(job_id = %id, "Cancelled pending job");
        self.write_job_file(&job).await
      }
      Action::Flag(token) => {
        info!(job_id = %id, "Flagged running job for cancellation");
        token.cancel();
        Ok(())
      }
    }
  }

  /// Pop the oldest pending job and mark it running. Returns None when
  /// the queue is empty or a job is already running.
  pub async fn claim_next(&self) -> Result<Option<(Job, CancellationToken)>> {
    let claimed = {
      let mut inner = self.inner.lock().expect("queue lock poisoned");
      if inner.running.is_some() {
        return Ok(None);
      }
      let Some(id) = inner.pending.pop_front() else {
        return Ok(None);
      };

      let token = CancellationToken::new();
      let Some(job) = inner.jobs.get_mut(&id) else {
        return Ok(None);
      };
      job.status = JobStatus::Running;
      job.started_at = Some(Utc::now());
      let job = job.clone();
      inner.running = Some(id.clone());
      inner.cancel_tokens.insert(id, token.clone());
      (job, token)
    };

    self.write_job_file(&claimed.0).await?;
    Ok(Some(claimed))
  }

  /// Update progress counters in memory and flush the record in the
  /// background. Called from the pipeline's stage-boundary callback.
  pub fn update_progress(&self, id: &str, progress: IndexProgress) {
    let snapshot = {
      let mut inner = self.inner.lock().expect("queue lock poisoned");
      let Some(job) = inner.jobs.get_mut(id) else { return };
      job.progress = progress;
      job.clone()
    };

    let jobs_dir = self.jobs_dir.clone();
    tokio::spawn(async move {
      if let Err(e) = write_job_file_at(&jobs_dir, &snapshot).await {
        warn!(job_id = %snapshot.id, err = %e, "Failed to flush job progress");
      }
    });
  }

  pub async fn mark_succeeded(&self, id: &str, progress: IndexProgress) -> Result<()> {
    self
      .finish(id, |job| {
        job.status = JobStatus::Succeeded;
        job.progress = progress;
      })
      .await
  }

  pub async fn mark_failed(&self, id: &str, failure: Failure) -> Result<()> {
    self
      .finish(id, move |job| {
        job.status = JobStatus::Failed;
        job.error = Some(failure);
      })
      .await
  }

  pub async fn mark_cancelled(&self, id: &str) -> Result<()> {
    self
      .finish(id, |job| {
        job.status = JobStatus::Cancelled;
      })
      .await
  }

  async fn finish(&self, id: &str, apply: impl FnOnce(&mut Job)) -> Result<()> {
    let (snapshot, pruned) = {
      let mut inner = self.inner.lock().expect("queue lock poisoned");
      let Some(job) = inner.jobs.get_mut(id) else {
        return Err(Failure::not_found(format!("job {} is unknown", id)).into());
      };
      apply(job);
      job.finished_at = Some(Utc::now());
      let snapshot = job.clone();

      if inner.running.as_deref() == Some(id) {
        inner.running = None;
      }
      inner.cancel_tokens.remove(id);

      (snapshot, prune_terminal(&mut inner, self.retention))
    };

    self.write_job_file(&snapshot).await?;
    for id in pruned {
      let path = self.jobs_dir.join(format!("{}.json", id));
      if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(job_id = %id, err = %e, "Failed to prune job record");
      }
    }
    Ok(())
  }

  /// Wait until new work may be available.
  pub async fn wait_for_work(&self) {
    self.notify.notified().await;
  }

  async fn write_job_file(&self, job: &Job) -> Result<()> {
    write_job_file_at(&self.jobs_dir, job).await
  }
}

/// Drop the oldest terminal jobs beyond the retention bound. Returns the
/// pruned ids; the caller deletes their files outside the lock.
fn prune_terminal(inner: &mut QueueInner, retention: usize) -> Vec<String> {
  let mut terminal: Vec<(DateTime<Utc>, String)> = inner
    .jobs
    .values()
    .filter(|j| j.status.is_terminal())
    .map(|j| (j.finished_at.unwrap_or(j.created_at), j.id.clone()))
    .collect();

  if terminal.len() <= retention {
    return Vec::new();
  }

  terminal.sort_by_key(|(finished, _)| *finished);
  let excess = terminal.len() - retention;
  let pruned: Vec<String> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
  for id in &pruned {
    inner.jobs.remove(id);
  }
  pruned
}

/// Persist one job record via temp file + atomic rename.
async fn write_job_file_at(jobs_dir: &Path, job: &Job) -> Result<()> {
  let path = jobs_dir.join(format!("{}.json", job.id));
  let temp = jobs_dir.join(format!("{}.json.tmp", job.id));
  tokio::fs::write(&temp, serde_json::to_vec_pretty(job)?).await?;
  tokio::fs::rename(&temp, &path).await?;
  Ok(())
}

// ============================================================================
// Worker
// ============================================================================

/// The single indexing worker: drains the queue in enqueue order,
/// running the pipeline for each job and committing the folder manifest
/// on success.
pub struct Worker {
  pub queue: Arc<JobQueue>,
  pub folders: Arc<FolderManager>,
  pub deps: Arc<PipelineDeps>,
}

impl Worker {
  pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(self.run(cancel))
  }

  async fn run(self, cancel: CancellationToken) {
    info!("Indexing worker started");
    loop {
      loop {
        if cancel.is_cancelled() {
          info!("Indexing worker stopped");
          return;
        }
        match self.queue.claim_next().await {
          Ok(Some((job, token))) => self.execute(job, token).await,
          Ok(None) => break,
          Err(e) => {
            error!(err = %e, "Failed to claim next job");
            break;
          }
        }
      }

      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          info!("Indexing worker stopped");
          return;
        }
        _ = self.queue.wait_for_work() => {}
      }
    }
  }

  async fn execute(&self, job: Job, token: CancellationToken) {
    info!(job_id = %job.id, folder = %job.folder, "Job started");
    let previous = self.folders.get_folder(&job.folder).await;

    let queue = Arc::clone(&self.queue);
    let job_id = job.id.clone();
    let callback = move |progress: &IndexProgress| queue.update_progress(&job_id, *progress);
    let progress_fn: &recall_index::pipeline::ProgressFn = &callback;

    let result = run_pipeline(&job.request, previous.as_ref(), self.deps.as_ref(), Some(progress_fn), &token).await;

    let transition = match result {
      Ok(outcome) => {
        let record = FolderRecord {
          path: job.folder.clone(),
          last_indexed: Utc::now(),
          chunk_count: outcome.chunk_ids.len(),
          chunk_ids: outcome.chunk_ids,
          files: outcome.files,
        };
        match self.folders.add_folder(record).await {
          Ok(()) => self.queue.mark_succeeded(&job.id, outcome.progress).await,
          Err(e) => {
            let failure = e.into_failure();
            error!(job_id = %job.id, err = %failure, "Manifest commit failed");
            self.queue.mark_failed(&job.id, failure).await
          }
        }
      }
      Err(IndexError::Cancelled) => {
        info!(job_id = %job.id, "Job cancelled");
        self.queue.mark_cancelled(&job.id).await
      }
      Err(e) => {
        let failure = crate::error::ServerError::Index(e).into_failure();
        warn!(job_id = %job.id, err = %failure, "Job failed");
        self.queue.mark_failed(&job.id, failure).await
      }
    };

    if let Err(e) = transition {
      error!(job_id = %job.id, err = %e, "Failed to persist job transition");
    }
  }
}
