//! Job registry: authoritative in-memory store of job records.
//!
//! Jobs are created here at submission, handed to workers through a FIFO
//! queue, and mutated only through the typed update call by the worker that
//! owns them. Reads take cloned snapshots. A janitor task evicts terminal
//! records past their retention window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::jobs::{now_ms, Job, JobStatus, TranscodeMode, TranscodeRequest};

/// Hard cap on jobs held in the registry.
pub const MAX_JOBS: usize = 50;

/// Hard cap on terminal-but-retained records.
pub const MAX_TERMINAL_RETAINED: usize = 10;

/// Terminal records older than this are evicted by the janitor.
pub const TERMINAL_TTL: Duration = Duration::from_secs(120);

/// Janitor sweep period.
pub const JANITOR_PERIOD: Duration = Duration::from_secs(60);

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unknown job id.
    #[error("job not found")]
    NotFound,

    /// The registry is at its job cap.
    #[error("job capacity reached ({0} jobs)")]
    Capacity(usize),

    /// The operation requires a non-terminal (or terminal) job.
    #[error("job is already {0}")]
    InvalidState(JobStatus),

    /// The queue to the dispatcher is gone.
    #[error("dispatcher queue closed")]
    QueueClosed,
}

/// Counts of non-terminal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCounts {
    pub queued: usize,
    pub processing: usize,
}

/// The authoritative job store.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    queue_tx: mpsc::Sender<String>,
    bus: Arc<ProgressBus>,
    base_url: String,
    temp_root: PathBuf,
}

impl JobRegistry {
    /// Create the registry and the dispatcher's receiving end of the queue.
    pub fn new(
        bus: Arc<ProgressBus>,
        base_url: String,
        temp_root: PathBuf,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (queue_tx, queue_rx) = mpsc::channel(MAX_JOBS);
        let registry = Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            queue_tx,
            bus,
            base_url,
            temp_root,
        });
        (registry, queue_rx)
    }

    /// Root under which all job working directories live.
    pub fn temp_root(&self) -> &PathBuf {
        &self.temp_root
    }

    /// Base URL used when rendering stream/download links.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit a validated request, creating a queued job.
    ///
    /// Stream and abr jobs get their stream URL immediately so that it is
    /// available no later than entry into processing.
    pub async fn submit(&self, request: TranscodeRequest) -> Result<Job, RegistryError> {
        let id = Uuid::new_v4().to_string();
        let working_dir = self.temp_root.join(&id);

        let mut job = Job::new(id.clone(), request, working_dir);
        if matches!(
            job.request.mode,
            TranscodeMode::Stream | TranscodeMode::Abr
        ) {
            job.stream_url = Some(format!("{}/stream/{}/master.m3u8", self.base_url, id));
        }

        {
            let mut jobs = self.jobs.write().await;
            if jobs.len() >= MAX_JOBS {
                return Err(RegistryError::Capacity(MAX_JOBS));
            }
            jobs.insert(id.clone(), job.clone());
        }

        if self.queue_tx.send(id.clone()).await.is_err() {
            self.jobs.write().await.remove(&id);
            return Err(RegistryError::QueueClosed);
        }

        info!(job_id = %id, source = %job.request.source, mode = %job.request.mode, "job submitted");
        Ok(job)
    }

    /// Snapshot of one job.
    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Snapshot of one job, recording the client access.
    pub async fn get_touch(&self, id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id)?;
        job.touch_access();
        Some(job.clone())
    }

    /// Record a client access without returning the record.
    pub async fn touch(&self, id: &str) {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            job.touch_access();
        }
    }

    /// Typed mutation entry point. The worker that owns a job is the only
    /// caller for processing jobs; the closure runs under the write lock.
    pub async fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(id).map(f)
    }

    /// Cancel a job.
    ///
    /// Queued jobs transition to cancelled synchronously; processing jobs
    /// have their cancel signal fired and the owning worker completes the
    /// transition. Terminal jobs cannot be cancelled.
    pub async fn cancel(&self, id: &str) -> Result<JobStatus, RegistryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(RegistryError::NotFound)?;

        match job.status {
            JobStatus::Queued => {
                job.set_status(JobStatus::Cancelled);
                job.cancel.cancel();
                let status = job.status;
                drop(jobs);
                self.bus.publish_status(id, JobStatus::Cancelled, None);
                info!(job_id = %id, "queued job cancelled");
                Ok(status)
            }
            JobStatus::Processing => {
                job.cancel.cancel();
                info!(job_id = %id, "cancel signal fired");
                Ok(JobStatus::Processing)
            }
            terminal => Err(RegistryError::InvalidState(terminal)),
        }
    }

    /// Delete a job, removing the record and its working directory.
    ///
    /// Active jobs are implicitly cancelled first; their worker will find
    /// the record gone and stop quietly.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get(id).ok_or(RegistryError::NotFound)?;
            if !job.is_terminal() {
                job.cancel.cancel();
            }
            jobs.remove(id)
        };

        if let Some(job) = removed {
            remove_workdir(&job.working_dir);
            info!(job_id = %id, "job deleted");
        }
        Ok(())
    }

    /// Snapshot of every job.
    pub async fn snapshot(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Counts of queued and processing jobs.
    pub async fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                _ => {}
            }
        }
        counts
    }

    /// Number of jobs currently processing.
    pub async fn processing_count(&self) -> u32 {
        self.counts().await.processing as u32
    }

    /// One janitor sweep: evict terminal records past the TTL and trim the
    /// terminal-retained set to its cap, oldest first.
    ///
    /// Returns the ids that were evicted.
    pub async fn sweep(&self) -> Vec<String> {
        let now = now_ms();
        let ttl_ms = TERMINAL_TTL.as_millis() as i64;
        let mut evicted: Vec<Job> = Vec::new();

        {
            let mut jobs = self.jobs.write().await;

            let expired: Vec<String> = jobs
                .values()
                .filter(|j| {
                    j.is_terminal()
                        && j.finished_at
                            .map(|t| now - t.max(j.last_accessed) > ttl_ms)
                            .unwrap_or(false)
                })
                .map(|j| j.id.clone())
                .collect();
            for id in expired {
                if let Some(job) = jobs.remove(&id) {
                    evicted.push(job);
                }
            }

            // Enforce the retained-terminal cap, oldest completions first.
            let mut terminal: Vec<(String, i64)> = jobs
                .values()
                .filter(|j| j.is_terminal())
                .map(|j| (j.id.clone(), j.finished_at.unwrap_or(j.updated_at)))
                .collect();
            if terminal.len() > MAX_TERMINAL_RETAINED {
                terminal.sort_by_key(|(_, finished)| *finished);
                let excess = terminal.len() - MAX_TERMINAL_RETAINED;
                for (id, _) in terminal.into_iter().take(excess) {
                    if let Some(job) = jobs.remove(&id) {
                        evicted.push(job);
                    }
                }
            }
        }

        let ids: Vec<String> = evicted.iter().map(|j| j.id.clone()).collect();
        for job in evicted {
            remove_workdir(&job.working_dir);
            debug!(job_id = %job.id, "janitor evicted job");
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "janitor evicted terminal jobs");
        }
        ids
    }

    /// Spawn the periodic janitor task.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Remove working directories under the temp root that have no job.
    ///
    /// Run once at startup; state is in-memory only, so directories left
    /// behind by a previous process are always orphans.
    pub async fn sweep_orphaned_dirs(&self) -> usize {
        let jobs = self.jobs.read().await;
        let known: Vec<String> = jobs.keys().cloned().collect();
        drop(jobs);

        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.temp_root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !known.contains(&name) {
                remove_workdir(&path);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(count = removed, "removed orphaned working directories");
        }
        removed
    }
}

fn remove_workdir(path: &std::path::Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "failed to remove working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionFilter;
    use crate::jobs::{OutputConfig, TranscodeMode};
    use tempfile::TempDir;

    fn make_request(mode: TranscodeMode) -> TranscodeRequest {
        TranscodeRequest {
            source: "http://media.local/video.mkv".to_string(),
            mode,
            output: OutputConfig::default(),
            start_time: 0.0,
            subtitles: Vec::new(),
            callback_url: None,
        }
    }

    fn make_registry(temp: &TempDir) -> (Arc<JobRegistry>, mpsc::Receiver<String>, Arc<ProgressBus>) {
        let bus = ProgressBus::new();
        let (registry, rx) = JobRegistry::new(
            bus.clone(),
            "http://127.0.0.1:8765".to_string(),
            temp.path().to_path_buf(),
        );
        (registry, rx, bus)
    }

    #[tokio::test]
    async fn test_submit_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let (registry, mut rx, _bus) = make_registry(&temp);

        let request = make_request(TranscodeMode::Stream);
        let job = registry.submit(request.clone()).await.unwrap();

        // The stored request is byte-for-byte the submitted one.
        let fetched = registry.get(&job.id).await.unwrap();
        assert_eq!(fetched.request, request);
        assert_eq!(fetched.status, JobStatus::Queued);

        // The id is queued for the dispatcher.
        assert_eq!(rx.recv().await.unwrap(), job.id);
    }

    #[tokio::test]
    async fn test_stream_url_set_at_submit_for_stream_modes() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        let url = job.stream_url.expect("stream job gets a stream url");
        assert_eq!(
            url,
            format!("http://127.0.0.1:8765/stream/{}/master.m3u8", job.id)
        );

        let job = registry.submit(make_request(TranscodeMode::Abr)).await.unwrap();
        assert!(job.stream_url.is_some());

        let job = registry.submit(make_request(TranscodeMode::Batch)).await.unwrap();
        assert!(job.stream_url.is_none());
        assert!(job.download_url.is_none());
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        for _ in 0..MAX_JOBS {
            registry.submit(make_request(TranscodeMode::Batch)).await.unwrap();
        }
        let refused = registry.submit(make_request(TranscodeMode::Batch)).await;
        assert!(matches!(refused, Err(RegistryError::Capacity(_))));
    }

    #[tokio::test]
    async fn test_cancel_queued_is_synchronous_and_broadcast() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, bus) = make_registry(&temp);
        let sub = bus.subscribe(SubscriptionFilter::All).unwrap();

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        let status = registry.cancel(&job.id).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);

        let fetched = registry.get(&job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);
        assert!(fetched.finished_at.is_some());
        assert!(fetched.cancel.is_cancelled());

        match sub.recv().await.unwrap() {
            crate::bus::BusEvent::StatusChange { job_id, data } => {
                assert_eq!(job_id, job.id);
                assert_eq!(data.status, JobStatus::Cancelled);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_processing_fires_signal_only() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        registry
            .update(&job.id, |j| j.set_status(JobStatus::Processing))
            .await;

        let status = registry.cancel(&job.id).await.unwrap();
        // Externally still processing until the worker observes the signal.
        assert_eq!(status, JobStatus::Processing);

        let fetched = registry.get(&job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);
        assert!(fetched.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_terminal_rejected() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        registry
            .update(&job.id, |j| {
                j.set_status(JobStatus::Processing);
                j.set_status(JobStatus::Ready);
            })
            .await;

        let result = registry.cancel(&job.id).await;
        assert!(matches!(result, Err(RegistryError::InvalidState(JobStatus::Ready))));
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_workdir() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        std::fs::create_dir_all(&job.working_dir).unwrap();
        std::fs::write(job.working_dir.join("segment_00001.ts"), b"data").unwrap();

        registry.cancel(&job.id).await.unwrap();
        registry.delete(&job.id).await.unwrap();

        assert!(registry.get(&job.id).await.is_none());
        assert!(!job.working_dir.exists());
    }

    #[tokio::test]
    async fn test_submit_cancel_delete_leaves_no_files() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        std::fs::create_dir_all(&job.working_dir).unwrap();
        registry.cancel(&job.id).await.unwrap();

        // Cancel alone keeps the artifacts for live HLS clients.
        assert!(job.working_dir.exists());

        registry.delete(&job.id).await.unwrap();
        assert!(!temp.path().join(&job.id).exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_job() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);
        assert!(matches!(
            registry.delete("nope").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_counts() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let a = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        let _b = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        registry
            .update(&a.id, |j| j.set_status(JobStatus::Processing))
            .await;

        let counts = registry.counts().await;
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_terminal_jobs() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        std::fs::create_dir_all(&job.working_dir).unwrap();

        let ttl_ms = TERMINAL_TTL.as_millis() as i64;
        registry
            .update(&job.id, |j| {
                j.set_status(JobStatus::Processing);
                j.set_status(JobStatus::Ready);
                // Age the record past the TTL.
                j.finished_at = Some(now_ms() - ttl_ms - 1_000);
                j.last_accessed = now_ms() - ttl_ms - 1_000;
            })
            .await;

        let evicted = registry.sweep().await;
        assert_eq!(evicted, vec![job.id.clone()]);
        assert!(registry.get(&job.id).await.is_none());
        assert!(!job.working_dir.exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_recently_accessed_jobs() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        let ttl_ms = TERMINAL_TTL.as_millis() as i64;
        registry
            .update(&job.id, |j| {
                j.set_status(JobStatus::Processing);
                j.set_status(JobStatus::Ready);
                j.finished_at = Some(now_ms() - ttl_ms - 1_000);
                // A client is still streaming this job.
                j.last_accessed = now_ms();
            })
            .await;

        let evicted = registry.sweep().await;
        assert!(evicted.is_empty());
        assert!(registry.get(&job.id).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_trims_terminal_cap_oldest_first() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let mut ids = Vec::new();
        for i in 0..(MAX_TERMINAL_RETAINED + 3) {
            let job = registry.submit(make_request(TranscodeMode::Batch)).await.unwrap();
            registry
                .update(&job.id, |j| {
                    j.set_status(JobStatus::Processing);
                    j.set_status(JobStatus::Ready);
                    // Stagger completion times, oldest first; keep all within
                    // the TTL so only the cap rule applies.
                    j.finished_at = Some(now_ms() - 60_000 + i as i64 * 100);
                    j.last_accessed = now_ms();
                })
                .await;
            ids.push(job.id);
        }

        let evicted = registry.sweep().await;
        assert_eq!(evicted.len(), 3);
        // The oldest three completions are the ones evicted.
        for id in &ids[..3] {
            assert!(evicted.contains(id));
        }
        for id in &ids[3..] {
            assert!(registry.get(id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_orphaned_dirs() {
        let temp = TempDir::new().unwrap();
        let (registry, _rx, _bus) = make_registry(&temp);

        let job = registry.submit(make_request(TranscodeMode::Stream)).await.unwrap();
        std::fs::create_dir_all(&job.working_dir).unwrap();
        std::fs::create_dir_all(temp.path().join("stale-job-from-last-run")).unwrap();

        let removed = registry.sweep_orphaned_dirs().await;
        assert_eq!(removed, 1);
        assert!(job.working_dir.exists());
        assert!(!temp.path().join("stale-job-from-last-run").exists());
    }
}
