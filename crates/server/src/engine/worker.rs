//! Dispatcher and per-job workers.
//!
//! A single coordinator pulls the oldest queued job while the admission
//! controller allows and hands it to a fresh worker task. The worker owns
//! the job for its whole active life: it prepares the working directory,
//! plans the invocation, supervises the encoder subprocess with stall and
//! cancel watchdogs, applies the retry and hardware-fallback policy, and
//! drives every registry update and bus event for the job.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamforge_config::{HardwareConfig, TranscodingConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission;
use crate::bus::{ProgressBus, ProgressPayload};
use crate::engine::classify::{classify, ErrorClass};
use crate::engine::command::{plan_job, InvocationPlan};
use crate::engine::encoders::select_family;
use crate::engine::probe::probe_source;
use crate::engine::progress::{telemetry_from, EventLimiter, ProgressParser};
use crate::hardware::{Capabilities, HwAccel};
use crate::jobs::{JobStatus, SubtitleTrack, TranscodeMode, TranscodeRequest};
use crate::monitor::SharedSample;
use crate::playlist;
use crate::registry::JobRegistry;
use crate::stats::SharedStats;

/// How often the dispatcher re-consults the admission controller while the
/// head of the queue is blocked.
const ADMISSION_POLL: Duration = Duration::from_millis(500);

/// Grace period between the polite signal and the forced kill.
const GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr tail bound surfaced in error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Longest retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of one supervised encoder run.
#[derive(Debug)]
enum RunOutcome {
    Completed,
    Cancelled,
    Stalled { stderr_tail: String },
    Failed { code: Option<i32>, stderr_tail: String },
}

/// The transcode engine: dispatcher plus worker implementation.
pub struct TranscodeEngine {
    registry: Arc<JobRegistry>,
    bus: Arc<ProgressBus>,
    stats: SharedStats,
    capabilities: Arc<Capabilities>,
    sample: SharedSample,
    transcoding: TranscodingConfig,
    hardware: HardwareConfig,
    ffmpeg_path: PathBuf,
    http: reqwest::Client,
}

impl TranscodeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<JobRegistry>,
        bus: Arc<ProgressBus>,
        stats: SharedStats,
        capabilities: Arc<Capabilities>,
        sample: SharedSample,
        transcoding: TranscodingConfig,
        hardware: HardwareConfig,
        ffmpeg_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            stats,
            capabilities,
            sample,
            transcoding,
            hardware,
            ffmpeg_path,
            http: reqwest::Client::new(),
        })
    }

    /// Spawn the dispatcher over the registry's queue.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        queue_rx: mpsc::Receiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_dispatcher(queue_rx).await })
    }

    async fn run_dispatcher(self: Arc<Self>, mut queue_rx: mpsc::Receiver<String>) {
        info!("dispatcher started");
        while let Some(job_id) = queue_rx.recv().await {
            let admitted = loop {
                // The job may have been cancelled or deleted while queued.
                match self.registry.get(&job_id).await {
                    Some(job) if job.status == JobStatus::Queued => {}
                    _ => break false,
                }

                let sample = self.sample.read().await.clone();
                let active = self.registry.processing_count().await;
                let decision = admission::decide(
                    &self.capabilities,
                    &sample,
                    self.transcoding.max_concurrent_jobs,
                    active,
                );
                if decision.allow {
                    break true;
                }
                debug!(job_id = %job_id, reason = %decision.reason, "admission deferred");
                tokio::time::sleep(ADMISSION_POLL).await;
            };

            if !admitted {
                continue;
            }

            // The transition happens before the worker spawns so the next
            // admission decision sees this slot in use. A cancel racing the
            // admission wait loses here.
            let started = self
                .registry
                .update(&job_id, |job| {
                    if job.status == JobStatus::Queued {
                        job.set_status(JobStatus::Processing);
                        true
                    } else {
                        false
                    }
                })
                .await
                .unwrap_or(false);
            if !started {
                continue;
            }
            self.bus
                .publish_status(&job_id, JobStatus::Processing, None);

            let engine = self.clone();
            let id = job_id.clone();
            tokio::spawn(async move { engine.run_job(id).await });
        }
        info!("dispatcher stopped");
    }

    /// Run one job to a terminal state.
    pub async fn run_job(self: Arc<Self>, job_id: String) {
        let Some(job) = self.registry.get(&job_id).await else {
            return;
        };
        let cancel = job.cancel.clone();
        let request = job.request.clone();
        let working_dir = job.working_dir.clone();

        let media = match probe_source(&request.source).await {
            Ok(media) => media,
            Err(e) => {
                self.finish_error(&job_id, format!("failed to probe source: {}", e))
                    .await;
                return;
            }
        };
        self.registry
            .update(&job_id, |job| job.telemetry.duration_s = media.duration_s)
            .await;

        let mut family = match select_family(
            request.output.hw_accel,
            &self.capabilities,
            self.hardware.prefer_hw_accel,
        ) {
            Ok(family) => family,
            Err(e) => {
                // Explicit unavailable families are rejected at submit; this
                // covers capability drift between submit and start.
                self.finish_error(&job_id, e.to_string()).await;
                return;
            }
        };

        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.finish_cancelled(&job_id).await;
                return;
            }

            if let Err(e) = prepare_workdir(&working_dir) {
                self.finish_error(&job_id, format!("failed to prepare working directory: {}", e))
                    .await;
                return;
            }
            let fetched_subs = self.fetch_subtitles(&request.subtitles, &working_dir).await;

            // Quality factor reflects the machine state at plan time.
            let sample = self.sample.read().await.clone();
            let active = self.registry.processing_count().await;
            let decision = admission::decide(
                &self.capabilities,
                &sample,
                self.transcoding.max_concurrent_jobs,
                active,
            );

            let plan = plan_job(
                &request,
                &media,
                &self.capabilities.tier.limits(),
                &self.transcoding,
                &self.hardware,
                decision.quality_factor,
                family,
                &working_dir,
            );

            self.registry
                .update(&job_id, |job| {
                    job.hw_accel_used = Some(plan.family.as_str().to_string());
                    job.begin_attempt(attempt);
                })
                .await;

            if matches!(request.mode, TranscodeMode::Stream | TranscodeMode::Abr) {
                let master = playlist::master_playlist(&plan.variants, &fetched_subs);
                if let Err(e) = playlist::write_atomic(&plan.output_path, &master) {
                    self.finish_error(&job_id, format!("failed to write master playlist: {}", e))
                        .await;
                    return;
                }
            }

            info!(
                job_id = %job_id,
                attempt,
                encoder = %plan.video_encoder,
                family = %plan.family,
                "starting encoder"
            );

            let mut outcome = RunOutcome::Completed;
            let pass_count = plan.passes.len();
            for (pass_index, pass_args) in plan.passes.iter().enumerate() {
                // Each pass of a multi-pass plan owns an equal share of the
                // 0-100 range so overall progress stays monotonic.
                let span = 1.0 / pass_count as f32;
                let base = pass_index as f32 * 100.0 * span;
                outcome = self
                    .supervise(
                        pass_args,
                        &job_id,
                        &cancel,
                        media.duration_s,
                        request.start_time,
                        base,
                        span,
                    )
                    .await;
                if !matches!(outcome, RunOutcome::Completed) {
                    break;
                }
            }

            let (class, detail) = match outcome {
                RunOutcome::Completed => {
                    self.finish_success(&job_id, &request, &plan).await;
                    return;
                }
                RunOutcome::Cancelled => {
                    self.finish_cancelled(&job_id).await;
                    return;
                }
                RunOutcome::Stalled { stderr_tail } => {
                    let detail = format!(
                        "encoder stalled after {}s without progress. {}",
                        self.transcoding.stall_timeout_s, stderr_tail
                    );
                    (ErrorClass::Transient, detail)
                }
                RunOutcome::Failed { code, stderr_tail } => {
                    let class = classify(&stderr_tail);
                    let detail = match code {
                        Some(code) => format!("encoder exited with code {}: {}", code, stderr_tail),
                        None => format!("encoder terminated by signal: {}", stderr_tail),
                    };
                    (class, detail)
                }
            };

            if class == ErrorClass::Hardware
                && self.hardware.fallback_to_software
                && family != HwAccel::Software
            {
                warn!(job_id = %job_id, family = %family, "hardware encoder failed, replanning on software");
                family = HwAccel::Software;
                attempt = 0;
                continue;
            }

            if class == ErrorClass::Transient && attempt < self.transcoding.retry_count {
                attempt += 1;
                warn!(job_id = %job_id, attempt, "transient encoder failure, retrying");
                // The status event marks the attempt boundary before the
                // progress reset becomes visible.
                self.bus
                    .publish_status(&job_id, JobStatus::Processing, None);
                let backoff = backoff_for_attempt(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.finish_cancelled(&job_id).await;
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }

            self.finish_error(&job_id, bound_tail(&detail, STDERR_TAIL_BYTES))
                .await;
            return;
        }
    }

    /// Supervise one encoder invocation.
    ///
    /// Reads the progress stream, keeps a bounded stderr tail, and runs the
    /// stall and cancel watchdogs alongside. Termination is a polite signal
    /// followed by a forced kill after the grace period.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        args: &[String],
        job_id: &str,
        cancel: &CancellationToken,
        duration_s: f64,
        start_offset_s: f64,
        progress_base: f32,
        progress_span: f32,
    ) -> RunOutcome {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::Failed {
                    code: None,
                    stderr_tail: format!("failed to spawn encoder: {}", e),
                }
            }
        };

        let Some(stdout) = child.stdout.take() else {
            return RunOutcome::Failed {
                code: None,
                stderr_tail: "encoder stdout unavailable".to_string(),
            };
        };
        let Some(stderr) = child.stderr.take() else {
            return RunOutcome::Failed {
                code: None,
                stderr_tail: "encoder stderr unavailable".to_string(),
            };
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let mut parser = ProgressParser::new();
        let mut limiter = EventLimiter::default();
        let mut tail: VecDeque<String> = VecDeque::new();
        let mut tail_bytes = 0usize;

        let stall_timeout = Duration::from_secs(self.transcoding.stall_timeout_s.max(1));
        let mut last_advance = Instant::now();
        let mut last_out_ms: u64 = 0;
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Each branch only reports what happened; anything that needs the
        // child mutably (termination, the final stderr drain) runs after the
        // select expression has released its borrows.
        enum Step {
            Continue,
            ProgressBlock(crate::engine::progress::ProgressSnapshot),
            CancelRequested,
            StallDetected,
            Exited(std::io::Result<std::process::ExitStatus>),
        }

        loop {
            let step = tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => match parser.feed_line(&line) {
                            Some(snapshot) => Step::ProgressBlock(snapshot),
                            None => Step::Continue,
                        },
                        _ => {
                            stdout_done = true;
                            Step::Continue
                        }
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            push_tail(&mut tail, &mut tail_bytes, line);
                            Step::Continue
                        }
                        _ => {
                            stderr_done = true;
                            Step::Continue
                        }
                    }
                }
                _ = cancel.cancelled() => Step::CancelRequested,
                _ = watchdog.tick() => {
                    if last_advance.elapsed() > stall_timeout {
                        Step::StallDetected
                    } else {
                        Step::Continue
                    }
                }
                status = child.wait() => Step::Exited(status),
            };

            match step {
                Step::Continue => {}
                Step::ProgressBlock(snapshot) => {
                    if let Some(out_ms) = snapshot.out_time_ms {
                        if out_ms > last_out_ms {
                            last_out_ms = out_ms;
                            last_advance = Instant::now();
                        }
                    }
                    let telemetry = self
                        .registry
                        .update(job_id, |job| {
                            let duration = if duration_s > 0.0 {
                                duration_s
                            } else {
                                job.telemetry.duration_s
                            };
                            let mut t = telemetry_from(
                                &snapshot,
                                duration,
                                start_offset_s,
                                &job.telemetry,
                            );
                            t.progress = progress_base + t.progress * progress_span;
                            job.apply_telemetry(&t);
                            job.telemetry.clone()
                        })
                        .await;
                    if let Some(t) = telemetry {
                        if limiter.allow(Instant::now()) {
                            self.bus.publish_progress(job_id, ProgressPayload {
                                progress: t.progress,
                                frame: t.frame,
                                fps: t.fps,
                                time: t.current_time_s,
                                speed: t.speed,
                            });
                        }
                    }
                }
                Step::CancelRequested => {
                    info!(job_id = %job_id, "cancellation requested, terminating encoder");
                    self.terminate(&mut child).await;
                    return RunOutcome::Cancelled;
                }
                Step::StallDetected => {
                    warn!(job_id = %job_id, timeout_s = self.transcoding.stall_timeout_s, "encoder stalled, terminating");
                    self.terminate(&mut child).await;
                    return RunOutcome::Stalled { stderr_tail: join_tail(&tail) };
                }
                Step::Exited(status) => {
                    // Pick up whatever stderr is already buffered before
                    // reporting.
                    while let Ok(Ok(Some(line))) = tokio::time::timeout(
                        Duration::from_millis(100),
                        stderr_lines.next_line(),
                    )
                    .await
                    {
                        push_tail(&mut tail, &mut tail_bytes, line);
                    }

                    return match status {
                        Ok(status) if status.success() => RunOutcome::Completed,
                        Ok(status) => RunOutcome::Failed {
                            code: status.code(),
                            stderr_tail: join_tail(&tail),
                        },
                        Err(e) => RunOutcome::Failed {
                            code: None,
                            stderr_tail: format!("failed to await encoder: {}", e),
                        },
                    };
                }
            }
        }
    }

    /// Polite-then-forced termination sequence.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SIGINT lets the encoder finalize the segment in flight.
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
                if tokio::time::timeout(GRACEFUL_KILL_TIMEOUT, child.wait())
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    /// Fetch declared subtitle tracks into the working directory.
    ///
    /// Failures are logged and the track is simply left out of the master
    /// playlist; a missing subtitle never fails the job.
    async fn fetch_subtitles(
        &self,
        tracks: &[SubtitleTrack],
        working_dir: &Path,
    ) -> Vec<SubtitleTrack> {
        let mut fetched = Vec::new();
        for track in tracks {
            let response = self
                .http
                .get(&track.url)
                .timeout(Duration::from_secs(10))
                .send()
                .await;
            let body = match response {
                Ok(r) if r.status().is_success() => r.bytes().await.ok(),
                _ => None,
            };
            let Some(body) = body else {
                warn!(url = %track.url, lang = %track.lang, "failed to fetch subtitle track");
                continue;
            };
            let path = playlist::subtitle_path(working_dir, &track.lang);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::write(&path, &body) {
                Ok(()) => fetched.push(track.clone()),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to write subtitle track"),
            }
        }
        fetched
    }

    async fn finish_success(
        &self,
        job_id: &str,
        request: &TranscodeRequest,
        plan: &InvocationPlan,
    ) {
        // Batch output is validated before the job is declared ready.
        if request.mode == TranscodeMode::Batch {
            let usable = std::fs::metadata(&plan.output_path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if !usable {
                self.finish_error(job_id, "encoder succeeded but produced no output".to_string())
                    .await;
                return;
            }
        }

        let base_url = self.registry.base_url().to_string();
        let snapshot = self
            .registry
            .update(job_id, |job| {
                if request.mode == TranscodeMode::Batch {
                    job.download_url = Some(format!("{}/download/{}", base_url, job.id));
                }
                job.telemetry.progress = 100.0;
                job.set_status(JobStatus::Ready);
                job.clone()
            })
            .await;

        let Some(job) = snapshot else { return };

        // One final progress event at termination, then the terminal status.
        self.bus.publish_progress(job_id, ProgressPayload {
            progress: 100.0,
            frame: job.telemetry.frame,
            fps: job.telemetry.fps,
            time: job.telemetry.current_time_s,
            speed: job.telemetry.speed,
        });
        self.bus.publish_status(job_id, JobStatus::Ready, None);
        self.stats.write().await.record_job_complete(&job);
        info!(job_id = %job_id, "job ready");

        if job.request.callback_url.is_some() {
            self.send_callback(&job).await;
        }
    }

    async fn finish_cancelled(&self, job_id: &str) {
        let snapshot = self
            .registry
            .update(job_id, |job| {
                job.set_status(JobStatus::Cancelled);
                job.clone()
            })
            .await;
        // A deleted job has no listeners left to tell.
        if let Some(job) = snapshot {
            self.bus.publish_status(job_id, JobStatus::Cancelled, None);
            self.stats.write().await.record_job_complete(&job);
        }
        info!(job_id = %job_id, "job cancelled");
    }

    async fn finish_error(&self, job_id: &str, message: String) {
        let snapshot = self
            .registry
            .update(job_id, |job| {
                job.fail(&message);
                job.clone()
            })
            .await;
        if let Some(job) = snapshot {
            self.bus
                .publish_status(job_id, JobStatus::Error, Some(message.clone()));
            self.stats.write().await.record_job_complete(&job);
        }
        warn!(job_id = %job_id, error = %message, "job failed");
    }

    /// POST a single status snapshot to the completion callback.
    ///
    /// Best effort: one attempt with a short timeout, failures only logged.
    async fn send_callback(&self, job: &crate::jobs::Job) {
        let Some(url) = &job.request.callback_url else {
            return;
        };
        let result = self
            .http
            .post(url)
            .json(&job.callback_snapshot())
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(response) => {
                debug!(job_id = %job.id, status = %response.status(), "completion callback delivered")
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "completion callback failed"),
        }
    }
}

/// Exponential retry backoff, capped at 30 s.
fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(16));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Wipe and recreate a working directory for a fresh attempt.
///
/// The directory root itself survives the job until an explicit delete;
/// only its contents are rebuilt per attempt.
fn prepare_workdir(working_dir: &Path) -> std::io::Result<()> {
    if working_dir.exists() {
        for entry in std::fs::read_dir(working_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    } else {
        std::fs::create_dir_all(working_dir)?;
    }
    Ok(())
}

fn push_tail(tail: &mut VecDeque<String>, tail_bytes: &mut usize, line: String) {
    *tail_bytes += line.len() + 1;
    tail.push_back(line);
    while *tail_bytes > STDERR_TAIL_BYTES && tail.len() > 1 {
        if let Some(removed) = tail.pop_front() {
            *tail_bytes -= removed.len() + 1;
        }
    }
}

fn join_tail(tail: &VecDeque<String>) -> String {
    let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    bound_tail(&joined, STDERR_TAIL_BYTES)
}

/// Keep at most the last `limit` bytes of a message, on a char boundary.
fn bound_tail(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut start = message.len() - limit;
    while start < message.len() && !message.is_char_boundary(start) {
        start += 1;
    }
    message[start..].to_string()
}
