//! Export orchestration.
//!
//! An [`ExportJob`] moves `Created → Running → Completed | Failed`. The
//! orchestrator submits it, waits for a terminal state and, when the first
//! attempt fails, re-submits exactly once with an escalated pixel ceiling.

use crate::config::{ExportSettings, FileFormat, PollingConfig};
use crate::core::graph::{Geometry, Image};
use crate::types::{TrendError, TrendResult};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Local lifecycle of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Created => write!(f, "CREATED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status reported by the remote backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Running,
    Succeeded,
    Failed(Option<String>),
    Cancelled,
}

/// Backend handle of a started export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// Everything the backend needs to start an export
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub image: Image,
    pub region: Geometry,
    pub description: String,
    pub file_name_prefix: String,
    pub folder: String,
    pub scale: f64,
    pub crs: String,
    pub file_format: FileFormat,
    pub max_pixels: u64,
}

/// Remote compute backend: start an export and report its status
pub trait ExportBackend {
    fn start_export(&self, request: &ExportRequest) -> TrendResult<JobHandle>;
    fn job_status(&self, handle: &JobHandle) -> TrendResult<RemoteStatus>;
}

impl<B: ExportBackend + ?Sized> ExportBackend for &B {
    fn start_export(&self, request: &ExportRequest) -> TrendResult<JobHandle> {
        (**self).start_export(request)
    }

    fn job_status(&self, handle: &JobHandle) -> TrendResult<RemoteStatus> {
        (**self).job_status(handle)
    }
}

/// A single export attempt, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub request: ExportRequest,
    handle: Option<JobHandle>,
    state: JobState,
    failure: Option<String>,
}

impl ExportJob {
    pub fn new(request: ExportRequest) -> Self {
        Self {
            request,
            handle: None,
            state: JobState::Created,
            failure: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn start(&mut self, handle: JobHandle) {
        self.handle = Some(handle);
        self.state = JobState::Running;
    }

    /// Fold a remote status into the local state; terminal states stick
    pub fn observe(&mut self, status: RemoteStatus) -> JobState {
        if self.state != JobState::Running {
            return self.state;
        }
        match status {
            RemoteStatus::Pending | RemoteStatus::Running => {}
            RemoteStatus::Succeeded => self.state = JobState::Completed,
            RemoteStatus::Failed(message) => {
                self.state = JobState::Failed;
                self.failure = Some(message.unwrap_or_else(|| "no error message".to_string()));
            }
            RemoteStatus::Cancelled => {
                self.state = JobState::Failed;
                self.failure = Some("cancelled on the remote side".to_string());
            }
        }
        self.state
    }
}

/// Cancellation signal shared between the waiting pipeline and its owner
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` unless cancelled first; returns true if cancelled
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Poll interval, backoff and deadline
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    /// Fixed interval, no deadline
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff_factor: 1.0,
            max_interval: interval,
            max_wait: None,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .map_or(cap, |next| next.min(cap))
    }
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            backoff_factor: config.backoff_factor,
            max_interval: config.max_interval(),
            max_wait: config.max_wait(),
        }
    }
}

/// Record of one submission
#[derive(Debug, Clone, PartialEq)]
pub struct ExportAttempt {
    pub number: usize,
    pub max_pixels: u64,
    pub job_id: String,
    pub state: JobState,
    pub failure: Option<String>,
}

/// Successful export: the attempts made, the last one completed
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub attempts: Vec<ExportAttempt>,
}

impl ExportOutcome {
    pub fn final_max_pixels(&self) -> Option<u64> {
        self.attempts.last().map(|a| a.max_pixels)
    }
}

/// Attempts made before giving up: the original plus one escalated retry
pub const MAX_ATTEMPTS: usize = 2;

/// Submits, polls and escalates export jobs
pub struct ExportOrchestrator<B: ExportBackend> {
    backend: B,
    settings: ExportSettings,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl<B: ExportBackend> ExportOrchestrator<B> {
    pub fn new(backend: B, settings: ExportSettings, policy: PollPolicy) -> Self {
        Self {
            backend,
            settings,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Pixel ceilings used by successive attempts
    pub fn ceilings(&self) -> [u64; MAX_ATTEMPTS] {
        let initial = self.settings.initial_max_pixels;
        [initial, initial.saturating_mul(self.settings.escalation_factor)]
    }

    /// Start an export and return the job in `Running`
    pub fn submit(
        &self,
        image: &Image,
        region: &Geometry,
        basename: &str,
        folder: &str,
        max_pixels: u64,
    ) -> TrendResult<ExportJob> {
        let request = ExportRequest {
            image: image.clone(),
            region: region.clone(),
            description: basename.to_string(),
            file_name_prefix: basename.to_string(),
            folder: folder.to_string(),
            scale: self.settings.scale,
            crs: self.settings.crs.clone(),
            file_format: self.settings.file_format,
            max_pixels,
        };
        let mut job = ExportJob::new(request);

        log::info!(
            "Submitting export '{}' to folder '{}' (scale {} m, {}, max_pixels {})",
            basename,
            folder,
            self.settings.scale,
            self.settings.crs,
            max_pixels
        );
        let handle = self.backend.start_export(&job.request)?;
        log::info!("Export started as {}", handle.id);
        job.start(handle);
        Ok(job)
    }

    /// Wait until the job is terminal, honouring backoff, deadline and
    /// cancellation
    pub fn poll(&self, job: &mut ExportJob) -> TrendResult<JobState> {
        let handle = job
            .handle()
            .cloned()
            .ok_or_else(|| TrendError::InvalidInput("export job was never started".to_string()))?;

        let started = Instant::now();
        let mut interval = self.policy.interval;

        loop {
            if self.cancel.is_cancelled() {
                log::warn!("Polling of {} cancelled", handle.id);
                return Err(TrendError::Cancelled);
            }

            let status = self.backend.job_status(&handle)?;
            let state = job.observe(status);
            log::debug!("Export {} is {}", handle.id, state);
            if state.is_terminal() {
                return Ok(state);
            }

            let mut sleep = interval;
            if let Some(max_wait) = self.policy.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    log::error!("Export {} still running after {:?}", handle.id, waited);
                    return Err(TrendError::Timeout {
                        job: handle.id.clone(),
                        waited,
                    });
                }
                sleep = sleep.min(max_wait - waited);
            }

            if self.cancel.wait(sleep) {
                log::warn!("Polling of {} cancelled", handle.id);
                return Err(TrendError::Cancelled);
            }
            interval = self.policy.next_interval(interval);
        }
    }

    /// Export `image` as `filename` into `folder`, retrying once with the
    /// escalated pixel ceiling when the first attempt fails
    pub fn export(
        &self,
        image: &Image,
        region: &Geometry,
        filename: &str,
        folder: &str,
    ) -> TrendResult<ExportOutcome> {
        let basename = Path::new(filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());

        let mut attempts = Vec::with_capacity(MAX_ATTEMPTS);
        for (index, max_pixels) in self.ceilings().into_iter().enumerate() {
            let mut job = self.submit(image, region, &basename, folder, max_pixels)?;
            let state = self.poll(&mut job)?;
            let job_id = job.handle().map(|h| h.id.clone()).unwrap_or_default();
            attempts.push(ExportAttempt {
                number: index + 1,
                max_pixels,
                job_id,
                state,
                failure: job.failure().map(str::to_string),
            });

            if state == JobState::Completed {
                log::info!("Export '{}' completed on attempt {}", basename, index + 1);
                return Ok(ExportOutcome { attempts });
            }

            log::warn!(
                "Export attempt {} failed: {}",
                index + 1,
                job.failure().unwrap_or("unknown reason")
            );
            if index + 1 < MAX_ATTEMPTS {
                log::warn!("Retrying with a larger pixel ceiling");
            }
        }

        let reason = attempts
            .last()
            .and_then(|a| a.failure.clone())
            .unwrap_or_else(|| "unknown reason".to_string());
        log::error!("Export '{}' failed after {} attempts", basename, attempts.len());
        Err(TrendError::ExportFailed {
            attempts: attempts.len(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays a scripted status sequence for every job
    struct Scripted {
        statuses: RefCell<VecDeque<RemoteStatus>>,
        polls: RefCell<usize>,
    }

    impl Scripted {
        fn new(statuses: Vec<RemoteStatus>) -> Self {
            Self {
                statuses: RefCell::new(statuses.into()),
                polls: RefCell::new(0),
            }
        }
    }

    impl ExportBackend for Scripted {
        fn start_export(&self, _request: &ExportRequest) -> TrendResult<JobHandle> {
            Ok(JobHandle { id: "op-1".to_string() })
        }

        fn job_status(&self, _handle: &JobHandle) -> TrendResult<RemoteStatus> {
            *self.polls.borrow_mut() += 1;
            Ok(self
                .statuses
                .borrow_mut()
                .pop_front()
                .unwrap_or(RemoteStatus::Running))
        }
    }

    fn orchestrator(backend: Scripted, policy: PollPolicy) -> ExportOrchestrator<Scripted> {
        ExportOrchestrator::new(backend, ExportSettings::default(), policy)
    }

    fn submit(orch: &ExportOrchestrator<Scripted>) -> ExportJob {
        orch.submit(
            &Image::constant(1.0),
            &Geometry::from_table("aoi"),
            "trend",
            "naroch",
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_job_lifecycle() {
        let request = ExportRequest {
            image: Image::constant(1.0),
            region: Geometry::from_table("aoi"),
            description: "trend".to_string(),
            file_name_prefix: "trend".to_string(),
            folder: "naroch".to_string(),
            scale: 10.0,
            crs: "EPSG:32635".to_string(),
            file_format: FileFormat::GeoTiff,
            max_pixels: 100,
        };
        let mut job = ExportJob::new(request);
        assert_eq!(job.state(), JobState::Created);
        assert_eq!(job.observe(RemoteStatus::Succeeded), JobState::Created);
        job.start(JobHandle { id: "x".to_string() });
        assert_eq!(job.observe(RemoteStatus::Pending), JobState::Running);
        assert_eq!(job.observe(RemoteStatus::Failed(Some("too many pixels".to_string()))), JobState::Failed);
        assert_eq!(job.observe(RemoteStatus::Succeeded), JobState::Failed);
        assert_eq!(job.failure(), Some("too many pixels"));
    }

    #[test]
    fn test_poll_until_terminal() {
        let orch = orchestrator(
            Scripted::new(vec![RemoteStatus::Pending, RemoteStatus::Running, RemoteStatus::Succeeded]),
            PollPolicy::fixed(Duration::ZERO),
        );
        let mut job = submit(&orch);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(orch.poll(&mut job).unwrap(), JobState::Completed);
        assert_eq!(*orch.backend().polls.borrow(), 3);
    }

    #[test]
    fn test_poll_deadline() {
        let policy = PollPolicy {
            max_wait: Some(Duration::from_millis(20)),
            ..PollPolicy::fixed(Duration::from_millis(5))
        };
        let orch = orchestrator(Scripted::new(vec![]), policy);
        let mut job = submit(&orch);
        assert!(matches!(orch.poll(&mut job), Err(TrendError::Timeout { .. })));
    }

    #[test]
    fn test_poll_cancelled() {
        let cancel = CancellationToken::new();
        let orch = orchestrator(Scripted::new(vec![]), PollPolicy::fixed(Duration::from_secs(60)))
            .with_cancellation(cancel.clone());
        let mut job = submit(&orch);
        cancel.cancel();
        assert!(matches!(orch.poll(&mut job), Err(TrendError::Cancelled)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(12),
            max_wait: None,
        };
        assert_eq!(policy.next_interval(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(policy.next_interval(Duration::from_secs(10)), Duration::from_secs(12));
    }

    #[test]
    fn test_backoff_overflow_hits_cap() {
        let policy = PollPolicy {
            interval: Duration::from_secs(5),
            backoff_factor: f64::INFINITY,
            max_interval: Duration::from_secs(60),
            max_wait: None,
        };
        assert_eq!(policy.next_interval(Duration::from_secs(5)), Duration::from_secs(60));
        let policy = PollPolicy { backoff_factor: 1e300, ..policy };
        assert_eq!(policy.next_interval(Duration::from_secs(5)), Duration::from_secs(60));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let orch = orchestrator(Scripted::new(vec![]), PollPolicy::fixed(Duration::from_secs(60)))
            .with_cancellation(cancel.clone());
        let mut job = submit(&orch);

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let started = Instant::now();
        let result = orch.poll(&mut job);
        canceller.join().unwrap();

        assert!(matches!(result, Err(TrendError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*orch.backend().polls.borrow(), 1);
    }

    #[test]
    fn test_ceilings() {
        let orch = orchestrator(Scripted::new(vec![]), PollPolicy::fixed(Duration::ZERO));
        assert_eq!(orch.ceilings(), [100_000_000, 1_000_000_000]);
    }
}
