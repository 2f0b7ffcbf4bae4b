//! Controller-side lifecycle API.
//!
//! One [`Controller`] manages the tasks of one session: it launches worker
//! processes over fresh channels, retrieves their result streams, and
//! cancels, waits on or detaches from them. Every task-addressed operation
//! goes through the registry lookup (pid plus optional cookie) and the
//! owner privilege check before touching the task.

use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{TaskError, TaskResult};
use crate::identity::IdentityProvider;
use crate::protocol::{truncate_utf8, ColumnType, ResultDecoder, StreamItem, Value, WireError};
use crate::registry::{self, Registry, TaskHandle, LEGACY_COOKIE};
use crate::shm::{self, Progress, MIN_RING_CAPACITY};
use crate::supervisor::{ProcessSupervisor, WorkerStatus};

/// Longest cancel grace period honored, in milliseconds.
const MAX_GRACE_MS: u64 = 3_600_000;

/// Longest recorded stream-failure message, in bytes.
const LAST_ERROR_MAX: usize = 256;

/// Longest wait for a worker to die after a forceful stop. Cancellation
/// must never block without bound, even against a worker that shrugs off
/// the termination signal.
const ESCALATION_WAIT: Duration = Duration::from_secs(1);

/// Options for launching one task.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Result queue capacity in bytes; the configured default when `None`.
    pub queue_capacity: Option<u32>,
}

/// Derived lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Worker exited without a recorded failure.
    Complete,
    /// The result stream died; details in `last_error`.
    Failed,
    /// Cancellation was requested and the worker has stopped.
    Canceled,
    /// Launched without a result consumer.
    Detached,
}

/// Snapshot of one task's lifecycle, as returned by
/// [`Controller::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub started_at: SystemTime,
    pub last_activity: SystemTime,
}

/// Everything a completed result stream produced.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Decoded rows. When the worker produced no result set this holds
    /// the single synthetic row carrying the last completion tag, or
    /// nothing at all if the task also reported no completed commands.
    pub rows: Vec<Vec<Value>>,
    /// Completion tags, one per command the worker ran.
    pub command_tags: Vec<String>,
    /// Non-fatal diagnostics interleaved with the rows.
    pub notices: Vec<WireError>,
    /// Out-of-band notifications, forwarded verbatim.
    pub async_events: Vec<Vec<u8>>,
}

/// One row of a task listing.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub pid: u32,
    /// Access cookie; [`LEGACY_COOKIE`](crate::registry::LEGACY_COOKIE)
    /// for pid-only launches. Listings only show the caller's own (or
    /// privilege-covered) tasks, so this leaks nothing across owners.
    pub cookie: u64,
    pub owner: String,
    pub started_at: SystemTime,
    pub last_activity: SystemTime,
    /// Truncated request text.
    pub preview: String,
    pub queue_capacity: u32,
    pub state: TaskState,
    pub consumed: bool,
    pub last_error: Option<String>,
    pub progress: Option<Progress>,
}

/// Session-local task controller.
pub struct Controller<S, I> {
    supervisor: S,
    identity: I,
    settings: Settings,
    registry: Registry,
}

impl<S: ProcessSupervisor, I: IdentityProvider> Controller<S, I> {
    pub fn new(supervisor: S, identity: I, settings: Settings) -> Self {
        let registry = Registry::new(settings.tasks.max_concurrent);
        Self {
            supervisor,
            identity,
            settings,
            registry,
        }
    }

    /// Launch a task through the legacy pid-only interface. The returned
    /// pid is the only way to address the task later, which makes every
    /// follow-up call vulnerable to pid reuse; new code should call
    /// [`launch_v2`](Self::launch_v2).
    pub async fn launch(&mut self, request: &[u8], opts: LaunchOptions) -> TaskResult<u32> {
        let (pid, _) = self.launch_inner(request, opts, LEGACY_COOKIE, false).await?;
        Ok(pid)
    }

    /// Launch a task and return its pid together with a freshly minted
    /// access cookie. Later calls that present the cookie are immune to
    /// pid reuse.
    pub async fn launch_v2(
        &mut self,
        request: &[u8],
        opts: LaunchOptions,
    ) -> TaskResult<(u32, u64)> {
        let cookie = registry::mint_cookie();
        self.launch_inner(request, opts, cookie, false).await
    }

    /// Launch a fire-and-forget task: the result queue is abandoned
    /// immediately, so the worker runs unthrottled and result retrieval is
    /// never available.
    pub async fn submit_v2(
        &mut self,
        request: &[u8],
        opts: LaunchOptions,
    ) -> TaskResult<(u32, u64)> {
        let cookie = registry::mint_cookie();
        self.launch_inner(request, opts, cookie, true).await
    }

    async fn launch_inner(
        &mut self,
        request: &[u8],
        opts: LaunchOptions,
        cookie: u64,
        fire_and_forget: bool,
    ) -> TaskResult<(u32, u64)> {
        if request.is_empty() {
            return Err(TaskError::InvalidArgument("empty request".into()));
        }
        if request.len() > self.settings.tasks.max_request_size {
            return Err(TaskError::InvalidArgument(format!(
                "request of {} bytes exceeds the {}-byte limit",
                request.len(),
                self.settings.tasks.max_request_size
            )));
        }
        let capacity = opts
            .queue_capacity
            .unwrap_or(self.settings.tasks.default_queue_capacity);
        if capacity < MIN_RING_CAPACITY || capacity > self.settings.tasks.max_queue_capacity {
            return Err(TaskError::InvalidArgument(format!(
                "queue capacity {capacity} outside {MIN_RING_CAPACITY}..={}",
                self.settings.tasks.max_queue_capacity
            )));
        }
        self.registry.admit()?;

        let name = format!(
            "/taskmill-{}-{:016x}",
            std::process::id(),
            rand::random::<u64>()
        );
        let (_region, mut receiver, control) =
            shm::create_channel(&name, request, capacity, self.settings.tasks.exec_timeout_ms)?;

        let mut worker = self.supervisor.start(&name).await?;
        let pid = worker.pid();

        // The worker attaches to the ring before doing anything else, so a
        // missing attach means it died during startup. Waiting here keeps a
        // fast worker failure from looking like an empty result stream.
        let mut backoff = Backoff::new();
        while !receiver.sender_attached() {
            if worker.status() != WorkerStatus::Running {
                return Err(TaskError::ConnectionLost { pid });
            }
            backoff.sleep().await;
        }

        // A pid collision means the operating system reused a dead worker's
        // pid while another owner's entry was still registered. Replacing
        // that entry would hand this caller someone else's task, so the new
        // worker is stopped instead.
        let owner = self.identity.current();
        if self.registry.owner_of(pid).is_some_and(|o| *o != owner) {
            warn!(pid, "pid collision across owners, stopping new worker");
            worker.stop_forceful();
            return Err(TaskError::IntegrityViolation { pid });
        }

        if fire_and_forget {
            receiver.detach();
        }
        let handle = TaskHandle {
            pid,
            cookie,
            owner,
            started_at: SystemTime::now(),
            last_activity: SystemTime::now(),
            preview: registry::request_preview(request),
            queue_capacity: capacity,
            consumed: false,
            canceled: false,
            detached: fire_and_forget,
            fire_and_forget,
            last_error: None,
            receiver: (!fire_and_forget).then_some(receiver),
            control,
            worker,
        };
        self.registry.insert(handle)?;
        info!(pid, fenced = cookie != LEGACY_COOKIE, fire_and_forget, "task launched");
        Ok((pid, cookie))
    }

    /// Retrieve the complete result stream of a task. Valid exactly once
    /// per task; the stream is drained to its terminal marker before this
    /// returns. On success the task is reaped from the registry.
    pub async fn result(
        &mut self,
        pid: u32,
        cookie: Option<u64>,
        expected: &[ColumnType],
    ) -> TaskResult<ResultSet> {
        {
            let handle = self.registry.find(pid, cookie)?;
            self.registry.check_rights(&self.identity, handle)?;
            if handle.fire_and_forget {
                return Err(TaskError::FeatureDisabled(
                    "task was submitted without a result queue".into(),
                ));
            }
            if handle.consumed {
                return Err(TaskError::AlreadyConsumed { pid });
            }
        }

        let handle = self.registry.find_mut(pid, cookie)?;
        handle.consumed = true;
        handle.touch();
        let mut receiver = match handle.receiver.take() {
            Some(r) => r,
            None => return Err(TaskError::AlreadyConsumed { pid }),
        };

        let mut decoder = ResultDecoder::new(pid, expected.to_vec());
        let mut out = ResultSet::default();
        let mut backoff = Backoff::new();
        let stream_result = loop {
            match receiver.try_recv() {
                Ok(Some(msg)) => {
                    backoff.reset();
                    match decoder.on_message(&msg) {
                        Ok(Some(StreamItem::Row(row))) => out.rows.push(row),
                        Ok(Some(StreamItem::Notice(n))) => out.notices.push(n),
                        Ok(Some(StreamItem::AsyncEvent(ev))) => out.async_events.push(ev),
                        Ok(None) => {
                            if decoder.is_complete() {
                                break Ok(());
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                Ok(None) => {
                    if decoder.is_complete() {
                        break Ok(());
                    }
                    backoff.sleep().await;
                }
                // Sender gone; let finish() decide whether the stream ended
                // cleanly.
                Err(_) => break Ok(()),
            }
        };

        match stream_result.and_then(|()| {
            out.command_tags = decoder.command_tags().to_vec();
            decoder.finish().map(|synthetic| {
                if let Some(row) = synthetic {
                    out.rows.push(row);
                }
            })
        }) {
            Ok(()) => {
                debug!(pid, rows = out.rows.len(), "result stream complete");
                self.registry.remove(pid);
                Ok(out)
            }
            Err(e) => {
                // Keep the entry so listings can show what went wrong, but
                // the stream itself is gone for good.
                let handle = self.registry.find_mut(pid, cookie)?;
                let text = e.to_string();
                handle.last_error = Some(truncate_utf8(&text, LAST_ERROR_MAX).to_owned());
                handle.touch();
                warn!(pid, error = %e, "result stream failed");
                Err(e)
            }
        }
    }

    /// Drop this session's interest in a task. The worker keeps running;
    /// its results are unreachable from now on.
    pub fn detach(&mut self, pid: u32, cookie: Option<u64>) -> TaskResult<()> {
        let handle = self.registry.find(pid, cookie)?;
        self.registry.check_rights(&self.identity, handle)?;
        // Dropping the entry detaches the receiver, which un-blocks a
        // worker waiting on a full queue; it then runs to completion.
        self.registry.remove(pid);
        info!(pid, "task detached");
        Ok(())
    }

    /// Cancel a task: ask politely, give it `grace_ms` to stop, then
    /// demand termination, and in either case wait for the worker to be
    /// gone before returning. The registry entry survives so a follow-up
    /// wait or listing still finds the task.
    pub async fn cancel(&mut self, pid: u32, cookie: Option<u64>, grace_ms: u64) -> TaskResult<()> {
        {
            let handle = self.registry.find(pid, cookie)?;
            self.registry.check_rights(&self.identity, handle)?;
        }
        let handle = self.registry.find_mut(pid, cookie)?;
        handle.canceled = true;
        handle.touch();
        handle.control.request_cancel();
        handle.worker.stop_graceful();

        let grace = Duration::from_millis(grace_ms.min(MAX_GRACE_MS));
        let deadline = tokio::time::Instant::now() + grace;
        let mut backoff = Backoff::new();
        let mut escalated = false;
        while handle.worker.status() == WorkerStatus::Running {
            if tokio::time::Instant::now() >= deadline {
                warn!(pid, ?grace, "grace period expired, terminating worker");
                handle.worker.stop_forceful();
                escalated = true;
                break;
            }
            backoff.sleep().await;
        }
        if escalated {
            // Even forced termination gets a bounded wait: a worker that
            // survives it is reported and left to the supervisor.
            let hard_deadline = tokio::time::Instant::now() + ESCALATION_WAIT;
            while handle.worker.status() == WorkerStatus::Running {
                if tokio::time::Instant::now() >= hard_deadline {
                    warn!(pid, "worker still running after forced stop");
                    break;
                }
                backoff.sleep().await;
            }
        }
        info!(pid, "task canceled");
        Ok(())
    }

    /// Block until the worker process has stopped, or `timeout_ms`
    /// elapses when one is given. Returns whether the worker had stopped.
    /// Does not consume the result stream.
    pub async fn wait(
        &mut self,
        pid: u32,
        cookie: Option<u64>,
        timeout_ms: Option<u64>,
    ) -> TaskResult<bool> {
        {
            let handle = self.registry.find(pid, cookie)?;
            self.registry.check_rights(&self.identity, handle)?;
        }
        let handle = self.registry.find_mut(pid, cookie)?;
        let deadline =
            timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        let mut backoff = Backoff::new();
        while handle.worker.status() == WorkerStatus::Running {
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Ok(false);
            }
            backoff.sleep().await;
        }
        Ok(true)
    }

    /// Current lifecycle snapshot of a task.
    pub fn status(&mut self, pid: u32, cookie: Option<u64>) -> TaskResult<TaskStatus> {
        {
            let handle = self.registry.find(pid, cookie)?;
            self.registry.check_rights(&self.identity, handle)?;
        }
        let handle = self.registry.find_mut(pid, cookie)?;
        Ok(TaskStatus {
            state: task_state(handle),
            started_at: handle.started_at,
            last_activity: handle.last_activity,
        })
    }

    /// Latest progress report published by the worker, if any.
    pub fn progress(&mut self, pid: u32, cookie: Option<u64>) -> TaskResult<Option<Progress>> {
        let handle = self.registry.find(pid, cookie)?;
        self.registry.check_rights(&self.identity, handle)?;
        Ok(handle.control.read_progress())
    }

    /// List the registered tasks visible to the caller, newest last by
    /// start time. Listing requires no cookie, but it only shows tasks
    /// whose owner's privileges the caller holds; everyone else's tasks
    /// are omitted entirely.
    pub fn list(&mut self) -> Vec<TaskInfo> {
        let caller = self.identity.current();
        let mut pids: Vec<u32> = self.registry.iter().map(|h| h.pid).collect();
        pids.sort_unstable();
        let mut out = Vec::with_capacity(pids.len());
        for pid in pids {
            let Ok(handle) = self.registry.find_mut(pid, None) else {
                continue;
            };
            if !self.identity.has_privileges_of(&caller, &handle.owner) {
                continue;
            }
            let state = task_state(handle);
            out.push(TaskInfo {
                pid: handle.pid,
                cookie: handle.cookie,
                owner: handle.owner.name().to_owned(),
                started_at: handle.started_at,
                last_activity: handle.last_activity,
                preview: handle.preview.clone(),
                queue_capacity: handle.queue_capacity,
                state,
                consumed: handle.consumed,
                last_error: handle.last_error.clone(),
                progress: handle.control.read_progress(),
            });
        }
        out.sort_by_key(|info| info.started_at);
        out
    }

    /// Number of tasks currently registered.
    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    /// Session teardown: drop every registered task. Workers are neither
    /// canceled nor signaled; their sinks go into discard mode once the
    /// receivers are gone, exactly as with a per-task detach.
    pub fn shutdown(&mut self) {
        let pids: Vec<u32> = self.registry.iter().map(|h| h.pid).collect();
        for pid in pids {
            self.registry.remove(pid);
        }
        if !self.registry.is_empty() {
            warn!("registry not empty after shutdown");
        }
    }
}

fn task_state(handle: &mut TaskHandle) -> TaskState {
    let stopped = handle.worker.status() != WorkerStatus::Running;
    if handle.canceled && stopped {
        TaskState::Canceled
    } else if handle.last_error.is_some() {
        TaskState::Failed
    } else if stopped {
        TaskState::Complete
    } else if handle.detached {
        TaskState::Detached
    } else {
        TaskState::Running
    }
}

/// Exponential poll backoff: 1 ms doubling to a 100 ms ceiling.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_millis(100);

    fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }

    async fn sleep(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(Self::MAX);
    }
}
