//! Session-local task registry.
//!
//! One entry per launched task, keyed by worker process id. An entry pins
//! the channel region alive (the mapping is the transport), remembers the
//! owner for privilege checks, and carries the access cookie that fences
//! off stale lookups after pid reuse.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::{TaskError, TaskResult};
use crate::identity::{IdentityProvider, Principal};
use crate::protocol::truncate_utf8;
use crate::shm::{ControlBlock, RingReceiver};
use crate::supervisor::WorkerHandle;

/// Cookie value used for tasks launched through the legacy pid-only API.
/// Legacy lookups skip the cookie comparison entirely, so the value never
/// matches a minted cookie.
pub const LEGACY_COOKIE: u64 = 0;

/// Longest request preview kept for listings, in bytes.
const PREVIEW_MAX: usize = 128;

/// One live (or finished-but-unreaped) task.
pub struct TaskHandle {
    pub pid: u32,
    /// Access cookie minted at launch; [`LEGACY_COOKIE`] for pid-only launches.
    pub cookie: u64,
    pub owner: Principal,
    pub started_at: SystemTime,
    /// Bumped by every lifecycle operation that touches the task.
    pub last_activity: SystemTime,
    /// Truncated request text, for listings only.
    pub preview: String,
    pub queue_capacity: u32,
    /// Result retrieval has begun or finished; a second retrieval is refused.
    pub consumed: bool,
    pub canceled: bool,
    /// Receiver dropped but entry retained; results are gone for good.
    pub detached: bool,
    /// Launched without a result queue consumer; retrieval is never valid.
    pub fire_and_forget: bool,
    /// Terminal decode failure recorded for listings after the stream died.
    pub last_error: Option<String>,

    pub(crate) receiver: Option<RingReceiver>,
    // Holds the region mapping alive even after the receiver is dropped.
    pub(crate) control: ControlBlock,
    pub(crate) worker: Box<dyn WorkerHandle>,
}

impl TaskHandle {
    pub(crate) fn touch(&mut self) {
        self.last_activity = SystemTime::now();
    }

    /// Whether the stored cookie admits a lookup with `cookie`.
    fn cookie_matches(&self, cookie: Option<u64>) -> bool {
        match cookie {
            // Pid-only lookup: trust the caller knows what the pid refers to.
            None => true,
            Some(c) => self.cookie != LEGACY_COOKIE && self.cookie == c,
        }
    }
}

/// Build the listing preview for a request payload.
pub(crate) fn request_preview(request: &[u8]) -> String {
    let text = String::from_utf8_lossy(request);
    truncate_utf8(&text, PREVIEW_MAX).to_owned()
}

/// Registry of tasks belonging to one controller session.
pub struct Registry {
    tasks: HashMap<u32, TaskHandle>,
    max_concurrent: usize,
}

impl Registry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            max_concurrent,
        }
    }

    /// Number of registered tasks, finished-but-unreaped included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check the admission limit before starting another worker.
    pub fn admit(&self) -> TaskResult<()> {
        if self.tasks.len() >= self.max_concurrent {
            return Err(TaskError::ResourceExhausted(format!(
                "too many concurrent tasks (limit {})",
                self.max_concurrent
            )));
        }
        Ok(())
    }

    /// Register a freshly launched task.
    ///
    /// A pid collision means the old worker died and the operating system
    /// reused its pid before the old entry was reaped; the new entry may
    /// not silently replace an entry a different owner still holds. The
    /// caller must stop the new worker when this fails.
    pub fn insert(&mut self, handle: TaskHandle) -> TaskResult<()> {
        let pid = handle.pid;
        match self.tasks.get(&pid) {
            Some(existing) if existing.owner != handle.owner => {
                Err(TaskError::IntegrityViolation { pid })
            }
            _ => {
                self.tasks.insert(pid, handle);
                Ok(())
            }
        }
    }

    /// Owner of the entry registered under `pid`, if any. Used to detect
    /// pid reuse before a new entry is built.
    pub fn owner_of(&self, pid: u32) -> Option<&Principal> {
        self.tasks.get(&pid).map(|h| &h.owner)
    }

    /// Look up a task by pid and optional cookie. Unknown pid and cookie
    /// mismatch are indistinguishable to the caller.
    pub fn find(&self, pid: u32, cookie: Option<u64>) -> TaskResult<&TaskHandle> {
        self.tasks
            .get(&pid)
            .filter(|h| h.cookie_matches(cookie))
            .ok_or(TaskError::NotFound { pid })
    }

    /// Mutable variant of [`find`](Self::find).
    pub fn find_mut(&mut self, pid: u32, cookie: Option<u64>) -> TaskResult<&mut TaskHandle> {
        self.tasks
            .get_mut(&pid)
            .filter(|h| h.cookie_matches(cookie))
            .ok_or(TaskError::NotFound { pid })
    }

    /// Remove a task entry, releasing the channel mapping. This is the only
    /// place an entry leaves the registry.
    pub fn remove(&mut self, pid: u32) -> Option<TaskHandle> {
        self.tasks.remove(&pid)
    }

    /// Iterate over every registered task in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskHandle> {
        self.tasks.values()
    }

    /// Verify the caller may act on `handle`'s task.
    pub fn check_rights(
        &self,
        identity: &dyn IdentityProvider,
        handle: &TaskHandle,
    ) -> TaskResult<()> {
        let caller = identity.current();
        if identity.has_privileges_of(&caller, &handle.owner) {
            Ok(())
        } else {
            Err(TaskError::PermissionDenied { pid: handle.pid })
        }
    }
}

/// Mint a non-zero access cookie.
pub fn mint_cookie() -> u64 {
    loop {
        let c: u64 = rand::random();
        if c != LEGACY_COOKIE {
            return c;
        }
    }
}
