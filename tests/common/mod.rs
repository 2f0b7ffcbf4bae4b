//! Shared test fixtures.
//!
//! Workers run as threads instead of processes so the lifecycle tests
//! exercise the controller, channel and shim without depending on a built
//! worker binary. The thread attaches to the channel exactly like the
//! binary would; only signals are faked, since the cancel flag in the
//! control block is what actually stops a runner.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use taskmill::config::Settings;
use taskmill::error::TaskResult;
use taskmill::supervisor::{ProcessSupervisor, WorkerHandle, WorkerStatus};
use taskmill::worker::{ScriptRunner, WorkerShim};

/// Synthetic pids, far away from anything the OS would hand out.
static NEXT_PID: AtomicU32 = AtomicU32::new(100_000);

pub struct ThreadSupervisor;

#[async_trait]
impl ProcessSupervisor for ThreadSupervisor {
    async fn start(&self, channel: &str) -> TaskResult<Box<dyn WorkerHandle>> {
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let done = Arc::new(AtomicBool::new(false));
        let thread_done = Arc::clone(&done);
        let channel = channel.to_owned();
        std::thread::spawn(move || {
            if let Ok(shim) = WorkerShim::attach(&channel) {
                let _ = shim.run(&mut ScriptRunner);
            }
            thread_done.store(true, Ordering::Release);
        });
        Ok(Box::new(ThreadWorker { pid, done }))
    }
}

struct ThreadWorker {
    pid: u32,
    done: Arc<AtomicBool>,
}

impl WorkerHandle for ThreadWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn status(&mut self) -> WorkerStatus {
        if self.done.load(Ordering::Acquire) {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Running
        }
    }

    // Signals do not apply to threads. Graceful stop is carried by the
    // cancel flag the controller has already raised; forceful stop simply
    // waits for the runner to hit its next interrupt check.
    fn stop_graceful(&mut self) {}

    fn stop_forceful(&mut self) {}
}

/// Settings with limits small enough to hit in a test.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.tasks.max_concurrent = 4;
    settings.tasks.default_queue_capacity = 4096;
    settings
}
