//! Worker-side channel shim.
//!
//! A worker process attaches to the channel named on its command line,
//! reads the request payload, and hands a [`FrameSink`] to a
//! [`TaskRunner`]. The shim owns the protocol obligations: cancel checks,
//! the execution deadline, the terminal `Ready` frame on success, and an
//! `Error` frame on failure. Runners only produce result content.
//!
//! The shim is deliberately synchronous; a worker serves exactly one task
//! and has nothing else to do while the ring is full.

mod script;

pub use script::ScriptRunner;

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::protocol::{encode_value, ColumnDesc, Frame, Severity, Value, WireError};
use crate::shm::{self, ControlBlock, RingSender, ShmError};

/// Error code reported when a task stops on a cancel request or deadline.
pub const CANCELED_CODE: &str = "57014";

/// Produces the result content of one task.
pub trait TaskRunner {
    /// Run the task described by `request`, writing results through `sink`.
    /// Returning an error ends the stream with an `Error` frame instead of
    /// `Ready`.
    fn run(&mut self, request: &[u8], sink: &mut FrameSink) -> Result<(), WireError>;
}

/// Result-frame writer handed to the runner.
///
/// Once the controller detaches from the queue the sink silently discards
/// every further frame, so a detached task runs to completion at full
/// speed instead of dying on a broken pipe.
pub struct FrameSink {
    sender: RingSender,
    control: ControlBlock,
    deadline: Option<Instant>,
    discarding: bool,
}

impl FrameSink {
    fn new(sender: RingSender, control: ControlBlock) -> Self {
        let timeout = control.exec_timeout_ms();
        let deadline = (timeout > 0).then(|| Instant::now() + Duration::from_millis(timeout as u64));
        Self {
            sender,
            control,
            deadline,
            discarding: false,
        }
    }

    /// Announce the column shape. Must precede every row.
    pub fn schema(&mut self, cols: &[ColumnDesc]) -> Result<(), ShmError> {
        self.send(&Frame::Schema(cols.to_vec()))
    }

    /// Send one row, binary-encoding each value.
    pub fn row(&mut self, values: &[Value]) -> Result<(), ShmError> {
        let cols = values.iter().map(encode_value).collect();
        self.send(&Frame::Row(cols))
    }

    /// Report one command as finished.
    pub fn command_done(&mut self, tag: &str) -> Result<(), ShmError> {
        self.send(&Frame::CommandDone(tag.to_owned()))
    }

    /// Forward a non-fatal diagnostic.
    pub fn notice(&mut self, notice: WireError) -> Result<(), ShmError> {
        self.send(&Frame::Notice(notice))
    }

    /// Forward an out-of-band notification.
    pub fn async_event(&mut self, payload: &[u8]) -> Result<(), ShmError> {
        self.send(&Frame::AsyncEvent(payload.to_vec()))
    }

    /// Publish a progress report. Publishing never blocks and never fails;
    /// overlong messages are truncated.
    pub fn report_progress(&self, pct: u8, message: &str) {
        self.control.publish_progress(pct, message);
    }

    /// Stop point: fails once cancellation was requested or the execution
    /// deadline has passed. Runners call this between units of work.
    pub fn check_interrupt(&self) -> Result<(), WireError> {
        if self.control.cancel_requested() {
            return Err(WireError::new(
                Severity::Error,
                CANCELED_CODE,
                "canceling task due to cancel request",
            ));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(WireError::new(
                Severity::Error,
                CANCELED_CODE,
                "canceling task due to execution timeout",
            ));
        }
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<(), ShmError> {
        if self.discarding {
            return Ok(());
        }
        match self.sender.send(&frame.encode()) {
            Ok(()) => Ok(()),
            Err(ShmError::PeerDetached) => {
                debug!("controller detached, discarding further frames");
                self.discarding = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// One attached worker endpoint.
pub struct WorkerShim {
    sink: FrameSink,
    request: Vec<u8>,
}

impl WorkerShim {
    /// Attach to the channel `name` and read its request payload.
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        let (sender, control, request) = shm::open_channel(name)?;
        debug!(channel = name, request_len = request.len(), "worker attached");
        Ok(Self {
            sink: FrameSink::new(sender, control),
            request,
        })
    }

    /// The request payload the controller wrote at launch.
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Run the task to completion and close the channel.
    ///
    /// A cancel request that arrives before execution starts wins: the
    /// runner is never invoked and the stream ends with an `Error` frame.
    /// Otherwise the stream ends with `Ready` on success or with the
    /// runner's error, and the sender detaches either way.
    pub fn run<R: TaskRunner>(mut self, runner: &mut R) -> Result<(), ShmError> {
        let request = std::mem::take(&mut self.request);
        let outcome = match self.sink.check_interrupt() {
            Err(e) => Err(e),
            Ok(()) => runner.run(&request, &mut self.sink),
        };
        match outcome {
            Ok(()) => {
                self.sink.send(&Frame::Ready)?;
                info!("task finished");
            }
            Err(e) => {
                info!(code = %e.code, message = %e.message, "task failed");
                self.sink.send(&Frame::Error(e))?;
            }
        }
        self.sink.sender.detach();
        Ok(())
    }
}
