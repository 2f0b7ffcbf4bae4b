//! Channel control block: identification header, request payload, the
//! cancel-requested flag, and the progress record.
//!
//! The progress record is published under a release/acquire discipline:
//! the writer stores the message text first and then the percentage with a
//! release store, so a reader that acquires the percentage always sees the
//! message that logically precedes it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{atomic_u32, SharedRegion, ShmError, CHANNEL_MAGIC, CHANNEL_VERSION};

/// Longest progress message, in bytes.
pub const PROGRESS_MESSAGE_MAX: usize = 63;

/// Sentinel meaning "no progress published yet".
const PCT_NONE: u32 = u32::MAX;

pub(crate) const HEADER_LEN: usize = 96;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_CAPACITY: usize = 8;
const OFF_REQUEST_LEN: usize = 12;
const OFF_EXEC_TIMEOUT: usize = 16;
const OFF_CANCEL: usize = 20;
const OFF_PROGRESS_PCT: usize = 24;
const OFF_PROGRESS_MSG: usize = 32; // 1 length byte + up to 63 data bytes

/// A published progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Percent complete, 0..=100.
    pub pct: u8,
    /// Short status message.
    pub message: String,
}

/// Write the channel header and request payload into a fresh region.
pub(crate) fn init(region: &SharedRegion, request: &[u8], capacity: u32, exec_timeout_ms: u32) {
    debug_assert!(HEADER_LEN + request.len() <= region.len());
    unsafe {
        atomic_u32(region, OFF_MAGIC).store(CHANNEL_MAGIC, Ordering::Relaxed);
        atomic_u32(region, OFF_VERSION).store(CHANNEL_VERSION, Ordering::Relaxed);
        atomic_u32(region, OFF_CAPACITY).store(capacity, Ordering::Relaxed);
        atomic_u32(region, OFF_REQUEST_LEN).store(request.len() as u32, Ordering::Relaxed);
        atomic_u32(region, OFF_EXEC_TIMEOUT).store(exec_timeout_ms, Ordering::Relaxed);
        atomic_u32(region, OFF_CANCEL).store(0, Ordering::Relaxed);
        atomic_u32(region, OFF_PROGRESS_PCT).store(PCT_NONE, Ordering::Relaxed);
        std::ptr::write_bytes(region.as_ptr().add(OFF_PROGRESS_MSG), 0, 64);
        std::ptr::copy_nonoverlapping(
            request.as_ptr(),
            region.as_ptr().add(HEADER_LEN),
            request.len(),
        );
        // Publish the header before any peer can observe it.
        atomic_u32(region, OFF_MAGIC).store(CHANNEL_MAGIC, Ordering::Release);
    }
}

/// Check magic and layout version of an attached region.
pub(crate) fn validate(region: &SharedRegion) -> Result<(), ShmError> {
    if region.len() < HEADER_LEN {
        return Err(ShmError::BadMagic);
    }
    let magic = unsafe { atomic_u32(region, OFF_MAGIC).load(Ordering::Acquire) };
    if magic != CHANNEL_MAGIC {
        return Err(ShmError::BadMagic);
    }
    let version = unsafe { atomic_u32(region, OFF_VERSION).load(Ordering::Relaxed) };
    if version != CHANNEL_VERSION {
        return Err(ShmError::BadVersion(version));
    }
    Ok(())
}

/// View over the control block of a mapped channel region. Cloneable and
/// usable from either side of the channel.
#[derive(Clone)]
pub struct ControlBlock {
    region: Arc<SharedRegion>,
}

impl ControlBlock {
    pub(crate) fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    /// Ring capacity recorded at creation time.
    pub fn ring_capacity(&self) -> u32 {
        unsafe { atomic_u32(&self.region, OFF_CAPACITY).load(Ordering::Relaxed) }
    }

    /// Worker execution timeout in milliseconds; zero means none.
    pub fn exec_timeout_ms(&self) -> u32 {
        unsafe { atomic_u32(&self.region, OFF_EXEC_TIMEOUT).load(Ordering::Relaxed) }
    }

    /// Copy of the request payload written at creation time.
    pub fn request_bytes(&self) -> Vec<u8> {
        let len = unsafe { atomic_u32(&self.region, OFF_REQUEST_LEN).load(Ordering::Relaxed) } as usize;
        let len = len.min(self.region.len().saturating_sub(HEADER_LEN));
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.as_ptr().add(HEADER_LEN),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    /// Ask the worker to stop at its next safe point.
    pub fn request_cancel(&self) {
        unsafe { atomic_u32(&self.region, OFF_CANCEL).store(1, Ordering::Release) };
    }

    /// Whether cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        unsafe { atomic_u32(&self.region, OFF_CANCEL).load(Ordering::Acquire) == 1 }
    }

    /// Publish a progress report. The message is truncated to
    /// [`PROGRESS_MESSAGE_MAX`] bytes on a character boundary.
    pub fn publish_progress(&self, pct: u8, message: &str) {
        let pct = pct.min(100);
        let mut end = message.len().min(PROGRESS_MESSAGE_MAX);
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &message.as_bytes()[..end];
        unsafe {
            let msg_ptr = self.region.as_ptr().add(OFF_PROGRESS_MSG);
            *msg_ptr = bytes.len() as u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), msg_ptr.add(1), bytes.len());
            // Message first, then the percentage with release ordering.
            atomic_u32(&self.region, OFF_PROGRESS_PCT).store(pct as u32, Ordering::Release);
        }
    }

    /// Read the latest progress report, if any was ever published.
    pub fn read_progress(&self) -> Option<Progress> {
        loop {
            let pct = unsafe { atomic_u32(&self.region, OFF_PROGRESS_PCT).load(Ordering::Acquire) };
            if pct == PCT_NONE {
                return None;
            }
            let mut buf = [0u8; PROGRESS_MESSAGE_MAX + 1];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.region.as_ptr().add(OFF_PROGRESS_MSG),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            // Retry if a newer report landed while we copied the message.
            let pct_after =
                unsafe { atomic_u32(&self.region, OFF_PROGRESS_PCT).load(Ordering::Acquire) };
            if pct_after != pct {
                continue;
            }
            let len = (buf[0] as usize).min(PROGRESS_MESSAGE_MAX);
            // The transport carries UTF-8; convert back to a native string.
            let message = String::from_utf8_lossy(&buf[1..1 + len]).into_owned();
            return Some(Progress {
                pct: pct as u8,
                message,
            });
        }
    }
}
