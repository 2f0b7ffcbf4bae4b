//! Shared-memory transport layer.
//!
//! A task channel is one shared-memory region holding three things:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ control block   (magic, cancel flag, progress record, ...) │
//! ├────────────────────────────────────────────────────────────┤
//! │ request payload (written once by the controller)           │
//! ├────────────────────────────────────────────────────────────┤
//! │ ring buffer     (worker → controller result frames)        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The controller creates the region and attaches the ring as receiver
//! before the worker is started; the worker attaches by name as sender.
//! The ring carries length-prefixed messages in send order with exactly
//! one producer and one consumer.

mod control;
mod region;
mod ring;

pub use control::{ControlBlock, Progress, PROGRESS_MESSAGE_MAX};
pub use region::SharedRegion;
pub use ring::{RingReceiver, RingSender, MIN_RING_CAPACITY};

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the shared-memory transport.
#[derive(Error, Debug)]
pub enum ShmError {
    /// A shared-memory syscall failed.
    #[error("shared memory operation failed: {0}")]
    Os(#[from] io::Error),

    /// The attached region does not carry the expected magic number.
    #[error("bad magic number in shared memory segment")]
    BadMagic,

    /// The attached region was created by an incompatible version.
    #[error("unsupported channel layout version {0}")]
    BadVersion(u32),

    /// The opposite endpoint has detached; pending and future operations
    /// on this endpoint will not make progress.
    #[error("peer endpoint has detached")]
    PeerDetached,

    /// This endpoint has already detached.
    #[error("endpoint already detached")]
    Detached,

    /// A single message exceeded the framing limit.
    #[error("message of {0} bytes exceeds the framing limit")]
    MessageTooLarge(usize),
}

pub(crate) const CHANNEL_MAGIC: u32 = 0x544D_494C;
pub(crate) const CHANNEL_VERSION: u32 = 1;

/// Byte offset of the ring header for a given request length.
pub(crate) fn ring_offset(request_len: usize) -> usize {
    (control::HEADER_LEN + request_len + 7) & !7
}

/// Total region size for a given request length and ring capacity.
pub fn region_size(request_len: usize, capacity: u32) -> usize {
    ring_offset(request_len) + ring::RING_HEADER_LEN + capacity as usize
}

/// Create a channel region, initialize its control block and ring, and
/// attach the receiving end. The request payload is copied into the region
/// so the worker can read it after attaching by name.
pub fn create_channel(
    name: &str,
    request: &[u8],
    capacity: u32,
    exec_timeout_ms: u32,
) -> Result<(Arc<SharedRegion>, RingReceiver, ControlBlock), ShmError> {
    let size = region_size(request.len(), capacity);
    let region = Arc::new(SharedRegion::create(name, size)?);

    control::init(&region, request, capacity, exec_timeout_ms);
    let ring_off = ring_offset(request.len());
    ring::init(&region, ring_off, capacity);

    let receiver = RingReceiver::attach(Arc::clone(&region), ring_off, capacity);
    let ctl = ControlBlock::new(Arc::clone(&region));
    Ok((region, receiver, ctl))
}

/// Attach to an existing channel region by name from the worker process.
/// Returns the sending end, the control block view and the request payload.
pub fn open_channel(name: &str) -> Result<(RingSender, ControlBlock, Vec<u8>), ShmError> {
    let region = Arc::new(SharedRegion::open(name)?);
    control::validate(&region)?;

    let ctl = ControlBlock::new(Arc::clone(&region));
    let request = ctl.request_bytes();
    let capacity = ctl.ring_capacity();
    let ring_off = ring_offset(request.len());

    let sender = RingSender::attach(region, ring_off, capacity);
    Ok((sender, ctl, request))
}

/// View an atomic `u32` living inside a mapped region.
///
/// Safety: the caller must pass an offset that is within the mapped length
/// and 4-byte aligned; the region base is page aligned so any offset that
/// is a multiple of 4 qualifies.
pub(crate) unsafe fn atomic_u32(region: &SharedRegion, offset: usize) -> &std::sync::atomic::AtomicU32 {
    debug_assert!(offset + 4 <= region.len());
    debug_assert_eq!(offset % 4, 0);
    &*(region.as_ptr().add(offset) as *const std::sync::atomic::AtomicU32)
}

/// View an atomic `u64` living inside a mapped region.
pub(crate) unsafe fn atomic_u64(region: &SharedRegion, offset: usize) -> &std::sync::atomic::AtomicU64 {
    debug_assert!(offset + 8 <= region.len());
    debug_assert_eq!(offset % 8, 0);
    &*(region.as_ptr().add(offset) as *const std::sync::atomic::AtomicU64)
}
