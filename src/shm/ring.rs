//! Bounded byte ring buffer with message framing.
//!
//! Single producer, single consumer. Messages are length-prefixed with a
//! big-endian `u32` and may be larger than the ring itself: the sender
//! copies in as much as fits and waits for the receiver to free space.
//! Either side may detach at any time; the first detach from one side
//! turns the other side's pending and future operations into
//! `ShmError::PeerDetached` instead of blocking forever.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{atomic_u32, atomic_u64, SharedRegion, ShmError};

/// Smallest ring capacity a channel may be created with. Below this the
/// ring cannot hold a length prefix plus a useful amount of payload.
pub const MIN_RING_CAPACITY: u32 = 64;

/// Bytes of bookkeeping preceding the ring data area.
pub(crate) const RING_HEADER_LEN: usize = 32;

const OFF_SENDER_ATTACHED: usize = 0;
const OFF_RECEIVER_ATTACHED: usize = 4;
const OFF_SENDER_DETACHED: usize = 8;
const OFF_RECEIVER_DETACHED: usize = 12;
const OFF_WRITE_POS: usize = 16;
const OFF_READ_POS: usize = 24;

/// Poll interval used while waiting for ring space or data.
const POLL: Duration = Duration::from_micros(200);

/// Zero the ring bookkeeping for a freshly created channel.
pub(crate) fn init(region: &SharedRegion, ring_off: usize, capacity: u32) {
    debug_assert!(ring_off + RING_HEADER_LEN + capacity as usize <= region.len());
    unsafe {
        for field in [
            OFF_SENDER_ATTACHED,
            OFF_RECEIVER_ATTACHED,
            OFF_SENDER_DETACHED,
            OFF_RECEIVER_DETACHED,
        ] {
            atomic_u32(region, ring_off + field).store(0, Ordering::Relaxed);
        }
        atomic_u64(region, ring_off + OFF_WRITE_POS).store(0, Ordering::Relaxed);
        atomic_u64(region, ring_off + OFF_READ_POS).store(0, Ordering::Release);
    }
}

/// Sending end of the ring, held by the worker process.
pub struct RingSender {
    region: Arc<SharedRegion>,
    ring_off: usize,
    capacity: usize,
    detached: bool,
}

/// Receiving end of the ring, held by the controller.
pub struct RingReceiver {
    region: Arc<SharedRegion>,
    ring_off: usize,
    capacity: usize,
    pending: Vec<u8>,
    detached: bool,
}

impl RingSender {
    pub(crate) fn attach(region: Arc<SharedRegion>, ring_off: usize, capacity: u32) -> Self {
        unsafe { atomic_u32(&region, ring_off + OFF_SENDER_ATTACHED).store(1, Ordering::Release) };
        Self {
            region,
            ring_off,
            capacity: capacity as usize,
            detached: false,
        }
    }

    /// Send one length-prefixed message, blocking while the ring is full.
    pub fn send(&mut self, msg: &[u8]) -> Result<(), ShmError> {
        if msg.len() > u32::MAX as usize {
            return Err(ShmError::MessageTooLarge(msg.len()));
        }
        let prefix = (msg.len() as u32).to_be_bytes();
        self.write_all(&prefix)?;
        self.write_all(msg)
    }

    /// Whether the receiver has detached.
    pub fn peer_detached(&self) -> bool {
        unsafe {
            atomic_u32(&self.region, self.ring_off + OFF_RECEIVER_DETACHED).load(Ordering::Acquire)
                == 1
        }
    }

    /// Mark this end as detached. Idempotent.
    pub fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            unsafe {
                atomic_u32(&self.region, self.ring_off + OFF_SENDER_DETACHED)
                    .store(1, Ordering::Release);
            }
        }
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), ShmError> {
        while !buf.is_empty() {
            if self.detached {
                return Err(ShmError::Detached);
            }
            if self.peer_detached() {
                return Err(ShmError::PeerDetached);
            }
            let write_pos = unsafe {
                atomic_u64(&self.region, self.ring_off + OFF_WRITE_POS).load(Ordering::Relaxed)
            };
            let read_pos = unsafe {
                atomic_u64(&self.region, self.ring_off + OFF_READ_POS).load(Ordering::Acquire)
            };
            let used = (write_pos - read_pos) as usize;
            let free = self.capacity - used;
            if free == 0 {
                std::thread::sleep(POLL);
                continue;
            }

            let n = free.min(buf.len());
            let start = write_pos as usize % self.capacity;
            let first = n.min(self.capacity - start);
            unsafe {
                let data = self.region.as_ptr().add(self.ring_off + RING_HEADER_LEN);
                std::ptr::copy_nonoverlapping(buf.as_ptr(), data.add(start), first);
                if n > first {
                    std::ptr::copy_nonoverlapping(buf.as_ptr().add(first), data, n - first);
                }
                atomic_u64(&self.region, self.ring_off + OFF_WRITE_POS)
                    .store(write_pos + n as u64, Ordering::Release);
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl Drop for RingSender {
    fn drop(&mut self) {
        self.detach();
    }
}

impl RingReceiver {
    pub(crate) fn attach(region: Arc<SharedRegion>, ring_off: usize, capacity: u32) -> Self {
        unsafe { atomic_u32(&region, ring_off + OFF_RECEIVER_ATTACHED).store(1, Ordering::Release) };
        Self {
            region,
            ring_off,
            capacity: capacity as usize,
            pending: Vec::new(),
            detached: false,
        }
    }

    /// Whether the sending side has attached yet. Used by the controller's
    /// post-launch handshake.
    pub fn sender_attached(&self) -> bool {
        unsafe {
            atomic_u32(&self.region, self.ring_off + OFF_SENDER_ATTACHED).load(Ordering::Acquire)
                == 1
        }
    }

    /// Block until the sender attaches, or the timeout elapses.
    pub fn wait_for_sender_attach(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.sender_attached() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL);
        }
        true
    }

    /// Non-blocking receive of one complete message.
    ///
    /// Returns `Ok(None)` when no complete message is buffered yet, and
    /// `Err(PeerDetached)` once the sender has detached and every complete
    /// message has been drained. A partial message left behind by a
    /// detaching sender is reported as `PeerDetached`, not surfaced.
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>, ShmError> {
        if self.detached {
            return Err(ShmError::Detached);
        }
        self.pull();
        if let Some(msg) = self.take_message() {
            return Ok(Some(msg));
        }
        if self.sender_detached() {
            // The sender may have written its final bytes between our pull
            // and the flag read; one more pull closes that window.
            self.pull();
            if let Some(msg) = self.take_message() {
                return Ok(Some(msg));
            }
            return Err(ShmError::PeerDetached);
        }
        Ok(None)
    }

    /// Blocking receive with an optional timeout. `Ok(None)` only on timeout.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, ShmError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.try_recv()? {
                Some(msg) => return Ok(Some(msg)),
                None => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                    std::thread::sleep(POLL);
                }
            }
        }
    }

    /// Whether the sending side has detached.
    pub fn sender_detached(&self) -> bool {
        unsafe {
            atomic_u32(&self.region, self.ring_off + OFF_SENDER_DETACHED).load(Ordering::Acquire)
                == 1
        }
    }

    /// Mark this end as detached. Idempotent.
    pub fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            unsafe {
                atomic_u32(&self.region, self.ring_off + OFF_RECEIVER_DETACHED)
                    .store(1, Ordering::Release);
            }
        }
    }

    /// Move every readable byte from the ring into the local pending buffer.
    fn pull(&mut self) {
        let write_pos = unsafe {
            atomic_u64(&self.region, self.ring_off + OFF_WRITE_POS).load(Ordering::Acquire)
        };
        let read_pos = unsafe {
            atomic_u64(&self.region, self.ring_off + OFF_READ_POS).load(Ordering::Relaxed)
        };
        let avail = (write_pos - read_pos) as usize;
        if avail == 0 {
            return;
        }
        let start = read_pos as usize % self.capacity;
        let first = avail.min(self.capacity - start);
        let old_len = self.pending.len();
        self.pending.reserve(avail);
        unsafe {
            let data = self.region.as_ptr().add(self.ring_off + RING_HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                data.add(start),
                self.pending.as_mut_ptr().add(old_len),
                first,
            );
            if avail > first {
                std::ptr::copy_nonoverlapping(
                    data,
                    self.pending.as_mut_ptr().add(old_len + first),
                    avail - first,
                );
            }
            self.pending.set_len(old_len + avail);
            atomic_u64(&self.region, self.ring_off + OFF_READ_POS)
                .store(read_pos + avail as u64, Ordering::Release);
        }
    }

    /// Pop one complete length-prefixed message from the pending buffer.
    fn take_message(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        if self.pending.len() < 4 + len {
            return None;
        }
        let msg = self.pending[4..4 + len].to_vec();
        self.pending.drain(..4 + len);
        Some(msg)
    }
}

impl Drop for RingReceiver {
    fn drop(&mut self) {
        self.detach();
    }
}
