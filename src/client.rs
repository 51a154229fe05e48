//! Per-client stream handles registered with the playback endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::ring::FrameRing;

/// Identifier assigned to a client stream at creation. Stable for the
/// stream's lifetime, unlike a registry slot index, which is only stable
/// within one mixing cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    id: u32,
}

impl ClientHandle {
    pub(crate) fn new(id: u32) -> Self {
        Self { id }
    }

    /// Numeric id for display and control-plane lookups.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Marks the completion of one cycle's transfer out of a client's ring.
///
/// `position_frames` is the ring read counter after the mix step; paired
/// with the monotonic time it anchors the client's own flow-control timing
/// model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferTimestamp {
    /// Absolute read position of the client's ring, in frames.
    pub position_frames: u64,
    /// Monotonic time at which that position was reached.
    pub time_ns: u64,
}

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// One registered application stream.
///
/// The mixing thread writes `timestamp_offset`, `xrun_count` and the
/// transfer timestamp every cycle; the client's own thread reads them
/// without touching the registry lock. The `running` flag flows the other
/// way: the client's state machine flips it, the mixing thread only reads.
pub struct ClientStream {
    handle: ClientHandle,
    ring: Arc<FrameRing>,
    running: AtomicBool,
    disconnected: AtomicBool,
    timestamp_offset: AtomicI64,
    xrun_count: AtomicU32,
    frames_transferred: AtomicU64,
    last_transfer: Mutex<Option<TransferTimestamp>>,
}

impl ClientStream {
    /// Wrap a frame queue as a registrable client stream.
    pub fn new(ring: Arc<FrameRing>) -> Arc<Self> {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            handle: ClientHandle::new(id),
            ring,
            running: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            timestamp_offset: AtomicI64::new(0),
            xrun_count: AtomicU32::new(0),
            frames_transferred: AtomicU64::new(0),
            last_transfer: Mutex::new(None),
        })
    }

    /// Convenience constructor allocating a local ring of `capacity_frames`.
    pub fn with_local_ring(capacity_frames: usize, channels: usize) -> Arc<Self> {
        Self::new(Arc::new(FrameRing::new_local(capacity_frames, channels)))
    }

    /// The stream's stable handle.
    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    /// The stream's frame queue.
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Whether the client's state machine currently wants to be mixed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Client-side control: start or stop participating in the mix.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Whether the endpoint has force-disconnected this stream.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Mark the stream disconnected. Returns true on the first transition
    /// only; the stream also stops running.
    pub(crate) fn disconnect(&self) -> bool {
        self.running.store(false, Ordering::Release);
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Frame offset between the device write position and this client's read
    /// position, as of the last mixing cycle that saw the stream running.
    pub fn timestamp_offset(&self) -> i64 {
        self.timestamp_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_timestamp_offset(&self, offset: i64) {
        self.timestamp_offset.store(offset, Ordering::Release);
    }

    /// Number of cycles on which this client's ring underflowed. Monotonic.
    pub fn xrun_count(&self) -> u32 {
        self.xrun_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_xrun_count(&self) {
        self.xrun_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Total frames the mixer has consumed from this stream.
    pub fn frames_transferred(&self) -> u64 {
        self.frames_transferred.load(Ordering::Acquire)
    }

    /// The most recent transfer timestamp, if the stream has been mixed.
    pub fn last_transfer(&self) -> Option<TransferTimestamp> {
        *self.last_transfer.lock()
    }

    pub(crate) fn mark_transfer(&self, timestamp: TransferTimestamp) {
        self.frames_transferred
            .store(timestamp.position_frames, Ordering::Release);
        *self.last_transfer.lock() = Some(timestamp);
    }

    /// Fraction of the ring currently occupied, for diagnostics.
    pub fn buffer_fill(&self) -> f32 {
        let capacity = self.ring.capacity_frames();
        if capacity == 0 {
            return 0.0;
        }
        self.ring.available_read() as f32 / capacity as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        let a = ClientStream::with_local_ring(64, 2);
        let b = ClientStream::with_local_ring(64, 2);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn disconnect_transitions_exactly_once_and_stops_running() {
        let client = ClientStream::with_local_ring(64, 2);
        client.set_running(true);

        assert!(client.disconnect());
        assert!(client.is_disconnected());
        assert!(!client.is_running());
        assert!(!client.disconnect());
    }

    #[test]
    fn transfer_timestamp_round_trips() {
        let client = ClientStream::with_local_ring(64, 2);
        assert!(client.last_transfer().is_none());

        let stamp = TransferTimestamp {
            position_frames: 1024,
            time_ns: 99,
        };
        client.mark_transfer(stamp);
        assert_eq!(client.last_transfer(), Some(stamp));
        assert_eq!(client.frames_transferred(), 1024);
    }
}
