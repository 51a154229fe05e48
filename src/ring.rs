//! Shared-memory friendly single-producer/single-consumer frame queue.
//!
//! Each registered client stream owns one [`FrameRing`]: the application
//! process pushes interleaved `f32` PCM frames, the mixing thread pops them.
//! Both indices are monotonic 64-bit frame counters that never wrap, so the
//! read index doubles as the client's absolute read position — the value the
//! endpoint subtracts from the device write position to compute a timestamp
//! offset.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;

/// Queue state stored at the front of the backing region so that a peer
/// process mapping the same memory can inspect it without calling into
/// this crate.
#[repr(C, align(64))]
pub struct RingHeader {
    capacity_frames: u32,
    channels: u32,
    reserved: u32,
    write_index: AtomicU64,
    read_index: AtomicU64,
    last_write_ns: AtomicU64,
}

impl RingHeader {
    fn new(capacity_frames: usize, channels: usize) -> Self {
        Self {
            capacity_frames: capacity_frames as u32,
            channels: channels as u32,
            reserved: 0,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            last_write_ns: AtomicU64::new(0),
        }
    }
}

enum RingStorage {
    Local {
        header: UnsafeCell<RingHeader>,
        data: UnsafeCell<Box<[f32]>>,
    },
    Shared {
        mmap: UnsafeCell<MmapMut>,
    },
}

unsafe impl Send for RingStorage {}
unsafe impl Sync for RingStorage {}

/// Lock-free SPSC queue of interleaved `f32` audio frames.
pub struct FrameRing {
    storage: RingStorage,
    capacity_frames: usize,
    channels: usize,
}

unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Create a ring backed by process-local heap storage.
    pub fn new_local(capacity_frames: usize, channels: usize) -> Self {
        let data = vec![0.0f32; capacity_frames * channels].into_boxed_slice();
        Self {
            storage: RingStorage::Local {
                header: UnsafeCell::new(RingHeader::new(capacity_frames, channels)),
                data: UnsafeCell::new(data),
            },
            capacity_frames,
            channels,
        }
    }

    /// Create a ring backed by an anonymous shared memory mapping, suitable
    /// for handing the data region to a client in another process.
    pub fn new_shared(capacity_frames: usize, channels: usize) -> std::io::Result<Self> {
        let samples = capacity_frames * channels;
        let bytes = size_of::<RingHeader>() + size_of::<f32>() * samples;
        let mut mmap = MmapOptions::new().len(bytes).map_anon()?;
        let header_ptr = mmap.as_mut_ptr() as *mut RingHeader;
        unsafe {
            header_ptr.write(RingHeader::new(capacity_frames, channels));
        }
        Ok(Self {
            storage: RingStorage::Shared {
                mmap: UnsafeCell::new(mmap),
            },
            capacity_frames,
            channels,
        })
    }

    fn header(&self) -> &RingHeader {
        match &self.storage {
            RingStorage::Local { header, .. } => unsafe { &*header.get() },
            RingStorage::Shared { mmap } => unsafe {
                &*((*mmap.get()).as_ptr() as *const RingHeader)
            },
        }
    }

    fn data(&self) -> &[f32] {
        let samples = self.capacity_frames * self.channels;
        match &self.storage {
            RingStorage::Local { data, .. } => unsafe { &(&(*data.get()))[..] },
            RingStorage::Shared { mmap } => unsafe {
                let base = (*mmap.get()).as_ptr().add(size_of::<RingHeader>());
                std::slice::from_raw_parts(base as *const f32, samples)
            },
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut [f32] {
        let samples = self.capacity_frames * self.channels;
        match &self.storage {
            RingStorage::Local { data, .. } => unsafe { &mut (&mut (*data.get()))[..] },
            RingStorage::Shared { mmap } => unsafe {
                let base = (*mmap.get()).as_mut_ptr().add(size_of::<RingHeader>());
                std::slice::from_raw_parts_mut(base as *mut f32, samples)
            },
        }
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Channels per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Absolute number of frames consumed since creation. Monotonic, never
    /// wraps.
    pub fn read_counter(&self) -> u64 {
        self.header().read_index.load(Ordering::Acquire)
    }

    /// Absolute number of frames produced since creation.
    pub fn write_counter(&self) -> u64 {
        self.header().write_index.load(Ordering::Acquire)
    }

    /// Frames currently queued for the consumer.
    pub fn available_read(&self) -> usize {
        let header = self.header();
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        write.saturating_sub(read).min(self.capacity_frames as u64) as usize
    }

    /// Timestamp of the most recent push.
    pub fn last_write_ns(&self) -> u64 {
        self.header().last_write_ns.load(Ordering::Acquire)
    }

    /// Push interleaved frames, returning how many frames were accepted.
    /// Never blocks; a full ring accepts zero.
    pub fn push(&self, frames: &[f32], timestamp_ns: Option<u64>) -> usize {
        let header = self.header();
        let frame_count = frames.len() / self.channels;
        if frame_count == 0 {
            return 0;
        }

        let capacity = self.capacity_frames as u64;
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        let used = write.saturating_sub(read).min(capacity);
        let free = (capacity - used) as usize;
        if free == 0 {
            return 0;
        }

        let to_write = frame_count.min(free);
        let data = self.data_mut();
        let start = (write % capacity) as usize;
        let first = (self.capacity_frames - start).min(to_write);
        let first_samples = first * self.channels;
        let dest = start * self.channels;
        data[dest..dest + first_samples].copy_from_slice(&frames[..first_samples]);
        if to_write > first {
            let rest_samples = (to_write - first) * self.channels;
            data[..rest_samples]
                .copy_from_slice(&frames[first_samples..first_samples + rest_samples]);
        }

        header
            .write_index
            .store(write + to_write as u64, Ordering::Release);
        header.last_write_ns.store(
            timestamp_ns.unwrap_or_else(monotonic_time_ns),
            Ordering::Release,
        );
        to_write
    }

    /// Pop interleaved frames into `out`, returning how many frames were
    /// copied. Never blocks; an empty ring yields zero.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let header = self.header();
        let requested = out.len() / self.channels;
        if requested == 0 {
            return 0;
        }

        let capacity = self.capacity_frames as u64;
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        let available = write.saturating_sub(read).min(capacity) as usize;
        if available == 0 {
            return 0;
        }

        let to_read = requested.min(available);
        let data = self.data();
        let start = (read % capacity) as usize;
        let first = (self.capacity_frames - start).min(to_read);
        let first_samples = first * self.channels;
        let src = start * self.channels;
        out[..first_samples].copy_from_slice(&data[src..src + first_samples]);
        if to_read > first {
            let rest_samples = (to_read - first) * self.channels;
            out[first_samples..first_samples + rest_samples].copy_from_slice(&data[..rest_samples]);
        }

        header
            .read_index
            .store(read + to_read as u64, Ordering::Release);
        to_read
    }

    /// Drop queued frames without copying, returning the number discarded.
    pub fn discard(&self, frames: usize) -> usize {
        let header = self.header();
        let capacity = self.capacity_frames as u64;
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        let available = write.saturating_sub(read).min(capacity) as usize;
        let dropped = frames.min(available);
        header
            .read_index
            .store(read + dropped as u64, Ordering::Release);
        dropped
    }
}

/// Monotonic timestamp in nanoseconds since an arbitrary process epoch.
pub fn monotonic_time_ns() -> u64 {
    static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order_across_wrap() {
        let ring = FrameRing::new_local(8, 2);
        let mut out = vec![0.0f32; 16];

        for round in 0..5 {
            let base = round as f32 * 100.0;
            let frames: Vec<f32> = (0..12).map(|i| base + i as f32).collect();
            let wrote = ring.push(&frames, None);
            assert_eq!(wrote, 6);
            let read = ring.pop(&mut out[..12]);
            assert_eq!(read, 6);
            assert_eq!(&out[..12], &frames[..12]);
        }
    }

    #[test]
    fn read_counter_is_monotonic_and_absolute() {
        let ring = FrameRing::new_local(16, 1);
        assert_eq!(ring.read_counter(), 0);

        let frames = vec![0.5f32; 16];
        let mut out = vec![0.0f32; 16];
        for expected in (4u64..=40).step_by(4) {
            ring.push(&frames[..4], None);
            ring.pop(&mut out[..4]);
            assert_eq!(ring.read_counter(), expected);
        }
    }

    #[test]
    fn full_ring_rejects_and_empty_ring_yields_zero() {
        let ring = FrameRing::new_local(4, 2);
        let frames = vec![1.0f32; 8];
        assert_eq!(ring.push(&frames, None), 4);
        assert_eq!(ring.push(&frames, None), 0);

        let mut out = vec![0.0f32; 8];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(ring.pop(&mut out), 0);
    }

    #[test]
    fn discard_advances_the_read_counter() {
        let ring = FrameRing::new_local(8, 2);
        let frames = vec![1.0f32; 16];
        ring.push(&frames, None);
        assert_eq!(ring.discard(3), 3);
        assert_eq!(ring.read_counter(), 3);
        assert_eq!(ring.available_read(), 5);
        assert_eq!(ring.discard(100), 5);
    }

    #[test]
    fn shared_mapping_behaves_like_local() {
        let ring = FrameRing::new_shared(8, 2).expect("anonymous mapping");
        let frames: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert_eq!(ring.push(&frames, Some(7)), 8);
        assert_eq!(ring.last_write_ns(), 7);

        let mut out = vec![0.0f32; 16];
        assert_eq!(ring.pop(&mut out), 8);
        assert_eq!(&out, &frames[..]);
    }
}
