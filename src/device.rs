//! Device stream boundary.
//!
//! Format negotiation, transport setup and device enumeration all happen
//! before a stream reaches this crate; the endpoint only consumes the narrow
//! surface below. [`LoopbackDevice`] is the in-process implementation used by
//! the self-tests and the `playoutctl` demo loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const MIN_WRITE_TIMEOUT_NANOS: u64 = 250_000_000;

/// Failure surface of a device stream. No panics cross this boundary; every
/// condition the hardware can signal is a value here or a short `Ok` count.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The device endpoint went away; the session cannot continue.
    #[error("device stream disconnected")]
    Disconnected,
    /// A blocking write exceeded its deadline.
    #[error("device write timed out after {0} ns")]
    Timeout(u64),
    /// The requested ring depth cannot be applied.
    #[error("invalid buffer size: {0} frames")]
    InvalidBufferSize(usize),
    /// Any other device-reported failure, by raw code.
    #[error("device write failed with code {0}")]
    WriteFailed(i32),
}

/// The shared hardware-backed output stream, as the endpoint sees it.
///
/// A successful `write` consumes exactly `frame_count` frames and advances
/// `frames_written`; a short `Ok` count or any error is terminal for the
/// mixing session that observes it.
pub trait DeviceStream: Send + Sync {
    /// Whether the underlying stream is still delivering bursts.
    fn is_active(&self) -> bool;
    /// Monotonic count of frames delivered to hardware.
    fn frames_written(&self) -> u64;
    /// Fixed number of frames the device consumes per transaction.
    fn frames_per_burst(&self) -> usize;
    /// Channel count of the negotiated format.
    fn samples_per_frame(&self) -> usize;
    /// Negotiated sample rate in Hertz.
    fn sample_rate(&self) -> u32;
    /// Upper bound for one blocking write, derived from burst timing.
    fn calculate_reasonable_timeout(&self) -> u64;
    /// Request a ring depth in frames; returns the depth actually applied.
    fn set_buffer_size(&self, frames: usize) -> Result<usize, DeviceError>;
    /// Blocking write of `frame_count` frames from `block`, bounded by
    /// `timeout_nanos`. Returns the frames consumed.
    fn write(
        &self,
        block: &[f32],
        frame_count: usize,
        timeout_nanos: u64,
    ) -> Result<usize, DeviceError>;
}

/// A condition queued onto a [`LoopbackDevice`] to exercise failure paths.
#[derive(Clone, Copy, Debug)]
pub enum DeviceFault {
    /// The next write reports disconnection and deactivates the device.
    Disconnect,
    /// The next write consumes only this many frames.
    ShortWrite(usize),
    /// The next write times out.
    Timeout,
    /// The next write fails with the given raw code.
    Fail(i32),
}

/// In-process device stream: consumes bursts into a capture buffer at an
/// optional real-time pace. Fault injection drives the endpoint's
/// disconnect and short-write handling in tests.
pub struct LoopbackDevice {
    sample_rate: u32,
    frames_per_burst: usize,
    samples_per_frame: usize,
    max_buffer_frames: usize,
    buffer_size_frames: AtomicUsize,
    frames_written: AtomicU64,
    active: AtomicBool,
    paced: bool,
    capture: Option<Mutex<Vec<f32>>>,
    faults: Mutex<VecDeque<DeviceFault>>,
}

impl LoopbackDevice {
    /// Create an active device with the given geometry, capturing every
    /// written sample. Writes return immediately.
    pub fn new(sample_rate: u32, frames_per_burst: usize, samples_per_frame: usize) -> Self {
        Self {
            sample_rate,
            frames_per_burst,
            samples_per_frame,
            max_buffer_frames: frames_per_burst.saturating_mul(16).max(1),
            buffer_size_frames: AtomicUsize::new(frames_per_burst.saturating_mul(2)),
            frames_written: AtomicU64::new(0),
            active: AtomicBool::new(true),
            paced: false,
            capture: Some(Mutex::new(Vec::new())),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a device that sleeps one burst period per write instead of
    /// retaining samples, for long-running demo loops.
    pub fn paced(sample_rate: u32, frames_per_burst: usize, samples_per_frame: usize) -> Self {
        let mut device = Self::new(sample_rate, frames_per_burst, samples_per_frame);
        device.paced = true;
        device.capture = None;
        device
    }

    /// Queue a fault for an upcoming write, in injection order.
    pub fn inject_fault(&self, fault: DeviceFault) {
        self.faults.lock().push_back(fault);
    }

    /// Number of injected faults not yet consumed by a write.
    pub fn pending_faults(&self) -> usize {
        self.faults.lock().len()
    }

    /// Deactivate the stream, as if the device were stopped externally.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Applied ring depth in frames.
    pub fn buffer_size_frames(&self) -> usize {
        self.buffer_size_frames.load(Ordering::Acquire)
    }

    /// Drain and return everything written so far.
    pub fn take_captured(&self) -> Vec<f32> {
        match &self.capture {
            Some(capture) => std::mem::take(&mut *capture.lock()),
            None => Vec::new(),
        }
    }

    fn burst_period(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(
            self.frames_per_burst as u64 * NANOS_PER_SECOND / self.sample_rate as u64,
        )
    }
}

impl DeviceStream for LoopbackDevice {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Acquire)
    }

    fn frames_per_burst(&self) -> usize {
        self.frames_per_burst
    }

    fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn calculate_reasonable_timeout(&self) -> u64 {
        if self.sample_rate == 0 {
            return MIN_WRITE_TIMEOUT_NANOS;
        }
        let burst_nanos = self.frames_per_burst as u64 * NANOS_PER_SECOND / self.sample_rate as u64;
        (burst_nanos * 8).max(MIN_WRITE_TIMEOUT_NANOS)
    }

    fn set_buffer_size(&self, frames: usize) -> Result<usize, DeviceError> {
        if frames == 0 || self.frames_per_burst == 0 {
            return Err(DeviceError::InvalidBufferSize(frames));
        }
        let applied = frames.clamp(self.frames_per_burst, self.max_buffer_frames);
        self.buffer_size_frames.store(applied, Ordering::Release);
        Ok(applied)
    }

    fn write(
        &self,
        block: &[f32],
        frame_count: usize,
        timeout_nanos: u64,
    ) -> Result<usize, DeviceError> {
        if !self.is_active() {
            return Err(DeviceError::Disconnected);
        }

        if let Some(fault) = self.faults.lock().pop_front() {
            match fault {
                DeviceFault::Disconnect => {
                    self.active.store(false, Ordering::Release);
                    return Err(DeviceError::Disconnected);
                }
                DeviceFault::ShortWrite(frames) => {
                    let consumed = frames.min(frame_count);
                    self.frames_written
                        .fetch_add(consumed as u64, Ordering::AcqRel);
                    return Ok(consumed);
                }
                DeviceFault::Timeout => return Err(DeviceError::Timeout(timeout_nanos)),
                DeviceFault::Fail(code) => return Err(DeviceError::WriteFailed(code)),
            }
        }

        let samples = frame_count * self.samples_per_frame;
        if let Some(capture) = &self.capture {
            capture.lock().extend_from_slice(&block[..samples]);
        }
        if self.paced {
            std::thread::sleep(self.burst_period().min(Duration::from_nanos(timeout_nanos)));
        }
        self.frames_written
            .fetch_add(frame_count as u64, Ordering::AcqRel);
        Ok(frame_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_advance_the_frame_counter_and_capture() {
        let device = LoopbackDevice::new(48_000, 128, 2);
        let block = vec![0.5f32; 256];
        assert_eq!(device.write(&block, 128, 1_000_000), Ok(128));
        assert_eq!(device.frames_written(), 128);
        assert_eq!(device.take_captured().len(), 256);
    }

    #[test]
    fn disconnect_fault_deactivates_the_stream() {
        let device = LoopbackDevice::new(48_000, 128, 2);
        device.inject_fault(DeviceFault::Disconnect);
        let block = vec![0.0f32; 256];
        assert_eq!(
            device.write(&block, 128, 1_000_000),
            Err(DeviceError::Disconnected)
        );
        assert!(!device.is_active());
        assert_eq!(device.frames_written(), 0);
    }

    #[test]
    fn short_write_consumes_partial_burst() {
        let device = LoopbackDevice::new(48_000, 128, 2);
        device.inject_fault(DeviceFault::ShortWrite(100));
        let block = vec![0.0f32; 256];
        assert_eq!(device.write(&block, 128, 1_000_000), Ok(100));
        assert_eq!(device.frames_written(), 100);
    }

    #[test]
    fn buffer_size_is_clamped_to_device_limits() {
        let device = LoopbackDevice::new(48_000, 128, 2);
        assert_eq!(device.set_buffer_size(64), Ok(128));
        assert_eq!(device.set_buffer_size(512), Ok(512));
        assert_eq!(device.set_buffer_size(1 << 20), Ok(128 * 16));
        assert_eq!(
            device.set_buffer_size(0),
            Err(DeviceError::InvalidBufferSize(0))
        );
    }

    #[test]
    fn timeout_scales_with_burst_but_has_a_floor() {
        let device = LoopbackDevice::new(48_000, 128, 2);
        assert_eq!(device.calculate_reasonable_timeout(), MIN_WRITE_TIMEOUT_NANOS);

        let slow = LoopbackDevice::new(8_000, 4_096, 2);
        assert!(slow.calculate_reasonable_timeout() > MIN_WRITE_TIMEOUT_NANOS);
    }
}
