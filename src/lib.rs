#![deny(missing_docs)]

//! Real-time mixing endpoint for a low-latency playback service.
//!
//! A [`SharedPlaybackEndpoint`] fans in the frame queues of dynamically
//! registered client streams, sums them into one burst-sized block, and
//! pushes that block to a shared device stream on a dedicated mixing thread.
//! Clients push interleaved `f32` PCM into their own
//! [`FrameRing`](ring::FrameRing); the endpoint publishes per-client timing
//! metadata (timestamp offset, transfer timestamps, xrun counts) that the
//! clients' flow-control logic consumes from their own threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::{ClientStream, TransferTimestamp};
use crate::device::{DeviceError, DeviceStream};
use crate::mix::MixAccumulator;
use crate::ring::monotonic_time_ns;

pub mod client;
pub mod config;
/// Developer-facing control API and console.
pub mod control;
pub mod device;
pub mod mix;
pub mod ring;

#[cfg(test)]
mod tests;

pub use config::MixerConfig;

const BURSTS_PER_BUFFER_DEFAULT: u32 = 2;

// Matches the legacy per-stream volume; mixing policy beyond this lives
// outside the endpoint.
const UNITY_GAIN: f32 = 1.0;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Error enumeration surfaced by endpoint operations.
#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
    /// The underlying device stream rejected an operation during open.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The stream is already present in the registry.
    #[error("client stream {0} is already registered")]
    AlreadyRegistered(u32),
    /// The stream is not present in the registry.
    #[error("client stream {0} is not registered")]
    UnknownStream(u32),
    /// The mixing thread is already running.
    #[error("mixing thread already started")]
    AlreadyStarted,
    /// The mixing thread could not be spawned.
    #[error("failed to spawn mixing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Per-client diagnostics exposed to control tooling.
#[derive(Clone, Debug)]
pub struct ClientStatus {
    /// Stable id of the client stream.
    pub id: u32,
    /// Whether the client currently participates in the mix.
    pub running: bool,
    /// Whether the endpoint has force-disconnected the client.
    pub disconnected: bool,
    /// Cycles on which the client's ring underflowed.
    pub xrun_count: u32,
    /// Device-write position minus client read position, in frames.
    pub timestamp_offset: i64,
    /// Fraction of the client's ring currently occupied.
    pub buffer_fill: f32,
    /// Total frames consumed from the client.
    pub frames_transferred: u64,
}

/// Aggregated endpoint snapshot used by control surfaces.
#[derive(Clone, Debug)]
pub struct EndpointStatus {
    /// Negotiated sample rate in Hertz.
    pub sample_rate: u32,
    /// Channels per frame.
    pub samples_per_frame: usize,
    /// Device burst size in frames.
    pub frames_per_burst: usize,
    /// Applied device ring depth in frames.
    pub buffer_size_frames: usize,
    /// Whether buffer depth may be auto-tuned later.
    pub latency_tuning_enabled: bool,
    /// Whether the mixing loop is currently requested to run.
    pub mixing_enabled: bool,
    /// Whether the device stream is still active.
    pub device_active: bool,
    /// Frames delivered to hardware so far.
    pub frames_written: u64,
    /// Per-client diagnostics in registry order.
    pub clients: Vec<ClientStatus>,
}

/// State shared between the control side and the mixing thread.
struct EndpointCore {
    device: Arc<dyn DeviceStream>,
    frames_per_burst: usize,
    callback_enabled: AtomicBool,
    registered: Mutex<Vec<Arc<ClientStream>>>,
    mixer: Mutex<MixAccumulator>,
}

impl EndpointCore {
    fn should_continue(&self, last_write_ok: bool) -> bool {
        self.callback_enabled.load(Ordering::Acquire) && self.device.is_active() && last_write_ok
    }

    // One mixing cycle per device burst period: clear the accumulator,
    // snapshot the device write position, mix every running client under
    // the registry lock, then write the block with the lock released.
    fn callback_loop(&self) {
        let timeout_nanos = self.device.calculate_reasonable_timeout();
        let mut mixer = self.mixer.lock();
        let mut last_write: Result<usize, DeviceError> = Ok(self.frames_per_burst);

        while self.should_continue(last_write.is_ok()) {
            mixer.clear();
            {
                let frames_written = self.device.frames_written();
                let registered = self.registered.lock();
                // The slot index advances for every registry entry, running
                // or not: a slot is a registry position, not a running-client
                // ordinal.
                for (index, client) in registered.iter().enumerate() {
                    if !client.is_running() {
                        continue;
                    }
                    // The device write position and the client's read
                    // position refer to the same frame; their difference is
                    // the client's end-to-end offset. Recomputed from
                    // scratch each cycle so it cannot drift.
                    let offset = frames_written as i64 - client.ring().read_counter() as i64;
                    client.set_timestamp_offset(offset);

                    let underflowed = mixer.mix(index, client.ring(), UNITY_GAIN);

                    // Read counter re-read after the mix: the timestamp
                    // marks the completion of data leaving the client's
                    // ring, which its timing model uses to decide when
                    // there is room to write more.
                    client.mark_transfer(TransferTimestamp {
                        position_frames: client.ring().read_counter(),
                        time_ns: monotonic_time_ns(),
                    });

                    if underflowed {
                        client.increment_xrun_count();
                    }
                }
            }

            last_write = self
                .device
                .write(mixer.output(), self.frames_per_burst, timeout_nanos);
            match last_write {
                Err(DeviceError::Disconnected) => {
                    info!("device stream disconnected; releasing registered clients");
                    self.disconnect_registered_streams();
                    break;
                }
                Ok(written) if written != self.frames_per_burst => {
                    warn!(
                        written,
                        requested = self.frames_per_burst,
                        "short burst write; stopping mixing session"
                    );
                    break;
                }
                Err(err) => {
                    warn!(%err, "device write failed; stopping mixing session");
                    break;
                }
                Ok(_) => {}
            }
        }

        debug!("mixing loop exited");
    }

    // Mark every registered client disconnected, exactly once each, under
    // the same lock discipline as the mixing traversal.
    fn disconnect_registered_streams(&self) {
        let registered = self.registered.lock();
        let mut released = 0usize;
        for client in registered.iter() {
            if client.disconnect() {
                released += 1;
            }
        }
        info!(
            released,
            total = registered.len(),
            "disconnected registered clients"
        );
    }
}

/// The shared playback endpoint: owns the client registry, the device-facing
/// stream handle, and the mixing thread.
///
/// Exactly two roles touch an endpoint: a control thread (open, register,
/// unregister, enable/disable) and the single mixing thread spawned by
/// [`start`](Self::start). The registry lock is held only for the
/// snapshot-and-mix section of a cycle, never across the blocking device
/// write, so registration is not starved by device latency.
pub struct SharedPlaybackEndpoint {
    core: Arc<EndpointCore>,
    samples_per_frame: usize,
    buffer_size_frames: usize,
    latency_tuning_enabled: bool,
    mix_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SharedPlaybackEndpoint {
    /// Open an endpoint over an already-negotiated device stream.
    ///
    /// Allocates the mix accumulator for the device geometry and applies the
    /// buffer depth policy: an auto config (`bursts_per_buffer == 0`)
    /// enables latency tuning and uses the built-in default of
    /// 2 bursts; otherwise the configured count is used as-is. A device that
    /// rejects the sizing request fails the open and nothing is retained.
    pub fn open(
        device: Arc<dyn DeviceStream>,
        config: MixerConfig,
    ) -> Result<Arc<Self>, EndpointError> {
        init_tracing();

        let samples_per_frame = device.samples_per_frame();
        let frames_per_burst = device.frames_per_burst();
        let mixer = MixAccumulator::allocate(samples_per_frame, frames_per_burst);

        let (bursts_per_buffer, latency_tuning_enabled) = if config.is_auto() {
            (BURSTS_PER_BUFFER_DEFAULT, true)
        } else {
            (config.bursts_per_buffer, false)
        };
        let desired = bursts_per_buffer as usize * frames_per_burst;
        let buffer_size_frames = device.set_buffer_size(desired)?;

        info!(
            frames_per_burst,
            buffer_size_frames, latency_tuning_enabled, "opened shared playback endpoint"
        );

        Ok(Arc::new(Self {
            core: Arc::new(EndpointCore {
                device,
                frames_per_burst,
                callback_enabled: AtomicBool::new(false),
                registered: Mutex::new(Vec::new()),
                mixer: Mutex::new(mixer),
            }),
            samples_per_frame,
            buffer_size_frames,
            latency_tuning_enabled,
            mix_thread: Mutex::new(None),
        }))
    }

    /// Channels per frame of the device stream.
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Device burst size in frames.
    pub fn frames_per_burst(&self) -> usize {
        self.core.frames_per_burst
    }

    /// Ring depth applied to the device at open time.
    pub fn buffer_size_frames(&self) -> usize {
        self.buffer_size_frames
    }

    /// Whether buffer depth may later be auto-tuned.
    pub fn latency_tuning_enabled(&self) -> bool {
        self.latency_tuning_enabled
    }

    /// Frames delivered to hardware so far.
    pub fn frames_written(&self) -> u64 {
        self.core.device.frames_written()
    }

    /// Add a client stream to the registry. The stream is mixed starting
    /// with the first cycle that snapshots the registry after this call.
    pub fn register_stream(&self, client: Arc<ClientStream>) -> Result<(), EndpointError> {
        let mut registered = self.core.registered.lock();
        if registered.iter().any(|c| Arc::ptr_eq(c, &client)) {
            return Err(EndpointError::AlreadyRegistered(client.handle().id()));
        }
        debug!(client = client.handle().id(), "registering client stream");
        registered.push(client);
        Ok(())
    }

    /// Remove a client stream from the registry. Blocks at most for the
    /// current cycle's snapshot-and-mix section, never for a device write.
    pub fn unregister_stream(&self, client: &Arc<ClientStream>) -> Result<(), EndpointError> {
        let mut registered = self.core.registered.lock();
        match registered.iter().position(|c| Arc::ptr_eq(c, client)) {
            Some(index) => {
                registered.remove(index);
                debug!(client = client.handle().id(), "unregistered client stream");
                Ok(())
            }
            None => Err(EndpointError::UnknownStream(client.handle().id())),
        }
    }

    /// Request or revoke mixing without touching the registry lock. The
    /// mixing thread observes the flag at the top of its next cycle; an
    /// in-flight cycle (including its device write) always completes.
    pub fn set_callback_enabled(&self, enabled: bool) {
        self.core.callback_enabled.store(enabled, Ordering::Release);
    }

    /// Spawn the mixing thread. Fails if it is already running.
    pub fn start(&self) -> Result<(), EndpointError> {
        let mut slot = self.mix_thread.lock();
        if slot.is_some() {
            return Err(EndpointError::AlreadyStarted);
        }
        self.set_callback_enabled(true);
        let core = Arc::clone(&self.core);
        let handle = std::thread::Builder::new()
            .name("playout-mix".into())
            .spawn(move || core.callback_loop())?;
        *slot = Some(handle);
        Ok(())
    }

    /// Revoke the callback flag and wait for the mixing thread to finish
    /// its in-flight cycle and exit.
    pub fn stop(&self) {
        self.set_callback_enabled(false);
        if let Some(handle) = self.mix_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Look up a registered stream by its handle id.
    pub fn client_by_id(&self, id: u32) -> Option<Arc<ClientStream>> {
        self.core
            .registered
            .lock()
            .iter()
            .find(|c| c.handle().id() == id)
            .cloned()
    }

    /// Snapshot endpoint and per-client state for control surfaces.
    pub fn status(&self) -> EndpointStatus {
        let clients = self
            .core
            .registered
            .lock()
            .iter()
            .map(|client| ClientStatus {
                id: client.handle().id(),
                running: client.is_running(),
                disconnected: client.is_disconnected(),
                xrun_count: client.xrun_count(),
                timestamp_offset: client.timestamp_offset(),
                buffer_fill: client.buffer_fill(),
                frames_transferred: client.frames_transferred(),
            })
            .collect();

        EndpointStatus {
            sample_rate: self.core.device.sample_rate(),
            samples_per_frame: self.samples_per_frame,
            frames_per_burst: self.core.frames_per_burst,
            buffer_size_frames: self.buffer_size_frames,
            latency_tuning_enabled: self.latency_tuning_enabled,
            mixing_enabled: self.core.callback_enabled.load(Ordering::Acquire),
            device_active: self.core.device.is_active(),
            frames_written: self.core.device.frames_written(),
            clients,
        }
    }
}

static ACTIVE_ENDPOINT: Lazy<RwLock<Option<Arc<SharedPlaybackEndpoint>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide endpoint handle used by the control layer.
pub fn set_active_endpoint(endpoint: Option<Arc<SharedPlaybackEndpoint>>) {
    *ACTIVE_ENDPOINT.write() = endpoint;
}

/// Fetch the currently installed endpoint handle, if any.
pub fn active_endpoint() -> Option<Arc<SharedPlaybackEndpoint>> {
    ACTIVE_ENDPOINT.read().clone()
}

/// Snapshot the active endpoint's status, if one is installed.
pub fn get_endpoint_status() -> Option<EndpointStatus> {
    active_endpoint().map(|endpoint| endpoint.status())
}
