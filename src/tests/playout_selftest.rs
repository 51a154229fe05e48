use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::ClientStream;
use crate::config::MixerConfig;
use crate::device::{DeviceStream, LoopbackDevice};
use crate::SharedPlaybackEndpoint;

const SAMPLE_RATE: u32 = 48_000;
const FRAMES_PER_BURST: usize = 256;
const CHANNELS: usize = 2;

#[test]
fn selftest_sine_through_endpoint() {
    let total_frames = (SAMPLE_RATE / 10) as usize; // 100ms
    let frequency_hz = 1_000.0f32;
    let mut input: Vec<f32> = Vec::with_capacity(total_frames * CHANNELS);
    for n in 0..total_frames {
        let phase = frequency_hz * n as f32 / SAMPLE_RATE as f32;
        let sample = (phase * TAU).sin() * 0.5;
        for _ in 0..CHANNELS {
            input.push(sample);
        }
    }

    let device = Arc::new(LoopbackDevice::new(SAMPLE_RATE, FRAMES_PER_BURST, CHANNELS));
    let endpoint =
        SharedPlaybackEndpoint::open(Arc::clone(&device) as Arc<dyn DeviceStream>, MixerConfig::default())
            .expect("open");

    // Queue the whole signal up front so every cycle pops a full burst in
    // order; the capture prefix must then be the input verbatim.
    let client = ClientStream::with_local_ring(total_frames, CHANNELS);
    assert_eq!(client.ring().push(&input, None), total_frames);
    client.set_running(true);
    endpoint.register_stream(Arc::clone(&client)).expect("register");

    endpoint.start().expect("start");
    let deadline = Instant::now() + Duration::from_secs(5);
    while device.frames_written() < total_frames as u64 {
        assert!(Instant::now() < deadline, "mixing thread made no progress");
        std::thread::sleep(Duration::from_millis(1));
    }
    endpoint.stop();

    let recorded = device.take_captured();
    assert!(recorded.len() >= input.len());
    let recorded = &recorded[..input.len()];

    let expected_rms = rms(&input);
    let actual_rms = rms(recorded);
    assert!(
        (expected_rms - actual_rms).abs() < 0.05,
        "RMS mismatch: expected {expected_rms}, got {actual_rms}"
    );

    let corr = correlation(&input, recorded);
    assert!(corr > 0.99, "phase correlation too low: {corr}");

    assert_eq!(client.ring().read_counter(), total_frames as u64);
    assert_eq!(client.frames_transferred(), total_frames as u64);
    let transfer = client.last_transfer().expect("transfer timestamp");
    assert_eq!(transfer.position_frames, total_frames as u64);
}

fn rms(signal: &[f32]) -> f32 {
    let energy: f32 = signal.iter().map(|s| s * s).sum();
    (energy / signal.len() as f32).sqrt()
}

fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        energy_a += (*x as f64).powi(2);
        energy_b += (*y as f64).powi(2);
    }
    if energy_a == 0.0 || energy_b == 0.0 {
        0.0
    } else {
        (dot / (energy_a.sqrt() * energy_b.sqrt())) as f32
    }
}
