use std::env;
use std::f32::consts::TAU;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use playout_kit::client::ClientStream;
use playout_kit::config::MixerConfig;
use playout_kit::device::LoopbackDevice;
use playout_kit::ring::monotonic_time_ns;
use playout_kit::{SharedPlaybackEndpoint, set_active_endpoint};

const SAMPLE_RATE: u32 = 48_000;
const FRAMES_PER_BURST: usize = 256;
const CHANNELS: usize = 2;

fn print_status() {
    match playout_kit::control::api::get_status() {
        Some(status) => {
            println!("Sample Rate  : {} Hz", status.sample_rate);
            println!("Burst Size   : {} frames", status.frames_per_burst);
            println!("Buffer Size  : {} frames", status.buffer_size_frames);
            println!("Frames Out   : {}", status.frames_written);
            println!(
                "Mixing       : {}",
                if status.mixing_enabled { "on" } else { "off" }
            );
            println!(
                "Latency Mode : {}",
                if status.latency_tuning_enabled {
                    "auto"
                } else {
                    "fixed"
                }
            );
            println!("Clients:");
            for client in status.clients {
                let state = if client.disconnected {
                    "disconnected"
                } else if client.running {
                    "running"
                } else {
                    "paused"
                };
                println!(
                    "  [{}] {} | xruns={} | offset={} frames | transferred={} | fill={:.1}%",
                    client.id,
                    state,
                    client.xrun_count,
                    client.timestamp_offset,
                    client.frames_transferred,
                    client.buffer_fill * 100.0,
                );
            }
        }
        None => {
            eprintln!("playoutctl: no active endpoint detected");
            process::exit(1);
        }
    }
}

/// Stand up an endpoint over a paced loopback device, feed it two sine
/// clients, and leave the console attached to it.
fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let device = Arc::new(LoopbackDevice::paced(
        SAMPLE_RATE,
        FRAMES_PER_BURST,
        CHANNELS,
    ));
    let endpoint = SharedPlaybackEndpoint::open(device, MixerConfig::from_env())?;

    for frequency_hz in [440.0f32, 660.0] {
        let client = ClientStream::with_local_ring(FRAMES_PER_BURST * 8, CHANNELS);
        endpoint.register_stream(Arc::clone(&client))?;
        client.set_running(true);
        spawn_sine_feeder(client, frequency_hz);
    }

    endpoint.start()?;
    set_active_endpoint(Some(Arc::clone(&endpoint)));

    let result = playout_kit::control::ui::run();

    set_active_endpoint(None);
    endpoint.stop();
    result
}

fn spawn_sine_feeder(client: Arc<ClientStream>, frequency_hz: f32) {
    std::thread::spawn(move || {
        let mut phase = 0.0f32;
        let step = frequency_hz / SAMPLE_RATE as f32;
        let mut block = vec![0.0f32; FRAMES_PER_BURST * CHANNELS];
        while !client.is_disconnected() {
            for frame in block.chunks_exact_mut(CHANNELS) {
                let value = (phase * TAU).sin() * 0.25;
                frame.fill(value);
                phase = (phase + step).fract();
            }
            let mut offset = 0;
            while offset < block.len() {
                let wrote = client.ring().push(&block[offset..], Some(monotonic_time_ns()));
                if wrote == 0 {
                    break;
                }
                offset += wrote * CHANNELS;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    });
}

fn main() {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => {
                print_status();
                return;
            }
            "--demo" | "-d" => {
                if let Err(err) = run_demo() {
                    eprintln!("playoutctl: {err}");
                    process::exit(1);
                }
                return;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: playoutctl [--status | --demo]\n\nWithout arguments the interactive console attaches to the active endpoint."
                );
                return;
            }
            other => {
                eprintln!("playoutctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if let Err(err) = playout_kit::control::ui::run() {
        eprintln!("playoutctl: {err}");
        process::exit(1);
    }
}
