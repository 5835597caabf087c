//! Light Check - Console tool for checking the keyboard's key lights
//!
//! Lights a chord that is larger than the keyboard can show at once, so the
//! rotation through the chord should be visible, then a run of blink hints.
//!
//! Usage: cargo run --bin light_check -- [--device <name>] [--seconds <secs>]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::sync::watch;

use keyhint::config::TrainerConfig;
use keyhint::device::{run_heartbeat, DisconnectSignal, LightSink, MidiLightOutput};
use keyhint::lights::LightHintScheduler;
use keyhint::midi::note_name;

/// C major scale from C4, more keys than can be lit at once
const CHORD: [u8; 7] = [60, 62, 64, 65, 67, 69, 71];

#[derive(Parser, Debug)]
#[command(name = "light_check", about = "Cycle key lights on the keyboard")]
struct Args {
    /// Output port name (defaults to device_name from the config)
    #[arg(short, long)]
    device: Option<String>,

    /// How long to show each phase
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = TrainerConfig::load(TrainerConfig::default_path())?;
    let device = args.device.unwrap_or(config.device_name);
    let phase = Duration::from_secs(args.seconds);

    println!("=== Light Check ===");
    let output = Arc::new(MidiLightOutput::connect(&device, config.device.port_retry()).await?);
    let sink: Arc<dyn LightSink> = output;

    let disconnect = DisconnectSignal::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let lights = LightHintScheduler::new(sink.clone(), disconnect.clone(), config.device.light_tick());

    let heartbeat = tokio::spawn(run_heartbeat(
        sink,
        config.device.heartbeat(),
        disconnect.clone(),
        shutdown_rx.clone(),
    ));
    let ticker = tokio::spawn(lights.clone().run(shutdown_rx));

    let names: Vec<String> = CHORD.iter().map(|&k| note_name(k)).collect();
    println!("Rotating through {}", names.join(" "));
    info!("Showing {} keys", CHORD.len());
    lights.set_keys(CHORD.to_vec());

    tokio::select! {
        _ = tokio::time::sleep(phase) => {}
        _ = disconnect.wait() => {}
    }

    if !disconnect.is_fired() {
        println!("Blinking {}", names.join(" "));
        lights.set_keys(Vec::new());
        let blink = Duration::from_millis(config.player.blink_slow_interval_ms.max(1) as u64);
        let deadline = tokio::time::Instant::now() + phase;
        while tokio::time::Instant::now() < deadline && !disconnect.is_fired() {
            for &key in &CHORD {
                lights.add_blink(key, blink);
            }
            tokio::time::sleep(blink * 2 + lights.tick_time()).await;
        }
    }

    shutdown_tx.send_replace(true);
    let _ = ticker.await;
    let _ = heartbeat.await;

    if disconnect.is_fired() {
        anyhow::bail!("Device \"{}\" went away", device);
    }
    println!("Done");
    Ok(())
}
