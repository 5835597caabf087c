//! Key Monitor - Console tool for checking key input from the keyboard
//!
//! Usage: cargo run --bin key_monitor -- [--device <name>] [--duration <secs>]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use midir::MidiInput;

use keyhint::config::TrainerConfig;
use keyhint::device::{find_port, port_names};
use keyhint::keys::KeyState;
use keyhint::midi::{note_name, parse_key_message};

#[derive(Parser, Debug)]
#[command(name = "key_monitor", about = "Print key presses of the keyboard")]
struct Args {
    /// Input port name (defaults to device_name from the config)
    #[arg(short, long)]
    device: Option<String>,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = TrainerConfig::load(TrainerConfig::default_path())?;
    let device = args.device.unwrap_or(config.device_name);

    println!("=== Key Monitor ===");

    let midi_in = MidiInput::new("key-monitor").context("Failed to create MIDI input")?;

    // List available ports
    println!("Available MIDI input ports:");
    for (i, name) in port_names(&midi_in).iter().enumerate() {
        println!("  {}: {}", i, name);
    }
    println!();

    let port = find_port(&midi_in, &device).with_context(|| format!("Port \"{}\" not found", device))?;
    println!("Connecting to: {}\n", device);
    println!("{:<14} {:<8} {:<6} {}", "TIME", "EVENT", "KEY", "HELD");
    println!("{}", "-".repeat(60));

    let keys = Arc::new(Mutex::new(KeyState::new(config.keyboard)));
    let state = keys.clone();
    let _connection = midi_in
        .connect(
            &port,
            "key-monitor-in",
            move |_timestamp, message, _| {
                let Some(msg) = parse_key_message(message) else {
                    return;
                };
                let mut keys = state.lock().unwrap();
                let in_range = keys.range().contains(msg.key);
                keys.set_key(msg);

                let held: Vec<String> = keys.pressed().iter().map(|&k| note_name(k)).collect();
                let event = match (msg.on, in_range) {
                    (_, false) => "IGNORED",
                    (true, true) => "PRESS",
                    (false, true) => "RELEASE",
                };
                println!(
                    "{:<14} {:<8} {:<6} {}",
                    Local::now().format("%H:%M:%S%.3f"),
                    event,
                    note_name(msg.key),
                    held.join(" ")
                );
                // Flush to ensure immediate output
                let _ = io::stdout().flush();
            },
            (),
        )
        .map_err(|e| anyhow::anyhow!("Failed to connect: {}", e))?;

    if let Some(secs) = args.duration {
        println!("\nMonitoring for {} seconds...\n", secs);
        std::thread::sleep(Duration::from_secs(secs));
    } else {
        println!("\nPress Enter to quit (or use --duration <secs>)...\n");
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
    }

    let held = keys.lock().unwrap().pressed().len();
    println!("{} keys still held", held);
    Ok(())
}
