//! Keyboard connection: named MIDI ports, light output and heartbeat.
//!
//! Ports are matched by exact name. A missing device is not an error: opening
//! waits and rescans until the device appears. Once connected, a failed send
//! on the light output fires a [`DisconnectSignal`] exactly once; the owning
//! session is expected to tear everything down and reconnect from scratch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use midir::{MidiIO, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, TrainerError};
use crate::midi::{hold_message, key_light_message, parse_key_message, NoteMessage};

const CLIENT_NAME: &str = "keyhint";

/// Destination for light sysex messages.
///
/// Implemented by the real MIDI output and by test doubles.
pub trait LightSink: Send + Sync {
    fn send(&self, message: &[u8]) -> Result<()>;

    /// Turn one key light on or off.
    fn send_key_light(&self, key: u8, on: bool) -> Result<()> {
        self.send(&key_light_message(key, on))
    }

    /// Keep the keyboard's light subsystem under our control.
    fn send_hold(&self) -> Result<()> {
        self.send(&hold_message())
    }
}

/// One-shot "device went away" flag shared by everything that talks to it.
#[derive(Clone)]
pub struct DisconnectSignal {
    fired: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl DisconnectSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Raise the signal. Returns `true` only for the first call.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Device disconnected");
        self.tx.send_replace(true);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only returns once fired
        let _ = rx.wait_for(|&fired| fired).await;
    }
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Send the hold message every `period` until shutdown or the first failure.
///
/// A failed send fires `disconnect` and ends the loop; it never panics.
pub async fn run_heartbeat(
    sink: Arc<dyn LightSink>,
    period: Duration,
    disconnect: DisconnectSignal,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if disconnect.is_fired() {
                    return;
                }
                if let Err(e) = sink.send_hold() {
                    warn!("Heartbeat failed: {}", e);
                    disconnect.fire();
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Find a port whose name is exactly `name`.
pub fn find_port<T: MidiIO>(io: &T, name: &str) -> Option<T::Port> {
    io.ports()
        .into_iter()
        .find(|port| io.port_name(port).map(|n| n == name).unwrap_or(false))
}

/// Names of all ports of a MIDI client.
pub fn port_names<T: MidiIO>(io: &T) -> Vec<String> {
    io.ports()
        .iter()
        .map(|port| io.port_name(port).unwrap_or_else(|_| "Unknown".to_string()))
        .collect()
}

fn try_find<T: MidiIO>(new_client: &impl Fn() -> Result<T>, name: &str) -> Result<Option<(T, T::Port)>> {
    let io = new_client()?;
    Ok(find_port(&io, name).map(|port| (io, port)))
}

/// Rescan every `retry` until a port named `name` shows up.
async fn wait_for_port<T: MidiIO>(
    new_client: impl Fn() -> Result<T>,
    name: &str,
    retry: Duration,
) -> Result<(T, T::Port)> {
    let mut warned = false;
    loop {
        if let Some(found) = try_find(&new_client, name)? {
            return Ok(found);
        }
        if !warned {
            warn!("Port \"{}\" not found, waiting for device to be available", name);
            warned = true;
        }
        tokio::time::sleep(retry).await;
    }
}

fn new_input() -> Result<MidiInput> {
    MidiInput::new(CLIENT_NAME).map_err(|e| TrainerError::Device(format!("Failed to create MIDI input: {}", e)))
}

fn new_output() -> Result<MidiOutput> {
    MidiOutput::new(CLIENT_NAME).map_err(|e| TrainerError::Device(format!("Failed to create MIDI output: {}", e)))
}

/// Key presses from the keyboard.
pub struct KeyboardInput {
    _connection: MidiInputConnection<()>,
    pub port_name: String,
}

impl KeyboardInput {
    /// Wait for the named input port and forward its key changes to `on_key`.
    ///
    /// `on_key` runs on the MIDI driver thread.
    pub async fn connect<F>(name: &str, retry: Duration, mut on_key: F) -> Result<Self>
    where
        F: FnMut(NoteMessage) + Send + 'static,
    {
        let (midi_in, port) = wait_for_port(new_input, name, retry).await?;

        let connection = midi_in
            .connect(
                &port,
                "keyhint-keys",
                move |_timestamp, message, _| {
                    if let Some(msg) = parse_key_message(message) {
                        on_key(msg);
                    }
                },
                (),
            )
            .map_err(|e| TrainerError::Connect(format!("Failed to connect MIDI input: {}", e)))?;

        info!("MIDI Input connected to: {}", name);
        Ok(Self {
            _connection: connection,
            port_name: name.to_string(),
        })
    }
}

/// Light output to the keyboard.
pub struct MidiLightOutput {
    connection: Mutex<MidiOutputConnection>,
    pub port_name: String,
}

impl MidiLightOutput {
    /// Wait for the named output port and open it.
    pub async fn connect(name: &str, retry: Duration) -> Result<Self> {
        let (midi_out, port) = wait_for_port(new_output, name, retry).await?;

        let connection = midi_out
            .connect(&port, "keyhint-lights")
            .map_err(|e| TrainerError::Connect(format!("Failed to connect MIDI output: {}", e)))?;

        info!("MIDI Output connected to: {}", name);
        Ok(Self {
            connection: Mutex::new(connection),
            port_name: name.to_string(),
        })
    }
}

impl LightSink for MidiLightOutput {
    fn send(&self, message: &[u8]) -> Result<()> {
        self.connection
            .lock()
            .unwrap()
            .send(message)
            .map_err(|e| TrainerError::Device(format!("Failed to send MIDI: {}", e)))
    }
}

/// Opens the keyboard's two ports.
///
/// Opening waits for the device to show up. A [`TrainerError::Connect`] means
/// the port was there but could not be opened and is worth retrying.
pub trait KeyboardPorts {
    /// Keeps the key input open while alive
    type Input;

    fn open_output(&self) -> impl Future<Output = Result<Arc<dyn LightSink>>>;

    fn open_input<F>(&self, on_key: F) -> impl Future<Output = Result<Self::Input>>
    where
        F: FnMut(NoteMessage) + Send + 'static;

    /// Pause between failed attempts.
    fn retry_delay(&self) -> Duration;
}

/// The keyboard's MIDI ports, matched by exact name.
pub struct MidiPorts {
    pub name: String,
    pub retry: Duration,
}

impl MidiPorts {
    pub fn new(name: impl Into<String>, retry: Duration) -> Self {
        Self {
            name: name.into(),
            retry,
        }
    }
}

impl KeyboardPorts for MidiPorts {
    type Input = KeyboardInput;

    async fn open_output(&self) -> Result<Arc<dyn LightSink>> {
        let output: Arc<dyn LightSink> = Arc::new(MidiLightOutput::connect(&self.name, self.retry).await?);
        Ok(output)
    }

    async fn open_input<F>(&self, on_key: F) -> Result<KeyboardInput>
    where
        F: FnMut(NoteMessage) + Send + 'static,
    {
        KeyboardInput::connect(&self.name, self.retry, on_key).await
    }

    fn retry_delay(&self) -> Duration {
        self.retry
    }
}

/// In-memory [`LightSink`] that records messages and can be told to fail.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<Vec<u8>>>,
        /// Fail every send after this many successful ones
        pub fail_after: Option<usize>,
        calls: AtomicUsize,
        unplugged: AtomicBool,
    }

    impl RecordingSink {
        pub fn failing_after(successes: usize) -> Self {
            Self {
                fail_after: Some(successes),
                ..Self::default()
            }
        }

        /// Fail every send from now on.
        pub fn unplug(&self) {
            self.unplugged.store(true, Ordering::SeqCst);
        }

        pub fn messages(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// (key, on) of every key light command, in order.
        pub fn light_commands(&self) -> Vec<(u8, bool)> {
            self.messages()
                .iter()
                .filter(|m| m.len() == 10)
                .map(|m| (m[7], m[8] == 1))
                .collect()
        }

        pub fn hold_count(&self) -> usize {
            self.messages().iter().filter(|m| m.len() == 8).count()
        }
    }

    impl LightSink for RecordingSink {
        fn send(&self, message: &[u8]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unplugged.load(Ordering::SeqCst) || self.fail_after.is_some_and(|n| call >= n) {
                return Err(TrainerError::Device("Failed to send MIDI: unplugged".to_string()));
            }
            self.sent.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }
}
