//! The running trainer: configuration, player, held keys and the device loop.
//!
//! A [`Session`] is created once per loaded MIDI file and handed to everything
//! that needs it. [`Session::run_devices`] owns the keyboard connection: it
//! waits for the device, wires key input into the player and player targets
//! into the lights, and starts over whenever the device goes away.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::{broadcast, watch};

use crate::config::TrainerConfig;
use crate::device::{run_heartbeat, DisconnectSignal, KeyboardPorts, MidiPorts};
use crate::error::{Result, TrainerError};
use crate::hints::NoteHints;
use crate::keys::KeyState;
use crate::lights::LightHintScheduler;
use crate::midi::NoteMessage;
use crate::player::{MusicPlayer, SharedPlayer};
use crate::timeline::ParsedMusic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Looking for the named device
    Waiting,
    /// Connected to this port
    Connected(String),
}

pub struct Session {
    config: TrainerConfig,
    player: SharedPlayer,
    keys: Mutex<KeyState>,
    /// Keys lit on the keyboard right now
    lit: Mutex<BTreeSet<u8>>,
    status: Mutex<ConnectionStatus>,
}

impl Session {
    pub fn new(config: TrainerConfig, music: ParsedMusic) -> Self {
        let mut player = MusicPlayer::new(config.player.grace_period_ms);
        player.setup(music);
        Self {
            keys: Mutex::new(KeyState::new(config.keyboard)),
            player: player.shared(),
            lit: Mutex::new(BTreeSet::new()),
            status: Mutex::new(ConnectionStatus::Waiting),
            config,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn player(&self) -> &SharedPlayer {
        &self.player
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn pressed_keys(&self) -> BTreeSet<u8> {
        self.keys.lock().unwrap().pressed().clone()
    }

    pub fn lit_keys(&self) -> BTreeSet<u8> {
        self.lit.lock().unwrap().clone()
    }

    /// Apply a key change from the keyboard and let the player react.
    pub fn handle_key(&self, msg: NoteMessage) {
        let pressed = {
            let mut keys = self.keys.lock().unwrap();
            if !keys.set_key(msg) {
                return;
            }
            keys.pressed().clone()
        };
        self.player.lock().unwrap().on_key_change(&pressed);
    }

    /// Forget held keys, e.g. when the input went away mid-press.
    pub fn release_all_keys(&self) {
        self.keys.lock().unwrap().clear();
        self.player.lock().unwrap().on_key_change(&BTreeSet::new());
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Connect to the keyboard and keep it in sync with the player.
    ///
    /// Runs until the device disconnects with `autoreconnect` off, or a MIDI
    /// client cannot be created at all. Connection futures hold the MIDI
    /// input, so run this with `block_on` rather than spawning it.
    pub async fn run_devices(self: Arc<Self>) -> Result<()> {
        let ports = MidiPorts::new(self.config.device_name.clone(), self.config.device.port_retry());
        self.run_devices_with(ports).await
    }

    /// [`Session::run_devices`] over any way of opening the ports.
    pub async fn run_devices_with<P: KeyboardPorts>(self: Arc<Self>, ports: P) -> Result<()> {
        let name = self.config.device_name.clone();
        let device = self.config.device.clone();

        loop {
            self.set_status(ConnectionStatus::Waiting);
            let session = self.clone();
            let opened = match ports.open_output().await {
                Ok(sink) => ports
                    .open_input(move |msg| session.handle_key(msg))
                    .await
                    .map(|input| (sink, input)),
                Err(e) => Err(e),
            };
            let (sink, input) = match opened {
                Ok(opened) => opened,
                Err(TrainerError::Connect(e)) => {
                    warn!("{}, retrying", e);
                    tokio::time::sleep(ports.retry_delay()).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.set_status(ConnectionStatus::Connected(name.clone()));

            let disconnect = DisconnectSignal::new();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let lights = LightHintScheduler::new(sink.clone(), disconnect.clone(), device.light_tick());
            let events = self.player.lock().unwrap().subscribe();
            let hints = NoteHints::new(self.player.clone(), lights.clone(), self.config.hint_settings());

            let tasks = vec![
                tokio::spawn(self.clone().track_lights(lights.subscribe(), shutdown_rx.clone())),
                tokio::spawn(lights.clone().run(shutdown_rx.clone())),
                tokio::spawn(run_heartbeat(sink.clone(), device.heartbeat(), disconnect.clone(), shutdown_rx.clone())),
                tokio::spawn(hints.run(events, shutdown_rx)),
            ];

            // Reconnected mid-target: show it right away
            let state = self.player.lock().unwrap().state();
            if !state.is_idle() {
                lights.set_keys(state.desired_keys.iter().copied().collect());
            }

            disconnect.wait().await;
            shutdown_tx.send_replace(true);
            for task in tasks {
                let _ = task.await;
            }
            drop(input);
            drop(sink);
            self.lit.lock().unwrap().clear();
            self.release_all_keys();

            if !device.autoreconnect {
                self.set_status(ConnectionStatus::Waiting);
                return Ok(());
            }
            info!("Reconnecting to \"{}\"", name);
        }
    }

    /// Mirror light changes into [`Session::lit_keys`].
    async fn track_lights(self: Arc<Self>, mut changes: broadcast::Receiver<NoteMessage>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(msg) => {
                        let mut lit = self.lit.lock().unwrap();
                        if msg.on {
                            lit.insert(msg.key);
                        } else {
                            lit.remove(&msg.key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}
