//! Key light scheduling.
//!
//! The keyboard can light only [`MAX_KEYS_DISPLAYED`] keys at once, while the
//! hints may want any number of keys lit: the committed target keys plus
//! short-lived blink hints. [`LightHintScheduler`] reconciles the two on a
//! fixed tick. When the desired set fits it is shown as is; when it does not,
//! a window of four slides over it one step per tick so every desired key is
//! shown in turn.
//!
//! # Thread Safety
//! The scheduler is mutated from the tick loop, the hint timers and blink
//! expiry. All of its state lives behind one mutex, taken for the smallest
//! read-modify-write of the lists and the lit queue.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::device::{DisconnectSignal, LightSink};
use crate::midi::NoteMessage;

/// Hardware limit of simultaneously lit keys
pub const MAX_KEYS_DISPLAYED: usize = 4;

/// Keys that are physically lit right now.
///
/// Sends a light command for every change and broadcasts it. Once the device
/// is disconnected, changes are tracked but nothing is sent.
pub struct LightState {
    lit: Vec<u8>,
    sink: Arc<dyn LightSink>,
    disconnect: DisconnectSignal,
    changes: broadcast::Sender<NoteMessage>,
}

impl LightState {
    pub fn new(sink: Arc<dyn LightSink>, disconnect: DisconnectSignal) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            lit: Vec::new(),
            sink,
            disconnect,
            changes,
        }
    }

    pub fn lit(&self) -> &[u8] {
        &self.lit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoteMessage> {
        self.changes.subscribe()
    }

    /// Light exactly `keys` (first four, duplicates ignored).
    pub fn set_multiple_lights(&mut self, keys: &[u8]) {
        let mut wanted: Vec<u8> = Vec::with_capacity(MAX_KEYS_DISPLAYED);
        for &key in keys {
            if wanted.len() == MAX_KEYS_DISPLAYED {
                break;
            }
            if !wanted.contains(&key) {
                wanted.push(key);
            }
        }

        let extra: Vec<u8> = self.lit.iter().copied().filter(|k| !wanted.contains(k)).collect();
        let new: Vec<u8> = wanted.iter().copied().filter(|k| !self.lit.contains(k)).collect();

        for key in extra {
            self.send(key, false);
        }
        for key in new {
            self.send(key, true);
        }
        self.lit = wanted;
    }

    /// Turn every lit key off.
    pub fn reset_keys(&mut self) {
        self.set_multiple_lights(&[]);
    }

    fn send(&self, key: u8, on: bool) {
        if !self.disconnect.is_fired() {
            if let Err(e) = self.sink.send_key_light(key, on) {
                debug!("Light command failed: {}", e);
                self.disconnect.fire();
            }
        }
        let _ = self.changes.send(NoteMessage::new(key, on));
    }
}

#[derive(Debug, Clone, Copy)]
struct Blink {
    key: u8,
    expires_at: Instant,
}

struct SchedulerInner {
    lights: LightState,
    /// Committed target keys
    active: Vec<u8>,
    /// Newest first
    blinks: Vec<Blink>,
    roll_cycle: usize,
    /// Identity of the desired set, to detect additions and removals
    desired: BTreeSet<u8>,
}

impl SchedulerInner {
    /// Active keys first, then blink keys, without duplicates.
    fn final_state(&self) -> Vec<u8> {
        let mut keys: Vec<u8> = Vec::with_capacity(self.active.len() + self.blinks.len());
        for key in self.active.iter().copied().chain(self.blinks.iter().map(|b| b.key)) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Restart the rotation whenever a key joins or leaves the desired set.
    fn refresh_desired(&mut self) {
        let desired: BTreeSet<u8> = self
            .active
            .iter()
            .copied()
            .chain(self.blinks.iter().map(|b| b.key))
            .collect();
        if desired != self.desired {
            self.desired = desired;
            self.roll_cycle = 0;
        }
    }

    fn add_blink(&mut self, key: u8, duration: Duration, now: Instant) {
        let expires_at = now + duration;
        match self.blinks.iter_mut().find(|b| b.key == key) {
            Some(blink) => blink.expires_at = blink.expires_at.max(expires_at),
            None => self.blinks.insert(0, Blink { key, expires_at }),
        }
        self.refresh_desired();
    }

    fn set_keys(&mut self, keys: Vec<u8>) {
        self.active = keys;
        self.refresh_desired();
    }

    fn tick(&mut self, now: Instant) {
        self.blinks.retain(|b| b.expires_at > now);
        self.refresh_desired();

        let mut final_state = self.final_state();
        if final_state.len() <= MAX_KEYS_DISPLAYED {
            self.lights.set_multiple_lights(&final_state);
            return;
        }

        let count = final_state.len();
        final_state.rotate_left(self.roll_cycle % count);
        self.lights.set_multiple_lights(&final_state[..MAX_KEYS_DISPLAYED]);
        self.roll_cycle = (self.roll_cycle + 1) % count;
    }

    fn reset(&mut self) {
        self.active.clear();
        self.blinks.clear();
        self.refresh_desired();
        self.lights.reset_keys();
    }
}

/// Maps an unbounded desired key set onto the lit-key limit.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LightHintScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    tick: Duration,
}

impl LightHintScheduler {
    pub fn new(sink: Arc<dyn LightSink>, disconnect: DisconnectSignal, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                lights: LightState::new(sink, disconnect),
                active: Vec::new(),
                blinks: Vec::new(),
                roll_cycle: 0,
                desired: BTreeSet::new(),
            })),
            tick,
        }
    }

    pub fn tick_time(&self) -> Duration {
        self.tick
    }

    /// Commit the target keys and light them right away.
    pub fn set_keys(&self, keys: Vec<u8>) {
        self.set_keys_if(keys, || true);
    }

    /// Like [`LightHintScheduler::set_keys`], but only if `is_current` still
    /// holds under the scheduler lock. Returns whether the keys were set.
    pub fn set_keys_if(&self, keys: Vec<u8>, is_current: impl FnOnce() -> bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !is_current() {
            return false;
        }
        inner.set_keys(keys);
        inner.tick(Instant::now());
        true
    }

    /// Add a blink hint that expires after `duration`.
    pub fn add_blink(&self, key: u8, duration: Duration) {
        self.add_blink_at(key, duration, Instant::now());
    }

    pub fn add_blink_at(&self, key: u8, duration: Duration, now: Instant) {
        self.inner.lock().unwrap().add_blink(key, duration, now);
    }

    /// Blink `keys` if `is_current` still holds under the scheduler lock.
    pub fn add_blinks_if(&self, keys: &[u8], duration: Duration, is_current: impl FnOnce() -> bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !is_current() {
            return false;
        }
        let now = Instant::now();
        for &key in keys {
            inner.add_blink(key, duration, now);
        }
        true
    }

    /// Drop all hints and turn every light off.
    pub fn reset(&self) {
        self.inner.lock().unwrap().reset();
    }

    pub fn on_tick(&self) {
        self.on_tick_at(Instant::now());
    }

    /// Run one scheduling step at `now` (for testing).
    pub fn on_tick_at(&self, now: Instant) {
        self.inner.lock().unwrap().tick(now);
    }

    /// Keys lit right now.
    pub fn lit(&self) -> Vec<u8> {
        self.inner.lock().unwrap().lights.lit().to_vec()
    }

    /// Committed target keys.
    pub fn active(&self) -> Vec<u8> {
        self.inner.lock().unwrap().active.clone()
    }

    /// Committed keys plus unexpired blinks.
    pub fn desired(&self) -> BTreeSet<u8> {
        self.inner.lock().unwrap().desired.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoteMessage> {
        self.inner.lock().unwrap().lights.subscribe()
    }

    /// Tick until `shutdown` changes, then turn the lights off.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.on_tick(),
                _ = shutdown.changed() => break,
            }
        }
        self.reset();
    }
}
