//! Hint timing: when to blink and when to commit the target keys.
//!
//! Every new target resets the lights and schedules two tasks. The commit
//! task lights the target keys `key_time_offset_ms` before the deadline. If
//! the deadline is still far off, the blink task flashes the keys until the
//! commit happens, slowly at first and faster once the deadline is near.
//!
//! Neither task is cancelled. Both compare the generation they were started
//! for with the player's current one right before acting, under the light
//! scheduler lock, and give up when it moved on. Pausing moves the generation
//! on too; resuming schedules fresh tasks from the remaining time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{broadcast, watch};

use crate::lights::LightHintScheduler;
use crate::player::{PlayerEvent, PracticeState, SharedPlayer};

/// Timing knobs of the hints, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintSettings {
    /// Commit the keys this long before the deadline
    pub key_time_offset_ms: i64,
    /// Start blinking this long before the deadline
    pub blink_start_offset_ms: i64,
    /// Blink length near the deadline
    pub blink_interval_ms: i64,
    /// Blink length far from the deadline
    pub blink_slow_interval_ms: i64,
    /// Switch to fast blinking below this time to the deadline
    pub blink_fast_start_offset_ms: i64,
    /// No blinking below this time to the deadline
    pub late_hint_outdate_ms: i64,
}

impl Default for HintSettings {
    fn default() -> Self {
        Self {
            key_time_offset_ms: 100,
            blink_start_offset_ms: 3000,
            blink_interval_ms: 80,
            blink_slow_interval_ms: 200,
            blink_fast_start_offset_ms: 1000,
            late_hint_outdate_ms: 300,
        }
    }
}

impl HintSettings {
    /// Delay before the keys are committed.
    pub fn commit_delay(&self, time_to_next_key: i64) -> Duration {
        millis(time_to_next_key - self.key_time_offset_ms)
    }

    /// Delay before the first blink.
    pub fn blink_start_delay(&self, time_to_next_key: i64) -> Duration {
        millis(time_to_next_key - self.blink_start_offset_ms)
    }

    /// Whether there is still time for blink hints.
    pub fn should_blink(&self, time_to_next_key: i64) -> bool {
        time_to_next_key > self.late_hint_outdate_ms
    }

    /// How long one blink stays lit.
    pub fn blink_interval(&self, time_to_next_key: i64) -> i64 {
        if time_to_next_key > self.blink_fast_start_offset_ms {
            self.blink_slow_interval_ms
        } else {
            self.blink_interval_ms
        }
    }

    /// Time from one blink to the next: lit, then dark, plus one light tick.
    pub fn blink_period(&self, interval_ms: i64, tick: Duration) -> Duration {
        millis(self.blink_interval_ms + interval_ms) + tick
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Drives a [`LightHintScheduler`] from player events.
#[derive(Clone)]
pub struct NoteHints {
    player: SharedPlayer,
    lights: LightHintScheduler,
    settings: HintSettings,
}

impl NoteHints {
    pub fn new(player: SharedPlayer, lights: LightHintScheduler, settings: HintSettings) -> Self {
        Self {
            player,
            lights,
            settings,
        }
    }

    /// Handle player events until `shutdown` changes.
    pub async fn run(self, mut events: broadcast::Receiver<PlayerEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PlayerEvent::TargetChanged(state) | PlayerEvent::Resumed(state)) => {
                        self.on_target_changed(state, &shutdown);
                    }
                    // Pending tasks went stale with the generation
                    Ok(PlayerEvent::Paused) => {}
                    Ok(PlayerEvent::Stopped) => self.lights.reset(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Hints lagged behind by {} player events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        self.lights.reset();
    }

    fn on_target_changed(&self, state: Arc<PracticeState>, shutdown: &watch::Receiver<bool>) {
        self.lights.reset();
        if state.desired_keys.is_empty() {
            return;
        }

        let time_to_next_key = self.player.lock().unwrap().time_to_next_key();
        let keys: Vec<u8> = state.desired_keys.iter().copied().collect();
        let committed = Arc::new(AtomicBool::new(false));
        debug!(
            "Hinting {:?} for group {}, {} ms ahead",
            keys, state.group, time_to_next_key
        );

        tokio::spawn(self.clone().commit_keys(
            keys.clone(),
            state.generation,
            time_to_next_key,
            committed.clone(),
            shutdown.clone(),
        ));

        if self.settings.should_blink(time_to_next_key) {
            tokio::spawn(self.clone().blink_keys(keys, state.generation, committed, shutdown.clone()));
        }
    }

    /// Permanent hint shortly before the deadline.
    async fn commit_keys(
        self,
        keys: Vec<u8>,
        generation: u64,
        time_to_next_key: i64,
        committed: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !sleep_or_shutdown(self.settings.commit_delay(time_to_next_key), &mut shutdown).await {
            return;
        }
        let player = self.player.clone();
        let set = self
            .lights
            .set_keys_if(keys, || player.lock().unwrap().state().generation == generation);
        if set {
            committed.store(true, Ordering::SeqCst);
        }
    }

    /// Blinking hint until the keys are committed or the target changes.
    async fn blink_keys(
        self,
        keys: Vec<u8>,
        generation: u64,
        committed: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let time_to_next_key = self.player.lock().unwrap().time_to_next_key();
        if !sleep_or_shutdown(self.settings.blink_start_delay(time_to_next_key), &mut shutdown).await {
            return;
        }

        loop {
            let time_to_next_key = self.player.lock().unwrap().time_to_next_key();
            if committed.load(Ordering::SeqCst) || !self.settings.should_blink(time_to_next_key) {
                return;
            }

            let interval = self.settings.blink_interval(time_to_next_key);
            let player = self.player.clone();
            let blinked = self.lights.add_blinks_if(&keys, millis(interval), || {
                !committed.load(Ordering::SeqCst) && player.lock().unwrap().state().generation == generation
            });
            if !blinked {
                return;
            }

            let period = self.settings.blink_period(interval, self.lights.tick_time());
            if !sleep_or_shutdown(period, &mut shutdown).await {
                return;
            }
        }
    }
}

/// Sleep for `duration`. Returns `false` if shutdown came first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}
