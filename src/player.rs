//! Practice state machine.
//!
//! [`MusicPlayer`] owns a parsed timeline and a cursor into it. The current
//! target is the next note group; the learner completes it by holding all of
//! its keys. Completion may be detected early, but the cursor only advances
//! once the group's musical deadline is reached, driven by [`MusicPlayer::update`].
//!
//! # Thread Safety
//! The player itself is single-threaded. It is shared between the frame loop
//! and the MIDI input callback as a [`SharedPlayer`]; every call path takes
//! the mutex for the whole operation, so observers never see a torn state.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::broadcast;

use crate::timeline::{NoteGroup, ParsedMusic};

/// Player shared between the frame loop, key input and hint tasks.
pub type SharedPlayer = Arc<Mutex<MusicPlayer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

/// Snapshot of the current target. Replaced wholesale on every advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PracticeState {
    /// Keys the learner must hold to complete the target
    pub desired_keys: BTreeSet<u8>,
    /// Index of the target group
    pub group: usize,
    /// Index of the group after the target
    pub next_group: usize,
    /// Time between the previous group and the target
    pub group_delta_ms: i64,
    /// Absolute time of the previous group
    pub accumulated_time_ms: i64,
    /// Bumped on every target change, pause, resume and stop
    pub generation: u64,
}

impl Default for PracticeState {
    fn default() -> Self {
        Self {
            desired_keys: BTreeSet::new(),
            group: 0,
            next_group: 1,
            group_delta_ms: 0,
            accumulated_time_ms: 0,
            generation: 0,
        }
    }
}

impl PracticeState {
    fn between(prev: &NoteGroup, target: &NoteGroup, group: usize, generation: u64) -> Self {
        Self {
            desired_keys: target.keys().collect(),
            group,
            next_group: group + 1,
            group_delta_ms: target.time_ms - prev.time_ms,
            accumulated_time_ms: prev.time_ms,
            generation,
        }
    }

    /// The cursor is parked before the first group (stopped or finished).
    pub fn is_idle(&self) -> bool {
        self.group == 0
    }
}

/// Notifications published by the player.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// A new target. After the last group an idle, empty state is sent,
    /// followed by [`PlayerEvent::Stopped`].
    TargetChanged(Arc<PracticeState>),
    /// Time stopped; the target keeps its place but gets a new generation.
    Paused,
    /// Time runs again for this target, under a new generation.
    Resumed(Arc<PracticeState>),
    Stopped,
}

pub struct MusicPlayer {
    groups: Vec<NoteGroup>,
    total_time_ms: i64,
    bpm: f64,
    beat_time_ms: f64,

    state: Arc<PracticeState>,
    play_state: PlayState,
    generation: u64,
    /// Time since the previous group, clamped to the target's delta
    ms_since_group_start: f64,
    /// Time spent past the deadline without completion
    overdue_ms: f64,
    completed: bool,
    advance_pending: bool,
    /// Keys held through the previous completion that must be released first
    nonready_keys: BTreeSet<u8>,
    grace_period_ms: Option<f64>,

    events: broadcast::Sender<PlayerEvent>,
}

impl MusicPlayer {
    pub fn new(grace_period_ms: Option<u32>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            groups: Vec::new(),
            total_time_ms: 0,
            bpm: 0.0,
            beat_time_ms: 0.0,
            state: Arc::new(PracticeState::default()),
            play_state: PlayState::Stopped,
            generation: 0,
            ms_since_group_start: 0.0,
            overdue_ms: 0.0,
            completed: false,
            advance_pending: false,
            nonready_keys: BTreeSet::new(),
            grace_period_ms: grace_period_ms.map(f64::from),
            events,
        }
    }

    /// Wrap into a [`SharedPlayer`].
    pub fn shared(self) -> SharedPlayer {
        Arc::new(Mutex::new(self))
    }

    /// Load a timeline, replacing the previous one, and stop.
    pub fn setup(&mut self, music: ParsedMusic) {
        info!(
            "Loaded {} groups, {} ms, {:.1} BPM",
            music.groups.len(),
            music.total_time_ms,
            music.bpm
        );
        self.groups = music.groups;
        self.total_time_ms = music.total_time_ms;
        self.bpm = music.bpm;
        self.beat_time_ms = music.beat_time_ms;
        self.reset_cursor();
        self.nonready_keys.clear();
        self.play_state = PlayState::Stopped;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Start playing, or resume after [`MusicPlayer::pause`].
    pub fn play(&mut self) {
        match self.play_state {
            PlayState::Playing => {}
            PlayState::Paused => {
                self.play_state = PlayState::Playing;
                self.bump_generation();
                self.emit(PlayerEvent::Resumed(self.state.clone()));
            }
            PlayState::Stopped => {
                self.play_state = PlayState::Playing;
                self.next_target();
            }
        }
    }

    pub fn pause(&mut self) {
        if self.play_state == PlayState::Playing {
            self.play_state = PlayState::Paused;
            self.bump_generation();
            self.emit(PlayerEvent::Paused);
        }
    }

    /// Stop and rewind. Listeners are notified before this returns.
    pub fn stop(&mut self) {
        self.play_state = PlayState::Stopped;
        self.reset_cursor();
        self.emit(PlayerEvent::Stopped);
    }

    /// Move the cursor to the next group, or stop after the last one.
    pub fn next_target(&mut self) {
        let next = self.state.next_group;
        if next >= self.groups.len() {
            info!("Reached the end of the music");
            self.play_state = PlayState::Stopped;
            self.reset_cursor();
            self.emit(PlayerEvent::TargetChanged(self.state.clone()));
            self.emit(PlayerEvent::Stopped);
            return;
        }

        let prev = self.state.group.min(next);
        self.change_target(prev, next);
    }

    /// Jump to an arbitrary group.
    pub fn set_cursor(&mut self, group: usize) {
        if self.groups.is_empty() {
            return;
        }
        let group = group.min(self.groups.len() - 1);
        self.nonready_keys.clear();
        self.change_target(group.saturating_sub(1), group);
    }

    /// Feed the set of currently held keys.
    pub fn on_key_change(&mut self, pressed: &BTreeSet<u8>) {
        if self.play_state != PlayState::Playing {
            return;
        }

        self.nonready_keys = self.nonready_keys.intersection(pressed).copied().collect();

        if self.completed {
            return;
        }

        let satisfied = self
            .state
            .desired_keys
            .iter()
            .all(|key| pressed.contains(key) && !self.nonready_keys.contains(key));
        if !satisfied {
            return;
        }

        debug!("Group {} completed by keys {:?}", self.state.group, pressed);
        self.nonready_keys = pressed.clone();
        self.complete();
    }

    /// Advance the clock by `dt_secs` of frame time.
    pub fn update(&mut self, dt_secs: f64) {
        if self.play_state != PlayState::Playing {
            return;
        }

        let delta = self.state.group_delta_ms as f64;
        let elapsed = self.ms_since_group_start + dt_secs * 1000.0;
        self.overdue_ms += (elapsed - delta).max(0.0);
        self.ms_since_group_start = elapsed.min(delta);

        if self.time_to_next_key() > 0 {
            return;
        }

        if self.advance_pending {
            self.next_target();
            return;
        }

        if self.completed {
            return;
        }

        // An empty group (the lead-out) needs no keys
        let by_time = self.state.desired_keys.is_empty()
            || self.grace_period_ms.is_some_and(|grace| self.overdue_ms >= grace);
        if by_time {
            debug!("Group {} completed by time", self.state.group);
            self.complete();
        }
    }

    pub fn state(&self) -> Arc<PracticeState> {
        self.state.clone()
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn is_playing(&self) -> bool {
        self.play_state == PlayState::Playing
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn nonready_keys(&self) -> &BTreeSet<u8> {
        &self.nonready_keys
    }

    pub fn groups(&self) -> &[NoteGroup] {
        &self.groups
    }

    /// Milliseconds until the target's deadline. Never negative while playing.
    pub fn time_to_next_key(&self) -> i64 {
        self.state.group_delta_ms - self.ms_since_group_start as i64
    }

    pub fn ms_since_group_start(&self) -> i64 {
        self.ms_since_group_start as i64
    }

    /// Position in the music.
    pub fn time_ms(&self) -> i64 {
        self.state.accumulated_time_ms + self.ms_since_group_start as i64
    }

    pub fn total_ms(&self) -> i64 {
        self.total_time_ms
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn beat_time_ms(&self) -> f64 {
        self.beat_time_ms
    }

    fn complete(&mut self) {
        self.completed = true;
        if self.time_to_next_key() <= 0 {
            self.next_target();
        } else {
            self.advance_pending = true;
        }
    }

    fn change_target(&mut self, prev: usize, target: usize) {
        self.generation += 1;
        self.state = Arc::new(PracticeState::between(
            &self.groups[prev],
            &self.groups[target],
            target,
            self.generation,
        ));
        self.ms_since_group_start = 0.0;
        self.overdue_ms = 0.0;
        self.completed = false;
        self.advance_pending = false;

        debug!(
            "Target group {} keys {:?} in {} ms",
            target, self.state.desired_keys, self.state.group_delta_ms
        );
        self.emit(PlayerEvent::TargetChanged(self.state.clone()));
    }

    /// Same target, new generation: anything scheduled for the old one is stale.
    fn bump_generation(&mut self) {
        self.generation += 1;
        self.state = Arc::new(PracticeState {
            generation: self.generation,
            ..(*self.state).clone()
        });
    }

    fn reset_cursor(&mut self) {
        self.generation += 1;
        self.state = Arc::new(PracticeState {
            generation: self.generation,
            ..PracticeState::default()
        });
        self.ms_since_group_start = 0.0;
        self.overdue_ms = 0.0;
        self.completed = false;
        self.advance_pending = false;
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MusicPlayer {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::NotePress;

    fn group(time_ms: i64, keys: &[u8]) -> NoteGroup {
        let notes: Vec<NotePress> = keys
            .iter()
            .map(|&key| NotePress { key, start_offset_ms: 0, duration_ms: 400 })
            .collect();
        NoteGroup {
            time_ms,
            max_duration_ms: if notes.is_empty() { 0 } else { 400 },
            notes,
        }
    }

    /// Lead-in, three chords, lead-out.
    fn make_music() -> ParsedMusic {
        ParsedMusic {
            groups: vec![
                group(0, &[]),
                group(2000, &[60, 64]),
                group(2500, &[62]),
                group(3000, &[62]),
                group(3400, &[]),
            ],
            total_time_ms: 3400,
            bpm: 120.0,
            beat_time_ms: 500.0,
        }
    }

    fn make_player() -> MusicPlayer {
        let mut player = MusicPlayer::new(None);
        player.setup(make_music());
        player
    }

    fn keys(keys: &[u8]) -> BTreeSet<u8> {
        keys.iter().copied().collect()
    }

    fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_initial_state() {
        let player = make_player();
        assert_eq!(player.play_state(), PlayState::Stopped);
        assert!(player.state().is_idle());
        assert_eq!(player.time_ms(), 0);
        assert_eq!(player.total_ms(), 3400);
        assert_eq!(player.bpm(), 120.0);
    }

    #[test]
    fn test_play_targets_first_group() {
        let mut player = make_player();
        let mut rx = player.subscribe();
        player.play();

        let state = player.state();
        assert_eq!(state.desired_keys, keys(&[60, 64]));
        assert_eq!(state.group, 1);
        assert_eq!(state.next_group, 2);
        assert_eq!(state.group_delta_ms, 2000);
        assert_eq!(state.accumulated_time_ms, 0);
        assert_eq!(player.time_to_next_key(), 2000);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PlayerEvent::TargetChanged(s) if s.group == 1));
    }

    #[test]
    fn test_play_twice_is_idempotent() {
        let mut player = make_player();
        let mut rx = player.subscribe();
        player.play();
        let first = player.state();
        player.play();

        assert_eq!(player.state(), first);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_update_only_while_playing() {
        let mut player = make_player();
        player.update(1.0);
        assert_eq!(player.ms_since_group_start(), 0);

        player.play();
        player.update(0.5);
        assert_eq!(player.ms_since_group_start(), 500);
        assert_eq!(player.time_to_next_key(), 1500);
        assert_eq!(player.time_ms(), 500);
    }

    #[test]
    fn test_update_clamps_to_deadline() {
        let mut player = make_player();
        player.play();
        player.update(10.0);
        assert_eq!(player.ms_since_group_start(), 2000);
        assert_eq!(player.time_to_next_key(), 0);
        // Still waiting for the learner
        assert_eq!(player.state().group, 1);
    }

    #[test]
    fn test_early_completion_defers_advance() {
        let mut player = make_player();
        player.play();
        player.update(0.5);

        player.on_key_change(&keys(&[60, 64]));
        assert!(player.is_completed());
        assert_eq!(player.state().group, 1);

        player.update(1.0);
        assert_eq!(player.state().group, 1);
        player.update(0.6);
        assert_eq!(player.state().group, 2);
        assert!(!player.is_completed());
        assert_eq!(player.state().group_delta_ms, 500);
        assert_eq!(player.state().accumulated_time_ms, 2000);
    }

    #[test]
    fn test_late_completion_advances_immediately() {
        let mut player = make_player();
        player.play();
        player.update(3.0);

        player.on_key_change(&keys(&[60]));
        assert_eq!(player.state().group, 1);
        player.on_key_change(&keys(&[60, 64]));
        assert_eq!(player.state().group, 2);
        assert_eq!(player.state().desired_keys, keys(&[62]));
    }

    #[test]
    fn test_extra_keys_still_complete() {
        let mut player = make_player();
        player.play();
        player.update(2.0);
        player.on_key_change(&keys(&[59, 60, 64]));
        assert_eq!(player.state().group, 2);
    }

    #[test]
    fn test_completion_is_exclusive() {
        let mut player = make_player();
        player.play();
        player.on_key_change(&keys(&[60, 64]));
        assert!(player.is_completed());
        let state = player.state();
        let nonready = player.nonready_keys().clone();

        player.on_key_change(&keys(&[60, 64, 67]));
        player.on_key_change(&keys(&[60, 64]));
        assert_eq!(player.state(), state);
        assert!(player.is_completed());
        assert_eq!(player.nonready_keys(), &nonready);
    }

    #[test]
    fn test_held_keys_must_be_released() {
        let mut player = make_player();
        player.play();
        player.update(2.0);
        player.on_key_change(&keys(&[60, 64]));
        player.update(0.5);
        // Group 2 wants 62
        player.on_key_change(&keys(&[62]));
        assert_eq!(player.state().group, 3);

        // Group 3 wants 62 again; holding it through does not count
        assert_eq!(player.nonready_keys(), &keys(&[62]));
        player.update(0.5);
        player.on_key_change(&keys(&[62, 65]));
        assert_eq!(player.state().group, 3);
        assert!(!player.is_completed());

        player.on_key_change(&keys(&[65]));
        assert!(player.nonready_keys().is_empty());
        player.on_key_change(&keys(&[62, 65]));
        assert_eq!(player.state().group, 4);
    }

    #[test]
    fn test_key_changes_ignored_when_stopped() {
        let mut player = make_player();
        player.on_key_change(&keys(&[60, 64]));
        assert!(!player.is_completed());
        assert!(player.state().is_idle());
    }

    #[test]
    fn test_reaching_end_stops() {
        let mut player = make_player();
        player.play();
        let mut rx = player.subscribe();

        player.update(2.0);
        player.on_key_change(&keys(&[60, 64]));
        player.update(0.5);
        player.on_key_change(&keys(&[62]));
        player.on_key_change(&keys(&[]));
        player.update(0.5);
        player.on_key_change(&keys(&[62]));
        assert_eq!(player.state().group, 4);

        // Empty lead-out completes on its own
        player.update(0.4);
        assert_eq!(player.play_state(), PlayState::Stopped);
        assert!(player.state().is_idle());

        let events = drain(&mut rx);
        let n = events.len();
        assert!(matches!(&events[n - 2], PlayerEvent::TargetChanged(s) if s.is_idle() && s.desired_keys.is_empty()));
        assert!(matches!(events[n - 1], PlayerEvent::Stopped));
    }

    #[test]
    fn test_stop_resets_and_notifies() {
        let mut player = make_player();
        player.play();
        player.update(0.7);
        let generation = player.state().generation;
        let mut rx = player.subscribe();

        player.stop();
        assert_eq!(player.play_state(), PlayState::Stopped);
        assert!(player.state().is_idle());
        assert!(player.state().generation > generation);
        assert_eq!(player.time_ms(), 0);
        assert!(matches!(drain(&mut rx).as_slice(), [PlayerEvent::Stopped]));

        player.play();
        assert_eq!(player.state().group, 1);
    }

    #[test]
    fn test_stop_cancels_pending_advance() {
        let mut player = make_player();
        player.play();
        player.on_key_change(&keys(&[60, 64]));
        player.stop();
        player.update(5.0);
        assert!(player.state().is_idle());
    }

    #[test]
    fn test_pause_and_resume() {
        let mut player = make_player();
        player.play();
        player.update(0.5);
        player.pause();
        assert_eq!(player.play_state(), PlayState::Paused);

        player.update(1.0);
        player.on_key_change(&keys(&[60, 64]));
        assert_eq!(player.ms_since_group_start(), 500);
        assert!(!player.is_completed());

        player.play();
        assert_eq!(player.state().group, 1);
        player.update(0.5);
        assert_eq!(player.ms_since_group_start(), 1000);
    }

    #[test]
    fn test_pause_and_resume_renew_generation() {
        let mut player = make_player();
        player.play();
        let mut rx = player.subscribe();
        let playing = player.state();

        player.pause();
        let paused = player.state();
        assert!(paused.generation > playing.generation);
        assert_eq!(paused.group, playing.group);
        assert_eq!(paused.desired_keys, playing.desired_keys);

        player.pause();
        player.play();
        let resumed = player.state();
        assert!(resumed.generation > paused.generation);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PlayerEvent::Paused));
        assert!(matches!(&events[1], PlayerEvent::Resumed(state) if state.generation == resumed.generation));
    }

    #[test]
    fn test_grace_period_completes_by_time() {
        let mut player = MusicPlayer::new(Some(300));
        player.setup(make_music());
        player.play();

        player.update(2.0);
        player.update(0.2);
        assert_eq!(player.state().group, 1);
        player.update(0.1);
        assert_eq!(player.state().group, 2);
    }

    #[test]
    fn test_grace_disabled_waits_forever() {
        let mut player = MusicPlayer::new(None);
        player.setup(make_music());
        player.play();
        for _ in 0..100 {
            player.update(1.0);
        }
        assert_eq!(player.state().group, 1);
    }

    #[test]
    fn test_set_cursor() {
        let mut player = make_player();
        let mut rx = player.subscribe();
        player.set_cursor(3);

        let state = player.state();
        assert_eq!(state.group, 3);
        assert_eq!(state.accumulated_time_ms, 2500);
        assert_eq!(state.group_delta_ms, 500);
        assert_eq!(drain(&mut rx).len(), 1);

        player.set_cursor(99);
        assert_eq!(player.state().group, 4);
    }

    #[test]
    fn test_setup_replaces_timeline() {
        let mut player = make_player();
        player.play();
        player.update(1.0);

        player.setup(ParsedMusic {
            groups: vec![group(0, &[]), group(100, &[70]), group(200, &[])],
            total_time_ms: 200,
            bpm: 60.0,
            beat_time_ms: 1000.0,
        });
        assert_eq!(player.play_state(), PlayState::Stopped);
        assert!(player.state().is_idle());

        player.play();
        assert_eq!(player.state().desired_keys, keys(&[70]));
    }

    #[test]
    fn test_play_without_music_stops() {
        let mut player = MusicPlayer::default();
        player.play();
        assert_eq!(player.play_state(), PlayState::Stopped);
    }
}
