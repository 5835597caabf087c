//! Key range filtering and the set of physically held keys.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::midi::NoteMessage;

/// The keys a keyboard physically has, as a half-open MIDI key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRange {
    /// Lowest MIDI key on the keyboard
    pub min_key: u8,
    /// Number of keys starting at `min_key`
    pub key_count: u8,
}

impl KeyRange {
    pub fn new(min_key: u8, key_count: u8) -> Self {
        Self { min_key, key_count }
    }

    /// Highest MIDI key on the keyboard.
    pub fn max_key(&self) -> u8 {
        (self.min_key as u16 + self.key_count as u16).saturating_sub(1).min(127) as u8
    }

    pub fn contains(&self, key: u8) -> bool {
        self.key_count > 0 && key >= self.min_key && key <= self.max_key()
    }
}

impl Default for KeyRange {
    /// 61-key keyboard starting at C2.
    fn default() -> Self {
        Self::new(36, 61)
    }
}

/// Keys currently held down, restricted to a [`KeyRange`].
///
/// Every accepted change is broadcast to subscribers.
pub struct KeyState {
    range: KeyRange,
    pressed: BTreeSet<u8>,
    changes: broadcast::Sender<NoteMessage>,
}

impl KeyState {
    pub fn new(range: KeyRange) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            range,
            pressed: BTreeSet::new(),
            changes,
        }
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn pressed(&self) -> &BTreeSet<u8> {
        &self.pressed
    }

    pub fn is_pressed(&self, key: u8) -> bool {
        self.pressed.contains(&key)
    }

    /// Subscribe to accepted key changes.
    pub fn subscribe(&self) -> broadcast::Receiver<NoteMessage> {
        self.changes.subscribe()
    }

    /// Apply a key change. Returns `true` if the held set changed.
    ///
    /// Out-of-range keys, repeated presses and releases of keys that are not
    /// held are ignored.
    pub fn set_key(&mut self, msg: NoteMessage) -> bool {
        if !self.range.contains(msg.key) {
            return false;
        }

        let changed = if msg.on {
            self.pressed.insert(msg.key)
        } else {
            self.pressed.remove(&msg.key)
        };

        if changed {
            // No subscribers is fine
            let _ = self.changes.send(msg);
        }
        changed
    }

    /// Release everything, e.g. after the input device went away.
    pub fn clear(&mut self) {
        let keys: Vec<u8> = self.pressed.iter().copied().collect();
        for key in keys {
            self.set_key(NoteMessage::new(key, false));
        }
    }
}
