//! Closes note-on/note-off pairs into timed key presses.

use std::collections::HashMap;

use super::{MergedEvent, NotePress};

/// A note-on waiting for its note-off.
struct OpenNote {
    /// Position of the note-on in the stream, used to keep arrival order
    index: usize,
    /// Time since the previous accepted note-on
    start_offset_ms: i64,
    /// Absolute time of the note-on
    opened_at_ms: i64,
}

/// Pair note-on/off events per key into [`NotePress`]es.
///
/// Keys rejected by `accept` are invisible to pairing, but their deltas still
/// count towards elapsed time. A repeated note-on for a key that is already
/// open is ignored, and so is a note-off with no open note. Notes still open
/// at the end of the stream are dropped.
///
/// The result is ordered by note-on position, not by release.
pub fn pair_notes(events: &[MergedEvent], accept: impl Fn(u8) -> bool) -> Vec<NotePress> {
    let mut open: HashMap<u8, OpenNote> = HashMap::new();
    let mut released: Vec<(usize, NotePress)> = Vec::new();

    let mut absolute_ms = 0i64;
    let mut relative_ms = 0i64;

    for (index, event) in events.iter().enumerate() {
        absolute_ms += event.delta_ms;
        relative_ms += event.delta_ms;

        if !accept(event.key) {
            continue;
        }

        if event.on {
            if open.contains_key(&event.key) {
                continue;
            }
            open.insert(
                event.key,
                OpenNote {
                    index,
                    start_offset_ms: relative_ms,
                    opened_at_ms: absolute_ms,
                },
            );
            relative_ms = 0;
        } else if let Some(note) = open.remove(&event.key) {
            released.push((
                note.index,
                NotePress {
                    key: event.key,
                    start_offset_ms: note.start_offset_ms,
                    duration_ms: absolute_ms - note.opened_at_ms,
                },
            ));
        }
    }

    if !open.is_empty() {
        log::debug!("Dropping {} notes without a note-off", open.len());
    }

    released.sort_by_key(|(index, _)| *index);
    released.into_iter().map(|(_, note)| note).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(key: u8, delta_ms: i64) -> MergedEvent {
        MergedEvent { key, on: true, delta_ms }
    }

    fn off(key: u8, delta_ms: i64) -> MergedEvent {
        MergedEvent { key, on: false, delta_ms }
    }

    fn press(key: u8, start_offset_ms: i64, duration_ms: i64) -> NotePress {
        NotePress { key, start_offset_ms, duration_ms }
    }

    fn accept_all(_: u8) -> bool {
        true
    }

    #[test]
    fn test_simple_pair() {
        let notes = pair_notes(&[on(60, 100), off(60, 250)], accept_all);
        assert_eq!(notes, vec![press(60, 100, 250)]);
    }

    #[test]
    fn test_chord_ordered_by_note_on() {
        // 64 is released first but opened second
        let events = [on(60, 0), on(64, 0), off(64, 100), off(60, 100)];
        let notes = pair_notes(&events, accept_all);
        assert_eq!(notes, vec![press(60, 0, 200), press(64, 0, 100)]);
    }

    #[test]
    fn test_relative_offset_between_note_ons() {
        let events = [on(60, 0), off(60, 100), on(62, 50), off(62, 100)];
        let notes = pair_notes(&events, accept_all);
        // 62 starts 150 ms after 60
        assert_eq!(notes, vec![press(60, 0, 100), press(62, 150, 100)]);
    }

    #[test]
    fn test_rejected_keys_keep_elapsed_time() {
        let accept = |k: u8| k >= 36;
        let events = [
            on(60, 0),
            on(20, 40),
            off(20, 60),
            off(60, 0),
            on(62, 30),
            off(62, 10),
        ];
        let notes = pair_notes(&events, accept);
        // 20 is invisible, but its 100 ms still separate 60 from 62
        assert_eq!(notes, vec![press(60, 0, 100), press(62, 130, 10)]);
    }

    #[test]
    fn test_retrigger_is_ignored() {
        let events = [on(60, 0), on(60, 50), off(60, 50), off(60, 10)];
        let notes = pair_notes(&events, accept_all);
        assert_eq!(notes, vec![press(60, 0, 100)]);
    }

    #[test]
    fn test_orphan_note_off_ignored() {
        let events = [off(60, 10), on(62, 0), off(62, 20)];
        let notes = pair_notes(&events, accept_all);
        assert_eq!(notes, vec![press(62, 10, 20)]);
    }

    #[test]
    fn test_unclosed_notes_dropped() {
        let events = [on(60, 0), on(64, 0), off(64, 100)];
        let notes = pair_notes(&events, accept_all);
        assert_eq!(notes, vec![press(64, 0, 100)]);
    }

    #[test]
    fn test_durations_never_negative() {
        let events = [on(60, 0), off(60, 0), on(60, 0), off(60, 5)];
        let notes = pair_notes(&events, accept_all);
        assert_eq!(notes, vec![press(60, 0, 0), press(60, 0, 5)]);
        assert!(notes.iter().all(|n| n.duration_ms >= 0));
    }
}
