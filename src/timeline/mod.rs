//! MIDI file ingestion.
//!
//! Turns a multi-track MIDI file into the ordered list of note groups the
//! learner practices against:
//!
//! 1. [`merge::merge_tracks`] merges all tracks into one tick-ordered stream
//! 2. [`convert_events`] applies tempo changes and keeps only note events
//! 3. [`pairing::pair_notes`] closes note-on/off pairs inside the key range
//! 4. [`grouping`] clusters simultaneous presses, pads and absolutizes them

pub mod grouping;
pub mod merge;
pub mod pairing;

use std::fs;
use std::path::Path;

use log::{debug, info};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::error::{Result, TrainerError};
use crate::keys::KeyRange;
use crate::midi::DEFAULT_TEMPO;
use crate::timing;

/// Payload of a file event. Only notes and tempo are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn { key: u8, vel: u8 },
    NoteOff { key: u8 },
    /// Microseconds per beat
    Tempo(u32),
    Other,
}

/// A track event as read from the file, timed in ticks since the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub delta_ticks: u64,
    pub kind: EventKind,
}

impl RawEvent {
    pub fn new(delta_ticks: u64, kind: EventKind) -> Self {
        Self { delta_ticks, kind }
    }

    /// Key of a note event.
    pub fn key(&self) -> Option<u8> {
        match self.kind {
            EventKind::NoteOn { key, .. } | EventKind::NoteOff { key } => Some(key),
            _ => None,
        }
    }
}

/// A note event after merge and tempo conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedEvent {
    pub key: u8,
    pub on: bool,
    /// Milliseconds since the previous note event
    pub delta_ms: i64,
}

/// A closed key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotePress {
    pub key: u8,
    /// Milliseconds since the previous accepted note-on
    pub start_offset_ms: i64,
    pub duration_ms: i64,
}

/// Notes that start together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteGroup {
    /// Absolute once the timeline is built, relative while grouping
    pub time_ms: i64,
    pub notes: Vec<NotePress>,
    pub max_duration_ms: i64,
}

impl NoteGroup {
    pub fn empty(time_ms: i64) -> Self {
        Self {
            time_ms,
            notes: Vec::new(),
            max_duration_ms: 0,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = u8> + '_ {
        self.notes.iter().map(|n| n.key)
    }
}

/// A practice timeline ready to be loaded into a player.
///
/// The first group is an empty lead-in at 0 and the last an empty lead-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMusic {
    pub groups: Vec<NoteGroup>,
    pub total_time_ms: i64,
    pub bpm: f64,
    pub beat_time_ms: f64,
}

impl ParsedMusic {
    /// Groups whose absolute time lies in `[from_ms, to_ms]`.
    pub fn groups_between(&self, from_ms: i64, to_ms: i64) -> &[NoteGroup] {
        let start = self.groups.partition_point(|g| g.time_ms < from_ms);
        let end = self.groups.partition_point(|g| g.time_ms <= to_ms);
        &self.groups[start..end.max(start)]
    }
}

/// Knobs that shape the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineSettings {
    /// Beats of silence before the first group
    pub lead_in_beats: f64,
    /// Tempo used until the first tempo event
    pub default_tempo: u32,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            lead_in_beats: 4.0,
            default_tempo: DEFAULT_TEMPO,
        }
    }
}

/// Note events with millisecond deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedEvents {
    pub events: Vec<MergedEvent>,
    /// Tempo in effect at the first note event
    pub opening_tempo: u32,
}

/// Convert a merged tick stream to note events timed in milliseconds.
///
/// A tempo event changes the conversion of every later delta. Deltas of
/// dropped events are carried into the next note event so absolute time is
/// preserved.
pub fn convert_events(events: &[RawEvent], ticks_per_beat: u16, default_tempo: u32) -> ConvertedEvents {
    let mut tempo = default_tempo;
    let mut opening_tempo = None;
    let mut pending_ms = 0i64;
    let mut notes = Vec::new();

    for event in events {
        pending_ms += timing::delta_ms(tempo, ticks_per_beat, event.delta_ticks);

        let (key, on) = match event.kind {
            EventKind::Tempo(new_tempo) => {
                debug!("Set music tempo to {}", new_tempo);
                tempo = new_tempo;
                continue;
            }
            EventKind::Other => continue,
            EventKind::NoteOn { key, vel } => (key, vel != 0),
            EventKind::NoteOff { key } => (key, false),
        };

        opening_tempo.get_or_insert(tempo);
        notes.push(MergedEvent {
            key,
            on,
            delta_ms: pending_ms,
        });
        pending_ms = 0;
    }

    ConvertedEvents {
        events: notes,
        opening_tempo: opening_tempo.unwrap_or(tempo),
    }
}

/// Build a practice timeline from per-track events.
pub fn parse_tracks(
    tracks: Vec<Vec<RawEvent>>,
    ticks_per_beat: u16,
    range: KeyRange,
    settings: TimelineSettings,
) -> Result<ParsedMusic> {
    let merged = merge::merge_tracks(tracks);
    let converted = convert_events(&merged, ticks_per_beat, settings.default_tempo);

    let bpm = timing::tempo_to_bpm(converted.opening_tempo);
    let beat_time_ms = timing::bpm_to_beat_time_ms(bpm);
    let lead_in_ms = (beat_time_ms * settings.lead_in_beats).round() as i64;

    let presses = pairing::pair_notes(&converted.events, |key| range.contains(key));
    if presses.is_empty() {
        return Err(TrainerError::NoPlayableNotes {
            min_key: range.min_key,
            max_key: range.max_key(),
        });
    }

    let groups = grouping::group_notes(&presses);
    let groups = grouping::add_time_padding(groups, lead_in_ms);
    let groups = grouping::to_absolute_time(groups);

    let total_time_ms = groups
        .last()
        .map(|g| g.time_ms + g.max_duration_ms)
        .unwrap_or(0);

    info!(
        "Parsed {} notes into {} groups, {:.1} BPM, {} ms total",
        presses.len(),
        groups.len(),
        bpm,
        total_time_ms
    );

    Ok(ParsedMusic {
        groups,
        total_time_ms,
        bpm,
        beat_time_ms,
    })
}

/// Build a practice timeline from a decoded standard MIDI file.
pub fn parse_smf(smf: &Smf, range: KeyRange, settings: TimelineSettings) -> Result<ParsedMusic> {
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(ppq) => ppq.as_int(),
        Timing::Timecode(_, _) => return Err(TrainerError::TimecodeTiming),
    };

    let tracks = smf
        .tracks
        .iter()
        .map(|track| {
            track
                .iter()
                .map(|event| RawEvent::new(event.delta.as_int() as u64, event_kind(&event.kind)))
                .collect()
        })
        .collect();

    parse_tracks(tracks, ticks_per_beat, range, settings)
}

/// Build a practice timeline from the bytes of a MIDI file.
pub fn parse_bytes(data: &[u8], range: KeyRange, settings: TimelineSettings) -> Result<ParsedMusic> {
    let smf = Smf::parse(data)?;
    debug!("Tracks count: {}", smf.tracks.len());
    parse_smf(&smf, range, settings)
}

/// Load and parse a MIDI file from disk.
pub fn load_file<P: AsRef<Path>>(
    path: P,
    range: KeyRange,
    settings: TimelineSettings,
) -> Result<ParsedMusic> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(TrainerError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    info!("Reading {}", path.display());
    let data = fs::read(path).map_err(|source| TrainerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_bytes(&data, range, settings)
}

fn event_kind(kind: &TrackEventKind) -> EventKind {
    match kind {
        TrackEventKind::Midi { message, .. } => match *message {
            MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                key: key.as_int(),
                vel: vel.as_int(),
            },
            MidiMessage::NoteOff { key, .. } => EventKind::NoteOff { key: key.as_int() },
            _ => EventKind::Other,
        },
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => EventKind::Tempo(tempo.as_int()),
        _ => EventKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Format, Header, TrackEvent};

    fn on(delta: u64, key: u8) -> RawEvent {
        RawEvent::new(delta, EventKind::NoteOn { key, vel: 100 })
    }

    fn off(delta: u64, key: u8) -> RawEvent {
        RawEvent::new(delta, EventKind::NoteOff { key })
    }

    fn full_range() -> KeyRange {
        KeyRange::new(0, 128)
    }

    fn midi_event(delta: u32, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message,
            },
        }
    }

    fn note_on(delta: u32, key: u8) -> TrackEvent<'static> {
        midi_event(
            delta,
            MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(100),
            },
        )
    }

    fn note_off(delta: u32, key: u8) -> TrackEvent<'static> {
        midi_event(
            delta,
            MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(0),
            },
        )
    }

    fn tempo(delta: u32, micros: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros))),
        }
    }

    fn end_of_track() -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    #[test]
    fn test_convert_applies_tempo_to_later_deltas() {
        let events = [
            on(0, 60),
            off(10, 60),
            RawEvent::new(0, EventKind::Tempo(1_000_000)),
            on(10, 62),
        ];
        let converted = convert_events(&events, 10, DEFAULT_TEMPO);
        let deltas: Vec<i64> = converted.events.iter().map(|e| e.delta_ms).collect();
        assert_eq!(deltas, vec![0, 500, 1000]);
        assert_eq!(converted.opening_tempo, DEFAULT_TEMPO);
    }

    #[test]
    fn test_convert_carries_dropped_deltas() {
        let events = [
            RawEvent::new(4, EventKind::Other),
            RawEvent::new(6, EventKind::Tempo(250_000)),
            on(2, 60),
            off(4, 60),
        ];
        let converted = convert_events(&events, 10, DEFAULT_TEMPO);
        // 10 ticks at 50 ms, then 2 ticks at 25 ms
        assert_eq!(converted.events[0].delta_ms, 550);
        assert_eq!(converted.events[1].delta_ms, 100);
        assert_eq!(converted.opening_tempo, 250_000);
    }

    #[test]
    fn test_zero_velocity_note_on_is_off() {
        let events = [on(0, 60), RawEvent::new(5, EventKind::NoteOn { key: 60, vel: 0 })];
        let converted = convert_events(&events, 10, DEFAULT_TEMPO);
        assert!(converted.events[0].on);
        assert!(!converted.events[1].on);
    }

    #[test]
    fn test_two_track_scenario() {
        let track_a = vec![on(0, 60), off(10, 60)];
        let track_b = vec![on(0, 64), off(20, 64)];
        let music = parse_tracks(
            vec![track_a, track_b],
            10,
            full_range(),
            TimelineSettings::default(),
        )
        .unwrap();

        // 4 beats at 500 ms
        let lead_in = 2000;
        assert_eq!(music.groups.len(), 3);
        assert_eq!(music.groups[0], NoteGroup::empty(0));

        let chord = &music.groups[1];
        assert_eq!(chord.time_ms, lead_in);
        assert_eq!(
            chord.notes,
            vec![
                NotePress { key: 60, start_offset_ms: 0, duration_ms: 500 },
                NotePress { key: 64, start_offset_ms: 0, duration_ms: 1000 },
            ]
        );
        assert_eq!(chord.max_duration_ms, 1000);

        assert_eq!(music.groups[2], NoteGroup::empty(lead_in + 1000));
        assert_eq!(music.total_time_ms, lead_in + 1000);
        assert_eq!(music.bpm, 120.0);
        assert_eq!(music.beat_time_ms, 500.0);
    }

    #[test]
    fn test_groups_strictly_increasing() {
        let track = vec![
            on(0, 60),
            off(5, 60),
            on(5, 62),
            on(0, 65),
            off(5, 62),
            off(0, 65),
            on(1, 67),
            off(3, 67),
        ];
        let music = parse_tracks(vec![track], 10, full_range(), TimelineSettings::default()).unwrap();
        assert!(music.groups.windows(2).all(|w| w[0].time_ms < w[1].time_ms));
        assert!(music.groups.first().unwrap().notes.is_empty());
        assert!(music.groups.last().unwrap().notes.is_empty());
    }

    #[test]
    fn test_out_of_range_only_is_error() {
        let track = vec![on(0, 10), off(10, 10)];
        let result = parse_tracks(vec![track], 10, KeyRange::new(36, 61), TimelineSettings::default());
        assert!(matches!(
            result,
            Err(TrainerError::NoPlayableNotes { min_key: 36, max_key: 96 })
        ));
    }

    #[test]
    fn test_lead_in_follows_opening_tempo() {
        let track = vec![
            RawEvent::new(0, EventKind::Tempo(1_000_000)),
            on(0, 60),
            off(10, 60),
        ];
        let settings = TimelineSettings {
            lead_in_beats: 2.0,
            default_tempo: DEFAULT_TEMPO,
        };
        let music = parse_tracks(vec![track], 10, full_range(), settings).unwrap();
        assert_eq!(music.bpm, 60.0);
        assert_eq!(music.groups[1].time_ms, 2000);
    }

    #[test]
    fn test_groups_between() {
        let track = vec![on(0, 60), off(10, 60), on(0, 62), off(10, 62)];
        let music = parse_tracks(vec![track], 10, full_range(), TimelineSettings::default()).unwrap();
        // groups at 0, 2000, 2500, 3000
        let times: Vec<i64> = music.groups_between(1000, 2500).iter().map(|g| g.time_ms).collect();
        assert_eq!(times, vec![2000, 2500]);
        assert!(music.groups_between(3500, 9000).is_empty());
        assert!(music.groups_between(2600, 2400).is_empty());
    }

    #[test]
    fn test_parse_written_file() {
        let mut smf = Smf::new(Header::new(Format::Parallel, Timing::Metrical(u15::new(10))));
        smf.tracks.push(vec![tempo(0, 500_000), end_of_track()]);
        smf.tracks.push(vec![note_on(0, 60), note_off(10, 60), end_of_track()]);
        smf.tracks.push(vec![note_on(0, 64), note_off(20, 64), end_of_track()]);

        let mut data = Vec::new();
        smf.write_std(&mut data).unwrap();

        let music = parse_bytes(&data, full_range(), TimelineSettings::default()).unwrap();
        assert_eq!(music.groups.len(), 3);
        assert_eq!(music.groups[1].keys().collect::<Vec<_>>(), vec![60, 64]);
        assert_eq!(music.groups[2].time_ms, 3000);
    }

    #[test]
    fn test_garbled_bytes_fail() {
        let result = parse_bytes(b"not a midi file", full_range(), TimelineSettings::default());
        assert!(matches!(result, Err(TrainerError::Midi(_))));
    }

    #[test]
    fn test_missing_file_fails_fast() {
        let result = load_file("/nonexistent/song.mid", full_range(), TimelineSettings::default());
        assert!(matches!(result, Err(TrainerError::FileNotFound { .. })));
    }
}
