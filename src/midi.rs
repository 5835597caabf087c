//! MIDI protocol constants and utilities.
//!
//! Defines the channel messages read from the keyboard and the two proprietary
//! system-exclusive messages that drive its key lights. The light protocol is
//! the one used by CASIO LK-series keyboards: a per-key on/off command and a
//! periodic "hold" message without which the keyboard reverts to its own
//! light display.

/// Note Off status (high nibble)
pub const NOTE_OFF: u8 = 0x80;

/// Note On status (high nibble). Velocity 0 means Note Off.
pub const NOTE_ON: u8 = 0x90;

/// Start of a system-exclusive message
pub const SYSEX_START: u8 = 0xF0;

/// End of a system-exclusive message
pub const SYSEX_END: u8 = 0xF7;

/// Manufacturer and device header shared by both light messages
const LIGHT_HEADER: [u8; 4] = [68, 126, 126, 127];

/// Default tempo when a file carries no tempo meta event (120 BPM)
pub const DEFAULT_TEMPO: u32 = 500_000;

/// A key press or release, either played by the learner or sent to the lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteMessage {
    pub key: u8,
    pub on: bool,
}

impl NoteMessage {
    pub fn new(key: u8, on: bool) -> Self {
        Self { key, on }
    }
}

/// Build the sysex command that turns one key light on or off.
///
/// Layout: `F0 44 7E 7E 7F 02 00 <key> <on> F7`.
pub fn key_light_message(key: u8, on: bool) -> [u8; 10] {
    let [a, b, c, d] = LIGHT_HEADER;
    [SYSEX_START, a, b, c, d, 2, 0, key, on as u8, SYSEX_END]
}

/// Build the "hold" sysex that keeps the light subsystem under our control.
///
/// Layout: `F0 44 7E 7E 7F 00 03 F7`.
pub fn hold_message() -> [u8; 8] {
    let [a, b, c, d] = LIGHT_HEADER;
    [SYSEX_START, a, b, c, d, 0, 3, SYSEX_END]
}

/// Decode a raw input message into a key change.
///
/// Only Note On / Note Off are interpreted; everything else (clock, sysex,
/// controllers) yields `None`.
pub fn parse_key_message(message: &[u8]) -> Option<NoteMessage> {
    if message.len() < 3 {
        return None;
    }

    match message[0] & 0xF0 {
        NOTE_ON => Some(NoteMessage::new(message[1], message[2] != 0)),
        NOTE_OFF => Some(NoteMessage::new(message[1], false)),
        _ => None,
    }
}

/// Scientific pitch name of a MIDI key (60 = C4).
pub fn note_name(note: u8) -> String {
    let names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1;
    let name = names[(note % 12) as usize];
    format!("{}{}", name, octave)
}
