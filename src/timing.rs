//! Conversions between MIDI time units and milliseconds.

const MS_PER_MINUTE: f64 = 60_000.0;
const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Convert a delta in file ticks to milliseconds at the given tempo.
///
/// Fractional milliseconds are truncated per event.
pub fn delta_ms(tempo_micros_per_beat: u32, ticks_per_beat: u16, delta_ticks: u64) -> i64 {
    if ticks_per_beat == 0 {
        return 0;
    }
    let numerator = tempo_micros_per_beat as u64 * delta_ticks;
    let denominator = 1000 * ticks_per_beat as u64;
    (numerator / denominator) as i64
}

/// MIDI tempo (µs per beat) to beats per minute.
pub fn tempo_to_bpm(tempo_micros_per_beat: u32) -> f64 {
    MICROS_PER_MINUTE / tempo_micros_per_beat as f64
}

/// Beats per minute to milliseconds per beat.
pub fn bpm_to_beat_time_ms(bpm: f64) -> f64 {
    MS_PER_MINUTE / bpm
}
