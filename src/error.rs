//! Error types for the trainer library.
//!
//! Timeline loading fails fast: a missing or garbled MIDI file is surfaced to
//! the caller and never retried. Device errors are reported here too, but a
//! missing device is not an error (the session waits for it instead).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("File {path} not found")]
    FileNotFound { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse MIDI: {0}")]
    Midi(#[from] midly::Error),

    #[error("Timecode-based MIDI files not supported")]
    TimecodeTiming,

    /// No note inside the accepted key range was closed by a note-off.
    #[error("No playable notes in key range {min_key}..{max_key}")]
    NoPlayableNotes { min_key: u8, max_key: u8 },

    #[error("Config YAML error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// A MIDI client could not be created at all.
    #[error("Device error: {0}")]
    Device(String),

    /// A port was found but could not be opened; worth another try.
    #[error("Connect error: {0}")]
    Connect(String),
}

pub type Result<T> = std::result::Result<T, TrainerError>;
