//! Key Hint - practice a MIDI file on a light-up keyboard.
//!
//! Parses a MIDI file into note groups, waits for the learner to play each
//! group on the keyboard and guides them with the keyboard's key lights.

pub mod config;
pub mod device;
pub mod error;
pub mod hints;
pub mod keys;
pub mod lights;
pub mod midi;
pub mod player;
pub mod session;
pub mod timeline;
pub mod timing;

pub use error::{Result, TrainerError};
