//! intercom-voice – Wiedergabe-Planung fuer den Client
//!
//! ## Module
//! - [`jitter_buffer`] – Zeitachse mit Lookahead-Fenster, verwirft zu fruehe und zu spaete Bloecke

pub mod jitter_buffer;

pub use jitter_buffer::{GeplanterBlock, JitterConfig, JitterStatistik, Planung, WiedergabePlaner};
