//! PCM-Hilfsfunktionen
//!
//! Audio ist ueberall 16 kHz, mono, 16 Bit signed little-endian.

use std::time::Duration;

/// Abtastrate aller Audiostroeme
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes pro Sample (16 Bit)
pub const BYTES_PRO_SAMPLE: usize = 2;

/// Samples als little-endian Bytes
pub fn samples_zu_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PRO_SAMPLE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Little-endian Bytes als Samples; ein ueberzaehliges letztes Byte wird ignoriert
pub fn bytes_zu_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PRO_SAMPLE)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Abspieldauer einer Anzahl Samples
pub fn dauer_samples(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}

/// Abspieldauer eines PCM-Blocks in Bytes bei 16 kHz
pub fn dauer_bytes(bytes: usize) -> Duration {
    dauer_samples(bytes / BYTES_PRO_SAMPLE, SAMPLE_RATE)
}
