//! Mikrofon-Aufbereitung
//!
//! ```text
//! Mikrofon (i32, 16 oder 32 Bit breit)
//!     |
//!     v
//! MicKonverter   <- 32 -> 16 Bit, optional Gleichanteil entfernen
//!     |
//!     v
//! Chunker        <- feste Bloecke (chunk_bytes) fuer AUDIO-Frames
//! ```

use bytes::{Bytes, BytesMut};
use intercom_protocol::pcm;

/// Koeffizient des Hochpasses zur Gleichanteil-Entfernung
const DC_POL: f32 = 0.995;

// ---------------------------------------------------------------------------
// MicKonverter
// ---------------------------------------------------------------------------

/// Wandelt Rohsamples des Mikrofons in 16-Bit-PCM
#[derive(Debug, Clone)]
pub struct MicKonverter {
    mic_bits: u8,
    dc_filter: Option<DcFilter>,
}

#[derive(Debug, Clone, Default)]
struct DcFilter {
    x_vorher: f32,
    y_vorher: f32,
}

impl DcFilter {
    fn anwenden(&mut self, x: f32) -> f32 {
        let y = x - self.x_vorher + DC_POL * self.y_vorher;
        self.x_vorher = x;
        self.y_vorher = y;
        y
    }
}

impl MicKonverter {
    pub fn neu(mic_bits: u8, dc_offset_removal: bool) -> Self {
        Self {
            mic_bits,
            dc_filter: dc_offset_removal.then(DcFilter::default),
        }
    }

    /// Konvertiert einen Block Rohsamples
    ///
    /// 32-Bit-Samples behalten die oberen 16 Bit, 16-Bit-Samples werden
    /// auf den i16-Bereich begrenzt.
    pub fn konvertieren(&mut self, roh: &[i32]) -> Vec<i16> {
        roh.iter()
            .map(|&s| {
                let s16 = if self.mic_bits == 32 {
                    (s >> 16) as i16
                } else {
                    s.clamp(i16::MIN as i32, i16::MAX as i32) as i16
                };
                match self.dc_filter.as_mut() {
                    Some(f) => f
                        .anwenden(s16 as f32)
                        .clamp(i16::MIN as f32, i16::MAX as f32) as i16,
                    None => s16,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Sammelt PCM-Bytes und gibt Bloecke fester Groesse aus
#[derive(Debug)]
pub struct Chunker {
    groesse: usize,
    puffer: BytesMut,
}

impl Chunker {
    pub fn neu(groesse: usize) -> Self {
        Self {
            groesse,
            puffer: BytesMut::with_capacity(groesse * 2),
        }
    }

    /// Haengt Samples an
    pub fn samples_anhaengen(&mut self, samples: &[i16]) {
        self.puffer.extend_from_slice(&pcm::samples_zu_bytes(samples));
    }

    /// Naechster vollstaendiger Block, falls vorhanden
    pub fn naechster(&mut self) -> Option<Bytes> {
        if self.puffer.len() < self.groesse {
            return None;
        }
        Some(self.puffer.split_to(self.groesse).freeze())
    }

    /// Verwirft angefangene Bloecke (z.B. ausserhalb des Streamings)
    pub fn leeren(&mut self) {
        self.puffer.clear();
    }

    pub fn gepuffert(&self) -> usize {
        self.puffer.len()
    }
}
