//! Frame-Format der TCP-Verbindung Hub <-> Endpunkt
//!
//! Jede Nachricht auf der Leitung ist ein Frame aus festem 4-Byte-Header
//! und `length` Bytes Nutzdaten. Alle Mehrbyte-Felder sind little-endian.
//!
//! ## Frame-Format
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   Typ (AUDIO, START, STOP, PING, PONG, ERROR)
//!  1       1   Flags
//!  2       2   Laenge der Nutzdaten (u16 LE)
//!  4+      N   Nutzdaten (AUDIO: PCM 16 Bit LE, ERROR: 1 Byte Statuscode)
//! ```
//!
//! Ein ungueltiger Header wird nie "repariert": der einzige sichere Weg
//! ist das Schliessen der Verbindung, sonst koennten Nutzdaten als
//! naechster Header interpretiert werden.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use intercom_core::IntercomError;
use std::io;
use thiserror::Error;

/// Standard-TCP-Port der Endpunkte
pub const STANDARD_PORT: u16 = 6054;

/// Groesse des Frame-Headers in Bytes
pub const HEADER_GROESSE: usize = 4;

/// Maximale Nutzdaten-Laenge (passt in das u16-Laengenfeld)
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

// ---------------------------------------------------------------------------
// FrameType
// ---------------------------------------------------------------------------

/// Art des Frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Rohes PCM-Audio
    Audio = 0x01,
    /// Session-Start (Anfrage vom Hub, Bestaetigung/Annahme vom Endpunkt)
    Start = 0x02,
    /// Session-Ende
    Stop = 0x03,
    /// Keepalive-Anfrage
    Ping = 0x04,
    /// Keepalive-Antwort
    Pong = 0x05,
    /// Fehlermeldung, Nutzdaten = Statuscode
    Error = 0x06,
}

impl FrameType {
    /// Konvertiert ein Byte in einen `FrameType`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Audio),
            0x02 => Some(Self::Start),
            0x03 => Some(Self::Stop),
            0x04 => Some(Self::Ping),
            0x05 => Some(Self::Pong),
            0x06 => Some(Self::Error),
            _ => None,
        }
    }

    /// Alle gueltigen Typen
    pub const ALLE: [FrameType; 6] = [
        Self::Audio,
        Self::Start,
        Self::Stop,
        Self::Ping,
        Self::Pong,
        Self::Error,
    ];
}

// ---------------------------------------------------------------------------
// Flags und Statuscodes
// ---------------------------------------------------------------------------

/// Werte fuer das Flags-Byte
pub struct FrameFlags;

impl FrameFlags {
    pub const NONE: u8 = 0x00;
    /// Nur bei START vom Endpunkt: Geraet klingelt, Annahme steht noch aus
    pub const RINGING: u8 = 0x01;
}

/// Statuscodes in ERROR-Frames
pub struct ErrorCode;

impl ErrorCode {
    /// Endpunkt hat bereits eine aktive Session
    pub const BUSY: u8 = 0x01;
    /// Frame konnte nicht verarbeitet werden
    pub const INVALID_FRAME: u8 = 0x02;
    /// AUDIO empfangen obwohl nicht gestreamt wird
    pub const NOT_STREAMING: u8 = 0x03;
    /// Interner Fehler des Endpunkts
    pub const INTERNAL: u8 = 0xFF;
}

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

/// Fehler beim Kodieren oder Dekodieren von Frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Payload zu gross: {0} Bytes (Maximum: {MAX_PAYLOAD} Bytes)")]
    PayloadTooLarge(usize),

    #[error("Unbekannter Frame-Typ: 0x{0:02x}")]
    UnbekannterTyp(u8),

    #[error("IO-Fehler: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for IntercomError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge(laenge) => IntercomError::PayloadTooLarge {
                laenge,
                maximum: MAX_PAYLOAD,
            },
            FrameError::UnbekannterTyp(typ) => {
                IntercomError::desync(format!("unbekannter Frame-Typ 0x{typ:02x}"))
            }
            FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                IntercomError::PeerDisconnected("Verbindung mitten im Frame beendet".into())
            }
            FrameError::Io(e) => IntercomError::Io(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Ein vollstaendiger Frame
///
/// Das Laengenfeld wird nicht gespeichert, es ergibt sich immer aus
/// `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Erstellt einen Frame (die Laenge wird erst beim Kodieren geprueft)
    pub fn neu(typ: FrameType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            typ,
            flags,
            payload: payload.into(),
        }
    }

    /// AUDIO-Frame mit PCM-Nutzdaten
    pub fn audio(pcm: impl Into<Bytes>) -> Self {
        Self::neu(FrameType::Audio, FrameFlags::NONE, pcm)
    }

    /// START-Frame ohne Nutzdaten
    pub fn start(flags: u8) -> Self {
        Self::neu(FrameType::Start, flags, Bytes::new())
    }

    pub fn stop() -> Self {
        Self::neu(FrameType::Stop, FrameFlags::NONE, Bytes::new())
    }

    pub fn ping() -> Self {
        Self::neu(FrameType::Ping, FrameFlags::NONE, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::neu(FrameType::Pong, FrameFlags::NONE, Bytes::new())
    }

    /// ERROR-Frame mit einem Statuscode (siehe `ErrorCode`)
    pub fn error(code: u8) -> Self {
        Self::neu(FrameType::Error, FrameFlags::NONE, Bytes::copy_from_slice(&[code]))
    }

    /// Statuscode eines ERROR-Frames (`ErrorCode::INTERNAL` bei leerem Payload)
    pub fn fehlercode(&self) -> Option<u8> {
        if self.typ != FrameType::Error {
            return None;
        }
        Some(self.payload.first().copied().unwrap_or(ErrorCode::INTERNAL))
    }

    /// Gesamtgroesse auf der Leitung
    pub fn leitungs_groesse(&self) -> usize {
        HEADER_GROESSE + self.payload.len()
    }

    /// Kodiert den Frame in einen neuen Buffer
    pub fn kodieren(&self) -> Result<Bytes, FrameError> {
        encode(self.typ, self.flags, &self.payload)
    }
}

// ---------------------------------------------------------------------------
// Kodieren
// ---------------------------------------------------------------------------

/// Kodiert Header + Nutzdaten in einen neuen Buffer
///
/// # Fehler
/// - `PayloadTooLarge` wenn `payload.len() > 65535`
pub fn encode(typ: FrameType, flags: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(HEADER_GROESSE + payload.len());
    encode_into(typ, flags, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Haengt einen kodierten Frame an `dst` an
pub fn encode_into(
    typ: FrameType,
    flags: u8,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(HEADER_GROESSE + payload.len());
    dst.put_u8(typ as u8);
    dst.put_u8(flags);
    dst.put_u16_le(payload.len() as u16);
    dst.put_slice(payload);
    Ok(())
}

// ---------------------------------------------------------------------------
// Dekodieren
// ---------------------------------------------------------------------------

/// Welcher Teil des Frames noch fehlt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fehlend {
    /// Header unvollstaendig, so viele Bytes fehlen noch
    Header(usize),
    /// Header vollstaendig, so viele Nutzdaten-Bytes fehlen noch
    Payload(usize),
}

/// Ergebnis eines inkrementellen Dekodierschritts
#[derive(Debug)]
pub enum Decoded {
    /// Ein vollstaendiger Frame wurde aus dem Buffer entnommen
    Frame(Frame),
    /// Es fehlen noch Bytes, der Buffer bleibt unveraendert
    NeedMoreData(Fehlend),
    /// Ungueltiger Header, die Verbindung muss geschlossen werden
    Corrupt(FrameError),
}

/// Liest Typ, Flags und Laenge aus einem vollstaendigen Header
pub fn header_lesen(header: &[u8; HEADER_GROESSE]) -> Result<(FrameType, u8, usize), FrameError> {
    let typ = FrameType::from_u8(header[0]).ok_or(FrameError::UnbekannterTyp(header[0]))?;
    let laenge = u16::from_le_bytes([header[2], header[3]]) as usize;
    Ok((typ, header[1], laenge))
}

/// Dekodiert hoechstens einen Frame vom Anfang von `src`
///
/// Nur bei `Decoded::Frame` werden Bytes verbraucht. Ein unbekannter Typ
/// wird bereits erkannt sobald der Header vollstaendig ist.
pub fn decode(src: &mut BytesMut) -> Decoded {
    if src.len() < HEADER_GROESSE {
        return Decoded::NeedMoreData(Fehlend::Header(HEADER_GROESSE - src.len()));
    }

    let header = [src[0], src[1], src[2], src[3]];
    let (typ, flags, laenge) = match header_lesen(&header) {
        Ok(h) => h,
        Err(e) => return Decoded::Corrupt(e),
    };

    let gesamt = HEADER_GROESSE + laenge;
    if src.len() < gesamt {
        return Decoded::NeedMoreData(Fehlend::Payload(gesamt - src.len()));
    }

    src.advance(HEADER_GROESSE);
    let payload = src.split_to(laenge).freeze();
    Decoded::Frame(Frame {
        typ,
        flags,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
