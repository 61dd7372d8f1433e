//! Fehlertypen fuer das Intercom-Relay
//!
//! Zentraler Fehler-Enum fuer Sessions, Bridges und den Endpunkt.
//! Untermodule (z.B. der Frame-Codec) definieren eigene Fehler und
//! konvertieren via `From` in `IntercomError`.

use thiserror::Error;

use crate::types::DeviceId;

/// Globaler Result-Alias fuer das Intercom-Relay
pub type Result<T> = std::result::Result<T, IntercomError>;

/// Alle Fehler die eine Session, eine Bridge oder ein Endpunkt melden kann
#[derive(Debug, Error)]
pub enum IntercomError {
    // --- Verbindung ---
    #[error("Zeitlimit ueberschritten: {0}")]
    ConnectTimeout(String),

    #[error("Gegenstelle getrennt: {0}")]
    PeerDisconnected(String),

    #[error("Endpunkt nicht verfuegbar: {0}")]
    EndpointUnavailable(DeviceId),

    // --- Protokoll ---
    #[error("Protokoll-Desynchronisation: {0}")]
    ProtocolDesync(String),

    #[error("Payload zu gross: {laenge} Bytes (Maximum: {maximum} Bytes)")]
    PayloadTooLarge { laenge: usize, maximum: usize },

    #[error("Teilschreiben abgebrochen: {geschrieben} von {erwartet} Bytes")]
    PartialWriteExhausted { geschrieben: usize, erwartet: usize },

    #[error("Endpunkt meldet Fehler (Code 0x{code:02x})")]
    RemoteError { code: u8 },

    // --- Sessions ---
    #[error("Session bereits aktiv fuer Geraet {0}")]
    SessionConflict(DeviceId),

    #[error("Ungueltiger Zustand: {0}")]
    InvalidState(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Config(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl IntercomError {
    /// Kurzer, fuer die UI gedachter Grund
    pub fn grund(&self) -> String {
        match self {
            Self::ConnectTimeout(_) => "Endpunkt antwortet nicht".into(),
            Self::PeerDisconnected(_) => "Verbindung getrennt".into(),
            Self::EndpointUnavailable(id) => format!("Geraet {id} unbekannt"),
            Self::ProtocolDesync(_) => "Protokollfehler".into(),
            Self::PayloadTooLarge { .. } => "Audioblock zu gross".into(),
            Self::PartialWriteExhausted { .. } => "Senden fehlgeschlagen".into(),
            Self::RemoteError { code } => format!("Endpunkt-Fehler 0x{code:02x}"),
            Self::SessionConflict(id) => format!("Geraet {id} bereits aktiv"),
            Self::InvalidState(m) => m.clone(),
            Self::Config(m) => m.clone(),
            Self::Io(_) => "Netzwerkfehler".into(),
        }
    }

    /// Maschinenlesbarer Fehlercode fuer die UI-Schnittstelle
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) | Self::PeerDisconnected(_) | Self::Io(_) => {
                "connection_failed"
            }
            Self::EndpointUnavailable(_) => "endpoint_unavailable",
            Self::SessionConflict(_) => "already_active",
            Self::InvalidState(_) | Self::Config(_) => "invalid_request",
            Self::ProtocolDesync(_)
            | Self::PayloadTooLarge { .. }
            | Self::PartialWriteExhausted { .. }
            | Self::RemoteError { .. } => "protocol_error",
        }
    }

    /// Gibt true zurueck wenn ein erneuter Versuch (von aussen) sinnvoll sein koennte
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_) | Self::PeerDisconnected(_) | Self::EndpointUnavailable(_)
        )
    }

    /// Erstellt einen Desync-Fehler aus einer beliebigen Nachricht
    pub fn desync(msg: impl Into<String>) -> Self {
        Self::ProtocolDesync(msg.into())
    }

    /// Erstellt einen Zustandsfehler aus einer beliebigen Nachricht
    pub fn ungueltiger_zustand(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = IntercomError::PartialWriteExhausted {
            geschrieben: 100,
            erwartet: 516,
        };
        assert_eq!(e.to_string(), "Teilschreiben abgebrochen: 100 von 516 Bytes");
    }

    #[test]
    fn wiederholbar_erkennung() {
        assert!(IntercomError::ConnectTimeout("test".into()).ist_wiederholbar());
        assert!(!IntercomError::desync("test").ist_wiederholbar());
        assert!(!IntercomError::SessionConflict(DeviceId::neu("a")).ist_wiederholbar());
    }

    #[test]
    fn grund_ist_kurz_und_nicht_leer() {
        let fehler = [
            IntercomError::ConnectTimeout("x".into()),
            IntercomError::PeerDisconnected("x".into()),
            IntercomError::EndpointUnavailable(DeviceId::neu("x")),
            IntercomError::desync("x"),
            IntercomError::PayloadTooLarge {
                laenge: 70000,
                maximum: 65535,
            },
            IntercomError::RemoteError { code: 1 },
        ];
        for f in &fehler {
            assert!(!f.grund().is_empty());
        }
    }

    #[test]
    fn konflikt_code() {
        let e = IntercomError::SessionConflict(DeviceId::neu("tuer"));
        assert_eq!(e.code(), "already_active");
        assert!(e.grund().contains("tuer"));
    }
}
