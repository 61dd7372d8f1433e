//! UI-Protokoll (Websocket, JSON)
//!
//! Nachrichten zwischen Browser-Client und Hub. Audio ueberquert diese
//! Grenze als base64-kodiertes PCM in einem JSON-Umschlag.
//!
//! ## Design
//! - Request/Response: jede Anfrage hat eine `id`, die Antwort traegt sie zurueck
//! - Tagged Enums ueber das Feld `type`
//! - Ereignisse und Audio vom Hub haben keine `id`
//!
//! ```text
//! -> {"id":1,"type":"intercom/start","device_id":"tuer"}
//! <- {"type":"result","id":1,"success":true}
//! <- {"type":"event","event":{"type":"session","device_id":"tuer","state":"streaming",...}}
//! <- {"type":"intercom/audio","device_id":"tuer","data":"AAEC..."}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use intercom_core::{BridgeId, DeviceId, HubEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::MAX_PAYLOAD;
use crate::pcm::BYTES_PRO_SAMPLE;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

/// Fehler beim Auswerten einer UI-Nachricht
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Ungueltiges JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ungueltiges base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM-Laenge {0} ist kein Vielfaches von 2")]
    UngeradePcmLaenge(usize),

    #[error("Audioblock zu gross: {0} Bytes")]
    AudioZuGross(usize),

    #[error("Ungueltige Anfrage: {0}")]
    Ungueltig(String),
}

// ---------------------------------------------------------------------------
// Audio-Umschlag
// ---------------------------------------------------------------------------

/// base64-PCM fuer ein Geraet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioUmschlag {
    pub device_id: DeviceId,
    /// base64 (Standard-Alphabet) von PCM 16 Bit LE
    pub data: String,
}

impl AudioUmschlag {
    /// Verpackt rohe PCM-Bytes
    pub fn aus_pcm(device_id: DeviceId, pcm: &[u8]) -> Self {
        Self {
            device_id,
            data: STANDARD.encode(pcm),
        }
    }

    /// Entpackt die PCM-Bytes und prueft Laenge und Ausrichtung
    pub fn pcm(&self) -> Result<Vec<u8>, ControlError> {
        let pcm = STANDARD.decode(self.data.as_bytes())?;
        if pcm.len() % BYTES_PRO_SAMPLE != 0 {
            return Err(ControlError::UngeradePcmLaenge(pcm.len()));
        }
        if pcm.len() > MAX_PAYLOAD {
            return Err(ControlError::AudioZuGross(pcm.len()));
        }
        Ok(pcm)
    }
}

// ---------------------------------------------------------------------------
// Anfragen (Client -> Hub)
// ---------------------------------------------------------------------------

/// Befehle des Browser-Clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiBefehl {
    /// Direkte Session zu einem Geraet starten
    #[serde(rename = "intercom/start")]
    Start { device_id: DeviceId },
    /// Direkte Session beenden
    #[serde(rename = "intercom/stop")]
    Stop { device_id: DeviceId },
    /// Geraeteliste abfragen
    #[serde(rename = "intercom/list")]
    List,
    /// Bridge zwischen zwei Geraeten aufbauen
    #[serde(rename = "intercom/bridge_start")]
    BridgeStart {
        source_device_id: DeviceId,
        dest_device_id: DeviceId,
    },
    /// Bridge abbauen
    #[serde(rename = "intercom/bridge_stop")]
    BridgeStop { bridge_id: BridgeId },
    /// Mikrofon-Audio des Clients an ein Geraet
    #[serde(rename = "intercom/audio")]
    Audio(AudioUmschlag),
}

/// Eine Anfrage mit Korrelations-ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAnfrage {
    pub id: u64,
    #[serde(flatten)]
    pub befehl: UiBefehl,
}

impl UiAnfrage {
    /// Parst eine Textnachricht vom Websocket
    pub fn parsen(text: &str) -> Result<Self, ControlError> {
        let anfrage: Self = serde_json::from_str(text)?;
        anfrage.validieren()?;
        Ok(anfrage)
    }

    /// Prueft inhaltliche Regeln die serde nicht abdeckt
    pub fn validieren(&self) -> Result<(), ControlError> {
        let leer = |id: &DeviceId| id.as_str().trim().is_empty();
        match &self.befehl {
            UiBefehl::Start { device_id } | UiBefehl::Stop { device_id } if leer(device_id) => {
                Err(ControlError::Ungueltig("device_id fehlt".into()))
            }
            UiBefehl::BridgeStart {
                source_device_id,
                dest_device_id,
            } => {
                if leer(source_device_id) || leer(dest_device_id) {
                    return Err(ControlError::Ungueltig("device_id fehlt".into()));
                }
                if source_device_id == dest_device_id {
                    return Err(ControlError::Ungueltig(
                        "Quelle und Ziel muessen verschieden sein".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Nachrichten (Hub -> Client)
// ---------------------------------------------------------------------------

/// Fehlerobjekt in einer negativen Antwort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiFehler {
    pub code: String,
    pub message: String,
}

/// Alles was der Hub an den Client schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiNachricht {
    /// Antwort auf eine Anfrage
    #[serde(rename = "result")]
    Ergebnis {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<UiFehler>,
    },
    /// Zustandswechsel einer Session oder Bridge
    #[serde(rename = "event")]
    Ereignis { event: HubEvent },
    /// Endpunkt-Audio fuer den Client
    #[serde(rename = "intercom/audio")]
    Audio(AudioUmschlag),
}

impl UiNachricht {
    /// Positive Antwort
    pub fn ok(id: u64, result: Option<serde_json::Value>) -> Self {
        Self::Ergebnis {
            id,
            success: true,
            result,
            error: None,
        }
    }

    /// Negative Antwort mit Code und Meldung
    pub fn fehler(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ergebnis {
            id,
            success: false,
            result: None,
            error: Some(UiFehler {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Serialisiert fuer den Websocket
    pub fn als_text(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_core::CallState;

    #[test]
    fn start_anfrage_parsen() {
        let a = UiAnfrage::parsen(r#"{"id":7,"type":"intercom/start","device_id":"tuer"}"#)
            .unwrap();
        assert_eq!(a.id, 7);
        assert_eq!(
            a.befehl,
            UiBefehl::Start {
                device_id: DeviceId::neu("tuer")
            }
        );
    }

    #[test]
    fn list_ohne_felder() {
        let a = UiAnfrage::parsen(r#"{"id":1,"type":"intercom/list"}"#).unwrap();
        assert_eq!(a.befehl, UiBefehl::List);
    }

    #[test]
    fn bridge_gleiche_geraete_abgelehnt() {
        let r = UiAnfrage::parsen(
            r#"{"id":2,"type":"intercom/bridge_start","source_device_id":"a","dest_device_id":"a"}"#,
        );
        assert!(matches!(r, Err(ControlError::Ungueltig(_))));
    }

    #[test]
    fn unbekannter_typ_abgelehnt() {
        let r = UiAnfrage::parsen(r#"{"id":3,"type":"intercom/explode"}"#);
        assert!(matches!(r, Err(ControlError::Json(_))));
    }

    #[test]
    fn audio_umschlag_base64() {
        let pcm = vec![0x01, 0x00, 0xFF, 0x7F];
        let u = AudioUmschlag::aus_pcm(DeviceId::neu("tuer"), &pcm);
        assert_eq!(u.data, "AQD/fw==");
        assert_eq!(u.pcm().unwrap(), pcm);

        let text = format!(
            r#"{{"id":4,"type":"intercom/audio","device_id":"tuer","data":"{}"}}"#,
            u.data
        );
        let a = UiAnfrage::parsen(&text).unwrap();
        assert_eq!(a.befehl, UiBefehl::Audio(u));
    }

    #[test]
    fn audio_umschlag_ungerade_laenge() {
        let u = AudioUmschlag::aus_pcm(DeviceId::neu("tuer"), &[1, 2, 3]);
        assert!(matches!(u.pcm(), Err(ControlError::UngeradePcmLaenge(3))));
        let kaputt = AudioUmschlag {
            device_id: DeviceId::neu("tuer"),
            data: "@@@".into(),
        };
        assert!(matches!(kaputt.pcm(), Err(ControlError::Base64(_))));
    }

    #[test]
    fn antworten_json_form() {
        let ok = serde_json::to_value(UiNachricht::ok(5, None)).unwrap();
        assert_eq!(ok["type"], "result");
        assert_eq!(ok["id"], 5);
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());

        let f = serde_json::to_value(UiNachricht::fehler(6, "already_active", "belegt")).unwrap();
        assert_eq!(f["success"], false);
        assert_eq!(f["error"]["code"], "already_active");

        let ev = UiNachricht::Ereignis {
            event: HubEvent::session(DeviceId::neu("tuer"), CallState::Streaming, None),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["event"]["state"], "streaming");
    }
}
