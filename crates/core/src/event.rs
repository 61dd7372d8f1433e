//! Benachrichtigungs-Ereignisse fuer die UI
//!
//! Der Hub meldet Zustandswechsel von Sessions und Bridges ueber einen
//! Event-Kanal. Die JSON-Form ist die UI-Schnittstelle:
//!
//! ```text
//! {"type":"session","device_id":"tuer","state":"ringing"}
//! {"type":"bridge","source_device_id":"a","dest_device_id":"b","state":"connected"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BridgeId, DeviceId};

/// Sichtbarer Zustand einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Streaming,
    Disconnected,
}

/// Sichtbarer Zustand einer Bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Connected,
    Disconnected,
}

/// Alle Ereignisse die ueber den Event-Kanal an die UI gehen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Zustandswechsel einer direkten Session
    Session {
        device_id: DeviceId,
        state: CallState,
        /// Grund bei `disconnected` (leer bei regulaerem Ende)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Zustandswechsel einer Bridge
    Bridge {
        bridge_id: BridgeId,
        source_device_id: DeviceId,
        dest_device_id: DeviceId,
        state: BridgeState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl HubEvent {
    /// Erstellt ein Session-Ereignis mit aktuellem Zeitstempel
    pub fn session(device_id: DeviceId, state: CallState, reason: Option<String>) -> Self {
        Self::Session {
            device_id,
            state,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Erstellt ein Bridge-Ereignis mit aktuellem Zeitstempel
    pub fn bridge(
        bridge_id: BridgeId,
        source_device_id: DeviceId,
        dest_device_id: DeviceId,
        state: BridgeState,
        reason: Option<String>,
    ) -> Self {
        Self::Bridge {
            bridge_id,
            source_device_id,
            dest_device_id,
            state,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Senke fuer Hub-Ereignisse
///
/// Die konkrete Implementierung (tokio broadcast) liegt im Hub-Crate.
pub trait EventBus: Send + Sync + 'static {
    /// Sendet ein Ereignis an alle Abonnenten. Ohne Abonnenten geht es verloren.
    fn senden(&self, event: HubEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_json_form() {
        let e = HubEvent::session(DeviceId::neu("tuer"), CallState::Ringing, None);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "session");
        assert_eq!(v["device_id"], "tuer");
        assert_eq!(v["state"], "ringing");
        assert!(v.get("reason").is_none());
    }

    #[test]
    fn bridge_event_json_form() {
        let e = HubEvent::bridge(
            BridgeId::new(),
            DeviceId::neu("a"),
            DeviceId::neu("b"),
            BridgeState::Disconnected,
            Some("Verbindung getrennt".into()),
        );
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["source_device_id"], "a");
        assert_eq!(v["dest_device_id"], "b");
        assert_eq!(v["state"], "disconnected");
        assert_eq!(v["reason"], "Verbindung getrennt");

        let zurueck: HubEvent = serde_json::from_value(v).unwrap();
        assert_eq!(zurueck, e);
    }
}
