//! Hub-Konfiguration
//!
//! Zeitlimits, Queue-Grenzen und Keepalive fuer alle Sessions. Wird vom
//! Server als Abschnitt `[hub]` aus der TOML-Konfiguration gelesen.

use intercom_protocol::frame::STANDARD_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Einstellungen fuer Hub-Sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Port der Endpunkte wenn der Host keinen enthaelt
    pub endpoint_port: u16,
    /// Zeitlimit fuer den TCP-Verbindungsaufbau
    pub verbindungs_timeout_ms: u64,
    /// Zeitlimit fuer die START-Bestaetigung des Endpunkts
    pub start_ack_timeout_ms: u64,
    /// PING-Intervall ausserhalb des Streamings
    pub ping_intervall_ms: u64,
    /// Trennen wenn ausserhalb des Streamings so lange nichts empfangen wurde
    pub keepalive_timeout_ms: u64,
    /// Maximale Anzahl ausgehender Audio-Frames in der Queue
    pub ausgang_max_audio: usize,
    /// Frames pro Schreibrunde, danach wird auf Schreibbarkeit gewartet
    pub drain_batch: usize,
    /// Zeitlimit fuer eine Schreibrunde
    pub schreib_timeout_ms: u64,
    /// Maximale Zeit zum Leeren der Queue nach STOP
    pub drain_timeout_ms: u64,
    /// Wartezeit nach dem letzten Frame bevor die Verbindung geschlossen wird
    pub schliess_verzoegerung_ms: u64,
    /// Kapazitaet der Audio-Queue Richtung Client
    pub client_queue_groesse: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint_port: STANDARD_PORT,
            verbindungs_timeout_ms: 5_000,
            start_ack_timeout_ms: 5_000,
            ping_intervall_ms: 5_000,
            keepalive_timeout_ms: 15_000,
            ausgang_max_audio: 32,
            drain_batch: 8,
            schreib_timeout_ms: 2_000,
            drain_timeout_ms: 1_000,
            schliess_verzoegerung_ms: 50,
            client_queue_groesse: 64,
        }
    }
}

impl HubConfig {
    pub fn verbindungs_timeout(&self) -> Duration {
        Duration::from_millis(self.verbindungs_timeout_ms)
    }

    pub fn start_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ack_timeout_ms)
    }

    pub fn ping_intervall(&self) -> Duration {
        Duration::from_millis(self.ping_intervall_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn schreib_timeout(&self) -> Duration {
        Duration::from_millis(self.schreib_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn schliess_verzoegerung(&self) -> Duration {
        Duration::from_millis(self.schliess_verzoegerung_ms)
    }

    /// Prueft Wertebereiche
    pub fn validieren(&self) -> Result<(), String> {
        if self.ausgang_max_audio == 0 {
            return Err("ausgang_max_audio muss mindestens 1 sein".into());
        }
        if self.drain_batch == 0 {
            return Err("drain_batch muss mindestens 1 sein".into());
        }
        if self.client_queue_groesse == 0 {
            return Err("client_queue_groesse muss mindestens 1 sein".into());
        }
        if self.ping_intervall_ms == 0 || self.keepalive_timeout_ms <= self.ping_intervall_ms {
            return Err("keepalive_timeout_ms muss groesser als ping_intervall_ms sein".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ist_valide() {
        let cfg = HubConfig::default();
        assert!(cfg.validieren().is_ok());
        assert_eq!(cfg.endpoint_port, 6054);
        assert_eq!(cfg.drain_batch, 8);
    }

    #[test]
    fn keepalive_kleiner_als_ping_ungueltig() {
        let cfg = HubConfig {
            ping_intervall_ms: 1_000,
            keepalive_timeout_ms: 500,
            ..Default::default()
        };
        assert!(cfg.validieren().is_err());
    }
}
