//! Endpunkt-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! Standardwerte, ein Geraet laeuft auch ohne Konfigurationsdatei.

use intercom_protocol::frame::{MAX_PAYLOAD, STANDARD_PORT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Vollstaendige Endpunkt-Konfiguration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Anzeigename des Geraets (nur fuer Logs)
    pub name: String,
    /// Bind-Adresse des TCP-Listeners
    pub bind_adresse: String,
    /// START sofort annehmen statt zu klingeln
    pub auto_answer: bool,
    /// Groesse eines Mikrofon-Blocks in Bytes (512 = 256 Samples = 16 ms)
    pub chunk_bytes: usize,
    /// Sample-Breite des Mikrofons (16 oder 32)
    pub mic_bits: u8,
    /// Gleichanteil aus dem Mikrofonsignal entfernen
    pub dc_offset_removal: bool,
    /// Trennen wenn ausserhalb des Streamings so lange nichts empfangen wurde
    pub keepalive_timeout_ms: u64,
    /// Zeitlimit fuer einen einzelnen Schreibversuch
    pub schreib_timeout_ms: u64,
    /// Schreibversuche ohne Fortschritt bevor ein Frame aufgegeben wird
    pub max_schreib_versuche: u32,
    /// Wartezeit zwischen STOP und Schliessen der Verbindung
    pub schliess_verzoegerung_ms: u64,
    /// Kapazitaet der Lautsprecher-Queue in Bloecken
    pub lautsprecher_queue: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "Intercom".into(),
            bind_adresse: format!("0.0.0.0:{STANDARD_PORT}"),
            auto_answer: true,
            chunk_bytes: 512,
            mic_bits: 16,
            dc_offset_removal: false,
            keepalive_timeout_ms: 15_000,
            schreib_timeout_ms: 500,
            max_schreib_versuche: 8,
            schliess_verzoegerung_ms: 50,
            lautsprecher_queue: 64,
        }
    }
}

impl EndpointConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => toml::from_str::<Self>(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.validieren()?;
        Ok(config)
    }

    /// Prueft Wertebereiche
    pub fn validieren(&self) -> anyhow::Result<()> {
        if self.chunk_bytes == 0 || self.chunk_bytes % 2 != 0 || self.chunk_bytes > MAX_PAYLOAD {
            anyhow::bail!(
                "chunk_bytes muss gerade und zwischen 2 und {MAX_PAYLOAD} liegen (ist {})",
                self.chunk_bytes
            );
        }
        if self.mic_bits != 16 && self.mic_bits != 32 {
            anyhow::bail!("mic_bits muss 16 oder 32 sein (ist {})", self.mic_bits);
        }
        if self.max_schreib_versuche == 0 {
            anyhow::bail!("max_schreib_versuche muss mindestens 1 sein");
        }
        if self.lautsprecher_queue == 0 {
            anyhow::bail!("lautsprecher_queue muss mindestens 1 sein");
        }
        Ok(())
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn schreib_timeout(&self) -> Duration {
        Duration::from_millis(self.schreib_timeout_ms)
    }

    pub fn schliess_verzoegerung(&self) -> Duration {
        Duration::from_millis(self.schliess_verzoegerung_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = EndpointConfig::default();
        assert!(cfg.validieren().is_ok());
        assert_eq!(cfg.bind_adresse, "0.0.0.0:6054");
        assert_eq!(cfg.chunk_bytes, 512);
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            name = "Tuer EG"
            auto_answer = false
            mic_bits = 32
            dc_offset_removal = true
        "#;
        let cfg: EndpointConfig = toml::from_str(toml).unwrap();
        assert!(!cfg.auto_answer);
        assert_eq!(cfg.mic_bits, 32);
        assert!(cfg.dc_offset_removal);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.chunk_bytes, 512);
        assert!(cfg.validieren().is_ok());
    }

    #[test]
    fn ungueltige_werte() {
        let cfg = EndpointConfig {
            chunk_bytes: 511,
            ..Default::default()
        };
        assert!(cfg.validieren().is_err());
        let cfg = EndpointConfig {
            mic_bits: 24,
            ..Default::default()
        };
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn fehlende_datei_ergibt_standard() {
        let cfg = EndpointConfig::laden("/nicht/vorhanden/endpoint.toml").unwrap();
        assert_eq!(cfg.keepalive_timeout_ms, 15_000);
    }
}
