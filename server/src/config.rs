//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Hub ohne Konfigurationsdatei
//! lauffaehig ist (dann allerdings ohne Geraete).

use intercom_core::DeviceInfo;
use intercom_hub::HubConfig;
use serde::{Deserialize, Serialize};

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// Sessions, Zeitlimits, Queues
    pub hub: HubConfig,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Statisches Geraeteverzeichnis
    pub geraete: Vec<DeviceInfo>,
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// Bind-Adresse fuer die Websocket-API
    pub bind_adresse: String,
    /// Port fuer die Websocket-API
    pub api_port: u16,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            api_port: 8099,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ServerConfig {
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

    /// Prueft Hub-Werte und doppelte Geraete-IDs
    pub fn validieren(&self) -> anyhow::Result<()> {
        self.hub
            .validieren()
            .map_err(|e| anyhow::anyhow!("[hub]: {e}"))?;
        let mut ids: Vec<_> = self.geraete.iter().map(|g| &g.device_id).collect();
        ids.sort();
        if let Some(doppelt) = ids.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("Geraete-ID '{}' ist mehrfach konfiguriert", doppelt[0]);
        }
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse fuer die Websocket-API zurueck
    pub fn api_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.api_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert!(cfg.validieren().is_ok());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.hub.endpoint_port, 6054);
        assert!(cfg.geraete.is_empty());
    }

    #[test]
    fn bind_adresse() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.api_bind_adresse(), "0.0.0.0:8099");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [netzwerk]
            api_port = 9000

            [hub]
            drain_batch = 4

            [[geraete]]
            device_id = "tuer"
            name = "Haustuer"
            host = "192.168.1.20"

            [[geraete]]
            device_id = "garage"
            name = "Garage"
            host = "garage.local:6055"
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.netzwerk.api_port, 9000);
        assert_eq!(cfg.hub.drain_batch, 4);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.hub.ausgang_max_audio, 32);
        assert_eq!(cfg.netzwerk.bind_adresse, "0.0.0.0");
        assert_eq!(cfg.geraete.len(), 2);
        assert_eq!(cfg.geraete[1].host, "garage.local:6055");
        assert!(cfg.validieren().is_ok());
    }

    #[test]
    fn doppelte_geraete_ungueltig() {
        let toml = r#"
            [[geraete]]
            device_id = "tuer"
            name = "A"
            host = "10.0.0.1"

            [[geraete]]
            device_id = "tuer"
            name = "B"
            host = "10.0.0.2"
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn fehlende_datei_liefert_standard() {
        let cfg = ServerConfig::laden("/nicht/vorhanden/intercom.toml").unwrap();
        assert_eq!(cfg.netzwerk.api_port, 8099);
    }
}
