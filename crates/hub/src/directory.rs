//! Geraeteverzeichnis
//!
//! Liefert die bekannten Endpunkte und loest eine `DeviceId` in eine
//! Netzwerkadresse auf. Die statische Variante wird aus der
//! Server-Konfiguration (`[[geraete]]`) gefuellt.

use intercom_core::{DeviceId, DeviceInfo};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Quelle fuer Geraeteinformationen
pub trait DeviceDirectory: Send + Sync + 'static {
    /// Alle bekannten Geraete, sortiert nach ID
    fn geraete(&self) -> Vec<DeviceInfo>;

    /// Sucht ein Geraet; `None` wenn unbekannt
    fn aufloesen(&self, device_id: &DeviceId) -> Option<DeviceInfo>;
}

/// Unveraenderliches Verzeichnis aus der Konfiguration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    geraete: BTreeMap<DeviceId, DeviceInfo>,
}

impl StaticDirectory {
    /// Doppelte IDs: der letzte Eintrag gewinnt
    pub fn neu(geraete: impl IntoIterator<Item = DeviceInfo>) -> Self {
        let geraete = geraete
            .into_iter()
            .map(|g| (g.device_id.clone(), g))
            .collect();
        Self { geraete }
    }

    pub fn len(&self) -> usize {
        self.geraete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geraete.is_empty()
    }
}

impl DeviceDirectory for StaticDirectory {
    fn geraete(&self) -> Vec<DeviceInfo> {
        self.geraete.values().cloned().collect()
    }

    fn aufloesen(&self, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.geraete.get(device_id).cloned()
    }
}

/// Verbindungsziel fuer ein Geraet
///
/// `host` darf `ip:port`, eine nackte IP, `name:port` oder einen
/// Hostnamen enthalten. Ohne Port wird `standard_port` verwendet.
pub fn endpunkt_adresse(info: &DeviceInfo, standard_port: u16) -> String {
    let host = info.host.trim();
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, standard_port).to_string();
    }
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{host}:{standard_port}"),
    }
}
