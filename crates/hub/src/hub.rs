//! Hub-Fassade
//!
//! Buendelt Geraeteverzeichnis, Belegung, Sessions, Bridges und den
//! Event-Kanal hinter einer Clone-baren API fuer den Server.

use bytes::Bytes;
use intercom_core::{BridgeId, DeviceId, DeviceInfo, EventBus, HubEvent, IntercomError, Result, SessionId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::bridge::{BridgeCoordinator, BridgeHandle};
use crate::config::HubConfig;
use crate::directory::{endpunkt_adresse, DeviceDirectory};
use crate::events::EventBroadcaster;
use crate::outbound::{AudioSenke, OutboundQueue};
use crate::registry::{Besitzer, SessionRegistry};
use crate::session::{session_starten, SessionHandle, SessionStart};

/// Zentraler Hub
///
/// Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: Arc<HubConfig>,
    directory: Arc<dyn DeviceDirectory>,
    registry: SessionRegistry,
    events: EventBroadcaster,
    bridges: BridgeCoordinator,
}

impl Hub {
    pub fn neu(config: HubConfig, directory: Arc<dyn DeviceDirectory>) -> Self {
        let config = Arc::new(config);
        let registry = SessionRegistry::neu();
        let events = EventBroadcaster::neu();
        let bridges = BridgeCoordinator::neu(
            Arc::clone(&config),
            Arc::clone(&directory),
            registry.clone(),
            Arc::new(events.clone()),
        );
        Self {
            inner: Arc::new(HubInner {
                config,
                directory,
                registry,
                events,
                bridges,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Geraete und Ereignisse
    // -----------------------------------------------------------------------

    pub fn geraete(&self) -> Vec<DeviceInfo> {
        self.inner.directory.geraete()
    }

    pub fn ereignisse_abonnieren(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.abonnieren()
    }

    // -----------------------------------------------------------------------
    // Direkte Sessions
    // -----------------------------------------------------------------------

    /// Startet eine Session zu `device_id`; Endpunkt-Audio geht an `senke`
    ///
    /// Fehler: `EndpointUnavailable` fuer unbekannte Geraete,
    /// `SessionConflict` wenn das Geraet bereits belegt ist.
    pub fn sitzung_starten(
        &self,
        device_id: &DeviceId,
        senke: Arc<dyn AudioSenke>,
    ) -> Result<SessionHandle> {
        let info = self
            .inner
            .directory
            .aufloesen(device_id)
            .ok_or_else(|| IntercomError::EndpointUnavailable(device_id.clone()))?;

        let id = SessionId::new();
        let besitzer = Besitzer::Session(id);
        self.inner.registry.reservieren(device_id, besitzer)?;

        let events: Arc<dyn EventBus> = Arc::new(self.inner.events.clone());
        let handle = session_starten(
            SessionStart {
                id,
                device_id: device_id.clone(),
                adresse: endpunkt_adresse(&info, self.inner.config.endpoint_port),
                senke,
                events: Some(events),
                queue: OutboundQueue::neu(self.inner.config.ausgang_max_audio),
            },
            Arc::clone(&self.inner.config),
        );
        self.inner
            .registry
            .session_setzen(device_id, besitzer, handle.clone());

        // Belegung freigeben sobald der Task endet
        let registry = self.inner.registry.clone();
        let beobachtet = handle.clone();
        tokio::spawn(async move {
            beobachtet.beendet().await;
            registry.freigeben(beobachtet.device_id(), besitzer);
        });

        Ok(handle)
    }

    /// Wie `sitzung_starten`, Endpunkt-Audio landet in einem Kanal
    pub fn sitzung_mit_kanal(
        &self,
        device_id: &DeviceId,
    ) -> Result<(SessionHandle, mpsc::Receiver<Bytes>)> {
        let (tx, rx) = mpsc::channel(self.inner.config.client_queue_groesse);
        let handle = self.sitzung_starten(device_id, Arc::new(tx))?;
        Ok((handle, rx))
    }

    /// Direkte Session eines Geraets
    pub fn sitzung(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        self.inner.registry.direkte_session(device_id)
    }

    pub fn sitzungen(&self) -> Vec<SessionHandle> {
        self.inner.registry.sessions()
    }

    /// Stoppt die direkte Session eines Geraets und wartet auf ihr Ende
    ///
    /// `Ok(false)` wenn keine Session laeuft. Bridge-Beine koennen nur
    /// ueber `bridge_stoppen` beendet werden.
    pub async fn sitzung_stoppen(&self, device_id: &DeviceId) -> Result<bool> {
        match self.inner.registry.besitzer(device_id) {
            None => Ok(false),
            Some(Besitzer::Bridge(bridge)) => Err(IntercomError::ungueltiger_zustand(format!(
                "Geraet {device_id} ist Teil von {bridge}"
            ))),
            Some(Besitzer::Session(_)) => {
                let Some(handle) = self.inner.registry.direkte_session(device_id) else {
                    return Ok(false);
                };
                handle.stoppen().await;
                handle.beendet().await;
                Ok(true)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bridges
    // -----------------------------------------------------------------------

    pub fn bridge_starten(&self, quelle: &DeviceId, ziel: &DeviceId) -> Result<BridgeHandle> {
        self.inner.bridges.starten(quelle, ziel)
    }

    /// `false` wenn die Bridge unbekannt ist
    pub async fn bridge_stoppen(&self, id: &BridgeId) -> bool {
        self.inner.bridges.stoppen(id).await
    }

    pub fn bridge(&self, id: &BridgeId) -> Option<BridgeHandle> {
        self.inner.bridges.bridge(id)
    }

    pub fn bridges(&self) -> Vec<BridgeHandle> {
        self.inner.bridges.bridges()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stoppt alle Bridges und Sessions
    pub async fn herunterfahren(&self) {
        tracing::info!(
            sessions = self.inner.registry.sessions().len(),
            bridges = self.inner.bridges.bridges().len(),
            "Hub wird heruntergefahren"
        );
        self.inner.bridges.alle_stoppen().await;
        let sessions = self.inner.registry.sessions();
        futures_util::future::join_all(sessions.iter().map(|s| async move {
            s.stoppen().await;
            s.beendet().await;
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;

    fn hub() -> Hub {
        let dir = StaticDirectory::neu([DeviceInfo {
            device_id: DeviceId::neu("tuer"),
            name: "Tuer".into(),
            // Port 1 ist auf 127.0.0.1 nicht belegt
            host: "127.0.0.1:1".into(),
        }]);
        Hub::neu(HubConfig::default(), Arc::new(dir))
    }

    #[tokio::test]
    async fn unbekanntes_geraet_ist_nicht_verfuegbar() {
        let hub = hub();
        let r = hub.sitzung_mit_kanal(&DeviceId::neu("garage"));
        assert!(matches!(r, Err(IntercomError::EndpointUnavailable(_))));
        assert!(hub.sitzungen().is_empty());
    }

    #[tokio::test]
    async fn stoppen_ohne_session() {
        let hub = hub();
        assert!(!hub.sitzung_stoppen(&DeviceId::neu("tuer")).await.unwrap());
        assert!(!hub.bridge_stoppen(&BridgeId::new()).await);
    }

    #[tokio::test]
    async fn abgelehnte_verbindung_gibt_geraet_frei() {
        let hub = hub();
        let mut events = hub.ereignisse_abonnieren();
        let tuer = DeviceId::neu("tuer");
        let (handle, _audio) = hub.sitzung_mit_kanal(&tuer).unwrap();

        let status = handle.beendet().await;
        assert!(status.abbruch.is_some());

        match events.recv().await.unwrap() {
            HubEvent::Session { state, reason, .. } => {
                assert_eq!(state, intercom_core::CallState::Disconnected);
                assert!(reason.is_some());
            }
            andere => panic!("unerwartet: {andere:?}"),
        }

        // Belegung wird asynchron freigegeben
        for _ in 0..50 {
            if hub.sitzung(&tuer).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(hub.sitzung_mit_kanal(&tuer).is_ok());
    }
}
