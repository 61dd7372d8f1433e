//! Bridge-Koordinator: zwei Endpunkte direkt verbinden
//!
//! Eine Bridge besitzt genau zwei Hub-Sessions (Beine). Audio von A wird
//! direkt in die Ausgangs-Queue von B eingereiht und umgekehrt, ohne
//! Client dazwischen. Endet ein Bein (STOP, Fehler, Trennung), werden
//! beide abgebaut; erst danach erscheint genau ein `disconnected`.
//!
//! ```text
//! Endpunkt A <-> Session A --Queue B--> Session B <-> Endpunkt B
//!                          <--Queue A--
//! ```

use dashmap::DashMap;
use intercom_core::{
    BridgeId, BridgeState, DeviceId, EventBus, HubEvent, IntercomError, Result, SessionId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::HubConfig;
use crate::directory::{endpunkt_adresse, DeviceDirectory};
use crate::outbound::OutboundQueue;
use crate::registry::{Besitzer, SessionRegistry};
use crate::session::{session_starten, SessionHandle, SessionStart, SessionStatus};
use crate::state_machine::SessionZustand;

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Zustand einer Bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeZustand {
    /// Beine bauen auf oder klingeln
    Aufbau,
    /// Beide Beine streamen
    Verbunden,
    /// Beide Beine beendet, Geraete freigegeben
    Beendet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub zustand: BridgeZustand,
    /// Grund bei fehlerhaftem Ende
    pub grund: Option<String>,
}

/// Handle auf eine Bridge
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    id: BridgeId,
    quelle: SessionHandle,
    ziel: SessionHandle,
    stopp: mpsc::Sender<()>,
    status: watch::Receiver<BridgeStatus>,
}

impl BridgeHandle {
    pub fn id(&self) -> BridgeId {
        self.inner.id
    }

    pub fn quelle(&self) -> &SessionHandle {
        &self.inner.quelle
    }

    pub fn ziel(&self) -> &SessionHandle {
        &self.inner.ziel
    }

    pub fn status(&self) -> BridgeStatus {
        self.inner.status.borrow().clone()
    }

    pub fn status_abonnieren(&self) -> watch::Receiver<BridgeStatus> {
        self.inner.status.clone()
    }

    /// Baut beide Beine ab und wartet bis die Bridge beendet ist
    pub async fn stoppen(&self) -> BridgeStatus {
        // Voll oder geschlossen: Abbau laeuft bereits
        if self.inner.stopp.try_send(()).is_err() {
            tracing::debug!(bridge = %self.inner.id, "Bridge bereits im Abbau");
        }
        self.beendet().await
    }

    /// Wartet bis beide Beine beendet und die Geraete freigegeben sind
    pub async fn beendet(&self) -> BridgeStatus {
        let mut rx = self.inner.status.clone();
        if rx
            .wait_for(|s| s.zustand == BridgeZustand::Beendet)
            .await
            .is_err()
        {
            tracing::debug!(bridge = %self.inner.id, "Ueberwachung ohne Abschluss beendet");
        }
        let status = rx.borrow().clone();
        status
    }
}

// ---------------------------------------------------------------------------
// BridgeCoordinator
// ---------------------------------------------------------------------------

/// Verwaltet alle aktiven Bridges
///
/// Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct BridgeCoordinator {
    config: Arc<HubConfig>,
    directory: Arc<dyn DeviceDirectory>,
    registry: SessionRegistry,
    events: Arc<dyn EventBus>,
    bridges: Arc<DashMap<BridgeId, BridgeHandle>>,
}

impl BridgeCoordinator {
    pub fn neu(
        config: Arc<HubConfig>,
        directory: Arc<dyn DeviceDirectory>,
        registry: SessionRegistry,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            directory,
            registry,
            events,
            bridges: Arc::new(DashMap::new()),
        }
    }

    /// Baut eine Bridge zwischen `quelle` und `ziel` auf
    ///
    /// Beide Geraete muessen im Verzeichnis stehen, sonst
    /// `EndpointUnavailable` ohne Verbindungsversuch. Belegte Geraete
    /// liefern `SessionConflict`.
    pub fn starten(&self, quelle: &DeviceId, ziel: &DeviceId) -> Result<BridgeHandle> {
        if quelle == ziel {
            return Err(IntercomError::ungueltiger_zustand(
                "Quelle und Ziel der Bridge sind identisch",
            ));
        }
        let info_quelle = self
            .directory
            .aufloesen(quelle)
            .ok_or_else(|| IntercomError::EndpointUnavailable(quelle.clone()))?;
        let info_ziel = self
            .directory
            .aufloesen(ziel)
            .ok_or_else(|| IntercomError::EndpointUnavailable(ziel.clone()))?;

        let id = BridgeId::new();
        let besitzer = Besitzer::Bridge(id);
        self.registry.reservieren(quelle, besitzer)?;
        if let Err(e) = self.registry.reservieren(ziel, besitzer) {
            self.registry.freigeben(quelle, besitzer);
            return Err(e);
        }

        // Queues vorab, damit jedes Bein direkt in die des anderen schreibt
        let queue_quelle = OutboundQueue::neu(self.config.ausgang_max_audio);
        let queue_ziel = OutboundQueue::neu(self.config.ausgang_max_audio);

        let bein_quelle = session_starten(
            SessionStart {
                id: SessionId::new(),
                device_id: quelle.clone(),
                adresse: endpunkt_adresse(&info_quelle, self.config.endpoint_port),
                senke: Arc::new(queue_ziel.clone()),
                events: None,
                queue: queue_quelle.clone(),
            },
            Arc::clone(&self.config),
        );
        let bein_ziel = session_starten(
            SessionStart {
                id: SessionId::new(),
                device_id: ziel.clone(),
                adresse: endpunkt_adresse(&info_ziel, self.config.endpoint_port),
                senke: Arc::new(queue_quelle),
                events: None,
                queue: queue_ziel,
            },
            Arc::clone(&self.config),
        );
        self.registry.session_setzen(quelle, besitzer, bein_quelle.clone());
        self.registry.session_setzen(ziel, besitzer, bein_ziel.clone());

        let (stopp_tx, stopp_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(BridgeStatus {
            zustand: BridgeZustand::Aufbau,
            grund: None,
        });
        let handle = BridgeHandle {
            inner: Arc::new(BridgeInner {
                id,
                quelle: bein_quelle.clone(),
                ziel: bein_ziel.clone(),
                stopp: stopp_tx,
                status: status_rx,
            }),
        };
        self.bridges.insert(id, handle.clone());

        tracing::info!(bridge = %id, quelle = %quelle, ziel = %ziel, "Bridge wird aufgebaut");
        tokio::spawn(
            Ueberwachung {
                id,
                quelle: bein_quelle,
                ziel: bein_ziel,
                registry: self.registry.clone(),
                events: Arc::clone(&self.events),
                bridges: Arc::clone(&self.bridges),
                status_tx,
            }
            .ausfuehren(stopp_rx),
        );
        Ok(handle)
    }

    pub fn bridge(&self, id: &BridgeId) -> Option<BridgeHandle> {
        self.bridges.get(id).map(|b| b.clone())
    }

    /// Stoppt eine Bridge; `false` wenn die ID unbekannt ist
    pub async fn stoppen(&self, id: &BridgeId) -> bool {
        let Some(handle) = self.bridge(id) else {
            return false;
        };
        handle.stoppen().await;
        true
    }

    pub fn bridges(&self) -> Vec<BridgeHandle> {
        self.bridges.iter().map(|b| b.clone()).collect()
    }

    /// Stoppt alle Bridges
    pub async fn alle_stoppen(&self) {
        for handle in self.bridges() {
            handle.stoppen().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Ueberwachung
// ---------------------------------------------------------------------------

struct Ueberwachung {
    id: BridgeId,
    quelle: SessionHandle,
    ziel: SessionHandle,
    registry: SessionRegistry,
    events: Arc<dyn EventBus>,
    bridges: Arc<DashMap<BridgeId, BridgeHandle>>,
    status_tx: watch::Sender<BridgeStatus>,
}

/// Ein Bein gilt als beendet sobald sein Ende feststeht
fn bein_endet(s: &SessionStatus) -> bool {
    s.beendet || s.abbruch.is_some() || s.zustand == SessionZustand::Error
}

impl Ueberwachung {
    async fn ausfuehren(self, mut stopp_rx: mpsc::Receiver<()>) {
        let mut quelle_rx = self.quelle.status_abonnieren();
        let mut ziel_rx = self.ziel.status_abonnieren();
        let mut verbunden = false;

        // Erstes endendes Bein bestimmt den Grund
        let ausloeser: Option<(DeviceId, SessionStatus)> = loop {
            let quelle = quelle_rx.borrow_and_update().clone();
            let ziel = ziel_rx.borrow_and_update().clone();

            if bein_endet(&quelle) {
                break Some((self.quelle.device_id().clone(), quelle));
            }
            if bein_endet(&ziel) {
                break Some((self.ziel.device_id().clone(), ziel));
            }
            if !verbunden
                && quelle.zustand == SessionZustand::Streaming
                && ziel.zustand == SessionZustand::Streaming
            {
                verbunden = true;
                tracing::info!(bridge = %self.id, "Bridge verbunden");
                self.status_tx.send_replace(BridgeStatus {
                    zustand: BridgeZustand::Verbunden,
                    grund: None,
                });
                self.melden(BridgeState::Connected, None);
            }

            tokio::select! {
                _ = quelle_rx.changed() => {}
                _ = ziel_rx.changed() => {}
                Some(()) = stopp_rx.recv() => break None,
            }
        };

        let grund = ausloeser.as_ref().and_then(|(device, status)| {
            status.abbruch.as_ref().and_then(|a| a.grund(device))
        });
        match &ausloeser {
            Some((device, _)) => {
                tracing::info!(bridge = %self.id, ausloeser = %device, grund = ?grund, "Bein beendet - Bridge wird abgebaut")
            }
            None => tracing::info!(bridge = %self.id, "Bridge wird gestoppt"),
        }

        // Beide Beine abbauen und auf ihr Ende warten
        tokio::join!(self.quelle.stoppen(), self.ziel.stoppen());
        tokio::join!(self.quelle.beendet(), self.ziel.beendet());

        let besitzer = Besitzer::Bridge(self.id);
        self.registry.freigeben(self.quelle.device_id(), besitzer);
        self.registry.freigeben(self.ziel.device_id(), besitzer);
        self.bridges.remove(&self.id);

        self.status_tx.send_replace(BridgeStatus {
            zustand: BridgeZustand::Beendet,
            grund: grund.clone(),
        });
        self.melden(BridgeState::Disconnected, grund);
        tracing::info!(bridge = %self.id, "Bridge beendet");
    }

    fn melden(&self, state: BridgeState, reason: Option<String>) {
        self.events.senden(HubEvent::bridge(
            self.id,
            self.quelle.device_id().clone(),
            self.ziel.device_id().clone(),
            state,
            reason,
        ));
    }
}
