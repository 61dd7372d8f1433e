//! Belegung der Geraete
//!
//! Pro Geraet hoechstens eine aktive Session (direkt oder als
//! Bridge-Bein). Eine zweite Anfrage wird mit `SessionConflict`
//! abgewiesen. Die Belegung wird reserviert bevor ein Task startet und
//! nur vom Besitzer wieder freigegeben.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use intercom_core::{BridgeId, DeviceId, IntercomError, Result, SessionId};
use std::sync::Arc;

use crate::session::SessionHandle;

/// Wem ein Geraet gerade gehoert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Besitzer {
    Session(SessionId),
    Bridge(BridgeId),
}

#[derive(Debug, Clone)]
struct Belegung {
    besitzer: Besitzer,
    session: Option<SessionHandle>,
}

impl Belegung {
    /// Session-Task bereits beendet, Freigabe steht nur noch aus
    fn ist_verwaist(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ist_beendet())
    }
}

/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<DeviceId, Belegung>>,
}

impl SessionRegistry {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Reserviert ein Geraet fuer `besitzer`
    ///
    /// Schlaegt mit `SessionConflict` fehl wenn das Geraet belegt ist.
    pub fn reservieren(&self, device_id: &DeviceId, besitzer: Besitzer) -> Result<()> {
        match self.inner.entry(device_id.clone()) {
            Entry::Vacant(frei) => {
                frei.insert(Belegung {
                    besitzer,
                    session: None,
                });
                Ok(())
            }
            Entry::Occupied(mut belegt) if belegt.get().ist_verwaist() => {
                tracing::debug!(device = %device_id, "Verwaiste Belegung ersetzt");
                belegt.insert(Belegung {
                    besitzer,
                    session: None,
                });
                Ok(())
            }
            Entry::Occupied(_) => Err(IntercomError::SessionConflict(device_id.clone())),
        }
    }

    /// Haengt die gestartete Session an eine bestehende Reservierung
    pub fn session_setzen(&self, device_id: &DeviceId, besitzer: Besitzer, session: SessionHandle) {
        if let Some(mut eintrag) = self.inner.get_mut(device_id) {
            if eintrag.besitzer == besitzer {
                eintrag.session = Some(session);
            }
        }
    }

    /// Gibt ein Geraet frei, aber nur wenn es `besitzer` gehoert
    pub fn freigeben(&self, device_id: &DeviceId, besitzer: Besitzer) -> bool {
        self.inner
            .remove_if(device_id, |_, b| b.besitzer == besitzer)
            .is_some()
    }

    /// Direkte Session eines Geraets (keine Bridge-Beine)
    pub fn direkte_session(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        let eintrag = self.inner.get(device_id)?;
        match eintrag.besitzer {
            Besitzer::Session(_) => eintrag.session.clone(),
            Besitzer::Bridge(_) => None,
        }
    }

    pub fn besitzer(&self, device_id: &DeviceId) -> Option<Besitzer> {
        self.inner.get(device_id).map(|e| e.besitzer)
    }

    pub fn ist_belegt(&self, device_id: &DeviceId) -> bool {
        self.inner.contains_key(device_id)
    }

    /// Alle direkten Sessions
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner
            .iter()
            .filter(|e| matches!(e.besitzer, Besitzer::Session(_)))
            .filter_map(|e| e.session.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
