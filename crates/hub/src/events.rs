//! Event-Broadcaster fuer UI-Benachrichtigungen
//!
//! Verteilt `HubEvent`s ueber einen tokio broadcast-Kanal an alle
//! Abonnenten (WebSocket-Verbindungen, Tests). Langsame Abonnenten
//! verlieren aeltere Ereignisse, der Hub blockiert nie.

use intercom_core::{EventBus, HubEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Groesse des Broadcast-Kanals
const EVENT_KANAL_GROESSE: usize = 256;

/// Broadcast-Implementierung von `EventBus`
///
/// Clone teilt den inneren Kanal.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<broadcast::Sender<HubEvent>>,
}

impl EventBroadcaster {
    pub fn neu() -> Self {
        let (tx, _) = broadcast::channel(EVENT_KANAL_GROESSE);
        Self { inner: Arc::new(tx) }
    }

    /// Neuer Empfaenger, sieht nur Ereignisse ab jetzt
    pub fn abonnieren(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.subscribe()
    }

    /// Anzahl aktiver Abonnenten
    pub fn abonnenten(&self) -> usize {
        self.inner.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::neu()
    }
}

impl EventBus for EventBroadcaster {
    fn senden(&self, event: HubEvent) {
        tracing::debug!(?event, "Hub-Ereignis");
        // Ohne Abonnenten geht das Ereignis verloren
        let _ = self.inner.send(event);
    }
}
