//! intercom-core – Gemeinsame Typen, Ereignisse und Fehlertypen
//!
//! Dieses Crate stellt die Bausteine bereit, die Protokoll, Endpunkt,
//! Hub und Server gemeinsam nutzen.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{IntercomError, Result};
pub use event::{BridgeState, CallState, EventBus, HubEvent};
pub use types::{BridgeId, DeviceId, DeviceInfo, SessionId};
