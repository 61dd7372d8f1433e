//! intercom-hub – Hub-Seite des Intercom-Relays
//!
//! - `state_machine`: Zustaende und Uebergangstabelle einer Session
//! - `session`: Session-Task pro Endpunkt-Verbindung
//! - `outbound`: Ausgangs-Queue mit Ueberlastschutz und Schreib-Task
//! - `registry`: hoechstens eine Session pro Geraet
//! - `directory`: Geraeteverzeichnis
//! - `bridge`: Endpunkt-zu-Endpunkt Bridges
//! - `events`: UI-Ereignisse ueber tokio broadcast
//! - `hub`: Fassade fuer den Server

pub mod bridge;
pub mod config;
pub mod directory;
pub mod events;
pub mod hub;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod state_machine;

pub use bridge::{BridgeCoordinator, BridgeHandle, BridgeStatus, BridgeZustand};
pub use config::HubConfig;
pub use directory::{DeviceDirectory, StaticDirectory};
pub use events::EventBroadcaster;
pub use hub::Hub;
pub use outbound::{AudioSenke, OutboundQueue};
pub use session::{SessionHandle, SessionStatistik, SessionStatus};
pub use state_machine::{Abbruch, SessionZustand, TimeoutArt};
