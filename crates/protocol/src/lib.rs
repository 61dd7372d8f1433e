//! intercom-protocol – Protokoll-Definitionen
//!
//! - `frame`: binaeres Frame-Format der TCP-Verbindung Hub <-> Endpunkt
//! - `wire`: tokio-util Codec und async Lese-/Schreibhilfen
//! - `pcm`: Umrechnung PCM-Samples <-> Bytes
//! - `control`: JSON-Nachrichten der UI-Schnittstelle

pub mod control;
pub mod frame;
pub mod pcm;
pub mod wire;

pub use control::{AudioUmschlag, ControlError, UiAnfrage, UiBefehl, UiNachricht};
pub use frame::{ErrorCode, Frame, FrameError, FrameFlags, FrameType, STANDARD_PORT};
pub use wire::FrameCodec;
