//! intercom-endpoint – Laufzeit eines Intercom-Geraets
//!
//! ## Module
//! - [`config`] – TOML-Konfiguration des Geraets
//! - [`audio`] – Mikrofon-Konvertierung und Blockbildung
//! - [`send_buffer`] – von TX und RX geteilter Sendepuffer
//! - [`runtime`] – Listener, TX- und RX-Einheit

pub mod audio;
pub mod config;
pub mod runtime;
pub mod send_buffer;

pub use config::EndpointConfig;
pub use runtime::{EndpointHandle, EndpointIo, EndpointRuntime, EndpointZustand, LokalerBefehl};
pub use send_buffer::{GeteilterSendBuffer, SendBuffer};
