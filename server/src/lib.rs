//! intercom-server – Bibliotheks-Root
//!
//! Verdrahtet Konfiguration, Hub und Websocket-API und stellt den
//! oeffentlichen Einstiegspunkt fuer Integrationstests bereit.

pub mod config;
pub mod ws_api;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use config::ServerConfig;
use intercom_hub::{Hub, StaticDirectory};
use tokio::net::TcpListener;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Baut den Hub mit dem statischen Geraeteverzeichnis aus der Konfiguration
    pub fn hub(&self) -> Hub {
        let directory = StaticDirectory::neu(self.config.geraete.iter().cloned());
        Hub::neu(self.config.hub.clone(), Arc::new(directory))
    }

    /// Startet die Websocket-API und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Hub und Geraeteverzeichnis aufbauen
    /// 2. HTTP-Listener binden
    /// 3. Auf Ctrl-C warten, danach alle Sessions und Bridges beenden
    pub async fn starten(self) -> Result<()> {
        let hub = self.hub();
        let adresse = self.config.api_bind_adresse();
        let listener = TcpListener::bind(&adresse).await?;

        tracing::info!(
            adresse = %adresse,
            geraete = self.config.geraete.len(),
            endpoint_port = self.config.hub.endpoint_port,
            "Websocket-API bereit"
        );

        bedienen(listener, hub, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(fehler = %e, "Signal-Handler nicht verfuegbar");
            }
            tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
        })
        .await
    }
}

/// Bedient die API auf einem gebundenen Listener bis `shutdown` fertig ist
/// und faehrt danach den Hub herunter
pub async fn bedienen<F>(listener: TcpListener, hub: Hub, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = ws_api::router(hub.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    hub.herunterfahren().await;
    tracing::info!("Hub heruntergefahren");
    Ok(())
}
