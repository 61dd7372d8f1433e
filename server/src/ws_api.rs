//! Websocket-Schnittstelle fuer Browser-Clients
//!
//! Eine Verbindung unter `/api/websocket` transportiert JSON-Anfragen
//! (`intercom/start`, `intercom/stop`, ...), Ergebnisse, Hub-Ereignisse
//! und base64-Audio in beide Richtungen.
//!
//! Direkte Sessions gehoeren der Verbindung die sie gestartet hat und
//! werden beim Schliessen des Sockets beendet. Bridges leben unabhaengig
//! vom Client weiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use intercom_core::{DeviceId, IntercomError};
use intercom_hub::{AudioSenke, Hub, SessionHandle};
use intercom_protocol::{AudioUmschlag, UiAnfrage, UiBefehl, UiNachricht};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Pfad der Websocket-Route
pub const WS_PFAD: &str = "/api/websocket";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Baut den Axum-Router mit Websocket-Route und Health-Check
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route(WS_PFAD, get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// GET /health
async fn health(State(hub): State<Hub>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "geraete": hub.geraete().len(),
            "sessions": hub.sitzungen().len(),
            "bridges": hub.bridges().len(),
        })),
    )
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Hub>) -> Response {
    ws.on_upgrade(move |socket| verbindung_bedienen(socket, hub))
}

// ---------------------------------------------------------------------------
// Verbindung
// ---------------------------------------------------------------------------

/// Bedient einen Websocket bis der Client trennt
async fn verbindung_bedienen(socket: WebSocket, hub: Hub) {
    let (mut sink, mut stream) = socket.split();
    let (ausgang_tx, mut ausgang_rx) =
        mpsc::channel::<UiNachricht>(hub.config().client_queue_groesse);
    let mut events = hub.ereignisse_abonnieren();
    let mut client = ClientSitzung::neu(hub, ausgang_tx.clone());

    tracing::info!("UI-Client verbunden");

    // Einziger Schreiber auf den Socket
    let schreiber = tokio::spawn(async move {
        while let Some(nachricht) = ausgang_rx.recv().await {
            let text = match nachricht.als_text() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(fehler = %e, "UI-Nachricht nicht serialisierbar");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            eingang = stream.next() => match eingang {
                Some(Ok(Message::Text(text))) => {
                    if let Some(antwort) = client.bearbeiten(&text).await {
                        if ausgang_tx.send(antwort).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(fehler = %e, "Websocket-Lesefehler");
                    break;
                }
            },
            ereignis = events.recv() => match ereignis {
                Ok(event) => {
                    if ausgang_tx.send(UiNachricht::Ereignis { event }).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(verpasst = n, "UI-Client zu langsam, Ereignisse verworfen");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.aufraeumen().await;
    drop(ausgang_tx);
    drop(client);
    // Audio-Senken beendeter Sessions halten den Kanal ggf. noch kurz offen
    if tokio::time::timeout(Duration::from_secs(1), schreiber).await.is_err() {
        tracing::debug!("UI-Schreiber nicht rechtzeitig beendet");
    }
    tracing::info!("UI-Client getrennt");
}

// ---------------------------------------------------------------------------
// Audio-Senke Richtung Client
// ---------------------------------------------------------------------------

/// Verpackt Endpunkt-Audio als `intercom/audio` fuer den Client
struct WsAudioSenke {
    device_id: DeviceId,
    tx: mpsc::Sender<UiNachricht>,
}

impl AudioSenke for WsAudioSenke {
    fn audio(&self, pcm: Bytes) {
        let nachricht = UiNachricht::Audio(AudioUmschlag::aus_pcm(self.device_id.clone(), &pcm));
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(nachricht) {
            tracing::warn!(device = %self.device_id, "UI-Ausgang voll, Audio verworfen");
        }
    }
}

// ---------------------------------------------------------------------------
// Anfrage-Verarbeitung
// ---------------------------------------------------------------------------

/// Zustand einer Client-Verbindung, unabhaengig vom Socket
pub struct ClientSitzung {
    hub: Hub,
    ausgang: mpsc::Sender<UiNachricht>,
    eigene: HashMap<DeviceId, SessionHandle>,
}

impl ClientSitzung {
    pub fn neu(hub: Hub, ausgang: mpsc::Sender<UiNachricht>) -> Self {
        Self {
            hub,
            ausgang,
            eigene: HashMap::new(),
        }
    }

    /// Verarbeitet eine Textnachricht. `None` bedeutet: keine Antwort
    /// (erfolgreiches Audio).
    pub async fn bearbeiten(&mut self, text: &str) -> Option<UiNachricht> {
        let anfrage = match UiAnfrage::parsen(text) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(fehler = %e, "Ungueltige UI-Anfrage");
                return Some(UiNachricht::fehler(
                    roh_id(text),
                    "invalid_request",
                    e.to_string(),
                ));
            }
        };
        let id = anfrage.id;

        match anfrage.befehl {
            UiBefehl::Start { device_id } => {
                let senke = Arc::new(WsAudioSenke {
                    device_id: device_id.clone(),
                    tx: self.ausgang.clone(),
                });
                match self.hub.sitzung_starten(&device_id, senke) {
                    Ok(handle) => {
                        let session_id = handle.id().inner().to_string();
                        self.eigene.insert(device_id, handle);
                        Some(UiNachricht::ok(id, Some(json!({ "session_id": session_id }))))
                    }
                    Err(e) => Some(fehler_antwort(id, &e)),
                }
            }
            UiBefehl::Stop { device_id } => {
                self.eigene.remove(&device_id);
                match self.hub.sitzung_stoppen(&device_id).await {
                    Ok(true) => Some(UiNachricht::ok(id, None)),
                    Ok(false) => Some(UiNachricht::fehler(
                        id,
                        "not_found",
                        format!("Keine aktive Session fuer {device_id}"),
                    )),
                    Err(e) => Some(fehler_antwort(id, &e)),
                }
            }
            UiBefehl::List => Some(UiNachricht::ok(
                id,
                Some(json!({ "devices": self.hub.geraete() })),
            )),
            UiBefehl::BridgeStart {
                source_device_id,
                dest_device_id,
            } => match self.hub.bridge_starten(&source_device_id, &dest_device_id) {
                Ok(bridge) => Some(UiNachricht::ok(
                    id,
                    Some(json!({ "bridge_id": bridge.id() })),
                )),
                Err(e) => Some(fehler_antwort(id, &e)),
            },
            UiBefehl::BridgeStop { bridge_id } => {
                if self.hub.bridge_stoppen(&bridge_id).await {
                    Some(UiNachricht::ok(id, None))
                } else {
                    Some(UiNachricht::fehler(
                        id,
                        "not_found",
                        format!("Bridge {bridge_id} unbekannt"),
                    ))
                }
            }
            UiBefehl::Audio(umschlag) => {
                let pcm = match umschlag.pcm() {
                    Ok(p) => p,
                    Err(e) => {
                        return Some(UiNachricht::fehler(id, "invalid_request", e.to_string()))
                    }
                };
                match self.hub.sitzung(&umschlag.device_id) {
                    // Ausserhalb von Streaming verwirft die Session still
                    Some(session) => {
                        session.audio_senden(Bytes::from(pcm));
                        None
                    }
                    None => Some(UiNachricht::fehler(
                        id,
                        "not_found",
                        format!("Keine aktive Session fuer {}", umschlag.device_id),
                    )),
                }
            }
        }
    }

    /// Beendet alle noch laufenden Sessions dieser Verbindung
    pub async fn aufraeumen(&mut self) {
        for (device_id, session) in self.eigene.drain() {
            if !session.ist_beendet() {
                tracing::debug!(device = %device_id, "Session des Clients wird beendet");
                session.stoppen().await;
                session.beendet().await;
            }
        }
    }

    /// Anzahl der von dieser Verbindung gestarteten Sessions
    pub fn eigene_sessions(&self) -> usize {
        self.eigene.len()
    }
}

fn fehler_antwort(id: u64, e: &IntercomError) -> UiNachricht {
    UiNachricht::fehler(id, e.code(), e.grund())
}

/// Holt die `id` aus einer sonst ungueltigen Anfrage, 0 wenn keine da ist
fn roh_id(text: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_core::DeviceInfo;
    use intercom_hub::{HubConfig, StaticDirectory};
    use intercom_protocol::frame::{Frame, FrameFlags, FrameType};
    use intercom_protocol::wire::{read_frame, write_frame};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const ZEITLIMIT: Duration = Duration::from_secs(3);

    fn hub(geraete: Vec<DeviceInfo>) -> Hub {
        let config = HubConfig {
            verbindungs_timeout_ms: 500,
            start_ack_timeout_ms: 500,
            drain_timeout_ms: 300,
            schliess_verzoegerung_ms: 5,
            ..Default::default()
        };
        Hub::neu(config, Arc::new(StaticDirectory::neu(geraete)))
    }

    fn geraet(id: &str, host: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::neu(id),
            name: id.into(),
            host: host.into(),
        }
    }

    fn client(hub: Hub) -> (ClientSitzung, mpsc::Receiver<UiNachricht>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientSitzung::neu(hub, tx), rx)
    }

    fn fehlercode(n: &UiNachricht) -> Option<String> {
        match n {
            UiNachricht::Ergebnis { error, .. } => error.as_ref().map(|e| e.code.clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn liste_enthaelt_konfigurierte_geraete() {
        let (mut c, _rx) = client(hub(vec![geraet("tuer", "10.0.0.1")]));
        let antwort = c.bearbeiten(r#"{"id":3,"type":"intercom/list"}"#).await.unwrap();
        match antwort {
            UiNachricht::Ergebnis {
                id,
                success,
                result,
                ..
            } => {
                assert_eq!(id, 3);
                assert!(success);
                let result = result.unwrap();
                assert_eq!(result["devices"][0]["device_id"], "tuer");
            }
            andere => panic!("Unerwartete Antwort: {andere:?}"),
        }
    }

    #[tokio::test]
    async fn ungueltiges_json_behaelt_id() {
        let (mut c, _rx) = client(hub(vec![]));
        let antwort = c
            .bearbeiten(r#"{"id":9,"type":"intercom/unbekannt"}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("invalid_request"));
        assert!(matches!(antwort, UiNachricht::Ergebnis { id: 9, success: false, .. }));

        let antwort = c.bearbeiten("kein json").await.unwrap();
        assert!(matches!(antwort, UiNachricht::Ergebnis { id: 0, .. }));
    }

    #[tokio::test]
    async fn start_unbekanntes_geraet() {
        let (mut c, _rx) = client(hub(vec![]));
        let antwort = c
            .bearbeiten(r#"{"id":1,"type":"intercom/start","device_id":"garage"}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("endpoint_unavailable"));
        assert_eq!(c.eigene_sessions(), 0);
    }

    #[tokio::test]
    async fn stopp_ohne_session_ist_not_found() {
        let (mut c, _rx) = client(hub(vec![geraet("tuer", "10.0.0.1")]));
        let antwort = c
            .bearbeiten(r#"{"id":2,"type":"intercom/stop","device_id":"tuer"}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("not_found"));

        let antwort = c
            .bearbeiten(&format!(
                r#"{{"id":4,"type":"intercom/bridge_stop","bridge_id":"{}"}}"#,
                uuid_null()
            ))
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("not_found"));
    }

    fn uuid_null() -> &'static str {
        "00000000-0000-0000-0000-000000000000"
    }

    #[tokio::test]
    async fn audio_ohne_session_und_kaputtes_base64() {
        let (mut c, _rx) = client(hub(vec![geraet("tuer", "10.0.0.1")]));
        let antwort = c
            .bearbeiten(r#"{"id":5,"type":"intercom/audio","device_id":"tuer","data":"AQI="}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("not_found"));

        let antwort = c
            .bearbeiten(r#"{"id":6,"type":"intercom/audio","device_id":"tuer","data":"%%%"}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("invalid_request"));
    }

    #[tokio::test]
    async fn session_ueber_client_mit_audio_in_beide_richtungen() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let hub = hub(vec![geraet("tuer", &host)]);
        let (mut c, mut rx) = client(hub.clone());

        let antwort = c
            .bearbeiten(r#"{"id":1,"type":"intercom/start","device_id":"tuer"}"#)
            .await
            .unwrap();
        assert!(matches!(antwort, UiNachricht::Ergebnis { success: true, .. }));

        // Zweiter Start wird abgelehnt
        let antwort = c
            .bearbeiten(r#"{"id":2,"type":"intercom/start","device_id":"tuer"}"#)
            .await
            .unwrap();
        assert_eq!(fehlercode(&antwort).as_deref(), Some("already_active"));

        let (mut stream, _) = timeout(ZEITLIMIT, listener.accept()).await.unwrap().unwrap();
        let start = read_frame(&mut stream).await.unwrap();
        assert_eq!(start.typ, FrameType::Start);
        write_frame(&mut stream, &Frame::start(FrameFlags::NONE))
            .await
            .unwrap();

        // Endpunkt -> Client als base64-Umschlag
        write_frame(&mut stream, &Frame::audio(vec![1, 0, 2, 0]))
            .await
            .unwrap();
        let nachricht = timeout(ZEITLIMIT, rx.recv()).await.unwrap().unwrap();
        match nachricht {
            UiNachricht::Audio(u) => {
                assert_eq!(u.device_id.as_str(), "tuer");
                assert_eq!(u.pcm().unwrap(), vec![1, 0, 2, 0]);
            }
            andere => panic!("Unerwartete Nachricht: {andere:?}"),
        }

        // Client -> Endpunkt, erst wenn die Session streamt
        let session = hub.sitzung(&DeviceId::neu("tuer")).unwrap();
        let mut status = session.status_abonnieren();
        timeout(
            ZEITLIMIT,
            status.wait_for(|s| s.zustand == intercom_hub::SessionZustand::Streaming),
        )
        .await
        .unwrap()
        .unwrap();
        let umschlag = AudioUmschlag::aus_pcm(DeviceId::neu("tuer"), &[7, 0, 8, 0]);
        let text = format!(
            r#"{{"id":3,"type":"intercom/audio","device_id":"tuer","data":"{}"}}"#,
            umschlag.data
        );
        assert!(c.bearbeiten(&text).await.is_none());
        let f = read_frame(&mut stream).await.unwrap();
        assert_eq!(f.typ, FrameType::Audio);
        assert_eq!(&f.payload[..], &[7, 0, 8, 0]);

        // Schliessen des Clients beendet die eigene Session
        c.aufraeumen().await;
        assert!(session.ist_beendet());
        let f = read_frame(&mut stream).await.unwrap();
        assert_eq!(f.typ, FrameType::Stop);
        assert_eq!(c.eigene_sessions(), 0);
    }
}
