//! Gemeinsame Hilfen fuer die Hub-Integrationstests

#![allow(dead_code)]

use intercom_core::{BridgeState, CallState, DeviceId, DeviceInfo, HubEvent};
use intercom_hub::{Hub, HubConfig, StaticDirectory};
use intercom_protocol::frame::Frame;
use intercom_protocol::wire::read_frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const ZEITLIMIT: Duration = Duration::from_secs(3);

/// Kurze Fristen damit Timeout-Tests schnell laufen
pub fn test_config() -> HubConfig {
    HubConfig {
        verbindungs_timeout_ms: 500,
        start_ack_timeout_ms: 300,
        ping_intervall_ms: 100,
        keepalive_timeout_ms: 400,
        drain_timeout_ms: 300,
        schliess_verzoegerung_ms: 5,
        ..Default::default()
    }
}

/// Lauschender Fake-Endpunkt mit Verzeichniseintrag
pub struct FakeEndpunkt {
    pub listener: TcpListener,
    pub info: DeviceInfo,
}

impl FakeEndpunkt {
    pub async fn neu(id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = DeviceInfo {
            device_id: DeviceId::neu(id),
            name: id.to_uppercase(),
            host: listener.local_addr().unwrap().to_string(),
        };
        Self { listener, info }
    }

    pub fn id(&self) -> DeviceId {
        self.info.device_id.clone()
    }

    pub async fn annehmen(&self) -> TcpStream {
        let (stream, _) = timeout(ZEITLIMIT, self.listener.accept())
            .await
            .expect("Hub hat nicht verbunden")
            .unwrap();
        stream
    }
}

pub fn hub_mit(geraete: &[&FakeEndpunkt], config: HubConfig) -> Hub {
    let dir = StaticDirectory::neu(geraete.iter().map(|g| g.info.clone()));
    Hub::neu(config, Arc::new(dir))
}

pub async fn lesen(stream: &mut TcpStream) -> Frame {
    timeout(ZEITLIMIT, read_frame(stream))
        .await
        .expect("Zeitlimit beim Lesen")
        .expect("Frame erwartet")
}

/// Wartet bis der Hub die Verbindung schliesst
pub async fn bis_eof(stream: &mut TcpStream) -> Vec<Frame> {
    let mut rest = Vec::new();
    loop {
        match timeout(ZEITLIMIT, read_frame(stream)).await {
            Ok(Ok(f)) => rest.push(f),
            Ok(Err(_)) => return rest,
            Err(_) => panic!("Verbindung wurde nicht geschlossen"),
        }
    }
}

pub async fn session_event(rx: &mut broadcast::Receiver<HubEvent>) -> (DeviceId, CallState, Option<String>) {
    loop {
        match timeout(ZEITLIMIT, rx.recv()).await.expect("kein Ereignis").unwrap() {
            HubEvent::Session {
                device_id,
                state,
                reason,
                ..
            } => return (device_id, state, reason),
            HubEvent::Bridge { .. } => continue,
        }
    }
}

pub async fn bridge_event(rx: &mut broadcast::Receiver<HubEvent>) -> (BridgeState, Option<String>) {
    loop {
        match timeout(ZEITLIMIT, rx.recv()).await.expect("kein Ereignis").unwrap() {
            HubEvent::Bridge { state, reason, .. } => return (state, reason),
            HubEvent::Session { .. } => continue,
        }
    }
}
