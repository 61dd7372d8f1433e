//! Ende-zu-Ende: Hub gegen die echte Endpunkt-Laufzeit

mod common;

use bytes::Bytes;
use common::*;
use intercom_core::{BridgeState, CallState, DeviceId, DeviceInfo};
use intercom_endpoint::{EndpointConfig, EndpointHandle, EndpointIo, EndpointRuntime, EndpointZustand};
use intercom_hub::{Hub, StaticDirectory};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Geraet {
    info: DeviceInfo,
    handle: EndpointHandle,
    mic: mpsc::Sender<Vec<i32>>,
    lautsprecher: mpsc::Receiver<Vec<i16>>,
}

async fn geraet(id: &str, auto_answer: bool) -> Geraet {
    let config = EndpointConfig {
        name: id.into(),
        bind_adresse: "127.0.0.1:0".into(),
        auto_answer,
        chunk_bytes: 64,
        schliess_verzoegerung_ms: 10,
        ..Default::default()
    };
    let (mic, mic_rx) = mpsc::channel(64);
    let (lautsprecher_tx, lautsprecher) = mpsc::channel(64);
    let handle = EndpointRuntime::binden(config)
        .await
        .unwrap()
        .starten(EndpointIo {
            mikrofon: mic_rx,
            lautsprecher: lautsprecher_tx,
        })
        .unwrap();
    let info = DeviceInfo {
        device_id: DeviceId::neu(id),
        name: id.into(),
        host: handle.lokale_adresse().to_string(),
    };
    Geraet {
        info,
        handle,
        mic,
        lautsprecher,
    }
}

fn hub_fuer(geraete: &[&Geraet]) -> Hub {
    let dir = StaticDirectory::neu(geraete.iter().map(|g| g.info.clone()));
    Hub::neu(test_config(), Arc::new(dir))
}

#[tokio::test]
async fn direkte_session_mit_echtem_endpunkt() {
    let mut g = geraet("tuer", true).await;
    let hub = hub_fuer(&[&g]);
    let mut events = hub.ereignisse_abonnieren();
    let tuer = g.info.device_id.clone();

    let (session, mut audio) = hub.sitzung_mit_kanal(&tuer).unwrap();
    let (_, state, _) = session_event(&mut events).await;
    assert_eq!(state, CallState::Streaming);

    // Endpunkt-Mikrofon -> Hub
    let mut zustand = g.handle.zustand_abonnieren();
    timeout(ZEITLIMIT, zustand.wait_for(|z| *z == EndpointZustand::Streamt))
        .await
        .unwrap()
        .unwrap();
    g.mic.send((0..32).collect()).await.unwrap();
    let block = timeout(ZEITLIMIT, audio.recv()).await.unwrap().unwrap();
    assert_eq!(block.len(), 64);
    assert_eq!(&block[..4], &[0, 0, 1, 0]);

    // Hub -> Endpunkt-Lautsprecher
    assert!(session.audio_senden(Bytes::from_static(&[0x10, 0x00, 0x20, 0x00])));
    let samples = timeout(ZEITLIMIT, g.lautsprecher.recv()).await.unwrap().unwrap();
    assert_eq!(samples, vec![0x10, 0x20]);

    assert!(hub.sitzung_stoppen(&tuer).await.unwrap());
    let (_, state, reason) = session_event(&mut events).await;
    assert_eq!(state, CallState::Disconnected);
    assert!(reason.is_none());
    timeout(ZEITLIMIT, zustand.wait_for(|z| *z == EndpointZustand::Bereit))
        .await
        .unwrap()
        .unwrap();

    g.handle.beenden().await;
}

#[tokio::test]
async fn klingeln_und_annahme_am_geraet() {
    let g = geraet("tuer", false).await;
    let hub = hub_fuer(&[&g]);
    let mut events = hub.ereignisse_abonnieren();
    let tuer = g.info.device_id.clone();

    let (_session, _audio) = hub.sitzung_mit_kanal(&tuer).unwrap();
    assert_eq!(session_event(&mut events).await.1, CallState::Ringing);

    g.handle.annehmen().await.unwrap();
    assert_eq!(session_event(&mut events).await.1, CallState::Streaming);

    // Stopp am Geraet beendet die Session regulaer
    g.handle.stoppen().await.unwrap();
    let (_, state, reason) = session_event(&mut events).await;
    assert_eq!(state, CallState::Disconnected);
    assert!(reason.is_none());

    g.handle.beenden().await;
}

#[tokio::test]
async fn bridge_zwischen_zwei_geraeten() {
    let a = geraet("tuer", true).await;
    let mut b = geraet("kueche", true).await;
    let hub = hub_fuer(&[&a, &b]);
    let mut events = hub.ereignisse_abonnieren();

    let bridge = hub
        .bridge_starten(&a.info.device_id, &b.info.device_id)
        .unwrap();
    assert_eq!(bridge_event(&mut events).await.0, BridgeState::Connected);

    // Mikrofon A landet im Lautsprecher B
    let mut za = a.handle.zustand_abonnieren();
    timeout(ZEITLIMIT, za.wait_for(|z| *z == EndpointZustand::Streamt))
        .await
        .unwrap()
        .unwrap();
    a.mic.send(vec![5; 32]).await.unwrap();
    let samples = timeout(ZEITLIMIT, b.lautsprecher.recv()).await.unwrap().unwrap();
    assert_eq!(samples, vec![5i16; 32]);

    // Stopp an A baut die ganze Bridge ab
    a.handle.stoppen().await.unwrap();
    let (state, _) = bridge_event(&mut events).await;
    assert_eq!(state, BridgeState::Disconnected);
    let mut zb = b.handle.zustand_abonnieren();
    timeout(ZEITLIMIT, zb.wait_for(|z| *z == EndpointZustand::Bereit))
        .await
        .unwrap()
        .unwrap();
    assert!(hub.bridge(&bridge.id()).is_none());

    a.handle.beenden().await;
    b.handle.beenden().await;
}
