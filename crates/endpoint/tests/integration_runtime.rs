//! Integration-Tests fuer die Endpunkt-Laufzeit (echtes TCP auf 127.0.0.1)

use intercom_endpoint::{EndpointConfig, EndpointHandle, EndpointIo, EndpointRuntime, EndpointZustand};
use intercom_protocol::frame::{ErrorCode, Frame, FrameFlags, FrameType};
use intercom_protocol::wire::{read_frame, write_frame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

struct Testgeraet {
    handle: EndpointHandle,
    mic: mpsc::Sender<Vec<i32>>,
    lautsprecher: mpsc::Receiver<Vec<i16>>,
}

async fn geraet(auto_answer: bool) -> Testgeraet {
    let config = EndpointConfig {
        bind_adresse: "127.0.0.1:0".into(),
        auto_answer,
        chunk_bytes: 64,
        keepalive_timeout_ms: 2_000,
        schliess_verzoegerung_ms: 10,
        ..Default::default()
    };
    let (mic, mic_rx) = mpsc::channel(64);
    let (lautsprecher_tx, lautsprecher) = mpsc::channel(64);
    let handle = EndpointRuntime::binden(config)
        .await
        .expect("Endpunkt konnte nicht binden")
        .starten(EndpointIo {
            mikrofon: mic_rx,
            lautsprecher: lautsprecher_tx,
        })
        .expect("Endpunkt konnte nicht starten");
    Testgeraet {
        handle,
        mic,
        lautsprecher,
    }
}

async fn lesen(stream: &mut TcpStream) -> Frame {
    timeout(Duration::from_secs(2), read_frame(stream))
        .await
        .expect("Zeitlimit beim Lesen")
        .expect("Frame erwartet")
}

async fn warten_auf(rx: &mut watch::Receiver<EndpointZustand>, ziel: EndpointZustand) {
    timeout(Duration::from_secs(2), rx.wait_for(|z| *z == ziel))
        .await
        .expect("Zustand nicht erreicht")
        .expect("Endpunkt beendet");
}

#[tokio::test]
async fn auto_answer_streamt_mikrofon() {
    let mut g = geraet(true).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();

    write_frame(&mut hub, &Frame::start(FrameFlags::NONE)).await.unwrap();
    let ack = lesen(&mut hub).await;
    assert_eq!(ack.typ, FrameType::Start);
    assert_eq!(ack.flags, FrameFlags::NONE);

    let mut zustand = g.handle.zustand_abonnieren();
    warten_auf(&mut zustand, EndpointZustand::Streamt).await;

    // 32 Samples = 64 Bytes = genau ein Block
    g.mic.send((0..32).collect()).await.unwrap();
    let audio = lesen(&mut hub).await;
    assert_eq!(audio.typ, FrameType::Audio);
    assert_eq!(audio.payload.len(), 64);
    assert_eq!(&audio.payload[..4], &[0, 0, 1, 0]);

    // Hub-Audio landet im Lautsprecher
    write_frame(&mut hub, &Frame::audio(vec![0x10, 0x00, 0x20, 0x00])).await.unwrap();
    let block = timeout(Duration::from_secs(2), g.lautsprecher.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block, vec![0x10, 0x20]);

    g.handle.beenden().await;
}

#[tokio::test]
async fn ping_wird_mit_pong_beantwortet() {
    let g = geraet(true).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();

    write_frame(&mut hub, &Frame::ping()).await.unwrap();
    assert_eq!(lesen(&mut hub).await.typ, FrameType::Pong);

    g.handle.beenden().await;
}

#[tokio::test]
async fn klingeln_bis_zur_annahme() {
    let g = geraet(false).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();

    write_frame(&mut hub, &Frame::start(FrameFlags::NONE)).await.unwrap();
    let ack = lesen(&mut hub).await;
    assert_eq!(ack.typ, FrameType::Start);
    assert_eq!(ack.flags, FrameFlags::RINGING);

    let mut zustand = g.handle.zustand_abonnieren();
    warten_auf(&mut zustand, EndpointZustand::Klingelt).await;

    // Mikrofon wird waehrend des Klingelns nicht gesendet
    g.mic.send(vec![7; 32]).await.unwrap();
    assert!(timeout(Duration::from_millis(150), read_frame(&mut hub)).await.is_err());

    g.handle.annehmen().await.unwrap();
    let angenommen = lesen(&mut hub).await;
    assert_eq!(angenommen.typ, FrameType::Start);
    assert_eq!(angenommen.flags, FrameFlags::NONE);
    warten_auf(&mut zustand, EndpointZustand::Streamt).await;

    g.mic.send(vec![7; 32]).await.unwrap();
    assert_eq!(lesen(&mut hub).await.typ, FrameType::Audio);

    g.handle.beenden().await;
}

#[tokio::test]
async fn zweite_verbindung_bekommt_busy() {
    let g = geraet(true).await;
    let mut erster = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    write_frame(&mut erster, &Frame::ping()).await.unwrap();
    assert_eq!(lesen(&mut erster).await.typ, FrameType::Pong);

    let mut zweiter = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    let antwort = lesen(&mut zweiter).await;
    assert_eq!(antwort.fehlercode(), Some(ErrorCode::BUSY));

    g.handle.beenden().await;
}

#[tokio::test]
async fn stop_schliesst_verbindung() {
    let g = geraet(true).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    write_frame(&mut hub, &Frame::start(FrameFlags::NONE)).await.unwrap();
    lesen(&mut hub).await;

    write_frame(&mut hub, &Frame::stop()).await.unwrap();

    // Verbindung wird nach der Wartezeit geschlossen
    let r = timeout(Duration::from_secs(2), read_frame(&mut hub)).await.unwrap();
    assert!(r.is_err());

    let mut zustand = g.handle.zustand_abonnieren();
    warten_auf(&mut zustand, EndpointZustand::Bereit).await;

    // Danach ist das Geraet wieder frei
    let mut neu = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    write_frame(&mut neu, &Frame::ping()).await.unwrap();
    assert_eq!(lesen(&mut neu).await.typ, FrameType::Pong);

    g.handle.beenden().await;
}

#[tokio::test]
async fn lokaler_stopp_sendet_stop() {
    let g = geraet(true).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    write_frame(&mut hub, &Frame::start(FrameFlags::NONE)).await.unwrap();
    lesen(&mut hub).await;
    let mut zustand = g.handle.zustand_abonnieren();
    warten_auf(&mut zustand, EndpointZustand::Streamt).await;

    g.handle.stoppen().await.unwrap();
    assert_eq!(lesen(&mut hub).await.typ, FrameType::Stop);

    g.handle.beenden().await;
}

#[tokio::test]
async fn unbekannter_frame_typ_trennt() {
    let g = geraet(true).await;
    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut hub, &[0x7F, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    let r = timeout(Duration::from_secs(2), read_frame(&mut hub)).await.unwrap();
    assert!(r.is_err(), "Verbindung muss geschlossen werden");

    g.handle.beenden().await;
}

#[tokio::test]
async fn veralteter_stopp_beendet_naechsten_ruf_nicht() {
    let g = geraet(true).await;

    // Ohne Verbindung abgewiesen statt fuer den naechsten Ruf gemerkt
    assert_eq!(g.handle.zustand(), EndpointZustand::Bereit);
    assert!(g.handle.stoppen().await.is_err());
    assert!(g.handle.annehmen().await.is_err());

    let mut hub = TcpStream::connect(g.handle.lokale_adresse()).await.unwrap();
    write_frame(&mut hub, &Frame::start(FrameFlags::NONE)).await.unwrap();
    let ack = lesen(&mut hub).await;
    assert_eq!(ack.typ, FrameType::Start);
    assert_eq!(ack.flags, FrameFlags::NONE);

    let mut zustand = g.handle.zustand_abonnieren();
    warten_auf(&mut zustand, EndpointZustand::Streamt).await;

    // Kein STOP hinterher
    let danach = timeout(Duration::from_millis(200), read_frame(&mut hub)).await;
    assert!(danach.is_err(), "unerwarteter Frame: {danach:?}");
    assert_eq!(g.handle.zustand(), EndpointZustand::Streamt);
}
