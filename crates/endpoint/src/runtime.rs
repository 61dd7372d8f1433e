//! Endpunkt-Laufzeit
//!
//! Ein Geraet bedient genau eine Verbindung. Pro Verbindung laufen zwei
//! Einheiten, die sich den `SendBuffer` teilen:
//!
//! ```text
//! Mikrofon --mpsc--> TX-Einheit --SendBuffer(Mutex)--> TCP
//!                                      ^
//! TCP --FrameCodec--> RX-Einheit ------+ (PONG, START, STOP)
//!                          |
//!                          +--mpsc--> Lautsprecher
//! ```
//!
//! ## Zustaende
//! ```text
//! Bereit -> Verbunden -> (Klingelt -> annehmen ->) Streamt -> Stoppt -> Bereit
//! ```
//!
//! Ein zweiter Verbindungsversuch waehrend einer aktiven Verbindung
//! bekommt `ERROR(BUSY)` und wird geschlossen.

use futures_util::StreamExt;
use intercom_core::{IntercomError, Result};
use intercom_protocol::frame::{ErrorCode, Frame, FrameFlags, FrameType};
use intercom_protocol::{pcm, wire, FrameCodec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::codec::FramedRead;

use crate::audio::{Chunker, MicKonverter};
use crate::config::EndpointConfig;
use crate::send_buffer::{senden, GeteilterSendBuffer, SendBuffer};

/// Maximale Wartezeit auf das Ende der TX-Einheit beim Abbau
const TX_ENDE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Oeffentliche Typen
// ---------------------------------------------------------------------------

/// Zustand des Endpunkts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointZustand {
    /// Keine Verbindung, Listener wartet
    Bereit,
    /// Hub verbunden, noch kein START
    Verbunden,
    /// START empfangen, Annahme steht aus
    Klingelt,
    /// Audio fliesst in beide Richtungen
    Streamt,
    /// STOP empfangen oder gesendet, Verbindung wird geschlossen
    Stoppt,
}

/// Befehle der lokalen Bedienung (Taster am Geraet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LokalerBefehl {
    /// Klingelnden Ruf annehmen
    Annehmen,
    /// Laufende Session beenden
    Stoppen,
}

/// Audio-Anschluesse des Geraets
pub struct EndpointIo {
    /// Rohsamples vom Mikrofon (Breite gemaess `mic_bits`)
    pub mikrofon: mpsc::Receiver<Vec<i32>>,
    /// 16-Bit-PCM zum Lautsprecher
    pub lautsprecher: mpsc::Sender<Vec<i16>>,
}

/// Zaehler des Endpunkts
#[derive(Debug, Default)]
pub struct EndpointZaehler {
    pub audio_gesendet: AtomicU64,
    pub audio_empfangen: AtomicU64,
    /// Lautsprecher-Queue voll
    pub audio_verworfen: AtomicU64,
    pub verbindungen: AtomicU64,
    pub abgewiesen: AtomicU64,
}

// ---------------------------------------------------------------------------
// EndpointHandle
// ---------------------------------------------------------------------------

/// Steuerung eines laufenden Endpunkts
pub struct EndpointHandle {
    befehl_tx: mpsc::Sender<LokalerBefehl>,
    zustand_rx: watch::Receiver<EndpointZustand>,
    shutdown_tx: watch::Sender<bool>,
    lokale_adresse: SocketAddr,
    zaehler: Arc<EndpointZaehler>,
    task: JoinHandle<()>,
}

impl EndpointHandle {
    /// Nimmt einen klingelnden Ruf an
    pub async fn annehmen(&self) -> Result<()> {
        self.befehl(LokalerBefehl::Annehmen).await
    }

    /// Beendet die laufende Session (STOP an den Hub)
    pub async fn stoppen(&self) -> Result<()> {
        self.befehl(LokalerBefehl::Stoppen).await
    }

    /// Ohne Verbindung gibt es keinen Ruf, auf den sich der Befehl beziehen koennte
    async fn befehl(&self, befehl: LokalerBefehl) -> Result<()> {
        if self.zustand() == EndpointZustand::Bereit {
            return Err(IntercomError::ungueltiger_zustand("Kein aktiver Ruf"));
        }
        self.befehl_tx
            .send(befehl)
            .await
            .map_err(|_| IntercomError::ungueltiger_zustand("Endpunkt beendet"))
    }

    pub fn zustand(&self) -> EndpointZustand {
        *self.zustand_rx.borrow()
    }

    pub fn zustand_abonnieren(&self) -> watch::Receiver<EndpointZustand> {
        self.zustand_rx.clone()
    }

    pub fn lokale_adresse(&self) -> SocketAddr {
        self.lokale_adresse
    }

    pub fn zaehler(&self) -> &EndpointZaehler {
        &self.zaehler
    }

    /// Faehrt den Endpunkt herunter und wartet auf das Ende aller Tasks
    pub async fn beenden(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// EndpointRuntime
// ---------------------------------------------------------------------------

/// Gemeinsamer Zustand aller Verbindungs-Tasks
struct Kontext {
    config: EndpointConfig,
    mikrofon: Mutex<mpsc::Receiver<Vec<i32>>>,
    befehle: Mutex<mpsc::Receiver<LokalerBefehl>>,
    lautsprecher: mpsc::Sender<Vec<i16>>,
    zustand_tx: watch::Sender<EndpointZustand>,
    zaehler: Arc<EndpointZaehler>,
}

impl Kontext {
    fn zustand_setzen(&self, neu: EndpointZustand) {
        let alt = self.zustand_tx.send_replace(neu);
        if alt != neu {
            tracing::debug!(von = ?alt, nach = ?neu, "Endpunkt-Zustand");
        }
    }
}

/// Gebundener, noch nicht laufender Endpunkt
pub struct EndpointRuntime {
    config: EndpointConfig,
    listener: TcpListener,
}

impl EndpointRuntime {
    /// Bindet den TCP-Listener
    pub async fn binden(config: EndpointConfig) -> Result<Self> {
        config
            .validieren()
            .map_err(|e| IntercomError::Config(e.to_string()))?;
        let listener = TcpListener::bind(&config.bind_adresse).await?;
        tracing::info!(
            name = %config.name,
            adresse = %listener.local_addr()?,
            auto_answer = config.auto_answer,
            "Endpunkt lauscht"
        );
        Ok(Self { config, listener })
    }

    pub fn lokale_adresse(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Startet die Accept-Schleife im Hintergrund
    pub fn starten(self, io: EndpointIo) -> Result<EndpointHandle> {
        let lokale_adresse = self.listener.local_addr()?;
        let (befehl_tx, befehl_rx) = mpsc::channel(8);
        let (zustand_tx, zustand_rx) = watch::channel(EndpointZustand::Bereit);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let zaehler = Arc::new(EndpointZaehler::default());

        let ctx = Arc::new(Kontext {
            config: self.config,
            mikrofon: Mutex::new(io.mikrofon),
            befehle: Mutex::new(befehl_rx),
            lautsprecher: io.lautsprecher,
            zustand_tx,
            zaehler: zaehler.clone(),
        });

        let task = tokio::spawn(accept_schleife(self.listener, ctx, shutdown_rx));

        Ok(EndpointHandle {
            befehl_tx,
            zustand_rx,
            shutdown_tx,
            lokale_adresse,
            zaehler,
            task,
        })
    }
}

async fn accept_schleife(
    listener: TcpListener,
    ctx: Arc<Kontext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut aktiv: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            ergebnis = listener.accept() => {
                let (stream, peer) = match ergebnis {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(fehler = %e, "Accept fehlgeschlagen");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(fehler = %e, "TCP_NODELAY nicht gesetzt");
                }

                if aktiv.as_ref().is_some_and(|t| !t.is_finished()) {
                    tracing::warn!(peer = %peer, "Bereits verbunden, weise ab");
                    ctx.zaehler.abgewiesen.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(abweisen(stream));
                    continue;
                }

                tracing::info!(peer = %peer, "Hub verbunden");
                ctx.zaehler.verbindungen.fetch_add(1, Ordering::Relaxed);
                aktiv = Some(tokio::spawn(verbindung_bearbeiten(
                    stream,
                    peer,
                    ctx.clone(),
                    shutdown_rx.clone(),
                )));
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Endpunkt wird beendet");
                break;
            }
        }
    }

    if let Some(t) = aktiv {
        let _ = t.await;
    }
}

async fn abweisen(mut stream: TcpStream) {
    if let Err(e) = wire::write_frame(&mut stream, &Frame::error(ErrorCode::BUSY)).await {
        tracing::debug!(fehler = %e, "BUSY konnte nicht gesendet werden");
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
}

// ---------------------------------------------------------------------------
// Verbindung
// ---------------------------------------------------------------------------

/// Warum die RX-Schleife endet
#[derive(Debug)]
enum Ende {
    /// STOP vom Hub
    RemoteStop,
    /// Lokaler Stopp, STOP muss noch gesendet werden
    LokalerStop,
    /// Endpunkt wird heruntergefahren
    Shutdown,
    Fehler(IntercomError),
}

async fn verbindung_bearbeiten(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<Kontext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (lese, schreib) = stream.into_split();
    let buffer = SendBuffer::neu(
        schreib,
        ctx.config.schreib_timeout(),
        ctx.config.max_schreib_versuche,
    )
    .geteilt();
    let mut frames = FramedRead::new(lese, FrameCodec::new());

    let (streaming_tx, streaming_rx) = watch::channel(false);
    let (tx_fehler_tx, mut tx_fehler_rx) = mpsc::channel::<IntercomError>(1);
    let tx_task = tokio::spawn(tx_einheit(
        ctx.clone(),
        buffer.clone(),
        streaming_rx,
        tx_fehler_tx,
    ));

    let mut befehle = ctx.befehle.lock().await;
    // Befehle aus einem frueheren Ruf gelten nicht fuer diesen
    while let Ok(alt) = befehle.try_recv() {
        tracing::debug!(befehl = ?alt, "Veralteter Befehl verworfen");
    }
    ctx.zustand_setzen(EndpointZustand::Verbunden);
    let mut letzter_empfang = Instant::now();

    let ende = loop {
        let streamt = *ctx.zustand_tx.borrow() == EndpointZustand::Streamt;
        let frist = letzter_empfang + ctx.config.keepalive_timeout();

        tokio::select! {
            frame = frames.next() => {
                let f = match frame {
                    Some(Ok(f)) => f,
                    Some(Err(e)) => {
                        // Kein Resync: Verbindung schliessen
                        break Ende::Fehler(e.into());
                    }
                    None => {
                        break Ende::Fehler(IntercomError::PeerDisconnected(
                            "Hub hat die Verbindung geschlossen".into(),
                        ));
                    }
                };
                letzter_empfang = Instant::now();
                match frame_verarbeiten(&ctx, &buffer, &streaming_tx, f).await {
                    Ok(None) => {}
                    Ok(Some(ende)) => break ende,
                    Err(e) => break Ende::Fehler(e),
                }
            }
            befehl = befehle.recv() => match befehl {
                Some(LokalerBefehl::Annehmen) => {
                    if *ctx.zustand_tx.borrow() == EndpointZustand::Klingelt {
                        if let Err(e) = senden(&buffer, &Frame::start(FrameFlags::NONE)).await {
                            break Ende::Fehler(e);
                        }
                        let _ = streaming_tx.send(true);
                        ctx.zustand_setzen(EndpointZustand::Streamt);
                        tracing::info!(peer = %peer, "Ruf angenommen");
                    } else {
                        tracing::debug!("Annehmen ignoriert, es klingelt nicht");
                    }
                }
                Some(LokalerBefehl::Stoppen) => break Ende::LokalerStop,
                None => break Ende::Shutdown,
            },
            Some(fehler) = tx_fehler_rx.recv() => {
                break Ende::Fehler(fehler);
            }
            _ = tokio::time::sleep_until(frist), if !streamt => {
                break Ende::Fehler(IntercomError::PeerDisconnected(
                    "Keepalive-Zeitlimit ueberschritten".into(),
                ));
            }
            _ = shutdown_rx.changed() => break Ende::Shutdown,
        }
    };
    drop(befehle);

    match &ende {
        Ende::Fehler(e) => tracing::warn!(peer = %peer, fehler = %e, "Verbindung wird abgebaut"),
        anders => tracing::info!(peer = %peer, grund = ?anders, "Session beendet"),
    }

    let stop_senden = matches!(ende, Ende::LokalerStop | Ende::Shutdown);
    abbauen(&ctx, buffer, streaming_tx, tx_task, stop_senden).await;
}

/// Verarbeitet einen empfangenen Frame; `Some` beendet die Verbindung
async fn frame_verarbeiten(
    ctx: &Kontext,
    buffer: &GeteilterSendBuffer<OwnedWriteHalf>,
    streaming_tx: &watch::Sender<bool>,
    f: Frame,
) -> Result<Option<Ende>> {
    let zustand = *ctx.zustand_tx.borrow();
    match f.typ {
        FrameType::Start => match zustand {
            EndpointZustand::Verbunden if ctx.config.auto_answer => {
                senden(buffer, &Frame::start(FrameFlags::NONE)).await?;
                let _ = streaming_tx.send(true);
                ctx.zustand_setzen(EndpointZustand::Streamt);
                tracing::info!("START angenommen, streame");
            }
            EndpointZustand::Verbunden => {
                senden(buffer, &Frame::start(FrameFlags::RINGING)).await?;
                ctx.zustand_setzen(EndpointZustand::Klingelt);
                tracing::info!("START empfangen, klingelt");
            }
            _ => tracing::debug!(zustand = ?zustand, "Doppeltes START ignoriert"),
        },
        FrameType::Audio => {
            if zustand != EndpointZustand::Streamt {
                tracing::trace!(zustand = ?zustand, "AUDIO ausserhalb des Streamings verworfen");
                return Ok(None);
            }
            ctx.zaehler.audio_empfangen.fetch_add(1, Ordering::Relaxed);
            let samples = pcm::bytes_zu_samples(&f.payload);
            if ctx.lautsprecher.try_send(samples).is_err() {
                let n = ctx.zaehler.audio_verworfen.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(verworfen = n, "Lautsprecher-Queue voll, Block verworfen");
            }
        }
        FrameType::Ping => senden(buffer, &Frame::pong()).await?,
        FrameType::Pong => {}
        FrameType::Stop => return Ok(Some(Ende::RemoteStop)),
        FrameType::Error => {
            let code = f.fehlercode().unwrap_or(ErrorCode::INTERNAL);
            return Err(IntercomError::RemoteError { code });
        }
    }
    Ok(None)
}

/// TX-Einheit: Mikrofon -> AUDIO-Frames, nur waehrend gestreamt wird
async fn tx_einheit(
    ctx: Arc<Kontext>,
    buffer: GeteilterSendBuffer<OwnedWriteHalf>,
    streaming_rx: watch::Receiver<bool>,
    fehler_tx: mpsc::Sender<IntercomError>,
) {
    if let Err(e) = tx_schleife(&ctx, &buffer, streaming_rx).await {
        let _ = fehler_tx.send(e).await;
    }
}

async fn tx_schleife(
    ctx: &Kontext,
    buffer: &GeteilterSendBuffer<OwnedWriteHalf>,
    mut streaming_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut mikrofon = ctx.mikrofon.lock().await;
    let mut konverter = MicKonverter::neu(ctx.config.mic_bits, ctx.config.dc_offset_removal);
    let mut chunker = Chunker::neu(ctx.config.chunk_bytes);

    loop {
        tokio::select! {
            biased;
            geaendert = streaming_rx.changed() => {
                if geaendert.is_err() {
                    return Ok(());
                }
            }
            roh = mikrofon.recv() => {
                let Some(roh) = roh else {
                    tracing::info!("Mikrofon-Quelle beendet");
                    return Ok(());
                };
                if !*streaming_rx.borrow() {
                    chunker.leeren();
                    continue;
                }
                chunker.samples_anhaengen(&konverter.konvertieren(&roh));
                while let Some(block) = chunker.naechster() {
                    // Ein begonnener Frame wird immer zu Ende geschrieben
                    senden(buffer, &Frame::audio(block)).await?;
                    ctx.zaehler.audio_gesendet.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Beendet TX, sendet ggf. STOP und schliesst nach der Wartezeit
async fn abbauen(
    ctx: &Kontext,
    buffer: GeteilterSendBuffer<OwnedWriteHalf>,
    streaming_tx: watch::Sender<bool>,
    tx_task: JoinHandle<()>,
    stop_senden: bool,
) {
    ctx.zustand_setzen(EndpointZustand::Stoppt);

    // Sender weg -> TX beendet sich nach einem eventuell laufenden Frame
    drop(streaming_tx);
    let mut tx_task = tx_task;
    if tokio::time::timeout(TX_ENDE_TIMEOUT, &mut tx_task).await.is_err() {
        tracing::warn!("TX-Einheit beendet sich nicht rechtzeitig");
        tx_task.abort();
    }

    let mut guard = buffer.lock().await;
    if stop_senden {
        if let Err(e) = guard.frame_schreiben(&Frame::stop()).await {
            tracing::debug!(fehler = %e, "STOP konnte nicht gesendet werden");
        }
    }
    tokio::time::sleep(ctx.config.schliess_verzoegerung()).await;
    if let Err(e) = guard.schliessen().await {
        tracing::debug!(fehler = %e, "Schliessen fehlgeschlagen");
    }
    drop(guard);

    ctx.zustand_setzen(EndpointZustand::Bereit);
}
