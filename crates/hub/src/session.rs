//! Hub-Session: eine TCP-Verbindung vom Hub zu einem Endpunkt
//!
//! Ein Task pro Session treibt die Zustandsmaschine (`state_machine`)
//! und fuehrt deren Aktionen aus. Ausgehende Frames laufen ueber die
//! `OutboundQueue` und einen eigenen Schreib-Task:
//!
//! ```text
//! SessionHandle --audio_senden--> OutboundQueue --Schreib-Task--> TCP
//!                                                                  |
//! AudioSenke <--AUDIO-- Session-Task <--FrameCodec-----------------+
//! ```
//!
//! Ein ungueltiger Header beendet die Session sofort (kein Resync).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use intercom_core::{CallState, DeviceId, EventBus, HubEvent, SessionId};
use intercom_protocol::frame::{Frame, FrameError, FrameFlags};
use intercom_protocol::FrameCodec;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;

use crate::config::HubConfig;
use crate::outbound::{schreiben, AudioSenke, OutboundQueue, SchreibParameter};
use crate::state_machine::{uebergang, Abbruch, Aktion, SessionEreignis, SessionZustand, TimeoutArt};

// ---------------------------------------------------------------------------
// Oeffentliche Typen
// ---------------------------------------------------------------------------

/// Beobachtbarer Zustand einer Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub zustand: SessionZustand,
    /// Grund des Endes, sobald feststehend
    pub abbruch: Option<Abbruch>,
    /// Der Session-Task ist beendet, alle Ressourcen freigegeben
    pub beendet: bool,
}

/// Momentaufnahme der Session-Zaehler
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistik {
    pub gestartet: DateTime<Utc>,
    pub frames_gesendet: u64,
    pub frames_empfangen: u64,
    pub audio_weitergeleitet: u64,
    /// AUDIO ausserhalb von Streaming (z.B. beim Klingeln)
    pub audio_verworfen: u64,
    /// Ausgehendes Audio das wegen Ueberlast verworfen wurde
    pub ausgang_verworfen: u64,
    pub ausgang_laenge: usize,
}

#[derive(Debug, Default)]
struct SessionZaehler {
    frames_empfangen: AtomicU64,
    audio_weitergeleitet: AtomicU64,
    audio_verworfen: AtomicU64,
}

#[derive(Debug)]
enum SessionBefehl {
    Stoppen,
}

/// Alles was eine Session zum Starten braucht
pub struct SessionStart {
    /// Vorab vergeben, damit die Belegung vor dem Start reserviert werden kann
    pub id: SessionId,
    pub device_id: DeviceId,
    /// `host:port` des Endpunkts
    pub adresse: String,
    /// Ziel fuer empfangenes Audio
    pub senke: Arc<dyn AudioSenke>,
    /// Ziel fuer UI-Ereignisse; `None` fuer Bridge-Beine
    pub events: Option<Arc<dyn EventBus>>,
    /// Ausgangs-Queue (fuer Bridges vorab erzeugt und ueberkreuz verdrahtet)
    pub queue: OutboundQueue,
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Handle auf eine laufende Session
///
/// Clone teilt die Session. Das Droppen aller Handles stoppt die
/// Session regulaer.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: SessionId,
    device_id: DeviceId,
    gestartet: DateTime<Utc>,
    queue: OutboundQueue,
    befehle: mpsc::Sender<SessionBefehl>,
    status: watch::Receiver<SessionStatus>,
    zaehler: Arc<SessionZaehler>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("zustand", &self.zustand())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Reiht PCM Richtung Endpunkt ein
    ///
    /// Gibt `false` zurueck wenn die Session nicht streamt.
    pub fn audio_senden(&self, pcm: Bytes) -> bool {
        self.inner.queue.audio_einreihen(pcm)
    }

    /// Fordert einen regulaeren Stopp an (STOP senden, Queue leeren, schliessen)
    pub async fn stoppen(&self) {
        if self.inner.befehle.send(SessionBefehl::Stoppen).await.is_err() {
            tracing::debug!(device = %self.inner.device_id, "Session bereits beendet");
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn zustand(&self) -> SessionZustand {
        self.inner.status.borrow().zustand
    }

    pub fn status_abonnieren(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.clone()
    }

    pub fn ist_beendet(&self) -> bool {
        self.inner.status.borrow().beendet
    }

    /// Wartet bis der Session-Task beendet ist
    pub async fn beendet(&self) -> SessionStatus {
        let mut rx = self.inner.status.clone();
        if rx.wait_for(|s| s.beendet).await.is_err() {
            tracing::debug!(device = %self.inner.device_id, "Session-Task ohne Abschluss beendet");
        }
        let mut s = rx.borrow().clone();
        s.beendet = true;
        s
    }

    pub fn statistik(&self) -> SessionStatistik {
        let z = &self.inner.zaehler;
        SessionStatistik {
            gestartet: self.inner.gestartet,
            frames_gesendet: self.inner.queue.gesendet(),
            frames_empfangen: z.frames_empfangen.load(Ordering::Relaxed),
            audio_weitergeleitet: z.audio_weitergeleitet.load(Ordering::Relaxed),
            audio_verworfen: z.audio_verworfen.load(Ordering::Relaxed),
            ausgang_verworfen: self.inner.queue.verworfen(),
            ausgang_laenge: self.inner.queue.laenge(),
        }
    }
}

/// Startet den Session-Task und gibt sofort ein Handle zurueck
///
/// Der Verbindungsaufbau laeuft im Task; Fehler erscheinen im Status.
pub fn session_starten(start: SessionStart, config: Arc<HubConfig>) -> SessionHandle {
    let id = start.id;
    let (befehle_tx, befehle_rx) = mpsc::channel(4);
    let (status_tx, status_rx) = watch::channel(SessionStatus {
        zustand: SessionZustand::Idle,
        abbruch: None,
        beendet: false,
    });
    let zaehler = Arc::new(SessionZaehler::default());

    let handle = SessionHandle {
        inner: Arc::new(HandleInner {
            id,
            device_id: start.device_id.clone(),
            gestartet: Utc::now(),
            queue: start.queue.clone(),
            befehle: befehle_tx,
            status: status_rx,
            zaehler: Arc::clone(&zaehler),
        }),
    };

    let task = SessionTask {
        id,
        device_id: start.device_id,
        adresse: start.adresse,
        senke: start.senke,
        events: start.events,
        queue: start.queue,
        config,
        status_tx,
        zaehler,
        zustand: SessionZustand::Idle,
        abbruch: None,
        start_ack_frist: None,
        drain_frist: None,
        schreiber: None,
    };
    tokio::spawn(task.ausfuehren(befehle_rx));
    handle
}

// ---------------------------------------------------------------------------
// Session-Task
// ---------------------------------------------------------------------------

struct SessionTask {
    id: SessionId,
    device_id: DeviceId,
    adresse: String,
    senke: Arc<dyn AudioSenke>,
    events: Option<Arc<dyn EventBus>>,
    queue: OutboundQueue,
    config: Arc<HubConfig>,
    status_tx: watch::Sender<SessionStatus>,
    zaehler: Arc<SessionZaehler>,

    zustand: SessionZustand,
    abbruch: Option<Abbruch>,
    start_ack_frist: Option<Instant>,
    drain_frist: Option<Instant>,
    schreiber: Option<JoinHandle<()>>,
}

impl SessionTask {
    async fn ausfuehren(mut self, mut befehle_rx: mpsc::Receiver<SessionBefehl>) {
        tracing::info!(session = %self.id, device = %self.device_id, adresse = %self.adresse, "Session startet");

        self.ereignis(SessionEreignis::Start, None);

        // Stopp-Befehle werden schon waehrend des Verbindungsaufbaus bedient
        let adresse = self.adresse.clone();
        let verbindung = tokio::select! {
            ergebnis = timeout(self.config.verbindungs_timeout(), TcpStream::connect(&adresse)) => ergebnis,
            _ = befehle_rx.recv() => {
                tracing::info!(device = %self.device_id, "Stopp waehrend des Verbindungsaufbaus");
                self.ereignis(SessionEreignis::AufbauAbgebrochen, None);
                return self.abschliessen();
            }
        };
        let stream = match verbindung {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::warn!(device = %self.device_id, fehler = %e, "Verbindung fehlgeschlagen");
                self.ereignis(SessionEreignis::IoFehler(e.to_string()), None);
                return self.abschliessen();
            }
            Err(_) => {
                tracing::warn!(device = %self.device_id, "Zeitlimit beim Verbindungsaufbau");
                self.ereignis(SessionEreignis::Timeout(TimeoutArt::Verbindungsaufbau), None);
                return self.abschliessen();
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(fehler = %e, "TCP_NODELAY nicht gesetzt");
        }

        let (lesen, schreiben_halb) = stream.into_split();
        let mut frames = FramedRead::new(lesen, FrameCodec::new());

        let (fertig_tx, mut fertig_rx) = mpsc::channel(1);
        let queue = self.queue.clone();
        let param = SchreibParameter {
            batch: self.config.drain_batch,
            timeout: self.config.schreib_timeout(),
            schliess_verzoegerung: self.config.schliess_verzoegerung(),
        };
        self.schreiber = Some(tokio::spawn(async move {
            let ergebnis = schreiben(queue, schreiben_halb, param).await;
            let _ = fertig_tx.send(ergebnis).await;
        }));

        self.ereignis(SessionEreignis::Verbunden, None);

        let mut letzte_aktivitaet = Instant::now();
        let ping_intervall = self.config.ping_intervall();
        let mut ping_takt = interval_at(Instant::now() + ping_intervall, ping_intervall);
        ping_takt.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut befehle_offen = true;

        while !self.zustand.ist_beendet() {
            let frist = self.frist(letzte_aktivitaet);
            let frist_zeit = frist.map(|(t, _)| t).unwrap_or_else(Instant::now);
            let ping_aktiv = self.zustand == SessionZustand::Ringing;

            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(f)) => {
                        letzte_aktivitaet = Instant::now();
                        self.zaehler.frames_empfangen.fetch_add(1, Ordering::Relaxed);
                        let ereignis = SessionEreignis::FrameEmpfangen {
                            typ: f.typ,
                            flags: f.flags,
                            fehlercode: f.fehlercode(),
                        };
                        self.ereignis(ereignis, Some(f.payload));
                    }
                    Some(Err(FrameError::Io(e))) => {
                        self.ereignis(SessionEreignis::Getrennt(e.to_string()), None);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(device = %self.device_id, fehler = %e, "Ungueltiger Frame - Verbindung wird geschlossen");
                        self.ereignis(SessionEreignis::Desync(e.to_string()), None);
                    }
                    None => {
                        self.ereignis(SessionEreignis::Getrennt("Verbindung vom Endpunkt geschlossen".into()), None);
                    }
                },

                befehl = befehle_rx.recv(), if befehle_offen => {
                    if befehl.is_none() {
                        // Alle Handles gedroppt
                        befehle_offen = false;
                    }
                    self.ereignis(SessionEreignis::LocalStop, None);
                }

                Some(ergebnis) = fertig_rx.recv() => {
                    let ereignis = match ergebnis {
                        _ if self.zustand == SessionZustand::Stopping => SessionEreignis::Gedraint,
                        Ok(()) => SessionEreignis::IoFehler("Schreib-Task unerwartet beendet".into()),
                        Err(e) => {
                            tracing::warn!(device = %self.device_id, fehler = %e, "Schreiben fehlgeschlagen");
                            SessionEreignis::IoFehler(e.to_string())
                        }
                    };
                    self.ereignis(ereignis, None);
                }

                _ = ping_takt.tick(), if ping_aktiv => {
                    self.queue.steuer_einreihen(Frame::ping());
                }

                _ = sleep_until(frist_zeit), if frist.is_some() => {
                    if let Some((_, art)) = frist {
                        tracing::debug!(device = %self.device_id, ?art, "Frist abgelaufen");
                        self.ereignis(SessionEreignis::Timeout(art), None);
                    }
                }
            }
        }

        self.abschliessen();
    }

    /// Aktive Frist fuer den aktuellen Zustand
    fn frist(&self, letzte_aktivitaet: Instant) -> Option<(Instant, TimeoutArt)> {
        match self.zustand {
            SessionZustand::Connecting => self
                .start_ack_frist
                .map(|t| (t, TimeoutArt::StartAck)),
            SessionZustand::Ringing => Some((
                letzte_aktivitaet + self.config.keepalive_timeout(),
                TimeoutArt::Keepalive,
            )),
            SessionZustand::Stopping => self.drain_frist.map(|t| (t, TimeoutArt::Drain)),
            _ => None,
        }
    }

    /// Fuehrt einen Uebergang aus und veroeffentlicht den neuen Status
    fn ereignis(&mut self, ereignis: SessionEreignis, payload: Option<Bytes>) {
        let vorher = self.zustand;
        let u = uebergang(vorher, &ereignis);
        self.zustand = u.zustand;

        for aktion in u.aktionen {
            self.aktion(aktion, payload.as_ref());
        }

        if vorher != self.zustand {
            tracing::debug!(
                device = %self.device_id,
                von = ?vorher,
                nach = ?self.zustand,
                "Zustandswechsel"
            );
        }
        self.status_tx.send_replace(SessionStatus {
            zustand: self.zustand,
            abbruch: self.abbruch.clone(),
            beendet: false,
        });
    }

    fn aktion(&mut self, aktion: Aktion, payload: Option<&Bytes>) {
        match aktion {
            // Verbindungsaufbau erfolgt in `ausfuehren`
            Aktion::Verbinden => {}
            Aktion::StartSenden => {
                self.queue.steuer_einreihen(Frame::start(FrameFlags::NONE));
                self.start_ack_frist = Some(Instant::now() + self.config.start_ack_timeout());
            }
            Aktion::StopSenden => self.queue.steuer_einreihen(Frame::stop()),
            Aktion::PongSenden => self.queue.steuer_einreihen(Frame::pong()),
            Aktion::AudioWeiterleiten => {
                if let Some(pcm) = payload {
                    self.zaehler.audio_weitergeleitet.fetch_add(1, Ordering::Relaxed);
                    self.senke.audio(pcm.clone());
                }
            }
            Aktion::AudioVerwerfen => {
                self.zaehler.audio_verworfen.fetch_add(1, Ordering::Relaxed);
            }
            Aktion::AudioFreigeben(erlaubt) => self.queue.audio_freigeben(erlaubt),
            Aktion::Melden(state) => self.melden(state),
            Aktion::Drainen => {
                self.queue.schliessen();
                self.drain_frist = Some(Instant::now() + self.config.drain_timeout());
            }
            Aktion::Schliessen => {
                self.queue.schliessen();
                if let Some(schreiber) = self.schreiber.take() {
                    schreiber.abort();
                }
            }
            Aktion::Beenden(abbruch) => {
                if self.abbruch.is_none() {
                    self.abbruch = Some(abbruch);
                }
            }
        }
    }

    fn melden(&self, state: CallState) {
        let Some(events) = &self.events else {
            return;
        };
        let reason = match state {
            CallState::Disconnected => self
                .abbruch
                .as_ref()
                .and_then(|a| a.grund(&self.device_id)),
            _ => None,
        };
        events.senden(HubEvent::session(self.device_id.clone(), state, reason));
    }

    fn abschliessen(mut self) {
        if let Some(schreiber) = self.schreiber.take() {
            schreiber.abort();
        }
        match &self.abbruch {
            Some(a) if a.ist_fehler() => {
                tracing::warn!(session = %self.id, device = %self.device_id, grund = ?a, "Session mit Fehler beendet");
            }
            _ => {
                tracing::info!(session = %self.id, device = %self.device_id, "Session beendet");
            }
        }
        self.status_tx.send_replace(SessionStatus {
            zustand: self.zustand,
            abbruch: self.abbruch.clone(),
            beendet: true,
        });
    }
}

