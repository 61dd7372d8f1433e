//! Ausgangs-Queue einer Hub-Session mit Ueberlastschutz
//!
//! Audio und Steuer-Frames werden in eine gemeinsame FIFO-Queue
//! eingereiht. Der Schreib-Task entnimmt jeweils `drain_batch` Frames,
//! schreibt sie und wartet dann auf Schreibbarkeit (Flush). Solange der
//! Socket nicht schreibbar ist waechst die Queue; ueber `max_audio`
//! wird das aelteste Audio verworfen. Steuer-Frames werden nie verworfen.

use bytes::Bytes;
use futures_util::SinkExt;
use intercom_core::{IntercomError, Result};
use intercom_protocol::frame::{Frame, FrameType};
use intercom_protocol::wire::FrameCodec;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::FramedWrite;

// ---------------------------------------------------------------------------
// AudioSenke
// ---------------------------------------------------------------------------

/// Ziel fuer empfangenes Endpunkt-Audio
///
/// Darf nie blockieren: die Lese-Schleife der Session ruft `audio` fuer
/// jeden AUDIO-Frame auf.
pub trait AudioSenke: Send + Sync + 'static {
    fn audio(&self, pcm: Bytes);
}

impl AudioSenke for mpsc::Sender<Bytes> {
    fn audio(&self, pcm: Bytes) {
        match self.try_send(pcm) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Audio-Queue voll - Block verworfen");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Audio-Empfaenger geschlossen");
            }
        }
    }
}

/// Bridge: Audio eines Beins geht direkt in die Queue des anderen
impl AudioSenke for OutboundQueue {
    fn audio(&self, pcm: Bytes) {
        self.audio_einreihen(pcm);
    }
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

/// Ausgangs-Queue einer Session
///
/// Clone teilt die Queue (Session, Schreib-Task und ggf. Bridge-Partner).
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    frames: Mutex<Warteschlange>,
    max_audio: usize,
    benachrichtigung: Notify,
    /// Audio wird nur im Zustand Streaming angenommen
    audio_erlaubt: AtomicBool,
    geschlossen: AtomicBool,
    /// Wegen Ueberlast verworfene Audio-Frames
    verworfen: AtomicU64,
    /// Vollstaendig geschriebene Frames
    gesendet: AtomicU64,
}

#[derive(Default)]
struct Warteschlange {
    frames: VecDeque<Frame>,
    audio: usize,
}

impl OutboundQueue {
    /// Neue Queue; Audio ist bis `audio_freigeben(true)` gesperrt
    pub fn neu(max_audio: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                frames: Mutex::new(Warteschlange::default()),
                max_audio: max_audio.max(1),
                benachrichtigung: Notify::new(),
                audio_erlaubt: AtomicBool::new(false),
                geschlossen: AtomicBool::new(false),
                verworfen: AtomicU64::new(0),
                gesendet: AtomicU64::new(0),
            }),
        }
    }

    /// Reiht einen Audio-Block ein
    ///
    /// Gibt `false` zurueck wenn Audio gerade nicht erlaubt ist. Ist die
    /// Queue voll wird das aelteste Audio verworfen, der neue Block
    /// wird immer angenommen.
    pub fn audio_einreihen(&self, pcm: Bytes) -> bool {
        if !self.inner.audio_erlaubt.load(Ordering::Acquire)
            || self.inner.geschlossen.load(Ordering::Acquire)
        {
            return false;
        }
        {
            let mut q = self.inner.frames.lock();
            if q.audio >= self.inner.max_audio {
                if let Some(pos) = q.frames.iter().position(|f| f.typ == FrameType::Audio) {
                    q.frames.remove(pos);
                    q.audio -= 1;
                    let n = self.inner.verworfen.fetch_add(1, Ordering::Relaxed) + 1;
                    if n.is_power_of_two() {
                        tracing::warn!(verworfen = n, "Ausgang ueberlastet - aeltestes Audio verworfen");
                    }
                }
            }
            q.frames.push_back(Frame::audio(pcm));
            q.audio += 1;
        }
        self.inner.benachrichtigung.notify_one();
        true
    }

    /// Reiht einen Steuer-Frame ein (wird nie verworfen)
    pub fn steuer_einreihen(&self, frame: Frame) {
        if self.inner.geschlossen.load(Ordering::Acquire) {
            tracing::debug!(typ = ?frame.typ, "Queue geschlossen - Steuer-Frame ignoriert");
            return;
        }
        {
            let mut q = self.inner.frames.lock();
            if frame.typ == FrameType::Audio {
                q.audio += 1;
            }
            q.frames.push_back(frame);
        }
        self.inner.benachrichtigung.notify_one();
    }

    /// Sperrt oder erlaubt Audio
    pub fn audio_freigeben(&self, erlaubt: bool) {
        self.inner.audio_erlaubt.store(erlaubt, Ordering::Release);
    }

    pub fn audio_erlaubt(&self) -> bool {
        self.inner.audio_erlaubt.load(Ordering::Acquire)
    }

    /// Entnimmt bis zu `max` Frames in FIFO-Reihenfolge
    pub fn entnehmen(&self, max: usize) -> Vec<Frame> {
        let mut q = self.inner.frames.lock();
        let n = max.min(q.frames.len());
        let batch: Vec<Frame> = q.frames.drain(..n).collect();
        let audio = batch.iter().filter(|f| f.typ == FrameType::Audio).count();
        q.audio -= audio;
        batch
    }

    /// Wartet bis neue Frames eingereiht oder die Queue geschlossen wurde
    pub async fn warten(&self) {
        self.inner.benachrichtigung.notified().await;
    }

    /// Keine neuen Frames mehr annehmen; der Schreib-Task leert den Rest
    pub fn schliessen(&self) {
        self.inner.audio_erlaubt.store(false, Ordering::Release);
        self.inner.geschlossen.store(true, Ordering::Release);
        self.inner.benachrichtigung.notify_one();
    }

    pub fn ist_geschlossen(&self) -> bool {
        self.inner.geschlossen.load(Ordering::Acquire)
    }

    pub fn laenge(&self) -> usize {
        self.inner.frames.lock().frames.len()
    }

    /// Anzahl der Audio-Frames in der Queue
    pub fn audio_laenge(&self) -> usize {
        self.inner.frames.lock().audio
    }

    /// Wegen Ueberlast verworfene Audio-Frames
    pub fn verworfen(&self) -> u64 {
        self.inner.verworfen.load(Ordering::Relaxed)
    }

    /// Vom Schreib-Task geschriebene Frames
    pub fn gesendet(&self) -> u64 {
        self.inner.gesendet.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Schreib-Task
// ---------------------------------------------------------------------------

/// Parameter des Schreib-Tasks
#[derive(Debug, Clone, Copy)]
pub struct SchreibParameter {
    /// Frames pro Runde bevor auf Schreibbarkeit gewartet wird
    pub batch: usize,
    /// Zeitlimit fuer eine Runde (Schreiben + Flush)
    pub timeout: Duration,
    /// Wartezeit nach dem letzten Frame vor dem Schliessen
    pub schliess_verzoegerung: Duration,
}

/// Leert die Queue in den Socket bis sie geschlossen und leer ist
///
/// Liefert `Ok` nach dem regulaeren Schliessen, `Err` bei Schreibfehlern
/// oder wenn eine Runde das Zeitlimit ueberschreitet.
pub async fn schreiben<W>(queue: OutboundQueue, writer: W, param: SchreibParameter) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    let batch_groesse = param.batch.max(1);

    loop {
        let batch = queue.entnehmen(batch_groesse);
        if batch.is_empty() {
            if queue.ist_geschlossen() {
                break;
            }
            queue.warten().await;
            continue;
        }

        let anzahl = batch.len() as u64;
        let runde = async {
            for frame in batch {
                sink.feed(frame).await?;
            }
            // Schreibbarkeit pruefen: blockiert solange der Socket voll ist
            sink.flush().await
        };
        match tokio::time::timeout(param.timeout, runde).await {
            Ok(Ok(())) => {
                queue.inner.gesendet.fetch_add(anzahl, Ordering::Relaxed);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(IntercomError::PeerDisconnected(format!(
                    "Schreiben blockiert laenger als {} ms",
                    param.timeout.as_millis()
                )))
            }
        }
    }

    tokio::time::sleep(param.schliess_verzoegerung).await;
    if let Err(e) = SinkExt::<Frame>::close(&mut sink).await {
        tracing::debug!(fehler = %e, "Fehler beim Schliessen des Sockets");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_protocol::wire::read_frame;
    use tokio::io::duplex;

    fn pcm(wert: u8) -> Bytes {
        Bytes::from(vec![wert; 4])
    }

    #[test]
    fn audio_gesperrt_bis_freigabe() {
        let q = OutboundQueue::neu(4);
        assert!(!q.audio_einreihen(pcm(1)));
        assert_eq!(q.laenge(), 0);
        q.audio_freigeben(true);
        assert!(q.audio_einreihen(pcm(1)));
        assert_eq!(q.audio_laenge(), 1);
    }

    #[test]
    fn ueberlast_verwirft_aeltestes_audio() {
        let q = OutboundQueue::neu(3);
        q.audio_freigeben(true);
        for i in 0..5 {
            q.audio_einreihen(pcm(i));
        }
        assert_eq!(q.audio_laenge(), 3);
        assert_eq!(q.verworfen(), 2);

        let werte: Vec<u8> = q.entnehmen(10).iter().map(|f| f.payload[0]).collect();
        assert_eq!(werte, vec![2, 3, 4]);
        assert_eq!(q.audio_laenge(), 0);
    }

    #[test]
    fn steuer_frames_bleiben_bei_ueberlast() {
        let q = OutboundQueue::neu(2);
        q.audio_freigeben(true);
        q.audio_einreihen(pcm(0));
        q.steuer_einreihen(Frame::pong());
        q.audio_einreihen(pcm(1));
        q.audio_einreihen(pcm(2));
        q.audio_einreihen(pcm(3));

        let frames = q.entnehmen(10);
        let typen: Vec<FrameType> = frames.iter().map(|f| f.typ).collect();
        assert_eq!(typen, vec![FrameType::Pong, FrameType::Audio, FrameType::Audio]);
        assert_eq!(frames[1].payload[0], 2);
    }

    #[test]
    fn geschlossene_queue_nimmt_nichts_mehr() {
        let q = OutboundQueue::neu(2);
        q.audio_freigeben(true);
        q.schliessen();
        assert!(!q.audio_einreihen(pcm(0)));
        q.steuer_einreihen(Frame::stop());
        assert_eq!(q.laenge(), 0);
        assert!(!q.audio_erlaubt());
    }

    fn param() -> SchreibParameter {
        SchreibParameter {
            batch: 2,
            timeout: Duration::from_secs(1),
            schliess_verzoegerung: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn schreib_task_liefert_in_reihenfolge_und_schliesst() {
        let (client, mut server) = duplex(4096);
        let q = OutboundQueue::neu(16);
        q.audio_freigeben(true);
        let task = tokio::spawn(schreiben(q.clone(), client, param()));

        for i in 0..5 {
            q.audio_einreihen(pcm(i));
        }
        q.steuer_einreihen(Frame::stop());
        q.schliessen();

        for i in 0..5 {
            let f = read_frame(&mut server).await.unwrap();
            assert_eq!(f.typ, FrameType::Audio);
            assert_eq!(f.payload[0], i);
        }
        assert_eq!(read_frame(&mut server).await.unwrap().typ, FrameType::Stop);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(q.gesendet(), 6);
        // Socket ist danach geschlossen
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn blockierter_socket_laesst_audio_verwerfen() {
        // Kleiner Puffer und niemand liest: Flush blockiert
        let (client, mut server) = duplex(16);
        let q = OutboundQueue::neu(4);
        q.audio_freigeben(true);
        let task = tokio::spawn(schreiben(
            q.clone(),
            client,
            SchreibParameter {
                batch: 1,
                timeout: Duration::from_secs(5),
                schliess_verzoegerung: Duration::from_millis(1),
            },
        ));

        for i in 0..20 {
            q.audio_einreihen(pcm(i));
            tokio::task::yield_now().await;
        }
        assert!(q.verworfen() > 0);
        assert!(q.audio_laenge() <= 4);

        // Leser holt auf, die neuesten Bloecke kommen an
        q.schliessen();
        let mut letzte = 0;
        while let Ok(f) = read_frame(&mut server).await {
            letzte = f.payload[0];
        }
        assert_eq!(letzte, 19);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn zeitlimit_beim_schreiben_ist_fehler() {
        let (client, _server) = duplex(8);
        let q = OutboundQueue::neu(4);
        q.audio_freigeben(true);
        q.audio_einreihen(Bytes::from(vec![0u8; 64]));
        let r = schreiben(
            q,
            client,
            SchreibParameter {
                batch: 1,
                timeout: Duration::from_millis(50),
                schliess_verzoegerung: Duration::ZERO,
            },
        )
        .await;
        assert!(matches!(r, Err(IntercomError::PeerDisconnected(_))));
    }
}
