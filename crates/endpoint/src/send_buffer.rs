//! Gemeinsamer Sendepuffer des Endpunkts
//!
//! TX-Einheit (Mikrofon) und RX-Einheit (PONG, START, STOP) schreiben
//! ueber denselben `SendBuffer`. Er liegt hinter einer `tokio::sync::Mutex`,
//! die genau fuer das Schreiben eines Frames gehalten wird. Damit kann ein
//! PING/PONG nie in ein halb geschriebenes AUDIO-Frame geraten.
//!
//! Teilweise Schreibvorgaenge werden mit dem Rest wiederholt. Bleibt ein
//! Versuch ohne Fortschritt (Zeitlimit, `WouldBlock`), zaehlt er gegen
//! `max_versuche`; danach ist der Strom nicht mehr synchron und die
//! Verbindung muss geschlossen werden.

use bytes::BytesMut;
use intercom_core::{IntercomError, Result};
use intercom_protocol::frame::{self, Frame};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Von TX und RX geteilter Sendepuffer
pub type GeteilterSendBuffer<W> = Arc<Mutex<SendBuffer<W>>>;

/// Zaehler des Sendepuffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStatistik {
    pub frames: u64,
    pub bytes: u64,
    /// Schreibaufrufe die nur einen Teil geschrieben haben
    pub teilschreibvorgaenge: u64,
}

/// Exklusiv besessener Schreibpuffer einer Verbindung
pub struct SendBuffer<W> {
    writer: W,
    puffer: BytesMut,
    schreib_timeout: Duration,
    max_versuche: u32,
    statistik: SendStatistik,
}

impl<W> SendBuffer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn neu(writer: W, schreib_timeout: Duration, max_versuche: u32) -> Self {
        Self {
            writer,
            puffer: BytesMut::with_capacity(1024),
            schreib_timeout,
            max_versuche: max_versuche.max(1),
            statistik: SendStatistik::default(),
        }
    }

    /// Verpackt den Puffer fuer die gemeinsame Nutzung
    pub fn geteilt(self) -> GeteilterSendBuffer<W> {
        Arc::new(Mutex::new(self))
    }

    /// Schreibt genau einen Frame vollstaendig
    ///
    /// # Fehler
    /// - `PayloadTooLarge` vor dem ersten geschriebenen Byte
    /// - `PartialWriteExhausted` wenn `max_versuche` Versuche ohne Fortschritt blieben
    /// - `PeerDisconnected` wenn der Writer 0 Bytes akzeptiert
    pub async fn frame_schreiben(&mut self, f: &Frame) -> Result<()> {
        self.puffer.clear();
        frame::encode_into(f.typ, f.flags, &f.payload, &mut self.puffer)?;

        let erwartet = self.puffer.len();
        let mut geschrieben = 0;
        let mut versuche_ohne_fortschritt = 0;

        while geschrieben < erwartet {
            let versuch =
                tokio::time::timeout(self.schreib_timeout, self.writer.write(&self.puffer[geschrieben..]))
                    .await;
            match versuch {
                Ok(Ok(0)) => {
                    return Err(IntercomError::PeerDisconnected(
                        "Verbindung beim Schreiben geschlossen".into(),
                    ))
                }
                Ok(Ok(n)) => {
                    geschrieben += n;
                    if geschrieben < erwartet {
                        self.statistik.teilschreibvorgaenge += 1;
                        tracing::trace!(geschrieben, erwartet, "Teilweise geschrieben, Rest folgt");
                    }
                    versuche_ohne_fortschritt = 0;
                    continue;
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    tracing::debug!(geschrieben, erwartet, "Schreibversuch ohne Fortschritt");
                }
            }

            versuche_ohne_fortschritt += 1;
            if versuche_ohne_fortschritt >= self.max_versuche {
                tracing::warn!(
                    geschrieben,
                    erwartet,
                    versuche = versuche_ohne_fortschritt,
                    "Frame konnte nicht vollstaendig geschrieben werden"
                );
                return Err(IntercomError::PartialWriteExhausted {
                    geschrieben,
                    erwartet,
                });
            }
        }

        match tokio::time::timeout(self.schreib_timeout, self.writer.flush()).await {
            Ok(r) => r?,
            Err(_) => tracing::debug!("Flush-Zeitlimit ueberschritten"),
        }

        self.statistik.frames += 1;
        self.statistik.bytes += erwartet as u64;
        Ok(())
    }

    /// Beendet die Schreibseite der Verbindung
    pub async fn schliessen(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn statistik(&self) -> SendStatistik {
        self.statistik
    }
}

/// Sperrt den geteilten Puffer fuer genau einen Frame
pub async fn senden<W>(buffer: &GeteilterSendBuffer<W>, f: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = buffer.lock().await;
    guard.frame_schreiben(f).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
