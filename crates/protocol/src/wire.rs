//! Stream-Anbindung des Frame-Formats
//!
//! `FrameCodec` verbindet `frame::decode`/`frame::encode_into` mit
//! `tokio_util::codec::Framed`. Fuer Stellen ohne `Framed` (Tests,
//! einfache Gegenstellen) gibt es `read_frame`/`write_frame`.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Decoded, Fehlend, Frame, FrameError, HEADER_GROESSE};

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer die Hub <-> Endpunkt Verbindung
///
/// Ein korrupter Header liefert `Err`; danach darf der Stream nicht
/// weiter gelesen werden.
///
/// # Beispiel
///
/// ```rust,no_run
/// use tokio_util::codec::Framed;
/// use intercom_protocol::wire::FrameCodec;
///
/// // let stream = TcpStream::connect(...).await?;
/// // let framed = Framed::new(stream, FrameCodec::new());
/// ```
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    /// Zaehlt dekodierte Frames (fuer Statistiken/Logging)
    dekodiert: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl bisher dekodierter Frames
    pub fn dekodiert(&self) -> u64 {
        self.dekodiert
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match frame::decode(src) {
            Decoded::Frame(f) => {
                self.dekodiert += 1;
                Ok(Some(f))
            }
            Decoded::NeedMoreData(Fehlend::Payload(fehlend)) => {
                // Speicher vorbelegen um Reallocations zu vermeiden
                src.reserve(fehlend);
                Ok(None)
            }
            Decoded::NeedMoreData(Fehlend::Header(_)) => Ok(None),
            Decoded::Corrupt(e) => Err(e),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame::encode_into(item.typ, item.flags, &item.payload, dst)
    }
}

// ---------------------------------------------------------------------------
// Hilfsfunktionen fuer direktes async Lesen/Schreiben
// ---------------------------------------------------------------------------

/// Liest genau einen Frame aus einem `AsyncRead`
///
/// # Fehler
/// - `Io(UnexpectedEof)` wenn die Verbindung vor Abschluss des Frames endet
/// - `UnbekannterTyp` bei ungueltigem Header
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_GROESSE];
    reader.read_exact(&mut header).await?;
    let (typ, flags, laenge) = frame::header_lesen(&header)?;

    let mut payload = vec![0u8; laenge];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::neu(typ, flags, payload))
}

/// Schreibt genau einen Frame in einen `AsyncWrite`
pub async fn write_frame<W>(writer: &mut W, f: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let kodiert = f.kodieren()?;
    writer.write_all(&kodiert).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ErrorCode, FrameFlags, FrameType};
    use bytes::BufMut;
    use std::io;

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::audio(vec![1u8, 2, 3, 4]), &mut buf).unwrap();
        codec.encode(Frame::start(FrameFlags::RINGING), &mut buf).unwrap();

        let a = codec.decode(&mut buf).unwrap().expect("Frame erwartet");
        assert_eq!(a.typ, FrameType::Audio);
        assert_eq!(&a.payload[..], &[1, 2, 3, 4]);
        let b = codec.decode(&mut buf).unwrap().expect("Frame erwartet");
        assert_eq!(b.flags, FrameFlags::RINGING);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.dekodiert(), 2);
    }

    #[test]
    fn frame_codec_unvollstaendiger_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::audio(vec![0u8; 64]), &mut buf).unwrap();

        let haelfte = buf.len() / 2;
        let mut teil = buf.split_to(haelfte);
        assert!(codec.decode(&mut teil).unwrap().is_none());

        teil.unsplit(buf);
        assert!(codec.decode(&mut teil).unwrap().is_some());
    }

    #[test]
    fn frame_codec_korrupter_header_ist_fehler() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x7F, 0x00, 0x01, 0x00, 0xAA]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnbekannterTyp(0x7F))
        ));
    }

    #[test]
    fn frame_codec_encode_zu_gross() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let r = codec.encode(Frame::audio(vec![0u8; 70_000]), &mut buf);
        assert!(matches!(r, Err(FrameError::PayloadTooLarge(70_000))));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn async_read_write_frame_round_trip() {
        let mut buffer: Vec<u8> = Vec::new();
        write_frame(&mut buffer, &Frame::error(ErrorCode::BUSY))
            .await
            .unwrap();
        assert_eq!(buffer, vec![0x06, 0x00, 0x01, 0x00, ErrorCode::BUSY]);

        let mut cursor = io::Cursor::new(buffer);
        let f = read_frame(&mut cursor).await.unwrap();
        assert_eq!(f.fehlercode(), Some(ErrorCode::BUSY));
    }

    #[tokio::test]
    async fn async_read_frame_abgeschnitten() {
        // Header verspricht 10 Bytes, nur 5 vorhanden
        let buffer = vec![0x01, 0x00, 0x0A, 0x00, 1, 2, 3, 4, 5];
        let mut cursor = io::Cursor::new(buffer);
        let e = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(e, FrameError::Io(ref fehler) if fehler.kind() == io::ErrorKind::UnexpectedEof));
    }
}
