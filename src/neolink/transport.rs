use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

/// Upper bound for a single frame; larger length prefixes are rejected before
/// any payload is read so a corrupt peer cannot make us allocate arbitrarily.
pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB

/// Length tag for the explicit end-of-data block. This is distinct from a
/// socket close: the sender may keep the connection open after sending it.
const NULL_TAG: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0}")]
    TooLarge(u32),
    #[error("frame is not valid utf-8")]
    BadUtf8,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One end of the secured byte pipe to the relay server, framed into
/// length-tagged blocks. Strings travel through the same block layer as
/// UTF-8 payloads.
///
/// The underlying socket is assumed to be an already-secured, reliable,
/// ordered stream; no crypto happens here.
pub struct Channel {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
        }
    }

    /// Splits into independently owned halves so the read loop and writers
    /// (heartbeat, handshake replies) can live on different tasks.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receives one block. `Ok(None)` means the peer signalled end-of-data
    /// (null block) or closed the stream cleanly at a frame boundary.
    pub async fn receive_block(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Some(tag) = self.read_tag().await? else {
            return Ok(None);
        };
        if tag == NULL_TAG {
            return Ok(None);
        }
        if tag > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(tag));
        }
        let mut buf = vec![0u8; tag as usize];
        self.inner.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Receives one line. `Ok(None)` means the channel ended.
    pub async fn receive_line(&mut self) -> Result<Option<String>, FrameError> {
        let Some(block) = self.receive_block().await? else {
            return Ok(None);
        };
        let s = String::from_utf8(block.to_vec()).map_err(|_| FrameError::BadUtf8)?;
        Ok(Some(s))
    }

    // None on a clean EOF before the first tag byte; a close in the middle of
    // a tag is an UnexpectedEof error.
    async fn read_tag(&mut self) -> Result<Option<u32>, FrameError> {
        let mut buf = [0u8; 4];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed inside a frame header",
                )));
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Sends one block; `None` sends the explicit end-of-data marker.
    pub async fn send_block(&mut self, payload: Option<&[u8]>) -> Result<(), FrameError> {
        match payload {
            None => {
                self.inner.write_u32(NULL_TAG).await?;
            }
            Some(b) => {
                let n: u32 = b
                    .len()
                    .try_into()
                    .map_err(|_| FrameError::TooLarge(u32::MAX))?;
                if n > MAX_FRAME_BYTES {
                    return Err(FrameError::TooLarge(n));
                }
                self.inner.write_u32(n).await?;
                self.inner.write_all(b).await?;
            }
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), FrameError> {
        self.send_block(Some(line.as_bytes())).await
    }

    /// Half-closes the write direction. The peer observes EOF after any
    /// blocks already in flight.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_roundtrip() {
        let (a, b) = tokio::io::duplex(256);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);

        w.send_line("en;0.1.0;key;TU").await.unwrap();
        w.send_line("").await.unwrap();

        assert_eq!(r.receive_line().await.unwrap().as_deref(), Some("en;0.1.0;key;TU"));
        assert_eq!(r.receive_line().await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn null_block_is_end_of_data() {
        let (a, b) = tokio::io::duplex(256);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);

        w.send_block(Some(b"payload")).await.unwrap();
        w.send_block(None).await.unwrap();

        assert_eq!(r.receive_block().await.unwrap().as_deref(), Some(&b"payload"[..]));
        assert!(r.receive_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_writer_is_clean_eof() {
        let (a, b) = tokio::io::duplex(256);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);

        w.send_line("last words").await.unwrap();
        drop(w);

        assert!(r.receive_line().await.unwrap().is_some());
        assert!(r.receive_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected_without_reading_payload() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut r = FrameReader::new(b);

        tokio::spawn(async move {
            a.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
            // no payload needed
        });

        match r.receive_block().await {
            Err(FrameError::TooLarge(n)) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut r = FrameReader::new(b);

        a.write_all(&[0x00, 0x00]).await.unwrap();
        drop(a);

        assert!(matches!(r.receive_block().await, Err(FrameError::Io(_))));
    }
}
