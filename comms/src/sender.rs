//! Writing half of a framed connection.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes length prefixed frames to the wrapped writer.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Encodes `msg` and writes it as a single frame.
    ///
    /// The body is staged in an internal buffer behind room for the length
    /// prefix, a borrowed tail returned by the encoder is written after it as is.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An io error if encoding or writing failed.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(&mut self.buf)?;
        let body_len = self.buf.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);
        let prefix = (body_len as LenType).to_be_bytes();
        self.buf[..LEN_TYPE_SIZE].copy_from_slice(&prefix);

        self.tx.write_all(&self.buf).await?;
        if let Some(tail) = tail {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }

    /// Shuts down the writer, the peer reads end of stream after the last frame.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
