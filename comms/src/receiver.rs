use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DEFAULT_MAX_FRAME_LEN, Deserialize, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Limits the size of the frames this receiver accepts.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Waits to receive a new message from the inner reader.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    /// A clean end of stream before the length prefix is reported as
    /// `io::ErrorKind::UnexpectedEof`.
    pub async fn recv<T: Deserialize>(&mut self) -> io::Result<T> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf);

        if len > self.max_frame_len as LenType {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame of {len} bytes exceeds the limit of {} bytes",
                    self.max_frame_len
                ),
            ));
        }

        let len = len as usize;
        self.buf.clear();
        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        T::deserialize(&self.buf)
    }
}
