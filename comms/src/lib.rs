mod deserialize;
pub mod msg;
mod protocol;
mod receiver;
mod sender;
mod serialize;
pub mod tensor;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;
pub use tensor::{AnyPayload, Tensor};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The largest frame a `FrameReceiver` accepts unless told otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Wraps both halves of a connection into a framed receiver and sender.
///
/// # Arguments
/// * `rx` - The reading half.
/// * `tx` - The writing half.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
