//! Establishes the pair of connections between both parties.
//!
//! Every party accepts the peer's requests on its listener and sends its own
//! through the connection it dials, so each direction has a single writer of
//! requests and a single writer of responses.

use std::time::Duration;

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{BridgeError, Result};

pub(crate) type NetRx = FrameReceiver<OwnedReadHalf>;
pub(crate) type NetTx = FrameSender<OwnedWriteHalf>;

/// Both connections of an established channel.
pub(crate) struct Link {
    pub inbound: (NetRx, NetTx),
    pub outbound: (NetRx, NetTx),
}

/// Answers the handshake of an incoming connection.
///
/// # Returns
/// Whether the connection belongs to our peer.
pub(crate) async fn accept_peer<R, W>(
    rx: &mut FrameReceiver<R>,
    tx: &mut FrameSender<W>,
    token: &str,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reason = match rx.recv::<Msg>().await? {
        Msg::Control(Command::Connect { token: got }) if got == token => {
            tx.send(&Msg::Control(Command::Accepted)).await?;
            return Ok(true);
        }
        Msg::Control(Command::Connect { token: got }) => {
            format!("token mismatch, expected {token}, got {got}")
        }
        msg => format!("expected connect, got {}", msg.kind()),
    };

    warn!("rejecting connection: {reason}");
    tx.send(&Msg::Control(Command::Rejected { reason })).await?;
    Ok(false)
}

/// Runs the handshake on a connection we dialed.
pub(crate) async fn dial_peer<R, W>(
    rx: &mut FrameReceiver<R>,
    tx: &mut FrameSender<W>,
    token: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = Msg::Control(Command::Connect {
        token: token.to_string(),
    });
    tx.send(&msg).await?;

    match rx.recv::<Msg>().await? {
        Msg::Control(Command::Accepted) => Ok(()),
        Msg::Control(Command::Rejected { reason }) => Err(BridgeError::Rejected(reason)),
        msg => Err(BridgeError::Rejected(format!(
            "expected accepted, got {}",
            msg.kind()
        ))),
    }
}

/// Accepts the peer on `listener` while dialing it at `remote`.
///
/// # Arguments
/// * `listener` - Our bound listener.
/// * `remote` - The peer's listening address.
/// * `token` - The handshake token both parties share.
/// * `connect_timeout` - Deadline for both directions to be established.
/// * `retry_interval` - Pause between dial attempts while the peer is not up.
///
/// # Returns
/// The established link, or an error if the deadline expired or the peer
/// rejected us.
pub(crate) async fn establish(
    listener: TcpListener,
    remote: &str,
    token: &str,
    connect_timeout: Duration,
    retry_interval: Duration,
) -> Result<Link> {
    let accept = async {
        loop {
            let (stream, addr) = listener.accept().await?;
            let (rx, tx) = stream.into_split();
            let (mut rx, mut tx) = comms::channel(rx, tx);

            match accept_peer(&mut rx, &mut tx, token).await {
                Ok(true) => {
                    info!("peer connected from {addr}");
                    return Ok::<_, BridgeError>((rx, tx));
                }
                Ok(false) => {}
                Err(e) => warn!("handshake with {addr} failed: {e}"),
            }
        }
    };

    let dial = async {
        loop {
            match TcpStream::connect(remote).await {
                Ok(stream) => {
                    let (rx, tx) = stream.into_split();
                    let (mut rx, mut tx) = comms::channel(rx, tx);
                    dial_peer(&mut rx, &mut tx, token).await?;
                    info!("connected to peer at {remote}");
                    return Ok::<_, BridgeError>((rx, tx));
                }
                Err(e) => {
                    debug!("peer at {remote} not ready: {e}");
                    time::sleep(retry_interval).await;
                }
            }
        }
    };

    let (inbound, outbound) = time::timeout(connect_timeout, async { tokio::try_join!(accept, dial) })
        .await
        .map_err(|_| BridgeError::ConnectTimeout {
            timeout: connect_timeout,
            remote: remote.to_string(),
        })??;

    Ok(Link { inbound, outbound })
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, split};

    use super::*;

    #[tokio::test]
    async fn handshake_with_matching_token() -> Result<()> {
        let (a, b) = duplex(1024);
        let (a_rx, a_tx) = split(a);
        let (b_rx, b_tx) = split(b);
        let (mut a_rx, mut a_tx) = comms::channel(a_rx, a_tx);
        let (mut b_rx, mut b_tx) = comms::channel(b_rx, b_tx);

        let (accepted, ()) = tokio::try_join!(
            accept_peer(&mut a_rx, &mut a_tx, "job-0"),
            dial_peer(&mut b_rx, &mut b_tx, "job-0"),
        )?;

        assert!(accepted);
        Ok(())
    }

    #[tokio::test]
    async fn handshake_with_other_token_is_rejected() {
        let (a, b) = duplex(1024);
        let (a_rx, a_tx) = split(a);
        let (b_rx, b_tx) = split(b);
        let (mut a_rx, mut a_tx) = comms::channel(a_rx, a_tx);
        let (mut b_rx, mut b_tx) = comms::channel(b_rx, b_tx);

        let (accepted, dialed) = tokio::join!(
            accept_peer(&mut a_rx, &mut a_tx, "job-0"),
            dial_peer(&mut b_rx, &mut b_tx, "job-1"),
        );

        assert!(!accepted.unwrap());
        assert!(matches!(dialed, Err(BridgeError::Rejected(_))));
    }

    #[tokio::test]
    async fn establish_times_out_without_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = free.local_addr().unwrap().to_string();
        drop(free);

        let res = establish(
            listener,
            &remote,
            "job-0",
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(res, Err(BridgeError::ConnectTimeout { .. })));
    }
}
