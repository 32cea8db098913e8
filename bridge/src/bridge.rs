use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
    time::{Duration, Instant, SystemTime},
};

use comms::{
    AnyPayload, FrameReceiver, FrameSender, Tensor,
    msg::{
        Command, DataMessage, LoadDataBlockRequest, Msg, Payload, Status, StatusCode,
        TransmitRequest,
    },
};
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{Notify, mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};

use crate::{
    BridgeConfig, BridgeError, Result, channel,
    state::{IterState, Outcome},
};

/// Decides whether a data block announced by the peer can be loaded.
pub type DataBlockHandler = Box<dyn Fn(&LoadDataBlockRequest) -> bool + Send + Sync>;

/// The lifecycle of the channel as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Idle,
    Connected,
    PeerClosed,
    Error(String),
    Closed,
}

/// An item of the transmit queue.
enum Outbound {
    Transmit(TransmitRequest),
    LoadDataBlock(LoadDataBlockRequest, oneshot::Sender<Status>),
}

#[derive(Default)]
struct State {
    iter: IterState,
    started: bool,
    terminated: bool,
    peer_terminated: bool,
    channel_error: Option<String>,
}

/// Everything the background tasks share with the handle.
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    pending: Mutex<HashMap<u64, oneshot::Sender<Status>>>,
    handler: OnceLock<DataBlockHandler>,
    events: watch::Sender<ChannelEvent>,
    connected_at: Mutex<Option<SystemTime>>,
    terminated_at: Mutex<Option<SystemTime>>,
}

impl Shared {
    /// Records a broken channel and wakes every waiter so it can fail.
    fn fail(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if state.channel_error.is_some() {
                return;
            }

            if state.terminated {
                debug!("channel closed after terminate: {reason}");
            } else {
                error!("channel failure: {reason}, maybe caused by peer restart");
            }

            state.channel_error = Some(reason.clone());
        }

        self.pending.lock().clear();
        self.notify.notify_waiters();
        self.events.send_replace(ChannelEvent::Error(reason));
    }

    fn peer_closed(&self) {
        self.state.lock().peer_terminated = true;
        self.notify.notify_waiters();
        self.events.send_replace(ChannelEvent::PeerClosed);
    }

    fn handle_transmit(&self, request: TransmitRequest) -> Outcome {
        let outcome = self.state.lock().iter.apply(request);
        if outcome == Outcome::Accepted {
            self.notify.notify_waiters();
        }

        outcome
    }

    fn handle_data_block(&self, request: &LoadDataBlockRequest) -> Status {
        let Some(handler) = self.handler.get() else {
            error!("received data block {} but no handler registered", request.block_id);
            return Status::new(StatusCode::InvalidRequest, "no data block handler registered");
        };

        if handler(request) {
            info!("succeeded to load data block {}", request.block_id);
            Status::success()
        } else {
            info!("failed to load data block {}", request.block_id);
            Status::new(StatusCode::InvalidDataBlock, "data block refused")
        }
    }
}

struct Tasks {
    stream: JoinHandle<()>,
    responses: JoinHandle<()>,
    server: JoinHandle<()>,
}

/// One party's end of the two-party channel.
///
/// Iterations are opened with `start` and closed with `commit`; named values
/// are exchanged with `send` and `receive` in between. The peer's transmit
/// stream is applied to the shared state by a background task which wakes
/// every pending `receive`.
pub struct Bridge {
    config: BridgeConfig,
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<Outbound>>>,
    tasks: Mutex<Option<Tasks>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Bridge {
    /// Creates a new, not yet connected, `Bridge`.
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = watch::channel(ChannelEvent::Idle);

        let shared = Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            handler: OnceLock::new(),
            events,
            connected_at: Mutex::new(None),
            terminated_at: Mutex::new(None),
        };

        Self {
            config,
            shared: Arc::new(shared),
            queue: Mutex::new(None),
            tasks: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn current_iter_id(&self) -> Option<u64> {
        self.shared.state.lock().iter.current_iter_id
    }

    pub fn next_iter_id(&self) -> u64 {
        self.shared.state.lock().iter.next_iter_id
    }

    /// The id the next call to `start` should use.
    pub fn new_iter_id(&self) -> u64 {
        self.next_iter_id()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        *self.shared.connected_at.lock()
    }

    pub fn terminated_at(&self) -> Option<SystemTime> {
        *self.shared.terminated_at.lock()
    }

    /// Subscribes to the channel lifecycle events.
    pub fn events(&self) -> watch::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Binds the listener, waits for the peer in both directions and starts
    /// the background tasks. Calling it again once connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connecting.lock().await;
        if self.shared.state.lock().started {
            return Ok(());
        }

        let cfg = &self.config;
        let listener = TcpListener::bind(cfg.listen_addr.as_str()).await?;
        info!(role = cfg.role.as_str(); "listening at {}, peer at {}", cfg.listen_addr, cfg.remote_addr);

        let link = channel::establish(
            listener,
            &cfg.remote_addr,
            &cfg.token(),
            cfg.connect_timeout,
            cfg.retry_interval,
        )
        .await?;

        self.attach(link.inbound, link.outbound)
    }

    /// Starts the background tasks over already established connections.
    ///
    /// # Arguments
    /// * `inbound` - The connection carrying the peer's requests.
    /// * `outbound` - The connection carrying our requests.
    pub fn attach<IR, IW, OR, OW>(
        &self,
        inbound: (FrameReceiver<IR>, FrameSender<IW>),
        outbound: (FrameReceiver<OR>, FrameSender<OW>),
    ) -> Result<()>
    where
        IR: AsyncRead + Unpin + Send + 'static,
        IW: AsyncWrite + Unpin + Send + 'static,
        OR: AsyncRead + Unpin + Send + 'static,
        OW: AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.started {
                return Err(BridgeError::AlreadyConnected);
            }
            state.started = true;
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.stream_queue_size.get());
        *self.queue.lock() = Some(queue_tx);

        let (in_rx, in_tx) = inbound;
        let (out_rx, out_tx) = outbound;

        let tasks = Tasks {
            stream: monitored(&self.shared, stream_fn(self.shared.clone(), queue_rx, out_tx)),
            responses: monitored(&self.shared, responses_fn(self.shared.clone(), out_rx)),
            server: monitored(&self.shared, serve_fn(self.shared.clone(), in_rx, in_tx)),
        };

        *self.tasks.lock() = Some(tasks);
        *self.shared.connected_at.lock() = Some(SystemTime::now());
        self.shared.events.send_replace(ChannelEvent::Connected);
        Ok(())
    }

    /// Flushes the transmit stream, says goodbye to the peer and closes the
    /// channel. Does nothing if never connected or already terminated.
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.started || state.terminated {
                return Ok(());
            }
            state.terminated = true;
        }
        self.shared.notify.notify_waiters();

        // Dropping the last sender ends the stream once the queue drains.
        self.queue.lock().take();

        let tasks = self.tasks.lock().take();
        if let Some(Tasks {
            stream,
            responses,
            server,
        }) = tasks
        {
            let close_timeout = self.config.close_timeout;
            for (name, task) in [("stream", stream), ("responses", responses), ("server", server)] {
                join_or_abort(name, task, close_timeout).await;
            }
        }

        *self.shared.terminated_at.lock() = Some(SystemTime::now());
        self.shared.events.send_replace(ChannelEvent::Closed);
        info!(role = self.config.role.as_str(); "bridge terminated");
        Ok(())
    }

    /// Opens iteration `iter_id` and announces it to the peer.
    pub async fn start(&self, iter_id: u64) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.started {
                return Err(BridgeError::NotConnected);
            }
            if state.terminated {
                return Err(BridgeError::Terminated);
            }
            state.iter.begin(iter_id)?;
        }

        self.transmit(Outbound::Transmit(TransmitRequest::Start { iter_id }))
            .await?;
        debug!("send start iter_id: {iter_id}");
        Ok(())
    }

    /// Closes the open iteration and announces it to the peer.
    pub async fn commit(&self) -> Result<()> {
        let iter_id = self.shared.state.lock().iter.finish()?;

        self.transmit(Outbound::Transmit(TransmitRequest::Commit { iter_id }))
            .await?;
        debug!("send commit iter_id: {iter_id}");
        Ok(())
    }

    /// Sends a tensor named `name` for iteration `iter_id`.
    pub async fn send(&self, iter_id: u64, name: &str, tensor: impl Into<Tensor>) -> Result<()> {
        self.send_payload(iter_id, name, Payload::Tensor(tensor.into()))
            .await
    }

    /// Sends an opaque value named `name` for iteration `iter_id`.
    pub async fn send_any(&self, iter_id: u64, name: &str, any: AnyPayload) -> Result<()> {
        self.send_payload(iter_id, name, Payload::Any(any)).await
    }

    /// Sends a tensor for the open iteration.
    pub async fn send_current(&self, name: &str, tensor: impl Into<Tensor>) -> Result<()> {
        let iter_id = self.open_iter_id()?;
        self.send(iter_id, name, tensor).await
    }

    /// Sends an opaque value for the open iteration.
    pub async fn send_any_current(&self, name: &str, any: AnyPayload) -> Result<()> {
        let iter_id = self.open_iter_id()?;
        self.send_any(iter_id, name, any).await
    }

    /// Waits for the tensor the peer sends as `name` for iteration `iter_id`.
    pub async fn receive(&self, iter_id: u64, name: &str) -> Result<Tensor> {
        match self.receive_data(iter_id, name).await?.payload {
            Payload::Tensor(tensor) => Ok(tensor),
            Payload::Any(_) => Err(BridgeError::PayloadKind {
                iter_id,
                name: name.to_string(),
                expected: "tensor",
            }),
        }
    }

    /// Waits for the opaque value the peer sends as `name` for iteration `iter_id`.
    pub async fn receive_any(&self, iter_id: u64, name: &str) -> Result<AnyPayload> {
        match self.receive_data(iter_id, name).await?.payload {
            Payload::Any(any) => Ok(any),
            Payload::Tensor(_) => Err(BridgeError::PayloadKind {
                iter_id,
                name: name.to_string(),
                expected: "any",
            }),
        }
    }

    /// Waits for a tensor of the open iteration.
    pub async fn receive_current(&self, name: &str) -> Result<Tensor> {
        let iter_id = self.open_iter_id()?;
        self.receive(iter_id, name).await
    }

    /// Waits for an opaque value of the open iteration.
    pub async fn receive_any_current(&self, name: &str) -> Result<AnyPayload> {
        let iter_id = self.open_iter_id()?;
        self.receive_any(iter_id, name).await
    }

    /// Registers the function deciding on the data blocks the peer announces.
    /// Only one handler can ever be registered.
    pub fn register_data_block_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&LoadDataBlockRequest) -> bool + Send + Sync + 'static,
    {
        self.shared
            .handler
            .set(Box::new(handler))
            .map_err(|_| BridgeError::HandlerRegistered)
    }

    /// Asks the peer to load the data block `block_id` holding `count` examples.
    ///
    /// # Returns
    /// Whether the peer accepted the block.
    pub async fn load_data_block(&self, count: u64, block_id: &str) -> Result<bool> {
        let request = LoadDataBlockRequest {
            count,
            block_id: block_id.to_string(),
        };

        debug!("sending data block with id {block_id}");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.transmit(Outbound::LoadDataBlock(request, reply_tx))
            .await?;

        let status = reply_rx.await.map_err(|_| self.closed_error())?;
        if status.is_success() {
            info!("remote succeeded to load data block {block_id}");
            return Ok(true);
        }

        info!(
            "remote failed to load data block {block_id}, code: {:?}",
            status.code
        );
        Ok(false)
    }

    fn open_iter_id(&self) -> Result<u64> {
        self.current_iter_id().ok_or(BridgeError::NotStarted)
    }

    async fn send_payload(&self, iter_id: u64, name: &str, payload: Payload) -> Result<()> {
        let data = DataMessage {
            iter_id,
            name: name.to_string(),
            payload,
        };

        self.transmit(Outbound::Transmit(TransmitRequest::Data(data)))
            .await?;
        debug!("send data iter_id: {iter_id}, name: {name}");
        Ok(())
    }

    /// The error an operation reports once the transmit stream is gone.
    fn closed_error(&self) -> BridgeError {
        match &self.shared.state.lock().channel_error {
            Some(reason) => BridgeError::Channel(reason.clone()),
            None => BridgeError::Terminated,
        }
    }

    async fn transmit(&self, item: Outbound) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if let Some(reason) = &state.channel_error {
                return Err(BridgeError::Channel(reason.clone()));
            }
            if state.terminated {
                return Err(BridgeError::Terminated);
            }
        }

        let queue = self.queue.lock().clone().ok_or(BridgeError::NotConnected)?;
        match queue.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(
                    "transmit stream queue is full, size: {}",
                    self.config.stream_queue_size
                );
                queue.send(item).await.map_err(|_| self.closed_error())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    async fn receive_data(&self, iter_id: u64, name: &str) -> Result<DataMessage> {
        debug!("waiting to receive iter_id: {iter_id}, name: {name}");
        let alert = self.config.waiting_alert_timeout();
        let begin = Instant::now();

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock();
                if let Some(data) = state.iter.received(iter_id, name) {
                    debug!(
                        "received iter_id: {iter_id}, name: {name} after {:.3} sec",
                        begin.elapsed().as_secs_f64()
                    );
                    return Ok(data.clone());
                }

                if state.iter.peer_committed(iter_id) {
                    let err = BridgeError::PeerCommittedWithout {
                        iter_id,
                        name: name.to_string(),
                    };
                    error!("{err}");
                    return Err(err);
                }

                if state.peer_terminated {
                    let err = BridgeError::PeerTerminated {
                        iter_id,
                        name: name.to_string(),
                    };
                    error!("{err}");
                    return Err(err);
                }

                if let Some(reason) = &state.channel_error {
                    return Err(BridgeError::Channel(reason.clone()));
                }
            }

            let elapsed = begin.elapsed();
            if elapsed >= alert {
                warn!(
                    "waiting to receive iter_id: {iter_id}, name: {name} timeout, duration: {:.3} sec",
                    elapsed.as_secs_f64()
                );
            }

            let _ = time::timeout(next_alert_in(elapsed, alert), notified).await;
        }
    }
}

/// Time left until the next multiple of `alert` since the wait began.
fn next_alert_in(elapsed: Duration, alert: Duration) -> Duration {
    let into_period = elapsed.as_nanos() % alert.as_nanos();
    alert - Duration::from_nanos(into_period as u64)
}

/// Spawns `fut`, recording its failure or panic as a channel failure.
fn monitored<F>(shared: &Arc<Shared>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let shared = shared.clone();
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => shared.fail(e.to_string()),
            Err(panic) => shared.fail(format!("task panicked: {}", panic_message(&*panic))),
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown cause"
    }
}

async fn join_or_abort(name: &str, mut task: JoinHandle<()>, timeout: Duration) {
    match time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} task panicked: {e}"),
        Err(_) => {
            warn!("{name} task did not finish within {timeout:?}, aborting");
            task.abort();
        }
    }
}

/// Writes the transmit queue to the peer, then says goodbye.
async fn stream_fn<W>(
    shared: Arc<Shared>,
    mut queue: mpsc::Receiver<Outbound>,
    mut tx: FrameSender<W>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut seq = 0;

    while let Some(item) = queue.recv().await {
        let msg = match item {
            Outbound::Transmit(request) => Msg::Transmit { seq, request },
            Outbound::LoadDataBlock(request, reply) => {
                shared.pending.lock().insert(seq, reply);
                Msg::LoadDataBlock { seq, request }
            }
        };

        seq += 1;
        tx.send(&msg).await?;
    }

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    Ok(())
}

/// Reads the peer's answers to our requests.
async fn responses_fn<R>(shared: Arc<Shared>, mut rx: FrameReceiver<R>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match rx.recv::<Msg>().await? {
            Msg::Response { seq, status } => {
                let reply = shared.pending.lock().remove(&seq);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(status);
                    }
                    None if !status.is_success() => {
                        warn!("peer answered request {seq} with {:?}: {}", status.code, status.message);
                    }
                    None => {}
                }
            }
            Msg::Control(Command::Disconnect) => {
                debug!("peer acknowledged our disconnect");
                return Ok(());
            }
            Msg::Err(text) => return Err(BridgeError::Remote(text)),
            msg => warn!("unexpected {} message on the response stream", msg.kind()),
        }
    }
}

/// Serves the peer's requests until it says goodbye.
async fn serve_fn<R, W>(
    shared: Arc<Shared>,
    mut rx: FrameReceiver<R>,
    mut tx: FrameSender<W>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        match rx.recv::<Msg>().await? {
            Msg::Transmit { seq, request } => {
                debug!("peer sent {} for iter_id {}", request.kind(), request.iter_id());
                shared.handle_transmit(request);
                let msg = Msg::Response {
                    seq,
                    status: Status::success(),
                };
                tx.send(&msg).await?;
            }
            Msg::LoadDataBlock { seq, request } => {
                let status = shared.handle_data_block(&request);
                tx.send(&Msg::Response { seq, status }).await?;
            }
            Msg::Control(Command::Disconnect) => {
                info!("peer closed its transmit stream");
                shared.peer_closed();
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                return Ok(());
            }
            Msg::Err(text) => return Err(BridgeError::Remote(text)),
            msg => {
                warn!("unexpected {} message from peer", msg.kind());
                let text = format!("unexpected {} message", msg.kind());
                tx.send(&Msg::Err(text)).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alerts_fire_on_period_boundaries() {
        let alert = Duration::from_secs(10);
        assert_eq!(next_alert_in(Duration::ZERO, alert), alert);
        assert_eq!(next_alert_in(Duration::from_secs(4), alert), Duration::from_secs(6));
        assert_eq!(next_alert_in(Duration::from_secs(13), alert), Duration::from_secs(7));
    }
}
