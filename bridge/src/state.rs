//! Bookkeeping of the iterations of both parties.

use std::collections::HashMap;

use comms::msg::{DataMessage, TransmitRequest};
use log::{debug, error, warn};

use crate::{BridgeError, Result};

/// What happened to an incoming transmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Accepted,
    AlreadyCommitted,
    Repeated,
    WithoutStart,
    Mismatch,
    Stale,
}

/// Our open iteration and the peer's progress as observed through its
/// transmit stream.
#[derive(Debug, Default)]
pub(crate) struct IterState {
    pub current_iter_id: Option<u64>,
    pub next_iter_id: u64,
    pub peer_start_iter_id: Option<u64>,
    pub peer_commit_iter_id: Option<u64>,
    received: HashMap<u64, HashMap<String, DataMessage>>,
}

impl IterState {
    /// Opens our iteration `iter_id`.
    pub fn begin(&mut self, iter_id: u64) -> Result<()> {
        if let Some(current) = self.current_iter_id {
            return Err(BridgeError::IterInProgress(current));
        }

        self.current_iter_id = Some(iter_id);
        Ok(())
    }

    /// Closes our open iteration and forgets the peer data received for it.
    ///
    /// # Returns
    /// The id of the closed iteration.
    pub fn finish(&mut self) -> Result<u64> {
        let iter_id = self.current_iter_id.take().ok_or(BridgeError::NotStarted)?;
        self.next_iter_id += 1;
        self.received.remove(&iter_id);
        Ok(iter_id)
    }

    pub fn received(&self, iter_id: u64, name: &str) -> Option<&DataMessage> {
        self.received.get(&iter_id)?.get(name)
    }

    /// Whether the peer already committed `iter_id`.
    pub fn peer_committed(&self, iter_id: u64) -> bool {
        self.peer_commit_iter_id.is_some_and(|commit| iter_id <= commit)
    }

    /// Applies one request of the peer's transmit stream.
    pub fn apply(&mut self, request: TransmitRequest) -> Outcome {
        match request {
            TransmitRequest::Start { iter_id } => self.on_start(iter_id),
            TransmitRequest::Data(data) => self.on_data(data),
            TransmitRequest::Commit { iter_id } => self.on_commit(iter_id),
        }
    }

    fn on_start(&mut self, iter_id: u64) -> Outcome {
        if let Some(commit) = self.peer_commit_iter_id.filter(|&commit| iter_id <= commit) {
            warn!(
                "received peer start iter_id: {iter_id} which has been committed, \
                 maybe caused by resend (peer_commit_iter_id: {commit})"
            );
            return Outcome::AlreadyCommitted;
        }

        if let Some(start) = self.peer_start_iter_id.filter(|&start| iter_id <= start) {
            warn!(
                "received repeated peer start iter_id: {iter_id}, \
                 maybe caused by resend (peer_start_iter_id: {start})"
            );
            return Outcome::Repeated;
        }

        debug!("received peer start iter_id: {iter_id}");
        self.peer_start_iter_id = Some(iter_id);
        Outcome::Accepted
    }

    fn on_data(&mut self, data: DataMessage) -> Outcome {
        let iter_id = data.iter_id;

        let Some(start) = self.peer_start_iter_id else {
            warn!("received data iter_id: {iter_id} without start, maybe caused by resend");
            return Outcome::WithoutStart;
        };

        if start != iter_id {
            warn!(
                "received data iter_id: {iter_id} no match start, \
                 maybe caused by resend (peer_start_iter_id: {start})"
            );
            return Outcome::Mismatch;
        }

        let ours = self.current_iter_id.unwrap_or(self.next_iter_id);
        if iter_id < ours {
            debug!(
                "received data iter_id: {iter_id}, name: {}, ignored by our commit \
                 (current_iter_id: {:?}, next_iter_id: {})",
                data.name, self.current_iter_id, self.next_iter_id
            );
            return Outcome::Stale;
        }

        debug!("received data iter_id: {iter_id}, name: {}", data.name);
        self.received
            .entry(iter_id)
            .or_default()
            .insert(data.name.clone(), data);

        Outcome::Accepted
    }

    fn on_commit(&mut self, iter_id: u64) -> Outcome {
        if let Some(commit) = self.peer_commit_iter_id.filter(|&commit| iter_id <= commit) {
            warn!(
                "received repeated peer commit iter_id: {iter_id}, \
                 maybe caused by resend (peer_commit_iter_id: {commit})"
            );
            return Outcome::Repeated;
        }

        let Some(start) = self.peer_start_iter_id else {
            error!("received peer commit iter_id: {iter_id} without start");
            return Outcome::WithoutStart;
        };

        if start != iter_id {
            error!("received peer commit iter_id: {iter_id} no match start (peer_start_iter_id: {start})");
            return Outcome::Mismatch;
        }

        debug!("received peer commit iter_id: {iter_id}");
        self.peer_start_iter_id = None;
        self.peer_commit_iter_id = Some(iter_id);
        Outcome::Accepted
    }
}
