//! Server batch loop
//!
//! Live streams start at the session index and follow it; history streams
//! cover the requested range below the session index and then end. At most
//! one batch is outstanding: the next is cut only after the client's
//! `WantedHashes` for the previous one has been served.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Message, OfferedHashes, Priority, Range, Side, Stream, WantedHashes};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::peer::Peer;
use crate::ports::Server;

#[derive(Clone, Copy, Debug)]
pub(crate) enum ServeMode {
    Live,
    History(Range),
}

pub(crate) struct ServerTask {
    pub peer: Arc<Peer>,
    pub stream: Stream,
    pub priority: Priority,
    pub server: Arc<dyn Server>,
    pub mode: ServeMode,
    /// Boundary between history and live, fixed for the subscription
    pub session: u64,
    pub credit: mpsc::Receiver<WantedHashes>,
    /// Finish the outstanding batch, then exit
    pub stop: CancellationToken,
    pub cancel: CancellationToken,
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub metrics: Arc<Metrics>,
}

impl ServerTask {
    pub async fn run(mut self) -> Result<()> {
        let result = match self.mode {
            ServeMode::Live => self.run_live().await,
            ServeMode::History(range) => self.run_history(range).await,
        };
        self.server.close();
        match &result {
            Ok(()) => debug!(peer = %self.peer.id(), stream = %self.stream, "[qc-05] server closed"),
            Err(SyncError::Canceled) | Err(SyncError::PeerDropped { .. }) => {}
            Err(err @ SyncError::OutOfSession { .. }) => {
                debug!(peer = %self.peer.id(), stream = %self.stream, %err, "[qc-05] server closed")
            }
            Err(err) => warn!(peer = %self.peer.id(), stream = %self.stream, %err, "[qc-05] server failed"),
        }
        result
    }

    async fn run_live(&mut self) -> Result<()> {
        info!(peer = %self.peer.id(), stream = %self.stream, session = self.session, "[qc-05] serving live");
        let mut from = self.session;
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            let to = from.saturating_add(self.batch_size - 1);
            let batch = self.next_batch(from, to).await?;
            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                    _ = self.stop.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }
            if batch.from < self.session {
                return Err(self.out_of_session(batch.from));
            }
            let next = batch.to.checked_add(1);
            self.offer(batch).await?;
            match next {
                Some(next) => from = next,
                None => return Ok(()),
            }
        }
    }

    async fn run_history(&mut self, range: Range) -> Result<()> {
        if range.from >= self.session {
            // Nothing below the boundary: report the empty batch and end
            debug!(peer = %self.peer.id(), stream = %self.stream, from = range.from, session = self.session, "[qc-05] history out of session");
            self.send(Message::OfferedHashes {
                stream: self.stream.clone(),
                batch: OfferedHashes::empty(range.from),
            })?;
            self.quit()?;
            return Err(self.out_of_session(range.from));
        }
        let last = self.session - 1;
        let end = range.upper().map_or(last, |to| to.min(last));
        info!(peer = %self.peer.id(), stream = %self.stream, from = range.from, to = end, "[qc-05] serving history");

        let mut from = range.from;
        while from <= end && !self.stop.is_cancelled() {
            let to = from.saturating_add(self.batch_size - 1).min(end);
            let batch = self.next_batch(from, to).await?;
            if batch.is_empty() {
                break;
            }
            if batch.from < from || batch.to > end {
                return Err(self.out_of_session(batch.from));
            }
            from = batch.to + 1;
            self.offer(batch).await?;
        }
        if self.stop.is_cancelled() {
            // The client asked to stop; a quit now could end its next subscription
            return Ok(());
        }
        self.quit()
    }

    async fn next_batch(&self, from: u64, to: u64) -> Result<OfferedHashes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Canceled),
            batch = self.server.set_next_batch(from, to) => batch,
        }
    }

    /// Offer a batch, wait for the client's answer, deliver what it wants
    async fn offer(&mut self, batch: OfferedHashes) -> Result<()> {
        self.send(Message::OfferedHashes {
            stream: self.stream.clone(),
            batch: batch.clone(),
        })?;
        self.metrics.record_batch_offered();
        debug!(peer = %self.peer.id(), stream = %self.stream, from = batch.from, to = batch.to, "[qc-05] offered");

        let wanted = loop {
            let wanted = tokio::select! {
                biased;
                wanted = self.credit.recv() => wanted,
                _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                _ = self.stop.cancelled() => return Ok(()),
            };
            let Some(wanted) = wanted else {
                return Err(SyncError::Canceled);
            };
            // Answers to an earlier subscription's offers end below this batch
            if wanted.to < batch.from {
                debug!(peer = %self.peer.id(), stream = %self.stream, from = wanted.from, to = wanted.to, "[qc-05] stale wanted hashes");
                continue;
            }
            break wanted;
        };
        if (wanted.from, wanted.to) != (batch.from, batch.to) {
            warn!(
                peer = %self.peer.id(),
                stream = %self.stream,
                offered = %format!("{}-{}", batch.from, batch.to),
                wanted = %format!("{}-{}", wanted.from, wanted.to),
                "[qc-05] wanted hashes do not match the offer"
            );
            return Ok(());
        }

        for pos in wanted.positions() {
            let Some(key) = batch.key_at(pos) else {
                break;
            };
            let data = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                data = self.server.get_data(&key) => data,
            };
            match data {
                Ok(data) => {
                    self.send(Message::ChunkDelivery { key, data })?;
                    self.metrics.record_chunk_sent();
                }
                Err(err) => {
                    warn!(peer = %self.peer.id(), stream = %self.stream, key = %hex::encode(key), %err, "[qc-05] wanted chunk unavailable")
                }
            }
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        self.peer.send(&message, self.priority)
    }

    fn quit(&self) -> Result<()> {
        self.send(Message::Quit {
            stream: self.stream.clone(),
            side: Side::Server,
        })
    }

    fn out_of_session(&self, from: u64) -> SyncError {
        SyncError::OutOfSession {
            stream: self.stream.to_string(),
            from,
            session: self.session,
        }
    }
}
