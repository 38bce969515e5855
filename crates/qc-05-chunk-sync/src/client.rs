//! Client batch loop
//!
//! One task per (peer, stream): take an offered batch, ask the client which
//! keys it still needs, send `WantedHashes`, wait for the fetches, record
//! the batch in the interval store, then hand out a takeover proof if the
//! client produces one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::IntervalStore;
use crate::domain::{Intervals, Message, OfferedHashes, Priority, Stream, WantedHashes};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::peer::{settle, ClientStatus, Peer};
use crate::ports::Client;

pub(crate) struct ClientTask {
    pub peer: Arc<Peer>,
    pub stream: Stream,
    pub priority: Priority,
    pub client: Arc<dyn Client>,
    pub intervals: Arc<IntervalStore>,
    /// Indices already recorded; never fetched again
    pub covered: Intervals,
    pub offered: mpsc::Receiver<OfferedHashes>,
    pub status: Arc<watch::Sender<ClientStatus>>,
    pub stop: CancellationToken,
    pub cancel: CancellationToken,
    pub batch_timeout: Duration,
    pub metrics: Arc<Metrics>,
}

impl ClientTask {
    pub async fn run(mut self) {
        let status = loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ClientStatus::Canceled,
                _ = self.stop.cancelled() => None,
                batch = self.offered.recv() => match batch {
                    Some(batch) => Some(batch),
                    None => break ClientStatus::Done,
                },
            };
            let Some(batch) = batch else {
                break self.drain().await;
            };
            if let Err(err) = self.process(batch).await {
                if err == SyncError::Canceled {
                    break ClientStatus::Canceled;
                }
                self.metrics.record_batch_failed();
                warn!(peer = %self.peer.id(), stream = %self.stream, %err, "[qc-05] batch abandoned");
            }
        };
        self.client.close();
        debug!(peer = %self.peer.id(), stream = %self.stream, ?status, "[qc-05] client closed");
        settle(&self.status, status);
    }

    /// Finish batches already offered, so progress reaches the interval store
    async fn drain(&mut self) -> ClientStatus {
        while let Ok(batch) = self.offered.try_recv() {
            match self.process(batch).await {
                Ok(()) => {}
                Err(SyncError::Canceled) => return ClientStatus::Canceled,
                Err(err) => {
                    self.metrics.record_batch_failed();
                    warn!(peer = %self.peer.id(), stream = %self.stream, %err, "[qc-05] batch abandoned while draining");
                }
            }
        }
        ClientStatus::Done
    }

    async fn process(&mut self, batch: OfferedHashes) -> Result<()> {
        if batch.is_empty() {
            debug!(peer = %self.peer.id(), stream = %self.stream, at = batch.from, "[qc-05] empty batch");
            return Ok(());
        }

        let mut wanted = WantedHashes::none(&batch);
        let mut fetches = Vec::new();
        for (pos, (index, key)) in batch.keys().enumerate() {
            if self.covered.contains(index) {
                continue;
            }
            if let Some(fetch) = self.client.need_data(&key) {
                wanted.want.set(pos, true);
                fetches.push(fetch);
            }
        }
        let count = fetches.len();
        self.peer.send(
            &Message::WantedHashes {
                stream: self.stream.clone(),
                wanted,
            },
            self.priority,
        )?;

        if !fetches.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                result = tokio::time::timeout(self.batch_timeout, try_join_all(fetches)) => {
                    result.map_err(|_| SyncError::Timeout {
                        timeout_ms: self.batch_timeout.as_millis() as u64,
                    })??;
                }
            }
        }

        self.covered = self
            .intervals
            .add(&self.peer.id(), &self.stream, batch.from, batch.to)?;
        self.metrics.record_batch_done();
        debug!(
            peer = %self.peer.id(),
            stream = %self.stream,
            from = batch.from,
            to = batch.to,
            wanted = count,
            "[qc-05] batch done"
        );

        if let Some(proof) = self
            .client
            .batch_done(&self.stream, batch.from, batch.to, batch.root())
        {
            let proof = proof.await?;
            self.peer.send(
                &Message::TakeoverProof {
                    stream: self.stream.clone(),
                    proof,
                },
                self.priority,
            )?;
        }
        Ok(())
    }
}
