//! Connected peer
//!
//! A peer owns one writer task draining four priority queues into the
//! transport, plus the client and server slots of every open stream. The
//! reader task lives in the registry, which dispatches what it decodes.

use bytes::Bytes;
use dashmap::DashMap;
use shared_types::PeerId;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::{Message, OfferedHashes, Priority, Stream, WantedHashes};
use crate::error::{Result, SyncError};
use crate::wire;

/// Lifecycle of a subscription as seen by its client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    Running,
    /// The server ended the stream or the client unsubscribed
    Done,
    /// The peer dropped or the registry shut down
    Canceled,
    /// The server refused the subscription
    Rejected(String),
}

/// Caller-side view of one subscription
#[derive(Clone, Debug)]
pub struct ClientHandle {
    peer: PeerId,
    stream: Stream,
    priority: Priority,
    status: watch::Receiver<ClientStatus>,
}

impl ClientHandle {
    pub(crate) fn new(
        peer: PeerId,
        stream: Stream,
        priority: Priority,
        status: watch::Receiver<ClientStatus>,
    ) -> Self {
        Self {
            peer,
            stream,
            priority,
            status,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ClientStatus::Running
    }

    /// Wait until the subscription reaches a terminal status
    pub async fn finished(&self) -> ClientStatus {
        let mut status = self.status.clone();
        let terminal = match status.wait_for(|s| *s != ClientStatus::Running).await {
            Ok(terminal) => terminal.clone(),
            Err(_) => ClientStatus::Canceled,
        };
        terminal
    }
}

/// Move a status to a terminal value once; later calls are ignored
pub(crate) fn settle(status: &watch::Sender<ClientStatus>, terminal: ClientStatus) {
    status.send_if_modified(|current| {
        if *current == ClientStatus::Running {
            *current = terminal;
            true
        } else {
            false
        }
    });
}

pub(crate) struct ClientSlot {
    pub id: u64,
    pub handle: ClientHandle,
    pub offered: mpsc::Sender<OfferedHashes>,
    pub status: Arc<watch::Sender<ClientStatus>>,
    /// Finish the current batch, then exit
    pub stop: CancellationToken,
    /// Exit immediately
    pub cancel: CancellationToken,
}

impl ClientSlot {
    /// Neither stopping nor settled; a stopping slot is replaced on subscribe
    pub fn is_active(&self) -> bool {
        !self.stop.is_cancelled() && !self.cancel.is_cancelled() && self.handle.is_running()
    }
}

pub(crate) struct ServerSlot {
    pub id: u64,
    pub credit: mpsc::Sender<WantedHashes>,
    pub stop: CancellationToken,
}

pub struct Peer {
    id: PeerId,
    queues: [mpsc::UnboundedSender<Bytes>; Priority::COUNT],
    cancel: CancellationToken,
    reputation: AtomicI32,
    pub(crate) clients: DashMap<Stream, ClientSlot>,
    pub(crate) servers: DashMap<Stream, ServerSlot>,
}

impl Peer {
    /// Create the peer and spawn its writer onto `sink`
    pub(crate) fn start(id: PeerId, sink: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Arc<Self> {
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let (mid_tx, mid_rx) = mpsc::unbounded_channel();
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (top_tx, top_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            id,
            [low_rx, mid_rx, high_rx, top_rx],
            sink,
            cancel.clone(),
        ));
        Arc::new(Self {
            id,
            queues: [low_tx, mid_tx, high_tx, top_tx],
            cancel,
            reputation: AtomicI32::new(0),
            clients: DashMap::new(),
            servers: DashMap::new(),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Queue a message; frames of one priority leave in order
    pub fn send(&self, message: &Message, priority: Priority) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::PeerDropped { peer: self.id });
        }
        let frame = wire::encode(message)?;
        trace!(peer = %self.id, message = message.name(), ?priority, "[qc-05] queue frame");
        self.queues[priority.index()]
            .send(frame)
            .map_err(|_| SyncError::PeerDropped { peer: self.id })
    }

    pub fn reputation(&self) -> i32 {
        self.reputation.load(Ordering::Relaxed)
    }

    /// Lower the reputation by one and return the new value
    pub(crate) fn penalize(&self) -> i32 {
        self.reputation.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_dropped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

async fn write_loop(
    peer: PeerId,
    queues: [mpsc::UnboundedReceiver<Bytes>; Priority::COUNT],
    sink: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let [mut low, mut mid, mut high, mut top] = queues;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(frame) = top.recv() => frame,
            Some(frame) = high.recv() => frame,
            Some(frame) = mid.recv() => frame,
            Some(frame) = low.recv() => frame,
            else => break,
        };
        if sink.send(frame).await.is_err() {
            debug!(%peer, "[qc-05] transport closed under writer");
            break;
        }
    }
}
