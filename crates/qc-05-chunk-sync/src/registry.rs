//! Stream registry
//!
//! Per-node directory of connected peers and the streams open to them.
//! Frames from a peer are decoded and dispatched by that peer's reader task;
//! clients and servers each run their own batch loop.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use shared_bus::{BlockchainEvent, EventPublisher};
use shared_types::{chunk_address, ChunkAddress, KeyValueStore, NodeId, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapters::IntervalStore;
use crate::client::ClientTask;
use crate::config::{RegistryOptions, Syncing};
use crate::delivery::Delivery;
use crate::domain::kademlia::proximity_bin;
use crate::domain::{Message, OfferedHashes, Priority, Range, Side, Stream, WantedHashes};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::peer::{settle, ClientHandle, ClientSlot, ClientStatus, Peer, ServerSlot};
use crate::ports::{ChunkStore, Client, ClientFactory, Connection, Server, ServerFactory};
use crate::server::{ServeMode, ServerTask};
use crate::sync::{self, sync_stream, SYNC_KIND};

/// Offered batches buffered per client
const OFFERED_BUFFER: usize = 16;

/// `WantedHashes` buffered per server
const CREDIT_BUFFER: usize = 4;

pub struct Registry {
    local: NodeId,
    options: RegistryOptions,
    store: Arc<dyn ChunkStore>,
    intervals: Arc<IntervalStore>,
    bus: Arc<dyn EventPublisher>,
    peers: DashMap<PeerId, Arc<Peer>>,
    client_funcs: RwLock<HashMap<String, ClientFactory>>,
    server_funcs: RwLock<HashMap<String, ServerFactory>>,
    delivery: Delivery,
    metrics: Arc<Metrics>,
    slot_ids: AtomicU64,
    cancel: CancellationToken,
}

impl Registry {
    /// Build a registry; `SYNC` handlers are bound unless syncing is disabled
    pub fn new(
        options: RegistryOptions,
        store: Arc<dyn ChunkStore>,
        kv: Arc<dyn KeyValueStore>,
        bus: Arc<dyn EventPublisher>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(Self {
            local: store.base(),
            delivery: Delivery::new(
                Arc::clone(&store),
                options.retrieve_timeout(),
                options.skip_check,
                Arc::clone(&metrics),
            ),
            options,
            intervals: Arc::new(IntervalStore::new(kv)),
            store,
            bus,
            peers: DashMap::new(),
            client_funcs: RwLock::new(HashMap::new()),
            server_funcs: RwLock::new(HashMap::new()),
            metrics,
            slot_ids: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        if registry.options.syncing.registers() {
            registry.register_client_func(SYNC_KIND, sync::client_factory(Arc::clone(&registry.store)));
            registry.register_server_func(SYNC_KIND, sync::server_factory(Arc::clone(&registry.store)));
        }
        info!(
            local = %registry.local,
            syncing = ?registry.options.syncing,
            retrieval = ?registry.options.retrieval,
            "[qc-05] registry ready"
        );
        Ok(registry)
    }

    pub fn register_client_func(&self, kind: impl Into<String>, factory: ClientFactory) {
        self.client_funcs.write().insert(kind.into(), factory);
    }

    pub fn register_server_func(&self, kind: impl Into<String>, factory: ServerFactory) {
        self.server_funcs.write().insert(kind.into(), factory);
    }

    /// Start serving a connected peer. A peer already present is dropped
    /// and replaced.
    pub async fn add_peer(self: &Arc<Self>, id: PeerId, conn: Connection) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        if self.peers.contains_key(&id) {
            self.quit(&id, "replaced by a new connection").await;
        }
        let peer = Peer::start(id, conn.sender, self.cancel.child_token());
        self.peers.insert(id, Arc::clone(&peer));
        tokio::spawn(Arc::clone(self).read_loop(Arc::clone(&peer), conn.receiver));
        info!(%id, peers = self.peers.len(), "[qc-05] peer added");

        if self.options.syncing == Syncing::AutoSubscribe {
            let bin = proximity_bin(&self.local, id.as_bytes());
            let stream = sync_stream(bin, true);
            if let Err(err) = self
                .subscribe(id, stream, Some(Range::new(0, 0)), Priority::Mid)
                .await
            {
                warn!(%id, bin, %err, "[qc-05] auto-subscribe failed");
            }
        }
        Ok(())
    }

    /// Open a client against `peer` for `stream`.
    ///
    /// - live, no range: live only
    /// - live with a range: live plus its history counterpart over the range
    /// - history: the range, or everything below the session without one
    ///
    /// History resumes at the first index the interval store has not
    /// recorded. A duplicate subscribe returns the existing handle.
    pub async fn subscribe(
        self: &Arc<Self>,
        peer_id: PeerId,
        stream: Stream,
        range: Option<Range>,
        priority: Priority,
    ) -> Result<ClientHandle> {
        let peer = self.peer(&peer_id)?;
        let factory = self
            .client_funcs
            .read()
            .get(&stream.kind)
            .cloned()
            .ok_or_else(|| SyncError::UnknownStream {
                kind: stream.kind.clone(),
            })?;

        if let Some(existing) = peer.clients.get(&stream).filter(|slot| slot.is_active()) {
            let err = SyncError::SubscriptionExists {
                stream: stream.to_string(),
            };
            debug!(peer = %peer_id, %err, "[qc-05] returning existing client");
            return Ok(existing.handle.clone());
        }

        let (handle, request_range) = if stream.live {
            let client = factory(&peer_id, &stream.param, true)?;
            let handle = self.start_client(&peer, stream.clone(), client, priority, 0)?;
            let history = match range {
                Some(range) => self.start_history(&peer, &factory, &stream.history(), range, priority)?,
                None => None,
            };
            (handle, history)
        } else {
            let range = range.unwrap_or(Range::new(0, 0));
            let client = factory(&peer_id, &stream.param, false)?;
            let resumed = self.resume(&peer_id, &stream, range)?;
            let handle = self.start_client(&peer, stream.clone(), client, priority, range.from)?;
            if resumed.is_none() {
                self.finish_client(&peer, &stream);
                return Ok(handle);
            }
            (handle, resumed)
        };

        info!(peer = %peer_id, %stream, range = ?request_range, ?priority, "[qc-05] subscribe");
        peer.send(
            &Message::RequestSubscription {
                stream,
                range: request_range,
                priority,
            },
            priority,
        )?;
        Ok(handle)
    }

    /// Stop the client for `(peer, stream)` after its current batch and ask
    /// the peer to stop serving it. Intervals are kept, so a later subscribe
    /// resumes where this one stopped.
    ///
    /// The slot is released at once; the stopping task keeps only its own
    /// handle. `Quit` goes out at top priority so it always reaches the peer
    /// ahead of a following `RequestSubscription`.
    pub async fn unsubscribe(&self, peer_id: PeerId, stream: &Stream) -> Result<()> {
        let peer = self.peer(&peer_id)?;
        if let Some((_, slot)) = peer.clients.remove(stream) {
            slot.stop.cancel();
        }
        info!(peer = %peer_id, %stream, "[qc-05] unsubscribe");
        peer.send(
            &Message::Quit {
                stream: stream.clone(),
                side: Side::Client,
            },
            Priority::Top,
        )
    }

    /// Drop a peer and every stream open to it. Intervals are kept.
    pub async fn quit(&self, peer_id: &PeerId, reason: &str) {
        let Some((_, peer)) = self.peers.remove(peer_id) else {
            return;
        };
        peer.cancel_token().cancel();
        for slot in peer.clients.iter() {
            settle(&slot.status, ClientStatus::Canceled);
        }
        self.metrics.record_peer_dropped();
        info!(peer = %peer_id, reason, "[qc-05] peer dropped");
        self.bus
            .publish(BlockchainEvent::PeerDropped {
                peer: *peer_id,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Fetch a chunk the local store misses from the closest peer, never
    /// asking `originator`
    pub async fn request_from_peers(
        &self,
        key: ChunkAddress,
        originator: Option<&PeerId>,
    ) -> Result<Bytes> {
        if !self.options.retrieval.can_request() {
            return Err(SyncError::not_found(&key));
        }
        let peers = self
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.delivery
            .request_from_peers(key, peers, originator)
            .await
    }

    /// Drop every peer and refuse new ones
    pub async fn close(&self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.quit(&id, "registry closed").await;
        }
        self.cancel.cancel();
        info!("[qc-05] registry closed");
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn reputation(&self, peer: &PeerId) -> Option<i32> {
        self.peers.get(peer).map(|p| p.reputation())
    }

    /// Handle of the client open for `(peer, stream)`
    pub fn client(&self, peer: &PeerId, stream: &Stream) -> Option<ClientHandle> {
        let peer = self.peers.get(peer)?;
        let slot = peer.clients.get(stream)?;
        Some(slot.handle.clone())
    }

    /// Whether a local server runs for `(peer, stream)`
    pub fn is_serving(&self, peer: &PeerId, stream: &Stream) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|p| p.servers.contains_key(stream))
    }

    pub fn intervals(&self) -> &Arc<IntervalStore> {
        &self.intervals
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn peer(&self, id: &PeerId) -> Result<Arc<Peer>> {
        self.peers
            .get(id)
            .map(|p| Arc::clone(p.value()))
            .ok_or(SyncError::UnknownPeer(*id))
    }

    fn next_slot_id(&self) -> u64 {
        self.slot_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Range to request for a history stream, or `None` when the interval
    /// store already covers all of it
    fn resume(&self, peer: &PeerId, stream: &Stream, range: Range) -> Result<Option<Range>> {
        let intervals = self.intervals.init(peer, stream, range.from)?;
        let (next, _) = intervals.next_from(range.from);
        match range.upper() {
            Some(to) if next > to => Ok(None),
            _ => Ok(Some(Range::new(next, range.to))),
        }
    }

    fn start_history(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        factory: &ClientFactory,
        history: &Stream,
        range: Range,
        priority: Priority,
    ) -> Result<Option<Range>> {
        if peer.clients.get(history).is_some_and(|slot| slot.is_active()) {
            return Ok(None);
        }
        let Some(resumed) = self.resume(&peer.id(), history, range)? else {
            return Ok(None);
        };
        let client = factory(&peer.id(), &history.param, false)?;
        self.start_client(peer, history.clone(), client, priority, range.from)?;
        Ok(Some(resumed))
    }

    fn start_client(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        stream: Stream,
        client: Arc<dyn Client>,
        priority: Priority,
        start: u64,
    ) -> Result<ClientHandle> {
        let covered = self.intervals.init(&peer.id(), &stream, start)?;
        let (offered_tx, offered_rx) = mpsc::channel(OFFERED_BUFFER);
        let (status_tx, status_rx) = watch::channel(ClientStatus::Running);
        let status = Arc::new(status_tx);
        let stop = CancellationToken::new();
        let cancel = peer.cancel_token().child_token();
        let handle = ClientHandle::new(peer.id(), stream.clone(), priority, status_rx);
        let id = self.next_slot_id();

        peer.clients.insert(
            stream.clone(),
            ClientSlot {
                id,
                handle: handle.clone(),
                offered: offered_tx,
                status: Arc::clone(&status),
                stop: stop.clone(),
                cancel: cancel.clone(),
            },
        );

        let task = ClientTask {
            peer: Arc::clone(peer),
            stream: stream.clone(),
            priority,
            client,
            intervals: Arc::clone(&self.intervals),
            covered,
            offered: offered_rx,
            status,
            stop,
            cancel,
            batch_timeout: self.options.batch_timeout(),
            metrics: Arc::clone(&self.metrics),
        };
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            task.run().await;
            peer.clients.remove_if(&stream, |_, slot| slot.id == id);
        });
        Ok(handle)
    }

    /// End a client whose range is already recorded
    fn finish_client(&self, peer: &Peer, stream: &Stream) {
        if let Some(slot) = peer.clients.get(stream) {
            slot.stop.cancel();
        }
    }

    fn start_server(
        &self,
        peer: &Arc<Peer>,
        stream: Stream,
        server: Arc<dyn Server>,
        mode: ServeMode,
        session: u64,
        priority: Priority,
    ) {
        let (credit_tx, credit_rx) = mpsc::channel(CREDIT_BUFFER);
        let stop = CancellationToken::new();
        let id = self.next_slot_id();
        peer.servers.insert(
            stream.clone(),
            ServerSlot {
                id,
                credit: credit_tx,
                stop: stop.clone(),
            },
        );
        let task = ServerTask {
            peer: Arc::clone(peer),
            stream: stream.clone(),
            priority,
            server,
            mode,
            session,
            credit: credit_rx,
            stop,
            cancel: peer.cancel_token().child_token(),
            batch_size: self.options.batch_size,
            poll_interval: self.options.live_poll_interval(),
            metrics: Arc::clone(&self.metrics),
        };
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            let _ = task.run().await;
            peer.servers.remove_if(&stream, |_, slot| slot.id == id);
        });
    }

    async fn read_loop(self: Arc<Self>, peer: Arc<Peer>, mut incoming: mpsc::Receiver<Bytes>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = peer.cancel_token().cancelled() => return,
                frame = incoming.recv() => frame,
            };
            let Some(frame) = frame else {
                self.quit(&peer.id(), "transport closed").await;
                return;
            };
            let message = match crate::wire::decode(frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(peer = %peer.id(), %err, "[qc-05] undecodable frame");
                    continue;
                }
            };
            trace!(peer = %peer.id(), message = message.name(), "[qc-05] received");
            if let Err(err) = self.handle(&peer, message).await {
                if err.is_fatal() {
                    warn!(peer = %peer.id(), %err, "[qc-05] fatal error, dropping peer");
                    self.quit(&peer.id(), &err.to_string()).await;
                    return;
                }
                debug!(peer = %peer.id(), %err, "[qc-05] message handling failed");
            }
        }
    }

    async fn handle(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) -> Result<()> {
        match message {
            Message::RequestSubscription {
                stream,
                range,
                priority,
            } => self.serve_subscription(peer, stream, range, priority),
            Message::OfferedHashes { stream, batch } => self.on_offered(peer, stream, batch).await,
            Message::WantedHashes { stream, wanted } => self.on_wanted(peer, stream, wanted).await,
            Message::ChunkDelivery { key, data } => self.on_chunk(peer, key, data).await,
            Message::TakeoverProof { stream, proof } => {
                debug!(peer = %peer.id(), %stream, from = proof.from, to = proof.to, "[qc-05] takeover proof");
                Ok(())
            }
            Message::Quit { stream, side } => {
                self.on_quit(peer, &stream, side);
                Ok(())
            }
            Message::SubscribeError { stream, reason } => {
                warn!(peer = %peer.id(), %stream, %reason, "[qc-05] subscription rejected");
                if let Some((_, slot)) = peer.clients.remove(&stream) {
                    settle(&slot.status, ClientStatus::Rejected(reason));
                    slot.cancel.cancel();
                }
                Ok(())
            }
            Message::RetrieveRequest { key, skip_check } => {
                self.on_retrieve(peer, key, skip_check);
                Ok(())
            }
        }
    }

    fn serve_subscription(
        &self,
        peer: &Arc<Peer>,
        stream: Stream,
        range: Option<Range>,
        priority: Priority,
    ) -> Result<()> {
        let reject = |reason: String| {
            warn!(peer = %peer.id(), %stream, %reason, "[qc-05] rejecting subscription");
            peer.send(
                &Message::SubscribeError {
                    stream: stream.clone(),
                    reason,
                },
                priority,
            )
        };

        let Some(factory) = self.server_funcs.read().get(&stream.kind).cloned() else {
            return reject(
                SyncError::UnknownStream {
                    kind: stream.kind.clone(),
                }
                .to_string(),
            );
        };
        if peer.servers.contains_key(&stream) {
            debug!(peer = %peer.id(), %stream, "[qc-05] already serving");
            return Ok(());
        }
        if peer.servers.len() >= self.options.max_peer_servers {
            return reject(
                SyncError::TooManyServers {
                    limit: self.options.max_peer_servers,
                }
                .to_string(),
            );
        }

        let built = if stream.live {
            factory(&peer.id(), &stream.param, true).and_then(|live| {
                let history = match range {
                    Some(range) => Some((factory(&peer.id(), &stream.param, false)?, range)),
                    None => None,
                };
                let session = live.session_index()?;
                Ok((live, ServeMode::Live, session, history))
            })
        } else {
            factory(&peer.id(), &stream.param, false).and_then(|server| {
                let session = server.session_index()?;
                let range = range.unwrap_or(Range::new(0, 0));
                Ok((server, ServeMode::History(range), session, None))
            })
        };
        let (server, mode, session, history) = match built {
            Ok(built) => built,
            Err(err) => return reject(err.to_string()),
        };

        debug!(peer = %peer.id(), %stream, session, "[qc-05] accepted subscription");
        if let Some((history_server, range)) = history {
            let history_stream = stream.history();
            if !peer.servers.contains_key(&history_stream) {
                self.start_server(
                    peer,
                    history_stream,
                    history_server,
                    ServeMode::History(range),
                    session,
                    priority,
                );
            }
        }
        self.start_server(peer, stream, server, mode, session, priority);
        Ok(())
    }

    async fn on_offered(&self, peer: &Arc<Peer>, stream: Stream, batch: OfferedHashes) -> Result<()> {
        let sender = peer.clients.get(&stream).map(|slot| slot.offered.clone());
        match sender {
            Some(sender) => {
                let _ = sender.send(batch).await;
                Ok(())
            }
            None => {
                debug!(peer = %peer.id(), %stream, "[qc-05] offer for a stream we do not consume");
                peer.send(
                    &Message::Quit {
                        stream,
                        side: Side::Client,
                    },
                    Priority::Low,
                )
            }
        }
    }

    async fn on_wanted(&self, peer: &Arc<Peer>, stream: Stream, wanted: WantedHashes) -> Result<()> {
        let credit = peer.servers.get(&stream).map(|slot| slot.credit.clone());
        if let Some(credit) = credit {
            let _ = credit.send(wanted).await;
        }
        Ok(())
    }

    async fn on_chunk(&self, peer: &Arc<Peer>, key: ChunkAddress, data: Bytes) -> Result<()> {
        if !self.options.skip_check && chunk_address(&data) != key {
            self.metrics.record_chunk_mismatch();
            let reputation = peer.penalize();
            warn!(peer = %peer.id(), key = %hex::encode(key), reputation, "[qc-05] chunk mismatch");
            if reputation <= self.options.reputation_floor {
                self.quit(&peer.id(), "reputation below floor").await;
            }
            return Err(SyncError::mismatch(&key));
        }
        if self.store.put(key, data)? {
            self.metrics.record_chunk_received();
        } else {
            trace!(peer = %peer.id(), key = %hex::encode(key), "[qc-05] duplicate chunk");
        }
        Ok(())
    }

    fn on_quit(&self, peer: &Arc<Peer>, stream: &Stream, side: Side) {
        match side {
            Side::Client => {
                // Released now so a resubscribe right behind the quit is served
                if let Some((_, slot)) = peer.servers.remove(stream) {
                    debug!(peer = %peer.id(), %stream, "[qc-05] peer unsubscribed");
                    slot.stop.cancel();
                }
            }
            Side::Server => {
                if let Some(slot) = peer.clients.get(stream) {
                    debug!(peer = %peer.id(), %stream, "[qc-05] stream ended by server");
                    slot.stop.cancel();
                }
            }
        }
    }

    fn on_retrieve(self: &Arc<Self>, peer: &Arc<Peer>, key: ChunkAddress, skip_check: bool) {
        if !self.options.retrieval.can_serve() {
            trace!(peer = %peer.id(), "[qc-05] retrieval disabled, ignoring request");
            return;
        }
        let registry = Arc::clone(self);
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            let found = match registry.store.get(&key) {
                // A strict requester would reject this copy and penalize us for it
                Ok(Some(data)) if !skip_check && chunk_address(&data) != key => {
                    warn!(peer = %peer.id(), key = %hex::encode(key), "[qc-05] stored chunk fails its hash, not serving");
                    Err(SyncError::mismatch(&key))
                }
                Ok(Some(data)) => Ok(data),
                Ok(None) => registry.request_from_peers(key, Some(&peer.id())).await,
                Err(err) => Err(err),
            };
            match found {
                Ok(data) => {
                    if let Err(err) = peer.send(&Message::ChunkDelivery { key, data }, Priority::Top) {
                        debug!(peer = %peer.id(), %err, "[qc-05] could not answer retrieval");
                    } else {
                        registry.metrics.record_chunk_sent();
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.id(), key = %hex::encode(key), %err, "[qc-05] retrieval miss")
                }
            }
        });
    }
}
