//! Built-in `SYNC` stream
//!
//! The server side streams one proximity bin of the local chunk store in
//! arrival order; `param` is the bin as a decimal string. The client side
//! pulls whatever the local store is missing.

use async_trait::async_trait;
use bytes::Bytes;
use shared_types::ChunkAddress;
use std::sync::Arc;

use crate::domain::kademlia::MAX_PO;
use crate::domain::{OfferedHashes, Stream};
use crate::error::{Result, SyncError};
use crate::ports::{ChunkStore, Client, ClientFactory, FetchFuture, Server, ServerFactory};

pub const SYNC_KIND: &str = "SYNC";

/// `SYNC` stream over `bin`
pub fn sync_stream(bin: u8, live: bool) -> Stream {
    Stream::new(SYNC_KIND, bin.to_string(), live)
}

pub fn parse_bin(param: &str) -> Result<u8> {
    match param.parse::<u8>() {
        Ok(bin) if bin <= MAX_PO => Ok(bin),
        _ => Err(SyncError::InvalidStream(format!("{SYNC_KIND}|{param}"))),
    }
}

pub struct SyncServer {
    store: Arc<dyn ChunkStore>,
    bin: u8,
}

impl SyncServer {
    pub fn new(store: Arc<dyn ChunkStore>, bin: u8) -> Self {
        Self { store, bin }
    }
}

#[async_trait]
impl Server for SyncServer {
    fn session_index(&self) -> Result<u64> {
        Ok(self.store.bin_index(self.bin))
    }

    async fn set_next_batch(&self, from: u64, to: u64) -> Result<OfferedHashes> {
        let keys = self.store.keys_in_bin(self.bin, from, to)?;
        Ok(OfferedHashes::from_keys(&keys, from))
    }

    async fn get_data(&self, key: &ChunkAddress) -> Result<Bytes> {
        self.store
            .get(key)?
            .ok_or_else(|| SyncError::not_found(key))
    }
}

pub struct SyncClient {
    store: Arc<dyn ChunkStore>,
}

impl SyncClient {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }
}

impl Client for SyncClient {
    fn need_data(&self, key: &ChunkAddress) -> Option<FetchFuture> {
        self.store.fetch_func(key)
    }
}

pub fn server_factory(store: Arc<dyn ChunkStore>) -> ServerFactory {
    Arc::new(move |_peer, param, _live| {
        let bin = parse_bin(param)?;
        Ok(Arc::new(SyncServer::new(Arc::clone(&store), bin)) as Arc<dyn Server>)
    })
}

pub fn client_factory(store: Arc<dyn ChunkStore>) -> ClientFactory {
    Arc::new(move |_peer, param, _live| {
        parse_bin(param)?;
        Ok(Arc::new(SyncClient::new(Arc::clone(&store))) as Arc<dyn Client>)
    })
}
