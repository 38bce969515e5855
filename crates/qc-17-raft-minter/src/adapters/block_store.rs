//! Block store over the shared key-value port
//!
//! | Key                  | Value                         |
//! |----------------------|-------------------------------|
//! | `b/<hash>`           | encoded block                 |
//! | `h/<height, BE u64>` | block hash                    |
//! | `head`               | head hash ++ height (BE u64)  |
//! | `raft/applied`       | last consumed raft index      |

use std::sync::Arc;

use shared_types::entities::{ChainHead, Hash, HASH_SIZE};
use shared_types::{BatchOperation, KeyValueStore, StoreError};

use crate::domain::{decode_block, encode_block, Block};
use crate::error::Result;
use crate::ports::BlockStore;

const BLOCK_PREFIX: &[u8] = b"b/";
const HEIGHT_PREFIX: &[u8] = b"h/";
const HEAD_KEY: &[u8] = b"head";
const APPLIED_KEY: &[u8] = b"raft/applied";

/// [`BlockStore`] backed by any [`KeyValueStore`]
pub struct KvBlockStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvBlockStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn block_key(hash: &Hash) -> Vec<u8> {
        [BLOCK_PREFIX, hash.as_slice()].concat()
    }

    fn height_key(height: u64) -> Vec<u8> {
        [HEIGHT_PREFIX, &height.to_be_bytes()[..]].concat()
    }
}

impl BlockStore for KvBlockStore {
    fn put_block(&self, block: &Block, applied_index: u64) -> Result<()> {
        let hash = block.hash();
        let head = [hash.as_slice(), &block.height.to_be_bytes()[..]].concat();
        self.kv.atomic_batch_write(vec![
            BatchOperation::put(Self::block_key(&hash), encode_block(block)),
            BatchOperation::put(Self::height_key(block.height), hash.to_vec()),
            BatchOperation::put(HEAD_KEY, head),
            BatchOperation::put(APPLIED_KEY, applied_index.to_be_bytes().to_vec()),
        ])?;
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        self.kv
            .get(&Self::block_key(hash))?
            .map(|bytes| decode_block(&bytes))
            .transpose()
    }

    fn hash_at(&self, height: u64) -> Result<Option<Hash>> {
        match self.kv.get(&Self::height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(bytes.try_into().map_err(|_| {
                StoreError::corruption(format!("bad hash width at height {height}"))
            })?)),
        }
    }

    fn head(&self) -> Result<Option<ChainHead>> {
        let Some(bytes) = self.kv.get(HEAD_KEY)? else {
            return Ok(None);
        };
        if bytes.len() != HASH_SIZE + 8 {
            return Err(StoreError::corruption("bad head record").into());
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[..HASH_SIZE]);
        let mut height = [0u8; 8];
        height.copy_from_slice(&bytes[HASH_SIZE..]);
        Ok(Some(ChainHead::new(hash, u64::from_be_bytes(height))))
    }

    fn applied_index(&self) -> Result<u64> {
        match self.kv.get(APPLIED_KEY)? {
            None => Ok(0),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| StoreError::corruption("bad applied index"))?;
                Ok(u64::from_be_bytes(bytes))
            }
        }
    }

    fn record_applied_index(&self, index: u64) -> Result<()> {
        self.kv.put(APPLIED_KEY, &index.to_be_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.kv.flush()?;
        Ok(())
    }
}
