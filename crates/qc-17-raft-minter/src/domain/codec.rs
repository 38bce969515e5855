//! Canonical encoding of blocks and membership changes
//!
//! Both are RLP lists of fields in declared order. Decoders read the fields
//! they know and ignore any trailing ones, so newer nodes can append fields
//! without breaking older replicas.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use shared_types::entities::{Address, SignedTransaction, U256};

use super::block::Block;
use crate::raft::log::MembershipChange;

const BLOCK_FIELDS: usize = 7;
const TX_FIELDS: usize = 8;
const MEMBERSHIP_FIELDS: usize = 3;

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(BLOCK_FIELDS);
        s.append(&self.parent_hash.to_vec());
        s.append(&self.height);
        s.append(&self.timestamp);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            append_transaction(s, tx);
        }
        s.append(&self.gas_used);
        s.append(&self.state_root.to_vec());
        s.append(&self.minter_id);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_fields(rlp, BLOCK_FIELDS)?;
        let transactions = rlp
            .at(3)?
            .iter()
            .map(|item| decode_transaction(&item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            parent_hash: fixed_bytes(rlp, 0)?,
            height: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            transactions,
            gas_used: rlp.val_at(4)?,
            state_root: fixed_bytes(rlp, 5)?,
            minter_id: rlp.val_at(6)?,
        })
    }
}

impl Encodable for MembershipChange {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(MEMBERSHIP_FIELDS);
        match self {
            MembershipChange::AddPeer { raft_id, address } => {
                s.append(&0u8);
                s.append(raft_id);
                s.append(address);
            }
            MembershipChange::RemovePeer { raft_id } => {
                s.append(&1u8);
                s.append(raft_id);
                s.append(&String::new());
            }
        }
    }
}

impl Decodable for MembershipChange {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_fields(rlp, MEMBERSHIP_FIELDS)?;
        let op: u8 = rlp.val_at(0)?;
        let raft_id: u64 = rlp.val_at(1)?;
        match op {
            0 => Ok(MembershipChange::AddPeer {
                raft_id,
                address: rlp.val_at(2)?,
            }),
            1 => Ok(MembershipChange::RemovePeer { raft_id }),
            _ => Err(DecoderError::Custom("unknown membership op")),
        }
    }
}

/// Encode a block for a raft entry
pub fn encode_block(block: &Block) -> Vec<u8> {
    rlp::encode(block).to_vec()
}

/// Decode a block from a raft entry
pub fn decode_block(bytes: &[u8]) -> crate::Result<Block> {
    Ok(rlp::decode(bytes)?)
}

fn append_transaction(s: &mut RlpStream, tx: &SignedTransaction) {
    s.begin_list(TX_FIELDS);
    s.append(&tx.from.to_vec());
    s.append(&tx.to.map(|to| to.to_vec()).unwrap_or_default());
    s.append(&u256_bytes(&tx.value));
    s.append(&tx.nonce);
    s.append(&u256_bytes(&tx.gas_price));
    s.append(&tx.gas_limit);
    s.append(&tx.data);
    s.append(&tx.signature.to_vec());
}

fn decode_transaction(rlp: &Rlp) -> Result<SignedTransaction, DecoderError> {
    expect_fields(rlp, TX_FIELDS)?;
    let to: Vec<u8> = rlp.val_at(1)?;
    let to = match to.len() {
        0 => None,
        20 => {
            let mut address: Address = [0u8; 20];
            address.copy_from_slice(&to);
            Some(address)
        }
        _ => return Err(DecoderError::Custom("recipient must be 0 or 20 bytes")),
    };
    let value: Vec<u8> = rlp.val_at(2)?;
    let gas_price: Vec<u8> = rlp.val_at(4)?;
    Ok(SignedTransaction {
        from: fixed_bytes(rlp, 0)?,
        to,
        value: U256::from_big_endian(&value),
        nonce: rlp.val_at(3)?,
        gas_price: U256::from_big_endian(&gas_price),
        gas_limit: rlp.val_at(5)?,
        data: rlp.val_at(6)?,
        signature: fixed_bytes(rlp, 7)?,
    })
}

fn expect_fields(rlp: &Rlp, known: usize) -> Result<(), DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    // Extra trailing fields are allowed.
    if rlp.item_count()? < known {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    Ok(())
}

fn fixed_bytes<const N: usize>(rlp: &Rlp, index: usize) -> Result<[u8; N], DecoderError> {
    let bytes: Vec<u8> = rlp.val_at(index)?;
    bytes
        .try_into()
        .map_err(|_| DecoderError::Custom("fixed-width field has wrong length"))
}

fn u256_bytes(value: &U256) -> Vec<u8> {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    let first = out.iter().position(|b| *b != 0).unwrap_or(32);
    out[first..].to_vec()
}
