//! Frame codec
//!
//! ```text
//! frame          = code:u8 | body
//! OfferedHashes  = stream | from:u64 | to:u64 | flags:u8 | hashes | proof?
//! WantedHashes   = stream | from:u64 | to:u64 | bitset[ceil((to-from+1)/8)]
//! stream         = len:u16 | "kind|param|l" or "kind|param|h"
//! ```
//!
//! Integers are big-endian. `hashes` is `HASH_SIZE * (to-from+1)` bytes
//! unless the empty flag is set. Every other message body is bincode.

use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use shared_types::{ChunkAddress, HASH_SIZE};

use crate::domain::{
    HandoverProof, Message, OfferedHashes, Priority, Range, Side, Stream, TakeoverProof,
    WantedHashes,
};
use crate::error::{Result, SyncError};

const CODE_REQUEST_SUBSCRIPTION: u8 = 0;
const CODE_OFFERED_HASHES: u8 = 1;
const CODE_WANTED_HASHES: u8 = 2;
const CODE_CHUNK_DELIVERY: u8 = 3;
const CODE_TAKEOVER_PROOF: u8 = 4;
const CODE_QUIT: u8 = 5;
const CODE_SUBSCRIBE_ERROR: u8 = 6;
const CODE_RETRIEVE_REQUEST: u8 = 7;

const FLAG_EMPTY: u8 = 0b01;
const FLAG_PROOF: u8 = 0b10;

#[derive(Serialize, Deserialize)]
struct SubscriptionBody {
    stream: Stream,
    range: Option<Range>,
    priority: Priority,
}

#[derive(Serialize, Deserialize)]
struct DeliveryBody {
    key: ChunkAddress,
    data: Bytes,
}

#[derive(Serialize, Deserialize)]
struct TakeoverBody {
    stream: Stream,
    proof: TakeoverProof,
}

#[derive(Serialize, Deserialize)]
struct QuitBody {
    stream: Stream,
    side: Side,
}

#[derive(Serialize, Deserialize)]
struct SubscribeErrorBody {
    stream: Stream,
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct RetrieveBody {
    key: ChunkAddress,
    skip_check: bool,
}

/// Encode a message into one frame
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match message {
        Message::RequestSubscription {
            stream,
            range,
            priority,
        } => put_bincode(
            &mut buf,
            CODE_REQUEST_SUBSCRIPTION,
            &SubscriptionBody {
                stream: stream.clone(),
                range: *range,
                priority: *priority,
            },
        )?,
        Message::OfferedHashes { stream, batch } => {
            buf.put_u8(CODE_OFFERED_HASHES);
            put_stream(&mut buf, stream)?;
            buf.put_u64(batch.from);
            buf.put_u64(batch.to);
            let mut flags = 0;
            if batch.is_empty() {
                flags |= FLAG_EMPTY;
            } else if batch.hashes.len() != batch_width(batch.from, batch.to)? {
                return Err(SyncError::Codec(format!(
                    "batch {}-{} carries {} hash bytes",
                    batch.from,
                    batch.to,
                    batch.hashes.len()
                )));
            }
            if batch.proof.is_some() {
                flags |= FLAG_PROOF;
            }
            buf.put_u8(flags);
            buf.put_slice(&batch.hashes);
            if let Some(proof) = &batch.proof {
                buf.put_slice(&bincode::serialize(proof)?);
            }
        }
        Message::WantedHashes { stream, wanted } => {
            if wanted.want.len() != batch_len(wanted.from, wanted.to)? {
                return Err(SyncError::Codec(format!(
                    "bitset of {} bits for batch {}-{}",
                    wanted.want.len(),
                    wanted.from,
                    wanted.to
                )));
            }
            buf.put_u8(CODE_WANTED_HASHES);
            put_stream(&mut buf, stream)?;
            buf.put_u64(wanted.from);
            buf.put_u64(wanted.to);
            buf.put_slice(wanted.want.as_raw_slice());
        }
        Message::ChunkDelivery { key, data } => put_bincode(
            &mut buf,
            CODE_CHUNK_DELIVERY,
            &DeliveryBody {
                key: *key,
                data: data.clone(),
            },
        )?,
        Message::TakeoverProof { stream, proof } => put_bincode(
            &mut buf,
            CODE_TAKEOVER_PROOF,
            &TakeoverBody {
                stream: stream.clone(),
                proof: proof.clone(),
            },
        )?,
        Message::Quit { stream, side } => put_bincode(
            &mut buf,
            CODE_QUIT,
            &QuitBody {
                stream: stream.clone(),
                side: *side,
            },
        )?,
        Message::SubscribeError { stream, reason } => put_bincode(
            &mut buf,
            CODE_SUBSCRIBE_ERROR,
            &SubscribeErrorBody {
                stream: stream.clone(),
                reason: reason.clone(),
            },
        )?,
        Message::RetrieveRequest { key, skip_check } => put_bincode(
            &mut buf,
            CODE_RETRIEVE_REQUEST,
            &RetrieveBody {
                key: *key,
                skip_check: *skip_check,
            },
        )?,
    }
    Ok(buf.freeze())
}

/// Decode one frame
pub fn decode(mut frame: Bytes) -> Result<Message> {
    if !frame.has_remaining() {
        return Err(SyncError::Codec("empty frame".into()));
    }
    let code = frame.get_u8();
    let message = match code {
        CODE_REQUEST_SUBSCRIPTION => {
            let body: SubscriptionBody = bincode::deserialize(&frame)?;
            Message::RequestSubscription {
                stream: body.stream,
                range: body.range,
                priority: body.priority,
            }
        }
        CODE_OFFERED_HASHES => {
            let stream = get_stream(&mut frame)?;
            let (from, to) = get_bounds(&mut frame)?;
            need(&frame, 1)?;
            let flags = frame.get_u8();
            let hashes = if flags & FLAG_EMPTY != 0 {
                Bytes::new()
            } else {
                let width = batch_width(from, to)?;
                need(&frame, width)?;
                frame.split_to(width)
            };
            let proof = if flags & FLAG_PROOF != 0 {
                Some(bincode::deserialize::<HandoverProof>(&frame)?)
            } else {
                None
            };
            Message::OfferedHashes {
                stream,
                batch: OfferedHashes {
                    from,
                    to,
                    hashes,
                    proof,
                },
            }
        }
        CODE_WANTED_HASHES => {
            let stream = get_stream(&mut frame)?;
            let (from, to) = get_bounds(&mut frame)?;
            let bits = batch_len(from, to)?;
            let width = bits.div_ceil(8);
            need(&frame, width)?;
            let mut want = BitVec::<u8, Lsb0>::from_vec(frame.split_to(width).to_vec());
            want.truncate(bits);
            Message::WantedHashes {
                stream,
                wanted: WantedHashes { from, to, want },
            }
        }
        CODE_CHUNK_DELIVERY => {
            let body: DeliveryBody = bincode::deserialize(&frame)?;
            Message::ChunkDelivery {
                key: body.key,
                data: body.data,
            }
        }
        CODE_TAKEOVER_PROOF => {
            let body: TakeoverBody = bincode::deserialize(&frame)?;
            Message::TakeoverProof {
                stream: body.stream,
                proof: body.proof,
            }
        }
        CODE_QUIT => {
            let body: QuitBody = bincode::deserialize(&frame)?;
            Message::Quit {
                stream: body.stream,
                side: body.side,
            }
        }
        CODE_SUBSCRIBE_ERROR => {
            let body: SubscribeErrorBody = bincode::deserialize(&frame)?;
            Message::SubscribeError {
                stream: body.stream,
                reason: body.reason,
            }
        }
        CODE_RETRIEVE_REQUEST => {
            let body: RetrieveBody = bincode::deserialize(&frame)?;
            Message::RetrieveRequest {
                key: body.key,
                skip_check: body.skip_check,
            }
        }
        other => return Err(SyncError::Codec(format!("unknown message code {other}"))),
    };
    Ok(message)
}

fn put_bincode<T: Serialize>(buf: &mut BytesMut, code: u8, body: &T) -> Result<()> {
    buf.put_u8(code);
    buf.put_slice(&bincode::serialize(body)?);
    Ok(())
}

fn put_stream(buf: &mut BytesMut, stream: &Stream) -> Result<()> {
    let text = stream.to_string();
    let len = u16::try_from(text.len())
        .map_err(|_| SyncError::Codec(format!("stream name too long: {}", text.len())))?;
    buf.put_u16(len);
    buf.put_slice(text.as_bytes());
    Ok(())
}

fn get_stream(frame: &mut Bytes) -> Result<Stream> {
    need(frame, 2)?;
    let len = frame.get_u16() as usize;
    need(frame, len)?;
    let raw = frame.split_to(len);
    let text = std::str::from_utf8(&raw).map_err(|e| SyncError::Codec(e.to_string()))?;
    text.parse()
}

fn get_bounds(frame: &mut Bytes) -> Result<(u64, u64)> {
    need(frame, 16)?;
    let from = frame.get_u64();
    let to = frame.get_u64();
    if from > to {
        return Err(SyncError::Codec(format!("inverted batch {from}-{to}")));
    }
    Ok((from, to))
}

fn batch_len(from: u64, to: u64) -> Result<usize> {
    to.checked_sub(from)
        .and_then(|span| usize::try_from(span).ok())
        .and_then(|span| span.checked_add(1))
        .ok_or_else(|| SyncError::Codec(format!("batch {from}-{to} out of range")))
}

fn batch_width(from: u64, to: u64) -> Result<usize> {
    batch_len(from, to)?
        .checked_mul(HASH_SIZE)
        .ok_or_else(|| SyncError::Codec(format!("batch {from}-{to} too wide")))
}

fn need(frame: &Bytes, n: usize) -> Result<()> {
    if frame.remaining() < n {
        return Err(SyncError::Codec(format!(
            "truncated frame: need {n} bytes, have {}",
            frame.remaining()
        )));
    }
    Ok(())
}
