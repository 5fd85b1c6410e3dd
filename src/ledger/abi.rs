//! Minimal ABI plumbing for the part-registry contract.
//!
//! The reader only needs two shapes: the calldata for
//! `getPartHistory(bytes32)` and the decoder for its return value, a
//! dynamic array of `(uint8 status, uint256 timestamp, string metadata)`
//! tuples. Log topics are derived straight from the event signatures.

use alloy_primitives::{hex, keccak256, B256};
use thiserror::Error;

use crate::core::{MutationKind, PartHash};

const WORD: usize = 32;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("invalid hex in ledger response: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("truncated ledger response: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("ledger value out of range for {field}")]
    Overflow { field: &'static str },
    #[error("metadata is not valid utf-8")]
    Utf8,
}

/// One history entry as the contract returns it, before it is mapped to a
/// domain event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPartEvent {
    pub status: u8,
    pub timestamp_sec: u64,
    pub metadata: String,
}

/// `0x`-prefixed calldata for `getPartHistory(bytes32)`.
pub fn history_call_data(part_hash: &PartHash) -> String {
    let selector = &keccak256(b"getPartHistory(bytes32)")[..4];
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(selector);
    data.extend_from_slice(part_hash.as_bytes());
    format!("0x{}", hex::encode(data))
}

/// Log topic for one lifecycle event kind.
pub fn event_topic(kind: MutationKind) -> B256 {
    keccak256(kind.event_signature().as_bytes())
}

/// Decode the return data of `getPartHistory`.
pub fn decode_history(raw: &str) -> Result<Vec<RawPartEvent>, AbiError> {
    let data = hex::decode(raw.trim_start_matches("0x"))?;
    if data.is_empty() {
        return Ok(Vec::new());
    }

    // Head word points at the array; the array starts with its length,
    // followed by one offset word per element (tuples with a string member
    // are dynamic), each relative to the start of the element area.
    let array_offset = usize_at(&data, 0)?;
    let len = usize_at(&data, array_offset)?;
    let elements_base = array_offset + WORD;

    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let element_offset = usize_at(&data, elements_base + i * WORD)?;
        let tuple_base = elements_base + element_offset;

        let status_word = word_at(&data, tuple_base)?;
        let status =
            u8::try_from(be_u64(status_word)?).map_err(|_| AbiError::Overflow { field: "status" })?;
        let timestamp_sec = be_u64(word_at(&data, tuple_base + WORD)?)?;

        let string_offset = usize_at(&data, tuple_base + 2 * WORD)?;
        let string_base = tuple_base + string_offset;
        let string_len = usize_at(&data, string_base)?;
        let bytes = slice_at(&data, string_base + WORD, string_len)?;
        let metadata = String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::Utf8)?;

        out.push(RawPartEvent {
            status,
            timestamp_sec,
            metadata,
        });
    }
    Ok(out)
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    slice_at(data, offset, WORD)
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AbiError> {
    let end = offset
        .checked_add(len)
        .ok_or(AbiError::Overflow { field: "offset" })?;
    if end > data.len() {
        return Err(AbiError::Truncated {
            offset,
            need: len,
            have: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

/// A 32-byte big-endian word that must fit in u64. History timestamps and
/// offsets always do; anything larger is a malformed response.
fn be_u64(word: &[u8]) -> Result<u64, AbiError> {
    if word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(AbiError::Overflow { field: "word" });
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(buf))
}

fn usize_at(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let value = be_u64(word_at(data, offset)?)?;
    usize::try_from(value).map_err(|_| AbiError::Overflow { field: "offset" })
}
