//! ABI types and decoding for the Coffee contract.
//!
//! NewMemo event, buyCoffee/withdrawTips calls, and the memoCount()/owner() views.
//! Decode from JSON-RPC log shape and eth_call return; encode calldata for eth_sendTransaction.

use crate::entry::{Address, LedgerEntry, SourcePosition};
use anyhow::{Context, Result};
use serde_json::Value;
use sha3::{Digest, Keccak256};

/// `event NewMemo(uint256 indexed id, address indexed from, uint256 timestamp, uint256 amount, string name, string message)`
pub const NEW_MEMO_SIGNATURE: &str = "NewMemo(uint256,address,uint256,uint256,string,string)";

pub const BUY_COFFEE_SIGNATURE: &str = "buyCoffee(string,string)";
pub const WITHDRAW_SIGNATURE: &str = "withdrawTips()";
pub const MEMO_COUNT_SIGNATURE: &str = "memoCount()";
pub const OWNER_SIGNATURE: &str = "owner()";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// topic0 of NewMemo logs.
pub fn new_memo_topic0() -> [u8; 32] {
    keccak256(NEW_MEMO_SIGNATURE.as_bytes())
}

/// First 4 bytes of keccak256(signature).
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A NewMemo log decoded from eth_getLogs / eth_subscription output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoLog {
    pub entry: LedgerEntry,
    pub position: SourcePosition,
    /// Set by the node when the log was dropped from the canonical chain.
    pub removed: bool,
}

/// True if the log's topic0 is NewMemo.
pub fn log_matches_new_memo(log: &Value, topic0: &[u8; 32]) -> bool {
    let t0 = match log
        .get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
    {
        Some(s) => s,
        None => return false,
    };
    matches!(parse_hex_bytes(t0), Ok(b) if b.as_slice() == topic0)
}

/// Decode a JSON-RPC log into a [MemoLog]. The entry is not validated here.
pub fn decode_memo_log(log_value: &Value) -> Result<MemoLog> {
    let block_number = parse_hex_u64(field_str(log_value, "blockNumber")?)?;
    let log_index = parse_hex_u64(field_str(log_value, "logIndex")?)?;
    let block_hash = parse_hex_bytes_32(field_str(log_value, "blockHash")?)?;
    let data = parse_hex_bytes(field_str(log_value, "data")?)?;
    let removed = log_value
        .get("removed")
        .and_then(|r| r.as_bool())
        .unwrap_or(false);
    let topics = log_value
        .get("topics")
        .and_then(|t| t.as_array())
        .ok_or_else(|| anyhow::anyhow!("Missing topics"))?;
    if topics.len() < 3 {
        anyhow::bail!("Expected at least 3 topics, got {}", topics.len());
    }
    let id_word = parse_hex_bytes_32(topics[1].as_str().ok_or_else(|| anyhow::anyhow!("topic1 not str"))?)?;
    let sequence = word_to_u64(&id_word).context("memo id")?;
    // `from` is indexed (topics[2]); log "address" is the contract that emitted the event.
    let sender = parse_hex_bytes_20(topics[2].as_str().ok_or_else(|| anyhow::anyhow!("topic2 not str"))?)?;

    if data.len() < 128 {
        anyhow::bail!("Data too short for (uint256, uint256, string, string)");
    }
    let timestamp = word_to_u64(word(&data, 0)?).context("timestamp")?;
    let amount = word_to_u128(word(&data, 1)?).context("amount")?;
    let author = read_string(&data, word(&data, 2)?).context("name")?;
    let message = read_string(&data, word(&data, 3)?).context("message")?;

    Ok(MemoLog {
        entry: LedgerEntry {
            sequence,
            author,
            message,
            amount,
            timestamp,
            sender,
        },
        position: SourcePosition::new(block_number, log_index, block_hash),
        removed,
    })
}

/// Calldata for `buyCoffee(name, message)`.
pub fn encode_buy_coffee(name: &str, message: &str) -> Vec<u8> {
    let name_tail = encode_bytes(name.as_bytes());
    let mut out = selector(BUY_COFFEE_SIGNATURE).to_vec();
    out.extend_from_slice(&u64_word(64));
    out.extend_from_slice(&u64_word(64 + name_tail.len() as u64));
    out.extend_from_slice(&name_tail);
    out.extend_from_slice(&encode_bytes(message.as_bytes()));
    out
}

/// Calldata for a call without arguments.
pub fn encode_no_args(signature: &str) -> Vec<u8> {
    selector(signature).to_vec()
}

/// Decode a single `uint256` return value that must fit in u64.
pub fn decode_u64_return(data: &[u8]) -> Result<u64> {
    word_to_u64(word(data, 0)?)
}

/// Decode a single `address` return value.
pub fn decode_address_return(data: &[u8]) -> Result<Address> {
    let w = word(data, 0)?;
    if w[..12].iter().any(|b| *b != 0) {
        anyhow::bail!("address word has dirty high bytes");
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&w[12..]);
    Ok(out)
}

fn field_str<'a>(log_value: &'a Value, key: &str) -> Result<&'a str> {
    log_value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing {}", key))
}

fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    data.get(index * 32..index * 32 + 32)
        .ok_or_else(|| anyhow::anyhow!("Data too short for word {}", index))
}

fn word_to_u64(w: &[u8]) -> Result<u64> {
    if w.len() != 32 || w[..24].iter().any(|b| *b != 0) {
        anyhow::bail!("uint256 does not fit in u64");
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&w[24..]);
    Ok(u64::from_be_bytes(buf))
}

fn word_to_u128(w: &[u8]) -> Result<u128> {
    if w.len() != 32 || w[..16].iter().any(|b| *b != 0) {
        anyhow::bail!("uint256 does not fit in u128");
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&w[16..]);
    Ok(u128::from_be_bytes(buf))
}

fn read_string(data: &[u8], offset_word: &[u8]) -> Result<String> {
    let offset = usize::try_from(word_to_u64(offset_word)?).context("string offset")?;
    let start = offset
        .checked_add(32)
        .ok_or_else(|| anyhow::anyhow!("String offset {} out of range", offset))?;
    let len_word = data
        .get(offset..start)
        .ok_or_else(|| anyhow::anyhow!("Data too short for string at offset {}", offset))?;
    let len = usize::try_from(word_to_u64(len_word)?).context("string length")?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow::anyhow!("String length {} out of range", len))?;
    let bytes = data
        .get(start..end)
        .ok_or_else(|| anyhow::anyhow!("Data too short for string len {}", len))?;
    String::from_utf8(bytes.to_vec()).context("string is not UTF-8")
}

fn u64_word(n: u64) -> [u8; 32] {
    let mut w = [0u8; 32];
    w[24..].copy_from_slice(&n.to_be_bytes());
    w
}

/// Length word followed by the bytes, right-padded to a 32-byte boundary.
fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = u64_word(bytes.len() as u64).to_vec();
    out.extend_from_slice(bytes);
    let pad = (32 - bytes.len() % 32) % 32;
    out.resize(out.len() + pad, 0);
    out
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}

pub(crate) fn parse_hex_u128(s: &str) -> Result<u128> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(s, 16).context("parse hex u128")
}

pub(crate) fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).context("parse hex bytes")
}

pub(crate) fn parse_hex_bytes_32(s: &str) -> Result<[u8; 32]> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("Expected 32 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub(crate) fn parse_hex_bytes_20(s: &str) -> Result<Address> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() == 20 {
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    } else if bytes.len() == 32 {
        // Indexed address in EVM is 32 bytes (left-padded); take last 20.
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[12..32]);
        Ok(out)
    } else {
        anyhow::bail!("Expected 20 or 32 bytes for address, got {}", bytes.len());
    }
}

/// Build the JSON-RPC log shape for a memo. Used by tests that feed decoders directly.
#[cfg(test)]
pub(crate) fn memo_log_json(entry: &LedgerEntry, position: &SourcePosition, removed: bool) -> Value {
    let mut data = Vec::new();
    data.extend_from_slice(&u64_word(entry.timestamp));
    let mut amount = [0u8; 32];
    amount[16..].copy_from_slice(&entry.amount.to_be_bytes());
    data.extend_from_slice(&amount);
    let name_tail = encode_bytes(entry.author.as_bytes());
    data.extend_from_slice(&u64_word(128));
    data.extend_from_slice(&u64_word(128 + name_tail.len() as u64));
    data.extend_from_slice(&name_tail);
    data.extend_from_slice(&encode_bytes(entry.message.as_bytes()));
    let mut from_topic = [0u8; 32];
    from_topic[12..].copy_from_slice(&entry.sender);
    serde_json::json!({
        "address": format!("0x{}", hex::encode([0x42u8; 20])),
        "topics": [
            format!("0x{}", hex::encode(new_memo_topic0())),
            format!("0x{}", hex::encode(u64_word(entry.sequence))),
            format!("0x{}", hex::encode(from_topic)),
        ],
        "data": format!("0x{}", hex::encode(data)),
        "blockNumber": format!("0x{:x}", position.block_number),
        "blockHash": format!("0x{}", hex::encode(position.block_hash)),
        "logIndex": format!("0x{:x}", position.log_index),
        "transactionHash": format!("0x{}", hex::encode([0x77u8; 32])),
        "removed": removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> LedgerEntry {
        LedgerEntry {
            sequence: 1,
            author: "alice".into(),
            message: "nice work".into(),
            amount: 1000,
            timestamp: 1_700_000_012,
            sender: [0x11; 20],
        }
    }

    #[test]
    fn known_selectors() {
        // keccak256("transfer(address,uint256)") starts with a9059cbb.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(keccak256(b"").len(), 32);
    }

    #[test]
    fn decode_log_reads_all_fields() {
        let position = SourcePosition::new(0x1234, 2, [0x5a; 32]);
        let log = memo_log_json(&alice(), &position, false);
        assert!(log_matches_new_memo(&log, &new_memo_topic0()));
        let decoded = decode_memo_log(&log).unwrap();
        assert_eq!(decoded.entry, alice());
        assert_eq!(decoded.position, position);
        assert!(!decoded.removed);
    }

    #[test]
    fn decode_log_flags_removed() {
        let log = memo_log_json(&alice(), &SourcePosition::new(9, 0, [1; 32]), true);
        assert!(decode_memo_log(&log).unwrap().removed);
    }

    #[test]
    fn decode_log_rejects_truncated_data() {
        let mut log = memo_log_json(&alice(), &SourcePosition::new(9, 0, [1; 32]), false);
        log["data"] = Value::String("0x00".into());
        assert!(decode_memo_log(&log).is_err());
    }

    #[test]
    fn decode_log_rejects_huge_string_offset_and_length() {
        let position = SourcePosition::new(9, 0, [1; 32]);
        let log = memo_log_json(&alice(), &position, false);
        let mut data = parse_hex_bytes(log["data"].as_str().unwrap()).unwrap();

        let mut bad_offset = data.clone();
        bad_offset[64..96].copy_from_slice(&u64_word(u64::MAX));
        let mut patched = log.clone();
        patched["data"] = Value::String(format!("0x{}", hex::encode(&bad_offset)));
        assert!(decode_memo_log(&patched).is_err());

        // name length word sits at the name offset (128)
        data[128..160].copy_from_slice(&u64_word(u64::MAX));
        let mut patched = log;
        patched["data"] = Value::String(format!("0x{}", hex::encode(&data)));
        assert!(decode_memo_log(&patched).is_err());
    }

    #[test]
    fn foreign_topic_does_not_match() {
        let mut log = memo_log_json(&alice(), &SourcePosition::new(9, 0, [1; 32]), false);
        log["topics"][0] = Value::String(format!("0x{}", hex::encode([0u8; 32])));
        assert!(!log_matches_new_memo(&log, &new_memo_topic0()));
    }

    #[test]
    fn buy_coffee_calldata_layout() {
        let data = encode_buy_coffee("bob", "cheers");
        assert_eq!(&data[..4], &selector(BUY_COFFEE_SIGNATURE));
        let body = &data[4..];
        // two head words, then (len, padded) for each string
        assert_eq!(body.len(), 32 * 2 + 64 + 64);
        assert_eq!(decode_u64_return(&body[0..32]).unwrap(), 64);
        assert_eq!(decode_u64_return(&body[32..64]).unwrap(), 128);
        assert_eq!(decode_u64_return(&body[64..96]).unwrap(), 3);
        assert_eq!(&body[96..99], b"bob");
        assert_eq!(&body[160..166], b"cheers");
    }

    #[test]
    fn address_return_rejects_dirty_word() {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(&[0xaa; 20]);
        assert_eq!(decode_address_return(&w).unwrap(), [0xaa; 20]);
        w[0] = 1;
        assert!(decode_address_return(&w).is_err());
    }
}
