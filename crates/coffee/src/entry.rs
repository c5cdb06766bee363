//! Ledger entries, source positions, and mirror records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 20-byte account or contract address.
pub type Address = [u8; 20];

/// Longest accepted author name, in bytes.
pub const MAX_AUTHOR_BYTES: usize = 255;

/// Longest accepted memo message, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Why an entry failed ingress validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("author is empty")]
    EmptyAuthor,
    #[error("message is empty")]
    EmptyMessage,
    #[error("author is {0} bytes, limit is {MAX_AUTHOR_BYTES}")]
    AuthorTooLong(usize),
    #[error("message is {0} bytes, limit is {MAX_MESSAGE_BYTES}")]
    MessageTooLong(usize),
}

/// Checks the author/message pair accepted by `Coffee.buyCoffee`.
pub fn validate_memo(author: &str, message: &str) -> Result<(), EntryError> {
    if author.is_empty() {
        return Err(EntryError::EmptyAuthor);
    }
    if message.is_empty() {
        return Err(EntryError::EmptyMessage);
    }
    if author.len() > MAX_AUTHOR_BYTES {
        return Err(EntryError::AuthorTooLong(author.len()));
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(EntryError::MessageTooLong(message.len()));
    }
    Ok(())
}

/// One memo as recorded by the ledger. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger-assigned, gapless, strictly increasing.
    pub sequence: u64,
    pub author: String,
    pub message: String,
    /// Payment in the smallest unit (wei).
    pub amount: u128,
    /// Block time, unix seconds.
    pub timestamp: u64,
    #[serde(with = "hex_array")]
    pub sender: Address,
}

impl LedgerEntry {
    pub fn validate(&self) -> Result<(), EntryError> {
        validate_memo(&self.author, &self.message)
    }
}

/// Where an entry sits in the underlying source (block height + log index).
///
/// Ordering is by `(block_number, log_index)`; `block_hash` identifies the fork
/// the position was observed on and is what reorg detection compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub block_number: u64,
    pub log_index: u64,
    #[serde(with = "hex_array")]
    pub block_hash: [u8; 32],
}

impl SourcePosition {
    pub fn new(block_number: u64, log_index: u64, block_hash: [u8; 32]) -> Self {
        Self {
            block_number,
            log_index,
            block_hash,
        }
    }

    /// Position covering every log in `block_number`.
    pub fn end_of_block(block_number: u64, block_hash: [u8; 32]) -> Self {
        Self::new(block_number, u64::MAX, block_hash)
    }

    pub fn ordinal(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    pub fn is_after(&self, other: &SourcePosition) -> bool {
        self.ordinal() > other.ordinal()
    }
}

/// Mirrored projection of a [LedgerEntry], keyed by sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub entry: LedgerEntry,
    pub position: SourcePosition,
}

impl MirrorRecord {
    pub fn new(entry: LedgerEntry, position: SourcePosition) -> Self {
        Self { entry, position }
    }

    pub fn sequence(&self) -> u64 {
        self.entry.sequence
    }
}

/// Serde adapter: fixed-size byte arrays as `0x`-prefixed hex strings.
pub(crate) mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("expected {} bytes, got {}", N, b.len())))
    }
}
