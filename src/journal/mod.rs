//! The write-ahead event journal.
//!
//! Every sequenced event is persisted before the command it belongs to is
//! reported durable. The on-disk record format is fixed and little-endian:
//!
//! ```text
//! [u32 length][u64 command_seq][u32 event_seq][u16 kind][payload][u32 crc32]
//! ```
//!
//! - `length` counts every byte after itself (14-byte record header tail,
//!   payload, CRC).
//! - The CRC32 covers `command_seq ‖ event_seq ‖ kind ‖ payload`.
//! - Payloads are JSON-encoded [`EngineEvent`]s; their schemas are
//!   versioned by the `kind` field together with the segment header's
//!   schema version.
//!
//! Each segment file opens with a 16-byte header recording a magic and the
//! schema version in force. Reads stop at the first CRC mismatch or short
//! record: a corrupt tail is treated as truncated.

pub mod error;
pub mod file_journal;

pub use error::JournalError;
pub use file_journal::FileJournal;

use crate::events::{EngineEvent, EventRecord};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every segment file.
pub const SEGMENT_MAGIC: [u8; 8] = *b"EXCHWAL\0";

/// Schema version written into segment headers.
pub const SCHEMA_VERSION: u16 = 1;

/// Size of the per-segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Size of the per-record header in bytes:
/// `[4 length][8 command_seq][4 event_seq][2 kind]`.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 4 + 2;

/// Size of the CRC32 trailer in bytes.
pub const RECORD_CRC_SIZE: usize = 4;

/// Total fixed overhead per record.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_CRC_SIZE;

/// When the journal is flushed to stable storage.
///
/// The trade-off: `PerCommand` makes every accepted command durable before
/// it is acknowledged, at one flush per command; `PerBatch` amortizes the
/// flush over `n` commands and can lose up to `n − 1` acknowledged
/// commands on power loss; `IntervalMs` bounds loss by time instead of
/// count. Replay handles any of them — the journal tail is simply shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Flush after every command's event run.
    PerCommand,
    /// Flush every `n` commands.
    PerBatch(u32),
    /// Flush on a timer, at most this many milliseconds apart.
    IntervalMs(u64),
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::PerCommand
    }
}

/// One record read back from the journal.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// The decoded event with its sequencing.
    pub record: EventRecord,
    /// The CRC stored on disk alongside it.
    pub stored_crc: u32,
}

/// Iterator type returned by [`Journal::read_from`].
pub type JournalReadIter = Box<dyn Iterator<Item = Result<JournalEntry, JournalError>>>;

/// An append-only, checksummed event journal.
///
/// Implementations are single-writer (the sequencer) with concurrent
/// readers (replay, subscribers catching up), hence `Send + Sync`.
pub trait Journal: Send + Sync {
    /// Append one event record. The write lands in the journal's buffers;
    /// durability is governed by [`Journal::sync`].
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on serialization or I/O failure.
    fn append(&self, record: &EventRecord) -> Result<(), JournalError>;

    /// Flush appended records to stable storage. Called by the sequencer
    /// at the boundaries selected by [`DurabilityMode`].
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the flush fails; the sequencer
    /// treats that as fatal.
    fn sync(&self) -> Result<(), JournalError>;

    /// Read records with `command_seq >= from`, in order. Records below
    /// the earliest retained segment are unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when segments cannot be opened.
    fn read_from(&self, from: u64) -> Result<JournalReadIter, JournalError>;

    /// The highest `command_seq` appended, or `None` for an empty journal.
    #[must_use]
    fn last_command_seq(&self) -> Option<u64>;

    /// Verify every record's CRC.
    ///
    /// # Errors
    ///
    /// The first corruption found.
    fn verify_integrity(&self) -> Result<(), JournalError>;
}

/// Encode one record into the on-disk format.
///
/// # Errors
///
/// Returns [`JournalError::SerializationError`] when the payload cannot
/// be serialized.
pub fn encode_record(record: &EventRecord) -> Result<Vec<u8>, JournalError> {
    let payload =
        serde_json::to_vec(&record.event).map_err(|e| JournalError::SerializationError {
            message: e.to_string(),
        })?;
    let kind = record.event.kind() as u16;

    let length = u32::try_from(RECORD_HEADER_SIZE - 4 + payload.len() + RECORD_CRC_SIZE).map_err(
        |_| JournalError::SerializationError {
            message: "record size overflow".to_string(),
        },
    )?;

    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&record.command_seq.to_le_bytes());
    buf.extend_from_slice(&record.event_seq.to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = crc32fast::hash(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode one record from `data` at `offset`.
///
/// Returns `Ok(None)` at end-of-data (zero length or short read), the
/// entry and its end offset otherwise.
///
/// # Errors
///
/// [`JournalError::CorruptRecord`] on CRC mismatch,
/// [`JournalError::DeserializationError`] on payload failure.
pub fn decode_record(
    data: &[u8],
    offset: usize,
) -> Result<Option<(JournalEntry, usize)>, JournalError> {
    let Some(length_bytes) = data.get(offset..offset + 4) else {
        return Ok(None);
    };
    let length = u32::from_le_bytes([
        length_bytes[0],
        length_bytes[1],
        length_bytes[2],
        length_bytes[3],
    ]) as usize;
    if length == 0 {
        return Ok(None); // zero-filled tail of the segment
    }
    if length < RECORD_HEADER_SIZE - 4 + RECORD_CRC_SIZE {
        return Ok(None); // malformed short record: treat as truncation
    }
    let end = offset + 4 + length;
    let Some(body) = data.get(offset + 4..end) else {
        return Ok(None); // short read: truncated tail
    };

    let command_seq = u64::from_le_bytes([
        body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
    ]);
    let event_seq = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);

    let crc_start = body.len() - RECORD_CRC_SIZE;
    let stored_crc = u32::from_le_bytes([
        body[crc_start],
        body[crc_start + 1],
        body[crc_start + 2],
        body[crc_start + 3],
    ]);
    let computed_crc = crc32fast::hash(&body[..crc_start]);
    if stored_crc != computed_crc {
        return Err(JournalError::CorruptRecord {
            command_seq,
            expected_crc: stored_crc,
            actual_crc: computed_crc,
        });
    }

    let payload = &body[14..crc_start];
    let event: EngineEvent =
        serde_json::from_slice(payload).map_err(|e| JournalError::DeserializationError {
            command_seq,
            message: e.to_string(),
        })?;

    Ok(Some((
        JournalEntry {
            record: EventRecord {
                command_seq,
                event_seq,
                event,
            },
            stored_crc,
        },
        end,
    )))
}
