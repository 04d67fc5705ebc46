//! Error types for the write-ahead journal.

use std::fmt;
use std::path::PathBuf;

/// Failure modes of the append-only event journal.
#[derive(Debug)]
#[non_exhaustive]
pub enum JournalError {
    /// An I/O error while reading or writing segment files.
    Io {
        /// The underlying I/O error message.
        message: String,
        /// The file involved, if known.
        path: Option<PathBuf>,
    },

    /// A record failed CRC32 verification. Recovery truncates here.
    CorruptRecord {
        /// Command sequence of the corrupt record.
        command_seq: u64,
        /// The CRC stored on disk.
        expected_crc: u32,
        /// The CRC computed from the bytes.
        actual_crc: u32,
    },

    /// A record's payload could not be deserialized.
    DeserializationError {
        /// Command sequence of the offending record.
        command_seq: u64,
        /// The underlying deserialization error message.
        message: String,
    },

    /// An event could not be serialized for appending.
    SerializationError {
        /// The underlying serialization error message.
        message: String,
    },

    /// A single record exceeds the segment size.
    RecordTooLarge {
        /// The serialized record size in bytes.
        record_bytes: usize,
        /// The configured segment size in bytes.
        segment_size: usize,
    },

    /// A segment carries an unknown magic or schema version.
    BadSegmentHeader {
        /// The offending segment file.
        path: PathBuf,
        /// What was wrong with the header.
        message: String,
    },

    /// An internal mutex was poisoned.
    MutexPoisoned,
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Io { message, path } => {
                if let Some(p) = path {
                    write!(f, "journal I/O error at {}: {message}", p.display())
                } else {
                    write!(f, "journal I/O error: {message}")
                }
            }
            JournalError::CorruptRecord {
                command_seq,
                expected_crc,
                actual_crc,
            } => write!(
                f,
                "corrupt journal record at command {command_seq}: \
                 expected CRC {expected_crc:#010x}, got {actual_crc:#010x}"
            ),
            JournalError::DeserializationError {
                command_seq,
                message,
            } => write!(
                f,
                "journal deserialization error at command {command_seq}: {message}"
            ),
            JournalError::SerializationError { message } => {
                write!(f, "journal serialization error: {message}")
            }
            JournalError::RecordTooLarge {
                record_bytes,
                segment_size,
            } => write!(
                f,
                "journal record too large: {record_bytes} bytes exceeds \
                 segment size {segment_size} bytes"
            ),
            JournalError::BadSegmentHeader { path, message } => {
                write!(f, "bad segment header in {}: {message}", path.display())
            }
            JournalError::MutexPoisoned => write!(f, "journal internal mutex poisoned"),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<std::io::Error> for JournalError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        JournalError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}
