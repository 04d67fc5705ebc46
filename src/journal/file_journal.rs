//! Memory-mapped segment file journal.
//!
//! Events append into pre-allocated, zero-filled segment files named
//! `segment-{start_command_seq:020}.wal`. Each segment opens with the
//! 16-byte header (magic + schema version); records follow back to back
//! in the envelope documented at the module root. When a segment cannot
//! fit the next record a new one is created and the old file is truncated
//! to its used size. Archived segments are renamed to `.wal.archived` and
//! excluded from reads.
//!
//! Writes land in the mapping immediately; [`Journal::sync`] flushes the
//! dirty range, so the sequencer controls durability boundaries.

use super::error::JournalError;
use super::{
    JournalEntry, JournalReadIter, Journal, SCHEMA_VERSION, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
    decode_record, encode_record,
};
use crate::events::EventRecord;
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Default segment size in bytes (64 MB).
const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Writer state for the active segment.
struct SegmentWriter {
    mmap: MmapMut,
    /// Next write offset within the segment.
    write_pos: usize,
    /// Start of the unflushed range; `write_pos` when clean.
    dirty_from: usize,
    capacity: usize,
    path: PathBuf,
}

impl SegmentWriter {
    /// Create a fresh segment, pre-allocated and headed.
    fn create(path: &Path, capacity: usize) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err(e, path))?;
        file.set_len(capacity as u64).map_err(|e| io_err(e, path))?;

        // SAFETY: the file is exclusively owned by this process and not
        // resized while the mapping is alive.
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| io_err(e, path))? };

        mmap[..8].copy_from_slice(&SEGMENT_MAGIC);
        mmap[8..10].copy_from_slice(&SCHEMA_VERSION.to_le_bytes());
        // Bytes 10..16 are reserved and stay zero.
        mmap.flush_range(0, SEGMENT_HEADER_SIZE)
            .map_err(|e| io_err(e, path))?;

        Ok(Self {
            mmap,
            write_pos: SEGMENT_HEADER_SIZE,
            dirty_from: SEGMENT_HEADER_SIZE,
            capacity,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing segment, validating its header and scanning for
    /// the end of the valid record run. A corrupt tail is left behind the
    /// write position and will be overwritten by subsequent appends.
    fn open_existing(path: &Path) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err(e, path))?;
        let capacity = file.metadata().map_err(|e| io_err(e, path))?.len() as usize;

        // SAFETY: single-writer ownership, no external resizing.
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| io_err(e, path))? };

        check_header(&mmap, path)?;
        let write_pos = scan_valid_end(&mmap);

        Ok(Self {
            mmap,
            write_pos,
            dirty_from: write_pos,
            capacity,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.write_pos)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), JournalError> {
        let end = self.write_pos + bytes.len();
        if end > self.capacity {
            return Err(JournalError::RecordTooLarge {
                record_bytes: bytes.len(),
                segment_size: self.capacity,
            });
        }
        self.mmap[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), JournalError> {
        if self.dirty_from < self.write_pos {
            let len = self.write_pos - self.dirty_from;
            self.mmap
                .flush_range(self.dirty_from, len)
                .map_err(|e| io_err(e, &self.path))?;
            self.dirty_from = self.write_pos;
        }
        Ok(())
    }
}

/// The default [`Journal`] implementation: memory-mapped segments with
/// CRC-checked records and explicit flush boundaries.
pub struct FileJournal {
    dir: PathBuf,
    writer: Mutex<SegmentWriter>,
    segment_size: usize,
    /// Start sequence of the active segment.
    active_start: Mutex<u64>,
    /// Highest command sequence appended so far.
    last_seq: Mutex<Option<u64>>,
}

impl FileJournal {
    /// Open or create a journal in `dir` with the default segment size.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the directory or segments cannot be
    /// opened.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, JournalError> {
        Self::open_with_segment_size(dir, DEFAULT_SEGMENT_SIZE)
    }

    /// Open or create a journal with an explicit segment size.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the directory or segments cannot be
    /// opened.
    pub fn open_with_segment_size<P: AsRef<Path>>(
        dir: P,
        segment_size: usize,
    ) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_err(e, &dir))?;

        let mut segments = list_segments(&dir)?;
        segments.sort_unstable();

        let (writer, active_start, last_seq) = if let Some(latest) = segments.last() {
            let path = segment_path(&dir, *latest);
            let writer = SegmentWriter::open_existing(&path)?;
            let last = scan_last_command_seq(&writer.mmap, writer.write_pos);
            info!(
                "journal resumed at {} (write_pos {}, last command {:?})",
                path.display(),
                writer.write_pos,
                last
            );
            (writer, *latest, last)
        } else {
            let path = segment_path(&dir, 0);
            (SegmentWriter::create(&path, segment_size)?, 0, None)
        };

        Ok(Self {
            dir,
            writer: Mutex::new(writer),
            segment_size,
            active_start: Mutex::new(active_start),
            last_seq: Mutex::new(last_seq),
        })
    }

    /// Rename segments whose start sequence precedes `before` to
    /// `.wal.archived`, excluding them from reads. The active segment is
    /// never archived.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when a rename fails.
    pub fn archive_segments_before(&self, before: u64) -> Result<usize, JournalError> {
        let active = *self
            .active_start
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;
        let mut archived = 0usize;
        for start in list_segments(&self.dir)? {
            if start < before && start != active {
                let src = segment_path(&self.dir, start);
                let mut dst = src.clone();
                dst.set_extension("wal.archived");
                fs::rename(&src, &dst).map_err(|e| io_err(e, &src))?;
                archived += 1;
            }
        }
        Ok(archived)
    }

    fn rotate(&self, writer: &mut SegmentWriter, start_seq: u64) -> Result<(), JournalError> {
        writer.flush()?;
        let old_path = writer.path.clone();
        let old_len = writer.write_pos;

        let new_path = segment_path(&self.dir, start_seq);
        *writer = SegmentWriter::create(&new_path, self.segment_size)?;
        info!("journal rotated to {}", new_path.display());

        // Trim the finished segment to its used size (best effort).
        if let Ok(file) = OpenOptions::new().write(true).open(&old_path) {
            let _ = file.set_len(old_len as u64);
        }

        if let Ok(mut active) = self.active_start.lock() {
            *active = start_seq;
        }
        Ok(())
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &EventRecord) -> Result<(), JournalError> {
        let bytes = encode_record(record)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;

        if writer.remaining() < bytes.len() {
            self.rotate(&mut writer, record.command_seq)?;
        }
        if writer.remaining() < bytes.len() {
            return Err(JournalError::RecordTooLarge {
                record_bytes: bytes.len(),
                segment_size: self.segment_size,
            });
        }
        writer.write(&bytes)?;

        if let Ok(mut last) = self.last_seq.lock() {
            *last = Some(record.command_seq);
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), JournalError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;
        writer.flush()
    }

    fn read_from(&self, from: u64) -> Result<JournalReadIter, JournalError> {
        // Flush so readers observe everything appended so far.
        self.sync()?;

        let mut segments = list_segments(&self.dir)?;
        segments.sort_unstable();

        // The segment that could contain `from` is the one with the
        // largest start <= from; earlier ones cannot.
        let start_idx = match segments.binary_search(&from) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        };
        let remaining: Vec<u64> = segments.into_iter().skip(start_idx).collect();

        Ok(Box::new(SegmentIter {
            dir: self.dir.clone(),
            segments: remaining,
            next_segment: 0,
            offset: SEGMENT_HEADER_SIZE,
            mmap: None,
            from,
        }))
    }

    fn last_command_seq(&self) -> Option<u64> {
        self.last_seq.lock().ok().and_then(|guard| *guard)
    }

    fn verify_integrity(&self) -> Result<(), JournalError> {
        for entry in self.read_from(0)? {
            entry?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("last_seq", &self.last_seq.lock().ok().and_then(|g| *g))
            .finish()
    }
}

/// Read-side iterator across segment files.
struct SegmentIter {
    dir: PathBuf,
    segments: Vec<u64>,
    next_segment: usize,
    offset: usize,
    mmap: Option<memmap2::Mmap>,
    from: u64,
}

impl SegmentIter {
    fn load_next_segment(&mut self) -> Result<bool, JournalError> {
        let Some(start) = self.segments.get(self.next_segment).copied() else {
            return Ok(false);
        };
        self.next_segment += 1;
        self.offset = SEGMENT_HEADER_SIZE;

        let path = segment_path(&self.dir, start);
        let file = File::open(&path).map_err(|e| io_err(e, &path))?;
        // SAFETY: read-only mapping; the single writer only appends past
        // the region we read.
        let mmap = unsafe { memmap2::Mmap::map(&file).map_err(|e| io_err(e, &path))? };
        check_header(&mmap, &path)?;
        self.mmap = Some(mmap);
        Ok(true)
    }
}

impl Iterator for SegmentIter {
    type Item = Result<JournalEntry, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.mmap.is_none() {
                match self.load_next_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }

            let data = self.mmap.as_ref()?;
            match decode_record(data, self.offset) {
                Ok(Some((entry, end))) => {
                    self.offset = end;
                    if entry.record.command_seq < self.from {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => {
                    // Segment exhausted; move on.
                    self.mmap = None;
                }
                Err(e) => {
                    // Corruption ends the readable journal.
                    self.mmap = None;
                    self.segments.truncate(self.next_segment);
                    return Some(Err(e));
                }
            }
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

#[cold]
fn io_err(err: std::io::Error, path: &Path) -> JournalError {
    JournalError::Io {
        message: err.to_string(),
        path: Some(path.to_path_buf()),
    }
}

fn segment_path(dir: &Path, start_seq: u64) -> PathBuf {
    dir.join(format!("segment-{start_seq:020}.wal"))
}

fn check_header(data: &[u8], path: &Path) -> Result<(), JournalError> {
    if data.len() < SEGMENT_HEADER_SIZE {
        return Err(JournalError::BadSegmentHeader {
            path: path.to_path_buf(),
            message: "segment shorter than header".to_string(),
        });
    }
    if data[..8] != SEGMENT_MAGIC {
        return Err(JournalError::BadSegmentHeader {
            path: path.to_path_buf(),
            message: "bad magic".to_string(),
        });
    }
    let version = u16::from_le_bytes([data[8], data[9]]);
    if version != SCHEMA_VERSION {
        return Err(JournalError::BadSegmentHeader {
            path: path.to_path_buf(),
            message: format!("unsupported schema version {version}"),
        });
    }
    Ok(())
}

/// List active (non-archived) segment start sequences.
fn list_segments(dir: &Path) -> Result<Vec<u64>, JournalError> {
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(e, dir))? {
        let entry = entry.map_err(|e| io_err(e, dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("segment-")
            && let Some(seq_str) = rest.strip_suffix(".wal")
            && let Ok(seq) = seq_str.parse::<u64>()
        {
            seqs.push(seq);
        }
    }
    Ok(seqs)
}

/// Find the end of the valid record run: the offset after the last record
/// that decodes with a correct CRC. Anything past it is a corrupt or
/// zero-filled tail.
fn scan_valid_end(data: &[u8]) -> usize {
    let mut offset = SEGMENT_HEADER_SIZE;
    loop {
        match decode_record(data, offset) {
            Ok(Some((_, end))) => offset = end,
            Ok(None) => return offset,
            Err(e) => {
                warn!("journal tail truncated at offset {offset}: {e}");
                return offset;
            }
        }
    }
}

/// The last command sequence within the valid run ending at `end`.
fn scan_last_command_seq(data: &[u8], end: usize) -> Option<u64> {
    let mut offset = SEGMENT_HEADER_SIZE;
    let mut last = None;
    while offset < end {
        match decode_record(data, offset) {
            Ok(Some((entry, next))) => {
                last = Some(entry.record.command_seq);
                offset = next;
            }
            _ => break,
        }
    }
    last
}
