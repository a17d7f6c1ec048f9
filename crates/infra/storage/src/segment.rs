//! WAL segment files with CRC32 checksums
//!
//! Layout: a 16 byte header (`magic`, `version`, entry count written on
//! close) followed by records `[length: u32][crc: u32][data]`. Readers do
//! not trust the header count; they read records until end of file so a
//! segment left open by a crash is still readable up to its last complete
//! record.

use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Size of segment header in bytes
const SEGMENT_HEADER_SIZE: u64 = 16;

/// Magic number for segment files
const SEGMENT_MAGIC: u32 = 0x4C42_574C; // "LBWL"

/// Version of segment format
const SEGMENT_VERSION: u32 = 1;

/// Upper bound for a single record; larger lengths are treated as corruption
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// A single WAL segment file open for appending
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    /// Size known to be on disk after the last successful flush
    synced_size: u64,
    max_size: u64,
    entries: u64,
}

impl Segment {
    /// Create a new segment file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or if header writing fails.
    pub fn create(path: &Path, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        writer.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?; // Entry count, updated on close

        writer.flush()?;
        writer.get_mut().sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            size: SEGMENT_HEADER_SIZE,
            synced_size: SEGMENT_HEADER_SIZE,
            max_size,
            entries: 0,
        })
    }

    /// Open an existing segment file for reading
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the header is invalid.
    pub fn open(path: &Path) -> Result<SegmentReader> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(anyhow!("Invalid segment magic: {:#x}", magic));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(anyhow!("Unsupported segment version: {}", version));
        }

        let entries = reader.read_u64::<LittleEndian>()?;

        Ok(SegmentReader {
            reader,
            entries,
            offset: SEGMENT_HEADER_SIZE,
        })
    }

    /// Append a record to the segment
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails or if the segment is full.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.is_full(data.len()) && self.entries > 0 {
            return Err(anyhow!("Segment is full"));
        }

        let mut hasher = Hasher::new();
        hasher.update(data);
        let crc = hasher.finalize();

        self.file.write_u32::<LittleEndian>(u32::try_from(data.len())?)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(data)?;

        self.size += 8 + u64::try_from(data.len())?;
        self.entries += 1;

        trace!(entries = self.entries, bytes = data.len(), "appended record");
        Ok(())
    }

    /// Check if segment has room for a record of `next_entry_size` bytes
    #[must_use]
    pub const fn is_full(&self, next_entry_size: usize) -> bool {
        self.size
            .saturating_add(8)
            .saturating_add(next_entry_size as u64)
            > self.max_size
    }

    /// Flush buffered records and fsync the file
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        self.synced_size = self.size;
        Ok(())
    }

    /// Drop every record appended since the last successful flush
    ///
    /// Buffered bytes are discarded and the file is cut back to its last
    /// synced size. The segment is left without a final entry count; readers
    /// stop at end of file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated or synced.
    pub fn abandon(self) -> Result<()> {
        let (file, _unwritten) = self.file.into_parts();
        file.set_len(self.synced_size)?;
        file.sync_all()?;
        debug!(path = %self.path.display(), size = self.synced_size, "abandoned unsynced records");
        Ok(())
    }

    /// Close the segment, updating the header with the final entry count
    ///
    /// # Errors
    ///
    /// Returns an error if the close operation fails.
    pub fn close(mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u64::<LittleEndian>(self.entries)?;
        self.flush()?;

        debug!(path = %self.path.display(), entries = self.entries, "closed segment");
        Ok(())
    }

    /// Number of records appended through this handle
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Current size of the segment in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Sequential reader for a WAL segment
pub struct SegmentReader {
    reader: BufReader<File>,
    entries: u64,
    offset: u64,
}

impl SegmentReader {
    /// Read the next record
    ///
    /// Returns `Ok(None)` at a clean end of file. A record cut short by end
    /// of file or failing its checksum is an error.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, a torn record or a CRC mismatch.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let length = usize::try_from(self.reader.read_u32::<LittleEndian>().map_err(|e| self.torn(e))?)?;
        if length > MAX_RECORD_SIZE {
            return Err(anyhow!("Record length {} at offset {} exceeds limit", length, self.offset));
        }
        let expected_crc = self.reader.read_u32::<LittleEndian>().map_err(|e| self.torn(e))?;

        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data).map_err(|e| self.torn(e))?;

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let actual_crc = hasher.finalize();

        if actual_crc != expected_crc {
            return Err(anyhow!(
                "CRC mismatch at offset {}: expected {:#x}, got {:#x}",
                self.offset,
                expected_crc,
                actual_crc
            ));
        }

        self.offset += 8 + u64::try_from(length)?;
        Ok(Some(data))
    }

    fn torn(&self, err: std::io::Error) -> anyhow::Error {
        anyhow!("Torn record at offset {}: {}", self.offset, err)
    }

    /// Entry count recorded in the header (zero if never closed)
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Reset reader to the first record
    ///
    /// # Errors
    ///
    /// Returns an error if the seek operation fails.
    pub fn reset(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
        self.offset = SEGMENT_HEADER_SIZE;
        Ok(())
    }
}
