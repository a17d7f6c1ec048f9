//! Write-Ahead Log with segmented storage

use crate::segment::{Segment, SegmentReader};
use anyhow::{Result, anyhow};
use common::Ts;
use serde::{Serialize, de::DeserializeOwned};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Default segment size (64 MB)
const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// WAL entry trait
pub trait WalEntry: Serialize + DeserializeOwned + Send + Sync {
    /// Get the timestamp of the entry
    fn timestamp(&self) -> Ts;
}

/// Write-Ahead Log
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    current_segment: Option<Segment>,
    segment_counter: u64,
    /// Set when a failed commit could not be rolled back
    poisoned: bool,
    #[cfg(test)]
    pub(crate) fail_next_flush: bool,
}

impl Wal {
    /// Open (or create) a WAL in the specified directory
    ///
    /// New entries always go to a fresh segment, so a segment with a torn
    /// tail from a previous crash is never appended to.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or listed.
    pub fn new(dir: &Path, segment_size: Option<u64>) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let segment_size = segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        let segment_counter = Self::find_latest_segment(dir)?;

        info!(
            "Initialized WAL at {} with segment size {} KB",
            dir.display(),
            segment_size / 1024
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            current_segment: None,
            segment_counter,
            poisoned: false,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// Append an entry to the WAL
    ///
    /// # Errors
    /// Returns an error if encoding or writing fails.
    pub fn append<T: WalEntry>(&mut self, entry: &T) -> Result<()> {
        if self.poisoned {
            return Err(anyhow!("WAL is unusable after a failed rollback"));
        }
        let data = bincode::serialize(entry)?;

        if self
            .current_segment
            .as_ref()
            .is_none_or(|s| s.is_full(data.len()) && s.entry_count() > 0)
        {
            self.rotate_segment()?;
        }

        if let Some(segment) = &mut self.current_segment {
            segment.append(&data)?;
        } else {
            return Err(anyhow!("Failed to create segment"));
        }

        Ok(())
    }

    /// Flush the WAL to disk
    ///
    /// # Errors
    /// Returns an error if the fsync fails.
    pub fn flush(&mut self) -> Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            return Err(anyhow!("injected flush failure"));
        }
        if let Some(segment) = &mut self.current_segment {
            segment.flush()?;
        }
        Ok(())
    }

    /// Append an entry and make it durable, or leave no trace of it
    ///
    /// When either step fails the unsynced tail of the current segment is
    /// cut off and the next entry starts a new segment. If that cleanup
    /// fails too, the WAL refuses further writes.
    ///
    /// # Errors
    /// Returns the append or flush error.
    pub fn commit<T: WalEntry>(&mut self, entry: &T) -> Result<()> {
        let written = self.append(entry).and_then(|()| self.flush());
        if written.is_err() {
            self.abandon_segment();
        }
        written
    }

    fn abandon_segment(&mut self) {
        let Some(segment) = self.current_segment.take() else {
            return;
        };
        match segment.abandon() {
            Ok(()) => warn!(segment = self.segment_counter, "rolled back unsynced WAL records"),
            Err(e) => {
                error!(segment = self.segment_counter, "could not roll back WAL records: {}", e);
                self.poisoned = true;
            }
        }
    }

    /// Create an iterator to stream entries from a timestamp
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed.
    pub fn stream<T: WalEntry>(&self, from_ts: Option<Ts>) -> Result<WalIterator<T>> {
        WalIterator::new(&self.dir, from_ts)
    }

    /// Start a new segment; returns its number
    ///
    /// # Errors
    /// Returns an error if the current segment cannot be closed or the new
    /// one cannot be created.
    pub fn rotate(&mut self) -> Result<u64> {
        self.rotate_segment()?;
        Ok(self.segment_counter)
    }

    /// Remove every segment numbered below `segment`
    ///
    /// # Errors
    /// Returns an error if a segment file cannot be removed.
    pub fn remove_before(&mut self, segment: u64) -> Result<u64> {
        let mut removed = 0;
        for path in Self::list_segments(&self.dir)? {
            if Self::segment_number(&path).is_some_and(|n| n < segment) {
                fs::remove_file(&path)?;
                removed += 1;
                debug!("Removed segment: {}", path.display());
            }
        }

        info!("Compacted {} segments before segment {}", removed, segment);
        Ok(removed)
    }

    /// Get statistics about the WAL
    ///
    /// # Errors
    /// Returns an error if the directory or a segment cannot be read.
    pub fn stats(&self) -> Result<WalStats> {
        let segments = Self::list_segments(&self.dir)?;
        let segment_count = segments.len() as u64;

        let mut total_size = 0;
        for segment_path in segments {
            total_size += fs::metadata(&segment_path)?.len();
        }

        Ok(WalStats {
            segment_count,
            total_size,
            current_segment_size: self.current_segment.as_ref().map(Segment::size),
        })
    }

    fn rotate_segment(&mut self) -> Result<()> {
        if let Some(segment) = self.current_segment.take() {
            segment.close()?;
        }

        self.segment_counter += 1;
        let segment_path = self.segment_path(self.segment_counter);
        self.current_segment = Some(Segment::create(&segment_path, self.segment_size)?);

        debug!("Rotated to new segment: {}", segment_path.display());
        Ok(())
    }

    fn segment_path(&self, counter: u64) -> PathBuf {
        self.dir.join(format!("{counter:010}.wal"))
    }

    fn segment_number(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        Ok(Self::list_segments(dir)?
            .iter()
            .filter_map(|path| Self::segment_number(path))
            .max()
            .unwrap_or(0))
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("wal"))
            .collect();

        segments.sort();
        Ok(segments)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(segment) = self.current_segment.take() {
            if let Err(e) = segment.close() {
                warn!("Failed to close segment on WAL drop: {}", e);
            }
        }
    }
}

/// Statistics about the WAL
#[derive(Debug)]
pub struct WalStats {
    /// Number of segments
    pub segment_count: u64,
    /// Total size in bytes
    pub total_size: u64,
    /// Current segment size
    pub current_segment_size: Option<u64>,
}

/// Iterator for reading WAL entries in append order
///
/// A segment whose tail is torn or fails its checksum is read up to the last
/// good record; the rest of it is skipped with a warning.
pub struct WalIterator<T: WalEntry> {
    segments: Vec<PathBuf>,
    current_reader: Option<SegmentReader>,
    current_index: usize,
    from_ts: Option<Ts>,
    _phantom: PhantomData<T>,
}

impl<T: WalEntry> WalIterator<T> {
    fn new(dir: &Path, from_ts: Option<Ts>) -> Result<Self> {
        let segments = Wal::list_segments(dir)?;

        Ok(Self {
            segments,
            current_reader: None,
            current_index: 0,
            from_ts,
            _phantom: PhantomData,
        })
    }

    /// Read the next entry
    ///
    /// # Errors
    /// Returns an error if a segment cannot be opened or a checksummed
    /// record does not decode.
    pub fn read_next_entry(&mut self) -> Result<Option<T>> {
        loop {
            if self.current_reader.is_none() {
                let Some(path) = self.segments.get(self.current_index) else {
                    return Ok(None);
                };
                self.current_reader = Some(Segment::open(path)?);
                self.current_index += 1;
            }

            let Some(reader) = &mut self.current_reader else {
                continue;
            };
            match reader.read_next() {
                Ok(Some(data)) => {
                    let entry: T = bincode::deserialize(&data)?;
                    if let Some(from) = self.from_ts {
                        if entry.timestamp() < from {
                            continue;
                        }
                    }
                    return Ok(Some(entry));
                }
                Ok(None) => self.current_reader = None,
                Err(e) => {
                    warn!(
                        segment = %self.segments[self.current_index - 1].display(),
                        "discarding segment tail: {}", e
                    );
                    self.current_reader = None;
                }
            }
        }
    }
}
