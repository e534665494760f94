use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bson::raw::{RawDocument, RawDocumentBuf};
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CursorError;

/// Shared bookkeeping over all spill files of a process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpillStats {
    pub active_cursor_count: u64,
    pub total_measured_count: u64,
    pub last_cursor_size: u64,
}

pub type SharedSpillStats = Arc<Mutex<SpillStats>>;

/// Append-only on-disk overflow for a persistent cursor.
///
/// Rows are written as `[u32 little-endian length][document bytes]`. The
/// reader memory-maps the finished file; the file is unlinked on close,
/// kill, or cancellation.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    rows_written: u64,
    stats: SharedSpillStats,
}

impl SpillFile {
    /// Create the cursor's spill file. A creation failure surfaces as
    /// `DiskFull`.
    pub fn create(
        dir: &Path,
        cursor_name: &str,
        stats: SharedSpillStats,
    ) -> Result<Self, CursorError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CursorError::DiskFull(format!("{}: {e}", dir.display())))?;
        let path = dir.join(format!("{cursor_name}.spill"));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| CursorError::DiskFull(format!("{}: {e}", path.display())))?;
        stats.lock().active_cursor_count += 1;
        debug!(path = %path.display(), "created cursor spill file");
        Ok(Self {
            path,
            file,
            bytes_written: 0,
            rows_written: 0,
            stats,
        })
    }

    pub fn append(&mut self, doc: &RawDocumentBuf) -> Result<(), CursorError> {
        let bytes = doc.as_bytes();
        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(bytes)?;
        self.bytes_written += 4 + bytes.len() as u64;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush and expose the file for mapped reads.
    pub fn finish(mut self) -> Result<SpillReader, CursorError> {
        self.file.flush()?;
        {
            let mut stats = self.stats.lock();
            stats.total_measured_count += 1;
            stats.last_cursor_size = self.bytes_written;
        }
        SpillReader::open(self.path.clone(), self.stats.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Memory-mapped consumer of a finished spill file.
pub struct SpillReader {
    path: PathBuf,
    /// `None` for an empty file (zero-length mappings are not portable).
    map: Option<Mmap>,
    offset: usize,
    stats: SharedSpillStats,
}

impl SpillReader {
    pub fn open(path: PathBuf, stats: SharedSpillStats) -> Result<Self, CursorError> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        // The writer is done with the file by the time a reader opens it.
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }?)
        };
        Ok(Self {
            path,
            map,
            offset: 0,
            stats,
        })
    }

    fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Next spilled document, or `None` at end of file.
    pub fn next_doc(&mut self) -> Result<Option<&RawDocument>, CursorError> {
        let total = self.data().len();
        if self.offset >= total {
            return Ok(None);
        }
        if self.offset + 4 > total {
            return Err(CursorError::Internal("truncated spill frame".into()));
        }
        let len = u32::from_le_bytes(
            self.data()[self.offset..self.offset + 4]
                .try_into()
                .map_err(|_| CursorError::Internal("bad spill frame header".into()))?,
        ) as usize;
        let start = self.offset + 4;
        let end = start + len;
        if end > total {
            return Err(CursorError::Internal("truncated spill frame".into()));
        }
        self.offset = end;
        let doc = RawDocument::from_bytes(&self.data()[start..end])?;
        Ok(Some(doc))
    }

    /// Unlink the backing file. Called on cursor close, kill, TTL expiry,
    /// and cancellation.
    pub fn delete(self) -> Result<(), CursorError> {
        debug!(path = %self.path.display(), "deleting cursor spill file");
        std::fs::remove_file(&self.path)?;
        let mut stats = self.stats.lock();
        stats.active_cursor_count = stats.active_cursor_count.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    fn stats() -> SharedSpillStats {
        Arc::new(Mutex::new(SpillStats::default()))
    }

    #[test]
    fn write_then_mapped_read() {
        let dir = tempfile::tempdir().unwrap();
        let shared = stats();
        let mut spill = SpillFile::create(dir.path(), "c1", shared.clone()).unwrap();
        for i in 0..50i32 {
            spill.append(&rawdoc! { "i": i }).unwrap();
        }
        assert_eq!(spill.rows_written(), 50);

        let mut reader = spill.finish().unwrap();
        let mut seen = 0;
        while let Some(doc) = reader.next_doc().unwrap() {
            assert_eq!(
                doc.get("i").unwrap(),
                Some(bson::raw::RawBsonRef::Int32(seen))
            );
            seen += 1;
        }
        assert_eq!(seen, 50);
        assert_eq!(shared.lock().total_measured_count, 1);

        let path = reader.path.clone();
        reader.delete().unwrap();
        assert!(!path.exists());
        assert_eq!(shared.lock().active_cursor_count, 0);
    }

    #[test]
    fn create_in_unwritable_dir_is_disk_full() {
        let err =
            SpillFile::create(Path::new("/proc/definitely/not/writable"), "c", stats())
                .unwrap_err();
        assert!(matches!(err, CursorError::DiskFull(_)));
    }

    #[test]
    fn duplicate_cursor_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shared = stats();
        let _first = SpillFile::create(dir.path(), "dup", shared.clone()).unwrap();
        assert!(matches!(
            SpillFile::create(dir.path(), "dup", shared),
            Err(CursorError::DiskFull(_))
        ));
    }

    #[test]
    fn empty_spill_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::create(dir.path(), "empty", stats()).unwrap();
        let mut reader = spill.finish().unwrap();
        assert!(reader.next_doc().unwrap().is_none());
    }
}
