//! Durability backends for the page store.
//!
//! A backend receives every committed atomic write as one batch of full
//! page images and must make the batch durable all-or-nothing.
//!
//! ## File journal record
//!
//! ```text
//! [magic: u32][page_size: u32][count: u32]
//! For each page: [page_id: u32][page bytes * page_size]
//! [xxh3_64 of everything above: u64]
//! ```
//! A record is written and synced to `<data>.journal` before any data page is
//! touched; after the data file is synced the journal is truncated. On open a
//! complete record is replayed and a torn one discarded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{IvfError, Result};
use crate::types::PageId;

pub trait PageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Page images persisted so far, indexed by page id.
    fn load(&self) -> Result<Vec<Bytes>>;

    /// Durably apply a batch of page images, all or nothing.
    fn persist(&self, pages: &[(PageId, Bytes)]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Keeps nothing beyond the store's own frames. Used by tests and ephemeral indexes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    batches: AtomicU64,
    fail_next: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches accepted.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Make the next `persist` call fail, as a crashed disk would.
    pub fn fail_next_persist(&self) {
        self.fail_next.store(true, Ordering::Release);
    }
}

impl PageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    fn persist(&self, _pages: &[(PageId, Bytes)]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(IvfError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected persist failure",
            )));
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

const JOURNAL_MAGIC: u32 = 0x4956_464A; // "IVFJ"
const JOURNAL_HEADER: usize = 12;
const JOURNAL_FOOTER: usize = 8;

struct FileState {
    data: File,
    journal: File,
}

/// A single data file of fixed-size pages plus a redo journal.
pub struct FileBackend {
    path: PathBuf,
    page_size: usize,
    state: Mutex<FileState>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let journal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(journal_path(&path))?;

        let backend = Self {
            path,
            page_size,
            state: Mutex::new(FileState { data, journal }),
        };
        backend.recover()?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay a complete journal record left by an interrupted commit.
    fn recover(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut raw = Vec::new();
        state.journal.seek(SeekFrom::Start(0))?;
        state.journal.read_to_end(&mut raw)?;
        if raw.is_empty() {
            return Ok(());
        }

        match decode_journal(&raw, self.page_size) {
            Ok(pages) => {
                info!(
                    path = %self.path.display(),
                    pages = pages.len(),
                    "replaying page journal"
                );
                write_pages(&mut state.data, &pages, self.page_size)?;
                state.data.sync_all()?;
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    bytes = raw.len(),
                    error = %err,
                    "discarding torn page journal"
                );
            }
        }
        state.journal.set_len(0)?;
        state.journal.sync_all()?;
        Ok(())
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

fn encode_journal(pages: &[(PageId, Bytes)], page_size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        JOURNAL_HEADER + pages.len() * (4 + page_size) + JOURNAL_FOOTER,
    );
    buf.put_u32_le(JOURNAL_MAGIC);
    buf.put_u32_le(page_size as u32);
    buf.put_u32_le(pages.len() as u32);
    for (id, bytes) in pages {
        buf.put_u32_le(*id);
        buf.put_slice(bytes);
    }
    let checksum = xxh3_64(&buf);
    buf.put_u64_le(checksum);
    buf.freeze()
}

fn journal_error(reason: impl Into<String>) -> IvfError {
    IvfError::Encoding(format!("page journal: {}", reason.into()))
}

fn decode_journal(raw: &[u8], page_size: usize) -> Result<Vec<(PageId, Bytes)>> {
    if raw.len() < JOURNAL_HEADER + JOURNAL_FOOTER {
        return Err(journal_error(format!("record of {} bytes is too short", raw.len())));
    }
    let (body, mut footer) = raw.split_at(raw.len() - JOURNAL_FOOTER);
    let expected = footer.get_u64_le();
    let actual = xxh3_64(body);
    if expected != actual {
        return Err(IvfError::ChecksumMismatch { expected, actual });
    }

    let mut buf = body;
    if buf.get_u32_le() != JOURNAL_MAGIC {
        return Err(journal_error("bad magic"));
    }
    let recorded_size = buf.get_u32_le() as usize;
    if recorded_size != page_size {
        return Err(journal_error(format!(
            "page size {recorded_size} does not match {page_size}"
        )));
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() != count * (4 + page_size) {
        return Err(journal_error(format!("record length does not match {count} pages")));
    }
    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        let id = buf.get_u32_le();
        pages.push((id, buf.copy_to_bytes(page_size)));
    }
    Ok(pages)
}

fn write_pages(file: &mut File, pages: &[(PageId, Bytes)], page_size: usize) -> Result<()> {
    for (id, bytes) in pages {
        file.seek(SeekFrom::Start(*id as u64 * page_size as u64))?;
        file.write_all(bytes)?;
    }
    Ok(())
}

impl PageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self) -> Result<Vec<Bytes>> {
        let mut state = self.state.lock();
        let len = state.data.metadata()?.len() as usize;
        if len % self.page_size != 0 {
            return Err(IvfError::Corrupt {
                page: (len / self.page_size) as PageId,
                reason: format!(
                    "data file length {len} is not a multiple of page size {}",
                    self.page_size
                ),
            });
        }
        let mut raw = Vec::with_capacity(len);
        state.data.seek(SeekFrom::Start(0))?;
        state.data.read_to_end(&mut raw)?;
        let raw = Bytes::from(raw);
        let pages: Vec<Bytes> = (0..len / self.page_size)
            .map(|i| raw.slice(i * self.page_size..(i + 1) * self.page_size))
            .collect();
        debug!(path = %self.path.display(), pages = pages.len(), "loaded page file");
        Ok(pages)
    }

    fn persist(&self, pages: &[(PageId, Bytes)]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let record = encode_journal(pages, self.page_size);
        let mut state = self.state.lock();

        state.journal.set_len(0)?;
        state.journal.seek(SeekFrom::Start(0))?;
        state.journal.write_all(&record)?;
        state.journal.sync_data()?;

        write_pages(&mut state.data, pages, self.page_size)?;
        state.data.sync_data()?;

        state.journal.set_len(0)?;
        state.journal.sync_data()?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 1024;

    fn image(fill: u8) -> Bytes {
        Bytes::from(vec![fill; PAGE])
    }

    #[test]
    fn test_journal_round_trip() {
        let pages = vec![(0, image(1)), (5, image(2))];
        let record = encode_journal(&pages, PAGE);
        let decoded = decode_journal(&record, PAGE).unwrap();
        assert_eq!(decoded, pages);
    }

    #[test]
    fn test_torn_journal_is_rejected() {
        let record = encode_journal(&[(3, image(9))], PAGE);
        let torn = &record[..record.len() - 100];
        assert!(decode_journal(torn, PAGE).is_err());

        let mut flipped = record.to_vec();
        flipped[20] ^= 0xFF;
        let err = decode_journal(&flipped, PAGE).unwrap_err();
        assert!(matches!(err, IvfError::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.pages");
        {
            let backend = FileBackend::open(&path, PAGE).unwrap();
            backend.persist(&[(0, image(1)), (2, image(3))]).unwrap();
        }
        let backend = FileBackend::open(&path, PAGE).unwrap();
        let pages = backend.load().unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], image(1));
        assert_eq!(pages[1], image(0));
        assert_eq!(pages[2], image(3));
    }

    #[test]
    fn test_open_replays_complete_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.pages");
        drop(FileBackend::open(&path, PAGE).unwrap());

        // Simulate a crash after the journal sync but before the data write.
        let record = encode_journal(&[(1, image(7))], PAGE);
        std::fs::write(journal_path(&path), &record).unwrap();

        let backend = FileBackend::open(&path, PAGE).unwrap();
        let pages = backend.load().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1], image(7));
        assert_eq!(std::fs::metadata(journal_path(&path)).unwrap().len(), 0);
    }

    #[test]
    fn test_open_discards_torn_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.pages");
        drop(FileBackend::open(&path, PAGE).unwrap());

        let record = encode_journal(&[(1, image(7))], PAGE);
        std::fs::write(journal_path(&path), &record[..record.len() / 2]).unwrap();

        let backend = FileBackend::open(&path, PAGE).unwrap();
        assert!(backend.load().unwrap().is_empty());
    }

    #[test]
    fn test_memory_backend_failure_injection() {
        let backend = MemoryBackend::new();
        backend.fail_next_persist();
        assert!(backend.persist(&[(0, image(0))]).is_err());
        assert!(backend.persist(&[(0, image(0))]).is_ok());
        assert_eq!(backend.batches(), 1);
    }
}
