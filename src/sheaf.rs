//! The raw paged-file cache. Named for the loose leaves ("folios") a Sheaf
//! binds together: it is a read-through cache of fixed-size pages keyed by
//! byte [`Position`], nothing more. It carries none of the pack's ACID
//! logic — that all lives above it in `catalog`, `journal` and `commit`.
//!
//! Grounded on `treedb`'s `pager::File` + `pager::page::Page`: a page is a
//! flat byte buffer the caller reads and writes through typed views built on
//! `zerocopy`. Dirty tracking here is page-granular rather than the
//! sub-page dirty-region map the distilled spec mentions, because every
//! write in this store rewrites a page's content wholesale (append a block
//! record, flip a tombstone, bump a slot) — a byte-range map would track
//! nothing a single bool doesn't already.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::file::File;
use crate::position::Position;

struct RawPage {
    buf: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

pub struct Sheaf<F> {
    file: F,
    page_size: u32,
    pages: RwLock<HashMap<Position, Arc<RawPage>>>,
}

impl<F: File> Sheaf<F> {
    pub fn new(file: F, page_size: u32) -> Self {
        Self {
            file,
            page_size,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Total number of pages currently backed by the file, including the
    /// header page at position 0.
    pub fn page_count(&self) -> Result<u64> {
        Ok(self.file.len()? / self.page_size as u64)
    }

    fn fetch(&self, pos: Position) -> Result<Arc<RawPage>> {
        if let Some(page) = self.pages.read().get(&pos) {
            return Ok(page.clone());
        }

        let mut buf = vec![0u8; self.page_size as usize];
        self.file.read_at(&mut buf, pos.0)?;

        let page = Arc::new(RawPage {
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(false),
        });

        Ok(self
            .pages
            .write()
            .entry(pos)
            .or_insert(page)
            .clone())
    }

    /// Read-through access to a page's current bytes.
    pub fn with<R>(&self, pos: Position, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let page = self.fetch(pos)?;
        let guard = page.buf.read();
        Ok(f(&guard))
    }

    /// Read-through mutable access; marks the page dirty unconditionally,
    /// since every caller of this function intends to change bytes.
    pub fn with_mut<R>(&self, pos: Position, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let page = self.fetch(pos)?;
        let mut guard = page.buf.write();
        let r = f(&mut guard);
        page.dirty.store(true, Ordering::Release);
        Ok(r)
    }

    /// Overwrite a page's full content in the cache (used when a page is
    /// being reinitialized for a new kind) and mark it dirty.
    pub fn put(&self, pos: Position, content: Vec<u8>) {
        debug_assert_eq!(content.len(), self.page_size as usize);
        let page = Arc::new(RawPage {
            buf: RwLock::new(content),
            dirty: AtomicBool::new(true),
        });
        self.pages.write().insert(pos, page);
    }

    /// Drop a page from the cache without flushing it. Used for interim and
    /// journal pages once they've been retired and their content no longer
    /// matters.
    pub fn forget(&self, pos: Position) {
        self.pages.write().remove(&pos);
    }

    /// Grow the file by one page, returning its position. The new page is
    /// pre-populated with zeroes in the cache so callers never read stale
    /// disk content left over from a previous use of that byte range.
    pub fn extend_one(&self) -> Result<Position> {
        let count = self.page_count()?;
        let pos = Position(count * self.page_size as u64);
        self.file.set_len((count + 1) * self.page_size as u64)?;
        self.put(pos, vec![0u8; self.page_size as usize]);
        Ok(pos)
    }

    pub fn truncate_to(&self, pos: Position) -> Result<()> {
        self.file.set_len(pos.0)?;
        self.pages.write().retain(|p, _| p.0 < pos.0);
        Ok(())
    }

    /// Flush all dirty pages to the file without forcing them to stable
    /// storage.
    pub fn write(&self) -> Result<()> {
        for (pos, page) in self.pages.read().iter() {
            if page.dirty.swap(false, Ordering::AcqRel) {
                let guard = page.buf.read();
                self.file.write_at(&guard, pos.0)?;
            }
        }
        Ok(())
    }

    /// Flush dirty pages and fsync.
    pub fn force(&self) -> Result<()> {
        self.write()?;
        self.file.sync_data()
    }
}
