//! Header & Boot (C1). First-page fixed layout, persisted with `bincode`
//! exactly the way `treedb`'s `pager::Header` persists its own version/page
//! count/commit counters — a plain `serde`-derived struct serialized into
//! page 0, rather than a `zerocopy` view, because its variable-length
//! directory fields (static blocks, free lists) don't suit a fixed layout.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::File;
use crate::position::Position;
use crate::sheaf::Sheaf;

pub const SIGNATURE: u64 = 0x7ACB_E5A1_0000_0001;
pub const SHUTDOWN_CLEAN: u32 = 1;
pub const SHUTDOWN_DIRTY: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticEntry {
    pub uri: String,
    pub address: u64,
    pub block_size: u32,
}

/// The pack's single fixed page-0 header plus the catalog bookkeeping that,
/// in a distributed-scan design, would be rebuilt by walking the whole
/// file. Folding it into the header page keeps reconstruction-on-open a
/// matter of reading and deserializing one page, still durable through the
/// same fsync'd write as the rest of the header (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub signature: u64,
    pub page_size: u32,
    pub header_size: u32,
    pub shutdown_flag: u32,
    /// Position of the journal's head page, or 0 if no commit is pending
    /// replay. Its durable write is the commit's Checkpoint boundary.
    pub journal_header: u64,
    /// File length, in bytes, as of the last successfully retired commit.
    /// Anything beyond this on open is an orphaned extension from a commit
    /// that crashed before checkpointing, and gets truncated away.
    pub interim_boundary: u64,
    /// Whether block payloads carry a trailing CRC32 (§4.4). Fixed for the
    /// lifetime of the pack; set at creation.
    pub checksums: bool,
    pub statics: Vec<StaticEntry>,
    pub address_pages: Vec<u64>,
    pub free_positions: Vec<u64>,
    pub user_block_pages: Vec<u64>,
    pub temporary_addresses: Vec<u64>,
}

/// The page size has to be known before a [`Sheaf`] can be built at all, so
/// it's read directly off the file rather than through one — `signature`
/// and `page_size` are `Header`'s first two fields, and bincode serializes
/// struct fields positionally with no framing, so deserializing just the
/// prefix into this two-field struct reads the same bytes `Header::read`
/// would, ignoring the rest of the page.
#[derive(Debug, Deserialize)]
struct PageSizeProbe {
    signature: u64,
    page_size: u32,
}

pub fn peek_page_size<F: File>(file: &F) -> Result<u32> {
    let len = file.len()?;
    if len < 12 {
        return Err(Error::HeaderCorrupt);
    }
    let mut buf = vec![0u8; 64.min(len as usize)];
    file.read_at(&mut buf, 0)?;
    let probe: PageSizeProbe = bincode::deserialize(&buf).map_err(|_| Error::HeaderCorrupt)?;
    if probe.signature != SIGNATURE {
        return Err(Error::BadSignature);
    }
    Ok(probe.page_size)
}

impl Header {
    pub fn new(page_size: u32) -> Self {
        Header {
            signature: SIGNATURE,
            page_size,
            header_size: page_size,
            shutdown_flag: SHUTDOWN_CLEAN,
            journal_header: 0,
            interim_boundary: page_size as u64,
            checksums: true,
            statics: Vec::new(),
            address_pages: Vec::new(),
            free_positions: Vec::new(),
            user_block_pages: Vec::new(),
            temporary_addresses: Vec::new(),
        }
    }

    pub fn read<F: File>(sheaf: &Sheaf<F>) -> Result<Header> {
        let bytes = sheaf.with(Position(0), |b| b.to_vec())?;
        let header: Header =
            bincode::deserialize(&bytes).map_err(|_| Error::HeaderCorrupt)?;
        if header.signature != SIGNATURE {
            return Err(Error::BadSignature);
        }
        Ok(header)
    }

    pub fn write<F: File>(&self, sheaf: &Sheaf<F>) -> Result<()> {
        let bytes = bincode::serialize(self).map_err(|_| Error::HeaderCorrupt)?;
        if bytes.len() > self.page_size as usize {
            // A real multi-page directory is out of scope for this store;
            // see DESIGN.md for the size this implies.
            return Err(Error::HeaderCorrupt);
        }
        sheaf.with_mut(Position(0), |page| {
            page[..bytes.len()].copy_from_slice(&bytes);
            for b in &mut page[bytes.len()..] {
                *b = 0;
            }
        })
    }
}
