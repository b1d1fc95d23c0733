//! Journal (C6). A forward-chained sequence of redo operations, written
//! ahead of a commit's apply phase and replayed on recovery.
//!
//! Pages are plain interim pages (never registered in the catalog's
//! address/free/user-block lists — see `catalog.rs`) laid out as
//! `{ next: u64, [ { len: u32, op: bincode }, ... ] }`, the same
//! length-prefixed-record idea `block_page.rs` uses for live blocks, just
//! chained across pages instead of packed into one. `next == 0` ends the
//! chain; a zero length prefix ends the in-page record list (pages are
//! zero-initialized, so unwritten tail bytes read naturally as "stop").

use serde::{Deserialize, Serialize};
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::catalog::PageCatalog;
use crate::error::{Error, Result};
use crate::file::File;
use crate::position::Position;
use crate::sheaf::Sheaf;

const NEXT_LEN: usize = std::mem::size_of::<U64>();
const LEN_LEN: usize = std::mem::size_of::<U32>();

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
struct NextPointer {
    next: U64,
}

/// A single redo operation. Every variant's apply is idempotent, since
/// recovery may replay a journal whose apply phase partly landed before the
/// crash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    CreateAddressPage { pos: u64 },
    ReserveSlot { address: u64, page: u64 },
    Write { address: u64, page: u64, bytes: Vec<u8> },
    Free { address: u64 },
    Move { address: u64, from: u64, to: u64 },
    Checkpoint { interim_boundary: u64 },
    Terminate,
}

pub struct JournalWriter {
    ops: Vec<Vec<u8>>,
}

impl JournalWriter {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn push(&mut self, op: JournalOp) -> Result<()> {
        let bytes = bincode::serialize(&op).map_err(|_| Error::HeaderCorrupt)?;
        self.ops.push(bytes);
        Ok(())
    }

    /// Lay the accumulated ops out across as many interim pages as needed,
    /// chaining them via `next`, and return the head position to record as
    /// `Header::journal_header`.
    pub fn finish<F: File>(mut self, sheaf: &Sheaf<F>, catalog: &mut PageCatalog) -> Result<Position> {
        self.push(JournalOp::Terminate)?;

        let page_size = sheaf.page_size() as usize;
        let capacity = page_size - NEXT_LEN;

        let mut pages: Vec<Vec<u8>> = Vec::new();
        let mut current = Vec::new();
        for record in &self.ops {
            let needed = LEN_LEN + record.len();
            if !current.is_empty() && current.len() + needed > capacity {
                pages.push(std::mem::take(&mut current));
            }
            if needed > capacity {
                return Err(Error::HeaderCorrupt);
            }
            current.extend_from_slice(U32::new(record.len() as u32).as_bytes());
            current.extend_from_slice(record);
        }
        pages.push(current);

        let positions: Vec<Position> = pages
            .iter()
            .map(|_| catalog.allocate(sheaf))
            .collect::<Result<_>>()?;

        for (i, body) in pages.iter().enumerate() {
            let pos = positions[i];
            let next = positions.get(i + 1).copied().unwrap_or(Position::NULL);
            sheaf.with_mut(pos, |buf| {
                for b in buf.iter_mut().take(page_size) {
                    *b = 0;
                }
                NextPointer { next: U64::new(next.0) }
                    .write_to_prefix(buf)
                    .unwrap();
                buf[NEXT_LEN..NEXT_LEN + body.len()].copy_from_slice(body);
            })?;
        }

        Ok(positions[0])
    }
}

impl Default for JournalWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay every op from `head` in order, stopping at `Terminate` or an
/// empty chain. `apply` is called once per op, including `Terminate`
/// itself so callers can react to end-of-journal (e.g. advance
/// `interim_boundary`).
pub fn replay<F: File>(
    sheaf: &Sheaf<F>,
    head: Position,
    mut apply: impl FnMut(&JournalOp) -> Result<()>,
) -> Result<()> {
    if head.is_null() {
        return Ok(());
    }

    let mut pos = head;
    loop {
        let (next, ops) = sheaf.with(pos, |buf| {
            let (ptr, _) = NextPointer::read_from_prefix(buf).unwrap();
            let mut offset = NEXT_LEN;
            let mut ops = Vec::new();
            loop {
                if offset + LEN_LEN > buf.len() {
                    break;
                }
                let (len, _) = U32::read_from_prefix(&buf[offset..]).unwrap();
                let len = len.get() as usize;
                if len == 0 {
                    break;
                }
                offset += LEN_LEN;
                let op: JournalOp = bincode::deserialize(&buf[offset..offset + len])
                    .map_err(|_| Error::HeaderCorrupt)?;
                offset += len;
                let terminal = op == JournalOp::Terminate;
                ops.push(op);
                if terminal {
                    break;
                }
            }
            Ok::<_, Error>((Position(ptr.next.get()), ops))
        })??;

        let mut terminated = false;
        for op in &ops {
            if *op == JournalOp::Terminate {
                terminated = true;
            }
            apply(op)?;
        }
        if terminated {
            return Ok(());
        }

        if next.is_null() {
            return Ok(());
        }
        pos = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    fn sheaf() -> Sheaf<MemoryFile> {
        Sheaf::new(MemoryFile::new(), 64)
    }

    #[test]
    fn round_trips_a_short_journal() {
        let sheaf = sheaf();
        let mut catalog = PageCatalog::new();

        let mut w = JournalWriter::new();
        w.push(JournalOp::ReserveSlot { address: 8, page: 0 }).unwrap();
        w.push(JournalOp::Write { address: 8, page: 0, bytes: vec![1, 2, 3] })
            .unwrap();
        w.push(JournalOp::Checkpoint { interim_boundary: 128 }).unwrap();
        let head = w.finish(&sheaf, &mut catalog).unwrap();

        let mut seen = Vec::new();
        replay(&sheaf, head, |op| {
            seen.push(op.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                JournalOp::ReserveSlot { address: 8, page: 0 },
                JournalOp::Write { address: 8, page: 0, bytes: vec![1, 2, 3] },
                JournalOp::Checkpoint { interim_boundary: 128 },
                JournalOp::Terminate,
            ]
        );
    }

    #[test]
    fn spans_multiple_pages_when_it_does_not_fit() {
        let sheaf = sheaf();
        let mut catalog = PageCatalog::new();

        let mut w = JournalWriter::new();
        for i in 0..20u64 {
            w.push(JournalOp::Free { address: i }).unwrap();
        }
        let head = w.finish(&sheaf, &mut catalog).unwrap();

        let mut count = 0;
        replay(&sheaf, head, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 21); // 20 frees + Terminate
    }

    #[test]
    fn empty_head_replays_to_nothing() {
        let sheaf = sheaf();
        let mut seen = 0;
        replay(&sheaf, Position::NULL, |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 0);
    }
}
