//! Block Page (C4). Append-only packed blocks, used for both User Block
//! Pages and Interim Block Pages — they share this layout and differ only
//! in lifecycle, tracked by the caller (catalog / mutator), not here.
//!
//! Wire layout per page: `{ u32 count, Record[] }`, `Record = { i32 size,
//! i64 address, payload[|size|-12] }`; a negative `size` tombstones a freed
//! block while preserving its payload bytes as slack, exactly as §3
//! specifies. When checksums are enabled the last 4 bytes of `payload` are
//! a CRC32 of the bytes before it rather than a separate header field —
//! this keeps the on-disk `Record` shape exactly as specified while still
//! giving every block an optional integrity check (see DESIGN.md).

use std::collections::HashMap;

use zerocopy::byteorder::big_endian::{I32, I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::file::File;
use crate::position::{Address, Position};
use crate::sheaf::Sheaf;

pub(crate) const COUNT_LEN: usize = std::mem::size_of::<U32>();
pub const RECORD_HEADER_LEN: usize = std::mem::size_of::<I32>() + std::mem::size_of::<I64>();
const CRC_LEN: usize = 4;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
struct RecordHeader {
    size: I32,
    address: I64,
}

pub struct BlockPage;

struct RecordLoc {
    offset: usize,
    size: i32,
}

impl BlockPage {
    /// Total on-page bytes a record for `payload_len` raw bytes will occupy,
    /// including the checksum trailer if enabled. Used by placement
    /// planning, which needs this before any page is touched.
    pub fn record_len(payload_len: usize, checksums: bool) -> usize {
        let payload_len = if checksums { payload_len + CRC_LEN } else { payload_len };
        RECORD_HEADER_LEN + payload_len
    }

    pub fn init<F: File>(sheaf: &Sheaf<F>, pos: Position) -> Result<()> {
        let page_size = sheaf.page_size() as usize;
        sheaf.with_mut(pos, |buf| {
            for b in buf.iter_mut().take(page_size) {
                *b = 0;
            }
        })
    }

    fn count(buf: &[u8]) -> u32 {
        let (c, _) = U32::read_from_prefix(buf).unwrap();
        c.get()
    }

    fn set_count(buf: &mut [u8], count: u32) {
        U32::new(count).write_to_prefix(buf).unwrap();
    }

    /// Walk every record (live or tombstoned), in append order.
    fn records(buf: &[u8]) -> Vec<RecordLoc> {
        let count = Self::count(buf);
        let mut offset = COUNT_LEN;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (header, _) = RecordHeader::read_from_prefix(&buf[offset..]).unwrap();
            let size = header.size.get();
            out.push(RecordLoc { offset, size });
            offset += size.unsigned_abs() as usize;
        }
        out
    }

    pub fn bytes_remaining<F: File>(sheaf: &Sheaf<F>, pos: Position) -> Result<u32> {
        let page_size = sheaf.page_size();
        sheaf.with(pos, |buf| {
            let used: i64 = Self::records(buf)
                .iter()
                .map(|r| r.size.unsigned_abs() as i64)
                .sum();
            page_size as i64 - COUNT_LEN as i64 - used
        })
        .map(|v| v.max(0) as u32)
    }

    /// How many records — live or tombstoned — a page holds. Lets a caller
    /// distinguish a virgin page (never appended to) from one that is
    /// fully tombstoned; both have no live blocks, but only the latter has
    /// dead space worth reclaiming.
    pub fn record_count<F: File>(sheaf: &Sheaf<F>, pos: Position) -> Result<u32> {
        sheaf.with(pos, |buf| Self::count(buf))
    }

    /// Live (address, payload length) pairs, in append order.
    pub fn block_sizes<F: File>(
        sheaf: &Sheaf<F>,
        pos: Position,
        checksums: bool,
    ) -> Result<HashMap<Address, usize>> {
        sheaf.with(pos, |buf| {
            Self::records(buf)
                .iter()
                .filter(|r| r.size > 0)
                .map(|r| {
                    let (header, _) = RecordHeader::read_from_prefix(&buf[r.offset..]).unwrap();
                    let address = Address(header.address.get() as u64);
                    let payload_len = r.size as usize - RECORD_HEADER_LEN;
                    let len = if checksums {
                        payload_len - CRC_LEN
                    } else {
                        payload_len
                    };
                    (address, len)
                })
                .collect()
        })
    }

    /// Append a new live record. Panics if the page lacks room — callers
    /// must consult [`Self::bytes_remaining`] while planning, since by the
    /// time a commit is applying its journal this can no longer fail.
    pub fn append<F: File>(
        sheaf: &Sheaf<F>,
        pos: Position,
        address: Address,
        bytes: &[u8],
        checksums: bool,
    ) -> Result<()> {
        let payload_len = if checksums {
            bytes.len() + CRC_LEN
        } else {
            bytes.len()
        };
        let record_len = RECORD_HEADER_LEN + payload_len;

        sheaf.with_mut(pos, |buf| {
            let count = Self::count(buf);
            let records = Self::records(buf);
            let write_offset = records
                .last()
                .map(|r| r.offset + r.size.unsigned_abs() as usize)
                .unwrap_or(COUNT_LEN);

            assert!(
                write_offset + record_len <= buf.len(),
                "block page overflow: planning invariant violated"
            );

            let header = RecordHeader {
                size: I32::new(record_len as i32),
                address: I64::new(address.0 as i64),
            };
            header
                .write_to_prefix(&mut buf[write_offset..])
                .unwrap();

            let payload_offset = write_offset + RECORD_HEADER_LEN;
            buf[payload_offset..payload_offset + bytes.len()].copy_from_slice(bytes);
            if checksums {
                let crc = crc32fast::hash(bytes);
                buf[payload_offset + bytes.len()..payload_offset + payload_len]
                    .copy_from_slice(&crc.to_be_bytes());
            }

            Self::set_count(buf, count + 1);
        })
    }

    pub fn read<F: File>(
        sheaf: &Sheaf<F>,
        pos: Position,
        address: Address,
        checksums: bool,
    ) -> Result<Vec<u8>> {
        sheaf.with(pos, |buf| {
            let found = Self::records(buf).into_iter().find(|r| {
                r.size > 0 && {
                    let (header, _) = RecordHeader::read_from_prefix(&buf[r.offset..]).unwrap();
                    header.address.get() as u64 == address.0
                }
            });

            let r = found.ok_or(Error::InvalidAddress(address))?;
            let payload_offset = r.offset + RECORD_HEADER_LEN;
            let payload_len = r.size as usize - RECORD_HEADER_LEN;
            let payload = &buf[payload_offset..payload_offset + payload_len];

            if checksums {
                let (data, crc_bytes) = payload.split_at(payload_len - CRC_LEN);
                let expected = u32::from_be_bytes(crc_bytes.try_into().unwrap());
                if crc32fast::hash(data) != expected {
                    return Err(Error::BlockCorrupt(pos));
                }
                Ok(data.to_vec())
            } else {
                Ok(payload.to_vec())
            }
        })?
    }

    /// Negate the size of the first live record for `address`, tombstoning
    /// it while preserving its payload bytes as slack.
    pub fn free<F: File>(sheaf: &Sheaf<F>, pos: Position, address: Address) -> Result<()> {
        sheaf.with_mut(pos, |buf| {
            let found = Self::records(buf).into_iter().find(|r| {
                r.size > 0 && {
                    let (header, _) = RecordHeader::read_from_prefix(&buf[r.offset..]).unwrap();
                    header.address.get() as u64 == address.0
                }
            });

            let r = found.ok_or(Error::InvalidAddress(address))?;
            I32::new(-r.size)
                .write_to_prefix(&mut buf[r.offset..])
                .unwrap();
            Ok(())
        })?
    }

    /// Append every live block of `src` into `dest`, preserving order.
    /// Returns the new position each surviving address's block now lives
    /// at (always `dest`, included for callers that want a uniform
    /// `address -> position` map to republish).
    pub fn copy_to<F: File>(
        sheaf: &Sheaf<F>,
        src: Position,
        dest: Position,
        checksums: bool,
    ) -> Result<Vec<Address>> {
        let live: Vec<(Address, Vec<u8>)> = {
            let addrs = Self::block_sizes(sheaf, src, checksums)?;
            let mut out = Vec::with_capacity(addrs.len());
            for (addr, _) in addrs {
                out.push((addr, Self::read(sheaf, src, addr, checksums)?));
            }
            out
        };

        let mut moved = Vec::with_capacity(live.len());
        for (addr, bytes) in live {
            Self::append(sheaf, dest, addr, &bytes, checksums)?;
            moved.push(addr);
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    fn sheaf() -> Sheaf<MemoryFile> {
        let s = Sheaf::new(MemoryFile::new(), 256);
        s.extend_one().unwrap();
        s
    }

    #[test]
    fn append_and_read_with_checksum() {
        let sheaf = sheaf();
        BlockPage::init(&sheaf, Position(0)).unwrap();

        let a = Address(1);
        BlockPage::append(&sheaf, Position(0), a, b"hello", true).unwrap();

        assert_eq!(
            BlockPage::read(&sheaf, Position(0), a, true).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn free_tombstones_and_preserves_invariant() {
        let sheaf = sheaf();
        BlockPage::init(&sheaf, Position(0)).unwrap();

        let a = Address(1);
        let b = Address(2);
        BlockPage::append(&sheaf, Position(0), a, b"one-two-three", false).unwrap();
        BlockPage::append(&sheaf, Position(0), b, b"four-five-six", false).unwrap();

        BlockPage::free(&sheaf, Position(0), a).unwrap();

        assert!(matches!(
            BlockPage::read(&sheaf, Position(0), a, false),
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(
            BlockPage::read(&sheaf, Position(0), b, false).unwrap(),
            b"four-five-six"
        );

        let remaining = BlockPage::bytes_remaining(&sheaf, Position(0)).unwrap();
        let used: usize = sheaf
            .with(Position(0), |buf| {
                BlockPage::records(buf)
                    .iter()
                    .map(|r| r.size.unsigned_abs() as usize)
                    .sum()
            })
            .unwrap();
        assert_eq!(remaining as usize + used + COUNT_LEN, 256);
    }

    #[test]
    fn copy_to_preserves_live_blocks_only() {
        let sheaf = sheaf();
        sheaf.extend_one().unwrap();
        BlockPage::init(&sheaf, Position(0)).unwrap();
        BlockPage::init(&sheaf, Position(256)).unwrap();

        let a = Address(10);
        let b = Address(20);
        BlockPage::append(&sheaf, Position(0), a, b"alive", false).unwrap();
        BlockPage::append(&sheaf, Position(0), b, b"dead", false).unwrap();
        BlockPage::free(&sheaf, Position(0), b).unwrap();

        let moved = BlockPage::copy_to(&sheaf, Position(0), Position(256), false).unwrap();
        assert_eq!(moved, vec![a]);
        assert_eq!(
            BlockPage::read(&sheaf, Position(256), a, false).unwrap(),
            b"alive"
        );
    }
}
