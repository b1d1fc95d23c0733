//! Address Page (C3). A contiguous array of 64-bit slots mapping an address
//! to the position of the block currently backing it.
//!
//! Per-slot reservation uses a monotonic high-water mark rather than a scan
//! for zero-valued slots, since an allocated-but-unwritten slot is *also*
//! zero (§4.3: "`get` ... of `0` returns `0`, meaning allocated, not yet
//! written") — value alone can't distinguish "never reserved" from
//! "reserved, pending". Freed slots are never reused by this mechanism,
//! which is one valid resolution of the "may or may not reuse" freedom P4
//! grants.

use zerocopy::byteorder::big_endian::{I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::file::File;
use crate::position::{Address, Position};
use crate::sheaf::Sheaf;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
struct AddressPageHeader {
    high_water_mark: U32,
    _reserved: U32,
}

const HEADER_LEN: usize = std::mem::size_of::<AddressPageHeader>();
const SLOT_LEN: usize = std::mem::size_of::<I64>();

pub struct AddressPage;

impl AddressPage {
    pub fn slot_count(page_size: u32) -> usize {
        (page_size as usize - HEADER_LEN) / SLOT_LEN
    }

    /// Zero out a freshly-allocated page so it's ready to serve reservations.
    pub fn init<F: File>(sheaf: &Sheaf<F>, pos: Position) -> Result<()> {
        let page_size = sheaf.page_size() as usize;
        sheaf.with_mut(pos, |buf| {
            for b in buf.iter_mut().take(page_size) {
                *b = 0;
            }
        })
    }

    /// Reserve the next unused slot, returning its address, or `None` if
    /// this page has no slots left (the caller should allocate another
    /// Address Page and retry there).
    pub fn reserve<F: File>(sheaf: &Sheaf<F>, pos: Position) -> Result<Option<Address>> {
        let page_size = sheaf.page_size();
        let slots = Self::slot_count(page_size);

        sheaf.with_mut(pos, |buf| {
            let (header, _) = AddressPageHeader::ref_from_prefix(buf).unwrap();
            let hwm = header.high_water_mark.get() as usize;
            if hwm >= slots {
                return None;
            }

            let slot_offset = HEADER_LEN + hwm * SLOT_LEN;
            I64::new(0).write_to_prefix(&mut buf[slot_offset..]).unwrap();

            let (header, _) = AddressPageHeader::mut_from_prefix(buf).unwrap();
            header.high_water_mark.set((hwm + 1) as u32);

            Some(Address(pos.0 + slot_offset as u64))
        })
    }

    pub fn get<F: File>(sheaf: &Sheaf<F>, address: Address) -> Result<Position> {
        let page_size = sheaf.page_size();
        let page_pos = address.page_position(page_size);
        let offset = address.offset_in_page(page_size);

        sheaf.with(page_pos, |buf| {
            let (slot, _) = I64::read_from_prefix(&buf[offset..]).unwrap();
            slot.get()
        })
        .and_then(|value| {
            if value == -1 {
                Err(Error::FreedAddress(address))
            } else {
                Ok(Position(value.max(0) as u64))
            }
        })
    }

    pub fn set<F: File>(sheaf: &Sheaf<F>, address: Address, value: Position) -> Result<()> {
        let page_size = sheaf.page_size();
        let page_pos = address.page_position(page_size);
        let offset = address.offset_in_page(page_size);

        sheaf.with_mut(page_pos, |buf| {
            I64::new(value.0 as i64)
                .write_to_prefix(&mut buf[offset..])
                .unwrap();
        })
    }

    pub fn free<F: File>(sheaf: &Sheaf<F>, address: Address) -> Result<()> {
        let page_size = sheaf.page_size();
        let page_pos = address.page_position(page_size);
        let offset = address.offset_in_page(page_size);

        sheaf.with_mut(page_pos, |buf| {
            I64::new(-1).write_to_prefix(&mut buf[offset..]).unwrap();
        })
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
    fn reserve_then_resolve() {
        let sheaf = sheaf();
        AddressPage::init(&sheaf, Position(0)).unwrap();

        let a = AddressPage::reserve(&sheaf, Position(0)).unwrap().unwrap();
        assert_eq!(AddressPage::get(&sheaf, a).unwrap(), Position(0));

        AddressPage::set(&sheaf, a, Position(128)).unwrap();
        assert_eq!(AddressPage::get(&sheaf, a).unwrap(), Position(128));

        AddressPage::free(&sheaf, a).unwrap();
        assert!(matches!(
            AddressPage::get(&sheaf, a),
            Err(Error::FreedAddress(_))
        ));
    }

    #[test]
    fn reservations_are_distinct_and_exhaustible() {
        let sheaf = sheaf();
        AddressPage::init(&sheaf, Position(0)).unwrap();

        let slots = AddressPage::slot_count(256);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..slots {
            let a = AddressPage::reserve(&sheaf, Position(0)).unwrap().unwrap();
            assert!(seen.insert(a.0));
        }
        assert!(AddressPage::reserve(&sheaf, Position(0)).unwrap().is_none());
    }
}
