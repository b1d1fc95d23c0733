//! Mutator (C7). A single in-flight write transaction.
//!
//! Only one `Mutator` exists at a time — `Pack::mutate` hands out a
//! `MutexGuard` over the pack's mutable state for the mutator's whole
//! lifetime, which is both the transaction's isolation boundary and the
//! commit engine's serialization point (§9's "commits are totally ordered").
//! Address reservation happens immediately against shared state (cheap and
//! safe, since nothing else can be reserving concurrently); actual block
//! placement is deferred to `commit`, which plans, journals, applies and
//! retires in one pass. Dropping a `Mutator` without calling `commit` rolls
//! it back: any addresses it reserved are released (never reused, per
//! `address_page.rs`) and no write, free, or temporary it staged ever
//! touched a page.

use std::collections::{HashMap, HashSet};

use parking_lot::MutexGuard;

use crate::address_page::AddressPage;
use crate::block_page::BlockPage;
use crate::error::{Error, Result};
use crate::file::File;
use crate::journal::{JournalOp, JournalWriter};
use crate::pack::{Pack, PackState};
use crate::position::{Address, Position};

pub struct Mutator<'p, F: File> {
    pack: &'p Pack<F>,
    state: MutexGuard<'p, PackState>,
    reserved: Vec<Address>,
    temporaries: HashSet<Address>,
    pending_writes: HashMap<Address, Vec<u8>>,
    pending_frees: HashSet<Address>,
    committed: bool,
}

impl<'p, F: File> Mutator<'p, F> {
    pub(crate) fn new(pack: &'p Pack<F>, state: MutexGuard<'p, PackState>) -> Self {
        Self {
            pack,
            state,
            reserved: Vec::new(),
            temporaries: HashSet::new(),
            pending_writes: HashMap::new(),
            pending_frees: HashSet::new(),
            committed: false,
        }
    }

    /// Reserve a fresh address and stage `bytes` as its content.
    pub fn allocate(&mut self, bytes: impl Into<Vec<u8>>) -> Result<Address> {
        let address = self.state.catalog.reserve_address(self.pack.sheaf())?;
        self.reserved.push(address);
        self.pending_writes.insert(address, bytes.into());
        Ok(address)
    }

    /// Like [`Self::allocate`], but the address is recorded as a temporary
    /// block (surfaced separately by `Opener::get_temporary_blocks`) rather
    /// than an ordinary user address.
    pub fn temporary(&mut self, bytes: impl Into<Vec<u8>>) -> Result<Address> {
        let address = self.allocate(bytes)?;
        self.temporaries.insert(address);
        Ok(address)
    }

    /// Stage new content for an existing address. The old block is not
    /// touched until `commit` — the new content lands in a fresh location
    /// and the address is repointed only once the journal covering the
    /// switch is durable.
    pub fn write(&mut self, address: Address, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.pending_frees.remove(&address);
        self.pending_writes.insert(address, bytes.into());
        Ok(())
    }

    pub fn free(&mut self, address: Address) -> Result<()> {
        self.pending_writes.remove(&address);
        if let Some(i) = self.reserved.iter().position(|a| *a == address) {
            // Allocated and freed within the same transaction: nothing was
            // ever written, so just release the slot now.
            self.reserved.remove(i);
            self.temporaries.remove(&address);
            AddressPage::free(self.pack.sheaf(), address)?;
        } else {
            self.pending_frees.insert(address);
        }
        Ok(())
    }

    /// Read an address's current content, honoring this transaction's own
    /// uncommitted writes and frees before falling through to disk.
    pub fn read(&self, address: Address) -> Result<Vec<u8>> {
        if let Some(bytes) = self.pending_writes.get(&address) {
            return Ok(bytes.clone());
        }
        if self.pending_frees.contains(&address) {
            return Err(Error::InvalidAddress(address));
        }
        let sheaf = self.pack.sheaf();
        let pos = AddressPage::get(sheaf, address)?;
        BlockPage::read(sheaf, pos, address, self.state.header.checksums)
    }

    /// Plan placement, journal, apply and retire. On success every address
    /// touched by this transaction is durably visible to the next
    /// transaction and to a reopened pack.
    pub fn commit(mut self) -> Result<()> {
        let (placements, _journal_head) = self.checkpoint()?;
        self.apply_and_retire(placements)?;
        self.committed = true;
        Ok(())
    }

    /// Plan placement, emit the journal and make it durable. Once this
    /// returns, every byte this transaction needs has already extended the
    /// file, and the header on disk is the durable record a crash recovers
    /// from — `Opener::open` replays from here if the process dies before
    /// [`Self::apply_and_retire`] ever runs.
    fn checkpoint(&mut self) -> Result<(HashMap<Address, Position>, Position)> {
        let sheaf = self.pack.sheaf();
        let checksums = self.state.header.checksums;

        let mut placements: HashMap<Address, Position> = HashMap::new();
        let mut writer = JournalWriter::new();

        for (&address, bytes) in &self.pending_writes {
            let need = BlockPage::record_len(bytes.len(), checksums) as u32;
            let page = match self.state.remaining_index.best_fit(need) {
                Some(p) => p,
                None => {
                    let p = self.state.catalog.allocate(sheaf)?;
                    BlockPage::init(sheaf, p)?;
                    let remaining = BlockPage::bytes_remaining(sheaf, p)?;
                    self.state.remaining_index.insert(p, remaining);
                    p
                }
            };
            self.state.remaining_index.reserve(page, need);
            placements.insert(address, page);
            writer.push(JournalOp::Write {
                address: address.0,
                page: page.0,
                bytes: bytes.clone(),
            })?;
        }

        for &address in &self.pending_frees {
            writer.push(JournalOp::Free { address: address.0 })?;
        }

        let journal_head = writer.finish(sheaf, &mut self.state.catalog)?;

        // Checkpoint: by this point every page this transaction needed —
        // address pages reserved back in `allocate`, block pages picked in
        // the placement loop above, the journal pages just written — has
        // already extended the file. The header written here must account
        // for all of it, or a crash before retire leaves the next `Opener`
        // truncating away pages this very checkpoint depends on.
        self.state.catalog.snapshot_into(&mut self.state.header);
        self.state.header.user_block_pages = self.state.remaining_index.snapshot_positions();
        self.state.header.interim_boundary = sheaf.page_count()? * sheaf.page_size() as u64;
        self.state.header.journal_header = journal_head.0;
        self.state.header.write(sheaf)?;
        sheaf.force()?;
        log::debug!(
            "commit: journal at {} durable ({} writes, {} frees), interim_boundary={}",
            journal_head,
            placements.len(),
            self.pending_frees.len(),
            self.state.header.interim_boundary
        );

        Ok((placements, journal_head))
    }

    /// Write the planned blocks and frees into place, then retire: clear
    /// the journal pointer and make the new catalog/index state durable.
    fn apply_and_retire(&mut self, placements: HashMap<Address, Position>) -> Result<()> {
        let sheaf = self.pack.sheaf();
        let checksums = self.state.header.checksums;

        for (&address, &page) in &placements {
            let bytes = &self.pending_writes[&address];
            let is_new = self.reserved.contains(&address);
            let old_pos = if is_new {
                None
            } else {
                Some(AddressPage::get(sheaf, address)?)
            };

            BlockPage::append(sheaf, page, address, bytes, checksums)?;
            AddressPage::set(sheaf, address, page)?;
            let remaining = BlockPage::bytes_remaining(sheaf, page)?;
            self.state.remaining_index.update(page, remaining);

            if let Some(old) = old_pos {
                BlockPage::free(sheaf, old, address)?;
                let old_remaining = BlockPage::bytes_remaining(sheaf, old)?;
                self.state.remaining_index.update(old, old_remaining);
            }
        }

        for &address in &self.pending_frees {
            let pos = AddressPage::get(sheaf, address)?;
            BlockPage::free(sheaf, pos, address)?;
            AddressPage::free(sheaf, address)?;
            let remaining = BlockPage::bytes_remaining(sheaf, pos)?;
            self.state.remaining_index.update(pos, remaining);
        }

        self.state.catalog.snapshot_into(&mut self.state.header);
        self.state.header.user_block_pages = self.state.remaining_index.snapshot_positions();
        for address in &self.temporaries {
            if !self.state.header.temporary_addresses.contains(&address.0) {
                self.state.header.temporary_addresses.push(address.0);
            }
        }
        self.state.header.interim_boundary = sheaf.page_count()? * sheaf.page_size() as u64;
        self.state.header.journal_header = 0;
        self.state.header.write(sheaf)?;
        sheaf.force()?;

        log::debug!(
            "commit: retired, interim_boundary={}",
            self.state.header.interim_boundary
        );
        Ok(())
    }

    /// Explicitly discard this transaction. Equivalent to dropping the
    /// `Mutator` without calling `commit`.
    pub fn rollback(self) {}
}

impl<'p, F: File> Drop for Mutator<'p, F> {
    fn drop(&mut self) {
        if !self.committed {
            for address in self.reserved.drain(..) {
                let _ = AddressPage::free(self.pack.sheaf(), address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::file::MemoryFile;
    use crate::pack::{Creator, Opener};

    /// A process crash after the checkpoint fsync but before apply/retire
    /// ever runs must still leave the transaction durable on reopen —
    /// `mem::forget` stands in for the crash, since a real one never runs
    /// `Drop` either.
    #[test]
    fn crash_after_checkpoint_recovers_on_reopen() {
        let file = MemoryFile::new();
        let pack = Creator::new().set_page_size(128).create(file.clone()).unwrap();

        let mut txn = pack.mutate();
        let addr = txn.allocate(b"survives a crash".to_vec()).unwrap();
        txn.checkpoint().unwrap();
        std::mem::forget(txn);

        let reopened = Opener::new().open(file).unwrap();
        assert_eq!(reopened.read(addr).unwrap(), b"survives a crash");
    }

    /// Same crash point, but the transaction's first write also had to
    /// create a brand-new Address Page — that page must survive too, not
    /// just the block it points at.
    #[test]
    fn crash_after_checkpoint_preserves_a_freshly_created_address_page() {
        let file = MemoryFile::new();
        let pack = Creator::new().set_page_size(128).create(file.clone()).unwrap();

        let mut txn = pack.mutate();
        let addr = txn.allocate(b"first address on a new page".to_vec()).unwrap();
        txn.checkpoint().unwrap();
        std::mem::forget(txn);

        let reopened = Opener::new().open(file).unwrap();
        assert_eq!(
            reopened.read(addr).unwrap(),
            b"first address on a new page"
        );

        // And the pack is still usable afterward — the recovered catalog
        // knows about the page and can keep allocating on it.
        let mut txn = reopened.mutate();
        let addr2 = txn.allocate(b"second".to_vec()).unwrap();
        txn.commit().unwrap();
        assert_eq!(reopened.read(addr2).unwrap(), b"second");
    }
}
