//! Opener / Creator and the top-level `Pack` handle (C11).
//!
//! `Creator` formats a brand-new file; `Opener` boots an existing one,
//! replaying any journal left behind by a commit that crashed before
//! retiring and truncating away any page extensions that commit made but
//! never checkpointed. Both hand back a `Pack`, the handle callers mutate
//! and vacuum through.

use parking_lot::Mutex;

use crate::address_page::AddressPage;
use crate::block_page::BlockPage;
use crate::catalog::PageCatalog;
use crate::error::Result;
use crate::file::File;
use crate::header::{Header, StaticEntry, SHUTDOWN_CLEAN, SHUTDOWN_DIRTY};
use crate::journal::{self, JournalOp};
use crate::mutator::Mutator;
use crate::position::{Address, Position, DEFAULT_PAGE_SIZE};
use crate::remaining_index::ByRemainingIndex;
use crate::sheaf::Sheaf;
use crate::vacuum::VacuumPlanner;

pub(crate) struct PackState {
    pub catalog: PageCatalog,
    pub remaining_index: ByRemainingIndex,
    pub header: Header,
}

pub struct Pack<F> {
    sheaf: Sheaf<F>,
    state: Mutex<PackState>,
}

impl<F: File> Pack<F> {
    pub(crate) fn sheaf(&self) -> &Sheaf<F> {
        &self.sheaf
    }

    /// Begin a write transaction. Only one may be open at a time; this
    /// blocks until any other in-flight `Mutator` is committed or dropped.
    pub fn mutate(&self) -> Mutator<'_, F> {
        Mutator::new(self, self.state.lock())
    }

    /// Read an address's current committed content, outside any
    /// transaction.
    pub fn read(&self, address: Address) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let pos = AddressPage::get(&self.sheaf, address)?;
        BlockPage::read(&self.sheaf, pos, address, state.header.checksums)
    }

    pub fn get_static_blocks(&self) -> Vec<StaticEntry> {
        self.state.lock().header.statics.clone()
    }

    pub fn get_temporary_blocks(&self) -> Vec<Address> {
        self.state
            .lock()
            .header
            .temporary_addresses
            .iter()
            .map(|&a| Address(a))
            .collect()
    }

    /// Run one round of the vacuum planner, relocating live blocks off of
    /// mostly-dead user block pages and returning those pages to the
    /// catalog. Returns the number of pages drained.
    pub fn vacuum(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let plan = VacuumPlanner::plan(&self.sheaf, &state.remaining_index, state.header.checksums)?;
        if plan.is_empty() {
            return Ok(0);
        }
        let moved = plan.apply(&self.sheaf, &mut state)?;
        Ok(moved)
    }

    /// Flush and fsync without closing — mostly useful for tests that want
    /// to assert on-disk content without tearing the pack down.
    pub fn sync(&self) -> Result<()> {
        self.sheaf.force()
    }

    /// Mark the pack cleanly closed. After this, reopening skips journal
    /// replay — there is nothing to replay.
    pub fn close(self) -> Result<()> {
        let mut state = self.state.lock();
        state.header.shutdown_flag = SHUTDOWN_CLEAN;
        state.header.write(&self.sheaf)?;
        self.sheaf.force()
    }
}

pub struct Creator {
    page_size: u32,
    checksums: bool,
    statics: Vec<(String, u32)>,
}

impl Creator {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            checksums: true,
            statics: Vec::new(),
        }
    }

    pub fn set_page_size(&mut self, page_size: u32) -> &mut Self {
        self.page_size = page_size;
        self
    }

    pub fn set_checksums(&mut self, enabled: bool) -> &mut Self {
        self.checksums = enabled;
        self
    }

    /// Reserve a fixed-size static block under `uri`, pre-zeroed. Statics
    /// exist for content known at creation time (schema blobs, fixed
    /// configuration) that callers want to address without going through a
    /// `Mutator`.
    pub fn add_static_page(&mut self, uri: impl Into<String>, block_size: u32) -> &mut Self {
        self.statics.push((uri.into(), block_size));
        self
    }

    pub fn create(&self, file: F) -> Result<Pack<F>>
    where
        F: File,
    {
        let sheaf = Sheaf::new(file, self.page_size);
        sheaf.extend_one()?; // page 0: the header

        let mut header = Header::new(self.page_size);
        header.checksums = self.checksums;
        let mut catalog = PageCatalog::new();

        for (uri, block_size) in &self.statics {
            let address = catalog.reserve_address(&sheaf)?;
            let pos = catalog.allocate(&sheaf)?;
            BlockPage::init(&sheaf, pos)?;
            let payload = vec![0u8; *block_size as usize];
            BlockPage::append(&sheaf, pos, address, &payload, header.checksums)?;
            AddressPage::set(&sheaf, address, pos)?;
            header.statics.push(StaticEntry {
                uri: uri.clone(),
                address: address.0,
                block_size: *block_size,
            });
        }

        let user_block_pages: Vec<Position> = Vec::new();
        let remaining_index = ByRemainingIndex::rebuild(&sheaf, &user_block_pages)?;

        catalog.snapshot_into(&mut header);
        header.user_block_pages = remaining_index.snapshot_positions();
        header.interim_boundary = sheaf.page_count()? * self.page_size as u64;
        header.write(&sheaf)?;
        sheaf.force()?;

        Ok(Pack {
            sheaf,
            state: Mutex::new(PackState {
                catalog,
                remaining_index,
                header,
            }),
        })
    }
}

impl Default for Creator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Opener;

impl Opener {
    pub fn new() -> Self {
        Self
    }

    pub fn open<F: File>(&self, file: F) -> Result<Pack<F>> {
        let page_size = crate::header::peek_page_size(&file)?;
        let sheaf = Sheaf::new(file, page_size);

        let mut header = Header::read(&sheaf)?;
        let mut catalog = PageCatalog::from_header(&header);
        let user_block_pages: Vec<Position> = header
            .user_block_pages
            .iter()
            .map(|&p| Position(p))
            .collect();
        let mut remaining_index = ByRemainingIndex::rebuild(&sheaf, &user_block_pages)?;

        if header.journal_header != 0 {
            log::warn!("open: replaying journal at {} after unclean shutdown", header.journal_header);
            replay_journal(&sheaf, &mut header, &mut catalog, &mut remaining_index)?;
        }

        // Truncate away any page extension from a commit that never made
        // it to retire — everything beyond `interim_boundary` is orphaned.
        let boundary = Position(header.interim_boundary);
        if sheaf.page_count()? * sheaf.page_size() as u64 > boundary.0 {
            sheaf.truncate_to(boundary)?;
        }

        header.shutdown_flag = SHUTDOWN_DIRTY;
        header.write(&sheaf)?;
        sheaf.force()?;

        Ok(Pack {
            sheaf,
            state: Mutex::new(PackState {
                catalog,
                remaining_index,
                header,
            }),
        })
    }
}

impl Default for Opener {
    fn default() -> Self {
        Self::new()
    }
}

fn replay_journal<F: File>(
    sheaf: &Sheaf<F>,
    header: &mut Header,
    catalog: &mut PageCatalog,
    remaining_index: &mut ByRemainingIndex,
) -> Result<()> {
    let checksums = header.checksums;
    let head = Position(header.journal_header);

    journal::replay(sheaf, head, |op| {
        match op {
            JournalOp::CreateAddressPage { pos } => {
                let pos = Position(*pos);
                AddressPage::init(sheaf, pos)?;
                catalog.register_address_page(pos);
            }
            JournalOp::ReserveSlot { .. } => {
                // Reservation happens synchronously at `Mutator::allocate`
                // time, against shared state already persisted by whatever
                // commit preceded this one; nothing to redo.
            }
            JournalOp::Write { address, page, bytes } => {
                let address = Address(*address);
                let page = Position(*page);
                let already_applied = AddressPage::get(sheaf, address).ok() == Some(page);
                if !already_applied {
                    BlockPage::append(sheaf, page, address, bytes, checksums)?;
                    AddressPage::set(sheaf, address, page)?;
                }
                let remaining = BlockPage::bytes_remaining(sheaf, page)?;
                remaining_index.update(page, remaining);
            }
            JournalOp::Free { address } => {
                let address = Address(*address);
                if let Ok(pos) = AddressPage::get(sheaf, address) {
                    let _ = BlockPage::free(sheaf, pos, address);
                    let _ = AddressPage::free(sheaf, address);
                    let remaining = BlockPage::bytes_remaining(sheaf, pos)?;
                    remaining_index.update(pos, remaining);
                }
            }
            JournalOp::Move { address, from, to } => {
                let address = Address(*address);
                let to = Position(*to);
                let already_applied = AddressPage::get(sheaf, address).ok() == Some(to);
                if !already_applied {
                    BlockPage::copy_to(sheaf, Position(*from), to, checksums)?;
                    AddressPage::set(sheaf, address, to)?;
                }
                let remaining = BlockPage::bytes_remaining(sheaf, to)?;
                remaining_index.update(to, remaining);
            }
            JournalOp::Checkpoint { interim_boundary } => {
                header.interim_boundary = *interim_boundary;
            }
            JournalOp::Terminate => {}
        }
        Ok(())
    })?;

    header.journal_header = 0;
    catalog.snapshot_into(header);
    header.user_block_pages = remaining_index.snapshot_positions();
    Ok(())
}
