//! Page Catalog (C2). Classifies each page position as Address / User-Block
//! / Interim-Block / Free and owns the transitions between them.
//!
//! Per DESIGN.md, kind is tracked implicitly rather than via a per-page disk
//! tag (which would have broken the block-page byte accounting in P5):
//! positions in `address_pages` are Address Pages, positions in `free_list`
//! are Free, positions tracked by the [`crate::remaining_index::ByRemainingIndex`]
//! are User Block Pages, and anything else is a page some in-flight
//! `Mutator`/`CommitEngine` is using as an Interim Block or Journal page —
//! those never outlive a single commit attempt, so there is nothing to
//! persist for them across a clean open.

use std::collections::VecDeque;

use crate::address_page::AddressPage;
use crate::error::{Error, Result};
use crate::file::File;
use crate::header::Header;
use crate::position::{Address, Position};
use crate::sheaf::Sheaf;

#[derive(Debug, Default)]
pub struct PageCatalog {
    free_list: VecDeque<Position>,
    address_pages: Vec<Position>,
}

impl PageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header(header: &Header) -> Self {
        PageCatalog {
            free_list: header.free_positions.iter().map(|&p| Position(p)).collect(),
            address_pages: header.address_pages.iter().map(|&p| Position(p)).collect(),
        }
    }

    pub fn snapshot_into(&self, header: &mut Header) {
        header.free_positions = self.free_list.iter().map(|p| p.0).collect();
        header.address_pages = self.address_pages.iter().map(|p| p.0).collect();
    }

    /// Hand back a free page, or extend the file by one page if none is
    /// available. Used for every page kind — the caller is responsible for
    /// (re)initializing the page's content for its intended use.
    pub fn allocate<F: File>(&mut self, sheaf: &Sheaf<F>) -> Result<Position> {
        if let Some(pos) = self.free_list.pop_front() {
            return Ok(pos);
        }
        sheaf.extend_one()
    }

    pub fn free(&mut self, pos: Position) {
        self.free_list.push_back(pos);
    }

    pub fn register_address_page(&mut self, pos: Position) {
        self.address_pages.push(pos);
    }

    pub fn address_pages(&self) -> &[Position] {
        &self.address_pages
    }

    pub fn free_list(&self) -> impl Iterator<Item = &Position> {
        self.free_list.iter()
    }

    /// Reserve a fresh address, creating a new Address Page first if every
    /// existing one is full.
    pub fn reserve_address<F: File>(&mut self, sheaf: &Sheaf<F>) -> Result<Address> {
        for pos in self.address_pages.clone() {
            if let Some(address) = AddressPage::reserve(sheaf, pos)? {
                return Ok(address);
            }
        }
        let pos = self.allocate(sheaf)?;
        AddressPage::init(sheaf, pos)?;
        self.register_address_page(pos);
        AddressPage::reserve(sheaf, pos)?.ok_or(Error::HeaderCorrupt)
    }
}
