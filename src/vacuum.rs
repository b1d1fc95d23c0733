//! Vacuum Planner (C10). Finds User Block Pages that are mostly empty,
//! relocates their live blocks elsewhere via the same best-fit index the
//! commit path uses, and returns the freed pages to the catalog.
//!
//! Relocation here never needs the cycle-breaking half of the Move
//! Protocol (`move_protocol.rs`): pages are append-only, so writing a
//! block into its destination never depends on its source having been
//! vacated first — only whole-page identity swaps would need that, and
//! vacuum never proposes one (a page is only ever a destination for other
//! pages' content, never simultaneously drained into and refilled from the
//! same partner).

use std::collections::HashMap;

use crate::address_page::AddressPage;
use crate::block_page::{BlockPage, COUNT_LEN};
use crate::error::Result;
use crate::file::File;
use crate::journal::{JournalOp, JournalWriter};
use crate::pack::PackState;
use crate::position::{Address, Position};
use crate::remaining_index::ByRemainingIndex;
use crate::sheaf::Sheaf;

/// A page is a vacuum candidate once more than half of it is free — an
/// arbitrary but simple threshold; tightening it trades fewer, larger
/// compactions for more frequent, smaller ones.
const DRAIN_THRESHOLD_NUM: u32 = 1;
const DRAIN_THRESHOLD_DEN: u32 = 2;

struct PlannedMove {
    address: Address,
    from: Position,
    to: Position,
}

pub struct VacuumPlan {
    moves: Vec<PlannedMove>,
    drained: Vec<Position>,
}

impl VacuumPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.drained.is_empty()
    }

    /// Applies the plan, returning how many pages were drained back to the
    /// catalog (the externally meaningful measure of progress — a page can
    /// be drained with zero moves if everything on it was already dead).
    pub fn apply<F: File>(self, sheaf: &Sheaf<F>, state: &mut PackState) -> Result<usize> {
        let checksums = state.header.checksums;
        let drained_count = self.drained.len();
        let moved = self.moves.len();
        log::info!(
            "vacuum: draining {} page(s), relocating {} block(s)",
            self.drained.len(),
            moved
        );

        let mut writer = JournalWriter::new();
        for mv in &self.moves {
            writer.push(JournalOp::Move {
                address: mv.address.0,
                from: mv.from.0,
                to: mv.to.0,
            })?;
        }
        let head = writer.finish(sheaf, &mut state.catalog)?;

        // Same checkpoint discipline as `Mutator::commit`: the journal
        // pages `finish` just allocated already extended the file, so the
        // boundary has to move with them before this header becomes the
        // durable record a crash recovers from.
        state.header.interim_boundary = sheaf.page_count()? * sheaf.page_size() as u64;
        state.header.journal_header = head.0;
        state.header.write(sheaf)?;
        sheaf.force()?;

        for mv in &self.moves {
            let bytes = BlockPage::read(sheaf, mv.from, mv.address, checksums)?;
            BlockPage::append(sheaf, mv.to, mv.address, &bytes, checksums)?;
            AddressPage::set(sheaf, mv.address, mv.to)?;
            BlockPage::free(sheaf, mv.from, mv.address)?;

            let remaining = BlockPage::bytes_remaining(sheaf, mv.to)?;
            state.remaining_index.update(mv.to, remaining);
        }

        for pos in &self.drained {
            BlockPage::init(sheaf, *pos)?;
            state.remaining_index.remove(*pos);
            state.catalog.free(*pos);
        }

        state.catalog.snapshot_into(&mut state.header);
        state.header.user_block_pages = state.remaining_index.snapshot_positions();
        state.header.journal_header = 0;
        state.header.write(sheaf)?;
        sheaf.force()?;

        Ok(drained_count)
    }
}

pub struct VacuumPlanner;

impl VacuumPlanner {
    pub fn plan<F: File>(
        sheaf: &Sheaf<F>,
        remaining_index: &ByRemainingIndex,
        checksums: bool,
    ) -> Result<VacuumPlan> {
        let page_size = sheaf.page_size();
        let mut positions: Vec<Position> = remaining_index.positions().copied().collect();
        positions.sort_by_key(|p| std::cmp::Reverse(remaining_index.remaining_of(*p).unwrap_or(0)));

        let mut projected: HashMap<Position, u32> = positions
            .iter()
            .map(|&p| (p, remaining_index.remaining_of(p).unwrap_or(0)))
            .collect();

        let mut moves = Vec::new();
        let mut drained = Vec::new();

        for &src in &positions {
            let live = BlockPage::block_sizes(sheaf, src, checksums)?;

            // A tombstoned record keeps its footprint (`bytes_remaining`
            // only ever shrinks on append), so the candidacy check has to
            // measure live bytes directly rather than trust the index's
            // appendable-space figure — that figure is still exactly right
            // for picking a *destination*, just not for judging a *source*.
            let live_bytes: u32 = live
                .values()
                .map(|&len| BlockPage::record_len(len, checksums) as u32)
                .sum();
            let dead = page_size
                .saturating_sub(COUNT_LEN as u32)
                .saturating_sub(live_bytes);

            if live.is_empty() {
                // A page with no live blocks is only worth draining if it
                // actually holds tombstoned ones — a virgin page that was
                // never appended to has nothing to reclaim, and chasing it
                // would just shuffle an empty page through the catalog.
                if BlockPage::record_count(sheaf, src)? > 0 {
                    drained.push(src);
                }
                continue;
            }
            if dead < page_size / DRAIN_THRESHOLD_DEN * DRAIN_THRESHOLD_NUM {
                continue;
            }

            let mut staged = Vec::with_capacity(live.len());
            let mut debits: Vec<(Position, u32)> = Vec::with_capacity(live.len());
            let mut ok = true;

            for (&addr, &payload_len) in &live {
                let need = BlockPage::record_len(payload_len, checksums) as u32;
                // A page already queued to drain this round is about to be
                // reinitialized in `apply` — never hand it content to hold.
                let dest = positions
                    .iter()
                    .copied()
                    .filter(|&p| p != src && !drained.contains(&p))
                    .find(|p| projected.get(p).copied().unwrap_or(0) >= need);

                match dest {
                    Some(dest) => {
                        *projected.get_mut(&dest).unwrap() -= need;
                        debits.push((dest, need));
                        staged.push(PlannedMove { address: addr, from: src, to: dest });
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }

            if ok {
                moves.extend(staged);
                drained.push(src);
            } else {
                for (pos, need) in debits {
                    *projected.get_mut(&pos).unwrap() += need;
                }
            }
        }

        Ok(VacuumPlan { moves, drained })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    fn sheaf() -> Sheaf<MemoryFile> {
        Sheaf::new(MemoryFile::new(), 256)
    }

    #[test]
    fn drains_a_mostly_empty_page_into_another() {
        let sheaf = sheaf();
        let empty = sheaf.extend_one().unwrap();
        let roomy = sheaf.extend_one().unwrap();
        BlockPage::init(&sheaf, empty).unwrap();
        BlockPage::init(&sheaf, roomy).unwrap();

        let a = Address(1000);
        BlockPage::append(&sheaf, empty, a, b"tiny", false).unwrap();

        let mut idx = ByRemainingIndex::new();
        idx.insert(empty, BlockPage::bytes_remaining(&sheaf, empty).unwrap());
        idx.insert(roomy, BlockPage::bytes_remaining(&sheaf, roomy).unwrap());

        let plan = VacuumPlanner::plan(&sheaf, &idx, false).unwrap();
        assert!(!plan.is_empty());
        assert_eq!(plan.drained, vec![empty]);
    }
}
