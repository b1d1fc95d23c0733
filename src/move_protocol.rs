//! Move Protocol (C9). Vacuum and best-fit placement both want to relocate
//! a block from one User Block Page to another without disturbing its
//! address. A single move is just "copy the block, repoint the Address
//! Page slot, free the old slot" — the protocol here only exists to order
//! a *batch* of simultaneous moves safely, since a naive move of A before
//! B can clobber B's source page if B's destination happens to be A's
//! source (or, in the degenerate case, a closed loop of such dependencies).
//!
//! Moves are proposed as a plain `from -> to` map rather than a linked
//! arena of records, since nothing here needs a stable handle to a move
//! after it's proposed — the map already gives O(1) cycle detection via
//! membership tests.

use std::collections::HashMap;

use crate::error::Result;
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMove {
    pub from: Position,
    pub to: Position,
}

#[derive(Debug, Default)]
pub struct MovePlan {
    moves: HashMap<Position, Position>,
}

impl MovePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose relocating the page at `from` to `to`. A self-move (`from ==
    /// to`) is elided entirely — there's nothing to do.
    pub fn propose(&mut self, from: Position, to: Position) {
        if from != to {
            self.moves.insert(from, to);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Resolve the batch into an execution order safe to apply directly
    /// (copy `from`'s live blocks into `to`, repoint addresses, free
    /// `from`) one `ResolvedMove` at a time, front to back.
    ///
    /// A move is safe to execute once its destination is not itself a
    /// pending source — otherwise executing it would overwrite content
    /// that still needs to move out first. When every remaining move's
    /// destination is also a pending source, the remaining moves form a
    /// cycle; `temporary` is called to obtain a scratch page that breaks
    /// it, at the cost of one extra move.
    pub fn resolve(mut self, mut temporary: impl FnMut() -> Result<Position>) -> Result<Vec<ResolvedMove>> {
        let mut order = Vec::with_capacity(self.moves.len());

        while !self.moves.is_empty() {
            let ready = self
                .moves
                .keys()
                .find(|from| !self.moves.contains_key(&self.moves[*from]))
                .copied();

            match ready {
                Some(from) => {
                    let to = self.moves.remove(&from).unwrap();
                    order.push(ResolvedMove { from, to });
                }
                None => {
                    // Every pending move's destination is also a pending
                    // source: break the cycle at an arbitrary node.
                    let from = *self.moves.keys().next().unwrap();
                    let real_to = self.moves.remove(&from).unwrap();
                    let temp = temporary()?;
                    order.push(ResolvedMove { from, to: temp });
                    self.moves.insert(temp, real_to);
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_move_is_elided() {
        let mut plan = MovePlan::new();
        plan.propose(Position(8), Position(8));
        assert!(plan.is_empty());
    }

    #[test]
    fn independent_moves_need_no_temporary() {
        let mut plan = MovePlan::new();
        plan.propose(Position(8), Position(16));
        plan.propose(Position(24), Position(32));

        let resolved = plan
            .resolve(|| panic!("should not need a temporary"))
            .unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn chain_runs_tail_first() {
        // A -> B -> C: executing A->B before B->C would overwrite B's
        // still-pending source content, so B->C must run first.
        let mut plan = MovePlan::new();
        plan.propose(Position(8), Position(16));
        plan.propose(Position(16), Position(24));

        let resolved = plan
            .resolve(|| panic!("should not need a temporary"))
            .unwrap();
        assert_eq!(
            resolved,
            vec![
                ResolvedMove { from: Position(16), to: Position(24) },
                ResolvedMove { from: Position(8), to: Position(16) },
            ]
        );
    }

    #[test]
    fn cycle_breaks_via_temporary() {
        let mut plan = MovePlan::new();
        plan.propose(Position(8), Position(16));
        plan.propose(Position(16), Position(8));

        let mut temps = vec![Position(1000)].into_iter();
        let resolved = plan.resolve(|| Ok(temps.next().unwrap())).unwrap();

        assert_eq!(resolved.len(), 3);
        // The destination of every move but the last must already have
        // been vacated by an earlier move (or be the temporary).
        let mut vacated = std::collections::HashSet::new();
        for mv in &resolved {
            vacated.insert(mv.from);
        }
        for (i, mv) in resolved.iter().enumerate() {
            if i > 0 {
                assert!(vacated.contains(&mv.to) || mv.to == Position(1000));
            }
        }
    }
}
