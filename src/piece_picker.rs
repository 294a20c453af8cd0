//! Rarest-first piece selection.
//!
//! The picker only tracks *availability*: how many connected peers have
//! announced each piece. It has no notion of in-flight requests or which
//! peer a piece was picked for — that bookkeeping belongs to the scheduler,
//! which owns all outstanding block requests across every peer session. This
//! split keeps the picker a small, easily-tested piece of arithmetic.

use crate::{Bitfield, PieceIndex};

/// Tracks, for each piece of a torrent, how many connected peers have it.
pub(crate) struct PiecePicker {
    /// `availability[i]` is the number of connected peers known to have
    /// piece `i`.
    availability: Vec<u32>,
    /// Pieces we already have or have verified complete. Once a piece is
    /// marked complete it is never returned by [`Self::pick_rarest`] again,
    /// even if its availability count is still nonzero.
    have: Bitfield,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            availability: vec![0; piece_count],
            have: Bitfield::repeat(false, piece_count),
        }
    }

    /// Registers that a peer announced having `bitfield`, bumping the
    /// availability count of every piece it has.
    pub fn register_availability(&mut self, bitfield: &Bitfield) {
        for (index, has_piece) in bitfield.iter().enumerate().take(self.availability.len()) {
            if *has_piece {
                self.availability[index] += 1;
            }
        }
    }

    /// Registers that a peer announced having a single additional piece (a
    /// `have` message), bumping that piece's availability count.
    pub fn register_piece_availability(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    /// Reverses a previous [`Self::register_availability`] call, for when a
    /// peer disconnects. Availability counts are saturating since a piece
    /// the peer announced before we started counting (or that we've already
    /// marked complete and stopped tracking precisely) must not underflow.
    pub fn deregister_availability(&mut self, bitfield: &Bitfield) {
        for (index, has_piece) in bitfield.iter().enumerate().take(self.availability.len()) {
            if *has_piece {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
    }

    /// Marks a piece as complete so it is no longer offered by
    /// [`Self::pick_rarest`].
    pub fn received_piece(&mut self, index: PieceIndex) {
        if let Some(mut bit) = self.have.get_mut(index) {
            *bit = true;
        }
    }

    /// Reverses a previous [`Self::received_piece`], for when a completed
    /// piece fails hash verification and must be downloaded again.
    pub fn mark_needed(&mut self, index: PieceIndex) {
        if let Some(mut bit) = self.have.get_mut(index) {
            *bit = false;
        }
    }

    /// Returns whether the picker considers `index` already complete.
    pub fn have(&self, index: PieceIndex) -> bool {
        self.have.get(index).map_or(true, |bit| *bit)
    }

    /// Returns the rarest piece for which `is_candidate` returns `true` (the
    /// caller uses this to exclude pieces that are already fully requested,
    /// or that the given peer doesn't have), or `None` if no such piece
    /// exists.
    ///
    /// Ties in availability are broken by picking the lowest index, which
    /// keeps selection deterministic and, incidentally, favors completing
    /// the start of the file first.
    pub fn pick_rarest(&self, is_candidate: impl Fn(PieceIndex) -> bool) -> Option<PieceIndex> {
        self.have
            .iter()
            .enumerate()
            .filter(|(index, has)| !**has && is_candidate(*index))
            .min_by_key(|(index, _)| self.availability[*index])
            .map(|(index, _)| index)
    }

    /// The number of pieces not yet marked complete.
    pub fn count_missing(&self) -> usize {
        self.have.count_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::iter::FromIterator;

    fn bitfield(bits: &[bool]) -> Bitfield {
        Bitfield::from_iter(bits.iter().copied())
    }

    #[test]
    fn test_register_availability_counts() {
        let mut picker = PiecePicker::new(3);
        picker.register_availability(&bitfield(&[true, false, true]));
        picker.register_availability(&bitfield(&[true, true, false]));
        assert_eq!(picker.availability, vec![2, 1, 1]);
    }

    #[test]
    fn test_pick_rarest_prefers_lower_availability() {
        let mut picker = PiecePicker::new(3);
        // piece 0 is common, piece 1 is rare, piece 2 nobody has
        picker.register_availability(&bitfield(&[true, false, false]));
        picker.register_availability(&bitfield(&[true, false, false]));
        picker.register_availability(&bitfield(&[true, true, false]));

        let picked = picker.pick_rarest(|_| true);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn test_pick_rarest_breaks_ties_by_lowest_index() {
        let picker = PiecePicker::new(3);
        assert_eq!(picker.pick_rarest(|_| true), Some(0));
    }

    #[test]
    fn test_pick_rarest_skips_completed_pieces() {
        let mut picker = PiecePicker::new(2);
        picker.received_piece(0);
        assert_eq!(picker.pick_rarest(|_| true), Some(1));
    }

    #[test]
    fn test_pick_rarest_respects_candidate_filter() {
        let picker = PiecePicker::new(3);
        assert_eq!(picker.pick_rarest(|index| index == 2), Some(2));
    }

    #[test]
    fn test_pick_rarest_none_when_all_complete() {
        let mut picker = PiecePicker::new(2);
        picker.received_piece(0);
        picker.received_piece(1);
        assert_eq!(picker.pick_rarest(|_| true), None);
    }

    #[test]
    fn test_deregister_availability_is_saturating() {
        let mut picker = PiecePicker::new(1);
        picker.deregister_availability(&bitfield(&[true]));
        assert_eq!(picker.availability, vec![0]);
    }

    #[test]
    fn test_count_missing() {
        let mut picker = PiecePicker::new(3);
        assert_eq!(picker.count_missing(), 3);
        picker.received_piece(1);
        assert_eq!(picker.count_missing(), 2);
    }
}
