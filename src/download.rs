//! Per-piece block bookkeeping.
//!
//! Each in-progress piece is represented by a [`PieceDownload`] tracking the
//! status of every block it comprises. Unlike the per-session ownership a
//! single-peer download could get away with, these are owned centrally by
//! the scheduler: multiple peer sessions can have blocks of the same piece
//! outstanding at once (most plainly during endgame), so there is no single
//! session the bookkeeping could live under without back-references between
//! sessions.

use std::time::Instant;

use crate::{block_count, block_len, BlockInfo, PieceIndex, SessionId, BLOCK_LEN};

/// A single session's outstanding hold on a block, recorded so endgame
/// duplicates and timeouts can be attributed to the right session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Hold {
    session: SessionId,
    requested_at: Instant,
}

/// The state of a single block within a [`PieceDownload`].
#[derive(Clone, Debug, PartialEq, Eq)]
enum BlockStatus {
    /// Not yet requested from any peer.
    Needed,
    /// Requested from one or more sessions; more than one holder means an
    /// endgame duplicate request is outstanding.
    Requested(Vec<Hold>),
    /// Written to disk (or at least handed off to the piece store).
    Received,
}

/// The outcome of delivering a block to [`PieceDownload::received_block`].
pub(crate) struct ReceivedBlock {
    /// Whether this was the last missing block of the piece.
    pub piece_complete: bool,
    /// Other sessions that still had this exact block outstanding (an
    /// endgame duplicate) and so must be sent a `cancel`.
    pub cancel: Vec<(SessionId, BlockInfo)>,
}

/// Tracks which blocks of a single piece are needed, requested, or received.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    blocks: Vec<BlockStatus>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        let block_count = block_count(piece_len);
        Self {
            piece_index,
            piece_len,
            blocks: vec![BlockStatus::Needed; block_count],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.piece_len, block_index),
        }
    }

    /// Picks up to `count` blocks that are not yet requested (or whose
    /// request has since been cancelled/timed out) and marks them as
    /// requested from `session`.
    ///
    /// During endgame the caller instead uses [`Self::pick_duplicate_blocks`]
    /// to also re-request blocks that are already outstanding elsewhere.
    pub fn pick_blocks(&mut self, count: usize, session: SessionId, now: Instant) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(count);
        for index in 0..self.blocks.len() {
            if picked.len() == count {
                break;
            }
            if self.blocks[index] == BlockStatus::Needed {
                let info = self.block_info(index);
                self.blocks[index] = BlockStatus::Requested(vec![Hold { session, requested_at: now }]);
                picked.push(info);
            }
        }
        picked
    }

    /// Picks up to `count` blocks that are currently requested from some
    /// *other* session and re-requests them from `session` too, for endgame
    /// duplication. Blocks already received, or already requested from
    /// `session` itself, are skipped.
    pub fn pick_duplicate_blocks(
        &mut self,
        count: usize,
        session: SessionId,
        now: Instant,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(count);
        for index in 0..self.blocks.len() {
            if picked.len() == count {
                break;
            }
            let info = self.block_info(index);
            if let BlockStatus::Requested(holders) = &mut self.blocks[index] {
                if !holders.iter().any(|h| h.session == session) {
                    holders.push(Hold { session, requested_at: now });
                    picked.push(info);
                }
            }
        }
        picked
    }

    /// Marks the block at `offset` as received from `from_session`. Returns
    /// whether this completes the piece, along with any other sessions that
    /// still held this exact block outstanding as an endgame duplicate.
    pub fn received_block(&mut self, offset: u32, from_session: SessionId) -> ReceivedBlock {
        let index = (offset / BLOCK_LEN) as usize;
        let info = self.block_info(index);
        let cancel = match self.blocks.get(index) {
            Some(BlockStatus::Requested(holders)) => holders
                .iter()
                .filter(|h| h.session != from_session)
                .map(|h| (h.session, info))
                .collect(),
            _ => Vec::new(),
        };
        if let Some(status) = self.blocks.get_mut(index) {
            *status = BlockStatus::Received;
        }
        ReceivedBlock { piece_complete: self.is_complete(), cancel }
    }

    /// Resets a specific in-flight request held by `session` back to needed
    /// (or, if other sessions still hold it, simply drops that session's
    /// hold). No-op if the block was already received.
    pub fn cancel_request(&mut self, offset: u32, session: SessionId) {
        let index = (offset / BLOCK_LEN) as usize;
        let became_empty = match self.blocks.get_mut(index) {
            Some(BlockStatus::Requested(holders)) => {
                holders.retain(|h| h.session != session);
                holders.is_empty()
            }
            _ => false,
        };
        if became_empty {
            self.blocks[index] = BlockStatus::Needed;
        }
    }

    /// Resets every request older than `deadline`, returning the
    /// `(session, block)` pairs that timed out so the caller can send a real
    /// `cancel` to each of those sessions.
    pub fn reclaim_timed_out(&mut self, deadline: Instant) -> Vec<(SessionId, BlockInfo)> {
        let mut reclaimed = Vec::new();
        for index in 0..self.blocks.len() {
            let info = self.block_info(index);
            let became_empty = match &mut self.blocks[index] {
                BlockStatus::Requested(holders) => {
                    let mut kept = Vec::new();
                    for hold in holders.drain(..) {
                        if hold.requested_at < deadline {
                            reclaimed.push((hold.session, info));
                        } else {
                            kept.push(hold);
                        }
                    }
                    *holders = kept;
                    holders.is_empty()
                }
                _ => false,
            };
            if became_empty {
                self.blocks[index] = BlockStatus::Needed;
            }
        }
        reclaimed
    }

    /// Resets every block held by `session` back to needed, for use when a
    /// session disconnects. Received blocks are left untouched.
    pub fn reclaim_session(&mut self, session: SessionId) {
        for index in 0..self.blocks.len() {
            let became_empty = match &mut self.blocks[index] {
                BlockStatus::Requested(holders) => {
                    holders.retain(|h| h.session != session);
                    holders.is_empty()
                }
                _ => false,
            };
            if became_empty {
                self.blocks[index] = BlockStatus::Needed;
            }
        }
    }

    /// The number of blocks not yet received (needed or requested).
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| !matches!(s, BlockStatus::Received))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|s| matches!(s, BlockStatus::Received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pick_blocks_marks_requested() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        let picked = download.pick_blocks(10, 1, Instant::now());
        assert_eq!(picked.len(), 2);
        assert_eq!(download.pick_blocks(10, 1, Instant::now()).len(), 0);
    }

    #[test]
    fn test_received_block_completes_piece() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        assert!(!download.received_block(0, 1).piece_complete);
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        download.pick_blocks(1, 1, Instant::now());
        assert!(download.received_block(0, 1).piece_complete);
        assert!(download.is_complete());
    }

    #[test]
    fn test_received_block_reports_other_holders_to_cancel() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        download.pick_blocks(1, 1, Instant::now());
        download.pick_duplicate_blocks(1, 2, Instant::now());

        let result = download.received_block(0, 1);
        assert!(result.piece_complete);
        assert_eq!(result.cancel.len(), 1);
        assert_eq!(result.cancel[0].0, 2);

        // the receiving session itself is never in its own cancel list
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        download.pick_blocks(1, 1, Instant::now());
        let result = download.received_block(0, 1);
        assert!(result.cancel.is_empty());
    }

    #[test]
    fn test_reclaim_timed_out() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        let past = Instant::now();
        download.pick_blocks(1, 1, past);
        let deadline = past + std::time::Duration::from_secs(1);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let reclaimed = download.reclaim_timed_out(deadline + std::time::Duration::from_secs(1));
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0, 1);
        assert_eq!(download.count_missing_blocks(), 1);
    }

    #[test]
    fn test_reclaim_timed_out_only_evicts_expired_holders() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        let early = Instant::now();
        download.pick_blocks(1, 1, early);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let late = Instant::now();
        download.pick_duplicate_blocks(1, 2, late);

        // deadline between `early` and `late`: only session 1's hold expired
        let deadline = early + std::time::Duration::from_micros(500);
        let reclaimed = download.reclaim_timed_out(deadline);
        assert_eq!(reclaimed, vec![(1, download.block_info(0))]);
        // session 2 still holds it, so the block isn't back to `Needed`
        assert!(download.pick_blocks(1, 3, Instant::now()).is_empty());
    }

    #[test]
    fn test_pick_duplicate_blocks_skips_same_session() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        download.pick_blocks(2, 1, Instant::now());
        let dup = download.pick_duplicate_blocks(2, 1, Instant::now());
        assert!(dup.is_empty());
        let dup = download.pick_duplicate_blocks(2, 2, Instant::now());
        assert_eq!(dup.len(), 2);
    }

    #[test]
    fn test_reclaim_session_resets_only_that_sessions_blocks() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        download.pick_blocks(1, 1, Instant::now());
        download.pick_blocks(1, 2, Instant::now());
        download.reclaim_session(1);
        assert_eq!(download.count_missing_blocks(), 2);
        let remaining = download.pick_blocks(10, 3, Instant::now());
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn test_cancel_request_only_affects_holder() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        download.pick_blocks(1, 1, Instant::now());
        download.cancel_request(0, 2);
        assert_eq!(download.count_missing_blocks(), 1);
        download.cancel_request(0, 1);
        let picked = download.pick_blocks(1, 3, Instant::now());
        assert_eq!(picked.len(), 1);
    }
}
