//! The piece/block request scheduler.
//!
//! Where the rest of this crate's actors each own one concern (one peer
//! connection, one disk), the scheduler is deliberately centralized: it is
//! the single place that knows about every block request outstanding across
//! every peer session of a torrent. A per-session picker can't implement
//! endgame mode (duplicating the torrent's last few blocks across multiple
//! peers) or a global timeout sweep without either reaching into other
//! sessions' state or routing everything through messages first, so those
//! responsibilities live here instead, with [`crate::piece_picker::PiecePicker`]
//! and [`crate::download::PieceDownload`] as its building blocks.
//!
//! The torrent actor drives the scheduler directly (it's plain, synchronous
//! state, not a task of its own) and forwards its decisions to peer sessions
//! as commands.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::download::PieceDownload;
use crate::piece_picker::PiecePicker;
use crate::storage_info::StorageInfo;
use crate::{Bitfield, BlockInfo, PieceIndex, SessionId, BLOCK_LEN};

/// A peer session's state as seen by the scheduler: whether it currently
/// chokes us (we may not request anything while choked) and the pieces it
/// has announced, kept so a disconnect can be unwound from the picker.
struct PeerState {
    bitfield: Bitfield,
    is_choked: bool,
}

/// Owns every in-flight block request of a torrent's download.
pub(crate) struct Scheduler {
    piece_picker: PiecePicker,
    downloads: HashMap<PieceIndex, PieceDownload>,
    peers: HashMap<SessionId, PeerState>,
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    request_queue_len: usize,
    endgame_threshold: usize,
    request_timeout: Duration,
    endgame: bool,
}

impl Scheduler {
    pub fn new(
        storage: &StorageInfo,
        request_queue_len: usize,
        endgame_threshold: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            piece_picker: PiecePicker::new(storage.piece_count),
            downloads: HashMap::new(),
            peers: HashMap::new(),
            piece_count: storage.piece_count,
            piece_len: storage.piece_len,
            last_piece_len: storage.last_piece_len,
            request_queue_len,
            endgame_threshold,
            request_timeout,
            endgame: false,
        }
    }

    /// Registers a newly connected peer's full bitfield, received right
    /// after the handshake.
    pub fn register_peer(&mut self, session: SessionId, bitfield: Bitfield) {
        self.piece_picker.register_availability(&bitfield);
        self.peers.insert(session, PeerState { bitfield, is_choked: true });
    }

    /// Registers a single `have` announcement from an already-known peer.
    pub fn peer_have(&mut self, session: SessionId, piece_index: PieceIndex) {
        self.piece_picker.register_piece_availability(piece_index);
        if let Some(peer) = self.peers.get_mut(&session) {
            if let Some(mut bit) = peer.bitfield.get_mut(piece_index) {
                *bit = true;
            }
        }
    }

    /// Replaces a known peer's bitfield wholesale, e.g. when it re-sends one
    /// after the initial handshake exchange. Reconciles availability counts
    /// against the old bitfield before adopting the new one.
    pub fn peer_bitfield_replaced(&mut self, session: SessionId, bitfield: Bitfield) {
        match self.peers.get_mut(&session) {
            Some(peer) => {
                self.piece_picker.deregister_availability(&peer.bitfield);
                self.piece_picker.register_availability(&bitfield);
                peer.bitfield = bitfield;
            }
            None => {
                self.piece_picker.register_availability(&bitfield);
                self.peers.insert(session, PeerState { bitfield, is_choked: true });
            }
        }
    }

    /// Records that a peer has choked us: every block it was holding is
    /// released back to the needed pool so another peer can pick it up.
    pub fn peer_choked(&mut self, session: SessionId) {
        if let Some(peer) = self.peers.get_mut(&session) {
            peer.is_choked = true;
        }
        for download in self.downloads.values_mut() {
            download.reclaim_session(session);
        }
    }

    pub fn peer_unchoked(&mut self, session: SessionId) {
        if let Some(peer) = self.peers.get_mut(&session) {
            peer.is_choked = false;
        }
    }

    /// Unregisters a disconnected peer, reclaiming every block request it
    /// was holding and removing its pieces from the availability counts.
    pub fn unregister_peer(&mut self, session: SessionId) {
        if let Some(peer) = self.peers.remove(&session) {
            self.piece_picker.deregister_availability(&peer.bitfield);
        }
        for download in self.downloads.values_mut() {
            download.reclaim_session(session);
        }
    }

    /// Tops up `session`'s outstanding request queue up to
    /// `request_queue_len`, given it currently has `outstanding` requests
    /// pending. Returns the new block requests to send, choosing pieces
    /// rarest-first among those the peer has.
    ///
    /// Returns an empty vector if the peer is choked, has no pieces we
    /// still need, or is already at its queue limit.
    pub fn fill_queue(&mut self, session: SessionId, outstanding: usize, now: Instant) -> Vec<BlockInfo> {
        let budget = self.request_queue_len.saturating_sub(outstanding);
        if budget == 0 {
            return Vec::new();
        }
        match self.peers.get(&session) {
            Some(peer) if !peer.is_choked => {}
            _ => return Vec::new(),
        }

        let mut requests = Vec::with_capacity(budget);
        while requests.len() < budget {
            let remaining = budget - requests.len();
            match self.pick_blocks_for(session, remaining, now) {
                Some(mut blocks) if !blocks.is_empty() => requests.append(&mut blocks),
                _ => break,
            }
        }
        requests
    }

    /// Picks up to `count` blocks for `session` from either a piece already
    /// in progress or a freshly started rarest piece the peer has. Returns
    /// `None` once there is nothing left this peer can contribute to,
    /// whether because it lacks any needed piece or (outside endgame) every
    /// needed piece's blocks are already all spoken for.
    fn pick_blocks_for(&mut self, session: SessionId, count: usize, now: Instant) -> Option<Vec<BlockInfo>> {
        // first, try to keep making progress on pieces already in flight
        for download in self.downloads.values_mut() {
            let has_piece = self
                .peers
                .get(&session)
                .and_then(|p| p.bitfield.get(download.piece_index()).map(|b| *b))
                .unwrap_or(false);
            if !has_piece {
                continue;
            }
            let picked = download.pick_blocks(count, session, now);
            if !picked.is_empty() {
                return Some(picked);
            }
        }

        // nothing to continue: start a new piece, rarest first, among
        // those the peer actually has
        let peer_bitfield = self.peers.get(&session).map(|p| p.bitfield.clone())?;
        let piece_index = self.piece_picker.pick_rarest(|index| {
            peer_bitfield.get(index).map_or(false, |b| *b) && !self.downloads.contains_key(&index)
        })?;

        let piece_len = self.piece_len_for(piece_index);
        let mut download = PieceDownload::new(piece_index, piece_len);
        let picked = download.pick_blocks(count, session, now);
        self.downloads.insert(piece_index, download);

        if picked.is_empty() {
            // Endgame: every piece is already in progress with every peer
            // we could pick from. Duplicate blocks held by other sessions.
            if self.endgame {
                for download in self.downloads.values_mut() {
                    let dup = download.pick_duplicate_blocks(count, session, now);
                    if !dup.is_empty() {
                        return Some(dup);
                    }
                }
            }
            None
        } else {
            Some(picked)
        }
    }

    fn piece_len_for(&self, index: PieceIndex) -> u32 {
        if self.piece_count > 0 && index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Records that `offset` of `piece_index` was received from `session`.
    /// Returns `Some(piece_index)` if this completed the piece, in which
    /// case the caller is responsible for verifying its hash and, if it
    /// doesn't match, calling [`Self::reset_piece`]. Also returns every
    /// other session that still had this exact block outstanding as an
    /// endgame duplicate, each of which the caller must send a real `cancel`
    /// to so it stops waiting on (and the store doesn't later receive) a
    /// block that's already been written.
    pub fn received_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        session: SessionId,
    ) -> (Option<PieceIndex>, Vec<(SessionId, BlockInfo)>) {
        let result = match self.downloads.get_mut(&piece_index) {
            Some(download) => download.received_block(offset, session),
            None => return (None, Vec::new()),
        };
        if result.piece_complete {
            self.downloads.remove(&piece_index);
            self.piece_picker.received_piece(piece_index);
            (Some(piece_index), result.cancel)
        } else {
            (None, result.cancel)
        }
    }

    /// Resets a piece whose hash failed verification so its blocks are
    /// requested again from scratch.
    pub fn reset_piece(&mut self, piece_index: PieceIndex, piece_len: u32) {
        self.piece_picker.mark_needed(piece_index);
        self.downloads.insert(piece_index, PieceDownload::new(piece_index, piece_len));
    }

    /// Marks a piece as already complete without having downloaded it,
    /// e.g. one found valid by a rescan-on-open pass at startup.
    pub fn mark_piece_complete(&mut self, piece_index: PieceIndex) {
        self.downloads.remove(&piece_index);
        self.piece_picker.received_piece(piece_index);
    }

    /// Sweeps all in-progress pieces for requests that have been
    /// outstanding longer than the configured timeout, releasing them back
    /// to the needed pool. Also latches endgame mode on if the total count
    /// of missing blocks has dropped to the configured threshold.
    ///
    /// Returns the `(session, block)` pairs that timed out so the caller can
    /// send a real `cancel` to each holding session.
    pub fn tick(&mut self, now: Instant) -> Vec<(SessionId, BlockInfo)> {
        let deadline = now - self.request_timeout;
        let mut cancellations = Vec::new();
        for download in self.downloads.values_mut() {
            let reclaimed = download.reclaim_timed_out(deadline);
            if !reclaimed.is_empty() {
                log::debug!(
                    "Reclaimed {} timed out block request(s) for piece {}",
                    reclaimed.len(),
                    download.piece_index()
                );
                cancellations.extend(reclaimed);
            }
        }

        if !self.endgame {
            let missing_blocks: usize =
                self.downloads.values().map(|d| d.count_missing_blocks()).sum();
            if missing_blocks > 0 && missing_blocks <= self.endgame_threshold {
                log::info!("Entering endgame mode ({} blocks remaining)", missing_blocks);
                self.endgame = true;
            }
        }

        cancellations
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn count_missing_pieces(&self) -> usize {
        self.piece_picker.count_missing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn storage(piece_count: usize, piece_len: u32) -> StorageInfo {
        let length = piece_len as u64 * piece_count as u64;
        let metainfo = Metainfo {
            announce: "http://tracker.example.com/announce".into(),
            info: Info {
                name: "foo.bin".into(),
                pieces: vec![0u8; piece_count * 20],
                piece_length: piece_len as u64,
                length: Some(length),
                files: None,
                private: None,
            },
        };
        StorageInfo::new(&metainfo, PathBuf::from("/tmp"))
    }

    fn full_bitfield(len: usize) -> Bitfield {
        Bitfield::repeat(true, len)
    }

    #[test]
    fn test_fill_queue_respects_queue_len() {
        let storage = storage(4, BLOCK_LEN * 2);
        let mut scheduler = Scheduler::new(&storage, 3, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(4));
        scheduler.peer_unchoked(1);

        let requests = scheduler.fill_queue(1, 0, Instant::now());
        assert_eq!(requests.len(), 3);
    }

    #[test]
    fn test_fill_queue_empty_while_choked() {
        let storage = storage(2, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(2));
        // still choked (default on registration)
        assert!(scheduler.fill_queue(1, 0, Instant::now()).is_empty());
    }

    #[test]
    fn test_received_block_completes_piece_and_updates_picker() {
        let storage = storage(1, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        let requests = scheduler.fill_queue(1, 0, Instant::now());
        assert_eq!(requests.len(), 1);

        let (completed, cancel) = scheduler.received_block(0, requests[0].offset, 1);
        assert_eq!(completed, Some(0));
        assert!(cancel.is_empty());
        assert_eq!(scheduler.count_missing_pieces(), 0);
    }

    #[test]
    fn test_received_block_cancels_endgame_duplicate_holders() {
        let storage = storage(1, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 10, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        let requests = scheduler.fill_queue(1, 0, Instant::now());
        scheduler.tick(Instant::now());
        assert!(scheduler.is_endgame());

        scheduler.register_peer(2, full_bitfield(1));
        scheduler.peer_unchoked(2);
        let duplicate_requests = scheduler.fill_queue(2, 0, Instant::now());
        assert_eq!(duplicate_requests.len(), 1);
        assert_eq!(duplicate_requests[0].offset, requests[0].offset);

        let (completed, cancel) = scheduler.received_block(0, requests[0].offset, 1);
        assert_eq!(completed, Some(0));
        assert_eq!(cancel, vec![(2, requests[0])]);
    }

    #[test]
    fn test_unregister_peer_reclaims_its_requests() {
        let storage = storage(1, BLOCK_LEN * 2);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        let requests = scheduler.fill_queue(1, 0, Instant::now());
        assert_eq!(requests.len(), 2);

        scheduler.unregister_peer(1);

        scheduler.register_peer(2, full_bitfield(1));
        scheduler.peer_unchoked(2);
        let requests = scheduler.fill_queue(2, 0, Instant::now());
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_tick_reclaims_timed_out_requests() {
        let storage = storage(1, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_millis(10));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        let now = Instant::now();
        let original = scheduler.fill_queue(1, 0, now);

        let cancellations = scheduler.tick(now + Duration::from_secs(1));
        assert_eq!(cancellations, vec![(1, original[0])]);

        let requests = scheduler.fill_queue(2, 0, now + Duration::from_secs(1));
        // session 2 was never registered, so it should get nothing, but the
        // request should be reclaimed and available to a registered peer
        assert!(requests.is_empty());
        scheduler.register_peer(2, full_bitfield(1));
        scheduler.peer_unchoked(2);
        let requests = scheduler.fill_queue(2, 0, now + Duration::from_secs(1));
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_tick_latches_endgame_mode() {
        let storage = storage(1, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 10, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        scheduler.fill_queue(1, 0, Instant::now());

        assert!(!scheduler.is_endgame());
        scheduler.tick(Instant::now());
        assert!(scheduler.is_endgame());
    }

    #[test]
    fn test_peer_choked_releases_its_blocks() {
        let storage = storage(1, BLOCK_LEN * 2);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        scheduler.fill_queue(1, 0, Instant::now());

        scheduler.peer_choked(1);

        scheduler.register_peer(2, full_bitfield(1));
        scheduler.peer_unchoked(2);
        let requests = scheduler.fill_queue(2, 0, Instant::now());
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_reset_piece_makes_it_missing_and_requestable_again() {
        let storage = storage(1, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        scheduler.register_peer(1, full_bitfield(1));
        scheduler.peer_unchoked(1);
        let requests = scheduler.fill_queue(1, 0, Instant::now());
        scheduler.received_block(0, requests[0].offset, 1);
        assert_eq!(scheduler.count_missing_pieces(), 0);

        scheduler.reset_piece(0, BLOCK_LEN);
        assert_eq!(scheduler.count_missing_pieces(), 1);

        let requests = scheduler.fill_queue(1, 0, Instant::now());
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_mark_piece_complete_without_downloading() {
        let storage = storage(2, BLOCK_LEN);
        let mut scheduler = Scheduler::new(&storage, 4, 0, Duration::from_secs(30));
        assert_eq!(scheduler.count_missing_pieces(), 2);

        scheduler.mark_piece_complete(0);
        assert_eq!(scheduler.count_missing_pieces(), 1);

        scheduler.register_peer(1, full_bitfield(2));
        scheduler.peer_unchoked(1);
        let requests = scheduler.fill_queue(1, 0, Instant::now());
        // only piece 1 should ever be offered, never the already-complete piece 0
        assert!(requests.iter().all(|b| b.piece_index == 1));
    }
}
