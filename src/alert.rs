//! Alerts the engine reports back to the application embedding it.
//!
//! This is the only channel through which the engine communicates torrent
//! progress and failures outward; nothing in [`crate::torrent`] or
//! [`crate::disk`] is public API.

use tokio::sync::mpsc;

use crate::{PieceIndex, TorrentId};

pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
/// The receiving half of the engine's alert channel, handed to the
/// application by [`crate::engine::Engine::spawn`].
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// A notification about a torrent's progress or a failure within it.
#[derive(Debug, Clone)]
pub enum Alert {
    /// A piece was written to disk and passed hash verification.
    PieceCompleted {
        torrent_id: TorrentId,
        piece_index: PieceIndex,
    },
    /// A piece failed hash verification after all its blocks were written;
    /// it has been marked as needed again and will be re-downloaded.
    HashFailed {
        torrent_id: TorrentId,
        piece_index: PieceIndex,
    },
    /// All of the torrent's pieces have been downloaded and verified.
    DownloadComplete { torrent_id: TorrentId },
    /// A non-fatal error occurred while running the torrent (a tracker
    /// announce failed, a disk write failed). The torrent keeps running.
    TorrentError {
        torrent_id: TorrentId,
        message: String,
    },
}
