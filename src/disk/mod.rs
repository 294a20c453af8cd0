//! The piece store: the actor responsible for verifying and persisting
//! downloaded blocks to the torrent's single output file.
//!
//! Like [`crate::peer`], disk IO is organized as a task driven by a command
//! channel, with results and failures reported back on a separate alert
//! channel rather than as direct return values. This keeps the torrent
//! actor from blocking on disk IO and avoids a cyclic dependency between the
//! torrent and disk tasks.

pub mod error;
mod io;

use tokio::sync::mpsc;
use tokio::task;

use crate::error::Result;
use crate::storage_info::StorageInfo;
use crate::{BlockInfo, PieceIndex, TorrentId};

use error::{NewTorrentError, WriteError};
use io::Disk;

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// A command sent to the disk task.
pub(crate) enum Command {
    /// Registers a new torrent, allocating its output file. If `rescan` is
    /// set and the file already existed at the expected length, every
    /// piece is hashed up front and matches are reported back as already
    /// complete.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        rescan: bool,
    },
    /// Queues a downloaded block for writing. Once all of a piece's blocks
    /// have arrived, the disk task hashes and persists the whole piece in
    /// one go.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Shuts down the disk event loop.
    Shutdown,
}

/// An engine-wide disk alert, currently only ever torrent allocation
/// results; per-torrent alerts go out on that torrent's own
/// [`TorrentAlert`] channel instead, handed out here on success.
pub(crate) enum Alert {
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

/// Returned when a torrent is successfully registered with the disk task:
/// the channel on which that torrent's own write results will arrive.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
    /// Pieces found to already be complete and valid on disk, from a
    /// rescan-on-open pass. Empty unless `Command::NewTorrent::rescan` was
    /// set and the file pre-existed at the right length.
    pub verified_pieces: Vec<PieceIndex>,
}

/// An alert scoped to a single torrent.
pub(crate) enum TorrentAlert {
    /// The result of writing a completed piece's blocks to disk, including
    /// whether the piece's hash matched.
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
}

/// Describes a batch of blocks written to disk as part of completing a
/// piece.
pub(crate) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub piece_index: PieceIndex,
    pub is_piece_valid: bool,
}

/// A handle to the spawned disk task: a command sender plus the join handle
/// of the task itself, so the torrent engine can await clean shutdown.
pub(crate) struct DiskHandle {
    pub cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task on the current tokio runtime and returns a
    /// handle to it along with the engine-wide alert receiver.
    pub fn spawn() -> Result<(Self, AlertReceiver)> {
        let (mut disk, cmd_chan, alert_port) = Disk::new()?;
        task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk task exited with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    pub fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        rescan: bool,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::NewTorrent { id, info, piece_hashes, rescan })?;
        Ok(())
    }

    pub fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        self.cmd_chan.send(Command::WriteBlock { id, info, data })?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}
