use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use nix::sys::uio::{pread, pwrite};
use nix::unistd::fsync;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, RwLock};
use tokio::task;

use super::error::{NewTorrentError, WriteError};
use super::{
    Alert, AlertSender, BatchWrite, Command, CommandReceiver, CommandSender, TorrentAlert,
    TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
};
use crate::error::{Error, Result};
use crate::storage_info::StorageInfo;
use crate::{block_count, BlockInfo, PieceIndex, Sha1Hash, TorrentId};

/// The entity responsible for saving downloaded blocks to disk and
/// verifying whether downloaded pieces match their expected hash.
pub(super) struct Disk {
    /// Each registered torrent's storage state, keyed by its engine-wide id.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends engine-wide alerts.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiverAlias)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self { torrents: HashMap::new(), cmd_port, alert_chan },
            cmd_chan,
            alert_port,
        ))
    }

    /// Runs the disk event loop until shutdown or the command channel
    /// closes.
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, piece_hashes, rescan } => {
                    self.new_torrent(id, info, piece_hashes, rescan)?;
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_torrent(
        &mut self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        rescan: bool,
    ) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            self.alert_chan
                .send(Alert::TorrentAllocation(Err(NewTorrentError::AlreadyExists)))?;
            return Ok(());
        }

        // A failure here shouldn't kill the disk task: we log it and let
        // the engine decide what to do with the torrent.
        match Torrent::new(info, piece_hashes, rescan) {
            Ok((torrent, alert_port, verified_pieces)) => {
                log::info!("Torrent {} allocated, {} pieces already verified", id, verified_pieces.len());
                self.torrents.insert(id, RwLock::new(torrent));
                self.alert_chan.send(Alert::TorrentAllocation(Ok(TorrentAllocation {
                    id,
                    alert_port,
                    verified_pieces,
                })))?;
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                self.alert_chan.send(Alert::TorrentAllocation(Err(e)))?;
            }
        }
        Ok(())
    }

    async fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }
}

/// Alias kept local to this module so [`Disk::new`]'s signature doesn't
/// repeat the fully qualified alert receiver type.
type AlertReceiverAlias = super::AlertReceiver;

/// A torrent's disk IO state: the write buffer for in-progress pieces and
/// the open handle to its single output file.
struct Torrent {
    info: StorageInfo,
    alert_chan: TorrentAlertSender,
    /// In-progress piece downloads, i.e. the write buffer. Each piece is
    /// flushed and removed from here once all its blocks have arrived.
    pieces: HashMap<PieceIndex, Piece>,
    /// Pieces already verified and written, either by a prior successful
    /// write or by the rescan-on-open pass. Blocks for these are discarded
    /// rather than starting a new, never-completable write buffer.
    completed: HashSet<PieceIndex>,
    file: File,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    stats: Stats,
}

impl Torrent {
    /// Creates (or reopens) the torrent's output file, preallocated to its
    /// full length so later writes are always in-bounds `pwrite`s rather
    /// than file-growing appends.
    ///
    /// If `rescan` is set and the file already existed at the expected
    /// length, every piece is hashed against `piece_hashes` up front; pieces
    /// that already match are returned so the caller can mark them complete
    /// without re-downloading them.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        rescan: bool,
    ) -> Result<(Self, TorrentAlertReceiver, Vec<PieceIndex>), NewTorrentError> {
        if let Some(parent) = info.file.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&info.file.path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}: {}", info.file.path, e);
                NewTorrentError::Io(e)
            })?;
        let preexisting_len = file.metadata()?.len();
        file.set_len(info.download_len)?;

        let verified_pieces = if rescan && preexisting_len == info.download_len {
            log::info!("Rescanning existing file {:?} for already-complete pieces", info.file.path);
            rescan_pieces(&file, &info, &piece_hashes)
        } else {
            Vec::new()
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                completed: verified_pieces.iter().copied().collect(),
                file,
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
            verified_pieces,
        ))
    }

    async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if self.completed.contains(&piece_index) {
            log::trace!("Discarding block {:?} for already-complete piece", info);
            return Ok(());
        }
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(piece_index) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("piece just inserted is missing");
        piece.enqueue_block(info.offset, data);

        if !piece.is_complete() {
            return Ok(());
        }

        let piece = self.pieces.remove(&piece_index).expect("piece disappeared");
        let piece_offset = self.info.piece_offset(piece_index);
        let raw_fd = self.file.as_raw_fd();

        // hashing and the sync file write are both potentially expensive;
        // don't block the reactor with them
        let write_result = task::spawn_blocking(move || piece.verify_and_write(raw_fd, piece_offset))
            .await
            .expect("disk IO write task panicked");

        match write_result {
            Ok(write_count) => {
                if write_count.is_piece_valid {
                    self.completed.insert(piece_index);
                }
                self.stats.write_count += write_count.blocks.len() as u64;
                self.alert_chan.send(TorrentAlert::BatchWrite(Ok(write_count_to_batch(
                    piece_index,
                    write_count,
                ))))?;
            }
            Err(e) => {
                log::warn!("Disk write error for piece {}: {}", piece_index, e);
                self.stats.write_failure_count += 1;
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
            }
        }

        Ok(())
    }

    fn start_new_piece(&mut self, piece_index: PieceIndex) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", piece_index);

        let hash_pos = piece_index * 20;
        let hash_slice = self
            .piece_hashes
            .get(hash_pos..hash_pos + 20)
            .ok_or(WriteError::InvalidPieceIndex)?;
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);

        let len = self
            .info
            .piece_len(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;

        self.pieces.insert(
            piece_index,
            Piece { index: piece_index, expected_hash, len, blocks: BTreeMap::new() },
        );
        Ok(())
    }
}

/// Bundles a completed piece's write result into the alert payload shape
/// the torrent actor expects.
fn write_count_to_batch(piece_index: PieceIndex, write_result: PieceWriteResult) -> BatchWrite {
    BatchWrite {
        blocks: write_result.blocks,
        piece_index,
        is_piece_valid: write_result.is_piece_valid,
    }
}

#[derive(Default)]
struct Stats {
    write_count: u64,
    write_failure_count: usize,
}

/// The result of hashing and, if valid, persisting a completed piece.
struct PieceWriteResult {
    blocks: Vec<BlockInfo>,
    is_piece_valid: bool,
}

/// An in-progress piece's write buffer: the blocks received so far and the
/// hash they must collectively match before being flushed to disk.
struct Piece {
    index: PieceIndex,
    expected_hash: Sha1Hash,
    len: u32,
    /// Keyed by in-piece byte offset and kept sorted so hashing iterates
    /// blocks in piece order.
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        self.blocks.entry(offset).or_insert(data);
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes the buffered blocks, and if they match the expected hash,
    /// writes them to `fd` at `piece_offset` and fsyncs.
    ///
    /// Runs on a blocking thread pool; performs sync IO and SHA-1 hashing
    /// of up to one piece's worth of data.
    fn verify_and_write(self, fd: i32, piece_offset: u64) -> std::result::Result<PieceWriteResult, WriteError> {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));

        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        let is_piece_valid = hash.as_slice() == self.expected_hash;

        if !is_piece_valid {
            log::warn!(
                "Piece {} failed hash verification: expected {}, got {}",
                self.index,
                hex::encode(&self.expected_hash),
                hex::encode(hash)
            );
            return Ok(PieceWriteResult { blocks: Vec::new(), is_piece_valid: false });
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        let mut offset_in_torrent = piece_offset;
        for (offset, data) in &self.blocks {
            write_all_at(fd, data, offset_in_torrent)?;
            blocks.push(BlockInfo { piece_index: self.index, offset: *offset, len: data.len() as u32 });
            offset_in_torrent += data.len() as u64;
        }
        fsync(fd).map_err(WriteError::from)?;

        log::info!("Piece {} written and verified", self.index);
        Ok(PieceWriteResult { blocks, is_piece_valid: true })
    }
}

/// Hashes every piece of an already-present output file against the
/// torrent's expected piece hashes, returning the indices that match.
///
/// Runs synchronously on whatever thread calls it; only exercised once, at
/// startup, when rescanning is both requested and the file is already the
/// right length.
fn rescan_pieces(file: &File, info: &StorageInfo, piece_hashes: &[u8]) -> Vec<PieceIndex> {
    let fd = file.as_raw_fd();
    let mut verified = Vec::new();
    for index in 0..info.piece_count {
        let piece_len = match info.piece_len(index) {
            Ok(len) => len,
            Err(_) => break,
        };
        let hash_pos = index * 20;
        let expected = match piece_hashes.get(hash_pos..hash_pos + 20) {
            Some(hash) => hash,
            None => break,
        };

        let mut buf = vec![0u8; piece_len as usize];
        if read_exact_at(fd, &mut buf, info.piece_offset(index)).is_err() {
            continue;
        }

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        if hasher.finalize().as_slice() == expected {
            verified.push(index);
        }
    }
    verified
}

/// Reads exactly `buf.len()` bytes from `fd` at `offset`, looping in case
/// `pread` returns short (permitted by POSIX).
fn read_exact_at(fd: i32, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let count = pread(fd, &mut buf[read..], (offset + read as u64) as i64)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if count == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "pread returned 0"));
        }
        read += count;
    }
    Ok(())
}

/// Writes all of `buf` to `fd` at `offset`, looping in case the underlying
/// `pwrite` syscall writes fewer bytes than requested (permitted by POSIX).
fn write_all_at(fd: i32, buf: &[u8], offset: u64) -> std::result::Result<(), WriteError> {
    let mut written = 0;
    while written < buf.len() {
        let count = pwrite(fd, &buf[written..], (offset + written as u64) as i64)?;
        if count == 0 {
            return Err(WriteError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "pwrite returned 0",
            )));
        }
        written += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A unique path under the OS temp dir, good enough for tests that need
    /// a throwaway file on disk without pulling in a temp-file crate.
    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("leechcore-test-{}-{}", std::process::id(), name))
    }

    fn piece_with_blocks(index: PieceIndex, data: &[u8]) -> (Piece, Sha1Hash) {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(&digest);

        let mut blocks = BTreeMap::new();
        blocks.insert(0, data.to_vec());
        (Piece { index, expected_hash, len: data.len() as u32, blocks }, expected_hash)
    }

    #[test]
    fn test_piece_is_complete_when_all_blocks_present() {
        let (piece, _) = piece_with_blocks(0, &[1u8; crate::BLOCK_LEN as usize]);
        assert!(piece.is_complete());
    }

    #[test]
    fn test_piece_is_incomplete_with_missing_blocks() {
        let mut piece = Piece {
            index: 0,
            expected_hash: [0; 20],
            len: 2 * crate::BLOCK_LEN,
            blocks: BTreeMap::new(),
        };
        piece.enqueue_block(0, vec![1u8; crate::BLOCK_LEN as usize]);
        assert!(!piece.is_complete());
    }

    #[test]
    fn test_verify_and_write_accepts_matching_hash() {
        let path = temp_path("out.bin");
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path).unwrap();
        file.set_len(crate::BLOCK_LEN as u64).unwrap();

        let data = vec![7u8; crate::BLOCK_LEN as usize];
        let (piece, _) = piece_with_blocks(0, &data);
        let result = piece.verify_and_write(file.as_raw_fd(), 0).unwrap();
        assert!(result.is_piece_valid);
        assert_eq!(result.blocks.len(), 1);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, data);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_verify_and_write_rejects_bad_hash() {
        let mut piece = Piece {
            index: 0,
            expected_hash: [0xAB; 20],
            len: crate::BLOCK_LEN,
            blocks: BTreeMap::new(),
        };
        piece.enqueue_block(0, vec![1u8; crate::BLOCK_LEN as usize]);
        let result = piece.verify_and_write(-1, 0).unwrap();
        assert!(!result.is_piece_valid);
        assert!(result.blocks.is_empty());
    }

    fn storage_info(name: &str, piece_len: u32, piece_count: usize) -> StorageInfo {
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_len as u64 * piece_count as u64,
            file: crate::FileInfo { path: temp_path(name), len: piece_len as u64 * piece_count as u64 },
        }
    }

    #[test]
    fn test_rescan_pieces_finds_matching_pieces() {
        let piece_a = vec![1u8; crate::BLOCK_LEN as usize];
        let piece_b = vec![2u8; crate::BLOCK_LEN as usize];
        let info = storage_info("rescan.bin", crate::BLOCK_LEN, 2);

        let file = OpenOptions::new().create(true).read(true).write(true).open(&info.file.path).unwrap();
        file.set_len(info.download_len).unwrap();
        write_all_at(file.as_raw_fd(), &piece_a, 0).unwrap();
        write_all_at(file.as_raw_fd(), &piece_b, crate::BLOCK_LEN as u64).unwrap();

        let mut piece_hashes = Vec::new();
        let mut hasher = Sha1::new();
        hasher.update(&piece_a);
        piece_hashes.extend_from_slice(&hasher.finalize());
        // second piece's expected hash deliberately doesn't match its content
        piece_hashes.extend_from_slice(&[0xAB; 20]);

        let verified = rescan_pieces(&file, &info, &piece_hashes);
        assert_eq!(verified, vec![0]);

        let _ = std::fs::remove_file(&info.file.path);
    }
}
