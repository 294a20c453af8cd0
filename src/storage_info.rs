use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::{metainfo::Metainfo, PieceIndex};

/// Information about the torrent's single output file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes. Equal to the torrent's total length,
    /// since only single-file torrents are supported.
    pub len: u64,
}

/// Information about a torrent's storage details: piece count and length,
/// download length, and the output file.
///
/// Rather than materializing a per-piece descriptor array, piece metadata is
/// computed on demand from this struct, which is cheaper and just as simple
/// since every piece but the last has identical length.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// nominal piece length if the download size is not an exact multiple
    /// of the piece length.
    pub last_piece_len: u32,
    /// The total length of the torrent's file, in bytes.
    pub download_len: u64,
    /// The torrent's single output file.
    pub file: FileInfo,
}

impl StorageInfo {
    /// Extracts storage related information from a validated torrent
    /// metainfo.
    ///
    /// # Panics
    ///
    /// Panics if `metainfo` has not been passed through
    /// [`Metainfo::validate`], since the invariants it establishes (single
    /// file, consistent piece count) are relied upon here without
    /// re-checking.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        debug_assert!(piece_count > 0);
        let download_len = metainfo.len();
        let piece_len = metainfo.piece_len();
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        let file = FileInfo {
            path: download_dir.join(metainfo.name()),
            len: download_len,
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if self.piece_count == 0 {
            return Err(Error::InvalidPieceIndex);
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::warn!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte offset of the piece at the given index within the
    /// torrent's single file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Info;

    fn metainfo(length: u64, piece_length: u64, piece_count: usize) -> Metainfo {
        Metainfo {
            announce: "http://tracker.example.com/announce".into(),
            info: Info {
                name: "foo.bin".into(),
                pieces: vec![0u8; piece_count * 20],
                piece_length,
                length: Some(length),
                files: None,
                private: None,
            },
        }
    }

    #[test]
    fn test_storage_info_even_split() {
        let m = metainfo(32, 16, 2);
        let info = StorageInfo::new(&m, PathBuf::from("/tmp"));
        assert_eq!(info.piece_count, 2);
        assert_eq!(info.piece_len, 16);
        assert_eq!(info.last_piece_len, 16);
        assert_eq!(info.piece_len(0).unwrap(), 16);
        assert_eq!(info.piece_len(1).unwrap(), 16);
        assert!(info.piece_len(2).is_err());
    }

    #[test]
    fn test_storage_info_short_last_piece() {
        // 3 full length pieces, 1 shorter piece
        let m = metainfo(3 * 4 + 2, 4, 4);
        let info = StorageInfo::new(&m, PathBuf::from("/tmp"));
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
    }

    #[test]
    fn test_storage_info_single_piece_torrent() {
        let m = metainfo(16384, 16384, 1);
        let info = StorageInfo::new(&m, PathBuf::from("/tmp"));
        assert_eq!(info.piece_count, 1);
        assert_eq!(info.piece_len(0).unwrap(), 16384);
        assert_eq!(info.last_piece_len, 16384);
    }

    #[test]
    fn test_piece_offset() {
        let m = metainfo(32, 16, 2);
        let info = StorageInfo::new(&m, PathBuf::from("/tmp"));
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(1), 16);
    }
}
