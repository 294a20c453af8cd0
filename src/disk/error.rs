//! Disk-specific error types, converted into [`crate::error::Error`] at the
//! torrent boundary.

use std::fmt;
use std::io;

/// Failure while allocating a torrent's on-disk file.
#[derive(Debug)]
pub enum NewTorrentError {
    /// A torrent with this id is already registered with the disk task.
    AlreadyExists,
    /// The output file couldn't be created or opened.
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists => None,
        }
    }
}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure while writing a block, or a batch of blocks making up a
/// completed piece, to disk.
#[derive(Debug)]
pub enum WriteError {
    /// The piece index named in the write doesn't exist in this torrent.
    InvalidPieceIndex,
    /// The torrent id named in the write doesn't exist in the disk task.
    InvalidTorrentId,
    /// The underlying file write or fsync call failed.
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for WriteError {
    fn from(e: nix::Error) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::Other, e))
    }
}
