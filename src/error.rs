//! The engine-wide error and result types.
//!
//! Each subsystem that needs a more specific vocabulary of failures (disk IO,
//! the tracker client) defines its own error type in its own module and
//! converts into this one at the boundary where the failure becomes visible
//! to the rest of the engine.

use std::fmt;
use std::io;

use crate::disk;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The various ways a torrent download can fail.
#[derive(Debug)]
pub enum Error {
    /// The peer's handshake carried an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// A message's declared length violated the wire format (e.g. a `have`
    /// with a payload length other than 4).
    InvalidMessageLength,
    /// A message carried an unknown message id. Not fatal on its own, for
    /// forward compatibility; it is only surfaced here for codecs that
    /// choose not to swallow it silently.
    UnknownMessageId(u8),
    /// The peer advertised a `have`/`bitfield`/`request` for a piece index
    /// that is out of range for this torrent.
    InvalidPieceIndex,
    /// A piece, file, or torrent id was referenced that the engine has no
    /// record of.
    InvalidTorrentId,
    /// The metainfo or a CLI-level configuration field is invalid (e.g. the
    /// `.torrent` declares a multi-file layout, piece length, or hash count
    /// that doesn't add up). Fatal at startup.
    InvalidConfig(String),
    /// Something went wrong in the piece store. Fatal only if it happened
    /// during initialization; per-piece write failures are recoverable and
    /// are reported as alerts instead.
    Disk(disk::error::NewTorrentError),
    /// A bencode document (metainfo or tracker response) could not be
    /// parsed.
    Bencode(serde_bencode::Error),
    /// The tracker announce failed after exhausting its retry budget.
    Tracker(String),
    /// The channel to another task closed unexpectedly, meaning that task
    /// has died. Treated as fatal since there is no one left to serve the
    /// request.
    ChannelClosed,
    /// A generic, unclassified IO failure (handshake connect/read timeout,
    /// socket error in the plumbing that doesn't have a more specific
    /// variant above).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::InvalidMessageLength => {
                write!(f, "message payload length violates protocol")
            }
            Self::UnknownMessageId(id) => {
                write!(f, "unknown message id {}", id)
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Disk(e) => write!(f, "disk error: {}", e),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Self::ChannelClosed => write!(f, "internal channel closed"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Disk(e) => Some(e),
            Self::Bencode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<disk::error::NewTorrentError> for Error {
    fn from(e: disk::error::NewTorrentError) -> Self {
        Self::Disk(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
