//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The fixed 8-byte client id prefix, Azureus-style (`-` + 2 letter client
/// code + 4 digit version + `-`). The remaining 12 bytes of a generated peer
/// id are random, and unique per process (see `torrent::generate_peer_id`).
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-JS0001-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug, Default)]
pub struct EngineConf {
    /// An explicit client id to announce to trackers and in peer
    /// handshakes. If `None`, the engine generates one at startup with
    /// [`CLIENT_ID_PREFIX`] and keeps it fixed for the process lifetime.
    pub client_id: Option<PeerId>,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// How often the peer dial loop tops up the connected peer set while
    /// fewer than `max_connected_peer_count` peers are connected.
    pub dial_interval: Duration,

    /// The number of block requests kept outstanding per peer session, i.e.
    /// the pipelining window.
    pub request_queue_len: usize,

    /// The global count of needed+requested blocks at or below which
    /// endgame mode latches on for the remainder of the run.
    pub endgame_threshold: usize,

    /// The deadline given to a single block request before the scheduler's
    /// maintenance pass considers it timed out.
    pub request_timeout: Duration,

    /// How often the scheduler's maintenance pass runs to collect expired
    /// requests.
    pub request_timeout_check_interval: Duration,

    /// If no bytes have been sent to a peer for this long, a keep-alive
    /// frame is sent.
    pub keepalive_interval: Duration,

    /// If no bytes have been received from a peer for this long, the
    /// session is considered dead.
    pub peer_idle_timeout: Duration,

    /// The deadline for establishing a TCP connection and completing the
    /// handshake with a peer.
    pub connect_timeout: Duration,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to re-announcing at this interval.
    pub announce_interval: Duration,

    /// The deadline for a single tracker HTTP request.
    pub tracker_timeout: Duration,

    /// The number of attempts made per announce cycle before giving up
    /// until the next cycle.
    pub tracker_retry_count: usize,

    /// The base delay of the tracker retry's exponential backoff.
    pub tracker_retry_base_delay: Duration,

    /// Whether to hash-check every piece of a pre-existing output file of
    /// the expected length on startup, marking matching pieces as already
    /// complete instead of re-downloading them. Off by default: the scan
    /// is synchronous and its cost scales with torrent size. See
    /// DESIGN.md for the full rationale.
    pub rescan_on_open: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // Picked for performance while keeping in mind not to
            // overwhelm the host.
            max_connected_peer_count: 30,
            dial_interval: Duration::from_secs(5),
            request_queue_len: 12,
            endgame_threshold: 20,
            request_timeout: Duration::from_secs(30),
            request_timeout_check_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(120),
            peer_idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            announce_interval: Duration::from_secs(30 * 60),
            tracker_timeout: Duration::from_secs(15),
            tracker_retry_count: 3,
            tracker_retry_base_delay: Duration::from_secs(1),
            rescan_on_open: false,
        }
    }
}
