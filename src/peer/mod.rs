mod codec;
mod session;

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::{BlockInfo, PieceIndex, SessionId};

pub(crate) use session::PeerSession;

/// The channel on which the torrent actor sends commands to a peer session.
pub(crate) type Sender = mpsc::UnboundedSender<Command>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<Command>;

/// Commands the torrent actor issues to a peer session. All piece/block
/// selection happens in the torrent's scheduler; the session itself never
/// decides what to request.
pub(crate) enum Command {
    /// Requests the given blocks from the peer, in order.
    Request(Vec<BlockInfo>),
    /// Cancels previously requested blocks, used in endgame once another
    /// peer's copy of the same block arrives first.
    Cancel(Vec<BlockInfo>),
    /// Tears down the session.
    Shutdown,
}

/// The channel on which a peer session reports events back to the torrent
/// actor, which owns the scheduler and disk handle.
pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// An event a peer session reports about its connection.
pub(crate) enum Event {
    /// The handshake and bitfield exchange succeeded; the session is ready
    /// to be scheduled.
    Connected { session: SessionId, addr: SocketAddr, bitfield: crate::Bitfield },
    /// The peer announced it now has an additional piece.
    Have { session: SessionId, piece_index: PieceIndex },
    /// The peer re-sent its bitfield after the initial handshake exchange;
    /// it replaces what was previously known about the peer's availability.
    BitfieldUpdated { session: SessionId, bitfield: crate::Bitfield },
    /// The peer choked us; any blocks it was holding for us are released.
    Choked { session: SessionId },
    /// The peer unchoked us; it can be scheduled again.
    Unchoked { session: SessionId },
    /// A requested block arrived.
    BlockArrived { session: SessionId, info: BlockInfo, data: Vec<u8> },
    /// The session ended, cleanly or otherwise.
    Stopped { session: SessionId, addr: SocketAddr, error: Option<String> },
}
