use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{Fuse, SplitSink};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use super::{Command, Event, EventSender, Receiver};
use crate::counter::ThroughputCounter;
use crate::error::{Error, Result};
use crate::torrent::SharedStatus;
use crate::{Bitfield, BlockInfo, SessionId};

/// A single outbound connection to a peer: one BitTorrent handshake, one
/// TCP stream, driven as its own task. All piece/block selection lives in
/// the torrent's scheduler; this actor only speaks the wire protocol and
/// reports what it sees.
pub(crate) struct PeerSession {
    id: SessionId,
    torrent: Arc<SharedStatus>,
    addr: SocketAddr,
    cmd_port: Fuse<Receiver>,
    events: EventSender,
    status: Status,
    /// Blocks we've requested from the peer but haven't received yet, kept
    /// so a `piece` message that doesn't correspond to any request (stale
    /// cancel, or a buggy/hostile peer) can be dropped rather than trusted.
    outgoing_requests: Vec<BlockInfo>,
    downloaded: ThroughputCounter,
}

impl PeerSession {
    /// Creates a new outbound session. The returned [`super::Sender`] is
    /// given to the torrent actor so it can command this session once it
    /// registers the connection.
    pub fn outbound(
        id: SessionId,
        torrent: Arc<SharedStatus>,
        addr: SocketAddr,
    ) -> (Self, super::Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let events = torrent.event_chan.clone();
        (
            Self {
                id,
                torrent,
                addr,
                cmd_port: cmd_port.fuse(),
                events,
                status: Status::default(),
                outgoing_requests: Vec::new(),
                downloaded: ThroughputCounter::new(),
            },
            cmd_chan,
        )
    }

    /// Connects to the peer, performs the handshake and bitfield exchange,
    /// then runs the session until it ends.
    pub async fn start(&mut self) {
        let result = self.start_inner().await;
        let error = result.err().map(|e| e.to_string());
        if let Some(error) = &error {
            log::warn!("Peer {} session ended with error: {}", self.addr, error);
        }
        let _ = self.events.send(Event::Stopped { session: self.id, addr: self.addr, error });
    }

    async fn start_inner(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = tokio::time::timeout(self.torrent.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let connect_timeout = self.torrent.conf.connect_timeout;
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        tokio::time::timeout(connect_timeout, socket.send(handshake))
            .await
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake send timed out")))??;

        let peer_handshake = tokio::time::timeout(connect_timeout, socket.next())
            .await
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake read timed out")))?
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no handshake")))??;
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} handshake info hash mismatch", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        // switch codecs, carrying over any bytes the peer already sent
        // ahead of the handshake reply
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        let mut keepalive_timer = interval(self.torrent.conf.keepalive_interval);
        let mut idle_check_timer = interval(self.torrent.conf.peer_idle_timeout / 2);
        let mut last_activity = Instant::now();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    last_activity = Instant::now();
                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_exchange(&mut sink, msg).await?;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Request(blocks) => {
                            self.send_requests(&mut sink, blocks).await?;
                        }
                        Command::Cancel(blocks) => {
                            self.cancel_requests(&mut sink, blocks).await?;
                        }
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                    }
                }
                _ = keepalive_timer.tick() => {
                    sink.send(Message::KeepAlive).await?;
                }
                _ = idle_check_timer.tick() => {
                    if last_activity.elapsed() >= self.torrent.conf.peer_idle_timeout {
                        log::info!("Peer {} idle timeout", self.addr);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// The exact byte length a bitfield for this torrent's piece count must
    /// have: `ceil(piece_count / 8)`.
    fn expected_bitfield_byte_len(&self) -> usize {
        (self.torrent.storage.piece_count + 7) / 8
    }

    async fn handle_availability_exchange(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        let bitfield = match msg {
            Message::Bitfield(bitfield) => {
                if bitfield.len() / 8 != self.expected_bitfield_byte_len() {
                    log::warn!(
                        "Peer {} sent bitfield of wrong length ({} bytes, expected {})",
                        self.addr,
                        bitfield.len() / 8,
                        self.expected_bitfield_byte_len()
                    );
                    return Err(Error::InvalidMessageLength);
                }
                let mut bitfield = bitfield;
                bitfield.resize(self.torrent.storage.piece_count, false);
                bitfield
            }
            // a peer with nothing is allowed to skip the bitfield entirely
            other => {
                self.status.state = State::Connected;
                let empty = Bitfield::repeat(false, self.torrent.storage.piece_count);
                self.events
                    .send(Event::Connected { session: self.id, addr: self.addr, bitfield: empty })?;
                return self.handle_msg(sink, other).await;
            }
        };

        log::info!("Peer {} sent bitfield", self.addr);
        self.status.state = State::Connected;
        self.events
            .send(Event::Connected { session: self.id, addr: self.addr, bitfield })?;
        sink.send(Message::Interested).await?;
        self.status.am_interested = true;
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        _sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(bitfield) => {
                if bitfield.len() / 8 != self.expected_bitfield_byte_len() {
                    log::warn!(
                        "Peer {} re-sent bitfield of wrong length ({} bytes, expected {})",
                        self.addr,
                        bitfield.len() / 8,
                        self.expected_bitfield_byte_len()
                    );
                    return Err(Error::InvalidMessageLength);
                }
                log::warn!("Peer {} re-sent its bitfield after the handshake", self.addr);
                let mut bitfield = bitfield;
                bitfield.resize(self.torrent.storage.piece_count, false);
                self.events.send(Event::BitfieldUpdated { session: self.id, bitfield })?;
            }
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.outgoing_requests.clear();
                    self.events.send(Event::Choked { session: self.id })?;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.events.send(Event::Unchoked { session: self.id })?;
                }
            }
            Message::Interested => {
                self.status.peer_interested = true;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
            }
            Message::Have { piece_index } => {
                self.events.send(Event::Have { session: self.id, piece_index })?;
            }
            Message::Piece { piece_index, offset, data } => {
                self.handle_piece_msg(piece_index, offset, data)?;
            }
            // we never seed, so these have no meaningful response
            Message::Request(_) | Message::Cancel(_) | Message::Port(_) => {
                log::trace!("Peer {} sent a message only seeds need to act on", self.addr);
            }
        }
        Ok(())
    }

    fn handle_piece_msg(&mut self, piece_index: usize, offset: u32, data: Vec<u8>) -> Result<()> {
        let info = BlockInfo { piece_index, offset, len: data.len() as u32 };
        let pos = self.outgoing_requests.iter().position(|b| *b == info);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                log::warn!("Peer {} sent unrequested block {:?}", self.addr, info);
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);
        self.downloaded.update(info.len as u64);
        self.events.send(Event::BlockArrived { session: self.id, info, data })?;
        Ok(())
    }

    async fn send_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        blocks: Vec<BlockInfo>,
    ) -> Result<()> {
        for block in &blocks {
            sink.send(Message::Request(*block)).await?;
        }
        self.outgoing_requests.extend(blocks);
        Ok(())
    }

    async fn cancel_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        blocks: Vec<BlockInfo>,
    ) -> Result<()> {
        for block in &blocks {
            self.outgoing_requests.retain(|b| b != block);
            sink.send(Message::Cancel(*block)).await?;
        }
        Ok(())
    }
}

/// The status of a peer session. By default both sides start off choked and
/// not interested, as per the standard.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    am_interested: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self { state: State::default(), is_choked: true, am_interested: false, peer_interested: false }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}
