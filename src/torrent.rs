//! The swarm orchestrator: owns the scheduler, the disk handle, and every
//! peer session of a single torrent, and drives the tracker announce
//! lifecycle and peer dial loop.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::alert::{Alert, AlertSender};
use crate::conf::{TorrentConf, CLIENT_ID_PREFIX};
use crate::disk::{self, DiskHandle};
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::peer::{self, PeerSession};
use crate::scheduler::Scheduler;
use crate::storage_info::StorageInfo;
use crate::tracker::{self, Tracker};
use crate::{PeerId, Sha1Hash, SessionId, TorrentId};

/// Information about a torrent that is shared, read-only, with every peer
/// session it spawns.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    pub event_chan: peer::EventSender,
}

/// Generates a fresh Azureus-style peer id: the 8 byte client prefix
/// followed by 12 random bytes, unique enough for one process's peer
/// connections.
pub(crate) fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// A connected (or connecting) peer as tracked by the torrent actor.
struct PeerHandle {
    addr: SocketAddr,
    cmd_chan: peer::Sender,
    is_choked: bool,
    is_connected: bool,
    outstanding: usize,
}

/// Drives a single torrent's download to completion.
pub(crate) struct Torrent {
    status: Arc<SharedStatus>,
    conf: TorrentConf,
    scheduler: Scheduler,
    disk: DiskHandle,
    disk_alerts: disk::TorrentAlertReceiver,
    tracker: Tracker,

    sessions: HashMap<SessionId, PeerHandle>,
    next_session_id: SessionId,
    /// Addresses known from tracker announces that aren't currently
    /// connected, used to top up the connected peer set.
    known_peers: HashSet<SocketAddr>,

    events: peer::EventReceiver,
    alert_chan: AlertSender,

    uploaded: u64,
    downloaded: u64,
}

impl Torrent {
    pub async fn new(
        id: TorrentId,
        metainfo: Metainfo,
        conf: TorrentConf,
        client_id: Option<PeerId>,
        alert_chan: AlertSender,
    ) -> Result<Self> {
        metainfo.validate()?;
        let info_hash = metainfo.create_info_hash()?;
        let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let piece_hashes = metainfo.info.pieces.clone();

        let (disk, mut disk_alerts) = DiskHandle::spawn()?;
        disk.new_torrent(id, storage.clone(), piece_hashes, conf.rescan_on_open)?;
        let disk_alert = disk_alerts
            .recv()
            .await
            .ok_or(crate::error::Error::ChannelClosed)?;
        let (disk_alerts, verified_pieces) = match disk_alert {
            disk::Alert::TorrentAllocation(Ok(alloc)) if alloc.id == id => {
                (alloc.alert_port, alloc.verified_pieces)
            }
            disk::Alert::TorrentAllocation(Err(e)) => return Err(e.into()),
            _ => return Err(crate::error::Error::InvalidTorrentId),
        };

        let (event_chan, events) = mpsc::unbounded_channel();
        let status = Arc::new(SharedStatus {
            id,
            info_hash,
            client_id: client_id.unwrap_or_else(generate_peer_id),
            storage: storage.clone(),
            conf: conf.clone(),
            event_chan,
        });

        let tracker = Tracker::new(metainfo.announce, conf.tracker_timeout)?;
        let mut scheduler = Scheduler::new(
            &storage,
            conf.request_queue_len,
            conf.endgame_threshold,
            conf.request_timeout,
        );
        if !verified_pieces.is_empty() {
            log::info!("{} piece(s) already complete on disk for torrent {}", verified_pieces.len(), id);
        }
        for piece_index in verified_pieces {
            scheduler.mark_piece_complete(piece_index);
        }

        Ok(Self {
            status,
            conf,
            scheduler,
            disk,
            disk_alerts,
            tracker,
            sessions: HashMap::new(),
            next_session_id: 0,
            known_peers: HashSet::new(),
            events,
            alert_chan,
            uploaded: 0,
            downloaded: 0,
        })
    }

    /// Runs the torrent to completion (or until a fatal error), announcing
    /// to the tracker, dialing peers, and scheduling block requests.
    pub async fn start(&mut self) -> Result<()> {
        self.announce(Some(tracker::Event::Started)).await;

        let mut dial_timer = interval(self.conf.dial_interval);
        let mut maintenance_timer = interval(self.conf.request_timeout_check_interval);
        let mut announce_timer = interval(self.conf.announce_interval);

        loop {
            select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_peer_event(event).await?,
                        None => break,
                    }
                }
                alert = self.disk_alerts.recv() => {
                    if let Some(alert) = alert {
                        self.handle_disk_alert(alert).await?;
                    }
                }
                _ = dial_timer.tick() => {
                    self.dial_new_peers();
                }
                _ = maintenance_timer.tick() => {
                    self.run_maintenance().await?;
                }
                _ = announce_timer.tick() => {
                    self.announce(None).await;
                }
            }

            if self.scheduler.count_missing_pieces() == 0 {
                log::info!("Torrent {} download complete", self.status.id);
                let _ = self.alert_chan.send(Alert::DownloadComplete { torrent_id: self.status.id });
                self.announce(Some(tracker::Event::Completed)).await;
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    async fn announce(&mut self, event: Option<tracker::Event>) {
        let left = self.status.storage.download_len.saturating_sub(self.downloaded);
        let req = tracker::AnnounceRequest {
            info_hash: self.status.info_hash,
            peer_id: self.status.client_id,
            port: 0,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left,
            event,
            numwant: Some(50),
        };
        match self
            .tracker
            .announce(req, self.conf.tracker_retry_count, self.conf.tracker_retry_base_delay)
            .await
        {
            Ok(response) => {
                log::info!(
                    "Tracker announce ok: {} peers, interval {}s",
                    response.peers.len(),
                    response.interval
                );
                for addr in response.peers {
                    if !self.sessions.values().any(|p| p.addr == addr) {
                        self.known_peers.insert(addr);
                    }
                }
                self.dial_new_peers();
            }
            Err(e) => {
                log::warn!("Tracker announce failed: {}", e);
                let _ = self.alert_chan.send(Alert::TorrentError {
                    torrent_id: self.status.id,
                    message: e.to_string(),
                });
            }
        }
    }

    fn dial_new_peers(&mut self) {
        while self.sessions.len() < self.conf.max_connected_peer_count {
            let addr = match self.known_peers.iter().next().copied() {
                Some(addr) => addr,
                None => break,
            };
            self.known_peers.remove(&addr);
            self.connect_to(addr);
        }
    }

    fn connect_to(&mut self, addr: SocketAddr) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let (mut session, cmd_chan) = PeerSession::outbound(session_id, Arc::clone(&self.status), addr);
        tokio::task::spawn(async move {
            session.start().await;
        });

        self.sessions.insert(
            session_id,
            PeerHandle { addr, cmd_chan, is_choked: true, is_connected: false, outstanding: 0 },
        );
    }

    async fn handle_peer_event(&mut self, event: peer::Event) -> Result<()> {
        match event {
            peer::Event::Connected { session, addr, bitfield } => {
                log::info!("Session {} ({}) connected", session, addr);
                self.scheduler.register_peer(session, bitfield);
                if let Some(peer) = self.sessions.get_mut(&session) {
                    peer.is_connected = true;
                }
            }
            peer::Event::Have { session, piece_index } => {
                self.scheduler.peer_have(session, piece_index);
            }
            peer::Event::BitfieldUpdated { session, bitfield } => {
                self.scheduler.peer_bitfield_replaced(session, bitfield);
            }
            peer::Event::Choked { session } => {
                self.scheduler.peer_choked(session);
                if let Some(peer) = self.sessions.get_mut(&session) {
                    peer.is_choked = true;
                }
            }
            peer::Event::Unchoked { session } => {
                self.scheduler.peer_unchoked(session);
                if let Some(peer) = self.sessions.get_mut(&session) {
                    peer.is_choked = false;
                }
                self.fill_session_queue(session);
            }
            peer::Event::BlockArrived { session, info, data } => {
                self.downloaded += info.len as u64;
                if let Some(peer) = self.sessions.get_mut(&session) {
                    peer.outstanding = peer.outstanding.saturating_sub(1);
                }
                let piece_index = info.piece_index;
                let offset = info.offset;
                self.disk.write_block(self.status.id, info, data)?;
                let (completed, cancel) = self.scheduler.received_block(piece_index, offset, session);
                if let Some(completed) = completed {
                    log::info!("Piece {} fully received, awaiting disk verification", completed);
                }
                self.cancel_blocks(cancel);
                self.fill_session_queue(session);
            }
            peer::Event::Stopped { session, addr, error } => {
                if let Some(error) = &error {
                    log::info!("Session {} ({}) stopped: {}", session, addr, error);
                } else {
                    log::info!("Session {} ({}) stopped", session, addr);
                }
                self.sessions.remove(&session);
                self.scheduler.unregister_peer(session);
            }
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: disk::TorrentAlert) -> Result<()> {
        match alert {
            disk::TorrentAlert::BatchWrite(Ok(write)) => {
                if write.is_piece_valid {
                    let _ = self
                        .alert_chan
                        .send(Alert::PieceCompleted { torrent_id: self.status.id, piece_index: write.piece_index });
                } else {
                    log::warn!("Piece {} failed hash verification, re-requesting", write.piece_index);
                    let piece_len = self.status.storage.piece_len(write.piece_index)?;
                    self.scheduler.reset_piece(write.piece_index, piece_len);
                    let _ = self.alert_chan.send(Alert::HashFailed {
                        torrent_id: self.status.id,
                        piece_index: write.piece_index,
                    });
                }
            }
            disk::TorrentAlert::BatchWrite(Err(e)) => {
                log::warn!("Disk write error: {}", e);
                let _ = self
                    .alert_chan
                    .send(Alert::TorrentError { torrent_id: self.status.id, message: e.to_string() });
            }
        }
        Ok(())
    }

    async fn run_maintenance(&mut self) -> Result<()> {
        let now = Instant::now();
        let timed_out = self.scheduler.tick(now);
        self.cancel_blocks(timed_out);
        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in session_ids {
            self.fill_session_queue(session);
        }
        Ok(())
    }

    /// Sends a real `cancel` to each session still holding one of these
    /// blocks, e.g. because another session's copy of the same block arrived
    /// first during endgame, or its request timed out. Decrements the
    /// session's outstanding request count to match.
    fn cancel_blocks(&mut self, blocks: Vec<(SessionId, crate::BlockInfo)>) {
        if blocks.is_empty() {
            return;
        }
        let mut by_session: HashMap<SessionId, Vec<crate::BlockInfo>> = HashMap::new();
        for (session, info) in blocks {
            by_session.entry(session).or_default().push(info);
        }
        for (session, infos) in by_session {
            if let Some(peer) = self.sessions.get_mut(&session) {
                peer.outstanding = peer.outstanding.saturating_sub(infos.len());
                let _ = peer.cmd_chan.send(peer::Command::Cancel(infos));
            }
        }
    }

    fn fill_session_queue(&mut self, session: SessionId) {
        let outstanding = match self.sessions.get(&session) {
            Some(peer) if peer.is_connected && !peer.is_choked => peer.outstanding,
            _ => return,
        };
        let requests = self.scheduler.fill_queue(session, outstanding, Instant::now());
        if requests.is_empty() {
            return;
        }
        if let Some(peer) = self.sessions.get_mut(&session) {
            peer.outstanding += requests.len();
            let _ = peer.cmd_chan.send(peer::Command::Request(requests));
        }
    }

    fn shutdown(&mut self) {
        for peer in self.sessions.values() {
            let _ = peer.cmd_chan.send(peer::Command::Shutdown);
        }
        let _ = self.disk.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
    }

    #[test]
    fn test_generate_peer_id_is_not_deterministic() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
