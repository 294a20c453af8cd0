//! The engine's public entry point.
//!
//! Spawning the engine starts no torrents by itself; each call to
//! [`EngineHandle::create_torrent`] registers and starts one download, each
//! driven as its own [`crate::torrent::Torrent`] task.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alert::{Alert, AlertReceiver};
use crate::conf::Conf;
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::torrent::Torrent;
use crate::TorrentId;

/// A handle to the running engine: spawns and tracks torrents, and owns the
/// sending half of the alert channel every torrent reports through.
pub struct EngineHandle {
    conf: Conf,
    alert_chan: mpsc::UnboundedSender<Alert>,
    next_torrent_id: TorrentId,
}

impl EngineHandle {
    /// Starts the engine with the given configuration, returning a handle
    /// to it along with the channel on which it reports alerts.
    pub fn spawn(conf: Conf) -> (Self, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        (
            Self {
                conf,
                alert_chan,
                next_torrent_id: 0,
            },
            alert_port,
        )
    }

    /// Registers a new torrent from its parsed metainfo and starts
    /// downloading it in the background, returning its id and the join
    /// handle of the task driving it.
    ///
    /// The metainfo is validated (single file, consistent piece layout)
    /// before the torrent is started; an invalid metainfo is a fatal
    /// configuration error rather than something the engine works around.
    pub async fn create_torrent(
        &mut self,
        metainfo: Metainfo,
    ) -> Result<(TorrentId, JoinHandle<()>)> {
        metainfo.validate()?;

        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let mut torrent = Torrent::new(
            id,
            metainfo,
            self.conf.torrent.clone(),
            self.conf.engine.client_id,
            self.alert_chan.clone(),
        )
        .await?;

        let join_handle = tokio::task::spawn(async move {
            if let Err(e) = torrent.start().await {
                log::error!("Torrent {} exited with error: {}", id, e);
            }
        });

        Ok((id, join_handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_spawn_assigns_incrementing_torrent_ids() {
        let (mut engine, _alerts) = EngineHandle::spawn(Conf::new(PathBuf::from("/tmp")));
        assert_eq!(engine.next_torrent_id, 0);
        engine.next_torrent_id += 1;
        assert_eq!(engine.next_torrent_id, 1);
    }
}
