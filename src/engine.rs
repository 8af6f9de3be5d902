//! The engine: the single context object owning the process-wide parts of
//! the system.
//!
//! There are no global singletons: the torrent registry, the disk task, the
//! peer listener and the LSD endpoint all live here and are handed to the
//! parts that need them. Creating the engine starts the shared tasks;
//! shutting it down tears everything down explicitly.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    alert::{Alert, AlertReceiver, AlertSender},
    conf::Conf,
    disk::{self, DiskHandle},
    error::*,
    limit::SharedTokenBucket,
    listener, lsd,
    lsd::LsdHandle,
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentHandle, TorrentParams},
    tracker::TrackerGroup,
    InfoHash, TorrentId,
};

/// The running torrents, shared with the listener (to route inbound
/// handshakes) and the LSD endpoint (to route discovered peers). A torrent
/// registers itself on start and unregisters on stop, so lookups only ever
/// see torrents able to accept peers.
pub(crate) type TorrentRegistry =
    Arc<RwLock<HashMap<InfoHash, RegistryEntry>>>;

#[derive(Clone)]
pub(crate) struct RegistryEntry {
    pub handle: TorrentHandle,
    /// Private torrents are excluded from local discovery.
    pub is_private: bool,
}

pub struct Engine {
    conf: Conf,
    alert_chan: AlertSender,
    registry: TorrentRegistry,
    disk: DiskHandle,
    disk_join: JoinHandle<()>,
    listener_join: JoinHandle<()>,
    listen_port: u16,
    lsd: Option<LsdHandle>,
    lsd_join: Option<JoinHandle<()>>,
    torrents: HashMap<TorrentId, TorrentHandle>,
    torrent_joins: HashMap<TorrentId, JoinHandle<()>>,
    info_hashes: HashMap<InfoHash, TorrentId>,
    next_torrent_id: TorrentId,
    download_bucket: SharedTokenBucket,
    upload_bucket: SharedTokenBucket,
}

impl Engine {
    /// Starts the engine's shared tasks and returns it along with the
    /// channel on which all notifications arrive.
    pub async fn new(conf: Conf) -> Result<(Self, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let registry = TorrentRegistry::default();

        let (disk, disk_join) = disk::spawn(conf.disk.clone());

        let (listen_port, listener_join) = listener::spawn(
            conf.engine.listen_port,
            conf.peer.handshake_timeout,
            registry.clone(),
            alert_chan.clone(),
        )
        .await?;

        // local discovery is best effort: a host that cannot join the
        // multicast group still downloads fine through trackers
        let (lsd, lsd_join) = match lsd::spawn(registry.clone(), listen_port)
        {
            Ok((lsd, join)) => (Some(lsd), Some(join)),
            Err(e) => {
                log::warn!("LSD unavailable: {}", e);
                (None, None)
            }
        };

        let engine = Self {
            download_bucket: SharedTokenBucket::new(
                conf.engine.download_rate_limit,
            ),
            upload_bucket: SharedTokenBucket::new(conf.engine.upload_rate_limit),
            conf,
            alert_chan,
            registry,
            disk,
            disk_join,
            listener_join,
            listen_port,
            lsd,
            lsd_join,
            torrents: HashMap::new(),
            torrent_joins: HashMap::new(),
            info_hashes: HashMap::new(),
            next_torrent_id: 0,
        };
        Ok((engine, alert_port))
    }

    /// The port inbound peer connections are accepted on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Creates a torrent from its metainfo and spawns its task. The torrent
    /// is inactive until [`TorrentHandle::start`] is invoked.
    pub fn create_torrent(
        &mut self,
        metainfo: &Metainfo,
        trackers: Vec<Arc<dyn TrackerGroup>>,
    ) -> Result<TorrentHandle> {
        let info_hash = metainfo.create_info_hash()?;
        if self.info_hashes.contains_key(&info_hash) {
            return Err(Error::TorrentAlreadyExists);
        }

        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let storage = StorageInfo::new(
            metainfo,
            self.conf.torrent.download_dir.clone(),
        );
        log::info!(
            "Creating torrent {} ({}), {} pieces, {} bytes",
            id,
            metainfo.name(),
            storage.piece_count,
            storage.download_len
        );

        let (mut torrent, handle) = Torrent::new(TorrentParams {
            id,
            info_hash,
            piece_hashes: metainfo.piece_hashes().to_vec(),
            storage,
            is_private: metainfo.is_private(),
            conf: self.conf.torrent.clone(),
            peer_conf: self.conf.peer.clone(),
            disk_conf: self.conf.disk.clone(),
            disk: self.disk.clone(),
            alert_chan: self.alert_chan.clone(),
            trackers,
            lsd: self.lsd.clone(),
            registry: self.registry.clone(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
        });
        let join = tokio::spawn(async move { torrent.run().await });

        self.torrents.insert(id, handle.clone());
        self.torrent_joins.insert(id, join);
        self.info_hashes.insert(info_hash, id);
        let _ = self
            .alert_chan
            .send(Alert::TorrentAdded { id, info_hash });
        Ok(handle)
    }

    pub fn torrent(&self, id: TorrentId) -> Result<&TorrentHandle> {
        self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id))
    }

    /// Stops every torrent and shuts the shared tasks down.
    pub async fn shutdown(self) -> Result<()> {
        log::info!("Shutting down engine");
        for handle in self.torrents.values() {
            let _ = handle.shutdown();
        }
        for (_, join) in self.torrent_joins {
            let _ = join.await;
        }

        if let Some(lsd) = &self.lsd {
            lsd.shutdown();
        }
        if let Some(join) = self.lsd_join {
            let _ = join.await;
        }

        let _ = self.disk.shutdown();
        let _ = self.disk_join.await;

        // the accept loop has no inputs other than the socket; stop it
        // directly
        self.listener_join.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Info;

    fn test_metainfo(name: &str) -> Metainfo {
        let info = Info {
            name: name.into(),
            pieces: vec![0xcd; 2 * 20],
            piece_length: 32,
            length: Some(48),
            files: None,
            private: None,
        };
        let encoded = {
            let info = serde_bencode::to_bytes(&info).unwrap();
            let mut buf = Vec::new();
            buf.extend_from_slice(b"d4:info");
            buf.extend_from_slice(&info);
            buf.extend_from_slice(b"e");
            buf
        };
        Metainfo::from_bytes(&encoded).unwrap()
    }

    #[tokio::test]
    async fn test_engine_startup_and_torrent_creation() {
        let conf = Conf::new(std::env::temp_dir().join("swarmtorrent-engine"));
        let (mut engine, mut alerts) = Engine::new(conf).await.unwrap();
        assert_ne!(engine.listen_port(), 0);

        match alerts.recv().await {
            Some(Alert::ListenerStarted { port }) => {
                assert_eq!(port, engine.listen_port())
            }
            other => panic!("expected listener alert, got {:?}", other),
        }

        let metainfo = test_metainfo("a");
        let handle = engine.create_torrent(&metainfo, Vec::new()).unwrap();
        assert_eq!(handle.id(), 0);
        match alerts.recv().await {
            Some(Alert::TorrentAdded { id, .. }) => assert_eq!(id, 0),
            other => panic!("expected torrent added alert, got {:?}", other),
        }

        // the same metainfo cannot be added twice
        assert!(matches!(
            engine.create_torrent(&metainfo, Vec::new()),
            Err(Error::TorrentAlreadyExists)
        ));

        engine.shutdown().await.unwrap();
    }
}
