//! The torrent orchestrator.
//!
//! One task per torrent owns every piece of bookkeeping: the piece and block
//! states, the peer table, both request pipelines and the rate measurers.
//! Peer sessions and the disk task report into it over channels and it
//! drives them through commands, so no lock is ever taken around this state.
//! A periodic tick (500 ms by default) runs the choke policy, the request
//! scheduler and the timeout sweeps.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::BytesMut;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time,
};

use crate::{
    alert::{Alert, AlertSender},
    bitfield,
    conf::{DiskConf, PeerConf, TorrentConf},
    counter::RateMeasurer,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender},
    engine::{RegistryEntry, TorrentRegistry},
    error::*,
    generate_peer_id,
    limit::{BandwidthLimiter, DiskQueueLimiter, LimiterChain, SharedTokenBucket},
    lsd::LsdHandle,
    peer::{
        codec::Handshake, CommandSender as SessionSender, PeerEvent,
        PeerEventKind, PeerSession, SessionCommand,
    },
    piece::Piece,
    piece_picker::{AvailableThenRarestFirst, PieceAvailability, PieceSelector},
    request::{IncomingRequests, OutgoingRequest, OutgoingRequests},
    storage_info::StorageInfo,
    tracker::{AnnounceEvent, PeerInfo, TrackerGroup},
    Bitfield, BlockInfo, InfoHash, PeerId, PieceIndex, TorrentId,
};

/// The lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    /// Not running: no peers, no update loop.
    Inactive,
    /// Running the startup (or explicitly requested) hash check.
    IntegrityChecking,
    /// Running with pieces still missing.
    Downloading,
    /// Running with every piece verified.
    Seeding,
}

/// A caller's view of one piece's download state.
#[derive(Clone, Copy, Debug)]
pub struct PieceState {
    pub is_verified: bool,
    pub is_verifying: bool,
    /// The downloaded fraction of the piece's blocks, in `[0, 1]`.
    pub download_progress: f64,
}

/// Shared, immutable information about a torrent session, handed to every
/// peer session it spawns. Rebuilt on each start, as the local peer id is
/// generated per run.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    /// Our own peer id for this torrent session.
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// Whether sent bitfields are masked to all zeros (stealth seeding).
    pub mask_bitfield: bool,
}

/// The commands a torrent task accepts.
pub(crate) enum TorrentCommand {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    RecheckIntegrity {
        reply: oneshot::Sender<Result<()>>,
    },
    AddPeers(Vec<PeerInfo>),
    /// An accepted connection whose handshake the listener read and whose
    /// info hash routed here.
    InboundPeer {
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    },
    GetPieceState {
        piece_index: PieceIndex,
        reply: oneshot::Sender<Option<PieceState>>,
    },
    /// Stop and exit the task; used when the engine shuts down.
    Shutdown,
}

/// The handle through which a torrent is controlled. Cheap to clone.
#[derive(Clone)]
pub struct TorrentHandle {
    id: TorrentId,
    cmd_chan: UnboundedSender<TorrentCommand>,
}

impl TorrentHandle {
    pub fn id(&self) -> TorrentId {
        self.id
    }

    /// Starts the torrent: registers it, kicks the integrity pass and the
    /// update loop, and announces over local discovery. Fails with
    /// [`Error::TorrentAlreadyRunning`] if the torrent is running.
    pub async fn start(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_chan.send(TorrentCommand::Start { reply })?;
        response.await.map_err(|_| Error::EngineShutDown)?
    }

    /// Stops the torrent: announces `stopped`, disconnects all peers and
    /// lets the update loop go idle.
    pub async fn stop(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_chan.send(TorrentCommand::Stop { reply })?;
        response.await.map_err(|_| Error::EngineShutDown)?
    }

    /// Re-runs the hash check over all pieces. Refused while the torrent is
    /// running.
    pub async fn recheck_integrity(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_chan
            .send(TorrentCommand::RecheckIntegrity { reply })?;
        response.await.map_err(|_| Error::EngineShutDown)?
    }

    pub fn add_peer(&self, peer: PeerInfo) -> Result<()> {
        self.add_peers(vec![peer])
    }

    pub fn add_peers(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.cmd_chan
            .send(TorrentCommand::AddPeers(peers))
            .map_err(Error::from)
    }

    /// Returns the download state of one piece.
    pub async fn piece_state(&self, piece_index: PieceIndex) -> Result<PieceState> {
        let (reply, response) = oneshot::channel();
        self.cmd_chan
            .send(TorrentCommand::GetPieceState { piece_index, reply })?;
        match response.await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(Error::InvalidPieceIndex(piece_index)),
            Err(_) => Err(Error::EngineShutDown),
        }
    }

    pub(crate) fn inbound_peer(
        &self,
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    ) -> Result<()> {
        self.cmd_chan
            .send(TorrentCommand::InboundPeer {
                addr,
                stream,
                read_buf,
                handshake,
            })
            .map_err(Error::from)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(TorrentCommand::Shutdown).map_err(Error::from)
    }
}

/// What the torrent tracks about one remote peer. At most one live session
/// (connection) exists per endpoint; `cmd_chan` drives it.
struct Peer {
    addr: SocketAddr,
    /// The peer's id, learned from its handshake or from a tracker.
    peer_id: Option<PeerId>,
    /// Set when a handshake from or to this endpoint returned our own id.
    /// Such a peer is never connected again.
    is_self: bool,
    /// The channel to the peer's live session, when one exists.
    cmd_chan: Option<SessionSender>,
    /// Whether the current (or last) session was opened by us.
    is_outbound: bool,
    is_connected: bool,
    is_handshaked: bool,
    /// The peer's piece availability, once its bitfield or first have
    /// arrived. The bitfield is allocated once and incoming bits are
    /// blitted in.
    pieces: Option<Bitfield>,
    // mirrors of the session's choke and interest state, used by the
    // scheduler and the choke policy between ticks
    is_choking_us: bool,
    is_interested_in_us: bool,
    we_interested: bool,
    we_choking: bool,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            is_self: false,
            cmd_chan: None,
            is_outbound: false,
            is_connected: false,
            is_handshaked: false,
            pieces: None,
            is_choking_us: true,
            is_interested_in_us: false,
            we_interested: false,
            we_choking: true,
        }
    }

    /// Whether the peer claims every piece of the torrent.
    fn is_completed(&self) -> bool {
        self.pieces.as_ref().map(|pieces| pieces.all()).unwrap_or(false)
    }

    /// Whether the peer claims at least one piece we lack.
    fn has_piece_we_need(&self, own: &Bitfield) -> bool {
        self.pieces
            .as_ref()
            .map(|pieces| bitfield::count_needed(own, pieces) > 0)
            .unwrap_or(false)
    }

    fn send(&self, cmd: SessionCommand) {
        if let Some(chan) = &self.cmd_chan {
            let _ = chan.send(cmd);
        }
    }
}

/// Everything needed to construct a torrent task.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub piece_hashes: Vec<u8>,
    pub storage: StorageInfo,
    pub is_private: bool,
    pub conf: TorrentConf,
    pub peer_conf: PeerConf,
    pub disk_conf: DiskConf,
    pub disk: DiskHandle,
    pub alert_chan: AlertSender,
    pub trackers: Vec<Arc<dyn TrackerGroup>>,
    pub lsd: Option<LsdHandle>,
    pub registry: TorrentRegistry,
    pub download_bucket: SharedTokenBucket,
    pub upload_bucket: SharedTokenBucket,
}

pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: InfoHash,
    piece_hashes: Vec<u8>,
    storage: StorageInfo,
    is_private: bool,
    conf: TorrentConf,
    peer_conf: PeerConf,

    state: TorrentState,
    is_completed: bool,
    /// Whether the running integrity pass was an explicit recheck, after
    /// which the torrent goes back to `Inactive` instead of running.
    recheck_only: bool,
    /// Pieces whose startup verification hasn't reported back yet.
    integrity_remaining: usize,

    client_id: PeerId,
    ctx: Arc<TorrentContext>,

    pieces: Vec<Piece>,
    own_pieces: Bitfield,
    /// Always equals the sum of the sizes of unverified pieces.
    bytes_left: u64,

    peers: HashMap<SocketAddr, Peer>,
    /// Index of peers whose id we know.
    peer_ids: HashMap<PeerId, SocketAddr>,
    availability: PieceAvailability,
    selector: Box<dyn PieceSelector>,

    outgoing: OutgoingRequests,
    incoming: IncomingRequests,
    /// Disk reads in flight for uploads: which peers get the block once it
    /// arrives from disk.
    pending_uploads: Vec<(BlockInfo, SocketAddr)>,

    download_rate: RateMeasurer,
    upload_rate: RateMeasurer,
    download_limits: LimiterChain,
    upload_limits: LimiterChain,
    queued_writes: Arc<AtomicUsize>,
    queued_reads: Arc<AtomicUsize>,

    disk: DiskHandle,
    disk_alert_chan: TorrentAlertSender,
    disk_alert_port: TorrentAlertReceiver,
    peer_event_chan: crate::peer::EventSender,
    peer_event_port: UnboundedReceiver<PeerEvent>,
    cmd_chan: UnboundedSender<TorrentCommand>,
    cmd_port: UnboundedReceiver<TorrentCommand>,
    alert_chan: AlertSender,

    trackers: Vec<Arc<dyn TrackerGroup>>,
    lsd: Option<LsdHandle>,
    registry: TorrentRegistry,

    /// Drives the random peer draw in the scheduler. Seeded from entropy in
    /// production; tests reseed it for determinism.
    rng: StdRng,
}

impl Torrent {
    pub fn new(params: TorrentParams) -> (Self, TorrentHandle) {
        let TorrentParams {
            id,
            info_hash,
            piece_hashes,
            storage,
            is_private,
            conf,
            peer_conf,
            disk_conf,
            disk,
            alert_chan,
            trackers,
            lsd,
            registry,
            download_bucket,
            upload_bucket,
        } = params;

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (peer_event_chan, peer_event_port) = mpsc::unbounded_channel();
        let (disk_alert_chan, disk_alert_port) = mpsc::unbounded_channel();

        let download_rate = RateMeasurer::new();
        let upload_rate = RateMeasurer::new();
        let queued_writes = Arc::new(AtomicUsize::new(0));
        let queued_reads = Arc::new(AtomicUsize::new(0));

        let download_limits = LimiterChain::new(vec![
            Box::new(download_bucket),
            Box::new(BandwidthLimiter::new(
                conf.download_bandwidth_limit,
                download_rate.avg_handle(),
            )),
            Box::new(DiskQueueLimiter::new(
                Arc::clone(&queued_writes),
                disk_conf.max_queued_writes,
            )),
        ]);
        let upload_limits = LimiterChain::new(vec![
            Box::new(upload_bucket),
            Box::new(BandwidthLimiter::new(
                conf.upload_bandwidth_limit,
                upload_rate.avg_handle(),
            )),
            Box::new(DiskQueueLimiter::new(
                Arc::clone(&queued_reads),
                disk_conf.max_queued_writes,
            )),
        ]);

        let client_id = generate_peer_id();
        let ctx = Arc::new(TorrentContext {
            id,
            info_hash,
            client_id,
            storage: storage.clone(),
            mask_bitfield: conf.mask_sent_bitfield,
        });

        let piece_count = storage.piece_count;
        let pieces = Self::build_pieces(&storage);
        let bytes_left = storage.download_len;

        let torrent = Self {
            id,
            info_hash,
            piece_hashes,
            storage,
            is_private,
            conf,
            peer_conf,
            state: TorrentState::Inactive,
            is_completed: false,
            recheck_only: false,
            integrity_remaining: 0,
            client_id,
            ctx,
            pieces,
            own_pieces: Bitfield::repeat(false, piece_count),
            bytes_left,
            peers: HashMap::new(),
            peer_ids: HashMap::new(),
            availability: PieceAvailability::new(piece_count),
            selector: Box::new(AvailableThenRarestFirst),
            outgoing: OutgoingRequests::new(),
            incoming: IncomingRequests::new(),
            pending_uploads: Vec::new(),
            download_rate,
            upload_rate,
            download_limits,
            upload_limits,
            queued_writes,
            queued_reads,
            disk,
            disk_alert_chan,
            disk_alert_port,
            peer_event_chan,
            peer_event_port,
            cmd_chan: cmd_chan.clone(),
            cmd_port,
            alert_chan,
            trackers,
            lsd,
            registry,
            rng: StdRng::from_entropy(),
        };
        let handle = TorrentHandle { id, cmd_chan };
        (torrent, handle)
    }

    fn build_pieces(storage: &StorageInfo) -> Vec<Piece> {
        (0..storage.piece_count)
            .map(|index| {
                let len = if index == storage.piece_count - 1 {
                    storage.last_piece_len
                } else {
                    storage.piece_len
                };
                Piece::new(index, storage.piece_offset(index), len)
            })
            .collect()
    }

    fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            id: self.id,
            cmd_chan: self.cmd_chan.clone(),
        }
    }

    fn is_running(&self) -> bool {
        self.state != TorrentState::Inactive
    }

    /// Runs the torrent task until the engine shuts it down.
    pub async fn run(&mut self) {
        log::info!("Torrent {} task started", self.id);
        let mut update_interval = time::interval(self.conf.update_interval);
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_port.recv() => {
                    if self.handle_cmd(cmd) {
                        break;
                    }
                }
                Some(event) = self.peer_event_port.recv() => {
                    self.handle_peer_event(event);
                }
                Some(disk_alert) = self.disk_alert_port.recv() => {
                    self.handle_disk_alert(disk_alert);
                }
                _ = update_interval.tick(), if self.is_running() => {
                    self.tick();
                }
            }
        }
        log::info!("Torrent {} task exited", self.id);
    }

    /// Returns true when the task should exit.
    fn handle_cmd(&mut self, cmd: TorrentCommand) -> bool {
        match cmd {
            TorrentCommand::Start { reply } => {
                let _ = reply.send(self.handle_start());
            }
            TorrentCommand::Stop { reply } => {
                let _ = reply.send(self.handle_stop());
            }
            TorrentCommand::RecheckIntegrity { reply } => {
                let _ = reply.send(self.handle_recheck());
            }
            TorrentCommand::AddPeers(peers) => {
                for peer in peers {
                    self.handle_add_peer(peer);
                }
            }
            TorrentCommand::InboundPeer {
                addr,
                stream,
                read_buf,
                handshake,
            } => self.handle_inbound_peer(addr, stream, read_buf, handshake),
            TorrentCommand::GetPieceState { piece_index, reply } => {
                let state = self.pieces.get(piece_index).map(|piece| {
                    PieceState {
                        is_verified: piece.is_verified,
                        is_verifying: piece.is_verifying,
                        download_progress: piece.download_progress(),
                    }
                });
                let _ = reply.send(state);
            }
            TorrentCommand::Shutdown => {
                if self.is_running() {
                    let _ = self.handle_stop();
                }
                return true;
            }
        }
        false
    }

    fn handle_start(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!("Torrent {} is already running", self.id);
            return Err(Error::TorrentAlreadyRunning);
        }
        log::info!("Starting torrent {}", self.id);

        // a fresh peer id per session, per the client convention
        self.client_id = generate_peer_id();
        self.ctx = Arc::new(TorrentContext {
            id: self.id,
            info_hash: self.info_hash,
            client_id: self.client_id,
            storage: self.storage.clone(),
            mask_bitfield: self.conf.mask_sent_bitfield,
        });

        self.download_rate.reset();
        self.upload_rate.reset();
        self.queued_writes.store(0, Ordering::Release);
        self.queued_reads.store(0, Ordering::Release);
        self.is_completed = false;
        self.recheck_only = false;
        self.reset_download_state();

        self.registry
            .write()
            .expect("torrent registry lock poisoned")
            .insert(
                self.info_hash,
                RegistryEntry {
                    handle: self.handle(),
                    is_private: self.is_private,
                },
            );

        self.set_state(TorrentState::IntegrityChecking);
        self.register_with_disk();

        // LSD must stay silent for private torrents
        if !self.is_private {
            if let Some(lsd) = &self.lsd {
                lsd.announce(self.info_hash);
            }
        }
        Ok(())
    }

    fn reset_download_state(&mut self) {
        self.pieces = Self::build_pieces(&self.storage);
        self.own_pieces = Bitfield::repeat(false, self.storage.piece_count);
        self.bytes_left = self.storage.download_len;
        self.outgoing = OutgoingRequests::new();
        self.incoming = IncomingRequests::new();
        self.pending_uploads.clear();
    }

    fn register_with_disk(&mut self) {
        let result = self.disk.new_torrent(
            self.id,
            self.storage.clone(),
            self.piece_hashes.clone(),
            self.conf.allocate_full_file_sizes,
            Arc::clone(&self.queued_writes),
            Arc::clone(&self.queued_reads),
            self.disk_alert_chan.clone(),
        );
        if result.is_err() {
            log::error!("Torrent {} cannot reach the disk task", self.id);
            self.fail("disk task is gone");
        }
    }

    fn handle_stop(&mut self) -> Result<()> {
        if !self.is_running() {
            log::warn!("Torrent {} is not running", self.id);
            return Err(Error::TorrentNotRunning);
        }
        log::info!("Stopping torrent {}", self.id);

        self.registry
            .write()
            .expect("torrent registry lock poisoned")
            .remove(&self.info_hash);
        self.announce(AnnounceEvent::Stopped);

        for peer in self.peers.values_mut() {
            if let Some(chan) = peer.cmd_chan.take() {
                let _ = chan.send(SessionCommand::Shutdown);
            }
        }
        self.peers.clear();
        self.peer_ids.clear();
        self.availability = PieceAvailability::new(self.storage.piece_count);
        self.outgoing = OutgoingRequests::new();
        self.incoming = IncomingRequests::new();
        self.pending_uploads.clear();

        let _ = self.disk.remove_torrent(self.id);
        self.set_state(TorrentState::Inactive);
        Ok(())
    }

    fn handle_recheck(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!(
                "Torrent {} integrity recheck refused while running",
                self.id
            );
            return Err(Error::TorrentAlreadyRunning);
        }
        log::info!("Rechecking torrent {} integrity", self.id);
        self.recheck_only = true;
        self.reset_download_state();
        self.set_state(TorrentState::IntegrityChecking);
        self.register_with_disk();
        Ok(())
    }

    /// Stops the torrent because of an unrecoverable error (e.g. the disk
    /// backend failed).
    fn fail(&mut self, error: &str) {
        log::error!("Torrent {} failed: {}", self.id, error);
        self.alert(Alert::TorrentError {
            id: self.id,
            error: error.to_string(),
        });
        if self.is_running() {
            let _ = self.handle_stop();
        } else {
            self.set_state(TorrentState::Inactive);
        }
    }

    fn set_state(&mut self, state: TorrentState) {
        if self.state != state {
            log::info!("Torrent {} state: {:?}", self.id, state);
            self.state = state;
            self.alert(Alert::StateChanged {
                id: self.id,
                state,
            });
        }
    }

    fn alert(&self, alert: Alert) {
        // the user dropping the alert receiver just mutes notifications
        let _ = self.alert_chan.send(alert);
    }

    fn announce(&mut self, event: AnnounceEvent) {
        for tracker in &self.trackers {
            let tracker = Arc::clone(tracker);
            let cmd_chan = self.cmd_chan.clone();
            tokio::spawn(async move {
                match tracker.announce(event).await {
                    Ok(response) => {
                        if event != AnnounceEvent::Stopped
                            && !response.peer_infos.is_empty()
                        {
                            let _ = cmd_chan.send(TorrentCommand::AddPeers(
                                response.peer_infos,
                            ));
                        }
                    }
                    Err(e) => log::warn!("Tracker announce error: {}", e),
                }
            });
        }
    }

    fn connected_peer_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.cmd_chan.is_some()).count()
    }

    fn handle_add_peer(&mut self, info: PeerInfo) {
        // never add ourselves
        if info.peer_id == Some(self.client_id) {
            return;
        }

        // if the id is known under another endpoint, the peer moved: carry
        // its entry over to the new endpoint
        if let Some(peer_id) = info.peer_id {
            if let Some(old_addr) = self.peer_ids.get(&peer_id).copied() {
                if old_addr != info.addr && !self.peers.contains_key(&info.addr)
                {
                    if let Some(mut peer) = self.peers.remove(&old_addr) {
                        log::info!(
                            "Peer {} moved from {} to {}",
                            hex::encode(peer_id),
                            old_addr,
                            info.addr
                        );
                        if let Some(chan) = peer.cmd_chan.take() {
                            let _ = chan.send(SessionCommand::Shutdown);
                        }
                        if peer.is_connected {
                            self.availability
                                .peer_disconnected(peer.pieces.as_ref());
                            peer.is_connected = false;
                            peer.is_handshaked = false;
                        }
                        peer.addr = info.addr;
                        self.peers.insert(info.addr, peer);
                    }
                    self.peer_ids.insert(peer_id, info.addr);
                }
            }
        }

        let peer =
            self.peers.entry(info.addr).or_insert_with(|| Peer::new(info.addr));
        if let (None, Some(peer_id)) = (peer.peer_id, info.peer_id) {
            peer.peer_id = Some(peer_id);
            self.peer_ids.insert(peer_id, info.addr);
        }

        self.connect_idle_peers();
    }

    /// Opens outbound connections to known, unconnected peers while there
    /// is capacity. Only meaningful while running and past the integrity
    /// check.
    fn connect_idle_peers(&mut self) {
        if !matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        ) {
            return;
        }
        // stay under both the overall connection cap and the outbound
        // (download) connection cap
        let outbound_count = self
            .peers
            .values()
            .filter(|peer| peer.cmd_chan.is_some() && peer.is_outbound)
            .count();
        let mut budget = self
            .conf
            .max_connected_peer_count
            .saturating_sub(self.connected_peer_count())
            .min(
                self.peer_conf
                    .max_download_connections
                    .saturating_sub(outbound_count),
            );

        let idle: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.cmd_chan.is_none() && !peer.is_self)
            .map(|peer| peer.addr)
            .collect();
        for addr in idle {
            if budget == 0 {
                break;
            }
            self.spawn_outbound_session(addr);
            budget -= 1;
        }
    }

    fn spawn_outbound_session(&mut self, addr: SocketAddr) {
        log::info!("Torrent {} connecting to peer {}", self.id, addr);
        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.ctx),
            self.peer_conf.clone(),
            self.peer_event_chan.clone(),
            self.own_pieces.clone(),
            addr,
        );
        tokio::spawn(async move { session.start_outbound().await });
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.cmd_chan = Some(cmd_chan);
            peer.is_outbound = true;
        }
    }

    fn handle_inbound_peer(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    ) {
        if !matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        ) {
            log::info!(
                "Dropping inbound peer {}: torrent {} not serving",
                addr,
                self.id
            );
            return;
        }
        debug_assert_eq!(handshake.info_hash, self.info_hash);

        // second phase of the inbound check: the torrent was adopted by info
        // hash, now compare ids
        if handshake.peer_id == self.client_id {
            log::info!("Inbound peer {} is ourselves", addr);
            let peer =
                self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
            peer.is_self = true;
            return;
        }

        if self.connected_peer_count() >= self.conf.max_connected_peer_count {
            log::info!("Dropping inbound peer {}: at capacity", addr);
            return;
        }

        {
            let peer =
                self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
            if peer.is_self {
                return;
            }
            // an endpoint that changes identity is not to be trusted
            if let Some(known_id) = peer.peer_id {
                if known_id != handshake.peer_id {
                    log::warn!(
                        "Inbound peer {} id changed, dropping",
                        addr
                    );
                    return;
                }
            }
        }

        // adopt or replace: a reconnecting peer's old session is shut down
        let replaced = self
            .peers
            .get_mut(&addr)
            .and_then(|peer| peer.cmd_chan.take());
        if let Some(old_chan) = replaced {
            log::info!("Replacing connection of peer {}", addr);
            let _ = old_chan.send(SessionCommand::Shutdown);
            let peer = self.peers.get_mut(&addr).expect("peer just looked up");
            if peer.is_connected {
                peer.is_connected = false;
                peer.is_handshaked = false;
                // the new session re-learns the availability from scratch
                let pieces = peer.pieces.take();
                self.availability.peer_disconnected(pieces.as_ref());
            }
        }

        let (mut session, cmd_chan) = PeerSession::inbound(
            Arc::clone(&self.ctx),
            self.peer_conf.clone(),
            self.peer_event_chan.clone(),
            self.own_pieces.clone(),
            addr,
            handshake.peer_id,
        );
        tokio::spawn(async move {
            session.start_inbound(stream, read_buf).await
        });

        let peer = self.peers.get_mut(&addr).expect("peer just inserted");
        peer.peer_id = Some(handshake.peer_id);
        peer.cmd_chan = Some(cmd_chan);
        peer.is_outbound = false;
        peer.is_connected = true;
        self.peer_ids.insert(handshake.peer_id, addr);
        self.availability.peer_connected();
        self.alert(Alert::PeerConnected { id: self.id, addr });
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let addr = event.addr;
        match event.kind {
            PeerEventKind::Connected => {
                let newly_connected = match self.peers.get_mut(&addr) {
                    Some(peer) if !peer.is_connected => {
                        peer.is_connected = true;
                        true
                    }
                    _ => false,
                };
                if newly_connected {
                    self.availability.peer_connected();
                    self.alert(Alert::PeerConnected { id: self.id, addr });
                }
            }
            PeerEventKind::ConnectFailed(reason) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.cmd_chan = None;
                }
                self.alert(Alert::ConnectionFailed {
                    id: self.id,
                    addr,
                    reason,
                });
            }
            PeerEventKind::Handshaked { peer_id } => {
                self.on_peer_handshaked(addr, peer_id);
            }
            PeerEventKind::BitfieldReceived(pieces) => {
                self.on_bitfield_received(addr, pieces);
            }
            PeerEventKind::HaveReceived(piece_index) => {
                self.on_have_received(addr, piece_index);
            }
            PeerEventKind::ChokedUs => self.on_peer_choking_us(addr),
            PeerEventKind::UnchokedUs => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.is_choking_us = false;
                }
            }
            PeerEventKind::PeerInterested(is_interested) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.is_interested_in_us = is_interested;
                }
            }
            PeerEventKind::BlockReceived { block, data } => {
                self.on_received_piece_block(addr, block, data);
            }
            PeerEventKind::BlockRequested(block) => {
                self.on_piece_block_requested(addr, block);
            }
            PeerEventKind::CancelReceived(block) => {
                self.incoming.cancel(
                    &addr,
                    block.piece_index,
                    block.offset,
                    block.len,
                );
            }
            PeerEventKind::Disconnected { was_self } => {
                self.on_peer_disconnected(addr, was_self);
            }
        }
    }

    fn on_peer_handshaked(&mut self, addr: SocketAddr, peer_id: PeerId) {
        let close = match self.peers.get_mut(&addr) {
            None => true,
            Some(peer) => match peer.peer_id {
                // the endpoint presented a different id than previously
                // recorded for it
                Some(known_id) if known_id != peer_id => true,
                _ => {
                    peer.peer_id = Some(peer_id);
                    peer.is_handshaked = true;
                    false
                }
            },
        };
        if close {
            log::warn!("Peer {} handshake id conflict, disconnecting", addr);
            if let Some(peer) = self.peers.get(&addr) {
                peer.send(SessionCommand::Shutdown);
            }
            return;
        }
        self.peer_ids.insert(peer_id, addr);
        self.alert(Alert::PeerHandshaked {
            id: self.id,
            addr,
            peer_id,
        });
    }

    fn on_bitfield_received(&mut self, addr: SocketAddr, pieces: Bitfield) {
        let piece_count = self.storage.piece_count;
        debug_assert_eq!(pieces.len(), piece_count);
        match self.peers.get_mut(&addr) {
            None => return,
            Some(peer) => match &mut peer.pieces {
                // the peer-owned bitfield is allocated once; later bits are
                // blitted into it
                Some(own) => bitfield::copy_from(own, &pieces),
                None => peer.pieces = Some(pieces),
            },
        }
        // the bitfield replaces nothing availability-wise: a session only
        // ever delivers it once, right after the handshake
        let pieces = self
            .peers
            .get(&addr)
            .and_then(|peer| peer.pieces.clone())
            .unwrap_or_else(|| Bitfield::repeat(false, piece_count));
        self.availability.register_bitfield(&pieces);
        if pieces.all() {
            log::info!("Peer {} is a seed", addr);
        }
        self.alert(Alert::BitfieldReceived { id: self.id, addr });
        self.update_interest_in(addr);
    }

    fn on_have_received(&mut self, addr: SocketAddr, piece_index: PieceIndex) {
        debug_assert!(piece_index < self.storage.piece_count);
        let piece_count = self.storage.piece_count;
        match self.peers.get_mut(&addr) {
            None => return,
            Some(peer) => {
                let pieces = peer
                    .pieces
                    .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
                if pieces[piece_index] {
                    // the session deduplicates haves; nothing new here
                    return;
                }
                pieces.set(piece_index, true);
            }
        }
        self.availability.register_have(piece_index);
        if self
            .peers
            .get(&addr)
            .map(Peer::is_completed)
            .unwrap_or(false)
        {
            log::info!("Peer {} completed the torrent", addr);
        }
        self.alert(Alert::HavePieceReceived {
            id: self.id,
            addr,
            piece_index,
        });
        self.update_interest_in(addr);
    }

    /// Applies the interest half of the connection policy to one peer right
    /// away (the periodic tick covers the rest).
    fn update_interest_in(&mut self, addr: SocketAddr) {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return,
        };
        if self.is_completed {
            if peer.we_interested {
                peer.we_interested = false;
                peer.send(SessionCommand::NotInterested);
            }
        } else if !peer.we_interested
            && peer.has_piece_we_need(&self.own_pieces)
        {
            peer.we_interested = true;
            peer.send(SessionCommand::Interested);
        }
    }

    /// A remote choke voids all our outstanding requests to that peer: they
    /// are cancelled locally and, for those already on the wire, the peer is
    /// told as well.
    fn on_peer_choking_us(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.is_choking_us = true;
        }
        let cancelled = self.outgoing.cancel_for_peer(&addr);
        for request in cancelled {
            self.finish_cancel(&request);
        }
        self.outgoing.sweep_cancelled();
    }

    /// Clears the block's requested-peer entry and, if the request already
    /// went over the wire, sends the peer a cancel message.
    fn finish_cancel(&mut self, request: &OutgoingRequest) {
        if let Some(piece) = self.pieces.get_mut(request.block.piece_index) {
            if let Some(block) =
                piece.blocks.get_mut(request.block.index_in_piece())
            {
                block.clear_request(&request.peer);
            }
        }
        if request.has_been_sent {
            if let Some(peer) = self.peers.get(&request.peer) {
                peer.send(SessionCommand::CancelRequest(request.block));
            }
        }
    }

    fn on_received_piece_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    ) {
        debug_assert_eq!(block.len as usize, data.len());
        let piece = match self.pieces.get_mut(block.piece_index) {
            Some(piece) => piece,
            None => return,
        };
        if piece.is_verified {
            // a stale block for a piece that completed meanwhile
            return;
        }
        let already_downloaded = match piece.block_at_offset(block.offset) {
            Some(piece_block) => piece_block.is_downloaded,
            // the session validated the geometry, so this cannot happen
            None => return,
        };
        if already_downloaded {
            log::debug!(
                "Torrent {} got duplicate block {:?} from {}",
                self.id,
                block,
                addr
            );
            // the race is expected during endgame; just drop the copy and
            // clean up the bookkeeping for this peer
            let _ = self.outgoing.complete((
                addr,
                block.piece_index,
                block.index_in_piece(),
            ));
            return;
        }

        if let Some(piece_block) = piece.block_at_offset(block.offset) {
            debug_assert_eq!(piece_block.len, block.len);
            if let Some(requested_time) = piece_block.last_request_time {
                log::trace!(
                    "Block {:?} arrived {:?} after its request",
                    block,
                    requested_time.elapsed()
                );
            }
            piece_block.mark_downloaded();
        }
        let _ = self.outgoing.complete((
            addr,
            block.piece_index,
            block.index_in_piece(),
        ));

        // during endgame other peers may owe us the same block; tell them we
        // no longer care
        let duplicates = self.outgoing.cancel_duplicates(&block, &addr);
        for request in duplicates {
            self.finish_cancel(&request);
        }
        self.outgoing.sweep_cancelled();

        self.download_rate.record(block.len as u64);
        self.queued_writes.fetch_add(1, Ordering::AcqRel);
        if self.disk.write_block(self.id, block, data).is_err() {
            self.queued_writes.fetch_sub(1, Ordering::AcqRel);
            self.fail("disk task is gone");
        }
    }

    fn on_piece_block_requested(&mut self, addr: SocketAddr, block: BlockInfo) {
        // the session already validated geometry and the choke state; the
        // queue enforces uniqueness
        if !self.incoming.push(addr, block.piece_index, block.offset, block.len)
        {
            log::debug!(
                "Torrent {} duplicate incoming request {:?} from {}",
                self.id,
                block,
                addr
            );
        }
    }

    fn on_peer_disconnected(&mut self, addr: SocketAddr, was_self: bool) {
        log::info!("Torrent {} peer {} disconnected", self.id, addr);

        // forget requests bound to the peer, in both directions
        let outstanding = self.outgoing.cancel_for_peer(&addr);
        for request in &outstanding {
            if let Some(piece) = self.pieces.get_mut(request.block.piece_index)
            {
                if let Some(block) =
                    piece.blocks.get_mut(request.block.index_in_piece())
                {
                    block.clear_request(&addr);
                }
            }
        }
        self.outgoing.remove_for_peer(&addr);
        self.incoming.remove_for_peer(&addr);
        self.pending_uploads.retain(|(_, peer)| *peer != addr);

        let was_connected = match self.peers.get_mut(&addr) {
            Some(peer) => {
                if was_self {
                    peer.is_self = true;
                }
                let was_connected = peer.is_connected;
                peer.is_connected = false;
                peer.is_handshaked = false;
                peer.cmd_chan = None;
                peer.is_choking_us = true;
                peer.is_interested_in_us = false;
                peer.we_interested = false;
                peer.we_choking = true;
                was_connected
            }
            None => false,
        };
        if was_connected {
            let pieces =
                self.peers.get_mut(&addr).and_then(|peer| peer.pieces.take());
            self.availability.peer_disconnected(pieces.as_ref());
            self.alert(Alert::PeerDisconnected { id: self.id, addr });
        }
    }

    fn handle_disk_alert(&mut self, disk_alert: TorrentAlert) {
        match disk_alert {
            TorrentAlert::Allocated(result) => match result {
                Ok(()) => self.start_integrity_check(),
                Err(e) => {
                    self.fail(&format!("disk allocation failed: {}", e))
                }
            },
            TorrentAlert::BlockWritten { block, result } => {
                self.on_block_written(block, result.is_ok());
            }
            TorrentAlert::BlockRead { block, result } => {
                self.on_block_read(block, result);
            }
            TorrentAlert::PieceVerified {
                piece_index,
                is_valid,
            } => {
                self.on_piece_verified(piece_index, is_valid);
            }
        }
    }

    /// Kicks the startup hash check: every piece is verified in order
    /// against the metainfo hashes. Unreadable pieces count as missing.
    fn start_integrity_check(&mut self) {
        debug_assert_eq!(self.state, TorrentState::IntegrityChecking);
        log::info!("Torrent {} integrity check started", self.id);
        self.integrity_remaining = self.storage.piece_count;
        for piece in &mut self.pieces {
            piece.is_verifying = true;
        }
        for index in 0..self.storage.piece_count {
            if self.disk.verify_piece(self.id, index).is_err() {
                self.fail("disk task is gone");
                return;
            }
        }
    }

    fn on_piece_verified(&mut self, piece_index: PieceIndex, is_valid: bool) {
        let piece = match self.pieces.get_mut(piece_index) {
            Some(piece) => piece,
            None => return,
        };
        if !piece.is_verifying {
            return;
        }
        let piece_len = piece.len as u64;
        let piece_offset = piece.torrent_offset;
        piece.set_verified(is_valid);

        if self.state == TorrentState::IntegrityChecking {
            if is_valid {
                self.own_pieces.set(piece_index, true);
                self.bytes_left -= piece_len;
            }
            self.integrity_remaining -= 1;
            if self.integrity_remaining == 0 {
                self.finish_integrity_check();
            }
            return;
        }

        if is_valid {
            log::info!(
                "Torrent {} piece {} (torrent offset {}) verified",
                self.id,
                piece_index,
                piece_offset
            );
            self.own_pieces.set(piece_index, true);
            self.bytes_left -= piece_len;
            self.alert(Alert::PieceVerified {
                id: self.id,
                piece_index,
            });
            // everyone who doesn't have the piece gets a have message
            for peer in self.peers.values() {
                if peer.is_handshaked {
                    peer.send(SessionCommand::AnnouncePiece(piece_index));
                }
            }
            self.check_completion();
        } else {
            // the blocks were reset to undownloaded; the scheduler will
            // re-fetch the piece
            log::warn!(
                "Torrent {} piece {} failed verification",
                self.id,
                piece_index
            );
        }
    }

    fn finish_integrity_check(&mut self) {
        let verified_count =
            self.pieces.iter().filter(|piece| piece.is_verified).count();
        log::info!(
            "Torrent {} integrity check done: {}/{} pieces verified",
            self.id,
            verified_count,
            self.storage.piece_count
        );
        self.alert(Alert::IntegrityCheckCompleted {
            id: self.id,
            verified_count,
            piece_count: self.storage.piece_count,
        });

        if self.recheck_only {
            self.recheck_only = false;
            let _ = self.disk.remove_torrent(self.id);
            self.set_state(TorrentState::Inactive);
            return;
        }

        if verified_count == self.storage.piece_count {
            self.is_completed = true;
            self.set_state(TorrentState::Seeding);
        } else {
            self.set_state(TorrentState::Downloading);
        }
        self.announce(AnnounceEvent::Started);
        self.connect_idle_peers();
    }

    fn on_block_written(&mut self, block: BlockInfo, success: bool) {
        let piece = match self.pieces.get_mut(block.piece_index) {
            Some(piece) => piece,
            None => return,
        };
        let piece_block = match piece.block_at_offset(block.offset) {
            Some(piece_block) => piece_block,
            None => return,
        };
        if success {
            if piece_block.is_downloaded {
                piece_block.mark_written();
            }
            if piece.has_downloaded_all_blocks()
                && !piece.is_verified
                && !piece.is_verifying
            {
                piece.is_verifying = true;
                if self.disk.verify_piece(self.id, block.piece_index).is_err()
                {
                    self.fail("disk task is gone");
                }
            }
        } else {
            // the write never happened: the block must be fetched again
            piece_block.mark_undownloaded();
        }
    }

    fn on_block_read(
        &mut self,
        block: BlockInfo,
        result: std::result::Result<Vec<u8>, std::io::Error>,
    ) {
        let waiting: Vec<SocketAddr> = self
            .pending_uploads
            .iter()
            .filter(|(pending, _)| *pending == block)
            .map(|(_, peer)| *peer)
            .collect();
        self.pending_uploads.retain(|(pending, _)| *pending != block);

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                log::warn!(
                    "Torrent {} upload read {:?} failed: {}",
                    self.id,
                    block,
                    e
                );
                return;
            }
        };
        for addr in waiting {
            if let Some(peer) = self.peers.get(&addr) {
                if peer.is_connected {
                    peer.send(SessionCommand::SendBlock {
                        block,
                        data: data.clone(),
                    });
                    self.upload_rate.record(block.len as u64);
                }
            }
        }
    }

    fn check_completion(&mut self) {
        if self.is_completed
            || !self.pieces.iter().all(|piece| piece.is_verified)
        {
            return;
        }
        log::info!(
            "Torrent {} download complete ({} block bytes this session)",
            self.id,
            self.download_rate.total()
        );
        self.is_completed = true;
        debug_assert_eq!(self.bytes_left, 0);

        // nothing left to ask anyone for
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let cancelled = self.outgoing.cancel_for_peer(&addr);
            for request in cancelled {
                self.finish_cancel(&request);
            }
        }
        self.outgoing.sweep_cancelled();

        self.set_state(TorrentState::Seeding);
        self.announce(AnnounceEvent::Completed);
        self.alert(Alert::Completed { id: self.id });
    }

    /// The periodic update: refresh the rate measurers and, once the
    /// integrity check is done, update trackers and peers and run both
    /// request pipelines.
    fn tick(&mut self) {
        self.download_rate.update();
        self.upload_rate.update();

        if !matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        ) {
            return;
        }
        log::debug!(
            "Torrent {}: down {} B/s (avg {}), up {} B/s (avg {}), \
             {} outgoing, {} incoming requests",
            self.id,
            self.download_rate.rate(),
            self.download_rate.avg_rate(),
            self.upload_rate.rate(),
            self.upload_rate.avg_rate(),
            self.outgoing.len(),
            self.incoming.len()
        );

        for tracker in &self.trackers {
            let tracker = Arc::clone(tracker);
            tokio::spawn(async move { tracker.update().await });
        }

        self.update_peers();
        self.process_incoming_requests();
        self.process_outgoing_requests(Instant::now());
    }

    /// Applies the choke and interest policy to every connected peer.
    fn update_peers(&mut self) {
        let is_completed = self.is_completed;
        let own_pieces = self.own_pieces.clone();
        // interested peers are unchoked up to the upload slot cap
        let upload_slots = self.peer_conf.max_upload_connections;
        let mut unchoked = self
            .peers
            .values()
            .filter(|peer| peer.is_connected && !peer.we_choking)
            .count();
        for peer in self.peers.values_mut() {
            if !peer.is_connected || !peer.is_handshaked {
                continue;
            }
            if peer.is_interested_in_us
                && peer.we_choking
                && unchoked < upload_slots
            {
                peer.we_choking = false;
                unchoked += 1;
                peer.send(SessionCommand::Unchoke);
            } else if !peer.is_interested_in_us && !peer.we_choking {
                peer.we_choking = true;
                unchoked = unchoked.saturating_sub(1);
                peer.send(SessionCommand::Choke);
            }

            if is_completed {
                if peer.we_interested {
                    peer.we_interested = false;
                    peer.send(SessionCommand::NotInterested);
                }
            } else if !peer.we_interested && peer.has_piece_we_need(&own_pieces)
            {
                peer.we_interested = true;
                peer.send(SessionCommand::Interested);
            }
        }
        self.connect_idle_peers();
    }

    /// Serves queued incoming requests while the upload limiter chain
    /// admits them: skip dead entries, read the block from disk and hand it
    /// to the session once read.
    fn process_incoming_requests(&mut self) {
        loop {
            let request = match self.incoming.pop() {
                Some(request) => request,
                None => break,
            };
            let peer_connected = self
                .peers
                .get(&request.peer)
                .map(|peer| peer.is_connected)
                .unwrap_or(false);
            if !peer_connected {
                continue;
            }
            let piece_verified = self
                .pieces
                .get(request.piece_index)
                .map(|piece| piece.is_verified)
                .unwrap_or(false);
            if !piece_verified {
                continue;
            }
            if !self.upload_limits.try_process(request.len as u64) {
                // not this round; retry the same request next tick
                self.incoming.push_front(request);
                break;
            }

            let block = BlockInfo {
                piece_index: request.piece_index,
                offset: request.offset,
                len: request.len,
            };
            self.queued_reads.fetch_add(1, Ordering::AcqRel);
            if self.disk.read_block(self.id, block).is_err() {
                self.queued_reads.fetch_sub(1, Ordering::AcqRel);
                self.fail("disk task is gone");
                return;
            }
            self.pending_uploads.push((block, request.peer));
        }
    }

    /// The download scheduler: expire stale requests, assign missing blocks
    /// to eligible peers (rarest-first ranked, random peer draw), then
    /// drain the send queue while the rate limiter admits.
    fn process_outgoing_requests(&mut self, now: Instant) {
        self.expire_requests(now);
        if !self.is_completed {
            self.assign_requests(now);
        }
        self.drain_request_queue();
        self.outgoing.sweep_cancelled();
    }

    fn expire_requests(&mut self, now: Instant) {
        let expired = self
            .outgoing
            .cancel_expired(self.peer_conf.piece_request_timeout, now);
        for request in expired {
            log::debug!(
                "Torrent {} request {:?} to {} timed out",
                self.id,
                request.block,
                request.peer
            );
            self.finish_cancel(&request);
        }
    }

    /// The set of peers new requests may go to, with their per-peer quota
    /// left.
    fn eligible_peers(&self) -> Vec<SocketAddr> {
        let quota = self.peer_conf.max_concurrent_piece_requests;
        self.peers
            .values()
            .filter(|peer| {
                peer.is_connected
                    && peer.is_handshaked
                    && peer.we_interested
                    && !peer.is_choking_us
                    && peer.pieces.is_some()
                    && self.outgoing.count_for_peer(&peer.addr) < quota
            })
            .map(|peer| peer.addr)
            .collect()
    }

    fn assign_requests(&mut self, now: Instant) {
        let quota = self.peer_conf.max_concurrent_piece_requests;
        let mut pool = self.eligible_peers();
        if pool.is_empty() {
            return;
        }
        // Peers are drawn randomly without replacement: a peer re-enters
        // the draw only once every pool member had a turn. This spreads
        // blocks evenly over peers of equal standing.
        let mut round: Vec<SocketAddr> = Vec::new();

        let ranked = self.selector.select(&self.pieces, &self.availability);
        for piece_index in ranked {
            if pool.is_empty() {
                break;
            }
            let blocks = self.pieces[piece_index].missing_unrequested_blocks();
            for block in blocks {
                let addr =
                    match self.draw_peer(&mut round, &pool, piece_index) {
                        Some(addr) => addr,
                        None => break,
                    };

                if self.outgoing.register(block, addr, now) {
                    self.pieces[piece_index].blocks
                        [block.index_in_piece()]
                    .register_request(addr, now);
                }
                if self.outgoing.count_for_peer(&addr) >= quota {
                    pool.retain(|pooled| *pooled != addr);
                    if pool.is_empty() {
                        break;
                    }
                }
            }
            if pool.is_empty() {
                break;
            }
        }

        // endgame: when every missing block is already on request, ask
        // other owners for the same blocks; the first arrival wins and the
        // rest get cancelled
        if !pool.is_empty() && self.in_endgame() {
            self.assign_endgame_duplicates(pool, now);
        }
    }

    /// Draws a random peer owning the piece from the current round,
    /// refilling the round from the pool when it runs dry. Returns `None`
    /// when no pool member owns the piece.
    fn draw_peer(
        &mut self,
        round: &mut Vec<SocketAddr>,
        pool: &[SocketAddr],
        piece_index: PieceIndex,
    ) -> Option<SocketAddr> {
        // a peer removed from the pool (quota reached) no longer counts,
        // even if it is still in the current round
        round.retain(|addr| pool.contains(addr));
        for _ in 0..2 {
            let candidates: Vec<usize> = round
                .iter()
                .enumerate()
                .filter(|(_, addr)| self.peer_has_piece(addr, piece_index))
                .map(|(round_index, _)| round_index)
                .collect();
            if !candidates.is_empty() {
                let choice =
                    candidates[self.rng.gen_range(0..candidates.len())];
                return Some(round.swap_remove(choice));
            }
            // the round ran out of owners of this piece: start a new round
            *round = pool.to_vec();
        }
        None
    }

    fn peer_has_piece(&self, addr: &SocketAddr, piece_index: PieceIndex) -> bool {
        self.peers
            .get(addr)
            .and_then(|peer| peer.pieces.as_ref())
            .map(|pieces| pieces[piece_index])
            .unwrap_or(false)
    }

    /// True when the download is incomplete but every still missing block is
    /// already requested to at least one peer.
    fn in_endgame(&self) -> bool {
        let mut any_missing = false;
        for piece in self.pieces.iter().filter(|piece| !piece.is_verified) {
            for block in
                piece.blocks.iter().filter(|block| !block.is_downloaded)
            {
                any_missing = true;
                if !block.is_requested() {
                    return false;
                }
            }
        }
        any_missing
    }

    fn assign_endgame_duplicates(
        &mut self,
        mut pool: Vec<SocketAddr>,
        now: Instant,
    ) {
        log::debug!("Torrent {} in endgame", self.id);
        let quota = self.peer_conf.max_concurrent_piece_requests;
        let missing: Vec<BlockInfo> = self
            .pieces
            .iter()
            .filter(|piece| !piece.is_verified)
            .flat_map(|piece| {
                piece
                    .blocks
                    .iter()
                    .filter(|block| !block.is_downloaded)
                    .map(move |block| {
                        BlockInfo::new(piece.index, block.index, piece.len)
                    })
            })
            .collect();

        for block in missing {
            if pool.is_empty() {
                return;
            }
            let mut pool_index = 0;
            while pool_index < pool.len() {
                let addr = pool[pool_index];
                let already_asked = self.pieces[block.piece_index].blocks
                    [block.index_in_piece()]
                .requested_to
                .contains(&addr);
                if !already_asked
                    && self.peer_has_piece(&addr, block.piece_index)
                    && self.outgoing.register(block, addr, now)
                {
                    self.pieces[block.piece_index].blocks
                        [block.index_in_piece()]
                    .register_request(addr, now);
                }
                if self.outgoing.count_for_peer(&addr) >= quota {
                    pool.swap_remove(pool_index);
                } else {
                    pool_index += 1;
                }
            }
        }
    }

    /// Sends queued requests in order while the download limiter chain
    /// admits them.
    fn drain_request_queue(&mut self) {
        while let Some(request) = self.outgoing.next_unsent() {
            let key = request.key();
            // verify the request is still worth sending
            let peer_ready = self
                .peers
                .get(&request.peer)
                .map(|peer| {
                    peer.is_connected && !peer.is_choking_us
                })
                .unwrap_or(false);
            let block_missing = self
                .pieces
                .get(request.block.piece_index)
                .and_then(|piece| {
                    piece.blocks.get(request.block.index_in_piece())
                })
                .map(|block| !block.is_downloaded)
                .unwrap_or(false);
            if !peer_ready || !block_missing {
                self.outgoing.cancel(key);
                self.finish_unsent_cancel(&request);
                continue;
            }

            if !self.download_limits.try_process(request.block.len as u64) {
                break;
            }

            // mark as sent before handing to the session; on a dead session
            // roll the registration back
            let sent = self
                .peers
                .get(&request.peer)
                .and_then(|peer| peer.cmd_chan.as_ref())
                .map(|chan| {
                    chan.send(SessionCommand::SendRequest(request.block)).is_ok()
                })
                .unwrap_or(false);
            if sent {
                self.outgoing.mark_sent(key);
            } else {
                self.outgoing.cancel(key);
                self.finish_unsent_cancel(&request);
            }
        }
    }

    /// Cleanup for a cancelled request that never reached the wire: only
    /// the block bookkeeping needs undoing.
    fn finish_unsent_cancel(&mut self, request: &OutgoingRequest) {
        if let Some(piece) = self.pieces.get_mut(request.block.piece_index) {
            if let Some(block) =
                piece.blocks.get_mut(request.block.index_in_piece())
            {
                block.clear_request(&request.peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::Conf,
        disk::Command as DiskCommand,
        request::CancelOutcome,
        BLOCK_LEN,
    };
    use std::path::PathBuf;

    struct Fixture {
        torrent: Torrent,
        disk_port: UnboundedReceiver<DiskCommand>,
        _handle: TorrentHandle,
    }

    fn fixture(piece_count: usize) -> Fixture {
        let piece_len = 2 * BLOCK_LEN;
        let download_len = piece_len as u64 * piece_count as u64;
        let storage = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: PathBuf::from("/nonexistent"),
            files: vec![crate::FileInfo {
                path: PathBuf::from("file"),
                torrent_offset: 0,
                len: download_len,
            }],
        };
        let conf = Conf::new("/nonexistent");
        let (disk_chan, disk_port) = mpsc::unbounded_channel();
        let (alert_chan, _alert_port) = mpsc::unbounded_channel();
        // keep the receiver alive so sends don't error
        std::mem::forget(_alert_port);

        let (mut torrent, handle) = Torrent::new(TorrentParams {
            id: 0,
            info_hash: [0xab; 20],
            piece_hashes: vec![0; piece_count * 20],
            storage,
            is_private: false,
            conf: conf.torrent,
            peer_conf: conf.peer,
            disk_conf: conf.disk,
            disk: DiskHandle(disk_chan),
            alert_chan,
            trackers: Vec::new(),
            lsd: None,
            registry: TorrentRegistry::default(),
            download_bucket: SharedTokenBucket::new(0),
            upload_bucket: SharedTokenBucket::new(0),
        });
        // deterministic scheduling draws
        torrent.rng = StdRng::seed_from_u64(0);
        torrent.state = TorrentState::Downloading;
        Fixture {
            torrent,
            disk_port,
            _handle: handle,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    /// Wires up a connected, handshaked, unchoked seed peer and returns the
    /// receiving end of its session command channel.
    fn add_seed_peer(
        torrent: &mut Torrent,
        addr: SocketAddr,
    ) -> UnboundedReceiver<SessionCommand> {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let mut peer = Peer::new(addr);
        peer.cmd_chan = Some(cmd_chan);
        peer.is_connected = true;
        peer.is_handshaked = true;
        peer.is_choking_us = false;
        peer.we_interested = true;
        peer.pieces = Some(Bitfield::repeat(true, torrent.storage.piece_count));
        torrent.peers.insert(addr, peer);
        torrent.availability.peer_connected();
        torrent
            .availability
            .register_bitfield(&Bitfield::repeat(
                true,
                torrent.storage.piece_count,
            ));
        cmd_port
    }

    fn drain_session(
        port: &mut UnboundedReceiver<SessionCommand>,
    ) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = port.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    #[test]
    fn test_scheduler_spreads_blocks_over_equal_peers() {
        let mut fixture = fixture(4);
        // 4 pieces x 2 blocks = 8 blocks over 4 identical seeds
        let mut ports = Vec::new();
        for port in 1..=4 {
            ports.push(add_seed_peer(&mut fixture.torrent, addr(port)));
        }

        fixture.torrent.process_outgoing_requests(Instant::now());

        let mut total = 0;
        for port in &mut ports {
            let requests = drain_session(port)
                .into_iter()
                .filter(|cmd| matches!(cmd, SessionCommand::SendRequest(_)))
                .count();
            // the random draw without replacement must reach every peer
            assert!(requests > 0, "a peer was starved");
            total += requests;
        }
        assert_eq!(total, 8);
        assert_eq!(fixture.torrent.outgoing.len(), 8);
    }

    #[test]
    fn test_scheduler_respects_per_peer_quota() {
        let mut fixture = fixture(4);
        fixture.torrent.peer_conf.max_concurrent_piece_requests = 3;
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));

        fixture.torrent.process_outgoing_requests(Instant::now());

        let requests = drain_session(&mut port)
            .into_iter()
            .filter(|cmd| matches!(cmd, SessionCommand::SendRequest(_)))
            .count();
        assert_eq!(requests, 3);
        assert_eq!(fixture.torrent.outgoing.count_for_peer(&addr(1)), 3);
    }

    #[test]
    fn test_no_requests_to_choking_or_uninterested_peers() {
        let mut fixture = fixture(2);
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));
        {
            let peer = fixture.torrent.peers.get_mut(&addr(1)).unwrap();
            peer.is_choking_us = true;
        }

        fixture.torrent.process_outgoing_requests(Instant::now());
        assert!(drain_session(&mut port).is_empty());
        assert_eq!(fixture.torrent.outgoing.len(), 0);
    }

    #[test]
    fn test_request_timeout_cancels_on_wire() {
        let mut fixture = fixture(1);
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));

        let now = Instant::now();
        fixture.torrent.process_outgoing_requests(now);
        let sent = drain_session(&mut port).len();
        assert_eq!(sent, 2);

        // both requests age past the timeout
        let later = now + fixture.torrent.peer_conf.piece_request_timeout;
        fixture.torrent.expire_requests(later);
        fixture.torrent.outgoing.sweep_cancelled();

        let cancels: Vec<_> = drain_session(&mut port)
            .into_iter()
            .filter(|cmd| matches!(cmd, SessionCommand::CancelRequest(_)))
            .collect();
        assert_eq!(cancels.len(), 2);
        assert_eq!(fixture.torrent.outgoing.len(), 0);
        // the blocks are schedulable again
        assert_eq!(
            fixture.torrent.pieces[0].missing_unrequested_blocks().len(),
            2
        );
    }

    #[test]
    fn test_choke_cancels_requests_and_notifies_peer() {
        let mut fixture = fixture(2);
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));
        fixture.torrent.process_outgoing_requests(Instant::now());
        let sent = drain_session(&mut port).len();
        assert_eq!(sent, 4);

        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::ChokedUs,
        });

        let cancels = drain_session(&mut port)
            .into_iter()
            .filter(|cmd| matches!(cmd, SessionCommand::CancelRequest(_)))
            .count();
        assert_eq!(cancels, 4);
        assert!(fixture.torrent.peers[&addr(1)].is_choking_us);
        assert_eq!(fixture.torrent.outgoing.len(), 0);
        // a repeated cancel of the same key is a noop
        assert_eq!(
            fixture.torrent.outgoing.cancel((addr(1), 0, 0)),
            CancelOutcome::Noop
        );
    }

    #[test]
    fn test_block_receipt_cancels_endgame_duplicates() {
        let mut fixture = fixture(1);
        let mut first = add_seed_peer(&mut fixture.torrent, addr(1));
        let mut second = add_seed_peer(&mut fixture.torrent, addr(2));

        // both peers hold requests for both blocks (endgame)
        let now = Instant::now();
        fixture.torrent.process_outgoing_requests(now);
        // after the first pass every block is requested once, so a second
        // pass fans out duplicates
        fixture.torrent.process_outgoing_requests(now);
        drain_session(&mut first);
        drain_session(&mut second);

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::BlockReceived {
                block,
                data: vec![0; BLOCK_LEN as usize],
            },
        });

        // the losing peer gets exactly one cancel for that block
        let cancels: Vec<_> = drain_session(&mut second)
            .into_iter()
            .filter_map(|cmd| match cmd {
                SessionCommand::CancelRequest(cancelled) => Some(cancelled),
                _ => None,
            })
            .collect();
        assert_eq!(cancels, vec![block]);

        // and the block was queued for writing
        assert_eq!(
            fixture
                .torrent
                .queued_writes
                .load(Ordering::Acquire),
            1
        );
        let piece_block =
            fixture.torrent.pieces[0].block_at_offset(0).unwrap();
        assert!(piece_block.is_downloaded);
        assert!(!piece_block.is_requested());
    }

    #[test]
    fn test_incoming_requests_served_only_for_verified_pieces() {
        let mut fixture = fixture(2);
        let _port = add_seed_peer(&mut fixture.torrent, addr(1));
        // piece 0 is verified, piece 1 is not
        fixture.torrent.pieces[0].is_verified = true;

        fixture.torrent.on_piece_block_requested(
            addr(1),
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
        );
        fixture.torrent.on_piece_block_requested(
            addr(1),
            BlockInfo {
                piece_index: 1,
                offset: 0,
                len: BLOCK_LEN,
            },
        );

        fixture.torrent.process_incoming_requests();

        // exactly one disk read, for the verified piece
        let mut reads = Vec::new();
        while let Ok(cmd) = fixture.disk_port.try_recv() {
            if let DiskCommand::ReadBlock { block, .. } = cmd {
                reads.push(block);
            }
        }
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].piece_index, 0);
        assert_eq!(fixture.torrent.pending_uploads.len(), 1);
    }

    #[test]
    fn test_cancelled_incoming_request_is_not_served() {
        let mut fixture = fixture(1);
        let _port = add_seed_peer(&mut fixture.torrent, addr(1));
        fixture.torrent.pieces[0].is_verified = true;

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        fixture.torrent.on_piece_block_requested(addr(1), block);
        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::CancelReceived(block),
        });
        fixture.torrent.process_incoming_requests();

        assert!(fixture.disk_port.try_recv().is_err());
        assert!(fixture.torrent.pending_uploads.is_empty());
    }

    #[test]
    fn test_bytes_left_tracks_unverified_piece_sizes() {
        let mut fixture = fixture(2);
        let piece_len = fixture.torrent.pieces[0].len as u64;
        assert_eq!(fixture.torrent.bytes_left, 2 * piece_len);

        // simulate the full download of piece 0
        for offset in &[0, BLOCK_LEN] {
            let piece = &mut fixture.torrent.pieces[0];
            let block = piece.block_at_offset(*offset).unwrap();
            block.mark_downloaded();
            block.mark_written();
        }
        fixture.torrent.pieces[0].is_verifying = true;
        fixture.torrent.on_piece_verified(0, true);

        assert_eq!(fixture.torrent.bytes_left, piece_len);
        assert!(fixture.torrent.own_pieces[0]);
        assert!(!fixture.torrent.is_completed);
    }

    #[test]
    fn test_completion_turns_torrent_into_seed() {
        let mut fixture = fixture(2);
        for piece_index in 0..2 {
            for offset in &[0, BLOCK_LEN] {
                let piece = &mut fixture.torrent.pieces[piece_index];
                let block = piece.block_at_offset(*offset).unwrap();
                block.mark_downloaded();
                block.mark_written();
            }
            fixture.torrent.pieces[piece_index].is_verifying = true;
            fixture.torrent.on_piece_verified(piece_index, true);
        }

        assert!(fixture.torrent.is_completed);
        assert_eq!(fixture.torrent.state, TorrentState::Seeding);
        assert_eq!(fixture.torrent.bytes_left, 0);
    }

    #[test]
    fn test_failed_verification_resets_piece_for_refetch() {
        let mut fixture = fixture(1);
        for offset in &[0, BLOCK_LEN] {
            let piece = &mut fixture.torrent.pieces[0];
            let block = piece.block_at_offset(*offset).unwrap();
            block.mark_downloaded();
            block.mark_written();
        }
        fixture.torrent.pieces[0].is_verifying = true;
        fixture.torrent.on_piece_verified(0, false);

        assert!(!fixture.torrent.pieces[0].is_verified);
        assert_eq!(
            fixture.torrent.pieces[0].missing_unrequested_blocks().len(),
            2
        );
        assert_eq!(fixture.torrent.bytes_left, 2 * BLOCK_LEN as u64);
    }

    #[test]
    fn test_failed_write_marks_block_undownloaded() {
        let mut fixture = fixture(1);
        fixture.torrent.pieces[0]
            .block_at_offset(0)
            .unwrap()
            .mark_downloaded();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        fixture.torrent.on_block_written(block, false);

        let piece_block = fixture.torrent.pieces[0].block_at_offset(0).unwrap();
        assert!(!piece_block.is_downloaded);
        assert!(!piece_block.has_written_to_disk);
    }

    #[test]
    fn test_choke_policy_follows_interest() {
        let mut fixture = fixture(1);
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));
        {
            let peer = fixture.torrent.peers.get_mut(&addr(1)).unwrap();
            peer.we_interested = false;
            peer.is_interested_in_us = true;
        }

        fixture.torrent.update_peers();
        let cmds = drain_session(&mut port);
        // interested remote gets unchoked; their pieces interest us too
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, SessionCommand::Unchoke)));
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, SessionCommand::Interested)));

        // once the remote loses interest it is choked again
        {
            let peer = fixture.torrent.peers.get_mut(&addr(1)).unwrap();
            peer.is_interested_in_us = false;
        }
        fixture.torrent.update_peers();
        let cmds = drain_session(&mut port);
        assert!(cmds.iter().any(|cmd| matches!(cmd, SessionCommand::Choke)));
    }

    #[test]
    fn test_bitfield_then_have_completes_peer() {
        let mut fixture = fixture(10);
        let (cmd_chan, mut port) = mpsc::unbounded_channel();
        let mut peer = Peer::new(addr(1));
        peer.cmd_chan = Some(cmd_chan);
        peer.is_connected = true;
        peer.is_handshaked = true;
        fixture.torrent.peers.insert(addr(1), peer);
        fixture.torrent.availability.peer_connected();

        // the peer announces pieces 0..=8 of 10
        let mut pieces = Bitfield::repeat(false, 10);
        for index in 0..9 {
            pieces.set(index, true);
        }
        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::BitfieldReceived(pieces),
        });
        assert_eq!(fixture.torrent.availability.count(0), 1);
        assert_eq!(fixture.torrent.availability.count(9), 0);
        assert!(!fixture.torrent.peers[&addr(1)].is_completed());
        // we have nothing, so the peer's pieces interest us right away
        let cmds = drain_session(&mut port);
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, SessionCommand::Interested)));
        assert!(fixture.torrent.peers[&addr(1)].we_interested);

        // the last piece completes the peer
        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::HaveReceived(9),
        });
        assert_eq!(fixture.torrent.availability.count(9), 1);
        assert!(fixture.torrent.peers[&addr(1)].is_completed());
    }

    #[test]
    fn test_upload_slots_cap_unchoked_peers() {
        let mut fixture = fixture(1);
        fixture.torrent.peer_conf.max_upload_connections = 2;
        let mut ports = Vec::new();
        for port in 1..=3 {
            ports.push(add_seed_peer(&mut fixture.torrent, addr(port)));
            fixture
                .torrent
                .peers
                .get_mut(&addr(port))
                .unwrap()
                .is_interested_in_us = true;
        }

        fixture.torrent.update_peers();

        let mut unchoked = 0;
        for port in ports.iter_mut() {
            if drain_session(port)
                .iter()
                .any(|cmd| matches!(cmd, SessionCommand::Unchoke))
            {
                unchoked += 1;
            }
        }
        assert_eq!(unchoked, 2);
    }

    #[test]
    fn test_disconnect_forgets_peer_requests() {
        let mut fixture = fixture(1);
        let mut port = add_seed_peer(&mut fixture.torrent, addr(1));
        fixture.torrent.pieces[0].is_verified = true;
        fixture.torrent.on_piece_block_requested(
            addr(1),
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
        );

        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::Disconnected { was_self: false },
        });

        assert_eq!(fixture.torrent.outgoing.len(), 0);
        assert_eq!(fixture.torrent.incoming.len(), 0);
        assert_eq!(fixture.torrent.availability.total_peers(), 0);
        assert!(!fixture.torrent.peers[&addr(1)].is_connected);
        // no dangling session channel
        assert!(drain_session(&mut port).is_empty());
        assert!(fixture.torrent.peers[&addr(1)].cmd_chan.is_none());
    }

    #[test]
    fn test_self_peer_is_never_reconnected() {
        let mut fixture = fixture(1);
        let _port = add_seed_peer(&mut fixture.torrent, addr(1));
        fixture.torrent.handle_peer_event(PeerEvent {
            addr: addr(1),
            kind: PeerEventKind::Disconnected { was_self: true },
        });

        assert!(fixture.torrent.peers[&addr(1)].is_self);
        fixture.torrent.connect_idle_peers();
        assert!(fixture.torrent.peers[&addr(1)].cmd_chan.is_none());
    }
}
