//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub peer: PeerConf,
    pub disk: DiskConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
            peer: PeerConf::default(),
            disk: DiskConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The port on which inbound peer connections are accepted. 0 lets the
    /// OS pick a free port; the actual port is reported via an alert once the
    /// listener is up.
    pub listen_port: u16,
    /// The global cap on the TCP download rate, in bytes per second, applied
    /// across all torrents. 0 turns the cap off.
    pub download_rate_limit: u64,
    /// The global cap on the TCP upload rate, in bytes per second, applied
    /// across all torrents. 0 turns the cap off.
    pub upload_rate_limit: u64,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            listen_port: 0,
            download_rate_limit: 0,
            upload_rate_limit: 0,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,
    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,
    /// Whether to create files at their full size before the download starts
    /// rather than growing them on first write.
    pub allocate_full_file_sizes: bool,
    /// Per-torrent cap on the download rate, in bytes per second, measured
    /// against the session's running average. 0 turns the cap off.
    pub download_bandwidth_limit: u64,
    /// Per-torrent cap on the upload rate, in bytes per second, measured
    /// against the session's running average. 0 turns the cap off.
    pub upload_bandwidth_limit: u64,
    /// When set, the bitfield sent to peers is all zeros regardless of what
    /// we have (stealth seeding); peers learn of pieces one `Have` at a
    /// time.
    pub mask_sent_bitfield: bool,
    /// How often the torrent runs its update tick (driving peer updates,
    /// request scheduling and timeout sweeps).
    pub update_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            allocate_full_file_sizes: false,
            download_bandwidth_limit: 0,
            upload_bandwidth_limit: 0,
            mask_sent_bitfield: false,
            update_interval: Duration::from_millis(500),
        }
    }
}

/// Configuration of the peer protocol, applied to every connection.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// If the remote hasn't completed the handshake within this duration
    /// after we sent ours, the connection is closed.
    pub handshake_timeout: Duration,
    /// If nothing is received on a connection within this duration, the
    /// connection is closed.
    pub inactive_timeout: Duration,
    /// An outgoing block request not answered within this duration is
    /// cancelled and handed back to the scheduler.
    pub piece_request_timeout: Duration,
    /// A keep-alive frame is sent if nothing else was sent within this
    /// duration. The standard prescribes 2 minutes.
    pub keep_alive_interval: Duration,
    /// The max number of block requests kept in flight to a single peer.
    pub max_concurrent_piece_requests: usize,
    /// The max number of outbound connections opened to download from.
    pub max_download_connections: usize,
    /// The max number of peers unchoked (served uploads) at once.
    pub max_upload_connections: usize,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            inactive_timeout: Duration::from_secs(4 * 60),
            piece_request_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(2 * 60),
            max_concurrent_piece_requests: 70,
            max_download_connections: 50,
            max_upload_connections: 8,
        }
    }
}

/// Configuration of the disk backend.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// The max number of block writes that may be queued towards the disk
    /// task before the download scheduler stops admitting new requests.
    pub max_queued_writes: usize,
    /// The max number of blocking IO operations in flight at once.
    pub max_concurrent_writes: usize,
    /// The number of blocks kept in the read cache that serves uploads.
    pub read_cache_capacity: usize,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            max_queued_writes: 128,
            max_concurrent_writes: 4,
            read_cache_capacity: 256,
        }
    }
}
