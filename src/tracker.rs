//! The tracker collaborator contract.
//!
//! Announcing over HTTP or UDP is not this crate's business: the engine
//! consumes peer lists through this interface and reports the lifecycle
//! events trackers care about. An implementation typically wraps one tier of
//! announce URLs and its own retry and interval policy.

use std::{net::SocketAddr, time::Duration};

use futures::future::BoxFuture;

use crate::PeerId;

/// A peer endpoint learned from a tracker, local discovery or the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// The peer's id, when the source knows it (trackers only report it in
    /// non-compact responses).
    pub peer_id: Option<PeerId>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }
}

/// The lifecycle events reported to trackers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A periodic announce with no particular event.
    None,
    /// The torrent session started.
    Started,
    /// The torrent session stopped.
    Stopped,
    /// The download completed.
    Completed,
}

/// What a tracker responds to an announce with.
#[derive(Clone, Debug, Default)]
pub struct AnnounceResponse {
    /// How long the tracker wants us to wait before the next plain announce.
    pub interval: Option<Duration>,
    /// The swarm members the tracker chose to share.
    pub peer_infos: Vec<PeerInfo>,
}

/// One group ("tier") of trackers a torrent announces to.
///
/// The futures are boxed so implementations live behind a trait object; they
/// must be `'static` as announces are driven to completion even if the
/// torrent stops meanwhile.
pub trait TrackerGroup: Send + Sync {
    /// Announces the event to the group. The implementation handles retries
    /// and fallback across its members.
    fn announce(
        &self,
        event: AnnounceEvent,
    ) -> BoxFuture<'static, Result<AnnounceResponse, String>>;

    /// Periodic maintenance, invoked on the torrent's update tick. The
    /// implementation decides whether a re-announce is actually due.
    fn update(&self) -> BoxFuture<'static, ()>;
}
