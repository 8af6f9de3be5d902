//! The typed notifications the engine emits to the library user.
//!
//! Alerts are delivered on a single channel handed out when the engine is
//! created; dropping the receiver simply discards further alerts. Listener
//! lifetime is thus tied to the engine: no callback lists to leak.

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    error::ConnectionFailedReason, torrent::TorrentState, InfoHash, PeerId,
    PieceIndex, TorrentId,
};

pub type AlertReceiver = UnboundedReceiver<Alert>;
pub(crate) type AlertSender = UnboundedSender<Alert>;

/// An engine notification.
#[derive(Debug)]
#[non_exhaustive]
pub enum Alert {
    /// A torrent was created and registered in the engine.
    TorrentAdded { id: TorrentId, info_hash: InfoHash },
    /// A torrent's lifecycle state changed.
    StateChanged { id: TorrentId, state: TorrentState },
    /// The startup (or explicitly requested) integrity pass finished.
    IntegrityCheckCompleted {
        id: TorrentId,
        /// How many pieces passed verification.
        verified_count: usize,
        piece_count: usize,
    },
    /// A downloaded piece passed verification.
    PieceVerified { id: TorrentId, piece_index: PieceIndex },
    /// Every piece of the torrent is verified.
    Completed { id: TorrentId },
    /// A TCP connection to a peer was established.
    PeerConnected { id: TorrentId, addr: SocketAddr },
    /// A peer connection ended.
    PeerDisconnected { id: TorrentId, addr: SocketAddr },
    /// A peer completed the protocol handshake.
    PeerHandshaked {
        id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// A peer announced its full piece availability.
    BitfieldReceived { id: TorrentId, addr: SocketAddr },
    /// A peer announced one new piece.
    HavePieceReceived {
        id: TorrentId,
        addr: SocketAddr,
        piece_index: PieceIndex,
    },
    /// An outbound connection attempt failed.
    ConnectionFailed {
        id: TorrentId,
        addr: SocketAddr,
        reason: ConnectionFailedReason,
    },
    /// The peer listener is accepting connections on this port. Reported
    /// once at engine startup, after an OS-chosen port is known.
    ListenerStarted { port: u16 },
    /// A torrent ran into an error it could not recover from and stopped.
    TorrentError { id: TorrentId, error: String },
}
