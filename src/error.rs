//! The error types returned by the engine and its parts.

use std::{fmt, io};

use crate::{PieceIndex, TorrentId};

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the engine's public operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo input could not be deserialized.
    Bencode(serde_bencode::Error),
    /// The metainfo was deserialized but violates its own contract (e.g. its
    /// file sizes don't add up to the torrent size).
    InvalidMetainfo,
    /// A caller supplied a piece index not in `0..piece_count`.
    InvalidPieceIndex(PieceIndex),
    /// A caller referred to a torrent the engine doesn't know about.
    InvalidTorrentId(TorrentId),
    /// The torrent was asked to start while already running, or asked to
    /// recheck integrity while running.
    TorrentAlreadyRunning,
    /// An operation requiring a running torrent was invoked on a stopped one.
    TorrentNotRunning,
    /// A torrent with the same info hash already exists in the engine.
    TorrentAlreadyExists,
    /// The engine (or one of its long lived tasks) has shut down and can no
    /// longer accept commands. Carries no detail: the channel counterparty is
    /// gone.
    EngineShutDown,
    /// An IO failure outside the peer protocol (disk, listener socket).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "metainfo parse error: {}", e),
            Self::InvalidMetainfo => write!(f, "invalid metainfo"),
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index {}", index)
            }
            Self::InvalidTorrentId(id) => {
                write!(f, "invalid torrent id {}", id)
            }
            Self::TorrentAlreadyRunning => {
                write!(f, "torrent is already running")
            }
            Self::TorrentNotRunning => write!(f, "torrent is not running"),
            Self::TorrentAlreadyExists => {
                write!(f, "torrent already exists")
            }
            Self::EngineShutDown => write!(f, "engine has shut down"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// Channel send failures all mean the same thing: the receiving task is gone,
// which only happens on shutdown.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::EngineShutDown
    }
}

/// The error type of a single peer session. A session error tears down that
/// connection only; the torrent keeps running.
#[derive(Debug)]
pub(crate) enum PeerError {
    /// The connection's socket failed.
    Io(io::Error),
    /// The handshake's protocol string was not "BitTorrent protocol".
    InvalidProtocolString,
    /// The handshake advertised an info hash we don't serve.
    InvalidInfoHash,
    /// The remote's peer id equals our own: we connected to ourselves.
    SelfConnection,
    /// A frame exceeded the 128 KiB packet bound or its length prefix
    /// contradicts its message id.
    InvalidFrame,
    /// An unknown message id was received.
    UnknownMessageId(u8),
    /// A bitfield message arrived after the first content-bearing message.
    BitfieldNotFirst,
    /// A message referred to a piece or block that cannot exist in this
    /// torrent.
    InvalidMessage(&'static str),
    /// The remote went silent past the inactivity timeout, or never completed
    /// the handshake in time.
    Timeout,
    /// The torrent asked this session to shut down.
    Shutdown,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::InvalidProtocolString => {
                write!(f, "invalid protocol string in handshake")
            }
            Self::InvalidInfoHash => {
                write!(f, "handshake info hash not served")
            }
            Self::SelfConnection => write!(f, "connected to ourselves"),
            Self::InvalidFrame => write!(f, "malformed wire frame"),
            Self::UnknownMessageId(id) => {
                write!(f, "unknown message id {}", id)
            }
            Self::BitfieldNotFirst => {
                write!(f, "bitfield not the first message after handshake")
            }
            Self::InvalidMessage(what) => {
                write!(f, "protocol violation: {}", what)
            }
            Self::Timeout => write!(f, "peer timed out"),
            Self::Shutdown => write!(f, "session shut down"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub(crate) type PeerResult<T> = Result<T, PeerError>;

/// Why an outbound connection attempt to a peer failed. Surfaced via the
/// alert channel so the caller can distinguish a dead peer from a local
/// network problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionFailedReason {
    Unknown,
    Aborted,
    TimedOut,
    NameResolve,
    HostDown,
    HostUnreachable,
    Refused,
    NoInternetConnection,
    NotSupported,
    AccessDenied,
}

impl From<&io::Error> for ConnectionFailedReason {
    fn from(e: &io::Error) -> Self {
        use nix::errno::Errno;
        // the stable ErrorKind set doesn't cover the host/network kinds, so
        // fall back to the raw OS codes for those
        if let Some(code) = e.raw_os_error() {
            if code == Errno::EHOSTDOWN as i32 {
                return Self::HostDown;
            }
            if code == Errno::EHOSTUNREACH as i32 {
                return Self::HostUnreachable;
            }
            if code == Errno::ENETDOWN as i32 || code == Errno::ENETUNREACH as i32
            {
                return Self::NoInternetConnection;
            }
        }
        match e.kind() {
            io::ErrorKind::ConnectionAborted => Self::Aborted,
            io::ErrorKind::ConnectionReset => Self::Aborted,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            io::ErrorKind::AddrNotAvailable => Self::NameResolve,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_reason_from_io_error() {
        let refused =
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            ConnectionFailedReason::from(&refused),
            ConnectionFailedReason::Refused
        );

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(
            ConnectionFailedReason::from(&timed_out),
            ConnectionFailedReason::TimedOut
        );

        let unreachable = io::Error::from_raw_os_error(
            nix::errno::Errno::EHOSTUNREACH as i32,
        );
        assert_eq!(
            ConnectionFailedReason::from(&unreachable),
            ConnectionFailedReason::HostUnreachable
        );

        let other = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(
            ConnectionFailedReason::from(&other),
            ConnectionFailedReason::Unknown
        );
    }
}
