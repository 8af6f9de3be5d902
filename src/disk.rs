//! The disk backend: a task that owns the torrents' file handles and
//! performs block writes, block reads and piece verification off the async
//! executor.
//!
//! Torrents talk to it through a cheap clonable [`DiskHandle`] and receive
//! completions on a per-torrent alert channel. Writes are acknowledged
//! explicitly: a block only counts as persisted once its
//! [`TorrentAlert::BlockWritten`] arrives with a positive result.

mod io;

use std::{
    io::Error as IoError,
    sync::{atomic::AtomicUsize, Arc},
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    error::*, storage_info::StorageInfo, BlockInfo, PieceIndex, TorrentId,
};

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The commands the disk task accepts.
pub(crate) enum Command {
    /// Sets up a torrent's file system structure and file handles. The
    /// outcome arrives as [`TorrentAlert::Allocated`] on the given channel.
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        /// The concatenation of the torrent's expected piece hashes.
        piece_hashes: Vec<u8>,
        /// Whether to size the files fully up front rather than growing them
        /// on first write.
        allocate_full_file_sizes: bool,
        /// The disk-side queue depth counters, shared with the torrent's
        /// rate limiter chains: writes and reads respectively.
        queued_writes: Arc<AtomicUsize>,
        queued_reads: Arc<AtomicUsize>,
        alert_chan: TorrentAlertSender,
    },
    /// Persists a downloaded block.
    WriteBlock {
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads back a block to serve an upload.
    ReadBlock { id: TorrentId, block: BlockInfo },
    /// Reads the piece's bytes and compares their SHA-1 digest against the
    /// expected piece hash.
    VerifyPiece { id: TorrentId, piece_index: PieceIndex },
    /// Drops a torrent's file handles.
    RemoveTorrent { id: TorrentId },
    /// Shuts the disk task down.
    Shutdown,
}

/// The completions the disk task reports to a torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// The torrent's files were created (or opened, when resuming).
    Allocated(Result<(), IoError>),
    /// A block write finished. On failure the torrent reverts the block to
    /// undownloaded so it is fetched again.
    BlockWritten {
        block: BlockInfo,
        result: Result<(), IoError>,
    },
    /// A block read finished.
    BlockRead {
        block: BlockInfo,
        result: Result<Vec<u8>, IoError>,
    },
    /// A piece verification finished. A read failure counts as a mismatch.
    PieceVerified {
        piece_index: PieceIndex,
        is_valid: bool,
    },
}

/// A cheap handle through which torrents drive the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(pub(crate) CommandSender);

impl DiskHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        allocate_full_file_sizes: bool,
        queued_writes: Arc<AtomicUsize>,
        queued_reads: Arc<AtomicUsize>,
        alert_chan: TorrentAlertSender,
    ) -> Result<()> {
        self.0
            .send(Command::NewTorrent {
                id,
                storage,
                piece_hashes,
                allocate_full_file_sizes,
                queued_writes,
                queued_reads,
                alert_chan,
            })
            .map_err(Error::from)
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0
            .send(Command::WriteBlock { id, block, data })
            .map_err(Error::from)
    }

    pub fn read_block(&self, id: TorrentId, block: BlockInfo) -> Result<()> {
        self.0
            .send(Command::ReadBlock { id, block })
            .map_err(Error::from)
    }

    pub fn verify_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
    ) -> Result<()> {
        self.0
            .send(Command::VerifyPiece { id, piece_index })
            .map_err(Error::from)
    }

    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.0.send(Command::RemoveTorrent { id }).map_err(Error::from)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// Spawns the disk task, returning the handle through which it is driven.
pub(crate) fn spawn(
    conf: crate::conf::DiskConf,
) -> (DiskHandle, tokio::task::JoinHandle<()>) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = io::Disk::new(conf, cmd_port);
    let join_handle = tokio::spawn(async move { disk.start().await });
    (DiskHandle(cmd_chan), join_handle)
}
