//! The download state of a torrent's pieces and their blocks.
//!
//! A piece tracks, per block, which peers a request is outstanding to,
//! whether the block's bytes have arrived, and whether they reached disk. The
//! piece itself tracks verification. The torrent task is the only writer of
//! this state; peer sessions report what happened on the wire and the torrent
//! mutates the model accordingly.

use std::{net::SocketAddr, time::Instant};

use crate::{block_count, BlockInfo, PieceIndex, BLOCK_LEN};

/// A fixed size chunk of a piece, the unit of request/piece messages.
#[derive(Debug)]
pub(crate) struct Block {
    /// The block's index within its piece.
    pub index: usize,
    /// The block's length: [`BLOCK_LEN`] for all but possibly the last block
    /// of a piece.
    pub len: u32,
    /// The block's bytes have arrived from some peer.
    pub is_downloaded: bool,
    /// The block's bytes were acknowledged by the disk backend.
    pub has_written_to_disk: bool,
    /// The peers an outgoing request for this block is outstanding to. More
    /// than one entry only occurs during endgame. At most one entry per peer.
    pub requested_to: Vec<SocketAddr>,
    /// When the most recent request for this block was made.
    pub last_request_time: Option<Instant>,
}

impl Block {
    fn new(index: usize, len: u32) -> Self {
        Self {
            index,
            len,
            is_downloaded: false,
            has_written_to_disk: false,
            requested_to: Vec::new(),
            last_request_time: None,
        }
    }

    /// A block counts as requested while at least one peer owes us its bytes.
    pub fn is_requested(&self) -> bool {
        !self.requested_to.is_empty()
    }

    /// Records an outstanding request to the peer. Returns false if one is
    /// already outstanding to that peer.
    pub fn register_request(&mut self, peer: SocketAddr, now: Instant) -> bool {
        if self.requested_to.contains(&peer) {
            return false;
        }
        self.requested_to.push(peer);
        self.last_request_time = Some(now);
        true
    }

    /// Forgets the outstanding request to the peer, if any.
    pub fn clear_request(&mut self, peer: &SocketAddr) {
        self.requested_to.retain(|requested| requested != peer);
    }

    /// Marks the block's bytes as arrived; all outstanding requests for it
    /// are forgotten (during endgame the other peers still get wire cancels,
    /// which the torrent emits from the request registry).
    pub fn mark_downloaded(&mut self) {
        self.is_downloaded = true;
        self.has_written_to_disk = false;
        self.requested_to.clear();
        self.last_request_time = None;
    }

    /// Marks the block's bytes as persisted.
    pub fn mark_written(&mut self) {
        debug_assert!(self.is_downloaded);
        self.has_written_to_disk = true;
    }

    /// Reverts the block to undownloaded, e.g. after a failed disk write or
    /// a failed piece hash. Losing the download also loses the persistence.
    pub fn mark_undownloaded(&mut self) {
        self.is_downloaded = false;
        self.has_written_to_disk = false;
    }
}

/// A piece of the torrent and the state of its download.
#[derive(Debug)]
pub(crate) struct Piece {
    /// The piece's index in the torrent.
    pub index: PieceIndex,
    /// The piece's first byte's offset in the torrent.
    pub torrent_offset: u64,
    /// The piece's length in bytes.
    pub len: u32,
    /// The piece's blocks.
    pub blocks: Vec<Block>,
    /// The piece's contents on disk hash to the expected value.
    pub is_verified: bool,
    /// A verification of this piece is in flight at the disk task.
    pub is_verifying: bool,
}

impl Piece {
    pub fn new(index: PieceIndex, torrent_offset: u64, len: u32) -> Self {
        let blocks = (0..block_count(len))
            .map(|block_index| {
                let info = BlockInfo::new(index, block_index, len);
                Block::new(block_index, info.len)
            })
            .collect();
        Self {
            index,
            torrent_offset,
            len,
            blocks,
            is_verified: false,
            is_verifying: false,
        }
    }

    /// Returns the block containing the given byte offset within the piece,
    /// if the offset is block aligned and within the piece.
    pub fn block_at_offset(&mut self, offset: u32) -> Option<&mut Block> {
        if offset % BLOCK_LEN != 0 {
            return None;
        }
        self.blocks.get_mut((offset / BLOCK_LEN) as usize)
    }

    /// The downloaded fraction of the piece's blocks, in `[0, 1]`.
    pub fn download_progress(&self) -> f64 {
        let downloaded =
            self.blocks.iter().filter(|block| block.is_downloaded).count();
        downloaded as f64 / self.blocks.len() as f64
    }

    /// True only when every block has both arrived and reached disk; only
    /// then may verification start.
    pub fn has_downloaded_all_blocks(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| block.is_downloaded && block.has_written_to_disk)
    }

    /// Records the verification outcome. A failed verification of a fully
    /// downloaded piece reverts every block to undownloaded so the piece is
    /// fetched again.
    pub fn set_verified(&mut self, is_verified: bool) {
        self.is_verifying = false;
        if is_verified {
            self.is_verified = true;
        } else {
            self.is_verified = false;
            if self.blocks.iter().all(|block| block.is_downloaded) {
                for block in &mut self.blocks {
                    block.mark_undownloaded();
                }
            }
        }
    }

    /// The block infos of blocks that are neither downloaded nor requested,
    /// i.e. what the scheduler may hand out next.
    pub fn missing_unrequested_blocks(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .filter(|block| !block.is_downloaded && !block.is_requested())
            .map(|block| BlockInfo::new(self.index, block.index, self.len))
            .collect()
    }
}
