// needed by the `select!` macros reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod alert;
mod bitfield;
pub mod conf;
mod counter;
mod disk;
pub mod engine;
pub mod error;
mod limit;
mod listener;
mod lsd;
pub mod metainfo;
mod peer;
mod piece;
mod piece_picker;
mod request;
mod storage_info;
mod torrent;
pub mod tracker;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;
pub use torrent::{PieceState, TorrentHandle, TorrentState};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The 20 byte SHA-1 hash of the torrent's bencoded info dictionary. It is
/// what identifies a torrent to trackers and to other peers.
pub type InfoHash = Sha1Hash;

/// The prefix of peer ids generated by this client, in the Azureus style
/// (two character client code and four digit version).
const CLIENT_ID_PREFIX: &[u8; 8] = b"-sw0100-";

/// Generates a new peer id for a torrent: the client prefix followed by 12
/// random bytes.
pub(crate) fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// Returns the canonical 40 character hexadecimal rendering of an info hash,
/// as used by LSD announces and magnet links.
pub fn info_hash_hex(hash: &InfoHash) -> String {
    hex::encode(hash)
}

/// Returns the URL-encoded rendering of an info hash, as used in tracker
/// announce URLs.
pub fn info_hash_url_encoded(hash: &InfoHash) -> String {
    percent_encode(hash, NON_ALPHANUMERIC).to_string()
}

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The size of the chunks pieces are transferred in: 16 KiB, the block size
/// every mainstream client requests. A piece whose length is not a multiple
/// of it ends in one shorter block.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// Identifies one block of the torrent: the piece it belongs to, where in
/// that piece it starts and how long it is. This is exactly the triple the
/// request, piece and cancel wire messages carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    pub piece_index: PieceIndex,
    /// The block's first byte's offset within its piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl BlockInfo {
    /// The info of the `index`th block of a piece `piece_len` bytes long.
    pub(crate) fn new(
        piece_index: PieceIndex,
        index: usize,
        piece_len: u32,
    ) -> Self {
        Self {
            piece_index,
            offset: index as u32 * BLOCK_LEN,
            len: block_len(piece_len, index),
        }
    }

    /// The block's position in its piece's block list.
    pub fn index_in_piece(&self) -> usize {
        // a piece's tail block may fall short of the canonical length
        debug_assert!(self.len > 0 && self.len <= BLOCK_LEN);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// The length of the `index`th block of a piece `piece_len` bytes long:
/// [`BLOCK_LEN`] everywhere except the tail block, which covers whatever
/// remains of the piece.
///
/// # Panics
///
/// The index must address a block inside the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

/// The number of blocks a piece of `piece_len` bytes splits into: the whole
/// blocks, plus one tail block if a remainder is left over.
pub(crate) fn block_count(piece_len: u32) -> usize {
    let whole = (piece_len / BLOCK_LEN) as usize;
    whole + (piece_len % BLOCK_LEN != 0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // a piece of three whole blocks
    const EVEN_PIECE_LEN: u32 = 3 * BLOCK_LEN;

    // a piece of one whole block and a 6000 byte tail
    const TAIL_LEN: u32 = 6000;
    const TAILED_PIECE_LEN: u32 = BLOCK_LEN + TAIL_LEN;

    #[test]
    fn test_even_piece_has_only_whole_blocks() {
        assert_eq!(block_count(EVEN_PIECE_LEN), 3);
        for index in 0..3 {
            assert_eq!(block_len(EVEN_PIECE_LEN, index), BLOCK_LEN);
        }
    }

    #[test]
    fn test_uneven_piece_ends_in_tail_block() {
        assert_eq!(block_count(TAILED_PIECE_LEN), 2);
        assert_eq!(block_len(TAILED_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(TAILED_PIECE_LEN, 1), TAIL_LEN);
    }

    #[test]
    #[should_panic]
    fn test_block_beyond_piece_end_panics() {
        block_len(EVEN_PIECE_LEN, 3);
    }

    #[test]
    fn test_block_info_describes_tail_block() {
        let block = BlockInfo::new(7, 1, TAILED_PIECE_LEN);
        assert_eq!(block.piece_index, 7);
        assert_eq!(block.offset, BLOCK_LEN);
        assert_eq!(block.len, TAIL_LEN);
        assert_eq!(block.index_in_piece(), 1);
    }

    #[test]
    fn test_generated_peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
    }

    #[test]
    fn test_info_hash_renderings() {
        let mut hash = [0u8; 20];
        hash[0] = 0x01;
        hash[19] = 0xff;
        let hex = info_hash_hex(&hash);
        assert_eq!(hex.len(), 40);
        assert!(hex.starts_with("01"));
        assert!(hex.ends_with("ff"));

        let url = info_hash_url_encoded(&hash);
        assert!(url.starts_with("%01"));
        assert!(url.ends_with("%FF"));
    }
}
