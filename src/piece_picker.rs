//! Piece selection: which piece to request blocks from next.
//!
//! The torrent keeps a running count of how many connected peers own each
//! piece. A pluggable selector ranks the pieces; the default prefers pieces
//! whose download has already started (to finish them quickly) and breaks
//! ties towards rare pieces, which keeps the swarm healthy.

use std::cmp::Ordering;

use crate::{piece::Piece, Bitfield, PieceIndex};

/// How many connected peers own each piece.
pub(crate) struct PieceAvailability {
    counts: Vec<usize>,
    total_peers: usize,
}

impl PieceAvailability {
    pub fn new(piece_count: usize) -> Self {
        Self {
            counts: vec![0; piece_count],
            total_peers: 0,
        }
    }

    /// Records a connected peer. Peers are counted even before they announce
    /// any pieces, so rarity reflects the whole swarm we see.
    pub fn peer_connected(&mut self) {
        self.total_peers += 1;
    }

    /// Forgets a disconnected peer and the pieces its bitfield claimed.
    pub fn peer_disconnected(&mut self, bitfield: Option<&Bitfield>) {
        debug_assert!(self.total_peers > 0);
        self.total_peers = self.total_peers.saturating_sub(1);
        if let Some(bitfield) = bitfield {
            for index in bitfield.iter().enumerate().filter(|(_, bit)| **bit) {
                self.counts[index.0] -= 1;
            }
        }
    }

    /// Records a peer's full bitfield.
    pub fn register_bitfield(&mut self, bitfield: &Bitfield) {
        debug_assert_eq!(bitfield.len(), self.counts.len());
        for (index, bit) in bitfield.iter().enumerate() {
            if *bit {
                self.counts[index] += 1;
            }
        }
    }

    /// Records a single announced piece (a `Have` message).
    pub fn register_have(&mut self, index: PieceIndex) {
        self.counts[index] += 1;
    }

    pub fn count(&self, index: PieceIndex) -> usize {
        self.counts[index]
    }

    pub fn total_peers(&self) -> usize {
        self.total_peers
    }

    /// The piece's rarity in `[0, 1)`, or `None` when no peer owns it:
    /// such a piece cannot be requested at all.
    pub fn rarity(&self, index: PieceIndex) -> Option<f64> {
        let count = self.counts[index];
        if count == 0 || self.total_peers == 0 {
            None
        } else {
            Some(1.0 - count as f64 / self.total_peers as f64)
        }
    }
}

/// Ranks the pieces still worth requesting, best first.
pub(crate) trait PieceSelector: Send {
    fn select(
        &self,
        pieces: &[Piece],
        availability: &PieceAvailability,
    ) -> Vec<PieceIndex>;
}

/// The default selector: skip pieces that are verified or that no connected
/// peer owns; order the rest by descending
/// `importance = 2 * download_progress + rarity`, ties broken by ascending
/// index.
pub(crate) struct AvailableThenRarestFirst;

impl PieceSelector for AvailableThenRarestFirst {
    fn select(
        &self,
        pieces: &[Piece],
        availability: &PieceAvailability,
    ) -> Vec<PieceIndex> {
        let mut ranked: Vec<(PieceIndex, f64)> = pieces
            .iter()
            .filter(|piece| !piece.is_verified)
            .filter_map(|piece| {
                availability.rarity(piece.index).map(|rarity| {
                    (piece.index, 2.0 * piece.download_progress() + rarity)
                })
            })
            .collect();
        ranked.sort_by(|(a_index, a_importance), (b_index, b_importance)| {
            b_importance
                .partial_cmp(a_importance)
                .unwrap_or(Ordering::Equal)
                .then(a_index.cmp(b_index))
        });
        ranked.into_iter().map(|(index, _)| index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn pieces(count: usize) -> Vec<Piece> {
        (0..count)
            .map(|index| {
                Piece::new(index, index as u64 * BLOCK_LEN as u64, BLOCK_LEN)
            })
            .collect()
    }

    #[test]
    fn test_availability_bookkeeping() {
        let mut availability = PieceAvailability::new(4);
        availability.peer_connected();
        availability.peer_connected();

        let mut first = Bitfield::repeat(false, 4);
        first.set(0, true);
        first.set(1, true);
        availability.register_bitfield(&first);
        availability.register_have(2);

        assert_eq!(availability.count(0), 1);
        assert_eq!(availability.count(2), 1);
        assert_eq!(availability.count(3), 0);
        assert_eq!(availability.total_peers(), 2);

        availability.peer_disconnected(Some(&first));
        assert_eq!(availability.count(0), 0);
        assert_eq!(availability.total_peers(), 1);
    }

    #[test]
    fn test_rarity() {
        let mut availability = PieceAvailability::new(2);
        availability.peer_connected();
        availability.peer_connected();
        availability.register_have(0);

        // half the peers own piece 0
        assert_eq!(availability.rarity(0), Some(0.5));
        // nobody owns piece 1
        assert_eq!(availability.rarity(1), None);
    }

    #[test]
    fn test_selector_skips_verified_and_unowned() {
        let mut pieces = pieces(3);
        pieces[0].is_verified = true;

        let mut availability = PieceAvailability::new(3);
        availability.peer_connected();
        availability.register_have(0);
        availability.register_have(1);
        // piece 2 has no owner

        let order = AvailableThenRarestFirst.select(&pieces, &availability);
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn test_selector_prefers_started_then_rare() {
        let mut pieces = pieces(3);
        // piece 2 is half downloaded
        pieces[2].blocks[0].mark_downloaded();

        let mut availability = PieceAvailability::new(3);
        for _ in 0..4 {
            availability.peer_connected();
        }
        // piece 0 is common, pieces 1 and 2 are rare
        for _ in 0..4 {
            availability.register_have(0);
        }
        availability.register_have(1);
        availability.register_have(2);

        let order = AvailableThenRarestFirst.select(&pieces, &availability);
        // piece 2: importance 2.0 * 1.0 + 0.75 (its single block is the whole
        // piece) > piece 1: 0.75 > piece 0: 0.0
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_selector_breaks_ties_by_index() {
        let pieces = pieces(3);
        let mut availability = PieceAvailability::new(3);
        availability.peer_connected();
        for index in 0..3 {
            availability.register_have(index);
        }

        let order = AvailableThenRarestFirst.select(&pieces, &availability);
        assert_eq!(order, vec![0, 1, 2]);
    }
}
