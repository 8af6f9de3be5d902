//! Helpers for moving piece availability bitfields on and off the wire.
//!
//! The logical bitfield is [`crate::Bitfield`], a `bitvec` vector in MSB-first
//! order so that the highest bit of the first byte is piece 0, which is the
//! order the protocol prescribes. On the wire a bitfield always spans
//! `ceil(piece_count / 8)` bytes and any trailing pad bits must be zero.

use crate::Bitfield;

/// The number of bytes a bitfield for the given piece count occupies on the
/// wire.
pub(crate) fn wire_len(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}

/// Parses a bitfield payload received from a peer.
///
/// Returns `None` if the payload is not exactly `ceil(piece_count / 8)` bytes
/// or if any pad bit past `piece_count` is set, both of which are protocol
/// violations.
pub(crate) fn from_wire(
    bytes: Vec<u8>,
    piece_count: usize,
) -> Option<Bitfield> {
    if bytes.len() != wire_len(piece_count) {
        return None;
    }
    let mut bitfield = Bitfield::from_vec(bytes);
    if !bitfield[piece_count..].not_any() {
        return None;
    }
    bitfield.resize(piece_count, false);
    Some(bitfield)
}

/// Serializes a bitfield into its wire representation, zeroing the pad bits.
pub(crate) fn to_wire(bitfield: &Bitfield) -> Vec<u8> {
    let mut padded = bitfield.clone();
    padded.resize(8 * wire_len(bitfield.len()), false);
    padded.into_vec()
}

/// Blits the bits of `incoming` into the existing `bitfield`, which keeps its
/// identity and length. The two must represent the same piece count.
pub(crate) fn copy_from(bitfield: &mut Bitfield, incoming: &Bitfield) {
    debug_assert_eq!(bitfield.len(), incoming.len());
    for (index, bit) in incoming.iter().enumerate() {
        bitfield.set(index, *bit);
    }
}

/// Returns the number of pieces `remote` has that `ours` doesn't, that is,
/// how many pieces we could download from a peer with that availability.
pub(crate) fn count_needed(ours: &Bitfield, remote: &Bitfield) -> usize {
    debug_assert_eq!(ours.len(), remote.len());
    remote
        .iter()
        .zip(ours.iter())
        .filter(|(remote_bit, our_bit)| **remote_bit && !**our_bit)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_len() {
        assert_eq!(wire_len(1), 1);
        assert_eq!(wire_len(8), 1);
        assert_eq!(wire_len(9), 2);
        assert_eq!(wire_len(10), 2);
        assert_eq!(wire_len(16), 2);
    }

    // The literal from the protocol walkthrough: 10 pieces, payload
    // 0xFF 0x80, meaning pieces 0..=8 are present and the pad is clean.
    #[test]
    fn test_from_wire() {
        let bitfield = from_wire(vec![0xff, 0x80], 10).unwrap();
        assert_eq!(bitfield.len(), 10);
        assert_eq!(bitfield.count_ones(), 9);
        assert!(bitfield[0]);
        assert!(bitfield[8]);
        assert!(!bitfield[9]);
    }

    #[test]
    fn test_from_wire_rejects_wrong_length() {
        assert!(from_wire(vec![0xff], 10).is_none());
        assert!(from_wire(vec![0xff, 0x80, 0x00], 10).is_none());
    }

    #[test]
    fn test_from_wire_rejects_set_pad_bits() {
        // bit 10 is a pad bit for a 10 piece torrent
        assert!(from_wire(vec![0xff, 0xa0], 10).is_none());
        // the very last pad bit
        assert!(from_wire(vec![0xff, 0x81], 10).is_none());
    }

    #[test]
    fn test_wire_round_trip() {
        for piece_count in 1..64 {
            let mut bitfield = Bitfield::repeat(false, piece_count);
            // set every third piece for an uneven pattern
            for index in (0..piece_count).step_by(3) {
                bitfield.set(index, true);
            }

            let wire = to_wire(&bitfield);
            assert_eq!(wire.len(), wire_len(piece_count));
            let parsed = from_wire(wire, piece_count).unwrap();
            assert_eq!(parsed, bitfield);
        }
    }

    #[test]
    fn test_to_wire_pads_with_zeros() {
        let mut bitfield = Bitfield::repeat(true, 9);
        bitfield.set(3, false);
        let wire = to_wire(&bitfield);
        assert_eq!(wire, vec![0b1110_1111, 0x80]);
    }

    #[test]
    fn test_copy_from_keeps_identity() {
        let mut bitfield = Bitfield::repeat(false, 12);
        bitfield.set(0, true);

        let mut incoming = Bitfield::repeat(false, 12);
        incoming.set(5, true);
        incoming.set(11, true);

        copy_from(&mut bitfield, &incoming);
        assert_eq!(bitfield, incoming);
    }

    #[test]
    fn test_count_needed() {
        let mut ours = Bitfield::repeat(false, 8);
        ours.set(0, true);
        ours.set(1, true);

        let mut remote = Bitfield::repeat(false, 8);
        remote.set(1, true);
        remote.set(2, true);
        remote.set(3, true);

        // remote has pieces 2 and 3 that we lack
        assert_eq!(count_needed(&ours, &remote), 2);
        // we need nothing from ourselves
        assert_eq!(count_needed(&ours, &ours), 0);
    }
}
