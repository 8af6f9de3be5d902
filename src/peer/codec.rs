//! The two wire codecs of the peer protocol.
//!
//! A connection starts out framed by [`HandshakeCodec`], which only knows the
//! fixed 68 byte handshake. Once the handshake is received the connection is
//! switched to [`PeerCodec`] via `FramedParts`, carrying over any bytes the
//! remote sent right after its handshake. All later frames are length
//! prefixed with a big endian `u32`; a zero length frame is a keep-alive,
//! anything else is a one byte message id followed by the payload.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{PeerError, PeerResult},
    BlockInfo, InfoHash, PeerId, PieceIndex,
};

/// The protocol string transmitted in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed length of a handshake frame.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// Frames larger than this are rejected as malformed. It comfortably holds
/// a 16 KiB block message plus headers.
pub(crate) const MAX_FRAME_LEN: u32 = 128 * 1024;

/// The first and only frame exchanged before any messages.
///
/// ```text
/// 1  byte  protocol name length, always 19
/// 19 bytes "BitTorrent protocol"
/// 8  bytes reserved (zero, no extensions)
/// 20 bytes info hash
/// 20 bytes peer id
/// ```
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> PeerResult<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> PeerResult<Option<Handshake>> {
        // until the handshake is received, the expected frame length is
        // exactly 68 bytes
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(PeerError::InvalidProtocolString);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[..19]);
        buf.advance(19);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(PeerError::InvalidProtocolString);
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);
        buf.advance(20);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is included in its header.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> PeerResult<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            _ => Err(PeerError::UnknownMessageId(id)),
        }
    }
}

/// A protocol message after the handshake.
///
/// The bitfield payload is carried as raw bytes: only the session knows the
/// torrent's piece count, so length and pad bit validation happen there.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port {
        port: u16,
    },
}

impl Message {
    /// Returns the message's id, or `None` for a keep-alive, which has no id.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port { .. } => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> PeerResult<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                // the variants here all have an id
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(payload) => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&payload);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> PeerResult<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek the length prefix without consuming it, in case the rest of
        // the frame hasn't arrived yet
        let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if msg_len > MAX_FRAME_LEN {
            log::warn!("Frame of {} bytes exceeds packet bound", msg_len);
            return Err(PeerError::InvalidFrame);
        }
        let msg_len = msg_len as usize;

        if buf.len() < 4 + msg_len {
            // pre-allocate for the rest of the frame
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;
        // each fixed size message must carry exactly its prescribed payload
        let expected = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            MessageId::Port => Some(2),
            MessageId::Bitfield | MessageId::Block => None,
        };
        if let Some(expected) = expected {
            if payload_len != expected {
                log::warn!(
                    "Message {:?} with invalid payload length {}",
                    id,
                    payload_len
                );
                return Err(PeerError::InvalidFrame);
            }
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                Message::Bitfield(buf.split_to(payload_len).to_vec())
            }
            MessageId::Request => Message::Request(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidFrame);
                }
                Message::Block {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    data: buf.split_to(payload_len - 8).to_vec(),
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Port => Message::Port {
                port: buf.get_u16(),
            },
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use pretty_assertions::assert_eq;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    // The literal handshake of the walkthrough: info hash 0x01..0x14 and
    // a peer id of "-AB1000-" followed by 12 zero bytes.
    fn test_handshake() -> Handshake {
        let mut info_hash = [0; 20];
        for (index, byte) in info_hash.iter_mut().enumerate() {
            *byte = index as u8 + 1;
        }
        let mut peer_id = [0; 20];
        peer_id[..8].copy_from_slice(b"-AB1000-");
        Handshake::new(info_hash, peer_id)
    }

    #[test]
    fn test_handshake_frame_is_68_bytes() {
        let buf = encode_handshake(test_handshake());
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &test_handshake().info_hash[..]);
        assert_eq!(&buf[48..68], &test_handshake().peer_id[..]);
    }

    #[test]
    fn test_handshake_round_trip() {
        let mut buf = encode_handshake(test_handshake());
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, test_handshake());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_needs_all_68_bytes() {
        let mut buf = encode_handshake(test_handshake());
        let mut partial = buf.split_to(67);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        // the last byte completes the frame
        partial.unsplit(buf);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut buf = encode_handshake(test_handshake());
        buf[3] = b'x';
        assert!(HandshakeCodec.decode(&mut buf).is_err());

        let mut buf = encode_handshake(test_handshake());
        buf[0] = 18;
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_is_zero_length_frame() {
        let mut buf = encode_msg(Message::KeepAlive);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        );
    }

    #[test]
    fn test_message_round_trips() {
        let block = BlockInfo {
            piece_index: 1,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let msgs = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(vec![0xff, 0x80]),
            Message::Request(block),
            Message::Block {
                piece_index: 1,
                offset: BLOCK_LEN,
                data: vec![0xab; BLOCK_LEN as usize],
            },
            Message::Cancel(block),
            Message::Port { port: 6881 },
        ];
        for msg in msgs {
            let mut buf = encode_msg(msg.clone());
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_resumes() {
        let mut buf = encode_msg(Message::Have { piece_index: 3 });
        let frame_len = buf.len();
        let mut partial = buf.split_to(frame_len - 2);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap().unwrap(),
            Message::Have { piece_index: 3 }
        );
    }

    // after handling a frame the remaining bytes stay at the buffer head and
    // reception resumes with the next frame
    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode_msg(Message::Unchoke);
        buf.extend_from_slice(&encode_msg(Message::Have { piece_index: 7 }));

        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unchoke
        );
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Have { piece_index: 7 }
        );
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_rejects_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(17);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_rejects_length_contradicting_id() {
        // a Have message must carry exactly 4 payload bytes
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u8(MessageId::Have as u8);
        buf.put_slice(&[0; 5]);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
