//! Bit-exact codecs for the BitTorrent v1 wire protocol: the one-shot
//! handshake and the length-prefixed message stream that follows it.
//!
//! Framing rules:
//! - Handshake: `0x13` + `"BitTorrent protocol"` (19 bytes) + 8 reserved
//!   zero bytes + 20 byte info hash + 20 byte peer id. 68 bytes total.
//! - Message: 4 byte big endian length prefix, then that many bytes of
//!   payload. Length 0 is a keep-alive. Otherwise the first payload byte is
//!   the message id.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string identifying BitTorrent v1, sent as-is in every
/// handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length, in bytes, of the handshake message.
const HANDSHAKE_LEN: usize = 49 + PROTOCOL_STRING.len();

/// The one-time handshake exchanged by both peers right after connecting,
/// before any other message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Encodes and decodes [`Handshake`]s. Swapped out for [`PeerCodec`] right
/// after the handshake completes, carrying over the framed buffers so no
/// bytes the peer sent ahead of time are lost.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let Handshake { info_hash, peer_id } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0; 8]);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidConfig(
                "unexpected handshake protocol string length".into(),
            ));
        }

        let mut tmp = buf.split_to(HANDSHAKE_LEN);
        tmp.advance(1);
        let prot = tmp.split_to(PROTOCOL_STRING.len());
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidConfig(
                "unexpected handshake protocol string".into(),
            ));
        }
        // 8 reserved bytes, always zero in this client (no extension
        // protocol support)
        tmp.advance(8);

        let mut info_hash = [0; 20];
        tmp.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        tmp.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// The catalogue of post-handshake messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return None,
        })
    }
}

/// A single post-handshake protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    /// Returns the message's id, or `None` for the id-less keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
            Self::Port(_) => MessageId::Port,
        })
    }
}

/// Encodes and decodes the length-prefixed message stream exchanged after
/// the handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("non-keepalive message has an id") as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Port(port) => {
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
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if buf.len() < 4 + len {
                buf.reserve(4 + len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id_byte = buf[0];
            let id = match MessageId::from_id(id_byte) {
                Some(id) => id,
                None => {
                    // unknown message id: forward compatibility requires
                    // skipping it as a no-op rather than failing the session
                    log::debug!("Skipping unknown message id {}", id_byte);
                    buf.advance(len);
                    continue;
                }
            };
            let mut payload = buf.split_to(len);
            payload.advance(1);

            let msg = match id {
                MessageId::Choke => {
                    expect_len(&payload, 0)?;
                    Message::Choke
                }
                MessageId::Unchoke => {
                    expect_len(&payload, 0)?;
                    Message::Unchoke
                }
                MessageId::Interested => {
                    expect_len(&payload, 0)?;
                    Message::Interested
                }
                MessageId::NotInterested => {
                    expect_len(&payload, 0)?;
                    Message::NotInterested
                }
                MessageId::Have => {
                    expect_len(&payload, 4)?;
                    let piece_index = payload.get_u32() as PieceIndex;
                    Message::Have { piece_index }
                }
                MessageId::Bitfield => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
                MessageId::Request => {
                    expect_len(&payload, 12)?;
                    Message::Request(read_block_info(&mut payload))
                }
                MessageId::Cancel => {
                    expect_len(&payload, 12)?;
                    Message::Cancel(read_block_info(&mut payload))
                }
                MessageId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::InvalidMessageLength);
                    }
                    let piece_index = payload.get_u32() as PieceIndex;
                    let offset = payload.get_u32();
                    let data = payload.to_vec();
                    Message::Piece { piece_index, offset, data }
                }
                MessageId::Port => {
                    expect_len(&payload, 2)?;
                    Message::Port(payload.get_u16())
                }
            };

            return Ok(Some(msg));
        }
    }
}

fn expect_len(payload: &BytesMut, expected: usize) -> Result<(), Error> {
    if payload.len() != expected {
        Err(Error::InvalidMessageLength)
    } else {
        Ok(())
    }
}

fn read_block_info(payload: &mut BytesMut) -> BlockInfo {
    let piece_index = payload.get_u32() as PieceIndex;
    let offset = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo { piece_index, offset, len }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_round_trip() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, info_hash);
        assert_eq!(decoded.peer_id, peer_id);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"NotBitTorrentProto!");
        buf.put_slice(&[0; 8]);
        buf.put_slice(&[0; 20]);
        buf.put_slice(&[0; 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keepalive_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn test_choke_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Choke);
    }

    #[test]
    fn test_have_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 42 }, &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Have { piece_index: 42 });
    }

    #[test]
    fn test_have_rejects_bad_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(3); // wrong: have must be 4
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_bitfield_round_trip() {
        let mut bitfield = Bitfield::repeat(false, 10);
        for i in &[0, 1, 7] {
            bitfield.set(*i, true);
        }
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Bitfield(mut got) => {
                got.resize(10, false);
                assert_eq!(got, bitfield);
            }
            _ => panic!("expected bitfield"),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn test_piece_round_trip() {
        let data = vec![9u8; 100];
        let msg = Message::Piece { piece_index: 1, offset: 0, data: data.clone() };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece { piece_index: 1, offset: 0, data });
    }

    #[test]
    fn test_unknown_message_id_is_skipped_not_fatal() {
        let mut buf = BytesMut::new();
        // unknown id 99 with some payload, followed by a valid choke
        buf.put_u32(3);
        buf.put_u8(99);
        buf.put_u16(0xBEEF);
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Choke);
    }

    #[test]
    fn test_incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4 byte piece index
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }
}
