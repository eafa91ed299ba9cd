use bytes::{Buf, BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// Extended message sub-id zero is the BEP-10 handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum Message {

    // Advises the peer not to close the connection during idle periods.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Short form method of communicating which pieces a client has.
    // Only valid directly after the handshake.
    Bitfield(Bitfield),

    // A request for a block: piece index, offset within the piece,
    // length.
    Request(block::BlockInfo),

    // Block payload, referencing piece index and block offset.
    Block(block::BlockData),

    // Cancels a previous request for a block.
    Cancel(block::BlockInfo),

    // The UDP port the peer's DHT node listens on.
    Port { port: u16 },

    // BEP-10 extension frame: sub-id plus a bencoded payload.
    Extended { ext_id: u8, payload: Vec<u8> },

}

pub struct MessageCodec {

    // Frames with larger payloads are a protocol error.
    pub max_frame_len: usize,

}

impl Default for MessageCodec {
    fn default() -> Self {
        Self { max_frame_len: 0x100000 }
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            // extended: <len=0002+X><id=20><ext-id><bencoded payload>
            Message::Extended { ext_id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(ext_id);
                dst.extend_from_slice(&payload);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if msg_len > self.max_frame_len {
            return Err(PeerError::FrameTooLarge(msg_len));
        }

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            // Haven't received all of message.
            return Ok(None);
        }

        let msg = match src.get_u8() {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if msg_len != 5 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have { idx: src.get_u32() }
            },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 => {
                if msg_len < 9 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            8 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            9 => {
                if msg_len != 3 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Port { port: src.get_u16() }
            },
            20 => {
                if msg_len < 2 {
                    return Err(PeerError::InvalidMessage);
                }
                let ext_id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { ext_id, payload }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len
            ),
            Message::Port { port } => write!(f, "dht port {}", port),
            Message::Extended { ext_id, payload } => write!(f, "extended {{ id: {}, {} bytes }}", ext_id, payload.len()),
        }
    }
}

// The bencoded payload of the BEP-10 extension handshake.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {

    // Names of supported extensions mapped to their local sub-ids.
    #[serde(default)]
    pub m: std::collections::BTreeMap<String, u8>,

    // Client name and version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    // Local listen port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,

    // Number of outstanding requests the sender will queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,

}

impl ExtensionHandshake {

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        serde_bencode::to_bytes(self).map_err(|e| PeerError::Bencode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        serde_bencode::from_bytes(bytes).map_err(|e| PeerError::Bencode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Port
        buf.extend_from_slice(&[0, 0, 0, 3, 0x9, 0x1a, 0xe1]);
        // Extended
        buf.extend_from_slice(&[0, 0, 0, 4, 20, 0, b'd', b'e']);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(block::BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(block::BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::Port { port: 6881 },
            Message::Extended { ext_id: 0, payload: b"de".to_vec() },
        ];
        let expected_buf = buf.clone();

        let mut codec = MessageCodec::default();
        for msg in expected.into_iter() {
            codec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();
        let mut codec = MessageCodec::default();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[0x2, 0x3]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Block(block::BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }));
    }

    #[test]
    fn test_msg_decode_oversized_frame() {
        let mut codec = MessageCodec { max_frame_len: 1024 };
        let mut src = BytesMut::new();
        src.put_u32(4096);
        src.put_u8(7);
        match codec.decode(&mut src) {
            Err(PeerError::FrameTooLarge(len)) => assert_eq!(len, 4096),
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]); // Message ID 255 is invalid
        let result = MessageCodec::default().decode(&mut src);
        match result {
            Ok(_) => panic!("Expected an error, but got Ok(_)"),
            Err(e) => match e {
                PeerError::InvalidMessageId(id) => assert_eq!(id, 255),
                _ => panic!("Expected PeerError::InvalidMessageId, but got a different error"),
            },
        }
    }

    #[test]
    fn test_extension_handshake_round_trip() {
        let mut m = std::collections::BTreeMap::new();
        m.insert("ut_metadata".to_string(), 2);
        let hs = ExtensionHandshake {
            m,
            v: Some("swarm 0.1.0".to_string()),
            p: Some(6881),
            reqq: Some(500),
        };
        let bytes = hs.to_bytes().unwrap();
        let decoded = ExtensionHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_extension_handshake_malformed() {
        assert!(ExtensionHandshake::from_bytes(b"not bencode").is_err());
    }
}
