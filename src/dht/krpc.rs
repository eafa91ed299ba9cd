use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use bytes::{Buf, BufMut};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use super::node_id::NodeId;
use super::DhtError;

// KRPC message framing: a single bencoded dictionary per UDP datagram.

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct KrpcMessage {

    // Transaction id, echoed by the responder.
    pub t: ByteBuf,

    // "q" query, "r" response, "e" error.
    pub y: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<KrpcArgs>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<KrpcResponse>,

    // Error list: [code, message].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<(i64, String)>,

}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct KrpcArgs {

    pub id: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,

}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct KrpcResponse {

    pub id: ByteBuf,

    // Compact node info, 26 bytes per node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    // Compact peer endpoints, 6 bytes each.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

    // Write token to present with announce_peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

}

impl KrpcMessage {

    pub fn query(txid: u16, method: &str, args: KrpcArgs) -> Self {
        Self {
            t: ByteBuf::from(txid.to_be_bytes().to_vec()),
            y: "q".to_string(),
            q: Some(method.to_string()),
            a: Some(args),
            r: None,
            e: None,
        }
    }

    pub fn response(txid: &[u8], resp: KrpcResponse) -> Self {
        Self {
            t: ByteBuf::from(txid.to_vec()),
            y: "r".to_string(),
            q: None,
            a: None,
            r: Some(resp),
            e: None,
        }
    }

    pub fn error(txid: &[u8], code: i64, msg: &str) -> Self {
        Self {
            t: ByteBuf::from(txid.to_vec()),
            y: "e".to_string(),
            q: None,
            a: None,
            r: None,
            e: Some((code, msg.to_string())),
        }
    }

    // Transaction ids we allocate are always 16 bits.
    pub fn txid(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.t.as_slice().try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DhtError> {
        serde_bencode::to_bytes(self).map_err(|e| DhtError::Bencode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        serde_bencode::from_bytes(bytes).map_err(|e| DhtError::Bencode(e.to_string()))
    }
}

// Compact node info: 20-byte id, 4-byte IPv4, 2-byte port.
pub fn decode_nodes(raw: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    let mut nodes = Vec::with_capacity(raw.len() / 26);
    let mut buf = raw;
    while buf.remaining() >= 26 {
        let mut id = [0u8; 20];
        buf.copy_to_slice(&mut id);
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        nodes.push((NodeId(id), SocketAddr::new(IpAddr::V4(ip), port)));
    }
    nodes
}

pub fn encode_nodes(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        let SocketAddr::V4(v4) = addr else {
            continue;
        };
        buf.put(&id.0[..]);
        buf.put(&v4.ip().octets()[..]);
        buf.put_u16(v4.port());
    }
    buf
}

pub fn decode_peers(values: &[ByteBuf]) -> Vec<SocketAddr> {
    let mut peers = Vec::with_capacity(values.len());
    for value in values {
        let mut buf = value.as_slice();
        if buf.remaining() != 6 {
            continue;
        }
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    peers
}

pub fn encode_peer(addr: &SocketAddr) -> Option<ByteBuf> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };
    let mut buf = Vec::with_capacity(6);
    buf.put(&v4.ip().octets()[..]);
    buf.put_u16(v4.port());
    Some(ByteBuf::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_query_wire_format() {
        let msg = KrpcMessage::query(0x6162, "ping", KrpcArgs {
            id: ByteBuf::from(vec![b'a'; 20]),
            ..Default::default()
        });
        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("1:q4:ping"));
        assert!(text.contains("1:t2:ab"));
        assert!(text.contains("1:y1:q"));

        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.txid(), Some(0x6162));
    }

    #[test]
    fn test_get_peers_response_round_trip() {
        let resp = KrpcResponse {
            id: ByteBuf::from(vec![1; 20]),
            nodes: Some(ByteBuf::from(encode_nodes(&[(
                NodeId([7; 20]),
                "10.0.0.7:7000".parse().unwrap(),
            )]))),
            values: Some(vec![encode_peer(&"10.0.0.9:9000".parse().unwrap()).unwrap()]),
            token: Some(ByteBuf::from(b"secret".to_vec())),
        };
        let msg = KrpcMessage::response(&[0, 1], resp);
        let decoded = KrpcMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        let r = decoded.r.unwrap();
        let nodes = decode_nodes(r.nodes.as_ref().unwrap());
        assert_eq!(nodes, vec![(NodeId([7; 20]), "10.0.0.7:7000".parse().unwrap())]);
        let peers = decode_peers(r.values.as_ref().unwrap());
        assert_eq!(peers, vec!["10.0.0.9:9000".parse().unwrap()]);
        assert_eq!(r.token.unwrap().as_slice(), b"secret");
    }

    #[test]
    fn test_error_message() {
        let msg = KrpcMessage::error(&[0, 2], 203, "protocol error");
        let decoded = KrpcMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.y, "e");
        assert_eq!(decoded.e, Some((203, "protocol error".to_string())));
    }

    #[test]
    fn test_truncated_nodes_ignored() {
        let mut raw = encode_nodes(&[(NodeId([1; 20]), "10.0.0.1:10".parse().unwrap())]);
        raw.truncate(20);
        assert!(decode_nodes(&raw).is_empty());
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(KrpcMessage::from_bytes(b"spam").is_err());
        assert!(KrpcMessage::from_bytes(b"d1:t2:abe").is_err());
    }
}
