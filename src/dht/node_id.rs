use std::net::IpAddr;
use rand::Rng;

// 160-bit Kademlia node id. Also used for infohash targets, which live
// in the same keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {

    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        NodeId(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(NodeId(arr))
    }

    // XOR distance metric.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    // Shared prefix length with another id, the bucket index in a fully
    // split table.
    pub fn common_prefix_bits(&self, other: &NodeId) -> usize {
        let mut bits = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let x = a ^ b;
            if x == 0 {
                bits += 8;
            } else {
                bits += x.leading_zeros() as usize;
                break;
            }
        }
        bits
    }

    // An id sharing exactly `prefix_bits` leading bits with ours, used
    // for bucket refresh targets.
    pub fn random_with_prefix(&self, prefix_bits: usize) -> NodeId {
        let mut id = NodeId::random().0;
        if prefix_bits >= 160 {
            return NodeId(self.0);
        }
        let byte = prefix_bits / 8;
        let bit = prefix_bits % 8;
        id[..byte].copy_from_slice(&self.0[..byte]);
        let keep = if bit == 0 { 0 } else { 0xffu8 << (8 - bit) };
        id[byte] = (self.0[byte] & keep) | (id[byte] & !keep);
        // Flip the boundary bit so the id falls in the bucket, not on
        // our side of it.
        let flip = 0x80u8 >> bit;
        id[byte] = (id[byte] & !flip) | (!self.0[byte] & flip);
        NodeId(id)
    }

    // BEP-42: the first 21 bits of a node id must be derived from a
    // crc32c over the node's masked external IP.
    pub fn matches_endpoint(&self, ip: &IpAddr) -> bool {
        // Private addresses are exempt; nothing can be derived for them.
        match ip {
            IpAddr::V4(v4) if v4.is_private() || v4.is_loopback() => return true,
            IpAddr::V6(v6) if v6.is_loopback() => return true,
            _ => {}
        }

        let rand = self.0[19] & 0x7;
        let crc = endpoint_crc(ip, rand);
        self.0[0] == ((crc >> 24) & 0xff) as u8
            && self.0[1] == ((crc >> 16) & 0xff) as u8
            && (self.0[2] & 0xf8) == ((crc >> 8) & 0xf8) as u8
    }

    // Generate an id valid for `ip` under the same rule.
    pub fn for_endpoint(ip: &IpAddr) -> NodeId {
        let mut id = NodeId::random();
        let rand = id.0[19] & 0x7;
        let crc = endpoint_crc(ip, rand);
        id.0[0] = ((crc >> 24) & 0xff) as u8;
        id.0[1] = ((crc >> 16) & 0xff) as u8;
        id.0[2] = (((crc >> 8) & 0xf8) as u8) | (id.0[2] & 0x7);
        id
    }
}

fn endpoint_crc(ip: &IpAddr, rand: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            const MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
            let mut octets = v4.octets();
            for (o, m) in octets.iter_mut().zip(MASK.iter()) {
                *o &= m;
            }
            octets[0] |= rand << 5;
            crc32c(&octets)
        }
        IpAddr::V6(v6) => {
            const MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];
            let mut octets: [u8; 8] = v6.octets()[..8].try_into().unwrap();
            for (o, m) in octets.iter_mut().zip(MASK.iter()) {
                *o &= m;
            }
            octets[0] |= rand << 5;
            crc32c(&octets)
        }
    }
}

// Castagnoli crc32, as the id-derivation rule dictates.
fn crc32c(data: &[u8]) -> u32 {
    const POLY: u32 = 0x82f63b78;
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }
    !crc
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

// Displaying full ids floods logs; show the leading bytes.
impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_xor() {
        let a = NodeId([0xff; 20]);
        let b = NodeId([0x0f; 20]);
        assert_eq!(a.distance(&b), [0xf0; 20]);
        assert_eq!(a.distance(&a), [0; 20]);
    }

    #[test]
    fn test_common_prefix_bits() {
        let a = NodeId([0; 20]);
        let mut b = NodeId([0; 20]);
        assert_eq!(a.common_prefix_bits(&b), 160);
        b.0[0] = 0x80;
        assert_eq!(a.common_prefix_bits(&b), 0);
        b.0[0] = 0x01;
        assert_eq!(a.common_prefix_bits(&b), 7);
        b.0[0] = 0;
        b.0[10] = 0x10;
        assert_eq!(a.common_prefix_bits(&b), 80 + 3);
    }

    #[test]
    fn test_crc32c_vector() {
        // Standard check value for "123456789".
        assert_eq!(crc32c(b"123456789"), 0xe3069283);
    }

    #[test]
    fn test_bep42_reference_vectors() {
        // (ip, rand byte, first three id bytes) from the BEP-42 table.
        let vectors: [(&str, u8, [u8; 3]); 3] = [
            ("124.31.75.21", 0x01, [0x5f, 0xbf, 0xbf]),
            ("21.75.31.124", 0x56, [0x5a, 0x3c, 0xe9]),
            ("84.124.73.14", 0x41, [0x1b, 0x03, 0x21]),
        ];
        for (ip, rand, prefix) in vectors {
            let ip: IpAddr = ip.parse().unwrap();
            let mut id = NodeId([0; 20]);
            id.0[..3].copy_from_slice(&prefix);
            id.0[19] = rand;
            assert!(id.matches_endpoint(&ip), "vector for {} failed", ip);
        }
        // Swapping ids between endpoints fails the check.
        let mut id = NodeId([0; 20]);
        id.0[..3].copy_from_slice(&[0x5f, 0xbf, 0xbf]);
        id.0[19] = 0x01;
        assert!(!id.matches_endpoint(&"84.124.73.14".parse().unwrap()));
    }

    #[test]
    fn test_generated_id_passes_endpoint_check() {
        let ip: IpAddr = "21.75.31.124".parse().unwrap();
        let id = NodeId::for_endpoint(&ip);
        assert!(id.matches_endpoint(&ip));
    }

    #[test]
    fn test_private_addresses_exempt() {
        let id = NodeId::random();
        assert!(id.matches_endpoint(&"192.168.1.1".parse().unwrap()));
        assert!(id.matches_endpoint(&"127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_random_with_prefix() {
        let own = NodeId([0xab; 20]);
        let id = own.random_with_prefix(16);
        assert_eq!(&id.0[..2], &own.0[..2]);
        assert_eq!(own.common_prefix_bits(&id), 16);
    }
}
