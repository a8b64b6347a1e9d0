//! Heartbeat packet format and parsing.
//!
//! Fixed layout, multi-byte fields in network byte order:
//!
//! ```text
//! +--------------------------------------------------+
//! | from: hostname, NUL padded          (256 bytes)  |
//! +--------------------------------------------------+
//! | from_pgpool_port: int32                          |
//! +--------------------------------------------------+
//! | send_time.tv_sec: int32                          |
//! +--------------------------------------------------+
//! | send_time.tv_usec: int32                         |
//! +--------------------------------------------------+
//! | hash: hex string, NUL padded         (65 bytes)  |
//! +--------------------------------------------------+
//! ```

use crate::auth::PacketAuthenticator;
use crate::types::{HASH_FIELD_LEN, HOSTNAME_FIELD_LEN, HeartbeatTime};
use bytes::{BufMut, Bytes, BytesMut};

/// Encoded size of a heartbeat packet.
pub const PACKET_LEN: usize = HOSTNAME_FIELD_LEN + 4 + 4 + 4 + HASH_FIELD_LEN;

/// Heartbeat packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPacket {
    /// Sender host name
    pub from: String,

    /// Sender pgpool port
    pub from_pgpool_port: i32,

    /// Send timestamp
    pub send_time: HeartbeatTime,

    /// Authentication hash (empty when authentication is off)
    pub hash: String,
}

impl HeartbeatPacket {
    /// Create an unsigned packet. The hostname is truncated to fit the field.
    pub fn new(from: &str, from_pgpool_port: i32, send_time: HeartbeatTime) -> Self {
        Self {
            from: truncate_to(from, HOSTNAME_FIELD_LEN - 1).to_string(),
            from_pgpool_port,
            send_time,
            hash: String::new(),
        }
    }

    /// The bytes covered by the authentication hash.
    ///
    /// The pgpool port is not part of it.
    pub fn auth_payload(&self) -> String {
        format!(
            "tv_sec={} tv_usec={} from={}",
            self.send_time.sec, self.send_time.usec, self.from
        )
    }

    /// Fill in the hash field.
    pub fn sign(&mut self, auth: &PacketAuthenticator) {
        self.hash = auth.compute(self.auth_payload().as_bytes());
    }

    /// Check the hash field.
    pub fn verify(&self, auth: &PacketAuthenticator) -> bool {
        auth.verify(self.auth_payload().as_bytes(), &self.hash)
    }

    /// Parse a heartbeat packet from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < PACKET_LEN {
            return Err("Packet too short");
        }

        let mut offset = 0;
        let from = read_cstr(&data[offset..offset + HOSTNAME_FIELD_LEN])?;
        offset += HOSTNAME_FIELD_LEN;

        let from_pgpool_port = read_i32(data, offset);
        offset += 4;
        let sec = read_i32(data, offset);
        offset += 4;
        let usec = read_i32(data, offset);
        offset += 4;

        if !(0..1_000_000).contains(&usec) {
            return Err("Invalid microseconds field");
        }

        let hash = read_cstr(&data[offset..offset + HASH_FIELD_LEN])?;

        Ok(Self {
            from,
            from_pgpool_port,
            send_time: HeartbeatTime::new(sec, usec),
            hash,
        })
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_LEN);

        put_padded(&mut buf, truncate_to(&self.from, HOSTNAME_FIELD_LEN - 1), HOSTNAME_FIELD_LEN);
        buf.put_i32(self.from_pgpool_port);
        buf.put_i32(self.send_time.sec);
        buf.put_i32(self.send_time.usec);
        put_padded(&mut buf, truncate_to(&self.hash, HASH_FIELD_LEN - 1), HASH_FIELD_LEN);

        buf.freeze()
    }
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_cstr(field: &[u8]) -> Result<String, &'static str> {
    let end = field.iter().position(|&b| b == 0).ok_or("Unterminated string field")?;
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| "String field is not valid UTF-8")
}

fn put_padded(buf: &mut BytesMut, s: &str, width: usize) {
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, width - s.len());
}

/// Longest prefix of `s` of at most `max` bytes ending on a char boundary.
fn truncate_to(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMethod;

    #[test]
    fn test_packet_serialize_parse() {
        let auth = PacketAuthenticator::new("secret", AuthMethod::HmacSha256);
        let mut packet = HeartbeatPacket::new("node1.example.com", 9999, HeartbeatTime::new(1_700_000_000, 42));
        packet.sign(&auth);

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_LEN);

        let parsed = HeartbeatPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.verify(&auth));
    }

    #[test]
    fn test_network_byte_order() {
        let packet = HeartbeatPacket::new("a", 9999, HeartbeatTime::new(0x01020304, 5));
        let bytes = packet.to_bytes();

        let port_off = HOSTNAME_FIELD_LEN;
        assert_eq!(&bytes[port_off..port_off + 4], &[0, 0, 0x27, 0x0f]);
        assert_eq!(&bytes[port_off + 4..port_off + 8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[port_off + 8..port_off + 12], &[0, 0, 0, 5]);
    }

    #[test]
    fn test_auth_payload_format() {
        let packet = HeartbeatPacket::new("node1", 9999, HeartbeatTime::new(1700000000, 123456));
        assert_eq!(packet.auth_payload(), "tv_sec=1700000000 tv_usec=123456 from=node1");
    }

    #[test]
    fn test_parse_rejects_short_and_garbage() {
        assert_eq!(HeartbeatPacket::parse(&[0u8; 10]), Err("Packet too short"));

        // hostname field without terminator
        let garbage = [b'x'; PACKET_LEN];
        assert_eq!(HeartbeatPacket::parse(&garbage), Err("Unterminated string field"));
    }

    #[test]
    fn test_parse_rejects_bad_usec() {
        let mut bytes = BytesMut::from(&HeartbeatPacket::new("a", 1, HeartbeatTime::new(1, 1)).to_bytes()[..]);
        let usec_off = HOSTNAME_FIELD_LEN + 8;
        bytes[usec_off..usec_off + 4].copy_from_slice(&2_000_000i32.to_be_bytes());
        assert!(HeartbeatPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_long_hostname_truncated() {
        let long = "h".repeat(400);
        let packet = HeartbeatPacket::new(&long, 1, HeartbeatTime::new(1, 0));
        assert_eq!(packet.from.len(), HOSTNAME_FIELD_LEN - 1);

        let parsed = HeartbeatPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.from, packet.from);
    }

    #[test]
    fn test_tampered_packet_fails_verification() {
        let auth = PacketAuthenticator::new("secret", AuthMethod::Md5);
        let mut packet = HeartbeatPacket::new("node1", 9999, HeartbeatTime::new(100, 1));
        packet.sign(&auth);

        let mut forged = packet.clone();
        forged.send_time.sec += 1;
        assert!(!forged.verify(&auth));

        let mut renamed = packet.clone();
        renamed.from = "node2".to_string();
        assert!(!renamed.verify(&auth));
    }
}
