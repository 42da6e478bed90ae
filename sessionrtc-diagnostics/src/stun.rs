//! Minimal STUN binding request codec used for round-trip probes
//!
//! Only the 20-byte header is produced and checked; attributes in the
//! response are ignored because the probe only needs the round trip.

use bytes::{BufMut, Bytes, BytesMut};

/// RFC 5389 magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header length in bytes
pub const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

/// 96-bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Fresh random transaction id
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Encode an attribute-less binding request
pub fn encode_binding_request(transaction_id: &TransactionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id.as_bytes());
    buf.freeze()
}

/// Whether `packet` answers the request with `transaction_id`
///
/// Error responses count: the server still answered, which is all a
/// round-trip probe needs.
pub fn is_binding_response(packet: &[u8], transaction_id: &TransactionId) -> bool {
    if packet.len() < HEADER_LEN {
        return false;
    }
    let message_type = u16::from_be_bytes([packet[0], packet[1]]);
    let cookie = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

    matches!(message_type, BINDING_SUCCESS | BINDING_ERROR)
        && cookie == MAGIC_COOKIE
        && &packet[8..HEADER_LEN] == transaction_id.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_for(request: &[u8], message_type: u16) -> Vec<u8> {
        let mut response = request.to_vec();
        response[0..2].copy_from_slice(&message_type.to_be_bytes());
        response
    }

    #[test]
    fn test_binding_request_layout() {
        let tid = TransactionId::random();
        let request = encode_binding_request(&tid);
        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], tid.as_bytes());
    }

    #[test]
    fn test_response_matching() {
        let tid = TransactionId::random();
        let request = encode_binding_request(&tid);

        assert!(is_binding_response(&response_for(&request, BINDING_SUCCESS), &tid));
        assert!(is_binding_response(&response_for(&request, BINDING_ERROR), &tid));
        // A request echoed back is not a response
        assert!(!is_binding_response(&request, &tid));
        // Another transaction's response is ignored
        assert!(!is_binding_response(
            &response_for(&request, BINDING_SUCCESS),
            &TransactionId::random()
        ));
        assert!(!is_binding_response(&request[..10], &tid));
    }
}
