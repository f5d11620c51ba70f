//! Wire formats: the RC message header, the UDP handshake datagram, and the
//! request/response framing consumed by the worker engine.
//!
//! The RC send boundary carries the message length, so the only transport
//! framing on the wire is the 8-byte nonce header. The handshake datagram is
//! a fixed-layout record; peers drop any datagram whose length differs from
//! [`QP_TUPLE_LEN`].

/// Size of the RC message header.
pub const HEADER_LEN: usize = 8;

/// Size of the packed handshake datagram.
pub const QP_TUPLE_LEN: usize = 18;

/// Size of the request header consumed by the worker engine.
pub const REQUEST_COMMON_LEN: usize = 2;

/// Size of the response status header.
pub const RESPONSE_COMMON_LEN: usize = 4;

/// First opcode value that is out of range for any service.
pub const ILLEGAL_RPC_TYPE: u16 = 64;

/// Header prepended to every RC message.
///
/// Carries the 64-bit nonce that matches a response to its request, stored
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub nonce: u64,
}

impl Header {
    /// Serialize the header into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[..HEADER_LEN].copy_from_slice(&self.nonce.to_le_bytes());
    }

    /// Read a header from the start of `src`. Returns `None` if `src` is
    /// shorter than a header.
    pub fn read_from(src: &[u8]) -> Option<Self> {
        let bytes = src.get(..HEADER_LEN)?;
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(bytes);
        Some(Self {
            nonce: u64::from_le_bytes(raw),
        })
    }
}

/// The bootstrap record exchanged over UDP to plumb a reliable connected
/// queue pair.
///
/// Wire layout (18 bytes): LID and QPN in network byte order, the initial
/// PSN in network byte order with only the low 24 bits significant, and the
/// nonce little-endian to match the RC message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePairTuple {
    /// Local identifier of the sender's HCA port.
    pub lid: u16,
    /// Sender's queue pair number.
    pub qpn: u32,
    /// Sender's initial packet serial number (24 bits).
    pub psn: u32,
    /// Random nonce; the server echoes the client's nonce in its reply.
    pub nonce: u64,
}

impl QueuePairTuple {
    pub fn new(lid: u16, qpn: u32, psn: u32, nonce: u64) -> Self {
        Self {
            lid,
            qpn,
            psn: psn & 0x00ff_ffff,
            nonce,
        }
    }

    /// Pack into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; QP_TUPLE_LEN] {
        let mut out = [0u8; QP_TUPLE_LEN];
        out[0..2].copy_from_slice(&self.lid.to_be_bytes());
        out[2..6].copy_from_slice(&self.qpn.to_be_bytes());
        out[6..10].copy_from_slice(&(self.psn & 0x00ff_ffff).to_be_bytes());
        out[10..18].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Unpack a datagram. Returns `None` unless `src` is exactly
    /// [`QP_TUPLE_LEN`] bytes.
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() != QP_TUPLE_LEN {
            return None;
        }
        let lid = u16::from_be_bytes([src[0], src[1]]);
        let qpn = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        let psn = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) & 0x00ff_ffff;
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&src[10..18]);
        Some(Self {
            lid,
            qpn,
            psn,
            nonce: u64::from_le_bytes(nonce),
        })
    }
}

/// Status codes carried in error and service responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// The request was too short to carry a request header.
    MessageTooShort = 1,
    /// The request named an opcode no service implements.
    UnimplementedRequest = 2,
    /// The service failed internally.
    InternalError = 3,
    /// The request was dropped before a worker serviced it.
    Retry = 4,
}

impl Status {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Status::Ok),
            1 => Some(Status::MessageTooShort),
            2 => Some(Status::UnimplementedRequest),
            3 => Some(Status::InternalError),
            4 => Some(Status::Retry),
            _ => None,
        }
    }
}

/// The fixed prefix of every request payload: the opcode that selects the
/// service handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCommon {
    pub opcode: u16,
}

impl RequestCommon {
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[..REQUEST_COMMON_LEN].copy_from_slice(&self.opcode.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        let bytes = src.get(..REQUEST_COMMON_LEN)?;
        Some(Self {
            opcode: u16::from_le_bytes([bytes[0], bytes[1]]),
        })
    }
}

/// The fixed prefix of every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCommon {
    pub status: u32,
}

impl ResponseCommon {
    pub fn new(status: Status) -> Self {
        Self {
            status: status as u32,
        }
    }

    pub fn write_to(&self, dst: &mut [u8]) {
        dst[..RESPONSE_COMMON_LEN].copy_from_slice(&self.status.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        let bytes = src.get(..RESPONSE_COMMON_LEN)?;
        Some(Self {
            status: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; RESPONSE_COMMON_LEN] {
        self.status.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            nonce: 0xdead_beef_cafe_f00d,
        };
        let mut buf = [0u8; HEADER_LEN];
        hdr.write_to(&mut buf);
        assert_eq!(Header::read_from(&buf), Some(hdr));
    }

    #[test]
    fn header_too_short() {
        assert_eq!(Header::read_from(&[0u8; 7]), None);
    }

    #[test]
    fn tuple_roundtrip() {
        let tuple = QueuePairTuple::new(0x12ab, 0x00c0ffee, 0x123456, 0x0102_0304_0506_0708);
        let bytes = tuple.to_bytes();
        assert_eq!(bytes.len(), QP_TUPLE_LEN);
        assert_eq!(QueuePairTuple::from_bytes(&bytes), Some(tuple));
    }

    #[test]
    fn tuple_masks_psn_to_24_bits() {
        let tuple = QueuePairTuple::new(1, 2, 0xff12_3456, 3);
        assert_eq!(tuple.psn, 0x12_3456);
        let decoded = QueuePairTuple::from_bytes(&tuple.to_bytes()).unwrap();
        assert_eq!(decoded.psn, 0x12_3456);
    }

    #[test]
    fn tuple_wire_order() {
        let tuple = QueuePairTuple::new(0x0102, 0x0304_0506, 0x0a0b0c, 0x1122_3344_5566_7788);
        let bytes = tuple.to_bytes();
        // LID and QPN are network byte order.
        assert_eq!(&bytes[0..2], &[0x01, 0x02]);
        assert_eq!(&bytes[2..6], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[6..10], &[0x00, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn tuple_rejects_wrong_length() {
        let tuple = QueuePairTuple::new(1, 2, 3, 4);
        let bytes = tuple.to_bytes();
        assert_eq!(QueuePairTuple::from_bytes(&bytes[..QP_TUPLE_LEN - 1]), None);
        let mut long = [0u8; QP_TUPLE_LEN + 1];
        long[..QP_TUPLE_LEN].copy_from_slice(&bytes);
        assert_eq!(QueuePairTuple::from_bytes(&long), None);
    }

    #[test]
    fn request_and_response_common() {
        let mut buf = [0u8; REQUEST_COMMON_LEN];
        RequestCommon { opcode: 17 }.write_to(&mut buf);
        assert_eq!(RequestCommon::read_from(&buf), Some(RequestCommon { opcode: 17 }));
        assert_eq!(RequestCommon::read_from(&buf[..1]), None);

        let resp = ResponseCommon::new(Status::UnimplementedRequest);
        let bytes = resp.to_bytes();
        assert_eq!(ResponseCommon::read_from(&bytes), Some(resp));
        assert_eq!(Status::from_u32(resp.status), Some(Status::UnimplementedRequest));
    }
}
