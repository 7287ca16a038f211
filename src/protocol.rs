//! Frame codec for the Eversolar inverter bus protocol.
//!
//! Every transaction is a single request frame answered (for most functions)
//! by a single response frame. Frames share one layout:
//!
//! ```text
//! offset  size  field
//! 0       2     preamble 0xAA 0x55
//! 2       2     source address
//! 4       2     destination address
//! 6       2     function code pair (control byte + function byte)
//! 8       1     payload length N
//! 9       N     payload
//! 9+N     2     checksum, big-endian, sum of bytes[0..9+N) mod 65536
//! ```

use tokio_util::bytes::Buf;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

pub const PREAMBLE: [u8; 2] = [0xAA, 0x55];
/// Fixed address of the polling controller on the bus.
pub const CONTROLLER_ADDRESS: u8 = 0x01;
pub const BROADCAST_ADDRESS: u8 = 0x00;
/// First address handed out to a device during registration.
pub const FIRST_DEVICE_ADDRESS: u8 = 0x10;
/// Acknowledgement byte a device returns after accepting its address.
pub const ACK: u8 = 0x06;

const HEADER_LEN: usize = 9;
const CHECKSUM_LEN: usize = 2;
pub const MAX_PAYLOAD: usize = 255;

/// The transactions the controller can initiate.
///
/// Broadcast resets (`ReConnect`, `ReRegister`) solicit no response at all;
/// everything else is answered with the paired response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Function {
    /// Broadcast discovery; an unregistered device replies with its serial.
    OfflineQuery,
    /// Assign a bus address to a serial; expects the single-byte ACK.
    SendRegisterAddress,
    /// Release a device's registration. Defined by the protocol, not driven
    /// by the polling loop.
    RemoveRegister,
    /// Broadcast; ask devices to drop their connection state.
    ReConnect,
    /// Broadcast; force every device back to the unregistered state.
    ReRegister,
    /// Ask a device for its field-code layout, one byte per telemetry slot.
    QueryDescription,
    /// Read one telemetry pass: a big-endian u16 per described slot.
    QueryNormalInfo,
    /// Read the fixed 64-byte identification record.
    QueryInverterId,
}

impl Function {
    pub const fn request_code(self) -> [u8; 2] {
        match self {
            Function::OfflineQuery => [0x10, 0x00],
            Function::SendRegisterAddress => [0x10, 0x01],
            Function::RemoveRegister => [0x10, 0x02],
            Function::ReConnect => [0x10, 0x03],
            Function::ReRegister => [0x10, 0x04],
            Function::QueryDescription => [0x11, 0x00],
            Function::QueryNormalInfo => [0x11, 0x02],
            Function::QueryInverterId => [0x11, 0x03],
        }
    }

    pub const fn response_code(self) -> Option<[u8; 2]> {
        match self {
            Function::OfflineQuery => Some([0x10, 0x80]),
            Function::SendRegisterAddress => Some([0x10, 0x81]),
            Function::RemoveRegister => Some([0x10, 0x82]),
            Function::ReConnect => None,
            Function::ReRegister => None,
            Function::QueryDescription => Some([0x11, 0x80]),
            Function::QueryNormalInfo => Some([0x11, 0x82]),
            Function::QueryInverterId => Some([0x11, 0x83]),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub src: u8,
    pub dst: u8,
    pub function: Function,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(dst: u8, function: Function, payload: Vec<u8>) -> Self {
        Self { src: CONTROLLER_ADDRESS, dst, function, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw two-byte source address field.
    pub src: u16,
    /// Raw two-byte destination address field.
    pub dst: u16,
    pub control: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn source_address(&self) -> u8 {
        (self.src >> 8) as u8
    }

    pub fn destination_address(&self) -> u8 {
        (self.dst & 0xFF) as u8
    }

    /// Whether this frame answers a request for `function`.
    pub fn answers(&self, function: Function) -> bool {
        function.response_code() == Some([self.control, self.function])
    }
}

fn byte_sum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

pub struct FrameCodec {}

impl Encoder<&Request> for FrameCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: &Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        if req.payload.len() > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("payload of {} bytes does not fit one frame", req.payload.len()),
            ));
        }
        let start = dst.len();
        dst.extend_from_slice(&PREAMBLE);
        dst.extend_from_slice(&[req.src, 0x00]);
        dst.extend_from_slice(&[0x00, req.dst]);
        dst.extend_from_slice(&req.function.request_code());
        dst.extend_from_slice(&[req.payload.len() as u8]);
        dst.extend_from_slice(&req.payload);
        let checksum = byte_sum(&dst[start..]);
        dst.extend_from_slice(&checksum.to_be_bytes());
        trace!(message = "sending encoded", function = req.function.name(), buffer = ?dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            if src.len() < HEADER_LEN + CHECKSUM_LEN {
                return Ok(None);
            }
            if src[..2] != PREAMBLE {
                src.advance(1);
                continue;
            }
            let payload_len = usize::from(src[8]);
            let frame_len = HEADER_LEN + payload_len + CHECKSUM_LEN;
            if src.len() < frame_len {
                return Ok(None);
            }
            let frame = &src[..frame_len];
            let declared = u16::from_be_bytes([frame[frame_len - 2], frame[frame_len - 1]]);
            let computed = byte_sum(&frame[..frame_len - CHECKSUM_LEN]);
            if declared != computed {
                warn!(message = "discarding frame with a bad checksum", declared, computed);
                src.advance(1);
                continue;
            }
            let response = Response {
                src: u16::from_be_bytes([frame[2], frame[3]]),
                dst: u16::from_be_bytes([frame[4], frame[5]]),
                control: frame[6],
                function: frame[7],
                payload: frame[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
            };
            src.advance(frame_len);
            return Ok(Some(response));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn encode(req: &Request) -> BytesMut {
        let mut buffer = BytesMut::new();
        FrameCodec {}.encode(req, &mut buffer).unwrap();
        buffer
    }

    /// Build a device-to-controller frame the way an inverter would.
    fn response_frame(code: [u8; 2], payload: &[u8]) -> BytesMut {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&PREAMBLE);
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, CONTROLLER_ADDRESS]);
        buffer.extend_from_slice(&code);
        buffer.extend_from_slice(&[payload.len() as u8]);
        buffer.extend_from_slice(payload);
        let checksum = byte_sum(&buffer);
        buffer.extend_from_slice(&checksum.to_be_bytes());
        buffer
    }

    #[test]
    fn offline_query_byte_layout() {
        let req = Request::new(BROADCAST_ADDRESS, Function::OfflineQuery, vec![]);
        let bytes = encode(&req);
        assert_eq!(
            &bytes[..],
            &[0xAA, 0x55, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x01, 0x10],
        );
    }

    #[test]
    fn encoded_length_is_header_plus_payload_plus_checksum() {
        for len in [0usize, 1, 7, 255] {
            let req = Request::new(0x10, Function::QueryNormalInfo, vec![0xA5; len]);
            assert_eq!(encode(&req).len(), 9 + len + 2);
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let req = Request::new(0x10, Function::QueryNormalInfo, vec![0; 256]);
        let mut buffer = BytesMut::new();
        let err = FrameCodec {}.encode(&req, &mut buffer).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn checksum_is_byte_sum_of_preceding_bytes() {
        let req = Request::new(0x10, Function::SendRegisterAddress, b"ABC123\x10".to_vec());
        let bytes = encode(&req);
        let expected = byte_sum(&bytes[..bytes.len() - 2]);
        let trailer = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
        assert_eq!(trailer, expected);
    }

    #[test]
    fn response_round_trip() {
        let mut buffer = response_frame([0x10, 0x80], b"ABC123");
        let response = FrameCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert!(response.answers(Function::OfflineQuery));
        assert_eq!(response.payload, b"ABC123");
        assert_eq!(response.destination_address(), CONTROLLER_ADDRESS);
        assert!(buffer.is_empty());
    }

    #[test]
    fn request_decodes_as_its_own_header() {
        // The layouts coincide, which the loopback tests rely on.
        let req = Request::new(0x10, Function::QueryNormalInfo, vec![0x00, 0x7B]);
        let mut bytes = encode(&req);
        let decoded = FrameCodec {}.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.source_address(), CONTROLLER_ADDRESS);
        assert_eq!(decoded.destination_address(), 0x10);
        assert_eq!([decoded.control, decoded.function], Function::QueryNormalInfo.request_code());
        assert_eq!(decoded.payload, vec![0x00, 0x7B]);
    }

    #[test]
    fn short_input_waits_for_more_bytes() {
        let frame = response_frame([0x11, 0x82], &[0x00, 0x7B, 0x00, 0x0A]);
        for cut in 0..frame.len() {
            let mut partial = BytesMut::from(&frame[..cut]);
            assert_eq!(FrameCodec {}.decode(&mut partial).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn garbage_before_preamble_is_skipped() {
        let mut buffer = BytesMut::from(&[0x00, 0xFF, 0xAA][..]);
        buffer.extend_from_slice(&response_frame([0x11, 0x80], &[0x00, 0x01]));
        let response = FrameCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert!(response.answers(Function::QueryDescription));
    }

    #[test]
    fn corrupt_checksum_is_skipped() {
        let mut corrupt = response_frame([0x11, 0x82], &[0x12, 0x34]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let mut buffer = corrupt;
        buffer.extend_from_slice(&response_frame([0x11, 0x82], &[0x56, 0x78]));
        let response = FrameCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.payload, vec![0x56, 0x78]);
    }
}
