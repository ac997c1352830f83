//--------------------------------------------------------------------------------------------------------------------------------------------------
// Module xcp_command
// XCP on Ethernet framing: 2 byte little endian length, followed by the packet

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

use super::*;

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Build XCP commands with transport layer header

pub struct XcpCommandBuilder {
    data: BytesMut,
}

impl XcpCommandBuilder {
    pub fn new(command_code: u8) -> XcpCommandBuilder {
        let mut cmd = XcpCommandBuilder { data: BytesMut::with_capacity(10) };
        cmd.data.put_u16_le(0);
        cmd.data.put_u8(command_code);
        cmd
    }
    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn add_u8_slice(&mut self, value: &[u8]) -> &mut Self {
        self.data.put_slice(value);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16_le(value);
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32_le(value);
        self
    }

    /// Complete frame with length header
    pub fn build(&mut self) -> &[u8] {
        let len = (self.data.len() - 2) as u16;
        LittleEndian::write_u16(&mut self.data[0..2], len);
        self.data.as_ref()
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Frame codec

/// Prefix a packet with its length
pub fn encode_frame(packet: &[u8]) -> Result<Vec<u8>, XcpError> {
    let len = u16::try_from(packet.len()).map_err(|_| XcpError::Protocol(format!("packet too large ({} bytes)", packet.len())))?;
    let mut frame = BytesMut::with_capacity(packet.len() + 2);
    frame.put_u16_le(len);
    frame.put_slice(packet);
    Ok(frame.to_vec())
}

/// Split the first frame from a buffer
/// Returns the packet and the number of bytes consumed
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), XcpError> {
    if buf.len() < 2 {
        return Err(XcpError::Protocol(format!("short frame header ({} bytes)", buf.len())));
    }
    let len = LittleEndian::read_u16(buf) as usize;
    if buf.len() < len + 2 {
        return Err(XcpError::Protocol(format!("short frame, expected {} bytes, got {}", len, buf.len() - 2)));
    }
    Ok((&buf[2..len + 2], len + 2))
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XcpResponse

/// Classified response packet
/// The first byte of a packet is the packet identifier, the rest is the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcpResponse {
    /// Positive response (0xFF), payload following the packet identifier
    Positive(Vec<u8>),
    /// Error packet (0xFE) with its error code
    Error(u8),
    /// Event packet (0xFD)
    Event(Vec<u8>),
    /// Service request packet (0xFC)
    Service(Vec<u8>),
    /// Any other packet identifier
    Unknown(u8),
}

impl XcpResponse {
    pub fn from_packet(packet: &[u8]) -> Result<XcpResponse, XcpError> {
        let (&pid, payload) = packet.split_first().ok_or_else(|| XcpError::Protocol("empty response packet".to_string()))?;
        match pid {
            PID_RES => Ok(XcpResponse::Positive(payload.to_vec())),
            PID_ERR => match payload.first() {
                Some(&code) => Ok(XcpResponse::Error(code)),
                None => Err(XcpError::Protocol("error packet without error code".to_string())),
            },
            PID_EV => Ok(XcpResponse::Event(payload.to_vec())),
            PID_SERV => Ok(XcpResponse::Service(payload.to_vec())),
            _ => Ok(XcpResponse::Unknown(pid)),
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, XcpResponse::Positive(_))
    }

    /// Raw result code, the packet identifier or the error code of an error packet
    pub fn code(&self) -> u8 {
        match self {
            XcpResponse::Positive(_) => PID_RES,
            XcpResponse::Error(code) => *code,
            XcpResponse::Event(_) => PID_EV,
            XcpResponse::Service(_) => PID_SERV,
            XcpResponse::Unknown(pid) => *pid,
        }
    }

    /// Payload of a positive response, every other kind is a failure
    pub fn into_positive(self) -> Result<Vec<u8>, XcpError> {
        match self {
            XcpResponse::Positive(payload) => Ok(payload),
            other => Err(XcpError::NegativeResponse(other)),
        }
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod xcp_command_tests {

    use super::*;

    #[test]
    fn test_command_builder() {
        assert_eq!(XcpCommandBuilder::new(CC_CONNECT).add_u8(XCP_CONNECT_MODE_NORMAL).build(), &[0x02, 0x00, 0xFF, 0x00]);
        assert_eq!(XcpCommandBuilder::new(CC_DISCONNECT).build(), &[0x01, 0x00, 0xFE]);
        assert_eq!(
            XcpCommandBuilder::new(CC_SHORT_UPLOAD).add_u8(0).add_u8(2).add_u8(0).add_u32(0x12345678).build(),
            &[0x08, 0x00, 0xF4, 0x00, 0x02, 0x00, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_frame_round_trip() {
        for size in 0..=255usize {
            let packet: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
            let frame = encode_frame(&packet).unwrap();
            assert_eq!(frame.len(), size + 2);
            assert_eq!(frame[0] as usize, size);
            assert_eq!(frame[1], 0);
            let (decoded, consumed) = decode_frame(&frame).unwrap();
            assert_eq!(decoded, packet.as_slice());
            assert_eq!(consumed, size + 2);
        }
    }

    #[test]
    fn test_short_frame() {
        assert!(matches!(decode_frame(&[0x01]), Err(XcpError::Protocol(_))));
        assert!(matches!(decode_frame(&[0x03, 0x00, 0xFF, 0x00]), Err(XcpError::Protocol(_))));
        assert!(encode_frame(&vec![0u8; 0x10000]).is_err());
    }

    #[test]
    fn test_response_classification() {
        assert_eq!(XcpResponse::from_packet(&[0xFF, 0x34, 0x12]).unwrap(), XcpResponse::Positive(vec![0x34, 0x12]));
        assert_eq!(XcpResponse::from_packet(&[0xFE, 0x20]).unwrap(), XcpResponse::Error(CRC_CMD_UNKNOWN));
        assert_eq!(XcpResponse::from_packet(&[0xFD, 0x07]).unwrap(), XcpResponse::Event(vec![0x07]));
        assert_eq!(XcpResponse::from_packet(&[0xFC, 0x01, 0x41]).unwrap(), XcpResponse::Service(vec![0x01, 0x41]));
        assert_eq!(XcpResponse::from_packet(&[0x42]).unwrap(), XcpResponse::Unknown(0x42));
        assert!(XcpResponse::from_packet(&[]).is_err());
        assert!(XcpResponse::from_packet(&[0xFE]).is_err());

        let err = XcpResponse::Error(CRC_ACCESS_LOCKED).into_positive().unwrap_err();
        assert_eq!(err.result_code(), Some(CRC_ACCESS_LOCKED));
        assert_eq!(err.to_string(), "XCP error 0x25 - Access locked");
        assert!(!err.is_fatal());
        assert_eq!(XcpResponse::Unknown(0x42).into_positive().unwrap_err().result_code(), Some(0x42));
    }
}
