//-----------------------------------------------------------------------------
// Module xcp
// XCP on Ethernet (TCP) client session
// Supports the command subset CONNECT, DISCONNECT and SHORT_UPLOAD

use thiserror::Error;

mod xcp_command;
pub use xcp_command::{decode_frame, encode_frame, XcpCommandBuilder, XcpResponse};

mod transport;
pub use transport::{Connector, StreamTransport, TcpConnector, Transport};

mod xcp_session;
pub use xcp_session::{SessionConfig, SessionState, XcpSession, XcpSessionInfo};

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP protocol definitions

// XCP command codes
pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;

// XCP connect modes
pub const XCP_CONNECT_MODE_NORMAL: u8 = 0x00;

// XCP packet identifiers of the first response byte
pub const PID_RES: u8 = 0xFF;
pub const PID_ERR: u8 = 0xFE;
pub const PID_EV: u8 = 0xFD;
pub const PID_SERV: u8 = 0xFC;

// XCP error codes carried in an error packet
pub const CRC_CMD_SYNCH: u8 = 0x00;
pub const CRC_CMD_PENDING: u8 = 0x01;
pub const CRC_CMD_IGNORED: u8 = 0x02;
pub const CRC_CMD_BUSY: u8 = 0x10;
pub const CRC_DAQ_ACTIVE: u8 = 0x11;
pub const CRC_PRM_ACTIVE: u8 = 0x12;
pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_CMD_SYNTAX: u8 = 0x21;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;
pub const CRC_WRITE_PROTECTED: u8 = 0x23;
pub const CRC_ACCESS_DENIED: u8 = 0x24;
pub const CRC_ACCESS_LOCKED: u8 = 0x25;
pub const CRC_PAGE_NOT_VALID: u8 = 0x26;
pub const CRC_PAGE_MODE_NOT_VALID: u8 = 0x27;
pub const CRC_SEGMENT_NOT_VALID: u8 = 0x28;
pub const CRC_SEQUENCE: u8 = 0x29;
pub const CRC_DAQ_CONFIG: u8 = 0x2A;
pub const CRC_MEMORY_OVERFLOW: u8 = 0x30;
pub const CRC_GENERIC: u8 = 0x31;
pub const CRC_VERIFY: u8 = 0x32;
pub const CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE: u8 = 0x33;
pub const CRC_SUBCMD_UNKNOWN: u8 = 0x34;

/// Text for an XCP error code
pub fn error_code_text(code: u8) -> &'static str {
    match code {
        CRC_CMD_SYNCH => "SYNCH",
        CRC_CMD_PENDING => "command PENDING",
        CRC_CMD_IGNORED => "command IGNORED",
        CRC_CMD_BUSY => "command BUSY",
        CRC_DAQ_ACTIVE => "DAQ ACTIVE",
        CRC_PRM_ACTIVE => "PRM ACTIVE",
        CRC_CMD_UNKNOWN => "command UNKNOWN",
        CRC_CMD_SYNTAX => "command SYNTAX",
        CRC_OUT_OF_RANGE => "Parameter out of range",
        CRC_WRITE_PROTECTED => "Write protected",
        CRC_ACCESS_DENIED => "Access denied",
        CRC_ACCESS_LOCKED => "Access locked",
        CRC_PAGE_NOT_VALID => "Invalid page",
        CRC_PAGE_MODE_NOT_VALID => "Invalid page mode",
        CRC_SEGMENT_NOT_VALID => "Invalid segment",
        CRC_SEQUENCE => "Wrong sequence",
        CRC_DAQ_CONFIG => "DAQ configuration error",
        CRC_MEMORY_OVERFLOW => "Memory overflow",
        CRC_GENERIC => "generic error",
        CRC_VERIFY => "Verify failed",
        CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE => "Resource temporary not accessible",
        CRC_SUBCMD_UNKNOWN => "Unknown sub command",
        _ => "unknown error code",
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP error type

#[derive(Error, Debug)]
pub enum XcpError {
    #[error("unsupported data type `{0}`")]
    UnsupportedDataType(String),

    #[error("invalid upload size {0}, expected 1, 2, 4 or 8")]
    InvalidUploadSize(u8),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{}", negative_response_text(.0))]
    NegativeResponse(XcpResponse),

    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl XcpError {
    /// The connection can not be used any more after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, XcpError::Protocol(_) | XcpError::Timeout(_) | XcpError::Cancelled | XcpError::Io(_))
    }

    /// Raw result code of a negative response
    pub fn result_code(&self) -> Option<u8> {
        match self {
            XcpError::NegativeResponse(r) => Some(r.code()),
            _ => None,
        }
    }
}

fn negative_response_text(response: &XcpResponse) -> String {
    match response {
        XcpResponse::Error(code) => format!("XCP error 0x{:02X} - {}", code, error_code_text(*code)),
        XcpResponse::Event(_) => "unexpected XCP event packet".to_string(),
        XcpResponse::Service(_) => "unexpected XCP service request packet".to_string(),
        XcpResponse::Unknown(pid) => format!("unknown XCP response packet 0x{:02X}", pid),
        XcpResponse::Positive(_) => "positive response".to_string(),
    }
}
