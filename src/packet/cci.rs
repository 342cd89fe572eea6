//! CCI (Component Command Interface) messages: the MCTP-framed request/
//! response envelope used by the fabric-management mailbox executor.

use super::system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};
use crate::error::CxlError;

const CCI_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCategory {
    Request = 0,
    Response = 1,
}

impl MessageCategory {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        match v & 0x1 {
            0 => Ok(MessageCategory::Request),
            1 => Ok(MessageCategory::Response),
            _ => unreachable!(),
        }
    }
}

/// `return_code` field of a CCI response, per the mailbox command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReturnCode {
    Success = 0x0000,
    BackgroundCommandStarted = 0x0001,
    InvalidInput = 0x0002,
    Unsupported = 0x0003,
    InternalError = 0x0004,
    RetryRequired = 0x0005,
    Busy = 0x0006,
    InvalidHandle = 0x000E,
    UnsupportedMailboxOrCci = 0x0015,
    InvalidPayloadLength = 0x0016,
}

impl ReturnCode {
    pub fn from_u16(v: u16) -> Result<Self, CxlError> {
        match v {
            0x0000 => Ok(ReturnCode::Success),
            0x0001 => Ok(ReturnCode::BackgroundCommandStarted),
            0x0002 => Ok(ReturnCode::InvalidInput),
            0x0003 => Ok(ReturnCode::Unsupported),
            0x0004 => Ok(ReturnCode::InternalError),
            0x0005 => Ok(ReturnCode::RetryRequired),
            0x0006 => Ok(ReturnCode::Busy),
            0x000E => Ok(ReturnCode::InvalidHandle),
            0x0015 => Ok(ReturnCode::UnsupportedMailboxOrCci),
            0x0016 => Ok(ReturnCode::InvalidPayloadLength),
            other => Err(CxlError::Decode(format!("unknown CCI return code {other:#06x}"))),
        }
    }
}

/// A fully-framed CCI request or response. `payload_length` is carried
/// as a 20-bit field split across two header bytes on the wire; here it
/// is just `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CciMessage {
    pub category: MessageCategory,
    pub message_tag: u8,
    pub command_opcode: u16,
    pub background_operation: bool,
    pub return_code: u16,
    pub vendor_specific_extended_status: u16,
    pub payload: Vec<u8>,
}

impl CciMessage {
    pub fn request(message_tag: u8, command_opcode: u16, payload: Vec<u8>) -> Self {
        CciMessage {
            category: MessageCategory::Request,
            message_tag,
            command_opcode,
            background_operation: false,
            return_code: 0,
            vendor_specific_extended_status: 0,
            payload,
        }
    }

    pub fn response(
        message_tag: u8,
        command_opcode: u16,
        return_code: ReturnCode,
        payload: Vec<u8>,
    ) -> Self {
        CciMessage {
            category: MessageCategory::Response,
            message_tag,
            command_opcode,
            background_operation: false,
            return_code: return_code as u16,
            vendor_specific_extended_status: 0,
            payload,
        }
    }

    pub fn is_request(&self) -> bool {
        self.category == MessageCategory::Request
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_length = self.payload.len() as u32 & 0x000F_FFFF;
        let mut header = [0u8; CCI_HEADER_LEN];
        header[0] = (self.category as u8) | ((self.message_tag as u8) << 1);
        // byte 1 reserved
        header[2] = (self.command_opcode & 0xFF) as u8;
        header[3] = (self.command_opcode >> 8) as u8;
        header[4] = (payload_length & 0xFF) as u8;
        header[5] = ((payload_length >> 8) & 0xFF) as u8;
        header[5] |= (self.background_operation as u8) << 7;
        header[6] = (self.return_code & 0xFF) as u8;
        header[7] = (self.return_code >> 8) as u8;
        let vendor = self.vendor_specific_extended_status.to_le_bytes();

        let payload_length_total =
            (SYSTEM_HEADER_LEN + CCI_HEADER_LEN + 2 + self.payload.len()) as u16;
        let mut out = SystemHeader::new(PayloadType::Cxl, payload_length_total)
            .encode()
            .to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(&vendor);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_body(system_header: SystemHeader, body: &[u8]) -> Result<Self, CxlError> {
        if body.len() < CCI_HEADER_LEN + 2 {
            return Err(CxlError::Decode("short CCI message".into()));
        }
        let category = MessageCategory::from_u8(body[0])?;
        let message_tag = body[0] >> 1;
        let command_opcode = u16::from_le_bytes([body[2], body[3]]);
        let payload_length = (u16::from_le_bytes([body[4], body[5]]) & 0x7FFF) as usize;
        let background_operation = body[5] & 0x80 != 0;
        let return_code = u16::from_le_bytes([body[6], body[7]]);
        let vendor_specific_extended_status = u16::from_le_bytes([body[8], body[9]]);
        let payload = body[CCI_HEADER_LEN + 2..].to_vec();
        if payload.len() != payload_length {
            return Err(CxlError::Decode("CCI payload_length mismatch".into()));
        }
        let expected_total = SYSTEM_HEADER_LEN + CCI_HEADER_LEN + 2 + payload.len();
        if system_header.payload_length as usize != expected_total {
            return Err(CxlError::Decode("CCI system header length mismatch".into()));
        }
        Ok(CciMessage {
            category,
            message_tag,
            command_opcode,
            background_operation,
            return_code,
            vendor_specific_extended_status,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let msg = CciMessage::request(3, 0x5400, vec![1, 2, 3, 4]);
        let bytes = msg.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CciMessage::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn response_with_return_code_roundtrip() {
        let msg = CciMessage::response(3, 0x5400, ReturnCode::InvalidInput, vec![]);
        let bytes = msg.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CciMessage::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded.return_code, ReturnCode::InvalidInput as u16);
        assert!(!decoded.is_request());
    }
}
