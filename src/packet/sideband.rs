//! Sideband packets: the connection-management handshake and the
//! disconnect sentinel injected into FIFOs when a socket drops.

use super::system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};
use crate::error::CxlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SidebandType {
    ConnectionRequest = 0,
    ConnectionAccept = 1,
    ConnectionReject = 2,
    ConnectionDisconnected = 3,
}

impl SidebandType {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        match v {
            0 => Ok(SidebandType::ConnectionRequest),
            1 => Ok(SidebandType::ConnectionAccept),
            2 => Ok(SidebandType::ConnectionReject),
            3 => Ok(SidebandType::ConnectionDisconnected),
            other => Err(CxlError::Decode(format!("unknown sideband type {other}"))),
        }
    }
}

/// A sideband packet. Only `ConnectionRequest` carries a trailing payload
/// (the requested port index); the rest are bare framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidebandPacket {
    pub system_header: SystemHeader,
    pub sideband_type: SidebandType,
    pub port: Option<u8>,
}

impl SidebandPacket {
    pub fn connection_request(port_index: u8) -> Self {
        SidebandPacket {
            system_header: SystemHeader::new(PayloadType::Sideband, 6),
            sideband_type: SidebandType::ConnectionRequest,
            port: Some(port_index),
        }
    }

    pub fn create(sideband_type: SidebandType) -> Self {
        SidebandPacket {
            system_header: SystemHeader::new(PayloadType::Sideband, 5),
            sideband_type,
            port: None,
        }
    }

    pub fn disconnected() -> Self {
        Self::create(SidebandType::ConnectionDisconnected)
    }

    pub fn is_connection_request(&self) -> bool {
        self.sideband_type == SidebandType::ConnectionRequest
    }

    pub fn is_disconnected(&self) -> bool {
        self.sideband_type == SidebandType::ConnectionDisconnected
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.system_header.encode().to_vec();
        out.push(self.sideband_type as u8);
        if let Some(port) = self.port {
            out.push(port);
        }
        out
    }

    /// Decode the body (everything after the system header). `body` must
    /// contain exactly `system_header.payload_length - SYSTEM_HEADER_LEN`
    /// bytes, as handed over by [`crate::packet::codec::read_packet`].
    pub fn decode_body(system_header: SystemHeader, body: &[u8]) -> Result<Self, CxlError> {
        if body.is_empty() {
            return Err(CxlError::Decode("missing sideband header".into()));
        }
        let sideband_type = SidebandType::from_u8(body[0])?;
        let port = if sideband_type == SidebandType::ConnectionRequest {
            Some(
                *body
                    .get(1)
                    .ok_or_else(|| CxlError::Decode("missing connection request port".into()))?,
            )
        } else {
            None
        };
        Ok(SidebandPacket {
            system_header,
            sideband_type,
            port,
        })
    }
}

pub const SIDEBAND_HEADER_LEN: usize = SYSTEM_HEADER_LEN + 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_request_roundtrip() {
        let p = SidebandPacket::connection_request(7);
        let bytes = p.encode();
        assert_eq!(bytes.len(), p.system_header.payload_length as usize);
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = SidebandPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn accept_has_no_port() {
        let p = SidebandPacket::create(SidebandType::ConnectionAccept);
        let bytes = p.encode();
        assert_eq!(bytes.len(), 5);
        assert!(p.port.is_none());
    }
}
