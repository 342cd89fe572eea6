//! Wire packet codecs. Every packet starts with a 4-byte [`system_header`]
//! that carries a `payload_type` discriminant and a total `payload_length`;
//! [`get_packet`] reads exactly that many bytes off an async reader and
//! hands the body to the matching sub-codec.

pub mod cci;
pub mod cxl_cache;
pub mod cxl_io;
pub mod cxl_mem;
pub mod sideband;
pub mod system_header;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CxlError;
use cci::CciMessage;
use cxl_cache::CxlCachePacket;
use cxl_io::CxlIoPacket;
use cxl_mem::CxlMemPacket;
use sideband::SidebandPacket;
use system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};

/// Any packet that can appear on a connection's TCP byte stream, tagged by
/// the `payload_type` nibble of its system header.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Sideband(SidebandPacket),
    CxlIo(CxlIoPacket),
    CxlMem(CxlMemPacket),
    CxlCache(CxlCachePacket),
    Cci(CciMessage),
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Sideband(p) => p.encode(),
            Packet::CxlIo(p) => p.encode(),
            Packet::CxlMem(p) => p.encode(),
            Packet::CxlCache(p) => p.encode(),
            Packet::Cci(p) => p.encode(),
        }
    }
}

/// Read one complete packet off `reader`: the 4-byte system header, then
/// `payload_length - SYSTEM_HEADER_LEN` more bytes, then dispatch on
/// `payload_type`. Returns `Ok(None)` on a clean EOF with zero bytes read
/// (the peer closed the socket between packets); any other short read is
/// a [`CxlError::Transport`].
pub async fn get_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>, CxlError> {
    let mut header_buf = [0u8; SYSTEM_HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CxlError::from(e)),
    }
    let system_header = SystemHeader::decode(&header_buf)?;
    let body_len = (system_header.payload_length as usize)
        .checked_sub(SYSTEM_HEADER_LEN)
        .ok_or_else(|| CxlError::Decode("payload_length shorter than system header".into()))?;
    let mut body = vec![0u8; body_len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(CxlError::from)?;

    let packet = match system_header.payload_type {
        PayloadType::Sideband => Packet::Sideband(SidebandPacket::decode_body(system_header, &body)?),
        PayloadType::CxlIo => Packet::CxlIo(CxlIoPacket::decode_body(system_header, &body)?),
        PayloadType::CxlMem => Packet::CxlMem(CxlMemPacket::decode_body(system_header, &body)?),
        PayloadType::CxlCache => {
            Packet::CxlCache(CxlCachePacket::decode_body(system_header, &body)?)
        }
        PayloadType::Cxl => Packet::Cci(CciMessage::decode_body(system_header, &body)?),
    };
    Ok(Some(packet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_sideband_packet_from_a_stream() {
        let packet = SidebandPacket::connection_request(2);
        let bytes = packet.encode();
        let mut reader = std::io::Cursor::new(bytes);
        let decoded = get_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, Packet::Sideband(packet));
    }

    #[tokio::test]
    async fn clean_eof_between_packets_returns_none() {
        let mut reader = std::io::Cursor::new(Vec::<u8>::new());
        let decoded = get_packet(&mut reader).await.unwrap();
        assert!(decoded.is_none());
    }
}
