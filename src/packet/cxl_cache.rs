//! CXL.cache packets: device-to-host and host-to-device request, response
//! and data sub-classes. Only the packet shapes are wired up; see
//! DESIGN.md for the open question around the full D2H/H2D state machine.

use super::system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};
use crate::error::CxlError;

pub const CXL_CACHE_DATA_LEN: usize = 64;
const CXL_CACHE_HEADER_LEN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgClass {
    D2hReq = 0,
    D2hRsp = 1,
    D2hData = 2,
    H2dReq = 3,
    H2dRsp = 4,
    H2dData = 5,
}

impl MsgClass {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v {
            0 => MsgClass::D2hReq,
            1 => MsgClass::D2hRsp,
            2 => MsgClass::D2hData,
            3 => MsgClass::H2dReq,
            4 => MsgClass::H2dRsp,
            5 => MsgClass::H2dData,
            other => return Err(CxlError::Decode(format!("unknown cxl.cache msg_class {other}"))),
        })
    }
}

/// `{addr: 46b, opcode: 4b, cache_id: 4b, uqid/cq_id: 16b}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlCacheCommon {
    pub addr: u64,
    pub opcode: u8,
    pub cache_id: u8,
    pub id: u16,
}

fn encode_common(c: &CxlCacheCommon) -> [u8; 11] {
    let mut out = [0u8; 11];
    let addr_bits = c.addr & ((1u64 << 46) - 1);
    out[0..6].copy_from_slice(&addr_bits.to_le_bytes()[0..6]);
    out[6] = c.opcode & 0xF;
    out[7] = c.cache_id & 0xF;
    out[8..10].copy_from_slice(&c.id.to_le_bytes());
    out
}

fn decode_common(buf: &[u8]) -> CxlCacheCommon {
    let mut addr_bytes = [0u8; 8];
    addr_bytes[0..6].copy_from_slice(&buf[0..6]);
    let addr = u64::from_le_bytes(addr_bytes) & ((1u64 << 46) - 1);
    CxlCacheCommon {
        addr,
        opcode: buf[6] & 0xF,
        cache_id: buf[7] & 0xF,
        id: u16::from_le_bytes([buf[8], buf[9]]),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlCachePacket {
    D2hReq {
        common: CxlCacheCommon,
    },
    D2hRsp {
        common: CxlCacheCommon,
    },
    D2hData {
        common: CxlCacheCommon,
        data: [u8; CXL_CACHE_DATA_LEN],
    },
    H2dReq {
        common: CxlCacheCommon,
    },
    H2dRsp {
        common: CxlCacheCommon,
    },
    H2dData {
        common: CxlCacheCommon,
        data: [u8; CXL_CACHE_DATA_LEN],
    },
}

impl CxlCachePacket {
    pub fn common(&self) -> &CxlCacheCommon {
        match self {
            CxlCachePacket::D2hReq { common }
            | CxlCachePacket::D2hRsp { common }
            | CxlCachePacket::D2hData { common, .. }
            | CxlCachePacket::H2dReq { common }
            | CxlCachePacket::H2dRsp { common }
            | CxlCachePacket::H2dData { common, .. } => common,
        }
    }

    pub fn msg_class(&self) -> MsgClass {
        match self {
            CxlCachePacket::D2hReq { .. } => MsgClass::D2hReq,
            CxlCachePacket::D2hRsp { .. } => MsgClass::D2hRsp,
            CxlCachePacket::D2hData { .. } => MsgClass::D2hData,
            CxlCachePacket::H2dReq { .. } => MsgClass::H2dReq,
            CxlCachePacket::H2dRsp { .. } => MsgClass::H2dRsp,
            CxlCachePacket::H2dData { .. } => MsgClass::H2dData,
        }
    }

    pub fn data(&self) -> Option<&[u8; CXL_CACHE_DATA_LEN]> {
        match self {
            CxlCachePacket::D2hData { data, .. } | CxlCachePacket::H2dData { data, .. } => {
                Some(data)
            }
            _ => None,
        }
    }

    pub fn d2h_req(addr: u64, cache_id: u8, uqid: u16, opcode: u8) -> Self {
        CxlCachePacket::D2hReq {
            common: CxlCacheCommon {
                addr,
                opcode,
                cache_id,
                id: uqid,
            },
        }
    }

    pub fn h2d_rsp(cache_id: u8, uqid: u16, opcode: u8) -> Self {
        CxlCachePacket::H2dRsp {
            common: CxlCacheCommon {
                addr: 0,
                opcode,
                cache_id,
                id: uqid,
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let common = self.common();
        let sub = encode_common(common);
        let data = self.data();
        let data_len = data.map(|d| d.len()).unwrap_or(0);
        let payload_length =
            (SYSTEM_HEADER_LEN + CXL_CACHE_HEADER_LEN + sub.len() + data_len) as u16;
        let mut out = SystemHeader::new(PayloadType::CxlCache, payload_length)
            .encode()
            .to_vec();
        out.push(self.msg_class() as u8);
        out.extend_from_slice(&sub);
        if let Some(d) = data {
            out.extend_from_slice(d);
        }
        out
    }

    pub fn decode_body(system_header: SystemHeader, body: &[u8]) -> Result<Self, CxlError> {
        if body.len() < CXL_CACHE_HEADER_LEN + 10 {
            return Err(CxlError::Decode("short cxl.cache packet".into()));
        }
        let msg_class = MsgClass::from_u8(body[0])?;
        let sub = &body[CXL_CACHE_HEADER_LEN..CXL_CACHE_HEADER_LEN + 10];
        let common = decode_common(sub);
        let tail = &body[CXL_CACHE_HEADER_LEN + 10..];
        let expected_len = system_header.payload_length as usize
            - SYSTEM_HEADER_LEN
            - CXL_CACHE_HEADER_LEN
            - 10;
        if tail.len() != expected_len {
            return Err(CxlError::Decode("cxl.cache payload_length mismatch".into()));
        }
        Ok(match msg_class {
            MsgClass::D2hReq => CxlCachePacket::D2hReq { common },
            MsgClass::D2hRsp => CxlCachePacket::D2hRsp { common },
            MsgClass::H2dReq => CxlCachePacket::H2dReq { common },
            MsgClass::H2dRsp => CxlCachePacket::H2dRsp { common },
            MsgClass::D2hData => {
                if tail.len() != CXL_CACHE_DATA_LEN {
                    return Err(CxlError::Decode("d2h_data missing 64B data".into()));
                }
                let mut data = [0u8; CXL_CACHE_DATA_LEN];
                data.copy_from_slice(tail);
                CxlCachePacket::D2hData { common, data }
            }
            MsgClass::H2dData => {
                if tail.len() != CXL_CACHE_DATA_LEN {
                    return Err(CxlError::Decode("h2d_data missing 64B data".into()));
                }
                let mut data = [0u8; CXL_CACHE_DATA_LEN];
                data.copy_from_slice(tail);
                CxlCachePacket::H2dData { common, data }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn d2h_req_roundtrip() {
        let p = CxlCachePacket::d2h_req(0x40, 0, 12, 1);
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlCachePacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn h2d_data_roundtrip() {
        let p = CxlCachePacket::H2dData {
            common: CxlCacheCommon {
                addr: 0,
                opcode: 2,
                cache_id: 0,
                id: 12,
            },
            data: [0xAA; CXL_CACHE_DATA_LEN],
        };
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlCachePacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }
}
