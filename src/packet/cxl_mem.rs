//! CXL.mem packets: host-initiated memory requests/writes (M2S) and device
//! responses (S2M), addressed by 46-bit cacheline address.

use super::system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};
use crate::error::CxlError;

pub const CXL_MEM_DATA_LEN: usize = 64;
/// `{port_index: u8, msg_class: u8}` plus a class-specific tail.
const CXL_MEM_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgClass {
    M2sReq = 0,
    M2sRwd = 1,
    M2sBirsp = 2,
    S2mBisnp = 3,
    S2mNdr = 4,
    S2mDrs = 5,
}

impl MsgClass {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v {
            0 => MsgClass::M2sReq,
            1 => MsgClass::M2sRwd,
            2 => MsgClass::M2sBirsp,
            3 => MsgClass::S2mBisnp,
            4 => MsgClass::S2mNdr,
            5 => MsgClass::S2mDrs,
            other => return Err(CxlError::Decode(format!("unknown cxl.mem msg_class {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum M2sReqOpcode {
    MemRd = 0,
    MemRdData = 1,
    MemWrFwd = 2,
    MemInv = 3,
}

impl M2sReqOpcode {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v & 0xF {
            0 => M2sReqOpcode::MemRd,
            1 => M2sReqOpcode::MemRdData,
            2 => M2sReqOpcode::MemWrFwd,
            3 => M2sReqOpcode::MemInv,
            other => return Err(CxlError::Decode(format!("unknown m2s_req opcode {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum S2mNdrOpcode {
    Cmp = 0,
    CmpS = 1,
    CmpE = 2,
    BiConflictAck = 3,
}

impl S2mNdrOpcode {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v & 0xF {
            0 => S2mNdrOpcode::Cmp,
            1 => S2mNdrOpcode::CmpS,
            2 => S2mNdrOpcode::CmpE,
            3 => S2mNdrOpcode::BiConflictAck,
            other => return Err(CxlError::Decode(format!("unknown s2m_ndr opcode {other}"))),
        })
    }
}

/// Common fields carried by every CXL.mem sub-header: a 46-bit cacheline
/// address (`hpa = addr << 6`), a 4-bit opcode, `ld_id`, and a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlMemCommon {
    pub addr: u64,
    pub opcode: u8,
    pub meta: u8,
    pub ld_id: u8,
    pub tag: u16,
}

fn encode_common(c: &CxlMemCommon) -> [u8; 14] {
    let mut out = [0u8; 14];
    // addr: 46 bits -> 6 bytes; opcode: 4 bits packed with top of addr byte.
    let addr_bits = c.addr & ((1u64 << 46) - 1);
    out[0..6].copy_from_slice(&addr_bits.to_le_bytes()[0..6]);
    out[6] = c.opcode & 0xF;
    out[7] = c.meta;
    out[8] = c.ld_id;
    out[9..11].copy_from_slice(&c.tag.to_le_bytes());
    out
}

fn decode_common(buf: &[u8]) -> CxlMemCommon {
    let mut addr_bytes = [0u8; 8];
    addr_bytes[0..6].copy_from_slice(&buf[0..6]);
    let addr = u64::from_le_bytes(addr_bytes) & ((1u64 << 46) - 1);
    CxlMemCommon {
        addr,
        opcode: buf[6] & 0xF,
        meta: buf[7],
        ld_id: buf[8],
        tag: u16::from_le_bytes([buf[9], buf[10]]),
    }
}

/// `hpa = cacheline_addr << 6`.
pub fn line_addr_to_hpa(addr: u64) -> u64 {
    addr << 6
}

pub fn hpa_to_line_addr(hpa: u64) -> u64 {
    hpa >> 6
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlMemPacket {
    M2sReq {
        port_index: u8,
        common: CxlMemCommon,
    },
    M2sRwd {
        port_index: u8,
        common: CxlMemCommon,
        data: [u8; CXL_MEM_DATA_LEN],
    },
    S2mNdr {
        port_index: u8,
        common: CxlMemCommon,
    },
    S2mDrs {
        port_index: u8,
        common: CxlMemCommon,
        data: [u8; CXL_MEM_DATA_LEN],
    },
    /// Back-invalidate response from the host to a device snoop.
    M2sBirsp {
        port_index: u8,
        common: CxlMemCommon,
    },
    /// Back-invalidate snoop from a device to the host.
    S2mBisnp {
        port_index: u8,
        common: CxlMemCommon,
    },
}

impl CxlMemPacket {
    pub fn mem_rd(port_index: u8, line_addr: u64, ld_id: u8, tag: u16) -> Self {
        CxlMemPacket::M2sReq {
            port_index,
            common: CxlMemCommon {
                addr: line_addr,
                opcode: M2sReqOpcode::MemRd as u8,
                meta: 0,
                ld_id,
                tag,
            },
        }
    }

    pub fn mem_wr(
        port_index: u8,
        line_addr: u64,
        data: [u8; CXL_MEM_DATA_LEN],
        ld_id: u8,
        tag: u16,
    ) -> Self {
        CxlMemPacket::M2sRwd {
            port_index,
            common: CxlMemCommon {
                addr: line_addr,
                opcode: M2sReqOpcode::MemWrFwd as u8,
                meta: 0,
                ld_id,
                tag,
            },
            data,
        }
    }

    pub fn completion(port_index: u8, ld_id: u8, tag: u16) -> Self {
        CxlMemPacket::S2mNdr {
            port_index,
            common: CxlMemCommon {
                addr: 0,
                opcode: S2mNdrOpcode::CmpE as u8,
                meta: 0, // NO_OP
                ld_id,
                tag,
            },
        }
    }

    pub fn completion_data(
        port_index: u8,
        data: [u8; CXL_MEM_DATA_LEN],
        ld_id: u8,
        tag: u16,
    ) -> Self {
        CxlMemPacket::S2mDrs {
            port_index,
            common: CxlMemCommon {
                addr: 0,
                opcode: 0,
                meta: 0,
                ld_id,
                tag,
            },
            data,
        }
    }

    pub fn birsp(port_index: u8, ld_id: u8, tag: u16) -> Self {
        CxlMemPacket::M2sBirsp {
            port_index,
            common: CxlMemCommon {
                addr: 0,
                opcode: 0,
                meta: 0,
                ld_id,
                tag,
            },
        }
    }

    pub fn bisnp(port_index: u8, line_addr: u64, ld_id: u8, tag: u16) -> Self {
        CxlMemPacket::S2mBisnp {
            port_index,
            common: CxlMemCommon {
                addr: line_addr,
                opcode: 0,
                meta: 0,
                ld_id,
                tag,
            },
        }
    }

    pub fn port_index(&self) -> u8 {
        match self {
            CxlMemPacket::M2sReq { port_index, .. }
            | CxlMemPacket::M2sRwd { port_index, .. }
            | CxlMemPacket::S2mNdr { port_index, .. }
            | CxlMemPacket::S2mDrs { port_index, .. }
            | CxlMemPacket::M2sBirsp { port_index, .. }
            | CxlMemPacket::S2mBisnp { port_index, .. } => *port_index,
        }
    }

    pub fn common(&self) -> &CxlMemCommon {
        match self {
            CxlMemPacket::M2sReq { common, .. }
            | CxlMemPacket::M2sRwd { common, .. }
            | CxlMemPacket::S2mNdr { common, .. }
            | CxlMemPacket::S2mDrs { common, .. }
            | CxlMemPacket::M2sBirsp { common, .. }
            | CxlMemPacket::S2mBisnp { common, .. } => common,
        }
    }

    pub fn data(&self) -> Option<&[u8; CXL_MEM_DATA_LEN]> {
        match self {
            CxlMemPacket::M2sRwd { data, .. } | CxlMemPacket::S2mDrs { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn hpa(&self) -> u64 {
        line_addr_to_hpa(self.common().addr)
    }

    pub fn msg_class(&self) -> MsgClass {
        match self {
            CxlMemPacket::M2sReq { .. } => MsgClass::M2sReq,
            CxlMemPacket::M2sRwd { .. } => MsgClass::M2sRwd,
            CxlMemPacket::S2mNdr { .. } => MsgClass::S2mNdr,
            CxlMemPacket::S2mDrs { .. } => MsgClass::S2mDrs,
            CxlMemPacket::M2sBirsp { .. } => MsgClass::M2sBirsp,
            CxlMemPacket::S2mBisnp { .. } => MsgClass::S2mBisnp,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (port_index, common, data): (u8, &CxlMemCommon, Option<&[u8; CXL_MEM_DATA_LEN]>) =
            match self {
                CxlMemPacket::M2sReq { port_index, common } => (*port_index, common, None),
                CxlMemPacket::M2sRwd {
                    port_index,
                    common,
                    data,
                } => (*port_index, common, Some(data)),
                CxlMemPacket::S2mNdr { port_index, common } => (*port_index, common, None),
                CxlMemPacket::S2mDrs {
                    port_index,
                    common,
                    data,
                } => (*port_index, common, Some(data)),
                CxlMemPacket::M2sBirsp { port_index, common } => (*port_index, common, None),
                CxlMemPacket::S2mBisnp { port_index, common } => (*port_index, common, None),
            };
        let sub = encode_common(common);
        let data_len = data.map(|d| d.len()).unwrap_or(0);
        let payload_length =
            (SYSTEM_HEADER_LEN + CXL_MEM_HEADER_LEN + sub.len() + data_len) as u16;
        let mut out = SystemHeader::new(PayloadType::CxlMem, payload_length)
            .encode()
            .to_vec();
        out.push(port_index);
        out.push(self.msg_class() as u8);
        out.extend_from_slice(&sub);
        if let Some(d) = data {
            out.extend_from_slice(d);
        }
        out
    }

    pub fn decode_body(system_header: SystemHeader, body: &[u8]) -> Result<Self, CxlError> {
        if body.len() < CXL_MEM_HEADER_LEN + 14 {
            return Err(CxlError::Decode("short cxl.mem packet".into()));
        }
        let port_index = body[0];
        let msg_class = MsgClass::from_u8(body[1])?;
        let sub = &body[CXL_MEM_HEADER_LEN..CXL_MEM_HEADER_LEN + 14];
        let common = decode_common(sub);
        let tail = &body[CXL_MEM_HEADER_LEN + 14..];
        let expected_len = system_header.payload_length as usize
            - SYSTEM_HEADER_LEN
            - CXL_MEM_HEADER_LEN
            - 14;
        if tail.len() != expected_len {
            return Err(CxlError::Decode("cxl.mem payload_length mismatch".into()));
        }
        match msg_class {
            MsgClass::M2sReq => {
                M2sReqOpcode::from_u8(common.opcode)?;
                Ok(CxlMemPacket::M2sReq { port_index, common })
            }
            MsgClass::M2sRwd => {
                if tail.len() != CXL_MEM_DATA_LEN {
                    return Err(CxlError::Decode("m2s_rwd missing 64B data".into()));
                }
                let mut data = [0u8; CXL_MEM_DATA_LEN];
                data.copy_from_slice(tail);
                Ok(CxlMemPacket::M2sRwd {
                    port_index,
                    common,
                    data,
                })
            }
            MsgClass::S2mNdr => {
                S2mNdrOpcode::from_u8(common.opcode)?;
                Ok(CxlMemPacket::S2mNdr { port_index, common })
            }
            MsgClass::S2mDrs => {
                if tail.len() != CXL_MEM_DATA_LEN {
                    return Err(CxlError::Decode("s2m_drs missing 64B data".into()));
                }
                let mut data = [0u8; CXL_MEM_DATA_LEN];
                data.copy_from_slice(tail);
                Ok(CxlMemPacket::S2mDrs {
                    port_index,
                    common,
                    data,
                })
            }
            MsgClass::M2sBirsp => Ok(CxlMemPacket::M2sBirsp { port_index, common }),
            MsgClass::S2mBisnp => Ok(CxlMemPacket::S2mBisnp { port_index, common }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_rd_roundtrip() {
        let p = CxlMemPacket::mem_rd(1, 0x40 >> 6, 0, 7);
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlMemPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn mem_wr_data_roundtrip() {
        let mut data = [0u8; CXL_MEM_DATA_LEN];
        data[0..8].copy_from_slice(&0xDEADBEEFDEADBEEFu64.to_le_bytes());
        let p = CxlMemPacket::mem_wr(1, 1, data, 0, 3);
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlMemPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.data().unwrap(), &data);
    }

    #[test]
    fn birsp_bisnp_roundtrip() {
        let birsp = CxlMemPacket::birsp(1, 0, 9);
        let bytes = birsp.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlMemPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, birsp);

        let bisnp = CxlMemPacket::bisnp(1, 4, 0, 9);
        let bytes = bisnp.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlMemPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, bisnp);
    }

    #[test]
    fn hpa_conversion() {
        assert_eq!(line_addr_to_hpa(1), 0x40);
        assert_eq!(hpa_to_line_addr(0x40), 1);
    }
}
