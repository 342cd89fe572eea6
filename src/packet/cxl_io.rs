//! CXL.io TLPs: memory requests, config requests, and completions,
//! correlated by a 24-bit transaction id `(requester_id, tag)`.

use rand::Rng;

use super::system_header::{PayloadType, SystemHeader, SYSTEM_HEADER_LEN};
use crate::error::CxlError;

pub const CXL_IO_BASE_HEADER_LEN: usize = 4;
pub const CXL_IO_SUBHEADER_LEN: usize = 16;
pub const CXL_IO_FIXED_HEADER_LEN: usize = CXL_IO_BASE_HEADER_LEN + CXL_IO_SUBHEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FmtType {
    Mrd32 = 0x00,
    Mrd64 = 0x20,
    Mwr32 = 0x40,
    Mwr64 = 0x60,
    CfgRd0 = 0x04,
    CfgWr0 = 0x44,
    CfgRd1 = 0x05,
    CfgWr1 = 0x45,
    Cpl = 0x0A,
    CplD = 0x4A,
}

impl FmtType {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v {
            0x00 => FmtType::Mrd32,
            0x20 => FmtType::Mrd64,
            0x40 => FmtType::Mwr32,
            0x60 => FmtType::Mwr64,
            0x04 => FmtType::CfgRd0,
            0x44 => FmtType::CfgWr0,
            0x05 => FmtType::CfgRd1,
            0x45 => FmtType::CfgWr1,
            0x0A => FmtType::Cpl,
            0x4A => FmtType::CplD,
            other => return Err(CxlError::Decode(format!("unsupported cxl.io fmt_type {other:#x}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionStatus {
    Sc = 0,
    Ur = 1,
    Rrs = 2,
    Ca = 4,
}

impl CompletionStatus {
    fn from_u8(v: u8) -> Result<Self, CxlError> {
        Ok(match v {
            0 => CompletionStatus::Sc,
            1 => CompletionStatus::Ur,
            2 => CompletionStatus::Rrs,
            4 => CompletionStatus::Ca,
            other => return Err(CxlError::Decode(format!("unknown completion status {other}"))),
        })
    }
}

/// `{fmt_type, th, rsvd, attr_b2, t8, tc, t9, length_upper, at, attr, ep,
/// td, length_lower}` packed into 4 bytes, matching the bit positions the
/// emulator core assigns the base CXL.io header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlIoHeader {
    pub fmt_type: FmtType,
    pub tc: u8,
    pub length: u16,
}

impl CxlIoHeader {
    fn encode(&self) -> [u8; CXL_IO_BASE_HEADER_LEN] {
        let length_upper = ((self.length >> 8) & 0b11) as u8;
        let length_lower = (self.length & 0xFF) as u8;
        let b0 = self.fmt_type as u8;
        let b1 = (self.tc & 0b111) << 4;
        let b2 = length_upper;
        let b3 = length_lower;
        [b0, b1, b2, b3]
    }

    fn decode(buf: &[u8]) -> Result<Self, CxlError> {
        if buf.len() < CXL_IO_BASE_HEADER_LEN {
            return Err(CxlError::Decode("short cxl.io base header".into()));
        }
        let fmt_type = FmtType::from_u8(buf[0])?;
        let tc = (buf[1] >> 4) & 0b111;
        let length_upper = buf[2] & 0b11;
        let length_lower = buf[3];
        let length = ((length_upper as u16) << 8) | length_lower as u16;
        Ok(CxlIoHeader {
            fmt_type,
            tc,
            length,
        })
    }
}

fn next_tag(tag: Option<u8>) -> u8 {
    tag.unwrap_or_else(|| rand::thread_rng().gen())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReqFields {
    pub requester_id: u16,
    pub tag: u8,
    pub addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgReqFields {
    pub requester_id: u16,
    pub tag: u8,
    pub bdf: u16,
    pub register: u16,
    /// TLP Prefix logical device id: which LD within a Multi-Logical
    /// Device this request targets. `0` for single-LD devices and ports.
    pub ld_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CplFields {
    pub completer_id: u16,
    pub requester_id: u16,
    pub tag: u8,
    pub status: CompletionStatus,
    pub byte_count: u16,
    pub lower_address: u8,
    /// TLP Prefix logical device id the completion was generated by.
    pub ld_id: u8,
}

fn encode_mem_req(f: &MemReqFields) -> [u8; CXL_IO_SUBHEADER_LEN] {
    let mut out = [0u8; CXL_IO_SUBHEADER_LEN];
    out[0..2].copy_from_slice(&f.requester_id.to_le_bytes());
    out[2] = f.tag;
    // addr is split into a 56-bit upper part and a 6-bit DW-aligned lower
    // part; reconstruction is (upper << 8) | (lower << 2).
    let upper = f.addr >> 8;
    let lower = ((f.addr >> 2) & 0x3F) as u8;
    out[4..12].copy_from_slice(&upper.to_le_bytes());
    out[12] = lower;
    out
}

fn decode_mem_req(buf: &[u8]) -> MemReqFields {
    let requester_id = u16::from_le_bytes([buf[0], buf[1]]);
    let tag = buf[2];
    let upper = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    let lower = buf[12] & 0x3F;
    let addr = (upper << 8) | ((lower as u64) << 2);
    MemReqFields {
        requester_id,
        tag,
        addr,
    }
}

fn encode_cfg_req(f: &CfgReqFields) -> [u8; CXL_IO_SUBHEADER_LEN] {
    let mut out = [0u8; CXL_IO_SUBHEADER_LEN];
    out[0..2].copy_from_slice(&f.requester_id.to_le_bytes());
    out[2] = f.tag;
    out[3] = f.ld_id;
    out[4..6].copy_from_slice(&f.bdf.to_le_bytes());
    out[6..8].copy_from_slice(&f.register.to_le_bytes());
    out
}

fn decode_cfg_req(buf: &[u8]) -> CfgReqFields {
    CfgReqFields {
        requester_id: u16::from_le_bytes([buf[0], buf[1]]),
        tag: buf[2],
        ld_id: buf[3],
        bdf: u16::from_le_bytes([buf[4], buf[5]]),
        register: u16::from_le_bytes([buf[6], buf[7]]),
    }
}

fn encode_cpl(f: &CplFields) -> [u8; CXL_IO_SUBHEADER_LEN] {
    let mut out = [0u8; CXL_IO_SUBHEADER_LEN];
    out[0..2].copy_from_slice(&f.completer_id.to_le_bytes());
    out[2..4].copy_from_slice(&f.requester_id.to_le_bytes());
    out[4] = f.tag;
    out[5] = f.status as u8;
    out[6..8].copy_from_slice(&f.byte_count.to_le_bytes());
    out[8] = f.lower_address;
    out[9] = f.ld_id;
    out
}

fn decode_cpl(buf: &[u8]) -> Result<CplFields, CxlError> {
    Ok(CplFields {
        completer_id: u16::from_le_bytes([buf[0], buf[1]]),
        requester_id: u16::from_le_bytes([buf[2], buf[3]]),
        tag: buf[4],
        status: CompletionStatus::from_u8(buf[5])?,
        byte_count: u16::from_le_bytes([buf[6], buf[7]]),
        lower_address: buf[8],
        ld_id: buf[9],
    })
}

/// A decoded CXL.io packet, dispatched by `fmt_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlIoPacket {
    MemRd {
        header: CxlIoHeader,
        fields: MemReqFields,
    },
    MemWr {
        header: CxlIoHeader,
        fields: MemReqFields,
        data: Vec<u8>,
    },
    CfgRd {
        header: CxlIoHeader,
        fields: CfgReqFields,
    },
    CfgWr {
        header: CxlIoHeader,
        fields: CfgReqFields,
        data: Vec<u8>,
    },
    Cpl {
        header: CxlIoHeader,
        fields: CplFields,
    },
    CplD {
        header: CxlIoHeader,
        fields: CplFields,
        data: Vec<u8>,
    },
}

impl CxlIoPacket {
    pub fn mem_rd(addr: u64, requester_id: u16, length_dw: u16, tag: Option<u8>) -> Self {
        let tag = next_tag(tag);
        let fmt_type = if addr > u32::MAX as u64 {
            FmtType::Mrd64
        } else {
            FmtType::Mrd32
        };
        CxlIoPacket::MemRd {
            header: CxlIoHeader {
                fmt_type,
                tc: 0,
                length: length_dw,
            },
            fields: MemReqFields {
                requester_id,
                tag,
                addr,
            },
        }
    }

    pub fn mem_wr(addr: u64, requester_id: u16, data: Vec<u8>, tag: Option<u8>) -> Self {
        let tag = next_tag(tag);
        let length_dw = (data.len() as u16 + 3) / 4;
        let fmt_type = if addr > u32::MAX as u64 {
            FmtType::Mwr64
        } else {
            FmtType::Mwr32
        };
        CxlIoPacket::MemWr {
            header: CxlIoHeader {
                fmt_type,
                tc: 0,
                length: length_dw,
            },
            fields: MemReqFields {
                requester_id,
                tag,
                addr,
            },
            data,
        }
    }

    /// Construct a type-0 config read. Request id for host-originated
    /// config reads is 0 per the wire contract.
    pub fn cfg_rd(bdf: u16, register: u16, tag: Option<u8>) -> Self {
        Self::cfg_rd_for_ld(bdf, register, tag, 0)
    }

    /// As [`Self::cfg_rd`], addressed to a specific logical device of a
    /// Multi-Logical Device via the TLP Prefix `ld_id`.
    pub fn cfg_rd_for_ld(bdf: u16, register: u16, tag: Option<u8>, ld_id: u8) -> Self {
        let tag = next_tag(tag);
        CxlIoPacket::CfgRd {
            header: CxlIoHeader {
                fmt_type: FmtType::CfgRd0,
                tc: 0,
                length: 1,
            },
            fields: CfgReqFields {
                requester_id: 0,
                tag,
                bdf,
                register,
                ld_id,
            },
        }
    }

    pub fn cfg_wr(bdf: u16, register: u16, data: [u8; 4], tag: Option<u8>) -> Self {
        Self::cfg_wr_for_ld(bdf, register, data, tag, 0)
    }

    /// As [`Self::cfg_wr`], addressed to a specific logical device.
    pub fn cfg_wr_for_ld(bdf: u16, register: u16, data: [u8; 4], tag: Option<u8>, ld_id: u8) -> Self {
        let tag = next_tag(tag);
        CxlIoPacket::CfgWr {
            header: CxlIoHeader {
                fmt_type: FmtType::CfgWr0,
                tc: 0,
                length: 1,
            },
            fields: CfgReqFields {
                requester_id: 0,
                tag,
                bdf,
                register,
                ld_id,
            },
            data: data.to_vec(),
        }
    }

    pub fn completion(
        requester_id: u16,
        completer_id: u16,
        tag: u8,
        status: CompletionStatus,
        lower_address: u8,
    ) -> Self {
        Self::completion_for_ld(requester_id, completer_id, tag, status, lower_address, 0)
    }

    /// As [`Self::completion`], generated by a specific logical device.
    pub fn completion_for_ld(
        requester_id: u16,
        completer_id: u16,
        tag: u8,
        status: CompletionStatus,
        lower_address: u8,
        ld_id: u8,
    ) -> Self {
        CxlIoPacket::Cpl {
            header: CxlIoHeader {
                fmt_type: FmtType::Cpl,
                tc: 0,
                length: 0,
            },
            fields: CplFields {
                completer_id,
                requester_id,
                tag,
                status,
                byte_count: 0,
                lower_address,
                ld_id,
            },
        }
    }

    pub fn completion_data(
        requester_id: u16,
        completer_id: u16,
        tag: u8,
        data: Vec<u8>,
        lower_address: u8,
    ) -> Self {
        Self::completion_data_for_ld(requester_id, completer_id, tag, data, lower_address, 0)
    }

    /// As [`Self::completion_data`], generated by a specific logical device.
    pub fn completion_data_for_ld(
        requester_id: u16,
        completer_id: u16,
        tag: u8,
        data: Vec<u8>,
        lower_address: u8,
        ld_id: u8,
    ) -> Self {
        let byte_count = data.len() as u16;
        CxlIoPacket::CplD {
            header: CxlIoHeader {
                fmt_type: FmtType::CplD,
                tc: 0,
                length: (data.len() as u16 + 3) / 4,
            },
            fields: CplFields {
                completer_id,
                requester_id,
                tag,
                status: CompletionStatus::Sc,
                byte_count,
                lower_address,
                ld_id,
            },
            data,
        }
    }

    pub fn header(&self) -> &CxlIoHeader {
        match self {
            CxlIoPacket::MemRd { header, .. }
            | CxlIoPacket::MemWr { header, .. }
            | CxlIoPacket::CfgRd { header, .. }
            | CxlIoPacket::CfgWr { header, .. }
            | CxlIoPacket::Cpl { header, .. }
            | CxlIoPacket::CplD { header, .. } => header,
        }
    }

    pub fn is_cfg(&self) -> bool {
        matches!(self, CxlIoPacket::CfgRd { .. } | CxlIoPacket::CfgWr { .. })
    }

    pub fn is_cfg_read(&self) -> bool {
        matches!(self, CxlIoPacket::CfgRd { .. })
    }

    pub fn is_mmio(&self) -> bool {
        matches!(self, CxlIoPacket::MemRd { .. } | CxlIoPacket::MemWr { .. })
    }

    pub fn is_mem_write(&self) -> bool {
        matches!(self, CxlIoPacket::MemWr { .. })
    }

    pub fn is_cpl(&self) -> bool {
        matches!(self, CxlIoPacket::Cpl { .. } | CxlIoPacket::CplD { .. })
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            CxlIoPacket::MemWr { data, .. }
            | CxlIoPacket::CfgWr { data, .. }
            | CxlIoPacket::CplD { data, .. } => Some(data),
            _ => None,
        }
    }

    /// 24-bit `(requester_id, tag)` pair used to correlate completions
    /// with their requests.
    pub fn transaction_id(&self) -> u32 {
        match self {
            CxlIoPacket::MemRd { fields, .. } | CxlIoPacket::MemWr { fields, .. } => {
                ((fields.requester_id as u32) << 8) | fields.tag as u32
            }
            CxlIoPacket::CfgRd { fields, .. } | CxlIoPacket::CfgWr { fields, .. } => {
                ((fields.requester_id as u32) << 8) | fields.tag as u32
            }
            CxlIoPacket::Cpl { fields, .. } | CxlIoPacket::CplD { fields, .. } => {
                ((fields.requester_id as u32) << 8) | fields.tag as u32
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (header, sub, data): (&CxlIoHeader, [u8; CXL_IO_SUBHEADER_LEN], &[u8]) = match self {
            CxlIoPacket::MemRd { header, fields } => (header, encode_mem_req(fields), &[]),
            CxlIoPacket::MemWr {
                header,
                fields,
                data,
            } => (header, encode_mem_req(fields), data),
            CxlIoPacket::CfgRd { header, fields } => (header, encode_cfg_req(fields), &[]),
            CxlIoPacket::CfgWr {
                header,
                fields,
                data,
            } => (header, encode_cfg_req(fields), data),
            CxlIoPacket::Cpl { header, fields } => (header, encode_cpl(fields), &[]),
            CxlIoPacket::CplD {
                header,
                fields,
                data,
            } => (header, encode_cpl(fields), data),
        };
        let payload_length =
            (SYSTEM_HEADER_LEN + CXL_IO_FIXED_HEADER_LEN + data.len()) as u16;
        let system_header = SystemHeader::new(PayloadType::CxlIo, payload_length);
        let mut out = system_header.encode().to_vec();
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&sub);
        out.extend_from_slice(data);
        out
    }

    pub fn decode_body(system_header: SystemHeader, body: &[u8]) -> Result<Self, CxlError> {
        if body.len() < CXL_IO_FIXED_HEADER_LEN {
            return Err(CxlError::Decode("short cxl.io packet".into()));
        }
        let header = CxlIoHeader::decode(&body[..CXL_IO_BASE_HEADER_LEN])?;
        let sub = &body[CXL_IO_BASE_HEADER_LEN..CXL_IO_FIXED_HEADER_LEN];
        let tail = &body[CXL_IO_FIXED_HEADER_LEN..];
        let data_len = system_header.payload_length as usize
            - SYSTEM_HEADER_LEN
            - CXL_IO_FIXED_HEADER_LEN;
        if tail.len() != data_len {
            return Err(CxlError::Decode(format!(
                "cxl.io payload_length {} inconsistent with body length {}",
                system_header.payload_length,
                body.len()
            )));
        }
        Ok(match header.fmt_type {
            FmtType::Mrd32 | FmtType::Mrd64 => CxlIoPacket::MemRd {
                header,
                fields: decode_mem_req(sub),
            },
            FmtType::Mwr32 | FmtType::Mwr64 => CxlIoPacket::MemWr {
                header,
                fields: decode_mem_req(sub),
                data: tail.to_vec(),
            },
            FmtType::CfgRd0 | FmtType::CfgRd1 => CxlIoPacket::CfgRd {
                header,
                fields: decode_cfg_req(sub),
            },
            FmtType::CfgWr0 | FmtType::CfgWr1 => CxlIoPacket::CfgWr {
                header,
                fields: decode_cfg_req(sub),
                data: tail.to_vec(),
            },
            FmtType::Cpl => CxlIoPacket::Cpl {
                header,
                fields: decode_cpl(sub)?,
            },
            FmtType::CplD => CxlIoPacket::CplD {
                header,
                fields: decode_cpl(sub)?,
                data: tail.to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_rd_roundtrip() {
        let p = CxlIoPacket::mem_rd(0x1000, 0x0100, 1, Some(0x55));
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        assert_eq!(header.payload_length as usize, bytes.len());
        let decoded = CxlIoPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn cfg_wr_roundtrip_with_data() {
        let p = CxlIoPacket::cfg_wr(0x0008, 0x10, 0xFFFFFFFFu32.to_le_bytes(), Some(1));
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlIoPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.data().unwrap(), &0xFFFFFFFFu32.to_le_bytes());
    }

    #[test]
    fn completion_data_roundtrip() {
        let p = CxlIoPacket::completion_data(0x0100, 0x0300, 0x55, vec![0xEF; 4], 0);
        let bytes = p.encode();
        let header = SystemHeader::decode(&bytes).unwrap();
        let decoded = CxlIoPacket::decode_body(header, &bytes[SYSTEM_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn transaction_id_matches_between_request_and_completion() {
        let req = CxlIoPacket::cfg_rd(0x0008, 0x10, Some(0x55));
        let cpl = CxlIoPacket::completion_data(0x0000, 0x0300, 0x55, vec![0; 4], 0);
        assert_eq!(req.transaction_id(), cpl.transaction_id());
    }
}
