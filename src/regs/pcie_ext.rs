//! PCIe extended capabilities carried in config space beyond the common
//! header: the CXL Register Locator DVSEC (so a host can find the
//! Component/Device register blocks in BAR space), a minimal DOE mailbox
//! capability, and the standard MSI/PCIe capability headers.

use crate::error::CxlError;
use crate::layout::{bitfield, bytefield, Attr, FieldDesc, RegisterFile};

pub const DVSEC_HEADER_LEN: usize = 0x8;
pub const CXL_DVSEC_VENDOR_ID: u16 = 0x1E98;
pub const DVSEC_ID_REGISTER_LOCATOR: u16 = 0x0023;

const DVSEC_HEADER_FIELDS: &[FieldDesc] = &[
    bytefield("dvsec_vendor_id", 0x0, 0x1, Attr::Ro),
    bitfield("dvsec_revision", 16, 19, Attr::Ro),
    bitfield("dvsec_length", 20, 31, Attr::Ro),
    bytefield("dvsec_id", 0x4, 0x5, Attr::Ro),
    bytefield("reserved", 0x6, 0x7, Attr::Reserved),
];

/// One register-block entry of the Register Locator DVSEC: resolves to
/// `(bar_index, byte_offset, block_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBlockIdentifier {
    Empty = 0,
    Component = 1,
    BarVirtualizationAcl = 2,
    Device = 3,
    Cdat = 4,
}

impl RegisterBlockIdentifier {
    pub fn from_u8(v: u8) -> Result<Self, CxlError> {
        match v {
            0 => Ok(RegisterBlockIdentifier::Empty),
            1 => Ok(RegisterBlockIdentifier::Component),
            2 => Ok(RegisterBlockIdentifier::BarVirtualizationAcl),
            3 => Ok(RegisterBlockIdentifier::Device),
            4 => Ok(RegisterBlockIdentifier::Cdat),
            other => Err(CxlError::Decode(format!("unknown register block identifier {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlockEntry {
    pub bar_index: u8,
    pub block_identifier: RegisterBlockIdentifier,
    pub byte_offset: u64,
}

const REGISTER_BLOCK_ENTRY_LEN: usize = 8;

fn encode_register_block_entry(entry: &RegisterBlockEntry) -> [u8; REGISTER_BLOCK_ENTRY_LEN] {
    let low = (entry.bar_index as u32 & 0x7)
        | ((entry.block_identifier as u32) << 8)
        | ((entry.byte_offset as u32) & 0xFFFF_0000);
    let high = (entry.byte_offset >> 32) as u32;
    let mut out = [0u8; REGISTER_BLOCK_ENTRY_LEN];
    out[0..4].copy_from_slice(&low.to_le_bytes());
    out[4..8].copy_from_slice(&high.to_le_bytes());
    out
}

fn decode_register_block_entry(buf: &[u8]) -> Result<RegisterBlockEntry, CxlError> {
    let low = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let high = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(RegisterBlockEntry {
        bar_index: (low & 0x7) as u8,
        block_identifier: RegisterBlockIdentifier::from_u8(((low >> 8) & 0xFF) as u8)?,
        byte_offset: (low & 0xFFFF_0000) as u64 | ((high as u64) << 32),
    })
}

/// The Register Locator DVSEC: a DVSEC header followed by N register
/// block entries, one per CXL register block the device exposes.
pub struct RegisterLocatorDvsec {
    pub header: RegisterFile,
    entries: Vec<RegisterBlockEntry>,
}

impl RegisterLocatorDvsec {
    pub fn new(entries: Vec<RegisterBlockEntry>) -> Result<Self, CxlError> {
        let total_len = DVSEC_HEADER_LEN + entries.len() * REGISTER_BLOCK_ENTRY_LEN;
        let mut header = RegisterFile::new(DVSEC_HEADER_FIELDS, total_len)?;
        header.init("dvsec_vendor_id", CXL_DVSEC_VENDOR_ID as u64)?;
        header.init("dvsec_id", DVSEC_ID_REGISTER_LOCATOR as u64)?;
        header.init("dvsec_length", total_len as u64)?;
        for (i, entry) in entries.iter().enumerate() {
            let bytes = encode_register_block_entry(entry);
            let offset = DVSEC_HEADER_LEN + i * REGISTER_BLOCK_ENTRY_LEN;
            let mask = [0xFFu8; REGISTER_BLOCK_ENTRY_LEN];
            header.write_bytes_masked(offset, &bytes, &mask);
        }
        Ok(RegisterLocatorDvsec { header, entries })
    }

    pub fn entries(&self) -> &[RegisterBlockEntry] {
        &self.entries
    }

    pub fn find(&self, block_identifier: RegisterBlockIdentifier) -> Option<&RegisterBlockEntry> {
        self.entries.iter().find(|e| e.block_identifier == block_identifier)
    }
}

/// DOE (Data Object Exchange) mailbox capability: paired write/read data
/// registers plus a go/busy/abort control register. Only the built-in
/// DOE Discovery protocol object (protocol 0) is modeled; CDAT retrieval
/// (protocol 2) is left to the caller to format into the data mailbox.
pub const DOE_CAPABILITY_LEN: usize = 0x4;
pub const DOE_CONTROL_LEN: usize = 0x4;
pub const DOE_STATUS_LEN: usize = 0x4;
pub const DOE_MAILBOX_DEPTH_DW: usize = 32;

const DOE_CONTROL_FIELDS: &[FieldDesc] = &[
    bitfield("doe_abort", 0, 0, Attr::Rw1c),
    bitfield("doe_interrupt_enable", 1, 1, Attr::Rw),
    bitfield("reserved", 2, 30, Attr::Reserved),
    bitfield("doe_go", 31, 31, Attr::Rw1c),
];

pub fn new_doe_control() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(DOE_CONTROL_FIELDS, DOE_CONTROL_LEN)
}

const DOE_STATUS_FIELDS: &[FieldDesc] = &[
    bitfield("doe_busy", 0, 0, Attr::Ro),
    bitfield("reserved0", 1, 14, Attr::Reserved),
    bitfield("doe_interrupt_status", 15, 15, Attr::Rw1c),
    bitfield("doe_error", 16, 16, Attr::Ro),
    bitfield("reserved1", 17, 30, Attr::Reserved),
    bitfield("data_object_ready", 31, 31, Attr::Ro),
];

pub fn new_doe_status() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(DOE_STATUS_FIELDS, DOE_STATUS_LEN)
}

/// MSI capability (minimal): the single message-control/address/data set
/// needed to discover interrupt support without implementing delivery.
pub const MSI_CAPABILITY_LEN: usize = 0xC;

const MSI_CAPABILITY_FIELDS: &[FieldDesc] = &[
    bytefield("capability_id", 0x0, 0x0, Attr::Ro),
    bytefield("next_capability_pointer", 0x1, 0x1, Attr::Ro),
    bytefield("message_control", 0x2, 0x3, Attr::Rw),
    bytefield("message_address", 0x4, 0x7, Attr::Rw),
    bytefield("message_data", 0x8, 0x9, Attr::Rw),
    bytefield("reserved", 0xA, 0xB, Attr::Reserved),
];

pub fn new_msi_capability() -> Result<RegisterFile, CxlError> {
    let mut rf = RegisterFile::new(MSI_CAPABILITY_FIELDS, MSI_CAPABILITY_LEN)?;
    rf.init("capability_id", 0x05)?; // PCI MSI capability ID
    Ok(rf)
}

/// PCIe capability header (minimal): capability id/version plus device
/// capabilities/control/status fields relevant to link training
/// discovery.
pub const PCIE_CAPABILITY_LEN: usize = 0x3C;

const PCIE_CAPABILITY_FIELDS: &[FieldDesc] = &[
    bytefield("capability_id", 0x0, 0x0, Attr::Ro),
    bytefield("next_capability_pointer", 0x1, 0x1, Attr::Ro),
    bytefield("pcie_capabilities", 0x2, 0x3, Attr::Ro),
    bytefield("device_capabilities", 0x4, 0x7, Attr::Ro),
    bytefield("device_control", 0x8, 0x9, Attr::Rw),
    bytefield("device_status", 0xA, 0xB, Attr::Rw1c),
    bytefield("link_capabilities", 0xC, 0xF, Attr::Ro),
    bytefield("link_control", 0x10, 0x11, Attr::Rw),
    bytefield("link_status", 0x12, 0x13, Attr::Rw1c),
    bytefield("reserved", 0x14, 0x3B, Attr::Reserved),
];

pub fn new_pcie_capability() -> Result<RegisterFile, CxlError> {
    let mut rf = RegisterFile::new(PCIE_CAPABILITY_FIELDS, PCIE_CAPABILITY_LEN)?;
    rf.init("capability_id", 0x10)?; // PCI Express capability ID
    Ok(rf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_locator_finds_component_block() {
        let dvsec = RegisterLocatorDvsec::new(vec![
            RegisterBlockEntry {
                bar_index: 0,
                block_identifier: RegisterBlockIdentifier::Component,
                byte_offset: 0x1_0000,
            },
            RegisterBlockEntry {
                bar_index: 0,
                block_identifier: RegisterBlockIdentifier::Device,
                byte_offset: 0x2_0000,
            },
        ])
        .unwrap();
        let found = dvsec.find(RegisterBlockIdentifier::Device).unwrap();
        assert_eq!(found.byte_offset, 0x2_0000);
        assert_eq!(dvsec.header.read("dvsec_id").unwrap(), DVSEC_ID_REGISTER_LOCATOR as u64);
    }

    #[test]
    fn register_block_entry_roundtrips_through_wire_bytes() {
        let entry = RegisterBlockEntry {
            bar_index: 2,
            block_identifier: RegisterBlockIdentifier::Cdat,
            byte_offset: 0x1_2345_0000,
        };
        let bytes = encode_register_block_entry(&entry);
        assert_eq!(decode_register_block_entry(&bytes).unwrap(), entry);
    }

    #[test]
    fn doe_go_bit_is_write_1_to_clear() {
        let mut ctrl = new_doe_control().unwrap();
        ctrl.init("doe_go", 1).unwrap();
        ctrl.write("doe_go", 1).unwrap();
        assert_eq!(ctrl.read("doe_go").unwrap(), 0);
    }

    #[test]
    fn pcie_capability_reports_its_id() {
        let rf = new_pcie_capability().unwrap();
        assert_eq!(rf.read("capability_id").unwrap(), 0x10);
    }
}
