//! CXL Component Registers: the HDM Decoder capability/control block is
//! modeled in full (it drives [`crate::fabric::hdm`]); RAS, Link, BI
//! Decoder, BI Route Table and Cache-ID Decoder/RT are carried as
//! minimal fixed-size register files since no command in the current
//! command set reaches into their bits beyond capability discovery.

use crate::error::CxlError;
use crate::layout::{bitfield, bytefield, Attr, FieldDesc, RegisterFile};

pub const HDM_DECODER_CAPABILITY_LEN: usize = 4;
pub const HDM_DECODER_CONTROL_LEN: usize = 0x20;

const HDM_DECODER_CAPABILITY_FIELDS: &[FieldDesc] = &[
    bitfield("decoder_count", 0, 3, Attr::Ro),
    bitfield("target_count", 4, 7, Attr::Ro),
    bytefield("capability_flags", 1, 3, Attr::Ro),
];

/// One decoder's `{base_low, base_high, size_low, size_high, control,
/// target_list}` register set, per the HDM Decoder capability structure.
const HDM_DECODER_CONTROL_FIELDS: &[FieldDesc] = &[
    bytefield("base_low", 0x0, 0x3, Attr::Rw),
    bytefield("base_high", 0x4, 0x7, Attr::Rw),
    bytefield("size_low", 0x8, 0xB, Attr::Rw),
    bytefield("size_high", 0xC, 0xF, Attr::Rw),
    bytefield("control", 0x10, 0x13, Attr::Rw),
    bytefield("target_list_low", 0x14, 0x17, Attr::Rw),
    bytefield("target_list_high", 0x18, 0x1B, Attr::Rw),
    bytefield("dpa_skip_low", 0x1C, 0x1F, Attr::Rw),
];

/// The HDM Decoder capability header plus one control block per decoder.
pub struct HdmDecoderRegisters {
    pub capability: RegisterFile,
    pub decoders: Vec<RegisterFile>,
}

impl HdmDecoderRegisters {
    pub fn new(decoder_count_register: u8) -> Result<Self, CxlError> {
        let count = crate::fabric::hdm::decoder_count_from_register(decoder_count_register)?;
        let mut capability = RegisterFile::new(HDM_DECODER_CAPABILITY_FIELDS, HDM_DECODER_CAPABILITY_LEN)?;
        capability.init("decoder_count", decoder_count_register as u64)?;
        let decoders = (0..count)
            .map(|_| RegisterFile::new(HDM_DECODER_CONTROL_FIELDS, HDM_DECODER_CONTROL_LEN))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HdmDecoderRegisters { capability, decoders })
    }
}

/// RAS (RAS Capability) register block: just enough fields for a read to
/// discover the uncorrectable/correctable error status layout exists.
pub const RAS_REGISTERS_LEN: usize = 0x60;

const RAS_FIELDS: &[FieldDesc] = &[
    bytefield("uncorrectable_error_status", 0x00, 0x03, Attr::Rw1c),
    bytefield("uncorrectable_error_mask", 0x04, 0x07, Attr::Rw),
    bytefield("uncorrectable_error_severity", 0x08, 0x0B, Attr::Rw),
    bytefield("correctable_error_status", 0x0C, 0x0F, Attr::Rw1c),
    bytefield("correctable_error_mask", 0x10, 0x13, Attr::Rw),
    bytefield("reserved", 0x14, 0x5F, Attr::Reserved),
];

pub fn new_ras_registers() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(RAS_FIELDS, RAS_REGISTERS_LEN)
}

/// Link capability/control/status register block (minimal).
pub const LINK_REGISTERS_LEN: usize = 0x08;

const LINK_FIELDS: &[FieldDesc] = &[
    bytefield("link_capability", 0x00, 0x03, Attr::Ro),
    bytefield("link_control", 0x04, 0x05, Attr::Rw),
    bytefield("link_status", 0x06, 0x07, Attr::Rw1c),
];

pub fn new_link_registers() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(LINK_FIELDS, LINK_REGISTERS_LEN)
}

/// BI (Back-Invalidate) Decoder capability/control (minimal).
pub const BI_DECODER_REGISTERS_LEN: usize = 0x08;

const BI_DECODER_FIELDS: &[FieldDesc] = &[
    bytefield("bi_capability", 0x00, 0x03, Attr::Ro),
    bytefield("bi_control", 0x04, 0x07, Attr::Rw),
];

pub fn new_bi_decoder_registers() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(BI_DECODER_FIELDS, BI_DECODER_REGISTERS_LEN)
}

/// BI Route Table register block (minimal).
pub const BI_ROUTE_TABLE_REGISTERS_LEN: usize = 0x08;

const BI_ROUTE_TABLE_FIELDS: &[FieldDesc] = &[
    bytefield("bi_rt_capability", 0x00, 0x03, Attr::Ro),
    bytefield("bi_rt_control", 0x04, 0x07, Attr::Rw),
];

pub fn new_bi_route_table_registers() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(BI_ROUTE_TABLE_FIELDS, BI_ROUTE_TABLE_REGISTERS_LEN)
}

/// Cache-ID Decoder / Routing Table register block (minimal; used by
/// multi-logical-device switches to steer CXL.mem/CXL.cache traffic by
/// `ld_id`).
pub const CACHE_ID_RT_REGISTERS_LEN: usize = 0x08;

const CACHE_ID_RT_FIELDS: &[FieldDesc] = &[
    bytefield("cache_id_rt_capability", 0x00, 0x03, Attr::Ro),
    bytefield("cache_id_rt_control", 0x04, 0x07, Attr::Rw),
];

pub fn new_cache_id_rt_registers() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(CACHE_ID_RT_FIELDS, CACHE_ID_RT_REGISTERS_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hdm_decoder_registers_sizes_array_to_decoder_count() {
        let regs = HdmDecoderRegisters::new(1).unwrap(); // register value 1 -> 2 decoders
        assert_eq!(regs.decoders.len(), 2);
    }

    #[test]
    fn hdm_decoder_control_base_size_roundtrip() {
        let mut regs = HdmDecoderRegisters::new(0).unwrap();
        regs.decoders[0].write("base_low", 0xABCD0000).unwrap();
        regs.decoders[0].write("size_low", 0x1000_0000).unwrap();
        assert_eq!(regs.decoders[0].read("base_low").unwrap(), 0xABCD0000);
        assert_eq!(regs.decoders[0].read("size_low").unwrap(), 0x1000_0000);
    }

    #[test]
    fn ras_uncorrectable_status_is_write_1_to_clear() {
        let mut ras = new_ras_registers().unwrap();
        ras.init("uncorrectable_error_status", 0x1).unwrap();
        ras.write("uncorrectable_error_status", 0x1).unwrap();
        assert_eq!(ras.read("uncorrectable_error_status").unwrap(), 0);
    }
}
