//! PCIe configuration space: the common type-0/type-1 header fields every
//! port and device exposes at config-space offset 0, laid out on the
//! [`crate::layout`] engine.

use crate::error::CxlError;
use crate::layout::{bytefield, Attr, FieldDesc, RegisterFile};

pub const PCI_CONFIG_HEADER_LEN: usize = 64;

/// Type-0 (endpoint) config-space header: BARs plus the capabilities
/// pointer and interrupt wiring.
pub const TYPE0_FIELDS: &[FieldDesc] = &[
    bytefield("vendor_id", 0, 1, Attr::Ro),
    bytefield("device_id", 2, 3, Attr::Ro),
    bytefield("command", 4, 5, Attr::Rw),
    bytefield("status", 6, 7, Attr::Rw1c),
    bytefield("revision_id", 8, 8, Attr::Ro),
    bytefield("class_code", 9, 11, Attr::Ro),
    bytefield("cache_line_size", 12, 12, Attr::Rw),
    bytefield("latency_timer", 13, 13, Attr::Ro),
    bytefield("header_type", 14, 14, Attr::Ro),
    bytefield("bist", 15, 15, Attr::Rw),
    bytefield("bar0", 16, 19, Attr::Rw),
    bytefield("bar1", 20, 23, Attr::Rw),
    bytefield("bar2", 24, 27, Attr::Rw),
    bytefield("bar3", 28, 31, Attr::Rw),
    bytefield("bar4", 32, 35, Attr::Rw),
    bytefield("bar5", 36, 39, Attr::Rw),
    bytefield("cardbus_cis_pointer", 40, 43, Attr::Ro),
    bytefield("subsystem_vendor_id", 44, 45, Attr::Ro),
    bytefield("subsystem_id", 46, 47, Attr::Ro),
    bytefield("expansion_rom_base_address", 48, 51, Attr::Rw),
    bytefield("capabilities_pointer", 52, 52, Attr::Ro),
    bytefield("reserved0", 53, 55, Attr::Reserved),
    bytefield("interrupt_line", 56, 56, Attr::Rw),
    bytefield("interrupt_pin", 57, 57, Attr::Ro),
    bytefield("min_gnt", 58, 58, Attr::Ro),
    bytefield("max_lat", 59, 59, Attr::Ro),
    bytefield("reserved1", 60, 63, Attr::Reserved),
];

/// Type-1 (bridge) config-space header: primary/secondary/subordinate bus
/// numbers plus the memory base/limit window a vPPB is routed by.
pub const TYPE1_FIELDS: &[FieldDesc] = &[
    bytefield("vendor_id", 0, 1, Attr::Ro),
    bytefield("device_id", 2, 3, Attr::Ro),
    bytefield("command", 4, 5, Attr::Rw),
    bytefield("status", 6, 7, Attr::Rw1c),
    bytefield("revision_id", 8, 8, Attr::Ro),
    bytefield("class_code", 9, 11, Attr::Ro),
    bytefield("cache_line_size", 12, 12, Attr::Rw),
    bytefield("latency_timer", 13, 13, Attr::Ro),
    bytefield("header_type", 14, 14, Attr::Ro),
    bytefield("bist", 15, 15, Attr::Rw),
    bytefield("bar0", 16, 19, Attr::Rw),
    bytefield("bar1", 20, 23, Attr::Rw),
    bytefield("primary_bus_number", 24, 24, Attr::Rw),
    bytefield("secondary_bus_number", 25, 25, Attr::Rw),
    bytefield("subordinate_bus_number", 26, 26, Attr::Rw),
    bytefield("secondary_latency_timer", 27, 27, Attr::Ro),
    bytefield("io_base", 28, 28, Attr::Rw),
    bytefield("io_limit", 29, 29, Attr::Rw),
    bytefield("secondary_status", 30, 31, Attr::Rw1c),
    bytefield("memory_base", 32, 33, Attr::Rw),
    bytefield("memory_limit", 34, 35, Attr::Rw),
    bytefield("prefetchable_memory_base", 36, 37, Attr::Rw),
    bytefield("prefetchable_memory_limit", 38, 39, Attr::Rw),
    bytefield("prefetchable_base_upper", 40, 43, Attr::Rw),
    bytefield("prefetchable_limit_upper", 44, 47, Attr::Rw),
    bytefield("io_base_upper", 48, 49, Attr::Rw),
    bytefield("io_limit_upper", 50, 51, Attr::Rw),
    bytefield("capabilities_pointer", 52, 52, Attr::Ro),
    bytefield("reserved0", 53, 55, Attr::Reserved),
    bytefield("expansion_rom_base_address", 56, 59, Attr::Rw),
    bytefield("interrupt_line", 60, 60, Attr::Rw),
    bytefield("interrupt_pin", 61, 61, Attr::Ro),
    bytefield("bridge_control", 62, 63, Attr::Rw),
];

/// Either header shape, keyed by whether the owning port is an endpoint
/// or a bridge. The DVSEC/DOE/MSI extended capability chain beyond offset
/// 64 is appended by the owning component; this module only models the
/// fixed common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Type0,
    Type1,
}

pub fn new_config_space(header_type: HeaderType, total_len: usize) -> Result<RegisterFile, CxlError> {
    let fields = match header_type {
        HeaderType::Type0 => TYPE0_FIELDS,
        HeaderType::Type1 => TYPE1_FIELDS,
    };
    let mut rf = RegisterFile::new(fields, total_len)?;
    rf.init("header_type", match header_type {
        HeaderType::Type0 => 0,
        HeaderType::Type1 => 1,
    })?;
    Ok(rf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type0_reports_header_type_zero() {
        let rf = new_config_space(HeaderType::Type0, 256).unwrap();
        assert_eq!(rf.read("header_type").unwrap(), 0);
    }

    #[test]
    fn type1_bus_numbers_roundtrip() {
        let mut rf = new_config_space(HeaderType::Type1, 256).unwrap();
        rf.write("secondary_bus_number", 3).unwrap();
        rf.write("subordinate_bus_number", 9).unwrap();
        assert_eq!(rf.read("secondary_bus_number").unwrap(), 3);
        assert_eq!(rf.read("subordinate_bus_number").unwrap(), 9);
    }

    #[test]
    fn status_register_is_write_1_to_clear() {
        let mut rf = new_config_space(HeaderType::Type0, 256).unwrap();
        rf.init("status", 0xFFFF).unwrap();
        rf.write("status", 0x0001).unwrap();
        assert_eq!(rf.read("status").unwrap(), 0xFFFE);
    }
}
