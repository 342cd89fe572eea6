//! CXL Device Registers: the capability array header devices expose so a
//! host can walk to the mailbox/device-status/memory-device-status
//! capabilities, plus the mailbox register set itself (doorbell, command,
//! status, payload window) that backs [`crate::mailbox::CxlMailbox`].

use crate::error::CxlError;
use crate::layout::{bitfield, bytefield, Attr, FieldDesc, RegisterFile};

pub const CAPABILITY_HEADER_LEN: usize = 0x10;

const CAPABILITY_HEADER_FIELDS: &[FieldDesc] = &[
    bytefield("capability_id", 0x0, 0x1, Attr::Ro),
    bytefield("capability_count", 0x2, 0x3, Attr::Ro),
    bytefield("reserved", 0x4, 0xF, Attr::Reserved),
];

/// The fixed-size array header a device places at the start of its
/// register block, describing how many capability entries follow.
pub fn new_capability_header(capability_count: u16) -> Result<RegisterFile, CxlError> {
    let mut rf = RegisterFile::new(CAPABILITY_HEADER_FIELDS, CAPABILITY_HEADER_LEN)?;
    rf.init("capability_id", 0x0002)?; // Device Capabilities Array
    rf.init("capability_count", capability_count as u64)?;
    Ok(rf)
}

pub const MAILBOX_CAPABILITY_LEN: usize = 0x4;
pub const MAILBOX_CONTROL_LEN: usize = 0x4;
pub const MAILBOX_STATUS_LEN: usize = 0x8;
pub const MAILBOX_COMMAND_LEN: usize = 0x4;

const MAILBOX_CAPABILITY_FIELDS: &[FieldDesc] = &[
    bitfield("payload_size", 0, 4, Attr::Ro),
    bitfield("mb_doorbell_interrupt_capable", 5, 5, Attr::Ro),
    bitfield("background_command_complete_interrupt_capable", 6, 6, Attr::Ro),
    bitfield("interrupt_message_number", 7, 10, Attr::Ro),
    bitfield("reserved", 11, 31, Attr::Reserved),
];

pub fn new_mailbox_capability(payload_size: u8, doorbell_interrupt_capable: bool) -> Result<RegisterFile, CxlError> {
    let mut rf = RegisterFile::new(MAILBOX_CAPABILITY_FIELDS, MAILBOX_CAPABILITY_LEN)?;
    rf.init("payload_size", payload_size as u64)?;
    rf.init("mb_doorbell_interrupt_capable", doorbell_interrupt_capable as u64)?;
    Ok(rf)
}

const MAILBOX_CONTROL_FIELDS: &[FieldDesc] = &[
    bitfield("doorbell", 0, 0, Attr::Rw),
    bitfield("mb_doorbell_interrupt", 1, 1, Attr::Rw),
    bitfield("background_command_complete_interrupt", 2, 2, Attr::Rw),
    bitfield("reserved", 3, 31, Attr::Reserved),
];

pub fn new_mailbox_control() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(MAILBOX_CONTROL_FIELDS, MAILBOX_CONTROL_LEN)
}

const MAILBOX_COMMAND_FIELDS: &[FieldDesc] = &[
    bitfield("command_opcode", 0, 15, Attr::Rw),
    bitfield("payload_length", 16, 31, Attr::Rw),
];

pub fn new_mailbox_command() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(MAILBOX_COMMAND_FIELDS, MAILBOX_COMMAND_LEN)
}

const MAILBOX_STATUS_FIELDS: &[FieldDesc] = &[
    bitfield("background_operation", 0, 0, Attr::Ro),
    bitfield("reserved0", 1, 31, Attr::Reserved),
    bitfield("return_code", 32, 47, Attr::Ro),
    bitfield("vendor_specific_extended_status", 48, 63, Attr::Ro),
];

pub fn new_mailbox_status() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(MAILBOX_STATUS_FIELDS, MAILBOX_STATUS_LEN)
}

/// Device Status register (minimal): just the reset-needed/media-ready
/// bits a host polls before issuing memory-device commands.
pub const DEVICE_STATUS_LEN: usize = 0x4;

const DEVICE_STATUS_FIELDS: &[FieldDesc] = &[
    bitfield("media_ready", 0, 1, Attr::Ro),
    bitfield("fw_halt", 2, 2, Attr::Ro),
    bitfield("reserved", 3, 31, Attr::Reserved),
];

pub fn new_device_status() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(DEVICE_STATUS_FIELDS, DEVICE_STATUS_LEN)
}

/// Memory Device Status register (minimal).
pub const MEMORY_DEVICE_STATUS_LEN: usize = 0x4;

const MEMORY_DEVICE_STATUS_FIELDS: &[FieldDesc] = &[
    bitfield("device_fatal", 0, 0, Attr::Ro),
    bitfield("fw_halt", 1, 1, Attr::Ro),
    bitfield("media_status", 2, 3, Attr::Ro),
    bitfield("mailbox_interfaces_ready", 4, 4, Attr::Ro),
    bitfield("reset_needed", 5, 7, Attr::Ro),
    bitfield("reserved", 8, 31, Attr::Reserved),
];

pub fn new_memory_device_status() -> Result<RegisterFile, CxlError> {
    RegisterFile::new(MEMORY_DEVICE_STATUS_FIELDS, MEMORY_DEVICE_STATUS_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_header_reports_count() {
        let rf = new_capability_header(3).unwrap();
        assert_eq!(rf.read("capability_count").unwrap(), 3);
    }

    #[test]
    fn mailbox_capability_reports_payload_size() {
        let rf = new_mailbox_capability(11, true).unwrap();
        assert_eq!(rf.read("payload_size").unwrap(), 11);
        assert_eq!(rf.read("mb_doorbell_interrupt_capable").unwrap(), 1);
    }

    #[test]
    fn mailbox_control_doorbell_roundtrips() {
        let mut rf = new_mailbox_control().unwrap();
        rf.write("doorbell", 1).unwrap();
        assert_eq!(rf.read("doorbell").unwrap(), 1);
    }
}
