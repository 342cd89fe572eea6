//! Byte-Layout Engine.
//!
//! A declarative description of a register-file structure as an ordered
//! list of named bit- or byte-ranges with read/write attributes. This is
//! the primitive register files (`regs/*`) are built on: PCI config space,
//! PCIe extended capabilities, and the CXL component/device register
//! blocks all describe themselves as a `&'static [FieldDesc]` and let this
//! module do the masked read/write arithmetic.
//!
//! Packet headers on the wire (`packet/*`) are dynamically sized and are
//! modeled instead as plain Rust structs with explicit encode/decode
//! methods, per the flattening called out for dynamic tails; this module's
//! bit-level helpers are reused there too so the two layers agree on byte
//! order.

use crate::error::CxlError;

/// Write semantics for a field, derived once from its declared attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    /// Plain read-write.
    Rw,
    /// Read-write, sticky across some reset domains. Treated as `Rw` here;
    /// the emulator has no reset-domain model.
    Rws,
    /// Read-write-lockable. Treated as `Rw`; no lock enforcement is
    /// currently wired up (see DESIGN.md).
    Rwl,
    /// Read-write-once. Treated as `Rw`.
    Rwo,
    /// Read-only; writes are ignored.
    Ro,
    /// Write-1-to-clear: a 1 bit in the written value clears the
    /// corresponding stored bit.
    Rw1c,
    /// Write-1-to-clear, sticky. Same write semantics as `Rw1c`.
    Rw1cs,
    /// Reserved; writes ignored, reads return the stored (default) value.
    Reserved,
    /// Hardware-initialized; writes ignored.
    HwInit,
}

impl Attr {
    fn is_rw1c(self) -> bool {
        matches!(self, Attr::Rw1c | Attr::Rw1cs)
    }

    fn writes_verbatim(self) -> bool {
        matches!(self, Attr::Rw | Attr::Rws | Attr::Rwl | Attr::Rwo)
    }
}

/// The shape of a field: which bits or bytes of the structure it occupies.
///
/// Only fixed-size ranges are modeled; a structure whose tail is
/// variable-length (a dynamic byte array, or a repeated sub-structure
/// whose count depends on another field) is not expressible as a
/// `FieldKind` and is instead laid out by hand as a plain struct with its
/// own encode/decode, the way `regs/pcie_ext.rs`'s Register Locator DVSEC
/// entries are (see DESIGN.md).
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// An arbitrary bit range `[start_bit, end_bit]`, inclusive, counted
    /// from the start of the structure (bit 0 is the LSB of byte 0).
    Bit { start_bit: usize, end_bit: usize },
    /// A byte range `[start_byte, end_byte]`, inclusive, read/written
    /// little-endian.
    Byte { start_byte: usize, end_byte: usize },
}

impl FieldKind {
    fn bit_range(&self) -> (usize, usize) {
        match *self {
            FieldKind::Bit { start_bit, end_bit } => (start_bit, end_bit),
            FieldKind::Byte {
                start_byte,
                end_byte,
            } => (start_byte * 8, end_byte * 8 + 7),
        }
    }
}

/// One named field in a layout.
#[derive(Debug, Clone, Copy)]
pub struct FieldDesc {
    pub name: &'static str,
    pub kind: FieldKind,
    pub attr: Attr,
}

pub const fn bitfield(name: &'static str, start_bit: usize, end_bit: usize, attr: Attr) -> FieldDesc {
    FieldDesc {
        name,
        kind: FieldKind::Bit { start_bit, end_bit },
        attr,
    }
}

pub const fn bytefield(name: &'static str, start_byte: usize, end_byte: usize, attr: Attr) -> FieldDesc {
    FieldDesc {
        name,
        kind: FieldKind::Byte {
            start_byte,
            end_byte,
        },
        attr,
    }
}

/// Validate that `fields` are contiguous and that bit fields round out
/// whole bytes when the structure ends, per the Byte-Layout Engine's
/// construction rules. Fields may be given in any order; validation sorts
/// a copy by start bit.
pub fn validate(fields: &[FieldDesc]) -> Result<(), CxlError> {
    if fields.is_empty() {
        return Ok(());
    }
    let mut ranges: Vec<(usize, usize, &'static str)> = fields
        .iter()
        .map(|f| {
            let (s, e) = f.kind.bit_range();
            (s, e, f.name)
        })
        .collect();
    ranges.sort_by_key(|(s, _, _)| *s);

    let mut expected_start = 0usize;
    for (start, end, name) in &ranges {
        if *start != expected_start {
            return Err(CxlError::Internal(format!(
                "invalid layout: field `{name}` starts at bit {start}, expected {expected_start}"
            )));
        }
        if end < start {
            return Err(CxlError::Internal(format!(
                "invalid layout: field `{name}` has end < start"
            )));
        }
        expected_start = end + 1;
    }
    if expected_start % 8 != 0 {
        return Err(CxlError::Internal(format!(
            "invalid layout: fields cover {expected_start} bits, not a whole number of bytes"
        )));
    }
    Ok(())
}

/// Total size in bytes implied by a fully-static (no dynamic tail) field
/// list.
pub fn static_size_bytes(fields: &[FieldDesc]) -> usize {
    fields
        .iter()
        .map(|f| f.kind.bit_range().1 + 1)
        .max()
        .unwrap_or(0)
        .div_ceil(8)
}

fn read_bits(buf: &[u8], start_bit: usize, width: usize) -> u64 {
    let mut result: u64 = 0;
    for i in 0..width {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        if byte_idx >= buf.len() {
            break;
        }
        let bit = (buf[byte_idx] >> (bit_pos % 8)) & 1;
        result |= (bit as u64) << i;
    }
    result
}

fn write_bits_raw(buf: &mut [u8], start_bit: usize, width: usize, value: u64) {
    for i in 0..width {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        if byte_idx >= buf.len() {
            break;
        }
        let bit = ((value >> i) & 1) as u8;
        if bit == 1 {
            buf[byte_idx] |= 1 << (bit_pos % 8);
        } else {
            buf[byte_idx] &= !(1 << (bit_pos % 8));
        }
    }
}

/// A byte-backed register file described by a static `FieldDesc` table.
/// `RegisterFile` is the runtime counterpart of the Byte-Layout Engine:
/// construction validates the layout, and every subsequent read/write goes
/// through the attribute-driven masking rules in §4.1.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub buf: Vec<u8>,
    fields: &'static [FieldDesc],
}

impl RegisterFile {
    pub fn new(fields: &'static [FieldDesc], size: usize) -> Result<Self, CxlError> {
        validate(fields)?;
        Ok(RegisterFile {
            buf: vec![0u8; size],
            fields,
        })
    }

    fn field(&self, name: &str) -> Result<&FieldDesc, CxlError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CxlError::Internal(format!("unknown register field `{name}`")))
    }

    pub fn read(&self, name: &str) -> Result<u64, CxlError> {
        let field = self.field(name)?;
        let (start, end) = field.kind.bit_range();
        Ok(read_bits(&self.buf, start, end - start + 1))
    }

    /// Apply a masked write per §4.1: RO/HW_INIT/RESERVED ignore the
    /// write; RW-family fields store the value verbatim; RW1C-family
    /// fields clear the stored bits that are 1 in `value`.
    pub fn write(&mut self, name: &str, value: u64) -> Result<(), CxlError> {
        let field = *self.field(name)?;
        let (start, end) = field.kind.bit_range();
        let width = end - start + 1;
        match field.attr {
            Attr::Ro | Attr::HwInit | Attr::Reserved => {}
            Attr::Rw1c | Attr::Rw1cs => {
                let current = read_bits(&self.buf, start, width);
                let cleared = current & !value;
                write_bits_raw(&mut self.buf, start, width, cleared);
            }
            _ if field.attr.writes_verbatim() => {
                write_bits_raw(&mut self.buf, start, width, value);
            }
            _ => {}
        }
        Ok(())
    }

    /// Raw, unattributed write straight into the backing buffer. Used by
    /// the owning component to program HW_INIT/RO fields (e.g. populating
    /// a capability ID at construction time) without going through the
    /// masked `write` path.
    pub fn init(&mut self, name: &str, value: u64) -> Result<(), CxlError> {
        let field = self.field(name)?;
        let (start, end) = field.kind.bit_range();
        write_bits_raw(&mut self.buf, start, end - start + 1, value);
        Ok(())
    }

    pub fn read_bytes(&self, start_byte: usize, len: usize) -> &[u8] {
        &self.buf[start_byte..start_byte + len]
    }

    /// Masked byte-range write used by MMIO/config-space accessors that
    /// write an arbitrary sub-range rather than a single named field: any
    /// RW1C bit covered by `mask` clears, any plain-RW bit covered by
    /// `mask` is overwritten, anything outside `mask` is preserved.
    pub fn write_bytes_masked(&mut self, start_byte: usize, data: &[u8], mask: &[u8]) {
        for (i, (&d, &m)) in data.iter().zip(mask.iter()).enumerate() {
            let idx = start_byte + i;
            if idx >= self.buf.len() {
                break;
            }
            self.buf[idx] = (self.buf[idx] & !m) | (d & m);
        }
    }

    /// Byte-addressed write with no named field, as MMIO traffic arrives:
    /// for each byte, bits covered by a plain RW-family field are
    /// overwritten, bits covered by an RW1C-family field are
    /// write-1-to-cleared, everything else (RO/RESERVED/HW_INIT, or bits
    /// past the end of the structure) is left untouched.
    pub fn write_bytes_mmio(&mut self, start_byte: usize, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let idx = start_byte + i;
            if idx >= self.buf.len() {
                break;
            }
            let mut rw_mask = 0u8;
            let mut rw1c_mask = 0u8;
            for bit in 0..8 {
                let bit_pos = idx * 8 + bit;
                if let Some(field) = self
                    .fields
                    .iter()
                    .find(|f| {
                        let (s, e) = f.kind.bit_range();
                        bit_pos >= s && bit_pos <= e
                    })
                {
                    if field.attr.writes_verbatim() {
                        rw_mask |= 1 << bit;
                    } else if field.attr.is_rw1c() {
                        rw1c_mask |= 1 << bit;
                    }
                }
            }
            let current = self.buf[idx];
            let mut updated = (current & !rw_mask) | (byte & rw_mask);
            updated &= !(byte & rw1c_mask);
            self.buf[idx] = updated;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_FIELDS: &[FieldDesc] = &[
        bitfield("ig", 0, 3, Attr::Rw),
        bitfield("iw", 4, 7, Attr::Rw),
        bitfield("lock_on_commit", 8, 8, Attr::Rw),
        bitfield("commit", 9, 9, Attr::Rw),
        bitfield("committed", 10, 10, Attr::Ro),
        bitfield("error_not_committed", 11, 11, Attr::Rw1c),
        bitfield("target_type", 12, 12, Attr::Rw),
        bitfield("bi", 13, 13, Attr::Rw),
        bitfield("uio", 14, 14, Attr::Rw),
        bitfield("rsvd", 15, 31, Attr::Reserved),
    ];

    #[test]
    fn validates_contiguous_fields() {
        assert!(validate(TEST_FIELDS).is_ok());
    }

    #[test]
    fn rejects_gap() {
        let bad: &[FieldDesc] = &[bitfield("a", 0, 6, Attr::Rw), bitfield("b", 8, 15, Attr::Rw)];
        assert!(validate(bad).is_err());
    }

    #[test]
    fn rejects_partial_last_byte() {
        let bad: &[FieldDesc] = &[bitfield("a", 0, 6, Attr::Rw)];
        assert!(validate(bad).is_err());
    }

    #[test]
    fn write_then_read_roundtrips_rw_field() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.write("ig", 0xA).unwrap();
        assert_eq!(rf.read("ig").unwrap(), 0xA);
        rf.write("iw", 0xF).unwrap();
        assert_eq!(rf.read("ig").unwrap(), 0xA);
        assert_eq!(rf.read("iw").unwrap(), 0xF);
    }

    #[test]
    fn reserved_bits_ignore_writes() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.write("rsvd", 0xFFFF).unwrap();
        assert_eq!(rf.read("rsvd").unwrap(), 0);
    }

    #[test]
    fn read_only_field_ignores_writes() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.init("committed", 1).unwrap();
        rf.write("committed", 0).unwrap();
        assert_eq!(rf.read("committed").unwrap(), 1);
    }

    #[test]
    fn rw1c_clears_on_write_of_one() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.init("error_not_committed", 1).unwrap();
        assert_eq!(rf.read("error_not_committed").unwrap(), 1);
        rf.write("error_not_committed", 1).unwrap();
        assert_eq!(rf.read("error_not_committed").unwrap(), 0);
    }

    #[test]
    fn mmio_write_respects_field_attributes() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.init("committed", 1).unwrap();
        rf.init("error_not_committed", 1).unwrap();
        // byte 1 covers lock_on_commit(rw)/commit(rw)/committed(ro)/error_not_committed(rw1c)
        rf.write_bytes_mmio(1, &[0b1111_1111]);
        assert_eq!(rf.read("lock_on_commit").unwrap(), 1);
        assert_eq!(rf.read("commit").unwrap(), 1);
        assert_eq!(rf.read("committed").unwrap(), 1); // RO untouched
        assert_eq!(rf.read("error_not_committed").unwrap(), 0); // RW1C cleared
    }

    #[test]
    fn rw1c_write_of_zero_is_noop() {
        let mut rf = RegisterFile::new(TEST_FIELDS, 4).unwrap();
        rf.init("error_not_committed", 1).unwrap();
        rf.write("error_not_committed", 0).unwrap();
        assert_eq!(rf.read("error_not_committed").unwrap(), 1);
    }
}
