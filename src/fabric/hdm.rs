//! HDM (Host-managed Device Memory) decoders: the device flavor translates
//! a host physical address into a device physical address via
//! interleave-granularity/ways bit math; the switch flavor translates an
//! HPA into the downstream port index to forward to.

use crate::error::CxlError;

/// Decoded value of the `decoder_count` capability field, per the HDM
/// Decoder Capability register encoding: 0 -> 1, 1..=8 -> n*2, 9..=12 ->
/// (n-9)*4 + 20.
pub fn decoder_count_from_register(value: u8) -> Result<usize, CxlError> {
    match value {
        0 => Ok(1),
        1..=8 => Ok(value as usize * 2),
        9..=12 => Ok((value as usize - 9) * 4 + 20),
        other => Err(CxlError::Validation(format!(
            "undefined HDM decoder_count register value {other}"
        ))),
    }
}

fn bit_range(number: u64, start_bit: u32, end_bit: u32) -> u64 {
    let width = end_bit - start_bit + 1;
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    (number >> start_bit) & mask
}

/// Common decoder window: `[base, base + size)` in HPA space, programmed
/// by a `commit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderWindow {
    pub base: u64,
    pub size: u64,
    pub ig: u32,
    pub iw: u32,
}

impl DecoderWindow {
    pub fn is_hpa_in_range(&self, hpa: u64) -> bool {
        self.size != 0 && hpa >= self.base && hpa < self.base + self.size
    }
}

/// A single device-variant HDM decoder: HPA -> DPA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceHdmDecoder {
    pub index: usize,
    pub window: DecoderWindow,
    pub dpa_base: u64,
    pub dpa_skip: u64,
}

impl DeviceHdmDecoder {
    /// HPA -> DPA, per the interleave math: the low `ig+8` bits of the HPA
    /// offset pass through unchanged; the remaining high bits are
    /// de-interleaved across `2^iw` ways (or divided by 3 for the 3-way
    /// `iw >= 8` encoding) and reassembled above the granularity boundary.
    pub fn get_dpa(&self, hpa: u64) -> u64 {
        let hpa_offset = hpa.wrapping_sub(self.window.base);
        let low = bit_range(hpa_offset, 0, self.window.ig + 7);
        let high = if self.window.iw < 8 {
            bit_range(hpa_offset, self.window.ig + 8 + self.window.iw, 51)
        } else {
            bit_range(hpa_offset, self.window.ig + self.window.iw, 51) / 3
        };
        let dpa_offset = low | (high << (self.window.ig + 8));
        dpa_offset + self.dpa_base
    }
}

/// A single switch-variant HDM decoder: HPA -> downstream port index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchHdmDecoder {
    pub index: usize,
    pub window: DecoderWindow,
    pub target_ports: Vec<u8>,
}

impl SwitchHdmDecoder {
    pub fn get_target(&self, hpa: u64) -> Result<u8, CxlError> {
        let decoded_ig = 1u64 << (self.window.ig + 8);
        let decoded_iw = 1u64 << self.window.iw;
        let target_index = ((hpa / decoded_ig) % decoded_iw) as usize;
        self.target_ports
            .get(target_index)
            .copied()
            .ok_or_else(|| CxlError::Internal(format!("target index {target_index} out of bound")))
    }
}

/// Parameters for a decoder `commit` operation, as programmed through the
/// HDM Decoder component register set.
#[derive(Debug, Clone, Default)]
pub struct DecoderInfo {
    pub base: u64,
    pub size: u64,
    pub ig: u32,
    pub iw: u32,
    pub dpa_base: u64,
    pub dpa_skip: u64,
    pub target_ports: Vec<u8>,
}

/// Manages the fixed-size array of device-variant decoders for one
/// memory device (type-2/type-3 endpoint or LD).
#[derive(Debug, Clone)]
pub struct DeviceHdmDecoderManager {
    decoders: Vec<DeviceHdmDecoder>,
}

impl DeviceHdmDecoderManager {
    pub fn new(decoder_count_register: u8) -> Result<Self, CxlError> {
        let count = decoder_count_from_register(decoder_count_register)?;
        Ok(DeviceHdmDecoderManager {
            decoders: (0..count)
                .map(|index| DeviceHdmDecoder {
                    index,
                    ..Default::default()
                })
                .collect(),
        })
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn commit(&mut self, index: usize, info: DecoderInfo) -> Result<(), CxlError> {
        let decoder = self
            .decoders
            .get_mut(index)
            .ok_or_else(|| CxlError::Validation(format!("decoder index {index} out of bound")))?;
        decoder.dpa_base = info.dpa_base;
        decoder.dpa_skip = info.dpa_skip;
        decoder.window = DecoderWindow {
            base: info.base,
            size: info.size,
            ig: info.ig,
            iw: info.iw,
        };
        Ok(())
    }

    fn decoder_for_hpa(&self, hpa: u64) -> Option<&DeviceHdmDecoder> {
        self.decoders.iter().find(|d| d.window.is_hpa_in_range(hpa))
    }

    pub fn is_hpa_in_range(&self, hpa: u64) -> bool {
        self.decoder_for_hpa(hpa).is_some()
    }

    pub fn get_dpa(&self, hpa: u64) -> Option<u64> {
        self.decoder_for_hpa(hpa).map(|d| d.get_dpa(hpa))
    }
}

/// Manages the fixed-size array of switch-variant decoders for one
/// upstream port of a virtual switch.
#[derive(Debug, Clone)]
pub struct SwitchHdmDecoderManager {
    decoders: Vec<SwitchHdmDecoder>,
}

impl SwitchHdmDecoderManager {
    pub fn new(decoder_count_register: u8) -> Result<Self, CxlError> {
        let count = decoder_count_from_register(decoder_count_register)?;
        Ok(SwitchHdmDecoderManager {
            decoders: (0..count)
                .map(|index| SwitchHdmDecoder {
                    index,
                    ..Default::default()
                })
                .collect(),
        })
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn commit(&mut self, index: usize, info: DecoderInfo) -> Result<(), CxlError> {
        let decoder = self
            .decoders
            .get_mut(index)
            .ok_or_else(|| CxlError::Validation(format!("decoder index {index} out of bound")))?;
        decoder.window = DecoderWindow {
            base: info.base,
            size: info.size,
            ig: info.ig,
            iw: info.iw,
        };
        decoder.target_ports = info.target_ports;
        Ok(())
    }

    fn decoder_for_hpa(&self, hpa: u64) -> Option<&SwitchHdmDecoder> {
        self.decoders.iter().find(|d| d.window.is_hpa_in_range(hpa))
    }

    pub fn get_target(&self, hpa: u64) -> Option<Result<u8, CxlError>> {
        self.decoder_for_hpa(hpa).map(|d| d.get_target(hpa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_count_boundaries() {
        assert_eq!(decoder_count_from_register(0).unwrap(), 1);
        assert_eq!(decoder_count_from_register(1).unwrap(), 2);
        assert_eq!(decoder_count_from_register(8).unwrap(), 16);
        assert_eq!(decoder_count_from_register(9).unwrap(), 20);
        assert_eq!(decoder_count_from_register(12).unwrap(), 32);
        assert!(decoder_count_from_register(13).is_err());
    }

    #[test]
    fn device_decoder_get_dpa_no_interleave() {
        let mut mgr = DeviceHdmDecoderManager::new(0).unwrap();
        mgr.commit(
            0,
            DecoderInfo {
                base: 0x1_0000_0000,
                size: 0x1000_0000,
                ig: 0,
                iw: 0,
                dpa_base: 0,
                dpa_skip: 0,
                target_ports: vec![],
            },
        )
        .unwrap();
        let hpa = 0x1_0000_1000;
        assert_eq!(mgr.get_dpa(hpa).unwrap(), 0x1000);
        assert!(mgr.is_hpa_in_range(hpa));
        assert!(!mgr.is_hpa_in_range(0x2_0000_0000));
    }

    #[test]
    fn device_decoder_applies_nonzero_dpa_base() {
        let mut mgr = DeviceHdmDecoderManager::new(0).unwrap();
        mgr.commit(
            0,
            DecoderInfo {
                base: 0x1_0000_0000,
                size: 0x1000_0000,
                ig: 0,
                iw: 0,
                dpa_base: 0x4000,
                dpa_skip: 0,
                target_ports: vec![],
            },
        )
        .unwrap();
        assert_eq!(mgr.get_dpa(0x1_0000_1000).unwrap(), 0x5000);
    }

    #[test]
    fn switch_decoder_two_way_interleave_alternates_targets() {
        let mut mgr = SwitchHdmDecoderManager::new(0).unwrap();
        mgr.commit(
            0,
            DecoderInfo {
                base: 0,
                size: 0x10_0000_0000,
                ig: 0,
                iw: 1,
                dpa_base: 0,
                dpa_skip: 0,
                target_ports: vec![3, 5],
            },
        )
        .unwrap();
        assert_eq!(mgr.get_target(0).unwrap().unwrap(), 3);
        assert_eq!(mgr.get_target(256).unwrap().unwrap(), 5);
        assert_eq!(mgr.get_target(512).unwrap().unwrap(), 3);
    }

    #[test]
    fn out_of_range_hpa_returns_none() {
        let mgr = DeviceHdmDecoderManager::new(0).unwrap();
        assert!(mgr.get_dpa(0x1234).is_none());
    }
}
