//! PCI routing table: per-port BDF bus-range and MMIO base/limit/BAR-window
//! entries a virtual switch consults to pick the downstream port a
//! `CfgRd`/`CfgWr`/`MemRd`/`MemWr` packet should be forwarded to.

use crate::error::CxlError;

const BRIDGE_MAX_BARS: usize = 2;

fn extract_bus_from_bdf(bdf: u16) -> u8 {
    (bdf >> 8) as u8
}

fn extract_device_from_bdf(bdf: u16) -> u8 {
    ((bdf >> 3) & 0x1F) as u8
}

#[derive(Debug, Clone, Copy, Default)]
struct BarEntry {
    base: u64,
    limit: u64,
}

impl BarEntry {
    fn contains(&self, addr: u64) -> bool {
        self.limit != 0 && self.base <= addr && addr <= self.limit
    }
}

#[derive(Debug, Clone)]
struct MmioEntry {
    bars: [BarEntry; BRIDGE_MAX_BARS],
    base: u64,
    limit: u64,
}

impl Default for MmioEntry {
    fn default() -> Self {
        MmioEntry {
            bars: [BarEntry::default(); BRIDGE_MAX_BARS],
            base: 0,
            limit: 0,
        }
    }
}

impl MmioEntry {
    fn contains(&self, addr: u64) -> bool {
        self.bars.iter().any(|b| b.contains(addr)) || (self.limit != 0 && self.base <= addr && addr <= self.limit)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConfigSpaceEntry {
    secondary_bus: u8,
    subordinate_bus: u8,
}

/// One routing table per upstream port of a virtual switch, indexed by
/// downstream port number.
#[derive(Debug, Clone)]
pub struct PciRoutingTable {
    router_bus_number: Option<u8>,
    mmio_table: Vec<MmioEntry>,
    config_space_table: Vec<(ConfigSpaceEntry, bool)>,
}

impl PciRoutingTable {
    pub fn new(table_size: usize) -> Self {
        PciRoutingTable {
            router_bus_number: None,
            mmio_table: (0..table_size).map(|_| MmioEntry::default()).collect(),
            config_space_table: vec![(ConfigSpaceEntry::default(), true); table_size],
        }
    }

    fn check_port_number(&self, port_number: usize) -> Result<(), CxlError> {
        if port_number >= self.mmio_table.len() {
            return Err(CxlError::Validation(format!(
                "port_number({port_number}) out of bound (table size {})",
                self.mmio_table.len()
            )));
        }
        Ok(())
    }

    fn check_bar_index(&self, bar_index: usize) -> Result<(), CxlError> {
        if bar_index >= BRIDGE_MAX_BARS {
            return Err(CxlError::Validation(format!(
                "bar_index({bar_index}) should be between 0 and {}",
                BRIDGE_MAX_BARS - 1
            )));
        }
        Ok(())
    }

    pub fn set_router_bus_number(&mut self, bus_number: u8) {
        self.router_bus_number = Some(bus_number);
    }

    pub fn set_secondary_bus_number(&mut self, port_number: usize, bus_number: u8) -> Result<(), CxlError> {
        self.check_port_number(port_number)?;
        self.config_space_table[port_number].0.secondary_bus = bus_number;
        Ok(())
    }

    pub fn set_subordinate_bus_number(&mut self, port_number: usize, bus_number: u8) -> Result<(), CxlError> {
        self.check_port_number(port_number)?;
        self.config_space_table[port_number].0.subordinate_bus = bus_number;
        Ok(())
    }

    pub fn set_memory_base(&mut self, port_number: usize, base: u64) -> Result<(), CxlError> {
        self.check_port_number(port_number)?;
        self.mmio_table[port_number].base = base;
        Ok(())
    }

    pub fn set_memory_limit(&mut self, port_number: usize, limit: u64) -> Result<(), CxlError> {
        self.check_port_number(port_number)?;
        self.mmio_table[port_number].limit = limit;
        Ok(())
    }

    pub fn set_bar(&mut self, port_number: usize, bar_index: usize, base: u64, limit: u64) -> Result<(), CxlError> {
        self.check_port_number(port_number)?;
        self.check_bar_index(bar_index)?;
        self.mmio_table[port_number].bars[bar_index] = BarEntry { base, limit };
        Ok(())
    }

    /// Route a config-space request by its 16-bit BDF. If the request's
    /// bus number equals this upstream port's own bus, it addresses an
    /// attached downstream device directly (by device number among the
    /// active vPPBs); otherwise it falls through the secondary/subordinate
    /// bus ranges of each downstream port.
    pub fn get_config_space_target_port(&self, bdf: u16) -> Option<usize> {
        let bus_number = extract_bus_from_bdf(bdf);
        if Some(bus_number) == self.router_bus_number {
            let device_number = extract_device_from_bdf(bdf) as usize;
            let active_count = self.config_space_table.iter().filter(|(_, active)| *active).count();
            if device_number < active_count {
                return Some(device_number);
            }
            return None;
        }
        self.config_space_table
            .iter()
            .enumerate()
            .find(|(_, (entry, active))| {
                *active && entry.secondary_bus <= bus_number && bus_number <= entry.subordinate_bus
            })
            .map(|(port_number, _)| port_number)
    }

    pub fn is_config_space_id_local(&self, bdf: u16) -> Result<bool, CxlError> {
        let router_bus_number = self
            .router_bus_number
            .ok_or_else(|| CxlError::Internal("upstream port is not bound yet".into()))?;
        Ok(router_bus_number == extract_bus_from_bdf(bdf))
    }

    pub fn get_mmio_target_port(&self, memory_addr: u64) -> Option<usize> {
        self.mmio_table
            .iter()
            .position(|entry| entry.contains(memory_addr))
    }

    pub fn get_secondary_bus_number(&self, port_number: usize) -> Result<u8, CxlError> {
        self.check_port_number(port_number)?;
        Ok(self.config_space_table[port_number].0.secondary_bus)
    }

    pub fn activate_vppb(&mut self, vppb_number: usize) -> Result<(), CxlError> {
        self.check_port_number(vppb_number)?;
        self.config_space_table[vppb_number].1 = true;
        Ok(())
    }

    pub fn deactivate_vppb(&mut self, vppb_number: usize) -> Result<(), CxlError> {
        self.check_port_number(vppb_number)?;
        self.config_space_table[vppb_number].1 = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_space_routes_local_device_by_bdf_device_number() {
        let mut table = PciRoutingTable::new(4);
        table.set_router_bus_number(0);
        let bdf = 0 << 8 | (2 << 3);
        assert_eq!(table.get_config_space_target_port(bdf), Some(2));
    }

    #[test]
    fn config_space_routes_downstream_by_bus_range() {
        let mut table = PciRoutingTable::new(2);
        table.set_router_bus_number(0);
        table.set_secondary_bus_number(1, 1).unwrap();
        table.set_subordinate_bus_number(1, 5).unwrap();
        let bdf = 3u16 << 8;
        assert_eq!(table.get_config_space_target_port(bdf), Some(1));
    }

    #[test]
    fn mmio_routes_by_bar_window() {
        let mut table = PciRoutingTable::new(2);
        table.set_bar(0, 0, 0x1000, 0x1FFF).unwrap();
        assert_eq!(table.get_mmio_target_port(0x1800), Some(0));
        assert_eq!(table.get_mmio_target_port(0x3000), None);
    }

    #[test]
    fn deactivated_vppb_is_excluded_from_local_device_count() {
        let mut table = PciRoutingTable::new(2);
        table.set_router_bus_number(0);
        table.deactivate_vppb(0).unwrap();
        let bdf = (1u16) << 3;
        assert_eq!(table.get_config_space_target_port(bdf), None);
    }
}
