//! MCTP CCI Executor: the fabric-manager command set a switch's
//! management-plane FIFO dispatches into. Grounded on
//! `opencis/cxl/cci/fabric_manager/physical_switch/identify_switch_device.py`,
//! `.../mld_port/tunnel_management.py`,
//! `.../virtual_switch/tunnel_management.py`, and
//! `opencis/cxl/cci/vendor_specfic/notify_{device,switch}_update.py` for the
//! notification payload shapes.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection::PortType;
use crate::error::CxlError;
use crate::event::SwitchUpdateEvent;
use crate::packet::cci::{CciMessage, ReturnCode};
use crate::port::PhysicalPortManager;
use crate::vswitch::{VppbBindState, VirtualSwitchManager};

pub const OPCODE_IDENTIFY_SWITCH_DEVICE: u16 = 0x5100;
pub const OPCODE_GET_PHYSICAL_PORT_STATE: u16 = 0x5101;
pub const OPCODE_GET_VIRTUAL_CXL_SWITCH_INFO: u16 = 0x5200;
pub const OPCODE_BIND_VPPB: u16 = 0x5201;
pub const OPCODE_UNBIND_VPPB: u16 = 0x5202;
pub const OPCODE_TUNNEL_MANAGEMENT_COMMAND: u16 = 0x5300;
pub const OPCODE_GET_LD_INFO: u16 = 0x5400;
pub const OPCODE_GET_LD_ALLOCATIONS: u16 = 0x5401;
pub const OPCODE_SET_LD_ALLOCATIONS: u16 = 0x5402;
pub const OPCODE_NOTIFY_PORT_UPDATE: u16 = 0xC000;
pub const OPCODE_NOTIFY_DEVICE_UPDATE: u16 = 0xC001;
pub const OPCODE_NOTIFY_SWITCH_UPDATE: u16 = 0xC002;

fn le_range(buf: &mut [u8], start: usize, value: u64, width: usize) {
    buf[start..start + width].copy_from_slice(&value.to_le_bytes()[..width]);
}

fn response_ok(req: &CciMessage, payload: Vec<u8>) -> CciMessage {
    CciMessage::response(req.message_tag, req.command_opcode, ReturnCode::Success, payload)
}

fn response_err(req: &CciMessage, code: ReturnCode) -> CciMessage {
    CciMessage::response(req.message_tag, req.command_opcode, code, vec![])
}

/// A single logical device's allocation: two 8-byte range multipliers, per
/// the Get/Set LD Allocations payload shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdAllocation {
    pub range1_multiplier: u64,
    pub range2_multiplier: u64,
}

/// Multi-logical-device bookkeeping the executor answers
/// GetLdInfo/GetLdAllocations/SetLdAllocations against. Owned by the
/// executor since no other module models logical-device capacity yet.
pub struct LdState {
    pub memory_size: u64,
    pub memory_granularity: u8,
    pub allocations: Vec<LdAllocation>,
}

impl LdState {
    pub fn new(memory_size: u64, memory_granularity: u8, ld_count: usize) -> Self {
        LdState { memory_size, memory_granularity, allocations: vec![LdAllocation::default(); ld_count] }
    }

    pub fn ld_count(&self) -> usize {
        self.allocations.len()
    }
}

/// Dispatches inbound `CciMessage` requests by `command_opcode`, consulting
/// the physical port and virtual switch managers it was built with.
/// `TunnelManagement` needs an async sender for the target DSP's CCI FIFO,
/// supplied per-call rather than owned, since connection ownership lives in
/// [`crate::connection::SwitchConnectionManager`].
pub struct CciExecutor {
    physical_ports: Arc<PhysicalPortManager>,
    switches: Arc<Mutex<VirtualSwitchManager>>,
    ld_state: Mutex<LdState>,
}

impl CciExecutor {
    pub fn new(physical_ports: Arc<PhysicalPortManager>, switches: Arc<Mutex<VirtualSwitchManager>>, ld_state: LdState) -> Self {
        CciExecutor { physical_ports, switches, ld_state: Mutex::new(ld_state) }
    }

    pub async fn dispatch(&self, request: &CciMessage) -> CciMessage {
        match request.command_opcode {
            OPCODE_IDENTIFY_SWITCH_DEVICE => self.identify_switch_device(request).await,
            OPCODE_GET_PHYSICAL_PORT_STATE => self.get_physical_port_state(request).await,
            OPCODE_GET_VIRTUAL_CXL_SWITCH_INFO => self.get_virtual_cxl_switch_info(request).await,
            OPCODE_BIND_VPPB => self.bind_vppb(request).await,
            OPCODE_UNBIND_VPPB => self.unbind_vppb(request).await,
            OPCODE_GET_LD_INFO => self.get_ld_info(request).await,
            OPCODE_GET_LD_ALLOCATIONS => self.get_ld_allocations(request).await,
            OPCODE_SET_LD_ALLOCATIONS => self.set_ld_allocations(request).await,
            _ => response_err(request, ReturnCode::Unsupported),
        }
    }

    async fn identify_switch_device(&self, request: &CciMessage) -> CciMessage {
        let num_physical_ports = self.physical_ports.port_count();
        let switches = self.switches.lock().await;
        let num_vcss = switches.get_virtual_switch_counts();
        let total_num_vppbs = switches.get_total_vppbs_count();
        let num_bound_vppbs = switches.get_total_bound_vppbs_count();
        drop(switches);
        let num_hdm_decoders = self.physical_ports.usp_hdm_decoder_count();

        let mut payload = vec![0u8; 0x49];
        payload[0x00] = 0; // ingress_port_id
        payload[0x02] = num_physical_ports as u8;
        payload[0x03] = num_vcss as u8;
        le_range(&mut payload, 0x04, active_bitmask(num_physical_ports), 0x20);
        le_range(&mut payload, 0x24, active_bitmask(num_vcss), 0x20);
        le_range(&mut payload, 0x44, total_num_vppbs as u64, 2);
        le_range(&mut payload, 0x46, num_bound_vppbs as u64, 2);
        payload[0x48] = num_hdm_decoders as u8;
        response_ok(request, payload)
    }

    async fn get_physical_port_state(&self, request: &CciMessage) -> CciMessage {
        let mut payload = Vec::new();
        for &port_id in &request.payload {
            let Ok(port) = self.physical_ports.port(port_id as usize) else {
                return response_err(request, ReturnCode::InvalidInput);
            };
            let port = port.lock().await;
            payload.push(port_id);
            payload.push(port.port_type as u8);
        }
        response_ok(request, payload)
    }

    async fn get_virtual_cxl_switch_info(&self, request: &CciMessage) -> CciMessage {
        if request.payload.is_empty() {
            return response_err(request, ReturnCode::InvalidInput);
        }
        let vcs_id = request.payload[0] as usize;
        let switches = self.switches.lock().await;
        let Ok(switch) = switches.get_virtual_switch(vcs_id) else {
            return response_err(request, ReturnCode::InvalidInput);
        };
        let mut payload = vec![vcs_id as u8, switch.upstream_port_index() as u8, switch.vppb_count() as u8];
        for status in switch.all_status() {
            payload.push(match status.state {
                VppbBindState::Unbound => 0,
                VppbBindState::BindInProgress => 1,
                VppbBindState::Bound => 2,
                VppbBindState::UnboundInProgress => 3,
            });
            payload.push(status.bound_port.map(|p| p as u8).unwrap_or(0xFF));
        }
        response_ok(request, payload)
    }

    async fn bind_vppb(&self, request: &CciMessage) -> CciMessage {
        if request.payload.len() < 4 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let vcs_id = request.payload[0] as usize;
        let vppb_id = request.payload[1] as usize;
        let dsp_port_id = request.payload[2] as usize;
        let ld_id = if request.payload[3] == 0xFF { None } else { Some(request.payload[3]) };

        let Ok(dsp_port) = self.physical_ports.port(dsp_port_id) else {
            return response_err(request, ReturnCode::InvalidInput);
        };
        if dsp_port.lock().await.port_type != PortType::Downstream {
            return response_err(request, ReturnCode::InvalidInput);
        }
        if let Some(id) = ld_id {
            let ld_state = self.ld_state.lock().await;
            if id as usize >= ld_state.ld_count() {
                return response_err(request, ReturnCode::InvalidInput);
            }
        }

        let mut switches = self.switches.lock().await;
        let Ok(switch) = switches.get_virtual_switch_mut(vcs_id) else {
            return response_err(request, ReturnCode::InvalidInput);
        };
        match switch.bind(vppb_id, dsp_port_id, ld_id) {
            Ok(()) => response_ok(request, vec![]),
            Err(_) => response_err(request, ReturnCode::InvalidInput),
        }
    }

    async fn unbind_vppb(&self, request: &CciMessage) -> CciMessage {
        if request.payload.len() < 2 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let vcs_id = request.payload[0] as usize;
        let vppb_id = request.payload[1] as usize;
        let mut switches = self.switches.lock().await;
        let Ok(switch) = switches.get_virtual_switch_mut(vcs_id) else {
            return response_err(request, ReturnCode::InvalidInput);
        };
        match switch.unbind(vppb_id) {
            Ok(()) => response_ok(request, vec![]),
            Err(_) => response_err(request, ReturnCode::InvalidInput),
        }
    }

    async fn get_ld_info(&self, request: &CciMessage) -> CciMessage {
        let ld_state = self.ld_state.lock().await;
        let mut payload = vec![0u8; 9];
        le_range(&mut payload, 0, ld_state.memory_size, 8);
        payload[8] = ld_state.ld_count() as u8;
        response_ok(request, payload)
    }

    async fn get_ld_allocations(&self, request: &CciMessage) -> CciMessage {
        if request.payload.len() < 2 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let start_ld_id = request.payload[0] as usize;
        let limit = request.payload[1] as usize;
        let ld_state = self.ld_state.lock().await;
        let end = (start_ld_id + limit).min(ld_state.ld_count());
        if start_ld_id > end {
            return response_err(request, ReturnCode::InvalidInput);
        }
        let slice = &ld_state.allocations[start_ld_id..end];
        let mut payload = vec![0u8; 4 + slice.len() * 16];
        payload[0] = ld_state.ld_count() as u8;
        payload[1] = ld_state.memory_granularity;
        payload[2] = start_ld_id as u8;
        payload[3] = slice.len() as u8;
        for (i, alloc) in slice.iter().enumerate() {
            let base = 4 + i * 16;
            le_range(&mut payload, base, alloc.range1_multiplier, 8);
            le_range(&mut payload, base + 8, alloc.range2_multiplier, 8);
        }
        response_ok(request, payload)
    }

    async fn set_ld_allocations(&self, request: &CciMessage) -> CciMessage {
        if request.payload.len() < 2 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let number_of_lds = request.payload[0] as usize;
        let start_ld_id = request.payload[1] as usize;
        let entries = &request.payload[2..];
        if entries.len() != number_of_lds * 16 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let mut ld_state = self.ld_state.lock().await;
        if start_ld_id + number_of_lds > ld_state.ld_count() {
            return response_err(request, ReturnCode::InvalidInput);
        }
        for i in 0..number_of_lds {
            let base = i * 16;
            let range1 = u64::from_le_bytes(entries[base..base + 8].try_into().unwrap());
            let range2 = u64::from_le_bytes(entries[base + 8..base + 16].try_into().unwrap());
            ld_state.allocations[start_ld_id + i] = LdAllocation { range1_multiplier: range1, range2_multiplier: range2 };
        }
        let effective = ld_state.allocations[start_ld_id..start_ld_id + number_of_lds].to_vec();
        drop(ld_state);
        let mut payload = vec![0u8; 2 + effective.len() * 16];
        payload[0] = number_of_lds as u8;
        payload[1] = start_ld_id as u8;
        for (i, alloc) in effective.iter().enumerate() {
            let base = 2 + i * 16;
            le_range(&mut payload, base, alloc.range1_multiplier, 8);
            le_range(&mut payload, base + 8, alloc.range2_multiplier, 8);
        }
        response_ok(request, payload)
    }

    /// Forwards `embedded` to the target DSP/LD's own CCI handler via
    /// `send` and relays its response verbatim, wrapped back into a
    /// successful TunnelManagement response.
    pub async fn tunnel_management<F, Fut>(&self, request: &CciMessage, send: F) -> CciMessage
    where
        F: FnOnce(CciMessage) -> Fut,
        Fut: Future<Output = Result<CciMessage, CxlError>>,
    {
        if request.payload.len() < 3 {
            return response_err(request, ReturnCode::InvalidPayloadLength);
        }
        let port_or_ld_id = request.payload[0];
        let embedded_opcode = u16::from_le_bytes([request.payload[1], request.payload[2]]);
        let embedded = CciMessage::request(request.message_tag, embedded_opcode, request.payload[3..].to_vec());
        match send(embedded).await {
            Ok(tunneled) => {
                let mut payload = vec![port_or_ld_id];
                payload.extend_from_slice(&tunneled.encode());
                response_ok(request, payload)
            }
            Err(_) => response_err(request, ReturnCode::InternalError),
        }
    }
}

fn active_bitmask(count: usize) -> u64 {
    if count == 0 {
        0
    } else if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// Builds the unsolicited NotifyPortUpdate message a switch sends its
/// management-plane listener when a physical port's connection state
/// flips.
pub fn notify_port_update(port_id: u8, connected: bool) -> CciMessage {
    CciMessage::request(0, OPCODE_NOTIFY_PORT_UPDATE, vec![port_id, connected as u8])
}

/// Builds the unsolicited NotifyDeviceUpdate message, carrying no payload
/// beyond the opcode.
pub fn notify_device_update() -> CciMessage {
    CciMessage::request(0, OPCODE_NOTIFY_DEVICE_UPDATE, vec![])
}

/// Builds the unsolicited NotifySwitchUpdate message from a
/// `SwitchUpdateEvent`: {vcs_id, vppb_id, binding_status}, matching
/// `NotifySwitchUpdateRequestPayload`'s 3-byte struct layout.
pub fn notify_switch_update(vcs_id: u8, event: SwitchUpdateEvent) -> CciMessage {
    let binding_status = if event.bound { 2 } else { 0 }; // Bound / Unbound
    CciMessage::request(0, OPCODE_NOTIFY_SWITCH_UPDATE, vec![vcs_id, event.vppb_id as u8, binding_status])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PortType;
    use crate::event::EventBus;
    use crate::port::PhysicalPortConfig;
    use crate::vswitch::VirtualSwitchConfig;

    async fn executor_with_one_switch(vppb_count: usize) -> CciExecutor {
        let port_configs: Vec<_> = std::iter::once(PhysicalPortConfig { port_type: PortType::Upstream, decoder_count_register: 0 })
            .chain(std::iter::repeat(PhysicalPortConfig { port_type: PortType::Downstream, decoder_count_register: 0 }).take(vppb_count))
            .collect();
        let ports = Arc::new(PhysicalPortManager::new(&port_configs).unwrap());
        let switches = VirtualSwitchManager::new(
            vec![VirtualSwitchConfig { upstream_port_index: 0, vppb_count, initial_bounds: vec![None; vppb_count] }],
            ports.clone(),
            EventBus::new(16),
        )
        .unwrap();
        CciExecutor::new(ports, Arc::new(Mutex::new(switches)), LdState::new(0x1000_0000, 0, 4))
    }

    #[tokio::test]
    async fn identify_switch_device_reports_counts() {
        let executor = executor_with_one_switch(2).await;
        let request = CciMessage::request(1, OPCODE_IDENTIFY_SWITCH_DEVICE, vec![]);
        let response = executor.dispatch(&request).await;
        assert_eq!(response.return_code, ReturnCode::Success as u16);
        assert_eq!(response.payload[0x02], 3); // 1 usp + 2 dsp
        assert_eq!(response.payload[0x03], 1); // one vcs
    }

    #[tokio::test]
    async fn bind_then_get_info_reflects_bound_state() {
        let executor = executor_with_one_switch(2).await;
        let bind = CciMessage::request(1, OPCODE_BIND_VPPB, vec![0, 0, 1, 0xFF]);
        let bind_response = executor.dispatch(&bind).await;
        assert_eq!(bind_response.return_code, ReturnCode::Success as u16);

        let info = CciMessage::request(2, OPCODE_GET_VIRTUAL_CXL_SWITCH_INFO, vec![0]);
        let info_response = executor.dispatch(&info).await;
        assert_eq!(info_response.payload[3], 2); // vppb 0 state == Bound
    }

    #[tokio::test]
    async fn unbind_unknown_vppb_is_rejected() {
        let executor = executor_with_one_switch(1).await;
        let unbind = CciMessage::request(1, OPCODE_UNBIND_VPPB, vec![0, 0]);
        let response = executor.dispatch(&unbind).await;
        assert_eq!(response.return_code, ReturnCode::InvalidInput as u16);
    }

    #[tokio::test]
    async fn set_then_get_ld_allocations_round_trips() {
        let executor = executor_with_one_switch(1).await;
        let mut payload = vec![1u8, 0u8];
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(&9u64.to_le_bytes());
        let set = CciMessage::request(1, OPCODE_SET_LD_ALLOCATIONS, payload);
        let set_response = executor.dispatch(&set).await;
        assert_eq!(set_response.return_code, ReturnCode::Success as u16);

        let get = CciMessage::request(2, OPCODE_GET_LD_ALLOCATIONS, vec![0, 1]);
        let get_response = executor.dispatch(&get).await;
        let range1 = u64::from_le_bytes(get_response.payload[4..12].try_into().unwrap());
        assert_eq!(range1, 7);
    }

    #[test]
    fn notify_switch_update_encodes_three_bytes() {
        let msg = notify_switch_update(0, SwitchUpdateEvent { vppb_id: 2, bound: true });
        assert_eq!(msg.payload, vec![0, 2, 2]);
    }
}
