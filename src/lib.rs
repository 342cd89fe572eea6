/*!
This crate emulates a CXL (Compute Express Link) fabric: a host, zero or
more CXL switches, and the type-2/type-3 devices attached below them, all
connected over TCP sockets that carry CXL.io, CXL.mem, and CXL.cache
transactions as they would appear on the physical link. It exists so a
fabric manager, a kernel driver stack, or a test harness can be exercised
against switch/device topologies without real silicon.

# Design consideration

1. The wire format is the unit of truth: every component reasons about
   CXL traffic in terms of the packet codecs in [`packet`], not in terms
   of in-process function calls. A device and the switch it is plugged
   into are expected to run in separate processes in the general case;
   a same-process topology is just the degenerate case of that.

2. Register state lives behind the declarative byte-layout engine in
   [`layout`]: every capability/control/status register a component
   exposes is described once as a [`layout::FieldDesc`] table, and reads
   and writes go through it so RO/RW/RW1C/RESERVED semantics never need
   reimplementing per register.

3. Concurrency is cooperative, built on `tokio`: each connection's
   read/write halves are driven by a [`processor::PacketProcessor`] task,
   lifecycle state is a `tokio::sync::watch` cell
   ([`component::ComponentStatus`]), and cross-cutting notifications
   (port up/down, vPPB bind/unbind) go out over a `tokio::sync::broadcast`
   [`event::EventBus`].

# Core components

* [`packet`] — wire codecs for every packet family: the sideband
  connection handshake, CXL.io (PCIe-TLP-shaped memory/config/completion
  transactions), CXL.mem (M2S/S2M including back-invalidate), CXL.cache
  (D2H/H2D), and CCI/FM-API management messages.
* [`fifo`] — the bounded per-connection channel set a
  [`processor::PacketProcessor`] reads from and writes to, one channel
  per packet class so a stalled CXL.cache peer can't starve CXL.io
  traffic on the same link.
* [`processor`] — matches outgoing requests against incoming completions
  by `(requester_id, tag)` and drives the two directions of one
  connection to completion or error.
* [`connection`] — the switch-side TCP server (`SwitchConnectionManager`)
  that accepts sockets, runs the connection handshake, and binds each one
  to a configured port; plus the device-side dial helper.
* [`port`] — `PortDevice`/`PhysicalPortManager`: one CXL Component
  Register block and one PCI config-space header per physical port,
  answering config and MMIO requests already routed to it.
* [`cci_executor`] — the fabric-manager CCI command table
  (IdentifySwitchDevice, GetPhysicalPortState, Bind/UnbindVppb, the
  LD-allocation commands, TunnelManagement) plus its unsolicited
  notification builders.
* [`vswitch`] — the vPPB bind/unbind state machine
  (`VirtualSwitch`/`VirtualSwitchManager`) a fabric manager drives to
  attach a physical downstream port's device to a virtual switch's
  upstream-facing topology.
* [`fabric`] — HDM decoding (host physical address -> device physical
  address, or -> downstream port) and PCI routing tables (BDF bus range,
  MMIO base/limit/BAR window) that a virtual switch consults per packet.
* [`regs`] — the field tables for every register space: PCI config
  headers, CXL component registers, CXL device registers, and PCIe
  extended capabilities (DVSEC/DOE/MSI/PCIe).
* [`mailbox`] — the doorbell-triggered command dispatch shared by the FM
  API and memory-device command sets.
* [`mem_device`] — the sparse-file-backed DPA address space a type-3
  logical device's CXL.mem reads/writes land in.
* [`host_manager`] — the `UTIL_CXL_MEM_*`/`UTIL_REINIT` JSON-RPC envelope
  a management-plane websocket speaks, delegating to a per-host backend.
* [`component`] — the INIT -> RUNNING -> STOPPED lifecycle shared by
  every long-lived task.
* [`event`] — the fabric-wide notification bus.
* [`error`] — the crate's unified error type.

# Core mechanisms

## Transaction correlation

Every CXL.io non-posted request carries a `(requester_id, tag)` pair; a
[`processor::PacketProcessor`] keeps an in-flight table keyed on that pair
so the completion that eventually arrives can be matched back to its
requester without either side needing to track the mapping itself.

## HDM decoding

A host physical address passes through a device-variant
[`fabric::hdm::DeviceHdmDecoder`] (HPA -> DPA, de-interleaving across
`2^iw` ways at `ig`-byte granularity) or a switch-variant
[`fabric::hdm::SwitchHdmDecoder`] (HPA -> downstream port index), mirroring
the HDM Decoder capability structure a real CXL component exposes through
its component register block.

## vPPB bind/unbind

A virtual switch's ports (vPPBs) start `Unbound`. Binding one to a
physical downstream port programs that vPPB's entry in the switch's
[`fabric::routing::PciRoutingTable`] (bus range, BAR windows) and flips
it active; unbinding reverses both effects. Bind/unbind only update this
routing-table state today — see [`vswitch`] for the open question on
wiring that state into actual cross-connection packet forwarding.
*/

pub mod cci_executor;
pub mod component;
pub mod connection;
pub mod error;
pub mod event;
pub mod fabric;
pub mod fifo;
pub mod host_manager;
pub mod layout;
pub mod mailbox;
pub mod mem_device;
pub mod packet;
pub mod port;
pub mod processor;
pub mod regs;
pub mod vswitch;

pub use component::{ComponentStatus, StatusTracker};
pub use connection::{connect_to_switch, PortConfig, PortType, SwitchConnectionManager};
pub use error::CxlError;
pub use event::{EventBus, FabricEvent, PortUpdateEvent, SwitchUpdateEvent};
pub use port::{PhysicalPortConfig, PhysicalPortManager, PortDevice};
pub use vswitch::{VirtualSwitch, VirtualSwitchConfig, VirtualSwitchManager, VppbBindState};
