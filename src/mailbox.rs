//! CXL mailbox: the doorbell-triggered command dispatch shared by the FM
//! API (switch CCI) and memory-device command sets. A write that flips
//! `doorbell` 0->1 synchronously runs the registered command handler and
//! clears the doorbell again; this emulator does not model background
//! commands running to completion on a separate timeline.

use std::collections::HashMap;

use crate::error::CxlError;
use crate::packet::cci::ReturnCode;

/// `1 << payload_size` bytes, per the mailbox capability register.
#[derive(Debug, Clone, Copy)]
pub struct MailboxCapabilities {
    pub payload_size: u8,
    pub doorbell_interrupt_capable: bool,
    pub background_command_complete_interrupt_capable: bool,
}

impl MailboxCapabilities {
    pub fn payload_size_bytes(&self) -> usize {
        1usize << self.payload_size
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxControl {
    pub doorbell: bool,
    pub doorbell_interrupt_enabled: bool,
    pub background_command_complete_interrupt_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxStatus {
    pub background_operation: bool,
    pub return_code: u16,
    pub vendor_specific_extended_status: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxCommand {
    pub command_opcode: u16,
    pub payload_length: usize,
}

/// Everything a command handler needs to read its input and write its
/// output: the requested opcode/length, and the shared payload buffer
/// (request bytes in, response bytes out, in place).
pub struct MailboxContext<'a> {
    pub command: MailboxCommand,
    pub payload: &'a mut [u8],
}

/// A registered mailbox command. Handlers run synchronously (see the
/// module doc) and return the response payload length plus a return
/// code; `Err` maps to an internal error return code.
pub trait MailboxCommandHandler: Send + Sync {
    fn opcode(&self) -> u16;
    fn process(&self, ctx: &mut MailboxContext<'_>) -> Result<usize, CxlError>;
}

pub struct CxlMailbox {
    capabilities: MailboxCapabilities,
    control: MailboxControl,
    status: MailboxStatus,
    command: MailboxCommand,
    payloads: Vec<u8>,
    commands: HashMap<u16, Box<dyn MailboxCommandHandler>>,
}

impl CxlMailbox {
    pub fn new(capabilities: MailboxCapabilities, commands: Vec<Box<dyn MailboxCommandHandler>>) -> Self {
        let payload_size = capabilities.payload_size_bytes();
        let mut map = HashMap::new();
        for command in commands {
            map.insert(command.opcode(), command);
        }
        CxlMailbox {
            capabilities,
            control: MailboxControl::default(),
            status: MailboxStatus::default(),
            command: MailboxCommand::default(),
            payloads: vec![0u8; payload_size],
            commands: map,
        }
    }

    pub fn capabilities(&self) -> MailboxCapabilities {
        self.capabilities
    }

    pub fn status(&self) -> MailboxStatus {
        self.status
    }

    pub fn control(&self) -> MailboxControl {
        self.control
    }

    pub fn payload(&self) -> &[u8] {
        &self.payloads
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payloads
    }

    pub fn set_command(&mut self, command: MailboxCommand) {
        self.command = command;
    }

    /// Out-of-band write to the Mailbox Control register. A 0->1 doorbell
    /// transition runs the command named by `command_opcode` synchronously
    /// and resets the doorbell; any other bit change is recorded but has
    /// no side effect beyond gating whether the corresponding interrupt
    /// can later be enabled.
    pub fn set_control(&mut self, control: MailboxControl) {
        let doorbell_rising = !self.control.doorbell && control.doorbell;
        if doorbell_rising {
            self.process_command();
        }
        if !self.control.doorbell {
            if !self.control.doorbell_interrupt_enabled && control.doorbell_interrupt_enabled {
                self.enable_doorbell_interrupt();
            }
            if !self.control.background_command_complete_interrupt_enabled
                && control.background_command_complete_interrupt_enabled
            {
                self.enable_background_command_complete_interrupt();
            }
        }
    }

    fn enable_doorbell_interrupt(&mut self) {
        if self.capabilities.doorbell_interrupt_capable {
            self.control.doorbell_interrupt_enabled = true;
        }
    }

    fn enable_background_command_complete_interrupt(&mut self) {
        if self.capabilities.background_command_complete_interrupt_capable {
            self.control.background_command_complete_interrupt_enabled = true;
        }
    }

    fn process_command(&mut self) {
        let opcode = self.command.command_opcode;
        let max_payload_size = self.capabilities.payload_size_bytes();

        if !self.commands.contains_key(&opcode) {
            log::info!("unsupported mailbox command opcode {opcode:#06x}");
            self.status.return_code = ReturnCode::Unsupported as u16;
            return;
        }
        if self.command.payload_length > max_payload_size {
            log::info!("mailbox command payload_length exceeds maximum payload size {max_payload_size}");
            self.status.return_code = ReturnCode::InvalidPayloadLength as u16;
            return;
        }
        if self.status.background_operation {
            log::info!("mailbox busy with a background operation");
            self.status.return_code = ReturnCode::Busy as u16;
            return;
        }

        self.control.doorbell = true;
        let handler = self.commands.get(&opcode).expect("checked above");
        let mut ctx = MailboxContext {
            command: self.command,
            payload: &mut self.payloads,
        };
        let result = handler.process(&mut ctx);
        self.control.doorbell = false;

        match result {
            Ok(response_len) => {
                self.status.return_code = ReturnCode::Success as u16;
                self.command.payload_length = response_len;
                log::info!("mailbox command {opcode:#06x} completed successfully");
            }
            Err(e) => {
                self.status.return_code = ReturnCode::InternalError as u16;
                log::info!("mailbox command {opcode:#06x} failed: {e}");
            }
        }
        self.generate_doorbell_interrupt();
    }

    fn generate_doorbell_interrupt(&self) {
        if !self.control.doorbell && self.control.doorbell_interrupt_enabled {
            log::debug!("mailbox doorbell interrupt raised");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl MailboxCommandHandler for Echo {
        fn opcode(&self) -> u16 {
            0x0001
        }

        fn process(&self, ctx: &mut MailboxContext<'_>) -> Result<usize, CxlError> {
            Ok(ctx.command.payload_length)
        }
    }

    fn capabilities() -> MailboxCapabilities {
        MailboxCapabilities {
            payload_size: 8,
            doorbell_interrupt_capable: true,
            background_command_complete_interrupt_capable: false,
        }
    }

    #[test]
    fn doorbell_rising_edge_runs_command_and_resets() {
        let mut mbox = CxlMailbox::new(capabilities(), vec![Box::new(Echo)]);
        mbox.set_command(MailboxCommand {
            command_opcode: 0x0001,
            payload_length: 4,
        });
        mbox.set_control(MailboxControl {
            doorbell: true,
            ..Default::default()
        });
        assert_eq!(mbox.status().return_code, ReturnCode::Success as u16);
        assert!(!mbox.control().doorbell);
    }

    #[test]
    fn unsupported_opcode_sets_unsupported_return_code() {
        let mut mbox = CxlMailbox::new(capabilities(), vec![]);
        mbox.set_command(MailboxCommand {
            command_opcode: 0x9999,
            payload_length: 0,
        });
        mbox.set_control(MailboxControl {
            doorbell: true,
            ..Default::default()
        });
        assert_eq!(mbox.status().return_code, ReturnCode::Unsupported as u16);
    }

    #[test]
    fn payload_length_over_max_is_rejected() {
        let mut mbox = CxlMailbox::new(capabilities(), vec![Box::new(Echo)]);
        mbox.set_command(MailboxCommand {
            command_opcode: 0x0001,
            payload_length: 1 << 20,
        });
        mbox.set_control(MailboxControl {
            doorbell: true,
            ..Default::default()
        });
        assert_eq!(mbox.status().return_code, ReturnCode::InvalidPayloadLength as u16);
    }
}
