//! Command Buffer Parser
//!
//! Decodes a command buffer back into typed commands. Used by the scheduler
//! model to account for what each batch programs and by tests to inspect
//! encoded streams.

use tracing::trace;

use crate::error::{DriverError, Result};
use crate::hw_cmds::*;

/// One decoded hardware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCommand {
    StateBaseAddress(StateBaseAddressCmd),
    BindingTablePoolAlloc(BindingTablePoolAllocCmd),
    FrontEndState(FrontEndStateCmd),
    StateComputeMode(StateComputeModeCmd),
    PipelineSelect(PipelineSelectCmd),
    PipeControl(PipeControlCmd),
    ComputeWalker(ComputeWalkerCmd),
    SemaphoreWait(MiSemaphoreWaitCmd),
    BatchBufferStart(MiBatchBufferStartCmd),
    BatchBufferEnd(MiBatchBufferEndCmd),
    FlushDw(MiFlushDwCmd),
    XyCopyBlt(XyCopyBltCmd),
    MemSet(MemSetCmd),
    XyColorBlt(XyColorBltCmd),
}

/// A command together with its byte offset in the parsed range.
#[derive(Debug, Clone, Copy)]
pub struct ParsedCommand {
    pub offset: usize,
    pub command: HwCommand,
}

fn read_command<T: Command>(data: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if data.len() < size {
        return Err(DriverError::MalformedCommandBuffer {
            offset,
            reason: format!("opcode 0x{:04X} needs {} bytes, {} left", T::OPCODE, size, data.len()),
        });
    }
    // SAFETY: length checked above, `Command` types are plain old data.
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const T) })
}

/// Decode the command at the start of `data`.
/// Returns the command and the number of bytes consumed.
pub fn parse_command(data: &[u8], offset: usize) -> Result<(HwCommand, usize)> {
    if data.len() < CMD_HEADER_SIZE {
        return Err(DriverError::MalformedCommandBuffer {
            offset,
            reason: "truncated command header".to_string(),
        });
    }

    let header: CommandHeader =
        unsafe { std::ptr::read_unaligned(data.as_ptr() as *const CommandHeader) };

    let size = header.size as usize;
    if size < CMD_HEADER_SIZE || size > data.len() {
        return Err(DriverError::MalformedCommandBuffer {
            offset,
            reason: format!("command size {} exceeds available data {}", size, data.len()),
        });
    }

    let cmd_data = &data[..size];

    let command = match header.opcode {
        CMD_STATE_BASE_ADDRESS => HwCommand::StateBaseAddress(read_command(cmd_data, offset)?),
        CMD_BINDING_TABLE_POOL_ALLOC => {
            HwCommand::BindingTablePoolAlloc(read_command(cmd_data, offset)?)
        }
        CMD_FRONT_END_STATE => HwCommand::FrontEndState(read_command(cmd_data, offset)?),
        CMD_STATE_COMPUTE_MODE => HwCommand::StateComputeMode(read_command(cmd_data, offset)?),
        CMD_PIPELINE_SELECT => HwCommand::PipelineSelect(read_command(cmd_data, offset)?),
        CMD_PIPE_CONTROL => HwCommand::PipeControl(read_command(cmd_data, offset)?),
        CMD_COMPUTE_WALKER => HwCommand::ComputeWalker(read_command(cmd_data, offset)?),
        CMD_MI_SEMAPHORE_WAIT => HwCommand::SemaphoreWait(read_command(cmd_data, offset)?),
        CMD_MI_BATCH_BUFFER_START => HwCommand::BatchBufferStart(read_command(cmd_data, offset)?),
        CMD_MI_BATCH_BUFFER_END => HwCommand::BatchBufferEnd(read_command(cmd_data, offset)?),
        CMD_MI_FLUSH_DW => HwCommand::FlushDw(read_command(cmd_data, offset)?),
        CMD_XY_COPY_BLT => HwCommand::XyCopyBlt(read_command(cmd_data, offset)?),
        CMD_MEM_SET => HwCommand::MemSet(read_command(cmd_data, offset)?),
        CMD_XY_COLOR_BLT => HwCommand::XyColorBlt(read_command(cmd_data, offset)?),
        other => {
            return Err(DriverError::MalformedCommandBuffer {
                offset,
                reason: format!("unknown opcode 0x{:04X}", other),
            });
        }
    };

    trace!("parsed opcode 0x{:04X} at offset {}", header.opcode, offset);
    Ok((command, size))
}

/// Decode a whole byte range into commands.
pub fn parse_command_buffer(bytes: &[u8]) -> Result<Vec<ParsedCommand>> {
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (command, consumed) = parse_command(&bytes[offset..], offset)?;
        commands.push(ParsedCommand { offset, command });
        offset += consumed;
    }
    Ok(commands)
}

/// Per-batch command counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandCounts {
    pub state_base_address: u32,
    pub binding_table_pool_alloc: u32,
    pub front_end_state: u32,
    pub state_compute_mode: u32,
    pub pipeline_select: u32,
    pub pipe_control: u32,
    pub dc_flushes: u32,
    pub compute_walker: u32,
    pub semaphore_wait: u32,
    pub batch_buffer_start: u32,
    pub blits: u32,
}

impl CommandCounts {
    pub fn from_commands(commands: &[ParsedCommand]) -> Self {
        let mut counts = Self::default();
        for parsed in commands {
            match &parsed.command {
                HwCommand::StateBaseAddress(_) => counts.state_base_address += 1,
                HwCommand::BindingTablePoolAlloc(_) => counts.binding_table_pool_alloc += 1,
                HwCommand::FrontEndState(_) => counts.front_end_state += 1,
                HwCommand::StateComputeMode(_) => counts.state_compute_mode += 1,
                HwCommand::PipelineSelect(_) => counts.pipeline_select += 1,
                HwCommand::PipeControl(pc) => {
                    counts.pipe_control += 1;
                    if pc.has(PC_DC_FLUSH) {
                        counts.dc_flushes += 1;
                    }
                }
                HwCommand::ComputeWalker(_) => counts.compute_walker += 1,
                HwCommand::SemaphoreWait(_) => counts.semaphore_wait += 1,
                HwCommand::BatchBufferStart(_) => counts.batch_buffer_start += 1,
                HwCommand::XyCopyBlt(_) | HwCommand::MemSet(_) | HwCommand::XyColorBlt(_) => {
                    counts.blits += 1
                }
                HwCommand::BatchBufferEnd(_) | HwCommand::FlushDw(_) => {}
            }
        }
        counts
    }

    pub fn accumulate(&mut self, other: &CommandCounts) {
        self.state_base_address += other.state_base_address;
        self.binding_table_pool_alloc += other.binding_table_pool_alloc;
        self.front_end_state += other.front_end_state;
        self.state_compute_mode += other.state_compute_mode;
        self.pipeline_select += other.pipeline_select;
        self.pipe_control += other.pipe_control;
        self.dc_flushes += other.dc_flushes;
        self.compute_walker += other.compute_walker;
        self.semaphore_wait += other.semaphore_wait;
        self.batch_buffer_start += other.batch_buffer_start;
        self.blits += other.blits;
    }
}

/// All state-base-address commands in `commands`, in order.
pub fn find_state_base_address(commands: &[ParsedCommand]) -> Vec<StateBaseAddressCmd> {
    commands
        .iter()
        .filter_map(|p| match p.command {
            HwCommand::StateBaseAddress(cmd) => Some(cmd),
            _ => None,
        })
        .collect()
}

/// All front-end state commands in `commands`, in order.
pub fn find_front_end_state(commands: &[ParsedCommand]) -> Vec<FrontEndStateCmd> {
    commands
        .iter()
        .filter_map(|p| match p.command {
            HwCommand::FrontEndState(cmd) => Some(cmd),
            _ => None,
        })
        .collect()
}

/// All pipe controls in `commands`, in order.
pub fn find_pipe_controls(commands: &[ParsedCommand]) -> Vec<PipeControlCmd> {
    commands
        .iter()
        .filter_map(|p| match p.command {
            HwCommand::PipeControl(cmd) => Some(cmd),
            _ => None,
        })
        .collect()
}

/// All compute walkers in `commands`, in order.
pub fn find_compute_walkers(commands: &[ParsedCommand]) -> Vec<ComputeWalkerCmd> {
    commands
        .iter()
        .filter_map(|p| match p.command {
            HwCommand::ComputeWalker(cmd) => Some(cmd),
            _ => None,
        })
        .collect()
}

/// All binding-table pool commands in `commands`, in order.
pub fn find_binding_table_pool_alloc(commands: &[ParsedCommand]) -> Vec<BindingTablePoolAllocCmd> {
    commands
        .iter()
        .filter_map(|p| match p.command {
            HwCommand::BindingTablePoolAlloc(cmd) => Some(cmd),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T: Command>(buf: &mut Vec<u8>, cmd: &T) {
        buf.extend_from_slice(command_bytes(cmd));
    }

    #[test]
    fn test_parse_sequence() {
        let mut buf = Vec::new();
        let mut pc = PipeControlCmd::init();
        pc.flags = PC_DC_FLUSH | PC_CS_STALL;
        encode(&mut buf, &pc);
        let mut sba = StateBaseAddressCmd::init();
        sba.surface_state_base = 0x8000_0000;
        encode(&mut buf, &sba);
        encode(&mut buf, &MiBatchBufferEndCmd::init());

        let commands = parse_command_buffer(&buf).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1].offset, 32);
        let sbas = find_state_base_address(&commands);
        assert_eq!(sbas.len(), 1);
        assert_eq!(sbas[0].surface_state_base, 0x8000_0000);

        let counts = CommandCounts::from_commands(&commands);
        assert_eq!(counts.dc_flushes, 1);
        assert_eq!(counts.state_base_address, 1);
    }

    #[test]
    fn test_truncated_command_rejected() {
        let mut buf = Vec::new();
        encode(&mut buf, &ComputeWalkerCmd::init());
        buf.truncate(40);
        let err = parse_command_buffer(&buf).unwrap_err();
        assert!(matches!(err, DriverError::MalformedCommandBuffer { offset: 0, .. }));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let header = CommandHeader { opcode: 0xDEAD, size: 8 };
        let mut buf = Vec::new();
        buf.extend_from_slice(&header.opcode.to_le_bytes());
        buf.extend_from_slice(&header.size.to_le_bytes());
        assert!(parse_command_buffer(&buf).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut buf = Vec::new();
        let mut cmd = PipeControlCmd::init();
        cmd.header.size = 16;
        encode(&mut buf, &cmd);
        assert!(parse_command(&buf, 0).is_err());
    }
}
