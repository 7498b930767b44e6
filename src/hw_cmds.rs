//! Hardware command encodings
//!
//! Every command is a `#[repr(C)]` struct that starts with a
//! [`CommandHeader`] and contains no implicit padding, so it can be copied
//! into a command buffer byte for byte and read back with
//! `read_unaligned`.

// =============================================================================
// Opcodes
// =============================================================================

// Render/compute state: 0x6xxx - 0x7xxx
pub const CMD_STATE_BASE_ADDRESS: u32 = 0x6101;
pub const CMD_STATE_COMPUTE_MODE: u32 = 0x6105;
pub const CMD_BINDING_TABLE_POOL_ALLOC: u32 = 0x6119;
pub const CMD_PIPELINE_SELECT: u32 = 0x6904;
pub const CMD_FRONT_END_STATE: u32 = 0x7001;
pub const CMD_COMPUTE_WALKER: u32 = 0x7202;
pub const CMD_PIPE_CONTROL: u32 = 0x7A00;

// MI commands: 0x0xxx - 0x3xxx
pub const CMD_MI_BATCH_BUFFER_END: u32 = 0x0A00;
pub const CMD_MI_SEMAPHORE_WAIT: u32 = 0x1C00;
pub const CMD_MI_FLUSH_DW: u32 = 0x2600;
pub const CMD_MI_BATCH_BUFFER_START: u32 = 0x3100;

// Blitter: 0x5xxx
pub const CMD_XY_COLOR_BLT: u32 = 0x5050;
pub const CMD_XY_COPY_BLT: u32 = 0x5053;
pub const CMD_MEM_SET: u32 = 0x5B00;

// =============================================================================
// Field values
// =============================================================================

// STATE_BASE_ADDRESS modify-enable bits
pub const SBA_MODIFY_GENERAL_STATE: u32 = 1 << 0;
pub const SBA_MODIFY_SURFACE_STATE: u32 = 1 << 1;
pub const SBA_MODIFY_DYNAMIC_STATE: u32 = 1 << 2;
pub const SBA_MODIFY_INDIRECT_OBJECT: u32 = 1 << 3;
pub const SBA_MODIFY_INSTRUCTION: u32 = 1 << 4;
pub const SBA_MODIFY_BINDLESS_SURFACE_STATE: u32 = 1 << 5;
pub const SBA_GLOBAL_ATOMICS_ENABLE: u32 = 1 << 8;

// PIPE_CONTROL flags
pub const PC_CS_STALL: u32 = 1 << 0;
pub const PC_DC_FLUSH: u32 = 1 << 1;
pub const PC_STATE_CACHE_INVALIDATE: u32 = 1 << 2;
pub const PC_TEXTURE_CACHE_INVALIDATE: u32 = 1 << 3;
pub const PC_HDC_PIPELINE_FLUSH: u32 = 1 << 4;
pub const PC_TLB_INVALIDATE: u32 = 1 << 5;
pub const PC_UNTYPED_DATA_PORT_CACHE_FLUSH: u32 = 1 << 6;

// Post-sync operations (PIPE_CONTROL and MI_FLUSH_DW)
pub const POST_SYNC_NONE: u32 = 0;
pub const POST_SYNC_WRITE_IMMEDIATE: u32 = 1;
pub const POST_SYNC_WRITE_TIMESTAMP: u32 = 3;

// FRONT_END_STATE flags
pub const FE_COMPUTE_DISPATCH_ALL_WALKER: u32 = 1 << 0;
pub const FE_DISABLE_EU_FUSION: u32 = 1 << 1;
pub const FE_DISABLE_OVERDISPATCH: u32 = 1 << 2;
pub const FE_SINGLE_SLICE_DISPATCH_CCS: u32 = 1 << 3;

// STATE_COMPUTE_MODE flags
pub const SCM_COHERENCY_REQUIRED: u32 = 1 << 0;
pub const SCM_LARGE_GRF_MODE: u32 = 1 << 1;

// PIPELINE_SELECT
pub const PIPELINE_GPGPU: u32 = 2;

// MI_SEMAPHORE_WAIT compare operations
pub const SEMAPHORE_SAD_GREATER_THAN_OR_EQUAL_SDD: u32 = 1;
pub const SEMAPHORE_SAD_NOT_EQUAL_SDD: u32 = 5;

// =============================================================================
// Command Header
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: u32,
    /// Total command size in bytes, header included.
    pub size: u32,
}

pub const CMD_HEADER_SIZE: usize = std::mem::size_of::<CommandHeader>();

/// A fixed-layout hardware command.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, start with a [`CommandHeader`] and have
/// no padding bytes, so that viewing them as `&[u8]` is sound.
pub unsafe trait Command: Copy + Default {
    const OPCODE: u32;

    /// A zeroed command with its header filled in.
    fn init() -> Self;

    fn header(&self) -> &CommandHeader;
}

macro_rules! impl_command {
    ($($ty:ident => $opcode:expr),* $(,)?) => {
        $(
            unsafe impl Command for $ty {
                const OPCODE: u32 = $opcode;

                fn init() -> Self {
                    Self {
                        header: CommandHeader {
                            opcode: $opcode,
                            size: std::mem::size_of::<$ty>() as u32,
                        },
                        ..Default::default()
                    }
                }

                fn header(&self) -> &CommandHeader {
                    &self.header
                }
            }
        )*
    };
}

/// View a command as the bytes written to the command buffer.
pub fn command_bytes<T: Command>(cmd: &T) -> &[u8] {
    // SAFETY: `Command` guarantees a padding-free `#[repr(C)]` layout.
    unsafe { std::slice::from_raw_parts(cmd as *const T as *const u8, std::mem::size_of::<T>()) }
}

// =============================================================================
// State commands
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateBaseAddressCmd {
    pub header: CommandHeader,
    pub modify_flags: u32,
    /// MOCS index shifted into bits 1..7.
    pub stateless_mocs: u32,
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub bindless_surface_state_base: u64,
    /// Sizes are in 4KB pages.
    pub general_state_size: u32,
    pub surface_state_size: u32,
    pub dynamic_state_size: u32,
    pub indirect_object_size: u32,
    pub instruction_size: u32,
    pub bindless_surface_state_size: u32,
}

impl StateBaseAddressCmd {
    pub fn modifies(&self, bit: u32) -> bool {
        self.modify_flags & bit != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingTablePoolAllocCmd {
    pub header: CommandHeader,
    pub base: u64,
    pub size: u32,
    pub mocs: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontEndStateCmd {
    pub header: CommandHeader,
    /// Scratch surface-state offset (global stateless) or scratch GPU
    /// address (private heaps).
    pub scratch_space_buffer: u64,
    pub maximum_threads: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateComputeModeCmd {
    pub header: CommandHeader,
    pub flags: u32,
    pub thread_arbitration_policy: u32,
    pub modify_mask: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSelectCmd {
    pub header: CommandHeader,
    pub pipeline: u32,
    pub systolic_mode: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeControlCmd {
    pub header: CommandHeader,
    pub flags: u32,
    pub post_sync_op: u32,
    pub address: u64,
    pub immediate_data: u64,
}

impl PipeControlCmd {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeWalkerCmd {
    pub header: CommandHeader,
    pub kernel_id: u32,
    pub simd_size: u32,
    pub thread_group_id_x_dimension: u32,
    pub thread_group_id_y_dimension: u32,
    pub thread_group_id_z_dimension: u32,
    pub group_size_x: u32,
    pub group_size_y: u32,
    pub group_size_z: u32,
    /// Offsets relative to the programmed heap bases.
    pub interface_descriptor_offset: u32,
    pub binding_table_offset: u32,
    pub sampler_state_offset: u32,
    pub indirect_data_start_address: u32,
    pub indirect_data_length: u32,
    pub partition_count: u32,
}

// =============================================================================
// MI commands
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiSemaphoreWaitCmd {
    pub header: CommandHeader,
    pub compare_operation: u32,
    pub semaphore_data: u32,
    pub semaphore_address: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiBatchBufferStartCmd {
    pub header: CommandHeader,
    pub address: u64,
    pub second_level: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiBatchBufferEndCmd {
    pub header: CommandHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiFlushDwCmd {
    pub header: CommandHeader,
    pub flags: u32,
    pub post_sync_op: u32,
    pub address: u64,
    pub immediate_data: u64,
}

// =============================================================================
// Blitter commands
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XyCopyBltCmd {
    pub header: CommandHeader,
    pub source_address: u64,
    pub destination_address: u64,
    pub width: u32,
    pub height: u32,
    pub source_pitch: u32,
    pub destination_pitch: u32,
    pub mocs: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSetCmd {
    pub header: CommandHeader,
    pub destination_address: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub fill_data: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XyColorBltCmd {
    pub header: CommandHeader,
    pub destination_address: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Bytes per pixel of the fill pattern.
    pub color_depth: u32,
    pub fill_color: [u32; 4],
}

impl_command! {
    StateBaseAddressCmd => CMD_STATE_BASE_ADDRESS,
    BindingTablePoolAllocCmd => CMD_BINDING_TABLE_POOL_ALLOC,
    FrontEndStateCmd => CMD_FRONT_END_STATE,
    StateComputeModeCmd => CMD_STATE_COMPUTE_MODE,
    PipelineSelectCmd => CMD_PIPELINE_SELECT,
    PipeControlCmd => CMD_PIPE_CONTROL,
    ComputeWalkerCmd => CMD_COMPUTE_WALKER,
    MiSemaphoreWaitCmd => CMD_MI_SEMAPHORE_WAIT,
    MiBatchBufferStartCmd => CMD_MI_BATCH_BUFFER_START,
    MiBatchBufferEndCmd => CMD_MI_BATCH_BUFFER_END,
    MiFlushDwCmd => CMD_MI_FLUSH_DW,
    XyCopyBltCmd => CMD_XY_COPY_BLT,
    MemSetCmd => CMD_MEM_SET,
    XyColorBltCmd => CMD_XY_COLOR_BLT,
}

// Layout checks: sizes must equal the sum of the fields.
const _: () = assert!(std::mem::size_of::<CommandHeader>() == 8);
const _: () = assert!(std::mem::size_of::<StateBaseAddressCmd>() == 88);
const _: () = assert!(std::mem::size_of::<BindingTablePoolAllocCmd>() == 24);
const _: () = assert!(std::mem::size_of::<FrontEndStateCmd>() == 24);
const _: () = assert!(std::mem::size_of::<StateComputeModeCmd>() == 24);
const _: () = assert!(std::mem::size_of::<PipelineSelectCmd>() == 16);
const _: () = assert!(std::mem::size_of::<PipeControlCmd>() == 32);
const _: () = assert!(std::mem::size_of::<ComputeWalkerCmd>() == 64);
const _: () = assert!(std::mem::size_of::<MiSemaphoreWaitCmd>() == 24);
const _: () = assert!(std::mem::size_of::<MiBatchBufferStartCmd>() == 24);
const _: () = assert!(std::mem::size_of::<MiBatchBufferEndCmd>() == 8);
const _: () = assert!(std::mem::size_of::<MiFlushDwCmd>() == 32);
const _: () = assert!(std::mem::size_of::<XyCopyBltCmd>() == 48);
const _: () = assert!(std::mem::size_of::<MemSetCmd>() == 32);
const _: () = assert!(std::mem::size_of::<XyColorBltCmd>() == 48);

/// Size of the walker plus the heaviest synchronization that may follow it.
pub const MAX_DISPATCH_COMMAND_SIZE: usize = std::mem::size_of::<ComputeWalkerCmd>()
    + 2 * std::mem::size_of::<PipeControlCmd>()
    + std::mem::size_of::<MiSemaphoreWaitCmd>();
