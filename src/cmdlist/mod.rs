//! Command lists
//!
//! A [`CommandList`] records kernel launches, builtin copies and fills,
//! barriers and event operations into its [`CommandContainer`]. Regular
//! lists are closed and executed through a
//! [`CommandQueue`](crate::cmdqueue::CommandQueue); immediate lists submit
//! each append to their engine as soon as it is recorded.
//!
//! Every list tracks two sets of stream properties. The required state is
//! what the first dispatch needs and is reconciled against the engine
//! before the list runs; the final state is what the last dispatch left
//! programmed. Changes between dispatches are encoded inside the list.

mod append;
mod immediate;

pub use append::{BufferRegion, CopyRegion};

use std::sync::Arc;

use tracing::{debug, trace};

use crate::cmdqueue::SubmissionMode;
use crate::command_container::{Checkpoint, CommandContainer, StreamPosition};
use crate::config::HeapAddressModel;
use crate::csr::{lock_csr, CsrHandle, EngineGroupType, EngineId, TagAddress};
use crate::device::Device;
use crate::encoder::{encode_dispatch, estimate_heaps, reserve_heaps, DispatchArgs};
use crate::error::{DriverError, Result};
use crate::event::Event;
use crate::hw_cmds::*;
use crate::indirect_heap::HeapType;
use crate::kernel::{ArgValue, GroupCount, KernelDescriptor};
use crate::linear_stream::LinearStream;
use crate::memory::{AllocationType, GraphicsAllocation};
use crate::state_base_address::{ReconcileContext, StateDelta};
use crate::stream_properties::{KernelStateRequest, StateBaseAddressValues, StreamProperties};

pub const COMMAND_LIST_FLAG_RELAXED_ORDERING: u32 = 1 << 0;
pub const COMMAND_LIST_FLAG_MAXIMIZE_THROUGHPUT: u32 = 1 << 1;
pub const COMMAND_LIST_FLAG_EXPLICIT_ONLY: u32 = 1 << 2;
const COMMAND_LIST_FLAGS_ALL: u32 =
    COMMAND_LIST_FLAG_RELAXED_ORDERING | COMMAND_LIST_FLAG_MAXIMIZE_THROUGHPUT | COMMAND_LIST_FLAG_EXPLICIT_ONLY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListType {
    Regular,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Appending,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateListDesc {
    pub mode: SubmissionMode,
}

/// How a launch was issued. Builtin operations fill in the split fields;
/// the values of the last dispatch stay visible on the list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdListKernelLaunchParams {
    pub is_built_in_kernel: bool,
    pub is_destination_allocation_in_system_memory: bool,
    pub is_kernel_split_operation: bool,
    pub num_kernels_in_split_launch: u32,
    pub num_kernels_executed_in_split_launch: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandListCounters {
    /// Submissions through the engine flush-task path.
    pub flush_task_submissions: u32,
    /// Submissions through a queue, internal or explicit.
    pub queue_submissions: u32,
    /// State changes encoded between dispatches.
    pub in_list_state_changes: u32,
}

/// Everything an append may change, captured so a failure can be undone.
#[derive(Debug, Clone)]
struct ListCheckpoint {
    container: Checkpoint,
    required_stream_state: StreamProperties,
    final_stream_state: StreamProperties,
    state_initialized: bool,
    contains_any_kernel: bool,
    indirect_allocations_allowed: bool,
    max_scratch_size: u32,
    used_kernel_launch_params: CmdListKernelLaunchParams,
    owned_allocations: usize,
    prefetch_allocations: usize,
    signal_events: usize,
    front_end_patches: usize,
    in_list_state_changes: u32,
}

/// Write `value` into the scratch field of every front-end command in
/// `patches`. `segment` holds the chunks recorded since `start`.
pub(crate) fn patch_front_end_scratch(
    segment: &mut [Vec<u8>],
    start: StreamPosition,
    patches: &[StreamPosition],
    value: u64,
) {
    let field = std::mem::offset_of!(FrontEndStateCmd, scratch_space_buffer);
    for patch in patches {
        if patch.chunk < start.chunk {
            continue;
        }
        let index = patch.chunk - start.chunk;
        let offset = if index == 0 {
            match patch.offset.checked_sub(start.offset) {
                Some(offset) => offset,
                None => continue,
            }
        } else {
            patch.offset
        };
        if let Some(chunk) = segment.get_mut(index) {
            if offset + field + 8 <= chunk.len() {
                chunk[offset + field..offset + field + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

pub struct CommandList {
    device: Arc<Device>,
    list_type: CommandListType,
    flags: u32,
    engine_group: EngineGroupType,
    engine_id: EngineId,
    state: ListState,
    internal_usage: bool,
    synchronous: bool,

    container: CommandContainer,
    csr: Option<CsrHandle>,
    /// Primary stream of the internal queue used when flush-task is off.
    queue_stream: Option<LinearStream>,
    partition_count: u32,
    global_stateless: bool,

    required_stream_state: StreamProperties,
    final_stream_state: StreamProperties,
    state_initialized: bool,
    contains_any_kernel: bool,
    indirect_allocations_allowed: bool,
    max_scratch_size: u32,
    used_kernel_launch_params: CmdListKernelLaunchParams,

    /// Host-pointer and fill-pattern allocations owned by the list.
    owned_allocations: Vec<Arc<GraphicsAllocation>>,
    prefetch_allocations: Vec<Arc<GraphicsAllocation>>,
    signal_events: Vec<Arc<Event>>,
    front_end_patches: Vec<StreamPosition>,
    /// Start of what an immediate list has not submitted yet.
    segment_start: StreamPosition,
    counters: CommandListCounters,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("list_type", &self.list_type)
            .field("engine_group", &self.engine_group)
            .field("state", &self.state)
            .field("partition_count", &self.partition_count)
            .field("global_stateless", &self.global_stateless)
            .finish_non_exhaustive()
    }
}

impl CommandList {
    /// Create a regular list for `engine_group`. `flags` is a combination
    /// of the `COMMAND_LIST_FLAG_*` bits.
    pub fn create(device: &Arc<Device>, engine_group: EngineGroupType, flags: u32) -> Result<Self> {
        if flags & !COMMAND_LIST_FLAGS_ALL != 0 {
            return Err(DriverError::InvalidArgument(format!("unknown command list flags 0x{flags:X}")));
        }
        let engine_id = lock_csr(&device.engine(engine_group)?)?.engine_id();
        let mut list = Self::new_list(device, CommandListType::Regular, engine_group, engine_id, false, None)?;
        list.flags = flags;
        Ok(list)
    }

    /// Create an immediate list. Internal lists run on the device's
    /// internal engine.
    pub fn create_immediate(
        device: &Arc<Device>,
        desc: &ImmediateListDesc,
        internal_usage: bool,
        engine_group: EngineGroupType,
    ) -> Result<Self> {
        let csr = if internal_usage {
            device.internal_engine().clone()
        } else {
            device.engine(engine_group)?
        };
        let engine_id = lock_csr(&csr)?.engine_id();
        let mut list = Self::new_list(
            device,
            CommandListType::Immediate,
            engine_group,
            engine_id,
            internal_usage,
            Some(csr),
        )?;
        list.synchronous = desc.mode == SubmissionMode::Synchronous;
        if !device.config().use_immediate_flush_task {
            let allocation = device
                .memory()
                .allocate(device.config().command_buffer_size, AllocationType::CommandBuffer)?;
            list.queue_stream = Some(LinearStream::new(allocation));
        }
        Ok(list)
    }

    fn new_list(
        device: &Arc<Device>,
        list_type: CommandListType,
        engine_group: EngineGroupType,
        engine_id: EngineId,
        internal_usage: bool,
        csr: Option<CsrHandle>,
    ) -> Result<Self> {
        let config = device.config();
        let global_stateless =
            device.heap_address_model() == HeapAddressModel::GlobalStateless && !engine_group.is_copy();
        let share_heaps = list_type == CommandListType::Immediate
            && config.immediate_cmd_list_heap_sharing
            && config.use_immediate_flush_task;

        let mut container = CommandContainer::new(
            device.memory().clone(),
            device.caps().clone(),
            config.heap_size,
            config.command_buffer_size,
            config.num_idd_per_block,
        )?;
        if let Some(csr) = &csr {
            container.set_immediate_cmd_list_csr(csr.clone());
        }
        if !engine_group.is_copy() {
            container.initialize_heaps(global_stateless, share_heaps)?;
        }
        let segment_start = container.position();
        let partition_count = if engine_group.is_copy() || internal_usage {
            1
        } else {
            device.tile_count()
        };
        debug!(
            "Created {:?} command list for {:?} engine {} (partitions {}, global stateless {})",
            list_type, engine_group, engine_id, partition_count, global_stateless
        );

        Ok(Self {
            device: device.clone(),
            list_type,
            flags: 0,
            engine_group,
            engine_id,
            state: ListState::Appending,
            internal_usage,
            synchronous: false,
            container,
            csr,
            queue_stream: None,
            partition_count,
            global_stateless,
            required_stream_state: StreamProperties::default(),
            final_stream_state: StreamProperties::default(),
            state_initialized: false,
            contains_any_kernel: false,
            indirect_allocations_allowed: false,
            max_scratch_size: 0,
            used_kernel_launch_params: CmdListKernelLaunchParams::default(),
            owned_allocations: Vec::new(),
            prefetch_allocations: Vec::new(),
            signal_events: Vec::new(),
            front_end_patches: Vec::new(),
            segment_start,
            counters: CommandListCounters::default(),
        })
    }

    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_immediate(&self) -> bool {
        self.list_type == CommandListType::Immediate
    }

    pub fn engine_group(&self) -> EngineGroupType {
        self.engine_group
    }

    pub fn is_copy_only(&self) -> bool {
        self.engine_group.is_copy()
    }

    pub fn is_internal(&self) -> bool {
        self.internal_usage
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ListState::Closed
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn is_global_stateless(&self) -> bool {
        self.global_stateless
    }

    pub fn csr(&self) -> Option<&CsrHandle> {
        self.csr.as_ref()
    }

    pub fn container(&self) -> &CommandContainer {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut CommandContainer {
        &mut self.container
    }

    pub fn required_stream_state(&self) -> &StreamProperties {
        &self.required_stream_state
    }

    pub fn final_stream_state(&self) -> &StreamProperties {
        &self.final_stream_state
    }

    pub fn used_kernel_launch_params(&self) -> &CmdListKernelLaunchParams {
        &self.used_kernel_launch_params
    }

    pub fn contains_any_kernel(&self) -> bool {
        self.contains_any_kernel
    }

    pub fn has_indirect_allocations_allowed(&self) -> bool {
        self.indirect_allocations_allowed
    }

    pub fn max_scratch_size(&self) -> u32 {
        self.max_scratch_size
    }

    pub fn counters(&self) -> CommandListCounters {
        self.counters
    }

    pub(crate) fn prefetch_allocations(&self) -> &[Arc<GraphicsAllocation>] {
        &self.prefetch_allocations
    }

    pub(crate) fn front_end_patches(&self) -> &[StreamPosition] {
        &self.front_end_patches
    }

    /// Whether a dispatch waiting on `num_wait_events` events may be
    /// reordered by the engine. Only immediate lists ever qualify.
    pub fn is_relaxed_ordering_dispatch_allowed(&self, num_wait_events: usize) -> bool {
        self.is_immediate()
            && !self.is_copy_only()
            && self.device.config().enable_relaxed_ordering
            && self.device.caps().direct_submission_supported
            && num_wait_events > 0
    }

    fn check_appending(&self, operation: &'static str) -> Result<()> {
        match self.state {
            ListState::Appending => Ok(()),
            ListState::Closed => Err(DriverError::InvalidListState {
                state: "closed",
                operation,
            }),
        }
    }

    /// End recording. Immediate lists have nothing to close.
    pub fn close(&mut self) -> Result<()> {
        if self.is_immediate() || self.state == ListState::Closed {
            return Ok(());
        }
        self.container.emit(&MiBatchBufferEndCmd::init())?;
        self.state = ListState::Closed;
        trace!("Closed command list ({} bytes)", self.container.total_used());
        Ok(())
    }

    /// Return the list to an empty, appendable state. The partition count
    /// is a property of the list and survives.
    pub fn reset(&mut self) -> Result<()> {
        self.container.reset()?;
        self.free_owned_allocations()?;
        self.prefetch_allocations.clear();
        self.signal_events.clear();
        self.front_end_patches.clear();
        self.reset_stream_state();
        self.indirect_allocations_allowed = false;
        self.used_kernel_launch_params = CmdListKernelLaunchParams::default();
        self.state = ListState::Appending;
        self.segment_start = self.container.position();
        debug!("Reset {:?} command list", self.list_type);
        Ok(())
    }

    /// Destroy the list. Engines still programmed with the list's surface
    /// heap get their state cache invalidated first.
    pub fn destroy(mut self) -> Result<()> {
        if let Some(surface_base) = self.container.private_heap_base(HeapType::SurfaceState) {
            for csr in self.device.all_engines() {
                let mut csr = lock_csr(&csr)?;
                let programmed = csr
                    .stream_properties()
                    .state_base_address
                    .surface_state_base_address
                    .value();
                if programmed == Some(surface_base) {
                    csr.dispatch_state_cache_invalidate()?;
                }
            }
        }
        if let Some(csr) = &self.csr {
            lock_csr(csr)?.wait_for_completion()?;
        }
        self.free_owned_allocations()?;
        if let Some(stream) = self.queue_stream.take() {
            self.device.memory().free(stream.allocation())?;
        }
        self.container.release()?;
        debug!("Destroyed {:?} command list", self.list_type);
        Ok(())
    }

    fn free_owned_allocations(&mut self) -> Result<()> {
        for allocation in self.owned_allocations.drain(..) {
            self.device.memory().free(&allocation)?;
        }
        Ok(())
    }

    fn reset_stream_state(&mut self) {
        self.required_stream_state = StreamProperties::default();
        self.final_stream_state = StreamProperties::default();
        self.state_initialized = false;
        self.contains_any_kernel = false;
        self.max_scratch_size = 0;
    }

    fn checkpoint(&mut self) -> Result<ListCheckpoint> {
        Ok(ListCheckpoint {
            container: self.container.checkpoint()?,
            required_stream_state: self.required_stream_state,
            final_stream_state: self.final_stream_state,
            state_initialized: self.state_initialized,
            contains_any_kernel: self.contains_any_kernel,
            indirect_allocations_allowed: self.indirect_allocations_allowed,
            max_scratch_size: self.max_scratch_size,
            used_kernel_launch_params: self.used_kernel_launch_params,
            owned_allocations: self.owned_allocations.len(),
            prefetch_allocations: self.prefetch_allocations.len(),
            signal_events: self.signal_events.len(),
            front_end_patches: self.front_end_patches.len(),
            in_list_state_changes: self.counters.in_list_state_changes,
        })
    }

    fn rollback(&mut self, checkpoint: ListCheckpoint) -> Result<()> {
        self.container.rollback(&checkpoint.container)?;
        for allocation in self.owned_allocations.drain(checkpoint.owned_allocations..).collect::<Vec<_>>() {
            self.device.memory().free(&allocation)?;
        }
        self.prefetch_allocations.truncate(checkpoint.prefetch_allocations);
        self.signal_events.truncate(checkpoint.signal_events);
        self.front_end_patches.truncate(checkpoint.front_end_patches);
        self.required_stream_state = checkpoint.required_stream_state;
        self.final_stream_state = checkpoint.final_stream_state;
        self.state_initialized = checkpoint.state_initialized;
        self.contains_any_kernel = checkpoint.contains_any_kernel;
        self.indirect_allocations_allowed = checkpoint.indirect_allocations_allowed;
        self.max_scratch_size = checkpoint.max_scratch_size;
        self.used_kernel_launch_params = checkpoint.used_kernel_launch_params;
        self.counters.in_list_state_changes = checkpoint.in_list_state_changes;
        Ok(())
    }

    /// Run `append` and, on immediate lists, submit what it recorded. A
    /// failed append leaves the list as it was before.
    fn record<F>(
        &mut self,
        operation: &'static str,
        signal_event: Option<&Arc<Event>>,
        num_wait_events: usize,
        append: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.check_appending(operation)?;
        let checkpoint = self.checkpoint()?;
        let result = (|| -> Result<()> {
            append(&mut *self)?;
            if self.is_immediate() {
                self.execute_immediate(signal_event, num_wait_events)?;
            }
            Ok(())
        })();
        if let Err(err) = &result {
            debug!("{} failed, rolling back: {}", operation, err);
            self.rollback(checkpoint)?;
        }
        result
    }

    /// Called by a queue once the list was submitted as `task_count`.
    pub(crate) fn on_queue_submitted(&mut self, engine: EngineId, tag: &TagAddress, task_count: u64) -> Result<()> {
        for event in &self.signal_events {
            event.assign_completion(engine, tag.clone(), task_count)?;
        }
        self.counters.queue_submissions += 1;
        Ok(())
    }

    fn kernel_state_request(&self, descriptor: &KernelDescriptor) -> KernelStateRequest {
        let config = self.device.config();
        KernelStateRequest {
            compute_dispatch_all_walker: config.compute_dispatch_all_walker,
            disable_eu_fusion: descriptor.requires_disabled_eu_fusion,
            disable_overdispatch: true,
            single_slice_dispatch_ccs_mode: false,
            coherency_required: false,
            large_grf_mode: descriptor.uses_large_grf(),
            thread_arbitration_policy: config.thread_arbitration_policy,
            systolic_mode: false,
        }
    }

    /// Heap bases the list's dispatches are encoded against.
    ///
    /// Under global-stateless addressing surface state and the binding
    /// table pool belong to the engine and stay unset here. With private
    /// heaps the indirect-object heap only goes through state base address
    /// on cores that keep interface descriptors in the dynamic heap.
    fn state_base_address_values(&mut self) -> Result<StateBaseAddressValues> {
        let caps = self.device.caps().clone();
        let mut values = StateBaseAddressValues {
            stateless_mocs: Some(caps.stateless_mocs_index),
            global_atomics: Some(self.partition_count > 1),
            ..Default::default()
        };
        if let Some((base, pages)) = self.container.heap_state(HeapType::DynamicState)? {
            values.dynamic_state_base_address = Some(base);
            values.dynamic_state_size = Some(pages);
        }
        let indirect_object = self.container.heap_state(HeapType::IndirectObject)?;
        if self.global_stateless {
            if let Some((base, pages)) = indirect_object {
                values.indirect_object_base_address = Some(base);
                values.indirect_object_size = Some(pages);
            }
            return Ok(values);
        }
        if let Some((base, pages)) = self.container.heap_state(HeapType::SurfaceState)? {
            values.surface_state_base_address = Some(base);
            values.surface_state_size = Some(pages);
            if caps.binding_table_pool_supported {
                values.binding_table_pool_base_address = Some(base);
                values.binding_table_pool_size = Some(pages);
            }
        }
        if caps.idd_in_dsh {
            if let Some((base, pages)) = indirect_object {
                values.indirect_object_base_address = Some(base);
                values.indirect_object_size = Some(pages);
            }
        }
        Ok(values)
    }

    /// Fold the state a dispatch of `descriptor` needs into the list's
    /// required and final state, encoding any change between dispatches.
    fn update_stream_properties(&mut self, descriptor: &KernelDescriptor) -> Result<()> {
        let caps = self.device.caps().clone();
        let request = self.kernel_state_request(descriptor);
        let sba = self.state_base_address_values()?;

        let mut kernel_state = StreamProperties::default();
        kernel_state
            .front_end_state
            .set_properties(&request, &caps.front_end_support);
        kernel_state
            .state_compute_mode
            .set_properties(&request, &caps.scm_support);
        kernel_state
            .pipeline_select
            .set_properties(&request, &caps.pipeline_select_support);
        kernel_state.state_base_address.set_properties(&sba);
        kernel_state.clear_dirty();

        if !self.state_initialized {
            self.required_stream_state = kernel_state;
            self.final_stream_state = kernel_state;
            self.state_initialized = true;
            return Ok(());
        }

        self.final_stream_state.clear_dirty();
        self.final_stream_state.set_from(&kernel_state);
        if !self.final_stream_state.is_dirty() {
            return Ok(());
        }

        let ctx = ReconcileContext {
            caps: &caps,
            scratch_address: 0,
            scratch_dirty: false,
            max_threads: caps.max_threads_per_tile * self.partition_count,
        };
        let delta = StateDelta::from_dirty(
            &self.final_stream_state,
            &self.final_stream_state.state_base_address,
            &ctx,
        );
        self.final_stream_state.clear_dirty();
        self.container.ensure_command_space(delta.size())?;
        if delta.front_end_state.is_some() {
            let mut position = self.container.position();
            if delta.pipeline_select.is_some() {
                position.offset += std::mem::size_of::<PipelineSelectCmd>();
            }
            if delta.state_compute_mode.is_some() {
                position.offset += std::mem::size_of::<StateComputeModeCmd>();
            }
            self.front_end_patches.push(position);
        }
        delta.encode(self.container.stream_mut())?;
        self.counters.in_list_state_changes += 1;
        trace!(
            "In-list state change (state base address: {})",
            delta.has_state_base_address()
        );
        Ok(())
    }

    /// Encode one dispatch of `descriptor` with everything it needs.
    fn append_launch_kernel_with_params(
        &mut self,
        descriptor: &Arc<KernelDescriptor>,
        arg_values: &[ArgValue],
        group_count: GroupCount,
        group_size: [u32; 3],
        launch_params: &CmdListKernelLaunchParams,
    ) -> Result<()> {
        if self.is_copy_only() {
            return Err(DriverError::InvalidArgument(format!(
                "kernel '{}' cannot run on a copy engine",
                descriptor.name
            )));
        }
        if self.global_stateless {
            if let Some(arg_index) = descriptor.first_stateful_arg() {
                return Err(DriverError::StatefulAccessUnderGlobalStateless {
                    kernel: descriptor.name.clone(),
                    arg_index,
                });
            }
        }
        let caps = self.device.caps().clone();
        let estimate = estimate_heaps(
            &caps,
            descriptor,
            self.device.config().num_idd_per_block,
            self.global_stateless,
        );
        reserve_heaps(&mut self.container, &caps, &estimate)?;
        self.update_stream_properties(descriptor)?;

        let args = DispatchArgs {
            descriptor,
            arg_values,
            group_count,
            group_size,
            partition_count: self.partition_count,
            global_stateless: self.global_stateless,
        };
        encode_dispatch(&mut self.container, &caps, &args)?;

        self.used_kernel_launch_params = *launch_params;
        self.contains_any_kernel = true;
        self.max_scratch_size = self.max_scratch_size.max(descriptor.scratch_size());
        if descriptor.has_indirect_access {
            self.indirect_allocations_allowed = true;
        }
        Ok(())
    }
}
