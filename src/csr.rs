//! Command Stream Receiver
//!
//! One receiver per engine. It owns what every command list submitted to
//! that engine shares: the engine command stream, the shared and
//! global-stateless heaps, scratch space, the residency set and the stream
//! properties describing what the hardware is currently programmed with.
//! Batches leave through a [`SubmissionChannel`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{check_submission, lock_poisoned, DriverError, Result, SubmissionStatus};
use crate::hw_cmds::*;
use crate::hw_info::GfxCoreCaps;
use crate::indirect_heap::{HeapType, IndirectHeap, SharedHeap};
use crate::linear_stream::LinearStream;
use crate::memory::{AllocationId, AllocationType, GraphicsAllocation, MemoryManager, UsmMemoryType};
use crate::scratch::{ScratchSpaceController, RESERVED_SURFACE_STATES};
use crate::state_base_address::{reconcile, ReconcileContext, StateDelta};
use crate::stream_properties::StreamProperties;

pub type EngineId = u32;

/// How long a blocking wait may take before the engine is considered hung.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of chunked shared-allocation prefetch.
pub const PREFETCH_CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineGroupType {
    Compute,
    RenderCompute,
    Copy,
}

impl EngineGroupType {
    pub fn is_copy(self) -> bool {
        self == EngineGroupType::Copy
    }
}

/// Completed task count of an engine, written by whoever retires batches.
#[derive(Debug, Clone, Default)]
pub struct TagAddress(Arc<AtomicU64>);

impl TagAddress {
    pub fn completed(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn update(&self, task_count: u64) {
        self.0.fetch_max(task_count, Ordering::AcqRel);
    }
}

/// A batch handed to the submission channel.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    pub engine: EngineId,
    pub task_count: u64,
    /// GPU address the engine starts executing at.
    pub start_address: u64,
    /// Primary commands (engine or queue stream).
    pub commands: Vec<u8>,
    /// Command-list buffers the primary commands jump into.
    pub chained: Vec<Vec<u8>>,
    pub residency: Vec<AllocationId>,
    pub has_relaxed_ordering_dependencies: bool,
}

/// The boundary to whatever executes batches.
pub trait SubmissionChannel: Send + fmt::Debug {
    fn submit(&mut self, batch: BatchBuffer) -> SubmissionStatus;

    /// Block until the engine has retired `task_count`.
    fn wait_for_task_count(&self, task_count: u64, timeout: Duration) -> Result<()>;
}

/// Builds the channel for each engine.
pub type ChannelFactory = Arc<dyn Fn(EngineId, TagAddress) -> Box<dyn SubmissionChannel> + Send + Sync>;

/// Retires every batch as soon as it is submitted.
#[derive(Debug)]
pub struct InlineChannel {
    tag: TagAddress,
}

impl InlineChannel {
    pub fn new(tag: TagAddress) -> Self {
        Self { tag }
    }
}

impl SubmissionChannel for InlineChannel {
    fn submit(&mut self, batch: BatchBuffer) -> SubmissionStatus {
        self.tag.update(batch.task_count);
        SubmissionStatus::Success
    }

    fn wait_for_task_count(&self, task_count: u64, _timeout: Duration) -> Result<()> {
        if self.tag.completed() >= task_count {
            Ok(())
        } else {
            Err(DriverError::DeviceLost(format!("task count {task_count} was never submitted")))
        }
    }
}

pub fn inline_channel_factory() -> ChannelFactory {
    Arc::new(|_, tag| Box::new(InlineChannel::new(tag)) as Box<dyn SubmissionChannel>)
}

pub type CsrHandle = Arc<Mutex<CommandStreamReceiver>>;

pub fn lock_csr(csr: &CsrHandle) -> Result<MutexGuard<'_, CommandStreamReceiver>> {
    csr.lock().map_err(|_| lock_poisoned("command stream receiver"))
}

/// Per-engine activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsrCounters {
    /// Flush-task submissions the channel accepted.
    pub flush_task_calls: u32,
    pub batches_submitted: u32,
    pub indirect_residency_calls: u32,
    pub state_cache_invalidations: u32,
    pub prefetched_allocations: u32,
    pub prefetch_chunks: u32,
}

/// Inputs of a flush-task submission from an immediate command list.
#[derive(Debug)]
pub struct ImmediateFlush<'a> {
    pub required: &'a StreamProperties,
    pub final_state: &'a StreamProperties,
    /// Start of the list commands recorded since the previous flush.
    pub segment_address: u64,
    pub segment: Vec<Vec<u8>>,
    pub global_stateless: bool,
    pub scratch_size: u32,
    pub has_relaxed_ordering_dependencies: bool,
}

/// Engine state a submission may change before the channel accepts it.
#[derive(Debug, Clone)]
pub(crate) struct EngineSnapshot {
    stream_properties: StreamProperties,
    resident: HashSet<AllocationId>,
}

pub struct CommandStreamReceiver {
    engine_id: EngineId,
    engine_group: EngineGroupType,
    caps: Arc<GfxCoreCaps>,
    memory: Arc<MemoryManager>,
    heap_size: usize,
    command_buffer_size: usize,

    stream_properties: StreamProperties,
    command_stream: LinearStream,
    shared_heaps: HashMap<HeapType, SharedHeap>,
    global_stateless_heap: Option<SharedHeap>,
    scratch: ScratchSpaceController,
    /// A scratch front-end program was encoded but not yet accepted.
    scratch_program_pending: bool,
    max_threads: u32,

    residency: HashMap<AllocationId, Arc<GraphicsAllocation>>,
    residency_log: HashSet<AllocationId>,
    /// Allocations freed once the tag reaches the paired task count.
    temporary_allocations: Vec<(Arc<GraphicsAllocation>, u64)>,
    tag_allocation: Arc<GraphicsAllocation>,

    barrier_count: u32,
    task_count: u64,
    tag: TagAddress,
    channel: Box<dyn SubmissionChannel>,
    counters: CsrCounters,
}

impl fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("engine_id", &self.engine_id)
            .field("engine_group", &self.engine_group)
            .field("task_count", &self.task_count)
            .field("completed", &self.tag.completed())
            .finish_non_exhaustive()
    }
}

impl CommandStreamReceiver {
    pub fn new(
        engine_id: EngineId,
        engine_group: EngineGroupType,
        caps: Arc<GfxCoreCaps>,
        memory: Arc<MemoryManager>,
        config: &Config,
        channel_factory: &ChannelFactory,
    ) -> Result<Self> {
        let tag = TagAddress::default();
        let channel = channel_factory(engine_id, tag.clone());
        let command_stream = LinearStream::new(
            memory.allocate(config.command_buffer_size, AllocationType::CommandBuffer)?,
        );
        let tag_allocation = memory.allocate(crate::hw_info::PAGE_SIZE, AllocationType::TagBuffer)?;
        let max_threads = caps.max_threads_per_tile * config.tile_count.max(1);
        debug!("Created CSR {} for {:?} engine", engine_id, engine_group);

        Ok(Self {
            engine_id,
            engine_group,
            caps,
            memory,
            heap_size: config.heap_size,
            command_buffer_size: config.command_buffer_size,
            stream_properties: StreamProperties::default(),
            command_stream,
            shared_heaps: HashMap::new(),
            global_stateless_heap: None,
            scratch: ScratchSpaceController::new(max_threads),
            scratch_program_pending: false,
            max_threads,
            residency: HashMap::new(),
            residency_log: HashSet::new(),
            temporary_allocations: Vec::new(),
            tag_allocation,
            barrier_count: 0,
            task_count: 0,
            tag,
            channel,
            counters: CsrCounters::default(),
        })
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn engine_group(&self) -> EngineGroupType {
        self.engine_group
    }

    pub fn caps(&self) -> &Arc<GfxCoreCaps> {
        &self.caps
    }

    pub fn tag(&self) -> &TagAddress {
        &self.tag
    }

    /// Last task count handed to the channel.
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    pub fn barrier_count(&self) -> u32 {
        self.barrier_count
    }

    /// Record cross-engine dependencies resolved on this engine.
    pub fn add_barriers(&mut self, count: u32) {
        self.barrier_count += count;
    }

    pub fn counters(&self) -> CsrCounters {
        self.counters
    }

    pub fn stream_properties(&self) -> &StreamProperties {
        &self.stream_properties
    }

    pub fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    pub fn scratch_controller(&self) -> &ScratchSpaceController {
        &self.scratch
    }

    /// The engine's heap of `heap_type`, created or moved to a new
    /// allocation when fewer than `min_size` bytes remain.
    pub fn get_indirect_heap(&mut self, heap_type: HeapType, min_size: usize) -> Result<SharedHeap> {
        if let Some(heap) = self.shared_heaps.get(&heap_type).cloned() {
            let replaced = {
                let mut guard = heap.lock().map_err(|_| lock_poisoned("shared heap"))?;
                if guard.fits(min_size, 1) {
                    None
                } else {
                    let allocation = self
                        .memory
                        .allocate(self.heap_size.max(min_size), AllocationType::InternalHeap)?;
                    info!(
                        "CSR {} shared {:?} heap exhausted, moved to 0x{:X}",
                        self.engine_id,
                        heap_type,
                        allocation.gpu_address()
                    );
                    Some(guard.replace_allocation(allocation))
                }
            };
            if let Some(old) = replaced {
                self.temporary_allocations.push((old, self.task_count + 1));
            }
            return Ok(heap);
        }

        let allocation = self
            .memory
            .allocate(self.heap_size.max(min_size), AllocationType::InternalHeap)?;
        debug!(
            "CSR {} created shared {:?} heap at 0x{:X}",
            self.engine_id,
            heap_type,
            allocation.gpu_address()
        );
        let heap = Arc::new(Mutex::new(IndirectHeap::new(heap_type, allocation)));
        self.shared_heaps.insert(heap_type, heap.clone());
        Ok(heap)
    }

    /// The heap all stateful access goes through under global-stateless
    /// addressing. Its first surface states are reserved, followed by the
    /// scratch surface state.
    pub fn global_stateless_heap(&mut self) -> Result<SharedHeap> {
        if let Some(heap) = &self.global_stateless_heap {
            return Ok(heap.clone());
        }
        let allocation = self
            .memory
            .allocate(self.heap_size, AllocationType::GlobalStatelessHeap)?;
        let mut heap = IndirectHeap::new(HeapType::SurfaceState, allocation);
        heap.reserve_front((RESERVED_SURFACE_STATES + 1) * self.caps.render_surface_state_size)?;
        info!(
            "CSR {} created global stateless heap at 0x{:X}",
            self.engine_id,
            heap.gpu_base()
        );
        let heap = Arc::new(Mutex::new(heap));
        self.global_stateless_heap = Some(heap.clone());
        Ok(heap)
    }

    /// Grow scratch for a submission needing `per_thread_size` bytes.
    pub fn ensure_scratch(&mut self, per_thread_size: u32, global_stateless: bool) -> Result<()> {
        if per_thread_size == 0 {
            return Ok(());
        }
        let replaced = if global_stateless {
            let heap = self.global_stateless_heap()?;
            let mut guard = heap.lock().map_err(|_| lock_poisoned("global stateless heap"))?;
            self.scratch
                .set_required_scratch_space(&self.memory, &self.caps, per_thread_size, Some(&mut *guard))?
        } else {
            self.scratch
                .set_required_scratch_space(&self.memory, &self.caps, per_thread_size, None)?
        };
        if let Some(old) = replaced {
            self.temporary_allocations.push((old, self.task_count));
        }
        if let Some(allocation) = self.scratch.allocation().cloned() {
            self.make_resident(&allocation);
        }
        Ok(())
    }

    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if self.residency.insert(allocation.id(), allocation.clone()).is_none() {
            trace!("CSR {} resident: allocation {}", self.engine_id, allocation.id());
        }
        self.residency_log.insert(allocation.id());
    }

    pub fn make_resident_all<'a, I>(&mut self, allocations: I)
    where
        I: IntoIterator<Item = &'a Arc<GraphicsAllocation>>,
    {
        for allocation in allocations {
            self.make_resident(allocation);
        }
    }

    /// Whether `id` was ever made resident on this engine.
    pub fn was_made_resident(&self, id: AllocationId) -> bool {
        self.residency_log.contains(&id)
    }

    /// Keep `allocation` alive until the next submission retires.
    pub fn add_temporary_allocation(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.make_resident(&allocation);
        self.temporary_allocations.push((allocation, self.task_count + 1));
    }

    pub fn temporary_allocation_count(&self) -> usize {
        self.temporary_allocations.len()
    }

    fn clean_temporary_allocations(&mut self) -> Result<()> {
        let completed = self.tag.completed();
        let mut index = 0;
        while index < self.temporary_allocations.len() {
            if self.temporary_allocations[index].1 <= completed {
                let (allocation, _) = self.temporary_allocations.swap_remove(index);
                self.residency.remove(&allocation.id());
                self.memory.free(&allocation)?;
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// Make every live USM allocation resident for kernels that reach
    /// memory through pointers they were not passed.
    pub fn handle_indirect_allocations_residency(&mut self) -> Result<()> {
        self.counters.indirect_residency_calls += 1;
        for (allocation, _) in self.memory.usm_allocations()? {
            self.make_resident(&allocation);
        }
        Ok(())
    }

    /// Migrate shared allocations ahead of a kernel.
    pub fn prefetch_shared_allocations(&mut self, allocations: &[Arc<GraphicsAllocation>], chunked: bool) -> Result<()> {
        for allocation in allocations {
            let shared = matches!(
                self.memory.find_allocation(allocation.gpu_address())?,
                Some((_, UsmMemoryType::Shared))
            );
            if !shared {
                continue;
            }
            let chunks = if chunked {
                allocation.size().div_ceil(PREFETCH_CHUNK_SIZE) as u32
            } else {
                1
            };
            self.counters.prefetched_allocations += 1;
            self.counters.prefetch_chunks += chunks;
            self.make_resident(allocation);
        }
        Ok(())
    }

    fn scratch_context(&self, global_stateless: bool) -> ReconcileContext<'_> {
        ReconcileContext {
            caps: &self.caps,
            scratch_address: self.scratch.front_end_scratch_field(&self.caps, global_stateless),
            scratch_dirty: self.scratch.is_state_dirty(),
            max_threads: self.max_threads,
        }
    }

    /// Merge a list's required state into the engine state and return the
    /// commands to program ahead of it.
    pub fn reconcile_state(&mut self, required: &StreamProperties, global_stateless: bool) -> Result<StateDelta> {
        if self.engine_group.is_copy() || required.is_unset() {
            return Ok(StateDelta::default());
        }
        let mut required = *required;
        if global_stateless {
            let heap = self.global_stateless_heap()?;
            let (base, pages, allocation) = {
                let guard = heap.lock().map_err(|_| lock_poisoned("global stateless heap"))?;
                (guard.gpu_base(), guard.size_in_pages(), guard.allocation().clone())
            };
            required.state_base_address.set_surface_state(base, pages);
            self.make_resident(&allocation);
        }
        let mut engine_state = self.stream_properties;
        let delta = reconcile(&mut engine_state, &required, &self.scratch_context(global_stateless));
        self.stream_properties = engine_state;
        if delta.front_end_state.is_some() && self.scratch.is_state_dirty() {
            self.scratch.clear_state_dirty();
            self.scratch_program_pending = true;
        }
        Ok(delta)
    }

    pub(crate) fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            stream_properties: self.stream_properties,
            resident: self.residency.keys().copied().collect(),
        }
    }

    /// Undo a submission the channel never accepted: the stream
    /// properties and residency it added go back, and scratch front-end
    /// state it consumed is due again.
    pub(crate) fn restore(&mut self, snapshot: EngineSnapshot) {
        self.stream_properties = snapshot.stream_properties;
        self.residency.retain(|id, _| snapshot.resident.contains(id));
        if self.scratch_program_pending {
            self.scratch.mark_state_dirty();
            self.scratch_program_pending = false;
        }
    }

    /// Record the state a list leaves the hardware in after it ran.
    pub fn apply_final_state(&mut self, final_state: &StreamProperties) {
        self.stream_properties.set_from(final_state);
        self.stream_properties.clear_dirty();
    }

    /// Emit the completion write for `task_count` and end the batch.
    pub fn emit_completion(&self, stream: &mut LinearStream, task_count: u64) -> Result<()> {
        encode_completion(
            stream,
            self.engine_group.is_copy(),
            self.caps.dc_flush_supported,
            self.tag_allocation.gpu_address(),
            task_count,
        )
    }

    /// Bytes [`CommandStreamReceiver::emit_completion`] writes.
    pub fn completion_size(&self) -> usize {
        std::mem::size_of::<PipeControlCmd>().max(std::mem::size_of::<MiFlushDwCmd>())
            + std::mem::size_of::<MiBatchBufferEndCmd>()
    }

    pub fn next_task_count(&self) -> u64 {
        self.task_count + 1
    }

    fn ensure_stream_space(&mut self, size: usize) -> Result<()> {
        if self.command_stream.available() >= size {
            return Ok(());
        }
        let allocation = self
            .memory
            .allocate(self.command_buffer_size.max(size), AllocationType::CommandBuffer)?;
        let (old, _) = self.command_stream.replace_buffer(allocation);
        self.temporary_allocations.push((old, self.task_count));
        Ok(())
    }

    /// Hand a batch to the channel. The task count only advances when the
    /// channel accepts it.
    pub fn submit_batch(
        &mut self,
        commands: Vec<u8>,
        start_address: u64,
        chained: Vec<Vec<u8>>,
        has_relaxed_ordering_dependencies: bool,
    ) -> Result<u64> {
        let tag_allocation = self.tag_allocation.clone();
        self.make_resident(&tag_allocation);
        let task_count = self.task_count + 1;
        let batch = BatchBuffer {
            engine: self.engine_id,
            task_count,
            start_address,
            commands,
            chained,
            residency: self.residency.keys().copied().collect(),
            has_relaxed_ordering_dependencies,
        };
        let status = self.channel.submit(batch);
        if status != SubmissionStatus::Success {
            warn!("CSR {} submission of task {} failed: {:?}", self.engine_id, task_count, status);
        }
        check_submission(status)?;

        self.task_count = task_count;
        self.counters.batches_submitted += 1;
        self.residency.clear();
        self.scratch_program_pending = false;
        trace!("CSR {} submitted task {}", self.engine_id, task_count);
        Ok(task_count)
    }

    pub(crate) fn make_shared_heaps_resident(&mut self) -> Result<()> {
        let mut allocations = Vec::with_capacity(self.shared_heaps.len());
        for heap in self.shared_heaps.values() {
            let guard = heap.lock().map_err(|_| lock_poisoned("shared heap"))?;
            allocations.push(guard.allocation().clone());
        }
        self.make_resident_all(&allocations);
        Ok(())
    }

    /// Submit the commands an immediate list recorded since its last
    /// flush, preceded by whatever state they need.
    pub fn flush_immediate_task(&mut self, flush: ImmediateFlush<'_>) -> Result<u64> {
        self.clean_temporary_allocations()?;

        let snapshot = self.snapshot();
        match self.flush_immediate_task_inner(&flush) {
            Ok(task_count) => {
                self.counters.flush_task_calls += 1;
                Ok(task_count)
            }
            Err(err) => {
                self.restore(snapshot);
                Err(err)
            }
        }
    }

    fn flush_immediate_task_inner(&mut self, flush: &ImmediateFlush<'_>) -> Result<u64> {
        if !self.engine_group.is_copy() && !flush.required.is_unset() {
            self.ensure_scratch(flush.scratch_size, flush.global_stateless)?;
        }
        let delta = self.reconcile_state(flush.required, flush.global_stateless)?;

        let needed = delta.size() + std::mem::size_of::<MiBatchBufferStartCmd>() + self.completion_size();
        self.ensure_stream_space(needed)?;
        let start = self.command_stream.used();
        let start_address = self.command_stream.current_gpu_address();

        let task_count = self.next_task_count();
        let is_copy = self.engine_group.is_copy();
        let tag_address = self.tag_allocation.gpu_address();
        let mut jump = MiBatchBufferStartCmd::init();
        jump.address = flush.segment_address;
        jump.second_level = 1;
        let dc_flush = self.caps.dc_flush_supported;
        let stream = &mut self.command_stream;
        let encoded = (|| -> Result<()> {
            delta.encode(stream)?;
            stream.emit(&jump)?;
            encode_completion(stream, is_copy, dc_flush, tag_address, task_count)
        })();
        if let Err(err) = encoded {
            self.command_stream.truncate(start);
            return Err(err);
        }

        self.make_shared_heaps_resident()?;
        let commands = self.command_stream.bytes_from(start).to_vec();
        match self.submit_batch(
            commands,
            start_address,
            flush.segment.clone(),
            flush.has_relaxed_ordering_dependencies,
        ) {
            Ok(task_count) => {
                if !flush.required.is_unset() {
                    self.apply_final_state(flush.final_state);
                }
                Ok(task_count)
            }
            Err(err) => {
                self.command_stream.truncate(start);
                Err(err)
            }
        }
    }

    /// Invalidate the state cache, for a surface heap that is going away
    /// while still programmed.
    pub fn dispatch_state_cache_invalidate(&mut self) -> Result<u64> {
        self.counters.state_cache_invalidations += 1;
        let needed = std::mem::size_of::<PipeControlCmd>() + self.completion_size();
        self.ensure_stream_space(needed)?;
        let start = self.command_stream.used();
        let start_address = self.command_stream.current_gpu_address();

        let mut invalidate = PipeControlCmd::init();
        invalidate.flags = PC_CS_STALL | PC_STATE_CACHE_INVALIDATE;
        self.command_stream.emit(&invalidate)?;
        let task_count = self.next_task_count();
        encode_completion(
            &mut self.command_stream,
            self.engine_group.is_copy(),
            self.caps.dc_flush_supported,
            self.tag_allocation.gpu_address(),
            task_count,
        )?;

        info!("CSR {} dispatched state cache invalidation", self.engine_id);
        let commands = self.command_stream.bytes_from(start).to_vec();
        self.submit_batch(commands, start_address, Vec::new(), false)
    }

    pub fn wait_for_task_count(&mut self, task_count: u64) -> Result<()> {
        self.channel.wait_for_task_count(task_count, WAIT_TIMEOUT)?;
        self.clean_temporary_allocations()
    }

    /// Wait for everything submitted so far.
    pub fn wait_for_completion(&mut self) -> Result<()> {
        self.wait_for_task_count(self.task_count)
    }
}

/// Completion write: a post-sync tag update, then the batch end.
fn encode_completion(
    stream: &mut LinearStream,
    is_copy: bool,
    dc_flush: bool,
    tag_address: u64,
    task_count: u64,
) -> Result<()> {
    if is_copy {
        let mut flush = MiFlushDwCmd::init();
        flush.post_sync_op = POST_SYNC_WRITE_IMMEDIATE;
        flush.address = tag_address;
        flush.immediate_data = task_count;
        stream.emit(&flush)?;
    } else {
        let mut pipe_control = PipeControlCmd::init();
        pipe_control.flags = PC_CS_STALL;
        if dc_flush {
            pipe_control.flags |= PC_DC_FLUSH;
        }
        pipe_control.post_sync_op = POST_SYNC_WRITE_IMMEDIATE;
        pipe_control.address = tag_address;
        pipe_control.immediate_data = task_count;
        stream.emit(&pipe_control)?;
    }
    stream.emit(&MiBatchBufferEndCmd::init())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_parse::{find_state_base_address, parse_command_buffer, CommandCounts};
    use crate::stream_properties::StateBaseAddressValues;
    use crate::testing::MockChannelControl;

    fn csr(config: &Config) -> (CommandStreamReceiver, MockChannelControl) {
        let caps = Arc::new(GfxCoreCaps::xe_hpg_core());
        let memory = Arc::new(MemoryManager::new(true, 1 << 32));
        let control = MockChannelControl::default();
        let csr = CommandStreamReceiver::new(
            0,
            EngineGroupType::Compute,
            caps,
            memory,
            config,
            &control.factory(),
        )
        .unwrap();
        (csr, control)
    }

    fn required(ssh: u64) -> StreamProperties {
        let mut props = StreamProperties::default();
        props.state_base_address.set_properties(&StateBaseAddressValues {
            surface_state_base_address: Some(ssh),
            surface_state_size: Some(16),
            stateless_mocs: Some(3),
            ..Default::default()
        });
        props
    }

    fn flush<'a>(required: &'a StreamProperties) -> ImmediateFlush<'a> {
        ImmediateFlush {
            required,
            final_state: required,
            segment_address: 0x1000,
            segment: vec![vec![]],
            global_stateless: false,
            scratch_size: 0,
            has_relaxed_ordering_dependencies: false,
        }
    }

    #[test]
    fn test_new_csr_has_unset_properties() {
        let (csr, _) = csr(&Config::default());
        assert!(csr.stream_properties().is_unset());
        assert_eq!(csr.task_count(), 0);
        assert_eq!(csr.barrier_count(), 0);
    }

    #[test]
    fn test_flush_task_emits_sba_once() {
        let (mut csr, control) = csr(&Config::default());
        let props = required(0x10000);
        assert_eq!(csr.flush_immediate_task(flush(&props)).unwrap(), 1);
        assert_eq!(csr.flush_immediate_task(flush(&props)).unwrap(), 2);

        let batches = control.batches();
        assert_eq!(batches.len(), 2);
        let first = parse_command_buffer(&batches[0].commands).unwrap();
        let second = parse_command_buffer(&batches[1].commands).unwrap();
        assert_eq!(find_state_base_address(&first).len(), 1);
        assert_eq!(find_state_base_address(&second).len(), 0);
        assert_eq!(CommandCounts::from_commands(&second).batch_buffer_start, 1);
        assert_eq!(csr.tag().completed(), 2);
    }

    #[test]
    fn test_failed_flush_maps_status_and_keeps_state() {
        let (mut csr, control) = csr(&Config::default());
        control.force_status(SubmissionStatus::OutOfHostMemory);
        let props = required(0x10000);
        let err = csr.flush_immediate_task(flush(&props)).unwrap_err();
        assert_eq!(err.code(), crate::error::ZeResult::ErrorOutOfHostMemory);
        assert!(csr.stream_properties().is_unset());
        assert_eq!(csr.task_count(), 0);

        control.force_status(SubmissionStatus::OutOfMemory);
        let err = csr.flush_immediate_task(flush(&props)).unwrap_err();
        assert_eq!(err.code(), crate::error::ZeResult::ErrorOutOfDeviceMemory);
    }

    #[test]
    fn test_shared_heap_moves_when_full() {
        let config = Config {
            heap_size: 4096,
            ..Default::default()
        };
        let (mut csr, _) = csr(&config);
        let heap = csr.get_indirect_heap(HeapType::SurfaceState, 0).unwrap();
        let first_base = heap.lock().unwrap().gpu_base();
        heap.lock().unwrap().get_space(4000).unwrap();

        let same = csr.get_indirect_heap(HeapType::SurfaceState, 512).unwrap();
        assert!(Arc::ptr_eq(&heap, &same));
        assert_ne!(same.lock().unwrap().gpu_base(), first_base);
        assert_eq!(same.lock().unwrap().used(), 0);
        assert_eq!(csr.temporary_allocation_count(), 1);
    }

    #[test]
    fn test_global_stateless_heap_reserves_scratch_slot() {
        let (mut csr, _) = csr(&Config::default());
        let heap = csr.global_stateless_heap().unwrap();
        assert_eq!(heap.lock().unwrap().used(), 3 * 64);
        csr.ensure_scratch(0x100, true).unwrap();
        assert!(csr.scratch_controller().is_state_dirty());

        let delta = csr.reconcile_state(&required(0x10000), true).unwrap();
        let fe = delta.front_end_state.unwrap();
        assert_eq!(fe.scratch_space_buffer, 2 * 64);
        let sba = delta.state_base_address.unwrap();
        assert_eq!(sba.surface_state_base, heap.lock().unwrap().gpu_base());
        assert!(!csr.scratch_controller().is_state_dirty());
    }

    #[test]
    fn test_indirect_residency_counts_calls() {
        let (mut csr, _) = csr(&Config::default());
        csr.handle_indirect_allocations_residency().unwrap();
        assert_eq!(csr.counters().indirect_residency_calls, 1);
    }

    #[test]
    fn test_state_cache_invalidate_submits() {
        let (mut csr, control) = csr(&Config::default());
        csr.dispatch_state_cache_invalidate().unwrap();
        let batches = control.batches();
        let commands = parse_command_buffer(&batches[0].commands).unwrap();
        assert!(crate::cmd_parse::find_pipe_controls(&commands)
            .iter()
            .any(|pc| pc.has(PC_STATE_CACHE_INVALIDATE)));
        assert_eq!(csr.counters().state_cache_invalidations, 1);
    }
}
