//! Command queues
//!
//! A queue executes closed regular command lists on one engine. Each
//! execution writes a short batch into the queue's own stream: for every
//! list the state delta its required state needs, then a jump into the
//! list's buffers, and finally the completion write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::cmdlist::{patch_front_end_scratch, CommandList};
use crate::command_container::StreamPosition;
use crate::csr::{lock_csr, CommandStreamReceiver, CsrHandle, EngineGroupType, EngineId, TagAddress};
use crate::device::Device;
use crate::error::{lock_poisoned, DriverError, Result, ZeResult};
use crate::hw_cmds::*;
use crate::linear_stream::LinearStream;
use crate::memory::AllocationType;
use crate::stream_properties::StreamProperties;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmissionMode {
    #[default]
    Default,
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandQueueDesc {
    pub mode: SubmissionMode,
}

/// One list as seen by a submission.
#[derive(Debug)]
pub(crate) struct ListExecution<'a> {
    pub required: &'a StreamProperties,
    pub final_state: &'a StreamProperties,
    pub start_address: u64,
    pub chunks: Vec<Vec<u8>>,
}

/// Encode and submit `executions` back to back on `csr`, using `stream`
/// for the primary batch. Engine state only moves when the channel
/// accepts the batch.
pub(crate) fn submit_executions(
    csr: &mut CommandStreamReceiver,
    stream: &mut LinearStream,
    executions: Vec<ListExecution<'_>>,
    global_stateless: bool,
    has_relaxed_ordering_dependencies: bool,
) -> Result<u64> {
    let per_list = 4 * std::mem::size_of::<PipeControlCmd>()
        + std::mem::size_of::<StateBaseAddressCmd>()
        + std::mem::size_of::<BindingTablePoolAllocCmd>()
        + std::mem::size_of::<FrontEndStateCmd>()
        + std::mem::size_of::<StateComputeModeCmd>()
        + std::mem::size_of::<PipelineSelectCmd>()
        + std::mem::size_of::<MiBatchBufferStartCmd>();
    let needed = per_list * executions.len() + csr.completion_size();
    if csr.tag().completed() >= csr.task_count() {
        stream.reset();
    }
    if stream.available() < needed {
        if stream.max_available() < needed {
            return Err(DriverError::OutOfDeviceMemory { requested: needed });
        }
        csr.wait_for_completion()?;
        stream.reset();
    }

    let snapshot = csr.snapshot();
    let start = stream.used();
    let start_address = stream.current_gpu_address();
    let mut chained = Vec::new();
    let encoded = (|| -> Result<()> {
        for execution in executions {
            let delta = csr.reconcile_state(execution.required, global_stateless)?;
            delta.encode(stream)?;
            let mut jump = MiBatchBufferStartCmd::init();
            jump.address = execution.start_address;
            jump.second_level = 1;
            stream.emit(&jump)?;
            if !execution.required.is_unset() {
                csr.apply_final_state(execution.final_state);
            }
            chained.extend(execution.chunks);
        }
        csr.emit_completion(stream, csr.next_task_count())
    })();
    if let Err(err) = encoded {
        stream.truncate(start);
        csr.restore(snapshot);
        return Err(err);
    }

    let commands = stream.bytes_from(start).to_vec();
    let submitted = csr
        .make_shared_heaps_resident()
        .and_then(|()| csr.submit_batch(commands, start_address, chained, has_relaxed_ordering_dependencies));
    match submitted {
        Ok(task_count) => Ok(task_count),
        Err(err) => {
            stream.truncate(start);
            csr.restore(snapshot);
            Err(err)
        }
    }
}

/// Host-visible completion of a queue submission.
#[derive(Debug, Default)]
pub struct Fence {
    pending: Mutex<Option<(TagAddress, u64)>>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign(&self, tag: TagAddress, task_count: u64) -> Result<()> {
        *self.pending.lock().map_err(|_| lock_poisoned("fence"))? = Some((tag, task_count));
        Ok(())
    }

    pub fn query_status(&self) -> ZeResult {
        match self.pending.lock() {
            Ok(pending) => match &*pending {
                Some((tag, task_count)) if tag.completed() >= *task_count => ZeResult::Success,
                _ => ZeResult::NotReady,
            },
            Err(_) => ZeResult::ErrorDeviceLost,
        }
    }

    pub fn host_synchronize(&self, timeout: Duration) -> ZeResult {
        let start = std::time::Instant::now();
        loop {
            let status = self.query_status();
            if status != ZeResult::NotReady || start.elapsed() >= timeout {
                return status;
            }
            std::thread::yield_now();
        }
    }

    pub fn reset(&self) -> Result<()> {
        *self.pending.lock().map_err(|_| lock_poisoned("fence"))? = None;
        Ok(())
    }
}

pub struct CommandQueue {
    device: Arc<Device>,
    csr: CsrHandle,
    engine_id: EngineId,
    engine_group: EngineGroupType,
    stream: LinearStream,
    synchronous: bool,
    global_stateless: bool,
    last_task_count: u64,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("engine_id", &self.engine_id)
            .field("engine_group", &self.engine_group)
            .field("last_task_count", &self.last_task_count)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    pub fn create(device: &Arc<Device>, engine_group: EngineGroupType, desc: &CommandQueueDesc) -> Result<Self> {
        let csr = device.engine(engine_group)?;
        let engine_id = lock_csr(&csr)?.engine_id();
        let stream = LinearStream::new(
            device
                .memory()
                .allocate(device.config().command_buffer_size, AllocationType::CommandBuffer)?,
        );
        let global_stateless = device.heap_address_model() == crate::config::HeapAddressModel::GlobalStateless
            && !engine_group.is_copy();
        debug!("Created command queue on engine {} ({:?})", engine_id, engine_group);
        Ok(Self {
            device: device.clone(),
            csr,
            engine_id,
            engine_group,
            stream,
            synchronous: desc.mode == SubmissionMode::Synchronous,
            global_stateless,
            last_task_count: 0,
        })
    }

    pub fn csr(&self) -> &CsrHandle {
        &self.csr
    }

    pub fn engine_group(&self) -> EngineGroupType {
        self.engine_group
    }

    fn validate(&self, list: &CommandList) -> Result<()> {
        if !list.is_closed() {
            return Err(DriverError::InvalidListState {
                state: "open",
                operation: "execute",
            });
        }
        if list.engine_group().is_copy() != self.engine_group.is_copy() {
            return Err(DriverError::InvalidArgument(format!(
                "{:?} list cannot run on a {:?} queue",
                list.engine_group(),
                self.engine_group
            )));
        }
        if list.is_global_stateless() != self.global_stateless {
            return Err(DriverError::InvalidArgument(
                "list and queue use different heap address models".to_string(),
            ));
        }
        Ok(())
    }

    /// Submit closed regular lists in order. Immediate lists already ran
    /// when they were recorded and are skipped.
    ///
    /// With `blocking` set, or on a synchronous queue, the call returns
    /// once the engine retired the submission.
    pub fn execute_command_lists(
        &mut self,
        lists: &mut [&mut CommandList],
        fence: Option<&Fence>,
        blocking: bool,
    ) -> Result<()> {
        let mut selected = Vec::with_capacity(lists.len());
        for (index, list) in lists.iter().enumerate() {
            if list.is_immediate() {
                debug!("Skipping immediate command list in queue execution");
                continue;
            }
            self.validate(list)?;
            selected.push(index);
        }

        let caps = self.device.caps().clone();
        let config = self.device.config().clone();
        let mut csr = lock_csr(&self.csr)?;
        if selected.is_empty() {
            if let Some(fence) = fence {
                fence.assign(csr.tag().clone(), csr.task_count())?;
            }
            return Ok(());
        }

        if !self.engine_group.is_copy() {
            let scratch = selected.iter().map(|&i| lists[i].max_scratch_size()).max().unwrap_or(0);
            csr.ensure_scratch(scratch, self.global_stateless)?;
        }
        let scratch_field = csr
            .scratch_controller()
            .front_end_scratch_field(&caps, self.global_stateless);

        if selected.iter().any(|&i| lists[i].has_indirect_allocations_allowed()) {
            csr.handle_indirect_allocations_residency()?;
        }
        let mut executions = Vec::with_capacity(selected.len());
        for &index in &selected {
            let list: &CommandList = &*lists[index];
            csr.make_resident_all(list.container().residency());
            if config.force_memory_prefetch_for_kmd_migrated_shared_allocations && list.contains_any_kernel() {
                csr.prefetch_shared_allocations(list.prefetch_allocations(), config.enable_bo_chunking_prefetch)?;
            }
            let mut chunks = list.container().command_chunks();
            patch_front_end_scratch(
                &mut chunks,
                StreamPosition { chunk: 0, offset: 0 },
                list.front_end_patches(),
                scratch_field,
            );
            executions.push(ListExecution {
                required: list.required_stream_state(),
                final_state: list.final_stream_state(),
                start_address: list.container().first_chunk_gpu_address(),
                chunks,
            });
        }

        let task_count = submit_executions(&mut csr, &mut self.stream, executions, self.global_stateless, false)?;
        let tag = csr.tag().clone();
        for &index in &selected {
            lists[index].on_queue_submitted(self.engine_id, &tag, task_count)?;
        }
        if let Some(fence) = fence {
            fence.assign(tag, task_count)?;
        }
        self.last_task_count = task_count;
        info!(
            "Queue on engine {} executed {} list(s) as task {}",
            self.engine_id,
            selected.len(),
            task_count
        );
        if self.synchronous || blocking {
            csr.wait_for_task_count(task_count)?;
        }
        Ok(())
    }

    /// Wait for everything this queue submitted.
    pub fn synchronize(&self) -> Result<()> {
        lock_csr(&self.csr)?.wait_for_task_count(self.last_task_count)
    }

    pub fn destroy(self) -> Result<()> {
        self.synchronize()?;
        self.device.memory().free(self.stream.allocation())
    }
}
