//! Command container
//!
//! The encoding target of one command list: a chained command buffer, the
//! indirect heaps its dispatches consume and the set of allocations the
//! encoded commands touch. Heaps are either owned by the container or
//! borrowed from the engine (immediate lists with heap sharing); a heap
//! type is never bound both ways at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::csr::{lock_csr, CsrHandle};
use crate::error::{lock_poisoned, DriverError, Result};
use crate::hw_cmds::*;
use crate::hw_info::{align_up, GfxCoreCaps};
use crate::indirect_heap::{HeapType, IndirectHeap, SharedHeap};
use crate::linear_stream::LinearStream;
use crate::memory::{AllocationId, AllocationType, GraphicsAllocation, MemoryManager};

const BATCH_BUFFER_START_SIZE: usize = std::mem::size_of::<MiBatchBufferStartCmd>();

#[derive(Debug)]
pub enum HeapBinding {
    Private(IndirectHeap),
    Shared(SharedHeap),
}

impl HeapBinding {
    fn with<R>(&mut self, f: impl FnOnce(&mut IndirectHeap) -> Result<R>) -> Result<R> {
        match self {
            HeapBinding::Private(heap) => f(heap),
            HeapBinding::Shared(shared) => {
                let mut guard = shared.lock().map_err(|_| lock_poisoned("shared heap"))?;
                f(&mut guard)
            }
        }
    }

    fn is_shared(&self) -> bool {
        matches!(self, HeapBinding::Shared(_))
    }
}

/// Location in the chained command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    pub chunk: usize,
    pub offset: usize,
}

/// Snapshot taken before an append so a failure can undo it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    position: StreamPosition,
    heaps: Vec<(HeapType, AllocationId, usize)>,
    residency_len: usize,
    idd_block: IddBlock,
}

/// Interface descriptors reserved together in the dynamic-state heap.
#[derive(Debug, Clone, Copy, Default)]
struct IddBlock {
    heap_allocation: AllocationId,
    offset: usize,
    remaining: u32,
}

#[derive(Debug)]
pub struct CommandContainer {
    memory: Arc<MemoryManager>,
    caps: Arc<GfxCoreCaps>,
    heap_size: usize,
    command_buffer_size: usize,
    num_idd_per_block: u32,

    stream: LinearStream,
    /// Full buffers the stream chained away from, oldest first.
    closed_chunks: Vec<(Arc<GraphicsAllocation>, Vec<u8>)>,
    heaps: HashMap<HeapType, HeapBinding>,
    /// Private heap allocations replaced while the list is alive.
    retired_heaps: Vec<Arc<GraphicsAllocation>>,

    residency: Vec<Arc<GraphicsAllocation>>,
    resident_ids: HashSet<AllocationId>,
    immediate_csr: Option<CsrHandle>,
    idd_block: IddBlock,
}

impl CommandContainer {
    pub fn new(
        memory: Arc<MemoryManager>,
        caps: Arc<GfxCoreCaps>,
        heap_size: usize,
        command_buffer_size: usize,
        num_idd_per_block: u32,
    ) -> Result<Self> {
        let allocation = memory.allocate(command_buffer_size, AllocationType::CommandBuffer)?;
        let mut container = Self {
            memory,
            caps,
            heap_size,
            command_buffer_size,
            num_idd_per_block: num_idd_per_block.max(1),
            stream: LinearStream::new(allocation.clone()),
            closed_chunks: Vec::new(),
            heaps: HashMap::new(),
            retired_heaps: Vec::new(),
            residency: Vec::new(),
            resident_ids: HashSet::new(),
            immediate_csr: None,
            idd_block: IddBlock::default(),
        };
        container.add_to_residency(&allocation);
        Ok(container)
    }

    /// Create the private heaps a list needs up front. Under
    /// global-stateless addressing only the indirect-object heap is
    /// private; heap-sharing lists borrow surface and dynamic state later.
    pub fn initialize_heaps(&mut self, global_stateless: bool, share_heaps: bool) -> Result<()> {
        self.create_private_heap(HeapType::IndirectObject)?;
        if global_stateless || share_heaps {
            return Ok(());
        }
        self.create_private_heap(HeapType::SurfaceState)?;
        if self.caps.dsh_supported {
            self.create_private_heap(HeapType::DynamicState)?;
        }
        Ok(())
    }

    fn create_private_heap(&mut self, heap_type: HeapType) -> Result<()> {
        let allocation_type = match heap_type {
            HeapType::IndirectObject => AllocationType::IndirectObjectHeap,
            _ => AllocationType::LinearStream,
        };
        let allocation = self.memory.allocate(self.heap_size, allocation_type)?;
        trace!(
            "Container {:?} heap at 0x{:X}",
            heap_type,
            allocation.gpu_address()
        );
        self.add_to_residency(&allocation);
        self.heaps
            .insert(heap_type, HeapBinding::Private(IndirectHeap::new(heap_type, allocation)));
        Ok(())
    }

    pub fn set_immediate_cmd_list_csr(&mut self, csr: CsrHandle) {
        self.immediate_csr = Some(csr);
    }

    pub fn immediate_cmd_list_csr(&self) -> Option<&CsrHandle> {
        self.immediate_csr.as_ref()
    }

    /// Whether `heap_type` is borrowed from the engine.
    pub fn immediate_cmd_list_shared_heap(&self, heap_type: HeapType) -> bool {
        self.heaps.get(&heap_type).is_some_and(HeapBinding::is_shared)
    }

    pub fn has_heap(&self, heap_type: HeapType) -> bool {
        self.heaps.contains_key(&heap_type)
    }

    /// Bind an engine heap. Fails if a private heap of that type is bound.
    pub fn bind_shared_heap(&mut self, heap_type: HeapType, heap: SharedHeap) -> Result<()> {
        match self.heaps.get(&heap_type) {
            Some(HeapBinding::Private(_)) => Err(DriverError::InvalidArgument(format!(
                "{heap_type:?} heap is already private"
            ))),
            Some(HeapBinding::Shared(bound)) if Arc::ptr_eq(bound, &heap) => Ok(()),
            _ => {
                self.heaps.insert(heap_type, HeapBinding::Shared(heap));
                Ok(())
            }
        }
    }

    /// Base GPU address and size in pages of a bound heap.
    pub fn heap_state(&mut self, heap_type: HeapType) -> Result<Option<(u64, u64)>> {
        match self.heaps.get_mut(&heap_type) {
            Some(binding) => binding
                .with(|heap| Ok((heap.gpu_base(), heap.size_in_pages())))
                .map(Some),
            None => Ok(None),
        }
    }

    pub fn heap_used(&mut self, heap_type: HeapType) -> Result<usize> {
        match self.heaps.get_mut(&heap_type) {
            Some(binding) => binding.with(|heap| Ok(heap.used())),
            None => Ok(0),
        }
    }

    /// Base of the private surface heap, if the container owns one.
    pub fn private_heap_base(&self, heap_type: HeapType) -> Option<u64> {
        match self.heaps.get(&heap_type) {
            Some(HeapBinding::Private(heap)) => Some(heap.gpu_base()),
            _ => None,
        }
    }

    /// Make room for `size` bytes at `alignment` in `heap_type`, moving to
    /// a new allocation when the current one is exhausted. A missing
    /// private heap is created on first use.
    pub fn ensure_heap_space(&mut self, heap_type: HeapType, size: usize, alignment: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if !self.heaps.contains_key(&heap_type) {
            if let Some(csr) = self.immediate_csr.clone() {
                if heap_type != HeapType::IndirectObject && self.shares_heaps_with_engine() {
                    let heap = lock_csr(&csr)?.get_indirect_heap(heap_type, size + alignment)?;
                    return self.bind_shared_heap(heap_type, heap);
                }
            }
            self.create_private_heap(heap_type)?;
        }

        let shared_csr = self.immediate_csr.clone();
        let binding = self
            .heaps
            .get_mut(&heap_type)
            .ok_or_else(|| DriverError::InvalidArgument(format!("no {heap_type:?} heap")))?;
        match binding {
            HeapBinding::Shared(_) => {
                let csr = shared_csr
                    .ok_or_else(|| DriverError::InvalidArgument("shared heap without an engine".to_string()))?;
                let heap = lock_csr(&csr)?.get_indirect_heap(heap_type, size + alignment)?;
                self.heaps.insert(heap_type, HeapBinding::Shared(heap));
            }
            HeapBinding::Private(heap) => {
                if heap.fits(size, alignment) {
                    return Ok(());
                }
                let allocation = self
                    .memory
                    .allocate(self.heap_size.max(size + alignment), AllocationType::LinearStream)?;
                info!(
                    "Private {:?} heap exhausted at {} bytes, moved to 0x{:X}",
                    heap_type,
                    heap.used(),
                    allocation.gpu_address()
                );
                let old = heap.replace_allocation(allocation.clone());
                self.retired_heaps.push(old);
                self.add_to_residency(&allocation);
            }
        }
        Ok(())
    }

    fn shares_heaps_with_engine(&self) -> bool {
        !self.heaps.contains_key(&HeapType::SurfaceState) || self.immediate_cmd_list_shared_heap(HeapType::SurfaceState)
    }

    /// Reserve `size` bytes at `alignment`; returns the offset from the
    /// heap base.
    pub fn allocate_heap_space(&mut self, heap_type: HeapType, size: usize, alignment: usize) -> Result<usize> {
        let binding = self
            .heaps
            .get_mut(&heap_type)
            .ok_or_else(|| DriverError::InvalidArgument(format!("no {heap_type:?} heap")))?;
        binding.with(|heap| {
            heap.align(alignment)?;
            heap.get_space(size)
        })
    }

    pub fn write_heap(&mut self, heap_type: HeapType, offset: usize, data: &[u8]) -> Result<()> {
        let binding = self
            .heaps
            .get_mut(&heap_type)
            .ok_or_else(|| DriverError::InvalidArgument(format!("no {heap_type:?} heap")))?;
        binding.with(|heap| heap.write(offset, data))
    }

    pub fn heap_gpu_base(&mut self, heap_type: HeapType) -> Result<u64> {
        self.heap_state(heap_type)?
            .map(|(base, _)| base)
            .ok_or_else(|| DriverError::InvalidArgument(format!("no {heap_type:?} heap")))
    }

    /// Heap allocations currently bound, for residency.
    pub fn heap_allocations(&mut self) -> Result<Vec<Arc<GraphicsAllocation>>> {
        let mut allocations = Vec::with_capacity(self.heaps.len());
        for binding in self.heaps.values_mut() {
            allocations.push(binding.with(|heap| Ok(heap.allocation().clone()))?);
        }
        Ok(allocations)
    }

    fn private_heap_allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        self.heaps
            .values()
            .filter_map(|binding| match binding {
                HeapBinding::Private(heap) => Some(heap.allocation().clone()),
                HeapBinding::Shared(_) => None,
            })
            .collect()
    }

    /// Offset of a fresh interface descriptor in the dynamic-state heap.
    /// Descriptors are reserved `num_idd_per_block` at a time.
    pub fn allocate_interface_descriptor(&mut self) -> Result<usize> {
        let idd_size = self.caps.interface_descriptor_size;
        let dsh_allocation = match self.heaps.get_mut(&HeapType::DynamicState) {
            Some(binding) => binding.with(|heap| Ok(heap.allocation().id()))?,
            None => return Err(DriverError::InvalidArgument("no dynamic state heap".to_string())),
        };
        if self.idd_block.remaining == 0 || self.idd_block.heap_allocation != dsh_allocation {
            let alignment = self.caps.default_dsh_alignment;
            let block_size = align_up(idd_size * self.num_idd_per_block as usize, alignment);
            let offset = self.allocate_heap_space(HeapType::DynamicState, block_size, alignment)?;
            self.idd_block = IddBlock {
                heap_allocation: dsh_allocation,
                offset,
                remaining: self.num_idd_per_block,
            };
            trace!("Reserved block of {} interface descriptors", self.num_idd_per_block);
        }
        let index = self.num_idd_per_block - self.idd_block.remaining;
        self.idd_block.remaining -= 1;
        Ok(self.idd_block.offset + index as usize * idd_size)
    }

    /// Guarantee `size` contiguous bytes, chaining to a new buffer when
    /// the current one cannot hold them plus the chaining jump.
    pub fn ensure_command_space(&mut self, size: usize) -> Result<()> {
        if self.stream.available() >= size + BATCH_BUFFER_START_SIZE {
            return Ok(());
        }
        let allocation = self.memory.allocate(
            self.command_buffer_size.max(size + BATCH_BUFFER_START_SIZE),
            AllocationType::CommandBuffer,
        )?;
        let mut jump = MiBatchBufferStartCmd::init();
        jump.address = allocation.gpu_address();
        self.stream.emit(&jump)?;
        debug!(
            "Command buffer chained to 0x{:X} after {} bytes",
            allocation.gpu_address(),
            self.stream.used()
        );
        self.add_to_residency(&allocation);
        let closed = self.stream.replace_buffer(allocation);
        self.closed_chunks.push(closed);
        Ok(())
    }

    /// Emit a command, chaining first when needed.
    pub fn emit<T: Command>(&mut self, cmd: &T) -> Result<()> {
        self.ensure_command_space(std::mem::size_of::<T>())?;
        self.stream.emit(cmd)?;
        Ok(())
    }

    pub fn stream(&self) -> &LinearStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            chunk: self.closed_chunks.len(),
            offset: self.stream.used(),
        }
    }

    fn chunk_gpu_base(&self, chunk: usize) -> u64 {
        match self.closed_chunks.get(chunk) {
            Some((allocation, _)) => allocation.gpu_address(),
            None => self.stream.gpu_base(),
        }
    }

    pub fn gpu_address_of(&self, position: StreamPosition) -> u64 {
        self.chunk_gpu_base(position.chunk) + position.offset as u64
    }

    pub fn first_chunk_gpu_address(&self) -> u64 {
        self.chunk_gpu_base(0)
    }

    /// Every chunk's bytes, oldest first.
    pub fn command_chunks(&self) -> Vec<Vec<u8>> {
        self.segment_since(StreamPosition { chunk: 0, offset: 0 })
    }

    /// Bytes written since `position`, one entry per chunk.
    pub fn segment_since(&self, position: StreamPosition) -> Vec<Vec<u8>> {
        let mut segment = Vec::with_capacity(self.closed_chunks.len() + 1 - position.chunk.min(self.closed_chunks.len()));
        for (index, (_, bytes)) in self.closed_chunks.iter().enumerate().skip(position.chunk) {
            let start = if index == position.chunk { position.offset } else { 0 };
            segment.push(bytes[start.min(bytes.len())..].to_vec());
        }
        let start = if position.chunk == self.closed_chunks.len() {
            position.offset
        } else {
            0
        };
        segment.push(self.stream.bytes_from(start).to_vec());
        segment
    }

    /// Total bytes recorded across all chunks.
    pub fn total_used(&self) -> usize {
        self.closed_chunks.iter().map(|(_, bytes)| bytes.len()).sum::<usize>() + self.stream.used()
    }

    pub fn add_to_residency(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if self.resident_ids.insert(allocation.id()) {
            self.residency.push(allocation.clone());
        }
    }

    pub fn residency(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency
    }

    pub fn is_resident(&self, id: AllocationId) -> bool {
        self.resident_ids.contains(&id)
    }

    pub fn checkpoint(&mut self) -> Result<Checkpoint> {
        let mut heaps = Vec::with_capacity(self.heaps.len());
        for (heap_type, binding) in self.heaps.iter_mut() {
            let (id, used) = binding.with(|heap| Ok((heap.allocation().id(), heap.used())))?;
            heaps.push((*heap_type, id, used));
        }
        Ok(Checkpoint {
            position: self.position(),
            heaps,
            residency_len: self.residency.len(),
            idd_block: self.idd_block,
        })
    }

    /// Undo everything recorded after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let position = checkpoint.position;
        if self.closed_chunks.len() > position.chunk {
            let mut dropped = self.closed_chunks.split_off(position.chunk);
            let (allocation, bytes) = dropped.remove(0);
            let newest = self.stream.restore(allocation, bytes);
            self.memory.free(&newest)?;
            for (allocation, _) in dropped {
                self.memory.free(&allocation)?;
            }
        }
        self.stream.truncate(position.offset);

        for (heap_type, id, used) in &checkpoint.heaps {
            if let Some(binding) = self.heaps.get_mut(heap_type) {
                binding.with(|heap| {
                    if heap.allocation().id() == *id {
                        heap.set_used(*used);
                    }
                    Ok(())
                })?;
            }
        }

        for allocation in self.residency.drain(checkpoint.residency_len..) {
            self.resident_ids.remove(&allocation.id());
        }
        // Whatever is still bound stays resident.
        let stream_allocation = self.stream.allocation().clone();
        self.add_to_residency(&stream_allocation);
        for allocation in self.private_heap_allocations() {
            self.add_to_residency(&allocation);
        }
        self.idd_block = checkpoint.idd_block;
        debug!("Container rolled back to {:?}", position);
        Ok(())
    }

    /// Start over for reuse: one empty command buffer, empty heaps.
    pub fn reset(&mut self) -> Result<()> {
        if !self.closed_chunks.is_empty() {
            let mut chunks = std::mem::take(&mut self.closed_chunks);
            let (first, _) = chunks.remove(0);
            let newest = self.stream.restore(first, Vec::new());
            self.memory.free(&newest)?;
            for (allocation, _) in chunks {
                self.memory.free(&allocation)?;
            }
        }
        self.stream.reset();
        for allocation in self.retired_heaps.drain(..) {
            self.memory.free(&allocation)?;
        }
        self.heaps.retain(|_, binding| !binding.is_shared());
        for binding in self.heaps.values_mut() {
            binding.with(|heap| {
                heap.reset();
                Ok(())
            })?;
        }
        self.residency.clear();
        self.resident_ids.clear();
        let stream_allocation = self.stream.allocation().clone();
        self.add_to_residency(&stream_allocation);
        for allocation in self.private_heap_allocations() {
            self.add_to_residency(&allocation);
        }
        self.idd_block = IddBlock::default();
        Ok(())
    }

    /// Free every allocation the container owns.
    pub fn release(&mut self) -> Result<()> {
        for (allocation, _) in self.closed_chunks.drain(..) {
            self.memory.free(&allocation)?;
        }
        self.memory.free(self.stream.allocation())?;
        for allocation in self.retired_heaps.drain(..) {
            self.memory.free(&allocation)?;
        }
        for (_, binding) in self.heaps.drain() {
            if let HeapBinding::Private(heap) = binding {
                self.memory.free(heap.allocation())?;
            }
        }
        self.residency.clear();
        self.resident_ids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_parse::{parse_command_buffer, CommandCounts};

    fn container(command_buffer_size: usize) -> CommandContainer {
        let memory = Arc::new(MemoryManager::new(true, 1 << 32));
        let caps = Arc::new(GfxCoreCaps::gen12lp());
        let mut container = CommandContainer::new(memory, caps, 64 * 1024, command_buffer_size, 4).unwrap();
        container.initialize_heaps(false, false).unwrap();
        container
    }

    #[test]
    fn test_private_heaps_created() {
        let mut container = container(4096);
        assert!(container.has_heap(HeapType::SurfaceState));
        assert!(container.has_heap(HeapType::DynamicState));
        assert!(container.has_heap(HeapType::IndirectObject));
        assert!(!container.immediate_cmd_list_shared_heap(HeapType::SurfaceState));
        assert!(container.heap_state(HeapType::SurfaceState).unwrap().is_some());
        // Command buffer plus three heaps.
        assert_eq!(container.residency().len(), 4);
    }

    #[test]
    fn test_chaining_keeps_commands_parseable() {
        let mut container = container(4096);
        for _ in 0..200 {
            container.emit(&PipeControlCmd::init()).unwrap();
        }
        let chunks = container.command_chunks();
        assert!(chunks.len() > 1);
        let first = parse_command_buffer(&chunks[0]).unwrap();
        assert_eq!(CommandCounts::from_commands(&first).batch_buffer_start, 1);
        let pipe_controls: u32 = chunks
            .iter()
            .map(|chunk| CommandCounts::from_commands(&parse_command_buffer(chunk).unwrap()).pipe_control)
            .sum();
        assert_eq!(pipe_controls, 200);
    }

    #[test]
    fn test_rollback_restores_stream_and_heaps() {
        let mut container = container(4096);
        container.emit(&PipeControlCmd::init()).unwrap();
        let checkpoint = container.checkpoint().unwrap();
        let used_before = container.heap_used(HeapType::SurfaceState).unwrap();

        container.allocate_heap_space(HeapType::SurfaceState, 256, 64).unwrap();
        for _ in 0..200 {
            container.emit(&PipeControlCmd::init()).unwrap();
        }
        container.rollback(&checkpoint).unwrap();

        assert_eq!(container.position(), StreamPosition { chunk: 0, offset: 32 });
        assert_eq!(container.heap_used(HeapType::SurfaceState).unwrap(), used_before);
        assert_eq!(container.command_chunks().len(), 1);
    }

    #[test]
    fn test_private_heap_switch_retires_old_allocation() {
        let mut container = container(4096);
        let (first_base, _) = container.heap_state(HeapType::SurfaceState).unwrap().unwrap();
        container
            .allocate_heap_space(HeapType::SurfaceState, 64 * 1024 - 64, 64)
            .unwrap();
        container.ensure_heap_space(HeapType::SurfaceState, 256, 64).unwrap();
        let (second_base, _) = container.heap_state(HeapType::SurfaceState).unwrap().unwrap();
        assert_ne!(first_base, second_base);
        assert_eq!(container.heap_used(HeapType::SurfaceState).unwrap(), 0);
    }

    #[test]
    fn test_idd_blocks() {
        let mut container = container(4096);
        let first = container.allocate_interface_descriptor().unwrap();
        let second = container.allocate_interface_descriptor().unwrap();
        assert_eq!(second - first, 32);
        let used = container.heap_used(HeapType::DynamicState).unwrap();
        assert_eq!(used, 4 * 32);
        container.allocate_interface_descriptor().unwrap();
        container.allocate_interface_descriptor().unwrap();
        container.allocate_interface_descriptor().unwrap();
        assert_eq!(container.heap_used(HeapType::DynamicState).unwrap(), 8 * 32);
    }

    #[test]
    fn test_reset_empties_everything() {
        let mut container = container(4096);
        for _ in 0..200 {
            container.emit(&PipeControlCmd::init()).unwrap();
        }
        container.allocate_heap_space(HeapType::SurfaceState, 256, 64).unwrap();
        container.reset().unwrap();
        assert_eq!(container.total_used(), 0);
        assert_eq!(container.command_chunks().len(), 1);
        assert_eq!(container.heap_used(HeapType::SurfaceState).unwrap(), 0);
    }
}
