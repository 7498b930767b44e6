//! Scratch space controller
//!
//! Owns the per-engine scratch allocation. It grows to the largest
//! per-thread requirement seen so far. The front-end command addresses it
//! either through a surface state in the global-stateless heap or directly
//! by GPU address.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::hw_info::GfxCoreCaps;
use crate::indirect_heap::IndirectHeap;
use crate::memory::{AllocationType, GraphicsAllocation, MemoryManager};

/// Surface states reserved at the front of the global-stateless heap
/// before the scratch slot.
pub const RESERVED_SURFACE_STATES: usize = 2;

/// Index of the scratch surface state in the global-stateless heap.
pub const SCRATCH_SURFACE_STATE_INDEX: usize = RESERVED_SURFACE_STATES;

#[derive(Debug)]
pub struct ScratchSpaceController {
    per_thread_size: u32,
    max_threads: u32,
    allocation: Option<Arc<GraphicsAllocation>>,
    state_dirty: bool,
}

impl ScratchSpaceController {
    pub fn new(max_threads: u32) -> Self {
        Self {
            per_thread_size: 0,
            max_threads,
            allocation: None,
            state_dirty: false,
        }
    }

    pub fn per_thread_size(&self) -> u32 {
        self.per_thread_size
    }

    pub fn allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.allocation.as_ref()
    }

    /// Front-end state must be reprogrammed for the scratch change.
    pub fn is_state_dirty(&self) -> bool {
        self.state_dirty
    }

    pub fn clear_state_dirty(&mut self) {
        self.state_dirty = false;
    }

    pub fn mark_state_dirty(&mut self) {
        self.state_dirty = true;
    }

    /// Grow scratch to cover `per_thread_size`. Returns the allocation that
    /// was replaced, if any, so the caller can retire it once idle.
    pub fn set_required_scratch_space(
        &mut self,
        memory: &MemoryManager,
        caps: &GfxCoreCaps,
        per_thread_size: u32,
        global_stateless_heap: Option<&mut IndirectHeap>,
    ) -> Result<Option<Arc<GraphicsAllocation>>> {
        if per_thread_size <= self.per_thread_size {
            return Ok(None);
        }

        let size = per_thread_size as usize * self.max_threads as usize;
        let allocation = memory.allocate(size, AllocationType::ScratchSurface)?;
        info!(
            "Scratch grown to {} bytes per thread ({} bytes total) at 0x{:X}",
            per_thread_size,
            allocation.size(),
            allocation.gpu_address()
        );

        if let Some(heap) = global_stateless_heap {
            let mut surface_state = vec![0u8; caps.render_surface_state_size];
            surface_state[..8].copy_from_slice(&allocation.gpu_address().to_le_bytes());
            surface_state[8..12].copy_from_slice(&per_thread_size.to_le_bytes());
            heap.write(SCRATCH_SURFACE_STATE_INDEX * caps.render_surface_state_size, &surface_state)?;
        }

        self.per_thread_size = per_thread_size;
        self.state_dirty = true;
        Ok(self.allocation.replace(allocation))
    }

    /// Value for the front-end scratch field.
    pub fn front_end_scratch_field(&self, caps: &GfxCoreCaps, global_stateless: bool) -> u64 {
        match &self.allocation {
            None => 0,
            Some(_) if global_stateless => (RESERVED_SURFACE_STATES * caps.render_surface_state_size) as u64,
            Some(allocation) => allocation.gpu_address(),
        }
    }
}
