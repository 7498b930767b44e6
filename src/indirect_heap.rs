//! Indirect heaps
//!
//! Linear allocators over a graphics allocation holding surface states,
//! dynamic state (samplers, interface descriptors) or indirect data.
//! Allocation is monotonic until the heap is reset.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{DriverError, Result};
use crate::hw_info::{align_up, PAGE_SIZE};
use crate::memory::GraphicsAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    DynamicState,
    IndirectObject,
    SurfaceState,
}

/// A heap owned by an engine and borrowed by several command lists.
pub type SharedHeap = Arc<Mutex<IndirectHeap>>;

#[derive(Debug)]
pub struct IndirectHeap {
    heap_type: HeapType,
    allocation: Arc<GraphicsAllocation>,
    contents: Vec<u8>,
    used: usize,
    /// Bytes at the start that survive `reset`.
    reserved_front: usize,
}

impl IndirectHeap {
    pub fn new(heap_type: HeapType, allocation: Arc<GraphicsAllocation>) -> Self {
        let size = allocation.size();
        Self {
            heap_type,
            allocation,
            contents: vec![0; size],
            used: 0,
            reserved_front: 0,
        }
    }

    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }

    pub fn max_available(&self) -> usize {
        self.contents.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.max_available() - self.used
    }

    /// Size programmed into state-base-address, in 4KB pages.
    pub fn size_in_pages(&self) -> u64 {
        (self.max_available() / PAGE_SIZE) as u64
    }

    /// Move the offset up to `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let aligned = align_up(self.used, alignment);
        if aligned > self.max_available() {
            return Err(DriverError::OutOfDeviceMemory { requested: aligned - self.used });
        }
        self.used = aligned;
        Ok(())
    }

    /// Reserve `size` bytes; returns their offset from the heap base.
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if size > self.available() {
            return Err(DriverError::OutOfDeviceMemory { requested: size });
        }
        let offset = self.used;
        self.used += size;
        trace!("{:?} heap: {} bytes at offset {}", self.heap_type, size, offset);
        Ok(offset)
    }

    /// Space needed to place `size` bytes after aligning to `alignment`.
    pub fn fits(&self, size: usize, alignment: usize) -> bool {
        align_up(self.used, alignment) + size <= self.max_available()
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > self.used {
            return Err(DriverError::InvalidArgument(format!(
                "heap write [{offset}, {end}) outside used range {}",
                self.used
            )));
        }
        self.contents[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.used);
        let end = (offset + len).min(self.used);
        &self.contents[start..end]
    }

    /// Permanently reserve the first `size` bytes.
    pub fn reserve_front(&mut self, size: usize) -> Result<()> {
        if size > self.max_available() {
            return Err(DriverError::OutOfDeviceMemory { requested: size });
        }
        self.reserved_front = size;
        self.used = self.used.max(size);
        Ok(())
    }

    /// Roll the offset back (used when an append fails).
    pub fn set_used(&mut self, used: usize) {
        self.used = used.clamp(self.reserved_front, self.max_available());
    }

    pub fn reset(&mut self) {
        self.used = self.reserved_front;
    }

    /// Switch to a new backing allocation; returns the old one.
    pub fn replace_allocation(&mut self, allocation: Arc<GraphicsAllocation>) -> Arc<GraphicsAllocation> {
        self.contents = vec![0; allocation.size()];
        self.used = self.reserved_front.min(self.contents.len());
        std::mem::replace(&mut self.allocation, allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationType, MemoryManager};

    fn heap(size: usize) -> IndirectHeap {
        let mm = MemoryManager::new(true, 1 << 30);
        IndirectHeap::new(
            HeapType::SurfaceState,
            mm.allocate(size, AllocationType::InternalHeap).unwrap(),
        )
    }

    #[test]
    fn test_monotonic_allocation() {
        let mut ssh = heap(4096);
        assert_eq!(ssh.get_space(100).unwrap(), 0);
        ssh.align(64).unwrap();
        assert_eq!(ssh.get_space(64).unwrap(), 128);
        assert_eq!(ssh.used(), 192);
        assert!(ssh.get_space(4096).is_err());
        assert!(ssh.used() <= ssh.max_available());
    }

    #[test]
    fn test_reserved_front_survives_reset() {
        let mut ssh = heap(4096);
        ssh.reserve_front(128).unwrap();
        ssh.get_space(64).unwrap();
        ssh.reset();
        assert_eq!(ssh.used(), 128);
        ssh.set_used(0);
        assert_eq!(ssh.used(), 128);
    }

    #[test]
    fn test_write_inside_used_range() {
        let mut dsh = heap(4096);
        let offset = dsh.get_space(8).unwrap();
        dsh.write(offset, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(dsh.read(offset, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(dsh.write(offset + 4, &[0; 8]).is_err());
    }

    #[test]
    fn test_size_in_pages() {
        assert_eq!(heap(64 * 1024).size_in_pages(), 16);
    }
}
