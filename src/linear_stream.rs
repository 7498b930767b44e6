//! Linear command stream
//!
//! A bump allocator of command bytes over one command-buffer allocation.

use std::sync::Arc;

use crate::error::{DriverError, Result};
use crate::hw_cmds::{command_bytes, Command};
use crate::memory::GraphicsAllocation;

#[derive(Debug)]
pub struct LinearStream {
    allocation: Arc<GraphicsAllocation>,
    buffer: Vec<u8>,
    max_available: usize,
}

impl LinearStream {
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        let max_available = allocation.size();
        Self {
            allocation,
            buffer: Vec::with_capacity(max_available.min(64 * 1024)),
            max_available,
        }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }

    /// GPU address of the next byte to be written.
    pub fn current_gpu_address(&self) -> u64 {
        self.gpu_base() + self.buffer.len() as u64
    }

    pub fn used(&self) -> usize {
        self.buffer.len()
    }

    pub fn available(&self) -> usize {
        self.max_available - self.buffer.len()
    }

    pub fn max_available(&self) -> usize {
        self.max_available
    }

    /// Reserve `size` bytes and return them zeroed.
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.available() {
            return Err(DriverError::OutOfDeviceMemory { requested: size });
        }
        let start = self.buffer.len();
        self.buffer.resize(start + size, 0);
        Ok(&mut self.buffer[start..])
    }

    /// Append a command; returns its offset in the stream.
    pub fn emit<T: Command>(&mut self, cmd: &T) -> Result<usize> {
        let offset = self.used();
        let bytes = command_bytes(cmd);
        self.get_space(bytes.len())?.copy_from_slice(bytes);
        Ok(offset)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn bytes_from(&self, offset: usize) -> &[u8] {
        &self.buffer[offset.min(self.buffer.len())..]
    }

    /// Drop everything written after `offset`.
    pub fn truncate(&mut self, offset: usize) {
        self.buffer.truncate(offset);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Continue writing into a fresh allocation. Returns the previous
    /// allocation together with the bytes written into it.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>) -> (Arc<GraphicsAllocation>, Vec<u8>) {
        self.max_available = allocation.size();
        let bytes = std::mem::take(&mut self.buffer);
        (std::mem::replace(&mut self.allocation, allocation), bytes)
    }

    /// Undo a `replace_buffer`.
    pub fn restore(&mut self, allocation: Arc<GraphicsAllocation>, bytes: Vec<u8>) -> Arc<GraphicsAllocation> {
        self.max_available = allocation.size();
        self.buffer = bytes;
        std::mem::replace(&mut self.allocation, allocation)
    }
}
