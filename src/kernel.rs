//! Kernel descriptors
//!
//! The subset of a compiled kernel's metadata that affects encoding: how
//! each argument is addressed, how much heap space a dispatch needs and which
//! hardware modes it requires.

use std::sync::Arc;

use crate::error::{DriverError, Result};

/// How a pointer argument is accessed. Offsets are byte offsets into the
/// kernel's surface-state area (bindful/bindless) or cross-thread data
/// (stateless).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgDescPointer {
    pub bindful: Option<u16>,
    pub bindless: Option<u16>,
    pub stateless: Option<u16>,
    pub pointer_size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDescriptor {
    Pointer(ArgDescPointer),
    Value { offset: u16, size: u16 },
    Image { bindful: Option<u16>, bindless: Option<u16> },
    Sampler { bindful: Option<u16>, bindless: Option<u16> },
}

impl ArgDescriptor {
    /// A pointer reached only through its stateless address.
    pub fn stateless_pointer(cross_thread_offset: u16) -> Self {
        ArgDescriptor::Pointer(ArgDescPointer {
            stateless: Some(cross_thread_offset),
            pointer_size: 8,
            ..Default::default()
        })
    }

    /// A pointer with a binding-table surface state as well as a stateless address.
    pub fn bindful_pointer(surface_state_offset: u16, cross_thread_offset: u16) -> Self {
        ArgDescriptor::Pointer(ArgDescPointer {
            bindful: Some(surface_state_offset),
            stateless: Some(cross_thread_offset),
            pointer_size: 8,
            ..Default::default()
        })
    }

    pub fn bindless_pointer(surface_state_offset: u16, cross_thread_offset: u16) -> Self {
        ArgDescriptor::Pointer(ArgDescPointer {
            bindless: Some(surface_state_offset),
            stateless: Some(cross_thread_offset),
            pointer_size: 8,
            ..Default::default()
        })
    }

    /// True when the argument needs a surface state (bindful or bindless).
    pub fn is_stateful(&self) -> bool {
        match self {
            ArgDescriptor::Pointer(ptr) => ptr.bindful.is_some() || ptr.bindless.is_some(),
            _ => false,
        }
    }
}

/// Metadata of a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub name: String,
    /// Stable id written into the walker for diagnostics.
    pub kernel_id: u32,
    pub args: Vec<ArgDescriptor>,
    /// Per-thread scratch for slot 0 and slot 1 (private memory).
    pub per_thread_scratch_size: [u32; 2],
    pub num_binding_table_entries: u32,
    pub num_samplers: u32,
    pub cross_thread_data_size: u32,
    pub per_thread_data_size: u32,
    pub simd_size: u32,
    pub group_size: [u32; 3],
    pub num_grf_required: u32,
    pub requires_disabled_eu_fusion: bool,
    /// The kernel dereferences pointers it was not passed explicitly.
    pub has_indirect_access: bool,
    pub uses_atomics: bool,
}

pub const DEFAULT_GRF_COUNT: u32 = 128;
pub const LARGE_GRF_COUNT: u32 = 256;

impl KernelDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kernel_id: 0,
            args: Vec::new(),
            per_thread_scratch_size: [0, 0],
            num_binding_table_entries: 0,
            num_samplers: 0,
            cross_thread_data_size: 64,
            per_thread_data_size: 0,
            simd_size: 32,
            group_size: [32, 1, 1],
            num_grf_required: DEFAULT_GRF_COUNT,
            requires_disabled_eu_fusion: false,
            has_indirect_access: false,
            uses_atomics: false,
        }
    }

    pub fn threads_per_group(&self) -> u32 {
        let work_items: u32 = self.group_size.iter().product();
        work_items.div_ceil(self.simd_size.max(1))
    }

    pub fn uses_large_grf(&self) -> bool {
        self.num_grf_required > DEFAULT_GRF_COUNT
    }

    /// Largest per-thread scratch requirement across both slots.
    pub fn scratch_size(&self) -> u32 {
        self.per_thread_scratch_size[0].max(self.per_thread_scratch_size[1])
    }

    /// Index of the first argument that needs a surface state, if any.
    pub fn first_stateful_arg(&self) -> Option<usize> {
        self.args.iter().position(ArgDescriptor::is_stateful)
    }
}

/// Value bound to one kernel argument at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Device-visible pointer (USM, host pointer or reserved VA).
    Pointer(u64),
    Bytes(Vec<u8>),
    Image(u64),
    Sampler(u32),
    Unset,
}

/// A kernel with bound arguments, ready to launch.
#[derive(Debug, Clone)]
pub struct Kernel {
    descriptor: Arc<KernelDescriptor>,
    arg_values: Vec<ArgValue>,
    group_size: [u32; 3],
}

impl Kernel {
    pub fn new(descriptor: Arc<KernelDescriptor>) -> Self {
        let arg_values = vec![ArgValue::Unset; descriptor.args.len()];
        let group_size = descriptor.group_size;
        Self {
            descriptor,
            arg_values,
            group_size,
        }
    }

    pub fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    pub fn set_arg(&mut self, index: usize, value: ArgValue) -> Result<()> {
        let slot = self.arg_values.get_mut(index).ok_or_else(|| {
            DriverError::InvalidArgument(format!(
                "kernel '{}' has no argument {}",
                self.descriptor.name, index
            ))
        })?;
        *slot = value;
        Ok(())
    }

    pub fn arg_values(&self) -> &[ArgValue] {
        &self.arg_values
    }

    pub fn set_group_size(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(DriverError::InvalidArgument("group size must be non-zero".to_string()));
        }
        self.group_size = [x, y, z];
        Ok(())
    }

    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    /// Pointer arguments, in argument order.
    pub fn pointer_args(&self) -> impl Iterator<Item = u64> + '_ {
        self.arg_values.iter().filter_map(|v| match v {
            ArgValue::Pointer(ptr) => Some(*ptr),
            _ => None,
        })
    }

    /// Reject kernels that need stateful argument access on a
    /// global-stateless list.
    pub fn check_stateless_only(&self) -> Result<()> {
        match self.descriptor.first_stateful_arg() {
            Some(arg_index) => Err(DriverError::StatefulAccessUnderGlobalStateless {
                kernel: self.descriptor.name.clone(),
                arg_index,
            }),
            None => Ok(()),
        }
    }
}

/// Dispatch dimensions (thread-group counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupCount {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateful_detection() {
        let mut desc = KernelDescriptor::new("k");
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        desc.args.push(ArgDescriptor::Value { offset: 8, size: 4 });
        assert_eq!(desc.first_stateful_arg(), None);

        desc.args.push(ArgDescriptor::bindless_pointer(0x40, 16));
        assert_eq!(desc.first_stateful_arg(), Some(2));

        let kernel = Kernel::new(Arc::new(desc));
        let err = kernel.check_stateless_only().unwrap_err();
        assert!(matches!(
            err,
            DriverError::StatefulAccessUnderGlobalStateless { arg_index: 2, .. }
        ));
    }

    #[test]
    fn test_threads_per_group() {
        let mut desc = KernelDescriptor::new("k");
        desc.simd_size = 16;
        desc.group_size = [64, 2, 1];
        assert_eq!(desc.threads_per_group(), 8);
        desc.group_size = [17, 1, 1];
        assert_eq!(desc.threads_per_group(), 2);
    }

    #[test]
    fn test_set_arg_bounds() {
        let mut desc = KernelDescriptor::new("k");
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        let mut kernel = Kernel::new(Arc::new(desc));
        kernel.set_arg(0, ArgValue::Pointer(0x1000)).unwrap();
        assert!(kernel.set_arg(1, ArgValue::Pointer(0x2000)).is_err());
        assert_eq!(kernel.pointer_args().collect::<Vec<_>>(), vec![0x1000]);
    }

    #[test]
    fn test_scratch_size_takes_larger_slot() {
        let mut desc = KernelDescriptor::new("k");
        desc.per_thread_scratch_size = [0x40, 0x100];
        assert_eq!(desc.scratch_size(), 0x100);
    }
}
