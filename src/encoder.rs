//! Kernel dispatch encoder
//!
//! Writes one kernel launch into a command container: surface states and
//! the binding table into the surface heap, samplers and the interface
//! descriptor into the dynamic heap, cross-thread data into the indirect
//! object heap and finally the COMPUTE_WALKER.
//!
//! Heap consumption of a dispatch starting on aligned heap offsets equals
//! [`estimate_heaps`] exactly.

use tracing::trace;

use crate::command_container::CommandContainer;
use crate::error::{DriverError, Result};
use crate::hw_cmds::*;
use crate::hw_info::{align_up, GfxCoreCaps};
use crate::indirect_heap::HeapType;
use crate::kernel::{ArgDescriptor, ArgValue, GroupCount, KernelDescriptor};
use crate::memory::decanonize;

/// Everything needed to encode one launch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchArgs<'a> {
    pub descriptor: &'a KernelDescriptor,
    pub arg_values: &'a [ArgValue],
    pub group_count: GroupCount,
    pub group_size: [u32; 3],
    pub partition_count: u32,
    pub global_stateless: bool,
}

/// Bytes one dispatch takes from each heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapEstimate {
    pub ssh: usize,
    pub dsh: usize,
    pub ioh: usize,
}

/// Heap space a dispatch of `desc` needs. Under global-stateless
/// addressing no surface state is consumed.
pub fn estimate_heaps(caps: &GfxCoreCaps, desc: &KernelDescriptor, idd_count: u32, global_stateless: bool) -> HeapEstimate {
    HeapEstimate {
        ssh: if global_stateless { 0 } else { caps.size_required_ssh(desc) },
        dsh: caps.size_required_dsh(desc, idd_count),
        ioh: caps.size_required_ioh(desc),
    }
}

/// Make sure the container's heaps can take `estimate`.
pub fn reserve_heaps(container: &mut CommandContainer, caps: &GfxCoreCaps, estimate: &HeapEstimate) -> Result<()> {
    container.ensure_heap_space(HeapType::SurfaceState, estimate.ssh, caps.default_ssh_alignment)?;
    container.ensure_heap_space(HeapType::DynamicState, estimate.dsh, caps.default_dsh_alignment)?;
    container.ensure_heap_space(HeapType::IndirectObject, estimate.ioh, caps.ioh_alignment)?;
    Ok(())
}

/// Where the encoded launch landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedDispatch {
    pub binding_table_offset: u32,
    pub sampler_state_offset: u32,
    pub interface_descriptor_offset: u32,
    pub indirect_data_offset: usize,
}

fn surface_state(address: u64, size: u64, mocs: u32, surface_state_size: usize) -> Vec<u8> {
    let mut state = vec![0u8; surface_state_size];
    state[..8].copy_from_slice(&address.to_le_bytes());
    state[8..16].copy_from_slice(&size.to_le_bytes());
    state[16..20].copy_from_slice(&GfxCoreCaps::encode_mocs(mocs).to_le_bytes());
    state
}

fn pointer_value(values: &[ArgValue], index: usize) -> u64 {
    match values.get(index) {
        Some(ArgValue::Pointer(ptr)) | Some(ArgValue::Image(ptr)) => *ptr,
        _ => 0,
    }
}

fn encode_surface_states(
    container: &mut CommandContainer,
    caps: &GfxCoreCaps,
    args: &DispatchArgs<'_>,
) -> Result<u32> {
    let desc = args.descriptor;
    let entries = desc.num_binding_table_entries as usize;
    if args.global_stateless || entries == 0 {
        return Ok(0);
    }
    let rss = caps.render_surface_state_size;
    let states_offset = container.allocate_heap_space(HeapType::SurfaceState, entries * rss, caps.default_ssh_alignment)?;

    for (index, arg) in desc.args.iter().enumerate() {
        let bindful = match arg {
            ArgDescriptor::Pointer(ptr) => ptr.bindful,
            ArgDescriptor::Image { bindful, .. } => *bindful,
            _ => None,
        };
        if let Some(offset) = bindful {
            let offset = offset as usize;
            if offset + rss > entries * rss {
                return Err(DriverError::InvalidArgument(format!(
                    "kernel '{}' argument {} surface state outside its binding table",
                    desc.name, index
                )));
            }
            let state = surface_state(pointer_value(args.arg_values, index), 0, caps.stateless_mocs_index, rss);
            container.write_heap(HeapType::SurfaceState, states_offset + offset, &state)?;
        }
    }

    let table_size = align_up(entries * caps.binding_table_state_size, rss);
    let table_offset = container.allocate_heap_space(HeapType::SurfaceState, table_size, rss)?;
    let mut table = vec![0u8; table_size];
    for entry in 0..entries {
        let pointer = (states_offset + entry * rss) as u32;
        let at = entry * caps.binding_table_state_size;
        table[at..at + 4].copy_from_slice(&pointer.to_le_bytes());
    }
    container.write_heap(HeapType::SurfaceState, table_offset, &table)?;
    Ok(table_offset as u32)
}

fn encode_dynamic_state(
    container: &mut CommandContainer,
    caps: &GfxCoreCaps,
    args: &DispatchArgs<'_>,
    binding_table_offset: u32,
    sampler_state_offset: &mut u32,
) -> Result<u32> {
    let desc = args.descriptor;
    if !caps.dsh_supported {
        return Ok(0);
    }
    if desc.num_samplers > 0 {
        let size = align_up(
            align_up(
                caps.border_color_size + desc.num_samplers as usize * caps.sampler_state_size,
                caps.sampler_state_alignment,
            ),
            caps.default_dsh_alignment,
        );
        let offset = container.allocate_heap_space(HeapType::DynamicState, size, caps.default_dsh_alignment)?;
        *sampler_state_offset = (offset + caps.border_color_size) as u32;
    }
    if !caps.idd_in_dsh {
        return Ok(0);
    }

    let offset = container.allocate_interface_descriptor()?;
    let mut idd = vec![0u8; caps.interface_descriptor_size];
    idd[0..4].copy_from_slice(&desc.kernel_id.to_le_bytes());
    idd[4..8].copy_from_slice(&binding_table_offset.to_le_bytes());
    idd[8..12].copy_from_slice(&sampler_state_offset.to_le_bytes());
    idd[12..16].copy_from_slice(&desc.threads_per_group().to_le_bytes());
    container.write_heap(HeapType::DynamicState, offset, &idd)?;
    Ok(offset as u32)
}

/// Cross-thread data: stateless pointers and by-value arguments.
fn cross_thread_data(args: &DispatchArgs<'_>) -> Vec<u8> {
    let desc = args.descriptor;
    let mut data = vec![0u8; desc.cross_thread_data_size as usize];
    for (index, arg) in desc.args.iter().enumerate() {
        match (arg, args.arg_values.get(index)) {
            (ArgDescriptor::Pointer(ptr), Some(ArgValue::Pointer(value))) => {
                if let Some(offset) = ptr.stateless {
                    let offset = offset as usize;
                    let len = (ptr.pointer_size as usize).min(8);
                    if offset + len <= data.len() {
                        data[offset..offset + len].copy_from_slice(&value.to_le_bytes()[..len]);
                    }
                }
            }
            (ArgDescriptor::Value { offset, size }, Some(ArgValue::Bytes(bytes))) => {
                let offset = *offset as usize;
                if offset < data.len() {
                    let len = (*size as usize).min(bytes.len()).min(data.len() - offset);
                    data[offset..offset + len].copy_from_slice(&bytes[..len]);
                }
            }
            _ => {}
        }
    }
    data
}

/// Encode one launch. Heaps must have been reserved with
/// [`reserve_heaps`].
pub fn encode_dispatch(
    container: &mut CommandContainer,
    caps: &GfxCoreCaps,
    args: &DispatchArgs<'_>,
) -> Result<EncodedDispatch> {
    let desc = args.descriptor;
    if args.group_count.is_empty() {
        return Err(DriverError::InvalidArgument(format!(
            "kernel '{}' launched with an empty group count",
            desc.name
        )));
    }

    let binding_table_offset = encode_surface_states(container, caps, args)?;
    let mut sampler_state_offset = 0;
    let interface_descriptor_offset =
        encode_dynamic_state(container, caps, args, binding_table_offset, &mut sampler_state_offset)?;

    let ioh_size = caps.size_required_ioh(desc);
    let indirect_data_offset = container.allocate_heap_space(HeapType::IndirectObject, ioh_size, caps.ioh_alignment)?;
    let mut indirect_data = cross_thread_data(args);
    indirect_data.resize(ioh_size, 0);
    container.write_heap(HeapType::IndirectObject, indirect_data_offset, &indirect_data)?;
    let ioh_base = container.heap_gpu_base(HeapType::IndirectObject)?;

    let mut walker = ComputeWalkerCmd::init();
    walker.kernel_id = desc.kernel_id;
    walker.simd_size = desc.simd_size;
    walker.thread_group_id_x_dimension = args.group_count.x;
    walker.thread_group_id_y_dimension = args.group_count.y;
    walker.thread_group_id_z_dimension = args.group_count.z;
    walker.group_size_x = args.group_size[0];
    walker.group_size_y = args.group_size[1];
    walker.group_size_z = args.group_size[2];
    walker.interface_descriptor_offset = interface_descriptor_offset;
    walker.binding_table_offset = binding_table_offset;
    walker.sampler_state_offset = sampler_state_offset;
    walker.indirect_data_start_address = (decanonize(ioh_base) + indirect_data_offset as u64) as u32;
    walker.indirect_data_length = ioh_size as u32;
    walker.partition_count = args.partition_count.max(1);
    container.emit(&walker)?;

    trace!(
        "Encoded '{}' [{}x{}x{}] bt=0x{:X} ioh=0x{:X}",
        desc.name,
        args.group_count.x,
        args.group_count.y,
        args.group_count.z,
        binding_table_offset,
        indirect_data_offset
    );
    Ok(EncodedDispatch {
        binding_table_offset,
        sampler_state_offset,
        interface_descriptor_offset,
        indirect_data_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cmd_parse::{find_compute_walkers, parse_command_buffer};
    use crate::memory::MemoryManager;

    fn container(caps: &Arc<GfxCoreCaps>, global_stateless: bool) -> CommandContainer {
        let memory = Arc::new(MemoryManager::new(true, 1 << 32));
        let mut container = CommandContainer::new(memory, caps.clone(), 64 * 1024, 64 * 1024, 64).unwrap();
        container.initialize_heaps(global_stateless, false).unwrap();
        container
    }

    fn kernel() -> KernelDescriptor {
        let mut desc = KernelDescriptor::new("copy");
        desc.args.push(ArgDescriptor::bindful_pointer(0, 0));
        desc.args.push(ArgDescriptor::bindful_pointer(64, 8));
        desc.args.push(ArgDescriptor::Value { offset: 16, size: 8 });
        desc.num_binding_table_entries = 2;
        desc
    }

    fn launch<'a>(desc: &'a KernelDescriptor, values: &'a [ArgValue]) -> DispatchArgs<'a> {
        DispatchArgs {
            descriptor: desc,
            arg_values: values,
            group_count: GroupCount::linear(4),
            group_size: desc.group_size,
            partition_count: 1,
            global_stateless: false,
        }
    }

    #[test]
    fn test_consumption_matches_estimate() {
        let caps = Arc::new(GfxCoreCaps::xe_hpg_core());
        let mut container = container(&caps, false);
        let desc = kernel();
        let values = vec![
            ArgValue::Pointer(0x1_0000),
            ArgValue::Pointer(0x2_0000),
            ArgValue::Bytes(vec![1, 2, 3, 4, 5, 6, 7, 8]),
        ];
        let estimate = estimate_heaps(&caps, &desc, 64, false);
        for _ in 0..3 {
            reserve_heaps(&mut container, &caps, &estimate).unwrap();
            encode_dispatch(&mut container, &caps, &launch(&desc, &values)).unwrap();
        }
        assert_eq!(container.heap_used(HeapType::SurfaceState).unwrap(), 3 * estimate.ssh);
        assert_eq!(container.heap_used(HeapType::IndirectObject).unwrap(), 3 * estimate.ioh);
        assert_eq!(container.heap_used(HeapType::DynamicState).unwrap(), 3 * estimate.dsh);
    }

    #[test]
    fn test_walker_fields() {
        let caps = Arc::new(GfxCoreCaps::xe_hpg_core());
        let mut container = container(&caps, false);
        let desc = kernel();
        let values = vec![ArgValue::Pointer(0x1_0000), ArgValue::Pointer(0x2_0000), ArgValue::Unset];
        let mut args = launch(&desc, &values);
        args.partition_count = 2;
        let encoded = encode_dispatch(&mut container, &caps, &args).unwrap();

        let commands = parse_command_buffer(container.stream().bytes()).unwrap();
        let walkers = find_compute_walkers(&commands);
        assert_eq!(walkers.len(), 1);
        assert_eq!(walkers[0].thread_group_id_x_dimension, 4);
        assert_eq!(walkers[0].partition_count, 2);
        assert_eq!(walkers[0].binding_table_offset, encoded.binding_table_offset);
        let ioh_base = container.heap_gpu_base(HeapType::IndirectObject).unwrap();
        assert_eq!(walkers[0].indirect_data_start_address, decanonize(ioh_base) as u32);
    }

    #[test]
    fn test_cross_thread_data_layout() {
        let desc = kernel();
        let values = vec![
            ArgValue::Pointer(0xAABB),
            ArgValue::Pointer(0xCCDD),
            ArgValue::Bytes(vec![7; 8]),
        ];
        let data = cross_thread_data(&launch(&desc, &values));
        assert_eq!(&data[0..8], &0xAABBu64.to_le_bytes());
        assert_eq!(&data[8..16], &0xCCDDu64.to_le_bytes());
        assert_eq!(&data[16..24], &[7; 8]);
    }

    #[test]
    fn test_global_stateless_uses_no_surface_state() {
        let caps = Arc::new(GfxCoreCaps::xe_hpg_core());
        let mut container = container(&caps, true);
        let mut desc = KernelDescriptor::new("stateless");
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        let values = vec![ArgValue::Pointer(0x1000)];
        let mut args = launch(&desc, &values);
        args.global_stateless = true;
        let estimate = estimate_heaps(&caps, &desc, 64, true);
        assert_eq!(estimate.ssh, 0);
        reserve_heaps(&mut container, &caps, &estimate).unwrap();
        encode_dispatch(&mut container, &caps, &args).unwrap();
        assert!(!container.has_heap(HeapType::SurfaceState));
    }

    #[test]
    fn test_empty_group_count_rejected() {
        let caps = Arc::new(GfxCoreCaps::xe_hpg_core());
        let mut container = container(&caps, false);
        let desc = kernel();
        let values = vec![ArgValue::Unset; 3];
        let mut args = launch(&desc, &values);
        args.group_count = GroupCount::new(0, 1, 1);
        assert!(encode_dispatch(&mut container, &caps, &args).is_err());
    }
}
