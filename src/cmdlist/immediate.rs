//! Immediate submission: what an immediate list recorded since its last
//! flush reaches the engine before the append returns, either through the
//! engine's flush-task path or through an internal queue execution.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{patch_front_end_scratch, CommandList};
use crate::cmdqueue::{submit_executions, ListExecution};
use crate::csr::{lock_csr, ImmediateFlush};
use crate::error::{DriverError, Result};
use crate::event::Event;
use crate::hw_cmds::*;

impl CommandList {
    pub(super) fn execute_immediate(&mut self, signal_event: Option<&Arc<Event>>, num_wait_events: usize) -> Result<()> {
        let csr_handle = self
            .csr
            .clone()
            .ok_or_else(|| DriverError::InvalidArgument("immediate list without an engine".to_string()))?;
        let relaxed_ordering = self.is_relaxed_ordering_dispatch_allowed(num_wait_events);
        let config = self.device.config().clone();
        let caps = self.device.caps().clone();

        self.container.emit(&MiBatchBufferEndCmd::init())?;
        if let Some(event) = signal_event {
            event.set_csr(self.engine_id)?;
        }

        let segment_start = self.segment_start;
        let mut segment = self.container.segment_since(segment_start);
        let segment_address = self.container.gpu_address_of(segment_start);

        // The engine lock is held for the whole submission; nothing below
        // may go through the container's engine-backed heaps.
        let (tag, task_count) = {
            let mut csr = lock_csr(&csr_handle)?;
            if !self.front_end_patches.is_empty() {
                csr.ensure_scratch(self.max_scratch_size, self.global_stateless)?;
                let field = csr
                    .scratch_controller()
                    .front_end_scratch_field(&caps, self.global_stateless);
                patch_front_end_scratch(&mut segment, segment_start, &self.front_end_patches, field);
            }
            if self.indirect_allocations_allowed {
                csr.handle_indirect_allocations_residency()?;
            }
            csr.make_resident_all(self.container.residency());
            if config.force_memory_prefetch_for_kmd_migrated_shared_allocations && self.contains_any_kernel {
                csr.prefetch_shared_allocations(&self.prefetch_allocations, config.enable_bo_chunking_prefetch)?;
            }

            let task_count = if config.use_immediate_flush_task {
                let task_count = csr.flush_immediate_task(ImmediateFlush {
                    required: &self.required_stream_state,
                    final_state: &self.final_stream_state,
                    segment_address,
                    segment,
                    global_stateless: self.global_stateless,
                    scratch_size: self.max_scratch_size,
                    has_relaxed_ordering_dependencies: relaxed_ordering,
                })?;
                self.counters.flush_task_submissions += 1;
                task_count
            } else {
                let stream = self
                    .queue_stream
                    .as_mut()
                    .ok_or_else(|| DriverError::InvalidArgument("immediate list without a queue stream".to_string()))?;
                let execution = ListExecution {
                    required: &self.required_stream_state,
                    final_state: &self.final_stream_state,
                    start_address: segment_address,
                    chunks: segment,
                };
                let task_count =
                    submit_executions(&mut csr, stream, vec![execution], self.global_stateless, relaxed_ordering)?;
                self.counters.queue_submissions += 1;
                task_count
            };
            for allocation in self.owned_allocations.drain(..) {
                csr.add_temporary_allocation(allocation);
            }
            (csr.tag().clone(), task_count)
        };
        trace!(
            "Immediate list on engine {} flushed as task {}",
            self.engine_id,
            task_count
        );

        if let Some(event) = signal_event {
            event.assign_completion(self.engine_id, tag.clone(), task_count)?;
        }
        self.reset_stream_state();
        self.prefetch_allocations.clear();
        self.front_end_patches.clear();
        self.indirect_allocations_allowed = false;
        self.segment_start = self.container.position();

        if self.synchronous {
            lock_csr(&csr_handle)?.wait_for_task_count(task_count)?;
        }
        if tag.completed() >= task_count {
            self.container.reset()?;
            self.segment_start = self.container.position();
            debug!("Immediate list caught up with engine {}, buffers recycled", self.engine_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_parse::find_front_end_state;
    use crate::cmdlist::{CmdListKernelLaunchParams, ImmediateListDesc};
    use crate::cmdqueue::SubmissionMode;
    use crate::config::Config;
    use crate::csr::EngineGroupType;
    use crate::device::INTERNAL_ENGINE_ID;
    use crate::error::{SubmissionStatus, ZeResult};
    use crate::event::{EventDesc, EventPool, EVENT_SCOPE_FLAG_HOST};
    use crate::hw_info::GfxCoreCaps;
    use crate::kernel::{ArgDescriptor, ArgValue, GroupCount, Kernel, KernelDescriptor};
    use crate::testing::{counts, device, device_with, primary_commands};

    fn immediate(device: &Arc<crate::device::Device>, mode: SubmissionMode) -> CommandList {
        CommandList::create_immediate(device, &ImmediateListDesc { mode }, false, EngineGroupType::Compute).unwrap()
    }

    fn pointer_kernel(ptr: u64) -> Kernel {
        let mut desc = KernelDescriptor::new("pointer");
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        let mut kernel = Kernel::new(Arc::new(desc));
        kernel.set_arg(0, ArgValue::Pointer(ptr)).unwrap();
        kernel
    }

    #[test]
    fn test_flush_task_programs_state_once() {
        let (device, control) = device();
        let memory = device.memory().clone();
        let src = memory.alloc_device_mem(0x1000, 64).unwrap();
        let dst = memory.alloc_device_mem(0x1000, 64).unwrap();
        let mut list = immediate(&device, SubmissionMode::Default);

        list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap();
        list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap();

        let batches = control.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(counts(&primary_commands(&batches[0])).state_base_address, 1);
        assert_eq!(counts(&primary_commands(&batches[1])).state_base_address, 0);
        assert_eq!(list.counters().flush_task_submissions, 2);
        assert_eq!(list.counters().queue_submissions, 0);
    }

    #[test]
    fn test_queue_path_without_flush_task() {
        let config = Config {
            use_immediate_flush_task: false,
            ..Default::default()
        };
        let (device, control) = device_with(config, GfxCoreCaps::xe_hpg_core());
        let memory = device.memory().clone();
        let src = memory.alloc_device_mem(0x1000, 64).unwrap();
        let dst = memory.alloc_device_mem(0x1000, 64).unwrap();
        let mut list = immediate(&device, SubmissionMode::Default);

        list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap();
        list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap();

        assert_eq!(list.counters().queue_submissions, 2);
        assert_eq!(list.counters().flush_task_submissions, 0);
        let batches = control.batches();
        assert_eq!(counts(&primary_commands(&batches[0])).state_base_address, 1);
        assert_eq!(counts(&primary_commands(&batches[1])).state_base_address, 0);
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        assert_eq!(csr.counters().flush_task_calls, 0);
    }

    #[test]
    fn test_failed_flush_maps_status_and_rolls_back() {
        let (device, control) = device();
        let memory = device.memory().clone();
        let src = memory.alloc_device_mem(0x1000, 64).unwrap();
        let dst = memory.alloc_device_mem(0x1000, 64).unwrap();
        let mut list = immediate(&device, SubmissionMode::Default);
        let used_before = list.container().total_used();
        let task_before = lock_csr(list.csr().unwrap()).unwrap().task_count();

        for (status, code) in [
            (SubmissionStatus::OutOfHostMemory, ZeResult::ErrorOutOfHostMemory),
            (SubmissionStatus::OutOfMemory, ZeResult::ErrorOutOfDeviceMemory),
        ] {
            control.force_status(status);
            let err = list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap_err();
            assert_eq!(err.code(), code);
            assert_eq!(list.container().total_used(), used_before);
            assert!(!list.contains_any_kernel());
            assert_eq!(lock_csr(list.csr().unwrap()).unwrap().task_count(), task_before);
        }

        control.force_status(SubmissionStatus::Success);
        list.append_memory_copy(dst, src, 0x100, None, &[]).unwrap();
        assert_eq!(control.batches().len(), 1);
        assert_eq!(counts(&primary_commands(&control.batches()[0])).state_base_address, 1);
    }

    #[test]
    fn test_contains_any_kernel_reset_for_every_prefetch_toggle() {
        for prefetch in [false, true] {
            for chunking in [false, true] {
                let config = Config {
                    force_memory_prefetch_for_kmd_migrated_shared_allocations: prefetch,
                    enable_bo_chunking_prefetch: chunking,
                    ..Default::default()
                };
                let (device, _) = device_with(config, GfxCoreCaps::xe_hpg_core());
                let shared = device.memory().alloc_shared_mem(0x1000, 64).unwrap();
                let mut list = immediate(&device, SubmissionMode::Default);
                list.append_launch_kernel(
                    &pointer_kernel(shared),
                    GroupCount::linear(1),
                    None,
                    &[],
                    &CmdListKernelLaunchParams::default(),
                )
                .unwrap();
                assert!(!list.contains_any_kernel());
                let prefetched = lock_csr(list.csr().unwrap()).unwrap().counters().prefetched_allocations;
                assert_eq!(prefetched > 0, prefetch);
            }
        }
    }

    #[test]
    fn test_indirect_residency_handled_once_per_flush() {
        let (device, _) = device();
        let mut desc = KernelDescriptor::new("indirect");
        desc.has_indirect_access = true;
        let kernel = Kernel::new(Arc::new(desc));
        let mut list = immediate(&device, SubmissionMode::Default);
        list.append_launch_kernel(&kernel, GroupCount::linear(1), None, &[], &Default::default())
            .unwrap();
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        assert_eq!(csr.counters().indirect_residency_calls, 1);
        drop(csr);
        assert!(!list.has_indirect_allocations_allowed());
    }

    #[test]
    fn test_indirect_residency_skipped_when_not_allowed() {
        let (device, _) = device();
        let kernel = Kernel::new(Arc::new(KernelDescriptor::new("direct")));
        let mut list = immediate(&device, SubmissionMode::Default);
        list.append_launch_kernel(&kernel, GroupCount::linear(1), None, &[], &Default::default())
            .unwrap();
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        assert_eq!(csr.counters().indirect_residency_calls, 0);
        assert_eq!(csr.counters().flush_task_calls, 1);
    }

    #[test]
    fn test_rejected_flush_keeps_scratch_program_due() {
        let (device, control) = device();
        let mut list = immediate(&device, SubmissionMode::Default);
        let plain = Kernel::new(Arc::new(KernelDescriptor::new("plain")));
        let mut desc = KernelDescriptor::new("private_memory");
        desc.per_thread_scratch_size = [0x100, 0];
        let with_scratch = Kernel::new(Arc::new(desc));

        list.append_launch_kernel(&plain, GroupCount::linear(1), None, &[], &Default::default())
            .unwrap();

        control.force_status(SubmissionStatus::OutOfHostMemory);
        let err = list
            .append_launch_kernel(&with_scratch, GroupCount::linear(1), None, &[], &Default::default())
            .unwrap_err();
        assert_eq!(err.code(), ZeResult::ErrorOutOfHostMemory);
        {
            let csr = lock_csr(list.csr().unwrap()).unwrap();
            assert!(csr.scratch_controller().is_state_dirty());
            assert_eq!(csr.counters().flush_task_calls, 1);
        }

        control.force_status(SubmissionStatus::Success);
        control.clear();
        list.append_launch_kernel(&with_scratch, GroupCount::linear(1), None, &[], &Default::default())
            .unwrap();

        let batches = control.batches();
        assert_eq!(batches.len(), 1);
        let front_ends = find_front_end_state(&primary_commands(&batches[0]));
        assert_eq!(front_ends.len(), 1);
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        let scratch = csr.scratch_controller().allocation().unwrap().clone();
        assert_eq!(front_ends[0].scratch_space_buffer, scratch.gpu_address());
        assert!(batches[0].residency.contains(&scratch.id()));
        assert!(!csr.scratch_controller().is_state_dirty());
        assert_eq!(csr.counters().flush_task_calls, 2);
    }

    #[test]
    fn test_synchronous_list_waits_for_completion() {
        let (device, _) = device();
        let mut list = immediate(&device, SubmissionMode::Synchronous);
        assert!(list.is_synchronous());
        list.append_barrier(None, &[]).unwrap();
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        assert_eq!(csr.tag().completed(), csr.task_count());
        assert_eq!(csr.task_count(), 1);
    }

    #[test]
    fn test_signal_event_takes_list_engine() {
        let (device, _) = device();
        let pool = EventPool::create(device.memory(), 1).unwrap();
        let event = pool
            .create_event(EventDesc {
                index: 0,
                signal_scope: EVENT_SCOPE_FLAG_HOST,
                wait_scope: 0,
            })
            .unwrap();
        event.set_csr(7).unwrap();
        let mut list = immediate(&device, SubmissionMode::Default);
        list.append_signal_event(&event).unwrap();

        let engine = lock_csr(list.csr().unwrap()).unwrap().engine_id();
        assert_eq!(event.csr().unwrap(), Some(engine));
        assert_eq!(event.query_status(), ZeResult::Success);
    }

    #[test]
    fn test_internal_list_uses_internal_engine() {
        let (device, control) = device();
        let mut list =
            CommandList::create_immediate(&device, &ImmediateListDesc::default(), true, EngineGroupType::Compute)
                .unwrap();
        list.append_barrier(None, &[]).unwrap();
        assert_eq!(control.batches_for(INTERNAL_ENGINE_ID).len(), 1);
        assert!(control.batches_for(0).is_empty());
    }

    #[test]
    fn test_host_pointer_allocation_handed_to_engine() {
        let (device, _) = device();
        let src = device.memory().alloc_device_mem(0x1000, 64).unwrap();
        let mut list = immediate(&device, SubmissionMode::Default);
        list.append_memory_copy(0x20_0000, src, 0x100, None, &[]).unwrap();
        let csr = lock_csr(list.csr().unwrap()).unwrap();
        assert_eq!(csr.temporary_allocation_count(), 1);
    }
}
