//! Tri-state stream properties
//!
//! Hardware state is tracked as groups of optional fields. `None` means
//! "not required"; such fields are never programmed. Setting a field to a
//! value different from the current one marks it dirty, and the reconciler
//! emits a command for every dirty group.

use serde::{Deserialize, Serialize};

use crate::hw_info::{FrontEndSupport, PipelineSelectSupport, StateComputeModeSupport};

/// A single tracked hardware field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamProperty<T> {
    value: Option<T>,
    is_dirty: bool,
}

impl<T: Copy + PartialEq> StreamProperty<T> {
    /// Apply `new`; an unset input leaves the property untouched.
    pub fn set(&mut self, new: Option<T>) {
        if let Some(value) = new {
            if self.value != Some(value) {
                self.value = Some(value);
                self.is_dirty = true;
            }
        }
    }

    pub fn value(&self) -> Option<T> {
        self.value
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
    }

    /// Forget the value entirely (back to unset, not dirty).
    pub fn reset(&mut self) {
        self.value = None;
        self.is_dirty = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadArbitrationPolicy {
    #[default]
    AgeBased,
    RoundRobin,
    RoundRobinAfterDependency,
}

impl ThreadArbitrationPolicy {
    pub fn encode(self) -> u32 {
        match self {
            ThreadArbitrationPolicy::AgeBased => 0,
            ThreadArbitrationPolicy::RoundRobin => 1,
            ThreadArbitrationPolicy::RoundRobinAfterDependency => 2,
        }
    }
}

/// Requested values for one dispatch, before support filtering.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelStateRequest {
    pub compute_dispatch_all_walker: bool,
    pub disable_eu_fusion: bool,
    pub disable_overdispatch: bool,
    pub single_slice_dispatch_ccs_mode: bool,
    pub coherency_required: bool,
    pub large_grf_mode: bool,
    pub thread_arbitration_policy: ThreadArbitrationPolicy,
    pub systolic_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrontEndProperties {
    pub compute_dispatch_all_walker: StreamProperty<bool>,
    pub disable_eu_fusion: StreamProperty<bool>,
    pub disable_overdispatch: StreamProperty<bool>,
    pub single_slice_dispatch_ccs_mode: StreamProperty<bool>,
}

impl FrontEndProperties {
    /// Apply the fields the hardware supports; the rest stay unset.
    pub fn set_properties(&mut self, request: &KernelStateRequest, support: &FrontEndSupport) {
        self.clear_dirty();
        let pick = |supported: bool, value: bool| supported.then_some(value);
        self.compute_dispatch_all_walker
            .set(pick(support.compute_dispatch_all_walker, request.compute_dispatch_all_walker));
        self.disable_eu_fusion
            .set(pick(support.disable_eu_fusion, request.disable_eu_fusion));
        self.disable_overdispatch
            .set(pick(support.disable_overdispatch, request.disable_overdispatch));
        self.single_slice_dispatch_ccs_mode.set(pick(
            support.single_slice_dispatch_ccs_mode,
            request.single_slice_dispatch_ccs_mode,
        ));
    }

    /// Merge the set fields of `other`.
    pub fn set_from(&mut self, other: &FrontEndProperties) {
        self.compute_dispatch_all_walker.set(other.compute_dispatch_all_walker.value());
        self.disable_eu_fusion.set(other.disable_eu_fusion.value());
        self.disable_overdispatch.set(other.disable_overdispatch.value());
        self.single_slice_dispatch_ccs_mode.set(other.single_slice_dispatch_ccs_mode.value());
    }

    pub fn is_dirty(&self) -> bool {
        self.compute_dispatch_all_walker.is_dirty()
            || self.disable_eu_fusion.is_dirty()
            || self.disable_overdispatch.is_dirty()
            || self.single_slice_dispatch_ccs_mode.is_dirty()
    }

    pub fn clear_dirty(&mut self) {
        self.compute_dispatch_all_walker.clear_dirty();
        self.disable_eu_fusion.clear_dirty();
        self.disable_overdispatch.clear_dirty();
        self.single_slice_dispatch_ccs_mode.clear_dirty();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateComputeModeProperties {
    pub is_coherency_required: StreamProperty<bool>,
    pub large_grf_mode: StreamProperty<bool>,
    pub thread_arbitration_policy: StreamProperty<ThreadArbitrationPolicy>,
}

impl StateComputeModeProperties {
    pub fn set_properties(&mut self, request: &KernelStateRequest, support: &StateComputeModeSupport) {
        self.clear_dirty();
        self.is_coherency_required
            .set(support.coherency_required.then_some(request.coherency_required));
        self.large_grf_mode
            .set(support.large_grf_mode.then_some(request.large_grf_mode));
        self.thread_arbitration_policy.set(
            support
                .thread_arbitration_policy
                .then_some(request.thread_arbitration_policy),
        );
    }

    pub fn set_from(&mut self, other: &StateComputeModeProperties) {
        self.is_coherency_required.set(other.is_coherency_required.value());
        self.large_grf_mode.set(other.large_grf_mode.value());
        self.thread_arbitration_policy.set(other.thread_arbitration_policy.value());
    }

    pub fn is_dirty(&self) -> bool {
        self.is_coherency_required.is_dirty()
            || self.large_grf_mode.is_dirty()
            || self.thread_arbitration_policy.is_dirty()
    }

    pub fn clear_dirty(&mut self) {
        self.is_coherency_required.clear_dirty();
        self.large_grf_mode.clear_dirty();
        self.thread_arbitration_policy.clear_dirty();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSelectProperties {
    pub mode_selected: StreamProperty<bool>,
    pub systolic_mode: StreamProperty<bool>,
}

impl PipelineSelectProperties {
    pub fn set_properties(&mut self, request: &KernelStateRequest, support: &PipelineSelectSupport) {
        self.clear_dirty();
        self.mode_selected.set(support.mode_selected.then_some(true));
        self.systolic_mode
            .set(support.systolic_mode.then_some(request.systolic_mode));
    }

    pub fn set_from(&mut self, other: &PipelineSelectProperties) {
        self.mode_selected.set(other.mode_selected.value());
        self.systolic_mode.set(other.systolic_mode.value());
    }

    pub fn is_dirty(&self) -> bool {
        self.mode_selected.is_dirty() || self.systolic_mode.is_dirty()
    }

    pub fn clear_dirty(&mut self) {
        self.mode_selected.clear_dirty();
        self.systolic_mode.clear_dirty();
    }
}

/// Heap bases and sizes requested by a dispatch. Sizes are in 4KB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddressValues {
    pub surface_state_base_address: Option<u64>,
    pub surface_state_size: Option<u64>,
    pub dynamic_state_base_address: Option<u64>,
    pub dynamic_state_size: Option<u64>,
    pub indirect_object_base_address: Option<u64>,
    pub indirect_object_size: Option<u64>,
    pub binding_table_pool_base_address: Option<u64>,
    pub binding_table_pool_size: Option<u64>,
    pub global_atomics: Option<bool>,
    pub stateless_mocs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddressProperties {
    pub surface_state_base_address: StreamProperty<u64>,
    pub surface_state_size: StreamProperty<u64>,
    pub dynamic_state_base_address: StreamProperty<u64>,
    pub dynamic_state_size: StreamProperty<u64>,
    pub indirect_object_base_address: StreamProperty<u64>,
    pub indirect_object_size: StreamProperty<u64>,
    pub binding_table_pool_base_address: StreamProperty<u64>,
    pub binding_table_pool_size: StreamProperty<u64>,
    pub global_atomics: StreamProperty<bool>,
    pub stateless_mocs: StreamProperty<u32>,
}

impl StateBaseAddressProperties {
    pub fn set_properties(&mut self, values: &StateBaseAddressValues) {
        self.clear_dirty();
        self.apply(values);
    }

    fn apply(&mut self, values: &StateBaseAddressValues) {
        self.surface_state_base_address.set(values.surface_state_base_address);
        self.surface_state_size.set(values.surface_state_size);
        self.dynamic_state_base_address.set(values.dynamic_state_base_address);
        self.dynamic_state_size.set(values.dynamic_state_size);
        self.indirect_object_base_address.set(values.indirect_object_base_address);
        self.indirect_object_size.set(values.indirect_object_size);
        self.binding_table_pool_base_address.set(values.binding_table_pool_base_address);
        self.binding_table_pool_size.set(values.binding_table_pool_size);
        self.global_atomics.set(values.global_atomics);
        self.stateless_mocs.set(values.stateless_mocs);
    }

    /// Surface-state base and size only (global-stateless heap pinning).
    pub fn set_surface_state(&mut self, base: u64, size_in_pages: u64) {
        self.surface_state_base_address.set(Some(base));
        self.surface_state_size.set(Some(size_in_pages));
    }

    pub fn set_from(&mut self, other: &StateBaseAddressProperties) {
        self.apply(&other.values());
    }

    pub fn values(&self) -> StateBaseAddressValues {
        StateBaseAddressValues {
            surface_state_base_address: self.surface_state_base_address.value(),
            surface_state_size: self.surface_state_size.value(),
            dynamic_state_base_address: self.dynamic_state_base_address.value(),
            dynamic_state_size: self.dynamic_state_size.value(),
            indirect_object_base_address: self.indirect_object_base_address.value(),
            indirect_object_size: self.indirect_object_size.value(),
            binding_table_pool_base_address: self.binding_table_pool_base_address.value(),
            binding_table_pool_size: self.binding_table_pool_size.value(),
            global_atomics: self.global_atomics.value(),
            stateless_mocs: self.stateless_mocs.value(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.surface_state_base_address.is_dirty()
            || self.surface_state_size.is_dirty()
            || self.dynamic_state_base_address.is_dirty()
            || self.dynamic_state_size.is_dirty()
            || self.indirect_object_base_address.is_dirty()
            || self.indirect_object_size.is_dirty()
            || self.binding_table_pool_base_address.is_dirty()
            || self.binding_table_pool_size.is_dirty()
            || self.global_atomics.is_dirty()
            || self.stateless_mocs.is_dirty()
    }

    pub fn is_binding_table_pool_dirty(&self) -> bool {
        self.binding_table_pool_base_address.is_dirty() || self.binding_table_pool_size.is_dirty()
    }

    pub fn clear_dirty(&mut self) {
        self.surface_state_base_address.clear_dirty();
        self.surface_state_size.clear_dirty();
        self.dynamic_state_base_address.clear_dirty();
        self.dynamic_state_size.clear_dirty();
        self.indirect_object_base_address.clear_dirty();
        self.indirect_object_size.clear_dirty();
        self.binding_table_pool_base_address.clear_dirty();
        self.binding_table_pool_size.clear_dirty();
        self.global_atomics.clear_dirty();
        self.stateless_mocs.clear_dirty();
    }
}

/// All tracked state for one command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamProperties {
    pub state_compute_mode: StateComputeModeProperties,
    pub front_end_state: FrontEndProperties,
    pub pipeline_select: PipelineSelectProperties,
    pub state_base_address: StateBaseAddressProperties,
}

impl StreamProperties {
    /// True when no field in any group has been set.
    pub fn is_unset(&self) -> bool {
        *self == StreamProperties::default()
    }

    pub fn clear_dirty(&mut self) {
        self.state_compute_mode.clear_dirty();
        self.front_end_state.clear_dirty();
        self.pipeline_select.clear_dirty();
        self.state_base_address.clear_dirty();
    }

    /// Merge every set field of `other` (dirty flags follow the merge).
    pub fn set_from(&mut self, other: &StreamProperties) {
        self.state_compute_mode.set_from(&other.state_compute_mode);
        self.front_end_state.set_from(&other.front_end_state);
        self.pipeline_select.set_from(&other.pipeline_select);
        self.state_base_address.set_from(&other.state_base_address);
    }

    pub fn is_dirty(&self) -> bool {
        self.state_compute_mode.is_dirty()
            || self.front_end_state.is_dirty()
            || self.pipeline_select.is_dirty()
            || self.state_base_address.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_info::GfxCoreCaps;

    #[test]
    fn test_unset_input_is_ignored() {
        let mut prop = StreamProperty::<u64>::default();
        prop.set(None);
        assert!(!prop.is_set());
        assert!(!prop.is_dirty());

        prop.set(Some(0x1000));
        assert!(prop.is_dirty());
        prop.clear_dirty();
        prop.set(None);
        assert_eq!(prop.value(), Some(0x1000));
        assert!(!prop.is_dirty());
    }

    #[test]
    fn test_same_value_is_not_dirty() {
        let mut prop = StreamProperty::<bool>::default();
        prop.set(Some(true));
        prop.clear_dirty();
        prop.set(Some(true));
        assert!(!prop.is_dirty());
        prop.set(Some(false));
        assert!(prop.is_dirty());
    }

    #[test]
    fn test_front_end_filtered_by_support() {
        let caps = GfxCoreCaps::xe_hpg_core();
        let request = KernelStateRequest {
            compute_dispatch_all_walker: true,
            disable_eu_fusion: true,
            ..Default::default()
        };
        let mut fe = FrontEndProperties::default();
        fe.set_properties(&request, &caps.front_end_support);
        // xe_hpg does not expose compute-dispatch-all-walker
        assert!(!fe.compute_dispatch_all_walker.is_set());
        assert_eq!(fe.disable_eu_fusion.value(), Some(true));
        assert!(!fe.single_slice_dispatch_ccs_mode.is_set());
    }

    #[test]
    fn test_scm_filtered_by_support() {
        let request = KernelStateRequest {
            large_grf_mode: true,
            ..Default::default()
        };
        let mut scm = StateComputeModeProperties::default();
        scm.set_properties(&request, &GfxCoreCaps::gen9().scm_support);
        assert!(!scm.large_grf_mode.is_set());
        assert!(!scm.is_dirty());

        scm.set_properties(&request, &GfxCoreCaps::xe_hp_core().scm_support);
        assert_eq!(scm.large_grf_mode.value(), Some(true));
    }

    #[test]
    fn test_merge_keeps_fields_other_leaves_unset() {
        let mut csr = StreamProperties::default();
        csr.state_base_address.set_properties(&StateBaseAddressValues {
            surface_state_base_address: Some(0x10000),
            dynamic_state_base_address: Some(0x20000),
            ..Default::default()
        });
        csr.clear_dirty();

        let mut required = StreamProperties::default();
        required.state_base_address.set_properties(&StateBaseAddressValues {
            indirect_object_base_address: Some(0x30000),
            ..Default::default()
        });

        csr.set_from(&required);
        assert!(csr.state_base_address.is_dirty());
        assert_eq!(csr.state_base_address.dynamic_state_base_address.value(), Some(0x20000));
        assert!(!csr.state_base_address.dynamic_state_base_address.is_dirty());

        csr.clear_dirty();
        csr.set_from(&required);
        assert!(!csr.is_dirty());
    }

    #[test]
    fn test_new_properties_are_unset() {
        assert!(StreamProperties::default().is_unset());
    }
}
