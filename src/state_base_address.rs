//! State reconciliation
//!
//! Every change to an engine's programmed state goes through [`reconcile`]:
//! the required properties of a command list are merged into the engine's
//! properties, and a command is produced for each group the merge dirtied.
//! A list that changes nothing produces an empty [`StateDelta`].

use tracing::debug;

use crate::error::Result;
use crate::hw_cmds::*;
use crate::hw_info::GfxCoreCaps;
use crate::linear_stream::LinearStream;
use crate::memory::decanonize;
use crate::stream_properties::{
    FrontEndProperties, PipelineSelectProperties, StateBaseAddressProperties, StateComputeModeProperties,
    StreamProperties,
};

/// Engine-side inputs that are not stream properties.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub caps: &'a GfxCoreCaps,
    /// Current front-end scratch field (surface-state offset or address).
    pub scratch_address: u64,
    /// Scratch changed since the front end was last programmed.
    pub scratch_dirty: bool,
    pub max_threads: u32,
}

/// Commands that bring the hardware from one state to another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub pipeline_select: Option<PipelineSelectCmd>,
    pub state_compute_mode: Option<StateComputeModeCmd>,
    pub front_end_state: Option<FrontEndStateCmd>,
    pub state_base_address: Option<StateBaseAddressCmd>,
    pub binding_table_pool_alloc: Option<BindingTablePoolAllocCmd>,
}

/// Merge `required` into the engine state and return what must be emitted.
///
/// State-base-address commands are built from the fields `required` sets,
/// so fields another list left programmed keep their value and their
/// modify bit stays clear.
pub fn reconcile(
    engine_state: &mut StreamProperties,
    required: &StreamProperties,
    ctx: &ReconcileContext<'_>,
) -> StateDelta {
    engine_state.clear_dirty();
    engine_state.set_from(required);
    let delta = StateDelta::from_dirty(engine_state, &required.state_base_address, ctx);
    engine_state.clear_dirty();
    if delta.state_base_address.is_some() {
        debug!(
            "State base address reprogrammed (surface 0x{:X})",
            delta.state_base_address.map(|sba| sba.surface_state_base).unwrap_or_default()
        );
    }
    delta
}

impl StateDelta {
    /// Commands for every dirty group of `state`. SBA fields come from
    /// `sba_source`.
    pub fn from_dirty(
        state: &StreamProperties,
        sba_source: &StateBaseAddressProperties,
        ctx: &ReconcileContext<'_>,
    ) -> Self {
        let mut delta = Self::default();
        if state.pipeline_select.is_dirty() {
            delta.pipeline_select = Some(encode_pipeline_select(&state.pipeline_select));
        }
        if state.state_compute_mode.is_dirty() {
            delta.state_compute_mode = Some(encode_state_compute_mode(&state.state_compute_mode));
        }
        if state.front_end_state.is_dirty() || ctx.scratch_dirty {
            delta.front_end_state = Some(encode_front_end_state(&state.front_end_state, ctx));
        }
        if state.state_base_address.is_dirty() {
            delta.state_base_address =
                Some(encode_state_base_address(sba_source, &state.state_base_address, ctx.caps));
            if ctx.caps.binding_table_pool_supported && state.state_base_address.is_binding_table_pool_dirty() {
                delta.binding_table_pool_alloc = encode_binding_table_pool(&state.state_base_address, ctx.caps);
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_state_base_address(&self) -> bool {
        self.state_base_address.is_some()
    }

    /// Bytes [`StateDelta::encode`] writes.
    pub fn size(&self) -> usize {
        let mut size = 0;
        if self.pipeline_select.is_some() {
            size += std::mem::size_of::<PipelineSelectCmd>();
        }
        if self.state_compute_mode.is_some() {
            size += std::mem::size_of::<StateComputeModeCmd>();
        }
        if self.front_end_state.is_some() {
            size += std::mem::size_of::<FrontEndStateCmd>();
        }
        if self.state_base_address.is_some() {
            size += std::mem::size_of::<StateBaseAddressCmd>() + 2 * std::mem::size_of::<PipeControlCmd>();
        }
        if self.binding_table_pool_alloc.is_some() {
            size += std::mem::size_of::<BindingTablePoolAllocCmd>();
        }
        size
    }

    /// Write the delta: pipeline select, compute mode, front end, then the
    /// heap bases bracketed by a stall and a state-cache invalidation.
    pub fn encode(&self, stream: &mut LinearStream) -> Result<()> {
        if let Some(cmd) = &self.pipeline_select {
            stream.emit(cmd)?;
        }
        if let Some(cmd) = &self.state_compute_mode {
            stream.emit(cmd)?;
        }
        if let Some(cmd) = &self.front_end_state {
            stream.emit(cmd)?;
        }
        if let Some(sba) = &self.state_base_address {
            let mut stall = PipeControlCmd::init();
            stall.flags = PC_CS_STALL | PC_HDC_PIPELINE_FLUSH;
            stream.emit(&stall)?;
            stream.emit(sba)?;
            if let Some(btp) = &self.binding_table_pool_alloc {
                stream.emit(btp)?;
            }
            let mut invalidate = PipeControlCmd::init();
            invalidate.flags = PC_CS_STALL | PC_STATE_CACHE_INVALIDATE | PC_TEXTURE_CACHE_INVALIDATE;
            stream.emit(&invalidate)?;
        }
        Ok(())
    }
}

fn encode_pipeline_select(props: &PipelineSelectProperties) -> PipelineSelectCmd {
    let mut cmd = PipelineSelectCmd::init();
    cmd.pipeline = PIPELINE_GPGPU;
    cmd.systolic_mode = props.systolic_mode.value().unwrap_or(false) as u32;
    cmd
}

fn encode_state_compute_mode(props: &StateComputeModeProperties) -> StateComputeModeCmd {
    let mut cmd = StateComputeModeCmd::init();
    if let Some(coherency) = props.is_coherency_required.value() {
        cmd.modify_mask |= SCM_COHERENCY_REQUIRED;
        if coherency {
            cmd.flags |= SCM_COHERENCY_REQUIRED;
        }
    }
    if let Some(large_grf) = props.large_grf_mode.value() {
        cmd.modify_mask |= SCM_LARGE_GRF_MODE;
        if large_grf {
            cmd.flags |= SCM_LARGE_GRF_MODE;
        }
    }
    if let Some(policy) = props.thread_arbitration_policy.value() {
        cmd.modify_mask |= 1 << 2;
        cmd.thread_arbitration_policy = policy.encode();
    }
    cmd
}

fn encode_front_end_state(props: &FrontEndProperties, ctx: &ReconcileContext<'_>) -> FrontEndStateCmd {
    let mut cmd = FrontEndStateCmd::init();
    cmd.scratch_space_buffer = ctx.scratch_address;
    cmd.maximum_threads = ctx.max_threads;
    let flag = |value: Option<bool>, bit: u32| if value == Some(true) { bit } else { 0 };
    cmd.flags = flag(props.compute_dispatch_all_walker.value(), FE_COMPUTE_DISPATCH_ALL_WALKER)
        | flag(props.disable_eu_fusion.value(), FE_DISABLE_EU_FUSION)
        | flag(props.disable_overdispatch.value(), FE_DISABLE_OVERDISPATCH)
        | flag(props.single_slice_dispatch_ccs_mode.value(), FE_SINGLE_SLICE_DISPATCH_CCS);
    cmd
}

fn encode_state_base_address(
    source: &StateBaseAddressProperties,
    programmed: &StateBaseAddressProperties,
    caps: &GfxCoreCaps,
) -> StateBaseAddressCmd {
    let mut cmd = StateBaseAddressCmd::init();
    let pages = |size: Option<u64>| size.unwrap_or(0) as u32;

    if let Some(base) = source.surface_state_base_address.value() {
        cmd.modify_flags |= SBA_MODIFY_SURFACE_STATE;
        cmd.surface_state_base = base;
        cmd.surface_state_size = pages(source.surface_state_size.value());
    }
    if let Some(base) = source.dynamic_state_base_address.value() {
        cmd.modify_flags |= SBA_MODIFY_DYNAMIC_STATE;
        cmd.dynamic_state_base = base;
        cmd.dynamic_state_size = pages(source.dynamic_state_size.value());
    }
    if let Some(base) = source.indirect_object_base_address.value() {
        let size = pages(source.indirect_object_size.value());
        cmd.modify_flags |= SBA_MODIFY_INDIRECT_OBJECT | SBA_MODIFY_GENERAL_STATE;
        cmd.indirect_object_base = base;
        cmd.indirect_object_size = size;
        cmd.general_state_base = decanonize(base);
        cmd.general_state_size = size;
    }
    if source.global_atomics.value() == Some(true) {
        cmd.modify_flags |= SBA_GLOBAL_ATOMICS_ENABLE;
    }

    let mocs = source
        .stateless_mocs
        .value()
        .or(programmed.stateless_mocs.value())
        .unwrap_or(caps.stateless_mocs_index);
    cmd.stateless_mocs = GfxCoreCaps::encode_mocs(mocs);
    cmd
}

fn encode_binding_table_pool(
    props: &StateBaseAddressProperties,
    caps: &GfxCoreCaps,
) -> Option<BindingTablePoolAllocCmd> {
    let base = props.binding_table_pool_base_address.value()?;
    let mut cmd = BindingTablePoolAllocCmd::init();
    cmd.base = base;
    cmd.size = props.binding_table_pool_size.value().unwrap_or(0) as u32;
    cmd.mocs = GfxCoreCaps::encode_mocs(caps.stateless_mocs_index);
    Some(cmd)
}
