//! Hardware capability table
//!
//! One [`GfxCoreCaps`] is resolved per device from a named preset and passed
//! by reference into every encoder. Nothing downstream branches on the
//! generation name itself.

use crate::error::{DriverError, Result};
use crate::kernel::KernelDescriptor;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_64K: usize = 0x10000;

/// Round `value` up to a power-of-two `alignment`.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a power-of-two `alignment`.
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Hardware generation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GfxCoreFamily {
    Gen9,
    Gen12Lp,
    XeHpCore,
    XeHpgCore,
    XeHpcCore,
}

/// Front-end state fields the hardware exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontEndSupport {
    pub compute_dispatch_all_walker: bool,
    pub disable_eu_fusion: bool,
    pub disable_overdispatch: bool,
    pub single_slice_dispatch_ccs_mode: bool,
}

/// State-compute-mode fields the hardware exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateComputeModeSupport {
    pub coherency_required: bool,
    pub large_grf_mode: bool,
    pub thread_arbitration_policy: bool,
    pub device_preemption_mode: bool,
}

/// Pipeline-select fields the hardware exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSelectSupport {
    pub mode_selected: bool,
    pub systolic_mode: bool,
}

/// Generation-specific limits and encodings.
#[derive(Debug, Clone)]
pub struct GfxCoreCaps {
    pub family: GfxCoreFamily,
    pub name: &'static str,
    pub is_discrete: bool,

    pub dc_flush_supported: bool,
    pub global_stateless_supported: bool,
    /// Samplers (and interface descriptors when `idd_in_dsh`) live in a
    /// dynamic-state heap.
    pub dsh_supported: bool,
    /// Interface descriptors are written to the dynamic-state heap instead of
    /// being inlined in the walker.
    pub idd_in_dsh: bool,
    pub image_supported: bool,
    pub binding_table_pool_supported: bool,
    pub direct_submission_supported: bool,

    pub default_dsh_alignment: usize,
    pub default_ssh_alignment: usize,
    pub ioh_alignment: usize,
    pub sampler_state_alignment: usize,

    pub render_surface_state_size: usize,
    pub interface_descriptor_size: usize,
    pub sampler_state_size: usize,
    pub border_color_size: usize,
    pub binding_table_state_size: usize,

    pub stateless_mocs_index: u32,
    pub uncached_mocs_index: u32,

    pub max_threads_per_tile: u32,
    /// Largest payload a single builtin dispatch may cover.
    pub max_dispatch_bytes: usize,

    pub front_end_support: FrontEndSupport,
    pub scm_support: StateComputeModeSupport,
    pub pipeline_select_support: PipelineSelectSupport,
}

impl GfxCoreCaps {
    /// Resolve a capability preset by name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gen9" => Ok(Self::gen9()),
            "gen12lp" => Ok(Self::gen12lp()),
            "xe_hp_core" => Ok(Self::xe_hp_core()),
            "xe_hpg_core" => Ok(Self::xe_hpg_core()),
            "xe_hpc_core" => Ok(Self::xe_hpc_core()),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown gfx core preset '{other}'"
            ))),
        }
    }

    fn base(family: GfxCoreFamily, name: &'static str) -> Self {
        Self {
            family,
            name,
            is_discrete: false,
            dc_flush_supported: true,
            global_stateless_supported: false,
            dsh_supported: true,
            idd_in_dsh: true,
            image_supported: true,
            binding_table_pool_supported: true,
            direct_submission_supported: false,
            default_dsh_alignment: 64,
            default_ssh_alignment: 64,
            ioh_alignment: 64,
            sampler_state_alignment: 32,
            render_surface_state_size: 64,
            interface_descriptor_size: 32,
            sampler_state_size: 16,
            border_color_size: 64,
            binding_table_state_size: 4,
            stateless_mocs_index: 2,
            uncached_mocs_index: 1,
            max_threads_per_tile: 448,
            max_dispatch_bytes: 4 * 1024 * 1024 * 1024,
            front_end_support: FrontEndSupport::default(),
            scm_support: StateComputeModeSupport {
                coherency_required: true,
                ..Default::default()
            },
            pipeline_select_support: PipelineSelectSupport {
                mode_selected: true,
                systolic_mode: false,
            },
        }
    }

    pub fn gen9() -> Self {
        Self {
            binding_table_pool_supported: false,
            scm_support: StateComputeModeSupport::default(),
            max_threads_per_tile: 336,
            ..Self::base(GfxCoreFamily::Gen9, "gen9")
        }
    }

    pub fn gen12lp() -> Self {
        Self {
            scm_support: StateComputeModeSupport {
                coherency_required: true,
                thread_arbitration_policy: true,
                ..Default::default()
            },
            ..Self::base(GfxCoreFamily::Gen12Lp, "gen12lp")
        }
    }

    pub fn xe_hp_core() -> Self {
        Self {
            is_discrete: true,
            dc_flush_supported: true,
            global_stateless_supported: true,
            idd_in_dsh: false,
            direct_submission_supported: true,
            stateless_mocs_index: 3,
            max_threads_per_tile: 1024,
            front_end_support: FrontEndSupport {
                compute_dispatch_all_walker: true,
                disable_eu_fusion: false,
                disable_overdispatch: true,
                single_slice_dispatch_ccs_mode: true,
            },
            scm_support: StateComputeModeSupport {
                coherency_required: true,
                large_grf_mode: true,
                thread_arbitration_policy: true,
                device_preemption_mode: false,
            },
            ..Self::base(GfxCoreFamily::XeHpCore, "xe_hp_core")
        }
    }

    pub fn xe_hpg_core() -> Self {
        Self {
            family: GfxCoreFamily::XeHpgCore,
            name: "xe_hpg_core",
            max_threads_per_tile: 2048,
            front_end_support: FrontEndSupport {
                compute_dispatch_all_walker: false,
                disable_eu_fusion: true,
                disable_overdispatch: true,
                single_slice_dispatch_ccs_mode: false,
            },
            pipeline_select_support: PipelineSelectSupport {
                mode_selected: true,
                systolic_mode: false,
            },
            ..Self::xe_hp_core()
        }
    }

    pub fn xe_hpc_core() -> Self {
        Self {
            family: GfxCoreFamily::XeHpcCore,
            name: "xe_hpc_core",
            dc_flush_supported: false,
            dsh_supported: false,
            image_supported: false,
            max_threads_per_tile: 4096,
            front_end_support: FrontEndSupport {
                compute_dispatch_all_walker: false,
                disable_eu_fusion: false,
                disable_overdispatch: true,
                single_slice_dispatch_ccs_mode: true,
            },
            pipeline_select_support: PipelineSelectSupport {
                mode_selected: true,
                systolic_mode: true,
            },
            ..Self::xe_hp_core()
        }
    }

    /// Bytes of dynamic state one dispatch of `desc` consumes when
    /// `idd_count` interface descriptors are reserved along with it.
    pub fn size_required_dsh(&self, desc: &KernelDescriptor, idd_count: u32) -> usize {
        if !self.dsh_supported {
            return 0;
        }
        let mut size = 0;
        if desc.num_samplers > 0 {
            size = align_up(
                self.border_color_size + desc.num_samplers as usize * self.sampler_state_size,
                self.sampler_state_alignment,
            );
        }
        if self.idd_in_dsh {
            size += self.interface_descriptor_size * idd_count as usize;
        }
        align_up(size, self.default_dsh_alignment)
    }

    /// Bytes of surface state (binding table plus surface states) one
    /// dispatch of `desc` consumes.
    pub fn size_required_ssh(&self, desc: &KernelDescriptor) -> usize {
        let entries = desc.num_binding_table_entries as usize;
        if entries == 0 {
            return 0;
        }
        let binding_table = align_up(
            entries * self.binding_table_state_size,
            self.render_surface_state_size,
        );
        align_up(
            entries * self.render_surface_state_size + binding_table,
            self.default_ssh_alignment,
        )
    }

    /// Bytes of indirect data (cross-thread plus per-thread) one dispatch
    /// of `desc` consumes.
    pub fn size_required_ioh(&self, desc: &KernelDescriptor) -> usize {
        let threads = desc.threads_per_group() as usize;
        align_up(
            desc.cross_thread_data_size as usize + desc.per_thread_data_size as usize * threads,
            self.ioh_alignment,
        )
    }

    /// Encoded stateless MOCS field (index in bits 1..7).
    pub fn encode_mocs(mocs_index: u32) -> u32 {
        mocs_index << 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ArgDescriptor, KernelDescriptor};

    fn kernel_with(bte: u32, samplers: u32) -> KernelDescriptor {
        let mut desc = KernelDescriptor::new("k");
        desc.num_binding_table_entries = bte;
        desc.num_samplers = samplers;
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        desc
    }

    #[test]
    fn test_presets_resolve() {
        for name in ["gen9", "gen12lp", "xe_hp_core", "xe_hpg_core", "xe_hpc_core"] {
            let caps = GfxCoreCaps::from_name(name).unwrap();
            assert_eq!(caps.name, name);
        }
        assert!(GfxCoreCaps::from_name("gen7").is_err());
    }

    #[test]
    fn test_capability_flags() {
        assert!(!GfxCoreCaps::gen12lp().global_stateless_supported);
        assert!(GfxCoreCaps::xe_hpg_core().global_stateless_supported);
        assert!(!GfxCoreCaps::xe_hpc_core().dc_flush_supported);
        assert!(!GfxCoreCaps::xe_hpc_core().image_supported);
        assert!(!GfxCoreCaps::gen9().binding_table_pool_supported);
    }

    #[test]
    fn test_size_required_ssh_is_aligned() {
        let caps = GfxCoreCaps::xe_hpg_core();
        assert_eq!(caps.size_required_ssh(&kernel_with(0, 0)), 0);
        // 2 surface states + 8 bytes of binding table padded to one state
        assert_eq!(caps.size_required_ssh(&kernel_with(2, 0)), 3 * 64);
        assert_eq!(caps.size_required_ssh(&kernel_with(1, 0)) % caps.default_ssh_alignment, 0);
    }

    #[test]
    fn test_size_required_dsh() {
        let gen12 = GfxCoreCaps::gen12lp();
        assert_eq!(gen12.size_required_dsh(&kernel_with(1, 0), 1), 64);
        assert_eq!(gen12.size_required_dsh(&kernel_with(1, 0), 64), 64 * 32);
        // border color + 2 samplers = 96, plus one descriptor = 128
        assert_eq!(gen12.size_required_dsh(&kernel_with(1, 2), 1), 128);

        let hpg = GfxCoreCaps::xe_hpg_core();
        assert_eq!(hpg.size_required_dsh(&kernel_with(1, 0), 1), 0);
        assert_eq!(hpg.size_required_dsh(&kernel_with(1, 1), 1), 128);

        let hpc = GfxCoreCaps::xe_hpc_core();
        assert_eq!(hpc.size_required_dsh(&kernel_with(1, 4), 1), 0);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0x101, 16), 0x110);
        assert_eq!(align_down(0x101, 16), 0x100);
        assert_eq!(GfxCoreCaps::encode_mocs(3), 6);
    }
}
