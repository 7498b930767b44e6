//! Configuration Module
//!
//! Driver and replay-service settings loaded from TOML. Debug toggles that
//! change submission behavior are ordinary fields here.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hw_info::GfxCoreCaps;
use crate::stream_properties::ThreadArbitrationPolicy;

/// How stateful accesses are addressed by command lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapAddressModel {
    /// Every command list owns (or shares) its own surface/dynamic heaps.
    PrivateHeaps,
    /// All stateful access goes through one heap owned by the engine.
    GlobalStateless,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capability preset: "gen9", "gen12lp", "xe_hp_core", "xe_hpg_core", "xe_hpc_core"
    #[serde(default = "default_gfx_core")]
    pub gfx_core: String,

    /// Number of tiles (sub-devices) exposed by the device
    #[serde(default = "default_tile_count")]
    pub tile_count: u32,

    /// Addressing model used by newly created command lists and queues
    #[serde(default = "default_heap_address_model")]
    pub heap_address_model: HeapAddressModel,

    /// Immediate lists reconcile state straight into the engine stream
    #[serde(default = "default_true")]
    pub use_immediate_flush_task: bool,

    /// Immediate lists on the same engine share the engine's state heaps
    #[serde(default = "default_true")]
    pub immediate_cmd_list_heap_sharing: bool,

    /// Size of each indirect heap allocation in bytes
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Initial command buffer capacity in bytes
    #[serde(default = "default_command_buffer_size")]
    pub command_buffer_size: usize,

    /// Interface descriptors reserved per block in private dynamic heaps
    #[serde(default = "default_num_idd_per_block")]
    pub num_idd_per_block: u32,

    #[serde(default)]
    pub enable_relaxed_ordering: bool,

    #[serde(default)]
    pub force_memory_prefetch_for_kmd_migrated_shared_allocations: bool,

    #[serde(default)]
    pub enable_bo_chunking_prefetch: bool,

    #[serde(default = "default_true")]
    pub compute_dispatch_all_walker: bool,

    #[serde(default = "default_thread_arbitration_policy")]
    pub thread_arbitration_policy: ThreadArbitrationPolicy,

    /// Replay iterations for the smoke workload (0 = until Ctrl+C)
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Bytes copied per copy operation in the smoke workload
    #[serde(default = "default_copy_size")]
    pub copy_size: usize,

    /// Bytes filled per fill operation in the smoke workload
    #[serde(default = "default_fill_size")]
    pub fill_size: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_gfx_core() -> String {
    "xe_hpg_core".to_string()
}

fn default_tile_count() -> u32 {
    1
}

fn default_heap_address_model() -> HeapAddressModel {
    HeapAddressModel::PrivateHeaps
}

fn default_true() -> bool {
    true
}

fn default_heap_size() -> usize {
    64 * 1024
}

fn default_command_buffer_size() -> usize {
    64 * 1024
}

fn default_num_idd_per_block() -> u32 {
    64
}

fn default_thread_arbitration_policy() -> ThreadArbitrationPolicy {
    ThreadArbitrationPolicy::AgeBased
}

fn default_iterations() -> u32 {
    16
}

fn default_copy_size() -> usize {
    0x101
}

fn default_fill_size() -> usize {
    4095
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            gfx_core: default_gfx_core(),
            tile_count: default_tile_count(),
            heap_address_model: default_heap_address_model(),
            use_immediate_flush_task: true,
            immediate_cmd_list_heap_sharing: true,
            heap_size: default_heap_size(),
            command_buffer_size: default_command_buffer_size(),
            num_idd_per_block: default_num_idd_per_block(),
            enable_relaxed_ordering: false,
            force_memory_prefetch_for_kmd_migrated_shared_allocations: false,
            enable_bo_chunking_prefetch: false,
            compute_dispatch_all_walker: true,
            thread_arbitration_policy: default_thread_arbitration_policy(),
            iterations: default_iterations(),
            copy_size: default_copy_size(),
            fill_size: default_fill_size(),
        }
    }
}

impl Config {
    /// Load engine settings from a TOML file. Fields the file leaves out
    /// take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write engine settings as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("serializing engine config")?;
        std::fs::write(path, content).with_context(|| format!("writing engine config {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        GfxCoreCaps::from_name(&self.gfx_core)?;
        if self.tile_count == 0 {
            bail!("tile_count must be at least 1");
        }
        if self.num_idd_per_block == 0 {
            bail!("num_idd_per_block must be at least 1");
        }
        Ok(())
    }
}
