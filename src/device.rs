//! Device
//!
//! A simulated compute device: capability table, memory manager, builtin
//! library and one command stream receiver per engine.

use std::sync::Arc;

use tracing::{info, warn};

use crate::builtins::BuiltinFunctionsLib;
use crate::config::{Config, HeapAddressModel};
use crate::csr::{ChannelFactory, CommandStreamReceiver, CsrHandle, EngineGroupType, EngineId};
use crate::error::{DriverError, Result};
use crate::hw_info::GfxCoreCaps;
use crate::memory::MemoryManager;

/// Local memory exposed by discrete presets.
pub const LOCAL_MEMORY_SIZE: usize = 16 * 1024 * 1024 * 1024;

/// Engine used by internal immediate lists.
pub const INTERNAL_ENGINE_ID: EngineId = 0xFF;

pub struct Device {
    config: Config,
    caps: Arc<GfxCoreCaps>,
    memory: Arc<MemoryManager>,
    builtins: Arc<BuiltinFunctionsLib>,
    engines: Vec<(EngineGroupType, CsrHandle)>,
    internal_engine: CsrHandle,
    heap_address_model: HeapAddressModel,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("gfx_core", &self.caps.name)
            .field("tile_count", &self.config.tile_count)
            .field("heap_address_model", &self.heap_address_model)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Build a device from the configured capability preset.
    pub fn new(config: Config, channel_factory: ChannelFactory) -> Result<Arc<Self>> {
        let caps = GfxCoreCaps::from_name(&config.gfx_core)?;
        Self::with_caps(config, caps, channel_factory)
    }

    pub fn with_caps(config: Config, caps: GfxCoreCaps, channel_factory: ChannelFactory) -> Result<Arc<Self>> {
        let caps = Arc::new(caps);
        let local_memory = if caps.is_discrete { LOCAL_MEMORY_SIZE } else { 0 };
        let memory = Arc::new(MemoryManager::new(caps.is_discrete, local_memory));
        let builtins = Arc::new(BuiltinFunctionsLib::new(caps.image_supported));

        let mut heap_address_model = config.heap_address_model;
        if heap_address_model == HeapAddressModel::GlobalStateless && !caps.global_stateless_supported {
            warn!(
                "{} does not support global stateless addressing, using private heaps",
                caps.name
            );
            heap_address_model = HeapAddressModel::PrivateHeaps;
        }

        let csr = |id: EngineId, group: EngineGroupType| -> Result<CsrHandle> {
            let csr = CommandStreamReceiver::new(id, group, caps.clone(), memory.clone(), &config, &channel_factory)?;
            Ok(Arc::new(std::sync::Mutex::new(csr)))
        };
        let engines = vec![
            (EngineGroupType::Compute, csr(0, EngineGroupType::Compute)?),
            (EngineGroupType::RenderCompute, csr(1, EngineGroupType::RenderCompute)?),
            (EngineGroupType::Copy, csr(2, EngineGroupType::Copy)?),
        ];
        let internal_engine = csr(INTERNAL_ENGINE_ID, EngineGroupType::Compute)?;

        info!(
            "Device {} ready: {} tile(s), {:?}, {} engines",
            caps.name,
            config.tile_count,
            heap_address_model,
            engines.len() + 1
        );
        Ok(Arc::new(Self {
            config,
            caps,
            memory,
            builtins,
            engines,
            internal_engine,
            heap_address_model,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn caps(&self) -> &Arc<GfxCoreCaps> {
        &self.caps
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn builtins(&self) -> &Arc<BuiltinFunctionsLib> {
        &self.builtins
    }

    pub fn tile_count(&self) -> u32 {
        self.config.tile_count.max(1)
    }

    pub fn heap_address_model(&self) -> HeapAddressModel {
        self.heap_address_model
    }

    pub fn engine(&self, group: EngineGroupType) -> Result<CsrHandle> {
        self.engines
            .iter()
            .find(|(engine_group, _)| *engine_group == group)
            .map(|(_, csr)| csr.clone())
            .ok_or_else(|| DriverError::InvalidArgument(format!("no {group:?} engine")))
    }

    pub fn internal_engine(&self) -> &CsrHandle {
        &self.internal_engine
    }

    /// Every engine, internal one last.
    pub fn all_engines(&self) -> Vec<CsrHandle> {
        self.engines
            .iter()
            .map(|(_, csr)| csr.clone())
            .chain(std::iter::once(self.internal_engine.clone()))
            .collect()
    }
}
