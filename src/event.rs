//! Events
//!
//! Events are signaled by the GPU through a post-sync write at their GPU
//! address. The host sees them complete once the engine that signaled them
//! reports the task count the signal was part of.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::csr::{EngineId, TagAddress};
use crate::error::{lock_poisoned, DriverError, Result, ZeResult};
use crate::memory::{AllocationType, GraphicsAllocation, MemoryManager};

pub const EVENT_SCOPE_FLAG_SUBDEVICE: u32 = 1 << 0;
pub const EVENT_SCOPE_FLAG_DEVICE: u32 = 1 << 1;
pub const EVENT_SCOPE_FLAG_HOST: u32 = 1 << 2;

/// Bytes reserved per event in the pool allocation.
pub const EVENT_PACKET_SIZE: usize = 64;

/// Value the post-sync write stores when an event completes.
pub const EVENT_STATE_SIGNALED: u64 = 0;

/// Value an event slot holds until it is signaled.
pub const EVENT_STATE_CLEARED: u64 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct EventDesc {
    pub index: u32,
    pub signal_scope: u32,
    pub wait_scope: u32,
}

#[derive(Debug)]
pub struct EventPool {
    allocation: Arc<GraphicsAllocation>,
    count: u32,
    in_use: Mutex<Vec<bool>>,
}

impl EventPool {
    pub fn create(memory: &MemoryManager, count: u32) -> Result<Arc<Self>> {
        if count == 0 {
            return Err(DriverError::InvalidSize("event pool needs at least one event".to_string()));
        }
        let allocation = memory.allocate(count as usize * EVENT_PACKET_SIZE, AllocationType::EventPool)?;
        Ok(Arc::new(Self {
            allocation,
            count,
            in_use: Mutex::new(vec![false; count as usize]),
        }))
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn create_event(self: &Arc<Self>, desc: EventDesc) -> Result<Arc<Event>> {
        if desc.index >= self.count {
            return Err(DriverError::InvalidArgument(format!(
                "event index {} out of range for pool of {}",
                desc.index, self.count
            )));
        }
        let mut in_use = self.in_use.lock().map_err(|_| lock_poisoned("event pool"))?;
        let slot = &mut in_use[desc.index as usize];
        if *slot {
            return Err(DriverError::InvalidArgument(format!("event index {} already in use", desc.index)));
        }
        *slot = true;

        let gpu_address = self.allocation.gpu_address() + desc.index as u64 * EVENT_PACKET_SIZE as u64;
        Ok(Arc::new(Event {
            pool: self.clone(),
            index: desc.index,
            gpu_address,
            signal_scope: desc.signal_scope,
            wait_scope: desc.wait_scope,
            state: Mutex::new(EventState::default()),
        }))
    }

    fn release(&self, index: u32) {
        if let Ok(mut in_use) = self.in_use.lock() {
            if let Some(slot) = in_use.get_mut(index as usize) {
                *slot = false;
            }
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    /// Engine whose stream last carried this event's signal.
    signaling_engine: Option<EngineId>,
    pending: Option<(TagAddress, u64)>,
    host_signaled: bool,
}

#[derive(Debug)]
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    gpu_address: u64,
    signal_scope: u32,
    wait_scope: u32,
    state: Mutex<EventState>,
}

impl Drop for Event {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl Event {
    fn lock(&self) -> Result<MutexGuard<'_, EventState>> {
        self.state.lock().map_err(|_| lock_poisoned("event"))
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        self.pool.allocation()
    }

    pub fn is_signal_scope(&self, flag: u32) -> bool {
        self.signal_scope & flag != 0
    }

    pub fn is_wait_scope(&self, flag: u32) -> bool {
        self.wait_scope & flag != 0
    }

    /// Record the engine that will signal this event.
    pub fn set_csr(&self, engine: EngineId) -> Result<()> {
        self.lock()?.signaling_engine = Some(engine);
        Ok(())
    }

    pub fn csr(&self) -> Result<Option<EngineId>> {
        Ok(self.lock()?.signaling_engine)
    }

    /// The signal completes once `tag` reaches `task_count`.
    pub fn assign_completion(&self, engine: EngineId, tag: TagAddress, task_count: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.signaling_engine = Some(engine);
        state.pending = Some((tag, task_count));
        state.host_signaled = false;
        Ok(())
    }

    pub fn host_signal(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.host_signaled = true;
        state.pending = None;
        Ok(())
    }

    pub fn query_status(&self) -> ZeResult {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return ZeResult::ErrorDeviceLost,
        };
        let signaled = state.host_signaled
            || matches!(&state.pending, Some((tag, task_count)) if tag.completed() >= *task_count);
        if signaled {
            ZeResult::Success
        } else {
            ZeResult::NotReady
        }
    }

    /// Poll until signaled or `timeout` elapses.
    pub fn host_synchronize(&self, timeout: Duration) -> ZeResult {
        let start = Instant::now();
        loop {
            let status = self.query_status();
            if status != ZeResult::NotReady || start.elapsed() >= timeout {
                return status;
            }
            std::thread::yield_now();
        }
    }

    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        debug!("Reset event {}", self.index);
        *state = EventState::default();
        Ok(())
    }
}
