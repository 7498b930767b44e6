//! Memory Manager Module
//!
//! Hands out graphics allocations for heaps, command buffers and unified
//! shared memory, resolves user pointers back to allocations, and tracks
//! virtual-memory reservations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::error::{lock_poisoned, DriverError, Result};
use crate::hw_info::{align_up, PAGE_SIZE, PAGE_SIZE_64K};

/// Allocation ID type
pub type AllocationId = u64;

const GPU_VA_BITS: u32 = 48;
const GPU_VA_MASK: u64 = (1u64 << GPU_VA_BITS) - 1;

const INTERNAL_VA_BASE: u64 = 0x0000_8000_0000_0000;
const USER_VA_BASE: u64 = 0x0000_0001_0000_0000;
const RESERVED_VA_BASE: u64 = 0x0000_4000_0000_0000;

/// Largest single host allocation the simulated host can back.
const MAX_HOST_ALLOCATION_SIZE: usize = 1 << 40;

/// Sign-extend bit 47 into the upper 16 bits.
pub fn canonize(address: u64) -> u64 {
    (((address << (64 - GPU_VA_BITS)) as i64) >> (64 - GPU_VA_BITS)) as u64
}

/// Strip the sign-extended upper bits of a canonical address.
pub fn decanonize(address: u64) -> u64 {
    address & GPU_VA_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    System,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    CommandBuffer,
    LinearStream,
    InternalHeap,
    IndirectObjectHeap,
    GlobalStatelessHeap,
    ScratchSurface,
    TagBuffer,
    EventPool,
    FillPattern,
    Image,
    UsmHost,
    UsmDevice,
    UsmShared,
    ExternalHostPtr,
    PhysicalMemory,
}

/// Kind of unified shared memory behind a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsmMemoryType {
    Host,
    Device,
    Shared,
}

/// A GPU-visible memory allocation.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: AllocationId,
    gpu_address: u64,
    size: usize,
    pool: MemoryPool,
    allocation_type: AllocationType,
}

impl GraphicsAllocation {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Canonical GPU virtual address.
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    pub fn is_in_system_memory(&self) -> bool {
        self.pool == MemoryPool::System
    }

    pub fn contains(&self, address: u64) -> bool {
        let base = decanonize(self.gpu_address);
        let address = decanonize(address);
        address >= base && address < base + self.size as u64
    }
}

/// Result of resolving a user pointer.
#[derive(Debug, Clone)]
pub enum ResolvedPointer {
    /// Unified shared memory allocated through this manager.
    Usm {
        allocation: Arc<GraphicsAllocation>,
        memory_type: UsmMemoryType,
        offset: u64,
    },
    /// Address inside a virtual reservation; `mapped` holds every physical
    /// allocation currently mapped in that reservation.
    Reserved {
        allocation: Arc<GraphicsAllocation>,
        offset: u64,
        mapped: Vec<Arc<GraphicsAllocation>>,
    },
    /// Not known to the driver: an external host pointer.
    External { address: u64 },
}

/// Handle to physical memory created for virtual mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalMemHandle(AllocationId);

#[derive(Debug)]
struct VirtualReservation {
    size: usize,
    /// Mapped physical allocations keyed by their start address.
    mappings: BTreeMap<u64, Arc<GraphicsAllocation>>,
}

#[derive(Debug)]
struct MemoryState {
    allocations: HashMap<AllocationId, Arc<GraphicsAllocation>>,
    usm: BTreeMap<u64, (Arc<GraphicsAllocation>, UsmMemoryType)>,
    reservations: BTreeMap<u64, VirtualReservation>,
    physical: HashMap<AllocationId, Arc<GraphicsAllocation>>,
    next_allocation_id: AllocationId,
    next_internal_va: u64,
    next_user_va: u64,
    next_reserved_va: u64,
    local_memory_used: usize,
}

/// Owns every allocation made for a device.
#[derive(Debug)]
pub struct MemoryManager {
    is_discrete: bool,
    local_memory_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    pub fn new(is_discrete: bool, local_memory_size: usize) -> Self {
        Self {
            is_discrete,
            local_memory_size,
            state: Mutex::new(MemoryState {
                allocations: HashMap::new(),
                usm: BTreeMap::new(),
                reservations: BTreeMap::new(),
                physical: HashMap::new(),
                next_allocation_id: 1,
                next_internal_va: INTERNAL_VA_BASE,
                next_user_va: USER_VA_BASE,
                next_reserved_va: RESERVED_VA_BASE,
                local_memory_used: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| lock_poisoned("memory manager"))
    }

    pub fn is_discrete(&self) -> bool {
        self.is_discrete
    }

    /// Pool used for driver-internal allocations.
    fn internal_pool(&self) -> MemoryPool {
        if self.is_discrete {
            MemoryPool::Local
        } else {
            MemoryPool::System
        }
    }

    fn create(
        &self,
        state: &mut MemoryState,
        gpu_address: u64,
        size: usize,
        pool: MemoryPool,
        allocation_type: AllocationType,
    ) -> Result<Arc<GraphicsAllocation>> {
        if pool == MemoryPool::Local {
            if state.local_memory_used + size > self.local_memory_size {
                warn!(
                    "Local memory exhausted: requested {} bytes, {} of {} in use",
                    size, state.local_memory_used, self.local_memory_size
                );
                return Err(DriverError::OutOfDeviceMemory { requested: size });
            }
            state.local_memory_used += size;
        }

        let id = state.next_allocation_id;
        state.next_allocation_id += 1;
        let allocation = Arc::new(GraphicsAllocation {
            id,
            gpu_address: canonize(gpu_address),
            size,
            pool,
            allocation_type,
        });
        state.allocations.insert(id, allocation.clone());
        trace!(
            "Created allocation {} ({:?}) at 0x{:X}, {} bytes",
            id,
            allocation_type,
            allocation.gpu_address,
            size
        );
        Ok(allocation)
    }

    /// Allocate driver-internal memory (heaps, command buffers, scratch).
    pub fn allocate(&self, size: usize, allocation_type: AllocationType) -> Result<Arc<GraphicsAllocation>> {
        if size == 0 {
            return Err(DriverError::InvalidSize("zero-sized allocation".to_string()));
        }
        let size = align_up(size, PAGE_SIZE);
        let mut state = self.lock()?;
        let gpu_address = state.next_internal_va;
        let allocation = self.create(&mut state, gpu_address, size, self.internal_pool(), allocation_type)?;
        state.next_internal_va += align_up(size, PAGE_SIZE_64K) as u64;
        Ok(allocation)
    }

    /// Release an allocation made through [`MemoryManager::allocate`].
    pub fn free(&self, allocation: &GraphicsAllocation) -> Result<()> {
        let mut state = self.lock()?;
        Self::release(&mut state, allocation.id());
        Ok(())
    }

    fn release(state: &mut MemoryState, id: AllocationId) {
        if let Some(allocation) = state.allocations.remove(&id) {
            if allocation.pool == MemoryPool::Local {
                state.local_memory_used = state.local_memory_used.saturating_sub(allocation.size);
            }
            debug!("Released allocation {}", id);
        }
    }

    fn alloc_usm(&self, size: usize, alignment: usize, memory_type: UsmMemoryType) -> Result<u64> {
        if size == 0 {
            return Err(DriverError::UnsupportedSize("zero-sized allocation".to_string()));
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(DriverError::UnsupportedSize(format!("alignment {alignment} is not a power of two")));
        }
        if memory_type == UsmMemoryType::Host && size > MAX_HOST_ALLOCATION_SIZE {
            return Err(DriverError::OutOfHostMemory);
        }

        let (pool, allocation_type) = match memory_type {
            UsmMemoryType::Host => (MemoryPool::System, AllocationType::UsmHost),
            UsmMemoryType::Device => (MemoryPool::Local, AllocationType::UsmDevice),
            UsmMemoryType::Shared if self.is_discrete => (MemoryPool::Local, AllocationType::UsmShared),
            UsmMemoryType::Shared => (MemoryPool::System, AllocationType::UsmShared),
        };
        // Integrated parts have no local memory; device allocations land in system memory.
        let pool = if self.is_discrete { pool } else { MemoryPool::System };

        let mut state = self.lock()?;
        let address = align_up(state.next_user_va as usize, alignment.max(PAGE_SIZE_64K)) as u64;
        let allocation = self.create(&mut state, address, size, pool, allocation_type)?;
        state.next_user_va = address + align_up(size, PAGE_SIZE_64K) as u64;
        state.usm.insert(address, (allocation, memory_type));
        debug!("USM {:?} allocation of {} bytes at 0x{:X}", memory_type, size, address);
        Ok(address)
    }

    pub fn alloc_host_mem(&self, size: usize, alignment: usize) -> Result<u64> {
        self.alloc_usm(size, alignment, UsmMemoryType::Host)
    }

    pub fn alloc_device_mem(&self, size: usize, alignment: usize) -> Result<u64> {
        self.alloc_usm(size, alignment, UsmMemoryType::Device)
    }

    pub fn alloc_shared_mem(&self, size: usize, alignment: usize) -> Result<u64> {
        self.alloc_usm(size, alignment, UsmMemoryType::Shared)
    }

    /// Free a USM allocation by its base pointer.
    pub fn free_mem(&self, ptr: u64) -> Result<()> {
        let mut state = self.lock()?;
        match state.usm.remove(&ptr) {
            Some((allocation, _)) => {
                Self::release(&mut state, allocation.id());
                Ok(())
            }
            None => Err(DriverError::InvalidArgument(format!(
                "0x{ptr:X} is not the base of a USM allocation"
            ))),
        }
    }

    /// Look up the USM allocation containing `ptr`.
    pub fn find_allocation(&self, ptr: u64) -> Result<Option<(Arc<GraphicsAllocation>, UsmMemoryType)>> {
        let state = self.lock()?;
        Ok(state
            .usm
            .range(..=ptr)
            .next_back()
            .filter(|(_, (allocation, _))| allocation.contains(ptr))
            .map(|(_, (allocation, memory_type))| (allocation.clone(), *memory_type)))
    }

    /// Classify `ptr` as USM, reserved virtual memory or an external pointer.
    pub fn resolve(&self, ptr: u64) -> Result<ResolvedPointer> {
        if let Some((allocation, memory_type)) = self.find_allocation(ptr)? {
            let offset = ptr - decanonize(allocation.gpu_address());
            return Ok(ResolvedPointer::Usm {
                allocation,
                memory_type,
                offset,
            });
        }

        let state = self.lock()?;
        if let Some((base, reservation)) = state.reservations.range(..=ptr).next_back() {
            if ptr < base + reservation.size as u64 {
                let mapping = reservation
                    .mappings
                    .range(..=ptr)
                    .next_back()
                    .filter(|(start, allocation)| ptr < **start + allocation.size() as u64);
                if let Some((start, allocation)) = mapping {
                    return Ok(ResolvedPointer::Reserved {
                        allocation: allocation.clone(),
                        offset: ptr - start,
                        mapped: reservation.mappings.values().cloned().collect(),
                    });
                }
                return Err(DriverError::InvalidArgument(format!(
                    "0x{ptr:X} is reserved but not mapped"
                )));
            }
        }

        Ok(ResolvedPointer::External { address: ptr })
    }

    /// Wrap an external host pointer in a temporary system-memory allocation.
    pub fn create_host_ptr_allocation(&self, ptr: u64, size: usize) -> Result<Arc<GraphicsAllocation>> {
        if size == 0 {
            return Err(DriverError::InvalidSize("zero-sized host pointer".to_string()));
        }
        let mut state = self.lock()?;
        self.create(&mut state, ptr, size, MemoryPool::System, AllocationType::ExternalHostPtr)
    }

    /// Reserve a range of GPU virtual address space.
    pub fn reserve_virtual_mem(&self, size: usize) -> Result<u64> {
        if size == 0 || size % PAGE_SIZE_64K != 0 {
            return Err(DriverError::UnsupportedSize(format!(
                "reservation size {size} is not a multiple of 64KB"
            )));
        }
        let mut state = self.lock()?;
        let base = state.next_reserved_va;
        state.next_reserved_va += size as u64;
        state.reservations.insert(
            base,
            VirtualReservation {
                size,
                mappings: BTreeMap::new(),
            },
        );
        debug!("Reserved {} bytes of virtual memory at 0x{:X}", size, base);
        Ok(base)
    }

    pub fn free_virtual_mem(&self, ptr: u64) -> Result<()> {
        let mut state = self.lock()?;
        match state.reservations.remove(&ptr) {
            Some(reservation) if reservation.mappings.is_empty() => Ok(()),
            Some(reservation) => {
                // Still mapped: put it back and refuse.
                state.reservations.insert(ptr, reservation);
                Err(DriverError::InvalidArgument(format!("reservation 0x{ptr:X} is still mapped")))
            }
            None => Err(DriverError::InvalidArgument(format!("0x{ptr:X} is not a reservation"))),
        }
    }

    /// Create physical memory that can later be mapped into a reservation.
    pub fn create_physical_mem(&self, size: usize) -> Result<PhysicalMemHandle> {
        if size == 0 || size % PAGE_SIZE_64K != 0 {
            return Err(DriverError::UnsupportedSize(format!(
                "physical size {size} is not a multiple of 64KB"
            )));
        }
        let mut state = self.lock()?;
        // Physical backing has no address until mapped.
        let allocation = self.create(&mut state, 0, size, self.internal_pool(), AllocationType::PhysicalMemory)?;
        let handle = PhysicalMemHandle(allocation.id());
        state.physical.insert(allocation.id(), allocation);
        Ok(handle)
    }

    pub fn destroy_physical_mem(&self, handle: PhysicalMemHandle) -> Result<()> {
        let mut state = self.lock()?;
        if state.physical.remove(&handle.0).is_none() {
            return Err(DriverError::InvalidHandle("physical memory".to_string()));
        }
        Self::release(&mut state, handle.0);
        Ok(())
    }

    /// Map physical memory at `ptr` inside an existing reservation.
    pub fn map_virtual_mem(&self, ptr: u64, handle: PhysicalMemHandle) -> Result<()> {
        let mut state = self.lock()?;
        let physical = state
            .physical
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| DriverError::InvalidHandle("physical memory".to_string()))?;

        let (base, reservation) = state
            .reservations
            .range_mut(..=ptr)
            .next_back()
            .ok_or_else(|| DriverError::InvalidArgument(format!("0x{ptr:X} is not reserved")))?;
        let end = ptr + physical.size() as u64;
        if end > *base + reservation.size as u64 {
            return Err(DriverError::InvalidSize(format!(
                "mapping at 0x{ptr:X} overruns its reservation"
            )));
        }
        let overlaps = reservation
            .mappings
            .iter()
            .any(|(start, mapped)| ptr < start + mapped.size() as u64 && *start < end);
        if overlaps {
            return Err(DriverError::InvalidArgument(format!("0x{ptr:X} is already mapped")));
        }

        // The mapped view carries the virtual address; the physical record keeps its id.
        let mapped = Arc::new(GraphicsAllocation {
            id: physical.id(),
            gpu_address: canonize(ptr),
            size: physical.size(),
            pool: physical.pool(),
            allocation_type: AllocationType::PhysicalMemory,
        });
        reservation.mappings.insert(ptr, mapped);
        debug!("Mapped physical {} at 0x{:X}", handle.0, ptr);
        Ok(())
    }

    pub fn unmap_virtual_mem(&self, ptr: u64) -> Result<()> {
        let mut state = self.lock()?;
        let (_, reservation) = state
            .reservations
            .range_mut(..=ptr)
            .next_back()
            .ok_or_else(|| DriverError::InvalidArgument(format!("0x{ptr:X} is not reserved")))?;
        reservation
            .mappings
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| DriverError::InvalidArgument(format!("nothing mapped at 0x{ptr:X}")))
    }

    /// Bytes of local memory currently allocated.
    pub fn local_memory_used(&self) -> Result<usize> {
        Ok(self.lock()?.local_memory_used)
    }

    /// Every live USM allocation (used for indirect-access residency).
    pub fn usm_allocations(&self) -> Result<Vec<(Arc<GraphicsAllocation>, UsmMemoryType)>> {
        Ok(self.lock()?.usm.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: usize = 1024 * 1024 * 1024;

    #[test]
    fn test_canonize_round_trip() {
        let address = 0x0000_8000_0010_0000;
        let canonical = canonize(address);
        assert_eq!(canonical, 0xFFFF_8000_0010_0000);
        assert_eq!(decanonize(canonical), address);
        assert_eq!(canonize(0x1000), 0x1000);
    }

    #[test]
    fn test_internal_allocations_are_canonical() {
        let mm = MemoryManager::new(true, GB);
        let heap = mm.allocate(PAGE_SIZE_64K, AllocationType::InternalHeap).unwrap();
        assert_eq!(heap.gpu_address() >> 48, 0xFFFF);
        assert_eq!(heap.pool(), MemoryPool::Local);
        let second = mm.allocate(PAGE_SIZE, AllocationType::CommandBuffer).unwrap();
        assert_ne!(heap.gpu_address(), second.gpu_address());
    }

    #[test]
    fn test_usm_pools_discrete_and_integrated() {
        let discrete = MemoryManager::new(true, GB);
        let host = discrete.alloc_host_mem(4096, 0).unwrap();
        let device = discrete.alloc_device_mem(4096, 0).unwrap();
        let shared = discrete.alloc_shared_mem(4096, 0).unwrap();
        assert!(discrete.find_allocation(host).unwrap().unwrap().0.is_in_system_memory());
        assert!(!discrete.find_allocation(device).unwrap().unwrap().0.is_in_system_memory());
        assert!(!discrete.find_allocation(shared).unwrap().unwrap().0.is_in_system_memory());

        let integrated = MemoryManager::new(false, 0);
        let shared = integrated.alloc_shared_mem(4096, 0).unwrap();
        assert!(integrated.find_allocation(shared).unwrap().unwrap().0.is_in_system_memory());
    }

    #[test]
    fn test_resolve_interior_and_external_pointers() {
        let mm = MemoryManager::new(true, GB);
        let device = mm.alloc_device_mem(0x2000, 0).unwrap();
        match mm.resolve(device + 0x10).unwrap() {
            ResolvedPointer::Usm { offset, memory_type, .. } => {
                assert_eq!(offset, 0x10);
                assert_eq!(memory_type, UsmMemoryType::Device);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            mm.resolve(0x7fff_1234_0000).unwrap(),
            ResolvedPointer::External { .. }
        ));
    }

    #[test]
    fn test_device_memory_budget() {
        let mm = MemoryManager::new(true, 0x20000);
        let first = mm.alloc_device_mem(0x10000, 0).unwrap();
        let err = mm.alloc_device_mem(0x20000, 0).unwrap_err();
        assert!(matches!(err, DriverError::OutOfDeviceMemory { .. }));
        mm.free_mem(first).unwrap();
        assert_eq!(mm.local_memory_used().unwrap(), 0);
        assert!(mm.free_mem(first).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mm = MemoryManager::new(true, GB);
        assert!(matches!(
            mm.alloc_host_mem(0, 0).unwrap_err(),
            DriverError::UnsupportedSize(_)
        ));
    }

    #[test]
    fn test_virtual_reservation_mapping() {
        let mm = MemoryManager::new(true, GB);
        let base = mm.reserve_virtual_mem(4 * PAGE_SIZE_64K).unwrap();
        let first = mm.create_physical_mem(PAGE_SIZE_64K).unwrap();
        let second = mm.create_physical_mem(PAGE_SIZE_64K).unwrap();
        mm.map_virtual_mem(base, first).unwrap();
        mm.map_virtual_mem(base + PAGE_SIZE_64K as u64, second).unwrap();
        assert!(mm.map_virtual_mem(base, second).is_err());

        match mm.resolve(base + 0x100).unwrap() {
            ResolvedPointer::Reserved { offset, mapped, .. } => {
                assert_eq!(offset, 0x100);
                assert_eq!(mapped.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(mm.resolve(base + 3 * PAGE_SIZE_64K as u64).is_err());
        assert!(mm.free_virtual_mem(base).is_err());
        mm.unmap_virtual_mem(base).unwrap();
        mm.unmap_virtual_mem(base + PAGE_SIZE_64K as u64).unwrap();
        mm.free_virtual_mem(base).unwrap();
    }
}
