//! Local memory registrations, indexed like the BufferSet they describe.

use super::region::{AccessKey, BufferSet, MemoryRegion};
use crate::error::{Result, TransportError};
use crate::fabric::{Fabric, RegisteredMemory};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A live fabric registration.
///
/// Shared between the registry slot and every in-flight operation touching
/// the region. The fabric registration is released when the last holder
/// drops, so unregistering never pulls memory out from under the NIC.
pub struct Registration {
    region: MemoryRegion,
    memory: Box<dyn RegisteredMemory>,
}

impl Registration {
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn lkey(&self) -> u32 {
        self.memory.lkey()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        tracing::debug!(
            base = format_args!("{:#x}", self.region.base_address),
            len = self.region.length,
            key = %self.region.access_key,
            "memory region deregistered"
        );
    }
}

#[derive(Default)]
struct Inner {
    buffers: BufferSet,
    slots: Vec<Option<Arc<Registration>>>,
}

/// Registers spans with a fabric and tracks them by BufferSet index.
pub struct RegionRegistry {
    fabric: Arc<dyn Fabric>,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

impl RegionRegistry {
    pub fn new(fabric: Arc<dyn Fabric>, max_bytes: u64) -> Self {
        Self {
            fabric,
            max_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `[address + offset, address + offset + length)` and append it.
    ///
    /// Returns the new region's index and descriptor.
    ///
    /// # Safety
    ///
    /// The span must stay valid until the region is unregistered and every
    /// operation using it has resolved.
    pub unsafe fn register(
        &self,
        address: u64,
        offset: u64,
        length: u64,
    ) -> Result<(usize, MemoryRegion)> {
        if length == 0 {
            return Err(TransportError::Registration(
                "cannot register a zero-length region".into(),
            ));
        }
        if length > self.max_bytes {
            return Err(TransportError::Registration(format!(
                "region of {length} bytes exceeds the {} byte registration limit",
                self.max_bytes
            )));
        }
        let start = address
            .checked_add(offset)
            .filter(|s| s.checked_add(length).is_some())
            .ok_or_else(|| {
                TransportError::Registration(format!(
                    "region {address:#x}+{offset}+{length} overflows the address space"
                ))
            })?;

        // SAFETY: forwarded to the caller.
        let memory = unsafe { self.fabric.register(start, length)? };
        let region = MemoryRegion {
            base_address: address,
            offset,
            length,
            access_key: AccessKey(memory.rkey()),
        };

        let mut inner = self.lock();
        let index = inner.buffers.add(region);
        inner
            .slots
            .push(Some(Arc::new(Registration { region, memory })));
        tracing::debug!(
            index,
            base = format_args!("{address:#x}"),
            offset,
            length,
            fabric = self.fabric.name(),
            "memory region registered"
        );
        Ok((index, region))
    }

    /// Drop the registry's hold on region `index`. Idempotent.
    ///
    /// Returns whether the region was registered before the call. The index
    /// stays allocated in the BufferSet.
    pub fn unregister(&self, index: usize) -> bool {
        let taken = self.lock().slots.get_mut(index).and_then(Option::take);
        taken.is_some()
    }

    /// Unregister every region.
    pub fn unregister_all(&self) -> usize {
        let mut inner = self.lock();
        inner.slots.iter_mut().filter_map(Option::take).count()
    }

    /// Take a reference on region `index` for the lifetime of an operation.
    pub fn pin(&self, index: usize) -> Option<Arc<Registration>> {
        self.lock().slots.get(index).and_then(Clone::clone)
    }

    pub fn is_registered(&self, index: usize) -> bool {
        self.lock().slots.get(index).is_some_and(Option::is_some)
    }

    /// Snapshot of every region ever added, registered or not.
    pub fn buffers(&self) -> BufferSet {
        self.lock().buffers.clone()
    }

    pub fn registered_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }
}
