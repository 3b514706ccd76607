// Application supplied allocation callbacks
//
// Vulkan lets the application inject host allocation callbacks at
// several scopes. We never allocate through them ourselves, but every
// create/destroy call we forward to the driver has to carry them, and
// container growth on behalf of the application has to fail softly
// with an out-of-memory result instead of aborting the process.
//
// Austin Shafer - 2025
use ash::vk;

use crate::{Result, StratusError};

/// The lifetime class of an allocation, mirroring
/// VkSystemAllocationScope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocationScope {
    Instance,
    Device,
    Object,
    Command,
}

/// Carrier for the caller's allocation callbacks.
///
/// One of these is threaded through every object the engine creates.
/// If the application did not supply callbacks the process default
/// allocator is used, which for ash means passing None.
#[derive(Clone)]
pub struct ObjectAllocator {
    oa_callbacks: Option<vk::AllocationCallbacks>,
    oa_scope: AllocationScope,
}

// The raw user data pointer inside VkAllocationCallbacks keeps this
// from deriving Send/Sync. The Vulkan spec requires application
// callbacks to be callable from any thread, so sharing the carrier is
// sound.
unsafe impl Send for ObjectAllocator {}
unsafe impl Sync for ObjectAllocator {}

impl ObjectAllocator {
    pub fn new(callbacks: Option<vk::AllocationCallbacks>, scope: AllocationScope) -> Self {
        Self {
            oa_callbacks: callbacks,
            oa_scope: scope,
        }
    }

    /// An allocator with no application callbacks.
    pub fn default_for(scope: AllocationScope) -> Self {
        Self::new(None, scope)
    }

    /// The callbacks in the form every ash create/destroy call wants.
    pub fn callbacks(&self) -> Option<&vk::AllocationCallbacks> {
        self.oa_callbacks.as_ref()
    }

    pub fn scope(&self) -> AllocationScope {
        self.oa_scope
    }

    /// Rescope this allocator for a child object.
    pub fn with_scope(&self, scope: AllocationScope) -> Self {
        Self {
            oa_callbacks: self.oa_callbacks,
            oa_scope: scope,
        }
    }

    /// Allocate a vector of `n` default entries, reporting allocation
    /// failure as a value instead of aborting.
    pub fn try_alloc_vec<T: Default>(&self, n: usize) -> Result<Vec<T>> {
        let mut ret = Vec::new();
        ret.try_reserve_exact(n)
            .map_err(|_| StratusError::OUT_OF_HOST_MEMORY)?;
        ret.resize_with(n, T::default);
        Ok(ret)
    }

    /// Grow a vector by `additional` slots, failing softly.
    pub fn try_reserve<T>(&self, vec: &mut Vec<T>, additional: usize) -> Result<()> {
        vec.try_reserve(additional)
            .map_err(|_| StratusError::OUT_OF_HOST_MEMORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_vec() {
        let alloc = ObjectAllocator::default_for(AllocationScope::Object);
        let v: Vec<u64> = alloc.try_alloc_vec(4).unwrap();
        assert_eq!(v.len(), 4);
        assert!(v.iter().all(|e| *e == 0));
    }

    #[test]
    fn rescope_keeps_callbacks() {
        let alloc = ObjectAllocator::default_for(AllocationScope::Device);
        let child = alloc.with_scope(AllocationScope::Object);
        assert_eq!(child.scope(), AllocationScope::Object);
        assert!(child.callbacks().is_none());
    }
}
