// Swapchain extension registry
//
// Optional features attach per-swapchain state: a present id counter,
// a compatible present mode list, a presentation timing queue. Each
// lives in its own object keyed by type in this small registry. The
// set is decided once at swapchain creation and never changes, so
// lookups are lock free; stateful extensions lock their own insides.
//
// Austin Shafer - 2025
pub mod compression;
pub mod frame_boundary;
pub mod maintenance;
pub mod present_id;
#[cfg(feature = "present-timing")]
pub mod present_timing;

use std::any::Any;

/// One optional swapchain feature.
///
/// `name` is the Vulkan extension string the feature implements,
/// kept for diagnostics. Identity for lookup purposes is the
/// concrete type, recovered with a downcast through `as_any`.
pub trait SwapchainExtension: Send + Sync {
    fn name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

/// The per-swapchain set of enabled extensions.
///
/// N is small (at most five today) so lookup is a linear scan.
pub struct ExtensionRegistry {
    er_extensions: Vec<Box<dyn SwapchainExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            er_extensions: Vec::new(),
        }
    }

    /// Add an extension. Refuses duplicates of the same concrete
    /// type, there is one instance of each feature per swapchain.
    pub fn add(&mut self, ext: Box<dyn SwapchainExtension>) -> bool {
        let id = ext.as_any().type_id();
        if self
            .er_extensions
            .iter()
            .any(|e| e.as_any().type_id() == id)
        {
            return false;
        }

        self.er_extensions.push(ext);
        true
    }

    /// Fetch the extension of type T, if this swapchain enabled it.
    pub fn get<T: SwapchainExtension + 'static>(&self) -> Option<&T> {
        self.er_extensions
            .iter()
            .find_map(|e| e.as_any().downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.er_extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.er_extensions.is_empty()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::present_id::PresentId;
    use super::*;

    #[test]
    fn typed_lookup() {
        let mut reg = ExtensionRegistry::new();
        assert!(reg.get::<PresentId>().is_none());

        assert!(reg.add(Box::new(PresentId::new())));
        // one instance per feature
        assert!(!reg.add(Box::new(PresentId::new())));

        let ext = reg.get::<PresentId>().unwrap();
        assert_eq!(ext.name(), PresentId::NAME);
        assert_eq!(reg.len(), 1);
    }
}
