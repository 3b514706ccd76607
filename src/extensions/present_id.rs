// VK_KHR_present_id
//
// Austin Shafer - 2025
use super::SwapchainExtension;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the most recent present id the presentation engine has
/// processed for this swapchain. Applications use it to correlate
/// feedback with their own frame counters.
pub struct PresentId {
    /// Latched after each present completes
    pi_id: AtomicU64,
}

impl PresentId {
    pub const NAME: &'static str = "VK_KHR_present_id";

    pub fn new() -> Self {
        Self {
            pi_id: AtomicU64::new(0),
        }
    }

    /// Record that the present tagged with `value` reached the
    /// presentation engine. Ids are monotonic, an older id never
    /// overwrites a newer one.
    pub fn set_present_id(&self, value: u64) {
        self.pi_id.fetch_max(value, Ordering::AcqRel);
    }

    pub fn present_id(&self) -> u64 {
        self.pi_id.load(Ordering::Acquire)
    }
}

impl Default for PresentId {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapchainExtension for PresentId {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let ext = PresentId::new();
        ext.set_present_id(4);
        ext.set_present_id(2);
        assert_eq!(ext.present_id(), 4);
    }
}
