// VK_EXT_image_compression_control
//
// Austin Shafer - 2025
use super::SwapchainExtension;

use std::any::Any;

/// The compression behavior requested for the swapchain's images.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    /// Let the implementation pick
    Default,
    /// Fixed rate compression at implementation chosen rates
    FixedRateDefault,
    /// Fixed rate compression at explicit per-plane rates
    FixedRateExplicit,
    /// No compression at all
    Disabled,
}

/// The parameters carried from swapchain creation into every image
/// the swapchain materializes, including deferred ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionControl {
    pub mode: CompressionMode,
    /// Per-plane fixed rate flag bits, only meaningful for
    /// FixedRateExplicit
    pub fixed_rate_flags: Vec<u32>,
}

impl CompressionControl {
    pub fn new(mode: CompressionMode) -> Self {
        Self {
            mode,
            fixed_rate_flags: Vec::new(),
        }
    }
}

/// Holds the compression request so image creation, including the
/// deferred-allocation path long after creation, can apply it.
pub struct CompressionControlExt {
    cc_control: CompressionControl,
}

impl CompressionControlExt {
    pub const NAME: &'static str = "VK_EXT_image_compression_control";

    pub fn new(control: CompressionControl) -> Self {
        Self {
            cc_control: control,
        }
    }

    pub fn get_compression_control_properties(&self) -> &CompressionControl {
        &self.cc_control
    }
}

impl SwapchainExtension for CompressionControlExt {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
