// Surface contracts
//
// A Surface ties together a windowing backend's capability queries
// and its swapchain factory. The engine consumes the properties side
// at creation time to validate what the application asked for.
//
// Austin Shafer - 2025
use ash::vk;

use crate::allocator::ObjectAllocator;
use crate::device::Device;
use crate::swapchain::{Swapchain, SwapchainCreateInfo};
use crate::Result;

use std::sync::Arc;

/// Hard upper bound on images per swapchain. The pending-present
/// ring is sized by this, so it also bounds how many presents can be
/// queued at once.
pub const MAX_SWAPCHAIN_IMAGE_COUNT: usize = 32;

bitflags::bitflags! {
    /// How the presentation engine may scale images that do not
    /// match the surface dimensions.
    pub struct ScalingFlags: u32 {
        const ONE_TO_ONE = 0b001;
        const ASPECT_RATIO_STRETCH = 0b010;
        const STRETCH = 0b100;
    }
}

bitflags::bitflags! {
    /// Where an unscaled image sits on an axis of a larger surface.
    pub struct GravityFlags: u32 {
        const MIN = 0b001;
        const MAX = 0b010;
        const CENTER = 0b100;
    }
}

/// What the surface supports in terms of scaling and gravity.
#[derive(Copy, Clone, Debug)]
pub struct ScalingCapabilities {
    pub scaling: ScalingFlags,
    pub gravity_x: GravityFlags,
    pub gravity_y: GravityFlags,
}

/// The application's requested scaling behavior at swapchain
/// creation. Empty flag sets mean "unspecified", which always
/// validates.
#[derive(Copy, Clone, Debug)]
pub struct ScalingCreateInfo {
    pub scaling: ScalingFlags,
    pub gravity_x: GravityFlags,
    pub gravity_y: GravityFlags,
}

/// One row of a backend's present mode compatibility table: the set
/// of modes a swapchain created with `mode` may switch to at present
/// time.
pub struct PresentModeCompatibility {
    pub mode: vk::PresentModeKHR,
    pub compatible: &'static [vk::PresentModeKHR],
}

impl PresentModeCompatibility {
    /// Look up the compatibility row for `mode` in a backend table.
    pub fn modes_compatible_with(
        table: &'static [PresentModeCompatibility],
        mode: vk::PresentModeKHR,
    ) -> &'static [vk::PresentModeKHR] {
        table
            .iter()
            .find(|entry| entry.mode == mode)
            .map(|entry| entry.compatible)
            .unwrap_or(&[])
    }
}

/// Backend agnostic capability queries for one surface.
///
/// These are what vkGetPhysicalDeviceSurface* resolve to once a
/// request reaches this layer.
pub trait SurfaceProperties: Send + Sync {
    fn get_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR>;

    fn get_surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>>;

    fn get_present_modes(&self) -> &[vk::PresentModeKHR];

    /// The modes a swapchain created with `mode` may live-switch to.
    fn get_compatible_present_modes(&self, mode: vk::PresentModeKHR)
        -> &[vk::PresentModeKHR];

    fn is_compatible_present_mode(
        &self,
        current: vk::PresentModeKHR,
        other: vk::PresentModeKHR,
    ) -> bool {
        self.get_compatible_present_modes(current).contains(&other)
    }

    fn get_scaling_capabilities(&self) -> ScalingCapabilities;

    /// Instance extensions this backend needs injected at instance
    /// creation time.
    fn get_required_instance_extensions(&self) -> &[&'static str] {
        &[]
    }

    /// Device extensions this backend needs injected at device
    /// creation time.
    fn get_required_device_extensions(&self) -> &[&'static str] {
        &[]
    }
}

/// A generic representation of one VkSurface.
///
/// Backends produce these; the association between them and the
/// application's surface handles is kept by the embedding layer.
pub trait Surface: Send + Sync {
    /// The capability queries specific to this surface.
    fn get_properties(&self) -> &dyn SurfaceProperties;

    /// Allocate a swapchain presenting to this surface.
    ///
    /// `allocator` carries the application's allocation callbacks for
    /// everything the swapchain creates on its behalf.
    fn create_swapchain(
        &self,
        dev: Arc<Device>,
        info: SwapchainCreateInfo,
        allocator: ObjectAllocator,
        old_swapchain: Option<&Swapchain>,
    ) -> Result<Swapchain>;
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_TABLE: [PresentModeCompatibility; 2] = [
        PresentModeCompatibility {
            mode: vk::PresentModeKHR::FIFO,
            compatible: &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED],
        },
        PresentModeCompatibility {
            mode: vk::PresentModeKHR::MAILBOX,
            compatible: &[vk::PresentModeKHR::MAILBOX],
        },
    ];

    #[test]
    fn compatibility_lookup() {
        let fifo = PresentModeCompatibility::modes_compatible_with(
            &TEST_TABLE,
            vk::PresentModeKHR::FIFO,
        );
        assert!(fifo.contains(&vk::PresentModeKHR::FIFO_RELAXED));

        let immediate = PresentModeCompatibility::modes_compatible_with(
            &TEST_TABLE,
            vk::PresentModeKHR::IMMEDIATE,
        );
        assert!(immediate.is_empty());
    }
}
