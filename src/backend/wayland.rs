// Wayland backend
//
// Only the capability side lives here: what a Wayland surface can do
// and which extensions instance/device creation must inject for it.
// The wire protocol presenter (wl_buffer management, frame callbacks,
// presentation-time) belongs to the compositor integration outside
// this tree, so asking this surface for a swapchain fails cleanly.
//
// Austin Shafer - 2025
use ash::vk;

use crate::allocator::ObjectAllocator;
use crate::device::Device;
use crate::surface::{
    GravityFlags, PresentModeCompatibility, ScalingCapabilities, ScalingFlags, Surface,
    SurfaceProperties,
};
use crate::swapchain::{Swapchain, SwapchainCreateInfo};
use crate::{Result, StratusError};
use utils::log;

use std::sync::Arc;

static WAYLAND_PRESENT_MODES: [vk::PresentModeKHR; 2] = [
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::MAILBOX,
];

static WAYLAND_MODE_COMPATIBILITY: [PresentModeCompatibility; 2] = [
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::FIFO,
        compatible: &[vk::PresentModeKHR::FIFO],
    },
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::MAILBOX,
        compatible: &[vk::PresentModeKHR::MAILBOX],
    },
];

pub struct WaylandSurfaceProperties {
    wp_extent: vk::Extent2D,
}

impl WaylandSurfaceProperties {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self { wp_extent: extent }
    }
}

impl SurfaceProperties for WaylandSurfaceProperties {
    fn get_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(vk::SurfaceCapabilitiesKHR::builder()
            .min_image_count(2)
            .max_image_count(0)
            .current_extent(self.wp_extent)
            .min_image_extent(vk::Extent2D {
                width: 1,
                height: 1,
            })
            .max_image_extent(self.wp_extent)
            .max_image_array_layers(1)
            .supported_transforms(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .current_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .supported_composite_alpha(
                vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            )
            .supported_usage_flags(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .build())
    }

    fn get_surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ])
    }

    fn get_present_modes(&self) -> &[vk::PresentModeKHR] {
        &WAYLAND_PRESENT_MODES
    }

    fn get_compatible_present_modes(
        &self,
        mode: vk::PresentModeKHR,
    ) -> &[vk::PresentModeKHR] {
        PresentModeCompatibility::modes_compatible_with(&WAYLAND_MODE_COMPATIBILITY, mode)
    }

    fn get_scaling_capabilities(&self) -> ScalingCapabilities {
        ScalingCapabilities {
            scaling: ScalingFlags::ONE_TO_ONE | ScalingFlags::STRETCH,
            gravity_x: GravityFlags::MIN | GravityFlags::CENTER | GravityFlags::MAX,
            gravity_y: GravityFlags::MIN | GravityFlags::CENTER | GravityFlags::MAX,
        }
    }

    fn get_required_instance_extensions(&self) -> &[&'static str] {
        &["VK_KHR_surface", "VK_KHR_wayland_surface"]
    }

    fn get_required_device_extensions(&self) -> &[&'static str] {
        &[
            "VK_KHR_external_memory_fd",
            "VK_EXT_external_memory_dma_buf",
        ]
    }
}

/// A Wayland surface as far as capability queries are concerned.
pub struct WaylandSurface {
    ws_properties: WaylandSurfaceProperties,
}

impl WaylandSurface {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            ws_properties: WaylandSurfaceProperties::new(extent),
        }
    }
}

impl Surface for WaylandSurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.ws_properties
    }

    fn create_swapchain(
        &self,
        _dev: Arc<Device>,
        _info: SwapchainCreateInfo,
        _allocator: ObjectAllocator,
        _old_swapchain: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        log::error!("the Wayland presenter is not part of this build");
        Err(StratusError::INITIALIZATION_FAILED)
    }
}
