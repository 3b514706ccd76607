// Headless backend
//
// No windowing system at all: images are plain device memory and a
// present completes the moment its payload does. Used for testing
// and for drivers that want a swapchain without a display. This is
// also the reference presenter, the engine behaviors every other
// backend inherits are easiest to read here.
//
// Austin Shafer - 2025
use ash::vk;

use crate::allocator::ObjectAllocator;
use crate::device::Device;
use crate::presenter::{ImageData, PresentOutcome, Presenter};
use crate::surface::{
    GravityFlags, PresentModeCompatibility, ScalingCapabilities, ScalingFlags, Surface,
    SurfaceProperties, MAX_SWAPCHAIN_IMAGE_COUNT,
};
use crate::swapchain::{
    ImageCreateDesc, PendingPresent, Swapchain, SwapchainCreateInfo, SwapchainHooks,
    SwapchainImage,
};
use crate::sync::{self, FenceSync, QueueSubmitSemaphores};
use crate::extensions::compression::CompressionMode;
use crate::extensions::frame_boundary::FrameBoundaryInfo;
use crate::{Result, StratusError};
use utils::log;

use std::any::Any;
use std::sync::Arc;

static HEADLESS_PRESENT_MODES: [vk::PresentModeKHR; 4] = [
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::SHARED_DEMAND_REFRESH,
    vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
];

/// FIFO and FIFO_RELAXED may switch between each other; the shared
/// modes only tolerate themselves.
static HEADLESS_MODE_COMPATIBILITY: [PresentModeCompatibility; 4] = [
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::FIFO,
        compatible: &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED],
    },
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::FIFO_RELAXED,
        compatible: &[vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO],
    },
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::SHARED_DEMAND_REFRESH,
        compatible: &[vk::PresentModeKHR::SHARED_DEMAND_REFRESH],
    },
    PresentModeCompatibility {
        mode: vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
        compatible: &[vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH],
    },
];

pub struct HeadlessSurfaceProperties;

impl SurfaceProperties for HeadlessSurfaceProperties {
    fn get_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        // There is no real surface, so no fixed extent either
        Ok(vk::SurfaceCapabilitiesKHR::builder()
            .min_image_count(1)
            .max_image_count(MAX_SWAPCHAIN_IMAGE_COUNT as u32)
            .current_extent(vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            })
            .min_image_extent(vk::Extent2D {
                width: 1,
                height: 1,
            })
            .max_image_extent(vk::Extent2D {
                width: 16384,
                height: 16384,
            })
            .max_image_array_layers(1)
            .supported_transforms(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .current_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .supported_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .supported_usage_flags(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
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
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ])
    }

    fn get_present_modes(&self) -> &[vk::PresentModeKHR] {
        &HEADLESS_PRESENT_MODES
    }

    fn get_compatible_present_modes(
        &self,
        mode: vk::PresentModeKHR,
    ) -> &[vk::PresentModeKHR] {
        PresentModeCompatibility::modes_compatible_with(&HEADLESS_MODE_COMPATIBILITY, mode)
    }

    fn get_scaling_capabilities(&self) -> ScalingCapabilities {
        ScalingCapabilities {
            scaling: ScalingFlags::ONE_TO_ONE | ScalingFlags::STRETCH,
            gravity_x: GravityFlags::MIN | GravityFlags::CENTER | GravityFlags::MAX,
            gravity_y: GravityFlags::MIN | GravityFlags::CENTER | GravityFlags::MAX,
        }
    }
}

/// A headless VkSurface stand-in.
pub struct HeadlessSurface {
    hs_properties: HeadlessSurfaceProperties,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self {
            hs_properties: HeadlessSurfaceProperties,
        }
    }
}

impl Default for HeadlessSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for HeadlessSurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.hs_properties
    }

    fn create_swapchain(
        &self,
        dev: Arc<Device>,
        info: SwapchainCreateInfo,
        allocator: ObjectAllocator,
        old_swapchain: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        let presenter = Box::new(HeadlessPresenter::new(dev, allocator.clone()));
        Swapchain::new(info, presenter, &self.hs_properties, allocator, old_swapchain)
    }
}

/// Per-image state: the backing memory and the present fence.
struct HeadlessImageData {
    hd_dev: Arc<Device>,
    hd_alloc: ObjectAllocator,
    hd_memory: vk::DeviceMemory,
    hd_present_fence: FenceSync,
}

impl ImageData for HeadlessImageData {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessImageData {
    fn drop(&mut self) {
        unsafe {
            self.hd_dev
                .dev
                .free_memory(self.hd_memory, self.hd_alloc.callbacks());
        }
    }
}

fn image_data(image: &SwapchainImage) -> Result<&HeadlessImageData> {
    image
        .data
        .as_deref()
        .and_then(|data| data.as_any().downcast_ref::<HeadlessImageData>())
        .ok_or(StratusError::INVALID)
}

/// The headless presenter.
pub struct HeadlessPresenter {
    hp_dev: Arc<Device>,
    hp_alloc: ObjectAllocator,
}

impl HeadlessPresenter {
    pub fn new(dev: Arc<Device>, alloc: ObjectAllocator) -> Self {
        Self {
            hp_dev: dev,
            hp_alloc: alloc,
        }
    }
}

impl Presenter for HeadlessPresenter {
    fn init(&self, info: &SwapchainCreateInfo, _hooks: SwapchainHooks) -> Result<bool> {
        // Demand refresh and mailbox presents happen on the calling
        // thread; everything else goes through the flip thread.
        let use_thread = !matches!(
            info.present_mode,
            vk::PresentModeKHR::SHARED_DEMAND_REFRESH | vk::PresentModeKHR::MAILBOX
        );
        Ok(use_thread)
    }

    fn create_image(&self, desc: &ImageCreateDesc) -> Result<vk::Image> {
        // The compression request rides along on every image created
        // from this swapchain's template, deferred ones included
        let mut fixed_rate_flags: Vec<vk::ImageCompressionFixedRateFlagsEXT> = desc
            .compression
            .as_ref()
            .map(|compression| {
                compression
                    .fixed_rate_flags
                    .iter()
                    .map(|bits| vk::ImageCompressionFixedRateFlagsEXT::from_raw(*bits))
                    .collect()
            })
            .unwrap_or_default();
        let mut compression_info = desc.compression.as_ref().map(|compression| {
            vk::ImageCompressionControlEXT::builder()
                .flags(match compression.mode {
                    CompressionMode::Default => vk::ImageCompressionFlagsEXT::DEFAULT,
                    CompressionMode::FixedRateDefault => {
                        vk::ImageCompressionFlagsEXT::FIXED_RATE_DEFAULT
                    }
                    CompressionMode::FixedRateExplicit => {
                        vk::ImageCompressionFlagsEXT::FIXED_RATE_EXPLICIT
                    }
                    CompressionMode::Disabled => vk::ImageCompressionFlagsEXT::DISABLED,
                })
                .fixed_rate_flags(&mut fixed_rate_flags)
        });

        let mut create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(desc.sharing_mode)
            .queue_family_indices(&desc.queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if let Some(compression_info) = compression_info.as_mut() {
            create_info = create_info.push_next(compression_info);
        }

        unsafe {
            self.hp_dev
                .dev
                .create_image(&create_info, self.hp_alloc.callbacks())
                .map_err(StratusError::from)
        }
    }

    fn allocate_and_bind(&self, _desc: &ImageCreateDesc, image: &mut SwapchainImage) -> Result<()> {
        let dev = &self.hp_dev;
        let requirements = unsafe { dev.dev.get_image_memory_requirements(image.handle) };

        let mem_type = dev
            .find_first_memory_type(requirements.memory_type_bits)
            .ok_or(StratusError::OUT_OF_DEVICE_MEMORY)?;

        let mem_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type);

        let memory = unsafe {
            dev.dev
                .allocate_memory(&mem_info, self.hp_alloc.callbacks())
                .map_err(StratusError::from)?
        };

        if let Err(e) = unsafe { dev.dev.bind_image_memory(image.handle, memory, 0) } {
            unsafe { dev.dev.free_memory(memory, self.hp_alloc.callbacks()) };
            return Err(e.into());
        }

        let present_fence = match FenceSync::new(dev.clone(), &self.hp_alloc) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { dev.dev.free_memory(memory, self.hp_alloc.callbacks()) };
                return Err(e);
            }
        };

        image.data = Some(Arc::new(HeadlessImageData {
            hd_dev: dev.clone(),
            hd_alloc: self.hp_alloc.clone(),
            hd_memory: memory,
            hd_present_fence: present_fence,
        }));

        Ok(())
    }

    fn present_image(
        &self,
        _request: &PendingPresent,
        _image: &SwapchainImage,
    ) -> Result<PresentOutcome> {
        // Nothing to display on; the image is free again the moment
        // we return
        Ok(PresentOutcome::Released)
    }

    fn destroy_image(&self, image: &mut SwapchainImage) {
        if image.handle != vk::Image::null() {
            unsafe {
                self.hp_dev
                    .dev
                    .destroy_image(image.handle, self.hp_alloc.callbacks());
            }
            image.handle = vk::Image::null();
        }

        // Backing memory goes with the last reference
        image.data = None;
    }

    fn set_present_payload(
        &self,
        image: &SwapchainImage,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        _boundary: Option<&FrameBoundaryInfo>,
    ) -> Result<()> {
        // Frame boundaries have no consumer without a display; they
        // are dropped here
        image_data(image)?
            .hd_present_fence
            .set_payload(queue, semaphores)
    }

    fn wait_present(&self, image: &SwapchainImage, timeout_ns: u64) -> Result<()> {
        image_data(image)?.hd_present_fence.wait_payload(timeout_ns)
    }

    fn bind_swapchain_image(
        &self,
        image: vk::Image,
        swapchain_image: &SwapchainImage,
    ) -> Result<()> {
        let data = image_data(swapchain_image)?;
        unsafe {
            self.hp_dev
                .dev
                .bind_image_memory(image, data.hd_memory, 0)
                .map_err(StratusError::from)
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.hp_dev
                .dev
                .create_semaphore(&vk::SemaphoreCreateInfo::builder(), self.hp_alloc.callbacks())
                .map_err(StratusError::from)
        }
    }

    fn destroy_semaphore(&self, sem: vk::Semaphore) {
        unsafe {
            self.hp_dev
                .dev
                .destroy_semaphore(sem, self.hp_alloc.callbacks());
        }
    }

    fn signal_acquire(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<()> {
        sync::signal_acquire_sync_objects(&self.hp_dev, semaphore, fence)
    }

    fn sync_queue_submit(
        &self,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        fence: vk::Fence,
    ) -> Result<()> {
        sync::queue_signal_submit(&self.hp_dev, queue, semaphores, fence)
    }

    fn queue_wait_idle(&self) -> Result<()> {
        self.hp_dev.with_internal_queue(|queue| unsafe {
            self.hp_dev.dev.queue_wait_idle(queue).map_err(|e| {
                log::error!("queue_wait_idle failed: {:?}", e);
                StratusError::from(e)
            })
        })
    }
}
