// DRM/KMS display plane backend
//
// Present directly to a display plane with no window system in
// between. Swapchain memory is exported from the device as dma-bufs,
// prime-imported into DRM and wrapped in framebuffers; the first
// present performs the modeset and every present after that is a
// page flip. The flip thread blocks here until the kernel reports
// the flip completed, which is what gives FIFO its vsync pacing.
//
// Austin Shafer - 2025
extern crate drm;

use ash::vk;
use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Mode, PageFlipFlags};
use drm::{control, Device as DrmDeviceTrait};

use crate::allocator::ObjectAllocator;
use crate::device::Device;
use crate::extensions::frame_boundary::FrameBoundaryInfo;
use crate::presenter::{ImageData, PresentOutcome, Presenter};
use crate::surface::{
    GravityFlags, PresentModeCompatibility, ScalingCapabilities, ScalingFlags, Surface,
    SurfaceProperties,
};
use crate::swapchain::{
    ImageCreateDesc, PendingPresent, Swapchain, SwapchainCreateInfo, SwapchainHooks,
    SwapchainImage,
};
use crate::sync::{self, QueueSubmitSemaphores, SyncFdFenceSync};
use crate::{Result, StratusError};
use utils::fdwatch::FdWatch;
use utils::log;

use std::any::Any;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Our DRM node accessor helper
///
/// This provides drm-rs with access to the DRM fd and gives us a
/// place to make calls to DRM.
pub struct DrmDisplay {
    dd_drm_fd: std::fs::File,
}

impl AsFd for DrmDisplay {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.dd_drm_fd.as_fd()
    }
}

impl DrmDeviceTrait for DrmDisplay {}
impl ControlDevice for DrmDisplay {}

impl DrmDisplay {
    /// Open a DRM node. Defaults to the first card when no path is
    /// given. Setting the mode later usually requires DRM master.
    pub fn open(path: Option<&Path>) -> Result<Arc<Self>> {
        let path = path.unwrap_or_else(|| Path::new("/dev/dri/card0"));

        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        options.write(true);
        let file = options.open(path).map_err(|e| {
            log::error!("Could not open DRM device {}: {}", path.display(), e);
            StratusError::SURFACE_LOST
        })?;

        Ok(Arc::new(DrmDisplay { dd_drm_fd: file }))
    }
}

static DISPLAY_PRESENT_MODES: [vk::PresentModeKHR; 1] = [vk::PresentModeKHR::FIFO];

static DISPLAY_MODE_COMPATIBILITY: [PresentModeCompatibility; 1] = [PresentModeCompatibility {
    mode: vk::PresentModeKHR::FIFO,
    compatible: &[vk::PresentModeKHR::FIFO],
}];

pub struct DisplaySurfaceProperties {
    dp_extent: vk::Extent2D,
}

impl SurfaceProperties for DisplaySurfaceProperties {
    fn get_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        // The plane is exactly the mode's size, no scaling hardware
        // is assumed
        Ok(vk::SurfaceCapabilitiesKHR::builder()
            .min_image_count(2)
            .max_image_count(4)
            .current_extent(self.dp_extent)
            .min_image_extent(self.dp_extent)
            .max_image_extent(self.dp_extent)
            .max_image_array_layers(1)
            .supported_transforms(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .current_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .supported_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
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
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ])
    }

    fn get_present_modes(&self) -> &[vk::PresentModeKHR] {
        &DISPLAY_PRESENT_MODES
    }

    fn get_compatible_present_modes(
        &self,
        mode: vk::PresentModeKHR,
    ) -> &[vk::PresentModeKHR] {
        PresentModeCompatibility::modes_compatible_with(&DISPLAY_MODE_COMPATIBILITY, mode)
    }

    fn get_scaling_capabilities(&self) -> ScalingCapabilities {
        ScalingCapabilities {
            scaling: ScalingFlags::ONE_TO_ONE,
            gravity_x: GravityFlags::MIN,
            gravity_y: GravityFlags::MIN,
        }
    }

    fn get_required_instance_extensions(&self) -> &[&'static str] {
        &["VK_KHR_surface", "VK_KHR_display"]
    }

    fn get_required_device_extensions(&self) -> &[&'static str] {
        &[
            "VK_KHR_external_memory_fd",
            "VK_EXT_external_memory_dma_buf",
            "VK_KHR_external_fence_fd",
        ]
    }
}

/// One display plane surface: a connected connector, the CRTC
/// driving it, and the mode we will set.
pub struct DisplaySurface {
    ds_display: Arc<DrmDisplay>,
    ds_conn: connector::Info,
    ds_crtc: crtc::Info,
    ds_mode: Mode,
    ds_properties: DisplaySurfaceProperties,
}

impl DisplaySurface {
    /// Pick the first connected connector and its preferred mode.
    pub fn new(display: Arc<DrmDisplay>) -> Result<Self> {
        let res = display.resource_handles().map_err(|e| {
            log::error!("Could not get DRM resource handles: {}", e);
            StratusError::SURFACE_LOST
        })?;

        let conn = res
            .connectors()
            .iter()
            .flat_map(|con| display.get_connector(*con, false))
            .find(|info| info.state() == connector::State::Connected)
            .ok_or_else(|| {
                log::error!("No connected DRM connectors found");
                StratusError::SURFACE_LOST
            })?;

        // The first mode is the connector's preferred one
        let mode = *conn.modes().first().ok_or(StratusError::SURFACE_LOST)?;

        let crtc = res
            .crtcs()
            .iter()
            .flat_map(|crtc| display.get_crtc(*crtc))
            .next()
            .ok_or(StratusError::SURFACE_LOST)?;

        let (width, height) = mode.size();
        Ok(Self {
            ds_display: display,
            ds_conn: conn,
            ds_crtc: crtc,
            ds_mode: mode,
            ds_properties: DisplaySurfaceProperties {
                dp_extent: vk::Extent2D {
                    width: width as u32,
                    height: height as u32,
                },
            },
        })
    }
}

impl Surface for DisplaySurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.ds_properties
    }

    fn create_swapchain(
        &self,
        dev: Arc<Device>,
        info: SwapchainCreateInfo,
        allocator: ObjectAllocator,
        old_swapchain: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        let presenter = Box::new(DisplayPresenter {
            dp_dev: dev,
            dp_alloc: allocator.clone(),
            dp_display: self.ds_display.clone(),
            dp_conn: self.ds_conn.handle(),
            dp_crtc: self.ds_crtc.handle(),
            dp_mode: self.ds_mode,
            dp_modeset_done: AtomicBool::new(false),
            dp_event_lock: Mutex::new(()),
        });
        Swapchain::new(info, presenter, &self.ds_properties, allocator, old_swapchain)
    }
}

/// The prime-imported scanout buffer behind one image.
struct ImportedBuffer {
    ib_size: (u32, u32),
    ib_format: drm::buffer::DrmFourcc,
    ib_pitch: u32,
    ib_handle: drm::buffer::Handle,
}

impl drm::buffer::Buffer for ImportedBuffer {
    fn size(&self) -> (u32, u32) {
        self.ib_size
    }

    fn format(&self) -> drm::buffer::DrmFourcc {
        self.ib_format
    }

    fn pitch(&self) -> u32 {
        self.ib_pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.ib_handle
    }
}

/// Per-image state: exported memory, its DRM framebuffer, and the
/// sync fd present fence.
struct DisplayImageData {
    di_dev: Arc<Device>,
    di_alloc: ObjectAllocator,
    di_display: Arc<DrmDisplay>,
    di_memory: vk::DeviceMemory,
    di_fb: framebuffer::Handle,
    di_present_fence: SyncFdFenceSync,
}

impl ImageData for DisplayImageData {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DisplayImageData {
    fn drop(&mut self) {
        if self.di_display.destroy_framebuffer(self.di_fb).is_err() {
            log::error!("Failed to destroy DRM framebuffer");
        }
        unsafe {
            self.di_dev
                .dev
                .free_memory(self.di_memory, self.di_alloc.callbacks());
        }
    }
}

fn image_data(image: &SwapchainImage) -> Result<&DisplayImageData> {
    image
        .data
        .as_deref()
        .and_then(|data| data.as_any().downcast_ref::<DisplayImageData>())
        .ok_or(StratusError::INVALID)
}

fn drm_format_for(format: vk::Format) -> Result<drm::buffer::DrmFourcc> {
    match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
            Ok(drm::buffer::DrmFourcc::Xrgb8888)
        }
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => {
            Ok(drm::buffer::DrmFourcc::Xbgr8888)
        }
        _ => {
            log::error!("No DRM fourcc for format {:?}", format);
            Err(StratusError::INITIALIZATION_FAILED)
        }
    }
}

pub struct DisplayPresenter {
    dp_dev: Arc<Device>,
    dp_alloc: ObjectAllocator,
    dp_display: Arc<DrmDisplay>,
    dp_conn: connector::Handle,
    dp_crtc: crtc::Handle,
    dp_mode: Mode,
    /// The first present sets the mode; the rest page flip
    dp_modeset_done: AtomicBool,
    /// Only one thread may drain DRM events at a time
    dp_event_lock: Mutex<()>,
}

impl DisplayPresenter {
    /// Block until the kernel delivers our page flip event.
    fn wait_for_page_flip(&self) -> Result<()> {
        let _event_guard = self.dp_event_lock.lock().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(self.dp_display.as_fd().as_raw_fd());

        loop {
            match watch.wait_readable(Some(1_000_000_000)) {
                Ok(true) => {}
                Ok(false) => {
                    log::error!("timed out waiting for page flip, retrying");
                    continue;
                }
                Err(e) => {
                    log::error!("could not wait on the DRM fd: {:?}", e);
                    return Err(StratusError::SURFACE_LOST);
                }
            }

            let events = self.dp_display.receive_events().map_err(|e| {
                log::error!("Failed to get DRM events: {}", e);
                StratusError::SURFACE_LOST
            })?;

            for ev in events {
                if let control::Event::PageFlip(flip) = ev {
                    if flip.crtc == self.dp_crtc {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Presenter for DisplayPresenter {
    fn init(&self, _info: &SwapchainCreateInfo, _hooks: SwapchainHooks) -> Result<bool> {
        // FIFO paced by real flips always wants the flip thread
        Ok(true)
    }

    fn create_image(&self, desc: &ImageCreateDesc) -> Result<vk::Image> {
        // Scanout buffers are linear so DRM and the display engine
        // agree on the layout without modifier negotiation
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let create_info = vk::ImageCreateInfo::builder()
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
            .tiling(vk::ImageTiling::LINEAR)
            .usage(desc.usage)
            .sharing_mode(desc.sharing_mode)
            .queue_family_indices(&desc.queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_info);

        unsafe {
            self.dp_dev
                .dev
                .create_image(&create_info, self.dp_alloc.callbacks())
                .map_err(StratusError::from)
        }
    }

    fn allocate_and_bind(&self, desc: &ImageCreateDesc, image: &mut SwapchainImage) -> Result<()> {
        let dev = &self.dp_dev;
        if !dev.features().external_memory_fd {
            log::error!("display backend requires external memory fd support");
            return Err(StratusError::INITIALIZATION_FAILED);
        }
        let fourcc = drm_format_for(desc.format)?;

        let requirements = unsafe { dev.dev.get_image_memory_requirements(image.handle) };
        let mem_type = dev
            .find_memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| dev.find_first_memory_type(requirements.memory_type_bits))
            .ok_or(StratusError::OUT_OF_DEVICE_MEMORY)?;

        let mut export_info = vk::ExportMemoryAllocateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mem_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type)
            .push_next(&mut export_info);

        let memory = unsafe {
            dev.dev
                .allocate_memory(&mem_info, self.dp_alloc.callbacks())
                .map_err(StratusError::from)?
        };

        // Everything below must unwind to here on failure
        let cleanup = |memory: vk::DeviceMemory| unsafe {
            dev.dev.free_memory(memory, self.dp_alloc.callbacks());
        };

        if let Err(e) = unsafe { dev.dev.bind_image_memory(image.handle, memory, 0) } {
            cleanup(memory);
            return Err(e.into());
        }

        let layout = unsafe {
            dev.dev.get_image_subresource_layout(
                image.handle,
                vk::ImageSubresource {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    array_layer: 0,
                },
            )
        };

        // Hand the memory to DRM: export a dma-buf, prime import it,
        // and wrap it in a framebuffer for scanout
        let get_fd_info = vk::MemoryGetFdInfoKHR::builder()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let raw_fd = match unsafe { dev.d_ext_memory_fd.get_memory_fd(&get_fd_info) } {
            Ok(fd) => fd,
            Err(e) => {
                cleanup(memory);
                return Err(e.into());
            }
        };
        let dma_fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let buffer_handle = match self.dp_display.prime_fd_to_buffer(dma_fd.as_fd()) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to prime import swapchain buffer: {}", e);
                cleanup(memory);
                return Err(StratusError::SURFACE_LOST);
            }
        };

        let buffer = ImportedBuffer {
            ib_size: (desc.extent.width, desc.extent.height),
            ib_format: fourcc,
            ib_pitch: layout.row_pitch as u32,
            ib_handle: buffer_handle,
        };

        let fb = match self.dp_display.add_framebuffer(&buffer, 24, 32) {
            Ok(fb) => fb,
            Err(e) => {
                log::error!("Failed to create DRM framebuffer: {}", e);
                cleanup(memory);
                return Err(StratusError::SURFACE_LOST);
            }
        };

        let present_fence = match SyncFdFenceSync::new(dev.clone(), &self.dp_alloc) {
            Ok(fence) => fence,
            Err(e) => {
                let _ = self.dp_display.destroy_framebuffer(fb);
                cleanup(memory);
                return Err(e);
            }
        };

        image.data = Some(Arc::new(DisplayImageData {
            di_dev: dev.clone(),
            di_alloc: self.dp_alloc.clone(),
            di_display: self.dp_display.clone(),
            di_memory: memory,
            di_fb: fb,
            di_present_fence: present_fence,
        }));

        Ok(())
    }

    fn present_image(
        &self,
        _request: &PendingPresent,
        image: &SwapchainImage,
    ) -> Result<PresentOutcome> {
        let data = image_data(image)?;

        if !self.dp_modeset_done.load(Ordering::Acquire) {
            // Now we can set the mode of the new swapchain
            self.dp_display
                .set_crtc(
                    self.dp_crtc,
                    Some(data.di_fb),
                    (0, 0),
                    &[self.dp_conn],
                    Some(self.dp_mode),
                )
                .map_err(|e| {
                    log::error!("drm set_crtc failed: {}", e);
                    StratusError::SURFACE_LOST
                })?;
            self.dp_modeset_done.store(true, Ordering::Release);
        } else {
            self.dp_display
                .page_flip(self.dp_crtc, data.di_fb, PageFlipFlags::EVENT, None)
                .map_err(|e| {
                    log::error!("drm page_flip failed: {}", e);
                    StratusError::SURFACE_LOST
                })?;

            self.wait_for_page_flip()?;
        }

        // The new image holds the plane until the next flip
        Ok(PresentOutcome::OnScreen)
    }

    fn destroy_image(&self, image: &mut SwapchainImage) {
        if image.handle != vk::Image::null() {
            unsafe {
                self.dp_dev
                    .dev
                    .destroy_image(image.handle, self.dp_alloc.callbacks());
            }
            image.handle = vk::Image::null();
        }

        // Framebuffer and memory go with the last reference
        image.data = None;
    }

    fn set_present_payload(
        &self,
        image: &SwapchainImage,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        _boundary: Option<&FrameBoundaryInfo>,
    ) -> Result<()> {
        image_data(image)?
            .di_present_fence
            .set_payload(queue, semaphores)
    }

    fn wait_present(&self, image: &SwapchainImage, timeout_ns: u64) -> Result<()> {
        image_data(image)?.di_present_fence.wait_payload(timeout_ns)
    }

    fn bind_swapchain_image(
        &self,
        image: vk::Image,
        swapchain_image: &SwapchainImage,
    ) -> Result<()> {
        let data = image_data(swapchain_image)?;
        unsafe {
            self.dp_dev
                .dev
                .bind_image_memory(image, data.di_memory, 0)
                .map_err(StratusError::from)
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.dp_dev
                .dev
                .create_semaphore(&vk::SemaphoreCreateInfo::builder(), self.dp_alloc.callbacks())
                .map_err(StratusError::from)
        }
    }

    fn destroy_semaphore(&self, sem: vk::Semaphore) {
        unsafe {
            self.dp_dev
                .dev
                .destroy_semaphore(sem, self.dp_alloc.callbacks());
        }
    }

    fn signal_acquire(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<()> {
        sync::signal_acquire_sync_objects(&self.dp_dev, semaphore, fence)
    }

    fn sync_queue_submit(
        &self,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        fence: vk::Fence,
    ) -> Result<()> {
        sync::queue_signal_submit(&self.dp_dev, queue, semaphores, fence)
    }

    fn queue_wait_idle(&self) -> Result<()> {
        self.dp_dev.with_internal_queue(|queue| unsafe {
            self.dp_dev
                .dev
                .queue_wait_idle(queue)
                .map_err(StratusError::from)
        })
    }
}
