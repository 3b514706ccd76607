// The swapchain engine
//
// This is the state machine every backend plugs into: a fixed pool
// of presentable images, the producer/consumer handoff between the
// application's threads and the page flip thread, and the lifecycle
// coordination between a swapchain and the one that replaces it.
// Backends only ever see the Presenter contract; everything in this
// file is backend agnostic.
//
// Austin Shafer - 2025
use ash::vk;
use parking_lot::ReentrantMutex;

use crate::allocator::ObjectAllocator;
use crate::extensions::compression::{CompressionControl, CompressionControlExt};
use crate::extensions::frame_boundary::FrameBoundary;
use crate::extensions::maintenance::Maintenance1;
use crate::extensions::present_id::PresentId;
#[cfg(feature = "present-timing")]
use crate::extensions::present_timing::{
    MonotonicTimeDomain, PresentStageFlags, PresentTiming, PresentationEntry, TimeDomainId,
    TimeDomains, VulkanTimeDomain,
};
use crate::extensions::ExtensionRegistry;
use crate::presenter::{PresentOutcome, Presenter};
use crate::surface::{ScalingCreateInfo, SurfaceProperties, MAX_SWAPCHAIN_IMAGE_COUNT};
use crate::sync::QueueSubmitSemaphores;
use crate::{ImageData, Result, StratusError};
use utils::log;
use utils::ring_buffer::RingBuffer;
use utils::timed_semaphore::TimedSemaphore;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// How long the page flip thread sleeps on its semaphore before
/// rechecking the run flag.
const PAGE_FLIP_SEMAPHORE_TIMEOUT: u64 = 250_000_000; // 250 ms
/// Bound for one payload wait attempt.
const WAIT_PRESENT_TIMEOUT: u64 = 1_000_000_000; // 1 s

/// Where an image is in its life.
///
/// The only legal walks are:
///   Invalid -> (create) -> Unallocated | Free
///   Unallocated -> Free (first acquire realizes the memory)
///   Free -> Acquired -> Pending -> Free | Presented
///   Presented -> Free (the next flip replaces it on screen)
///   anything -> Invalid (destroy/deprecate)
/// Shared present modes skip Pending: the image bounces back to
/// Acquired since the application never gives up ownership.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ImageStatus {
    #[default]
    Invalid,
    /// Created, but memory arrives on first acquire
    Unallocated,
    Free,
    Acquired,
    Pending,
    /// On scanout right now (backends with OnScreen semantics)
    Presented,
}

/// One presentable image.
#[derive(Clone, Default)]
pub struct SwapchainImage {
    pub handle: vk::Image,
    pub status: ImageStatus,
    /// Signaled by the application's present submission; the payload
    /// waits on it when the present uses the internal semaphore.
    pub present_semaphore: vk::Semaphore,
    /// Bridge between the present payload and an application
    /// supplied present fence.
    pub present_fence_wait: vk::Semaphore,
    /// Presenter owned block: memory, prime handles, present fence.
    /// The swapchain is the sole logical owner; the Arc lets payload
    /// waits run outside the image status lock.
    pub data: Option<Arc<dyn ImageData>>,
}

/// What gets queued for the page flip thread.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPresent {
    pub image_index: u32,
    /// 0 means the application did not tag this present
    pub present_id: u64,
}

/// The template every image of a swapchain is created from.
///
/// Owned and cloned, never borrowed across calls, so the deferred
/// allocation path years after creation sees exactly what the eager
/// path saw.
#[derive(Clone, Debug)]
pub struct ImageCreateDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub tiling: vk::ImageTiling,
    pub compression: Option<CompressionControl>,
}

/// Parameters for swapchain creation.
///
/// Use the builder; the spread of options is large and almost all of
/// them have a sane default.
#[derive(Clone)]
pub struct SwapchainCreateInfo {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub present_mode: vk::PresentModeKHR,
    /// Defer image memory allocation until first acquire
    pub deferred_allocation: bool,
    /// The present modes this swapchain may switch between at
    /// present time (swapchain maintenance)
    pub compatible_present_modes: Vec<vk::PresentModeKHR>,
    pub scaling: Option<ScalingCreateInfo>,
    pub compression: Option<CompressionControl>,
    pub enable_present_id: bool,
    pub enable_swapchain_maintenance: bool,
    pub enable_frame_boundary: bool,
    pub enable_present_timing: bool,
}

impl SwapchainCreateInfo {
    pub fn builder() -> SwapchainCreateInfoBuilder {
        SwapchainCreateInfoBuilder {
            ci: SwapchainCreateInfo {
                min_image_count: 3,
                format: vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                extent: vk::Extent2D {
                    width: 640,
                    height: 480,
                },
                array_layers: 1,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                queue_family_indices: Vec::new(),
                present_mode: vk::PresentModeKHR::FIFO,
                deferred_allocation: false,
                compatible_present_modes: Vec::new(),
                scaling: None,
                compression: None,
                enable_present_id: true,
                enable_swapchain_maintenance: true,
                enable_frame_boundary: false,
                enable_present_timing: false,
            },
        }
    }
}

/// Implements the builder pattern for easier create info construction
pub struct SwapchainCreateInfoBuilder {
    ci: SwapchainCreateInfo,
}

impl SwapchainCreateInfoBuilder {
    pub fn min_image_count(mut self, count: u32) -> Self {
        self.ci.min_image_count = count;
        self
    }

    pub fn format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.ci.format = format;
        self
    }

    pub fn extent(mut self, extent: vk::Extent2D) -> Self {
        self.ci.extent = extent;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.ci.usage = usage;
        self
    }

    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.ci.present_mode = mode;
        self
    }

    pub fn deferred_allocation(mut self, deferred: bool) -> Self {
        self.ci.deferred_allocation = deferred;
        self
    }

    pub fn compatible_present_modes(mut self, modes: Vec<vk::PresentModeKHR>) -> Self {
        self.ci.compatible_present_modes = modes;
        self
    }

    pub fn scaling(mut self, scaling: ScalingCreateInfo) -> Self {
        self.ci.scaling = Some(scaling);
        self
    }

    pub fn compression(mut self, compression: CompressionControl) -> Self {
        self.ci.compression = Some(compression);
        self
    }

    pub fn enable_present_id(mut self, enable: bool) -> Self {
        self.ci.enable_present_id = enable;
        self
    }

    pub fn enable_swapchain_maintenance(mut self, enable: bool) -> Self {
        self.ci.enable_swapchain_maintenance = enable;
        self
    }

    pub fn enable_frame_boundary(mut self, enable: bool) -> Self {
        self.ci.enable_frame_boundary = enable;
        self
    }

    pub fn enable_present_timing(mut self, enable: bool) -> Self {
        self.ci.enable_present_timing = enable;
        self
    }

    pub fn build(self) -> SwapchainCreateInfo {
        self.ci
    }
}

/// Parameters for one queue present call.
#[derive(Clone)]
pub struct PresentParams {
    pub image_index: u32,
    /// 0 means untagged
    pub present_id: u64,
    /// Fence to signal once the present payload completes, null for
    /// none
    pub present_fence: vk::Fence,
    pub switch_present_mode: Option<vk::PresentModeKHR>,
    /// Only observed when `use_image_present_semaphore` is false
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Wait on the image's internal present semaphore instead of the
    /// caller supplied ones
    pub use_image_present_semaphore: bool,
    pub handle_frame_boundary: bool,
}

impl PresentParams {
    pub fn new(image_index: u32) -> Self {
        Self {
            image_index,
            present_id: 0,
            present_fence: vk::Fence::null(),
            switch_present_mode: None,
            wait_semaphores: Vec::new(),
            use_image_present_semaphore: true,
            handle_frame_boundary: true,
        }
    }
}

/// Sticky error slot. Starts not-ready, becomes operational after
/// init, and latches the first fatal error forever after.
enum ErrorState {
    NotReady,
    Operational,
    Failed(StratusError),
}

/// Everything the image status mutex protects: the pool itself and
/// the ring of presents queued for the flip thread. The two pointers
/// of the ring are touched by different threads, but always under
/// this lock, and the application can never queue more presents than
/// there are images.
struct SwapchainState {
    images: Vec<SwapchainImage>,
    pending_buffer_pool: RingBuffer<PendingPresent, MAX_SWAPCHAIN_IMAGE_COUNT>,
}

/// The part of a swapchain shared with its page flip thread and,
/// weakly, with its ancestor/descendant across a recreate.
pub(crate) struct Shared {
    sc_presenter: Box<dyn Presenter>,
    /// Guards image statuses and any code path that relies on them.
    /// Re-entrant because destroy_image both changes a status and is
    /// called conditionally on one, sometimes with the lock already
    /// held by the same thread.
    sc_image_status: ReentrantMutex<RefCell<SwapchainState>>,
    /// Serializes acquire calls
    sc_acquire_lock: Mutex<()>,
    /// Posted once per image that becomes FREE. The only cross
    /// thread notification for image availability.
    sc_free_image_sem: TimedSemaphore,
    /// Posted once per pending present handed to the flip thread
    sc_page_flip_sem: TimedSemaphore,
    /// Posted exactly once, on this swapchain's first present
    sc_start_present_sem: TimedSemaphore,
    sc_run: AtomicBool,
    sc_use_flip_thread: AtomicBool,
    sc_first_present: AtomicBool,
    sc_started_presenting: AtomicBool,
    sc_error_state: Mutex<ErrorState>,
    sc_present_mode: Mutex<vk::PresentModeKHR>,
    sc_image_create_desc: Mutex<ImageCreateDesc>,
    sc_extensions: ExtensionRegistry,
    /// Weak on purpose: the application owns both swapchains across
    /// a recreate, never each other.
    sc_ancestor: Mutex<Option<Weak<Shared>>>,
    sc_descendant: Mutex<Option<Weak<Shared>>>,
}

/// Handle backends use to reach back into the engine from their own
/// threads: marking images free when the windowing system reports
/// them released, and latching fatal errors.
#[derive(Clone)]
pub struct SwapchainHooks {
    hk_shared: Weak<Shared>,
}

impl SwapchainHooks {
    /// Release an image the backend observed the presentation engine
    /// is done with.
    pub fn unpresent(&self, image_index: u32) {
        if let Some(shared) = self.hk_shared.upgrade() {
            shared.unpresent_image(image_index as usize);
        }
    }

    /// Latch a fatal backend error. The next acquire returns it.
    pub fn set_error(&self, err: StratusError) {
        if let Some(shared) = self.hk_shared.upgrade() {
            shared.set_error_state(err);
            // Wake up anything blocked on a free image
            shared.sc_free_image_sem.post();
        }
    }
}

/// A swapchain: the engine driving one backend presenter.
pub struct Swapchain {
    sc_shared: Arc<Shared>,
    sc_flip_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Swapchain {
    /// Create a swapchain and materialize its images.
    ///
    /// `properties` is the surface the swapchain presents to;
    /// creation parameters are validated against it. Passing the
    /// swapchain being replaced as `old_swapchain` wires up the
    /// ancestor/descendant handoff and deprecates the old one.
    pub fn new(
        info: SwapchainCreateInfo,
        presenter: Box<dyn Presenter>,
        properties: &dyn SurfaceProperties,
        allocator: ObjectAllocator,
        old_swapchain: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        Self::validate_create_info(&info, properties)?;

        let extensions = Self::build_extensions(&info, properties)?;

        let image_create_desc = ImageCreateDesc {
            format: info.format.format,
            extent: info.extent,
            array_layers: info.array_layers,
            usage: info.usage,
            sharing_mode: info.sharing_mode,
            queue_family_indices: info.queue_family_indices.clone(),
            tiling: vk::ImageTiling::OPTIMAL,
            compression: info.compression.clone(),
        };

        let image_count = info.min_image_count as usize;
        let images = allocator.try_alloc_vec::<SwapchainImage>(image_count)?;

        let shared = Arc::new(Shared {
            sc_presenter: presenter,
            sc_image_status: ReentrantMutex::new(RefCell::new(SwapchainState {
                images,
                pending_buffer_pool: RingBuffer::new(),
            })),
            sc_acquire_lock: Mutex::new(()),
            sc_free_image_sem: TimedSemaphore::new(image_count as u64),
            sc_page_flip_sem: TimedSemaphore::new(0),
            sc_start_present_sem: TimedSemaphore::new(0),
            sc_run: AtomicBool::new(false),
            sc_use_flip_thread: AtomicBool::new(false),
            sc_first_present: AtomicBool::new(true),
            sc_started_presenting: AtomicBool::new(false),
            sc_error_state: Mutex::new(ErrorState::NotReady),
            sc_present_mode: Mutex::new(info.present_mode),
            sc_image_create_desc: Mutex::new(image_create_desc),
            sc_extensions: extensions,
            sc_ancestor: Mutex::new(None),
            sc_descendant: Mutex::new(None),
        });

        let hooks = SwapchainHooks {
            hk_shared: Arc::downgrade(&shared),
        };
        let use_flip_thread = shared.sc_presenter.init(&info, hooks)?;
        shared
            .sc_use_flip_thread
            .store(use_flip_thread, Ordering::Release);

        if let Err(e) = shared.create_images(&info) {
            shared.destroy_resources();
            return Err(e);
        }

        let flip_thread = if use_flip_thread {
            shared.sc_run.store(true, Ordering::Release);
            let thread_shared = shared.clone();
            let handle = thread::Builder::new()
                .name("stratus-page-flip".to_string())
                .spawn(move || thread_shared.page_flip_thread())
                .map_err(|_| {
                    shared.sc_run.store(false, Ordering::Release);
                    shared.destroy_resources();
                    StratusError::INITIALIZATION_FAILED
                })?;
            Some(handle)
        } else {
            None
        };

        let swapchain = Swapchain {
            sc_shared: shared,
            sc_flip_thread: Mutex::new(flip_thread),
        };

        // Deprecating the ancestor must be the last step of
        // initialization, when the rest of the swapchain is valid.
        // The old swapchain frees its FREE images eagerly, which
        // matters on platforms with limited display memory.
        if let Some(old) = old_swapchain {
            *swapchain.sc_shared.sc_ancestor.lock().unwrap() =
                Some(Arc::downgrade(&old.sc_shared));
            old.sc_shared
                .deprecate(Arc::downgrade(&swapchain.sc_shared));
        }

        swapchain.sc_shared.set_operational();
        Ok(swapchain)
    }

    fn validate_create_info(
        info: &SwapchainCreateInfo,
        properties: &dyn SurfaceProperties,
    ) -> Result<()> {
        let caps = properties.get_surface_capabilities()?;

        if info.min_image_count < caps.min_image_count
            || (caps.max_image_count != 0 && info.min_image_count > caps.max_image_count)
            || info.min_image_count as usize > MAX_SWAPCHAIN_IMAGE_COUNT
            || info.min_image_count == 0
        {
            log::error!("unsupported image count {}", info.min_image_count);
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        if !properties
            .get_present_modes()
            .contains(&info.present_mode)
        {
            log::error!(
                "present mode {:?} is not offered by this surface",
                info.present_mode
            );
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        let formats = properties.get_surface_formats()?;
        if !formats
            .iter()
            .any(|f| f.format == info.format.format && f.color_space == info.format.color_space)
        {
            log::error!("unsupported surface format {:?}", info.format);
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        Ok(())
    }

    fn build_extensions(
        info: &SwapchainCreateInfo,
        properties: &dyn SurfaceProperties,
    ) -> Result<ExtensionRegistry> {
        let mut extensions = ExtensionRegistry::new();

        if info.enable_swapchain_maintenance {
            let maintenance = Maintenance1::new();
            if !info.compatible_present_modes.is_empty() {
                maintenance.handle_present_modes_create_info(
                    properties,
                    info.present_mode,
                    &info.compatible_present_modes,
                )?;
            }
            if let Some(scaling) = &info.scaling {
                maintenance.handle_scaling_create_info(properties, scaling)?;
            }
            extensions.add(Box::new(maintenance));
        } else if !info.compatible_present_modes.is_empty() || info.scaling.is_some() {
            // The application asked for maintenance features without
            // the extension
            return Err(StratusError::EXTENSION_MISSING);
        }

        if info.enable_present_id {
            extensions.add(Box::new(PresentId::new()));
        }

        if info.enable_frame_boundary {
            extensions.add(Box::new(FrameBoundary::new()));
        }

        if let Some(compression) = &info.compression {
            extensions.add(Box::new(CompressionControlExt::new(compression.clone())));
        }

        #[cfg(feature = "present-timing")]
        if info.enable_present_timing {
            let mut domains = TimeDomains::new();
            domains.add_time_domain(Box::new(VulkanTimeDomain::new(
                TimeDomainId::Device,
                PresentStageFlags::QUEUE_OPERATIONS_END,
            )));
            domains.add_time_domain(Box::new(MonotonicTimeDomain::new(
                PresentStageFlags::IMAGE_LATCHED | PresentStageFlags::IMAGE_FIRST_PIXEL_OUT,
            )));
            extensions.add(Box::new(PresentTiming::new(domains)));
        }
        #[cfg(not(feature = "present-timing"))]
        if info.enable_present_timing {
            return Err(StratusError::EXTENSION_MISSING);
        }

        Ok(extensions)
    }

    /// Block until a free image is available, transition it to
    /// ACQUIRED, and signal the caller's sync objects.
    ///
    /// `timeout_ns` of 0 probes, `u64::MAX` waits indefinitely.
    /// Returns the acquired image's index.
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<u32> {
        let shared = &self.sc_shared;
        let _acquire_guard = shared.sc_acquire_lock.lock().unwrap();

        shared.wait_for_free_buffer(timeout_ns)?;
        if let Some(err) = shared.error_state() {
            return Err(err);
        }

        let index = {
            let status_guard = shared.sc_image_status.lock();

            let candidate = {
                let state = status_guard.borrow();
                state.images.iter().position(|img| {
                    img.status == ImageStatus::Free || img.status == ImageStatus::Unallocated
                })
            };

            let Some(index) = candidate else {
                // A free image token with no free image should be
                // impossible
                log::error!("woke for a free image but none is available");
                return Err(StratusError::INVALID);
            };

            // Deferred images become real on first acquire. Failure
            // hands the free image token back and leaves the image
            // unallocated so a later acquire can retry.
            let needs_allocation =
                status_guard.borrow().images[index].status == ImageStatus::Unallocated;
            if needs_allocation {
                let desc = shared.sc_image_create_desc.lock().unwrap().clone();
                let res = {
                    let mut state = status_guard.borrow_mut();
                    shared
                        .sc_presenter
                        .allocate_and_bind(&desc, &mut state.images[index])
                };
                if let Err(e) = res {
                    log::error!("failed to allocate swapchain image: {:?}", e);
                    shared.sc_free_image_sem.post();
                    return Err(match e {
                        StratusError::OUT_OF_DEVICE_MEMORY => StratusError::OUT_OF_DEVICE_MEMORY,
                        _ => StratusError::OUT_OF_HOST_MEMORY,
                    });
                }
            }

            status_guard.borrow_mut().images[index].status = ImageStatus::Acquired;
            index
        };

        shared.sc_presenter.signal_acquire(semaphore, fence)?;

        Ok(index as u32)
    }

    /// Submit an image for presentation.
    ///
    /// Installs the present payload, chains the application's present
    /// fence if one was supplied, and notifies the presentation
    /// engine. Returns OUT_OF_DATE once a replacement swapchain has
    /// started presenting.
    pub fn queue_present(&self, queue: vk::Queue, params: &PresentParams) -> Result<()> {
        let shared = &self.sc_shared;

        #[cfg(feature = "present-timing")]
        if let Some(timing) = shared.sc_extensions.get::<PresentTiming>() {
            timing.add_presentation_entry(PresentationEntry {
                is_outstanding: true,
                present_id: params.present_id,
            })?;
        }

        if let Some(new_mode) = params.switch_present_mode {
            let maintenance = shared
                .sc_extensions
                .get::<Maintenance1>()
                .ok_or(StratusError::EXTENSION_MISSING)?;
            maintenance.handle_switching_presentation_mode(new_mode)?;
            *shared.sc_present_mode.lock().unwrap() = new_mode;
        }

        let image = shared.image_snapshot(params.image_index as usize)?;
        if image.status == ImageStatus::Invalid || image.status == ImageStatus::Unallocated {
            log::error!(
                "present of image {} which was never acquired",
                params.image_index
            );
            return Err(StratusError::INVALID);
        }

        // Without a flip thread the previous payload on this image
        // has nobody else to wait for it.
        if !shared.flip_thread_enabled() {
            shared
                .sc_presenter
                .wait_present(&image, WAIT_PRESENT_TIMEOUT)?;
        }

        let boundary = if params.handle_frame_boundary {
            shared
                .sc_extensions
                .get::<FrameBoundary>()
                .map(|ext| ext.next_frame_boundary(image.handle))
        } else {
            None
        };

        let wait_semaphores: Vec<vk::Semaphore> = if params.use_image_present_semaphore {
            vec![image.present_semaphore]
        } else {
            params.wait_semaphores.clone()
        };
        let signal_semaphores: Vec<vk::Semaphore> = if params.present_fence != vk::Fence::null() {
            vec![image.present_fence_wait]
        } else {
            Vec::new()
        };

        shared.sc_presenter.set_present_payload(
            &image,
            queue,
            &QueueSubmitSemaphores {
                wait: &wait_semaphores,
                signal: &signal_semaphores,
            },
            boundary.as_ref(),
        )?;

        if params.present_fence != vk::Fence::null() {
            // Chain the caller's fence behind the payload through
            // present_fence_wait
            shared.sc_presenter.sync_queue_submit(
                queue,
                &QueueSubmitSemaphores {
                    wait: &[image.present_fence_wait],
                    signal: &[],
                },
                params.present_fence,
            )?;
        }

        shared.notify_presentation_engine(PendingPresent {
            image_index: params.image_index,
            present_id: params.present_id,
        })
    }

    /// The sticky swapchain status: Ok while healthy, the latched
    /// error after a fatal backend failure.
    pub fn get_swapchain_status(&self) -> Result<()> {
        match self.sc_shared.error_state() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// All image handles, in index order.
    pub fn images(&self) -> Vec<vk::Image> {
        let guard = self.sc_shared.sc_image_status.lock();
        let state = guard.borrow();
        state.images.iter().map(|img| img.handle).collect()
    }

    pub fn image_count(&self) -> u32 {
        let guard = self.sc_shared.sc_image_status.lock();
        let count = guard.borrow().images.len();
        count as u32
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        *self.sc_shared.sc_present_mode.lock().unwrap()
    }

    /// The extension set this swapchain was created with.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.sc_shared.sc_extensions
    }

    /// Hand ACQUIRED images back without presenting them
    /// (swapchain maintenance release).
    pub fn release_images(&self, indices: &[u32]) -> Result<()> {
        for &index in indices {
            let image = self.sc_shared.image_snapshot(index as usize)?;
            // Applications can only release images they own
            if image.status != ImageStatus::Acquired {
                return Err(StratusError::INVALID);
            }
            self.sc_shared.unpresent_image(index as usize);
        }

        Ok(())
    }

    /// Create an image handle an application can bind to swapchain
    /// memory, from the same template as the swapchain's own images.
    pub fn create_aliased_image_handle(&self) -> Result<vk::Image> {
        let desc = self.sc_shared.sc_image_create_desc.lock().unwrap().clone();
        self.sc_shared.sc_presenter.create_image(&desc)
    }

    /// Whether binding against image `index` is possible right now.
    /// Unallocated images have no memory to bind against yet.
    pub fn is_bind_allowed(&self, index: u32) -> Result<()> {
        let image = self.sc_shared.image_snapshot(index as usize)?;
        match image.status {
            ImageStatus::Unallocated => Err(StratusError::OUT_OF_HOST_MEMORY),
            _ => Ok(()),
        }
    }

    /// Bind an application created alias to image `index`'s memory.
    pub fn bind_swapchain_image(&self, image: vk::Image, index: u32) -> Result<()> {
        self.is_bind_allowed(index)?;
        let swapchain_image = self.sc_shared.image_snapshot(index as usize)?;
        self.sc_shared
            .sc_presenter
            .bind_swapchain_image(image, &swapchain_image)
    }

    /// Test observers
    #[cfg(test)]
    pub(crate) fn image_statuses(&self) -> Vec<ImageStatus> {
        let guard = self.sc_shared.sc_image_status.lock();
        let statuses = guard.borrow().images.iter().map(|i| i.status).collect();
        statuses
    }

    #[cfg(test)]
    pub(crate) fn free_image_sem_count(&self) -> u64 {
        self.sc_shared.sc_free_image_sem.count()
    }

    #[cfg(test)]
    pub(crate) fn started_presenting(&self) -> bool {
        self.sc_shared.sc_started_presenting.load(Ordering::Acquire)
    }

    fn teardown(&mut self) {
        let shared = &self.sc_shared;

        // Block until everything issued from this swapchain is out
        // of the presentation engine's hands. If a descendant took
        // over, its first present already drained us; wait for that
        // signal instead of our own buffers.
        if shared.has_descendant_started_presenting() {
            let descendant = shared.sc_descendant.lock().unwrap().clone();
            if let Some(desc) = descendant.and_then(|weak| weak.upgrade()) {
                desc.sc_start_present_sem.wait(u64::MAX);
            }
        } else if shared.error_state().is_none() {
            shared.wait_for_pending_buffers();
        }

        if let Err(e) = shared.sc_presenter.queue_wait_idle() {
            log::error!("queue_wait_idle failed during teardown: {:?}", e);
        }

        shared.sc_run.store(false, Ordering::Release);
        if let Some(handle) = self.sc_flip_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("page flip thread panicked");
            }
        }

        // Untangle the recreate chain
        let descendant = shared.sc_descendant.lock().unwrap().clone();
        if let Some(desc) = descendant.and_then(|weak| weak.upgrade()) {
            desc.clear_ancestor();
        }
        let ancestor = shared.sc_ancestor.lock().unwrap().clone();
        if let Some(anc) = ancestor.and_then(|weak| weak.upgrade()) {
            anc.clear_descendant();
        }

        shared.destroy_resources();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Shared {
    /// Create every image of the pool from the template descriptor,
    /// along with its two signaling semaphores. With deferred
    /// allocation the memory is left for the first acquire.
    fn create_images(&self, info: &SwapchainCreateInfo) -> Result<()> {
        let desc = self.sc_image_create_desc.lock().unwrap().clone();
        let image_count = {
            let guard = self.sc_image_status.lock();
            let len = guard.borrow().images.len();
            len
        };

        for i in 0..image_count {
            let handle = self.sc_presenter.create_image(&desc)?;
            let present_semaphore = self.sc_presenter.create_semaphore()?;
            let present_fence_wait = self.sc_presenter.create_semaphore()?;

            {
                let guard = self.sc_image_status.lock();
                let mut state = guard.borrow_mut();
                let image = &mut state.images[i];
                image.handle = handle;
                image.present_semaphore = present_semaphore;
                image.present_fence_wait = present_fence_wait;
                image.status = ImageStatus::Unallocated;
            }

            if !info.deferred_allocation {
                let guard = self.sc_image_status.lock();
                let mut state = guard.borrow_mut();
                self.sc_presenter
                    .allocate_and_bind(&desc, &mut state.images[i])?;
                state.images[i].status = ImageStatus::Free;
            }
        }

        Ok(())
    }

    /// The page flip thread.
    ///
    /// Waits for presents queued by the application, waits for their
    /// rendering to finish, and feeds them to the presenter oldest
    /// first. Three cases matter: the first present of a swapchain
    /// with an ancestor has to wait for the ancestor to drain; the
    /// normal FIFO case pops the oldest pending image; and in shared
    /// continuous mode only the very first cycle waits, after which
    /// image 0 is re-presented forever.
    fn page_flip_thread(self: Arc<Self>) {
        while self.sc_run.load(Ordering::Acquire) {
            let mode = *self.sc_present_mode.lock().unwrap();
            let shared_continuous = mode == vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH;

            let request = if shared_continuous {
                // One presentation request ever; afterwards the
                // single image is re-presented without waiting.
                if self.sc_first_present.load(Ordering::Acquire)
                    && !self.sc_page_flip_sem.wait(PAGE_FLIP_SEMAPHORE_TIMEOUT)
                {
                    continue;
                }
                PendingPresent {
                    image_index: 0,
                    present_id: 0,
                }
            } else {
                if !self.sc_page_flip_sem.wait(PAGE_FLIP_SEMAPHORE_TIMEOUT) {
                    continue;
                }

                let popped = {
                    let guard = self.sc_image_status.lock();
                    let mut state = guard.borrow_mut();
                    state.pending_buffer_pool.pop_front()
                };
                match popped {
                    Some(req) => req,
                    None => continue,
                }
            };

            let Ok(image) = self.image_snapshot(request.image_index as usize) else {
                continue;
            };

            // A descendant may have started presenting between the
            // enqueue and now, releasing this image already.
            if !shared_continuous && image.status != ImageStatus::Pending {
                continue;
            }

            // The present payload is the rendering that produced
            // this image; nothing goes on screen before it is done.
            let mut wait_result = Ok(());
            while self.sc_run.load(Ordering::Acquire) {
                match self.sc_presenter.wait_present(&image, WAIT_PRESENT_TIMEOUT) {
                    Ok(()) => break,
                    Err(StratusError::TIMEOUT) => {
                        log::error!("timeout waiting for image's present fences, retrying..");
                    }
                    Err(e) => {
                        wait_result = Err(e);
                        break;
                    }
                }
            }
            if let Err(e) = wait_result {
                self.set_error_state(e);
                self.sc_free_image_sem.post();
                continue;
            }

            self.call_present(&request);
        }
    }

    /// Present one image, handling the ancestor handshake on the
    /// first present of this swapchain.
    fn call_present(&self, request: &PendingPresent) {
        if self.sc_first_present.load(Ordering::Acquire) {
            let ancestor = self.sc_ancestor.lock().unwrap().clone();
            if let Some(anc) = ancestor.and_then(|weak| weak.upgrade()) {
                anc.wait_for_pending_buffers();
            }

            // Once, ever: lets our own ancestor tear down, and our
            // eventual descendant unblock the same way.
            self.sc_start_present_sem.post();
        }

        let Ok(image) = self.image_snapshot(request.image_index as usize) else {
            return;
        };

        match self.sc_presenter.present_image(request, &image) {
            Ok(outcome) => {
                if let Some(present_id) = self.sc_extensions.get::<PresentId>() {
                    present_id.set_present_id(request.present_id);
                }

                match outcome {
                    PresentOutcome::Released => {
                        self.unpresent_image(request.image_index as usize);
                    }
                    PresentOutcome::OnScreen => {
                        // The new image holds the screen; the one it
                        // replaced is what gets released.
                        let previous = {
                            let guard = self.sc_image_status.lock();
                            let mut state = guard.borrow_mut();
                            let previous = state
                                .images
                                .iter()
                                .position(|img| img.status == ImageStatus::Presented);
                            state.images[request.image_index as usize].status =
                                ImageStatus::Presented;
                            previous
                        };
                        if let Some(prev) = previous {
                            self.unpresent_image(prev);
                        }
                    }
                }
            }
            Err(StratusError::SUBOPTIMAL) => {
                // Non fatal: the image made it to the screen, the
                // configuration has just drifted
                log::error!("present reported a suboptimal surface");
                self.unpresent_image(request.image_index as usize);
            }
            Err(e) => {
                log::error!("presenting failed: {:?}", e);
                self.set_error_state(e);
                self.sc_free_image_sem.post();
            }
        }

        self.sc_first_present.store(false, Ordering::Release);
    }

    /// Queue a present for the flip thread, or present synchronously
    /// when this mode runs without one.
    fn notify_presentation_engine(&self, request: PendingPresent) -> Result<()> {
        let guard = self.sc_image_status.lock();

        // If the descendant has started presenting the image should
        // be released, but without blocking the application's thread:
        // mark it free and let the flip thread clean up.
        if self.has_descendant_started_presenting() {
            guard.borrow_mut().images[request.image_index as usize].status = ImageStatus::Free;
            self.sc_free_image_sem.post();
            return Err(StratusError::OUT_OF_DATE);
        }

        let mode = *self.sc_present_mode.lock().unwrap();
        if mode == vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH
            && self.sc_started_presenting.load(Ordering::Acquire)
        {
            // The flip thread owns re-presentation of the single
            // shared image; nothing to queue.
            return Ok(());
        }

        guard.borrow_mut().images[request.image_index as usize].status = ImageStatus::Pending;
        self.sc_started_presenting.store(true, Ordering::Release);

        if self.flip_thread_enabled() {
            let pushed = guard.borrow_mut().pending_buffer_pool.push_back(request);
            debug_assert!(pushed, "pending present ring can never overfill");
            if !pushed {
                return Err(StratusError::INVALID);
            }
            self.sc_page_flip_sem.post();
        } else {
            self.call_present(&request);
        }

        Ok(())
    }

    /// Wait for a buffer to become free.
    ///
    /// First a non blocking probe, then a chance for the backend to
    /// observe externally released images, then the real wait with
    /// whatever timeout the backend left us.
    fn wait_for_free_buffer(&self, timeout_ns: u64) -> Result<()> {
        if self.sc_free_image_sem.wait(0) {
            return Ok(());
        }

        let mut timeout = timeout_ns;
        self.sc_presenter.get_free_buffer_hint(&mut timeout)?;

        if self.sc_free_image_sem.wait(timeout) {
            Ok(())
        } else {
            Err(StratusError::TIMEOUT)
        }
    }

    /// Transition a presented image back toward the application.
    /// Shared modes return it to ACQUIRED, everything else to FREE
    /// with a token on the free image semaphore.
    fn unpresent_image(&self, index: usize) {
        let mode = *self.sc_present_mode.lock().unwrap();
        let shared_mode = mode == vk::PresentModeKHR::SHARED_DEMAND_REFRESH
            || mode == vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH;

        {
            let guard = self.sc_image_status.lock();
            let mut state = guard.borrow_mut();
            if index >= state.images.len() {
                return;
            }
            state.images[index].status = if shared_mode {
                ImageStatus::Acquired
            } else {
                ImageStatus::Free
            };
        }

        if !shared_mode {
            self.sc_free_image_sem.post();
        }
    }

    /// Wait until every buffer this swapchain pushed at the
    /// presentation engine has come back.
    ///
    /// One pending image may be held by a compositor indefinitely
    /// and the backend cannot always tell which, hence the -1.
    fn wait_for_pending_buffers(&self) {
        let _acquire_guard = self.sc_acquire_lock.lock().unwrap();

        let wait = {
            let guard = self.sc_image_status.lock();
            let state = guard.borrow();
            let acquired = state
                .images
                .iter()
                .filter(|img| img.status == ImageStatus::Acquired)
                .count();
            state.images.len().saturating_sub(acquired + 1)
        };

        for _ in 0..wait {
            // Take down one free image token per outstanding buffer
            if let Err(e) = self.wait_for_free_buffer(u64::MAX) {
                log::error!("waiting for pending buffers failed: {:?}", e);
                return;
            }
        }
    }

    /// Deprecate this swapchain in favor of `descendant`.
    ///
    /// Every image currently FREE is destroyed on the spot; images
    /// still in flight are released by the page flip thread as they
    /// come back.
    fn deprecate(&self, descendant: Weak<Shared>) {
        let free_images: Vec<usize> = {
            let guard = self.sc_image_status.lock();
            let state = guard.borrow();
            state
                .images
                .iter()
                .enumerate()
                .filter(|(_, img)| img.status == ImageStatus::Free)
                .map(|(i, _)| i)
                .collect()
        };
        for index in free_images {
            self.destroy_image(index);
        }

        *self.sc_descendant.lock().unwrap() = Some(descendant);
    }

    /// Destroy one image's backend resources. Safe to call with the
    /// status lock held and on images already INVALID.
    fn destroy_image(&self, index: usize) {
        let guard = self.sc_image_status.lock();
        let mut state = guard.borrow_mut();
        let Some(image) = state.images.get_mut(index) else {
            return;
        };

        if image.status != ImageStatus::Invalid {
            self.sc_presenter.destroy_image(image);
            image.status = ImageStatus::Invalid;
        }
    }

    /// Release everything: backend data and per-image semaphores.
    /// Only called once nothing else can touch the images.
    fn destroy_resources(&self) {
        let image_count = {
            let guard = self.sc_image_status.lock();
            let len = guard.borrow().images.len();
            len
        };

        for i in 0..image_count {
            self.destroy_image(i);
        }

        let guard = self.sc_image_status.lock();
        let mut state = guard.borrow_mut();
        for image in state.images.iter_mut() {
            if image.present_semaphore != vk::Semaphore::null() {
                self.sc_presenter.destroy_semaphore(image.present_semaphore);
                image.present_semaphore = vk::Semaphore::null();
            }
            if image.present_fence_wait != vk::Semaphore::null() {
                self.sc_presenter
                    .destroy_semaphore(image.present_fence_wait);
                image.present_fence_wait = vk::Semaphore::null();
            }
        }
    }

    fn clear_ancestor(&self) {
        *self.sc_ancestor.lock().unwrap() = None;
    }

    fn clear_descendant(&self) {
        *self.sc_descendant.lock().unwrap() = None;
    }

    fn has_descendant_started_presenting(&self) -> bool {
        let descendant = self.sc_descendant.lock().unwrap().clone();
        match descendant.and_then(|weak| weak.upgrade()) {
            Some(desc) => desc.sc_started_presenting.load(Ordering::Acquire),
            None => false,
        }
    }

    fn flip_thread_enabled(&self) -> bool {
        self.sc_use_flip_thread.load(Ordering::Acquire) && self.sc_run.load(Ordering::Acquire)
    }

    fn image_snapshot(&self, index: usize) -> Result<SwapchainImage> {
        let guard = self.sc_image_status.lock();
        let state = guard.borrow();
        state
            .images
            .get(index)
            .cloned()
            .ok_or(StratusError::INVALID)
    }

    fn error_state(&self) -> Option<StratusError> {
        match *self.sc_error_state.lock().unwrap() {
            ErrorState::NotReady => Some(StratusError::NOT_READY),
            ErrorState::Operational => None,
            ErrorState::Failed(err) => Some(err),
        }
    }

    /// Latch an error. Only the first fatal error sticks.
    fn set_error_state(&self, err: StratusError) {
        let mut state = self.sc_error_state.lock().unwrap();
        if !matches!(*state, ErrorState::Failed(_)) {
            *state = ErrorState::Failed(err);
        }
    }

    fn set_operational(&self) {
        let mut state = self.sc_error_state.lock().unwrap();
        if matches!(*state, ErrorState::NotReady) {
            *state = ErrorState::Operational;
        }
    }
}
