// The presenter contract
//
// A presenter is the leaf of one windowing backend: it knows how to
// put memory behind a swapchain image, how to push a finished image
// at the presentation engine and how to tell when the rendering that
// produced it has completed. The swapchain engine owns everything
// else - image states, ordering, the page flip thread - and drives a
// presenter through this trait only.
//
// Austin Shafer - 2025
use ash::vk;

use crate::extensions::frame_boundary::FrameBoundaryInfo;
use crate::swapchain::{ImageCreateDesc, PendingPresent, SwapchainCreateInfo, SwapchainHooks, SwapchainImage};
use crate::sync::QueueSubmitSemaphores;
use crate::Result;

use std::any::Any;

/// What happened to the image the presenter just submitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The presentation engine is done with the image, it can be
    /// handed back to the application immediately.
    Released,
    /// The image is now on scanout and stays busy until the next
    /// present replaces it. The engine marks it PRESENTED and
    /// releases the previously presented image instead.
    OnScreen,
}

/// Backend owned per-image state.
///
/// Presenters hang whatever they need off each image record: device
/// memory, prime handles, framebuffer ids, the present fence. The
/// swapchain is the sole logical owner; the Arc in the image record
/// only exists so payload waits can happen outside the image status
/// lock. Downcast through `as_any` to get the concrete type back.
pub trait ImageData: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// The backend presenter contract.
///
/// One implementation per windowing system. All methods take `&self`;
/// a presenter is shared between the application threads and the page
/// flip thread and synchronizes its own internals.
pub trait Presenter: Send + Sync {
    /// Perform backend setup for a new swapchain.
    ///
    /// Returns whether the page flip thread should be used for the
    /// requested present mode. `hooks` lets backend threads release
    /// images and latch fatal errors on the engine.
    fn init(&self, info: &SwapchainCreateInfo, hooks: SwapchainHooks) -> Result<bool>;

    /// Create the image object itself, without any memory behind it.
    fn create_image(&self, desc: &ImageCreateDesc) -> Result<vk::Image>;

    /// Allocate backing memory, bind it, and install the per-image
    /// backend data including the present fence. All or nothing: on
    /// failure the partial image must be torn down before returning.
    fn allocate_and_bind(&self, desc: &ImageCreateDesc, image: &mut SwapchainImage) -> Result<()>;

    /// Submit one image to the presentation engine. May block, for
    /// example until a vsync relative target is reached.
    fn present_image(
        &self,
        request: &PendingPresent,
        image: &SwapchainImage,
    ) -> Result<PresentOutcome>;

    /// Release backend resources for this image. Must be idempotent;
    /// the engine may call it for images already torn down.
    fn destroy_image(&self, image: &mut SwapchainImage);

    /// Give the backend a chance to observe externally signaled
    /// "image released" events before the engine waits on the free
    /// image semaphore. Backends may mark images free through their
    /// `SwapchainHooks` and may shrink the remaining timeout.
    fn get_free_buffer_hint(&self, timeout_ns: &mut u64) -> Result<()> {
        let _ = timeout_ns;
        Ok(())
    }

    /// Install a present payload on the image's fence sync: a
    /// submission on `queue` waiting and signaling the given
    /// semaphores. `boundary` carries frame boundary information when
    /// that extension participates in this present.
    fn set_present_payload(
        &self,
        image: &SwapchainImage,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        boundary: Option<&FrameBoundaryInfo>,
    ) -> Result<()>;

    /// Wait until the image's present payload completes.
    fn wait_present(&self, image: &SwapchainImage, timeout_ns: u64) -> Result<()>;

    /// Bind an application created image alias to this swapchain
    /// image's memory.
    fn bind_swapchain_image(&self, image: vk::Image, swapchain_image: &SwapchainImage)
        -> Result<()>;

    // ------------------------------------------------------------
    // Device services. The engine needs these but deliberately does
    // not own a device of its own; everything device shaped flows
    // through the backend.
    // ------------------------------------------------------------

    /// Create a binary semaphore for per-image signaling.
    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, sem: vk::Semaphore);

    /// Signal the caller's acquire fence/semaphore, by sentinel sync
    /// fd import when supported or by an empty queue submission.
    fn signal_acquire(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<()>;

    /// Submit an empty batch waiting/signaling the given semaphores
    /// and signaling `fence`. Used to chain the application's present
    /// fence behind the present payload.
    fn sync_queue_submit(
        &self,
        queue: vk::Queue,
        semaphores: &QueueSubmitSemaphores,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Drain the queue used for our signaling submissions. Called
    /// during teardown.
    fn queue_wait_idle(&self) -> Result<()> {
        Ok(())
    }
}
