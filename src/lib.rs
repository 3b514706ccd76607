//! # Stratus, a Vulkan presentation engine.
//!
//! Stratus implements the window system integration half of a Vulkan
//! stack: swapchain creation, image acquisition, queue presentation
//! and page flipping, layered on top of pluggable windowing backends
//! (headless, DRM/KMS display planes, Wayland). The driver underneath
//! only ever sees images and queue submissions; everything about how
//! an image reaches the screen lives here.
//!
//! The interesting machinery is the swapchain engine in [`swapchain`]:
//! a pool of presentable images moving through a small state machine,
//! a page flip thread that feeds a backend presenter in FIFO order,
//! and the handoff protocol that lets an application replace a
//! swapchain while frames from the old one are still in flight.
//!
//! ## Presentation flow
//!
//! The general flow of a stratus client is as follows:
//! * Create a [`SwapchainCreateInfo`] with the builder
//! * Create a swapchain from a backend surface (`Surface::create_swapchain`)
//! * Acquire an image (`Swapchain::acquire_next_image`)
//! * Render to it through whatever API the application likes
//! * Hand it back for presentation (`Swapchain::queue_present`)
//!
//! Backends implement the [`Presenter`] contract: how to allocate and
//! bind the memory behind an image, how to push one image at the
//! presentation engine, and how to wait for the rendering that
//! produced it. Everything else, ordering, synchronization, lifetime,
//! is owned by the engine and is identical across backends.
//!
//! ## Swapchain extensions
//!
//! Optional per-swapchain features (present ids, frame boundaries,
//! image compression control, present mode switching, present timing)
//! live in a small type keyed registry on each swapchain. See the
//! [`extensions`] module.

// Austin Shafer - 2025

#![allow(dead_code)]
extern crate ash;
extern crate thiserror;
extern crate utils;

use ash::vk;
use thiserror::Error;

pub mod allocator;
pub mod backend;
pub mod device;
pub mod extensions;
pub mod presenter;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod tests;

pub use allocator::{AllocationScope, ObjectAllocator};
pub use device::{Device, DeviceFeatures};
pub use presenter::{ImageData, PresentOutcome, Presenter};
pub use surface::{
    ScalingCapabilities, ScalingCreateInfo, Surface, SurfaceProperties, MAX_SWAPCHAIN_IMAGE_COUNT,
};
pub use swapchain::{
    ImageCreateDesc, ImageStatus, PendingPresent, PresentParams, Swapchain, SwapchainCreateInfo,
    SwapchainHooks, SwapchainImage,
};
pub use sync::QueueSubmitSemaphores;

/// Stratus error codes
///
/// These mirror the Vulkan result codes an application would see
/// from the equivalent entry points, so embedding code can translate
/// them back with `to_vk` without any loss.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum StratusError {
    #[error("Ran out of host memory")]
    OUT_OF_HOST_MEMORY,
    #[error("Ran out of device memory")]
    OUT_OF_DEVICE_MEMORY,
    #[error("The surface backing this swapchain is no longer usable")]
    SURFACE_LOST,
    #[error("A replacement swapchain has started presenting")]
    OUT_OF_DATE,
    #[error("Presented, but the surface configuration has drifted")]
    SUBOPTIMAL,
    #[error("Could not initialize the requested object")]
    INITIALIZATION_FAILED,
    #[error("Timed out waiting for the operation")]
    TIMEOUT,
    #[error("The swapchain is not ready")]
    NOT_READY,
    #[error("This surface type is not supported")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Invalid argument")]
    INVALID,
    #[error("Could not present the image")]
    PRESENT_FAILED,
    #[error("Invalid file descriptor")]
    INVALID_FD,
    #[error("A required swapchain extension is not present")]
    EXTENSION_MISSING,
}

impl StratusError {
    /// Translate back into the Vulkan result an application expects.
    pub fn to_vk(&self) -> vk::Result {
        match self {
            StratusError::OUT_OF_HOST_MEMORY => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            StratusError::OUT_OF_DEVICE_MEMORY => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            StratusError::SURFACE_LOST => vk::Result::ERROR_SURFACE_LOST_KHR,
            StratusError::OUT_OF_DATE => vk::Result::ERROR_OUT_OF_DATE_KHR,
            StratusError::SUBOPTIMAL => vk::Result::SUBOPTIMAL_KHR,
            StratusError::INITIALIZATION_FAILED => vk::Result::ERROR_INITIALIZATION_FAILED,
            StratusError::TIMEOUT => vk::Result::TIMEOUT,
            StratusError::NOT_READY => vk::Result::NOT_READY,
            StratusError::VK_SURF_NOT_SUPPORTED => vk::Result::ERROR_SURFACE_LOST_KHR,
            StratusError::INVALID => vk::Result::ERROR_VALIDATION_FAILED_EXT,
            StratusError::PRESENT_FAILED => vk::Result::ERROR_DEVICE_LOST,
            StratusError::INVALID_FD => vk::Result::ERROR_INVALID_EXTERNAL_HANDLE,
            StratusError::EXTENSION_MISSING => vk::Result::ERROR_EXTENSION_NOT_PRESENT,
        }
    }
}

impl From<vk::Result> for StratusError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => StratusError::OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => StratusError::OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_SURFACE_LOST_KHR => StratusError::SURFACE_LOST,
            vk::Result::ERROR_OUT_OF_DATE_KHR => StratusError::OUT_OF_DATE,
            vk::Result::SUBOPTIMAL_KHR => StratusError::SUBOPTIMAL,
            vk::Result::ERROR_INITIALIZATION_FAILED => StratusError::INITIALIZATION_FAILED,
            vk::Result::TIMEOUT => StratusError::TIMEOUT,
            vk::Result::NOT_READY => StratusError::NOT_READY,
            vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => StratusError::INVALID_FD,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => StratusError::EXTENSION_MISSING,
            _ => StratusError::INVALID,
        }
    }
}

pub type Result<T> = std::result::Result<T, StratusError>;
