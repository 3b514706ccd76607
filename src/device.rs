// Vulkan device representation
//
// The engine never creates instances or devices, those belong to the
// application and arrive here as externally created ash handles. This
// wrapper carries the handful of things backends need: the function
// tables, memory properties, the external fd extension loaders and a
// queue reserved for our own signaling submissions.
//
// Austin Shafer - 2025
use ash::extensions::khr;
use ash::vk;

use std::sync::{Arc, Mutex};

/// What the underlying device can do for us.
///
/// These are decided by whoever created the VkDevice, based on which
/// extensions were enabled there. Calling a path whose flag is false
/// is avoided entirely rather than probed at runtime.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceFeatures {
    /// VK_KHR_external_fence_fd / VK_KHR_external_semaphore_fd import
    pub sync_fd_import: bool,
    /// Sync fd export for present fences
    pub sync_fd_export: bool,
    /// VK_KHR_external_memory_fd, needed to hand buffers to DRM
    pub external_memory_fd: bool,
}

/// Stratus Device
///
/// Holds the per-GPU state the presentation engine works against.
pub struct Device {
    pub(crate) inst: ash::Instance,
    pub(crate) pdev: vk::PhysicalDevice,
    /// the logical device we are wrapping
    pub dev: ash::Device,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    d_features: DeviceFeatures,
    /// Queue for internal signaling submissions. Queue submission
    /// requires external synchronization, hence the lock.
    d_queue: Mutex<vk::Queue>,
    /// needed for importing the already-signaled sentinel
    pub(crate) d_ext_fence_fd: khr::ExternalFenceFd,
    pub(crate) d_ext_semaphore_fd: khr::ExternalSemaphoreFd,
    /// needed for exporting image memory as dma-bufs
    pub(crate) d_ext_memory_fd: khr::ExternalMemoryFd,
}

impl Device {
    /// Wrap externally created device handles.
    ///
    /// `queue` is a device queue the engine may submit small signaling
    /// batches to. It must not be used by the application while the
    /// swapchain is alive unless it serializes with us.
    pub fn new(
        inst: ash::Instance,
        pdev: vk::PhysicalDevice,
        dev: ash::Device,
        queue: vk::Queue,
        features: DeviceFeatures,
    ) -> Arc<Self> {
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let ext_fence_fd = khr::ExternalFenceFd::new(&inst, &dev);
        let ext_semaphore_fd = khr::ExternalSemaphoreFd::new(&inst, &dev);
        let ext_memory_fd = khr::ExternalMemoryFd::new(&inst, &dev);

        Arc::new(Self {
            inst,
            pdev,
            dev,
            mem_props,
            d_features: features,
            d_queue: Mutex::new(queue),
            d_ext_fence_fd: ext_fence_fd,
            d_ext_semaphore_fd: ext_semaphore_fd,
            d_ext_memory_fd: ext_memory_fd,
        })
    }

    pub fn features(&self) -> &DeviceFeatures {
        &self.d_features
    }

    /// Run `f` with the internal queue while holding its lock.
    pub(crate) fn with_internal_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let queue = self.d_queue.lock().unwrap();
        f(*queue)
    }

    /// Find a memory type index satisfying the image's requirement
    /// bits and the requested property flags.
    pub(crate) fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.mem_props.memory_types[..self.mem_props.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(i, mem_type)| {
                (type_bits & (1 << i)) != 0 && mem_type.property_flags.contains(flags)
            })
            .map(|(i, _)| i as u32)
    }

    /// First-fit memory type selection, any properties.
    pub(crate) fn find_first_memory_type(&self, type_bits: u32) -> Option<u32> {
        (0..self.mem_props.memory_type_count).find(|i| (type_bits & (1 << i)) != 0)
    }
}
