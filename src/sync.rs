// Present fence synchronization
//
// Every swapchain image carries a "present payload": a fence bound to
// the queue submission whose output is about to be presented. The
// page flip thread waits on it before handing the image to the
// backend. Two flavors cover our backends:
//  * FenceSync      - a plain VkFence, waited through the device
//  * SyncFdFenceSync - the payload exported as a sync file, so
//    threads without a dispatch table (or a different process) can
//    poll it as an ordinary fd
//
// Austin Shafer - 2025
use ash::vk;

use crate::allocator::ObjectAllocator;
use crate::device::Device;
use crate::{Result, StratusError};
use utils::fdwatch::FdWatch;
use utils::log;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

/// The wait and signal sets for one of our empty queue submissions.
pub struct QueueSubmitSemaphores<'a> {
    pub wait: &'a [vk::Semaphore],
    pub signal: &'a [vk::Semaphore],
}

/// Submit an empty batch that waits on `sems.wait`, signals
/// `sems.signal` and signals `fence`. This is the building block for
/// everything in this file.
pub fn queue_signal_submit(
    dev: &Device,
    queue: vk::Queue,
    sems: &QueueSubmitSemaphores,
    fence: vk::Fence,
) -> Result<()> {
    let stage_masks: Vec<vk::PipelineStageFlags> = sems
        .wait
        .iter()
        .map(|_| vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .collect();

    let submit = vk::SubmitInfo::builder()
        .wait_semaphores(sems.wait)
        .wait_dst_stage_mask(&stage_masks)
        .signal_semaphores(sems.signal)
        .build();

    unsafe {
        dev.dev
            .queue_submit(queue, &[submit], fence)
            .map_err(StratusError::from)
    }
}

/// Signal an acquire's fence and semaphore.
///
/// If the device can import sync fds we inject the already-signaled
/// sentinel (-1) as a temporary payload, which makes the handles
/// signaled without touching a queue. Otherwise fall back to an empty
/// submission on the device's internal queue.
pub fn signal_acquire_sync_objects(
    dev: &Device,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<()> {
    let mut sem = (semaphore != vk::Semaphore::null()).then_some(semaphore);
    let mut fen = (fence != vk::Fence::null()).then_some(fence);

    if dev.features().sync_fd_import {
        if let Some(f) = fen {
            let info = vk::ImportFenceFdInfoKHR::builder()
                .fence(f)
                .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
                .flags(vk::FenceImportFlags::TEMPORARY)
                .fd(-1);

            match unsafe { dev.d_ext_fence_fd.import_fence_fd(&info) } {
                Ok(()) => fen = None,
                // Leave to the submission fallback
                Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(s) = sem {
            let info = vk::ImportSemaphoreFdInfoKHR::builder()
                .semaphore(s)
                .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
                .flags(vk::SemaphoreImportFlags::TEMPORARY)
                .fd(-1);

            match unsafe { dev.d_ext_semaphore_fd.import_semaphore_fd(&info) } {
                Ok(()) => sem = None,
                Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    if sem.is_some() || fen.is_some() {
        let signal: Vec<vk::Semaphore> = sem.into_iter().collect();
        dev.with_internal_queue(|queue| {
            queue_signal_submit(
                dev,
                queue,
                &QueueSubmitSemaphores {
                    wait: &[],
                    signal: &signal,
                },
                fen.unwrap_or(vk::Fence::null()),
            )
        })?;
    }

    Ok(())
}

/// VkFence flavored present payload.
pub struct FenceSync {
    fs_dev: Arc<Device>,
    fs_alloc: ObjectAllocator,
    fs_fence: vk::Fence,
    /// Whether a payload submission is outstanding. Also serializes
    /// payload replacement against waits.
    fs_has_payload: Mutex<bool>,
}

impl FenceSync {
    pub fn new(dev: Arc<Device>, alloc: &ObjectAllocator) -> Result<Self> {
        let fence = unsafe {
            dev.dev
                .create_fence(&vk::FenceCreateInfo::builder(), alloc.callbacks())
                .map_err(StratusError::from)?
        };

        Ok(Self {
            fs_dev: dev,
            fs_alloc: alloc.clone(),
            fs_fence: fence,
            fs_has_payload: Mutex::new(false),
        })
    }

    /// Bind a new payload: an empty submission on `queue` waiting and
    /// signaling the given semaphores, with our fence attached. The
    /// previous payload must have completed.
    pub fn set_payload(
        &self,
        queue: vk::Queue,
        sems: &QueueSubmitSemaphores,
    ) -> Result<()> {
        let mut has_payload = self.fs_has_payload.lock().unwrap();
        if *has_payload {
            unsafe {
                self.fs_dev
                    .dev
                    .reset_fences(&[self.fs_fence])
                    .map_err(StratusError::from)?;
            }
            *has_payload = false;
        }

        queue_signal_submit(&self.fs_dev, queue, sems, self.fs_fence)?;
        *has_payload = true;
        Ok(())
    }

    /// Wait until the current payload completes. No payload means
    /// there is nothing to wait for.
    pub fn wait_payload(&self, timeout_ns: u64) -> Result<()> {
        let has_payload = self.fs_has_payload.lock().unwrap();
        if !*has_payload {
            return Ok(());
        }

        unsafe {
            self.fs_dev
                .dev
                .wait_for_fences(&[self.fs_fence], true, timeout_ns)
                .map_err(StratusError::from)
        }
    }
}

impl Drop for FenceSync {
    fn drop(&mut self) {
        unsafe {
            self.fs_dev
                .dev
                .destroy_fence(self.fs_fence, self.fs_alloc.callbacks());
        }
    }
}

enum SyncFdPayload {
    None,
    /// The driver reported the payload already signaled at export
    AlreadySignaled,
    Fd(OwnedFd),
}

/// Sync file flavored present payload.
///
/// The fence is created exportable; after each payload submission we
/// pull a sync fd out of it and waits go through poll(2) instead of
/// the device.
pub struct SyncFdFenceSync {
    sf_dev: Arc<Device>,
    sf_alloc: ObjectAllocator,
    sf_fence: vk::Fence,
    sf_payload: Mutex<SyncFdPayload>,
}

impl SyncFdFenceSync {
    pub fn new(dev: Arc<Device>, alloc: &ObjectAllocator) -> Result<Self> {
        if !dev.features().sync_fd_export {
            log::error!("sync fd export is not supported by this device");
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        let mut export_info = vk::ExportFenceCreateInfo::builder()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD);
        let create_info = vk::FenceCreateInfo::builder().push_next(&mut export_info);

        let fence = unsafe {
            dev.dev
                .create_fence(&create_info, alloc.callbacks())
                .map_err(StratusError::from)?
        };

        Ok(Self {
            sf_dev: dev,
            sf_alloc: alloc.clone(),
            sf_fence: fence,
            sf_payload: Mutex::new(SyncFdPayload::None),
        })
    }

    pub fn set_payload(
        &self,
        queue: vk::Queue,
        sems: &QueueSubmitSemaphores,
    ) -> Result<()> {
        let mut payload = self.sf_payload.lock().unwrap();

        unsafe {
            self.sf_dev
                .dev
                .reset_fences(&[self.sf_fence])
                .map_err(StratusError::from)?;
        }
        *payload = SyncFdPayload::None;

        queue_signal_submit(&self.sf_dev, queue, sems, self.sf_fence)?;

        // Exporting with SYNC_FD semantics transfers the payload out
        // of the fence and into the file we now own.
        let get_info = vk::FenceGetFdInfoKHR::builder()
            .fence(self.sf_fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD);
        let fd = unsafe {
            self.sf_dev
                .d_ext_fence_fd
                .get_fence_fd(&get_info)
                .map_err(StratusError::from)?
        };

        *payload = if fd < 0 {
            SyncFdPayload::AlreadySignaled
        } else {
            SyncFdPayload::Fd(unsafe { OwnedFd::from_raw_fd(fd) })
        };

        Ok(())
    }

    pub fn wait_payload(&self, timeout_ns: u64) -> Result<()> {
        let payload = self.sf_payload.lock().unwrap();
        let fd = match &*payload {
            SyncFdPayload::None | SyncFdPayload::AlreadySignaled => return Ok(()),
            SyncFdPayload::Fd(fd) => fd,
        };

        let mut watch = FdWatch::new();
        watch.add_fd(fd.as_raw_fd());
        let timeout = (timeout_ns != u64::MAX).then_some(timeout_ns);

        match watch.wait_readable(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(StratusError::TIMEOUT),
            Err(e) => {
                log::error!("failed to wait on exported sync fd: {:?}", e);
                Err(StratusError::INVALID_FD)
            }
        }
    }
}

impl Drop for SyncFdFenceSync {
    fn drop(&mut self) {
        unsafe {
            self.sf_dev
                .dev
                .destroy_fence(self.sf_fence, self.sf_alloc.callbacks());
        }
    }
}
