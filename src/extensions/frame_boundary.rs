// VK_EXT_frame_boundary
//
// Tools like GPU profilers want to know where frames end even when
// no real window system is attached. When enabled, each present
// carries a frame boundary record naming the image being presented
// and a monotonically increasing frame id, which the backend chains
// onto its payload submission.
//
// Austin Shafer - 2025
use ash::vk;

use super::SwapchainExtension;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// The information a backend attaches to the payload submission for
/// one present.
#[derive(Clone, Debug)]
pub struct FrameBoundaryInfo {
    /// End of frame marker id
    pub frame_id: u64,
    /// The images making up the frame, for us always the one being
    /// presented
    pub images: Vec<vk::Image>,
}

pub struct FrameBoundary {
    /// Current frame identifier for the swapchain
    fb_frame_id: AtomicU64,
}

impl FrameBoundary {
    pub const NAME: &'static str = "VK_EXT_frame_boundary";

    pub fn new() -> Self {
        Self {
            fb_frame_id: AtomicU64::new(0),
        }
    }

    /// Build the frame boundary record for presenting `image`,
    /// advancing the frame counter.
    pub fn next_frame_boundary(&self, image: vk::Image) -> FrameBoundaryInfo {
        let id = self.fb_frame_id.fetch_add(1, Ordering::AcqRel);
        FrameBoundaryInfo {
            frame_id: id,
            images: vec![image],
        }
    }

    pub fn current_frame_id(&self) -> u64 {
        self.fb_frame_id.load(Ordering::Acquire)
    }
}

impl Default for FrameBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapchainExtension for FrameBoundary {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn frame_ids_advance() {
        let ext = FrameBoundary::new();
        let img = vk::Image::from_raw(0xdead);

        let first = ext.next_frame_boundary(img);
        let second = ext.next_frame_boundary(img);
        assert_eq!(first.frame_id, 0);
        assert_eq!(second.frame_id, 1);
        assert_eq!(second.images, vec![img]);
    }
}
