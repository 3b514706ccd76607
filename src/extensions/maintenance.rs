// VK_EXT_swapchain_maintenance1
//
// Carries the set of present modes the application declared it may
// switch between, validates live switches against it, and validates
// scaling requests against what the surface can do.
//
// Austin Shafer - 2025
use ash::vk;

use super::SwapchainExtension;
use crate::surface::{ScalingCreateInfo, SurfaceProperties};
use crate::{Result, StratusError};
use utils::log;

use std::any::Any;
use std::sync::Mutex;

pub struct Maintenance1 {
    /// Possible presentation modes this swapchain is allowed to
    /// present with, recorded at creation
    m1_present_modes: Mutex<Vec<vk::PresentModeKHR>>,
}

impl Maintenance1 {
    pub const NAME: &'static str = "VK_EXT_swapchain_maintenance1";

    pub fn new() -> Self {
        Self {
            m1_present_modes: Mutex::new(Vec::new()),
        }
    }

    /// Validate and record the compatible present mode set the
    /// application supplied at swapchain creation. Every entry has to
    /// be compatible with the creation mode according to the surface.
    pub fn handle_present_modes_create_info(
        &self,
        props: &dyn SurfaceProperties,
        current_mode: vk::PresentModeKHR,
        modes: &[vk::PresentModeKHR],
    ) -> Result<()> {
        for mode in modes {
            if !props.is_compatible_present_mode(current_mode, *mode) {
                log::error!(
                    "present mode {:?} is not compatible with {:?}",
                    mode,
                    current_mode
                );
                return Err(StratusError::INITIALIZATION_FAILED);
            }
        }

        *self.m1_present_modes.lock().unwrap() = modes.to_vec();
        Ok(())
    }

    /// Validate a scaling request against the surface's scaling and
    /// gravity capabilities. Unspecified (empty) fields always pass.
    pub fn handle_scaling_create_info(
        &self,
        props: &dyn SurfaceProperties,
        scaling: &ScalingCreateInfo,
    ) -> Result<()> {
        let caps = props.get_scaling_capabilities();

        if (!scaling.scaling.is_empty() && !caps.scaling.contains(scaling.scaling))
            || (!scaling.gravity_x.is_empty() && !caps.gravity_x.contains(scaling.gravity_x))
            || (!scaling.gravity_y.is_empty() && !caps.gravity_y.contains(scaling.gravity_y))
        {
            log::error!("requested scaling behavior is not supported by the surface");
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        Ok(())
    }

    /// Validate a live present mode switch. The new mode has to be in
    /// the set recorded at creation; on failure the current mode is
    /// left untouched by the caller.
    pub fn handle_switching_presentation_mode(
        &self,
        swapchain_present_mode: vk::PresentModeKHR,
    ) -> Result<()> {
        let modes = self.m1_present_modes.lock().unwrap();
        if !modes.contains(&swapchain_present_mode) {
            log::error!("unable to switch presentation mode to {:?}", swapchain_present_mode);
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        Ok(())
    }

    pub fn compatible_present_modes(&self) -> Vec<vk::PresentModeKHR> {
        self.m1_present_modes.lock().unwrap().clone()
    }
}

impl Default for Maintenance1 {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapchainExtension for Maintenance1 {
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
    use crate::surface::{GravityFlags, ScalingCapabilities, ScalingFlags};

    struct StubProps;

    impl SurfaceProperties for StubProps {
        fn get_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
            Ok(vk::SurfaceCapabilitiesKHR::default())
        }

        fn get_surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
            Ok(Vec::new())
        }

        fn get_present_modes(&self) -> &[vk::PresentModeKHR] {
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED]
        }

        fn get_compatible_present_modes(
            &self,
            mode: vk::PresentModeKHR,
        ) -> &[vk::PresentModeKHR] {
            match mode {
                vk::PresentModeKHR::FIFO => {
                    &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED]
                }
                _ => &[],
            }
        }

        fn get_scaling_capabilities(&self) -> ScalingCapabilities {
            ScalingCapabilities {
                scaling: ScalingFlags::ONE_TO_ONE,
                gravity_x: GravityFlags::MIN,
                gravity_y: GravityFlags::MIN,
            }
        }
    }

    #[test]
    fn switch_requires_recorded_mode() {
        let ext = Maintenance1::new();
        ext.handle_present_modes_create_info(
            &StubProps,
            vk::PresentModeKHR::FIFO,
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED],
        )
        .unwrap();

        assert!(ext
            .handle_switching_presentation_mode(vk::PresentModeKHR::FIFO_RELAXED)
            .is_ok());
        assert_eq!(
            ext.handle_switching_presentation_mode(vk::PresentModeKHR::IMMEDIATE),
            Err(StratusError::INITIALIZATION_FAILED)
        );
    }

    #[test]
    fn incompatible_create_set_fails() {
        let ext = Maintenance1::new();
        assert_eq!(
            ext.handle_present_modes_create_info(
                &StubProps,
                vk::PresentModeKHR::FIFO,
                &[vk::PresentModeKHR::IMMEDIATE],
            ),
            Err(StratusError::INITIALIZATION_FAILED)
        );
    }

    #[test]
    fn scaling_validated_against_caps() {
        let ext = Maintenance1::new();
        let ok = ScalingCreateInfo {
            scaling: ScalingFlags::ONE_TO_ONE,
            gravity_x: GravityFlags::empty(),
            gravity_y: GravityFlags::empty(),
        };
        assert!(ext.handle_scaling_create_info(&StubProps, &ok).is_ok());

        let bad = ScalingCreateInfo {
            scaling: ScalingFlags::STRETCH,
            gravity_x: GravityFlags::empty(),
            gravity_y: GravityFlags::empty(),
        };
        assert_eq!(
            ext.handle_scaling_create_info(&StubProps, &bad),
            Err(StratusError::INITIALIZATION_FAILED)
        );
    }
}
