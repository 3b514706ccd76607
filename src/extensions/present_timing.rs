// VK_EXT_present_timing (experimental)
//
// Present timing lets an application ask when its frames actually hit
// the screen, against a clock it can correlate with its own. Two
// pieces live here: a bounded queue of per-present timing entries,
// and the set of time domains a swapchain can report results in.
//
// Austin Shafer - 2025
use super::SwapchainExtension;
use crate::{Result, StratusError};
use utils::log;

use std::any::Any;
use std::sync::Mutex;

bitflags::bitflags! {
    /// The presentation pipeline stages a time domain can timestamp.
    pub struct PresentStageFlags: u32 {
        const QUEUE_OPERATIONS_END = 0b001;
        const IMAGE_LATCHED = 0b010;
        const IMAGE_FIRST_PIXEL_OUT = 0b100;
    }
}

/// The clock a timing result is expressed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeDomainId {
    /// The device's own clock
    Device,
    /// CLOCK_MONOTONIC
    ClockMonotonic,
    /// A clock private to a present stage of this swapchain
    SwapchainLocal,
}

/// A calibration sample: which domain, and its offset from the
/// domain's epoch at calibration time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CalibratedTime {
    pub domain: TimeDomainId,
    pub offset: u64,
}

/// One clock source usable for present timing results.
pub trait SwapchainTimeDomain: Send + Sync {
    fn calibrate(&self) -> CalibratedTime;

    fn present_stages(&self) -> PresentStageFlags;
}

/// A domain that reports in one of the Vulkan defined clocks with no
/// offset of its own.
pub struct VulkanTimeDomain {
    vt_domain: TimeDomainId,
    vt_stages: PresentStageFlags,
}

impl VulkanTimeDomain {
    pub fn new(domain: TimeDomainId, stages: PresentStageFlags) -> Self {
        Self {
            vt_domain: domain,
            vt_stages: stages,
        }
    }
}

impl SwapchainTimeDomain for VulkanTimeDomain {
    fn calibrate(&self) -> CalibratedTime {
        CalibratedTime {
            domain: self.vt_domain,
            offset: 0,
        }
    }

    fn present_stages(&self) -> PresentStageFlags {
        self.vt_stages
    }
}

/// CLOCK_MONOTONIC, calibrated by reading the clock.
pub struct MonotonicTimeDomain {
    mt_stages: PresentStageFlags,
}

impl MonotonicTimeDomain {
    pub fn new(stages: PresentStageFlags) -> Self {
        Self { mt_stages: stages }
    }
}

impl SwapchainTimeDomain for MonotonicTimeDomain {
    fn calibrate(&self) -> CalibratedTime {
        let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC is always available");
        let offset = now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64;

        CalibratedTime {
            domain: TimeDomainId::ClockMonotonic,
            offset,
        }
    }

    fn present_stages(&self) -> PresentStageFlags {
        self.mt_stages
    }
}

/// The set of time domains a swapchain offers.
pub struct TimeDomains {
    td_domains: Vec<Box<dyn SwapchainTimeDomain>>,
}

impl TimeDomains {
    pub fn new() -> Self {
        Self {
            td_domains: Vec::new(),
        }
    }

    pub fn add_time_domain(&mut self, domain: Box<dyn SwapchainTimeDomain>) {
        self.td_domains.push(domain);
    }

    /// Calibrate against the first domain covering all the requested
    /// stages.
    pub fn calibrate(&self, stages: PresentStageFlags) -> Result<CalibratedTime> {
        self.td_domains
            .iter()
            .find(|d| d.present_stages().contains(stages))
            .map(|d| d.calibrate())
            .ok_or(StratusError::INITIALIZATION_FAILED)
    }

    pub fn len(&self) -> usize {
        self.td_domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.td_domains.is_empty()
    }
}

impl Default for TimeDomains {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued timing request, created at present time.
#[derive(Copy, Clone, Debug, Default)]
pub struct PresentationEntry {
    /// Whether this entry still awaits its result
    pub is_outstanding: bool,
    pub present_id: u64,
}

struct TimingsQueue {
    tq_entries: Vec<PresentationEntry>,
    tq_capacity: usize,
}

pub struct PresentTiming {
    pt_queue: Mutex<TimingsQueue>,
    pt_domains: TimeDomains,
}

impl PresentTiming {
    pub const NAME: &'static str = "VK_EXT_present_timing";
    const DEFAULT_QUEUE_CAPACITY: usize = 32;

    pub fn new(domains: TimeDomains) -> Self {
        Self {
            pt_queue: Mutex::new(TimingsQueue {
                tq_entries: Vec::new(),
                tq_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            }),
            pt_domains: domains,
        }
    }

    /// Resize the timing result queue. Fails if more results are
    /// outstanding than the new capacity could hold.
    pub fn set_queue_capacity(&self, capacity: usize) -> Result<()> {
        let mut queue = self.pt_queue.lock().unwrap();
        let outstanding = queue.tq_entries.iter().filter(|e| e.is_outstanding).count();
        if outstanding > capacity {
            log::error!(
                "cannot shrink timing queue to {}, {} results outstanding",
                capacity,
                outstanding
            );
            return Err(StratusError::INITIALIZATION_FAILED);
        }

        queue.tq_entries.retain(|e| e.is_outstanding);
        queue.tq_capacity = capacity;
        Ok(())
    }

    /// Queue a timing entry for a present being submitted.
    pub fn add_presentation_entry(&self, entry: PresentationEntry) -> Result<()> {
        let mut queue = self.pt_queue.lock().unwrap();
        if queue.tq_entries.len() >= queue.tq_capacity {
            return Err(StratusError::OUT_OF_HOST_MEMORY);
        }

        queue.tq_entries.push(entry);
        Ok(())
    }

    /// How many entries still await their timing result.
    pub fn num_outstanding_results(&self) -> usize {
        self.pt_queue
            .lock()
            .unwrap()
            .tq_entries
            .iter()
            .filter(|e| e.is_outstanding)
            .count()
    }

    pub fn time_domains(&self) -> &TimeDomains {
        &self.pt_domains
    }
}

impl SwapchainExtension for PresentTiming {
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

    #[test]
    fn capacity_respects_outstanding() {
        let timing = PresentTiming::new(TimeDomains::new());
        timing
            .add_presentation_entry(PresentationEntry {
                is_outstanding: true,
                present_id: 1,
            })
            .unwrap();
        timing
            .add_presentation_entry(PresentationEntry {
                is_outstanding: true,
                present_id: 2,
            })
            .unwrap();

        assert_eq!(timing.num_outstanding_results(), 2);
        assert_eq!(
            timing.set_queue_capacity(1),
            Err(StratusError::INITIALIZATION_FAILED)
        );
        assert!(timing.set_queue_capacity(2).is_ok());
    }

    #[test]
    fn calibrate_picks_covering_domain() {
        let mut domains = TimeDomains::new();
        domains.add_time_domain(Box::new(VulkanTimeDomain::new(
            TimeDomainId::Device,
            PresentStageFlags::QUEUE_OPERATIONS_END,
        )));
        domains.add_time_domain(Box::new(MonotonicTimeDomain::new(
            PresentStageFlags::IMAGE_LATCHED | PresentStageFlags::IMAGE_FIRST_PIXEL_OUT,
        )));

        let calibrated = domains.calibrate(PresentStageFlags::IMAGE_LATCHED).unwrap();
        assert_eq!(calibrated.domain, TimeDomainId::ClockMonotonic);

        assert!(domains
            .calibrate(
                PresentStageFlags::QUEUE_OPERATIONS_END | PresentStageFlags::IMAGE_LATCHED
            )
            .is_err());
    }
}
