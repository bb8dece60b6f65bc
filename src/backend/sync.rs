// Synchronization primitives
//
// A fixed pool of (fence, semaphore) slots bounding in-flight compute
// submissions. Slots are picked round-robin by iteration; reusing a slot
// first waits for its previous submission's fence and resets it, so at most
// `len()` submissions are ever outstanding.

use ash::vk;

use super::hal::{ComputeDevice, SemaphoreKind};
use crate::error::{Error, Result, VkContext};

/// One reusable submission slot
#[derive(Debug, Clone, Copy)]
pub struct SyncSlot {
    pub fence: vk::Fence,
    pub semaphore: vk::Semaphore,
    pub timeline: Option<vk::Semaphore>,
}

pub struct SyncPool {
    slots: Vec<SyncSlot>,
}

impl SyncPool {
    /// Create `count` slots with pre-signaled fences, so the first wait on
    /// each slot returns immediately
    pub fn new(device: &dyn ComputeDevice, count: usize, timeline: bool) -> Result<Self> {
        if count == 0 {
            return Err(Error::EmptyPool);
        }

        let mut pool = Self {
            slots: Vec::with_capacity(count),
        };
        for _ in 0..count {
            match create_slot(device, timeline) {
                Ok(slot) => pool.slots.push(slot),
                Err(e) => {
                    pool.destroy(device);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Created synchronization pool: {} slot(s), timeline semaphores: {}",
            count,
            timeline
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot used by a given iteration
    pub fn acquire(&self, iteration: u64) -> usize {
        (iteration % self.slots.len().max(1) as u64) as usize
    }

    pub fn slot(&self, index: usize) -> Result<&SyncSlot> {
        self.slots.get(index).ok_or(Error::SlotOutOfRange {
            slot: index,
            count: self.slots.len(),
        })
    }

    /// Block until the slot's fence signals, then reset it for the next
    /// submission. There is no timeout.
    pub fn wait_and_reset(&self, device: &dyn ComputeDevice, index: usize) -> Result<()> {
        let fence = self.slot(index)?.fence;
        device
            .wait_for_fence(fence, u64::MAX)
            .op("vkWaitForFences")?;
        device.reset_fence(fence).op("vkResetFences")
    }

    /// Block until the slot's fence signals, leaving it signaled
    pub fn wait(&self, device: &dyn ComputeDevice, index: usize) -> Result<()> {
        let fence = self.slot(index)?.fence;
        device
            .wait_for_fence(fence, u64::MAX)
            .op("vkWaitForFences")
    }

    pub fn wait_all(&self, device: &dyn ComputeDevice) -> Result<()> {
        (0..self.slots.len()).try_for_each(|index| self.wait(device, index))
    }

    /// Last value the slot's timeline semaphore reached
    pub fn timeline_value(&self, device: &dyn ComputeDevice, index: usize) -> Result<u64> {
        let timeline = self.slot(index)?.timeline.ok_or(Error::NoTimeline)?;
        device
            .semaphore_counter_value(timeline)
            .op("vkGetSemaphoreCounterValue")
    }

    /// Release every fence and semaphore. The pool is empty afterwards.
    pub fn destroy(&mut self, device: &dyn ComputeDevice) {
        for slot in self.slots.drain(..) {
            destroy_slot(device, &slot);
        }
    }
}

impl Drop for SyncPool {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            log::warn!(
                "Synchronization pool dropped with {} live slot(s)",
                self.slots.len()
            );
        }
    }
}

fn create_slot(device: &dyn ComputeDevice, timeline: bool) -> Result<SyncSlot> {
    let fence = device.create_fence(true).op("vkCreateFence")?;

    let semaphore = match device
        .create_semaphore(SemaphoreKind::Binary)
        .op("vkCreateSemaphore")
    {
        Ok(semaphore) => semaphore,
        Err(e) => {
            device.destroy_fence(fence);
            return Err(e);
        }
    };

    let timeline = if timeline {
        match device
            .create_semaphore(SemaphoreKind::Timeline)
            .op("vkCreateSemaphore")
        {
            Ok(semaphore) => Some(semaphore),
            Err(e) => {
                device.destroy_semaphore(semaphore);
                device.destroy_fence(fence);
                return Err(e);
            }
        }
    } else {
        None
    };

    Ok(SyncSlot {
        fence,
        semaphore,
        timeline,
    })
}

fn destroy_slot(device: &dyn ComputeDevice, slot: &SyncSlot) {
    device.destroy_fence(slot.fence);
    device.destroy_semaphore(slot.semaphore);
    if let Some(timeline) = slot.timeline {
        device.destroy_semaphore(timeline);
    }
}
