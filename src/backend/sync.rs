// Synchronization primitives
//
// GpuFence wraps a timeline semaphore as the CPU/GPU progress counter:
// signal from the queue side, wait/poll from the host side. FrameSync keeps
// the per-frame binary semaphores the swapchain needs for acquire/present.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Token from `GpuFence::signal`. Completion of the token implies completion
/// of all queue work submitted before the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FenceValue(pub u64);

/// Monotonic GPU progress fence.
///
/// The CPU-side counter only increases; the GPU-reported completed value is
/// non-decreasing and trails it. Waits are unbounded - a device that never
/// completes hangs the process rather than limping on.
pub struct GpuFence {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
    counter: u64,
}

impl GpuFence {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create timeline semaphore")?;

        Ok(Self {
            device: device.clone(),
            semaphore,
            counter: 0,
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Reserve the next token without submitting anything. The caller must
    /// include `semaphore()` with the returned value in its submit's signal
    /// list, otherwise a later `wait` on the token never returns.
    pub fn reserve_signal(&mut self) -> FenceValue {
        self.counter += 1;
        FenceValue(self.counter)
    }

    /// Ask the queue to signal the next token once all previously submitted
    /// work has retired.
    pub fn signal(&mut self, queue: vk::Queue) -> Result<FenceValue> {
        let value = self.reserve_signal();

        let signal_values = [value.0];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let signal_semaphores = [self.semaphore];
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit], vk::Fence::null())
        }
        .context("Failed to submit fence signal")?;

        Ok(value)
    }

    /// Latest value the GPU reports complete.
    pub fn completed(&self) -> Result<FenceValue> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }
            .context("Failed to query timeline semaphore")?;
        Ok(FenceValue(value))
    }

    /// Block until the GPU has completed `value`. No-op if already complete,
    /// so repeated waits on old tokens are cheap.
    pub fn wait(&self, value: FenceValue) -> Result<()> {
        if self.completed()? >= value {
            return Ok(());
        }

        let semaphores = [self.semaphore];
        let values = [value.0];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX) }
            .context("Failed waiting on timeline semaphore")?;
        Ok(())
    }

    /// Full synchronization point: signal, then block until it completes.
    /// Used before resize, teardown, and static-data reuse.
    pub fn flush(&mut self, queue: vk::Queue) -> Result<FenceValue> {
        let value = self.signal(queue)?;
        self.wait(value)?;
        Ok(value)
    }
}

impl Drop for GpuFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Binary semaphores for one frame in flight.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
        }
    }
}
