// Frame slots and pacing
//
// One FrameSlot per swapchain image: command pool, upload heap, descriptor
// arena. The FramePacer tracks which fence token gates the reuse of each
// slot - the CPU throttles itself to at most N frames ahead of the GPU by
// waiting on that token before recycling a slot's resources.

use super::descriptors::DescriptorArena;
use super::pipeline::{PipelineLayouts, BINDING_DRAW_CONSTANTS, BINDING_FRAME_CONSTANTS};
use super::sync::FenceValue;
use super::upload::UploadHeap;
use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Per-slot fence bookkeeping, kept separate from the Vulkan objects so the
/// reclaim protocol can be exercised without a device.
#[derive(Debug)]
pub struct FramePacer {
    slot_tokens: Vec<FenceValue>,
}

impl FramePacer {
    pub fn new(slot_count: usize) -> Self {
        // FenceValue(0) is complete by definition, so fresh slots are
        // immediately reusable.
        Self {
            slot_tokens: vec![FenceValue(0); slot_count],
        }
    }

    /// Token that must be observed complete before `slot`'s upload heap,
    /// descriptor arena and command pool may be recycled.
    pub fn reuse_gate(&self, slot: usize) -> FenceValue {
        self.slot_tokens[slot]
    }

    /// Record the token signaled at the end of the frame that just wrote
    /// through `slot`.
    pub fn record_signal(&mut self, slot: usize, token: FenceValue) {
        debug_assert!(token > self.slot_tokens[slot], "fence tokens must increase");
        self.slot_tokens[slot] = token;
    }

    /// After a full flush (resize or static-upload path) every slot's
    /// outstanding work has retired; rebase all gates onto the flushed
    /// token so stale values cannot under-gate recreated backbuffers.
    pub fn rebase(&mut self, token: FenceValue) {
        for gate in &mut self.slot_tokens {
            *gate = (*gate).max(token);
        }
    }
}

/// All per-frame-in-flight resources for one swapchain image.
pub struct FrameSlot {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub upload: UploadHeap,
    pub descriptors: DescriptorArena,
    constants_pool: vk::DescriptorPool,
    /// Dynamic-offset views of this slot's upload heap (frame + draw
    /// constant windows).
    pub constants_set: vk::DescriptorSet,
}

impl FrameSlot {
    pub fn new(
        device: &Arc<VulkanDevice>,
        layouts: &PipelineLayouts,
        upload_size: u64,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create frame command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate frame command buffer")?[0];

        let upload = UploadHeap::new(device, upload_size)?;

        // The constants set is written once: dynamic offsets re-aim it at
        // whatever the frame pushed into the upload heap.
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 2,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let constants_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create constants descriptor pool")?;

        let set_layouts = [layouts.constants_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(constants_pool)
            .set_layouts(&set_layouts);
        let constants_set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate constants descriptor set")?[0];

        let frame_info = [vk::DescriptorBufferInfo {
            buffer: upload.buffer(),
            offset: 0,
            range: PipelineLayouts::frame_constants_range(),
        }];
        let draw_info = [vk::DescriptorBufferInfo {
            buffer: upload.buffer(),
            offset: 0,
            range: PipelineLayouts::draw_constants_range(),
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(constants_set)
                .dst_binding(BINDING_FRAME_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&frame_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(constants_set)
                .dst_binding(BINDING_DRAW_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&draw_info)
                .build(),
        ];
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        Ok(Self {
            device: device.clone(),
            command_pool,
            command_buffer,
            upload,
            descriptors: DescriptorArena::new(device, &layouts.bindless)?,
            constants_pool,
            constants_set,
        })
    }

    /// Recycle the slot's resources for a new frame. Only legal after the
    /// slot's reuse gate has been waited on.
    pub fn recycle(&mut self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .context("Failed to reset frame command pool")?;

        self.upload.reset();
        self.descriptors.reset();
        Ok(())
    }

    /// Begin recording into the slot's command buffer.
    pub fn begin_commands(&self) -> Result<vk::CommandBuffer> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .begin_command_buffer(self.command_buffer, &begin_info)
        }
        .context("Failed to begin frame command buffer")?;
        Ok(self.command_buffer)
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_pool(self.constants_pool, None);
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    // Mock execution queue: tokens issue strictly in order, completion
    // advances monotonically in value but at arbitrary times (the GPU may
    // retire several frames at once, or none for a while).
    struct MockGpu {
        counter: u64,
        completed: u64,
    }

    impl MockGpu {
        fn new() -> Self {
            Self {
                counter: 0,
                completed: 0,
            }
        }

        fn signal(&mut self) -> FenceValue {
            self.counter += 1;
            FenceValue(self.counter)
        }

        // Background progress: complete up to `value` if it is ahead.
        fn complete_to(&mut self, value: u64) {
            assert!(value <= self.counter, "GPU cannot complete unsubmitted work");
            self.completed = self.completed.max(value);
        }

        // Host-side wait: blocks (here: forces progress) until `token`.
        fn wait(&mut self, token: FenceValue) {
            assert!(token.0 <= self.counter, "waiting on a never-signaled token");
            self.complete_to(token.0);
        }
    }

    #[test]
    fn tokens_increase_strictly() {
        let mut gpu = MockGpu::new();
        let mut last = FenceValue(0);
        for _ in 0..100 {
            let token = gpu.signal();
            assert!(token > last);
            last = token;
        }
    }

    #[test]
    fn wait_only_returns_at_or_after_token() {
        let mut gpu = MockGpu::new();
        let a = gpu.signal();
        let b = gpu.signal();
        let c = gpu.signal();

        // Completion jumps straight to b: a and b are now done, c is not.
        gpu.complete_to(b.0);
        assert!(gpu.completed >= a.0);
        assert!(gpu.completed < c.0);

        gpu.wait(c);
        assert!(gpu.completed >= c.0);

        // Waiting on an old token is a no-op that leaves progress alone.
        let before = gpu.completed;
        gpu.wait(a);
        assert_eq!(gpu.completed, before);
    }

    #[test]
    fn slots_are_never_recycled_while_in_flight() {
        const SLOTS: usize = 3;
        let mut rng = Lcg(0xfeed);
        let mut gpu = MockGpu::new();
        let mut pacer = FramePacer::new(SLOTS);

        // Write-after-use hazard detector: the token whose completion the
        // slot's memory depends on.
        let mut last_write = [FenceValue(0); SLOTS];

        for frame in 0..500usize {
            let slot = frame % SLOTS;

            // Random background GPU progress, often lagging several frames.
            if rng.next() % 4 == 0 {
                let target = gpu.completed + rng.next() % 3;
                gpu.complete_to(target.min(gpu.counter));
            }

            // Reuse protocol: wait the gate, then the reset is safe.
            let gate = pacer.reuse_gate(slot);
            gpu.wait(gate);
            assert!(
                gpu.completed >= last_write[slot].0,
                "slot {} reset while frame {:?} still in flight",
                slot,
                last_write[slot]
            );

            // Record, submit, signal.
            let token = gpu.signal();
            last_write[slot] = token;
            pacer.record_signal(slot, token);
        }
    }

    #[test]
    fn rebase_lifts_every_gate_to_the_flushed_token() {
        let mut gpu = MockGpu::new();
        let mut pacer = FramePacer::new(3);

        for frame in 0..5usize {
            let token = gpu.signal();
            pacer.record_signal(frame % 3, token);
        }

        // Resize path: flush retires everything, gates rebase onto the
        // flushed token so recreated backbuffers inherit a safe gate.
        let flushed = gpu.signal();
        gpu.wait(flushed);
        pacer.rebase(flushed);
        for slot in 0..3 {
            assert_eq!(pacer.reuse_gate(slot), flushed);
        }
    }

    // End-to-end pacing scenario: static upload once, then steady frames
    // pushing constants through per-slot arenas without ever blocking on a
    // token newer than the slot's previous occupant.
    #[test]
    fn steady_state_frames_pace_and_fit() {
        const SLOTS: usize = 3;
        const UPLOAD_CAPACITY: u64 = 20 * 1024 * 1024;
        const FRAME_CONSTANTS: u64 = 144;
        const DRAW_CONSTANTS: u64 = 192;

        let mut gpu = MockGpu::new();
        let mut pacer = FramePacer::new(SLOTS);
        let mut arenas: Vec<Arena> = (0..SLOTS).map(|_| Arena::new(UPLOAD_CAPACITY)).collect();
        let mut upload_runs = 0u32;
        let mut frame_tokens: Vec<FenceValue> = Vec::new();

        for frame in 0..32usize {
            let slot = frame % SLOTS;
            let new_static_data = frame == 0;

            let gate = pacer.reuse_gate(slot);
            // The gate is the token of this slot's previous occupant, never
            // anything newer: with 3 slots that is the frame 3 iterations
            // back.
            if frame >= SLOTS {
                assert_eq!(gate, frame_tokens[frame - SLOTS]);
            } else {
                assert_eq!(gate, FenceValue(0));
            }
            gpu.wait(gate);
            arenas[slot].reset();

            if new_static_data {
                // Static geometry goes through its own staging allocation
                // followed by a full flush before first use.
                arenas[slot].allocate(8 * 16 + 36 * 2 + 256 * 256 * 4, 512);
                upload_runs += 1;
                let flush_token = gpu.signal();
                gpu.wait(flush_token);
            }

            // Per-frame constant traffic for one draw plus the sky pass.
            arenas[slot].allocate(FRAME_CONSTANTS, 256);
            arenas[slot].allocate(DRAW_CONSTANTS, 256);
            arenas[slot].allocate(DRAW_CONSTANTS, 256);

            let token = gpu.signal();
            pacer.record_signal(slot, token);
            frame_tokens.push(token);
        }

        assert_eq!(upload_runs, 1, "static upload must not be re-issued");
    }
}
