// Compute pipeline creation and the dispatch protocol
//
// A `ComputePipeline` is one kernel plus a layout with a single storage-buffer
// set and one push-constant block. It is immutable once built: a different
// kernel or parameter layout means a new pipeline.
//
// Every dispatch walks the same steps on the slot picked for its iteration:
//   wait + reset fence -> reset command buffer -> record -> submit
// Reusing a slot therefore never starts recording before the slot's previous
// submission has completed.

use ash::vk;
use bytemuck::Pod;
use std::ffi::CStr;

use super::descriptor::ResourceBinding;
use super::hal::{Barrier, ComputeDevice, QueueRole, SemaphoreSignal};
use super::shader;
use super::sync::SyncPool;
use crate::error::{Error, Result, VkContext};

const ENTRY_POINT: &CStr = c"main";

/// Inline parameters delivered with a dispatch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterBlock<'a> {
    Bytes(&'a [u8]),
    /// Record and submit an empty command buffer: no push, no dispatch
    Empty,
}

impl<'a> ParameterBlock<'a> {
    pub fn of<T: Pod>(value: &'a T) -> Self {
        ParameterBlock::Bytes(bytemuck::bytes_of(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Return right after submission; wait on the slot before touching results
    Async,
    /// Block until the compute queue is idle before returning
    Sync,
}

/// Where a slot's command buffer is in its submission cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Recording,
    Submitted,
}

pub struct ComputePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set: vk::DescriptorSet,
    push_size: u32,
    command_buffers: Vec<vk::CommandBuffer>,
    states: Vec<SubmissionState>,
    // Binary semaphore signaled by the slot's last submission and not yet
    // consumed; the next submission on the slot waits on it
    armed: Vec<bool>,
}

impl ComputePipeline {
    /// Build the layout and pipeline around `module` and allocate one command
    /// buffer per synchronization slot
    pub fn new(
        device: &dyn ComputeDevice,
        module: vk::ShaderModule,
        binding: &ResourceBinding,
        push_size: u32,
        slots: usize,
    ) -> Result<Self> {
        let layout = device
            .create_pipeline_layout(&[binding.layout], push_size)
            .op("vkCreatePipelineLayout")?;

        let pipeline = match device
            .create_compute_pipeline(layout, module, ENTRY_POINT)
            .op("vkCreateComputePipelines")
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        let command_buffers = match device
            .allocate_command_buffers(QueueRole::Compute, slots as u32)
            .op("vkAllocateCommandBuffers")
        {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_pipeline(pipeline);
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        log::info!(
            "Created compute pipeline ({} byte parameter block, {} command buffer(s))",
            push_size,
            slots
        );

        Ok(Self {
            pipeline,
            layout,
            set: binding.set,
            push_size,
            command_buffers,
            states: vec![SubmissionState::Idle; slots],
            armed: vec![false; slots],
        })
    }

    /// Build a pipeline straight from SPIR-V words. The shader module is
    /// released once the pipeline exists.
    pub fn from_spirv(
        device: &dyn ComputeDevice,
        code: &[u32],
        binding: &ResourceBinding,
        push_size: u32,
        slots: usize,
    ) -> Result<Self> {
        let module = shader::create_module(device, code)?;
        let pipeline = Self::new(device, module, binding, push_size, slots);
        device.destroy_shader_module(module);
        pipeline
    }

    pub fn push_size(&self) -> u32 {
        self.push_size
    }

    pub fn state(&self, slot: usize) -> Option<SubmissionState> {
        self.states.get(slot).copied()
    }

    /// Record and submit one dispatch of `groups` work groups on the slot
    /// `pool` assigns to `iteration`. Returns the slot used.
    pub fn dispatch(
        &mut self,
        device: &dyn ComputeDevice,
        pool: &SyncPool,
        iteration: u64,
        params: ParameterBlock<'_>,
        groups: [u32; 3],
        mode: SubmitMode,
    ) -> Result<usize> {
        if let ParameterBlock::Bytes(bytes) = params {
            if bytes.len() != self.push_size as usize {
                return Err(Error::ParameterSize {
                    expected: self.push_size,
                    actual: bytes.len(),
                });
            }
        }

        let index = pool.acquire(iteration);
        let slot = *pool.slot(index)?;
        let cmd = *self
            .command_buffers
            .get(index)
            .ok_or(Error::SlotOutOfRange {
                slot: index,
                count: self.command_buffers.len(),
            })?;

        // Idle -> Recording
        pool.wait_and_reset(device, index)?;
        self.states[index] = SubmissionState::Recording;
        device.reset_command_buffer(cmd).op("vkResetCommandBuffer")?;
        device
            .begin_command_buffer(cmd, false)
            .op("vkBeginCommandBuffer")?;

        device.cmd_bind_compute_pipeline(cmd, self.pipeline);
        device.cmd_bind_descriptor_set(cmd, self.layout, self.set);
        match params {
            ParameterBlock::Bytes(bytes) => {
                // A layout without a push range takes no push at all
                if !bytes.is_empty() {
                    device.cmd_push_constants(cmd, self.layout, bytes);
                }
                device.cmd_dispatch(cmd, groups);
                device.cmd_pipeline_barrier(cmd, Barrier::SHADER_WRITE_TO_HOST_READ);
            }
            ParameterBlock::Empty => {
                log::debug!("Iteration {}: empty parameter block, skipping dispatch", iteration);
            }
        }
        device.end_command_buffer(cmd).op("vkEndCommandBuffer")?;

        // Recording -> Submitted
        let waits: &[vk::Semaphore] = if self.armed[index] {
            std::slice::from_ref(&slot.semaphore)
        } else {
            &[]
        };
        let mut signals = vec![SemaphoreSignal::binary(slot.semaphore)];
        if let Some(timeline) = slot.timeline {
            signals.push(SemaphoreSignal::timeline(timeline, iteration + 1));
        }
        device
            .queue_submit(QueueRole::Compute, cmd, waits, &signals, slot.fence)
            .op("vkQueueSubmit")?;
        self.armed[index] = true;
        self.states[index] = SubmissionState::Submitted;

        if mode == SubmitMode::Sync {
            device
                .queue_wait_idle(QueueRole::Compute)
                .op("vkQueueWaitIdle")?;
            self.states[index] = SubmissionState::Idle;
        }

        Ok(index)
    }

    /// Block until the slot's submission has completed. Its results are
    /// visible to the host afterwards.
    pub fn wait(&mut self, device: &dyn ComputeDevice, pool: &SyncPool, slot: usize) -> Result<()> {
        pool.wait(device, slot)?;
        if let Some(state) = self.states.get_mut(slot) {
            *state = SubmissionState::Idle;
        }
        Ok(())
    }

    /// Release the pipeline, then its layout, then the command buffers
    pub fn destroy(&mut self, device: &dyn ComputeDevice) {
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout);
            self.layout = vk::PipelineLayout::null();
        }
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(QueueRole::Compute, &self.command_buffers);
            self.command_buffers.clear();
        }
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if self.pipeline != vk::Pipeline::null() {
            log::warn!("Compute pipeline {:?} dropped without destroy()", self.pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::Buffer;
    use crate::backend::host::{HostDevice, HostEvent, SPIRV_MAGIC};

    struct Rig {
        device: HostDevice,
        buffer: Buffer,
        binding: ResourceBinding,
        pool: SyncPool,
        pipeline: ComputePipeline,
    }

    impl Rig {
        fn new(slots: usize, timeline: bool) -> Self {
            Self::with_push_size(slots, timeline, 4)
        }

        fn with_push_size(slots: usize, timeline: bool, push_size: u32) -> Self {
            // Each dispatch adds its first parameter byte to the first storage byte
            let device = HostDevice::new(Box::new(|push, _, storage| {
                storage[0] = storage[0].wrapping_add(push.first().copied().unwrap_or(1));
            }));
            let buffer = Buffer::allocate(
                &device,
                16,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::SharingMode::EXCLUSIVE,
            )
            .unwrap();
            let binding = ResourceBinding::new(&device, &buffer).unwrap();
            let pool = SyncPool::new(&device, slots, timeline).unwrap();
            let pipeline =
                ComputePipeline::from_spirv(&device, &[SPIRV_MAGIC], &binding, push_size, slots)
                    .unwrap();
            Self {
                device,
                buffer,
                binding,
                pool,
                pipeline,
            }
        }

        fn fence(&self, slot: usize) -> vk::Fence {
            self.pool.slot(slot).unwrap().fence
        }

        fn teardown(mut self) {
            self.pool.wait_all(&self.device).unwrap();
            self.pipeline.destroy(&self.device);
            self.pool.destroy(&self.device);
            self.binding.destroy(&self.device);
            self.buffer.destroy(&self.device);
            assert_eq!(self.device.live_objects(), 0);
        }
    }

    #[test]
    fn sync_dispatch_completes_before_returning() {
        let mut rig = Rig::new(1, false);
        let params = [3u8, 0, 0, 0];
        rig.pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::Bytes(&params),
                [2, 2, 1],
                SubmitMode::Sync,
            )
            .unwrap();

        assert_eq!(rig.pipeline.state(0), Some(SubmissionState::Idle));
        assert_eq!(rig.device.device_bytes(rig.buffer.memory()).unwrap()[0], 3);
        assert!(rig.device.events().contains(&HostEvent::Dispatched([2, 2, 1])));
        rig.teardown();
    }

    #[test]
    fn kernel_writes_are_made_available_to_the_host() {
        let mut rig = Rig::new(1, false);
        rig.pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::of(&2u32),
                [1, 1, 1],
                SubmitMode::Async,
            )
            .unwrap();
        rig.pipeline.wait(&rig.device, &rig.pool, 0).unwrap();

        let events = rig.device.events();
        let position = |wanted: HostEvent| events.iter().position(|e| *e == wanted).unwrap();
        let pushed = position(HostEvent::Pushed(4));
        let dispatched = position(HostEvent::Dispatched([1, 1, 1]));
        let barrier = position(HostEvent::Barrier(Barrier::SHADER_WRITE_TO_HOST_READ));
        let signaled = position(HostEvent::FenceSignaled(rig.fence(0)));
        assert!(pushed < dispatched && dispatched < barrier && barrier < signaled);
        assert_eq!(
            Barrier::SHADER_WRITE_TO_HOST_READ.dst_stage,
            vk::PipelineStageFlags::HOST
        );
        rig.teardown();
    }

    #[test]
    fn layout_without_parameters_dispatches_without_a_push() {
        let mut rig = Rig::with_push_size(1, false, 0);
        rig.pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::Bytes(&[]),
                [1, 1, 1],
                SubmitMode::Sync,
            )
            .unwrap();

        let events = rig.device.events();
        assert!(events.contains(&HostEvent::Dispatched([1, 1, 1])));
        assert!(!events.iter().any(|e| matches!(e, HostEvent::Pushed(_))));
        assert_eq!(rig.device.device_bytes(rig.buffer.memory()).unwrap()[0], 1);
        rig.teardown();
    }

    #[test]
    fn reused_slot_waits_for_its_previous_fence() {
        let slots = 2;
        let mut rig = Rig::new(slots, false);
        let params = 1u32.to_ne_bytes();
        let mut cmds = Vec::new();

        for iteration in 0..=slots as u64 {
            rig.pipeline
                .dispatch(
                    &rig.device,
                    &rig.pool,
                    iteration,
                    ParameterBlock::Bytes(&params),
                    [1, 1, 1],
                    SubmitMode::Async,
                )
                .unwrap();
            if let Some(HostEvent::Submitted { cmd, .. }) = rig.device.events().last() {
                cmds.push(*cmd);
            }
            assert_eq!(
                rig.pipeline.state(rig.pool.acquire(iteration)),
                Some(SubmissionState::Submitted)
            );
        }
        assert_eq!(cmds[0], cmds[slots]);

        // Submission N reuses slot 0 and may only begin recording after
        // submission 0 signaled the slot's fence
        let events = rig.device.events();
        let signaled = events
            .iter()
            .position(|e| *e == HostEvent::FenceSignaled(rig.fence(0)))
            .unwrap();
        let begins: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == HostEvent::BeginRecording(cmds[0]))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(begins.len(), 2);
        assert!(begins[0] < signaled && signaled < begins[1]);

        rig.pipeline.wait(&rig.device, &rig.pool, 0).unwrap();
        rig.pipeline.wait(&rig.device, &rig.pool, 1).unwrap();
        assert_eq!(rig.device.device_bytes(rig.buffer.memory()).unwrap()[0], 3);
        rig.teardown();
    }

    #[test]
    fn empty_parameter_block_still_submits() {
        let mut rig = Rig::new(1, false);
        rig.pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::Empty,
                [4, 4, 1],
                SubmitMode::Sync,
            )
            .unwrap();

        let events = rig.device.events();
        assert!(!events.iter().any(|e| matches!(e, HostEvent::Dispatched(_))));
        assert!(events.contains(&HostEvent::FenceSignaled(rig.fence(0))));
        rig.teardown();
    }

    #[test]
    fn mismatched_parameter_block_is_rejected_before_waiting() {
        let mut rig = Rig::new(1, false);
        let too_long = [0u8; 8];
        let err = rig
            .pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::Bytes(&too_long),
                [1, 1, 1],
                SubmitMode::Sync,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ParameterSize { expected: 4, actual: 8 }));
        assert!(rig.device.events().is_empty());
        rig.teardown();
    }

    #[test]
    fn timeline_tracks_iteration_count() {
        let mut rig = Rig::new(1, true);
        let params = 0u32;
        for iteration in 0..3 {
            rig.pipeline
                .dispatch(
                    &rig.device,
                    &rig.pool,
                    iteration,
                    ParameterBlock::of(&params),
                    [1, 1, 1],
                    SubmitMode::Async,
                )
                .unwrap();
        }
        rig.pipeline.wait(&rig.device, &rig.pool, 0).unwrap();
        assert_eq!(rig.pool.timeline_value(&rig.device, 0).unwrap(), 3);
        rig.teardown();
    }

    #[test]
    fn failed_submission_is_reported() {
        let mut rig = Rig::new(1, false);
        rig.device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = rig
            .pipeline
            .dispatch(
                &rig.device,
                &rig.pool,
                0,
                ParameterBlock::of(&0u32),
                [1, 1, 1],
                SubmitMode::Sync,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Vulkan {
                op: "vkQueueSubmit",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));
        // The fence was reset and nothing will signal it; skip the final wait
        rig.pipeline.destroy(&rig.device);
        rig.pool.destroy(&rig.device);
        rig.binding.destroy(&rig.device);
        rig.buffer.destroy(&rig.device);
    }
}
