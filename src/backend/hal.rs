// Device Context interface
//
// The core (buffers, sync pool, compute pipeline, convergence driver) only
// talks to the GPU through this trait. `VulkanDevice` forwards each call to
// ash; `HostDevice` emulates them in process so the whole submission protocol
// runs without a GPU.
//
// Handles are plain ash handles. Objects are owned by whoever created them and
// released through the same device; nothing here is reference counted.

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::{c_void, CStr};

use super::device::QueueFamilies;

/// Which queue (and command pool) an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Compute,
    /// Falls back to the compute queue when the device has no dedicated
    /// transfer family
    Transfer,
}

/// The subset of `VkPhysicalDeviceLimits` the core sizes dispatches with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_work_group_count: [u32; 3],
    pub max_work_group_size: [u32; 3],
    pub max_push_constants_size: u32,
}

impl DeviceLimits {
    pub fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_work_group_count: limits.max_compute_work_group_count,
            max_work_group_size: limits.max_compute_work_group_size,
            max_push_constants_size: limits.max_push_constants_size,
        }
    }

    /// Clamp a requested dispatch grid to what the device accepts
    pub fn clamp_grid(&self, grid: [u32; 3]) -> [u32; 3] {
        let mut out = [1; 3];
        for axis in 0..3 {
            out[axis] = grid[axis].clamp(1, self.max_work_group_count[axis].max(1));
        }
        out
    }
}

/// Semaphore flavour requested at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

/// One semaphore signal attached to a queue submission.
/// `value` is only meaningful for timeline semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSignal {
    pub semaphore: vk::Semaphore,
    pub value: Option<u64>,
}

impl SemaphoreSignal {
    pub fn binary(semaphore: vk::Semaphore) -> Self {
        Self { semaphore, value: None }
    }

    pub fn timeline(semaphore: vk::Semaphore, value: u64) -> Self {
        Self {
            semaphore,
            value: Some(value),
        }
    }
}

/// Execution and memory dependency recorded inside one command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl Barrier {
    /// Kernel storage writes become available to host reads once the
    /// submission's fence has signaled
    pub const SHADER_WRITE_TO_HOST_READ: Self = Self {
        src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        src_access: vk::AccessFlags::SHADER_WRITE,
        dst_stage: vk::PipelineStageFlags::HOST,
        dst_access: vk::AccessFlags::HOST_READ,
    };
}

/// Device Context as seen by the core
pub trait ComputeDevice {
    // ─────────────────────────────────────────────────────────────────────────
    // CAPABILITIES
    // ─────────────────────────────────────────────────────────────────────────
    fn queue_families(&self) -> QueueFamilies;
    fn limits(&self) -> DeviceLimits;
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    // ─────────────────────────────────────────────────────────────────────────
    // MEMORY
    // ─────────────────────────────────────────────────────────────────────────
    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32)
        -> VkResult<vk::DeviceMemory>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn flush_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()>;
    fn invalidate_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn free_memory(&self, memory: vk::DeviceMemory);

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore>;
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    fn allocate_command_buffers(&self, role: QueueRole, count: u32)
        -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, role: QueueRole, buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_bind_compute_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]);
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]);
    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: Barrier);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );
    fn queue_submit(
        &self,
        role: QueueRole,
        cmd: vk::CommandBuffer,
        waits: &[vk::Semaphore],
        signals: &[SemaphoreSignal],
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, role: QueueRole) -> VkResult<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // KERNELS AND PIPELINES
    // ─────────────────────────────────────────────────────────────────────────
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout>;
    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCE BINDING
    // ─────────────────────────────────────────────────────────────────────────
    fn create_storage_set_layout(&self) -> VkResult<vk::DescriptorSetLayout>;
    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn write_storage_buffer(&self, set: vk::DescriptorSet, info: vk::DescriptorBufferInfo);
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout);
}
