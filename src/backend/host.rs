// Host Device - in-process stand-in for a Vulkan compute device
//
// Implements `ComputeDevice` without a GPU:
// - Memory lives in host allocations reached only through raw pointers, so a
//   mapping stays valid while queued work reads and writes the same bytes.
//   Non-coherent memory types keep a separate host view that only meets
//   device memory on flush/invalidate.
// - Transfer work runs on the compute queue when no transfer family exists.
// - Submissions are queued and only execute when the host waits on their
//   fence or on queue idle, like real asynchronous GPU work.
// - Dispatches run a host kernel against the bound storage buffer.
// - Protocol violations Vulkan would flag (submitting with a signaled fence,
//   resetting a fence that is still pending, mapping twice) return errors.
//
// Every interesting step is recorded as a `HostEvent` for inspection.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_void, CStr};
use std::ptr::NonNull;

use super::device::QueueFamilies;
use super::hal::{
    Barrier, ComputeDevice, DeviceLimits, QueueRole, SemaphoreKind, SemaphoreSignal,
};

/// SPIR-V magic number; the only part of a kernel the host device inspects
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Host implementation of a compute kernel.
///
/// Arguments: inline parameter bytes, work-group counts, bound storage bytes.
pub type HostKernel = Box<dyn Fn(&[u8], [u32; 3], &mut [u8])>;

/// Observable steps of the emulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    BeginRecording(vk::CommandBuffer),
    Submitted {
        queue: QueueRole,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    },
    /// Size of the parameter block delivered to the kernel
    Pushed(usize),
    Dispatched([u32; 3]),
    Barrier(Barrier),
    FenceSignaled(vk::Fence),
    FenceWaited(vk::Fence),
    FenceReset(vk::Fence),
    QueueIdle(QueueRole),
}

#[derive(Debug, Clone)]
enum Command {
    BindPipeline(vk::Pipeline),
    BindSet(vk::DescriptorSet),
    Push(Vec<u8>),
    Dispatch([u32; 3]),
    Barrier(Barrier),
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
}

/// Zeroed bytes owned through a raw pointer. References into them only live
/// for the duration of one device operation.
struct Allocation {
    ptr: NonNull<[u8]>,
}

impl Allocation {
    fn zeroed(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // SAFETY: `Box::into_raw` never returns null
        Self {
            ptr: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    fn len(&self) -> usize {
        self.ptr.len()
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    fn to_vec(&self) -> Vec<u8> {
        // SAFETY: the allocation is live and `len` bytes long
        unsafe { std::slice::from_raw_parts(self.base(), self.len()) }.to_vec()
    }

    fn slice_mut(&mut self, start: usize, end: usize) -> &mut [u8] {
        let end = end.min(self.len());
        let start = start.min(end);
        // SAFETY: the range is clamped to the allocation; the returned borrow
        // ends before any mapped pointer is used again
        unsafe { std::slice::from_raw_parts_mut(self.base().add(start), end - start) }
    }

    /// Copy `start..end` of `src` onto the same range of `self`
    fn copy_range_from(&self, src: &Allocation, start: usize, end: usize) {
        let end = end.min(self.len()).min(src.len());
        let start = start.min(end);
        // SAFETY: the range lies inside both allocations; `ptr::copy` allows
        // the source and target to be the same bytes
        unsafe { std::ptr::copy(src.base().add(start), self.base().add(start), end - start) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `Box::into_raw` and is released once
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

struct Memory {
    bytes: Allocation,
    // Host view of non-coherent memory
    shadow: Option<Allocation>,
    mapped: bool,
}

struct BufferObject {
    size: vk::DeviceSize,
    sharing_mode: vk::SharingMode,
    memory: Option<vk::DeviceMemory>,
}

struct CommandBufferObject {
    recording: bool,
    commands: Vec<Command>,
}

struct Submission {
    cmd: vk::CommandBuffer,
    commands: Vec<Command>,
    waits: Vec<vk::Semaphore>,
    signals: Vec<SemaphoreSignal>,
    fence: vk::Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    ShaderModule,
    PipelineLayout,
    Pipeline,
    SetLayout,
    DescriptorPool,
}

#[derive(Default)]
struct HostState {
    next_handle: u64,
    buffers: HashMap<u64, BufferObject>,
    memories: HashMap<u64, Memory>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, u64>,
    command_buffers: HashMap<u64, CommandBufferObject>,
    descriptor_sets: HashMap<u64, Option<vk::DescriptorBufferInfo>>,
    objects: HashMap<u64, ObjectKind>,
    pending: VecDeque<Submission>,
    events: Vec<HostEvent>,
    submit_failure: Option<vk::Result>,
}

impl HostState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn release(&mut self, raw: u64, kind: ObjectKind) {
        match self.objects.remove(&raw) {
            Some(found) if found == kind => {}
            _ => log::warn!("Host device: destroying unknown {:?} {:#x}", kind, raw),
        }
    }

    fn is_pending(&self, fence: vk::Fence) -> bool {
        self.pending.iter().any(|s| s.fence == fence)
    }
}

pub struct HostDevice {
    kernel: HostKernel,
    families: QueueFamilies,
    limits: DeviceLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<HostState>,
}

impl HostDevice {
    /// Device with device-local, host-coherent and host-cached (non-coherent)
    /// memory types and a dedicated transfer queue
    pub fn new(kernel: HostKernel) -> Self {
        Self::with_memory_types(
            kernel,
            &[
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            ],
        )
    }

    pub fn with_memory_types(kernel: HostKernel, types: &[vk::MemoryPropertyFlags]) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        for (slot, &flags) in memory_properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
            slot.heap_index = 0;
        }
        memory_properties.memory_type_count = types.len().min(vk::MAX_MEMORY_TYPES) as u32;
        memory_properties.memory_heap_count = 1;
        memory_properties.memory_heaps[0].size = 1 << 30;

        Self {
            kernel,
            families: QueueFamilies {
                compute: Some(0),
                transfer: Some(1),
            },
            limits: DeviceLimits {
                max_work_group_count: [65535, 65535, 65535],
                max_work_group_size: [1024, 1024, 64],
                max_push_constants_size: 128,
            },
            memory_properties,
            state: Mutex::new(HostState::default()),
        }
    }

    /// Drop the dedicated transfer queue so transfers share the compute queue
    pub fn without_transfer_queue(mut self) -> Self {
        self.families.transfer = None;
        self
    }

    /// The queue a role's work actually runs on
    pub fn queue_for(&self, role: QueueRole) -> QueueRole {
        match role {
            QueueRole::Transfer if self.families.transfer.is_none() => QueueRole::Compute,
            other => other,
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Make the next queue submission fail with `result`
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().submit_failure = Some(result);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    /// Number of device objects that have been created and not yet destroyed
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len()
            + state.memories.len()
            + state.fences.len()
            + state.semaphores.len()
            + state.command_buffers.len()
            + state.descriptor_sets.len()
            + state.objects.len()
    }

    /// Device-side contents of an allocation (what a kernel would see)
    pub fn device_bytes(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.memories.get(&memory.as_raw()).map(|m| m.bytes.to_vec())
    }

    pub fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        let state = self.state.lock();
        state
            .memories
            .get(&memory.as_raw())
            .is_some_and(|m| m.mapped)
    }

    pub fn sharing_mode(&self, buffer: vk::Buffer) -> Option<vk::SharingMode> {
        let state = self.state.lock();
        state.buffers.get(&buffer.as_raw()).map(|b| b.sharing_mode)
    }

    fn memory_flags(&self, type_index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties.memory_types[type_index as usize].property_flags
    }

    // ─────────────────────────────────────────────────────────────────────────
    // QUEUE EXECUTION
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute queued submissions in order until `until` (if any) has signaled
    fn drain(&self, state: &mut HostState, until: Option<vk::Fence>) {
        while let Some(submission) = state.pending.pop_front() {
            let fence = submission.fence;
            self.execute(state, submission);
            if until.is_some_and(|f| f == fence) {
                break;
            }
        }
    }

    fn execute(&self, state: &mut HostState, submission: Submission) {
        let mut bound_set = None;
        let mut push = Vec::new();

        for command in submission.commands {
            match command {
                Command::BindPipeline(_) => {}
                Command::BindSet(set) => bound_set = Some(set),
                Command::Push(bytes) => {
                    state.events.push(HostEvent::Pushed(bytes.len()));
                    push = bytes;
                }
                Command::Barrier(barrier) => state.events.push(HostEvent::Barrier(barrier)),
                Command::Dispatch(groups) => {
                    state.events.push(HostEvent::Dispatched(groups));
                    let Some(info) = bound_set
                        .and_then(|set| state.descriptor_sets.get(&set.as_raw()).copied().flatten())
                    else {
                        log::warn!("Host device: dispatch without a bound storage buffer");
                        continue;
                    };
                    let Some(memory) = state
                        .buffers
                        .get(&info.buffer.as_raw())
                        .and_then(|b| b.memory)
                    else {
                        continue;
                    };
                    if let Some(memory) = state.memories.get_mut(&memory.as_raw()) {
                        let start = info.offset as usize;
                        let end = if info.range == vk::WHOLE_SIZE {
                            memory.bytes.len()
                        } else {
                            start.saturating_add(info.range as usize)
                        };
                        (self.kernel)(&push, groups, memory.bytes.slice_mut(start, end));
                    }
                }
                Command::Copy { src, dst, size } => {
                    let bound = |buffer: vk::Buffer| {
                        state
                            .buffers
                            .get(&buffer.as_raw())
                            .and_then(|b| b.memory)
                            .and_then(|m| state.memories.get(&m.as_raw()))
                    };
                    if let (Some(source), Some(target)) = (bound(src), bound(dst)) {
                        target.bytes.copy_range_from(&source.bytes, 0, size as usize);
                    }
                }
            }
        }

        // Binary semaphores hold 0 or 1: waits consume, signals set
        for semaphore in &submission.waits {
            if let Some(counter) = state.semaphores.get_mut(&semaphore.as_raw()) {
                *counter = 0;
            }
        }
        for signal in &submission.signals {
            if let Some(counter) = state.semaphores.get_mut(&signal.semaphore.as_raw()) {
                *counter = signal.value.unwrap_or(1);
            }
        }

        if submission.fence != vk::Fence::null() {
            state.fences.insert(submission.fence.as_raw(), true);
            state.events.push(HostEvent::FenceSignaled(submission.fence));
        }
        log::trace!("Host device: executed {:?}", submission.cmd);
    }

    fn new_object(&self, kind: ObjectKind) -> u64 {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.objects.insert(raw, kind);
        raw
    }
}

impl ComputeDevice for HostDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        if info.size == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        // Concurrent sharing names at least two queue families
        if info.sharing_mode == vk::SharingMode::CONCURRENT && info.queue_family_index_count < 2 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let mut state = self.state.lock();
        let raw = state.handle();
        state.buffers.insert(
            raw,
            BufferObject {
                size: info.size,
                sharing_mode: info.sharing_mode,
                memory: None,
            },
        );
        Ok(vk::Buffer::from_raw(raw))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: (1u32 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        if memory_type_index >= self.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let flags = self.memory_flags(memory_type_index);
        let non_coherent = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        let mut state = self.state.lock();
        let raw = state.handle();
        state.memories.insert(
            raw,
            Memory {
                bytes: Allocation::zeroed(size as usize),
                shadow: non_coherent.then(|| Allocation::zeroed(size as usize)),
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.memories.contains_key(&memory.as_raw()) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let buffer = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        buffer.memory = Some(memory);
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.state.lock();
        let memory = state
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if memory.mapped || offset as usize > memory.bytes.len() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        memory.mapped = true;
        let view = memory.shadow.as_ref().unwrap_or(&memory.bytes).base();
        // SAFETY: offset was checked against the allocation length above
        Ok(unsafe { view.add(offset as usize) }.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if let Some(memory) = state.memories.get_mut(&memory.as_raw()) {
            memory.mapped = false;
        }
    }

    fn flush_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()> {
        let mut state = self.state.lock();
        let memory = state
            .memories
            .get_mut(&range.memory.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if !memory.mapped {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let (start, end) = span(range, memory.bytes.len());
        if let Some(shadow) = memory.shadow.as_ref() {
            memory.bytes.copy_range_from(shadow, start, end);
        }
        Ok(())
    }

    fn invalidate_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()> {
        let mut state = self.state.lock();
        let memory = state
            .memories
            .get_mut(&range.memory.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if !memory.mapped {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let (start, end) = span(range, memory.bytes.len());
        if let Some(shadow) = memory.shadow.as_ref() {
            shadow.copy_range_from(&memory.bytes, start, end);
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.state.lock().buffers.remove(&buffer.as_raw()).is_none() {
            log::warn!("Host device: destroying unknown buffer {:?}", buffer);
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        if self.state.lock().memories.remove(&memory.as_raw()).is_none() {
            log::warn!("Host device: freeing unknown memory {:?}", memory);
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let signaled = *state
            .fences
            .get(&fence.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;

        if !signaled {
            if !state.is_pending(fence) {
                // Nothing will ever signal it; a real device would block forever
                return Err(vk::Result::TIMEOUT);
            }
            self.drain(&mut state, Some(fence));
        }

        state.events.push(HostEvent::FenceWaited(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.is_pending(fence) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let slot = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        *slot = false;
        state.events.push(HostEvent::FenceReset(fence));
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    fn create_semaphore(&self, _kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.semaphores.insert(raw, 0);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let state = self.state.lock();
        state
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        _role: QueueRole,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = state.handle();
            state.command_buffers.insert(
                raw,
                CommandBufferObject {
                    recording: false,
                    commands: Vec::new(),
                },
            );
            out.push(vk::CommandBuffer::from_raw(raw));
        }
        Ok(out)
    }

    fn free_command_buffers(&self, _role: QueueRole, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            state.command_buffers.remove(&cmd.as_raw());
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.pending.iter().any(|s| s.cmd == cmd) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        buffer.recording = false;
        buffer.commands.clear();
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time: bool) -> VkResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        buffer.recording = true;
        buffer.commands.clear();
        state.events.push(HostEvent::BeginRecording(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if !buffer.recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        buffer.recording = false;
        Ok(())
    }

    fn cmd_bind_compute_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        record(&self.state, cmd, Command::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        record(&self.state, cmd, Command::BindSet(set));
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, data: &[u8]) {
        record(&self.state, cmd, Command::Push(data.to_vec()));
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        record(&self.state, cmd, Command::Dispatch(groups));
    }

    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: Barrier) {
        record(&self.state, cmd, Command::Barrier(barrier));
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        record(&self.state, cmd, Command::Copy { src, dst, size });
    }

    fn queue_submit(
        &self,
        role: QueueRole,
        cmd: vk::CommandBuffer,
        waits: &[vk::Semaphore],
        signals: &[SemaphoreSignal],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.submit_failure.take() {
            return Err(result);
        }

        // The fence must be unsignaled when handed to a submission
        if fence != vk::Fence::null() && state.fences.get(&fence.as_raw()) != Some(&false) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let commands = match state.command_buffers.get(&cmd.as_raw()) {
            Some(buffer) if !buffer.recording => buffer.commands.clone(),
            _ => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        };

        state.events.push(HostEvent::Submitted {
            queue: self.queue_for(role),
            cmd,
            fence,
        });
        state.pending.push_back(Submission {
            cmd,
            commands,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, role: QueueRole) -> VkResult<()> {
        let mut state = self.state.lock();
        self.drain(&mut state, None);
        state.events.push(HostEvent::QueueIdle(self.queue_for(role)));
        Ok(())
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(vk::ShaderModule::from_raw(self.new_object(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state
            .lock()
            .release(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        if push_constant_size > self.limits.max_push_constants_size {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        Ok(vk::PipelineLayout::from_raw(
            self.new_object(ObjectKind::PipelineLayout),
        ))
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        _entry_point: &CStr,
    ) -> VkResult<vk::Pipeline> {
        {
            let state = self.state.lock();
            if state.objects.get(&layout.as_raw()) != Some(&ObjectKind::PipelineLayout)
                || state.objects.get(&module.as_raw()) != Some(&ObjectKind::ShaderModule)
            {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
        }
        Ok(vk::Pipeline::from_raw(self.new_object(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state
            .lock()
            .release(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state
            .lock()
            .release(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_storage_set_layout(&self) -> VkResult<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.new_object(ObjectKind::SetLayout),
        ))
    }

    fn create_descriptor_pool(&self, _max_sets: u32) -> VkResult<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(
            self.new_object(ObjectKind::DescriptorPool),
        ))
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.descriptor_sets.insert(raw, None);
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn write_storage_buffer(&self, set: vk::DescriptorSet, info: vk::DescriptorBufferInfo) {
        let mut state = self.state.lock();
        if let Some(binding) = state.descriptor_sets.get_mut(&set.as_raw()) {
            *binding = Some(info);
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.release(pool.as_raw(), ObjectKind::DescriptorPool);
        // Sets are freed with their pool; this device only ever has one pool
        state.descriptor_sets.clear();
    }

    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .lock()
            .release(layout.as_raw(), ObjectKind::SetLayout);
    }
}

fn record(state: &Mutex<HostState>, cmd: vk::CommandBuffer, command: Command) {
    let mut state = state.lock();
    match state.command_buffers.get_mut(&cmd.as_raw()) {
        Some(buffer) if buffer.recording => buffer.commands.push(command),
        _ => log::warn!("Host device: {:?} recorded outside of a command buffer", command),
    }
}

fn span(range: &vk::MappedMemoryRange, len: usize) -> (usize, usize) {
    let start = (range.offset as usize).min(len);
    let end = if range.size == vk::WHOLE_SIZE {
        len
    } else {
        (start + range.size as usize).min(len)
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_kernel() -> HostKernel {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn submissions_run_only_when_waited_on() {
        let device = HostDevice::new(idle_kernel());
        let fence = device.create_fence(false).unwrap();
        let cmd = device.allocate_command_buffers(QueueRole::Compute, 1).unwrap()[0];
        device.begin_command_buffer(cmd, false).unwrap();
        device.cmd_dispatch(cmd, [1, 1, 1]);
        device.end_command_buffer(cmd).unwrap();
        device.queue_submit(QueueRole::Compute, cmd, &[], &[], fence).unwrap();

        assert!(!device.events().contains(&HostEvent::Dispatched([1, 1, 1])));
        device.wait_for_fence(fence, u64::MAX).unwrap();
        let events = device.events();
        assert!(events.contains(&HostEvent::Dispatched([1, 1, 1])));
        assert!(events.contains(&HostEvent::FenceSignaled(fence)));
    }

    #[test]
    fn signaled_fence_cannot_be_submitted() {
        let device = HostDevice::new(idle_kernel());
        let fence = device.create_fence(true).unwrap();
        let cmd = device.allocate_command_buffers(QueueRole::Compute, 1).unwrap()[0];
        device.begin_command_buffer(cmd, false).unwrap();
        device.end_command_buffer(cmd).unwrap();
        assert_eq!(
            device.queue_submit(QueueRole::Compute, cmd, &[], &[], fence),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
        );
    }

    #[test]
    fn waiting_on_an_orphan_fence_times_out() {
        let device = HostDevice::new(idle_kernel());
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.wait_for_fence(fence, u64::MAX), Err(vk::Result::TIMEOUT));
    }

    #[test]
    fn mapping_stays_valid_across_queue_work() {
        let device = HostDevice::new(Box::new(|_, _, storage| storage[0] += 1));
        let info = vk::BufferCreateInfo::builder().size(4).build();
        let buffer = device.create_buffer(&info).unwrap();
        let memory = device.allocate_memory(4, 1).unwrap();
        device.bind_buffer_memory(buffer, memory).unwrap();
        let set = device
            .allocate_descriptor_set(vk::DescriptorPool::null(), vk::DescriptorSetLayout::null())
            .unwrap();
        device.write_storage_buffer(
            set,
            vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        );
        let ptr = device
            .map_memory(memory, 0, vk::WHOLE_SIZE)
            .unwrap()
            .cast::<u8>();

        let fence = device.create_fence(false).unwrap();
        let cmd = device.allocate_command_buffers(QueueRole::Compute, 1).unwrap()[0];
        device.begin_command_buffer(cmd, false).unwrap();
        device.cmd_bind_descriptor_set(cmd, vk::PipelineLayout::null(), set);
        device.cmd_dispatch(cmd, [1, 1, 1]);
        device.end_command_buffer(cmd).unwrap();

        // The kernel writes the same bytes the host keeps reading through `ptr`
        for expected in 1..=3u8 {
            device.queue_submit(QueueRole::Compute, cmd, &[], &[], fence).unwrap();
            device.wait_for_fence(fence, u64::MAX).unwrap();
            device.reset_fence(fence).unwrap();
            assert_eq!(unsafe { ptr.read() }, expected);
        }
        unsafe { ptr.write(9) };
        assert_eq!(device.device_bytes(memory).unwrap()[0], 9);

        device.unmap_memory(memory);
        assert!(!device.is_mapped(memory));
        device.free_command_buffers(QueueRole::Compute, &[cmd]);
        device.destroy_fence(fence);
        device.destroy_buffer(buffer);
        device.free_memory(memory);
    }

    #[test]
    fn non_coherent_view_meets_device_memory_on_flush_and_invalidate() {
        let device = HostDevice::new(idle_kernel());
        let memory = device.allocate_memory(4, 2).unwrap();
        let ptr = device
            .map_memory(memory, 0, vk::WHOLE_SIZE)
            .unwrap()
            .cast::<u8>();
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe { ptr.write(5) };
        assert_eq!(device.device_bytes(memory).unwrap()[0], 0);
        device.flush_mapped_range(&range).unwrap();
        assert_eq!(device.device_bytes(memory).unwrap()[0], 5);

        unsafe { ptr.write(6) };
        device.invalidate_mapped_range(&range).unwrap();
        assert_eq!(unsafe { ptr.read() }, 5);

        device.unmap_memory(memory);
        device.free_memory(memory);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn transfer_role_resolves_to_compute_without_a_transfer_family() {
        let dedicated = HostDevice::new(idle_kernel());
        assert_eq!(dedicated.queue_for(QueueRole::Transfer), QueueRole::Transfer);

        let shared = HostDevice::new(idle_kernel()).without_transfer_queue();
        assert_eq!(shared.queue_for(QueueRole::Transfer), QueueRole::Compute);
        assert_eq!(shared.queue_for(QueueRole::Compute), QueueRole::Compute);
    }

    #[test]
    fn memory_cannot_be_mapped_twice() {
        let device = HostDevice::new(idle_kernel());
        let memory = device.allocate_memory(64, 1).unwrap();
        device.map_memory(memory, 0, vk::WHOLE_SIZE).unwrap();
        assert_eq!(
            device.map_memory(memory, 0, vk::WHOLE_SIZE),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        device.unmap_memory(memory);
        device.free_memory(memory);
        assert_eq!(device.live_objects(), 0);
    }
}
