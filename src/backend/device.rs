// Vulkan compute device
//
// Responsibilities:
// - Instance, optionally with the Khronos validation layer
// - Physical device selection (prefer discrete GPU with a compute family)
// - Logical device + compute queue (+ dedicated transfer queue if present)
// - One command pool per queue role
// - Forwarding the `ComputeDevice` operations to ash

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::{c_void, CStr, CString};

use super::hal::{
    Barrier, ComputeDevice, DeviceLimits, QueueRole, SemaphoreKind, SemaphoreSignal,
};

/// Queue family indices picked for compute work.
///
/// Produced by a pure query over the family properties and passed around by
/// value, so nothing depends on hidden device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilies {
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilies {
    /// Pick the first compute-capable family and the first transfer family
    /// that is neither graphics-capable nor the compute family itself.
    /// Sparse binding support is ignored when classifying families.
    pub fn query(families: &[vk::QueueFamilyProperties]) -> Self {
        let mut found = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let flags = family.queue_flags & !vk::QueueFlags::SPARSE_BINDING;

            if found.compute.is_none() && flags.contains(vk::QueueFlags::COMPUTE) {
                found.compute = Some(index);
                continue;
            }

            if found.transfer.is_none()
                && flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
            {
                found.transfer = Some(index);
            }
        }
        found
    }

    pub fn is_complete(&self) -> bool {
        self.compute.is_some()
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer.is_some()
    }

    /// Compute and transfer family when transfers run on a family of their own
    pub fn distinct(&self) -> Option<[u32; 2]> {
        match (self.compute, self.transfer) {
            (Some(compute), Some(transfer)) if compute != transfer => Some([compute, transfer]),
            _ => None,
        }
    }
}

/// Options for context bootstrap
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub timeline_semaphores: bool,
}

struct QueueSlot {
    queue: vk::Queue,
    pool: vk::CommandPool,
}

/// Compute-only Vulkan context; destroys its handles on drop
pub struct VulkanDevice {
    // Raw handles, torn down in reverse in Drop
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    families: QueueFamilies,
    compute: QueueSlot,
    transfer: Option<QueueSlot>,

    // Present only with validation
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Queried once at creation
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub timeline_semaphores: bool,
}

impl VulkanDevice {
    /// Create a compute-only Vulkan device
    pub fn new(options: &DeviceOptions) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", options.app_name);

        // Loader
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Instance
        let instance =
            Self::create_instance(&entry, &options.app_name, options.enable_validation)?;

        // Messenger routes validation output into `log`
        let debug_utils = if options.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Physical device with a compute family
        let (physical_device, families) = Self::pick_physical_device(&instance)?;
        let compute_family = families
            .compute
            .context("Selected GPU has no compute queue family")?;

        // Timeline semaphores only when supported and requested
        let timeline_semaphores = options.timeline_semaphores
            && Self::supports_timeline_semaphores(&instance, physical_device);
        if options.timeline_semaphores && !timeline_semaphores {
            log::warn!("Timeline semaphores requested but not supported; using binary only");
        }

        // Logical device
        let device =
            Self::create_logical_device(&instance, physical_device, &families, timeline_semaphores)?;

        // Queues and one command pool per role
        let compute = Self::create_queue_slot(&device, compute_family)?;
        let transfer = match families.transfer {
            Some(family) => Some(Self::create_queue_slot(&device, family)?),
            None => None,
        };

        // Limits and memory types
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "Queues: compute family {}, transfer family {}",
            compute_family,
            families
                .transfer
                .map_or_else(|| "shared".to_string(), |f| f.to_string())
        );

        Ok(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            families,
            compute,
            transfer,
            debug_utils,
            properties,
            memory_properties,
            timeline_semaphores,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vk-integrate")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // No surface extensions: this is a headless compute context
        let extensions = if enable_validation {
            vec![ash::extensions::ext::DebugUtils::name().as_ptr()]
        } else {
            vec![]
        };

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };

            // The kernels compute in double precision
            if features.shader_float64 != vk::TRUE {
                continue;
            }

            let families = QueueFamilies::query(&unsafe {
                instance.get_physical_device_queue_family_properties(device)
            });
            if !families.is_complete() {
                continue;
            }

            // Score device (prefer discrete GPU, then a dedicated transfer queue)
            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if families.has_dedicated_transfer() {
                score += 10;
            }

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with float64 compute support found"))
    }

    fn supports_timeline_semaphores(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vk12);
        unsafe { instance.get_physical_device_features2(device, &mut features) };
        vk12.timeline_semaphore == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
        timeline_semaphores: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .compute
            .into_iter()
            .chain(families.transfer)
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures {
            shader_float64: vk::TRUE,
            ..Default::default()
        };
        let mut vk12 =
            vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(timeline_semaphores);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&features)
            .push_next(&mut vk12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_queue_slot(device: &ash::Device, family: u32) -> Result<QueueSlot> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        // RESET: each submission re-records its command buffer
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(QueueSlot { queue, pool })
    }

    fn slot(&self, role: QueueRole) -> &QueueSlot {
        match role {
            QueueRole::Transfer => self.transfer.as_ref().unwrap_or(&self.compute),
            QueueRole::Compute => &self.compute,
        }
    }

    /// Block until every queue on the device is idle
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl ComputeDevice for VulkanDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::from_vk(&self.properties.limits)
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&alloc_info, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()> {
        unsafe { self.device.flush_mapped_memory_ranges(std::slice::from_ref(range)) }
    }

    fn invalidate_mapped_range(&self, range: &vk::MappedMemoryRange) -> VkResult<()> {
        unsafe {
            self.device
                .invalidate_mapped_memory_ranges(std::slice::from_ref(range))
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&fence_info, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        match kind {
            SemaphoreKind::Binary => {
                let info = vk::SemaphoreCreateInfo::builder();
                unsafe { self.device.create_semaphore(&info, None) }
            }
            SemaphoreKind::Timeline => {
                if !self.timeline_semaphores {
                    return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
                }
                let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(0);
                let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
                unsafe { self.device.create_semaphore(&info, None) }
            }
        }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn allocate_command_buffers(
        &self,
        role: QueueRole,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.slot(role).pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&self, role: QueueRole, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(self.slot(role).pool, buffers) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn cmd_bind_compute_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline)
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            )
        }
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, layout, vk::ShaderStageFlags::COMPUTE, 0, data)
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        unsafe { self.device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]) }
    }

    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: Barrier) {
        let memory_barrier = vk::MemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            )
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) }
    }

    fn queue_submit(
        &self,
        role: QueueRole,
        cmd: vk::CommandBuffer,
        waits: &[vk::Semaphore],
        signals: &[SemaphoreSignal],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let command_buffers = [cmd];
        let wait_stages = vec![vk::PipelineStageFlags::COMPUTE_SHADER; waits.len()];
        let semaphores: Vec<_> = signals.iter().map(|s| s.semaphore).collect();
        // Binary semaphores ignore their entry in the value array
        let values: Vec<_> = signals.iter().map(|s| s.value.unwrap_or(0)).collect();

        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let mut submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&semaphores);
        if signals.iter().any(|s| s.value.is_some()) {
            submit_info = submit_info.push_next(&mut timeline_info);
        }

        unsafe {
            self.device
                .queue_submit(self.slot(role).queue, &[submit_info.build()], fence)
        }
    }

    fn queue_wait_idle(&self, role: QueueRole) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(self.slot(role).queue) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)
            .build();
        let ranges = [push_constant_range];

        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        if push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&ranges);
        }
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
    ) -> VkResult<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)?;

        Ok(pipelines[0])
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_storage_set_layout(&self) -> VkResult<vk::DescriptorSetLayout> {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .build();
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: max_sets,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);
        unsafe { self.device.create_descriptor_pool(&pool_info, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        Ok(sets[0])
    }

    fn write_storage_buffer(&self, set: vk::DescriptorSet, info: vk::DescriptorBufferInfo) {
        let buffer_infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Nothing may still be executing
        let _ = self.wait_idle();

        // Reverse creation order
        unsafe {
            if let Some(transfer) = self.transfer.take() {
                self.device.destroy_command_pool(transfer.pool, None);
            }
            self.device.destroy_command_pool(self.compute.pool, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
