// Buffer Manager - device memory allocations and their host mappings
//
// A `Buffer` owns one `VkBuffer` plus the `VkDeviceMemory` bound to it.
// Host-visible buffers are written in place (`fast_copy`); device-local ones
// go through a transient staging buffer and a one-shot transfer (`copy`).
// Non-coherent memory needs `flush` before the GPU reads it and `invalidate`
// before the host reads it back.
//
// Buffers never change queue family ownership. A `CONCURRENT` buffer is shared
// by the compute and a dedicated transfer family, and its staging copies run
// on the transfer queue. An `EXCLUSIVE` buffer belongs to the compute family,
// so its copies are recorded on the compute queue.

use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;

use super::hal::{ComputeDevice, QueueRole};
use crate::error::{Error, Result, VkContext};

/// Find a memory type index allowed by `type_bits` that has every flag in `required`
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

pub struct Buffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    sharing_mode: vk::SharingMode,
    memory_flags: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory with at least
    /// `properties` to it.
    ///
    /// `CONCURRENT` shares the buffer between the compute and transfer
    /// families; it falls back to `EXCLUSIVE` when both are the same family.
    pub fn allocate(
        device: &dyn ComputeDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        sharing_mode: vk::SharingMode,
    ) -> Result<Self> {
        let families = device.queue_families().distinct();
        let (sharing_mode, family_indices) = match (sharing_mode, families) {
            (vk::SharingMode::CONCURRENT, Some(indices)) => {
                (vk::SharingMode::CONCURRENT, indices.to_vec())
            }
            (vk::SharingMode::CONCURRENT, None) => (vk::SharingMode::EXCLUSIVE, Vec::new()),
            (mode, _) => (mode, Vec::new()),
        };
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices);

        let handle = device.create_buffer(&buffer_info).op("vkCreateBuffer")?;
        let requirements = device.buffer_memory_requirements(handle);

        let memory_properties = device.memory_properties();
        let Some(type_index) =
            find_memory_type(memory_properties, requirements.memory_type_bits, properties)
        else {
            device.destroy_buffer(handle);
            return Err(Error::NoMemoryType {
                type_bits: requirements.memory_type_bits,
                required: properties,
            });
        };
        let memory_flags = memory_properties.memory_types[type_index as usize].property_flags;

        let memory = match device
            .allocate_memory(requirements.size, type_index)
            .op("vkAllocateMemory")
        {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(handle);
                return Err(e);
            }
        };

        if let Err(e) = device
            .bind_buffer_memory(handle, memory)
            .op("vkBindBufferMemory")
        {
            device.free_memory(memory);
            device.destroy_buffer(handle);
            return Err(e);
        }

        log::debug!(
            "Allocated buffer {:?}: {} bytes, {:?}, {:?}, memory type {} ({:?})",
            handle,
            size,
            usage,
            sharing_mode,
            type_index,
            memory_flags
        );

        Ok(Self {
            handle,
            memory,
            size,
            usage,
            sharing_mode,
            memory_flags,
            mapped: None,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn sharing_mode(&self) -> vk::SharingMode {
        self.sharing_mode
    }

    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Map the whole allocation. Mapping an already mapped buffer returns the
    /// existing pointer.
    pub fn map(&mut self, device: &dyn ComputeDevice) -> Result<NonNull<u8>> {
        self.ensure_alive()?;
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        if !self.is_host_visible() {
            return Err(Error::NotHostVisible);
        }

        let raw = device
            .map_memory(self.memory, 0, vk::WHOLE_SIZE)
            .op("vkMapMemory")?;
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(Error::Vulkan {
            op: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        })?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Release the host mapping; nothing happens when the buffer is not mapped
    pub fn unmap(&mut self, device: &dyn ComputeDevice) {
        if self.mapped.take().is_some() {
            device.unmap_memory(self.memory);
        }
    }

    /// Write `data` at the start of a host-visible buffer without any queue
    /// work. Non-coherent memory is flushed afterwards.
    pub fn fast_copy(&mut self, device: &dyn ComputeDevice, data: &[u8]) -> Result<()> {
        self.check_range(0, data.len() as u64)?;
        let ptr = self.map(device)?;

        // SAFETY: the mapping covers the whole allocation and the range was
        // checked against the buffer size
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }

        if !self.is_coherent() {
            self.flush(device, vk::WHOLE_SIZE, 0)?;
        }
        Ok(())
    }

    /// Write `data` at the start of the buffer through a transient host-visible
    /// staging buffer and a one-shot copy on a queue that may access it
    pub fn copy(&mut self, device: &dyn ComputeDevice, data: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        if !self.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(Error::MissingUsage {
                required: vk::BufferUsageFlags::TRANSFER_DST,
                usage: self.usage,
            });
        }
        self.check_range(0, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut staging = Buffer::allocate(
            device,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::SharingMode::EXCLUSIVE,
        )?;

        let role = match self.sharing_mode {
            vk::SharingMode::CONCURRENT => QueueRole::Transfer,
            _ => QueueRole::Compute,
        };
        let result = staging.fast_copy(device, data).and_then(|()| {
            submit_copy(device, role, staging.handle, self.handle, data.len() as u64)
        });

        staging.destroy(device);
        result
    }

    /// Pick `fast_copy` or the staging `copy` from the memory properties
    pub fn write(&mut self, device: &dyn ComputeDevice, data: &[u8]) -> Result<()> {
        if self.is_host_visible() {
            self.fast_copy(device, data)
        } else {
            self.copy(device, data)
        }
    }

    /// Make host writes visible to the device. No-op for coherent or
    /// unmapped memory.
    pub fn flush(
        &self,
        device: &dyn ComputeDevice,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        if self.mapped.is_none() || self.is_coherent() {
            return Ok(());
        }
        device
            .flush_mapped_range(&self.mapped_range(size, offset))
            .op("vkFlushMappedMemoryRanges")
    }

    /// Make device writes visible to the host. No-op for coherent or
    /// unmapped memory.
    pub fn invalidate(
        &self,
        device: &dyn ComputeDevice,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        if self.mapped.is_none() || self.is_coherent() {
            return Ok(());
        }
        device
            .invalidate_mapped_range(&self.mapped_range(size, offset))
            .op("vkInvalidateMappedMemoryRanges")
    }

    /// Read `count` values of `T` from the start of a host-visible buffer.
    ///
    /// The caller must have waited for every submission that writes the
    /// buffer.
    pub fn read<T: Pod>(&mut self, device: &dyn ComputeDevice, count: usize) -> Result<Vec<T>> {
        let len = count * std::mem::size_of::<T>();
        self.check_range(0, len as u64)?;
        let ptr = self.map(device)?;
        self.invalidate(device, vk::WHOLE_SIZE, 0)?;

        // SAFETY: the mapping covers the whole allocation and `len` was checked
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Whole-buffer binding for a storage descriptor
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Unmap, free the memory, then release the buffer handle. Steps already
    /// done are skipped, so calling this twice is fine.
    pub fn destroy(&mut self, device: &dyn ComputeDevice) {
        self.unmap(device);
        if self.memory != vk::DeviceMemory::null() {
            device.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
        if self.handle != vk::Buffer::null() {
            device.destroy_buffer(self.handle);
            self.handle = vk::Buffer::null();
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.handle == vk::Buffer::null() {
            return Err(Error::BufferDestroyed);
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        if offset.saturating_add(len) > self.size {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    fn mapped_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.handle != vk::Buffer::null() {
            log::warn!("Buffer {:?} dropped without destroy(); leaking it", self.handle);
        }
    }
}

fn submit_copy(
    device: &dyn ComputeDevice,
    role: QueueRole,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let cmd = device
        .allocate_command_buffers(role, 1)
        .op("vkAllocateCommandBuffers")?[0];

    let result = (|| {
        device.begin_command_buffer(cmd, true).op("vkBeginCommandBuffer")?;
        device.cmd_copy_buffer(cmd, src, dst, size);
        device.end_command_buffer(cmd).op("vkEndCommandBuffer")?;
        device
            .queue_submit(role, cmd, &[], &[], vk::Fence::null())
            .op("vkQueueSubmit")?;
        device.queue_wait_idle(role).op("vkQueueWaitIdle")
    })();

    device.free_command_buffers(role, &[cmd]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostDevice, HostEvent};

    fn device() -> HostDevice {
        HostDevice::new(Box::new(|_, _, _| {}))
    }

    fn allocate(device: &HostDevice, size: u64, properties: vk::MemoryPropertyFlags) -> Buffer {
        Buffer::allocate(
            device,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            properties,
            vk::SharingMode::EXCLUSIVE,
        )
        .unwrap()
    }

    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn memory_type_lookup_respects_type_bits() {
        let device = device();
        let props = device.memory_properties();
        assert_eq!(
            find_memory_type(props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(props, 0b100, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            find_memory_type(props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let device = device();
        for size in [4, 64, 4096] {
            let mut buffer = allocate(&device, size, COHERENT);
            buffer.map(&device).unwrap();
            assert!(device.is_mapped(buffer.memory()));
            buffer.destroy(&device);
            assert!(!buffer.is_mapped());
            buffer.destroy(&device);
            assert!(!buffer.is_mapped());
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn fast_copy_round_trips_on_coherent_memory() {
        let device = device();
        let mut buffer = allocate(&device, 16, COHERENT);
        let data: Vec<u8> = (0u8..16).collect();

        buffer.fast_copy(&device, &data).unwrap();
        assert_eq!(buffer.read::<u8>(&device, 16).unwrap(), data);
        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), data);

        buffer.destroy(&device);
    }

    #[test]
    fn non_coherent_writes_need_a_flush() {
        let device = device();
        let mut buffer = allocate(&device, 4, vk::MemoryPropertyFlags::HOST_CACHED);
        assert!(!buffer.is_coherent());

        let ptr = buffer.map(&device).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([7u8; 4].as_ptr(), ptr.as_ptr(), 4) };
        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![0; 4]);

        buffer.flush(&device, vk::WHOLE_SIZE, 0).unwrap();
        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![7; 4]);

        // fast_copy flushes on its own
        buffer.fast_copy(&device, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![1, 2, 3, 4]);

        buffer.destroy(&device);
    }

    #[test]
    fn device_local_writes_go_through_staging() {
        let device = device();
        let mut buffer = Buffer::allocate(
            &device,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::SharingMode::CONCURRENT,
        )
        .unwrap();
        let before = device.live_objects();

        buffer.write(&device, &[9; 8]).unwrap();

        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![9; 8]);
        assert_eq!(device.live_objects(), before);
        assert!(device
            .events()
            .contains(&HostEvent::QueueIdle(QueueRole::Transfer)));
        assert!(matches!(buffer.map(&device), Err(Error::NotHostVisible)));

        buffer.destroy(&device);
    }

    #[test]
    fn exclusive_buffers_are_copied_on_their_own_family() {
        let device = device();
        let mut buffer = allocate(&device, 8, vk::MemoryPropertyFlags::DEVICE_LOCAL);

        buffer.write(&device, &[4; 8]).unwrap();

        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![4; 8]);
        let events = device.events();
        assert!(events.contains(&HostEvent::QueueIdle(QueueRole::Compute)));
        assert!(!events.contains(&HostEvent::QueueIdle(QueueRole::Transfer)));

        buffer.destroy(&device);
    }

    #[test]
    fn staging_falls_back_to_the_compute_queue() {
        let device = device().without_transfer_queue();
        let mut buffer = Buffer::allocate(
            &device,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::SharingMode::CONCURRENT,
        )
        .unwrap();

        buffer.write(&device, &[3; 8]).unwrap();

        assert_eq!(device.device_bytes(buffer.memory()).unwrap(), vec![3; 8]);
        let events = device.events();
        assert!(events.contains(&HostEvent::QueueIdle(QueueRole::Compute)));
        assert!(!events.contains(&HostEvent::QueueIdle(QueueRole::Transfer)));
        assert!(events.iter().any(|e| matches!(
            e,
            HostEvent::Submitted {
                queue: QueueRole::Compute,
                ..
            }
        )));

        buffer.destroy(&device);
    }

    #[test]
    fn concurrent_sharing_spans_a_dedicated_transfer_family() {
        let dedicated = device();
        let mut shared = Buffer::allocate(
            &dedicated,
            16,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::SharingMode::CONCURRENT,
        )
        .unwrap();
        assert_eq!(shared.sharing_mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(
            dedicated.sharing_mode(shared.handle()),
            Some(vk::SharingMode::CONCURRENT)
        );
        shared.destroy(&dedicated);

        // One family for everything: nothing to share with
        let single = device().without_transfer_queue();
        let mut exclusive = Buffer::allocate(
            &single,
            16,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::SharingMode::CONCURRENT,
        )
        .unwrap();
        assert_eq!(exclusive.sharing_mode(), vk::SharingMode::EXCLUSIVE);
        assert_eq!(
            single.sharing_mode(exclusive.handle()),
            Some(vk::SharingMode::EXCLUSIVE)
        );
        exclusive.destroy(&single);
    }

    #[test]
    fn staging_copy_needs_a_transfer_destination() {
        let device = device();
        let mut buffer = Buffer::allocate(
            &device,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::SharingMode::EXCLUSIVE,
        )
        .unwrap();
        assert!(!buffer.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));

        let live = device.live_objects();
        assert!(matches!(
            buffer.write(&device, &[1; 8]),
            Err(Error::MissingUsage { .. })
        ));
        assert_eq!(device.live_objects(), live);
        assert!(device.events().is_empty());

        buffer.destroy(&device);
    }

    #[test]
    fn missing_memory_type_fails_cleanly() {
        let device = HostDevice::with_memory_types(
            Box::new(|_, _, _| {}),
            &[vk::MemoryPropertyFlags::DEVICE_LOCAL],
        );
        let result = Buffer::allocate(
            &device,
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            COHERENT,
            vk::SharingMode::EXCLUSIVE,
        );
        assert!(matches!(result, Err(Error::NoMemoryType { .. })));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn oversized_writes_are_rejected() {
        let device = device();
        let mut buffer = allocate(&device, 4, COHERENT);
        assert!(matches!(
            buffer.fast_copy(&device, &[0; 5]),
            Err(Error::OutOfBounds { len: 5, size: 4, .. })
        ));
        buffer.destroy(&device);
        assert!(matches!(buffer.map(&device), Err(Error::BufferDestroyed)));
    }
}
