// Resource binding for the compute kernel
//
// The kernels declare exactly one storage buffer at set 0, binding 0. This
// owns the matching set layout, a one-set pool and the set itself.

use ash::vk;

use super::buffer::Buffer;
use super::hal::ComputeDevice;
use crate::error::{Result, VkContext};

pub struct ResourceBinding {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl ResourceBinding {
    /// Build the layout, pool and set, and point binding 0 at `buffer`
    pub fn new(device: &dyn ComputeDevice, buffer: &Buffer) -> Result<Self> {
        let layout = device
            .create_storage_set_layout()
            .op("vkCreateDescriptorSetLayout")?;

        let pool = match device.create_descriptor_pool(1).op("vkCreateDescriptorPool") {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_set_layout(layout);
                return Err(e);
            }
        };

        let set = match device
            .allocate_descriptor_set(pool, layout)
            .op("vkAllocateDescriptorSets")
        {
            Ok(set) => set,
            Err(e) => {
                device.destroy_descriptor_pool(pool);
                device.destroy_set_layout(layout);
                return Err(e);
            }
        };

        device.write_storage_buffer(set, buffer.descriptor_info());

        Ok(Self { layout, pool, set })
    }

    /// Destroying the pool frees the set with it
    pub fn destroy(&mut self, device: &dyn ComputeDevice) {
        if self.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
            self.set = vk::DescriptorSet::null();
        }
        if self.layout != vk::DescriptorSetLayout::null() {
            device.destroy_set_layout(self.layout);
            self.layout = vk::DescriptorSetLayout::null();
        }
    }
}
