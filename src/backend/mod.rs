// Backend module - GPU abstraction layer
//
// Design: the core talks to a `ComputeDevice`; `VulkanDevice` is a thin
// wrapper around ash and `HostDevice` emulates it in process.
// Ownership: every GPU object has one owner and is released explicitly
// through the device that created it.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod hal;
pub mod host;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use buffer::Buffer;
pub use descriptor::ResourceBinding;
pub use device::{DeviceOptions, QueueFamilies, VulkanDevice};
pub use hal::{ComputeDevice, DeviceLimits, QueueRole};
pub use host::{HostDevice, HostKernel};
pub use pipeline::{ComputePipeline, ParameterBlock, SubmitMode, SubmissionState};
pub use sync::SyncPool;
