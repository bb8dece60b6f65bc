// Kernel loading
//
// Vulkan consumes SPIR-V words. Kernels are compiled ahead of time by
// build.rs (or by hand with glslc) and read from disk at startup, before any
// GPU object exists.

use ash::vk;
use std::path::Path;

use super::hal::ComputeDevice;
use crate::error::{Error, Result, VkContext};

/// Read a SPIR-V file into aligned words
pub fn read_kernel(path: &Path) -> Result<Vec<u32>> {
    let mut file = std::fs::File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::KernelNotFound(path.to_path_buf())
        } else {
            Error::KernelRead {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    // read_spv handles alignment and endianness
    let code = ash::util::read_spv(&mut file).map_err(|source| Error::KernelRead {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Loaded kernel {:?} ({} words)", path, code.len());
    Ok(code)
}

pub fn create_module(device: &dyn ComputeDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    device
        .create_shader_module(code)
        .op("vkCreateShaderModule")
}
