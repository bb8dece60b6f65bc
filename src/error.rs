// Error types and the process exit-code table
//
// Library code never terminates the process. Every failure travels up as an
// `Error` and `main` turns it into an exit code with `Error::exit_status`.

use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop an integration run
#[derive(Debug, Error)]
pub enum Error {
    /// A Vulkan call returned something other than `VK_SUCCESS`
    #[error("{op} failed: {result}")]
    Vulkan { op: &'static str, result: vk::Result },

    /// The device exposes no memory type with the requested properties
    #[error("no memory type with {required:?} among type bits {type_bits:#b}")]
    NoMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("buffer memory is not host-visible")]
    NotHostVisible,

    #[error("buffer has already been destroyed")]
    BufferDestroyed,

    #[error("buffer usage {usage:?} lacks {required:?}")]
    MissingUsage {
        required: vk::BufferUsageFlags,
        usage: vk::BufferUsageFlags,
    },

    #[error("access of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("synchronization pool needs at least one slot")]
    EmptyPool,

    #[error("synchronization slot {slot} out of range for a pool of {count}")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("timeline semaphores were not requested for this pool")]
    NoTimeline,

    #[error("parameter block is {actual} bytes, pipeline layout expects {expected}")]
    ParameterSize { expected: u32, actual: usize },

    #[error("kernel file not found: {0}")]
    KernelNotFound(PathBuf),

    #[error("failed to read kernel {path}: {source}")]
    KernelRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no integrand numbered {0} (expected 1, 2 or 3)")]
    UnknownIntegrand(u32),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(
        "target accuracy not reached after {iterations} iterations \
         (abs_err {abs_err:e}, rel_err {rel_err:e})"
    )]
    AccuracyNotReached {
        iterations: u32,
        abs_err: f64,
        rel_err: f64,
    },

    /// Context bootstrap failures (instance, physical device, queues)
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    WrongArguments = 1,
    NoSuchFunction = 2,
    UnreadableConfig = 3,
    GpuFailure = 4,
    MissingKey = 5,
    AccuracyNotReached = 6,
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status as u8)
    }
}

impl Error {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::UnknownIntegrand(_) | Error::KernelNotFound(_) => ExitStatus::NoSuchFunction,
            Error::Config(ConfigError::MissingKey(_)) => ExitStatus::MissingKey,
            Error::Config(_) => ExitStatus::UnreadableConfig,
            Error::AccuracyNotReached { .. } => ExitStatus::AccuracyNotReached,
            _ => ExitStatus::GpuFailure,
        }
    }
}

/// Attach the failing Vulkan entry point to a raw `VkResult`
pub trait VkContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> VkContext<T> for VkResult<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|result| Error::Vulkan { op, result })
    }
}
