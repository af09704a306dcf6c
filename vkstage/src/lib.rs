// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory sub-allocation and staging transfers for Vulkan-style render backends.
//!
//! The crate is split in two halves:
//!
//! - The [`DeviceMemoryManager`] carves a small number of large native allocations (*chunks*)
//!   into *regions* with a first-fit, coalescing free list per chunk.
//! - The [`TransferOrchestrator`] moves data between host memory and device-local buffers and
//!   textures through host-visible *staging buffers*, recording copies and image layout
//!   transitions into one-shot command buffers that are flushed synchronously.
//!
//! Everything native goes through the [`RawDevice`] trait. [`AshDevice`] drives a real Vulkan
//! device through `ash`, while [`SoftwareDevice`] emulates one in host memory, which is what the
//! test suite runs against.
//!
//! ```
//! use std::sync::Arc;
//! use vkstage::{
//!     buffer::{BufferCreateInfo, BufferUsage},
//!     device::SoftwareDevice,
//!     memory::allocator::DeviceMemoryManagerCreateInfo,
//!     TransferOrchestrator,
//! };
//!
//! let device = Arc::new(SoftwareDevice::new());
//! let mut transfer =
//!     TransferOrchestrator::new(device, DeviceMemoryManagerCreateInfo::default());
//!
//! let mut buffer = transfer
//!     .create_buffer(
//!         &BufferCreateInfo {
//!             size: 16,
//!             usage: BufferUsage::VERTEX_BUFFER,
//!             ..Default::default()
//!         },
//!         None,
//!     )
//!     .unwrap();
//!
//! transfer.write_buffer(&mut buffer, 4, &[1, 2, 3, 4]).unwrap();
//!
//! let mut out = [0u8; 4];
//! transfer.read_buffer(&buffer, 4, &mut out).unwrap();
//! assert_eq!(out, [1, 2, 3, 4]);
//!
//! transfer.release_buffer(buffer).unwrap();
//! ```

pub use crate::{
    device::{AshDevice, RawDevice, SoftwareDevice},
    memory::allocator::{DeviceMemoryManager, MemoryError, MemoryRegion},
    resource::{DeviceResource, ResourceKind},
    transfer::{TransferError, TransferOrchestrator},
};
use std::{error::Error, fmt};

#[macro_use]
mod macros;
pub mod buffer;
pub mod command_buffer;
pub mod device;
pub mod format;
pub mod image;
pub mod memory;
pub mod mip;
pub mod resource;
pub mod transfer;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = std::num::NonZeroU64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

/// Error codes returned by the native device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    DeviceLost,
    MemoryMapFailed,
    /// A command was recorded with arguments the device rejected, for example a copy into an
    /// image subresource that is not in the layout the copy names.
    ValidationFailed,
    /// Any other native result code.
    Unknown(i32),
}

impl Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "a host memory allocation has failed"),
            VulkanError::OutOfDeviceMemory => write!(f, "a device memory allocation has failed"),
            VulkanError::DeviceLost => write!(f, "the logical or physical device has been lost"),
            VulkanError::MemoryMapFailed => write!(f, "mapping of a memory object has failed"),
            VulkanError::ValidationFailed => {
                write!(f, "the device rejected a recorded command as invalid")
            }
            VulkanError::Unknown(code) => write!(f, "unknown native error code {}", code),
        }
    }
}

impl From<ash::vk::Result> for VulkanError {
    fn from(val: ash::vk::Result) -> Self {
        match val {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => VulkanError::OutOfDeviceMemory,
            ash::vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => VulkanError::MemoryMapFailed,
            ash::vk::Result::ERROR_VALIDATION_FAILED_EXT => VulkanError::ValidationFailed,
            other => VulkanError::Unknown(other.as_raw()),
        }
    }
}

impl VulkanError {
    /// Returns whether the error is one of the out-of-memory codes.
    #[inline]
    pub fn is_out_of_memory(self) -> bool {
        matches!(
            self,
            VulkanError::OutOfHostMemory | VulkanError::OutOfDeviceMemory
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    /// Routes `log` output of the crate to the test harness.
    pub(crate) fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
