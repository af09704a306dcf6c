// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::BufferUsage;
use crate::{
    memory::{
        allocator::{DeviceMemoryManager, MemoryError, MemoryRegion},
        MemoryPropertyFlags,
    },
    resource::{DeviceResource, ResourceKind},
    DeviceSize,
};
use ash::vk::{self, Handle};
use std::ptr::NonNull;

/// What a staging buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StagingUsage {
    /// The host writes to the buffer and the device copies out of it.
    Upload,

    /// The device copies into the buffer and the host reads from it.
    Readback,

    /// Both.
    ReadWrite,
}

impl StagingUsage {
    /// Returns the native usage the buffer is created with.
    #[inline]
    pub fn buffer_usage(self) -> BufferUsage {
        match self {
            StagingUsage::Upload => BufferUsage::TRANSFER_SRC,
            StagingUsage::Readback => BufferUsage::TRANSFER_DST,
            StagingUsage::ReadWrite => BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
        }
    }
}

/// A buffer in host-visible, host-coherent memory, used to move data between the host and
/// device-local resources.
///
/// A staging buffer must be destroyed with [`StagingBuffer::destroy`]; dropping it leaks its
/// native buffer and its region.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: vk::Buffer,
    memory_region: MemoryRegion,
    size: DeviceSize,
    usage: StagingUsage,
}

impl StagingBuffer {
    /// Creates a staging buffer of `size` bytes, bound to a region of host-visible, coherent
    /// memory leased from `manager`.
    pub fn new(
        manager: &mut DeviceMemoryManager,
        size: DeviceSize,
        usage: StagingUsage,
    ) -> Result<Self, MemoryError> {
        let device = manager.device().clone();
        let (buffer, requirements) = device.create_buffer(size, usage.buffer_usage())?;

        let memory_region = match manager.allocate(
            requirements,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(region) => region,
            Err(err) => {
                // SAFETY: The buffer was never used.
                unsafe { device.destroy_buffer(buffer) };
                return Err(err);
            }
        };

        let bound = manager.device_memory(&memory_region).and_then(|memory| {
            // SAFETY: The region was allocated for the requirements of `buffer`.
            unsafe { device.bind_buffer_memory(buffer, memory, memory_region.offset()) }
                .map_err(MemoryError::from)
        });

        if let Err(err) = bound {
            // SAFETY: The buffer was never used.
            unsafe { device.destroy_buffer(buffer) };
            manager.release(memory_region)?;
            return Err(err);
        }

        Ok(StagingBuffer {
            buffer,
            memory_region,
            size,
            usage,
        })
    }

    /// Creates a staging buffer holding a copy of `data`.
    pub fn new_with_data(
        manager: &mut DeviceMemoryManager,
        data: &[u8],
        usage: StagingUsage,
    ) -> Result<Self, MemoryError> {
        let staging = StagingBuffer::new(manager, data.len() as DeviceSize, usage)?;

        if let Err(err) = staging.write(manager, 0, data) {
            staging.destroy(manager)?;
            return Err(err);
        }

        Ok(staging)
    }

    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn usage(&self) -> StagingUsage {
        self.usage
    }

    fn check_range(&self, offset: DeviceSize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len as DeviceSize) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(
        &self,
        manager: &mut DeviceMemoryManager,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        self.check_range(offset, data.len())?;
        manager.write(&self.memory_region, offset, data)
    }

    /// Copies `out.len()` bytes of the buffer, starting at `offset`, into `out`.
    pub fn read(
        &self,
        manager: &mut DeviceMemoryManager,
        offset: DeviceSize,
        out: &mut [u8],
    ) -> Result<(), MemoryError> {
        self.check_range(offset, out.len())?;
        manager.read(&self.memory_region, offset, out)
    }

    /// Maps `[offset, offset + len)` of the buffer. It stays mapped until [`unmap`] is called.
    ///
    /// [`unmap`]: Self::unmap
    pub(crate) fn map(
        &self,
        manager: &mut DeviceMemoryManager,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<NonNull<u8>, MemoryError> {
        self.check_range(offset, len as usize)?;
        manager.map(&self.memory_region, offset, len)
    }

    pub(crate) fn unmap(&self, manager: &mut DeviceMemoryManager) -> Result<(), MemoryError> {
        manager.unmap(&self.memory_region)
    }

    /// Destroys the native buffer and releases its region.
    ///
    /// The device must have finished every command that uses the buffer.
    pub fn destroy(self, manager: &mut DeviceMemoryManager) -> Result<(), MemoryError> {
        // SAFETY: The caller waited for the commands using the buffer, and the buffer is consumed.
        unsafe { manager.device().destroy_buffer(self.buffer) };

        manager.release(self.memory_region)
    }
}

impl DeviceResource for StagingBuffer {
    #[inline]
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    #[inline]
    fn native_handle(&self) -> u64 {
        self.buffer.as_raw()
    }

    #[inline]
    fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    fn memory_region(&self) -> Option<&MemoryRegion> {
        Some(&self.memory_region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::SoftwareDevice, tests::init_logger};
    use std::sync::Arc;

    #[test]
    fn lifecycle() {
        init_logger();

        let device = Arc::new(SoftwareDevice::new());
        let mut manager = DeviceMemoryManager::new(device.clone(), Default::default());

        let staging =
            StagingBuffer::new_with_data(&mut manager, &[1, 2, 3, 4, 5], StagingUsage::ReadWrite)
                .unwrap();
        assert_eq!(staging.size(), 5);
        assert_eq!(device.statistics().live_buffers, 1);

        let mut out = [0; 3];
        staging.read(&mut manager, 2, &mut out).unwrap();
        assert_eq!(out, [3, 4, 5]);

        assert_eq!(
            staging.write(&mut manager, 4, &[0, 0]),
            Err(MemoryError::OutOfBounds),
        );

        // Staging memory comes from a host-visible type.
        let memory_type = manager
            .memory_type_index_for(staging.memory_region().unwrap())
            .unwrap();
        assert!(manager.memory_properties().memory_types[memory_type as usize]
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE));

        staging.destroy(&mut manager).unwrap();
        assert_eq!(device.statistics().live_buffers, 0);
        assert_eq!(manager.statistics().region_count, 0);
    }
}
