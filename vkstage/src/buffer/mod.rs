// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device-local buffers and the host-visible staging buffers that feed them.
//!
//! A [`Buffer`] lives in device-local memory, which the host can't access. Data reaches it
//! through a [`StagingBuffer`]. Buffers that the host accesses repeatedly, those created with
//! [`CpuAccessFlags`] or with [`BufferFlags::DYNAMIC_USAGE`], keep one staging buffer for their
//! whole lifetime (a *retained* staging buffer). All other buffers get a *transient* staging
//! buffer for every transfer, released as soon as the transfer has completed.

pub use self::staging::{StagingBuffer, StagingUsage};
use crate::{
    memory::allocator::MemoryRegion,
    resource::{DeviceResource, ResourceKind},
    DeviceSize, NonExhaustive,
};
use ash::vk::{self, Handle};

mod staging;

vulkan_bitflags! {
    /// Describes how a buffer is going to be used.
    BufferUsage = BufferUsageFlags(u32);

    /// The buffer can be used as a source for transfer commands.
    TRANSFER_SRC = TRANSFER_SRC,

    /// The buffer can be used as a destination for transfer commands.
    TRANSFER_DST = TRANSFER_DST,

    /// The buffer can be used as a uniform buffer in a descriptor set.
    UNIFORM_BUFFER = UNIFORM_BUFFER,

    /// The buffer can be used as a storage buffer in a descriptor set.
    STORAGE_BUFFER = STORAGE_BUFFER,

    /// The buffer can be used as an index buffer.
    INDEX_BUFFER = INDEX_BUFFER,

    /// The buffer can be used as a vertex or instance buffer.
    VERTEX_BUFFER = VERTEX_BUFFER,

    /// The buffer can be used as an indirect buffer.
    INDIRECT_BUFFER = INDIRECT_BUFFER,
}

vulkan_bitflags! {
    /// How the host may access a buffer after its creation.
    CpuAccessFlags(u32);

    /// The buffer can be mapped for reading.
    READ = 1 << 0,

    /// The buffer can be mapped for writing.
    WRITE = 1 << 1,
}

vulkan_bitflags! {
    /// Hints about how a buffer is used.
    BufferFlags(u32);

    /// The buffer is updated often, so it keeps a staging buffer for its whole lifetime even
    /// without CPU access.
    DYNAMIC_USAGE = 1 << 0,
}

/// The access requested when mapping a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CpuAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl CpuAccess {
    /// Returns the CPU access flags a buffer must have been created with to be mapped with this
    /// access.
    #[inline]
    pub fn required_flags(self) -> CpuAccessFlags {
        match self {
            CpuAccess::ReadOnly => CpuAccessFlags::READ,
            CpuAccess::WriteOnly => CpuAccessFlags::WRITE,
            CpuAccess::ReadWrite => CpuAccessFlags::READ | CpuAccessFlags::WRITE,
        }
    }

    #[inline]
    pub fn reads(self) -> bool {
        self != CpuAccess::WriteOnly
    }

    #[inline]
    pub fn writes(self) -> bool {
        self != CpuAccess::ReadOnly
    }
}

/// Parameters to create a new [`Buffer`].
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer. Must not be zero.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used. `TRANSFER_SRC` and `TRANSFER_DST` are always added.
    ///
    /// The default value is empty.
    pub usage: BufferUsage,

    /// How the host may map the buffer. A non-empty value gives the buffer a retained staging
    /// buffer.
    ///
    /// The default value is empty.
    pub cpu_access: CpuAccessFlags,

    /// The default value is empty.
    pub flags: BufferFlags,

    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferCreateInfo {
            size: 0,
            usage: BufferUsage::empty(),
            cpu_access: CpuAccessFlags::empty(),
            flags: BufferFlags::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

impl BufferCreateInfo {
    /// Returns whether a buffer created with these parameters keeps its staging buffer.
    #[inline]
    pub fn retains_staging(&self) -> bool {
        !self.cpu_access.is_empty() || self.flags.intersects(BufferFlags::DYNAMIC_USAGE)
    }

    /// Returns the usage of a retained staging buffer, which is read back from only when the
    /// host may read the buffer.
    #[inline]
    pub(crate) fn staging_usage(&self) -> StagingUsage {
        if self.cpu_access.intersects(CpuAccessFlags::READ) {
            StagingUsage::ReadWrite
        } else {
            StagingUsage::Upload
        }
    }
}

/// A range of a buffer that is mapped by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MappedRange {
    pub(crate) access: CpuAccess,
    pub(crate) offset: DeviceSize,
    pub(crate) len: DeviceSize,
}

/// A buffer in device-local memory.
///
/// Buffers are created by
/// [`TransferOrchestrator::create_buffer`](crate::TransferOrchestrator::create_buffer) and must
/// be handed back to
/// [`TransferOrchestrator::release_buffer`](crate::TransferOrchestrator::release_buffer).
#[derive(Debug)]
pub struct Buffer {
    buffer: vk::Buffer,
    size: DeviceSize,
    usage: BufferUsage,
    cpu_access: CpuAccessFlags,
    flags: BufferFlags,
    memory_region: MemoryRegion,
    staging: Option<StagingBuffer>,
    mapped: Option<MappedRange>,
}

impl Buffer {
    pub(crate) fn new(
        buffer: vk::Buffer,
        create_info: &BufferCreateInfo,
        memory_region: MemoryRegion,
        staging: Option<StagingBuffer>,
    ) -> Self {
        Buffer {
            buffer,
            size: create_info.size,
            usage: create_info.usage,
            cpu_access: create_info.cpu_access,
            flags: create_info.flags,
            memory_region,
            staging,
            mapped: None,
        }
    }

    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn cpu_access(&self) -> CpuAccessFlags {
        self.cpu_access
    }

    #[inline]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Returns the staging buffer kept for the buffer's lifetime, if any.
    #[inline]
    pub fn staging_buffer(&self) -> Option<&StagingBuffer> {
        self.staging.as_ref()
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    #[inline]
    pub(crate) fn mapped(&self) -> Option<MappedRange> {
        self.mapped
    }

    #[inline]
    pub(crate) fn set_mapped(&mut self, mapped: Option<MappedRange>) {
        self.mapped = mapped;
    }

    /// Returns whether `[offset, offset + len)` lies within the buffer.
    #[inline]
    pub(crate) fn contains(&self, offset: DeviceSize, len: DeviceSize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size)
    }

    /// Swaps in a new native buffer and region, returning the old ones.
    pub(crate) fn replace_memory(
        &mut self,
        buffer: vk::Buffer,
        memory_region: MemoryRegion,
    ) -> (vk::Buffer, MemoryRegion) {
        (
            std::mem::replace(&mut self.buffer, buffer),
            std::mem::replace(&mut self.memory_region, memory_region),
        )
    }

    pub(crate) fn into_parts(self) -> (vk::Buffer, MemoryRegion, Option<StagingBuffer>) {
        (self.buffer, self.memory_region, self.staging)
    }
}

impl DeviceResource for Buffer {
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

    #[test]
    fn retention_rule() {
        let plain = BufferCreateInfo {
            size: 64,
            usage: BufferUsage::VERTEX_BUFFER,
            ..Default::default()
        };
        assert!(!plain.retains_staging());

        let dynamic = BufferCreateInfo {
            flags: BufferFlags::DYNAMIC_USAGE,
            ..plain.clone()
        };
        assert!(dynamic.retains_staging());
        assert_eq!(dynamic.staging_usage(), StagingUsage::Upload);

        let readable = BufferCreateInfo {
            cpu_access: CpuAccessFlags::READ,
            ..plain
        };
        assert!(readable.retains_staging());
        assert_eq!(readable.staging_usage(), StagingUsage::ReadWrite);
    }

    #[test]
    fn map_access_requirements() {
        let rw = CpuAccessFlags::READ | CpuAccessFlags::WRITE;

        assert!(rw.contains(CpuAccess::ReadWrite.required_flags()));
        assert!(!CpuAccessFlags::WRITE.contains(CpuAccess::ReadOnly.required_flags()));
        assert!(CpuAccess::ReadWrite.reads() && CpuAccess::ReadWrite.writes());
        assert!(!CpuAccess::WriteOnly.reads());
    }
}
