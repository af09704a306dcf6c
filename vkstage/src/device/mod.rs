// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The narrow interface to the native graphics API.
//!
//! Everything in this crate that touches the device goes through [`RawDevice`]. Handles are the
//! plain `ash::vk` handle types; the trait does not track their lifetimes, which is the job of
//! the [`DeviceMemoryManager`](crate::DeviceMemoryManager) and the resource types.
//!
//! Two implementations are provided:
//!
//! - [`AshDevice`] drives a real Vulkan device through `ash`.
//! - [`SoftwareDevice`] emulates a device in host memory. It executes recorded commands when they
//!   are submitted and checks image layouts the way validation layers would.

pub use self::{
    software::{SoftwareDevice, SoftwareDeviceStatistics},
    vulkan::AshDevice,
};
use crate::{
    buffer::BufferUsage,
    format::Format,
    image::{Extent3D, ImageAspects, ImageLayout, TextureSubresource},
    memory::{MemoryProperties, MemoryRequirements},
    DeviceSize, VulkanError,
};
use ash::vk;
use std::ptr::NonNull;

mod software;
mod vulkan;

/// Operations the crate needs from a device and its queue.
///
/// Methods taking handles are `unsafe`: the caller must pass handles that were created by the
/// same device and have not been destroyed yet, and must not use a handle from several threads
/// at once.
pub trait RawDevice: Send + Sync {
    /// Returns the memory types and heaps of the device.
    fn memory_properties(&self) -> MemoryProperties;

    /// Allocates `size` bytes of memory from the memory type at `memory_type_index`.
    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    /// # Safety
    ///
    /// - `memory` must not be mapped, nor bound to a live buffer or image.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps `[offset, offset + size)` of `memory` into host memory.
    ///
    /// # Safety
    ///
    /// - `memory` must be host-visible and must not be mapped already.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError>;

    /// # Safety
    ///
    /// - `memory` must be mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Creates a buffer without memory bound to it.
    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError>;

    /// # Safety
    ///
    /// - `buffer` must have no memory bound.
    /// - `offset` must honor the memory requirements of `buffer`.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// # Safety
    ///
    /// - `buffer` must not be in use by a pending command buffer.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Creates an image without memory bound to it, in the `Undefined` layout.
    fn create_image(
        &self,
        create_info: &ImageCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError>;

    /// # Safety
    ///
    /// - `image` must have no memory bound.
    /// - `offset` must honor the memory requirements of `image`.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// # Safety
    ///
    /// - `image` must not be in use by a pending command buffer.
    unsafe fn destroy_image(&self, image: vk::Image);

    /// Allocates a one-time-submit command buffer and begins recording it.
    fn begin_commands(&self) -> Result<vk::CommandBuffer, VulkanError>;

    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    /// - The regions must lie within both buffers.
    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    /// - When the command executes, the subresources of `image` named by the regions must be in
    ///   `layout`, which must be `TransferDstOptimal` or `General`.
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    /// - When the command executes, the subresources of `image` named by the regions must be in
    ///   `layout`, which must be `TransferSrcOptimal` or `General`.
    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: ImageLayout,
        buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    /// Records image layout transitions, with access masks derived from the layouts.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ImageBarrier],
    );

    /// Blits one mip level of `image` into another with linear filtering. The source must be in
    /// `TransferSrcOptimal` and the destination in `TransferDstOptimal`.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    unsafe fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        src: vk::ImageSubresourceLayers,
        src_extent: Extent3D,
        dst: vk::ImageSubresourceLayers,
        dst_extent: Extent3D,
    );

    /// Ends `command_buffer`, submits it to the queue and blocks until the device has finished
    /// executing it. The command buffer is freed in any case.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    unsafe fn submit_and_wait(&self, command_buffer: vk::CommandBuffer)
        -> Result<(), VulkanError>;

    /// Frees `command_buffer` without submitting it.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be recording.
    unsafe fn discard_commands(&self, command_buffer: vk::CommandBuffer);
}

/// Parameters to create a native image.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    /// Whether the image can be viewed as a cube.
    pub cube_compatible: bool,
}

impl ImageCreateInfo {
    /// Returns the number of bytes the image needs when its subresources are stored tightly,
    /// mip level after mip level and, within a level, layer after layer.
    pub fn packed_size(&self) -> DeviceSize {
        (0..self.mip_levels)
            .map(|level| self.format.footprint(self.mip_extent(level)))
            .sum::<DeviceSize>()
            * DeviceSize::from(self.array_layers)
            * DeviceSize::from(self.samples)
    }

    /// Returns the extent of mip level `level`.
    pub fn mip_extent(&self, level: u32) -> Extent3D {
        let shrink = |dim: u32| (dim >> level.min(31)).max(1);

        Extent3D::new(
            shrink(self.extent.width),
            shrink(self.extent.height),
            shrink(self.extent.depth),
        )
    }
}

/// An image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspects: ImageAspects,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub subresource: TextureSubresource,
}

impl ImageBarrier {
    /// Converts the barrier to the native struct and returns it with its source and destination
    /// stages.
    pub(crate) fn to_vk(
        self,
    ) -> (
        vk::ImageMemoryBarrier<'static>,
        vk::PipelineStageFlags,
        vk::PipelineStageFlags,
    ) {
        let (src_access, src_stage) = self.old_layout.access_and_stage();
        let (dst_access, dst_stage) = self.new_layout.access_and_stage();

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(self.old_layout.into())
            .new_layout(self.new_layout.into())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource.to_range(self.aspects));

        (barrier, src_stage, dst_stage)
    }
}
