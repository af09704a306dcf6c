// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{ImageBarrier, ImageCreateInfo, RawDevice};
use crate::{
    buffer::BufferUsage,
    image::{Extent3D, ImageLayout},
    memory::{MemoryProperties, MemoryRequirements},
    DeviceSize, VulkanError,
};
use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{fmt, ptr::NonNull};

/// A [`RawDevice`] backed by a Vulkan device through `ash`.
///
/// The device, the queue and the queue family are supplied by the caller, who keeps ownership of
/// the `ash::Device` and must destroy it only after dropping the `AshDevice`. Command buffers are
/// allocated from a transient pool owned by the `AshDevice`, and every submission waits on one
/// fence that it also owns.
pub struct AshDevice {
    device: ash::Device,
    queue: vk::Queue,
    memory_properties: MemoryProperties,
    // The pool and the fence are externally synchronized objects.
    submission: Mutex<Submission>,
}

struct Submission {
    command_pool: vk::CommandPool,
    fence: vk::Fence,
}

impl AshDevice {
    /// Wraps `device` and the queue at `queue_index` of `queue_family_index`, which must support
    /// transfer operations and, for mip generation, graphics operations.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device` of `instance`.
    /// - The queue must exist, and must not be used by anyone else while the `AshDevice` lives.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Result<Self, VulkanError> {
        let memory_properties = MemoryProperties::from(&unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        });
        let queue = unsafe { device.get_device_queue(queue_family_index, queue_index) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(queue_family_index),
                None,
            )
        }?;

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(err.into());
            }
        };

        Ok(AshDevice {
            device,
            queue,
            memory_properties,
            submission: Mutex::new(Submission {
                command_pool,
                fence,
            }),
        })
    }

    /// Returns the wrapped device.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        let submission = self.submission.get_mut();

        // SAFETY: Every submission has been waited on, so neither object is in use.
        unsafe {
            self.device.destroy_fence(submission.fence, None);
            self.device
                .destroy_command_pool(submission.command_pool, None);
        }
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("device", &self.device.handle())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl RawDevice for AshDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties.clone()
    }

    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        // SAFETY: The allocate info is valid.
        Ok(unsafe { self.device.allocate_memory(&allocate_info, None) }?)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr.cast::<u8>()).ok_or(VulkanError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.into())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: The create info is valid.
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }?;
        // SAFETY: `buffer` was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        match MemoryRequirements::try_from(requirements) {
            Ok(requirements) => Ok((buffer, requirements)),
            Err(()) => {
                // SAFETY: `buffer` is not in use.
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(VulkanError::ValidationFailed)
            }
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(
        &self,
        create_info: &ImageCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError> {
        let format = create_info.format;
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;

        if format.is_depth_stencil() {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else if create_info.samples > 1 {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }

        if create_info.samples == 1 {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }

        let flags = if create_info.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(create_info.image_type)
            .format(format.into())
            .extent(create_info.extent.into())
            .mip_levels(create_info.mip_levels)
            .array_layers(create_info.array_layers)
            .samples(vk::SampleCountFlags::from_raw(create_info.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: The create info is valid.
        let image = unsafe { self.device.create_image(&image_info, None) }?;
        // SAFETY: `image` was just created.
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        match MemoryRequirements::try_from(requirements) {
            Ok(requirements) => Ok((image, requirements)),
            Err(()) => {
                // SAFETY: `image` is not in use.
                unsafe { self.device.destroy_image(image, None) };
                Err(VulkanError::ValidationFailed)
            }
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset) }?)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer, VulkanError> {
        let submission = self.submission.lock();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(submission.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: The pool is locked.
        let command_buffer = unsafe { self.device.allocate_command_buffers(&allocate_info) }?
            .pop()
            .ok_or(VulkanError::OutOfHostMemory)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: `command_buffer` was just allocated.
        if let Err(err) = unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) } {
            // SAFETY: `command_buffer` is not in use.
            unsafe {
                self.device
                    .free_command_buffers(submission.command_pool, &[command_buffer])
            };
            return Err(err.into());
        }

        Ok(command_buffer)
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, buffer, image, layout.into(), regions)
        };
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: ImageLayout,
        buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(command_buffer, image, layout.into(), buffer, regions)
        };
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ImageBarrier],
    ) {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let image_barriers: SmallVec<[_; 4]> = barriers
            .iter()
            .map(|barrier| {
                let (image_barrier, src_stage, dst_stage) = barrier.to_vk();
                src_stages |= src_stage;
                dst_stages |= dst_stage;
                image_barrier
            })
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &image_barriers,
            )
        };
    }

    unsafe fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        src: vk::ImageSubresourceLayers,
        src_extent: Extent3D,
        dst: vk::ImageSubresourceLayers,
        dst_extent: Extent3D,
    ) {
        let corner = |extent: Extent3D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: extent.depth as i32,
        };

        let blit = vk::ImageBlit::default()
            .src_subresource(src)
            .src_offsets([vk::Offset3D::default(), corner(src_extent)])
            .dst_subresource(dst)
            .dst_offsets([vk::Offset3D::default(), corner(dst_extent)]);

        unsafe {
            self.device.cmd_blit_image(
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            )
        };
    }

    unsafe fn submit_and_wait(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let submission = self.submission.lock();
        let command_buffers = [command_buffer];

        let result = (|| unsafe {
            self.device.end_command_buffer(command_buffer)?;
            self.device.reset_fences(&[submission.fence])?;

            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info], submission.fence)?;

            self.device
                .wait_for_fences(&[submission.fence], true, u64::MAX)
        })();

        // A lost device leaves the command buffer pending forever, in which case freeing it would
        // be invalid.
        if result != Err(vk::Result::ERROR_DEVICE_LOST) {
            unsafe {
                self.device
                    .free_command_buffers(submission.command_pool, &command_buffers)
            };
        }

        Ok(result?)
    }

    unsafe fn discard_commands(&self, command_buffer: vk::CommandBuffer) {
        let submission = self.submission.lock();

        unsafe {
            self.device
                .free_command_buffers(submission.command_pool, &[command_buffer])
        };
    }
}
