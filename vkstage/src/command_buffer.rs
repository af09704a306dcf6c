// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording of one-shot transfer command buffers.
//!
//! A [`CommandRecorder`] is begun, filled with copies and layout transitions, and consumed by
//! [`CommandRecorder::flush`], which submits it and blocks until the device has executed it.
//! Nothing recorded is visible to the host before `flush` returns. A recorder dropped without
//! being flushed discards its commands.

use crate::{
    device::{ImageBarrier, RawDevice},
    format::Format,
    image::{Extent3D, ImageLayout, Offset3D, TextureSubresource},
    DeviceSize, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;

/// A command buffer being recorded.
pub struct CommandRecorder<'a> {
    device: &'a dyn RawDevice,
    command_buffer: vk::CommandBuffer,
    command_count: usize,
    submitted: bool,
}

impl<'a> CommandRecorder<'a> {
    /// Begins a new one-time-submit command buffer.
    pub fn begin(device: &'a dyn RawDevice) -> Result<Self, VulkanError> {
        let command_buffer = device.begin_commands()?;

        Ok(CommandRecorder {
            device,
            command_buffer,
            command_count: 0,
            submitted: false,
        })
    }

    /// Returns the number of commands recorded so far.
    #[inline]
    pub fn command_count(&self) -> usize {
        self.command_count
    }

    /// Records a copy of `size` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
    ///
    /// # Safety
    ///
    /// - Both buffers must be alive until the recorder is flushed.
    /// - Both ranges must lie within their buffers.
    pub unsafe fn record_copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: DeviceSize,
        src_offset: DeviceSize,
        dst_offset: DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };

        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src, dst, &[region])
        };
        self.command_count += 1;
    }

    /// Records a copy of tightly packed texel data at the start of `buffer` into a box of
    /// `image`. The subresource must be in `TransferDstOptimal` when the copy executes.
    ///
    /// # Safety
    ///
    /// - `buffer` and `image` must be alive until the recorder is flushed.
    /// - `buffer` must hold the footprint of the box for every layer of `subresource`.
    pub unsafe fn record_copy_buffer_to_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        format: Format,
        offset: Offset3D,
        extent: Extent3D,
        subresource: TextureSubresource,
    ) {
        unsafe {
            self.record_copy_buffer_to_image_at(0, buffer, image, format, offset, extent, subresource)
        };
    }

    /// Like [`record_copy_buffer_to_image`](Self::record_copy_buffer_to_image), with the data
    /// starting at `buffer_offset` instead of the start of the buffer.
    pub(crate) unsafe fn record_copy_buffer_to_image_at(
        &mut self,
        buffer_offset: DeviceSize,
        buffer: vk::Buffer,
        image: vk::Image,
        format: Format,
        offset: Offset3D,
        extent: Extent3D,
        subresource: TextureSubresource,
    ) {
        let region =
            buffer_image_copy(format, offset, extent, subresource).buffer_offset(buffer_offset);

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                buffer,
                image,
                ImageLayout::TransferDstOptimal,
                &[region],
            )
        };
        self.command_count += 1;
    }

    /// Records a copy of a box of `image` into the start of `buffer`, tightly packed. The
    /// subresource must be in `TransferSrcOptimal` when the copy executes.
    ///
    /// # Safety
    ///
    /// - `buffer` and `image` must be alive until the recorder is flushed.
    /// - `buffer` must be large enough for the footprint of the box for every layer of
    ///   `subresource`.
    pub unsafe fn record_copy_image_to_buffer(
        &mut self,
        image: vk::Image,
        format: Format,
        offset: Offset3D,
        extent: Extent3D,
        subresource: TextureSubresource,
        buffer: vk::Buffer,
    ) {
        let region = buffer_image_copy(format, offset, extent, subresource);

        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer,
                image,
                ImageLayout::TransferSrcOptimal,
                buffer,
                &[region],
            )
        };
        self.command_count += 1;
    }

    /// Records a transition of `subresource` of `image` from `old_layout` to `new_layout`.
    ///
    /// # Safety
    ///
    /// - `image` must be alive until the recorder is flushed.
    /// - `old_layout` must be the layout of the subresource when the barrier executes, or
    ///   `Undefined`, which discards the contents.
    pub unsafe fn record_transition(
        &mut self,
        image: vk::Image,
        format: Format,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        subresource: TextureSubresource,
    ) {
        unsafe {
            self.record_transitions(&[ImageBarrier {
                image,
                aspects: format.aspects(),
                old_layout,
                new_layout,
                subresource,
            }])
        };
    }

    /// Records several transitions as one barrier.
    ///
    /// # Safety
    ///
    /// Same as [`record_transition`](Self::record_transition), for every barrier.
    pub unsafe fn record_transitions(&mut self, barriers: &[ImageBarrier]) {
        if barriers.is_empty() {
            return;
        }

        unsafe {
            self.device
                .cmd_pipeline_barrier(self.command_buffer, barriers)
        };
        self.command_count += 1;
    }

    /// Records a linear-filtered blit of mip level `src_level` into `dst_level`, for the layers
    /// of `subresource`.
    ///
    /// # Safety
    ///
    /// - `image` must be alive until the recorder is flushed.
    /// - The source level must be in `TransferSrcOptimal` and the destination level in
    ///   `TransferDstOptimal` when the blit executes.
    pub(crate) unsafe fn record_blit(
        &mut self,
        image: vk::Image,
        format: Format,
        subresource: TextureSubresource,
        (src_level, src_extent): (u32, Extent3D),
        (dst_level, dst_extent): (u32, Extent3D),
    ) {
        let aspects = format.copy_aspect();

        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                image,
                subresource.mip(src_level).to_layers(aspects),
                src_extent,
                subresource.mip(dst_level).to_layers(aspects),
                dst_extent,
            )
        };
        self.command_count += 1;
    }

    /// Submits the commands and blocks until the device has executed them.
    pub fn flush(mut self) -> Result<(), VulkanError> {
        self.submitted = true;

        log::debug!("flushing {} transfer commands", self.command_count);

        // SAFETY: The command buffer is recording, and consumed here.
        unsafe { self.device.submit_and_wait(self.command_buffer) }
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            // SAFETY: The command buffer was never submitted.
            unsafe { self.device.discard_commands(self.command_buffer) };
        }
    }
}

/// Builds a copy region for tightly packed data at the start of a buffer, one layer after the
/// other.
fn buffer_image_copy(
    format: Format,
    offset: Offset3D,
    extent: Extent3D,
    subresource: TextureSubresource,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource.to_layers(format.copy_aspect()))
        .image_offset(offset.into())
        .image_extent(extent.into())
}

/// Barriers for a list of `(subresource, old layout)` runs that all go to `new_layout`.
pub(crate) fn transition_runs(
    image: vk::Image,
    format: Format,
    runs: &[(TextureSubresource, ImageLayout)],
    new_layout: ImageLayout,
) -> SmallVec<[ImageBarrier; 4]> {
    runs.iter()
        .filter(|&&(_, old_layout)| old_layout != new_layout)
        .map(|&(subresource, old_layout)| ImageBarrier {
            image,
            aspects: format.aspects(),
            old_layout,
            new_layout,
            subresource,
        })
        .collect()
}
