// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Moving data between the host and device-local resources.
//!
//! The [`TransferOrchestrator`] owns the [`DeviceMemoryManager`] of a device and creates, fills,
//! reads back and releases [`Buffer`]s and [`Texture`]s. Every transfer goes through a
//! host-visible [`StagingBuffer`] and a one-shot command buffer that is flushed before the
//! operation returns, so data written to a resource is visible to the next read of it, and data
//! read from a resource is in the caller's slice when the call returns.
//!
//! # Texture layouts
//!
//! Every mip level and array layer of a texture has a tracked layout. Transfers transition the
//! subresources they touch into `TransferDstOptimal` or `TransferSrcOptimal` from whatever layout
//! they are tracked in. Writes leave them in `ShaderReadOnlyOptimal`; reads put them back in the
//! layout they were in, or in `ShaderReadOnlyOptimal` if they had never been written.
//!
//! # Host image data
//!
//! Data for textures is tightly packed, row after row, slice after slice, and layer after layer.
//! When its [`ImageFormat`] and [`DataType`] differ from those of the texture's format it is
//! converted on the host; its size is then checked against its own description. Data for
//! compressed and packed depth/stencil formats is never converted and must match the native
//! footprint exactly.

use crate::{
    buffer::{
        Buffer, BufferCreateInfo, BufferUsage, CpuAccess, MappedRange, StagingBuffer,
        StagingUsage,
    },
    command_buffer::{transition_runs, CommandRecorder},
    device::{ImageBarrier, ImageCreateInfo, RawDevice},
    format::{image_data_size, DataType, Format, ImageFormat},
    image::{
        convert::{convert_image, convert_into, generate_image, DstImage, SrcImage},
        Extent3D, ImageLayout, Offset3D, Texture, TextureDescriptor, TextureFlags, TextureRegion,
        TextureSubresource,
    },
    memory::{
        allocator::{DeviceMemoryManager, DeviceMemoryManagerCreateInfo, MemoryError, MemoryRegion},
        MemoryPropertyFlags,
    },
    mip::MipGenerator,
    resource::{DeviceResource, ResourceKind},
    DeviceSize, VulkanError,
};
use ash::vk::{self, Handle};
use smallvec::SmallVec;
use std::{borrow::Cow, error::Error, fmt, slice, sync::Arc};

/// Creates device-local resources and moves data in and out of them.
pub struct TransferOrchestrator {
    device: Arc<dyn RawDevice>,
    memory_manager: DeviceMemoryManager,
    mip_generator: MipGenerator,
    statistics: TransferStatistics,
}

impl fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("memory_manager", &self.memory_manager)
            .field("mip_generator", &self.mip_generator)
            .field("statistics", &self.statistics)
            .finish_non_exhaustive()
    }
}

/// Counters of the work a [`TransferOrchestrator`] has done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStatistics {
    pub buffer_writes: u64,
    pub buffer_reads: u64,
    pub texture_writes: u64,
    pub texture_reads: u64,
    pub mappings: u64,
    /// The number of command buffers submitted.
    pub flushes: u64,
}

impl TransferOrchestrator {
    /// Creates an orchestrator for `device`, with a memory manager configured by `create_info`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.chunk_granularity` is zero.
    pub fn new(device: Arc<dyn RawDevice>, create_info: DeviceMemoryManagerCreateInfo) -> Self {
        let memory_manager = DeviceMemoryManager::new(device.clone(), create_info);

        TransferOrchestrator {
            device,
            memory_manager,
            mip_generator: MipGenerator::new(),
            statistics: TransferStatistics::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline]
    pub fn memory_manager(&self) -> &DeviceMemoryManager {
        &self.memory_manager
    }

    /// Returns the memory manager, for leasing regions outside of buffers and textures.
    #[inline]
    pub fn memory_manager_mut(&mut self) -> &mut DeviceMemoryManager {
        &mut self.memory_manager
    }

    #[inline]
    pub fn mip_generator(&self) -> &MipGenerator {
        &self.mip_generator
    }

    #[inline]
    pub fn statistics(&self) -> TransferStatistics {
        self.statistics
    }

    /// Creates a device-local buffer, optionally filled with `initial_data`, which must be
    /// exactly `create_info.size` bytes long.
    pub fn create_buffer(
        &mut self,
        create_info: &BufferCreateInfo,
        initial_data: Option<&[u8]>,
    ) -> Result<Buffer, TransferError> {
        if create_info.size == 0 {
            return Err(TransferError::InvalidArgument(
                "buffer size must not be zero",
            ));
        }

        if initial_data.is_some_and(|data| data.len() as DeviceSize != create_info.size) {
            return Err(TransferError::InvalidArgument(
                "initial data must be exactly as large as the buffer",
            ));
        }

        let create_info = BufferCreateInfo {
            usage: create_info.usage | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            ..create_info.clone()
        };

        let (raw_buffer, memory_region) =
            self.create_device_buffer(create_info.size, create_info.usage)?;

        let staging = if create_info.retains_staging() {
            match StagingBuffer::new(
                &mut self.memory_manager,
                create_info.size,
                create_info.staging_usage(),
            ) {
                Ok(staging) => Some(staging),
                Err(err) => {
                    self.destroy_device_buffer(raw_buffer, memory_region)?;
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let buffer = Buffer::new(raw_buffer, &create_info, memory_region, staging);

        if let Some(data) = initial_data {
            if let Err(err) = self.upload_buffer(&buffer, 0, data) {
                if let Err(cleanup_err) = self.release_buffer(buffer) {
                    log::warn!("failed to release a buffer whose upload failed: {}", cleanup_err);
                }

                return Err(err);
            }
        }

        log::trace!(
            "created buffer {:?} of {} bytes, staging retained: {}",
            buffer.buffer(),
            create_info.size,
            buffer.staging_buffer().is_some(),
        );

        Ok(buffer)
    }

    /// Writes `data` into `buffer` at `offset`.
    pub fn write_buffer(
        &mut self,
        buffer: &mut Buffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), TransferError> {
        if !buffer.contains(offset, data.len() as DeviceSize) {
            return Err(TransferError::InvalidArgument(
                "written range exceeds the buffer",
            ));
        }

        if buffer.is_mapped() {
            return Err(TransferError::InvalidState("the buffer is mapped"));
        }

        if data.is_empty() {
            return Ok(());
        }

        self.upload_buffer(buffer, offset, data)?;
        self.statistics.buffer_writes += 1;

        Ok(())
    }

    /// Reads `out.len()` bytes of `buffer`, starting at `offset`, into `out`.
    pub fn read_buffer(
        &mut self,
        buffer: &Buffer,
        offset: DeviceSize,
        out: &mut [u8],
    ) -> Result<(), TransferError> {
        if !buffer.contains(offset, out.len() as DeviceSize) {
            return Err(TransferError::InvalidArgument("read range exceeds the buffer"));
        }

        if buffer.is_mapped() {
            return Err(TransferError::InvalidState("the buffer is mapped"));
        }

        if out.is_empty() {
            return Ok(());
        }

        self.download_buffer(buffer, offset, out)?;
        self.statistics.buffer_reads += 1;

        Ok(())
    }

    /// Maps `[offset, offset + len)` of `buffer` for host access through its retained staging
    /// buffer.
    ///
    /// The buffer must have been created with CPU access flags that allow `access`. With read
    /// access, the slice holds the current contents of the range; otherwise its contents are
    /// unspecified. With write access, the contents of the slice are copied into the buffer by
    /// [`unmap_buffer`].
    ///
    /// The slice borrows `buffer`, which can't be used, unmapped or released while the slice is
    /// alive.
    ///
    /// [`unmap_buffer`]: Self::unmap_buffer
    pub fn map_buffer<'b>(
        &mut self,
        buffer: &'b mut Buffer,
        access: CpuAccess,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<&'b mut [u8], TransferError> {
        if buffer.is_mapped() {
            return Err(TransferError::InvalidState("the buffer is already mapped"));
        }

        if !buffer.cpu_access().contains(access.required_flags()) {
            return Err(TransferError::InvalidState(
                "the buffer was not created with the requested CPU access",
            ));
        }

        if len == 0 || !buffer.contains(offset, len) {
            return Err(TransferError::InvalidArgument(
                "mapped range is empty or exceeds the buffer",
            ));
        }

        let staging = buffer
            .staging_buffer()
            .ok_or(TransferError::InvalidState("the buffer has no staging buffer"))?;

        if access.reads() {
            let (src, dst) = (buffer.buffer(), staging.buffer());

            submit(&*self.device, &mut self.statistics, |recorder| unsafe {
                recorder.record_copy(src, dst, len, offset, offset);
            })?;
        }

        let ptr = staging.map(&mut self.memory_manager, offset, len)?;
        buffer.set_mapped(Some(MappedRange {
            access,
            offset,
            len,
        }));
        self.statistics.mappings += 1;

        // SAFETY: The range is mapped until `unmap_buffer` or `release_buffer`, neither of which
        // can be called with `buffer` while the slice borrows it.
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len as usize) })
    }

    /// Unmaps `buffer`, copying the mapped range into the buffer if it was mapped for writing.
    pub fn unmap_buffer(&mut self, buffer: &mut Buffer) -> Result<(), TransferError> {
        let MappedRange {
            access,
            offset,
            len,
        } = buffer
            .mapped()
            .ok_or(TransferError::InvalidState("the buffer is not mapped"))?;

        let staging = buffer
            .staging_buffer()
            .ok_or(TransferError::InvalidState("the buffer has no staging buffer"))?;

        staging.unmap(&mut self.memory_manager)?;

        let result = if access.writes() {
            let (src, dst) = (staging.buffer(), buffer.buffer());

            submit(&*self.device, &mut self.statistics, |recorder| unsafe {
                recorder.record_copy(src, dst, len, offset, offset);
            })
        } else {
            Ok(())
        };

        buffer.set_mapped(None);

        Ok(result?)
    }

    /// Copies `size` bytes from `src` at `src_offset` to `dst` at `dst_offset` on the device.
    ///
    /// Both resources must be buffers: [`Buffer`]s or [`StagingBuffer`]s. The ranges may not
    /// overlap if `src` and `dst` are the same buffer.
    pub fn copy_buffer(
        &mut self,
        src: &dyn DeviceResource,
        dst: &dyn DeviceResource,
        size: DeviceSize,
        src_offset: DeviceSize,
        dst_offset: DeviceSize,
    ) -> Result<(), TransferError> {
        let is_buffer =
            |resource: &dyn DeviceResource| resource.resource_kind() == ResourceKind::Buffer;

        if !is_buffer(src) || !is_buffer(dst) {
            return Err(TransferError::InvalidArgument(
                "buffer copies need a buffer as source and destination",
            ));
        }

        let fits = |resource: &dyn DeviceResource, offset: DeviceSize| {
            offset
                .checked_add(size)
                .is_some_and(|end| end <= resource.size())
        };

        if !fits(src, src_offset) || !fits(dst, dst_offset) {
            return Err(TransferError::InvalidArgument(
                "copied range exceeds the source or the destination",
            ));
        }

        if size == 0 {
            return Ok(());
        }

        let src = vk::Buffer::from_raw(src.native_handle());
        let dst = vk::Buffer::from_raw(dst.native_handle());

        submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_copy(src, dst, size, src_offset, dst_offset);
        })?;

        Ok(())
    }

    /// Destroys `buffer` and its staging buffer, and releases their regions.
    pub fn release_buffer(&mut self, buffer: Buffer) -> Result<(), TransferError> {
        log::trace!("releasing buffer {:?}", buffer.buffer());

        let (raw_buffer, memory_region, staging) = buffer.into_parts();
        self.destroy_device_buffer(raw_buffer, memory_region)?;

        if let Some(staging) = staging {
            staging.destroy(&mut self.memory_manager)?;
        }

        Ok(())
    }

    /// Moves each of `buffers` into a freshly allocated region, then destroys every chunk left
    /// empty. Returns the number of bytes given back to the device.
    ///
    /// Since regions are allocated first-fit, buffers move towards the front of the oldest
    /// chunks, which lets the chunks they came from drain.
    pub fn defragment_buffers(
        &mut self,
        buffers: &mut [&mut Buffer],
    ) -> Result<DeviceSize, TransferError> {
        if buffers.iter().any(|buffer| buffer.is_mapped()) {
            return Err(TransferError::InvalidState("a buffer is mapped"));
        }

        let mut moved: Vec<(vk::Buffer, MemoryRegion)> = Vec::with_capacity(buffers.len());

        for buffer in buffers.iter() {
            match self.create_device_buffer(buffer.size(), buffer.usage()) {
                Ok(new) => moved.push(new),
                Err(err) => {
                    for (raw_buffer, memory_region) in moved {
                        self.destroy_device_buffer(raw_buffer, memory_region)?;
                    }

                    return Err(err);
                }
            }
        }

        let copies: SmallVec<[(vk::Buffer, vk::Buffer, DeviceSize); 8]> = buffers
            .iter()
            .zip(&moved)
            .map(|(buffer, &(dst, _))| (buffer.buffer(), dst, buffer.size()))
            .collect();

        let result = submit(&*self.device, &mut self.statistics, |recorder| {
            for &(src, dst, size) in &copies {
                unsafe { recorder.record_copy(src, dst, size, 0, 0) };
            }
        });

        if let Err(err) = result {
            for (raw_buffer, memory_region) in moved {
                self.destroy_device_buffer(raw_buffer, memory_region)?;
            }

            return Err(err.into());
        }

        for (buffer, (raw_buffer, memory_region)) in buffers.iter_mut().zip(moved) {
            let (old_buffer, old_region) = buffer.replace_memory(raw_buffer, memory_region);
            self.destroy_device_buffer(old_buffer, old_region)?;
        }

        let freed = self.memory_manager.defragment();
        log::debug!(
            "moved {} buffers, {} bytes of device memory freed",
            buffers.len(),
            freed,
        );

        Ok(freed)
    }

    /// Creates a device-local texture.
    ///
    /// With `initial_data`, the first mip level of every layer is filled from it and, with
    /// [`TextureFlags::GENERATE_MIPS`], the other levels are generated from the first. Without,
    /// every level is filled with the clear color, unless [`TextureFlags::NO_INITIAL_DATA`] is
    /// set or the format is compressed or depth/stencil, in which case the contents are
    /// undefined. Multisample textures are never filled; initial data for them is ignored.
    ///
    /// The size of `initial_data` is checked before anything is created on the device.
    pub fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        initial_data: Option<SrcImage<'_>>,
    ) -> Result<Texture, TransferError> {
        descriptor.validate().map_err(TransferError::InvalidArgument)?;

        let format = descriptor.format;
        let multisample = descriptor.texture_type.is_multisample();

        let upload = match initial_data {
            Some(_) if multisample => {
                log::warn!("ignoring initial data for a multisample texture");
                None
            }
            Some(src) => Some(prepare_upload(
                format,
                descriptor.extent,
                descriptor.array_layers,
                src,
            )?),
            None => None,
        };

        let (image, memory_region) = self.create_device_image(&ImageCreateInfo {
            image_type: descriptor.texture_type.image_type(),
            format,
            extent: descriptor.extent,
            mip_levels: descriptor.resolved_mip_levels(),
            array_layers: descriptor.array_layers,
            samples: descriptor.samples,
            cube_compatible: descriptor.texture_type.is_cube(),
        })?;
        let mut texture = Texture::new(image, descriptor, memory_region);

        let result = match upload {
            Some(data) => self.upload_initial_data(
                &mut texture,
                &data,
                descriptor.flags.intersects(TextureFlags::GENERATE_MIPS),
            ),
            None if multisample || descriptor.flags.intersects(TextureFlags::NO_INITIAL_DATA) => {
                Ok(())
            }
            None => match format.native_image_format() {
                Some(native) if !format.is_depth_stencil() => {
                    self.fill_clear_color(&mut texture, native, descriptor.clear_color)
                }
                _ => Ok(()),
            },
        };

        if let Err(err) = result {
            if let Err(cleanup_err) = self.release_texture(texture) {
                log::warn!("failed to release a texture whose upload failed: {}", cleanup_err);
            }

            return Err(err);
        }

        log::trace!(
            "created {:?} texture {:?}, {:?} {}x{}x{}, {} levels, {} layers",
            texture.texture_type(),
            texture.image(),
            format,
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.extent.depth,
            texture.mip_levels(),
            texture.array_layers(),
        );

        Ok(texture)
    }

    /// Writes `src` into `region` of `texture`, converting it to the texture's format if needed.
    ///
    /// Writes to multisample textures are skipped.
    pub fn write_texture(
        &mut self,
        texture: &mut Texture,
        region: &TextureRegion,
        src: SrcImage<'_>,
    ) -> Result<(), TransferError> {
        if texture.texture_type().is_multisample() {
            log::warn!("skipping write to multisample texture {:?}", texture.image());
            return Ok(());
        }

        texture
            .validate_region(region)
            .map_err(TransferError::InvalidArgument)?;

        let TextureRegion {
            subresource,
            offset,
            extent,
        } = *region;
        let (image, format) = (texture.image(), texture.format());

        let data = prepare_upload(format, extent, subresource.array_layers, src)?;
        let staging =
            StagingBuffer::new_with_data(&mut self.memory_manager, &data, StagingUsage::Upload)?;
        let src_buffer = staging.buffer();

        let to_dst = transition_runs(
            image,
            format,
            &texture.layout_runs(subresource),
            ImageLayout::TransferDstOptimal,
        );

        let result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_transitions(&to_dst);
            recorder.record_copy_buffer_to_image(
                src_buffer,
                image,
                format,
                offset,
                extent,
                subresource,
            );
            recorder.record_transition(
                image,
                format,
                ImageLayout::TransferDstOptimal,
                ImageLayout::ShaderReadOnlyOptimal,
                subresource,
            );
        });

        staging.destroy(&mut self.memory_manager)?;
        result?;

        texture.set_layout(subresource, ImageLayout::ShaderReadOnlyOptimal);
        self.statistics.texture_writes += 1;

        Ok(())
    }

    /// Reads `region` of `texture` into `dst`, converting it from the texture's format if
    /// needed.
    ///
    /// The size of `dst` is checked before anything is recorded. Multisample textures can't be
    /// read.
    pub fn read_texture(
        &mut self,
        texture: &mut Texture,
        region: &TextureRegion,
        mut dst: DstImage<'_>,
    ) -> Result<(), TransferError> {
        if texture.texture_type().is_multisample() {
            return Err(TransferError::InvalidArgument(
                "multisample textures can't be read back",
            ));
        }

        if is_combined_depth_stencil(texture.format()) {
            return Err(TransferError::InvalidArgument(COMBINED_DEPTH_STENCIL));
        }

        texture
            .validate_region(region)
            .map_err(TransferError::InvalidArgument)?;

        let TextureRegion {
            subresource,
            offset,
            extent,
        } = *region;
        let (image, format) = (texture.image(), texture.format());

        let layers = DeviceSize::from(subresource.array_layers);
        let footprint = format.footprint(extent) * layers;
        let texel_count = extent.texel_count() * layers;
        let conversion = format
            .native_image_format()
            .filter(|&native| native != (dst.format, dst.data_type));

        let expected = match conversion {
            Some(_) => image_data_size(dst.format, dst.data_type, texel_count),
            None => footprint,
        };
        let actual = dst.data.len() as DeviceSize;

        if actual != expected {
            return Err(TransferError::ImageDataSizeMismatch { expected, actual });
        }

        let runs = texture.layout_runs(subresource);
        let restored: SmallVec<[(TextureSubresource, ImageLayout); 4]> = runs
            .iter()
            .map(|&(subresource, layout)| {
                let layout = match layout {
                    ImageLayout::Undefined => ImageLayout::ShaderReadOnlyOptimal,
                    layout => layout,
                };

                (subresource, layout)
            })
            .collect();

        let to_src = transition_runs(image, format, &runs, ImageLayout::TransferSrcOptimal);
        let back: SmallVec<[ImageBarrier; 4]> = restored
            .iter()
            .filter(|&&(_, layout)| layout != ImageLayout::TransferSrcOptimal)
            .map(|&(subresource, layout)| ImageBarrier {
                image,
                aspects: format.aspects(),
                old_layout: ImageLayout::TransferSrcOptimal,
                new_layout: layout,
                subresource,
            })
            .collect();

        let staging =
            StagingBuffer::new(&mut self.memory_manager, footprint, StagingUsage::Readback)?;
        let dst_buffer = staging.buffer();

        let mut result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_transitions(&to_src);
            recorder.record_copy_image_to_buffer(
                image,
                format,
                offset,
                extent,
                subresource,
                dst_buffer,
            );
            recorder.record_transitions(&back);
        })
        .map_err(TransferError::from);

        if result.is_ok() {
            result = match conversion {
                Some((native_format, native_type)) => {
                    let mut native = vec![0; footprint as usize];

                    staging
                        .read(&mut self.memory_manager, 0, &mut native)
                        .map(|()| {
                            convert_into(
                                &native,
                                native_format,
                                native_type,
                                &mut dst,
                                texel_count as usize,
                            )
                        })
                        .map_err(TransferError::from)
                }
                None => staging
                    .read(&mut self.memory_manager, 0, dst.data)
                    .map_err(TransferError::from),
            };
        }

        staging.destroy(&mut self.memory_manager)?;
        result?;

        for (subresource, layout) in restored {
            texture.set_layout(subresource, layout);
        }

        self.statistics.texture_reads += 1;

        Ok(())
    }

    /// Destroys `texture` and releases its region.
    pub fn release_texture(&mut self, texture: Texture) -> Result<(), TransferError> {
        log::trace!("releasing texture {:?}", texture.image());

        let (image, memory_region) = texture.into_parts();

        // SAFETY: Every transfer is flushed before it returns, so the device no longer uses
        // the image.
        unsafe { self.device.destroy_image(image) };
        self.memory_manager.release(memory_region)?;

        Ok(())
    }

    fn create_device_buffer(
        &mut self,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<(vk::Buffer, MemoryRegion), TransferError> {
        let (buffer, requirements) = self.device.create_buffer(size, usage)?;

        let memory_region = match self
            .memory_manager
            .allocate(requirements, MemoryPropertyFlags::DEVICE_LOCAL)
        {
            Ok(memory_region) => memory_region,
            Err(err) => {
                // SAFETY: The buffer was never used.
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(err.into());
            }
        };

        let bound = match self.memory_manager.device_memory(&memory_region) {
            // SAFETY: The region was allocated for the requirements of `buffer`.
            Ok(memory) => unsafe {
                self.device
                    .bind_buffer_memory(buffer, memory, memory_region.offset())
            }
            .map_err(TransferError::from),
            Err(err) => Err(err.into()),
        };

        if let Err(err) = bound {
            self.destroy_device_buffer(buffer, memory_region)?;
            return Err(err);
        }

        Ok((buffer, memory_region))
    }

    fn destroy_device_buffer(
        &mut self,
        buffer: vk::Buffer,
        memory_region: MemoryRegion,
    ) -> Result<(), TransferError> {
        // SAFETY: Every transfer is flushed before it returns, so the device no longer uses
        // the buffer.
        unsafe { self.device.destroy_buffer(buffer) };
        self.memory_manager.release(memory_region)?;

        Ok(())
    }

    fn create_device_image(
        &mut self,
        create_info: &ImageCreateInfo,
    ) -> Result<(vk::Image, MemoryRegion), TransferError> {
        let (image, requirements) = self.device.create_image(create_info)?;

        let memory_region = match self
            .memory_manager
            .allocate(requirements, MemoryPropertyFlags::DEVICE_LOCAL)
        {
            Ok(memory_region) => memory_region,
            Err(err) => {
                // SAFETY: The image was never used.
                unsafe { self.device.destroy_image(image) };
                return Err(err.into());
            }
        };

        let bound = match self.memory_manager.device_memory(&memory_region) {
            // SAFETY: The region was allocated for the requirements of `image`.
            Ok(memory) => unsafe {
                self.device
                    .bind_image_memory(image, memory, memory_region.offset())
            }
            .map_err(TransferError::from),
            Err(err) => Err(err.into()),
        };

        if let Err(err) = bound {
            // SAFETY: The image was never used.
            unsafe { self.device.destroy_image(image) };
            self.memory_manager.release(memory_region)?;
            return Err(err);
        }

        Ok((image, memory_region))
    }

    /// Copies `data` into `buffer` at `offset`, through the retained staging buffer if there is
    /// one.
    fn upload_buffer(
        &mut self,
        buffer: &Buffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let dst = buffer.buffer();
        let len = data.len() as DeviceSize;

        if let Some(staging) = buffer.staging_buffer() {
            staging.write(&mut self.memory_manager, offset, data)?;
            let src = staging.buffer();

            submit(&*self.device, &mut self.statistics, |recorder| unsafe {
                recorder.record_copy(src, dst, len, offset, offset);
            })?;

            return Ok(());
        }

        let staging =
            StagingBuffer::new_with_data(&mut self.memory_manager, data, StagingUsage::Upload)?;
        let src = staging.buffer();

        let result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_copy(src, dst, len, 0, offset);
        });

        staging.destroy(&mut self.memory_manager)?;

        Ok(result?)
    }

    /// Copies `out.len()` bytes of `buffer` at `offset` into `out`, through the retained staging
    /// buffer if it can be read back from.
    fn download_buffer(
        &mut self,
        buffer: &Buffer,
        offset: DeviceSize,
        out: &mut [u8],
    ) -> Result<(), TransferError> {
        let src = buffer.buffer();
        let len = out.len() as DeviceSize;

        let retained = buffer
            .staging_buffer()
            .filter(|staging| staging.usage() != StagingUsage::Upload);

        if let Some(staging) = retained {
            let dst = staging.buffer();

            submit(&*self.device, &mut self.statistics, |recorder| unsafe {
                recorder.record_copy(src, dst, len, offset, offset);
            })?;
            staging.read(&mut self.memory_manager, offset, out)?;

            return Ok(());
        }

        let staging = StagingBuffer::new(&mut self.memory_manager, len, StagingUsage::Readback)?;
        let dst = staging.buffer();

        let mut result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_copy(src, dst, len, offset, 0);
        })
        .map_err(TransferError::from);

        if result.is_ok() {
            result = staging
                .read(&mut self.memory_manager, 0, out)
                .map_err(TransferError::from);
        }

        staging.destroy(&mut self.memory_manager)?;

        result
    }

    /// Fills the first level of every layer of a new texture with `data`, and the others by
    /// generating mips if requested.
    fn upload_initial_data(
        &mut self,
        texture: &mut Texture,
        data: &[u8],
        generate_mips: bool,
    ) -> Result<(), TransferError> {
        let (image, format, extent) = (texture.image(), texture.format(), texture.extent());
        let full = texture.full_subresource();
        let base = full.mip(0);

        let staging =
            StagingBuffer::new_with_data(&mut self.memory_manager, data, StagingUsage::Upload)?;
        let src = staging.buffer();
        let mip_generator = &self.mip_generator;

        let result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_transition(
                image,
                format,
                ImageLayout::Undefined,
                ImageLayout::TransferDstOptimal,
                full,
            );
            recorder.record_copy_buffer_to_image(
                src,
                image,
                format,
                Offset3D::default(),
                extent,
                base,
            );

            let generated = generate_mips
                && mip_generator.generate(
                    recorder,
                    &mut *texture,
                    full,
                    ImageLayout::ShaderReadOnlyOptimal,
                );

            if !generated {
                recorder.record_transition(
                    image,
                    format,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::ShaderReadOnlyOptimal,
                    full,
                );
            }
        });

        staging.destroy(&mut self.memory_manager)?;
        result?;

        texture.set_layout(full, ImageLayout::ShaderReadOnlyOptimal);

        Ok(())
    }

    /// Fills every level and layer of a new texture with `color`.
    fn fill_clear_color(
        &mut self,
        texture: &mut Texture,
        (native_format, native_type): (ImageFormat, DataType),
        color: [f64; 4],
    ) -> Result<(), TransferError> {
        let (image, format) = (texture.image(), texture.format());
        let full = texture.full_subresource();
        let layers = DeviceSize::from(texture.array_layers());

        let mut data = Vec::new();
        let mut levels: SmallVec<[(DeviceSize, Extent3D); 16]> = SmallVec::new();

        for level in 0..texture.mip_levels() {
            let extent = texture.mip_extent(level);
            levels.push((data.len() as DeviceSize, extent));
            data.extend_from_slice(&generate_image(
                native_format,
                native_type,
                (extent.texel_count() * layers) as usize,
                color,
            ));
        }

        let staging =
            StagingBuffer::new_with_data(&mut self.memory_manager, &data, StagingUsage::Upload)?;
        let src = staging.buffer();

        let result = submit(&*self.device, &mut self.statistics, |recorder| unsafe {
            recorder.record_transition(
                image,
                format,
                ImageLayout::Undefined,
                ImageLayout::TransferDstOptimal,
                full,
            );

            for (level, &(buffer_offset, extent)) in (0..).zip(&levels) {
                recorder.record_copy_buffer_to_image_at(
                    buffer_offset,
                    src,
                    image,
                    format,
                    Offset3D::default(),
                    extent,
                    full.mip(level),
                );
            }

            recorder.record_transition(
                image,
                format,
                ImageLayout::TransferDstOptimal,
                ImageLayout::ShaderReadOnlyOptimal,
                full,
            );
        });

        staging.destroy(&mut self.memory_manager)?;
        result?;

        texture.set_layout(full, ImageLayout::ShaderReadOnlyOptimal);
        log::debug!("filled texture {:?} with {:?}", image, color);

        Ok(())
    }
}

/// Records commands into a new command buffer and flushes it.
fn submit(
    device: &dyn RawDevice,
    statistics: &mut TransferStatistics,
    record: impl FnOnce(&mut CommandRecorder<'_>),
) -> Result<(), VulkanError> {
    let mut recorder = CommandRecorder::begin(device)?;
    record(&mut recorder);
    statistics.flushes += 1;

    recorder.flush()
}

const COMBINED_DEPTH_STENCIL: &str = "data of combined depth/stencil formats can't be transferred";

// The depth and stencil aspects of these formats are laid out separately in a buffer.
fn is_combined_depth_stencil(format: Format) -> bool {
    format.is_depth() && format.is_stencil()
}

/// Checks host image data for a box of `extent` in `layers` layers of `format`, and converts it
/// to the format's native description if needed.
fn prepare_upload<'d>(
    format: Format,
    extent: Extent3D,
    layers: u32,
    src: SrcImage<'d>,
) -> Result<Cow<'d, [u8]>, TransferError> {
    if is_combined_depth_stencil(format) {
        return Err(TransferError::InvalidArgument(COMBINED_DEPTH_STENCIL));
    }

    let actual = src.data.len() as DeviceSize;
    let layers = DeviceSize::from(layers);

    if actual % layers != 0 {
        return Err(TransferError::InvalidArgument(
            "texture data must hold the same number of bytes for every array layer",
        ));
    }

    let texel_count = extent.texel_count() * layers;

    match format.native_image_format() {
        Some(native) if (src.format, src.data_type) != native => {
            let (native_format, native_type) = native;
            let expected = image_data_size(src.format, src.data_type, texel_count);

            if actual != expected {
                return Err(TransferError::ImageDataSizeMismatch { expected, actual });
            }

            Ok(
                match convert_image(&src, native_format, native_type, texel_count as usize) {
                    Some(converted) => Cow::Owned(converted),
                    None => Cow::Borrowed(src.data),
                },
            )
        }
        _ => {
            let expected = format.footprint(extent) * layers;

            if actual != expected {
                return Err(TransferError::ImageDataSizeMismatch { expected, actual });
            }

            Ok(Cow::Borrowed(src.data))
        }
    }
}

/// Error that can be returned by a [`TransferOrchestrator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferError {
    /// Host image data does not have the size its description and the addressed region require.
    ImageDataSizeMismatch {
        expected: DeviceSize,
        actual: DeviceSize,
    },

    /// An argument was invalid. No device work was done.
    InvalidArgument(&'static str),

    /// The resource is not in a state that allows the operation.
    InvalidState(&'static str),

    /// Leasing or accessing device memory failed.
    Memory(MemoryError),

    /// The device returned an error.
    Device(VulkanError),
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Memory(err) => Some(err),
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageDataSizeMismatch { expected, actual } => write!(
                f,
                "the image data is {} bytes long, but {} bytes were expected",
                actual, expected,
            ),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::Memory(_) => write!(f, "a device memory operation failed"),
            Self::Device(_) => write!(f, "the device returned an error"),
        }
    }
}

impl From<MemoryError> for TransferError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Device(err) => Self::Device(err),
            err => Self::Memory(err),
        }
    }
}

impl From<VulkanError> for TransferError {
    fn from(err: VulkanError) -> Self {
        Self::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{BufferFlags, CpuAccessFlags},
        device::SoftwareDevice,
        image::TextureType,
        tests::init_logger,
    };

    fn orchestrator() -> (Arc<SoftwareDevice>, TransferOrchestrator) {
        init_logger();

        let device = Arc::new(SoftwareDevice::new());
        let transfer = TransferOrchestrator::new(device.clone(), Default::default());

        (device, transfer)
    }

    fn buffer_info(size: DeviceSize) -> BufferCreateInfo {
        BufferCreateInfo {
            size,
            usage: BufferUsage::VERTEX_BUFFER,
            ..Default::default()
        }
    }

    fn rgba8(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor {
            extent: Extent3D::new(width, height, 1),
            ..Default::default()
        }
    }

    fn whole(texture: &Texture, level: u32) -> TextureRegion {
        TextureRegion {
            subresource: texture.full_subresource().mip(level),
            offset: Offset3D::default(),
            extent: texture.mip_extent(level),
        }
    }

    #[test]
    fn transient_staging_is_released() {
        let (device, mut transfer) = orchestrator();

        let mut buffer = transfer.create_buffer(&buffer_info(64), None).unwrap();
        assert!(buffer.staging_buffer().is_none());
        assert!(buffer
            .usage()
            .contains(BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST));

        transfer.write_buffer(&mut buffer, 8, &[7; 16]).unwrap();
        assert_eq!(device.statistics().live_buffers, 1);

        let mut out = [0; 20];
        transfer.read_buffer(&buffer, 6, &mut out).unwrap();
        assert_eq!(out[..2], [0, 0]);
        assert_eq!(out[2..18], [7; 16]);
        assert_eq!(out[18..], [0, 0]);

        let stats = transfer.statistics();
        assert_eq!((stats.buffer_writes, stats.buffer_reads, stats.flushes), (1, 1, 2));

        transfer.release_buffer(buffer).unwrap();
        assert_eq!(device.statistics().live_buffers, 0);
        assert_eq!(transfer.memory_manager().statistics().region_count, 0);
    }

    #[test]
    fn initial_data_through_retained_staging() {
        let (device, mut transfer) = orchestrator();

        let info = BufferCreateInfo {
            flags: BufferFlags::DYNAMIC_USAGE,
            ..buffer_info(4)
        };
        let buffer = transfer.create_buffer(&info, Some(&[1, 2, 3, 4])).unwrap();
        assert_eq!(
            buffer.staging_buffer().map(StagingBuffer::usage),
            Some(StagingUsage::Upload),
        );
        assert_eq!(device.statistics().live_buffers, 2);

        // Upload-only staging can't be copied into, so reads go through a transient one.
        let mut out = [0; 4];
        transfer.read_buffer(&buffer, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        transfer.release_buffer(buffer).unwrap();
        assert_eq!(device.statistics().live_buffers, 0);
    }

    #[test]
    fn invalid_buffer_arguments() {
        let (device, mut transfer) = orchestrator();

        assert!(matches!(
            transfer.create_buffer(&buffer_info(0), None),
            Err(TransferError::InvalidArgument(_)),
        ));
        assert!(matches!(
            transfer.create_buffer(&buffer_info(8), Some(&[0; 4])),
            Err(TransferError::InvalidArgument(_)),
        ));

        let mut buffer = transfer.create_buffer(&buffer_info(8), None).unwrap();
        assert!(matches!(
            transfer.write_buffer(&mut buffer, 4, &[0; 5]),
            Err(TransferError::InvalidArgument(_)),
        ));
        assert!(matches!(
            transfer.read_buffer(&buffer, DeviceSize::MAX, &mut [0; 1]),
            Err(TransferError::InvalidArgument(_)),
        ));
        assert_eq!(device.statistics().submissions, 0);

        transfer.release_buffer(buffer).unwrap();
    }

    #[test]
    fn map_write_then_read() {
        let (_device, mut transfer) = orchestrator();

        let info = BufferCreateInfo {
            cpu_access: CpuAccessFlags::READ | CpuAccessFlags::WRITE,
            ..buffer_info(32)
        };
        let mut buffer = transfer.create_buffer(&info, None).unwrap();

        let mapped = transfer
            .map_buffer(&mut buffer, CpuAccess::WriteOnly, 16, 4)
            .unwrap();
        mapped.copy_from_slice(&[9, 8, 7, 6]);
        assert!(buffer.is_mapped());

        assert!(matches!(
            transfer.map_buffer(&mut buffer, CpuAccess::ReadOnly, 0, 4),
            Err(TransferError::InvalidState(_)),
        ));
        assert!(matches!(
            transfer.write_buffer(&mut buffer, 0, &[1]),
            Err(TransferError::InvalidState(_)),
        ));

        transfer.unmap_buffer(&mut buffer).unwrap();
        assert!(matches!(
            transfer.unmap_buffer(&mut buffer),
            Err(TransferError::InvalidState(_)),
        ));

        let mut out = [0; 4];
        transfer.read_buffer(&buffer, 16, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6]);

        transfer.write_buffer(&mut buffer, 0, &[5; 4]).unwrap();
        let mapped = transfer
            .map_buffer(&mut buffer, CpuAccess::ReadOnly, 0, 20)
            .unwrap();
        assert_eq!(mapped[..4], [5; 4]);
        assert_eq!(mapped[16..], [9, 8, 7, 6]);
        transfer.unmap_buffer(&mut buffer).unwrap();

        assert_eq!(transfer.statistics().mappings, 2);
        transfer.release_buffer(buffer).unwrap();
    }

    #[test]
    fn map_requires_cpu_access() {
        let (_device, mut transfer) = orchestrator();

        let mut plain = transfer.create_buffer(&buffer_info(16), None).unwrap();
        assert!(matches!(
            transfer.map_buffer(&mut plain, CpuAccess::WriteOnly, 0, 16),
            Err(TransferError::InvalidState(_)),
        ));

        let info = BufferCreateInfo {
            cpu_access: CpuAccessFlags::WRITE,
            ..buffer_info(16)
        };
        let mut write_only = transfer.create_buffer(&info, None).unwrap();
        assert!(matches!(
            transfer.map_buffer(&mut write_only, CpuAccess::ReadWrite, 0, 16),
            Err(TransferError::InvalidState(_)),
        ));
        assert!(matches!(
            transfer.map_buffer(&mut write_only, CpuAccess::WriteOnly, 8, 9),
            Err(TransferError::InvalidArgument(_)),
        ));

        transfer.release_buffer(plain).unwrap();
        transfer.release_buffer(write_only).unwrap();
    }

    #[test]
    fn device_side_copy() {
        let (_device, mut transfer) = orchestrator();

        let src = transfer
            .create_buffer(&buffer_info(8), Some(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let dst = transfer.create_buffer(&buffer_info(8), None).unwrap();

        transfer.copy_buffer(&src, &dst, 4, 4, 2).unwrap();
        assert!(matches!(
            transfer.copy_buffer(&src, &dst, 4, 0, 5),
            Err(TransferError::InvalidArgument(_)),
        ));

        let mut out = [0; 4];
        transfer.read_buffer(&dst, 2, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8]);

        transfer.release_buffer(src).unwrap();
        transfer.release_buffer(dst).unwrap();
    }

    #[test]
    fn copy_buffer_rejects_images() {
        let (device, mut transfer) = orchestrator();

        let buffer = transfer.create_buffer(&buffer_info(64), None).unwrap();
        let texture = transfer.create_texture(&rgba8(2, 2), None).unwrap();
        let submissions = device.statistics().submissions;

        assert!(matches!(
            transfer.copy_buffer(&texture, &buffer, 16, 0, 0),
            Err(TransferError::InvalidArgument(_)),
        ));
        assert!(matches!(
            transfer.copy_buffer(&buffer, &texture, 16, 0, 0),
            Err(TransferError::InvalidArgument(_)),
        ));
        assert_eq!(device.statistics().submissions, submissions);

        transfer.release_texture(texture).unwrap();
        transfer.release_buffer(buffer).unwrap();
    }

    #[test]
    fn depth_textures_without_data_stay_undefined() {
        let (device, mut transfer) = orchestrator();

        for format in [
            Format::D16_UNORM,
            Format::D32_SFLOAT,
            Format::D24_UNORM_S8_UINT,
            Format::D32_SFLOAT_S8_UINT,
        ] {
            let descriptor = TextureDescriptor {
                format,
                clear_color: [1.0; 4],
                ..rgba8(4, 4)
            };
            let texture = transfer.create_texture(&descriptor, None).unwrap();

            assert_eq!(texture.layout(0, 0), ImageLayout::Undefined, "{:?}", format);
            assert_eq!(
                device.image_layout(texture.image(), 0, 0),
                Some(ImageLayout::Undefined),
            );

            transfer.release_texture(texture).unwrap();
        }

        assert_eq!(device.statistics().submissions, 0);

        // A single-aspect depth format can still be written later.
        let mut texture = transfer
            .create_texture(
                &TextureDescriptor {
                    format: Format::D32_SFLOAT,
                    ..rgba8(2, 2)
                },
                None,
            )
            .unwrap();
        let region = whole(&texture, 0);
        transfer
            .write_texture(
                &mut texture,
                &region,
                SrcImage::from_texels(ImageFormat::Depth, DataType::Float32, &[0.5f32; 4]),
            )
            .unwrap();
        assert_eq!(texture.layout(0, 0), ImageLayout::ShaderReadOnlyOptimal);

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn combined_depth_stencil_data_is_rejected() {
        let (device, mut transfer) = orchestrator();

        let descriptor = TextureDescriptor {
            format: Format::D24_UNORM_S8_UINT,
            ..rgba8(4, 4)
        };
        let data = [0u8; 64];

        assert_eq!(
            transfer
                .create_texture(
                    &descriptor,
                    Some(SrcImage::new(ImageFormat::DepthStencil, DataType::UInt8, &data)),
                )
                .map(|_| ()),
            Err(TransferError::InvalidArgument(COMBINED_DEPTH_STENCIL)),
        );
        assert_eq!(device.statistics().live_images, 0);

        let mut texture = transfer.create_texture(&descriptor, None).unwrap();
        let region = whole(&texture, 0);

        assert_eq!(
            transfer.write_texture(
                &mut texture,
                &region,
                SrcImage::new(ImageFormat::DepthStencil, DataType::UInt8, &data),
            ),
            Err(TransferError::InvalidArgument(COMBINED_DEPTH_STENCIL)),
        );

        let mut out = [0u8; 64];
        assert_eq!(
            transfer.read_texture(
                &mut texture,
                &region,
                DstImage::new(ImageFormat::DepthStencil, DataType::UInt8, &mut out),
            ),
            Err(TransferError::InvalidArgument(COMBINED_DEPTH_STENCIL)),
        );
        assert_eq!(device.statistics().submissions, 0);

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn device_failures_release_staging() {
        let (device, mut transfer) = orchestrator();

        device.fail_next_submit(VulkanError::DeviceLost);
        assert_eq!(
            transfer
                .create_buffer(&buffer_info(16), Some(&[7; 16]))
                .map(|_| ()),
            Err(TransferError::Device(VulkanError::DeviceLost)),
        );
        assert_eq!(transfer.memory_manager().statistics().region_count, 0);
        assert_eq!(device.statistics().live_buffers, 0);

        let mut buffer = transfer.create_buffer(&buffer_info(16), None).unwrap();

        device.fail_next_submit(VulkanError::DeviceLost);
        assert_eq!(
            transfer.read_buffer(&buffer, 0, &mut [0; 16]),
            Err(TransferError::Device(VulkanError::DeviceLost)),
        );
        assert_eq!(transfer.memory_manager().statistics().region_count, 1);

        device.fail_next_submit(VulkanError::DeviceLost);
        assert_eq!(
            transfer.write_buffer(&mut buffer, 0, &[1; 16]),
            Err(TransferError::Device(VulkanError::DeviceLost)),
        );
        assert_eq!(transfer.memory_manager().statistics().region_count, 1);

        let mut texture = transfer
            .create_texture(
                &TextureDescriptor {
                    flags: TextureFlags::NO_INITIAL_DATA,
                    ..rgba8(2, 2)
                },
                None,
            )
            .unwrap();
        let region = whole(&texture, 0);

        device.fail_next_submit(VulkanError::DeviceLost);
        assert_eq!(
            transfer.write_texture(
                &mut texture,
                &region,
                SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &[0; 16]),
            ),
            Err(TransferError::Device(VulkanError::DeviceLost)),
        );
        assert_eq!(texture.layout(0, 0), ImageLayout::Undefined);
        assert_eq!(transfer.memory_manager().statistics().region_count, 2);

        transfer.release_texture(texture).unwrap();
        transfer.release_buffer(buffer).unwrap();
        assert_eq!(transfer.memory_manager().statistics().region_count, 0);
        assert_eq!(device.statistics().pending_command_buffers, 0);
    }

    #[test]
    fn defragment_moves_buffers_forward() {
        init_logger();

        let device = Arc::new(SoftwareDevice::new());
        let mut transfer = TransferOrchestrator::new(
            device.clone(),
            DeviceMemoryManagerCreateInfo {
                chunk_granularity: 4096,
                min_allocation_size: 4096,
                ..Default::default()
            },
        );

        let filler = transfer.create_buffer(&buffer_info(4096), None).unwrap();
        let mut buffer = transfer
            .create_buffer(&buffer_info(256), Some(&[42; 256]))
            .unwrap();
        assert_eq!(buffer.memory_region().unwrap().chunk().index(), 1);

        transfer.release_buffer(filler).unwrap();

        let freed = transfer.defragment_buffers(&mut [&mut buffer]).unwrap();
        assert!(freed >= 4096);
        assert_eq!(buffer.memory_region().unwrap().chunk().index(), 0);
        assert_eq!(buffer.memory_region().unwrap().offset(), 0);

        let mut out = [0; 256];
        transfer.read_buffer(&buffer, 0, &mut out).unwrap();
        assert_eq!(out, [42; 256]);

        transfer.release_buffer(buffer).unwrap();
        assert_eq!(device.statistics().live_buffers, 0);
    }

    #[test]
    fn clear_color_fill() {
        let (_device, mut transfer) = orchestrator();

        let descriptor = TextureDescriptor {
            mip_levels: 0,
            clear_color: [1.0, 0.0, 0.0, 1.0],
            ..rgba8(4, 4)
        };
        let mut texture = transfer.create_texture(&descriptor, None).unwrap();
        assert_eq!(texture.mip_levels(), 3);
        assert_eq!(texture.layout(2, 0), ImageLayout::ShaderReadOnlyOptimal);

        for level in 0..3 {
            let region = whole(&texture, level);
            let texels = region.extent.texel_count() as usize;
            let mut out = vec![0; texels * 4];

            transfer
                .read_texture(
                    &mut texture,
                    &region,
                    DstImage::new(ImageFormat::RGBA, DataType::UInt8, &mut out),
                )
                .unwrap();
            assert_eq!(out, [255, 0, 0, 255].repeat(texels));
        }

        transfer.release_texture(texture).unwrap();
        assert_eq!(transfer.memory_manager().statistics().region_count, 0);
    }

    #[test]
    fn write_converts_host_data() {
        let (_device, mut transfer) = orchestrator();

        let mut texture = transfer.create_texture(&rgba8(4, 4), None).unwrap();
        let region = TextureRegion {
            subresource: TextureSubresource::FIRST,
            offset: Offset3D::new(2, 2, 0),
            extent: Extent3D::new(2, 2, 1),
        };

        let texels = [[0.0f32, 1.0, 0.0, 1.0]; 4];
        transfer
            .write_texture(
                &mut texture,
                &region,
                SrcImage::from_texels(ImageFormat::RGBA, DataType::Float32, &texels),
            )
            .unwrap();

        let mut out = [0u8; 4 * 16];
        let full = whole(&texture, 0);
        transfer
            .read_texture(
                &mut texture,
                &full,
                DstImage::new(ImageFormat::RGBA, DataType::UInt8, &mut out),
            )
            .unwrap();

        let texel = |x: usize, y: usize| &out[(y * 4 + x) * 4..][..4];
        assert_eq!(texel(0, 0), [0, 0, 0, 0]);
        assert_eq!(texel(3, 1), [0, 0, 0, 0]);
        assert_eq!(texel(2, 2), [0, 255, 0, 255]);
        assert_eq!(texel(3, 3), [0, 255, 0, 255]);

        let stats = transfer.statistics();
        assert_eq!((stats.texture_writes, stats.texture_reads), (1, 1));

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn data_size_checks_happen_before_device_work() {
        let (device, mut transfer) = orchestrator();

        let array = TextureDescriptor {
            texture_type: TextureType::Texture2DArray,
            array_layers: 2,
            ..rgba8(2, 2)
        };
        assert!(matches!(
            transfer.create_texture(
                &array,
                Some(SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &[0; 33])),
            ),
            Err(TransferError::InvalidArgument(_)),
        ));

        assert_eq!(
            transfer
                .create_texture(
                    &rgba8(2, 2),
                    Some(SrcImage::new(ImageFormat::RGB, DataType::UInt8, &[0; 16])),
                )
                .unwrap_err(),
            TransferError::ImageDataSizeMismatch {
                expected: 12,
                actual: 16,
            },
        );

        let stats = device.statistics();
        assert_eq!((stats.live_images, stats.submissions), (0, 0));

        let mut texture = transfer
            .create_texture(
                &TextureDescriptor {
                    flags: TextureFlags::NO_INITIAL_DATA,
                    ..rgba8(2, 2)
                },
                None,
            )
            .unwrap();
        assert_eq!(texture.layout(0, 0), ImageLayout::Undefined);

        let mut out = [0u8; 15];
        let region = whole(&texture, 0);
        assert_eq!(
            transfer
                .read_texture(
                    &mut texture,
                    &region,
                    DstImage::new(ImageFormat::RGBA, DataType::UInt8, &mut out),
                )
                .unwrap_err(),
            TransferError::ImageDataSizeMismatch {
                expected: 16,
                actual: 15,
            },
        );
        assert_eq!(device.statistics().submissions, 0);

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn multisample_writes_are_skipped() {
        let (device, mut transfer) = orchestrator();

        let descriptor = TextureDescriptor {
            texture_type: TextureType::Texture2DMS,
            samples: 4,
            ..rgba8(8, 8)
        };
        let mut texture = transfer.create_texture(&descriptor, None).unwrap();

        let region = whole(&texture, 0);
        transfer
            .write_texture(
                &mut texture,
                &region,
                SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &[0; 4 * 64]),
            )
            .unwrap();

        assert_eq!(device.statistics().submissions, 0);
        assert_eq!(texture.layout(0, 0), ImageLayout::Undefined);

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn generated_mips_average_the_base_level() {
        let (_device, mut transfer) = orchestrator();

        let descriptor = TextureDescriptor {
            mip_levels: 0,
            flags: TextureFlags::GENERATE_MIPS,
            ..rgba8(4, 4)
        };
        let data = [200u8; 4 * 16];
        let mut texture = transfer
            .create_texture(
                &descriptor,
                Some(SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &data)),
            )
            .unwrap();

        assert_eq!(transfer.mip_generator().generated(), (1, 2));
        for level in 0..3 {
            assert_eq!(texture.layout(level, 0), ImageLayout::ShaderReadOnlyOptimal);
        }

        let mut out = [0u8; 4];
        let region = whole(&texture, 2);
        transfer
            .read_texture(
                &mut texture,
                &region,
                DstImage::new(ImageFormat::RGBA, DataType::UInt8, &mut out),
            )
            .unwrap();
        assert_eq!(out, [200; 4]);

        transfer.release_texture(texture).unwrap();
    }

    #[test]
    fn compressed_data_is_uploaded_as_is() {
        let (_device, mut transfer) = orchestrator();

        let descriptor = TextureDescriptor {
            format: Format::BC1_RGBA_UNORM_BLOCK,
            ..rgba8(8, 8)
        };

        // Four 8-byte blocks. The host description is ignored.
        let data: Vec<u8> = (0..32).collect();
        let mut texture = transfer
            .create_texture(
                &descriptor,
                Some(SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &data)),
            )
            .unwrap();

        let mut out = [0u8; 32];
        let region = whole(&texture, 0);
        transfer
            .read_texture(
                &mut texture,
                &region,
                DstImage::new(ImageFormat::RGBA, DataType::UInt8, &mut out),
            )
            .unwrap();
        assert_eq!(out[..], data[..]);

        transfer.release_texture(texture).unwrap();
    }
}
