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
    image::{Extent3D, ImageAspects, ImageLayout},
    memory::{
        MemoryHeap, MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags, MemoryRequirements,
        MemoryType,
    },
    DeviceSize, VulkanError,
};
use ash::vk::{self, Handle};
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{ops::Range, ptr::NonNull, slice};

const BUFFER_ALIGNMENT: DeviceSize = 256;
const IMAGE_ALIGNMENT: DeviceSize = 512;
const DEFAULT_HEAP_SIZE: DeviceSize = 256 * 1024 * 1024;

/// Image memory is filled with this byte by a transition out of `Undefined`.
pub(crate) const UNDEFINED_FILL: u8 = 0xCD;

/// A device emulated in host memory.
///
/// Device memory is plain host memory, and recorded commands are executed on the host when the
/// command buffer is submitted. Heap sizes are enforced, and the tracked layout of every image
/// subresource is checked against the layouts that copies, blits and barriers name. A mismatch
/// fails the submission with [`VulkanError::ValidationFailed`].
///
/// The default configuration has one device-local memory type and two host-visible, coherent
/// types, the second of which is also cached, each heap being 256 MiB large.
#[derive(Debug)]
pub struct SoftwareDevice {
    properties: MemoryProperties,
    state: Mutex<State>,
}

/// Counters of a [`SoftwareDevice`], for tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftwareDeviceStatistics {
    /// The number of command buffers that were submitted.
    pub submissions: u64,
    pub live_memory_allocations: usize,
    pub live_buffers: usize,
    pub live_images: usize,
    pub pending_command_buffers: usize,
}

impl SoftwareDevice {
    /// Creates a device with the default memory configuration.
    pub fn new() -> Self {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;

        Self::with_properties(MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: host | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: DEFAULT_HEAP_SIZE,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: DEFAULT_HEAP_SIZE,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
        })
    }

    /// Creates a device with the given memory types and heaps.
    pub fn with_properties(properties: MemoryProperties) -> Self {
        let heap_usage = vec![0; properties.memory_heaps.len()];

        SoftwareDevice {
            properties,
            state: Mutex::new(State {
                next_handle: 1,
                heap_usage,
                ..Default::default()
            }),
        }
    }

    pub fn statistics(&self) -> SoftwareDeviceStatistics {
        let state = self.state.lock();

        SoftwareDeviceStatistics {
            submissions: state.submissions,
            live_memory_allocations: state.memories.len(),
            live_buffers: state.buffers.len(),
            live_images: state.images.len(),
            pending_command_buffers: state.command_buffers.len(),
        }
    }

    /// Makes the next submission fail with `error` without executing any of its commands.
    pub fn fail_next_submit(&self, error: VulkanError) {
        self.state.lock().failed_submit = Some(error);
    }

    /// Returns the tracked layout of one subresource of `image`.
    pub fn image_layout(
        &self,
        image: vk::Image,
        mip_level: u32,
        array_layer: u32,
    ) -> Option<ImageLayout> {
        let state = self.state.lock();
        let image = state.images.get(&image.as_raw())?;

        (mip_level < image.info.mip_levels && array_layer < image.info.array_layers)
            .then(|| image.layouts[image.layout_index(mip_level, array_layer)])
    }

    fn memory_type_bits(&self, filter: impl Fn(MemoryPropertyFlags) -> bool) -> u32 {
        self.properties
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, memory_type)| filter(memory_type.property_flags))
            .fold(0, |bits, (index, _)| bits | 1 << index)
    }
}

impl Default for SoftwareDevice {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    memories: HashMap<u64, Memory>,
    buffers: HashMap<u64, Buffer>,
    images: HashMap<u64, Image>,
    command_buffers: HashMap<u64, Vec<Command>>,
    heap_usage: Vec<DeviceSize>,
    submissions: u64,
    failed_submit: Option<VulkanError>,
}

#[derive(Debug)]
struct Memory {
    ptr: NonNull<u8>,
    len: usize,
    heap_index: usize,
    host_visible: bool,
    mapped: bool,
}

// SAFETY: The allocation is owned by the `Memory` and only accessed under the device lock, or by
// the host through a mapping whose synchronization is the caller's responsibility.
unsafe impl Send for Memory {}

impl Memory {
    fn new(len: usize, heap_index: usize, host_visible: bool) -> Self {
        let bytes = Box::into_raw(vec![0u8; len].into_boxed_slice());

        Memory {
            // SAFETY: `Box::into_raw` never returns null.
            ptr: unsafe { NonNull::new_unchecked(bytes.cast::<u8>()) },
            len,
            heap_index,
            host_visible,
            mapped: false,
        }
    }

    fn bytes(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` points to `len` initialized bytes owned by `self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let bytes = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);

        // SAFETY: `ptr` and `len` came from `Box::into_raw` in `Memory::new`.
        drop(unsafe { Box::from_raw(bytes) });
    }
}

#[derive(Debug)]
struct Buffer {
    size: DeviceSize,
    binding: Option<(u64, DeviceSize)>,
}

#[derive(Debug)]
struct Image {
    info: ImageCreateInfo,
    binding: Option<(u64, DeviceSize)>,
    // Indexed by `mip_level * array_layers + array_layer`.
    layouts: Vec<ImageLayout>,
}

impl Image {
    fn layout_index(&self, mip_level: u32, array_layer: u32) -> usize {
        (mip_level * self.info.array_layers + array_layer) as usize
    }

    /// Returns the byte offset of one subresource from the start of the image's memory.
    fn subresource_offset(&self, mip_level: u32, array_layer: u32) -> DeviceSize {
        let info = &self.info;
        let per_texel_set = DeviceSize::from(info.array_layers) * DeviceSize::from(info.samples);
        let levels_before: DeviceSize = (0..mip_level)
            .map(|level| info.format.footprint(info.mip_extent(level)))
            .sum();

        levels_before * per_texel_set
            + DeviceSize::from(array_layer)
                * info.format.footprint(info.mip_extent(mip_level))
                * DeviceSize::from(info.samples)
    }

    fn check_layouts(
        &self,
        layers: &vk::ImageSubresourceLayers,
        expected: ImageLayout,
    ) -> Result<(), VulkanError> {
        let end = layers.base_array_layer.checked_add(layers.layer_count);

        if layers.mip_level >= self.info.mip_levels
            || end.map_or(true, |end| end > self.info.array_layers)
        {
            return Err(VulkanError::ValidationFailed);
        }

        for layer in layers.base_array_layer..layers.base_array_layer + layers.layer_count {
            if self.layouts[self.layout_index(layers.mip_level, layer)] != expected {
                return Err(VulkanError::ValidationFailed);
            }
        }

        Ok(())
    }

    /// Splits a buffer-image copy into rows of texel blocks. Returns, per row, the offset in the
    /// buffer, the offset from the start of the image's memory and the length.
    fn copy_rows(
        &self,
        region: &vk::BufferImageCopy,
    ) -> Result<Vec<(DeviceSize, DeviceSize, DeviceSize)>, VulkanError> {
        let info = &self.info;
        let format = info.format;
        let [bw, bh, bd] = format.block_extent();
        let block_size = format.block_size();
        let layers = &region.image_subresource;
        let offset = region.image_offset;
        let extent = region.image_extent;
        let mip_extent = info.mip_extent(layers.mip_level);
        let aspect = ImageAspects::from(layers.aspect_mask);

        // Copies name exactly one aspect of the format.
        if layers.aspect_mask.as_raw().count_ones() != 1
            || !format.aspects().contains(aspect)
            || info.samples != 1
            || offset.x < 0
            || offset.y < 0
            || offset.z < 0
            || offset.x as u32 % bw != 0
            || offset.y as u32 % bh != 0
            || offset.z as u32 % bd != 0
            || offset.x as u64 + extent.width as u64 > mip_extent.width as u64
            || offset.y as u64 + extent.height as u64 > mip_extent.height as u64
            || offset.z as u64 + extent.depth as u64 > mip_extent.depth as u64
        {
            return Err(VulkanError::ValidationFailed);
        }

        let row_length = match region.buffer_row_length {
            0 => extent.width,
            len => len,
        };
        let image_height = match region.buffer_image_height {
            0 => extent.height,
            height => height,
        };

        let blocks = |texels: u32, block: u32| DeviceSize::from(texels.div_ceil(block));
        let buffer_row_pitch = blocks(row_length, bw) * block_size;
        let buffer_slice_pitch = blocks(image_height, bh) * buffer_row_pitch;
        let buffer_layer_pitch = blocks(extent.depth, bd) * buffer_slice_pitch;

        let image_row_pitch = blocks(mip_extent.width, bw) * block_size;
        let image_slice_pitch = blocks(mip_extent.height, bh) * image_row_pitch;

        let row_len = blocks(extent.width, bw) * block_size;
        let (x0, y0, z0) = (
            DeviceSize::from(offset.x as u32 / bw),
            DeviceSize::from(offset.y as u32 / bh),
            DeviceSize::from(offset.z as u32 / bd),
        );

        let mut rows = Vec::new();

        for (i, layer) in (layers.base_array_layer..layers.base_array_layer + layers.layer_count)
            .enumerate()
        {
            let base = self.subresource_offset(layers.mip_level, layer);

            for z in 0..blocks(extent.depth, bd) {
                for y in 0..blocks(extent.height, bh) {
                    let buffer_offset = region.buffer_offset
                        + i as DeviceSize * buffer_layer_pitch
                        + z * buffer_slice_pitch
                        + y * buffer_row_pitch;
                    let image_offset = base
                        + (z0 + z) * image_slice_pitch
                        + (y0 + y) * image_row_pitch
                        + x0 * block_size;

                    rows.push((buffer_offset, image_offset, row_len));
                }
            }
        }

        Ok(rows)
    }
}

#[derive(Debug)]
enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        layout: ImageLayout,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    CopyImageToBuffer {
        image: vk::Image,
        layout: ImageLayout,
        buffer: vk::Buffer,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    Barrier(SmallVec<[ImageBarrier; 4]>),
    Blit {
        image: vk::Image,
        src: vk::ImageSubresourceLayers,
        src_extent: Extent3D,
        dst: vk::ImageSubresourceLayers,
        dst_extent: Extent3D,
    },
}

impl State {
    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Returns the memory and the absolute byte range of `[offset, offset + len)` of a bound
    /// buffer.
    fn buffer_range(
        &self,
        buffer: vk::Buffer,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(u64, Range<usize>), VulkanError> {
        let buffer = self
            .buffers
            .get(&buffer.as_raw())
            .ok_or(VulkanError::ValidationFailed)?;
        let (memory, base) = buffer.binding.ok_or(VulkanError::ValidationFailed)?;

        match offset.checked_add(len) {
            Some(end) if end <= buffer.size => {
                let start = (base + offset) as usize;
                Ok((memory, start..start + len as usize))
            }
            _ => Err(VulkanError::ValidationFailed),
        }
    }

    fn read(&mut self, memory: u64, range: Range<usize>) -> Result<Vec<u8>, VulkanError> {
        let memory = self
            .memories
            .get_mut(&memory)
            .ok_or(VulkanError::ValidationFailed)?;

        memory
            .bytes()
            .get(range)
            .map(<[u8]>::to_vec)
            .ok_or(VulkanError::ValidationFailed)
    }

    fn write(&mut self, memory: u64, start: usize, data: &[u8]) -> Result<(), VulkanError> {
        let memory = self
            .memories
            .get_mut(&memory)
            .ok_or(VulkanError::ValidationFailed)?;

        memory
            .bytes()
            .get_mut(start..start + data.len())
            .ok_or(VulkanError::ValidationFailed)?
            .copy_from_slice(data);

        Ok(())
    }

    fn image(&self, image: vk::Image) -> Result<&Image, VulkanError> {
        self.images
            .get(&image.as_raw())
            .ok_or(VulkanError::ValidationFailed)
    }

    fn execute(&mut self, command: Command) -> Result<(), VulkanError> {
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let (src_memory, src_range) =
                        self.buffer_range(src, region.src_offset, region.size)?;
                    let (dst_memory, dst_range) =
                        self.buffer_range(dst, region.dst_offset, region.size)?;
                    let data = self.read(src_memory, src_range)?;
                    self.write(dst_memory, dst_range.start, &data)?;
                }
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                layout,
                regions,
            } => {
                if !matches!(
                    layout,
                    ImageLayout::TransferDstOptimal | ImageLayout::General
                ) {
                    return Err(VulkanError::ValidationFailed);
                }

                for region in regions {
                    let target = self.image(image)?;
                    target.check_layouts(&region.image_subresource, layout)?;
                    let (image_memory, image_base) =
                        target.binding.ok_or(VulkanError::ValidationFailed)?;

                    for (buffer_offset, image_offset, len) in target.copy_rows(&region)? {
                        let (memory, range) = self.buffer_range(buffer, buffer_offset, len)?;
                        let data = self.read(memory, range)?;
                        self.write(image_memory, (image_base + image_offset) as usize, &data)?;
                    }
                }
            }
            Command::CopyImageToBuffer {
                image,
                layout,
                buffer,
                regions,
            } => {
                if !matches!(
                    layout,
                    ImageLayout::TransferSrcOptimal | ImageLayout::General
                ) {
                    return Err(VulkanError::ValidationFailed);
                }

                for region in regions {
                    let source = self.image(image)?;
                    source.check_layouts(&region.image_subresource, layout)?;
                    let (image_memory, image_base) =
                        source.binding.ok_or(VulkanError::ValidationFailed)?;

                    for (buffer_offset, image_offset, len) in source.copy_rows(&region)? {
                        let start = (image_base + image_offset) as usize;
                        let data = self.read(image_memory, start..start + len as usize)?;
                        let (memory, range) = self.buffer_range(buffer, buffer_offset, len)?;
                        self.write(memory, range.start, &data)?;
                    }
                }
            }
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.transition(&barrier)?;
                }
            }
            Command::Blit {
                image,
                src,
                src_extent,
                dst,
                dst_extent,
            } => self.blit(image, &src, src_extent, &dst, dst_extent)?,
        }

        Ok(())
    }

    fn transition(&mut self, barrier: &ImageBarrier) -> Result<(), VulkanError> {
        let image = self
            .images
            .get_mut(&barrier.image.as_raw())
            .ok_or(VulkanError::ValidationFailed)?;
        let sub = barrier.subresource;

        let mip_end = sub.base_mip_level.checked_add(sub.mip_levels);
        let layer_end = sub.base_array_layer.checked_add(sub.array_layers);

        if mip_end.map_or(true, |end| end > image.info.mip_levels)
            || layer_end.map_or(true, |end| end > image.info.array_layers)
            || barrier.new_layout == ImageLayout::Undefined
        {
            return Err(VulkanError::ValidationFailed);
        }

        let mut poisoned: SmallVec<[(DeviceSize, DeviceSize); 4]> = SmallVec::new();

        for mip_level in sub.base_mip_level..sub.base_mip_level + sub.mip_levels {
            for layer in sub.base_array_layer..sub.base_array_layer + sub.array_layers {
                let index = image.layout_index(mip_level, layer);
                let current = image.layouts[index];

                if barrier.old_layout == ImageLayout::Undefined {
                    let len = image.info.format.footprint(image.info.mip_extent(mip_level))
                        * DeviceSize::from(image.info.samples);
                    poisoned.push((image.subresource_offset(mip_level, layer), len));
                } else if current != barrier.old_layout {
                    return Err(VulkanError::ValidationFailed);
                }

                image.layouts[index] = barrier.new_layout;
            }
        }

        if let Some((memory, base)) = image.binding {
            for (offset, len) in poisoned {
                let start = (base + offset) as usize;
                let fill = vec![UNDEFINED_FILL; len as usize];
                self.write(memory, start, &fill)?;
            }
        }

        Ok(())
    }

    fn blit(
        &mut self,
        image: vk::Image,
        src: &vk::ImageSubresourceLayers,
        src_extent: Extent3D,
        dst: &vk::ImageSubresourceLayers,
        dst_extent: Extent3D,
    ) -> Result<(), VulkanError> {
        let target = self.image(image)?;
        let format = target.info.format;

        if format.is_compressed()
            || target.info.samples != 1
            || src.layer_count != dst.layer_count
            || src_extent.is_empty()
            || dst_extent.is_empty()
            || src_extent != target.info.mip_extent(src.mip_level)
            || dst_extent != target.info.mip_extent(dst.mip_level)
        {
            return Err(VulkanError::ValidationFailed);
        }

        target.check_layouts(src, ImageLayout::TransferSrcOptimal)?;
        target.check_layouts(dst, ImageLayout::TransferDstOptimal)?;

        let (memory, base) = target.binding.ok_or(VulkanError::ValidationFailed)?;
        let texel_size = format.block_size() as usize;
        // Formats made only of 8-bit components are averaged; anything else is point-sampled.
        let average = format.native_image_format().is_some_and(|(image_format, data_type)| {
            data_type.size() == 1 && image_format.component_count() == texel_size
        });

        let mut jobs = Vec::with_capacity(src.layer_count as usize);

        for i in 0..src.layer_count {
            let src_offset = target.subresource_offset(src.mip_level, src.base_array_layer + i);
            let dst_offset = target.subresource_offset(dst.mip_level, dst.base_array_layer + i);
            jobs.push(((base + src_offset) as usize, (base + dst_offset) as usize));
        }

        let src_len = format.footprint(src_extent) as usize;

        for (src_start, dst_start) in jobs {
            let source = self.read(memory, src_start..src_start + src_len)?;
            let out = downsample(&source, src_extent, dst_extent, texel_size, average);
            self.write(memory, dst_start, &out)?;
        }

        Ok(())
    }
}

/// Shrinks one subresource with a box filter or nearest sampling.
fn downsample(
    src: &[u8],
    src_extent: Extent3D,
    dst_extent: Extent3D,
    texel_size: usize,
    average: bool,
) -> Vec<u8> {
    let footprint = |dst: u32, src: u32, i: u32| {
        let start = (i as u64 * src as u64 / dst as u64) as u32;
        let end = ((i as u64 + 1) * src as u64 / dst as u64) as u32;

        start..end.max(start + 1).min(src)
    };
    let index = |x: u32, y: u32, z: u32| {
        ((z as usize * src_extent.height as usize + y as usize) * src_extent.width as usize
            + x as usize)
            * texel_size
    };

    let mut out = Vec::with_capacity(dst_extent.texel_count() as usize * texel_size);

    for z in 0..dst_extent.depth {
        let zs = footprint(dst_extent.depth, src_extent.depth, z);

        for y in 0..dst_extent.height {
            let ys = footprint(dst_extent.height, src_extent.height, y);

            for x in 0..dst_extent.width {
                let xs = footprint(dst_extent.width, src_extent.width, x);

                if !average {
                    let at = index(xs.start, ys.start, zs.start);
                    out.extend_from_slice(&src[at..at + texel_size]);
                    continue;
                }

                let mut sums: SmallVec<[u32; 4]> = SmallVec::from_elem(0, texel_size);
                let mut count = 0;

                for sz in zs.clone() {
                    for sy in ys.clone() {
                        for sx in xs.clone() {
                            let at = index(sx, sy, sz);

                            for (sum, &byte) in sums.iter_mut().zip(&src[at..at + texel_size]) {
                                *sum += u32::from(byte);
                            }

                            count += 1;
                        }
                    }
                }

                out.extend(sums.iter().map(|&sum| ((sum + count / 2) / count) as u8));
            }
        }
    }

    out
}

impl RawDevice for SoftwareDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let memory_type = self
            .properties
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(VulkanError::ValidationFailed)?;
        let heap_index = memory_type.heap_index as usize;
        let heap_size = self
            .properties
            .memory_heaps
            .get(heap_index)
            .map_or(DeviceSize::MAX, |heap| heap.size);

        let mut state = self.state.lock();

        if size == 0 {
            return Err(VulkanError::ValidationFailed);
        }

        let used = state.heap_usage.get(heap_index).copied().unwrap_or(0);

        if used.checked_add(size).map_or(true, |total| total > heap_size) {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let len = usize::try_from(size).map_err(|_| VulkanError::OutOfHostMemory)?;
        let host_visible = memory_type
            .property_flags
            .intersects(MemoryPropertyFlags::HOST_VISIBLE);

        if let Some(used) = state.heap_usage.get_mut(heap_index) {
            *used += size;
        }

        let handle = state.next_handle();
        state
            .memories
            .insert(handle, Memory::new(len, heap_index, host_visible));

        Ok(vk::DeviceMemory::from_raw(handle))
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();

        if let Some(memory) = state.memories.remove(&memory.as_raw()) {
            debug_assert!(!memory.mapped);

            if let Some(used) = state.heap_usage.get_mut(memory.heap_index) {
                *used -= memory.len as DeviceSize;
            }
        }
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let mut state = self.state.lock();
        let memory = state
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(VulkanError::MemoryMapFailed)?;

        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= memory.len as DeviceSize);

        if !memory.host_visible || memory.mapped || !in_bounds {
            return Err(VulkanError::MemoryMapFailed);
        }

        memory.mapped = true;

        // SAFETY: `offset` is within the allocation.
        Ok(unsafe { memory.ptr.add(offset as usize) })
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(memory) = self.state.lock().memories.get_mut(&memory.as_raw()) {
            memory.mapped = false;
        }
    }

    fn create_buffer(
        &self,
        size: DeviceSize,
        _usage: BufferUsage,
    ) -> Result<(vk::Buffer, MemoryRequirements), VulkanError> {
        let requirements =
            MemoryRequirements::new(size, BUFFER_ALIGNMENT, self.memory_type_bits(|_| true))
                .ok_or(VulkanError::ValidationFailed)?;

        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.buffers.insert(
            handle,
            Buffer {
                size,
                binding: None,
            },
        );

        Ok((vk::Buffer::from_raw(handle), requirements))
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        let memory_len = state
            .memories
            .get(&memory.as_raw())
            .ok_or(VulkanError::ValidationFailed)?
            .len as DeviceSize;
        let buffer = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(VulkanError::ValidationFailed)?;

        if buffer.binding.is_some()
            || offset % BUFFER_ALIGNMENT != 0
            || offset + buffer.size > memory_len
        {
            return Err(VulkanError::ValidationFailed);
        }

        buffer.binding = Some((memory.as_raw(), offset));

        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer.as_raw());
    }

    fn create_image(
        &self,
        create_info: &ImageCreateInfo,
    ) -> Result<(vk::Image, MemoryRequirements), VulkanError> {
        let local =
            self.memory_type_bits(|flags| flags.intersects(MemoryPropertyFlags::DEVICE_LOCAL));
        let memory_type_bits = if local != 0 {
            local
        } else {
            self.memory_type_bits(|_| true)
        };

        if create_info.extent.is_empty()
            || create_info.mip_levels == 0
            || create_info.array_layers == 0
            || create_info.samples == 0
        {
            return Err(VulkanError::ValidationFailed);
        }

        let requirements = MemoryRequirements::new(
            create_info.packed_size(),
            IMAGE_ALIGNMENT,
            memory_type_bits,
        )
        .ok_or(VulkanError::ValidationFailed)?;

        let mut state = self.state.lock();
        let handle = state.next_handle();
        let subresources = create_info.mip_levels * create_info.array_layers;
        let layouts = vec![ImageLayout::Undefined; subresources as usize];
        state.images.insert(
            handle,
            Image {
                info: create_info.clone(),
                binding: None,
                layouts,
            },
        );

        Ok((vk::Image::from_raw(handle), requirements))
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        let memory_len = state
            .memories
            .get(&memory.as_raw())
            .ok_or(VulkanError::ValidationFailed)?
            .len as DeviceSize;
        let image = state
            .images
            .get_mut(&image.as_raw())
            .ok_or(VulkanError::ValidationFailed)?;

        if image.binding.is_some()
            || offset % IMAGE_ALIGNMENT != 0
            || offset + image.info.packed_size() > memory_len
        {
            return Err(VulkanError::ValidationFailed);
        }

        image.binding = Some((memory.as_raw(), offset));

        Ok(())
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image.as_raw());
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer, VulkanError> {
        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.command_buffers.insert(handle, Vec::new());

        Ok(vk::CommandBuffer::from_raw(handle))
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.iter().copied().collect(),
            },
        );
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyBufferToImage {
                buffer,
                image,
                layout,
                regions: regions.iter().copied().collect(),
            },
        );
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: ImageLayout,
        buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyImageToBuffer {
                image,
                layout,
                buffer,
                regions: regions.iter().copied().collect(),
            },
        );
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ImageBarrier],
    ) {
        self.record(
            command_buffer,
            Command::Barrier(barriers.iter().copied().collect()),
        );
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
        self.record(
            command_buffer,
            Command::Blit {
                image,
                src,
                src_extent,
                dst,
                dst_extent,
            },
        );
    }

    unsafe fn submit_and_wait(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        let commands = state
            .command_buffers
            .remove(&command_buffer.as_raw())
            .ok_or(VulkanError::ValidationFailed)?;
        state.submissions += 1;

        if let Some(error) = state.failed_submit.take() {
            log::debug!("failing submission with {:?}", error);
            return Err(error);
        }

        for command in commands {
            state.execute(command)?;
        }

        Ok(())
    }

    unsafe fn discard_commands(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .command_buffers
            .remove(&command_buffer.as_raw());
    }
}

impl SoftwareDevice {
    fn record(&self, command_buffer: vk::CommandBuffer, command: Command) {
        if let Some(commands) = self
            .state
            .lock()
            .command_buffers
            .get_mut(&command_buffer.as_raw())
        {
            commands.push(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::Format, image::TextureSubresource};

    fn bound_buffer(device: &SoftwareDevice, size: DeviceSize, memory_type: u32) -> vk::Buffer {
        let (buffer, requirements) = device.create_buffer(size, BufferUsage::TRANSFER_SRC).unwrap();
        let memory = device
            .allocate_memory(requirements.layout.size(), memory_type)
            .unwrap();
        unsafe { device.bind_buffer_memory(buffer, memory, 0) }.unwrap();
        buffer
    }

    fn image_info(extent: Extent3D, mip_levels: u32) -> ImageCreateInfo {
        ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: Format::R8G8B8A8_UNORM,
            extent,
            mip_levels,
            array_layers: 1,
            samples: 1,
            cube_compatible: false,
        }
    }

    fn barrier(image: vk::Image, old: ImageLayout, new: ImageLayout) -> ImageBarrier {
        ImageBarrier {
            image,
            aspects: Format::R8G8B8A8_UNORM.aspects(),
            old_layout: old,
            new_layout: new,
            subresource: TextureSubresource::FIRST,
        }
    }

    #[test]
    fn heap_budget() {
        let device = SoftwareDevice::new();

        let memory = device.allocate_memory(DEFAULT_HEAP_SIZE, 0).unwrap();
        assert_eq!(
            device.allocate_memory(1, 0),
            Err(VulkanError::OutOfDeviceMemory),
        );

        unsafe { device.free_memory(memory) };
        assert!(device.allocate_memory(1, 0).is_ok());
    }

    #[test]
    fn only_host_visible_memory_maps() {
        let device = SoftwareDevice::new();

        let local = device.allocate_memory(64, 0).unwrap();
        assert_eq!(
            unsafe { device.map_memory(local, 0, 64) },
            Err(VulkanError::MemoryMapFailed),
        );

        let host = device.allocate_memory(64, 1).unwrap();
        assert!(unsafe { device.map_memory(host, 0, 64) }.is_ok());
        assert_eq!(
            unsafe { device.map_memory(host, 0, 64) },
            Err(VulkanError::MemoryMapFailed),
        );
    }

    #[test]
    fn copy_requires_transfer_layout() {
        let device = SoftwareDevice::new();
        let staging = bound_buffer(&device, 64, 1);

        let (image, requirements) = device.create_image(&image_info(Extent3D::new(4, 4, 1), 1)).unwrap();
        let memory = device
            .allocate_memory(requirements.layout.size(), 0)
            .unwrap();
        unsafe { device.bind_image_memory(image, memory, 0) }.unwrap();

        let region = vk::BufferImageCopy::default()
            .image_subresource(TextureSubresource::FIRST.to_layers(Format::R8G8B8A8_UNORM.aspects()))
            .image_extent(vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            });

        // Still in `Undefined`.
        let cb = device.begin_commands().unwrap();
        unsafe {
            device.cmd_copy_buffer_to_image(cb, staging, image, ImageLayout::TransferDstOptimal, &[region]);
        }
        assert_eq!(
            unsafe { device.submit_and_wait(cb) },
            Err(VulkanError::ValidationFailed),
        );

        let cb = device.begin_commands().unwrap();
        unsafe {
            device.cmd_pipeline_barrier(
                cb,
                &[barrier(image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)],
            );
            device.cmd_copy_buffer_to_image(cb, staging, image, ImageLayout::TransferDstOptimal, &[region]);
            device.submit_and_wait(cb).unwrap();
        }

        assert_eq!(
            device.image_layout(image, 0, 0),
            Some(ImageLayout::TransferDstOptimal),
        );

        // The old layout of a barrier must match the tracked one.
        let cb = device.begin_commands().unwrap();
        unsafe {
            device.cmd_pipeline_barrier(
                cb,
                &[barrier(image, ImageLayout::TransferSrcOptimal, ImageLayout::ShaderReadOnlyOptimal)],
            );
        }
        assert_eq!(
            unsafe { device.submit_and_wait(cb) },
            Err(VulkanError::ValidationFailed),
        );
        assert_eq!(device.statistics().submissions, 3);
        assert_eq!(device.statistics().pending_command_buffers, 0);
    }

    #[test]
    fn copy_must_name_one_aspect() {
        let device = SoftwareDevice::new();
        let staging = bound_buffer(&device, 64, 1);

        let info = ImageCreateInfo {
            format: Format::D24_UNORM_S8_UINT,
            ..image_info(Extent3D::new(4, 4, 1), 1)
        };
        let (image, requirements) = device.create_image(&info).unwrap();
        let memory = device
            .allocate_memory(requirements.layout.size(), 0)
            .unwrap();
        unsafe { device.bind_image_memory(image, memory, 0) }.unwrap();

        let copy = |aspects: ImageAspects| {
            let region = vk::BufferImageCopy::default()
                .image_subresource(TextureSubresource::FIRST.to_layers(aspects))
                .image_extent(vk::Extent3D {
                    width: 4,
                    height: 4,
                    depth: 1,
                });

            let cb = device.begin_commands().unwrap();
            unsafe {
                device.cmd_pipeline_barrier(
                    cb,
                    &[ImageBarrier {
                        aspects: Format::D24_UNORM_S8_UINT.aspects(),
                        ..barrier(image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)
                    }],
                );
                device.cmd_copy_buffer_to_image(
                    cb,
                    staging,
                    image,
                    ImageLayout::TransferDstOptimal,
                    &[region],
                );
                device.submit_and_wait(cb)
            }
        };

        assert_eq!(
            copy(ImageAspects::DEPTH | ImageAspects::STENCIL),
            Err(VulkanError::ValidationFailed),
        );
        assert_eq!(copy(ImageAspects::COLOR), Err(VulkanError::ValidationFailed));
        assert_eq!(copy(ImageAspects::DEPTH), Ok(()));
    }

    #[test]
    fn failed_submit_executes_nothing() {
        let device = SoftwareDevice::new();
        let a = bound_buffer(&device, 16, 1);
        let b = bound_buffer(&device, 16, 1);

        device.fail_next_submit(VulkanError::DeviceLost);

        let cb = device.begin_commands().unwrap();
        unsafe { device.cmd_copy_buffer(cb, a, b, &[vk::BufferCopy::default().size(16)]) };
        assert_eq!(
            unsafe { device.submit_and_wait(cb) },
            Err(VulkanError::DeviceLost),
        );
        assert_eq!(device.statistics().pending_command_buffers, 0);

        // Only the next submission fails.
        let cb = device.begin_commands().unwrap();
        assert_eq!(unsafe { device.submit_and_wait(cb) }, Ok(()));
    }

    #[test]
    fn box_filter() {
        let src = [0u8, 0, 0, 0, 100, 100, 100, 100, 50, 50, 50, 50, 250, 250, 250, 250];
        let out = downsample(&src, Extent3D::new(2, 2, 1), Extent3D::new(1, 1, 1), 4, true);
        assert_eq!(out, [100, 100, 100, 100]);

        let out = downsample(&src, Extent3D::new(4, 1, 1), Extent3D::new(2, 1, 1), 4, false);
        assert_eq!(out, [0, 0, 0, 0, 50, 50, 50, 50]);
    }
}
