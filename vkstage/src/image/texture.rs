// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    Extent3D, ImageLayout, TextureDescriptor, TextureRegion, TextureSubresource, TextureType,
};
use crate::{
    format::Format,
    memory::allocator::MemoryRegion,
    resource::{DeviceResource, ResourceKind},
    DeviceSize,
};
use ash::vk::{self, Handle};
use smallvec::SmallVec;
use std::ops::Range;

/// A device-local image together with the region of memory bound to it.
///
/// Textures are created by
/// [`TransferOrchestrator::create_texture`](crate::TransferOrchestrator::create_texture) and must
/// be handed back to
/// [`TransferOrchestrator::release_texture`](crate::TransferOrchestrator::release_texture).
///
/// The layout of every subresource is tracked, so that transitions recorded for a transfer name
/// the layout the subresource is actually in.
#[derive(Debug)]
pub struct Texture {
    image: vk::Image,
    texture_type: TextureType,
    format: Format,
    extent: Extent3D,
    array_layers: u32,
    mip_levels: u32,
    samples: u32,
    memory_region: MemoryRegion,
    size: DeviceSize,
    // Indexed by `mip_level * array_layers + array_layer`.
    layouts: Vec<ImageLayout>,
}

impl Texture {
    pub(crate) fn new(
        image: vk::Image,
        descriptor: &TextureDescriptor,
        memory_region: MemoryRegion,
    ) -> Self {
        let mip_levels = descriptor.resolved_mip_levels();
        let size = memory_region.size();

        Texture {
            image,
            texture_type: descriptor.texture_type,
            format: descriptor.format,
            extent: descriptor.extent,
            array_layers: descriptor.array_layers,
            mip_levels,
            samples: descriptor.samples,
            memory_region,
            size,
            layouts: vec![ImageLayout::Undefined; (mip_levels * descriptor.array_layers) as usize],
        }
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn texture_type(&self) -> TextureType {
        self.texture_type
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Returns the extent of the base mip level.
    #[inline]
    pub fn extent(&self) -> Extent3D {
        self.extent
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Returns the extent of mip level `level`.
    #[inline]
    pub fn mip_extent(&self, level: u32) -> Extent3D {
        self.texture_type.mip_extent(self.extent, level)
    }

    /// Returns the subresource covering every mip level and array layer.
    #[inline]
    pub fn full_subresource(&self) -> TextureSubresource {
        TextureSubresource {
            base_array_layer: 0,
            array_layers: self.array_layers,
            base_mip_level: 0,
            mip_levels: self.mip_levels,
        }
    }

    /// Returns the tracked layout of one subresource.
    #[inline]
    pub fn layout(&self, mip_level: u32, array_layer: u32) -> ImageLayout {
        self.layouts[self.layout_index(mip_level, array_layer)]
    }

    #[inline]
    fn layout_index(&self, mip_level: u32, array_layer: u32) -> usize {
        debug_assert!(mip_level < self.mip_levels && array_layer < self.array_layers);

        (mip_level * self.array_layers + array_layer) as usize
    }

    /// Splits `subresource` into runs of consecutive layers of one mip level that share the
    /// same tracked layout.
    pub(crate) fn layout_runs(
        &self,
        subresource: TextureSubresource,
    ) -> SmallVec<[(TextureSubresource, ImageLayout); 4]> {
        let mut runs: SmallVec<[(TextureSubresource, ImageLayout); 4]> = SmallVec::new();

        for mip_level in mip_range(subresource) {
            for array_layer in layer_range(subresource) {
                let layout = self.layout(mip_level, array_layer);

                match runs.last_mut() {
                    Some((run, run_layout))
                        if *run_layout == layout
                            && run.base_mip_level == mip_level
                            && run.base_array_layer + run.array_layers == array_layer =>
                    {
                        run.array_layers += 1;
                    }
                    _ => runs.push((
                        TextureSubresource {
                            base_array_layer: array_layer,
                            array_layers: 1,
                            base_mip_level: mip_level,
                            mip_levels: 1,
                        },
                        layout,
                    )),
                }
            }
        }

        runs
    }

    /// Records that every subresource in `subresource` is now in `layout`.
    pub(crate) fn set_layout(&mut self, subresource: TextureSubresource, layout: ImageLayout) {
        for mip_level in mip_range(subresource) {
            for array_layer in layer_range(subresource) {
                let index = self.layout_index(mip_level, array_layer);
                self.layouts[index] = layout;
            }
        }
    }

    /// Checks that `region` addresses texels that exist in this texture.
    pub(crate) fn validate_region(&self, region: &TextureRegion) -> Result<(), &'static str> {
        let TextureRegion {
            subresource,
            offset,
            extent,
        } = *region;

        if subresource.mip_levels != 1 {
            return Err("a texture region must name exactly one mip level");
        }

        if subresource.base_mip_level >= self.mip_levels {
            return Err("mip level of the texture region is out of range");
        }

        if subresource.array_layers == 0
            || subresource.base_array_layer as u64 + subresource.array_layers as u64
                > self.array_layers as u64
        {
            return Err("array layers of the texture region are out of range");
        }

        if offset.x < 0 || offset.y < 0 || offset.z < 0 {
            return Err("texture region offset must not be negative");
        }

        if extent.is_empty() {
            return Err("texture region extent must not be zero");
        }

        let limit = self.mip_extent(subresource.base_mip_level);
        let outside =
            |offset: i32, extent: u32, limit: u32| offset as u64 + extent as u64 > limit as u64;

        if outside(offset.x, extent.width, limit.width)
            || outside(offset.y, extent.height, limit.height)
            || outside(offset.z, extent.depth, limit.depth)
        {
            return Err("texture region exceeds the size of the texture");
        }

        let [bw, bh, bd] = self.format.block_extent();

        if offset.x as u32 % bw != 0 || offset.y as u32 % bh != 0 || offset.z as u32 % bd != 0 {
            return Err("texture region offset must be aligned to the format's block extent");
        }

        Ok(())
    }

    pub(crate) fn into_parts(self) -> (vk::Image, MemoryRegion) {
        (self.image, self.memory_region)
    }
}

fn mip_range(subresource: TextureSubresource) -> Range<u32> {
    subresource.base_mip_level..subresource.base_mip_level + subresource.mip_levels
}

fn layer_range(subresource: TextureSubresource) -> Range<u32> {
    subresource.base_array_layer..subresource.base_array_layer + subresource.array_layers
}

impl DeviceResource for Texture {
    #[inline]
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    #[inline]
    fn native_handle(&self) -> u64 {
        self.image.as_raw()
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
