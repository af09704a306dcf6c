// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Texel formats of device images, and the host-side description of image data.
//!
//! A [`Format`] is what the device stores. Host data handed to the transfer functions is instead
//! described by an [`ImageFormat`] (which components, in which order) and a [`DataType`] (how
//! each component is encoded). Every uncompressed color or single-aspect depth format has a
//! *native* host description, returned by [`Format::native_image_format`]; host data in any
//! other description is converted on the way in and out.
//!
//! # Block-compressed formats
//!
//! A block-compressed format encodes a block of texels into a fixed number of bytes. Footprints
//! are always computed in whole blocks, so a 5×5 region of a format with 4×4 blocks occupies
//! four blocks.

use crate::{image::ImageAspects, image::Extent3D, DeviceSize};

vulkan_enum! {
    /// The texel format of a device image.
    Format = Format(i32);

    R8_UNORM = R8_UNORM,
    R8G8_UNORM = R8G8_UNORM,
    R8G8B8A8_UNORM = R8G8B8A8_UNORM,
    R8G8B8A8_SRGB = R8G8B8A8_SRGB,
    B8G8R8A8_UNORM = B8G8R8A8_UNORM,
    B8G8R8A8_SRGB = B8G8R8A8_SRGB,
    R16_SFLOAT = R16_SFLOAT,
    R16G16B16A16_SFLOAT = R16G16B16A16_SFLOAT,
    R32_UINT = R32_UINT,
    R32_SFLOAT = R32_SFLOAT,
    R32G32_SFLOAT = R32G32_SFLOAT,
    R32G32B32A32_SFLOAT = R32G32B32A32_SFLOAT,
    D16_UNORM = D16_UNORM,
    D32_SFLOAT = D32_SFLOAT,
    D24_UNORM_S8_UINT = D24_UNORM_S8_UINT,
    D32_SFLOAT_S8_UINT = D32_SFLOAT_S8_UINT,

    /// BC1 with one-bit alpha, 8 bytes per 4×4 block.
    BC1_RGBA_UNORM_BLOCK = BC1_RGBA_UNORM_BLOCK,

    /// BC3, 16 bytes per 4×4 block.
    BC3_UNORM_BLOCK = BC3_UNORM_BLOCK,
}

impl Format {
    /// Returns the number of bytes of one texel block.
    pub const fn block_size(self) -> DeviceSize {
        match self {
            Format::R8_UNORM => 1,
            Format::R8G8_UNORM | Format::R16_SFLOAT | Format::D16_UNORM => 2,
            Format::R8G8B8A8_UNORM
            | Format::R8G8B8A8_SRGB
            | Format::B8G8R8A8_UNORM
            | Format::B8G8R8A8_SRGB
            | Format::R32_UINT
            | Format::R32_SFLOAT
            | Format::D32_SFLOAT
            | Format::D24_UNORM_S8_UINT => 4,
            Format::R16G16B16A16_SFLOAT
            | Format::R32G32_SFLOAT
            | Format::D32_SFLOAT_S8_UINT
            | Format::BC1_RGBA_UNORM_BLOCK => 8,
            Format::R32G32B32A32_SFLOAT | Format::BC3_UNORM_BLOCK => 16,
        }
    }

    /// Returns the extent of one texel block, `[1, 1, 1]` for uncompressed formats.
    #[inline]
    pub const fn block_extent(self) -> [u32; 3] {
        if self.is_compressed() {
            [4, 4, 1]
        } else {
            [1, 1, 1]
        }
    }

    #[inline]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Format::BC1_RGBA_UNORM_BLOCK | Format::BC3_UNORM_BLOCK)
    }

    #[inline]
    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16_UNORM
                | Format::D32_SFLOAT
                | Format::D24_UNORM_S8_UINT
                | Format::D32_SFLOAT_S8_UINT
        )
    }

    #[inline]
    pub const fn is_stencil(self) -> bool {
        matches!(self, Format::D24_UNORM_S8_UINT | Format::D32_SFLOAT_S8_UINT)
    }

    /// Returns whether the format has a depth or a stencil aspect.
    #[inline]
    pub const fn is_depth_stencil(self) -> bool {
        self.is_depth() || self.is_stencil()
    }

    /// Returns the aspects that image barriers on this format must name.
    pub fn aspects(self) -> ImageAspects {
        let mut aspects = ImageAspects::empty();

        if self.is_depth() {
            aspects |= ImageAspects::DEPTH;
        }

        if self.is_stencil() {
            aspects |= ImageAspects::STENCIL;
        }

        if aspects.is_empty() {
            ImageAspects::COLOR
        } else {
            aspects
        }
    }

    /// Returns the single aspect that buffer-image copies and blits on this format name. For
    /// combined depth/stencil formats that is the depth aspect; their stencil aspect has to be
    /// copied on its own.
    pub fn copy_aspect(self) -> ImageAspects {
        if self.is_depth() {
            ImageAspects::DEPTH
        } else if self.is_stencil() {
            ImageAspects::STENCIL
        } else {
            ImageAspects::COLOR
        }
    }

    /// Returns the number of bytes needed to store a region of `extent` texels, rounding every
    /// dimension up to whole blocks.
    pub fn footprint(self, extent: Extent3D) -> DeviceSize {
        let [bw, bh, bd] = self.block_extent();

        DeviceSize::from(extent.width.div_ceil(bw))
            * DeviceSize::from(extent.height.div_ceil(bh))
            * DeviceSize::from(extent.depth.div_ceil(bd))
            * self.block_size()
    }

    /// Returns the host description whose bytes are identical to this format's texels, or
    /// [`None`] for compressed and packed depth/stencil formats, which have no such description
    /// and are never converted.
    pub const fn native_image_format(self) -> Option<(ImageFormat, DataType)> {
        Some(match self {
            Format::R8_UNORM => (ImageFormat::R, DataType::UInt8),
            Format::R8G8_UNORM => (ImageFormat::RG, DataType::UInt8),
            Format::R8G8B8A8_UNORM | Format::R8G8B8A8_SRGB => (ImageFormat::RGBA, DataType::UInt8),
            Format::B8G8R8A8_UNORM | Format::B8G8R8A8_SRGB => (ImageFormat::BGRA, DataType::UInt8),
            Format::R16_SFLOAT => (ImageFormat::R, DataType::Float16),
            Format::R16G16B16A16_SFLOAT => (ImageFormat::RGBA, DataType::Float16),
            Format::R32_UINT => (ImageFormat::R, DataType::UInt32),
            Format::R32_SFLOAT => (ImageFormat::R, DataType::Float32),
            Format::R32G32_SFLOAT => (ImageFormat::RG, DataType::Float32),
            Format::R32G32B32A32_SFLOAT => (ImageFormat::RGBA, DataType::Float32),
            Format::D16_UNORM => (ImageFormat::Depth, DataType::UInt16),
            Format::D32_SFLOAT => (ImageFormat::Depth, DataType::Float32),
            Format::D24_UNORM_S8_UINT
            | Format::D32_SFLOAT_S8_UINT
            | Format::BC1_RGBA_UNORM_BLOCK
            | Format::BC3_UNORM_BLOCK => return None,
        })
    }
}

impl From<Format> for ash::vk::ImageAspectFlags {
    #[inline]
    fn from(val: Format) -> Self {
        val.aspects().into()
    }
}

/// Which components host image data has, and in which order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R,
    RG,
    RGB,
    RGBA,
    BGRA,
    Depth,
    DepthStencil,
}

impl ImageFormat {
    /// Returns the number of components per texel.
    #[inline]
    pub const fn component_count(self) -> usize {
        match self {
            ImageFormat::R | ImageFormat::Depth => 1,
            ImageFormat::RG | ImageFormat::DepthStencil => 2,
            ImageFormat::RGB => 3,
            ImageFormat::RGBA | ImageFormat::BGRA => 4,
        }
    }

    /// Returns, for each component in memory order, the RGBA channel it holds.
    pub(crate) const fn channels(self) -> &'static [usize] {
        match self {
            ImageFormat::R | ImageFormat::Depth => &[0],
            ImageFormat::RG | ImageFormat::DepthStencil => &[0, 1],
            ImageFormat::RGB => &[0, 1, 2],
            ImageFormat::RGBA => &[0, 1, 2, 3],
            ImageFormat::BGRA => &[2, 1, 0, 3],
        }
    }
}

/// How each component of host image data is encoded.
///
/// Integer types are normalized: the full range of the type maps to `[0, 1]` for unsigned and
/// `[-1, 1]` for signed types when converting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    /// Returns the size in bytes of one component.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }
}

/// Returns the number of bytes host image data of `texel_count` texels occupies.
#[inline]
pub fn image_data_size(format: ImageFormat, data_type: DataType, texel_count: u64) -> DeviceSize {
    texel_count * format.component_count() as DeviceSize * data_type.size() as DeviceSize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_rounds_to_blocks() {
        let extent = Extent3D::new(5, 5, 1);

        assert_eq!(Format::R8G8B8A8_UNORM.footprint(extent), 100);
        assert_eq!(Format::BC1_RGBA_UNORM_BLOCK.footprint(extent), 4 * 8);
        assert_eq!(Format::BC3_UNORM_BLOCK.footprint(Extent3D::new(4, 4, 1)), 16);
        assert_eq!(
            Format::R32G32B32A32_SFLOAT.footprint(Extent3D::new(2, 2, 2)),
            8 * 16,
        );
    }

    #[test]
    fn native_description_matches_block_size() {
        for &format in Format::ALL {
            if let Some((image_format, data_type)) = format.native_image_format() {
                assert_eq!(
                    image_data_size(image_format, data_type, 1),
                    format.block_size(),
                    "{:?}",
                    format,
                );
            } else {
                assert!(format.is_compressed() || format.is_stencil());
            }
        }
    }

    #[test]
    fn aspects() {
        assert_eq!(Format::R8G8B8A8_UNORM.aspects(), ImageAspects::COLOR);
        assert_eq!(Format::D32_SFLOAT.aspects(), ImageAspects::DEPTH);
        assert_eq!(
            Format::D24_UNORM_S8_UINT.aspects(),
            ImageAspects::DEPTH | ImageAspects::STENCIL,
        );
        assert!(Format::D16_UNORM.is_depth_stencil());
        assert!(!Format::BC1_RGBA_UNORM_BLOCK.is_depth_stencil());

        for &format in Format::ALL {
            let aspect = format.copy_aspect();

            assert_eq!(ash::vk::ImageAspectFlags::from(aspect).as_raw().count_ones(), 1);
            assert!(format.aspects().contains(aspect), "{:?}", format);
        }
    }

    #[test]
    fn converts_to_native() {
        assert_eq!(
            ash::vk::Format::from(Format::B8G8R8A8_SRGB),
            ash::vk::Format::B8G8R8A8_SRGB,
        );
        assert_eq!(
            Format::try_from(ash::vk::Format::D32_SFLOAT),
            Ok(Format::D32_SFLOAT),
        );
        assert!(Format::try_from(ash::vk::Format::ASTC_4X4_UNORM_BLOCK).is_err());
    }
}
