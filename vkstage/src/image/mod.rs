// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Textures and the geometry used to address their texels.
//!
//! A texture is made of *subresources*: one per mip level and array layer. Regions passed to the
//! transfer functions name a single mip level, a range of array layers, and a box of texels
//! inside that level.
//!
//! Host data for several layers is laid out layer after layer, each layer being a tightly packed
//! copy of the region's box.

pub use self::{
    convert::{DstImage, SrcImage},
    layout::ImageLayout,
    texture::Texture,
};
use crate::{format::Format, NonExhaustive};
use ash::vk;

pub mod convert;
mod layout;
mod texture;

vulkan_bitflags! {
    /// The aspects of an image that a barrier or copy refers to.
    ImageAspects = ImageAspectFlags(u32);

    COLOR = COLOR,
    DEPTH = DEPTH,
    STENCIL = STENCIL,
}

/// The dimensionality and arrangement of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureType {
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
    Texture1DArray,
    Texture2DArray,
    TextureCubeArray,
    Texture2DMS,
    Texture2DMSArray,
}

impl TextureType {
    /// Returns whether the type has more than one sample per texel.
    #[inline]
    pub const fn is_multisample(self) -> bool {
        matches!(self, TextureType::Texture2DMS | TextureType::Texture2DMSArray)
    }

    /// Returns whether the type may have any number of array layers.
    #[inline]
    pub const fn is_array(self) -> bool {
        matches!(
            self,
            TextureType::Texture1DArray
                | TextureType::Texture2DArray
                | TextureType::TextureCubeArray
                | TextureType::Texture2DMSArray
        )
    }

    #[inline]
    pub const fn is_cube(self) -> bool {
        matches!(self, TextureType::TextureCube | TextureType::TextureCubeArray)
    }

    /// Returns the native image type the texture is created with.
    pub const fn image_type(self) -> vk::ImageType {
        match self {
            TextureType::Texture1D | TextureType::Texture1DArray => vk::ImageType::TYPE_1D,
            TextureType::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    /// Returns the number of levels in a full mip chain for a base extent of `extent`.
    ///
    /// Multisample types always have exactly one level.
    pub fn max_mip_levels(self, extent: Extent3D) -> u32 {
        let max_dim = match self.image_type() {
            _ if self.is_multisample() => return 1,
            vk::ImageType::TYPE_1D => extent.width,
            vk::ImageType::TYPE_3D => extent.width.max(extent.height).max(extent.depth),
            _ => extent.width.max(extent.height),
        };

        1 + max_dim.max(1).ilog2()
    }

    /// Returns the extent of mip level `level` for a base extent of `extent`. Dimensions that the
    /// type does not have stay at 1.
    pub fn mip_extent(self, extent: Extent3D, level: u32) -> Extent3D {
        let shrink = |dim: u32| (dim >> level.min(31)).max(1);

        match self.image_type() {
            vk::ImageType::TYPE_1D => Extent3D::new(shrink(extent.width), 1, 1),
            vk::ImageType::TYPE_3D => Extent3D::new(
                shrink(extent.width),
                shrink(extent.height),
                shrink(extent.depth),
            ),
            _ => Extent3D::new(shrink(extent.width), shrink(extent.height), 1),
        }
    }
}

/// A signed texel offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Offset3D {
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Offset3D { x, y, z }
    }
}

impl From<Offset3D> for vk::Offset3D {
    #[inline]
    fn from(val: Offset3D) -> Self {
        vk::Offset3D {
            x: val.x,
            y: val.y,
            z: val.z,
        }
    }
}

/// A size in texels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    #[inline]
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Extent3D {
            width,
            height,
            depth,
        }
    }

    /// Returns the number of texels in the box.
    #[inline]
    pub const fn texel_count(self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

impl Default for Extent3D {
    #[inline]
    fn default() -> Self {
        Extent3D::new(1, 1, 1)
    }
}

impl From<Extent3D> for vk::Extent3D {
    #[inline]
    fn from(val: Extent3D) -> Self {
        vk::Extent3D {
            width: val.width,
            height: val.height,
            depth: val.depth,
        }
    }
}

/// A range of mip levels and array layers of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureSubresource {
    pub base_array_layer: u32,
    pub array_layers: u32,
    pub base_mip_level: u32,
    pub mip_levels: u32,
}

impl TextureSubresource {
    /// The first layer of the first mip level.
    pub const FIRST: Self = TextureSubresource {
        base_array_layer: 0,
        array_layers: 1,
        base_mip_level: 0,
        mip_levels: 1,
    };

    /// Returns the subresource covering only mip level `level` of the same layers.
    #[inline]
    pub const fn mip(self, level: u32) -> Self {
        TextureSubresource {
            base_mip_level: level,
            mip_levels: 1,
            ..self
        }
    }

    /// Returns the native range with the given aspects.
    #[inline]
    pub fn to_range(self, aspects: ImageAspects) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspects.into(),
            base_mip_level: self.base_mip_level,
            level_count: self.mip_levels,
            base_array_layer: self.base_array_layer,
            layer_count: self.array_layers,
        }
    }

    /// Returns the native layers of the base mip level with the given aspects.
    #[inline]
    pub fn to_layers(self, aspects: ImageAspects) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: aspects.into(),
            mip_level: self.base_mip_level,
            base_array_layer: self.base_array_layer,
            layer_count: self.array_layers,
        }
    }
}

impl Default for TextureSubresource {
    #[inline]
    fn default() -> Self {
        TextureSubresource::FIRST
    }
}

/// A box of texels in one mip level of a range of array layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    /// The mip level and layers. `mip_levels` must be 1.
    pub subresource: TextureSubresource,
    pub offset: Offset3D,
    pub extent: Extent3D,
}

vulkan_bitflags! {
    /// Options for creating a texture.
    TextureFlags(u32);

    /// Leave the contents undefined when no initial data is given, instead of filling the
    /// texture with its clear color.
    NO_INITIAL_DATA = 1 << 0,

    /// Generate the whole mip chain from the base level when initial data is given.
    GENERATE_MIPS = 1 << 1,
}

/// Parameters to create a new [`Texture`].
#[derive(Clone, Debug)]
pub struct TextureDescriptor {
    /// The dimensionality of the texture.
    ///
    /// The default value is [`TextureType::Texture2D`].
    pub texture_type: TextureType,

    /// The default value is [`Format::R8G8B8A8_UNORM`].
    pub format: Format,

    /// The size of the base mip level. For 1D types `height` and `depth` must be 1, for all
    /// types other than 3D `depth` must be 1.
    ///
    /// The default value is `1×1×1`.
    pub extent: Extent3D,

    /// The number of array layers. Must be 1 for non-array types, 6 for cubes and a multiple of
    /// 6 for cube arrays.
    ///
    /// The default value is `1`.
    pub array_layers: u32,

    /// The number of mip levels, or 0 for the full chain.
    ///
    /// The default value is `1`.
    pub mip_levels: u32,

    /// The number of samples per texel. Must be greater than 1 exactly for the multisample
    /// types.
    ///
    /// The default value is `1`.
    pub samples: u32,

    /// The default value is empty.
    pub flags: TextureFlags,

    /// The color the texture is filled with when it is created without initial data. Ignored
    /// for compressed and depth/stencil formats.
    ///
    /// The default value is transparent black.
    pub clear_color: [f64; 4],

    pub _ne: NonExhaustive,
}

impl Default for TextureDescriptor {
    #[inline]
    fn default() -> Self {
        TextureDescriptor {
            texture_type: TextureType::Texture2D,
            format: Format::R8G8B8A8_UNORM,
            extent: Extent3D::new(1, 1, 1),
            array_layers: 1,
            mip_levels: 1,
            samples: 1,
            flags: TextureFlags::empty(),
            clear_color: [0.0; 4],
            _ne: NonExhaustive(()),
        }
    }
}

impl TextureDescriptor {
    /// Returns the number of mip levels the texture actually gets.
    #[inline]
    pub fn resolved_mip_levels(&self) -> u32 {
        if self.mip_levels == 0 {
            self.texture_type.max_mip_levels(self.extent)
        } else {
            self.mip_levels
        }
    }

    /// Checks that the parameters describe a texture that can exist.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        let &Self {
            texture_type,
            format: _,
            extent,
            array_layers,
            mip_levels,
            samples,
            flags: _,
            clear_color: _,
            _ne: _,
        } = self;

        if extent.is_empty() {
            return Err("texture extent must not be zero");
        }

        match texture_type.image_type() {
            vk::ImageType::TYPE_1D if extent.height != 1 || extent.depth != 1 => {
                return Err("1D textures must have a height and depth of 1");
            }
            vk::ImageType::TYPE_2D if extent.depth != 1 => {
                return Err("2D and cube textures must have a depth of 1");
            }
            _ => (),
        }

        if texture_type.is_cube() {
            if extent.width != extent.height {
                return Err("cube textures must be square");
            }

            if array_layers == 0 || array_layers % 6 != 0 {
                return Err("cube textures must have a multiple of 6 array layers");
            }

            if texture_type == TextureType::TextureCube && array_layers != 6 {
                return Err("non-array cube textures must have exactly 6 array layers");
            }
        } else if texture_type.is_array() {
            if array_layers == 0 {
                return Err("array textures must have at least one array layer");
            }
        } else if array_layers != 1 {
            return Err("non-array textures must have exactly one array layer");
        }

        if mip_levels > texture_type.max_mip_levels(extent) {
            return Err("number of mip levels exceeds the full mip chain");
        }

        if texture_type.is_multisample() != (samples > 1) {
            return Err("sample count does not match the texture type");
        }

        if !samples.is_power_of_two() {
            return Err("sample count must be a power of two");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mip_chain() {
        let tt = TextureType::Texture2D;

        assert_eq!(tt.max_mip_levels(Extent3D::new(1, 1, 1)), 1);
        assert_eq!(tt.max_mip_levels(Extent3D::new(64, 64, 1)), 7);
        assert_eq!(tt.max_mip_levels(Extent3D::new(100, 3, 1)), 7);
        assert_eq!(
            TextureType::Texture1DArray.max_mip_levels(Extent3D::new(16, 1, 1)),
            5,
        );
        assert_eq!(
            TextureType::Texture3D.max_mip_levels(Extent3D::new(2, 2, 32)),
            6,
        );
        assert_eq!(
            TextureType::Texture2DMS.max_mip_levels(Extent3D::new(64, 64, 1)),
            1,
        );
    }

    #[test]
    fn mip_extents() {
        let extent = Extent3D::new(64, 16, 1);

        assert_eq!(
            TextureType::Texture2D.mip_extent(extent, 3),
            Extent3D::new(8, 2, 1),
        );
        assert_eq!(
            TextureType::Texture2D.mip_extent(extent, 6),
            Extent3D::new(1, 1, 1),
        );
        assert_eq!(
            TextureType::Texture3D.mip_extent(Extent3D::new(8, 8, 8), 1),
            Extent3D::new(4, 4, 4),
        );
        assert_eq!(
            TextureType::Texture1D.mip_extent(Extent3D::new(8, 1, 1), 2),
            Extent3D::new(2, 1, 1),
        );
    }

    #[test]
    fn descriptor_validation() {
        let ok = TextureDescriptor {
            extent: Extent3D::new(64, 64, 1),
            mip_levels: 0,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.resolved_mip_levels(), 7);

        let cases = [
            TextureDescriptor {
                extent: Extent3D::new(0, 4, 1),
                ..Default::default()
            },
            TextureDescriptor {
                extent: Extent3D::new(4, 4, 2),
                ..Default::default()
            },
            TextureDescriptor {
                array_layers: 2,
                ..Default::default()
            },
            TextureDescriptor {
                texture_type: TextureType::TextureCube,
                extent: Extent3D::new(4, 4, 1),
                array_layers: 1,
                ..Default::default()
            },
            TextureDescriptor {
                extent: Extent3D::new(4, 4, 1),
                mip_levels: 4,
                ..Default::default()
            },
            TextureDescriptor {
                texture_type: TextureType::Texture2DMS,
                extent: Extent3D::new(4, 4, 1),
                ..Default::default()
            },
        ];

        for case in cases {
            assert!(case.validate().is_err(), "{:?}", case);
        }
    }
}
