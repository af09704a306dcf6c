// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use ash::vk;

vulkan_enum! {
    /// In-memory layout of the texel data of an image subresource.
    ///
    /// Every operation on an image is only possible with specific layouts, so before a copy the
    /// targeted subresources are transitioned into `TransferDstOptimal` or `TransferSrcOptimal`,
    /// and afterwards into a layout that shaders can sample from. The device does not track
    /// layouts itself; [`Texture`](crate::image::Texture) records the current layout of each of
    /// its subresources so that transitions always name the correct old layout.
    ImageLayout = ImageLayout(i32);

    /// The layout of the data is unknown, and the image is treated as containing no valid data.
    /// Transitioning from `Undefined` discards any existing texel data.
    Undefined = UNDEFINED,

    /// A general-purpose layout that can be used for any operation.
    General = GENERAL,

    /// For a color image used as a color attachment.
    ColorAttachmentOptimal = COLOR_ATTACHMENT_OPTIMAL,

    /// For a depth/stencil image used as a depth/stencil attachment.
    DepthStencilAttachmentOptimal = DEPTH_STENCIL_ATTACHMENT_OPTIMAL,

    /// For a depth/stencil image that is only read, by attachments or shaders.
    DepthStencilReadOnlyOptimal = DEPTH_STENCIL_READ_ONLY_OPTIMAL,

    /// For an image sampled in a shader. This is where uploads leave textures by default.
    ShaderReadOnlyOptimal = SHADER_READ_ONLY_OPTIMAL,

    /// For the source of a copy or blit.
    TransferSrcOptimal = TRANSFER_SRC_OPTIMAL,

    /// For the destination of a copy or blit.
    TransferDstOptimal = TRANSFER_DST_OPTIMAL,

    /// The host wrote the data directly; like `Undefined` but contents are preserved.
    Preinitialized = PREINITIALIZED,
}

impl ImageLayout {
    /// Returns the access mask and pipeline stage that a barrier must use on the side of this
    /// layout.
    pub(crate) fn access_and_stage(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            ImageLayout::Undefined | ImageLayout::Preinitialized => (
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TOP_OF_PIPE,
            ),
            ImageLayout::General => (
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
            ImageLayout::ColorAttachmentOptimal => (
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
            ImageLayout::DepthStencilAttachmentOptimal => (
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            ),
            ImageLayout::DepthStencilReadOnlyOptimal => (
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            ImageLayout::ShaderReadOnlyOptimal => (
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            ImageLayout::TransferSrcOptimal => (
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
            ),
            ImageLayout::TransferDstOptimal => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
        }
    }

    /// Returns whether texel data survives a transition out of this layout.
    #[inline]
    pub fn preserves_contents(self) -> bool {
        self != ImageLayout::Undefined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_layouts_use_transfer_stage() {
        for layout in [ImageLayout::TransferSrcOptimal, ImageLayout::TransferDstOptimal] {
            let (_, stage) = layout.access_and_stage();
            assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
        }

        let (access, stage) = ImageLayout::Undefined.access_and_stage();
        assert!(access.is_empty());
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn round_trips_through_native() {
        for &layout in ImageLayout::ALL {
            assert_eq!(ImageLayout::try_from(vk::ImageLayout::from(layout)), Ok(layout));
        }
    }
}
