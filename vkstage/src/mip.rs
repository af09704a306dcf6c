// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Generation of mip chains by repeated blits.

use crate::{
    command_buffer::CommandRecorder,
    device::ImageBarrier,
    format::Format,
    image::{ImageLayout, Texture, TextureSubresource},
};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fills the mip levels of textures from their first level.
///
/// One generator exists per device; the
/// [`TransferOrchestrator`](crate::TransferOrchestrator) creates it and lends it to whatever
/// needs it.
#[derive(Debug, Default)]
pub struct MipGenerator {
    chains: AtomicU64,
    levels: AtomicU64,
}

impl MipGenerator {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether mips of `format` can be generated. Blits can't filter compressed or
    /// depth/stencil data.
    #[inline]
    pub fn supports(&self, format: Format) -> bool {
        !format.is_compressed() && !format.is_depth_stencil()
    }

    /// Records the generation of the levels of `subresource` after its first one, each from the
    /// level before it, and the transition of every level of `subresource` to `final_layout`.
    ///
    /// Every level of `subresource` must be tracked in `TransferDstOptimal`, and the first level
    /// must hold the data to downsample. Returns `false` without recording anything if the
    /// subresource has a single level or the format is not supported; the levels are then left
    /// as they are.
    ///
    /// # Safety
    ///
    /// - The texture must be alive until the recorder is flushed.
    pub unsafe fn generate(
        &self,
        recorder: &mut CommandRecorder<'_>,
        texture: &mut Texture,
        subresource: TextureSubresource,
        final_layout: ImageLayout,
    ) -> bool {
        if subresource.mip_levels <= 1 || !self.supports(texture.format()) {
            return false;
        }

        let image = texture.image();
        let format = texture.format();
        let aspects = format.aspects();
        let first = subresource.base_mip_level;
        let last = first + subresource.mip_levels - 1;

        for level in first + 1..=last {
            unsafe {
                recorder.record_transition(
                    image,
                    format,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::TransferSrcOptimal,
                    subresource.mip(level - 1),
                )
            };
            unsafe {
                recorder.record_blit(
                    image,
                    format,
                    subresource,
                    (level - 1, texture.mip_extent(level - 1)),
                    (level, texture.mip_extent(level)),
                )
            };
        }

        let barrier = |old_layout, levels: TextureSubresource| ImageBarrier {
            image,
            aspects,
            old_layout,
            new_layout: final_layout,
            subresource: levels,
        };

        let mut barriers: SmallVec<[ImageBarrier; 2]> = SmallVec::new();
        let sources = TextureSubresource {
            mip_levels: subresource.mip_levels - 1,
            ..subresource
        };

        if final_layout != ImageLayout::TransferSrcOptimal {
            barriers.push(barrier(ImageLayout::TransferSrcOptimal, sources));
        }

        if final_layout != ImageLayout::TransferDstOptimal {
            barriers.push(barrier(ImageLayout::TransferDstOptimal, subresource.mip(last)));
        }

        unsafe { recorder.record_transitions(&barriers) };
        texture.set_layout(subresource, final_layout);

        self.chains.fetch_add(1, Ordering::Relaxed);
        self.levels
            .fetch_add(u64::from(subresource.mip_levels - 1), Ordering::Relaxed);

        true
    }

    /// Returns how many mip chains and how many levels have been generated.
    #[inline]
    pub fn generated(&self) -> (u64, u64) {
        (
            self.chains.load(Ordering::Relaxed),
            self.levels.load(Ordering::Relaxed),
        )
    }
}
