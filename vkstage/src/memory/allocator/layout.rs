// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{DeviceSize, NonZeroDeviceSize};
use std::{
    cmp,
    fmt::{Debug, Formatter, Result as FmtResult},
};

/// Vulkan analog of std's `Layout`, represented using [`DeviceSize`]s.
///
/// Unlike `Layout`s, `DeviceLayout`s are required to have non-zero size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a memory block after its layout's size has been rounded up to the
    /// nearest multiple of its layout's alignment.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        if let (Some(size), Some(alignment)) = (
            NonZeroDeviceSize::new(size),
            DeviceAlignment::new(alignment),
        ) {
            DeviceLayout::new(size, alignment)
        } else {
            None
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        // `MAX_SIZE` is `DeviceAlignment::MAX - 1`, so this can't underflow.
        if size.get() > DeviceLayout::MAX_SIZE - (alignment.as_devicesize() - 1) {
            None
        } else {
            Some(DeviceLayout { size, alignment })
        }
    }

    /// Returns the minimum size in bytes for a memory block of this layout.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the minimum alignment for a memory block of this layout.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Creates a new `DeviceLayout` from `self` that is also aligned to `alignment` at minimum.
    #[inline]
    pub fn align_to(&self, alignment: DeviceAlignment) -> Option<Self> {
        DeviceLayout::new(self.size, cmp::max(self.alignment, alignment))
    }

    /// Returns the size rounded up to the nearest multiple of the alignment.
    #[inline]
    pub const fn padded_size(&self) -> DeviceSize {
        align_up(self.size(), self.alignment)
    }
}

/// Vulkan analog of std's `Alignment`, stored as a [`DeviceSize`] that is guaranteed to be a
/// power of two.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZeroDeviceSize::MIN);

    /// The largest possible alignment, 2<sup>63</sup>.
    pub const MAX: Self = match NonZeroDeviceSize::new(1 << 63) {
        Some(alignment) => Self(alignment),
        None => unreachable!(),
    };

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        match NonZeroDeviceSize::new(alignment) {
            Some(alignment) if alignment.is_power_of_two() => Some(Self(alignment)),
            _ => None,
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.log2())
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Rounds `val` up to the nearest multiple of `alignment`.
#[inline(always)]
pub const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val.wrapping_add(alignment.as_devicesize() - 1), alignment)
}

/// Rounds `val` down to the nearest multiple of `alignment`.
#[inline(always)]
pub const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}

/// Returns whether `offset` is a multiple of `alignment`.
#[inline(always)]
pub const fn is_aligned(offset: DeviceSize, alignment: DeviceAlignment) -> bool {
    offset & (alignment.as_devicesize() - 1) == 0
}

/// Rounds `val` up to the nearest multiple of `granularity`, which need not be a power of two.
#[inline]
pub(crate) fn round_up_to(val: DeviceSize, granularity: DeviceSize) -> Option<DeviceSize> {
    debug_assert!(granularity != 0);

    val.checked_add(granularity - 1)
        .map(|v| v / granularity * granularity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rejects_non_powers_of_two() {
        assert!(DeviceAlignment::new(0).is_none());
        assert!(DeviceAlignment::new(3).is_none());
        assert!(DeviceAlignment::new(48).is_none());
        assert_eq!(DeviceAlignment::new(64).unwrap().log2(), 6);
        assert_eq!(DeviceAlignment::MAX.log2(), 63);
    }

    #[test]
    fn layout_rejects_zero_size_and_overflow() {
        assert!(DeviceLayout::from_size_alignment(0, 1).is_none());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 1).is_some());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 2).is_none());

        let layout = DeviceLayout::from_size_alignment(100, 64).unwrap();
        assert_eq!(layout.padded_size(), 128);
        assert_eq!(
            layout
                .align_to(DeviceAlignment::new(256).unwrap())
                .unwrap()
                .alignment()
                .as_devicesize(),
            256,
        );
    }

    #[test]
    fn rounding() {
        let a = DeviceAlignment::new(256).unwrap();

        assert_eq!(align_up(0, a), 0);
        assert_eq!(align_up(1, a), 256);
        assert_eq!(align_up(256, a), 256);
        assert_eq!(align_down(511, a), 256);
        assert!(is_aligned(512, a));
        assert!(!is_aligned(513, a));

        assert_eq!(round_up_to(1, 1000), Some(1000));
        assert_eq!(round_up_to(2001, 1000), Some(3000));
        assert_eq!(round_up_to(DeviceSize::MAX, 1000), None);
    }
}
