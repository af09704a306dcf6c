// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory types and heaps, and the chunked sub-allocator built on top of them.
//!
//! A device exposes a handful of *memory types*, each with a set of [`MemoryPropertyFlags`] and
//! living in one *memory heap*. Every resource reports [`MemoryRequirements`]: a size, an
//! alignment and a bitmask of the memory types it may be bound to. The
//! [`DeviceMemoryManager`](allocator::DeviceMemoryManager) turns such requirements into
//! [`MemoryRegion`](allocator::MemoryRegion)s.

use self::allocator::DeviceLayout;
use crate::DeviceSize;

pub mod allocator;

/// Properties of the memory of a device.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// The available memory types.
    pub memory_types: Vec<MemoryType>,

    /// The available memory heaps.
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// Returns the indices of the memory types allowed by `memory_type_bits` whose property
    /// flags contain `required`, in ascending index order.
    pub fn compatible_types(
        &self,
        memory_type_bits: u32,
        required: MemoryPropertyFlags,
    ) -> impl Iterator<Item = u32> + '_ {
        self.memory_types
            .iter()
            .enumerate()
            .filter(move |&(index, memory_type)| {
                memory_type_bits & (1 << index) != 0
                    && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }
}

impl From<&ash::vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(val: &ash::vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_types: val.memory_types[..val.memory_type_count as usize]
                .iter()
                .map(|memory_type| MemoryType {
                    property_flags: memory_type.property_flags.into(),
                    heap_index: memory_type.heap_index,
                })
                .collect(),
            memory_heaps: val.memory_heaps[..val.memory_heap_count as usize]
                .iter()
                .map(|memory_heap| MemoryHeap {
                    size: memory_heap.size,
                    flags: memory_heap.flags.into(),
                })
                .collect(),
        }
    }
}

/// A memory type in a physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,
}

vulkan_bitflags! {
    /// Properties of a memory type.
    MemoryPropertyFlags = MemoryPropertyFlags(u32);

    /// The memory is located on the device. Primary resource memory is always requested with
    /// this flag.
    DEVICE_LOCAL = DEVICE_LOCAL,

    /// The memory can be mapped into the memory space of the host and accessed as regular RAM.
    HOST_VISIBLE = HOST_VISIBLE,

    /// Host writes are visible to the device, and device writes to the host, without explicit
    /// flushing or invalidation. Staging memory is always requested with this flag.
    HOST_COHERENT = HOST_COHERENT,

    /// The memory is cached by the host.
    HOST_CACHED = HOST_CACHED,

    /// Allocations made from this memory type are lazily committed.
    LAZILY_ALLOCATED = LAZILY_ALLOCATED,
}

/// A memory heap in a physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    /// The size of the heap in bytes.
    pub size: DeviceSize,

    /// Attributes of the heap.
    pub flags: MemoryHeapFlags,
}

vulkan_bitflags! {
    /// Attributes of a memory heap.
    MemoryHeapFlags = MemoryHeapFlags(u32);

    /// The heap corresponds to device-local memory.
    DEVICE_LOCAL = DEVICE_LOCAL,
}

/// Represents requirements expressed by the device when it comes to binding memory to a
/// resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Memory layout required for the resource.
    pub layout: DeviceLayout,

    /// Indicates which memory types can be used. Each bit that is set to 1 means that the memory
    /// type whose index is the same as the position of the bit can be used.
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    /// Builds requirements from raw values, returning [`None`] if `size` is zero or `alignment`
    /// is not a power of two.
    #[inline]
    pub fn new(size: DeviceSize, alignment: DeviceSize, memory_type_bits: u32) -> Option<Self> {
        Some(MemoryRequirements {
            layout: DeviceLayout::from_size_alignment(size, alignment)?,
            memory_type_bits,
        })
    }
}

impl TryFrom<ash::vk::MemoryRequirements> for MemoryRequirements {
    type Error = ();

    #[inline]
    fn try_from(val: ash::vk::MemoryRequirements) -> Result<Self, Self::Error> {
        MemoryRequirements::new(val.size, val.alignment, val.memory_type_bits).ok_or(())
    }
}
