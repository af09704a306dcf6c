// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::layout::{align_up, DeviceLayout};
use crate::DeviceSize;
use ash::vk;
use std::{collections::BTreeMap, ptr::NonNull};

/// A contiguous `[offset, offset + size)` span inside a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

impl Span {
    #[inline]
    pub const fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

#[derive(Clone, Copy, Debug)]
struct Allocation {
    size: DeviceSize,
    mapped: bool,
}

/// One native allocation from a single memory type, divided among regions.
///
/// Free spans are kept sorted by offset and never overlap or touch; two free spans that become
/// adjacent are merged immediately. Allocated spans are kept in a map keyed by offset. Every
/// byte of the chunk is in exactly one of the two.
#[derive(Debug)]
pub(crate) struct MemoryChunk {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    size: DeviceSize,
    free_list: Vec<Span>,
    allocations: BTreeMap<DeviceSize, Allocation>,
    free_size: DeviceSize,
    // The whole chunk is mapped natively once and shared by every mapped region.
    mapping: Option<NonNull<u8>>,
    map_count: u32,
}

// SAFETY: The mapped pointer is only dereferenced through `&mut DeviceMemoryManager`, which
// serializes all access to the chunk.
unsafe impl Send for MemoryChunk {}
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    pub(crate) fn new(memory: vk::DeviceMemory, memory_type_index: u32, size: DeviceSize) -> Self {
        MemoryChunk {
            memory,
            memory_type_index,
            size,
            free_list: vec![Span { offset: 0, size }],
            allocations: BTreeMap::new(),
            free_size: size,
            mapping: None,
            map_count: 0,
        }
    }

    #[inline]
    pub(crate) fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub(crate) fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[inline]
    pub(crate) fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub(crate) fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    #[inline]
    pub(crate) fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    #[inline]
    pub(crate) fn free_spans(&self) -> &[Span] {
        &self.free_list
    }

    #[cfg(test)]
    fn allocated_spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.allocations.iter().map(|(&offset, allocation)| Span {
            offset,
            size: allocation.size,
        })
    }

    pub(crate) fn largest_free_span(&self) -> DeviceSize {
        self.free_list.iter().map(|span| span.size).max().unwrap_or(0)
    }

    /// Reserves the first span, in address order, that can hold `layout` once its offset is
    /// aligned. Returns the aligned offset.
    pub(crate) fn allocate(&mut self, layout: DeviceLayout) -> Option<DeviceSize> {
        let size = layout.size();

        if self.free_size < size {
            return None;
        }

        let (index, offset) = self.free_list.iter().enumerate().find_map(|(index, span)| {
            let offset = align_up(span.offset, layout.alignment());

            (offset.checked_add(size)? <= span.end()).then_some((index, offset))
        })?;

        self.split(index, offset, size);
        self.allocations.insert(
            offset,
            Allocation {
                size,
                mapped: false,
            },
        );
        self.free_size -= size;

        Some(offset)
    }

    /// Carves `[offset, offset + size)` out of the free span at `index`, leaving the front and
    /// back padding free.
    fn split(&mut self, index: usize, offset: DeviceSize, size: DeviceSize) {
        let span = self.free_list[index];

        debug_assert!(offset >= span.offset);
        debug_assert!(offset + size <= span.end());

        let front = Span {
            offset: span.offset,
            size: offset - span.offset,
        };
        let back = Span {
            offset: offset + size,
            size: span.end() - offset - size,
        };

        match (front.size > 0, back.size > 0) {
            (false, false) => {
                self.free_list.remove(index);
            }
            (true, false) => self.free_list[index] = front,
            (false, true) => self.free_list[index] = back,
            (true, true) => {
                self.free_list[index] = front;
                self.free_list.insert(index + 1, back);
            }
        }
    }

    /// Returns `[offset, offset + size)` to the free list, merging it with adjacent free spans.
    ///
    /// Fails if the span is not exactly one live allocation of this chunk. Returns `true` if the
    /// allocation held the last share of the chunk mapping, in which case the caller must unmap
    /// the chunk natively.
    pub(crate) fn free(&mut self, offset: DeviceSize, size: DeviceSize) -> Result<bool, ()> {
        match self.allocations.get(&offset) {
            Some(allocation) if allocation.size == size => {}
            _ => return Err(()),
        }

        let allocation = self.allocations.remove(&offset).ok_or(())?;
        let unmap_chunk = allocation.mapped && self.unmap_one();

        self.free_size += size;

        let index = self.free_list.partition_point(|span| span.offset < offset);
        let mut span = Span { offset, size };

        let merges_next = self
            .free_list
            .get(index)
            .is_some_and(|next| next.offset == span.end());
        if merges_next {
            span.size += self.free_list.remove(index).size;
        }

        let merges_prev = index > 0 && self.free_list[index - 1].end() == span.offset;
        if merges_prev {
            self.free_list[index - 1].size += span.size;
        } else {
            self.free_list.insert(index, span);
        }

        Ok(unmap_chunk)
    }

    /// Returns whether `[offset, offset + size)` is exactly one live allocation.
    pub(crate) fn contains(&self, offset: DeviceSize, size: DeviceSize) -> bool {
        self.allocations
            .get(&offset)
            .is_some_and(|allocation| allocation.size == size)
    }

    #[inline]
    pub(crate) fn is_mapped(&self, offset: DeviceSize) -> bool {
        self.allocations
            .get(&offset)
            .is_some_and(|allocation| allocation.mapped)
    }

    #[cfg(test)]
    fn mapping(&self) -> Option<NonNull<u8>> {
        self.mapping
    }

    /// Marks the allocation at `offset` as mapped. `map_chunk` is called to obtain the native
    /// mapping when no other region of the chunk holds it.
    pub(crate) fn map_one<E>(
        &mut self,
        offset: DeviceSize,
        map_chunk: impl FnOnce() -> Result<NonNull<u8>, E>,
    ) -> Result<NonNull<u8>, E> {
        let ptr = match self.mapping {
            Some(ptr) => ptr,
            None => {
                let ptr = map_chunk()?;
                self.mapping = Some(ptr);
                ptr
            }
        };

        if let Some(allocation) = self.allocations.get_mut(&offset) {
            debug_assert!(!allocation.mapped);
            allocation.mapped = true;
            self.map_count += 1;
        }

        Ok(ptr)
    }

    /// Marks the allocation at `offset` as unmapped. Returns `true` when that was the last mapped
    /// region, in which case the caller must unmap the chunk natively.
    pub(crate) fn unmap(&mut self, offset: DeviceSize) -> bool {
        match self.allocations.get_mut(&offset) {
            Some(allocation) if allocation.mapped => {
                allocation.mapped = false;
                self.unmap_one()
            }
            _ => false,
        }
    }

    fn unmap_one(&mut self) -> bool {
        self.map_count -= 1;

        if self.map_count == 0 {
            self.mapping = None;
            true
        } else {
            false
        }
    }

    /// Forgets the native mapping without touching the allocations. Used right before the chunk
    /// memory is freed.
    pub(crate) fn take_mapping(&mut self) -> Option<NonNull<u8>> {
        self.map_count = 0;
        self.mapping.take()
    }
}
