// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The chunked device memory sub-allocator.
//!
//! Native allocations are expensive and their number is limited, so the [`DeviceMemoryManager`]
//! allocates large *chunks* of device memory and leases [`MemoryRegion`]s out of them.
//!
//! # Allocation policy
//!
//! For a request, the memory types allowed by the requirements and having the requested
//! properties are tried in index order. For each type, the existing chunks of that type are
//! scanned in creation order and the first one with a free span that fits the request (after
//! aligning its offset) is used. Inside a chunk the free spans are scanned in address order, so
//! the policy is first-fit at both levels. If no chunk fits, a new chunk is created for the
//! type. Only when the native allocation fails for every allowed type is
//! [`MemoryError::OutOfMemory`] returned.
//!
//! The size of a new chunk is the larger of [`min_allocation_size`] and the request, rounded up
//! to [`chunk_granularity`]. Requests larger than the granularity therefore get a chunk of their
//! own that is at least as large as the request.
//!
//! # Region lifetime
//!
//! A region refers to its chunk through a [`ChunkId`], an index into the manager's chunk table
//! plus a generation. When a chunk is destroyed its slot may be reused by a later chunk, but with
//! a bumped generation, so that a stale region is reported as [`MemoryError::InvalidRegion`]
//! instead of silently aliasing the new chunk. Regions are not `Clone` and [`release`] consumes
//! them; a region whose span is not (or no longer) a live allocation of its chunk is rejected.
//!
//! [`min_allocation_size`]: DeviceMemoryManagerCreateInfo::min_allocation_size
//! [`chunk_granularity`]: DeviceMemoryManagerCreateInfo::chunk_granularity
//! [`release`]: DeviceMemoryManager::release

pub use self::{
    chunk::Span,
    layout::{align_down, align_up, is_aligned, DeviceAlignment, DeviceLayout},
};
use self::{chunk::MemoryChunk, layout::round_up_to};
use super::{MemoryProperties, MemoryPropertyFlags, MemoryRequirements};
use crate::{device::RawDevice, DeviceSize, NonExhaustive, VulkanError};
use ash::vk;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    ptr::{self, NonNull},
    sync::Arc,
};

mod chunk;
mod layout;

const K: DeviceSize = 1024;
const M: DeviceSize = 1024 * K;

/// The default chunk granularity and minimum chunk size, 1 MiB.
pub const DEFAULT_CHUNK_GRANULARITY: DeviceSize = M;

/// Parameters to create a new [`DeviceMemoryManager`].
#[derive(Clone, Debug)]
pub struct DeviceMemoryManagerCreateInfo {
    /// The size of every chunk is a multiple of this value. Must not be zero.
    ///
    /// The default value is 1 MiB.
    pub chunk_granularity: DeviceSize,

    /// The smallest chunk that is ever created, before rounding to the granularity.
    ///
    /// The default value is 1 MiB.
    pub min_allocation_size: DeviceSize,

    /// Destroy a chunk as soon as its last region is released, instead of keeping it around for
    /// later requests until the manager is dropped or [`DeviceMemoryManager::defragment`] is
    /// called.
    ///
    /// The default value is `false`.
    pub reduce_fragmentation: bool,

    pub _ne: NonExhaustive,
}

impl Default for DeviceMemoryManagerCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceMemoryManagerCreateInfo {
            chunk_granularity: DEFAULT_CHUNK_GRANULARITY,
            min_allocation_size: DEFAULT_CHUNK_GRANULARITY,
            reduce_fragmentation: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// Identifies a chunk in the chunk table of a [`DeviceMemoryManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId {
    index: u32,
    generation: u32,
}

impl ChunkId {
    /// Returns the slot of the chunk in the chunk table.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Returns how many chunks occupied the slot before this one.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// A lease on `[offset, offset + size)` of one chunk.
///
/// The region owns no device memory. It must be handed back with
/// [`DeviceMemoryManager::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    chunk: ChunkId,
    offset: DeviceSize,
    size: DeviceSize,
    alignment: DeviceAlignment,
}

impl MemoryRegion {
    #[inline]
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Returns the offset of the region from the start of its chunk.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the alignment that was requested for the region. The offset is a multiple of it.
    #[inline]
    pub fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }
}

struct Slot {
    generation: u32,
    chunk: Option<MemoryChunk>,
}

/// Sub-allocates device memory out of large per-memory-type chunks.
///
/// See the [module-level documentation](self) for the allocation policy.
///
/// All mutating operations take `&mut self`: a manager has a single writer, and callers that
/// create resources from several threads must serialize access or use one manager per thread.
pub struct DeviceMemoryManager {
    device: Arc<dyn RawDevice>,
    properties: MemoryProperties,
    chunk_granularity: DeviceSize,
    min_allocation_size: DeviceSize,
    reduce_fragmentation: bool,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    // Per memory type, slot indices in chunk creation order.
    chunks_by_type: Vec<Vec<u32>>,
}

impl DeviceMemoryManager {
    /// Creates a new `DeviceMemoryManager`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.chunk_granularity` is zero.
    pub fn new(device: Arc<dyn RawDevice>, create_info: DeviceMemoryManagerCreateInfo) -> Self {
        Self::validate_new(&create_info);

        let DeviceMemoryManagerCreateInfo {
            chunk_granularity,
            min_allocation_size,
            reduce_fragmentation,
            _ne: _,
        } = create_info;

        let properties = device.memory_properties();
        let chunks_by_type = vec![Vec::new(); properties.memory_types.len()];

        DeviceMemoryManager {
            device,
            properties,
            chunk_granularity,
            min_allocation_size,
            reduce_fragmentation,
            slots: Vec::new(),
            free_slots: Vec::new(),
            chunks_by_type,
        }
    }

    fn validate_new(create_info: &DeviceMemoryManagerCreateInfo) {
        assert!(
            create_info.chunk_granularity != 0,
            "`create_info.chunk_granularity` must not be zero",
        );
    }

    /// Returns the device the chunks are allocated from.
    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline]
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    #[inline]
    pub fn chunk_granularity(&self) -> DeviceSize {
        self.chunk_granularity
    }

    #[inline]
    pub fn reduce_fragmentation(&self) -> bool {
        self.reduce_fragmentation
    }

    /// Leases a region satisfying `requirements` from a memory type whose property flags contain
    /// `property_flags`.
    pub fn allocate(
        &mut self,
        requirements: MemoryRequirements,
        property_flags: MemoryPropertyFlags,
    ) -> Result<MemoryRegion, MemoryError> {
        let MemoryRequirements {
            layout,
            memory_type_bits,
        } = requirements;

        let memory_types: SmallVec<[u32; 8]> = self
            .properties
            .compatible_types(memory_type_bits, property_flags)
            .collect();

        if memory_types.is_empty() {
            return Err(MemoryError::NoSuitableMemoryType);
        }

        for memory_type_index in memory_types {
            if let Some(region) = self.allocate_from_existing(memory_type_index, layout) {
                return Ok(region);
            }

            match self.create_chunk(memory_type_index, layout) {
                Ok(index) => {
                    if let Some(region) = self.allocate_from_chunk(index, layout) {
                        return Ok(region);
                    }
                }
                Err(err) if err.is_out_of_memory() => continue,
                Err(err) => return Err(MemoryError::Device(err)),
            }
        }

        Err(MemoryError::OutOfMemory {
            size: layout.size(),
            memory_type_bits,
        })
    }

    fn allocate_from_existing(
        &mut self,
        memory_type_index: u32,
        layout: DeviceLayout,
    ) -> Option<MemoryRegion> {
        // Indexing instead of iterating, because allocating borrows `self` mutably.
        for i in 0..self.chunks_by_type[memory_type_index as usize].len() {
            let index = self.chunks_by_type[memory_type_index as usize][i];

            if let Some(region) = self.allocate_from_chunk(index, layout) {
                return Some(region);
            }
        }

        None
    }

    fn allocate_from_chunk(&mut self, index: u32, layout: DeviceLayout) -> Option<MemoryRegion> {
        let slot = &mut self.slots[index as usize];
        let offset = slot.chunk.as_mut()?.allocate(layout)?;

        let region = MemoryRegion {
            chunk: ChunkId {
                index,
                generation: slot.generation,
            },
            offset,
            size: layout.size(),
            alignment: layout.alignment(),
        };

        log::trace!(
            "allocated region of {} bytes at offset {} of chunk {}",
            region.size,
            region.offset,
            index,
        );

        Some(region)
    }

    fn create_chunk(
        &mut self,
        memory_type_index: u32,
        layout: DeviceLayout,
    ) -> Result<u32, VulkanError> {
        let size = round_up_to(
            self.min_allocation_size.max(layout.padded_size()),
            self.chunk_granularity,
        )
        .ok_or(VulkanError::OutOfDeviceMemory)?;

        let memory = self.device.allocate_memory(size, memory_type_index)?;
        let chunk = MemoryChunk::new(memory, memory_type_index, size);

        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize].chunk = Some(chunk);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    chunk: Some(chunk),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.chunks_by_type[memory_type_index as usize].push(index);

        log::debug!(
            "created chunk {} of {} bytes from memory type {}",
            index,
            size,
            memory_type_index,
        );

        Ok(index)
    }

    fn destroy_chunk(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        let Some(mut chunk) = slot.chunk.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(index);
        self.chunks_by_type[chunk.memory_type_index() as usize].retain(|&i| i != index);

        log::debug!(
            "destroying chunk {} of {} bytes from memory type {}",
            index,
            chunk.size(),
            chunk.memory_type_index(),
        );

        // SAFETY: The chunk has just been removed from the table, so nothing refers to its
        // memory any longer.
        unsafe {
            if chunk.take_mapping().is_some() {
                self.device.unmap_memory(chunk.memory());
            }

            self.device.free_memory(chunk.memory());
        }
    }

    fn chunk(&self, region: &MemoryRegion) -> Result<&MemoryChunk, MemoryError> {
        self.slots
            .get(region.chunk.index as usize)
            .filter(|slot| slot.generation == region.chunk.generation)
            .and_then(|slot| slot.chunk.as_ref())
            .filter(|chunk| chunk.contains(region.offset, region.size))
            .ok_or(MemoryError::InvalidRegion)
    }

    fn chunk_mut(&mut self, region: &MemoryRegion) -> Result<&mut MemoryChunk, MemoryError> {
        self.chunk(region)?;

        self.slots[region.chunk.index as usize]
            .chunk
            .as_mut()
            .ok_or(MemoryError::InvalidRegion)
    }

    /// Returns the span of `region` to its chunk, merging it with the adjacent free spans.
    ///
    /// With [`reduce_fragmentation`] enabled, a chunk left without regions is destroyed.
    ///
    /// [`reduce_fragmentation`]: DeviceMemoryManagerCreateInfo::reduce_fragmentation
    pub fn release(&mut self, region: MemoryRegion) -> Result<(), MemoryError> {
        let device = self.device.clone();
        let chunk = self.chunk_mut(&region)?;

        let unmap_chunk = chunk
            .free(region.offset, region.size)
            .map_err(|()| MemoryError::InvalidRegion)?;

        if unmap_chunk {
            // SAFETY: No region of the chunk is mapped any longer.
            unsafe { device.unmap_memory(chunk.memory()) };
        }

        let now_empty = chunk.is_empty();

        log::trace!(
            "released region of {} bytes at offset {} of chunk {}",
            region.size,
            region.offset,
            region.chunk.index,
        );

        if now_empty && self.reduce_fragmentation {
            self.destroy_chunk(region.chunk.index);
        }

        Ok(())
    }

    /// Destroys every chunk that has no regions left. Returns the number of bytes given back to
    /// the device.
    pub fn defragment(&mut self) -> DeviceSize {
        let empty: SmallVec<[(u32, DeviceSize); 8]> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let chunk = slot.chunk.as_ref()?;

                chunk.is_empty().then_some((index as u32, chunk.size()))
            })
            .collect();

        let mut freed = 0;

        for (index, size) in empty {
            self.destroy_chunk(index);
            freed += size;
        }

        freed
    }

    /// Maps `[offset, offset + size)` of `region` into host memory and returns a pointer to it.
    ///
    /// The pointer stays valid until the region is unmapped or released. Each region may be
    /// mapped only once at a time.
    pub fn map(
        &mut self,
        region: &MemoryRegion,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let end = offset.checked_add(size).ok_or(MemoryError::OutOfBounds)?;

        if end > region.size {
            return Err(MemoryError::OutOfBounds);
        }

        let chunk = self.chunk(region)?;
        let property_flags = self.properties.memory_types[chunk.memory_type_index() as usize]
            .property_flags;

        if !property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT)
        {
            return Err(MemoryError::InvalidAccess);
        }

        if chunk.is_mapped(region.offset) {
            return Err(MemoryError::AlreadyMapped);
        }

        let device = self.device.clone();
        let chunk = self.chunk_mut(region)?;
        let (memory, chunk_size) = (chunk.memory(), chunk.size());

        let base = chunk
            .map_one(region.offset, || {
                // SAFETY: The chunk is not mapped, which is checked by `map_one`.
                unsafe { device.map_memory(memory, 0, chunk_size) }
            })
            .map_err(MemoryError::Device)?;

        // SAFETY: `region.offset + end` lies within the chunk, which is mapped in full.
        Ok(unsafe { base.add((region.offset + offset) as usize) })
    }

    /// Unmaps `region`. The chunk itself is unmapped natively once none of its regions is mapped.
    pub fn unmap(&mut self, region: &MemoryRegion) -> Result<(), MemoryError> {
        let device = self.device.clone();
        let chunk = self.chunk_mut(region)?;

        if !chunk.is_mapped(region.offset) {
            return Err(MemoryError::NotMapped);
        }

        if chunk.unmap(region.offset) {
            // SAFETY: No region of the chunk is mapped any longer.
            unsafe { device.unmap_memory(chunk.memory()) };
        }

        Ok(())
    }

    /// Copies `data` into `region` at `offset` through a temporary mapping.
    pub fn write(
        &mut self,
        region: &MemoryRegion,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let ptr = self.map(region, offset, data.len() as DeviceSize)?;

        // SAFETY: `map` checked that `data.len()` bytes starting at `ptr` belong to the region.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };

        self.unmap(region)
    }

    /// Copies `out.len()` bytes of `region`, starting at `offset`, into `out` through a temporary
    /// mapping.
    pub fn read(
        &mut self,
        region: &MemoryRegion,
        offset: DeviceSize,
        out: &mut [u8],
    ) -> Result<(), MemoryError> {
        let ptr = self.map(region, offset, out.len() as DeviceSize)?;

        // SAFETY: Same as in `write`.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), out.as_mut_ptr(), out.len()) };

        self.unmap(region)
    }

    /// Returns the index of the memory type `region` was allocated from.
    pub fn memory_type_index_for(&self, region: &MemoryRegion) -> Result<u32, MemoryError> {
        Ok(self.chunk(region)?.memory_type_index())
    }

    /// Returns the native memory backing `region`, for binding it to a buffer or image at
    /// [`region.offset()`](MemoryRegion::offset).
    pub fn device_memory(&self, region: &MemoryRegion) -> Result<vk::DeviceMemory, MemoryError> {
        Ok(self.chunk(region)?.memory())
    }

    /// Returns the largest free span among the chunks of one memory type.
    pub fn largest_free_span(&self, memory_type_index: u32) -> DeviceSize {
        self.chunks_by_type
            .get(memory_type_index as usize)
            .into_iter()
            .flatten()
            .filter_map(|&index| self.slots[index as usize].chunk.as_ref())
            .map(MemoryChunk::largest_free_span)
            .max()
            .unwrap_or(0)
    }

    /// Iterates over the live chunks, per memory type in creation order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo<'_>> + '_ {
        self.chunks_by_type.iter().flatten().filter_map(|&index| {
            let slot = &self.slots[index as usize];
            let chunk = slot.chunk.as_ref()?;

            Some(ChunkInfo {
                id: ChunkId {
                    index,
                    generation: slot.generation,
                },
                memory_type_index: chunk.memory_type_index(),
                size: chunk.size(),
                free_spans: chunk.free_spans(),
                allocated_bytes: chunk.size() - chunk.free_size(),
                region_count: chunk.allocation_count(),
            })
        })
    }

    pub fn statistics(&self) -> MemoryStatistics {
        self.chunks().fold(MemoryStatistics::default(), |mut stats, info| {
            stats.chunk_count += 1;
            stats.allocated_bytes += info.allocated_bytes;
            stats.free_bytes += info.size - info.allocated_bytes;
            stats.region_count += info.region_count;
            stats
        })
    }
}

impl Drop for DeviceMemoryManager {
    fn drop(&mut self) {
        let stats = self.statistics();

        if stats.region_count != 0 {
            log::warn!(
                "device memory manager dropped with {} live regions ({} bytes)",
                stats.region_count,
                stats.allocated_bytes,
            );
        }

        for index in 0..self.slots.len() as u32 {
            self.destroy_chunk(index);
        }
    }
}

impl Debug for DeviceMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemoryManager")
            .field("chunk_granularity", &self.chunk_granularity)
            .field("min_allocation_size", &self.min_allocation_size)
            .field("reduce_fragmentation", &self.reduce_fragmentation)
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

/// A snapshot of one chunk, as returned by [`DeviceMemoryManager::chunks`].
#[derive(Clone, Debug)]
pub struct ChunkInfo<'a> {
    pub id: ChunkId,
    pub memory_type_index: u32,
    pub size: DeviceSize,
    /// The free spans, sorted by offset.
    pub free_spans: &'a [Span],
    pub allocated_bytes: DeviceSize,
    pub region_count: usize,
}

/// Totals over all chunks of a [`DeviceMemoryManager`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    pub chunk_count: usize,
    pub allocated_bytes: DeviceSize,
    pub free_bytes: DeviceSize,
    pub region_count: usize,
}

/// Error that can be returned by the [`DeviceMemoryManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// No allowed memory type could provide a chunk for the request.
    OutOfMemory {
        size: DeviceSize,
        memory_type_bits: u32,
    },

    /// None of the memory types allowed by the requirements has the requested properties.
    NoSuitableMemoryType,

    /// The region was already released, or belongs to a chunk that no longer exists.
    InvalidRegion,

    /// The region's memory type is not host-visible and host-coherent, so it can't be mapped.
    InvalidAccess,

    /// The region is already mapped.
    AlreadyMapped,

    /// The region is not mapped.
    NotMapped,

    /// The requested range does not lie within the region.
    OutOfBounds,

    /// The device returned an error.
    Device(VulkanError),
}

impl Error for MemoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                size,
                memory_type_bits,
            } => write!(
                f,
                "no memory type in {:#b} could provide {} bytes",
                memory_type_bits, size,
            ),
            Self::NoSuitableMemoryType => write!(
                f,
                "no allowed memory type has the requested property flags",
            ),
            Self::InvalidRegion => write!(f, "the region is not a live allocation"),
            Self::InvalidAccess => write!(f, "the memory of the region is not host-visible"),
            Self::AlreadyMapped => write!(f, "the region is already mapped"),
            Self::NotMapped => write!(f, "the region is not mapped"),
            Self::OutOfBounds => write!(f, "the range exceeds the size of the region"),
            Self::Device(_) => write!(f, "a device error occurred"),
        }
    }
}

impl From<VulkanError> for MemoryError {
    #[inline]
    fn from(err: VulkanError) -> Self {
        Self::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::SoftwareDevice,
        memory::{MemoryHeap, MemoryHeapFlags, MemoryType},
        tests::init_logger,
    };

    fn requirements(size: DeviceSize, alignment: DeviceSize) -> MemoryRequirements {
        MemoryRequirements::new(size, alignment, !0).unwrap()
    }

    fn manager(create_info: DeviceMemoryManagerCreateInfo) -> DeviceMemoryManager {
        init_logger();

        DeviceMemoryManager::new(Arc::new(SoftwareDevice::new()), create_info)
    }

    const LOCAL: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL;

    fn host() -> MemoryPropertyFlags {
        MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn reuses_the_first_free_span() {
        let mut manager = manager(Default::default());

        let a = manager.allocate(requirements(256, 1), LOCAL).unwrap();
        let b = manager.allocate(requirements(256, 1), LOCAL).unwrap();
        assert_eq!(a.chunk(), b.chunk());
        assert_eq!(b.offset(), a.offset() + 256);

        let a_offset = a.offset();
        manager.release(a).unwrap();

        let c = manager.allocate(requirements(256, 1), LOCAL).unwrap();
        assert_eq!(c.offset(), a_offset);
        assert_eq!(manager.statistics().chunk_count, 1);

        manager.release(b).unwrap();
        manager.release(c).unwrap();
    }

    #[test]
    fn large_requests_grow_a_chunk() {
        let mut manager = manager(Default::default());

        let region = manager.allocate(requirements(4 * M, 256), LOCAL).unwrap();
        let info = manager.chunks().next().unwrap();
        assert!(info.size >= 4 * M);
        assert_eq!(info.size % M, 0);

        let small = manager.allocate(requirements(M + 1, 1), LOCAL).unwrap();
        assert_eq!(manager.statistics().chunk_count, 2);
        let sizes: Vec<_> = manager.chunks().map(|info| info.size).collect();
        assert_eq!(sizes, [4 * M, 2 * M]);

        manager.release(region).unwrap();
        manager.release(small).unwrap();
    }

    #[test]
    fn offsets_honor_alignment() {
        let mut manager = manager(Default::default());
        let mut regions = Vec::new();

        for (size, alignment) in [(3, 1), (100, 64), (7, 4), (1000, 4096), (1, 256)] {
            let region = manager.allocate(requirements(size, alignment), LOCAL).unwrap();
            assert_eq!(region.offset() % alignment, 0);
            regions.push(region);
        }

        for region in regions {
            manager.release(region).unwrap();
        }
    }

    #[test]
    fn double_release_is_rejected() {
        let mut manager = manager(Default::default());

        let region = manager.allocate(requirements(64, 1), LOCAL).unwrap();
        let stale = MemoryRegion {
            chunk: region.chunk(),
            offset: region.offset(),
            size: region.size(),
            alignment: region.alignment(),
        };

        manager.release(region).unwrap();
        assert_eq!(manager.release(stale), Err(MemoryError::InvalidRegion));
    }

    #[test]
    fn stale_region_of_destroyed_chunk() {
        let mut manager = manager(DeviceMemoryManagerCreateInfo {
            reduce_fragmentation: true,
            ..Default::default()
        });

        let region = manager.allocate(requirements(64, 1), LOCAL).unwrap();
        let stale = MemoryRegion {
            chunk: region.chunk(),
            offset: region.offset(),
            size: region.size(),
            alignment: region.alignment(),
        };
        manager.release(region).unwrap();
        assert_eq!(manager.statistics().chunk_count, 0);

        // The slot is reused by the new chunk, under a new generation.
        let fresh = manager.allocate(requirements(64, 1), LOCAL).unwrap();
        assert_eq!(fresh.chunk().index(), stale.chunk().index());
        assert_ne!(fresh.chunk().generation(), stale.chunk().generation());
        assert_eq!(manager.release(stale), Err(MemoryError::InvalidRegion));

        manager.release(fresh).unwrap();
    }

    #[test]
    fn empty_chunks_are_kept_until_defragment() {
        let mut manager = manager(Default::default());

        let region = manager.allocate(requirements(64, 1), LOCAL).unwrap();
        manager.release(region).unwrap();
        assert_eq!(manager.statistics().chunk_count, 1);

        assert_eq!(manager.defragment(), M);
        assert_eq!(manager.statistics(), MemoryStatistics::default());
    }

    #[test]
    fn map_requires_host_visible_memory() {
        let mut manager = manager(Default::default());

        let local = manager.allocate(requirements(64, 1), LOCAL).unwrap();
        assert_eq!(
            manager.map(&local, 0, 64),
            Err(MemoryError::InvalidAccess),
        );

        let staging = manager.allocate(requirements(64, 1), host()).unwrap();
        assert_eq!(
            manager.map(&staging, 32, 64),
            Err(MemoryError::OutOfBounds),
        );

        manager.map(&staging, 0, 64).unwrap();
        assert_eq!(
            manager.map(&staging, 0, 64),
            Err(MemoryError::AlreadyMapped),
        );
        manager.unmap(&staging).unwrap();
        assert_eq!(manager.unmap(&staging), Err(MemoryError::NotMapped));

        manager.release(local).unwrap();
        manager.release(staging).unwrap();
    }

    #[test]
    fn write_then_read() {
        let mut manager = manager(Default::default());

        let a = manager.allocate(requirements(16, 1), host()).unwrap();
        let b = manager.allocate(requirements(16, 1), host()).unwrap();

        manager.write(&a, 4, &[1, 2, 3, 4]).unwrap();
        manager.write(&b, 0, &[9; 16]).unwrap();

        let mut out = [0; 4];
        manager.read(&a, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        manager.release(a).unwrap();
        manager.release(b).unwrap();
    }

    #[test]
    fn falls_back_to_the_next_memory_type() {
        init_logger();

        let host_flags = host();
        let device = SoftwareDevice::with_properties(MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: host_flags,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host_flags,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: M,
                    flags: MemoryHeapFlags::empty(),
                },
                MemoryHeap {
                    size: 8 * M,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
        });
        let mut manager = DeviceMemoryManager::new(Arc::new(device), Default::default());

        let small = manager.allocate(requirements(64, 1), host_flags).unwrap();
        assert_eq!(manager.memory_type_index_for(&small), Ok(0));

        // The first heap is too small for this chunk.
        let large = manager.allocate(requirements(2 * M, 1), host_flags).unwrap();
        assert_eq!(manager.memory_type_index_for(&large), Ok(1));

        assert_eq!(
            manager.allocate(requirements(64 * M, 1), host_flags),
            Err(MemoryError::OutOfMemory {
                size: 64 * M,
                memory_type_bits: !0,
            }),
        );

        manager.release(small).unwrap();
        manager.release(large).unwrap();
    }

    #[test]
    fn no_suitable_memory_type() {
        let mut manager = manager(Default::default());

        let requirements = MemoryRequirements::new(64, 1, 0b001).unwrap();
        assert_eq!(
            manager.allocate(requirements, host()),
            Err(MemoryError::NoSuitableMemoryType),
        );
    }
}
