// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::sync::Arc;
use vkstage::{
    memory::{
        allocator::{DeviceLayout, DeviceMemoryManagerCreateInfo, Span},
        MemoryPropertyFlags, MemoryRequirements,
    },
    DeviceMemoryManager, DeviceSize, MemoryRegion, SoftwareDevice,
};

const M: DeviceSize = 1024 * 1024;

fn manager() -> DeviceMemoryManager {
    let _ = env_logger::builder().is_test(true).try_init();

    DeviceMemoryManager::new(
        Arc::new(SoftwareDevice::new()),
        DeviceMemoryManagerCreateInfo::default(),
    )
}

fn requirements(size: DeviceSize, alignment: DeviceSize) -> MemoryRequirements {
    MemoryRequirements {
        layout: DeviceLayout::from_size_alignment(size, alignment).unwrap(),
        memory_type_bits: u32::MAX,
    }
}

fn allocate(
    manager: &mut DeviceMemoryManager,
    size: DeviceSize,
    alignment: DeviceSize,
) -> MemoryRegion {
    manager
        .allocate(
            requirements(size, alignment),
            MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap()
}

/// Checks that the free spans and the allocated bytes of every chunk add up to its size.
fn assert_conserved(manager: &DeviceMemoryManager) {
    for chunk in manager.chunks() {
        let free: DeviceSize = chunk.free_spans.iter().map(|span| span.size).sum();
        assert_eq!(free + chunk.allocated_bytes, chunk.size, "chunk {:?}", chunk.id);
    }
}

#[test]
fn regions_are_disjoint_and_aligned() {
    let mut manager = manager();

    let mut regions = Vec::new();
    for (i, &(size, alignment)) in [
        (100, 1),
        (256, 256),
        (3, 4),
        (4096, 4096),
        (17, 16),
        (1000, 64),
        (1, 1),
        (65536, 512),
    ]
    .iter()
    .cycle()
    .take(40)
    .enumerate()
    {
        let region = allocate(&mut manager, size + i as DeviceSize, alignment);
        assert_eq!(region.offset() % alignment, 0);
        regions.push(region);
    }

    assert_conserved(&manager);

    let mut spans: Vec<_> = regions
        .iter()
        .map(|region| (region.chunk(), region.offset(), region.size()))
        .collect();
    spans.sort_by_key(|&(chunk, offset, _)| (chunk.index(), offset));

    for pair in spans.windows(2) {
        let ((chunk_a, offset_a, size_a), (chunk_b, offset_b, _)) = (pair[0], pair[1]);

        if chunk_a == chunk_b {
            assert!(offset_a + size_a <= offset_b, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    // Release every other region, then the rest, checking the accounting along the way.
    let (even, odd): (Vec<_>, Vec<_>) = regions
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);

    for (_, region) in even {
        manager.release(region).unwrap();
    }
    assert_conserved(&manager);

    for (_, region) in odd {
        manager.release(region).unwrap();
    }
    assert_conserved(&manager);

    for chunk in manager.chunks() {
        assert_eq!(
            chunk.free_spans,
            &[Span {
                offset: 0,
                size: chunk.size,
            }],
        );
    }
}

#[test]
fn adjacent_releases_coalesce() {
    let mut manager = manager();

    let a = allocate(&mut manager, 256, 256);
    let b = allocate(&mut manager, 256, 256);
    let c = allocate(&mut manager, 256, 256);
    let d = allocate(&mut manager, 256, 256);
    assert_eq!((a.offset(), b.offset(), c.offset(), d.offset()), (0, 256, 512, 768));

    let free_spans =
        |manager: &DeviceMemoryManager| manager.chunks().next().unwrap().free_spans.to_vec();

    manager.release(b).unwrap();
    assert_eq!(free_spans(&manager)[0], Span { offset: 256, size: 256 });

    manager.release(c).unwrap();
    assert_eq!(free_spans(&manager)[0], Span { offset: 256, size: 512 });

    manager.release(d).unwrap();
    assert_eq!(
        free_spans(&manager),
        [Span {
            offset: 256,
            size: M - 256,
        }],
    );

    manager.release(a).unwrap();
    assert_eq!(free_spans(&manager), [Span { offset: 0, size: M }]);
}

#[test]
fn released_span_is_reused_first() {
    let mut manager = manager();

    let a = allocate(&mut manager, 256, 1);
    let b = allocate(&mut manager, 256, 1);
    let a_offset = a.offset();

    manager.release(a).unwrap();
    let c = allocate(&mut manager, 256, 1);

    assert_eq!(c.offset(), a_offset);
    assert_eq!(c.chunk(), b.chunk());
    assert_eq!(manager.statistics().chunk_count, 1);

    manager.release(b).unwrap();
    manager.release(c).unwrap();
}

#[test]
fn large_requests_get_their_own_chunk() {
    let mut manager = manager();

    let small = allocate(&mut manager, 256, 1);
    let large = allocate(&mut manager, 4 * M, 1);
    assert_ne!(small.chunk(), large.chunk());

    let large_chunk = manager
        .chunks()
        .find(|chunk| chunk.id == large.chunk())
        .unwrap();
    assert!(large_chunk.size >= 4 * M);
    assert_eq!(large_chunk.size % manager.chunk_granularity(), 0);

    manager.release(small).unwrap();
    manager.release(large).unwrap();
    assert_eq!(manager.defragment(), 5 * M);
    assert_eq!(manager.statistics().chunk_count, 0);
}
