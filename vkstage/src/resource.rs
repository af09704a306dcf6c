// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{memory::allocator::MemoryRegion, DeviceSize};

/// The capabilities the memory manager and the transfer functions need from a resource.
///
/// Implemented by [`Buffer`](crate::buffer::Buffer), [`Texture`](crate::image::Texture) and
/// [`StagingBuffer`](crate::buffer::StagingBuffer). Code that only moves bytes around, such as
/// [`TransferOrchestrator::copy_buffer`](crate::TransferOrchestrator::copy_buffer), works on
/// `&dyn DeviceResource` and never on a concrete resource type.
pub trait DeviceResource {
    /// Returns whether the native handle is a buffer or an image.
    fn resource_kind(&self) -> ResourceKind;

    /// Returns the raw native handle, `vk::Buffer` or `vk::Image` as a `u64`, depending on
    /// [`resource_kind`](Self::resource_kind).
    fn native_handle(&self) -> u64;

    /// Returns the size in bytes of the resource as seen by the host.
    fn size(&self) -> DeviceSize;

    /// Returns the region of device memory bound to the resource.
    fn memory_region(&self) -> Option<&MemoryRegion>;
}

/// The kind of native object behind a [`DeviceResource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
}
