// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffers and images as seen by the command batching layer, and the record of how each of them
//! was last used.
//!
//! Only what the hazard tracking needs is kept here. Memory binding, views, formats and the rest
//! belong to the objects wrapping these.
//!
//! Every resource carries a [`ResourceUse`] behind a mutex, because the same buffer or image can
//! be used from several contexts. The record only reflects command streams that have been
//! flushed: accesses recorded into a stream that is still open live in that stream, and are
//! folded into the record when the stream is flushed. A folded record is never rewound.

use crate::{
    macros::impl_id_counter,
    serial::{QueueSerial, QueueSerials},
    sync::{AccessFlags, AccessType, ImageAspects, ImageLayout, PipelineStages},
    DeviceSize,
};
use parking_lot::Mutex;
use std::{fmt, num::NonZero};

/// How a resource was last used by the flushed command streams.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceUse {
    /// The last serial at which any stream used the resource.
    pub used: QueueSerials,

    /// The last serial at which any stream wrote to the resource.
    pub written: QueueSerials,

    /// Stages and accesses performed by the last stream that used the resource. A barrier from
    /// these is needed before a conflicting access.
    pub stages: PipelineStages,
    pub access: AccessFlags,

    /// The layout the last stream left the image in. Always `Undefined` for buffers.
    pub layout: ImageLayout,
}

impl ResourceUse {
    /// Folds the accesses of a flushed stream into the record.
    pub fn fold(&mut self, queue_serial: QueueSerial, stream_use: &StreamUse) {
        self.used.set(queue_serial);

        if stream_use.access.contains_write() {
            self.written.set(queue_serial);
        }

        self.stages = stream_use.stages;
        self.access = stream_use.access;

        if stream_use.layout != ImageLayout::Undefined {
            self.layout = stream_use.layout;
        }
    }

    /// Returns the barrier source scope needed before `access` in `layout`, or `None` if the
    /// access can follow the last use without a barrier.
    pub fn barrier_source(
        &self,
        access: AccessType,
        layout: ImageLayout,
    ) -> Option<(PipelineStages, AccessFlags)> {
        if self.access.contains_write() || self.layout != layout {
            // Write-after-write, read-after-write, or a layout transition: memory dependency.
            Some((self.stages, self.access & AccessFlags::WRITES))
        } else if access.is_write() && !self.access.is_empty() {
            // Write-after-read: execution dependency only.
            Some((self.stages, AccessFlags::empty()))
        } else {
            None
        }
    }
}

/// The accesses a single open command stream has made to one resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamUse {
    pub stages: PipelineStages,
    pub access: AccessFlags,
    pub layout: ImageLayout,
}

impl StreamUse {
    /// Creates the use for a single access. `layout` is `Undefined` for buffers.
    #[inline]
    pub fn new(access: AccessType, layout: ImageLayout) -> Self {
        StreamUse {
            stages: access.stage_mask(),
            access: access.access_mask(),
            layout,
        }
    }

    /// Returns whether the stream wrote to the resource.
    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.contains_write()
    }

    /// Returns whether `access` in `layout` can be recorded after this use, in the same stream,
    /// without a barrier in between.
    pub fn is_compatible_with(&self, access: AccessType, layout: ImageLayout) -> bool {
        self.layout == layout && !(self.is_write() || access.is_write())
    }

    /// Merges another access into this use. The stream is left in `layout`.
    pub fn merge(&mut self, access: AccessType, layout: ImageLayout) {
        self.stages |= access.stage_mask();
        self.access |= access.access_mask();
        self.layout = layout;
    }
}

/// A buffer that commands can read from or write to.
pub struct Buffer {
    handle: ash::vk::Buffer,
    id: NonZero<u64>,
    size: DeviceSize,
    host_visible: bool,
    state: Mutex<ResourceUse>,
}

impl Buffer {
    /// Wraps a buffer handle created by the memory allocator.
    pub fn new(handle: ash::vk::Buffer, size: DeviceSize, host_visible: bool) -> Self {
        Buffer {
            handle,
            id: Self::next_id(),
            size,
            host_visible,
            state: Mutex::new(ResourceUse::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> ash::vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns whether the buffer's memory can be mapped by the host.
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Returns a copy of the record of the flushed uses of the buffer.
    #[inline]
    pub fn resource_use(&self) -> ResourceUse {
        self.state.lock().clone()
    }

    pub(crate) fn fold(&self, queue_serial: QueueSerial, stream_use: &StreamUse) {
        self.state.lock().fold(queue_serial, stream_use);
    }
}

impl_id_counter!(Buffer);

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("host_visible", &self.host_visible)
            .finish_non_exhaustive()
    }
}

/// An image that commands can read from or write to, or render into.
pub struct Image {
    handle: ash::vk::Image,
    id: NonZero<u64>,
    aspects: ImageAspects,
    extent: [u32; 2],
    samples: u32,
    state: Mutex<ResourceUse>,
}

impl Image {
    /// Wraps an image handle created by the memory allocator.
    pub fn new(
        handle: ash::vk::Image,
        aspects: ImageAspects,
        extent: [u32; 2],
        samples: u32,
    ) -> Self {
        Image {
            handle,
            id: Self::next_id(),
            aspects,
            extent,
            samples,
            state: Mutex::new(ResourceUse::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> ash::vk::Image {
        self.handle
    }

    #[inline]
    pub fn aspects(&self) -> ImageAspects {
        self.aspects
    }

    #[inline]
    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Returns whether the image has a depth or stencil aspect.
    #[inline]
    pub fn is_depth_stencil(&self) -> bool {
        self.aspects.intersects(ImageAspects::DEPTH | ImageAspects::STENCIL)
    }

    /// Returns a copy of the record of the flushed uses of the image.
    #[inline]
    pub fn resource_use(&self) -> ResourceUse {
        self.state.lock().clone()
    }

    /// Returns the layout the image was left in by the flushed streams.
    #[inline]
    pub fn current_layout(&self) -> ImageLayout {
        self.state.lock().layout
    }

    pub(crate) fn fold(&self, queue_serial: QueueSerial, stream_use: &StreamUse) {
        self.state.lock().fold(queue_serial, stream_use);
    }
}

impl_id_counter!(Image);

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("aspects", &self.aspects)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{Serial, SerialIndex};

    fn serial(value: u64) -> QueueSerial {
        QueueSerial::new(SerialIndex(0), Serial::new(value))
    }

    fn buffer_use(access: AccessType) -> StreamUse {
        StreamUse::new(access, ImageLayout::Undefined)
    }

    #[test]
    fn read_after_read_needs_no_barrier() {
        let mut record = ResourceUse::default();
        record.fold(serial(1), &buffer_use(AccessType::VertexAttributeRead));

        assert!(record
            .barrier_source(AccessType::GraphicsShaderUniformRead, ImageLayout::Undefined)
            .is_none());
        assert!(!record.written.get(SerialIndex(0)).is_valid());
    }

    #[test]
    fn read_after_write_needs_memory_dependency() {
        let mut record = ResourceUse::default();
        record.fold(serial(1), &buffer_use(AccessType::CopyTransferWrite));

        let (stages, access) = record
            .barrier_source(AccessType::VertexAttributeRead, ImageLayout::Undefined)
            .unwrap();
        assert_eq!(stages, PipelineStages::ALL_TRANSFER);
        assert_eq!(access, AccessFlags::TRANSFER_WRITE);
        assert_eq!(record.written.get(SerialIndex(0)), Serial::new(1));
    }

    #[test]
    fn write_after_read_needs_execution_dependency() {
        let mut record = ResourceUse::default();
        record.fold(serial(3), &buffer_use(AccessType::IndexRead));

        let (stages, access) = record
            .barrier_source(AccessType::ComputeShaderStorageWrite, ImageLayout::Undefined)
            .unwrap();
        assert_eq!(stages, PipelineStages::INDEX_INPUT);
        assert!(access.is_empty());
    }

    #[test]
    fn layout_change_is_incompatible_in_stream() {
        let layout = ImageLayout::ShaderReadOnlyOptimal;
        let stream_use = StreamUse::new(AccessType::GraphicsShaderSampledRead, layout);

        assert!(stream_use.is_compatible_with(AccessType::ComputeShaderSampledRead, layout));
        assert!(!stream_use.is_compatible_with(
            AccessType::ColorAttachmentWrite,
            ImageLayout::ColorAttachmentOptimal,
        ));
        assert!(!stream_use.is_compatible_with(
            AccessType::CopyTransferRead,
            ImageLayout::TransferSrcOptimal,
        ));
    }

    #[test]
    fn first_use_of_image_transitions_from_undefined() {
        let record = ResourceUse::default();

        let (stages, access) = record
            .barrier_source(
                AccessType::GraphicsShaderSampledRead,
                ImageLayout::ShaderReadOnlyOptimal,
            )
            .unwrap();
        assert!(stages.is_empty());
        assert!(access.is_empty());
    }

    #[test]
    fn fold_never_rewinds() {
        let buffer = Buffer::new(ash::vk::Buffer::null(), 64, false);
        buffer.fold(serial(7), &buffer_use(AccessType::CopyTransferWrite));
        buffer.fold(serial(4), &buffer_use(AccessType::IndexRead));

        let record = buffer.resource_use();
        assert_eq!(record.used.get(SerialIndex(0)), Serial::new(7));
        assert_eq!(record.written.get(SerialIndex(0)), Serial::new(7));
    }
}
