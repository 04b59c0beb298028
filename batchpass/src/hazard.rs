// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Deciding what must happen before a resource access can be recorded.
//!
//! Each command stream executes a single pre-barrier before all of its commands, so an access
//! that conflicts with an earlier access of the same stream can't be synchronized within that
//! stream. The stream holding the earlier access has to be ended first: the outside-render-pass
//! stream is flushed, and the render pass is closed. Once it is ended, its accesses are part of
//! the resource's committed use, and the next stream synchronizes with them through its own
//! pre-barrier.
//!
//! The outside-render-pass stream always executes before the render pass stream, even when it
//! is flushed while the render pass is open. This is why an outside access that conflicts with
//! the render pass can only be recorded after closing the render pass, while a render pass access
//! that conflicts with the outside stream only needs the outside stream to be flushed.
//!
//! Within a render pass, accesses that the rasterization order or the application's own memory
//! barriers take care of don't conflict with each other: attachment accesses, shader storage
//! accesses and transform feedback writes. An explicit memory barrier request in between turns
//! them back into a conflict, because it can't be honored inside the render pass.

use crate::{
    command_stream::StreamKind,
    render_pass::ClosureReason,
    resource::StreamUse,
    sync::{AccessFlags, AccessType, ImageLayout, MemoryBarrierBits},
};

/// A resource access that is about to be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    pub access: AccessType,
    /// The layout the image must be in, or `Undefined` for buffers.
    pub layout: ImageLayout,
    /// The stream the access will be recorded into.
    pub target: StreamKind,
    /// Whether the access is part of an attachment feedback loop. Reads and writes of the image
    /// in the same layout are then left to the application to synchronize.
    pub feedback_loop: bool,
}

impl AccessRequest {
    /// An access to a buffer.
    #[inline]
    pub const fn buffer(access: AccessType, target: StreamKind) -> Self {
        AccessRequest {
            access,
            layout: ImageLayout::Undefined,
            target,
            feedback_loop: false,
        }
    }

    /// An access to an image in `layout`.
    #[inline]
    pub const fn image(access: AccessType, layout: ImageLayout, target: StreamKind) -> Self {
        AccessRequest {
            access,
            layout,
            target,
            feedback_loop: false,
        }
    }

    #[inline]
    pub const fn is_image(&self) -> bool {
        !matches!(self.layout, ImageLayout::Undefined)
    }

    fn conflicts_with(&self, earlier: &StreamUse) -> bool {
        earlier.is_write()
            || self.access.is_write()
            || (self.is_image() && earlier.layout != self.layout)
    }
}

/// What has to happen before an access can be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HazardDecision {
    /// The access can be recorded right away.
    Proceed,
    /// The outside-render-pass stream must be flushed first.
    FlushOutside,
    /// The render pass must be closed first. This implies flushing the outside-render-pass stream.
    CloseRenderPass(ClosureReason),
}

// Accesses ordered within a render pass by the rasterization order or by the application.
const RENDER_PASS_ORDERED: AccessFlags = AccessFlags::COLOR_ATTACHMENT_READ
    .union(AccessFlags::COLOR_ATTACHMENT_WRITE)
    .union(AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ)
    .union(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
    .union(AccessFlags::SHADER_STORAGE_READ)
    .union(AccessFlags::SHADER_STORAGE_WRITE)
    .union(AccessFlags::TRANSFORM_FEEDBACK_WRITE);

/// Decides what must happen before `request` can be recorded, given how the render pass stream
/// and the outside-render-pass stream already use the resource, and the memory barrier bits
/// requested since the last draw or dispatch.
///
/// The render pass use must be given whether the render pass is open or waiting for
/// reactivation.
pub fn resolve(
    request: &AccessRequest,
    render_pass_use: Option<&StreamUse>,
    outside_use: Option<&StreamUse>,
    pending_barrier: MemoryBarrierBits,
) -> HazardDecision {
    if let Some(earlier) = render_pass_use {
        if let Some(reason) = render_pass_conflict(request, earlier, pending_barrier) {
            return HazardDecision::CloseRenderPass(reason);
        }
    }

    if let Some(earlier) = outside_use {
        if request.conflicts_with(earlier) {
            return HazardDecision::FlushOutside;
        }
    }

    HazardDecision::Proceed
}

fn render_pass_conflict(
    request: &AccessRequest,
    earlier: &StreamUse,
    pending_barrier: MemoryBarrierBits,
) -> Option<ClosureReason> {
    if request.access == AccessType::IndirectCommandRead
        && earlier
            .access
            .intersects(AccessFlags::TRANSFORM_FEEDBACK_WRITE)
    {
        return Some(ClosureReason::TransformFeedbackWriteThenIndirectBuffer);
    }

    if !request.conflicts_with(earlier) {
        return None;
    }

    match request.target {
        StreamKind::OutsideRenderPass => {
            let reason = match (request.is_image(), request.access.is_write()) {
                (false, false) => ClosureReason::BufferUseThenOutOfRenderPassRead,
                (false, true) => ClosureReason::BufferUseThenOutOfRenderPassWrite,
                (true, false) => ClosureReason::ImageUseThenOutOfRenderPassRead,
                (true, true) => ClosureReason::ImageUseThenOutOfRenderPassWrite,
            };

            Some(reason)
        }
        StreamKind::RenderPass => {
            if request.is_image() && earlier.layout != request.layout {
                return Some(ClosureReason::ImageLayoutChangeInRenderPass);
            }

            if earlier.access.intersects(AccessFlags::SHADER_STORAGE_WRITE)
                && !pending_barrier.is_empty()
            {
                return Some(ClosureReason::MemoryBarrierThenStorageResource);
            }

            let ordered = RENDER_PASS_ORDERED.contains(earlier.access)
                && RENDER_PASS_ORDERED.contains(request.access.access_mask());

            if ordered || request.feedback_loop {
                None
            } else if request.is_image() {
                Some(ClosureReason::ImageWriteThenUseInRenderPass)
            } else {
                Some(ClosureReason::BufferWriteThenUseInRenderPass)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_use(access: AccessType) -> StreamUse {
        StreamUse::new(access, ImageLayout::Undefined)
    }

    #[test]
    fn render_pass_write_then_outside_read_closes() {
        let request = AccessRequest::buffer(
            AccessType::ComputeShaderUniformRead,
            StreamKind::OutsideRenderPass,
        );
        let earlier = buffer_use(AccessType::GraphicsShaderStorageWrite);

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(ClosureReason::BufferUseThenOutOfRenderPassRead),
        );
    }

    #[test]
    fn render_pass_read_then_outside_write_closes() {
        let request =
            AccessRequest::buffer(AccessType::CopyTransferWrite, StreamKind::OutsideRenderPass);
        let earlier = buffer_use(AccessType::VertexAttributeRead);

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(ClosureReason::BufferUseThenOutOfRenderPassWrite),
        );
    }

    #[test]
    fn outside_write_then_read_flushes() {
        let request =
            AccessRequest::buffer(AccessType::VertexAttributeRead, StreamKind::RenderPass);
        let earlier = buffer_use(AccessType::CopyTransferWrite);

        assert_eq!(
            resolve(&request, None, Some(&earlier), MemoryBarrierBits::empty()),
            HazardDecision::FlushOutside,
        );

        let request =
            AccessRequest::buffer(AccessType::CopyTransferRead, StreamKind::OutsideRenderPass);
        assert_eq!(
            resolve(&request, None, Some(&earlier), MemoryBarrierBits::empty()),
            HazardDecision::FlushOutside,
        );
    }

    #[test]
    fn reads_proceed() {
        let request =
            AccessRequest::buffer(AccessType::CopyTransferRead, StreamKind::OutsideRenderPass);
        let render_pass = buffer_use(AccessType::VertexAttributeRead);
        let outside = buffer_use(AccessType::ComputeShaderUniformRead);

        assert_eq!(
            resolve(
                &request,
                Some(&render_pass),
                Some(&outside),
                MemoryBarrierBits::empty(),
            ),
            HazardDecision::Proceed,
        );
    }

    #[test]
    fn image_layout_change_closes() {
        let request = AccessRequest::image(
            AccessType::ComputeShaderSampledRead,
            ImageLayout::ShaderReadOnlyOptimal,
            StreamKind::OutsideRenderPass,
        );
        let earlier = StreamUse::new(
            AccessType::ColorAttachmentWrite,
            ImageLayout::ColorAttachmentOptimal,
        );

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(ClosureReason::ImageUseThenOutOfRenderPassRead),
        );

        let request = AccessRequest::image(
            AccessType::GraphicsShaderSampledRead,
            ImageLayout::ShaderReadOnlyOptimal,
            StreamKind::RenderPass,
        );
        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(ClosureReason::ImageLayoutChangeInRenderPass),
        );
    }

    #[test]
    fn attachment_writes_are_ordered() {
        let request = AccessRequest::image(
            AccessType::ColorAttachmentWrite,
            ImageLayout::ColorAttachmentOptimal,
            StreamKind::RenderPass,
        );
        let earlier = StreamUse::new(
            AccessType::ColorAttachmentWrite,
            ImageLayout::ColorAttachmentOptimal,
        );

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::Proceed,
        );
    }

    #[test]
    fn storage_writes_need_close_after_memory_barrier() {
        let request =
            AccessRequest::buffer(AccessType::GraphicsShaderStorageRead, StreamKind::RenderPass);
        let earlier = buffer_use(AccessType::GraphicsShaderStorageWrite);

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::Proceed,
        );
        assert_eq!(
            resolve(
                &request,
                Some(&earlier),
                None,
                MemoryBarrierBits::SHADER_STORAGE,
            ),
            HazardDecision::CloseRenderPass(ClosureReason::MemoryBarrierThenStorageResource),
        );
    }

    #[test]
    fn transform_feedback_then_indirect_closes() {
        let request =
            AccessRequest::buffer(AccessType::IndirectCommandRead, StreamKind::RenderPass);
        let earlier = buffer_use(AccessType::TransformFeedbackWrite);

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(
                ClosureReason::TransformFeedbackWriteThenIndirectBuffer
            ),
        );

        let request =
            AccessRequest::buffer(AccessType::VertexAttributeRead, StreamKind::RenderPass);
        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::CloseRenderPass(ClosureReason::BufferWriteThenUseInRenderPass),
        );
    }

    #[test]
    fn feedback_loop_is_left_to_the_application() {
        let mut request = AccessRequest::image(
            AccessType::GraphicsShaderSampledRead,
            ImageLayout::General,
            StreamKind::RenderPass,
        );
        request.feedback_loop = true;
        let earlier = StreamUse::new(AccessType::ColorAttachmentWrite, ImageLayout::General);

        assert_eq!(
            resolve(&request, Some(&earlier), None, MemoryBarrierBits::empty()),
            HazardDecision::Proceed,
        );
    }
}
