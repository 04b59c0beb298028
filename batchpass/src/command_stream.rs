// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording of commands into a command stream that has not been handed to the queue yet.
//!
//! A context owns two [`CommandStream`]s: one for commands that are recorded outside of a render
//! pass, and one for the commands of the current render pass. Both are the same type,
//! distinguished by their [`StreamKind`].
//!
//! Along with the commands, a stream remembers every buffer and image they touch and how. The
//! first time a stream touches a resource, the access is checked against the resource's
//! [committed use](crate::resource::ResourceUse), and whatever barrier is needed is merged into
//! the stream's pre-barrier. The pre-barrier executes before all of the stream's commands. Later
//! accesses to the same resource within the stream can't get a barrier of their own; it is up to
//! the [hazard resolver](crate::hazard) to flush the stream or close the render pass when that
//! would be required.
//!
//! When the stream is ended, the accesses are folded into the resources' committed use with the
//! stream's queue serial, and the stream is reset to an empty one.

use crate::{
    pipeline::{
        CompareOp, CullMode, FrontFace, IndexType, PipelineBindPoint, Scissor, StencilOps,
        Viewport,
    },
    render_pass::{FramebufferId, RenderArea},
    resource::{Buffer, Image, StreamUse},
    serial::QueueSerial,
    sync::{
        AccessFlags, AccessType, BufferMemoryBarrier, DependencyInfo, ImageLayout,
        ImageMemoryBarrier, MemoryBarrier,
    },
    DeviceSize,
};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{collections::hash_map::Entry, num::NonZero, sync::Arc};

/// Which of the two command streams of a context a stream is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Commands that must not be recorded inside a render pass instance: copies, dispatches,
    /// timestamps.
    OutsideRenderPass,
    /// The commands of a render pass instance, from its beginning to its end.
    RenderPass,
}

/// A kind of query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueryKind {
    AnySamplesPassed,
    AnySamplesPassedConservative,
    PrimitivesGenerated,
    TransformFeedbackPrimitivesWritten,
    TimeElapsed,
    Timestamp,
}

impl QueryKind {
    /// Returns whether queries of this kind are recorded inside the render pass.
    #[inline]
    pub const fn is_render_pass_query(self) -> bool {
        matches!(
            self,
            QueryKind::AnySamplesPassed
                | QueryKind::AnySamplesPassedConservative
                | QueryKind::PrimitivesGenerated
                | QueryKind::TransformFeedbackPrimitivesWritten,
        )
    }
}

/// A command recorded into a [`CommandStream`].
///
/// Resources are referred to by handle. The stream itself keeps them alive until it has been
/// executed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Command {
    BeginRenderPass {
        framebuffer: FramebufferId,
        render_area: RenderArea,
    },
    EndRenderPass,

    BindPipeline {
        bind_point: PipelineBindPoint,
        pipeline: ash::vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: PipelineBindPoint,
        first_set: u32,
        descriptor_sets: SmallVec<[ash::vk::DescriptorSet; 4]>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: SmallVec<[(ash::vk::Buffer, DeviceSize); 8]>,
    },
    BindIndexBuffer {
        buffer: ash::vk::Buffer,
        offset: DeviceSize,
        index_type: IndexType,
    },
    BindTransformFeedbackBuffers {
        buffers: SmallVec<[(ash::vk::Buffer, DeviceSize); 4]>,
    },
    BeginTransformFeedback,
    EndTransformFeedback,

    PushConstants {
        bind_point: PipelineBindPoint,
        data: SmallVec<[u8; 128]>,
    },

    SetViewport(Viewport),
    SetScissor(Scissor),
    SetLineWidth(f32),
    SetDepthBias {
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    },
    SetBlendConstants([f32; 4]),
    SetStencilCompareMask {
        front: u32,
        back: u32,
    },
    SetStencilWriteMask {
        front: u32,
        back: u32,
    },
    SetStencilReference {
        front: u32,
        back: u32,
    },
    SetCullMode(CullMode),
    SetFrontFace(FrontFace),
    SetDepthTestEnable(bool),
    SetDepthWriteEnable(bool),
    SetDepthCompareOp(CompareOp),
    SetStencilTestEnable(bool),
    SetStencilOp {
        front: StencilOps,
        back: StencilOps,
    },
    SetRasterizerDiscardEnable(bool),
    SetPrimitiveRestartEnable(bool),

    /// A barrier between fragments of the same render pass, for non-coherent framebuffer fetch.
    FramebufferFetchBarrier,
    /// A barrier between draws, for non-coherent advanced blending.
    BlendBarrier,

    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: ash::vk::Buffer,
        offset: DeviceSize,
    },
    DrawIndexedIndirect {
        buffer: ash::vk::Buffer,
        offset: DeviceSize,
    },
    Dispatch {
        group_counts: [u32; 3],
    },
    DispatchIndirect {
        buffer: ash::vk::Buffer,
        offset: DeviceSize,
    },

    BeginQuery {
        kind: QueryKind,
        index: u32,
    },
    EndQuery {
        kind: QueryKind,
        index: u32,
    },
    WriteTimestamp {
        index: u32,
    },

    CopyBuffer {
        src: ash::vk::Buffer,
        dst: ash::vk::Buffer,
        size: DeviceSize,
    },
    ClearColorImage {
        image: ash::vk::Image,
        color: [f32; 4],
    },
}

impl Command {
    /// Returns the name of the command, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::BeginRenderPass { .. } => "begin_render_pass",
            Command::EndRenderPass => "end_render_pass",
            Command::BindPipeline { .. } => "bind_pipeline",
            Command::BindDescriptorSets { .. } => "bind_descriptor_sets",
            Command::BindVertexBuffers { .. } => "bind_vertex_buffers",
            Command::BindIndexBuffer { .. } => "bind_index_buffer",
            Command::BindTransformFeedbackBuffers { .. } => "bind_transform_feedback_buffers",
            Command::BeginTransformFeedback => "begin_transform_feedback",
            Command::EndTransformFeedback => "end_transform_feedback",
            Command::PushConstants { .. } => "push_constants",
            Command::SetViewport(_) => "set_viewport",
            Command::SetScissor(_) => "set_scissor",
            Command::SetLineWidth(_) => "set_line_width",
            Command::SetDepthBias { .. } => "set_depth_bias",
            Command::SetBlendConstants(_) => "set_blend_constants",
            Command::SetStencilCompareMask { .. } => "set_stencil_compare_mask",
            Command::SetStencilWriteMask { .. } => "set_stencil_write_mask",
            Command::SetStencilReference { .. } => "set_stencil_reference",
            Command::SetCullMode(_) => "set_cull_mode",
            Command::SetFrontFace(_) => "set_front_face",
            Command::SetDepthTestEnable(_) => "set_depth_test_enable",
            Command::SetDepthWriteEnable(_) => "set_depth_write_enable",
            Command::SetDepthCompareOp(_) => "set_depth_compare_op",
            Command::SetStencilTestEnable(_) => "set_stencil_test_enable",
            Command::SetStencilOp { .. } => "set_stencil_op",
            Command::SetRasterizerDiscardEnable(_) => "set_rasterizer_discard_enable",
            Command::SetPrimitiveRestartEnable(_) => "set_primitive_restart_enable",
            Command::FramebufferFetchBarrier => "framebuffer_fetch_barrier",
            Command::BlendBarrier => "blend_barrier",
            Command::Draw { .. } => "draw",
            Command::DrawIndexed { .. } => "draw_indexed",
            Command::DrawIndirect { .. } => "draw_indirect",
            Command::DrawIndexedIndirect { .. } => "draw_indexed_indirect",
            Command::Dispatch { .. } => "dispatch",
            Command::DispatchIndirect { .. } => "dispatch_indirect",
            Command::BeginQuery { .. } => "begin_query",
            Command::EndQuery { .. } => "end_query",
            Command::WriteTimestamp { .. } => "write_timestamp",
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::ClearColorImage { .. } => "clear_color_image",
        }
    }

    /// Returns whether the command is a draw or a dispatch.
    #[inline]
    pub fn is_draw_or_dispatch(&self) -> bool {
        matches!(
            self,
            Command::Draw { .. }
                | Command::DrawIndexed { .. }
                | Command::DrawIndirect { .. }
                | Command::DrawIndexedIndirect { .. }
                | Command::Dispatch { .. }
                | Command::DispatchIndirect { .. },
        )
    }
}

#[derive(Debug)]
struct TrackedBuffer {
    buffer: Arc<Buffer>,
    stream_use: StreamUse,
}

#[derive(Debug)]
struct TrackedImage {
    image: Arc<Image>,
    stream_use: StreamUse,
}

/// An accumulating batch of commands, together with the resources they use.
#[derive(Debug)]
pub struct CommandStream {
    kind: StreamKind,
    queue_serial: Option<QueueSerial>,
    commands: Vec<Command>,
    buffers: HashMap<NonZero<u64>, TrackedBuffer>,
    images: HashMap<NonZero<u64>, TrackedImage>,
    pre_barrier: DependencyInfo,
    has_host_visible_buffer_write: bool,
}

impl CommandStream {
    /// Creates an empty stream.
    pub fn new(kind: StreamKind) -> Self {
        CommandStream {
            kind,
            queue_serial: None,
            commands: Vec::new(),
            buffers: HashMap::default(),
            images: HashMap::default(),
            pre_barrier: DependencyInfo::default(),
            has_host_visible_buffer_write: false,
        }
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Returns the queue serial the stream will be folded with, if it has been assigned yet.
    #[inline]
    pub fn queue_serial(&self) -> Option<QueueSerial> {
        self.queue_serial
    }

    /// Assigns the queue serial of the stream.
    ///
    /// # Panics
    ///
    /// - Panics if the stream already has a serial.
    pub fn set_queue_serial(&mut self, queue_serial: QueueSerial) {
        assert!(
            self.queue_serial.is_none(),
            "a command stream's queue serial can only be assigned once",
        );

        self.queue_serial = Some(queue_serial);
    }

    /// Returns whether any command has been recorded.
    #[inline]
    pub fn is_started(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Returns whether there is nothing to execute in the stream: no command and no barrier.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.pre_barrier.is_empty()
    }

    #[inline]
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Returns the barrier that executes before the commands of the stream.
    #[inline]
    pub fn pre_barrier(&self) -> &DependencyInfo {
        &self.pre_barrier
    }

    /// Returns whether a host-visible buffer was written by the stream. The host must wait for
    /// the stream before it can read such a buffer.
    #[inline]
    pub fn has_host_visible_buffer_write(&self) -> bool {
        self.has_host_visible_buffer_write
    }

    /// Appends a command.
    #[inline]
    pub fn record(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Returns how the stream uses `buffer`, if it does.
    #[inline]
    pub fn buffer_use(&self, buffer: &Buffer) -> Option<StreamUse> {
        self.buffers
            .get(&buffer.id())
            .map(|tracked| tracked.stream_use)
    }

    /// Returns how the stream uses `image`, if it does.
    #[inline]
    pub fn image_use(&self, image: &Image) -> Option<StreamUse> {
        self.images.get(&image.id()).map(|tracked| tracked.stream_use)
    }

    /// Returns whether the stream wrote any of the resources it uses with a shader storage
    /// access.
    pub fn has_storage_write(&self) -> bool {
        let is_storage_write = |stream_use: &StreamUse| {
            stream_use
                .access
                .intersects(AccessFlags::SHADER_STORAGE_WRITE)
        };

        self.buffers
            .values()
            .any(|tracked| is_storage_write(&tracked.stream_use))
            || self
                .images
                .values()
                .any(|tracked| is_storage_write(&tracked.stream_use))
    }

    /// Records that the stream accesses `buffer`.
    ///
    /// The first access of the stream to the buffer is synchronized with the buffer's committed
    /// use through the pre-barrier. The caller must have resolved any hazard with the stream's
    /// earlier accesses.
    pub fn use_buffer(&mut self, buffer: &Arc<Buffer>, access: AccessType) {
        debug_assert!(access.is_valid_for_buffer());

        let committed = buffer.resource_use();

        if let Some((src_stages, src_access)) =
            committed.barrier_source(access, ImageLayout::Undefined)
        {
            self.pre_barrier.add_buffer_barrier(BufferMemoryBarrier {
                src_stages,
                src_access,
                dst_stages: access.stage_mask(),
                dst_access: access.access_mask(),
                buffer: buffer.clone(),
            });
        }

        match self.buffers.entry(buffer.id()) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .stream_use
                    .merge(access, ImageLayout::Undefined);
            }
            Entry::Vacant(entry) => {
                entry.insert(TrackedBuffer {
                    buffer: buffer.clone(),
                    stream_use: StreamUse::new(access, ImageLayout::Undefined),
                });
            }
        }

        if access.is_write() && buffer.is_host_visible() {
            self.has_host_visible_buffer_write = true;
        }
    }

    /// Records that the stream accesses `image` in `layout`.
    ///
    /// If the stream already uses the image in another layout, the image is switched to `layout`
    /// for the whole stream. This is only valid for render pass attachments that are found to
    /// form a feedback loop, before the render pass has executed anything that depends on the
    /// layout.
    pub fn use_image(&mut self, image: &Arc<Image>, access: AccessType, layout: ImageLayout) {
        debug_assert!(access.is_valid_for_image());
        debug_assert!(layout != ImageLayout::Undefined);

        let committed = image.resource_use();

        if let Some((src_stages, src_access)) = committed.barrier_source(access, layout) {
            self.pre_barrier.add_image_barrier(ImageMemoryBarrier {
                src_stages,
                src_access,
                dst_stages: access.stage_mask(),
                dst_access: access.access_mask(),
                old_layout: committed.layout,
                new_layout: layout,
                image: image.clone(),
            });
        } else if let Some(existing) = self.pre_barrier.image_barrier_mut(image.id()) {
            existing.new_layout = layout;
        }

        match self.images.entry(image.id()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().stream_use.merge(access, layout);
            }
            Entry::Vacant(entry) => {
                entry.insert(TrackedImage {
                    image: image.clone(),
                    stream_use: StreamUse::new(access, layout),
                });
            }
        }
    }

    /// Adds a global memory barrier to the pre-barrier.
    #[inline]
    pub fn add_memory_barrier(&mut self, barrier: MemoryBarrier) {
        self.pre_barrier.add_memory_barrier(barrier);
    }

    /// Ends the stream: folds its accesses into the committed use of every resource it touched,
    /// and returns its contents. The stream is left empty, without a queue serial.
    ///
    /// # Panics
    ///
    /// - Panics if the stream has no queue serial.
    pub fn end(&mut self) -> RecordedStream {
        let queue_serial = self
            .queue_serial
            .take()
            .expect("a command stream must have a queue serial before it is ended");

        let buffers = self
            .buffers
            .drain()
            .map(|(_, tracked)| {
                tracked.buffer.fold(queue_serial, &tracked.stream_use);
                tracked.buffer
            })
            .collect();
        let images = self
            .images
            .drain()
            .map(|(_, tracked)| {
                tracked.image.fold(queue_serial, &tracked.stream_use);
                tracked.image
            })
            .collect();

        RecordedStream {
            kind: self.kind,
            queue_serial,
            pre_barrier: std::mem::take(&mut self.pre_barrier),
            commands: std::mem::take(&mut self.commands),
            buffers,
            images,
            has_host_visible_buffer_write: std::mem::take(&mut self.has_host_visible_buffer_write),
        }
    }
}

/// The contents of an ended [`CommandStream`], waiting to be submitted or executing.
#[derive(Debug)]
pub struct RecordedStream {
    kind: StreamKind,
    queue_serial: QueueSerial,
    pre_barrier: DependencyInfo,
    commands: Vec<Command>,
    // Kept alive until the stream has finished executing.
    buffers: Vec<Arc<Buffer>>,
    images: Vec<Arc<Image>>,
    has_host_visible_buffer_write: bool,
}

impl RecordedStream {
    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    #[inline]
    pub fn queue_serial(&self) -> QueueSerial {
        self.queue_serial
    }

    #[inline]
    pub fn pre_barrier(&self) -> &DependencyInfo {
        &self.pre_barrier
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn has_host_visible_buffer_write(&self) -> bool {
        self.has_host_visible_buffer_write
    }

    /// Returns whether the stream used the buffer with the given ID.
    #[inline]
    pub fn uses_buffer(&self, buffer: &Buffer) -> bool {
        self.buffers.iter().any(|b| b.id() == buffer.id())
    }

    /// Returns the number of resources kept alive by the stream.
    #[inline]
    pub fn resource_count(&self) -> usize {
        self.buffers.len() + self.images.len()
    }
}
