// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The draw path: graphics dirty bits, their handlers and the draw entry points.

use super::{
    memory_barrier_for, merge_barriers, AccessList, BufferBinding, Context, DepthStencilFeedback,
    FeedbackLoops, Features, Tracked,
};
use crate::{
    command_stream::{Command, StreamKind},
    dirty_bits::{DirtyBitPipeline, DirtyBits},
    driver_uniforms::{EmulatedTransformFeedback, GraphicsUniformsInfo},
    hazard::AccessRequest,
    macros::dirty_bits,
    pipeline::{GraphicsPipelineDesc, PipelineBindPoint, PrimitiveTopology, Scissor, Viewport},
    render_pass::{AttachmentAccess, ClosureReason, Framebuffer, RenderArea},
    resource::{Buffer, Image},
    sync::{AccessType, ImageLayout, MemoryBarrierBits},
    ContextError, DeviceError, DeviceSize,
};
use smallvec::SmallVec;
use std::sync::Arc;

dirty_bits! {
    /// A category of state that draws depend on, in processing order.
    GraphicsDirtyBit;

    /// A memory barrier was requested since the last draw.
    MemoryBarrier,
    /// The way the depth/stencil attachment is sampled by the bound textures changed.
    ReadOnlyDepthFeedbackLoopMode,
    /// State baked into the graphics pipeline changed.
    PipelineDesc,
    /// A render pass must be begun or reactivated.
    RenderPass,
    PipelineBinding,
    Textures,
    VertexBuffers,
    IndexBuffer,
    UniformBuffers,
    /// Storage buffers, storage images or atomic counter buffers.
    ShaderResources,
    /// Runs before every draw while the program reads the framebuffer.
    FramebufferFetchBarrier,
    /// Runs before every draw while an advanced blend equation is in use.
    BlendBarrier,
    TransformFeedbackBuffers,
    /// Begins native transform feedback in the current render pass.
    TransformFeedbackResume,
    DescriptorSets,
    DriverUniforms,
    DynamicViewport,
    DynamicScissor,
    DynamicLineWidth,
    DynamicDepthBias,
    DynamicBlendConstants,
    DynamicStencilCompareMask,
    DynamicStencilWriteMask,
    DynamicStencilReference,
    DynamicCullMode,
    DynamicFrontFace,
    DynamicDepthTestEnable,
    DynamicDepthWriteEnable,
    DynamicDepthCompareOp,
    DynamicStencilTestEnable,
    DynamicStencilOp,
    DynamicRasterizerDiscardEnable,
    DynamicPrimitiveRestartEnable,
}

use self::GraphicsDirtyBit as G;

/// Builds the handler table of the draw path for a device with `features`.
pub(super) fn dirty_bit_pipeline(features: &Features) -> DirtyBitPipeline<Context, G> {
    let mut pipeline = DirtyBitPipeline::new()
        .with_handler(G::MemoryBarrier, Context::handle_graphics_memory_barrier)
        .with_handler(
            G::ReadOnlyDepthFeedbackLoopMode,
            Context::handle_read_only_depth_feedback_loop_mode,
        )
        .with_handler(G::PipelineDesc, Context::handle_graphics_pipeline_desc)
        .with_handler(G::RenderPass, Context::handle_render_pass)
        .with_handler(G::PipelineBinding, Context::handle_graphics_pipeline_binding)
        .with_handler(G::Textures, Context::handle_graphics_textures)
        .with_handler(G::VertexBuffers, Context::handle_vertex_buffers)
        .with_handler(G::IndexBuffer, Context::handle_index_buffer)
        .with_handler(G::UniformBuffers, Context::handle_graphics_uniform_buffers)
        .with_handler(G::ShaderResources, Context::handle_graphics_shader_resources)
        .with_handler(
            G::TransformFeedbackBuffers,
            Context::handle_transform_feedback_buffers,
        )
        .with_handler(G::DescriptorSets, Context::handle_graphics_descriptor_sets)
        .with_handler(G::DriverUniforms, Context::handle_graphics_driver_uniforms);

    if features.framebuffer_fetch {
        pipeline = pipeline.with_handler(G::FramebufferFetchBarrier, Context::handle_barrier);
    }

    if !features.advanced_blend_coherent {
        pipeline = pipeline.with_handler(G::BlendBarrier, Context::handle_barrier);
    }

    if features.transform_feedback_extension {
        pipeline = pipeline.with_handler(
            G::TransformFeedbackResume,
            Context::handle_transform_feedback_resume,
        );
    }

    let mut dynamic_bits = vec![
        G::DynamicViewport,
        G::DynamicScissor,
        G::DynamicLineWidth,
        G::DynamicDepthBias,
        G::DynamicBlendConstants,
        G::DynamicStencilCompareMask,
        G::DynamicStencilWriteMask,
        G::DynamicStencilReference,
    ];

    if features.dynamic_state {
        dynamic_bits.extend([
            G::DynamicCullMode,
            G::DynamicFrontFace,
            G::DynamicDepthTestEnable,
            G::DynamicDepthWriteEnable,
            G::DynamicDepthCompareOp,
            G::DynamicStencilTestEnable,
            G::DynamicStencilOp,
            G::DynamicPrimitiveRestartEnable,
        ]);
    }

    if features.dynamic_rasterizer_discard {
        dynamic_bits.push(G::DynamicRasterizerDiscardEnable);
    }

    for bit in dynamic_bits {
        pipeline = pipeline.with_handler(bit, Context::handle_dynamic_state);
    }

    // Bindings and dynamic state don't carry over from one render pass to the next.
    pipeline.with_restart_bits(DirtyBits::after(G::RenderPass))
}

fn graphics_pipeline(context: &mut Context) -> &mut DirtyBitPipeline<Context, G> {
    &mut context.graphics
}

type Handled = Result<DirtyBits<G>, DeviceError>;

impl Context {
    /// Draws `vertex_count` vertices of each of `instance_count` instances.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), ContextError> {
        self.check_lost()?;
        let framebuffer = self.draw_framebuffer(false)?;
        self.draw_vertex_count = vertex_count;

        let result = self.setup_draw(&framebuffer, false, None);
        self.map_device_error(result)?;

        self.record_draw(
            &framebuffer,
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
        self.advance_transform_feedback(vertex_count, instance_count);

        Ok(())
    }

    /// Draws `index_count` indices of the bound index buffer for each of `instance_count`
    /// instances.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), ContextError> {
        self.check_lost()?;
        let framebuffer = self.draw_framebuffer(true)?;
        self.draw_vertex_count = index_count;

        let result = self.setup_draw(&framebuffer, true, None);
        self.map_device_error(result)?;

        self.record_draw(
            &framebuffer,
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
        self.advance_transform_feedback(index_count, instance_count);

        Ok(())
    }

    /// Draws with the parameters read from `buffer` at `offset` by the device.
    ///
    /// The vertex count isn't known to the host, so the capture position of emulated transform
    /// feedback is not advanced.
    pub fn draw_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: DeviceSize,
    ) -> Result<(), ContextError> {
        self.check_lost()?;
        let framebuffer = self.draw_framebuffer(false)?;
        self.draw_vertex_count = 0;

        let result = self.setup_draw(&framebuffer, false, Some(buffer));
        self.map_device_error(result)?;

        self.record_draw(
            &framebuffer,
            Command::DrawIndirect {
                buffer: buffer.handle(),
                offset,
            },
        );

        Ok(())
    }

    /// Draws indexed with the parameters read from `buffer` at `offset` by the device.
    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: DeviceSize,
    ) -> Result<(), ContextError> {
        self.check_lost()?;
        let framebuffer = self.draw_framebuffer(true)?;
        self.draw_vertex_count = 0;

        let result = self.setup_draw(&framebuffer, true, Some(buffer));
        self.map_device_error(result)?;

        self.record_draw(
            &framebuffer,
            Command::DrawIndexedIndirect {
                buffer: buffer.handle(),
                offset,
            },
        );

        Ok(())
    }

    fn draw_framebuffer(&self, indexed: bool) -> Result<Framebuffer, ContextError> {
        let Some(framebuffer) = &self.state.framebuffer else {
            return Err(ContextError::Unsupported("draws require a framebuffer"));
        };

        if indexed && self.state.index_buffer.is_none() {
            return Err(ContextError::Unsupported(
                "indexed draws require an index buffer",
            ));
        }

        Ok(framebuffer.clone())
    }

    /// Brings the render pass and the bound state up to date for a draw into `framebuffer`.
    fn setup_draw(
        &mut self,
        framebuffer: &Framebuffer,
        indexed: bool,
        indirect: Option<&Arc<Buffer>>,
    ) -> Result<(), DeviceError> {
        let render_area = self
            .state
            .render_area
            .unwrap_or_else(|| RenderArea::full(framebuffer.extent));

        if self.render_pass.is_active()
            && !self.render_pass.matches(&framebuffer.desc(), render_area)
        {
            self.end_render_pass(ClosureReason::FramebufferChange)?;
        }

        self.update_feedback_loops(framebuffer)?;

        let accesses = self.draw_accesses(framebuffer, indexed, indirect);
        self.resolve_hazards(&accesses)?;

        if !self.render_pass.is_open() {
            self.graphics.mark(G::RenderPass);
        }

        if self.is_transform_feedback_active() && !self.features.transform_feedback_extension {
            // The write offsets depend on the vertex count of each draw.
            self.graphics.mark(G::DriverUniforms);
        }

        let mut mask = self.graphics_mask;
        if !indexed {
            mask.remove(G::IndexBuffer);
        }

        tracing::trace!(dirty = ?(self.graphics.dirty() & mask), "processing graphics state");
        DirtyBitPipeline::process(self, mask, graphics_pipeline)?;

        if let Some(buffer) = indirect {
            self.render_pass
                .stream_mut()
                .use_buffer(buffer, AccessType::IndirectCommandRead);
        }

        Ok(())
    }

    fn record_draw(&mut self, framebuffer: &Framebuffer, command: Command) {
        let (depth, stencil) = if framebuffer.depth_stencil_attachment.is_some() {
            (self.state.depth_access(), self.state.stencil_access())
        } else {
            (AttachmentAccess::Unused, AttachmentAccess::Unused)
        };
        let color_write_mask = self.state.color_write_mask;

        self.render_pass.stream_mut().record(command);

        if let Some(session) = self.render_pass.session_mut() {
            session.on_draw(color_write_mask, depth, stencil);
        }

        self.pending_memory_barrier = MemoryBarrierBits::empty();
    }

    /// Moves the write position of emulated transform feedback past the vertices a draw
    /// captured.
    fn advance_transform_feedback(&mut self, vertex_count: u32, instance_count: u32) {
        if !self.is_transform_feedback_active() || self.features.transform_feedback_extension {
            return;
        }

        let vertices = DeviceSize::from(captured_vertex_count(self.state.topology, vertex_count))
            * DeviceSize::from(instance_count);
        let buffer_count = self.state.transform_feedback_buffers.len();

        for (written, &stride) in self
            .transform_feedback_written
            .iter_mut()
            .zip(&self.state.transform_feedback_strides)
            .take(buffer_count)
        {
            *written += vertices * DeviceSize::from(stride);
        }
    }

    /// Detects the attachments of `framebuffer` that are also sampled, and brings the layouts of
    /// the render pass in line with them, closing it if that's not possible.
    fn update_feedback_loops(&mut self, framebuffer: &Framebuffer) -> Result<(), DeviceError> {
        let mut color_mask = 0;

        for (index, attachment) in framebuffer.color_attachments.iter().enumerate() {
            if self.state.samples_image(attachment) {
                color_mask |= 1 << index;
            }
        }

        let depth_stencil = match &framebuffer.depth_stencil_attachment {
            Some(attachment) if self.state.samples_image(attachment) => {
                if self.features.depth_stencil_feedback_loop
                    && !self.state.depth_stencil_writes_enabled()
                {
                    DepthStencilFeedback::ReadOnly
                } else {
                    DepthStencilFeedback::General
                }
            }
            _ => DepthStencilFeedback::None,
        };

        let feedback = FeedbackLoops {
            color_mask,
            depth_stencil,
        };

        if feedback != self.feedback {
            self.feedback = feedback;
            self.graphics.mark(G::ReadOnlyDepthFeedbackLoopMode);
        }

        let Some(session) = self.render_pass.session() else {
            return Ok(());
        };

        if let Some(attachment) = &framebuffer.depth_stencil_attachment {
            let read_only = session.is_depth_stencil_read_only();
            let written = session.depth_access() == AttachmentAccess::Write
                || session.stencil_access() == AttachmentAccess::Write;

            // Level and layer ranges aren't tracked, so any overlap is assumed.
            if read_only && self.state.depth_stencil_writes_enabled() {
                return self.end_render_pass(ClosureReason::DepthStencilWriteAfterFeedbackLoop);
            }

            if depth_stencil == DepthStencilFeedback::ReadOnly && !read_only {
                if written {
                    return self
                        .end_render_pass(ClosureReason::DepthStencilFeedbackLoopAfterWrite);
                }

                if let Some(session) = self.render_pass.session_mut() {
                    session.enter_depth_stencil_read_only();
                }

                self.render_pass.stream_mut().use_image(
                    attachment,
                    AccessType::DepthStencilAttachmentReadOnly,
                    ImageLayout::DepthStencilReadOnlyOptimal,
                );
            }
        }

        let draw_count = self.render_pass.session().map_or(0, |s| s.draw_count());
        let attachments = framebuffer
            .color_attachments
            .iter()
            .map(|attachment| (attachment, AccessType::ColorAttachmentWrite))
            .chain(
                framebuffer
                    .depth_stencil_attachment
                    .iter()
                    .map(|attachment| (attachment, AccessType::DepthStencilAttachmentWrite)),
            );

        for (attachment, access) in attachments {
            if self.planned_attachment_layout(attachment) != ImageLayout::General {
                continue;
            }

            let current = self
                .render_pass
                .stream()
                .image_use(attachment)
                .map(|stream_use| stream_use.layout);

            if current.is_some_and(|layout| layout != ImageLayout::General) {
                if draw_count > 0 {
                    return self.end_render_pass(ClosureReason::ImageLayoutChangeInRenderPass);
                }

                // Nothing has been drawn yet, so the whole render pass can use the new layout.
                self.render_pass
                    .stream_mut()
                    .use_image(attachment, access, ImageLayout::General);
            }
        }

        Ok(())
    }

    /// Returns every resource access of a draw into `framebuffer`.
    fn draw_accesses(
        &self,
        framebuffer: &Framebuffer,
        indexed: bool,
        indirect: Option<&Arc<Buffer>>,
    ) -> AccessList {
        let target = StreamKind::RenderPass;
        let mut accesses = AccessList::new();

        let feedback_loop = |image: &Arc<Image>, access: AccessType, layout: ImageLayout| {
            let mut request = AccessRequest::image(access, layout, target);
            request.feedback_loop = true;
            (Tracked::Image(image.clone()), request)
        };

        for attachment in &framebuffer.color_attachments {
            let layout = self.attachment_layout(attachment);
            accesses.push(feedback_loop(
                attachment,
                AccessType::ColorAttachmentWrite,
                layout,
            ));
        }

        if let Some(attachment) = &framebuffer.depth_stencil_attachment {
            let layout = self.attachment_layout(attachment);
            let access = if layout == ImageLayout::DepthStencilReadOnlyOptimal {
                AccessType::DepthStencilAttachmentReadOnly
            } else {
                AccessType::DepthStencilAttachmentWrite
            };
            accesses.push(feedback_loop(attachment, access, layout));
        }

        for texture in &self.state.textures {
            let access = AccessType::GraphicsShaderSampledRead;

            if is_attachment(framebuffer, texture) {
                let layout = self.attachment_layout(texture);
                accesses.push(feedback_loop(texture, access, layout));
            } else {
                accesses.push((
                    Tracked::Image(texture.clone()),
                    AccessRequest::image(access, ImageLayout::ShaderReadOnlyOptimal, target),
                ));
            }
        }

        let mut push_buffer = |buffer: &Arc<Buffer>, access: AccessType| {
            accesses.push((
                Tracked::Buffer(buffer.clone()),
                AccessRequest::buffer(access, target),
            ));
        };

        for binding in &self.state.vertex_buffers {
            push_buffer(&binding.buffer, AccessType::VertexAttributeRead);
        }

        if indexed {
            if let Some(binding) = &self.state.index_buffer {
                push_buffer(&binding.buffer, AccessType::IndexRead);
            }
        }

        for binding in &self.state.uniform_buffers {
            push_buffer(&binding.buffer, AccessType::GraphicsShaderUniformRead);
        }

        for binding in self
            .state
            .storage_buffers
            .iter()
            .chain(&self.state.atomic_counter_buffers)
        {
            push_buffer(&binding.buffer, AccessType::GraphicsShaderStorageWrite);
        }

        if self.is_transform_feedback_active() {
            let access = self.transform_feedback_buffer_access();

            for binding in &self.state.transform_feedback_buffers {
                push_buffer(&binding.buffer, access);
            }
        }

        if let Some(buffer) = indirect {
            push_buffer(buffer, AccessType::IndirectCommandRead);
        }

        for image in &self.state.storage_images {
            accesses.push((
                Tracked::Image(image.clone()),
                AccessRequest::image(
                    AccessType::GraphicsShaderStorageWrite,
                    ImageLayout::General,
                    target,
                ),
            ));
        }

        accesses
    }

    /// Returns the layout a bound texture is sampled in.
    fn texture_layout(&self, texture: &Image) -> ImageLayout {
        match &self.state.framebuffer {
            Some(framebuffer) if is_attachment(framebuffer, texture) => {
                self.attachment_layout(texture)
            }
            _ => ImageLayout::ShaderReadOnlyOptimal,
        }
    }

    /// Returns how the captured vertices are written to the transform feedback buffers.
    fn transform_feedback_buffer_access(&self) -> AccessType {
        if self.features.transform_feedback_extension {
            AccessType::TransformFeedbackWrite
        } else {
            AccessType::GraphicsShaderStorageWrite
        }
    }

    fn handle_graphics_memory_barrier(&mut self, _: G) -> Handled {
        let Some(barrier) = memory_barrier_for(self.pending_memory_barrier) else {
            return Ok(DirtyBits::empty());
        };

        if self.render_pass.is_open() {
            self.render_pass.stream_mut().add_memory_barrier(barrier);
        } else {
            // Applied when the next render pass begins.
            self.stashed_render_pass_barrier = Some(match self.stashed_render_pass_barrier {
                Some(stashed) => merge_barriers(stashed, barrier),
                None => barrier,
            });
        }

        Ok(DirtyBits::empty())
    }

    fn handle_read_only_depth_feedback_loop_mode(&mut self, _: G) -> Handled {
        Ok(G::PipelineDesc | G::Textures)
    }

    fn handle_graphics_pipeline_desc(&mut self, _: G) -> Handled {
        let Some(framebuffer) = &self.state.framebuffer else {
            return Ok(DirtyBits::empty());
        };

        let state = &self.state;
        let baked = !self.features.dynamic_state;
        let depth_stencil_read_only = framebuffer
            .depth_stencil_attachment
            .as_ref()
            .is_some_and(|attachment| {
                self.attachment_layout(attachment) == ImageLayout::DepthStencilReadOnlyOptimal
            });

        // State set dynamically is left at its default, so that it doesn't create pipelines.
        let desc = GraphicsPipelineDesc {
            program: state.program,
            topology: state.topology,
            vertex_binding_strides: state.vertex_buffers.iter().map(|b| b.stride).collect(),
            cull_mode: baked.then_some(state.cull_mode).unwrap_or_default(),
            front_face: baked.then_some(state.front_face).unwrap_or_default(),
            depth_test_enable: baked && state.depth_test_enable,
            depth_write_enable: baked && state.depth_write_enable,
            depth_compare_op: baked.then_some(state.depth_compare_op).unwrap_or_default(),
            stencil_test_enable: baked && state.stencil_test_enable,
            stencil_front: baked.then_some(state.stencil_front.ops).unwrap_or_default(),
            stencil_back: baked.then_some(state.stencil_back.ops).unwrap_or_default(),
            primitive_restart_enable: baked && state.primitive_restart_enable,
            blend_enable: state.blend_enable,
            advanced_blend_equation: state.advanced_blend_equation,
            color_write_mask: state.color_write_mask,
            samples: framebuffer.samples,
            color_attachment_count: u8::try_from(framebuffer.color_attachments.len())
                .unwrap_or(u8::MAX),
            has_depth_stencil: framebuffer.depth_stencil_attachment.is_some(),
            depth_stencil_read_only,
            transform_feedback: self.is_transform_feedback_active(),
        };

        if self.graphics_pipeline_desc.as_ref() == Some(&desc) {
            return Ok(DirtyBits::empty());
        }

        self.graphics_pipeline_desc = Some(desc);

        Ok(G::PipelineBinding.into())
    }

    fn handle_render_pass(&mut self, _: G) -> Handled {
        if self.render_pass.is_open() {
            return Ok(DirtyBits::empty());
        }

        let Some(framebuffer) = &self.state.framebuffer else {
            return Ok(DirtyBits::empty());
        };
        let desc = framebuffer.desc();
        let render_area = self
            .state
            .render_area
            .unwrap_or_else(|| RenderArea::full(framebuffer.extent));

        if self.render_pass.try_reactivate(&desc, render_area) {
            self.stats.reactivations += 1;

            if let Some(barrier) = self.stashed_render_pass_barrier.take() {
                self.render_pass.stream_mut().add_memory_barrier(barrier);
            }

            return Ok(DirtyBits::empty());
        }

        if self.render_pass.is_active() {
            self.end_render_pass(ClosureReason::FramebufferChange)?;
        }

        self.begin_render_pass()?;
        self.graphics.clear(G::RenderPass);

        Ok(DirtyBits::empty())
    }

    fn handle_graphics_pipeline_binding(&mut self, _: G) -> Handled {
        self.join_warmup()?;

        let Some(desc) = &self.graphics_pipeline_desc else {
            return Ok(DirtyBits::empty());
        };
        let pipeline = self.device.pipeline_cache().get_or_create_graphics(desc)?;

        self.render_pass.stream_mut().record(Command::BindPipeline {
            bind_point: PipelineBindPoint::Graphics,
            pipeline,
        });

        if self.is_transform_feedback_active() {
            self.render_pass.disallow_reactivation();
        }

        Ok(DirtyBits::empty())
    }

    fn handle_graphics_textures(&mut self, _: G) -> Handled {
        for texture in &self.state.textures {
            let layout = self.texture_layout(texture);
            self.render_pass.stream_mut().use_image(
                texture,
                AccessType::GraphicsShaderSampledRead,
                layout,
            );
        }

        Ok(G::DescriptorSets.into())
    }

    fn handle_vertex_buffers(&mut self, _: G) -> Handled {
        let mut buffers = SmallVec::new();

        for binding in &self.state.vertex_buffers {
            self.render_pass
                .stream_mut()
                .use_buffer(&binding.buffer, AccessType::VertexAttributeRead);
            buffers.push((binding.buffer.handle(), binding.offset));
        }

        if !buffers.is_empty() {
            self.render_pass
                .stream_mut()
                .record(Command::BindVertexBuffers {
                    first_binding: 0,
                    buffers,
                });
        }

        Ok(DirtyBits::empty())
    }

    fn handle_index_buffer(&mut self, _: G) -> Handled {
        if let Some(binding) = &self.state.index_buffer {
            let stream = self.render_pass.stream_mut();
            stream.use_buffer(&binding.buffer, AccessType::IndexRead);
            stream.record(Command::BindIndexBuffer {
                buffer: binding.buffer.handle(),
                offset: binding.offset,
                index_type: binding.index_type,
            });
        }

        Ok(DirtyBits::empty())
    }

    fn handle_graphics_uniform_buffers(&mut self, _: G) -> Handled {
        for binding in &self.state.uniform_buffers {
            self.render_pass
                .stream_mut()
                .use_buffer(&binding.buffer, AccessType::GraphicsShaderUniformRead);
        }

        Ok(G::DescriptorSets.into())
    }

    fn handle_graphics_shader_resources(&mut self, _: G) -> Handled {
        let stream = self.render_pass.stream_mut();

        for binding in self
            .state
            .storage_buffers
            .iter()
            .chain(&self.state.atomic_counter_buffers)
        {
            stream.use_buffer(&binding.buffer, AccessType::GraphicsShaderStorageWrite);
        }

        for image in &self.state.storage_images {
            stream.use_image(
                image,
                AccessType::GraphicsShaderStorageWrite,
                ImageLayout::General,
            );
        }

        Ok(G::DescriptorSets | G::DriverUniforms)
    }

    fn handle_barrier(&mut self, bit: G) -> Handled {
        let (command, needed) = match bit {
            G::FramebufferFetchBarrier => (
                Command::FramebufferFetchBarrier,
                self.state.program_uses_framebuffer_fetch,
            ),
            G::BlendBarrier => (
                Command::BlendBarrier,
                self.state.advanced_blend_equation != 0,
            ),
            _ => unreachable!("{bit:?} doesn't record a barrier"),
        };

        if needed {
            self.render_pass.stream_mut().record(command);
        }

        Ok(DirtyBits::empty())
    }

    fn handle_transform_feedback_buffers(&mut self, _: G) -> Handled {
        if !self.is_transform_feedback_active() {
            return Ok(DirtyBits::empty());
        }

        let access = self.transform_feedback_buffer_access();
        let stream = self.render_pass.stream_mut();
        let mut buffers = SmallVec::new();

        for binding in &self.state.transform_feedback_buffers {
            stream.use_buffer(&binding.buffer, access);
            buffers.push((binding.buffer.handle(), binding.offset));
        }

        if self.features.transform_feedback_extension {
            stream.record(Command::BindTransformFeedbackBuffers { buffers });

            Ok(DirtyBits::empty())
        } else {
            // Written by the vertex shader as storage buffers.
            Ok(G::DescriptorSets | G::DriverUniforms)
        }
    }

    fn handle_transform_feedback_resume(&mut self, _: G) -> Handled {
        if self.is_transform_feedback_active() && !self.transform_feedback_recorded {
            self.render_pass
                .stream_mut()
                .record(Command::BeginTransformFeedback);
            self.transform_feedback_recorded = true;
        }

        Ok(DirtyBits::empty())
    }

    fn handle_graphics_descriptor_sets(&mut self, _: G) -> Handled {
        let emulated_transform_feedback: &[BufferBinding] = if self.is_transform_feedback_active()
            && !self.features.transform_feedback_extension
        {
            &self.state.transform_feedback_buffers
        } else {
            &[]
        };
        let descs = self.resource_descriptor_sets(
            |texture| self.texture_layout(texture),
            emulated_transform_feedback,
        );

        self.bind_descriptor_sets(PipelineBindPoint::Graphics, descs)?;

        Ok(DirtyBits::empty())
    }

    fn handle_graphics_driver_uniforms(&mut self, _: G) -> Handled {
        let state = &self.state;
        let Some(framebuffer) = &state.framebuffer else {
            return Ok(DirtyBits::empty());
        };

        let atomic_counter_buffer_offsets: SmallVec<[DeviceSize; 8]> = state
            .atomic_counter_buffers
            .iter()
            .map(|binding| binding.offset)
            .collect();

        let transform_feedback = (self.is_transform_feedback_active()
            && !self.features.transform_feedback_extension)
            .then(|| {
                let mut buffer_offsets = [0; 4];
                for ((offset, binding), written) in buffer_offsets
                    .iter_mut()
                    .zip(&state.transform_feedback_buffers)
                    .zip(self.transform_feedback_written)
                {
                    *offset = binding.offset + written;
                }

                EmulatedTransformFeedback {
                    buffer_offsets,
                    vertices_per_instance: self.draw_vertex_count,
                }
            });

        let info = GraphicsUniformsInfo {
            render_area: state
                .render_area
                .unwrap_or_else(|| RenderArea::full(framebuffer.extent)),
            is_default_framebuffer: framebuffer.is_default,
            clip_origin_upper_left: state.clip_origin_upper_left,
            clip_depth_zero_to_one: state.clip_depth_zero_to_one,
            surface_rotation: state.surface_rotation,
            dither_enable: state.dither_enable,
            color_attachment_count: u32::try_from(framebuffer.color_attachments.len())
                .unwrap_or(u32::MAX),
            samples: framebuffer.samples,
            clip_distance_mask: state.clip_distance_mask,
            advanced_blend_equation: state.advanced_blend_equation,
            depth_range: state.viewport.depth_range,
            transform_feedback,
            atomic_counter_buffer_offsets: &atomic_counter_buffer_offsets,
        };

        self.driver_uniforms
            .write_graphics(&info, self.render_pass.stream_mut());

        Ok(DirtyBits::empty())
    }

    fn handle_dynamic_state(&mut self, bit: G) -> Handled {
        let state = &self.state;

        let command = match bit {
            G::DynamicViewport => Command::SetViewport(self.rotated_viewport()),
            G::DynamicScissor => Command::SetScissor(self.effective_scissor()),
            G::DynamicLineWidth => Command::SetLineWidth(state.line_width),
            G::DynamicDepthBias => Command::SetDepthBias {
                constant_factor: state.depth_bias.constant_factor,
                clamp: state.depth_bias.clamp,
                slope_factor: state.depth_bias.slope_factor,
            },
            G::DynamicBlendConstants => Command::SetBlendConstants(state.blend_constants),
            G::DynamicStencilCompareMask => Command::SetStencilCompareMask {
                front: state.stencil_front.compare_mask,
                back: state.stencil_back.compare_mask,
            },
            G::DynamicStencilWriteMask => Command::SetStencilWriteMask {
                front: state.stencil_front.write_mask,
                back: state.stencil_back.write_mask,
            },
            G::DynamicStencilReference => Command::SetStencilReference {
                front: state.stencil_front.reference,
                back: state.stencil_back.reference,
            },
            G::DynamicCullMode => Command::SetCullMode(state.cull_mode),
            G::DynamicFrontFace => Command::SetFrontFace(state.front_face),
            G::DynamicDepthTestEnable => Command::SetDepthTestEnable(state.depth_test_enable),
            G::DynamicDepthWriteEnable => Command::SetDepthWriteEnable(state.depth_write_enable),
            G::DynamicDepthCompareOp => Command::SetDepthCompareOp(state.depth_compare_op),
            G::DynamicStencilTestEnable => {
                Command::SetStencilTestEnable(state.stencil_test_enable)
            }
            G::DynamicStencilOp => Command::SetStencilOp {
                front: state.stencil_front.ops,
                back: state.stencil_back.ops,
            },
            G::DynamicRasterizerDiscardEnable => {
                Command::SetRasterizerDiscardEnable(state.rasterizer_discard_enable)
            }
            G::DynamicPrimitiveRestartEnable => {
                Command::SetPrimitiveRestartEnable(state.primitive_restart_enable)
            }
            _ => unreachable!("{bit:?} is not dynamic state"),
        };

        self.render_pass.stream_mut().record(command);

        Ok(DirtyBits::empty())
    }

    /// Returns whether the X and Y axes of the framebuffer are exchanged by pre-rotation.
    fn swaps_xy(&self) -> bool {
        self.features.pre_rotation
            && self.state.surface_rotation.swaps_xy()
            && self
                .state
                .framebuffer
                .as_ref()
                .is_some_and(|framebuffer| framebuffer.is_default)
    }

    fn rotated_viewport(&self) -> Viewport {
        let viewport = self.state.viewport;

        if self.swaps_xy() {
            Viewport {
                offset: swapped(viewport.offset),
                extent: swapped(viewport.extent),
                ..viewport
            }
        } else {
            viewport
        }
    }

    fn effective_scissor(&self) -> Scissor {
        if self.state.rasterizer_discard_enable && !self.features.dynamic_rasterizer_discard {
            return Scissor::EMPTY;
        }

        let scissor = self.state.scissor.unwrap_or_else(|| {
            let render_area = self.state.effective_render_area().unwrap_or_default();

            Scissor {
                offset: render_area.offset,
                extent: render_area.extent,
            }
        });

        if self.swaps_xy() {
            Scissor {
                offset: swapped(scissor.offset),
                extent: swapped(scissor.extent),
            }
        } else {
            scissor
        }
    }
}

fn is_attachment(framebuffer: &Framebuffer, image: &Image) -> bool {
    framebuffer.color_attachment_index(image).is_some()
        || framebuffer.is_depth_stencil_attachment(image)
}

fn swapped<T: Copy>([x, y]: [T; 2]) -> [T; 2] {
    [y, x]
}

/// Returns how many vertices transform feedback captures from a draw of `vertex_count`
/// vertices. Strips and fans are captured as lists, and incomplete primitives are dropped.
fn captured_vertex_count(topology: PrimitiveTopology, vertex_count: u32) -> u32 {
    match topology {
        PrimitiveTopology::PointList => vertex_count,
        PrimitiveTopology::LineList => vertex_count - vertex_count % 2,
        PrimitiveTopology::LineStrip => vertex_count.saturating_sub(1) * 2,
        PrimitiveTopology::TriangleList => vertex_count - vertex_count % 3,
        PrimitiveTopology::TriangleStrip | PrimitiveTopology::TriangleFan => {
            vertex_count.saturating_sub(2) * 3
        }
    }
}
