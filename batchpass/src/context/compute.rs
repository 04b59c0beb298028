// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The dispatch path. Dispatches are recorded into the outside-render-pass stream, so an open
//! render pass is left alone unless it touches the same resources.

use super::{memory_barrier_for, AccessList, Context, Tracked};
use crate::{
    command_stream::{Command, StreamKind},
    dirty_bits::{DirtyBitPipeline, DirtyBits},
    hazard::AccessRequest,
    macros::dirty_bits,
    pipeline::{ComputePipelineDesc, PipelineBindPoint},
    resource::Buffer,
    sync::{AccessType, ImageLayout, MemoryBarrierBits},
    ContextError, DeviceError, DeviceSize,
};
use smallvec::SmallVec;
use std::sync::Arc;

dirty_bits! {
    /// A category of state that dispatches depend on, in processing order.
    ComputeDirtyBit;

    MemoryBarrier,
    PipelineDesc,
    PipelineBinding,
    Textures,
    UniformBuffers,
    /// Storage buffers, storage images or atomic counter buffers.
    ShaderResources,
    DescriptorSets,
    DriverUniforms,
}

use self::ComputeDirtyBit as C;

pub(super) fn dirty_bit_pipeline() -> DirtyBitPipeline<Context, C> {
    DirtyBitPipeline::new()
        .with_handler(C::MemoryBarrier, Context::handle_compute_memory_barrier)
        .with_handler(C::PipelineDesc, Context::handle_compute_pipeline_desc)
        .with_handler(C::PipelineBinding, Context::handle_compute_pipeline_binding)
        .with_handler(C::Textures, Context::handle_compute_textures)
        .with_handler(C::UniformBuffers, Context::handle_compute_uniform_buffers)
        .with_handler(C::ShaderResources, Context::handle_compute_shader_resources)
        .with_handler(C::DescriptorSets, Context::handle_compute_descriptor_sets)
        .with_handler(C::DriverUniforms, Context::handle_compute_driver_uniforms)
        // Everything bound goes away with the outside-render-pass stream.
        .with_restart_bits(DirtyBits::after(C::PipelineDesc))
}

fn compute_pipeline(context: &mut Context) -> &mut DirtyBitPipeline<Context, C> {
    &mut context.compute
}

type Handled = Result<DirtyBits<C>, DeviceError>;

impl Context {
    /// Dispatches `group_counts` workgroups of the current program.
    pub fn dispatch(&mut self, group_counts: [u32; 3]) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self
            .setup_dispatch(None)
            .and_then(|()| self.record_dispatch(Command::Dispatch { group_counts }));

        self.map_device_error(result)
    }

    /// Dispatches with the workgroup counts read from `buffer` at `offset` by the device.
    pub fn dispatch_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: DeviceSize,
    ) -> Result<(), ContextError> {
        self.check_lost()?;

        let command = Command::DispatchIndirect {
            buffer: buffer.handle(),
            offset,
        };
        let result = self
            .setup_dispatch(Some(buffer))
            .and_then(|()| self.record_dispatch(command));

        self.map_device_error(result)
    }

    fn setup_dispatch(&mut self, indirect: Option<&Arc<Buffer>>) -> Result<(), DeviceError> {
        let accesses = self.dispatch_accesses(indirect);
        self.resolve_hazards(&accesses)?;

        let mask = self.compute_mask;
        tracing::trace!(dirty = ?(self.compute.dirty() & mask), "processing compute state");
        DirtyBitPipeline::process(self, mask, compute_pipeline)?;

        if let Some(buffer) = indirect {
            self.outside
                .use_buffer(buffer, AccessType::IndirectCommandRead);
        }

        Ok(())
    }

    fn record_dispatch(&mut self, command: Command) -> Result<(), DeviceError> {
        self.outside.record(command);
        self.pending_compute_barrier = MemoryBarrierBits::empty();

        self.submit_if_needed()
    }

    /// Returns every resource access of a dispatch.
    fn dispatch_accesses(&self, indirect: Option<&Arc<Buffer>>) -> AccessList {
        let target = StreamKind::OutsideRenderPass;
        let state = &self.state;
        let mut accesses = AccessList::new();

        for texture in &state.textures {
            accesses.push((
                Tracked::Image(texture.clone()),
                AccessRequest::image(
                    AccessType::ComputeShaderSampledRead,
                    ImageLayout::ShaderReadOnlyOptimal,
                    target,
                ),
            ));
        }

        for image in &state.storage_images {
            accesses.push((
                Tracked::Image(image.clone()),
                AccessRequest::image(
                    AccessType::ComputeShaderStorageWrite,
                    ImageLayout::General,
                    target,
                ),
            ));
        }

        let buffers = state
            .uniform_buffers
            .iter()
            .map(|binding| (&binding.buffer, AccessType::ComputeShaderUniformRead))
            .chain(
                state
                    .storage_buffers
                    .iter()
                    .chain(&state.atomic_counter_buffers)
                    .map(|binding| (&binding.buffer, AccessType::ComputeShaderStorageWrite)),
            )
            .chain(indirect.map(|buffer| (buffer, AccessType::IndirectCommandRead)));

        for (buffer, access) in buffers {
            accesses.push((
                Tracked::Buffer(buffer.clone()),
                AccessRequest::buffer(access, target),
            ));
        }

        accesses
    }

    fn handle_compute_memory_barrier(&mut self, _: C) -> Handled {
        let Some(barrier) = memory_barrier_for(self.pending_compute_barrier) else {
            return Ok(DirtyBits::empty());
        };

        // The barrier executes before the stream, so earlier dispatches go in a stream of their
        // own.
        if self.outside.is_started() {
            self.flush_outside_stream(false)?;
        }

        self.outside.add_memory_barrier(barrier);

        Ok(DirtyBits::empty())
    }

    fn handle_compute_pipeline_desc(&mut self, _: C) -> Handled {
        let desc = ComputePipelineDesc {
            program: self.state.program,
        };

        if self.compute_pipeline_desc == Some(desc) {
            return Ok(DirtyBits::empty());
        }

        self.compute_pipeline_desc = Some(desc);

        Ok(C::PipelineBinding.into())
    }

    fn handle_compute_pipeline_binding(&mut self, _: C) -> Handled {
        self.join_warmup()?;

        let Some(desc) = &self.compute_pipeline_desc else {
            return Ok(DirtyBits::empty());
        };
        let pipeline = self.device.pipeline_cache().get_or_create_compute(desc)?;

        self.outside.record(Command::BindPipeline {
            bind_point: PipelineBindPoint::Compute,
            pipeline,
        });

        Ok(DirtyBits::empty())
    }

    fn handle_compute_textures(&mut self, _: C) -> Handled {
        for texture in &self.state.textures {
            self.outside.use_image(
                texture,
                AccessType::ComputeShaderSampledRead,
                ImageLayout::ShaderReadOnlyOptimal,
            );
        }

        Ok(C::DescriptorSets.into())
    }

    fn handle_compute_uniform_buffers(&mut self, _: C) -> Handled {
        for binding in &self.state.uniform_buffers {
            self.outside
                .use_buffer(&binding.buffer, AccessType::ComputeShaderUniformRead);
        }

        Ok(C::DescriptorSets.into())
    }

    fn handle_compute_shader_resources(&mut self, _: C) -> Handled {
        for binding in self
            .state
            .storage_buffers
            .iter()
            .chain(&self.state.atomic_counter_buffers)
        {
            self.outside
                .use_buffer(&binding.buffer, AccessType::ComputeShaderStorageWrite);
        }

        for image in &self.state.storage_images {
            self.outside.use_image(
                image,
                AccessType::ComputeShaderStorageWrite,
                ImageLayout::General,
            );
        }

        Ok(C::DescriptorSets | C::DriverUniforms)
    }

    fn handle_compute_descriptor_sets(&mut self, _: C) -> Handled {
        let descs = self.resource_descriptor_sets(|_| ImageLayout::ShaderReadOnlyOptimal, &[]);
        self.bind_descriptor_sets(PipelineBindPoint::Compute, descs)?;

        Ok(DirtyBits::empty())
    }

    fn handle_compute_driver_uniforms(&mut self, _: C) -> Handled {
        let offsets: SmallVec<[DeviceSize; 8]> = self
            .state
            .atomic_counter_buffers
            .iter()
            .map(|binding| binding.offset)
            .collect();

        self.driver_uniforms.write_compute(&offsets, &mut self.outside);

        Ok(DirtyBits::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::{BufferBinding, ContextCreateInfo, Features, StateChange, VertexBufferBinding},
        pipeline::ProgramId,
        render_pass::{ClosureReason, Framebuffer},
        tests::{buffer, color_image, framebuffer},
    };

    fn bind_framebuffer(context: &mut Context, framebuffer: Framebuffer) {
        context.state_mut().framebuffer = Some(framebuffer);
        context
            .notify_state_changed(StateChange::Framebuffer)
            .unwrap();
    }

    fn bind_storage_buffer(context: &mut Context, buffer: Arc<Buffer>) {
        context
            .state_mut()
            .storage_buffers
            .push(BufferBinding::whole(buffer));
        context
            .notify_state_changed(StateChange::ShaderStorage)
            .unwrap();
    }

    #[test]
    fn dispatch_leaves_the_render_pass_open() {
        let (mocks, mut context) = test_context!();
        bind_framebuffer(&mut context, framebuffer(1, &[color_image()], None));
        context.draw(3, 1, 0, 0).unwrap();

        context.dispatch([8, 8, 1]).unwrap();
        assert!(context.render_pass().is_open());
        assert_eq!(mocks.pipeline_cache.compute_created(), 1);

        let commands = context.outside_stream().commands();
        assert!(commands.contains(&Command::Dispatch {
            group_counts: [8, 8, 1],
        }));
        assert!(commands.iter().any(|command| matches!(
            command,
            Command::BindPipeline {
                bind_point: PipelineBindPoint::Compute,
                ..
            },
        )));

        context.finish().unwrap();
        assert_eq!(
            mocks.queue.submissions()[0].stream_kinds,
            [StreamKind::OutsideRenderPass, StreamKind::RenderPass],
        );
    }

    #[test]
    fn dispatch_writing_a_vertex_buffer_closes_the_render_pass() {
        let (_mocks, mut context) = test_context!();
        let vertices = buffer(1024);

        bind_framebuffer(&mut context, framebuffer(1, &[color_image()], None));
        context.state_mut().vertex_buffers.push(VertexBufferBinding {
            buffer: vertices.clone(),
            offset: 0,
            stride: 16,
        });
        context
            .notify_state_changed(StateChange::VertexBuffers)
            .unwrap();
        context.draw(3, 1, 0, 0).unwrap();

        bind_storage_buffer(&mut context, vertices);
        context.dispatch([1, 1, 1]).unwrap();
        assert!(!context.render_pass().is_active());
        assert_eq!(
            context
                .stats()
                .closures(ClosureReason::BufferUseThenOutOfRenderPassWrite),
            1,
        );
    }

    #[test]
    fn dependent_dispatches_are_split() {
        let (_mocks, mut context) = test_context!();
        bind_storage_buffer(&mut context, buffer(256));

        context.dispatch([1, 1, 1]).unwrap();
        context.dispatch([1, 1, 1]).unwrap();
        assert_eq!(context.stats().outside_flushes, 1);

        // Bindings are recorded again in the new stream.
        let commands = context.outside_stream().commands();
        assert!(matches!(commands[0], Command::BindPipeline { .. }));
        assert!(!context.outside_stream().pre_barrier().is_empty());
    }

    #[test]
    fn memory_barrier_starts_a_new_stream() {
        let (_mocks, mut context) = test_context!();

        context.dispatch([1, 1, 1]).unwrap();
        context
            .memory_barrier(MemoryBarrierBits::SHADER_STORAGE)
            .unwrap();
        context.dispatch([1, 1, 1]).unwrap();

        assert_eq!(context.stats().outside_flushes, 1);
        assert!(!context.outside_stream().pre_barrier().is_empty());

        // Honored once.
        context.dispatch([1, 1, 1]).unwrap();
        assert_eq!(context.stats().outside_flushes, 1);
    }

    #[test]
    fn indirect_dispatch_from_transform_feedback_output() {
        let (_mocks, mut context) = test_context!(ContextCreateInfo {
            features: Features {
                transform_feedback_extension: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let output = buffer(4096);

        bind_framebuffer(&mut context, framebuffer(1, &[color_image()], None));
        context
            .begin_transform_feedback(&[BufferBinding::whole(output.clone())])
            .unwrap();
        context.draw(3, 1, 0, 0).unwrap();
        context.end_transform_feedback().unwrap();

        context.dispatch_indirect(&output, 0).unwrap();
        assert_eq!(
            context
                .stats()
                .closures(ClosureReason::TransformFeedbackWriteThenIndirectBuffer),
            1,
        );
        let indirect_use = context.outside_stream().buffer_use(&output).unwrap();
        assert!(!indirect_use.is_write());
    }

    #[test]
    fn program_changes_create_pipelines() {
        let (mocks, mut context) = test_context!();

        context.dispatch([1, 1, 1]).unwrap();
        context.state_mut().program = ProgramId(2);
        context.notify_state_changed(StateChange::Program).unwrap();
        context.dispatch([1, 1, 1]).unwrap();
        context.dispatch([1, 1, 1]).unwrap();

        assert_eq!(mocks.pipeline_cache.compute_created(), 2);
        let binds = context
            .outside_stream()
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 2);
    }
}
