// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The composition root that the frontend talks to.
//!
//! A [`Context`] owns the two command streams of one logical queue index, the render pass state
//! machine, the graphics and compute dirty-bit pipelines and the submission scheduler. The
//! frontend writes its state through [`Context::state_mut`], reports each change with
//! [`Context::notify_state_changed`], and then issues draws, dispatches, copies and
//! synchronization operations.
//!
//! # Examples
//!
//! ```ignore
//! let mut context = Context::new(device, ContextCreateInfo::default());
//!
//! context.state_mut().framebuffer = Some(framebuffer);
//! context.notify_state_changed(StateChange::Framebuffer)?;
//! context.state_mut().program = program;
//! context.notify_state_changed(StateChange::Program)?;
//!
//! context.draw(3, 1, 0, 0)?;
//! context.flush()?;
//! ```
//!
//! # Errors
//!
//! Every entry point returns a [`ContextError`]. A fatal device error puts the context in the
//! lost state: the work that was pending is dropped and every later call fails with
//! [`ContextError::ContextLost`] without doing anything.

pub use self::{
    compute::ComputeDirtyBit,
    graphics::GraphicsDirtyBit,
    state::{
        BufferBinding, DepthBias, FrontendState, IndexBufferBinding, StateChange,
        StencilFaceState, VertexBufferBinding,
    },
};
use crate::{
    command_stream::{Command, CommandStream, QueryKind, StreamKind},
    descriptor_set::{
        DescriptorBinding, DescriptorResource, DescriptorSetDesc, DescriptorSetTracker,
        DescriptorType,
    },
    device::{Device, Semaphore, SemaphoreWait},
    dirty_bits::{DirtyBitPipeline, DirtyBits},
    driver_uniforms::DriverUniformsWriter,
    hazard::{self, AccessRequest, HazardDecision},
    memory::{self, Allocation, AllocationRequest, Reclaim, RetryStage},
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineBindPoint, PipelineWarmup},
    render_pass::{ClosureReason, RenderArea, RenderPassStateMachine},
    resource::{Buffer, Image, StreamUse},
    serial::{QueueSerial, QueueSerials, ReservedSerials, Serial, SerialFactory},
    submit::{SubmissionScheduler, SubmissionStats, SubmitReason, SubmitThresholds},
    sync::{AccessType, ImageLayout, MemoryBarrier, MemoryBarrierBits},
    ContextError, DeviceError, DeviceSize, NonExhaustive, OomError,
};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

mod compute;
mod graphics;
mod state;

/// Optional device capabilities. They are resolved once, when the context is created, into the
/// handler tables of its dirty-bit pipelines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Features {
    /// Cull mode, front face, depth and stencil toggles and primitive restart are dynamic state
    /// rather than part of the pipeline.
    pub dynamic_state: bool,

    /// Rasterizer discard is dynamic state. Without it, rasterizer discard is emulated with an
    /// empty scissor.
    pub dynamic_rasterizer_discard: bool,

    /// Transform feedback is recorded with native commands. Without it, the vertex shader writes
    /// the captured vertices to storage buffers at offsets given in the driver uniforms.
    pub transform_feedback_extension: bool,

    /// Framebuffer fetch is available but not coherent, so that each draw that reads the
    /// framebuffer is preceded by a barrier.
    pub framebuffer_fetch: bool,

    /// Advanced blending is coherent. When false, each draw with an advanced blend equation is
    /// preceded by a barrier.
    pub advanced_blend_coherent: bool,

    /// A depth/stencil attachment can be sampled while it is bound read-only, without closing
    /// the render pass.
    pub depth_stencil_feedback_loop: bool,

    /// Surface rotation is applied by the draws rather than by the presentation engine.
    pub pre_rotation: bool,
}

/// Limits of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextLimits {
    /// Pending commands that are submitted early when the queue is idle.
    ///
    /// The default value is `1024`.
    pub max_commands_before_submit: usize,

    /// Size of the garbage waiting for the device above which pending work is submitted.
    ///
    /// The default value is 64 MiB.
    pub pending_garbage_size_limit: DeviceSize,

    /// Serials reserved for the outside-render-pass stream each time a render pass begins. Must
    /// be at least 2.
    ///
    /// The default value is `15`.
    pub max_reserved_outside_render_pass_serials: u64,

    /// Alignment of the offsets that storage buffers can be bound at. Must be a power of two.
    ///
    /// The default value is `256`.
    pub min_storage_buffer_offset_alignment: DeviceSize,
}

impl Default for ContextLimits {
    #[inline]
    fn default() -> Self {
        ContextLimits {
            max_commands_before_submit: 1024,
            pending_garbage_size_limit: 64 * 1024 * 1024,
            max_reserved_outside_render_pass_serials: 15,
            min_storage_buffer_offset_alignment: 256,
        }
    }
}

/// Parameters to create a new `Context`.
#[derive(Clone, Debug)]
pub struct ContextCreateInfo {
    pub features: Features,

    pub limits: ContextLimits,

    /// Whether [`Context::flush`] leaves an open render pass open, and submits when the render
    /// pass is closed instead. Operations that synchronize with something outside of the
    /// context never defer.
    ///
    /// The default value is `false`.
    pub defer_flush_in_render_pass: bool,

    pub _ne: NonExhaustive,
}

impl Default for ContextCreateInfo {
    #[inline]
    fn default() -> Self {
        ContextCreateInfo {
            features: Features::default(),
            limits: ContextLimits::default(),
            defer_flush_in_render_pass: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// Counters of a context, for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct ContextStats {
    /// Render passes begun, not counting reactivations.
    pub render_passes_begun: u64,
    /// Render passes reopened without a new beginning.
    pub reactivations: u64,
    /// Batches handed to the queue.
    pub submissions: u64,
    /// Times the outside-render-pass stream was ended.
    pub outside_flushes: u64,
    /// Times the host blocked waiting for the device.
    pub waits: u64,
    closures: HashMap<ClosureReason, u64>,
}

impl ContextStats {
    /// Returns how many times an open render pass was closed for `reason`.
    #[inline]
    pub fn closures(&self, reason: ClosureReason) -> u64 {
        self.closures.get(&reason).copied().unwrap_or(0)
    }

    /// Returns how many times an open render pass was closed, for any reason.
    #[inline]
    pub fn total_closures(&self) -> u64 {
        self.closures.values().sum()
    }
}

/// How the attachments of the current framebuffer are also sampled by the bound textures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct FeedbackLoops {
    /// One bit per color attachment that is also a texture.
    color_mask: u32,
    depth_stencil: DepthStencilFeedback,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DepthStencilFeedback {
    #[default]
    None,
    /// Sampled while bound read-only.
    ReadOnly,
    /// Sampled while it may be written, in the general layout.
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransformFeedbackState {
    Inactive,
    Active,
    Paused,
}

#[derive(Clone, Copy, Debug)]
struct ActiveQuery {
    kind: QueryKind,
    index: u32,
    /// Whether the query was begun in the current render pass stream.
    recorded: bool,
}

/// A resource touched by an operation, waiting for its hazards to be resolved.
#[derive(Clone, Debug)]
enum Tracked {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

type AccessList = SmallVec<[(Tracked, AccessRequest); 16]>;

type StateChangeBits = (DirtyBits<GraphicsDirtyBit>, DirtyBits<ComputeDirtyBit>);

/// Records the commands of one frontend context.
pub struct Context {
    device: Arc<Device>,
    features: Features,
    limits: ContextLimits,
    defer_flush_in_render_pass: bool,

    serials: SerialFactory,
    reserved_serials: ReservedSerials,
    outside: CommandStream,
    render_pass: RenderPassStateMachine,
    scheduler: SubmissionScheduler,

    graphics: DirtyBitPipeline<Context, GraphicsDirtyBit>,
    compute: DirtyBitPipeline<Context, ComputeDirtyBit>,
    graphics_mask: DirtyBits<GraphicsDirtyBit>,
    compute_mask: DirtyBits<ComputeDirtyBit>,
    state_change_bits: [StateChangeBits; StateChange::COUNT],

    state: FrontendState,
    driver_uniforms: DriverUniformsWriter,
    descriptor_sets: DescriptorSetTracker,
    graphics_pipeline_desc: Option<GraphicsPipelineDesc>,
    compute_pipeline_desc: Option<ComputePipelineDesc>,
    warmup: Option<PipelineWarmup>,

    feedback: FeedbackLoops,
    draw_vertex_count: u32,
    /// Barrier bits not yet honored by a draw.
    pending_memory_barrier: MemoryBarrierBits,
    /// Barrier bits not yet honored by a dispatch.
    pending_compute_barrier: MemoryBarrierBits,
    stashed_render_pass_barrier: Option<MemoryBarrier>,
    transform_feedback: TransformFeedbackState,
    transform_feedback_recorded: bool,
    /// Bytes captured so far into each buffer by emulated transform feedback.
    transform_feedback_written: [DeviceSize; 4],
    active_queries: SmallVec<[ActiveQuery; 4]>,

    deferred_flush: bool,
    rasterizer_discard_warned: bool,
    lost: bool,
    stats: ContextStats,
}

impl Context {
    /// Creates a context recording for `device`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.limits.max_reserved_outside_render_pass_serials` is less than 2.
    /// - Panics if `create_info.limits.min_storage_buffer_offset_alignment` is not a power of
    ///   two.
    pub fn new(device: Arc<Device>, create_info: ContextCreateInfo) -> Self {
        let ContextCreateInfo {
            features,
            limits,
            defer_flush_in_render_pass,
            _ne: _,
        } = create_info;

        assert!(
            limits.max_reserved_outside_render_pass_serials >= 2,
            "at least 2 serials must be reserved for the outside-render-pass stream",
        );

        let index = device.allocate_serial_index();
        let scheduler = SubmissionScheduler::new(
            device.queue().clone(),
            device.garbage().clone(),
            SubmitThresholds {
                max_commands_before_submit: limits.max_commands_before_submit,
                pending_garbage_size_limit: limits.pending_garbage_size_limit,
            },
        );

        let graphics = graphics::dirty_bit_pipeline(&features);
        let compute = compute::dirty_bit_pipeline();
        let graphics_mask: DirtyBits<GraphicsDirtyBit> = DirtyBits::all()
            .iter()
            .filter(|&bit| graphics.has_handler(bit))
            .collect();
        let compute_mask: DirtyBits<ComputeDirtyBit> = DirtyBits::all()
            .iter()
            .filter(|&bit| compute.has_handler(bit))
            .collect();
        let state_change_bits = StateChange::ALL.map(|change| {
            let (graphics_bits, compute_bits) = state_change_bits(&features, change);

            (graphics_bits & graphics_mask, compute_bits & compute_mask)
        });

        tracing::debug!(index = index.0, ?features, "context created");

        Context {
            features,
            limits,
            defer_flush_in_render_pass,
            serials: SerialFactory::new(index),
            reserved_serials: ReservedSerials::empty(index),
            outside: CommandStream::new(StreamKind::OutsideRenderPass),
            render_pass: RenderPassStateMachine::new(),
            scheduler,
            graphics,
            compute,
            graphics_mask,
            compute_mask,
            state_change_bits,
            state: FrontendState::default(),
            driver_uniforms: DriverUniformsWriter::new(
                features.pre_rotation,
                limits.min_storage_buffer_offset_alignment,
            ),
            descriptor_sets: DescriptorSetTracker::new(),
            graphics_pipeline_desc: None,
            compute_pipeline_desc: None,
            warmup: None,
            feedback: FeedbackLoops::default(),
            draw_vertex_count: 0,
            pending_memory_barrier: MemoryBarrierBits::empty(),
            pending_compute_barrier: MemoryBarrierBits::empty(),
            stashed_render_pass_barrier: None,
            transform_feedback: TransformFeedbackState::Inactive,
            transform_feedback_recorded: false,
            transform_feedback_written: [0; 4],
            active_queries: SmallVec::new(),
            deferred_flush: false,
            rasterizer_discard_warned: false,
            lost: false,
            stats: ContextStats::default(),
            device,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn features(&self) -> &Features {
        &self.features
    }

    #[inline]
    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// Returns the frontend state.
    #[inline]
    pub fn state(&self) -> &FrontendState {
        &self.state
    }

    /// Returns the frontend state for modification. Every change must be reported with
    /// [`notify_state_changed`](Self::notify_state_changed) before the next draw or dispatch.
    #[inline]
    pub fn state_mut(&mut self) -> &mut FrontendState {
        &mut self.state
    }

    /// Returns the render pass state machine.
    #[inline]
    pub fn render_pass(&self) -> &RenderPassStateMachine {
        &self.render_pass
    }

    /// Returns the outside-render-pass command stream.
    #[inline]
    pub fn outside_stream(&self) -> &CommandStream {
        &self.outside
    }

    /// Returns the serial factory of the context's queue index.
    #[inline]
    pub fn serials(&self) -> &SerialFactory {
        &self.serials
    }

    /// Returns whether a fatal device error has made the context unusable.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Returns the counters of the context.
    pub fn stats(&self) -> ContextStats {
        let SubmissionStats { submissions, waits } = self.scheduler.stats();

        ContextStats {
            submissions,
            waits: self.stats.waits + waits,
            ..self.stats.clone()
        }
    }

    /// Reports that the frontend changed one category of state.
    pub fn notify_state_changed(&mut self, change: StateChange) -> Result<(), ContextError> {
        self.check_lost()?;

        let (graphics_bits, compute_bits) = self.state_change_bits[change as usize];
        self.graphics.mark_all(graphics_bits);
        self.compute.mark_all(compute_bits);

        match change {
            StateChange::Program => {
                let barrier = self.features.framebuffer_fetch
                    && self.state.program_uses_framebuffer_fetch;
                self.set_persistent(GraphicsDirtyBit::FramebufferFetchBarrier, barrier);
            }
            StateChange::Blend => {
                let barrier = self.state.advanced_blend_equation != 0;
                self.set_persistent(GraphicsDirtyBit::BlendBarrier, barrier);
            }
            StateChange::Framebuffer => {
                let result = self.close_render_pass(ClosureReason::FramebufferChange);
                self.map_device_error(result)?;
            }
            StateChange::Dither => self.render_pass.disallow_reactivation(),
            StateChange::RasterizerDiscard => {
                if self.state.rasterizer_discard_enable
                    && !self.features.dynamic_rasterizer_discard
                    && !self.rasterizer_discard_warned
                {
                    tracing::warn!("rasterizer discard is emulated with an empty scissor");
                    self.rasterizer_discard_warned = true;
                }
            }
            _ => (),
        }

        Ok(())
    }

    fn set_persistent(&mut self, bit: GraphicsDirtyBit, persistent: bool) {
        if self.graphics.has_handler(bit) {
            self.graphics.set_persistent(bit, persistent);
        }
    }

    /// Requests that the writes of earlier draws and dispatches be made visible to later ones.
    ///
    /// Nothing is recorded until the next draw or dispatch, which honors the barrier against the
    /// resources it touches.
    pub fn memory_barrier(&mut self, bits: MemoryBarrierBits) -> Result<(), ContextError> {
        self.check_lost()?;

        if bits.is_empty() {
            return Ok(());
        }

        self.pending_memory_barrier |= bits;
        self.pending_compute_barrier |= bits;
        self.graphics.mark(GraphicsDirtyBit::MemoryBarrier);
        self.compute.mark(ComputeDirtyBit::MemoryBarrier);

        Ok(())
    }

    /// Submits everything recorded so far, without waiting.
    ///
    /// If the context was created with `defer_flush_in_render_pass` and a render pass is open,
    /// the submission happens when the render pass is closed instead.
    pub fn flush(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        if self.defer_flush_in_render_pass && self.render_pass.is_open() {
            tracing::debug!("flush deferred until the render pass is closed");
            self.deferred_flush = true;

            return Ok(());
        }

        let result = self
            .end_render_pass(ClosureReason::ExplicitFlush)
            .and_then(|()| self.submit(SubmitReason::Flush, None).map(|_| ()));

        self.map_device_error(result)
    }

    /// Submits everything recorded so far, and signals `semaphore` when it has executed. A
    /// submission happens even if nothing was recorded.
    pub fn flush_and_signal(&mut self, semaphore: Semaphore) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self
            .end_render_pass(ClosureReason::ExplicitFlush)
            .and_then(|()| self.submit(SubmitReason::SemaphoreSignal, Some(semaphore)))
            .map(|_| ());

        self.map_device_error(result)
    }

    /// Submits everything recorded so far, and blocks until the device has executed it.
    pub fn finish(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self
            .end_render_pass(ClosureReason::Finish)
            .and_then(|()| self.finish_submitted());

        self.map_device_error(result)
    }

    fn finish_submitted(&mut self) -> Result<(), DeviceError> {
        debug_assert!(!self.render_pass.is_active());

        self.flush_outside_stream(false)?;
        self.deferred_flush = false;

        self.scheduler.finish(&self.serials)
    }

    /// Called when the context becomes current on a thread. The device state left by another
    /// context is unknown, so everything is recorded again.
    pub fn on_make_current(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        self.graphics.mark_all(self.graphics_mask);
        self.compute.mark_all(self.compute_mask);
        self.scheduler.cleanup();

        Ok(())
    }

    /// Called when the context stops being current. Everything recorded so far is submitted.
    pub fn on_unmake_current(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self
            .end_render_pass(ClosureReason::ContextChange)
            .and_then(|()| self.submit(SubmitReason::ContextChange, None))
            .map(|_| ());

        self.map_device_error(result)
    }

    /// Makes the next submission wait for `semaphore`. Everything recorded before the call is
    /// submitted first, so that only later work waits.
    pub fn wait_semaphore(&mut self, semaphore: Semaphore) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self
            .end_render_pass(ClosureReason::SemaphoreWait)
            .and_then(|()| self.submit(SubmitReason::Flush, None))
            .map(|_| ());
        self.map_device_error(result)?;

        self.scheduler
            .add_wait_semaphore(SemaphoreWait::all_commands(semaphore));

        Ok(())
    }

    /// Transitions `image` for presentation and submits right away, so that its new owner can
    /// use it.
    pub fn release_to_external(&mut self, image: &Arc<Image>) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.release_to_external_inner(image);

        self.map_device_error(result)
    }

    fn release_to_external_inner(&mut self, image: &Arc<Image>) -> Result<(), DeviceError> {
        self.end_render_pass(ClosureReason::ExternalRelease)?;

        let request = AccessRequest::image(
            AccessType::Present,
            ImageLayout::PresentSrc,
            StreamKind::OutsideRenderPass,
        );
        self.resolve_hazards(&[(Tracked::Image(image.clone()), request)])?;
        self.outside
            .use_image(image, AccessType::Present, ImageLayout::PresentSrc);

        self.submit(SubmitReason::ExternalRelease, None)?;

        Ok(())
    }

    /// Makes the device writes to `buffer` visible to the host, waiting for them if needed.
    /// Returns without blocking if the last write has already completed.
    pub fn map_buffer_for_read(&mut self, buffer: &Arc<Buffer>) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.map_buffer_for_read_inner(buffer);

        self.map_device_error(result)
    }

    fn map_buffer_for_read_inner(&mut self, buffer: &Arc<Buffer>) -> Result<(), DeviceError> {
        let written_by_render_pass = self.render_pass.is_active()
            && self
                .render_pass
                .stream()
                .buffer_use(buffer)
                .is_some_and(|stream_use| stream_use.is_write());
        let written_outside = self
            .outside
            .buffer_use(buffer)
            .is_some_and(|stream_use| stream_use.is_write());

        if written_by_render_pass || written_outside {
            self.end_render_pass(ClosureReason::HostBufferRead)?;
            self.flush_outside_stream(false)?;
        }

        let written = buffer.resource_use().written;
        let own = written.get(self.serials.index());
        let submitted = self
            .scheduler
            .last_submitted()
            .map_or(Serial::ZERO, |queue_serial| queue_serial.serial);

        if own.is_valid() && own > submitted {
            self.end_render_pass(ClosureReason::HostBufferRead)?;
            self.submit(SubmitReason::HostAccess, None)?;
        }

        for queue_serial in written.iter() {
            if queue_serial.index == self.serials.index() {
                self.scheduler.wait_for(queue_serial)?;
            } else if !self.device.queue().is_complete(queue_serial) {
                // Written by another context, which has submitted it already.
                self.device.queue().wait_until_complete(queue_serial)?;
                self.stats.waits += 1;
            }
        }

        Ok(())
    }

    /// Copies `size` bytes from the start of `src` to the start of `dst`.
    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        size: DeviceSize,
    ) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.copy_buffer_inner(src, dst, size);

        self.map_device_error(result)
    }

    fn copy_buffer_inner(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        size: DeviceSize,
    ) -> Result<(), DeviceError> {
        let outside = StreamKind::OutsideRenderPass;
        self.resolve_hazards(&[
            (
                Tracked::Buffer(src.clone()),
                AccessRequest::buffer(AccessType::CopyTransferRead, outside),
            ),
            (
                Tracked::Buffer(dst.clone()),
                AccessRequest::buffer(AccessType::CopyTransferWrite, outside),
            ),
        ])?;

        self.outside.use_buffer(src, AccessType::CopyTransferRead);
        self.outside.use_buffer(dst, AccessType::CopyTransferWrite);
        self.outside.record(Command::CopyBuffer {
            src: src.handle(),
            dst: dst.handle(),
            size,
        });

        self.submit_if_needed()
    }

    /// Clears every texel of `image` to `color`.
    pub fn clear_color_image(
        &mut self,
        image: &Arc<Image>,
        color: [f32; 4],
    ) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.clear_color_image_inner(image, color);

        self.map_device_error(result)
    }

    fn clear_color_image_inner(
        &mut self,
        image: &Arc<Image>,
        color: [f32; 4],
    ) -> Result<(), DeviceError> {
        let request = AccessRequest::image(
            AccessType::CopyTransferWrite,
            ImageLayout::TransferDstOptimal,
            StreamKind::OutsideRenderPass,
        );
        self.resolve_hazards(&[(Tracked::Image(image.clone()), request)])?;

        self.outside.use_image(
            image,
            AccessType::CopyTransferWrite,
            ImageLayout::TransferDstOptimal,
        );
        self.outside.record(Command::ClearColorImage {
            image: image.handle(),
            color,
        });

        self.submit_if_needed()
    }

    /// Begins a query. Occlusion and primitive queries are recorded in the render pass, and
    /// follow the context from one render pass to the next until they are ended. Time-elapsed
    /// queries are recorded outside of render passes.
    ///
    /// Timestamps are not begun or ended: use [`write_timestamp`](Self::write_timestamp).
    pub fn begin_query(&mut self, kind: QueryKind, index: u32) -> Result<(), ContextError> {
        self.check_lost()?;

        match kind {
            QueryKind::Timestamp => {
                Err(ContextError::Unsupported("timestamp queries can't be begun"))
            }
            QueryKind::TimeElapsed => {
                let result = self.end_render_pass(ClosureReason::TimestampQuery);
                self.map_device_error(result)?;
                self.outside.record(Command::BeginQuery { kind, index });

                Ok(())
            }
            _ => {
                self.render_pass.disallow_reactivation();

                let recorded = self.render_pass.is_open();
                if recorded {
                    self.render_pass
                        .stream_mut()
                        .record(Command::BeginQuery { kind, index });
                }

                self.active_queries.push(ActiveQuery {
                    kind,
                    index,
                    recorded,
                });

                Ok(())
            }
        }
    }

    /// Ends a query begun with [`begin_query`](Self::begin_query).
    pub fn end_query(&mut self, kind: QueryKind, index: u32) -> Result<(), ContextError> {
        self.check_lost()?;

        match kind {
            QueryKind::Timestamp => {
                Err(ContextError::Unsupported("timestamp queries can't be ended"))
            }
            QueryKind::TimeElapsed => {
                let result = self.end_render_pass(ClosureReason::TimestampQuery);
                self.map_device_error(result)?;
                self.outside.record(Command::EndQuery { kind, index });

                Ok(())
            }
            _ => {
                self.render_pass.disallow_reactivation();

                let position = self
                    .active_queries
                    .iter()
                    .position(|query| query.kind == kind && query.index == index);

                if let Some(position) = position {
                    let query = self.active_queries.remove(position);

                    if query.recorded && self.render_pass.is_active() {
                        self.render_pass
                            .stream_mut()
                            .record(Command::EndQuery { kind, index });
                    }
                }

                Ok(())
            }
        }
    }

    /// Writes the device time into timestamp query `index` once the work recorded before it has
    /// executed.
    pub fn write_timestamp(&mut self, index: u32) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.end_render_pass(ClosureReason::TimestampQuery);
        self.map_device_error(result)?;
        self.outside.record(Command::WriteTimestamp { index });

        Ok(())
    }

    /// Starts capturing the vertices of the following draws into `buffers`.
    ///
    /// # Panics
    ///
    /// - Panics if transform feedback is already active or paused.
    pub fn begin_transform_feedback(
        &mut self,
        buffers: &[BufferBinding],
    ) -> Result<(), ContextError> {
        self.check_lost()?;
        assert_eq!(
            self.transform_feedback,
            TransformFeedbackState::Inactive,
            "transform feedback is already active",
        );

        self.state.transform_feedback_buffers = buffers.iter().cloned().collect();
        self.transform_feedback = TransformFeedbackState::Active;
        self.transform_feedback_recorded = false;
        self.transform_feedback_written = [0; 4];
        self.mark_transform_feedback_changed();

        Ok(())
    }

    /// Suspends the capture until [`resume_transform_feedback`] is called. With native
    /// transform feedback this closes the render pass. Resumed capture appends to what was
    /// captured before the pause.
    ///
    /// [`resume_transform_feedback`]: Self::resume_transform_feedback
    pub fn pause_transform_feedback(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        if self.transform_feedback != TransformFeedbackState::Active {
            return Ok(());
        }

        if self.features.transform_feedback_extension {
            let result = self.end_render_pass(ClosureReason::TransformFeedbackPause);
            self.map_device_error(result)?;
        }

        self.transform_feedback = TransformFeedbackState::Paused;
        self.mark_transform_feedback_changed();

        Ok(())
    }

    pub fn resume_transform_feedback(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        if self.transform_feedback != TransformFeedbackState::Paused {
            return Ok(());
        }

        self.transform_feedback = TransformFeedbackState::Active;
        self.mark_transform_feedback_changed();

        Ok(())
    }

    /// Stops capturing vertices.
    pub fn end_transform_feedback(&mut self) -> Result<(), ContextError> {
        self.check_lost()?;

        if self.transform_feedback == TransformFeedbackState::Inactive {
            return Ok(());
        }

        if self.transform_feedback_recorded && self.render_pass.is_active() {
            self.render_pass
                .stream_mut()
                .record(Command::EndTransformFeedback);
        }

        self.transform_feedback = TransformFeedbackState::Inactive;
        self.transform_feedback_recorded = false;
        self.state.transform_feedback_buffers.clear();
        self.mark_transform_feedback_changed();

        Ok(())
    }

    #[inline]
    fn is_transform_feedback_active(&self) -> bool {
        self.transform_feedback == TransformFeedbackState::Active
    }

    fn mark_transform_feedback_changed(&mut self) {
        let bits = self.state_change_bits[StateChange::TransformFeedbackBuffers as usize].0
            | (DirtyBits::single(GraphicsDirtyBit::PipelineDesc)
                | DirtyBits::single(GraphicsDirtyBit::DriverUniforms)
                | DirtyBits::single(GraphicsDirtyBit::TransformFeedbackResume))
                & self.graphics_mask;

        self.graphics.mark_all(bits);
    }

    /// Allocates device memory, reclaiming memory held by the context's work if the allocator
    /// is out of memory. Returns the allocation and the attempt it succeeded at.
    pub fn allocate(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<(Allocation, RetryStage), ContextError> {
        self.check_lost()?;

        let allocator = self.device.memory_allocator().clone();

        match memory::allocate_with_retry(self, &*allocator, request) {
            Ok(allocation) => Ok(allocation),
            Err(ContextError::Device(err)) => Err(self.on_device_error(err)),
            Err(err) => Err(err),
        }
    }

    /// Releases `buffer`. It is destroyed once the device has finished with it.
    pub fn release_buffer(&mut self, buffer: Arc<Buffer>) -> Result<(), ContextError> {
        self.check_lost()?;

        self.evict_descriptor_sets(buffer.id());

        let result = self
            .uses_of_released(&Tracked::Buffer(buffer.clone()))
            .and_then(|used| {
                let size = buffer.size();
                self.device.garbage().add(used, size, buffer);

                self.submit_if_needed()
            });

        self.map_device_error(result)
    }

    /// Releases `image`, whose memory is `size` bytes. It is destroyed once the device has
    /// finished with it.
    pub fn release_image(
        &mut self,
        image: Arc<Image>,
        size: DeviceSize,
    ) -> Result<(), ContextError> {
        self.check_lost()?;

        self.evict_descriptor_sets(image.id());

        let result = self
            .uses_of_released(&Tracked::Image(image.clone()))
            .and_then(|used| {
                self.device.garbage().add(used, size, image);

                self.submit_if_needed()
            });

        self.map_device_error(result)
    }

    /// Returns the serials of every use of a released resource, including the uses recorded in
    /// streams that haven't ended yet.
    fn uses_of_released(&mut self, resource: &Tracked) -> Result<QueueSerials, DeviceError> {
        let used_outside = match resource {
            Tracked::Buffer(buffer) => self.outside.buffer_use(buffer).is_some(),
            Tracked::Image(image) => self.outside.image_use(image).is_some(),
        };

        if used_outside {
            self.flush_outside_stream(false)?;
        }

        let (mut used, used_by_render_pass) = match resource {
            Tracked::Buffer(buffer) => (
                buffer.resource_use().used,
                self.render_pass.is_active()
                    && self.render_pass.stream().buffer_use(buffer).is_some(),
            ),
            Tracked::Image(image) => (
                image.resource_use().used,
                self.render_pass.is_active()
                    && self.render_pass.stream().image_use(image).is_some(),
            ),
        };

        if used_by_render_pass {
            if let Some(queue_serial) = self.render_pass.stream().queue_serial() {
                used.set(queue_serial);
            }
        }

        Ok(used)
    }

    fn evict_descriptor_sets(&mut self, resource_id: std::num::NonZero<u64>) {
        let cache = self.device.descriptor_set_cache();

        for descriptor_set in self.descriptor_sets.release_resource(resource_id) {
            cache.evict(descriptor_set);
        }
    }

    /// Starts compiling pipelines ahead of their first use. Draws and dispatches wait for the
    /// warm-up before binding a pipeline.
    pub fn warm_up(
        &mut self,
        graphics: Vec<GraphicsPipelineDesc>,
        compute: Vec<ComputePipelineDesc>,
    ) -> Result<(), ContextError> {
        self.check_lost()?;

        let result = self.join_warmup();
        self.map_device_error(result)?;

        self.warmup = Some(PipelineWarmup::spawn(
            self.device.pipeline_cache().clone(),
            graphics,
            compute,
        ));

        Ok(())
    }

    fn join_warmup(&mut self) -> Result<(), DeviceError> {
        match self.warmup.take() {
            Some(warmup) => warmup.wait(),
            None => Ok(()),
        }
    }

    #[inline]
    fn check_lost(&self) -> Result<(), ContextError> {
        if self.lost {
            Err(ContextError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn map_device_error<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, ContextError> {
        result.map_err(|err| self.on_device_error(err))
    }

    fn on_device_error(&mut self, err: DeviceError) -> ContextError {
        match err {
            DeviceError::OutOfHostMemory => ContextError::Allocation(OomError::OutOfHostMemory),
            DeviceError::OutOfDeviceMemory => {
                ContextError::Allocation(OomError::OutOfDeviceMemory)
            }
            DeviceError::DeviceLost | DeviceError::Unknown => {
                tracing::warn!(%err, "the context is lost");
                self.lost = true;
                self.scheduler.abandon();

                ContextError::Device(err)
            }
        }
    }

    /// Returns how the two streams use `resource`, and decides what `request` requires.
    fn decide(&self, resource: &Tracked, request: &AccessRequest) -> HazardDecision {
        let render_pass = self
            .render_pass
            .is_active()
            .then(|| self.render_pass.stream());
        let (render_pass_use, outside_use): (Option<StreamUse>, Option<StreamUse>) =
            match resource {
                Tracked::Buffer(buffer) => (
                    render_pass.and_then(|stream| stream.buffer_use(buffer)),
                    self.outside.buffer_use(buffer),
                ),
                Tracked::Image(image) => (
                    render_pass.and_then(|stream| stream.image_use(image)),
                    self.outside.image_use(image),
                ),
            };

        hazard::resolve(
            request,
            render_pass_use.as_ref(),
            outside_use.as_ref(),
            self.pending_memory_barrier,
        )
    }

    /// Flushes and closes streams until every access of `accesses` can be recorded.
    fn resolve_hazards(
        &mut self,
        accesses: &[(Tracked, AccessRequest)],
    ) -> Result<(), DeviceError> {
        loop {
            let decision = accesses
                .iter()
                .map(|(resource, request)| self.decide(resource, request))
                .find(|decision| *decision != HazardDecision::Proceed)
                .unwrap_or(HazardDecision::Proceed);

            match decision {
                HazardDecision::Proceed => return Ok(()),
                HazardDecision::FlushOutside => self.flush_outside_stream(false)?,
                HazardDecision::CloseRenderPass(reason) => self.end_render_pass(reason)?,
            }
        }
    }

    /// Begins a render pass into the current framebuffer, with the attachments in the layouts
    /// required by the bound textures.
    fn begin_render_pass(&mut self) -> Result<(), DeviceError> {
        let framebuffer = self
            .state
            .framebuffer
            .clone()
            .expect("a render pass can only be begun with a framebuffer bound");
        let render_area = self
            .state
            .render_area
            .unwrap_or_else(|| RenderArea::full(framebuffer.extent));

        // Outside-render-pass streams flushed while the render pass is active must execute
        // before it.
        self.reserved_serials = self
            .serials
            .reserve(self.limits.max_reserved_outside_render_pass_serials);
        let queue_serial = self.serials.generate();
        self.render_pass
            .begin(&framebuffer, render_area, queue_serial);

        if let Some(barrier) = self.stashed_render_pass_barrier.take() {
            self.render_pass.stream_mut().add_memory_barrier(barrier);
        }

        for attachment in &framebuffer.color_attachments {
            let layout = self.planned_attachment_layout(attachment);
            self.render_pass.stream_mut().use_image(
                attachment,
                AccessType::ColorAttachmentWrite,
                layout,
            );
        }

        if let Some(attachment) = &framebuffer.depth_stencil_attachment {
            let layout = self.planned_attachment_layout(attachment);

            if layout == ImageLayout::DepthStencilReadOnlyOptimal {
                self.render_pass.stream_mut().use_image(
                    attachment,
                    AccessType::DepthStencilAttachmentReadOnly,
                    layout,
                );

                if let Some(session) = self.render_pass.session_mut() {
                    session.enter_depth_stencil_read_only();
                }
            } else {
                self.render_pass.stream_mut().use_image(
                    attachment,
                    AccessType::DepthStencilAttachmentWrite,
                    layout,
                );
            }
        }

        for query in &mut self.active_queries {
            self.render_pass.stream_mut().record(Command::BeginQuery {
                kind: query.kind,
                index: query.index,
            });
            query.recorded = true;
        }

        self.stats.render_passes_begun += 1;
        self.graphics.on_command_stream_restart();

        Ok(())
    }

    /// Closes the render pass, keeping it for reactivation if `reason` and the session allow.
    fn close_render_pass(&mut self, reason: ClosureReason) -> Result<(), DeviceError> {
        if !self.render_pass.is_active() {
            return Ok(());
        }

        // Keeps waiting for reactivation. The next draw ends it if it targets another framebuffer.
        if !self.render_pass.is_open() && reason.allows_reactivation() {
            return Ok(());
        }

        let reactivatable = self.render_pass.is_open()
            && reason.allows_reactivation()
            && self
                .render_pass
                .session()
                .is_some_and(|session| session.allows_reactivation());

        if !reactivatable {
            return self.end_render_pass(reason);
        }

        self.count_closure(reason);
        self.render_pass.close(reason);
        self.graphics.mark(GraphicsDirtyBit::RenderPass);

        Ok(())
    }

    /// Ends the render pass for good and queues its stream for submission, after the
    /// outside-render-pass stream.
    pub(crate) fn end_render_pass(&mut self, reason: ClosureReason) -> Result<(), DeviceError> {
        if !self.render_pass.is_active() {
            return Ok(());
        }

        if self.render_pass.is_open() {
            self.count_closure(reason);
        }

        self.flush_outside_stream(true)?;

        for query in &mut self.active_queries {
            if query.recorded {
                self.render_pass.stream_mut().record(Command::EndQuery {
                    kind: query.kind,
                    index: query.index,
                });
                query.recorded = false;
            }
        }

        if self.transform_feedback_recorded {
            self.render_pass
                .stream_mut()
                .record(Command::EndTransformFeedback);
            self.transform_feedback_recorded = false;
        }

        if let Some(recorded) = self.render_pass.end(reason) {
            self.scheduler.enqueue(recorded);
        }

        self.reserved_serials = ReservedSerials::empty(self.serials.index());
        self.graphics.mark(GraphicsDirtyBit::RenderPass);

        self.submit_if_needed()
    }

    fn count_closure(&mut self, reason: ClosureReason) {
        *self.stats.closures.entry(reason).or_default() += 1;
    }

    /// Ends the outside-render-pass stream and queues it for submission.
    ///
    /// While a render pass is active, the stream takes a serial reserved before the render pass
    /// began. The last reserved serial is kept for the flush that ends the render pass, so a
    /// flush that finds only one left ends the render pass instead.
    fn flush_outside_stream(&mut self, closing_render_pass: bool) -> Result<(), DeviceError> {
        if self.outside.is_empty() {
            return Ok(());
        }

        let queue_serial = if self.render_pass.is_active() {
            if !closing_render_pass && self.reserved_serials.remaining() <= 1 {
                return self
                    .end_render_pass(ClosureReason::OutOfReservedQueueSerialForOutsideCommands);
            }

            self.reserved_serials
                .generate()
                .expect("the last reserved serial is kept for closing the render pass")
        } else {
            self.serials.generate()
        };

        self.outside.set_queue_serial(queue_serial);
        let recorded = self.outside.end();

        tracing::trace!(
            serial = queue_serial.serial.get(),
            commands = recorded.commands().len(),
            "outside-render-pass stream flushed",
        );

        self.scheduler.enqueue(recorded);
        self.stats.outside_flushes += 1;
        self.compute.on_command_stream_restart();

        Ok(())
    }

    /// Submits pending work if a deferred flush or an automatic trigger requires it. Does
    /// nothing while a render pass is active.
    fn submit_if_needed(&mut self) -> Result<(), DeviceError> {
        if self.render_pass.is_active() {
            return Ok(());
        }

        if self.outside.command_count() >= self.limits.max_commands_before_submit {
            self.flush_outside_stream(false)?;
        }

        let reason = if self.deferred_flush {
            Some(SubmitReason::Flush)
        } else {
            self.scheduler.submit_trigger()
        };

        if let Some(reason) = reason {
            self.submit(reason, None)?;
        }

        Ok(())
    }

    fn submit(
        &mut self,
        reason: SubmitReason,
        signal: Option<Semaphore>,
    ) -> Result<Option<QueueSerial>, DeviceError> {
        debug_assert!(!self.render_pass.is_active());

        self.flush_outside_stream(false)?;
        self.deferred_flush = false;

        self.scheduler.submit(reason, signal, &self.serials)
    }

    /// Returns the descriptor sets of the bound resources: uniform buffers in set 0, textures in
    /// set 1, and storage buffers, atomic counter buffers, `extra_storage_buffers` and storage
    /// images in set 2.
    fn resource_descriptor_sets(
        &self,
        texture_layout: impl Fn(&Image) -> ImageLayout,
        extra_storage_buffers: &[BufferBinding],
    ) -> [DescriptorSetDesc; 3] {
        let state = &self.state;

        let mut uniforms = DescriptorSetDesc::new(0);
        for (binding, buffer) in (0..).zip(&state.uniform_buffers) {
            uniforms.push(buffer_descriptor(
                binding,
                DescriptorType::UniformBuffer,
                buffer,
            ));
        }

        let mut textures = DescriptorSetDesc::new(1);
        for (binding, texture) in (0..).zip(&state.textures) {
            textures.push(DescriptorBinding {
                binding,
                descriptor_type: DescriptorType::CombinedImageSampler,
                resource: DescriptorResource::Image {
                    image: texture.id(),
                    layout: texture_layout(texture),
                },
            });
        }

        let mut storage = DescriptorSetDesc::new(2);
        let storage_buffers = state
            .storage_buffers
            .iter()
            .chain(&state.atomic_counter_buffers)
            .chain(extra_storage_buffers);
        let mut binding = 0;

        for buffer in storage_buffers {
            storage.push(buffer_descriptor(
                binding,
                DescriptorType::StorageBuffer,
                buffer,
            ));
            binding += 1;
        }

        for image in &state.storage_images {
            storage.push(DescriptorBinding {
                binding,
                descriptor_type: DescriptorType::StorageImage,
                resource: DescriptorResource::Image {
                    image: image.id(),
                    layout: ImageLayout::General,
                },
            });
            binding += 1;
        }

        [uniforms, textures, storage]
    }

    /// Looks `descs` up in the descriptor set cache and binds the sets, into the render pass
    /// stream for graphics or the outside-render-pass stream for compute.
    fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        descs: [DescriptorSetDesc; 3],
    ) -> Result<(), DeviceError> {
        let cache = self.device.descriptor_set_cache().clone();
        let mut descriptor_sets = SmallVec::new();

        for desc in &descs {
            let lookup = cache.get_or_allocate(desc)?;
            self.descriptor_sets.on_lookup(desc, lookup);
            descriptor_sets.push(lookup.descriptor_set);
        }

        let stream = match bind_point {
            PipelineBindPoint::Graphics => self.render_pass.stream_mut(),
            PipelineBindPoint::Compute => &mut self.outside,
        };
        stream.record(Command::BindDescriptorSets {
            bind_point,
            first_set: 0,
            descriptor_sets,
        });

        Ok(())
    }

    fn image_layout_in_render_pass(&self, image: &Image) -> Option<ImageLayout> {
        if !self.render_pass.is_active() {
            return None;
        }

        self.render_pass
            .stream()
            .image_use(image)
            .map(|stream_use| stream_use.layout)
    }

    /// Returns the layout an attachment of the current framebuffer is begun in, given how the
    /// bound textures sample it.
    fn planned_attachment_layout(&self, attachment: &Image) -> ImageLayout {
        let Some(framebuffer) = &self.state.framebuffer else {
            return ImageLayout::General;
        };

        if let Some(index) = framebuffer.color_attachment_index(attachment) {
            if self.feedback.color_mask & (1 << index) != 0 {
                ImageLayout::General
            } else {
                ImageLayout::ColorAttachmentOptimal
            }
        } else {
            match self.feedback.depth_stencil {
                DepthStencilFeedback::None => ImageLayout::DepthStencilAttachmentOptimal,
                DepthStencilFeedback::ReadOnly => ImageLayout::DepthStencilReadOnlyOptimal,
                DepthStencilFeedback::General => ImageLayout::General,
            }
        }
    }

    /// Returns the layout an attachment is in, or will be in once the render pass begins.
    fn attachment_layout(&self, attachment: &Image) -> ImageLayout {
        self.image_layout_in_render_pass(attachment)
            .unwrap_or_else(|| self.planned_attachment_layout(attachment))
    }
}

impl Reclaim for Context {
    fn collect_garbage(&mut self) -> Result<(), DeviceError> {
        let destroyed = self.scheduler.cleanup();
        tracing::debug!(destroyed, "collected garbage");

        Ok(())
    }

    fn finish_for_retry(&mut self) -> Result<(), DeviceError> {
        self.end_render_pass(ClosureReason::OutOfMemoryRetry)?;
        self.finish_submitted()?;
        self.scheduler.cleanup();

        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.lost {
            let result = self
                .end_render_pass(ClosureReason::ContextDestruction)
                .and_then(|()| self.finish_submitted());

            if let Err(err) = result {
                tracing::warn!(%err, "failed to finish the work of a destroyed context");
            }
        }

        if let Err(err) = self.join_warmup() {
            tracing::warn!(%err, "pipeline warm-up failed");
        }

        self.device.release_serial_index(self.serials.index());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("index", &self.serials.index())
            .field("features", &self.features)
            .field("render_pass", &self.render_pass.state())
            .field("scheduler", &self.scheduler)
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

/// Returns the barrier that makes earlier shader writes visible to the scope of `bits`.
fn memory_barrier_for(bits: MemoryBarrierBits) -> Option<MemoryBarrier> {
    if bits.is_empty() {
        return None;
    }

    let (dst_stages, dst_access) = bits.destination_scope();
    let graphics = AccessType::GraphicsShaderStorageWrite;
    let compute = AccessType::ComputeShaderStorageWrite;

    Some(MemoryBarrier {
        src_stages: graphics.stage_mask() | compute.stage_mask(),
        src_access: graphics.access_mask() | compute.access_mask(),
        dst_stages,
        dst_access,
    })
}

fn merge_barriers(a: MemoryBarrier, b: MemoryBarrier) -> MemoryBarrier {
    MemoryBarrier {
        src_stages: a.src_stages | b.src_stages,
        src_access: a.src_access | b.src_access,
        dst_stages: a.dst_stages | b.dst_stages,
        dst_access: a.dst_access | b.dst_access,
    }
}

fn buffer_descriptor(
    binding: u32,
    descriptor_type: DescriptorType,
    buffer: &BufferBinding,
) -> DescriptorBinding {
    DescriptorBinding {
        binding,
        descriptor_type,
        resource: DescriptorResource::Buffer {
            buffer: buffer.buffer.id(),
            offset: buffer.offset,
            range: buffer.range,
        },
    }
}

/// Returns the dirty bits a state change marks, given the features of the context.
fn state_change_bits(features: &Features, change: StateChange) -> StateChangeBits {
    use self::{ComputeDirtyBit as C, GraphicsDirtyBit as G};

    let dynamic = |dynamic_bit: G| {
        if features.dynamic_state {
            dynamic_bit
        } else {
            G::PipelineDesc
        }
    };

    let graphics: &[G] = &match change {
        StateChange::Program => [
            G::PipelineDesc,
            G::Textures,
            G::UniformBuffers,
            G::ShaderResources,
            G::DescriptorSets,
        ]
        .to_vec(),
        StateChange::Topology => [G::PipelineDesc].to_vec(),
        StateChange::VertexBuffers => [G::PipelineDesc, G::VertexBuffers].to_vec(),
        StateChange::IndexBuffer => [G::IndexBuffer].to_vec(),
        StateChange::Textures => [G::Textures].to_vec(),
        StateChange::UniformBuffers => [G::UniformBuffers].to_vec(),
        StateChange::ShaderStorage => [G::ShaderResources, G::DriverUniforms].to_vec(),
        StateChange::TransformFeedbackBuffers => [G::TransformFeedbackBuffers].to_vec(),
        StateChange::Framebuffer => [
            G::PipelineDesc,
            G::RenderPass,
            G::Textures,
            G::DriverUniforms,
            G::DynamicViewport,
            G::DynamicScissor,
        ]
        .to_vec(),
        StateChange::Viewport => [G::DriverUniforms, G::DynamicViewport].to_vec(),
        StateChange::Scissor => [G::DynamicScissor].to_vec(),
        StateChange::LineWidth => [G::DynamicLineWidth].to_vec(),
        StateChange::DepthBias => [G::DynamicDepthBias].to_vec(),
        StateChange::BlendConstants => [G::DynamicBlendConstants].to_vec(),
        StateChange::Blend => [G::PipelineDesc, G::DriverUniforms].to_vec(),
        StateChange::CullMode => [dynamic(G::DynamicCullMode)].to_vec(),
        StateChange::FrontFace => [dynamic(G::DynamicFrontFace)].to_vec(),
        StateChange::DepthTestEnable => [dynamic(G::DynamicDepthTestEnable)].to_vec(),
        StateChange::DepthWriteEnable => [dynamic(G::DynamicDepthWriteEnable)].to_vec(),
        StateChange::DepthCompareOp => [dynamic(G::DynamicDepthCompareOp)].to_vec(),
        StateChange::StencilTestEnable => [dynamic(G::DynamicStencilTestEnable)].to_vec(),
        StateChange::StencilFunc => [
            G::DynamicStencilCompareMask,
            G::DynamicStencilReference,
            dynamic(G::DynamicStencilOp),
        ]
        .to_vec(),
        StateChange::StencilOp => [dynamic(G::DynamicStencilOp)].to_vec(),
        StateChange::StencilWriteMask => [G::DynamicStencilWriteMask].to_vec(),
        StateChange::RasterizerDiscard => {
            if features.dynamic_rasterizer_discard {
                [G::DynamicRasterizerDiscardEnable].to_vec()
            } else {
                [G::DynamicScissor].to_vec()
            }
        }
        StateChange::PrimitiveRestart => [dynamic(G::DynamicPrimitiveRestartEnable)].to_vec(),
        StateChange::Dither => [G::DriverUniforms].to_vec(),
        StateChange::ClipDistances => [G::DriverUniforms].to_vec(),
        StateChange::ClipControl => [G::DriverUniforms, G::DynamicViewport].to_vec(),
        StateChange::SurfaceRotation => {
            [G::DriverUniforms, G::DynamicViewport, G::DynamicScissor].to_vec()
        }
    };

    let compute: &[C] = match change {
        StateChange::Program => &[
            C::PipelineDesc,
            C::Textures,
            C::UniformBuffers,
            C::ShaderResources,
            C::DescriptorSets,
        ],
        StateChange::Textures => &[C::Textures],
        StateChange::UniformBuffers => &[C::UniformBuffers],
        StateChange::ShaderStorage => &[C::ShaderResources, C::DriverUniforms],
        _ => &[],
    };

    (
        graphics.iter().copied().collect(),
        compute.iter().copied().collect(),
    )
}
