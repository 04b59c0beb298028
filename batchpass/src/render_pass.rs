// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The lifecycle of the render pass command stream.
//!
//! At most one render pass session exists per context. It goes through the following states:
//!
//! - `Closed`: there is no session. Starting one requires a framebuffer and a render area.
//! - `Open`: the session accepts draws and the dynamic state they depend on.
//! - `ReactivatableClosed`: the session was closed for a reason that doesn't require its
//!   commands to be submitted, such as a framebuffer binding change. Its stream is kept as is. If
//!   the next draw targets the exact same attachments and render area, the session is reopened
//!   without recording a new beginning. Any other use of the render pass ends it for good.
//!
//! Ending a session folds the accesses of its stream into the resources and returns the recorded
//! stream, which the context hands to the [submission scheduler](crate::submit).

use crate::{
    command_stream::{Command, CommandStream, RecordedStream, StreamKind},
    resource::Image,
    serial::QueueSerial,
};
use smallvec::SmallVec;
use std::{fmt, num::NonZero, sync::Arc};

/// Identifies a framebuffer object of the frontend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u64);

/// The area of the attachments that a render pass may touch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderArea {
    pub offset: [i32; 2],
    pub extent: [u32; 2],
}

impl RenderArea {
    /// Returns the render area covering a whole framebuffer of size `extent`.
    #[inline]
    pub const fn full(extent: [u32; 2]) -> Self {
        RenderArea {
            offset: [0, 0],
            extent,
        }
    }
}

/// The attachments a frontend framebuffer renders into.
#[derive(Clone, Debug)]
pub struct Framebuffer {
    pub id: FramebufferId,
    pub color_attachments: SmallVec<[Arc<Image>; 4]>,
    pub depth_stencil_attachment: Option<Arc<Image>>,
    pub extent: [u32; 2],
    pub samples: u32,
    /// Whether this is the window-system framebuffer, which is rendered upside down.
    pub is_default: bool,
}

impl Framebuffer {
    /// Returns the description a render pass into this framebuffer is matched against.
    pub fn desc(&self) -> RenderPassDesc {
        RenderPassDesc {
            framebuffer: self.id,
            color_attachments: self.color_attachments.iter().map(|a| a.id()).collect(),
            depth_stencil_attachment: self.depth_stencil_attachment.as_ref().map(|a| a.id()),
            samples: self.samples,
        }
    }

    /// Returns the index of `image` among the color attachments.
    pub fn color_attachment_index(&self, image: &Image) -> Option<usize> {
        self.color_attachments
            .iter()
            .position(|attachment| attachment.id() == image.id())
    }

    /// Returns whether `image` is the depth/stencil attachment.
    pub fn is_depth_stencil_attachment(&self, image: &Image) -> bool {
        self.depth_stencil_attachment
            .as_ref()
            .is_some_and(|attachment| attachment.id() == image.id())
    }
}

/// Identifies the attachments of a render pass. Two render passes are compatible for reactivation
/// only if their descriptions are identical.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub framebuffer: FramebufferId,
    pub color_attachments: SmallVec<[NonZero<u64>; 4]>,
    pub depth_stencil_attachment: Option<NonZero<u64>>,
    pub samples: u32,
}

/// How a render pass has accessed one of its attachments so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttachmentAccess {
    #[default]
    Unused,
    ReadOnly,
    Write,
}

impl AttachmentAccess {
    /// Accumulates a new access.
    #[inline]
    pub fn accumulate(&mut self, access: AttachmentAccess) {
        *self = (*self).max(access);
    }
}

/// Why a render pass was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClosureReason {
    FramebufferChange,
    BufferUseThenOutOfRenderPassRead,
    BufferUseThenOutOfRenderPassWrite,
    ImageUseThenOutOfRenderPassRead,
    ImageUseThenOutOfRenderPassWrite,
    BufferWriteThenUseInRenderPass,
    ImageWriteThenUseInRenderPass,
    ImageLayoutChangeInRenderPass,
    TransformFeedbackWriteThenIndirectBuffer,
    MemoryBarrierThenStorageResource,
    DepthStencilWriteAfterFeedbackLoop,
    DepthStencilFeedbackLoopAfterWrite,
    TimestampQuery,
    TransformFeedbackPause,
    OutOfReservedQueueSerialForOutsideCommands,
    ExplicitFlush,
    Finish,
    HostBufferRead,
    ExternalRelease,
    SemaphoreWait,
    OutOfMemoryRetry,
    ContextChange,
    ContextDestruction,
}

impl ClosureReason {
    /// Returns whether a render pass closed for this reason may be reactivated.
    #[inline]
    pub const fn allows_reactivation(self) -> bool {
        matches!(self, ClosureReason::FramebufferChange)
    }

    /// Returns a description of the reason.
    pub const fn description(self) -> &'static str {
        match self {
            ClosureReason::FramebufferChange => "framebuffer binding changed",
            ClosureReason::BufferUseThenOutOfRenderPassRead => {
                "buffer used then read outside render pass"
            }
            ClosureReason::BufferUseThenOutOfRenderPassWrite => {
                "buffer used then written outside render pass"
            }
            ClosureReason::ImageUseThenOutOfRenderPassRead => {
                "image used then read outside render pass"
            }
            ClosureReason::ImageUseThenOutOfRenderPassWrite => {
                "image used then written outside render pass"
            }
            ClosureReason::BufferWriteThenUseInRenderPass => {
                "buffer written then used differently in the same render pass"
            }
            ClosureReason::ImageWriteThenUseInRenderPass => {
                "image written then used differently in the same render pass"
            }
            ClosureReason::ImageLayoutChangeInRenderPass => {
                "image used in a different layout in the same render pass"
            }
            ClosureReason::TransformFeedbackWriteThenIndirectBuffer => {
                "transform feedback output then used as an indirect buffer"
            }
            ClosureReason::MemoryBarrierThenStorageResource => {
                "memory barrier then storage resource use"
            }
            ClosureReason::DepthStencilWriteAfterFeedbackLoop => {
                "depth/stencil write after read-only feedback loop"
            }
            ClosureReason::DepthStencilFeedbackLoopAfterWrite => {
                "depth/stencil attachment written then sampled"
            }
            ClosureReason::TimestampQuery => "timestamp query",
            ClosureReason::TransformFeedbackPause => "transform feedback paused",
            ClosureReason::OutOfReservedQueueSerialForOutsideCommands => {
                "out of reserved queue serials for outside render pass commands"
            }
            ClosureReason::ExplicitFlush => "explicit flush",
            ClosureReason::Finish => "finish",
            ClosureReason::HostBufferRead => "buffer mapped for reading",
            ClosureReason::ExternalRelease => "resource released to external owner",
            ClosureReason::SemaphoreWait => "semaphore wait",
            ClosureReason::OutOfMemoryRetry => "out of memory retry",
            ClosureReason::ContextChange => "context no longer current",
            ClosureReason::ContextDestruction => "context destroyed",
        }
    }
}

impl fmt::Display for ClosureReason {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The state of the render pass of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderPassState {
    Closed,
    Open,
    ReactivatableClosed,
}

/// The current render pass and how its attachments have been used.
#[derive(Debug)]
pub struct RenderPassSession {
    framebuffer: Framebuffer,
    desc: RenderPassDesc,
    render_area: RenderArea,
    color_access: SmallVec<[AttachmentAccess; 4]>,
    depth_access: AttachmentAccess,
    stencil_access: AttachmentAccess,
    depth_stencil_read_only: bool,
    allow_reactivate: bool,
    draw_count: u32,
}

impl RenderPassSession {
    #[inline]
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    #[inline]
    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    #[inline]
    pub fn render_area(&self) -> RenderArea {
        self.render_area
    }

    #[inline]
    pub fn color_access(&self, index: usize) -> AttachmentAccess {
        self.color_access.get(index).copied().unwrap_or_default()
    }

    #[inline]
    pub fn depth_access(&self) -> AttachmentAccess {
        self.depth_access
    }

    #[inline]
    pub fn stencil_access(&self) -> AttachmentAccess {
        self.stencil_access
    }

    /// Returns whether the depth/stencil attachment is in the read-only feedback-loop mode.
    #[inline]
    pub fn is_depth_stencil_read_only(&self) -> bool {
        self.depth_stencil_read_only
    }

    /// Switches the depth/stencil attachment to the read-only feedback-loop mode.
    ///
    /// # Panics
    ///
    /// - Panics if the depth/stencil attachment has been written by the render pass.
    pub fn enter_depth_stencil_read_only(&mut self) {
        assert!(
            self.depth_access != AttachmentAccess::Write
                && self.stencil_access != AttachmentAccess::Write,
            "the depth/stencil attachment was already written in this render pass",
        );

        self.depth_stencil_read_only = true;
    }

    #[inline]
    pub fn allows_reactivation(&self) -> bool {
        self.allow_reactivate
    }

    #[inline]
    pub fn draw_count(&self) -> u32 {
        self.draw_count
    }

    /// Accumulates the attachment accesses of a draw.
    pub fn on_draw(
        &mut self,
        color_write_mask: u32,
        depth: AttachmentAccess,
        stencil: AttachmentAccess,
    ) {
        for (index, access) in self.color_access.iter_mut().enumerate() {
            if color_write_mask & (1 << index) != 0 {
                access.accumulate(AttachmentAccess::Write);
            }
        }

        self.depth_access.accumulate(depth);
        self.stencil_access.accumulate(stencil);
        self.draw_count += 1;
    }
}

/// Owns the render pass command stream and the lifecycle of the render pass.
#[derive(Debug)]
pub struct RenderPassStateMachine {
    state: RenderPassState,
    session: Option<RenderPassSession>,
    stream: CommandStream,
    last_closure: Option<ClosureReason>,
}

impl Default for RenderPassStateMachine {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPassStateMachine {
    pub fn new() -> Self {
        RenderPassStateMachine {
            state: RenderPassState::Closed,
            session: None,
            stream: CommandStream::new(StreamKind::RenderPass),
            last_closure: None,
        }
    }

    #[inline]
    pub fn state(&self) -> RenderPassState {
        self.state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == RenderPassState::Open
    }

    /// Returns whether there is a session whose stream hasn't been ended yet, open or not.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != RenderPassState::Closed
    }

    #[inline]
    pub fn session(&self) -> Option<&RenderPassSession> {
        self.session.as_ref()
    }

    #[inline]
    pub fn session_mut(&mut self) -> Option<&mut RenderPassSession> {
        self.session.as_mut()
    }

    /// Returns the render pass stream. It is empty while the state is `Closed`.
    #[inline]
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut CommandStream {
        &mut self.stream
    }

    /// Returns why the render pass was last closed.
    #[inline]
    pub fn last_closure(&self) -> Option<ClosureReason> {
        self.last_closure
    }

    /// Returns whether the current session, open or reactivatable, targets exactly `desc` and
    /// `render_area`.
    pub fn matches(&self, desc: &RenderPassDesc, render_area: RenderArea) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.desc == *desc && session.render_area == render_area)
    }

    /// Begins a new render pass into `framebuffer`.
    ///
    /// # Panics
    ///
    /// - Panics if a session is open or waiting for reactivation.
    pub fn begin(
        &mut self,
        framebuffer: &Framebuffer,
        render_area: RenderArea,
        queue_serial: QueueSerial,
    ) {
        assert_eq!(
            self.state,
            RenderPassState::Closed,
            "a render pass can't be begun while another one is open",
        );
        debug_assert!(self.stream.is_empty());

        self.stream.set_queue_serial(queue_serial);
        self.stream.record(Command::BeginRenderPass {
            framebuffer: framebuffer.id,
            render_area,
        });

        self.session = Some(RenderPassSession {
            framebuffer: framebuffer.clone(),
            desc: framebuffer.desc(),
            render_area,
            color_access: framebuffer
                .color_attachments
                .iter()
                .map(|_| AttachmentAccess::Unused)
                .collect(),
            depth_access: AttachmentAccess::Unused,
            stencil_access: AttachmentAccess::Unused,
            depth_stencil_read_only: false,
            allow_reactivate: true,
            draw_count: 0,
        });
        self.state = RenderPassState::Open;

        tracing::debug!(
            framebuffer = framebuffer.id.0,
            serial = queue_serial.serial.get(),
            "render pass begun",
        );
    }

    /// Reopens the session waiting for reactivation if it targets exactly `desc` and
    /// `render_area`, and nothing disallowed its reactivation. Returns whether it did.
    pub fn try_reactivate(&mut self, desc: &RenderPassDesc, render_area: RenderArea) -> bool {
        if self.state != RenderPassState::ReactivatableClosed
            || !self.matches(desc, render_area)
            || !self
                .session
                .as_ref()
                .is_some_and(RenderPassSession::allows_reactivation)
        {
            return false;
        }

        self.state = RenderPassState::Open;
        tracing::debug!(framebuffer = desc.framebuffer.0, "render pass reactivated");

        true
    }

    /// Forbids the current session from being reactivated once closed.
    #[inline]
    pub fn disallow_reactivation(&mut self) {
        if let Some(session) = &mut self.session {
            session.allow_reactivate = false;
        }
    }

    /// Closes the render pass.
    ///
    /// If the session is open and `reason` allows it, the session is kept for reactivation and
    /// `None` is returned. Otherwise the session is ended and its stream is returned. Closing a
    /// `Closed` render pass does nothing.
    pub fn close(&mut self, reason: ClosureReason) -> Option<RecordedStream> {
        match self.state {
            RenderPassState::Closed => None,
            RenderPassState::Open => {
                self.last_closure = Some(reason);

                let reactivatable = reason.allows_reactivation()
                    && self
                        .session
                        .as_ref()
                        .is_some_and(RenderPassSession::allows_reactivation);

                tracing::debug!(%reason, reactivatable, "render pass closed");

                if reactivatable {
                    self.state = RenderPassState::ReactivatableClosed;

                    None
                } else {
                    Some(self.finish_session())
                }
            }
            RenderPassState::ReactivatableClosed => {
                tracing::debug!(%reason, "reactivatable render pass ended");

                Some(self.finish_session())
            }
        }
    }

    /// Ends the session for good, even if `reason` would allow reactivation. Returns `None` only
    /// if the render pass is `Closed`.
    pub fn end(&mut self, reason: ClosureReason) -> Option<RecordedStream> {
        match self.close(reason) {
            Some(recorded) => Some(recorded),
            None if self.is_active() => self.close(reason),
            None => None,
        }
    }

    fn finish_session(&mut self) -> RecordedStream {
        self.stream.record(Command::EndRenderPass);
        self.session = None;
        self.state = RenderPassState::Closed;

        self.stream.end()
    }
}
