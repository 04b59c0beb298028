// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The frontend state that draws and dispatches are recorded with.
//!
//! The frontend writes the state through [`Context::state_mut`] and then reports what it changed
//! with [`Context::notify_state_changed`]. Nothing is recorded until the next draw or dispatch.
//!
//! [`Context::state_mut`]: super::Context::state_mut
//! [`Context::notify_state_changed`]: super::Context::notify_state_changed

use crate::{
    driver_uniforms::SurfaceRotation,
    pipeline::{
        CompareOp, CullMode, FrontFace, IndexType, PrimitiveTopology, ProgramId, Scissor,
        StencilOps, Viewport,
    },
    render_pass::{AttachmentAccess, Framebuffer, RenderArea},
    resource::{Buffer, Image},
    DeviceSize,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// A vertex buffer bound to a binding slot.
#[derive(Clone, Debug)]
pub struct VertexBufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: DeviceSize,
    pub stride: u32,
}

#[derive(Clone, Debug)]
pub struct IndexBufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: DeviceSize,
    pub index_type: IndexType,
}

/// A range of a buffer bound to a uniform, storage, atomic counter or transform feedback slot.
#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: DeviceSize,
    pub range: DeviceSize,
}

impl BufferBinding {
    /// Binds the whole buffer.
    #[inline]
    pub fn whole(buffer: Arc<Buffer>) -> Self {
        let range = buffer.size();

        BufferBinding {
            buffer,
            offset: 0,
            range,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

/// The stencil state of one face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilFaceState {
    pub ops: StencilOps,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilFaceState {
    #[inline]
    fn default() -> Self {
        StencilFaceState {
            ops: StencilOps::default(),
            compare_mask: u32::MAX,
            write_mask: u32::MAX,
            reference: 0,
        }
    }
}

/// Everything a draw or a dispatch depends on.
#[derive(Clone, Debug)]
pub struct FrontendState {
    /// The current program. Draws use it as a graphics program, dispatches as a compute program.
    pub program: ProgramId,
    /// Whether the current program reads the framebuffer from its fragment shader.
    pub program_uses_framebuffer_fetch: bool,

    pub topology: PrimitiveTopology,
    pub vertex_buffers: SmallVec<[VertexBufferBinding; 8]>,
    pub index_buffer: Option<IndexBufferBinding>,

    /// The sampled textures, in binding order.
    pub textures: SmallVec<[Arc<Image>; 8]>,
    pub uniform_buffers: SmallVec<[BufferBinding; 8]>,
    pub storage_buffers: SmallVec<[BufferBinding; 4]>,
    pub storage_images: SmallVec<[Arc<Image>; 4]>,
    pub atomic_counter_buffers: SmallVec<[BufferBinding; 4]>,
    pub transform_feedback_buffers: SmallVec<[BufferBinding; 4]>,
    /// Bytes the program captures per vertex into each transform feedback buffer.
    pub transform_feedback_strides: [u32; 4],

    pub framebuffer: Option<Framebuffer>,
    /// The part of the framebuffer draws may touch. `None` means the whole framebuffer.
    pub render_area: Option<RenderArea>,

    pub viewport: Viewport,
    /// The scissor rectangle, or `None` if the scissor test is disabled.
    pub scissor: Option<Scissor>,
    pub line_width: f32,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],

    pub blend_enable: bool,
    /// The advanced blend equation in use, or 0.
    pub advanced_blend_equation: u32,
    /// One bit per color attachment.
    pub color_write_mask: u32,

    pub cull_mode: CullMode,
    pub front_face: FrontFace,

    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,

    pub stencil_test_enable: bool,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,

    pub rasterizer_discard_enable: bool,
    pub primitive_restart_enable: bool,
    pub dither_enable: bool,

    /// One bit per enabled clip distance.
    pub clip_distance_mask: u8,
    pub clip_origin_upper_left: bool,
    pub clip_depth_zero_to_one: bool,
    pub surface_rotation: SurfaceRotation,
}

impl Default for FrontendState {
    fn default() -> Self {
        FrontendState {
            program: ProgramId::default(),
            program_uses_framebuffer_fetch: false,
            topology: PrimitiveTopology::default(),
            vertex_buffers: SmallVec::new(),
            index_buffer: None,
            textures: SmallVec::new(),
            uniform_buffers: SmallVec::new(),
            storage_buffers: SmallVec::new(),
            storage_images: SmallVec::new(),
            atomic_counter_buffers: SmallVec::new(),
            transform_feedback_buffers: SmallVec::new(),
            transform_feedback_strides: [0; 4],
            framebuffer: None,
            render_area: None,
            viewport: Viewport {
                depth_range: [0.0, 1.0],
                ..Viewport::default()
            },
            scissor: None,
            line_width: 1.0,
            depth_bias: DepthBias::default(),
            blend_constants: [0.0; 4],
            blend_enable: false,
            advanced_blend_equation: 0,
            color_write_mask: u32::MAX,
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
            depth_test_enable: false,
            depth_write_enable: true,
            depth_compare_op: CompareOp::Less,
            stencil_test_enable: false,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
            rasterizer_discard_enable: false,
            primitive_restart_enable: false,
            dither_enable: true,
            clip_distance_mask: 0,
            clip_origin_upper_left: false,
            clip_depth_zero_to_one: false,
            surface_rotation: SurfaceRotation::Identity,
        }
    }
}

impl FrontendState {
    /// Returns the render area of the current framebuffer.
    pub fn effective_render_area(&self) -> Option<RenderArea> {
        let framebuffer = self.framebuffer.as_ref()?;

        Some(
            self.render_area
                .unwrap_or_else(|| RenderArea::full(framebuffer.extent)),
        )
    }

    /// Returns how a draw accesses the depth aspect of the depth/stencil attachment.
    pub fn depth_access(&self) -> AttachmentAccess {
        match (self.depth_test_enable, self.depth_write_enable) {
            (false, _) => AttachmentAccess::Unused,
            (true, false) => AttachmentAccess::ReadOnly,
            (true, true) => AttachmentAccess::Write,
        }
    }

    /// Returns how a draw accesses the stencil aspect of the depth/stencil attachment.
    pub fn stencil_access(&self) -> AttachmentAccess {
        if !self.stencil_test_enable {
            AttachmentAccess::Unused
        } else if self.stencil_front.write_mask | self.stencil_back.write_mask != 0 {
            AttachmentAccess::Write
        } else {
            AttachmentAccess::ReadOnly
        }
    }

    /// Returns whether a draw may write to the depth/stencil attachment.
    #[inline]
    pub fn depth_stencil_writes_enabled(&self) -> bool {
        self.depth_access() == AttachmentAccess::Write
            || self.stencil_access() == AttachmentAccess::Write
    }

    /// Returns whether `image` is one of the sampled textures.
    #[inline]
    pub(crate) fn samples_image(&self, image: &Image) -> bool {
        self.textures.iter().any(|texture| texture.id() == image.id())
    }
}

/// A category of frontend state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum StateChange {
    Program,
    Topology,
    VertexBuffers,
    IndexBuffer,
    Textures,
    UniformBuffers,
    /// Storage buffers, storage images or atomic counter buffers.
    ShaderStorage,
    TransformFeedbackBuffers,
    Framebuffer,
    Viewport,
    Scissor,
    LineWidth,
    DepthBias,
    BlendConstants,
    /// Blend enable, advanced blend equation or color write mask.
    Blend,
    CullMode,
    FrontFace,
    DepthTestEnable,
    DepthWriteEnable,
    DepthCompareOp,
    StencilTestEnable,
    /// Stencil compare operation, compare mask or reference.
    StencilFunc,
    StencilOp,
    StencilWriteMask,
    RasterizerDiscard,
    PrimitiveRestart,
    Dither,
    ClipDistances,
    ClipControl,
    SurfaceRotation,
}

impl StateChange {
    pub(crate) const COUNT: usize = 30;

    pub(crate) const ALL: [StateChange; Self::COUNT] = [
        StateChange::Program,
        StateChange::Topology,
        StateChange::VertexBuffers,
        StateChange::IndexBuffer,
        StateChange::Textures,
        StateChange::UniformBuffers,
        StateChange::ShaderStorage,
        StateChange::TransformFeedbackBuffers,
        StateChange::Framebuffer,
        StateChange::Viewport,
        StateChange::Scissor,
        StateChange::LineWidth,
        StateChange::DepthBias,
        StateChange::BlendConstants,
        StateChange::Blend,
        StateChange::CullMode,
        StateChange::FrontFace,
        StateChange::DepthTestEnable,
        StateChange::DepthWriteEnable,
        StateChange::DepthCompareOp,
        StateChange::StencilTestEnable,
        StateChange::StencilFunc,
        StateChange::StencilOp,
        StateChange::StencilWriteMask,
        StateChange::RasterizerDiscard,
        StateChange::PrimitiveRestart,
        StateChange::Dither,
        StateChange::ClipDistances,
        StateChange::ClipControl,
        StateChange::SurfaceRotation,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_lists_every_change_in_order() {
        for (index, change) in StateChange::ALL.iter().enumerate() {
            assert_eq!(*change as usize, index);
        }
    }

    #[test]
    fn depth_stencil_writes() {
        let mut state = FrontendState::default();
        assert!(!state.depth_stencil_writes_enabled());

        state.depth_test_enable = true;
        assert!(state.depth_stencil_writes_enabled());

        state.depth_write_enable = false;
        assert_eq!(state.depth_access(), AttachmentAccess::ReadOnly);
        assert!(!state.depth_stencil_writes_enabled());

        state.stencil_test_enable = true;
        assert!(state.depth_stencil_writes_enabled());

        state.stencil_front.write_mask = 0;
        state.stencil_back.write_mask = 0;
        assert!(!state.depth_stencil_writes_enabled());
    }
}
