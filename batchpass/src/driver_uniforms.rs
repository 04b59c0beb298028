// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The constant block that translated shaders read the emulated fixed-function state from.
//!
//! The block is pushed as push constants right before each draw or dispatch whose driver
//! uniforms are dirty. Its layout is shared with the shader translator, so the structs here are
//! `#[repr(C)]` and contain no padding.

use crate::{
    command_stream::{Command, CommandStream},
    pipeline::PipelineBindPoint,
    render_pass::RenderArea,
    DeviceSize,
};
use bytemuck::{Pod, Zeroable};

/// How the presentation surface is rotated relative to the device's natural orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SurfaceRotation {
    #[default]
    Identity,
    Rotated90,
    Rotated180,
    Rotated270,
}

impl SurfaceRotation {
    /// Returns whether the rotation exchanges the X and Y axes.
    #[inline]
    pub const fn swaps_xy(self) -> bool {
        matches!(self, SurfaceRotation::Rotated90 | SurfaceRotation::Rotated270)
    }
}

/// Driver uniforms of draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GraphicsDriverUniforms {
    /// Sub-alignment offsets of atomic counter buffer bindings, in `u32`s, one byte per binding.
    pub acb_buffer_offsets: [u32; 4],
    pub depth_range: [f32; 2],
    /// Factors to multiply clip-space X and Y with.
    pub flip_xy: [f32; 2],
    /// Width in the low 16 bits, height in the high 16 bits.
    pub render_area: u32,
    /// Two bits of dithering control per color attachment.
    pub dither: u32,
    /// See the `MISC_*` constants.
    pub misc: u32,
    pub xfb_vertices_per_instance: i32,
    /// Write offsets of emulated transform feedback, in `u32`s.
    pub xfb_buffer_offsets: [i32; 4],
}

/// Driver uniforms of dispatches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ComputeDriverUniforms {
    pub acb_buffer_offsets: [u32; 4],
}

pub const MISC_SWAP_XY: u32 = 1 << 0;
pub const MISC_ADVANCED_BLEND_EQUATION_SHIFT: u32 = 1;
pub const MISC_ADVANCED_BLEND_EQUATION_MASK: u32 = 0x1F;
pub const MISC_SAMPLE_COUNT_SHIFT: u32 = 6;
pub const MISC_SAMPLE_COUNT_MASK: u32 = 0xFF;
pub const MISC_CLIP_DISTANCES_SHIFT: u32 = 14;
pub const MISC_CLIP_DISTANCES_MASK: u32 = 0xFF;
pub const MISC_TRANSFORM_FEEDBACK_ACTIVE: u32 = 1 << 22;
pub const MISC_DEPTH_ZERO_TO_ONE: u32 = 1 << 23;

const DITHER_ENABLED_PER_ATTACHMENT: u32 = 0b01;

/// The write position of emulated transform feedback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatedTransformFeedback {
    /// Where the next vertex of each buffer is written, in bytes.
    pub buffer_offsets: [DeviceSize; 4],
    pub vertices_per_instance: u32,
}

/// The ambient state that the graphics driver uniforms are derived from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphicsUniformsInfo<'a> {
    pub render_area: RenderArea,
    /// Rendering to the window-system framebuffer, whose origin is at the bottom.
    pub is_default_framebuffer: bool,
    /// The clip control origin is the upper left corner.
    pub clip_origin_upper_left: bool,
    /// The clip control depth mode is zero to one.
    pub clip_depth_zero_to_one: bool,
    pub surface_rotation: SurfaceRotation,
    pub dither_enable: bool,
    pub color_attachment_count: u32,
    pub samples: u32,
    pub clip_distance_mask: u8,
    /// The advanced blend equation in use, or 0.
    pub advanced_blend_equation: u32,
    pub depth_range: [f32; 2],
    pub transform_feedback: Option<EmulatedTransformFeedback>,
    pub atomic_counter_buffer_offsets: &'a [DeviceSize],
}

/// Derives driver uniforms from the ambient state and records them into command streams.
#[derive(Clone, Copy, Debug)]
pub struct DriverUniformsWriter {
    pre_rotation: bool,
    storage_buffer_offset_alignment: DeviceSize,
}

impl DriverUniformsWriter {
    /// Creates a writer.
    ///
    /// When `pre_rotation` is false the surface rotation is ignored and the presentation engine
    /// is expected to rotate. `storage_buffer_offset_alignment` must be a power of two.
    pub fn new(pre_rotation: bool, storage_buffer_offset_alignment: DeviceSize) -> Self {
        assert!(storage_buffer_offset_alignment.is_power_of_two());

        DriverUniformsWriter {
            pre_rotation,
            storage_buffer_offset_alignment,
        }
    }

    /// Computes the uniforms of a draw.
    pub fn graphics(&self, info: &GraphicsUniformsInfo<'_>) -> GraphicsDriverUniforms {
        let rotation = if self.pre_rotation && info.is_default_framebuffer {
            info.surface_rotation
        } else {
            SurfaceRotation::Identity
        };

        let flip_y = if info.is_default_framebuffer && !info.clip_origin_upper_left {
            -1.0
        } else {
            1.0
        };
        let flip_xy = match rotation {
            SurfaceRotation::Identity => [1.0, flip_y],
            SurfaceRotation::Rotated90 => [flip_y, -1.0],
            SurfaceRotation::Rotated180 => [-1.0, -flip_y],
            SurfaceRotation::Rotated270 => [-flip_y, 1.0],
        };

        let [mut width, mut height] = info.render_area.extent;
        if rotation.swaps_xy() {
            std::mem::swap(&mut width, &mut height);
        }
        let render_area = width.min(0xFFFF) | (height.min(0xFFFF) << 16);

        let dither = if info.dither_enable {
            (0..info.color_attachment_count.min(16))
                .fold(0, |dither, index| dither | DITHER_ENABLED_PER_ATTACHMENT << (index * 2))
        } else {
            0
        };

        let mut misc = 0;
        if rotation.swaps_xy() {
            misc |= MISC_SWAP_XY;
        }
        misc |= (info.advanced_blend_equation & MISC_ADVANCED_BLEND_EQUATION_MASK)
            << MISC_ADVANCED_BLEND_EQUATION_SHIFT;
        misc |= (info.samples & MISC_SAMPLE_COUNT_MASK) << MISC_SAMPLE_COUNT_SHIFT;
        misc |= (u32::from(info.clip_distance_mask) & MISC_CLIP_DISTANCES_MASK)
            << MISC_CLIP_DISTANCES_SHIFT;
        if info.clip_depth_zero_to_one {
            misc |= MISC_DEPTH_ZERO_TO_ONE;
        }

        let mut xfb_buffer_offsets = [0; 4];
        let mut xfb_vertices_per_instance = 0;
        if let Some(xfb) = &info.transform_feedback {
            misc |= MISC_TRANSFORM_FEEDBACK_ACTIVE;

            for (offset, &bytes) in xfb_buffer_offsets.iter_mut().zip(&xfb.buffer_offsets) {
                *offset = i32::try_from(bytes / 4).unwrap_or(i32::MAX);
            }

            xfb_vertices_per_instance =
                i32::try_from(xfb.vertices_per_instance).unwrap_or(i32::MAX);
        }

        GraphicsDriverUniforms {
            acb_buffer_offsets: self.acb_buffer_offsets(info.atomic_counter_buffer_offsets),
            depth_range: info.depth_range,
            flip_xy,
            render_area,
            dither,
            misc,
            xfb_vertices_per_instance,
            xfb_buffer_offsets,
        }
    }

    /// Computes the uniforms of a dispatch.
    #[inline]
    pub fn compute(&self, atomic_counter_buffer_offsets: &[DeviceSize]) -> ComputeDriverUniforms {
        ComputeDriverUniforms {
            acb_buffer_offsets: self.acb_buffer_offsets(atomic_counter_buffer_offsets),
        }
    }

    /// Records the uniforms of a draw into `stream`.
    pub fn write_graphics(&self, info: &GraphicsUniformsInfo<'_>, stream: &mut CommandStream) {
        let uniforms = self.graphics(info);

        stream.record(Command::PushConstants {
            bind_point: PipelineBindPoint::Graphics,
            data: bytemuck::bytes_of(&uniforms).into(),
        });
    }

    /// Records the uniforms of a dispatch into `stream`.
    pub fn write_compute(
        &self,
        atomic_counter_buffer_offsets: &[DeviceSize],
        stream: &mut CommandStream,
    ) {
        let uniforms = self.compute(atomic_counter_buffer_offsets);

        stream.record(Command::PushConstants {
            bind_point: PipelineBindPoint::Compute,
            data: bytemuck::bytes_of(&uniforms).into(),
        });
    }

    // Atomic counter buffers are bound at the closest aligned offset, and the shader adds the
    // remainder.
    fn acb_buffer_offsets(&self, offsets: &[DeviceSize]) -> [u32; 4] {
        let mut packed = [0; 4];

        for (binding, &offset) in offsets.iter().enumerate().take(16) {
            let remainder = (offset % self.storage_buffer_offset_alignment) / 4;
            let byte = (remainder as u32 & 0xFF) << ((binding % 4) * 8);
            packed[binding / 4] |= byte;
        }

        packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stream::StreamKind;

    fn info() -> GraphicsUniformsInfo<'static> {
        GraphicsUniformsInfo {
            render_area: RenderArea::full([640, 480]),
            is_default_framebuffer: true,
            samples: 4,
            depth_range: [0.0, 1.0],
            ..Default::default()
        }
    }

    #[test]
    fn default_framebuffer_is_flipped() {
        let writer = DriverUniformsWriter::new(false, 16);

        let uniforms = writer.graphics(&info());
        assert_eq!(uniforms.flip_xy, [1.0, -1.0]);
        assert_eq!(uniforms.render_area, 640 | (480 << 16));
        assert_eq!(
            (uniforms.misc >> MISC_SAMPLE_COUNT_SHIFT) & MISC_SAMPLE_COUNT_MASK,
            4,
        );

        let uniforms = writer.graphics(&GraphicsUniformsInfo {
            is_default_framebuffer: false,
            ..info()
        });
        assert_eq!(uniforms.flip_xy, [1.0, 1.0]);
    }

    #[test]
    fn pre_rotation_swaps_render_area() {
        let info = GraphicsUniformsInfo {
            surface_rotation: SurfaceRotation::Rotated90,
            ..info()
        };

        let uniforms = DriverUniformsWriter::new(true, 16).graphics(&info);
        assert_eq!(uniforms.render_area, 480 | (640 << 16));
        assert_ne!(uniforms.misc & MISC_SWAP_XY, 0);

        let uniforms = DriverUniformsWriter::new(false, 16).graphics(&info);
        assert_eq!(uniforms.render_area, 640 | (480 << 16));
        assert_eq!(uniforms.misc & MISC_SWAP_XY, 0);
    }

    #[test]
    fn dither_and_transform_feedback() {
        let writer = DriverUniformsWriter::new(false, 16);
        let uniforms = writer.graphics(&GraphicsUniformsInfo {
            dither_enable: true,
            color_attachment_count: 2,
            transform_feedback: Some(EmulatedTransformFeedback {
                buffer_offsets: [64, 0, 0, 0],
                vertices_per_instance: 3,
            }),
            ..info()
        });

        assert_eq!(uniforms.dither, 0b0101);
        assert_ne!(uniforms.misc & MISC_TRANSFORM_FEEDBACK_ACTIVE, 0);
        assert_eq!(uniforms.xfb_buffer_offsets, [16, 0, 0, 0]);
        assert_eq!(uniforms.xfb_vertices_per_instance, 3);
    }

    #[test]
    fn atomic_counter_offsets_are_packed() {
        let writer = DriverUniformsWriter::new(false, 256);
        let uniforms = writer.compute(&[256, 260, 0, 0, 8]);

        assert_eq!(uniforms.acb_buffer_offsets, [1 << 8, 2, 0, 0]);
    }

    #[test]
    fn uniforms_are_pushed() {
        let writer = DriverUniformsWriter::new(false, 16);
        let mut stream = CommandStream::new(StreamKind::RenderPass);
        writer.write_graphics(&info(), &mut stream);

        match &stream.commands()[0] {
            Command::PushConstants { bind_point, data } => {
                assert_eq!(*bind_point, PipelineBindPoint::Graphics);
                assert_eq!(data.len(), std::mem::size_of::<GraphicsDriverUniforms>());
            }
            command => panic!("unexpected command {:?}", command),
        }
    }
}
