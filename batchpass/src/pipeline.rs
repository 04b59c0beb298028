// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pipeline state descriptions and the pipeline cache collaborator.
//!
//! Pipelines are immutable on the device side, so every combination of state that is baked into
//! a pipeline is described by a [`GraphicsPipelineDesc`] or [`ComputePipelineDesc`], which the
//! [`PipelineCache`] turns into a pipeline handle. The cache is external and internally
//! synchronized. It may be populated ahead of time on a worker thread with a [`PipelineWarmup`].
//!
//! Which fields of a description are meaningful depends on the enabled features: when dynamic
//! state is used, the corresponding fields are left at their default values so that they don't
//! cause extra pipelines to be created.

use crate::{macros::vulkan_enum, DeviceError};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

vulkan_enum! {
    /// The point of the pipeline that a pipeline or descriptor set is bound to.
    PipelineBindPoint = PipelineBindPoint(i32);

    Graphics = GRAPHICS,
    Compute = COMPUTE,
}

vulkan_enum! {
    /// How vertices are assembled into primitives.
    PrimitiveTopology = PrimitiveTopology(i32);

    PointList = POINT_LIST,
    LineList = LINE_LIST,
    LineStrip = LINE_STRIP,
    TriangleList = TRIANGLE_LIST,
    TriangleStrip = TRIANGLE_STRIP,
    TriangleFan = TRIANGLE_FAN,
}

impl Default for PrimitiveTopology {
    #[inline]
    fn default() -> Self {
        PrimitiveTopology::TriangleList
    }
}

vulkan_enum! {
    /// Which faces are discarded by face culling.
    CullMode = CullModeFlags(u32);

    None = NONE,
    Front = FRONT,
    Back = BACK,
    FrontAndBack = FRONT_AND_BACK,
}

impl Default for CullMode {
    #[inline]
    fn default() -> Self {
        CullMode::None
    }
}

vulkan_enum! {
    /// The winding order that is considered front-facing.
    FrontFace = FrontFace(i32);

    CounterClockwise = COUNTER_CLOCKWISE,
    Clockwise = CLOCKWISE,
}

impl Default for FrontFace {
    #[inline]
    fn default() -> Self {
        FrontFace::CounterClockwise
    }
}

vulkan_enum! {
    /// The comparison used by depth and stencil tests.
    CompareOp = CompareOp(i32);

    Never = NEVER,
    Less = LESS,
    Equal = EQUAL,
    LessOrEqual = LESS_OR_EQUAL,
    Greater = GREATER,
    NotEqual = NOT_EQUAL,
    GreaterOrEqual = GREATER_OR_EQUAL,
    Always = ALWAYS,
}

impl Default for CompareOp {
    #[inline]
    fn default() -> Self {
        CompareOp::Less
    }
}

vulkan_enum! {
    /// What happens to a stencil value after a test.
    StencilOp = StencilOp(i32);

    Keep = KEEP,
    Zero = ZERO,
    Replace = REPLACE,
    IncrementAndClamp = INCREMENT_AND_CLAMP,
    DecrementAndClamp = DECREMENT_AND_CLAMP,
    Invert = INVERT,
    IncrementAndWrap = INCREMENT_AND_WRAP,
    DecrementAndWrap = DECREMENT_AND_WRAP,
}

impl Default for StencilOp {
    #[inline]
    fn default() -> Self {
        StencilOp::Keep
    }
}

vulkan_enum! {
    /// The type of the indices in an index buffer.
    IndexType = IndexType(i32);

    U16 = UINT16,
    U32 = UINT32,
}

impl IndexType {
    /// Returns the size in bytes of a single index.
    #[inline]
    pub const fn size(self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// The stencil operations of one face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilOps {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
}

/// A viewport, with the depth range already applied.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub offset: [f32; 2],
    pub extent: [f32; 2],
    pub depth_range: [f32; 2],
}

/// A scissor rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scissor {
    pub offset: [i32; 2],
    pub extent: [u32; 2],
}

impl Scissor {
    /// A scissor that discards every fragment.
    pub const EMPTY: Scissor = Scissor {
        offset: [0, 0],
        extent: [0, 0],
    };

    /// Returns whether the scissor discards every fragment.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.extent[0] == 0 || self.extent[1] == 0
    }
}

/// Identifies a linked shader program provided by the frontend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramId(pub u64);

/// Everything that is baked into a graphics pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub program: ProgramId,
    pub topology: PrimitiveTopology,
    pub vertex_binding_strides: SmallVec<[u32; 8]>,

    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_test_enable: bool,
    pub stencil_front: StencilOps,
    pub stencil_back: StencilOps,
    pub primitive_restart_enable: bool,

    pub blend_enable: bool,
    /// The advanced blend equation in use, or 0.
    pub advanced_blend_equation: u32,
    pub color_write_mask: u32,

    /// Render pass compatibility: sample count and attachments.
    pub samples: u32,
    pub color_attachment_count: u8,
    pub has_depth_stencil: bool,
    /// Whether the depth/stencil attachment is in the read-only feedback-loop layout.
    pub depth_stencil_read_only: bool,

    pub transform_feedback: bool,
}

/// Everything that is baked into a compute pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    pub program: ProgramId,
}

/// A cache that creates pipelines on demand.
///
/// Implementations must be internally synchronized, because the cache is populated concurrently
/// by [`PipelineWarmup`] tasks and by the recording thread. A call may block while the same
/// pipeline is being compiled elsewhere.
pub trait PipelineCache: Send + Sync {
    /// Returns the pipeline for `desc`, creating it if it doesn't exist yet.
    fn get_or_create_graphics(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError>;

    /// Returns the pipeline for `desc`, creating it if it doesn't exist yet.
    fn get_or_create_compute(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError>;
}

/// Pipelines being compiled ahead of their first use on a worker thread.
#[derive(Debug)]
pub struct PipelineWarmup {
    worker: Mutex<Option<JoinHandle<Result<(), DeviceError>>>>,
}

impl PipelineWarmup {
    /// Starts compiling `graphics` and `compute` pipelines on a new worker thread.
    pub fn spawn(
        cache: Arc<dyn PipelineCache>,
        graphics: Vec<GraphicsPipelineDesc>,
        compute: Vec<ComputePipelineDesc>,
    ) -> Self {
        let worker = thread::spawn(move || {
            for desc in &graphics {
                cache.get_or_create_graphics(desc)?;
            }

            for desc in &compute {
                cache.get_or_create_compute(desc)?;
            }

            tracing::debug!(
                graphics = graphics.len(),
                compute = compute.len(),
                "pipeline warm-up finished",
            );

            Ok(())
        });

        PipelineWarmup {
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Returns whether the worker has finished. Doesn't block.
    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Blocks until the worker has finished, and returns its result. Later calls return
    /// `Ok(())` immediately.
    pub fn wait(&self) -> Result<(), DeviceError> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        match worker.join() {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("pipeline warm-up worker panicked");

                Err(DeviceError::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockPipelineCache;

    #[test]
    fn warmup_populates_cache() {
        let cache = Arc::new(MockPipelineCache::default());
        let desc = GraphicsPipelineDesc {
            program: ProgramId(3),
            ..Default::default()
        };

        let warmup = PipelineWarmup::spawn(cache.clone(), vec![desc.clone()], Vec::new());
        warmup.wait().unwrap();
        assert!(warmup.is_finished());
        assert_eq!(warmup.wait(), Ok(()));

        assert_eq!(cache.graphics_created(), 1);
        cache.get_or_create_graphics(&desc).unwrap();
        assert_eq!(cache.graphics_created(), 1);
    }

    #[test]
    fn warmup_reports_errors() {
        let cache = Arc::new(MockPipelineCache::default());
        cache.fail_with(DeviceError::DeviceLost);

        let warmup = PipelineWarmup::spawn(
            cache,
            Vec::new(),
            vec![ComputePipelineDesc {
                program: ProgramId(1),
            }],
        );
        assert_eq!(warmup.wait(), Err(DeviceError::DeviceLost));
    }

    #[test]
    fn index_sizes() {
        assert_eq!(IndexType::U16.size(), 2);
        assert_eq!(
            ash::vk::IndexType::from(IndexType::U32),
            ash::vk::IndexType::UINT32,
        );
    }
}
