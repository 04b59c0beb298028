// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Synchronization primitives recorded into command streams.
//!
//! Barriers are never inserted in the middle of a command stream. Each stream carries a single
//! accumulated [`DependencyInfo`] that executes before all of its commands, which is what makes
//! the flush/close decisions of the [hazard resolver](crate::hazard) necessary.

pub use self::pipeline::{AccessFlags, AccessType, ImageAspects, ImageLayout, PipelineStages};
use crate::{
    macros::vulkan_bitflags,
    resource::{Buffer, Image},
};
use smallvec::SmallVec;
use std::{num::NonZero, sync::Arc};

mod pipeline;

/// Dependency info for barriers in a pipeline barrier command.
#[derive(Clone, Debug, Default)]
pub struct DependencyInfo {
    /// Global memory barriers.
    pub memory_barriers: SmallVec<[MemoryBarrier; 1]>,

    /// Buffer memory barriers.
    pub buffer_memory_barriers: SmallVec<[BufferMemoryBarrier; 4]>,

    /// Image memory barriers.
    pub image_memory_barriers: SmallVec<[ImageMemoryBarrier; 4]>,
}

impl DependencyInfo {
    /// Returns `true` if `self` doesn't contain any barriers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty()
            && self.buffer_memory_barriers.is_empty()
            && self.image_memory_barriers.is_empty()
    }

    /// Clears all barriers.
    #[inline]
    pub fn clear(&mut self) {
        self.memory_barriers.clear();
        self.buffer_memory_barriers.clear();
        self.image_memory_barriers.clear();
    }

    /// Adds a buffer barrier, merging it into an existing barrier on the same buffer.
    pub fn add_buffer_barrier(&mut self, barrier: BufferMemoryBarrier) {
        if let Some(existing) = self
            .buffer_memory_barriers
            .iter_mut()
            .find(|existing| existing.buffer.id() == barrier.buffer.id())
        {
            existing.src_stages |= barrier.src_stages;
            existing.src_access |= barrier.src_access;
            existing.dst_stages |= barrier.dst_stages;
            existing.dst_access |= barrier.dst_access;
        } else {
            self.buffer_memory_barriers.push(barrier);
        }
    }

    /// Adds an image barrier. A barrier on the same image that starts from the same layout is
    /// merged into, and its destination layout is replaced.
    pub fn add_image_barrier(&mut self, barrier: ImageMemoryBarrier) {
        if let Some(existing) = self.image_memory_barriers.iter_mut().find(|existing| {
            existing.image.id() == barrier.image.id() && existing.old_layout == barrier.old_layout
        }) {
            existing.src_stages |= barrier.src_stages;
            existing.src_access |= barrier.src_access;
            existing.dst_stages |= barrier.dst_stages;
            existing.dst_access |= barrier.dst_access;
            existing.new_layout = barrier.new_layout;
        } else {
            self.image_memory_barriers.push(barrier);
        }
    }

    /// Returns the barrier on the image with the given ID, if any.
    #[inline]
    pub fn image_barrier_mut(
        &mut self,
        image_id: NonZero<u64>,
    ) -> Option<&mut ImageMemoryBarrier> {
        self.image_memory_barriers
            .iter_mut()
            .find(|existing| existing.image.id() == image_id)
    }

    /// Adds a global memory barrier, merging it with the existing one.
    pub fn add_memory_barrier(&mut self, barrier: MemoryBarrier) {
        if let Some(existing) = self.memory_barriers.first_mut() {
            existing.src_stages |= barrier.src_stages;
            existing.src_access |= barrier.src_access;
            existing.dst_stages |= barrier.dst_stages;
            existing.dst_access |= barrier.dst_access;
        } else {
            self.memory_barriers.push(barrier);
        }
    }

    /// Returns the barriers in the form expected by `vkCmdPipelineBarrier2`.
    pub fn to_vk(
        &self,
    ) -> (
        SmallVec<[ash::vk::MemoryBarrier2<'static>; 1]>,
        SmallVec<[ash::vk::BufferMemoryBarrier2<'static>; 4]>,
        SmallVec<[ash::vk::ImageMemoryBarrier2<'static>; 4]>,
    ) {
        (
            self.memory_barriers.iter().map(MemoryBarrier::to_vk).collect(),
            self.buffer_memory_barriers
                .iter()
                .map(BufferMemoryBarrier::to_vk)
                .collect(),
            self.image_memory_barriers
                .iter()
                .map(ImageMemoryBarrier::to_vk)
                .collect(),
        )
    }
}

/// A memory barrier that is applied globally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
}

impl MemoryBarrier {
    fn to_vk(&self) -> ash::vk::MemoryBarrier2<'static> {
        ash::vk::MemoryBarrier2::default()
            .src_stage_mask(self.src_stages.into())
            .src_access_mask(self.src_access.into())
            .dst_stage_mask(self.dst_stages.into())
            .dst_access_mask(self.dst_access.into())
    }
}

/// A memory barrier that is applied to a single buffer.
#[derive(Clone, Debug)]
pub struct BufferMemoryBarrier {
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub buffer: Arc<Buffer>,
}

impl BufferMemoryBarrier {
    fn to_vk(&self) -> ash::vk::BufferMemoryBarrier2<'static> {
        ash::vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src_stages.into())
            .src_access_mask(self.src_access.into())
            .dst_stage_mask(self.dst_stages.into())
            .dst_access_mask(self.dst_access.into())
            .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer.handle())
            .offset(0)
            .size(ash::vk::WHOLE_SIZE)
    }
}

/// A memory barrier that is applied to a single image, possibly with a layout transition.
#[derive(Clone, Debug)]
pub struct ImageMemoryBarrier {
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub image: Arc<Image>,
}

impl ImageMemoryBarrier {
    fn to_vk(&self) -> ash::vk::ImageMemoryBarrier2<'static> {
        let subresource_range = ash::vk::ImageSubresourceRange {
            aspect_mask: self.image.aspects().into(),
            base_mip_level: 0,
            level_count: ash::vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: ash::vk::REMAINING_ARRAY_LAYERS,
        };

        ash::vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stages.into())
            .src_access_mask(self.src_access.into())
            .dst_stage_mask(self.dst_stages.into())
            .dst_access_mask(self.dst_access.into())
            .old_layout(self.old_layout.into())
            .new_layout(self.new_layout.into())
            .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.handle())
            .subresource_range(subresource_range)
    }
}

vulkan_bitflags! {
    /// Memory barrier requests made by the frontend.
    ///
    /// These don't execute anything by themselves. They are remembered until the next draw or
    /// dispatch, which then honors them against the resources it touches.
    MemoryBarrierBits
    impl {
        /// The barrier bits that make earlier shader storage writes visible.
        pub const STORAGE_WRITES: MemoryBarrierBits = MemoryBarrierBits::SHADER_IMAGE_ACCESS
            .union(MemoryBarrierBits::SHADER_STORAGE)
            .union(MemoryBarrierBits::ATOMIC_COUNTER);

        /// Returns the pipeline stages and accesses that the barrier bits make writes visible to.
        pub fn destination_scope(self) -> (PipelineStages, AccessFlags) {
            let mut stages = PipelineStages::empty();
            let mut access = AccessFlags::empty();

            if self.intersects(MemoryBarrierBits::VERTEX_ATTRIB_ARRAY) {
                stages |= PipelineStages::VERTEX_ATTRIBUTE_INPUT;
                access |= AccessFlags::VERTEX_ATTRIBUTE_READ;
            }

            if self.intersects(MemoryBarrierBits::ELEMENT_ARRAY) {
                stages |= PipelineStages::INDEX_INPUT;
                access |= AccessFlags::INDEX_READ;
            }

            if self.intersects(MemoryBarrierBits::COMMAND) {
                stages |= PipelineStages::DRAW_INDIRECT;
                access |= AccessFlags::INDIRECT_COMMAND_READ;
            }

            if self.intersects(MemoryBarrierBits::UNIFORM | MemoryBarrierBits::TEXTURE_FETCH) {
                stages |= PipelineStages::VERTEX_SHADER
                    | PipelineStages::FRAGMENT_SHADER
                    | PipelineStages::COMPUTE_SHADER;
                access |= AccessFlags::UNIFORM_READ | AccessFlags::SHADER_SAMPLED_READ;
            }

            if self.intersects(Self::STORAGE_WRITES) {
                stages |= PipelineStages::VERTEX_SHADER
                    | PipelineStages::FRAGMENT_SHADER
                    | PipelineStages::COMPUTE_SHADER;
                access |= AccessFlags::SHADER_STORAGE_READ | AccessFlags::SHADER_STORAGE_WRITE;
            }

            if self.intersects(
                MemoryBarrierBits::PIXEL_BUFFER
                    | MemoryBarrierBits::TEXTURE_UPDATE
                    | MemoryBarrierBits::BUFFER_UPDATE,
            ) {
                stages |= PipelineStages::ALL_TRANSFER;
                access |= AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE;
            }

            if self.intersects(MemoryBarrierBits::FRAMEBUFFER) {
                stages |= PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS
                    | PipelineStages::LATE_FRAGMENT_TESTS;
                access |= AccessFlags::COLOR_ATTACHMENT_READ
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
            }

            if self.intersects(MemoryBarrierBits::TRANSFORM_FEEDBACK) {
                stages |= PipelineStages::TRANSFORM_FEEDBACK;
                access |= AccessFlags::TRANSFORM_FEEDBACK_WRITE;
            }

            (stages, access)
        }
    }
    = u32;

    VERTEX_ATTRIB_ARRAY = 0x0001,
    ELEMENT_ARRAY = 0x0002,
    UNIFORM = 0x0004,
    TEXTURE_FETCH = 0x0008,
    SHADER_IMAGE_ACCESS = 0x0020,
    COMMAND = 0x0040,
    PIXEL_BUFFER = 0x0080,
    TEXTURE_UPDATE = 0x0100,
    BUFFER_UPDATE = 0x0200,
    FRAMEBUFFER = 0x0400,
    TRANSFORM_FEEDBACK = 0x0800,
    ATOMIC_COUNTER = 0x1000,
    SHADER_STORAGE = 0x2000,
}
