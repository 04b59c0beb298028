// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::macros::{vulkan_bitflags, vulkan_enum};

vulkan_bitflags! {
    /// A set of stages in a device queue's pipeline.
    PipelineStages
    impl {
        /// Replaces the pseudo-stages `ALL_GRAPHICS` and `ALL_COMMANDS` with the stages they
        /// stand for, so that two masks can be compared for overlap.
        #[inline]
        pub const fn expand(self) -> Self {
            let mut result = self;

            if self.intersects(PipelineStages::ALL_COMMANDS) {
                return Self::all();
            }

            if self.intersects(PipelineStages::ALL_GRAPHICS) {
                result = result
                    .union(PipelineStages::DRAW_INDIRECT)
                    .union(PipelineStages::INDEX_INPUT)
                    .union(PipelineStages::VERTEX_ATTRIBUTE_INPUT)
                    .union(PipelineStages::VERTEX_SHADER)
                    .union(PipelineStages::TRANSFORM_FEEDBACK)
                    .union(PipelineStages::FRAGMENT_SHADER)
                    .union(PipelineStages::EARLY_FRAGMENT_TESTS)
                    .union(PipelineStages::LATE_FRAGMENT_TESTS)
                    .union(PipelineStages::COLOR_ATTACHMENT_OUTPUT);
            }

            result
        }

        /// Returns whether any of the stages can only execute inside a render pass instance.
        #[inline]
        pub const fn contains_render_pass_stages(self) -> bool {
            self.intersects(
                PipelineStages::EARLY_FRAGMENT_TESTS
                    .union(PipelineStages::LATE_FRAGMENT_TESTS)
                    .union(PipelineStages::COLOR_ATTACHMENT_OUTPUT),
            )
        }
    }
    = PipelineStageFlags2(u64);

    TOP_OF_PIPE = TOP_OF_PIPE,
    DRAW_INDIRECT = DRAW_INDIRECT,
    INDEX_INPUT = INDEX_INPUT,
    VERTEX_ATTRIBUTE_INPUT = VERTEX_ATTRIBUTE_INPUT,
    VERTEX_SHADER = VERTEX_SHADER,
    TRANSFORM_FEEDBACK = TRANSFORM_FEEDBACK_EXT,
    FRAGMENT_SHADER = FRAGMENT_SHADER,
    EARLY_FRAGMENT_TESTS = EARLY_FRAGMENT_TESTS,
    LATE_FRAGMENT_TESTS = LATE_FRAGMENT_TESTS,
    COLOR_ATTACHMENT_OUTPUT = COLOR_ATTACHMENT_OUTPUT,
    COMPUTE_SHADER = COMPUTE_SHADER,
    ALL_TRANSFER = ALL_TRANSFER,
    BOTTOM_OF_PIPE = BOTTOM_OF_PIPE,
    HOST = HOST,
    ALL_GRAPHICS = ALL_GRAPHICS,
    ALL_COMMANDS = ALL_COMMANDS,
}

vulkan_bitflags! {
    /// A set of memory access types that are included in a memory dependency.
    AccessFlags
    impl {
        pub(crate) const WRITES: AccessFlags = AccessFlags::SHADER_WRITE
            .union(AccessFlags::COLOR_ATTACHMENT_WRITE)
            .union(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .union(AccessFlags::TRANSFER_WRITE)
            .union(AccessFlags::HOST_WRITE)
            .union(AccessFlags::MEMORY_WRITE)
            .union(AccessFlags::SHADER_STORAGE_WRITE)
            .union(AccessFlags::TRANSFORM_FEEDBACK_WRITE);

        /// Returns whether `self` contains any write access.
        #[inline]
        pub const fn contains_write(self) -> bool {
            self.intersects(Self::WRITES)
        }

        /// Returns whether `self` contains any read access.
        #[inline]
        pub const fn contains_reads(self) -> bool {
            !self.difference(Self::WRITES).is_empty()
        }
    }
    = AccessFlags2(u64);

    INDIRECT_COMMAND_READ = INDIRECT_COMMAND_READ,
    INDEX_READ = INDEX_READ,
    VERTEX_ATTRIBUTE_READ = VERTEX_ATTRIBUTE_READ,
    UNIFORM_READ = UNIFORM_READ,
    INPUT_ATTACHMENT_READ = INPUT_ATTACHMENT_READ,
    SHADER_READ = SHADER_READ,
    SHADER_WRITE = SHADER_WRITE,
    COLOR_ATTACHMENT_READ = COLOR_ATTACHMENT_READ,
    COLOR_ATTACHMENT_WRITE = COLOR_ATTACHMENT_WRITE,
    DEPTH_STENCIL_ATTACHMENT_READ = DEPTH_STENCIL_ATTACHMENT_READ,
    DEPTH_STENCIL_ATTACHMENT_WRITE = DEPTH_STENCIL_ATTACHMENT_WRITE,
    TRANSFER_READ = TRANSFER_READ,
    TRANSFER_WRITE = TRANSFER_WRITE,
    HOST_READ = HOST_READ,
    HOST_WRITE = HOST_WRITE,
    MEMORY_READ = MEMORY_READ,
    MEMORY_WRITE = MEMORY_WRITE,
    SHADER_SAMPLED_READ = SHADER_SAMPLED_READ,
    SHADER_STORAGE_READ = SHADER_STORAGE_READ,
    SHADER_STORAGE_WRITE = SHADER_STORAGE_WRITE,
    TRANSFORM_FEEDBACK_WRITE = TRANSFORM_FEEDBACK_WRITE_EXT,
}

vulkan_enum! {
    /// In-memory layout of the pixel data of an image.
    ImageLayout
    impl {
        /// Returns whether the layout allows writes through a render pass attachment.
        #[inline]
        pub const fn is_attachment_writable(self) -> bool {
            matches!(
                self,
                ImageLayout::ColorAttachmentOptimal
                    | ImageLayout::DepthStencilAttachmentOptimal
                    | ImageLayout::General
            )
        }
    }
    = ImageLayout(i32);

    /// The layout of the data is unknown, and the image is treated as containing no valid data.
    Undefined = UNDEFINED,

    /// A layout that supports all access types, at the cost of some performance.
    General = GENERAL,

    ColorAttachmentOptimal = COLOR_ATTACHMENT_OPTIMAL,

    DepthStencilAttachmentOptimal = DEPTH_STENCIL_ATTACHMENT_OPTIMAL,

    /// Used for the read-only depth/stencil mode, where the attachment is also sampled.
    DepthStencilReadOnlyOptimal = DEPTH_STENCIL_READ_ONLY_OPTIMAL,

    ShaderReadOnlyOptimal = SHADER_READ_ONLY_OPTIMAL,

    TransferSrcOptimal = TRANSFER_SRC_OPTIMAL,

    TransferDstOptimal = TRANSFER_DST_OPTIMAL,

    PresentSrc = PRESENT_SRC_KHR,
}

impl Default for ImageLayout {
    #[inline]
    fn default() -> Self {
        ImageLayout::Undefined
    }
}

vulkan_bitflags! {
    /// Which aspects of an image a barrier or view refers to.
    ImageAspects = ImageAspectFlags(u32);

    COLOR = COLOR,
    DEPTH = DEPTH,
    STENCIL = STENCIL,
}

macro_rules! access_types {
    (
        $(
            $(#[$meta:meta])*
            $name:ident {
                stage_mask: $($stage_flag:ident)|+,
                access_mask: $($access_flag:ident)|+,
                image_layout: $image_layout:ident,
                valid_for: $($valid_for:ident)|+,
            }
        )*
    ) => {
        /// Specifies which type of access is performed on a resource.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum AccessType {
            $(
                $(#[$meta])*
                $name,
            )*
        }

        impl AccessType {
            /// Returns the stage mask of this type of access.
            #[inline]
            #[must_use]
            pub const fn stage_mask(self) -> PipelineStages {
                match self {
                    $(
                        Self::$name => PipelineStages::empty()
                            $(.union(PipelineStages::$stage_flag))+,
                    )*
                }
            }

            /// Returns the access mask of this type of access.
            #[inline]
            #[must_use]
            pub const fn access_mask(self) -> AccessFlags {
                match self {
                    $(
                        Self::$name => AccessFlags::empty()
                            $(.union(AccessFlags::$access_flag))+,
                    )*
                }
            }

            /// Returns the image layout for this type of access.
            #[inline]
            #[must_use]
            pub const fn image_layout(self) -> ImageLayout {
                match self {
                    $(
                        Self::$name => ImageLayout::$image_layout,
                    )*
                }
            }

            const fn valid_for(self) -> u8 {
                match self {
                    $(
                        Self::$name => $($valid_for)|+,
                    )*
                }
            }
        }
    };
}

const BUFFER: u8 = 1 << 0;
const IMAGE: u8 = 1 << 1;

access_types! {
    IndirectCommandRead {
        stage_mask: DRAW_INDIRECT,
        access_mask: INDIRECT_COMMAND_READ,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    IndexRead {
        stage_mask: INDEX_INPUT,
        access_mask: INDEX_READ,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    VertexAttributeRead {
        stage_mask: VERTEX_ATTRIBUTE_INPUT,
        access_mask: VERTEX_ATTRIBUTE_READ,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    GraphicsShaderUniformRead {
        stage_mask: VERTEX_SHADER | FRAGMENT_SHADER,
        access_mask: UNIFORM_READ,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    GraphicsShaderSampledRead {
        stage_mask: VERTEX_SHADER | FRAGMENT_SHADER,
        access_mask: SHADER_SAMPLED_READ,
        image_layout: ShaderReadOnlyOptimal,
        valid_for: BUFFER | IMAGE,
    }

    GraphicsShaderStorageRead {
        stage_mask: VERTEX_SHADER | FRAGMENT_SHADER,
        access_mask: SHADER_STORAGE_READ,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    GraphicsShaderStorageWrite {
        stage_mask: VERTEX_SHADER | FRAGMENT_SHADER,
        access_mask: SHADER_STORAGE_READ | SHADER_STORAGE_WRITE,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderUniformRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: UNIFORM_READ,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    ComputeShaderSampledRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_SAMPLED_READ,
        image_layout: ShaderReadOnlyOptimal,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderStorageRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_STORAGE_READ,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderStorageWrite {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_STORAGE_READ | SHADER_STORAGE_WRITE,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    TransformFeedbackWrite {
        stage_mask: TRANSFORM_FEEDBACK,
        access_mask: TRANSFORM_FEEDBACK_WRITE,
        image_layout: Undefined,
        valid_for: BUFFER,
    }

    ColorAttachmentWrite {
        stage_mask: COLOR_ATTACHMENT_OUTPUT,
        access_mask: COLOR_ATTACHMENT_READ | COLOR_ATTACHMENT_WRITE,
        image_layout: ColorAttachmentOptimal,
        valid_for: IMAGE,
    }

    DepthStencilAttachmentWrite {
        stage_mask: EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS,
        access_mask: DEPTH_STENCIL_ATTACHMENT_READ | DEPTH_STENCIL_ATTACHMENT_WRITE,
        image_layout: DepthStencilAttachmentOptimal,
        valid_for: IMAGE,
    }

    DepthStencilAttachmentReadOnly {
        stage_mask: EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS | FRAGMENT_SHADER,
        access_mask: DEPTH_STENCIL_ATTACHMENT_READ | SHADER_SAMPLED_READ,
        image_layout: DepthStencilReadOnlyOptimal,
        valid_for: IMAGE,
    }

    CopyTransferRead {
        stage_mask: ALL_TRANSFER,
        access_mask: TRANSFER_READ,
        image_layout: TransferSrcOptimal,
        valid_for: BUFFER | IMAGE,
    }

    CopyTransferWrite {
        stage_mask: ALL_TRANSFER,
        access_mask: TRANSFER_WRITE,
        image_layout: TransferDstOptimal,
        valid_for: BUFFER | IMAGE,
    }

    HostRead {
        stage_mask: HOST,
        access_mask: HOST_READ,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    HostWrite {
        stage_mask: HOST,
        access_mask: HOST_WRITE,
        image_layout: General,
        valid_for: BUFFER | IMAGE,
    }

    Present {
        stage_mask: BOTTOM_OF_PIPE,
        access_mask: MEMORY_READ,
        image_layout: PresentSrc,
        valid_for: IMAGE,
    }
}

impl AccessType {
    /// Returns whether this type of access writes to the resource.
    #[inline]
    pub const fn is_write(self) -> bool {
        self.access_mask().contains_write()
    }

    /// Returns whether this type of access can only happen inside a render pass instance.
    #[inline]
    pub const fn is_render_pass_only(self) -> bool {
        self.stage_mask().contains_render_pass_stages()
    }

    /// Returns whether this type of access may be performed on a buffer.
    #[inline]
    pub const fn is_valid_for_buffer(self) -> bool {
        self.valid_for() & BUFFER != 0
    }

    /// Returns whether this type of access may be performed on an image.
    #[inline]
    pub const fn is_valid_for_image(self) -> bool {
        self.valid_for() & IMAGE != 0
    }
}
