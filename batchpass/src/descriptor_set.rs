// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Descriptor sets, looked up by the resources they bind.
//!
//! Allocating and writing descriptor sets is done by an external [`DescriptorSetCache`], which
//! hands out an existing set when one with the same bindings exists. Because a cached set keeps
//! referring to its resources, each newly allocated set is registered in a
//! [`DescriptorSetTracker`], so that the sets referring to a resource can be evicted when the
//! resource is released.

use crate::{macros::vulkan_enum, sync::ImageLayout, DeviceError, DeviceSize};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::num::NonZero;

vulkan_enum! {
    /// The type of a descriptor.
    DescriptorType = DescriptorType(i32);

    UniformBuffer = UNIFORM_BUFFER,
    StorageBuffer = STORAGE_BUFFER,
    CombinedImageSampler = COMBINED_IMAGE_SAMPLER,
    StorageImage = STORAGE_IMAGE,
    InputAttachment = INPUT_ATTACHMENT,
}

/// The resource bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Buffer {
        buffer: NonZero<u64>,
        offset: DeviceSize,
        range: DeviceSize,
    },
    Image {
        image: NonZero<u64>,
        layout: ImageLayout,
    },
}

impl DescriptorResource {
    /// Returns the ID of the buffer or image.
    #[inline]
    pub fn resource_id(&self) -> NonZero<u64> {
        match *self {
            DescriptorResource::Buffer { buffer, .. } => buffer,
            DescriptorResource::Image { image, .. } => image,
        }
    }
}

/// One binding of a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub resource: DescriptorResource,
}

/// Everything a descriptor set is looked up by.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetDesc {
    /// The index of the set in the pipeline layout.
    pub set: u32,
    pub bindings: SmallVec<[DescriptorBinding; 8]>,
}

impl DescriptorSetDesc {
    #[inline]
    pub fn new(set: u32) -> Self {
        DescriptorSetDesc {
            set,
            bindings: SmallVec::new(),
        }
    }

    /// Adds a binding.
    #[inline]
    pub fn push(&mut self, binding: DescriptorBinding) {
        self.bindings.push(binding);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// The result of a descriptor set lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSetLookup {
    pub descriptor_set: ash::vk::DescriptorSet,

    /// Whether the set was allocated and written by this lookup, rather than found in the cache.
    pub newly_allocated: bool,
}

/// A cache of descriptor sets.
///
/// Implementations must be internally synchronized, because the cache is shared between contexts
/// and pipeline warm-up.
pub trait DescriptorSetCache: Send + Sync {
    /// Returns a set with the bindings of `desc`, allocating and writing it if needed.
    fn get_or_allocate(
        &self,
        desc: &DescriptorSetDesc,
    ) -> Result<DescriptorSetLookup, DeviceError>;

    /// Removes a set from the cache. It is freed once the device no longer uses it.
    fn evict(&self, descriptor_set: ash::vk::DescriptorSet);
}

/// Back-references from resources to the cached descriptor sets that bind them.
#[derive(Debug, Default)]
pub struct DescriptorSetTracker {
    sets_by_resource: HashMap<NonZero<u64>, SmallVec<[ash::vk::DescriptorSet; 4]>>,
}

impl DescriptorSetTracker {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of looking up `desc`. Only newly allocated sets are registered, because
    /// a set found in the cache already is.
    pub fn on_lookup(&mut self, desc: &DescriptorSetDesc, lookup: DescriptorSetLookup) {
        if !lookup.newly_allocated {
            return;
        }

        for binding in &desc.bindings {
            let sets = self
                .sets_by_resource
                .entry(binding.resource.resource_id())
                .or_default();

            if !sets.contains(&lookup.descriptor_set) {
                sets.push(lookup.descriptor_set);
            }
        }
    }

    /// Forgets the sets that bind the resource with ID `resource_id`, and returns them.
    pub fn release_resource(
        &mut self,
        resource_id: NonZero<u64>,
    ) -> SmallVec<[ash::vk::DescriptorSet; 4]> {
        let sets = self
            .sets_by_resource
            .remove(&resource_id)
            .unwrap_or_default();

        // A set binding several resources is also referenced by the others.
        for other in self.sets_by_resource.values_mut() {
            other.retain(|set| !sets.contains(set));
        }

        self.sets_by_resource.retain(|_, sets| !sets.is_empty());

        sets
    }

    /// Returns the number of resources with registered sets.
    #[inline]
    pub fn resource_count(&self) -> usize {
        self.sets_by_resource.len()
    }
}
