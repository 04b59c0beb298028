// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory allocation, and what to do when it runs out.
//!
//! Suballocation is done by an external [`MemoryAllocator`]. When it reports that memory is
//! exhausted, memory held by objects that are only waiting for the device to finish with them can
//! often be reclaimed. [`allocate_with_retry`] goes through increasingly expensive ways of doing
//! so before giving up:
//!
//! 1. Destroy the garbage whose queue serials have already completed, and retry.
//! 2. Submit all outstanding work and wait for the device to finish it, destroy all garbage, and
//!    retry.
//! 3. Retry with relaxed requirements, accepting a slower memory type.
//!
//! Only if all of these fail is the error returned.

use crate::{macros::vulkan_bitflags, ContextError, DeviceError, DeviceSize, OomError};

vulkan_bitflags! {
    /// Properties of a memory type.
    MemoryPropertyFlags = MemoryPropertyFlags(u32);

    /// The memory is local to the device. Accessing it from the device is fastest.
    DEVICE_LOCAL = DEVICE_LOCAL,

    /// The memory can be mapped by the host.
    HOST_VISIBLE = HOST_VISIBLE,

    /// Host writes are visible to the device without flushing, and the other way around.
    HOST_COHERENT = HOST_COHERENT,

    /// Host reads are cached.
    HOST_CACHED = HOST_CACHED,

    /// The memory may only be allocated when it is needed.
    LAZILY_ALLOCATED = LAZILY_ALLOCATED,
}

/// Parameters of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRequest {
    pub size: DeviceSize,
    pub alignment: DeviceSize,

    /// Properties the memory type must have.
    pub required: MemoryPropertyFlags,

    /// Properties the memory type should have if possible.
    pub preferred: MemoryPropertyFlags,
}

impl AllocationRequest {
    /// Returns the request with everything dropped except what the host needs to access the
    /// memory.
    pub fn relaxed(&self) -> Self {
        AllocationRequest {
            required: self.required
                & (MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT),
            preferred: MemoryPropertyFlags::empty(),
            ..*self
        }
    }
}

/// A block of device memory handed out by a [`MemoryAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub memory: ash::vk::DeviceMemory,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub properties: MemoryPropertyFlags,
}

/// Suballocates device memory.
///
/// Implementations must be internally synchronized, because an allocator is shared between
/// contexts.
pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, request: &AllocationRequest) -> Result<Allocation, OomError>;
}

/// Ways to free memory held by finished or outstanding work.
pub trait Reclaim {
    /// Destroys the garbage whose queue serials have already completed. Doesn't block.
    fn collect_garbage(&mut self) -> Result<(), DeviceError>;

    /// Submits all outstanding work, waits for it, and destroys all garbage.
    fn finish_for_retry(&mut self) -> Result<(), DeviceError>;
}

/// The attempt that an allocation succeeded at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryStage {
    Initial,
    AfterGarbageCollection,
    AfterFinish,
    Relaxed,
}

/// Allocates memory from `allocator`, reclaiming memory through `reclaim` when it is exhausted.
///
/// Returns the allocation and the attempt it succeeded at. Device errors encountered while
/// reclaiming are returned as they are.
pub fn allocate_with_retry<R: Reclaim + ?Sized>(
    reclaim: &mut R,
    allocator: &dyn MemoryAllocator,
    request: &AllocationRequest,
) -> Result<(Allocation, RetryStage), ContextError> {
    let err = match allocator.allocate(request) {
        Ok(allocation) => return Ok((allocation, RetryStage::Initial)),
        Err(err) => err,
    };
    tracing::debug!(size = request.size, %err, "allocation failed, collecting garbage");

    reclaim.collect_garbage()?;

    let err = match allocator.allocate(request) {
        Ok(allocation) => return Ok((allocation, RetryStage::AfterGarbageCollection)),
        Err(err) => err,
    };
    tracing::debug!(size = request.size, %err, "allocation failed, waiting for the device");

    reclaim.finish_for_retry()?;

    let err = match allocator.allocate(request) {
        Ok(allocation) => return Ok((allocation, RetryStage::AfterFinish)),
        Err(err) => err,
    };
    tracing::warn!(
        size = request.size,
        %err,
        "allocation failed after waiting for the device, relaxing memory requirements",
    );

    match allocator.allocate(&request.relaxed()) {
        Ok(allocation) => Ok((allocation, RetryStage::Relaxed)),
        Err(err) => Err(ContextError::Allocation(err)),
    }
}
