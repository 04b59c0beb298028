// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The queue that recorded command streams are submitted to.
//!
//! Creating the device, translating [`Command`](crate::command_stream::Command)s into a real
//! command buffer and talking to the driver all happen behind the [`Queue`] trait. The batching
//! layer only needs to submit in order and to know when a queue serial has completed.

use crate::{
    command_stream::RecordedStream,
    descriptor_set::DescriptorSetCache,
    memory::MemoryAllocator,
    pipeline::PipelineCache,
    serial::{QueueSerial, SerialIndex, SerialIndexAllocator},
    submit::SharedGarbageList,
    sync::PipelineStages,
    DeviceError,
};
use std::{fmt, sync::Arc};

/// A binary semaphore owned by the window system or another API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Semaphore {
    handle: ash::vk::Semaphore,
}

impl Semaphore {
    /// Wraps a semaphore handle.
    #[inline]
    pub fn new(handle: ash::vk::Semaphore) -> Self {
        Semaphore { handle }
    }

    #[inline]
    pub fn handle(&self) -> ash::vk::Semaphore {
        self.handle
    }
}

/// A semaphore to wait for before a submission executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: Semaphore,

    /// The stages of the submission that can't start before the semaphore is signaled.
    pub stages: PipelineStages,
}

impl SemaphoreWait {
    /// Returns a `SemaphoreWait` that blocks every stage.
    #[inline]
    pub fn all_commands(semaphore: Semaphore) -> Self {
        SemaphoreWait {
            semaphore,
            stages: PipelineStages::ALL_COMMANDS,
        }
    }
}

/// One submission to the queue.
#[derive(Debug)]
pub struct SubmitBatch<'a> {
    /// The streams to execute, in order. Each stream's pre-barrier executes before its commands.
    pub streams: &'a [RecordedStream],

    pub wait_semaphores: &'a [SemaphoreWait],

    pub signal_semaphore: Option<Semaphore>,

    /// The serial that completes when the whole batch has executed. It is greater than or equal
    /// to the serial of every stream of the batch.
    pub queue_serial: QueueSerial,
}

/// A device queue, as seen by the batching layer.
///
/// Implementations must be internally synchronized, because several contexts share a queue.
pub trait Queue: Send + Sync {
    /// Submits a batch. The batch executes after every batch submitted before it.
    fn submit(&self, batch: &SubmitBatch<'_>) -> Result<(), DeviceError>;

    /// Returns whether the work submitted with `queue_serial` has finished executing.
    fn is_complete(&self, queue_serial: QueueSerial) -> bool;

    /// Blocks until the work submitted with `queue_serial` has finished executing.
    fn wait_until_complete(&self, queue_serial: QueueSerial) -> Result<(), DeviceError>;
}

/// The collaborators shared by every context created on one queue.
pub struct Device {
    queue: Arc<dyn Queue>,
    pipeline_cache: Arc<dyn PipelineCache>,
    descriptor_set_cache: Arc<dyn DescriptorSetCache>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    garbage: Arc<SharedGarbageList>,
    serial_indices: SerialIndexAllocator,
}

impl Device {
    pub fn new(
        queue: Arc<dyn Queue>,
        pipeline_cache: Arc<dyn PipelineCache>,
        descriptor_set_cache: Arc<dyn DescriptorSetCache>,
        memory_allocator: Arc<dyn MemoryAllocator>,
    ) -> Arc<Self> {
        Arc::new(Device {
            queue,
            pipeline_cache,
            descriptor_set_cache,
            memory_allocator,
            garbage: Arc::new(SharedGarbageList::new()),
            serial_indices: SerialIndexAllocator::new(),
        })
    }

    #[inline]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    #[inline]
    pub fn pipeline_cache(&self) -> &Arc<dyn PipelineCache> {
        &self.pipeline_cache
    }

    #[inline]
    pub fn descriptor_set_cache(&self) -> &Arc<dyn DescriptorSetCache> {
        &self.descriptor_set_cache
    }

    #[inline]
    pub fn memory_allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.memory_allocator
    }

    /// Returns the garbage list shared by the contexts of the device.
    #[inline]
    pub fn garbage(&self) -> &Arc<SharedGarbageList> {
        &self.garbage
    }

    /// Allocates the serial index of a new context.
    #[inline]
    pub(crate) fn allocate_serial_index(&self) -> SerialIndex {
        self.serial_indices.allocate()
    }

    #[inline]
    pub(crate) fn release_serial_index(&self, index: SerialIndex) {
        self.serial_indices.release(index);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("garbage", &self.garbage)
            .finish_non_exhaustive()
    }
}
