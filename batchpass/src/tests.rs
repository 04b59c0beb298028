// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

use crate::{
    command_stream::{Command, StreamKind},
    descriptor_set::{DescriptorSetCache, DescriptorSetDesc, DescriptorSetLookup},
    device::{Device, Queue, Semaphore, SubmitBatch},
    memory::{Allocation, AllocationRequest, MemoryAllocator},
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineCache},
    render_pass::{Framebuffer, FramebufferId},
    resource::{Buffer, Image},
    serial::{QueueSerial, Serial},
    sync::ImageAspects,
    DeviceError, DeviceSize, OomError,
};
use ash::vk::Handle;
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// Builds a `Context` over mock collaborators. Evaluates to `(Mocks, Context)`.
macro_rules! test_context {
    () => {
        test_context!(crate::context::ContextCreateInfo::default())
    };
    ($create_info:expr) => {{
        let mocks = crate::tests::Mocks::new();
        let context = crate::context::Context::new(mocks.device.clone(), $create_info);

        (mocks, context)
    }};
}

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg));
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg));
                } else {
                    panic!("Couldn't decipher the panic message of the test")
                }
            }
        }
    }};
}

/// What the mock queue saw of one submission.
#[derive(Clone, Debug)]
pub(crate) struct SubmissionRecord {
    pub(crate) queue_serial: QueueSerial,
    pub(crate) stream_count: usize,
    pub(crate) stream_kinds: Vec<StreamKind>,
    pub(crate) stream_serials: Vec<QueueSerial>,
    pub(crate) wait_semaphore_count: usize,
    pub(crate) signal: Option<Semaphore>,
    pub(crate) commands: Vec<Command>,
}

#[derive(Debug, Default)]
struct MockQueueState {
    submissions: Vec<SubmissionRecord>,
    completed: HashMap<u32, Serial>,
    waits: u32,
    failure: Option<DeviceError>,
}

impl MockQueueState {
    fn complete(&mut self, queue_serial: QueueSerial) {
        let completed = self.completed.entry(queue_serial.index.0).or_insert(Serial::ZERO);

        if *completed < queue_serial.serial {
            *completed = queue_serial.serial;
        }
    }
}

/// A queue that executes nothing. Submitted serials only complete when told to, or when waited
/// for.
#[derive(Debug, Default)]
pub(crate) struct MockQueue {
    state: Mutex<MockQueueState>,
}

impl MockQueue {
    pub(crate) fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Completes every submitted batch.
    pub(crate) fn complete_all(&self) {
        let mut state = self.state.lock();
        let serials: Vec<_> = state.submissions.iter().map(|s| s.queue_serial).collect();

        for queue_serial in serials {
            state.complete(queue_serial);
        }
    }

    /// Returns how many times `wait_until_complete` had to block.
    pub(crate) fn waits(&self) -> u32 {
        self.state.lock().waits
    }

    /// Makes every later submission and wait fail with `err`.
    pub(crate) fn fail_with(&self, err: DeviceError) {
        self.state.lock().failure = Some(err);
    }
}

impl Queue for MockQueue {
    fn submit(&self, batch: &SubmitBatch<'_>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();

        if let Some(err) = state.failure {
            return Err(err);
        }

        state.submissions.push(SubmissionRecord {
            queue_serial: batch.queue_serial,
            stream_count: batch.streams.len(),
            stream_kinds: batch.streams.iter().map(|s| s.kind()).collect(),
            stream_serials: batch.streams.iter().map(|s| s.queue_serial()).collect(),
            wait_semaphore_count: batch.wait_semaphores.len(),
            signal: batch.signal_semaphore,
            commands: batch
                .streams
                .iter()
                .flat_map(|s| s.commands().iter().cloned())
                .collect(),
        });

        Ok(())
    }

    fn is_complete(&self, queue_serial: QueueSerial) -> bool {
        self.state
            .lock()
            .completed
            .get(&queue_serial.index.0)
            .is_some_and(|&completed| completed >= queue_serial.serial)
    }

    fn wait_until_complete(&self, queue_serial: QueueSerial) -> Result<(), DeviceError> {
        let mut state = self.state.lock();

        if let Some(err) = state.failure {
            return Err(err);
        }

        state.complete(queue_serial);
        state.waits += 1;

        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockPipelineCacheState {
    graphics: HashMap<GraphicsPipelineDesc, ash::vk::Pipeline>,
    compute: HashMap<ComputePipelineDesc, ash::vk::Pipeline>,
    next_handle: u64,
    failure: Option<DeviceError>,
}

/// A pipeline cache handing out fake handles, one per distinct description.
#[derive(Debug, Default)]
pub(crate) struct MockPipelineCache {
    state: Mutex<MockPipelineCacheState>,
}

impl MockPipelineCache {
    pub(crate) fn graphics_created(&self) -> usize {
        self.state.lock().graphics.len()
    }

    pub(crate) fn compute_created(&self) -> usize {
        self.state.lock().compute.len()
    }

    pub(crate) fn fail_with(&self, err: DeviceError) {
        self.state.lock().failure = Some(err);
    }
}

impl PipelineCache for MockPipelineCache {
    fn get_or_create_graphics(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError> {
        let mut state = self.state.lock();

        if let Some(err) = state.failure {
            return Err(err);
        }

        if let Some(&pipeline) = state.graphics.get(desc) {
            return Ok(pipeline);
        }

        state.next_handle += 1;
        let pipeline = ash::vk::Pipeline::from_raw(state.next_handle);
        state.graphics.insert(desc.clone(), pipeline);

        Ok(pipeline)
    }

    fn get_or_create_compute(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError> {
        let mut state = self.state.lock();

        if let Some(err) = state.failure {
            return Err(err);
        }

        if let Some(&pipeline) = state.compute.get(desc) {
            return Ok(pipeline);
        }

        state.next_handle += 1;
        let pipeline = ash::vk::Pipeline::from_raw(state.next_handle);
        state.compute.insert(*desc, pipeline);

        Ok(pipeline)
    }
}

#[derive(Debug, Default)]
struct MockDescriptorSetCacheState {
    sets: HashMap<DescriptorSetDesc, ash::vk::DescriptorSet>,
    evicted: Vec<ash::vk::DescriptorSet>,
    next_handle: u64,
}

/// A descriptor set cache handing out fake handles, one per distinct description.
#[derive(Debug, Default)]
pub(crate) struct MockDescriptorSetCache {
    state: Mutex<MockDescriptorSetCacheState>,
}

impl MockDescriptorSetCache {
    pub(crate) fn allocated(&self) -> usize {
        self.state.lock().sets.len()
    }

    pub(crate) fn evicted(&self) -> Vec<ash::vk::DescriptorSet> {
        self.state.lock().evicted.clone()
    }
}

impl DescriptorSetCache for MockDescriptorSetCache {
    fn get_or_allocate(
        &self,
        desc: &DescriptorSetDesc,
    ) -> Result<DescriptorSetLookup, DeviceError> {
        let mut state = self.state.lock();

        if let Some(&descriptor_set) = state.sets.get(desc) {
            return Ok(DescriptorSetLookup {
                descriptor_set,
                newly_allocated: false,
            });
        }

        state.next_handle += 1;
        let descriptor_set = ash::vk::DescriptorSet::from_raw(state.next_handle);
        state.sets.insert(desc.clone(), descriptor_set);

        Ok(DescriptorSetLookup {
            descriptor_set,
            newly_allocated: true,
        })
    }

    fn evict(&self, descriptor_set: ash::vk::DescriptorSet) {
        let mut state = self.state.lock();
        state.sets.retain(|_, set| *set != descriptor_set);
        state.evicted.push(descriptor_set);
    }
}

/// An allocator that always succeeds, unless told to fail the next few calls.
#[derive(Debug, Default)]
pub(crate) struct MockAllocator {
    failures_left: Mutex<u32>,
    calls: Mutex<u32>,
}

impl MockAllocator {
    pub(crate) fn fail_next(&self, count: u32) {
        *self.failures_left.lock() = count;
    }

    pub(crate) fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

impl MemoryAllocator for MockAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<Allocation, OomError> {
        *self.calls.lock() += 1;

        let mut failures_left = self.failures_left.lock();
        if *failures_left > 0 {
            *failures_left -= 1;

            return Err(OomError::OutOfDeviceMemory);
        }

        Ok(Allocation {
            memory: ash::vk::DeviceMemory::null(),
            offset: 0,
            size: request.size,
            properties: request.required | request.preferred,
        })
    }
}

/// The mock collaborators of a test context.
pub(crate) struct Mocks {
    pub(crate) queue: Arc<MockQueue>,
    pub(crate) pipeline_cache: Arc<MockPipelineCache>,
    pub(crate) descriptor_sets: Arc<MockDescriptorSetCache>,
    pub(crate) allocator: Arc<MockAllocator>,
    pub(crate) device: Arc<Device>,
}

impl Mocks {
    pub(crate) fn new() -> Self {
        let queue = Arc::new(MockQueue::default());
        let pipeline_cache = Arc::new(MockPipelineCache::default());
        let descriptor_sets = Arc::new(MockDescriptorSetCache::default());
        let allocator = Arc::new(MockAllocator::default());
        let device = Device::new(
            queue.clone(),
            pipeline_cache.clone(),
            descriptor_sets.clone(),
            allocator.clone(),
        );

        Mocks {
            queue,
            pipeline_cache,
            descriptor_sets,
            allocator,
            device,
        }
    }
}

pub(crate) fn buffer(size: DeviceSize) -> Arc<Buffer> {
    Arc::new(Buffer::new(ash::vk::Buffer::null(), size, false))
}

pub(crate) fn host_buffer(size: DeviceSize) -> Arc<Buffer> {
    Arc::new(Buffer::new(ash::vk::Buffer::null(), size, true))
}

pub(crate) fn color_image() -> Arc<Image> {
    Arc::new(Image::new(
        ash::vk::Image::null(),
        ImageAspects::COLOR,
        [64, 64],
        1,
    ))
}

pub(crate) fn depth_stencil_image() -> Arc<Image> {
    Arc::new(Image::new(
        ash::vk::Image::null(),
        ImageAspects::DEPTH | ImageAspects::STENCIL,
        [64, 64],
        1,
    ))
}

pub(crate) fn framebuffer(
    id: u64,
    color_attachments: &[Arc<Image>],
    depth_stencil_attachment: Option<Arc<Image>>,
) -> Framebuffer {
    Framebuffer {
        id: FramebufferId(id),
        color_attachments: color_attachments.iter().cloned().collect::<SmallVec<_>>(),
        depth_stencil_attachment,
        extent: [64, 64],
        samples: 1,
        is_default: false,
    }
}
