// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Collaborators that record what the batching layer hands them instead of talking to a device.

#![allow(dead_code)]

use ash::vk::Handle;
use batchpass::{
    command_stream::{Command, StreamKind},
    context::{Context, ContextCreateInfo},
    descriptor_set::{DescriptorSetCache, DescriptorSetDesc, DescriptorSetLookup},
    device::{Device, Queue, SubmitBatch},
    memory::{Allocation, AllocationRequest, MemoryAllocator},
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineCache},
    render_pass::{Framebuffer, FramebufferId},
    resource::{Buffer, Image},
    serial::QueueSerial,
    sync::ImageAspects,
    DeviceError, DeviceSize, OomError,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Debug)]
pub struct Submission {
    pub queue_serial: QueueSerial,
    pub streams: Vec<(StreamKind, QueueSerial)>,
    pub commands: Vec<Command>,
    pub wait_semaphores: usize,
}

/// A queue that completes work only when it is waited for.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    submissions: Mutex<Vec<Submission>>,
    completed: Mutex<Vec<QueueSerial>>,
    waits: AtomicU32,
}

impl RecordingQueue {
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn waits(&self) -> u32 {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Queue for RecordingQueue {
    fn submit(&self, batch: &SubmitBatch<'_>) -> Result<(), DeviceError> {
        self.submissions.lock().push(Submission {
            queue_serial: batch.queue_serial,
            streams: batch
                .streams
                .iter()
                .map(|stream| (stream.kind(), stream.queue_serial()))
                .collect(),
            commands: batch
                .streams
                .iter()
                .flat_map(|stream| stream.commands().iter().cloned())
                .collect(),
            wait_semaphores: batch.wait_semaphores.len(),
        });

        Ok(())
    }

    fn is_complete(&self, queue_serial: QueueSerial) -> bool {
        self.completed.lock().iter().any(|completed| {
            completed.index == queue_serial.index && completed.serial >= queue_serial.serial
        })
    }

    fn wait_until_complete(&self, queue_serial: QueueSerial) -> Result<(), DeviceError> {
        self.completed.lock().push(queue_serial);
        self.waits.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }
}

/// Hands out a new pipeline for every call.
#[derive(Debug, Default)]
pub struct CountingPipelineCache {
    created: AtomicU64,
}

impl CountingPipelineCache {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

impl PipelineCache for CountingPipelineCache {
    fn get_or_create_graphics(
        &self,
        _desc: &GraphicsPipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError> {
        let handle = self.created.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(ash::vk::Pipeline::from_raw(handle))
    }

    fn get_or_create_compute(
        &self,
        _desc: &ComputePipelineDesc,
    ) -> Result<ash::vk::Pipeline, DeviceError> {
        let handle = self.created.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(ash::vk::Pipeline::from_raw(handle))
    }
}

#[derive(Debug, Default)]
pub struct NullDescriptorSetCache;

impl DescriptorSetCache for NullDescriptorSetCache {
    fn get_or_allocate(
        &self,
        desc: &DescriptorSetDesc,
    ) -> Result<DescriptorSetLookup, DeviceError> {
        Ok(DescriptorSetLookup {
            descriptor_set: ash::vk::DescriptorSet::from_raw(u64::from(desc.set) + 1),
            newly_allocated: false,
        })
    }

    fn evict(&self, _descriptor_set: ash::vk::DescriptorSet) {}
}

/// Fails the first few allocations.
#[derive(Debug, Default)]
pub struct FlakyAllocator {
    failures_left: AtomicU32,
}

impl FlakyAllocator {
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::Relaxed);
    }
}

impl MemoryAllocator for FlakyAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<Allocation, OomError> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .is_ok();

        if failed {
            return Err(OomError::OutOfDeviceMemory);
        }

        Ok(Allocation {
            memory: ash::vk::DeviceMemory::null(),
            offset: 0,
            size: request.size,
            properties: request.required,
        })
    }
}

pub struct Harness {
    pub queue: Arc<RecordingQueue>,
    pub pipeline_cache: Arc<CountingPipelineCache>,
    pub allocator: Arc<FlakyAllocator>,
    pub device: Arc<Device>,
}

impl Harness {
    pub fn new() -> Self {
        let queue = Arc::new(RecordingQueue::default());
        let pipeline_cache = Arc::new(CountingPipelineCache::default());
        let allocator = Arc::new(FlakyAllocator::default());
        let device = Device::new(
            queue.clone(),
            pipeline_cache.clone(),
            Arc::new(NullDescriptorSetCache),
            allocator.clone(),
        );

        Harness {
            queue,
            pipeline_cache,
            allocator,
            device,
        }
    }

    pub fn context(&self) -> Context {
        self.context_with(ContextCreateInfo::default())
    }

    pub fn context_with(&self, create_info: ContextCreateInfo) -> Context {
        Context::new(self.device.clone(), create_info)
    }
}

pub fn buffer(size: DeviceSize) -> Arc<Buffer> {
    Arc::new(Buffer::new(ash::vk::Buffer::null(), size, false))
}

pub fn color_image() -> Arc<Image> {
    Arc::new(Image::new(
        ash::vk::Image::null(),
        ImageAspects::COLOR,
        [128, 128],
        1,
    ))
}

pub fn framebuffer(id: u64, color_attachments: &[Arc<Image>]) -> Framebuffer {
    Framebuffer {
        id: FramebufferId(id),
        color_attachments: color_attachments.iter().cloned().collect(),
        depth_stencil_attachment: None,
        extent: [128, 128],
        samples: 1,
        is_default: false,
    }
}

/// Installs a subscriber printing the debug events of the crate, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
