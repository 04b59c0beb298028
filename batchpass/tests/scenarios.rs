// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

mod common;

use ash::vk::Handle;
use batchpass::{
    command_stream::{Command, StreamKind},
    context::{BufferBinding, Context, StateChange, VertexBufferBinding},
    device::Semaphore,
    memory::{AllocationRequest, MemoryPropertyFlags, RetryStage},
    render_pass::{ClosureReason, Framebuffer, RenderArea, RenderPassState},
    resource::Buffer,
    sync::MemoryBarrierBits,
};
use common::{buffer, color_image, framebuffer, init_tracing, Harness, Submission};
use std::sync::Arc;

fn bind_framebuffer(context: &mut Context, framebuffer: Framebuffer) {
    context.state_mut().framebuffer = Some(framebuffer);
    context
        .notify_state_changed(StateChange::Framebuffer)
        .unwrap();
}

fn bind_storage_buffer(context: &mut Context, buffer: &Arc<Buffer>) {
    context
        .state_mut()
        .storage_buffers
        .push(BufferBinding::whole(buffer.clone()));
    context
        .notify_state_changed(StateChange::ShaderStorage)
        .unwrap();
}

fn position(commands: &[Command], predicate: impl Fn(&Command) -> bool) -> usize {
    commands
        .iter()
        .position(predicate)
        .expect("command was not submitted")
}

/// The streams of every batch, in submission order, must carry increasing serials.
fn assert_serials_increase(submissions: &[Submission]) {
    let serials: Vec<_> = submissions
        .iter()
        .flat_map(|submission| submission.streams.iter().map(|&(_, serial)| serial.serial))
        .collect();

    assert!(
        serials.windows(2).all(|pair| pair[0] < pair[1]),
        "stream serials out of order: {serials:?}",
    );

    for submission in submissions {
        if let Some(&(_, last)) = submission.streams.last() {
            assert_eq!(submission.queue_serial, last);
        }
    }
}

fn assert_one_render_pass_at_most(context: &Context) {
    let stats = context.stats();
    let opened = stats.render_passes_begun + stats.reactivations;

    assert_eq!(
        opened - stats.total_closures(),
        u64::from(context.render_pass().is_open()),
    );
    assert_eq!(
        context.render_pass().is_active(),
        context.render_pass().session().is_some(),
    );
}

#[test]
fn render_pass_write_then_outside_read() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();
    let written = buffer(1024);

    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    bind_storage_buffer(&mut context, &written);
    context.draw(3, 1, 0, 0).unwrap();
    assert!(context.render_pass().is_open());

    context.copy_buffer(&written, &buffer(1024), 1024).unwrap();
    assert_eq!(context.render_pass().state(), RenderPassState::Closed);

    let stats = context.stats();
    assert_eq!(stats.total_closures(), 1);
    assert_eq!(
        stats.closures(ClosureReason::BufferUseThenOutOfRenderPassRead),
        1,
    );

    context.finish().unwrap();
    let submissions = harness.queue.submissions();
    let commands = &submissions[0].commands;
    let draw = position(commands, |c| matches!(c, Command::Draw { .. }));
    let copy = position(commands, |c| matches!(c, Command::CopyBuffer { .. }));
    assert!(draw < copy);
    assert_serials_increase(&submissions);
}

#[test]
fn consecutive_draws_share_a_render_pass() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();

    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    context.draw(3, 1, 0, 0).unwrap();
    context.draw(3, 1, 0, 0).unwrap();
    context.finish().unwrap();

    let commands = &harness.queue.submissions()[0].commands;
    let begins = commands
        .iter()
        .filter(|c| matches!(c, Command::BeginRenderPass { .. }))
        .count();
    assert_eq!(begins, 1);
    assert_eq!(context.stats().render_passes_begun, 1);
}

#[test]
fn allocation_succeeds_after_waiting_for_the_device() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();

    context.copy_buffer(&buffer(64), &buffer(64), 64).unwrap();
    harness.allocator.fail_next(2);

    let request = AllocationRequest {
        size: 1 << 20,
        alignment: 256,
        required: MemoryPropertyFlags::DEVICE_LOCAL,
        preferred: MemoryPropertyFlags::empty(),
    };
    let (allocation, stage) = context.allocate(&request).unwrap();

    assert_eq!(stage, RetryStage::AfterFinish);
    assert_eq!(allocation.size, request.size);
    assert_eq!(harness.queue.waits(), 1);
    assert_eq!(harness.queue.submissions().len(), 1);
}

#[test]
fn memory_barrier_before_storage_draw() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();
    let storage = buffer(256);

    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    bind_storage_buffer(&mut context, &storage);
    context.draw(3, 1, 0, 0).unwrap();

    context
        .memory_barrier(MemoryBarrierBits::SHADER_STORAGE)
        .unwrap();
    context.draw(3, 1, 0, 0).unwrap();

    let stats = context.stats();
    assert_eq!(
        stats.closures(ClosureReason::MemoryBarrierThenStorageResource),
        1,
    );
    assert_eq!(stats.render_passes_begun, 2);
    assert!(context.render_pass().is_open());
}

#[test]
fn outside_write_is_submitted_before_render_pass_read() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();
    let vertices = buffer(1024);

    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    context.draw(3, 1, 0, 0).unwrap();

    context.copy_buffer(&buffer(1024), &vertices, 1024).unwrap();
    context.state_mut().vertex_buffers.push(VertexBufferBinding {
        buffer: vertices,
        offset: 0,
        stride: 12,
    });
    context
        .notify_state_changed(StateChange::VertexBuffers)
        .unwrap();
    context.draw(3, 1, 0, 0).unwrap();
    assert_eq!(context.stats().total_closures(), 0);

    context.finish().unwrap();
    let submissions = harness.queue.submissions();
    let submission = &submissions[0];
    assert_eq!(
        submission.streams.iter().map(|&(kind, _)| kind).collect::<Vec<_>>(),
        [StreamKind::OutsideRenderPass, StreamKind::RenderPass],
    );

    let copy = position(&submission.commands, |c| matches!(c, Command::CopyBuffer { .. }));
    let begin = position(&submission.commands, |c| {
        matches!(c, Command::BeginRenderPass { .. })
    });
    assert!(copy < begin);
    assert_serials_increase(&submissions);
}

#[test]
fn repeated_draws_record_only_the_draw() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();

    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    context.draw(3, 1, 0, 0).unwrap();
    let recorded = context.render_pass().stream().command_count();

    context.draw(3, 1, 0, 0).unwrap();
    let commands = context.render_pass().stream().commands();
    assert_eq!(commands.len(), recorded + 1);
    assert!(matches!(commands.last(), Some(Command::Draw { .. })));
    assert_eq!(harness.pipeline_cache.created(), 1);
}

#[test]
fn reactivation_requires_an_identical_render_pass() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();
    let target = color_image();

    bind_framebuffer(&mut context, framebuffer(1, &[target.clone()]));
    context.draw(3, 1, 0, 0).unwrap();
    bind_framebuffer(&mut context, framebuffer(1, &[target.clone()]));
    context.draw(3, 1, 0, 0).unwrap();
    assert_eq!(context.stats().reactivations, 1);

    bind_framebuffer(&mut context, framebuffer(1, &[target.clone()]));
    context.state_mut().render_area = Some(RenderArea {
        offset: [0, 0],
        extent: [64, 64],
    });
    context
        .notify_state_changed(StateChange::Scissor)
        .unwrap();
    context.draw(3, 1, 0, 0).unwrap();

    bind_framebuffer(&mut context, framebuffer(2, &[target]));
    context.draw(3, 1, 0, 0).unwrap();

    let stats = context.stats();
    assert_eq!(stats.reactivations, 1);
    assert_eq!(stats.render_passes_begun, 3);
}

#[test]
fn timestamp_query_prevents_reactivation() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();
    let fb = framebuffer(1, &[color_image()]);

    bind_framebuffer(&mut context, fb.clone());
    context.draw(3, 1, 0, 0).unwrap();
    context.write_timestamp(0).unwrap();
    assert_eq!(context.stats().closures(ClosureReason::TimestampQuery), 1);

    bind_framebuffer(&mut context, fb);
    context.draw(3, 1, 0, 0).unwrap();

    let stats = context.stats();
    assert_eq!(stats.reactivations, 0);
    assert_eq!(stats.render_passes_begun, 2);
}

#[test]
fn render_pass_serial_follows_reserved_outside_serials() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();

    context.clear_color_image(&color_image(), [1.0; 4]).unwrap();
    bind_framebuffer(&mut context, framebuffer(1, &[color_image()]));
    context.draw(3, 1, 0, 0).unwrap();

    for _ in 0..3 {
        context.clear_color_image(&color_image(), [0.0; 4]).unwrap();
        context.dispatch([1, 1, 1]).unwrap();
    }
    context.finish().unwrap();

    let submissions = harness.queue.submissions();
    assert_serials_increase(&submissions);

    let streams = &submissions[0].streams;
    let (kind, render_pass_serial) = *streams.last().unwrap();
    assert_eq!(kind, StreamKind::RenderPass);
    assert!(streams[..streams.len() - 1]
        .iter()
        .all(|&(kind, serial)| kind == StreamKind::OutsideRenderPass
            && serial.serial < render_pass_serial.serial));
}

#[test]
fn empty_flush_submits_only_for_semaphores() {
    init_tracing();
    let harness = Harness::new();
    let mut context = harness.context();

    context.flush().unwrap();
    context.flush().unwrap();
    assert!(harness.queue.submissions().is_empty());

    context
        .wait_semaphore(Semaphore::new(ash::vk::Semaphore::from_raw(1)))
        .unwrap();
    assert!(harness.queue.submissions().is_empty());
    context.flush().unwrap();
    assert_eq!(harness.queue.submissions().len(), 1);
    assert_eq!(harness.queue.submissions()[0].wait_semaphores, 1);

    context.flush().unwrap();
    assert_eq!(harness.queue.submissions().len(), 1);

    context
        .flush_and_signal(Semaphore::new(ash::vk::Semaphore::from_raw(2)))
        .unwrap();
    let submissions = harness.queue.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions[1].streams.is_empty());
}

/// A small deterministic generator, so that failures can be replayed.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        (self.0 >> 33) % bound
    }
}

#[test]
fn random_operations_keep_the_recording_invariants() {
    init_tracing();

    for seed in 0..8 {
        let harness = Harness::new();
        let mut context = harness.context();
        let mut rng = Lcg(seed);
        let buffers: Vec<_> = (0..4).map(|_| buffer(512)).collect();
        let images: Vec<_> = (0..2).map(|_| color_image()).collect();
        let framebuffers = [
            framebuffer(1, &[images[0].clone()]),
            framebuffer(2, &[images[1].clone()]),
        ];

        bind_framebuffer(&mut context, framebuffers[0].clone());
        bind_storage_buffer(&mut context, &buffers[0]);

        for _ in 0..64 {
            match rng.below(8) {
                0 | 1 => context.draw(3, 1, 0, 0).unwrap(),
                2 => {
                    let fb = framebuffers[rng.below(2) as usize].clone();
                    bind_framebuffer(&mut context, fb);
                }
                3 => {
                    let src = &buffers[rng.below(4) as usize];
                    let dst = &buffers[rng.below(4) as usize];
                    if !Arc::ptr_eq(src, dst) {
                        context.copy_buffer(src, dst, 512).unwrap();
                    }
                }
                4 => context.dispatch([4, 1, 1]).unwrap(),
                5 => context
                    .memory_barrier(MemoryBarrierBits::SHADER_STORAGE)
                    .unwrap(),
                6 => {
                    context.state_mut().vertex_buffers.clear();
                    context.state_mut().vertex_buffers.push(VertexBufferBinding {
                        buffer: buffers[rng.below(4) as usize].clone(),
                        offset: 0,
                        stride: 16,
                    });
                    context
                        .notify_state_changed(StateChange::VertexBuffers)
                        .unwrap();
                }
                _ => context.flush().unwrap(),
            }

            assert_one_render_pass_at_most(&context);
        }

        context.finish().unwrap();
        assert!(!context.render_pass().is_active());
        assert_serials_increase(&harness.queue.submissions());
    }
}
