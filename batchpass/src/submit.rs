// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Handing ended command streams to the queue, and knowing when they have finished.
//!
//! Ended streams are not submitted right away: they accumulate in the [`SubmissionScheduler`]
//! until something requires them to reach the device. This is either an explicit request
//! (flush, finish, a semaphore that must be signaled) or one of the automatic triggers: too many
//! commands piling up while the device has nothing to do, or too much memory waiting in the
//! garbage for the work to finish.
//!
//! Submitted streams keep their resources alive until their queue serial completes. Objects that
//! are released while the device may still use them go to the [`SharedGarbageList`], and are
//! destroyed once every serial they were used at has completed.

use crate::{
    command_stream::RecordedStream,
    device::{Queue, Semaphore, SemaphoreWait, SubmitBatch},
    serial::{QueueSerial, QueueSerials, SerialFactory},
    DeviceError, DeviceSize,
};
use crossbeam_queue::SegQueue;
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

struct Garbage {
    used: QueueSerials,
    size: DeviceSize,
    // Never read, only dropped.
    _object: Box<dyn Any + Send + Sync>,
}

/// Objects waiting for the device to finish with them before they can be destroyed.
///
/// The list is shared between the contexts that use the same queue.
#[derive(Default)]
pub struct SharedGarbageList {
    queue: SegQueue<Garbage>,
    pending_size: AtomicU64,
}

impl SharedGarbageList {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `object` for destruction once every serial of `used` has completed. `size` is the
    /// amount of memory that destroying it frees.
    pub fn add(&self, used: QueueSerials, size: DeviceSize, object: impl Any + Send + Sync) {
        self.pending_size.fetch_add(size, Ordering::Relaxed);
        self.queue.push(Garbage {
            used,
            size,
            _object: Box::new(object),
        });
    }

    /// Returns the total size of the queued objects.
    #[inline]
    pub fn pending_size(&self) -> DeviceSize {
        self.pending_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Destroys the objects whose serials have all completed. Returns how many were destroyed.
    pub fn collect(&self, is_complete: impl Fn(QueueSerial) -> bool) -> usize {
        let mut destroyed = 0;

        // Objects pushed concurrently are left for the next collection.
        for _ in 0..self.queue.len() {
            let Some(garbage) = self.queue.pop() else {
                break;
            };

            if garbage.used.iter().all(&is_complete) {
                self.pending_size.fetch_sub(garbage.size, Ordering::Relaxed);
                destroyed += 1;
            } else {
                self.queue.push(garbage);
            }
        }

        destroyed
    }
}

impl std::fmt::Debug for SharedGarbageList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGarbageList")
            .field("len", &self.queue.len())
            .field("pending_size", &self.pending_size())
            .finish()
    }
}

/// Thresholds of the automatic submission triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitThresholds {
    /// Pending commands that are submitted early when the device is idle.
    pub max_commands_before_submit: usize,

    /// Garbage size above which pending work is submitted so that the garbage can be destroyed.
    pub pending_garbage_size_limit: DeviceSize,
}

/// Why work was submitted, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmitReason {
    Flush,
    Finish,
    IdleQueue,
    ExcessiveGarbage,
    SemaphoreSignal,
    ExternalRelease,
    HostAccess,
    ContextChange,
}

/// Counters of the scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    /// Batches handed to the queue.
    pub submissions: u64,

    /// Times the host blocked waiting for the device.
    pub waits: u64,
}

struct InFlight {
    queue_serial: QueueSerial,
    // Keeps the resources of the streams alive.
    _streams: Vec<RecordedStream>,
}

/// Accumulates ended command streams and submits them to the queue.
pub struct SubmissionScheduler {
    queue: Arc<dyn Queue>,
    garbage: Arc<SharedGarbageList>,
    thresholds: SubmitThresholds,

    pending: Vec<RecordedStream>,
    pending_command_count: usize,
    wait_semaphores: SmallVec<[SemaphoreWait; 2]>,

    in_flight: VecDeque<InFlight>,
    last_submitted: Option<QueueSerial>,

    stats: SubmissionStats,
}

impl SubmissionScheduler {
    pub fn new(
        queue: Arc<dyn Queue>,
        garbage: Arc<SharedGarbageList>,
        thresholds: SubmitThresholds,
    ) -> Self {
        SubmissionScheduler {
            queue,
            garbage,
            thresholds,
            pending: Vec::new(),
            pending_command_count: 0,
            wait_semaphores: SmallVec::new(),
            in_flight: VecDeque::new(),
            last_submitted: None,
            stats: SubmissionStats::default(),
        }
    }

    #[inline]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    #[inline]
    pub fn garbage(&self) -> &Arc<SharedGarbageList> {
        &self.garbage
    }

    #[inline]
    pub fn stats(&self) -> SubmissionStats {
        self.stats
    }

    /// Returns the number of commands in the streams waiting to be submitted.
    #[inline]
    pub fn pending_command_count(&self) -> usize {
        self.pending_command_count
    }

    /// Returns whether a submission would have anything to submit.
    #[inline]
    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty() || !self.wait_semaphores.is_empty()
    }

    /// Returns the serial of the last batch handed to the queue.
    #[inline]
    pub fn last_submitted(&self) -> Option<QueueSerial> {
        self.last_submitted
    }

    /// Returns whether the stream ended with `queue_serial` is waiting to be submitted.
    pub fn is_pending(&self, queue_serial: QueueSerial) -> bool {
        self.pending
            .iter()
            .any(|stream| stream.queue_serial() == queue_serial)
    }

    /// Queues an ended stream. Streams are submitted in the order they are queued.
    pub fn enqueue(&mut self, stream: RecordedStream) {
        debug_assert!(self.pending.last().is_none_or(|last| {
            last.queue_serial().index != stream.queue_serial().index
                || last.queue_serial().serial < stream.queue_serial().serial
        }));

        self.pending_command_count += stream.commands().len();
        self.pending.push(stream);
    }

    /// Makes the next submission wait for `wait`.
    #[inline]
    pub fn add_wait_semaphore(&mut self, wait: SemaphoreWait) {
        self.wait_semaphores.push(wait);
    }

    /// Returns the automatic trigger that requires pending work to be submitted now, if any.
    pub fn submit_trigger(&self) -> Option<SubmitReason> {
        if self.pending.is_empty() {
            return None;
        }

        if self.garbage.pending_size() >= self.thresholds.pending_garbage_size_limit {
            return Some(SubmitReason::ExcessiveGarbage);
        }

        if self.pending_command_count >= self.thresholds.max_commands_before_submit
            && self.is_queue_idle()
        {
            return Some(SubmitReason::IdleQueue);
        }

        None
    }

    /// Returns whether every submitted batch has completed.
    pub fn is_queue_idle(&self) -> bool {
        self.last_submitted
            .is_none_or(|queue_serial| self.queue.is_complete(queue_serial))
    }

    /// Submits the pending streams and semaphore waits as one batch, signaling `signal` if
    /// given.
    ///
    /// Nothing is submitted when there is nothing to execute, nothing to wait for and nothing to
    /// signal, and `None` is returned. Otherwise returns the serial of the batch. A batch without
    /// streams gets a new serial from `serials`.
    pub fn submit(
        &mut self,
        reason: SubmitReason,
        signal: Option<Semaphore>,
        serials: &SerialFactory,
    ) -> Result<Option<QueueSerial>, DeviceError> {
        if !self.has_pending_work() && signal.is_none() {
            return Ok(None);
        }

        let queue_serial = match self.pending.last() {
            Some(stream) => stream.queue_serial(),
            None => serials.generate(),
        };

        let batch = SubmitBatch {
            streams: &self.pending,
            wait_semaphores: &self.wait_semaphores,
            signal_semaphore: signal,
            queue_serial,
        };
        self.queue.submit(&batch)?;

        tracing::debug!(
            ?reason,
            serial = queue_serial.serial.get(),
            streams = self.pending.len(),
            commands = self.pending_command_count,
            "submitted",
        );

        self.in_flight.push_back(InFlight {
            queue_serial,
            _streams: std::mem::take(&mut self.pending),
        });
        self.pending_command_count = 0;
        self.wait_semaphores.clear();
        self.last_submitted = Some(queue_serial);
        self.stats.submissions += 1;

        self.cleanup();

        Ok(Some(queue_serial))
    }

    /// Blocks until `queue_serial` has completed. Returns immediately if it already has.
    ///
    /// # Panics
    ///
    /// - Panics if `queue_serial` hasn't been submitted.
    pub fn wait_for(&mut self, queue_serial: QueueSerial) -> Result<(), DeviceError> {
        assert!(
            !self.is_pending(queue_serial),
            "waited for a queue serial that was not submitted",
        );

        if self.queue.is_complete(queue_serial) {
            return Ok(());
        }

        tracing::debug!(serial = queue_serial.serial.get(), "waiting for the device");
        self.queue.wait_until_complete(queue_serial)?;
        self.stats.waits += 1;
        self.cleanup();

        Ok(())
    }

    /// Submits everything pending, then blocks until all submitted work has completed.
    pub fn finish(&mut self, serials: &SerialFactory) -> Result<(), DeviceError> {
        self.submit(SubmitReason::Finish, None, serials)?;

        if let Some(queue_serial) = self.last_submitted {
            self.wait_for(queue_serial)?;
        }

        Ok(())
    }

    /// Releases the streams that have finished executing, and destroys the garbage whose
    /// serials have completed. Doesn't block.
    pub fn cleanup(&mut self) -> usize {
        while let Some(in_flight) = self.in_flight.front() {
            if !self.queue.is_complete(in_flight.queue_serial) {
                break;
            }

            self.in_flight.pop_front();
        }

        let queue = &self.queue;

        self.garbage.collect(|queue_serial| queue.is_complete(queue_serial))
    }

    /// Drops everything pending or in flight without waiting. Used when the device is lost.
    pub fn abandon(&mut self) {
        let streams = self.pending.len() + self.in_flight.len();

        self.pending.clear();
        self.pending_command_count = 0;
        self.wait_semaphores.clear();
        self.in_flight.clear();

        tracing::warn!(streams, "dropped pending and in-flight work");
    }
}

impl std::fmt::Debug for SubmissionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionScheduler")
            .field("pending", &self.pending.len())
            .field("pending_command_count", &self.pending_command_count)
            .field("in_flight", &self.in_flight.len())
            .field("last_submitted", &self.last_submitted)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_stream::{Command, CommandStream, StreamKind},
        serial::SerialIndex,
        tests::MockQueue,
    };
    use ash::vk::Handle;

    const THRESHOLDS: SubmitThresholds = SubmitThresholds {
        max_commands_before_submit: 4,
        pending_garbage_size_limit: 1024,
    };

    fn scheduler() -> (Arc<MockQueue>, SubmissionScheduler, SerialFactory) {
        let queue = Arc::new(MockQueue::default());
        let scheduler = SubmissionScheduler::new(
            queue.clone(),
            Arc::new(SharedGarbageList::new()),
            THRESHOLDS,
        );

        (queue, scheduler, SerialFactory::new(SerialIndex(0)))
    }

    fn stream(serials: &SerialFactory, commands: usize) -> RecordedStream {
        let mut stream = CommandStream::new(StreamKind::OutsideRenderPass);
        stream.set_queue_serial(serials.generate());

        for _ in 0..commands {
            stream.record(Command::Dispatch {
                group_counts: [1, 1, 1],
            });
        }

        stream.end()
    }

    #[test]
    fn empty_flush_submits_nothing() {
        let (queue, mut scheduler, serials) = scheduler();

        assert_eq!(scheduler.submit(SubmitReason::Flush, None, &serials), Ok(None));
        assert_eq!(queue.submissions().len(), 0);
        assert_eq!(scheduler.stats().submissions, 0);
    }

    #[test]
    fn pending_semaphore_forces_submission() {
        let (queue, mut scheduler, serials) = scheduler();
        let semaphore = Semaphore::new(ash::vk::Semaphore::from_raw(1));
        scheduler.add_wait_semaphore(SemaphoreWait::all_commands(semaphore));

        let queue_serial = scheduler
            .submit(SubmitReason::Flush, None, &serials)
            .unwrap()
            .unwrap();
        assert_eq!(queue_serial, serials.last_generated());

        let submissions = queue.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].stream_count, 0);
        assert_eq!(submissions[0].wait_semaphore_count, 1);
        assert!(!scheduler.has_pending_work());
    }

    #[test]
    fn batch_serial_is_the_last_stream_serial() {
        let (queue, mut scheduler, serials) = scheduler();
        scheduler.enqueue(stream(&serials, 1));
        scheduler.enqueue(stream(&serials, 2));
        assert_eq!(scheduler.pending_command_count(), 3);

        let queue_serial = scheduler
            .submit(SubmitReason::Flush, None, &serials)
            .unwrap();
        assert_eq!(queue_serial, Some(serials.last_generated()));
        assert_eq!(queue.submissions()[0].stream_count, 2);
        assert_eq!(scheduler.pending_command_count(), 0);
    }

    #[test]
    fn idle_queue_trigger() {
        let (queue, mut scheduler, serials) = scheduler();
        scheduler.enqueue(stream(&serials, 4));
        assert_eq!(scheduler.submit_trigger(), Some(SubmitReason::IdleQueue));

        scheduler
            .submit(SubmitReason::IdleQueue, None, &serials)
            .unwrap();
        scheduler.enqueue(stream(&serials, 4));
        assert_eq!(scheduler.submit_trigger(), None);

        queue.complete_all();
        assert_eq!(scheduler.submit_trigger(), Some(SubmitReason::IdleQueue));
    }

    #[test]
    fn garbage_trigger_and_collection() {
        let (queue, mut scheduler, serials) = scheduler();
        let first = stream(&serials, 1);
        let mut used = QueueSerials::default();
        used.set(first.queue_serial());
        scheduler.enqueue(first);
        scheduler.garbage().add(used, 2048, vec![0u8; 16]);

        assert_eq!(
            scheduler.submit_trigger(),
            Some(SubmitReason::ExcessiveGarbage),
        );

        scheduler
            .submit(SubmitReason::ExcessiveGarbage, None, &serials)
            .unwrap();
        assert_eq!(scheduler.cleanup(), 0);
        assert_eq!(scheduler.garbage().pending_size(), 2048);

        queue.complete_all();
        assert_eq!(scheduler.cleanup(), 1);
        assert_eq!(scheduler.garbage().pending_size(), 0);
        assert!(scheduler.garbage().is_empty());
    }

    #[test]
    fn finish_waits_once() {
        let (queue, mut scheduler, serials) = scheduler();
        scheduler.enqueue(stream(&serials, 1));

        scheduler.finish(&serials).unwrap();
        assert_eq!(scheduler.stats().waits, 1);
        assert_eq!(queue.waits(), 1);
        assert!(scheduler.is_queue_idle());

        scheduler.finish(&serials).unwrap();
        assert_eq!(scheduler.stats().waits, 1);
    }

    #[test]
    fn failed_submission_keeps_work_pending() {
        let (queue, mut scheduler, serials) = scheduler();
        scheduler.enqueue(stream(&serials, 1));
        queue.fail_with(DeviceError::DeviceLost);

        assert_eq!(
            scheduler.submit(SubmitReason::Flush, None, &serials),
            Err(DeviceError::DeviceLost),
        );
        assert!(scheduler.has_pending_work());

        scheduler.abandon();
        assert!(!scheduler.has_pending_work());
    }
}
