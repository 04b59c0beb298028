// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Lazy state synchronization driven by dirty bits.
//!
//! Each category of state that has to be flushed to a command stream before a draw or dispatch
//! is represented by one dirty bit. State changes mark bits, and right before the draw or
//! dispatch the set bits are processed in ascending order by the handler registered for each of
//! them.
//!
//! A handler may ask for bits that come *after* its own to be processed in the same pass by
//! returning them. It can never schedule an earlier bit, which guarantees that processing
//! terminates. Two mechanisms make bits fire again without a state change:
//!
//! - *Persistent* bits aren't cleared when they are processed, so their handler runs before every
//!   draw or dispatch while they are persistent.
//! - *Restart* bits are marked again every time the command stream they record into is restarted,
//!   because the state they flush doesn't carry over to a new stream.

use crate::DeviceError;
use std::{fmt, iter::FusedIterator, marker::PhantomData};

/// A category of state, usable as a bit of [`DirtyBits`].
///
/// Implemented with the `dirty_bits!` macro, which numbers the variants in declaration order.
pub trait DirtyBit: Copy + Ord + fmt::Debug + 'static {
    /// Every bit, in processing order.
    const ALL: &'static [Self];

    /// Returns the position of the bit.
    fn index(self) -> u32;

    /// Returns the bit at `index`.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is out of range.
    fn from_index(index: u32) -> Self;
}

/// A set of dirty bits of one kind.
pub struct DirtyBits<B> {
    bits: u64,
    marker: PhantomData<B>,
}

impl<B: DirtyBit> DirtyBits<B> {
    /// Returns a set with no bits.
    #[inline]
    pub const fn empty() -> Self {
        DirtyBits {
            bits: 0,
            marker: PhantomData,
        }
    }

    /// Returns a set with every bit.
    #[inline]
    pub fn all() -> Self {
        debug_assert!(B::ALL.len() <= 64);

        DirtyBits {
            bits: u64::MAX >> (64 - B::ALL.len() as u32),
            marker: PhantomData,
        }
    }

    /// Returns a set containing only `bit`.
    #[inline]
    pub fn single(bit: B) -> Self {
        DirtyBits {
            bits: 1 << bit.index(),
            marker: PhantomData,
        }
    }

    /// Returns a set of the bits strictly after `bit`.
    #[inline]
    pub fn after(bit: B) -> Self {
        DirtyBits {
            bits: Self::all().bits & ((u64::MAX << bit.index()) << 1),
            marker: PhantomData,
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.bits.count_ones()
    }

    #[inline]
    pub fn contains(self, bit: B) -> bool {
        self.bits & (1 << bit.index()) != 0
    }

    #[inline]
    pub fn insert(&mut self, bit: B) {
        self.bits |= 1 << bit.index();
    }

    #[inline]
    pub fn remove(&mut self, bit: B) {
        self.bits &= !(1 << bit.index());
    }

    /// Returns the bit that is processed first.
    #[inline]
    pub fn first(self) -> Option<B> {
        (self.bits != 0).then(|| B::from_index(self.bits.trailing_zeros()))
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        DirtyBits {
            bits: self.bits | other.bits,
            marker: PhantomData,
        }
    }

    #[inline]
    pub const fn intersection(self, other: Self) -> Self {
        DirtyBits {
            bits: self.bits & other.bits,
            marker: PhantomData,
        }
    }

    #[inline]
    pub const fn difference(self, other: Self) -> Self {
        DirtyBits {
            bits: self.bits & !other.bits,
            marker: PhantomData,
        }
    }

    /// Iterates over the bits in processing order.
    #[inline]
    pub fn iter(self) -> DirtyBitsIter<B> {
        DirtyBitsIter { bits: self }
    }
}

impl<B> Clone for DirtyBits<B> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for DirtyBits<B> {}

impl<B> PartialEq for DirtyBits<B> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<B> Eq for DirtyBits<B> {}

impl<B: DirtyBit> Default for DirtyBits<B> {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl<B: DirtyBit> fmt::Debug for DirtyBits<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<B: DirtyBit> FromIterator<B> for DirtyBits<B> {
    fn from_iter<I: IntoIterator<Item = B>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |mut bits, bit| {
            bits.insert(bit);
            bits
        })
    }
}

impl<B: DirtyBit> From<B> for DirtyBits<B> {
    #[inline]
    fn from(bit: B) -> Self {
        Self::single(bit)
    }
}

impl<B: DirtyBit> std::ops::BitOr for DirtyBits<B> {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl<B: DirtyBit> std::ops::BitOrAssign for DirtyBits<B> {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl<B: DirtyBit> std::ops::BitAnd for DirtyBits<B> {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl<B: DirtyBit> std::ops::Sub for DirtyBits<B> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

/// Iterator over the bits of a [`DirtyBits`], in processing order.
pub struct DirtyBitsIter<B> {
    bits: DirtyBits<B>,
}

impl<B: DirtyBit> Iterator for DirtyBitsIter<B> {
    type Item = B;

    #[inline]
    fn next(&mut self) -> Option<B> {
        let bit = self.bits.first()?;
        self.bits.remove(bit);

        Some(bit)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.bits.count() as usize;

        (len, Some(len))
    }
}

impl<B: DirtyBit> ExactSizeIterator for DirtyBitsIter<B> {}

impl<B: DirtyBit> FusedIterator for DirtyBitsIter<B> {}

/// Flushes the state category `bit` of `C` into the command stream.
///
/// Returns the later bits that must also be processed before the draw or dispatch.
pub type Handler<C, B> = fn(&mut C, B) -> Result<DirtyBits<B>, DeviceError>;

/// A dispatch table from dirty bits to their handlers, and the bits currently dirty.
pub struct DirtyBitPipeline<C, B> {
    handlers: Vec<Option<Handler<C, B>>>,
    dirty: DirtyBits<B>,
    persistent: DirtyBits<B>,
    restart: DirtyBits<B>,
}

impl<C, B: DirtyBit> DirtyBitPipeline<C, B> {
    /// Creates a pipeline with no handler. Every bit starts dirty.
    pub fn new() -> Self {
        DirtyBitPipeline {
            handlers: vec![None; B::ALL.len()],
            dirty: DirtyBits::all(),
            persistent: DirtyBits::empty(),
            restart: DirtyBits::empty(),
        }
    }

    /// Registers the handler of `bit`, replacing the previous one.
    #[inline]
    pub fn with_handler(mut self, bit: B, handler: Handler<C, B>) -> Self {
        self.handlers[bit.index() as usize] = Some(handler);
        self
    }

    /// Sets the bits that are marked again whenever the command stream is restarted.
    #[inline]
    pub fn with_restart_bits(mut self, bits: DirtyBits<B>) -> Self {
        self.restart = bits;
        self
    }

    /// Returns whether `bit` has a handler.
    #[inline]
    pub fn has_handler(&self, bit: B) -> bool {
        self.handlers[bit.index() as usize].is_some()
    }

    #[inline]
    pub fn dirty(&self) -> DirtyBits<B> {
        self.dirty
    }

    #[inline]
    pub fn is_dirty(&self, bit: B) -> bool {
        self.dirty.contains(bit)
    }

    #[inline]
    pub fn persistent(&self) -> DirtyBits<B> {
        self.persistent
    }

    /// Marks `bit` as dirty.
    #[inline]
    pub fn mark(&mut self, bit: B) {
        self.dirty.insert(bit);
    }

    /// Marks every bit of `bits` as dirty.
    #[inline]
    pub fn mark_all(&mut self, bits: DirtyBits<B>) {
        self.dirty |= bits;
    }

    /// Clears `bit` without processing it.
    #[inline]
    pub fn clear(&mut self, bit: B) {
        if !self.persistent.contains(bit) {
            self.dirty.remove(bit);
        }
    }

    /// Makes `bit` persistent or not. A bit that becomes persistent is also marked.
    pub fn set_persistent(&mut self, bit: B, persistent: bool) {
        if persistent {
            self.persistent.insert(bit);
            self.dirty.insert(bit);
        } else {
            self.persistent.remove(bit);
        }
    }

    /// Marks the restart bits. Called when the command stream the pipeline records into is
    /// restarted.
    #[inline]
    pub fn on_command_stream_restart(&mut self) {
        self.dirty |= self.restart;
    }

    /// Processes the dirty bits of `mask` in ascending order.
    ///
    /// `pipeline` gives access to the pipeline that is stored in `context`. Each processed bit is
    /// cleared before its handler runs, unless it is persistent. Bits after the current one that
    /// get marked while processing, whether returned by a handler or marked directly, are
    /// processed in the same pass. If a handler fails, its bit and the bits that weren't
    /// processed yet are left dirty, and the error is returned.
    ///
    /// # Panics
    ///
    /// - Panics if a bit to process has no handler.
    /// - Panics if a handler schedules a bit that isn't after its own.
    pub fn process(
        context: &mut C,
        mask: DirtyBits<B>,
        pipeline: fn(&mut C) -> &mut Self,
    ) -> Result<(), DeviceError> {
        let mut remaining = mask;

        loop {
            let this = pipeline(context);
            let Some(bit) = (this.dirty & remaining).first() else {
                break;
            };
            remaining = remaining & DirtyBits::after(bit);

            let handler = this.handlers[bit.index() as usize]
                .unwrap_or_else(|| panic!("no handler is registered for dirty bit {:?}", bit));
            this.clear(bit);
            tracing::trace!(?bit, "processing dirty bit");

            let later = match handler(context, bit) {
                Ok(later) => later,
                Err(err) => {
                    pipeline(context).mark(bit);

                    return Err(err);
                }
            };

            assert!(
                (later - DirtyBits::after(bit)).is_empty(),
                "a dirty bit handler can only schedule later bits: {:?} scheduled {:?}",
                bit,
                later,
            );

            pipeline(context).mark_all(later);
        }

        Ok(())
    }
}

impl<C, B: DirtyBit> Default for DirtyBitPipeline<C, B> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<C, B: DirtyBit> fmt::Debug for DirtyBitPipeline<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyBitPipeline")
            .field("dirty", &self.dirty)
            .field("persistent", &self.persistent)
            .field("restart", &self.restart)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::dirty_bits;

    dirty_bits! {
        TestBit;

        Pipeline,
        Textures,
        Vertices,
        Barrier,
        Uniforms,
    }

    #[derive(Default)]
    struct Recorder {
        pipeline: DirtyBitPipeline<Recorder, TestBit>,
        processed: Vec<TestBit>,
        fail_textures: bool,
        textures_schedule_pipeline: bool,
    }

    fn pipeline(recorder: &mut Recorder) -> &mut DirtyBitPipeline<Recorder, TestBit> {
        &mut recorder.pipeline
    }

    fn record(recorder: &mut Recorder, bit: TestBit) -> Result<DirtyBits<TestBit>, DeviceError> {
        recorder.processed.push(bit);

        Ok(DirtyBits::empty())
    }

    fn pipeline_changed(
        recorder: &mut Recorder,
        bit: TestBit,
    ) -> Result<DirtyBits<TestBit>, DeviceError> {
        recorder.processed.push(bit);

        Ok(DirtyBits::single(TestBit::Uniforms))
    }

    fn textures(recorder: &mut Recorder, bit: TestBit) -> Result<DirtyBits<TestBit>, DeviceError> {
        if recorder.fail_textures {
            return Err(DeviceError::OutOfDeviceMemory);
        }

        recorder.processed.push(bit);

        if recorder.textures_schedule_pipeline {
            Ok(DirtyBits::single(TestBit::Pipeline))
        } else {
            Ok(DirtyBits::empty())
        }
    }

    fn recorder() -> Recorder {
        let mut recorder = Recorder {
            pipeline: DirtyBitPipeline::new()
                .with_handler(TestBit::Pipeline, pipeline_changed)
                .with_handler(TestBit::Textures, textures)
                .with_handler(TestBit::Vertices, record)
                .with_handler(TestBit::Barrier, record)
                .with_handler(TestBit::Uniforms, record)
                .with_restart_bits([TestBit::Vertices, TestBit::Uniforms].into_iter().collect()),
            ..Default::default()
        };
        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        recorder.processed.clear();

        recorder
    }

    #[test]
    fn bit_set_operations() {
        let bits: DirtyBits<TestBit> = [TestBit::Uniforms, TestBit::Textures].into_iter().collect();

        assert_eq!(bits.first(), Some(TestBit::Textures));
        assert_eq!(
            bits.iter().collect::<Vec<_>>(),
            [TestBit::Textures, TestBit::Uniforms],
        );
        assert_eq!(DirtyBits::<TestBit>::all().count(), 5);
        assert_eq!(
            DirtyBits::after(TestBit::Vertices).iter().collect::<Vec<_>>(),
            [TestBit::Barrier, TestBit::Uniforms],
        );
        assert!(DirtyBits::after(TestBit::Uniforms).is_empty());
    }

    #[test]
    fn processes_in_ascending_order() {
        let mut recorder = recorder();
        recorder.pipeline.mark(TestBit::Barrier);
        recorder.pipeline.mark(TestBit::Textures);

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Textures, TestBit::Barrier]);
        assert!(recorder.pipeline.dirty().is_empty());
    }

    #[test]
    fn later_bits_are_processed_in_the_same_pass() {
        let mut recorder = recorder();
        recorder.pipeline.mark(TestBit::Pipeline);

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Pipeline, TestBit::Uniforms]);
    }

    #[test]
    fn second_pass_does_nothing() {
        let mut recorder = recorder();
        recorder.pipeline.mark(TestBit::Pipeline);
        recorder.pipeline.mark(TestBit::Vertices);

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        recorder.processed.clear();

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert!(recorder.processed.is_empty());
    }

    #[test]
    fn bits_outside_the_mask_stay_dirty() {
        let mut recorder = recorder();
        recorder.pipeline.mark(TestBit::Textures);
        recorder.pipeline.mark(TestBit::Vertices);

        let mask = DirtyBits::single(TestBit::Vertices);
        DirtyBitPipeline::process(&mut recorder, mask, pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Vertices]);
        assert!(recorder.pipeline.is_dirty(TestBit::Textures));
    }

    #[test]
    fn persistent_bits_fire_every_pass() {
        let mut recorder = recorder();
        recorder.pipeline.set_persistent(TestBit::Barrier, true);

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Barrier, TestBit::Barrier]);

        recorder.pipeline.set_persistent(TestBit::Barrier, false);
        recorder.processed.clear();
        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Barrier]);
        assert!(!recorder.pipeline.is_dirty(TestBit::Barrier));
    }

    #[test]
    fn restart_rearms_bits() {
        let mut recorder = recorder();
        recorder.pipeline.on_command_stream_restart();

        DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        assert_eq!(recorder.processed, [TestBit::Vertices, TestBit::Uniforms]);
    }

    #[test]
    fn failed_handler_leaves_bits_dirty() {
        let mut recorder = recorder();
        recorder.fail_textures = true;
        recorder.pipeline.mark(TestBit::Textures);
        recorder.pipeline.mark(TestBit::Uniforms);

        assert_eq!(
            DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline),
            Err(DeviceError::OutOfDeviceMemory),
        );
        assert!(recorder.pipeline.is_dirty(TestBit::Textures));
        assert!(recorder.pipeline.is_dirty(TestBit::Uniforms));
        assert!(recorder.processed.is_empty());
    }

    #[test]
    fn scheduling_an_earlier_bit_panics() {
        let mut recorder = recorder();
        recorder.textures_schedule_pipeline = true;
        recorder.pipeline.mark(TestBit::Textures);

        assert_should_panic!("can only schedule later bits", {
            DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        });
    }

    #[test]
    fn missing_handler_panics() {
        let mut recorder = Recorder::default();

        assert_should_panic!("no handler is registered", {
            DirtyBitPipeline::process(&mut recorder, DirtyBits::all(), pipeline).unwrap();
        });
    }
}
