// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Queue serials, the ordering tokens of submitted work.
//!
//! Every command stream is tagged with a [`QueueSerial`] when it starts recording. A serial is
//! scoped to a [`SerialIndex`], usually one per context, and serials of the same index are
//! strictly increasing in generation order. Asking the queue whether a serial has completed is
//! how the rest of the crate knows whether a resource is still in use by the device.
//!
//! The render pass stream must be ordered after any outside-render-pass stream that precedes it
//! in submission order, even though the render pass is opened first and the outside streams are
//! flushed while it stays open. To make that hold, a block of serials is reserved for the
//! outside-render-pass stream right before the render pass serial is generated. See
//! [`ReservedSerials`].

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// An ordering token on a single serial index. `Serial::ZERO` means "never used".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    /// The serial that precedes every generated serial.
    pub const ZERO: Serial = Serial(0);

    /// The serial that follows every generated serial.
    pub const INFINITE: Serial = Serial(u64::MAX);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Serial(value)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.0)
    }
}

/// The logical execution index a serial belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialIndex(pub u32);

impl SerialIndex {
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A serial together with the index it was generated on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueSerial {
    pub index: SerialIndex,
    pub serial: Serial,
}

impl QueueSerial {
    #[inline]
    pub const fn new(index: SerialIndex, serial: Serial) -> Self {
        QueueSerial { index, serial }
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.serial.is_valid()
    }
}

/// Generates serials for one index.
#[derive(Debug)]
pub struct SerialFactory {
    index: SerialIndex,
    // The last serial handed out, either directly or as part of a reservation.
    last: AtomicU64,
}

impl SerialFactory {
    pub fn new(index: SerialIndex) -> Self {
        SerialFactory {
            index,
            last: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn index(&self) -> SerialIndex {
        self.index
    }

    /// Generates the next serial.
    pub fn generate(&self) -> QueueSerial {
        let value = self.last.fetch_add(1, Ordering::Relaxed) + 1;

        QueueSerial::new(self.index, Serial(value))
    }

    /// Reserves `count` consecutive serials. Every serial generated afterwards is greater than
    /// all of the reserved ones.
    pub fn reserve(&self, count: u64) -> ReservedSerials {
        let first = self.last.fetch_add(count, Ordering::Relaxed) + 1;

        ReservedSerials {
            index: self.index,
            next: first,
            end: first + count,
        }
    }

    /// Returns the most recently generated serial.
    #[inline]
    pub fn last_generated(&self) -> QueueSerial {
        QueueSerial::new(self.index, Serial(self.last.load(Ordering::Relaxed)))
    }
}

/// A block of serials reserved ahead of time for the outside-render-pass stream.
///
/// Exhausting the block doesn't wrap and doesn't fall back to the factory: the caller must close
/// the render pass and reserve a new block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedSerials {
    index: SerialIndex,
    next: u64,
    end: u64,
}

impl ReservedSerials {
    /// A reservation without any serials left in it.
    pub const fn empty(index: SerialIndex) -> Self {
        ReservedSerials {
            index,
            next: 0,
            end: 0,
        }
    }

    /// Takes the next reserved serial, or `None` if the block is used up.
    pub fn generate(&mut self) -> Option<QueueSerial> {
        if self.next >= self.end {
            return None;
        }

        let serial = Serial(self.next);
        self.next += 1;

        Some(QueueSerial::new(self.index, serial))
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// The last serial a resource was used at, for every serial index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSerials {
    serials: SmallVec<[Serial; 4]>,
}

impl QueueSerials {
    /// Records a use at `queue_serial`. Uses are never rewound to an earlier serial.
    pub fn set(&mut self, queue_serial: QueueSerial) {
        let index = queue_serial.index.as_usize();

        if self.serials.len() <= index {
            self.serials.resize(index + 1, Serial::ZERO);
        }

        if self.serials[index] < queue_serial.serial {
            self.serials[index] = queue_serial.serial;
        }
    }

    /// Merges in every use of `other`.
    pub fn merge(&mut self, other: &QueueSerials) {
        for (index, &serial) in other.serials.iter().enumerate() {
            self.set(QueueSerial::new(SerialIndex(index as u32), serial));
        }
    }

    /// Returns the last serial of `index`, or `Serial::ZERO` if never used there.
    #[inline]
    pub fn get(&self, index: SerialIndex) -> Serial {
        self.serials
            .get(index.as_usize())
            .copied()
            .unwrap_or(Serial::ZERO)
    }

    /// Returns whether the resource was used by the stream tagged with `queue_serial`.
    #[inline]
    pub fn used_by(&self, queue_serial: QueueSerial) -> bool {
        queue_serial.is_valid() && self.get(queue_serial.index) == queue_serial.serial
    }

    /// Iterates over every valid serial.
    pub fn iter(&self) -> impl Iterator<Item = QueueSerial> + '_ {
        self.serials
            .iter()
            .enumerate()
            .filter(|(_, serial)| serial.is_valid())
            .map(|(index, &serial)| QueueSerial::new(SerialIndex(index as u32), serial))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Hands out serial indices to contexts that share a queue.
#[derive(Debug, Default)]
pub struct SerialIndexAllocator {
    used: Mutex<Vec<bool>>,
}

impl SerialIndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest free index.
    pub fn allocate(&self) -> SerialIndex {
        let mut used = self.used.lock();

        match used.iter().position(|&in_use| !in_use) {
            Some(index) => {
                used[index] = true;
                SerialIndex(index as u32)
            }
            None => {
                used.push(true);
                SerialIndex(used.len() as u32 - 1)
            }
        }
    }

    /// Returns an index to the pool.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is not currently allocated.
    pub fn release(&self, index: SerialIndex) {
        let mut used = self.used.lock();
        let slot = used
            .get_mut(index.as_usize())
            .filter(|in_use| **in_use)
            .expect("released a serial index that was not allocated");
        *slot = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_serials_are_strictly_increasing() {
        let factory = SerialFactory::new(SerialIndex(0));
        let a = factory.generate();
        let b = factory.generate();
        let c = factory.generate();

        assert!(a.serial < b.serial);
        assert!(b.serial < c.serial);
        assert_eq!(factory.last_generated(), c);
    }

    #[test]
    fn reserved_block_precedes_later_serials() {
        let factory = SerialFactory::new(SerialIndex(2));
        let mut reserved = factory.reserve(3);
        let render_pass = factory.generate();

        let mut outside = Vec::new();
        while let Some(serial) = reserved.generate() {
            outside.push(serial);
        }

        assert_eq!(outside.len(), 3);
        assert!(outside.iter().all(|s| s.serial < render_pass.serial));
        assert!(outside.windows(2).all(|w| w[0].serial < w[1].serial));
        assert!(reserved.is_empty());
        assert_eq!(reserved.generate(), None);
    }

    #[test]
    fn queue_serials_never_rewind() {
        let mut serials = QueueSerials::default();
        serials.set(QueueSerial::new(SerialIndex(1), Serial::new(5)));
        serials.set(QueueSerial::new(SerialIndex(1), Serial::new(3)));

        assert_eq!(serials.get(SerialIndex(1)), Serial::new(5));
        assert_eq!(serials.get(SerialIndex(0)), Serial::ZERO);
        assert!(serials.used_by(QueueSerial::new(SerialIndex(1), Serial::new(5))));
        assert!(!serials.used_by(QueueSerial::new(SerialIndex(1), Serial::new(3))));
        assert_eq!(serials.iter().count(), 1);
    }

    #[test]
    fn index_allocator_reuses_released_indices() {
        let allocator = SerialIndexAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert_ne!(a, b);

        allocator.release(a);
        assert_eq!(allocator.allocate(), a);
    }

    #[test]
    fn releasing_unallocated_index_panics() {
        let allocator = SerialIndexAllocator::new();

        assert_should_panic!("not allocated", {
            allocator.release(SerialIndex(4));
        });
    }
}
