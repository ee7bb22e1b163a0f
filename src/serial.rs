//! Monotonic submission ordering: [`Serial`], [`QueueSerial`], [`SerialTracker`], [`ResourceUse`].

use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of independently-tracked serial streams (one per submission index, e.g.
/// per rendering context). Sized generously; indices beyond this panic on construction rather
/// than silently aliasing two contexts onto the same tracked slot.
pub const MAX_QUEUE_SERIAL_INDEX: usize = 16;

/// A monotonically increasing submission counter.
///
/// `Serial::ZERO` means "never submitted". `Serial::INFINITE` is used to force any comparison
/// against it to report "not yet complete" (used for counters not yet stamped) or, on the
/// completed side, "everything up to and including history is done" after a device-lost drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);
    pub const INFINITE: Serial = Serial(u64::MAX);

    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        Serial(value)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns the next serial in sequence. Panics on overflow; 2^64 submissions is not a
    /// real-world budget to plan for.
    #[inline]
    pub fn next(self) -> Serial {
        Serial(self.0.checked_add(1).expect("serial counter overflow"))
    }
}

impl From<u64> for Serial {
    fn from(value: u64) -> Self {
        Serial(value)
    }
}

/// An atomic, lock-free-readable `Serial`.
#[derive(Debug, Default)]
pub struct AtomicSerial(AtomicU64);

impl AtomicSerial {
    #[inline]
    pub fn new(initial: Serial) -> Self {
        AtomicSerial(AtomicU64::new(initial.raw()))
    }

    #[inline]
    pub fn load(&self) -> Serial {
        Serial(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, value: Serial) {
        self.0.store(value.raw(), Ordering::Release)
    }

    /// Atomically increments by one and returns the new value. A single `fetch_add`, not a
    /// separate load-then-store -- two threads calling this concurrently are guaranteed distinct
    /// results.
    #[inline]
    pub fn fetch_increment(&self) -> Serial {
        let previous = self.0.fetch_add(1, Ordering::AcqRel);
        Serial(previous.checked_add(1).expect("serial counter overflow"))
    }
}

/// `(index, serial)` pair identifying one submission on one serial stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueSerial {
    pub index: usize,
    pub serial: Serial,
}

impl QueueSerial {
    #[inline]
    pub const fn new(index: usize, serial: Serial) -> Self {
        QueueSerial { index, serial }
    }
}

/// Two index-addressable arrays of atomic serials: the last one stamped at submit time, and
/// the last one observed complete. Writers take the owning lock (`submit` / `complete` in
/// [`crate::queue::CommandQueue`]); readers go through here lock-free.
#[derive(Debug)]
pub struct SerialTracker {
    /// Next serial to hand out per index. Distinct from `last_submitted`: a serial is *reserved*
    /// here (under the submit lock) before its batch is built, but only becomes visible in
    /// `last_submitted` after the batch is pushed onto the in-flight ring (§4.3 step 7's ordering
    /// requirement: push-then-advance).
    reserved: Vec<AtomicSerial>,
    last_submitted: Vec<AtomicSerial>,
    last_completed: Vec<AtomicSerial>,
}

impl SerialTracker {
    pub fn new(index_count: usize) -> Self {
        assert!(
            index_count <= MAX_QUEUE_SERIAL_INDEX,
            "serial index count {} exceeds MAX_QUEUE_SERIAL_INDEX {}",
            index_count,
            MAX_QUEUE_SERIAL_INDEX
        );
        SerialTracker {
            reserved: (0..index_count).map(|_| AtomicSerial::default()).collect(),
            last_submitted: (0..index_count).map(|_| AtomicSerial::default()).collect(),
            last_completed: (0..index_count).map(|_| AtomicSerial::default()).collect(),
        }
    }

    #[inline]
    pub fn last_submitted(&self, index: usize) -> Serial {
        self.last_submitted[index].load()
    }

    #[inline]
    pub fn last_completed(&self, index: usize) -> Serial {
        self.last_completed[index].load()
    }

    /// Reserves and returns the next serial for `index`. Safe to call from multiple threads with
    /// no external lock: the reservation itself is a single atomic `fetch_add`, so two concurrent
    /// callers are guaranteed distinct, gapless serials even though neither holds `submit_lock`
    /// (`CommandQueue::submit_commands`/`submit_one_off`, and `CommandProcessor`'s enqueue path,
    /// all reserve before any lock is taken -- §5 explicitly allows concurrent callers on the same
    /// index). Does not publish to `last_submitted` -- callers must call `mark_submitted` once the
    /// batch has actually been pushed onto the in-flight ring.
    pub(crate) fn reserve_next(&self, index: usize) -> Serial {
        self.reserved[index].fetch_increment()
    }

    /// Publishes `serial` as submitted. Must be called after the owning batch is already visible
    /// in the in-flight ring, never before (§5 ordering guarantee 1).
    pub(crate) fn mark_submitted(&self, index: usize, serial: Serial) {
        debug_assert!(serial >= self.last_submitted[index].load());
        self.last_submitted[index].store(serial);
    }

    /// Must be called while holding the completion lock. `serial` must be monotonically
    /// non-decreasing per index; callers (the completion path) guarantee this because batches on
    /// one index are polled in submission order.
    pub(crate) fn set_completed(&self, index: usize, serial: Serial) {
        debug_assert!(serial >= self.last_completed[index].load());
        self.last_completed[index].store(serial);
    }

    /// Forces `index` to read as fully completed, used by the device-lost drain so that any
    /// resource still referencing this index's history is immediately considered finished.
    pub(crate) fn force_complete_all(&self, index: usize) {
        self.last_completed[index].store(Serial::INFINITE);
    }

    #[inline]
    pub fn is_submitted(&self, qs: QueueSerial) -> bool {
        qs.serial <= self.last_submitted(qs.index)
    }

    #[inline]
    pub fn is_finished(&self, qs: QueueSerial) -> bool {
        qs.serial <= self.last_completed(qs.index)
    }
}

/// The set of `QueueSerial`s that still reference a resource. In practice a resource is only
/// ever touched by a handful of serial streams at once, so this stays inline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceUse {
    serials: SmallVec<[QueueSerial; 4]>,
}

impl ResourceUse {
    pub fn new() -> Self {
        ResourceUse::default()
    }

    pub fn single(qs: QueueSerial) -> Self {
        let mut use_ = ResourceUse::new();
        use_.merge(qs);
        use_
    }

    /// Merges in another use of the same resource, keeping only the highest serial per index.
    pub fn merge(&mut self, qs: QueueSerial) {
        if let Some(existing) = self.serials.iter_mut().find(|s| s.index == qs.index) {
            if qs.serial > existing.serial {
                existing.serial = qs.serial;
            }
        } else {
            self.serials.push(qs);
        }
    }

    pub fn merge_use(&mut self, other: &ResourceUse) {
        for &qs in &other.serials {
            self.merge(qs);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = QueueSerial> + '_ {
        self.serials.iter().copied()
    }

    pub fn is_submitted(&self, tracker: &SerialTracker) -> bool {
        self.serials.iter().all(|&qs| tracker.is_submitted(qs))
    }

    pub fn is_finished(&self, tracker: &SerialTracker) -> bool {
        self.serials.iter().all(|&qs| tracker.is_finished(qs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_serial_starts_at_one() {
        assert_eq!(Serial::ZERO.next(), Serial::from_raw(1));
    }

    #[test]
    fn tracker_reserve_mark_and_complete() {
        let tracker = SerialTracker::new(2);
        assert_eq!(tracker.last_submitted(0), Serial::ZERO);
        let s1 = tracker.reserve_next(0);
        let s2 = tracker.reserve_next(0);
        assert_eq!(s1.raw(), 1);
        assert_eq!(s2.raw(), 2);
        // reserving does not publish
        assert_eq!(tracker.last_submitted(0), Serial::ZERO);
        tracker.mark_submitted(0, s1);
        tracker.mark_submitted(0, s2);
        assert_eq!(tracker.last_submitted(0), s2);
        assert_eq!(tracker.last_completed(0), Serial::ZERO);

        tracker.set_completed(0, s1);
        assert_eq!(tracker.last_completed(0), s1);
        assert!(tracker.is_finished(QueueSerial::new(0, s1)));
        assert!(!tracker.is_finished(QueueSerial::new(0, s2)));
    }

    #[test]
    fn force_complete_all_reads_as_infinite() {
        let tracker = SerialTracker::new(1);
        let s = tracker.reserve_next(0);
        tracker.mark_submitted(0, s);
        tracker.force_complete_all(0);
        assert_eq!(tracker.last_completed(0), Serial::INFINITE);
    }

    #[test]
    fn resource_use_merge_keeps_max_per_index() {
        let mut use_ = ResourceUse::new();
        use_.merge(QueueSerial::new(0, Serial::from_raw(3)));
        use_.merge(QueueSerial::new(0, Serial::from_raw(5)));
        use_.merge(QueueSerial::new(1, Serial::from_raw(1)));
        let serials: Vec<_> = use_.iter().collect();
        assert_eq!(serials.len(), 2);
        assert!(serials.contains(&QueueSerial::new(0, Serial::from_raw(5))));
    }

    #[test]
    fn resource_use_submitted_and_finished() {
        let tracker = SerialTracker::new(1);
        let s = tracker.reserve_next(0);
        tracker.mark_submitted(0, s);
        let use_ = ResourceUse::single(QueueSerial::new(0, s));
        assert!(use_.is_submitted(&tracker));
        assert!(!use_.is_finished(&tracker));
        tracker.set_completed(0, s);
        assert!(use_.is_finished(&tracker));
    }
}
