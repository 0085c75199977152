//! # Concurrent Slot Table
//!
//! Registry that publishes objects under opaque [`Handle`]s for lookup from
//! any thread.
//!
//! ## Storage
//!
//! Slots live in fixed-size chunks of `CHUNK` records. A chunk is allocated
//! once and never moved, so references into it stay valid for the table's
//! lifetime. Chunk pointers live in a two-level directory: a fixed array of
//! `SEGMENTS` segment pointers, where segment `s` holds `2^s` chunk
//! pointers and is allocated the first time a chunk lands in it. An empty
//! table owns no directory memory, and the directory never exceeds twice
//! the number of chunks in use.
//!
//! Growing the table fills the next directory entry under a short lock and
//! then publishes the new capacity with release ordering. Readers load the
//! capacity with acquire ordering and index into published chunks without
//! locking.
//!
//! ```text
//!  segments: [ s0 ][ s1 ][ s2 ][ null ] ...
//!              │     │     └──▶ [ chunk 3 ][ chunk 4 ][ chunk 5 ][ chunk 6 ]
//!              │     └────────▶ [ chunk 1 ][ chunk 2 ]
//!              └──────────────▶ [ chunk 0 ]
//! ```
//!
//! ## Slot lifecycle
//!
//! 1. **Claim**: pop a free slot (or take the next fresh index, growing if
//!    needed), bind the occupant, mint a new stamp, publish the count.
//! 2. **Lookup**: acquire a shared reference, *then* re-check the stamp.
//!    Checking first and acquiring second would let a slot be erased and
//!    reused in between, handing out the new occupant for an old handle.
//! 3. **Erase**: take the count exclusively, re-check the stamp, bump the
//!    stamp so every outstanding handle goes stale, unbind the occupant,
//!    free the count, push the slot onto the free list.
//!
//! ## Stamps
//!
//! A stamp is a CRC-16 over the table salt, the occupant address, the slot's
//! reuse counter, the slot index, and the caller payload. A fresh stamp is
//! never equal to the one issued for the slot's previous occupant.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::checksum;
use crate::config::{Mode, SlotTableConfig};
use crate::free_list::{FreeList, FreeNode, NIL};
use crate::handle::{Handle, MAX_INDEX};
use crate::refcount::{Exclusive, RefCount, SlotRef};

/// Default number of slots per chunk.
pub const DEFAULT_CHUNK: usize = 64;

/// Number of directory segments. Chunk numbers never exceed `MAX_INDEX`,
/// and segment `s` covers chunks `2^s - 1 .. 2^(s+1) - 1`.
const SEGMENTS: usize = 32;

/// Split a chunk number into its segment and the offset inside it.
fn locate(chunk_no: usize) -> (usize, usize) {
    let biased = chunk_no + 1;
    let segment = biased.ilog2() as usize;
    (segment, biased - (1 << segment))
}

/// Source of per-table salts.
static NEXT_SALT: AtomicU64 = AtomicU64::new(SALT_STEP);

/// Odd 64-bit golden-ratio constant, so consecutive salts differ in many bits.
const SALT_STEP: u64 = 0x9E37_79B9_7F4A_7C15;

fn next_salt() -> u64 {
    NEXT_SALT.fetch_add(SALT_STEP, Ordering::Relaxed)
}

// ============================================================================
// Slot record
// ============================================================================

/// One permanently indexed storage location.
struct Slot<T> {
    /// Reference count; the sole arbiter of who may touch the occupant.
    count: RefCount,
    /// Occupant, null while free.
    item: AtomicPtr<T>,
    /// Number of times this slot has been claimed.
    reuse: AtomicU32,
    /// Stamp issued to the current occupant, or the bumped stamp while free.
    stamp: AtomicU16,
    /// Payload supplied with the current occupant.
    payload: AtomicU16,
    /// Permanent index.
    index: u32,
    /// Free-list link.
    next_free: AtomicU32,
}

impl<T> Slot<T> {
    fn new(index: u32) -> Self {
        Self {
            count: RefCount::new(),
            item: AtomicPtr::new(ptr::null_mut()),
            reuse: AtomicU32::new(0),
            stamp: AtomicU16::new(0),
            payload: AtomicU16::new(0),
            index,
            next_free: AtomicU32::new(NIL),
        }
    }

    fn stamp_matches(&self, stamp: u16) -> bool {
        self.stamp.load(Ordering::Acquire) == stamp
    }
}

impl<T> FreeNode for Slot<T> {
    fn free_index(&self) -> u32 {
        self.index
    }

    fn free_link(&self) -> &AtomicU32 {
        &self.next_free
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Operation counters of a table.
#[derive(Debug, Default)]
pub struct SlotTableStats {
    /// Successful inserts.
    pub inserts: AtomicU64,
    /// Inserts refused because the table was full.
    pub failed_inserts: AtomicU64,
    /// Successful erases.
    pub erases: AtomicU64,
    /// Rejected erases (stale handle, contention, outstanding accessors).
    pub failed_erases: AtomicU64,
    /// Chunks allocated.
    pub growths: AtomicU64,
}

/// Point-in-time copy of [`SlotTableStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful inserts.
    pub inserts: u64,
    /// Inserts refused because the table was full.
    pub failed_inserts: u64,
    /// Successful erases.
    pub erases: u64,
    /// Rejected erases.
    pub failed_erases: u64,
    /// Chunks allocated.
    pub growths: u64,
}

impl SlotTableStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            failed_inserts: self.failed_inserts.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
            failed_erases: self.failed_erases.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Table
// ============================================================================

/// Concurrent handle-based registry of borrowed objects.
///
/// The table stores `&'a T`; it never owns or drops its occupants. See
/// [`OwningSlotTable`](crate::OwningSlotTable) for the owning variant.
///
/// `CHUNK` is the number of slots allocated at a time and must be a power of
/// two.
pub struct SlotTable<'a, T, const CHUNK: usize = DEFAULT_CHUNK> {
    /// Chunk directory segments; see [`locate`].
    segments: [AtomicPtr<AtomicPtr<Slot<T>>>; SEGMENTS],
    /// Number of slots in published chunks, clamped to `max_capacity`.
    capacity: AtomicU32,
    /// One past the highest index ever claimed.
    next_index: AtomicU32,
    /// Hard limit on slots.
    max_capacity: u32,
    /// Released slots, reused before fresh ones.
    free: FreeList,
    /// Serialises fresh-index claims and chunk allocation.
    grow_lock: Mutex<()>,
    /// Occupied slots.
    live: AtomicUsize,
    mode: Mode,
    salt: u64,
    stats: SlotTableStats,
    /// Set once the capacity warning has been logged.
    warned_full: AtomicBool,
    _marker: PhantomData<&'a T>,
}

impl<'a, T, const CHUNK: usize> SlotTable<'a, T, CHUNK> {
    /// Create a strict table holding at most `max_capacity` occupants.
    ///
    /// Capacities above the largest encodable index are clamped.
    pub fn new(max_capacity: u32) -> Self {
        Self::with_mode(max_capacity, Mode::Strict)
    }

    /// Create a relaxed table.
    ///
    /// Erase succeeds whenever the slot is alive, even while another thread
    /// holds an accessor to the occupant. Accessors from this table are not
    /// reference counted. Occupants are borrowed for `'a`, so this never
    /// dangles, but a reader may keep using an occupant after it has been
    /// erased and its slot reused.
    pub fn relaxed(max_capacity: u32) -> Self {
        Self::with_mode(max_capacity, Mode::Relaxed)
    }

    /// Create a table with an explicit deletion policy.
    pub fn with_mode(max_capacity: u32, mode: Mode) -> Self {
        Self::build(max_capacity, mode, next_salt())
    }

    /// Create a table from a configuration.
    pub fn with_config(config: &SlotTableConfig) -> Self {
        Self::build(
            config.max_capacity,
            config.mode,
            config.salt.unwrap_or_else(next_salt),
        )
    }

    fn build(max_capacity: u32, mode: Mode, salt: u64) -> Self {
        const { assert!(CHUNK.is_power_of_two(), "CHUNK must be a power of two") };

        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            capacity: AtomicU32::new(0),
            next_index: AtomicU32::new(0),
            max_capacity: max_capacity.min(MAX_INDEX),
            free: FreeList::new(),
            grow_lock: Mutex::new(()),
            live: AtomicUsize::new(0),
            mode,
            salt,
            stats: SlotTableStats::default(),
            warned_full: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Publish `item` and return its handle with an accessor to it.
    ///
    /// Returns `None` only when all `max_capacity` slots are occupied.
    pub fn insert(&self, item: &'a T, payload: u16) -> Option<(Handle, SlotRef<'_, T>)> {
        self.insert_with(payload, || NonNull::from(item))
    }

    /// Resolve `handle` to an accessor.
    ///
    /// Returns `None` for the null handle, out-of-range indices, erased or
    /// reused slots, and stamps that were never issued.
    ///
    /// An insert is visible to every lookup that starts after it returns,
    /// with one transient exception: while any erase holds the slot
    /// exclusively, lookups of its occupant fail. That includes an erase
    /// through a stale handle for the slot's previous occupant, which can
    /// win the exclusive hold before its stamp re-check rejects it and
    /// releases the slot.
    pub fn lookup(&self, handle: Handle) -> Option<SlotRef<'_, T>> {
        let stamp = handle.stamp();
        let found = self
            .resolve(handle)
            .filter(|slot| slot.stamp_matches(stamp))
            .and_then(|slot| self.pin(slot, Some(stamp)))
            .map(|(_, accessor)| accessor);
        if found.is_none() {
            trace!("lookup rejected for handle {}", handle);
        }
        found
    }

    /// Whether `handle` currently refers to an occupant.
    pub fn contains(&self, handle: Handle) -> bool {
        self.lookup(handle).is_some()
    }

    /// Remove the occupant referenced by `handle`.
    ///
    /// Returns `false` without saying why if the handle is stale or invalid,
    /// if another thread is erasing or has erased the slot, or (strict mode)
    /// if any accessor to the occupant is still alive. "Another thread is
    /// erasing" includes a stale-handle erase momentarily holding the slot,
    /// as described on [`SlotTable::lookup`].
    pub fn erase(&self, handle: Handle) -> bool {
        self.erase_with(handle, |_| {})
    }

    /// Visit every occupant live at the moment its slot is visited.
    ///
    /// Slots are visited once, in index order, over the range claimed so far.
    /// Concurrent inserts and erases may or may not be observed.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Handle, SlotRef<'_, T>),
    {
        for index in 0..self.visit_end() {
            let slot = self.slot_at(index);
            if let Some((stamp, accessor)) = self.pin(slot, None) {
                let payload = slot.payload.load(Ordering::Relaxed);
                f(Handle::compose(index, payload, stamp), accessor);
            }
        }
    }

    /// Erase every occupant that can be erased at the moment it is visited.
    ///
    /// Returns the number of occupants removed. In strict mode, occupants
    /// with outstanding accessors are skipped.
    pub fn erase_all(&self) -> usize {
        self.drain_with(|_| {})
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots allocated so far.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Hard limit on the number of slots.
    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// Deletion policy.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Operation counters.
    pub fn stats(&self) -> &SlotTableStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Raw paths shared with the owning table
    // ------------------------------------------------------------------------

    /// Claim a slot, bind the pointer produced by `make`, and publish it.
    ///
    /// `make` runs after the slot is claimed and before it becomes visible.
    /// If it panics, the slot goes back to the free list.
    pub(crate) fn insert_with<F>(&self, payload: u16, make: F) -> Option<(Handle, SlotRef<'_, T>)>
    where
        F: FnOnce() -> NonNull<T>,
    {
        let Some(claim) = self.claim() else {
            self.stats.failed_inserts.fetch_add(1, Ordering::Relaxed);
            if !self.warned_full.swap(true, Ordering::Relaxed) {
                warn!(
                    max_capacity = self.max_capacity,
                    "slot table full, refusing insert"
                );
            }
            return None;
        };

        let item = make();
        let slot = claim.commit();

        let reuse = slot.reuse.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let previous = slot.stamp.load(Ordering::Relaxed);
        let stamp = self.mint_stamp(slot, item, reuse, payload, previous);

        slot.item.store(item.as_ptr(), Ordering::Relaxed);
        slot.payload.store(payload, Ordering::Relaxed);
        slot.stamp.store(stamp, Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);

        let accessor = match self.mode {
            Mode::Strict => {
                // Publish with the caller's reference already counted, so a
                // concurrent erase_all cannot remove the slot before the
                // accessor exists.
                slot.count.publish_shared();
                // Safety: the occupant stays bound until the count can be
                // taken exclusively, which requires this reference to drop.
                unsafe { SlotRef::adopt(item, &slot.count) }
            }
            Mode::Relaxed => {
                slot.count.publish();
                // Safety: relaxed tables only hold pointers valid for 't
                // (borrowed `&'a T`, or owned through an unsafe constructor).
                unsafe { SlotRef::uncounted(item) }
            }
        };

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Some((Handle::compose(slot.index, payload, stamp), accessor))
    }

    /// Erase the occupant of `handle`, running `on_erase` on it while the
    /// slot is still held exclusively.
    pub(crate) fn erase_with<F>(&self, handle: Handle, on_erase: F) -> bool
    where
        F: FnOnce(NonNull<T>),
    {
        let erased = self.try_erase(handle, on_erase);
        if erased {
            self.stats.erases.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed_erases.fetch_add(1, Ordering::Relaxed);
            trace!("erase rejected for handle {}", handle);
        }
        erased
    }

    /// Erase everything erasable, passing each occupant to `on_erase`.
    pub(crate) fn drain_with<F>(&self, mut on_erase: F) -> usize
    where
        F: FnMut(NonNull<T>),
    {
        let mut erased = 0;
        for index in 0..self.visit_end() {
            let slot = self.slot_at(index);
            if !slot.count.is_alive() {
                continue;
            }
            let handle = Handle::compose(
                index,
                slot.payload.load(Ordering::Relaxed),
                slot.stamp.load(Ordering::Acquire),
            );
            // Slots held by accessors are skipped, not counted as failures.
            if self.try_erase(handle, |item| on_erase(item)) {
                erased += 1;
            }
        }
        self.stats.erases.fetch_add(erased as u64, Ordering::Relaxed);
        erased
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn try_erase<F>(&self, handle: Handle, on_erase: F) -> bool
    where
        F: FnOnce(NonNull<T>),
    {
        let Some(slot) = self.resolve(handle) else {
            return false;
        };
        let stamp = handle.stamp();
        if !slot.stamp_matches(stamp) {
            return false;
        }

        let Some(exclusive) = slot.count.try_exclusive() else {
            return false;
        };
        // The slot may have been erased and reclaimed between the first
        // check and the exclusive acquisition. Until the guard drops, the
        // new occupant is unreachable through its valid handle.
        if !slot.stamp_matches(stamp) {
            return false;
        }

        slot.stamp.store(stamp.wrapping_add(1), Ordering::Release);
        let item = slot.item.swap(ptr::null_mut(), Ordering::Relaxed);

        // Frees the slot even if `on_erase` unwinds.
        let _reclaim = Reclaim {
            table: self,
            slot,
            exclusive: Some(exclusive),
        };
        if let Some(item) = NonNull::new(item) {
            on_erase(item);
        }
        true
    }

    /// Take a shared hold on `slot` and build an accessor.
    ///
    /// With `expected` set, the stamp is re-validated *after* the hold is
    /// taken. Returns the stamp observed under the hold.
    fn pin<'t>(&'t self, slot: &'t Slot<T>, expected: Option<u16>) -> Option<(u16, SlotRef<'t, T>)> {
        match self.mode {
            Mode::Strict => {
                if !slot.count.try_acquire_shared() {
                    return None;
                }
                let stamp = slot.stamp.load(Ordering::Acquire);
                let item = NonNull::new(slot.item.load(Ordering::Acquire));
                match item {
                    Some(item) if expected.is_none_or(|e| e == stamp) => {
                        // Safety: the hold taken above keeps the occupant bound.
                        Some((stamp, unsafe { SlotRef::adopt(item, &slot.count) }))
                    }
                    _ => {
                        slot.count.release_shared();
                        None
                    }
                }
            }
            Mode::Relaxed => {
                if !slot.count.is_alive() {
                    return None;
                }
                let stamp = slot.stamp.load(Ordering::Acquire);
                let item = NonNull::new(slot.item.load(Ordering::Acquire))?;
                if !slot.stamp_matches(stamp) || expected.is_some_and(|e| e != stamp) {
                    return None;
                }
                // Safety: relaxed occupants are valid for 't by construction.
                Some((stamp, unsafe { SlotRef::uncounted(item) }))
            }
        }
    }

    fn mint_stamp(&self, slot: &Slot<T>, item: NonNull<T>, reuse: u32, payload: u16, previous: u16) -> u16 {
        let mut crc = checksum::fold_value(0, &self.salt);
        crc = checksum::fold_value(crc, &(item.as_ptr() as usize));
        crc = checksum::fold_value(crc, &reuse);
        crc = checksum::fold_value(crc, &slot.index);
        crc = checksum::fold_value(crc, &payload);

        // `previous` is the bumped stamp of the last occupant.
        if crc == previous.wrapping_sub(1) {
            crc ^= 0x8001;
        }
        crc
    }

    /// Decode and bounds-check the index of `handle`.
    fn resolve(&self, handle: Handle) -> Option<&Slot<T>> {
        let index = handle.index()?;
        if index >= self.capacity.load(Ordering::Acquire) {
            return None;
        }
        Some(self.slot_at(index))
    }

    /// Exclusive end of the index range worth visiting.
    fn visit_end(&self) -> u32 {
        self.next_index
            .load(Ordering::Acquire)
            .min(self.capacity.load(Ordering::Acquire))
    }

    /// Slot record at `index`, which must be below the published capacity.
    fn slot_at(&self, index: u32) -> &Slot<T> {
        debug_assert!(index < self.capacity.load(Ordering::Acquire));
        let (segment, offset) = locate(index as usize / CHUNK);
        let entries = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!entries.is_null());
        // Safety: capacity is published after the segment and chunk
        // pointers, so every index below it lies in a live chunk of a live
        // segment. Neither is freed before the table itself.
        unsafe {
            let chunk = (*entries.add(offset)).load(Ordering::Acquire);
            debug_assert!(!chunk.is_null());
            &*chunk.add(index as usize % CHUNK)
        }
    }

    /// Take a free slot, or a fresh one, growing storage if needed.
    fn claim(&self) -> Option<Claim<'_, T>> {
        if let Some(slot) = self.free.pop(|index| self.slot_at(index)) {
            return Some(Claim::new(&self.free, slot));
        }

        let guard = self.grow_lock.lock();
        let index = self.next_index.load(Ordering::Relaxed);
        if index >= self.max_capacity {
            drop(guard);
            // A slot may have been released since the first attempt.
            let slot = self.free.pop(|index| self.slot_at(index))?;
            return Some(Claim::new(&self.free, slot));
        }

        if index >= self.capacity.load(Ordering::Relaxed) {
            self.grow(index as usize / CHUNK);
        }
        self.next_index.store(index + 1, Ordering::Release);
        drop(guard);

        Some(Claim::new(&self.free, self.slot_at(index)))
    }

    /// Allocate and publish chunk `chunk_no`. Caller holds `grow_lock`.
    fn grow(&self, chunk_no: usize) {
        let base = chunk_no * CHUNK;
        let chunk: Box<[Slot<T>]> = (base..base + CHUNK)
            .map(|index| Slot::new(u32::try_from(index).unwrap_or(u32::MAX)))
            .collect();
        let chunk = Box::into_raw(chunk) as *mut Slot<T>;

        let (segment, offset) = locate(chunk_no);
        let mut entries = self.segments[segment].load(Ordering::Relaxed);
        if entries.is_null() {
            let fresh: Box<[AtomicPtr<Slot<T>>]> = (0..1usize << segment)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect();
            entries = Box::into_raw(fresh) as *mut AtomicPtr<Slot<T>>;
            self.segments[segment].store(entries, Ordering::Release);
        }
        // Safety: `offset < 2^segment`, the segment's length.
        unsafe { &*entries.add(offset) }.store(chunk, Ordering::Release);
        let capacity = ((chunk_no + 1) * CHUNK).min(self.max_capacity as usize) as u32;
        self.capacity.store(capacity, Ordering::Release);

        self.stats.growths.fetch_add(1, Ordering::Relaxed);
        debug!(chunk = chunk_no, capacity, "slot table grew");
    }
}

impl<T, const CHUNK: usize> Drop for SlotTable<'_, T, CHUNK> {
    fn drop(&mut self) {
        for (segment, entries) in self.segments.iter_mut().enumerate() {
            let entries = *entries.get_mut();
            if entries.is_null() {
                continue;
            }
            // Safety: allocated in `grow` as a boxed slice of `2^segment`
            // entries, each null or a boxed slice of CHUNK slots.
            let mut entries =
                unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(entries, 1 << segment)) };
            for entry in entries.iter_mut() {
                let chunk = *entry.get_mut();
                if !chunk.is_null() {
                    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(chunk, CHUNK)) });
                }
            }
        }
    }
}

impl<T, const CHUNK: usize> fmt::Debug for SlotTable<'_, T, CHUNK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .field("chunk", &CHUNK)
            .field("mode", &self.mode)
            .field("free", &self.free)
            .finish()
    }
}

/// A claimed slot that returns to the free list unless committed.
struct Claim<'s, T> {
    free: &'s FreeList,
    slot: Option<&'s Slot<T>>,
}

impl<'s, T> Claim<'s, T> {
    fn new(free: &'s FreeList, slot: &'s Slot<T>) -> Self {
        Self {
            free,
            slot: Some(slot),
        }
    }

    fn commit(mut self) -> &'s Slot<T> {
        match self.slot.take() {
            Some(slot) => slot,
            None => unreachable!("claim committed twice"),
        }
    }
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        self.free.push(self.slot.take());
    }
}

/// Completes an erase: frees the count and recycles the slot.
struct Reclaim<'s, 'a, T, const CHUNK: usize> {
    table: &'s SlotTable<'a, T, CHUNK>,
    slot: &'s Slot<T>,
    exclusive: Option<Exclusive<'s>>,
}

impl<T, const CHUNK: usize> Drop for Reclaim<'_, '_, T, CHUNK> {
    fn drop(&mut self) {
        if let Some(exclusive) = self.exclusive.take() {
            exclusive.retire();
        }
        self.table.free.push(Some(self.slot));
        self.table.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_insert_lookup_erase_scenario() {
        let v1 = String::from("v1");
        let v2 = String::from("v2");
        let table: SlotTable<'_, String> = SlotTable::new(100);

        let (h1, a1) = table.insert(&v1, 0).unwrap();
        let (h2, a2) = table.insert(&v2, 0).unwrap();
        assert_ne!(h1, h2);
        drop(a2);

        let found = table.lookup(h1).unwrap();
        assert_eq!(*found, "v1");
        assert!(!table.erase(Handle::NULL));

        // Both the insert accessor and the lookup accessor hold the slot.
        assert!(!table.erase(h1));
        drop(found);
        assert!(!table.erase(h1));
        drop(a1);

        assert!(table.erase(h1));
        assert!(table.lookup(h1).is_none());
        assert!(!table.erase(h1));
        assert_eq!(*table.lookup(h2).unwrap(), "v2");
    }

    #[test]
    fn test_payload_is_carried() {
        let value = 5u64;
        let table: SlotTable<'_, u64> = SlotTable::new(4);
        let (handle, _) = table.insert(&value, 0xCAFE).unwrap();
        assert_eq!(handle.payload(), 0xCAFE);
        assert_eq!(handle.index(), Some(0));
    }

    #[test]
    fn test_capacity_boundary() {
        let values: Vec<u32> = (0..6).collect();
        let table: SlotTable<'_, u32, 4> = SlotTable::new(5);

        let mut handles = HashSet::new();
        for value in &values[..5] {
            let (handle, _) = table.insert(value, 0).unwrap();
            assert!(handles.insert(handle));
        }
        assert!(table.insert(&values[5], 0).is_none());
        assert_eq!(table.len(), 5);
        assert_eq!(table.capacity(), 5);
        assert_eq!(table.stats().snapshot().failed_inserts, 1);

        // Erasing makes room again.
        let first = *handles.iter().next().unwrap();
        assert!(table.erase(first));
        assert!(table.insert(&values[5], 0).is_some());
    }

    #[test]
    fn test_growth_across_chunks() {
        let values: Vec<usize> = (0..10).collect();
        let table: SlotTable<'_, usize, 4> = SlotTable::new(64);

        let handles: Vec<Handle> = values
            .iter()
            .map(|v| table.insert(v, 0).unwrap().0)
            .collect();
        assert_eq!(table.capacity(), 12);
        assert_eq!(table.stats().snapshot().growths, 3);

        for (handle, value) in handles.iter().zip(&values) {
            assert_eq!(*table.lookup(*handle).unwrap(), *value);
        }
    }

    #[test]
    fn test_reuse_prefers_free_slot_and_changes_handle() {
        let a = 1i32;
        let table: SlotTable<'_, i32> = SlotTable::new(8);

        let (first, _) = table.insert(&a, 3).unwrap();
        assert!(table.erase(first));

        let (second, _) = table.insert(&a, 3).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert!(table.lookup(first).is_none());
        assert!(!table.erase(first));
        assert!(table.lookup(second).is_some());
    }

    #[test]
    fn test_lookup_rejects_malformed_handles() {
        let value = 9u8;
        let table: SlotTable<'_, u8> = SlotTable::new(16);
        let (handle, _) = table.insert(&value, 1).unwrap();

        assert!(table.lookup(Handle::NULL).is_none());
        assert!(table.lookup(Handle::from_raw(1000)).is_none());

        let forged = Handle::compose(0, 1, handle.stamp().wrapping_add(1));
        assert!(table.lookup(forged).is_none());
        assert!(!table.erase(forged));

        // A never-claimed slot in an allocated chunk.
        assert!(table.lookup(Handle::compose(3, 0, 0)).is_none());
    }

    #[test]
    fn test_relaxed_erase_ignores_accessors() {
        let value = String::from("event");
        let table: SlotTable<'_, String> = SlotTable::relaxed(4);

        let (handle, accessor) = table.insert(&value, 0).unwrap();
        assert!(!accessor.is_counted());
        let looked_up = table.lookup(handle).unwrap();

        assert!(table.erase(handle));
        assert!(table.lookup(handle).is_none());
        // Borrowed occupants remain readable through old accessors.
        assert_eq!(*looked_up, "event");
        assert_eq!(*accessor, "event");
    }

    #[test]
    fn test_for_each_visits_live_occupants() {
        let values = [10u32, 20, 30];
        let table: SlotTable<'_, u32> = SlotTable::new(8);
        let handles: Vec<Handle> = values
            .iter()
            .enumerate()
            .map(|(i, v)| table.insert(v, i as u16).unwrap().0)
            .collect();
        assert!(table.erase(handles[1]));

        let mut seen = Vec::new();
        table.for_each(|handle, item| seen.push((handle, *item)));
        assert_eq!(seen, vec![(handles[0], 10), (handles[2], 30)]);
    }

    #[test]
    fn test_erase_all_skips_held_slots() {
        let values = [1u16, 2, 3];
        let table: SlotTable<'_, u16> = SlotTable::new(8);
        let handles: Vec<Handle> = values.iter().map(|v| table.insert(v, 0).unwrap().0).collect();

        let held = table.lookup(handles[2]).unwrap();
        assert_eq!(table.erase_all(), 2);
        assert_eq!(table.len(), 1);
        drop(held);

        assert_eq!(table.erase_all(), 1);
        assert!(table.is_empty());
        // Skipped slots are not rejected erases.
        let stats = table.stats().snapshot();
        assert_eq!(stats.erases, 3);
        assert_eq!(stats.failed_erases, 0);
        assert!(handles.iter().all(|h| table.lookup(*h).is_none()));
    }

    #[test]
    fn test_fixed_salt_is_deterministic() {
        let value = 77u64;
        let config = SlotTableConfig::builder().max_capacity(8).salt(42).build().unwrap();
        let first: SlotTable<'_, u64> = SlotTable::with_config(&config);
        let second: SlotTable<'_, u64> = SlotTable::with_config(&config);

        let (h1, _) = first.insert(&value, 0).unwrap();
        let (h2, _) = second.insert(&value, 0).unwrap();
        assert_eq!(h1, h2);
        assert!(second.lookup(h1).is_some());
    }

    #[test]
    fn test_capacity_is_clamped() {
        let table: SlotTable<'_, u8> = SlotTable::new(u32::MAX);
        assert_eq!(table.max_capacity(), MAX_INDEX);
        assert_eq!(table.capacity(), 0);
    }

    /// Directory entries currently allocated across all segments.
    fn directory_entries<T, const CHUNK: usize>(table: &SlotTable<'_, T, CHUNK>) -> usize {
        table
            .segments
            .iter()
            .enumerate()
            .filter(|(_, entries)| !entries.load(Ordering::Relaxed).is_null())
            .map(|(segment, _)| 1usize << segment)
            .sum()
    }

    #[test]
    fn test_locate_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(1), (1, 0));
        assert_eq!(locate(2), (1, 1));
        assert_eq!(locate(3), (2, 0));
        assert_eq!(locate(6), (2, 3));
        assert_eq!(locate(7), (3, 0));
        assert_eq!(locate(MAX_INDEX as usize), (31, (1 << 31) - 1));
    }

    #[test]
    fn test_empty_table_allocates_no_directory() {
        let table: SlotTable<'_, u8> = SlotTable::new(MAX_INDEX);
        assert_eq!(directory_entries(&table), 0);
        assert!(std::mem::size_of::<SlotTable<'_, u8>>() < 1024);

        let tiny: SlotTable<'_, u8, 1> = SlotTable::new(MAX_INDEX);
        assert_eq!(directory_entries(&tiny), 0);
    }

    #[test]
    fn test_directory_grows_with_use() {
        let values: Vec<u32> = (0..40).collect();
        let table: SlotTable<'_, u32, 4> = SlotTable::new(MAX_INDEX);

        let handles: Vec<Handle> = values.iter().map(|v| table.insert(v, 0).unwrap().0).collect();
        // 40 slots in chunks of 4 is 10 chunks, spread over segments 0..=3.
        assert_eq!(table.capacity(), 40);
        assert_eq!(directory_entries(&table), 1 + 2 + 4 + 8);
        for (handle, value) in handles.iter().zip(&values) {
            assert_eq!(*table.lookup(*handle).unwrap(), *value);
        }
    }

    #[test]
    fn test_exclusive_hold_hides_occupant() {
        let value = 5u32;
        let table: SlotTable<'_, u32> = SlotTable::new(1);
        let (handle, _) = table.insert(&value, 0).unwrap();

        // What a stale-handle erase does between its CAS and stamp re-check.
        let slot = table.resolve(handle).unwrap();
        let exclusive = slot.count.try_exclusive().unwrap();
        assert!(table.lookup(handle).is_none());
        assert!(!table.erase(handle));
        drop(exclusive);

        assert_eq!(*table.lookup(handle).unwrap(), 5);
        assert!(table.erase(handle));
    }

    #[test]
    fn test_stats_counts() {
        let value = 0u8;
        let table: SlotTable<'_, u8> = SlotTable::new(2);
        let (h, a) = table.insert(&value, 0).unwrap();
        assert!(!table.erase(h));
        drop(a);
        assert!(table.erase(h));

        let stats = table.stats().snapshot();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.erases, 1);
        assert_eq!(stats.failed_erases, 1);
        assert_eq!(stats.growths, 1);
    }
}
