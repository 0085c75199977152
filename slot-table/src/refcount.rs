//! # Slot Reference Counting
//!
//! Each slot owns one [`RefCount`]. The count is a small state machine over
//! an `AtomicU32` rather than a general shared pointer, because a slot must
//! never be resurrected: once the count has dropped to zero (or been taken
//! for deletion) a shared acquisition has to fail instead of incrementing.
//!
//! ## States
//!
//! ```text
//!            publish             try_acquire_shared
//!   FREE ───────────────▶ ALIVE ◀───────────────────▶ ALIVE + n
//!    ▲                     │  ▲       release_shared
//!    │        try_exclusive│  │ drop (abandon)
//!    │                     ▼  │
//!    └──────────────── EXCLUSIVE
//!          retire
//! ```
//!
//! - `FREE` (0): slot is unoccupied or being claimed.
//! - `ALIVE` (1): slot is occupied; the table holds the only reference.
//! - `ALIVE + n`: `n` accessors ([`SlotRef`]) are outstanding.
//! - `EXCLUSIVE`: one thread is erasing the slot; nobody else may enter.
//!
//! Shared acquisition stops [`state::SAFETY_MARGIN`] short of `EXCLUSIVE`,
//! so clones of existing accessors can never climb into the sentinel.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Reserved reference count values.
pub mod state {
    /// Unoccupied slot.
    pub const FREE: u32 = 0;
    /// Occupied slot without outstanding accessors.
    pub const ALIVE: u32 = 1;
    /// Held by a single eraser.
    pub const EXCLUSIVE: u32 = 1 << 31;
    /// Head-room kept between the shared ceiling and `EXCLUSIVE`.
    pub const SAFETY_MARGIN: u32 = 1 << 16;
    /// Shared acquisition fails at or above this count.
    pub const MAX_SHARED: u32 = EXCLUSIVE - SAFETY_MARGIN;
}

/// Atomic reference count of one slot.
pub struct RefCount(AtomicU32);

impl RefCount {
    /// Create a count in the `FREE` state.
    pub const fn new() -> Self {
        Self(AtomicU32::new(state::FREE))
    }

    /// Current raw value.
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether the slot is occupied and not being erased.
    pub fn is_alive(&self) -> bool {
        let current = self.load();
        current != state::FREE && current < state::EXCLUSIVE
    }

    /// Make a freshly claimed slot visible: `FREE -> ALIVE`.
    ///
    /// Everything written to the slot before this call is visible to any
    /// thread whose shared acquisition observes the new value.
    pub(crate) fn publish(&self) {
        debug_assert_eq!(self.0.load(Ordering::Relaxed), state::FREE);
        self.0.store(state::ALIVE, Ordering::Release);
    }

    /// Like [`RefCount::publish`], with one shared reference already taken
    /// for the caller: `FREE -> ALIVE + 1`.
    pub(crate) fn publish_shared(&self) {
        debug_assert_eq!(self.0.load(Ordering::Relaxed), state::FREE);
        self.0.store(state::ALIVE + 1, Ordering::Release);
    }

    /// Add a shared reference unless the slot is free, being erased, or
    /// saturated.
    pub fn try_acquire_shared(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == state::FREE || current >= state::MAX_SHARED {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a shared reference obtained from [`RefCount::try_acquire_shared`].
    pub fn release_shared(&self) {
        let old = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(
            old > state::ALIVE && old < state::EXCLUSIVE,
            "RefCount: release of unheld reference (count {old})"
        );
    }

    /// Add a reference on behalf of a holder that already owns one.
    fn acquire_held(&self) {
        let old = self.0.fetch_add(1, Ordering::Relaxed);
        if old >= state::MAX_SHARED + state::SAFETY_MARGIN / 2 {
            // Same policy as `Arc`: the count can't be trusted any more.
            std::process::abort();
        }
    }

    /// Take the exclusive right to erase: `ALIVE -> EXCLUSIVE`.
    ///
    /// Fails if the slot is free, already exclusively held, or still has
    /// outstanding accessors.
    pub fn try_exclusive(&self) -> Option<Exclusive<'_>> {
        self.0
            .compare_exchange(
                state::ALIVE,
                state::EXCLUSIVE,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| Exclusive { count: self })
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.load() {
            state::FREE => f.write_str("RefCount(FREE)"),
            state::EXCLUSIVE => f.write_str("RefCount(EXCLUSIVE)"),
            n => write!(f, "RefCount({n})"),
        }
    }
}

/// Exclusive hold on a slot's count.
///
/// Dropping the guard abandons the erase and returns the slot to `ALIVE`;
/// [`Exclusive::retire`] completes it and frees the slot.
#[must_use = "dropping the guard abandons the exclusive hold"]
pub struct Exclusive<'c> {
    count: &'c RefCount,
}

impl Exclusive<'_> {
    /// Finish the erase: `EXCLUSIVE -> FREE`.
    pub fn retire(self) {
        let this = ManuallyDrop::new(self);
        this.count.0.store(state::FREE, Ordering::Release);
    }
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        self.count.0.store(state::ALIVE, Ordering::Release);
    }
}

/// Shared accessor to a slot occupant.
///
/// While a counted accessor exists, the slot it came from cannot be erased
/// by a strict table. Cloning adds a reference, dropping removes one, and
/// moving leaves the count untouched.
///
/// Accessors handed out by relaxed tables are *uncounted*: they do not
/// participate in the reference count and do not hold the slot.
pub struct SlotRef<'t, T: ?Sized> {
    item: NonNull<T>,
    count: Option<&'t RefCount>,
    _marker: PhantomData<&'t T>,
}

// Safety: a SlotRef only hands out `&T`, like a shared reference.
unsafe impl<T: ?Sized + Sync> Send for SlotRef<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for SlotRef<'_, T> {}

impl<'t, T: ?Sized> SlotRef<'t, T> {
    /// Wrap an item whose count the caller has already raised by one.
    ///
    /// # Safety
    ///
    /// `item` must stay valid while the reference is held, and the caller
    /// must transfer exactly one shared reference on `count`.
    pub(crate) unsafe fn adopt(item: NonNull<T>, count: &'t RefCount) -> Self {
        Self {
            item,
            count: Some(count),
            _marker: PhantomData,
        }
    }

    /// Wrap `item` without reference counting.
    ///
    /// # Safety
    ///
    /// `item` must stay valid for `'t` regardless of what happens to the
    /// slot it came from.
    pub(crate) unsafe fn uncounted(item: NonNull<T>) -> Self {
        Self {
            item,
            count: None,
            _marker: PhantomData,
        }
    }

    /// Whether this accessor holds a reference on its slot.
    pub fn is_counted(&self) -> bool {
        self.count.is_some()
    }

    /// Raw pointer to the occupant.
    pub fn as_ptr(&self) -> *const T {
        self.item.as_ptr()
    }

    /// Whether two accessors point at the same occupant.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        std::ptr::addr_eq(a.as_ptr(), b.as_ptr())
    }

    /// Narrow the accessor to a part or a concrete type of the occupant.
    ///
    /// `f` performs the runtime compatibility check (for example
    /// `Any::downcast_ref`). On success the new accessor shares this one's
    /// reference; on failure the original accessor is handed back.
    pub fn try_map<U, F>(self, f: F) -> Result<SlotRef<'t, U>, Self>
    where
        U: ?Sized,
        F: FnOnce(&T) -> Option<&U>,
    {
        let Some(mapped) = f(&*self).map(NonNull::from) else {
            return Err(self);
        };
        let this = ManuallyDrop::new(self);
        Ok(SlotRef {
            item: mapped,
            count: this.count,
            _marker: PhantomData,
        })
    }
}

impl<T: ?Sized> Deref for SlotRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: upheld by the constructors' contracts.
        unsafe { self.item.as_ref() }
    }
}

impl<T: ?Sized> Clone for SlotRef<'_, T> {
    fn clone(&self) -> Self {
        if let Some(count) = self.count {
            count.acquire_held();
        }
        Self {
            item: self.item,
            count: self.count,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for SlotRef<'_, T> {
    fn drop(&mut self) {
        if let Some(count) = self.count {
            count.release_shared();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SlotRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRef")
            .field("item", &&**self)
            .field("counted", &self.is_counted())
            .finish()
    }
}
