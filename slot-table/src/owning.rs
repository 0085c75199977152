//! # Owning Slot Table
//!
//! A [`SlotTable`] that takes ownership of its occupants. Each occupant is
//! boxed on insert and dropped by whichever thread successfully erases it,
//! after an optional teardown callback has seen it.
//!
//! Owning tables are strict unless built with the unsafe
//! [`OwningSlotTable::new_relaxed`]: in relaxed mode an accessor can outlive
//! the occupant it points at.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Mutex;

use tracing::trace;

use crate::config::{ConfigError, Mode, SlotTableConfig};
use crate::handle::Handle;
use crate::refcount::SlotRef;
use crate::table::{DEFAULT_CHUNK, SlotTable, SlotTableStats};

/// Callback run on an occupant just before it is dropped.
pub type Teardown<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Concurrent handle-based registry that owns its occupants.
pub struct OwningSlotTable<T: 'static, const CHUNK: usize = DEFAULT_CHUNK> {
    inner: SlotTable<'static, T, CHUNK>,
    teardown: Option<Teardown<T>>,
    // Occupants drop on the erasing thread, so sharing the table needs `T: Send`.
    _owns: PhantomData<Mutex<T>>,
}

impl<T: 'static, const CHUNK: usize> OwningSlotTable<T, CHUNK> {
    /// Create a strict owning table.
    pub fn new(max_capacity: u32) -> Self {
        Self::from_inner(SlotTable::with_mode(max_capacity, Mode::Strict), None)
    }

    /// Create a strict owning table that calls `teardown` on every occupant
    /// before dropping it.
    pub fn with_teardown<F>(max_capacity: u32, teardown: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::from_inner(
            SlotTable::with_mode(max_capacity, Mode::Strict),
            Some(Box::new(teardown)),
        )
    }

    /// Create an owning table from a configuration.
    ///
    /// Fails with [`ConfigError::RelaxedOwning`] if the configuration asks for
    /// relaxed mode; use [`OwningSlotTable::new_relaxed`] for that.
    pub fn with_config(config: &SlotTableConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.mode == Mode::Relaxed {
            return Err(ConfigError::RelaxedOwning);
        }
        Ok(Self::from_inner(SlotTable::with_config(config), None))
    }

    /// Create a relaxed owning table.
    ///
    /// # Safety
    ///
    /// Erase drops the occupant even while accessors to it exist. The caller
    /// must guarantee that no accessor obtained from this table is used after
    /// its occupant has been erased.
    pub unsafe fn new_relaxed(max_capacity: u32) -> Self {
        Self::from_inner(SlotTable::with_mode(max_capacity, Mode::Relaxed), None)
    }

    /// Install or replace the teardown callback.
    pub fn set_teardown<F>(&mut self, teardown: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.teardown = Some(Box::new(teardown));
    }

    fn from_inner(inner: SlotTable<'static, T, CHUNK>, teardown: Option<Teardown<T>>) -> Self {
        Self {
            inner,
            teardown,
            _owns: PhantomData,
        }
    }

    /// Take ownership of `value` and publish it.
    ///
    /// Returns `None` when the table is full; `value` is dropped in that case.
    pub fn insert(&self, payload: u16, value: T) -> Option<(Handle, SlotRef<'_, T>)> {
        self.insert_with(payload, move || value)
    }

    /// Construct an occupant in a claimed slot and publish it.
    ///
    /// `make` only runs once a slot is available. If it panics, the slot is
    /// released and the panic propagates.
    pub fn insert_with<F>(&self, payload: u16, make: F) -> Option<(Handle, SlotRef<'_, T>)>
    where
        F: FnOnce() -> T,
    {
        self.inner
            .insert_with(payload, || NonNull::from(Box::leak(Box::new(make()))))
    }

    /// Resolve `handle` to an accessor.
    pub fn lookup(&self, handle: Handle) -> Option<SlotRef<'_, T>> {
        self.inner.lookup(handle)
    }

    /// Whether `handle` currently refers to an occupant.
    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.contains(handle)
    }

    /// Remove and drop the occupant referenced by `handle`.
    ///
    /// Same failure conditions as [`SlotTable::erase`].
    pub fn erase(&self, handle: Handle) -> bool {
        self.inner.erase_with(handle, |item| self.destroy(item))
    }

    /// Visit every live occupant.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(Handle, SlotRef<'_, T>),
    {
        self.inner.for_each(f);
    }

    /// Remove and drop every occupant that can be erased when visited.
    pub fn erase_all(&self) -> usize {
        self.inner.drain_with(|item| self.destroy(item))
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of slots allocated so far.
    pub fn capacity(&self) -> u32 {
        self.inner.capacity()
    }

    /// Hard limit on the number of slots.
    pub fn max_capacity(&self) -> u32 {
        self.inner.max_capacity()
    }

    /// Deletion policy.
    pub fn mode(&self) -> Mode {
        self.inner.mode()
    }

    /// Operation counters.
    pub fn stats(&self) -> &SlotTableStats {
        self.inner.stats()
    }

    fn destroy(&self, item: NonNull<T>) {
        // Safety: every pointer bound by this table came from `Box::leak` in
        // `insert_with`, and the erase path hands each one out exactly once.
        let boxed = unsafe { Box::from_raw(item.as_ptr()) };
        if let Some(teardown) = &self.teardown {
            teardown(&boxed);
        }
    }
}

impl<T: 'static, const CHUNK: usize> Drop for OwningSlotTable<T, CHUNK> {
    fn drop(&mut self) {
        // `&mut self` rules out live accessors, so every occupant erases.
        let erased = self.erase_all();
        debug_assert!(self.inner.is_empty(), "{} occupants left after drop", self.len());
        trace!(erased, "owning slot table dropped");
    }
}

impl<T: 'static, const CHUNK: usize> fmt::Debug for OwningSlotTable<T, CHUNK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningSlotTable")
            .field("table", &self.inner)
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(id: u32, drops: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            id,
            drops: Arc::clone(drops),
        }
    }

    #[test]
    fn test_erase_drops_occupant() {
        let drops = Arc::new(AtomicUsize::new(0));
        let table: OwningSlotTable<Tracked> = OwningSlotTable::new(8);

        let (handle, accessor) = table.insert(0, tracked(1, &drops)).unwrap();
        assert_eq!(accessor.id, 1);
        assert!(!table.erase(handle));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(accessor);
        assert!(table.erase(handle));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(table.lookup(handle).is_none());
    }

    #[test]
    fn test_teardown_runs_before_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table: OwningSlotTable<Tracked> = OwningSlotTable::with_teardown(8, {
            let seen = Arc::clone(&seen);
            let drops = Arc::clone(&drops);
            move |item: &Tracked| {
                assert_eq!(drops.load(Ordering::SeqCst), 0);
                seen.lock().unwrap().push(item.id);
            }
        });

        let (handle, _) = table.insert(0, tracked(7, &drops)).unwrap();
        assert!(table.erase(handle));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_erases_remaining() {
        let drops = Arc::new(AtomicUsize::new(0));
        let torn_down = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&torn_down);
            let table: OwningSlotTable<Tracked, 4> =
                OwningSlotTable::with_teardown(16, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            for id in 0..6 {
                table.insert(0, tracked(id, &drops)).unwrap();
            }
            assert_eq!(table.len(), 6);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
        assert_eq!(torn_down.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_insert_full_drops_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        let table: OwningSlotTable<Tracked> = OwningSlotTable::new(1);

        let first = table.insert(0, tracked(0, &drops));
        assert!(first.is_some());
        assert!(table.insert(0, tracked(1, &drops)).is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let mut ran = false;
        assert!(table.insert_with(0, || {
            ran = true;
            tracked(2, &drops)
        })
        .is_none());
        assert!(!ran);
    }

    #[test]
    fn test_panicking_constructor_releases_slot() {
        let table: OwningSlotTable<String> = OwningSlotTable::new(1);

        let result = catch_unwind(AssertUnwindSafe(|| {
            table.insert_with(0, || panic!("constructor failed"))
        }));
        assert!(result.is_err());
        assert!(table.is_empty());

        let (handle, _) = table.insert(0, "ok".to_string()).unwrap();
        assert_eq!(handle.index(), Some(0));
    }

    #[test]
    fn test_with_config_refuses_relaxed() {
        let relaxed = SlotTableConfig::builder().mode(Mode::Relaxed).build().unwrap();
        assert!(matches!(
            OwningSlotTable::<u8>::with_config(&relaxed),
            Err(ConfigError::RelaxedOwning)
        ));

        let strict = SlotTableConfig::builder().max_capacity(10).build().unwrap();
        let table = OwningSlotTable::<u8>::with_config(&strict).unwrap();
        assert_eq!(table.max_capacity(), 10);
        assert_eq!(table.mode(), Mode::Strict);
    }

    #[test]
    fn test_relaxed_owning_erase() {
        let drops = Arc::new(AtomicUsize::new(0));
        let table: OwningSlotTable<Tracked> = unsafe { OwningSlotTable::new_relaxed(4) };

        let (handle, accessor) = table.insert(0, tracked(3, &drops)).unwrap();
        assert!(!accessor.is_counted());
        drop(accessor);

        assert!(table.erase(handle));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!table.erase(handle));
    }

    #[test]
    fn test_dynamic_narrowing() {
        let table: OwningSlotTable<Box<dyn Any + Send + Sync>> = OwningSlotTable::new(4);
        let (handle, _) = table.insert(0, Box::new(12u16)).unwrap();

        let accessor = table.lookup(handle).unwrap();
        let accessor = accessor.try_map(|b| b.downcast_ref::<u64>()).unwrap_err();
        let narrowed = accessor.try_map(|b| b.downcast_ref::<u16>()).unwrap();
        assert_eq!(*narrowed, 12);

        assert!(!table.erase(handle));
        drop(narrowed);
        assert!(table.erase(handle));
    }

    #[test]
    fn test_for_each_and_erase_all() {
        let table: OwningSlotTable<u32> = OwningSlotTable::new(16);
        for value in 0..5 {
            table.insert(value as u16, value).unwrap();
        }

        let mut sum = 0;
        table.for_each(|handle, item| {
            assert_eq!(u32::from(handle.payload()), *item);
            sum += *item;
        });
        assert_eq!(sum, 10);

        assert_eq!(table.erase_all(), 5);
        assert!(table.is_empty());
        assert_eq!(table.stats().snapshot().erases, 5);
    }
}
