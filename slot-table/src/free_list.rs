//! # Free List
//!
//! LIFO stack of reusable slots.
//!
//! The link to the next free slot is stored in the slot record itself
//! through the [`FreeNode`] trait, so pushing and popping never allocate and
//! occupant types carry no list fields. The list only records the index of
//! the top slot; callers resolve indices back to nodes on `pop`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Index value marking the end of the list.
pub(crate) const NIL: u32 = u32::MAX;

/// A node that can be linked into a [`FreeList`].
pub trait FreeNode {
    /// Permanent index of this node.
    fn free_index(&self) -> u32;

    /// Storage for the index of the next free node.
    ///
    /// Only read or written while the owning list's lock is held.
    fn free_link(&self) -> &AtomicU32;
}

/// Mutex-protected intrusive LIFO of free slot indices.
pub struct FreeList {
    /// Index of the top node, or [`NIL`].
    head: Mutex<u32>,
    /// Number of linked nodes.
    len: AtomicUsize,
}

impl FreeList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            head: Mutex::new(NIL),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a node onto the list. `None` is ignored.
    pub fn push<N: FreeNode>(&self, node: Option<&N>) {
        let Some(node) = node else {
            return;
        };

        let mut head = self.head.lock();
        node.free_link().store(*head, Ordering::Relaxed);
        *head = node.free_index();
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop the most recently pushed node.
    ///
    /// `resolve` maps the top index to its node; it is called with the list
    /// locked and must not touch the list itself.
    pub fn pop<'n, N, F>(&self, resolve: F) -> Option<&'n N>
    where
        N: FreeNode + 'n,
        F: FnOnce(u32) -> &'n N,
    {
        let mut head = self.head.lock();
        if *head == NIL {
            return None;
        }

        let node = resolve(*head);
        debug_assert_eq!(node.free_index(), *head);
        *head = node.free_link().swap(NIL, Ordering::Relaxed);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(node)
    }

    /// Number of nodes currently linked.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList").field("len", &self.len()).finish()
    }
}
