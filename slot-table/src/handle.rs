//! # Handles
//!
//! Opaque 64-bit identifiers issued by slot tables.
//!
//! ## Layout
//!
//! ```text
//!  63            48 47            32 31                             0
//! ┌────────────────┬────────────────┬────────────────────────────────┐
//! │  stamp (16)    │  payload (16)  │  index + 1 (32)                │
//! └────────────────┴────────────────┴────────────────────────────────┘
//! ```
//!
//! The low word stores `index + 1`, so the all-zero handle never refers to a
//! slot. The payload is an arbitrary caller value carried alongside the
//! index. The stamp is the slot's validation checksum at the time the handle
//! was issued; once the slot is erased or reused the stamp stops matching and
//! the handle is rejected.

use std::fmt;

const INDEX_BITS: u32 = 32;
const PAYLOAD_SHIFT: u32 = 32;
const STAMP_SHIFT: u32 = 48;

/// Largest slot index a handle can encode.
pub const MAX_INDEX: u32 = u32::MAX - 1;

/// An opaque handle to a slot table entry.
///
/// Handles are plain values: copying one does not keep the referenced entry
/// alive, and a handle may outlive its entry. Lookups and erasures through a
/// stale handle simply fail.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    /// The null handle. Never issued by a table.
    pub const NULL: Self = Self(0);

    /// Assemble a handle from its parts.
    pub(crate) const fn compose(index: u32, payload: u16, stamp: u16) -> Self {
        debug_assert!(index <= MAX_INDEX);
        Self(
            (index as u64 + 1)
                | ((payload as u64) << PAYLOAD_SHIFT)
                | ((stamp as u64) << STAMP_SHIFT),
        )
    }

    /// Reinterpret a raw value previously obtained from [`Handle::as_raw`].
    ///
    /// Any value is accepted; values that were never issued are rejected by
    /// the table that is asked to resolve them.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit representation.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Slot index, or `None` if the index word is zero.
    pub const fn index(self) -> Option<u32> {
        let word = (self.0 & ((1u64 << INDEX_BITS) - 1)) as u32;
        if word == 0 { None } else { Some(word - 1) }
    }

    /// Caller payload supplied at insertion.
    pub const fn payload(self) -> u16 {
        (self.0 >> PAYLOAD_SHIFT) as u16
    }

    /// Validation stamp issued with this handle.
    pub const fn stamp(self) -> u16 {
        (self.0 >> STAMP_SHIFT) as u16
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index())
            .field("payload", &self.payload())
            .field("stamp", &format_args!("{:#06x}", self.stamp()))
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}
