//! # Slot Table
//!
//! Concurrent registry that publishes objects under opaque 64-bit handles.
//!
//! - **Handles**: index, caller payload, and a CRC-16 validation stamp packed
//!   into one `u64`; stale handles are rejected instead of aliasing
//! - **Accessors**: reference-counted [`SlotRef`]s that keep a slot from
//!   being erased while in use
//! - **Growth**: slots are allocated in stable chunks up to a fixed maximum
//! - **Ownership**: [`SlotTable`] borrows its occupants, [`OwningSlotTable`]
//!   boxes them and drops them on erase
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SLOT TABLE                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────┐          ┌──────────────────┐             │
//! │  │ OwningSlotTable  │ ───────▶ │    SlotTable     │             │
//! │  │   (owning.rs)    │          │    (table.rs)    │             │
//! │  └──────────────────┘          └──────────────────┘             │
//! │                                   │     │     │                  │
//! │          ┌────────────────────────┘     │     └──────────┐       │
//! │          ▼                              ▼                ▼       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   RefCount   │  │   FreeList   │  │    CRC-16    │          │
//! │  │(refcount.rs) │  │(free_list.rs)│  │(checksum.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use slot_table::OwningSlotTable;
//!
//! let streams: OwningSlotTable<String> = OwningSlotTable::new(1024);
//!
//! let (handle, stream) = streams.insert(0, "camera".to_string()).unwrap();
//! assert_eq!(*stream, "camera");
//!
//! // An outstanding accessor blocks erasure.
//! assert!(!streams.erase(handle));
//! drop(stream);
//! assert!(streams.erase(handle));
//!
//! // The handle is now stale.
//! assert!(streams.lookup(handle).is_none());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checksum;
pub mod config;
pub mod free_list;
pub mod handle;
pub mod owning;
pub mod refcount;
pub mod table;

// Re-exports
pub use config::{ConfigError, Mode, SlotTableConfig, SlotTableConfigBuilder};
pub use handle::Handle;
pub use owning::{OwningSlotTable, Teardown};
pub use refcount::{RefCount, SlotRef};
pub use table::{SlotTable, SlotTableStats, StatsSnapshot};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
