//! # Quickstep - Online Stack Unwinding with Precomputed Tables
//!
//! Quickstep reconstructs native call chains from a thread's register state
//! at arbitrary points, using compact per-image unwind tables ("quicken
//! tables") distilled ahead of time from compiler-emitted call-frame
//! information. It is built to run inside the traced process itself: steps
//! never allocate, never take locks outside the table cache, and every
//! failure truncates instead of propagating.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Register capture                      │
//! │            (signal context / explicit capture)           │
//! └───────────────────────────┬──────────────────────────────┘
//!                             ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   Unwinder   │──▶│ ImageRegistry│──▶│  /proc maps      │
//! │  (stepping)  │   │ (pc → image) │   │  (MapsProvider)  │
//! └──────┬───────┘   └──────────────┘   └──────────────────┘
//!        │
//!        │ table lookup        build on demand
//!        ▼                          │
//! ┌──────────────┐   ┌──────────────┴───┐   ┌──────────────┐
//! │  TableCache  │◀──│   TableBuilder   │◀──│  .eh_frame   │
//! │ (disk + mem) │   │  (gimli rows →   │   │   (gimli)    │
//! └──────────────┘   │   step programs) │   └──────────────┘
//!                    └──────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`arch`]: architecture tags and the register file the step programs
//!   mutate
//! - [`maps`]: image registry, identity hashing, build ids
//! - [`memory`]: safe and unchecked process-memory readers
//! - [`quicken`]: the table (records + instruction pool), its builder, the
//!   step-program VM, and the on-disk cache
//! - [`unwinder`]: the per-frame stepping loop with the pc-adjustment
//!   policy, the frame-pointer fallback, and the interpreted-pc bridge
//! - [`error`]: the unwind error taxonomy and cache/build failures
//!
//! ## Key Concepts
//!
//! - **Quicken table**: sorted, binary-searchable (pc-range → step program)
//!   records covering every range of an image that has unwind metadata
//! - **Load bias**: offset between an image's link-time and runtime
//!   addresses; all relative pcs are bias-adjusted
//! - **Content identity**: (path, size, offset) digest keying the cache,
//!   with the build id as a secondary key that survives path changes

pub mod arch;
pub mod error;
pub mod maps;
pub mod memory;
pub mod quicken;
pub mod unwinder;

pub use arch::{Arch, RegisterFile};
pub use error::{CacheError, UnwindError};
pub use maps::{ContentHash, Image, ImageRegistry, MapEntry, MapPerms, MapsProvider, ProcMaps,
    StaticMaps};
pub use memory::{LocalMemory, ProcessMemory, SliceMemory};
pub use quicken::{BuildStats, PendingBuild, QuickenRecord, QuickenTable, TableBuilder,
    TableCache};
pub use unwinder::{Frame, InterpretedPcSource, UnwindCursor, Unwinder, Unwound};
