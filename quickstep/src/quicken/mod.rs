//! Quicken tables: compact per-image unwind programs distilled from
//! compiler-emitted call-frame information, their on-disk cache, and the
//! instruction set the stepping unwinder executes.

pub mod builder;
pub mod cache;
pub mod instruction;
pub mod table;

pub use builder::{BuildStats, TableBuilder};
pub use cache::{PendingBuild, TableCache};
pub use instruction::Instruction;
pub use table::{QuickenRecord, QuickenTable};
