//! Core data model for the heapscope trace codec and analyzer.
//!
//! This crate is dependency-free on purpose: it holds the identifier
//! newtypes, the bit-packed location record, the move-to-front table, and
//! the backtrace helpers that both the codec and the analyzer build on.

pub mod backtrace;
pub mod location;
pub mod mtf;

pub use backtrace::{common_suffix_len, dedup_stack};
pub use location::{AllocId, LocId, LocationRecord, RawSlot};
pub use mtf::{MtfTable, MTF_LEN, MTF_LITERAL, MTF_NOT_FOUND};

/// Maximum callstack depth delivered by the runtime sampling hook. Deeper
/// stacks are truncated at the sampling boundary.
pub const MAX_STACK_DEPTH: usize = 4096;
