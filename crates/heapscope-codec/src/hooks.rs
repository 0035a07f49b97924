//! Injected collaborator interfaces for the trace writer.
//!
//! The runtime's sampling machinery and symbolizer sit behind these traits
//! so tests can feed synthetic allocation streams without a live runtime.

use heapscope_types::{LocationRecord, RawSlot};

/// Resolves a raw stack slot into its inlined frames, outermost first.
/// An empty result means the slot could not be symbolized.
pub trait SlotResolver {
    fn resolve(&mut self, slot: RawSlot) -> Vec<LocationRecord>;
}

impl<F> SlotResolver for F
where
    F: FnMut(RawSlot) -> Vec<LocationRecord>,
{
    fn resolve(&mut self, slot: RawSlot) -> Vec<LocationRecord> {
        self(slot)
    }
}

/// Monotone wall clock, seconds as float. Converted to microsecond ticks
/// for storage.
pub trait Clock {
    fn now_s(&mut self) -> f64;
}

impl<F> Clock for F
where
    F: FnMut() -> f64,
{
    fn now_s(&mut self) -> f64 {
        self()
    }
}

/// Wall clock backed by [`std::time::SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_s(&mut self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}
