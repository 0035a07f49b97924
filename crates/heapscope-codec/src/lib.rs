//! Binary codec for the heapscope sampled-allocation trace format.
//!
//! The on-disk and wire formats are identical: little-endian packets, each
//! beginning with a 44-byte CTF-style header followed by `content_size`
//! bytes of events. Backtraces compress through a bucketed cache with
//! next-location prediction; location metadata compresses through
//! move-to-front tables and a common-suffix encoding across successive
//! stacks.
//!
//! The writer consumes runtime sampling callbacks and emits packets; the
//! reader parses a finalized stream into a timestamped event iterator.

pub mod buf;
pub mod cache;
pub mod event;
pub mod hooks;
pub mod packet;
pub mod reader;
pub mod writer;

pub use buf::{ReadBuf, WriteBuf};
pub use cache::{ReaderCache, WriterCache, CACHE_SIZE};
pub use event::{AllocEvent, Event, EventCode};
pub use hooks::{Clock, SlotResolver, SystemClock};
pub use packet::{PacketHeader, PACKET_HEADER_SIZE, TRACE_MAGIC};
pub use reader::TraceReader;
pub use writer::TraceWriter;

/// Hard cap on the byte size of a single encoded event.
pub const MAX_EVENT_SIZE: usize = 4096;

/// Hard cap on the byte size of a single encoded location event.
pub const MAX_LOCATION: usize = 4096;

/// Size of a packet buffer, header included.
pub const MAX_PACKET_SIZE: usize = 1 << 15;

/// Pending-locations watermark above which the writer flushes.
pub const PENDING_WATERMARK: usize = 128;

/// Convert the clock's seconds-as-float reading to microsecond ticks.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn ticks_of_seconds(seconds: f64) -> u64 {
    (seconds * 1e6) as u64
}
