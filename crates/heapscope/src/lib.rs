//! heapscope: sampled-allocation trace recording and hotspot analysis.
//!
//! The runtime's sampling machinery drives a [`ProfilerSession`] through
//! the [`SampleSink`] callbacks; the session owns a trace writer that
//! compresses backtraces and emits CTF-style packets to a file. Offline,
//! [`TraceReader`] replays a finalized trace and
//! [`heapscope_analyze::HotspotTree`] ranks the hottest backtrace
//! fragments.
//!
//! Register exactly one session at a time with the runtime; concurrent
//! registration is a caller error.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub use heapscope_analyze::{HeavyHitter, HotspotTree, TreeStats};
pub use heapscope_codec::{
    Clock, Event, SlotResolver, SystemClock, TraceReader, TraceWriter,
};
pub use heapscope_error::{HeapscopeError, Result};
pub use heapscope_types::{AllocId, LocId, LocationRecord, RawSlot, MAX_STACK_DEPTH};

/// One sampled allocation as delivered by the runtime hook.
#[derive(Debug, Clone, Copy)]
pub struct SampleInfo<'a> {
    /// Allocation size in words.
    pub length: u64,
    /// Samples attributed to this allocation.
    pub n_samples: u64,
    /// Callstack, innermost frame first, at most [`MAX_STACK_DEPTH`]
    /// slots.
    pub callstack: &'a [RawSlot],
}

/// The five callbacks the runtime sampling machinery invokes, serially,
/// on the allocating thread.
pub trait SampleSink {
    /// A sampled minor-heap allocation. Returns its allocation ID.
    fn alloc_minor(&mut self, info: &SampleInfo<'_>) -> Result<AllocId>;
    /// A sampled major-heap allocation. Returns its allocation ID.
    fn alloc_major(&mut self, info: &SampleInfo<'_>) -> Result<AllocId>;
    /// A sampled allocation survived a minor collection.
    fn promote(&mut self, obj_id: AllocId) -> Result<()>;
    /// A sampled minor-heap allocation was collected.
    fn dealloc_minor(&mut self, obj_id: AllocId) -> Result<()>;
    /// A sampled major-heap allocation was collected.
    fn dealloc_major(&mut self, obj_id: AllocId) -> Result<()>;
}

/// A live recording session: the writer plus the sampling rate handed to
/// the runtime at registration time.
pub struct ProfilerSession<R: SlotResolver, C: Clock> {
    writer: TraceWriter<BufWriter<File>, R, C>,
    sampling_rate: f64,
}

impl<R: SlotResolver> ProfilerSession<R, SystemClock> {
    /// Start recording to `path` with the system clock.
    pub fn start(path: &Path, sampling_rate: f64, resolver: R) -> Result<Self> {
        Self::start_with_clock(path, sampling_rate, resolver, SystemClock)
    }
}

impl<R: SlotResolver, C: Clock> ProfilerSession<R, C> {
    /// Start recording to `path` with an injected clock.
    pub fn start_with_clock(
        path: &Path,
        sampling_rate: f64,
        resolver: R,
        clock: C,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let writer = TraceWriter::new(BufWriter::new(file), resolver, clock)?;
        Ok(Self {
            writer,
            sampling_rate,
        })
    }

    /// The sampling rate the runtime was configured with.
    #[must_use]
    pub const fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Stop recording: unregister from the runtime first, then call this.
    /// Flushes the final packet and closes the destination.
    pub fn stop(self) -> Result<()> {
        use std::io::Write as _;
        let mut dest = self.writer.finish()?;
        dest.flush()?;
        Ok(())
    }
}

impl<R: SlotResolver, C: Clock> SampleSink for ProfilerSession<R, C> {
    fn alloc_minor(&mut self, info: &SampleInfo<'_>) -> Result<AllocId> {
        self.writer
            .alloc(info.length, info.n_samples, false, info.callstack)
            .map(AllocId)
    }

    fn alloc_major(&mut self, info: &SampleInfo<'_>) -> Result<AllocId> {
        self.writer
            .alloc(info.length, info.n_samples, true, info.callstack)
            .map(AllocId)
    }

    fn promote(&mut self, obj_id: AllocId) -> Result<()> {
        self.writer.promote(obj_id.0)
    }

    fn dealloc_minor(&mut self, obj_id: AllocId) -> Result<()> {
        self.writer.collect(obj_id.0)
    }

    fn dealloc_major(&mut self, obj_id: AllocId) -> Result<()> {
        self.writer.collect(obj_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(slot: RawSlot) -> Vec<LocationRecord> {
        vec![LocationRecord {
            filename: "app.src".to_owned(),
            defname: format!("fn{}", slot.0),
            line: 10,
            start_col: 0,
            end_col: 8,
        }]
    }

    #[test]
    fn session_records_a_readable_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ctf");

        let mut t = 0u64;
        let clock = move || {
            t += 10;
            #[allow(clippy::cast_precision_loss)]
            let s = t as f64 / 1e6;
            s
        };
        let mut session =
            ProfilerSession::start_with_clock(&path, 1e-4, resolver as fn(_) -> _, clock).unwrap();
        assert!((session.sampling_rate() - 1e-4).abs() < f64::EPSILON);

        let stack = [RawSlot(1), RawSlot(2)];
        let info = SampleInfo {
            length: 3,
            n_samples: 1,
            callstack: &stack,
        };
        let a = session.alloc_minor(&info).unwrap();
        let b = session.alloc_major(&info).unwrap();
        session.promote(a).unwrap();
        session.dealloc_major(b).unwrap();
        session.stop().unwrap();

        let reader = TraceReader::new(std::fs::File::open(&path).unwrap());
        let events: Vec<Event> = reader
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| !matches!(e, Event::Location { .. }))
            .collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], Event::Alloc(a) if !a.is_major));
        assert!(matches!(&events[1], Event::Alloc(a) if a.is_major));
        assert!(matches!(events[2], Event::Promote { obj_id: AllocId(0) }));
        assert!(matches!(events[3], Event::Collect { obj_id: AllocId(1) }));
    }

    #[test]
    fn trace_feeds_the_hotspot_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ctf");

        let mut t = 0u64;
        let clock = move || {
            t += 1;
            #[allow(clippy::cast_precision_loss)]
            let s = t as f64 / 1e6;
            s
        };
        let mut session =
            ProfilerSession::start_with_clock(&path, 1e-4, resolver as fn(_) -> _, clock).unwrap();
        for _ in 0..50 {
            let stack = [RawSlot(7), RawSlot(8)];
            session
                .alloc_minor(&SampleInfo {
                    length: 2,
                    n_samples: 3,
                    callstack: &stack,
                })
                .unwrap();
        }
        session.stop().unwrap();

        let mut tree = HotspotTree::new(0.01);
        let reader = TraceReader::new(std::fs::File::open(&path).unwrap());
        reader
            .for_each_event(|_, event| {
                if let Event::Alloc(a) = event {
                    tree.insert_backtrace(&a.backtrace, a.n_samples);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(tree.total_weight(), 150);
        assert!(!tree.heavy_hitters(0.5).unwrap().is_empty());
    }
}
