//! Trace writer: consumes runtime sampling callbacks, emits packets.
//!
//! The writer owns two packet buffers. Data events (allocations,
//! promotions, collections) accumulate in the current data packet; the
//! location records behind any location ID seen for the first time are
//! queued and written out as separate location packets at flush time,
//! *before* the data packet that references them. A reader therefore
//! always sees a location declaration before any event using its ID.

use std::collections::HashSet;
use std::io::Write;

use tracing::debug;

use heapscope_error::{HeapscopeError, Result};
use heapscope_types::{common_suffix_len, LocId, LocationRecord, MtfTable, RawSlot};

use crate::buf::{ReadBuf, WriteBuf};
use crate::cache::{ReaderCache, WriterCache};
use crate::event::{event_header, put_location_event, EventCode};
use crate::hooks::{Clock, SlotResolver};
use crate::packet::{PacketHeader, EVENT_TS_MASK, PACKET_HEADER_SIZE};
use crate::{ticks_of_seconds, MAX_EVENT_SIZE, MAX_LOCATION, MAX_PACKET_SIZE, PENDING_WATERMARK};

/// Longest inlined-frame list stored for one location ID. Longer lists are
/// truncated with a trailing `"<unknown>"` sentinel record.
const MAX_LOCATION_RECORDS: usize = 255;

/// Debug mirror: a reader cache run in-process against the freshly encoded
/// bytes, asserting bit-exact stack reconstruction.
struct Mirror {
    cache: ReaderCache,
    prev_stack: Vec<LocId>,
}

/// Streaming writer for the sampled-allocation trace format.
pub struct TraceWriter<W: Write, R: SlotResolver, C: Clock> {
    dest: W,
    resolver: R,
    clock: C,
    cache: WriterCache,
    file_mtf: MtfTable,
    def_mtf: MtfTable,
    /// Location IDs whose miss literal hit the wire, with the raw slot to
    /// resolve at flush time.
    pending: Vec<(LocId, RawSlot)>,
    registered: HashSet<LocId>,
    data_buf: WriteBuf,
    prev_stack: Vec<LocId>,
    next_alloc_id: u64,
    start_alloc_id: u64,
    packet_ts_begin: u64,
    packet_ts_end: u64,
    packet_event_count: usize,
    mirror: Option<Mirror>,
}

impl<W: Write, R: SlotResolver, C: Clock> TraceWriter<W, R, C> {
    /// Open a writer over `dest`. Nothing reaches the destination until
    /// the first flush.
    pub fn new(dest: W, resolver: R, mut clock: C) -> Result<Self> {
        let now = ticks_of_seconds(clock.now_s());
        let mut data_buf = WriteBuf::new(MAX_PACKET_SIZE);
        PacketHeader::write_placeholder(&mut data_buf)?;
        Ok(Self {
            dest,
            resolver,
            clock,
            cache: WriterCache::new(),
            file_mtf: MtfTable::new(),
            def_mtf: MtfTable::new(),
            pending: Vec::new(),
            registered: HashSet::new(),
            data_buf,
            prev_stack: Vec::new(),
            next_alloc_id: 0,
            start_alloc_id: 0,
            packet_ts_begin: now,
            packet_ts_end: now,
            packet_event_count: 0,
            mirror: None,
        })
    }

    /// Run a second in-process reader cache against every encoded
    /// allocation event and assert bit-identical stack reconstruction.
    pub fn enable_debug_verify(&mut self) {
        self.mirror = Some(Mirror {
            cache: ReaderCache::new(),
            prev_stack: Vec::new(),
        });
    }

    /// Serial number the next sampled allocation will receive.
    #[must_use]
    pub const fn next_alloc_id(&self) -> u64 {
        self.next_alloc_id
    }

    /// Record a sampled allocation. `callstack` is innermost-frame-first
    /// raw slots. Returns the allocation ID assigned to the sample.
    pub fn alloc(
        &mut self,
        length: u64,
        n_samples: u64,
        is_major: bool,
        callstack: &[RawSlot],
    ) -> Result<u64> {
        let ts = self.now();
        self.begin_event(ts)?;

        let stack: Vec<LocId> = callstack.iter().copied().map(LocId::from).collect();
        let common = common_suffix_len(&stack, &self.prev_stack);
        let new_count = stack.len() - common;
        // Oldest new frame first.
        let suffix: Vec<LocId> = stack[..new_count].iter().rev().copied().collect();

        let event_start = self.data_buf.pos();
        let saved_end = self.data_buf.end();
        self.data_buf.set_end(saved_end.min(event_start + MAX_EVENT_SIZE));

        let encoded = (|| -> Result<Vec<usize>> {
            self.data_buf.put_u32(event_header(EventCode::Alloc, ts))?;
            self.data_buf.put_vint(length)?;
            self.data_buf.put_vint(n_samples)?;
            self.data_buf.put_u8(u8::from(is_major))?;
            self.data_buf.put_vint(common as u64)?;
            let ncodes_at = self.data_buf.pos();
            self.data_buf.put_u16(0)?;
            let (ncodes, misses) =
                self.cache
                    .encode_suffix(&suffix, self.next_alloc_id, &mut self.data_buf)?;
            self.data_buf.patch_u16(ncodes_at, ncodes)?;
            Ok(misses)
        })();
        self.data_buf.set_end(saved_end);
        let misses = match encoded {
            Ok(misses) => misses,
            Err(err) => {
                // Discard the partial event. The cache already rolled its
                // buckets back, so the writer stays usable.
                self.data_buf.rewind_to(event_start);
                return Err(err);
            }
        };

        for suffix_index in misses {
            let id = suffix[suffix_index];
            if self.registered.insert(id) {
                // Suffix order is reversed stack order.
                let slot = callstack[new_count - 1 - suffix_index];
                self.pending.push((id, slot));
            }
        }

        if self.mirror.is_some() {
            self.verify_alloc_event(event_start, common, &stack)?;
        }

        let obj_id = self.next_alloc_id;
        self.prev_stack = stack;
        self.next_alloc_id += 1;
        self.end_event(ts);
        Ok(obj_id)
    }

    /// Record the promotion of a previously sampled allocation.
    pub fn promote(&mut self, obj_id: u64) -> Result<()> {
        self.delta_event(EventCode::Promote, obj_id)
    }

    /// Record the collection of a previously sampled allocation.
    pub fn collect(&mut self, obj_id: u64) -> Result<()> {
        self.delta_event(EventCode::Collect, obj_id)
    }

    fn delta_event(&mut self, code: EventCode, obj_id: u64) -> Result<()> {
        HeapscopeError::check_format(
            obj_id < self.next_alloc_id,
            format!(
                "event references allocation {obj_id} but only {} were assigned",
                self.next_alloc_id
            ),
        )?;
        let ts = self.now();
        self.begin_event(ts)?;
        let delta = self.next_alloc_id - 1 - obj_id;
        self.data_buf.put_u32(event_header(code, ts))?;
        self.data_buf.put_vint(delta)?;
        self.end_event(ts);
        Ok(())
    }

    /// Flush pending location packets and the current data packet.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_packets()
    }

    /// Flush everything (an empty trace still yields one empty packet) and
    /// return the destination.
    pub fn finish(mut self) -> Result<W> {
        self.flush_packets()?;
        self.dest.flush()?;
        Ok(self.dest)
    }

    fn now(&mut self) -> u64 {
        // The clock is monotone; the clamp keeps a same-tick reading from
        // regressing below the packet chain.
        ticks_of_seconds(self.clock.now_s()).max(self.packet_ts_end)
    }

    /// Make room for one event: flush on low space, a full pending queue,
    /// or a timestamp about to outrun the 25-bit event field.
    fn begin_event(&mut self, ts: u64) -> Result<()> {
        let wrapping = self.packet_event_count > 0 && ts - self.packet_ts_begin > EVENT_TS_MASK;
        if self.data_buf.remaining() < MAX_EVENT_SIZE
            || self.pending.len() >= PENDING_WATERMARK
            || wrapping
        {
            self.flush_packets()?;
        }
        if self.packet_event_count == 0 {
            // A packet's begin time is its first event's time.
            self.packet_ts_begin = self.packet_ts_begin.max(ts);
            self.packet_ts_end = self.packet_ts_begin;
        }
        Ok(())
    }

    fn end_event(&mut self, ts: u64) {
        self.packet_ts_end = ts;
        self.packet_event_count += 1;
    }

    fn flush_packets(&mut self) -> Result<()> {
        self.write_location_packets()?;

        let header = PacketHeader {
            content_size: self.data_buf.pos() - PACKET_HEADER_SIZE,
            ts_begin: self.packet_ts_begin,
            ts_end: self.packet_ts_end,
            alloc_id_begin: self.start_alloc_id,
            alloc_id_end: self.next_alloc_id,
        };
        header.patch(&mut self.data_buf)?;
        self.dest.write_all(self.data_buf.written())?;
        debug!(
            bytes = self.data_buf.pos(),
            events = self.packet_event_count,
            alloc_id_begin = header.alloc_id_begin,
            alloc_id_end = header.alloc_id_end,
            "data packet flushed"
        );

        self.data_buf.reset();
        PacketHeader::write_placeholder(&mut self.data_buf)?;
        self.packet_ts_begin = self.packet_ts_end;
        self.start_alloc_id = self.next_alloc_id;
        self.packet_event_count = 0;
        Ok(())
    }

    /// Resolve every pending location and emit location packets. Their
    /// timestamps equal the referring data packet's begin time and their
    /// allocation-ID interval is empty.
    fn write_location_packets(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let npending = pending.len();
        let mut buf = WriteBuf::new(MAX_PACKET_SIZE);
        PacketHeader::write_placeholder(&mut buf)?;

        for (id, slot) in pending {
            let records = self.resolve_records(slot);
            if buf.remaining() < MAX_LOCATION {
                self.seal_location_packet(&mut buf)?;
            }
            let event_start = buf.pos();
            let saved_end = buf.end();
            buf.set_end(saved_end.min(event_start + MAX_LOCATION));
            let encoded = (|| -> Result<()> {
                buf.put_u32(event_header(EventCode::Location, self.packet_ts_begin))?;
                put_location_event(&mut buf, id, &records, &mut self.file_mtf, &mut self.def_mtf)
            })();
            buf.set_end(saved_end);
            if let Err(err) = encoded {
                buf.rewind_to(event_start);
                return Err(err);
            }
        }
        self.seal_location_packet(&mut buf)?;
        debug!(npending, "location packets flushed");
        Ok(())
    }

    fn seal_location_packet(&mut self, buf: &mut WriteBuf) -> Result<()> {
        let header = PacketHeader {
            content_size: buf.pos() - PACKET_HEADER_SIZE,
            ts_begin: self.packet_ts_begin,
            ts_end: self.packet_ts_begin,
            alloc_id_begin: self.start_alloc_id,
            alloc_id_end: self.start_alloc_id,
        };
        header.patch(buf)?;
        self.dest.write_all(buf.written())?;
        buf.reset();
        PacketHeader::write_placeholder(buf)
    }

    fn resolve_records(&mut self, slot: RawSlot) -> Vec<LocationRecord> {
        let mut records = self.resolver.resolve(slot);
        if records.is_empty() {
            records.push(LocationRecord::unknown());
        } else if records.len() > MAX_LOCATION_RECORDS {
            records.truncate(MAX_LOCATION_RECORDS - 1);
            records.push(LocationRecord::unknown());
        }
        records
    }

    /// Re-decode the event just written through the mirror reader cache
    /// and assert the reconstructed stack matches the raw one.
    #[allow(clippy::cast_possible_truncation)]
    fn verify_alloc_event(
        &mut self,
        event_start: usize,
        common: usize,
        stack: &[LocId],
    ) -> Result<()> {
        let mirror = self.mirror.as_mut().expect("mirror enabled");
        let mut buf = ReadBuf::new(&self.data_buf.written()[event_start..]);
        buf.get_u32()?; // header
        buf.get_vint()?; // length
        buf.get_vint()?; // samples
        buf.get_u8()?; // is_major
        let wire_common = buf.get_vint()? as usize;
        let ncodes = buf.get_u16()?;
        let mut decoded = Vec::new();
        mirror.cache.decode_suffix(ncodes, &mut buf, &mut decoded)?;

        assert_eq!(wire_common, common, "mirror decoded common prefix length");
        let mut rebuilt: Vec<LocId> = decoded.into_iter().rev().collect();
        rebuilt.extend_from_slice(&mirror.prev_stack[mirror.prev_stack.len() - wire_common..]);
        assert_eq!(rebuilt, stack, "mirror reconstructed backtrace");
        mirror.prev_stack = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TRACE_MAGIC;

    fn resolver(slot: RawSlot) -> Vec<LocationRecord> {
        vec![LocationRecord {
            filename: format!("mod{}.src", slot.0 % 7),
            defname: format!("fn{}", slot.0),
            line: u32::try_from(slot.0 % 1000).unwrap(),
            start_col: 1,
            end_col: 20,
        }]
    }

    fn test_writer() -> TraceWriter<Vec<u8>, fn(RawSlot) -> Vec<LocationRecord>, impl Clock> {
        let mut t = 0u64;
        let clock = move || {
            t += 1;
            #[allow(clippy::cast_precision_loss)]
            let s = t as f64 / 1e6;
            s
        };
        let mut w = TraceWriter::new(Vec::new(), resolver as fn(_) -> _, clock).unwrap();
        w.enable_debug_verify();
        w
    }

    fn slots(v: &[u64]) -> Vec<RawSlot> {
        v.iter().copied().map(RawSlot).collect()
    }

    #[test]
    fn empty_trace_is_one_empty_packet() {
        let w = test_writer();
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);

        let mut r = ReadBuf::new(&bytes);
        let header = PacketHeader::parse(&mut r).unwrap();
        assert_eq!(header.content_size, 0);
        assert_eq!(header.alloc_id_begin, 0);
        assert_eq!(header.alloc_id_end, 0);
    }

    #[test]
    fn alloc_ids_are_serial() {
        let mut w = test_writer();
        assert_eq!(w.alloc(4, 1, false, &slots(&[1, 2, 3])).unwrap(), 0);
        assert_eq!(w.alloc(4, 1, false, &slots(&[1, 2, 3])).unwrap(), 1);
        assert_eq!(w.next_alloc_id(), 2);
    }

    #[test]
    fn promote_of_unassigned_id_is_an_error() {
        let mut w = test_writer();
        w.alloc(4, 1, false, &slots(&[1])).unwrap();
        assert!(w.promote(0).is_ok());
        let err = w.promote(5).unwrap_err();
        assert!(matches!(err, HeapscopeError::BadFormat { .. }));
    }

    #[test]
    fn location_packets_precede_their_data_packet() {
        let mut w = test_writer();
        w.alloc(8, 1, false, &slots(&[10, 20])).unwrap();
        let bytes = w.finish().unwrap();

        // First packet on the wire must be a location packet: empty
        // alloc-ID interval.
        let mut r = ReadBuf::new(&bytes);
        let first = PacketHeader::parse(&mut r).unwrap();
        assert_eq!(first.alloc_id_begin, first.alloc_id_end);
        assert!(first.content_size > 0);

        r.sub_buf(first.content_size).unwrap();
        let second = PacketHeader::parse(&mut r).unwrap();
        assert_eq!(second.alloc_id_begin, 0);
        assert_eq!(second.alloc_id_end, 1);
    }

    #[test]
    fn pending_watermark_triggers_flush() {
        let mut w = test_writer();
        // Each alloc introduces one brand-new location ID; crossing the
        // watermark must emit packets mid-trace.
        for i in 0..(PENDING_WATERMARK as u64 + 10) {
            w.alloc(8, 1, false, &slots(&[1000 + i])).unwrap();
        }
        assert!(!w.dest.is_empty(), "flush happened before finish");
        let bytes = w.finish().unwrap();
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(magic, TRACE_MAGIC);
    }

    #[test]
    fn oversized_backtrace_overflows_without_corrupting_the_writer() {
        let mut w = test_writer();
        // First-sight misses cost ~10 bytes per frame, so a stack this
        // deep cannot fit the per-event cap.
        let deep: Vec<RawSlot> = (1..=MAX_EVENT_SIZE as u64).map(RawSlot).collect();
        let before = w.data_buf.pos();
        let err = w.alloc(8, 1, false, &deep).unwrap_err();
        assert!(matches!(err, HeapscopeError::Overflow { .. }));
        assert_eq!(w.data_buf.pos(), before, "aborted event leaves no bytes");
        assert_eq!(w.next_alloc_id(), 0, "no allocation ID was consumed");
        assert!(w.pending.is_empty(), "no location was registered");

        // Re-using frames from the failed stack must miss afresh; the
        // debug mirror rejects any codeword the rollback left dangling.
        w.alloc(8, 1, false, &slots(&[1, 2, 3])).unwrap();
        let bytes = w.finish().unwrap();
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(magic, TRACE_MAGIC);
    }

    #[test]
    fn identical_stacks_encode_to_empty_suffix() {
        let mut w = test_writer();
        let stack = slots(&[1, 2, 3, 4]);
        w.alloc(8, 1, false, &stack).unwrap();
        let before = w.data_buf.pos();
        w.alloc(8, 1, false, &stack).unwrap();
        let second_event = w.data_buf.pos() - before;
        // header(4) + length(1) + samples(1) + is_major(1) + common(1) +
        // ncodes(2): no codewords at all.
        assert_eq!(second_event, 10);
    }
}
