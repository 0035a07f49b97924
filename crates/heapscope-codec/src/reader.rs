//! Trace reader: parses a finalized stream into a timestamped event
//! iterator.
//!
//! Packets are consumed strictly in order. Each packet header is
//! validated, a sub-buffer of exactly `content_size` bytes is sliced off,
//! and events are dispatched until that sub-buffer drains. The reader
//! owns a parallel backtrace cache that mirrors the writer's decisions by
//! replaying the wire codes, and a location table populated by location
//! events.
//!
//! The trace does not carry the traced runtime's word size; analysis
//! assumes 8-byte words.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;

use tracing::debug;

use heapscope_error::{HeapscopeError, Result};
use heapscope_types::{AllocId, LocId, LocationRecord, MtfTable};

use crate::buf::ReadBuf;
use crate::cache::ReaderCache;
use crate::event::{get_location_event, split_event_header, AllocEvent, Event, EventCode};
use crate::packet::{splice_timestamp, PacketHeader, PACKET_HEADER_SIZE};

/// Per-event decoding state, separate from the packet plumbing so event
/// dispatch can borrow the packet bytes alongside it.
struct EventState {
    cache: ReaderCache,
    file_mtf: MtfTable,
    def_mtf: MtfTable,
    locations: HashMap<LocId, Vec<LocationRecord>>,
    prev_stack: Vec<LocId>,
    alloc_id: u64,
    last_event_ts: u64,
}

impl EventState {
    fn read_event(&mut self, header: PacketHeader, buf: &mut ReadBuf<'_>) -> Result<(u64, Event)> {
        let (low_ts, code) = split_event_header(buf.get_u32()?)?;
        let ts = splice_timestamp(header.ts_begin, low_ts);
        HeapscopeError::check_format(
            ts >= self.last_event_ts && ts <= header.ts_end,
            format!(
                "event timestamp {ts} outside [{}, {}]",
                self.last_event_ts, header.ts_end
            ),
        )?;

        let event = match code {
            EventCode::Location => self.read_location(buf)?,
            EventCode::Alloc => self.read_alloc(buf)?,
            EventCode::Promote => Event::Promote {
                obj_id: self.delta_target(buf)?,
            },
            EventCode::Collect => Event::Collect {
                obj_id: self.delta_target(buf)?,
            },
        };

        self.last_event_ts = ts;
        Ok((ts, event))
    }

    fn read_location(&mut self, buf: &mut ReadBuf<'_>) -> Result<Event> {
        let (id, records) = get_location_event(buf, &mut self.file_mtf, &mut self.def_mtf)?;
        match self.locations.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(records.clone());
            }
            Entry::Occupied(existing) => {
                HeapscopeError::check_format(
                    existing.get() == &records,
                    format!("location {:#x} re-declared with different records", id.0),
                )?;
            }
        }
        Ok(Event::Location { id, records })
    }

    fn read_alloc(&mut self, buf: &mut ReadBuf<'_>) -> Result<Event> {
        let length = buf.get_vint()?;
        let n_samples = buf.get_vint()?;
        let is_major = match buf.get_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(HeapscopeError::bad_format(format!(
                    "is_major flag must be 0 or 1, got {other}"
                )))
            }
        };
        let common = usize::try_from(buf.get_vint()?)
            .map_err(|_| HeapscopeError::bad_format("common prefix length does not fit memory"))?;
        HeapscopeError::check_format(
            common <= self.prev_stack.len(),
            format!(
                "common prefix {common} exceeds previous stack depth {}",
                self.prev_stack.len()
            ),
        )?;

        let ncodes = buf.get_u16()?;
        let mut decoded = Vec::new();
        let misses = self.cache.decode_suffix(ncodes, buf, &mut decoded)?;
        for id in misses {
            HeapscopeError::check_format(
                self.locations.contains_key(&id),
                format!("allocation references undeclared location {:#x}", id.0),
            )?;
        }

        // Decoded frames arrive oldest-new-first; the stack is newest
        // first with the shared frames at the deep end.
        let mut backtrace: Vec<LocId> = decoded.into_iter().rev().collect();
        backtrace.extend_from_slice(&self.prev_stack[self.prev_stack.len() - common..]);
        self.prev_stack.clone_from(&backtrace);

        let obj_id = AllocId(self.alloc_id);
        self.alloc_id += 1;
        Ok(Event::Alloc(AllocEvent {
            obj_id,
            length,
            n_samples,
            is_major,
            backtrace,
        }))
    }

    fn delta_target(&mut self, buf: &mut ReadBuf<'_>) -> Result<AllocId> {
        let delta = buf.get_vint()?;
        HeapscopeError::check_format(
            delta < self.alloc_id,
            format!(
                "event delta {delta} reaches before the first allocation (counter {})",
                self.alloc_id
            ),
        )?;
        Ok(AllocId(self.alloc_id - 1 - delta))
    }
}

/// Streaming reader for the sampled-allocation trace format.
pub struct TraceReader<R: Read> {
    src: R,
    state: EventState,
    /// Bytes of the packet currently being drained.
    packet: Vec<u8>,
    packet_pos: usize,
    packet_header: Option<PacketHeader>,
    /// Interval-abutment state: end of the previous packet, if any.
    prev_packet: Option<(u64, u64)>, // (ts_end, alloc_id_end)
}

impl<R: Read> TraceReader<R> {
    /// Open a reader over `src`. Nothing is read until the first event is
    /// requested.
    pub fn new(src: R) -> Self {
        Self {
            src,
            state: EventState {
                cache: ReaderCache::new(),
                file_mtf: MtfTable::new(),
                def_mtf: MtfTable::new(),
                locations: HashMap::new(),
                prev_stack: Vec::new(),
                alloc_id: 0,
                last_event_ts: 0,
            },
            packet: Vec::new(),
            packet_pos: 0,
            packet_header: None,
            prev_packet: None,
        }
    }

    /// The location table accumulated so far.
    #[must_use]
    pub fn locations(&self) -> &HashMap<LocId, Vec<LocationRecord>> {
        &self.state.locations
    }

    /// Inlined frames behind a location ID, outermost first.
    #[must_use]
    pub fn resolve(&self, id: LocId) -> Option<&[LocationRecord]> {
        self.state.locations.get(&id).map(Vec::as_slice)
    }

    /// Pull the next event, or `None` at a clean end of stream.
    pub fn next_event(&mut self) -> Result<Option<(u64, Event)>> {
        loop {
            let Some(header) = self.packet_header else {
                if self.open_next_packet()? {
                    continue;
                }
                return Ok(None);
            };
            if self.packet_pos == self.packet.len() {
                self.close_packet(header)?;
                continue;
            }
            let mut buf = ReadBuf::new(&self.packet[self.packet_pos..]);
            let (ts, event) = self.state.read_event(header, &mut buf)?;
            self.packet_pos += buf.pos();
            return Ok(Some((ts, event)));
        }
    }

    /// Drive the whole stream, handing every event to `consume`.
    pub fn for_each_event<F>(mut self, mut consume: F) -> Result<()>
    where
        F: FnMut(u64, &Event) -> Result<()>,
    {
        while let Some((ts, event)) = self.next_event()? {
            consume(ts, &event)?;
        }
        Ok(())
    }

    /// Read and validate the next packet header plus content. Returns
    /// false at a clean end of stream.
    fn open_next_packet(&mut self) -> Result<bool> {
        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        let got = read_up_to(&mut self.src, &mut header_bytes)?;
        if got == 0 {
            return Ok(false);
        }
        if got < PACKET_HEADER_SIZE {
            return Err(HeapscopeError::TraceTruncated {
                expected: PACKET_HEADER_SIZE,
                actual: got,
            });
        }

        let header = PacketHeader::parse(&mut ReadBuf::new(&header_bytes))?;
        self.packet.resize(header.content_size, 0);
        let got = read_up_to(&mut self.src, &mut self.packet)?;
        if got < header.content_size {
            return Err(HeapscopeError::TraceTruncated {
                expected: header.content_size,
                actual: got,
            });
        }

        if let Some((prev_ts_end, prev_alloc_end)) = self.prev_packet {
            HeapscopeError::check_format(
                header.ts_begin >= prev_ts_end,
                format!(
                    "packet timestamps regress across boundary: {} < {prev_ts_end}",
                    header.ts_begin
                ),
            )?;
            HeapscopeError::check_format(
                header.alloc_id_begin == prev_alloc_end,
                format!(
                    "allocation IDs do not abut across packets: {} after {prev_alloc_end}",
                    header.alloc_id_begin
                ),
            )?;
        }

        self.state.alloc_id = header.alloc_id_begin;
        self.state.last_event_ts = header.ts_begin;
        self.packet_pos = 0;
        self.packet_header = Some(header);
        debug!(
            content_size = header.content_size,
            alloc_id_begin = header.alloc_id_begin,
            alloc_id_end = header.alloc_id_end,
            "packet opened"
        );
        Ok(true)
    }

    fn close_packet(&mut self, header: PacketHeader) -> Result<()> {
        self.packet_header = None;
        HeapscopeError::check_format(
            self.state.alloc_id == header.alloc_id_end,
            format!(
                "packet declared allocations up to {} but events reached {}",
                header.alloc_id_end, self.state.alloc_id
            ),
        )?;
        self.prev_packet = Some((header.ts_end, header.alloc_id_end));
        Ok(())
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<(u64, Event)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Read until `buf` is full or EOF; returns the bytes read.
fn read_up_to<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
