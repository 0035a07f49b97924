//! Event model and body codecs.
//!
//! Every event starts with a `u32` header: the low 25 bits carry the
//! truncated microsecond timestamp, the high 7 bits the event code.
//! Codes 101..=116 are reserved for compact allocation encodings that no
//! writer emits; the reader rejects them rather than guess at their
//! layout, since skipping one silently would desynchronize the
//! allocation-ID counter.

use heapscope_error::{HeapscopeError, Result};
use heapscope_types::{
    location::unpack_bits, AllocId, LocId, LocationRecord, MtfTable, MTF_LITERAL, MTF_NOT_FOUND,
};

use crate::buf::{ReadBuf, WriteBuf};
use crate::packet::EVENT_TS_MASK;

/// Event discriminant stored in the high 7 bits of the event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// Declares the location records behind a location ID.
    Location = 0,
    /// A sampled allocation.
    Alloc = 1,
    /// Promotion of a previously sampled allocation.
    Promote = 2,
    /// Collection of a previously sampled allocation.
    Collect = 3,
}

const RESERVED_SHORT_ALLOC: std::ops::RangeInclusive<u8> = 101..=116;

impl EventCode {
    /// Decode the discriminant from an event header's high bits.
    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Location),
            1 => Ok(Self::Alloc),
            2 => Ok(Self::Promote),
            3 => Ok(Self::Collect),
            c if RESERVED_SHORT_ALLOC.contains(&c) => Err(HeapscopeError::bad_format(format!(
                "reserved short-alloc event code {c}"
            ))),
            c => Err(HeapscopeError::bad_format(format!(
                "unknown event code {c}"
            ))),
        }
    }
}

/// Pack an event header from a code and a full timestamp.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn event_header(code: EventCode, ts_ticks: u64) -> u32 {
    ((code as u32) << 25) | (ts_ticks & EVENT_TS_MASK) as u32
}

/// Split an event header into its truncated timestamp and code.
pub fn split_event_header(header: u32) -> Result<(u64, EventCode)> {
    let low_ts = u64::from(header) & EVENT_TS_MASK;
    let code = EventCode::from_wire(u8::try_from(header >> 25).expect("7 bits"))?;
    Ok((low_ts, code))
}

/// A sampled allocation, fully reconstructed by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocEvent {
    /// Serial number assigned to this allocation.
    pub obj_id: AllocId,
    /// Allocation size in words.
    pub length: u64,
    /// Number of samples attributed to this allocation.
    pub n_samples: u64,
    /// Whether the allocation went straight to the major heap.
    pub is_major: bool,
    /// Full backtrace, innermost frame first.
    pub backtrace: Vec<LocId>,
}

/// A decoded trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Declaration of the records behind a location ID.
    Location {
        id: LocId,
        records: Vec<LocationRecord>,
    },
    /// A sampled allocation.
    Alloc(AllocEvent),
    /// Promotion of `obj_id` to the major heap.
    Promote { obj_id: AllocId },
    /// Collection of `obj_id`.
    Collect { obj_id: AllocId },
}

/// Map the encoder-internal MTF miss signal to the 5-bit wire marker.
fn wire_name_code(code: u8) -> u8 {
    if code == MTF_NOT_FOUND {
        MTF_LITERAL
    } else {
        code
    }
}

/// Encode one location record: the 48-bit packed word as LE `u32` + `u16`,
/// then any literal strings in field order (defname before filename).
pub fn put_location_record(
    buf: &mut WriteBuf,
    rec: &LocationRecord,
    file_mtf: &mut MtfTable,
    def_mtf: &mut MtfTable,
) -> Result<()> {
    let def_code = def_mtf.encode(&rec.defname);
    let file_code = file_mtf.encode(&rec.filename);
    let bits = rec.pack_bits(wire_name_code(def_code), wire_name_code(file_code));
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(bits as u32)?;
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16((bits >> 32) as u16)?;
    if def_code == MTF_NOT_FOUND {
        buf.put_str(&rec.defname)?;
    }
    if file_code == MTF_NOT_FOUND {
        buf.put_str(&rec.filename)?;
    }
    Ok(())
}

fn decode_name(buf: &mut ReadBuf<'_>, code: u8, mtf: &mut MtfTable, what: &str) -> Result<String> {
    if code == MTF_LITERAL {
        let s = buf.get_str()?.to_owned();
        mtf.insert(s.clone());
        Ok(s)
    } else {
        mtf.decode_hit(code)
            .map(str::to_owned)
            .ok_or_else(|| HeapscopeError::bad_format(format!("{what} MTF index {code} out of range")))
    }
}

/// Decode one location record, mirroring [`put_location_record`].
pub fn get_location_record(
    buf: &mut ReadBuf<'_>,
    file_mtf: &mut MtfTable,
    def_mtf: &mut MtfTable,
) -> Result<LocationRecord> {
    let low = u64::from(buf.get_u32()?);
    let high = u64::from(buf.get_u16()?);
    let (line, start_col, end_col, def_code, file_code) = unpack_bits(low | (high << 32));
    let defname = decode_name(buf, def_code, def_mtf, "defname")?;
    let filename = decode_name(buf, file_code, file_mtf, "filename")?;
    Ok(LocationRecord {
        filename,
        defname,
        line,
        start_col,
        end_col,
    })
}

/// Encode a location event body: `u64 id`, `u8 nlocs`, then the records.
pub fn put_location_event(
    buf: &mut WriteBuf,
    id: LocId,
    records: &[LocationRecord],
    file_mtf: &mut MtfTable,
    def_mtf: &mut MtfTable,
) -> Result<()> {
    debug_assert!(!records.is_empty() && records.len() <= usize::from(u8::MAX));
    buf.put_u64(id.0)?;
    buf.put_u8(u8::try_from(records.len()).expect("caller bounds nlocs"))?;
    for rec in records {
        put_location_record(buf, rec, file_mtf, def_mtf)?;
    }
    Ok(())
}

/// Decode a location event body.
pub fn get_location_event(
    buf: &mut ReadBuf<'_>,
    file_mtf: &mut MtfTable,
    def_mtf: &mut MtfTable,
) -> Result<(LocId, Vec<LocationRecord>)> {
    let id = LocId(buf.get_u64()?);
    let nlocs = buf.get_u8()?;
    HeapscopeError::check_format(nlocs >= 1, "location event with zero records")?;
    let mut records = Vec::with_capacity(usize::from(nlocs));
    for _ in 0..nlocs {
        records.push(get_location_record(buf, file_mtf, def_mtf)?);
    }
    Ok((id, records))
}
