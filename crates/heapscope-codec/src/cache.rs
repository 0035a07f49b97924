//! Bucketed backtrace cache with next-location prediction.
//!
//! The writer compresses the non-shared frames of each stack through a
//! 2^14-bucket cache of location IDs. Every frame produces (at most) one
//! codeword:
//!
//! ```text
//! u16 codeword = bucket:14 | tag:2
//!   tag 0 = hit, no predicted frames follow
//!   tag 1 = hit, exactly one predicted frame follows
//!   tag 2 = hit, u8 run of predicted frames follows
//!   tag 3 = miss, u64 literal location ID follows
//! ```
//!
//! Each bucket remembers the bucket chosen for the frame that followed it
//! last time (`next`). After a hit the encoder walks that chain greedily,
//! consuming frames without emitting codewords for as long as the chain
//! keeps predicting correctly; the run length is folded into the tag or an
//! explicit byte. The reader replays every decision from the codewords, so
//! the two caches stay bit-identical without any synchronization metadata.

use heapscope_error::{HeapscopeError, Result};
use heapscope_types::LocId;

use crate::buf::{ReadBuf, WriteBuf};

/// Bits in a cache bucket index.
pub const CACHE_BITS: u32 = 14;

/// Number of cache buckets.
pub const CACHE_SIZE: usize = 1 << CACHE_BITS;

const TAG_HIT0: u16 = 0;
const TAG_HIT1: u16 = 1;
const TAG_HIT_RUN: u16 = 2;
const TAG_MISS: u16 = 3;

/// Longest run of predicted frames a single codeword can carry.
const MAX_RUN: u8 = u8::MAX;

// Two independent multiplicative hashes disperse aligned code addresses
// across the bucket space. Multipliers must be odd.
const HASH_MUL_A: u64 = 0x9E37_79B9_7F4A_7C15;
const HASH_MUL_B: u64 = 0xC2B2_AE3D_27D4_EB4F;

#[allow(clippy::cast_possible_truncation)]
fn bucket_a(id: LocId) -> u16 {
    id.mix(HASH_MUL_A, CACHE_BITS) as u16
}

#[allow(clippy::cast_possible_truncation)]
fn bucket_b(id: LocId) -> u16 {
    id.mix(HASH_MUL_B, CACHE_BITS) as u16
}

/// One reversible cache mutation, journaled so a failed encode unwinds
/// completely instead of leaving the cache ahead of the wire.
#[derive(Debug, Clone, Copy)]
enum Saved {
    Loc(u16, Option<LocId>),
    Date(u16, u64),
    Next(u16, u16),
}

/// Writer-side cache: owns eviction decisions and the prediction chain.
#[derive(Debug)]
pub struct WriterCache {
    loc: Vec<Option<LocId>>,
    /// Most recent allocation ID that touched each bucket. Eviction on a
    /// miss takes the older of the two candidates.
    date: Vec<u64>,
    next: Vec<u16>,
}

impl Default for WriterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loc: vec![None; CACHE_SIZE],
            date: vec![0; CACHE_SIZE],
            next: vec![0; CACHE_SIZE],
        }
    }

    /// Encode the non-shared frames of a stack, oldest new frame first.
    ///
    /// Emits codewords into `buf` and returns `(ncodes, miss_positions)`
    /// where `miss_positions` indexes into `frames` for every literal that
    /// went to the wire (the writer registers unseen IDs from these).
    ///
    /// Failure-atomic: an `Overflow` mid-stack rolls every bucket back, so
    /// the cache never remembers a codeword the wire never carried.
    pub fn encode_suffix(
        &mut self,
        frames: &[LocId],
        alloc_id: u64,
        buf: &mut WriteBuf,
    ) -> Result<(u16, Vec<usize>)> {
        let mut undo = Vec::new();
        match self.encode_frames(frames, alloc_id, buf, &mut undo) {
            Ok(out) => Ok(out),
            Err(err) => {
                for saved in undo.into_iter().rev() {
                    match saved {
                        Saved::Loc(b, v) => self.loc[usize::from(b)] = v,
                        Saved::Date(b, v) => self.date[usize::from(b)] = v,
                        Saved::Next(b, v) => self.next[usize::from(b)] = v,
                    }
                }
                Err(err)
            }
        }
    }

    fn encode_frames(
        &mut self,
        frames: &[LocId],
        alloc_id: u64,
        buf: &mut WriteBuf,
        undo: &mut Vec<Saved>,
    ) -> Result<(u16, Vec<usize>)> {
        let mut ncodes: u16 = 0;
        let mut misses = Vec::new();
        let mut predictor: u16 = 0;
        let mut i = 0;

        while i < frames.len() {
            let id = frames[i];
            let (b1, b2) = (bucket_a(id), bucket_b(id));
            let hit_bucket = if self.loc[usize::from(b1)] == Some(id) {
                Some(b1)
            } else if self.loc[usize::from(b2)] == Some(id) {
                Some(b2)
            } else {
                None
            };

            match hit_bucket {
                Some(bucket) => {
                    self.set_date(bucket, alloc_id, undo);
                    self.set_next(predictor, bucket, undo);

                    // Greedy prediction extension: follow the chain while it
                    // keeps naming the next frame.
                    let mut chain = bucket;
                    let mut run: u8 = 0;
                    while run < MAX_RUN && i + 1 + usize::from(run) < frames.len() {
                        let predicted = self.next[usize::from(chain)];
                        if self.loc[usize::from(predicted)]
                            != Some(frames[i + 1 + usize::from(run)])
                        {
                            break;
                        }
                        self.set_date(predicted, alloc_id, undo);
                        chain = predicted;
                        run += 1;
                    }

                    match run {
                        0 => buf.put_u16(bucket << 2 | TAG_HIT0)?,
                        1 => buf.put_u16(bucket << 2 | TAG_HIT1)?,
                        n => {
                            buf.put_u16(bucket << 2 | TAG_HIT_RUN)?;
                            buf.put_u8(n)?;
                        }
                    }
                    ncodes += 1;
                    predictor = chain;
                    i += 1 + usize::from(run);
                }
                None => {
                    // Evict whichever candidate went longest unused. The
                    // codeword goes to the wire before the bucket changes
                    // hands.
                    let bucket = if self.date[usize::from(b1)] <= self.date[usize::from(b2)] {
                        b1
                    } else {
                        b2
                    };
                    buf.put_u16(bucket << 2 | TAG_MISS)?;
                    buf.put_u64(id.0)?;

                    self.set_loc(bucket, id, undo);
                    self.set_date(bucket, alloc_id, undo);
                    self.set_next(predictor, bucket, undo);
                    ncodes += 1;
                    misses.push(i);
                    predictor = bucket;
                    i += 1;
                }
            }
        }

        Ok((ncodes, misses))
    }

    fn set_loc(&mut self, bucket: u16, id: LocId, undo: &mut Vec<Saved>) {
        undo.push(Saved::Loc(bucket, self.loc[usize::from(bucket)]));
        self.loc[usize::from(bucket)] = Some(id);
    }

    fn set_date(&mut self, bucket: u16, date: u64, undo: &mut Vec<Saved>) {
        undo.push(Saved::Date(bucket, self.date[usize::from(bucket)]));
        self.date[usize::from(bucket)] = date;
    }

    fn set_next(&mut self, bucket: u16, next: u16, undo: &mut Vec<Saved>) {
        undo.push(Saved::Next(bucket, self.next[usize::from(bucket)]));
        self.next[usize::from(bucket)] = next;
    }
}

/// Reader-side cache: replays the writer's decisions from the codewords.
///
/// Buckets are always explicit on the wire, so the reader needs no dates;
/// it installs literals where the codeword says and walks the same
/// prediction chains.
#[derive(Debug)]
pub struct ReaderCache {
    loc: Vec<Option<LocId>>,
    next: Vec<u16>,
}

impl Default for ReaderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loc: vec![None; CACHE_SIZE],
            next: vec![0; CACHE_SIZE],
        }
    }

    /// Decode `ncodes` codewords, appending frames to `out` in the order
    /// the encoder consumed them (oldest new frame first). Returns the
    /// location IDs that arrived as literals.
    pub fn decode_suffix(
        &mut self,
        ncodes: u16,
        buf: &mut ReadBuf<'_>,
        out: &mut Vec<LocId>,
    ) -> Result<Vec<LocId>> {
        let mut misses = Vec::new();
        let mut predictor: u16 = 0;

        for _ in 0..ncodes {
            let code = buf.get_u16()?;
            let bucket = code >> 2;
            let tag = code & 0x3;

            if tag == TAG_MISS {
                let id = LocId(buf.get_u64()?);
                self.loc[usize::from(bucket)] = Some(id);
                self.next[usize::from(predictor)] = bucket;
                out.push(id);
                misses.push(id);
                predictor = bucket;
                continue;
            }

            let run = match tag {
                TAG_HIT0 => 0,
                TAG_HIT1 => 1,
                _ => buf.get_u8()?,
            };
            let id = self.cached(bucket)?;
            self.next[usize::from(predictor)] = bucket;
            out.push(id);

            let mut chain = bucket;
            for _ in 0..run {
                chain = self.next[usize::from(chain)];
                out.push(self.cached(chain)?);
            }
            predictor = chain;
        }

        Ok(misses)
    }

    fn cached(&self, bucket: u16) -> Result<LocId> {
        self.loc[usize::from(bucket)].ok_or_else(|| {
            HeapscopeError::bad_format(format!("backtrace hit on empty cache bucket {bucket}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u64]) -> Vec<LocId> {
        v.iter().copied().map(LocId).collect()
    }

    /// Encode then decode one suffix, asserting frame-exact reconstruction.
    fn round_trip(
        w: &mut WriterCache,
        r: &mut ReaderCache,
        frames: &[LocId],
        alloc_id: u64,
    ) -> (u16, Vec<usize>) {
        let mut buf = WriteBuf::new(1 << 16);
        let (ncodes, misses) = w.encode_suffix(frames, alloc_id, &mut buf).unwrap();
        let mut rd = ReadBuf::new(buf.written());
        let mut out = Vec::new();
        r.decode_suffix(ncodes, &mut rd, &mut out).unwrap();
        assert!(rd.is_empty(), "decoder consumed every codeword byte");
        assert_eq!(out, frames, "reconstructed suffix");
        (ncodes, misses)
    }

    #[test]
    fn first_sight_is_all_misses() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        let frames = ids(&[10, 20, 30]);
        let (ncodes, misses) = round_trip(&mut w, &mut r, &frames, 0);
        assert_eq!(ncodes, 3);
        assert_eq!(misses, vec![0, 1, 2]);
    }

    #[test]
    fn repeat_collapses_to_one_predicted_run() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        let frames = ids(&[10, 20, 30, 40]);
        round_trip(&mut w, &mut r, &frames, 0);

        // Second time through: one hit codeword, rest predicted.
        let (ncodes, misses) = round_trip(&mut w, &mut r, &frames, 1);
        assert_eq!(ncodes, 1);
        assert!(misses.is_empty());
    }

    #[test]
    fn diverging_tail_breaks_the_run() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        round_trip(&mut w, &mut r, &ids(&[10, 20, 30]), 0);

        // Prefix matches, last frame diverges: hit-run then a miss.
        let (ncodes, misses) = round_trip(&mut w, &mut r, &ids(&[10, 20, 99]), 1);
        assert_eq!(ncodes, 2);
        assert_eq!(misses, vec![2]);
    }

    #[test]
    fn run_saturates_at_255_and_resumes() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        let long: Vec<LocId> = (1..=300).map(LocId).collect();
        round_trip(&mut w, &mut r, &long, 0);

        // 300 frames: one hit + 255 predicted, then a fresh hit + the rest.
        let (ncodes, misses) = round_trip(&mut w, &mut r, &long, 1);
        assert_eq!(ncodes, 2);
        assert!(misses.is_empty());
    }

    #[test]
    fn capacity_pressure_forces_evictions() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        let n = 20_000u64;

        // Install more distinct IDs than the cache holds.
        for batch in 0..(n / 100) {
            let frames: Vec<LocId> = (batch * 100..(batch + 1) * 100).map(|v| LocId(v + 1)).collect();
            round_trip(&mut w, &mut r, &frames, batch);
        }

        // Re-encoding all of them cannot hit more often than there are
        // buckets, so evictions must show up as fresh misses — and the
        // reader must keep mirroring through them.
        let mut total_misses = 0usize;
        for batch in 0..(n / 100) {
            let frames: Vec<LocId> = (batch * 100..(batch + 1) * 100).map(|v| LocId(v + 1)).collect();
            let (_, misses) = round_trip(&mut w, &mut r, &frames, n / 100 + batch);
            total_misses += misses.len();
        }
        assert!(total_misses >= n as usize - CACHE_SIZE);
    }

    #[test]
    fn failed_encode_rolls_the_cache_back() {
        let mut w = WriterCache::new();
        let mut r = ReaderCache::new();
        let frames: Vec<LocId> = (1..=100).map(LocId).collect();

        // 100 first-sight misses need 1000 bytes; this window cannot hold
        // them, so the encode dies partway through the stack.
        let mut small = WriteBuf::new(64);
        let err = w.encode_suffix(&frames, 0, &mut small).unwrap_err();
        assert!(matches!(err, HeapscopeError::Overflow { .. }));

        // Nothing stuck: every frame still misses, and the reader decodes
        // the retry in lockstep.
        let (ncodes, misses) = round_trip(&mut w, &mut r, &frames, 1);
        assert_eq!(ncodes, 100);
        assert_eq!(misses.len(), 100);
    }

    #[test]
    fn decoder_rejects_hit_on_empty_bucket() {
        let mut buf = WriteBuf::new(8);
        buf.put_u16(7 << 2 | TAG_HIT0).unwrap();
        let mut r = ReaderCache::new();
        let err = r
            .decode_suffix(1, &mut ReadBuf::new(buf.written()), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("empty cache bucket"));
    }
}
