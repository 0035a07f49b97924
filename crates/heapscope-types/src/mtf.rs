//! Move-to-front coding of filename and definition-name strings.
//!
//! A table holds 15 entries. Hits encode as the index the string occupied
//! before promotion; misses encode as the literal marker (31 in the 5-bit
//! wire field) followed by the string itself. The encoder applies the same
//! shift on a miss that the decoder applies on a literal, which is what
//! keeps the two tables in lockstep.

/// Number of entries in a move-to-front table.
pub const MTF_LEN: usize = 15;

/// Value returned by [`MtfTable::encode`] when the string is not present.
pub const MTF_NOT_FOUND: u8 = 15;

/// 5-bit wire marker meaning "literal string follows".
pub const MTF_LITERAL: u8 = 31;

/// A 15-slot move-to-front table.
///
/// Initial contents are 15 distinct placeholders containing a NUL byte,
/// which no wire-encoded string can equal (strings are NUL-terminated on
/// the wire).
#[derive(Debug, Clone)]
pub struct MtfTable {
    entries: [String; MTF_LEN],
}

impl Default for MtfTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MtfTable {
    /// Create a table with its 15 distinct initial placeholders.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|i| format!("\u{0}{i}")),
        }
    }

    /// Encode `s`: returns its index before promotion if present, else
    /// [`MTF_NOT_FOUND`]. Either way `s` ends up at index 0 with the
    /// intervening entries shifted down one slot.
    #[must_use]
    pub fn encode(&mut self, s: &str) -> u8 {
        match self.entries.iter().position(|e| e == s) {
            Some(i) => {
                self.entries[..=i].rotate_right(1);
                u8::try_from(i).expect("table index fits u8")
            }
            None => {
                self.insert(s.to_owned());
                MTF_NOT_FOUND
            }
        }
    }

    /// Decode a hit at `index`: promote that entry to the front and return
    /// the string. Returns `None` if `index >= MTF_LEN`.
    pub fn decode_hit(&mut self, index: u8) -> Option<&str> {
        let i = usize::from(index);
        if i >= MTF_LEN {
            return None;
        }
        self.entries[..=i].rotate_right(1);
        Some(&self.entries[0])
    }

    /// Install a literal at the front, shifting every entry down and
    /// dropping the last.
    pub fn insert(&mut self, s: String) {
        self.entries.rotate_right(1);
        self.entries[0] = s;
    }
}
