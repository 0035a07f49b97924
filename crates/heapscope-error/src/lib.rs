//! Error types shared across the heapscope trace codec and analyzer.

use thiserror::Error;

/// Primary error type for heapscope operations.
///
/// Codec errors are structural and non-recoverable within a packet: the
/// parser abandons the trace and returns the error to the caller. No
/// resynchronization is attempted.
#[derive(Error, Debug)]
pub enum HeapscopeError {
    // === Buffer errors ===
    /// Write past the end of a bounded buffer.
    #[error("buffer overflow at byte {pos}")]
    Overflow { pos: usize },

    /// Read past the end of a bounded buffer.
    #[error("buffer underflow at byte {pos}")]
    Underflow { pos: usize },

    // === Format errors ===
    /// A parsed structural invariant was violated: bad magic, inconsistent
    /// sizes, non-monotone timestamps or allocation IDs, inconsistent
    /// re-declared location, unknown event code.
    #[error("malformed trace: {detail}")]
    BadFormat { detail: String },

    /// The stream ended inside a packet whose header promised more bytes.
    #[error("trace truncated: packet needs {expected} bytes, only {actual} available")]
    TraceTruncated { expected: usize, actual: usize },

    // === Analyzer errors ===
    /// Frequency floor outside `(0, 1]`.
    #[error("frequency must be in (0, 1], got {value}")]
    InvalidFrequency { value: f64 },

    // === I/O ===
    /// File I/O error from the trace destination or source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeapscopeError {
    /// Create a `BadFormat` error.
    pub fn bad_format(detail: impl Into<String>) -> Self {
        Self::BadFormat {
            detail: detail.into(),
        }
    }

    /// Raise `BadFormat` with `detail` unless `cond` holds.
    ///
    /// This is the codec's format-check helper: every parsed invariant goes
    /// through it so violations carry a message rather than a panic.
    pub fn check_format(cond: bool, detail: impl Into<String>) -> Result<()> {
        if cond {
            Ok(())
        } else {
            Err(Self::bad_format(detail))
        }
    }

    /// Whether the error indicates a corrupt or truncated trace (as opposed
    /// to an environmental failure).
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Overflow { .. }
                | Self::Underflow { .. }
                | Self::BadFormat { .. }
                | Self::TraceTruncated { .. }
        )
    }

    /// Process exit code for CLI use: 1 for corrupt input or bad arguments,
    /// 2 for I/O failures.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias using `HeapscopeError`.
pub type Result<T> = std::result::Result<T, HeapscopeError>;
