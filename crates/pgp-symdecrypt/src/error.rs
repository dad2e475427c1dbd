use thiserror::Error;

/// Ordinary decryption failures.
///
/// Every variant aborts the current attempt; none of them is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PgpError {
    #[error("heap exhausted while allocating {requested} bytes")]
    AllocationFailure { requested: usize },
    #[error("invalid arguments: {context}")]
    InvalidArguments { context: &'static str },
    #[error("malformed packet: {context}")]
    MalformedPacket { context: &'static str },
    #[error("unsupported {what} algorithm id {id}")]
    UnsupportedAlgorithm { what: &'static str, id: u8 },
    #[error("S2K iteration count {count} exceeds the configured maximum {max}")]
    S2kCountTooLarge { count: u32, max: u32 },
    #[error("modification detection code mismatch")]
    IntegrityFailure,
    #[error("quick-check of the CFB prefix failed; the key is probably wrong")]
    KeyMismatchSuspected,
}

impl PgpError {
    pub(crate) fn malformed(context: &'static str) -> Self {
        PgpError::MalformedPacket { context }
    }

    /// Negative status code reported at the entry point.
    pub fn status(&self) -> i32 {
        match self {
            PgpError::InvalidArguments { .. } => -1,
            PgpError::AllocationFailure { .. } => -2,
            PgpError::MalformedPacket { .. } => -3,
            PgpError::UnsupportedAlgorithm { .. } | PgpError::S2kCountTooLarge { .. } => -4,
            PgpError::IntegrityFailure => -5,
            PgpError::KeyMismatchSuspected => -6,
        }
    }
}

/// A broken internal invariant with no safe continuation.
///
/// Only reachable through programmer error (for example a secret buffer that still holds non-zero
/// bytes right after being wiped). The outermost caller decides whether to halt or report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("internal invariant violated: {what}")]
pub struct InvariantViolation {
    pub what: &'static str,
}

/// Status code used for every [`InvariantViolation`].
pub const STATUS_UNRECOVERABLE: i32 = -100;

/// Error returned by the decryption entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error(transparent)]
    Pgp(#[from] PgpError),
    #[error(transparent)]
    Unrecoverable(#[from] InvariantViolation),
}

impl DecryptError {
    pub fn status(&self) -> i32 {
        match self {
            DecryptError::Pgp(err) => err.status(),
            DecryptError::Unrecoverable(_) => STATUS_UNRECOVERABLE,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, DecryptError::Unrecoverable(_))
    }

    /// The ordinary error, if this is not a fail-stop condition.
    pub fn as_pgp(&self) -> Option<&PgpError> {
        match self {
            DecryptError::Pgp(err) => Some(err),
            DecryptError::Unrecoverable(_) => None,
        }
    }
}
