//! OpenPGP symmetric decryption for environments without an allocator or file system.
//!
//! This crate supports:
//! - SKESK (tag 3) with Simple, Salted and Iterated+Salted SHA-1 S2K, with or without an
//!   encrypted session key
//! - Symmetrically Encrypted Integrity Protected Data (tag 18) with MDC verification
//! - legacy Symmetrically Encrypted Data (tag 9), reported as integrity-not-verified
//! - CAST5 in OpenPGP CFB mode, including the quick-check and resync
//! - fixed, partial and indeterminate body lengths through a stacked filter chain
//!
//! Working memory for key material comes from a fixed arena [`Heap`]; plaintext is emitted one
//! octet at a time through a [`CharSink`].

pub mod cast5;
pub mod cfb;
pub mod decrypt;
pub mod error;
pub mod heap;
pub mod iobuf;
pub mod mdc;
pub mod packet;
pub mod s2k;
pub mod sink;


pub use decrypt::{
    decrypt_message, unified_decrypt, ControlContext, DecryptLimits, DecryptOptions,
    DecryptOutcome, DecryptState, Integrity, QuickCheckPolicy, STATUS_INTEGRITY_SKIPPED,
    STATUS_OK,
};
pub use error::{DecryptError, InvariantViolation, PgpError, STATUS_UNRECOVERABLE};
pub use heap::{Heap, HeapBuf, SecretBuf};
pub use sink::{CharSink, CollectSink, PutChar, PutCharLogger};
