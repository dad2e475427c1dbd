//! Modification Detection Code (RFC 4880 §5.14).
//!
//! The digest covers the CFB prefix, every plaintext octet of the encrypted body, and the two
//! header octets of the MDC packet itself (`0xD3 0x14`).

use sha1::{Digest as _, Sha1};
use subtle::ConstantTimeEq as _;

use crate::error::PgpError;

pub const MDC_LEN: usize = 20;
/// New-format header of the MDC packet: tag 19, length 20.
pub const MDC_HEADER: [u8; 2] = [0xD3, 0x14];
/// Header plus digest.
pub const MDC_PACKET_LEN: usize = MDC_HEADER.len() + MDC_LEN;

#[derive(Clone, Default)]
pub struct MdcVerifier {
    hasher: Sha1,
}

impl MdcVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> [u8; MDC_LEN] {
        let mut out = [0u8; MDC_LEN];
        out.copy_from_slice(&self.hasher.finalize());
        out
    }

    /// Finalize and compare against the digest carried by the MDC packet.
    pub fn verify(self, expected: &[u8; MDC_LEN]) -> Result<(), PgpError> {
        let actual = self.finalize();
        if bool::from(actual.ct_eq(expected)) {
            Ok(())
        } else {
            log::warn!("mdc: digest mismatch");
            Err(PgpError::IntegrityFailure)
        }
    }
}

impl core::fmt::Debug for MdcVerifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("MdcVerifier { .. }")
    }
}
