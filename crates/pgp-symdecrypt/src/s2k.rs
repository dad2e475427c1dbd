//! OpenPGP string-to-key (RFC 4880 §3.7) over SHA-1.

use sha1::{Digest as _, Sha1};
use zeroize::Zeroize;

use crate::error::PgpError;

/// OpenPGP hash algorithm id for SHA-1, the only S2K hash wired in.
pub const HASH_SHA1: u8 = 2;
pub const SALT_LEN: usize = 8;
const SHA1_LEN: usize = 20;

/// Largest byte count expressible by the coded count octet (`0xFF`).
pub const DEFAULT_MAX_S2K_COUNT: u32 = 65_011_712;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2kMode {
    /// Mode 0: hash the passphrase.
    Simple,
    /// Mode 1: hash `salt || passphrase`.
    Salted,
    /// Mode 3: hash `salt || passphrase` repeated up to the decoded byte count.
    IteratedSalted,
}

impl S2kMode {
    pub fn from_id(id: u8) -> Result<Self, PgpError> {
        match id {
            0 => Ok(S2kMode::Simple),
            1 => Ok(S2kMode::Salted),
            3 => Ok(S2kMode::IteratedSalted),
            other => Err(PgpError::UnsupportedAlgorithm {
                what: "S2K mode",
                id: other,
            }),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            S2kMode::Simple => 0,
            S2kMode::Salted => 1,
            S2kMode::IteratedSalted => 3,
        }
    }
}

/// Parsed S2K specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S2k {
    pub mode: S2kMode,
    pub hash_algorithm: u8,
    /// All zero for [`S2kMode::Simple`].
    pub salt: [u8; SALT_LEN],
    /// Only meaningful for [`S2kMode::IteratedSalted`].
    pub coded_count: u8,
}

/// Decode the one-octet iteration count: `(16 + (c & 15)) << ((c >> 4) + 6)`.
pub fn decode_count(coded: u8) -> u32 {
    (16 + u32::from(coded & 15)) << ((coded >> 4) + 6)
}

impl S2k {
    /// Number of bytes fed to the hash per output block, before the passphrase-length floor.
    pub fn byte_count(&self) -> u32 {
        match self.mode {
            S2kMode::IteratedSalted => decode_count(self.coded_count),
            S2kMode::Simple | S2kMode::Salted => 0,
        }
    }

    /// Fill `out` with key material derived from `passphrase`.
    ///
    /// Keys longer than one digest are extended with further hash contexts, the n-th one
    /// preloaded with n zero octets.
    pub fn derive_into(
        &self,
        passphrase: &[u8],
        out: &mut [u8],
        max_count: u32,
    ) -> Result<(), PgpError> {
        if self.hash_algorithm != HASH_SHA1 {
            return Err(PgpError::UnsupportedAlgorithm {
                what: "S2K hash",
                id: self.hash_algorithm,
            });
        }
        let count = self.byte_count();
        if count > max_count {
            return Err(PgpError::S2kCountTooLarge {
                count,
                max: max_count,
            });
        }
        log::debug!(
            "s2k: mode {} over {} bytes into a {}-byte key",
            self.mode.id(),
            count,
            out.len()
        );

        let salt: &[u8] = match self.mode {
            S2kMode::Simple => &[],
            S2kMode::Salted | S2kMode::IteratedSalted => &self.salt,
        };

        for (preload, chunk) in out.chunks_mut(SHA1_LEN).enumerate() {
            let mut hasher = Sha1::new();
            for _ in 0..preload {
                hasher.update([0u8]);
            }
            match self.mode {
                S2kMode::IteratedSalted => {
                    hash_repeated(&mut hasher, salt, passphrase, count as usize)
                }
                S2kMode::Simple | S2kMode::Salted => {
                    hasher.update(salt);
                    hasher.update(passphrase);
                }
            }
            let mut digest = hasher.finalize();
            chunk.copy_from_slice(&digest[..chunk.len()]);
            digest.as_mut_slice().zeroize();
        }
        Ok(())
    }
}

/// Hash `salt || passphrase` repeatedly until `count` bytes went in, never less than one copy.
fn hash_repeated(hasher: &mut Sha1, salt: &[u8], passphrase: &[u8], count: usize) {
    let mut remaining = count.max(salt.len() + passphrase.len());
    while remaining > 0 {
        for part in [salt, passphrase] {
            let take = remaining.min(part.len());
            hasher.update(&part[..take]);
            remaining -= take;
        }
    }
}

/// Iterated-and-salted derivation with an explicit hash id.
pub fn derive(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    coded_count: u8,
    hash_algorithm: u8,
    out: &mut [u8],
) -> Result<(), PgpError> {
    S2k {
        mode: S2kMode::IteratedSalted,
        hash_algorithm,
        salt: *salt,
        coded_count,
    }
    .derive_into(passphrase, out, DEFAULT_MAX_S2K_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex16(s: &str) -> [u8; 16] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn decodes_coded_counts() {
        assert_eq!(decode_count(0x00), 1024);
        assert_eq!(decode_count(0x10), 2048);
        assert_eq!(decode_count(0x60), 65_536);
        assert_eq!(decode_count(0xFF), DEFAULT_MAX_S2K_COUNT);
    }

    #[test]
    fn iterated_salted_matches_gnupg() {
        let salt = [0x4B, 0xB0, 0xE6, 0xD4, 0x2F, 0xD2, 0x63, 0xE9];
        let mut key = [0u8; 16];
        derive(b"password", &salt, 0x60, HASH_SHA1, &mut key).unwrap();
        assert_eq!(key, hex16("66e3dcd25c6708d1febe1ce57258408c"));
    }

    #[test]
    fn salted_matches_gnupg() {
        let s2k = S2k {
            mode: S2kMode::Salted,
            hash_algorithm: HASH_SHA1,
            salt: [0x23, 0xDB, 0x40, 0xD1, 0x6E, 0x8C, 0x40, 0xA2],
            coded_count: 0,
        };
        let mut key = [0u8; 16];
        s2k.derive_into(b"password", &mut key, DEFAULT_MAX_S2K_COUNT)
            .unwrap();
        assert_eq!(key, hex16("88c532b9da197570a938d9728edc7d96"));
    }

    #[test]
    fn simple_mode_extends_with_zero_preloads() {
        let s2k = S2k {
            mode: S2kMode::Simple,
            hash_algorithm: HASH_SHA1,
            salt: [0; 8],
            coded_count: 0,
        };
        let mut key = [0u8; 24];
        s2k.derive_into(b"password", &mut key, DEFAULT_MAX_S2K_COUNT)
            .unwrap();
        assert_eq!(
            hex::encode(key),
            "5baa61e4c9b93f3f0682250b6cf8331b7ee68fd89d33953d"
        );
    }

    #[test]
    fn derivation_is_deterministic_and_salt_sensitive() {
        let salt_a = [1, 2, 3, 4, 5, 6, 7, 8];
        let salt_b = [2, 3, 4, 5, 6, 7, 8, 9];
        let mut first = [0u8; 16];
        let mut again = [0u8; 16];
        let mut other = [0u8; 16];
        derive(b"password", &salt_a, 0x10, HASH_SHA1, &mut first).unwrap();
        derive(b"password", &salt_a, 0x10, HASH_SHA1, &mut again).unwrap();
        derive(b"password", &salt_b, 0x10, HASH_SHA1, &mut other).unwrap();
        assert_eq!(first, again);
        assert_eq!(first, hex16("948555d9a078de0c0232c46a4c69f6ca"));
        assert_eq!(other, hex16("894a3e641ee9a95de0dea2d7d4770e73"));
    }

    #[test]
    fn rejects_other_hashes_and_modes() {
        let mut key = [0u8; 16];
        let err = derive(b"pw", &[0; 8], 0x10, 8, &mut key).unwrap_err();
        assert_eq!(err, PgpError::UnsupportedAlgorithm { what: "S2K hash", id: 8 });
        assert_eq!(
            S2kMode::from_id(2),
            Err(PgpError::UnsupportedAlgorithm { what: "S2K mode", id: 2 })
        );
        assert_eq!(
            S2kMode::from_id(101),
            Err(PgpError::UnsupportedAlgorithm { what: "S2K mode", id: 101 })
        );
    }

    #[test]
    fn count_limit_is_enforced() {
        let s2k = S2k {
            mode: S2kMode::IteratedSalted,
            hash_algorithm: HASH_SHA1,
            salt: [0; 8],
            coded_count: 0xFF,
        };
        let mut key = [0u8; 16];
        let err = s2k.derive_into(b"pw", &mut key, 65_536).unwrap_err();
        assert_eq!(
            err,
            PgpError::S2kCountTooLarge {
                count: DEFAULT_MAX_S2K_COUNT,
                max: 65_536
            }
        );
    }
}
