//! OpenPGP CFB mode over CAST5 (RFC 4880 §13.9).
//!
//! The engine is byte-streaming: callers may hand it chunks of any size. The feedback register
//! is filled with ciphertext as it goes by, so after each complete block it holds exactly that
//! ciphertext block.

use zeroize::Zeroize;

use crate::cast5::{Cast5, BLOCK_LEN};

/// Random block plus the two repeated check octets.
pub const PREFIX_LEN: usize = BLOCK_LEN + 2;

pub struct Cfb {
    cipher: Cast5,
    register: [u8; BLOCK_LEN],
    keystream: [u8; BLOCK_LEN],
    pos: usize,
}

impl Cfb {
    pub fn new(cipher: Cast5, iv: [u8; BLOCK_LEN]) -> Self {
        Cfb {
            cipher,
            register: iv,
            keystream: [0; BLOCK_LEN],
            pos: 0,
        }
    }

    /// OpenPGP messages start from an all-zero IV.
    pub fn with_zero_iv(cipher: Cast5) -> Self {
        Self::new(cipher, [0; BLOCK_LEN])
    }

    fn next_keystream(&mut self) {
        self.keystream = self.register;
        self.cipher.encrypt_block(&mut self.keystream);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.pos == 0 {
                self.next_keystream();
            }
            let c = *byte;
            *byte = c ^ self.keystream[self.pos];
            self.register[self.pos] = c;
            self.pos = (self.pos + 1) % BLOCK_LEN;
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.pos == 0 {
                self.next_keystream();
            }
            let c = *byte ^ self.keystream[self.pos];
            *byte = c;
            self.register[self.pos] = c;
            self.pos = (self.pos + 1) % BLOCK_LEN;
        }
    }

    /// Restart block alignment with the last eight ciphertext octets as the register.
    ///
    /// Used by the legacy Symmetrically Encrypted Data packet right after the 10-octet prefix.
    pub fn resync(&mut self) {
        self.register.rotate_left(self.pos);
        self.pos = 0;
    }
}

impl Drop for Cfb {
    fn drop(&mut self) {
        self.register.zeroize();
        self.keystream.zeroize();
    }
}

impl core::fmt::Debug for Cfb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cfb").field("pos", &self.pos).finish()
    }
}

/// `prefix[6..8] == prefix[8..10]` on the decrypted prefix.
pub fn quick_check(prefix: &[u8; PREFIX_LEN]) -> bool {
    prefix[BLOCK_LEN - 2..BLOCK_LEN] == prefix[BLOCK_LEN..]
}

/// Build a prefix for `random`: the block followed by its last two octets.
pub fn make_prefix(random: [u8; BLOCK_LEN]) -> [u8; PREFIX_LEN] {
    let mut prefix = [0u8; PREFIX_LEN];
    prefix[..BLOCK_LEN].copy_from_slice(&random);
    prefix[BLOCK_LEN..].copy_from_slice(&random[BLOCK_LEN - 2..]);
    prefix
}
