//! CAST5 (CAST-128, RFC 2144) with 128-bit keys.
//!
//! Blocks are packed big-endian: the first four bytes form the left half. Only the 16-round,
//! 128-bit-key variant is implemented.

mod sboxes;

use zeroize::Zeroize;

use crate::error::PgpError;
use sboxes::{S1, S2, S3, S4, S5, S6, S7, S8};

pub const BLOCK_LEN: usize = 8;
pub const KEY_LEN: usize = 16;

// Subkey derivation: for each output word `[a, b, c, d, e]`,
// K = S5[a] ^ S6[b] ^ S7[c] ^ S8[d] ^ S(5 + word)[e], all indices into the same 16-byte state.
const FROM_Z_FIRST: [[usize; 5]; 4] = [
    [8, 9, 7, 6, 2],
    [10, 11, 5, 4, 6],
    [12, 13, 3, 2, 9],
    [14, 15, 1, 0, 12],
];
const FROM_X_SECOND: [[usize; 5]; 4] = [
    [3, 2, 12, 13, 8],
    [1, 0, 14, 15, 13],
    [7, 6, 8, 9, 3],
    [5, 4, 10, 11, 7],
];
const FROM_Z_THIRD: [[usize; 5]; 4] = [
    [3, 2, 12, 13, 9],
    [1, 0, 14, 15, 12],
    [7, 6, 8, 9, 2],
    [5, 4, 10, 11, 6],
];
const FROM_X_FOURTH: [[usize; 5]; 4] = [
    [8, 9, 7, 6, 3],
    [10, 11, 5, 4, 7],
    [12, 13, 3, 2, 8],
    [14, 15, 1, 0, 13],
];

const EXTRA: [&[u32; 256]; 4] = [&S5, &S6, &S7, &S8];

/// Expanded CAST5 key: 16 masking subkeys and 16 five-bit rotations.
///
/// Immutable after [`Cast5::new`]; wiped on drop.
pub struct Cast5 {
    km: [u32; 16],
    kr: [u32; 16],
}

impl Cast5 {
    pub fn new(key: &[u8]) -> Result<Self, PgpError> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| PgpError::InvalidArguments {
            context: "CAST5 key must be 128 bits",
        })?;

        let mut x = *key;
        let mut z = [0u8; 16];
        let mut subkeys = [0u32; 32];
        for half in subkeys.chunks_exact_mut(16) {
            mix_z_from_x(&x, &mut z);
            derive(&z, &FROM_Z_FIRST, &mut half[0..4]);
            mix_x_from_z(&z, &mut x);
            derive(&x, &FROM_X_SECOND, &mut half[4..8]);
            mix_z_from_x(&x, &mut z);
            derive(&z, &FROM_Z_THIRD, &mut half[8..12]);
            mix_x_from_z(&z, &mut x);
            derive(&x, &FROM_X_FOURTH, &mut half[12..16]);
        }

        let mut cipher = Cast5 {
            km: [0; 16],
            kr: [0; 16],
        };
        cipher.km.copy_from_slice(&subkeys[..16]);
        for (kr, k) in cipher.kr.iter_mut().zip(&subkeys[16..]) {
            *kr = k & 0x1f;
        }

        x.zeroize();
        z.zeroize();
        subkeys.zeroize();
        Ok(cipher)
    }

    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_LEN]) {
        self.run(block, 0..16);
    }

    pub fn decrypt_block(&self, block: &mut [u8; BLOCK_LEN]) {
        self.run(block, (0..16).rev());
    }

    fn run(&self, block: &mut [u8; BLOCK_LEN], rounds: impl Iterator<Item = usize>) {
        let mut l = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        let mut r = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
        for i in rounds {
            let f = round(i % 3, r, self.km[i], self.kr[i]);
            (l, r) = (r, l ^ f);
        }
        block[..4].copy_from_slice(&r.to_be_bytes());
        block[4..].copy_from_slice(&l.to_be_bytes());
    }
}

impl Drop for Cast5 {
    fn drop(&mut self) {
        self.km.zeroize();
        self.kr.zeroize();
    }
}

impl core::fmt::Debug for Cast5 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Cast5 { .. }")
    }
}

fn round(kind: usize, d: u32, km: u32, kr: u32) -> u32 {
    let i = match kind {
        0 => km.wrapping_add(d),
        1 => km ^ d,
        _ => km.wrapping_sub(d),
    }
    .rotate_left(kr);
    let [a, b, c, e] = i.to_be_bytes();
    let (s1, s2, s3, s4) = (
        S1[a as usize],
        S2[b as usize],
        S3[c as usize],
        S4[e as usize],
    );
    match kind {
        0 => (s1 ^ s2).wrapping_sub(s3).wrapping_add(s4),
        1 => s1.wrapping_sub(s2).wrapping_add(s3) ^ s4,
        _ => (s1.wrapping_add(s2) ^ s3).wrapping_sub(s4),
    }
}

fn word(state: &[u8; 16], at: usize) -> u32 {
    u32::from_be_bytes([state[at], state[at + 1], state[at + 2], state[at + 3]])
}

fn put(state: &mut [u8; 16], at: usize, value: u32) {
    state[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn quad(state: &[u8; 16], idx: [usize; 4]) -> u32 {
    S5[state[idx[0]] as usize]
        ^ S6[state[idx[1]] as usize]
        ^ S7[state[idx[2]] as usize]
        ^ S8[state[idx[3]] as usize]
}

fn mix_z_from_x(x: &[u8; 16], z: &mut [u8; 16]) {
    let v = word(x, 0) ^ quad(x, [13, 15, 12, 14]) ^ S7[x[8] as usize];
    put(z, 0, v);
    let v = word(x, 8) ^ quad(z, [0, 2, 1, 3]) ^ S8[x[10] as usize];
    put(z, 4, v);
    let v = word(x, 12) ^ quad(z, [7, 6, 5, 4]) ^ S5[x[9] as usize];
    put(z, 8, v);
    let v = word(x, 4) ^ quad(z, [10, 9, 11, 8]) ^ S6[x[11] as usize];
    put(z, 12, v);
}

fn mix_x_from_z(z: &[u8; 16], x: &mut [u8; 16]) {
    let v = word(z, 8) ^ quad(z, [5, 7, 4, 6]) ^ S7[z[0] as usize];
    put(x, 0, v);
    let v = word(z, 0) ^ quad(x, [0, 2, 1, 3]) ^ S8[z[2] as usize];
    put(x, 4, v);
    let v = word(z, 4) ^ quad(x, [7, 6, 5, 4]) ^ S5[z[1] as usize];
    put(x, 8, v);
    let v = word(z, 12) ^ quad(x, [10, 9, 11, 8]) ^ S6[z[3] as usize];
    put(x, 12, v);
}

fn derive(state: &[u8; 16], table: &[[usize; 5]; 4], out: &mut [u32]) {
    for (j, (row, k)) in table.iter().zip(out.iter_mut()).enumerate() {
        *k = quad(state, [row[0], row[1], row[2], row[3]]) ^ EXTRA[j][state[row[4]] as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x01, 0x23, 0x45, 0x67, 0x12, 0x34, 0x56, 0x78, 0x23, 0x45, 0x67, 0x89, 0x34, 0x56, 0x78,
        0x9A,
    ];

    #[test]
    fn rfc2144_128_bit_vector() {
        let cipher = Cast5::new(&KEY).unwrap();
        let mut block = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
        cipher.encrypt_block(&mut block);
        assert_eq!(block, [0x23, 0x8B, 0x4F, 0xE5, 0x84, 0x7E, 0x44, 0xB2]);
        cipher.decrypt_block(&mut block);
        assert_eq!(block, [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn decrypt_inverts_encrypt_across_keys() {
        let mut key = KEY;
        let mut block = [0u8; 8];
        for step in 0..64u8 {
            key[usize::from(step % 16)] ^= step.wrapping_mul(37);
            block[usize::from(step % 8)] ^= step;
            let cipher = Cast5::new(&key).unwrap();
            let mut out = block;
            cipher.encrypt_block(&mut out);
            assert_ne!(out, block);
            cipher.decrypt_block(&mut out);
            assert_eq!(out, block);
        }
    }

    #[test]
    fn rejects_other_key_lengths() {
        for len in [0usize, 5, 10, 15, 17, 32] {
            let err = Cast5::new(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, PgpError::InvalidArguments { .. }), "len={len}");
        }
    }
}
