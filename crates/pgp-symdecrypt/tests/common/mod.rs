#![allow(dead_code)]

use std::path::PathBuf;

use pgp_symdecrypt::cast5::Cast5;
use pgp_symdecrypt::cfb::{make_prefix, Cfb};
use pgp_symdecrypt::mdc::{MdcVerifier, MDC_HEADER};
use pgp_symdecrypt::s2k;

pub fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}

/// New-format packet with a one-, two- or five-octet length.
pub fn packet(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0xC0 | tag];
    match body.len() {
        n @ 0..=191 => out.push(n as u8),
        n @ 192..=8383 => {
            let n = n - 192;
            out.push((n >> 8) as u8 + 192);
            out.push(n as u8);
        }
        n => {
            out.push(0xFF);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(body);
    out
}

pub fn literal(name: &[u8], content: &[u8]) -> Vec<u8> {
    let mut body = vec![b'b', name.len() as u8];
    body.extend_from_slice(name);
    body.extend_from_slice(&0x6AD6_180Au32.to_be_bytes());
    body.extend_from_slice(content);
    packet(11, &body)
}

/// SKESK v4, CAST5, iterated+salted SHA-1, no encrypted session key.
pub fn skesk(salt: [u8; 8], coded_count: u8) -> Vec<u8> {
    let mut body = vec![4, 3, 3, 2];
    body.extend_from_slice(&salt);
    body.push(coded_count);
    packet(3, &body)
}

/// SKESK v4 whose S2K output (iterated+salted SHA-1 over `passphrase`) encrypts
/// `algorithm || session_key`.
pub fn skesk_with_esk(
    salt: [u8; 8],
    coded_count: u8,
    passphrase: &[u8],
    algorithm: u8,
    session_key: &[u8],
) -> Vec<u8> {
    let mut kek = [0u8; 16];
    s2k::derive(passphrase, &salt, coded_count, s2k::HASH_SHA1, &mut kek).expect("s2k");
    let mut esk = vec![algorithm];
    esk.extend_from_slice(session_key);
    Cfb::with_zero_iv(Cast5::new(&kek).expect("cast5 key")).encrypt(&mut esk);

    let mut body = vec![4, 3, 3, 2];
    body.extend_from_slice(&salt);
    body.push(coded_count);
    body.extend_from_slice(&esk);
    packet(3, &body)
}

/// SEIPD ciphertext (without packet framing) for `inner` under `key`.
pub fn seipd_body(key: &[u8], random: [u8; 8], inner: &[u8]) -> Vec<u8> {
    seipd_body_with_prefix(key, make_prefix(random), inner)
}

/// Like [`seipd_body`], with the caller choosing all ten prefix octets.
pub fn seipd_body_with_prefix(key: &[u8], prefix: [u8; 10], inner: &[u8]) -> Vec<u8> {
    let mut mdc = MdcVerifier::new();
    mdc.update(&prefix);
    mdc.update(inner);
    mdc.update(&MDC_HEADER);

    let mut plaintext = prefix.to_vec();
    plaintext.extend_from_slice(inner);
    plaintext.extend_from_slice(&MDC_HEADER);
    plaintext.extend_from_slice(&mdc.finalize());

    let mut cfb = Cfb::with_zero_iv(Cast5::new(key).expect("cast5 key"));
    cfb.encrypt(&mut plaintext);
    let mut body = vec![1];
    body.extend_from_slice(&plaintext);
    body
}

pub fn seipd(key: &[u8], random: [u8; 8], inner: &[u8]) -> Vec<u8> {
    packet(18, &seipd_body(key, random, inner))
}

/// Legacy tag 9 packet: prefix, resync, then `inner`.
pub fn sed(key: &[u8], random: [u8; 8], inner: &[u8]) -> Vec<u8> {
    let mut cfb = Cfb::with_zero_iv(Cast5::new(key).expect("cast5 key"));
    let mut body = make_prefix(random).to_vec();
    cfb.encrypt(&mut body);
    cfb.resync();
    let mut rest = inner.to_vec();
    cfb.encrypt(&mut rest);
    body.extend_from_slice(&rest);
    packet(9, &body)
}

/// Split `body` into partial-length segments of `chunk` (a power of two), ending with a
/// fixed-length segment.
pub fn partial_packet(tag: u8, body: &[u8], chunk: usize) -> Vec<u8> {
    assert!(chunk.is_power_of_two() && (512..=1 << 30).contains(&chunk));
    let exp = chunk.trailing_zeros() as u8;
    let mut out = vec![0xC0 | tag];
    let mut rest = body;
    while rest.len() > chunk {
        out.push(0xE0 | exp);
        out.extend_from_slice(&rest[..chunk]);
        rest = &rest[chunk..];
    }
    let last = packet(tag, rest);
    out.extend_from_slice(&last[1..]);
    out
}
