mod common;

use pgp_symdecrypt::iobuf::IoBuf;
use pgp_symdecrypt::packet::parse_next;
use pgp_symdecrypt::{decrypt_message, CollectSink, ControlContext, DecryptOptions, Heap};

fn next_u64(state: &mut u64) -> u64 {
    // Deterministic LCG (same parameters as PCG32 without the output permutation).
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *state
}

fn options() -> DecryptOptions {
    let mut options = DecryptOptions::default();
    // Random S2K headers would otherwise ask for up to 65 MB of hashing each.
    options.limits.max_s2k_count = 65_536;
    options
}

fn attempt(heap: &Heap, input: &[u8], session_key: Option<&[u8]>, passphrase: Option<&[u8]>) {
    let mut ctx = ControlContext::new(heap);
    let mut sink = CollectSink::new();
    let _ = decrypt_message(&mut ctx, session_key, passphrase, input, &mut sink, &options());
    assert!(!ctx.has_key_material());
    assert_eq!(heap.stats().used_blocks, 0);
}

#[test]
fn decrypt_is_panic_free_on_pseudorandom_inputs() {
    let heap = Heap::with_capacity(64 * 1024).unwrap();
    let mut state = 0x0123_4567_89ab_cdef;

    for _ in 0..512 {
        let len = (next_u64(&mut state) as usize) % 4096;
        let mut buf = vec![0u8; len];
        for b in &mut buf {
            *b = (next_u64(&mut state) >> 56) as u8;
        }

        assert!(
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut io = IoBuf::open(&buf);
                while let Ok(Some(_)) = parse_next(&mut io) {}
            }))
            .is_ok(),
            "parse_next panicked on len={len}"
        );

        assert!(
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                attempt(&heap, &buf, Some(&[0x42; 16][..]), None);
                attempt(&heap, &buf, None, Some(&b"password"[..]));
            }))
            .is_ok(),
            "decrypt_message panicked on len={len}"
        );
    }
}

#[test]
fn decrypt_is_panic_free_on_mutated_fixtures() {
    let heap = Heap::with_capacity(64 * 1024).unwrap();
    let mut state = 0xfeed_face_cafe_beef;

    for name in ["msg.gpg", "nomdc.gpg", "part.gpg", "salted.gpg"] {
        let original = common::fixture(name);
        for _ in 0..64 {
            let mut buf = original.clone();
            let edits = 1 + (next_u64(&mut state) % 4) as usize;
            for _ in 0..edits {
                let at = (next_u64(&mut state) as usize) % buf.len();
                buf[at] = (next_u64(&mut state) >> 56) as u8;
            }
            if next_u64(&mut state) % 4 == 0 {
                let keep = (next_u64(&mut state) as usize) % buf.len();
                buf.truncate(keep);
            }

            assert!(
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    attempt(&heap, &buf, None, Some(&b"password"[..]));
                }))
                .is_ok(),
                "decrypt_message panicked on mutated {name}"
            );
        }
    }
}
