mod common;

use std::sync::Mutex;

use common::{literal, packet, seipd_body_with_prefix};
use log::LevelFilter;
use pgp_symdecrypt::{
    decrypt_message, unified_decrypt, CollectSink, ControlContext, DecryptOptions, Heap,
    PutChar, PutCharLogger,
};

static LOG: Mutex<Vec<u8>> = Mutex::new(Vec::new());

const KEY: [u8; 16] = [0x11; 16];

#[test]
fn verified_message_with_failed_quick_check_is_flagged() {
    PutCharLogger::new(
        PutChar(|b: u8| LOG.lock().unwrap().push(b)),
        LevelFilter::Warn,
    )
    .install()
    .unwrap();

    // The repeated octets do not match, but the MDC covers the prefix as written.
    let prefix = [1, 2, 3, 4, 5, 6, 7, 8, 0, 0];
    let input = packet(
        18,
        &seipd_body_with_prefix(&KEY, prefix, &literal(b"", b"still intact")),
    );

    let heap = Heap::new();
    let mut ctx = ControlContext::new(&heap);
    let mut sink = CollectSink::new();
    let outcome = decrypt_message(
        &mut ctx,
        Some(KEY.as_slice()),
        None,
        &input,
        &mut sink,
        &DecryptOptions::default(),
    )
    .unwrap();
    assert!(outcome.quick_check_failed);
    assert_eq!(sink.bytes, b"still intact");

    let mut sink = CollectSink::new();
    let status = unified_decrypt(&mut ctx, Some(KEY.as_slice()), None, &input, &mut sink);
    assert_eq!(status, 0);
    assert!(sink.trusted);

    let log = String::from_utf8(LOG.lock().unwrap().clone()).unwrap();
    assert!(
        log.contains("decryption verified although the quick-check failed"),
        "{log}"
    );
}
