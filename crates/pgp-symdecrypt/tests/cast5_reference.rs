use cast5::cipher::generic_array::GenericArray;
use cast5::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use pgp_symdecrypt::cast5::Cast5;
use proptest::prelude::*;

#[test]
fn rfc2144_full_key_vector() {
    let key = hex::decode("0123456712345678234567893456789a").unwrap();
    let cipher = Cast5::new(&key).unwrap();
    let mut block: [u8; 8] = hex::decode("0123456789abcdef").unwrap().try_into().unwrap();
    cipher.encrypt_block(&mut block);
    assert_eq!(hex::encode(block), "238b4fe5847e44b2");
    cipher.decrypt_block(&mut block);
    assert_eq!(hex::encode(block), "0123456789abcdef");
}

#[test]
#[ignore = "two million key schedules; run with --ignored"]
fn rfc2144_maintenance_test() {
    // B.2: a and b encrypted with each other as key, one million times.
    let mut a: [u8; 16] = hex::decode("0123456712345678234567893456789a")
        .unwrap()
        .try_into()
        .unwrap();
    let mut b = a;
    for _ in 0..1_000_000 {
        let cipher = Cast5::new(&b).unwrap();
        for half in a.chunks_exact_mut(8) {
            cipher.encrypt_block(half.try_into().unwrap());
        }
        let cipher = Cast5::new(&a).unwrap();
        for half in b.chunks_exact_mut(8) {
            cipher.encrypt_block(half.try_into().unwrap());
        }
    }
    assert_eq!(hex::encode(a), "eea9d0a249fd3ba6b3436fb89d6dca92");
    assert_eq!(hex::encode(b), "b2c95eb00c31ad7180ac05b8e83d696e");
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 0,
        .. ProptestConfig::default()
    })]

    #[test]
    fn matches_the_cast5_crate(key in any::<[u8; 16]>(), block in any::<[u8; 8]>()) {
        let ours = Cast5::new(&key).unwrap();
        let theirs = cast5::Cast5::new(GenericArray::from_slice(&key));

        let mut expected = GenericArray::clone_from_slice(&block);
        theirs.encrypt_block(&mut expected);
        let mut actual = block;
        ours.encrypt_block(&mut actual);
        prop_assert_eq!(&actual[..], expected.as_slice());

        theirs.decrypt_block(&mut expected);
        ours.decrypt_block(&mut actual);
        prop_assert_eq!(actual, block);
        prop_assert_eq!(expected.as_slice(), &block[..]);
    }
}
