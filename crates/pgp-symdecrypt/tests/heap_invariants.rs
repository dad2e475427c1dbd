use pgp_symdecrypt::heap::{BLOCK_SIZE, HEADER_SIZE};
use pgp_symdecrypt::{Heap, HeapBuf, PgpError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..600).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

/// Blocks tile the arena, no two free blocks touch, and every size is block-aligned.
fn assert_well_formed(heap: &Heap) {
    let mut expected_offset = 0;
    let mut previous_free = false;
    for block in heap.blocks() {
        assert_eq!(block.offset, expected_offset, "gap or overlap in the block list");
        assert_eq!(block.size % BLOCK_SIZE, 0);
        assert!(block.size >= HEADER_SIZE + BLOCK_SIZE);
        assert!(!(previous_free && block.free), "adjacent free blocks at {}", block.offset);
        previous_free = block.free;
        expected_offset += block.size;
    }
    assert_eq!(expected_offset, heap.capacity());
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 0,
        .. ProptestConfig::default()
    })]

    #[test]
    fn alloc_free_sequences_keep_the_block_list_sound(ops in prop::collection::vec(op(), 1..200)) {
        let heap = Heap::with_capacity(8 * 1024).unwrap();
        let mut live: Vec<HeapBuf<'_>> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(len) => match heap.allocate(len) {
                    Ok(mut buf) => {
                        prop_assert_eq!(buf.len(), len);
                        prop_assert!(buf.iter().all(|&b| b == 0));
                        buf.fill(0xA5);
                        live.push(buf);
                    }
                    Err(err) => {
                        prop_assert_eq!(err, PgpError::AllocationFailure { requested: len });
                        let needed = (len + HEADER_SIZE).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                        prop_assert!(heap.stats().largest_free < needed);
                    }
                },
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let idx = pick % live.len();
                        drop(live.swap_remove(idx));
                    }
                }
            }
            assert_well_formed(&heap);
        }
        drop(live);
        let stats = heap.stats();
        prop_assert_eq!(stats.used_blocks, 0);
        prop_assert_eq!(stats.free_blocks, 1);
        prop_assert_eq!(stats.largest_free, heap.capacity());
    }
}

#[test]
fn live_buffers_do_not_overlap() {
    let heap = Heap::with_capacity(4096).unwrap();
    let mut a = heap.allocate(40).unwrap();
    let mut b = heap.allocate(40).unwrap();
    a.fill(1);
    b.fill(2);
    assert!(a.iter().all(|&x| x == 1));
    assert!(b.iter().all(|&x| x == 2));
}

#[test]
fn foreign_and_stale_pointers_are_rejected() {
    let heap = Heap::with_capacity(4096).unwrap();
    let other = Heap::with_capacity(4096).unwrap();
    let before: Vec<_> = heap.blocks().collect();

    let mut foreign = other.allocate(32).unwrap();
    let mut local = [0u8; 32];
    // SAFETY: none of these pointers belong to a live buffer of `heap`.
    unsafe {
        assert!(heap.release_raw(foreign.as_mut_ptr()).is_err());
        assert!(heap.release_raw(local.as_mut_ptr()).is_err());
        assert!(heap.release_raw(core::ptr::null_mut()).is_ok());
    }
    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);

    let kept = heap.allocate(32).unwrap();
    let ptr = heap.allocate(64).unwrap().into_raw();
    // SAFETY: `ptr` came from `into_raw` and no buffer refers to it.
    unsafe {
        assert!(heap.release_raw(ptr.add(1)).is_err());
        assert!(heap.release_raw(ptr).is_ok());
        assert!(heap.release_raw(ptr).is_err());
    }
    drop(kept);
    assert_eq!(heap.stats().used_blocks, 0);
    assert_eq!(heap.stats().free_blocks, 1);
}

#[test]
fn exhaustion_then_recovery() {
    let heap = Heap::with_capacity(1024).unwrap();
    let mut bufs = Vec::new();
    while let Ok(buf) = heap.allocate(100) {
        bufs.push(buf);
    }
    assert!(!bufs.is_empty());
    assert!(matches!(
        heap.allocate(100),
        Err(PgpError::AllocationFailure { requested: 100 })
    ));
    bufs.clear();
    assert!(heap.allocate(1024 - HEADER_SIZE).is_ok());
}
