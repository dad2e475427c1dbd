//! Fixed-arena, first-fit heap with coalescing.
//!
//! The arena is carved into blocks, each starting with a 16-byte header:
//!
//! ```text
//! offset 0  size  u64 LE   block size in bytes, header included
//! offset 8  next  u32 LE   arena offset of the next block, `u32::MAX` at the end
//! offset 12 free  u8       1 when the block is free
//! offset 13 pad   [u8; 3]
//! ```
//!
//! Blocks are linked in address order starting at offset 0 and always tile the whole arena, so
//! `sum(size) == capacity` holds between calls. Releasing a block merges it with a free
//! successor and then with a free predecessor, which keeps two free blocks from ever being
//! neighbours.
//!
//! A [`Heap`] is single-owner state: it is neither `Send` nor `Sync`, and every buffer it hands out
//! borrows it.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use zeroize::Zeroize;

use crate::error::{InvariantViolation, PgpError};

/// Allocation granularity; every block size is a multiple of this.
pub const BLOCK_SIZE: usize = 16;
/// Size of the in-arena block header.
pub const HEADER_SIZE: usize = 16;
/// Arena size used by [`Heap::new`].
pub const DEFAULT_HEAP_SIZE: usize = 2 * 1024 * 1024;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHeader {
    size: u64,
    next: u32,
    free: u8,
    _pad: [u8; 3],
}

impl BlockHeader {
    fn new(size: u64, next: u32, free: bool) -> Self {
        BlockHeader {
            size,
            next,
            free: free as u8,
            _pad: [0; 3],
        }
    }

    fn is_free(&self) -> bool {
        self.free != 0
    }
}

/// A block as seen by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Arena offset of the block header.
    pub offset: usize,
    /// Block size including the header.
    pub size: usize,
    pub free: bool,
}

/// Aggregate view of the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub largest_free: usize,
}

pub struct Heap {
    storage: NonNull<[u64]>,
    base: NonNull<u8>,
    capacity: usize,
}

impl Heap {
    /// Heap over a [`DEFAULT_HEAP_SIZE`] arena.
    pub fn new() -> Self {
        Self::build(DEFAULT_HEAP_SIZE)
    }

    /// Heap over an arena of `size` bytes, rounded down to [`BLOCK_SIZE`].
    ///
    /// The arena must hold at least one header plus one block and its offsets must fit in `u32`.
    pub fn with_capacity(size: usize) -> Result<Self, PgpError> {
        let size = size & !(BLOCK_SIZE - 1);
        if size < HEADER_SIZE + BLOCK_SIZE {
            return Err(PgpError::InvalidArguments {
                context: "heap arena too small",
            });
        }
        if size >= NIL as usize {
            return Err(PgpError::InvalidArguments {
                context: "heap arena too large",
            });
        }
        Ok(Self::build(size))
    }

    fn build(capacity: usize) -> Self {
        let words = vec![0u64; capacity / 8].into_boxed_slice();
        let storage = NonNull::from(Box::leak(words));
        let heap = Heap {
            storage,
            base: storage.cast::<u8>(),
            capacity,
        };
        heap.write_header(0, BlockHeader::new(capacity as u64, NIL, true));
        log::debug!("heap initialised: {} KiB", capacity / 1024);
        heap
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_header(&self, offset: u32) -> BlockHeader {
        debug_assert!(offset as usize + HEADER_SIZE <= self.capacity);
        // SAFETY: `offset` always comes from the block list, which only holds in-bounds offsets.
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<BlockHeader>()
                .read_unaligned()
        }
    }

    fn write_header(&self, offset: u32, header: BlockHeader) {
        debug_assert!(offset as usize + HEADER_SIZE <= self.capacity);
        // SAFETY: see `read_header`; headers never overlap a live payload.
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<BlockHeader>()
                .write_unaligned(header)
        }
    }

    /// First-fit allocation of `len` zeroed bytes.
    ///
    /// `len == 0` returns an empty buffer without touching the block list.
    pub fn allocate(&self, len: usize) -> Result<HeapBuf<'_>, PgpError> {
        if len == 0 {
            return Ok(HeapBuf::empty(self));
        }
        let total = len
            .checked_add(HEADER_SIZE + BLOCK_SIZE - 1)
            .map(|n| n & !(BLOCK_SIZE - 1))
            .filter(|n| *n <= self.capacity)
            .ok_or(PgpError::AllocationFailure { requested: len })?;

        let mut cursor = 0u32;
        while cursor != NIL {
            let mut header = self.read_header(cursor);
            if header.is_free() && header.size as usize >= total {
                if header.size as usize >= total + BLOCK_SIZE + HEADER_SIZE {
                    let split = cursor + total as u32;
                    self.write_header(
                        split,
                        BlockHeader::new(header.size - total as u64, header.next, true),
                    );
                    header.size = total as u64;
                    header.next = split;
                }
                header.free = 0;
                self.write_header(cursor, header);

                let offset = cursor as usize + HEADER_SIZE;
                // SAFETY: the payload lies inside the block just claimed.
                unsafe { self.base.as_ptr().add(offset).write_bytes(0, len) };
                return Ok(HeapBuf {
                    heap: self,
                    block: Some(cursor),
                    len,
                    _not_send: PhantomData,
                });
            }
            cursor = header.next;
        }

        log::warn!("heap: no free block for {len} bytes");
        Err(PgpError::AllocationFailure { requested: len })
    }

    fn release_block(&self, block: u32) {
        let mut header = self.read_header(block);
        header.free = 1;

        if header.next != NIL {
            let next = self.read_header(header.next);
            if next.is_free() && block as u64 + header.size == header.next as u64 {
                header.size += next.size;
                header.next = next.next;
            }
        }
        self.write_header(block, header);

        let mut cursor = 0u32;
        while cursor != NIL && cursor != block {
            let mut prev = self.read_header(cursor);
            if prev.is_free() && cursor as u64 + prev.size == block as u64 {
                prev.size += header.size;
                prev.next = header.next;
                self.write_header(cursor, prev);
                return;
            }
            cursor = prev.next;
        }
    }

    /// Release a payload pointer previously obtained from [`HeapBuf::into_raw`].
    ///
    /// Pointers outside the arena, pointers that are not the start of a live payload, and
    /// already-released blocks are rejected without touching the block list. A null pointer is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// No [`HeapBuf`] may still be alive for `ptr`; the released bytes may be handed out again.
    pub unsafe fn release_raw(&self, ptr: *mut u8) -> Result<(), PgpError> {
        if ptr.is_null() {
            return Ok(());
        }
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        let rejected = PgpError::InvalidArguments {
            context: "pointer is not a live heap allocation",
        };
        if addr < base + HEADER_SIZE || addr >= base + self.capacity {
            log::warn!("heap: release of {ptr:p} outside the arena ignored");
            return Err(rejected);
        }
        let block = (addr - base - HEADER_SIZE) as u32;
        let live = self
            .blocks()
            .any(|info| info.offset == block as usize && !info.free);
        if !live {
            log::warn!("heap: release of {ptr:p} does not match a live block");
            return Err(rejected);
        }
        self.release_block(block);
        Ok(())
    }

    /// Walk every block in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            cursor: 0,
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            capacity: self.capacity,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            if block.free {
                stats.free_bytes += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used_bytes += block.size;
                stats.used_blocks += 1;
            }
        }
        stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: `storage` came from `Box::leak` in `build` and is released exactly once.
        drop(unsafe { Box::from_raw(self.storage.as_ptr()) });
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

pub struct Blocks<'h> {
    heap: &'h Heap,
    cursor: u32,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.cursor == NIL {
            return None;
        }
        let header = self.heap.read_header(self.cursor);
        let info = BlockInfo {
            offset: self.cursor as usize,
            size: header.size as usize,
            free: header.is_free(),
        };
        self.cursor = header.next;
        Some(info)
    }
}

/// Owned allocation inside a [`Heap`]; released on drop.
pub struct HeapBuf<'h> {
    heap: &'h Heap,
    block: Option<u32>,
    len: usize,
    _not_send: PhantomData<*mut u8>,
}

impl<'h> HeapBuf<'h> {
    fn empty(heap: &'h Heap) -> Self {
        HeapBuf {
            heap,
            block: None,
            len: 0,
            _not_send: PhantomData,
        }
    }

    fn payload(&self) -> *mut u8 {
        match self.block {
            // SAFETY: the block is live and its payload starts right after the header.
            Some(block) => unsafe {
                self.heap
                    .base
                    .as_ptr()
                    .add(block as usize + HEADER_SIZE)
            },
            None => NonNull::<u8>::dangling().as_ptr(),
        }
    }

    /// Give up ownership without releasing; see [`Heap::release_raw`].
    ///
    /// Returns null for an empty buffer.
    pub fn into_raw(self) -> *mut u8 {
        let ptr = match self.block {
            Some(_) => self.payload(),
            None => core::ptr::null_mut(),
        };
        core::mem::forget(self);
        ptr
    }
}

impl Deref for HeapBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `len` bytes of payload belong exclusively to this buffer.
        unsafe { core::slice::from_raw_parts(self.payload(), self.len) }
    }
}

impl DerefMut for HeapBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, and `&mut self` guarantees uniqueness.
        unsafe { core::slice::from_raw_parts_mut(self.payload(), self.len) }
    }
}

impl Drop for HeapBuf<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.heap.release_block(block);
        }
    }
}

impl fmt::Debug for HeapBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuf")
            .field("block", &self.block)
            .field("len", &self.len)
            .finish()
    }
}

/// Heap buffer for key material: wiped, checked, then released.
///
/// [`SecretBuf::destroy`] reports a failed wipe as an [`InvariantViolation`]; dropping without
/// `destroy` still wipes and only logs.
pub struct SecretBuf<'h> {
    inner: HeapBuf<'h>,
}

impl<'h> SecretBuf<'h> {
    pub fn allocate(heap: &'h Heap, len: usize) -> Result<Self, PgpError> {
        Ok(SecretBuf {
            inner: heap.allocate(len)?,
        })
    }

    pub fn copy_from(heap: &'h Heap, bytes: &[u8]) -> Result<Self, PgpError> {
        let mut secret = Self::allocate(heap, bytes.len())?;
        secret.expose_mut().copy_from_slice(bytes);
        Ok(secret)
    }

    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn expose_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn wipe(&mut self) -> Result<(), InvariantViolation> {
        self.inner.zeroize();
        verify_wiped(&self.inner)
    }

    /// Zero, verify and release.
    pub fn destroy(mut self) -> Result<(), InvariantViolation> {
        self.wipe()
    }
}

impl Drop for SecretBuf<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.wipe() {
            log::error!("{err}");
        }
    }
}

impl fmt::Debug for SecretBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuf([REDACTED; {}])", self.len())
    }
}

pub(crate) fn verify_wiped(bytes: &[u8]) -> Result<(), InvariantViolation> {
    let residue = bytes
        .iter()
        // SAFETY: reading an initialised byte through a valid reference.
        .fold(0u8, |acc, b| acc | unsafe { core::ptr::read_volatile(b) });
    if residue == 0 {
        Ok(())
    } else {
        Err(InvariantViolation {
            what: "secret buffer not zero after wipe",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::with_capacity(4096).expect("heap")
    }

    fn assert_tiles(heap: &Heap) {
        let total: usize = heap.blocks().map(|b| b.size).sum();
        assert_eq!(total, heap.capacity());
        let blocks: Vec<_> = heap.blocks().collect();
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].offset + pair[0].size, pair[1].offset);
            assert!(!(pair[0].free && pair[1].free), "uncoalesced {pair:?}");
        }
    }

    #[test]
    fn zero_length_allocation_leaves_list_untouched() {
        let heap = small_heap();
        let before: Vec<_> = heap.blocks().collect();
        let buf = heap.allocate(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
        assert!(buf.into_raw().is_null());
    }

    #[test]
    fn sizes_are_aligned_and_include_header() {
        let heap = small_heap();
        let a = heap.allocate(1).unwrap();
        let b = heap.allocate(17).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks[0], BlockInfo { offset: 0, size: 32, free: false });
        assert_eq!(blocks[1], BlockInfo { offset: 32, size: 48, free: false });
        assert!(blocks[2].free);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 17);
        assert_tiles(&heap);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let heap = Heap::with_capacity(64).unwrap();
        // 16 bytes would remain, which cannot host a header plus a block.
        let buf = heap.allocate(20).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks, vec![BlockInfo { offset: 0, size: 64, free: false }]);
        drop(buf);
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn release_coalesces_both_directions() {
        let heap = small_heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        drop(a);
        drop(c);
        assert_tiles(&heap);
        drop(b);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks, vec![BlockInfo { offset: 0, size: 4096, free: true }]);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let heap = small_heap();
        let err = heap.allocate(8192).unwrap_err();
        assert_eq!(err, PgpError::AllocationFailure { requested: 8192 });
        let err = heap.allocate(usize::MAX).unwrap_err();
        assert_eq!(err, PgpError::AllocationFailure { requested: usize::MAX });
        assert!(heap.allocate(4096 - HEADER_SIZE).is_ok());
    }

    #[test]
    fn freed_space_is_reused_first_fit() {
        let heap = small_heap();
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        let a_ptr = a.into_raw();
        unsafe { heap.release_raw(a_ptr).unwrap() };
        let c = heap.allocate(32).unwrap().into_raw();
        assert_eq!(c, a_ptr);
        unsafe { heap.release_raw(c).unwrap() };
    }

    #[test]
    fn foreign_and_stale_pointers_are_rejected() {
        let heap = small_heap();
        let keep = heap.allocate(40).unwrap();
        let before: Vec<_> = heap.blocks().collect();

        let mut outside = [0u8; 8];
        let err = unsafe { heap.release_raw(outside.as_mut_ptr()) }.unwrap_err();
        assert!(matches!(err, PgpError::InvalidArguments { .. }));

        let raw = heap.allocate(40).unwrap().into_raw();
        unsafe { heap.release_raw(raw).unwrap() };
        assert!(unsafe { heap.release_raw(raw) }.is_err());
        assert!(unsafe { heap.release_raw(raw.wrapping_add(1)) }.is_err());
        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
        drop(keep);
    }

    #[test]
    fn allocations_are_zeroed_even_after_reuse() {
        let heap = small_heap();
        let mut a = heap.allocate(32).unwrap();
        a.fill(0xAA);
        drop(a);
        let b = heap.allocate(32).unwrap();
        assert!(b.iter().all(|b| *b == 0));
    }

    #[test]
    fn secret_buffers_wipe_before_release() {
        let heap = small_heap();
        let secret = SecretBuf::copy_from(&heap, b"passphrase").unwrap();
        let ptr = secret.expose().as_ptr();
        assert_eq!(format!("{secret:?}"), "SecretBuf([REDACTED; 10])");
        secret.destroy().unwrap();
        assert_eq!(heap.stats().used_blocks, 0);
        // The arena is still owned by `heap`, so the old payload is readable.
        let residue = unsafe { core::slice::from_raw_parts(ptr, 10) };
        assert!(residue.iter().all(|b| *b == 0));
    }

    #[test]
    fn wipe_verification_flags_residue() {
        assert!(verify_wiped(&[0, 0, 0]).is_ok());
        assert_eq!(
            verify_wiped(&[0, 1, 0]),
            Err(InvariantViolation {
                what: "secret buffer not zero after wipe"
            })
        );
    }

    #[test]
    fn arena_size_is_validated() {
        assert!(Heap::with_capacity(16).is_err());
        assert_eq!(Heap::with_capacity(100).unwrap().capacity(), 96);
        assert_eq!(Heap::new().capacity(), DEFAULT_HEAP_SIZE);
    }
}
