//! The TLSF pool engine.

use core::{mem, ptr::NonNull};

use crate::{
    block::{
        BlockHdr, BlockRef, ALIGN_SIZE, BLOCK_HEADER_OVERHEAD, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN,
        FL_INDEX_COUNT, POOL_OVERHEAD, SL_INDEX_COUNT,
    },
    map::{adjust_request_size, mapping_insert, mapping_search},
    source::{GlobalSource, PoolSource},
    utils::{align_down, align_up, ffs},
};

/// The pool size used by convenience constructors that do not take one.
pub const DEFAULT_POOL_SIZE: usize = 1024 * 1024;

#[cfg_attr(doc, svgbobdoc::transform)]
/// A Two-Level Segregated Fit memory pool.
///
/// The pool owns one contiguous backing buffer, carved into a doubly-linked
/// physical chain of variable-size blocks. Free blocks are additionally
/// threaded onto segregated free lists indexed by a two-level size class,
/// with two bitmaps summarizing which lists are non-empty:
///
/// ```svgbob
///   First level
///                  ,-----+-----+-----+-----+-----+-----,
///      fl_bitmap = |  0  |  1  |  0  | ... |  0  |  0  |
///                  '-----+--+--+-----+-----+-----+-----'
///                           |
///   Second level            v
///                  ,-----+-----+-----+-----+-----+-----,
///   sl_bitmap[i] = |  0  |  0  |  1  | ... |  0  |  0  |
///                  '-----+-----+--+--+-----+-----+-----'
///                                 |
///   Free lists                    v
///                  ,---+---,    ,---+---,    ,---+---,
///   blocks[i][j]-->| o | o-+--->| o | o-+--->| o |   |
///                  '---+---'    '---+---'    '---+---'
/// ```
///
/// Every operation touches a bounded number of bits and pointers, so
/// allocation and deallocation run in constant time regardless of the pool
/// size or the number of live allocations.
///
/// The pool is not thread-safe by itself; see
/// [`SyncTlsfResource`](crate::SyncTlsfResource) for a serialized front end.
#[derive(Debug)]
pub struct TlsfPool<S: PoolSource = GlobalSource> {
    /// Bit `i` is set iff some list under first-level index `i` is non-empty.
    fl_bitmap: u32,
    /// Bit `j` of entry `i` is set iff free list `(i, j)` is non-empty.
    sl_bitmap: [u32; FL_INDEX_COUNT],
    /// Heads of the segregated free lists; `block_null` marks an empty list.
    blocks: [[BlockRef; SL_INDEX_COUNT]; FL_INDEX_COUNT],
    /// Self-looped end-of-list marker, allocated on the heap so the pool can
    /// move without invalidating the links that reference it.
    block_null: BlockRef,
    pool: NonNull<u8>,
    pool_size: usize,
    source: S,
}

// Safety: All block headers directly or indirectly referenced by a particular
//         instance of `TlsfPool` are logically owned by that pool and have no
//         interior mutability, so these are safe.
unsafe impl<S: PoolSource + Send> Send for TlsfPool<S> {}
unsafe impl<S: PoolSource + Sync> Sync for TlsfPool<S> {}

impl TlsfPool<GlobalSource> {
    /// Create a pool whose backing buffer of `pool_bytes` bytes comes from
    /// the host's general allocator.
    ///
    /// Returns `None` if the buffer cannot be obtained or if `pool_bytes`,
    /// after subtracting the pool overhead, does not leave room for a block
    /// in `[BLOCK_SIZE_MIN, BLOCK_SIZE_MAX)`.
    pub fn new(pool_bytes: usize) -> Option<Self> {
        Self::with_source(pool_bytes, GlobalSource)
    }
}

impl<S: PoolSource> TlsfPool<S> {
    /// Create a pool whose backing buffer comes from `source`.
    ///
    /// The source is tapped exactly once here and released exactly once when
    /// the pool is dropped. On failure nothing is leaked: a buffer that was
    /// already obtained is returned to the source before `None` comes back.
    pub fn with_source(pool_bytes: usize, mut source: S) -> Option<Self> {
        let capacity = align_down(pool_bytes.checked_sub(POOL_OVERHEAD)?, ALIGN_SIZE);
        if capacity < BLOCK_SIZE_MIN || capacity >= BLOCK_SIZE_MAX {
            return None;
        }

        // Safety: `pool_bytes` is non-zero (it exceeds `POOL_OVERHEAD`).
        let pool = unsafe { source.alloc(pool_bytes) }?;
        if pool.as_ptr() as usize % ALIGN_SIZE != 0 {
            // Safety: `pool` came from this source with this length.
            unsafe { source.dealloc(pool, pool_bytes) };
            return None;
        }

        let block_null = match new_null_block() {
            Some(node) => node,
            None => {
                // Safety: `pool` came from this source with this length.
                unsafe { source.dealloc(pool, pool_bytes) };
                return None;
            }
        };

        let mut this = Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[block_null; SL_INDEX_COUNT]; FL_INDEX_COUNT],
            block_null,
            pool,
            pool_size: pool_bytes,
            source,
        };

        unsafe {
            // Install the giant free block. Its header starts one word before
            // the buffer, so the `prev_phys` slot lies outside the pool and
            // is never touched, while the size word lands on the buffer's
            // first word.
            let block = BlockRef::from_header(NonNull::new_unchecked(
                this.pool.as_ptr().wrapping_sub(BLOCK_HEADER_OVERHEAD) as *mut BlockHdr,
            ));
            block.init_size(capacity);
            block.set_free();
            block.set_prev_used();
            this.block_insert(block);

            // Cap the chain with a zero-size used sentinel so `next` always
            // lands on a valid header.
            let sentinel = block.link_next();
            sentinel.init_size(0);
            sentinel.set_prev_free();
        }

        Some(this)
    }

    /// The usable size of the pool when completely free, in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        align_down(self.pool_size - POOL_OVERHEAD, ALIGN_SIZE)
    }

    /// Whether `ptr` points into this pool's backing buffer.
    #[inline]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let start = self.pool.as_ptr() as usize;
        addr >= start && addr < start + self.pool_size
    }

    /// Attempt to allocate `size` bytes, aligned to [`ALIGN_SIZE`].
    ///
    /// Returns `None` when the request is zero, exceeds the largest
    /// serviceable block size, or no free block can satisfy it.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjust = adjust_request_size(size, ALIGN_SIZE);
        let block = self.locate_free(adjust)?;
        // Safety: the block was just detached from a free list and its size
        //         is at least `adjust`.
        Some(unsafe { self.prepare_used(block, adjust) })
    }

    /// Attempt to allocate `size` bytes aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments up to [`ALIGN_SIZE`] are
    /// already guaranteed by [`Self::allocate`]; larger ones reserve enough
    /// slack that the leading padding can be split off as a whole free block
    /// and returned to the pool.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        let adjust = adjust_request_size(size, ALIGN_SIZE);

        // The slack must cover a whole header: if the aligned payload left a
        // smaller gap, there would be no way to hand the padding back (the
        // physically previous block is in use, so its size cannot be
        // extended to swallow the gap).
        let gap_minimum = mem::size_of::<BlockHdr>();
        let size_with_gap = adjust_request_size(
            adjust.checked_add(align)?.checked_add(gap_minimum)?,
            align,
        );

        let aligned_size = if adjust != 0 && align > ALIGN_SIZE {
            size_with_gap
        } else {
            adjust
        };

        let mut block = self.locate_free(aligned_size)?;
        unsafe {
            let ptr = block.to_payload().as_ptr() as usize;
            let mut aligned = align_up(ptr, align);
            let mut gap = aligned - ptr;

            // A gap smaller than a header cannot become a free block; move on
            // to the next aligned boundary that leaves enough room.
            if gap != 0 && gap < gap_minimum {
                let gap_remain = gap_minimum - gap;
                let offset = gap_remain.max(align);
                aligned = align_up(aligned + offset, align);
                gap = aligned - ptr;
            }

            if gap != 0 {
                debug_assert!(gap >= gap_minimum, "gap size too small");
                block = self.trim_free_leading(block, gap);
            }

            Some(self.prepare_used(block, adjust))
        }
    }

    /// Return a previously allocated block to the pool.
    ///
    /// Returns `false` without touching anything if `ptr` does not point
    /// into this pool's backing buffer, so a caller layer can route such
    /// pointers to whichever allocator owns them.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    /// If `ptr` points into this pool, it must denote a live allocation
    /// previously returned by this pool.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> bool {
        if !self.owns(ptr) {
            return false;
        }
        let block = BlockRef::from_payload(ptr);
        debug_assert!(!block.is_free(), "block already marked as free");
        block.mark_as_free();
        let block = self.merge_prev(block);
        let block = self.merge_next(block);
        self.block_insert(block);
        true
    }

    /// Resize a previously allocated block.
    ///
    /// Grows in place by absorbing a free physical successor when possible;
    /// otherwise allocates a new block, copies the payload and releases the
    /// old block. A `size` of zero deallocates and returns `None`. On
    /// failure (`None` with `size` non-zero) the original block is left
    /// untouched and remains valid.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation previously returned by this pool.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // A zero size is a release, mirroring the C `realloc` contract.
        if size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let block = BlockRef::from_payload(ptr);
        let next = block.next();
        let cursize = block.size();
        let combined = cursize + next.size() + BLOCK_HEADER_OVERHEAD;
        let adjust = adjust_request_size(size, ALIGN_SIZE);
        if adjust == 0 {
            // The request exceeds the largest serviceable block.
            return None;
        }

        debug_assert!(!block.is_free(), "block already marked as free");

        if adjust > cursize && (!next.is_free() || adjust > combined) {
            // The block cannot grow where it is; move it. The original stays
            // intact if the new allocation fails.
            let new_ptr = self.allocate(size)?;
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                cursize.min(size),
            );
            self.deallocate(ptr);
            Some(new_ptr)
        } else {
            if adjust > cursize {
                self.merge_next(block);
                block.mark_as_used();
            }
            self.trim_used(block, adjust);
            Some(ptr)
        }
    }

    /// Find a free block of at least `size` bytes and detach it from its
    /// free list. The block keeps its free flag; `prepare_used` flips it.
    fn locate_free(&mut self, size: usize) -> Option<BlockRef> {
        if size == 0 {
            return None;
        }
        let (mut fl, mut sl) = mapping_search(size);
        if fl >= FL_INDEX_COUNT {
            return None;
        }
        let block = self.search_suitable_block(&mut fl, &mut sl)?;
        unsafe {
            debug_assert!(block.size() >= size);
            self.remove_free_block(block, fl, sl);
        }
        Some(block)
    }

    /// Trim the block down to `size`, mark it used and hand out its payload.
    ///
    /// # Safety
    ///
    /// `block` must be a free block detached from its list, with a size of
    /// at least `size`; `size` must be a non-zero multiple of [`ALIGN_SIZE`].
    unsafe fn prepare_used(&mut self, block: BlockRef, size: usize) -> NonNull<u8> {
        debug_assert!(size != 0, "size must be non-zero");
        self.trim_free(block, size);
        block.mark_as_used();
        block.to_payload()
    }

    /// Split any trailing space beyond `size` off a free block and return it
    /// to the pool.
    unsafe fn trim_free(&mut self, block: BlockRef, size: usize) {
        debug_assert!(block.is_free(), "block must be free");
        if block.can_split(size) {
            let remaining = block.split(size);
            block.link_next();
            remaining.set_prev_free();
            self.block_insert(remaining);
        }
    }

    /// Split any trailing space beyond `size` off a used block and return it
    /// to the pool, merging it with a free successor if there is one.
    unsafe fn trim_used(&mut self, block: BlockRef, size: usize) {
        debug_assert!(!block.is_free(), "block must be used");
        if block.can_split(size) {
            let remaining = block.split(size);
            remaining.set_prev_used();
            let remaining = self.merge_next(remaining);
            self.block_insert(remaining);
        }
    }

    /// Split the first `size` bytes off a free block and return them to the
    /// pool, yielding the trailing block. Used to shed alignment padding.
    unsafe fn trim_free_leading(&mut self, block: BlockRef, size: usize) -> BlockRef {
        if block.can_split(size) {
            // The payload of the trailing block must land `size` bytes in.
            let remaining = block.split(size - BLOCK_HEADER_OVERHEAD);
            remaining.set_prev_free();
            block.link_next();
            self.block_insert(block);
            remaining
        } else {
            block
        }
    }

    /// Combine the block with its physical predecessor if that one is free.
    unsafe fn merge_prev(&mut self, block: BlockRef) -> BlockRef {
        if block.is_prev_free() {
            let prev = block.prev_phys();
            debug_assert!(
                prev.is_free(),
                "prev block is not free even though marked as such"
            );
            self.block_remove(prev);
            BlockRef::coalesce(prev, block)
        } else {
            block
        }
    }

    /// Combine the block with its physical successor if that one is free.
    unsafe fn merge_next(&mut self, block: BlockRef) -> BlockRef {
        let next = block.next();
        if next.is_free() {
            debug_assert!(!block.is_last(), "previous block cannot be last");
            self.block_remove(next);
            BlockRef::coalesce(block, next)
        } else {
            block
        }
    }

    /// Insert a free block into the list derived from its size.
    unsafe fn block_insert(&mut self, block: BlockRef) {
        let (fl, sl) = mapping_insert(block.size());
        self.insert_free_block(block, fl, sl);
    }

    /// Remove a free block from the list derived from its size.
    unsafe fn block_remove(&mut self, block: BlockRef) {
        let (fl, sl) = mapping_insert(block.size());
        self.remove_free_block(block, fl, sl);
    }

    /// Push a free block onto the head of list `(fl, sl)` and update the
    /// bitmaps.
    unsafe fn insert_free_block(&mut self, block: BlockRef, fl: usize, sl: usize) {
        let current = self.blocks[fl][sl];
        block.set_next_free_block(current);
        block.set_prev_free_block(self.block_null);
        if current != self.block_null {
            current.set_prev_free_block(block);
        }

        debug_assert_eq!(
            block.to_payload().as_ptr() as usize % ALIGN_SIZE,
            0,
            "block not aligned properly"
        );

        self.blocks[fl][sl] = block;
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    /// Splice a free block out of list `(fl, sl)`, clearing the bitmap bits
    /// when the list becomes empty. The sentinel is never written through.
    unsafe fn remove_free_block(&mut self, block: BlockRef, fl: usize, sl: usize) {
        let prev = block.prev_free();
        let next = block.next_free();

        if next != self.block_null {
            next.set_prev_free_block(prev);
        }
        if prev != self.block_null {
            prev.set_next_free_block(next);
        }

        if self.blocks[fl][sl] == block {
            self.blocks[fl][sl] = next;

            if next == self.block_null {
                self.sl_bitmap[fl] &= !(1 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }
    }

    /// Find the head of the first non-empty list at or above `(fl, sl)`,
    /// updating the indices to the list that was actually chosen.
    fn search_suitable_block(&self, fl: &mut usize, sl: &mut usize) -> Option<BlockRef> {
        let mut sl_map = self.sl_bitmap[*fl] & (!0u32 << *sl);
        if sl_map == 0 {
            // Nothing in this first-level class at or above `sl`; take the
            // lowest list of the next non-empty class.
            let fl_map = self.fl_bitmap & (!0u32 << (*fl + 1));
            if fl_map == 0 {
                // No free blocks above the requested class; the pool is
                // exhausted for this request.
                return None;
            }

            *fl = ffs(fl_map) as usize;
            sl_map = self.sl_bitmap[*fl];
        }
        debug_assert!(sl_map != 0, "second level bitmap is null");
        *sl = ffs(sl_map) as usize;

        Some(self.blocks[*fl][*sl])
    }

    #[cfg(test)]
    pub(crate) fn first_block(&self) -> BlockRef {
        // Safety: offsetting backwards from a non-null buffer start stays
        //         non-null.
        BlockRef::from_header(unsafe {
            NonNull::new_unchecked(
                self.pool.as_ptr().wrapping_sub(BLOCK_HEADER_OVERHEAD) as *mut BlockHdr
            )
        })
    }
}

impl<S: PoolSource> PartialEq for TlsfPool<S> {
    /// Two pools are equal iff they share the same backing buffer, which can
    /// only be the case for the same pool.
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool
    }
}

impl<S: PoolSource> Drop for TlsfPool<S> {
    fn drop(&mut self) {
        unsafe {
            // Safety: the buffer came from this source with this length and
            //         no block outlives the pool (caller contract).
            self.source.dealloc(self.pool, self.pool_size);
            free_null_block(self.block_null);
        }
    }
}

/// Allocate and self-loop the end-of-list marker node.
fn new_null_block() -> Option<BlockRef> {
    let layout = core::alloc::Layout::new::<BlockHdr>();
    // Safety: `BlockHdr` has a non-zero size.
    let ptr = unsafe { alloc::alloc::alloc(layout) } as *mut BlockHdr;
    let node = BlockRef::from_header(NonNull::new(ptr)?);
    unsafe {
        node.init_size(0);
        node.set_next_free_block(node);
        node.set_prev_free_block(node);
    }
    Some(node)
}

/// # Safety
///
/// `node` must have come from [`new_null_block`] and must not be used again.
unsafe fn free_null_block(node: BlockRef) {
    let layout = core::alloc::Layout::new::<BlockHdr>();
    alloc::alloc::dealloc(node.as_ptr() as *mut u8, layout);
}
