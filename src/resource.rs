//! Memory-resource adapters over [`TlsfPool`].
//!
//! [`TlsfResource`] translates `Layout`-based requests onto a pool and spills
//! to an upstream allocator when the pool cannot serve them.
//! [`SyncTlsfResource`] serializes a resource behind a mutex and exposes it
//! through [`core::alloc::GlobalAlloc`].

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    block::ALIGN_SIZE,
    pool::TlsfPool,
    source::{GlobalSource, PoolSource},
};

/// An allocator a [`TlsfResource`] can delegate to when its pool is
/// exhausted or handed a pointer it does not own.
pub trait UpstreamAllocator {
    /// Allocate per `layout`; `None` on failure.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Release an allocation previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation made by `self` with `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default upstream: refuses every request, so a resource built with it
/// fails cleanly instead of spilling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpstream;

impl UpstreamAllocator for NoUpstream {
    #[inline]
    fn allocate(&self, _layout: Layout) -> Option<NonNull<u8>> {
        None
    }

    #[inline]
    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}
}

#[cfg(any(test, feature = "std"))]
impl UpstreamAllocator for std::alloc::System {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // Safety: `layout` has a non-zero size.
        NonNull::new(unsafe { GlobalAlloc::alloc(self, layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        GlobalAlloc::dealloc(self, ptr.as_ptr(), layout)
    }
}

/// A memory resource backed by a [`TlsfPool`], with optional spill to an
/// upstream allocator.
///
/// Requests whose alignment exceeds [`ALIGN_SIZE`] are routed through
/// [`TlsfPool::aligned_allocate`]; everything else takes the plain
/// constant-time path.
///
/// This is a stateful resource: it must outlive every allocation it has
/// handed out.
#[derive(Debug)]
pub struct TlsfResource<S: PoolSource = GlobalSource, U: UpstreamAllocator = NoUpstream> {
    pool: TlsfPool<S>,
    upstream: U,
}

impl TlsfResource<GlobalSource, NoUpstream> {
    /// Create a resource over a fresh pool of `pool_bytes` bytes from the
    /// host allocator, with no upstream spill.
    pub fn new(pool_bytes: usize) -> Option<Self> {
        Self::with_upstream(pool_bytes, GlobalSource, NoUpstream)
    }
}

impl<S: PoolSource, U: UpstreamAllocator> TlsfResource<S, U> {
    /// Create a resource over a fresh pool drawn from `source`, spilling to
    /// `upstream` when the pool cannot serve a request.
    pub fn with_upstream(pool_bytes: usize, source: S, upstream: U) -> Option<Self> {
        Some(Self {
            pool: TlsfPool::with_source(pool_bytes, source)?,
            upstream,
        })
    }

    /// Allocate per `layout`, falling back to the upstream on pool
    /// exhaustion.
    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = if layout.align() > ALIGN_SIZE {
            self.pool.aligned_allocate(layout.align(), layout.size())
        } else {
            self.pool.allocate(layout.size())
        };
        match ptr {
            Some(ptr) => Some(ptr),
            None if layout.size() > 0 => self.upstream.allocate(layout),
            None => None,
        }
    }

    /// Release an allocation, routing pointers the pool does not own to the
    /// upstream.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation previously returned by
    /// [`Self::allocate`] with `layout`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        if !self.pool.deallocate(ptr) {
            self.upstream.deallocate(ptr, layout);
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &TlsfPool<S> {
        &self.pool
    }

    /// The upstream allocator this resource spills to.
    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Move an allocation into freshly allocated space, whichever side ends
    /// up providing it.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation made with `old_layout`.
    unsafe fn reallocate_by_move(
        &mut self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> *mut u8 {
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return ptr::null_mut();
        }
        match self.allocate(new_layout) {
            Some(new_ptr) => {
                ptr::copy_nonoverlapping(
                    ptr.as_ptr(),
                    new_ptr.as_ptr(),
                    old_layout.size().min(new_layout.size()),
                );
                self.deallocate(ptr, old_layout);
                new_ptr.as_ptr()
            }
            // The original allocation stays valid.
            None => ptr::null_mut(),
        }
    }
}

impl<S: PoolSource, U: UpstreamAllocator> PartialEq for TlsfResource<S, U> {
    /// Two resources are equal iff they operate on the same pool (the same
    /// backing buffer).
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool
    }
}

/// A [`TlsfResource`] behind a mutex, held across each call.
///
/// Serialization trades away the pool's bounded-latency guarantee under
/// contention; prefer one resource per thread when determinism matters.
#[derive(Debug)]
pub struct SyncTlsfResource<S: PoolSource = GlobalSource, U: UpstreamAllocator = NoUpstream> {
    inner: spin::Mutex<TlsfResource<S, U>>,
}

impl SyncTlsfResource<GlobalSource, NoUpstream> {
    /// See [`TlsfResource::new`].
    pub fn new(pool_bytes: usize) -> Option<Self> {
        TlsfResource::new(pool_bytes).map(|inner| Self {
            inner: spin::Mutex::new(inner),
        })
    }
}

impl<S: PoolSource, U: UpstreamAllocator> SyncTlsfResource<S, U> {
    /// See [`TlsfResource::with_upstream`].
    pub fn with_upstream(pool_bytes: usize, source: S, upstream: U) -> Option<Self> {
        TlsfResource::with_upstream(pool_bytes, source, upstream).map(|inner| Self {
            inner: spin::Mutex::new(inner),
        })
    }
}

unsafe impl<S: PoolSource, U: UpstreamAllocator> GlobalAlloc for SyncTlsfResource<S, U> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .allocate(layout)
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.inner.lock().deallocate(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let mut inner = self.inner.lock();
        // Safety: `layout.align()` is a power of two and the size validity is
        //         upheld by the caller.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());

        match NonNull::new(ptr) {
            // A null input degenerates to a plain allocation.
            None => inner
                .allocate(new_layout)
                .map(NonNull::as_ptr)
                .unwrap_or(ptr::null_mut()),
            Some(ptr) if inner.pool.owns(ptr) && layout.align() <= ALIGN_SIZE => {
                match inner.pool.reallocate(ptr, new_size) {
                    Some(new_ptr) => new_ptr.as_ptr(),
                    // A zero size released the block.
                    None if new_size == 0 => ptr::null_mut(),
                    // The pool is full; migrate, possibly to the upstream.
                    None => inner.reallocate_by_move(ptr, layout, new_layout),
                }
            }
            // Over-aligned or upstream-owned allocations always move so the
            // alignment contract keeps holding.
            Some(ptr) => inner.reallocate_by_move(ptr, layout, new_layout),
        }
    }
}
