//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹ on top of a self-contained memory pool.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** The worst case is a fixed number of bit scans and
//!    pointer updates, independent of the pool size and the number of live
//!    allocations.
//!
//!  - **The pool owns a single backing buffer** obtained from a pluggable
//!    [`PoolSource`] (the host's general allocator by default, `mmap` on
//!    Unix) and returns it when dropped. The pool never grows after
//!    construction.
//!
//!  - **This crate supports `#![no_std]`.** The core only needs `alloc` for
//!    its internal bookkeeping node and the default buffer source.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## `TlsfPool`: Core API
//!
//! ```rust
//! use tlsf_pool::TlsfPool;
//!
//! let mut pool = TlsfPool::new(65536).unwrap();
//!
//! let ptr1 = pool.allocate(42).unwrap();
//! let ptr2 = pool.allocate(1000).unwrap();
//! unsafe {
//!     ptr1.as_ptr().write_bytes(0xa5, 42);
//!     ptr2.as_ptr().write_bytes(0x5a, 1000);
//!     assert!(pool.deallocate(ptr1));
//!     assert!(pool.deallocate(ptr2));
//! }
//! ```
//!
//! ## `TlsfResource`: Layout-based allocation with upstream fallback
//!
//! ```rust
//! use core::alloc::Layout;
//! use tlsf_pool::TlsfResource;
//!
//! let mut resource = TlsfResource::new(65536).unwrap();
//!
//! let layout = Layout::from_size_align(256, 64).unwrap();
//! let ptr = resource.allocate(layout).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 64, 0);
//! unsafe { resource.deallocate(ptr, layout) };
//! ```
//!
//! ## `SyncTlsfResource`: Serialized access
//!
//! ```rust
//! use core::alloc::{GlobalAlloc, Layout};
//! use tlsf_pool::SyncTlsfResource;
//!
//! let resource = SyncTlsfResource::new(65536).unwrap();
//!
//! let layout = Layout::new::<u64>();
//! unsafe {
//!     let ptr = resource.alloc(layout);
//!     assert!(!ptr.is_null());
//!     resource.dealloc(ptr, layout);
//! }
//! ```
//!
//! # Details
//!
//! ## Changes from the Original Algorithm
//!
//!  - Empty free lists point to a single self-looped sentinel node instead of
//!    a null pointer, so the list heads never need a null check before being
//!    chased.
//!
//!  - The end of the memory pool is capped by a zero-sized, permanently
//!    occupied sentinel block, so walking to the physically next block always
//!    lands on a valid header.
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

mod block;
mod map;
mod pool;
mod resource;
mod source;
mod utils;

pub use self::{
    block::{ALIGN_SIZE, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN},
    pool::{TlsfPool, DEFAULT_POOL_SIZE},
    resource::{NoUpstream, SyncTlsfResource, TlsfResource, UpstreamAllocator},
    source::{GlobalSource, PoolSource},
};

#[cfg(unix)]
pub use self::source::MmapSource;
