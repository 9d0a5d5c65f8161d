// packages/engine/src/memory/mod.rs
//! Paged scratch memory for the writer side
//!
//! - **Page Pool**: fixed ring of pages cut from one anonymous mapping
//! - **Paged Buffer**: append-only buffer that grows page by page
//!
//! # Ownership
//!
//! ```text
//! app thread:  PagePool::allocate() → PagedBuffer (chunk being written)
//!                                          │ flush
//!                                          ▼
//! sink thread:                 persist bytes → drop pages → pool
//! ```
//!
//! A page is never handed out again while a buffer still owns it, so two
//! unflushed frames can never share page memory.

pub mod page_pool;
pub mod paged_buffer;

pub use page_pool::{Page, PagePool, PoolStats};
pub use paged_buffer::{PageAddress, PagedBuffer};
