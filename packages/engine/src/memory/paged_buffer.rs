// packages/engine/src/memory/paged_buffer.rs
//! Append-only byte buffer spread over pool pages
//!
//! Used by the chunk writer as scratch memory for serialized records. The
//! buffer never reallocates or copies: it grows by borrowing another page.
//! When the pool is empty it spins briefly and then falls back to a heap page
//! so that recording on an application thread never blocks for long.

use crate::memory::page_pool::{Page, PagePool};
use crossbeam::utils::Backoff;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

/// Location of a byte inside a [`PagedBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddress {
    /// Index of the page within the buffer
    pub page: usize,

    /// Offset inside that page
    pub offset: usize,
}

/// Append-only paged buffer
pub struct PagedBuffer {
    pool: Arc<PagePool>,
    pages: Vec<Page>,
    len: usize,
    page_size: usize,
    spin_attempts: u32,
    detached_pages: usize,
}

impl PagedBuffer {
    /// Create an empty buffer; pages are borrowed lazily
    pub fn new(pool: Arc<PagePool>, spin_attempts: u32) -> Self {
        let page_size = pool.page_size();
        Self {
            pool,
            pages: Vec::new(),
            len: 0,
            page_size,
            spin_attempts,
            detached_pages: 0,
        }
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages currently held
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages that had to come from the heap because the pool was exhausted
    pub fn detached_pages(&self) -> usize {
        self.detached_pages
    }

    /// Page ids borrowed from the pool
    pub fn pool_page_ids(&self) -> Vec<usize> {
        self.pages.iter().filter_map(Page::id).collect()
    }

    /// Translate a logical position into a page address
    pub fn address_of(&self, position: usize) -> PageAddress {
        PageAddress {
            page: position / self.page_size,
            offset: position % self.page_size,
        }
    }

    /// Translate a page address back into a logical position
    pub fn position_of(&self, address: PageAddress) -> usize {
        address.page * self.page_size + address.offset
    }

    /// Append bytes, borrowing pages as needed
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let address = self.address_of(self.len);
            if address.page == self.pages.len() {
                let page = self.acquire_page();
                self.pages.push(page);
            }

            let page = &mut self.pages[address.page];
            let room = self.page_size - address.offset;
            let n = room.min(data.len());
            page.as_mut_slice()[address.offset..address.offset + n].copy_from_slice(&data[..n]);

            self.len += n;
            data = &data[n..];
        }
    }

    /// Overwrite already written bytes starting at `position`
    ///
    /// Panics if the range extends past the written length.
    pub fn patch(&mut self, position: usize, data: &[u8]) {
        assert!(
            position + data.len() <= self.len,
            "patch out of bounds: {}+{} > {}",
            position,
            data.len(),
            self.len
        );

        let mut cursor = position;
        let mut rest = data;
        while !rest.is_empty() {
            let address = self.address_of(cursor);
            let room = self.page_size - address.offset;
            let n = room.min(rest.len());
            self.pages[address.page].as_mut_slice()[address.offset..address.offset + n]
                .copy_from_slice(&rest[..n]);
            cursor += n;
            rest = &rest[n..];
        }
    }

    /// Copy `len` bytes starting at `position` out of the buffer
    pub fn read_at(&self, position: usize, len: usize) -> Option<Vec<u8>> {
        if position + len > self.len {
            return None;
        }

        let mut out = Vec::with_capacity(len);
        let mut cursor = position;
        while out.len() < len {
            let address = self.address_of(cursor);
            let room = self.page_size - address.offset;
            let n = room.min(len - out.len());
            out.extend_from_slice(&self.pages[address.page].as_slice()[address.offset..address.offset + n]);
            cursor += n;
        }
        Some(out)
    }

    /// Write the contents, page by page, into `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut remaining = self.len;
        for page in &self.pages {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(self.page_size);
            writer.write_all(&page.as_slice()[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Contents as one contiguous vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    fn acquire_page(&mut self) -> Page {
        if let Some(page) = self.pool.allocate() {
            return page;
        }

        // spin only until this buffer first finds the pool exhausted
        if self.detached_pages == 0 {
            let backoff = Backoff::new();
            for _ in 0..self.spin_attempts {
                backoff.snooze();
                if let Some(page) = self.pool.allocate() {
                    return page;
                }
            }
            warn!(
                "Page pool exhausted ({} pages of {} bytes), growing with heap pages",
                self.pool.page_count(),
                self.page_size
            );
        } else {
            debug!("Page pool still exhausted, adding heap page {}", self.detached_pages + 1);
        }

        self.detached_pages += 1;
        Page::detached(self.page_size)
    }
}

impl std::fmt::Debug for PagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedBuffer")
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .finish()
    }
}
