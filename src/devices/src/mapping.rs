use std::mem::size_of;
use std::sync::Arc;

use pagemap::{PagePool, PageRange, Window, PAGE_SIZE};
use protocol::{MapKind, Opcode};
use tracing::warn;

use crate::request::BlockBody;
use crate::{RESERVED_PAGES, WINDOW_SLOTS};

const DESC_PAGE: usize = 0;
const BACKREF_PAGE: usize = 1;
const FIRST_BOUNCE_PAGE: usize = 2;

/// A descriptor entry is a `(user_address, length)` pair; the list is
/// terminated by a zero entry, so one page holds at most this many.
const MAX_LIST_ENTRIES: usize = PAGE_SIZE / (2 * size_of::<u64>()) - 1;

#[derive(Debug, thiserror::Error)]
pub(crate) enum MapError {
    #[error("payload exceeds the command size limit")]
    TooLarge,
    #[error("descriptor list overflows the reserved page")]
    TooManyEntries,
    #[error("bounce page pool exhausted")]
    BounceExhausted,
    #[error("mapping window exhausted")]
    WindowExhausted,
    #[error("window remap failed: {0}")]
    Window(#[from] pagemap::Error),
}

/// Per-connection zero-copy state: the mapping window plus the reserved
/// pages (descriptor list, backref table, bounce pages).
pub(crate) struct DataMapping {
    window: Window,
    reserved: PageRange,
    pool: Arc<PagePool>,
}

impl DataMapping {
    pub fn new(pool: &Arc<PagePool>) -> Result<DataMapping, pagemap::Error> {
        let window = Window::reserve(WINDOW_SLOTS, pool)?;
        let reserved = pool.alloc_range(RESERVED_PAGES)?;
        Ok(DataMapping {
            window,
            reserved,
            pool: Arc::clone(pool),
        })
    }

    pub fn base_addr(&self) -> u64 {
        self.window.base_addr()
    }

    /// Expose a request's scatter-gather pages contiguously in the window.
    ///
    /// Aligned interior pages are remapped in place (zero-copy); unaligned
    /// head/tail fringes go through bounce pages, recording the source page
    /// in the backref table so a read completion can copy the fringe back.
    /// On error the window is left cleared and the request unmapped.
    pub fn map(&mut self, opcode: Opcode, body: &mut BlockBody) -> Result<(), MapError> {
        match self.map_inner(opcode, body) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.window.clear(WINDOW_SLOTS, &self.pool);
                body.map_kind = MapKind::Unmapped;
                body.map_data = 0;
                body.mapped_size = 0;
                Err(err)
            }
        }
    }

    fn map_inner(&mut self, opcode: Opcode, body: &mut BlockBody) -> Result<(), MapError> {
        if body.map_kind != MapKind::Unmapped {
            warn!("request is already mapped");
            return Ok(());
        }
        let total: usize = body.fragments.iter().map(|f| f.len).sum();
        if total > protocol::MAX_SIZE_PER_COMMAND {
            return Err(MapError::TooLarge);
        }

        let is_write = opcode.is_write();
        let base = self.window.base_addr();
        let mut entries: Vec<(u64, u64)> = Vec::new();
        let mut backrefs = [0u64; RESERVED_PAGES];
        let mut next_bounce = FIRST_BOUNCE_PAGE;
        let mut slot = 0usize;
        let mut end_aligned = false;

        for frag in &body.fragments {
            let mut page = frag.page + frag.offset / PAGE_SIZE;
            let mut in_off = frag.offset % PAGE_SIZE;
            let mut remain = frag.len;

            if !end_aligned || in_off != 0 {
                if entries.len() == MAX_LIST_ENTRIES {
                    return Err(MapError::TooManyEntries);
                }
                let addr = base + (slot * PAGE_SIZE + in_off) as u64;
                if let Some(last) = entries.last() {
                    debug_assert!(addr >= last.0 + last.1, "descriptor entries must not overlap");
                }
                entries.push((addr, 0));
            }
            entries.last_mut().unwrap().1 += remain as u64;

            if in_off != 0 {
                // Unaligned head: route this page through a bounce page.
                let head = (PAGE_SIZE - in_off).min(remain);
                let bounce = self.take_bounce(&mut next_bounce)?;
                self.pool
                    .zero_bytes(PagePool::page_offset(bounce), PAGE_SIZE)?;
                if is_write {
                    self.pool.copy_bytes(
                        PagePool::page_offset(page) + in_off as u64,
                        PagePool::page_offset(bounce) + in_off as u64,
                        head,
                    )?;
                }
                self.map_data_slot(slot, bounce)?;
                backrefs[bounce - self.reserved.start_page()] = PagePool::page_offset(page);
                slot += 1;
                page += 1;
                remain -= head;

                if head != PAGE_SIZE - in_off {
                    // The fragment ends inside its first page.
                    end_aligned = false;
                    continue;
                }
            }

            while remain >= PAGE_SIZE {
                self.map_data_slot(slot, page)?;
                slot += 1;
                page += 1;
                remain -= PAGE_SIZE;
            }

            if remain > 0 {
                // Unaligned tail.
                let bounce = self.take_bounce(&mut next_bounce)?;
                self.pool
                    .zero_bytes(PagePool::page_offset(bounce), PAGE_SIZE)?;
                if is_write {
                    self.pool.copy_bytes(
                        PagePool::page_offset(page),
                        PagePool::page_offset(bounce),
                        remain,
                    )?;
                }
                self.map_data_slot(slot, bounce)?;
                backrefs[bounce - self.reserved.start_page()] = PagePool::page_offset(page);
                slot += 1;
                end_aligned = false;
            } else {
                end_aligned = true;
            }
        }

        self.write_reserved_tables(&entries, &backrefs)?;

        match entries.len() {
            0 => {
                body.map_kind = MapKind::Unmapped;
                body.map_data = 0;
            }
            1 => {
                body.map_kind = MapKind::Simple;
                body.map_data = entries[0].0 % PAGE_SIZE as u64;
            }
            _ => {
                // Expose the descriptor page in the slot right after the
                // data region.
                if slot >= WINDOW_SLOTS {
                    return Err(MapError::WindowExhausted);
                }
                self.map_data_slot(slot, self.reserved.page(DESC_PAGE))?;
                body.map_kind = MapKind::List;
                body.map_data = base + (slot * PAGE_SIZE) as u64;
                slot += 1;
            }
        }

        body.mapped_size = slot * PAGE_SIZE;
        Ok(())
    }

    fn take_bounce(&self, next_bounce: &mut usize) -> Result<usize, MapError> {
        if *next_bounce >= RESERVED_PAGES {
            return Err(MapError::BounceExhausted);
        }
        let page = self.reserved.page(*next_bounce);
        *next_bounce += 1;
        Ok(page)
    }

    fn map_data_slot(&self, slot: usize, page: usize) -> Result<(), MapError> {
        if slot >= WINDOW_SLOTS {
            return Err(MapError::WindowExhausted);
        }
        self.window.map_slot(slot, &self.pool, page)?;
        Ok(())
    }

    fn write_reserved_tables(
        &self,
        entries: &[(u64, u64)],
        backrefs: &[u64; RESERVED_PAGES],
    ) -> Result<(), MapError> {
        let mut desc = Vec::with_capacity((entries.len() + 1) * 2 * size_of::<u64>());
        for &(addr, len) in entries {
            desc.extend_from_slice(&addr.to_ne_bytes());
            desc.extend_from_slice(&len.to_ne_bytes());
        }
        desc.extend_from_slice(&[0u8; 2 * size_of::<u64>()]);
        self.pool.write_bytes(self.reserved.byte_offset(DESC_PAGE), &desc)?;

        let mut refs = Vec::with_capacity(RESERVED_PAGES * size_of::<u64>());
        for backref in backrefs {
            refs.extend_from_slice(&backref.to_ne_bytes());
        }
        self.pool
            .write_bytes(self.reserved.byte_offset(BACKREF_PAGE), &refs)?;
        Ok(())
    }

    fn read_u64(&self, page: usize, index: usize) -> u64 {
        let mut bytes = [0u8; 8];
        let _ = self.pool.read_bytes(
            self.reserved.byte_offset(page) + (index * size_of::<u64>()) as u64,
            &mut bytes,
        );
        u64::from_ne_bytes(bytes)
    }

    /// Read completion: copy every unaligned fringe from its bounce page
    /// back into the source page recorded in the backref table. Aligned
    /// middle pages were remapped in place and need no copy.
    pub fn copy_in_misaligned_pages(&self, length: u64, body: &BlockBody) {
        let entries: Vec<(u64, u64)> = match body.map_kind {
            MapKind::Unmapped => return,
            MapKind::Simple => vec![(self.window.base_addr() + body.map_data, length)],
            MapKind::List => {
                let mut entries = Vec::new();
                for i in 0..MAX_LIST_ENTRIES {
                    let addr = self.read_u64(DESC_PAGE, i * 2);
                    if addr == 0 {
                        break;
                    }
                    entries.push((addr, self.read_u64(DESC_PAGE, i * 2 + 1)));
                }
                entries
            }
        };

        let page = PAGE_SIZE as u64;
        let mut bounce = FIRST_BOUNCE_PAGE;
        for (addr, len) in entries {
            let front_aligned = addr % page == 0;
            let mut end_aligned = (addr + len) % page == 0;

            if !front_aligned {
                let off = addr % page;
                let copy_len = if off + len < page {
                    end_aligned = true;
                    len
                } else {
                    page - off
                };
                let src = self.reserved.byte_offset(bounce) + off;
                let dst = self.read_u64(BACKREF_PAGE, bounce) + off;
                let _ = self.pool.copy_bytes(src, dst, copy_len as usize);
                bounce += 1;
            }

            if !end_aligned {
                let copy_len = (addr + len) % page;
                let src = self.reserved.byte_offset(bounce);
                let dst = self.read_u64(BACKREF_PAGE, bounce);
                let _ = self.pool.copy_bytes(src, dst, copy_len as usize);
                bounce += 1;
            }
        }
    }

    /// Repoint every touched slot at the zero region and forget the
    /// mapping.
    pub fn unmap(&mut self, body: &mut BlockBody) {
        if body.map_kind == MapKind::Unmapped {
            return;
        }
        let _ = self.window.clear(body.mapped_size / PAGE_SIZE, &self.pool);
        body.map_kind = MapKind::Unmapped;
        body.map_data = 0;
        body.mapped_size = 0;
    }
}
