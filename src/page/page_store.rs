use bit_vec::BitVec;
use log::debug;

use crate::{
    consts::LCP_PAGE_RESERVE,
    error::{ErrorKind, SmallError},
    page::page8::Page8,
    types::{PageId, NIL},
};

/// The slab of 8 KiB pages. Free pages are threaded through word zero; a
/// cursor advances through never-allocated capacity. A fixed tail of the
/// slab is reserved at startup for checkpoint copy and zero pages so that
/// a checkpoint can always make progress.
pub struct PageStore {
    pages: Vec<Page8>,
    free_head: u32,
    cursor: u32,
    normal_limit: u32,
    lcp_free_head: u32,
    lcp_cursor: u32,
}

impl PageStore {
    pub fn new(page8: u32) -> Self {
        assert!(page8 as usize > LCP_PAGE_RESERVE);
        let mut pages = Vec::with_capacity(page8 as usize);
        for _ in 0..page8 {
            pages.push(Page8::default());
        }
        let normal_limit = page8 - LCP_PAGE_RESERVE as u32;
        Self {
            pages,
            free_head: NIL,
            cursor: 0,
            normal_limit,
            lcp_free_head: NIL,
            lcp_cursor: normal_limit,
        }
    }

    pub fn get(&self, id: PageId) -> &Page8 {
        &self.pages[id as usize]
    }

    pub fn get_mut(&mut self, id: PageId) -> &mut Page8 {
        &mut self.pages[id as usize]
    }

    /// Two pages at once, for element moves. Panics if `a == b`.
    pub fn get_pair_mut(&mut self, a: PageId, b: PageId) -> (&mut Page8, &mut Page8) {
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.pages.split_at_mut(b as usize);
            (&mut lo[a as usize], &mut hi[0])
        } else {
            let (lo, hi) = self.pages.split_at_mut(a as usize);
            (&mut hi[0], &mut lo[b as usize])
        }
    }

    pub fn seize(&mut self) -> Result<PageId, SmallError> {
        let id;
        if self.free_head != NIL {
            id = self.free_head;
            self.free_head = self.pages[id as usize].get(0);
        } else if self.cursor < self.normal_limit {
            id = self.cursor;
            self.cursor += 1;
        } else {
            return Err(SmallError::of(ErrorKind::OutOfPages, "page store exhausted"));
        }
        self.pages[id as usize].zero();
        debug!("page seized, id: {}", id);
        Ok(id)
    }

    pub fn release(&mut self, id: PageId) {
        debug_assert!(id < self.normal_limit);
        self.pages[id as usize].zero();
        self.pages[id as usize].set(0, self.free_head);
        self.free_head = id;
        debug!("page released, id: {}", id);
    }

    pub fn seize_lcp(&mut self) -> Result<PageId, SmallError> {
        let id;
        if self.lcp_free_head != NIL {
            id = self.lcp_free_head;
            self.lcp_free_head = self.pages[id as usize].get(0);
        } else if (self.lcp_cursor as usize) < self.pages.len() {
            id = self.lcp_cursor;
            self.lcp_cursor += 1;
        } else {
            return Err(SmallError::of(
                ErrorKind::OutOfPages,
                "checkpoint page reserve exhausted",
            ));
        }
        self.pages[id as usize].zero();
        Ok(id)
    }

    pub fn release_lcp(&mut self, id: PageId) {
        debug_assert!(id >= self.normal_limit);
        self.pages[id as usize].zero();
        self.pages[id as usize].set(0, self.lcp_free_head);
        self.lcp_free_head = id;
    }

    pub fn free_count(&self) -> u32 {
        let mut n = self.normal_limit - self.cursor;
        let mut p = self.free_head;
        while p != NIL {
            n += 1;
            p = self.pages[p as usize].get(0);
        }
        n
    }

    /// Bitmap of free and never-allocated pages in the normal pool, for
    /// integrity checks (no page may be both free and in a directory).
    pub fn free_bitmap(&self) -> BitVec {
        let mut free = BitVec::from_elem(self.normal_limit as usize, false);
        for i in self.cursor..self.normal_limit {
            free.set(i as usize, true);
        }
        let mut p = self.free_head;
        while p != NIL {
            free.set(p as usize, true);
            p = self.pages[p as usize].get(0);
        }
        free
    }

    pub fn normal_limit(&self) -> u32 {
        self.normal_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seize_release_free_list() {
        let mut store = PageStore::new(LCP_PAGE_RESERVE as u32 + 4);
        let a = store.seize().unwrap();
        let b = store.seize().unwrap();
        let c = store.seize().unwrap();
        let d = store.seize().unwrap();
        assert!(store.seize().is_err());

        store.release(b);
        store.release(d);
        // LIFO through word zero
        assert_eq!(store.seize().unwrap(), d);
        assert_eq!(store.seize().unwrap(), b);
        assert_eq!(store.free_count(), 0);

        let bitmap = store.free_bitmap();
        assert!(!bitmap.get(a as usize).unwrap());
        assert!(!bitmap.get(c as usize).unwrap());
    }

    #[test]
    fn test_lcp_pool_is_separate() {
        let mut store = PageStore::new(LCP_PAGE_RESERVE as u32 + 1);
        let _ = store.seize().unwrap();
        assert!(store.seize().is_err());
        // the reserve is still intact
        for _ in 0..LCP_PAGE_RESERVE {
            store.seize_lcp().unwrap();
        }
        assert!(store.seize_lcp().is_err());
    }
}
