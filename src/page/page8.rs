use crate::consts::*;
use crate::page::container::head as chead;
use crate::types::NIL;

/// One 8 KiB page: a 32-word header followed by 64 container slots of 28
/// words each.
///
/// All mutations go through `set`, which keeps the checksum word (an xor
/// over the page with the checksum word itself counted as zero) current
/// incrementally.
pub struct Page8 {
    pub(crate) word: [u32; WORDS_IN_PAGE],
}

impl Default for Page8 {
    fn default() -> Self {
        Self {
            word: [0; WORDS_IN_PAGE],
        }
    }
}

const LEFT_HEAD_SHIFT: u32 = 16;
const RIGHT_HEAD_SHIFT: u32 = 23;
const HEAD_MASK: u32 = 0x7F;

impl Page8 {
    pub fn get(&self, i: usize) -> u32 {
        self.word[i]
    }

    pub fn set(&mut self, i: usize, v: u32) {
        if i != POS_CHECKSUM {
            self.word[POS_CHECKSUM] ^= self.word[i] ^ v;
        }
        self.word[i] = v;
    }

    pub fn zero(&mut self) {
        self.word = [0; WORDS_IN_PAGE];
    }

    pub fn checksum_ok(&self) -> bool {
        let mut sum = 0u32;
        for (i, w) in self.word.iter().enumerate() {
            if i != POS_CHECKSUM {
                sum ^= w;
            }
        }
        sum == self.word[POS_CHECKSUM]
    }

    pub fn recompute_checksum(&mut self) {
        let mut sum = 0u32;
        for (i, w) in self.word.iter().enumerate() {
            if i != POS_CHECKSUM {
                sum ^= w;
            }
        }
        self.word[POS_CHECKSUM] = sum;
    }

    /// Raw region overwrite, used by undo replay. The caller recomputes
    /// the checksum when it is done with the page.
    pub fn overwrite_region(&mut self, offset: usize, src: &[u32]) {
        self.word[offset..offset + src.len()].copy_from_slice(src);
    }

    // ------------------------------------------------------------------
    // header fields
    // ------------------------------------------------------------------

    pub fn logical_id(&self) -> u32 {
        self.word[POS_PAGE_ID]
    }

    pub fn set_logical_id(&mut self, id: u32) {
        self.set(POS_PAGE_ID, id);
    }

    pub fn page_type(&self) -> u32 {
        (self.word[POS_EMPTY_LIST] >> PAGE_TYPE_BIT) & 1
    }

    pub fn overflow_rec(&self) -> u32 {
        self.word[POS_OVERFLOWREC]
    }

    pub fn set_overflow_rec(&mut self, rec: u32) {
        self.set(POS_OVERFLOWREC, rec);
    }

    /// The fragment owning this page; rewired when the page is restored.
    pub fn frag_rec(&self) -> u32 {
        self.word[POS_FRAG_REC]
    }

    pub fn set_frag_rec(&mut self, frag: u32) {
        self.set(POS_FRAG_REC, frag);
    }

    pub fn alloc_containers(&self) -> u32 {
        self.word[POS_ALLOC_CONTAINERS] & 0xFFFF
    }

    pub fn elem_count(&self) -> u32 {
        self.word[POS_ALLOC_CONTAINERS] >> 16
    }

    fn set_counts(&mut self, containers: u32, elements: u32) {
        self.set(POS_ALLOC_CONTAINERS, (elements << 16) | containers);
    }

    pub fn add_alloc_containers(&mut self, delta: i32) {
        let c = (self.alloc_containers() as i32 + delta) as u32;
        self.set_counts(c, self.elem_count());
    }

    pub fn add_elem_count(&mut self, delta: i32) {
        let e = (self.elem_count() as i32 + delta) as u32;
        self.set_counts(self.alloc_containers(), e);
    }

    // ------------------------------------------------------------------
    // container slot addressing
    // ------------------------------------------------------------------

    /// Word index of the slot base of container `idx`.
    pub fn con_base(idx: u32) -> usize {
        HEAD_SIZE + (BUF_SIZE * idx) as usize
    }

    /// Word index of the head of the left or right container of a slot.
    pub fn con_head_ptr(idx: u32, is_left: bool) -> usize {
        if is_left {
            Self::con_base(idx)
        } else {
            Self::con_base(idx) + (BUF_SIZE - CON_HEAD_SIZE) as usize
        }
    }

    // ------------------------------------------------------------------
    // per-page empty container lists
    //
    // The heads live packed in the empty-list header word; the links are
    // threaded through the head words of the free containers themselves
    // (word 0 next, word 1 prev, EMPTY_LIST terminated).
    // ------------------------------------------------------------------

    pub fn empty_head(&self, is_left: bool) -> u32 {
        let shift = if is_left {
            LEFT_HEAD_SHIFT
        } else {
            RIGHT_HEAD_SHIFT
        };
        (self.word[POS_EMPTY_LIST] >> shift) & HEAD_MASK
    }

    fn set_empty_head(&mut self, is_left: bool, head: u32) {
        let shift = if is_left {
            LEFT_HEAD_SHIFT
        } else {
            RIGHT_HEAD_SHIFT
        };
        let v = (self.word[POS_EMPTY_LIST] & !(HEAD_MASK << shift)) | (head << shift);
        self.set(POS_EMPTY_LIST, v);
    }

    pub fn has_free_container(&self) -> bool {
        self.empty_head(true) != EMPTY_LIST || self.empty_head(false) != EMPTY_LIST
    }

    /// Take the first free container of the given side.
    pub fn pop_empty(&mut self, is_left: bool) -> Option<u32> {
        let head = self.empty_head(is_left);
        if head == EMPTY_LIST {
            return None;
        }
        self.unlink_empty(is_left, head);
        Some(head)
    }

    /// Remove a specific container from its free list (dual-ownership
    /// takeover reaches into the middle of the list).
    pub fn unlink_empty(&mut self, is_left: bool, idx: u32) {
        let ptr = Self::con_head_ptr(idx, is_left);
        let next = self.word[ptr];
        let prev = self.word[ptr + 1];
        if prev == EMPTY_LIST {
            self.set_empty_head(is_left, next);
        } else {
            let pptr = Self::con_head_ptr(prev, is_left);
            self.set(pptr, next);
        }
        if next != EMPTY_LIST {
            let nptr = Self::con_head_ptr(next, is_left);
            self.set(nptr + 1, prev);
        }
    }

    /// Membership test; the free lists are short (at most 64 entries).
    pub fn is_on_empty_list(&self, is_left: bool, idx: u32) -> bool {
        let mut cur = self.empty_head(is_left);
        while cur != EMPTY_LIST {
            if cur == idx {
                return true;
            }
            cur = self.word[Self::con_head_ptr(cur, is_left)];
        }
        false
    }

    pub fn push_empty(&mut self, is_left: bool, idx: u32) {
        let head = self.empty_head(is_left);
        let ptr = Self::con_head_ptr(idx, is_left);
        self.set(ptr, head);
        self.set(ptr + 1, EMPTY_LIST);
        if head != EMPTY_LIST {
            let hptr = Self::con_head_ptr(head, is_left);
            self.set(hptr + 1, idx);
        }
        self.set_empty_head(is_left, idx);
    }

    // ------------------------------------------------------------------
    // initialization
    // ------------------------------------------------------------------

    /// A bucket page: every left container is a bucket head, every right
    /// container starts on the free list.
    pub fn init_normal(&mut self, logical_id: u32, frag: u32) {
        self.zero();
        self.set_logical_id(logical_id);
        self.set(POS_OVERFLOWREC, NIL);
        self.set(POS_FRAG_REC, frag);
        self.set_empty_head(true, EMPTY_LIST);
        self.init_free_chain(false);
        for idx in 0..NO_CONTAINERS {
            let ptr = Self::con_head_ptr(idx, true);
            self.set(ptr, chead::empty_in_use());
            self.set(ptr + 1, NIL);
        }
        self.set_counts(NO_CONTAINERS, 0);
    }

    /// An overflow page: both sides fully free.
    pub fn init_overflow(&mut self, logical_id: u32, overflow_rec: u32, frag: u32) {
        self.zero();
        self.set_logical_id(logical_id);
        let tbit = OVERFLOW_PAGE_TYPE << PAGE_TYPE_BIT;
        self.set(POS_EMPTY_LIST, tbit);
        self.set(POS_OVERFLOWREC, overflow_rec);
        self.set(POS_FRAG_REC, frag);
        self.init_free_chain(true);
        self.init_free_chain(false);
        self.set_counts(0, 0);
    }

    fn init_free_chain(&mut self, is_left: bool) {
        for idx in 0..NO_CONTAINERS {
            let ptr = Self::con_head_ptr(idx, is_left);
            let next = if idx + 1 == NO_CONTAINERS {
                EMPTY_LIST
            } else {
                idx + 1
            };
            let prev = if idx == 0 { EMPTY_LIST } else { idx - 1 };
            self.set(ptr, next);
            self.set(ptr + 1, prev);
        }
        self.set_empty_head(is_left, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_incremental() {
        let mut page = Page8::default();
        page.set(100, 0xDEAD);
        page.set(101, 0xBEEF);
        page.set(100, 0x1234);
        assert!(page.checksum_ok());
    }

    #[test]
    fn test_init_normal_layout() {
        let mut page = Page8::default();
        page.init_normal(5, 0);
        assert!(page.checksum_ok());
        assert_eq!(page.logical_id(), 5);
        assert_eq!(page.page_type(), NORMAL_PAGE_TYPE);
        assert_eq!(page.alloc_containers(), NO_CONTAINERS);
        assert_eq!(page.empty_head(true), EMPTY_LIST);
        assert_eq!(page.empty_head(false), 0);
    }

    #[test]
    fn test_empty_list_pop_push() {
        let mut page = Page8::default();
        page.init_overflow(9, 3, 0);
        assert_eq!(page.page_type(), OVERFLOW_PAGE_TYPE);
        assert_eq!(page.overflow_rec(), 3);

        let a = page.pop_empty(true).unwrap();
        let b = page.pop_empty(true).unwrap();
        assert_eq!((a, b), (0, 1));

        // middle removal keeps the chain intact
        page.unlink_empty(false, 1);
        page.unlink_empty(false, 0);
        assert_eq!(page.pop_empty(false), Some(2));

        page.push_empty(true, 0);
        assert_eq!(page.empty_head(true), 0);
        assert!(page.checksum_ok());
    }
}
