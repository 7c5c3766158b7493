use log::debug;

use crate::{
    consts::*,
    error::{ErrorKind, SmallError},
    frag::OverList,
    page::{element, page8::Page8, DirKind},
    store::HashStore,
    types::{FragId, LogicalPageId, PageId, NIL},
};

/// Container head codec. Word 0 packs the length (head included), the
/// link to the next container of the chain and the dual-ownership flag;
/// word 1 carries the logical overflow page id when the next container
/// lives on another page.
pub mod head {
    use crate::consts::CON_HEAD_SIZE;

    pub const NEXT_NONE: u32 = 0;
    pub const NEXT_LEFT: u32 = 1;
    pub const NEXT_RIGHT: u32 = 2;

    const LEN_MASK: u32 = 0x3F;
    const TYPE_SHIFT: u32 = 6;
    const SAME_PAGE_BIT: u32 = 1 << 8;
    const DUAL_BIT: u32 = 1 << 9;
    const INDEX_SHIFT: u32 = 10;
    const INDEX_MASK: u32 = 0x7F;

    pub fn pack(len: u32, next_type: u32, same_page: bool, dual: bool, next_index: u32) -> u32 {
        debug_assert!(len <= LEN_MASK);
        let mut w = len | (next_type << TYPE_SHIFT) | (next_index << INDEX_SHIFT);
        if same_page {
            w |= SAME_PAGE_BIT;
        }
        if dual {
            w |= DUAL_BIT;
        }
        w
    }

    /// A freshly taken in-use container: just the head, no next.
    pub fn empty_in_use() -> u32 {
        pack(CON_HEAD_SIZE, NEXT_NONE, false, false, 0)
    }

    pub fn len(w: u32) -> u32 {
        w & LEN_MASK
    }

    pub fn with_len(w: u32, len: u32) -> u32 {
        (w & !LEN_MASK) | len
    }

    pub fn next_type(w: u32) -> u32 {
        (w >> TYPE_SHIFT) & 0x3
    }

    pub fn same_page(w: u32) -> bool {
        w & SAME_PAGE_BIT != 0
    }

    pub fn dual(w: u32) -> bool {
        w & DUAL_BIT != 0
    }

    pub fn with_dual(w: u32, dual: bool) -> u32 {
        if dual {
            w | DUAL_BIT
        } else {
            w & !DUAL_BIT
        }
    }

    pub fn next_index(w: u32) -> u32 {
        (w >> INDEX_SHIFT) & INDEX_MASK
    }

    pub fn with_next(w: u32, next_type: u32, same_page: bool, next_index: u32) -> u32 {
        let mut v = (w & (LEN_MASK | DUAL_BIT)) | (next_type << TYPE_SHIFT);
        v |= next_index << INDEX_SHIFT;
        if same_page {
            v |= SAME_PAGE_BIT;
        }
        v
    }

    pub fn clear_next(w: u32) -> u32 {
        w & (LEN_MASK | DUAL_BIT)
    }
}

/// Fingerprint of one element: physical page, word index of the owning
/// container's head, word index of the element header, and the growth
/// direction of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElemRef {
    pub page: PageId,
    pub con_ptr: u32,
    pub elem_ptr: u32,
    pub forward: bool,
}

/// One position in a container chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConRef {
    pub page: PageId,
    pub idx: u32,
    pub is_left: bool,
}

impl ConRef {
    pub fn head_ptr(&self) -> usize {
        Page8::con_head_ptr(self.idx, self.is_left)
    }

    /// Word index of the element header at slot `n` (0-based).
    pub fn elem_ptr(&self, n: u32, elem_len: u32) -> u32 {
        let base = Page8::con_base(self.idx) as u32;
        if self.is_left {
            base + CON_HEAD_SIZE + n * elem_len
        } else {
            base + BUF_SIZE - CON_HEAD_SIZE - 1 - n * elem_len
        }
    }
}

pub(crate) struct WalkedElem {
    pub elem: ElemRef,
    pub header: u32,
    pub local_key: [u32; 2],
}

impl HashStore {
    // ------------------------------------------------------------------
    // chain navigation
    // ------------------------------------------------------------------

    pub(crate) fn bucket_head_container(
        &self,
        frag: FragId,
        bucket: u32,
    ) -> Result<ConRef, SmallError> {
        let f = self.fragments.get(frag);
        let (logical, slot) = f.bucket_position(bucket);
        let page = self.frag_page(frag, DirKind::Normal, logical)?;
        Ok(ConRef {
            page,
            idx: slot,
            is_left: true,
        })
    }

    pub(crate) fn next_container(
        &self,
        frag: FragId,
        at: ConRef,
    ) -> Result<Option<ConRef>, SmallError> {
        let page = self.pages.get(at.page);
        let w = page.get(at.head_ptr());
        let ty = head::next_type(w);
        if ty == head::NEXT_NONE {
            return Ok(None);
        }
        let idx = head::next_index(w);
        let is_left = ty == head::NEXT_LEFT;
        let next_page = if head::same_page(w) {
            at.page
        } else {
            let logical = page.get(at.head_ptr() + 1);
            self.frag_page(frag, DirKind::Overflow, logical)?
        };
        Ok(Some(ConRef {
            page: next_page,
            idx,
            is_left,
        }))
    }

    /// All containers of a bucket's chain, head first.
    pub(crate) fn chain_of(&self, frag: FragId, bucket: u32) -> Result<Vec<ConRef>, SmallError> {
        let mut out = Vec::new();
        let mut cur = self.bucket_head_container(frag, bucket)?;
        loop {
            out.push(cur);
            match self.next_container(frag, cur)? {
                Some(next) => cur = next,
                None => return Ok(out),
            }
        }
    }

    /// Containers per page held by a bucket's chain, excluding the bucket
    /// head itself (integrity accounting).
    pub(crate) fn bucket_chain_container_counts(
        &self,
        frag: FragId,
        bucket: u32,
    ) -> Vec<(PageId, u32)> {
        let mut out: Vec<(PageId, u32)> = Vec::new();
        if let Ok(chain) = self.chain_of(frag, bucket) {
            for c in chain.iter().skip(1) {
                match out.iter_mut().find(|(p, _)| *p == c.page) {
                    Some((_, n)) => *n += 1,
                    None => out.push((c.page, 1)),
                }
            }
        }
        out
    }

    /// Every in-use container of a page, free lists and absorbed halves
    /// resolved. Used by the adaptive-hash page build.
    pub(crate) fn page_containers(&self, page_id: PageId) -> Vec<ConRef> {
        let page = self.pages.get(page_id);
        let mut out = Vec::new();
        for idx in 0..NO_CONTAINERS {
            let left_free = page.is_on_empty_list(true, idx);
            let right_free = page.is_on_empty_list(false, idx);
            let left_dual =
                !left_free && head::dual(page.get(Page8::con_head_ptr(idx, true)));
            let right_dual =
                !right_free && head::dual(page.get(Page8::con_head_ptr(idx, false)));
            if !left_free && !right_dual {
                out.push(ConRef {
                    page: page_id,
                    idx,
                    is_left: true,
                });
            }
            if !right_free && !left_dual {
                out.push(ConRef {
                    page: page_id,
                    idx,
                    is_left: false,
                });
            }
        }
        out
    }

    fn elems_in(&self, con: ConRef, elem_len: u32) -> u32 {
        let w = self.pages.get(con.page).get(con.head_ptr());
        (head::len(w) - CON_HEAD_SIZE) / elem_len
    }

    /// Every element of a bucket, chain order.
    pub(crate) fn walk_bucket(&self, frag: FragId, bucket: u32) -> Vec<WalkedElem> {
        let elem_len = self.fragments.get(frag).element_length;
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        let mut out = Vec::new();
        let chain = match self.chain_of(frag, bucket) {
            Ok(c) => c,
            Err(_) => return out,
        };
        for con in chain {
            let page = self.pages.get(con.page);
            for n in 0..self.elems_in(con, elem_len) {
                let elem_ptr = con.elem_ptr(n, elem_len);
                let header = page.get(elem_ptr as usize);
                let mut local_key = [0u32; 2];
                for i in 0..lk_len {
                    local_key[i] = self.elem_local_key_word(con.page, elem_ptr, con.is_left, i);
                }
                out.push(WalkedElem {
                    elem: ElemRef {
                        page: con.page,
                        con_ptr: con.head_ptr() as u32,
                        elem_ptr,
                        forward: con.is_left,
                    },
                    header,
                    local_key,
                });
            }
        }
        out
    }

    pub(crate) fn elem_local_key_word(
        &self,
        page: PageId,
        elem_ptr: u32,
        forward: bool,
        i: usize,
    ) -> u32 {
        let p = self.pages.get(page);
        if forward {
            p.get(elem_ptr as usize + 1 + i)
        } else {
            p.get(elem_ptr as usize - 1 - i)
        }
    }

    pub(crate) fn set_elem_local_key(
        &mut self,
        page: PageId,
        elem_ptr: u32,
        forward: bool,
        local_key: &[u32],
    ) {
        let p = self.pages.get_mut(page);
        for (i, &w) in local_key.iter().enumerate() {
            if forward {
                p.set(elem_ptr as usize + 1 + i, w);
            } else {
                p.set(elem_ptr as usize - 1 - i, w);
            }
        }
    }

    pub(crate) fn elem_header(&self, elem: ElemRef) -> u32 {
        self.pages.get(elem.page).get(elem.elem_ptr as usize)
    }

    pub(crate) fn set_elem_header(&mut self, elem: ElemRef, header: u32) {
        self.lcp_undo_write(elem.page);
        self.pages.get_mut(elem.page).set(elem.elem_ptr as usize, header);
    }

    // ------------------------------------------------------------------
    // search
    // ------------------------------------------------------------------

    /// Walk the bucket chain for a key. Matches first on the 16-bit hash
    /// remainder (recovered through the operation record when the element
    /// is locked), then on the full key read back from the tuple store.
    pub(crate) fn get_element(
        &self,
        frag: FragId,
        bucket: u32,
        key: &[u32],
        hash_part: u32,
    ) -> Result<Option<ElemRef>, SmallError> {
        let f = self.fragments.get(frag);
        let lk_len = f.local_key_len as usize;
        let (table_id, fid) = (f.my_table_id, f.my_fid);
        for walked in self.walk_bucket(frag, bucket) {
            let part = if element::is_locked(walked.header) {
                self.ops.get(element::op_of(walked.header)).hash_part
            } else {
                element::hash_value_part(walked.header)
            };
            if part != hash_part {
                continue;
            }
            let local_key = self.unpack_local_key(frag, &walked.local_key);
            let mut buf = [0u32; 8];
            let n = self
                .tuple_store
                .read_pk(table_id, fid, local_key, &mut buf)?;
            if &buf[..n] == key {
                return Ok(Some(walked.elem));
            }
            let _ = lk_len;
        }
        Ok(None)
    }

    /// Locate an element by its local key; undo replay resolves op-undo
    /// records this way because the tuple slot may already be gone.
    pub(crate) fn get_element_by_local_key(
        &self,
        frag: FragId,
        bucket: u32,
        local_key: &[u32; 2],
    ) -> Option<ElemRef> {
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        self.walk_bucket(frag, bucket)
            .into_iter()
            .find(|w| w.local_key[..lk_len] == local_key[..lk_len])
            .map(|w| w.elem)
    }

    pub(crate) fn unpack_local_key(&self, frag: FragId, words: &[u32; 2]) -> crate::types::LocalKey {
        if self.fragments.get(frag).local_key_len == 1 {
            crate::types::LocalKey::unpack(words[0])
        } else {
            crate::types::LocalKey::new(words[0], words[1])
        }
    }

    pub(crate) fn pack_local_key(&self, frag: FragId, lk: crate::types::LocalKey) -> [u32; 2] {
        if self.fragments.get(frag).local_key_len == 1 {
            [lk.pack(), 0]
        } else {
            [lk.page_no, lk.page_idx]
        }
    }

    // ------------------------------------------------------------------
    // insertion
    // ------------------------------------------------------------------

    /// Insert an element into a bucket's chain, growing the chain with a
    /// free same-page container or an overflow container when every
    /// reachable container is full.
    pub(crate) fn insert_element(
        &mut self,
        frag: FragId,
        bucket: u32,
        header: u32,
        local_key: &[u32],
    ) -> Result<ElemRef, SmallError> {
        let elem_len = self.fragments.get(frag).element_length;
        let chain = self.chain_of(frag, bucket)?;
        for &con in chain.iter() {
            if self.make_room(con, elem_len)? {
                return Ok(self.append_elem(con, elem_len, header, local_key));
            }
        }
        // every reachable container is full: grow the chain
        let tail = *chain.last().unwrap();
        let next = self.alloc_chain_container(frag, tail.page)?;
        self.splice_chain(frag, tail, next)?;
        debug!(
            "bucket {} chain grown, page: {}, container: {} ({})",
            bucket,
            next.page,
            next.idx,
            if next.is_left { "left" } else { "right" }
        );
        if !self.make_room(next, elem_len)? {
            return Err(SmallError::of(
                ErrorKind::PageSizeExceeded,
                "element does not fit an empty container",
            ));
        }
        Ok(self.append_elem(next, elem_len, header, local_key))
    }

    /// True when the element fits, taking ownership of the slot's other
    /// half when growth crosses the limit and the other half is free.
    fn make_room(&mut self, con: ConRef, elem_len: u32) -> Result<bool, SmallError> {
        let hp = con.head_ptr();
        let w = self.pages.get(con.page).get(hp);
        let len = head::len(w);
        let new_len = len + elem_len;
        if head::dual(w) {
            return Ok(new_len <= BUF_SIZE);
        }
        let other_free = self
            .pages
            .get(con.page)
            .is_on_empty_list(!con.is_left, con.idx);
        if other_free {
            if new_len <= UP_LIMIT {
                return Ok(true);
            }
            if new_len > BUF_SIZE {
                return Ok(false);
            }
            // absorb the other half
            self.lcp_undo_write(con.page);
            let page = self.pages.get_mut(con.page);
            page.unlink_empty(!con.is_left, con.idx);
            let w = page.get(hp);
            page.set(hp, head::with_dual(w, true));
            return Ok(true);
        }
        let other_hp = Page8::con_head_ptr(con.idx, !con.is_left);
        let other_len = head::len(self.pages.get(con.page).get(other_hp));
        Ok(new_len <= BUF_SIZE - other_len)
    }

    fn append_elem(
        &mut self,
        con: ConRef,
        elem_len: u32,
        header: u32,
        local_key: &[u32],
    ) -> ElemRef {
        let hp = con.head_ptr();
        let w = self.pages.get(con.page).get(hp);
        let len = head::len(w);
        let n = (len - CON_HEAD_SIZE) / elem_len;
        let elem_ptr = con.elem_ptr(n, elem_len);

        self.lcp_undo_write(con.page);

        let elem = ElemRef {
            page: con.page,
            con_ptr: hp as u32,
            elem_ptr,
            forward: con.is_left,
        };
        let page = self.pages.get_mut(con.page);
        page.set(elem_ptr as usize, header);
        page.set(hp, head::with_len(w, len + elem_len));
        page.add_elem_count(1);
        self.set_elem_local_key(con.page, elem_ptr, con.is_left, local_key);
        elem
    }

    /// Take a free container for a chain, preferring the page the chain
    /// tail sits on, then an overflow page with room, then a fresh
    /// overflow page.
    fn alloc_chain_container(
        &mut self,
        frag: FragId,
        tail_page: PageId,
    ) -> Result<ConRef, SmallError> {
        if self.pages.get(tail_page).has_free_container() {
            return Ok(self.take_page_container(frag, tail_page));
        }
        let page = self.overflow_page_with_room(frag)?;
        Ok(self.take_page_container(frag, page))
    }

    fn take_page_container(&mut self, frag: FragId, page_id: PageId) -> ConRef {
        self.lcp_undo_write(page_id);
        let page = self.pages.get_mut(page_id);
        let (idx, is_left) = match page.pop_empty(false) {
            Some(i) => (i, false),
            None => (page.pop_empty(true).expect("no free container"), true),
        };
        self.lcp_undo_write(page_id);
        let page = self.pages.get_mut(page_id);
        let hp = Page8::con_head_ptr(idx, is_left);
        page.set(hp, head::empty_in_use());
        page.set(hp + 1, NIL);
        page.add_alloc_containers(1);
        let con = ConRef {
            page: page_id,
            idx,
            is_left,
        };
        self.after_container_taken(frag, page_id);
        con
    }

    /// An overflow page with at least one free container, allocating a new
    /// one when none has room.
    fn overflow_page_with_room(&mut self, frag: FragId) -> Result<PageId, SmallError> {
        let rec = self.fragments.get(frag).first_overflow_rec;
        if rec != NIL {
            let page = self.overflow_recs.get(rec).page;
            return Ok(page);
        }
        self.alloc_overflow_page(frag)
    }

    pub(crate) fn alloc_overflow_page(&mut self, frag: FragId) -> Result<PageId, SmallError> {
        // reuse a released directory index when one is waiting
        let reuse = self.fragments.get(frag).first_free_dir_index_rec;
        let (rec, dir_index) = if reuse != NIL {
            self.unlink_overflow_rec(frag, reuse);
            (reuse, self.overflow_recs.get(reuse).dir_index)
        } else {
            let rec = self.overflow_recs.seize()?;
            let dir_index = self.fragments.get(frag).last_over_index;
            if dir_index as usize >= DIR_FANOUT * DIR_FANOUT {
                self.overflow_recs.release(rec);
                return Err(SmallError::of(
                    ErrorKind::DirSizeExceeded,
                    "overflow directory full",
                ));
            }
            self.fragments.get_mut(frag).last_over_index += 1;
            (rec, dir_index)
        };
        let page = match self.pages.seize() {
            Ok(p) => p,
            Err(e) => {
                // keep the record on the free-dir-index list for later
                self.overflow_recs.get_mut(rec).dir_index = dir_index;
                self.link_overflow_rec(frag, rec, OverList::FreeDirIndex);
                return Err(e);
            }
        };
        self.pages.get_mut(page).init_overflow(dir_index, rec, frag);
        self.set_frag_page(frag, DirKind::Overflow, dir_index, page)?;
        {
            let r = self.overflow_recs.get_mut(rec);
            r.dir_index = dir_index;
            r.page = page;
        }
        self.link_overflow_rec(frag, rec, OverList::WithFree);
        debug!("overflow page allocated, logical: {}, page: {}", dir_index, page);
        Ok(page)
    }

    /// After a container was taken: a now-full overflow page leaves the
    /// with-free list.
    fn after_container_taken(&mut self, frag: FragId, page_id: PageId) {
        let page = self.pages.get(page_id);
        if page.page_type() != OVERFLOW_PAGE_TYPE {
            return;
        }
        if !page.has_free_container() {
            let rec = page.overflow_rec();
            if rec != NIL && self.overflow_recs.get(rec).list == OverList::WithFree {
                self.unlink_overflow_rec(frag, rec);
                self.overflow_recs.get_mut(rec).list = OverList::None;
            }
        }
    }

    /// After a container was freed: the page is back in business, or
    /// entirely empty and releasable.
    fn after_container_freed(&mut self, frag: FragId, page_id: PageId) {
        let page = self.pages.get(page_id);
        if page.page_type() != OVERFLOW_PAGE_TYPE {
            return;
        }
        let rec = page.overflow_rec();
        let logical = page.logical_id();
        if page.alloc_containers() == 0 {
            // Inside a checkpoint window the page must survive until the
            // copy passes it; it also stays on the with-free list.
            let f = self.fragments.get(frag);
            if f.create_lcp && logical < f.lcp_max_over_dir_index {
                if self.overflow_recs.get(rec).list == OverList::None {
                    self.link_overflow_rec(frag, rec, OverList::WithFree);
                }
                self.fragments.get_mut(frag).deferred_page_release.push(logical);
                return;
            }
            self.release_overflow_page(frag, logical);
            return;
        }
        if self.overflow_recs.get(rec).list == OverList::None {
            self.link_overflow_rec(frag, rec, OverList::WithFree);
        }
    }

    /// Release an empty overflow page and retire or recycle its directory
    /// index.
    pub(crate) fn release_overflow_page(&mut self, frag: FragId, logical: LogicalPageId) {
        let page = match self.try_frag_page(frag, DirKind::Overflow, logical) {
            Some(p) => p,
            None => return,
        };
        let rec = self.pages.get(page).overflow_rec();
        if self.overflow_recs.get(rec).list != OverList::None {
            self.unlink_overflow_rec(frag, rec);
        }
        self.clear_frag_page(frag, DirKind::Overflow, logical);
        self.drop_page_hash_when_freed(page);
        self.pages.release(page);
        self.overflow_recs.get_mut(rec).page = NIL;

        if logical + 1 == self.fragments.get(frag).last_over_index {
            self.fragments.get_mut(frag).last_over_index = logical;
            self.overflow_recs.release(rec);
            self.sweep_free_dir_tail(frag);
        } else {
            self.overflow_recs.get_mut(rec).dir_index = logical;
            self.link_overflow_rec(frag, rec, OverList::FreeDirIndex);
        }
        debug!("overflow page released, logical: {}", logical);
    }

    /// Shrinking the overflow tail releases free-dir-index records whose
    /// index fell off the end, possibly cascading further.
    fn sweep_free_dir_tail(&mut self, frag: FragId) {
        loop {
            let tail = self.fragments.get(frag).last_over_index;
            if tail == 0 {
                return;
            }
            let mut found = NIL;
            let mut rec = self.fragments.get(frag).first_free_dir_index_rec;
            while rec != NIL {
                if self.overflow_recs.get(rec).dir_index == tail - 1 {
                    found = rec;
                    break;
                }
                rec = self.overflow_recs.get(rec).next;
            }
            if found == NIL {
                return;
            }
            self.unlink_overflow_rec(frag, found);
            self.overflow_recs.release(found);
            self.fragments.get_mut(frag).last_over_index = tail - 1;
        }
    }

    pub(crate) fn link_overflow_rec(&mut self, frag: FragId, rec: u32, list: OverList) {
        let (head_field, tail_field) = match list {
            OverList::WithFree => {
                let f = self.fragments.get(frag);
                (f.first_overflow_rec, f.last_overflow_rec)
            }
            OverList::FreeDirIndex => (self.fragments.get(frag).first_free_dir_index_rec, NIL),
            OverList::None => unreachable!(),
        };
        {
            let r = self.overflow_recs.get_mut(rec);
            r.list = list;
            r.prev = NIL;
            r.next = head_field;
        }
        if head_field != NIL {
            self.overflow_recs.get_mut(head_field).prev = rec;
        }
        let f = self.fragments.get_mut(frag);
        match list {
            OverList::WithFree => {
                f.first_overflow_rec = rec;
                if tail_field == NIL {
                    f.last_overflow_rec = rec;
                }
            }
            OverList::FreeDirIndex => f.first_free_dir_index_rec = rec,
            OverList::None => unreachable!(),
        }
    }

    pub(crate) fn unlink_overflow_rec(&mut self, frag: FragId, rec: u32) {
        let (list, next, prev) = {
            let r = self.overflow_recs.get(rec);
            (r.list, r.next, r.prev)
        };
        if prev != NIL {
            self.overflow_recs.get_mut(prev).next = next;
        }
        if next != NIL {
            self.overflow_recs.get_mut(next).prev = prev;
        }
        let f = self.fragments.get_mut(frag);
        match list {
            OverList::WithFree => {
                if f.first_overflow_rec == rec {
                    f.first_overflow_rec = next;
                }
                if f.last_overflow_rec == rec {
                    f.last_overflow_rec = prev;
                }
            }
            OverList::FreeDirIndex => {
                if f.first_free_dir_index_rec == rec {
                    f.first_free_dir_index_rec = next;
                }
            }
            OverList::None => {}
        }
        let r = self.overflow_recs.get_mut(rec);
        r.list = OverList::None;
        r.next = NIL;
        r.prev = NIL;
    }

    fn splice_chain(&mut self, frag: FragId, tail: ConRef, next: ConRef) -> Result<(), SmallError> {
        let hp = tail.head_ptr();
        self.lcp_undo_write(tail.page);
        let next_type = if next.is_left {
            head::NEXT_LEFT
        } else {
            head::NEXT_RIGHT
        };
        let same_page = next.page == tail.page;
        let next_logical = self.pages.get(next.page).logical_id();
        let page = self.pages.get_mut(tail.page);
        let w = page.get(hp);
        page.set(hp, head::with_next(w, next_type, same_page, next.idx));
        if !same_page {
            page.set(hp + 1, next_logical);
        }
        let _ = frag;
        Ok(())
    }

    // ------------------------------------------------------------------
    // deletion
    // ------------------------------------------------------------------

    /// Delete an element: the chain's last element replaces it, the tail
    /// container shrinks, and an emptied tail container is unlinked and
    /// freed.
    pub(crate) fn delete_element(
        &mut self,
        frag: FragId,
        bucket: u32,
        elem: ElemRef,
    ) -> Result<(), SmallError> {
        let elem_len = self.fragments.get(frag).element_length;
        let chain = self.chain_of(frag, bucket)?;
        let tail = *chain.last().unwrap();
        let hp = tail.head_ptr();
        let w = self.pages.get(tail.page).get(hp);
        let len = head::len(w);
        debug_assert!(len > CON_HEAD_SIZE, "delete from empty chain");
        let last_n = (len - CON_HEAD_SIZE) / elem_len - 1;
        let last_ptr = tail.elem_ptr(last_n, elem_len);
        let last = ElemRef {
            page: tail.page,
            con_ptr: hp as u32,
            elem_ptr: last_ptr,
            forward: tail.is_left,
        };

        if last != elem {
            self.move_elem_words(frag, last, elem);
        }

        // shrink the tail
        self.lcp_undo_write(tail.page);
        {
            let page = self.pages.get_mut(tail.page);
            let w = page.get(hp);
            page.set(hp, head::with_len(w, len - elem_len));
            page.add_elem_count(-1);
        }

        let new_len = len - elem_len;
        let w = self.pages.get(tail.page).get(hp);
        if head::dual(w) && new_len < DOWN_LIMIT {
            // give the other half back to its free list
            self.lcp_undo_write(tail.page);
            let page = self.pages.get_mut(tail.page);
            page.set(hp, head::with_dual(w, false));
            page.push_empty(!tail.is_left, tail.idx);
        }

        if new_len == CON_HEAD_SIZE && chain.len() > 1 {
            self.free_tail_container(frag, &chain)?;
        }
        Ok(())
    }

    /// Copy the element at `from` over the element at `to`, fixing the
    /// lock-queue fingerprints and dropping stale adaptive-hash guesses.
    fn move_elem_words(&mut self, frag: FragId, from: ElemRef, to: ElemRef) {
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        let header = self.elem_header(from);
        let mut lk = [0u32; 2];
        for i in 0..lk_len {
            lk[i] = self.elem_local_key_word(from.page, from.elem_ptr, from.forward, i);
        }
        self.lcp_undo_write(to.page);
        self.set_elem_header(to, header);
        self.set_elem_local_key(to.page, to.elem_ptr, to.forward, &lk[..lk_len]);

        if element::is_locked(header) && !self.in_recovery {
            let op = element::op_of(header);
            let rec = self.ops.get_mut(op);
            rec.elem_page = to.page;
            rec.elem_ptr = to.elem_ptr;
            rec.elem_container = to.con_ptr;
            rec.elem_forward = to.forward;
        }
        if !self.in_recovery {
            crate::database::Database::mut_search_sys().drop_element(from.page, from.elem_ptr);
            crate::database::Database::mut_search_sys().drop_element(to.page, to.elem_ptr);
        }
    }

    /// Unlink and free the (now empty) last container of a chain.
    fn free_tail_container(&mut self, frag: FragId, chain: &[ConRef]) -> Result<(), SmallError> {
        let tail = *chain.last().unwrap();
        let prev = chain[chain.len() - 2];

        let php = prev.head_ptr();
        self.lcp_undo_write(prev.page);
        {
            let page = self.pages.get_mut(prev.page);
            let w = page.get(php);
            page.set(php, head::clear_next(w));
        }

        let hp = tail.head_ptr();
        let w = self.pages.get(tail.page).get(hp);
        self.lcp_undo_write(tail.page);
        if head::dual(w) {
            // absorbed space travels back with the container
            let page = self.pages.get_mut(tail.page);
            page.push_empty(!tail.is_left, tail.idx);
        }
        let page = self.pages.get_mut(tail.page);
        page.push_empty(tail.is_left, tail.idx);
        page.add_alloc_containers(-1);
        self.after_container_freed(frag, tail.page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::head;
    use crate::consts::CON_HEAD_SIZE;

    #[test]
    fn test_head_codec_round_trip() {
        let w = head::pack(17, head::NEXT_RIGHT, true, false, 42);
        assert_eq!(head::len(w), 17);
        assert_eq!(head::next_type(w), head::NEXT_RIGHT);
        assert!(head::same_page(w));
        assert!(!head::dual(w));
        assert_eq!(head::next_index(w), 42);

        let w = head::with_dual(w, true);
        assert!(head::dual(w));
        let w = head::clear_next(w);
        assert_eq!(head::next_type(w), head::NEXT_NONE);
        assert!(head::dual(w));
        assert_eq!(head::len(w), 17);
    }

    #[test]
    fn test_empty_in_use() {
        let w = head::empty_in_use();
        assert_eq!(head::len(w), CON_HEAD_SIZE);
        assert_eq!(head::next_type(w), head::NEXT_NONE);
    }
}
