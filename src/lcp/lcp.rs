use log::{debug, info};

use crate::{
    consts::*,
    error::{ErrorKind, SmallError},
    frag::{FragState, RootState},
    io::SmallFile,
    lcp::file_queue::IoJob,
    page::{element, DirKind},
    store::{HashStore, StoreEvent, Work},
    types::{FragId, PageId, RootFragId, NIL},
};

// Zero-page word positions; the data file's page 0 describes the
// fragment the rest of the file belongs to.
pub const ZP_PREV_UNDOP: usize = 8;
pub const ZP_NO_OVER_PAGE: usize = 9;
pub const ZP_TABID: usize = 10;
pub const ZP_FRAGID0: usize = 11;
pub const ZP_FRAGID1: usize = 12;
pub const ZP_DIRSIZE: usize = 14;
pub const ZP_EXPCOUNTER: usize = 15;
pub const ZP_NEXT_UNDO_FILE: usize = 16;
pub const ZP_SLACK: usize = 17;
pub const ZP_NO_PAGES: usize = 18;
pub const ZP_HASHCHECKBIT: usize = 19;
pub const ZP_K: usize = 20;
pub const ZP_LHFRAGBITS: usize = 21;
pub const ZP_LHDIRBITS: usize = 22;
pub const ZP_LOCALKEYLEN: usize = 23;
pub const ZP_MAXP: usize = 24;
pub const ZP_MAXLOADFACTOR: usize = 25;
pub const ZP_MINLOADFACTOR: usize = 26;
pub const ZP_MYFID: usize = 27;
pub const ZP_LAST_OVER_INDEX: usize = 28;
pub const ZP_P: usize = 29;
pub const ZP_NO_OF_ELEMENTS: usize = 30;
pub const ZP_ELEMENT_LENGTH: usize = 31;
pub const ZP_KEY_LENGTH: usize = 32;
pub const ZP_NODETYPE: usize = 33;
pub const ZP_SLACK_CHECK: usize = 34;
pub const ZP_COMMIT_COUNT_LO: usize = 35;
pub const ZP_COMMIT_COUNT_HI: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcpState {
    Free,
    HoldOps,
    CopyPages,
    SyncUndo,
}

impl Default for LcpState {
    fn default() -> Self {
        LcpState::Free
    }
}

/// One local checkpoint in flight on a root fragment.
pub struct LcpConn {
    pub root: RootFragId,
    pub lcp_id: u32,
    pub state: LcpState,
    pub active_frag: usize,
    pub hold_next_op: u32,
}

impl Default for LcpConn {
    fn default() -> Self {
        Self {
            root: NIL,
            lcp_id: 0,
            state: LcpState::Free,
            active_frag: 0,
            hold_next_op: NIL,
        }
    }
}

impl HashStore {
    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    /// Begin a local checkpoint of one root fragment. The work proceeds
    /// through `run_pending`/`pump_io`; `LcpDone` is emitted at the end.
    pub fn lcp_start(&mut self, root: RootFragId, lcp_id: u32) -> Result<(), SmallError> {
        if self.roots.get(root).lcp_conn != NIL {
            return Err(SmallError::of(
                ErrorKind::TooEarlyAccess,
                "checkpoint already running on fragment",
            ));
        }
        let conn = self.lcp_conns.seize()?;
        self.open_undo_group(lcp_id)?;

        let frags = self.roots.get(root).frags;
        for &frag in frags.iter() {
            if let Err(e) = self.lcp_open_fragment(frag, lcp_id) {
                self.lcp_conns.release(conn);
                return Err(e);
            }
        }
        {
            let c = self.lcp_conns.get_mut(conn);
            c.root = root;
            c.lcp_id = lcp_id;
            c.state = LcpState::HoldOps;
            c.active_frag = 0;
        }
        self.lcp_conns.get_mut(conn).hold_next_op =
            self.fragments.get(frags[0]).lock_owners_list;
        self.roots.get_mut(root).lcp_conn = conn;
        self.roots.get_mut(root).state = RootState::LcpCreation;
        self.push_work(Work::LcpHoldOps { conn });
        info!("checkpoint {} started on root {}", lcp_id, root);
        Ok(())
    }

    fn lcp_open_fragment(&mut self, frag: FragId, lcp_id: u32) -> Result<(), SmallError> {
        let (table_id, fid) = {
            let f = self.fragments.get(frag);
            (f.my_table_id, f.my_fid)
        };
        let path = self
            .config
            .root_dir
            .join("D3")
            .join("HASH")
            .join(format!("T{}", table_id))
            .join(format!("F{}", fid))
            .join(format!("S{}.DATA", lcp_id));
        let file = SmallFile::open(path)?;

        let zero_page = self.pages.seize_lcp()?;
        let mut copy_pages = [NIL; LCP_COPY_PAGES];
        for slot in copy_pages.iter_mut() {
            *slot = self.pages.seize_lcp()?;
        }
        let f = self.fragments.get_mut(frag);
        f.data_file = Some(file);
        f.zero_page = zero_page;
        f.copy_pages = copy_pages;
        f.create_lcp = true;
        f.local_checkp_id = lcp_id;
        f.lcp_max_dir_index = f.dir_size;
        f.lcp_max_over_dir_index = f.last_over_index;
        f.lcp_dir_index = 0;
        f.next_alloc_page = 0;
        f.active_data_file_page = 1;
        f.no_stored_pages = 0;
        f.no_of_stored_over_pages = 0;
        f.prev_undo_position = NIL;
        // operations queue up while the lock owners are being described
        f.stop_que_op = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // hold ops: an op-undo record per lock owner, in bounded batches
    // ------------------------------------------------------------------

    pub(crate) fn lcp_hold_ops_step(&mut self, conn: u32) {
        let (root, active_frag, mut op) = {
            let c = self.lcp_conns.get(conn);
            (c.root, c.active_frag, c.hold_next_op)
        };
        let frags = self.roots.get(root).frags;
        let mut n = 0;
        while op != NIL && n < LCP_HOLD_OP_BATCH {
            self.lcp_write_op_undo(op);
            op = self.ops.get(op).next_lock_owner;
            n += 1;
        }
        if op != NIL {
            self.lcp_conns.get_mut(conn).hold_next_op = op;
            self.push_work(Work::LcpHoldOps { conn });
            return;
        }
        if active_frag == 0 {
            let c = self.lcp_conns.get_mut(conn);
            c.active_frag = 1;
            c.hold_next_op = NIL;
            self.lcp_conns.get_mut(conn).hold_next_op =
                self.fragments.get(frags[1]).lock_owners_list;
            self.push_work(Work::LcpHoldOps { conn });
            return;
        }

        // all lock owners described: reopen the queues and start copying
        for &frag in frags.iter() {
            self.fragments.get_mut(frag).stop_que_op = false;
            if self.fragments.get(frag).first_wait_in_que_op != NIL {
                self.push_work(Work::DrainWaitQueue(frag));
            }
        }
        {
            let c = self.lcp_conns.get_mut(conn);
            c.state = LcpState::CopyPages;
            c.active_frag = 0;
        }
        self.fragments.get_mut(frags[0]).frag_state = FragState::LcpSendPages;
        self.push_work(Work::LcpCopyNext { frag: frags[0] });
    }

    // ------------------------------------------------------------------
    // copy pages in groups of eight
    // ------------------------------------------------------------------

    pub(crate) fn lcp_copy_step(&mut self, frag: FragId) {
        match self.fragments.get(frag).frag_state {
            FragState::LcpSendPages => self.lcp_send_pages(frag),
            FragState::LcpSendOverPages => self.lcp_send_over_pages(frag),
            _ => {}
        }
    }

    fn lcp_send_pages(&mut self, frag: FragId) {
        let (start, limit) = {
            let f = self.fragments.get(frag);
            (f.lcp_dir_index, f.lcp_max_dir_index.min(f.dir_size))
        };
        if start >= limit {
            let f = self.fragments.get_mut(frag);
            f.frag_state = FragState::LcpSendOverPages;
            f.next_alloc_page = 0;
            self.push_work(Work::LcpCopyNext { frag });
            return;
        }
        let budget = self.config.lcp_disc_pages_acc.max(1);
        let count = (limit - start).min(WRITE_PAGE_SIZE).min(budget);
        for i in 0..count {
            let src = match self.try_frag_page(frag, DirKind::Normal, start + i) {
                Some(p) => p,
                None => continue,
            };
            let dst = self.fragments.get(frag).copy_pages[i as usize];
            self.lcp_copy_page(src, dst);
        }
        let file_page = self.fragments.get(frag).active_data_file_page;
        self.io.push(IoJob::WriteDataPages {
            frag,
            file_page,
            count,
        });
    }

    fn lcp_send_over_pages(&mut self, frag: FragId) {
        // collect up to eight existing overflow pages from the cursor
        let limit = self.fragments.get(frag).lcp_max_over_dir_index;
        let budget = self.config.lcp_disc_pages_acc.max(1).min(WRITE_PAGE_SIZE);
        let mut srcs = Vec::new();
        let mut cursor = self.fragments.get(frag).next_alloc_page;
        while cursor < limit && (srcs.len() as u32) < budget {
            if let Some(p) = self.try_frag_page(frag, DirKind::Overflow, cursor) {
                srcs.push(p);
            }
            cursor += 1;
        }
        self.fragments.get_mut(frag).next_alloc_page = cursor;
        if srcs.is_empty() {
            self.fragments.get_mut(frag).frag_state = FragState::LcpSendZeroPage;
            self.io.push(IoJob::WriteZeroPage { frag });
            return;
        }
        let count = srcs.len() as u32;
        for (i, &src) in srcs.iter().enumerate() {
            let dst = self.fragments.get(frag).copy_pages[i];
            self.lcp_copy_page(src, dst);
        }
        let file_page = self.fragments.get(frag).active_data_file_page;
        self.fragments.get_mut(frag).no_of_stored_over_pages += count;
        self.io.push(IoJob::WriteDataPages {
            frag,
            file_page,
            count,
        });
    }

    /// Copy a page, replacing every locked element header with its
    /// unlocked form so the on-disk image carries no lock state. The
    /// incremental checksum keeps the copy self-consistent.
    fn lcp_copy_page(&mut self, src: PageId, dst: PageId) {
        let words = self.pages.get(src).word;
        self.pages.get_mut(dst).word = words;

        let elem_len = {
            let frag = self.pages.get(src).frag_rec();
            self.fragments.get(frag).element_length
        };
        let cons = self.page_containers(src);
        for con in cons {
            let n = {
                let w = self.pages.get(src).get(con.head_ptr());
                (crate::page::container::head::len(w) - CON_HEAD_SIZE) / elem_len
            };
            for i in 0..n {
                let ptr = con.elem_ptr(i, elem_len) as usize;
                let header = self.pages.get(src).get(ptr);
                if element::is_locked(header) {
                    let op = element::op_of(header);
                    let (part, bits) = {
                        let rec = self.ops.get(op);
                        (rec.hash_part, rec.scan_bits)
                    };
                    self.pages
                        .get_mut(dst)
                        .set(ptr, element::unlocked(part, bits));
                }
            }
        }
    }

    pub(crate) fn lcp_write_zero_page(&mut self, frag: FragId) {
        let zero = self.fragments.get(frag).zero_page;
        let (root, commit_count) = {
            let f = self.fragments.get(frag);
            let r = self.roots.get(f.my_root);
            (f.my_root, r.commit_count)
        };
        let no_of_elements = self.roots.get(root).no_of_elements;
        {
            let f = self.fragments.get(frag);
            let vals: Vec<(usize, u32)> = vec![
                (ZP_PREV_UNDOP, f.prev_undo_position),
                (ZP_NO_OVER_PAGE, f.no_of_stored_over_pages),
                (ZP_TABID, f.my_table_id),
                (ZP_FRAGID0, self.roots.get(root).frag_ids[0]),
                (ZP_FRAGID1, self.roots.get(root).frag_ids[1]),
                (ZP_DIRSIZE, f.dir_size),
                (ZP_EXPCOUNTER, f.expand_counter),
                (ZP_NEXT_UNDO_FILE, self.undo.file_version),
                (ZP_SLACK, f.slack as u32),
                (ZP_NO_PAGES, f.no_stored_pages),
                (ZP_HASHCHECKBIT, f.hash_check_bit),
                (ZP_K, f.k_bits),
                (ZP_LHFRAGBITS, f.lh_frag_bits),
                (ZP_LHDIRBITS, f.lh_dir_bits),
                (ZP_LOCALKEYLEN, f.local_key_len),
                (ZP_MAXP, f.maxp),
                (ZP_MAXLOADFACTOR, f.max_load_factor),
                (ZP_MINLOADFACTOR, f.min_load_factor),
                (ZP_MYFID, f.my_fid),
                (ZP_LAST_OVER_INDEX, f.lcp_max_over_dir_index),
                (ZP_P, f.p),
                (ZP_NO_OF_ELEMENTS, no_of_elements as u32),
                (ZP_ELEMENT_LENGTH, f.element_length),
                (ZP_KEY_LENGTH, f.key_length),
                (ZP_NODETYPE, 1),
                (ZP_SLACK_CHECK, f.slack_check as u32),
                (ZP_COMMIT_COUNT_LO, commit_count as u32),
                (ZP_COMMIT_COUNT_HI, (commit_count >> 32) as u32),
            ];
            drop(f);
            let page = self.pages.get_mut(zero);
            page.zero();
            for (pos, v) in vals {
                page.set(pos, v);
            }
        }
        let words = self.pages.get(zero).word;
        if let Some(file) = self.fragments.get_mut(frag).data_file.as_mut() {
            if let Err(e) = file.write_page(0, &words) {
                panic!("zero page write failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // I/O completions
    // ------------------------------------------------------------------

    pub(crate) fn lcp_write_data_pages(&mut self, frag: FragId, file_page: u32, count: u32) {
        for i in 0..count {
            let copy = self.fragments.get(frag).copy_pages[i as usize];
            let words = self.pages.get(copy).word;
            if let Some(file) = self.fragments.get_mut(frag).data_file.as_mut() {
                if let Err(e) = file.write_page(file_page + i, &words) {
                    panic!("data page write failed: {}", e);
                }
            }
        }
    }

    pub(crate) fn lcp_pages_written(&mut self, frag: FragId, count: u32) {
        {
            let f = self.fragments.get_mut(frag);
            f.active_data_file_page += count;
            match f.frag_state {
                FragState::LcpSendPages => {
                    f.lcp_dir_index += count;
                    f.no_stored_pages += count;
                }
                _ => {}
            }
        }
        self.push_work(Work::LcpCopyNext { frag });
    }

    pub(crate) fn lcp_zero_written(&mut self, frag: FragId) {
        self.fragments.get_mut(frag).frag_state = FragState::LcpCloseData;
        self.io.push(IoJob::CloseData { frag });
    }

    pub(crate) fn lcp_data_closed(&mut self, frag: FragId) {
        self.fragments.get_mut(frag).frag_state = FragState::Active;
        let root = self.fragments.get(frag).my_root;
        let conn = self.roots.get(root).lcp_conn;
        let frags = self.roots.get(root).frags;
        if frags[0] == frag {
            self.lcp_conns.get_mut(conn).active_frag = 1;
            self.fragments.get_mut(frags[1]).frag_state = FragState::LcpSendPages;
            self.push_work(Work::LcpCopyNext { frag: frags[1] });
        } else {
            self.lcp_conns.get_mut(conn).state = LcpState::SyncUndo;
            self.undo_sync_enqueue(conn);
        }
    }

    pub(crate) fn lcp_sync_done(&mut self, conn: u32) {
        let root = self.lcp_conns.get(conn).root;
        let lcp_id = self.lcp_conns.get(conn).lcp_id;
        let frags = self.roots.get(root).frags;
        for &frag in frags.iter() {
            // the window is over: release what was held back
            let deferred: Vec<u32> = {
                let f = self.fragments.get_mut(frag);
                f.create_lcp = false;
                std::mem::take(&mut f.deferred_page_release)
            };
            for logical in deferred {
                let still_empty = self
                    .try_frag_page(frag, DirKind::Overflow, logical)
                    .map(|p| self.pages.get(p).alloc_containers() == 0)
                    .unwrap_or(false);
                if still_empty {
                    if let Some(p) = self.try_frag_page(frag, DirKind::Overflow, logical) {
                        self.drop_page_hash_when_freed(p);
                    }
                    self.release_overflow_page(frag, logical);
                }
            }
            let (zero, copies) = {
                let f = self.fragments.get_mut(frag);
                let zero = f.zero_page;
                let copies = f.copy_pages;
                f.zero_page = NIL;
                f.copy_pages = [NIL; LCP_COPY_PAGES];
                (zero, copies)
            };
            if zero != NIL {
                self.pages.release_lcp(zero);
            }
            for c in copies.iter().filter(|&&c| c != NIL) {
                self.pages.release_lcp(*c);
            }
        }
        self.roots.get_mut(root).state = RootState::Active;
        self.roots.get_mut(root).lcp_conn = NIL;
        self.lcp_conns.release(conn);
        self.lcp_dirty.retain(|(f, _)| !frags.contains(f));
        // structural steps held back by the window get another chance
        for &frag in frags.iter() {
            self.check_expand_shrink(frag);
        }
        self.events.push_back(StoreEvent::LcpDone(root));
        info!("checkpoint {} complete on root {}", lcp_id, root);
        debug!(
            "undo log at page {}, offset {}",
            self.undo.cur_page, self.undo.cur_offset
        );
    }

    /// Is a checkpoint currently running on this root fragment?
    pub fn lcp_active(&self, root: RootFragId) -> bool {
        self.roots.get(root).lcp_conn != NIL
    }
}
