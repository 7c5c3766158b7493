use log::{debug, info};

use itertools::Itertools;

use crate::{
    consts::*,
    error::{ErrorKind, SmallError},
    frag::{FragState, OverList, RootState},
    io::SmallFile,
    lcp::lcp::*,
    lcp::undo::{UNDO_OP_INFO, UNDO_OVER_PAGE_INFO, UNDO_PAGE_INFO},
    op::operation::OpKind,
    page::{element, DirKind},
    store::{HashStore, StoreEvent},
    types::{FragId, PageId, RootFragId, NIL},
};

impl HashStore {
    /// Restore one root fragment from its data files at a checkpoint id,
    /// then execute the undo log back to the checkpoint's start. Emits
    /// `RestoreDone` and returns the new root fragment.
    pub fn restore_fragment(
        &mut self,
        table_id: u32,
        frag_ids: [u32; 2],
        lcp_id: u32,
    ) -> Result<RootFragId, SmallError> {
        info!(
            "restoring table {} fragments {:?} from checkpoint {}",
            table_id, frag_ids, lcp_id
        );
        let root = self.roots.seize()?;
        let mut frags = [NIL; 2];
        for i in 0..2 {
            frags[i] = match self.restore_local_fragment(root, table_id, frag_ids[i], lcp_id) {
                Ok(f) => f,
                Err(e) => {
                    self.roots.release(root);
                    return Err(e);
                }
            };
        }
        {
            let r = self.roots.get_mut(root);
            r.state = RootState::Active;
            r.table_id = table_id;
            r.frags = frags;
            r.frag_ids = frag_ids;
        }
        self.tables
            .entry(table_id)
            .or_insert_with(Vec::new)
            .push(root);

        // undo execution, newest record first, per fragment
        self.in_recovery = true;
        let undo_version = self.undo.file_version;
        let result = self.execute_undo(root, lcp_id);
        self.in_recovery = false;
        result?;

        // counters are rebuilt from the healed pages rather than trusted
        // from the zero page, which was written mid-traffic
        let mut elements = 0i64;
        for &frag in frags.iter() {
            self.rebuild_overflow_lists(frag)?;
            let frag_elements = self.count_elements(frag);
            elements += frag_elements;
            let f = self.fragments.get_mut(frag);
            f.frag_state = FragState::Active;
            f.loading = false;
            f.slack = f.bucket_count() as i64 * f.max_load_factor as i64 - frag_elements;
            f.slack_check =
                f.bucket_count() as i64 * (f.max_load_factor - f.min_load_factor) as i64;
        }
        self.roots.get_mut(root).no_of_elements = elements;

        self.events.push_back(StoreEvent::RestoreDone(root));
        info!(
            "restore complete, root {}, {} elements, undo version {}",
            root, elements, undo_version
        );
        Ok(root)
    }

    fn restore_local_fragment(
        &mut self,
        root: u32,
        table_id: u32,
        fid: u32,
        lcp_id: u32,
    ) -> Result<FragId, SmallError> {
        let path = self
            .config
            .root_dir
            .join("D3")
            .join("HASH")
            .join(format!("T{}", table_id))
            .join(format!("F{}", fid))
            .join(format!("S{}.DATA", lcp_id));
        let mut file = SmallFile::open_readonly(path)?;

        let mut zero = [0u32; WORDS_IN_PAGE];
        file.read_page(0, &mut zero)?;
        {
            let mut sum = 0u32;
            for (i, w) in zero.iter().enumerate() {
                if i != POS_CHECKSUM {
                    sum ^= w;
                }
            }
            if sum != zero[POS_CHECKSUM] {
                return Err(SmallError::of(
                    ErrorKind::ReadError,
                    "zero page checksum mismatch",
                ));
            }
        }
        if zero[ZP_TABID] != table_id {
            return Err(SmallError::of(ErrorKind::ReadError, "zero page table mismatch"));
        }

        let frag = self.fragments.seize()?;
        let directory = self.dirs.seize_range()?;
        let overflow_dir = self.dirs.seize_range()?;
        {
            let f = self.fragments.get_mut(frag);
            f.frag_state = FragState::SrReadPages;
            f.my_root = root;
            f.my_fid = fid;
            f.my_table_id = table_id;
            f.directory = directory;
            f.overflow_dir = overflow_dir;
            f.loading = true;
            f.local_checkp_id = lcp_id;
            f.prev_undo_position = zero[ZP_PREV_UNDOP];
            f.dir_size = zero[ZP_DIRSIZE];
            f.expand_counter = zero[ZP_EXPCOUNTER];
            f.slack = zero[ZP_SLACK] as i32 as i64;
            f.hash_check_bit = zero[ZP_HASHCHECKBIT];
            f.k_bits = zero[ZP_K];
            f.lh_frag_bits = zero[ZP_LHFRAGBITS];
            f.lh_dir_bits = zero[ZP_LHDIRBITS];
            f.local_key_len = zero[ZP_LOCALKEYLEN];
            f.maxp = zero[ZP_MAXP];
            f.max_load_factor = zero[ZP_MAXLOADFACTOR];
            f.min_load_factor = zero[ZP_MINLOADFACTOR];
            f.last_over_index = zero[ZP_LAST_OVER_INDEX];
            f.p = zero[ZP_P];
            f.element_length = zero[ZP_ELEMENT_LENGTH];
            f.key_length = zero[ZP_KEY_LENGTH];
            f.slack_check = zero[ZP_SLACK_CHECK] as i32 as i64;
            f.no_stored_pages = zero[ZP_NO_PAGES];
            f.no_of_stored_over_pages = zero[ZP_NO_OVER_PAGE];
            f.no_of_expected_pages = zero[ZP_NO_PAGES] + zero[ZP_NO_OVER_PAGE];
        }
        self.roots.get_mut(root).commit_count =
            (zero[ZP_COMMIT_COUNT_LO] as u64) | ((zero[ZP_COMMIT_COUNT_HI] as u64) << 32);

        // the undo group this image pairs with
        self.open_undo_group(zero[ZP_NEXT_UNDO_FILE])?;
        self.undo.file_version = zero[ZP_NEXT_UNDO_FILE];

        // bucket pages in directory order, then overflow pages by their
        // own logical ids
        let no_pages = zero[ZP_NO_PAGES];
        let no_over = zero[ZP_NO_OVER_PAGE];
        let sr_budget = self.config.lcp_disc_pages_acc_sr.max(1);
        for k in 0..no_pages {
            if k % sr_budget == 0 {
                debug!("restore tick, bucket pages {}..{}", k, (k + sr_budget).min(no_pages));
            }
            let page = self.read_data_page(&mut file, 1 + k)?;
            let logical = self.pages.get(page).logical_id();
            if logical != k {
                return Err(SmallError::of(
                    ErrorKind::ReadError,
                    "bucket page out of order in data file",
                ));
            }
            self.pages.get_mut(page).set_frag_rec(frag);
            self.dirs.set_page_ref(directory, logical, page)?;
        }
        for k in 0..no_over {
            let page = self.read_data_page(&mut file, 1 + no_pages + k)?;
            let logical = self.pages.get(page).logical_id();
            self.pages.get_mut(page).set_frag_rec(frag);
            self.dirs.set_page_ref(overflow_dir, logical, page)?;
        }
        debug!(
            "fragment {} loaded, {} bucket pages, {} overflow pages",
            frag, no_pages, no_over
        );
        Ok(frag)
    }

    fn read_data_page(
        &mut self,
        file: &mut SmallFile,
        file_page: u32,
    ) -> Result<PageId, SmallError> {
        let page = self.pages.seize()?;
        file.read_page(file_page, &mut self.pages.get_mut(page).word)?;
        if !self.pages.get(page).checksum_ok() {
            self.pages.release(page);
            return Err(SmallError::of(
                ErrorKind::ReadError,
                "data page checksum mismatch",
            ));
        }
        Ok(page)
    }

    // ------------------------------------------------------------------
    // undo execution
    // ------------------------------------------------------------------

    /// Walk each fragment's undo chain newest-first. Page records restore
    /// prior bytes; op records, written at checkpoint start and therefore
    /// reached last, take back inserts that were already visible and
    /// unlock everything else.
    fn execute_undo(&mut self, root: RootFragId, lcp_id: u32) -> Result<(), SmallError> {
        let frags = self.roots.get(root).frags;
        for &frag in frags.iter() {
            let mut touched: Vec<PageId> = Vec::new();
            let mut op_records = Vec::new();
            let mut addr = self.fragments.get(frag).prev_undo_position;
            let mut applied = 0u32;
            while addr != NIL {
                let (header, payload) = self.undo_read_record(addr)?;
                let matches = {
                    let f = self.fragments.get(frag);
                    header.table_id == f.my_table_id
                        && header.local_frag_id == f.my_fid
                        && f.local_checkp_id == lcp_id
                };
                if matches {
                    match header.rec_type() {
                        UNDO_PAGE_INFO | UNDO_OVER_PAGE_INFO => {
                            if let Some(page) = self.undo_target_page(frag, &header) {
                                self.pages
                                    .get_mut(page)
                                    .overwrite_region(header.page_offset() as usize, &payload);
                                touched.push(page);
                                applied += 1;
                            }
                        }
                        UNDO_OP_INFO => {
                            // applied after every page record, i.e. once
                            // the loop reaches the chain's oldest end
                            op_records.push(payload);
                        }
                        _ => {
                            return Err(SmallError::of(
                                ErrorKind::ReadError,
                                "unknown undo record type",
                            ))
                        }
                    }
                }
                addr = header.prev_undo_for_frag;
            }
            for page in touched.iter().cloned().unique() {
                self.pages.get_mut(page).recompute_checksum();
            }
            for payload in op_records {
                self.apply_op_undo(frag, &payload)?;
            }
            debug!("fragment {} undo executed, {} page regions", frag, applied);
        }
        Ok(())
    }

    fn apply_op_undo(&mut self, frag: FragId, payload: &[u32]) -> Result<(), SmallError> {
        if payload.len() < 3 {
            return Err(SmallError::of(ErrorKind::ReadError, "short op-undo record"));
        }
        let kind = payload[0];
        let hash = payload[1];
        let lk_len = payload[2] as usize;
        let mut lk = [0u32; 2];
        for i in 0..lk_len.min(2) {
            lk[i] = payload[3 + i];
        }
        let bucket = {
            let f = self.fragments.get(frag);
            f.bucket_of(f.bucket_hash_of(hash))
        };
        let elem = match self.get_element_by_local_key(frag, bucket, &lk) {
            Some(e) => e,
            None => return Ok(()),
        };
        if kind == OpKind::Insert as u32 {
            // the insert was uncommitted at the checkpoint: take it back
            self.delete_element(frag, bucket, elem)?;
            debug!("op-undo removed uncommitted insert in bucket {}", bucket);
        } else {
            // any surviving lock state is meaningless after restart
            let header = self.elem_header(elem);
            if element::is_locked(header) {
                let part = {
                    let f = self.fragments.get(frag);
                    (hash >> f.lh_frag_bits) & 0xFFFF
                };
                self.set_elem_header(elem, element::unlocked(part, 0));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // post-undo rebuilds
    // ------------------------------------------------------------------

    /// Overflow records are volatile; rebuild both fragment lists from
    /// the loaded pages.
    fn rebuild_overflow_lists(&mut self, frag: FragId) -> Result<(), SmallError> {
        let last = self.fragments.get(frag).last_over_index;
        for logical in (0..last).sorted().rev() {
            match self.try_frag_page(frag, DirKind::Overflow, logical) {
                Some(page) => {
                    let rec = self.overflow_recs.seize()?;
                    {
                        let r = self.overflow_recs.get_mut(rec);
                        r.dir_index = logical;
                        r.page = page;
                    }
                    self.pages.get_mut(page).set_overflow_rec(rec);
                    if self.pages.get(page).has_free_container() {
                        self.link_overflow_rec(frag, rec, OverList::WithFree);
                    }
                }
                None => {
                    let rec = self.overflow_recs.seize()?;
                    self.overflow_recs.get_mut(rec).dir_index = logical;
                    self.link_overflow_rec(frag, rec, OverList::FreeDirIndex);
                }
            }
        }
        Ok(())
    }

    fn count_elements(&self, frag: FragId) -> i64 {
        let f = self.fragments.get(frag);
        let mut n = 0i64;
        for logical in 0..f.dir_size {
            if let Some(p) = self.try_frag_page(frag, DirKind::Normal, logical) {
                n += self.pages.get(p).elem_count() as i64;
            }
        }
        for logical in 0..f.last_over_index {
            if let Some(p) = self.try_frag_page(frag, DirKind::Overflow, logical) {
                n += self.pages.get(p).elem_count() as i64;
            }
        }
        n
    }
}
