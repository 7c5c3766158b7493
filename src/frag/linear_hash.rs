use log::{debug, info};

use crate::{
    consts::*,
    page::{element, DirKind},
    scan::scan::ScanBucketState,
    store::{HashStore, Work},
    types::{FragId, NIL},
};

/// Expand and shrink of the linear hash table. Both run as single-bucket
/// steps interleaved with normal traffic; another step is chained through
/// the work queue when the slack counters say so.
impl HashStore {
    /// Schedule an expand or shrink if the slack counters call for one.
    /// Invoked after every commit that changed the element count.
    pub(crate) fn check_expand_shrink(&mut self, frag: FragId) {
        let f = self.fragments.get(frag);
        if f.expand_flag {
            return;
        }
        if f.slack < 0 {
            self.fragments.get_mut(frag).expand_flag = true;
            self.push_work(Work::Expand(frag));
        } else if f.slack > f.slack_check && f.expand_counter > 0 {
            self.fragments.get_mut(frag).expand_flag = true;
            self.push_work(Work::Shrink(frag));
        }
    }

    /// A scan that has not yet passed a bucket vetoes structural changes
    /// to it.
    fn scan_vetoes_bucket(&self, frag: FragId, bucket: u32) -> bool {
        let f = self.fragments.get(frag);
        let root = self.roots.get(f.my_root);
        let frag_pos = if root.frags[0] == frag { 0 } else { 1 };
        for &scan_id in root.scans.iter() {
            if scan_id == NIL {
                continue;
            }
            let scan = self.scans.get(scan_id);
            if scan.active_local_frag != frag_pos {
                continue;
            }
            match scan.bucket_state {
                ScanBucketState::Completed => continue,
                _ => {
                    if scan.next_bucket_index <= bucket {
                        return true;
                    }
                    if scan.min_bucket_index_to_rescan != NIL
                        && scan.min_bucket_index_to_rescan <= bucket
                        && bucket <= scan.max_bucket_index_to_rescan
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // expand
    // ------------------------------------------------------------------

    pub(crate) fn expand_step(&mut self, frag: FragId) {
        {
            let f = self.fragments.get_mut(frag);
            f.expand_flag = false;
            if f.slack >= 0 {
                return;
            }
        }
        let (p, maxp, hcb, create_lcp) = {
            let f = self.fragments.get(frag);
            (f.p, f.maxp, f.hash_check_bit, f.create_lcp)
        };
        let new_bucket = maxp + p + 1;

        // preconditions: a page for the receiver, undo credit, and no
        // scan inside the sender bucket
        if self.pages.free_count() < 2 {
            debug!("expand denied, no page budget");
            return;
        }
        if create_lcp {
            // the sender page is never beyond the snapshot window, so
            // the step has to wait the checkpoint out
            if self.undo_free_pages() < MIN_UNDO_PAGES_AT_EXPAND
                || p >> K < self.fragments.get(frag).lcp_max_dir_index
            {
                debug!("expand denied inside checkpoint window");
                return;
            }
        }
        if self.scan_vetoes_bucket(frag, p) {
            debug!("expand denied, scan inside bucket {}", p);
            return;
        }

        // make sure the receiving bucket's page exists
        let (dest_logical, _) = self.fragments.get(frag).bucket_position(new_bucket);
        if dest_logical == self.fragments.get(frag).dir_size {
            let page = match self.pages.seize() {
                Ok(p) => p,
                Err(_) => return,
            };
            self.pages.get_mut(page).init_normal(dest_logical, frag);
            if self.set_frag_page(frag, DirKind::Normal, dest_logical, page).is_err() {
                self.pages.release(page);
                return;
            }
            self.fragments.get_mut(frag).dir_size += 1;
        }

        // move every element whose split bit is set
        loop {
            let mut moved_any = false;
            for walked in self.walk_bucket(frag, p) {
                let part = if element::is_locked(walked.header) {
                    self.ops.get(element::op_of(walked.header)).hash_part
                } else {
                    element::hash_value_part(walked.header)
                };
                if (part >> hcb) & 1 == 0 {
                    continue;
                }
                let lk_len = self.fragments.get(frag).local_key_len as usize;
                let lk = walked.local_key;
                if let Ok(new_elem) =
                    self.insert_element(frag, new_bucket, walked.header, &lk[..lk_len])
                {
                    if element::is_locked(walked.header) {
                        let op = element::op_of(walked.header);
                        let rec = self.ops.get_mut(op);
                        rec.elem_page = new_elem.page;
                        rec.elem_ptr = new_elem.elem_ptr;
                        rec.elem_container = new_elem.con_ptr;
                        rec.elem_forward = new_elem.forward;
                    }
                    crate::database::Database::mut_search_sys()
                        .drop_element(walked.elem.page, walked.elem.elem_ptr);
                    let _ = self.delete_element(frag, p, walked.elem);
                    moved_any = true;
                } else {
                    // out of space mid-step; leave the rest for a retry
                    return;
                }
                break;
            }
            if !moved_any {
                break;
            }
        }

        {
            let f = self.fragments.get_mut(frag);
            f.p += 1;
            if f.p > f.maxp {
                f.maxp = (f.maxp << 1) | 1;
                f.lh_dir_bits += 1;
                f.hash_check_bit += 1;
                f.p = 0;
                info!("hash table doubled, maxp now {}", f.maxp);
            }
            f.slack += f.max_load_factor as i64;
            f.expand_counter += 1;
            f.slack_check =
                f.bucket_count() as i64 * (f.max_load_factor - f.min_load_factor) as i64;
            debug!(
                "expanded into bucket {}, buckets: {}, slack: {}",
                new_bucket,
                f.bucket_count(),
                f.slack
            );
        }
        // a deep deficit chains the next step without waiting for a commit
        if self.fragments.get(frag).slack < 0 {
            self.fragments.get_mut(frag).expand_flag = true;
            self.push_work(Work::Expand(frag));
        }
    }

    // ------------------------------------------------------------------
    // shrink
    // ------------------------------------------------------------------

    pub(crate) fn shrink_step(&mut self, frag: FragId) {
        {
            let f = self.fragments.get_mut(frag);
            f.expand_flag = false;
            if f.slack <= f.slack_check || f.expand_counter == 0 {
                return;
            }
        }
        let (p, maxp, create_lcp) = {
            let f = self.fragments.get(frag);
            (f.p, f.maxp, f.create_lcp)
        };
        // compute the post-step parameters first; the sender is the
        // current last bucket
        let (new_p, new_maxp, dec_bits) = if p == 0 {
            (maxp >> 1, maxp >> 1, true)
        } else {
            (p - 1, maxp, false)
        };
        let sender = new_maxp + new_p + 1;
        let dest = new_p;

        if create_lcp && self.undo_free_pages() < MIN_UNDO_PAGES_AT_EXPAND {
            return;
        }
        let (sender_logical, sender_slot) = self.fragments.get(frag).bucket_position(sender);
        if create_lcp && sender_logical < self.fragments.get(frag).lcp_max_dir_index {
            // the checkpoint still needs the sender page as it is
            return;
        }
        if self.scan_vetoes_bucket(frag, sender) || self.scan_vetoes_bucket(frag, dest) {
            debug!("shrink denied, scan near buckets {} or {}", sender, dest);
            return;
        }

        // move everything from the sender into the destination
        loop {
            let walked = match self.walk_bucket(frag, sender).into_iter().next() {
                Some(w) => w,
                None => break,
            };
            let lk_len = self.fragments.get(frag).local_key_len as usize;
            // rescanning scans must see the arrivals as unvisited
            let header = if element::is_locked(walked.header) {
                self.ops.get_mut(element::op_of(walked.header)).scan_bits = 0;
                walked.header
            } else {
                element::unlocked(element::hash_value_part(walked.header), 0)
            };
            let lk = walked.local_key;
            let new_elem = match self.insert_element(frag, dest, header, &lk[..lk_len]) {
                Ok(e) => e,
                Err(_) => return,
            };
            if element::is_locked(header) {
                let op = element::op_of(header);
                let rec = self.ops.get_mut(op);
                rec.elem_page = new_elem.page;
                rec.elem_ptr = new_elem.elem_ptr;
                rec.elem_container = new_elem.con_ptr;
                rec.elem_forward = new_elem.forward;
            }
            crate::database::Database::mut_search_sys()
                .drop_element(walked.elem.page, walked.elem.elem_ptr);
            if self.delete_element(frag, sender, walked.elem).is_err() {
                return;
            }
        }

        // widen the rescan window of every scan the merge moved elements
        // behind
        {
            let root = self.fragments.get(frag).my_root;
            let r = self.roots.get(root);
            let frag_pos = if r.frags[0] == frag { 0u32 } else { 1u32 };
            let scan_ids: Vec<u32> = r.scans.iter().cloned().filter(|&s| s != NIL).collect();
            for scan_id in scan_ids {
                let scan = self.scans.get_mut(scan_id);
                if scan.active_local_frag != frag_pos {
                    continue;
                }
                if scan.bucket_state != ScanBucketState::Completed
                    && dest < scan.next_bucket_index
                {
                    if scan.min_bucket_index_to_rescan == NIL {
                        scan.min_bucket_index_to_rescan = dest;
                        scan.max_bucket_index_to_rescan = dest;
                    } else {
                        scan.min_bucket_index_to_rescan =
                            scan.min_bucket_index_to_rescan.min(dest);
                        scan.max_bucket_index_to_rescan =
                            scan.max_bucket_index_to_rescan.max(dest);
                    }
                }
            }
        }

        // free the sender page when it held only this bucket
        if sender_slot == 0 {
            if let Some(page) = self.try_frag_page(frag, DirKind::Normal, sender_logical) {
                debug_assert_eq!(self.pages.get(page).elem_count(), 0);
                self.clear_frag_page(frag, DirKind::Normal, sender_logical);
                self.drop_page_hash_when_freed(page);
                self.pages.release(page);
            }
        }

        {
            let f = self.fragments.get_mut(frag);
            f.p = new_p;
            if dec_bits {
                f.maxp = new_maxp;
                f.lh_dir_bits -= 1;
                f.hash_check_bit -= 1;
            }
            f.dir_size = (f.bucket_count() + 63) >> K;
            f.slack -= f.max_load_factor as i64;
            f.expand_counter -= 1;
            f.slack_check =
                f.bucket_count() as i64 * (f.max_load_factor - f.min_load_factor) as i64;
            debug!(
                "shrunk bucket {} into {}, buckets: {}, slack: {}",
                sender,
                dest,
                f.bucket_count(),
                f.slack
            );
        }
        if self.fragments.get(frag).slack > self.fragments.get(frag).slack_check
            && self.fragments.get(frag).expand_counter > 0
        {
            self.fragments.get_mut(frag).expand_flag = true;
            self.push_work(Work::Shrink(frag));
        }
    }
}
