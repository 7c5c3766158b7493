use log::debug;

use crate::{
    consts::*,
    error::{ErrorKind, SmallError},
    op::{
        lock_queue::LockResult,
        operation::{LockMode, OpKind, OpOutcome, OpState},
    },
    page::{container::ElemRef, element},
    store::{HashStore, StoreEvent},
    types::{LocalKey, OpId, RootFragId, ScanId, TransId, NIL},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanBucketState {
    FirstLap,
    SecondLap,
    Completed,
}

impl Default for ScanBucketState {
    fn default() -> Self {
        ScanBucketState::FirstLap
    }
}

/// Per-active-scan state; one element-header bit per scan.
pub struct ScanRec {
    pub root: RootFragId,
    pub active_local_frag: u32,
    pub scan_mask_bit: u32,
    pub lock_mode: LockMode,
    pub read_committed: bool,
    pub trans: TransId,
    pub bucket_state: ScanBucketState,
    pub next_bucket_index: u32,
    pub start_no_of_buckets: u32,
    pub min_bucket_index_to_rescan: u32,
    pub max_bucket_index_to_rescan: u32,
    pub first_active_op: OpId,
    pub first_locked_op: OpId,
    pub last_locked_op: OpId,
    pub first_queued_op: OpId,
    pub last_queued_op: OpId,
    pub lock_held: u32,
    pub ops_allocated: u32,
    pub timer: u32,
    pub continueb_counter: u32,
}

impl Default for ScanRec {
    fn default() -> Self {
        Self {
            root: NIL,
            active_local_frag: 0,
            scan_mask_bit: 0,
            lock_mode: LockMode::Shared,
            read_committed: false,
            trans: TransId(0, 0),
            bucket_state: ScanBucketState::FirstLap,
            next_bucket_index: 0,
            start_no_of_buckets: 0,
            min_bucket_index_to_rescan: NIL,
            max_bucket_index_to_rescan: 0,
            first_active_op: NIL,
            first_locked_op: NIL,
            last_locked_op: NIL,
            first_queued_op: NIL,
            last_queued_op: NIL,
            lock_held: 0,
            ops_allocated: 0,
            timer: 0,
            continueb_counter: 0,
        }
    }
}

/// What `scan_next` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanNext {
    Row { op: OpId, local_key: LocalKey },
    /// Back-pressure: too many row locks held, or waiting for queued
    /// locks to resolve. Retry after commits or events.
    CheckLcpStop,
    NoMoreRows,
}

impl HashStore {
    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn scan_begin(
        &mut self,
        root: RootFragId,
        lock_mode: LockMode,
        read_committed: bool,
        trans: TransId,
    ) -> Result<ScanId, SmallError> {
        let slot = {
            let r = self.roots.get(root);
            match r.scans.iter().position(|&s| s == NIL) {
                Some(i) => i,
                None => {
                    return Err(SmallError::of(
                        ErrorKind::OutOfScanRecords,
                        "four scans already active on fragment",
                    ))
                }
            }
        };
        let scan = self.scans.seize()?;
        let frag0 = self.roots.get(root).frags[0];
        {
            let rec = self.scans.get_mut(scan);
            rec.root = root;
            rec.active_local_frag = 0;
            rec.scan_mask_bit = 1 << slot;
            rec.lock_mode = lock_mode;
            rec.read_committed = read_committed;
            rec.trans = trans;
            rec.bucket_state = ScanBucketState::FirstLap;
            rec.next_bucket_index = 0;
        }
        self.scans.get_mut(scan).start_no_of_buckets =
            self.fragments.get(frag0).bucket_count();
        self.roots.get_mut(root).scans[slot] = scan;
        debug!("scan {} started on root {}, bit {}", scan, root, 1 << slot);
        Ok(scan)
    }

    pub fn scan_close(&mut self, scan: ScanId) {
        let root = self.scans.get(scan).root;
        // release every op the scan still holds
        for list in [
            self.scans.get(scan).first_active_op,
            self.scans.get(scan).first_locked_op,
            self.scans.get(scan).first_queued_op,
        ]
        .iter()
        {
            let mut op = *list;
            while op != NIL {
                let next = self.ops.get(op).next_scan_op;
                if self.ops.get(op).in_lock_queue {
                    self.release_from_queue(op, false);
                }
                self.ops.release(op);
                op = next;
            }
        }
        // sweep our bit out of both fragments
        let bit = self.scans.get(scan).scan_mask_bit;
        let frags = self.roots.get(root).frags;
        for &frag in frags.iter() {
            let buckets = self.fragments.get(frag).bucket_count();
            for bucket in 0..buckets {
                for walked in self.walk_bucket(frag, bucket) {
                    if element::is_locked(walked.header) {
                        let op = element::op_of(walked.header);
                        self.ops.get_mut(op).scan_bits &= !bit;
                    } else if element::scan_bits(walked.header) & bit != 0 {
                        self.set_elem_header(
                            walked.elem,
                            element::clear_scan_bit(walked.header, bit),
                        );
                    }
                }
            }
        }
        let r = self.roots.get_mut(root);
        for s in r.scans.iter_mut() {
            if *s == scan {
                *s = NIL;
            }
        }
        self.scans.release(scan);
        debug!("scan {} closed", scan);
    }

    /// Liveness tick. True while the scan is still running; the embedder
    /// forwards this as its heartbeat.
    pub fn scan_heartbeat(&mut self, scan: ScanId) -> bool {
        let rec = self.scans.get_mut(scan);
        rec.timer += 1;
        rec.root != NIL
    }

    // ------------------------------------------------------------------
    // row production
    // ------------------------------------------------------------------

    pub fn scan_next(&mut self, scan: ScanId) -> ScanNext {
        loop {
            // queued locks resolved since last call go out first
            if let Some(next) = self.deliver_queued(scan) {
                return next;
            }
            if self.scans.get(scan).lock_held >= SCAN_MAX_LOCK {
                return ScanNext::CheckLcpStop;
            }

            let frag_pos = self.scans.get(scan).active_local_frag;
            let frag = self.roots.get(self.scans.get(scan).root).frags[frag_pos as usize];

            if self.scans.get(scan).bucket_state == ScanBucketState::Completed {
                let rec = self.scans.get(scan);
                let drained = rec.lock_held == 0
                    && rec.first_locked_op == NIL
                    && rec.first_queued_op == NIL
                    && rec.first_active_op == NIL;
                if !drained {
                    return ScanNext::CheckLcpStop;
                }
                if frag_pos == 0 {
                    // move on to the second local fragment
                    let frag1 = self.roots.get(self.scans.get(scan).root).frags[1];
                    let buckets = self.fragments.get(frag1).bucket_count();
                    let rec = self.scans.get_mut(scan);
                    rec.active_local_frag = 1;
                    rec.bucket_state = ScanBucketState::FirstLap;
                    rec.next_bucket_index = 0;
                    rec.start_no_of_buckets = buckets;
                    rec.min_bucket_index_to_rescan = NIL;
                    rec.max_bucket_index_to_rescan = 0;
                    continue;
                }
                return ScanNext::NoMoreRows;
            }

            let last_bucket = {
                let f = self.fragments.get(frag);
                f.p + f.maxp
            };
            let (state, next_bucket) = {
                let rec = self.scans.get(scan);
                (rec.bucket_state, rec.next_bucket_index)
            };
            match state {
                ScanBucketState::FirstLap if next_bucket > last_bucket => {
                    let rec = self.scans.get_mut(scan);
                    if rec.min_bucket_index_to_rescan != NIL {
                        rec.bucket_state = ScanBucketState::SecondLap;
                        rec.next_bucket_index =
                            rec.min_bucket_index_to_rescan.min(last_bucket);
                    } else {
                        rec.bucket_state = ScanBucketState::Completed;
                    }
                    continue;
                }
                ScanBucketState::SecondLap
                    if next_bucket > last_bucket
                        || next_bucket > self.scans.get(scan).max_bucket_index_to_rescan =>
                {
                    self.scans.get_mut(scan).bucket_state = ScanBucketState::Completed;
                    continue;
                }
                _ => {}
            }

            match self.scan_bucket_step(scan, frag, next_bucket) {
                Some(next) => return next,
                None => {
                    self.scans.get_mut(scan).next_bucket_index += 1;
                    // a denied expand gets another chance now that the
                    // scan moved past its bucket
                    if self.fragments.get(frag).slack < 0 {
                        self.check_expand_shrink(frag);
                    }
                }
            }
        }
    }

    /// Produce one row from a bucket, or None when every element was
    /// visited.
    fn scan_bucket_step(
        &mut self,
        scan: ScanId,
        frag: u32,
        bucket: u32,
    ) -> Option<ScanNext> {
        let bit = self.scans.get(scan).scan_mask_bit;
        let read_committed = self.scans.get(scan).read_committed;
        for walked in self.walk_bucket(frag, bucket) {
            let visited = if element::is_locked(walked.header) {
                self.ops.get(element::op_of(walked.header)).scan_bits & bit != 0
            } else {
                element::scan_bits(walked.header) & bit != 0
            };
            if visited {
                continue;
            }
            let op = match self.seize_scan_op(scan, frag, walked.elem, walked.header) {
                Ok(op) => op,
                Err(_) => return Some(ScanNext::CheckLcpStop),
            };
            self.mark_visited(walked.elem, walked.header, bit);

            if read_committed {
                let lk = self.scan_elem_lk(frag, walked.elem);
                self.ops.get_mut(op).local_key = lk;
                self.ops.get_mut(op).result = Some(OpOutcome::Done(lk));
                self.link_scan_op(scan, op, ScanList::Active);
                return Some(ScanNext::Row { op, local_key: lk });
            }

            match self.acquire_lock(op, walked.elem) {
                LockResult::Granted => {
                    if self.ops.get(op).element_is_disappeared {
                        // the row is going away under us; let go quietly
                        self.release_from_queue(op, false);
                        self.scans.get_mut(scan).ops_allocated -= 1;
                        self.ops.release(op);
                        continue;
                    }
                    let lk = self.scan_elem_lk(frag, walked.elem);
                    self.ops.get_mut(op).local_key = lk;
                    self.ops.get_mut(op).result = Some(OpOutcome::Done(lk));
                    self.link_scan_op(scan, op, ScanList::Active);
                    self.scans.get_mut(scan).lock_held += 1;
                    return Some(ScanNext::Row { op, local_key: lk });
                }
                LockResult::Blocked => {
                    self.ops.get_mut(op).op_state = OpState::Blocked;
                    self.link_scan_op(scan, op, ScanList::Locked);
                    continue;
                }
                LockResult::InsertError => {
                    self.scans.get_mut(scan).ops_allocated -= 1;
                    self.ops.release(op);
                    continue;
                }
            }
        }
        None
    }

    fn seize_scan_op(
        &mut self,
        scan: ScanId,
        frag: u32,
        elem: ElemRef,
        header: u32,
    ) -> Result<OpId, SmallError> {
        let op = self.ops.seize()?;
        let (root, trans, lock_mode) = {
            let rec = self.scans.get(scan);
            (rec.root, rec.trans, rec.lock_mode)
        };
        let part = if element::is_locked(header) {
            self.ops.get(element::op_of(header)).hash_part
        } else {
            element::hash_value_part(header)
        };
        let rec = self.ops.get_mut(op);
        rec.kind = OpKind::Scan;
        rec.lock_mode = lock_mode;
        rec.trans = trans;
        rec.root = root;
        rec.frag = frag;
        rec.scan_rec = scan;
        rec.hash_part = part;
        rec.op_state = OpState::Executed;
        rec.elem_page = elem.page;
        rec.elem_ptr = elem.elem_ptr;
        rec.elem_container = elem.con_ptr;
        rec.elem_forward = elem.forward;
        self.ops.get_mut(op).fid = self.fragments.get(frag).my_fid;
        self.scans.get_mut(scan).ops_allocated += 1;
        Ok(op)
    }

    fn mark_visited(&mut self, elem: ElemRef, header: u32, bit: u32) {
        if element::is_locked(header) {
            self.ops.get_mut(element::op_of(header)).scan_bits |= bit;
        } else {
            self.set_elem_header(elem, element::set_scan_bit(header, bit));
        }
    }

    fn scan_elem_lk(&self, frag: u32, elem: ElemRef) -> LocalKey {
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        let mut words = [0u32; 2];
        for i in 0..lk_len {
            words[i] = self.elem_local_key_word(elem.page, elem.elem_ptr, elem.forward, i);
        }
        self.unpack_local_key(frag, &words)
    }

    /// Hand out a previously blocked row whose lock resolved.
    fn deliver_queued(&mut self, scan: ScanId) -> Option<ScanNext> {
        loop {
            let op = self.scans.get(scan).first_queued_op;
            if op == NIL {
                return None;
            }
            self.unlink_scan_op(scan, op, ScanList::Queued);
            match self.ops.get(op).result {
                Some(OpOutcome::Done(lk)) => {
                    self.link_scan_op(scan, op, ScanList::Active);
                    return Some(ScanNext::Row { op, local_key: lk });
                }
                _ => {
                    // the row disappeared while we waited
                    if self.ops.get(op).in_lock_queue {
                        self.release_from_queue(op, false);
                    }
                    self.scans.get_mut(scan).lock_held -= 1;
                    self.scans.get_mut(scan).ops_allocated -= 1;
                    self.ops.release(op);
                }
            }
        }
    }

    /// Called by the restart machinery when a scan op reaches the front
    /// of its lock queue.
    pub(crate) fn scan_op_unblocked(&mut self, op: OpId) {
        let scan = self.ops.get(op).scan_rec;
        let disappeared = self.ops.get(op).element_is_disappeared;
        let frag = self.ops.get(op).frag;
        let elem = {
            let rec = self.ops.get(op);
            ElemRef {
                page: rec.elem_page,
                con_ptr: rec.elem_container,
                elem_ptr: rec.elem_ptr,
                forward: rec.elem_forward,
            }
        };
        {
            let rec = self.ops.get_mut(op);
            rec.op_state = OpState::Executed;
        }
        if disappeared {
            self.ops.get_mut(op).result = Some(OpOutcome::Refused(ErrorKind::TupleNotFound));
        } else {
            let lk = self.scan_elem_lk(frag, elem);
            self.ops.get_mut(op).local_key = lk;
            self.ops.get_mut(op).result = Some(OpOutcome::Done(lk));
        }
        self.unlink_scan_op(scan, op, ScanList::Locked);
        self.link_scan_op(scan, op, ScanList::Queued);
        self.scans.get_mut(scan).lock_held += 1;
        self.events.push_back(StoreEvent::ScanRowsAvailable(scan));
    }

    /// The embedder is done with a delivered row: release the lock and
    /// the operation record.
    pub fn scan_release_row(&mut self, scan: ScanId, op: OpId) {
        debug_assert_eq!(self.ops.get(op).scan_rec, scan);
        self.unlink_scan_op(scan, op, ScanList::Active);
        if self.ops.get(op).in_lock_queue {
            self.release_from_queue(op, false);
            self.scans.get_mut(scan).lock_held -= 1;
        }
        self.scans.get_mut(scan).ops_allocated -= 1;
        self.ops.release(op);
    }

    // ------------------------------------------------------------------
    // scan op lists
    // ------------------------------------------------------------------

    fn list_heads(&mut self, scan: ScanId, list: ScanList) -> (&mut OpId, Option<&mut OpId>) {
        let rec = self.scans.get_mut(scan);
        match list {
            ScanList::Active => (&mut rec.first_active_op, None),
            ScanList::Locked => (&mut rec.first_locked_op, Some(&mut rec.last_locked_op)),
            ScanList::Queued => (&mut rec.first_queued_op, Some(&mut rec.last_queued_op)),
        }
    }

    fn link_scan_op(&mut self, scan: ScanId, op: OpId, list: ScanList) {
        let head = {
            let (first, _) = self.list_heads(scan, list);
            *first
        };
        {
            let rec = self.ops.get_mut(op);
            rec.next_scan_op = head;
            rec.prev_scan_op = NIL;
        }
        if head != NIL {
            self.ops.get_mut(head).prev_scan_op = op;
        }
        let (first, last) = self.list_heads(scan, list);
        *first = op;
        if let Some(last) = last {
            if *last == NIL {
                *last = op;
            }
        }
    }

    fn unlink_scan_op(&mut self, scan: ScanId, op: OpId, list: ScanList) {
        let (prev, next) = {
            let rec = self.ops.get(op);
            (rec.prev_scan_op, rec.next_scan_op)
        };
        if prev != NIL {
            self.ops.get_mut(prev).next_scan_op = next;
        }
        if next != NIL {
            self.ops.get_mut(next).prev_scan_op = prev;
        }
        let (first, last) = self.list_heads(scan, list);
        if *first == op {
            *first = next;
        }
        if let Some(last) = last {
            if *last == op {
                *last = prev;
            }
        }
        let rec = self.ops.get_mut(op);
        rec.next_scan_op = NIL;
        rec.prev_scan_op = NIL;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanList {
    Active,
    Locked,
    Queued,
}
