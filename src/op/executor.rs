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
    types::{FragId, LocalKey, OpId, RootFragId, TransId, NIL},
};

/// One record request against a root fragment.
#[derive(Debug, Clone)]
pub struct OpRequest {
    pub kind: OpKind,
    pub lock_mode: LockMode,
    pub trans: TransId,
    pub key: Vec<u32>,
    pub hash: u32,
    pub read_committed: bool,
}

impl OpRequest {
    pub fn read(trans: TransId, key: &[u32], hash: u32) -> Self {
        Self {
            kind: OpKind::Read,
            lock_mode: LockMode::Shared,
            trans,
            key: key.to_vec(),
            hash,
            read_committed: false,
        }
    }

    pub fn insert(trans: TransId, key: &[u32], hash: u32) -> Self {
        Self {
            kind: OpKind::Insert,
            lock_mode: LockMode::Exclusive,
            trans,
            key: key.to_vec(),
            hash,
            read_committed: false,
        }
    }

    pub fn update(trans: TransId, key: &[u32], hash: u32) -> Self {
        Self {
            kind: OpKind::Update,
            lock_mode: LockMode::Exclusive,
            trans,
            key: key.to_vec(),
            hash,
            read_committed: false,
        }
    }

    pub fn delete(trans: TransId, key: &[u32], hash: u32) -> Self {
        Self {
            kind: OpKind::Delete,
            lock_mode: LockMode::Exclusive,
            trans,
            key: key.to_vec(),
            hash,
            read_committed: false,
        }
    }
}

impl HashStore {
    // ------------------------------------------------------------------
    // request entry
    // ------------------------------------------------------------------

    /// Start one operation. The outcome is immediately available through
    /// `op_outcome` unless the operation blocked on a lock or the
    /// fragment queue; then an `OpReady` event follows.
    pub fn exec_op(&mut self, root: RootFragId, req: OpRequest) -> Result<OpId, SmallError> {
        debug_assert!(req.key.len() <= 8 && !req.key.is_empty());
        let op = self.ops.seize()?;

        let frag = {
            let r = self.roots.get(root);
            r.frags[(req.hash & 1) as usize]
        };
        let (lh_frag_bits, has_char_attr) = {
            let f = self.fragments.get(frag);
            (f.lh_frag_bits, f.has_char_attr)
        };

        {
            let rec = self.ops.get_mut(op);
            rec.kind = req.kind;
            rec.lock_mode = if req.kind.is_writer() {
                LockMode::Exclusive
            } else {
                req.lock_mode
            };
            rec.trans = req.trans;
            rec.read_committed = req.read_committed && req.kind == OpKind::Read;
            rec.root = root;
            rec.frag = frag;
            rec.hash_value = req.hash;
            rec.hash_part = (req.hash >> lh_frag_bits) & 0xFFFF;
            rec.tup_key_len = req.key.len() as u32;
            rec.xfrm_key_len = req.key.len() as u32;
            for (i, &w) in req.key.iter().enumerate() {
                rec.key[i] = if has_char_attr { xfrm_word(w) } else { w };
            }
        }
        self.ops.get_mut(op).fid = self.fragments.get(frag).my_fid;

        {
            let rec = self.ops.get(op);
            let key_bytes: Vec<u8> = rec
                .key_words()
                .iter()
                .flat_map(|w| w.to_le_bytes().to_vec())
                .collect();
            debug!(
                "op {} starting, kind: {:?}, frag: {}, key: {}",
                op,
                rec.kind,
                frag,
                hex::encode(&key_bytes)
            );
        }

        // a fragment is unreachable only before its restore finished; a
        // running checkpoint serves traffic throughout
        {
            use crate::frag::FragState;
            let state = self.fragments.get(frag).frag_state;
            if matches!(
                state,
                FragState::Free | FragState::SrReadPages | FragState::SrReadOverPages
            ) {
                self.refuse(op, ErrorKind::TooEarlyAccess);
                return Ok(op);
            }
        }

        // requests wait while the queue is stopped or, for inserts inside
        // a checkpoint window, while undo credit is short
        let must_wait = {
            let f = self.fragments.get(frag);
            f.stop_que_op
                || (req.kind == OpKind::Insert
                    && f.create_lcp
                    && self.undo_free_pages() < MIN_UNDO_PAGES_AT_OPERATION)
        };
        if must_wait {
            self.enqueue_wait(frag, op);
            return Ok(op);
        }

        self.execute_request(op);
        Ok(op)
    }

    pub(crate) fn execute_request(&mut self, op: OpId) {
        let found = match self.search_element(op) {
            Ok(f) => f,
            Err(e) => {
                self.refuse(op, e.kind().unwrap_or(ErrorKind::ReadError));
                return;
            }
        };
        let kind = self.ops.get(op).kind;
        match (kind, found) {
            (OpKind::Read, None) | (OpKind::Scan, None) => {
                self.refuse(op, ErrorKind::TupleNotFound)
            }
            (OpKind::Read, Some(elem)) | (OpKind::Scan, Some(elem)) => self.read_found(op, elem),
            (OpKind::Insert, None) => self.fresh_insert(op),
            (OpKind::Write, None) => {
                self.ops.get_mut(op).kind = OpKind::Insert;
                self.fresh_insert(op)
            }
            (OpKind::Update, None) | (OpKind::Delete, None) => {
                self.refuse(op, ErrorKind::TupleNotFound)
            }
            (_, Some(elem)) => self.write_found(op, elem),
        }
    }

    fn read_found(&mut self, op: OpId, elem: ElemRef) {
        if self.ops.get(op).read_committed {
            let lk = self.elem_lk(op, elem);
            self.complete_ok(op, lk);
            return;
        }
        match self.acquire_lock(op, elem) {
            LockResult::Granted => {
                if self.effective_delete_before(op) {
                    self.refuse(op, ErrorKind::TupleNotFound);
                } else {
                    let lk = self.elem_lk(op, elem);
                    self.complete_ok(op, lk);
                }
            }
            LockResult::Blocked => self.block(op),
            LockResult::InsertError => self.refuse(op, ErrorKind::WriteError),
        }
    }

    fn write_found(&mut self, op: OpId, elem: ElemRef) {
        let header = self.elem_header(elem);
        if element::is_unlocked(header) && self.ops.get(op).kind == OpKind::Insert {
            // inserting a key that committed already
            self.refuse(op, ErrorKind::WriteError);
            return;
        }
        match self.acquire_lock(op, elem) {
            LockResult::Granted => {
                let kind = self.ops.get(op).kind;
                let behind_delete = self.effective_delete_before(op);
                match (kind, behind_delete) {
                    (OpKind::Insert, true) => self.insert_on_slot(op),
                    (OpKind::Insert, false) => self.refuse(op, ErrorKind::WriteError),
                    (_, true) => self.refuse(op, ErrorKind::TupleNotFound),
                    (_, false) => {
                        let lk = self.elem_lk(op, elem);
                        self.complete_ok(op, lk);
                    }
                }
            }
            LockResult::Blocked => self.block(op),
            LockResult::InsertError => self.refuse(op, ErrorKind::WriteError),
        }
    }

    /// The key does not exist: create the element, locked by this op.
    fn fresh_insert(&mut self, op: OpId) {
        let frag = self.ops.get(op).frag;
        let (table_id, fid, local_key_len) = {
            let f = self.fragments.get(frag);
            (f.my_table_id, f.my_fid, f.local_key_len)
        };
        let lk = {
            let rec = self.ops.get(op);
            let key = rec.key_words().to_vec();
            match self.tuple_store.allocate(table_id, fid, &key) {
                Ok(lk) => lk,
                Err(e) => {
                    self.refuse(op, e.kind().unwrap_or(ErrorKind::WriteError));
                    return;
                }
            }
        };
        let bucket = self.op_bucket(op);
        let lk_words = self.pack_local_key(frag, lk);
        let elem = match self.insert_element(frag, bucket, element::locked(op), &lk_words[..local_key_len as usize]) {
            Ok(e) => e,
            Err(e) => {
                self.tuple_store.deallocate(table_id, fid, lk);
                self.refuse(op, e.kind().unwrap_or(ErrorKind::OutOfPages));
                return;
            }
        };
        {
            let rec = self.ops.get_mut(op);
            rec.elem_page = elem.page;
            rec.elem_ptr = elem.elem_ptr;
            rec.elem_container = elem.con_ptr;
            rec.elem_forward = elem.forward;
            rec.scan_bits = 0;
            rec.insert_is_done = true;
            rec.in_lock_queue = true;
        }
        self.insert_lock_owner(frag, op);
        debug!("fresh insert, op: {}, local key: {:?}", op, lk);
        self.complete_ok(op, lk);
    }

    /// Insert behind our own delete: the element survives with a new
    /// tuple behind it.
    pub(crate) fn insert_on_slot(&mut self, op: OpId) {
        let frag = self.ops.get(op).frag;
        let (table_id, fid, local_key_len) = {
            let f = self.fragments.get(frag);
            (f.my_table_id, f.my_fid, f.local_key_len)
        };
        let lk = {
            let key = self.ops.get(op).key_words().to_vec();
            match self.tuple_store.allocate(table_id, fid, &key) {
                Ok(lk) => lk,
                Err(e) => {
                    self.refuse(op, e.kind().unwrap_or(ErrorKind::WriteError));
                    return;
                }
            }
        };
        let words = self.pack_local_key(frag, lk);
        let (page, ptr, fwd) = {
            let rec = self.ops.get(op);
            (rec.elem_page, rec.elem_ptr, rec.elem_forward)
        };
        self.lcp_undo_write(page);
        self.set_elem_local_key(page, ptr, fwd, &words[..local_key_len as usize]);
        {
            let rec = self.ops.get_mut(op);
            rec.insert_is_done = true;
        }
        // the slot is alive again for everyone sharing the lock
        let owner = if self.ops.get(op).lock_owner {
            op
        } else {
            let mut cur = op;
            while !self.ops.get(cur).lock_owner {
                cur = self.ops.get(cur).prev_parallel;
            }
            cur
        };
        for o in self.parallel_group(owner) {
            self.ops.get_mut(o).element_is_disappeared = false;
        }
        self.complete_ok(op, lk);
    }

    // ------------------------------------------------------------------
    // search
    // ------------------------------------------------------------------

    fn search_element(&mut self, op: OpId) -> Result<Option<ElemRef>, SmallError> {
        if !self.in_recovery {
            if let Some(elem) = self.guess_on_hash(op) {
                return Ok(Some(elem));
            }
        }
        let frag = self.ops.get(op).frag;
        let bucket = self.op_bucket(op);
        let (key, part) = {
            let rec = self.ops.get(op);
            (rec.key_words().to_vec(), rec.hash_part)
        };
        let found = self.get_element(frag, bucket, &key, part)?;
        if !self.in_recovery {
            self.search_info_update(op, found);
        }
        Ok(found)
    }

    pub(crate) fn op_bucket(&self, op: OpId) -> u32 {
        let rec = self.ops.get(op);
        let f = self.fragments.get(rec.frag);
        f.bucket_of(f.bucket_hash_of(rec.hash_value))
    }

    fn elem_lk(&self, op: OpId, elem: ElemRef) -> LocalKey {
        let frag = self.ops.get(op).frag;
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        let mut words = [0u32; 2];
        for i in 0..lk_len {
            words[i] = self.elem_local_key_word(elem.page, elem.elem_ptr, elem.forward, i);
        }
        self.unpack_local_key(frag, &words)
    }

    /// Did an effective delete happen earlier in this op's parallel
    /// group?
    fn effective_delete_before(&self, op: OpId) -> bool {
        if !self.ops.get(op).in_lock_queue {
            return false;
        }
        let mut cur = op;
        while !self.ops.get(cur).lock_owner {
            let prev = self.ops.get(cur).prev_parallel;
            if prev == NIL {
                return false;
            }
            cur = prev;
        }
        let group = self.parallel_group(cur);
        let mut last = None;
        for &o in group.iter() {
            if o == op {
                break;
            }
            match self.ops.get(o).kind {
                OpKind::Read | OpKind::Scan => {}
                k => last = Some(k),
            }
        }
        last == Some(OpKind::Delete) || self.ops.get(cur).element_is_disappeared
    }

    // ------------------------------------------------------------------
    // outcomes
    // ------------------------------------------------------------------

    pub(crate) fn refuse(&mut self, op: OpId, kind: ErrorKind) {
        let rec = self.ops.get_mut(op);
        rec.result = Some(OpOutcome::Refused(kind));
        rec.op_state = OpState::Executed;
        debug!("op {} refused: {:?}", op, kind);
    }

    pub(crate) fn complete_ok(&mut self, op: OpId, lk: LocalKey) {
        let rec = self.ops.get_mut(op);
        rec.local_key = lk;
        rec.result = Some(OpOutcome::Done(lk));
        rec.op_state = OpState::Executed;
    }

    fn block(&mut self, op: OpId) {
        let rec = self.ops.get_mut(op);
        rec.op_state = OpState::Blocked;
        rec.result = None;
        debug!("op {} blocked", op);
    }

    /// Re-derive the outcome of an unblocked op without re-searching; the
    /// element fingerprint was moved over by the queue machinery.
    pub(crate) fn restart_op(&mut self, op: OpId) {
        if self.ops.get(op).scan_rec != NIL {
            self.scan_op_unblocked(op);
            return;
        }
        let (kind, disappeared) = {
            let rec = self.ops.get(op);
            (rec.kind, rec.element_is_disappeared)
        };
        let elem = {
            let rec = self.ops.get(op);
            ElemRef {
                page: rec.elem_page,
                con_ptr: rec.elem_container,
                elem_ptr: rec.elem_ptr,
                forward: rec.elem_forward,
            }
        };
        if disappeared {
            match kind {
                OpKind::Insert => self.insert_on_slot(op),
                _ => self.refuse(op, ErrorKind::TupleNotFound),
            }
        } else {
            match kind {
                OpKind::Insert => self.refuse(op, ErrorKind::WriteError),
                _ => {
                    let lk = self.elem_lk(op, elem);
                    self.complete_ok(op, lk);
                }
            }
        }
        self.events.push_back(StoreEvent::OpReady(op));
    }

    // ------------------------------------------------------------------
    // commit / abort
    // ------------------------------------------------------------------

    /// Commit one operation. Inside a checkpoint window a commit may stall
    /// on undo credit; it then completes in arrival order once a group
    /// write confirms, signalled by `CommitDone`.
    pub fn commit_op(&mut self, op: OpId) -> Result<(), SmallError> {
        match self.ops.get(op).op_state {
            OpState::Executed => {}
            OpState::CommitStalled => return Ok(()),
            _ => {
                return Err(SmallError::of(
                    ErrorKind::TooEarlyAccess,
                    "commit of an unfinished operation",
                ))
            }
        }
        let frag = self.ops.get(op).frag;
        if self.fragments.get(frag).create_lcp
            && self.undo_free_pages() < MIN_UNDO_PAGES_AT_COMMIT
        {
            self.ops.get_mut(op).op_state = OpState::CommitStalled;
            self.stalled_commits.push_back(op);
            debug!("commit of op {} stalled on undo credit", op);
            return Ok(());
        }
        self.do_commit(op);
        Ok(())
    }

    pub(crate) fn do_commit(&mut self, op: OpId) {
        let (kind, frag, root, result, in_queue) = {
            let rec = self.ops.get(op);
            (rec.kind, rec.frag, rec.root, rec.result, rec.in_lock_queue)
        };
        if in_queue {
            self.release_from_queue(op, false);
        }
        if let Some(OpOutcome::Done(_)) = result {
            let r = self.roots.get_mut(root);
            r.commit_count += 1;
            match kind {
                OpKind::Insert => {
                    r.no_of_elements += 1;
                    self.fragments.get_mut(frag).slack -= 1;
                    self.check_expand_shrink(frag);
                }
                OpKind::Delete => {
                    r.no_of_elements -= 1;
                    self.fragments.get_mut(frag).slack += 1;
                    self.check_expand_shrink(frag);
                }
                _ => {}
            }
        }
        self.ops.release(op);
    }

    /// Abort one operation; an executed insert physically disappears, a
    /// pending delete is forgotten.
    pub fn abort_op(&mut self, op: OpId) -> Result<(), SmallError> {
        let (state, in_queue, frag) = {
            let rec = self.ops.get(op);
            (rec.op_state, rec.in_lock_queue, rec.frag)
        };
        match state {
            OpState::WaitInQueue => self.remove_from_wait_queue(frag, op),
            _ => {
                if in_queue {
                    self.release_from_queue(op, true);
                }
            }
        }
        self.ops.release(op);
        Ok(())
    }

    /// Physically remove the element and hand the tuple back.
    pub(crate) fn commit_delete(&mut self, op: OpId, elem: ElemRef) {
        let frag = self.ops.get(op).frag;
        let (table_id, fid, lk_len) = {
            let f = self.fragments.get(frag);
            (f.my_table_id, f.my_fid, f.local_key_len as usize)
        };
        let mut words = [0u32; 2];
        for i in 0..lk_len {
            words[i] = self.elem_local_key_word(elem.page, elem.elem_ptr, elem.forward, i);
        }
        let lk = self.unpack_local_key(frag, &words);
        let bucket = self.op_bucket(op);
        if !self.in_recovery {
            crate::database::Database::mut_search_sys().drop_element(elem.page, elem.elem_ptr);
        }
        if let Err(e) = self.delete_element(frag, bucket, elem) {
            debug!("physical delete failed: {}", e);
            return;
        }
        if !self.in_recovery {
            self.tuple_store.deallocate(table_id, fid, lk);
        }
        debug!("element deleted, bucket: {}, local key: {:?}", bucket, lk);
    }

    // ------------------------------------------------------------------
    // fragment wait queue
    // ------------------------------------------------------------------

    pub(crate) fn enqueue_wait(&mut self, frag: FragId, op: OpId) {
        let tail = self.fragments.get(frag).last_wait_in_que_op;
        {
            let rec = self.ops.get_mut(op);
            rec.op_state = OpState::WaitInQueue;
            rec.prev_que = tail;
            rec.next_que = NIL;
        }
        if tail != NIL {
            self.ops.get_mut(tail).next_que = op;
        } else {
            self.fragments.get_mut(frag).first_wait_in_que_op = op;
        }
        self.fragments.get_mut(frag).last_wait_in_que_op = op;
        debug!("op {} parked in fragment wait queue", op);
    }

    fn remove_from_wait_queue(&mut self, frag: FragId, op: OpId) {
        let (prev, next) = {
            let rec = self.ops.get(op);
            (rec.prev_que, rec.next_que)
        };
        if prev != NIL {
            self.ops.get_mut(prev).next_que = next;
        } else {
            self.fragments.get_mut(frag).first_wait_in_que_op = next;
        }
        if next != NIL {
            self.ops.get_mut(next).prev_que = prev;
        } else {
            self.fragments.get_mut(frag).last_wait_in_que_op = prev;
        }
        let f = self.fragments.get_mut(frag);
        if f.sent_wait_in_que_op == op {
            f.sent_wait_in_que_op = next;
        }
    }

    /// Replay parked requests once the stop condition lifted.
    pub(crate) fn drain_wait_queue(&mut self, frag: FragId) {
        loop {
            let f = self.fragments.get(frag);
            if f.stop_que_op {
                return;
            }
            let op = f.first_wait_in_que_op;
            if op == NIL {
                return;
            }
            if self.ops.get(op).kind == OpKind::Insert
                && f.create_lcp
                && self.undo_free_pages() < MIN_UNDO_PAGES_AT_OPERATION
            {
                return;
            }
            self.fragments.get_mut(frag).sent_wait_in_que_op = op;
            self.remove_from_wait_queue(frag, op);
            self.ops.get_mut(op).op_state = OpState::Executed;
            self.execute_request(op);
            if self.ops.get(op).result.is_some() {
                self.events.push_back(StoreEvent::OpReady(op));
            }
        }
    }
}

/// Case folding for fragments with character attributes: the comparison
/// form replaces the raw form before any search.
fn xfrm_word(w: u32) -> u32 {
    let b = w.to_le_bytes();
    u32::from_le_bytes([
        b[0].to_ascii_lowercase(),
        b[1].to_ascii_lowercase(),
        b[2].to_ascii_lowercase(),
        b[3].to_ascii_lowercase(),
    ])
}
