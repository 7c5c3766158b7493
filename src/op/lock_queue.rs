use log::debug;

use crate::{
    op::operation::{LockMode, OpKind},
    page::{container::ElemRef, element},
    store::HashStore,
    types::{FragId, OpId, TransId, NIL},
};

/// Outcome of a lock-queue arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Granted,
    Blocked,
    /// Insert on an element whose queue does not end in a delete of the
    /// same transaction.
    InsertError,
}

/// The per-element lock queues.
///
/// A locked element's header points at the owning operation. The owner
/// heads a parallel queue (same-transaction sharers) and a serial queue
/// of future owners, each of which heads its own parallel queue.
impl HashStore {
    // ------------------------------------------------------------------
    // queue inspection helpers
    // ------------------------------------------------------------------

    pub(crate) fn parallel_group(&self, owner: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        let mut cur = owner;
        while cur != NIL {
            out.push(cur);
            cur = self.ops.get(cur).next_parallel;
        }
        out
    }

    fn parallel_tail(&self, owner: OpId) -> OpId {
        let mut cur = owner;
        while self.ops.get(cur).next_parallel != NIL {
            cur = self.ops.get(cur).next_parallel;
        }
        cur
    }

    fn serial_tail(&self, owner: OpId) -> OpId {
        let mut cur = owner;
        while self.ops.get(cur).next_serial != NIL {
            cur = self.ops.get(cur).next_serial;
        }
        cur
    }

    fn group_only_trans(&self, head: OpId, trans: TransId) -> bool {
        self.parallel_group(head)
            .iter()
            .all(|&o| self.ops.get(o).trans == trans)
    }

    fn group_single_trans(&self, head: OpId) -> Option<TransId> {
        let group = self.parallel_group(head);
        let first = self.ops.get(group[0]).trans;
        if group.iter().all(|&o| self.ops.get(o).trans == first) {
            Some(first)
        } else {
            None
        }
    }

    fn group_all_shared(&self, head: OpId) -> bool {
        self.parallel_group(head)
            .iter()
            .all(|&o| self.ops.get(o).lock_mode == LockMode::Shared)
    }

    /// The effective last write of a parallel group, reads skipped.
    fn last_effective_kind(&self, owner: OpId) -> Option<OpKind> {
        let mut last = None;
        for o in self.parallel_group(owner) {
            match self.ops.get(o).kind {
                OpKind::Read | OpKind::Scan => {}
                k => last = Some(k),
            }
        }
        last
    }

    // ------------------------------------------------------------------
    // linking
    // ------------------------------------------------------------------

    fn append_parallel(&mut self, head: OpId, op: OpId) {
        let tail = self.parallel_tail(head);
        self.ops.get_mut(tail).next_parallel = op;
        let mode = self.ops.get(head).lock_mode;
        let rec = self.ops.get_mut(op);
        rec.prev_parallel = tail;
        rec.next_parallel = NIL;
        // lock mode is normalized upward to the group's strongest
        if mode == LockMode::Exclusive {
            rec.lock_mode = LockMode::Exclusive;
        } else if rec.lock_mode == LockMode::Exclusive {
            self.ops.get_mut(head).lock_mode = LockMode::Exclusive;
        }
    }

    fn append_serial(&mut self, owner: OpId, op: OpId) {
        let tail = self.serial_tail(owner);
        self.ops.get_mut(tail).next_serial = op;
        let rec = self.ops.get_mut(op);
        rec.prev_serial = tail;
        rec.next_serial = NIL;
    }

    fn unlink_parallel(&mut self, op: OpId) {
        let (prev, next) = {
            let rec = self.ops.get(op);
            (rec.prev_parallel, rec.next_parallel)
        };
        if prev != NIL {
            self.ops.get_mut(prev).next_parallel = next;
        }
        if next != NIL {
            self.ops.get_mut(next).prev_parallel = prev;
        }
        let rec = self.ops.get_mut(op);
        rec.prev_parallel = NIL;
        rec.next_parallel = NIL;
    }

    /// Remove a whole serial node (an op heading its own parallel group)
    /// from the serial chain.
    fn unlink_serial(&mut self, op: OpId) {
        let (prev, next) = {
            let rec = self.ops.get(op);
            (rec.prev_serial, rec.next_serial)
        };
        if prev != NIL {
            self.ops.get_mut(prev).next_serial = next;
        }
        if next != NIL {
            self.ops.get_mut(next).prev_serial = prev;
        }
        let rec = self.ops.get_mut(op);
        rec.prev_serial = NIL;
        rec.next_serial = NIL;
    }

    pub(crate) fn insert_lock_owner(&mut self, frag: FragId, op: OpId) {
        let head = self.fragments.get(frag).lock_owners_list;
        self.ops.get_mut(op).next_lock_owner = head;
        self.ops.get_mut(op).prev_lock_owner = NIL;
        if head != NIL {
            self.ops.get_mut(head).prev_lock_owner = op;
        }
        self.fragments.get_mut(frag).lock_owners_list = op;
        self.ops.get_mut(op).lock_owner = true;
    }

    pub(crate) fn remove_lock_owner(&mut self, frag: FragId, op: OpId) {
        let (prev, next) = {
            let rec = self.ops.get(op);
            (rec.prev_lock_owner, rec.next_lock_owner)
        };
        if prev != NIL {
            self.ops.get_mut(prev).next_lock_owner = next;
        } else {
            self.fragments.get_mut(frag).lock_owners_list = next;
        }
        if next != NIL {
            self.ops.get_mut(next).prev_lock_owner = prev;
        }
        let rec = self.ops.get_mut(op);
        rec.prev_lock_owner = NIL;
        rec.next_lock_owner = NIL;
        rec.lock_owner = false;
    }

    // ------------------------------------------------------------------
    // arrival
    // ------------------------------------------------------------------

    /// Take the element's lock for `op`, or queue it. The element header
    /// is already read by the caller; read-committed reads never arrive
    /// here.
    pub(crate) fn acquire_lock(&mut self, op: OpId, elem: ElemRef) -> LockResult {
        let header = self.elem_header(elem);
        if element::is_unlocked(header) {
            self.lock_element(op, elem, header);
            self.ops.get_mut(op).in_lock_queue = true;
            return LockResult::Granted;
        }
        let owner = element::op_of(header);
        let result = if self.ops.get(op).kind.is_writer() {
            self.write_arrival(op, owner)
        } else {
            self.read_arrival(op, owner)
        };
        if result != LockResult::InsertError {
            self.ops.get_mut(op).in_lock_queue = true;
        }
        result
    }

    fn lock_element(&mut self, op: OpId, elem: ElemRef, header: u32) {
        let frag = self.ops.get(op).frag;
        {
            let rec = self.ops.get_mut(op);
            rec.scan_bits = element::scan_bits(header);
            rec.elem_page = elem.page;
            rec.elem_ptr = elem.elem_ptr;
            rec.elem_container = elem.con_ptr;
            rec.elem_forward = elem.forward;
        }
        self.set_elem_header(elem, element::locked(op));
        self.insert_lock_owner(frag, op);
        debug!("element locked by op {}", op);
    }

    fn read_arrival(&mut self, op: OpId, owner: OpId) -> LockResult {
        let trans = self.ops.get(op).trans;

        // our own transaction holds the lock alone: share it
        if self.group_only_trans(owner, trans) {
            self.append_parallel(owner, op);
            self.copy_elem_ref(owner, op);
            return LockResult::Granted;
        }
        // a pure read group with nobody waiting: co-own
        if self.ops.get(owner).lock_mode == LockMode::Shared
            && self.ops.get(owner).next_serial == NIL
        {
            self.append_parallel(owner, op);
            self.copy_elem_ref(owner, op);
            return LockResult::Granted;
        }
        // a waiting group belonging entirely to our transaction
        let mut serial = self.ops.get(owner).next_serial;
        while serial != NIL {
            if self.group_only_trans(serial, trans) {
                self.append_parallel(serial, op);
                self.copy_elem_ref(serial, op);
                return LockResult::Blocked;
            }
            serial = self.ops.get(serial).next_serial;
        }
        // pile onto a waiting all-read group, else open a new node
        let tail = self.serial_tail(owner);
        if tail != owner && self.group_all_shared(tail) && self.ops.get(op).lock_mode == LockMode::Shared
        {
            self.append_parallel(tail, op);
            self.copy_elem_ref(tail, op);
            return LockResult::Blocked;
        }
        self.append_serial(owner, op);
        self.copy_elem_ref(owner, op);
        LockResult::Blocked
    }

    fn write_arrival(&mut self, op: OpId, owner: OpId) -> LockResult {
        let trans = self.ops.get(op).trans;
        if self.group_only_trans(owner, trans) {
            let last = self.last_effective_kind(owner);
            let kind = self.ops.get(op).kind;
            match (kind, last) {
                (OpKind::Insert, Some(OpKind::Delete)) => {}
                (OpKind::Insert, _) => return LockResult::InsertError,
                // a write behind our own delete is converted to insert
                (OpKind::Write, Some(OpKind::Delete)) => {
                    self.ops.get_mut(op).kind = OpKind::Insert;
                }
                _ => {}
            }
            self.append_parallel(owner, op);
            self.copy_elem_ref(owner, op);
            return LockResult::Granted;
        }
        self.append_serial(owner, op);
        self.copy_elem_ref(owner, op);
        LockResult::Blocked
    }

    fn copy_elem_ref(&mut self, from: OpId, to: OpId) {
        let (page, ptr, con, fwd, part) = {
            let rec = self.ops.get(from);
            (
                rec.elem_page,
                rec.elem_ptr,
                rec.elem_container,
                rec.elem_forward,
                rec.hash_part,
            )
        };
        let rec = self.ops.get_mut(to);
        rec.elem_page = page;
        rec.elem_ptr = ptr;
        rec.elem_container = con;
        rec.elem_forward = fwd;
        if rec.kind == OpKind::Scan {
            rec.hash_part = part;
        }
    }

    // ------------------------------------------------------------------
    // commit / abort
    // ------------------------------------------------------------------

    /// Walk the parallel queue once per lock tenure; if the final effect
    /// is a delete, the whole group learns the element is on its way out.
    fn run_delete_check(&mut self, owner: OpId) {
        if self.ops.get(owner).commit_delete_check {
            return;
        }
        let group = self.parallel_group(owner);
        let disappears = self.last_effective_kind(owner) == Some(OpKind::Delete);
        let hash = group
            .iter()
            .map(|&o| self.ops.get(o).hash_value)
            .find(|&h| h != 0)
            .unwrap_or(0);
        for &o in group.iter() {
            let rec = self.ops.get_mut(o);
            rec.commit_delete_check = true;
            if disappears {
                rec.element_is_disappeared = true;
                if rec.hash_value == 0 {
                    rec.hash_value = hash;
                }
            }
        }
    }

    /// Release `op`'s stake in the lock it holds (or shares). Called from
    /// both the commit and the abort path; `aborting` flips the insert
    /// handling.
    pub(crate) fn release_from_queue(&mut self, op: OpId, aborting: bool) {
        let rec_state = {
            let rec = self.ops.get(op);
            (rec.lock_owner, rec.prev_parallel, rec.prev_serial)
        };
        let in_owner_group = rec_state.0 || self.reaches_owner(op);

        if !in_owner_group {
            // still waiting: just leave the queue
            self.remove_waiting_op(op);
            return;
        }

        let owner = self.owner_of_group(op);
        self.run_delete_check(owner);

        if aborting {
            self.apply_abort_semantics(op, owner);
        }

        let frag = self.ops.get(op).frag;
        if self.ops.get(op).lock_owner {
            self.remove_lock_owner(frag, op);
            let next_parallel = self.ops.get(op).next_parallel;
            let next_serial = self.ops.get(op).next_serial;
            if next_parallel != NIL {
                self.transfer_ownership(op, next_parallel);
                self.unlink_parallel(op);
            } else if next_serial != NIL {
                self.release_lock(op, next_serial);
            } else {
                self.final_release(op);
            }
        } else {
            self.unlink_parallel(op);
            // a read leaving a group can unblock a same-transaction
            // upgrade waiting at the serial head
            let owner_now = self.owner_of_group_head(owner, op);
            if owner_now != NIL {
                self.try_lock_upgrade(owner_now);
            }
        }
    }

    fn reaches_owner(&self, op: OpId) -> bool {
        let mut cur = op;
        loop {
            let rec = self.ops.get(cur);
            if rec.lock_owner {
                return true;
            }
            if rec.prev_serial != NIL {
                return false;
            }
            if rec.prev_parallel == NIL {
                return false;
            }
            cur = rec.prev_parallel;
        }
    }

    fn owner_of_group(&self, op: OpId) -> OpId {
        let mut cur = op;
        while !self.ops.get(cur).lock_owner {
            let prev = self.ops.get(cur).prev_parallel;
            debug_assert!(prev != NIL);
            cur = prev;
        }
        cur
    }

    /// The group head after `leaving` was removed; NIL when the group is
    /// gone entirely.
    fn owner_of_group_head(&self, owner: OpId, leaving: OpId) -> OpId {
        if owner == leaving {
            NIL
        } else {
            owner
        }
    }

    /// A blocked op leaves its serial node or joined group.
    fn remove_waiting_op(&mut self, op: OpId) {
        let (prev_serial, next_serial, prev_parallel) = {
            let rec = self.ops.get(op);
            (rec.prev_serial, rec.next_serial, rec.prev_parallel)
        };
        if prev_parallel != NIL {
            // joined someone else's waiting group
            self.unlink_parallel(op);
            return;
        }
        if prev_serial != NIL || next_serial != NIL {
            // heads its own serial node: the rest of its parallel group
            // (if any) inherits the node position
            let next_in_group = self.ops.get(op).next_parallel;
            if next_in_group != NIL {
                self.unlink_parallel(op);
                let (ps, ns) = (prev_serial, next_serial);
                if ps != NIL {
                    self.ops.get_mut(ps).next_serial = next_in_group;
                }
                self.ops.get_mut(next_in_group).prev_serial = ps;
                self.ops.get_mut(next_in_group).next_serial = ns;
                if ns != NIL {
                    self.ops.get_mut(ns).prev_serial = next_in_group;
                }
                let rec = self.ops.get_mut(op);
                rec.prev_serial = NIL;
                rec.next_serial = NIL;
            } else {
                self.unlink_serial(op);
            }
        }
    }

    /// Aborting an insert converts it to a physical delete on release;
    /// aborting anything else leaves the element as it was.
    fn apply_abort_semantics(&mut self, op: OpId, owner: OpId) {
        let (kind, insert_done) = {
            let rec = self.ops.get(op);
            (rec.kind, rec.insert_is_done)
        };
        if kind == OpKind::Insert && insert_done {
            // did an earlier delete of the same tenure free this slot?
            let group = self.parallel_group(owner);
            let me = group.iter().position(|&o| o == op).unwrap_or(0);
            let prior_delete = group[..me]
                .iter()
                .rev()
                .find(|&&o| self.ops.get(o).kind == OpKind::Delete)
                .cloned();
            let frag = self.ops.get(op).frag;
            match prior_delete {
                Some(del) => {
                    // the element reverts to the deleted row's local key;
                    // the aborted insert's tuple goes back at once
                    let (table_id, fid) = {
                        let f = self.fragments.get(frag);
                        (f.my_table_id, f.my_fid)
                    };
                    let my_lk = self.ops.get(op).local_key;
                    if !self.in_recovery {
                        self.tuple_store.deallocate(table_id, fid, my_lk);
                    }
                    let lk = self.ops.get(del).local_key;
                    let words = self.pack_local_key(frag, lk);
                    let (page, ptr, fwd) = {
                        let rec = self.ops.get(op);
                        (rec.elem_page, rec.elem_ptr, rec.elem_forward)
                    };
                    let lk_len = self.fragments.get(frag).local_key_len as usize;
                    self.set_elem_local_key(page, ptr, fwd, &words[..lk_len]);
                }
                None => {
                    // fresh insert: the element itself must go
                    for &o in self.parallel_group(owner).iter() {
                        self.ops.get_mut(o).element_is_disappeared = true;
                    }
                }
            }
        } else if kind == OpKind::Delete {
            // the delete never happened: the group forgets the verdict
            for &o in self.parallel_group(owner).iter() {
                let rec = self.ops.get_mut(o);
                rec.element_is_disappeared = false;
            }
        }
    }

    /// The owner leaves but its parallel group lives on.
    fn transfer_ownership(&mut self, old: OpId, new: OpId) {
        let frag = self.ops.get(old).frag;
        let (elem, scan_bits, disappeared, next_serial) = {
            let rec = self.ops.get(old);
            (
                ElemRef {
                    page: rec.elem_page,
                    con_ptr: rec.elem_container,
                    elem_ptr: rec.elem_ptr,
                    forward: rec.elem_forward,
                },
                rec.scan_bits,
                rec.element_is_disappeared,
                rec.next_serial,
            )
        };
        {
            let rec = self.ops.get_mut(new);
            rec.scan_bits = scan_bits;
            rec.element_is_disappeared = disappeared;
            rec.next_serial = next_serial;
            rec.prev_serial = NIL;
        }
        if next_serial != NIL {
            self.ops.get_mut(next_serial).prev_serial = new;
        }
        self.ops.get_mut(old).next_serial = NIL;
        self.set_elem_header(elem, element::locked(new));
        self.insert_lock_owner(frag, new);
        self.try_lock_upgrade(new);
    }

    /// Promote the first serial node to lock owner and restart its group.
    fn release_lock(&mut self, old: OpId, promoted: OpId) {
        let frag = self.ops.get(old).frag;
        let (elem, scan_bits, disappeared, hash_value, serial_rest) = {
            let rec = self.ops.get(old);
            (
                ElemRef {
                    page: rec.elem_page,
                    con_ptr: rec.elem_container,
                    elem_ptr: rec.elem_ptr,
                    forward: rec.elem_forward,
                },
                rec.scan_bits,
                rec.element_is_disappeared,
                rec.hash_value,
                self.ops.get(promoted).next_serial,
            )
        };
        {
            let rec = self.ops.get_mut(promoted);
            rec.prev_serial = NIL;
            rec.next_serial = serial_rest;
            rec.scan_bits = scan_bits;
            rec.lock_owner = false;
        }
        self.ops.get_mut(old).next_serial = NIL;

        // move the element fingerprint and the disappearance verdict over
        let group = self.parallel_group(promoted);
        for &o in group.iter() {
            let rec = self.ops.get_mut(o);
            rec.elem_page = elem.page;
            rec.elem_ptr = elem.elem_ptr;
            rec.elem_container = elem.con_ptr;
            rec.elem_forward = elem.forward;
            if disappeared {
                rec.element_is_disappeared = true;
                if rec.hash_value == 0 {
                    rec.hash_value = hash_value;
                }
            }
        }
        self.set_elem_header(elem, element::locked(promoted));
        self.insert_lock_owner(frag, promoted);
        debug!("lock released to op {}, restarting {} ops", promoted, group.len());
        for o in group {
            self.restart_op(o);
        }
        self.try_lock_upgrade(promoted);
    }

    /// Both queues are empty: unlock the element, or finish a pending
    /// physical delete.
    fn final_release(&mut self, op: OpId) {
        let (disappeared, elem, scan_bits, hash_part) = {
            let rec = self.ops.get(op);
            (
                rec.element_is_disappeared,
                ElemRef {
                    page: rec.elem_page,
                    con_ptr: rec.elem_container,
                    elem_ptr: rec.elem_ptr,
                    forward: rec.elem_forward,
                },
                rec.scan_bits,
                rec.hash_part,
            )
        };
        if disappeared {
            self.commit_delete(op, elem);
        } else {
            self.set_elem_header(elem, element::unlocked(hash_part, scan_bits));
        }
    }

    /// When a read bows out: if the remaining parallel group and the first
    /// serial node belong to one and the same transaction, splice the
    /// waiters into the owning group and wake them.
    fn try_lock_upgrade(&mut self, owner: OpId) {
        let serial_head = self.ops.get(owner).next_serial;
        if serial_head == NIL {
            return;
        }
        let own_trans = match self.group_single_trans(owner) {
            Some(t) => t,
            None => return,
        };
        match self.group_single_trans(serial_head) {
            Some(t) if t == own_trans => {}
            _ => return,
        }

        // splice the serial node's parallel queue onto the owner's tail
        let rest = self.ops.get(serial_head).next_serial;
        self.ops.get_mut(owner).next_serial = rest;
        if rest != NIL {
            self.ops.get_mut(rest).prev_serial = owner;
        }
        {
            let rec = self.ops.get_mut(serial_head);
            rec.prev_serial = NIL;
            rec.next_serial = NIL;
        }
        let spliced = self.parallel_group(serial_head);
        let strongest = spliced
            .iter()
            .chain(self.parallel_group(owner).iter())
            .any(|&o| self.ops.get(o).lock_mode == LockMode::Exclusive);
        let tail = self.parallel_tail(owner);
        self.ops.get_mut(tail).next_parallel = serial_head;
        self.ops.get_mut(serial_head).prev_parallel = tail;
        if strongest {
            for &o in self.parallel_group(owner).iter() {
                self.ops.get_mut(o).lock_mode = LockMode::Exclusive;
            }
        }
        debug!("lock upgraded, {} ops joined owner {}", spliced.len(), owner);
        for o in spliced {
            self.copy_elem_ref(owner, o);
            self.restart_op(o);
        }
    }
}
