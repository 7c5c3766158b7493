use crate::{
    error::ErrorKind,
    types::{FragId, LocalKey, OpId, PageId, ScanId, TransId, NIL},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Insert,
    Update,
    /// Write is an upsert: it becomes an insert when the row is missing.
    Write,
    Delete,
    Scan,
}

impl Default for OpKind {
    fn default() -> Self {
        OpKind::Read
    }
}

impl OpKind {
    pub fn is_writer(&self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Write | OpKind::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Free,
    /// Executed; result available.
    Executed,
    /// Waiting in an element's lock queue.
    Blocked,
    /// Parked in the fragment wait queue.
    WaitInQueue,
    /// Commit accepted but stalled on undo-ring credit.
    CommitStalled,
}

impl Default for OpState {
    fn default() -> Self {
        OpState::Free
    }
}

/// What a request or a queued restart produced. `Pending` is only visible
/// for blocked operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Pending,
    Done(LocalKey),
    Refused(ErrorKind),
}

/// Per-request state. Pooled; all links are pool indices.
pub struct OperationRec {
    pub op_state: OpState,
    pub kind: OpKind,
    pub lock_mode: LockMode,
    pub trans: TransId,
    pub read_committed: bool,

    pub key: [u32; 8],
    pub tup_key_len: u32,
    pub xfrm_key_len: u32,
    pub hash_value: u32,
    pub hash_part: u32,

    pub root: u32,
    pub frag: FragId,
    pub fid: u32,

    // Fingerprint of the element this operation holds or awaits.
    pub elem_page: PageId,
    pub elem_ptr: u32,
    pub elem_container: u32,
    pub elem_forward: bool,
    pub local_key: LocalKey,

    // Lock-queue links.
    pub next_parallel: OpId,
    pub prev_parallel: OpId,
    pub next_serial: OpId,
    pub prev_serial: OpId,
    pub next_lock_owner: OpId,
    pub prev_lock_owner: OpId,
    pub next_que: OpId,
    pub prev_que: OpId,

    pub lock_owner: bool,
    pub in_lock_queue: bool,
    pub element_is_disappeared: bool,
    pub insert_is_done: bool,
    pub commit_delete_check: bool,

    // Scan attachment.
    pub scan_rec: ScanId,
    pub scan_bits: u32,
    pub next_scan_op: OpId,
    pub prev_scan_op: OpId,

    pub result: Option<OpOutcome>,
}

impl Default for OperationRec {
    fn default() -> Self {
        Self {
            op_state: OpState::Free,
            kind: OpKind::Read,
            lock_mode: LockMode::Shared,
            trans: TransId(0, 0),
            read_committed: false,
            key: [0; 8],
            tup_key_len: 0,
            xfrm_key_len: 0,
            hash_value: 0,
            hash_part: 0,
            root: NIL,
            frag: NIL,
            fid: 0,
            elem_page: NIL,
            elem_ptr: 0,
            elem_container: 0,
            elem_forward: true,
            local_key: LocalKey::default(),
            next_parallel: NIL,
            prev_parallel: NIL,
            next_serial: NIL,
            prev_serial: NIL,
            next_lock_owner: NIL,
            prev_lock_owner: NIL,
            next_que: NIL,
            prev_que: NIL,
            lock_owner: false,
            in_lock_queue: false,
            element_is_disappeared: false,
            insert_is_done: false,
            commit_delete_check: false,
            scan_rec: NIL,
            scan_bits: 0,
            next_scan_op: NIL,
            prev_scan_op: NIL,
            result: None,
        }
    }
}

impl OperationRec {
    pub fn key_words(&self) -> &[u32] {
        &self.key[..self.xfrm_key_len as usize]
    }
}
