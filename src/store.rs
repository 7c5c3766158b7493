use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use crate::{
    config::StoreConfig,
    consts::*,
    error::{ErrorKind, SmallError},
    frag::{FragState, Fragment, OverflowRec, RootFragment, RootState},
    lcp::{file_queue::FileQueue, lcp::LcpConn, undo::UndoLog},
    op::operation::{OpOutcome, OpState, OperationRec},
    page::{DirKind, DirectoryPools, PageStore},
    pool::RecordPool,
    scan::scan::ScanRec,
    tuple_store::TupleStore,
    types::*,
};

/// Deferred continuations of the cooperative block: long walks re-enqueue
/// themselves here instead of running to exhaustion in one call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Work {
    Expand(FragId),
    Shrink(FragId),
    LcpHoldOps { conn: u32 },
    LcpCopyNext { frag: FragId },
    DrainWaitQueue(FragId),
}

/// Completions surfaced to the embedder, polled via `take_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A blocked operation got its outcome; inspect with `op_outcome`.
    OpReady(OpId),
    /// A stalled commit went through; the record is released.
    CommitDone(OpId),
    /// A previously rate-limited scan has rows again.
    ScanRowsAvailable(ScanId),
    LcpDone(RootFragId),
    RestoreDone(RootFragId),
}

/// Parameters of one root fragment (two local fragments).
#[derive(Debug, Clone)]
pub struct FragmentParams {
    pub table_id: u32,
    /// Primary-key length in words, at most 8.
    pub key_length: u32,
    /// Local-key length in words: 1 or 2.
    pub local_key_len: u32,
    pub max_load_factor: u32,
    pub min_load_factor: u32,
    pub has_char_attr: bool,
}

impl Default for FragmentParams {
    fn default() -> Self {
        Self {
            table_id: 0,
            key_length: 2,
            local_key_len: 1,
            max_load_factor: 8,
            min_load_factor: 6,
            has_char_attr: false,
        }
    }
}

/// The store block. Single-threaded and cooperative: every public method
/// runs to completion, long operations continue through the work queue
/// (`run_pending`) and the I/O queue (`pump_io`).
pub struct HashStore {
    pub(crate) config: StoreConfig,
    pub(crate) pages: PageStore,
    pub(crate) dirs: DirectoryPools,
    pub(crate) fragments: RecordPool<Fragment>,
    pub(crate) roots: RecordPool<RootFragment>,
    pub(crate) ops: RecordPool<OperationRec>,
    pub(crate) scans: RecordPool<ScanRec>,
    pub(crate) overflow_recs: RecordPool<OverflowRec>,
    pub(crate) lcp_conns: RecordPool<LcpConn>,
    pub(crate) tables: HashMap<u32, Vec<RootFragId>>,
    pub(crate) tuple_store: Box<dyn TupleStore>,
    pub(crate) undo: UndoLog,
    pub(crate) io: FileQueue,
    pub(crate) work: VecDeque<Work>,
    pub(crate) events: VecDeque<StoreEvent>,
    /// Commits accepted while the undo ring was too full, in arrival
    /// order.
    pub(crate) stalled_commits: VecDeque<OpId>,
    /// Pages already captured in the undo log this checkpoint window.
    pub(crate) lcp_dirty: HashSet<(FragId, PageId)>,
    /// Set while executing the undo log at restart; suppresses the tuple
    /// deallocation hook and the adaptive hash.
    pub(crate) in_recovery: bool,
}

impl HashStore {
    pub fn new(config: StoreConfig, tuple_store: Box<dyn TupleStore>) -> Self {
        info!("store starting, pages: {}", config.page8);
        Self {
            pages: PageStore::new(config.page8),
            dirs: DirectoryPools::new(config.dir_range_size, config.dir_array_size),
            fragments: RecordPool::new(config.fragment_size, ErrorKind::OutOfFragmentRecords),
            roots: RecordPool::new(config.root_frag, ErrorKind::OutOfFragmentRecords),
            ops: RecordPool::new(config.op_recs, ErrorKind::OutOfConnections),
            scans: RecordPool::new(config.scan, ErrorKind::OutOfScanRecords),
            overflow_recs: RecordPool::new(config.overflow_recs, ErrorKind::OutOfOverflowRecords),
            lcp_conns: RecordPool::new(config.root_frag, ErrorKind::OutOfConnections),
            tables: HashMap::new(),
            tuple_store,
            undo: UndoLog::new(),
            io: FileQueue::new(),
            work: VecDeque::new(),
            events: VecDeque::new(),
            stalled_commits: VecDeque::new(),
            lcp_dirty: HashSet::new(),
            in_recovery: false,
            config,
        }
    }

    // ------------------------------------------------------------------
    // cooperative scheduling
    // ------------------------------------------------------------------

    /// Execute one queued continuation. Returns false when idle.
    pub fn run_pending(&mut self) -> bool {
        let work = match self.work.pop_front() {
            Some(w) => w,
            None => return false,
        };
        debug!("continuing: {:?}", work);
        match work {
            Work::Expand(frag) => self.expand_step(frag),
            Work::Shrink(frag) => self.shrink_step(frag),
            Work::LcpHoldOps { conn } => self.lcp_hold_ops_step(conn),
            Work::LcpCopyNext { frag } => self.lcp_copy_step(frag),
            Work::DrainWaitQueue(frag) => self.drain_wait_queue(frag),
        }
        true
    }

    /// Drain all queued continuations and I/O.
    pub fn run(&mut self) {
        loop {
            let worked = self.run_pending();
            let pumped = self.pump_io();
            if !worked && !pumped {
                break;
            }
        }
    }

    pub fn take_event(&mut self) -> Option<StoreEvent> {
        self.events.pop_front()
    }

    pub(crate) fn push_work(&mut self, work: Work) {
        self.work.push_back(work);
    }

    // ------------------------------------------------------------------
    // fragment lifecycle
    // ------------------------------------------------------------------

    pub fn add_fragment(&mut self, params: FragmentParams) -> Result<RootFragId, SmallError> {
        assert!(params.key_length >= 1 && params.key_length <= 8);
        assert!(params.local_key_len >= 1 && params.local_key_len <= 2);
        assert!(params.max_load_factor > params.min_load_factor);

        if !self.tables.contains_key(&params.table_id)
            && self.tables.len() as u32 >= self.config.table
        {
            return Err(SmallError::of(ErrorKind::OutOfConnections, "table pool exhausted"));
        }

        let root = self.roots.seize()?;
        let mut frags = [NIL; 2];
        for i in 0..2 {
            match self.init_local_fragment(root, &params, (root << 1) | i as u32) {
                Ok(f) => frags[i] = f,
                Err(e) => {
                    // roll the half-built root back
                    for &f in frags.iter().take(i) {
                        self.release_fragment(f);
                    }
                    self.roots.release(root);
                    return Err(e);
                }
            }
        }

        let r = self.roots.get_mut(root);
        r.state = RootState::Active;
        r.table_id = params.table_id;
        r.frags = frags;
        r.frag_ids = [root << 1, (root << 1) | 1];
        r.no_of_elements = 0;
        r.commit_count = 0;

        self.tables
            .entry(params.table_id)
            .or_insert_with(Vec::new)
            .push(root);
        info!(
            "fragment added, root: {}, table: {}, frags: {:?}",
            root, params.table_id, frags
        );
        Ok(root)
    }

    fn init_local_fragment(
        &mut self,
        root: u32,
        params: &FragmentParams,
        fid: u32,
    ) -> Result<FragId, SmallError> {
        let frag = self.fragments.seize()?;
        let directory = self.dirs.seize_range()?;
        let overflow_dir = match self.dirs.seize_range() {
            Ok(d) => d,
            Err(e) => {
                self.dirs.release_range(directory);
                self.fragments.release(frag);
                return Err(e);
            }
        };
        let page = match self.pages.seize() {
            Ok(p) => p,
            Err(e) => {
                self.dirs.release_range(directory);
                self.dirs.release_range(overflow_dir);
                self.fragments.release(frag);
                return Err(e);
            }
        };
        self.pages.get_mut(page).init_normal(0, frag);
        self.dirs.set_page_ref(directory, 0, page)?;

        let f = self.fragments.get_mut(frag);
        f.frag_state = FragState::Active;
        f.my_root = root;
        f.my_fid = fid;
        f.my_table_id = params.table_id;
        f.directory = directory;
        f.overflow_dir = overflow_dir;
        f.dir_size = 1;
        f.key_length = params.key_length;
        f.local_key_len = params.local_key_len;
        f.element_length = ELEM_HEAD_SIZE + params.local_key_len;
        f.max_load_factor = params.max_load_factor;
        f.min_load_factor = params.min_load_factor;
        f.has_char_attr = params.has_char_attr;
        f.slack = (f.maxp as i64 + 1) * params.max_load_factor as i64;
        f.slack_check =
            f.bucket_count() as i64 * (params.max_load_factor - params.min_load_factor) as i64;
        Ok(frag)
    }

    /// Tear one root fragment down and hand every resource back. Only
    /// legal when no operation or scan is active on it.
    pub fn drop_fragment(&mut self, root: RootFragId) -> Result<(), SmallError> {
        let r = self.roots.get(root);
        if r.scans.iter().any(|&s| s != NIL) {
            return Err(SmallError::new("fragment has active scans"));
        }
        let frags = r.frags;
        let table_id = r.table_id;
        for &f in frags.iter() {
            if self.fragments.get(f).lock_owners_list != NIL {
                return Err(SmallError::new("fragment has lock owners"));
            }
        }
        for &f in frags.iter() {
            self.release_fragment(f);
        }
        if let Some(list) = self.tables.get_mut(&table_id) {
            list.retain(|&x| x != root);
        }
        self.roots.release(root);
        Ok(())
    }

    fn release_fragment(&mut self, frag: FragId) {
        let (directory, overflow_dir, dir_size, last_over) = {
            let f = self.fragments.get(frag);
            (f.directory, f.overflow_dir, f.dir_size, f.last_over_index)
        };
        for logical in 0..dir_size {
            if let Some(p) = self.dirs.get_page_ref(directory, logical) {
                self.drop_page_hash_when_freed(p);
                self.pages.release(p);
            }
        }
        for logical in 0..last_over {
            if let Some(p) = self.dirs.get_page_ref(overflow_dir, logical) {
                self.drop_page_hash_when_freed(p);
                self.pages.release(p);
            }
        }
        let mut rec = self.fragments.get(frag).first_overflow_rec;
        while rec != NIL {
            let next = self.overflow_recs.get(rec).next;
            self.overflow_recs.release(rec);
            rec = next;
        }
        let mut rec = self.fragments.get(frag).first_free_dir_index_rec;
        while rec != NIL {
            let next = self.overflow_recs.get(rec).next;
            self.overflow_recs.release(rec);
            rec = next;
        }
        self.dirs.release_range(directory);
        self.dirs.release_range(overflow_dir);
        self.fragments.release(frag);
    }

    // ------------------------------------------------------------------
    // page map helpers
    // ------------------------------------------------------------------

    pub(crate) fn frag_dir(&self, frag: FragId, kind: DirKind) -> u32 {
        let f = self.fragments.get(frag);
        match kind {
            DirKind::Normal => f.directory,
            DirKind::Overflow => f.overflow_dir,
        }
    }

    pub(crate) fn try_frag_page(
        &self,
        frag: FragId,
        kind: DirKind,
        logical: LogicalPageId,
    ) -> Option<PageId> {
        self.dirs.get_page_ref(self.frag_dir(frag, kind), logical)
    }

    pub(crate) fn frag_page(
        &self,
        frag: FragId,
        kind: DirKind,
        logical: LogicalPageId,
    ) -> Result<PageId, SmallError> {
        self.try_frag_page(frag, kind, logical).ok_or_else(|| {
            SmallError::of(
                ErrorKind::InvariantViolation,
                &format!("page {:?}/{} not mapped", kind, logical),
            )
        })
    }

    pub(crate) fn set_frag_page(
        &mut self,
        frag: FragId,
        kind: DirKind,
        logical: LogicalPageId,
        page: PageId,
    ) -> Result<(), SmallError> {
        let dir = self.frag_dir(frag, kind);
        self.dirs.set_page_ref(dir, logical, page)
    }

    pub(crate) fn clear_frag_page(&mut self, frag: FragId, kind: DirKind, logical: LogicalPageId) {
        let dir = self.frag_dir(frag, kind);
        self.dirs.clear_page_ref(dir, logical);
    }

    // ------------------------------------------------------------------
    // observers used by embedders and tests
    // ------------------------------------------------------------------

    pub fn op_outcome(&self, op: OpId) -> OpOutcome {
        let rec = self.ops.get(op);
        match rec.op_state {
            OpState::Blocked | OpState::WaitInQueue => OpOutcome::Pending,
            _ => rec.result.unwrap_or(OpOutcome::Pending),
        }
    }

    pub fn no_of_elements(&self, root: RootFragId) -> i64 {
        self.roots.get(root).no_of_elements
    }

    pub fn commit_count(&self, root: RootFragId) -> u64 {
        self.roots.get(root).commit_count
    }

    pub fn bucket_count(&self, root: RootFragId) -> (u32, u32) {
        let r = self.roots.get(root);
        (
            self.fragments.get(r.frags[0]).bucket_count(),
            self.fragments.get(r.frags[1]).bucket_count(),
        )
    }

    pub fn tuple_store(&self) -> &dyn TupleStore {
        &*self.tuple_store
    }

    // ------------------------------------------------------------------
    // integrity
    // ------------------------------------------------------------------

    /// Assert the structural invariants of one root fragment. Test-facing;
    /// panics on violation with a description of the broken invariant.
    pub fn check_integrity(&self, root: RootFragId) {
        let r = self.roots.get(root);
        let free = self.pages.free_bitmap();

        for &frag_id in r.frags.iter() {
            let f = self.fragments.get(frag_id);
            assert_eq!(f.bucket_count(), f.p + f.maxp + 1);
            assert!(f.p <= f.maxp, "split pointer beyond maxp");
            assert!(
                crate::utils::is_all_ones(f.maxp),
                "maxp {} is not of the form 2^n - 1",
                f.maxp
            );
            assert_eq!(f.dir_size, (f.bucket_count() + 63) >> K);

            // pages reachable from the directories are not on the free
            // list, and their self-descriptions hold
            let mut containers_per_page: HashMap<PageId, u32> = HashMap::new();
            let mut elements_per_page: HashMap<PageId, u32> = HashMap::new();
            for logical in 0..f.dir_size {
                let page = self
                    .try_frag_page(frag_id, DirKind::Normal, logical)
                    .expect("bucket page missing");
                assert!(!free.get(page as usize).unwrap(), "page both free and mapped");
                assert!(self.pages.get(page).checksum_ok(), "page checksum broken");
                *containers_per_page.entry(page).or_insert(0) += NO_CONTAINERS;
            }
            for logical in 0..f.last_over_index {
                if let Some(page) = self.try_frag_page(frag_id, DirKind::Overflow, logical) {
                    assert!(!free.get(page as usize).unwrap(), "page both free and mapped");
                    assert!(self.pages.get(page).checksum_ok(), "page checksum broken");
                    containers_per_page.entry(page).or_insert(0);
                }
            }

            for bucket in 0..f.bucket_count() {
                for walked in self.walk_bucket(frag_id, bucket) {
                    *elements_per_page.entry(walked.elem.page).or_insert(0) += 1;
                    if crate::page::element::is_locked(walked.header) {
                        let op = crate::page::element::op_of(walked.header);
                        let rec = self.ops.get(op);
                        let in_queue = rec.prev_parallel != NIL || rec.prev_serial != NIL;
                        assert!(
                            rec.lock_owner ^ in_queue,
                            "locked element points at op {} that is neither owner nor queued",
                            op
                        );
                    }
                }
                for (page, con_count) in self.bucket_chain_container_counts(frag_id, bucket) {
                    *containers_per_page.entry(page).or_insert(0) += con_count;
                }
            }

            for (page, expect) in containers_per_page {
                assert_eq!(
                    self.pages.get(page).alloc_containers(),
                    expect,
                    "allocContainers mismatch on page {}",
                    page
                );
            }
            for (page, expect) in elements_per_page {
                assert_eq!(
                    self.pages.get(page).elem_count(),
                    expect,
                    "element count mismatch on page {}",
                    page
                );
            }

            // the owners list and the wait queue are disjoint
            let mut owners = Vec::new();
            let mut p = f.lock_owners_list;
            while p != NIL {
                owners.push(p);
                assert!(self.ops.get(p).lock_owner);
                p = self.ops.get(p).next_lock_owner;
            }
            let mut q = f.first_wait_in_que_op;
            while q != NIL {
                assert!(!owners.contains(&q), "op {} in owners list and wait queue", q);
                q = self.ops.get(q).next_que;
            }
        }

        // scan op accounting
        let allocated: u32 = r
            .scans
            .iter()
            .filter(|&&s| s != NIL)
            .map(|&s| self.scans.get(s).ops_allocated)
            .sum();
        let with_scan_ptr = self
            .ops
            .live()
            .iter()
            .filter(|&&o| {
                let rec = self.ops.get(o);
                rec.scan_rec != NIL && rec.root == root
            })
            .count() as u32;
        assert_eq!(allocated, with_scan_ptr, "scan op accounting broken");
    }
}
