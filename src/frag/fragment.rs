use crate::{
    adaptive::SearchInfo,
    consts::{K, MAX_PARALLEL_SCANS_PER_FRAG},
    io::SmallFile,
    types::{FragId, LogicalPageId, OpId, PageId, ScanId, NIL},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragState {
    Free,
    Active,
    LcpSendPages,
    LcpSendOverPages,
    LcpSendZeroPage,
    LcpCloseData,
    SrReadPages,
    SrReadOverPages,
}

impl Default for FragState {
    fn default() -> Self {
        FragState::Free
    }
}

/// One half of a root fragment: the unit of hashing, scanning and
/// checkpointing. All information about the hash table lives here.
pub struct Fragment {
    pub frag_state: FragState,
    pub my_root: u32,
    pub my_fid: u32,
    pub my_table_id: u32,

    // Linear-hashing parameters. `p + maxp + 1` is the current number of
    // buckets; `maxp` is the largest 2^n - 1 below that count. `slack`
    // tracks the remaining insert headroom; together with the load-factor
    // bounds it decides when to expand or shrink.
    pub p: u32,
    pub maxp: u32,
    pub k_bits: u32,
    pub hash_check_bit: u32,
    pub lh_dir_bits: u32,
    pub lh_frag_bits: u32,
    pub slack: i64,
    pub slack_check: i64,
    pub max_load_factor: u32,
    pub min_load_factor: u32,
    pub expand_counter: u32,
    pub expand_flag: bool,

    // Element geometry.
    pub element_length: u32,
    pub key_length: u32,
    pub local_key_len: u32,
    pub has_char_attr: bool,

    // Page maps.
    pub directory: u32,
    pub dir_size: u32,
    pub overflow_dir: u32,
    pub last_over_index: u32,

    // Lock bookkeeping. The owners list feeds the checkpoint's op-undo
    // records; the wait queue parks arrivals while the queue is stopped.
    pub lock_owners_list: OpId,
    pub first_wait_in_que_op: OpId,
    pub last_wait_in_que_op: OpId,
    pub sent_wait_in_que_op: OpId,
    pub stop_que_op: bool,

    // Overflow pages with free containers, and released directory slots
    // kept for index reuse. One overflow record is on at most one list.
    pub first_overflow_rec: u32,
    pub last_overflow_rec: u32,
    pub first_free_dir_index_rec: u32,

    // Checkpoint state.
    pub create_lcp: bool,
    pub local_checkp_id: u32,
    pub data_file: Option<SmallFile>,
    pub zero_page: PageId,
    pub copy_pages: [PageId; 8],
    pub active_data_page: u32,
    pub active_data_file_page: u32,
    pub lcp_dir_index: u32,
    pub lcp_max_dir_index: u32,
    pub lcp_max_over_dir_index: u32,
    pub no_stored_pages: u32,
    pub no_of_stored_over_pages: u32,
    pub prev_undo_position: u32,
    /// Overflow pages emptied inside the checkpoint window; their release
    /// is deferred until the window passes them.
    pub deferred_page_release: Vec<LogicalPageId>,

    // Restore state.
    pub next_alloc_page: u32,
    pub no_of_expected_pages: u32,
    pub loading: bool,

    pub search_info: SearchInfo,
}

impl Default for Fragment {
    fn default() -> Self {
        Self {
            frag_state: FragState::Free,
            my_root: NIL,
            my_fid: 0,
            my_table_id: 0,
            p: 0,
            maxp: (1 << K) - 1,
            k_bits: K,
            hash_check_bit: K,
            lh_dir_bits: 0,
            lh_frag_bits: 1,
            slack: 0,
            slack_check: 0,
            max_load_factor: 8,
            min_load_factor: 6,
            expand_counter: 0,
            expand_flag: false,
            element_length: 2,
            key_length: 1,
            local_key_len: 1,
            has_char_attr: false,
            directory: NIL,
            dir_size: 0,
            overflow_dir: NIL,
            last_over_index: 0,
            lock_owners_list: NIL,
            first_wait_in_que_op: NIL,
            last_wait_in_que_op: NIL,
            sent_wait_in_que_op: NIL,
            stop_que_op: false,
            first_overflow_rec: NIL,
            last_overflow_rec: NIL,
            first_free_dir_index_rec: NIL,
            create_lcp: false,
            local_checkp_id: 0,
            data_file: None,
            zero_page: NIL,
            copy_pages: [NIL; 8],
            active_data_page: 0,
            active_data_file_page: 0,
            lcp_dir_index: 0,
            lcp_max_dir_index: 0,
            lcp_max_over_dir_index: 0,
            no_stored_pages: 0,
            no_of_stored_over_pages: 0,
            prev_undo_position: NIL,
            deferred_page_release: Vec::new(),
            next_alloc_page: 0,
            no_of_expected_pages: 0,
            loading: false,
            search_info: SearchInfo::default(),
        }
    }
}

impl Fragment {
    pub fn bucket_count(&self) -> u32 {
        self.p + self.maxp + 1
    }

    /// Bucket of a hash value, after the fragment bit has been shifted
    /// out. A bucket below the split pointer has already been split and
    /// is re-addressed with one more bit.
    pub fn bucket_of(&self, bucket_hash: u32) -> u32 {
        let mut addr = bucket_hash & self.maxp;
        if addr < self.p {
            addr = bucket_hash & ((self.maxp << 1) | 1);
        }
        addr
    }

    /// (logical page, container slot) of a bucket.
    pub fn bucket_position(&self, bucket: u32) -> (LogicalPageId, u32) {
        (bucket >> self.k_bits, bucket & ((1 << self.k_bits) - 1))
    }

    pub fn bucket_hash_of(&self, hash: u32) -> u32 {
        hash >> self.lh_frag_bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    Free,
    Active,
    LcpCreation,
}

impl Default for RootState {
    fn default() -> Self {
        RootState::Free
    }
}

/// Two fragments form a root fragment; counters and scans are tracked at
/// the root.
pub struct RootFragment {
    pub state: RootState,
    pub table_id: u32,
    pub frags: [FragId; 2],
    pub frag_ids: [u32; 2],
    pub no_of_elements: i64,
    pub commit_count: u64,
    pub scans: [ScanId; MAX_PARALLEL_SCANS_PER_FRAG as usize],
    pub lcp_conn: u32,
}

impl Default for RootFragment {
    fn default() -> Self {
        Self {
            state: RootState::Free,
            table_id: 0,
            frags: [NIL; 2],
            frag_ids: [0; 2],
            no_of_elements: 0,
            commit_count: 0,
            scans: [NIL; MAX_PARALLEL_SCANS_PER_FRAG as usize],
            lcp_conn: NIL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_addressing() {
        let frag = Fragment::default();
        // fresh fragment: 64 buckets, no split in progress
        assert_eq!(frag.bucket_count(), 64);
        assert_eq!(frag.bucket_of(0x12345678 >> 1), (0x12345678 >> 1) & 63);

        let mut split = Fragment::default();
        split.p = 3;
        // bucket 2 was split already: one more bit applies
        assert_eq!(split.bucket_of(64 + 2), 64 + 2);
        // bucket 5 not yet split
        assert_eq!(split.bucket_of(64 + 5), 5);
    }

    #[test]
    fn test_bucket_position() {
        let frag = Fragment::default();
        assert_eq!(frag.bucket_position(0), (0, 0));
        assert_eq!(frag.bucket_position(63), (0, 63));
        assert_eq!(frag.bucket_position(64), (1, 0));
        assert_eq!(frag.bucket_position(130), (2, 2));
    }
}
