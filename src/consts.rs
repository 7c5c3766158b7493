// Layout and tuning constants for the linear-hash store. The page layout
// constants are load-bearing: changing any of them changes the on-disk
// format.

/// Words in one 8 KiB page.
pub const WORDS_IN_PAGE: usize = 2048;

/// Words of the fixed page header.
pub const HEAD_SIZE: usize = 32;

/// Words of one container slot, head included.
pub const BUF_SIZE: u32 = 28;

/// Words of a container head.
pub const CON_HEAD_SIZE: u32 = 2;

/// Container slots per page.
pub const NO_CONTAINERS: u32 = 64;

/// Words of an element header.
pub const ELEM_HEAD_SIZE: u32 = 1;

/// Terminator of the per-page empty container lists. Any value above 63
/// works; 72 is kept for on-disk compatibility.
pub const EMPTY_LIST: u32 = 72;

/// A container growing past this length takes ownership of the other half
/// of its slot.
pub const UP_LIMIT: u32 = 14;

/// A dual-owning container shrinking below this length gives the other
/// half back.
pub const DOWN_LIMIT: u32 = 12;

// Page header word positions.
pub const POS_PAGE_ID: usize = 0;
pub const POS_EMPTY_LIST: usize = 1;
pub const POS_ALLOC_CONTAINERS: usize = 2;
pub const POS_CHECKSUM: usize = 3;
pub const POS_OVERFLOWREC: usize = 4;
pub const POS_FRAG_REC: usize = 5;

pub const NORMAL_PAGE_TYPE: u32 = 0;
pub const OVERFLOW_PAGE_TYPE: u32 = 1;
pub const PAGE_TYPE_BIT: u32 = 14;

/// Buckets per bucket page is `1 << K`.
pub const K: u32 = 6;

/// Fan-out of one directory level.
pub const DIR_FANOUT: usize = 256;

/// Concurrent scans per fragment; one element-header bit each.
pub const MAX_PARALLEL_SCANS_PER_FRAG: u32 = 4;

/// A scan holding this many row locks stops producing rows until one is
/// released.
pub const SCAN_MAX_LOCK: u32 = 4;

/// Lock-owner operations captured per batch while a checkpoint starts.
pub const LCP_HOLD_OP_BATCH: u32 = 23;

/// Data pages copied per write during a checkpoint.
pub const WRITE_PAGE_SIZE: u32 = 8;

/// Undo pages per group write.
pub const WRITE_UNDO_PAGE_SIZE: u32 = 2;

/// Pages of the in-memory undo ring.
pub const NR_OF_UNDO_PAGE_GROUP: u32 = 16;

/// Words of an undo record header (28 bytes).
pub const UNDO_HEAD_SIZE: u32 = 7;

// Undo-ring back-pressure thresholds, in free pages.
pub const MIN_UNDO_PAGES_AT_COMMIT: u32 = 4;
pub const MIN_UNDO_PAGES_AT_OPERATION: u32 = 10;
pub const MIN_UNDO_PAGES_AT_EXPAND: u32 = 16;

/// Copy pages held per fragment during a checkpoint (one write group).
pub const LCP_COPY_PAGES: usize = 8;

/// Pages reserved at startup for checkpoint use only: per fragment one
/// zero page plus a copy group, two fragments per root.
pub const LCP_PAGE_RESERVE: usize = 2 * (LCP_COPY_PAGES + 1) + 2;

// Adaptive-hash build policy, inherited from the classic values.
pub const SEARCH_BUILD_LIMIT: u32 = 100;
pub const SEARCH_PAGE_BUILD_LIMIT: u32 = 16;
pub const SEARCH_HASH_ANALYSIS: u32 = 17;

// Default pool sizes, overridable through `StoreConfig`.
pub const DEFAULT_DIR_RANGE_SIZE: u32 = 65;
pub const DEFAULT_DIR_ARRAY_SIZE: u32 = 68;
pub const DEFAULT_FRAGMENT_SIZE: u32 = 64;
pub const DEFAULT_OP_RECS: u32 = 740;
pub const DEFAULT_OVERFLOW_RECS: u32 = 64;
pub const DEFAULT_PAGE8: u32 = 128;
pub const DEFAULT_ROOT_FRAG: u32 = 32;
pub const DEFAULT_TABLE: u32 = 16;
pub const DEFAULT_SCAN: u32 = 64;
pub const DEFAULT_LCP_DISC_PAGES: u32 = 8;
pub const DEFAULT_LCP_DISC_PAGES_SR: u32 = 20;
