use std::path::PathBuf;

use crate::consts::*;

/// Sizing knobs of one store instance. Parsing these from a cluster
/// configuration is the embedder's business; we only consume the record
/// counts.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Count of directory-range records.
    pub dir_range_size: u32,
    /// Count of directory records.
    pub dir_array_size: u32,
    /// Count of fragment records.
    pub fragment_size: u32,
    /// Count of operation records.
    pub op_recs: u32,
    /// Count of overflow records.
    pub overflow_recs: u32,
    /// Count of 8 KiB pages, checkpoint reserve included.
    pub page8: u32,
    /// Count of root-fragment records.
    pub root_frag: u32,
    /// Count of tables.
    pub table: u32,
    /// Count of scan records.
    pub scan: u32,
    /// Data-page write budget per I/O tick during normal operation.
    pub lcp_disc_pages_acc: u32,
    /// Data-page write budget per I/O tick during a system restart.
    pub lcp_disc_pages_acc_sr: u32,
    /// Root of the on-disk layout (`D3/...` data, `D4/...` undo).
    pub root_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir_range_size: DEFAULT_DIR_RANGE_SIZE,
            dir_array_size: DEFAULT_DIR_ARRAY_SIZE,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            op_recs: DEFAULT_OP_RECS,
            overflow_recs: DEFAULT_OVERFLOW_RECS,
            page8: DEFAULT_PAGE8,
            root_frag: DEFAULT_ROOT_FRAG,
            table: DEFAULT_TABLE,
            scan: DEFAULT_SCAN,
            lcp_disc_pages_acc: DEFAULT_LCP_DISC_PAGES,
            lcp_disc_pages_acc_sr: DEFAULT_LCP_DISC_PAGES_SR,
            root_dir: PathBuf::from("."),
        }
    }
}

impl StoreConfig {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root_dir: root.into(),
            ..Self::default()
        }
    }
}
