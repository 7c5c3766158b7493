use once_cell::sync::OnceCell;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{adaptive::SearchSys, types::Pod, utils::HandyRwLock};

static DB: OnceCell<Database> = OnceCell::new();

/// We collect all process-wide state here.
///
/// Each store instance owns its pages, fragments and pools outright; the
/// adaptive search system is the one genuinely shared structure (its
/// entries point across store instances of the same process), so it lives
/// behind the single reader/writer latch held at rank "SearchSys" in the
/// global lock order.
pub struct Database {
    search_sys: Pod<SearchSys>,
}

impl Database {
    fn new() -> Database {
        Database {
            search_sys: Arc::new(RwLock::new(SearchSys::new())),
        }
    }

    pub fn global() -> &'static Database {
        DB.get_or_init(|| Database::new())
    }

    pub fn search_sys() -> RwLockReadGuard<'static, SearchSys> {
        Self::global().search_sys.rl()
    }

    pub fn mut_search_sys() -> RwLockWriteGuard<'static, SearchSys> {
        Self::global().search_sys.wl()
    }

    /// Drop every cached guess. Tests use this instead of tearing the
    /// singleton down.
    pub fn reset() {
        Self::mut_search_sys().clear();
    }
}
