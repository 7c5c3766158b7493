use std::collections::HashMap;

use log::debug;

use crate::{
    adaptive::fold::fold,
    consts::*,
    database::Database,
    page::container::ElemRef,
    store::HashStore,
    types::{FragId, OpId, PageId},
};

/// A cached guess: where an element with a given fold was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub frag: FragId,
    pub page: PageId,
    pub con_ptr: u32,
    pub elem_ptr: u32,
    pub forward: bool,
}

/// Build bookkeeping of one page, updated without the latch (a stale
/// value costs a wasted build decision at worst).
#[derive(Debug, Clone, Default)]
pub struct PageHashInfo {
    pub is_hashed: bool,
    pub n_hash_helps: u32,
    pub n_fields: u32,
    pub n_bytes: u32,
    pub curr_n_fields: u32,
    pub curr_n_bytes: u32,
}

/// The process-wide fold → element map. Pure cache: entries may be
/// missing or stale, and every guess is validated before use. Never
/// persisted.
pub struct SearchSys {
    map: HashMap<u32, Fingerprint>,
    pages: HashMap<PageId, PageHashInfo>,
    pub n_guesses: u64,
    pub n_hits: u64,
}

impl SearchSys {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            pages: HashMap::new(),
            n_guesses: 0,
            n_hits: 0,
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.pages.clear();
        self.n_guesses = 0;
        self.n_hits = 0;
    }

    pub fn lookup(&self, fold: u32) -> Option<Fingerprint> {
        self.map.get(&fold).cloned()
    }

    pub fn insert(&mut self, fold: u32, fp: Fingerprint) {
        self.map.insert(fold, fp);
    }

    pub fn remove(&mut self, fold: u32) {
        self.map.remove(&fold);
    }

    /// Forget any guess pointing at this element position.
    pub fn drop_element(&mut self, page: PageId, elem_ptr: u32) {
        self.map
            .retain(|_, fp| !(fp.page == page && fp.elem_ptr == elem_ptr));
    }

    /// Forget every guess into a page, e.g. when it is released.
    pub fn drop_page(&mut self, page: PageId) {
        self.map.retain(|_, fp| fp.page != page);
        self.pages.remove(&page);
    }

    pub fn page_info_mut(&mut self, page: PageId) -> &mut PageHashInfo {
        self.pages.entry(page).or_insert_with(PageHashInfo::default)
    }

    pub fn page_is_hashed(&self, page: PageId) -> bool {
        self.pages.get(&page).map(|i| i.is_hashed).unwrap_or(false)
    }

    pub fn entries(&self) -> usize {
        self.map.len()
    }
}

impl HashStore {
    /// Try to answer a request straight from the search system. Computes
    /// the fold from the fragment's current recommendation (read without
    /// the latch on purpose), probes shared, and validates the guessed
    /// element by full key before trusting it.
    pub(crate) fn guess_on_hash(&mut self, op: OpId) -> Option<ElemRef> {
        let frag = self.ops.get(op).frag;
        let (n_fields, n_bytes, potential) = {
            let si = &self.fragments.get(frag).search_info;
            (si.n_fields, si.n_bytes, si.n_hash_potential)
        };
        if potential == 0 {
            return None;
        }
        let key = self.ops.get(op).key_words().to_vec();
        let f = fold(&key, n_fields, n_bytes, frag);

        let fp = {
            let sys = Database::search_sys();
            sys.lookup(f)?
        };
        if fp.frag != frag {
            return None;
        }
        Database::mut_search_sys().n_guesses += 1;

        // validate: the pinned element must still carry our key
        let elem = ElemRef {
            page: fp.page,
            con_ptr: fp.con_ptr,
            elem_ptr: fp.elem_ptr,
            forward: fp.forward,
        };
        let lk_len = self.fragments.get(frag).local_key_len as usize;
        let mut words = [0u32; 2];
        for i in 0..lk_len {
            words[i] = self.elem_local_key_word(elem.page, elem.elem_ptr, elem.forward, i);
        }
        let local_key = self.unpack_local_key(frag, &words);
        let (table_id, fid) = {
            let fr = self.fragments.get(frag);
            (fr.my_table_id, fr.my_fid)
        };
        let mut buf = [0u32; 8];
        let ok = match self.tuple_store.read_pk(table_id, fid, local_key, &mut buf) {
            Ok(n) => buf[..n] == key[..],
            Err(_) => false,
        };
        if !ok {
            // stale guess: drop it exclusively and fall back to descent
            Database::mut_search_sys().remove(f);
            debug!("adaptive guess mispredicted, fold {:08x}", f);
            return None;
        }
        {
            let sys = &mut Database::mut_search_sys();
            sys.n_hits += 1;
        }
        let si = &mut self.fragments.get_mut(frag).search_info;
        si.last_hash_succ = true;
        if si.n_hash_potential < SEARCH_BUILD_LIMIT + 5 {
            si.n_hash_potential += 1;
        }
        Some(elem)
    }

    /// After a full descent: update the fragment recommendation, the
    /// page's build bookkeeping, and possibly (re)build the page's hash
    /// entries or upsert the corrected reference.
    pub(crate) fn search_info_update(&mut self, op: OpId, found: Option<ElemRef>) {
        let frag = self.ops.get(op).frag;
        let key = self.ops.get(op).key_words().to_vec();
        let key_len = self.ops.get(op).xfrm_key_len;

        {
            let si = &mut self.fragments.get_mut(frag).search_info;
            si.hash_analysis += 1;
            if si.hash_analysis <= SEARCH_HASH_ANALYSIS {
                return;
            }
            si.update(&key, key_len);
        }
        let elem = match found {
            Some(e) => e,
            None => return,
        };

        let (n_fields, n_bytes, potential, last_succ) = {
            let si = &self.fragments.get(frag).search_info;
            (si.n_fields, si.n_bytes, si.n_hash_potential, si.last_hash_succ)
        };
        let recs = self.pages.get(elem.page).elem_count().max(1);

        let build = {
            let mut sys = Database::mut_search_sys();
            let info = sys.page_info_mut(elem.page);
            if info.n_hash_helps > 0
                && potential > 0
                && info.n_fields == n_fields
                && info.n_bytes == n_bytes
            {
                info.n_hash_helps += 1;
            } else {
                info.n_hash_helps = 1;
                info.n_fields = n_fields;
                info.n_bytes = n_bytes;
            }
            (info.n_hash_helps > recs / SEARCH_PAGE_BUILD_LIMIT)
                && (potential >= SEARCH_BUILD_LIMIT)
                && (!info.is_hashed
                    || info.n_hash_helps > 2 * recs
                    || info.curr_n_fields != n_fields
                    || info.curr_n_bytes != n_bytes)
        };
        if build {
            self.build_page_hash_index(frag, elem.page, n_fields, n_bytes);
        } else if Database::search_sys().page_is_hashed(elem.page) && !last_succ {
            // the search could have succeeded on hash: lazily fix the
            // reference that misled or was missing
            let f = fold(&key, n_fields, n_bytes, frag);
            Database::mut_search_sys().insert(
                f,
                Fingerprint {
                    frag,
                    page: elem.page,
                    con_ptr: elem.con_ptr,
                    elem_ptr: elem.elem_ptr,
                    forward: elem.forward,
                },
            );
        }
    }

    /// (Re)hash every element of a page under the exclusive latch. An
    /// existing index with different parameters is dropped first.
    pub(crate) fn build_page_hash_index(
        &mut self,
        frag: FragId,
        page: PageId,
        n_fields: u32,
        n_bytes: u32,
    ) {
        let (table_id, fid, lk_len, elem_len) = {
            let f = self.fragments.get(frag);
            (
                f.my_table_id,
                f.my_fid,
                f.local_key_len as usize,
                f.element_length,
            )
        };
        let mut entries = Vec::new();
        for con in self.page_containers(page) {
            let n = {
                let w = self.pages.get(page).get(con.head_ptr());
                (crate::page::container::head::len(w) - CON_HEAD_SIZE) / elem_len
            };
            for i in 0..n {
                let elem_ptr = con.elem_ptr(i, elem_len);
                let mut words = [0u32; 2];
                for j in 0..lk_len {
                    words[j] = self.elem_local_key_word(page, elem_ptr, con.is_left, j);
                }
                // a locked element is still a valid guess target; its key
                // lives behind the same local key
                let local_key = self.unpack_local_key(frag, &words);
                let mut buf = [0u32; 8];
                if let Ok(klen) = self.tuple_store.read_pk(table_id, fid, local_key, &mut buf) {
                    let f = fold(&buf[..klen], n_fields, n_bytes, frag);
                    entries.push((
                        f,
                        Fingerprint {
                            frag,
                            page,
                            con_ptr: con.head_ptr() as u32,
                            elem_ptr,
                            forward: con.is_left,
                        },
                    ));
                }
            }
        }
        let mut sys = Database::mut_search_sys();
        sys.drop_page(page);
        for (f, fp) in entries {
            sys.insert(f, fp);
        }
        let info = sys.page_info_mut(page);
        info.is_hashed = true;
        info.curr_n_fields = n_fields;
        info.curr_n_bytes = n_bytes;
        info.n_hash_helps = 0;
        debug!(
            "page {} hash index built, {} entries, prefix {}:{}",
            page,
            sys.entries(),
            n_fields,
            n_bytes
        );
    }

    /// Drop a page's hash entries before the page is released.
    pub(crate) fn drop_page_hash_when_freed(&self, page: PageId) {
        if !self.in_recovery {
            Database::mut_search_sys().drop_page(page);
        }
    }
}
