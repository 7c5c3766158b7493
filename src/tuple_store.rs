use std::collections::HashMap;

use crate::{
    error::{ErrorKind, SmallError},
    types::LocalKey,
};

/// The tuple manager seam. The index stores only (header, localkey)
/// elements; the primary key bytes live with the tuple manager and are
/// read back through this trait for full-key comparison during a search.
pub trait TupleStore {
    /// Allocate a tuple slot on insert commit. The key words are handed
    /// over so `read_pk` can serve later comparisons.
    fn allocate(&mut self, table_id: u32, frag_id: u32, key: &[u32])
        -> Result<LocalKey, SmallError>;

    /// Release a tuple slot on physical delete.
    fn deallocate(&mut self, table_id: u32, frag_id: u32, local_key: LocalKey);

    /// Read the primary key of a stored tuple into `out`; returns the word
    /// length. Must be callable from inside a search.
    fn read_pk(
        &self,
        table_id: u32,
        frag_id: u32,
        local_key: LocalKey,
        out: &mut [u32],
    ) -> Result<usize, SmallError>;
}

/// In-memory tuple manager used by tests and simple embeddings. Slots are
/// handed out page by page, 32 tuples per page.
pub struct MemTupleStore {
    tuples: HashMap<(u32, u32, u32, u32), Vec<u32>>,
    next_slot: HashMap<(u32, u32), (u32, u32)>,
    free: HashMap<(u32, u32), Vec<LocalKey>>,
}

const TUPLES_PER_PAGE: u32 = 32;

impl MemTupleStore {
    pub fn new() -> Self {
        Self {
            tuples: HashMap::new(),
            next_slot: HashMap::new(),
            free: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }
}

impl TupleStore for MemTupleStore {
    fn allocate(
        &mut self,
        table_id: u32,
        frag_id: u32,
        key: &[u32],
    ) -> Result<LocalKey, SmallError> {
        let local_key = match self.free.get_mut(&(table_id, frag_id)).and_then(|v| v.pop()) {
            Some(k) => k,
            None => {
                let slot = self.next_slot.entry((table_id, frag_id)).or_insert((0, 0));
                let k = LocalKey::new(slot.0, slot.1);
                slot.1 += 1;
                if slot.1 == TUPLES_PER_PAGE {
                    slot.0 += 1;
                    slot.1 = 0;
                }
                k
            }
        };
        self.tuples.insert(
            (table_id, frag_id, local_key.page_no, local_key.page_idx),
            key.to_vec(),
        );
        Ok(local_key)
    }

    fn deallocate(&mut self, table_id: u32, frag_id: u32, local_key: LocalKey) {
        self.tuples
            .remove(&(table_id, frag_id, local_key.page_no, local_key.page_idx));
        self.free
            .entry((table_id, frag_id))
            .or_insert_with(Vec::new)
            .push(local_key);
    }

    fn read_pk(
        &self,
        table_id: u32,
        frag_id: u32,
        local_key: LocalKey,
        out: &mut [u32],
    ) -> Result<usize, SmallError> {
        let key = self
            .tuples
            .get(&(table_id, frag_id, local_key.page_no, local_key.page_idx))
            .ok_or(SmallError::of(ErrorKind::ReadError, "tuple slot not found"))?;
        out[..key.len()].copy_from_slice(key);
        Ok(key.len())
    }
}
