use crate::{
    error::{ErrorKind, SmallError},
    types::NIL,
};

/// A fixed-capacity record arena addressed by u32 indices.
///
/// All cross-record references in the store are indices into pools like
/// this one, which keeps the doubly-linked lock queues and fragment lists
/// free of ownership cycles. A released record is reset to its default
/// state before going back on the free stack.
pub struct RecordPool<T: Default> {
    recs: Vec<T>,
    free: Vec<u32>,
    capacity: u32,
    kind: ErrorKind,
}

impl<T: Default> RecordPool<T> {
    pub fn new(capacity: u32, kind: ErrorKind) -> Self {
        Self {
            recs: Vec::new(),
            free: Vec::new(),
            capacity,
            kind,
        }
    }

    pub fn seize(&mut self) -> Result<u32, SmallError> {
        if let Some(i) = self.free.pop() {
            return Ok(i);
        }
        if (self.recs.len() as u32) < self.capacity {
            self.recs.push(T::default());
            return Ok(self.recs.len() as u32 - 1);
        }
        Err(SmallError::of(self.kind, "record pool exhausted"))
    }

    pub fn release(&mut self, i: u32) {
        debug_assert!(i != NIL);
        self.recs[i as usize] = T::default();
        self.free.push(i);
    }

    pub fn get(&self, i: u32) -> &T {
        &self.recs[i as usize]
    }

    pub fn get_mut(&mut self, i: u32) -> &mut T {
        &mut self.recs[i as usize]
    }

    pub fn in_use(&self) -> usize {
        self.recs.len() - self.free.len()
    }

    /// Indices of all live records, for integrity walks.
    pub fn live(&self) -> Vec<u32> {
        let mut dead = vec![false; self.recs.len()];
        for &f in &self.free {
            dead[f as usize] = true;
        }
        (0..self.recs.len() as u32)
            .filter(|&i| !dead[i as usize])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Rec {
        v: u32,
    }

    #[test]
    fn test_seize_release_reuse() {
        let mut pool: RecordPool<Rec> = RecordPool::new(2, ErrorKind::OutOfConnections);
        let a = pool.seize().unwrap();
        let b = pool.seize().unwrap();
        assert!(pool.seize().is_err());

        pool.get_mut(a).v = 7;
        pool.release(a);
        let c = pool.seize().unwrap();
        // released records come back zeroed
        assert_eq!(pool.get(c).v, 0);
        assert_eq!(pool.in_use(), 2);
        assert_ne!(b, NIL);
    }
}
