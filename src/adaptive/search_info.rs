/// Which side of an equal-prefix group the recommendation tracks. Kept
/// for parity with the classic scheme even though a hash lookup has no
/// range component; ties resolve to the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Default for Side {
    fn default() -> Self {
        Side::Left
    }
}

/// Per-fragment search statistics driving the adaptive hash.
///
/// `n_fields`/`n_bytes` is the current fold-prefix recommendation;
/// `n_hash_potential` counts consecutive searches the recommendation
/// would have answered; `hash_analysis` throttles the bookkeeping so a
/// cold fragment costs nothing.
///
/// The fields are deliberately read without any latch on the hot path;
/// a stale read can only produce a wrong guess, and guesses are always
/// validated against the real key.
#[derive(Debug, Clone)]
pub struct SearchInfo {
    pub n_fields: u32,
    pub n_bytes: u32,
    pub side: Side,
    pub n_hash_potential: u32,
    pub hash_analysis: u32,
    pub last_hash_succ: bool,
    last_key: [u32; 8],
    last_key_len: u32,
}

impl Default for SearchInfo {
    fn default() -> Self {
        Self {
            n_fields: 1,
            n_bytes: 0,
            side: Side::Left,
            n_hash_potential: 0,
            hash_analysis: 0,
            last_hash_succ: false,
            last_key: [0; 8],
            last_key_len: 0,
        }
    }
}

impl SearchInfo {
    /// Update the recommendation after a completed search. Returns true
    /// when the recommendation still distinguishes consecutive keys, so
    /// the potential counter grew.
    pub fn update(&mut self, key: &[u32], key_len: u32) -> bool {
        self.last_hash_succ = false;
        let grew;
        if self.last_key_len == 0 {
            self.set_new_recomm(key, key_len, key_len.min(1), 0);
            grew = false;
        } else {
            let (m, b) = self.match_depth(key);
            if self.distinguishes(m, b) {
                self.n_hash_potential += 1;
                grew = true;
            } else {
                // the prefix stopped separating keys; recommend one more
                let nf = (m + 1).min(key_len);
                self.set_new_recomm(key, key_len, nf, 0);
                grew = false;
            }
        }
        self.last_key[..key.len()].copy_from_slice(key);
        self.last_key_len = key_len;
        grew
    }

    /// Words and leading bytes this key shares with the previous one.
    fn match_depth(&self, key: &[u32]) -> (u32, u32) {
        let mut m = 0u32;
        let common = (self.last_key_len as usize).min(key.len());
        while (m as usize) < common && self.last_key[m as usize] == key[m as usize] {
            m += 1;
        }
        let mut b = 0u32;
        if (m as usize) < common {
            let a = self.last_key[m as usize].to_le_bytes();
            let c = key[m as usize].to_le_bytes();
            while (b as usize) < 4 && a[b as usize] == c[b as usize] {
                b += 1;
            }
        }
        (m, b)
    }

    /// Does the current recommendation separate two keys with this match
    /// depth?
    fn distinguishes(&self, m: u32, b: u32) -> bool {
        self.n_fields > m || (self.n_fields == m && self.n_bytes > b)
    }

    fn set_new_recomm(&mut self, _key: &[u32], _key_len: u32, n_fields: u32, n_bytes: u32) {
        self.hash_analysis = 0;
        self.n_fields = n_fields.max(1);
        self.n_bytes = n_bytes;
        self.side = Side::Left;
        self.n_hash_potential = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_potential_grows_on_distinguishing_prefix() {
        let mut info = SearchInfo::default();
        info.update(&[1, 100], 2);
        assert_eq!(info.n_hash_potential, 1);
        // first word differs: the 1-field recommendation separates them
        for k in 2..10 {
            info.update(&[k, 100], 2);
        }
        assert_eq!(info.n_hash_potential, 9);
    }

    #[test]
    fn test_recommendation_widens_on_shared_prefix() {
        let mut info = SearchInfo::default();
        info.update(&[7, 1], 2);
        assert_eq!(info.n_fields, 1);
        // same first word: one field no longer separates
        info.update(&[7, 2], 2);
        assert_eq!(info.n_fields, 2);
        assert_eq!(info.n_hash_potential, 1);
        info.update(&[7, 3], 2);
        assert_eq!(info.n_hash_potential, 2);
    }
}
