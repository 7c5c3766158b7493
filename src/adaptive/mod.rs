pub mod fold;
pub mod search_info;
pub mod search_sys;

pub use fold::{fold, hash_key};
pub use search_info::{SearchInfo, Side};
pub use search_sys::{Fingerprint, PageHashInfo, SearchSys};
