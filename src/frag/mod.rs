pub mod fragment;
pub mod linear_hash;
pub mod overflow;

pub use fragment::{FragState, Fragment, RootFragment, RootState};
pub use overflow::{OverList, OverflowRec};
