pub mod scan;

pub use scan::{ScanBucketState, ScanNext, ScanRec};
