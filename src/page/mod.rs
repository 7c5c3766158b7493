pub mod container;
pub mod directory;
pub mod element;
pub mod page8;
pub mod page_store;

pub use directory::{DirKind, DirRange, Directory, DirectoryPools};
pub use page8::Page8;
pub use page_store::PageStore;
