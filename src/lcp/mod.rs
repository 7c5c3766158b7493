pub mod file_queue;
pub mod lcp;
pub mod restore;
pub mod undo;

pub use lcp::{LcpConn, LcpState};
pub use undo::{UndoHeader, UndoLog};
