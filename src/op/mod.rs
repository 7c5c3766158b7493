pub mod executor;
pub mod lock_queue;
pub mod operation;

pub use executor::OpRequest;
pub use lock_queue::LockResult;
pub use operation::{LockMode, OpKind, OpOutcome, OpState, OperationRec};
