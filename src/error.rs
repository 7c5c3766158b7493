use std::{error::Error, fmt};

use backtrace::Backtrace;

/// The error codes visible at the request boundary. The numeric values are
/// part of the external interface and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// All operation records are in use.
    OutOfConnections,
    /// No free pages left in the page store.
    OutOfPages,
    /// Directory pool exhausted while adding a fragment or page.
    DirRangeFull,
    /// The directory cannot grow any further.
    DirSizeExceeded,
    /// Overflow record pool exhausted.
    OutOfOverflowRecords,
    /// An element does not fit any page layout.
    PageSizeExceeded,
    /// The searched row does not exist (or was deleted by a committed
    /// operation ahead of us in the lock queue).
    TupleNotFound,
    ReadError,
    WriteError,
    /// Request arrived before the fragment finished restoring.
    TooEarlyAccess,
    /// The undo ring is too full to accept the request right now.
    UndoFailureTemporary,
    OutOfScanRecords,
    OutOfFragmentRecords,
    /// Internal state contradiction. Never returned to a caller without
    /// also poisoning the store.
    InvariantViolation,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::OutOfConnections => 602,
            ErrorKind::DirRangeFull => 603,
            ErrorKind::OutOfFragmentRecords => 604,
            ErrorKind::OutOfScanRecords => 609,
            ErrorKind::DirSizeExceeded => 623,
            ErrorKind::OutOfOverflowRecords => 624,
            ErrorKind::PageSizeExceeded => 625,
            ErrorKind::TupleNotFound => 626,
            ErrorKind::ReadError => 626,
            ErrorKind::WriteError => 630,
            ErrorKind::TooEarlyAccess => 632,
            ErrorKind::UndoFailureTemporary => 677,
            ErrorKind::OutOfPages => 625,
            ErrorKind::InvariantViolation => 600,
        }
    }
}

pub struct SmallError {
    details: String,
    kind: Option<ErrorKind>,
    backtrace: Backtrace,
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        SmallError {
            details: msg.to_string(),
            kind: None,
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn of(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            details: msg.to_string(),
            kind: Some(kind),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    pub fn show_backtrace(&self) {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        eprintln!("{}\n{:?}", self.details, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            Some(kind) => {
                write!(f, "{} (error {})", self.details, kind.code())
            }
            None => write!(f, "{}", self.details),
        }
    }
}

impl fmt::Debug for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for SmallError {}
