use std::collections::VecDeque;

use log::debug;

use crate::{
    store::{HashStore, Work},
    types::{FragId, NIL},
};

/// One queued file request. All file work is asynchronous to the block:
/// requests are queued here and completed one at a time by `pump_io`,
/// which then drives the waiting state machine forward.
#[derive(Debug, Clone, Copy)]
pub enum IoJob {
    /// Write undo ring pages `first..first+count` to the undo file.
    WriteUndoGroup {
        first_page: u32,
        count: u32,
        /// Ring pages below this sequence become reusable on completion.
        confirm_to: u32,
    },
    /// Sync the undo file; the tail of a finishing checkpoint.
    SyncUndo { conn: u32 },
    /// Write a fragment's copy pages to its data file.
    WriteDataPages {
        frag: FragId,
        file_page: u32,
        count: u32,
    },
    WriteZeroPage { frag: FragId },
    CloseData { frag: FragId },
}

pub struct FileQueue {
    jobs: VecDeque<IoJob>,
}

impl FileQueue {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    pub fn push(&mut self, job: IoJob) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<IoJob> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl HashStore {
    /// Complete one outstanding file request. Returns false when idle.
    /// The per-call data volume is bounded by the configured write
    /// budget, so one call is one "tick".
    pub fn pump_io(&mut self) -> bool {
        let job = match self.io.pop() {
            Some(j) => j,
            None => return false,
        };
        debug!("io: {:?}", job);
        match job {
            IoJob::WriteUndoGroup {
                first_page,
                count,
                confirm_to,
            } => {
                self.undo_write_group(first_page, count);
                if confirm_to > self.undo.pages_confirmed {
                    self.undo.pages_confirmed = confirm_to;
                }
                self.drain_stalled_commits();
                self.schedule_wait_drains();
            }
            IoJob::SyncUndo { conn } => {
                if let Some(file) = self.undo.file.as_mut() {
                    let _ = file.sync();
                }
                self.lcp_sync_done(conn);
            }
            IoJob::WriteDataPages {
                frag,
                file_page,
                count,
            } => {
                self.lcp_write_data_pages(frag, file_page, count);
                self.lcp_pages_written(frag, count);
            }
            IoJob::WriteZeroPage { frag } => {
                self.lcp_write_zero_page(frag);
                self.lcp_zero_written(frag);
            }
            IoJob::CloseData { frag } => {
                self.fragments.get_mut(frag).data_file = None;
                self.lcp_data_closed(frag);
            }
        }
        true
    }

    /// Commits parked on undo credit go through in arrival order once a
    /// group write confirms.
    pub(crate) fn drain_stalled_commits(&mut self) {
        use crate::consts::MIN_UNDO_PAGES_AT_COMMIT;
        use crate::op::operation::OpState;
        while let Some(&op) = self.stalled_commits.front() {
            if self.undo_free_pages() < MIN_UNDO_PAGES_AT_COMMIT {
                return;
            }
            self.stalled_commits.pop_front();
            if self.ops.get(op).op_state != OpState::CommitStalled {
                continue;
            }
            self.do_commit(op);
            self.events.push_back(crate::store::StoreEvent::CommitDone(op));
        }
    }

    /// Fragments with parked requests get a drain continuation.
    fn schedule_wait_drains(&mut self) {
        let frags: Vec<u32> = self
            .fragments
            .live()
            .into_iter()
            .filter(|&f| self.fragments.get(f).first_wait_in_que_op != NIL)
            .collect();
        for f in frags {
            self.push_work(Work::DrainWaitQueue(f));
        }
    }
}
