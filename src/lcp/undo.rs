use log::debug;

use crate::{
    consts::*,
    error::{ErrorKind, SmallError},
    io::SmallFile,
    lcp::file_queue::IoJob,
    page::{DirKind, Page8},
    store::HashStore,
    types::{OpId, PageId, NIL},
};

/// Undo record types.
pub const UNDO_PAGE_INFO: u32 = 0;
pub const UNDO_OVER_PAGE_INFO: u32 = 1;
pub const UNDO_OP_INFO: u32 = 2;

/// A decoded undo record header (28 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoHeader {
    pub table_id: u32,
    pub root_frag_id: u32,
    pub local_frag_id: u32,
    /// 14 bits record length (words) | 4 bits type | 14 bits page offset.
    pub various_info: u32,
    pub logical_page_id: u32,
    pub prev_undo_for_frag: u32,
    pub prev_undo: u32,
}

impl UndoHeader {
    pub fn pack_various(len: u32, rec_type: u32, page_offset: u32) -> u32 {
        debug_assert!(len < (1 << 14) && rec_type < (1 << 4) && page_offset < (1 << 14));
        (len << 18) | (rec_type << 14) | page_offset
    }

    pub fn len(&self) -> u32 {
        self.various_info >> 18
    }

    pub fn rec_type(&self) -> u32 {
        (self.various_info >> 14) & 0xF
    }

    pub fn page_offset(&self) -> u32 {
        self.various_info & 0x3FFF
    }

    pub fn to_words(&self) -> [u32; UNDO_HEAD_SIZE as usize] {
        [
            self.table_id,
            self.root_frag_id,
            self.local_frag_id,
            self.various_info,
            self.logical_page_id,
            self.prev_undo_for_frag,
            self.prev_undo,
        ]
    }

    pub fn from_words(w: &[u32]) -> Self {
        Self {
            table_id: w[0],
            root_frag_id: w[1],
            local_frag_id: w[2],
            various_info: w[3],
            logical_page_id: w[4],
            prev_undo_for_frag: w[5],
            prev_undo: w[6],
        }
    }
}

/// The write-ahead undo buffer: a ring of 8 KiB pages backed by one file
/// group. Records are word-aligned and never cross a page boundary; each
/// filled pair of pages goes out as one group write.
pub struct UndoLog {
    ring: Vec<Page8>,
    /// Sequence number (== file page) of the page being filled.
    pub cur_page: u32,
    pub cur_offset: u32,
    /// Ring pages below this sequence have hit the disk.
    pub pages_confirmed: u32,
    /// Highest page sequence already handed to the I/O queue.
    pub pages_flushed: u32,
    pub file: Option<SmallFile>,
    pub file_version: u32,
    pub prev_undo_address: u32,
}

impl UndoLog {
    pub fn new() -> Self {
        let mut ring = Vec::new();
        for _ in 0..NR_OF_UNDO_PAGE_GROUP {
            ring.push(Page8::default());
        }
        Self {
            ring,
            cur_page: 0,
            cur_offset: 0,
            pages_confirmed: 0,
            pages_flushed: 0,
            file: None,
            file_version: 0,
            prev_undo_address: NIL,
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn ring_page(&mut self, seq: u32) -> &mut Page8 {
        let i = (seq % NR_OF_UNDO_PAGE_GROUP) as usize;
        &mut self.ring[i]
    }

    pub fn ring_page_words(&self, seq: u32) -> &[u32; WORDS_IN_PAGE] {
        &self.ring[(seq % NR_OF_UNDO_PAGE_GROUP) as usize].word
    }
}

impl HashStore {
    /// Ring pages still free for new records.
    pub(crate) fn undo_free_pages(&self) -> u32 {
        NR_OF_UNDO_PAGE_GROUP - (self.undo.cur_page - self.undo.pages_confirmed)
    }

    pub(crate) fn open_undo_group(&mut self, lcp_id: u32) -> Result<(), SmallError> {
        if self.undo.is_open() {
            return Ok(());
        }
        let path = self
            .config
            .root_dir
            .join("D4")
            .join("HASH")
            .join(format!("{}", lcp_id))
            .join("0.LOCLOG");
        self.undo.file = Some(SmallFile::open(path)?);
        self.undo.file_version = lcp_id;
        Ok(())
    }

    /// Lay one record into the ring, queueing group writes as page pairs
    /// fill up. Returns the record's file word address.
    pub(crate) fn undo_append(
        &mut self,
        header: UndoHeader,
        payload: &[u32],
    ) -> Result<u32, SmallError> {
        let len = UNDO_HEAD_SIZE as usize + payload.len();
        debug_assert!(len <= WORDS_IN_PAGE);

        if self.undo.cur_offset as usize + len > WORDS_IN_PAGE {
            // records never cross a page boundary; the tail is dead space
            self.undo_advance_page()?;
        }
        let addr = self.undo.cur_page * WORDS_IN_PAGE as u32 + self.undo.cur_offset;
        let mut header = header;
        header.prev_undo = self.undo.prev_undo_address;
        {
            let offset = self.undo.cur_offset as usize;
            let seq = self.undo.cur_page;
            let page = self.undo.ring_page(seq);
            for (i, &w) in header.to_words().iter().enumerate() {
                page.word[offset + i] = w;
            }
            for (i, &w) in payload.iter().enumerate() {
                page.word[offset + UNDO_HEAD_SIZE as usize + i] = w;
            }
        }
        self.undo.cur_offset += len as u32;
        self.undo.prev_undo_address = addr;
        if self.undo.cur_offset as usize == WORDS_IN_PAGE {
            self.undo_advance_page()?;
        }
        Ok(addr)
    }

    fn undo_advance_page(&mut self) -> Result<(), SmallError> {
        self.undo.cur_page += 1;
        self.undo.cur_offset = 0;

        if self.undo.cur_page % WRITE_UNDO_PAGE_SIZE == 0 {
            let first = self.undo.cur_page - WRITE_UNDO_PAGE_SIZE;
            self.io.push(IoJob::WriteUndoGroup {
                first_page: first,
                count: WRITE_UNDO_PAGE_SIZE,
                confirm_to: self.undo.cur_page,
            });
            self.undo.pages_flushed = self.undo.cur_page;
        }
        if self.undo.cur_page - self.undo.pages_confirmed >= NR_OF_UNDO_PAGE_GROUP {
            // the ring is truly full: nothing can proceed safely
            panic!("undo log ring exhausted; increase the undo file group");
        }
        let seq = self.undo.cur_page;
        self.undo.ring_page(seq).zero();
        Ok(())
    }

    /// Flush the partial tail of the ring, then sync. The checkpoint's
    /// final act before reporting completion.
    pub(crate) fn undo_sync_enqueue(&mut self, conn: u32) {
        let first = self.undo.pages_flushed;
        let last = self.undo.cur_page;
        let count = last - first + 1;
        self.io.push(IoJob::WriteUndoGroup {
            first_page: first,
            count,
            // the partial current page stays in use
            confirm_to: last,
        });
        self.io.push(IoJob::SyncUndo { conn });
    }

    pub(crate) fn undo_write_group(&mut self, first_page: u32, count: u32) {
        for seq in first_page..first_page + count {
            let words = *self.undo.ring_page_words(seq);
            if let Some(file) = self.undo.file.as_mut() {
                if let Err(e) = file.write_page(seq, &words) {
                    // I/O failure during a checkpoint is not survivable
                    panic!("undo group write failed: {}", e);
                }
            }
        }
        debug!("undo group written, pages {}..{}", first_page, first_page + count);
    }

    /// Describe a page before its first modification inside a checkpoint
    /// window; called by every container-level mutator right before the
    /// write. The page goes out as two half-page records because one
    /// record may not cross an undo page boundary. Later touches of the
    /// same page are free: backward replay ends on this capture, which is
    /// the checkpoint-start image.
    pub(crate) fn lcp_undo_write(&mut self, page_id: PageId) {
        let (frag, logical, page_type) = {
            let page = self.pages.get(page_id);
            (page.frag_rec(), page.logical_id(), page.page_type())
        };
        if frag == NIL {
            return;
        }
        let in_window = {
            let f = self.fragments.get(frag);
            f.create_lcp
                && if page_type == OVERFLOW_PAGE_TYPE {
                    logical < f.lcp_max_over_dir_index
                } else {
                    logical < f.lcp_max_dir_index
                }
        };
        if !in_window {
            return;
        }
        if !self.lcp_dirty.insert((frag, page_id)) {
            return;
        }
        let rec_type = if page_type == OVERFLOW_PAGE_TYPE {
            UNDO_OVER_PAGE_INFO
        } else {
            UNDO_PAGE_INFO
        };
        let half = WORDS_IN_PAGE / 2;
        for offset in [0usize, half].iter().cloned() {
            let payload: Vec<u32> = {
                let page = self.pages.get(page_id);
                page.word[offset..offset + half].to_vec()
            };
            let (table_id, root, fid, prev_for_frag) = {
                let f = self.fragments.get(frag);
                (f.my_table_id, f.my_root, f.my_fid, f.prev_undo_position)
            };
            let header = UndoHeader {
                table_id,
                root_frag_id: root,
                local_frag_id: fid,
                various_info: UndoHeader::pack_various(
                    UNDO_HEAD_SIZE + half as u32,
                    rec_type,
                    offset as u32,
                ),
                logical_page_id: logical,
                prev_undo_for_frag: prev_for_frag,
                prev_undo: NIL,
            };
            match self.undo_append(header, &payload) {
                Ok(addr) => self.fragments.get_mut(frag).prev_undo_position = addr,
                Err(e) => panic!("undo write failed: {}", e),
            }
        }
    }

    /// One op-undo record per lock owner at checkpoint start, so recovery
    /// can take back an insert that was already visible on a copied page.
    pub(crate) fn lcp_write_op_undo(&mut self, op: OpId) {
        let (frag, kind, hash_value, local_key, elem_page) = {
            let rec = self.ops.get(op);
            (
                rec.frag,
                rec.kind,
                rec.hash_value,
                rec.local_key,
                rec.elem_page,
            )
        };
        let logical = if elem_page != NIL {
            self.pages.get(elem_page).logical_id()
        } else {
            0
        };
        let (table_id, root, fid, lk_len, prev_for_frag) = {
            let f = self.fragments.get(frag);
            (
                f.my_table_id,
                f.my_root,
                f.my_fid,
                f.local_key_len,
                f.prev_undo_position,
            )
        };
        let lk_words = self.pack_local_key(frag, local_key);
        let mut payload = vec![kind as u32, hash_value, lk_len];
        payload.extend_from_slice(&lk_words[..lk_len as usize]);

        let header = UndoHeader {
            table_id,
            root_frag_id: root,
            local_frag_id: fid,
            various_info: UndoHeader::pack_various(
                UNDO_HEAD_SIZE + payload.len() as u32,
                UNDO_OP_INFO,
                0,
            ),
            logical_page_id: logical,
            prev_undo_for_frag: prev_for_frag,
            prev_undo: NIL,
        };
        match self.undo_append(header, &payload) {
            Ok(addr) => self.fragments.get_mut(frag).prev_undo_position = addr,
            Err(e) => panic!("undo write failed: {}", e),
        }
    }

    /// Read one undo record back from the file during recovery.
    pub(crate) fn undo_read_record(
        &mut self,
        addr: u32,
    ) -> Result<(UndoHeader, Vec<u32>), SmallError> {
        let file_page = addr / WORDS_IN_PAGE as u32;
        let offset = (addr % WORDS_IN_PAGE as u32) as usize;
        let mut buf = [0u32; WORDS_IN_PAGE];
        self.undo
            .file
            .as_mut()
            .ok_or(SmallError::of(ErrorKind::ReadError, "undo file not open"))?
            .read_page(file_page, &mut buf)?;
        let header = UndoHeader::from_words(&buf[offset..offset + UNDO_HEAD_SIZE as usize]);
        let len = header.len() as usize;
        if len < UNDO_HEAD_SIZE as usize || offset + len > WORDS_IN_PAGE {
            return Err(SmallError::of(
                ErrorKind::ReadError,
                "corrupt undo record header",
            ));
        }
        let payload = buf[offset + UNDO_HEAD_SIZE as usize..offset + len].to_vec();
        Ok((header, payload))
    }

    /// Resolve the page an undo record applies to.
    pub(crate) fn undo_target_page(
        &self,
        frag: u32,
        header: &UndoHeader,
    ) -> Option<PageId> {
        let kind = if header.rec_type() == UNDO_OVER_PAGE_INFO {
            DirKind::Overflow
        } else {
            DirKind::Normal
        };
        self.try_frag_page(frag, kind, header.logical_page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_various_info_round_trip() {
        let v = UndoHeader::pack_various(1234, UNDO_OVER_PAGE_INFO, 777);
        let h = UndoHeader {
            table_id: 0,
            root_frag_id: 0,
            local_frag_id: 0,
            various_info: v,
            logical_page_id: 0,
            prev_undo_for_frag: NIL,
            prev_undo: NIL,
        };
        assert_eq!(h.len(), 1234);
        assert_eq!(h.rec_type(), UNDO_OVER_PAGE_INFO);
        assert_eq!(h.page_offset(), 777);
    }

    #[test]
    fn test_header_words_round_trip() {
        let h = UndoHeader {
            table_id: 3,
            root_frag_id: 1,
            local_frag_id: 2,
            various_info: UndoHeader::pack_various(9, UNDO_OP_INFO, 0),
            logical_page_id: 17,
            prev_undo_for_frag: 4096,
            prev_undo: 2048,
        };
        let words = h.to_words();
        assert_eq!(UndoHeader::from_words(&words), h);
    }
}
