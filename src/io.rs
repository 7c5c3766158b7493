use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{
    consts::WORDS_IN_PAGE,
    error::{ErrorKind, SmallError},
    types::SmallResult,
};

/// A thin wrapper around `File` that reads and writes whole 8 KiB pages
/// of little-endian words at page-granular offsets. Both the data files
/// and the undo file group speak this format.
pub struct SmallFile {
    file: File,
}

impl SmallFile {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, SmallError> {
        if let Some(parent) = file_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .or(Err(SmallError::of(ErrorKind::WriteError, "mkdir failed")))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)
            .or(Err(SmallError::of(ErrorKind::ReadError, "open failed")))?;

        Ok(Self { file })
    }

    pub fn open_readonly<P: AsRef<Path>>(file_path: P) -> Result<Self, SmallError> {
        let file = OpenOptions::new()
            .read(true)
            .open(file_path)
            .or(Err(SmallError::of(ErrorKind::ReadError, "open failed")))?;
        Ok(Self { file })
    }

    pub fn write_page(&mut self, file_page: u32, words: &[u32; WORDS_IN_PAGE]) -> SmallResult {
        let mut buf = Vec::with_capacity(WORDS_IN_PAGE * 4);
        for w in words.iter() {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        self.file
            .seek(SeekFrom::Start(file_page as u64 * (WORDS_IN_PAGE as u64 * 4)))
            .or(Err(SmallError::of(ErrorKind::WriteError, "seek failed")))?;
        self.file
            .write_all(&buf)
            .or(Err(SmallError::of(ErrorKind::WriteError, "write failed")))?;
        Ok(())
    }

    pub fn read_page(&mut self, file_page: u32, words: &mut [u32; WORDS_IN_PAGE]) -> SmallResult {
        let mut buf = vec![0u8; WORDS_IN_PAGE * 4];
        self.file
            .seek(SeekFrom::Start(file_page as u64 * (WORDS_IN_PAGE as u64 * 4)))
            .or(Err(SmallError::of(ErrorKind::ReadError, "seek failed")))?;
        self.file
            .read_exact(&mut buf)
            .or(Err(SmallError::of(ErrorKind::ReadError, "short read")))?;
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    pub fn page_count(&self) -> Result<u32, SmallError> {
        let metadata = self
            .file
            .metadata()
            .or(Err(SmallError::of(ErrorKind::ReadError, "io error")))?;
        Ok((metadata.len() / (WORDS_IN_PAGE as u64 * 4)) as u32)
    }

    pub fn sync(&mut self) -> SmallResult {
        self.file
            .sync_all()
            .or(Err(SmallError::of(ErrorKind::WriteError, "sync failed")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round_trip() {
        let dir = std::env::temp_dir().join("small-hash-io-test");
        let path = dir.join("pages.dat");
        let _ = std::fs::remove_file(&path);

        let mut file = SmallFile::open(&path).unwrap();
        let mut page = [0u32; WORDS_IN_PAGE];
        page[0] = 0xDEAD_BEEF;
        page[WORDS_IN_PAGE - 1] = 42;
        file.write_page(3, &page).unwrap();

        let mut back = [0u32; WORDS_IN_PAGE];
        file.read_page(3, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
        assert_eq!(file.page_count().unwrap(), 4);

        let _ = std::fs::remove_file(&path);
    }
}
