//! Directory records
//!
//! A directory's data blocks hold back-to-back variable-length records. The
//! last record of every block stretches to the block end, so the directory
//! size always equals the sum of all `rec_len` values. Records are only ever
//! appended: deleted entries are not reclaimed.

use super::layout::{dirent_min_len, parse_dirent, write_dirent, RawInode, DIRENT_HEADER_LEN};
use super::{
    Ext2Fs, EXT2_FT_BLKDEV, EXT2_FT_CHRDEV, EXT2_FT_DIR, EXT2_FT_FIFO, EXT2_FT_REG_FILE,
    EXT2_FT_SOCK, EXT2_FT_SYMLINK, EXT2_FT_UNKNOWN, EXT2_NAME_LEN,
};
use crate::types::{FileType, FsError};
use alloc::vec::Vec;

/// Decoded directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirRecord {
    pub inode: u32,
    pub rec_len: usize,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirRecord {
    #[inline]
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }
}

pub(crate) fn file_type_code(file_type: FileType) -> u8 {
    match file_type {
        FileType::Regular => EXT2_FT_REG_FILE,
        FileType::Directory => EXT2_FT_DIR,
        FileType::CharDevice => EXT2_FT_CHRDEV,
        FileType::BlockDevice => EXT2_FT_BLKDEV,
        FileType::Fifo => EXT2_FT_FIFO,
        FileType::Socket => EXT2_FT_SOCK,
        FileType::Symlink => EXT2_FT_SYMLINK,
    }
}

pub(crate) fn file_type_from_code(code: u8) -> Option<FileType> {
    match code {
        EXT2_FT_REG_FILE => Some(FileType::Regular),
        EXT2_FT_DIR => Some(FileType::Directory),
        EXT2_FT_CHRDEV => Some(FileType::CharDevice),
        EXT2_FT_BLKDEV => Some(FileType::BlockDevice),
        EXT2_FT_FIFO => Some(FileType::Fifo),
        EXT2_FT_SOCK => Some(FileType::Socket),
        EXT2_FT_SYMLINK => Some(FileType::Symlink),
        _ => None,
    }
}

/// Validate a name for a new entry.
pub(crate) fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::Invalid);
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Iterator over every record of a directory, deleted ones included.
///
/// Restartable only by creating a new iterator. Stops at the first error.
pub(crate) struct DirIter<'a> {
    fs: &'a Ext2Fs,
    raw: &'a RawInode,
    size: u64,
    lb: u64,
    block: Vec<u8>,
    offset: usize,
    consumed: u64,
    failed: bool,
}

impl<'a> DirIter<'a> {
    fn load_next_block(&mut self) -> Result<(), FsError> {
        let phys = self
            .fs
            .map_block(self.raw, self.lb)?
            .ok_or(FsError::Corrupt)?;
        self.block = self.fs.read_block(phys)?;
        self.lb += 1;
        self.offset = 0;
        Ok(())
    }

    fn step(&mut self) -> Result<Option<DirRecord>, FsError> {
        if self.consumed >= self.size {
            return Ok(None);
        }
        if self.block.is_empty() || self.offset >= self.block.len() {
            self.load_next_block()?;
        }

        let head = parse_dirent(&self.block, self.offset)?;
        let start = self.offset + DIRENT_HEADER_LEN;
        let name = self.block[start..start + head.name_len as usize].to_vec();

        self.offset += head.rec_len;
        self.consumed += head.rec_len as u64;
        Ok(Some(DirRecord {
            inode: head.inode,
            rec_len: head.rec_len,
            file_type: head.file_type,
            name,
        }))
    }
}

impl<'a> Iterator for DirIter<'a> {
    type Item = Result<DirRecord, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(rec) => rec.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl Ext2Fs {
    pub(crate) fn dir_records<'a>(&'a self, raw: &'a RawInode) -> DirIter<'a> {
        DirIter {
            fs: self,
            raw,
            size: raw.size(),
            lb: 0,
            block: Vec::new(),
            offset: 0,
            consumed: 0,
            failed: false,
        }
    }

    /// Live entries only.
    pub(crate) fn dir_entries<'a>(
        &'a self,
        raw: &'a RawInode,
    ) -> impl Iterator<Item = Result<DirRecord, FsError>> + 'a {
        self.dir_records(raw)
            .filter(|r| r.as_ref().map_or(true, DirRecord::is_live))
    }

    /// Linear search; the length comparison rejects most entries before
    /// the bytes are compared.
    pub(crate) fn dir_find(&self, raw: &RawInode, name: &str) -> Result<Option<DirRecord>, FsError> {
        let name = name.as_bytes();
        for rec in self.dir_entries(raw) {
            let rec = rec?;
            if rec.name.len() == name.len() && rec.name == name {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Append an entry for `child` to directory `dir_ino`.
    ///
    /// The caller has checked the name and that it is not present yet.
    pub(crate) fn dir_append(
        &self,
        dir_ino: u32,
        raw: &mut RawInode,
        name: &str,
        child: u32,
        file_type: FileType,
    ) -> Result<(), FsError> {
        let bs = self.block_size as u64;
        let name = name.as_bytes();
        let need = dirent_min_len(name.len());
        let ft = if self.has_filetype() {
            file_type_code(file_type)
        } else {
            EXT2_FT_UNKNOWN
        };

        let size = raw.size();
        if size % bs != 0 {
            return Err(FsError::Corrupt);
        }

        if size > 0 {
            let lb = size / bs - 1;
            let phys = self.map_block(raw, lb)?.ok_or(FsError::Corrupt)?;
            let mut block = self.read_block(phys)?;

            // last record of the last block
            let mut off = 0;
            let head = loop {
                let head = parse_dirent(&block, off)?;
                if off + head.rec_len == block.len() {
                    break head;
                }
                off += head.rec_len;
            };

            let rec_len = head.rec_len;
            if head.inode == 0 && rec_len >= need {
                write_dirent(&mut block, off, child, head.rec_len, name, ft);
                return self.write_block(phys, &block);
            }

            let used = dirent_min_len(head.name_len as usize);
            if rec_len - used >= need {
                let name_start = off + DIRENT_HEADER_LEN;
                let prev = block[name_start..name_start + head.name_len as usize].to_vec();
                write_dirent(&mut block, off, head.inode, used, &prev, head.file_type);
                write_dirent(&mut block, off + used, child, rec_len - used, name, ft);
                return self.write_block(phys, &block);
            }
        }

        // open a new block
        let lb = size / bs;
        let (phys, _) = self.extend_to(dir_ino, raw, lb)?;
        let mut block = self.zero_block();
        write_dirent(&mut block, 0, child, self.block_size as usize, name, ft);
        self.write_block(phys, &block)?;
        raw.set_size(size + bs);
        self.write_inode(dir_ino, raw)
    }

    /// Fill a fresh directory block with `.` and `..`.
    pub(crate) fn dir_init_block(&self, block: &mut [u8], self_ino: u32, parent_ino: u32) {
        let ft = if self.has_filetype() { EXT2_FT_DIR } else { EXT2_FT_UNKNOWN };
        let dot = dirent_min_len(1);
        write_dirent(block, 0, self_ino, dot, b".", ft);
        write_dirent(block, dot, parent_ino, block.len() - dot, b"..", ft);
    }
}
