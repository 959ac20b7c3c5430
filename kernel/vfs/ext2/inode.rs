//! Ext2 node adapter
//!
//! [`Ext2Inode`] is a thin `(filesystem, inode number)` pair. Nothing about
//! the on-disk inode is cached here: every operation re-reads the record
//! under the filesystem's I/O lock, so two handles to the same inode always
//! agree.

use super::dir::{check_name, file_type_from_code};
use super::layout::RawInode;
use super::Ext2Fs;
use crate::traits::Inode;
use crate::types::{
    DirEntry, FileMode, FileType, FsError, OpenFlags, Stat, TimeSpec, S_IFMT,
};
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::cmp;
use log::trace;

/// Targets shorter than this are stored in the block pointer array.
pub const FAST_SYMLINK_MAX: usize = 60;

/// Ext2 inode wrapper
pub struct Ext2Inode {
    fs: Arc<Ext2Fs>,
    ino: u32,
}

impl Ext2Inode {
    pub(crate) fn new(fs: Arc<Ext2Fs>, ino: u32) -> Arc<Self> {
        Arc::new(Self { fs, ino })
    }

    pub fn fs(&self) -> &Arc<Ext2Fs> {
        &self.fs
    }

    pub fn ino32(&self) -> u32 {
        self.ino
    }

    /// Current on-disk record.
    pub fn raw(&self) -> Result<RawInode, FsError> {
        let _io = self.fs.lock_io();
        self.fs.read_inode(self.ino)
    }

    fn read_data(&self, raw: &RawInode, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let size = raw.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let fs = &self.fs;
        let bs = fs.block_size() as u64;
        let total = cmp::min(buf.len() as u64, size - offset) as usize;

        let mut done = 0;
        while done < total {
            let pos = offset + done as u64;
            let in_block = (pos % bs) as usize;
            let chunk = cmp::min(bs as usize - in_block, total - done);
            let dst = &mut buf[done..done + chunk];
            match fs.map_block(raw, pos / bs)? {
                Some(phys) => {
                    let block = fs.read_block(phys)?;
                    dst.copy_from_slice(&block[in_block..in_block + chunk]);
                }
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Write `data` at `offset`, allocating blocks on the way.
    ///
    /// Running out of space or file range after some bytes went to disk is a
    /// short write: the size covers what was stored and the count is
    /// returned. The error surfaces only when nothing could be written.
    fn write_data(&self, raw: &mut RawInode, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let fs = &self.fs;
        let bs = fs.block_size() as u64;
        offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let in_block = (pos % bs) as usize;
            let chunk = cmp::min(bs as usize - in_block, data.len() - done);

            let (phys, fresh) = match fs.extend_to(self.ino, raw, pos / bs) {
                Ok(mapped) => mapped,
                Err(e @ (FsError::NoSpace | FsError::FileTooLarge)) if done > 0 => {
                    trace!(
                        "ext2: inode {}: short write {}/{}: {}",
                        self.ino,
                        done,
                        data.len(),
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            let mut block = if fresh || chunk == bs as usize {
                fs.zero_block()
            } else {
                fs.read_block(phys)?
            };
            block[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
            fs.write_block(phys, &block)?;
            done += chunk;
        }

        let end = offset + done as u64;
        if end > raw.size() {
            raw.set_size(end);
        }
        let now = fs.now();
        raw.mtime = now;
        raw.ctime = now;
        fs.write_inode(self.ino, raw)?;
        Ok(done)
    }

    /// Create a directory entry `name` for a new inode of `file_type`.
    fn new_child(
        &self,
        name: &str,
        file_type: FileType,
        perm: u16,
        link_target: &[u8],
    ) -> Result<Arc<Ext2Inode>, FsError> {
        check_name(name)?;
        let fs = &self.fs;
        let _io = fs.lock_io();
        fs.ensure_writable()?;

        let mut parent = fs.read_inode(self.ino)?;
        if !parent.is_dir() {
            return Err(FsError::NotDir);
        }
        if fs.dir_find(&parent, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let is_dir = file_type == FileType::Directory;
        let ino = fs.allocate_inode(is_dir)?;
        let now = fs.now();
        let mut raw = RawInode::new(file_type, perm, now);
        fs.init_inode(ino, &raw)?;

        match file_type {
            FileType::Directory => {
                raw.links_count = 2;
                let (phys, _) = fs.extend_to(ino, &mut raw, 0)?;
                let mut block = fs.zero_block();
                fs.dir_init_block(&mut block, ino, self.ino);
                fs.write_block(phys, &block)?;
                raw.set_size(fs.block_size() as u64);
                fs.write_inode(ino, &raw)?;
            }
            FileType::Symlink if link_target.len() < FAST_SYMLINK_MAX => {
                raw.set_block_bytes(link_target);
                raw.set_size(link_target.len() as u64);
                fs.write_inode(ino, &raw)?;
            }
            FileType::Symlink => {
                let (phys, _) = fs.extend_to(ino, &mut raw, 0)?;
                let mut block = fs.zero_block();
                block[..link_target.len()].copy_from_slice(link_target);
                fs.write_block(phys, &block)?;
                raw.set_size(link_target.len() as u64);
                fs.write_inode(ino, &raw)?;
            }
            _ => {}
        }

        fs.dir_append(self.ino, &mut parent, name, ino, file_type)?;
        if is_dir {
            parent.links_count = parent.links_count.saturating_add(1);
        }
        parent.mtime = now;
        parent.ctime = now;
        fs.write_inode(self.ino, &parent)?;

        trace!("ext2: created {} as inode {} under {}", name, ino, self.ino);
        Ok(Ext2Inode::new(Arc::clone(fs), ino))
    }

    fn update(&self, f: impl FnOnce(&mut RawInode)) -> Result<(), FsError> {
        let _io = self.fs.lock_io();
        self.fs.ensure_writable()?;
        let mut raw = self.fs.read_inode(self.ino)?;
        f(&mut raw);
        raw.ctime = self.fs.now();
        self.fs.write_inode(self.ino, &raw)
    }
}

fn timespec(secs: u32) -> TimeSpec {
    TimeSpec::new(secs as i64, 0)
}

impl Inode for Ext2Inode {
    fn ino(&self) -> u64 {
        self.ino as u64
    }

    fn fs_id(&self) -> u64 {
        crate::traits::FileSystem::fs_id(self.fs.as_ref())
    }

    fn stat(&self) -> Result<Stat, FsError> {
        let raw = self.raw()?;
        Ok(Stat {
            dev: self.fs_id(),
            ino: self.ino as u64,
            mode: FileMode::from_raw(raw.mode),
            nlink: raw.links_count as u32,
            uid: raw.full_uid(),
            gid: raw.full_gid(),
            rdev: 0,
            size: raw.size(),
            blksize: self.fs.block_size(),
            blocks: raw.blocks as u64,
            atime: timespec(raw.atime),
            mtime: timespec(raw.mtime),
            ctime: timespec(raw.ctime),
        })
    }

    fn open(&self, flags: OpenFlags) -> Result<(), FsError> {
        if flags.is_path_only() || !flags.is_writable() {
            return Ok(());
        }
        let raw = self.raw()?;
        if raw.is_dir() {
            return Err(FsError::IsDir);
        }
        self.fs.ensure_writable()?;
        if flags.contains(OpenFlags::TRUNC) && raw.size() > 0 {
            // blocks are never freed
            return Err(FsError::NotSupported);
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let _io = self.fs.lock_io();
        let raw = self.fs.read_inode(self.ino)?;
        if raw.is_dir() {
            return Err(FsError::IsDir);
        }
        self.read_data(&raw, offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let _io = self.fs.lock_io();
        self.fs.ensure_writable()?;
        let mut raw = self.fs.read_inode(self.ino)?;
        if raw.is_dir() {
            return Err(FsError::IsDir);
        }
        if !raw.is_regular() {
            return Err(FsError::Invalid);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.write_data(&mut raw, offset, data)
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        let _io = self.fs.lock_io();
        let raw = self.fs.read_inode(self.ino)?;
        if !raw.is_dir() {
            return Err(FsError::NotDir);
        }

        for (i, rec) in self.fs.dir_entries(&raw).enumerate() {
            let rec = rec?;
            if i != index {
                continue;
            }
            let file_type = match file_type_from_code(rec.file_type) {
                Some(t) => t,
                None => self
                    .fs
                    .read_inode(rec.inode)?
                    .file_type()
                    .unwrap_or(FileType::Regular),
            };
            return Ok(Some(DirEntry {
                name: String::from_utf8_lossy(&rec.name).into_owned(),
                ino: rec.inode as u64,
                file_type,
            }));
        }
        Ok(None)
    }

    fn finddir(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        let _io = self.fs.lock_io();
        let raw = self.fs.read_inode(self.ino)?;
        if !raw.is_dir() {
            return Err(FsError::NotDir);
        }
        let rec = self.fs.dir_find(&raw, name)?.ok_or(FsError::NotFound)?;
        if rec.inode > self.fs.superblock().inodes_count {
            return Err(FsError::Corrupt);
        }
        Ok(Ext2Inode::new(Arc::clone(&self.fs), rec.inode))
    }

    fn create(&self, name: &str, perm: u16) -> Result<Arc<dyn Inode>, FsError> {
        let child = self.new_child(name, FileType::Regular, perm, &[])?;
        Ok(child)
    }

    fn mkdir(&self, name: &str, perm: u16) -> Result<Arc<dyn Inode>, FsError> {
        let child = self.new_child(name, FileType::Directory, perm, &[])?;
        Ok(child)
    }

    fn symlink(&self, target: &str, name: &str) -> Result<(), FsError> {
        if target.is_empty() {
            return Err(FsError::Invalid);
        }
        if target.len() > self.fs.block_size() as usize {
            return Err(FsError::NameTooLong);
        }
        self.new_child(name, FileType::Symlink, 0o777, target.as_bytes())
            .map(|_| ())
    }

    fn readlink(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let _io = self.fs.lock_io();
        let raw = self.fs.read_inode(self.ino)?;
        if !raw.is_symlink() {
            return Err(FsError::Invalid);
        }
        let len = raw.size() as usize;

        if raw.blocks == 0 {
            if len > FAST_SYMLINK_MAX {
                return Err(FsError::Corrupt);
            }
            let inline = raw.block_bytes();
            let n = cmp::min(len, buf.len());
            buf[..n].copy_from_slice(&inline[..n]);
        } else {
            let n = cmp::min(len, buf.len());
            self.read_data(&raw, 0, &mut buf[..n])?;
        }
        Ok(len)
    }

    fn chmod(&self, perm: u16) -> Result<(), FsError> {
        self.update(|raw| raw.mode = (raw.mode & S_IFMT) | (perm & 0o7777))
    }

    fn chown(&self, uid: u32, gid: u32) -> Result<(), FsError> {
        self.update(|raw| raw.set_owner(uid, gid))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::mkfs::{self, ImageSpec};
    use crate::traits::FileSystem;
    use alloc::vec;
    use alloc::vec::Vec;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn new_file(fs: &Arc<Ext2Fs>, name: &str) -> Arc<dyn Inode> {
        fs.root().create(name, 0o644).unwrap()
    }

    fn read_all(node: &Arc<dyn Inode>, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = node.read_at(offset, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_round_trip_across_direct_to_single_indirect() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "a");
        // blocks 10..=13 at 1 KiB blocks
        let data = pattern(4 * 1024 - 100, 7);
        let offset = 10 * 1024 + 50;
        assert_eq!(file.write_at(offset, &data).unwrap(), data.len());
        assert_eq!(read_all(&file, offset, data.len()), data);
        assert_eq!(file.stat().unwrap().size, offset + data.len() as u64);
    }

    #[test]
    fn test_round_trip_across_single_to_double_indirect() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "big");
        // logical blocks 267 and 268 straddle the double-indirect start
        let offset = 267 * 1024 + 1000;
        let data = pattern(2000, 3);
        file.write_at(offset, &data).unwrap();
        assert_eq!(read_all(&file, offset, data.len()), data);

        let file_raw = file
            .as_any()
            .downcast_ref::<Ext2Inode>()
            .unwrap()
            .raw()
            .unwrap();
        assert_ne!(file_raw.block[super::super::EXT2_DIND_BLOCK], 0);
    }

    #[test]
    fn test_round_trip_across_double_to_triple_indirect() {
        // enough blocks for a file reaching past 64 MiB of logical space
        let spec = ImageSpec {
            groups: 9,
            blocks_per_group: 8192,
            ..ImageSpec::default()
        };
        let (fs, disk) = mkfs::mount_fresh(spec);
        let first_triple = 12 + 256 + 256 * 256;
        let offset = first_triple * 1024 - 1000;
        let data = pattern(2000, 9);
        {
            let file = new_file(&fs, "huge");
            assert_eq!(file.write_at(offset, &data).unwrap(), 2000);
        }
        fs.sync().unwrap();
        drop(fs);

        let fs = mkfs::remount(&disk);
        let file = fs.root().finddir("huge").unwrap();
        assert_eq!(read_all(&file, offset, data.len()), data);
        assert_eq!(read_all(&file, offset - 24, 24), vec![0u8; 24]);
        assert_eq!(file.stat().unwrap().size, offset + 2000);

        let raw = file.as_any().downcast_ref::<Ext2Inode>().unwrap().raw().unwrap();
        assert_ne!(raw.block[super::super::EXT2_TIND_BLOCK], 0);
        // two data blocks, three tables on the triple path, two on the double
        assert_eq!(file.stat().unwrap().blocks, 14);
    }

    #[test]
    fn test_sparse_extension_reads_zero() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "sparse");
        file.write_at(40 * 1024, b"tail").unwrap();

        let head = read_all(&file, 0, 40 * 1024);
        assert_eq!(head.len(), 40 * 1024);
        assert!(head.iter().all(|&b| b == 0));
        assert_eq!(read_all(&file, 40 * 1024, 16), b"tail");
    }

    #[test]
    fn test_partial_overwrite_keeps_neighbours() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "f");
        file.write_at(0, &pattern(3000, 1)).unwrap();
        file.write_at(1500, b"XYZ").unwrap();

        let mut expect = pattern(3000, 1);
        expect[1500..1503].copy_from_slice(b"XYZ");
        assert_eq!(read_all(&file, 0, 4000), expect);
    }

    #[test]
    fn test_write_5000_bytes_and_remount() {
        let spec = ImageSpec {
            block_size: 1024,
            groups: 2,
            inodes_per_group: 128,
            ..ImageSpec::default()
        };
        let (fs, disk) = mkfs::mount_fresh(spec);
        let data = pattern(5000, 42);
        {
            let file = new_file(&fs, "data.bin");
            assert_eq!(file.write_at(0, &data).unwrap(), 5000);
            file.close();
        }
        fs.sync().unwrap();
        drop(fs);

        let fs = mkfs::remount(&disk);
        let file = fs.root().finddir("data.bin").unwrap();
        file.open(OpenFlags::RDONLY).unwrap();
        assert_eq!(read_all(&file, 0, 5000), data);
        assert_eq!(file.stat().unwrap().size, 5000);
        // 5 data blocks of 1 KiB, no indirect table
        assert_eq!(file.stat().unwrap().blocks, 10);
    }

    #[test]
    fn test_mkdir_and_lookup() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let root = fs.root();
        let a = root.mkdir("a", 0o755).unwrap();
        let b = a.mkdir("b", 0o700).unwrap();

        assert_eq!(root.finddir("a").unwrap().ino(), a.ino());
        assert_eq!(b.finddir("..").unwrap().ino(), a.ino());
        assert_eq!(b.finddir(".").unwrap().ino(), b.ino());
        assert_eq!(a.stat().unwrap().nlink, 3);
        assert_eq!(root.stat().unwrap().nlink, 3);
        assert_eq!(b.stat().unwrap().mode, FileMode::directory(0o700));

        let names: Vec<String> = (0..)
            .map_while(|i| a.readdir(i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "b"]);
        assert_eq!(a.readdir(1).unwrap().unwrap().file_type, FileType::Directory);

        assert_eq!(root.mkdir("a", 0o755).err(), Some(FsError::Exists));
        assert_eq!(root.create("a", 0o644).err(), Some(FsError::Exists));
        assert_eq!(root.finddir("nope").err(), Some(FsError::NotFound));
    }

    #[test]
    fn test_file_is_not_a_directory() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "plain");
        assert_eq!(file.finddir("x").err(), Some(FsError::NotDir));
        assert_eq!(file.readdir(0), Err(FsError::NotDir));
        assert_eq!(file.create("x", 0o644).err(), Some(FsError::NotDir));
        let root: Arc<dyn Inode> = fs.root();
        assert_eq!(root.read_at(0, &mut [0u8; 4]), Err(FsError::IsDir));
        assert_eq!(root.write_at(0, b"x"), Err(FsError::IsDir));
    }

    #[test]
    fn test_fast_and_slow_symlinks() {
        let (fs, disk) = mkfs::mount_fresh(ImageSpec::default());
        let root = fs.root();
        root.symlink("/short/target", "fast").unwrap();
        let long = "x/".repeat(100);
        root.symlink(&long, "slow").unwrap();

        let fast = root.finddir("fast").unwrap();
        let slow = root.finddir("slow").unwrap();
        assert_eq!(fast.stat().unwrap().blocks, 0);
        assert_eq!(slow.stat().unwrap().blocks, 2);
        assert_eq!(fast.stat().unwrap().mode.file_type, FileType::Symlink);

        let mut buf = [0u8; 512];
        let n = fast.readlink(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"/short/target");
        let n = slow.readlink(&mut buf).unwrap();
        assert_eq!(&buf[..n], long.as_bytes());

        // short buffers report the full length
        let mut small = [0u8; 4];
        assert_eq!(slow.readlink(&mut small).unwrap(), long.len());
        assert_eq!(&small, b"x/x/");

        assert_eq!(root.readlink(&mut buf), Err(FsError::Invalid));
        assert_eq!(root.symlink("", "empty"), Err(FsError::Invalid));
        assert_eq!(
            root.symlink(&"y".repeat(2000), "huge"),
            Err(FsError::NameTooLong)
        );

        fs.sync().unwrap();
        drop((fast, slow, root, fs));
        let fs = mkfs::remount(&disk);
        let n = fs.root().finddir("slow").unwrap().readlink(&mut buf).unwrap();
        assert_eq!(&buf[..n], long.as_bytes());
    }

    #[test]
    fn test_chmod_chown() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let file = new_file(&fs, "f");
        file.chmod(0o4750).unwrap();
        file.chown(70000, 100).unwrap();

        let st = file.stat().unwrap();
        assert_eq!(st.mode, FileMode::regular(0o4750));
        assert_eq!((st.uid, st.gid), (70000, 100));
    }

    #[test]
    fn test_open_flags_checked() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let root: Arc<dyn Inode> = fs.root();
        assert_eq!(root.open(OpenFlags::RDWR), Err(FsError::IsDir));
        assert!(root.open(OpenFlags::RDONLY).is_ok());

        let file = new_file(&fs, "f");
        assert!(file.open(OpenFlags::WRONLY | OpenFlags::TRUNC).is_ok());
        file.write_at(0, b"data").unwrap();
        assert_eq!(
            file.open(OpenFlags::WRONLY | OpenFlags::TRUNC),
            Err(FsError::NotSupported)
        );
    }

    #[test]
    fn test_no_space_surfaces_to_writer() {
        let spec = ImageSpec {
            blocks_per_group: 128,
            groups: 1,
            ..ImageSpec::default()
        };
        let (fs, _) = mkfs::mount_fresh(spec);
        let file = new_file(&fs, "filler");
        let chunk = vec![0xAB; 1024];
        let mut offset = 0;
        let err = loop {
            match file.write_at(offset, &chunk) {
                Ok(n) => offset += n as u64,
                Err(e) => break e,
            }
        };
        assert_eq!(err, FsError::NoSpace);
        assert_eq!(fs.free_counts().0, 0);
        // what was written before exhaustion is intact
        assert_eq!(read_all(&file, 0, 1024), chunk);
    }

    #[test]
    fn test_no_space_mid_write_is_short_write() {
        let spec = ImageSpec {
            blocks_per_group: 128,
            groups: 1,
            ..ImageSpec::default()
        };
        let (fs, _) = mkfs::mount_fresh(spec);
        let file = new_file(&fs, "big");
        let free = fs.free_counts().0 as usize;
        let data = vec![0xAB; (free + 4) * 1024];

        // starts mid-block so the stored prefix is not block aligned
        let n = file.write_at(100, &data).unwrap();
        assert!(n > 0 && n < data.len());
        assert_eq!(fs.free_counts().0, 0);
        assert_eq!(file.stat().unwrap().size, 100 + n as u64);
        assert_eq!(read_all(&file, 0, 100), vec![0u8; 100]);
        assert_eq!(read_all(&file, 100, data.len()), vec![0xAB; n]);

        // nothing fits any more: the error reaches the caller
        assert_eq!(
            file.write_at(100 + n as u64 + 5000, b"x"),
            Err(FsError::NoSpace)
        );
        assert_eq!(file.stat().unwrap().size, 100 + n as u64);
    }
}
