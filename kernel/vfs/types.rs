//! VFS common types
//!
//! Error codes, file modes, stat buffers, open flags and the caller context
//! shared by every filesystem implementation.

use alloc::string::String;
use alloc::vec::Vec;
use block::BlockError;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Errors
// ============================================================================

/// Filesystem error.
///
/// Every variant maps to a conventional errno through [`FsError::errno`];
/// none of them carries block numbers or other on-disk internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Missing path component or directory entry
    NotFound,
    /// Directory operation on a non-directory
    NotDir,
    /// File operation on a directory
    IsDir,
    /// Create/mkdir target already present
    Exists,
    /// No free inode or block in any group
    NoSpace,
    /// Symlink recursion bound reached, or final symlink with O_NOFOLLOW
    SymlinkLoop,
    /// Symlink target longer than the resolver accepts
    SymlinkTooLong,
    /// Path component longer than the filesystem allows
    NameTooLong,
    /// Superblock magic mismatch
    BadMagic,
    /// On-disk structure violates an invariant
    Corrupt,
    /// Device I/O failure
    Io,
    /// Filesystem or device is read-only
    ReadOnly,
    /// Invalid argument
    Invalid,
    /// Permission denied
    PermDenied,
    /// Operation not supported by this node
    NotSupported,
    /// File offset beyond the addressable range
    FileTooLarge,
    /// Unknown filesystem type or device
    NoDevice,
}

impl FsError {
    /// Negative errno value for the syscall layer.
    pub fn errno(self) -> i32 {
        let code = match self {
            FsError::NotFound => 2,        // ENOENT
            FsError::Io => 5,              // EIO
            FsError::PermDenied => 13,     // EACCES
            FsError::Exists => 17,         // EEXIST
            FsError::NoDevice => 19,       // ENODEV
            FsError::NotDir => 20,         // ENOTDIR
            FsError::IsDir => 21,          // EISDIR
            FsError::Invalid => 22,        // EINVAL
            FsError::BadMagic => 22,       // EINVAL
            FsError::FileTooLarge => 27,   // EFBIG
            FsError::NoSpace => 28,        // ENOSPC
            FsError::ReadOnly => 30,       // EROFS
            FsError::NameTooLong => 36,    // ENAMETOOLONG
            FsError::SymlinkTooLong => 36, // ENAMETOOLONG
            FsError::SymlinkLoop => 40,    // ELOOP
            FsError::NotSupported => 95,   // EOPNOTSUPP
            FsError::Corrupt => 117,       // EUCLEAN
        };
        -code
    }

    /// Symlink resolution failures.
    pub fn is_link_failure(self) -> bool {
        matches!(self, FsError::SymlinkLoop | FsError::SymlinkTooLong)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotDir => "not a directory",
            FsError::IsDir => "is a directory",
            FsError::Exists => "file exists",
            FsError::NoSpace => "no space left on device",
            FsError::SymlinkLoop => "too many levels of symbolic links",
            FsError::SymlinkTooLong => "symbolic link target too long",
            FsError::NameTooLong => "file name too long",
            FsError::BadMagic => "bad superblock magic",
            FsError::Corrupt => "filesystem metadata corrupt",
            FsError::Io => "I/O error",
            FsError::ReadOnly => "read-only filesystem",
            FsError::Invalid => "invalid argument",
            FsError::PermDenied => "permission denied",
            FsError::NotSupported => "operation not supported",
            FsError::FileTooLarge => "file too large",
            FsError::NoDevice => "no such device",
        };
        f.write_str(msg)
    }
}

impl From<BlockError> for FsError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::ReadOnly => FsError::ReadOnly,
            _ => FsError::Io,
        }
    }
}

// ============================================================================
// File modes
// ============================================================================

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Symlink,
    Fifo,
    Socket,
}

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

impl FileType {
    /// Decode the type bits of a raw mode.
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(FileType::Regular),
            S_IFDIR => Some(FileType::Directory),
            S_IFCHR => Some(FileType::CharDevice),
            S_IFBLK => Some(FileType::BlockDevice),
            S_IFLNK => Some(FileType::Symlink),
            S_IFIFO => Some(FileType::Fifo),
            S_IFSOCK => Some(FileType::Socket),
            _ => None,
        }
    }

    /// Type bits for a raw mode.
    pub fn mode_bits(self) -> u16 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Symlink => S_IFLNK,
            FileType::Fifo => S_IFIFO,
            FileType::Socket => S_IFSOCK,
        }
    }
}

/// File type plus permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode {
    pub file_type: FileType,
    pub perm: u16,
}

impl FileMode {
    pub const fn new(file_type: FileType, perm: u16) -> Self {
        Self {
            file_type,
            perm: perm & 0o7777,
        }
    }

    pub const fn regular(perm: u16) -> Self {
        Self::new(FileType::Regular, perm)
    }

    pub const fn directory(perm: u16) -> Self {
        Self::new(FileType::Directory, perm)
    }

    pub const fn symlink() -> Self {
        Self::new(FileType::Symlink, 0o777)
    }

    /// Encode as a raw `st_mode` value.
    pub fn to_raw(&self) -> u16 {
        self.file_type.mode_bits() | (self.perm & 0o7777)
    }

    /// Decode a raw `st_mode` value. Unknown type bits decode as regular.
    pub fn from_raw(mode: u16) -> Self {
        Self::new(
            FileType::from_mode(mode).unwrap_or(FileType::Regular),
            mode & 0o7777,
        )
    }
}

/// Seconds + nanoseconds timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

/// Wall clock in seconds, advanced by the timer subsystem.
static WALL_CLOCK_SECS: AtomicU64 = AtomicU64::new(0);

/// Publish the current wall-clock time (seconds since the epoch).
pub fn set_wall_clock(secs: u64) {
    WALL_CLOCK_SECS.store(secs, Ordering::Relaxed);
}

impl TimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time at second granularity.
    pub fn now() -> Self {
        Self::new(WALL_CLOCK_SECS.load(Ordering::Relaxed) as i64, 0)
    }
}

/// File status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: FileMode,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    /// Allocated 512-byte sectors
    pub blocks: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

/// Directory entry returned by `readdir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub file_type: FileType,
}

// ============================================================================
// Open flags
// ============================================================================

bitflags::bitflags! {
    /// `open(2)` flags. Read-only access is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const CREAT     = 0o100;
        const EXCL      = 0o200;
        const TRUNC     = 0o1000;
        const APPEND    = 0o2000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW  = 0o400000;
        const PATH      = 0o10000000;
    }
}

impl OpenFlags {
    pub const RDONLY: Self = Self::empty();

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        !self.contains(Self::WRONLY)
    }

    #[inline]
    pub fn is_create(&self) -> bool {
        self.contains(Self::CREAT)
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.contains(Self::EXCL)
    }

    #[inline]
    pub fn is_nofollow(&self) -> bool {
        self.contains(Self::NOFOLLOW)
    }

    #[inline]
    pub fn is_path_only(&self) -> bool {
        self.contains(Self::PATH)
    }
}

// ============================================================================
// Caller context
// ============================================================================

/// Identity and working directory of the process issuing a VFS call.
///
/// The process layer builds one per system call; kernel-internal callers use
/// [`Caller::kernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub umask: u16,
}

impl Caller {
    /// Root credentials, working directory `/`, no umask.
    pub fn kernel() -> Self {
        Self {
            cwd: String::from("/"),
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            umask: 0,
        }
    }

    /// Unprivileged caller.
    pub fn user(uid: u32, gid: u32, cwd: &str) -> Self {
        Self {
            cwd: String::from(cwd),
            uid,
            gid,
            groups: Vec::new(),
            umask: 0o022,
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Clear umask bits from requested permissions.
    #[inline]
    pub fn apply_umask(&self, perm: u16) -> u16 {
        perm & !(self.umask & 0o777) & 0o7777
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.iter().any(|&g| g == gid)
    }
}
