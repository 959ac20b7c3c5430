//! Block Layer
//!
//! Core abstractions for sector-addressed storage used by the filesystem
//! engines:
//!
//! ```text
//! +----------------+
//! | File System    |   ext2 engine (vfs crate)
//! +--------+-------+
//!          |  read_block / write_block
//!          v
//! +--------+-------+
//! | BlockAdapter   |   logical block -> sector range (+ partition offset)
//! +--------+-------+
//!          |  read_sync / write_sync
//!          v
//!    +-----+------------+
//!    |                  |
//!    v                  v
//! +-------+      +--------------+
//! |RamDisk|      | disk drivers |   BlockDevice implementations
//! +-------+      +--------------+
//! ```
//!
//! # Key Components
//!
//! - [`BlockDevice`]: Trait for block device drivers
//! - [`BlockAdapter`]: Whole-block I/O on top of a sector device
//! - [`RamDisk`]: In-memory image device
//! - [`BlockDeviceRegistry`]: Global registry for block devices

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod adapter;
pub mod ramdisk;

pub use adapter::BlockAdapter;
pub use ramdisk::RamDisk;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, info};
use spin::RwLock;

/// Sector size reported by devices that do not override it.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Upper bound on simultaneously registered devices.
pub const MAX_BLOCK_DEVICES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The device reported a transfer failure.
    Io,
    /// Misaligned offset or a buffer that is not a whole number of sectors.
    Invalid,
    /// The request ends past the last sector.
    OutOfRange,
    NotSupported,
    /// No device registered under that name.
    NotFound,
    ReadOnly,
    /// Registry capacity exhausted.
    NoMem,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BlockError::Io => "I/O error",
            BlockError::Invalid => "malformed transfer",
            BlockError::OutOfRange => "request beyond end of device",
            BlockError::NotSupported => "operation not supported",
            BlockError::NotFound => "no such device",
            BlockError::ReadOnly => "device is read-only",
            BlockError::NoMem => "device table full",
        };
        f.write_str(msg)
    }
}

/// A sector-addressed storage device.
///
/// Every transfer is synchronous and covers whole sectors: `buf.len()` is a
/// multiple of [`BlockDevice::sector_size`] and the return value is the
/// byte count moved. Implementations validate requests with
/// [`check_transfer`].
pub trait BlockDevice: Send + Sync {
    /// Registry key, e.g. `"ram0"`.
    fn name(&self) -> &str;

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn capacity_sectors(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }

    fn read_sync(&self, sector: u64, buf: &mut [u8]) -> Result<usize, BlockError>;

    /// Devices without a write path keep the default.
    fn write_sync(&self, sector: u64, buf: &[u8]) -> Result<usize, BlockError> {
        let _ = (sector, buf);
        Err(BlockError::NotSupported)
    }

    fn flush(&self) -> Result<(), BlockError> {
        Err(BlockError::NotSupported)
    }
}

/// Reject a transfer of `len` bytes at `sector` that is not sector-granular
/// or does not fit in `capacity_sectors`.
pub fn check_transfer(
    sector: u64,
    len: usize,
    sector_size: u32,
    capacity_sectors: u64,
) -> Result<(), BlockError> {
    let sector_size = sector_size as usize;
    if sector_size == 0 || len % sector_size != 0 {
        return Err(BlockError::Invalid);
    }
    let end = sector
        .checked_add((len / sector_size) as u64)
        .ok_or(BlockError::OutOfRange)?;
    if end > capacity_sectors {
        return Err(BlockError::OutOfRange);
    }
    Ok(())
}

/// Name-keyed table of attached devices.
///
/// Filesystem mount callbacks resolve the device named in their argument
/// string through this table.
pub struct BlockDeviceRegistry {
    devices: RwLock<BTreeMap<String, Arc<dyn BlockDevice>>>,
}

impl BlockDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Attach `device` under its own name. Names are unique.
    pub fn register(&self, device: Arc<dyn BlockDevice>) -> Result<(), BlockError> {
        let mut devices = self.devices.write();
        if devices.contains_key(device.name()) {
            return Err(BlockError::Invalid);
        }
        if devices.len() >= MAX_BLOCK_DEVICES {
            return Err(BlockError::NoMem);
        }
        devices.insert(device.name().into(), device);
        Ok(())
    }

    /// Detach a device, handing it back to the caller.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn BlockDevice>, BlockError> {
        self.devices.write().remove(name).ok_or(BlockError::NotFound)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices.read().get(name).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl Default for BlockDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// System-wide device table used by the free functions below.
    pub static ref BLOCK_REGISTRY: BlockDeviceRegistry = BlockDeviceRegistry::new();
}

pub fn register_device(device: Arc<dyn BlockDevice>) -> Result<(), BlockError> {
    BLOCK_REGISTRY.register(device.clone())?;
    info!(
        "block: attached {} ({} x {}-byte sectors{})",
        device.name(),
        device.capacity_sectors(),
        device.sector_size(),
        if device.is_read_only() { ", ro" } else { "" }
    );
    Ok(())
}

pub fn unregister_device(name: &str) -> Result<(), BlockError> {
    BLOCK_REGISTRY.unregister(name)?;
    debug!("block: detached {}", name);
    Ok(())
}

pub fn get_device(name: &str) -> Option<Arc<dyn BlockDevice>> {
    BLOCK_REGISTRY.get(name)
}

pub fn list_devices() -> Vec<String> {
    BLOCK_REGISTRY.names()
}
