// ============================================================================
// src/fs/block.rs - Block Device Abstraction
// ============================================================================
//!
//! ブロックデバイス抽象化レイヤー
//!
//! ## 設計
//! - 統一ブロックデバイスインターフェース (同期・ブロッキング)
//! - 物理ドライバ (ATA/AHCI/VirtIO) はこのトレイトを実装して外部から登録する
//! - パーティション (`DiskPartition`) やループデバイスも同じトレイトで公開する

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

// ============================================================================
// Block Device Error
// ============================================================================

/// Block device error types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// Block address past the end of the device
    OutOfRange,
    /// I/O error
    IoError,
    /// Device is read-only
    ReadOnly,
    /// Buffer length is not `count * block_size`
    InvalidBufferSize,
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

// ============================================================================
// Block Device Trait
// ============================================================================

/// Block device information
#[derive(Clone, Debug)]
pub struct BlockDeviceInfo {
    /// Device name
    pub name: String,
    /// Total number of blocks
    pub total_blocks: u64,
    /// Block size in bytes
    pub block_size: u32,
    /// Is device read-only
    pub read_only: bool,
}

impl Default for BlockDeviceInfo {
    fn default() -> Self {
        Self {
            name: String::from("unknown"),
            total_blocks: 0,
            block_size: 512,
            read_only: false,
        }
    }
}

/// Block device trait
pub trait BlockDevice: Send + Sync {
    /// Get device information
    fn info(&self) -> BlockDeviceInfo;

    /// `count` ブロックを `index` から読み出す
    fn read_blocks(&self, index: u64, count: usize) -> BlockResult<Vec<u8>>;

    /// `count` ブロックを `index` へ書き込む (`data.len() == count * block_size`)
    fn write_blocks(&self, index: u64, count: usize, data: &[u8]) -> BlockResult<()>;

    /// Flush pending writes
    fn flush(&self) -> BlockResult<()> {
        Ok(())
    }

    /// Block size in bytes
    fn block_size(&self) -> usize {
        self.info().block_size as usize
    }

    /// Total number of blocks
    fn block_count(&self) -> u64 {
        self.info().total_blocks
    }
}

/// `[index, index + count)` がデバイス内に収まるか検査
pub(crate) fn check_range(index: u64, count: usize, total_blocks: u64) -> BlockResult<()> {
    let end = index
        .checked_add(count as u64)
        .ok_or(BlockError::OutOfRange)?;
    if end > total_blocks {
        return Err(BlockError::OutOfRange);
    }
    Ok(())
}

// ============================================================================
// RAM Disk Implementation
// ============================================================================

/// Simple RAM disk for testing
pub struct RamDisk {
    /// Device info
    info: BlockDeviceInfo,
    /// Storage
    data: Mutex<Vec<u8>>,
    /// 読み出し要求数
    reads: AtomicU64,
    /// 書き込み要求数
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a new RAM disk
    pub fn new(size_blocks: u64, block_size: u32) -> Self {
        let total_size = size_blocks as usize * block_size as usize;
        Self::from_image(vec![0u8; total_size], block_size)
    }

    /// 既存イメージからRAMディスクを作成 (末尾の端数ブロックは切り捨て)
    pub fn from_image(mut image: Vec<u8>, block_size: u32) -> Self {
        let total_blocks = (image.len() / block_size as usize) as u64;
        image.truncate(total_blocks as usize * block_size as usize);
        Self {
            info: BlockDeviceInfo {
                name: String::from("ramdisk"),
                total_blocks,
                block_size,
                read_only: false,
            },
            data: Mutex::new(image),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// 読み取り専用にする
    pub fn read_only(mut self) -> Self {
        self.info.read_only = true;
        self
    }

    /// デバイス名を設定
    pub fn named(mut self, name: &str) -> Self {
        self.info.name = String::from(name);
        self
    }

    /// 内容のコピーを取得
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// `read_blocks` の呼び出し回数
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// `write_blocks` の呼び出し回数
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn info(&self) -> BlockDeviceInfo {
        self.info.clone()
    }

    fn read_blocks(&self, index: u64, count: usize) -> BlockResult<Vec<u8>> {
        check_range(index, count, self.info.total_blocks)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let block_size = self.info.block_size as usize;
        let offset = index as usize * block_size;
        let data = self.data.lock();
        Ok(data[offset..offset + count * block_size].to_vec())
    }

    fn write_blocks(&self, index: u64, count: usize, buf: &[u8]) -> BlockResult<()> {
        if self.info.read_only {
            return Err(BlockError::ReadOnly);
        }
        let block_size = self.info.block_size as usize;
        if buf.len() != count * block_size {
            return Err(BlockError::InvalidBufferSize);
        }
        check_range(index, count, self.info.total_blocks)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let offset = index as usize * block_size;
        self.data.lock()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

// ============================================================================
// Block Device Manager
// ============================================================================

/// Block device registry entry
struct DeviceEntry {
    /// Device name
    name: String,
    /// Device instance
    device: Arc<dyn BlockDevice>,
}

/// Block device manager
pub struct BlockDeviceManager {
    devices: Mutex<Vec<DeviceEntry>>,
}

impl BlockDeviceManager {
    /// Create a new device manager
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Register a block device (同名のデバイスは置き換える)
    pub fn register(&self, name: &str, device: Arc<dyn BlockDevice>) {
        let mut devices = self.devices.lock();
        if devices.iter().any(|e| e.name == name) {
            log::warn!("block: replacing device {}", name);
        }
        devices.retain(|e| e.name != name);
        devices.push(DeviceEntry {
            name: String::from(name),
            device,
        });
        log::debug!("block: registered {}", name);
    }

    /// Get a device by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.device.clone())
    }

    /// List all devices
    pub fn list(&self) -> Vec<String> {
        self.devices.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Remove a device
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        let mut devices = self.devices.lock();
        let pos = devices.iter().position(|e| e.name == name)?;
        Some(devices.remove(pos).device)
    }
}

impl Default for BlockDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Global block device manager
static BLOCK_MANAGER: BlockDeviceManager = BlockDeviceManager::new();

/// Get the block device manager
pub fn block_manager() -> &'static BlockDeviceManager {
    &BLOCK_MANAGER
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_disk() {
        let disk = RamDisk::new(2048, 512);
        let info = disk.info();

        assert_eq!(info.total_blocks, 2048);
        assert_eq!(info.block_size, 512);
        assert!(!info.read_only);
    }

    #[test]
    fn test_ram_disk_sync_io() {
        let disk = RamDisk::new(16, 512);

        let data = [0x42u8; 1024];
        disk.write_blocks(3, 2, &data).unwrap();

        let back = disk.read_blocks(3, 2).unwrap();
        assert_eq!(back, data);
        assert_eq!(disk.read_blocks(2, 1).unwrap(), [0u8; 512]);
        assert_eq!(disk.read_count(), 2);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn test_ram_disk_bounds() {
        let disk = RamDisk::new(4, 512);
        assert_eq!(disk.read_blocks(4, 1), Err(BlockError::OutOfRange));
        assert_eq!(disk.read_blocks(3, 2), Err(BlockError::OutOfRange));
        assert_eq!(disk.read_blocks(u64::MAX, 1), Err(BlockError::OutOfRange));
        assert_eq!(
            disk.write_blocks(0, 1, &[0u8; 100]),
            Err(BlockError::InvalidBufferSize)
        );
    }

    #[test]
    fn test_read_only_disk() {
        let disk = RamDisk::new(4, 512).read_only();
        assert_eq!(disk.write_blocks(0, 1, &[0u8; 512]), Err(BlockError::ReadOnly));
    }

    #[test]
    fn test_manager_register_replace_unregister() {
        let manager = BlockDeviceManager::new();
        manager.register("hda", Arc::new(RamDisk::new(4, 512)));
        manager.register("hda", Arc::new(RamDisk::new(8, 512)));
        assert_eq!(manager.list(), ["hda"]);
        assert_eq!(manager.get("hda").unwrap().block_count(), 8);
        assert!(manager.unregister("hda").is_some());
        assert!(manager.get("hda").is_none());
    }
}
