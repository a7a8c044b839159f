// ============================================================================
// src/fs/devloop.rs - Loop Device Filesystem
// ============================================================================
//!
//! # devloop
//!
//! ループデバイスを `/dev/loop/<n>` として見せる合成ファイルシステム。
//! ループデバイスは別のブロックデバイス (イメージファイル等) へ転送するだけの
//! ブロックデバイスで、接続時に `loop<n>` としてブロックマネージャにも登録される。
//!
//! - inode 1: ルートディレクトリ
//! - inode n (n >= 2): ループ番号 `n - 2` のブロックデバイス (major 20)

use alloc::format;
use alloc::string::ToString;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::error::{FsError, FsResult};
use crate::fs::block::{BlockDevice, BlockDeviceInfo, BlockResult, block_manager};
use crate::fs::config::{LOOP_DEVICE_MAJOR, SYNTHETIC_ROOT_INDEX};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{
    DeviceNumber, DirectoryEntryView, FileAttr, FileMode, FileSystem, FileSystemBase,
    FileSystemHandle, Inode, InodeHandle, synthetic_backing_index, synthetic_inode_index,
};
use crate::sync::IterationDecision;
use crate::time::{self, TimeSpec};

const ROOT_MODE: u16 = FileMode::S_IFDIR | 0o555;
const LOOP_MODE: u16 = FileMode::S_IFBLK | 0o660;

// ============================================================================
// Loop Device
// ============================================================================

/// バッキングデバイスへ転送するループデバイス
pub struct LoopDevice {
    index: u32,
    backing: Arc<dyn BlockDevice>,
    created: TimeSpec,
}

impl LoopDevice {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> alloc::string::String {
        format!("loop{}", self.index)
    }

    pub fn backing(&self) -> &Arc<dyn BlockDevice> {
        &self.backing
    }
}

impl BlockDevice for LoopDevice {
    fn info(&self) -> BlockDeviceInfo {
        let backing = self.backing.info();
        BlockDeviceInfo {
            name: self.name(),
            ..backing
        }
    }

    fn read_blocks(&self, index: u64, count: usize) -> BlockResult<Vec<u8>> {
        self.backing.read_blocks(index, count)
    }

    fn write_blocks(&self, index: u64, count: usize, data: &[u8]) -> BlockResult<()> {
        self.backing.write_blocks(index, count, data)
    }

    fn flush(&self) -> BlockResult<()> {
        self.backing.flush()
    }
}

/// 接続中のループデバイス
pub struct LoopRegistry {
    devices: Mutex<HashMap<u32, Arc<LoopDevice>>>,
}

impl LoopRegistry {
    fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// 空いている最小の番号で接続し、ブロックマネージャへ登録する
    pub fn attach(&self, backing: Arc<dyn BlockDevice>) -> Arc<LoopDevice> {
        let device = {
            let mut devices = self.devices.lock();
            let index = (0..).find(|i| !devices.contains_key(i)).unwrap_or(0);
            let device = Arc::new(LoopDevice {
                index,
                backing,
                created: time::now(),
            });
            devices.insert(index, device.clone());
            device
        };
        block_manager().register(&device.name(), device.clone());
        log::info!("devloop: attached {}", device.name());
        device
    }

    pub fn detach(&self, index: u32) -> Option<Arc<LoopDevice>> {
        let device = self.devices.lock().remove(&index)?;
        block_manager().unregister(&device.name());
        log::info!("devloop: detached {}", device.name());
        Some(device)
    }

    pub fn get(&self, index: u32) -> Option<Arc<LoopDevice>> {
        self.devices.lock().get(&index).cloned()
    }

    /// 番号順のスナップショット
    pub fn list(&self) -> Vec<Arc<LoopDevice>> {
        let mut list: Vec<_> = self.devices.lock().values().cloned().collect();
        list.sort_by_key(|device| device.index);
        list
    }
}

lazy_static! {
    static ref LOOP_REGISTRY: LoopRegistry = LoopRegistry::new();
}

pub fn loop_registry() -> &'static LoopRegistry {
    &LOOP_REGISTRY
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct DevLoopFS {
    base: FileSystemBase,
    self_ref: Weak<DevLoopFS>,
    root: Once<Arc<DevLoopInode>>,
}

impl DevLoopFS {
    pub const CLASS_NAME: &'static str = "DevLoopFS";

    pub fn try_create() -> FsResult<FileSystemHandle> {
        let fs = Arc::new_cyclic(|self_ref| DevLoopFS {
            base: FileSystemBase::new(Self::CLASS_NAME),
            self_ref: self_ref.clone(),
            root: Once::new(),
        });
        fs.base.begin_initialize();
        Ok(FileSystemHandle::DevLoop(fs))
    }

    fn loop_inode(&self, device: &LoopDevice) -> Arc<DevLoopInode> {
        let id = InodeIdentifier::new(self.fsid(), synthetic_inode_index(device.index as u64));
        let mut metadata = FileAttr::new(id, FileMode(LOOP_MODE));
        metadata.size = device.block_count() * device.block_size() as u64;
        metadata.block_size = device.block_size() as u32;
        metadata.atime = device.created;
        metadata.mtime = device.created;
        metadata.ctime = device.created;
        metadata.device = Some(DeviceNumber::new(LOOP_DEVICE_MAJOR, device.index));
        Arc::new(DevLoopInode {
            fs: self.self_ref.clone(),
            metadata,
        })
    }
}

impl FileSystem for DevLoopFS {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base(&self) -> &FileSystemBase {
        &self.base
    }

    fn initialize(&self) -> FsResult<()> {
        self.base.assert_initializing();
        let now = time::now();
        let id = InodeIdentifier::new(self.fsid(), SYNTHETIC_ROOT_INDEX);
        let mut metadata = FileAttr::new(id, FileMode(ROOT_MODE));
        metadata.nlink = 2;
        metadata.atime = now;
        metadata.mtime = now;
        metadata.ctime = now;
        self.root.call_once(|| {
            Arc::new(DevLoopInode {
                fs: self.self_ref.clone(),
                metadata,
            })
        });
        self.base.finish_initialize();
        Ok(())
    }

    fn root_inode(&self) -> InodeHandle {
        self.root
            .get()
            .cloned()
            .expect("devloop: root inode requested before initialize")
    }

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        self.base.check_identifier(id)?;
        if id.index() == SYNTHETIC_ROOT_INDEX {
            return Ok(self.root_inode());
        }
        let loop_index =
            u32::try_from(synthetic_backing_index(id.index())).map_err(|_| FsError::NoSuchEntity)?;
        let device = loop_registry().get(loop_index).ok_or(FsError::NoSuchEntity)?;
        Ok(self.loop_inode(&device))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Inode
// ============================================================================

pub struct DevLoopInode {
    fs: Weak<DevLoopFS>,
    metadata: FileAttr,
}

impl DevLoopInode {
    fn is_root(&self) -> bool {
        self.metadata.inode.index() == SYNTHETIC_ROOT_INDEX
    }
}

impl Inode for DevLoopInode {
    fn identifier(&self) -> InodeIdentifier {
        self.metadata.inode
    }

    fn metadata(&self) -> FsResult<FileAttr> {
        Ok(self.metadata.clone())
    }

    fn lookup(&self, name: &str) -> FsResult<InodeHandle> {
        if !self.is_root() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.fs.upgrade().ok_or(FsError::NoSuchEntity)?;
        if name == "." || name == ".." {
            return Ok(fs.root_inode());
        }
        let index: u32 = name.parse().map_err(|_| FsError::NoSuchEntity)?;
        if index.to_string() != name {
            return Err(FsError::NoSuchEntity);
        }
        let device = loop_registry().get(index).ok_or(FsError::NoSuchEntity)?;
        Ok(fs.loop_inode(&device))
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        if !self.is_root() {
            return Err(FsError::NotDirectory);
        }
        let root_id = self.identifier();
        let dir_type = (ROOT_MODE >> 12) as u8;
        for name in [".", ".."] {
            if callback(&DirectoryEntryView::new(name, root_id, dir_type)) == IterationDecision::Break {
                return Ok(());
            }
        }
        for device in loop_registry().list() {
            let entry = DirectoryEntryView::new(
                device.index.to_string(),
                InodeIdentifier::new(root_id.fsid(), synthetic_inode_index(device.index as u64)),
                (LOOP_MODE >> 12) as u8,
            );
            if callback(&entry) == IterationDecision::Break {
                break;
            }
        }
        Ok(())
    }

    fn read_bytes(&self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        if self.is_root() {
            return Err(FsError::IsDirectory);
        }
        // ブロックデバイスとしての読み書きはブロック層を経由する
        Err(FsError::NotSupported)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block::RamDisk;
    use crate::fs::vfs::{DT_BLK, directory_entries};

    fn ready() -> FileSystemHandle {
        let fs = DevLoopFS::try_create().unwrap();
        fs.initialize().unwrap();
        fs
    }

    #[test]
    fn test_loop_device_forwards_io() {
        let disk = Arc::new(RamDisk::new(8, 512));
        let device = loop_registry().attach(disk.clone());
        device.write_blocks(2, 1, &[0x5A; 512]).unwrap();
        assert_eq!(disk.read_blocks(2, 1).unwrap(), [0x5A; 512]);
        assert_eq!(device.info().name, device.name());
        assert!(block_manager().get(&device.name()).is_some());
        loop_registry().detach(device.index());
        assert!(block_manager().get(&device.name()).is_none());
    }

    #[test]
    fn test_loop_inode_mapping() {
        let fs = ready();
        let device = loop_registry().attach(Arc::new(RamDisk::new(16, 512)));
        let inode = fs
            .get_inode(InodeIdentifier::new(fs.fsid(), device.index() as u64 + 2))
            .unwrap();
        let meta = inode.metadata().unwrap();
        assert_eq!(meta.device, Some(DeviceNumber::new(20, device.index())));
        assert_eq!(meta.mode, FileMode(0o060660));
        assert_eq!(meta.size, 16 * 512);

        let entries = directory_entries(fs.root_inode().as_ref()).unwrap();
        let name = device.index().to_string();
        let entry = entries.iter().find(|e| e.name == name).unwrap();
        assert_eq!(fs.internal_file_type_to_directory_entry_type(entry), DT_BLK);

        loop_registry().detach(device.index());
        assert_eq!(
            fs.get_inode(InodeIdentifier::new(fs.fsid(), device.index() as u64 + 2)).err(),
            Some(FsError::NoSuchEntity)
        );
    }

    #[test]
    fn test_root_and_rename() {
        let fs = ready();
        let root = fs.get_inode(InodeIdentifier::new(fs.fsid(), 1)).unwrap();
        assert!(root.metadata().unwrap().mode.is_dir());
        assert_eq!(fs.rename(&root, "0", &root, "1"), Err(FsError::ReadOnly));
        assert_eq!(root.lookup("loop0").err(), Some(FsError::NoSuchEntity));
    }
}
