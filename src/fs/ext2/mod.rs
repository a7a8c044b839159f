// ============================================================================
// src/fs/ext2/mod.rs - Ext2 Filesystem
// ============================================================================
//!
//! # Ext2ファイルシステム
//!
//! ブロックデバイス上のext2イメージを読み書きするバックエンド。
//!
//! ## 構成
//! - `ondisk`: オンディスク構造のコーデックとフォーマッタ
//! - `inode`: `Ext2Inode` (ブロックマップ / ファイルI/O / ディレクトリ操作)
//!
//! ## ロック順序
//! `dir_lock` → inodeキャッシュ → ブロックビュー → inode本体 → 割り当てメタデータ

pub mod inode;
pub mod ondisk;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::{Mutex, Once};

use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{
    DT_BLK, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_SOCK, DT_UNKNOWN, DirectoryEntryView,
    FileSystem, FileSystemBase, FileSystemHandle, Inode, InodeHandle,
};

pub use inode::Ext2Inode;
pub use ondisk::{FormatOptions, format};

use ondisk::{
    DiskIo, EXT2_FT_BLKDEV, EXT2_FT_CHRDEV, EXT2_FT_DIR, EXT2_FT_FIFO, EXT2_FT_REG_FILE,
    EXT2_FT_SOCK, EXT2_FT_SYMLINK, FEATURE_INCOMPAT_FILETYPE, GROUP_DESCRIPTOR_SIZE,
    GroupDescriptor, RAW_INODE_SIZE, ROOT_INODE, RawInode, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    Superblock,
};

/// マウント時に確定するレイアウト
#[derive(Debug, Clone, Copy)]
struct Geometry {
    block_size: u32,
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_count: u32,
    inodes_per_group: u32,
    inode_size: u32,
    first_inode: u32,
    group_count: u32,
    gdt_block: u32,
    dirent_file_type: bool,
}

impl Geometry {
    fn blocks_in_group(&self, group: u32) -> u32 {
        let start = group * self.blocks_per_group;
        (self.blocks_count - self.first_data_block - start).min(self.blocks_per_group)
    }
}

/// ビットマップ割り当てに伴って更新されるメタデータ
struct AllocationState {
    superblock: Superblock,
    groups: Vec<GroupDescriptor>,
}

struct DiskState {
    geometry: Geometry,
    meta: Mutex<AllocationState>,
}

/// `start` 以降で最初の空きビットを立てて返す
fn take_free_bit(bitmap: &mut [u8], limit: u32, start: u32) -> Option<u32> {
    let bit = (start..limit).find(|bit| bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0)?;
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    Some(bit)
}

/// ビットを落とす。既に0だったら false
fn clear_bit(bitmap: &mut [u8], bit: u32) -> bool {
    let mask = 1 << (bit % 8);
    let byte = &mut bitmap[(bit / 8) as usize];
    let was_set = *byte & mask != 0;
    *byte &= !mask;
    was_set
}

pub struct Ext2FS {
    base: FileSystemBase,
    self_ref: Weak<Ext2FS>,
    io: DiskIo,
    read_only: bool,
    root: Once<Arc<Ext2Inode>>,
    disk: Once<DiskState>,
    /// inode番号ごとに高々1つの `Ext2Inode`
    inodes: Mutex<HashMap<u32, Weak<Ext2Inode>>>,
    /// ディレクトリ構造の変更 (作成 / 削除 / 名前変更) を直列化する
    dir_lock: Mutex<()>,
}

impl Ext2FS {
    pub const CLASS_NAME: &'static str = "Ext2FS";

    /// デバイスが読み取り専用なら `read_only` に関わらず読み取り専用になる
    pub fn try_create(device: Arc<dyn BlockDevice>, read_only: bool) -> FsResult<FileSystemHandle> {
        let read_only = read_only || device.info().read_only;
        let fs = Arc::new_cyclic(|self_ref| Ext2FS {
            base: FileSystemBase::new(Self::CLASS_NAME),
            self_ref: self_ref.clone(),
            io: DiskIo::new(device),
            read_only,
            root: Once::new(),
            disk: Once::new(),
            inodes: Mutex::new(HashMap::new()),
            dir_lock: Mutex::new(()),
        });
        fs.base.begin_initialize();
        Ok(FileSystemHandle::Ext2(fs))
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.io.device()
    }

    /// 空きブロック数 (スーパーブロックの値)
    pub fn free_blocks_count(&self) -> FsResult<u32> {
        Ok(self.disk()?.meta.lock().superblock.free_blocks_count)
    }

    /// 空きinode数 (スーパーブロックの値)
    pub fn free_inodes_count(&self) -> FsResult<u32> {
        Ok(self.disk()?.meta.lock().superblock.free_inodes_count)
    }

    pub fn volume_name(&self) -> FsResult<String> {
        Ok(self.disk()?.meta.lock().superblock.volume_name.clone())
    }

    fn disk(&self) -> FsResult<&DiskState> {
        self.disk.get().ok_or(FsError::IoError)
    }

    fn geometry(&self) -> FsResult<Geometry> {
        Ok(self.disk()?.geometry)
    }

    pub(crate) fn block_size(&self) -> FsResult<usize> {
        Ok(self.geometry()?.block_size as usize)
    }

    /// 間接ブロック1つに入るポインタ数
    fn pointers_per_block(&self) -> FsResult<u64> {
        Ok(self.geometry()?.block_size as u64 / 4)
    }

    fn dirent_file_type(&self) -> bool {
        self.geometry().map(|g| g.dirent_file_type).unwrap_or(false)
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn check_block(&self, block: u32) -> FsResult<Geometry> {
        let geometry = self.geometry()?;
        if block == 0 || block >= geometry.blocks_count {
            log::warn!("ext2 {}: block {} out of range", self.fsid(), block);
            return Err(FsError::IoError);
        }
        Ok(geometry)
    }

    fn read_block(&self, block: u32) -> FsResult<Vec<u8>> {
        let geometry = self.check_block(block)?;
        let bs = geometry.block_size;
        self.io.read_at(block as u64 * bs as u64, bs as usize)
    }

    fn write_block(&self, block: u32, data: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        let geometry = self.check_block(block)?;
        if data.len() != geometry.block_size as usize {
            return Err(FsError::InvalidArgument);
        }
        self.io.write_at(block as u64 * geometry.block_size as u64, data)
    }

    fn zero_block(&self, block: u32) -> FsResult<()> {
        let mut zeroes = Vec::new();
        zeroes
            .try_reserve(self.block_size()?)
            .map_err(|_| FsError::OutOfMemory)?;
        zeroes.resize(self.block_size()?, 0);
        self.write_block(block, &zeroes)
    }

    // ========================================================================
    // Inode Table
    // ========================================================================

    fn inode_offset(&self, number: u32) -> FsResult<u64> {
        let disk = self.disk()?;
        let geometry = disk.geometry;
        if number == 0 || number > geometry.inodes_count {
            return Err(FsError::NoSuchEntity);
        }
        let group = ((number - 1) / geometry.inodes_per_group) as usize;
        let index = (number - 1) % geometry.inodes_per_group;
        let table = disk
            .meta
            .lock()
            .groups
            .get(group)
            .map(|gd| gd.inode_table)
            .ok_or(FsError::IoError)?;
        Ok(table as u64 * geometry.block_size as u64 + index as u64 * geometry.inode_size as u64)
    }

    fn read_raw_inode(&self, number: u32) -> FsResult<RawInode> {
        let offset = self.inode_offset(number)?;
        RawInode::decode(&self.io.read_at(offset, RAW_INODE_SIZE)?)
    }

    fn write_raw_inode(&self, number: u32, raw: &RawInode) -> FsResult<()> {
        self.check_writable()?;
        let offset = self.inode_offset(number)?;
        let mut slot = self.io.read_at(offset, RAW_INODE_SIZE)?;
        raw.encode_into(&mut slot)?;
        self.io.write_at(offset, &slot)
    }

    fn inode_in_use(&self, number: u32) -> FsResult<bool> {
        let disk = self.disk()?;
        let geometry = disk.geometry;
        if number == 0 || number > geometry.inodes_count {
            return Ok(false);
        }
        let group = ((number - 1) / geometry.inodes_per_group) as usize;
        let bit = (number - 1) % geometry.inodes_per_group;
        let bitmap_block = disk
            .meta
            .lock()
            .groups
            .get(group)
            .map(|gd| gd.inode_bitmap)
            .ok_or(FsError::IoError)?;
        let bitmap = self.read_block(bitmap_block)?;
        Ok(bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// キャッシュ済みの `Ext2Inode` を返す。なければディスクから読む
    fn load_inode(&self, number: u32) -> FsResult<Arc<Ext2Inode>> {
        let mut cache = self.inodes.lock();
        if let Some(inode) = cache.get(&number).and_then(Weak::upgrade) {
            return Ok(inode);
        }
        let raw = self.read_raw_inode(number)?;
        let id = InodeIdentifier::new(self.fsid(), number as u64);
        let inode = Arc::new(Ext2Inode::new(self.self_ref.clone(), id, number, raw));
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;
        cache.insert(number, Arc::downgrade(&inode));
        Ok(inode)
    }

    fn forget_inode(&self, number: u32) {
        self.inodes.lock().remove(&number);
    }

    // ========================================================================
    // Bitmap Allocation
    // ========================================================================

    /// 記述子とスーパーブロックを書き戻す
    fn persist(&self, meta: &AllocationState, group: usize) -> FsResult<()> {
        let geometry = self.geometry()?;
        let offset = geometry.gdt_block as u64 * geometry.block_size as u64
            + (group * GROUP_DESCRIPTOR_SIZE) as u64;
        let mut descriptor = self.io.read_at(offset, GROUP_DESCRIPTOR_SIZE)?;
        meta.groups[group].encode_into(&mut descriptor, 0)?;
        self.io.write_at(offset, &descriptor)?;

        let mut superblock = self.io.read_at(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        meta.superblock.encode_into(&mut superblock)?;
        self.io.write_at(SUPERBLOCK_OFFSET, &superblock)
    }

    /// 空きブロックを1つ確保する (内容は未初期化)
    fn allocate_block(&self) -> FsResult<u32> {
        self.check_writable()?;
        let disk = self.disk()?;
        let geometry = disk.geometry;
        let mut meta = disk.meta.lock();
        for group in 0..geometry.group_count as usize {
            let descriptor = meta.groups[group];
            if descriptor.free_blocks_count == 0 {
                continue;
            }
            let mut bitmap = self.read_block(descriptor.block_bitmap)?;
            let limit = geometry.blocks_in_group(group as u32);
            let Some(bit) = take_free_bit(&mut bitmap, limit, 0) else {
                log::warn!("ext2 {}: group {} free count disagrees with bitmap", self.fsid(), group);
                continue;
            };
            self.write_block(descriptor.block_bitmap, &bitmap)?;
            meta.groups[group].free_blocks_count -= 1;
            meta.superblock.free_blocks_count = meta.superblock.free_blocks_count.saturating_sub(1);
            self.persist(&meta, group)?;

            let block = geometry.first_data_block + group as u32 * geometry.blocks_per_group + bit;
            #[cfg(feature = "verbose_logging")]
            log::trace!("ext2 {}: allocated block {}", self.fsid(), block);
            return Ok(block);
        }
        Err(FsError::NoSpace)
    }

    fn free_block(&self, block: u32) -> FsResult<()> {
        self.check_writable()?;
        let geometry = self.check_block(block)?;
        if block < geometry.first_data_block {
            return Err(FsError::IoError);
        }
        let group = ((block - geometry.first_data_block) / geometry.blocks_per_group) as usize;
        let bit = (block - geometry.first_data_block) % geometry.blocks_per_group;
        let disk = self.disk()?;
        let mut meta = disk.meta.lock();
        let bitmap_block = meta.groups[group].block_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        if !clear_bit(&mut bitmap, bit) {
            log::warn!("ext2 {}: block {} freed twice", self.fsid(), block);
            return Ok(());
        }
        self.write_block(bitmap_block, &bitmap)?;
        meta.groups[group].free_blocks_count += 1;
        meta.superblock.free_blocks_count += 1;
        self.persist(&meta, group)
    }

    fn allocate_inode(&self, directory: bool) -> FsResult<u32> {
        self.check_writable()?;
        let disk = self.disk()?;
        let geometry = disk.geometry;
        let mut meta = disk.meta.lock();
        for group in 0..geometry.group_count as usize {
            let descriptor = meta.groups[group];
            if descriptor.free_inodes_count == 0 {
                continue;
            }
            let mut bitmap = self.read_block(descriptor.inode_bitmap)?;
            // 予約inodeは割り当てない
            let start = if group == 0 { geometry.first_inode - 1 } else { 0 };
            let Some(bit) = take_free_bit(&mut bitmap, geometry.inodes_per_group, start) else {
                continue;
            };
            self.write_block(descriptor.inode_bitmap, &bitmap)?;
            meta.groups[group].free_inodes_count -= 1;
            if directory {
                meta.groups[group].used_dirs_count += 1;
            }
            meta.superblock.free_inodes_count = meta.superblock.free_inodes_count.saturating_sub(1);
            self.persist(&meta, group)?;

            let number = group as u32 * geometry.inodes_per_group + bit + 1;
            log::debug!("ext2 {}: allocated inode {}", self.fsid(), number);
            return Ok(number);
        }
        Err(FsError::NoSpace)
    }

    fn free_inode(&self, number: u32, directory: bool) -> FsResult<()> {
        self.check_writable()?;
        let disk = self.disk()?;
        let geometry = disk.geometry;
        if number == 0 || number > geometry.inodes_count {
            return Err(FsError::NoSuchEntity);
        }
        let group = ((number - 1) / geometry.inodes_per_group) as usize;
        let bit = (number - 1) % geometry.inodes_per_group;
        let mut meta = disk.meta.lock();
        let bitmap_block = meta.groups[group].inode_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        if !clear_bit(&mut bitmap, bit) {
            log::warn!("ext2 {}: inode {} freed twice", self.fsid(), number);
            return Ok(());
        }
        self.write_block(bitmap_block, &bitmap)?;
        meta.groups[group].free_inodes_count += 1;
        if directory {
            meta.groups[group].used_dirs_count = meta.groups[group].used_dirs_count.saturating_sub(1);
        }
        meta.superblock.free_inodes_count += 1;
        self.persist(&meta, group)?;
        log::debug!("ext2 {}: freed inode {}", self.fsid(), number);
        Ok(())
    }

    // ========================================================================
    // Rename Helpers
    // ========================================================================

    /// このインスタンスのディレクトリinodeを取り出す
    fn own_directory(&self, handle: &InodeHandle) -> FsResult<Arc<Ext2Inode>> {
        let inode = handle
            .as_any()
            .downcast_ref::<Ext2Inode>()
            .ok_or(FsError::CrossDevice)?;
        if inode.identifier().fsid() != self.fsid() {
            return Err(FsError::CrossDevice);
        }
        let inode = self.load_inode(inode.number())?;
        if !inode.is_directory() {
            return Err(FsError::NotDirectory);
        }
        Ok(inode)
    }

    /// `directory` が `ancestor` 自身またはその子孫か
    fn is_within(&self, directory: &Arc<Ext2Inode>, ancestor: u32) -> FsResult<bool> {
        let geometry = self.geometry()?;
        let mut current = directory.number();
        for _ in 0..geometry.inodes_count {
            if current == ancestor {
                return Ok(true);
            }
            if current == ROOT_INODE {
                return Ok(false);
            }
            let parent = self
                .load_inode(current)?
                .find_entry("..")?
                .map(|entry| entry.inode)
                .ok_or(FsError::IoError)?;
            if parent == current {
                return Ok(false);
            }
            current = parent;
        }
        log::warn!("ext2 {}: directory parent chain does not terminate", self.fsid());
        Err(FsError::IoError)
    }
}

impl FileSystem for Ext2FS {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base(&self) -> &FileSystemBase {
        &self.base
    }

    fn initialize(&self) -> FsResult<()> {
        self.base.assert_initializing();

        let superblock = Superblock::decode(&self.io.read_at(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?)
            .inspect_err(|_| log::error!("ext2 {}: no ext2 superblock", self.fsid()))?;
        let unsupported = superblock.feature_incompat & !FEATURE_INCOMPAT_FILETYPE;
        if unsupported != 0 {
            log::error!("ext2 {}: unsupported incompatible features {:#x}", self.fsid(), unsupported);
            return Err(FsError::NotSupported);
        }

        let block_size = superblock.block_size();
        let fs_bytes = superblock.blocks_count as u64 * block_size as u64;
        if superblock.blocks_count <= superblock.first_data_block || fs_bytes > self.io.byte_len() {
            log::error!(
                "ext2 {}: filesystem of {} bytes does not fit the device ({} bytes)",
                self.fsid(),
                fs_bytes,
                self.io.byte_len()
            );
            return Err(FsError::InvalidArgument);
        }

        let geometry = Geometry {
            block_size,
            blocks_count: superblock.blocks_count,
            first_data_block: superblock.first_data_block,
            blocks_per_group: superblock.blocks_per_group,
            inodes_count: superblock.inodes_count,
            inodes_per_group: superblock.inodes_per_group,
            inode_size: superblock.inode_size(),
            first_inode: superblock.first_inode(),
            group_count: superblock.group_count(),
            gdt_block: superblock.first_data_block + 1,
            dirent_file_type: superblock.feature_incompat & FEATURE_INCOMPAT_FILETYPE != 0,
        };
        if geometry.inodes_count as u64 > geometry.inodes_per_group as u64 * geometry.group_count as u64 {
            return Err(FsError::InvalidArgument);
        }

        let table = self.io.read_at(
            geometry.gdt_block as u64 * block_size as u64,
            geometry.group_count as usize * GROUP_DESCRIPTOR_SIZE,
        )?;
        let groups = (0..geometry.group_count as usize)
            .map(|group| GroupDescriptor::decode(&table, group * GROUP_DESCRIPTOR_SIZE))
            .collect::<FsResult<Vec<_>>>()?;

        log::info!(
            "ext2 {}: {} blocks of {} bytes, {} inodes, {} groups{}",
            self.fsid(),
            geometry.blocks_count,
            block_size,
            geometry.inodes_count,
            geometry.group_count,
            if self.read_only { " (read-only)" } else { "" }
        );

        self.disk.call_once(|| DiskState {
            geometry,
            meta: Mutex::new(AllocationState { superblock, groups }),
        });

        let root = self.load_inode(ROOT_INODE)?;
        if !root.is_directory() {
            log::error!("ext2 {}: root inode is not a directory", self.fsid());
            return Err(FsError::InvalidArgument);
        }
        self.root.call_once(|| root);
        self.base.finish_initialize();
        Ok(())
    }

    fn root_inode(&self) -> InodeHandle {
        self.root
            .get()
            .cloned()
            .expect("ext2: root inode requested before initialize")
    }

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        self.base.check_identifier(id)?;
        let geometry = self.geometry()?;
        let number = u32::try_from(id.index()).map_err(|_| FsError::NoSuchEntity)?;
        if number > geometry.inodes_count {
            return Err(FsError::NoSuchEntity);
        }
        if number == ROOT_INODE {
            return Ok(self.root_inode());
        }
        if !self.inode_in_use(number)? {
            return Err(FsError::NoSuchEntity);
        }
        Ok(self.load_inode(number)?)
    }

    /// 新しい名前を追加してから古い名前を消す
    ///
    /// 移動先に非ディレクトリがあれば置き換える。ディレクトリなら `IsDirectory`。
    fn rename(
        &self,
        old_parent: &InodeHandle,
        old_name: &str,
        new_parent: &InodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        self.check_writable()?;
        let old_dir = self.own_directory(old_parent)?;
        let new_dir = self.own_directory(new_parent)?;
        if matches!(old_name, "." | "..") {
            return Err(FsError::InvalidArgument);
        }
        inode::validate_name(new_name)?;

        let _guard = self.dir_lock.lock();
        let entry = old_dir.find_entry(old_name)?.ok_or(FsError::NoSuchEntity)?;
        if old_dir.number() == new_dir.number() && old_name == new_name {
            return Ok(());
        }
        let moving = self.load_inode(entry.inode)?;
        let moving_is_dir = moving.is_directory();
        if moving_is_dir && self.is_within(&new_dir, moving.number())? {
            return Err(FsError::InvalidArgument);
        }

        if let Some(target) = new_dir.find_entry(new_name)? {
            if target.inode == entry.inode {
                return old_dir.remove_entry(old_name).map(|_| ());
            }
            let replaced = self.load_inode(target.inode)?;
            if replaced.is_directory() {
                return Err(FsError::IsDirectory);
            }
            if moving_is_dir {
                return Err(FsError::NotDirectory);
            }
            new_dir.remove_entry(new_name)?;
            replaced.drop_link()?;
        }

        new_dir.add_entry(new_name, entry.inode, entry.file_type)?;
        old_dir.remove_entry(old_name)?;

        if moving_is_dir && old_dir.number() != new_dir.number() {
            moving.set_parent(new_dir.number())?;
            old_dir.adjust_links(-1)?;
            new_dir.adjust_links(1)?;
        }
        moving.touch_ctime()?;
        log::debug!(
            "ext2 {}: renamed {}/{} -> {}/{}",
            self.fsid(),
            old_dir.number(),
            old_name,
            new_dir.number(),
            new_name
        );
        Ok(())
    }

    fn internal_file_type_to_directory_entry_type(&self, entry: &DirectoryEntryView) -> u8 {
        match entry.file_type {
            EXT2_FT_REG_FILE => DT_REG,
            EXT2_FT_DIR => DT_DIR,
            EXT2_FT_CHRDEV => DT_CHR,
            EXT2_FT_BLKDEV => DT_BLK,
            EXT2_FT_FIFO => DT_FIFO,
            EXT2_FT_SOCK => DT_SOCK,
            EXT2_FT_SYMLINK => DT_LNK,
            _ => DT_UNKNOWN,
        }
    }

    fn prepare_to_unmount(&self) -> FsResult<()> {
        self.base.begin_unmount()?;
        self.inodes.lock().clear();
        if !self.read_only {
            self.io.device().flush()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block::RamDisk;
    use crate::fs::vfs::{FileMode, FileSystemState, Inode, directory_entries};

    fn formatted_disk() -> Arc<dyn BlockDevice> {
        let device: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(2048, 512));
        format(&device, &FormatOptions::default()).unwrap();
        device
    }

    fn mounted(device: Arc<dyn BlockDevice>) -> Arc<Ext2FS> {
        let handle = Ext2FS::try_create(device, false).unwrap();
        handle.initialize().unwrap();
        match handle {
            FileSystemHandle::Ext2(fs) => fs,
            other => panic!("unexpected handle {:?}", other),
        }
    }

    fn root(fs: &Arc<Ext2FS>) -> Arc<Ext2Inode> {
        fs.load_inode(ROOT_INODE).unwrap()
    }

    #[test]
    fn test_mount_formatted_image() {
        let fs = mounted(formatted_disk());
        assert_eq!(fs.state(), FileSystemState::Ready);
        let root = fs.root_inode();
        assert_eq!(root.identifier(), InodeIdentifier::new(fs.fsid(), 2));
        let attr = root.metadata().unwrap();
        assert!(attr.mode.is_dir());
        assert_eq!(attr.nlink, 2);
        let names: Vec<_> = directory_entries(root.as_ref())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", ".."]);
    }

    #[test]
    fn test_initialize_rejects_blank_device() {
        let device: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(64, 512));
        let handle = Ext2FS::try_create(device, false).unwrap();
        assert_eq!(handle.initialize(), Err(FsError::InvalidArgument));
    }

    #[test]
    fn test_get_inode_rules() {
        let fs = mounted(formatted_disk());
        let fsid = fs.fsid();
        assert_eq!(
            fs.get_inode(InodeIdentifier::new(fsid, 0)).err(),
            Some(FsError::NoSuchEntity)
        );
        assert_eq!(
            fs.get_inode(InodeIdentifier::new(fsid, 129)).err(),
            Some(FsError::NoSuchEntity)
        );
        // 割り当てられていないinode
        assert_eq!(
            fs.get_inode(InodeIdentifier::new(fsid, 20)).err(),
            Some(FsError::NoSuchEntity)
        );
        assert_eq!(
            fs.get_inode(InodeIdentifier::new(fsid + 1000, 2)).err(),
            Some(FsError::NoSuchEntity)
        );

        let child = root(&fs)
            .create_child("file", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        let found = fs.get_inode(child.identifier()).unwrap();
        assert_eq!(found.identifier(), child.identifier());
    }

    #[test]
    fn test_allocation_updates_counters() {
        let fs = mounted(formatted_disk());
        let blocks = fs.free_blocks_count().unwrap();
        let inodes = fs.free_inodes_count().unwrap();

        let file = root(&fs)
            .create_child("data", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        file.write_bytes(0, &[7u8; 3000]).unwrap();
        assert_eq!(fs.free_inodes_count().unwrap(), inodes - 1);
        assert_eq!(fs.free_blocks_count().unwrap(), blocks - 3);

        assert!(file.free_block_at(1).unwrap());
        assert_eq!(fs.free_blocks_count().unwrap(), blocks - 2);
        assert!(!file.free_block_at(1).unwrap());
    }

    #[test]
    fn test_counters_survive_remount() {
        let device = formatted_disk();
        let fs = mounted(device.clone());
        let file = root(&fs)
            .create_child("persist", FileMode::S_IFREG | 0o600, 5, 6)
            .unwrap();
        file.write_bytes(0, b"still here").unwrap();
        let free = fs.free_blocks_count().unwrap();
        fs.prepare_to_unmount().unwrap();
        drop(file);
        drop(fs);

        let fs = mounted(device);
        assert_eq!(fs.free_blocks_count().unwrap(), free);
        let file = fs.root_inode().lookup("persist").unwrap();
        let mut buf = [0u8; 32];
        let n = file.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");
        let attr = file.metadata().unwrap();
        assert_eq!((attr.uid, attr.gid), (5, 6));
    }

    #[test]
    fn test_out_of_space() {
        let fs = mounted(formatted_disk());
        let file = root(&fs)
            .create_child("big", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        let chunk = [0xAAu8; 1024];
        let mut result = Ok(0);
        for block in 0..2048u64 {
            result = file.write_bytes(block * 1024, &chunk);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FsError::NoSpace));
        assert_eq!(fs.free_blocks_count().unwrap(), 0);
    }

    #[test]
    fn test_read_only_device() {
        let device = formatted_disk();
        let image = RamDisk::from_image(device.read_blocks(0, 2048).unwrap(), 512).read_only();
        let handle = Ext2FS::try_create(Arc::new(image), false).unwrap();
        handle.initialize().unwrap();
        assert!(handle.is_read_only());
        let root = handle.root_inode();
        let ext2_root = root.as_any().downcast_ref::<Ext2Inode>().unwrap();
        assert_eq!(
            ext2_root
                .create_child("x", FileMode::S_IFREG | 0o644, 0, 0)
                .err(),
            Some(FsError::ReadOnly)
        );
    }

    #[test]
    fn test_rename_within_and_across_directories() {
        let fs = mounted(formatted_disk());
        let root = root(&fs);
        let file = root
            .create_child("a", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        file.write_bytes(0, b"payload").unwrap();
        let dir = root
            .create_child("dir", FileMode::S_IFDIR | 0o755, 0, 0)
            .unwrap();
        assert_eq!(root.metadata().unwrap().nlink, 3);

        let root_handle: InodeHandle = root.clone();
        let dir_handle: InodeHandle = dir.clone();
        fs.rename(&root_handle, "a", &root_handle, "b").unwrap();
        assert_eq!(root.lookup("a").err(), Some(FsError::NoSuchEntity));
        fs.rename(&root_handle, "b", &dir_handle, "c").unwrap();
        let moved = dir.lookup("c").unwrap();
        assert_eq!(moved.identifier(), file.identifier());

        // ディレクトリの移動は ".." とリンク数を直す
        let sub = root
            .create_child("sub", FileMode::S_IFDIR | 0o755, 0, 0)
            .unwrap();
        fs.rename(&root_handle, "sub", &dir_handle, "sub").unwrap();
        assert_eq!(sub.lookup("..").unwrap().identifier(), dir.identifier());
        assert_eq!(dir.metadata().unwrap().nlink, 3);
        assert_eq!(root.metadata().unwrap().nlink, 3);

        // 自分の子孫へは移動できない
        assert_eq!(
            fs.rename(&root_handle, "dir", &(sub.clone() as InodeHandle), "loop"),
            Err(FsError::InvalidArgument)
        );
    }

    #[test]
    fn test_rename_replaces_files_but_not_directories() {
        let fs = mounted(formatted_disk());
        let root = root(&fs);
        let inodes = fs.free_inodes_count().unwrap();
        root.create_child("x", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap()
            .write_bytes(0, b"x")
            .unwrap();
        let y = root
            .create_child("y", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        y.write_bytes(0, b"y").unwrap();
        drop(y);
        root.create_child("d", FileMode::S_IFDIR | 0o755, 0, 0)
            .unwrap();

        let handle: InodeHandle = root.clone();
        assert_eq!(fs.rename(&handle, "x", &handle, "d"), Err(FsError::IsDirectory));
        fs.rename(&handle, "x", &handle, "y").unwrap();
        let mut buf = [0u8; 4];
        let n = root.lookup("y").unwrap().read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"x");
        // 置き換えられた y は解放される
        assert_eq!(fs.free_inodes_count().unwrap(), inodes - 2);
        assert_eq!(fs.rename(&handle, "missing", &handle, "z"), Err(FsError::NoSuchEntity));
    }

    #[test]
    fn test_rename_rejects_foreign_inodes() {
        let fs = mounted(formatted_disk());
        let other = mounted(formatted_disk());
        let ours: InodeHandle = root(&fs);
        let theirs: InodeHandle = root(&other);
        assert_eq!(fs.rename(&ours, "a", &theirs, "b"), Err(FsError::CrossDevice));
    }

    #[test]
    fn test_directory_entry_type_mapping() {
        let fs = mounted(formatted_disk());
        let id = InodeIdentifier::new(fs.fsid(), 2);
        let map = |t| fs.internal_file_type_to_directory_entry_type(&DirectoryEntryView::new("n", id, t));
        assert_eq!(map(EXT2_FT_REG_FILE), DT_REG);
        assert_eq!(map(EXT2_FT_DIR), DT_DIR);
        assert_eq!(map(EXT2_FT_CHRDEV), DT_CHR);
        assert_eq!(map(EXT2_FT_BLKDEV), DT_BLK);
        assert_eq!(map(EXT2_FT_FIFO), DT_FIFO);
        assert_eq!(map(EXT2_FT_SOCK), DT_SOCK);
        assert_eq!(map(EXT2_FT_SYMLINK), DT_LNK);
        assert_eq!(map(42), DT_UNKNOWN);
    }

    #[test]
    fn test_unmount_twice_is_busy() {
        let fs = mounted(formatted_disk());
        fs.prepare_to_unmount().unwrap();
        assert_eq!(fs.prepare_to_unmount(), Err(FsError::Busy));
    }
}
