// ============================================================================
// src/fs/ext2/inode.rs - Ext2 Inode
// ============================================================================
//!
//! ext2のinode: ブロックマップ、ファイルI/O、ディレクトリ操作
//!
//! 論理→物理ブロックの解決はすべて `BlockView` を経由する。
//! `Ext2Inode` 自身が `BlockListProvider` として直接/間接ブロックを辿る。

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;
use hashbrown::HashMap;
use spin::Mutex;

use super::Ext2FS;
use super::ondisk::{
    DIRECT_BLOCKS, DOUBLE_INDIRECT_BLOCK, DirEntry, INDIRECT_BLOCK, MAX_NAME_LEN, RawInode,
    TRIPLE_INDIRECT_BLOCK, file_type_from_mode, parse_dir_block,
};
use crate::error::{FsError, FsResult};
use crate::fs::block_view::{BlockListProvider, BlockView};
use crate::fs::bytes::{read_le_u32, write_le_u32};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{
    DirectoryEntryView, FileAttr, FileMode, FileSystem, FileType, Inode, InodeHandle,
};
use crate::sync::IterationDecision;
use crate::time::{self, TimeSpec};

/// fast symlink はリンク先を `block` 配列に直接持つ
const FAST_SYMLINK_MAX: usize = 60;

/// ディレクトリエントリ名の検証
pub(super) fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

fn physical_block(physical: u64) -> FsResult<u32> {
    u32::try_from(physical).map_err(|_| FsError::IoError)
}

/// 論理ブロックに至る経路
///
/// `slot` は `RawInode::block` の添字、`indices[..depth]` は各段の間接ブロック内の添字。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockPath {
    slot: usize,
    indices: [usize; 3],
    depth: usize,
}

impl BlockPath {
    fn resolve(logical: u64, per_block: u64) -> FsResult<Self> {
        let direct = DIRECT_BLOCKS as u64;
        if logical < direct {
            return Ok(Self {
                slot: logical as usize,
                indices: [0; 3],
                depth: 0,
            });
        }
        let mut rest = logical - direct;
        if rest < per_block {
            return Ok(Self {
                slot: INDIRECT_BLOCK,
                indices: [rest as usize, 0, 0],
                depth: 1,
            });
        }
        rest -= per_block;
        let double = per_block * per_block;
        if rest < double {
            return Ok(Self {
                slot: DOUBLE_INDIRECT_BLOCK,
                indices: [(rest / per_block) as usize, (rest % per_block) as usize, 0],
                depth: 2,
            });
        }
        rest -= double;
        if rest < double * per_block {
            return Ok(Self {
                slot: TRIPLE_INDIRECT_BLOCK,
                indices: [
                    (rest / double) as usize,
                    ((rest / per_block) % per_block) as usize,
                    (rest % per_block) as usize,
                ],
                depth: 3,
            });
        }
        Err(FsError::OutOfRange)
    }
}

/// ブロックポインタの格納場所
enum PointerSlot {
    /// inode内の直接ポインタ
    Inode(usize),
    /// 間接ブロック内のポインタ
    Table { block: u32, index: usize },
}

pub struct Ext2Inode {
    fs: Weak<Ext2FS>,
    id: InodeIdentifier,
    number: u32,
    raw: Mutex<RawInode>,
    block_view: BlockView,
}

impl Ext2Inode {
    pub(super) fn new(fs: Weak<Ext2FS>, id: InodeIdentifier, number: u32, raw: RawInode) -> Self {
        Self {
            fs,
            id,
            number,
            raw: Mutex::new(raw),
            block_view: BlockView::new(),
        }
    }

    fn fs(&self) -> FsResult<Arc<Ext2FS>> {
        self.fs.upgrade().ok_or(FsError::NoSuchEntity)
    }

    /// ディスク上のinode番号
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_directory(&self) -> bool {
        self.raw.lock().is_directory()
    }

    pub fn block_view(&self) -> &BlockView {
        &self.block_view
    }

    fn sectors_per_block(fs: &Ext2FS) -> FsResult<u32> {
        Ok(fs.block_size()? as u32 / 512)
    }

    fn store(&self, fs: &Ext2FS, raw: &RawInode) -> FsResult<()> {
        fs.write_raw_inode(self.number, raw)
    }

    // ========================================================================
    // Block Map
    // ========================================================================

    fn new_table_block(fs: &Ext2FS, raw: &mut RawInode) -> FsResult<u32> {
        let block = fs.allocate_block()?;
        fs.zero_block(block)?;
        raw.blocks += Self::sectors_per_block(fs)?;
        Ok(block)
    }

    /// 論理ブロックのポインタ格納場所を探す
    ///
    /// `create` なら途中の間接ブロックを確保する。そうでなければ経路が欠けていると None。
    fn locate(
        &self,
        fs: &Ext2FS,
        raw: &mut RawInode,
        logical: u64,
        create: bool,
    ) -> FsResult<Option<PointerSlot>> {
        let path = BlockPath::resolve(logical, fs.pointers_per_block()?)?;
        if path.depth == 0 {
            return Ok(Some(PointerSlot::Inode(path.slot)));
        }

        let mut table = raw.block[path.slot];
        if table == 0 {
            if !create {
                return Ok(None);
            }
            table = Self::new_table_block(fs, raw)?;
            raw.block[path.slot] = table;
        }
        for &index in &path.indices[..path.depth - 1] {
            let mut data = fs.read_block(table)?;
            let mut next = read_le_u32(&data, index * 4)?;
            if next == 0 {
                if !create {
                    return Ok(None);
                }
                next = Self::new_table_block(fs, raw)?;
                write_le_u32(&mut data, index * 4, next)?;
                fs.write_block(table, &data)?;
            }
            table = next;
        }
        Ok(Some(PointerSlot::Table {
            block: table,
            index: path.indices[path.depth - 1],
        }))
    }

    /// 間接ブロック配下の割り当て済みブロックを `[first, end)` の範囲で集める
    fn collect_tree(
        fs: &Ext2FS,
        table: u32,
        level: u32,
        base: u64,
        first: u64,
        end: u64,
        blocks: &mut HashMap<u64, u64>,
    ) -> FsResult<()> {
        let per_block = fs.pointers_per_block()?;
        let child_span = per_block.pow(level - 1);
        let data = fs.read_block(table)?;
        for index in 0..per_block {
            let child_base = base + index * child_span;
            if child_base >= end {
                break;
            }
            if child_base + child_span <= first {
                continue;
            }
            let pointer = read_le_u32(&data, index as usize * 4)?;
            if pointer == 0 {
                continue;
            }
            if level == 1 {
                blocks.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;
                blocks.insert(child_base, pointer as u64);
            } else {
                Self::collect_tree(fs, pointer, level - 1, child_base, first, end, blocks)?;
            }
        }
        Ok(())
    }

    /// 間接ブロックを含め、木全体を解放する
    fn free_tree(fs: &Ext2FS, table: u32, level: u32) -> FsResult<()> {
        if level > 0 {
            let data = fs.read_block(table)?;
            for index in 0..fs.pointers_per_block()? as usize {
                let pointer = read_le_u32(&data, index * 4)?;
                if pointer != 0 {
                    Self::free_tree(fs, pointer, level - 1)?;
                }
            }
        }
        fs.free_block(table)
    }

    /// 論理ブロック `logical` を解放し、ポインタを 0 にする
    ///
    /// 解放したら true、もともと穴なら false。間接ブロックは残す。
    pub fn free_block_at(&self, logical: u64) -> FsResult<bool> {
        let fs = self.fs()?;
        fs.check_writable()?;
        let previous = self.block_view.clear_block_pointer(self, logical)?;
        if previous == 0 {
            return Ok(false);
        }
        fs.free_block(physical_block(previous)?)?;
        Ok(true)
    }

    // ========================================================================
    // Link Counting
    // ========================================================================

    pub(super) fn adjust_links(&self, delta: i16) -> FsResult<()> {
        let fs = self.fs()?;
        let mut raw = self.raw.lock();
        raw.links_count = raw
            .links_count
            .checked_add_signed(delta)
            .ok_or(FsError::IoError)?;
        raw.ctime = time::now().seconds as u32;
        self.store(&fs, &raw)
    }

    pub(super) fn touch_ctime(&self) -> FsResult<()> {
        let fs = self.fs()?;
        let mut raw = self.raw.lock();
        raw.ctime = time::now().seconds as u32;
        self.store(&fs, &raw)
    }

    /// リンクを1つ外す。0になったらデータとinodeを解放する
    pub(super) fn drop_link(&self) -> FsResult<()> {
        let fs = self.fs()?;
        let remaining = {
            let mut raw = self.raw.lock();
            raw.links_count = raw.links_count.saturating_sub(1);
            raw.ctime = time::now().seconds as u32;
            self.store(&fs, &raw)?;
            raw.links_count
        };
        if remaining == 0 {
            self.release(&fs)?;
        }
        Ok(())
    }

    fn release(&self, fs: &Ext2FS) -> FsResult<()> {
        self.block_view.invalidate();
        let mut raw = self.raw.lock();
        let fast_symlink = raw.file_mode().file_type() == FileType::Symlink && raw.blocks == 0;
        if !fast_symlink {
            for slot in 0..DIRECT_BLOCKS {
                if raw.block[slot] != 0 {
                    fs.free_block(raw.block[slot])?;
                }
            }
            for (level, slot) in [(1, INDIRECT_BLOCK), (2, DOUBLE_INDIRECT_BLOCK), (3, TRIPLE_INDIRECT_BLOCK)] {
                if raw.block[slot] != 0 {
                    Self::free_tree(fs, raw.block[slot], level)?;
                }
            }
        }
        let directory = raw.is_directory();
        raw.block = [0; 15];
        raw.blocks = 0;
        raw.set_file_size(0);
        raw.dtime = time::now().seconds as u32;
        self.store(fs, &raw)?;
        drop(raw);
        fs.free_inode(self.number, directory)?;
        fs.forget_inode(self.number);
        Ok(())
    }

    // ========================================================================
    // Directories
    // ========================================================================

    fn directory_blocks(&self, fs: &Ext2FS) -> FsResult<u64> {
        if !self.is_directory() {
            return Err(FsError::NotDirectory);
        }
        Ok(self.raw.lock().file_size() / fs.block_size()? as u64)
    }

    /// `(物理ブロック, 内容)`。穴なら None
    fn directory_block(&self, fs: &Ext2FS, logical: u64) -> FsResult<Option<(u32, Vec<u8>)>> {
        let physical = self.block_view.get_block(self, logical)?;
        if physical == 0 {
            return Ok(None);
        }
        let block = physical_block(physical)?;
        Ok(Some((block, fs.read_block(block)?)))
    }

    /// 使用中のエントリから名前で探す
    pub(super) fn find_entry(&self, name: &str) -> FsResult<Option<DirEntry>> {
        let fs = self.fs()?;
        for logical in 0..self.directory_blocks(&fs)? {
            let Some((_, data)) = self.directory_block(&fs, logical)? else {
                continue;
            };
            if let Some(entry) = parse_dir_block(&data)?
                .into_iter()
                .find(|entry| entry.inode != 0 && entry.name == name)
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// エントリを追加する。呼び出し側が `dir_lock` を保持する
    pub(super) fn add_entry(&self, name: &str, inode: u32, file_type: u8) -> FsResult<()> {
        let fs = self.fs()?;
        let file_type = if fs.dirent_file_type() { file_type } else { 0 };
        let needed = DirEntry::record_len(name.len());

        for logical in 0..self.directory_blocks(&fs)? {
            let Some((block, mut data)) = self.directory_block(&fs, logical)? else {
                continue;
            };
            for mut entry in parse_dir_block(&data)? {
                let used = entry.used_len();
                let slack = entry.rec_len as usize - used;
                if slack < needed {
                    continue;
                }
                let offset = entry.offset + used;
                let rec_len = if entry.inode == 0 {
                    entry.rec_len
                } else {
                    entry.rec_len = used as u16;
                    entry.encode_into(&mut data)?;
                    slack as u16
                };
                DirEntry {
                    offset,
                    inode,
                    rec_len,
                    file_type,
                    name: String::from(name),
                }
                .encode_into(&mut data)?;
                return fs.write_block(block, &data);
            }
        }

        // 空きがなければブロックを1つ足す
        let bs = fs.block_size()?;
        let logical = self.directory_blocks(&fs)?;
        let block = physical_block(self.block_view.get_or_allocate_block(self, logical, true, true)?)?;
        let mut data = vec![0u8; bs];
        DirEntry {
            offset: 0,
            inode,
            rec_len: bs as u16,
            file_type,
            name: String::from(name),
        }
        .encode_into(&mut data)?;
        fs.write_block(block, &data)?;

        let mut raw = self.raw.lock();
        let size = raw.file_size() + bs as u64;
        raw.set_file_size(size);
        raw.mtime = time::now().seconds as u32;
        self.store(&fs, &raw)
    }

    /// エントリを取り除く。直前のエントリに吸収させる (先頭なら inode を 0 に)
    pub(super) fn remove_entry(&self, name: &str) -> FsResult<DirEntry> {
        let fs = self.fs()?;
        for logical in 0..self.directory_blocks(&fs)? {
            let Some((block, mut data)) = self.directory_block(&fs, logical)? else {
                continue;
            };
            let entries = parse_dir_block(&data)?;
            let Some(position) = entries
                .iter()
                .position(|entry| entry.inode != 0 && entry.name == name)
            else {
                continue;
            };
            let removed = entries[position].clone();
            if position == 0 {
                write_le_u32(&mut data, removed.offset, 0)?;
            } else {
                let mut previous = entries[position - 1].clone();
                previous.rec_len += removed.rec_len;
                previous.encode_into(&mut data)?;
            }
            fs.write_block(block, &data)?;
            let mut raw = self.raw.lock();
            raw.mtime = time::now().seconds as u32;
            self.store(&fs, &raw)?;
            return Ok(removed);
        }
        Err(FsError::NoSuchEntity)
    }

    /// 新しいディレクトリに "." と ".." を書く
    fn init_directory(&self, fs: &Ext2FS, parent: u32) -> FsResult<()> {
        let bs = fs.block_size()?;
        let block = physical_block(self.block_view.get_or_allocate_block(self, 0, true, true)?)?;
        let mut data = vec![0u8; bs];
        let file_type = if fs.dirent_file_type() { file_type_from_mode(FileMode::S_IFDIR) } else { 0 };
        DirEntry {
            offset: 0,
            inode: self.number,
            rec_len: 12,
            file_type,
            name: String::from("."),
        }
        .encode_into(&mut data)?;
        DirEntry {
            offset: 12,
            inode: parent,
            rec_len: (bs - 12) as u16,
            file_type,
            name: String::from(".."),
        }
        .encode_into(&mut data)?;
        fs.write_block(block, &data)?;

        let mut raw = self.raw.lock();
        raw.set_file_size(bs as u64);
        self.store(fs, &raw)
    }

    /// ".." を付け替える
    pub(super) fn set_parent(&self, parent: u32) -> FsResult<()> {
        let fs = self.fs()?;
        for logical in 0..self.directory_blocks(&fs)? {
            let Some((block, mut data)) = self.directory_block(&fs, logical)? else {
                continue;
            };
            if let Some(mut entry) = parse_dir_block(&data)?
                .into_iter()
                .find(|entry| entry.inode != 0 && entry.name == "..")
            {
                entry.inode = parent;
                entry.encode_into(&mut data)?;
                return fs.write_block(block, &data);
            }
        }
        Err(FsError::IoError)
    }

    /// このディレクトリにファイルやディレクトリを作る
    pub fn create_child(&self, name: &str, mode: u16, uid: u32, gid: u32) -> FsResult<Arc<Ext2Inode>> {
        let fs = self.fs()?;
        fs.check_writable()?;
        if !self.is_directory() {
            return Err(FsError::NotDirectory);
        }
        validate_name(name)?;
        let uid = u16::try_from(uid).map_err(|_| FsError::InvalidArgument)?;
        let gid = u16::try_from(gid).map_err(|_| FsError::InvalidArgument)?;

        let _guard = fs.dir_lock.lock();
        if self.find_entry(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let directory = FileMode(mode).is_dir();
        let number = fs.allocate_inode(directory)?;
        let mut raw = RawInode::new(mode, uid, gid);
        if directory {
            raw.links_count = 2;
        }
        fs.write_raw_inode(number, &raw)?;
        fs.forget_inode(number);
        let child = fs.load_inode(number)?;

        let linked = if directory {
            child
                .init_directory(&fs, self.number)
                .and_then(|_| self.adjust_links(1))
        } else {
            Ok(())
        }
        .and_then(|_| self.add_entry(name, number, file_type_from_mode(mode)));
        if let Err(error) = linked {
            log::warn!("ext2 {}: create {} failed: {}", fs.fsid(), name, error);
            child.release(&fs)?;
            return Err(error);
        }
        log::debug!("ext2 {}: created {} as inode {}", fs.fsid(), name, number);
        Ok(child)
    }

    /// 非ディレクトリのエントリを消す
    pub fn unlink(&self, name: &str) -> FsResult<()> {
        let fs = self.fs()?;
        fs.check_writable()?;
        validate_name(name)?;
        let _guard = fs.dir_lock.lock();
        let entry = self.find_entry(name)?.ok_or(FsError::NoSuchEntity)?;
        let target = fs.load_inode(entry.inode)?;
        if target.is_directory() {
            return Err(FsError::IsDirectory);
        }
        self.remove_entry(name)?;
        target.drop_link()
    }
}

impl BlockListProvider for Ext2Inode {
    fn compute_block_list(&self, first: u64, count: u64) -> FsResult<HashMap<u64, u64>> {
        let fs = self.fs()?;
        let raw = *self.raw.lock();
        let end = first.saturating_add(count);
        let mut blocks = HashMap::new();

        for logical in first..end.min(DIRECT_BLOCKS as u64) {
            let pointer = raw.block[logical as usize];
            if pointer != 0 {
                blocks.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;
                blocks.insert(logical, pointer as u64);
            }
        }

        let per_block = fs.pointers_per_block()?;
        let mut base = DIRECT_BLOCKS as u64;
        for (level, slot) in [(1, INDIRECT_BLOCK), (2, DOUBLE_INDIRECT_BLOCK), (3, TRIPLE_INDIRECT_BLOCK)] {
            let span = per_block.pow(level);
            if raw.block[slot] != 0 && first < base + span && end > base {
                Self::collect_tree(&fs, raw.block[slot], level, base, first, end, &mut blocks)?;
            }
            base += span;
        }
        Ok(blocks)
    }

    fn allocate_block(&self, logical: u64, zero_new_block: bool) -> FsResult<u64> {
        let fs = self.fs()?;
        let mut raw = self.raw.lock();
        let before = *raw;
        // 間接ブロックの経路を先に用意しておく
        self.locate(&fs, &mut raw, logical, true)?;
        if *raw != before {
            self.store(&fs, &raw)?;
        }
        let block = fs.allocate_block()?;
        if zero_new_block {
            fs.zero_block(block)?;
        }
        Ok(block as u64)
    }

    fn write_block_pointer(&self, logical: u64, physical: u64) -> FsResult<()> {
        let fs = self.fs()?;
        let physical = u32::try_from(physical).map_err(|_| FsError::OutOfRange)?;
        let mut raw = self.raw.lock();
        let Some(slot) = self.locate(&fs, &mut raw, logical, physical != 0)? else {
            return Ok(());
        };
        let previous = match slot {
            PointerSlot::Inode(slot) => core::mem::replace(&mut raw.block[slot], physical),
            PointerSlot::Table { block, index } => {
                let mut data = fs.read_block(block)?;
                let previous = read_le_u32(&data, index * 4)?;
                write_le_u32(&mut data, index * 4, physical)?;
                fs.write_block(block, &data)?;
                previous
            }
        };
        let sectors = Self::sectors_per_block(&fs)?;
        if previous == 0 && physical != 0 {
            raw.blocks += sectors;
        } else if previous != 0 && physical == 0 {
            raw.blocks = raw.blocks.saturating_sub(sectors);
        }
        self.store(&fs, &raw)
    }

    fn free_block(&self, physical: u64) -> FsResult<()> {
        let fs = self.fs()?;
        fs.free_block(physical_block(physical)?)
    }
}

impl Inode for Ext2Inode {
    fn identifier(&self) -> InodeIdentifier {
        self.id
    }

    fn metadata(&self) -> FsResult<FileAttr> {
        let fs = self.fs()?;
        let raw = *self.raw.lock();
        let block_size = fs.block_size()? as u32;
        let mut attr = FileAttr::new(self.id, raw.file_mode());
        attr.uid = raw.uid as u32;
        attr.gid = raw.gid as u32;
        attr.size = raw.file_size();
        attr.nlink = raw.links_count as u32;
        attr.atime = TimeSpec::from_seconds(raw.atime as i64);
        attr.mtime = TimeSpec::from_seconds(raw.mtime as i64);
        attr.ctime = TimeSpec::from_seconds(raw.ctime as i64);
        attr.block_size = block_size;
        attr.block_count = raw.blocks as u64 / (block_size as u64 / 512);
        attr.device = raw.device();
        Ok(attr)
    }

    fn lookup(&self, name: &str) -> FsResult<InodeHandle> {
        let fs = self.fs()?;
        let entry = self.find_entry(name)?.ok_or(FsError::NoSuchEntity)?;
        Ok(fs.load_inode(entry.inode)?)
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        let fs = self.fs()?;
        for logical in 0..self.directory_blocks(&fs)? {
            let Some((_, data)) = self.directory_block(&fs, logical)? else {
                continue;
            };
            for entry in parse_dir_block(&data)? {
                if entry.inode == 0 {
                    continue;
                }
                let file_type = if entry.file_type != 0 {
                    entry.file_type
                } else {
                    file_type_from_mode(fs.read_raw_inode(entry.inode)?.mode)
                };
                let view = DirectoryEntryView::new(
                    entry.name,
                    InodeIdentifier::new(self.id.fsid(), entry.inode as u64),
                    file_type,
                );
                if callback(&view) == IterationDecision::Break {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let fs = self.fs()?;
        let raw = *self.raw.lock();
        if raw.is_directory() {
            return Err(FsError::IsDirectory);
        }
        let size = raw.file_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);

        if raw.file_mode().file_type() == FileType::Symlink && raw.blocks == 0 {
            let mut target = [0u8; FAST_SYMLINK_MAX];
            for (i, pointer) in raw.block.iter().enumerate() {
                target[i * 4..i * 4 + 4].copy_from_slice(&pointer.to_le_bytes());
            }
            let start = (offset as usize).min(FAST_SYMLINK_MAX);
            let len = len.min(FAST_SYMLINK_MAX - start);
            buf[..len].copy_from_slice(&target[start..start + len]);
            return Ok(len);
        }

        let bs = fs.block_size()?;
        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let logical = position / bs as u64;
            let within = (position % bs as u64) as usize;
            let chunk = (bs - within).min(len - done);
            let physical = self.block_view.get_block(self, logical)?;
            if physical == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                let data = fs.read_block(physical_block(physical)?)?;
                buf[done..done + chunk].copy_from_slice(&data[within..within + chunk]);
            }
            done += chunk;
        }
        Ok(len)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let fs = self.fs()?;
        fs.check_writable()?;
        if self.is_directory() {
            return Err(FsError::IsDirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::OutOfRange)?;

        let bs = fs.block_size()?;
        let mut done = 0;
        while done < data.len() {
            let position = offset + done as u64;
            let logical = position / bs as u64;
            let within = (position % bs as u64) as usize;
            let chunk = (bs - within).min(data.len() - done);
            let partial = chunk < bs;
            let block = physical_block(self.block_view.get_or_allocate_block(self, logical, partial, true)?)?;
            if partial {
                let mut contents = fs.read_block(block)?;
                contents[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
                fs.write_block(block, &contents)?;
            } else {
                fs.write_block(block, &data[done..done + chunk])?;
            }
            done += chunk;
        }

        let mut raw = self.raw.lock();
        if end > raw.file_size() {
            raw.set_file_size(end);
        }
        let now = time::now().seconds as u32;
        raw.mtime = now;
        raw.ctime = now;
        self.store(&fs, &raw)?;
        Ok(data.len())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block::{BlockDevice, RamDisk};
    use crate::fs::ext2::ondisk::EXT2_FT_DIR;
    use crate::fs::ext2::{FormatOptions, format};
    use crate::fs::vfs::{FileSystem, FileSystemHandle, directory_entries};

    fn mounted(blocks: u64, block_size: u32) -> Arc<Ext2FS> {
        let device: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(blocks, 512));
        format(
            &device,
            &FormatOptions {
                block_size,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        let handle = Ext2FS::try_create(device, false).unwrap();
        handle.initialize().unwrap();
        match handle {
            FileSystemHandle::Ext2(fs) => fs,
            other => panic!("unexpected handle {:?}", other),
        }
    }

    fn root(fs: &Arc<Ext2FS>) -> Arc<Ext2Inode> {
        fs.load_inode(2).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_block_path_levels() {
        let direct = BlockPath::resolve(11, 256).unwrap();
        assert_eq!((direct.slot, direct.depth), (11, 0));
        let single = BlockPath::resolve(12, 256).unwrap();
        assert_eq!((single.slot, single.depth, single.indices[0]), (INDIRECT_BLOCK, 1, 0));
        let double = BlockPath::resolve(12 + 256 + 257, 256).unwrap();
        assert_eq!(double.slot, DOUBLE_INDIRECT_BLOCK);
        assert_eq!(&double.indices[..2], &[1, 1]);
        let triple = BlockPath::resolve(12 + 256 + 65536, 256).unwrap();
        assert_eq!((triple.slot, triple.depth), (TRIPLE_INDIRECT_BLOCK, 3));
        assert_eq!(
            BlockPath::resolve(12 + 256 + 65536 + 256 * 65536, 256),
            Err(FsError::OutOfRange)
        );
    }

    #[test]
    fn test_write_read_across_indirect_boundary() {
        let fs = mounted(4096, 1024);
        let file = root(&fs)
            .create_child("file", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        // 直接ブロック12個を越えて単間接ブロックに入る
        let data = pattern(20 * 1024 + 100, 3);
        assert_eq!(file.write_bytes(0, &data).unwrap(), data.len());
        assert_eq!(file.metadata().unwrap().size, data.len() as u64);

        let mut back = vec![0u8; data.len()];
        assert_eq!(file.read_bytes(0, &mut back).unwrap(), data.len());
        assert_eq!(back, data);

        // 21データブロック + 間接ブロック1つ
        assert_eq!(file.metadata().unwrap().block_count, 22);
        assert_ne!(file.raw.lock().block[INDIRECT_BLOCK], 0);
    }

    #[test]
    fn test_double_indirect_and_holes() {
        let fs = mounted(4096, 1024);
        let file = root(&fs)
            .create_child("sparse", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        let far = (12 + 256 + 10) * 1024u64;
        file.write_bytes(far, b"far away").unwrap();
        assert_ne!(file.raw.lock().block[DOUBLE_INDIRECT_BLOCK], 0);
        assert_eq!(file.raw.lock().block[INDIRECT_BLOCK], 0);

        let mut buf = [0xFFu8; 16];
        assert_eq!(file.read_bytes(1024, &mut buf).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
        let mut buf = [0u8; 8];
        file.read_bytes(far, &mut buf).unwrap();
        assert_eq!(&buf, b"far away");
        // 二重間接 + 間接 + データ
        assert_eq!(file.metadata().unwrap().block_count, 3);
    }

    #[test]
    fn test_partial_overwrite_preserves_neighbours() {
        let fs = mounted(2048, 2048);
        let file = root(&fs)
            .create_child("f", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        file.write_bytes(0, &[b'a'; 4096]).unwrap();
        file.write_bytes(2040, b"0123456789abcdef").unwrap();
        let mut buf = [0u8; 20];
        file.read_bytes(2038, &mut buf).unwrap();
        assert_eq!(&buf, b"aa0123456789abcdefaa");
        assert_eq!(file.metadata().unwrap().size, 4096);
    }

    #[test]
    fn test_block_view_serves_repeat_reads_from_cache() {
        let fs = mounted(2048, 1024);
        let file = root(&fs)
            .create_child("cached", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        file.write_bytes(0, &pattern(4096, 1)).unwrap();
        let before = file.block_view().stats();
        let mut buf = [0u8; 4096];
        file.read_bytes(0, &mut buf).unwrap();
        let after = file.block_view().stats();
        assert_eq!(after.refreshes, before.refreshes);
        assert_eq!(after.hits, before.hits + 4);
    }

    #[test]
    fn test_unreferenced_allocation_is_returned() {
        let fs = mounted(2048, 1024);
        let file = root(&fs)
            .create_child("orphan", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        let free = fs.free_blocks_count().unwrap();
        let physical = BlockListProvider::allocate_block(file.as_ref(), 0, true).unwrap();
        assert_eq!(fs.free_blocks_count().unwrap(), free - 1);
        BlockListProvider::free_block(file.as_ref(), physical).unwrap();
        assert_eq!(fs.free_blocks_count().unwrap(), free);
        assert_eq!(file.raw.lock().block[0], 0);
    }

    #[test]
    fn test_free_block_at_punches_hole() {
        let fs = mounted(2048, 1024);
        let file = root(&fs)
            .create_child("holes", FileMode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        file.write_bytes(0, &[9u8; 3072]).unwrap();
        assert!(file.free_block_at(1).unwrap());
        assert_eq!(file.block_view().get_block(file.as_ref(), 1).unwrap(), 0);
        assert_eq!(file.raw.lock().block[1], 0);
        let mut buf = [1u8; 3072];
        file.read_bytes(0, &mut buf).unwrap();
        assert!(buf[1024..2048].iter().all(|&b| b == 0));
        assert!(buf[2048..].iter().all(|&b| b == 9));
        assert_eq!(file.metadata().unwrap().block_count, 2);
    }

    #[test]
    fn test_create_child_validation() {
        let fs = mounted(2048, 1024);
        let root = root(&fs);
        let mode = FileMode::S_IFREG | 0o644;
        assert_eq!(root.create_child("", mode, 0, 0).err(), Some(FsError::InvalidArgument));
        assert_eq!(root.create_child("..", mode, 0, 0).err(), Some(FsError::InvalidArgument));
        assert_eq!(root.create_child("a/b", mode, 0, 0).err(), Some(FsError::InvalidArgument));
        let long: String = core::iter::repeat('n').take(256).collect();
        assert_eq!(root.create_child(&long, mode, 0, 0).err(), Some(FsError::NameTooLong));
        root.create_child("dup", mode, 0, 0).unwrap();
        assert_eq!(root.create_child("dup", mode, 0, 0).err(), Some(FsError::AlreadyExists));

        let file = root.lookup("dup").unwrap();
        let file = file.as_any().downcast_ref::<Ext2Inode>().unwrap();
        assert_eq!(file.create_child("x", mode, 0, 0).err(), Some(FsError::NotDirectory));
    }

    #[test]
    fn test_directory_grows_and_lists_in_order() {
        let fs = mounted(4096, 1024);
        let root = root(&fs);
        let names: Vec<String> = (0..60).map(|i| alloc::format!("entry-with-a-long-name-{:03}", i)).collect();
        for name in &names {
            root.create_child(name, FileMode::S_IFREG | 0o644, 0, 0).unwrap();
        }
        assert!(root.metadata().unwrap().size > 1024);

        let listed: Vec<String> = directory_entries(root.as_ref())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .skip(2)
            .collect();
        assert_eq!(listed, names);
        let found = root.lookup("entry-with-a-long-name-059").unwrap();
        assert!(found.metadata().unwrap().mode.is_regular());
    }

    #[test]
    fn test_traverse_break_and_types() {
        let fs = mounted(2048, 1024);
        let root = root(&fs);
        root.create_child("d", FileMode::S_IFDIR | 0o755, 0, 0).unwrap();
        root.create_child("f", FileMode::S_IFREG | 0o644, 0, 0).unwrap();

        let mut seen = Vec::new();
        root.traverse_as_directory(&mut |entry| {
            seen.push((entry.name.clone(), entry.file_type));
            if entry.name == "d" {
                IterationDecision::Break
            } else {
                IterationDecision::Continue
            }
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (String::from("d"), EXT2_FT_DIR));
        let entry = DirectoryEntryView::new("d", root.identifier(), seen[2].1);
        assert_eq!(
            fs.internal_file_type_to_directory_entry_type(&entry),
            crate::fs::vfs::DT_DIR
        );
    }

    #[test]
    fn test_unlink_reuses_space() {
        let fs = mounted(2048, 1024);
        let root = root(&fs);
        let blocks = fs.free_blocks_count().unwrap();
        let inodes = fs.free_inodes_count().unwrap();
        let file = root.create_child("gone", FileMode::S_IFREG | 0o644, 0, 0).unwrap();
        file.write_bytes(0, &[1u8; 14 * 1024]).unwrap();
        drop(file);
        root.unlink("gone").unwrap();
        assert_eq!(fs.free_blocks_count().unwrap(), blocks);
        assert_eq!(fs.free_inodes_count().unwrap(), inodes);
        assert_eq!(root.lookup("gone").err(), Some(FsError::NoSuchEntity));

        root.create_child("dir", FileMode::S_IFDIR | 0o755, 0, 0).unwrap();
        assert_eq!(root.unlink("dir"), Err(FsError::IsDirectory));
    }

    #[test]
    fn test_subdirectory_has_dot_entries() {
        let fs = mounted(2048, 1024);
        let root = root(&fs);
        let dir = root.create_child("sub", FileMode::S_IFDIR | 0o750, 0, 0).unwrap();
        assert_eq!(dir.metadata().unwrap().nlink, 2);
        assert_eq!(dir.lookup(".").unwrap().identifier(), dir.identifier());
        assert_eq!(dir.lookup("..").unwrap().identifier(), root.identifier());
        assert_eq!(dir.read_bytes(0, &mut [0u8; 4]), Err(FsError::IsDirectory));
    }
}
