// ============================================================================
// src/fs/ext2/ondisk.rs - Ext2 On-Disk Structures
// ============================================================================
//!
//! スーパーブロック / グループ記述子 / inode / ディレクトリエントリの
//! エンコードとデコード、バイト単位のデバイスI/O、最小限のフォーマッタ。
//!
//! エンコードは既存のバッファへ上書きする形で行い、
//! 扱わないフィールドのバイトはそのまま残す。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::bytes::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_u8, trim_nul_padded, write_bytes,
    write_le_u16, write_le_u32, write_u8,
};
use crate::fs::vfs::{DeviceNumber, FileMode, FileType};
use crate::time;

/// Ext2マジックナンバー
pub const EXT2_MAGIC: u16 = 0xEF53;
/// スーパーブロックのオフセット（バイト）
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
/// ルートディレクトリのinode番号
pub const ROOT_INODE: u32 = 2;
/// リビジョン0での最初の非予約inode
pub const GOOD_OLD_FIRST_INODE: u32 = 11;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const GROUP_DESCRIPTOR_SIZE: usize = 32;
pub const RAW_INODE_SIZE: usize = 128;

/// 直接ブロック数
pub const DIRECT_BLOCKS: usize = 12;
/// 間接ブロックインデックス
pub const INDIRECT_BLOCK: usize = 12;
/// 二重間接ブロックインデックス
pub const DOUBLE_INDIRECT_BLOCK: usize = 13;
/// 三重間接ブロックインデックス
pub const TRIPLE_INDIRECT_BLOCK: usize = 14;

pub const DIR_ENTRY_HEADER_SIZE: usize = 8;
pub const MAX_NAME_LEN: usize = 255;

/// ディレクトリエントリにファイル種別を持つ
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// ディレクトリエントリのファイル種別
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

/// モードからディレクトリエントリ種別へ
pub fn file_type_from_mode(mode: u16) -> u8 {
    match FileType::from_mode(mode) {
        FileType::Regular => EXT2_FT_REG_FILE,
        FileType::Directory => EXT2_FT_DIR,
        FileType::CharDevice => EXT2_FT_CHRDEV,
        FileType::BlockDevice => EXT2_FT_BLKDEV,
        FileType::Fifo => EXT2_FT_FIFO,
        FileType::Socket => EXT2_FT_SOCK,
        FileType::Symlink => EXT2_FT_SYMLINK,
        FileType::Unknown => EXT2_FT_UNKNOWN,
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// Ext2スーパーブロック (使用するフィールドのみ)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    /// ブロックサイズ（log2 - 10）
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_incompat: u32,
    pub uuid: Uuid,
    pub volume_name: String,
}

impl Superblock {
    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, SUPERBLOCK_SIZE)?;
        let sb = Self {
            inodes_count: read_le_u32(data, 0)?,
            blocks_count: read_le_u32(data, 4)?,
            reserved_blocks_count: read_le_u32(data, 8)?,
            free_blocks_count: read_le_u32(data, 12)?,
            free_inodes_count: read_le_u32(data, 16)?,
            first_data_block: read_le_u32(data, 20)?,
            log_block_size: read_le_u32(data, 24)?,
            blocks_per_group: read_le_u32(data, 32)?,
            inodes_per_group: read_le_u32(data, 40)?,
            mtime: read_le_u32(data, 44)?,
            wtime: read_le_u32(data, 48)?,
            magic: read_le_u16(data, 56)?,
            state: read_le_u16(data, 58)?,
            rev_level: read_le_u32(data, 76)?,
            first_ino: read_le_u32(data, 84)?,
            inode_size: read_le_u16(data, 88)?,
            feature_incompat: read_le_u32(data, 96)?,
            uuid: Uuid::from_bytes(read_fixed(data, 104)?),
            volume_name: trim_nul_padded(ensure_slice(data, 120, 16)?),
        };

        if sb.magic != EXT2_MAGIC {
            return Err(FsError::InvalidArgument);
        }
        if sb.log_block_size > 6 || sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(FsError::InvalidArgument);
        }
        // ビットマップは1グループ1ブロック
        let bits_per_block = sb.block_size() * 8;
        if sb.blocks_per_group > bits_per_block || sb.inodes_per_group > bits_per_block {
            return Err(FsError::InvalidArgument);
        }
        if sb.rev_level > 0 && (sb.inode_size < GOOD_OLD_INODE_SIZE || !sb.inode_size.is_power_of_two()) {
            return Err(FsError::InvalidArgument);
        }
        Ok(sb)
    }

    pub fn encode_into(&self, data: &mut [u8]) -> FsResult<()> {
        write_le_u32(data, 0, self.inodes_count)?;
        write_le_u32(data, 4, self.blocks_count)?;
        write_le_u32(data, 8, self.reserved_blocks_count)?;
        write_le_u32(data, 12, self.free_blocks_count)?;
        write_le_u32(data, 16, self.free_inodes_count)?;
        write_le_u32(data, 20, self.first_data_block)?;
        write_le_u32(data, 24, self.log_block_size)?;
        // log_frag_size / frags_per_group はブロックと同じ
        write_le_u32(data, 28, self.log_block_size)?;
        write_le_u32(data, 32, self.blocks_per_group)?;
        write_le_u32(data, 36, self.blocks_per_group)?;
        write_le_u32(data, 40, self.inodes_per_group)?;
        write_le_u32(data, 44, self.mtime)?;
        write_le_u32(data, 48, self.wtime)?;
        write_le_u16(data, 56, self.magic)?;
        write_le_u16(data, 58, self.state)?;
        write_le_u32(data, 76, self.rev_level)?;
        write_le_u32(data, 84, self.first_ino)?;
        write_le_u16(data, 88, self.inode_size)?;
        write_le_u32(data, 96, self.feature_incompat)?;
        write_bytes(data, 104, self.uuid.as_bytes())?;
        let mut name = [0u8; 16];
        let len = self.volume_name.len().min(16);
        name[..len].copy_from_slice(&self.volume_name.as_bytes()[..len]);
        write_bytes(data, 120, &name)
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    pub fn group_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }

    pub fn inode_size(&self) -> u32 {
        if self.rev_level == 0 {
            GOOD_OLD_INODE_SIZE as u32
        } else {
            self.inode_size as u32
        }
    }

    pub fn first_inode(&self) -> u32 {
        if self.rev_level == 0 {
            GOOD_OLD_FIRST_INODE
        } else {
            self.first_ino
        }
    }
}

// ============================================================================
// Block Group Descriptor
// ============================================================================

/// ブロックグループ記述子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    pub fn decode(data: &[u8], offset: usize) -> FsResult<Self> {
        let data = ensure_slice(data, offset, GROUP_DESCRIPTOR_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(data, 0)?,
            inode_bitmap: read_le_u32(data, 4)?,
            inode_table: read_le_u32(data, 8)?,
            free_blocks_count: read_le_u16(data, 12)?,
            free_inodes_count: read_le_u16(data, 14)?,
            used_dirs_count: read_le_u16(data, 16)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> FsResult<()> {
        write_le_u32(data, offset, self.block_bitmap)?;
        write_le_u32(data, offset + 4, self.inode_bitmap)?;
        write_le_u32(data, offset + 8, self.inode_table)?;
        write_le_u16(data, offset + 12, self.free_blocks_count)?;
        write_le_u16(data, offset + 14, self.free_inodes_count)?;
        write_le_u16(data, offset + 16, self.used_dirs_count)
    }
}

// ============================================================================
// Inode
// ============================================================================

/// オンディスクinode (先頭128バイト)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512バイト単位
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; 15],
    pub generation: u32,
    /// 通常ファイルではサイズの上位32bit
    pub size_high: u32,
}

impl RawInode {
    pub fn new(mode: u16, uid: u16, gid: u16) -> Self {
        let now = time::now().seconds as u32;
        Self {
            mode,
            uid,
            gid,
            atime: now,
            ctime: now,
            mtime: now,
            links_count: 1,
            ..Self::default()
        }
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, RAW_INODE_SIZE)?;
        let mut block = [0u32; 15];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(data, 40 + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(data, 0)?,
            uid: read_le_u16(data, 2)?,
            size: read_le_u32(data, 4)?,
            atime: read_le_u32(data, 8)?,
            ctime: read_le_u32(data, 12)?,
            mtime: read_le_u32(data, 16)?,
            dtime: read_le_u32(data, 20)?,
            gid: read_le_u16(data, 24)?,
            links_count: read_le_u16(data, 26)?,
            blocks: read_le_u32(data, 28)?,
            flags: read_le_u32(data, 32)?,
            block,
            generation: read_le_u32(data, 100)?,
            size_high: read_le_u32(data, 108)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> FsResult<()> {
        write_le_u16(data, 0, self.mode)?;
        write_le_u16(data, 2, self.uid)?;
        write_le_u32(data, 4, self.size)?;
        write_le_u32(data, 8, self.atime)?;
        write_le_u32(data, 12, self.ctime)?;
        write_le_u32(data, 16, self.mtime)?;
        write_le_u32(data, 20, self.dtime)?;
        write_le_u16(data, 24, self.gid)?;
        write_le_u16(data, 26, self.links_count)?;
        write_le_u32(data, 28, self.blocks)?;
        write_le_u32(data, 32, self.flags)?;
        for (i, block) in self.block.iter().enumerate() {
            write_le_u32(data, 40 + i * 4, *block)?;
        }
        write_le_u32(data, 100, self.generation)?;
        write_le_u32(data, 108, self.size_high)
    }

    pub fn file_mode(&self) -> FileMode {
        FileMode(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.file_mode().is_dir()
    }

    pub fn file_size(&self) -> u64 {
        if self.file_mode().is_regular() {
            (self.size_high as u64) << 32 | self.size as u64
        } else {
            self.size as u64
        }
    }

    pub fn set_file_size(&mut self, size: u64) {
        self.size = size as u32;
        if self.file_mode().is_regular() {
            self.size_high = (size >> 32) as u32;
        }
    }

    /// デバイスファイルのデバイス番号 (旧形式は block[0]、新形式は block[1])
    pub fn device(&self) -> Option<DeviceNumber> {
        if !matches!(
            self.file_mode().file_type(),
            FileType::CharDevice | FileType::BlockDevice
        ) {
            return None;
        }
        if self.block[0] != 0 {
            let dev = self.block[0];
            return Some(DeviceNumber::new((dev >> 8) & 0xff, dev & 0xff));
        }
        let dev = self.block[1];
        Some(DeviceNumber::new(
            (dev & 0xfff00) >> 8,
            (dev & 0xff) | ((dev >> 12) & 0xfff00),
        ))
    }
}

// ============================================================================
// Directory Entries
// ============================================================================

/// ディレクトリブロック内の1エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// ブロック内オフセット
    pub offset: usize,
    /// 0 は未使用エントリ
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
}

impl DirEntry {
    /// 名前長に必要な最小レコード長 (4バイト境界)
    pub const fn record_len(name_len: usize) -> usize {
        (DIR_ENTRY_HEADER_SIZE + name_len + 3) & !3
    }

    /// 実際に使っている長さ。未使用エントリは 0
    pub fn used_len(&self) -> usize {
        if self.inode == 0 {
            0
        } else {
            Self::record_len(self.name.len())
        }
    }

    pub fn encode_into(&self, block: &mut [u8]) -> FsResult<()> {
        write_le_u32(block, self.offset, self.inode)?;
        write_le_u16(block, self.offset + 4, self.rec_len)?;
        write_u8(block, self.offset + 6, self.name.len() as u8)?;
        write_u8(block, self.offset + 7, self.file_type)?;
        write_bytes(block, self.offset + DIR_ENTRY_HEADER_SIZE, self.name.as_bytes())
    }
}

/// ディレクトリブロックを分解する (未使用エントリも含む)
pub fn parse_dir_block(block: &[u8]) -> FsResult<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + DIR_ENTRY_HEADER_SIZE <= block.len() {
        let inode = read_le_u32(block, offset)?;
        let rec_len = read_le_u16(block, offset + 4)?;
        let name_len = read_u8(block, offset + 6)? as usize;
        let file_type = read_u8(block, offset + 7)?;
        if (rec_len as usize) < DirEntry::record_len(name_len)
            || rec_len % 4 != 0
            || offset + rec_len as usize > block.len()
        {
            log::warn!("ext2: corrupt directory entry at offset {}", offset);
            return Err(FsError::IoError);
        }
        let name = ensure_slice(block, offset + DIR_ENTRY_HEADER_SIZE, name_len)?;
        entries
            .try_reserve(1)
            .map_err(|_| FsError::OutOfMemory)?;
        entries.push(DirEntry {
            offset,
            inode,
            rec_len,
            file_type,
            name: String::from_utf8_lossy(name).into_owned(),
        });
        offset += rec_len as usize;
    }
    Ok(entries)
}

// ============================================================================
// Byte-Addressed Device I/O
// ============================================================================

/// ファイルシステムのバイトオフセットでデバイスを読み書きする
///
/// デバイスのブロックサイズとファイルシステムのブロックサイズが異なってもよい。
/// 境界に揃わない書き込みは read-modify-write になる。
pub struct DiskIo {
    device: Arc<dyn BlockDevice>,
}

impl DiskIo {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn byte_len(&self) -> u64 {
        self.device.block_count() * self.device.block_size() as u64
    }

    fn span(&self, offset: u64, len: usize) -> (u64, usize, usize) {
        let bs = self.device.block_size() as u64;
        let first = offset / bs;
        let last = (offset + len as u64 - 1) / bs;
        (first, (last - first + 1) as usize, (offset - first * bs) as usize)
    }

    pub fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (first, count, skip) = self.span(offset, len);
        let mut data = self.device.read_blocks(first, count)?;
        data.truncate(skip + len);
        Ok(data.split_off(skip))
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> FsResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (first, count, skip) = self.span(offset, bytes.len());
        let bs = self.device.block_size();
        if skip == 0 && bytes.len() == count * bs {
            self.device.write_blocks(first, count, bytes)?;
            return Ok(());
        }
        let mut data = self.device.read_blocks(first, count)?;
        data[skip..skip + bytes.len()].copy_from_slice(bytes);
        self.device.write_blocks(first, count, &data)?;
        Ok(())
    }
}

// ============================================================================
// Formatter
// ============================================================================

/// `format` のパラメータ
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// 1024, 2048, 4096 のいずれか
    pub block_size: u32,
    pub inodes_count: u32,
    pub volume_name: String,
    pub uuid: Uuid,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inodes_count: 128,
            volume_name: String::new(),
            uuid: Uuid::nil(),
        }
    }
}

/// 単一ブロックグループのext2イメージを作る (空のルートディレクトリのみ)
///
/// レイアウト: スーパーブロック, 記述子テーブル, ブロックビットマップ,
/// inodeビットマップ, inodeテーブル, ルートディレクトリのデータブロック
pub fn format(device: &Arc<dyn BlockDevice>, options: &FormatOptions) -> FsResult<()> {
    let bs = options.block_size;
    if !matches!(bs, 1024 | 2048 | 4096) {
        return Err(FsError::InvalidArgument);
    }
    let io = DiskIo::new(device.clone());
    let first_data_block: u32 = if bs == 1024 { 1 } else { 0 };
    let device_blocks = u32::try_from(io.byte_len() / bs as u64).unwrap_or(u32::MAX);
    let blocks_per_group = device_blocks
        .saturating_sub(first_data_block)
        .min(bs * 8);
    let inodes_per_group = options.inodes_count.max(16).div_ceil(8) * 8;
    if inodes_per_group > bs * 8 {
        return Err(FsError::InvalidArgument);
    }

    let gdt_block = first_data_block + 1;
    let block_bitmap = gdt_block + 1;
    let inode_bitmap = gdt_block + 2;
    let inode_table = gdt_block + 3;
    let inode_table_blocks = (inodes_per_group * RAW_INODE_SIZE as u32).div_ceil(bs);
    let root_block = inode_table + inode_table_blocks;
    // 最低でもルートの後ろにデータブロックがいくつか必要
    if root_block + 8 > first_data_block + blocks_per_group {
        return Err(FsError::NoSpace);
    }
    let used_blocks = root_block + 1 - first_data_block;

    // メタデータ領域をゼロクリア
    io.write_at(0, &vec![0u8; ((root_block + 1) * bs) as usize])?;

    let mut bitmap = vec![0u8; bs as usize];
    for bit in 0..used_blocks {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    // グループ末尾より後ろのビットは使用済み扱い
    for bit in blocks_per_group..bs * 8 {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    io.write_at(block_bitmap as u64 * bs as u64, &bitmap)?;

    let mut bitmap = vec![0u8; bs as usize];
    for bit in 0..GOOD_OLD_FIRST_INODE - 1 {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    for bit in inodes_per_group..bs * 8 {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    io.write_at(inode_bitmap as u64 * bs as u64, &bitmap)?;

    let mut root = RawInode::new(FileMode::S_IFDIR | 0o755, 0, 0);
    root.links_count = 2;
    root.size = bs;
    root.blocks = bs / 512;
    root.block[0] = root_block;
    let mut slot = vec![0u8; RAW_INODE_SIZE];
    root.encode_into(&mut slot)?;
    let root_offset = inode_table as u64 * bs as u64 + (ROOT_INODE as u64 - 1) * RAW_INODE_SIZE as u64;
    io.write_at(root_offset, &slot)?;

    let mut dir = vec![0u8; bs as usize];
    DirEntry {
        offset: 0,
        inode: ROOT_INODE,
        rec_len: 12,
        file_type: EXT2_FT_DIR,
        name: String::from("."),
    }
    .encode_into(&mut dir)?;
    DirEntry {
        offset: 12,
        inode: ROOT_INODE,
        rec_len: (bs - 12) as u16,
        file_type: EXT2_FT_DIR,
        name: String::from(".."),
    }
    .encode_into(&mut dir)?;
    io.write_at(root_block as u64 * bs as u64, &dir)?;

    let mut gdt = vec![0u8; GROUP_DESCRIPTOR_SIZE];
    GroupDescriptor {
        block_bitmap,
        inode_bitmap,
        inode_table,
        free_blocks_count: (blocks_per_group - used_blocks) as u16,
        free_inodes_count: (inodes_per_group - (GOOD_OLD_FIRST_INODE - 1)) as u16,
        used_dirs_count: 1,
    }
    .encode_into(&mut gdt, 0)?;
    io.write_at(gdt_block as u64 * bs as u64, &gdt)?;

    let now = time::now().seconds as u32;
    let superblock = Superblock {
        inodes_count: inodes_per_group,
        blocks_count: first_data_block + blocks_per_group,
        reserved_blocks_count: 0,
        free_blocks_count: blocks_per_group - used_blocks,
        free_inodes_count: inodes_per_group - (GOOD_OLD_FIRST_INODE - 1),
        first_data_block,
        log_block_size: bs.trailing_zeros() - 10,
        blocks_per_group,
        inodes_per_group,
        mtime: 0,
        wtime: now,
        magic: EXT2_MAGIC,
        state: 1,
        rev_level: 1,
        first_ino: GOOD_OLD_FIRST_INODE,
        inode_size: GOOD_OLD_INODE_SIZE,
        feature_incompat: FEATURE_INCOMPAT_FILETYPE,
        uuid: options.uuid,
        volume_name: options.volume_name.clone(),
    };
    let mut sb = vec![0u8; SUPERBLOCK_SIZE];
    superblock.encode_into(&mut sb)?;
    io.write_at(SUPERBLOCK_OFFSET, &sb)?;
    device.flush()?;

    log::info!(
        "ext2: formatted {} blocks of {} bytes, {} inodes",
        superblock.blocks_count,
        bs,
        superblock.inodes_count
    );
    Ok(())
}
