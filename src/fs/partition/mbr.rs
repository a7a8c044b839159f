// ============================================================================
// src/fs/partition/mbr.rs - Master Boot Record
// ============================================================================
//!
//! MBR / EBR 共通のセクタ形式
//!
//! ```text
//! 0..446    ブートコード (EBRでは未使用)
//! 446..510  パーティションエントリ ×4 (16バイト)
//! 510..512  署名 0x55 0xAA
//! ```
//!
//! エントリ: `+0 status`, `+4 type`, `+8 offset (u32 LE)`, `+12 length (u32 LE)`
//! (CHSフィールドは読まない)

use alloc::vec;
use alloc::vec::Vec;

use super::{DiskPartitionMetadata, PartitionType, ebr, read_sector};
use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::bytes::{read_le_u16, read_le_u32, read_u8, write_le_u16, write_le_u32, write_u8};
use crate::fs::config::SECTOR_SIZE;

// ============================================================================
// Constants
// ============================================================================

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const ENTRY_TABLE_OFFSET: usize = 446;
pub const ENTRY_SIZE: usize = 16;
pub const ENTRY_COUNT: usize = 4;
pub const SIGNATURE_OFFSET: usize = 510;

// ============================================================================
// Entry
// ============================================================================

/// パーティションエントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrEntry {
    pub status: u8,
    pub partition_type: u8,
    pub offset: u32,
    pub length: u32,
}

impl MbrEntry {
    pub const EMPTY: MbrEntry = MbrEntry {
        status: 0,
        partition_type: 0,
        offset: 0,
        length: 0,
    };

    pub const fn new(partition_type: u8, offset: u32, length: u32) -> Self {
        Self {
            status: 0,
            partition_type,
            offset,
            length,
        }
    }

    /// offset 0 または type 0 のスロットは未使用
    pub fn is_present(&self) -> bool {
        self.offset != 0 && self.partition_type != 0
    }

    pub fn partition_type(&self) -> PartitionType {
        PartitionType::Indicator(self.partition_type)
    }

    fn decode(sector: &[u8], slot: usize) -> FsResult<Self> {
        let base = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        Ok(Self {
            status: read_u8(sector, base)?,
            partition_type: read_u8(sector, base + 4)?,
            offset: read_le_u32(sector, base + 8)?,
            length: read_le_u32(sector, base + 12)?,
        })
    }

    fn encode(&self, sector: &mut [u8], slot: usize) -> FsResult<()> {
        let base = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        write_u8(sector, base, self.status)?;
        write_u8(sector, base + 4, self.partition_type)?;
        write_le_u32(sector, base + 8, self.offset)?;
        write_le_u32(sector, base + 12, self.length)
    }

    /// `base` からの相対位置としてメタデータ化 (`end = start + length`)
    pub(crate) fn to_metadata(self, base: u64) -> DiskPartitionMetadata {
        let start = base + self.offset as u64;
        DiskPartitionMetadata::new(start, start + self.length as u64, self.partition_type())
    }
}

// ============================================================================
// Header
// ============================================================================

/// 512バイトのMBR (またはEBR) セクタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrHeader {
    pub entries: [MbrEntry; ENTRY_COUNT],
    pub signature: u16,
}

impl MbrHeader {
    /// 署名付きヘッダを作成
    pub const fn new(entries: [MbrEntry; ENTRY_COUNT]) -> Self {
        Self {
            entries,
            signature: MBR_SIGNATURE,
        }
    }

    pub fn decode(sector: &[u8]) -> FsResult<Self> {
        if sector.len() < SECTOR_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let mut entries = [MbrEntry::EMPTY; ENTRY_COUNT];
        for (slot, entry) in entries.iter_mut().enumerate() {
            *entry = MbrEntry::decode(sector, slot)?;
        }
        Ok(Self {
            entries,
            signature: read_le_u16(sector, SIGNATURE_OFFSET)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        for (slot, entry) in self.entries.iter().enumerate() {
            // 固定長バッファ内のオフセットなので失敗しない
            let _ = entry.encode(&mut sector, slot);
        }
        let _ = write_le_u16(&mut sector, SIGNATURE_OFFSET, self.signature);
        sector
    }

    /// ブロック `index` からヘッダを読む
    pub fn read(device: &dyn BlockDevice, index: u64) -> FsResult<Self> {
        Self::decode(&read_sector(device, index)?)
    }

    pub fn has_signature(&self) -> bool {
        self.signature == MBR_SIGNATURE
    }

    /// GPT保護MBR (type 0xEE のエントリを持つ)
    pub fn is_protective(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_present() && e.partition_type().is_gpt_protective())
    }

    pub fn present_entries(&self) -> impl Iterator<Item = &MbrEntry> {
        self.entries.iter().filter(|e| e.is_present())
    }
}

// ============================================================================
// Parser
// ============================================================================

/// ブロック `index` のMBRを解析する。拡張パーティションはEBRチェインを展開する
pub fn parse(device: &dyn BlockDevice, index: u64) -> FsResult<Vec<DiskPartitionMetadata>> {
    let header = MbrHeader::read(device, index)?;
    if !header.has_signature() {
        return Err(FsError::NoSuchEntity);
    }
    parse_header(device, &header, index)
}

/// 読み込み済みヘッダを解析する。エントリのoffsetは `base` からの相対位置
pub(crate) fn parse_header(
    device: &dyn BlockDevice,
    header: &MbrHeader,
    base: u64,
) -> FsResult<Vec<DiskPartitionMetadata>> {
    let mut partitions = Vec::new();
    for entry in header.present_entries() {
        if entry.partition_type().is_extended() {
            let extended_start = base + entry.offset as u64;
            log::debug!("mbr: extended partition at block {}", extended_start);
            partitions.extend(ebr::walk_chain(device, extended_start)?);
        } else {
            log::debug!(
                "mbr: primary partition type {:#04x} at {} ({} blocks)",
                entry.partition_type,
                base + entry.offset as u64,
                entry.length
            );
            partitions.push(entry.to_metadata(base));
        }
    }
    Ok(partitions)
}
