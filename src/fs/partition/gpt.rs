// ============================================================================
// src/fs/partition/gpt.rs - GUID Partition Table
// ============================================================================
//!
//! GPTヘッダ (LBA 1) とパーティションエントリ配列の解析
//!
//! ヘッダ:
//! ```text
//! 0   signature "EFI PART"      56  disk GUID (16)
//! 8   revision (u32)            72  partition entries LBA (u64)
//! 12  header size (u32)         80  number of entries (u32)
//! 16  header CRC32 (u32)        84  size of entry (u32)
//! 24  current LBA (u64)         88  entries CRC32 (u32)
//! 32  backup LBA (u64)
//! 40  first usable LBA (u64)
//! 48  last usable LBA (u64)
//! ```
//! エントリ: type GUID (0), unique GUID (16), first LBA (32), last LBA (40),
//! attributes (48), name UTF-16LE ×36 (56)
//!
//! CRCは検証しない。

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use uuid::Uuid;

use super::{DiskPartitionMetadata, PartitionType, read_sector};
use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::bytes::{
    ensure_slice, read_fixed, read_le_u32, read_le_u64, write_bytes, write_le_u16,
    write_le_u32, write_le_u64,
};
use crate::fs::config::{GPT_HEADER_LBA, GPT_MAX_ENTRIES, GPT_MIN_ENTRY_SIZE, SECTOR_SIZE};

// ============================================================================
// Constants
// ============================================================================

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_REVISION_1_0: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const GPT_NAME_UNITS: usize = 36;

// ============================================================================
// Header
// ============================================================================

/// GPTヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub partition_entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    pub fn decode(sector: &[u8]) -> FsResult<Self> {
        let signature: [u8; 8] = read_fixed(sector, 0)?;
        if signature != GPT_SIGNATURE {
            log::warn!("gpt: bad header signature");
            return Err(FsError::InvalidArgument);
        }
        let header = Self {
            revision: read_le_u32(sector, 8)?,
            header_size: read_le_u32(sector, 12)?,
            header_crc32: read_le_u32(sector, 16)?,
            current_lba: read_le_u64(sector, 24)?,
            backup_lba: read_le_u64(sector, 32)?,
            first_usable_lba: read_le_u64(sector, 40)?,
            last_usable_lba: read_le_u64(sector, 48)?,
            disk_guid: Uuid::from_bytes_le(read_fixed(sector, 56)?),
            partition_entries_lba: read_le_u64(sector, 72)?,
            entry_count: read_le_u32(sector, 80)?,
            entry_size: read_le_u32(sector, 84)?,
            entries_crc32: read_le_u32(sector, 88)?,
        };

        let entry_size = header.entry_size as usize;
        if entry_size < GPT_MIN_ENTRY_SIZE || entry_size % 8 != 0 {
            log::warn!("gpt: unsupported entry size {}", entry_size);
            return Err(FsError::InvalidArgument);
        }
        if header.entry_count > GPT_MAX_ENTRIES {
            log::warn!("gpt: entry count {} too large", header.entry_count);
            return Err(FsError::InvalidArgument);
        }
        Ok(header)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        let _ = self.encode_into(&mut sector);
        sector
    }

    fn encode_into(&self, sector: &mut [u8]) -> FsResult<()> {
        write_bytes(sector, 0, &GPT_SIGNATURE)?;
        write_le_u32(sector, 8, self.revision)?;
        write_le_u32(sector, 12, self.header_size)?;
        write_le_u32(sector, 16, self.header_crc32)?;
        write_le_u64(sector, 24, self.current_lba)?;
        write_le_u64(sector, 32, self.backup_lba)?;
        write_le_u64(sector, 40, self.first_usable_lba)?;
        write_le_u64(sector, 48, self.last_usable_lba)?;
        write_bytes(sector, 56, &self.disk_guid.to_bytes_le())?;
        write_le_u64(sector, 72, self.partition_entries_lba)?;
        write_le_u32(sector, 80, self.entry_count)?;
        write_le_u32(sector, 84, self.entry_size)?;
        write_le_u32(sector, 88, self.entries_crc32)
    }

    /// エントリ配列のバイト数
    pub fn array_len(&self) -> usize {
        self.entry_count as usize * self.entry_size as usize
    }
}

// ============================================================================
// Entry
// ============================================================================

/// パーティションエントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    /// 種別GUIDが非nilなら使用中
    pub fn is_present(&self) -> bool {
        !self.type_guid.is_nil()
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        let name_bytes = ensure_slice(bytes, 56, GPT_NAME_UNITS * 2)?;
        let units = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0);
        let name = char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();

        Ok(Self {
            type_guid: Uuid::from_bytes_le(read_fixed(bytes, 0)?),
            unique_guid: Uuid::from_bytes_le(read_fixed(bytes, 16)?),
            first_lba: read_le_u64(bytes, 32)?,
            last_lba: read_le_u64(bytes, 40)?,
            attributes: read_le_u64(bytes, 48)?,
            name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; GPT_MIN_ENTRY_SIZE];
        let _ = self.encode_into(&mut bytes);
        bytes
    }

    fn encode_into(&self, bytes: &mut [u8]) -> FsResult<()> {
        write_bytes(bytes, 0, &self.type_guid.to_bytes_le())?;
        write_bytes(bytes, 16, &self.unique_guid.to_bytes_le())?;
        write_le_u64(bytes, 32, self.first_lba)?;
        write_le_u64(bytes, 40, self.last_lba)?;
        write_le_u64(bytes, 48, self.attributes)?;
        for (i, unit) in self.name.encode_utf16().take(GPT_NAME_UNITS).enumerate() {
            write_le_u16(bytes, 56 + i * 2, unit)?;
        }
        Ok(())
    }

    fn to_metadata(&self) -> DiskPartitionMetadata {
        DiskPartitionMetadata::new(
            self.first_lba,
            self.last_lba.saturating_add(1),
            PartitionType::Guid(self.type_guid),
        )
        .with_gpt_details(self.unique_guid, self.attributes, self.name.clone())
    }
}

// ============================================================================
// Parser
// ============================================================================

/// GPTを解析し、ディスクGUIDとパーティション一覧を返す
pub fn parse(device: &dyn BlockDevice) -> FsResult<(Uuid, Vec<DiskPartitionMetadata>)> {
    let header = GptHeader::decode(&read_sector(device, GPT_HEADER_LBA)?)?;
    log::debug!(
        "gpt: disk {} with {} entries of {} bytes at LBA {}",
        header.disk_guid,
        header.entry_count,
        header.entry_size,
        header.partition_entries_lba
    );

    let block_size = device.block_size();
    let array_blocks = header.array_len().div_ceil(block_size);
    let array = if array_blocks == 0 {
        Vec::new()
    } else {
        device.read_blocks(header.partition_entries_lba, array_blocks)?
    };

    let mut partitions = Vec::new();
    for i in 0..header.entry_count as usize {
        let raw = ensure_slice(&array, i * header.entry_size as usize, header.entry_size as usize)?;
        let entry = GptEntry::decode(raw)?;
        if !entry.is_present() {
            continue;
        }
        if entry.first_lba > entry.last_lba {
            log::warn!(
                "gpt: entry {} has inverted range {}..{}, skipping",
                i,
                entry.first_lba,
                entry.last_lba
            );
            continue;
        }
        partitions.push(entry.to_metadata());
    }
    Ok((header.disk_guid, partitions))
}
