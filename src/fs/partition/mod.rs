// ============================================================================
// src/fs/partition/mod.rs - Disk Partitioning
// ============================================================================
//!
//! # パーティションテーブル
//!
//! 生ブロックデバイス上の MBR / EBRチェイン / GPT を解析し、
//! `DiskPartitionMetadata` の一覧を作る。各パーティションは `DiskPartition`
//! でラップされ、独立したブロックデバイスとして登録される。
//!
//! ## 規約
//! - ブロック番号はデバイスブロック単位
//! - `end_block` は排他的 (MBR/EBR: `start + length`, GPT: `last_lba + 1`)

pub mod disk_partition;
pub mod ebr;
pub mod gpt;
pub mod mbr;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::fs::block::{BlockDevice, block_manager};
use crate::fs::config::SECTOR_SIZE;

pub use disk_partition::DiskPartition;

// ============================================================================
// Partition Type
// ============================================================================

/// よく知られたMBRシステムID
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MbrSystemId {
    Empty = 0x00,
    Fat12 = 0x01,
    Fat16Small = 0x04,
    Extended = 0x05,
    Fat16 = 0x06,
    Ntfs = 0x07,
    Fat32 = 0x0B,
    Fat32Lba = 0x0C,
    Fat16Lba = 0x0E,
    ExtendedLba = 0x0F,
    LinuxSwap = 0x82,
    Linux = 0x83,
    LinuxExtended = 0x85,
    GptProtective = 0xEE,
    EfiSystem = 0xEF,
}

impl MbrSystemId {
    /// EBRチェインの先頭になる種別
    pub const fn is_extended(self) -> bool {
        matches!(
            self,
            MbrSystemId::Extended | MbrSystemId::ExtendedLba | MbrSystemId::LinuxExtended
        )
    }
}

/// パーティション種別: MBRの1バイト指示子 または GPTの種別GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    Indicator(u8),
    Guid(Uuid),
}

impl PartitionType {
    /// EFI System Partition
    pub const EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
    /// Linux filesystem data
    pub const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

    /// 非0なら有効
    pub fn is_valid(&self) -> bool {
        match self {
            PartitionType::Indicator(indicator) => *indicator != 0,
            PartitionType::Guid(guid) => !guid.is_nil(),
        }
    }

    pub fn system_id(&self) -> Option<MbrSystemId> {
        match self {
            PartitionType::Indicator(indicator) => MbrSystemId::try_from(*indicator).ok(),
            PartitionType::Guid(_) => None,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.system_id().is_some_and(MbrSystemId::is_extended)
    }

    pub fn is_gpt_protective(&self) -> bool {
        self.system_id() == Some(MbrSystemId::GptProtective)
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Indicator(indicator) => match self.system_id() {
                Some(id) => write!(f, "{:#04x} ({:?})", indicator, id),
                None => write!(f, "{:#04x}", indicator),
            },
            PartitionType::Guid(guid) => write!(f, "{}", guid.hyphenated()),
        }
    }
}

// ============================================================================
// Partition Metadata
// ============================================================================

/// 1パーティション分のメタデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPartitionMetadata {
    start_block: u64,
    end_block: u64,
    partition_type: PartitionType,
    unique_guid: Uuid,
    attributes: u64,
    name: String,
}

impl DiskPartitionMetadata {
    pub fn new(start_block: u64, end_block: u64, partition_type: PartitionType) -> Self {
        debug_assert!(start_block <= end_block);
        Self {
            start_block,
            end_block,
            partition_type,
            unique_guid: Uuid::nil(),
            attributes: 0,
            name: String::new(),
        }
    }

    /// GPTエントリ固有の情報を付与
    pub fn with_gpt_details(mut self, unique_guid: Uuid, attributes: u64, name: String) -> Self {
        self.unique_guid = unique_guid;
        self.attributes = attributes;
        self.name = name;
        self
    }

    /// 絶対ブロック数だけずらしたコピー
    pub fn offset(&self, blocks: u64) -> Self {
        Self {
            start_block: self.start_block + blocks,
            end_block: self.end_block + blocks,
            ..self.clone()
        }
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// 排他的な終端
    pub fn end_block(&self) -> u64 {
        self.end_block
    }

    pub fn block_count(&self) -> u64 {
        self.end_block - self.start_block
    }

    pub fn partition_type(&self) -> PartitionType {
        self.partition_type
    }

    pub fn unique_guid(&self) -> Uuid {
        self.unique_guid
    }

    pub fn attributes(&self) -> u64 {
        self.attributes
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Table Detection
// ============================================================================

/// パーティション方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

/// 解析済みパーティションテーブル
#[derive(Debug, Clone)]
pub struct PartitionTable {
    scheme: PartitionScheme,
    disk_guid: Option<Uuid>,
    partitions: Vec<DiskPartitionMetadata>,
}

impl PartitionTable {
    /// ブロック0のMBRを読み、保護MBRならGPT、それ以外はMBR+EBRとして解析する
    ///
    /// 署名が無い場合は `NoSuchEntity` (パーティションテーブル無し)
    pub fn detect(device: &dyn BlockDevice) -> FsResult<Self> {
        let header = mbr::MbrHeader::read(device, 0)?;
        if !header.has_signature() {
            return Err(FsError::NoSuchEntity);
        }

        if header.is_protective() {
            let (disk_guid, partitions) = gpt::parse(device)?;
            return Ok(Self {
                scheme: PartitionScheme::Gpt,
                disk_guid: Some(disk_guid),
                partitions,
            });
        }

        let partitions = mbr::parse_header(device, &header, 0)?;
        Ok(Self {
            scheme: PartitionScheme::Mbr,
            disk_guid: None,
            partitions,
        })
    }

    pub fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    pub fn disk_guid(&self) -> Option<Uuid> {
        self.disk_guid
    }

    pub fn partitions(&self) -> &[DiskPartitionMetadata] {
        &self.partitions
    }

    pub fn into_partitions(self) -> Vec<DiskPartitionMetadata> {
        self.partitions
    }
}

/// ディスクのパーティションを解析し、`<disk><n>` (1始まり) としてブロックマネージャへ登録する
pub fn enumerate_partitions(
    disk_name: &str,
    device: Arc<dyn BlockDevice>,
) -> FsResult<Vec<Arc<DiskPartition>>> {
    let table = PartitionTable::detect(device.as_ref())?;
    log::info!(
        "partition: {} has {:?} table with {} partition(s)",
        disk_name,
        table.scheme(),
        table.partitions().len()
    );

    let mut result = Vec::with_capacity(table.partitions().len());
    for (i, metadata) in table.into_partitions().into_iter().enumerate() {
        let name = format!("{}{}", disk_name, i + 1);
        log::debug!(
            "partition: {} [{}..{}) type {}",
            name,
            metadata.start_block(),
            metadata.end_block(),
            metadata.partition_type()
        );
        let partition = Arc::new(DiskPartition::new(device.clone(), metadata, &name)?);
        block_manager().register(&name, partition.clone());
        result.push(partition);
    }
    Ok(result)
}

/// ブロック `index` の先頭セクタ (512バイト) を読む
pub(crate) fn read_sector(device: &dyn BlockDevice, index: u64) -> FsResult<Vec<u8>> {
    if device.block_size() < SECTOR_SIZE {
        return Err(FsError::InvalidArgument);
    }
    let mut block = device.read_blocks(index, 1)?;
    block.truncate(SECTOR_SIZE);
    Ok(block)
}
