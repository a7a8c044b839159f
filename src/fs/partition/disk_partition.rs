// ============================================================================
// src/fs/partition/disk_partition.rs - Partition as a Block Device
// ============================================================================
//!
//! 下位デバイスのブロック番号に `block_offset` を加算して転送するラッパー。
//! `block_limit` (パーティション長) を超えるアクセスは `OutOfRange`。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::DiskPartitionMetadata;
use crate::error::{FsError, FsResult};
use crate::fs::block::{BlockDevice, BlockDeviceInfo, BlockResult, check_range};

/// パーティションを独立したブロックデバイスとして見せる
pub struct DiskPartition {
    device: Arc<dyn BlockDevice>,
    metadata: DiskPartitionMetadata,
    name: String,
}

impl DiskPartition {
    /// パーティションがデバイス末尾を越える場合は `OutOfRange`
    pub fn new(
        device: Arc<dyn BlockDevice>,
        metadata: DiskPartitionMetadata,
        name: &str,
    ) -> FsResult<Self> {
        if metadata.end_block() > device.block_count() {
            log::warn!(
                "partition: {} ends at block {} past device end {}",
                name,
                metadata.end_block(),
                device.block_count()
            );
            return Err(FsError::OutOfRange);
        }
        Ok(Self {
            device,
            metadata,
            name: String::from(name),
        })
    }

    pub fn metadata(&self) -> &DiskPartitionMetadata {
        &self.metadata
    }

    /// 下位デバイス上の開始ブロック
    pub fn block_offset(&self) -> u64 {
        self.metadata.start_block()
    }

    /// パーティション長 (ブロック数)
    pub fn block_limit(&self) -> u64 {
        self.metadata.block_count()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, index: u64, count: usize) -> BlockResult<u64> {
        check_range(index, count, self.block_limit())?;
        Ok(self.block_offset() + index)
    }
}

impl BlockDevice for DiskPartition {
    fn info(&self) -> BlockDeviceInfo {
        let parent = self.device.info();
        BlockDeviceInfo {
            name: self.name.clone(),
            total_blocks: self.block_limit(),
            block_size: parent.block_size,
            read_only: parent.read_only,
        }
    }

    fn read_blocks(&self, index: u64, count: usize) -> BlockResult<Vec<u8>> {
        let physical = self.translate(index, count)?;
        self.device.read_blocks(physical, count)
    }

    fn write_blocks(&self, index: u64, count: usize, data: &[u8]) -> BlockResult<()> {
        let physical = self.translate(index, count)?;
        self.device.write_blocks(physical, count, data)
    }

    fn flush(&self) -> BlockResult<()> {
        self.device.flush()
    }

    fn block_size(&self) -> usize {
        self.device.block_size()
    }

    fn block_count(&self) -> u64 {
        self.block_limit()
    }
}
