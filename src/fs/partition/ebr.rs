// ============================================================================
// src/fs/partition/ebr.rs - Extended Boot Record chain
// ============================================================================
//!
//! 拡張パーティション内の論理パーティション (EBRチェイン) の展開
//!
//! 各EBRはMBRと同じセクタ形式で、スロット0が論理パーティション、
//! スロット1が次のEBRを指す。どちらの offset も現在のEBRの位置からの
//! 相対値で、次のEBRへ進むたびに位置を積算していく。
//!
//! offset 0 のスロットは未使用扱いなので、次のEBRは常に現在より後ろにある。
//! 後方を指すポインタは表現できず、延々と続く (敵対的な) チェインは
//! 深さ上限で打ち切る。再帰は使わず、深さ上限付きのループで辿る。
//! 読めない・署名の無いEBRに当たった場合もそこで打ち切り、
//! それまでに集めた論理パーティションを返す。

use alloc::vec::Vec;

use super::DiskPartitionMetadata;
use super::mbr::MbrHeader;
use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::config::EBR_MAX_DEPTH;

const LOGICAL_SLOT: usize = 0;
const NEXT_SLOT: usize = 1;

/// `extended_start` から始まるEBRチェインを展開し、チェイン順に論理パーティションを返す
///
/// 3つ以上のエントリを持つEBRがあれば全体を `InvalidArgument` で中止する。
/// 論理パーティションは `offset(current)` で絶対位置へ移す。
pub fn walk_chain(
    device: &dyn BlockDevice,
    extended_start: u64,
) -> FsResult<Vec<DiskPartitionMetadata>> {
    let mut partitions = Vec::new();
    let mut current = extended_start;
    let mut depth_budget = EBR_MAX_DEPTH;

    loop {
        if depth_budget == 0 {
            log::warn!(
                "ebr: chain from block {} exceeds depth {}, truncating",
                extended_start,
                EBR_MAX_DEPTH
            );
            break;
        }
        depth_budget -= 1;

        let header = match MbrHeader::read(device, current) {
            Ok(header) => header,
            Err(error) => {
                log::warn!("ebr: cannot read EBR at block {} ({}), truncating", current, error);
                break;
            }
        };
        if !header.has_signature() {
            log::warn!("ebr: block {} has no boot signature, truncating", current);
            break;
        }
        if header.present_entries().count() > 2 {
            log::warn!("ebr: block {} carries more than two entries", current);
            return Err(FsError::InvalidArgument);
        }

        let logical = header.entries[LOGICAL_SLOT];
        if logical.is_present() {
            let meta = logical.to_metadata(0).offset(current);
            log::debug!(
                "ebr: logical partition [{}..{}) from EBR at {}",
                meta.start_block(),
                meta.end_block(),
                current
            );
            partitions.push(meta);
        }

        let next = header.entries[NEXT_SLOT];
        if !next.is_present() {
            break;
        }
        current = match current.checked_add(next.offset as u64) {
            Some(block) => block,
            None => break,
        };
    }

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block::RamDisk;
    use crate::fs::partition::mbr::{self, MbrEntry};

    fn write_ebr(disk: &RamDisk, at: u64, logical: MbrEntry, next: MbrEntry) {
        let header = MbrHeader::new([logical, next, MbrEntry::EMPTY, MbrEntry::EMPTY]);
        disk.write_blocks(at, 1, &header.encode()).unwrap();
    }

    /// MBR: 0x0F at 100. EBR(100) -> logical +150, next +50 -> EBR(150) -> logical +150
    #[test]
    fn test_two_logical_partitions_in_chain_order() {
        let disk = RamDisk::new(512, 512);
        let mbr = MbrHeader::new([
            MbrEntry::new(0x0F, 100, 300),
            MbrEntry::EMPTY,
            MbrEntry::EMPTY,
            MbrEntry::EMPTY,
        ]);
        disk.write_blocks(0, 1, &mbr.encode()).unwrap();
        write_ebr(&disk, 100, MbrEntry::new(0x83, 150, 50), MbrEntry::new(0x05, 50, 100));
        write_ebr(&disk, 150, MbrEntry::new(0x83, 150, 50), MbrEntry::EMPTY);

        let parts = mbr::parse(&disk, 0).unwrap();
        let ranges: Vec<_> = parts.iter().map(|p| (p.start_block(), p.end_block())).collect();
        assert_eq!(ranges, [(250, 300), (300, 350)]);
    }

    #[test]
    fn test_chain_depth_yields_one_partition_per_ebr() {
        let disk = RamDisk::new(256, 512);
        let depth = 20u32;
        for i in 0..depth {
            let at = 10 + i as u64 * 4;
            let next = if i + 1 < depth {
                MbrEntry::new(0x05, 4, 4)
            } else {
                MbrEntry::EMPTY
            };
            write_ebr(&disk, at, MbrEntry::new(0x83, 1, 3), next);
        }
        let parts = walk_chain(&disk, 10).unwrap();
        assert_eq!(parts.len(), depth as usize);
        assert_eq!(parts[3].start_block(), 10 + 12 + 1);
    }

    #[test]
    fn test_self_pointing_next_entry_ends_chain() {
        let disk = RamDisk::new(64, 512);
        // EBR(20) の次エントリは offset 0 (自分自身) なので未使用扱い
        write_ebr(&disk, 10, MbrEntry::new(0x83, 1, 2), MbrEntry::new(0x05, 10, 4));
        write_ebr(&disk, 20, MbrEntry::new(0x83, 1, 2), MbrEntry::new(0x05, 0, 4));
        let parts = walk_chain(&disk, 10).unwrap();
        let starts: Vec<_> = parts.iter().map(|p| p.start_block()).collect();
        assert_eq!(starts, [11, 21]);
    }

    #[test]
    fn test_depth_budget_truncates() {
        let total = EBR_MAX_DEPTH as u64 + 10;
        let disk = RamDisk::new(total * 2 + 8, 512);
        for i in 0..total {
            write_ebr(
                &disk,
                2 + i * 2,
                MbrEntry::new(0x83, 1, 1),
                MbrEntry::new(0x05, 2, 2),
            );
        }
        let parts = walk_chain(&disk, 2).unwrap();
        assert_eq!(parts.len(), EBR_MAX_DEPTH);
    }

    #[test]
    fn test_next_offsets_accumulate() {
        let disk = RamDisk::new(256, 512);
        // EBR(100) -> +10 -> EBR(110) -> +10 -> EBR(120)
        write_ebr(&disk, 100, MbrEntry::new(0x83, 1, 5), MbrEntry::new(0x05, 10, 10));
        write_ebr(&disk, 110, MbrEntry::new(0x83, 1, 5), MbrEntry::new(0x05, 10, 10));
        write_ebr(&disk, 120, MbrEntry::new(0x83, 1, 5), MbrEntry::EMPTY);
        let parts = walk_chain(&disk, 100).unwrap();
        let starts: Vec<_> = parts.iter().map(|p| p.start_block()).collect();
        assert_eq!(starts, [101, 111, 121]);
        assert!(parts.iter().all(|p| p.block_count() == 5));
    }

    #[test]
    fn test_unwritten_extended_partition_keeps_primaries() {
        let disk = RamDisk::new(256, 512);
        let mbr = MbrHeader::new([
            MbrEntry::new(0x83, 1, 50),
            MbrEntry::new(0x0F, 100, 100),
            MbrEntry::EMPTY,
            MbrEntry::EMPTY,
        ]);
        disk.write_blocks(0, 1, &mbr.encode()).unwrap();
        let parts = mbr::parse(&disk, 0).unwrap();
        let ranges: Vec<_> = parts.iter().map(|p| (p.start_block(), p.end_block())).collect();
        assert_eq!(ranges, [(1, 51)]);
    }

    #[test]
    fn test_chain_stops_at_unsigned_or_unreadable_ebr() {
        let disk = RamDisk::new(64, 512);
        // EBR(10) -> EBR(20) (未書き込み)
        write_ebr(&disk, 10, MbrEntry::new(0x83, 1, 4), MbrEntry::new(0x05, 10, 4));
        let parts = walk_chain(&disk, 10).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_block(), 11);

        // 次のEBRがデバイスの外
        write_ebr(&disk, 10, MbrEntry::new(0x83, 1, 4), MbrEntry::new(0x05, 1000, 4));
        assert_eq!(walk_chain(&disk, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_more_than_two_entries_is_invalid() {
        let disk = RamDisk::new(64, 512);
        let header = MbrHeader::new([
            MbrEntry::new(0x83, 1, 2),
            MbrEntry::new(0x05, 4, 2),
            MbrEntry::new(0x83, 8, 2),
            MbrEntry::EMPTY,
        ]);
        disk.write_blocks(10, 1, &header.encode()).unwrap();
        assert_eq!(walk_chain(&disk, 10), Err(FsError::InvalidArgument));
    }
}
