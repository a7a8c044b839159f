// ============================================================================
// src/lib.rs - ExoRust VFS Switch
// ============================================================================
//!
//! # 仮想ファイルシステムスイッチ & ブロックストレージ・パーティション層
//!
//! - パーティションテーブル (MBR / EBRチェイン / GPT) を解析し、
//!   各パーティションを独立したブロックデバイスとして公開する
//! - 複数のファイルシステムバックエンド (ext2, devpts, devloop, coredump, FUSE)
//!   を単一の名前空間にマウントし、`InodeIdentifier` で統一的に参照する
//!
//! 物理ブロックI/O、メモリ管理、スケジューリングは外部コラボレータとして
//! トレイト経由で受け取る。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod sync;
pub mod time;

pub use error::{FsError, FsResult};
pub use fs::{
    BlockDevice, DiskPartition, DiskPartitionMetadata, FileSystem, FileSystemHandle, Inode,
    InodeHandle, InodeIdentifier, MountFlags, PartitionType,
};
