// ============================================================================
// src/fs/mod.rs - Filesystem Abstraction Layer
// ============================================================================
//!
//! # ファイルシステム抽象化レイヤー
//!
//! ## 構成
//! - `partition`: MBR / EBR / GPT の解析と `DiskPartition` ブロックデバイス
//! - `vfs`: バックエンド契約 (`FileSystem` / `Inode`) とマウントテーブル
//! - `block_view`: inodeごとの論理→物理ブロック番号キャッシュ
//! - `mount`: ファイルシステム種別ごとの記述子と型付きマウントフラグ
//! - バックエンド: `ext2`, `devpts`, `devloop`, `coredump`, `fuse`
//!
//! ## 制御フロー
//! 生ブロックデバイス → パーティション解析 → `DiskPartition` →
//! マウントレジストリ経由でバックエンド生成 → `get_inode(InodeIdentifier)`

pub mod block;
pub mod block_view;
pub mod bytes;
pub mod config;
pub mod coredump;
pub mod devloop;
pub mod devpts;
pub mod ext2;
pub mod fuse;
pub mod inode_id;
pub mod mount;
pub mod partition;
pub mod vfs;

pub use block::{
    BlockDevice, BlockDeviceInfo, BlockDeviceManager, BlockError, BlockResult, RamDisk,
    block_manager,
};
pub use block_view::{BlockListProvider, BlockView, BlockViewStats};
pub use inode_id::InodeIdentifier;
pub use mount::{
    FileDescription, FileDescriptionTable, FileSystemInitializer, MountFlagValue, MountRequest,
    MountSource, MountSpecificFlags, mount, registered_filesystems,
};
pub use partition::{
    DiskPartition, DiskPartitionMetadata, MbrSystemId, PartitionTable, PartitionType,
    enumerate_partitions,
};
pub use vfs::{
    DeviceNumber, DirectoryEntryView, FileAttr, FileMode, FileSystem, FileSystemBase,
    FileSystemHandle, FileSystemKind, FileSystemState, FileType, Inode, InodeHandle, MountFlags,
    MountTable, mount_table,
};
