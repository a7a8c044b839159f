// ============================================================================
// src/fs/config.rs - Filesystem Layer Constants
// ============================================================================
//!
//! VFS層のコンパイル時設定値

/// ブロックビューキャッシュの1ウィンドウあたりのエントリ数
pub const BLOCK_VIEW_WINDOW_SIZE: u64 = 16384;

/// EBRチェインを辿る最大深さ
pub const EBR_MAX_DEPTH: usize = 128;

/// パーティションテーブルのセクタサイズ
pub const SECTOR_SIZE: usize = 512;

/// GPTヘッダが置かれるLBA
pub const GPT_HEADER_LBA: u64 = 1;

/// GPTエントリの最小サイズ
pub const GPT_MIN_ENTRY_SIZE: usize = 128;

/// GPTエントリ数の上限 (壊れたヘッダ対策)
pub const GPT_MAX_ENTRIES: u32 = 1024;

/// 合成ファイルシステムのルートinode番号
pub const SYNTHETIC_ROOT_INDEX: u64 = 1;

/// 合成ファイルシステムで `index - OFFSET` がバッキング番号になる
pub const SYNTHETIC_INDEX_OFFSET: u64 = 2;

/// devpts スレーブPTYのメジャー番号
pub const PTY_SLAVE_MAJOR: u32 = 201;

/// ループデバイスのメジャー番号
pub const LOOP_DEVICE_MAJOR: u32 = 20;

/// FUSE プロトコルバージョン
pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

/// FUSE READ / READDIR 1回あたりの最大転送量
pub const FUSE_MAX_READ: u32 = 64 * 1024;
