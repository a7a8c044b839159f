//! 統一エラーハンドリングモジュール
//!
//! VFS層で使用されるエラー型を定義する。
//! ブロック層のエラー (`BlockError`) からの変換もここで提供する。

use thiserror::Error;

use crate::fs::block::BlockError;

/// Filesystem error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// 不正な引数 (マウントフラグ、破損したパーティションテーブル等)
    #[error("invalid argument")]
    InvalidArgument,
    /// 対象のエンティティが存在しない
    #[error("no such entity")]
    NoSuchEntity,
    /// ブロック範囲外アクセス
    #[error("out of range")]
    OutOfRange,
    /// No space left on device
    #[error("no space left on device")]
    NoSpace,
    /// Read-only filesystem
    #[error("read-only filesystem")]
    ReadOnly,
    /// inode / キャッシュエントリの確保に失敗
    #[error("out of memory")]
    OutOfMemory,
    /// Not a directory
    #[error("not a directory")]
    NotDirectory,
    /// Is a directory
    #[error("is a directory")]
    IsDirectory,
    /// File already exists
    #[error("already exists")]
    AlreadyExists,
    /// Name too long
    #[error("name too long")]
    NameTooLong,
    /// Cross-device rename
    #[error("cross-device link")]
    CrossDevice,
    /// Not supported
    #[error("operation not supported")]
    NotSupported,
    /// I/O error
    #[error("I/O error")]
    IoError,
    /// マウント中など、状態が操作を許さない
    #[error("device or resource busy")]
    Busy,
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;

// POSIX errno
const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;
const EXDEV: i32 = 18;
const ENOTDIR: i32 = 20;
const EISDIR: i32 = 21;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EROFS: i32 = 30;
const ERANGE: i32 = 34;
const ENAMETOOLONG: i32 = 36;
const ENOSYS: i32 = 38;
const EOPNOTSUPP: i32 = 95;

impl FsError {
    /// システムコール境界で返す errno (正の値)
    pub const fn errno(self) -> i32 {
        match self {
            FsError::InvalidArgument => EINVAL,
            FsError::NoSuchEntity => ENOENT,
            FsError::OutOfRange => ERANGE,
            FsError::NoSpace => ENOSPC,
            FsError::ReadOnly => EROFS,
            FsError::OutOfMemory => ENOMEM,
            FsError::NotDirectory => ENOTDIR,
            FsError::IsDirectory => EISDIR,
            FsError::AlreadyExists => EEXIST,
            FsError::NameTooLong => ENAMETOOLONG,
            FsError::CrossDevice => EXDEV,
            FsError::NotSupported => EOPNOTSUPP,
            FsError::IoError => EIO,
            FsError::Busy => EBUSY,
        }
    }

    /// FUSE ピアが返した errno をエラー種別へ変換する
    ///
    /// 符号は無視する (FUSE は負値で返す)。未知の値は `IoError`。
    pub fn from_errno(errno: i32) -> Self {
        match errno.unsigned_abs() as i32 {
            EINVAL => FsError::InvalidArgument,
            ENOENT => FsError::NoSuchEntity,
            ERANGE => FsError::OutOfRange,
            ENOSPC => FsError::NoSpace,
            EROFS => FsError::ReadOnly,
            ENOMEM => FsError::OutOfMemory,
            ENOTDIR => FsError::NotDirectory,
            EISDIR => FsError::IsDirectory,
            EEXIST => FsError::AlreadyExists,
            ENAMETOOLONG => FsError::NameTooLong,
            EXDEV => FsError::CrossDevice,
            EOPNOTSUPP | ENOSYS => FsError::NotSupported,
            EBUSY => FsError::Busy,
            EPERM => FsError::ReadOnly,
            _ => FsError::IoError,
        }
    }
}

impl From<BlockError> for FsError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::OutOfRange => FsError::OutOfRange,
            BlockError::ReadOnly => FsError::ReadOnly,
            BlockError::InvalidBufferSize => FsError::InvalidArgument,
            BlockError::IoError => FsError::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping_is_symmetric() {
        let kinds = [
            FsError::InvalidArgument,
            FsError::NoSuchEntity,
            FsError::OutOfRange,
            FsError::NoSpace,
            FsError::ReadOnly,
            FsError::OutOfMemory,
            FsError::NotDirectory,
            FsError::AlreadyExists,
            FsError::CrossDevice,
            FsError::IoError,
        ];
        for kind in kinds {
            assert_eq!(FsError::from_errno(kind.errno()), kind);
            assert_eq!(FsError::from_errno(-kind.errno()), kind);
        }
    }

    #[test]
    fn test_unknown_errno_is_io_error() {
        assert_eq!(FsError::from_errno(-4095), FsError::IoError);
    }

    #[test]
    fn test_block_error_conversion() {
        assert_eq!(FsError::from(BlockError::OutOfRange), FsError::OutOfRange);
        assert_eq!(FsError::from(BlockError::ReadOnly), FsError::ReadOnly);
        assert_eq!(FsError::from(BlockError::IoError), FsError::IoError);
    }

    #[test]
    fn test_display() {
        assert_eq!(alloc::format!("{}", FsError::ReadOnly), "read-only filesystem");
    }
}
