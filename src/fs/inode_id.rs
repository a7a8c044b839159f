// ============================================================================
// src/fs/inode_id.rs - Inode Identifier
// ============================================================================
//!
//! ファイルシステムインスタンス内のinodeを指す値型。
//! `(fsid, index)` の組で、どちらかが0なら無効。

use core::fmt;

/// inode識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InodeIdentifier {
    fsid: u32,
    index: u64,
}

impl InodeIdentifier {
    pub const fn new(fsid: u32, index: u64) -> Self {
        Self { fsid, index }
    }

    /// 所属ファイルシステムのID
    #[inline]
    pub const fn fsid(&self) -> u32 {
        self.fsid
    }

    /// ファイルシステム内のinode番号
    #[inline]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// 両フィールドが非0なら有効
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.fsid != 0 && self.index != 0
    }
}

impl fmt::Display for InodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fsid, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_validity() {
        assert!(InodeIdentifier::new(1, 1).is_valid());
        assert!(!InodeIdentifier::new(0, 1).is_valid());
        assert!(!InodeIdentifier::new(1, 0).is_valid());
        assert!(!InodeIdentifier::default().is_valid());
    }

    #[test]
    fn test_structural_equality() {
        let a = InodeIdentifier::new(3, 42);
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, InodeIdentifier::new(4, 42));
    }

    #[test]
    fn test_display() {
        assert_eq!(InodeIdentifier::new(3, 42).to_string(), "3:42");
    }
}
