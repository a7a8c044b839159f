// ============================================================================
// src/fs/fuse/protocol.rs - FUSE Wire Protocol
// ============================================================================
//!
//! FUSE カーネルプロトコル (7.x) のメッセージ形式
//!
//! 全フィールドはリトルエンディアン。構造体はキャストせず、オフセット指定で
//! エンコード/デコードする。

use alloc::string::String;
use alloc::vec::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{FsError, FsResult};
use crate::fs::bytes::{ensure_slice, read_le_i32, read_le_u32, read_le_u64};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{DeviceNumber, FileAttr, FileMode, FileType};
use crate::time::TimeSpec;

pub const IN_HEADER_SIZE: usize = 40;
pub const OUT_HEADER_SIZE: usize = 16;
pub const ATTR_SIZE: usize = 88;
pub const ATTR_OUT_SIZE: usize = 16 + ATTR_SIZE;
pub const ENTRY_OUT_SIZE: usize = 40 + ATTR_SIZE;
pub const INIT_IN_SIZE: usize = 16;
/// `max_write` までの最小長
pub const INIT_OUT_MIN_SIZE: usize = 24;
pub const OPEN_OUT_SIZE: usize = 16;
pub const DIRENT_HEADER_SIZE: usize = 24;

/// ルートディレクトリの nodeid
pub const FUSE_ROOT_ID: u64 = 1;

/// 使用するオペコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum FuseOpcode {
    Lookup = 1,
    Getattr = 3,
    Open = 14,
    Read = 15,
    Release = 18,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
}

// ============================================================================
// Headers
// ============================================================================

/// `fuse_in_header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InHeader {
    pub len: u32,
    pub opcode: FuseOpcode,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl InHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&u32::from(self.opcode).to_le_bytes());
        out.extend_from_slice(&self.unique.to_le_bytes());
        out.extend_from_slice(&self.nodeid.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, IN_HEADER_SIZE)?;
        let opcode = FuseOpcode::try_from(read_le_u32(data, 4)?)
            .map_err(|_| FsError::NotSupported)?;
        Ok(Self {
            len: read_le_u32(data, 0)?,
            opcode,
            unique: read_le_u64(data, 8)?,
            nodeid: read_le_u64(data, 16)?,
            uid: read_le_u32(data, 24)?,
            gid: read_le_u32(data, 28)?,
            pid: read_le_u32(data, 32)?,
        })
    }
}

/// `fuse_out_header`。`error` は 0 または負のerrno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

impl OutHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.error.to_le_bytes());
        out.extend_from_slice(&self.unique.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, OUT_HEADER_SIZE)?;
        Ok(Self {
            len: read_le_u32(data, 0)?,
            error: read_le_i32(data, 4)?,
            unique: read_le_u64(data, 8)?,
        })
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// `fuse_attr`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuseAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FuseAttr {
    pub fn encode(&self, out: &mut Vec<u8>) {
        for value in [self.ino, self.size, self.blocks, self.atime, self.mtime, self.ctime] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for value in [
            self.atimensec,
            self.mtimensec,
            self.ctimensec,
            self.mode,
            self.nlink,
            self.uid,
            self.gid,
            self.rdev,
            self.blksize,
            0,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8], offset: usize) -> FsResult<Self> {
        let data = ensure_slice(data, offset, ATTR_SIZE)?;
        Ok(Self {
            ino: read_le_u64(data, 0)?,
            size: read_le_u64(data, 8)?,
            blocks: read_le_u64(data, 16)?,
            atime: read_le_u64(data, 24)?,
            mtime: read_le_u64(data, 32)?,
            ctime: read_le_u64(data, 40)?,
            atimensec: read_le_u32(data, 48)?,
            mtimensec: read_le_u32(data, 52)?,
            ctimensec: read_le_u32(data, 56)?,
            mode: read_le_u32(data, 60)?,
            nlink: read_le_u32(data, 64)?,
            uid: read_le_u32(data, 68)?,
            gid: read_le_u32(data, 72)?,
            rdev: read_le_u32(data, 76)?,
            blksize: read_le_u32(data, 80)?,
        })
    }

    /// VFS の属性へ変換 (識別子は呼び出し側が決める)
    pub fn to_file_attr(&self, id: InodeIdentifier) -> FileAttr {
        let mode = FileMode(self.mode as u16);
        let mut attr = FileAttr::new(id, mode);
        attr.uid = self.uid;
        attr.gid = self.gid;
        attr.size = self.size;
        attr.nlink = self.nlink;
        attr.atime = timespec(self.atime, self.atimensec);
        attr.mtime = timespec(self.mtime, self.mtimensec);
        attr.ctime = timespec(self.ctime, self.ctimensec);
        if self.blksize != 0 {
            attr.block_size = self.blksize;
        }
        attr.block_count = self.blocks;
        if matches!(mode.file_type(), FileType::CharDevice | FileType::BlockDevice) {
            attr.device = Some(decode_device(self.rdev));
        }
        attr
    }
}

fn timespec(seconds: u64, nanoseconds: u32) -> TimeSpec {
    TimeSpec {
        seconds: seconds as i64,
        nanoseconds,
    }
}

/// 32bit `dev_t` (Linux `new_encode_dev` 形式) をデコード
fn decode_device(rdev: u32) -> DeviceNumber {
    let major = (rdev & 0xfff00) >> 8;
    let minor = (rdev & 0xff) | ((rdev >> 12) & 0xfff00);
    DeviceNumber::new(major, minor)
}

/// `fuse_entry_out`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub attr: FuseAttr,
}

impl EntryOut {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nodeid.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        // entry_valid, attr_valid, entry_valid_nsec, attr_valid_nsec
        out.extend_from_slice(&[0u8; 24]);
        self.attr.encode(out);
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, ENTRY_OUT_SIZE)?;
        Ok(Self {
            nodeid: read_le_u64(data, 0)?,
            generation: read_le_u64(data, 8)?,
            attr: FuseAttr::decode(data, 40)?,
        })
    }
}

/// `fuse_attr_out` の属性部分
pub fn encode_attr_out(attr: &FuseAttr, out: &mut Vec<u8>) {
    out.extend_from_slice(&[0u8; 16]);
    attr.encode(out);
}

pub fn decode_attr_out(data: &[u8]) -> FsResult<FuseAttr> {
    ensure_slice(data, 0, ATTR_OUT_SIZE)?;
    FuseAttr::decode(data, 16)
}

// ============================================================================
// Request / Reply Bodies
// ============================================================================

/// `fuse_init_in`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl InitIn {
    pub fn encode(&self, out: &mut Vec<u8>) {
        for value in [self.major, self.minor, self.max_readahead, self.flags] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, INIT_IN_SIZE)?;
        Ok(Self {
            major: read_le_u32(data, 0)?,
            minor: read_le_u32(data, 4)?,
            max_readahead: read_le_u32(data, 8)?,
            flags: read_le_u32(data, 12)?,
        })
    }
}

/// `fuse_init_out` の先頭部分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_write: u32,
}

impl InitOut {
    pub fn encode(&self, out: &mut Vec<u8>) {
        for value in [self.major, self.minor, self.max_readahead, self.flags] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        // max_background, congestion_threshold
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.max_write.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, INIT_OUT_MIN_SIZE)?;
        Ok(Self {
            major: read_le_u32(data, 0)?,
            minor: read_le_u32(data, 4)?,
            max_readahead: read_le_u32(data, 8)?,
            flags: read_le_u32(data, 12)?,
            max_write: read_le_u32(data, 20)?,
        })
    }
}

/// `fuse_open_in`
pub fn encode_open_in(flags: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
}

/// `fuse_open_out` → ファイルハンドル
pub fn decode_open_out(data: &[u8]) -> FsResult<u64> {
    ensure_slice(data, 0, OPEN_OUT_SIZE)?;
    read_le_u64(data, 0)
}

pub fn encode_open_out(fh: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&fh.to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
}

/// `fuse_read_in` (READ / READDIR 共通)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
}

impl ReadIn {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.fh.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        // read_flags, lock_owner, flags, padding
        out.extend_from_slice(&[0u8; 20]);
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        ensure_slice(data, 0, 40)?;
        Ok(Self {
            fh: read_le_u64(data, 0)?,
            offset: read_le_u64(data, 8)?,
            size: read_le_u32(data, 16)?,
        })
    }
}

/// `fuse_release_in`
pub fn encode_release_in(fh: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&fh.to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
}

/// `fuse_getattr_in` (fh 未指定)
pub fn encode_getattr_in(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0u8; 16]);
}

/// LOOKUP の名前 (NUL終端)
pub fn encode_name(name: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(name.as_bytes());
    out.push(0);
}

// ============================================================================
// Directory Entries
// ============================================================================

/// `fuse_dirent`。`kind` はモードの種別ビット (`mode >> 12`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseDirent {
    pub ino: u64,
    /// 次のエントリを読むためのオフセット
    pub off: u64,
    pub kind: u32,
    pub name: String,
}

impl FuseDirent {
    /// 8バイト境界までパディングした長さ
    pub fn record_len(name_len: usize) -> usize {
        (DIRENT_HEADER_SIZE + name_len + 7) & !7
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.off.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.resize(start + Self::record_len(self.name.len()), 0);
    }
}

/// READDIR の応答を分解する
pub fn decode_dirents(data: &[u8]) -> FsResult<Vec<FuseDirent>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let ino = read_le_u64(data, offset)?;
        let off = read_le_u64(data, offset + 8)?;
        let name_len = read_le_u32(data, offset + 16)? as usize;
        let kind = read_le_u32(data, offset + 20)?;
        let name = ensure_slice(data, offset + DIRENT_HEADER_SIZE, name_len)?;
        let name = core::str::from_utf8(name).map_err(|_| FsError::InvalidArgument)?;
        entries.push(FuseDirent {
            ino,
            off,
            kind,
            name: String::from(name),
        });
        offset += FuseDirent::record_len(name_len);
    }
    Ok(entries)
}
