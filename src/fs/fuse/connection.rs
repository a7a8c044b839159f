// ============================================================================
// src/fs/fuse/connection.rs - FUSE Request/Reply Transport
// ============================================================================
//!
//! ユーザー空間のFUSEサーバーとの1往復単位のやり取り
//!
//! 要求ごとに一意な `unique` を振り、応答ヘッダの `unique` と長さを検証する。
//! サーバーが返した負のerrnoは `FsError` へ変換する。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{FsError, FsResult};
use crate::fs::config::{FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION, FUSE_MAX_READ};
use crate::fs::fuse::protocol::{
    self, EntryOut, FuseAttr, FuseOpcode, IN_HEADER_SIZE, InHeader, InitIn, InitOut,
    OUT_HEADER_SIZE, OutHeader, ReadIn,
};

/// FUSEデバイスの向こう側にいるサーバーとの通信路
///
/// 1回の呼び出しで要求を1つ送り、対応する応答を1つ受け取る。
pub trait FuseChannel: Send + Sync {
    fn exchange(&self, request: &[u8]) -> FsResult<Vec<u8>>;
}

pub struct FuseConnection {
    channel: Arc<dyn FuseChannel>,
    next_unique: AtomicU64,
    uid: u32,
    gid: u32,
    pid: u32,
    max_write: AtomicU32,
}

impl FuseConnection {
    pub fn new(channel: Arc<dyn FuseChannel>, uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            channel,
            next_unique: AtomicU64::new(1),
            uid,
            gid,
            pid,
            max_write: AtomicU32::new(0),
        }
    }

    /// INIT 交渉で得た max_write (交渉前は 0)
    pub fn max_write(&self) -> u32 {
        self.max_write.load(Ordering::Relaxed)
    }

    /// 要求を送り、エラーでなければ応答本体を返す
    pub fn request(&self, opcode: FuseOpcode, nodeid: u64, body: &[u8]) -> FsResult<Vec<u8>> {
        let unique = self.next_unique.fetch_add(1, Ordering::Relaxed);
        let len = u32::try_from(IN_HEADER_SIZE + body.len()).map_err(|_| FsError::InvalidArgument)?;
        let mut message = Vec::new();
        message
            .try_reserve(len as usize)
            .map_err(|_| FsError::OutOfMemory)?;
        InHeader {
            len,
            opcode,
            unique,
            nodeid,
            uid: self.uid,
            gid: self.gid,
            pid: self.pid,
        }
        .encode(&mut message);
        message.extend_from_slice(body);

        #[cfg(feature = "verbose_logging")]
        log::trace!("fuse: -> {:?} unique={} nodeid={}", opcode, unique, nodeid);

        let mut reply = self.channel.exchange(&message)?;
        let header = OutHeader::decode(&reply).map_err(|_| FsError::IoError)?;
        if header.unique != unique || header.len as usize != reply.len() {
            log::warn!(
                "fuse: malformed reply to {:?} (unique {} vs {}, len {} vs {})",
                opcode,
                header.unique,
                unique,
                header.len,
                reply.len()
            );
            return Err(FsError::IoError);
        }
        if header.error != 0 {
            let error = FsError::from_errno(header.error);
            log::debug!("fuse: {:?} on node {} failed: {}", opcode, nodeid, error);
            return Err(error);
        }
        Ok(reply.split_off(OUT_HEADER_SIZE))
    }

    /// INIT 交渉。メジャーバージョンが合わなければ `NotSupported`
    pub fn init(&self) -> FsResult<InitOut> {
        let mut body = Vec::new();
        InitIn {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: FUSE_MAX_READ,
            flags: 0,
        }
        .encode(&mut body);
        let reply = InitOut::decode(&self.request(FuseOpcode::Init, 0, &body)?)?;
        if reply.major != FUSE_KERNEL_VERSION {
            log::error!("fuse: server speaks protocol {}.{}", reply.major, reply.minor);
            return Err(FsError::NotSupported);
        }
        self.max_write.store(reply.max_write, Ordering::Relaxed);
        log::info!(
            "fuse: negotiated protocol {}.{} (max_write {})",
            reply.major,
            reply.minor,
            reply.max_write
        );
        Ok(reply)
    }

    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<EntryOut> {
        let mut body = Vec::new();
        protocol::encode_name(name, &mut body);
        let entry = EntryOut::decode(&self.request(FuseOpcode::Lookup, parent, &body)?)?;
        // nodeid 0 は否定キャッシュ用の応答
        if entry.nodeid == 0 {
            return Err(FsError::NoSuchEntity);
        }
        Ok(entry)
    }

    pub fn getattr(&self, nodeid: u64) -> FsResult<FuseAttr> {
        let mut body = Vec::new();
        protocol::encode_getattr_in(&mut body);
        protocol::decode_attr_out(&self.request(FuseOpcode::Getattr, nodeid, &body)?)
    }

    /// OPEN / OPENDIR。ファイルハンドルを返す
    pub fn open(&self, nodeid: u64, directory: bool) -> FsResult<u64> {
        let opcode = if directory {
            FuseOpcode::Opendir
        } else {
            FuseOpcode::Open
        };
        let mut body = Vec::new();
        // O_RDONLY
        protocol::encode_open_in(0, &mut body);
        protocol::decode_open_out(&self.request(opcode, nodeid, &body)?)
    }

    /// READ / READDIR
    pub fn read(&self, nodeid: u64, fh: u64, offset: u64, size: u32, directory: bool) -> FsResult<Vec<u8>> {
        let opcode = if directory {
            FuseOpcode::Readdir
        } else {
            FuseOpcode::Read
        };
        let mut body = Vec::new();
        ReadIn { fh, offset, size }.encode(&mut body);
        let data = self.request(opcode, nodeid, &body)?;
        if data.len() > size as usize {
            return Err(FsError::IoError);
        }
        Ok(data)
    }

    /// RELEASE / RELEASEDIR
    pub fn release(&self, nodeid: u64, fh: u64, directory: bool) -> FsResult<()> {
        let opcode = if directory {
            FuseOpcode::Releasedir
        } else {
            FuseOpcode::Release
        };
        let mut body = Vec::new();
        protocol::encode_release_in(fh, &mut body);
        self.request(opcode, nodeid, &body).map(|_| ())
    }
}
