// ============================================================================
// src/fs/fuse/mod.rs - FUSE Bridge Filesystem
// ============================================================================
//!
//! # fuse
//!
//! inode操作をユーザー空間のFUSEサーバーへ転送するブリッジファイルシステム。
//!
//! ## マウントフラグ
//! - `fd`: FUSEデバイスを開いたファイル記述子 (必須)。pid と デバイスinodeを記録する
//! - `rootmode`: ルートのモード (8進文字列または整数)。種別ビットはディレクトリであること
//! - `uid` / `gid`: ルートの所有者
//!
//! ルート (nodeid 1) のメタデータはフラグから作る。それ以外の inode n は
//! nodeid n の `GETATTR` 結果。

pub mod connection;
pub mod protocol;

pub use connection::{FuseChannel, FuseConnection};

use alloc::sync::{Arc, Weak};
use core::any::Any;
use spin::Once;

use crate::error::{FsError, FsResult};
use crate::fs::bytes::{read_le_u64, write_le_u64};
use crate::fs::config::{FUSE_MAX_READ, SYNTHETIC_ROOT_INDEX};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::mount::{FileDescription, MountSpecificFlags};
use crate::fs::vfs::{
    DirectoryEntryView, FileAttr, FileMode, FileSystem, FileSystemBase, FileSystemHandle, Inode,
    InodeHandle,
};
use crate::sync::IterationDecision;
use crate::time;
use protocol::FUSE_ROOT_ID;

// ============================================================================
// Mount Flags
// ============================================================================

/// マウント時フラグブロック (LE u64 × 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuseMountFlags {
    pub pid: u64,
    pub device_inode: u64,
    pub rootmode: u64,
    pub gid: u64,
    pub uid: u64,
}

impl FuseMountFlags {
    pub const SIZE: usize = 40;

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        Ok(Self {
            pid: read_le_u64(bytes, 0)?,
            device_inode: read_le_u64(bytes, 8)?,
            rootmode: read_le_u64(bytes, 16)?,
            gid: read_le_u64(bytes, 24)?,
            uid: read_le_u64(bytes, 32)?,
        })
    }

    pub fn encode(&self, bytes: &mut [u8]) -> FsResult<()> {
        write_le_u64(bytes, 0, self.pid)?;
        write_le_u64(bytes, 8, self.device_inode)?;
        write_le_u64(bytes, 16, self.rootmode)?;
        write_le_u64(bytes, 24, self.gid)?;
        write_le_u64(bytes, 32, self.uid)
    }

    fn update(
        flags: &mut MountSpecificFlags,
        f: impl FnOnce(&mut FuseMountFlags) -> FsResult<()>,
    ) -> FsResult<()> {
        let mut decoded = Self::decode(flags.bytes())?;
        f(&mut decoded)?;
        decoded.encode(flags.bytes_mut())
    }
}

fn checked_rootmode(mode: u64) -> FsResult<u64> {
    if mode > u16::MAX as u64 {
        return Err(FsError::InvalidArgument);
    }
    Ok(mode)
}

fn attach_fd(flags: &mut MountSpecificFlags, fd: i64) -> FsResult<()> {
    let fd = i32::try_from(fd)
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or(FsError::InvalidArgument)?;
    let table = flags.descriptions().cloned().ok_or(FsError::InvalidArgument)?;
    let description = table.description(fd).ok_or(FsError::InvalidArgument)?;
    let device_inode = description
        .inode_identifier()
        .map(|id| id.index())
        .unwrap_or(0);
    FuseMountFlags::update(flags, |f| {
        f.pid = table.pid();
        f.device_inode = device_inode;
        Ok(())
    })?;
    flags.attach_description(description);
    Ok(())
}

pub fn handle_signed_flag(flags: &mut MountSpecificFlags, key: &str, value: i64) -> FsResult<()> {
    match key {
        "fd" => attach_fd(flags, value),
        _ => Err(FsError::InvalidArgument),
    }
}

pub fn handle_unsigned_flag(flags: &mut MountSpecificFlags, key: &str, value: u64) -> FsResult<()> {
    match key {
        "fd" => attach_fd(flags, i64::try_from(value).map_err(|_| FsError::InvalidArgument)?),
        "rootmode" => {
            let mode = checked_rootmode(value)?;
            FuseMountFlags::update(flags, |f| {
                f.rootmode = mode;
                Ok(())
            })
        }
        "uid" | "gid" => {
            if value > u32::MAX as u64 {
                return Err(FsError::InvalidArgument);
            }
            FuseMountFlags::update(flags, |f| {
                if key == "uid" {
                    f.uid = value;
                } else {
                    f.gid = value;
                }
                Ok(())
            })
        }
        _ => Err(FsError::InvalidArgument),
    }
}

pub fn handle_ascii_flag(flags: &mut MountSpecificFlags, key: &str, value: &str) -> FsResult<()> {
    match key {
        "rootmode" => {
            let mode = u64::from_str_radix(value, 8).map_err(|_| FsError::InvalidArgument)?;
            handle_unsigned_flag(flags, key, mode)
        }
        _ => Err(FsError::InvalidArgument),
    }
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct FuseFS {
    base: FileSystemBase,
    self_ref: Weak<FuseFS>,
    root: Once<Arc<FuseInode>>,
    connection: FuseConnection,
    mount_flags: FuseMountFlags,
    description: Arc<dyn FileDescription>,
}

impl FuseFS {
    pub const CLASS_NAME: &'static str = "FUSE";

    /// `fd` でFUSEデバイスが渡され、`rootmode` がディレクトリであること
    pub fn try_create(flags: &MountSpecificFlags) -> FsResult<FileSystemHandle> {
        let mount_flags = FuseMountFlags::decode(flags.bytes())?;
        let description = flags.description().cloned().ok_or(FsError::InvalidArgument)?;
        let rootmode = checked_rootmode(mount_flags.rootmode)?;
        if !FileMode(rootmode as u16).is_dir() {
            return Err(FsError::InvalidArgument);
        }
        let channel = description.fuse_channel().ok_or(FsError::InvalidArgument)?;
        let uid = u32::try_from(mount_flags.uid).map_err(|_| FsError::InvalidArgument)?;
        let gid = u32::try_from(mount_flags.gid).map_err(|_| FsError::InvalidArgument)?;
        let pid = u32::try_from(mount_flags.pid).map_err(|_| FsError::InvalidArgument)?;

        let fs = Arc::new_cyclic(|self_ref| FuseFS {
            base: FileSystemBase::new(Self::CLASS_NAME),
            self_ref: self_ref.clone(),
            root: Once::new(),
            connection: FuseConnection::new(channel, uid, gid, pid),
            mount_flags,
            description,
        });
        fs.base.begin_initialize();
        Ok(FileSystemHandle::Fuse(fs))
    }

    pub fn mount_flags(&self) -> FuseMountFlags {
        self.mount_flags
    }

    pub fn connection(&self) -> &FuseConnection {
        &self.connection
    }

    pub fn description(&self) -> &Arc<dyn FileDescription> {
        &self.description
    }

    fn make_inode(&self, nodeid: u64, metadata: FileAttr) -> Arc<FuseInode> {
        Arc::new(FuseInode {
            fs: self.self_ref.clone(),
            nodeid,
            metadata,
        })
    }
}

impl FileSystem for FuseFS {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base(&self) -> &FileSystemBase {
        &self.base
    }

    fn initialize(&self) -> FsResult<()> {
        self.base.assert_initializing();
        self.connection.init()?;

        let now = time::now();
        let id = InodeIdentifier::new(self.fsid(), SYNTHETIC_ROOT_INDEX);
        let mut metadata = FileAttr::new(id, FileMode(self.mount_flags.rootmode as u16));
        metadata.uid = self.mount_flags.uid as u32;
        metadata.gid = self.mount_flags.gid as u32;
        metadata.nlink = 2;
        metadata.atime = now;
        metadata.mtime = now;
        metadata.ctime = now;
        self.root.call_once(|| self.make_inode(FUSE_ROOT_ID, metadata));
        self.base.finish_initialize();
        Ok(())
    }

    fn root_inode(&self) -> InodeHandle {
        self.root
            .get()
            .cloned()
            .expect("fuse: root inode requested before initialize")
    }

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        self.base.check_identifier(id)?;
        if id.index() == SYNTHETIC_ROOT_INDEX {
            return Ok(self.root_inode());
        }
        let attr = self.connection.getattr(id.index())?;
        Ok(self.make_inode(id.index(), attr.to_file_attr(id)))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Inode
// ============================================================================

pub struct FuseInode {
    fs: Weak<FuseFS>,
    nodeid: u64,
    metadata: FileAttr,
}

impl FuseInode {
    pub fn nodeid(&self) -> u64 {
        self.nodeid
    }

    fn filesystem(&self) -> FsResult<Arc<FuseFS>> {
        self.fs.upgrade().ok_or(FsError::NoSuchEntity)
    }

    fn read_directory(
        &self,
        fs: &FuseFS,
        fh: u64,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        let mut offset = 0;
        loop {
            let data = fs
                .connection
                .read(self.nodeid, fh, offset, FUSE_MAX_READ, true)?;
            if data.is_empty() {
                return Ok(());
            }
            let entries = protocol::decode_dirents(&data)?;
            let start = offset;
            for entry in entries {
                offset = entry.off;
                let view = DirectoryEntryView::new(
                    entry.name,
                    InodeIdentifier::new(fs.fsid(), entry.ino),
                    entry.kind as u8,
                );
                if callback(&view) == IterationDecision::Break {
                    return Ok(());
                }
            }
            // オフセットが進まないサーバーで無限ループしない
            if offset == start {
                log::warn!("fuse {}: READDIR on node {} did not advance", fs.fsid(), self.nodeid);
                return Err(FsError::IoError);
            }
        }
    }

    fn read_file(&self, fs: &FuseFS, fh: u64, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let size = (buf.len() - total).min(FUSE_MAX_READ as usize);
            let data = fs
                .connection
                .read(self.nodeid, fh, offset + total as u64, size as u32, false)?;
            buf[total..total + data.len()].copy_from_slice(&data);
            total += data.len();
            if data.len() < size {
                break;
            }
        }
        Ok(total)
    }
}

impl Inode for FuseInode {
    fn identifier(&self) -> InodeIdentifier {
        self.metadata.inode
    }

    fn metadata(&self) -> FsResult<FileAttr> {
        Ok(self.metadata.clone())
    }

    fn lookup(&self, name: &str) -> FsResult<InodeHandle> {
        if !self.metadata.mode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.filesystem()?;
        let entry = fs.connection.lookup(self.nodeid, name)?;
        if entry.nodeid == FUSE_ROOT_ID {
            return Ok(fs.root_inode());
        }
        let id = InodeIdentifier::new(fs.fsid(), entry.nodeid);
        Ok(fs.make_inode(entry.nodeid, entry.attr.to_file_attr(id)))
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        if !self.metadata.mode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.filesystem()?;
        let fh = fs.connection.open(self.nodeid, true)?;
        let result = self.read_directory(&fs, fh, callback);
        let released = fs.connection.release(self.nodeid, fh, true);
        result.and(released)
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if self.metadata.mode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.filesystem()?;
        let fh = fs.connection.open(self.nodeid, false)?;
        let result = self.read_file(&fs, fh, offset, buf);
        let released = fs.connection.release(self.nodeid, fh, false);
        let read = result?;
        released?;
        Ok(read)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{
        EntryOut, FuseAttr, FuseDirent, FuseOpcode, IN_HEADER_SIZE, InHeader, InitOut, OutHeader,
        ReadIn,
    };
    use super::*;
    use crate::fs::mount::FileDescriptionTable;
    use crate::fs::vfs::{DT_DIR, DT_REG, directory_entries};
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    const HELLO: &[u8] = b"Hello, FUSE!";

    /// 固定のツリーを返すFUSEサーバー
    ///
    /// 1: `/` (hello.txt, sub), 2: `/hello.txt`, 3: `/sub`
    struct FakeServer {
        opcodes: Mutex<Vec<FuseOpcode>>,
    }

    impl FakeServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opcodes: Mutex::new(Vec::new()),
            })
        }

        fn attr(nodeid: u64) -> Option<FuseAttr> {
            let (mode, size) = match nodeid {
                1 | 3 => (0o040755, 0),
                2 => (0o100644, HELLO.len() as u64),
                _ => return None,
            };
            Some(FuseAttr {
                ino: nodeid,
                size,
                mode,
                nlink: 1,
                uid: 1000,
                gid: 1000,
                ..FuseAttr::default()
            })
        }

        fn children(nodeid: u64) -> Vec<(&'static str, u64)> {
            match nodeid {
                1 => vec![(".", 1), ("..", 1), ("hello.txt", 2), ("sub", 3)],
                3 => vec![(".", 3), ("..", 1)],
                _ => Vec::new(),
            }
        }

        fn reply(unique: u64, result: Result<Vec<u8>, i32>) -> Vec<u8> {
            let (error, body) = match result {
                Ok(body) => (0, body),
                Err(errno) => (-errno, Vec::new()),
            };
            let mut out = Vec::new();
            OutHeader {
                len: (16 + body.len()) as u32,
                error,
                unique,
            }
            .encode(&mut out);
            out.extend_from_slice(&body);
            out
        }
    }

    impl FuseChannel for FakeServer {
        fn exchange(&self, request: &[u8]) -> FsResult<Vec<u8>> {
            let header = InHeader::decode(request)?;
            let body = &request[IN_HEADER_SIZE..];
            self.opcodes.lock().push(header.opcode);
            let mut out = Vec::new();
            let result = match header.opcode {
                FuseOpcode::Init => {
                    InitOut {
                        major: 7,
                        minor: 31,
                        max_readahead: 0,
                        flags: 0,
                        max_write: 4096,
                    }
                    .encode(&mut out);
                    Ok(out)
                }
                FuseOpcode::Lookup => {
                    let name = core::str::from_utf8(&body[..body.len() - 1]).unwrap();
                    match Self::children(header.nodeid).iter().find(|(n, _)| *n == name) {
                        Some((_, nodeid)) => {
                            EntryOut {
                                nodeid: *nodeid,
                                generation: 0,
                                attr: Self::attr(*nodeid).unwrap(),
                            }
                            .encode(&mut out);
                            Ok(out)
                        }
                        None => Err(2),
                    }
                }
                FuseOpcode::Getattr => match Self::attr(header.nodeid) {
                    Some(attr) => {
                        protocol::encode_attr_out(&attr, &mut out);
                        Ok(out)
                    }
                    None => Err(2),
                },
                FuseOpcode::Open | FuseOpcode::Opendir => {
                    protocol::encode_open_out(7, &mut out);
                    Ok(out)
                }
                FuseOpcode::Readdir => {
                    let read = ReadIn::decode(body)?;
                    for (i, (name, ino)) in Self::children(header.nodeid)
                        .into_iter()
                        .enumerate()
                        .skip(read.offset as usize)
                    {
                        FuseDirent {
                            ino,
                            off: i as u64 + 1,
                            kind: if ino == 2 { 0o10 } else { 0o4 },
                            name: String::from(name),
                        }
                        .encode(&mut out);
                    }
                    Ok(out)
                }
                FuseOpcode::Read => {
                    let read = ReadIn::decode(body)?;
                    let start = (read.offset as usize).min(HELLO.len());
                    let end = (start + read.size as usize).min(HELLO.len());
                    Ok(HELLO[start..end].to_vec())
                }
                FuseOpcode::Release | FuseOpcode::Releasedir => Ok(out),
            };
            Ok(Self::reply(header.unique, result))
        }
    }

    struct DeviceDescription {
        server: Arc<FakeServer>,
    }

    impl FileDescription for DeviceDescription {
        fn inode_identifier(&self) -> Option<InodeIdentifier> {
            Some(InodeIdentifier::new(1, 229))
        }

        fn fuse_channel(&self) -> Option<Arc<dyn FuseChannel>> {
            Some(self.server.clone())
        }
    }

    struct Table {
        fd3: Arc<dyn FileDescription>,
    }

    impl FileDescriptionTable for Table {
        fn pid(&self) -> u64 {
            42
        }

        fn description(&self, fd: i32) -> Option<Arc<dyn FileDescription>> {
            (fd == 3).then(|| self.fd3.clone())
        }
    }

    fn flags_for(server: &Arc<FakeServer>) -> MountSpecificFlags {
        let table: Arc<dyn FileDescriptionTable> = Arc::new(Table {
            fd3: Arc::new(DeviceDescription {
                server: server.clone(),
            }),
        });
        MountSpecificFlags::new(FuseMountFlags::SIZE, Some(table))
    }

    fn mounted(server: &Arc<FakeServer>) -> FileSystemHandle {
        let mut flags = flags_for(server);
        handle_signed_flag(&mut flags, "fd", 3).unwrap();
        handle_ascii_flag(&mut flags, "rootmode", "40755").unwrap();
        handle_unsigned_flag(&mut flags, "uid", 1000).unwrap();
        handle_unsigned_flag(&mut flags, "gid", 100).unwrap();
        let handle = FuseFS::try_create(&flags).unwrap();
        handle.initialize().unwrap();
        handle
    }

    #[test]
    fn test_flag_setters_fill_packed_block() {
        let server = FakeServer::new();
        let mut flags = flags_for(&server);
        handle_signed_flag(&mut flags, "fd", 3).unwrap();
        handle_ascii_flag(&mut flags, "rootmode", "40700").unwrap();
        handle_unsigned_flag(&mut flags, "gid", 5).unwrap();

        let decoded = FuseMountFlags::decode(flags.bytes()).unwrap();
        assert_eq!(decoded.pid, 42);
        assert_eq!(decoded.device_inode, 229);
        assert_eq!(decoded.rootmode, 0o40700);
        assert_eq!(decoded.gid, 5);
        assert_eq!(&flags.bytes()[16..24], &0o40700u64.to_le_bytes());
        assert!(flags.description().is_some());
    }

    #[test]
    fn test_malformed_flags_are_rejected() {
        let server = FakeServer::new();
        let mut flags = flags_for(&server);
        assert_eq!(handle_signed_flag(&mut flags, "fd", -1), Err(FsError::InvalidArgument));
        assert_eq!(handle_signed_flag(&mut flags, "fd", 9), Err(FsError::InvalidArgument));
        assert_eq!(
            handle_ascii_flag(&mut flags, "rootmode", "40789"),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            handle_unsigned_flag(&mut flags, "uid", u64::MAX),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(handle_unsigned_flag(&mut flags, "bogus", 1), Err(FsError::InvalidArgument));
    }

    #[test]
    fn test_try_create_requires_fd_and_directory_rootmode() {
        let server = FakeServer::new();
        let mut flags = flags_for(&server);
        handle_ascii_flag(&mut flags, "rootmode", "40755").unwrap();
        assert!(matches!(FuseFS::try_create(&flags), Err(FsError::InvalidArgument)));

        handle_signed_flag(&mut flags, "fd", 3).unwrap();
        handle_ascii_flag(&mut flags, "rootmode", "100644").unwrap();
        assert!(matches!(FuseFS::try_create(&flags), Err(FsError::InvalidArgument)));

        handle_ascii_flag(&mut flags, "rootmode", "40755").unwrap();
        assert!(FuseFS::try_create(&flags).is_ok());
    }

    #[test]
    fn test_root_metadata_comes_from_flags() {
        let server = FakeServer::new();
        let handle = mounted(&server);
        let meta = handle.root_inode().metadata().unwrap();
        assert_eq!(meta.mode, FileMode(0o40755));
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 100);
        assert_eq!(meta.inode.index(), 1);
        assert_eq!(server.opcodes.lock().as_slice(), &[FuseOpcode::Init]);
    }

    #[test]
    fn test_get_inode_forwards_getattr() {
        let server = FakeServer::new();
        let handle = mounted(&server);
        let inode = handle.get_inode(InodeIdentifier::new(handle.fsid(), 2)).unwrap();
        assert_eq!(inode.metadata().unwrap().size, HELLO.len() as u64);
        assert_eq!(
            handle.get_inode(InodeIdentifier::new(handle.fsid(), 9)).err(),
            Some(FsError::NoSuchEntity)
        );
    }

    #[test]
    fn test_lookup_and_read() {
        let server = FakeServer::new();
        let handle = mounted(&server);
        let file = handle.root_inode().lookup("hello.txt").unwrap();
        let mut buf = [0u8; 64];
        let n = file.read_bytes(7, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"FUSE!");
        assert_eq!(file.read_bytes(0, &mut buf).unwrap(), HELLO.len());
        assert_eq!(handle.root_inode().lookup("missing").err(), Some(FsError::NoSuchEntity));
        assert!(server.opcodes.lock().contains(&FuseOpcode::Release));
    }

    #[test]
    fn test_directory_traversal_releases_handle() {
        let server = FakeServer::new();
        let handle = mounted(&server);
        let entries = directory_entries(handle.root_inode().as_ref()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "hello.txt", "sub"]);
        assert_eq!(handle.internal_file_type_to_directory_entry_type(&entries[2]), DT_REG);
        assert_eq!(handle.internal_file_type_to_directory_entry_type(&entries[3]), DT_DIR);
        assert_eq!(server.opcodes.lock().last(), Some(&FuseOpcode::Releasedir));
    }

    #[test]
    fn test_rename_is_read_only() {
        let server = FakeServer::new();
        let handle = mounted(&server);
        let root = handle.root_inode();
        assert_eq!(handle.rename(&root, "hello.txt", &root, "x"), Err(FsError::ReadOnly));
    }
}
