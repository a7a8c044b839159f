// ============================================================================
// src/fs/devpts.rs - Pseudo-Terminal Filesystem
// ============================================================================
//!
//! # devpts
//!
//! スレーブPTYを `/dev/pts/<n>` として見せる合成ファイルシステム。
//! ディスクI/Oは行わず、inodeはPTYレジストリから要求時に組み立てる。
//!
//! - inode 1: ルートディレクトリ (0o040555)
//! - inode n (n >= 2): PTY番号 `n - 2` のキャラクタデバイス (major 201)

use alloc::string::ToString;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::error::{FsError, FsResult};
use crate::fs::config::{PTY_SLAVE_MAJOR, SYNTHETIC_ROOT_INDEX};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{
    DeviceNumber, DirectoryEntryView, FileAttr, FileMode, FileSystem, FileSystemBase,
    FileSystemHandle, Inode, InodeHandle, synthetic_backing_index, synthetic_inode_index,
};
use crate::sync::IterationDecision;
use crate::time::{self, TimeSpec};

const ROOT_MODE: u16 = FileMode::S_IFDIR | 0o555;
const SLAVE_MODE: u16 = FileMode::S_IFCHR | 0o620;

// ============================================================================
// PTY Registry
// ============================================================================

/// スレーブPTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlavePty {
    pub index: u32,
    pub uid: u32,
    pub gid: u32,
    pub created: TimeSpec,
}

/// 生きているスレーブPTYの一覧
pub struct PtyRegistry {
    ptys: Mutex<HashMap<u32, SlavePty>>,
}

impl PtyRegistry {
    fn new() -> Self {
        Self {
            ptys: Mutex::new(HashMap::new()),
        }
    }

    /// 空いている最小の番号でPTYを登録する
    pub fn allocate(&self, uid: u32, gid: u32) -> u32 {
        let mut ptys = self.ptys.lock();
        let index = (0..).find(|i| !ptys.contains_key(i)).unwrap_or(0);
        ptys.insert(index, SlavePty {
            index,
            uid,
            gid,
            created: time::now(),
        });
        log::debug!("devpts: pty {} allocated", index);
        index
    }

    pub fn release(&self, index: u32) -> Option<SlavePty> {
        self.ptys.lock().remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<SlavePty> {
        self.ptys.lock().get(&index).copied()
    }

    /// 番号順のスナップショット
    pub fn list(&self) -> Vec<SlavePty> {
        let mut list: Vec<_> = self.ptys.lock().values().copied().collect();
        list.sort_by_key(|pty| pty.index);
        list
    }
}

lazy_static! {
    static ref PTY_REGISTRY: PtyRegistry = PtyRegistry::new();
}

pub fn pty_registry() -> &'static PtyRegistry {
    &PTY_REGISTRY
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct DevPtsFS {
    base: FileSystemBase,
    self_ref: Weak<DevPtsFS>,
    root: Once<Arc<DevPtsInode>>,
}

impl DevPtsFS {
    pub const CLASS_NAME: &'static str = "DevPtsFS";

    pub fn try_create() -> FsResult<FileSystemHandle> {
        let fs = Arc::new_cyclic(|self_ref| DevPtsFS {
            base: FileSystemBase::new(Self::CLASS_NAME),
            self_ref: self_ref.clone(),
            root: Once::new(),
        });
        fs.base.begin_initialize();
        Ok(FileSystemHandle::DevPts(fs))
    }

    fn slave_inode(&self, pty: &SlavePty) -> Arc<DevPtsInode> {
        let id = InodeIdentifier::new(self.fsid(), synthetic_inode_index(pty.index as u64));
        let mut metadata = FileAttr::new(id, FileMode(SLAVE_MODE));
        metadata.uid = pty.uid;
        metadata.gid = pty.gid;
        metadata.mtime = pty.created;
        metadata.ctime = pty.created;
        metadata.atime = pty.created;
        metadata.device = Some(DeviceNumber::new(PTY_SLAVE_MAJOR, pty.index));
        Arc::new(DevPtsInode {
            fs: self.self_ref.clone(),
            metadata,
        })
    }
}

impl FileSystem for DevPtsFS {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn base(&self) -> &FileSystemBase {
        &self.base
    }

    fn initialize(&self) -> FsResult<()> {
        self.base.assert_initializing();
        let now = time::now();
        let id = InodeIdentifier::new(self.fsid(), SYNTHETIC_ROOT_INDEX);
        let mut metadata = FileAttr::new(id, FileMode(ROOT_MODE));
        metadata.nlink = 2;
        metadata.atime = now;
        metadata.mtime = now;
        metadata.ctime = now;
        self.root.call_once(|| {
            Arc::new(DevPtsInode {
                fs: self.self_ref.clone(),
                metadata,
            })
        });
        self.base.finish_initialize();
        Ok(())
    }

    fn root_inode(&self) -> InodeHandle {
        self.root
            .get()
            .cloned()
            .expect("devpts: root inode requested before initialize")
    }

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        self.base.check_identifier(id)?;
        if id.index() == SYNTHETIC_ROOT_INDEX {
            return Ok(self.root_inode());
        }
        let pty_index =
            u32::try_from(synthetic_backing_index(id.index())).map_err(|_| FsError::NoSuchEntity)?;
        let pty = pty_registry().get(pty_index).ok_or(FsError::NoSuchEntity)?;
        Ok(self.slave_inode(&pty))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Inode
// ============================================================================

pub struct DevPtsInode {
    fs: Weak<DevPtsFS>,
    metadata: FileAttr,
}

impl DevPtsInode {
    fn is_root(&self) -> bool {
        self.metadata.inode.index() == SYNTHETIC_ROOT_INDEX
    }

    fn fs(&self) -> FsResult<Arc<DevPtsFS>> {
        self.fs.upgrade().ok_or(FsError::NoSuchEntity)
    }
}

/// 10進表記として正規な名前だけを番号とみなす
fn parse_pty_name(name: &str) -> Option<u32> {
    let index: u32 = name.parse().ok()?;
    (index.to_string() == name).then_some(index)
}

impl Inode for DevPtsInode {
    fn identifier(&self) -> InodeIdentifier {
        self.metadata.inode
    }

    fn metadata(&self) -> FsResult<FileAttr> {
        Ok(self.metadata.clone())
    }

    fn lookup(&self, name: &str) -> FsResult<InodeHandle> {
        if !self.is_root() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.fs()?;
        if name == "." || name == ".." {
            return Ok(fs.root_inode());
        }
        let index = parse_pty_name(name).ok_or(FsError::NoSuchEntity)?;
        let pty = pty_registry().get(index).ok_or(FsError::NoSuchEntity)?;
        Ok(fs.slave_inode(&pty))
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        if !self.is_root() {
            return Err(FsError::NotDirectory);
        }
        let dir_type = (ROOT_MODE >> 12) as u8;
        let root_id = self.identifier();
        for name in [".", ".."] {
            if callback(&DirectoryEntryView::new(name, root_id, dir_type)) == IterationDecision::Break {
                return Ok(());
            }
        }
        for pty in pty_registry().list() {
            let entry = DirectoryEntryView::new(
                pty.index.to_string(),
                InodeIdentifier::new(root_id.fsid(), synthetic_inode_index(pty.index as u64)),
                (SLAVE_MODE >> 12) as u8,
            );
            if callback(&entry) == IterationDecision::Break {
                break;
            }
        }
        Ok(())
    }

    fn read_bytes(&self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        if self.is_root() {
            return Err(FsError::IsDirectory);
        }
        // 端末データはttyドライバが扱う
        Err(FsError::NotSupported)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
