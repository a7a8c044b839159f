// ============================================================================
// src/fs/coredump.rs - Coredump Filesystem
// ============================================================================
//!
//! # coredump
//!
//! クラッシュしたプロセスのコアダンプを読み取り専用ファイルとして公開する
//! 合成ファイルシステム。
//!
//! - インスタンスは `initialize` でプロセス全体のインスタンスリストに登録され、
//!   `prepare_to_unmount` で登録解除される
//! - `publish` は `Ready` 状態の最初のインスタンスへダンプを追加する
//! - inode n (n >= 2) はエントリスロット `n - 2`。スロット番号は削除後も再利用されるまで不変

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use spin::{Mutex, Once};

use crate::error::{FsError, FsResult};
use crate::fs::config::SYNTHETIC_ROOT_INDEX;
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{
    DirectoryEntryView, FileAttr, FileMode, FileSystem, FileSystemBase, FileSystemHandle, Inode,
    InodeHandle, synthetic_backing_index, synthetic_inode_index,
};
use crate::sync::{InstanceList, IterationDecision};
use crate::time::{self, TimeSpec};

const ROOT_MODE: u16 = FileMode::S_IFDIR | 0o555;
const ENTRY_MODE: u16 = FileMode::S_IFREG | 0o400;

// ============================================================================
// Instance List
// ============================================================================

static COREDUMP_INSTANCES: InstanceList<CoredumpFS> = InstanceList::new();

/// ロックを保持したまま全インスタンスを渡す
///
/// `f` の中から `publish` やマウント・アンマウントを呼ぶとデッドロックする。
pub fn with_instances<R>(f: impl FnOnce(&[Arc<CoredumpFS>]) -> R) -> R {
    COREDUMP_INSTANCES.with(f)
}

/// 登録順に走査する。`Break` で打ち切り
///
/// ロックを外して走査するので、コールバックから `publish` してよい。
pub fn for_each_instance(f: impl FnMut(&Arc<CoredumpFS>) -> IterationDecision) {
    COREDUMP_INSTANCES.for_each(f)
}

/// `Ready` 状態の最初のインスタンスへコアダンプを追加する
///
/// マウントされたインスタンスが無ければ `NoSuchEntity`。
pub fn publish(name: &str, data: Vec<u8>, uid: u32, gid: u32) -> FsResult<InodeIdentifier> {
    let target = with_instances(|instances| {
        instances
            .iter()
            .find(|fs| fs.base.is_ready())
            .cloned()
    })
    .ok_or(FsError::NoSuchEntity)?;
    target.add_entry(name, data, uid, gid)
}

// ============================================================================
// Filesystem
// ============================================================================

/// コアダンプ1件
#[derive(Clone)]
struct CoredumpEntry {
    name: String,
    data: Arc<Vec<u8>>,
    uid: u32,
    gid: u32,
    created: TimeSpec,
}

pub struct CoredumpFS {
    base: FileSystemBase,
    self_ref: Weak<CoredumpFS>,
    root: Once<Arc<CoredumpInode>>,
    /// スロット番号 = inode番号 - 2
    entries: Mutex<Vec<Option<CoredumpEntry>>>,
}

impl CoredumpFS {
    pub const CLASS_NAME: &'static str = "CoredumpFS";

    pub fn try_create() -> FsResult<FileSystemHandle> {
        let fs = Arc::new_cyclic(|self_ref| CoredumpFS {
            base: FileSystemBase::new(Self::CLASS_NAME),
            self_ref: self_ref.clone(),
            root: Once::new(),
            entries: Mutex::new(Vec::new()),
        });
        fs.base.begin_initialize();
        Ok(FileSystemHandle::Coredump(fs))
    }

    /// エントリを追加し、そのinode識別子を返す
    pub fn add_entry(&self, name: &str, data: Vec<u8>, uid: u32, gid: u32) -> FsResult<InodeIdentifier> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        let mut entries = self.entries.lock();
        if entries.iter().flatten().any(|e| e.name == name) {
            return Err(FsError::AlreadyExists);
        }
        let entry = CoredumpEntry {
            name: String::from(name),
            data: Arc::new(data),
            uid,
            gid,
            created: time::now(),
        };
        let slot = match entries.iter().position(Option::is_none) {
            Some(slot) => {
                entries[slot] = Some(entry);
                slot
            }
            None => {
                entries.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;
                entries.push(Some(entry));
                entries.len() - 1
            }
        };
        log::info!("coredump {}: published {} in slot {}", self.fsid(), name, slot);
        Ok(InodeIdentifier::new(self.fsid(), synthetic_inode_index(slot as u64)))
    }

    pub fn remove_entry(&self, name: &str) -> FsResult<()> {
        let mut entries = self.entries.lock();
        let slot = entries
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|e| e.name == name))
            .ok_or(FsError::NoSuchEntity)?;
        *slot = None;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().iter().flatten().count()
    }

    fn entry_inode(&self, slot: usize, entry: &CoredumpEntry) -> Arc<CoredumpInode> {
        let id = InodeIdentifier::new(self.fsid(), synthetic_inode_index(slot as u64));
        let mut metadata = FileAttr::new(id, FileMode(ENTRY_MODE));
        metadata.uid = entry.uid;
        metadata.gid = entry.gid;
        metadata.size = entry.data.len() as u64;
        metadata.atime = entry.created;
        metadata.mtime = entry.created;
        metadata.ctime = entry.created;
        Arc::new(CoredumpInode {
            fs: self.self_ref.clone(),
            metadata,
            data: Some(entry.data.clone()),
        })
    }
}

impl FileSystem for CoredumpFS {
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
            Arc::new(CoredumpInode {
                fs: self.self_ref.clone(),
                metadata,
                data: None,
            })
        });

        let this = self.self_ref.upgrade().ok_or(FsError::NoSuchEntity)?;
        COREDUMP_INSTANCES.register(&this);
        self.base.finish_initialize();
        Ok(())
    }

    fn root_inode(&self) -> InodeHandle {
        self.root
            .get()
            .cloned()
            .expect("coredump: root inode requested before initialize")
    }

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        self.base.check_identifier(id)?;
        if id.index() == SYNTHETIC_ROOT_INDEX {
            return Ok(self.root_inode());
        }
        let slot = usize::try_from(synthetic_backing_index(id.index()))
            .map_err(|_| FsError::NoSuchEntity)?;
        let entries = self.entries.lock();
        let entry = entries
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(FsError::NoSuchEntity)?;
        Ok(self.entry_inode(slot, entry))
    }

    fn prepare_to_unmount(&self) -> FsResult<()> {
        self.base.begin_unmount()?;
        COREDUMP_INSTANCES.unregister(self);
        log::debug!("coredump {}: deregistered", self.fsid());
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Inode
// ============================================================================

pub struct CoredumpInode {
    fs: Weak<CoredumpFS>,
    metadata: FileAttr,
    data: Option<Arc<Vec<u8>>>,
}

impl Inode for CoredumpInode {
    fn identifier(&self) -> InodeIdentifier {
        self.metadata.inode
    }

    fn metadata(&self) -> FsResult<FileAttr> {
        Ok(self.metadata.clone())
    }

    fn lookup(&self, name: &str) -> FsResult<InodeHandle> {
        if self.data.is_some() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.fs.upgrade().ok_or(FsError::NoSuchEntity)?;
        if name == "." || name == ".." {
            return Ok(fs.root_inode());
        }
        let entries = fs.entries.lock();
        let (slot, entry) = entries
            .iter()
            .enumerate()
            .find_map(|(slot, e)| e.as_ref().filter(|e| e.name == name).map(|e| (slot, e)))
            .ok_or(FsError::NoSuchEntity)?;
        Ok(fs.entry_inode(slot, entry))
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        if self.data.is_some() {
            return Err(FsError::NotDirectory);
        }
        let fs = self.fs.upgrade().ok_or(FsError::NoSuchEntity)?;
        let root_id = self.identifier();
        let dir_type = (ROOT_MODE >> 12) as u8;
        for name in [".", ".."] {
            if callback(&DirectoryEntryView::new(name, root_id, dir_type)) == IterationDecision::Break {
                return Ok(());
            }
        }

        // コールバック中にエントリが追加されてもデッドロックしないようスナップショットを取る
        let snapshot: Vec<(usize, String)> = fs
            .entries
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, e.name.clone())))
            .collect();
        for (slot, name) in snapshot {
            let entry = DirectoryEntryView::new(
                name,
                InodeIdentifier::new(root_id.fsid(), synthetic_inode_index(slot as u64)),
                (ENTRY_MODE >> 12) as u8,
            );
            if callback(&entry) == IterationDecision::Break {
                break;
            }
        }
        Ok(())
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let data = self.data.as_ref().ok_or(FsError::IsDirectory)?;
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::{DT_REG, FileSystemState, directory_entries};
    use alloc::vec;

    fn ready() -> (FileSystemHandle, Arc<CoredumpFS>) {
        let handle = CoredumpFS::try_create().unwrap();
        handle.initialize().unwrap();
        let FileSystemHandle::Coredump(fs) = handle.clone() else {
            unreachable!()
        };
        (handle, fs)
    }

    fn is_registered(fs: &Arc<CoredumpFS>) -> bool {
        with_instances(|list| list.iter().any(|i| Arc::ptr_eq(i, fs)))
    }

    #[test]
    fn test_registration_lifecycle() {
        let (handle, fs) = ready();
        assert!(is_registered(&fs));
        handle.prepare_to_unmount().unwrap();
        assert_eq!(handle.state(), FileSystemState::Unmounting);
        assert!(!is_registered(&fs));
    }

    #[test]
    fn test_not_registered_before_initialize() {
        let handle = CoredumpFS::try_create().unwrap();
        let FileSystemHandle::Coredump(fs) = handle.clone() else {
            unreachable!()
        };
        assert!(!is_registered(&fs));
    }

    #[test]
    fn test_entries_map_to_slots() {
        let (handle, fs) = ready();
        let a = fs.add_entry("init.core", vec![1, 2, 3, 4], 0, 0).unwrap();
        let b = fs.add_entry("sh.core", vec![9; 10], 100, 100).unwrap();
        assert_eq!(a.index(), 2);
        assert_eq!(b.index(), 3);
        assert_eq!(fs.add_entry("sh.core", vec![], 0, 0), Err(FsError::AlreadyExists));
        assert_eq!(fs.add_entry("a/b", vec![], 0, 0), Err(FsError::InvalidArgument));

        let inode = handle.get_inode(b).unwrap();
        let meta = inode.metadata().unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.uid, 100);
        assert_eq!(meta.mode, FileMode(0o100400));

        let mut buf = [0u8; 8];
        assert_eq!(handle.get_inode(a).unwrap().read_bytes(1, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[2, 3, 4]);
        assert_eq!(inode.read_bytes(100, &mut buf).unwrap(), 0);

        fs.remove_entry("init.core").unwrap();
        assert_eq!(handle.get_inode(a).err(), Some(FsError::NoSuchEntity));
        // 空きスロットの再利用
        assert_eq!(fs.add_entry("late.core", vec![], 0, 0).unwrap().index(), 2);
        assert_eq!(fs.entry_count(), 2);
    }

    #[test]
    fn test_directory_listing() {
        let (handle, fs) = ready();
        fs.add_entry("x.core", vec![0; 3], 0, 0).unwrap();
        let root = handle.root_inode();
        let entries = directory_entries(root.as_ref()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "x.core"]);
        assert_eq!(handle.internal_file_type_to_directory_entry_type(&entries[2]), DT_REG);
        assert_eq!(root.lookup("x.core").unwrap().identifier(), entries[2].inode);
        assert_eq!(root.lookup("y.core").err(), Some(FsError::NoSuchEntity));
    }

    #[test]
    fn test_publish_reaches_a_ready_instance() {
        let (_handle, _fs) = ready();
        let id = publish("published.core", vec![7; 5], 1, 1).unwrap();
        let owner = with_instances(|list| list.iter().find(|fs| fs.fsid() == id.fsid()).cloned())
            .unwrap();
        let inode = owner.get_inode(id).unwrap();
        assert_eq!(inode.metadata().unwrap().size, 5);
        owner.remove_entry("published.core").unwrap();
    }

    #[test]
    fn test_for_each_instance_breaks_early() {
        let (_a, _fa) = ready();
        let (_b, _fb) = ready();
        let mut visited = 0;
        for_each_instance(|_| {
            visited += 1;
            IterationDecision::Break
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_publish_from_instance_iteration() {
        let (_handle, _fs) = ready();
        let mut published = None;
        for_each_instance(|_| {
            published = Some(publish("nested.core", vec![1; 2], 0, 0).unwrap());
            IterationDecision::Break
        });
        let id = published.unwrap();
        let owner = with_instances(|list| list.iter().find(|fs| fs.fsid() == id.fsid()).cloned())
            .unwrap();
        assert_eq!(owner.get_inode(id).unwrap().metadata().unwrap().size, 2);
        owner.remove_entry("nested.core").unwrap();
    }

    #[test]
    fn test_rename_is_read_only() {
        let (handle, _) = ready();
        let root = handle.root_inode();
        assert_eq!(handle.rename(&root, "a", &root, "b"), Err(FsError::ReadOnly));
    }
}
