// ============================================================================
// src/fs/vfs.rs - Virtual Filesystem Switch
// ============================================================================
//!
//! VFS (Virtual Filesystem) 抽象化
//!
//! ## 設計
//! - `FileSystem`: バックエンド契約 (生成 → 初期化 → 参照 → アンマウント準備)
//! - `Inode`: `InodeIdentifier` で識別されるノード。ファイルシステムへは弱参照で戻る
//! - `FileSystemHandle`: 既知のバックエンド種別を列挙した閉じた型
//! - `MountTable`: パス → マウント済みファイルシステム

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::error::{FsError, FsResult};
use crate::fs::config::{SYNTHETIC_INDEX_OFFSET, SYNTHETIC_ROOT_INDEX};
use crate::fs::coredump::CoredumpFS;
use crate::fs::devloop::DevLoopFS;
use crate::fs::devpts::DevPtsFS;
use crate::fs::ext2::Ext2FS;
use crate::fs::fuse::FuseFS;
use crate::fs::inode_id::InodeIdentifier;
use crate::sync::IterationDecision;
use crate::time::TimeSpec;

// ============================================================================
// File Types and Modes
// ============================================================================

/// File type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Block device
    BlockDevice,
    /// Character device
    CharDevice,
    /// Named pipe (FIFO)
    Fifo,
    /// Socket
    Socket,
    /// 未知の種別ビット
    Unknown,
}

/// ディレクトリエントリ種別 (`d_type`)
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

impl FileType {
    /// モードの種別ビットから判定
    pub fn from_mode(mode: u16) -> Self {
        match mode & FileMode::S_IFMT {
            FileMode::S_IFREG => FileType::Regular,
            FileMode::S_IFDIR => FileType::Directory,
            FileMode::S_IFLNK => FileType::Symlink,
            FileMode::S_IFBLK => FileType::BlockDevice,
            FileMode::S_IFCHR => FileType::CharDevice,
            FileMode::S_IFIFO => FileType::Fifo,
            FileMode::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// `d_type` 値
    pub const fn dirent_type(self) -> u8 {
        match self {
            FileType::Regular => DT_REG,
            FileType::Directory => DT_DIR,
            FileType::Symlink => DT_LNK,
            FileType::BlockDevice => DT_BLK,
            FileType::CharDevice => DT_CHR,
            FileType::Fifo => DT_FIFO,
            FileType::Socket => DT_SOCK,
            FileType::Unknown => DT_UNKNOWN,
        }
    }
}

/// File mode/permissions (UNIX-style)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FileMode(pub u16);

impl FileMode {
    /// 種別ビットのマスク
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFSOCK: u16 = 0o140000;
    pub const S_IFLNK: u16 = 0o120000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFIFO: u16 = 0o010000;

    pub const fn file_type_bits(&self) -> u16 {
        self.0 & Self::S_IFMT
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.0)
    }

    pub const fn is_dir(&self) -> bool {
        self.file_type_bits() == Self::S_IFDIR
    }

    pub const fn is_regular(&self) -> bool {
        self.file_type_bits() == Self::S_IFREG
    }
}

/// デバイス番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Linux 互換の `dev_t` エンコード
    pub const fn encode(&self) -> u64 {
        let major = self.major as u64;
        let minor = self.minor as u64;
        (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12) | ((major & !0xfff) << 32)
    }
}

// ============================================================================
// Inode
// ============================================================================

/// File metadata/attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub inode: InodeIdentifier,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    /// File size in bytes
    pub size: u64,
    /// Number of hard links
    pub nlink: u32,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
    /// Block size for filesystem I/O
    pub block_size: u32,
    /// Number of allocated blocks
    pub block_count: u64,
    /// Device ID (for special files)
    pub device: Option<DeviceNumber>,
}

impl FileAttr {
    pub fn new(inode: InodeIdentifier, mode: FileMode) -> Self {
        Self {
            inode,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 1,
            atime: TimeSpec::ZERO,
            mtime: TimeSpec::ZERO,
            ctime: TimeSpec::ZERO,
            block_size: 4096,
            block_count: 0,
            device: None,
        }
    }

    pub fn file_type(&self) -> FileType {
        self.mode.file_type()
    }
}

/// ディレクトリ走査で渡されるエントリ
///
/// `file_type` はバックエンド内部の種別値。`d_type` への変換は
/// `FileSystem::internal_file_type_to_directory_entry_type` が行う。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntryView {
    pub name: String,
    pub inode: InodeIdentifier,
    pub file_type: u8,
}

impl DirectoryEntryView {
    pub fn new(name: impl Into<String>, inode: InodeIdentifier, file_type: u8) -> Self {
        Self {
            name: name.into(),
            inode,
            file_type,
        }
    }
}

pub type InodeHandle = Arc<dyn Inode>;

/// Inode operations trait
pub trait Inode: Send + Sync + Any {
    fn identifier(&self) -> InodeIdentifier;

    /// Get file attributes
    fn metadata(&self) -> FsResult<FileAttr>;

    /// Look up a name in this directory
    fn lookup(&self, _name: &str) -> FsResult<InodeHandle> {
        Err(FsError::NotDirectory)
    }

    /// エントリごとにコールバックを呼ぶ。`Break` で打ち切り
    fn traverse_as_directory(
        &self,
        _callback: &mut dyn FnMut(&DirectoryEntryView) -> IterationDecision,
    ) -> FsResult<()> {
        Err(FsError::NotDirectory)
    }

    /// Read data from file
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;

    /// Write data to file
    fn write_bytes(&self, _offset: u64, _data: &[u8]) -> FsResult<usize> {
        Err(FsError::ReadOnly)
    }

    fn as_any(&self) -> &dyn Any;
}

/// ディレクトリの全エントリを集める
pub fn directory_entries(inode: &dyn Inode) -> FsResult<Vec<DirectoryEntryView>> {
    let mut entries = Vec::new();
    inode.traverse_as_directory(&mut |entry| {
        entries.push(entry.clone());
        IterationDecision::Continue
    })?;
    Ok(entries)
}

/// 合成ファイルシステムの inode番号 → バッキング番号
///
/// ルート (1) と 0 はここに来てはならない。
pub fn synthetic_backing_index(index: u64) -> u64 {
    assert!(
        index > SYNTHETIC_ROOT_INDEX,
        "synthetic inode index {} has no backing entity",
        index
    );
    index - SYNTHETIC_INDEX_OFFSET
}

/// バッキング番号 → 合成ファイルシステムの inode番号
pub const fn synthetic_inode_index(backing: u64) -> u64 {
    backing + SYNTHETIC_INDEX_OFFSET
}

// ============================================================================
// Filesystem Lifecycle
// ============================================================================

/// Created → Initializing → Ready → Unmounting → Destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemState {
    Created,
    Initializing,
    Ready,
    Unmounting,
    Destroyed,
}

static NEXT_FSID: AtomicU32 = AtomicU32::new(1);

/// 全バックエンド共通の状態 (ID とライフサイクル)
pub struct FileSystemBase {
    fsid: u32,
    class_name: &'static str,
    state: Mutex<FileSystemState>,
}

impl FileSystemBase {
    /// プロセス全体で一意な非0 IDを割り当てる
    pub fn new(class_name: &'static str) -> Self {
        let fsid = NEXT_FSID.fetch_add(1, Ordering::Relaxed);
        assert!(fsid != 0, "filesystem id space exhausted");
        Self {
            fsid,
            class_name,
            state: Mutex::new(FileSystemState::Created),
        }
    }

    pub fn fsid(&self) -> u32 {
        self.fsid
    }

    pub fn state(&self) -> FileSystemState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == FileSystemState::Ready
    }

    /// `try_create` の中で呼ぶ
    pub fn begin_initialize(&self) {
        self.transition(FileSystemState::Created, FileSystemState::Initializing);
    }

    /// `initialize` の先頭で呼ぶ。二重初期化は致命的
    pub fn assert_initializing(&self) {
        let state = self.state();
        assert!(
            state == FileSystemState::Initializing,
            "{} {}: initialize called in state {:?}",
            self.class_name,
            self.fsid,
            state
        );
    }

    /// `initialize` の成功時に呼ぶ
    pub fn finish_initialize(&self) {
        self.transition(FileSystemState::Initializing, FileSystemState::Ready);
        log::debug!("{} {}: ready", self.class_name, self.fsid);
    }

    /// Ready → Unmounting
    pub fn begin_unmount(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        if *state != FileSystemState::Ready {
            return Err(FsError::Busy);
        }
        *state = FileSystemState::Unmounting;
        Ok(())
    }

    /// 識別子がこのインスタンスのものか
    pub fn check_identifier(&self, id: InodeIdentifier) -> FsResult<()> {
        if id.fsid() != self.fsid || id.index() == 0 {
            return Err(FsError::NoSuchEntity);
        }
        Ok(())
    }

    fn transition(&self, from: FileSystemState, to: FileSystemState) {
        let mut state = self.state.lock();
        assert!(
            *state == from,
            "{} {}: invalid transition {:?} -> {:?}",
            self.class_name,
            self.fsid,
            *state,
            to
        );
        *state = to;
    }
}

impl Drop for FileSystemBase {
    fn drop(&mut self) {
        *self.state.lock() = FileSystemState::Destroyed;
        log::debug!("{} {}: destroyed", self.class_name, self.fsid);
    }
}

// ============================================================================
// Filesystem Trait
// ============================================================================

/// Filesystem operations trait
pub trait FileSystem: Send + Sync {
    fn class_name(&self) -> &'static str;

    fn base(&self) -> &FileSystemBase;

    fn fsid(&self) -> u32 {
        self.base().fsid()
    }

    fn state(&self) -> FileSystemState {
        self.base().state()
    }

    /// ルートinodeを構築する。ちょうど1回だけ呼ばれる
    fn initialize(&self) -> FsResult<()>;

    /// 初期化後は常に成功する
    fn root_inode(&self) -> InodeHandle;

    fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle>;

    fn rename(
        &self,
        _old_parent: &InodeHandle,
        _old_name: &str,
        _new_parent: &InodeHandle,
        _new_name: &str,
    ) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    /// 内部種別値 → `d_type`
    ///
    /// 既定では内部種別値をモードの種別ビット (`mode >> 12`) とみなす。
    fn internal_file_type_to_directory_entry_type(&self, entry: &DirectoryEntryView) -> u8 {
        FileType::from_mode((entry.file_type as u16) << 12).dirent_type()
    }

    /// アンマウント前の後始末 (レジストリからの登録解除など)
    fn prepare_to_unmount(&self) -> FsResult<()> {
        self.base().begin_unmount()
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// 既知のバックエンド種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemKind {
    Ext2,
    DevPts,
    DevLoop,
    Coredump,
    Fuse,
}

/// マウント可能なファイルシステムインスタンス
#[derive(Clone)]
pub enum FileSystemHandle {
    Ext2(Arc<Ext2FS>),
    DevPts(Arc<DevPtsFS>),
    DevLoop(Arc<DevLoopFS>),
    Coredump(Arc<CoredumpFS>),
    Fuse(Arc<FuseFS>),
}

impl FileSystemHandle {
    pub fn kind(&self) -> FileSystemKind {
        match self {
            FileSystemHandle::Ext2(_) => FileSystemKind::Ext2,
            FileSystemHandle::DevPts(_) => FileSystemKind::DevPts,
            FileSystemHandle::DevLoop(_) => FileSystemKind::DevLoop,
            FileSystemHandle::Coredump(_) => FileSystemKind::Coredump,
            FileSystemHandle::Fuse(_) => FileSystemKind::Fuse,
        }
    }

    pub fn as_fs(&self) -> &(dyn FileSystem + 'static) {
        match self {
            FileSystemHandle::Ext2(fs) => fs.as_ref(),
            FileSystemHandle::DevPts(fs) => fs.as_ref(),
            FileSystemHandle::DevLoop(fs) => fs.as_ref(),
            FileSystemHandle::Coredump(fs) => fs.as_ref(),
            FileSystemHandle::Fuse(fs) => fs.as_ref(),
        }
    }

    /// 同じインスタンスを指しているか
    pub fn ptr_eq(&self, other: &FileSystemHandle) -> bool {
        self.kind() == other.kind() && self.fsid() == other.fsid()
    }
}

impl Deref for FileSystemHandle {
    type Target = dyn FileSystem;

    fn deref(&self) -> &Self::Target {
        self.as_fs()
    }
}

impl core::fmt::Debug for FileSystemHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.class_name(), self.fsid())
    }
}

// ============================================================================
// Mount Table
// ============================================================================

bitflags! {
    /// 汎用マウントフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        const NODEV = 1 << 0;
        const NOEXEC = 1 << 1;
        const NOSUID = 1 << 2;
        const BIND = 1 << 3;
        const RDONLY = 1 << 4;
        const REMOUNT = 1 << 5;
    }
}

/// Mount point entry
struct MountEntry {
    /// Mount path
    path: String,
    /// Mounted filesystem
    fs: FileSystemHandle,
    flags: MountFlags,
}

impl MountEntry {
    fn covers(&self, path: &str) -> bool {
        if self.path == "/" || self.path == path {
            return true;
        }
        path.strip_prefix(self.path.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Global mount table
pub struct MountTable {
    mounts: RwLock<Vec<MountEntry>>,
}

impl MountTable {
    /// Create a new mount table
    pub const fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
        }
    }

    /// Mount a filesystem (初期化済みであること)
    pub fn mount(&self, path: &str, fs: FileSystemHandle, flags: MountFlags) -> FsResult<()> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        if fs.state() != FileSystemState::Ready {
            return Err(FsError::InvalidArgument);
        }

        let mut mounts = self.mounts.write();

        // Check if already mounted
        if mounts.iter().any(|m| m.path == path) {
            return Err(FsError::AlreadyExists);
        }

        log::info!(
            "vfs: mounted {} {} at {} ({:?})",
            fs.class_name(),
            fs.fsid(),
            path,
            flags
        );
        mounts.push(MountEntry {
            path: path.into(),
            fs,
            flags,
        });

        Ok(())
    }

    /// Unmount a filesystem
    ///
    /// アンマウント準備に失敗した場合はマウントしたまま残す。
    pub fn unmount(&self, path: &str) -> FsResult<FileSystemHandle> {
        let mut mounts = self.mounts.write();

        let pos = mounts
            .iter()
            .position(|m| m.path == path)
            .ok_or(FsError::NoSuchEntity)?;
        mounts[pos].fs.prepare_to_unmount()?;
        let entry = mounts.remove(pos);
        log::info!(
            "vfs: unmounted {} {} from {}",
            entry.fs.class_name(),
            entry.fs.fsid(),
            path
        );
        Ok(entry.fs)
    }

    /// Find filesystem for a path (最長一致)
    pub fn find(&self, path: &str) -> Option<(String, FileSystemHandle, MountFlags)> {
        let mounts = self.mounts.read();

        // Find longest matching mount point
        mounts
            .iter()
            .filter(|m| m.covers(path))
            .max_by_key(|m| m.path.len())
            .map(|m| (m.path.clone(), m.fs.clone(), m.flags))
    }

    pub fn find_by_fsid(&self, fsid: u32) -> Option<(FileSystemHandle, MountFlags)> {
        self.mounts
            .read()
            .iter()
            .find(|m| m.fs.fsid() == fsid)
            .map(|m| (m.fs.clone(), m.flags))
    }

    /// 識別子からinodeを取得 (所属ファイルシステムへ委譲)
    pub fn get_inode(&self, id: InodeIdentifier) -> FsResult<InodeHandle> {
        if !id.is_valid() {
            return Err(FsError::InvalidArgument);
        }
        let (fs, _) = self.find_by_fsid(id.fsid()).ok_or(FsError::NoSuchEntity)?;
        fs.get_inode(id)
    }

    /// パスを解決する
    pub fn resolve(&self, path: &str) -> FsResult<InodeHandle> {
        let (mount_path, fs, _) = self.find(path).ok_or(FsError::NoSuchEntity)?;
        let rest = if mount_path == "/" {
            path
        } else {
            &path[mount_path.len()..]
        };

        let mut inode = fs.root_inode();
        for component in rest.split('/').filter(|c| !c.is_empty() && *c != ".") {
            inode = inode.lookup(component)?;
        }
        Ok(inode)
    }

    /// 同一ファイルシステム内の rename
    pub fn rename(
        &self,
        old_parent: &InodeHandle,
        old_name: &str,
        new_parent: &InodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        let fsid = old_parent.identifier().fsid();
        if new_parent.identifier().fsid() != fsid {
            return Err(FsError::CrossDevice);
        }
        let (fs, flags) = self.find_by_fsid(fsid).ok_or(FsError::NoSuchEntity)?;
        if flags.contains(MountFlags::RDONLY) {
            return Err(FsError::ReadOnly);
        }
        fs.rename(old_parent, old_name, new_parent, new_name)
    }

    /// (パス, ファイルシステム種別名, fsid)
    pub fn list(&self) -> Vec<(String, &'static str, u32)> {
        self.mounts
            .read()
            .iter()
            .map(|m| (m.path.clone(), m.fs.class_name(), m.fs.fsid()))
            .collect()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mount table instance
static MOUNT_TABLE: MountTable = MountTable::new();

/// Get the global mount table
pub fn mount_table() -> &'static MountTable {
    &MOUNT_TABLE
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::devpts::{self, DevPtsFS};

    fn ready_devpts() -> FileSystemHandle {
        let handle = DevPtsFS::try_create().unwrap();
        handle.initialize().unwrap();
        handle
    }

    #[test]
    fn test_file_mode() {
        let file = FileMode(FileMode::S_IFREG | 0o644);
        assert!(file.is_regular());
        assert!(!file.is_dir());
        assert_eq!(file.file_type(), FileType::Regular);
        let dir = FileMode(FileMode::S_IFDIR | 0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.file_type_bits(), FileMode::S_IFDIR);
    }

    fn backend_name(fs: &(dyn FileSystem + 'static)) -> &'static str {
        fs.class_name()
    }

    #[test]
    fn test_handle_derefs_to_backend() {
        let handle = ready_devpts();
        let fs: &dyn FileSystem = &*handle;
        assert_eq!(fs.fsid(), handle.as_fs().fsid());
        assert_eq!(backend_name(handle.as_fs()), DevPtsFS::CLASS_NAME);
        assert_eq!(handle.kind(), FileSystemKind::DevPts);
        assert_eq!(handle.state(), FileSystemState::Ready);
    }

    #[test]
    fn test_file_type_to_dirent() {
        assert_eq!(FileType::from_mode(0o040755).dirent_type(), DT_DIR);
        assert_eq!(FileType::from_mode(0o100644).dirent_type(), DT_REG);
        assert_eq!(FileType::from_mode(0o020620).dirent_type(), DT_CHR);
        assert_eq!(FileType::from_mode(0o060660).dirent_type(), DT_BLK);
        assert_eq!(FileType::from_mode(0o120777).dirent_type(), DT_LNK);
        assert_eq!(FileType::from_mode(0o777).dirent_type(), DT_UNKNOWN);
    }

    #[test]
    fn test_device_number_encoding() {
        assert_eq!(DeviceNumber::new(201, 3).encode(), (201 << 8) | 3);
        assert_eq!(DeviceNumber::new(20, 0x1234).encode(), (20 << 8) | 0x34 | (0x1200 << 12));
    }

    #[test]
    fn test_fsids_are_unique_and_non_zero() {
        let a = FileSystemBase::new("test");
        let b = FileSystemBase::new("test");
        assert_ne!(a.fsid(), 0);
        assert_ne!(a.fsid(), b.fsid());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let base = FileSystemBase::new("test");
        assert_eq!(base.state(), FileSystemState::Created);
        base.begin_initialize();
        base.assert_initializing();
        base.finish_initialize();
        assert!(base.is_ready());
        base.begin_unmount().unwrap();
        assert_eq!(base.state(), FileSystemState::Unmounting);
        assert_eq!(base.begin_unmount(), Err(FsError::Busy));
    }

    #[test]
    #[should_panic(expected = "initialize called in state Ready")]
    fn test_double_initialize_is_fatal() {
        let handle = ready_devpts();
        let _ = handle.initialize();
    }

    #[test]
    #[should_panic(expected = "no backing entity")]
    fn test_root_index_never_maps_to_backing() {
        synthetic_backing_index(SYNTHETIC_ROOT_INDEX);
    }

    #[test]
    fn test_synthetic_index_mapping() {
        assert_eq!(synthetic_backing_index(2), 0);
        assert_eq!(synthetic_inode_index(5), 7);
    }

    #[test]
    fn test_default_directory_entry_type_mapping() {
        let fs = ready_devpts();
        let id = InodeIdentifier::new(fs.fsid(), 1);
        let dir = DirectoryEntryView::new(".", id, (FileMode::S_IFDIR >> 12) as u8);
        let chr = DirectoryEntryView::new("0", id, (FileMode::S_IFCHR >> 12) as u8);
        assert_eq!(fs.internal_file_type_to_directory_entry_type(&dir), DT_DIR);
        assert_eq!(fs.internal_file_type_to_directory_entry_type(&chr), DT_CHR);
    }

    #[test]
    fn test_mount_table_longest_prefix() {
        let table = MountTable::new();
        let root = ready_devpts();
        let pts = ready_devpts();
        table.mount("/", root.clone(), MountFlags::empty()).unwrap();
        table.mount("/dev/pts", pts.clone(), MountFlags::NOEXEC).unwrap();

        let (path, fs, flags) = table.find("/dev/pts/0").unwrap();
        assert_eq!(path, "/dev/pts");
        assert!(fs.ptr_eq(&pts));
        assert_eq!(flags, MountFlags::NOEXEC);
        let (path, fs, _) = table.find("/dev/ptsx").unwrap();
        assert_eq!(path, "/");
        assert!(fs.ptr_eq(&root));
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn test_mount_requires_ready_and_unique_path() {
        let table = MountTable::new();
        let created = DevPtsFS::try_create().unwrap();
        assert_eq!(
            table.mount("/dev/pts", created.clone(), MountFlags::empty()),
            Err(FsError::InvalidArgument)
        );
        created.initialize().unwrap();
        table.mount("/dev/pts", created.clone(), MountFlags::empty()).unwrap();
        assert_eq!(
            table.mount("/dev/pts", ready_devpts(), MountFlags::empty()),
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            table.mount("relative", ready_devpts(), MountFlags::empty()),
            Err(FsError::InvalidArgument)
        );
    }

    #[test]
    fn test_get_inode_dispatches_by_fsid() {
        let table = MountTable::new();
        let pts = ready_devpts();
        table.mount("/dev/pts", pts.clone(), MountFlags::empty()).unwrap();

        let root = table.get_inode(InodeIdentifier::new(pts.fsid(), 1)).unwrap();
        assert!(root.metadata().unwrap().mode.is_dir());
        assert_eq!(
            table.get_inode(InodeIdentifier::new(pts.fsid(), 0)).err(),
            Some(FsError::InvalidArgument)
        );
        assert_eq!(
            table.get_inode(InodeIdentifier::new(u32::MAX, 1)).err(),
            Some(FsError::NoSuchEntity)
        );
    }

    #[test]
    fn test_unmount_runs_preparation() {
        let table = MountTable::new();
        let pts = ready_devpts();
        table.mount("/dev/pts", pts.clone(), MountFlags::empty()).unwrap();
        let removed = table.unmount("/dev/pts").unwrap();
        assert!(removed.ptr_eq(&pts));
        assert_eq!(pts.state(), FileSystemState::Unmounting);
        assert_eq!(table.unmount("/dev/pts").err(), Some(FsError::NoSuchEntity));
    }

    #[test]
    fn test_rename_rules() {
        let table = MountTable::new();
        let a = ready_devpts();
        let b = ready_devpts();
        table.mount("/a", a.clone(), MountFlags::RDONLY).unwrap();
        table.mount("/b", b.clone(), MountFlags::empty()).unwrap();
        let root_a = a.root_inode();
        let root_b = b.root_inode();

        assert_eq!(table.rename(&root_a, "x", &root_b, "y"), Err(FsError::CrossDevice));
        assert_eq!(table.rename(&root_a, "x", &root_a, "y"), Err(FsError::ReadOnly));
        // devpts は常に読み取り専用
        assert_eq!(table.rename(&root_b, "x", &root_b, "y"), Err(FsError::ReadOnly));
    }

    #[test]
    fn test_resolve_path() {
        let table = MountTable::new();
        let pts = ready_devpts();
        let index = devpts::pty_registry().allocate(0, 0);
        table.mount("/dev/pts", pts, MountFlags::empty()).unwrap();

        let path = alloc::format!("/dev/pts/{}", index);
        let inode = table.resolve(&path).unwrap();
        assert_eq!(inode.identifier().index(), synthetic_inode_index(index as u64));
        assert!(table.resolve("/dev/pts/./").unwrap().metadata().unwrap().mode.is_dir());
        assert!(table.resolve("/nowhere").is_err());
        devpts::pty_registry().release(index);
    }
}
