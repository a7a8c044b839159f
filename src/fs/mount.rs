// ============================================================================
// src/fs/mount.rs - Filesystem Type Registry and Mount Preparation
// ============================================================================
//!
//! ファイルシステム種別ごとの能力記述子 (`FileSystemInitializer`) と、
//! マウント要求からインスタンスを作るまでの手順。
//!
//! 1. 種別名 (短縮名または正式名) で記述子を引く
//! 2. 呼び出し側のフラグを記述子のハンドラで1つずつ検証し、種別固有のフラグブロックへ書く
//! 3. ソース (ファイル記述子 / ブロックデバイス) の要件を確認する
//! 4. コンストラクタを呼び、`initialize` まで済ませたハンドルを返す

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{FsError, FsResult};
use crate::fs::block::BlockDevice;
use crate::fs::coredump::CoredumpFS;
use crate::fs::devloop::DevLoopFS;
use crate::fs::devpts::DevPtsFS;
use crate::fs::ext2::Ext2FS;
use crate::fs::fuse::{self, FuseChannel, FuseFS, FuseMountFlags};
use crate::fs::inode_id::InodeIdentifier;
use crate::fs::vfs::{FileSystemHandle, MountFlags};

// ============================================================================
// File Descriptions
// ============================================================================

/// マウントのソースとして渡されるオープン済みファイル記述
pub trait FileDescription: Send + Sync {
    /// 記述が指すinode (デバイスファイルなど)
    fn inode_identifier(&self) -> Option<InodeIdentifier>;

    fn is_seekable(&self) -> bool {
        false
    }

    /// ブロックデバイスとして使えるなら、そのデバイス
    fn block_device(&self) -> Option<Arc<dyn BlockDevice>> {
        None
    }

    /// FUSEデバイスなら、サーバーとの通信路
    fn fuse_channel(&self) -> Option<Arc<dyn FuseChannel>> {
        None
    }
}

/// マウントを要求したプロセスのファイル記述子テーブル
pub trait FileDescriptionTable: Send + Sync {
    fn pid(&self) -> u64;

    fn description(&self, fd: i32) -> Option<Arc<dyn FileDescription>>;
}

/// ブロックデバイスを直接ソースにしたときの記述
struct BlockDeviceDescription {
    device: Arc<dyn BlockDevice>,
}

impl FileDescription for BlockDeviceDescription {
    fn inode_identifier(&self) -> Option<InodeIdentifier> {
        None
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn block_device(&self) -> Option<Arc<dyn BlockDevice>> {
        Some(self.device.clone())
    }
}

// ============================================================================
// Mount-Specific Flags
// ============================================================================

/// 型付きのフラグ値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountFlagValue {
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Ascii(String),
}

/// 種別固有のフラグブロック (サイズは記述子が決める)
pub struct MountSpecificFlags {
    bytes: Vec<u8>,
    descriptions: Option<Arc<dyn FileDescriptionTable>>,
    description: Option<Arc<dyn FileDescription>>,
}

impl MountSpecificFlags {
    pub fn new(size: usize, descriptions: Option<Arc<dyn FileDescriptionTable>>) -> Self {
        Self {
            bytes: vec![0; size],
            descriptions,
            description: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// フラグ解決に使うファイル記述子テーブル
    pub fn descriptions(&self) -> Option<&Arc<dyn FileDescriptionTable>> {
        self.descriptions.as_ref()
    }

    /// フラグ (`fd` など) によって添付された記述
    pub fn description(&self) -> Option<&Arc<dyn FileDescription>> {
        self.description.as_ref()
    }

    pub fn attach_description(&mut self, description: Arc<dyn FileDescription>) {
        self.description = Some(description);
    }
}

// ============================================================================
// Initializer Descriptors
// ============================================================================

pub type CreateFn = fn(&MountSpecificFlags, MountFlags) -> FsResult<FileSystemHandle>;
pub type CreateWithFdFn =
    fn(Arc<dyn FileDescription>, &MountSpecificFlags, MountFlags) -> FsResult<FileSystemHandle>;
pub type BooleanFlagFn = fn(&mut MountSpecificFlags, &str, bool) -> FsResult<()>;
pub type UnsignedFlagFn = fn(&mut MountSpecificFlags, &str, u64) -> FsResult<()>;
pub type SignedFlagFn = fn(&mut MountSpecificFlags, &str, i64) -> FsResult<()>;
pub type AsciiFlagFn = fn(&mut MountSpecificFlags, &str, &str) -> FsResult<()>;

/// ファイルシステム種別の能力記述子
pub struct FileSystemInitializer {
    pub short_name: &'static str,
    pub name: &'static str,
    pub requires_open_file_description: bool,
    pub requires_block_device: bool,
    pub requires_seekable_file: bool,
    /// 種別固有フラグブロックのバイト数
    pub flags_size: usize,
    pub create: Option<CreateFn>,
    pub create_with_fd: Option<CreateWithFdFn>,
    pub handle_boolean_flag: Option<BooleanFlagFn>,
    pub handle_unsigned_flag: Option<UnsignedFlagFn>,
    pub handle_signed_flag: Option<SignedFlagFn>,
    pub handle_ascii_flag: Option<AsciiFlagFn>,
}

impl FileSystemInitializer {
    /// 値の型に対応するハンドラへ渡す。ハンドラが無ければ `InvalidArgument`
    pub fn apply_flag(
        &self,
        flags: &mut MountSpecificFlags,
        key: &str,
        value: &MountFlagValue,
    ) -> FsResult<()> {
        let result = match value {
            MountFlagValue::Boolean(v) => self.handle_boolean_flag.map(|h| h(flags, key, *v)),
            MountFlagValue::Unsigned(v) => self.handle_unsigned_flag.map(|h| h(flags, key, *v)),
            MountFlagValue::Signed(v) => self.handle_signed_flag.map(|h| h(flags, key, *v)),
            MountFlagValue::Ascii(v) => self.handle_ascii_flag.map(|h| h(flags, key, v)),
        };
        result.unwrap_or(Err(FsError::InvalidArgument))
    }

    fn matches(&self, fs_type: &str) -> bool {
        self.short_name == fs_type || self.name == fs_type
    }
}

fn create_ext2(
    description: Arc<dyn FileDescription>,
    _flags: &MountSpecificFlags,
    mount_flags: MountFlags,
) -> FsResult<FileSystemHandle> {
    let device = description.block_device().ok_or(FsError::InvalidArgument)?;
    Ext2FS::try_create(device, mount_flags.contains(MountFlags::RDONLY))
}

fn create_devpts(_: &MountSpecificFlags, _: MountFlags) -> FsResult<FileSystemHandle> {
    DevPtsFS::try_create()
}

fn create_devloop(_: &MountSpecificFlags, _: MountFlags) -> FsResult<FileSystemHandle> {
    DevLoopFS::try_create()
}

fn create_coredump(_: &MountSpecificFlags, _: MountFlags) -> FsResult<FileSystemHandle> {
    CoredumpFS::try_create()
}

fn create_fuse(flags: &MountSpecificFlags, _: MountFlags) -> FsResult<FileSystemHandle> {
    FuseFS::try_create(flags)
}

const fn synthetic(
    short_name: &'static str,
    name: &'static str,
    create: CreateFn,
) -> FileSystemInitializer {
    FileSystemInitializer {
        short_name,
        name,
        requires_open_file_description: false,
        requires_block_device: false,
        requires_seekable_file: false,
        flags_size: 0,
        create: Some(create),
        create_with_fd: None,
        handle_boolean_flag: None,
        handle_unsigned_flag: None,
        handle_signed_flag: None,
        handle_ascii_flag: None,
    }
}

static FILESYSTEM_INITIALIZERS: [FileSystemInitializer; 5] = [
    FileSystemInitializer {
        short_name: "ext2",
        name: "Ext2FS",
        requires_open_file_description: true,
        requires_block_device: true,
        requires_seekable_file: false,
        flags_size: 0,
        create: None,
        create_with_fd: Some(create_ext2),
        handle_boolean_flag: None,
        handle_unsigned_flag: None,
        handle_signed_flag: None,
        handle_ascii_flag: None,
    },
    synthetic("devpts", DevPtsFS::CLASS_NAME, create_devpts),
    synthetic("devloop", DevLoopFS::CLASS_NAME, create_devloop),
    synthetic("coredump", CoredumpFS::CLASS_NAME, create_coredump),
    FileSystemInitializer {
        short_name: "fuse",
        name: FuseFS::CLASS_NAME,
        requires_open_file_description: false,
        requires_block_device: false,
        requires_seekable_file: false,
        flags_size: FuseMountFlags::SIZE,
        create: Some(create_fuse),
        create_with_fd: None,
        handle_boolean_flag: None,
        handle_unsigned_flag: Some(fuse::handle_unsigned_flag),
        handle_signed_flag: Some(fuse::handle_signed_flag),
        handle_ascii_flag: Some(fuse::handle_ascii_flag),
    },
];

/// 組み込みのファイルシステム種別
pub fn registered_filesystems() -> &'static [FileSystemInitializer] {
    &FILESYSTEM_INITIALIZERS
}

// ============================================================================
// Mount Requests
// ============================================================================

/// マウントのソース
#[derive(Clone, Default)]
pub enum MountSource {
    #[default]
    None,
    Description(Arc<dyn FileDescription>),
    BlockDevice(Arc<dyn BlockDevice>),
}

impl MountSource {
    fn into_description(self) -> Option<Arc<dyn FileDescription>> {
        match self {
            MountSource::None => None,
            MountSource::Description(description) => Some(description),
            MountSource::BlockDevice(device) => Some(Arc::new(BlockDeviceDescription { device })),
        }
    }
}

pub struct MountRequest {
    pub fs_type: String,
    pub source: MountSource,
    pub flags: Vec<(String, MountFlagValue)>,
    pub mount_flags: MountFlags,
    /// `fd` フラグの解決に使う
    pub descriptions: Option<Arc<dyn FileDescriptionTable>>,
}

impl MountRequest {
    pub fn new(fs_type: &str) -> Self {
        Self {
            fs_type: String::from(fs_type),
            source: MountSource::None,
            flags: Vec::new(),
            mount_flags: MountFlags::empty(),
            descriptions: None,
        }
    }

    pub fn source(mut self, source: MountSource) -> Self {
        self.source = source;
        self
    }

    pub fn flag(mut self, key: &str, value: MountFlagValue) -> Self {
        self.flags.push((String::from(key), value));
        self
    }

    pub fn mount_flags(mut self, flags: MountFlags) -> Self {
        self.mount_flags = flags;
        self
    }

    pub fn descriptions(mut self, table: Arc<dyn FileDescriptionTable>) -> Self {
        self.descriptions = Some(table);
        self
    }
}

/// 組み込み種別でマウント要求を処理し、初期化済みのハンドルを返す
pub fn mount(request: MountRequest) -> FsResult<FileSystemHandle> {
    mount_with(registered_filesystems(), request)
}

/// 任意の記述子集合でマウント要求を処理する
pub fn mount_with(
    initializers: &[FileSystemInitializer],
    request: MountRequest,
) -> FsResult<FileSystemHandle> {
    let MountRequest {
        fs_type,
        source,
        flags: requested_flags,
        mount_flags,
        descriptions,
    } = request;

    let initializer = initializers
        .iter()
        .find(|i| i.matches(&fs_type))
        .ok_or(FsError::NoSuchEntity)?;

    let mut flags = MountSpecificFlags::new(initializer.flags_size, descriptions);
    for (key, value) in &requested_flags {
        if let Err(error) = initializer.apply_flag(&mut flags, key, value) {
            log::warn!("mount: {} rejected flag {}={:?}", initializer.short_name, key, value);
            return Err(error);
        }
    }

    let description = source.into_description();
    if initializer.requires_open_file_description && description.is_none() {
        return Err(FsError::InvalidArgument);
    }
    if initializer.requires_block_device
        && !description.as_ref().is_some_and(|d| d.block_device().is_some())
    {
        return Err(FsError::InvalidArgument);
    }
    if initializer.requires_seekable_file
        && !description.as_ref().is_some_and(|d| d.is_seekable())
    {
        return Err(FsError::InvalidArgument);
    }

    let handle = match (description, initializer.create_with_fd, initializer.create) {
        (Some(description), Some(create_with_fd), _) => {
            create_with_fd(description, &flags, mount_flags)?
        }
        (_, _, Some(create)) => create(&flags, mount_flags)?,
        _ => return Err(FsError::InvalidArgument),
    };

    if let Err(error) = handle.initialize() {
        log::error!(
            "mount: {} {} failed to initialize: {}",
            handle.class_name(),
            handle.fsid(),
            error
        );
        return Err(error);
    }
    log::info!("mount: created {:?}", handle);
    Ok(handle)
}
