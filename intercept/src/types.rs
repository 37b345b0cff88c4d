use thiserror::Error;

/// Failures raised while resolving or patching relocation slots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("no ELF header at {0:#x}")]
    NotElf(usize),
    #[error("image at {0:#x} has no usable dynamic section")]
    NoDynamic(usize),
    #[error("no primary mapping for dev {dev:#x} inode {inode}")]
    ImageNotMapped { dev: u64, inode: u64 },
    #[error("`{0}` is not imported by the target image")]
    SymbolNotFound(String),
    #[error("failed to change protection of slot {0:#x}")]
    ProtectFailed(usize),
    #[error("unsupported on this platform")]
    Unsupported,
}

/// Identity of a mapped file: the device and inode pair the kernel reports
/// in `/proc/<pid>/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pub dev: u64,
    pub inode: u64,
}

impl FileId {
    pub const fn new(dev: u64, inode: u64) -> Self {
        Self { dev, inode }
    }

    pub const fn is_anonymous(&self) -> bool {
        self.dev == 0 && self.inode == 0
    }
}
