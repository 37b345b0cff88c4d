use bitflags::bitflags;

bitflags! {
    /// Per-process policy bits returned by the daemon for a uid.
    ///
    /// The low bits are visible to modules through `getFlags`; bits 27..=31
    /// are private to the loader and daemon.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProcessFlags: u32 {
        const PROCESS_GRANTED_ROOT = 1 << 0;
        const PROCESS_ON_DENYLIST = 1 << 1;
        const PROCESS_IS_MANAGER = 1 << 27;
        const PROCESS_ROOT_IS_APATCH = 1 << 28;
        const PROCESS_ROOT_IS_KSU = 1 << 29;
        const PROCESS_ROOT_IS_MAGISK = 1 << 30;
        const PROCESS_IS_FIRST_STARTED = 1 << 31;
    }
}

impl ProcessFlags {
    /// Bits never exposed to modules.
    pub const PRIVATE_MASK: ProcessFlags = ProcessFlags::from_bits_retain(0b11111 << 27);

    /// Bits that request the zygote's extra mounts be reverted.
    pub const UNMOUNT_MASK: ProcessFlags = ProcessFlags::PROCESS_ON_DENYLIST;

    /// Flags as reported to modules, with the private bits cleared.
    pub fn public_bits(self) -> u32 {
        (self - Self::PRIVATE_MASK).bits()
    }

    pub fn needs_unmount(self) -> bool {
        self.intersects(Self::UNMOUNT_MASK)
    }

    /// Mount source tag used by the active root implementation, if any.
    pub fn root_source(self) -> Option<&'static str> {
        if self.contains(Self::PROCESS_ROOT_IS_MAGISK) {
            Some("magisk")
        } else if self.contains(Self::PROCESS_ROOT_IS_KSU) {
            Some("KSU")
        } else if self.contains(Self::PROCESS_ROOT_IS_APATCH) {
            Some("APatch")
        } else {
            None
        }
    }
}
