use crate::types::HookError;
use std::ffi::CStr;

mod elf {
    pub const ELFMAG: [u8; 4] = *b"\x7fELF";
    pub const ELFCLASS64: u8 = 2;

    pub const PT_LOAD: u32 = 1;
    pub const PT_DYNAMIC: u32 = 2;

    pub const DT_NULL: i64 = 0;
    pub const DT_PLTRELSZ: i64 = 2;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_RELA: i64 = 7;
    pub const DT_RELASZ: i64 = 8;
    pub const DT_STRSZ: i64 = 10;
    pub const DT_JMPREL: i64 = 23;

    #[cfg(target_arch = "aarch64")]
    pub const GOT_RELOCATIONS: [u32; 3] = [1026 /* JUMP_SLOT */, 1025 /* GLOB_DAT */, 257 /* ABS64 */];
    #[cfg(target_arch = "x86_64")]
    pub const GOT_RELOCATIONS: [u32; 3] = [7 /* JUMP_SLOT */, 6 /* GLOB_DAT */, 1 /* 64 */];
    #[cfg(target_arch = "riscv64")]
    pub const GOT_RELOCATIONS: [u32; 2] = [5 /* JUMP_SLOT */, 2 /* 64 */];
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "riscv64")))]
    pub const GOT_RELOCATIONS: [u32; 0] = [];

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Ehdr {
        pub e_ident: [u8; 16],
        pub e_type: u16,
        pub e_machine: u16,
        pub e_version: u32,
        pub e_entry: u64,
        pub e_phoff: u64,
        pub e_shoff: u64,
        pub e_flags: u32,
        pub e_ehsize: u16,
        pub e_phentsize: u16,
        pub e_phnum: u16,
        pub e_shentsize: u16,
        pub e_shnum: u16,
        pub e_shstrndx: u16,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Phdr {
        pub p_type: u32,
        pub p_flags: u32,
        pub p_offset: u64,
        pub p_vaddr: u64,
        pub p_paddr: u64,
        pub p_filesz: u64,
        pub p_memsz: u64,
        pub p_align: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Rela {
        pub r_offset: u64,
        pub r_info: u64,
        pub r_addend: i64,
    }

    impl Elf64Rela {
        pub fn sym(&self) -> usize {
            (self.r_info >> 32) as usize
        }

        pub fn kind(&self) -> u32 {
            self.r_info as u32
        }
    }
}

/// Dynamic-linking view of an ELF image that is already mapped into this
/// process, read straight from memory starting at its first mapping.
#[derive(Debug, Clone)]
pub struct ElfImage {
    base: usize,
    bias: usize,
    symtab: usize,
    strtab: usize,
    strsz: usize,
    tables: Vec<(usize, usize)>,
}

impl ElfImage {
    /// Parse the image whose ELF header sits at `base`.
    ///
    /// # Safety
    /// `base` must be the start of a readable mapping of a loaded ELF object
    /// whose dynamic section is mapped as well.
    pub unsafe fn from_base(base: usize) -> Result<Self, HookError> {
        let ehdr = unsafe { core::ptr::read_unaligned(base as *const elf::Elf64Ehdr) };
        if ehdr.e_ident[..4] != elf::ELFMAG || ehdr.e_ident[4] != elf::ELFCLASS64 {
            return Err(HookError::NotElf(base));
        }
        if ehdr.e_phentsize as usize != core::mem::size_of::<elf::Elf64Phdr>() {
            return Err(HookError::NotElf(base));
        }

        let phdrs = unsafe {
            core::slice::from_raw_parts((base + ehdr.e_phoff as usize) as *const elf::Elf64Phdr, ehdr.e_phnum as usize)
        };

        let page_mask = !(crate::code::page_size() as u64 - 1);
        let bias = phdrs
            .iter()
            .find(|p| p.p_type == elf::PT_LOAD && p.p_offset == 0)
            .map(|p| base.wrapping_sub((p.p_vaddr & page_mask) as usize))
            .ok_or(HookError::NotElf(base))?;

        let dynamic = phdrs
            .iter()
            .find(|p| p.p_type == elf::PT_DYNAMIC)
            .map(|p| bias.wrapping_add(p.p_vaddr as usize) as *const elf::Elf64Dyn)
            .ok_or(HookError::NoDynamic(base))?;

        let mut symtab = 0u64;
        let mut strtab = 0u64;
        let mut strsz = 0usize;
        let mut jmprel = (0u64, 0usize);
        let mut rela = (0u64, 0usize);

        let mut entry = dynamic;
        loop {
            let dyn_entry = unsafe { *entry };
            match dyn_entry.d_tag {
                elf::DT_NULL => break,
                elf::DT_SYMTAB => symtab = dyn_entry.d_val,
                elf::DT_STRTAB => strtab = dyn_entry.d_val,
                elf::DT_STRSZ => strsz = dyn_entry.d_val as usize,
                elf::DT_JMPREL => jmprel.0 = dyn_entry.d_val,
                elf::DT_PLTRELSZ => jmprel.1 = dyn_entry.d_val as usize,
                elf::DT_RELA => rela.0 = dyn_entry.d_val,
                elf::DT_RELASZ => rela.1 = dyn_entry.d_val as usize,
                _ => {}
            }
            entry = unsafe { entry.add(1) };
        }

        if symtab == 0 || strtab == 0 {
            return Err(HookError::NoDynamic(base));
        }

        // glibc relocates d_ptr entries in place; bionic leaves them as
        // link-time addresses.
        let adjusted = symtab > bias as u64 || strtab > bias as u64;
        let resolve = |val: u64| -> usize {
            if val == 0 {
                0
            } else if adjusted {
                val as usize
            } else {
                bias.wrapping_add(val as usize)
            }
        };

        let tables = [jmprel, rela]
            .into_iter()
            .filter(|(addr, size)| *addr != 0 && *size != 0)
            .map(|(addr, size)| (resolve(addr), size))
            .collect();

        Ok(ElfImage {
            base,
            bias,
            symtab: resolve(symtab),
            strtab: resolve(strtab),
            strsz,
            tables,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn bias(&self) -> usize {
        self.bias
    }

    /// Addresses of every GOT slot bound to `symbol` through a jump-slot,
    /// glob-dat or absolute relocation.
    pub fn relocation_slots(&self, symbol: &str) -> Vec<usize> {
        let mut slots = Vec::new();
        for &(table, size) in &self.tables {
            let count = size / core::mem::size_of::<elf::Elf64Rela>();
            for i in 0..count {
                let rel = unsafe { core::ptr::read_unaligned((table as *const elf::Elf64Rela).add(i)) };
                if rel.sym() == 0 || !elf::GOT_RELOCATIONS.contains(&rel.kind()) {
                    continue;
                }
                if self.symbol_name(rel.sym()).is_some_and(|name| name.to_bytes() == symbol.as_bytes()) {
                    let slot = self.bias.wrapping_add(rel.r_offset as usize);
                    if !slots.contains(&slot) {
                        slots.push(slot);
                    }
                }
            }
        }
        slots
    }

    fn symbol_name(&self, index: usize) -> Option<&CStr> {
        let sym = unsafe { core::ptr::read_unaligned((self.symtab as *const elf::Elf64Sym).add(index)) };
        let offset = sym.st_name as usize;
        if self.strsz != 0 && offset >= self.strsz {
            return None;
        }
        Some(unsafe { CStr::from_ptr((self.strtab + offset) as *const libc::c_char) })
    }
}
