//! ELF loader: parses an `ET_EXEC` unikernel image, maps its `PT_LOAD`
//! segments into guest memory with correct protections, and extracts the
//! single Solo5-owned manifest NOTE.
//!
//! Grounded on the `goblin`-based loader pattern used by the `uhyve`-style
//! host-side VM loader in the retrieval pack: parse once into an in-memory
//! `Elf`, walk program headers for `PT_LOAD`/`PT_TLS`, and separately walk
//! note headers for the manifest descriptor.

use std::io::{self, Read};

use goblin::elf::header::{EM_X86_64, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD, PT_TLS};
use goblin::elf::Elf;

/// Host `mprotect`-style protection bits. Values match `libc::PROT_*` so a
/// caller can pass them straight through to a real `mprotect(2)` call.
pub const PROT_NONE: i32 = 0;
pub const PROT_READ: i32 = 1;
pub const PROT_WRITE: i32 = 2;
pub const PROT_EXEC: i32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("I/O error reading ELF image: {0}")]
    Io(#[from] io::Error),
    #[error("malformed ELF image: {0}")]
    Goblin(#[from] goblin::error::Error),
    #[error("not an ELFCLASS64 ET_EXEC image")]
    NotExecutable,
    #[error("unsupported e_machine {0:#x}, expected {EM_X86_64:#x}")]
    UnsupportedMachine(u16),
    #[error("PT_LOAD segment at {0:#x} rejected: both PF_W and PF_X set (W^X violation)")]
    WxViolation(u64),
    #[error("PT_LOAD segment [{start:#x}, {end:#x}) out of bounds for {mem_size}-byte guest memory")]
    OutOfBounds { start: u64, end: u64, mem_size: usize },
    #[error("integer overflow computing segment bounds")]
    Overflow,
    #[error("p_align {0} is not a power of two")]
    BadAlignment(u64),
    #[error("guest mprotect callback failed: {0}")]
    Mprotect(String),
}

/// Called once per `PT_LOAD` segment (after the segment's bytes have been
/// copied into guest memory) to let the backend apply its own additional
/// page protections (e.g. KVM EPT, OpenBSD `VMM_IOC_MPROTECT_EPT`).
///
/// `prot` is the *guest-intended* protection derived from `PF_R/W/X`; the
/// ELF loader has already ensured host-side memory for this range is never
/// simultaneously writable and executable.
pub trait GuestMprotect {
    fn mprotect(&mut self, addr_start: u64, addr_end: u64, prot: i32) -> Result<(), String>;
}

/// Result of a successful `load_elf` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    pub entry: u64,
    /// Highest aligned address used by any `PT_LOAD` segment.
    pub end: u64,
    /// `p_memsz` of the first `PT_TLS` segment found, or 0 if none.
    pub tls_size: u64,
}

fn align_up(addr: u64, align: u64) -> Result<u64, LoadError> {
    if align == 0 {
        return Ok(addr);
    }
    if !align.is_power_of_two() {
        return Err(LoadError::BadAlignment(align));
    }
    let mask = align - 1;
    addr.checked_add(mask)
        .map(|v| v & !mask)
        .ok_or(LoadError::Overflow)
}

/// Loads an ELF binary from `file` into `mem`, starting no lower than
/// `min_loadaddr`. `mprotect` is invoked once per `PT_LOAD` segment to let
/// the backend apply its own guest-side page protections; host-side
/// executability is never requested (the loader only ever copies bytes
/// into `mem`, it never makes `mem` itself executable).
pub fn load_elf(
    file: &mut dyn Read,
    mem: &mut [u8],
    min_loadaddr: u64,
    mprotect: &mut dyn GuestMprotect,
) -> Result<LoadResult, LoadError> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let elf = Elf::parse(&buf)?;

    if !elf.is_64 || elf.header.e_type != ET_EXEC {
        return Err(LoadError::NotExecutable);
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(LoadError::UnsupportedMachine(elf.header.e_machine));
    }

    let mem_size = mem.len();
    let mut end: u64 = 0;
    let mut tls_size: u64 = 0;

    for ph in &elf.program_headers {
        if ph.p_type == PT_TLS && tls_size == 0 {
            tls_size = ph.p_memsz;
            continue;
        }
        if ph.p_type != PT_LOAD {
            continue;
        }

        let flags = ph.p_flags;
        if flags & PF_W != 0 && flags & PF_X != 0 {
            return Err(LoadError::WxViolation(ph.p_paddr));
        }

        if ph.p_filesz > ph.p_memsz {
            return Err(LoadError::OutOfBounds {
                start: ph.p_paddr,
                end: ph.p_paddr.saturating_add(ph.p_filesz),
                mem_size,
            });
        }

        let seg_start = ph.p_paddr;
        let seg_end = seg_start
            .checked_add(ph.p_memsz)
            .ok_or(LoadError::Overflow)?;
        if seg_start < min_loadaddr || seg_end as usize > mem_size {
            return Err(LoadError::OutOfBounds {
                start: seg_start,
                end: seg_end,
                mem_size,
            });
        }
        let file_end = seg_start
            .checked_add(ph.p_filesz)
            .ok_or(LoadError::Overflow)?;
        if file_end as usize > mem_size {
            return Err(LoadError::OutOfBounds {
                start: seg_start,
                end: file_end,
                mem_size,
            });
        }

        let file_off = ph.p_offset as usize;
        let file_len = ph.p_filesz as usize;
        let src = buf
            .get(file_off..file_off + file_len)
            .ok_or(LoadError::Overflow)?;
        let dst_start = seg_start as usize;
        mem[dst_start..dst_start + file_len].copy_from_slice(src);
        for b in &mut mem[dst_start + file_len..seg_end as usize] {
            *b = 0;
        }

        let mut guest_prot = PROT_NONE;
        if flags & PF_R != 0 {
            guest_prot |= PROT_READ;
        }
        if flags & PF_W != 0 {
            guest_prot |= PROT_WRITE;
        }
        if flags & PF_X != 0 {
            guest_prot |= PROT_EXEC;
        }
        mprotect
            .mprotect(seg_start, seg_end, guest_prot)
            .map_err(LoadError::Mprotect)?;

        let aligned_end = align_up(seg_end, ph.p_align)?;
        end = end.max(aligned_end);
    }

    Ok(LoadResult {
        entry: elf.header.e_entry,
        end,
        tls_size,
    })
}

/// Loads the Solo5-owned manifest NOTE of `note_type` from an ELF file.
/// Returns `Ok(None)` if the binary is otherwise valid but carries no such
/// NOTE (a guest that declares no devices); any other structural problem is
/// a hard error.
///
/// Per `spec.md` §4.1, only PT_NOTE headers containing a single descriptor
/// are supported; internal alignment is stripped from the returned bytes.
pub fn load_note(
    file: &mut dyn Read,
    note_type: u32,
    note_align: usize,
    max_note_size: usize,
) -> Result<Option<Vec<u8>>, LoadError> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let elf = Elf::parse(&buf)?;

    for iter in elf.iter_note_headers(&buf).into_iter() {
        for note in iter {
            let note = note?;
            if note.n_type != note_type {
                continue;
            }
            if note.desc.len() > max_note_size {
                return Err(LoadError::Overflow);
            }
            let _ = note_align; // alignment is implicit in goblin's parsed descriptor
            return Ok(Some(note.desc.to_vec()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMprotect;
    impl GuestMprotect for NullMprotect {
        fn mprotect(&mut self, _start: u64, _end: u64, _prot: i32) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn align_up_rejects_non_power_of_two() {
        assert!(matches!(align_up(10, 3), Err(LoadError::BadAlignment(3))));
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0x1001, 0x1000).unwrap(), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000).unwrap(), 0x1000);
    }

    #[test]
    fn load_elf_rejects_garbage_input() {
        let mut data: &[u8] = b"not an elf file";
        let mut mem = vec![0u8; 4096];
        let mut mp = NullMprotect;
        let err = load_elf(&mut data, &mut mem, 0, &mut mp);
        assert!(err.is_err());
    }
}
