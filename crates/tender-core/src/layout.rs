//! Guest memory layout constants (`spec.md` §3): fixed addresses reserved
//! below the guest image for the structures the architecture glue (C10,
//! out of scope here) and the boot-info block need.

/// Architecture page size this workspace rounds `--mem` to. `spec.md` §3
/// calls this "2 MiB on x86_64" (the large-page granularity hvt's EPT
/// setup uses), not the normal 4 KiB page.
pub const PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Default `--mem` size when unset.
pub const DEFAULT_MEM_SIZE: u64 = 512 * 1024 * 1024;

/// Lowest page (`[0, 4 KiB)`) is never used, matching the original's
/// "zero page" convention.
pub const ZERO_PAGE_SIZE: u64 = 4096;

/// The boot-info block lives at a fixed low address, below the guest
/// image.
pub const BOOT_INFO_BASE: u64 = ZERO_PAGE_SIZE;

/// Guest command line is copied after the boot-info block, bounded to 8 KiB.
pub const CMDLINE_BASE: u64 = BOOT_INFO_BASE + 4096;
pub const CMDLINE_MAX: usize = 8192;

/// A copy of the validated manifest is placed after the command line.
pub const MFT_BASE: u64 = CMDLINE_BASE + CMDLINE_MAX as u64;

/// The guest ELF image itself is never loaded below this address, leaving
/// room for the fixed low-memory structures above.
pub const MIN_LOADADDR: u64 = 0x10_0000;

/// Guest stack grows down from `mem_size - STACK_TOP_GAP`.
pub const STACK_TOP_GAP: u64 = 8;

/// Rounds `mem_size` down to `PAGE_SIZE`, per `spec.md` §6 `--mem` handling.
pub fn round_down_to_page(mem_size: u64) -> u64 {
    mem_size - (mem_size % PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_down_to_page_granularity() {
        assert_eq!(round_down_to_page(PAGE_SIZE + 1), PAGE_SIZE);
        assert_eq!(round_down_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_down_to_page(PAGE_SIZE - 1), 0);
    }

    #[test]
    fn fixed_addresses_do_not_overlap_min_loadaddr() {
        assert!(MFT_BASE + mft::MFT_NOTE_MAX_SIZE as u64 <= MIN_LOADADDR);
    }
}
