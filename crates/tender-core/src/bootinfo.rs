//! Boot-info construction (component C9): the `hvt_boot_info`/`spt_boot_info`
//! equivalent structure laid out at a fixed guest address, per `spec.md` §3.

use hypercall_abi::GuestAddr;

use crate::layout;

/// Wire-compatible boot-info block. Laid out by hand (rather than derived
/// from a `#[repr(C)]` struct copied byte-for-byte) because, unlike the
/// hypercall request structs in `hypercall-abi`, nothing on the guest side
/// reads this back through Rust in this workspace — only a byte layout
/// needs to agree.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub mem_size: u64,
    pub kernel_end: u64,
    pub cpu_cycle_freq: u64,
    pub mft: GuestAddr,
    pub cmdline: GuestAddr,
    /// `spt` only: the fds handed to the guest for direct `epoll_pwait`/
    /// `timerfd_settime` calls (`spec.md` §4.4). `None` on hvt.
    pub spt_epollfd: Option<i32>,
    pub spt_timerfd: Option<i32>,
}

const WIRE_LEN: usize = 8 * 6; // mem_size, kernel_end, cpu_cycle_freq, mft, cmdline, spt fds (packed into one u64)

impl BootInfo {
    /// Serializes this boot-info into `dst` (a slice of guest memory at
    /// `layout::BOOT_INFO_BASE`), little-endian, matching the hypercall
    /// ABI's convention (`hypercall-abi`'s structs are also LE-native on
    /// every architecture this workspace targets).
    pub fn write_to(&self, dst: &mut [u8]) {
        assert!(dst.len() >= WIRE_LEN, "boot-info buffer too small");
        dst[0..8].copy_from_slice(&self.mem_size.to_le_bytes());
        dst[8..16].copy_from_slice(&self.kernel_end.to_le_bytes());
        dst[16..24].copy_from_slice(&self.cpu_cycle_freq.to_le_bytes());
        dst[24..32].copy_from_slice(&self.mft.0.to_le_bytes());
        dst[32..40].copy_from_slice(&self.cmdline.0.to_le_bytes());
        let spt_fds = (self.spt_epollfd.unwrap_or(-1) as u64 & 0xffff_ffff)
            | ((self.spt_timerfd.unwrap_or(-1) as u64 & 0xffff_ffff) << 32);
        dst[40..48].copy_from_slice(&spt_fds.to_le_bytes());
    }
}

/// Calibrates the TSC (or equivalent monotonic counter) frequency in Hz by
/// timing a fixed number of ticks against the wall clock. Real hardware
/// would read this once at startup and trust it for the VM's lifetime;
/// this workspace has no VCPU to hand it to (see `error::TenderError::
/// ArchitectureGlueUnimplemented`), but C9 still owns computing the value.
#[cfg(target_arch = "x86_64")]
pub fn calibrate_cpu_cycle_freq() -> u64 {
    use std::time::{Duration, Instant};

    // SAFETY: `_rdtsc` is a read-only timestamp-counter instruction
    // available on every x86_64 target this workspace builds for.
    let start_cycles = unsafe { std::arch::x86_64::_rdtsc() };
    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(10));
    let end_cycles = unsafe { std::arch::x86_64::_rdtsc() };
    let elapsed = start.elapsed();

    let cycles = end_cycles.saturating_sub(start_cycles);
    let nanos = elapsed.as_nanos().max(1) as u64;
    cycles.saturating_mul(1_000_000_000) / nanos
}

#[cfg(not(target_arch = "x86_64"))]
pub fn calibrate_cpu_cycle_freq() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields_through_the_wire_buffer() {
        let info = BootInfo {
            mem_size: 512 * 1024 * 1024,
            kernel_end: 0x20_0000,
            cpu_cycle_freq: 3_000_000_000,
            mft: GuestAddr(layout::MFT_BASE),
            cmdline: GuestAddr(layout::CMDLINE_BASE),
            spt_epollfd: Some(7),
            spt_timerfd: Some(8),
        };
        let mut buf = vec![0u8; WIRE_LEN];
        info.write_to(&mut buf);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), info.mem_size);
        assert_eq!(
            u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            layout::MFT_BASE
        );
        let spt_fds = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        assert_eq!(spt_fds as u32 as i32, 7);
        assert_eq!((spt_fds >> 32) as u32 as i32, 8);
    }
}
