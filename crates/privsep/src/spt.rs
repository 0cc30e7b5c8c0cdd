//! `spt` privilege reduction: seccomp-BPF filter synthesis and load.
//!
//! Keeps the teacher's `libseccomp` dependency rather than switching to
//! `seccompiler` (see `DESIGN.md`): `ScmpFilterContext::export_bpf` maps
//! directly onto `spec.md` §4.9 step 4 ("export the compiled BPF program to
//! an anonymous `memfd_create` fd... cannot `seccomp_load()` directly
//! because libseccomp uses `malloc`/`brk`").

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{FromRawFd, RawFd};

use libseccomp::{error::SeccompError, ScmpAction, ScmpArgCompare, ScmpCompareOp, ScmpFilterContext, ScmpSyscall};
use tracing::info;

/// Core allow-rules every spt tender needs regardless of attached devices:
/// stdout writes, clean exit, the two fds exposed to the guest for direct
/// `poll`, the monotonic/wall clock, and `arch_prctl` for TLS setup.
const CORE_SYSCALLS: &[&str] = &[
    "write",
    "exit_group",
    "epoll_pwait",
    "timerfd_settime",
    "clock_gettime",
    "arch_prctl",
];

/// Largest BPF program this workspace will read back from the memfd into
/// its stack buffer. A spt filter with a handful of devices comfortably
/// fits; exceeding this is treated as a (very unlikely) build error rather
/// than silently truncating the filter.
const MAX_BPF_PROGRAM_BYTES: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SeccompBuildError {
    #[error("libseccomp error: {0}")]
    Seccomp(#[from] SeccompError),
    #[error("memfd_create failed: {0}")]
    Memfd(std::io::Error),
    #[error("compiled BPF program ({0} bytes) exceeds the {MAX_BPF_PROGRAM_BYTES}-byte stack buffer")]
    ProgramTooLarge(usize),
    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(std::io::Error),
    #[error("seccomp(SECCOMP_SET_MODE_FILTER) failed: {0}")]
    SetModeFilter(std::io::Error),
}

/// Raw kernel `struct sock_filter`: one classic-BPF instruction.
#[repr(C)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

/// Raw kernel `struct sock_fprog`.
#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

/// A seccomp filter under construction. Allow-rules accumulate here; call
/// [`SeccompFilter::compile_and_load`] once, after every device module has
/// registered its fds, to synthesize, export, and install the final BPF
/// program.
pub struct SeccompFilter {
    ctx: ScmpFilterContext,
}

impl SeccompFilter {
    /// `seccomp_init(KILL)`: every syscall not explicitly allowed below
    /// kills the process.
    pub fn new() -> Result<Self, SeccompBuildError> {
        let ctx = ScmpFilterContext::new_filter(ScmpAction::KillProcess)?;
        Ok(SeccompFilter { ctx })
    }

    /// Adds the fixed set of allow-rules every spt tender needs.
    pub fn add_core_rules(&mut self, epollfd: RawFd, timerfd: RawFd) -> Result<(), SeccompBuildError> {
        for name in CORE_SYSCALLS {
            let syscall = ScmpSyscall::from_name(name)?;
            match *name {
                "epoll_pwait" => self.ctx.add_rule_conditional(
                    ScmpAction::Allow,
                    syscall,
                    &[ScmpArgCompare::new(0, ScmpCompareOp::Equal, epollfd as u64)],
                )?,
                "timerfd_settime" => self.ctx.add_rule_conditional(
                    ScmpAction::Allow,
                    syscall,
                    &[ScmpArgCompare::new(0, ScmpCompareOp::Equal, timerfd as u64)],
                )?,
                "write" => self.ctx.add_rule_conditional(
                    ScmpAction::Allow,
                    syscall,
                    &[ScmpArgCompare::new(0, ScmpCompareOp::Equal, 1)],
                )?,
                _ => self.ctx.add_rule(ScmpAction::Allow, syscall)?,
            }
        }
        Ok(())
    }

    /// Scopes `pread64`/`pwrite64` to exactly `fd`, a fixed `block_size`,
    /// and offsets that leave room for one full block within `capacity`.
    pub fn add_block_rules(
        &mut self,
        fd: RawFd,
        block_size: u64,
        capacity: u64,
    ) -> Result<(), SeccompBuildError> {
        let max_offset = capacity.saturating_sub(block_size);
        for name in ["pread64", "pwrite64"] {
            let syscall = ScmpSyscall::from_name(name)?;
            self.ctx.add_rule_conditional(
                ScmpAction::Allow,
                syscall,
                &[
                    ScmpArgCompare::new(0, ScmpCompareOp::Equal, fd as u64),
                    ScmpArgCompare::new(2, ScmpCompareOp::Equal, block_size),
                    ScmpArgCompare::new(3, ScmpCompareOp::LessEqual, max_offset),
                ],
            )?;
        }
        Ok(())
    }

    /// Scopes `read`/`write` to exactly `fd`, for a net device's tap fd.
    pub fn add_net_rules(&mut self, fd: RawFd) -> Result<(), SeccompBuildError> {
        for name in ["read", "write"] {
            let syscall = ScmpSyscall::from_name(name)?;
            self.ctx.add_rule_conditional(
                ScmpAction::Allow,
                syscall,
                &[ScmpArgCompare::new(0, ScmpCompareOp::Equal, fd as u64)],
            )?;
        }
        Ok(())
    }

    /// Compiles the filter, exports it to an anonymous `memfd`, reads the
    /// program back into a stack buffer, drops the libseccomp context
    /// (releasing its heap state), then installs the filter via
    /// `PR_SET_NO_NEW_PRIVS` + `SECCOMP_SET_MODE_FILTER`. Never returns on
    /// success in practice (the next instruction after loading the filter
    /// is the jump to guest entry), but returns `Ok(())` so callers can
    /// sequence it before that jump explicitly.
    pub fn compile_and_load(self) -> Result<(), SeccompBuildError> {
        let memfd = create_memfd()?;
        // SAFETY: `memfd` is a freshly created, owned fd from memfd_create.
        let mut file = unsafe { std::fs::File::from_raw_fd(memfd) };

        self.ctx.export_bpf(&mut file)?;
        file.flush().ok();
        file.seek(SeekFrom::Start(0)).map_err(SeccompBuildError::Memfd)?;

        let mut stack_buf = [0u8; MAX_BPF_PROGRAM_BYTES];
        let mut len = 0usize;
        loop {
            let n = file.read(&mut stack_buf[len..]).map_err(SeccompBuildError::Memfd)?;
            if n == 0 {
                break;
            }
            len += n;
            if len == stack_buf.len() {
                return Err(SeccompBuildError::ProgramTooLarge(len + 1));
            }
        }
        drop(file); // closes memfd
        drop(self.ctx); // releases libseccomp's own heap state

        install_filter(&stack_buf[..len])?;
        info!(bytes = len, "seccomp filter installed");
        Ok(())
    }
}

fn create_memfd() -> Result<RawFd, SeccompBuildError> {
    let name = std::ffi::CString::new("solo5-spt-seccomp").unwrap();
    // SAFETY: FFI call with a valid NUL-terminated name and no special flags.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        Err(SeccompBuildError::Memfd(std::io::Error::last_os_error()))
    } else {
        Ok(fd)
    }
}

fn install_filter(prog: &[u8]) -> Result<(), SeccompBuildError> {
    assert_eq!(prog.len() % 8, 0, "BPF program must be a whole number of instructions");
    let n_instrs = (prog.len() / 8) as u16;

    // SAFETY: PR_SET_NO_NEW_PRIVS takes no pointer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SeccompBuildError::NoNewPrivs(std::io::Error::last_os_error()));
    }

    let fprog = SockFprog {
        len: n_instrs,
        filter: prog.as_ptr() as *const SockFilter,
    };
    // SAFETY: `fprog.filter` points at `prog`, which outlives this call;
    // `fprog` is a valid `sock_fprog` for the duration of the syscall.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            1u32, /* SECCOMP_SET_MODE_FILTER */
            0u32,
            &fprog as *const SockFprog,
        )
    };
    if rc != 0 {
        return Err(SeccompBuildError::SetModeFilter(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn core_syscall_names_are_unique() {
        let set: HashSet<&str> = CORE_SYSCALLS.iter().copied().collect();
        assert_eq!(set.len(), CORE_SYSCALLS.len());
    }

    #[test]
    fn sock_filter_instruction_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<SockFilter>(), 8);
    }
}
