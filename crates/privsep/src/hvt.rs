//! `hvt` privilege reduction. Unlike `spt`, `hvt`'s confinement is provided
//! by the hypervisor boundary itself; what remains is platform-specific
//! hardening applied just before the VCPU loop starts.
//!
//! This workspace targets Linux/KVM, so only [`LinuxKvmGuard`] is built.
//! FreeBSD capsicum and OpenBSD pledge/chroot are modeled as a documented
//! trait contract so the shape of the `hvt` privilege-reduction story is
//! complete even though only one platform is implemented (see
//! `DESIGN.md`'s decision on this Open Question-adjacent scoping choice).

#[derive(Debug, thiserror::Error)]
pub enum PrivError {
    #[error("personality() could not be read: {0}")]
    Personality(std::io::Error),
    #[error("refusing to run: process personality has READ_IMPLIES_EXEC set")]
    ReadImpliesExec,
    #[error("privilege reduction not implemented on this platform")]
    Unsupported,
}

/// A backend-specific privilege-reduction step run once, after guest memory
/// is set up and all host resources are acquired, before the VCPU loop.
pub trait PrivilegeDrop {
    fn drop_privileges(&mut self) -> Result<(), PrivError>;
}

/// `hvt/Linux (KVM)`: no sandbox beyond the hypervisor boundary. The tender
/// only checks that `personality()` does not have `READ_IMPLIES_EXEC` set,
/// refusing to run otherwise.
pub struct LinuxKvmGuard;

impl PrivilegeDrop for LinuxKvmGuard {
    fn drop_privileges(&mut self) -> Result<(), PrivError> {
        // SAFETY: personality(0xffffffff) is the documented "query current
        // personality" form and takes no pointer arguments.
        let current = unsafe { libc::personality(0xffffffff) };
        if current < 0 {
            return Err(PrivError::Personality(std::io::Error::last_os_error()));
        }
        if current as libc::c_ulong & read_implies_exec_bit() != 0 {
            return Err(PrivError::ReadImpliesExec);
        }
        Ok(())
    }
}

/// `ADDR_NO_RANDOMIZE`/`READ_IMPLIES_EXEC` live in `<sys/personality.h>`,
/// not exposed by the `libc` crate; the bit value is stable across Linux
/// versions.
fn read_implies_exec_bit() -> libc::c_ulong {
    0x0004_0000
}

/// `hvt/FreeBSD`: `cap_rights_limit` the vmfd to the ioctls actually used,
/// then `cap_enter()`. Not built on this (Linux-only) workspace; documented
/// here as the contract a FreeBSD backend would implement.
pub struct FreeBsdCapsicumGuard;

impl PrivilegeDrop for FreeBsdCapsicumGuard {
    fn drop_privileges(&mut self) -> Result<(), PrivError> {
        Err(PrivError::Unsupported)
    }
}

/// `hvt/OpenBSD`: chroot to `_vmd`'s home, `setresuid`/`setresgid`, then
/// `pledge("stdio vmm")`. Not built on this (Linux-only) workspace.
pub struct OpenBsdPledgeGuard;

impl PrivilegeDrop for OpenBsdPledgeGuard {
    fn drop_privileges(&mut self) -> Result<(), PrivError> {
        Err(PrivError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_implies_exec_bit_is_nonzero() {
        assert_ne!(read_implies_exec_bit(), 0);
    }

    #[test]
    fn unsupported_guards_report_unsupported() {
        assert!(matches!(
            FreeBsdCapsicumGuard.drop_privileges(),
            Err(PrivError::Unsupported)
        ));
        assert!(matches!(
            OpenBsdPledgeGuard.drop_privileges(),
            Err(PrivError::Unsupported)
        ));
    }
}
