//! Privilege reduction (component C6): `spt` seccomp-BPF filter synthesis
//! and `hvt` platform hardening.

pub mod hvt;
pub mod spt;

pub use hvt::{FreeBsdCapsicumGuard, LinuxKvmGuard, OpenBsdPledgeGuard, PrivError, PrivilegeDrop};
pub use spt::{SeccompBuildError, SeccompFilter};
