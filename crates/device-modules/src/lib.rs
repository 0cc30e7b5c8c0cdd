//! Device modules (component C5): `NET_BASIC`/`BLOCK_BASIC` cmdline
//! attachment and the block/net hypercall semantics, plus `dumpcore`.
//!
//! Grounded on `examples/original_source/tenders/hvt/hvt_module_{blk,net,
//! dumpcore}.c` and `tenders/spt/spt_module_{block,net}.c`: each module owns
//! its own `--FLAG:NAME=VALUE` cmdline syntax, attaches a host resource into
//! a manifest entry, and (on `spt`) scopes a seccomp filter to exactly the
//! fds/offsets it will touch.

pub mod block;
pub mod dumpcore;
pub mod net;

use std::os::fd::RawFd;

use mft::Manifest;
use privsep::SeccompFilter;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("malformed device argument {0:?}")]
    BadArgument(String),
    #[error("manifest declares no device named {0:?} of the expected type")]
    UnknownDevice(String),
    #[error("device {0:?} is already attached")]
    AlreadyAttached(String),
    #[error("I/O error attaching device: {0}")]
    Io(String),
    #[error("seccomp rule registration failed: {0}")]
    Seccomp(String),
}

/// A host fd a device module wants the poll/wait scheduler to watch.
/// `handle` is filled in by `tender-core` with the owning manifest entry's
/// index once devices are assigned their final slots; modules themselves
/// only know the fd.
#[derive(Debug, Clone, Copy)]
pub struct PollRegistration {
    pub fd: RawFd,
    pub handle: u64,
}

/// Common shape every device module (`block`, `net`) implements, mirroring
/// the `{setup, handle_cmdarg, usage}` triad the original tenders register
/// per module (see `hvt_main.c`'s module table).
pub trait DeviceModule {
    /// Short name used in `--help` and error messages (e.g. `"block"`).
    fn name(&self) -> &'static str;

    /// One-line usage string for `--help`.
    fn usage(&self) -> &'static str;

    /// Handles one `--FLAG:NAME=VALUE`-shaped cmdline argument. `flag` is
    /// the part before `:`. Returns `Ok(true)` if this module recognized
    /// and consumed the flag, `Ok(false)` if the flag belongs to a
    /// different module.
    fn handle_cmdarg(
        &mut self,
        manifest: &mut Manifest,
        flag: &str,
        value: &str,
    ) -> Result<bool, DeviceError>;

    /// Called once, after all cmdline arguments are processed and the
    /// manifest's attachment state is final: registers seccomp rules (spt
    /// only — `None` on hvt) for every attached fd and returns the set of
    /// fds the poll/wait scheduler should watch.
    fn setup(
        &mut self,
        manifest: &Manifest,
        seccomp: Option<&mut SeccompFilter>,
    ) -> Result<Vec<PollRegistration>, DeviceError>;
}
