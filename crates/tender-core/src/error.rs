//! `TenderError`: the single tender-internal error type. Every variant is
//! fatal — per `spec.md` §7, tender-side failures are never recoverable;
//! `main` logs the diagnostic and exits 1 (or 255 for a guest-forced abort
//! exit, handled separately in `dispatch`).

#[derive(Debug, thiserror::Error)]
pub enum TenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load guest ELF image: {0}")]
    Elf(#[from] elf_loader::LoadError),
    #[error("invalid manifest: {0}")]
    Mft(#[from] mft::MftError),
    #[error("device setup failed: {0}")]
    Device(#[from] device_modules::DeviceError),
    #[error("seccomp filter construction failed: {0}")]
    Seccomp(#[from] privsep::SeccompBuildError),
    #[error("poll/wait scheduler setup failed: {0}")]
    Sched(#[from] crate::sched::SchedError),
    #[error("privilege reduction failed: {0}")]
    Priv(#[from] privsep::PrivError),
    #[error("{0}")]
    Abort(String),
    #[error("architecture glue (VCPU bring-up and entry) is out of scope for this workspace; see spec component C10")]
    ArchitectureGlueUnimplemented,
}
