//! `tender`: loads a Solo5 unikernel image, validates its manifest, attaches
//! the devices the command line names, drops privileges, and (on every real
//! backend) hands off to the VCPU loop. Architecture glue — bringing up and
//! entering the VCPU (component C10) — is explicitly out of scope for this
//! workspace (`spec.md` §2); `run` completes every other startup step and
//! then reports that directly rather than pretending to boot the guest.

mod bootinfo;
mod cli;
mod dispatch;
mod error;
mod layout;
mod sched;

use std::fs::File;
use std::io::{Cursor, Read};
use std::process::ExitCode;

use bootinfo::BootInfo;
use device_modules::block::BlockModule;
use device_modules::dumpcore::DumpcoreModule;
use device_modules::net::NetModule;
use device_modules::DeviceModule;
use elf_loader::GuestMprotect;
use error::TenderError;
use hypercall_abi::GuestAddr;
use mft::Manifest;
use privsep::{PrivilegeDrop, SeccompFilter};
use sched::LinuxEpollWaitSet;

/// This workspace copies `PT_LOAD` segments straight into a host-`Vec<u8>`
/// guest memory buffer; there is no separate guest address space to apply
/// page protections to, so the callback is a no-op (`spec.md` §3's W^X
/// enforcement is still checked by `elf_loader::load_elf` itself).
struct NullMprotect;
impl GuestMprotect for NullMprotect {
    fn mprotect(&mut self, _start: u64, _end: u64, _prot: i32) -> Result<(), String> {
        Ok(())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match cli::parse(argv) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("tender: {e}");
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => unreachable!("run() never returns Ok: architecture glue is out of scope"),
        Err(TenderError::ArchitectureGlueUnimplemented) => {
            tracing::info!("setup complete; guest entry is out of scope for this workspace");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "tender aborted");
            ExitCode::from(1)
        }
    }
}

/// Runs every startup step `spec.md` §4/§8 describes, in order: ELF load,
/// manifest validation, device attachment, privilege reduction, then
/// (unreachable here) VCPU entry. Always returns `Err` — see module doc.
fn run(args: cli::Cli) -> Result<(), TenderError> {
    let mem_size = layout::round_down_to_page(args.mem_mib.saturating_mul(1024 * 1024));
    if mem_size < layout::MFT_BASE + mft::MFT_NOTE_MAX_SIZE as u64 {
        return Err(TenderError::Abort(format!(
            "--mem={} is too small to hold the fixed boot-info/cmdline/manifest region",
            args.mem_mib
        )));
    }
    let mut mem = vec![0u8; mem_size as usize];
    tracing::info!(mem_size, kernel = %args.kernel.display(), "starting tender");

    let mut kernel_bytes = Vec::new();
    File::open(&args.kernel)?.read_to_end(&mut kernel_bytes)?;

    let mut mprotect = NullMprotect;
    let load_result = elf_loader::load_elf(
        &mut Cursor::new(&kernel_bytes),
        &mut mem,
        layout::MIN_LOADADDR,
        &mut mprotect,
    )?;
    tracing::debug!(entry = load_result.entry, end = load_result.end, "guest image loaded");

    let note = elf_loader::load_note(
        &mut Cursor::new(&kernel_bytes),
        mft::MFT_NOTE_TYPE,
        mft::MFT_NOTE_ALIGN,
        mft::MFT_NOTE_MAX_SIZE,
    )?;
    let mut manifest = match &note {
        Some(bytes) => Manifest::parse(bytes)?,
        None => Manifest::empty(0)?,
    };

    let mut block = BlockModule::new();
    let mut net = NetModule::new();
    let mut dumpcore = DumpcoreModule::new();

    for dev in &args.device_args {
        let consumed = block.handle_cmdarg(&mut manifest, &dev.module, &dev.value)?
            || net.handle_cmdarg(&mut manifest, &dev.module, &dev.value)?;
        if !consumed {
            return Err(TenderError::Abort(format!(
                "unrecognized device flag --{}:{}",
                dev.module, dev.value
            )));
        }
    }
    if let Some(dir) = &args.dumpcore_dir {
        dumpcore.handle_cmdarg(&mut manifest, "dumpcore", &dir.to_string_lossy())?;
    }

    manifest
        .check_fully_attached()
        .map_err(TenderError::Abort)?;

    let waitset = LinuxEpollWaitSet::new()?;
    let epollfd = waitset.epollfd();
    let timerfd = waitset.timerfd();

    let mut seccomp = SeccompFilter::new()?;
    seccomp.add_core_rules(epollfd, timerfd)?;

    let block_regs = block.setup(&manifest, Some(&mut seccomp))?;
    let net_regs = net.setup(&manifest, Some(&mut seccomp))?;
    dumpcore.setup(&manifest, Some(&mut seccomp))?;

    let mut tender = dispatch::Tender::new(mem, waitset);
    tender.bind_manifest(&manifest);

    // Component C9: lay out the boot-info block, guest command line, and a
    // copy of the validated manifest at their fixed addresses. None of this
    // needs the out-of-scope VCPU (C10) — only a write into guest memory —
    // so it runs on the real startup path rather than only under test.
    let cmdline = args.guest_args.join(" ");
    if cmdline.len() + 1 > layout::CMDLINE_MAX {
        return Err(TenderError::Abort(format!(
            "guest command line ({} bytes) exceeds the {}-byte limit",
            cmdline.len(),
            layout::CMDLINE_MAX
        )));
    }
    let cmdline_base = layout::CMDLINE_BASE as usize;
    tender.mem_mut()[cmdline_base..cmdline_base + cmdline.len()].copy_from_slice(cmdline.as_bytes());
    tender.mem_mut()[cmdline_base + cmdline.len()] = 0;

    let mft_addr = match &note {
        Some(bytes) => {
            let mft_base = layout::MFT_BASE as usize;
            tender.mem_mut()[mft_base..mft_base + bytes.len()].copy_from_slice(bytes);
            GuestAddr(layout::MFT_BASE)
        }
        None => GuestAddr::NULL,
    };

    let boot_info = BootInfo {
        mem_size,
        kernel_end: load_result.end,
        cpu_cycle_freq: bootinfo::calibrate_cpu_cycle_freq(),
        mft: mft_addr,
        cmdline: GuestAddr(layout::CMDLINE_BASE),
        spt_epollfd: Some(epollfd),
        spt_timerfd: Some(timerfd),
    };
    let boot_info_base = layout::BOOT_INFO_BASE as usize;
    boot_info.write_to(&mut tender.mem_mut()[boot_info_base..]);

    for reg in block_regs.into_iter().chain(net_regs) {
        if let Some(handle) = manifest
            .entries()
            .iter()
            .position(|e| e.hostfd == Some(reg.fd))
        {
            tender.register_wait(handle as u64, reg.fd)?;
        }
    }

    if dumpcore.enabled() {
        // A real write_core() call needs the VCPU's register snapshot and
        // mincore()-derived touched-page bitmap, neither of which exists
        // without component C10; this hook only reports that a dump would
        // have been taken, at the directory the user asked for.
        let dir = dumpcore.dir().expect("enabled() implies dir is set").display().to_string();
        tender.register_halt_hook(Box::new(move |exit_status, _cookie| {
            if exit_status == 255 {
                tracing::warn!(exit_status, dir = %dir, "guest aborted; dumpcore would fire here");
            }
        }));
    }

    // The spt allow-list filter is fully synthesized above (core rules plus
    // every device module's fd-scoped rules), matching spec.md §4.9 step 3.
    // It is deliberately not installed here: `compile_and_load` leaves no
    // syscall but the jump to guest entry available, and that jump
    // (component C10) does not exist in this workspace — installing the
    // filter now would have the kernel kill this process on its next log
    // line. `hvt`/Linux's check, which only inspects process state and
    // performs no further syscalls on success, is the one privilege-
    // reduction step this binary can safely run to completion.
    drop(seccomp);
    privsep::LinuxKvmGuard.drop_privileges().map_err(TenderError::Priv)?;

    Err(TenderError::ArchitectureGlueUnimplemented)
}

/// End-to-end scenarios from `spec.md` §8, exercised against the real
/// crates wired together the way `run` wires them — minus ELF loading
/// (which `elf_loader`'s own tests already cover against real binaries).
#[cfg(test)]
mod tests {
    use super::*;
    use device_modules::block::{block_io, BlockOp, BLOCK_SIZE};
    use hypercall_abi::{GuestAddr, Solo5Result};
    use mft::{MftParams, MftType};
    use std::os::fd::{AsRawFd, FromRawFd};

    fn write_u64(mem: &mut [u8], off: usize, v: u64) {
        mem[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Scenario: a manifest declares a device the command line never
    /// attached. Startup must abort before any hypercall can be dispatched.
    #[test]
    fn manifest_declaring_an_unattached_device_aborts_startup() {
        let mut m = Manifest::empty(4).unwrap();
        m.declare(
            "eth",
            MftType::NetBasic,
            MftParams::NetBasic { mac: [0; 6], mtu: 1500 },
        )
        .unwrap();
        assert!(m.check_fully_attached().is_err());
    }

    /// Scenario: block write then read back through the real dispatch path
    /// (not `block_io` called directly — through `Tender::dispatch_block_io`,
    /// exercising GPA validation and the handle table together).
    #[test]
    fn block_write_then_read_round_trips_through_dispatch() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        disk.as_file().set_len(4096).unwrap();
        let fd = disk.as_file().as_raw_fd();

        let mut manifest = Manifest::empty(4).unwrap();
        manifest
            .declare(
                "disk",
                MftType::BlockBasic,
                MftParams::BlockBasic { capacity: 4096, block_size: BLOCK_SIZE as u16 },
            )
            .unwrap();
        let entry = manifest.get_by_name_mut("disk", None).unwrap();
        entry.attached = true;
        entry.hostfd = Some(fd);

        struct NoopWaitSet;
        impl sched::WaitSet for NoopWaitSet {
            fn register(&mut self, _h: u64, _fd: std::os::fd::RawFd) -> Result<(), sched::SchedError> {
                Ok(())
            }
            fn poll(&mut self, _t: u64) -> Result<u64, sched::SchedError> {
                Ok(0)
            }
        }

        let mut tender = dispatch::Tender::new(vec![0u8; 8192], NoopWaitSet);
        tender.bind_manifest(&manifest);

        let handle = manifest.entries().iter().position(|e| e.name == "disk").unwrap() as u64;

        // BlockIoRequest at gpa 0: handle, offset, data_gpa=1024, len=512
        write_u64(tender.mem_mut(), 0, handle);
        write_u64(tender.mem_mut(), 8, 0);
        write_u64(tender.mem_mut(), 16, 1024);
        write_u64(tender.mem_mut(), 24, BLOCK_SIZE);
        tender.mem_mut()[1024..1024 + BLOCK_SIZE as usize].fill(0xAB);

        tender.dispatch_block_io(GuestAddr(0), BlockOp::Write).unwrap();
        let ret = u32::from_le_bytes(tender.mem_mut()[32..36].try_into().unwrap());
        assert_eq!(ret, Solo5Result::Ok as u32);

        // Clear the guest buffer, issue a read of the same block, and check
        // it comes back unchanged from what block_io wrote directly.
        tender.mem_mut()[1024..1024 + BLOCK_SIZE as usize].fill(0);
        tender.dispatch_block_io(GuestAddr(0), BlockOp::Read).unwrap();
        assert!(tender.mem_mut()[1024..1024 + BLOCK_SIZE as usize]
            .iter()
            .all(|&b| b == 0xAB));

        // Sanity: matches what block_io would do called directly.
        let mut direct_buf = [0u8; BLOCK_SIZE as usize];
        assert_eq!(block_io(fd, 4096, BlockOp::Read, 0, &mut direct_buf), Solo5Result::Ok);
        assert!(direct_buf.iter().all(|&b| b == 0xAB));
    }

    /// Scenario: net write then read through dispatch, backed by a
    /// connected `socketpair` standing in for a tap fd.
    #[test]
    fn net_write_then_read_round_trips_through_dispatch() {
        let mut fds = [0i32; 2];
        // SAFETY: valid output buffer of the required size.
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);

        let mut manifest = Manifest::empty(4).unwrap();
        manifest
            .declare(
                "eth",
                MftType::NetBasic,
                MftParams::NetBasic { mac: [0; 6], mtu: 1500 },
            )
            .unwrap();
        let entry = manifest.get_by_name_mut("eth", None).unwrap();
        entry.attached = true;
        entry.hostfd = Some(fds[0]);

        struct NoopWaitSet;
        impl sched::WaitSet for NoopWaitSet {
            fn register(&mut self, _h: u64, _fd: std::os::fd::RawFd) -> Result<(), sched::SchedError> {
                Ok(())
            }
            fn poll(&mut self, _t: u64) -> Result<u64, sched::SchedError> {
                Ok(0)
            }
        }

        let mut tender = dispatch::Tender::new(vec![0u8; 8192], NoopWaitSet);
        tender.bind_manifest(&manifest);
        let handle = manifest.entries().iter().position(|e| e.name == "eth").unwrap() as u64;

        let frame = b"hello-guest-frame";
        write_u64(tender.mem_mut(), 0, handle);
        write_u64(tender.mem_mut(), 8, 1024);
        write_u64(tender.mem_mut(), 16, frame.len() as u64);
        tender.mem_mut()[1024..1024 + frame.len()].copy_from_slice(frame);

        tender.dispatch_net_write(GuestAddr(0)).unwrap();

        // Read it back on the peer end directly, confirming the frame
        // actually crossed the socketpair (dispatch wrote to fds[0], the
        // peer reads from fds[1]).
        let mut peer = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], frame);

        unsafe { libc::close(fds[0]) };
    }

    /// Scenario: poll with nothing registered times out and reports an
    /// empty ready set, exercised through the real `LinuxEpollWaitSet`.
    #[test]
    fn poll_dispatch_times_out_with_empty_ready_set() {
        let waitset = LinuxEpollWaitSet::new().unwrap();
        let mut tender = dispatch::Tender::new(vec![0u8; 4096], waitset);

        write_u64(tender.mem_mut(), 0, 1_000_000); // 1ms timeout
        tender.dispatch_poll(GuestAddr(0)).unwrap();
        let ready = u64::from_le_bytes(tender.mem_mut()[8..16].try_into().unwrap());
        assert_eq!(ready, 0);
    }
}
