//! Hypercall dispatch table (component C4/C3): the tender's half of the
//! hypercall ABI. Each handler reads its request struct out of guest memory
//! by hand, byte-by-byte, through [`hypercall_abi::GuestMemory`] — never by
//! transmuting the backing bytes into a `#[repr(C)]` value, since those
//! bytes are guest-controlled and may not represent a valid Rust value of
//! any particular type (see `DESIGN.md`'s note on this design choice).
//!
//! `spec.md` §4.3: "Dispatch is strictly synchronous: the VCPU is paused
//! while the tender runs the handler." This workspace implements no VCPU
//! (component C10 is out of scope), so `Tender::dispatch` stands in for
//! what would otherwise be invoked from a trap handler: it is safe to call
//! synchronously and performs exactly the bounds-checked work a real
//! dispatch would.

use std::collections::HashMap;
use std::io::Write;

use hypercall_abi::{GpaError, GuestAddr, GuestMemory, Solo5Result};
use mft::{Manifest, MftParams, MftType};

use crate::sched::WaitSet;

/// Byte offsets/lengths of each `#[repr(C)]` request struct in
/// `hypercall-abi`, for the hand-rolled little-endian codec below. Kept in
/// one place since `BlockIoRequest`/`NetIoRequest` both carry trailing
/// padding the codec must skip over.
mod wire {
    pub const HALT_LEN: usize = 16; // exit_status: i32, pad: 4, cookie: u64
    pub const WALLTIME_LEN: usize = 8; // nsecs: u64
    pub const PUTS_LEN: usize = 16; // data: u64, len: u64
    pub const POLL_LEN: usize = 16; // timeout_nsecs: u64, ready_set: u64

    // handle: u64, offset: u64, data: u64, len: u64, ret: u32, pad: 4
    pub const BLOCKIO_LEN: usize = 40;
    pub const BLOCKIO_RET_OFF: usize = 32;

    // handle: u64, data: u64, len: u64, read_size: u64, ret: u32, pad: 4
    pub const NETIO_LEN: usize = 40;
    pub const NETIO_READSIZE_OFF: usize = 24;
    pub const NETIO_RET_OFF: usize = 32;
}

/// A host resource backing one attached manifest entry, keyed by solo5
/// handle (manifest index).
enum DeviceHandle {
    Block { fd: i32, capacity: u64 },
    Net { fd: i32, mtu: u16 },
}

/// One `HALT` observer, called in registration order; this is how
/// `dumpcore` observes abnormal exits (`spec.md` §4.3).
pub type HaltHook = Box<dyn FnMut(i32, Option<&[u8]>)>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid guest pointer: {0}")]
    Gpa(#[from] GpaError),
    #[error("net_write: fatal short write to host tap (expected {expected}, wrote {actual})")]
    ShortNetWrite { expected: usize, actual: usize },
}

/// Result of dispatching one `HALT` hypercall: the tender stops running
/// the guest.
pub struct HaltOutcome {
    pub exit_status: i32,
}

/// Owns guest memory and every attached device handle; exposes one
/// dispatch method per hypercall ID.
pub struct Tender<W: WaitSet> {
    mem: Vec<u8>,
    handles: HashMap<u64, DeviceHandle>,
    halt_hooks: Vec<HaltHook>,
    waitset: W,
}

impl<W: WaitSet> Tender<W> {
    pub fn new(mem: Vec<u8>, waitset: W) -> Self {
        Tender {
            mem,
            handles: HashMap::new(),
            halt_hooks: Vec::new(),
            waitset,
        }
    }

    pub fn mem_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    pub fn register_halt_hook(&mut self, hook: HaltHook) {
        self.halt_hooks.push(hook);
    }

    /// Registers `fd` under `handle` with the poll/wait scheduler. Called
    /// once per attached net device during startup, after manifest indices
    /// are final (`spec.md` §4.4's "handle = manifest index" convention).
    pub fn register_wait(&mut self, handle: u64, fd: std::os::fd::RawFd) -> Result<(), crate::sched::SchedError> {
        self.waitset.register(handle, fd)
    }

    /// Populates the handle table from a fully-attached manifest, matching
    /// each non-sentinel entry's index to its host fd and type-specific
    /// parameters.
    pub fn bind_manifest(&mut self, manifest: &Manifest) {
        for (i, entry) in manifest.entries().iter().enumerate() {
            if i == 0 || !entry.attached {
                continue;
            }
            let Some(fd) = entry.hostfd else { continue };
            let handle = match (entry.ty, entry.params) {
                (MftType::BlockBasic, MftParams::BlockBasic { capacity, .. }) => {
                    DeviceHandle::Block { fd, capacity }
                }
                (MftType::NetBasic, MftParams::NetBasic { mtu, .. }) => {
                    DeviceHandle::Net { fd, mtu }
                }
                _ => continue,
            };
            self.handles.insert(i as u64, handle);
        }
    }

    fn gm(&mut self) -> GuestMemory<'_> {
        GuestMemory::new(&mut self.mem)
    }

    /// `HALT`: reads `{exit_status, cookie}`, runs every registered halt
    /// hook (in registration order) with the cookie bytes if present, and
    /// reports the outcome to the caller. No further hypercalls are
    /// dispatched after this returns (`spec.md` §8 invariant 6).
    pub fn dispatch_halt(&mut self, req_gpa: GuestAddr) -> Result<HaltOutcome, DispatchError> {
        let bytes = self.gm().checked_slice(req_gpa, wire::HALT_LEN)?.to_vec();
        let exit_status = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let cookie_gpa = GuestAddr(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));

        let cookie_bytes = if cookie_gpa.is_null() {
            None
        } else {
            let len = hypercall_abi::HALT_COOKIE_MAX.min(self.mem.len());
            self.gm().checked_slice(cookie_gpa, len).ok().map(<[u8]>::to_vec)
        };

        for hook in &mut self.halt_hooks {
            hook(exit_status, cookie_bytes.as_deref());
        }

        Ok(HaltOutcome { exit_status })
    }

    /// `WALLTIME`: writes host `CLOCK_REALTIME` nanoseconds back into the
    /// request struct's `nsecs` field.
    pub fn dispatch_walltime(&mut self, req_gpa: GuestAddr) -> Result<(), DispatchError> {
        let nsecs = wall_clock_nsecs();
        self.gm()
            .checked_slice_mut(req_gpa, wire::WALLTIME_LEN)?
            .copy_from_slice(&nsecs.to_le_bytes());
        Ok(())
    }

    /// `PUTS`: copies `len` bytes of guest memory to the tender's stdout
    /// verbatim.
    pub fn dispatch_puts(&mut self, req_gpa: GuestAddr) -> Result<(), DispatchError> {
        let header = self.gm().checked_slice(req_gpa, wire::PUTS_LEN)?.to_vec();
        let data_gpa = GuestAddr(u64::from_le_bytes(header[0..8].try_into().unwrap()));
        let len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;

        let data = self.gm().checked_slice(data_gpa, len)?.to_vec();
        std::io::stdout().write_all(&data).ok();
        Ok(())
    }

    /// `POLL`: blocks on the wait-set, writes back `ready_set`.
    pub fn dispatch_poll(&mut self, req_gpa: GuestAddr) -> Result<(), DispatchError> {
        let header = self.gm().checked_slice(req_gpa, wire::POLL_LEN)?.to_vec();
        let timeout_nsecs = u64::from_le_bytes(header[0..8].try_into().unwrap());

        let ready_set = self
            .waitset
            .poll(timeout_nsecs)
            .unwrap_or(0); // scheduler errors surface as "nothing ready", never a dispatch fault

        self.gm()
            .checked_slice_mut(req_gpa, wire::POLL_LEN)?[8..16]
            .copy_from_slice(&ready_set.to_le_bytes());
        Ok(())
    }

    fn block_handle(&self, handle: u64) -> Option<(i32, u64)> {
        match self.handles.get(&handle) {
            Some(DeviceHandle::Block { fd, capacity }) => Some((*fd, *capacity)),
            _ => None,
        }
    }

    fn net_handle(&self, handle: u64) -> Option<(i32, u16)> {
        match self.handles.get(&handle) {
            Some(DeviceHandle::Net { fd, mtu }) => Some((*fd, *mtu)),
            _ => None,
        }
    }

    /// `BLKWRITE`/`BLKREAD`: reads `{handle, offset, data, len}`, performs
    /// the I/O via `device_modules::block::block_io`, writes `ret` back.
    pub fn dispatch_block_io(
        &mut self,
        req_gpa: GuestAddr,
        op: device_modules::block::BlockOp,
    ) -> Result<(), DispatchError> {
        let header = self
            .gm()
            .checked_slice(req_gpa, wire::BLOCKIO_RET_OFF)?
            .to_vec();
        let handle = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let data_gpa = GuestAddr(u64::from_le_bytes(header[16..24].try_into().unwrap()));
        let len = u64::from_le_bytes(header[24..32].try_into().unwrap()) as usize;

        let Some((fd, capacity)) = self.block_handle(handle) else {
            return self.write_block_result(req_gpa, Solo5Result::Einval);
        };

        let ret = {
            let mut gm = self.gm();
            match gm.checked_slice_mut(data_gpa, len) {
                Ok(buf) => device_modules::block::block_io(fd, capacity, op, offset, buf),
                Err(_) => {
                    drop(gm);
                    return self.write_block_result(req_gpa, Solo5Result::Einval);
                }
            }
        };
        self.write_block_result(req_gpa, ret)
    }

    /// `NETWRITE`: reads `{handle, data, len}`, writes the frame. A short
    /// write is fatal (`spec.md` §9 Open Question, resolved in
    /// `DESIGN.md`): it surfaces as a `DispatchError`, not `EUNSPEC`.
    pub fn dispatch_net_write(&mut self, req_gpa: GuestAddr) -> Result<(), DispatchError> {
        let header = self
            .gm()
            .checked_slice(req_gpa, wire::NETIO_READSIZE_OFF)?
            .to_vec();
        let handle = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let data_gpa = GuestAddr(u64::from_le_bytes(header[8..16].try_into().unwrap()));
        let len = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;

        let Some((fd, mtu)) = self.net_handle(handle) else {
            return self.write_net_result(req_gpa, Solo5Result::Einval, 0);
        };
        let frame = self.gm().checked_slice(data_gpa, len)?.to_vec();

        match device_modules::net::net_write(fd, &frame, mtu) {
            device_modules::net::NetWriteOutcome::Ok => {
                self.write_net_result(req_gpa, Solo5Result::Ok, 0)
            }
            device_modules::net::NetWriteOutcome::FrameTooLarge => {
                self.write_net_result(req_gpa, Solo5Result::Einval, 0)
            }
            device_modules::net::NetWriteOutcome::ShortWrite { expected, actual } => {
                Err(DispatchError::ShortNetWrite { expected, actual })
            }
        }
    }

    /// `NETREAD`: reads `{handle, data, len}`, writes back `{read_size, ret}`.
    pub fn dispatch_net_read(&mut self, req_gpa: GuestAddr) -> Result<(), DispatchError> {
        let header = self
            .gm()
            .checked_slice(req_gpa, wire::NETIO_READSIZE_OFF)?
            .to_vec();
        let handle = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let data_gpa = GuestAddr(u64::from_le_bytes(header[8..16].try_into().unwrap()));
        let len = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;

        let Some((fd, _mtu)) = self.net_handle(handle) else {
            return self.write_net_result(req_gpa, Solo5Result::Einval, 0);
        };

        let (ret, n) = {
            let mut gm = self.gm();
            match gm.checked_slice_mut(data_gpa, len) {
                Ok(buf) => device_modules::net::net_read(fd, buf),
                Err(e) => return Err(e.into()),
            }
        };
        self.write_net_result(req_gpa, ret, n)
    }

    fn write_block_result(
        &mut self,
        req_gpa: GuestAddr,
        ret: Solo5Result,
    ) -> Result<(), DispatchError> {
        let off = wire::BLOCKIO_RET_OFF;
        self.gm()
            .checked_slice_mut(req_gpa, wire::BLOCKIO_LEN)?[off..off + 4]
            .copy_from_slice(&(ret as u32).to_le_bytes());
        Ok(())
    }

    fn write_net_result(
        &mut self,
        req_gpa: GuestAddr,
        ret: Solo5Result,
        read_size: usize,
    ) -> Result<(), DispatchError> {
        let bytes = self.gm().checked_slice_mut(req_gpa, wire::NETIO_LEN)?;
        let rs_off = wire::NETIO_READSIZE_OFF;
        bytes[rs_off..rs_off + 8].copy_from_slice(&(read_size as u64).to_le_bytes());
        let ret_off = wire::NETIO_RET_OFF;
        bytes[ret_off..ret_off + 4].copy_from_slice(&(ret as u32).to_le_bytes());
        Ok(())
    }
}

fn wall_clock_nsecs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedError;

    struct NullWaitSet;
    impl WaitSet for NullWaitSet {
        fn register(&mut self, _handle: u64, _fd: i32) -> Result<(), SchedError> {
            Ok(())
        }
        fn poll(&mut self, _timeout_nsecs: u64) -> Result<u64, SchedError> {
            Ok(0)
        }
    }

    fn write_u64(mem: &mut [u8], off: usize, v: u64) {
        mem[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn dispatch_walltime_writes_nonzero_nsecs() {
        let mut t = Tender::new(vec![0u8; 4096], NullWaitSet);
        t.dispatch_walltime(GuestAddr(0)).unwrap();
        let nsecs = u64::from_le_bytes(t.mem_mut()[0..8].try_into().unwrap());
        assert!(nsecs > 0);
    }

    #[test]
    fn dispatch_puts_copies_guest_bytes_to_stdout() {
        let mut mem = vec![0u8; 4096];
        write_u64(&mut mem, 0, 100); // data gpa
        write_u64(&mut mem, 8, 5); // len
        mem[100..105].copy_from_slice(b"hello");
        let mut t = Tender::new(mem, NullWaitSet);
        t.dispatch_puts(GuestAddr(0)).unwrap();
    }

    #[test]
    fn dispatch_block_io_unknown_handle_returns_einval_not_error() {
        let mut mem = vec![0u8; 4096];
        write_u64(&mut mem, 0, 999); // handle
        write_u64(&mut mem, 8, 0); // offset
        write_u64(&mut mem, 16, 200); // data gpa
        write_u64(&mut mem, 24, 512); // len
        let mut t = Tender::new(mem, NullWaitSet);
        t.dispatch_block_io(GuestAddr(0), device_modules::block::BlockOp::Read)
            .unwrap();
        let ret = u32::from_le_bytes(
            t.mem_mut()[wire::BLOCKIO_RET_OFF..wire::BLOCKIO_RET_OFF + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(ret, Solo5Result::Einval as u32);
    }

    #[test]
    fn dispatch_halt_invokes_registered_hooks() {
        let mut mem = vec![0u8; 4096];
        write_u64(&mut mem, 0, 255); // exit_status (low 4 bytes used)
        write_u64(&mut mem, 8, 0); // cookie = NULL
        let mut t = Tender::new(mem, NullWaitSet);

        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        t.register_halt_hook(Box::new(move |status, _cookie| {
            *seen2.borrow_mut() = Some(status);
        }));

        let outcome = t.dispatch_halt(GuestAddr(0)).unwrap();
        assert_eq!(outcome.exit_status, 255);
        assert_eq!(*seen.borrow(), Some(255));
    }

    #[test]
    fn dispatch_net_read_unknown_handle_returns_einval() {
        let mut mem = vec![0u8; 4096];
        write_u64(&mut mem, 0, 999); // handle
        write_u64(&mut mem, 8, 200); // data gpa
        write_u64(&mut mem, 16, 64); // len
        let mut t = Tender::new(mem, NullWaitSet);
        t.dispatch_net_read(GuestAddr(0)).unwrap();
        let ret = u32::from_le_bytes(
            t.mem_mut()[wire::NETIO_RET_OFF..wire::NETIO_RET_OFF + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(ret, Solo5Result::Einval as u32);
    }
}
