//! The hypercall ABI: fixed integer IDs, packed request/response structs,
//! and the `GuestAddr`/`CHECKED_GPA_P` guest-memory validation primitive
//! shared by both the tender (host) and the guest bindings.
//!
//! This crate carries no transport code (I/O-port vs. MMIO vs. direct call
//! is a tender-core concern); it only defines the wire contract both sides
//! agree on.

use std::panic::Location;

/// Maximum number of bytes the tender will read from a guest-supplied
/// `halt` cookie pointer.
pub const HALT_COOKIE_MAX: usize = 512;

/// Fixed, versioned hypercall IDs. Order is part of the ABI; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum HypercallId {
    Halt = 1,
    Walltime = 2,
    Puts = 3,
    Poll = 4,
    Blkwrite = 5,
    Blkread = 6,
    Netwrite = 7,
    Netread = 8,
}

impl HypercallId {
    pub const COUNT: usize = 8;

    /// Index into a dense `[Option<T>; HypercallId::COUNT]` dispatch table.
    pub fn slot(self) -> usize {
        (self as u32 - 1) as usize
    }

    pub const ALL: [HypercallId; Self::COUNT] = [
        HypercallId::Halt,
        HypercallId::Walltime,
        HypercallId::Puts,
        HypercallId::Poll,
        HypercallId::Blkwrite,
        HypercallId::Blkread,
        HypercallId::Netwrite,
        HypercallId::Netread,
    ];
}

/// The guest-reachable result taxonomy (`spec.md` §7). Crosses the ABI as a
/// plain `u32` value written into a response struct — never a Rust `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Solo5Result {
    Ok = 0,
    Again = 1,
    Einval = 2,
    Eunspec = 3,
}

/// A guest physical address: an offset into the tender's guest memory
/// region. 32-bit on x86 hvt, but stored widened to `u64` here so the same
/// type serves spt's host-virtual-pointer-sized addresses too (§9 design
/// note: "model this with a `GuestAddr` newtype").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub const NULL: GuestAddr = GuestAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Failure of a `CHECKED_GPA_P`-equivalent bounds check. Always fatal to
/// the tender — `spec.md` §8 invariant 1 requires this be the *only*
/// observable outcome of an out-of-bounds guest access.
#[derive(Debug, thiserror::Error)]
#[error("invalid guest access: gpa=0x{gpa:x}, sz={sz} ({location})")]
pub struct GpaError {
    pub gpa: u64,
    pub sz: usize,
    pub location: &'static Location<'static>,
}

/// The tender's view of guest memory, with bounds-checked access.
///
/// Every hypercall handler must go through `checked_slice`/`checked_slice_mut`
/// for any guest pointer it dereferences, rather than indexing the backing
/// buffer directly — this is the sole gate implementing §8 invariant 1.
pub struct GuestMemory<'a> {
    mem: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(mem: &'a mut [u8]) -> Self {
        GuestMemory { mem }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// `CHECKED_GPA_P(hvt, gpa, sz)`: validates `gpa + sz <= mem_size` with
    /// overflow-safe arithmetic and returns a read-only slice, or a
    /// `GpaError` carrying the caller's source location.
    #[track_caller]
    pub fn checked_slice(&self, gpa: GuestAddr, sz: usize) -> Result<&[u8], GpaError> {
        let end = self.bounds_check(gpa, sz)?;
        Ok(&self.mem[gpa.0 as usize..end])
    }

    #[track_caller]
    pub fn checked_slice_mut(&mut self, gpa: GuestAddr, sz: usize) -> Result<&mut [u8], GpaError> {
        let end = self.bounds_check(gpa, sz)?;
        Ok(&mut self.mem[gpa.0 as usize..end])
    }

    #[track_caller]
    fn bounds_check(&self, gpa: GuestAddr, sz: usize) -> Result<usize, GpaError> {
        let mem_size = self.mem.len() as u64;
        let end = gpa.0.checked_add(sz as u64);
        match end {
            Some(end) if gpa.0 < mem_size && end <= mem_size => Ok(end as usize),
            _ => Err(GpaError {
                gpa: gpa.0,
                sz,
                location: Location::caller(),
            }),
        }
    }
}

/// `HALT` hypercall request/response block.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HaltRequest {
    pub exit_status: i32,
    /// Guest pointer to an optional trap-register snapshot; `GuestAddr::NULL`
    /// if absent. The tender reads at most `HALT_COOKIE_MAX` bytes from it.
    pub cookie: GuestAddr,
}

/// `WALLTIME` response block: host `CLOCK_REALTIME` in nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct WalltimeRequest {
    pub nsecs: u64,
}

/// `PUTS` request block.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PutsRequest {
    pub data: GuestAddr,
    pub len: usize,
}

/// `POLL` request/response block.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PollRequest {
    pub timeout_nsecs: u64,
    /// Out: bitmap over solo5 handles (manifest index) that are ready.
    pub ready_set: u64,
}

/// `BLKWRITE`/`BLKREAD` request/response block.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BlockIoRequest {
    pub handle: u64,
    pub offset: u64,
    pub data: GuestAddr,
    pub len: usize,
    pub ret: Solo5Result,
}

/// `NETWRITE`/`NETREAD` request/response block.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NetIoRequest {
    pub handle: u64,
    pub data: GuestAddr,
    pub len: usize,
    /// Out (netread only): number of bytes actually received.
    pub read_size: usize,
    pub ret: Solo5Result,
}
