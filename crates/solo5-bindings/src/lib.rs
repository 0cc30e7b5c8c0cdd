//! Guest bindings (component C7): the in-guest implementation of the
//! `solo5_*` API, built on top of the hypercall ABI (`hypercall-abi`).
//!
//! A real Solo5 guest links this against no host OS at all — the
//! hypercall is the only way out. This workspace has no guest target to
//! compile against, so [`HypercallTransport`] stands in for "issue this
//! hypercall and block for the response": on hvt that would be an I/O-port
//! write, on spt a direct call into the tender's address space (`spec.md`
//! §4.3). Bindings code is written exactly as it would run in-guest; only
//! the transport is swappable, which is also what lets it run under host
//! unit tests.

pub mod muen;

use hypercall_abi::{
    BlockIoRequest, GuestAddr, HaltRequest, NetIoRequest, PollRequest, PutsRequest, Solo5Result,
    WalltimeRequest,
};

/// One `solo5_*` hypercall, synchronous: fill in the request, block until
/// the tender has written the response fields back into the same struct.
pub trait HypercallTransport {
    fn halt(&mut self, req: &mut HaltRequest);
    fn walltime(&mut self, req: &mut WalltimeRequest);
    fn puts(&mut self, req: &mut PutsRequest);
    fn poll(&mut self, req: &mut PollRequest);
    fn blkwrite(&mut self, req: &mut BlockIoRequest);
    fn blkread(&mut self, req: &mut BlockIoRequest);
    fn netwrite(&mut self, req: &mut NetIoRequest);
    fn netread(&mut self, req: &mut NetIoRequest);
}

/// Guest-side error: any `solo5_result_t` other than `Ok`/`Again`, exposed
/// to bindings callers as a proper Rust error rather than a bare integer.
/// `Again` is intentionally not represented here — callers that can
/// retry match on `Solo5Result` directly (see [`Solo5::net_read`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Solo5Error {
    #[error("invalid argument")]
    Einval,
    #[error("unspecified device failure")]
    Eunspec,
}

fn check(ret: Solo5Result) -> Result<(), Solo5Error> {
    match ret {
        Solo5Result::Ok | Solo5Result::Again => Ok(()),
        Solo5Result::Einval => Err(Solo5Error::Einval),
        Solo5Result::Eunspec => Err(Solo5Error::Eunspec),
    }
}

/// The `solo5_*` API surface, generic over its transport. A guest
/// constructs exactly one of these at startup (backed by whatever the
/// platform's real transport is) and calls through it for the rest of its
/// lifetime; `spec.md`'s cooperative, single-VCPU model means there is
/// never more than one in flight.
pub struct Solo5<T> {
    transport: T,
}

impl<T: HypercallTransport> Solo5<T> {
    pub fn new(transport: T) -> Self {
        Solo5 { transport }
    }

    /// `solo5_exit`/`solo5_abort`: never returns in a real guest (the
    /// tender does not resume the VCPU after `HALT`); modeled as returning
    /// `!` would make `Solo5Error`-handling callers awkward to test, so it
    /// returns normally here and callers are expected to stop calling.
    pub fn halt(&mut self, exit_status: i32, cookie: Option<GuestAddr>) {
        let mut req = HaltRequest {
            exit_status,
            cookie: cookie.unwrap_or(GuestAddr::NULL),
        };
        self.transport.halt(&mut req);
    }

    /// `solo5_clock_wall()`: host `CLOCK_REALTIME`, nanoseconds.
    pub fn clock_wall(&mut self) -> u64 {
        let mut req = WalltimeRequest::default();
        self.transport.walltime(&mut req);
        req.nsecs
    }

    /// `solo5_console_write`: writes `data` to the tender's stdout
    /// verbatim. `data`'s address is meaningless host-side in this
    /// workspace (there is no real guest memory backing it here); callers
    /// in tests pass a `GuestAddr` their mock transport interprets however
    /// it likes.
    pub fn puts(&mut self, data: GuestAddr, len: usize) {
        let mut req = PutsRequest { data, len };
        self.transport.puts(&mut req);
    }

    /// `solo5_yield(timeout_nsecs)`: returns the ready-set bitmap.
    pub fn poll(&mut self, timeout_nsecs: u64) -> u64 {
        let mut req = PollRequest {
            timeout_nsecs,
            ready_set: 0,
        };
        self.transport.poll(&mut req);
        req.ready_set
    }

    /// `solo5_block_write(handle, offset, data, len)`.
    pub fn block_write(
        &mut self,
        handle: u64,
        offset: u64,
        data: GuestAddr,
        len: usize,
    ) -> Result<(), Solo5Error> {
        let mut req = BlockIoRequest {
            handle,
            offset,
            data,
            len,
            ret: Solo5Result::Eunspec,
        };
        self.transport.blkwrite(&mut req);
        check(req.ret)
    }

    /// `solo5_block_read(handle, offset, data, len)`.
    pub fn block_read(
        &mut self,
        handle: u64,
        offset: u64,
        data: GuestAddr,
        len: usize,
    ) -> Result<(), Solo5Error> {
        let mut req = BlockIoRequest {
            handle,
            offset,
            data,
            len,
            ret: Solo5Result::Eunspec,
        };
        self.transport.blkread(&mut req);
        check(req.ret)
    }

    /// `solo5_net_write(handle, data, len)`.
    pub fn net_write(&mut self, handle: u64, data: GuestAddr, len: usize) -> Result<(), Solo5Error> {
        let mut req = NetIoRequest {
            handle,
            data,
            len,
            read_size: 0,
            ret: Solo5Result::Eunspec,
        };
        self.transport.netwrite(&mut req);
        check(req.ret)
    }

    /// `solo5_net_read(handle, data, len)`. Returns the number of bytes
    /// received, or `Ok(None)` for `AGAIN` (no frame available) rather than
    /// an error — this mirrors `spec.md` §4.7's "empty fd is not a
    /// failure" framing.
    pub fn net_read(
        &mut self,
        handle: u64,
        data: GuestAddr,
        len: usize,
    ) -> Result<Option<usize>, Solo5Error> {
        let mut req = NetIoRequest {
            handle,
            data,
            len,
            read_size: 0,
            ret: Solo5Result::Eunspec,
        };
        self.transport.netread(&mut req);
        match req.ret {
            Solo5Result::Again => Ok(None),
            Solo5Result::Ok => Ok(Some(req.read_size)),
            other => Err(check(other).unwrap_err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A transport that answers every call the way a correctly-behaving
    /// tender would for a single attached block/net device, used to
    /// exercise the bindings' request/response plumbing without any real
    /// guest memory or hypervisor.
    #[derive(Default)]
    struct MockTransport {
        puts_log: Vec<usize>,
        wall_nsecs: u64,
        net_rx: Vec<u8>,
    }

    impl HypercallTransport for MockTransport {
        fn halt(&mut self, _req: &mut HaltRequest) {}

        fn walltime(&mut self, req: &mut WalltimeRequest) {
            req.nsecs = self.wall_nsecs;
        }

        fn puts(&mut self, req: &mut PutsRequest) {
            self.puts_log.push(req.len);
        }

        fn poll(&mut self, req: &mut PollRequest) {
            req.ready_set = 0;
        }

        fn blkwrite(&mut self, req: &mut BlockIoRequest) {
            req.ret = if req.len == 512 {
                Solo5Result::Ok
            } else {
                Solo5Result::Einval
            };
        }

        fn blkread(&mut self, req: &mut BlockIoRequest) {
            req.ret = Solo5Result::Ok;
        }

        fn netwrite(&mut self, req: &mut NetIoRequest) {
            req.ret = Solo5Result::Ok;
        }

        fn netread(&mut self, req: &mut NetIoRequest) {
            if self.net_rx.is_empty() {
                req.ret = Solo5Result::Again;
            } else {
                req.read_size = self.net_rx.len();
                req.ret = Solo5Result::Ok;
            }
        }
    }

    #[test]
    fn clock_wall_round_trips() {
        let mut s = Solo5::new(MockTransport {
            wall_nsecs: 123_456,
            ..Default::default()
        });
        assert_eq!(s.clock_wall(), 123_456);
    }

    #[test]
    fn block_write_rejects_wrong_length() {
        let mut s = Solo5::new(MockTransport::default());
        let err = s
            .block_write(1, 0, GuestAddr(0x1000), 256)
            .unwrap_err();
        assert_eq!(err, Solo5Error::Einval);
    }

    #[test]
    fn net_read_reports_again_as_none() {
        let mut s = Solo5::new(MockTransport::default());
        assert_eq!(s.net_read(1, GuestAddr(0x2000), 1500).unwrap(), None);
    }

    #[test]
    fn net_read_returns_size_when_data_present() {
        let mut s = Solo5::new(MockTransport {
            net_rx: vec![0u8; 64],
            ..Default::default()
        });
        assert_eq!(s.net_read(1, GuestAddr(0x2000), 1500).unwrap(), Some(64));
    }

    #[test]
    fn puts_is_forwarded_with_length() {
        let mut s = Solo5::new(MockTransport::default());
        s.puts(GuestAddr(0x3000), 11);
        assert_eq!(s.transport.puts_log, vec![11]);
    }
}
