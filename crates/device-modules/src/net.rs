//! `NET_BASIC` device module: `--net:NAME=IFACE`/`--net-mac:NAME=...`
//! attachment and the net hypercall semantics of `spec.md` §4.7.

use std::collections::HashMap;
use std::os::fd::RawFd;

use hypercall_abi::Solo5Result;
use mft::{Manifest, MftParams, MftType};
use privsep::SeccompFilter;
use rand::RngCore;

use crate::{DeviceError, DeviceModule, PollRegistration};

/// Ethernet header size counted against the MTU bound in `net_write`.
const ETHER_HEADER_LEN: usize = 14;

pub struct NetModule {
    /// name -> tap fd, for attached entries.
    attached: HashMap<String, RawFd>,
    /// Pending `--net-mac:NAME=...` overrides seen before the matching
    /// `--net:NAME=...`, or vice versa; cmdline argument order is not
    /// guaranteed.
    mac_overrides: HashMap<String, [u8; 6]>,
}

impl NetModule {
    pub fn new() -> Self {
        NetModule {
            attached: HashMap::new(),
            mac_overrides: HashMap::new(),
        }
    }
}

impl Default for NetModule {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(mac)
}

/// Generates a random locally-administered, unicast MAC address, used when
/// no `--net-mac` override was given.
fn random_local_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] = (mac[0] & 0xfe) | 0x02; // unicast, locally administered
    mac
}

const IFNAMSIZ: usize = 16;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
/// `_IOW('T', 202, int)` from `<linux/if_tun.h>`.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Matches the layout of Linux's `struct ifreq` on x86_64: a 16-byte
/// interface name followed by a union whose largest member (`struct ifmap`)
/// is 24 bytes; only `ifr_flags` (the union's first 2 bytes) is used here.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _union_pad: [u8; 22],
}

/// Opens `/dev/net/tun` and attaches `iface` as a tap device via
/// `TUNSETIFF`, per `examples/original_source/tenders/hvt/hvt_module_net.c`'s
/// `tap_attach(iface)` (the shared `tenders/common/tap_attach.c` this calls
/// into is not part of the retrieval pack, but its ioctl sequence is
/// standard Linux tuntap-clone-device usage).
fn tap_attach_by_name(iface: &str) -> Result<RawFd, DeviceError> {
    if iface.is_empty() || iface.len() >= IFNAMSIZ {
        return Err(DeviceError::BadArgument(format!(
            "interface name {iface:?} must be 1..{IFNAMSIZ} bytes"
        )));
    }

    let path = c"/dev/net/tun";
    // SAFETY: `path` is a valid, NUL-terminated C string; O_RDWR opens the
    // tuntap clone device, which is then specialized to `iface` by the
    // TUNSETIFF ioctl below.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(DeviceError::Io(format!(
            "opening /dev/net/tun: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut ifr = IfReq {
        ifr_name: [0; IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _union_pad: [0; 22],
    };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.bytes()) {
        *dst = src as libc::c_char;
    }

    // SAFETY: `fd` is the tuntap clone device just opened above; `ifr` is a
    // fully initialized, correctly sized `ifreq`.
    let rc = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut ifr as *mut IfReq) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        // SAFETY: `fd` was just opened above and is not used again on this path.
        unsafe { libc::close(fd) };
        return Err(DeviceError::Io(format!("TUNSETIFF for {iface:?}: {err}")));
    }
    Ok(fd)
}

/// Attaches a host tap device for `iface`, or reuses an already-open fd if
/// `iface` is of the form `@N`. Grounded on `spec.md` §6: "`--net` argument
/// `@N` means fd N is already an open tap".
fn tap_attach(iface: &str) -> Result<RawFd, DeviceError> {
    if let Some(rest) = iface.strip_prefix('@') {
        let fd: RawFd = rest
            .parse()
            .map_err(|_| DeviceError::BadArgument(iface.to_string()))?;
        return Ok(fd);
    }
    tap_attach_by_name(iface)
}

impl DeviceModule for NetModule {
    fn name(&self) -> &'static str {
        "net"
    }

    fn usage(&self) -> &'static str {
        "--net:NAME=IFACE | --net-mac:NAME=HH:HH:HH:HH:HH:HH"
    }

    fn handle_cmdarg(
        &mut self,
        manifest: &mut Manifest,
        flag: &str,
        value: &str,
    ) -> Result<bool, DeviceError> {
        match flag {
            "net-mac" => {
                let (name, mac_str) = value
                    .split_once('=')
                    .ok_or_else(|| DeviceError::BadArgument(value.to_string()))?;
                let mac = parse_mac(mac_str)
                    .ok_or_else(|| DeviceError::BadArgument(mac_str.to_string()))?;
                self.mac_overrides.insert(name.to_string(), mac);
                Ok(true)
            }
            "net" => {
                let (name, iface) = value
                    .split_once('=')
                    .ok_or_else(|| DeviceError::BadArgument(value.to_string()))?;
                let entry = manifest
                    .get_by_name_mut(name, Some(MftType::NetBasic))
                    .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;
                if entry.attached {
                    return Err(DeviceError::AlreadyAttached(name.to_string()));
                }
                let fd = tap_attach(iface)?;
                let mac = self
                    .mac_overrides
                    .get(name)
                    .copied()
                    .unwrap_or_else(random_local_mac);
                entry.params = MftParams::NetBasic { mac, mtu: 1500 };
                entry.hostfd = Some(fd);
                entry.attached = true;
                self.attached.insert(name.to_string(), fd);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn setup(
        &mut self,
        _manifest: &Manifest,
        mut seccomp: Option<&mut SeccompFilter>,
    ) -> Result<Vec<PollRegistration>, DeviceError> {
        let mut regs = Vec::new();
        for &fd in self.attached.values() {
            if let Some(filter) = seccomp.as_deref_mut() {
                filter
                    .add_net_rules(fd)
                    .map_err(|e| DeviceError::Seccomp(e.to_string()))?;
            }
            // The handle (manifest index) is filled in by tender-core once
            // it knows each entry's position; report the fd alone here.
            regs.push(PollRegistration { fd, handle: 0 });
        }
        Ok(regs)
    }
}

/// Outcome of `net_write`. A partial write is a protocol violation and is
/// fatal (see `DESIGN.md`'s resolution of the `hypercall_netwrite`
/// consistency Open Question) rather than surfaced to the guest as
/// `EUNSPEC` — it is reported distinctly from `Solo5Result::Einval` so the
/// caller can abort the tender instead of returning a guest-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetWriteOutcome {
    Ok,
    /// `len > mtu + header`: guest-caused, reported as `EINVAL`.
    FrameTooLarge,
    /// The host write did not transfer the full frame: fatal.
    ShortWrite { expected: usize, actual: usize },
}

/// `spec.md` §4.7 `net_write`.
pub fn net_write(fd: RawFd, frame: &[u8], mtu: u16) -> NetWriteOutcome {
    if frame.len() > mtu as usize + ETHER_HEADER_LEN {
        return NetWriteOutcome::FrameTooLarge;
    }
    // SAFETY: `fd` is a valid tap fd owned by the tender for the process
    // lifetime; `frame` is a valid, initialized byte slice.
    let n = unsafe { libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
    if n < 0 || n as usize != frame.len() {
        return NetWriteOutcome::ShortWrite {
            expected: frame.len(),
            actual: n.max(0) as usize,
        };
    }
    NetWriteOutcome::Ok
}

/// `spec.md` §4.7 `net_read`. Returns `(result, bytes_read)`.
pub fn net_read(fd: RawFd, buf: &mut [u8]) -> (Solo5Result, usize) {
    // SAFETY: `fd` is a valid tap fd; `buf` is a valid, writable slice.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return (Solo5Result::Again, 0);
        }
        return (Solo5Result::Eunspec, 0);
    }
    if n == 0 {
        // EOF / tap closed is treated the same as "no data yet".
        return (Solo5Result::Again, 0);
    }
    (Solo5Result::Ok, n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac() {
        assert_eq!(
            parse_mac("02:00:00:00:00:01"),
            Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
        );
        assert_eq!(parse_mac("not-a-mac"), None);
    }

    #[test]
    fn random_mac_is_unicast_and_local() {
        let mac = random_local_mac();
        assert_eq!(mac[0] & 0x01, 0, "must be unicast");
        assert_eq!(mac[0] & 0x02, 0x02, "must be locally administered");
    }

    #[test]
    fn net_write_rejects_oversized_frame() {
        let frame = vec![0u8; 2000];
        assert_eq!(net_write(-1, &frame, 1500), NetWriteOutcome::FrameTooLarge);
    }

    #[test]
    fn net_read_on_closed_pipe_returns_again() {
        // A pipe whose write end is closed immediately reads EOF (0 bytes).
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe { libc::close(fds[1]) };
        let mut buf = [0u8; 16];
        assert_eq!(net_read(fds[0], &mut buf), (Solo5Result::Again, 0));
        unsafe { libc::close(fds[0]) };
    }
}
