//! `BLOCK_BASIC` device module: `--block:NAME=PATH` attachment and the
//! block hypercall semantics of `spec.md` §4.6.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use hypercall_abi::Solo5Result;
use mft::{Manifest, MftParams, MftType};
use privsep::SeccompFilter;

use crate::{DeviceError, DeviceModule, PollRegistration};

/// Fixed sector size; `spec.md` §3/§4.6 make this a hard constant, never
/// negotiated with the guest.
pub const BLOCK_SIZE: u64 = 512;

pub struct BlockModule {
    /// name -> open file, keyed by manifest entry name.
    attached: HashMap<String, File>,
}

impl BlockModule {
    pub fn new() -> Self {
        BlockModule {
            attached: HashMap::new(),
        }
    }
}

impl Default for BlockModule {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceModule for BlockModule {
    fn name(&self) -> &'static str {
        "block"
    }

    fn usage(&self) -> &'static str {
        "--block:NAME=PATH"
    }

    fn handle_cmdarg(
        &mut self,
        manifest: &mut Manifest,
        flag: &str,
        value: &str,
    ) -> Result<bool, DeviceError> {
        if flag != "block" {
            return Ok(false);
        }
        let (name, path) = value
            .split_once('=')
            .ok_or_else(|| DeviceError::BadArgument(value.to_string()))?;

        let entry = manifest
            .get_by_name_mut(name, Some(MftType::BlockBasic))
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;
        if entry.attached {
            return Err(DeviceError::AlreadyAttached(name.to_string()));
        }

        let path = PathBuf::from(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DeviceError::Io(format!("opening block backing file {path:?}: {e}")))?;
        let capacity = file
            .metadata()
            .map_err(|e| DeviceError::Io(format!("stat {path:?}: {e}")))?
            .len();

        entry.params = MftParams::BlockBasic {
            capacity,
            block_size: BLOCK_SIZE as u16,
        };
        entry.hostfd = Some(file.as_raw_fd());
        entry.attached = true;

        self.attached.insert(name.to_string(), file);
        Ok(true)
    }

    fn setup(
        &mut self,
        manifest: &Manifest,
        mut seccomp: Option<&mut SeccompFilter>,
    ) -> Result<Vec<PollRegistration>, DeviceError> {
        for (name, file) in &self.attached {
            let entry = manifest
                .get_by_name(name, Some(MftType::BlockBasic))
                .expect("attached entry vanished from manifest");
            let MftParams::BlockBasic { capacity, .. } = entry.params else {
                unreachable!("block module entry with non-block params")
            };
            if let Some(filter) = seccomp.as_deref_mut() {
                filter
                    .add_block_rules(file.as_raw_fd(), BLOCK_SIZE, capacity)
                    .map_err(|e| DeviceError::Seccomp(e.to_string()))?;
            }
        }
        // Block I/O is synchronous; nothing to register with the poll/wait
        // scheduler.
        Ok(Vec::new())
    }
}

/// One block I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
}

/// Implements `spec.md` §4.6 precondition checks and the single
/// `pread`/`pwrite` call. `buf` is always exactly `BLOCK_SIZE` bytes on a
/// precondition pass; short I/O against the backing file is never retried.
pub fn block_io(fd: RawFd, capacity: u64, op: BlockOp, offset: u64, buf: &mut [u8]) -> Solo5Result {
    if offset >= capacity || offset.saturating_add(buf.len() as u64) > capacity {
        return Solo5Result::Einval;
    }
    if offset % BLOCK_SIZE != 0 || buf.len() as u64 != BLOCK_SIZE {
        return Solo5Result::Einval;
    }

    // SAFETY: `fd` is an open, valid file descriptor owned by `BlockModule`
    // for the lifetime of the tender; it is not closed out from under us.
    let file = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    let result = match op {
        BlockOp::Read => file.read_at(buf, offset),
        BlockOp::Write => file.write_at(buf, offset),
    };
    match result {
        Ok(n) if n as u64 == BLOCK_SIZE => Solo5Result::Ok,
        _ => Solo5Result::Eunspec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_disk(size: usize) -> (tempfile::NamedTempFile, RawFd) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        f.flush().unwrap();
        let fd = f.as_raw_fd();
        (f, fd)
    }

    #[test]
    fn read_write_round_trip() {
        let (_f, fd) = temp_disk(4096);
        let mut write_buf = [0xABu8; BLOCK_SIZE as usize];
        assert_eq!(
            block_io(fd, 4096, BlockOp::Write, 512, &mut write_buf),
            Solo5Result::Ok
        );
        let mut read_buf = [0u8; BLOCK_SIZE as usize];
        assert_eq!(
            block_io(fd, 4096, BlockOp::Read, 512, &mut read_buf),
            Solo5Result::Ok
        );
        assert_eq!(read_buf, write_buf);
    }

    #[test]
    fn rejects_offset_at_capacity() {
        let (_f, fd) = temp_disk(4096);
        let mut buf = [0u8; BLOCK_SIZE as usize];
        assert_eq!(
            block_io(fd, 4096, BlockOp::Write, 4096, &mut buf),
            Solo5Result::Einval
        );
    }

    #[test]
    fn rejects_misaligned_offset() {
        let (_f, fd) = temp_disk(4096);
        let mut buf = [0u8; BLOCK_SIZE as usize];
        assert_eq!(
            block_io(fd, 4096, BlockOp::Write, 100, &mut buf),
            Solo5Result::Einval
        );
    }

    #[test]
    fn rejects_wrong_length() {
        let (_f, fd) = temp_disk(4096);
        let mut buf = [0u8; 256];
        assert_eq!(
            block_io(fd, 4096, BlockOp::Write, 0, &mut buf),
            Solo5Result::Einval
        );
    }
}
