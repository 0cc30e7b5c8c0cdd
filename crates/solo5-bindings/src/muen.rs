//! Guest-side consumption of a Muen SHMSTREAM20 channel, used by the
//! non-hardware-virtualized Muen backend for console and net I/O instead of
//! a hypercall round-trip: the guest reads directly out of shared memory.
//!
//! Grounded on `original_source/bindings/muen/reader.h`'s
//! `muen_channel_{init_reader,read,drain,has_pending_data}` quartet, here
//! expressed as thin methods over `muen_shmstream::Reader` rather than a
//! free-function API taking an out-pointer.

use muen_shmstream::{Channel, Reader, ReadStatus};

/// One attached Muen channel from the guest's point of view: the shared
/// buffer plus this subject's reader cursor.
pub struct MuenChannel {
    reader: Reader,
}

impl MuenChannel {
    pub fn new(protocol: u64) -> Self {
        MuenChannel {
            reader: Reader::new(protocol),
        }
    }

    /// Reads the next available element. `EpochChanged` (first read after
    /// the writer (re)activates) and `NoData` are both routine, non-error
    /// outcomes a guest polling loop expects to see regularly.
    pub fn read(&mut self, chan: &Channel<'_>, buf: &mut [u8]) -> ReadStatus {
        self.reader.read_element(chan, buf)
    }

    pub fn drain(&mut self, chan: &Channel<'_>) {
        self.reader.drain(chan)
    }

    pub fn has_pending_data(&mut self, chan: &Channel<'_>) -> bool {
        self.reader.has_pending_data(chan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muen_shmstream::Writer;

    #[test]
    fn reads_one_console_line_through_the_ring() {
        let mut buf = vec![0u8; 7 * 8 + 4 * 16];
        let mut writer = Writer::init(&mut buf, 0xC0FFEE, 16, 4, 1);
        let mut line = [0u8; 16];
        line[..5].copy_from_slice(b"hello");
        writer.write_element(&line);

        let chan = Channel::new(&mut buf);
        let mut muen_chan = MuenChannel::new(0xC0FFEE);
        let mut out = [0u8; 16];
        assert_eq!(muen_chan.read(&chan, &mut out), ReadStatus::EpochChanged);
        assert_eq!(muen_chan.read(&chan, &mut out), ReadStatus::Success);
        assert_eq!(&out[..5], b"hello");
    }
}
